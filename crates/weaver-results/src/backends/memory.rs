//! In-memory backend ("eager").
//!
//! 単一プロセス用。グループとタスク状態を 1 つの Mutex の中に持ち、
//! chord trigger もそのロックの中で判定するので、プロセス内では厳密に 1 回だけ true を返します。
//! 有効期限はありません。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::common::{completed_count, decode, encode, require_all};
use crate::domain::{BackendError, BackendResult, GroupMeta, GroupUuid, TaskState, TaskUuid};
use crate::ports::Backend;

/// In-memory backend state.
#[derive(Default)]
struct InMemoryState {
    groups: HashMap<GroupUuid, GroupMeta>,

    /// Encoded task states, so reads go through the same decode path as
    /// the storage-backed adapters.
    tasks: HashMap<TaskUuid, Vec<u8>>,
}

impl InMemoryState {
    fn load_state(&self, task_uuid: &TaskUuid) -> BackendResult<Option<TaskState>> {
        self.tasks
            .get(task_uuid)
            .map(|bytes| decode(bytes))
            .transpose()
    }

    fn member_states(&self, group_uuid: &GroupUuid) -> BackendResult<(Vec<TaskUuid>, Vec<Option<TaskState>>)> {
        let meta = self
            .groups
            .get(group_uuid)
            .ok_or_else(|| BackendError::GroupNotFound(group_uuid.clone()))?;

        let states = meta
            .task_uuids
            .iter()
            .map(|task_uuid| self.load_state(task_uuid))
            .collect::<BackendResult<Vec<_>>>()?;
        Ok((meta.task_uuids.clone(), states))
    }
}

/// In-memory backend implementation.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn init_group(&self, group_uuid: &GroupUuid, task_uuids: &[TaskUuid]) -> BackendResult<()> {
        let meta = GroupMeta::new(group_uuid.clone(), task_uuids.to_vec());
        let mut state = self.state.lock().await;
        state.groups.insert(group_uuid.clone(), meta);
        debug!(%group_uuid, members = task_uuids.len(), "group initialised");
        Ok(())
    }

    async fn group_completed(
        &self,
        group_uuid: &GroupUuid,
        group_task_count: usize,
    ) -> BackendResult<bool> {
        let state = self.state.lock().await;
        let (_, states) = state.member_states(group_uuid)?;
        Ok(completed_count(&states) == group_task_count)
    }

    async fn group_task_states(
        &self,
        group_uuid: &GroupUuid,
        _group_task_count: usize,
    ) -> BackendResult<Vec<TaskState>> {
        let state = self.state.lock().await;
        let (task_uuids, states) = state.member_states(group_uuid)?;
        require_all(&task_uuids, states)
    }

    #[tracing::instrument(skip(self), fields(backend = "memory"))]
    async fn trigger_chord(&self, group_uuid: &GroupUuid) -> BackendResult<bool> {
        let mut state = self.state.lock().await;
        let meta = state
            .groups
            .get_mut(group_uuid)
            .ok_or_else(|| BackendError::GroupNotFound(group_uuid.clone()))?;

        if meta.chord_triggered {
            return Ok(false);
        }
        meta.chord_triggered = true;
        info!("chord trigger won");
        Ok(true)
    }

    async fn update_state(&self, mut task_state: TaskState) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        if let Some(prior) = state.load_state(&task_state.task_uuid)? {
            task_state.merge_prior(&prior);
        }

        let encoded = encode(&task_state)?;
        debug!(task_uuid = %task_state.task_uuid, state = %task_state.state, "task state stored");
        state.tasks.insert(task_state.task_uuid, encoded);
        Ok(())
    }

    async fn get_state(&self, task_uuid: &TaskUuid) -> BackendResult<TaskState> {
        let state = self.state.lock().await;
        state
            .load_state(task_uuid)?
            .ok_or_else(|| BackendError::TaskNotFound(task_uuid.clone()))
    }

    async fn purge_state(&self, task_uuid: &TaskUuid) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        state
            .tasks
            .remove(task_uuid)
            .map(|_| ())
            .ok_or_else(|| BackendError::TaskNotFound(task_uuid.clone()))
    }

    async fn purge_group_meta(&self, group_uuid: &GroupUuid) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        state
            .groups
            .remove(group_uuid)
            .map(|_| ())
            .ok_or_else(|| BackendError::GroupNotFound(group_uuid.clone()))
    }
}
