//! NullBackend - 何も保存しない backend（テスト用）
//!
//! グループの存在だけを覚えておき、それ以外の書き込みは捨てます。
//! chord trigger は常に許可されるので、排他の保証はありません。

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{BackendError, BackendResult, GroupUuid, TaskState, TaskUuid};
use crate::ports::Backend;

/// NullBackend は状態を保存しない backend
///
/// # 振る舞い
/// - init_group: グループ ID だけ記録
/// - group_completed: 既知のグループなら常に true
/// - group_task_states: 常に空
/// - trigger_chord: 常に true（グループが未知でも）
/// - setter: 何もしない
/// - get_state / purge_state: 常に TaskNotFound
#[derive(Default)]
pub struct NullBackend {
    groups: Mutex<HashSet<GroupUuid>>,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }

    async fn ensure_group(&self, group_uuid: &GroupUuid) -> BackendResult<()> {
        if self.groups.lock().await.contains(group_uuid) {
            Ok(())
        } else {
            Err(BackendError::GroupNotFound(group_uuid.clone()))
        }
    }
}

#[async_trait]
impl Backend for NullBackend {
    async fn init_group(&self, group_uuid: &GroupUuid, _task_uuids: &[TaskUuid]) -> BackendResult<()> {
        self.groups.lock().await.insert(group_uuid.clone());
        Ok(())
    }

    async fn group_completed(&self, group_uuid: &GroupUuid, _group_task_count: usize) -> BackendResult<bool> {
        self.ensure_group(group_uuid).await?;
        Ok(true)
    }

    async fn group_task_states(
        &self,
        group_uuid: &GroupUuid,
        _group_task_count: usize,
    ) -> BackendResult<Vec<TaskState>> {
        self.ensure_group(group_uuid).await?;
        Ok(Vec::new())
    }

    #[tracing::instrument(skip(self), fields(backend = "null"))]
    async fn trigger_chord(&self, _group_uuid: &GroupUuid) -> BackendResult<bool> {
        Ok(true)
    }

    async fn update_state(&self, state: TaskState) -> BackendResult<()> {
        debug!(task_uuid = %state.task_uuid, state = %state.state, "state discarded");
        Ok(())
    }

    async fn get_state(&self, task_uuid: &TaskUuid) -> BackendResult<TaskState> {
        Err(BackendError::TaskNotFound(task_uuid.clone()))
    }

    async fn purge_state(&self, task_uuid: &TaskUuid) -> BackendResult<()> {
        Err(BackendError::TaskNotFound(task_uuid.clone()))
    }

    async fn purge_group_meta(&self, group_uuid: &GroupUuid) -> BackendResult<()> {
        if self.groups.lock().await.remove(group_uuid) {
            Ok(())
        } else {
            Err(BackendError::GroupNotFound(group_uuid.clone()))
        }
    }
}
