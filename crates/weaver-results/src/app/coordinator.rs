//! ChordCoordinator - グループ完了の判定と chord callback の発火
//!
//! # フロー（タスク完了のたびにワーカーが呼ぶ）
//! 1. グループに属していない / callback が無い → NotGrouped
//! 2. group_completed が false → Pending
//! 3. trigger_chord が false → AlreadyTriggered（他のワーカーが勝った）
//! 4. 勝った 1 人だけが全メンバーの状態を読み、callback を発行する → Fire

use std::sync::Arc;

use tracing::{debug, info};

use crate::domain::{BackendResult, GroupUuid, Signature, TaskResult, TaskState};
use crate::ports::Backend;

/// What the caller should do after one group member completed.
#[derive(Debug, Clone, PartialEq)]
pub enum ChordDecision {
    /// The task has no group or the group has no chord callback.
    NotGrouped,

    /// Some members are still running.
    Pending,

    /// Another caller already fired the callback.
    AlreadyTriggered,

    /// This caller won the trigger and must send `callback`.
    Fire {
        callback: Signature,
        states: Vec<TaskState>,
    },
}

impl ChordDecision {
    pub fn is_fire(&self) -> bool {
        matches!(self, ChordDecision::Fire { .. })
    }

    /// Arguments for the callback: the results of every successful member in
    /// membership order, or nothing for an immutable callback.
    pub fn callback_args(&self) -> Vec<TaskResult> {
        match self {
            ChordDecision::Fire { callback, states } if !callback.immutable => states
                .iter()
                .filter(|state| state.is_success())
                .flat_map(|state| state.results.iter().cloned())
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Drives the group / chord protocol on top of any [`Backend`].
#[derive(Clone)]
pub struct ChordCoordinator {
    backend: Arc<dyn Backend>,
}

impl ChordCoordinator {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Store the group meta and mark every member PENDING.
    #[tracing::instrument(skip_all, fields(%group_uuid, members = signatures.len()))]
    pub async fn register_group(
        &self,
        group_uuid: &GroupUuid,
        signatures: &[Signature],
    ) -> BackendResult<()> {
        let task_uuids: Vec<_> = signatures.iter().map(|sig| sig.uuid.clone()).collect();
        self.backend.init_group(group_uuid, &task_uuids).await?;
        for signature in signatures {
            self.backend.set_state_pending(signature).await?;
        }
        Ok(())
    }

    /// Called after `signature` reached SUCCESS or FAILURE.
    #[tracing::instrument(skip_all, fields(task_uuid = %signature.uuid))]
    pub async fn on_task_completed(&self, signature: &Signature) -> BackendResult<ChordDecision> {
        let (Some(group_uuid), Some(callback)) = (&signature.group_uuid, &signature.chord_callback)
        else {
            return Ok(ChordDecision::NotGrouped);
        };
        let count = signature.group_task_count;

        if !self.backend.group_completed(group_uuid, count).await? {
            debug!(%group_uuid, "group still running");
            return Ok(ChordDecision::Pending);
        }
        if !self.backend.trigger_chord(group_uuid).await? {
            debug!(%group_uuid, "chord already triggered");
            return Ok(ChordDecision::AlreadyTriggered);
        }

        let states = self.backend.group_task_states(group_uuid, count).await?;
        info!(%group_uuid, callback = %callback.name, "firing chord callback");
        Ok(ChordDecision::Fire {
            callback: (**callback).clone(),
            states,
        })
    }
}
