//! Backend port - result backend の共通契約
//!
//! すべてのストレージ実装（memory, null, cache, redis, mongo）がこの trait を実装し、
//! 外から見える振る舞いを揃えます。実装は設定時に選び、`Arc<dyn Backend>` で共有します。
//!
//! # 設計原則
//! - 状態の書き込みは上書き（last writer wins）。`created_at` / `task_name` は前の値を引き継ぐ
//! - NotFound は必ずエラーとして返す（purge も含む）
//! - chord trigger の `true` は 1 グループにつき高々 1 回

use async_trait::async_trait;

use crate::domain::{
    BackendResult, GroupUuid, Signature, TaskResult, TaskState, TaskUuid,
};

/// Result backend contract.
///
/// The six `set_state_*` setters are provided on top of [`Backend::update_state`];
/// adapters implement the storage-facing operations only.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Store the group's meta data. Re-initialising replaces the membership.
    async fn init_group(&self, group_uuid: &GroupUuid, task_uuids: &[TaskUuid]) -> BackendResult<()>;

    /// True iff exactly `group_task_count` members are SUCCESS or FAILURE.
    ///
    /// Members without a stored state count as not completed.
    async fn group_completed(
        &self,
        group_uuid: &GroupUuid,
        group_task_count: usize,
    ) -> BackendResult<bool>;

    /// Every member's state, in membership order.
    async fn group_task_states(
        &self,
        group_uuid: &GroupUuid,
        group_task_count: usize,
    ) -> BackendResult<Vec<TaskState>>;

    /// Flag the group's chord as triggered.
    ///
    /// Returns `true` to exactly one caller per group; that caller alone runs
    /// the chord callback. Everyone else gets `false`.
    async fn trigger_chord(&self, group_uuid: &GroupUuid) -> BackendResult<bool>;

    /// Persist `state`, carrying over `created_at` / `task_name` from any
    /// state already stored for the same task.
    async fn update_state(&self, state: TaskState) -> BackendResult<()>;

    async fn get_state(&self, task_uuid: &TaskUuid) -> BackendResult<TaskState>;

    async fn purge_state(&self, task_uuid: &TaskUuid) -> BackendResult<()>;

    async fn purge_group_meta(&self, group_uuid: &GroupUuid) -> BackendResult<()>;

    async fn set_state_pending(&self, signature: &Signature) -> BackendResult<()> {
        self.update_state(TaskState::pending(signature)).await
    }

    async fn set_state_received(&self, signature: &Signature) -> BackendResult<()> {
        self.update_state(TaskState::received(signature)).await
    }

    async fn set_state_started(&self, signature: &Signature) -> BackendResult<()> {
        self.update_state(TaskState::started(signature)).await
    }

    async fn set_state_retry(&self, signature: &Signature) -> BackendResult<()> {
        self.update_state(TaskState::retry(signature)).await
    }

    async fn set_state_success(
        &self,
        signature: &Signature,
        results: Vec<TaskResult>,
    ) -> BackendResult<()> {
        self.update_state(TaskState::success(signature, results)).await
    }

    async fn set_state_failure(&self, signature: &Signature, error: &str) -> BackendResult<()> {
        self.update_state(TaskState::failure(signature, error)).await
    }
}
