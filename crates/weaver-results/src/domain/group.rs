//! Group metadata: the join point shared by sibling tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{GroupUuid, TaskUuid};

/// Metadata of one group, keyed by `group_uuid`.
///
/// - `task_uuids` is fixed at creation; its order is the membership order.
/// - `chord_triggered` only ever goes false -> true.
/// - `lock` is an advisory flag for adapters without a real mutex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMeta {
    pub group_uuid: GroupUuid,
    pub task_uuids: Vec<TaskUuid>,

    #[serde(default)]
    pub chord_triggered: bool,

    #[serde(default)]
    pub lock: bool,

    pub created_at: DateTime<Utc>,
}

impl GroupMeta {
    pub fn new(group_uuid: GroupUuid, task_uuids: Vec<TaskUuid>) -> Self {
        Self {
            group_uuid,
            task_uuids,
            chord_triggered: false,
            lock: false,
            created_at: Utc::now(),
        }
    }
}
