//! Signature - ブローカーから渡されるタスクの識別情報
//!
//! この層が読むのは `uuid` と `name`、グループ / chord 関連のフィールドだけです。
//! それ以外（routing_key, eta, retry 系）は素通しする不透明なメタデータです。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{GroupUuid, TaskUuid};

/// Task identity plus metadata, as built by the enqueueing side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub uuid: TaskUuid,
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_uuid: Option<GroupUuid>,

    #[serde(default)]
    pub group_task_count: usize,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub retry_timeout: u32,

    /// Immutable callbacks do not receive the group's results as arguments.
    #[serde(default)]
    pub immutable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chord_callback: Option<Box<Signature>>,
}

impl Signature {
    /// New signature with a generated task identifier.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_uuid(TaskUuid::generate(), name)
    }

    pub fn with_uuid(uuid: TaskUuid, name: impl Into<String>) -> Self {
        Self {
            uuid,
            name: name.into(),
            routing_key: None,
            eta: None,
            group_uuid: None,
            group_task_count: 0,
            retry_count: 0,
            retry_timeout: 0,
            immutable: false,
            chord_callback: None,
        }
    }

    pub fn with_group(mut self, group_uuid: GroupUuid, group_task_count: usize) -> Self {
        self.group_uuid = Some(group_uuid);
        self.group_task_count = group_task_count;
        self
    }

    pub fn with_chord_callback(mut self, callback: Signature) -> Self {
        self.chord_callback = Some(Box::new(callback));
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_attaches_group_and_callback() {
        let group = GroupUuid::generate();
        let sig = Signature::new("resize")
            .with_group(group.clone(), 3)
            .with_chord_callback(Signature::new("collect"))
            .with_routing_key("images");

        assert_eq!(sig.group_uuid, Some(group));
        assert_eq!(sig.group_task_count, 3);
        assert_eq!(sig.chord_callback.as_ref().unwrap().name, "collect");
        assert_eq!(sig.routing_key.as_deref(), Some("images"));
    }

    #[test]
    fn minimal_wire_form_decodes() {
        let sig: Signature = serde_json::from_str(r#"{"uuid":"1","name":""}"#).unwrap();
        assert_eq!(sig.uuid.as_str(), "1");
        assert!(sig.group_uuid.is_none());
        assert!(!sig.immutable);
    }
}
