//! MongoBackend - MongoDB 上の backend
//!
//! # コレクション
//! - `task_states`: 1 タスク 1 ドキュメント（`_id` = task_uuid）
//! - `group_metas`: 1 グループ 1 ドキュメント（`_id` = group_uuid）
//!
//! どちらも `expires_at` に TTL インデックスを張ります。TTL モニタが消すまでの間も
//! 期限切れのドキュメントが見えないよう、読み込みは `expires_at > now` で絞ります。
//!
//! chord trigger は `find_one_and_update` 1 回（ドキュメント単位で atomic）です。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bson::{DateTime, Document, doc};
use futures::TryStreamExt;
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

use super::common::{completed_count, decode, encode_text, require_all};
use crate::domain::{BackendError, BackendResult, GroupMeta, GroupUuid, TaskState, TaskUuid};
use crate::ports::Backend;

const BACKEND: &str = "mongo";
const TASK_STATES: &str = "task_states";
const GROUP_METAS: &str = "group_metas";

fn storage(err: mongodb::error::Error) -> BackendError {
    BackendError::storage(BACKEND, err)
}

/// Stored task state. The state itself is kept as JSON text so numbers
/// keep their precision.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskDocument {
    #[serde(rename = "_id")]
    id: String,
    task_name: String,
    state: String,
    payload: String,
    expires_at: DateTime,
}

impl TaskDocument {
    fn new(state: &TaskState, expires_at: DateTime) -> BackendResult<Self> {
        let payload = encode_text(state)?;
        Ok(Self {
            id: state.task_uuid.to_string(),
            task_name: state.task_name.clone(),
            state: state.state.to_string(),
            payload,
            expires_at,
        })
    }

    fn decode(&self) -> BackendResult<TaskState> {
        decode(self.payload.as_bytes())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GroupDocument {
    #[serde(rename = "_id")]
    id: String,
    task_uuids: Vec<String>,
    chord_triggered: bool,
    lock: bool,
    created_at: DateTime,
    expires_at: DateTime,
}

impl GroupDocument {
    fn new(meta: &GroupMeta, expires_at: DateTime) -> Self {
        Self {
            id: meta.group_uuid.to_string(),
            task_uuids: meta.task_uuids.iter().map(ToString::to_string).collect(),
            chord_triggered: meta.chord_triggered,
            lock: meta.lock,
            created_at: DateTime::from_millis(meta.created_at.timestamp_millis()),
            expires_at,
        }
    }

    fn into_meta(self) -> GroupMeta {
        GroupMeta {
            group_uuid: GroupUuid::new(self.id),
            task_uuids: self.task_uuids.into_iter().map(TaskUuid::new).collect(),
            chord_triggered: self.chord_triggered,
            lock: self.lock,
            created_at: chrono::DateTime::from_timestamp_millis(self.created_at.timestamp_millis())
                .unwrap_or_default(),
        }
    }
}

fn live(id: &str) -> Document {
    doc! { "_id": id, "expires_at": { "$gt": DateTime::now() } }
}

/// Backend over a MongoDB database.
pub struct MongoBackend {
    uri: String,
    database_name: String,
    database: OnceCell<Database>,
    expiration: Duration,
}

impl MongoBackend {
    /// The client is created, and the TTL indexes ensured, on first use.
    pub fn new(uri: impl Into<String>, database: impl Into<String>, expiration: Duration) -> Self {
        Self {
            uri: uri.into(),
            database_name: database.into(),
            database: OnceCell::new(),
            expiration,
        }
    }

    async fn database(&self) -> BackendResult<&Database> {
        self.database
            .get_or_try_init(|| async {
                let client = Client::with_uri_str(&self.uri).await.map_err(storage)?;
                let database = client.database(&self.database_name);
                for name in [TASK_STATES, GROUP_METAS] {
                    ensure_ttl_index(&database.collection::<Document>(name)).await?;
                }
                debug!(database = %self.database_name, "mongo client ready");
                Ok::<_, BackendError>(database)
            })
            .await
    }

    async fn tasks(&self) -> BackendResult<Collection<TaskDocument>> {
        Ok(self.database().await?.collection(TASK_STATES))
    }

    async fn groups(&self) -> BackendResult<Collection<GroupDocument>> {
        Ok(self.database().await?.collection(GROUP_METAS))
    }

    fn expires_at(&self) -> DateTime {
        let ttl_ms = i64::try_from(self.expiration.as_millis()).unwrap_or(i64::MAX);
        DateTime::from_millis(DateTime::now().timestamp_millis().saturating_add(ttl_ms))
    }

    async fn load_group(&self, group_uuid: &GroupUuid) -> BackendResult<GroupMeta> {
        self.groups()
            .await?
            .find_one(live(group_uuid.as_str()))
            .await
            .map_err(storage)?
            .map(GroupDocument::into_meta)
            .ok_or_else(|| BackendError::GroupNotFound(group_uuid.clone()))
    }

    async fn load_state(&self, task_uuid: &TaskUuid) -> BackendResult<Option<TaskState>> {
        let found = self
            .tasks()
            .await?
            .find_one(live(task_uuid.as_str()))
            .await
            .map_err(storage)?;
        found.map(|document| document.decode()).transpose()
    }

    /// One `$in` query, re-ordered to membership order.
    async fn member_states(&self, meta: &GroupMeta) -> BackendResult<Vec<Option<TaskState>>> {
        if meta.task_uuids.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&str> = meta.task_uuids.iter().map(|id| id.as_str()).collect();
        let filter = doc! {
            "_id": { "$in": ids },
            "expires_at": { "$gt": DateTime::now() },
        };
        let documents: Vec<TaskDocument> = self
            .tasks()
            .await?
            .find(filter)
            .await
            .map_err(storage)?
            .try_collect()
            .await
            .map_err(storage)?;

        let mut by_id: HashMap<String, TaskDocument> = documents
            .into_iter()
            .map(|document| (document.id.clone(), document))
            .collect();

        meta.task_uuids
            .iter()
            .map(|task_uuid| {
                by_id
                    .remove(task_uuid.as_str())
                    .map(|document| document.decode())
                    .transpose()
            })
            .collect::<BackendResult<Vec<_>>>()
            .inspect_err(|err| {
                error!(group_uuid = %meta.group_uuid, %err, "group member decode failed");
            })
    }
}

async fn ensure_ttl_index(collection: &Collection<Document>) -> BackendResult<()> {
    let mut options = IndexOptions::default();
    options.name = Some("expires_at_ttl".to_string());
    options.expire_after = Some(Duration::ZERO);

    let index = IndexModel::builder()
        .keys(doc! { "expires_at": 1 })
        .options(options)
        .build();
    collection.create_index(index).await.map_err(storage)?;
    Ok(())
}

#[async_trait]
impl Backend for MongoBackend {
    async fn init_group(&self, group_uuid: &GroupUuid, task_uuids: &[TaskUuid]) -> BackendResult<()> {
        let meta = GroupMeta::new(group_uuid.clone(), task_uuids.to_vec());
        let document = GroupDocument::new(&meta, self.expires_at());
        self.groups()
            .await?
            .replace_one(doc! { "_id": group_uuid.as_str() }, document)
            .upsert(true)
            .await
            .map_err(storage)?;
        debug!(%group_uuid, members = task_uuids.len(), "group initialised");
        Ok(())
    }

    async fn group_completed(
        &self,
        group_uuid: &GroupUuid,
        group_task_count: usize,
    ) -> BackendResult<bool> {
        let meta = self.load_group(group_uuid).await?;
        let states = self.member_states(&meta).await?;
        Ok(completed_count(&states) == group_task_count)
    }

    async fn group_task_states(
        &self,
        group_uuid: &GroupUuid,
        _group_task_count: usize,
    ) -> BackendResult<Vec<TaskState>> {
        let meta = self.load_group(group_uuid).await?;
        let states = self.member_states(&meta).await?;
        require_all(&meta.task_uuids, states)
    }

    #[tracing::instrument(skip(self), fields(backend = "mongo"))]
    async fn trigger_chord(&self, group_uuid: &GroupUuid) -> BackendResult<bool> {
        let filter = doc! {
            "_id": group_uuid.as_str(),
            "chord_triggered": false,
            "expires_at": { "$gt": DateTime::now() },
        };
        let update = doc! { "$set": { "chord_triggered": true } };

        let won = self
            .groups()
            .await?
            .find_one_and_update(filter, update)
            .await
            .map_err(storage)?;
        if won.is_some() {
            info!("chord trigger won");
            return Ok(true);
        }

        // 負けたのか、グループが無いのか
        self.load_group(group_uuid).await.map(|_| false)
    }

    async fn update_state(&self, mut state: TaskState) -> BackendResult<()> {
        if let Some(prior) = self.load_state(&state.task_uuid).await? {
            state.merge_prior(&prior);
        }
        let document = TaskDocument::new(&state, self.expires_at())?;
        self.tasks()
            .await?
            .replace_one(doc! { "_id": state.task_uuid.as_str() }, document)
            .upsert(true)
            .await
            .map_err(storage)?;
        debug!(task_uuid = %state.task_uuid, state = %state.state, "task state stored");
        Ok(())
    }

    async fn get_state(&self, task_uuid: &TaskUuid) -> BackendResult<TaskState> {
        self.load_state(task_uuid)
            .await?
            .ok_or_else(|| BackendError::TaskNotFound(task_uuid.clone()))
    }

    async fn purge_state(&self, task_uuid: &TaskUuid) -> BackendResult<()> {
        let result = self
            .tasks()
            .await?
            .delete_one(live(task_uuid.as_str()))
            .await
            .map_err(storage)?;
        if result.deleted_count == 0 {
            return Err(BackendError::TaskNotFound(task_uuid.clone()));
        }
        Ok(())
    }

    async fn purge_group_meta(&self, group_uuid: &GroupUuid) -> BackendResult<()> {
        let result = self
            .groups()
            .await?
            .delete_one(live(group_uuid.as_str()))
            .await
            .map_err(storage)?;
        if result.deleted_count == 0 {
            return Err(BackendError::GroupNotFound(group_uuid.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Signature, TaskResult, TaskStatus};
    use std::sync::Arc;

    fn backend(expiration: Duration) -> Option<MongoBackend> {
        let uri = std::env::var("MONGODB_URL").ok()?;
        Some(MongoBackend::new(uri, "weaver_test", expiration))
    }

    #[test]
    fn group_document_keeps_membership_and_flags() {
        let mut meta = GroupMeta::new(
            GroupUuid::new("g"),
            vec![TaskUuid::new("b"), TaskUuid::new("a")],
        );
        meta.chord_triggered = true;

        let back = GroupDocument::new(&meta, DateTime::now()).into_meta();
        assert_eq!(back.task_uuids, meta.task_uuids);
        assert!(back.chord_triggered);
        assert_eq!(
            back.created_at.timestamp_millis(),
            meta.created_at.timestamp_millis()
        );
    }

    #[test]
    fn task_document_keeps_big_numbers_exact() {
        let sig = Signature::new("sum");
        let big: serde_json::Value = serde_json::from_str("123456789012345678901234567890").unwrap();
        let state = TaskState::success(&sig, vec![TaskResult::new("int", big.clone())]);

        let document = TaskDocument::new(&state, DateTime::now()).unwrap();
        assert_eq!(document.state, "SUCCESS");
        assert_eq!(document.decode().unwrap().results[0].value, big);
    }

    #[tokio::test]
    async fn lost_trigger_and_missing_group_are_told_apart() {
        let Some(backend) = backend(Duration::from_secs(60)) else {
            return;
        };
        let group = GroupUuid::generate();
        assert!(matches!(
            backend.trigger_chord(&group).await.unwrap_err(),
            BackendError::GroupNotFound(_)
        ));

        backend.init_group(&group, &[]).await.unwrap();
        assert!(backend.trigger_chord(&group).await.unwrap());
        assert!(!backend.trigger_chord(&group).await.unwrap());
    }

    #[tokio::test]
    async fn expired_documents_are_invisible() {
        let Some(backend) = backend(Duration::from_secs(1)) else {
            return;
        };
        let sig = Signature::new("short");
        backend.set_state_pending(&sig).await.unwrap();
        assert_eq!(backend.get_state(&sig.uuid).await.unwrap().state, TaskStatus::Pending);

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert!(matches!(
            backend.get_state(&sig.uuid).await.unwrap_err(),
            BackendError::TaskNotFound(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_triggers_have_a_single_winner() {
        let Some(backend) = backend(Duration::from_secs(60)) else {
            return;
        };
        let backend = Arc::new(backend);
        let group = GroupUuid::generate();
        backend.init_group(&group, &[TaskUuid::generate()]).await.unwrap();

        let mut joins = Vec::new();
        for _ in 0..300 {
            let backend = Arc::clone(&backend);
            let group = group.clone();
            joins.push(tokio::spawn(async move {
                backend.trigger_chord(&group).await.unwrap()
            }));
        }

        let mut winners = 0;
        for join in joins {
            if join.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
