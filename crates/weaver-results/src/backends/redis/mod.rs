//! RedisBackend - Redis 上の backend
//!
//! # 実装詳細
//! - 書き込みはすべて `SET key value EX <ttl>`
//! - グループの状態取得は `MGET` 1 回
//! - purge は `DEL` の戻り値（削除件数）で NotFound を判定
//! - chord trigger はグループごとの [`RedisMutex`] の中で GroupMeta を読み書きする
//! - ロック待ちの合間にも GroupMeta を読み、既に trigger 済みなら待たずに false を返す
//!
//! 接続（`ConnectionManager`）は最初の呼び出しで 1 度だけ作ります。

pub mod mutex;

use std::time::Duration;

use async_trait::async_trait;
use redis::RedisError;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::common::{completed_count, decode, encode, require_all};
use crate::config::LockConfig;
use crate::domain::{BackendError, BackendResult, GroupMeta, GroupUuid, TaskState, TaskUuid};
use crate::ports::Backend;

pub use self::mutex::RedisMutex;

const BACKEND: &str = "redis";

pub(crate) fn storage(err: RedisError) -> BackendError {
    BackendError::storage(BACKEND, err)
}

fn chord_lock_name(group_uuid: &GroupUuid) -> String {
    format!("weaver:chord-lock:{group_uuid}")
}

/// Backend over a Redis server.
pub struct RedisBackend {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    expiration: Duration,
    lock: LockConfig,
}

impl RedisBackend {
    /// Validates the URL; the connection is opened on first use.
    pub fn new(url: &str, expiration: Duration, lock: LockConfig) -> BackendResult<Self> {
        let client = redis::Client::open(url).map_err(storage)?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            expiration,
            lock,
        })
    }

    async fn connection(&self) -> BackendResult<ConnectionManager> {
        self.connection
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(storage)?;
                debug!("redis connection manager ready");
                Ok::<_, BackendError>(manager)
            })
            .await
            .cloned()
    }

    fn expire_secs(&self) -> u64 {
        self.expiration.as_secs().max(1)
    }

    async fn get_bytes(
        &self,
        conn: &mut ConnectionManager,
        key: &str,
    ) -> BackendResult<Option<Vec<u8>>> {
        redis::cmd("GET")
            .arg(key)
            .query_async(conn)
            .await
            .map_err(storage)
    }

    async fn set_bytes(
        &self,
        conn: &mut ConnectionManager,
        key: &str,
        value: &[u8],
    ) -> BackendResult<()> {
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(self.expire_secs())
            .query_async::<()>(conn)
            .await
            .map_err(storage)
    }

    async fn delete(&self, key: &str) -> BackendResult<bool> {
        let mut conn = self.connection().await?;
        let deleted: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(storage)?;
        Ok(deleted > 0)
    }

    async fn load_group(
        &self,
        conn: &mut ConnectionManager,
        group_uuid: &GroupUuid,
    ) -> BackendResult<GroupMeta> {
        let bytes = self
            .get_bytes(conn, group_uuid.as_str())
            .await?
            .ok_or_else(|| BackendError::GroupNotFound(group_uuid.clone()))?;
        decode(&bytes)
    }

    /// Fetch every member with a single MGET; missing keys come back as nil.
    async fn member_states(
        &self,
        conn: &mut ConnectionManager,
        meta: &GroupMeta,
    ) -> BackendResult<Vec<Option<TaskState>>> {
        if meta.task_uuids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<&str> = meta.task_uuids.iter().map(|id| id.as_str()).collect();
        let replies: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(conn)
            .await
            .map_err(storage)?;

        replies
            .into_iter()
            .map(|reply| reply.map(|bytes| decode::<TaskState>(&bytes)).transpose())
            .collect::<BackendResult<Vec<_>>>()
            .inspect_err(|err| {
                error!(group_uuid = %meta.group_uuid, %err, "group member decode failed");
            })
    }

    /// Flip under the held mutex, then release it.
    async fn flip_locked(
        &self,
        conn: &mut ConnectionManager,
        mutex: &mut RedisMutex,
        group_uuid: &GroupUuid,
    ) -> BackendResult<bool> {
        let result = self.flip_chord(conn, group_uuid).await;
        match mutex.unlock().await {
            Ok(true) => {}
            Ok(false) => warn!(name = mutex.name(), "chord lock lease expired before release"),
            Err(err) => warn!(name = mutex.name(), %err, "failed to release chord lock"),
        }
        if matches!(result, Ok(true)) {
            info!("chord trigger won");
        }
        result
    }

    async fn flip_chord(
        &self,
        conn: &mut ConnectionManager,
        group_uuid: &GroupUuid,
    ) -> BackendResult<bool> {
        let mut meta = self.load_group(conn, group_uuid).await?;
        if meta.chord_triggered {
            return Ok(false);
        }
        meta.chord_triggered = true;
        self.set_bytes(conn, group_uuid.as_str(), &encode(&meta)?)
            .await?;
        Ok(true)
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn init_group(&self, group_uuid: &GroupUuid, task_uuids: &[TaskUuid]) -> BackendResult<()> {
        let mut conn = self.connection().await?;
        let meta = GroupMeta::new(group_uuid.clone(), task_uuids.to_vec());
        self.set_bytes(&mut conn, group_uuid.as_str(), &encode(&meta)?)
            .await?;
        debug!(%group_uuid, members = task_uuids.len(), "group initialised");
        Ok(())
    }

    async fn group_completed(
        &self,
        group_uuid: &GroupUuid,
        group_task_count: usize,
    ) -> BackendResult<bool> {
        let mut conn = self.connection().await?;
        let meta = self.load_group(&mut conn, group_uuid).await?;
        let states = self.member_states(&mut conn, &meta).await?;
        Ok(completed_count(&states) == group_task_count)
    }

    async fn group_task_states(
        &self,
        group_uuid: &GroupUuid,
        _group_task_count: usize,
    ) -> BackendResult<Vec<TaskState>> {
        let mut conn = self.connection().await?;
        let meta = self.load_group(&mut conn, group_uuid).await?;
        let states = self.member_states(&mut conn, &meta).await?;
        require_all(&meta.task_uuids, states)
    }

    #[tracing::instrument(skip(self), fields(backend = "redis"))]
    async fn trigger_chord(&self, group_uuid: &GroupUuid) -> BackendResult<bool> {
        let mut conn = self.connection().await?;
        let mut mutex = RedisMutex::new(conn.clone(), chord_lock_name(group_uuid), &self.lock);
        let started = Instant::now();

        for attempt in 1..=mutex.tries() {
            // chord_triggered は false から true にしか変わらない
            if self.load_group(&mut conn, group_uuid).await?.chord_triggered {
                return Ok(false);
            }
            if mutex.try_lock().await? {
                debug!(name = mutex.name(), attempt, "chord lock acquired");
                return self.flip_locked(&mut conn, &mut mutex, group_uuid).await;
            }
            mutex.backoff().await;
        }

        if self.load_group(&mut conn, group_uuid).await?.chord_triggered {
            return Ok(false);
        }
        let waited = started.elapsed();
        warn!(name = mutex.name(), tries = mutex.tries(), ?waited, "chord lock not acquired");
        Err(BackendError::LockTimeout {
            key: mutex.name().to_string(),
            waited,
        })
    }

    async fn update_state(&self, mut state: TaskState) -> BackendResult<()> {
        let mut conn = self.connection().await?;
        let key = state.task_uuid.to_string();
        if let Some(bytes) = self.get_bytes(&mut conn, &key).await? {
            let prior: TaskState = decode(&bytes)?;
            state.merge_prior(&prior);
        }
        self.set_bytes(&mut conn, &key, &encode(&state)?).await?;
        debug!(task_uuid = %state.task_uuid, state = %state.state, "task state stored");
        Ok(())
    }

    async fn get_state(&self, task_uuid: &TaskUuid) -> BackendResult<TaskState> {
        let mut conn = self.connection().await?;
        let bytes = self
            .get_bytes(&mut conn, task_uuid.as_str())
            .await?
            .ok_or_else(|| BackendError::TaskNotFound(task_uuid.clone()))?;
        decode(&bytes)
    }

    async fn purge_state(&self, task_uuid: &TaskUuid) -> BackendResult<()> {
        if self.delete(task_uuid.as_str()).await? {
            Ok(())
        } else {
            Err(BackendError::TaskNotFound(task_uuid.clone()))
        }
    }

    async fn purge_group_meta(&self, group_uuid: &GroupUuid) -> BackendResult<()> {
        if self.delete(group_uuid.as_str()).await? {
            Ok(())
        } else {
            Err(BackendError::GroupNotFound(group_uuid.clone()))
        }
    }
}
