//! CacheBackend - 分散キャッシュ（memcached など）上の backend
//!
//! キャッシュには CAS がないので、chord trigger の排他は次の 2 段で行います。
//! 1. GroupMeta の `lock` フラグ（advisory）を見て、立っていれば待つ
//! 2. `add` によるリースキー `<group>:chord-lock` を取る（`add` はキーが無いときだけ成功する）
//!
//! リースキーの取得は atomic ですが、キャッシュ自体が落ちたりエビクションされたりすると
//! 保証は崩れます。厳密さが必要なら Redis / MongoDB を使ってください。
//!
//! リースの値は呼び出しごとの ULID トークンで、解放時はトークンが一致するときだけ消します。
//! ただし get と delete の間は atomic ではありません。
//! フラグを書き換える途中で失敗したら、`lock` を戻してから エラーを返します（best-effort）。
//!
//! # キー
//! - TaskState: `<task_uuid>`
//! - GroupMeta: `<group_uuid>`
//! - リース: `<group_uuid>:chord-lock`

pub mod local;
pub mod memcache;

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use super::common::{completed_count, decode, encode, require_all};
use crate::config::LockConfig;
use crate::domain::{BackendError, BackendResult, GroupMeta, GroupUuid, TaskState, TaskUuid};
use crate::ports::{Backend, CacheClient};

pub use self::local::LocalCacheClient;
pub use self::memcache::MemcacheClient;

/// Backend over any [`CacheClient`].
pub struct CacheBackend<C: CacheClient> {
    client: C,
    expiration: Duration,
    lock: LockConfig,
}

impl<C: CacheClient> CacheBackend<C> {
    pub fn new(client: C, expiration: Duration, lock: LockConfig) -> Self {
        Self {
            client,
            expiration,
            lock,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    async fn load_group(&self, group_uuid: &GroupUuid) -> BackendResult<GroupMeta> {
        let bytes = self
            .client
            .get(group_uuid.as_str())
            .await?
            .ok_or_else(|| BackendError::GroupNotFound(group_uuid.clone()))?;
        decode(&bytes)
    }

    async fn load_state(&self, task_uuid: &TaskUuid) -> BackendResult<Option<TaskState>> {
        match self.client.get(task_uuid.as_str()).await? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// One slot per member, in membership order. A decode failure on any
    /// member fails the whole fetch.
    async fn member_states(&self, meta: &GroupMeta) -> BackendResult<Vec<Option<TaskState>>> {
        let mut states = Vec::with_capacity(meta.task_uuids.len());
        for task_uuid in &meta.task_uuids {
            let state = self.load_state(task_uuid).await.inspect_err(|err| {
                error!(group_uuid = %meta.group_uuid, %task_uuid, %err, "group member fetch failed");
            })?;
            states.push(state);
        }
        Ok(states)
    }

    /// Wait until the group is unlocked and the lease key is ours.
    ///
    /// Returns the lease token, or `None` when another caller already
    /// triggered the chord while we were waiting.
    async fn acquire(&self, group_uuid: &GroupUuid, lease_key: &str) -> BackendResult<Option<String>> {
        let token = Ulid::new().to_string();
        let started = Instant::now();
        loop {
            let meta = self.load_group(group_uuid).await?;
            if meta.chord_triggered {
                return Ok(None);
            }
            if !meta.lock
                && self
                    .client
                    .add(lease_key, token.as_bytes(), self.lock.lease())
                    .await?
            {
                return Ok(Some(token));
            }

            let waited = started.elapsed();
            if self.lock.max_wait().is_some_and(|max_wait| waited >= max_wait) {
                return Err(BackendError::LockTimeout {
                    key: lease_key.to_string(),
                    waited,
                });
            }
            warn!(%group_uuid, ?waited, "group is locked, waiting");
            tokio::time::sleep(self.lock.poll_interval()).await;
        }
    }

    /// Delete the lease only while it still carries our token.
    async fn release(&self, lease_key: &str, token: &str) -> BackendResult<bool> {
        match self.client.get(lease_key).await? {
            Some(value) if value == token.as_bytes() => self.client.delete(lease_key).await,
            _ => Ok(false),
        }
    }

    /// Flag flip, run while holding the lease.
    async fn flip_chord(&self, group_uuid: &GroupUuid) -> BackendResult<bool> {
        let meta = self.load_group(group_uuid).await?;
        if meta.chord_triggered {
            return Ok(false);
        }

        let unlocked = encode(&meta)?;
        let locked = encode(&GroupMeta {
            lock: true,
            ..meta.clone()
        })?;
        let triggered = encode(&GroupMeta {
            chord_triggered: true,
            lock: false,
            ..meta
        })?;

        self.client
            .set(group_uuid.as_str(), &locked, self.expiration)
            .await?;
        match self
            .client
            .replace(group_uuid.as_str(), &triggered, self.expiration)
            .await
        {
            Ok(true) => Ok(true),
            Ok(false) => Err(BackendError::GroupNotFound(group_uuid.clone())),
            Err(err) => {
                self.unlock_group(group_uuid, &unlocked).await;
                Err(err)
            }
        }
    }

    /// Put back the unlocked GroupMeta after a failed flip.
    async fn unlock_group(&self, group_uuid: &GroupUuid, unlocked: &[u8]) {
        match self
            .client
            .replace(group_uuid.as_str(), unlocked, self.expiration)
            .await
        {
            Ok(_) => debug!(%group_uuid, "group lock flag cleared after failed flip"),
            Err(err) => warn!(%group_uuid, %err, "failed to clear group lock flag"),
        }
    }
}

#[async_trait]
impl<C: CacheClient> Backend for CacheBackend<C> {
    async fn init_group(&self, group_uuid: &GroupUuid, task_uuids: &[TaskUuid]) -> BackendResult<()> {
        let meta = GroupMeta::new(group_uuid.clone(), task_uuids.to_vec());
        self.client
            .set(group_uuid.as_str(), &encode(&meta)?, self.expiration)
            .await?;
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

    #[tracing::instrument(skip(self), fields(backend = "cache"))]
    async fn trigger_chord(&self, group_uuid: &GroupUuid) -> BackendResult<bool> {
        let lease_key = format!("{group_uuid}:chord-lock");
        let Some(token) = self.acquire(group_uuid, &lease_key).await? else {
            return Ok(false);
        };

        let result = self.flip_chord(group_uuid).await;
        match self.release(&lease_key, &token).await {
            Ok(true) => {}
            Ok(false) => warn!(%group_uuid, "chord lease expired before release"),
            // lease は期限切れで消える
            Err(err) => warn!(%group_uuid, %err, "failed to release chord lease"),
        }
        if matches!(result, Ok(true)) {
            info!("chord trigger won");
        }
        result
    }

    async fn update_state(&self, mut state: TaskState) -> BackendResult<()> {
        if let Some(prior) = self.load_state(&state.task_uuid).await? {
            state.merge_prior(&prior);
        }
        self.client
            .set(state.task_uuid.as_str(), &encode(&state)?, self.expiration)
            .await?;
        debug!(task_uuid = %state.task_uuid, state = %state.state, "task state stored");
        Ok(())
    }

    async fn get_state(&self, task_uuid: &TaskUuid) -> BackendResult<TaskState> {
        self.load_state(task_uuid)
            .await?
            .ok_or_else(|| BackendError::TaskNotFound(task_uuid.clone()))
    }

    async fn purge_state(&self, task_uuid: &TaskUuid) -> BackendResult<()> {
        if self.client.delete(task_uuid.as_str()).await? {
            Ok(())
        } else {
            Err(BackendError::TaskNotFound(task_uuid.clone()))
        }
    }

    async fn purge_group_meta(&self, group_uuid: &GroupUuid) -> BackendResult<()> {
        if self.client.delete(group_uuid.as_str()).await? {
            Ok(())
        } else {
            Err(BackendError::GroupNotFound(group_uuid.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Signature, TaskResult, TaskStatus};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// LocalCacheClient whose next `replace` fails once.
    #[derive(Default)]
    struct FlakyReplace {
        inner: LocalCacheClient,
        fail_next: AtomicBool,
    }

    #[async_trait]
    impl CacheClient for FlakyReplace {
        async fn get(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> BackendResult<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn add(&self, key: &str, value: &[u8], ttl: Duration) -> BackendResult<bool> {
            self.inner.add(key, value, ttl).await
        }

        async fn replace(&self, key: &str, value: &[u8], ttl: Duration) -> BackendResult<bool> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(BackendError::storage(
                    "memcache",
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout"),
                ));
            }
            self.inner.replace(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> BackendResult<bool> {
            self.inner.delete(key).await
        }
    }

    fn backend(lock: LockConfig) -> CacheBackend<LocalCacheClient> {
        CacheBackend::new(LocalCacheClient::new(), Duration::from_secs(3600), lock)
    }

    fn fast_lock() -> LockConfig {
        LockConfig {
            poll_interval_ms: 1,
            max_wait_ms: Some(50),
            ..LockConfig::default()
        }
    }

    #[tokio::test]
    async fn trigger_chord_flips_once_and_releases_the_lease() {
        let backend = backend(fast_lock());
        let group = GroupUuid::new("g");
        backend.init_group(&group, &[TaskUuid::new("a")]).await.unwrap();

        assert!(backend.trigger_chord(&group).await.unwrap());
        assert!(!backend.trigger_chord(&group).await.unwrap());

        let meta = backend.load_group(&group).await.unwrap();
        assert!(meta.chord_triggered);
        assert!(!meta.lock);
        assert!(backend.client().get("g:chord-lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_flip_clears_the_lock_flag() {
        let backend = CacheBackend::new(
            FlakyReplace::default(),
            Duration::from_secs(3600),
            fast_lock(),
        );
        let group = GroupUuid::new("g");
        backend.init_group(&group, &[TaskUuid::new("a")]).await.unwrap();

        backend.client().fail_next.store(true, Ordering::SeqCst);
        assert!(matches!(
            backend.trigger_chord(&group).await.unwrap_err(),
            BackendError::Storage { .. }
        ));

        let meta = backend.load_group(&group).await.unwrap();
        assert!(!meta.lock);
        assert!(!meta.chord_triggered);
        assert!(backend.client().get("g:chord-lock").await.unwrap().is_none());

        assert!(backend.trigger_chord(&group).await.unwrap());
        assert!(!backend.trigger_chord(&group).await.unwrap());
    }

    #[tokio::test]
    async fn release_keeps_a_lease_owned_by_someone_else() {
        let backend = backend(fast_lock());
        backend
            .client()
            .set("g:chord-lock", b"other", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(!backend.release("g:chord-lock", "mine").await.unwrap());
        assert_eq!(
            backend.client().get("g:chord-lock").await.unwrap(),
            Some(b"other".to_vec())
        );
        assert!(backend.release("g:chord-lock", "other").await.unwrap());
        assert!(backend.client().get("g:chord-lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stuck_advisory_flag_times_out() {
        let backend = backend(fast_lock());
        let group = GroupUuid::new("g");
        backend.init_group(&group, &[]).await.unwrap();

        let mut meta = backend.load_group(&group).await.unwrap();
        meta.lock = true;
        backend
            .client()
            .set("g", &encode(&meta).unwrap(), Duration::from_secs(60))
            .await
            .unwrap();

        let err = backend.trigger_chord(&group).await.unwrap_err();
        assert!(matches!(err, BackendError::LockTimeout { ref key, .. } if key == "g:chord-lock"));
    }

    #[tokio::test]
    async fn held_lease_times_out() {
        let backend = backend(fast_lock());
        let group = GroupUuid::new("g");
        backend.init_group(&group, &[]).await.unwrap();
        backend
            .client()
            .add("g:chord-lock", b"1", Duration::from_secs(60))
            .await
            .unwrap();

        let err = backend.trigger_chord(&group).await.unwrap_err();
        assert!(matches!(err, BackendError::LockTimeout { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_triggers_have_a_single_winner() {
        let backend = Arc::new(backend(LockConfig {
            poll_interval_ms: 1,
            max_wait_ms: None,
            ..LockConfig::default()
        }));
        let group = GroupUuid::generate();
        backend.init_group(&group, &[TaskUuid::new("a")]).await.unwrap();

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

    #[tokio::test]
    async fn group_completion_ignores_missing_members() {
        let backend = backend(fast_lock());
        let group = GroupUuid::new("g");
        let a = Signature::with_uuid(TaskUuid::new("a"), "t");
        backend
            .init_group(&group, &[a.uuid.clone(), TaskUuid::new("b")])
            .await
            .unwrap();
        backend
            .set_state_success(&a, vec![TaskResult::string("ok")])
            .await
            .unwrap();

        assert!(!backend.group_completed(&group, 2).await.unwrap());
        assert!(backend.group_completed(&group, 1).await.unwrap());
        assert!(matches!(
            backend.group_task_states(&group, 2).await.unwrap_err(),
            BackendError::TaskNotFound(id) if id.as_str() == "b"
        ));
    }

    #[tokio::test]
    async fn corrupt_member_aborts_the_batch() {
        let backend = backend(fast_lock());
        let group = GroupUuid::new("g");
        let a = Signature::with_uuid(TaskUuid::new("a"), "t");
        backend
            .init_group(&group, &[a.uuid.clone(), TaskUuid::new("b")])
            .await
            .unwrap();
        backend.set_state_failure(&a, "x").await.unwrap();
        backend
            .client()
            .set("b", b"{garbage", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(matches!(
            backend.group_completed(&group, 2).await.unwrap_err(),
            BackendError::Encoding(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn states_expire() {
        let backend = CacheBackend::new(
            LocalCacheClient::new(),
            Duration::from_secs(1),
            LockConfig::default(),
        );
        let sig = Signature::new("short");
        backend.set_state_pending(&sig).await.unwrap();
        assert_eq!(backend.get_state(&sig.uuid).await.unwrap().state, TaskStatus::Pending);

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(matches!(
            backend.get_state(&sig.uuid).await.unwrap_err(),
            BackendError::TaskNotFound(_)
        ));
    }
}
