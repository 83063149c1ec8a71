//! BackendBuilder - 設定から backend を組み立てる
//!
//! # 設計
//! - 実装は設定時に 1 度だけ選ぶ（`BackendKind`）
//! - 呼び出し側には `Arc<dyn Backend>` だけを渡す
//! - ネットワーク接続は build 時には張らない（最初の呼び出しで遅延初期化）
//! - URL や サーバー一覧の不備は build 時に返す（Fail-fast）

use std::sync::Arc;

use tracing::info;

use crate::backends::{
    CacheBackend, InMemoryBackend, MemcacheClient, MongoBackend, NullBackend, RedisBackend,
};
use crate::config::{BackendKind, ResultsConfig};
use crate::domain::BackendResult;
use crate::ports::Backend;

/// BackendBuilder は ResultsConfig から backend を構築
///
/// # 使用例
/// ```ignore
/// let config = ResultsConfig::from_env()?;
/// let backend = BackendBuilder::new(config).build()?;
/// backend.set_state_pending(&signature).await?;
/// ```
pub struct BackendBuilder {
    config: ResultsConfig,
}

impl BackendBuilder {
    pub fn new(config: ResultsConfig) -> Self {
        Self { config }
    }

    pub fn build(self) -> BackendResult<Arc<dyn Backend>> {
        let expiration = self.config.expiration();
        let lock = self.config.lock;

        let backend: Arc<dyn Backend> = match self.config.backend {
            BackendKind::Memory => Arc::new(InMemoryBackend::new()),
            BackendKind::Null => Arc::new(NullBackend::new()),
            BackendKind::Memcache { servers } => Arc::new(CacheBackend::new(
                MemcacheClient::new(servers)?,
                expiration,
                lock,
            )),
            BackendKind::Redis { url } => Arc::new(RedisBackend::new(&url, expiration, lock)?),
            BackendKind::Mongo { uri, database } => {
                Arc::new(MongoBackend::new(uri, database, expiration))
            }
        };
        info!(?expiration, "result backend configured");
        Ok(backend)
    }
}

impl Default for BackendBuilder {
    fn default() -> Self {
        Self::new(ResultsConfig::default())
    }
}
