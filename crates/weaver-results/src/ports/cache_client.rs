//! CacheClient port - 分散キャッシュ（memcached など）の最小インターフェース
//!
//! CacheBackend はこの trait だけに依存します。
//!
//! # 実装
//! - **MemcacheClient**: memcached（本番用）
//! - **LocalCacheClient**: プロセス内マップ（単一プロセス・テスト用）

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::BackendResult;

/// get / set / add / replace / delete with a per-item TTL.
#[async_trait]
pub trait CacheClient: Send + Sync {
    /// `None` when the key is missing or expired.
    async fn get(&self, key: &str) -> BackendResult<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> BackendResult<()>;

    /// Store only if the key is absent. `false` when it already exists.
    async fn add(&self, key: &str, value: &[u8], ttl: Duration) -> BackendResult<bool>;

    /// Store only if the key exists. `false` when it is missing.
    async fn replace(&self, key: &str, value: &[u8], ttl: Duration) -> BackendResult<bool>;

    /// `false` when there was nothing to delete.
    async fn delete(&self, key: &str) -> BackendResult<bool>;
}
