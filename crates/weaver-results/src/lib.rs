//! weaver-results
//!
//! Result backend for the Weaver task queue: task state persistence and
//! group / chord coordination.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, result, group, signature, errors）
//! - **ports**: 抽象化レイヤー（Backend 契約, CacheClient）
//! - **backends**: 実装（memory, null, cache/memcached, redis, mongo）
//! - **app**: アプリケーションロジック（BackendBuilder, ChordCoordinator）
//! - **config**: 設定（有効期限, backend の選択, ロックの待ち方）
//!
//! # 使用例
//! ```ignore
//! let backend = BackendBuilder::new(ResultsConfig::from_env()?).build()?;
//! let coordinator = ChordCoordinator::new(backend.clone());
//!
//! backend.set_state_success(&signature, results).await?;
//! if let ChordDecision::Fire { callback, .. } = coordinator.on_task_completed(&signature).await? {
//!     broker.send(callback).await?;
//! }
//! ```

pub mod app;
pub mod backends;
pub mod config;
pub mod domain;
pub mod ports;

pub use self::app::{BackendBuilder, ChordCoordinator, ChordDecision};
pub use self::config::{BackendKind, LockConfig, ResultsConfig};
pub use self::domain::{
    BackendError, BackendResult, GroupMeta, GroupUuid, Signature, TaskResult, TaskState,
    TaskStatus, TaskUuid,
};
pub use self::ports::{Backend, CacheClient};
