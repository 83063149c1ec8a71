//! Backends - ストレージ技術ごとの `Backend` 実装
//!
//! | 実装 | chord trigger の排他 | 保証 |
//! |---|---|---|
//! | InMemoryBackend | プロセス内 Mutex | 厳密（単一プロセスのみ） |
//! | NullBackend | なし（常に true） | なし（テスト用） |
//! | CacheBackend | advisory フラグ + `add` リース + ポーリング | ベストエフォート |
//! | RedisBackend | 名前付き分散ロック（SET NX PX） | 強い（リースが切れない限り） |
//! | MongoBackend | `find_one_and_update`（ドキュメント単位） | 強い |

mod common;

pub mod cache;
pub mod memory;
pub mod mongo;
pub mod null;
pub mod redis;

pub use self::cache::{CacheBackend, LocalCacheClient, MemcacheClient};
pub use self::memory::InMemoryBackend;
pub use self::mongo::MongoBackend;
pub use self::null::NullBackend;
pub use self::redis::{RedisBackend, RedisMutex};
