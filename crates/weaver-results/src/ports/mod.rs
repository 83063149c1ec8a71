//! Ports - 抽象化レイヤー
//!
//! 呼び出し側（ワーカー / クライアント）が使う `Backend` 契約と、
//! ストレージ技術ごとの差を吸収するクライアント trait を定義します。

pub mod backend;
pub mod cache_client;

pub use self::backend::Backend;
pub use self::cache_client::CacheClient;
