//! App - アプリケーション層
//!
//! ports を組み合わせて、ワーカーから見える操作を実装します。
//!
//! # 主要コンポーネント
//! - **BackendBuilder**: 設定から backend を選んで組み立てる
//! - **ChordCoordinator**: グループ完了の判定と chord callback の発火

pub mod builder;
pub mod coordinator;

pub use self::builder::BackendBuilder;
pub use self::coordinator::{ChordCoordinator, ChordDecision};
