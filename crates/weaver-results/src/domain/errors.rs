//! Errors - エラー型と分類
//!
//! すべての backend 操作は `BackendError` を返します。
//! この層ではリトライしません（advisory lock の待機ループを除く）。
//! 呼び出し側は `kind()` を見て、呼び出し自体をやり直すか決めます。

use std::time::Duration;

use super::ids::{GroupUuid, TaskUuid};

/// ErrorKind は backend エラーの運用分類
///
/// - Transient: 一時的なエラー（同じ呼び出しのリトライで解消しうる）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: ストレージ側の障害（接続・タイムアウト・プロトコル）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// BackendError は result backend のエラー
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("group not found: {0}")]
    GroupNotFound(GroupUuid),

    #[error("task not found: {0}")]
    TaskNotFound(TaskUuid),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("{backend} storage error: {source}")]
    Storage {
        backend: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("lock `{key}` not acquired within {waited:?}")]
    LockTimeout { key: String, waited: Duration },
}

impl BackendError {
    pub fn storage(
        backend: &'static str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Storage {
            backend,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::GroupNotFound(_)
            | BackendError::TaskNotFound(_)
            | BackendError::Encoding(_) => ErrorKind::Permanent,
            BackendError::Storage { .. } => ErrorKind::Infrastructure,
            BackendError::LockTimeout { .. } => ErrorKind::Transient,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BackendError::GroupNotFound(_) | BackendError::TaskNotFound(_)
        )
    }
}

pub type BackendResult<T> = Result<T, BackendError>;
