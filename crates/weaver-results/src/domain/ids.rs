//! Domain identifiers (strongly-typed IDs).
//!
//! タスクとグループの識別子は呼び出し側（ワーカー / クライアント）が決める文字列で、
//! そのままストレージ上のキーになります。
//!
//! ## Phantom Type パターン
//! `Id<T>` は文字列を 1 つだけ持つジェネリック型で、`T` はマーカー型です。
//! 実行時のコストはなく、TaskUuid と GroupUuid を取り違えるとコンパイルエラーになります。
//!
//! ## 生成
//! 新しい識別子は `task_<ULID>` / `group_<ULID>` の形式で生成します。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// 生成時に付けるプレフィックス（"task_", "group_"）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// シリアライズ時は中身の文字列そのもの（`"task_01H..."`）になります。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    value: String,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// 呼び出し側が決めた文字列から Id を作成
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _marker: PhantomData,
        }
    }

    /// プレフィックス + ULID で新しい Id を生成
    pub fn generate() -> Self {
        Self::new(format!("{}{}", T::prefix(), Ulid::new()))
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl<T: IdMarker> AsRef<str> for Id<T> {
    fn as_ref(&self) -> &str {
        &self.value
    }
}

impl<T: IdMarker> From<&str> for Id<T> {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> From<String> for Id<T> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

// ========================================
// マーカー型の定義
// ========================================

/// Task のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task_"
    }
}

/// Group のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Group {}

impl IdMarker for Group {
    fn prefix() -> &'static str {
        "group_"
    }
}

/// Identifier of a task (key of its stored TaskState).
pub type TaskUuid = Id<Task>;

/// Identifier of a group of sibling tasks (key of its stored GroupMeta).
pub type GroupUuid = Id<Group>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_their_prefix() {
        let task = TaskUuid::generate();
        let group = GroupUuid::generate();

        assert!(task.as_str().starts_with("task_"));
        assert!(group.as_str().starts_with("group_"));

        // let _: GroupUuid = task; // <- does not compile
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = TaskUuid::generate();
        let b = TaskUuid::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = TaskUuid::new("abc-123");

        let s = serde_json::to_string(&id).unwrap();
        assert_eq!(s, "\"abc-123\"");

        let back: TaskUuid = serde_json::from_str(&s).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn caller_strings_are_kept_verbatim() {
        let id: GroupUuid = "123456".into();
        assert_eq!(id.to_string(), "123456");
        assert_eq!(id.as_ref(), "123456");
    }
}
