//! LocalCacheClient - プロセス内のキャッシュ（単一プロセス・テスト用）
//!
//! 期限は `tokio::time::Instant` で管理するので、`start_paused` のテストで時間を進められます。
//! 期限切れのエントリは読み込み時と、`set` / `add` のたびの掃除で消えます。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::domain::BackendResult;
use crate::ports::CacheClient;

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl Entry {
    fn new(value: &[u8], ttl: Duration) -> Self {
        Self {
            value: value.to_vec(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-process [`CacheClient`] honouring per-item TTLs.
#[derive(Default)]
pub struct LocalCacheClient {
    entries: Mutex<HashMap<String, Entry>>,
}

impl LocalCacheClient {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sweep(entries: &mut HashMap<String, Entry>, now: Instant) {
    entries.retain(|_, entry| entry.is_live(now));
}

#[async_trait]
impl CacheClient for LocalCacheClient {
    async fn get(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> BackendResult<()> {
        let mut entries = self.entries.lock().await;
        sweep(&mut entries, Instant::now());
        entries.insert(key.to_string(), Entry::new(value, ttl));
        Ok(())
    }

    async fn add(&self, key: &str, value: &[u8], ttl: Duration) -> BackendResult<bool> {
        let mut entries = self.entries.lock().await;
        sweep(&mut entries, Instant::now());
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), Entry::new(value, ttl));
        Ok(true)
    }

    async fn replace(&self, key: &str, value: &[u8], ttl: Duration) -> BackendResult<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if !entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        entries.insert(key.to_string(), Entry::new(value, ttl));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> BackendResult<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        Ok(entries.remove(key).is_some_and(|entry| entry.is_live(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn add_only_stores_absent_keys() {
        let client = LocalCacheClient::new();
        assert!(client.add("k", b"1", MINUTE).await.unwrap());
        assert!(!client.add("k", b"2", MINUTE).await.unwrap());
        assert_eq!(client.get("k").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn replace_only_stores_present_keys() {
        let client = LocalCacheClient::new();
        assert!(!client.replace("k", b"1", MINUTE).await.unwrap());
        assert!(client.get("k").await.unwrap().is_none());

        client.set("k", b"1", MINUTE).await.unwrap();
        assert!(client.replace("k", b"2", MINUTE).await.unwrap());
        assert_eq!(client.get("k").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn delete_reports_whether_something_was_removed() {
        let client = LocalCacheClient::new();
        client.set("k", b"1", MINUTE).await.unwrap();
        assert!(client.delete("k").await.unwrap());
        assert!(!client.delete("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_behave_as_absent() {
        let client = LocalCacheClient::new();
        client.set("k", b"1", Duration::from_secs(1)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(client.get("k").await.unwrap().is_none());
        assert!(!client.replace("k", b"2", MINUTE).await.unwrap());
        assert!(client.add("k", b"3", MINUTE).await.unwrap());
        assert_eq!(client.get("k").await.unwrap(), Some(b"3".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn writes_sweep_entries_nobody_reads_again() {
        let client = LocalCacheClient::new();
        for key in ["a", "b", "c"] {
            client.set(key, b"1", Duration::from_secs(1)).await.unwrap();
        }

        tokio::time::advance(Duration::from_secs(2)).await;
        client.set("d", b"1", MINUTE).await.unwrap();
        assert_eq!(client.entries.lock().await.len(), 1);

        client.set("e", b"1", Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(client.add("f", b"1", MINUTE).await.unwrap());
        let entries = client.entries.lock().await;
        assert!(entries.contains_key("d") && entries.contains_key("f"));
        assert_eq!(entries.len(), 2);
    }
}
