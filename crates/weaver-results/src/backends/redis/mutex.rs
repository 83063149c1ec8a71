//! RedisMutex - Redis 上の名前付き分散ロック
//!
//! # プロトコル
//! - 取得: `SET <name> <token> NX PX <lease>`（キーが無いときだけ成功）
//! - 失敗したらランダムな遅延を挟んで再試行（最大 `tries` 回）
//! - 解放: トークンが自分のものであるときだけ DEL（Lua で compare-and-delete）
//!
//! 保持者がクラッシュしても、リースが切れればロックは自然に外れます。

use std::time::Duration;

use rand::Rng;
use redis::Script;
use redis::aio::ConnectionManager;
use tokio::time::Instant;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::config::LockConfig;
use crate::domain::{BackendError, BackendResult};

use super::storage;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Named mutex with a lease, held by at most one caller cluster-wide.
pub struct RedisMutex {
    connection: ConnectionManager,
    name: String,
    token: String,
    lease: Duration,
    tries: u32,
    delay_min_ms: u64,
    delay_max_ms: u64,
}

impl RedisMutex {
    pub fn new(connection: ConnectionManager, name: impl Into<String>, config: &LockConfig) -> Self {
        Self {
            connection,
            name: name.into(),
            token: Ulid::new().to_string(),
            lease: config.lease(),
            tries: config.tries.max(1),
            delay_min_ms: config.retry_delay_min_ms,
            delay_max_ms: config.retry_delay_max_ms,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }

    /// Sleep one jittered retry delay.
    pub async fn backoff(&self) {
        tokio::time::sleep(retry_delay(self.delay_min_ms, self.delay_max_ms)).await;
    }

    /// Try once. `false` when someone else holds the lock.
    pub async fn try_lock(&mut self) -> BackendResult<bool> {
        let lease_ms = u64::try_from(self.lease.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: Option<String> = redis::cmd("SET")
            .arg(&self.name)
            .arg(&self.token)
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(&mut self.connection)
            .await
            .map_err(storage)?;
        Ok(reply.is_some())
    }

    /// Acquire the lock, retrying up to `tries` times.
    pub async fn lock(&mut self) -> BackendResult<()> {
        let started = Instant::now();
        for attempt in 1..=self.tries {
            if self.try_lock().await? {
                debug!(name = %self.name, attempt, "mutex acquired");
                return Ok(());
            }
            if attempt < self.tries {
                self.backoff().await;
            }
        }

        let waited = started.elapsed();
        warn!(name = %self.name, tries = self.tries, ?waited, "mutex not acquired");
        Err(BackendError::LockTimeout {
            key: self.name.clone(),
            waited,
        })
    }

    /// Release the lock if we still own it. `false` when the lease had
    /// already expired (and possibly been taken by someone else).
    pub async fn unlock(&mut self) -> BackendResult<bool> {
        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(&self.name)
            .arg(&self.token)
            .invoke_async(&mut self.connection)
            .await
            .map_err(storage)?;
        Ok(deleted == 1)
    }
}

/// Uniform in `min..=max`; `min` when the range is empty.
fn retry_delay(min_ms: u64, max_ms: u64) -> Duration {
    let ms = if max_ms > min_ms {
        rand::thread_rng().gen_range(min_ms..=max_ms)
    } else {
        min_ms
    };
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connection() -> Option<ConnectionManager> {
        let url = std::env::var("REDIS_URL").ok()?;
        let client = redis::Client::open(url).ok()?;
        ConnectionManager::new(client).await.ok()
    }

    fn quick() -> LockConfig {
        LockConfig {
            lease_ms: 2_000,
            tries: 3,
            retry_delay_min_ms: 1,
            retry_delay_max_ms: 5,
            ..LockConfig::default()
        }
    }

    #[tokio::test]
    async fn second_holder_is_refused_until_release() {
        let Some(conn) = connection().await else {
            return;
        };
        let name = format!("weaver:test-lock:{}", Ulid::new());

        let mut first = RedisMutex::new(conn.clone(), name.clone(), &quick());
        let mut second = RedisMutex::new(conn, name, &quick());

        first.lock().await.unwrap();
        assert!(matches!(
            second.lock().await.unwrap_err(),
            BackendError::LockTimeout { .. }
        ));

        // 他人のトークンでは解放できない
        assert!(!second.unlock().await.unwrap());
        assert!(first.unlock().await.unwrap());
        second.lock().await.unwrap();
        assert!(second.unlock().await.unwrap());
    }

    #[tokio::test]
    async fn lease_expiry_frees_the_lock() {
        let Some(conn) = connection().await else {
            return;
        };
        let name = format!("weaver:test-lock:{}", Ulid::new());
        let config = LockConfig {
            lease_ms: 50,
            ..quick()
        };

        let mut first = RedisMutex::new(conn.clone(), name.clone(), &config);
        let mut second = RedisMutex::new(conn, name, &config);
        first.lock().await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(second.try_lock().await.unwrap());
        assert!(!first.unlock().await.unwrap());
    }

    #[test]
    fn retry_delay_stays_in_range() {
        for _ in 0..100 {
            let delay = retry_delay(10, 20);
            assert!(delay >= Duration::from_millis(10) && delay <= Duration::from_millis(20));
        }
        assert_eq!(retry_delay(30, 5), Duration::from_millis(30));
    }
}
