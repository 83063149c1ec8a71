//! MemcacheClient - memcached 用の CacheClient
//!
//! `memcache-async` の ASCII プロトコルを tokio の TcpStream 上で使います
//! （`tokio_util::compat` で futures の AsyncRead/AsyncWrite に変換）。
//!
//! # 実装詳細
//! - サーバーはキーのハッシュで決まる（同じキーは常に同じサーバー）
//! - 接続はサーバーごとに 1 本、最初に使うときに張る
//! - I/O エラーが起きた接続は捨て、次の呼び出しで張り直す

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use memcache_async::ascii::Protocol;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::debug;

use crate::domain::{BackendError, BackendResult};
use crate::ports::CacheClient;

const BACKEND: &str = "memcache";

/// memcached reads expirations above 30 days as absolute unix timestamps.
const MAX_RELATIVE_EXPIRATION: u64 = 60 * 60 * 24 * 30;

type MemcacheProtocol = Protocol<Compat<TcpStream>>;

struct Server {
    addr: String,
    connection: Mutex<Option<MemcacheProtocol>>,
}

/// memcached client over one or more servers.
pub struct MemcacheClient {
    servers: Vec<Server>,
}

impl MemcacheClient {
    /// No connection is opened until the first command.
    pub fn new(servers: Vec<String>) -> BackendResult<Self> {
        if servers.is_empty() {
            return Err(BackendError::storage(BACKEND, "no memcache servers configured"));
        }
        let servers = servers
            .into_iter()
            .map(|addr| Server {
                addr,
                connection: Mutex::new(None),
            })
            .collect();
        Ok(Self { servers })
    }

    fn server_for(&self, key: &str) -> &Server {
        &self.servers[server_index(key, self.servers.len())]
    }

    async fn connection(&self, key: &str) -> BackendResult<MutexGuard<'_, Option<MemcacheProtocol>>> {
        let server = self.server_for(key);
        let mut guard = server.connection.lock().await;
        if guard.is_none() {
            let stream = TcpStream::connect(&server.addr)
                .await
                .map_err(|err| BackendError::storage(BACKEND, err))?;
            debug!(addr = %server.addr, "memcache connection opened");
            *guard = Some(Protocol::new(stream.compat()));
        }
        Ok(guard)
    }
}

fn protocol(guard: &mut Option<MemcacheProtocol>) -> BackendResult<&mut MemcacheProtocol> {
    guard
        .as_mut()
        .ok_or_else(|| BackendError::storage(BACKEND, "connection unavailable"))
}

// 壊れた接続は次回張り直す
fn failed(guard: &mut Option<MemcacheProtocol>, err: io::Error) -> BackendError {
    *guard = None;
    BackendError::storage(BACKEND, err)
}

/// FNV-1a; stable across processes, unlike `DefaultHasher`.
fn server_index(key: &str, servers: usize) -> usize {
    let hash = key.bytes().fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    });
    (hash % servers as u64) as usize
}

/// Whole seconds, rounded up, at least 1.
fn expiration(ttl: Duration) -> u32 {
    let mut seconds = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        seconds += 1;
    }
    let seconds = seconds.max(1);
    let seconds = if seconds > MAX_RELATIVE_EXPIRATION {
        Utc::now().timestamp().unsigned_abs() + seconds
    } else {
        seconds
    };
    u32::try_from(seconds).unwrap_or(u32::MAX)
}

#[async_trait]
impl CacheClient for MemcacheClient {
    async fn get(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        let mut guard = self.connection(key).await?;
        let result = protocol(&mut guard)?.get(&key).await;
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(failed(&mut guard, err)),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> BackendResult<()> {
        let mut guard = self.connection(key).await?;
        let result = protocol(&mut guard)?.set(&key, value, expiration(ttl)).await;
        result.map_err(|err| failed(&mut guard, err))
    }

    async fn add(&self, key: &str, value: &[u8], ttl: Duration) -> BackendResult<bool> {
        let mut guard = self.connection(key).await?;
        let result = protocol(&mut guard)?.add(&key, value, expiration(ttl)).await;
        match result {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(failed(&mut guard, err)),
        }
    }

    // ASCII プロトコルの replace は使わず、同じ接続のロック内で get -> set
    async fn replace(&self, key: &str, value: &[u8], ttl: Duration) -> BackendResult<bool> {
        let mut guard = self.connection(key).await?;
        let existing = protocol(&mut guard)?.get(&key).await;
        match existing {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(failed(&mut guard, err)),
        }
        let result = protocol(&mut guard)?.set(&key, value, expiration(ttl)).await;
        result.map(|()| true).map_err(|err| failed(&mut guard, err))
    }

    async fn delete(&self, key: &str) -> BackendResult<bool> {
        let mut guard = self.connection(key).await?;
        let existing = protocol(&mut guard)?.get(&key).await;
        match existing {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(failed(&mut guard, err)),
        }
        let result = protocol(&mut guard)?.delete(&key).await;
        match result {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(failed(&mut guard, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_always_maps_to_the_same_server() {
        let first = server_index("group_01HX", 3);
        for _ in 0..10 {
            assert_eq!(server_index("group_01HX", 3), first);
        }
        assert!(first < 3);
        assert_eq!(server_index("anything", 1), 0);
    }

    #[test]
    fn expiration_rounds_up_to_whole_seconds() {
        assert_eq!(expiration(Duration::from_secs(3600)), 3600);
        assert_eq!(expiration(Duration::from_millis(1_500)), 2);
        assert_eq!(expiration(Duration::ZERO), 1);
    }

    #[test]
    fn long_expirations_become_absolute() {
        let ttl = Duration::from_secs(MAX_RELATIVE_EXPIRATION + 1);
        assert!(u64::from(expiration(ttl)) > MAX_RELATIVE_EXPIRATION * 2);
    }

    #[test]
    fn empty_server_list_is_rejected() {
        assert!(MemcacheClient::new(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn unreachable_server_is_a_storage_error() {
        let client = MemcacheClient::new(vec!["127.0.0.1:1".to_string()]).unwrap();
        let err = client.get("k").await.unwrap_err();
        assert!(matches!(err, BackendError::Storage { backend: "memcache", .. }));
    }
}
