//! Redis-backed coordination store.
//!
//! Each bucket is a hash with two fields, `tokens` and `ts`. The whole
//! transition runs as a Lua script, so Redis serializes concurrent callers
//! and a single round trip both decides and refreshes the key's expiry.

use std::fmt;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{BucketRequest, CoordinationStore, StoreError};

/// KEYS[1] = bucket key
/// ARGV = capacity, rate (tokens/s), now (ms), ttl (s)
const TOKEN_BUCKET_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = capacity
  ts = now
end

local elapsed = math.max(0, now - ts)
tokens = math.min(capacity, tokens + elapsed * rate / 1000)

local allowed = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', tostring(math.max(ts, now)))
redis.call('EXPIRE', KEYS[1], ttl)
return allowed
"#;

/// Coordination store backed by a Redis server.
///
/// The connection is established on first use, so an unreachable server
/// never fails construction; each call retries the connection until it
/// succeeds. Once connected, the `ConnectionManager` multiplexes all callers
/// over one connection and reconnects on its own.
pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    script: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("connected", &self.connection.initialized())
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Create a store for the given Redis URL without connecting.
    ///
    /// # Errors
    /// Returns an error if the URL cannot be parsed.
    pub fn new(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            script: Script::new(TOKEN_BUCKET_SCRIPT),
        })
    }

    /// Create a store and connect immediately.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let store = Self::new(url)?;
        store.connection().await?;
        info!("Connected to Redis coordination store");
        Ok(store)
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                debug!("Opening Redis connection");
                ConnectionManager::new(self.client.clone()).await
            })
            .await?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn acquire(&self, request: &BucketRequest<'_>) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;

        let allowed: i64 = self
            .script
            .key(request.key)
            .arg(request.capacity)
            .arg(request.rate)
            .arg(request.now_ms)
            .arg(request.ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;

        match allowed {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(StoreError::Protocol(format!(
                "token bucket script returned {}",
                other
            ))),
        }
    }
}
