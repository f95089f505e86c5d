use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use redis::aio::MultiplexedConnection;

use super::{SharedStore, StoreError, StoreResult};

/// Counter bump and first-write TTL in one atomic script.
const INCR_WINDOW: &str = r#"
local v = redis.call('INCRBY', KEYS[1], ARGV[1])
if tonumber(v) == tonumber(ARGV[1]) then
  redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return v
"#;

/// Compare-and-set on the raw serialized value. An empty expected string
/// means "key must be absent" (stored values are JSON/ints, never empty).
const COMPARE_AND_SWAP: &str = r#"
local current = redis.call('GET', KEYS[1])
if (current == false and ARGV[1] == '') or current == ARGV[1] then
  if ARGV[3] == '' then
    redis.call('SET', KEYS[1], ARGV[2])
  else
    redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
  end
  return 1
end
return 0
"#;

/// Redis-backed shared store used by every multi-process deployment.
pub struct RedisStore {
    conn: MultiplexedConnection,
    incr_window: Script,
    compare_and_swap: Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        tracing::info!("connecting to shared store");
        let client =
            redis::Client::open(url).map_err(|err| StoreError::Connection(err.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| StoreError::Connection(err.to_string()))?;

        let store = Self {
            conn,
            incr_window: Script::new(INCR_WINDOW),
            compare_and_swap: Script::new(COMPARE_AND_SWAP),
        };
        store.ping().await?;
        tracing::info!("shared store connection established");
        Ok(store)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|err| StoreError::Command(err.to_string()))?;
        if pong != "PONG" {
            return Err(StoreError::Command(format!(
                "unexpected PING response: {pong}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn incr_window(&self, key: &str, amount: i64, ttl: Duration) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        self.incr_window
            .key(key)
            .arg(amount)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|err| StoreError::Command(err.to_string()))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| StoreError::Command(err.to_string()))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .compare_and_swap
            .key(key)
            .arg(expected.unwrap_or(""))
            .arg(value)
            .arg(ttl.map(|ttl| ttl.as_secs().max(1).to_string()).unwrap_or_default())
            .invoke_async(&mut conn)
            .await
            .map_err(|err| StoreError::Command(err.to_string()))?;
        Ok(swapped == 1)
    }
}
