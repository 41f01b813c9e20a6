use lazy_static::lazy_static;
use redis::aio::ConnectionLike;
use redis::{FromRedisValue, RedisResult, Value};

use crate::error::BrokerError;

// KEYS[1] = pending list
// KEYS[2] = active list
// KEYS[3] = lease zset
// KEYS[4] = paused flag key
// ARGV[1] = queue name (used to build the popped task's blob key)
// ARGV[2] = lease expiry (epoch seconds)
//
// Returns: false if the queue is paused or empty, else {id, blob}.
const SCRIPT_SRC: &str = r#"
if redis.call("EXISTS", KEYS[4]) == 1 then
  return false
end

local id = redis.call("LPOP", KEYS[1])
if not id then
  return false
end

redis.call("RPUSH", KEYS[2], id)
redis.call("ZADD", KEYS[3], ARGV[2], id)

local blob_key = "{q:" .. ARGV[1] .. "}:t:" .. id
local blob = redis.call("GET", blob_key)
return {id, blob}
"#;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(SCRIPT_SRC);
}

/// A task popped off `pending` and moved into `active` with a fresh lease.
pub struct Dequeued {
    pub id: String,
    pub blob: Vec<u8>,
}

impl FromRedisValue for Dequeued {
    fn from_redis_value(v: &Value) -> RedisResult<Self> {
        let (id, blob): (String, Vec<u8>) = FromRedisValue::from_redis_value(v)?;
        Ok(Dequeued { id, blob })
    }
}

pub struct DequeueScript;

impl DequeueScript {
    pub async fn run<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        pending_key: &str,
        active_key: &str,
        lease_key: &str,
        paused_key: &str,
        queue: &str,
        lease_expiry: i64,
    ) -> Result<Option<Dequeued>, BrokerError> {
        let reply: Option<Dequeued> = SCRIPT
            .key(pending_key)
            .key(active_key)
            .key(lease_key)
            .key(paused_key)
            .arg(queue)
            .arg(lease_expiry)
            .invoke_async(conn)
            .await?;

        Ok(reply)
    }
}
