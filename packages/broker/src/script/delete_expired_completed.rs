use lazy_static::lazy_static;
use redis::aio::ConnectionLike;

use crate::error::BrokerError;

// KEYS[1] = completed zset
// ARGV[1] = now (epoch seconds)
// ARGV[2] = queue name, used to build each expired member's blob key
// ARGV[3] = batch size, 0 = unlimited
//
// Deletes every completed entry whose retention deadline (the score) has
// passed, along with its blob. Returns the number reaped.
const SCRIPT_SRC: &str = r#"
local limit = tonumber(ARGV[3])
local ids
if limit > 0 then
  ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, limit)
else
  ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1])
end

for _, id in ipairs(ids) do
  redis.call("ZREM", KEYS[1], id)
  local key = "{q:" .. ARGV[2] .. "}:t:" .. id
  redis.call("DEL", key)
end

return #ids
"#;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(SCRIPT_SRC);
}

pub struct DeleteExpiredCompletedScript;

impl DeleteExpiredCompletedScript {
    pub async fn run<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        completed_key: &str,
        now: i64,
        queue: &str,
        batch_size: u64,
    ) -> Result<u64, BrokerError> {
        let reaped: u64 = SCRIPT
            .key(completed_key)
            .arg(now)
            .arg(queue)
            .arg(batch_size)
            .invoke_async(conn)
            .await?;

        Ok(reaped)
    }
}
