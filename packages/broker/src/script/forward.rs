use lazy_static::lazy_static;
use redis::aio::ConnectionLike;

use crate::error::BrokerError;

// KEYS[1] = scheduled zset
// KEYS[2] = retry zset
// KEYS[3] = pending list
// ARGV[1] = now (epoch seconds)
//
// Promotes every entry in `scheduled` and `retry` whose score is <= now onto
// the tail of `pending`, in score order. Returns the number promoted.
const SCRIPT_SRC: &str = r#"
local function promote(zkey)
  local ids = redis.call("ZRANGEBYSCORE", zkey, "-inf", ARGV[1])
  if #ids > 0 then
    redis.call("ZREMRANGEBYSCORE", zkey, "-inf", ARGV[1])
    for _, id in ipairs(ids) do
      redis.call("RPUSH", KEYS[3], id)
    end
  end
  return #ids
end

local n1 = promote(KEYS[1])
local n2 = promote(KEYS[2])
return n1 + n2
"#;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(SCRIPT_SRC);
}

pub struct ForwardScript;

impl ForwardScript {
    pub async fn run<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        scheduled_key: &str,
        retry_key: &str,
        pending_key: &str,
        now: i64,
    ) -> Result<u64, BrokerError> {
        let promoted: u64 = SCRIPT
            .key(scheduled_key)
            .key(retry_key)
            .key(pending_key)
            .arg(now)
            .invoke_async(conn)
            .await?;

        Ok(promoted)
    }
}
