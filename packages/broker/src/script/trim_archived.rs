use lazy_static::lazy_static;
use redis::aio::ConnectionLike;

use crate::error::BrokerError;

// KEYS[1] = archived zset
// ARGV[1] = max archive capacity, 0 = unlimited
// ARGV[2] = queue name, used to build evicted members' blob keys
//
// Evicts the oldest entries (lowest score = archive epoch) beyond capacity.
// Runs the same eviction `Archive` performs inline, so that lowering
// `archive_capacity` operationally is enforced retroactively on the next
// janitor tick rather than only on the next archive write. Returns the
// number evicted.
const SCRIPT_SRC: &str = r#"
local cap = tonumber(ARGV[1])
if cap <= 0 then
  return 0
end

local count = redis.call("ZCARD", KEYS[1])
if count <= cap then
  return 0
end

local overflow = count - cap
local victims = redis.call("ZRANGE", KEYS[1], 0, overflow - 1)
for _, vid in ipairs(victims) do
  redis.call("ZREM", KEYS[1], vid)
  local vkey = "{q:" .. ARGV[2] .. "}:t:" .. vid
  redis.call("DEL", vkey)
end

return #victims
"#;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(SCRIPT_SRC);
}

pub struct TrimArchivedScript;

impl TrimArchivedScript {
    pub async fn run<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        archived_key: &str,
        capacity: u64,
        queue: &str,
    ) -> Result<u64, BrokerError> {
        let evicted: u64 = SCRIPT
            .key(archived_key)
            .arg(capacity)
            .arg(queue)
            .invoke_async(conn)
            .await?;
        Ok(evicted)
    }
}
