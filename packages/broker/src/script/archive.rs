use lazy_static::lazy_static;
use redis::aio::ConnectionLike;

use crate::error::BrokerError;

// KEYS[1] = active list
// KEYS[2] = lease zset
// KEYS[3] = archived zset
// KEYS[4] = task blob key
// ARGV[1] = task id
// ARGV[2] = archive-at score (epoch seconds)
// ARGV[3] = updated task blob (retried/last_err/last_failed_at set)
// ARGV[4] = max archive capacity, 0 = unlimited
// ARGV[5] = queue name, used to build evicted members' blob keys
// ARGV[6] = now (epoch seconds)
// ARGV[7] = "1" to skip the ownership check below (the recoverer's own
//           deadline-exceeded archival, which by construction only ever
//           targets a lease that has already passed); "0" for the normal
//           settle path.
//
// A lease score <= now is treated as expired even if the recoverer has not
// swept it yet, matching DoneScript's ownership check — unless ARGV[7]
// opts out of that check.
//
// Returns: 0 = ok, 1 = LeaseExpired. Oldest entries (lowest score) are
// evicted first once the archive exceeds capacity.
const SCRIPT_SRC: &str = r#"
local score = redis.call("ZSCORE", KEYS[2], ARGV[1])
if not score then
  return 1
end
if ARGV[7] ~= "1" and tonumber(score) <= tonumber(ARGV[6]) then
  return 1
end

redis.call("LREM", KEYS[1], 0, ARGV[1])
redis.call("ZREM", KEYS[2], ARGV[1])
redis.call("SET", KEYS[4], ARGV[3])
redis.call("ZADD", KEYS[3], ARGV[2], ARGV[1])

local cap = tonumber(ARGV[4])
if cap > 0 then
  local count = redis.call("ZCARD", KEYS[3])
  if count > cap then
    local overflow = count - cap
    local victims = redis.call("ZRANGE", KEYS[3], 0, overflow - 1)
    for _, vid in ipairs(victims) do
      redis.call("ZREM", KEYS[3], vid)
      local vkey = "{q:" .. ARGV[5] .. "}:t:" .. vid
      redis.call("DEL", vkey)
    end
  end
end

return 0
"#;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(SCRIPT_SRC);
}

pub struct ArchiveScript;

impl ArchiveScript {
    #[allow(clippy::too_many_arguments)]
    pub async fn run<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        active_key: &str,
        lease_key: &str,
        archived_key: &str,
        task_key: &str,
        id: &str,
        archive_at: i64,
        blob: &[u8],
        capacity: u64,
        queue: &str,
        now: i64,
        force: bool,
    ) -> Result<(), BrokerError> {
        let code: i64 = SCRIPT
            .key(active_key)
            .key(lease_key)
            .key(archived_key)
            .key(task_key)
            .arg(id)
            .arg(archive_at)
            .arg(blob)
            .arg(capacity)
            .arg(queue)
            .arg(now)
            .arg(if force { "1" } else { "0" })
            .invoke_async(conn)
            .await?;

        match code {
            0 => Ok(()),
            1 => Err(BrokerError::LeaseExpired {
                id: id.to_string(),
                expected: now,
            }),
            other => Err(BrokerError::Protocol(format!(
                "archive: unexpected status {other}"
            ))),
        }
    }
}
