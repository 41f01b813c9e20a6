use lazy_static::lazy_static;
use redis::aio::ConnectionLike;

use crate::error::BrokerError;

// KEYS[1] = active list
// KEYS[2] = lease zset
// KEYS[3] = retry zset
// KEYS[4] = task blob key
// ARGV[1] = task id
// ARGV[2] = retry-at score (epoch seconds)
// ARGV[3] = updated task blob (retried incremented, last_err/last_failed_at set)
// ARGV[4] = now (epoch seconds)
//
// A lease score <= now is treated as expired even if the recoverer has not
// swept it yet, matching DoneScript's ownership check.
//
// Returns: 0 = ok, 1 = LeaseExpired
const SCRIPT_SRC: &str = r#"
local score = redis.call("ZSCORE", KEYS[2], ARGV[1])
if not score or tonumber(score) <= tonumber(ARGV[4]) then
  return 1
end

redis.call("LREM", KEYS[1], 0, ARGV[1])
redis.call("ZREM", KEYS[2], ARGV[1])
redis.call("SET", KEYS[4], ARGV[3])
redis.call("ZADD", KEYS[3], ARGV[2], ARGV[1])
return 0
"#;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(SCRIPT_SRC);
}

pub struct RetryScript;

impl RetryScript {
    pub async fn run<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        active_key: &str,
        lease_key: &str,
        retry_key: &str,
        task_key: &str,
        id: &str,
        retry_at: i64,
        blob: &[u8],
        now: i64,
    ) -> Result<(), BrokerError> {
        let code: i64 = SCRIPT
            .key(active_key)
            .key(lease_key)
            .key(retry_key)
            .key(task_key)
            .arg(id)
            .arg(retry_at)
            .arg(blob)
            .arg(now)
            .invoke_async(conn)
            .await?;

        match code {
            0 => Ok(()),
            1 => Err(BrokerError::LeaseExpired {
                id: id.to_string(),
                expected: now,
            }),
            other => Err(BrokerError::Protocol(format!(
                "retry: unexpected status {other}"
            ))),
        }
    }
}
