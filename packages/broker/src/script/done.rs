use lazy_static::lazy_static;
use redis::aio::ConnectionLike;

use crate::error::BrokerError;

// KEYS[1] = active list
// KEYS[2] = lease zset
// KEYS[3] = completed zset
// KEYS[4] = task blob key
// KEYS[5] = unique lock key; only deleted when ARGV[4] == "1"
// ARGV[1] = task id
// ARGV[2] = "1" to retain in `completed`, else "0" to delete the blob outright
// ARGV[3] = completed-at + retention score (only meaningful when ARGV[2] == "1")
// ARGV[4] = "1" if a unique key was held and must be released
// ARGV[5] = updated task blob to persist when retaining (result/completed_at set)
// ARGV[6] = now (epoch seconds)
//
// A lease score <= now is treated the same as an absent one: the recoverer
// may not have swept it yet, but it is no longer safe to consider this
// caller the owner, since the task is eligible to be (or already was)
// requeued to another worker.
//
// Returns: 0 = ok, 1 = LeaseExpired
const SCRIPT_SRC: &str = r#"
local score = redis.call("ZSCORE", KEYS[2], ARGV[1])
if not score or tonumber(score) <= tonumber(ARGV[6]) then
  return 1
end

redis.call("LREM", KEYS[1], 0, ARGV[1])
redis.call("ZREM", KEYS[2], ARGV[1])

if ARGV[4] == "1" then
  redis.call("DEL", KEYS[5])
end

if ARGV[2] == "1" then
  redis.call("SET", KEYS[4], ARGV[5])
  redis.call("ZADD", KEYS[3], ARGV[3], ARGV[1])
else
  redis.call("DEL", KEYS[4])
end

return 0
"#;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(SCRIPT_SRC);
}

pub struct DoneScript;

impl DoneScript {
    #[allow(clippy::too_many_arguments)]
    pub async fn run<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        active_key: &str,
        lease_key: &str,
        completed_key: &str,
        task_key: &str,
        unique_key: &str,
        id: &str,
        retain: Option<(i64, &[u8])>,
        release_unique: bool,
        now: i64,
    ) -> Result<(), BrokerError> {
        let (retain_flag, score, blob): (&str, i64, &[u8]) = match retain {
            Some((score, blob)) => ("1", score, blob),
            None => ("0", 0, &[]),
        };

        let code: i64 = SCRIPT
            .key(active_key)
            .key(lease_key)
            .key(completed_key)
            .key(task_key)
            .key(unique_key)
            .arg(id)
            .arg(retain_flag)
            .arg(score)
            .arg(if release_unique { "1" } else { "0" })
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
                "done: unexpected status {other}"
            ))),
        }
    }
}
