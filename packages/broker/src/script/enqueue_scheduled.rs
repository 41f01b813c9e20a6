use lazy_static::lazy_static;
use redis::aio::ConnectionLike;

use crate::error::BrokerError;

// KEYS[1] = scheduled zset
// KEYS[2] = task blob key
// KEYS[3] = unique lock key; unused when ARGV[4] == "0"
// ARGV[1] = task id
// ARGV[2] = encoded task blob
// ARGV[3] = process-at score (epoch seconds)
// ARGV[4] = "1" if a unique key is set, else "0"
// ARGV[5] = unique ttl in seconds
//
// Returns: 0 = ok, 1 = TaskIdConflict, 2 = DuplicateUnique
const SCRIPT_SRC: &str = r#"
if redis.call("EXISTS", KEYS[2]) == 1 then
  return 1
end

if ARGV[4] == "1" then
  if redis.call("EXISTS", KEYS[3]) == 1 then
    return 2
  end
  redis.call("SET", KEYS[3], ARGV[1], "EX", ARGV[5])
end

redis.call("SET", KEYS[2], ARGV[2])
redis.call("ZADD", KEYS[1], ARGV[3], ARGV[1])
return 0
"#;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(SCRIPT_SRC);
}

pub struct EnqueueScheduledScript;

impl EnqueueScheduledScript {
    #[allow(clippy::too_many_arguments)]
    pub async fn run<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        scheduled_key: &str,
        task_key: &str,
        unique_key: &str,
        id: &str,
        blob: &[u8],
        process_at: i64,
        unique_ttl: Option<u64>,
    ) -> Result<(), BrokerError> {
        let (has_unique, ttl) = match unique_ttl {
            Some(ttl) => ("1", ttl),
            None => ("0", 0),
        };

        let code: i64 = SCRIPT
            .key(scheduled_key)
            .key(task_key)
            .key(unique_key)
            .arg(id)
            .arg(blob)
            .arg(process_at)
            .arg(has_unique)
            .arg(ttl)
            .invoke_async(conn)
            .await?;

        match code {
            0 => Ok(()),
            1 => Err(BrokerError::TaskIdConflict { id: id.to_string() }),
            2 => Err(BrokerError::DuplicateUnique {
                key: unique_key.to_string(),
            }),
            other => Err(BrokerError::Protocol(format!(
                "enqueue_scheduled: unexpected status {other}"
            ))),
        }
    }
}
