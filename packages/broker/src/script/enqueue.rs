use lazy_static::lazy_static;
use redis::aio::ConnectionLike;

use crate::error::BrokerError;

// KEYS[1] = pending list
// KEYS[2] = task blob key (t:<id>)
// KEYS[3] = unique lock key (unique:<queue>:<hash>); unused when ARGV[3] == "0"
// ARGV[1] = task id
// ARGV[2] = encoded task blob
// ARGV[3] = "1" if a unique key is set, else "0"
// ARGV[4] = unique ttl in seconds
//
// Returns: 0 = ok, 1 = TaskIdConflict, 2 = DuplicateUnique
const ENQUEUE_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[2]) == 1 then
  return 1
end

if ARGV[3] == "1" then
  if redis.call("EXISTS", KEYS[3]) == 1 then
    return 2
  end
  redis.call("SET", KEYS[3], ARGV[1], "EX", ARGV[4])
end

redis.call("SET", KEYS[2], ARGV[2])
redis.call("RPUSH", KEYS[1], ARGV[1])
return 0
"#;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(ENQUEUE_SCRIPT);
}

pub struct EnqueueScript;

impl EnqueueScript {
    #[allow(clippy::too_many_arguments)]
    pub async fn run<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        pending_key: &str,
        task_key: &str,
        unique_key: &str,
        id: &str,
        blob: &[u8],
        unique_ttl: Option<u64>,
    ) -> Result<(), BrokerError> {
        let (has_unique, ttl) = match unique_ttl {
            Some(ttl) => ("1", ttl),
            None => ("0", 0),
        };

        let code: i64 = SCRIPT
            .key(pending_key)
            .key(task_key)
            .key(unique_key)
            .arg(id)
            .arg(blob)
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
                "enqueue: unexpected status {other}"
            ))),
        }
    }
}
