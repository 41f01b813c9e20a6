use lazy_static::lazy_static;
use redis::aio::ConnectionLike;

use crate::error::BrokerError;

// KEYS[1] = group zset (groups:<group>)
// KEYS[2] = groups index set (tracks which group names are currently active)
// KEYS[3] = task blob key
// KEYS[4] = unique lock key (unique:<queue>:<hash>); unused when ARGV[5] == "0"
// ARGV[1] = task id
// ARGV[2] = now (epoch seconds, used as the group membership score)
// ARGV[3] = group name
// ARGV[4] = encoded task blob
// ARGV[5] = "1" if a unique key is set, else "0"
// ARGV[6] = unique ttl in seconds
//
// Returns: 0 = ok, 2 = DuplicateUnique. A task entering the aggregating
// state holds its unique lock exactly the way Enqueue does, so invariant 5
// (unique:<key> exists iff a task with that key is pending|active|
// scheduled|retry|aggregating) holds across the group path too.
const SCRIPT_SRC: &str = r#"
if ARGV[5] == "1" then
  if redis.call("EXISTS", KEYS[4]) == 1 then
    return 2
  end
  redis.call("SET", KEYS[4], ARGV[1], "EX", ARGV[6])
end

redis.call("SET", KEYS[3], ARGV[4])
redis.call("ZADD", KEYS[1], ARGV[2], ARGV[1])
redis.call("SADD", KEYS[2], ARGV[3])
return 0
"#;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(SCRIPT_SRC);
}

pub struct AddToGroupScript;

impl AddToGroupScript {
    #[allow(clippy::too_many_arguments)]
    pub async fn run<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        group_key: &str,
        groups_index_key: &str,
        task_key: &str,
        unique_key: &str,
        id: &str,
        now: i64,
        group: &str,
        blob: &[u8],
        unique_ttl: Option<u64>,
    ) -> Result<(), BrokerError> {
        let (has_unique, ttl) = match unique_ttl {
            Some(ttl) => ("1", ttl),
            None => ("0", 0),
        };

        let code: i64 = SCRIPT
            .key(group_key)
            .key(groups_index_key)
            .key(task_key)
            .key(unique_key)
            .arg(id)
            .arg(now)
            .arg(group)
            .arg(blob)
            .arg(has_unique)
            .arg(ttl)
            .invoke_async(conn)
            .await?;

        match code {
            0 => Ok(()),
            2 => Err(BrokerError::DuplicateUnique {
                key: unique_key.to_string(),
            }),
            other => Err(BrokerError::Protocol(format!(
                "add_to_group: unexpected status {other}"
            ))),
        }
    }
}
