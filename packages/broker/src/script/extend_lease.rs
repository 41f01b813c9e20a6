use lazy_static::lazy_static;
use redis::aio::ConnectionLike;

use crate::error::BrokerError;

// KEYS[1] = lease zset
// ARGV[1] = new expiry (epoch seconds)
// ARGV[2..] = task ids to extend
//
// Only ids still present in the lease zset are updated (an absent id means
// the task was already settled or recovered elsewhere). Returns the count
// actually extended.
const SCRIPT_SRC: &str = r#"
local new_expiry = ARGV[1]
local updated = 0
for i = 2, #ARGV do
  local id = ARGV[i]
  if redis.call("ZSCORE", KEYS[1], id) then
    redis.call("ZADD", KEYS[1], new_expiry, id)
    updated = updated + 1
  end
end
return updated
"#;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(SCRIPT_SRC);
}

pub struct ExtendLeaseScript;

impl ExtendLeaseScript {
    pub async fn run<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        lease_key: &str,
        new_expiry: i64,
        ids: &[String],
    ) -> Result<u64, BrokerError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut invocation = SCRIPT.key(lease_key).arg(new_expiry);
        for id in ids {
            invocation = invocation.arg(id);
        }

        let extended: u64 = invocation.invoke_async(conn).await?;
        Ok(extended)
    }
}
