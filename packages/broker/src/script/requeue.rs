use lazy_static::lazy_static;
use redis::aio::ConnectionLike;

use crate::error::BrokerError;

// KEYS[1] = active list
// KEYS[2] = lease zset
// KEYS[3] = pending list
// ARGV[1] = task id
//
// Moves the id back to the head of `pending`, preserving its `retried`
// counter (recovery does not consume a retry). No-op if the id is no longer
// in `active`.
const SCRIPT_SRC: &str = r#"
if redis.call("LREM", KEYS[1], 0, ARGV[1]) > 0 then
  redis.call("ZREM", KEYS[2], ARGV[1])
  redis.call("LPUSH", KEYS[3], ARGV[1])
end
return 0
"#;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(SCRIPT_SRC);
}

pub struct RequeueScript;

impl RequeueScript {
    pub async fn run<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        active_key: &str,
        lease_key: &str,
        pending_key: &str,
        id: &str,
    ) -> Result<(), BrokerError> {
        let _: i64 = SCRIPT
            .key(active_key)
            .key(lease_key)
            .key(pending_key)
            .arg(id)
            .invoke_async(conn)
            .await?;

        Ok(())
    }
}
