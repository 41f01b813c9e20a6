use lazy_static::lazy_static;
use redis::aio::ConnectionLike;

use crate::error::BrokerError;

// KEYS[1] = lease zset
// ARGV[1] = cutoff (epoch seconds)
//
// Returns ids whose lease score is <= cutoff. Read-only; callers requeue
// each id via RequeueScript (or archive it directly if its deadline has
// also passed).
const SCRIPT_SRC: &str = r#"
return redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1])
"#;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(SCRIPT_SRC);
}

pub struct ListLeaseExpiredScript;

impl ListLeaseExpiredScript {
    pub async fn run<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        lease_key: &str,
        cutoff: i64,
    ) -> Result<Vec<String>, BrokerError> {
        let ids: Vec<String> = SCRIPT.key(lease_key).arg(cutoff).invoke_async(conn).await?;
        Ok(ids)
    }
}
