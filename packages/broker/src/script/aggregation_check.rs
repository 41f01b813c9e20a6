use lazy_static::lazy_static;
use redis::aio::ConnectionLike;

use crate::error::BrokerError;

// KEYS[1] = group zset (groups:<group>)
// ARGV[1] = max_size (0 = disabled)
// ARGV[2] = max_delay, gap tolerated since the oldest member (0 = disabled)
// ARGV[3] = grace_period, gap tolerated since the newest member (0 = disabled)
// ARGV[4] = now (epoch seconds)
//
// Read-only decision: returns an empty array if the group should not yet be
// flushed, else every member id (oldest first). The caller combines the
// members with the user's `GroupAggregator` and commits the result with
// `CommitAggregationScript` — the aggregation function itself cannot run
// inside Lua, so this is intentionally a two-step protocol.
const SCRIPT_SRC: &str = r#"
local count = redis.call("ZCARD", KEYS[1])
if count == 0 then
  return {}
end

local max_size = tonumber(ARGV[1])
local max_delay = tonumber(ARGV[2])
local grace_period = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local trigger = false

if max_size > 0 and count >= max_size then
  trigger = true
end

if not trigger and max_delay > 0 then
  local oldest = redis.call("ZRANGE", KEYS[1], 0, 0, "WITHSCORES")
  if #oldest > 0 and (now - tonumber(oldest[2])) >= max_delay then
    trigger = true
  end
end

if not trigger and grace_period > 0 then
  local newest = redis.call("ZRANGE", KEYS[1], -1, -1, "WITHSCORES")
  if #newest > 0 and (now - tonumber(newest[2])) >= grace_period then
    trigger = true
  end
end

if not trigger then
  return {}
end

return redis.call("ZRANGE", KEYS[1], 0, -1)
"#;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(SCRIPT_SRC);
}

pub struct AggregationCheckScript;

pub struct GroupPolicy {
    pub max_size: u64,
    pub max_delay: u64,
    pub grace_period: u64,
}

impl AggregationCheckScript {
    pub async fn run<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        group_key: &str,
        policy: &GroupPolicy,
        now: i64,
    ) -> Result<Vec<String>, BrokerError> {
        let members: Vec<String> = SCRIPT
            .key(group_key)
            .arg(policy.max_size)
            .arg(policy.max_delay)
            .arg(policy.grace_period)
            .arg(now)
            .invoke_async(conn)
            .await?;

        Ok(members)
    }
}
