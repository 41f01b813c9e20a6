use lazy_static::lazy_static;
use redis::aio::ConnectionLike;

use crate::error::BrokerError;

// KEYS[1] = group zset (groups:<group>)
// KEYS[2] = groups index set
// KEYS[3] = pending list
// KEYS[4] = new aggregated task's blob key
// ARGV[1] = group name
// ARGV[2] = queue name, used to build each folded member's blob key
// ARGV[3] = new aggregated task id
// ARGV[4] = new aggregated task blob
// ARGV[5] = member count N
// ARGV[6..6+N-1] = member ids being folded into the aggregated task
// ARGV[6+N..6+2N-1] = each member's unique lock key, aligned by position,
//                      or "" if that member was not enqueued with one
//
// Removes the folded members from the group (deleting their blobs and
// releasing any unique lock they held, since an aggregating member no
// longer occupies that state once folded) and enqueues the new aggregated
// task to `pending`. Drops the group from the index once it is empty.
const SCRIPT_SRC: &str = r#"
redis.call("SET", KEYS[4], ARGV[4])
redis.call("RPUSH", KEYS[3], ARGV[3])

local n = tonumber(ARGV[5])
for i = 1, n do
  local member = ARGV[5 + i]
  redis.call("ZREM", KEYS[1], member)
  local member_key = "{q:" .. ARGV[2] .. "}:t:" .. member
  redis.call("DEL", member_key)
  local unique_key = ARGV[5 + n + i]
  if unique_key ~= "" then
    redis.call("DEL", unique_key)
  end
end

if redis.call("ZCARD", KEYS[1]) == 0 then
  redis.call("SREM", KEYS[2], ARGV[1])
end

return 0
"#;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(SCRIPT_SRC);
}

pub struct CommitAggregationScript;

impl CommitAggregationScript {
    #[allow(clippy::too_many_arguments)]
    pub async fn run<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        group_key: &str,
        groups_index_key: &str,
        pending_key: &str,
        new_task_key: &str,
        group: &str,
        queue: &str,
        new_id: &str,
        new_blob: &[u8],
        members: &[(String, String)],
    ) -> Result<(), BrokerError> {
        let mut invocation = SCRIPT
            .key(group_key)
            .key(groups_index_key)
            .key(pending_key)
            .key(new_task_key)
            .arg(group)
            .arg(queue)
            .arg(new_id)
            .arg(new_blob)
            .arg(members.len());

        for (id, _) in members {
            invocation = invocation.arg(id);
        }
        for (_, unique_key) in members {
            invocation = invocation.arg(unique_key);
        }

        let _: i64 = invocation.invoke_async(conn).await?;
        Ok(())
    }
}
