//! Redis key layout.
//!
//! All keys for one queue share the `{q:<name>}` hash tag so a cluster
//! deployment keeps every key a queue's scripts touch on one shard, matching
//! the "all keys of a queue live on one node" non-goal boundary.

pub fn pending(queue: &str) -> String {
    format!("{{q:{queue}}}:pending")
}

pub fn active(queue: &str) -> String {
    format!("{{q:{queue}}}:active")
}

pub fn lease(queue: &str) -> String {
    format!("{{q:{queue}}}:lease")
}

pub fn scheduled(queue: &str) -> String {
    format!("{{q:{queue}}}:scheduled")
}

pub fn retry(queue: &str) -> String {
    format!("{{q:{queue}}}:retry")
}

pub fn archived(queue: &str) -> String {
    format!("{{q:{queue}}}:archived")
}

pub fn completed(queue: &str) -> String {
    format!("{{q:{queue}}}:completed")
}

pub fn paused(queue: &str) -> String {
    format!("{{q:{queue}}}:paused")
}

pub fn group(queue: &str, group: &str) -> String {
    format!("{{q:{queue}}}:groups:{group}")
}

pub fn groups_index(queue: &str) -> String {
    format!("{{q:{queue}}}:groups")
}

/// Task blob hash, tagged onto the same shard as its queue.
pub fn task(queue: &str, id: &str) -> String {
    format!("{{q:{queue}}}:t:{id}")
}

pub fn unique(queue: &str, hash: &str) -> String {
    format!("{{q:{queue}}}:unique:{hash}")
}

pub fn server(id: &str) -> String {
    format!("servers:{id}")
}

pub fn worker(id: &str) -> String {
    format!("workers:{id}")
}

pub fn cancel_channel() -> &'static str {
    "cancel"
}

pub fn cancel_message(task_id: &str) -> String {
    format!("cancel:{task_id}")
}

/// Strip the `cancel:` prefix off a pub/sub payload, if present.
pub fn parse_cancel_message(payload: &str) -> Option<&str> {
    payload.strip_prefix("cancel:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_tags_keep_a_queues_keys_together() {
        assert_eq!(pending("default"), "{q:default}:pending");
        assert_eq!(task("default", "A"), "{q:default}:t:A");
    }

    #[test]
    fn cancel_message_round_trips() {
        let msg = cancel_message("A");
        assert_eq!(parse_cancel_message(&msg), Some("A"));
        assert_eq!(parse_cancel_message("garbage"), None);
    }
}
