//! Instance registry helpers (C4, §4.4): pure selection logic over the
//! instance map. Kept separate from the dispatcher's I/O-driving code so the
//! eviction/TTL rules are unit-testable without spawning any processes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::instance::{Instance, InstanceKey};

/// Choose the eviction victim when admission needs to make room (§4.4):
/// among detached instances, the least-recently-used; if none are
/// detached, the overall least-recently-used (see scenario 6 in the
/// spec — capacity pressure can evict an attached instance too; its
/// sessions are notified and dropped by the caller, never silently lost).
#[must_use]
pub fn select_eviction_victim(instances: &HashMap<InstanceKey, Instance>) -> Option<InstanceKey> {
    instances
        .iter()
        .filter(|(_, inst)| inst.clients.is_empty())
        .min_by_key(|(_, inst)| inst.last_used_at)
        .or_else(|| instances.iter().min_by_key(|(_, inst)| inst.last_used_at))
        .map(|(key, _)| key.clone())
}

/// Keys whose instances are detached and have been idle past `idle_eviction`
/// as of `now` (§4.4 TTL sweep).
#[must_use]
pub fn ttl_expired_keys(
    instances: &HashMap<InstanceKey, Instance>,
    idle_eviction: Duration,
    now: Instant,
) -> Vec<InstanceKey> {
    instances
        .iter()
        .filter(|(_, inst)| inst.clients.is_empty() && now.duration_since(inst.last_used_at) > idle_eviction)
        .map(|(key, _)| key.clone())
        .collect()
}
