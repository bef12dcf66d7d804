//! Capacity admission and connection-lifetime enforcement (§4.3).
//!
//! A connection is admitted only while the number of live sessions is
//! below `max_clients`; otherwise the caller is told how long it is
//! expected to wait. Every admitted connection is also subject to a
//! hard `max_connection_time`, enforced by periodically sweeping the
//! registry from the gateway's own background task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

/// Opaque per-connection identifier, distinct from a session's `uid`
/// (assigned before the handshake is even parsed).
pub type ConnId = u64;

struct AdmittedEntry {
    accepted_at: Instant,
    uid: String,
}

/// Tracks live connections against a capacity cap and a maximum
/// connection lifetime.
pub struct AdmissionRegistry {
    entries: DashMap<ConnId, AdmittedEntry>,
    admit_lock: Mutex<()>, // guards the check-then-insert below
    next_id: AtomicU64,
    max_clients: usize,
    max_connection_time: Duration,
}

/// Returned when the registry is at capacity; `wait_minutes` is an
/// estimate the client can display while it waits to retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Wait {
    pub wait_minutes: f64,
}

impl AdmissionRegistry {
    pub fn new(max_clients: usize, max_connection_time: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            admit_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            max_clients,
            max_connection_time,
        }
    }

    pub fn allocate_conn_id(&self) -> ConnId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Attempt to admit a connection. On success, registers the
    /// connection under `uid` for lifetime enforcement. On failure,
    /// returns an estimated wait.
    pub fn try_admit(&self, conn_id: ConnId, uid: &str) -> Result<(), Wait> {
        let _guard = self.admit_lock.lock();
        if self.entries.len() >= self.max_clients {
            return Err(Wait { wait_minutes: self.estimate_wait_minutes() });
        }
        self.entries.insert(conn_id, AdmittedEntry { accepted_at: Instant::now(), uid: uid.to_string() });
        Ok(())
    }

    pub fn remove(&self, conn_id: ConnId) {
        self.entries.remove(&conn_id);
    }

    pub fn active_count(&self) -> usize {
        self.entries.len()
    }

    /// Estimate how long a newly-queued client should expect to wait,
    /// based on the soonest connection to hit its own time limit.
    fn estimate_wait_minutes(&self) -> f64 {
        let now = Instant::now();
        let soonest = self
            .entries
            .iter()
            .map(|entry| {
                let elapsed = now.duration_since(entry.accepted_at);
                self.max_connection_time.saturating_sub(elapsed)
            })
            .min()
            .unwrap_or(Duration::ZERO);
        (soonest.as_secs_f64() / 60.0).max(0.0)
    }

    /// Connection ids that have exceeded `max_connection_time` and
    /// should be force-disconnected by the caller. Does not remove
    /// them: the caller removes the entry once it has actually torn
    /// the connection down (via `remove`).
    pub fn sweep_expired(&self) -> Vec<(ConnId, String)> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| now.duration_since(entry.accepted_at) >= self.max_connection_time)
            .map(|entry| (*entry.key(), entry.value().uid.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_capacity_then_waits() {
        let reg = AdmissionRegistry::new(2, Duration::from_secs(3600));
        assert!(reg.try_admit(1, "a").is_ok());
        assert!(reg.try_admit(2, "b").is_ok());
        let wait = reg.try_admit(3, "c");
        assert!(wait.is_err());
    }

    #[test]
    fn remove_frees_a_capacity_slot() {
        let reg = AdmissionRegistry::new(1, Duration::from_secs(3600));
        assert!(reg.try_admit(1, "a").is_ok());
        assert!(reg.try_admit(2, "b").is_err());
        reg.remove(1);
        assert!(reg.try_admit(2, "b").is_ok());
    }

    #[test]
    fn sweep_expired_is_empty_for_fresh_connections() {
        let reg = AdmissionRegistry::new(4, Duration::from_secs(3600));
        reg.try_admit(1, "a").unwrap();
        assert!(reg.sweep_expired().is_empty());
    }

    #[test]
    fn sweep_expired_finds_connections_past_the_limit() {
        let reg = AdmissionRegistry::new(4, Duration::from_millis(0));
        reg.try_admit(1, "a").unwrap();
        let expired = reg.sweep_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].1, "a");
    }
}
