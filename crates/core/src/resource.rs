//! Port resource management.
//!
//! Every server-side port a session binds (per-session RTCP) and every
//! client port recorded on a session is leased from a single [`PortPool`].
//! A lease is returned exactly once, when the session is destroyed or when
//! its client port is replaced.

use std::collections::{HashMap, VecDeque};
use std::ops::RangeInclusive;

use parking_lot::Mutex;

use crate::error::{RelayError, Result};

/// Finite pool of port numbers drawn from a fixed range.
///
/// Free ports are handed out in FIFO order, so a just-restored port goes to
/// the back of the queue and is not immediately reused. All operations
/// serialize on one internal mutex.
#[derive(Debug)]
pub struct PortPool {
    range: RangeInclusive<u16>,
    inner: Mutex<PoolState>,
}

#[derive(Debug, Default)]
struct PoolState {
    free: VecDeque<u16>,
    /// Allocated port -> owning unit id.
    allocated: HashMap<u16, String>,
}

impl PortPool {
    /// Create a pool covering `range`. Port 0 is never handed out.
    pub fn new(range: RangeInclusive<u16>) -> Self {
        let start = (*range.start()).max(1);
        let end = *range.end();
        let free: VecDeque<u16> = if start <= end {
            (start..=end).collect()
        } else {
            VecDeque::new()
        };

        tracing::debug!(start, end, capacity = free.len(), "port pool created");

        Self {
            range: start..=end,
            inner: Mutex::new(PoolState {
                free,
                allocated: HashMap::new(),
            }),
        }
    }

    /// Lease the next free port to `owner`.
    ///
    /// Returns [`RelayError::PortPoolExhausted`] when nothing is free.
    pub fn allocate(&self, owner: &str) -> Result<u16> {
        let mut state = self.inner.lock();
        let port = state.free.pop_front().ok_or(RelayError::PortPoolExhausted)?;
        state.allocated.insert(port, owner.to_string());
        tracing::trace!(port, owner, free = state.free.len(), "port allocated");
        Ok(port)
    }

    /// Record a specific, peer-chosen port as leased to `owner`.
    ///
    /// Returns `Ok(true)` when the port is now tracked by the pool and
    /// `Ok(false)` when it lies outside the managed range (accepted, untracked).
    /// A port that is already leased is refused whoever holds it: one owner
    /// may hold several leases (RTCP and client port), and each must be
    /// restored on its own.
    pub fn claim(&self, port: u16, owner: &str) -> Result<bool> {
        if port == 0 {
            return Err(RelayError::InvalidPort(port));
        }
        if !self.range.contains(&port) {
            tracing::trace!(port, owner, "port outside managed range, not tracked");
            return Ok(false);
        }

        let mut state = self.inner.lock();
        if let Some(current) = state.allocated.get(&port) {
            return Err(RelayError::PortInUse {
                port,
                owner: current.clone(),
            });
        }

        if let Some(pos) = state.free.iter().position(|p| *p == port) {
            state.free.remove(pos);
        }
        state.allocated.insert(port, owner.to_string());
        tracing::trace!(port, owner, free = state.free.len(), "port claimed");
        Ok(true)
    }

    /// Return a leased port to the pool.
    ///
    /// Restoring a port that is not currently leased is a no-op and returns
    /// `false`, so racing releases are harmless.
    pub fn restore(&self, port: u16) -> bool {
        let mut state = self.inner.lock();
        match state.allocated.remove(&port) {
            Some(owner) => {
                state.free.push_back(port);
                tracing::trace!(port, owner, free = state.free.len(), "port restored");
                true
            }
            None => false,
        }
    }

    /// The unit id currently holding `port`, if any.
    pub fn owner(&self, port: u16) -> Option<String> {
        self.inner.lock().allocated.get(&port).cloned()
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.inner.lock().allocated.contains_key(&port)
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn allocated_count(&self) -> usize {
        self.inner.lock().allocated.len()
    }

    /// Total number of ports managed by this pool.
    pub fn capacity(&self) -> usize {
        let state = self.inner.lock();
        state.free.len() + state.allocated.len()
    }

    pub fn range(&self) -> RangeInclusive<u16> {
        self.range.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn allocate_hands_out_distinct_ports() {
        let pool = PortPool::new(20000..=20009);
        let mut seen = HashSet::new();
        for i in 0..10 {
            let port = pool.allocate(&format!("unit-{i}")).unwrap();
            assert!(pool.range().contains(&port));
            assert!(seen.insert(port), "port {port} handed out twice");
        }
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn exhausted_pool_reports_error() {
        let pool = PortPool::new(20000..=20001);
        pool.allocate("a").unwrap();
        pool.allocate("b").unwrap();
        assert!(matches!(
            pool.allocate("c"),
            Err(RelayError::PortPoolExhausted)
        ));
    }

    #[test]
    fn empty_range_is_exhausted() {
        let pool = PortPool::new(30000..=20000);
        assert_eq!(pool.capacity(), 0);
        assert!(pool.allocate("a").is_err());
    }

    #[test]
    fn port_zero_is_never_allocated() {
        let pool = PortPool::new(0..=2);
        assert_eq!(pool.capacity(), 2);
        assert_ne!(pool.allocate("a").unwrap(), 0);
        assert_ne!(pool.allocate("b").unwrap(), 0);
    }

    #[test]
    fn restore_is_idempotent() {
        let pool = PortPool::new(20000..=20003);
        let port = pool.allocate("a").unwrap();
        assert!(pool.restore(port));
        assert!(!pool.restore(port));
        assert!(!pool.restore(40000));
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn free_count_returns_to_start_after_pairs() {
        let pool = PortPool::new(20000..=20015);
        let start = pool.free_count();
        for i in 0..100 {
            let port = pool.allocate(&format!("unit-{i}")).unwrap();
            assert!(pool.restore(port));
        }
        assert_eq!(pool.free_count(), start);
        assert_eq!(pool.allocated_count(), 0);
    }

    #[test]
    fn claim_tracks_ports_in_range() {
        let pool = PortPool::new(20000..=20009);
        assert!(pool.claim(20005, "cam-01").unwrap());
        assert_eq!(pool.owner(20005).as_deref(), Some("cam-01"));
        assert_eq!(pool.free_count(), 9);

        // A leased port is refused to everyone, its owner included.
        assert!(matches!(
            pool.claim(20005, "cam-01"),
            Err(RelayError::PortInUse { port: 20005, .. })
        ));
        assert!(matches!(
            pool.claim(20005, "cam-02"),
            Err(RelayError::PortInUse { port: 20005, .. })
        ));

        // Allocation never hands out a claimed port.
        for _ in 0..9 {
            assert_ne!(pool.allocate("x").unwrap(), 20005);
        }
    }

    #[test]
    fn claim_refuses_port_allocated_to_same_owner() {
        let pool = PortPool::new(20000..=20003);
        let rtcp = pool.allocate("cam-01").unwrap();
        assert!(matches!(
            pool.claim(rtcp, "cam-01"),
            Err(RelayError::PortInUse { .. })
        ));
        assert!(pool.restore(rtcp));
        assert!(!pool.restore(rtcp));
    }

    #[test]
    fn claim_outside_range_is_untracked() {
        let pool = PortPool::new(20000..=20009);
        assert!(!pool.claim(5000, "cam-01").unwrap());
        assert!(!pool.is_allocated(5000));
        assert!(matches!(pool.claim(0, "cam-01"), Err(RelayError::InvalidPort(0))));
    }

    #[test]
    fn concurrent_allocations_never_collide() {
        let pool = PortPool::new(20000..=20999);
        let ports = parking_lot::Mutex::new(Vec::new());
        std::thread::scope(|s| {
            for t in 0..8 {
                let pool = &pool;
                let ports = &ports;
                s.spawn(move || {
                    for i in 0..100 {
                        let port = pool.allocate(&format!("t{t}-{i}")).unwrap();
                        ports.lock().push(port);
                    }
                });
            }
        });
        let ports = ports.into_inner();
        let unique: HashSet<_> = ports.iter().copied().collect();
        assert_eq!(unique.len(), 800);
        assert_eq!(pool.free_count(), 200);
    }
}
