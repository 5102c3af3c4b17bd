//! Concurrent reservation of integer ports from a fixed pool (C4).
//!
//! One registry backs both kinds of reservation the control plane needs:
//! a caller-chosen port for a client's `RemotePort` request, and a
//! server-chosen port drawn from the seeded pool for each visitor's
//! `TunnelPort`. Presence of a key in the map means "reserved"; absence
//! means "free". `reserve_any` only ever scans the seeded range, but
//! `try_reserve` accepts any `u16`, since a `RemotePort` need not fall
//! inside the tunnel-port pool at all.

use std::ops::Range;

use dashmap::DashMap;

/// Error returned when no free port remains in the seeded range.
#[derive(Debug, thiserror::Error)]
#[error("tunnel port pool exhausted")]
pub struct PoolExhausted;

/// A process-wide free/used ledger over port numbers.
pub struct PortRegistry {
    reserved: DashMap<u16, ()>,
    scan_range: Range<u16>,
}

impl PortRegistry {
    /// Create a registry whose `reserve_any()` scans `scan_range`. The range
    /// is not pre-populated with entries — ports start free, and only
    /// `scan_range` bounds what `reserve_any` will consider.
    pub fn new(scan_range: Range<u16>) -> Self {
        PortRegistry {
            reserved: DashMap::new(),
            scan_range,
        }
    }

    /// Atomically reserve a caller-chosen port. Returns `true` iff the port
    /// was free and is now reserved.
    pub fn try_reserve(&self, port: u16) -> bool {
        self.reserved.insert(port, ()).is_none()
    }

    /// Atomically reserve any free port in the seeded range.
    ///
    /// Iteration order is unspecified; the only guarantee is that some free
    /// port is returned if one exists.
    pub fn reserve_any(&self) -> Result<u16, PoolExhausted> {
        for port in self.scan_range.clone() {
            if self.try_reserve(port) {
                return Ok(port);
            }
        }
        Err(PoolExhausted)
    }

    /// Release a previously reserved port. A no-op if the port was not held.
    pub fn release(&self, port: u16) {
        self.reserved.remove(&port);
    }

    /// Number of currently reserved ports. Exposed for tests that assert
    /// pool conservation.
    pub fn reserved_count(&self) -> usize {
        self.reserved.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_reserve_is_exclusive() {
        let pool = PortRegistry::new(4500..5000);
        assert!(pool.try_reserve(9000));
        assert!(!pool.try_reserve(9000));
        pool.release(9000);
        assert!(pool.try_reserve(9000));
    }

    #[test]
    fn reserve_any_stays_in_range() {
        let pool = PortRegistry::new(4500..4502);
        let a = pool.reserve_any().unwrap();
        let b = pool.reserve_any().unwrap();
        assert_ne!(a, b);
        assert!((4500..4502).contains(&a));
        assert!((4500..4502).contains(&b));
        assert!(matches!(pool.reserve_any(), Err(PoolExhausted)));
    }

    #[test]
    fn release_restores_initial_state() {
        let pool = PortRegistry::new(4500..4510);
        assert_eq!(pool.reserved_count(), 0);

        let mut held = Vec::new();
        for _ in 0..5 {
            held.push(pool.reserve_any().unwrap());
        }
        assert_eq!(pool.reserved_count(), 5);

        for port in held {
            pool.release(port);
        }
        assert_eq!(pool.reserved_count(), 0);
    }

    #[test]
    fn remote_port_reservation_is_independent_of_scan_range() {
        let pool = PortRegistry::new(4500..5000);
        // A RemotePort outside the tunnel-port scan range can still be
        // reserved and does not show up when scanning for a TunnelPort.
        assert!(pool.try_reserve(9000));
        let tunnel_port = pool.reserve_any().unwrap();
        assert_ne!(tunnel_port, 9000);
    }
}
