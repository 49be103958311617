//! Inbound connection admission tracking
//!
//! A per-source-IP rate and concurrency limiter applied before an inbound
//! connection reaches any application logic. Pure bookkeeping under a single
//! mutex, no I/O.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Tracks concurrent inbound connections per source IP and enforces a minimum
/// reconnection window to protect against connection flooding.
#[derive(Debug)]
pub struct ConnTracker {
    inner: Mutex<Inner>,
    max: u32,
    window: Duration,
}

#[derive(Debug, Default)]
struct Inner {
    /// Live connection count per IP.
    counts: HashMap<IpAddr, u32>,
    /// Most recent connection time per IP, retained for the window check
    /// even after the count drops to zero.
    last_connect: HashMap<IpAddr, Instant>,
}

impl ConnTracker {
    /// Create a tracker admitting at most `max` concurrent connections per IP
    /// and refusing reconnects within `window` of the last one.
    pub fn new(max: u32, window: Duration) -> Self {
        ConnTracker {
            inner: Mutex::new(Inner::default()),
            max,
            window,
        }
    }

    /// Number of distinct IPs currently tracked.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admit a new connection from `ip`, or fail if the IP is at its
    /// concurrency cap or reconnecting within the flood-protection window.
    pub fn add_conn(&self, ip: IpAddr) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        let count = inner.counts.get(&ip).copied().unwrap_or(0);
        if count >= self.max {
            return Err(Error::RateLimited(format!(
                "{} has {} connections [max={}]",
                ip, count, self.max
            )));
        }
        if count == 0 {
            // The window only applies to the first connection; additional
            // concurrent ones are governed by the cap alone.
            if let Some(last) = inner.last_connect.get(&ip) {
                if last.elapsed() < self.window {
                    return Err(Error::RateLimited(format!(
                        "{} tried to reconnect within window of last {:?}",
                        ip, self.window
                    )));
                }
            }
        }

        *inner.counts.entry(ip).or_insert(0) += 1;
        inner.last_connect.insert(ip, Instant::now());
        Ok(())
    }

    /// Release a connection from `ip`. The last-connect timestamp is retained
    /// until the window elapses so that an immediate reconnect still fails.
    pub fn remove_conn(&self, ip: IpAddr) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(count) = inner.counts.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.counts.remove(&ip);
            }
        }

        if let Some(last) = inner.last_connect.get(&ip) {
            if last.elapsed() > self.window {
                inner.last_connect.remove(&ip);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn rand_local_ipv4() -> IpAddr {
        let mut rng = rand::thread_rng();
        IpAddr::from([127, rng.gen::<u8>(), rng.gen::<u8>(), rng.gen::<u8>()])
    }

    #[test]
    fn test_initialized_empty() {
        let tracker = ConnTracker::new(10, Duration::from_secs(1));
        assert_eq!(tracker.len(), 0);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_repeated_adding_capped() {
        let tracker = ConnTracker::new(10, Duration::from_secs(1));
        let ip = rand_local_ipv4();

        let mut admitted = 0;
        for _ in 0..100 {
            if tracker.add_conn(ip).is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_adding_many() {
        let tracker = ConnTracker::new(10, Duration::from_secs(3600));
        for i in 0..100u32 {
            let octets = i.to_be_bytes();
            let ip = IpAddr::from([10, octets[1], octets[2], octets[3]]);
            tracker.add_conn(ip).unwrap();
        }
        assert_eq!(tracker.len(), 100);
    }

    #[test]
    fn test_cycle() {
        let tracker = ConnTracker::new(10, Duration::from_micros(1));
        for _ in 0..100 {
            let ip = rand_local_ipv4();
            tracker.add_conn(ip).unwrap();
            tracker.remove_conn(ip);
        }
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn test_very_short_window() {
        let tracker = ConnTracker::new(10, Duration::from_micros(1));
        for _ in 0..10 {
            let ip = rand_local_ipv4();
            tracker.add_conn(ip).unwrap();
            std::thread::sleep(Duration::from_micros(2));
            tracker.add_conn(ip).unwrap();
        }
        assert_eq!(tracker.len(), 10);
    }

    #[test]
    fn test_window() {
        let window = Duration::from_millis(100);
        let tracker = ConnTracker::new(10, window);
        let ip = rand_local_ipv4();

        tracker.add_conn(ip).unwrap();
        tracker.remove_conn(ip);
        // Reconnecting within the window fails even though the count is zero.
        assert!(tracker.add_conn(ip).is_err());

        std::thread::sleep(window + Duration::from_millis(10));
        tracker.add_conn(ip).unwrap();
    }

    #[test]
    fn test_concurrent_additions() {
        use std::sync::Arc;

        let tracker = Arc::new(ConnTracker::new(1, Duration::from_micros(1)));
        let ip = rand_local_ipv4();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || tracker.add_conn(ip).is_ok())
            })
            .collect();
        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
    }
}
