//! Tunables for the connection fabric, collecting every knob named in the
//! external-interface configuration table. Modeled like the teacher's
//! `NetworkConfig`/`ConnectionConfig`: a plain `Debug + Clone` struct with a
//! `Default` impl and no env/file parsing baked in — the embedder owns that.

use std::time::Duration;

/// Runtime configuration for a [`crate::route_manager::RouteManager`] and
/// the components it drives.
#[derive(Debug, Clone, PartialEq)]
pub struct FabricConfig {
    /// Delay before scheduling outgoing routes again after an active
    /// connection closes, before jitter (`[d, 2d]`). Default 5s.
    pub reconnect_delay_on_close: Duration,
    /// Delay before a dialer retries after a failed connection attempt,
    /// before jitter. Default 10s.
    pub reconnect_interval_on_failure: Duration,
    /// Number of concurrent spare registrations a relay listener keeps
    /// open. Default 2.
    pub relay_spare_count: usize,
    /// Delay before a relay listener replaces a failed registration,
    /// before jitter (`[d, 2d]`). Default 10s.
    pub relay_reconnect_interval: Duration,
    /// Window during which a second incoming connection for the same
    /// group is treated as a duplicate-drop race rather than a fresh
    /// replacement. Default 2s.
    pub drop_duplicate_window: Duration,
    /// Interval between keepalive pings on an open framed connection.
    /// Default 25s.
    pub keepalive_interval: Duration,
    /// Number of missed pongs tolerated before a connection is closed
    /// with `KeepaliveTimeout`. Default 2.
    pub keepalive_missed_limit: u32,
    /// Overall deadline for a handshake to complete. Default 30s.
    pub handshake_timeout: Duration,
    /// Maximum frame size accepted by a framed connection before it is
    /// closed with `FrameTooLarge`.
    pub max_frame_size: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_on_close: Duration::from_secs(5),
            reconnect_interval_on_failure: Duration::from_secs(10),
            relay_spare_count: 2,
            relay_reconnect_interval: Duration::from_secs(10),
            drop_duplicate_window: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(25),
            keepalive_missed_limit: 2,
            handshake_timeout: Duration::from_secs(30),
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}

/// Draws a uniform jitter in `[d, 2d]`, the fixed interpretation of the
/// inherited-but-ambiguous `delay * (1 + random())` formula.
#[must_use]
pub fn jittered(base: Duration) -> Duration {
    let extra = base.as_secs_f64() * rand::random::<f64>();
    base + Duration::from_secs_f64(extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jittered_stays_within_d_and_2d() {
        let base = Duration::from_millis(100);
        for _ in 0..100 {
            let d = jittered(base);
            assert!(d >= base);
            assert!(d <= base * 2);
        }
    }

    #[test]
    fn defaults_match_spec() {
        let cfg = FabricConfig::default();
        assert_eq!(cfg.reconnect_delay_on_close, Duration::from_secs(5));
        assert_eq!(cfg.relay_spare_count, 2);
        assert_eq!(cfg.drop_duplicate_window, Duration::from_secs(2));
        assert_eq!(cfg.handshake_timeout, Duration::from_secs(30));
    }
}
