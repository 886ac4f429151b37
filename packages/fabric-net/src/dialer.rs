//! C7: a single outgoing connection attempt, retried with jittered
//! backoff until cancelled or connected (spec §4.7).

use std::sync::Arc;

use tokio::sync::Notify;
use tokio_tungstenite::connect_async;
use tracing::warn;

use crate::config::{jittered, FabricConfig};
use crate::framed::FramedConnection;

/// Drives repeated dial attempts against `url` until `stop()` is called
/// or a connection succeeds. `on_connect` is invoked with the raw framed
/// connection; the caller (route manager) runs the handshake and decides
/// whether to keep retrying afterward.
pub struct Dialer {
    cancel: Arc<Notify>,
    stopped: Arc<std::sync::atomic::AtomicBool>,
}

impl Dialer {
    /// Starts the dial loop as a background task. Calling `start` twice
    /// on the same logical route is a caller error to avoid (the route
    /// manager only ever holds one `Dialer` per route); this type itself
    /// does not guard against duplicate starts since it has no identity
    /// beyond the task it owns.
    pub fn start(
        url: String,
        config: FabricConfig,
        on_connect: impl Fn(FramedConnection) + Send + Sync + 'static,
    ) -> Self {
        let cancel = Arc::new(Notify::new());
        let stopped = Arc::new(std::sync::atomic::AtomicBool::new(false));

        tokio::spawn(dial_loop(
            url,
            config,
            on_connect,
            Arc::clone(&cancel),
            Arc::clone(&stopped),
        ));

        Self { cancel, stopped }
    }

    /// Cancels the dial loop. Idempotent; in-flight attempts are raced
    /// against the cancellation and abandoned.
    pub fn stop(&self) {
        if !self.stopped.swap(true, std::sync::atomic::Ordering::SeqCst) {
            self.cancel.notify_waiters();
        }
    }
}

impl Drop for Dialer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn dial_loop(
    url: String,
    config: FabricConfig,
    on_connect: impl Fn(FramedConnection) + Send + Sync + 'static,
    cancel: Arc<Notify>,
    stopped: Arc<std::sync::atomic::AtomicBool>,
) {
    loop {
        if stopped.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }

        let attempt = tokio::select! {
            result = connect_async(&url) => result,
            () = cancel.notified() => return,
        };

        match attempt {
            Ok((ws, _)) => {
                let conn = FramedConnection::spawn(
                    ws,
                    config.max_frame_size,
                    config.keepalive_interval,
                    config.keepalive_missed_limit,
                );
                on_connect(conn);
                return;
            }
            Err(e) => {
                warn!(url = %url, error = %e, "outgoing dial failed");
                metrics::counter!("fabric_reconnect_attempts_total").increment(1);
                let delay = jittered(config.reconnect_interval_on_failure);
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.notified() => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_before_connect_prevents_callback() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let called = Arc::new(AtomicBool::new(false));
        let called_clone = Arc::clone(&called);

        let dialer = Dialer::start(
            "ws://127.0.0.1:1".to_string(), // nothing listens here
            FabricConfig {
                reconnect_interval_on_failure: std::time::Duration::from_millis(50),
                ..FabricConfig::default()
            },
            move |_conn| {
                called_clone.store(true, Ordering::SeqCst);
            },
        );

        dialer.stop();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(!called.load(Ordering::SeqCst));
    }
}
