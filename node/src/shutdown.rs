//! Process-wide shutdown signal (§5's "Global shutdown"): a single
//! `Shutdown` handle that every queue waiter, read/write loop, and
//! reconnection loop consults on a bounded poll, plus an
//! `install_signal_handlers` routine that wires SIGINT/SIGTERM/SIGQUIT to
//! it via the `ctrlc` crate, matching `ckb-stop-handler`'s idiom.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};

/// A cloneable shutdown flag plus the `Notify` that lets waiters wake up
/// promptly rather than only on their next poll-interval tick.
#[derive(Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Shutdown { flag: Arc::new(AtomicBool::new(false)), notify: Arc::new(Notify::new()) }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sets the shutdown flag and wakes every current and future waiter.
    /// Idempotent — a second call is a no-op beyond re-notifying (harmless,
    /// since `Notify::notify_waiters` to no waiters is a no-op itself).
    pub fn start_shutdown(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            info!("shutdown: signaled");
        }
        self.notify.notify_waiters();
    }

    /// A `tokio::sync::Notify` handle for callers that want to `select!`
    /// directly against shutdown (e.g. [`cc_network::server::Server::run`]).
    pub fn notify_handle(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Blocks (bounded by `poll_interval`, default 600 ms per §5) until
    /// shutdown is signaled. Used by loops that otherwise have no single
    /// future to `select!` against.
    pub async fn wait(&self, poll_interval: Duration) {
        while !self.is_shutting_down() {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}

/// Installs SIGINT/SIGTERM/SIGQUIT handlers that call `start_shutdown` on
/// `shutdown`, and arms a grace-period timer that force-exits the process
/// if shutdown hasn't completed naturally in time.
pub fn install_signal_handlers(shutdown: Shutdown, grace_period: Duration) -> cc_error::Result<()> {
    let sig_shutdown = shutdown.clone();
    ctrlc::set_handler(move || {
        sig_shutdown.start_shutdown();
    })
    .map_err(|e| cc_error::Error::fatal(format!("failed to install signal handler: {e}")))?;

    tokio::spawn(async move {
        shutdown.wait(Duration::from_millis(600)).await;
        tokio::time::sleep(grace_period).await;
        warn!("shutdown: grace period elapsed, forcing exit");
        std::process::exit(0);
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn wait_returns_promptly_after_start_shutdown() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move {
            let start = Instant::now();
            waiter.wait(Duration::from_millis(600)).await;
            start.elapsed()
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.start_shutdown();

        let elapsed = handle.await.unwrap();
        assert!(elapsed < Duration::from_millis(600), "wait should wake on notify, not just poll");
    }

    #[test]
    fn start_shutdown_is_idempotent() {
        let shutdown = Shutdown::new();
        shutdown.start_shutdown();
        shutdown.start_shutdown();
        assert!(shutdown.is_shutting_down());
    }
}
