//! Termination state and the shutdown fan-in.
//!
//! All failure and cancellation sources collapse into a single broadcast:
//! a worker error, an OS interrupt/terminate signal, cancellation of the
//! governing run, or an internal request each flip the same [`Termination`]
//! value exactly once. Every concurrent stage task observes it
//! cooperatively — once signaled, tasks stop launching new work and return
//! promptly; in-flight dispatches are not forcibly killed here.

use crate::errors::GangwayError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Process-wide termination signal, broadcast once.
///
/// Cloning is cheap; clones observe the same signal.
#[derive(Debug, Clone)]
pub struct Termination {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl Default for Termination {
    fn default() -> Self {
        Self::new()
    }
}

impl Termination {
    /// Creates an unsignaled termination state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Broadcasts termination.
    ///
    /// Returns true for the call that actually flipped the state; repeat
    /// calls are no-ops.
    pub fn signal(&self) -> bool {
        self.tx.send_if_modified(|v| {
            if *v {
                false
            } else {
                *v = true;
                true
            }
        })
    }

    /// Returns true once termination has been broadcast.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits until termination is broadcast.
    pub async fn terminated(&self) {
        let mut rx = self.tx.subscribe();
        // wait_for cannot fail while we hold the sender.
        let _ = rx.wait_for(|v| *v).await;
    }
}

/// Waits for an OS interrupt or terminate signal.
async fn os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Spawns the coordinating task that aggregates shutdown sources.
///
/// The first of {worker error, OS signal, external cancellation, internal
/// request} broadcasts `term`; the coordinator then stops listening and
/// yields the first worker error, if that is what fired.
pub fn spawn_coordinator(
    term: Termination,
    mut errors: mpsc::Receiver<GangwayError>,
    external: Option<Termination>,
) -> JoinHandle<Option<GangwayError>> {
    tokio::spawn(async move {
        let external_cancelled = async {
            match &external {
                Some(outer) => outer.terminated().await,
                None => std::future::pending().await,
            }
        };

        let first_error = tokio::select! {
            err = errors.recv() => {
                if let Some(err) = &err {
                    error!(%err, "worker reported a fatal error");
                }
                err
            }
            () = os_signal() => {
                info!("interrupt received");
                None
            }
            () = external_cancelled => {
                info!("governing run was cancelled");
                None
            }
            () = term.terminated() => None,
        };

        term.signal();
        info!("termination signaled");
        first_error
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_signal_is_one_shot() {
        let term = Termination::new();
        assert!(!term.is_terminated());
        assert!(term.signal());
        assert!(!term.signal());
        assert!(term.is_terminated());
    }

    #[tokio::test]
    async fn test_terminated_wakes_waiters() {
        let term = Termination::new();
        let waiter = term.clone();
        let handle = tokio::spawn(async move { waiter.terminated().await });

        term.signal();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_terminated_returns_immediately_when_already_signaled() {
        let term = Termination::new();
        term.signal();
        tokio::time::timeout(Duration::from_millis(50), term.terminated())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_coordinator_broadcasts_on_worker_error() {
        let term = Termination::new();
        let (tx, rx) = mpsc::channel(1);
        let handle = spawn_coordinator(term.clone(), rx, None);

        tx.send(GangwayError::dispatch("build", "boom"))
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(term.is_terminated());
        assert!(matches!(first, Some(GangwayError::Dispatch { .. })));
    }

    #[tokio::test]
    async fn test_coordinator_observes_external_cancellation() {
        let term = Termination::new();
        let outer = Termination::new();
        let (_tx, rx) = mpsc::channel(1);
        let handle = spawn_coordinator(term.clone(), rx, Some(outer.clone()));

        outer.signal();
        let first = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(term.is_terminated());
        assert!(first.is_none());
    }

    #[tokio::test]
    async fn test_coordinator_stops_on_internal_request() {
        let term = Termination::new();
        let (_tx, rx) = mpsc::channel(1);
        let handle = spawn_coordinator(term.clone(), rx, None);

        term.signal();
        let first = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(first.is_none());
    }
}
