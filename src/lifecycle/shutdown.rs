//! Shutdown coordination for the proxy.
//!
//! The accept loop and every connection task subscribe to one coordinator.
//! Draining asks them to finish in-flight work; forcing tells connection
//! tasks to drop their sockets immediately.

use tokio::sync::watch;
use tokio::time::Instant;

/// Where the server is in its shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    /// Stop accepting, finish in-flight requests until the deadline.
    Draining { deadline: Instant },
    /// Grace period over; close whatever is left.
    Forced,
}

/// Coordinator for graceful shutdown.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<ShutdownPhase>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ShutdownPhase::Running);
        Self { tx }
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Start draining. Returns `false` if shutdown had already begun.
    pub fn trigger(&self, deadline: Instant) -> bool {
        self.tx.send_if_modified(|phase| match phase {
            ShutdownPhase::Running => {
                *phase = ShutdownPhase::Draining { deadline };
                true
            }
            _ => false,
        })
    }

    /// End the grace period.
    pub fn force(&self) {
        self.tx.send_replace(ShutdownPhase::Forced);
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscriber side of [`Shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<ShutdownPhase>,
}

impl ShutdownSignal {
    /// Wait until the phase is past `seen` and return the new phase.
    ///
    /// If the coordinator is gone the server is gone too, so this reports
    /// `Forced`.
    pub async fn changed_from(&mut self, seen: ShutdownPhase) -> ShutdownPhase {
        match self.rx.wait_for(|phase| *phase != seen).await {
            Ok(phase) => *phase,
            Err(_) => ShutdownPhase::Forced,
        }
    }

    /// Wait for shutdown to begin.
    pub async fn recv(&mut self) -> ShutdownPhase {
        self.changed_from(ShutdownPhase::Running).await
    }
}
