//! Termination signals as a cancellation context
//!
//! The signal listener only records why and cancels the token. Cleanup stays
//! with the runner, which selects on [`Shutdown::cancelled`].

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownReason {
    Interrupt,
    Terminate,
    /// Cancelled from code rather than by a signal
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Interrupt => write!(f, "SIGINT"),
            ShutdownReason::Terminate => write!(f, "SIGTERM"),
            ShutdownReason::Requested => write!(f, "shutdown requested"),
        }
    }
}

#[derive(Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel with `reason`; the first reason sticks
    pub fn trigger(&self, reason: ShutdownReason) {
        {
            let mut current = self.reason.lock();
            if current.is_none() {
                *current = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.reason.lock()
    }

    /// Resolves once triggered, with the recorded reason
    pub async fn cancelled(&self) -> ShutdownReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(ShutdownReason::Requested)
    }

    /// Listen for ctrl-c (and SIGTERM on Unix) until the first one arrives
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let shutdown = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                reason = wait_for_signal() => {
                    info!("Received {}, shutting down", reason);
                    shutdown.trigger(reason);
                }
                _ = shutdown.token.cancelled() => {}
            }
        })
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> ShutdownReason {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            None
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Cannot listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
            ShutdownReason::Interrupt
        }
        Some(_) = async {
            match terminate.as_mut() {
                Some(stream) => stream.recv().await,
                None => std::future::pending().await,
            }
        } => ShutdownReason::Terminate,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> ShutdownReason {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    ShutdownReason::Interrupt
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_first_reason_sticks() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());

        shutdown.trigger(ShutdownReason::Terminate);
        shutdown.trigger(ShutdownReason::Interrupt);

        assert!(shutdown.is_triggered());
        assert_eq!(shutdown.reason(), Some(ShutdownReason::Terminate));
        assert_eq!(shutdown.cancelled().await, ShutdownReason::Terminate);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });

        shutdown.trigger(ShutdownReason::Requested);
        let reason = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(reason, ShutdownReason::Requested);
    }

    #[tokio::test]
    async fn test_listener_stops_after_trigger() {
        let shutdown = Shutdown::new();
        let listener = shutdown.listen_for_signals();
        shutdown.trigger(ShutdownReason::Requested);
        tokio::time::timeout(Duration::from_secs(1), listener).await.unwrap().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_triggers_terminate() {
        use nix::sys::signal::{raise, Signal};

        let shutdown = Shutdown::new();
        let _listener = shutdown.listen_for_signals();

        // let the listener task install its handlers before the signal goes out
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        raise(Signal::SIGTERM).unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(5), shutdown.cancelled()).await.unwrap();
        assert_eq!(reason, ShutdownReason::Terminate);
        assert_eq!(shutdown.reason(), Some(ShutdownReason::Terminate));
    }
}
