//! Cancellation signalling for live runs
//!
//! Each executing run registers a watch channel here. `cancel(run_id)`
//! flips it; the runner and handlers poll the receiver at suspension
//! points. Tokens are process-local — a run executing elsewhere observes
//! cancellation through its status row instead.

use dashmap::DashMap;
use tokio::sync::watch;
use uuid::Uuid;

/// Registry of live cancellation tokens.
#[derive(Default)]
pub struct CancellationHub {
    tokens: DashMap<Uuid, watch::Sender<bool>>,
}

impl CancellationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token for a run about to execute.
    pub fn register(&self, run_id: Uuid) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.tokens.insert(run_id, tx);
        rx
    }

    /// Signal cancellation. Returns whether a live token existed.
    pub fn signal(&self, run_id: Uuid) -> bool {
        match self.tokens.get(&run_id) {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        }
    }

    /// Drop the token after the run reaches a terminal state.
    pub fn remove(&self, run_id: Uuid) {
        self.tokens.remove(&run_id);
    }

    /// Number of live tokens (for diagnostics).
    pub fn live_count(&self) -> usize {
        self.tokens.len()
    }
}

/// Cancellation probe combining the run's external token with an
/// optional runner-internal stop signal (parallel STOP policy).
#[derive(Clone, Default)]
pub struct CancelProbe {
    external: Option<watch::Receiver<bool>>,
    internal: Option<watch::Receiver<bool>>,
}

impl CancelProbe {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn external(rx: watch::Receiver<bool>) -> Self {
        Self {
            external: Some(rx),
            internal: None,
        }
    }

    /// Derive a probe that also observes an internal stop channel.
    pub fn with_internal(&self, rx: watch::Receiver<bool>) -> Self {
        Self {
            external: self.external.clone(),
            internal: Some(rx),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.external.as_ref().is_some_and(|rx| *rx.borrow())
            || self.internal.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// The external token only — true when the run itself was cancelled,
    /// as opposed to an internal stop after a sibling step failure.
    pub fn is_externally_cancelled(&self) -> bool {
        self.external.as_ref().is_some_and(|rx| *rx.borrow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_flips_receiver() {
        let hub = CancellationHub::new();
        let run_id = Uuid::now_v7();

        let rx = hub.register(run_id);
        assert!(!*rx.borrow());
        assert_eq!(hub.live_count(), 1);

        assert!(hub.signal(run_id));
        assert!(*rx.borrow());

        hub.remove(run_id);
        assert!(!hub.signal(run_id));
        assert_eq!(hub.live_count(), 0);
    }

    #[test]
    fn test_probe_combines_channels() {
        let (ext_tx, ext_rx) = watch::channel(false);
        let (int_tx, int_rx) = watch::channel(false);

        let probe = CancelProbe::external(ext_rx).with_internal(int_rx);
        assert!(!probe.is_cancelled());

        int_tx.send(true).unwrap();
        assert!(probe.is_cancelled());
        assert!(!probe.is_externally_cancelled());

        ext_tx.send(true).unwrap();
        assert!(probe.is_externally_cancelled());
    }

    #[test]
    fn test_empty_probe_never_cancels() {
        assert!(!CancelProbe::none().is_cancelled());
    }
}
