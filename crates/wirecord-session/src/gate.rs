//! One-shot readiness gates
//!
//! A gate starts open and is closed exactly once. The close is guarded by a
//! compare-and-swap, so a second close is a no-op that reports `false`
//! instead of firing dependent logic again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Why a gate wait ended without the gate closing
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error("session lifetime ended while waiting")]
    Cancelled,

    #[error("timed out waiting for gate")]
    Timeout,
}

/// One-shot signal
#[derive(Debug, Default)]
pub struct Gate {
    closed: AtomicBool,
    signal: CancellationToken,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the gate, waking every waiter
    ///
    /// Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        let first = self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.signal.cancel();
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait for the gate to close, giving up when `lifetime` is cancelled
    pub async fn wait(&self, lifetime: &CancellationToken) -> Result<(), GateError> {
        tokio::select! {
            biased;
            () = self.signal.cancelled() => Ok(()),
            () = lifetime.cancelled() => Err(GateError::Cancelled),
        }
    }

    /// Like [`Gate::wait`], bounded by a local timeout
    pub async fn wait_timeout(
        &self,
        lifetime: &CancellationToken,
        timeout: Duration,
    ) -> Result<(), GateError> {
        tokio::time::timeout(timeout, self.wait(lifetime))
            .await
            .map_err(|_| GateError::Timeout)?
    }
}

/// Named gates owned by one session
#[derive(Debug, Default)]
pub struct GateSet {
    gates: Mutex<HashMap<&'static str, Arc<Gate>>>,
}

impl GateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The gate registered under `name`, created open on first use
    pub fn get(&self, name: &'static str) -> Arc<Gate> {
        Arc::clone(self.gates.lock().entry(name).or_default())
    }

    /// Close the named gate; `false` if it was already closed
    pub fn close(&self, name: &'static str) -> bool {
        let closed = self.get(name).close();
        if !closed {
            tracing::trace!(gate = name, "Gate already closed");
        }
        closed
    }

    pub fn is_closed(&self, name: &'static str) -> bool {
        self.gates
            .lock()
            .get(name)
            .is_some_and(|gate| gate.is_closed())
    }

    /// Replace the named gate with a fresh open one and return it
    ///
    /// Used before each handshake round so a new wait does not observe the
    /// previous connection's signal. Holders of the old gate are unaffected.
    pub fn reset(&self, name: &'static str) -> Arc<Gate> {
        let gate = Arc::new(Gate::new());
        self.gates.lock().insert(name, Arc::clone(&gate));
        gate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_exactly_once() {
        let gate = Gate::new();
        assert!(!gate.is_closed());
        assert!(gate.close());
        assert!(!gate.close());
        assert!(gate.is_closed());
    }

    #[tokio::test]
    async fn test_wait_returns_after_close() {
        let gate = Arc::new(Gate::new());
        let lifetime = CancellationToken::new();

        let waiter = {
            let gate = Arc::clone(&gate);
            let lifetime = lifetime.clone();
            tokio::spawn(async move { gate.wait(&lifetime).await })
        };

        gate.close();
        gate.close();
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_wait_is_cancelled_by_lifetime() {
        let gate = Gate::new();
        let lifetime = CancellationToken::new();
        lifetime.cancel();
        assert_eq!(gate.wait(&lifetime).await, Err(GateError::Cancelled));
    }

    #[tokio::test]
    async fn test_closed_gate_wins_over_cancelled_lifetime() {
        let gate = Gate::new();
        gate.close();
        let lifetime = CancellationToken::new();
        lifetime.cancel();
        assert_eq!(gate.wait(&lifetime).await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout() {
        let gate = Gate::new();
        let lifetime = CancellationToken::new();
        let result = gate
            .wait_timeout(&lifetime, Duration::from_secs(2))
            .await;
        assert_eq!(result, Err(GateError::Timeout));
    }

    #[test]
    fn test_gate_set_close_and_reset() {
        let gates = GateSet::new();
        assert!(!gates.is_closed("hello"));
        assert!(gates.close("hello"));
        assert!(!gates.close("hello"));
        assert!(gates.is_closed("hello"));

        let old = gates.get("hello");
        let fresh = gates.reset("hello");
        assert!(old.is_closed());
        assert!(!fresh.is_closed());
        assert!(!gates.is_closed("hello"));
    }
}
