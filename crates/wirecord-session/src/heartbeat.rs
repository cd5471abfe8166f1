//! Heartbeat timer
//!
//! One periodic task per live session. The first tick is delayed by a random
//! jitter of up to one second so reconnecting clients do not beat in lockstep.
//! A failed send ends the loop; recovery belongs to the read side.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Upper bound of the first-tick jitter
pub const MAX_JITTER: Duration = Duration::from_millis(1000);

/// Spawn a heartbeat loop
///
/// `beat` runs once per tick; an `Err` stops the loop. The loop also stops
/// when `lifetime` is cancelled.
pub fn spawn_heartbeat<F, E>(
    interval: Duration,
    lifetime: CancellationToken,
    mut beat: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Result<(), E> + Send + 'static,
    E: fmt::Display,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut first = true;

        loop {
            tokio::select! {
                () = lifetime.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if first {
                first = false;
                let jitter = rand::thread_rng().gen_range(0..=u64::try_from(MAX_JITTER.as_millis()).unwrap_or(u64::MAX));
                tokio::select! {
                    () = lifetime.cancelled() => break,
                    () = tokio::time::sleep(Duration::from_millis(jitter)) => {}
                }
            }

            if let Err(e) = beat() {
                tracing::warn!(error = %e, "Heartbeat send failed, stopping timer");
                break;
            }
        }

        tracing::debug!("Heartbeat timer stopped");
    })
}

/// Holds the single heartbeat timer of a session
///
/// Starting a new timer cancels the previous one.
#[derive(Debug, Default)]
pub struct HeartbeatSlot {
    current: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl HeartbeatSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the running timer with a new one bound to `lifetime`
    pub fn start<F, E>(&self, interval: Duration, lifetime: &CancellationToken, beat: F)
    where
        F: FnMut() -> Result<(), E> + Send + 'static,
        E: fmt::Display,
    {
        let token = lifetime.child_token();
        let handle = spawn_heartbeat(interval, token.clone(), beat);
        if let Some((previous, _)) = self.current.lock().replace((token, handle)) {
            previous.cancel();
        }
    }

    /// Stop the running timer, if any
    pub fn stop(&self) {
        if let Some((token, _)) = self.current.lock().take() {
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|(token, handle)| !token.is_cancelled() && !handle.is_finished())
    }
}

/// Acknowledgement and latency bookkeeping for sent heartbeats
#[derive(Debug)]
pub struct HeartbeatTracker {
    acked: AtomicBool,
    sent_at: Mutex<Option<Instant>>,
    latency: Mutex<Option<Duration>>,
}

impl Default for HeartbeatTracker {
    fn default() -> Self {
        Self {
            acked: AtomicBool::new(true),
            sent_at: Mutex::new(None),
            latency: Mutex::new(None),
        }
    }
}

impl HeartbeatTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a heartbeat send
    ///
    /// Returns `false` when the previous heartbeat was never acknowledged,
    /// which means the connection is zombied.
    pub fn mark_sent(&self) -> bool {
        *self.sent_at.lock() = Some(Instant::now());
        self.acked.swap(false, Ordering::AcqRel)
    }

    /// Record an acknowledgement and update the measured latency
    pub fn ack(&self) {
        self.acked.store(true, Ordering::Release);
        if let Some(sent) = *self.sent_at.lock() {
            *self.latency.lock() = Some(sent.elapsed());
        }
    }

    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::Acquire)
    }

    /// Round trip of the last acknowledged heartbeat
    pub fn latency(&self) -> Option<Duration> {
        *self.latency.lock()
    }

    /// Forget the previous connection's state
    pub fn reset(&self) {
        self.acked.store(true, Ordering::Release);
        *self.sent_at.lock() = None;
    }
}
