//! Pending voice joins
//!
//! Joining voice sends a Voice State Update and then needs two dispatches
//! that arrive in either order: our own VOICE_STATE_UPDATE (session id) and
//! VOICE_SERVER_UPDATE (token and endpoint). The "connect ready" gate of a
//! join closes only once both are recorded.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use wirecord_core::Snowflake;
use wirecord_session::{Gate, GateError};

/// Upper bound for both signals to arrive
pub const VOICE_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// From our own VOICE_STATE_UPDATE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceStateSignal {
    pub session_id: String,
    pub channel_id: Snowflake,
}

/// From VOICE_SERVER_UPDATE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceServerSignal {
    pub token: String,
    pub endpoint: String,
}

#[derive(Debug, Default)]
struct Signals {
    state: Option<VoiceStateSignal>,
    server: Option<VoiceServerSignal>,
}

/// One in-flight join
#[derive(Debug, Default)]
pub struct PendingJoin {
    signals: Mutex<Signals>,
    connect_ready: Gate,
    aborted: CancellationToken,
}

impl PendingJoin {
    fn set_state(&self, state: VoiceStateSignal) {
        let mut signals = self.signals.lock();
        signals.state = Some(state);
        self.close_if_complete(&signals);
    }

    fn set_server(&self, server: VoiceServerSignal) {
        let mut signals = self.signals.lock();
        signals.server = Some(server);
        self.close_if_complete(&signals);
    }

    // Called with the signal lock held so the check and the close are atomic
    fn close_if_complete(&self, signals: &Signals) {
        if signals.state.is_some() && signals.server.is_some() {
            self.connect_ready.close();
        }
    }

    pub fn is_connect_ready(&self) -> bool {
        self.connect_ready.is_closed()
    }

    /// Wake the waiter with `Cancelled`
    fn abort(&self) {
        self.aborted.cancel();
    }

    /// Wait for both signals; ends early once the join is aborted
    pub async fn wait(
        &self,
        lifetime: &CancellationToken,
        timeout: Duration,
    ) -> Result<(VoiceStateSignal, VoiceServerSignal), GateError> {
        tokio::select! {
            biased;
            () = self.aborted.cancelled() => return Err(GateError::Cancelled),
            result = self.connect_ready.wait_timeout(lifetime, timeout) => result?,
        }
        let signals = self.signals.lock();
        match (&signals.state, &signals.server) {
            (Some(state), Some(server)) => Ok((state.clone(), server.clone())),
            // The gate only closes with both present
            _ => Err(GateError::Cancelled),
        }
    }
}

/// Pending joins keyed by guild
#[derive(Debug, Default)]
pub struct VoiceJoins {
    pending: DashMap<Snowflake, Arc<PendingJoin>>,
}

impl VoiceJoins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a join; an earlier one for the guild is aborted
    pub fn begin(&self, guild_id: Snowflake) -> Arc<PendingJoin> {
        let join = Arc::new(PendingJoin::default());
        if let Some(previous) = self.pending.insert(guild_id, Arc::clone(&join)) {
            previous.abort();
        }
        join
    }

    /// Record the voice state signal; `false` if no join is pending
    pub fn state_ready(&self, guild_id: Snowflake, state: VoiceStateSignal) -> bool {
        match self.get(guild_id) {
            Some(join) => {
                join.set_state(state);
                true
            }
            None => false,
        }
    }

    /// Record the voice server signal; `false` if no join is pending
    pub fn server_ready(&self, guild_id: Snowflake, server: VoiceServerSignal) -> bool {
        match self.get(guild_id) {
            Some(join) => {
                join.set_server(server);
                true
            }
            None => false,
        }
    }

    /// Forget a join if it is still the one registered
    pub fn finish(&self, guild_id: Snowflake, join: &Arc<PendingJoin>) {
        self.pending.remove_if(&guild_id, |_, current| Arc::ptr_eq(current, join));
    }

    /// Abort the guild's pending join, waking its waiter
    pub fn cancel(&self, guild_id: Snowflake) {
        if let Some((_, join)) = self.pending.remove(&guild_id) {
            join.abort();
        }
    }

    pub fn clear(&self) {
        self.pending.retain(|_, join| {
            join.abort();
            false
        });
    }

    pub fn is_pending(&self, guild_id: Snowflake) -> bool {
        self.pending.contains_key(&guild_id)
    }

    fn get(&self, guild_id: Snowflake) -> Option<Arc<PendingJoin>> {
        self.pending.get(&guild_id).map(|join| Arc::clone(join.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUILD: Snowflake = Snowflake::new(1);

    fn state() -> VoiceStateSignal {
        VoiceStateSignal {
            session_id: "sess".into(),
            channel_id: Snowflake::new(2),
        }
    }

    fn server() -> VoiceServerSignal {
        VoiceServerSignal {
            token: "tok".into(),
            endpoint: "voice.example:443".into(),
        }
    }

    #[tokio::test]
    async fn test_state_then_server() {
        let joins = VoiceJoins::new();
        let join = joins.begin(GUILD);

        assert!(joins.state_ready(GUILD, state()));
        assert!(!join.is_connect_ready());
        assert!(joins.server_ready(GUILD, server()));
        assert!(join.is_connect_ready());

        let (s, v) = join.wait(&CancellationToken::new(), VOICE_JOIN_TIMEOUT).await.unwrap();
        assert_eq!(s, state());
        assert_eq!(v, server());
    }

    #[tokio::test]
    async fn test_server_then_state() {
        let joins = VoiceJoins::new();
        let join = joins.begin(GUILD);
        let waiter = tokio::spawn({
            let join = Arc::clone(&join);
            async move { join.wait(&CancellationToken::new(), VOICE_JOIN_TIMEOUT).await }
        });

        joins.server_ready(GUILD, server());
        tokio::task::yield_now().await;
        assert!(!join.is_connect_ready());
        joins.state_ready(GUILD, state());

        let (s, v) = waiter.await.unwrap().unwrap();
        assert_eq!(s.session_id, "sess");
        assert_eq!(v.endpoint, "voice.example:443");
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_signal_alone_never_completes() {
        let joins = VoiceJoins::new();
        let join = joins.begin(GUILD);
        joins.state_ready(GUILD, state());

        let err = join
            .wait(&CancellationToken::new(), VOICE_JOIN_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err, GateError::Timeout);
        assert!(!join.is_connect_ready());
    }

    #[tokio::test]
    async fn test_one_signal_alone_hangs_until_cancel() {
        let joins = VoiceJoins::new();
        let join = joins.begin(GUILD);
        joins.server_ready(GUILD, server());

        let lifetime = CancellationToken::new();
        let waiter = tokio::spawn({
            let join = Arc::clone(&join);
            let lifetime = lifetime.clone();
            async move { join.wait(&lifetime, Duration::from_secs(3600)).await }
        });
        tokio::task::yield_now().await;
        lifetime.cancel();

        assert_eq!(waiter.await.unwrap().unwrap_err(), GateError::Cancelled);
    }

    #[test]
    fn test_signals_without_join_are_ignored() {
        let joins = VoiceJoins::new();
        assert!(!joins.state_ready(GUILD, state()));
        assert!(!joins.server_ready(GUILD, server()));
    }

    #[test]
    fn test_repeated_signals_close_once() {
        let joins = VoiceJoins::new();
        let join = joins.begin(GUILD);
        joins.state_ready(GUILD, state());
        joins.server_ready(GUILD, server());
        joins.server_ready(GUILD, server());
        assert!(join.is_connect_ready());
        assert!(!join.connect_ready.close());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_wakes_waiter_immediately() {
        let joins = VoiceJoins::new();
        let join = joins.begin(GUILD);
        joins.state_ready(GUILD, state());

        let waiter = tokio::spawn({
            let join = Arc::clone(&join);
            async move {
                let started = tokio::time::Instant::now();
                let result = join.wait(&CancellationToken::new(), VOICE_JOIN_TIMEOUT).await;
                (result, started.elapsed())
            }
        });
        tokio::task::yield_now().await;
        joins.cancel(GUILD);

        let (result, waited) = waiter.await.unwrap();
        assert_eq!(result.unwrap_err(), GateError::Cancelled);
        assert!(waited < VOICE_JOIN_TIMEOUT);
        assert!(!joins.is_pending(GUILD));
    }

    #[tokio::test]
    async fn test_clear_and_replace_abort_earlier_joins() {
        let joins = VoiceJoins::new();
        let replaced = joins.begin(GUILD);
        let current = joins.begin(GUILD);
        let other = joins.begin(Snowflake::new(5));

        let lifetime = CancellationToken::new();
        assert_eq!(replaced.wait(&lifetime, VOICE_JOIN_TIMEOUT).await.unwrap_err(), GateError::Cancelled);

        joins.clear();
        assert_eq!(current.wait(&lifetime, VOICE_JOIN_TIMEOUT).await.unwrap_err(), GateError::Cancelled);
        assert_eq!(other.wait(&lifetime, VOICE_JOIN_TIMEOUT).await.unwrap_err(), GateError::Cancelled);
        assert!(!joins.is_pending(GUILD));
    }

    #[test]
    fn test_finish_keeps_newer_join() {
        let joins = VoiceJoins::new();
        let old = joins.begin(GUILD);
        let _new = joins.begin(GUILD);
        joins.finish(GUILD, &old);
        assert!(joins.is_pending(GUILD));
    }
}
