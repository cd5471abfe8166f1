//! Gateway client session
//!
//! Lifecycle of one gateway connection:
//!
//! 1. dial, wait for Hello, start the heartbeat, send Identify, wait for READY
//! 2. dispatches mutate the guild cache; voice joins wait on two dispatches
//! 3. dropped connections and resumable close codes trigger a resume that
//!    must be confirmed within two seconds
//! 4. a failed resume, or a close code that rules resume out, reconnects:
//!    a fresh session is dialed, the cache and voice sessions move to it and
//!    the continuation callback receives it; this instance then exits
//!
//! Terminal close codes exit the session and record the code.

mod lifecycle;
mod phase;
mod voice;

use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use wirecord_common::{Classify, ClientConfig};
use wirecord_core::{GuildCache, Snowflake};
use wirecord_session::{DispatchError, DispatchTable, GateSet, HeartbeatSlot, HeartbeatTracker, SessionContext, Transport};
use wirecord_voice::{AudioSource, CommandAudioSource, PlaybackStats, VoiceSession};

use crate::error::GatewayError;
use crate::handlers::gateway_table;
use crate::protocol::{OpCode, PresenceUpdatePayload, RequestGuildMembersPayload};
use crate::rest::{HttpRestClient, RestClient};
use crate::voice_join::VoiceJoins;

pub(crate) use lifecycle::{escalate, recover};
pub use phase::SessionPhase;

/// Bound on the wait for the resume confirmation
pub const RESUME_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound on each of the Hello and READY waits
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) const HELLO_GATE: &str = "hello";
pub(crate) const READY_GATE: &str = "ready";
pub(crate) const RESUMED_GATE: &str = "resumed";

/// Receives the session that replaced this one after a reconnect
pub type ContinuationFn = Arc<dyn Fn(GatewaySession) + Send + Sync>;

/// Issued by READY; needed to resume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub session_id: String,
    pub resume_url: String,
}

/// Handle to a gateway session; clones share it
#[derive(Clone)]
pub struct GatewaySession {
    pub(crate) inner: Arc<GatewayInner>,
}

pub(crate) struct GatewayInner {
    pub(crate) config: ClientConfig,
    pub(crate) rest: Arc<dyn RestClient>,
    pub(crate) audio: Arc<dyn AudioSource>,
    /// Parent of this session and of its voice sessions, which outlive a reconnect
    pub(crate) owner: CancellationToken,
    pub(crate) lifetime: CancellationToken,
    /// Gateway base URL once resolved
    pub(crate) base_url: RwLock<Option<String>>,
    pub(crate) transport: Mutex<Option<Transport>>,
    pub(crate) gates: GateSet,
    pub(crate) heartbeat: HeartbeatSlot,
    pub(crate) tracker: HeartbeatTracker,
    pub(crate) table: Arc<DispatchTable<GatewayInner>>,
    pub(crate) sequence: Mutex<Option<u64>>,
    pub(crate) identity: RwLock<Option<SessionIdentity>>,
    pub(crate) user: RwLock<Option<Value>>,
    pub(crate) cache: GuildCache,
    pub(crate) voice: DashMap<Snowflake, VoiceSession>,
    pub(crate) joins: VoiceJoins,
    pub(crate) phase: watch::Sender<SessionPhase>,
    pub(crate) continuation: RwLock<Option<ContinuationFn>>,
    pub(crate) terminal: Mutex<Option<u16>>,
    pub(crate) recovering: AtomicBool,
    pub(crate) exited: AtomicBool,
}

impl std::fmt::Debug for GatewaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewaySession")
            .field("phase", &self.phase())
            .field("session_id", &self.identity().map(|i| i.session_id))
            .field("sequence", &self.sequence())
            .field("guilds", &self.inner.cache.len())
            .finish()
    }
}

impl GatewaySession {
    /// A session that ends with `owner`
    pub fn new(
        config: ClientConfig,
        rest: Arc<dyn RestClient>,
        audio: Arc<dyn AudioSource>,
        owner: &CancellationToken,
    ) -> Self {
        let inner = GatewayInner::new(config, rest, audio, owner.clone(), Arc::new(gateway_table()));
        Self { inner: Arc::new(inner) }
    }

    /// A session using the HTTP REST client and the configured audio command
    pub fn from_config(config: ClientConfig, owner: &CancellationToken) -> Result<Self, GatewayError> {
        let rest = HttpRestClient::new(config.api_base_url.clone(), config.token.clone())?;
        let audio = CommandAudioSource::new(config.audio_command.clone());
        Ok(Self::new(config, Arc::new(rest), Arc::new(audio), owner))
    }

    /// Install the callback that receives the replacement session after a reconnect
    pub fn on_reconnect<F>(&self, callback: F)
    where
        F: Fn(GatewaySession) + Send + Sync + 'static,
    {
        *self.inner.continuation.write() = Some(Arc::new(callback));
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Connect, identify and wait for READY
    pub async fn dial(&self) -> Result<(), GatewayError> {
        self.inner.dial().await
    }

    /// Re-dial the resume URL and resume the current session
    ///
    /// Fails fast with `NotResumable` when no session id or sequence is known.
    pub async fn resume(&self) -> Result<(), GatewayError> {
        self.inner.resume().await
    }

    /// Replace this session with a freshly identified one
    ///
    /// The cache and voice sessions move to the returned session, which is
    /// also passed to the continuation callback. This session exits.
    pub async fn reconnect(&self) -> Result<GatewaySession, GatewayError> {
        self.inner.reconnect().await
    }

    /// Close the connection and every voice session
    pub fn exit(&self) {
        self.inner.exit();
    }

    // =========================================================================
    // Voice
    // =========================================================================

    /// Join a voice channel and connect its voice session
    pub async fn join_voice(&self, guild_id: Snowflake, channel_id: Snowflake) -> Result<VoiceSession, GatewayError> {
        self.inner.join_voice(guild_id, channel_id).await
    }

    /// Leave voice in a guild and drop its voice session
    pub fn leave_voice(&self, guild_id: Snowflake) -> Result<(), GatewayError> {
        self.inner.leave_voice(guild_id)
    }

    /// Play an audio file in a guild's voice channel
    pub async fn play(&self, guild_id: Snowflake, path: &str) -> Result<PlaybackStats, GatewayError> {
        let voice = self.voice(guild_id).ok_or(GatewayError::NoVoiceSession(guild_id))?;
        Ok(voice.play(path).await?)
    }

    /// Interrupt playback in a guild
    pub fn stop(&self, guild_id: Snowflake) -> bool {
        self.voice(guild_id).is_some_and(|voice| voice.stop())
    }

    pub fn voice(&self, guild_id: Snowflake) -> Option<VoiceSession> {
        self.inner.voice.get(&guild_id).map(|voice| voice.value().clone())
    }

    // =========================================================================
    // Messaging and commands
    // =========================================================================

    pub async fn send_message(&self, channel_id: Snowflake, content: impl Into<String>) -> Result<Value, GatewayError> {
        let body = json!({ "content": content.into() });
        Ok(self.inner.rest.create_message(channel_id, &body).await?)
    }

    /// Reply to an INTERACTION_CREATE payload with a channel message
    pub async fn reply_interaction(&self, interaction: &Value, content: impl Into<String>) -> Result<(), GatewayError> {
        let id = Snowflake::from_json(interaction.get("id"))
            .ok_or_else(|| GatewayError::payload("INTERACTION_CREATE", "missing id"))?;
        let token = interaction
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::payload("INTERACTION_CREATE", "missing token"))?;
        let body = json!({ "type": 4, "data": { "content": content.into() } });
        Ok(self.inner.rest.interaction_callback(id, token, &body).await?)
    }

    /// Handle invocations of an application command by name
    pub fn register_command<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(GatewaySession, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        self.inner
            .table
            .add_command(name, move |inner: Arc<GatewayInner>, data: Value| handler(GatewaySession { inner }, data));
    }

    /// Run `listener` after each dispatch of `event`
    pub fn on_event<F>(&self, event: &str, listener: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.table.add_listener(event, listener);
    }

    pub fn update_presence(&self, presence: &PresenceUpdatePayload) -> Result<(), GatewayError> {
        self.inner.send(OpCode::PresenceUpdate, presence)
    }

    /// Ask for member chunks; they arrive as GUILD_MEMBERS_CHUNK dispatches
    pub fn request_guild_members(&self, request: &RequestGuildMembersPayload) -> Result<(), GatewayError> {
        self.inner.send(OpCode::RequestGuildMembers, request)
    }

    // =========================================================================
    // State
    // =========================================================================

    pub fn cache(&self) -> &GuildCache {
        &self.inner.cache
    }

    /// Current user from READY
    pub fn user(&self) -> Option<Value> {
        self.inner.user.read().clone()
    }

    pub fn user_id(&self) -> Option<Snowflake> {
        self.inner.user_id()
    }

    pub fn identity(&self) -> Option<SessionIdentity> {
        self.inner.identity.read().clone()
    }

    pub fn sequence(&self) -> Option<u64> {
        *self.inner.sequence.lock()
    }

    pub fn phase(&self) -> SessionPhase {
        *self.inner.phase.borrow()
    }

    /// Watch phase transitions
    pub fn watch_phase(&self) -> watch::Receiver<SessionPhase> {
        self.inner.phase.subscribe()
    }

    /// Round trip of the last acknowledged heartbeat
    pub fn latency(&self) -> Option<Duration> {
        self.inner.tracker.latency()
    }

    /// Close code that ended the session for good
    pub fn terminal_code(&self) -> Option<u16> {
        *self.inner.terminal.lock()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lifetime.is_cancelled()
    }

    /// Resolves once the session has exited
    pub async fn closed(&self) {
        self.inner.lifetime.cancelled().await;
    }
}

impl GatewayInner {
    fn new(
        config: ClientConfig,
        rest: Arc<dyn RestClient>,
        audio: Arc<dyn AudioSource>,
        owner: CancellationToken,
        table: Arc<DispatchTable<GatewayInner>>,
    ) -> Self {
        let (phase, _) = watch::channel(SessionPhase::Disconnected);
        Self {
            config,
            rest,
            audio,
            lifetime: owner.child_token(),
            owner,
            base_url: RwLock::new(None),
            transport: Mutex::new(None),
            gates: GateSet::new(),
            heartbeat: HeartbeatSlot::new(),
            tracker: HeartbeatTracker::new(),
            table,
            sequence: Mutex::new(None),
            identity: RwLock::new(None),
            user: RwLock::new(None),
            cache: GuildCache::default(),
            voice: DashMap::new(),
            joins: VoiceJoins::new(),
            phase,
            continuation: RwLock::new(None),
            terminal: Mutex::new(None),
            recovering: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        }
    }

    /// A fresh session with the same parameters, table and callbacks
    pub(crate) fn successor(&self) -> Arc<Self> {
        let next = Self::new(
            self.config.clone(),
            Arc::clone(&self.rest),
            Arc::clone(&self.audio),
            self.owner.clone(),
            Arc::clone(&self.table),
        );
        *next.base_url.write() = self.base_url.read().clone();
        *next.continuation.write() = self.continuation.read().clone();
        Arc::new(next)
    }

    pub(crate) fn user_id(&self) -> Option<Snowflake> {
        self.user
            .read()
            .as_ref()
            .and_then(|user| Snowflake::from_json(user.get("id")))
    }
}

impl SessionContext for GatewayInner {
    type Error = GatewayError;

    fn record_sequence(&self, sequence: u64) {
        *self.sequence.lock() = Some(sequence);
    }

    fn report(&self, error: DispatchError<GatewayError>) {
        match &error {
            DispatchError::UnknownEvent(event) => tracing::debug!(event = %event, "Unhandled gateway event"),
            DispatchError::UnknownOpcode(op) => tracing::warn!(op, "Unknown gateway opcode"),
            DispatchError::Handler { name, source } => {
                tracing::warn!(handler = %name, class = %source.class(), error = %source, "Gateway event dropped");
            }
        }
    }
}
