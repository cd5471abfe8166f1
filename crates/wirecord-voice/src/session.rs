//! Voice session
//!
//! Drives the voice signaling connection:
//!
//! 1. dial, wait for Hello, start the heartbeat, send Identify
//! 2. on Ready, dial the UDP media session, run IP discovery, send
//!    SelectProtocol with the preferred encryption mode
//! 3. on SessionDescription, install the cipher, start the keepalive and
//!    close the "ready" gate that `connect` waits on
//!
//! Dropped connections and resumable close codes trigger a resume that must
//! be confirmed within two seconds; a failed resume exits the session and
//! hands off to the reconnect callback supplied by the owner.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use wirecord_core::Snowflake;
use wirecord_session::transport::Listener;
use wirecord_session::{
    CloseAction, DispatchError, DispatchTable, ErrorKind, GateSet, HeartbeatSlot, HeartbeatTracker, JsonCodec,
    SessionContext, Transport,
};

use crate::crypto::EncryptionMode;
use crate::error::VoiceError;
use crate::player::{AudioPlayer, PlaybackStats, SpeakingSignal};
use crate::protocol::{
    HelloPayload, IdentifyPayload, ReadyPayload, ResumePayload, SelectProtocolPayload, SessionDescriptionPayload,
    SpeakingPayload, VoiceCloseCode, VoiceMessage, VoiceOpCode,
};
use crate::source::AudioSource;
use crate::udp::UdpMediaSession;

pub const VOICE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const RESUME_TIMEOUT: Duration = Duration::from_secs(2);

/// Voice gateway protocol version
pub const VOICE_VERSION: u8 = 4;

const HELLO_GATE: &str = "hello";
const READY_GATE: &str = "ready";
const RESUMED_GATE: &str = "resumed";

/// Invoked with the guild id when a resume fails and the session gave up
pub type ReconnectFn = Arc<dyn Fn(Snowflake) + Send + Sync>;

/// Everything needed to identify with a voice server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceConnectParams {
    pub guild_id: Snowflake,
    pub channel_id: Snowflake,
    pub user_id: Snowflake,
    pub session_id: String,
    pub token: String,
    pub endpoint: String,
}

impl VoiceConnectParams {
    /// Websocket URL for the endpoint; bare hosts get `wss://`
    pub fn url(&self) -> String {
        let endpoint = self.endpoint.trim_end_matches('/');
        if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
            format!("{endpoint}/?v={VOICE_VERSION}")
        } else {
            format!("wss://{endpoint}/?v={VOICE_VERSION}")
        }
    }
}

/// Handle to a voice connection; clones share it
#[derive(Clone)]
pub struct VoiceSession {
    inner: Arc<VoiceInner>,
}

struct VoiceInner {
    params: RwLock<VoiceConnectParams>,
    lifetime: CancellationToken,
    write_limit: usize,
    transport: Mutex<Option<Transport>>,
    udp: Mutex<Option<UdpMediaSession>>,
    gates: GateSet,
    heartbeat: HeartbeatSlot,
    tracker: HeartbeatTracker,
    table: Arc<DispatchTable<VoiceInner>>,
    player: AudioPlayer,
    source: Arc<dyn AudioSource>,
    reconnect: RwLock<Option<ReconnectFn>>,
    ssrc: AtomicU32,
    terminal: Mutex<Option<u16>>,
    recovering: AtomicBool,
}

impl std::fmt::Debug for VoiceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceSession")
            .field("guild_id", &self.guild_id())
            .field("ready", &self.is_ready())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn voice_table() -> DispatchTable<VoiceInner> {
    DispatchTable::new()
        .on_op(VoiceOpCode::Hello.as_u8(), |s: Arc<VoiceInner>, d: Value| async move { s.on_hello(d) })
        .on_op(VoiceOpCode::Ready.as_u8(), |s: Arc<VoiceInner>, d: Value| async move { s.on_ready(d).await })
        .on_op(VoiceOpCode::SessionDescription.as_u8(), |s: Arc<VoiceInner>, d: Value| async move {
            s.on_session_description(d)
        })
        .on_op(VoiceOpCode::HeartbeatAck.as_u8(), |s: Arc<VoiceInner>, _| async move {
            s.tracker.ack();
            tracing::trace!(latency = ?s.tracker.latency(), "Voice heartbeat acknowledged");
            Ok(())
        })
        .on_op(VoiceOpCode::Resumed.as_u8(), |s: Arc<VoiceInner>, _| async move {
            s.gates.close(RESUMED_GATE);
            Ok(())
        })
        .on_op(VoiceOpCode::Speaking.as_u8(), |_, d: Value| async move {
            tracing::trace!(ssrc = %d["ssrc"], speaking = %d["speaking"], "Remote speaking update");
            Ok(())
        })
        .on_op(VoiceOpCode::ClientDisconnect.as_u8(), |_, d: Value| async move {
            tracing::debug!(user_id = %d["user_id"], "Client left the voice channel");
            Ok(())
        })
}

fn parse<T: DeserializeOwned>(op: VoiceOpCode, data: Value) -> Result<T, VoiceError> {
    serde_json::from_value(data).map_err(|e| VoiceError::payload(op.name(), e))
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

impl VoiceSession {
    /// A session that ends with `owner`
    pub fn new(
        params: VoiceConnectParams,
        owner: &CancellationToken,
        source: Arc<dyn AudioSource>,
        write_limit: usize,
    ) -> Self {
        Self {
            inner: Arc::new(VoiceInner {
                params: RwLock::new(params),
                lifetime: owner.child_token(),
                write_limit,
                transport: Mutex::new(None),
                udp: Mutex::new(None),
                gates: GateSet::new(),
                heartbeat: HeartbeatSlot::new(),
                tracker: HeartbeatTracker::new(),
                table: Arc::new(voice_table()),
                player: AudioPlayer::new(),
                source,
                reconnect: RwLock::new(None),
                ssrc: AtomicU32::new(0),
                terminal: Mutex::new(None),
                recovering: AtomicBool::new(false),
            }),
        }
    }

    /// Install the callback used when a resume fails
    pub fn on_reconnect<F>(&self, callback: F)
    where
        F: Fn(Snowflake) + Send + Sync + 'static,
    {
        *self.inner.reconnect.write() = Some(Arc::new(callback));
    }

    /// Dial, identify and wait until media encryption is negotiated
    ///
    /// Bounded by a five second timeout. A failed connect exits the session.
    pub async fn connect(&self) -> Result<(), VoiceError> {
        let inner = &self.inner;
        let hello = inner.gates.reset(HELLO_GATE);
        let ready = inner.gates.reset(READY_GATE);

        let handshake = async {
            inner.dial().await?;
            hello
                .wait(&inner.lifetime)
                .await
                .map_err(|e| VoiceError::from_gate(e, VoiceError::ConnectTimeout))?;
            inner.identify()?;
            ready
                .wait(&inner.lifetime)
                .await
                .map_err(|e| VoiceError::from_gate(e, VoiceError::ConnectTimeout))
        };

        let result = match tokio::time::timeout(VOICE_CONNECT_TIMEOUT, handshake).await {
            Ok(result) => result,
            Err(_) => Err(VoiceError::ConnectTimeout),
        };

        match result {
            Ok(()) => {
                tracing::info!(guild_id = %self.guild_id(), ssrc = self.ssrc(), "Voice connected");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(guild_id = %self.guild_id(), error = %e, "Voice connect failed");
                self.exit();
                Err(e)
            }
        }
    }

    /// Play an audio file through the configured source
    pub async fn play(&self, path: &str) -> Result<PlaybackStats, VoiceError> {
        let udp = self.inner.udp.lock().clone().ok_or(VoiceError::NotReady("media session"))?;
        if self.inner.player.is_playing() {
            return Err(VoiceError::AlreadyPlaying);
        }

        let cancel = self.inner.lifetime.child_token();
        let frames = self.inner.source.open(path, cancel.clone()).await?;
        let result = self
            .inner
            .player
            .play(frames, &udp, &*self.inner, &self.inner.lifetime)
            .await;
        cancel.cancel();
        result
    }

    /// Interrupt the current playback
    pub fn stop(&self) -> bool {
        self.inner.player.stop()
    }

    /// Reconnect to a new voice server after a server move
    pub async fn move_server(&self, token: String, endpoint: String) -> Result<(), VoiceError> {
        {
            let mut params = self.inner.params.write();
            params.token = token;
            params.endpoint = endpoint;
        }
        tracing::info!(guild_id = %self.guild_id(), "Voice server moved, reconnecting");
        self.inner.player.stop();
        self.inner.drop_connection();
        if let Some(udp) = self.inner.udp.lock().take() {
            udp.exit();
        }
        self.connect().await
    }

    /// Record the channel after the user moved within the guild
    pub fn set_channel(&self, channel_id: Snowflake) {
        self.inner.params.write().channel_id = channel_id;
    }

    /// Tear everything down
    pub fn exit(&self) {
        self.inner.exit();
    }

    pub fn guild_id(&self) -> Snowflake {
        self.inner.params.read().guild_id
    }

    pub fn channel_id(&self) -> Snowflake {
        self.inner.params.read().channel_id
    }

    pub fn params(&self) -> VoiceConnectParams {
        self.inner.params.read().clone()
    }

    pub fn ssrc(&self) -> u32 {
        self.inner.ssrc.load(Ordering::Acquire)
    }

    /// Whether encryption has been negotiated on the current connection
    pub fn is_ready(&self) -> bool {
        self.inner.gates.is_closed(READY_GATE)
    }

    pub fn is_playing(&self) -> bool {
        self.inner.player.is_playing()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lifetime.is_cancelled()
    }

    /// Close code that ended the session for good
    pub fn terminal_code(&self) -> Option<u16> {
        *self.inner.terminal.lock()
    }

    pub fn latency(&self) -> Option<Duration> {
        self.inner.tracker.latency()
    }

    pub fn media(&self) -> Option<UdpMediaSession> {
        self.inner.udp.lock().clone()
    }

    /// Resolves once the session has exited
    pub async fn closed(&self) {
        self.inner.lifetime.cancelled().await;
    }
}

impl SessionContext for VoiceInner {
    type Error = VoiceError;

    fn record_sequence(&self, sequence: u64) {
        tracing::trace!(sequence, "Voice sequence");
    }

    fn report(&self, error: DispatchError<VoiceError>) {
        tracing::warn!(guild_id = %self.params.read().guild_id, error = %error, "Voice event dropped");
    }
}

impl SpeakingSignal for VoiceInner {
    fn set_speaking(&self, speaking: bool) -> Result<(), VoiceError> {
        let payload = SpeakingPayload::microphone(speaking, self.ssrc.load(Ordering::Acquire));
        self.send(VoiceOpCode::Speaking, &payload)
    }
}

impl VoiceInner {
    fn send<T: Serialize>(&self, op: VoiceOpCode, data: &T) -> Result<(), VoiceError> {
        if !op.is_client_op() {
            return Err(VoiceError::payload(op.name(), "not a client op"));
        }
        let message = VoiceMessage::new(op, data).map_err(|e| VoiceError::payload(op.name(), e))?;
        self.send_message(&message)
    }

    fn send_message(&self, message: &VoiceMessage) -> Result<(), VoiceError> {
        let transport = self.transport.lock().clone().ok_or(VoiceError::NotReady("signaling connection"))?;
        transport.write_json(message)?;
        Ok(())
    }

    async fn dial(self: &Arc<Self>) -> Result<(), VoiceError> {
        let url = self.params.read().url();

        let weak = Arc::downgrade(self);
        let listener: Listener<VoiceMessage> = Arc::new(move |message: VoiceMessage| {
            if let Some(inner) = weak.upgrade() {
                inner.dispatch(message);
            }
        });

        let on_resume = Arc::downgrade(self);
        let on_terminal = Arc::downgrade(self);
        let on_drop = Arc::downgrade(self);

        let transport = Transport::builder("voice", JsonCodec::<VoiceMessage>::new())
            .write_limit(self.write_limit)
            .lifetime(&self.lifetime)
            .on_close_codes(&VoiceCloseCode::with_action(CloseAction::Ignore), |_, _| {})
            .on_close_codes(&VoiceCloseCode::with_action(CloseAction::Resume), move |_, _| {
                recover(&on_resume);
            })
            .on_close_codes(&VoiceCloseCode::with_action(CloseAction::Terminate), move |code, reason| {
                if let Some(inner) = on_terminal.upgrade() {
                    inner.terminate(code, reason);
                }
            })
            .on_errors(&[ErrorKind::Eof, ErrorKind::UnexpectedEof, ErrorKind::ConnectionReset], move |_| {
                recover(&on_drop);
            })
            .connect_websocket(&url, listener)
            .await?;

        self.tracker.reset();
        if let Some(previous) = self.transport.lock().replace(transport) {
            previous.exit(false);
        }
        Ok(())
    }

    fn dispatch(self: &Arc<Self>, message: VoiceMessage) {
        tracing::trace!(op = message.op, "Voice payload");
        if let Err(e) = self.table.handle(Arc::clone(self), message) {
            self.report(e);
        }
    }

    fn identify(&self) -> Result<(), VoiceError> {
        let payload = {
            let params = self.params.read();
            IdentifyPayload {
                server_id: params.guild_id.to_string(),
                user_id: params.user_id.to_string(),
                session_id: params.session_id.clone(),
                token: params.token.clone(),
            }
        };
        self.send(VoiceOpCode::Identify, &payload)
    }

    fn on_hello(self: &Arc<Self>, data: Value) -> Result<(), VoiceError> {
        let hello: HelloPayload = parse(VoiceOpCode::Hello, data)?;
        let interval = hello.interval();
        tracing::debug!(interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX), "Voice hello");

        let weak = Arc::downgrade(self);
        self.heartbeat.start(interval, &self.lifetime, move || {
            let inner = weak.upgrade().ok_or(VoiceError::Cancelled)?;
            inner.beat()
        });
        self.gates.close(HELLO_GATE);
        Ok(())
    }

    fn beat(self: &Arc<Self>) -> Result<(), VoiceError> {
        if !self.tracker.mark_sent() {
            tracing::warn!(guild_id = %self.params.read().guild_id, "Voice heartbeat not acknowledged, resuming");
            recover(&Arc::downgrade(self));
            return Err(VoiceError::Zombied);
        }
        self.send_message(&VoiceMessage::heartbeat(unix_millis()))
    }

    async fn on_ready(self: &Arc<Self>, data: Value) -> Result<(), VoiceError> {
        let ready: ReadyPayload = parse(VoiceOpCode::Ready, data)?;
        self.ssrc.store(ready.ssrc, Ordering::Release);
        let mode = EncryptionMode::preferred(&ready.modes).ok_or_else(|| VoiceError::NoSupportedMode(ready.modes.clone()))?;
        tracing::debug!(ssrc = ready.ssrc, address = %ready.address(), mode = %mode, "Voice ready");

        let udp = UdpMediaSession::new(ready.ssrc, &self.lifetime, self.write_limit);
        if let Some(previous) = self.udp.lock().replace(udp.clone()) {
            previous.exit();
        }
        udp.dial(&ready.address()).await?;
        let (address, port) = udp.discover().await?;

        self.send(VoiceOpCode::SelectProtocol, &SelectProtocolPayload::udp(address, port, mode.as_str()))
    }

    fn on_session_description(&self, data: Value) -> Result<(), VoiceError> {
        let description: SessionDescriptionPayload = parse(VoiceOpCode::SessionDescription, data)?;
        let mode: EncryptionMode = description.mode.parse()?;
        let udp = self.udp.lock().clone().ok_or(VoiceError::NotReady("media session"))?;

        udp.set_session(mode, &description.secret_key)?;
        udp.start_keepalive();
        self.gates.close(READY_GATE);
        Ok(())
    }

    /// Re-dial and resume; must be confirmed within the resume timeout
    async fn resume(self: &Arc<Self>) -> Result<(), VoiceError> {
        if self.lifetime.is_cancelled() {
            return Err(VoiceError::Cancelled);
        }
        self.drop_connection();
        let hello = self.gates.reset(HELLO_GATE);
        let resumed = self.gates.reset(RESUMED_GATE);

        let handshake = async {
            self.dial().await?;
            hello
                .wait(&self.lifetime)
                .await
                .map_err(|e| VoiceError::from_gate(e, VoiceError::ResumeTimeout))?;

            let payload = {
                let params = self.params.read();
                ResumePayload {
                    server_id: params.guild_id.to_string(),
                    session_id: params.session_id.clone(),
                    token: params.token.clone(),
                }
            };
            self.send(VoiceOpCode::Resume, &payload)?;
            resumed
                .wait(&self.lifetime)
                .await
                .map_err(|e| VoiceError::from_gate(e, VoiceError::ResumeTimeout))
        };

        tokio::time::timeout(RESUME_TIMEOUT, handshake)
            .await
            .map_err(|_| VoiceError::ResumeTimeout)?
    }

    /// Give up on this session and let the owner re-join
    fn fall_back(&self) {
        let guild_id = self.params.read().guild_id;
        let callback = self.reconnect.read().clone();
        self.exit();
        match callback {
            Some(callback) => callback(guild_id),
            None => tracing::error!(guild_id = %guild_id, "Voice resume failed and no reconnect handler is set"),
        }
    }

    fn terminate(&self, code: u16, reason: &str) {
        tracing::error!(guild_id = %self.params.read().guild_id, code, reason = %reason, "Voice session closed permanently");
        *self.terminal.lock() = Some(code);
        self.exit();
    }

    /// Stop the heartbeat and drop the signaling connection
    fn drop_connection(&self) {
        self.heartbeat.stop();
        if let Some(transport) = self.transport.lock().take() {
            transport.exit(false);
        }
    }

    fn exit(&self) {
        if self.lifetime.is_cancelled() {
            return;
        }
        self.player.stop();
        self.heartbeat.stop();
        if let Some(transport) = self.transport.lock().take() {
            transport.exit(true);
        }
        if let Some(udp) = self.udp.lock().take() {
            udp.exit();
        }
        self.lifetime.cancel();
        tracing::info!(guild_id = %self.params.read().guild_id, "Voice session exited");
    }
}

/// Spawn one resume attempt, falling back to the reconnect callback
fn recover(weak: &Weak<VoiceInner>) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    if inner.lifetime.is_cancelled() || inner.recovering.swap(true, Ordering::AcqRel) {
        return;
    }

    tokio::spawn(async move {
        let result = inner.resume().await;
        inner.recovering.store(false, Ordering::Release);
        match result {
            Ok(()) => tracing::info!(guild_id = %inner.params.read().guild_id, "Voice session resumed"),
            Err(VoiceError::Cancelled) => {}
            Err(e) => {
                tracing::warn!(guild_id = %inner.params.read().guild_id, error = %e, "Voice resume failed, reconnecting");
                inner.fall_back();
            }
        }
    });
}
