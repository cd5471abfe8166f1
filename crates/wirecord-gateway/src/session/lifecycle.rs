//! Dial, resume, reconnect and teardown

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use serde::Serialize;
use wirecord_session::transport::Listener;
use wirecord_session::{CloseAction, ErrorKind, JsonCodec, SessionContext, Transport};

use super::{
    GatewayInner, GatewaySession, SessionIdentity, SessionPhase, HANDSHAKE_TIMEOUT, HELLO_GATE, READY_GATE,
    RESUMED_GATE, RESUME_TIMEOUT,
};
use crate::error::GatewayError;
use crate::protocol::{CloseCode, GatewayMessage, IdentifyPayload, OpCode, ResumePayload};

impl GatewayInner {
    pub(crate) fn set_phase(&self, phase: SessionPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            tracing::debug!(from = %previous, to = %phase, "Gateway phase");
        }
    }

    pub(crate) fn send<T: Serialize>(&self, op: OpCode, data: &T) -> Result<(), GatewayError> {
        if !op.is_client_op() {
            return Err(GatewayError::payload(op.name(), "not a client op"));
        }
        let message = GatewayMessage::new(op, data).map_err(|e| GatewayError::payload(op.name(), e))?;
        self.send_message(&message)
    }

    fn send_message(&self, message: &GatewayMessage) -> Result<(), GatewayError> {
        let transport = self
            .transport
            .lock()
            .clone()
            .ok_or(GatewayError::NotReady("gateway connection"))?;
        transport.write_json(message)?;
        Ok(())
    }

    /// Send a heartbeat carrying the last sequence
    pub(crate) fn send_heartbeat(&self) -> Result<(), GatewayError> {
        let sequence = *self.sequence.lock();
        self.send_message(&GatewayMessage::heartbeat(sequence))
    }

    /// One heartbeat tick; an unacknowledged previous beat means the connection is zombied
    pub(crate) fn beat(self: &Arc<Self>) -> Result<(), GatewayError> {
        if !self.tracker.mark_sent() {
            tracing::warn!("Gateway heartbeat not acknowledged, resuming");
            recover(&Arc::downgrade(self));
            return Err(GatewayError::Zombied);
        }
        self.send_heartbeat()
    }

    pub(crate) fn dispatch(self: &Arc<Self>, message: GatewayMessage) {
        tracing::trace!(op = message.op, event = ?message.t, seq = ?message.s, "Gateway payload");
        if OpCode::from_u8(message.op).is_some_and(|op| !op.is_server_op()) {
            tracing::debug!(op = message.op, "Ignoring client-only op from gateway");
            return;
        }
        if let Err(e) = self.table.handle(Arc::clone(self), message) {
            self.report(e);
        }
    }

    /// Gateway base URL from the config, or the REST bootstrap
    async fn resolve_base_url(&self) -> Result<String, GatewayError> {
        if let Some(url) = self.base_url.read().clone() {
            return Ok(url);
        }
        let url = match &self.config.gateway_url {
            Some(url) => url.clone(),
            None => {
                let bot = self.rest.gateway_bot().await?;
                tracing::debug!(url = %bot.url, recommended_shards = bot.shards, "Resolved gateway URL");
                bot.url
            }
        };
        *self.base_url.write() = Some(url.clone());
        Ok(url)
    }

    /// Open a transport to `base` and install the close-code table
    async fn connect(self: &Arc<Self>, base: &str) -> Result<(), GatewayError> {
        let url = self.config.gateway_endpoint(base);

        let weak = Arc::downgrade(self);
        let listener: Listener<GatewayMessage> = Arc::new(move |message: GatewayMessage| {
            if let Some(inner) = weak.upgrade() {
                inner.dispatch(message);
            }
        });

        let on_resume = Arc::downgrade(self);
        let on_reconnect = Arc::downgrade(self);
        let on_terminal = Arc::downgrade(self);
        let on_drop = Arc::downgrade(self);

        let transport = Transport::builder("gateway", JsonCodec::<GatewayMessage>::new())
            .write_limit(self.config.write_queue_limit)
            .lifetime(&self.lifetime)
            .on_close_codes(&CloseCode::with_action(CloseAction::Ignore), |code, _| {
                tracing::debug!(code, "Gateway closed normally");
            })
            .on_close_codes(&CloseCode::with_action(CloseAction::Resume), move |code, reason| {
                tracing::warn!(code, reason = %reason, "Gateway closed, resuming");
                recover(&on_resume);
            })
            .on_close_codes(&CloseCode::with_action(CloseAction::Reconnect), move |code, reason| {
                tracing::warn!(code, reason = %reason, "Gateway session invalidated, reconnecting");
                escalate(&on_reconnect);
            })
            .on_close_codes(&CloseCode::with_action(CloseAction::Terminate), move |code, reason| {
                if let Some(inner) = on_terminal.upgrade() {
                    inner.terminate(code, reason);
                }
            })
            .on_errors(&[ErrorKind::Eof, ErrorKind::UnexpectedEof, ErrorKind::ConnectionReset], move |e| {
                tracing::warn!(error = %e, "Gateway connection dropped, resuming");
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

    pub(crate) async fn dial(self: &Arc<Self>) -> Result<(), GatewayError> {
        if self.lifetime.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        self.set_phase(SessionPhase::Connecting);
        let hello = self.gates.reset(HELLO_GATE);
        let ready = self.gates.reset(READY_GATE);

        let handshake = async {
            let base = self.resolve_base_url().await?;
            self.connect(&base).await?;

            self.set_phase(SessionPhase::AwaitingHello);
            hello
                .wait_timeout(&self.lifetime, HANDSHAKE_TIMEOUT)
                .await
                .map_err(|e| GatewayError::from_gate(e, GatewayError::HandshakeTimeout("hello")))?;

            self.set_phase(SessionPhase::Identifying);
            self.identify()?;

            self.set_phase(SessionPhase::AwaitingReady);
            ready
                .wait_timeout(&self.lifetime, HANDSHAKE_TIMEOUT)
                .await
                .map_err(|e| GatewayError::from_gate(e, GatewayError::HandshakeTimeout("ready")))
        };

        match handshake.await {
            Ok(()) => {
                self.set_phase(SessionPhase::Active);
                let session_id = self.identity.read().as_ref().map(|i| i.session_id.clone());
                tracing::info!(session_id = ?session_id, shard = ?self.config.shard(), "Gateway session ready");
                Ok(())
            }
            Err(e) => {
                let e = self.handshake_error(e);
                tracing::warn!(error = %e, "Gateway dial failed");
                self.drop_connection();
                self.set_phase(SessionPhase::Disconnected);
                Err(e)
            }
        }
    }

    fn identify(&self) -> Result<(), GatewayError> {
        let payload = IdentifyPayload::new(self.config.token.clone(), self.config.intents).with_shard(self.config.shard());
        self.send(OpCode::Identify, &payload)
    }

    pub(crate) async fn resume(self: &Arc<Self>) -> Result<(), GatewayError> {
        if self.lifetime.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        let identity = self.identity.read().clone();
        let sequence = *self.sequence.lock();
        let (Some(SessionIdentity { session_id, resume_url }), Some(seq)) = (identity, sequence) else {
            return Err(GatewayError::NotResumable);
        };

        self.set_phase(SessionPhase::Resuming);
        self.drop_connection();
        let hello = self.gates.reset(HELLO_GATE);
        let resumed = self.gates.reset(RESUMED_GATE);

        let handshake = async {
            self.connect(&resume_url).await?;
            hello
                .wait_timeout(&self.lifetime, HANDSHAKE_TIMEOUT)
                .await
                .map_err(|e| GatewayError::from_gate(e, GatewayError::HandshakeTimeout("hello")))?;

            let payload = ResumePayload {
                token: self.config.token.clone(),
                session_id: session_id.clone(),
                seq,
            };
            self.send(OpCode::Resume, &payload)?;
            resumed
                .wait_timeout(&self.lifetime, RESUME_TIMEOUT)
                .await
                .map_err(|e| GatewayError::from_gate(e, GatewayError::ResumeTimeout))
        };

        match handshake.await {
            Ok(()) => {
                self.set_phase(SessionPhase::Active);
                tracing::info!(session_id = %session_id, seq, "Gateway session resumed");
                Ok(())
            }
            Err(e) => Err(self.handshake_error(e)),
        }
    }

    /// Dial a replacement session and hand everything over to it
    pub(crate) async fn reconnect(self: &Arc<Self>) -> Result<GatewaySession, GatewayError> {
        if self.lifetime.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        self.set_phase(SessionPhase::Reconnecting);
        self.drop_connection();
        *self.identity.write() = None;
        *self.sequence.lock() = None;

        let next = self.successor();
        if let Err(e) = next.dial().await {
            tracing::error!(error = %e, "Gateway reconnect failed");
            next.exit();
            self.exit();
            return Err(e);
        }

        self.hand_off(&next);
        let session = GatewaySession {
            inner: Arc::clone(&next),
        };
        let continuation = self.continuation.read().clone();
        match continuation {
            Some(continuation) => continuation(session.clone()),
            None => tracing::debug!("No reconnect continuation set"),
        }
        self.exit();
        tracing::info!(guilds = next.cache.len(), voice = next.voice.len(), "Gateway session replaced");
        Ok(session)
    }

    /// Move cached guilds and voice sessions to `next`
    fn hand_off(&self, next: &Arc<GatewayInner>) {
        next.cache.adopt(self.cache.take());

        let guilds: Vec<_> = self.voice.iter().map(|entry| *entry.key()).collect();
        for guild_id in guilds {
            if let Some((_, voice)) = self.voice.remove(&guild_id) {
                next.install_voice_fallback(&voice);
                next.voice.insert(guild_id, voice);
            }
        }
        self.joins.clear();
    }

    pub(crate) fn terminate(&self, code: u16, reason: &str) {
        let name = CloseCode::from_u16(code).map_or("unknown", CloseCode::description);
        tracing::error!(code, reason = %reason, close = name, "Gateway closed the session permanently");
        *self.terminal.lock() = Some(code);
        self.exit();
    }

    /// A terminal close during a handshake wins over the wait's own error
    fn handshake_error(&self, e: GatewayError) -> GatewayError {
        match *self.terminal.lock() {
            Some(code) => GatewayError::Terminal(code),
            None => e,
        }
    }

    /// Stop the heartbeat and drop the connection
    pub(crate) fn drop_connection(&self) {
        self.heartbeat.stop();
        if let Some(transport) = self.transport.lock().take() {
            transport.exit(false);
        }
    }

    /// Runs once, including after the owner token already ended the lifetime
    pub(crate) fn exit(&self) {
        if self.exited.swap(true, Ordering::AcqRel) {
            return;
        }
        self.heartbeat.stop();
        if let Some(transport) = self.transport.lock().take() {
            transport.exit(true);
        }

        let guilds: Vec<_> = self.voice.iter().map(|entry| *entry.key()).collect();
        for guild_id in guilds {
            if let Some((_, voice)) = self.voice.remove(&guild_id) {
                voice.exit();
            }
        }
        self.joins.clear();

        self.lifetime.cancel();
        self.set_phase(SessionPhase::Disconnected);
        tracing::info!("Gateway session exited");
    }
}

/// Spawn one resume attempt, escalating to a reconnect if it fails
pub(crate) fn recover(weak: &Weak<GatewayInner>) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    if inner.lifetime.is_cancelled() || inner.recovering.swap(true, Ordering::AcqRel) {
        return;
    }

    tokio::spawn(async move {
        match inner.resume().await {
            Ok(()) | Err(GatewayError::Cancelled) => {}
            Err(GatewayError::Terminal(code)) => tracing::debug!(code, "Resume ended by terminal close"),
            Err(e) => {
                tracing::warn!(error = %e, "Gateway resume failed, reconnecting");
                if let Err(e) = inner.reconnect().await {
                    tracing::debug!(error = %e, "Escalated reconnect failed");
                }
            }
        }
        inner.recovering.store(false, Ordering::Release);
    });
}

/// Spawn a reconnect, skipping resume
pub(crate) fn escalate(weak: &Weak<GatewayInner>) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    if inner.lifetime.is_cancelled() || inner.recovering.swap(true, Ordering::AcqRel) {
        return;
    }

    tokio::spawn(async move {
        if let Err(e) = inner.reconnect().await {
            tracing::debug!(error = %e, "Reconnect failed");
        }
        inner.recovering.store(false, Ordering::Release);
    });
}
