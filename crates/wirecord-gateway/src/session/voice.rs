//! Voice join, leave and re-join

use std::sync::Arc;

use wirecord_core::Snowflake;
use wirecord_voice::{VoiceConnectParams, VoiceSession};

use super::GatewayInner;
use crate::error::GatewayError;
use crate::protocol::{OpCode, VoiceStateUpdatePayload};
use crate::voice_join::VOICE_JOIN_TIMEOUT;

impl GatewayInner {
    pub(crate) async fn join_voice(
        self: &Arc<Self>,
        guild_id: Snowflake,
        channel_id: Snowflake,
    ) -> Result<VoiceSession, GatewayError> {
        let user_id = self.user_id().ok_or(GatewayError::NotReady("current user"))?;

        let join = self.joins.begin(guild_id);
        if let Err(e) = self.send(OpCode::VoiceStateUpdate, &VoiceStateUpdatePayload::join(guild_id, channel_id)) {
            self.joins.finish(guild_id, &join);
            return Err(e);
        }

        let signals = join.wait(&self.lifetime, VOICE_JOIN_TIMEOUT).await;
        self.joins.finish(guild_id, &join);
        let (state, server) = signals.map_err(|e| GatewayError::from_gate(e, GatewayError::VoiceJoinTimeout(guild_id)))?;

        if let Some((_, previous)) = self.voice.remove(&guild_id) {
            previous.exit();
        }

        let params = VoiceConnectParams {
            guild_id,
            channel_id: state.channel_id,
            user_id,
            session_id: state.session_id,
            token: server.token,
            endpoint: server.endpoint,
        };
        tracing::debug!(guild_id = %guild_id, endpoint = %params.endpoint, "Voice join confirmed");

        let voice = VoiceSession::new(params, &self.owner, Arc::clone(&self.audio), self.config.write_queue_limit);
        self.install_voice_fallback(&voice);
        voice.connect().await?;

        if self.lifetime.is_cancelled() {
            voice.exit();
            return Err(GatewayError::Cancelled);
        }
        self.voice.insert(guild_id, voice.clone());
        tracing::info!(guild_id = %guild_id, channel_id = %voice.channel_id(), "Joined voice");
        Ok(voice)
    }

    pub(crate) fn leave_voice(&self, guild_id: Snowflake) -> Result<(), GatewayError> {
        self.joins.cancel(guild_id);
        let sent = self.send(OpCode::VoiceStateUpdate, &VoiceStateUpdatePayload::leave(guild_id));
        if let Some((_, voice)) = self.voice.remove(&guild_id) {
            voice.exit();
            tracing::info!(guild_id = %guild_id, "Left voice");
        }
        sent
    }

    /// Route a voice session's failed resume back to a fresh join
    pub(crate) fn install_voice_fallback(self: &Arc<Self>, voice: &VoiceSession) {
        let weak = Arc::downgrade(self);
        voice.on_reconnect(move |guild_id| {
            if let Some(inner) = weak.upgrade() {
                inner.rejoin_voice(guild_id);
            }
        });
    }

    fn rejoin_voice(self: &Arc<Self>, guild_id: Snowflake) {
        let Some((_, voice)) = self.voice.remove(&guild_id) else {
            return;
        };
        if self.lifetime.is_cancelled() {
            return;
        }
        let channel_id = voice.channel_id();
        tracing::warn!(guild_id = %guild_id, channel_id = %channel_id, "Voice session lost, re-joining");

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = inner.join_voice(guild_id, channel_id).await {
                tracing::warn!(guild_id = %guild_id, error = %e, "Voice re-join failed");
            }
        });
    }
}
