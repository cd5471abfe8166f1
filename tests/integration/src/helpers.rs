//! Test helpers for integration tests
//!
//! Scripted gateway and voice servers, a recording REST client, and a
//! polling helper for state that settles asynchronously.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use wirecord_common::ClientConfig;
use wirecord_core::Snowflake;
use wirecord_gateway::{GatewayBot, GatewaySession, RestClient, RestError};
use wirecord_voice::discovery::DiscoveryPacket;
use wirecord_voice::CommandAudioSource;

/// Upper bound on any single scripted wait
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Gateway server
// ============================================================================

/// Loopback websocket server the client dials
pub struct MockGateway {
    listener: TcpListener,
    url: String,
}

impl MockGateway {
    pub async fn bind() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("ws://{}", listener.local_addr()?);
        Ok(Self { listener, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Accept the next client connection
    pub async fn accept(&self) -> Result<ServerConn> {
        let (stream, _) = tokio::time::timeout(STEP_TIMEOUT, self.listener.accept())
            .await
            .context("no client connection")??;
        let ws = tokio_tungstenite::accept_async(stream).await?;
        Ok(ServerConn { ws })
    }
}

/// Server side of one websocket connection
pub struct ServerConn {
    ws: WebSocketStream<TcpStream>,
}

impl ServerConn {
    pub async fn send(&mut self, payload: Value) -> Result<()> {
        self.ws.send(Message::Text(payload.to_string())).await?;
        Ok(())
    }

    /// Next JSON payload, heartbeats included
    pub async fn recv_any(&mut self) -> Result<Value> {
        loop {
            let frame = tokio::time::timeout(STEP_TIMEOUT, self.ws.next())
                .await
                .context("no payload from client")?
                .ok_or_else(|| anyhow!("client closed the connection"))??;
            match frame {
                Message::Text(text) => return Ok(serde_json::from_str(&text)?),
                Message::Close(frame) => bail!("client closed the connection: {frame:?}"),
                _ => continue,
            }
        }
    }

    /// Next payload that is not a heartbeat
    pub async fn recv(&mut self) -> Result<Value> {
        loop {
            let payload = self.recv_any().await?;
            if payload["op"] != 1 {
                return Ok(payload);
            }
        }
    }

    /// Next payload, which must carry `op`
    pub async fn expect_op(&mut self, op: u64) -> Result<Value> {
        let payload = self.recv().await?;
        if payload["op"] != op {
            bail!("expected op {op}, got {payload}");
        }
        Ok(payload)
    }

    /// Hello, Identify, READY; returns the Identify payload
    pub async fn handshake(&mut self, seq: u64, session_id: &str, resume_url: &str) -> Result<Value> {
        self.send(crate::hello(45_000)).await?;
        let identify = self.expect_op(2).await?;
        self.send(crate::ready(seq, session_id, resume_url)).await?;
        Ok(identify)
    }

    pub async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        let frame = CloseFrame {
            code: WsCloseCode::from(code),
            reason: reason.to_string().into(),
        };
        self.ws.close(Some(frame)).await?;
        Ok(())
    }
}

// ============================================================================
// Voice server
// ============================================================================

/// Loopback voice signaling and media endpoints
pub struct MockVoice {
    listener: TcpListener,
    udp: UdpSocket,
    endpoint: String,
}

impl MockVoice {
    pub async fn bind() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let udp = UdpSocket::bind("127.0.0.1:0").await?;
        let endpoint = format!("ws://{}", listener.local_addr()?);
        Ok(Self { listener, udp, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Accept a voice connection and run it to Session Description
    ///
    /// Returns the voice Identify payload and the open connection.
    pub async fn accept_and_handshake(&self, ssrc: u32) -> Result<(Value, ServerConn)> {
        let (stream, _) = tokio::time::timeout(STEP_TIMEOUT, self.listener.accept())
            .await
            .context("no voice connection")??;
        let mut conn = ServerConn {
            ws: tokio_tungstenite::accept_async(stream).await?,
        };

        conn.send(json!({"op": 8, "d": {"heartbeat_interval": 41_250.0}})).await?;
        let identify = voice_recv(&mut conn).await?;

        let port = self.udp.local_addr()?.port();
        conn.send(json!({
            "op": 2,
            "d": {"ssrc": ssrc, "ip": "127.0.0.1", "port": port, "modes": ["aead_aes256_gcm_rtpsize", "xchacha20_poly1305"]}
        }))
        .await?;

        let mut buf = [0u8; 128];
        let (n, from) = tokio::time::timeout(STEP_TIMEOUT, self.udp.recv_from(&mut buf))
            .await
            .context("no discovery probe")??;
        DiscoveryPacket::decode(&buf[..n]).map_err(|e| anyhow!("bad discovery probe: {e}"))?;
        self.udp
            .send_to(&DiscoveryPacket::response(ssrc, "203.0.113.5", 50_000).encode(), from)
            .await?;

        let select = voice_recv(&mut conn).await?;
        let mode = select["d"]["data"]["mode"].clone();
        conn.send(json!({"op": 4, "d": {"mode": mode, "secret_key": vec![7u8; 32]}})).await?;
        Ok((identify, conn))
    }
}

/// Next voice payload that is not a heartbeat (voice op 3)
async fn voice_recv(conn: &mut ServerConn) -> Result<Value> {
    loop {
        let payload = conn.recv_any().await?;
        if payload["op"] != 3 {
            return Ok(payload);
        }
    }
}

// ============================================================================
// REST client
// ============================================================================

/// REST client that records calls and answers from canned entities
#[derive(Debug, Clone, Default)]
pub struct RecordingRest {
    calls: Arc<Mutex<Vec<String>>>,
    message: Arc<Mutex<Option<Value>>>,
}

impl RecordingRest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message(self, message: Value) -> Self {
        *self.message.lock() = Some(message);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

fn unknown() -> RestError {
    RestError::Status {
        status: 404,
        body: "{}".to_string(),
    }
}

#[async_trait]
impl RestClient for RecordingRest {
    async fn gateway_bot(&self) -> Result<GatewayBot, RestError> {
        self.record("gateway_bot".to_string());
        Err(unknown())
    }

    async fn create_message(&self, channel_id: Snowflake, body: &Value) -> Result<Value, RestError> {
        self.record(format!("create_message {channel_id}"));
        Ok(body.clone())
    }

    async fn interaction_callback(&self, interaction_id: Snowflake, token: &str, body: &Value) -> Result<(), RestError> {
        self.record(format!("interaction_callback {interaction_id} {token} {}", body["data"]["content"]));
        Ok(())
    }

    async fn get_message(&self, channel_id: Snowflake, message_id: Snowflake) -> Result<Value, RestError> {
        self.record(format!("get_message {channel_id} {message_id}"));
        self.message.lock().clone().ok_or_else(unknown)
    }

    async fn get_member(&self, guild_id: Snowflake, user_id: Snowflake) -> Result<Value, RestError> {
        self.record(format!("get_member {guild_id} {user_id}"));
        Err(unknown())
    }
}

// ============================================================================
// Client
// ============================================================================

pub fn test_config(gateway_url: &str) -> Result<ClientConfig> {
    let vars = [
        ("BOT_TOKEN", "test-token"),
        ("GATEWAY_URL", gateway_url),
        ("GATEWAY_INTENTS", "641"),
        ("SHARD_ID", "0"),
        ("SHARD_COUNT", "1"),
    ];
    Ok(ClientConfig::from_source(|key| {
        vars.iter().find(|(k, _)| *k == key).map(|(_, v)| (*v).to_string())
    })?)
}

/// A session pointed at `gateway`, plus its owner token
pub fn client(gateway: &MockGateway, rest: RecordingRest) -> Result<(GatewaySession, CancellationToken)> {
    let owner = CancellationToken::new();
    let session = GatewaySession::new(
        test_config(gateway.url())?,
        Arc::new(rest),
        Arc::new(CommandAudioSource::new("true")),
        &owner,
    );
    Ok((session, owner))
}

/// Poll `condition` until it holds or the step timeout passes
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
