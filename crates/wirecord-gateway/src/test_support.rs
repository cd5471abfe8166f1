//! Shared unit-test doubles

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use wirecord_common::ClientConfig;
use wirecord_core::Snowflake;
use wirecord_voice::CommandAudioSource;

use crate::rest::{GatewayBot, RestClient, RestError};
use crate::session::GatewaySession;

#[derive(Debug, Default)]
struct MockState {
    message: Option<Value>,
    member: Option<Value>,
    calls: Vec<String>,
}

/// In-memory REST client recording every call
#[derive(Debug, Clone, Default)]
pub struct MockRest {
    state: Arc<Mutex<MockState>>,
}

impl MockRest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message(self, message: Value) -> Self {
        self.state.lock().message = Some(message);
        self
    }

    pub fn with_member(self, member: Value) -> Self {
        self.state.lock().member = Some(member);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    fn record(&self, call: String) {
        self.state.lock().calls.push(call);
    }
}

fn not_found() -> RestError {
    RestError::Status {
        status: 404,
        body: r#"{"message": "Unknown"}"#.to_string(),
    }
}

#[async_trait]
impl RestClient for MockRest {
    async fn gateway_bot(&self) -> Result<GatewayBot, RestError> {
        self.record("gateway_bot".to_string());
        Err(not_found())
    }

    async fn create_message(&self, channel_id: Snowflake, body: &Value) -> Result<Value, RestError> {
        self.record(format!("create_message {channel_id}"));
        Ok(body.clone())
    }

    async fn interaction_callback(&self, interaction_id: Snowflake, token: &str, _body: &Value) -> Result<(), RestError> {
        self.record(format!("interaction_callback {interaction_id} {token}"));
        Ok(())
    }

    async fn get_message(&self, channel_id: Snowflake, message_id: Snowflake) -> Result<Value, RestError> {
        self.record(format!("get_message {channel_id} {message_id}"));
        self.state.lock().message.clone().ok_or_else(not_found)
    }

    async fn get_member(&self, guild_id: Snowflake, user_id: Snowflake) -> Result<Value, RestError> {
        self.record(format!("get_member {guild_id} {user_id}"));
        self.state.lock().member.clone().ok_or_else(not_found)
    }
}

pub fn test_config() -> ClientConfig {
    ClientConfig::from_source(|key| (key == "BOT_TOKEN").then(|| "test-token".to_string())).unwrap()
}

/// An undialed session backed by `rest`
pub fn session_with(rest: MockRest) -> GatewaySession {
    let owner = CancellationToken::new();
    GatewaySession::new(
        test_config(),
        Arc::new(rest),
        Arc::new(CommandAudioSource::new("true")),
        &owner,
    )
}
