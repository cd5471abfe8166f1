//! REST collaborator
//!
//! The handful of HTTP calls the gateway session needs: bootstrap, message
//! and interaction sends, and refetching entities missing from the cache.
//! Every failure is non-fatal to the session.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use wirecord_core::Snowflake;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum RestError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response body: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for RestError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Http(e.to_string())
        }
    }
}

/// Gateway bootstrap response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayBot {
    pub url: String,
    /// Recommended shard count
    pub shards: u32,
    #[serde(default)]
    pub session_start_limit: Option<Value>,
}

#[async_trait]
pub trait RestClient: Send + Sync {
    /// Resolve the gateway URL and the recommended shard count
    async fn gateway_bot(&self) -> Result<GatewayBot, RestError>;

    async fn create_message(&self, channel_id: Snowflake, body: &Value) -> Result<Value, RestError>;

    /// Respond to an interaction
    async fn interaction_callback(&self, interaction_id: Snowflake, token: &str, body: &Value)
        -> Result<(), RestError>;

    async fn get_message(&self, channel_id: Snowflake, message_id: Snowflake) -> Result<Value, RestError>;

    async fn get_member(&self, guild_id: Snowflake, user_id: Snowflake) -> Result<Value, RestError>;
}

/// `reqwest` implementation of [`RestClient`]
#[derive(Debug, Clone)]
pub struct HttpRestClient {
    http: Client,
    base_url: String,
    token: String,
}

impl HttpRestClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, RestError> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .user_agent(concat!("wirecord (", env!("CARGO_PKG_VERSION"), ")"))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base_url))
            .header(reqwest::header::AUTHORIZATION, format!("Bot {}", self.token))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RestError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RestError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response.json().await.map_err(|e| RestError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RestClient for HttpRestClient {
    async fn gateway_bot(&self) -> Result<GatewayBot, RestError> {
        self.send(self.request(Method::GET, "/gateway/bot")).await
    }

    async fn create_message(&self, channel_id: Snowflake, body: &Value) -> Result<Value, RestError> {
        let path = format!("/channels/{channel_id}/messages");
        self.send(self.request(Method::POST, &path).json(body)).await
    }

    async fn interaction_callback(
        &self,
        interaction_id: Snowflake,
        token: &str,
        body: &Value,
    ) -> Result<(), RestError> {
        let path = format!("/interactions/{interaction_id}/{token}/callback");
        let response = self.request(Method::POST, &path).json(body).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(RestError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }

    async fn get_message(&self, channel_id: Snowflake, message_id: Snowflake) -> Result<Value, RestError> {
        let path = format!("/channels/{channel_id}/messages/{message_id}");
        self.send(self.request(Method::GET, &path)).await
    }

    async fn get_member(&self, guild_id: Snowflake, user_id: Snowflake) -> Result<Value, RestError> {
        let path = format!("/guilds/{guild_id}/members/{user_id}");
        self.send(self.request(Method::GET, &path)).await
    }
}
