//! Conversational agent backends.
//!
//! The chat dispatcher hands one message at a time to a [`ChatAgent`]. An
//! agent either answers inline ([`AgentReply::Completed`]) or acknowledges
//! and completes later through `POST /api/graphs/:id/chat/:message_id/complete`
//! ([`AgentReply::Pending`]).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::ChatMessage;
use crate::{Error, Result};

/// Default request timeout for [`HttpAgent`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// How an agent answered a dispatched message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentReply {
    /// The reply text; the message is complete.
    Completed(String),
    /// The agent accepted the message and will post the completion itself.
    Pending,
}

/// An external agent reachable by the chat dispatcher.
#[async_trait]
pub trait ChatAgent: Send + Sync {
    async fn send_chat(&self, graph_id: &str, message: &ChatMessage) -> Result<AgentReply>;
}

/// Request body posted to an HTTP agent.
#[derive(Debug, Serialize)]
struct AgentRequest<'a> {
    graph_id: &'a str,
    message: &'a ChatMessage,
}

/// Response body expected from an HTTP agent.
#[derive(Debug, Deserialize)]
struct AgentResponse {
    #[serde(default)]
    reply: Option<String>,
    #[serde(default)]
    pending: bool,
}

/// Agent reached over HTTP.
pub struct HttpAgent {
    client: reqwest::Client,
    url: String,
}

impl HttpAgent {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Agent(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ChatAgent for HttpAgent {
    async fn send_chat(&self, graph_id: &str, message: &ChatMessage) -> Result<AgentReply> {
        let response = self
            .client
            .post(&self.url)
            .json(&AgentRequest { graph_id, message })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Agent(format!("request to {} failed: {}", self.url, e)))?;

        let body: AgentResponse = response
            .json()
            .await
            .map_err(|e| Error::Agent(format!("invalid agent response: {}", e)))?;

        match body {
            AgentResponse {
                reply: Some(reply), ..
            } => Ok(AgentReply::Completed(reply)),
            AgentResponse { pending: true, .. } => Ok(AgentReply::Pending),
            _ => Err(Error::Agent(
                "agent response has neither reply nor pending".to_string(),
            )),
        }
    }
}

/// Local agent that answers immediately by echoing the message.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoAgent;

#[async_trait]
impl ChatAgent for EchoAgent {
    async fn send_chat(&self, _graph_id: &str, message: &ChatMessage) -> Result<AgentReply> {
        Ok(AgentReply::Completed(format!("{}: {}", message.author, message.text)))
    }
}
