//! Agent-execution and messaging gateway clients.
//!
//! The remote gateway exposes a single tool-invocation endpoint,
//! `POST {base}/tools/invoke`, authenticated with a bearer token:
//!
//! ```text
//! request:  {"tool": "sessions_spawn", "args": {...}, "sessionKey"?: "..."}
//! response: {"ok": true, "result": ...}
//! ```
//!
//! [`AgentGateway`] and [`MessagingGateway`] are the seams the war room
//! depends on; [`OpenClawClient`] implements both over HTTP. The gateway is
//! pull-only, so replies are collected with [`poll_for_reply`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

const INVOKE_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// Channel used for war-room notifications.
pub const TELEGRAM_CHANNEL: &str = "telegram";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Agent gateway not configured (OPENCLAW_GATEWAY_URL/TOKEN)")]
    NotConfigured,

    #[error("No delivery target configured (TELEGRAM_CHAT_ID)")]
    NoTarget,

    #[error("Gateway request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gateway returned HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Gateway tool '{tool}' failed: {detail}")]
    ToolFailed { tool: String, detail: String },

    #[error("Malformed gateway response: {0}")]
    MalformedResponse(String),
}

/// One transcript entry from a remote session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

impl HistoryMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }

    fn is_assistant_reply(&self) -> bool {
        self.role == "assistant" && !self.content.trim().is_empty()
    }
}

/// Spawns remote reasoning sessions and reads their transcripts.
#[async_trait]
pub trait AgentGateway: Send + Sync {
    /// Start a session for `agent_id` with `prompt` as its task. Returns the
    /// session key.
    async fn spawn(&self, prompt: &str, label: &str, agent_id: &str) -> Result<String, GatewayError>;

    async fn fetch_history(
        &self,
        session_key: &str,
        limit: u32,
        include_tools: bool,
    ) -> Result<Vec<HistoryMessage>, GatewayError>;
}

/// Sends text to an external channel. Returns the delivery id when the
/// gateway reports one.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    async fn send(
        &self,
        channel: &str,
        target: &str,
        text: &str,
        thread_id: Option<&str>,
    ) -> Result<Option<String>, GatewayError>;
}

// ── Polling ───────────────────────────────────────────────────────────

/// Bounded fixed-delay polling of a session transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    /// How many transcript messages to fetch per attempt.
    pub history_limit: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 25,
            interval: Duration::from_millis(1500),
            history_limit: 50,
        }
    }
}

impl PollPolicy {
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Poll `session_key` until an assistant message appears. Returns the most
/// recent one, or `Ok(None)` once the attempt budget is exhausted.
pub async fn poll_for_reply(
    gateway: &dyn AgentGateway,
    session_key: &str,
    policy: &PollPolicy,
) -> Result<Option<String>, GatewayError> {
    let mut attempt = 0;
    while policy.should_retry(attempt) {
        if attempt > 0 {
            tokio::time::sleep(policy.interval).await;
        }
        attempt += 1;

        let history = gateway
            .fetch_history(session_key, policy.history_limit, false)
            .await?;
        if let Some(reply) = history.iter().rev().find(|m| m.is_assistant_reply()) {
            tracing::debug!(session_key, attempt, "Assistant reply observed");
            return Ok(Some(reply.content.clone()));
        }
        tracing::debug!(session_key, attempt, "No assistant reply yet");
    }
    tracing::warn!(session_key, attempts = attempt, "Timed out waiting for assistant reply");
    Ok(None)
}

// ── Notification ──────────────────────────────────────────────────────

/// Where war-room summaries are posted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelegramTarget {
    pub chat_id: Option<String>,
    pub topic_id: Option<String>,
}

impl TelegramTarget {
    fn chat_id(&self) -> Option<&str> {
        self.chat_id.as_deref().filter(|c| !c.trim().is_empty())
    }

    fn topic_id(&self) -> Option<&str> {
        self.topic_id.as_deref().filter(|t| !t.trim().is_empty())
    }
}

/// Post `text` to the Telegram target. A missing gateway and a missing chat
/// id are reported as distinct errors.
pub async fn notify(
    gateway: Option<&dyn MessagingGateway>,
    target: &TelegramTarget,
    text: &str,
) -> Result<Option<String>, GatewayError> {
    let gateway = gateway.ok_or(GatewayError::NotConfigured)?;
    let chat_id = target.chat_id().ok_or(GatewayError::NoTarget)?;
    gateway
        .send(TELEGRAM_CHANNEL, chat_id, text, target.topic_id())
        .await
}

// ── HTTP client ───────────────────────────────────────────────────────

/// HTTP client for an OpenClaw gateway.
#[derive(Debug, Clone)]
pub struct OpenClawClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl OpenClawClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder().timeout(INVOKE_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// Build a client when both URL and token are present and non-empty.
    pub fn from_parts(url: Option<&str>, token: Option<&str>) -> Result<Option<Self>, GatewayError> {
        match (
            url.filter(|u| !u.trim().is_empty()),
            token.filter(|t| !t.trim().is_empty()),
        ) {
            (Some(url), Some(token)) => Self::new(url, token).map(Some),
            _ => Ok(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Invoke a gateway tool and return its `result` payload.
    pub async fn invoke_tool(
        &self,
        tool: &str,
        args: Value,
        session_key: Option<&str>,
    ) -> Result<Value, GatewayError> {
        let mut payload = json!({ "tool": tool, "args": args });
        if let Some(key) = session_key {
            payload["sessionKey"] = json!(key);
        }

        let resp = self
            .http
            .post(format!("{}/tools/invoke", self.base_url))
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                body: truncate(&body, 200),
            });
        }

        let data: Value = serde_json::from_str(&body)
            .map_err(|e| GatewayError::MalformedResponse(format!("{}: {}", e, truncate(&body, 200))))?;
        if data.get("ok").and_then(Value::as_bool) != Some(true) {
            let detail = data
                .get("error")
                .map(|e| match e.as_str() {
                    Some(s) => s.to_string(),
                    None => e.to_string(),
                })
                .unwrap_or_else(|| data.to_string());
            return Err(GatewayError::ToolFailed {
                tool: tool.to_string(),
                detail,
            });
        }
        Ok(data.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Check reachability, authentication and tool policy.
    pub async fn probe(&self) -> GatewayStatus {
        let reachable = match self
            .http
            .get(format!("{}/health", self.base_url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().as_u16() < 500,
            Err(_) => false,
        };

        let mut status = GatewayStatus {
            configured: true,
            gateway_url: Some(self.base_url.clone()),
            reachable,
            ..GatewayStatus::default()
        };
        match self.invoke_tool("session_status", json!({}), None).await {
            Ok(_) => {
                status.auth_ok = true;
                status.tool_invoke_ok = true;
            }
            Err(GatewayError::Rejected { status: code @ (401 | 403), .. }) => {
                status.error = Some(format!("Auth failed (HTTP {})", code));
            }
            Err(GatewayError::Rejected { status: 404, .. }) => {
                // Token accepted, tool blocked by policy.
                status.auth_ok = true;
                status.error = Some("Tool not available (session_status not allowlisted)".into());
            }
            Err(GatewayError::Rejected { status: code, body }) => {
                status.error = Some(format!("HTTP error {}: {}", code, body));
            }
            Err(e) => status.error = Some(e.to_string()),
        }
        status
    }
}

#[async_trait]
impl AgentGateway for OpenClawClient {
    async fn spawn(&self, prompt: &str, label: &str, agent_id: &str) -> Result<String, GatewayError> {
        let mut args = json!({ "task": prompt });
        if !label.is_empty() {
            args["label"] = json!(label);
        }
        if !agent_id.is_empty() {
            args["agentId"] = json!(agent_id);
        }
        let result = self.invoke_tool("sessions_spawn", args, None).await?;
        ["childSessionKey", "sessionKey", "key"]
            .iter()
            .find_map(|k| result.get(*k).and_then(Value::as_str))
            .map(str::to_string)
            .ok_or_else(|| GatewayError::MalformedResponse(format!("no session key in {}", result)))
    }

    async fn fetch_history(
        &self,
        session_key: &str,
        limit: u32,
        include_tools: bool,
    ) -> Result<Vec<HistoryMessage>, GatewayError> {
        let args = json!({
            "sessionKey": session_key,
            "limit": limit,
            "includeTools": include_tools,
        });
        let result = self.invoke_tool("sessions_history", args, None).await?;
        parse_history(&result)
    }
}

#[async_trait]
impl MessagingGateway for OpenClawClient {
    async fn send(
        &self,
        channel: &str,
        target: &str,
        text: &str,
        thread_id: Option<&str>,
    ) -> Result<Option<String>, GatewayError> {
        let mut args = json!({
            "action": "send",
            "channel": channel,
            "target": target,
            "message": text,
        });
        if let Some(thread) = thread_id {
            args["threadId"] = json!(thread);
        }
        let result = self.invoke_tool("message", args, None).await?;
        Ok(["messageId", "id", "deliveryId"]
            .iter()
            .find_map(|k| match result.get(*k) {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            }))
    }
}

/// Outcome of [`OpenClawClient::probe`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayStatus {
    pub configured: bool,
    pub gateway_url: Option<String>,
    pub reachable: bool,
    pub auth_ok: bool,
    pub tool_invoke_ok: bool,
    pub error: Option<String>,
}

impl GatewayStatus {
    pub fn not_configured(gateway_url: Option<String>) -> Self {
        Self {
            gateway_url,
            error: Some(GatewayError::NotConfigured.to_string()),
            ..Self::default()
        }
    }
}

/// Messages live under `result.messages`, or `result` is the array itself.
fn parse_history(result: &Value) -> Result<Vec<HistoryMessage>, GatewayError> {
    let items = result
        .get("messages")
        .and_then(Value::as_array)
        .or_else(|| result.as_array())
        .ok_or_else(|| GatewayError::MalformedResponse(format!("no messages in {}", truncate(&result.to_string(), 200))))?;

    Ok(items
        .iter()
        .filter_map(|m| {
            let role = m.get("role").and_then(Value::as_str)?;
            Some(HistoryMessage {
                role: role.to_string(),
                content: message_text(m.get("content")?),
            })
        })
        .collect())
}

/// Content is either a string or a list of `{type: "text", text}` parts.
fn message_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
