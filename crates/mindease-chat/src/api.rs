//! Request/response chat endpoints.
//!
//! `ChatApi` is the seam the session and history paginator depend on;
//! `HttpChatApi` implements it with reqwest against the backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use mindease_core::error::{MindeaseError, Result};

use crate::auth::CredentialProvider;

/// Body of `POST /api/chat/send`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "skipAIResponse", skip_serializing_if = "std::ops::Not::not")]
    pub skip_ai_response: bool,
}

impl SendRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            session_id: None,
            skip_ai_response: false,
        }
    }
}

/// Raw message payloads returned by a successful send.
#[derive(Debug, Clone, Default)]
pub struct SendResponse {
    pub user_message: Option<Value>,
    pub bot_message: Option<Value>,
    pub crisis_message: Option<Value>,
}

impl SendResponse {
    /// Parse a send response body. Accepts both the bare shape and one
    /// wrapped in `{"data": ...}`.
    pub fn from_body(body: &Value) -> Self {
        let root = match body.get("data") {
            Some(inner) if inner.is_object() => inner,
            _ => body,
        };
        let field = |name: &str| root.get(name).filter(|v| !v.is_null()).cloned();
        Self {
            user_message: field("userMessage"),
            bot_message: field("botMessage"),
            crisis_message: field("crisisMessage"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// Query for `GET /api/chat/history`.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub page: u32,
    pub size: u32,
    pub sort: SortOrder,
    pub session_id: Option<String>,
}

/// One page of history as returned by the server (server order).
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub items: Vec<Value>,
    pub total_pages: u32,
    pub session_id: Option<String>,
}

impl HistoryPage {
    /// Parse a history response body. The page count may sit under
    /// `pagination.totalPages` or at the top level.
    pub fn from_body(body: &Value) -> Self {
        let items = match body.get("data") {
            Some(Value::Array(items)) => items.clone(),
            _ => match body {
                Value::Array(items) => items.clone(),
                _ => Vec::new(),
            },
        };
        let total_pages = body
            .get("pagination")
            .and_then(|p| p.get("totalPages"))
            .or_else(|| body.get("totalPages"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        let session_id = body
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            items,
            total_pages,
            session_id,
        }
    }
}

/// Request/response chat backend.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn send_message(&self, request: &SendRequest) -> Result<SendResponse>;

    async fn fetch_history(&self, query: &HistoryQuery) -> Result<HistoryPage>;
}

/// reqwest-backed [`ChatApi`].
pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: String,
    timeout_ms: u64,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpChatApi {
    /// Build a client with the given per-request timeout.
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MindeaseError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout_ms: timeout.as_millis() as u64,
            credentials,
        })
    }

    async fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.credentials.current().await {
            Some(creds) => builder.bearer_auth(creds.token),
            None => builder,
        }
    }

    async fn read_json(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            let text = response.text().await.unwrap_or_default();
            return Err(MindeaseError::CredentialsExpired(text));
        }
        if !status.is_success() {
            return Err(MindeaseError::Network(format!("HTTP {}", status.as_u16())));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| MindeaseError::Serialization(e.to_string()))
    }
}

fn map_reqwest_error(err: reqwest::Error, timeout_ms: u64) -> MindeaseError {
    if err.is_timeout() {
        MindeaseError::Timeout(timeout_ms)
    } else {
        MindeaseError::Network(err.to_string())
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn send_message(&self, request: &SendRequest) -> Result<SendResponse> {
        let url = format!("{}/api/chat/send", self.base_url);
        let builder = self.authorize(self.client.post(&url).json(request)).await;
        let response = builder.send().await.map_err(|e| map_reqwest_error(e, self.timeout_ms))?;
        let body = Self::read_json(response).await?;
        debug!("Send acknowledged by server");
        Ok(SendResponse::from_body(&body))
    }

    async fn fetch_history(&self, query: &HistoryQuery) -> Result<HistoryPage> {
        let url = format!("{}/api/chat/history", self.base_url);
        let mut params = vec![
            ("page", query.page.to_string()),
            ("size", query.size.to_string()),
            ("sort", query.sort.as_str().to_string()),
        ];
        if let Some(session_id) = &query.session_id {
            params.push(("sessionId", session_id.clone()));
        }
        let builder = self.authorize(self.client.get(&url).query(&params)).await;
        let response = builder.send().await.map_err(|e| map_reqwest_error(e, self.timeout_ms))?;
        let body = Self::read_json(response).await?;
        let page = HistoryPage::from_body(&body);
        debug!(
            page = query.page,
            items = page.items.len(),
            total_pages = page.total_pages,
            "History page fetched"
        );
        Ok(page)
    }
}

// =============================================================================
// Tests
// =============================================================================
