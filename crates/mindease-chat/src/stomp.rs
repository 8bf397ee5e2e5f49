//! STOMP 1.2 over WebSocket.
//!
//! Implements [`PushTransport`] against a Spring-style broker: one STOMP
//! frame per WebSocket text message, a lone newline as heart-beat.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

use mindease_core::config::ConnectionConfig;
use mindease_core::error::{MindeaseError, Result};

use crate::auth::Credentials;
use crate::connection::{PushFrame, PushSession, PushTransport};

/// Time allowed for the socket handshake and the CONNECTED reply.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Missed heart-beats tolerated before the session is declared dead.
const HEARTBEAT_TOLERANCE: u32 = 3;

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header. Repeated headers keep the first occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// CONNECT and CONNECTED frames carry their headers unescaped.
    fn escapes_headers(command: &str) -> bool {
        !matches!(command, "CONNECT" | "CONNECTED")
    }

    pub fn encode(&self) -> String {
        let escape = Self::escapes_headers(&self.command);
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(&self.command);
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse one frame. Returns `Ok(None)` for a heart-beat.
    pub fn decode(raw: &str) -> Result<Option<StompFrame>> {
        let raw = raw.trim_start_matches(['\r', '\n']);
        if raw.is_empty() || raw == "\0" {
            return Ok(None);
        }
        let raw = raw.strip_suffix('\0').unwrap_or(raw);

        let (head, body) = match raw.find("\n\n") {
            Some(i) => (&raw[..i], &raw[i + 2..]),
            None => match raw.find("\r\n\r\n") {
                Some(i) => (&raw[..i], &raw[i + 4..]),
                None => (raw, ""),
            },
        };

        let mut lines = head.lines();
        let command = lines
            .next()
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.is_empty())
            .ok_or_else(|| MindeaseError::Protocol("frame has no command".to_string()))?
            .to_string();
        let escape = Self::escapes_headers(&command);

        let mut headers = Vec::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            let Some((name, value)) = line.split_once(':') else {
                return Err(MindeaseError::Protocol(format!(
                    "malformed header line: {}",
                    line
                )));
            };
            if escape {
                headers.push((unescape_header(name), unescape_header(value)));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        Ok(Some(StompFrame {
            command,
            headers,
            body: body.trim_end_matches('\0').to_string(),
        }))
    }
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Negotiated heart-beat intervals: (client sends every, server sends every).
///
/// Each direction is disabled when either side asks for zero.
pub fn negotiate_heartbeat(
    client_ms: u64,
    server_header: Option<&str>,
) -> (Option<Duration>, Option<Duration>) {
    let (server_sends, server_wants) = server_header
        .and_then(|h| h.split_once(','))
        .map(|(sx, sy)| {
            (
                sx.trim().parse::<u64>().unwrap_or(0),
                sy.trim().parse::<u64>().unwrap_or(0),
            )
        })
        .unwrap_or((0, 0));

    let direction = |ours: u64, theirs: u64| {
        if ours == 0 || theirs == 0 {
            None
        } else {
            Some(Duration::from_millis(ours.max(theirs)))
        }
    };
    (
        direction(client_ms, server_wants),
        direction(client_ms, server_sends),
    )
}

/// WebSocket URL for a backend base URL and socket path.
pub fn websocket_url(base_url: &str, ws_path: &str) -> Result<Url> {
    let mut url = Url::parse(base_url)
        .map_err(|e| MindeaseError::Config(format!("Invalid base URL {}: {}", base_url, e)))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(MindeaseError::Config(format!(
                "Unsupported URL scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| MindeaseError::Config(format!("Cannot use scheme {}", scheme)))?;
    let path = format!(
        "{}/{}",
        url.path().trim_end_matches('/'),
        ws_path.trim_start_matches('/')
    );
    url.set_path(&path);
    Ok(url)
}

/// [`PushTransport`] speaking STOMP over a WebSocket.
#[derive(Debug, Clone)]
pub struct StompTransport {
    url: Url,
    heartbeat_ms: u64,
}

impl StompTransport {
    pub fn new(base_url: &str, config: &ConnectionConfig) -> Result<Self> {
        Ok(Self {
            url: websocket_url(base_url, &config.ws_path)?,
            heartbeat_ms: config.heartbeat_ms,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn connect_frame(&self, credentials: &Credentials) -> StompFrame {
        let host = self.url.host_str().unwrap_or("localhost").to_string();
        StompFrame::new("CONNECT")
            .header("accept-version", "1.2")
            .header("host", host)
            .header(
                "heart-beat",
                format!("{},{}", self.heartbeat_ms, self.heartbeat_ms),
            )
            .header("Authorization", format!("Bearer {}", credentials.token))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn transport_error(err: impl std::fmt::Display) -> MindeaseError {
    MindeaseError::Transport(err.to_string())
}

/// Map an ERROR frame to an error, recognising credential expiry.
fn error_from_frame(frame: &StompFrame) -> MindeaseError {
    let message = frame
        .get("message")
        .map(str::to_string)
        .unwrap_or_else(|| frame.body.clone());
    if MindeaseError::is_expiry_message(&message) || MindeaseError::is_expiry_message(&frame.body)
    {
        MindeaseError::CredentialsExpired(message)
    } else {
        MindeaseError::Protocol(message)
    }
}

async fn read_frame(stream: &mut SplitStream<WsStream>) -> Result<StompFrame> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                if let Some(frame) = StompFrame::decode(&text)? {
                    return Ok(frame);
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(MindeaseError::Transport("socket closed".to_string()))
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(transport_error(e)),
        }
    }
}

#[async_trait]
impl PushTransport for StompTransport {
    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn PushSession>> {
        debug!(url = %self.url, "Opening push socket");
        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str()))
            .await
            .map_err(|_| MindeaseError::Timeout(CONNECT_TIMEOUT.as_millis() as u64))?
            .map_err(transport_error)?;
        let (mut sink, mut stream) = ws.split();

        sink.send(Message::Text(self.connect_frame(credentials).encode()))
            .await
            .map_err(transport_error)?;

        let reply = tokio::time::timeout(CONNECT_TIMEOUT, read_frame(&mut stream))
            .await
            .map_err(|_| MindeaseError::Timeout(CONNECT_TIMEOUT.as_millis() as u64))??;

        match reply.command.as_str() {
            "CONNECTED" => {}
            "ERROR" => return Err(error_from_frame(&reply)),
            other => {
                return Err(MindeaseError::Protocol(format!(
                    "expected CONNECTED, got {}",
                    other
                )))
            }
        }

        let (send_every, receive_every) =
            negotiate_heartbeat(self.heartbeat_ms, reply.get("heart-beat"));
        info!(
            version = reply.get("version").unwrap_or("1.2"),
            "STOMP session established"
        );

        let now = Instant::now();
        Ok(Box::new(StompSession {
            sink,
            stream,
            next_subscription: 0,
            send_every,
            receive_within: receive_every.map(|d| d * HEARTBEAT_TOLERANCE),
            last_sent: now,
            last_received: now,
        }))
    }
}

/// An open STOMP session.
pub struct StompSession {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
    next_subscription: u32,
    send_every: Option<Duration>,
    receive_within: Option<Duration>,
    last_sent: Instant,
    last_received: Instant,
}

impl StompSession {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(transport_error)?;
        self.last_sent = Instant::now();
        Ok(())
    }

    fn translate(frame: StompFrame) -> Option<PushFrame> {
        match frame.command.as_str() {
            "MESSAGE" => Some(PushFrame::Message {
                destination: frame.get("destination").unwrap_or_default().to_string(),
                body: frame.body,
            }),
            "ERROR" => {
                let message = frame
                    .get("message")
                    .map(str::to_string)
                    .unwrap_or(frame.body);
                Some(PushFrame::Error { message })
            }
            other => {
                trace!(command = other, "Ignoring STOMP frame");
                None
            }
        }
    }
}

#[async_trait]
impl PushSession for StompSession {
    async fn subscribe(&mut self, destination: &str) -> Result<()> {
        let id = format!("sub-{}", self.next_subscription);
        self.next_subscription += 1;
        let frame = StompFrame::new("SUBSCRIBE")
            .header("id", id.as_str())
            .header("destination", destination)
            .header("ack", "auto");
        self.send_text(frame.encode()).await?;
        debug!(id = %id, destination, "Subscribed");
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<PushFrame> {
        loop {
            let heartbeat_at = self
                .send_every
                .map(|every| self.last_sent + every)
                .unwrap_or_else(|| Instant::now() + FAR_FUTURE);
            let silence_at = self
                .receive_within
                .map(|within| self.last_received + within)
                .unwrap_or_else(|| Instant::now() + FAR_FUTURE);

            tokio::select! {
                incoming = self.stream.next() => {
                    self.last_received = Instant::now();
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(frame) = StompFrame::decode(&text)? {
                                if let Some(push) = Self::translate(frame) {
                                    return Ok(push);
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(MindeaseError::Transport("socket closed".to_string()));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(transport_error(e)),
                    }
                }
                _ = tokio::time::sleep_until(heartbeat_at) => {
                    self.send_text("\n".to_string()).await?;
                }
                _ = tokio::time::sleep_until(silence_at) => {
                    warn!("No heart-beat from server");
                    return Err(MindeaseError::Transport("heart-beat timeout".to_string()));
                }
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.send_text(StompFrame::new("DISCONNECT").encode()).await;
        let _ = self.sink.close().await;
    }
}

// =============================================================================
// Tests
// =============================================================================
