//! Push connection manager.
//!
//! A single supervisor task owns the push session and the reconnect timer.
//! Callers drive it through a command channel and observe it through a
//! `watch` channel, so there is never more than one live session or one
//! pending retry.
//!
//! Failure handling:
//! - transport errors and unexpected closes back off exponentially;
//! - credential expiry skips the backoff, refreshes once and reconnects;
//! - an intentional disconnect closes the session without scheduling a retry.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use mindease_core::config::ConnectionConfig;
use mindease_core::error::{MindeaseError, Result};
use mindease_core::events::{ChatEvent, EventBus};
use mindease_core::types::{ConnectionState, Timestamp};

use crate::auth::{CredentialProvider, Credentials};

/// Exponential reconnect delay: `min(base * 2^attempts, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_delay_ms),
            max: Duration::from_millis(config.max_delay_ms),
        }
    }

    pub fn delay(&self, attempts: u32) -> Duration {
        let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default())
    }
}

/// A frame received on an open push session.
#[derive(Debug, Clone, PartialEq)]
pub enum PushFrame {
    Message { destination: String, body: String },
    /// Server-reported error. The session is unusable afterwards.
    Error { message: String },
}

/// Opens authenticated push sessions.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Connect and wait for the server's acknowledgement.
    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn PushSession>>;
}

/// One open push session.
#[async_trait]
pub trait PushSession: Send {
    async fn subscribe(&mut self, destination: &str) -> Result<()>;

    /// Wait for the next frame. An error means the session is gone.
    async fn next_frame(&mut self) -> Result<PushFrame>;

    async fn close(&mut self);
}

/// Receives what the push session delivers.
#[async_trait]
pub trait PushHandler: Send + Sync {
    /// Called after the session is connected and subscribed. Runs on its own
    /// task so it may wait without stalling frame delivery.
    async fn on_connected(&self);

    /// A payload arrived on the user's message topic. Bodies that are not
    /// valid JSON are passed as a JSON string.
    async fn on_message(&self, payload: Value);

    async fn on_typing(&self, is_typing: bool);
}

/// Snapshot published on every connection change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Consecutive failed attempts since the last successful connect.
    pub attempts: u32,
    /// Delay until the pending retry, if one is scheduled.
    pub next_retry_ms: Option<u64>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            next_retry_ms: None,
        }
    }
}

/// Message topic for a user.
pub fn message_topic(user_id: &str) -> String {
    format!("/topic/user/{}", user_id)
}

/// Typing-indicator topic for a user.
pub fn typing_topic(user_id: &str) -> String {
    format!("/topic/user/{}/typing", user_id)
}

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    Shutdown,
}

/// Handle to the supervisor task.
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Start the supervisor and begin connecting immediately.
    pub fn spawn(
        transport: Arc<dyn PushTransport>,
        credentials: Arc<dyn CredentialProvider>,
        handler: Arc<dyn PushHandler>,
        config: &ConnectionConfig,
        events: EventBus,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());

        let supervisor = Supervisor {
            transport,
            credentials,
            handler,
            policy: BackoffPolicy::from_config(config),
            events,
            status: status_tx,
            commands: command_rx,
            attempts: 0,
            refreshed: false,
        };
        let task = tokio::spawn(supervisor.run());

        Self {
            commands: command_tx,
            status: status_rx,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status().state == ConnectionState::Connected
    }

    /// Receiver for status changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Connect now. Cancels a pending retry timer; no-op while connected.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Close the session on purpose. No retry is scheduled.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Close the session and stop the supervisor.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Connection supervisor panicked");
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// What the supervisor does next.
enum Next {
    Connect,
    Wait(Duration),
    Idle,
    Stop,
}

struct Supervisor {
    transport: Arc<dyn PushTransport>,
    credentials: Arc<dyn CredentialProvider>,
    handler: Arc<dyn PushHandler>,
    policy: BackoffPolicy,
    events: EventBus,
    status: watch::Sender<ConnectionStatus>,
    commands: mpsc::UnboundedReceiver<Command>,
    attempts: u32,
    /// Credentials were refreshed and no connect has succeeded since.
    refreshed: bool,
}

impl Supervisor {
    async fn run(mut self) {
        let mut next = Next::Connect;
        loop {
            next = match next {
                Next::Connect => self.connect_once().await,
                Next::Wait(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => Next::Connect,
                        cmd = self.commands.recv() => match cmd {
                            Some(Command::Connect) => Next::Connect,
                            Some(Command::Disconnect) => {
                                info!("Pending reconnect cancelled");
                                self.attempts = 0;
                                self.set_state(ConnectionState::Disconnected, None);
                                Next::Idle
                            }
                            Some(Command::Shutdown) | None => Next::Stop,
                        },
                    }
                }
                Next::Idle => match self.commands.recv().await {
                    Some(Command::Connect) => Next::Connect,
                    Some(Command::Disconnect) => Next::Idle,
                    Some(Command::Shutdown) | None => Next::Stop,
                },
                Next::Stop => {
                    self.set_state(ConnectionState::Disconnected, None);
                    debug!("Connection supervisor stopped");
                    return;
                }
            };
        }
    }

    async fn connect_once(&mut self) -> Next {
        let Some(credentials) = self.credentials.current().await else {
            self.unauthenticated("no credentials available");
            return Next::Idle;
        };

        self.set_state(ConnectionState::Connecting, None);
        let open = open_session(Arc::clone(&self.transport), &credentials);
        tokio::pin!(open);
        let opened = loop {
            tokio::select! {
                result = &mut open => break result,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Connect) => debug!("Connect already in progress"),
                    Some(Command::Disconnect) => {
                        self.attempts = 0;
                        self.set_state(ConnectionState::Disconnected, None);
                        info!("Pending connect abandoned");
                        return Next::Idle;
                    }
                    Some(Command::Shutdown) | None => return Next::Stop,
                },
            }
        };
        let mut session = match opened {
            Ok(session) => session,
            Err(e) => return self.on_failure(e).await,
        };

        self.attempts = 0;
        self.refreshed = false;
        self.set_state(ConnectionState::Connected, None);
        info!(user_id = %credentials.user_id, "Push connection established");

        let handler = self.handler.clone();
        tokio::spawn(async move { handler.on_connected().await });

        self.pump(session.as_mut()).await
    }

    async fn pump(&mut self, session: &mut dyn PushSession) -> Next {
        loop {
            tokio::select! {
                frame = session.next_frame() => match frame {
                    Ok(PushFrame::Message { destination, body }) => {
                        self.dispatch(&destination, body).await;
                    }
                    Ok(PushFrame::Error { message }) => {
                        warn!(message = %message, "Push server reported an error");
                        session.close().await;
                        return self.on_failure(MindeaseError::Protocol(message)).await;
                    }
                    Err(e) => {
                        session.close().await;
                        return self.on_failure(e).await;
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Connect) => {
                        debug!("Already connected");
                    }
                    Some(Command::Disconnect) => {
                        session.close().await;
                        self.attempts = 0;
                        self.set_state(ConnectionState::Disconnected, None);
                        info!("Push connection closed intentionally");
                        return Next::Idle;
                    }
                    Some(Command::Shutdown) | None => {
                        session.close().await;
                        return Next::Stop;
                    }
                },
            }
        }
    }

    async fn dispatch(&self, destination: &str, body: String) {
        if destination.ends_with("/typing") {
            match serde_json::from_str::<Value>(&body) {
                Ok(value) => {
                    let is_typing = value
                        .get("isTyping")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    self.handler.on_typing(is_typing).await;
                }
                Err(e) => warn!(error = %e, "Malformed typing frame"),
            }
            return;
        }

        let payload = serde_json::from_str::<Value>(&body).unwrap_or_else(|e| {
            warn!(error = %e, "Push payload is not JSON");
            Value::String(body)
        });
        self.handler.on_message(payload).await;
    }

    async fn on_failure(&mut self, err: MindeaseError) -> Next {
        self.set_state(ConnectionState::Disconnected, None);

        if is_expiry(&err) {
            if self.refreshed {
                self.unauthenticated(&format!("credentials rejected after refresh: {}", err));
                return Next::Idle;
            }
            info!("Credentials expired, refreshing");
            return match self.credentials.refresh().await {
                Ok(_) => {
                    self.refreshed = true;
                    self.events.publish(ChatEvent::CredentialsRefreshed {
                        timestamp: Timestamp::now(),
                    });
                    Next::Connect
                }
                Err(e) => {
                    self.unauthenticated(&e.to_string());
                    Next::Idle
                }
            };
        }

        let delay = self.policy.delay(self.attempts);
        self.attempts += 1;
        let delay_ms = delay.as_millis() as u64;
        warn!(
            error = %err,
            attempt = self.attempts,
            delay_ms,
            "Push connection lost, scheduling reconnect"
        );
        self.set_state(ConnectionState::Disconnected, Some(delay_ms));
        self.events.publish(ChatEvent::ReconnectScheduled {
            attempt: self.attempts,
            delay_ms,
            timestamp: Timestamp::now(),
        });
        Next::Wait(delay)
    }

    fn unauthenticated(&mut self, reason: &str) {
        error!(reason = %reason, "Session is unauthenticated");
        self.attempts = 0;
        self.refreshed = false;
        self.set_state(ConnectionState::Disconnected, None);
        self.events.publish(ChatEvent::SessionUnauthenticated {
            reason: reason.to_string(),
            timestamp: Timestamp::now(),
        });
    }

    fn set_state(&self, state: ConnectionState, next_retry_ms: Option<u64>) {
        let status = ConnectionStatus {
            state,
            attempts: self.attempts,
            next_retry_ms,
        };
        let previous = self.status.send_replace(status);
        if previous.state != state {
            if !previous.state.can_transition_to(&state) {
                debug!(from = %previous.state, to = %state, "Unusual connection transition");
            }
            self.events.publish(ChatEvent::ConnectionStateChanged {
                state,
                timestamp: Timestamp::now(),
            });
        }
    }
}

/// Connect and subscribe to the user's topics.
async fn open_session(
    transport: Arc<dyn PushTransport>,
    credentials: &Credentials,
) -> Result<Box<dyn PushSession>> {
    let mut session = transport.connect(credentials).await?;
    for topic in [
        message_topic(&credentials.user_id),
        typing_topic(&credentials.user_id),
    ] {
        if let Err(e) = session.subscribe(&topic).await {
            session.close().await;
            return Err(e);
        }
    }
    Ok(session)
}

fn is_expiry(err: &MindeaseError) -> bool {
    match err {
        MindeaseError::CredentialsExpired(_) => true,
        other => MindeaseError::is_expiry_message(&other.to_string()),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredentials;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Script = Arc<Mutex<VecDeque<Result<Vec<Result<PushFrame>>>>>>;

    /// Transport whose connect results follow a script. A successful connect
    /// yields a session that replays its frames and then stays silent.
    struct ScriptedTransport {
        script: Script,
        connect_delay: Duration,
        connects: AtomicUsize,
        subscriptions: Arc<Mutex<Vec<String>>>,
        closes: Arc<AtomicUsize>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<Vec<Result<PushFrame>>>>) -> Arc<Self> {
            Self::slow(script, Duration::ZERO)
        }

        /// Every connect takes `connect_delay` before its scripted result.
        fn slow(script: Vec<Result<Vec<Result<PushFrame>>>>, connect_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Arc::new(Mutex::new(script.into())),
                connect_delay,
                connects: AtomicUsize::new(0),
                subscriptions: Arc::new(Mutex::new(Vec::new())),
                closes: Arc::new(AtomicUsize::new(0)),
            })
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    struct ScriptedSession {
        frames: VecDeque<Result<PushFrame>>,
        subscriptions: Arc<Mutex<Vec<String>>>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PushTransport for ScriptedTransport {
        async fn connect(&self, _credentials: &Credentials) -> Result<Box<dyn PushSession>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if !self.connect_delay.is_zero() {
                tokio::time::sleep(self.connect_delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            let frames = match next {
                Some(Err(e)) => return Err(e),
                Some(Ok(frames)) => frames,
                None => Vec::new(),
            };
            Ok(Box::new(ScriptedSession {
                frames: frames.into(),
                subscriptions: self.subscriptions.clone(),
                closes: self.closes.clone(),
            }))
        }
    }

    #[async_trait]
    impl PushSession for ScriptedSession {
        async fn subscribe(&mut self, destination: &str) -> Result<()> {
            self.subscriptions.lock().unwrap().push(destination.to_string());
            Ok(())
        }

        async fn next_frame(&mut self) -> Result<PushFrame> {
            match self.frames.pop_front() {
                Some(frame) => frame,
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        connected: AtomicUsize,
        messages: Mutex<Vec<Value>>,
        typing: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl PushHandler for RecordingHandler {
        async fn on_connected(&self) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_message(&self, payload: Value) {
            self.messages.lock().unwrap().push(payload);
        }

        async fn on_typing(&self, is_typing: bool) {
            self.typing.lock().unwrap().push(is_typing);
        }
    }

    /// Refreshable credentials that count refresh calls.
    struct CountingCredentials {
        refreshes: AtomicUsize,
        succeed: bool,
    }

    #[async_trait]
    impl CredentialProvider for CountingCredentials {
        async fn current(&self) -> Option<Credentials> {
            Some(Credentials {
                user_id: "u1".into(),
                token: format!("t{}", self.refreshes.load(Ordering::SeqCst)),
            })
        }

        async fn refresh(&self) -> Result<Credentials> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if self.succeed {
                Ok(self.current().await.unwrap())
            } else {
                Err(MindeaseError::Unauthenticated)
            }
        }
    }

    struct NoCredentials;

    #[async_trait]
    impl CredentialProvider for NoCredentials {
        async fn current(&self) -> Option<Credentials> {
            None
        }

        async fn refresh(&self) -> Result<Credentials> {
            Err(MindeaseError::Unauthenticated)
        }
    }

    fn network_failure() -> Result<Vec<Result<PushFrame>>> {
        Err(MindeaseError::Transport("connection refused".into()))
    }

    fn spawn(
        transport: Arc<ScriptedTransport>,
        credentials: Arc<dyn CredentialProvider>,
        handler: Arc<RecordingHandler>,
        events: EventBus,
    ) -> ConnectionManager {
        ConnectionManager::spawn(
            transport,
            credentials,
            handler,
            &ConnectionConfig::default(),
            events,
        )
    }

    async fn wait_connected(manager: &ConnectionManager) {
        let mut rx = manager.subscribe();
        rx.wait_for(|s| s.state == ConnectionState::Connected)
            .await
            .unwrap();
    }

    #[test]
    fn test_backoff_delays() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (0..7).map(|n| policy.delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
        assert_eq!(policy.delay(200), Duration::from_secs(30));
    }

    #[test]
    fn test_topics() {
        assert_eq!(message_topic("42"), "/topic/user/42");
        assert_eq!(typing_topic("42"), "/topic/user/42/typing");
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_then_success() {
        let transport = ScriptedTransport::new(vec![
            network_failure(),
            network_failure(),
            network_failure(),
            Ok(vec![]),
        ]);
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let started = tokio::time::Instant::now();
        let manager = spawn(
            transport.clone(),
            Arc::new(StaticCredentials::new("u1", "t")),
            Arc::new(RecordingHandler::default()),
            events,
        );

        wait_connected(&manager).await;
        assert!(started.elapsed() >= Duration::from_millis(7000));
        assert_eq!(manager.status().attempts, 0);
        assert_eq!(transport.connects(), 4);

        let mut delays = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ChatEvent::ReconnectScheduled { delay_ms, .. } = event {
                delays.push(delay_ms);
            }
        }
        assert_eq!(delays, vec![1000, 2000, 4000]);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribes_to_both_topics_once() {
        let transport = ScriptedTransport::new(vec![Ok(vec![])]);
        let handler = Arc::new(RecordingHandler::default());
        let manager = spawn(
            transport.clone(),
            Arc::new(StaticCredentials::new("u1", "t")),
            handler.clone(),
            EventBus::new(),
        );
        wait_connected(&manager).await;

        manager.connect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.connects(), 1);
        assert_eq!(
            *transport.subscriptions.lock().unwrap(),
            vec!["/topic/user/u1".to_string(), "/topic/user/u1/typing".to_string()]
        );
        assert_eq!(handler.connected.load(Ordering::SeqCst), 1);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_are_dispatched() {
        let transport = ScriptedTransport::new(vec![Ok(vec![
            Ok(PushFrame::Message {
                destination: "/topic/user/u1".into(),
                body: r#"{"id":"1","content":"hi"}"#.into(),
            }),
            Ok(PushFrame::Message {
                destination: "/topic/user/u1/typing".into(),
                body: r#"{"isTyping":true}"#.into(),
            }),
            Ok(PushFrame::Message {
                destination: "/topic/user/u1".into(),
                body: "not json".into(),
            }),
        ])]);
        let handler = Arc::new(RecordingHandler::default());
        let manager = spawn(
            transport,
            Arc::new(StaticCredentials::new("u1", "t")),
            handler.clone(),
            EventBus::new(),
        );
        wait_connected(&manager).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let messages = handler.messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["id"], "1");
        assert_eq!(messages[1], Value::String("not json".into()));
        assert_eq!(*handler.typing.lock().unwrap(), vec![true]);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_refreshes_without_backoff() {
        let transport = ScriptedTransport::new(vec![
            Err(MindeaseError::CredentialsExpired("JWT expired".into())),
            Ok(vec![]),
        ]);
        let credentials = Arc::new(CountingCredentials {
            refreshes: AtomicUsize::new(0),
            succeed: true,
        });
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let started = tokio::time::Instant::now();
        let manager = spawn(
            transport.clone(),
            credentials.clone(),
            Arc::new(RecordingHandler::default()),
            events,
        );

        wait_connected(&manager).await;
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(credentials.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(manager.status().attempts, 0);

        let mut refreshed = false;
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, ChatEvent::ReconnectScheduled { .. }));
            refreshed |= matches!(event, ChatEvent::CredentialsRefreshed { .. });
        }
        assert!(refreshed);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_error_frame_triggers_refresh() {
        let transport = ScriptedTransport::new(vec![
            Ok(vec![Ok(PushFrame::Error {
                message: "Token expired".into(),
            })]),
            Ok(vec![]),
        ]);
        let credentials = Arc::new(CountingCredentials {
            refreshes: AtomicUsize::new(0),
            succeed: true,
        });
        let manager = spawn(
            transport.clone(),
            credentials.clone(),
            Arc::new(RecordingHandler::default()),
            EventBus::new(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.connects(), 2);
        assert_eq!(credentials.refreshes.load(Ordering::SeqCst), 1);
        assert!(manager.is_connected());
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_is_unauthenticated() {
        let transport = ScriptedTransport::new(vec![Err(MindeaseError::CredentialsExpired(
            "expired".into(),
        ))]);
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let manager = spawn(
            transport.clone(),
            Arc::new(StaticCredentials::new("u1", "t")),
            Arc::new(RecordingHandler::default()),
            events,
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.connects(), 1);
        assert_eq!(manager.status().state, ConnectionState::Disconnected);

        let mut unauthenticated = false;
        while let Ok(event) = rx.try_recv() {
            unauthenticated |= matches!(event, ChatEvent::SessionUnauthenticated { .. });
        }
        assert!(unauthenticated);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_expiry_after_refresh_gives_up() {
        let transport = ScriptedTransport::new(vec![
            Err(MindeaseError::CredentialsExpired("expired".into())),
            Err(MindeaseError::CredentialsExpired("expired".into())),
        ]);
        let credentials = Arc::new(CountingCredentials {
            refreshes: AtomicUsize::new(0),
            succeed: true,
        });
        let manager = spawn(
            transport.clone(),
            credentials.clone(),
            Arc::new(RecordingHandler::default()),
            EventBus::new(),
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.connects(), 2);
        assert_eq!(credentials.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(manager.status().state, ConnectionState::Disconnected);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_intentional_disconnect_does_not_reconnect() {
        let transport = ScriptedTransport::new(vec![Ok(vec![])]);
        let manager = spawn(
            transport.clone(),
            Arc::new(StaticCredentials::new("u1", "t")),
            Arc::new(RecordingHandler::default()),
            EventBus::new(),
        );
        wait_connected(&manager).await;

        manager.disconnect();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.connects(), 1);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        assert_eq!(manager.status(), ConnectionStatus::default());

        manager.connect();
        wait_connected(&manager).await;
        assert_eq!(transport.connects(), 2);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_failing_connect_schedules_nothing() {
        let transport = ScriptedTransport::slow(vec![network_failure()], Duration::from_secs(5));
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let manager = spawn(
            transport.clone(),
            Arc::new(StaticCredentials::new("u1", "t")),
            Arc::new(RecordingHandler::default()),
            events,
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.status().state, ConnectionState::Connecting);
        manager.disconnect();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(manager.status(), ConnectionStatus::default());
        assert_eq!(transport.connects(), 1);
        while let Ok(event) = rx.try_recv() {
            assert!(
                !matches!(event, ChatEvent::ReconnectScheduled { .. }),
                "unexpected {:?}",
                event
            );
        }
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_successful_connect_stays_offline() {
        let transport = ScriptedTransport::slow(vec![Ok(vec![])], Duration::from_secs(5));
        let handler = Arc::new(RecordingHandler::default());
        let manager = spawn(
            transport.clone(),
            Arc::new(StaticCredentials::new("u1", "t")),
            handler.clone(),
            EventBus::new(),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        manager.disconnect();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(!manager.is_connected());
        assert_eq!(handler.connected.load(Ordering::SeqCst), 0);
        assert!(transport.subscriptions.lock().unwrap().is_empty());
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_close_reconnects_after_base_delay() {
        let transport = ScriptedTransport::new(vec![
            Ok(vec![Err(MindeaseError::Transport("socket closed".into()))]),
            Ok(vec![]),
        ]);
        let manager = spawn(
            transport.clone(),
            Arc::new(StaticCredentials::new("u1", "t")),
            Arc::new(RecordingHandler::default()),
            EventBus::new(),
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.attempts, 1);
        assert_eq!(status.next_retry_ms, Some(1000));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(manager.is_connected());
        assert_eq!(transport.connects(), 2);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_cancels_pending_timer() {
        let transport = ScriptedTransport::new(vec![network_failure(), Ok(vec![])]);
        let manager = spawn(
            transport.clone(),
            Arc::new(StaticCredentials::new("u1", "t")),
            Arc::new(RecordingHandler::default()),
            EventBus::new(),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.status().attempts, 1);

        manager.connect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(manager.is_connected());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.connects(), 2);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_credentials_stays_idle() {
        let transport = ScriptedTransport::new(vec![]);
        let manager = spawn(
            transport.clone(),
            Arc::new(NoCredentials),
            Arc::new(RecordingHandler::default()),
            EventBus::new(),
        );
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.connects(), 0);
        manager.shutdown().await;
    }
}
