//! Connection Manager for the duplex cloud session.
//!
//! At most one [`Session`] is live at a time. Its receive task forwards
//! transport events into a single channel tagged with the session id; the
//! lifecycle loop in [`ConnectionManager::run`] consumes that channel and
//! dispatches each [`SessionEvent`] in one place. Events from a session that
//! has since been retired are ignored.
//!
//! A session retired by [`ConnectionManager::send`] emits no event, so `send`
//! signals the loop directly when it leaves the manager disconnected.

use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use async_tungstenite::tungstenite::Message;
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use printsync_protocol::{EnvelopeExtra, OutboundEnvelope};
use tokio::sync::{Mutex, Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cloud::{CloudApi, TokenStatus};
use crate::config::SettingsHandle;
use crate::envelope::EnvelopeSource;
use crate::error::AgentError;

/// What the transport hands up from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Text(String),
    Close,
    /// Ping/pong/binary; nothing to do.
    Control,
}

pub type WireSink = Pin<Box<dyn Sink<String, Error = AgentError> + Send>>;
pub type WireStream = Pin<Box<dyn Stream<Item = Result<Incoming, AgentError>> + Send>>;

/// Opens the duplex transport.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, url: &Url) -> Result<(WireSink, WireStream), AgentError>;
}

/// WebSocket transport (`ws://` and `wss://`).
pub struct WsDialer {
    connect_timeout: Duration,
}

impl WsDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, url: &Url) -> Result<(WireSink, WireStream), AgentError> {
        let (ws, _response) = timeout(
            self.connect_timeout,
            async_tungstenite::tokio::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| AgentError::Timeout("session connect".into()))?
        .map_err(|e| AgentError::Session(format!("connect failed: {e}")))?;

        let (sink, stream) = ws.split();
        let sink = sink
            .sink_map_err(|e| AgentError::Session(format!("send failed: {e}")))
            .with(|text: String| futures::future::ready(Ok::<_, AgentError>(Message::text(text))));
        let stream = stream.map(|item| match item {
            Ok(Message::Text(text)) => Ok(Incoming::Text(text.as_str().to_owned())),
            Ok(Message::Close(_)) => Ok(Incoming::Close),
            Ok(_) => Ok(Incoming::Control),
            Err(e) => Err(AgentError::Session(format!("receive failed: {e}"))),
        });
        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Opened { id: u64 },
    Message { id: u64, text: String },
    Closed { id: u64 },
    Error { id: u64, error: String },
}

impl SessionEvent {
    pub fn session_id(&self) -> u64 {
        match self {
            SessionEvent::Opened { id }
            | SessionEvent::Message { id, .. }
            | SessionEvent::Closed { id }
            | SessionEvent::Error { id, .. } => *id,
        }
    }
}

/// Consumes inbound text frames.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// Handle one frame and return the extra reply fields, or `None` to drop
    /// the frame without replying.
    async fn handle_frame(&self, raw: &str) -> Option<EnvelopeExtra>;

    /// Called after the reply has been sent.
    fn after_reply(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub dials: usize,
    pub receivers_started: usize,
    pub live_receivers: usize,
    pub max_concurrent_receivers: usize,
}

#[derive(Debug, Default)]
struct Counters {
    dials: AtomicUsize,
    receivers_started: AtomicUsize,
    live_receivers: AtomicUsize,
    max_concurrent_receivers: AtomicUsize,
}

struct ReceiverGuard(Arc<Counters>);

impl ReceiverGuard {
    fn start(counters: Arc<Counters>) -> Self {
        counters.receivers_started.fetch_add(1, Ordering::SeqCst);
        let live = counters.live_receivers.fetch_add(1, Ordering::SeqCst) + 1;
        counters
            .max_concurrent_receivers
            .fetch_max(live, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for ReceiverGuard {
    fn drop(&mut self) {
        self.0.live_receivers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One live duplex connection.
struct Session {
    id: u64,
    token: String,
    sink: WireSink,
    receiver: JoinHandle<()>,
}

pub struct ConnectionManager {
    dialer: Arc<dyn Dialer>,
    source: Arc<dyn EnvelopeSource>,
    validator: Option<Arc<dyn CloudApi>>,
    settings: SettingsHandle,
    url: Url,
    reconnect_delay: Duration,
    session: Mutex<Option<Session>>,
    connected: AtomicBool,
    next_id: AtomicU64,
    counters: Arc<Counters>,
    /// Last validation result and the token it was for.
    token_status: StdMutex<Option<(String, TokenStatus)>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    /// Raised when `send` gives up with no live session.
    lost: Notify,
}

impl ConnectionManager {
    /// `url` is the duplex endpoint without the token query.
    pub fn new(
        dialer: Arc<dyn Dialer>,
        source: Arc<dyn EnvelopeSource>,
        settings: SettingsHandle,
        url: Url,
        reconnect_delay: Duration,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            dialer,
            source,
            validator: None,
            settings,
            url,
            reconnect_delay,
            session: Mutex::new(None),
            connected: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            counters: Arc::new(Counters::default()),
            token_status: StdMutex::new(None),
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
            lost: Notify::new(),
        }
    }

    /// Validate each new token with `cloud` before connecting with it.
    pub fn with_validator(mut self, cloud: Arc<dyn CloudApi>) -> Self {
        self.validator = Some(cloud);
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            dials: self.counters.dials.load(Ordering::SeqCst),
            receivers_started: self.counters.receivers_started.load(Ordering::SeqCst),
            live_receivers: self.counters.live_receivers.load(Ordering::SeqCst),
            max_concurrent_receivers: self
                .counters
                .max_concurrent_receivers
                .load(Ordering::SeqCst),
        }
    }

    /// Result of the most recent token validation for the current token.
    pub fn token_status(&self) -> Option<TokenStatus> {
        let token = self.settings.current().auth_token.clone();
        if token.is_empty() {
            return Some(TokenStatus::Missing);
        }
        let status = self
            .token_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        status
            .as_ref()
            .filter(|(checked, _)| *checked == token)
            .map(|(_, status)| status.clone())
    }

    fn connect_blocked(&self) -> bool {
        self.token_status()
            .is_some_and(|status| status.blocks_connect())
    }

    fn dial_url(&self, token: &str) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut().clear().append_pair("token", token);
        url
    }

    /// Retire any live session, open a new one, and send one envelope right away.
    pub async fn connect(&self) -> Result<(), AgentError> {
        {
            let mut slot = self.session.lock().await;
            self.retire(&mut slot).await;
            self.establish(&mut slot).await?;
        }
        let envelope = self.source.envelope(EnvelopeExtra::default()).await;
        self.send(&envelope).await;
        Ok(())
    }

    /// Send one envelope. Without a usable session, reconnect once and retry
    /// once; otherwise the envelope is dropped.
    pub async fn send(&self, envelope: &OutboundEnvelope) -> SendOutcome {
        let text = match serde_json::to_string(envelope) {
            Ok(text) => text,
            Err(err) => {
                error!(error = %err, "failed to encode envelope");
                return SendOutcome::Dropped;
            }
        };

        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_mut() {
            match session.sink.send(text.clone()).await {
                Ok(()) => return SendOutcome::Sent,
                Err(err) => {
                    warn!(session = session.id, error = %err, "send failed, reconnecting");
                    self.retire(&mut slot).await;
                }
            }
        }

        if self.connect_blocked() {
            debug!("not connected and token is unusable; envelope dropped");
            self.lost.notify_one();
            return SendOutcome::Dropped;
        }
        if let Err(err) = self.establish(&mut slot).await {
            warn!(error = %err, "reconnect failed; envelope dropped");
            self.lost.notify_one();
            return SendOutcome::Dropped;
        }
        let Some(session) = slot.as_mut() else {
            self.lost.notify_one();
            return SendOutcome::Dropped;
        };
        match session.sink.send(text).await {
            Ok(()) => SendOutcome::Sent,
            Err(err) => {
                warn!(session = session.id, error = %err, "send failed after reconnect; envelope dropped");
                self.retire(&mut slot).await;
                self.lost.notify_one();
                SendOutcome::Dropped
            }
        }
    }

    /// Close the live session, if any, and wait for its receive task to stop.
    pub async fn disconnect(&self) {
        let mut slot = self.session.lock().await;
        self.retire(&mut slot).await;
    }

    async fn establish(&self, slot: &mut Option<Session>) -> Result<(), AgentError> {
        let token = self.settings.current().auth_token.clone();
        if token.is_empty() {
            return Err(AgentError::Auth("no auth token configured".into()));
        }
        self.counters.dials.fetch_add(1, Ordering::SeqCst);
        let (sink, stream) = self.dialer.dial(&self.dial_url(&token)).await?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let receiver = tokio::spawn(receive(
            id,
            stream,
            self.events_tx.clone(),
            Arc::clone(&self.counters),
        ));
        *slot = Some(Session {
            id,
            token,
            sink,
            receiver,
        });
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events_tx.send(SessionEvent::Opened { id });
        Ok(())
    }

    async fn retire(&self, slot: &mut Option<Session>) {
        let Some(mut session) = slot.take() else {
            return;
        };
        self.connected.store(false, Ordering::SeqCst);
        session.receiver.abort();
        let _ = (&mut session.receiver).await;
        if timeout(Duration::from_secs(1), session.sink.close())
            .await
            .is_err()
        {
            debug!(session = session.id, "session close timed out");
        }
        debug!(session = session.id, "session retired");
    }

    async fn current_session(&self) -> Option<(u64, String)> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| (s.id, s.token.clone()))
    }

    /// Validate `token` once and remember the answer.
    async fn validate(&self, token: &str) -> TokenStatus {
        let status = match (&self.validator, token.is_empty()) {
            (_, true) => TokenStatus::Missing,
            (Some(cloud), false) => cloud.ping(token).await,
            (None, false) => TokenStatus::Valid,
        };
        match &status {
            TokenStatus::Valid => info!("{}", status.message()),
            _ => warn!("{}", status.message()),
        }
        *self
            .token_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((token.to_owned(), status.clone()));
        status
    }

    /// Lifecycle loop: keeps a session open, dispatches its events, and
    /// reconnects after failures until `shutdown` fires.
    pub async fn run(
        &self,
        handler: Arc<dyn FrameHandler>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), AgentError> {
        let mut events = self
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| AgentError::Session("lifecycle loop already running".into()))?;
        let mut settings = self.settings.clone();
        let mut settings_live = true;
        let mut checked_token: Option<String> = None;

        info!(url = %self.url, "session lifecycle started");
        loop {
            if !self.is_connected() {
                let token = settings.current().auth_token.clone();
                if checked_token.as_deref() != Some(token.as_str()) {
                    self.validate(&token).await;
                    checked_token = Some(token.clone());
                }

                let blocked = self.connect_blocked();
                let attempt = if blocked {
                    None
                } else {
                    Some(self.connect().await)
                };
                if let Some(Err(err)) = &attempt {
                    warn!(error = %err, "connect failed");
                }
                if blocked || matches!(attempt, Some(Err(_))) {
                    // a blocked token only clears when the settings change
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        changed = settings.changed(), if settings_live => {
                            if changed.is_err() {
                                settings_live = false;
                            }
                        }
                        _ = tokio::time::sleep(self.reconnect_delay), if !blocked => {}
                    }
                    continue;
                }
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                changed = settings.changed(), if settings_live => match changed {
                    Ok(current) => {
                        let stale = self
                            .current_session()
                            .await
                            .is_some_and(|(_, token)| token != current.auth_token);
                        if stale {
                            info!("auth token changed, reconnecting");
                            self.disconnect().await;
                        }
                    }
                    Err(_) => settings_live = false,
                },
                _ = self.lost.notified() => {
                    if !self.is_connected() {
                        debug!("session lost outside the lifecycle loop");
                        tokio::select! {
                            _ = shutdown.recv() => break,
                            _ = tokio::time::sleep(self.reconnect_delay) => {}
                        }
                    }
                }
                event = events.recv() => match event {
                    Some(event) => {
                        if self.dispatch(event, handler.as_ref()).await {
                            tokio::select! {
                                _ = shutdown.recv() => break,
                                _ = tokio::time::sleep(self.reconnect_delay) => {}
                            }
                        }
                    }
                    None => break,
                },
            }
        }

        self.disconnect().await;
        info!("session lifecycle stopped");
        Ok(())
    }

    /// Handle one session event. Returns `true` when the session was lost
    /// and the caller should back off before reconnecting.
    async fn dispatch(&self, event: SessionEvent, handler: &dyn FrameHandler) -> bool {
        let current = self.current_session().await.map(|(id, _)| id);
        if current != Some(event.session_id()) {
            debug!(session = event.session_id(), "ignoring event from retired session");
            return false;
        }
        match event {
            SessionEvent::Opened { id } => {
                info!(session = id, "session open");
                false
            }
            SessionEvent::Message { id, text } => {
                let handled = AssertUnwindSafe(handler.handle_frame(&text))
                    .catch_unwind()
                    .await;
                match handled {
                    Ok(Some(extra)) => {
                        let envelope = self.source.envelope(extra).await;
                        self.send(&envelope).await;
                        handler.after_reply();
                    }
                    Ok(None) => {}
                    Err(_) => error!(session = id, "frame handler panicked; frame dropped"),
                }
                false
            }
            SessionEvent::Closed { id } => {
                warn!(session = id, "session closed by peer");
                self.disconnect().await;
                true
            }
            SessionEvent::Error { id, error } => {
                warn!(session = id, %error, "session error");
                self.disconnect().await;
                true
            }
        }
    }
}

async fn receive(
    id: u64,
    mut stream: WireStream,
    events: mpsc::UnboundedSender<SessionEvent>,
    counters: Arc<Counters>,
) {
    let _guard = ReceiverGuard::start(counters);
    while let Some(item) = stream.next().await {
        let event = match item {
            Ok(Incoming::Text(text)) => SessionEvent::Message { id, text },
            Ok(Incoming::Control) => continue,
            Ok(Incoming::Close) => break,
            Err(err) => {
                let _ = events.send(SessionEvent::Error {
                    id,
                    error: err.to_string(),
                });
                return;
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
    let _ = events.send(SessionEvent::Closed { id });
}
