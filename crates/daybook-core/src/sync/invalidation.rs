//! Invalidation channel
//!
//! One connection to the server's event stream, shared by every domain in the
//! session. Payloads are parsed into [`InvalidationEvent`]s and handed to
//! each listener in registration order. The connection is opened when the
//! first listener registers and closed when the last one goes away; while
//! open it reconnects with exponential backoff.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::credentials::TokenProvider;
use crate::error::{Result, SyncError};
use crate::listeners::{Listeners, Subscription};

/// Signal received on the event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationEvent {
    /// The server accepted the stream
    Connected,
    /// Keep-alive
    Ping,
    /// Remote state changed; pull
    Sync,
}

impl InvalidationEvent {
    /// Parse a payload tag, ignoring case and surrounding whitespace
    pub fn parse(raw: &str) -> Option<Self> {
        let tag = raw.trim();
        if tag.eq_ignore_ascii_case("sync") {
            Some(Self::Sync)
        } else if tag.eq_ignore_ascii_case("ping") {
            Some(Self::Ping)
        } else if tag.eq_ignore_ascii_case("connected") {
            Some(Self::Connected)
        } else {
            None
        }
    }
}

/// State of the underlying stream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not connected (no listeners, or waiting to reconnect)
    Disconnected,
    Connecting,
    Connected,
}

/// Raw payloads from one connection; ends when the connection closes
pub type EventStream = BoxStream<'static, Result<String>>;

/// Something that can open an event stream
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn connect(&self) -> Result<EventStream>;
}

/// Pick a source by URL scheme: `ws(s)://` or `http(s)://` (server-sent events)
pub fn source_for_url(url: &str, tokens: TokenProvider) -> Result<Arc<dyn EventSource>> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(Arc::new(WebSocketEventSource::new(url, tokens)))
    } else if url.starts_with("http://") || url.starts_with("https://") {
        Ok(Arc::new(SseEventSource::new(url, tokens)?))
    } else {
        Err(SyncError::Stream(format!(
            "Unsupported event stream URL '{}'",
            url
        )))
    }
}

/// Bearer token for a new connection; refuses to connect while signed out
fn connect_token(tokens: &TokenProvider) -> Result<String> {
    tokens
        .current()
        .map(|credential| credential.token)
        .ok_or_else(|| SyncError::auth("No credential; event stream not opened"))
}

/// Server-sent events over HTTP; each `data:` line is one payload
///
/// The token is read from the provider on every connect.
pub struct SseEventSource {
    client: reqwest::Client,
    url: String,
    tokens: TokenProvider,
}

impl SseEventSource {
    pub fn new(url: impl Into<String>, tokens: TokenProvider) -> Result<Self> {
        // No overall timeout: the response body stays open indefinitely
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            tokens,
        })
    }
}

#[async_trait]
impl EventSource for SseEventSource {
    async fn connect(&self) -> Result<EventStream> {
        let token = connect_token(&self.tokens)?;
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .bearer_auth(token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::api(
                status.as_u16(),
                format!("Event stream rejected: {}", self.url),
            ));
        }

        let bytes = Box::pin(response.bytes_stream());
        let events = stream::unfold(
            (bytes, Vec::new(), VecDeque::new()),
            |(mut bytes, mut buffer, mut ready)| async move {
                loop {
                    if let Some(payload) = ready.pop_front() {
                        return Some((Ok(payload), (bytes, buffer, ready)));
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            buffer.extend_from_slice(&chunk);
                            ready.extend(take_sse_data(&mut buffer));
                        }
                        Some(Err(e)) => {
                            return Some((Err(SyncError::from(e)), (bytes, buffer, ready)))
                        }
                        None => return None,
                    }
                }
            },
        );
        Ok(events.boxed())
    }
}

/// Drain complete lines from `buffer` and return their `data:` payloads
fn take_sse_data(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut payloads = Vec::new();
    while let Some(end) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=end).collect();
        let line = String::from_utf8_lossy(&line);
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(data) = line.strip_prefix("data:") {
            payloads.push(data.strip_prefix(' ').unwrap_or(data).to_string());
        }
    }
    payloads
}

/// WebSocket text frames; each frame is one payload
pub struct WebSocketEventSource {
    url: String,
    tokens: TokenProvider,
}

impl WebSocketEventSource {
    pub fn new(url: impl Into<String>, tokens: TokenProvider) -> Self {
        Self {
            url: url.into(),
            tokens,
        }
    }
}

#[async_trait]
impl EventSource for WebSocketEventSource {
    async fn connect(&self) -> Result<EventStream> {
        let token = connect_token(&self.tokens)?;
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SyncError::Stream(format!("Invalid event stream URL: {}", e)))?;
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| SyncError::auth("Invalid access token format"))?;
        request.headers_mut().insert(AUTHORIZATION, value);

        debug!("Connecting to {}", self.url);
        let (ws_stream, _response) = connect_async(request)
            .await
            .map_err(|e| SyncError::Stream(format!("Failed to connect to {}: {}", self.url, e)))?;

        let events = ws_stream.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(_) => None,
                Err(e) => Some(Err(SyncError::Stream(e.to_string()))),
            }
        });
        Ok(events.boxed())
    }
}

/// In-process event source; payloads passed to [`ChannelEventSource::send`]
/// reach every open connection
#[derive(Clone)]
pub struct ChannelEventSource {
    sender: broadcast::Sender<String>,
    connects: Arc<AtomicUsize>,
    failing_connects: Arc<AtomicUsize>,
}

impl ChannelEventSource {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self {
            sender,
            connects: Arc::new(AtomicUsize::new(0)),
            failing_connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Deliver a payload; returns how many connections received it
    pub fn send(&self, payload: impl Into<String>) -> usize {
        self.sender.send(payload.into()).unwrap_or(0)
    }

    /// Fail the next `count` connection attempts
    pub fn fail_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Connection attempts so far, including failed ones
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Connections currently open
    pub fn open_connections(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChannelEventSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn connect(&self) -> Result<EventStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(SyncError::Stream("connection refused".to_string()));
        }

        let receiver = self.sender.subscribe();
        let events = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(payload) => return Some((Ok(payload), receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Event stream lagged, {} payload(s) skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(events.boxed())
    }
}

struct ChannelInner {
    source: Arc<dyn EventSource>,
    listeners: Listeners<InvalidationEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
    status: watch::Sender<ConnectionStatus>,
    initial_delay: Duration,
    max_delay: Duration,
}

impl ChannelInner {
    fn dispatch_raw(&self, payload: &str) {
        match InvalidationEvent::parse(payload) {
            Some(event) => {
                debug!("Invalidation event: {:?}", event);
                self.listeners.emit(&event);
            }
            None => warn!("Ignoring unknown invalidation payload '{}'", payload.trim()),
        }
    }

    fn ensure_streaming(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime; invalidation stream not started");
            return;
        };
        info!("Opening invalidation stream");
        *task = Some(runtime.spawn(stream_loop(
            Arc::downgrade(self),
            self.source.clone(),
            self.status.clone(),
            self.initial_delay,
            self.max_delay,
        )));
    }

    fn stop_if_unused(&self) {
        let mut task = self.task.lock();
        if !self.listeners.is_empty() {
            return;
        }
        if let Some(handle) = task.take() {
            info!("Closing invalidation stream");
            handle.abort();
            let _ = self.status.send(ConnectionStatus::Disconnected);
        }
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

/// Shared, reference-counted subscription to the server event stream
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct InvalidationChannel {
    inner: Arc<ChannelInner>,
}

impl InvalidationChannel {
    /// Reconnect delays start at 1 s and double up to 30 s
    pub fn new(source: Arc<dyn EventSource>) -> Self {
        Self::with_reconnect_delays(source, Duration::from_secs(1), Duration::from_secs(30))
    }

    pub fn with_reconnect_delays(
        source: Arc<dyn EventSource>,
        initial_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let inner = Arc::new_cyclic(|weak: &Weak<ChannelInner>| {
            let weak = weak.clone();
            ChannelInner {
                source,
                listeners: Listeners::new().with_removal_hook(move |remaining| {
                    if remaining == 0 {
                        if let Some(inner) = weak.upgrade() {
                            inner.stop_if_unused();
                        }
                    }
                }),
                task: Mutex::new(None),
                status,
                initial_delay,
                max_delay,
            }
        });
        Self { inner }
    }

    /// Register a listener; the first one opens the stream
    pub fn add_listener(
        &self,
        listener: impl Fn(&InvalidationEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Subscription {
        let (subscription, count) = self.inner.listeners.add(listener);
        debug!("Invalidation listener added ({} total)", count);
        self.inner.ensure_streaming();
        subscription
    }

    /// Deliver an event to every listener; returns how many handled it
    pub fn dispatch(&self, event: InvalidationEvent) -> usize {
        self.inner.listeners.emit(&event)
    }

    /// Parse and deliver a raw payload; unknown payloads are dropped
    pub fn dispatch_raw(&self, payload: &str) {
        self.inner.dispatch_raw(payload);
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Whether the stream task is running
    pub fn is_streaming(&self) -> bool {
        self.inner
            .task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Watch the connection status
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }
}

/// Connect, forward payloads, and reconnect with backoff until aborted
async fn stream_loop(
    channel: Weak<ChannelInner>,
    source: Arc<dyn EventSource>,
    status: watch::Sender<ConnectionStatus>,
    initial_delay: Duration,
    max_delay: Duration,
) {
    let mut reconnect_delay = initial_delay;

    loop {
        let _ = status.send(ConnectionStatus::Connecting);

        match source.connect().await {
            Ok(mut events) => {
                let _ = status.send(ConnectionStatus::Connected);
                debug!("Invalidation stream connected");
                reconnect_delay = initial_delay;

                while let Some(item) = events.next().await {
                    match item {
                        Ok(payload) => {
                            let Some(channel) = channel.upgrade() else {
                                return;
                            };
                            channel.dispatch_raw(&payload);
                        }
                        Err(e) => {
                            warn!("Invalidation stream error: {}", e);
                            break;
                        }
                    }
                }
                debug!("Invalidation stream closed");
            }
            Err(e) => warn!("Invalidation stream connection failed: {}", e),
        }

        let _ = status.send(ConnectionStatus::Disconnected);
        if channel.strong_count() == 0 {
            return;
        }

        tokio::time::sleep(reconnect_delay).await;
        reconnect_delay = (reconnect_delay * 2).min(max_delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credential;

    fn counting(
        channel: &InvalidationChannel,
        wanted: InvalidationEvent,
    ) -> (Subscription, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sub = channel.add_listener(move |event| {
            if *event == wanted {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        });
        (sub, calls)
    }

    async fn wait_connected(channel: &InvalidationChannel) {
        let mut status = channel.status();
        status
            .wait_for(|s| *s == ConnectionStatus::Connected)
            .await
            .unwrap();
    }

    #[test]
    fn test_parse_tags() {
        assert_eq!(InvalidationEvent::parse("sync"), Some(InvalidationEvent::Sync));
        assert_eq!(InvalidationEvent::parse("  SYNC\n"), Some(InvalidationEvent::Sync));
        assert_eq!(InvalidationEvent::parse("Ping"), Some(InvalidationEvent::Ping));
        assert_eq!(
            InvalidationEvent::parse("connected"),
            Some(InvalidationEvent::Connected)
        );
        assert_eq!(InvalidationEvent::parse("reload"), None);
        assert_eq!(InvalidationEvent::parse(""), None);
    }

    #[test]
    fn test_sse_lines_split_across_chunks() {
        let mut buffer = b"data: sy".to_vec();
        assert!(take_sse_data(&mut buffer).is_empty());

        buffer.extend_from_slice(b"nc\r\n\r\n: comment\ndata:ping\n\ndata: conn");
        assert_eq!(take_sse_data(&mut buffer), vec!["sync", "ping"]);
        assert_eq!(buffer, b"data: conn".to_vec());
    }

    fn signed_out() -> TokenProvider {
        TokenProvider::in_memory(None, Duration::ZERO)
    }

    #[test]
    fn test_source_for_url_by_scheme() {
        assert!(source_for_url("wss://example.com/events", signed_out()).is_ok());
        assert!(source_for_url("https://example.com/events", signed_out()).is_ok());
        assert!(matches!(
            source_for_url("ftp://example.com", signed_out()),
            Err(SyncError::Stream(_))
        ));
    }

    #[tokio::test]
    async fn test_sources_refuse_to_connect_signed_out() {
        let tokens = signed_out();
        let sse = SseEventSource::new("http://127.0.0.1:9/events", tokens.clone()).unwrap();
        let ws = WebSocketEventSource::new("ws://127.0.0.1:9/events", tokens.clone());

        assert!(matches!(sse.connect().await, Err(SyncError::Auth(_))));
        assert!(matches!(ws.connect().await, Err(SyncError::Auth(_))));
        assert_eq!(connect_token(&tokens).ok(), None);

        tokens.set(&Credential::new("fresh")).unwrap();
        assert_eq!(connect_token(&tokens).unwrap(), "fresh");
        tokens.clear().unwrap();
        assert!(connect_token(&tokens).is_err());
    }

    #[test]
    fn test_dispatch_without_runtime() {
        let channel = InvalidationChannel::new(Arc::new(ChannelEventSource::new()));
        let (_sub, syncs) = counting(&channel, InvalidationEvent::Sync);

        assert!(!channel.is_streaming());
        channel.dispatch_raw("ping");
        channel.dispatch_raw("bogus");
        channel.dispatch_raw("Sync");
        assert_eq!(syncs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_one_connection_for_many_listeners() {
        let source = ChannelEventSource::new();
        let channel = InvalidationChannel::new(Arc::new(source.clone()));

        let (first, first_syncs) = counting(&channel, InvalidationEvent::Sync);
        let (second, second_syncs) = counting(&channel, InvalidationEvent::Sync);
        wait_connected(&channel).await;
        assert_eq!(source.connect_count(), 1);

        assert_eq!(source.send("sync"), 1);
        while second_syncs.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(first_syncs.load(Ordering::SeqCst), 1);

        drop(first);
        assert!(channel.is_streaming());
        drop(second);
        assert!(!channel.is_streaming());

        for _ in 0..10 {
            if source.open_connections() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(source.open_connections(), 0);
        assert_eq!(*channel.status().borrow(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_failure() {
        let source = ChannelEventSource::new();
        source.fail_connects(2);
        let channel = InvalidationChannel::new(Arc::new(source.clone()));

        let start = tokio::time::Instant::now();
        let (_sub, _) = counting(&channel, InvalidationEvent::Sync);
        wait_connected(&channel).await;

        assert_eq!(source.connect_count(), 3);
        // 1 s then 2 s of backoff
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_block_others() {
        let channel = InvalidationChannel::new(Arc::new(ChannelEventSource::new()));
        let _bad = channel.add_listener(|_| anyhow::bail!("listener failed"));
        let (_good, syncs) = counting(&channel, InvalidationEvent::Sync);

        assert_eq!(channel.dispatch(InvalidationEvent::Sync), 1);
        assert_eq!(syncs.load(Ordering::SeqCst), 1);
    }
}
