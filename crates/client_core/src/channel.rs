//! Real-time message channel scoped to one conversation or complaint.
//!
//! The socket lives on its own task and reports `Closed → Connecting → Open
//! ⇄ Reconnecting → Closed` through a watch channel. History pages come from
//! a [`MessageHistory`] (normally the request client), independent of the
//! socket state.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use shared::{
    domain::{ChatMessage, MessageType, ThreadRef},
    protocol::{ChannelRequest, MessagePage, ServerEvent},
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot, watch, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::ReconnectPolicy,
    credentials::CredentialStore,
    error::{ChannelError, RequestError},
    message_window::{
        MessageArrival, MessageWindow, OlderFetch, ScrollAction, ScrollAnchor, Viewport,
    },
    request_client::RequestClient,
    ClientEvent, NoticeLevel,
};

const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Closed,
    Connecting,
    Open,
    Reconnecting { attempt: u32 },
}

impl ChannelStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Source of paginated history for a thread.
#[async_trait]
pub trait MessageHistory: Send + Sync {
    async fn fetch_page(
        &self,
        thread: ThreadRef,
        page: u32,
        limit: u32,
    ) -> Result<MessagePage, RequestError>;
}

#[derive(Serialize)]
struct HistoryQuery {
    page: u32,
    limit: u32,
}

#[async_trait]
impl MessageHistory for RequestClient {
    async fn fetch_page(
        &self,
        thread: ThreadRef,
        page: u32,
        limit: u32,
    ) -> Result<MessagePage, RequestError> {
        self.get_with_query(&thread.history_path(), &HistoryQuery { page, limit })
            .await
    }
}

/// Socket settings. The credential is read from `credentials` on every
/// connect attempt so a reconnect picks up a refreshed token.
#[derive(Clone)]
pub struct ChannelConfig {
    pub ws_base: String,
    pub credentials: Arc<dyn CredentialStore>,
    pub page_size: u32,
    pub scroll_threshold_px: f64,
    pub reconnect: ReconnectPolicy,
}

/// Older messages that were prepended, plus the anchor to restore scroll.
#[derive(Debug, Clone)]
pub struct OlderPage {
    pub added: Vec<ChatMessage>,
    pub anchor: ScrollAnchor,
}

type MessageHandler = Arc<dyn Fn(&MessageArrival) + Send + Sync>;

struct ChannelShared {
    thread: ThreadRef,
    window: Mutex<MessageWindow>,
    viewport: Mutex<Viewport>,
    handlers: RwLock<Vec<MessageHandler>>,
    scroll_threshold: f64,
    status_tx: watch::Sender<ChannelStatus>,
    events: Option<broadcast::Sender<ClientEvent>>,
}

impl ChannelShared {
    fn set_status(&self, status: ChannelStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous == status {
            return;
        }
        debug!(thread = %self.thread, ?previous, ?status, "channel: status changed");
        if let Some(events) = &self.events {
            let _ = events.send(ClientEvent::ChannelStatusChanged {
                thread: self.thread,
                status,
            });
        }
    }

    fn notify(&self, level: NoticeLevel, text: impl Into<String>) {
        if let Some(events) = &self.events {
            let _ = events.send(ClientEvent::notice(level, text));
        }
    }

    async fn handle_frame(&self, text: &str) {
        let event: ServerEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(err) => {
                warn!(thread = %self.thread, error = %err, "channel: invalid server event");
                return;
            }
        };
        if let ServerEvent::Error(err) = &event {
            warn!(thread = %self.thread, status_code = err.status_code, message = %err.message, "channel: server error event");
            self.notify(NoticeLevel::Error, err.message.clone());
            return;
        }
        let Some(message) = event.message_for(self.thread) else {
            debug!(thread = %self.thread, "channel: ignoring push for another thread");
            return;
        };

        let arrival = {
            let viewport = *self.viewport.lock().await;
            let mut window = self.window.lock().await;
            if !window.push_live(message.clone()) {
                debug!(thread = %self.thread, message_id = message.id.0, "channel: duplicate push dropped");
                return;
            }
            let scroll = if viewport.is_near_bottom(self.scroll_threshold) {
                ScrollAction::StickToBottom
            } else {
                ScrollAction::Preserve
            };
            MessageArrival {
                message: message.clone(),
                scroll,
            }
        };

        let handlers = self.handlers.read().await.clone();
        for handler in &handlers {
            handler(&arrival);
        }
    }
}

/// Releases the older-page guard if a `load_older` call is dropped mid-fetch.
struct PendingFetch<'a> {
    window: &'a Mutex<MessageWindow>,
    fetch: Option<OlderFetch>,
}

impl Drop for PendingFetch<'_> {
    fn drop(&mut self) {
        if let Some(fetch) = self.fetch.take() {
            if let Ok(mut window) = self.window.try_lock() {
                window.abort_older_fetch(fetch);
            }
        }
    }
}

enum SocketCommand {
    Send {
        frame: String,
        ack: oneshot::Sender<Result<(), ChannelError>>,
    },
    Close,
}

enum PumpExit {
    Closed,
    Dropped(String),
}

pub struct MessageChannel {
    shared: Arc<ChannelShared>,
    history: Arc<dyn MessageHistory>,
    page_size: u32,
    commands: mpsc::UnboundedSender<SocketCommand>,
    status_rx: watch::Receiver<ChannelStatus>,
    task: JoinHandle<()>,
}

impl MessageChannel {
    /// Opens a channel using the client's settings, stored credential and
    /// event bus.
    pub async fn open(client: Arc<RequestClient>, thread: ThreadRef) -> Result<Self, ChannelError> {
        let settings = client.settings().clone();
        let ws_base = settings
            .ws_base()
            .map_err(|err| ChannelError::InvalidUrl(err.to_string()))?;
        let config = ChannelConfig {
            ws_base,
            credentials: client.credentials(),
            page_size: settings.page_size,
            scroll_threshold_px: settings.scroll_threshold_px,
            reconnect: settings.reconnect,
        };
        let events = client.event_sender();
        Self::open_with(thread, config, client, Some(events))
    }

    pub fn open_with(
        thread: ThreadRef,
        config: ChannelConfig,
        history: Arc<dyn MessageHistory>,
        events: Option<broadcast::Sender<ClientEvent>>,
    ) -> Result<Self, ChannelError> {
        let url = channel_url(&config.ws_base, thread)?;
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Closed);
        let shared = Arc::new(ChannelShared {
            thread,
            window: Mutex::new(MessageWindow::new()),
            viewport: Mutex::new(Viewport::default()),
            handlers: RwLock::new(Vec::new()),
            scroll_threshold: config.scroll_threshold_px,
            status_tx,
            events,
        });
        let (commands, commands_rx) = mpsc::unbounded_channel();

        info!(%thread, %url, "channel: opening");
        shared.set_status(ChannelStatus::Connecting);
        let task = tokio::spawn(run_socket(
            Arc::clone(&shared),
            url,
            config.credentials,
            config.reconnect,
            commands_rx,
        ));

        Ok(Self {
            shared,
            history,
            page_size: config.page_size,
            commands,
            status_rx,
            task,
        })
    }

    pub fn thread(&self) -> ThreadRef {
        self.shared.thread
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status_rx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status_rx.clone()
    }

    pub async fn on_message<F>(&self, handler: F)
    where
        F: Fn(&MessageArrival) + Send + Sync + 'static,
    {
        self.shared.handlers.write().await.push(Arc::new(handler));
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.shared.window.lock().await.messages().to_vec()
    }

    pub async fn has_more(&self) -> bool {
        self.shared.window.lock().await.has_more()
    }

    pub async fn update_viewport(&self, viewport: Viewport) {
        *self.shared.viewport.lock().await = viewport;
    }

    /// Loads the newest page and replaces the window.
    pub async fn load_initial(&self) -> Result<ScrollAction, ChannelError> {
        let page = self
            .history
            .fetch_page(self.shared.thread, 1, self.page_size)
            .await?;
        let mut window = self.shared.window.lock().await;
        window.replace_with_initial(page);
        debug!(thread = %self.shared.thread, loaded = window.len(), "channel: initial page loaded");
        Ok(ScrollAction::StickToBottom)
    }

    /// Loads one older page. `None` when there is nothing more to load, a
    /// page fetch is already running, or the window was reloaded meanwhile.
    pub async fn load_older(&self, viewport: Viewport) -> Result<Option<OlderPage>, ChannelError> {
        let Some(fetch) = self.shared.window.lock().await.begin_older_fetch() else {
            return Ok(None);
        };
        let mut pending = PendingFetch {
            window: &self.shared.window,
            fetch: Some(fetch),
        };
        let anchor = ScrollAnchor::capture(&viewport);

        let result = self
            .history
            .fetch_page(self.shared.thread, fetch.page(), self.page_size)
            .await;
        pending.fetch = None;

        let mut window = self.shared.window.lock().await;
        match result {
            Ok(page) => match window.finish_older_fetch(fetch, page) {
                Some(added) => {
                    debug!(thread = %self.shared.thread, page = fetch.page(), added = added.len(), "channel: older page loaded");
                    Ok(Some(OlderPage { added, anchor }))
                }
                None => {
                    debug!(thread = %self.shared.thread, page = fetch.page(), "channel: stale older page dropped");
                    Ok(None)
                }
            },
            Err(err) => {
                window.abort_older_fetch(fetch);
                Err(err.into())
            }
        }
    }

    /// Scroll hook: back-fills once the viewer is near the top.
    pub async fn on_scroll(&self, viewport: Viewport) -> Result<Option<OlderPage>, ChannelError> {
        self.update_viewport(viewport).await;
        if !viewport.is_near_top(self.shared.scroll_threshold) {
            return Ok(None);
        }
        self.load_older(viewport).await
    }

    /// Sends over the socket. The message shows up in the window when the
    /// server pushes it back with its assigned id.
    pub async fn send(
        &self,
        message_type: MessageType,
        content: impl Into<String>,
    ) -> Result<(), ChannelError> {
        if !self.status().is_connected() {
            return Err(ChannelError::NotConnected);
        }
        let request = ChannelRequest::for_thread(self.shared.thread, message_type, content);
        let frame = serde_json::to_string(&request)?;
        let (ack, ack_rx) = oneshot::channel();
        self.commands
            .send(SocketCommand::Send { frame, ack })
            .map_err(|_| ChannelError::Closed(self.shared.thread.to_string()))?;
        ack_rx
            .await
            .map_err(|_| ChannelError::Closed(self.shared.thread.to_string()))?
    }

    /// Closes the socket and discards the window.
    pub async fn close(mut self) {
        let _ = self.commands.send(SocketCommand::Close);
        if tokio::time::timeout(CLOSE_GRACE, &mut self.task).await.is_err() {
            self.task.abort();
        }
        self.shared.set_status(ChannelStatus::Closed);
        self.shared.window.lock().await.clear();
        self.shared.handlers.write().await.clear();
        info!(thread = %self.shared.thread, "channel: closed");
    }
}

impl Drop for MessageChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Holds the one active channel of a screen.
#[derive(Default)]
pub struct ChannelSlot {
    active: Option<MessageChannel>,
}

impl ChannelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&MessageChannel> {
        self.active.as_ref()
    }

    /// Switches to `thread`, closing the current channel first.
    pub async fn select(
        &mut self,
        client: &Arc<RequestClient>,
        thread: ThreadRef,
    ) -> Result<&MessageChannel, ChannelError> {
        if let Some(current) = self.active.take() {
            if current.thread() == thread {
                return Ok(self.active.insert(current));
            }
            current.close().await;
        }
        let channel = MessageChannel::open(Arc::clone(client), thread).await?;
        Ok(self.active.insert(channel))
    }

    /// Like [`ChannelSlot::select`] with a caller-supplied opener.
    pub async fn select_with<F>(
        &mut self,
        thread: ThreadRef,
        open: F,
    ) -> Result<&MessageChannel, ChannelError>
    where
        F: FnOnce(ThreadRef) -> Result<MessageChannel, ChannelError>,
    {
        if let Some(current) = self.active.take() {
            if current.thread() == thread {
                return Ok(self.active.insert(current));
            }
            current.close().await;
        }
        let channel = open(thread)?;
        Ok(self.active.insert(channel))
    }

    pub async fn clear(&mut self) {
        if let Some(current) = self.active.take() {
            current.close().await;
        }
    }
}

fn channel_url(ws_base: &str, thread: ThreadRef) -> Result<Url, ChannelError> {
    let raw = format!("{}{}", ws_base.trim_end_matches('/'), thread.namespace());
    let mut url = Url::parse(&raw).map_err(|err| ChannelError::InvalidUrl(format!("{raw}: {err}")))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(ChannelError::InvalidUrl(format!(
            "{raw}: scheme must be ws or wss"
        )));
    }
    url.query_pairs_mut()
        .append_pair(thread.query_key(), &thread.raw_id().to_string());
    Ok(url)
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(url: &Url, token: Option<&str>) -> Result<Socket> {
    let mut request = url
        .as_str()
        .into_client_request()
        .context("failed to build websocket request")?;
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("credential is not a valid header value")?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    let (stream, _) = connect_async(request)
        .await
        .with_context(|| format!("failed to connect websocket: {url}"))?;
    Ok(stream)
}

async fn run_socket(
    shared: Arc<ChannelShared>,
    url: Url,
    credentials: Arc<dyn CredentialStore>,
    policy: ReconnectPolicy,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
) {
    let mut attempt: u32 = 0;

    loop {
        let token = match credentials.token().await {
            Ok(token) => token,
            Err(err) => {
                warn!(thread = %shared.thread, error = %err, "channel: credential unavailable");
                None
            }
        };
        match connect(&url, token.as_deref()).await {
            Ok(socket) => {
                attempt = 0;
                shared.set_status(ChannelStatus::Open);
                info!(thread = %shared.thread, "channel: connected");
                match pump(&shared, socket, &mut commands).await {
                    PumpExit::Closed => break,
                    PumpExit::Dropped(reason) => {
                        warn!(thread = %shared.thread, %reason, "channel: connection dropped");
                    }
                }
            }
            Err(err) => {
                warn!(thread = %shared.thread, attempt, error = %err, "channel: connect failed");
            }
        }

        attempt += 1;
        if attempt > policy.max_attempts {
            warn!(thread = %shared.thread, attempts = policy.max_attempts, "channel: giving up reconnecting");
            shared.notify(NoticeLevel::Warning, "Chat disconnected");
            break;
        }
        shared.set_status(ChannelStatus::Reconnecting { attempt });

        let backoff = tokio::time::sleep(policy.delay_for(attempt));
        tokio::pin!(backoff);
        loop {
            tokio::select! {
                _ = &mut backoff => break,
                command = commands.recv() => match command {
                    Some(SocketCommand::Send { ack, .. }) => {
                        let _ = ack.send(Err(ChannelError::NotConnected));
                    }
                    Some(SocketCommand::Close) | None => {
                        shared.set_status(ChannelStatus::Closed);
                        return;
                    }
                },
            }
        }
    }

    shared.set_status(ChannelStatus::Closed);
}

async fn pump(
    shared: &ChannelShared,
    socket: Socket,
    commands: &mut mpsc::UnboundedReceiver<SocketCommand>,
) -> PumpExit {
    let (mut writer, mut reader) = socket.split();
    loop {
        tokio::select! {
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => shared.handle_frame(&text).await,
                Some(Ok(Message::Close(_))) | None => {
                    return PumpExit::Dropped("closed by server".into());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return PumpExit::Dropped(err.to_string()),
            },
            command = commands.recv() => match command {
                Some(SocketCommand::Send { frame, ack }) => {
                    if let Err(err) = writer.send(Message::Text(frame)).await {
                        let _ = ack.send(Err(ChannelError::NotConnected));
                        return PumpExit::Dropped(err.to_string());
                    }
                    let _ = ack.send(Ok(()));
                }
                Some(SocketCommand::Close) | None => {
                    let _ = writer.send(Message::Close(None)).await;
                    return PumpExit::Closed;
                }
            },
        }
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
