use super::*;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
        Mutex as StdMutex,
    },
};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use shared::domain::{ConversationId, MessageId, UserId};
use tokio::net::TcpListener;

use crate::credentials::{CredentialStore, InMemoryCredentialStore};

fn at(seconds: i64) -> DateTime<Utc> {
    "2024-06-01T08:00:00Z"
        .parse::<DateTime<Utc>>()
        .expect("timestamp")
        + ChronoDuration::seconds(seconds)
}

fn msg(thread_id: i64, id: i64) -> ChatMessage {
    ChatMessage {
        id: MessageId(id),
        thread_id,
        sender_id: UserId(3),
        message_type: MessageType::Text,
        content: format!("message {id}"),
        created_at: at(id),
    }
}

const THREAD: ThreadRef = ThreadRef::Conversation(ConversationId(7));

/// Pushed through the broadcast to make the server hang up every socket.
const DISCONNECT: &str = "disconnect";

struct FakeHistory {
    pages: HashMap<u32, MessagePage>,
    calls: AtomicUsize,
    delay: Duration,
}

impl FakeHistory {
    fn sixty_messages(delay: Duration) -> Arc<Self> {
        let page = |range: std::ops::RangeInclusive<i64>, page: u32, has_more: bool| MessagePage {
            messages: range.rev().map(|id| msg(7, id)).collect(),
            page,
            has_more,
        };
        Arc::new(Self {
            pages: HashMap::from([
                (1, page(41..=60, 1, true)),
                (2, page(21..=40, 2, true)),
                (3, page(1..=20, 3, false)),
            ]),
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHistory for FakeHistory {
    async fn fetch_page(
        &self,
        _thread: ThreadRef,
        page: u32,
        _limit: u32,
    ) -> Result<MessagePage, RequestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.pages.get(&page).cloned().ok_or(RequestError::Api {
            status_code: 404,
            message: "no such page".into(),
        })
    }
}

#[derive(Clone)]
struct SocketServer {
    pushes: broadcast::Sender<String>,
    connections: Arc<AtomicUsize>,
    next_id: Arc<AtomicI64>,
    drop_first: Arc<AtomicBool>,
    last_auth: Arc<StdMutex<Option<String>>>,
    last_query: Arc<StdMutex<HashMap<String, String>>>,
    accepted_token: Arc<StdMutex<Option<String>>>,
    rejected: Arc<AtomicUsize>,
}

impl SocketServer {
    fn push(&self, event: &ServerEvent) {
        let _ = self
            .pushes
            .send(serde_json::to_string(event).expect("encode event"));
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn accept_only(&self, token: &str) {
        *self.accepted_token.lock().expect("token lock") = Some(token.to_string());
    }

    fn last_auth(&self) -> Option<String> {
        self.last_auth.lock().expect("auth lock").clone()
    }
}

async fn socket_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<SocketServer>,
) -> Response {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    *state.last_auth.lock().expect("auth lock") = auth.clone();
    *state.last_query.lock().expect("query lock") = query;

    let accepted = state.accepted_token.lock().expect("token lock").clone();
    if let Some(token) = accepted {
        if auth != Some(format!("Bearer {token}")) {
            state.rejected.fetch_add(1, Ordering::SeqCst);
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    ws.on_upgrade(move |socket| serve_socket(state, socket))
}

async fn serve_socket(state: SocketServer, socket: WebSocket) {
    if state.drop_first.swap(false, Ordering::SeqCst) {
        drop(socket);
        return;
    }
    let (mut sender, mut receiver) = socket.split();
    let mut pushes = state.pushes.subscribe();
    state.connections.fetch_add(1, Ordering::SeqCst);

    loop {
        tokio::select! {
            push = pushes.recv() => match push {
                Ok(text) if text == DISCONNECT => break,
                Ok(text) => {
                    if sender.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Ok(ChannelRequest::SendMessage(payload)) = serde_json::from_str(&text) {
                        let id = state.next_id.fetch_add(1, Ordering::SeqCst);
                        let echo = ChatMessage {
                            id: MessageId(id),
                            thread_id: payload.conversation_id.0,
                            sender_id: UserId(1),
                            message_type: payload.message_type,
                            content: payload.content,
                            created_at: Utc::now(),
                        };
                        state.push(&ServerEvent::NewMessage(echo));
                    }
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.connections.fetch_sub(1, Ordering::SeqCst);
}

async fn spawn_socket_server() -> anyhow::Result<(String, SocketServer)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (pushes, _) = broadcast::channel(64);
    let state = SocketServer {
        pushes,
        connections: Arc::new(AtomicUsize::new(0)),
        next_id: Arc::new(AtomicI64::new(1000)),
        drop_first: Arc::new(AtomicBool::new(false)),
        last_auth: Arc::new(StdMutex::new(None)),
        last_query: Arc::new(StdMutex::new(HashMap::new())),
        accepted_token: Arc::new(StdMutex::new(None)),
        rejected: Arc::new(AtomicUsize::new(0)),
    };
    let app = Router::new()
        .route("/chat", get(socket_handler))
        .route("/complaint", get(socket_handler))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("ws://{addr}"), state))
}

fn config(ws_base: &str) -> ChannelConfig {
    ChannelConfig {
        ws_base: ws_base.to_string(),
        credentials: InMemoryCredentialStore::with_token("socket-token"),
        page_size: 20,
        scroll_threshold_px: 100.0,
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            max_attempts: 3,
        },
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn wait_for_status(channel: &MessageChannel, status: ChannelStatus) {
    let mut rx = channel.watch_status();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == status))
        .await
        .expect("status not reached in time")
        .expect("status channel closed");
}

fn recording_handler(
    channel_arrivals: &Arc<StdMutex<Vec<MessageArrival>>>,
) -> impl Fn(&MessageArrival) + Send + Sync + 'static {
    let arrivals = Arc::clone(channel_arrivals);
    move |arrival: &MessageArrival| arrivals.lock().expect("arrivals lock").push(arrival.clone())
}

fn ids(messages: &[ChatMessage]) -> Vec<i64> {
    messages.iter().map(|m| m.id.0).collect()
}

#[tokio::test]
async fn initial_then_older_page_builds_ascending_window() {
    let (ws_base, _server) = spawn_socket_server().await.expect("server");
    let history = FakeHistory::sixty_messages(Duration::ZERO);
    let channel =
        MessageChannel::open_with(THREAD, config(&ws_base), history.clone(), None).expect("open");

    assert_eq!(
        channel.load_initial().await.expect("initial"),
        ScrollAction::StickToBottom
    );
    assert_eq!(ids(&channel.messages().await), (41..=60).collect::<Vec<_>>());

    let older = channel
        .load_older(Viewport::new(0.0, 2000.0, 600.0))
        .await
        .expect("older")
        .expect("a page was loaded");
    assert_eq!(older.added.len(), 20);
    assert_eq!(older.anchor.resolve(3000.0), 1000.0);
    assert_eq!(ids(&channel.messages().await), (21..=60).collect::<Vec<_>>());

    channel.close().await;
}

#[tokio::test]
async fn older_pages_stop_once_history_is_exhausted() {
    let (ws_base, _server) = spawn_socket_server().await.expect("server");
    let history = FakeHistory::sixty_messages(Duration::ZERO);
    let channel =
        MessageChannel::open_with(THREAD, config(&ws_base), history.clone(), None).expect("open");
    channel.load_initial().await.expect("initial");

    let top = Viewport::new(0.0, 2000.0, 600.0);
    assert!(channel.load_older(top).await.expect("page 2").is_some());
    assert!(channel.load_older(top).await.expect("page 3").is_some());
    assert!(!channel.has_more().await);
    let calls_after_exhaustion = history.calls();

    for _ in 0..3 {
        assert!(channel.load_older(top).await.expect("no-op").is_none());
    }
    assert_eq!(history.calls(), calls_after_exhaustion);
    assert_eq!(ids(&channel.messages().await), (1..=60).collect::<Vec<_>>());
}

#[tokio::test]
async fn concurrent_scroll_to_top_fetches_one_page() {
    let (ws_base, _server) = spawn_socket_server().await.expect("server");
    let history = FakeHistory::sixty_messages(Duration::from_millis(100));
    let channel =
        MessageChannel::open_with(THREAD, config(&ws_base), history.clone(), None).expect("open");
    channel.load_initial().await.expect("initial");

    let near_top = Viewport::new(50.0, 2000.0, 600.0);
    let (first, second) = tokio::join!(channel.on_scroll(near_top), channel.on_scroll(near_top));
    let loaded = [first.expect("first"), second.expect("second")]
        .into_iter()
        .filter(Option::is_some)
        .count();

    assert_eq!(loaded, 1);
    assert_eq!(history.calls(), 2);
}

#[tokio::test]
async fn reload_during_older_fetch_drops_the_stale_page() {
    let (ws_base, _server) = spawn_socket_server().await.expect("server");
    let history = FakeHistory::sixty_messages(Duration::from_millis(300));
    let channel =
        MessageChannel::open_with(THREAD, config(&ws_base), history.clone(), None).expect("open");
    channel.load_initial().await.expect("initial");

    let top = Viewport::new(0.0, 2000.0, 600.0);
    // older fetch runs 100..400ms, the reload lands at 300ms
    let (reload, stale, blocked) = tokio::join!(channel.load_initial(), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        channel.load_older(top).await
    }, async {
        tokio::time::sleep(Duration::from_millis(350)).await;
        channel.load_older(top).await
    });

    reload.expect("reload");
    assert!(stale.expect("stale fetch").is_none());
    assert!(blocked.expect("guarded fetch").is_none());
    assert_eq!(history.calls(), 3);
    assert_eq!(ids(&channel.messages().await), (41..=60).collect::<Vec<_>>());

    let older = channel
        .load_older(top)
        .await
        .expect("older")
        .expect("guard released");
    assert_eq!(older.added.len(), 20);
    assert_eq!(ids(&channel.messages().await), (21..=60).collect::<Vec<_>>());
}

#[tokio::test]
async fn scrolling_away_from_top_does_not_fetch() {
    let (ws_base, _server) = spawn_socket_server().await.expect("server");
    let history = FakeHistory::sixty_messages(Duration::ZERO);
    let channel =
        MessageChannel::open_with(THREAD, config(&ws_base), history.clone(), None).expect("open");
    channel.load_initial().await.expect("initial");

    let middle = Viewport::new(800.0, 2000.0, 600.0);
    assert!(channel.on_scroll(middle).await.expect("scroll").is_none());
    assert_eq!(history.calls(), 1);
}

#[tokio::test]
async fn duplicate_push_is_delivered_once() {
    let (ws_base, server) = spawn_socket_server().await.expect("server");
    let channel = MessageChannel::open_with(
        THREAD,
        config(&ws_base),
        FakeHistory::sixty_messages(Duration::ZERO),
        None,
    )
    .expect("open");
    let arrivals = Arc::new(StdMutex::new(Vec::new()));
    channel.on_message(recording_handler(&arrivals)).await;
    wait_for_status(&channel, ChannelStatus::Open).await;
    wait_until(|| server.connections() == 1).await;

    server.push(&ServerEvent::NewMessage(msg(7, 61)));
    server.push(&ServerEvent::NewMessage(msg(7, 61)));
    server.push(&ServerEvent::NewMessage(msg(99, 62)));
    server.push(&ServerEvent::NewMessage(msg(7, 63)));
    wait_until(|| arrivals.lock().expect("lock").len() >= 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let delivered: Vec<i64> = arrivals
        .lock()
        .expect("lock")
        .iter()
        .map(|a| a.message.id.0)
        .collect();
    assert_eq!(delivered, vec![61, 63]);
    assert_eq!(ids(&channel.messages().await), vec![61, 63]);
}

#[tokio::test]
async fn sent_message_arrives_through_server_push() {
    let (ws_base, server) = spawn_socket_server().await.expect("server");
    let channel = MessageChannel::open_with(
        THREAD,
        config(&ws_base),
        FakeHistory::sixty_messages(Duration::ZERO),
        None,
    )
    .expect("open");
    let arrivals = Arc::new(StdMutex::new(Vec::new()));
    channel.on_message(recording_handler(&arrivals)).await;
    wait_for_status(&channel, ChannelStatus::Open).await;
    wait_until(|| server.connections() == 1).await;

    channel
        .send(MessageType::Text, "keys are at the front desk")
        .await
        .expect("send");
    wait_until(|| !arrivals.lock().expect("lock").is_empty()).await;

    let messages = channel.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, MessageId(1000));
    assert_eq!(messages[0].content, "keys are at the front desk");
}

#[tokio::test]
async fn handshake_carries_credential_and_thread() {
    let (ws_base, server) = spawn_socket_server().await.expect("server");
    let thread = ThreadRef::Complaint(shared::domain::ComplaintId(12));
    let channel = MessageChannel::open_with(
        thread,
        config(&ws_base),
        FakeHistory::sixty_messages(Duration::ZERO),
        None,
    )
    .expect("open");
    wait_for_status(&channel, ChannelStatus::Open).await;

    assert_eq!(
        server.last_auth.lock().expect("lock").clone(),
        Some("Bearer socket-token".to_string())
    );
    assert_eq!(
        server
            .last_query
            .lock()
            .expect("lock")
            .get("complaintId")
            .cloned(),
        Some("12".to_string())
    );
}

#[tokio::test]
async fn send_is_rejected_unless_open() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let mut cfg = config(&format!("ws://{addr}"));
    cfg.reconnect.max_attempts = 0;
    let (events, mut events_rx) = broadcast::channel(16);
    let channel = MessageChannel::open_with(
        THREAD,
        cfg,
        FakeHistory::sixty_messages(Duration::ZERO),
        Some(events),
    )
    .expect("open");

    assert!(matches!(
        channel.send(MessageType::Text, "early").await,
        Err(ChannelError::NotConnected)
    ));
    wait_for_status(&channel, ChannelStatus::Closed).await;
    assert!(matches!(
        channel.send(MessageType::Text, "late").await,
        Err(ChannelError::NotConnected)
    ));

    let mut saw_disconnect_notice = false;
    while let Ok(event) = events_rx.try_recv() {
        if let ClientEvent::Notification(notice) = event {
            saw_disconnect_notice |= notice.text == "Chat disconnected";
        }
    }
    assert!(saw_disconnect_notice);

    // history still works while disconnected
    channel.load_initial().await.expect("initial while closed");
    assert_eq!(channel.messages().await.len(), 20);
}

#[tokio::test]
async fn push_follows_bottom_only_when_viewer_was_there() {
    let (ws_base, server) = spawn_socket_server().await.expect("server");
    let channel = MessageChannel::open_with(
        THREAD,
        config(&ws_base),
        FakeHistory::sixty_messages(Duration::ZERO),
        None,
    )
    .expect("open");
    let arrivals = Arc::new(StdMutex::new(Vec::new()));
    channel.on_message(recording_handler(&arrivals)).await;
    wait_for_status(&channel, ChannelStatus::Open).await;
    wait_until(|| server.connections() == 1).await;

    channel
        .update_viewport(Viewport::new(1350.0, 2000.0, 600.0))
        .await;
    server.push(&ServerEvent::NewMessage(msg(7, 70)));
    wait_until(|| arrivals.lock().expect("lock").len() == 1).await;

    channel.update_viewport(Viewport::new(200.0, 2100.0, 600.0)).await;
    server.push(&ServerEvent::NewMessage(msg(7, 71)));
    wait_until(|| arrivals.lock().expect("lock").len() == 2).await;

    let actions: Vec<ScrollAction> = arrivals
        .lock()
        .expect("lock")
        .iter()
        .map(|a| a.scroll)
        .collect();
    assert_eq!(
        actions,
        vec![ScrollAction::StickToBottom, ScrollAction::Preserve]
    );
}

#[tokio::test]
async fn reconnects_after_server_drops_connection() {
    let (ws_base, server) = spawn_socket_server().await.expect("server");
    server.drop_first.store(true, Ordering::SeqCst);
    let (events, mut events_rx) = broadcast::channel(64);
    let channel = MessageChannel::open_with(
        THREAD,
        config(&ws_base),
        FakeHistory::sixty_messages(Duration::ZERO),
        Some(events),
    )
    .expect("open");

    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Ok(event) = events_rx.recv().await {
            if let ClientEvent::ChannelStatusChanged { status, .. } = event {
                seen.push(status);
                let reconnected = seen
                    .iter()
                    .skip_while(|s| !matches!(s, ChannelStatus::Reconnecting { .. }))
                    .any(|s| *s == ChannelStatus::Open);
                if reconnected {
                    break;
                }
            }
        }
    })
    .await
    .expect("channel did not reconnect");

    assert_eq!(seen.first(), Some(&ChannelStatus::Connecting));
    assert!(seen.contains(&ChannelStatus::Reconnecting { attempt: 1 }));
    assert_eq!(channel.status(), ChannelStatus::Open);
    wait_until(|| server.connections() == 1).await;
}

#[tokio::test]
async fn reconnect_reads_the_current_credential() {
    let (ws_base, server) = spawn_socket_server().await.expect("server");
    let store = InMemoryCredentialStore::with_token("first-token");
    server.accept_only("first-token");
    let channel = MessageChannel::open_with(
        THREAD,
        ChannelConfig {
            credentials: store.clone(),
            ..config(&ws_base)
        },
        FakeHistory::sixty_messages(Duration::ZERO),
        None,
    )
    .expect("open");
    wait_for_status(&channel, ChannelStatus::Open).await;
    wait_until(|| server.connections() == 1).await;
    assert_eq!(server.last_auth(), Some("Bearer first-token".to_string()));

    // the request client refreshed the session while the socket was up
    store.set_token("second-token").await.expect("store token");
    server.accept_only("second-token");
    let _ = server.pushes.send(DISCONNECT.to_string());

    wait_until(|| {
        server.connections() == 1 && server.last_auth().as_deref() == Some("Bearer second-token")
    })
    .await;
    wait_for_status(&channel, ChannelStatus::Open).await;
    assert_eq!(server.rejected.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn selecting_another_thread_closes_the_previous_channel() {
    let (ws_base, server) = spawn_socket_server().await.expect("server");
    let history = FakeHistory::sixty_messages(Duration::ZERO);
    let mut slot = ChannelSlot::new();

    let first_status = {
        let channel = slot
            .select_with(THREAD, |thread| {
                MessageChannel::open_with(thread, config(&ws_base), history.clone(), None)
            })
            .await
            .expect("first");
        wait_for_status(channel, ChannelStatus::Open).await;
        channel.watch_status()
    };
    wait_until(|| server.connections() == 1).await;

    let second = ThreadRef::Conversation(ConversationId(8));
    let channel = slot
        .select_with(second, |thread| {
            MessageChannel::open_with(thread, config(&ws_base), history.clone(), None)
        })
        .await
        .expect("second");
    assert_eq!(channel.thread(), second);
    assert_eq!(*first_status.borrow(), ChannelStatus::Closed);

    wait_for_status(channel, ChannelStatus::Open).await;
    wait_until(|| server.connections() == 1).await;
    assert_eq!(
        server
            .last_query
            .lock()
            .expect("lock")
            .get("conversationId")
            .cloned(),
        Some("8".to_string())
    );

    slot.clear().await;
    assert!(slot.active().is_none());
}
