//! Store server core: shared state, WebSocket handler, owner scoping and
//! request dispatch.
//!
//! Each connection must open with a `Hello` naming the owner it acts for.
//! After that every request is checked against that owner: documents carry
//! an `owner` field, and queries or subscriptions must filter on it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use betterish_proto::codec;
use betterish_proto::document::{FieldValue, Fields, Filter, FilterOp, field};
use betterish_proto::store::{ClientFrame, ServerFrame, StoreFailure, StoreOp, StoreReply};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};

use crate::store::{DocumentDb, Feed};

/// Default maximum allowed frame size in bytes (64 KB).
const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Field every document is scoped by.
pub const OWNER_FIELD: &str = "owner";

/// Shared server state holding the database and the connection registry.
pub struct ServerState {
    /// The documents.
    pub db: DocumentDb,
    /// Maps connection ID to a channel sender for its WebSocket writer.
    connections: RwLock<HashMap<u64, mpsc::UnboundedSender<Message>>>,
    next_connection: AtomicU64,
    /// Maximum allowed inbound frame size in bytes.
    max_frame_size: usize,
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerState {
    /// Creates a new state with an empty database and default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DEFAULT_MAX_FRAME_SIZE, DocumentDb::new())
    }

    /// Creates a new state with a custom frame size limit and database.
    #[must_use]
    pub fn with_config(max_frame_size: usize, db: DocumentDb) -> Self {
        Self {
            db,
            connections: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            max_frame_size,
        }
    }

    async fn register(&self, sender: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.connections.write().await.insert(id, sender);
        id
    }

    async fn unregister(&self, connection_id: u64) {
        self.connections.write().await.remove(&connection_id);
        let dropped = self.db.unsubscribe_connection(connection_id).await;
        tracing::debug!(connection_id, dropped, "connection subscriptions released");
    }

    /// Returns the number of open connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Send a WebSocket Close frame to every connected client.
    ///
    /// Each writer task sends the close frame and exits, which the client
    /// observes as a lost connection.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (connection_id, sender) in conns.iter() {
            tracing::info!(connection_id, "sending close frame");
            let _ = sender.send(Message::Close(None));
        }
    }
}

/// Handles an upgraded WebSocket connection for a single client.
///
/// The connection lifecycle:
/// 1. Wait for a `Hello` frame and answer with `Welcome`.
/// 2. Serve requests, forwarding subscription feeds as `Changes` frames.
/// 3. On disconnect, unregister and drop the connection's subscriptions.
pub async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(owner) = wait_for_hello(&mut ws_receiver).await else {
        tracing::warn!("connection closed before hello");
        return;
    };

    let welcome = ServerFrame::Welcome {
        owner: owner.clone(),
    };
    if let Err(e) = send_frame(&mut ws_sender, &welcome).await {
        tracing::error!(owner = %owner, error = %e, "failed to send welcome");
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let (feed_tx, mut feed_rx) = mpsc::unbounded_channel::<Feed>();
    let connection_id = state.register(tx.clone()).await;
    tracing::info!(connection_id, owner = %owner, "client connected");

    // Writer: forwards replies and subscription feeds to the WebSocket.
    let mut write_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                Some(msg) = rx.recv() => msg,
                Some(feed) = feed_rx.recv() => {
                    let frame = ServerFrame::Changes {
                        subscription_id: feed.subscription_id,
                        batch: feed.batch,
                    };
                    match codec::encode(&frame) {
                        Ok(bytes) => Message::Binary(bytes.into()),
                        Err(e) => {
                            tracing::error!(connection_id, error = %e, "failed to encode changes");
                            continue;
                        }
                    }
                }
                else => break,
            };
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(connection_id, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    // Reader: decodes and serves requests in arrival order.
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        let mut conn = Connection {
            id: connection_id,
            owner,
            replies: tx,
            feeds: feed_tx,
        };
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => conn.handle_binary(&data, &reader_state).await,
                Message::Close(_) => {
                    tracing::info!(connection_id, "received close frame");
                    break;
                }
                _ => {
                    // Ignore text, ping, pong frames.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.unregister(connection_id).await;
    tracing::info!(connection_id, "client disconnected");
}

/// Waits for the first binary frame, expecting a `Hello`.
async fn wait_for_hello(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<String> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Binary(data) => match codec::decode::<ClientFrame>(&data) {
                Ok(ClientFrame::Hello { owner }) => {
                    if owner.is_empty() {
                        tracing::warn!("received Hello with empty owner");
                        return None;
                    }
                    return Some(owner);
                }
                Ok(other) => {
                    tracing::warn!(frame = ?other, "expected Hello, got different frame");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode hello");
                    return None;
                }
            },
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

/// Per-connection request context.
struct Connection {
    id: u64,
    owner: String,
    replies: mpsc::UnboundedSender<Message>,
    feeds: mpsc::UnboundedSender<Feed>,
}

impl Connection {
    async fn handle_binary(&mut self, data: &[u8], state: &ServerState) {
        let frame = match codec::decode_bounded::<ClientFrame>(data, state.max_frame_size) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(connection_id = self.id, error = %e, "rejected frame");
                self.send(&ServerFrame::Error {
                    reason: e.to_string(),
                });
                return;
            }
        };

        match frame {
            ClientFrame::Hello { owner } if !owner.is_empty() => {
                let dropped = state.db.unsubscribe_connection(self.id).await;
                tracing::info!(
                    connection_id = self.id,
                    from = %self.owner,
                    to = %owner,
                    dropped,
                    "owner switched"
                );
                self.owner.clone_from(&owner);
                self.send(&ServerFrame::Welcome { owner });
            }
            ClientFrame::Hello { .. } => {
                self.send(&ServerFrame::Error {
                    reason: "empty owner".to_string(),
                });
            }
            ClientFrame::Request { request_id, op } => {
                let outcome = self.execute(op, state).await;
                if let Err(failure) = &outcome {
                    tracing::debug!(connection_id = self.id, request_id, ?failure, "request failed");
                }
                self.send(&ServerFrame::Reply {
                    request_id,
                    outcome,
                });
            }
        }
    }

    async fn execute(&self, op: StoreOp, state: &ServerState) -> Result<StoreReply, StoreFailure> {
        match op {
            StoreOp::Create { collection, fields } => {
                self.check_owned(&fields)?;
                let id = state.db.create(&collection, fields).await?;
                Ok(StoreReply::Created { id })
            }
            StoreOp::Update {
                collection,
                id,
                patch,
            } => {
                if patch.contains_key(OWNER_FIELD) {
                    self.check_owned(&patch)?;
                }
                let existing = state
                    .db
                    .get(&collection, &id)
                    .await
                    .ok_or_else(|| StoreFailure::NotFound { id: id.clone() })?;
                self.check_owned(&existing)?;
                state.db.update(&collection, &id, &patch).await?;
                Ok(StoreReply::Done)
            }
            StoreOp::Delete { collection, id } => {
                if let Some(existing) = state.db.get(&collection, &id).await {
                    self.check_owned(&existing)?;
                    state.db.delete(&collection, &id).await;
                }
                Ok(StoreReply::Done)
            }
            StoreOp::Query { collection, query } => {
                self.check_scoped(&query.filters)?;
                Ok(StoreReply::Documents(
                    state.db.query(&collection, &query).await,
                ))
            }
            StoreOp::Subscribe {
                collection,
                filters,
            } => {
                self.check_scoped(&filters)?;
                let subscription_id = state
                    .db
                    .subscribe(&collection, filters, self.id, self.feeds.clone())
                    .await;
                Ok(StoreReply::Subscribed { subscription_id })
            }
            StoreOp::Unsubscribe { subscription_id } => {
                state.db.unsubscribe(subscription_id, self.id).await;
                Ok(StoreReply::Done)
            }
        }
    }

    fn check_owned(&self, fields: &Fields) -> Result<(), StoreFailure> {
        match field(fields, OWNER_FIELD) {
            FieldValue::Text(owner) if *owner == self.owner => Ok(()),
            _ => Err(StoreFailure::Unauthorized {
                reason: format!("document not owned by {}", self.owner),
            }),
        }
    }

    fn check_scoped(&self, filters: &[Filter]) -> Result<(), StoreFailure> {
        let scoped = filters.iter().any(|f| {
            f.field == OWNER_FIELD
                && f.op == FilterOp::Eq
                && f.value.as_text() == Some(self.owner.as_str())
        });
        if scoped {
            Ok(())
        } else {
            Err(StoreFailure::Unauthorized {
                reason: format!("query must be scoped to owner {}", self.owner),
            })
        }
    }

    fn send(&self, frame: &ServerFrame) {
        match codec::encode(frame) {
            Ok(bytes) => {
                let _ = self.replies.send(Message::Binary(bytes.into()));
            }
            Err(e) => tracing::error!(connection_id = self.id, error = %e, "failed to encode frame"),
        }
    }
}

/// Encodes and sends a frame directly on a WebSocket sender.
async fn send_frame(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    frame: &ServerFrame,
) -> Result<(), String> {
    let bytes = codec::encode(frame).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

/// Starts the store server on the given address and returns the bound
/// address and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(ServerState::new())).await
}

/// Starts the store server with a pre-configured [`ServerState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<ServerState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .route("/health", axum::routing::get(health_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "store server error");
        }
    });

    Ok((bound_addr, handle))
}

/// Starts the store server in-process for testing on an OS-assigned port.
#[cfg(test)]
pub async fn start_test_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    start_server("127.0.0.1:0")
        .await
        .expect("failed to start test server")
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<ServerState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn health_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use betterish_proto::document::{Change, Query};
    use tokio_tungstenite::tungstenite;

    type Client =
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    /// Helper: connect a WebSocket client to the test server and say hello.
    async fn connect_as(addr: std::net::SocketAddr, owner: &str) -> Client {
        let url = format!("ws://{addr}/ws");
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        ws_send(
            &mut ws,
            &ClientFrame::Hello {
                owner: owner.to_string(),
            },
        )
        .await;
        assert_eq!(
            ws_recv(&mut ws).await,
            ServerFrame::Welcome {
                owner: owner.to_string()
            }
        );
        ws
    }

    async fn ws_send(ws: &mut Client, frame: &ClientFrame) {
        let bytes = codec::encode(frame).unwrap();
        ws.send(tungstenite::Message::Binary(bytes.into()))
            .await
            .unwrap();
    }

    async fn ws_recv(ws: &mut Client) -> ServerFrame {
        let msg = ws.next().await.unwrap().unwrap();
        codec::decode(&msg.into_data()).unwrap()
    }

    async fn request(ws: &mut Client, request_id: u64, op: StoreOp) -> Result<StoreReply, StoreFailure> {
        ws_send(ws, &ClientFrame::Request { request_id, op }).await;
        loop {
            if let ServerFrame::Reply {
                request_id: got,
                outcome,
            } = ws_recv(ws).await
            {
                assert_eq!(got, request_id);
                return outcome;
            }
        }
    }

    fn make_fields(owner: &str, title: &str) -> Fields {
        let mut f = Fields::new();
        f.insert(OWNER_FIELD.into(), FieldValue::Text(owner.into()));
        f.insert("title".into(), FieldValue::Text(title.into()));
        f
    }

    fn create_op(owner: &str, title: &str) -> StoreOp {
        StoreOp::Create {
            collection: "tasks".into(),
            fields: make_fields(owner, title),
        }
    }

    // --- request handling ---

    #[tokio::test]
    async fn create_and_query_own_documents() {
        let (addr, _handle) = start_test_server().await;
        let mut alice = connect_as(addr, "alice").await;

        let reply = request(&mut alice, 1, create_op("alice", "a")).await.unwrap();
        let StoreReply::Created { id } = reply else {
            panic!("expected Created, got {reply:?}");
        };

        let query = Query::new().filter(Filter::eq(OWNER_FIELD, "alice"));
        let reply = request(
            &mut alice,
            2,
            StoreOp::Query {
                collection: "tasks".into(),
                query,
            },
        )
        .await
        .unwrap();
        let StoreReply::Documents(docs) = reply else {
            panic!("expected Documents, got {reply:?}");
        };
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, id);
    }

    #[tokio::test]
    async fn create_for_other_owner_is_unauthorized() {
        let (addr, _handle) = start_test_server().await;
        let mut alice = connect_as(addr, "alice").await;
        let result = request(&mut alice, 1, create_op("bob", "sneaky")).await;
        assert!(matches!(result, Err(StoreFailure::Unauthorized { .. })));
    }

    #[tokio::test]
    async fn unscoped_query_is_unauthorized() {
        let (addr, _handle) = start_test_server().await;
        let mut alice = connect_as(addr, "alice").await;
        let result = request(
            &mut alice,
            1,
            StoreOp::Query {
                collection: "tasks".into(),
                query: Query::new(),
            },
        )
        .await;
        assert!(matches!(result, Err(StoreFailure::Unauthorized { .. })));
    }

    #[tokio::test]
    async fn update_of_foreign_document_is_unauthorized() {
        let (addr, _handle) = start_test_server().await;
        let mut alice = connect_as(addr, "alice").await;
        let mut bob = connect_as(addr, "bob").await;

        let Ok(StoreReply::Created { id }) = request(&mut bob, 1, create_op("bob", "b")).await else {
            panic!("create failed");
        };
        let result = request(
            &mut alice,
            1,
            StoreOp::Update {
                collection: "tasks".into(),
                id,
                patch: make_fields("alice", "stolen"),
            },
        )
        .await;
        assert!(matches!(result, Err(StoreFailure::Unauthorized { .. })));
    }

    #[tokio::test]
    async fn update_missing_document_is_not_found() {
        let (addr, _handle) = start_test_server().await;
        let mut alice = connect_as(addr, "alice").await;
        let result = request(
            &mut alice,
            1,
            StoreOp::Update {
                collection: "tasks".into(),
                id: "missing".into(),
                patch: Fields::new(),
            },
        )
        .await;
        assert_eq!(result, Err(StoreFailure::NotFound { id: "missing".into() }));
    }

    #[tokio::test]
    async fn delete_missing_document_succeeds() {
        let (addr, _handle) = start_test_server().await;
        let mut alice = connect_as(addr, "alice").await;
        let result = request(
            &mut alice,
            1,
            StoreOp::Delete {
                collection: "tasks".into(),
                id: "missing".into(),
            },
        )
        .await;
        assert_eq!(result, Ok(StoreReply::Done));
    }

    // --- subscriptions ---

    #[tokio::test]
    async fn subscriber_receives_changes_from_other_connection() {
        let (addr, _handle) = start_test_server().await;
        let mut watcher = connect_as(addr, "alice").await;
        let mut writer = connect_as(addr, "alice").await;

        let reply = request(
            &mut watcher,
            1,
            StoreOp::Subscribe {
                collection: "tasks".into(),
                filters: vec![Filter::eq(OWNER_FIELD, "alice")],
            },
        )
        .await
        .unwrap();
        let StoreReply::Subscribed { subscription_id } = reply else {
            panic!("expected Subscribed, got {reply:?}");
        };

        request(&mut writer, 1, create_op("alice", "shared")).await.unwrap();

        let ServerFrame::Changes {
            subscription_id: got,
            batch,
        } = ws_recv(&mut watcher).await
        else {
            panic!("expected Changes");
        };
        assert_eq!(got, subscription_id);
        assert!(matches!(&batch.changes[0], Change::Upserted(doc) if doc.get("title") == &FieldValue::Text("shared".into())));
    }

    #[tokio::test]
    async fn hello_again_switches_owner_and_drops_subscriptions() {
        let state = Arc::new(ServerState::new());
        let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
            .await
            .unwrap();
        let mut client = connect_as(addr, "alice").await;
        request(
            &mut client,
            1,
            StoreOp::Subscribe {
                collection: "tasks".into(),
                filters: vec![Filter::eq(OWNER_FIELD, "alice")],
            },
        )
        .await
        .unwrap();
        assert_eq!(state.db.subscription_count().await, 1);

        ws_send(
            &mut client,
            &ClientFrame::Hello {
                owner: "bob".into(),
            },
        )
        .await;
        assert_eq!(
            ws_recv(&mut client).await,
            ServerFrame::Welcome {
                owner: "bob".into()
            }
        );
        assert_eq!(state.db.subscription_count().await, 0);

        let result = request(&mut client, 2, create_op("bob", "now mine")).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let state = Arc::new(ServerState::with_config(64, DocumentDb::new()));
        let (addr, _handle) = start_server_with_state("127.0.0.1:0", state).await.unwrap();
        let mut client = connect_as(addr, "alice").await;
        let big = "x".repeat(200);
        ws_send(
            &mut client,
            &ClientFrame::Request {
                request_id: 1,
                op: create_op("alice", &big),
            },
        )
        .await;
        assert!(matches!(ws_recv(&mut client).await, ServerFrame::Error { .. }));
    }

    #[tokio::test]
    async fn disconnect_releases_subscriptions() {
        let state = Arc::new(ServerState::new());
        let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
            .await
            .unwrap();
        let mut client = connect_as(addr, "alice").await;
        request(
            &mut client,
            1,
            StoreOp::Subscribe {
                collection: "tasks".into(),
                filters: vec![Filter::eq(OWNER_FIELD, "alice")],
            },
        )
        .await
        .unwrap();
        drop(client);

        for _ in 0..50 {
            if state.db.subscription_count().await == 0 && state.connection_count().await == 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("subscriptions not released after disconnect");
    }

    #[tokio::test]
    async fn first_frame_must_be_hello() {
        let (addr, _handle) = start_test_server().await;
        let url = format!("ws://{addr}/ws");
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        ws_send(&mut ws, &ClientFrame::Request {
            request_id: 1,
            op: create_op("alice", "early"),
        })
        .await;
        // Server drops the connection without replying.
        let next = ws.next().await;
        assert!(!matches!(next, Some(Ok(tungstenite::Message::Binary(_)))));
    }
}
