//! WebSocket client for the Betterish store server.
//!
//! Implements [`DocumentStore`] over a single WebSocket connection. Requests
//! carry a client-chosen `request_id`; a background reader task routes each
//! reply to the waiting caller and each change batch to its subscription.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use betterish_proto::codec;
use betterish_proto::document::{ChangeBatch, Document, Fields, Filter, Query};
use betterish_proto::store::{ClientFrame, ServerFrame, StoreFailure, StoreOp, StoreReply};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{DocumentStore, StoreError, Subscription};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

type Outcome = Result<StoreReply, StoreFailure>;

/// Timeouts for a [`RemoteStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteOptions {
    /// Limit on establishing the WebSocket and completing the hello.
    pub connect_timeout: Duration,
    /// Limit on waiting for any single reply.
    pub request_timeout: Duration,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

struct PendingRequest {
    reply: oneshot::Sender<Outcome>,
    /// For subscribe requests: where the feed goes once the server names it.
    feed: Option<mpsc::UnboundedSender<ChangeBatch>>,
}

#[derive(Default)]
struct Routes {
    pending: HashMap<u64, PendingRequest>,
    feeds: HashMap<u64, mpsc::UnboundedSender<ChangeBatch>>,
    welcome: Option<oneshot::Sender<String>>,
}

/// WebSocket-backed [`DocumentStore`].
///
/// Created via [`RemoteStore::connect`], which opens the connection, says
/// hello as the given owner and spawns the reader and writer tasks.
pub struct RemoteStore {
    url: String,
    outgoing: mpsc::UnboundedSender<Message>,
    routes: Arc<Mutex<Routes>>,
    next_request: Arc<AtomicU64>,
    connected: Arc<AtomicBool>,
    options: RemoteOptions,
    _reader_handle: tokio::task::JoinHandle<()>,
    _writer_handle: tokio::task::JoinHandle<()>,
}

impl RemoteStore {
    /// Connect to a store server and act for `owner`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Timeout`] if connecting or the hello times out.
    /// - [`StoreError::Connectivity`] if the server cannot be reached or
    ///   closes the connection during the hello.
    /// - [`StoreError::Rejected`] if `url` is not a `ws://` or `wss://` URL, or
    ///   the server answers the hello with an error.
    pub async fn connect(url: &str, owner: &str, options: RemoteOptions) -> Result<Self, StoreError> {
        let parsed = url::Url::parse(url).map_err(|e| StoreError::Rejected(format!("invalid store URL {url:?}: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(StoreError::Rejected(format!(
                "store URL must use ws:// or wss://, got {}://",
                parsed.scheme()
            )));
        }

        let (ws_stream, _response) = tokio::time::timeout(options.connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                tracing::warn!(url, "store WebSocket connect timed out");
                StoreError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url, err = %e, "store WebSocket connect failed");
                StoreError::Connectivity(e.to_string())
            })?;

        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        send_frame(
            &mut ws_sender,
            &ClientFrame::Hello {
                owner: owner.to_string(),
            },
        )
        .await?;

        let welcome = tokio::time::timeout(options.connect_timeout, ws_reader.next())
            .await
            .map_err(|_| {
                tracing::warn!(url, "store hello timed out");
                StoreError::Timeout
            })?;
        match welcome {
            Some(Ok(Message::Binary(data))) => match codec::decode::<ServerFrame>(&data) {
                Ok(ServerFrame::Welcome { owner }) => {
                    tracing::info!(owner = %owner, url, "connected to store");
                }
                Ok(ServerFrame::Error { reason }) => {
                    tracing::warn!(reason = %reason, "store refused hello");
                    return Err(StoreError::Rejected(reason));
                }
                Ok(other) => {
                    tracing::warn!(?other, "unexpected frame during hello");
                    return Err(StoreError::Internal("unexpected frame during hello".into()));
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed hello response");
                    return Err(StoreError::Internal(format!("malformed hello response: {e}")));
                }
            },
            Some(Ok(_)) => {
                return Err(StoreError::Internal(
                    "unexpected non-binary frame during hello".into(),
                ));
            }
            Some(Err(e)) => return Err(StoreError::Connectivity(e.to_string())),
            None => return Err(StoreError::Connectivity("connection closed during hello".into())),
        }

        let routes = Arc::new(Mutex::new(Routes::default()));
        let connected = Arc::new(AtomicBool::new(true));
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        let reader_handle = tokio::spawn(reader_loop(
            ws_reader,
            Arc::clone(&routes),
            Arc::clone(&connected),
        ));
        let writer_handle = tokio::spawn(writer_loop(ws_sender, outgoing_rx, Arc::clone(&connected)));

        Ok(Self {
            url: url.to_string(),
            outgoing,
            routes,
            next_request: Arc::new(AtomicU64::new(1)),
            connected,
            options,
            _reader_handle: reader_handle,
            _writer_handle: writer_handle,
        })
    }

    /// Return the server URL this store is connected to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the connection is still up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn push(&self, frame: &ClientFrame) -> Result<(), StoreError> {
        if !self.is_connected() {
            return Err(StoreError::Connectivity("not connected".into()));
        }
        let bytes = codec::encode(frame).map_err(|e| StoreError::Internal(e.to_string()))?;
        self.outgoing
            .send(Message::Binary(bytes.into()))
            .map_err(|_| StoreError::Connectivity("connection closed".into()))
    }

    async fn request(
        &self,
        op: StoreOp,
        feed: Option<mpsc::UnboundedSender<ChangeBatch>>,
    ) -> Result<StoreReply, StoreError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.routes
            .lock()
            .pending
            .insert(request_id, PendingRequest { reply: tx, feed });

        if let Err(e) = self.push(&ClientFrame::Request { request_id, op }) {
            self.routes.lock().pending.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.options.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome.map_err(StoreError::from),
            Ok(Err(_)) => Err(StoreError::Connectivity(
                "connection lost awaiting reply".into(),
            )),
            Err(_) => {
                self.routes.lock().pending.remove(&request_id);
                tracing::warn!(request_id, "store request timed out");
                Err(StoreError::Timeout)
            }
        }
    }
}

fn unexpected(reply: &StoreReply) -> StoreError {
    StoreError::Internal(format!("unexpected reply: {reply:?}"))
}

impl DocumentStore for RemoteStore {
    /// Re-says hello as `owner`. The server drops every subscription of the
    /// connection, so local feeds end too.
    async fn authenticate(&self, owner: &str) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut routes = self.routes.lock();
            routes.welcome = Some(tx);
            routes.feeds.clear();
        }
        self.push(&ClientFrame::Hello {
            owner: owner.to_string(),
        })?;
        match tokio::time::timeout(self.options.request_timeout, rx).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(StoreError::Connectivity(
                "connection lost awaiting welcome".into(),
            )),
            Err(_) => Err(StoreError::Timeout),
        }
    }

    async fn create(&self, collection: &str, fields: Fields) -> Result<String, StoreError> {
        let op = StoreOp::Create {
            collection: collection.to_string(),
            fields,
        };
        match self.request(op, None).await? {
            StoreReply::Created { id } => Ok(id),
            other => Err(unexpected(&other)),
        }
    }

    async fn update(&self, collection: &str, id: &str, patch: Fields) -> Result<(), StoreError> {
        let op = StoreOp::Update {
            collection: collection.to_string(),
            id: id.to_string(),
            patch,
        };
        match self.request(op, None).await? {
            StoreReply::Done => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let op = StoreOp::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        };
        match self.request(op, None).await? {
            StoreReply::Done => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>, StoreError> {
        let op = StoreOp::Query {
            collection: collection.to_string(),
            query: query.clone(),
        };
        match self.request(op, None).await? {
            StoreReply::Documents(docs) => Ok(docs),
            other => Err(unexpected(&other)),
        }
    }

    async fn subscribe(&self, collection: &str, filters: Vec<Filter>) -> Result<Subscription, StoreError> {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let op = StoreOp::Subscribe {
            collection: collection.to_string(),
            filters,
        };
        let subscription_id = match self.request(op, Some(feed_tx)).await? {
            StoreReply::Subscribed { subscription_id } => subscription_id,
            other => return Err(unexpected(&other)),
        };

        let routes = Arc::downgrade(&self.routes);
        let outgoing = self.outgoing.clone();
        let next_request = Arc::clone(&self.next_request);
        Ok(Subscription::new(feed_rx, move || {
            if let Some(routes) = routes.upgrade() {
                routes.lock().feeds.remove(&subscription_id);
            }
            let frame = ClientFrame::Request {
                request_id: next_request.fetch_add(1, Ordering::Relaxed),
                op: StoreOp::Unsubscribe { subscription_id },
            };
            if let Ok(bytes) = codec::encode(&frame) {
                let _ = outgoing.send(Message::Binary(bytes.into()));
            }
        }))
    }
}

/// Encodes and sends a frame directly on the WebSocket sender.
async fn send_frame(ws_sender: &mut WsSender, frame: &ClientFrame) -> Result<(), StoreError> {
    let bytes = codec::encode(frame).map_err(|e| StoreError::Internal(e.to_string()))?;
    ws_sender
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| {
            tracing::warn!(err = %e, "store send failed");
            StoreError::Connectivity(e.to_string())
        })
}

/// Background task draining the outgoing queue into the WebSocket.
async fn writer_loop(
    mut ws_sender: WsSender,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg) = outgoing.recv().await {
        if let Err(e) = ws_sender.send(msg).await {
            tracing::warn!(err = %e, "store WebSocket write failed");
            break;
        }
    }
    connected.store(false, Ordering::Relaxed);
}

/// Background task that reads server frames and dispatches them.
///
/// Malformed frames are logged and skipped. When the socket ends, every
/// waiting request fails with a connectivity error and every feed ends.
async fn reader_loop(mut ws_reader: WsReader, routes: Arc<Mutex<Routes>>, connected: Arc<AtomicBool>) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Binary(data)) => match codec::decode::<ServerFrame>(&data) {
                Ok(frame) => dispatch(frame, &routes),
                Err(e) => tracing::warn!(err = %e, "malformed store frame, skipping"),
            },
            Ok(Message::Close(_)) => {
                tracing::info!("store WebSocket closed by server");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(err = %e, "store WebSocket read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    let mut routes = routes.lock();
    routes.pending.clear();
    routes.feeds.clear();
    routes.welcome = None;
    drop(routes);
    tracing::info!("store reader task exiting");
}

fn dispatch(frame: ServerFrame, routes: &Mutex<Routes>) {
    let mut routes = routes.lock();
    match frame {
        ServerFrame::Reply {
            request_id,
            outcome,
        } => {
            let Some(pending) = routes.pending.remove(&request_id) else {
                tracing::debug!(request_id, "reply for unknown request");
                return;
            };
            if let (Ok(StoreReply::Subscribed { subscription_id }), Some(feed)) =
                (&outcome, pending.feed)
            {
                routes.feeds.insert(*subscription_id, feed);
            }
            let _ = pending.reply.send(outcome);
        }
        ServerFrame::Changes {
            subscription_id,
            batch,
        } => {
            let delivered = routes
                .feeds
                .get(&subscription_id)
                .is_some_and(|feed| feed.send(batch).is_ok());
            if !delivered {
                tracing::debug!(subscription_id, "changes for closed subscription");
                routes.feeds.remove(&subscription_id);
            }
        }
        ServerFrame::Welcome { owner } => {
            tracing::info!(owner = %owner, "store owner confirmed");
            if let Some(waiter) = routes.welcome.take() {
                let _ = waiter.send(owner);
            }
        }
        ServerFrame::Error { reason } => {
            tracing::warn!(reason = %reason, "store server error");
        }
    }
}
