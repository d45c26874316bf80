use crate::directory::{DirectoryError, TabDirectory};
use chrono::Utc;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{unix::OwnedWriteHalf, UnixStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tracing::{debug, info, warn};
use treetab_core::wire::{
    decode_frame, encode_frame, EventTopic, HelloPayload, SubscribePayload, TabEvent, TabRequest,
    TabResponse, WireEnvelope, WireMsg, CURRENT_PROTOCOL_VERSION, DEFAULT_MAX_FRAME_BYTES,
};
use treetab_core::{CreateProps, TabId, TabQuery, TabRecord, UpdateProps};
use uuid::Uuid;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(200);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct WireDirectoryConfig {
    pub socket_path: PathBuf,
    pub client_id: String,
    pub request_timeout: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub event_queue_capacity: usize,
}

impl WireDirectoryConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            client_id: format!("treetab-view-{}", Uuid::new_v4()),
            request_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(1),
            queue_capacity: 64,
            event_queue_capacity: 64,
        }
    }
}

struct ClientInner {
    config: WireDirectoryConfig,
    outbound: mpsc::Sender<WireEnvelope>,
    pending: Mutex<HashMap<String, oneshot::Sender<TabResponse>>>,
    listeners: RwLock<HashMap<EventTopic, Vec<mpsc::Sender<TabEvent>>>>,
}

impl ClientInner {
    fn make_envelope(&self, request_id: Option<String>, msg: WireMsg) -> WireEnvelope {
        WireEnvelope {
            version: CURRENT_PROTOCOL_VERSION,
            sender_id: self.config.client_id.clone(),
            timestamp: Utc::now().to_rfc3339(),
            request_id,
            msg,
        }
    }

    /// Topics that still have at least one live receiver; closed ones are
    /// pruned in passing. Used to rebuild hub-side subscriptions after a
    /// reconnect.
    async fn live_topics(&self) -> Vec<EventTopic> {
        let mut listeners = self.listeners.write().await;
        listeners.retain(|_, senders| {
            senders.retain(|sender| !sender.is_closed());
            !senders.is_empty()
        });
        listeners.keys().copied().collect()
    }

    async fn fail_pending(&self) {
        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            debug!(event = "directory_pending_dropped", count = pending.len());
        }
        // Dropping the oneshot senders wakes every waiter with an error.
        pending.clear();
    }

    async fn dispatch(&self, envelope: WireEnvelope) {
        if envelope.version > CURRENT_PROTOCOL_VERSION {
            warn!(event = "directory_skip_version", version = envelope.version);
            return;
        }
        match envelope.msg {
            WireMsg::Response(response) => {
                let Some(request_id) = envelope.request_id else {
                    debug!(event = "directory_response_without_id");
                    return;
                };
                let sender = self.pending.lock().await.remove(&request_id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        debug!(event = "directory_unmatched_response", request_id = %request_id)
                    }
                }
            }
            WireMsg::Event(event) => self.dispatch_event(event).await,
            _ => debug!(event = "directory_ignored_message"),
        }
    }

    async fn dispatch_event(&self, event: TabEvent) {
        let topic = event.topic();
        let mut listeners = self.listeners.write().await;
        let Some(senders) = listeners.get_mut(&topic) else {
            return;
        };
        senders.retain(|sender| match sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = "directory_slow_listener", topic = %topic);
                false
            }
        });
        if senders.is_empty() {
            listeners.remove(&topic);
        }
    }
}

/// `TabDirectory` over a unix socket with automatic reconnect.
///
/// Requests are correlated by a per-request uuid; a lost connection fails
/// every in-flight request rather than leaving it hanging. On reconnect the
/// manager task replays subscriptions for topics that still have listeners.
#[derive(Clone)]
pub struct WireDirectory {
    inner: Arc<ClientInner>,
}

impl WireDirectory {
    pub fn connect(config: WireDirectoryConfig, shutdown: watch::Receiver<bool>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_capacity);
        let inner = Arc::new(ClientInner {
            config,
            outbound: outbound_tx,
            pending: Mutex::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
        });
        tokio::spawn(connection_manager(inner.clone(), outbound_rx, shutdown));
        Self { inner }
    }

    async fn request(
        &self,
        op: &'static str,
        request: TabRequest,
    ) -> Result<TabResponse, DirectoryError> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .await
            .insert(request_id.clone(), tx);

        let envelope = self
            .inner
            .make_envelope(Some(request_id.clone()), WireMsg::Request(request));
        if self.inner.outbound.send(envelope).await.is_err() {
            self.inner.pending.lock().await.remove(&request_id);
            return Err(DirectoryError::Unavailable(
                "directory task stopped".to_string(),
            ));
        }

        match tokio::time::timeout(self.inner.config.request_timeout, rx).await {
            Ok(Ok(TabResponse::Error { error })) => Err(DirectoryError::Rejected(error)),
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(DirectoryError::Unavailable("connection lost".to_string())),
            Err(_) => {
                self.inner.pending.lock().await.remove(&request_id);
                warn!(event = "directory_request_timeout", op);
                Err(DirectoryError::Timeout { op })
            }
        }
    }
}

impl TabDirectory for WireDirectory {
    async fn query(&self, filter: TabQuery) -> Result<Vec<TabRecord>, DirectoryError> {
        match self.request("query", TabRequest::Query { filter }).await? {
            TabResponse::Tabs { tabs } => Ok(tabs),
            _ => Err(DirectoryError::UnexpectedResponse { op: "query" }),
        }
    }

    async fn create(&self, props: CreateProps) -> Result<TabRecord, DirectoryError> {
        match self.request("create", TabRequest::Create { props }).await? {
            TabResponse::Tab { tab } => Ok(tab),
            _ => Err(DirectoryError::UnexpectedResponse { op: "create" }),
        }
    }

    async fn update(&self, tab_id: TabId, props: UpdateProps) -> Result<(), DirectoryError> {
        match self
            .request("update", TabRequest::Update { tab_id, props })
            .await?
        {
            TabResponse::Done => Ok(()),
            _ => Err(DirectoryError::UnexpectedResponse { op: "update" }),
        }
    }

    async fn remove(&self, tab_id: TabId) -> Result<(), DirectoryError> {
        match self.request("remove", TabRequest::Remove { tab_id }).await? {
            TabResponse::Done => Ok(()),
            _ => Err(DirectoryError::UnexpectedResponse { op: "remove" }),
        }
    }

    async fn owning_tab(&self) -> Result<TabRecord, DirectoryError> {
        match self.request("owning_tab", TabRequest::OwningTab).await? {
            TabResponse::Tab { tab } => Ok(tab),
            _ => Err(DirectoryError::UnexpectedResponse { op: "owning_tab" }),
        }
    }

    async fn visited_tab_ids(&self) -> Result<Vec<TabId>, DirectoryError> {
        match self
            .request("visited_tab_ids", TabRequest::VisitedTabIds)
            .await?
        {
            TabResponse::VisitedTabIds { tab_ids } => Ok(tab_ids),
            _ => Err(DirectoryError::UnexpectedResponse {
                op: "visited_tab_ids",
            }),
        }
    }

    async fn subscribe(&self, topic: EventTopic) -> mpsc::Receiver<TabEvent> {
        let (tx, rx) = mpsc::channel(self.inner.config.event_queue_capacity);
        self.inner
            .listeners
            .write()
            .await
            .entry(topic)
            .or_default()
            .push(tx);

        // Best effort while connected; the manager replays subscriptions on
        // every reconnect anyway.
        let subscribe = self.inner.make_envelope(
            None,
            WireMsg::Subscribe(SubscribePayload {
                topics: vec![topic],
            }),
        );
        if self.inner.outbound.try_send(subscribe).is_err() {
            debug!(event = "directory_subscribe_deferred", topic = %topic);
        }
        rx
    }
}

async fn connection_manager(
    inner: Arc<ClientInner>,
    mut outbound_rx: mpsc::Receiver<WireEnvelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut delay = INITIAL_RECONNECT_DELAY;
    loop {
        if *shutdown.borrow() {
            break;
        }
        match UnixStream::connect(&inner.config.socket_path).await {
            Ok(stream) => {
                info!(
                    event = "directory_connected",
                    socket = %inner.config.socket_path.display()
                );
                delay = INITIAL_RECONNECT_DELAY;
                if let Err(err) =
                    serve_connection(&inner, stream, &mut outbound_rx, &mut shutdown).await
                {
                    warn!(event = "directory_connection_lost", error = %err);
                }
                inner.fail_pending().await;
            }
            Err(err) => {
                debug!(event = "directory_connect_failed", error = %err);
            }
        }
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
        delay = (delay * 2).min(MAX_RECONNECT_DELAY);
    }
    debug!(event = "directory_manager_stopped");
}

async fn serve_connection(
    inner: &Arc<ClientInner>,
    stream: UnixStream,
    outbound_rx: &mut mpsc::Receiver<WireEnvelope>,
    shutdown: &mut watch::Receiver<bool>,
) -> io::Result<()> {
    let (reader_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader_half);

    let hello = inner.make_envelope(
        None,
        WireMsg::Hello(HelloPayload {
            client_id: inner.config.client_id.clone(),
            capabilities: vec!["tab-directory".to_string()],
        }),
    );
    write_frame(&mut writer, &hello, inner.config.write_timeout).await?;

    let topics = inner.live_topics().await;
    if !topics.is_empty() {
        let count = topics.len();
        let subscribe = inner.make_envelope(None, WireMsg::Subscribe(SubscribePayload { topics }));
        write_frame(&mut writer, &subscribe, inner.config.write_timeout).await?;
        info!(event = "directory_resubscribed", topics = count);
    }

    // The line buffer persists across select iterations so a cancelled
    // read_until never loses partially read bytes.
    let mut line: Vec<u8> = Vec::new();
    loop {
        tokio::select! {
            read = reader.read_until(b'\n', &mut line) => {
                if read? == 0 {
                    return Ok(());
                }
                if !line.iter().all(|b| b.is_ascii_whitespace()) {
                    match decode_frame::<WireEnvelope>(&line, DEFAULT_MAX_FRAME_BYTES) {
                        Ok(envelope) => inner.dispatch(envelope).await,
                        Err(err) => warn!(event = "directory_decode_error", error = %err),
                    }
                }
                line.clear();
            }
            outbound = outbound_rx.recv() => {
                let Some(envelope) = outbound else {
                    return Ok(());
                };
                write_frame(&mut writer, &envelope, inner.config.write_timeout).await?;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

async fn write_frame(
    writer: &mut OwnedWriteHalf,
    envelope: &WireEnvelope,
    write_timeout: Duration,
) -> io::Result<()> {
    let frame = encode_frame(envelope, DEFAULT_MAX_FRAME_BYTES)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
    let send = async {
        writer.write_all(&frame).await?;
        writer.flush().await
    };
    tokio::time::timeout(write_timeout, send)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timeout"))?
}
