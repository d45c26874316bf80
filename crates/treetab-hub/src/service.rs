use crate::store::{StoreError, TabStore};
use chrono::Utc;
use std::{
    collections::{HashMap, HashSet},
    io,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
#[cfg(unix)]
use std::{fs, os::unix::fs::PermissionsExt};
#[cfg(unix)]
use tokio::net::{
    unix::{OwnedReadHalf, OwnedWriteHalf},
    UnixListener, UnixStream,
};
#[cfg(unix)]
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};
use treetab_core::wire::{
    EventTopic, RequestError, TabEvent, TabRequest, TabResponse, WireEnvelope, WireMsg,
    CURRENT_PROTOCOL_VERSION,
};
#[cfg(unix)]
use treetab_core::wire::{decode_frame, encode_frame, DEFAULT_MAX_FRAME_BYTES};
use treetab_core::WindowId;

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub socket_path: PathBuf,
    pub window_id: WindowId,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
}

#[derive(Clone)]
struct ClientEntry {
    conn_id: String,
    client_id: String,
    topics: HashSet<EventTopic>,
    sender: mpsc::Sender<WireEnvelope>,
}

/// Serves the tab directory over a unix socket. Holds the authoritative
/// `TabStore` and fans lifecycle events out to subscribed connections.
pub struct TabHub {
    config: HubConfig,
    conn_counter: AtomicU64,
    store: Mutex<TabStore>,
    clients: RwLock<HashMap<String, ClientEntry>>,
}

impl TabHub {
    pub fn new(config: HubConfig) -> Arc<Self> {
        let store = TabStore::new(config.window_id);
        Arc::new(Self {
            config,
            conn_counter: AtomicU64::new(0),
            store: Mutex::new(store),
            clients: RwLock::new(HashMap::new()),
        })
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("hub-conn-{id}")
    }

    fn make_envelope(&self, request_id: Option<String>, msg: WireMsg) -> WireEnvelope {
        WireEnvelope {
            version: CURRENT_PROTOCOL_VERSION,
            sender_id: "treetab-hub".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            request_id,
            msg,
        }
    }

    /// Mutates the store as the host browser would (user gestures, renderer
    /// swaps) and broadcasts the resulting events. Connected views observe
    /// the change the same way they observe their own requests.
    pub async fn apply_host_change<R, F>(&self, change: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut TabStore) -> Result<(R, Vec<TabEvent>), StoreError>,
    {
        let (value, events) = {
            let mut store = self.store.lock().await;
            change(&mut store)?
        };
        self.broadcast(events).await;
        Ok(value)
    }

    async fn register_client(&self, client: ClientEntry) {
        info!(
            event = "hub_client_connected",
            conn_id = %client.conn_id,
            client_id = %client.client_id,
        );
        self.clients
            .write()
            .await
            .insert(client.conn_id.clone(), client);
    }

    async fn unregister_client(&self, conn_id: &str) {
        if self.clients.write().await.remove(conn_id).is_some() {
            info!(event = "hub_client_disconnected", conn_id = conn_id);
        }
    }

    async fn send_to_conn(&self, conn_id: &str, envelope: WireEnvelope) -> bool {
        let sender = {
            let clients = self.clients.read().await;
            clients.get(conn_id).map(|entry| entry.sender.clone())
        };
        let Some(sender) = sender else {
            return false;
        };

        match sender.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.unregister_client(conn_id).await;
                false
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = "hub_send_backpressure", conn_id = %conn_id);
                self.unregister_client(conn_id).await;
                false
            }
        }
    }

    async fn broadcast(&self, events: Vec<TabEvent>) {
        if events.is_empty() {
            return;
        }
        let clients = self.clients.read().await.clone();
        let mut dropped: Vec<String> = Vec::new();

        for event in events {
            let topic = event.topic();
            let envelope = self.make_envelope(None, WireMsg::Event(event));
            for (conn_id, entry) in &clients {
                if !entry.topics.contains(&topic) {
                    continue;
                }
                match entry.sender.try_send(envelope.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dropped.push(conn_id.clone());
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(event = "hub_slow_consumer", conn_id = %conn_id);
                        dropped.push(conn_id.clone());
                    }
                }
            }
        }

        dropped.sort();
        dropped.dedup();
        for conn_id in dropped {
            self.unregister_client(&conn_id).await;
        }
    }

    async fn handle_request(
        &self,
        conn_id: &str,
        request_id: Option<String>,
        request: TabRequest,
    ) {
        let (response, events) = {
            let mut store = self.store.lock().await;
            match request {
                TabRequest::Query { filter } => (
                    TabResponse::Tabs {
                        tabs: store.query(&filter),
                    },
                    Vec::new(),
                ),
                TabRequest::Create { props } => {
                    let (tab, events) = store.create(props);
                    (TabResponse::Tab { tab }, events)
                }
                TabRequest::Update { tab_id, props } => match store.update(tab_id, props) {
                    Ok(events) => (TabResponse::Done, events),
                    Err(err) => (rejection(&err), Vec::new()),
                },
                TabRequest::Remove { tab_id } => match store.remove(tab_id) {
                    Ok(events) => (TabResponse::Done, events),
                    Err(err) => (rejection(&err), Vec::new()),
                },
                TabRequest::OwningTab => match store.owning_tab() {
                    Some(tab) => (TabResponse::Tab { tab: tab.clone() }, Vec::new()),
                    None => (
                        TabResponse::Error {
                            error: RequestError::new(
                                "owning_tab_missing",
                                "the view panel tab is gone",
                            ),
                        },
                        Vec::new(),
                    ),
                },
                TabRequest::VisitedTabIds => (
                    TabResponse::VisitedTabIds {
                        tab_ids: store.visited_tab_ids(),
                    },
                    Vec::new(),
                ),
            }
        };

        let envelope = self.make_envelope(request_id, WireMsg::Response(response));
        let _ = self.send_to_conn(conn_id, envelope).await;
        self.broadcast(events).await;
    }

    #[cfg(not(unix))]
    pub async fn serve(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let _ = shutdown.changed().await;
        Ok(())
    }

    #[cfg(unix)]
    pub async fn serve(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        if let Some(parent) = self.config.socket_path.parent() {
            fs::create_dir_all(parent)?;
            let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
        }

        if self.config.socket_path.exists() {
            let _ = fs::remove_file(&self.config.socket_path);
        }

        let listener = UnixListener::bind(&self.config.socket_path)?;
        let _ = fs::set_permissions(&self.config.socket_path, fs::Permissions::from_mode(0o600));

        info!(
            event = "hub_start",
            window_id = self.config.window_id,
            socket = %self.config.socket_path.display(),
            queue_capacity = self.config.queue_capacity
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_ok() && *shutdown.borrow() {
                        break;
                    }
                }
                accept = listener.accept() => {
                    match accept {
                        Ok((stream, _addr)) => {
                            let hub = self.clone();
                            tokio::spawn(async move {
                                hub.handle_connection(stream).await;
                            });
                        }
                        Err(err) => {
                            warn!(event = "hub_accept_error", error = %err);
                        }
                    }
                }
            }
        }

        let _ = fs::remove_file(&self.config.socket_path);
        info!(event = "hub_stop");
        Ok(())
    }

    #[cfg(unix)]
    async fn handle_connection(self: Arc<Self>, stream: UnixStream) {
        let conn_id = self.next_conn_id();
        let (reader_half, writer_half) = stream.into_split();
        let mut reader = BufReader::new(reader_half);

        let Some(hello) = read_next_valid_frame(&mut reader).await else {
            return;
        };

        if hello.version > CURRENT_PROTOCOL_VERSION {
            warn!(
                event = "hub_unsupported_version",
                conn_id = %conn_id,
                version = hello.version
            );
            return;
        }

        let WireMsg::Hello(payload) = hello.msg else {
            warn!(event = "hub_expected_hello", conn_id = %conn_id);
            return;
        };

        let (tx, rx) = mpsc::channel::<WireEnvelope>(self.config.queue_capacity);
        let write_timeout = self.config.write_timeout;
        let conn_for_writer = conn_id.clone();
        let writer_task = tokio::spawn(async move {
            writer_loop(conn_for_writer, writer_half, rx, write_timeout).await;
        });

        self.register_client(ClientEntry {
            conn_id: conn_id.clone(),
            client_id: payload.client_id,
            topics: HashSet::new(),
            sender: tx.clone(),
        })
        .await;

        loop {
            let Some(envelope) = read_next_valid_frame(&mut reader).await else {
                break;
            };
            if envelope.version > CURRENT_PROTOCOL_VERSION {
                warn!(
                    event = "hub_skip_version",
                    conn_id = %conn_id,
                    version = envelope.version
                );
                continue;
            }

            match envelope.msg {
                WireMsg::Subscribe(payload) => {
                    let mut clients = self.clients.write().await;
                    if let Some(entry) = clients.get_mut(&conn_id) {
                        for topic in payload.topics {
                            entry.topics.insert(topic);
                        }
                    }
                    debug!(event = "hub_subscribed", conn_id = %conn_id);
                }
                WireMsg::Unsubscribe(payload) => {
                    let mut clients = self.clients.write().await;
                    if let Some(entry) = clients.get_mut(&conn_id) {
                        for topic in &payload.topics {
                            entry.topics.remove(topic);
                        }
                    }
                    debug!(event = "hub_unsubscribed", conn_id = %conn_id);
                }
                WireMsg::Request(request) => {
                    self.handle_request(&conn_id, envelope.request_id, request)
                        .await;
                }
                WireMsg::Hello(_) => {
                    warn!(event = "hub_unexpected_hello", conn_id = %conn_id);
                }
                _ => {
                    debug!(event = "hub_ignored_message", conn_id = %conn_id);
                }
            }
        }

        self.unregister_client(&conn_id).await;
        drop(tx);
        let _ = writer_task.await;
    }
}

fn rejection(err: &StoreError) -> TabResponse {
    let code = match err {
        StoreError::UnknownTab(_) => "unknown_tab",
        StoreError::NotClosable(_) => "not_closable",
    };
    TabResponse::Error {
        error: RequestError::new(code, err.to_string()),
    }
}

#[cfg(unix)]
async fn writer_loop(
    conn_id: String,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<WireEnvelope>,
    write_timeout: Duration,
) {
    while let Some(envelope) = rx.recv().await {
        let frame = match encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "hub_encode_error", conn_id = %conn_id, error = %err);
                continue;
            }
        };
        let send = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        if tokio::time::timeout(write_timeout, send).await.is_err() {
            warn!(event = "hub_write_timeout", conn_id = %conn_id);
            break;
        }
    }
}

#[cfg(unix)]
async fn read_next_valid_frame(reader: &mut BufReader<OwnedReadHalf>) -> Option<WireEnvelope> {
    loop {
        let mut line = Vec::new();
        let n = match reader.read_until(b'\n', &mut line).await {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "hub_read_error", error = %err);
                return None;
            }
        };
        if n == 0 {
            return None;
        }
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        match decode_frame::<WireEnvelope>(&line, DEFAULT_MAX_FRAME_BYTES) {
            Ok(envelope) => return Some(envelope),
            Err(err) => {
                warn!(event = "hub_decode_error", error = %err);
                continue;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::time::{SystemTime, UNIX_EPOCH};
    use treetab_core::wire::{HelloPayload, SubscribePayload};
    use treetab_core::{CreateProps, TabQuery};

    fn test_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir()
            .join(format!("treetab-hub-test-{name}-{nanos}"))
            .join("hub.sock")
    }

    async fn wait_for_socket(path: &Path) {
        for _ in 0..100 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("socket did not appear: {}", path.display());
    }

    async fn launch_hub(
        name: &str,
    ) -> (
        Arc<TabHub>,
        PathBuf,
        watch::Sender<bool>,
        tokio::task::JoinHandle<io::Result<()>>,
    ) {
        let path = test_path(name);
        let hub = TabHub::new(HubConfig {
            socket_path: path.clone(),
            window_id: 1,
            write_timeout: Duration::from_secs(1),
            queue_capacity: 32,
        });
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(hub.clone().serve(rx));
        wait_for_socket(&path).await;
        (hub, path, tx, handle)
    }

    fn client_envelope(request_id: Option<&str>, msg: WireMsg) -> WireEnvelope {
        WireEnvelope {
            version: CURRENT_PROTOCOL_VERSION,
            sender_id: "test-client".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            request_id: request_id.map(str::to_string),
            msg,
        }
    }

    async fn connect_client(path: &Path) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
        let stream = UnixStream::connect(path)
            .await
            .unwrap_or_else(|err| panic!("connect failed: {err}"));
        let (reader, mut writer) = stream.into_split();
        let hello = client_envelope(
            None,
            WireMsg::Hello(HelloPayload {
                client_id: "test-client".to_string(),
                capabilities: Vec::new(),
            }),
        );
        let frame = encode_frame(&hello, DEFAULT_MAX_FRAME_BYTES).expect("hello encode");
        writer.write_all(&frame).await.expect("hello write");
        writer.flush().await.expect("hello flush");
        (BufReader::new(reader), writer)
    }

    async fn send_frame(writer: &mut OwnedWriteHalf, envelope: &WireEnvelope) {
        let frame = encode_frame(envelope, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        writer.write_all(&frame).await.expect("write");
        writer.flush().await.expect("flush");
    }

    async fn read_frame(reader: &mut BufReader<OwnedReadHalf>) -> WireEnvelope {
        let mut line = Vec::new();
        let read =
            tokio::time::timeout(Duration::from_secs(3), reader.read_until(b'\n', &mut line))
                .await
                .expect("read timeout")
                .expect("read error");
        assert!(read > 0, "unexpected EOF");
        decode_frame(&line, DEFAULT_MAX_FRAME_BYTES).expect("decode")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn events_reach_only_subscribed_topics() {
        let (hub, path, shutdown_tx, handle) = launch_hub("topics").await;
        let (mut reader, mut writer) = connect_client(&path).await;

        send_frame(
            &mut writer,
            &client_envelope(
                None,
                WireMsg::Subscribe(SubscribePayload {
                    topics: vec![EventTopic::TabRemoved],
                }),
            ),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Created is not subscribed; Removed is the first frame delivered.
        let tab = hub
            .apply_host_change(|store| Ok(store.create(CreateProps::default())))
            .await
            .expect("create");
        hub.apply_host_change(|store| store.remove(tab.id).map(|events| ((), events)))
            .await
            .expect("remove");

        let frame = read_frame(&mut reader).await;
        let WireMsg::Event(TabEvent::Removed { tab_id, .. }) = frame.msg else {
            panic!("expected removed event, got {:?}", frame.msg);
        };
        assert_eq!(tab_id, tab.id);

        let _ = shutdown_tx.send(true);
        let result = handle.await.expect("join hub");
        assert!(result.is_ok(), "hub returned error: {result:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn responses_echo_request_ids_and_rejections_carry_codes() {
        let (hub, path, shutdown_tx, handle) = launch_hub("requests").await;
        let owning_id = hub
            .apply_host_change(|store| {
                let id = store.owning_tab().expect("owning tab").id;
                Ok((id, Vec::new()))
            })
            .await
            .expect("owning tab");

        let (mut reader, mut writer) = connect_client(&path).await;

        send_frame(
            &mut writer,
            &client_envelope(
                Some("req-query"),
                WireMsg::Request(TabRequest::Query {
                    filter: TabQuery::window(1),
                }),
            ),
        )
        .await;
        let reply = read_frame(&mut reader).await;
        assert_eq!(reply.request_id.as_deref(), Some("req-query"));
        let WireMsg::Response(TabResponse::Tabs { tabs }) = reply.msg else {
            panic!("expected tabs response");
        };
        assert_eq!(tabs.len(), 1);
        assert_eq!(tabs[0].id, owning_id);

        send_frame(
            &mut writer,
            &client_envelope(
                Some("req-remove-owning"),
                WireMsg::Request(TabRequest::Remove { tab_id: owning_id }),
            ),
        )
        .await;
        let reply = read_frame(&mut reader).await;
        let WireMsg::Response(TabResponse::Error { error }) = reply.msg else {
            panic!("expected rejection");
        };
        assert_eq!(error.code, "not_closable");

        send_frame(
            &mut writer,
            &client_envelope(
                Some("req-remove-unknown"),
                WireMsg::Request(TabRequest::Remove { tab_id: 999 }),
            ),
        )
        .await;
        let reply = read_frame(&mut reader).await;
        let WireMsg::Response(TabResponse::Error { error }) = reply.msg else {
            panic!("expected rejection");
        };
        assert_eq!(error.code, "unknown_tab");

        let _ = shutdown_tx.send(true);
        let result = handle.await.expect("join hub");
        assert!(result.is_ok(), "hub returned error: {result:?}");
    }
}
