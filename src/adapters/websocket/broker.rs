//! Multi-client connection broker.
//!
//! Owns every piece of per-connection state: pending (unidentified) sockets,
//! named clients keyed by design-file key, the outstanding-request table, and
//! the active-file election. One broker instance serves all sockets; there is
//! no process-global state, so brokers can coexist in tests.
//!
//! # Concurrency
//!
//! A single mutex around [`BrokerState`] serializes every handler, mirroring
//! single-threaded event-loop dispatch: each inbound frame is handled to
//! completion before the next. Nothing awaits while holding the lock. The
//! three timers (identification deadline, request timeout, grace period) are
//! spawned tasks holding a `Weak` reference; every `JoinHandle` is kept in
//! the state so shutdown can cancel them all.
//!
//! # Lifecycle per file key
//!
//! ```text
//! UNKNOWN ─connect─► PENDING ─IDENTIFY─► OPEN ◄─reconnect─┐
//!                       │                  │               │
//!                  deadline fires     socket closes ────► GRACE
//!                       │                                  │
//!                       ▼                             grace expires
//!                    (closed)                              ▼
//!                                                       PURGED
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::BrokerConfig;
use crate::domain::foundation::{BrokerError, FileKey, Timestamp};
use crate::domain::session::{
    ChangeQuery, ClientInfo, DocumentChange, FileInfo, FileSession, LogEntry, LogQuery,
    SelectionSnapshot,
};
use crate::ports::CommandGateway;

use super::messages::{
    self, CommandFrame, DocumentChangePayload, EventFrame, IdentifyPayload, InboundFrame,
    LogCapturePayload, PageChangePayload, ResponseFrame, SelectionChangePayload,
};

/// Process-unique handle for one socket, minted on attach.
pub type TransportId = u64;

/// Sending half of one socket: frames pushed here are drained by the
/// connection's writer task. Dropping the last clone closes the socket.
#[derive(Debug, Clone)]
struct Transport {
    id: TransportId,
    tx: mpsc::UnboundedSender<String>,
}

/// Broker-wide notifications, tagged with the originating file key.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    ClientConnected { key: FileKey },
    ClientDisconnected { key: FileKey },
    DocumentChanged { key: FileKey, change: DocumentChange },
}

/// A socket that has connected but not yet identified its file.
struct PendingSocket {
    transport: Transport,
    deadline: JoinHandle<()>,
}

/// A named client: session state plus its (possibly closed) transport.
struct ClientEntry {
    session: FileSession,
    transport: Transport,
    /// False between transport loss and either reconnection or purge.
    open: bool,
    grace: Option<JoinHandle<()>>,
}

/// One outstanding command awaiting its correlated response.
struct PendingRequest {
    key: FileKey,
    method: String,
    created_at: Timestamp,
    resolver: oneshot::Sender<Result<serde_json::Value, BrokerError>>,
    timeout: JoinHandle<()>,
}

#[derive(Default)]
struct BrokerState {
    shutting_down: bool,
    pending_sockets: HashMap<TransportId, PendingSocket>,
    clients: HashMap<FileKey, ClientEntry>,
    /// Reverse index socket → file key for O(1) event routing.
    transport_index: HashMap<TransportId, FileKey>,
    requests: HashMap<String, PendingRequest>,
    active: Option<FileKey>,
    next_transport: TransportId,
    next_correlation: u64,
}

struct Inner {
    config: BrokerConfig,
    state: Mutex<BrokerState>,
    events: broadcast::Sender<BridgeEvent>,
}

/// Cheaply cloneable handle to one broker instance.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(BrokerState::default()),
                events,
            }),
        }
    }

    /// Subscribe to broker-wide notifications. Slow subscribers lag and miss
    /// events rather than blocking the broker.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.inner.events.subscribe()
    }

    /// Register a freshly accepted socket as pending and start its
    /// identification deadline.
    pub fn attach_transport(&self, tx: mpsc::UnboundedSender<String>) -> TransportId {
        let mut state = self.inner.state();
        let id = state.next_transport;
        state.next_transport += 1;
        if state.shutting_down {
            // Dropping the sender closes the socket's writer immediately.
            return id;
        }
        let deadline = spawn_identification_deadline(&self.inner, id);
        state.pending_sockets.insert(
            id,
            PendingSocket {
                transport: Transport { id, tx },
                deadline,
            },
        );
        tracing::debug!(transport = id, "socket attached, awaiting identification");
        id
    }

    /// Handle one inbound text frame from a socket.
    ///
    /// Malformed frames are logged and dropped; they never crash the broker.
    pub fn handle_frame(&self, transport: TransportId, text: &str) {
        match messages::parse_inbound(text) {
            Ok(InboundFrame::Event(event)) => self.handle_event(transport, event),
            Ok(InboundFrame::Response(response)) => self.handle_response(response),
            Err(err) => {
                tracing::warn!(transport, %err, "dropping malformed frame");
            }
        }
    }

    /// Handle socket loss.
    ///
    /// Pending sockets are discarded outright (their deadline is cancelled);
    /// named clients keep all state and enter the reconnection grace window.
    pub fn transport_closed(&self, transport: TransportId) {
        let mut state = self.inner.state();
        if state.shutting_down {
            return;
        }
        if let Some(pending) = state.pending_sockets.remove(&transport) {
            pending.deadline.abort();
            tracing::debug!(transport, "pending socket closed before identifying");
            return;
        }
        // A reconnection may already have rebound this key to a new socket,
        // in which case the index no longer knows this transport.
        let Some(key) = state.transport_index.remove(&transport) else {
            return;
        };
        if let Some(entry) = state.clients.get_mut(&key) {
            if entry.transport.id != transport {
                return;
            }
            entry.open = false;
            entry.grace = Some(spawn_grace_timer(&self.inner, key.clone(), transport));
            tracing::info!(key = %key, transport, "transport lost, grace window started");
        }
    }

    /// Send a command and await its correlated response. See
    /// [`CommandGateway::send_command`] for routing and failure semantics.
    pub async fn send_command(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Option<Duration>,
        target: Option<&FileKey>,
    ) -> Result<serde_json::Value, BrokerError> {
        let rx = {
            let mut state = self.inner.state();
            if state.shutting_down {
                return Err(BrokerError::ShutdownInProgress);
            }
            let key = match target {
                Some(key) => key.clone(),
                None => state.active.clone().ok_or(BrokerError::NoActiveFile)?,
            };
            let open_tx = state
                .clients
                .get(&key)
                .filter(|entry| entry.open)
                .map(|entry| entry.transport.tx.clone())
                .ok_or_else(|| BrokerError::NotConnected { key: key.clone() })?;

            let seq = state.next_correlation;
            state.next_correlation += 1;
            // Opaque and non-durable: never persisted or compared across
            // process restarts.
            let id = format!("{}-{}", seq, Timestamp::now().as_millis());

            let frame = CommandFrame {
                id: id.clone(),
                method: method.to_string(),
                params,
            };
            let text = serde_json::to_string(&frame)
                .expect("CommandFrame serialization should not fail");
            if open_tx.send(text).is_err() {
                // Writer already gone; the close event just has not landed.
                return Err(BrokerError::NotConnected { key });
            }

            let timeout = timeout.unwrap_or_else(|| self.inner.config.request_timeout());
            let (resolver, rx) = oneshot::channel();
            let handle = spawn_request_timeout(&self.inner, id.clone(), timeout);
            state.requests.insert(
                id,
                PendingRequest {
                    key,
                    method: method.to_string(),
                    created_at: Timestamp::now(),
                    resolver,
                    timeout: handle,
                },
            );
            rx
        };

        // Resolved by exactly one of: matching response, timeout, batch
        // rejection on client loss or shutdown.
        rx.await.unwrap_or(Err(BrokerError::ShutdownInProgress))
    }

    /// Cancel every timer, close every socket, reject every outstanding
    /// request, and clear all state. Does not return until each timer task
    /// has terminated, so no handle leaks across restarts.
    pub async fn shutdown(&self) {
        let (handles, resolvers) = {
            let mut state = self.inner.state();
            state.shutting_down = true;
            let mut handles = Vec::new();
            let mut resolvers = Vec::new();
            for (_, pending) in state.pending_sockets.drain() {
                handles.push(pending.deadline);
            }
            for (_, entry) in state.clients.drain() {
                if let Some(grace) = entry.grace {
                    handles.push(grace);
                }
                // entry.transport dropped here, closing the socket writer
            }
            for (_, request) in state.requests.drain() {
                handles.push(request.timeout);
                resolvers.push(request.resolver);
            }
            state.transport_index.clear();
            state.active = None;
            (handles, resolvers)
        };

        for resolver in resolvers {
            let _ = resolver.send(Err(BrokerError::ShutdownInProgress));
        }
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("broker shut down");
    }

    // ============================================
    // Inbound event handling
    // ============================================

    fn handle_event(&self, transport: TransportId, event: EventFrame) {
        match event {
            EventFrame::Identify(payload) => self.handle_identify(transport, payload),
            EventFrame::DocumentChange(payload) => self.handle_document_change(transport, payload),
            EventFrame::SelectionChange(payload) => {
                self.handle_selection_change(transport, payload)
            }
            EventFrame::PageChange(payload) => self.handle_page_change(transport, payload),
            EventFrame::LogCapture(payload) => self.handle_log_capture(transport, payload),
        }
    }

    fn handle_identify(&self, transport: TransportId, payload: IdentifyPayload) {
        let key = FileKey::new(payload.key);
        let mut state = self.inner.state();
        if state.shutting_down {
            return;
        }

        let socket = if let Some(pending) = state.pending_sockets.remove(&transport) {
            pending.deadline.abort();
            pending.transport
        } else if let Some(old_key) = state.transport_index.get(&transport).cloned() {
            if old_key == key {
                // Repeat identify on a promoted socket: metadata refresh.
                if let Some(entry) = state.clients.get_mut(&key) {
                    entry.session.name = payload.name;
                    if payload.current_page.is_some() {
                        entry.session.current_page = payload.current_page;
                    }
                    entry.session.touch();
                }
                return;
            }
            // File switch: the socket now serves a different design file.
            // The old entry is destroyed through the same path as grace
            // expiry, which batch-rejects its outstanding requests.
            tracing::info!(transport, old = %old_key, new = %key, "socket switched files");
            state.transport_index.remove(&transport);
            if state.active.as_ref() == Some(&old_key) {
                state.active = None;
            }
            match self.inner.purge_locked(&mut state, &old_key) {
                Some(reused) => reused,
                None => return,
            }
        } else {
            tracing::warn!(transport, "identify from unknown transport, ignoring");
            return;
        };

        self.inner
            .promote_locked(&mut state, socket, key, payload.name, payload.current_page);
    }

    fn handle_document_change(&self, transport: TransportId, payload: DocumentChangePayload) {
        let mut state = self.inner.state();
        let Some((key, entry)) = named_entry(&mut state, transport) else {
            return;
        };
        let mut changed_ids = payload.changed_ids;
        changed_ids.truncate(self.inner.config.changed_ids_max);
        let change = DocumentChange {
            style_changed: payload.has_style_changes,
            node_changed: payload.has_node_changes,
            changed_ids,
            change_count: payload.change_count,
            timestamp: Timestamp::from_millis(payload.timestamp),
        };
        entry.session.document_changes.push(change.clone());
        entry.session.touch();
        let _ = self.inner.events.send(BridgeEvent::DocumentChanged { key, change });
    }

    fn handle_selection_change(&self, transport: TransportId, payload: SelectionChangePayload) {
        let mut state = self.inner.state();
        let Some((key, entry)) = named_entry(&mut state, transport) else {
            return;
        };
        let mut nodes = payload.nodes;
        nodes.truncate(self.inner.config.selection_nodes_max);
        entry.session.selection = Some(SelectionSnapshot {
            nodes,
            count: payload.count,
            page: payload.page.clone(),
            timestamp: Timestamp::from_millis(payload.timestamp),
        });
        if payload.page.is_some() {
            entry.session.current_page = payload.page;
        }
        entry.session.touch();
        // Selecting something is explicit user intent: this file wins the
        // active election unconditionally.
        state.active = Some(key);
    }

    fn handle_page_change(&self, transport: TransportId, payload: PageChangePayload) {
        let mut state = self.inner.state();
        let Some((key, entry)) = named_entry(&mut state, transport) else {
            return;
        };
        entry.session.current_page = Some(payload.page);
        entry.session.touch();
        state.active = Some(key);
    }

    fn handle_log_capture(&self, transport: TransportId, payload: LogCapturePayload) {
        let mut state = self.inner.state();
        let Some((key, entry)) = named_entry(&mut state, transport) else {
            return;
        };
        let mut message = payload.message;
        truncate_chars(&mut message, self.inner.config.log_message_max_chars);
        let mut args = payload.args;
        args.truncate(self.inner.config.log_args_max);
        entry.session.logs.push(LogEntry {
            timestamp: Timestamp::from_millis(payload.timestamp),
            level: payload.level,
            message,
            args,
            source: key,
        });
        entry.session.touch();
    }

    fn handle_response(&self, frame: ResponseFrame) {
        let taken = self.inner.state().requests.remove(&frame.id);
        let Some(request) = taken else {
            // Late responses racing a timeout are legitimate; ignore them.
            tracing::trace!(id = %frame.id, "response for unknown or settled request");
            return;
        };
        request.timeout.abort();
        let outcome = match frame.error {
            Some(error) => Err(BrokerError::Remote(error)),
            None => Ok(frame.result.unwrap_or(serde_json::Value::Null)),
        };
        let _ = request.resolver.send(outcome);
    }

    // ============================================
    // Read accessors
    // ============================================

    pub fn connected_files(&self) -> Vec<FileInfo> {
        let state = self.inner.state();
        let mut files: Vec<FileInfo> = state
            .clients
            .iter()
            .filter(|(_, entry)| entry.open)
            .map(|(key, entry)| FileInfo {
                key: key.clone(),
                name: entry.session.name.clone(),
                current_page: entry.session.current_page.clone(),
                is_active: state.active.as_ref() == Some(key),
            })
            .collect();
        files.sort_by(|a, b| a.key.cmp(&b.key));
        files
    }

    pub fn set_active_file(&self, key: &FileKey) -> bool {
        let mut state = self.inner.state();
        let open = state.clients.get(key).map(|entry| entry.open).unwrap_or(false);
        if open {
            state.active = Some(key.clone());
        }
        open
    }

    pub fn active_file_key(&self) -> Option<FileKey> {
        self.inner.state().active.clone()
    }

    pub fn logs(&self, query: &LogQuery) -> Result<Vec<LogEntry>, BrokerError> {
        let state = self.inner.state();
        let key = resolve_key(&state, query.file.as_ref())?;
        let entry = lookup(&state, &key)?;
        Ok(entry.session.query_logs(query))
    }

    pub fn clear_logs(&self, file: Option<&FileKey>) -> Result<usize, BrokerError> {
        let mut state = self.inner.state();
        let key = resolve_key(&state, file)?;
        let entry = lookup_mut(&mut state, &key)?;
        Ok(entry.session.logs.clear())
    }

    pub fn document_changes(&self, query: &ChangeQuery) -> Result<Vec<DocumentChange>, BrokerError> {
        let state = self.inner.state();
        let key = resolve_key(&state, query.file.as_ref())?;
        let entry = lookup(&state, &key)?;
        Ok(entry.session.query_document_changes(query))
    }

    pub fn clear_document_changes(&self, file: Option<&FileKey>) -> Result<usize, BrokerError> {
        let mut state = self.inner.state();
        let key = resolve_key(&state, file)?;
        let entry = lookup_mut(&mut state, &key)?;
        Ok(entry.session.document_changes.clear())
    }

    pub fn selection(&self, file: Option<&FileKey>) -> Result<Option<SelectionSnapshot>, BrokerError> {
        let state = self.inner.state();
        let key = resolve_key(&state, file)?;
        let entry = lookup(&state, &key)?;
        Ok(entry.session.selection.clone())
    }

    pub fn client_info(&self, file: Option<&FileKey>) -> Result<ClientInfo, BrokerError> {
        let state = self.inner.state();
        let key = resolve_key(&state, file)?;
        let entry = lookup(&state, &key)?;
        Ok(ClientInfo {
            key: key.clone(),
            name: entry.session.name.clone(),
            current_page: entry.session.current_page.clone(),
            connected: entry.open,
            connected_at: entry.session.connected_at,
            last_activity: entry.session.last_activity,
        })
    }

    pub fn is_any_client_connected(&self) -> bool {
        self.inner
            .state()
            .clients
            .values()
            .any(|entry| entry.open)
    }
}

#[async_trait]
impl CommandGateway for Broker {
    async fn send_command(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Option<Duration>,
        target: Option<&FileKey>,
    ) -> Result<serde_json::Value, BrokerError> {
        Broker::send_command(self, method, params, timeout, target).await
    }

    fn connected_files(&self) -> Vec<FileInfo> {
        Broker::connected_files(self)
    }

    fn set_active_file(&self, key: &FileKey) -> bool {
        Broker::set_active_file(self, key)
    }

    fn active_file_key(&self) -> Option<FileKey> {
        Broker::active_file_key(self)
    }

    fn logs(&self, query: &LogQuery) -> Result<Vec<LogEntry>, BrokerError> {
        Broker::logs(self, query)
    }

    fn clear_logs(&self, file: Option<&FileKey>) -> Result<usize, BrokerError> {
        Broker::clear_logs(self, file)
    }

    fn document_changes(&self, query: &ChangeQuery) -> Result<Vec<DocumentChange>, BrokerError> {
        Broker::document_changes(self, query)
    }

    fn clear_document_changes(&self, file: Option<&FileKey>) -> Result<usize, BrokerError> {
        Broker::clear_document_changes(self, file)
    }

    fn selection(&self, file: Option<&FileKey>) -> Result<Option<SelectionSnapshot>, BrokerError> {
        Broker::selection(self, file)
    }

    fn client_info(&self, file: Option<&FileKey>) -> Result<ClientInfo, BrokerError> {
        Broker::client_info(self, file)
    }

    fn is_any_client_connected(&self) -> bool {
        Broker::is_any_client_connected(self)
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        // A poisoned lock only means a panic elsewhere; the state itself is
        // still structurally sound.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Promote or rebind a named client and run the election.
    fn promote_locked(
        &self,
        state: &mut BrokerState,
        socket: Transport,
        key: FileKey,
        name: String,
        current_page: Option<String>,
    ) {
        match state.clients.get_mut(&key) {
            Some(entry) => {
                // Same key on a new socket: replace the stale transport and
                // keep every buffer. Any in-flight grace timer for the old
                // transport fails its guard when it fires.
                if entry.transport.id != socket.id {
                    state.transport_index.remove(&entry.transport.id);
                    tracing::info!(
                        key = %key,
                        stale = entry.transport.id,
                        transport = socket.id,
                        "rebinding client to new transport"
                    );
                }
                entry.transport = socket.clone();
                entry.open = true;
                entry.session.name = name;
                if current_page.is_some() {
                    entry.session.current_page = current_page;
                }
                entry.session.touch();
            }
            None => {
                tracing::info!(key = %key, transport = socket.id, "client identified");
                state.clients.insert(
                    key.clone(),
                    ClientEntry {
                        session: FileSession::new(
                            key.clone(),
                            name,
                            current_page,
                            self.config.log_capacity,
                            self.config.document_change_capacity,
                        ),
                        transport: socket.clone(),
                        open: true,
                        grace: None,
                    },
                );
            }
        }
        state.transport_index.insert(socket.id, key.clone());

        let active_open = state
            .active
            .as_ref()
            .and_then(|active| state.clients.get(active))
            .map(|entry| entry.open)
            .unwrap_or(false);
        if !active_open {
            state.active = Some(key.clone());
        }
        let _ = self.events.send(BridgeEvent::ClientConnected { key });
    }

    /// Destroy a named client: remove it, batch-reject its outstanding
    /// requests, and re-elect the active file if it was the one removed.
    /// Returns the entry's transport so a file-switch caller can reuse it.
    fn purge_locked(&self, state: &mut BrokerState, key: &FileKey) -> Option<Transport> {
        let entry = state.clients.remove(key)?;
        if let Some(grace) = entry.grace {
            grace.abort();
        }
        if state.transport_index.get(&entry.transport.id) == Some(key) {
            state.transport_index.remove(&entry.transport.id);
        }

        let ids: Vec<String> = state
            .requests
            .iter()
            .filter(|(_, request)| &request.key == key)
            .map(|(id, _)| id.clone())
            .collect();
        let rejected = ids.len();
        for id in ids {
            if let Some(request) = state.requests.remove(&id) {
                request.timeout.abort();
                let _ = request
                    .resolver
                    .send(Err(BrokerError::ClientDisconnected { key: key.clone() }));
            }
        }

        if state.active.as_ref() == Some(key) {
            state.active = state
                .clients
                .iter()
                .find(|(_, entry)| entry.open)
                .map(|(open_key, _)| open_key.clone());
        }

        tracing::info!(key = %key, rejected, "client purged");
        let _ = self.events.send(BridgeEvent::ClientDisconnected { key: key.clone() });
        Some(entry.transport)
    }

    fn identification_expired(&self, transport: TransportId) {
        let mut state = self.state();
        if let Some(pending) = state.pending_sockets.remove(&transport) {
            tracing::warn!(transport, "socket never identified, closing");
            // Dropping the pending entry drops its sender, which closes the
            // socket writer. Nobody is waiting on this socket yet, so no
            // caller-visible error is raised.
            drop(pending);
        }
    }

    fn grace_expired(&self, key: &FileKey, stale: TransportId) {
        let mut state = self.state();
        if state.shutting_down {
            return;
        }
        // A reconnection may have rebound this key while the timer was
        // pending. Purge only if the entry still references the exact stale
        // transport; otherwise this timer is moot.
        let still_stale = state
            .clients
            .get(key)
            .map(|entry| entry.transport.id == stale && !entry.open)
            .unwrap_or(false);
        if !still_stale {
            return;
        }
        tracing::info!(key = %key, "grace period expired without reconnection");
        self.purge_locked(&mut state, key);
    }

    fn request_timed_out(&self, id: &str, timeout: Duration) {
        let taken = self.state().requests.remove(id);
        if let Some(request) = taken {
            tracing::warn!(
                id,
                method = %request.method,
                age_ms = request.created_at.elapsed_ms(),
                "command timed out"
            );
            let _ = request.resolver.send(Err(BrokerError::CommandTimeout {
                method: request.method,
                elapsed_ms: timeout.as_millis() as u64,
            }));
        }
    }
}

/// Resolve a transport id to its named client, if promoted.
fn named_entry<'a>(
    state: &'a mut BrokerState,
    transport: TransportId,
) -> Option<(FileKey, &'a mut ClientEntry)> {
    let key = match state.transport_index.get(&transport) {
        Some(key) => key.clone(),
        None => {
            tracing::debug!(transport, "event from unidentified transport, dropping");
            return None;
        }
    };
    let entry = state.clients.get_mut(&key)?;
    Some((key, entry))
}

fn resolve_key(state: &BrokerState, file: Option<&FileKey>) -> Result<FileKey, BrokerError> {
    match file {
        Some(key) => Ok(key.clone()),
        None => state.active.clone().ok_or(BrokerError::NoActiveFile),
    }
}

fn lookup<'a>(state: &'a BrokerState, key: &FileKey) -> Result<&'a ClientEntry, BrokerError> {
    state
        .clients
        .get(key)
        .ok_or_else(|| BrokerError::NotConnected { key: key.clone() })
}

fn lookup_mut<'a>(
    state: &'a mut BrokerState,
    key: &FileKey,
) -> Result<&'a mut ClientEntry, BrokerError> {
    state
        .clients
        .get_mut(key)
        .ok_or_else(|| BrokerError::NotConnected { key: key.clone() })
}

/// Truncate to at most `max` characters on a char boundary.
fn truncate_chars(text: &mut String, max: usize) {
    if let Some((index, _)) = text.char_indices().nth(max) {
        text.truncate(index);
    }
}

fn spawn_identification_deadline(inner: &Arc<Inner>, transport: TransportId) -> JoinHandle<()> {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    let deadline = inner.config.identification_timeout();
    tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        if let Some(inner) = weak.upgrade() {
            inner.identification_expired(transport);
        }
    })
}

fn spawn_grace_timer(inner: &Arc<Inner>, key: FileKey, stale: TransportId) -> JoinHandle<()> {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    // Anchor the deadline now, not at the task's first poll, so the window
    // starts exactly when the transport is lost.
    let deadline = tokio::time::Instant::now() + inner.config.grace_period();
    tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;
        if let Some(inner) = weak.upgrade() {
            inner.grace_expired(&key, stale);
        }
    })
}

fn spawn_request_timeout(inner: &Arc<Inner>, id: String, timeout: Duration) -> JoinHandle<()> {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some(inner) = weak.upgrade() {
            inner.request_timed_out(&id, timeout);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::session::LogLevel;
    use serde_json::json;

    fn test_config() -> BrokerConfig {
        BrokerConfig {
            log_capacity: 3,
            document_change_capacity: 3,
            changed_ids_max: 5,
            selection_nodes_max: 5,
            log_message_max_chars: 20,
            log_args_max: 2,
            ..Default::default()
        }
    }

    fn test_broker() -> Broker {
        Broker::new(test_config())
    }

    fn attach(broker: &Broker) -> (TransportId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (broker.attach_transport(tx), rx)
    }

    fn identify(broker: &Broker, transport: TransportId, key: &str, name: &str) {
        broker.handle_frame(
            transport,
            &format!(r#"{{"type":"IDENTIFY","data":{{"name":"{name}","key":"{key}"}}}}"#),
        );
    }

    fn connect(broker: &Broker, key: &str) -> (TransportId, mpsc::UnboundedReceiver<String>) {
        let (transport, rx) = attach(broker);
        identify(broker, transport, key, "Untitled");
        (transport, rx)
    }

    fn log_frame(message: &str, ts: i64) -> String {
        format!(
            r#"{{"type":"LOG_CAPTURE","data":{{"level":"info","message":"{message}","args":[],"timestamp":{ts}}}}}"#
        )
    }

    fn selection_frame(ts: i64) -> String {
        format!(
            r#"{{"type":"SELECTION_CHANGE","data":{{"nodes":[{{"id":"1:2","name":"Hero","type":"FRAME"}}],"count":1,"page":"Page 1","timestamp":{ts}}}}}"#
        )
    }

    fn doc_change_frame(ts: i64) -> String {
        format!(
            r#"{{"type":"DOCUMENT_CHANGE","data":{{"hasStyleChanges":false,"hasNodeChanges":true,"changedIds":["1:1"],"changeCount":1,"timestamp":{ts}}}}}"#
        )
    }

    /// Read the next outbound command frame from a client's socket.
    fn next_command(rx: &mut mpsc::UnboundedReceiver<String>) -> serde_json::Value {
        let text = rx.try_recv().expect("expected an outbound command frame");
        serde_json::from_str(&text).unwrap()
    }

    /// Let spawned tasks run without advancing the paused clock.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    // ============================================
    // Identification & registry
    // ============================================

    #[tokio::test]
    async fn identify_promotes_pending_socket() {
        let broker = test_broker();
        let (_t, _rx) = connect(&broker, "abc123");

        assert!(broker.is_any_client_connected());
        let files = broker.connected_files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].key, FileKey::new("abc123"));
        assert!(files[0].is_active);
        assert_eq!(broker.active_file_key(), Some(FileKey::new("abc123")));
    }

    #[tokio::test(start_paused = true)]
    async fn unidentified_socket_is_closed_at_deadline() {
        let broker = test_broker();
        let (transport, mut rx) = attach(&broker);

        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;

        // Sender dropped: the socket's writer sees a closed channel.
        assert_eq!(rx.recv().await, None);
        assert!(!broker.is_any_client_connected());

        // A late identify from the discarded socket is ignored.
        identify(&broker, transport, "late", "Late");
        assert!(!broker.is_any_client_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn identification_deadline_is_cancelled_on_promotion() {
        let broker = test_broker();
        let (_t, _rx) = connect(&broker, "abc123");

        tokio::time::advance(Duration::from_secs(120)).await;
        settle().await;

        assert!(broker.is_any_client_connected());
    }

    #[tokio::test]
    async fn replacement_preserves_buffers_and_closes_stale_socket() {
        let broker = test_broker();
        let (t1, mut rx1) = connect(&broker, "abc123");
        broker.handle_frame(t1, &log_frame("first line", 100));

        // Host reloaded its connection before the old close event fired.
        let (t2, _rx2) = attach(&broker);
        identify(&broker, t2, "abc123", "Untitled");

        // Old socket closed, single client, buffers intact.
        assert_eq!(rx1.recv().await, None);
        assert_eq!(broker.connected_files().len(), 1);
        let logs = broker.logs(&LogQuery::default()).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "first line");
    }

    #[tokio::test(start_paused = true)]
    async fn late_close_of_replaced_transport_is_ignored() {
        let broker = test_broker();
        let (t1, _rx1) = connect(&broker, "abc123");
        let (t2, _rx2) = attach(&broker);
        identify(&broker, t2, "abc123", "Untitled");

        // The old socket's close event arrives after the rebind.
        broker.transport_closed(t1);
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;

        assert!(broker.is_any_client_connected());
        assert_eq!(broker.active_file_key(), Some(FileKey::new("abc123")));
    }

    #[tokio::test]
    async fn reidentifying_with_new_key_switches_files() {
        let broker = test_broker();
        let (t1, mut rx1) = connect(&broker, "old-file");

        let command = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .send_command("get_document_info", json!({}), None, None)
                    .await
            })
        };
        settle().await;
        let _ = next_command(&mut rx1);

        identify(&broker, t1, "new-file", "Renamed");

        let files = broker.connected_files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].key, FileKey::new("new-file"));
        assert_eq!(broker.active_file_key(), Some(FileKey::new("new-file")));

        // The old entry's outstanding request was batch-rejected.
        let result = command.await.unwrap();
        assert_eq!(
            result,
            Err(BrokerError::ClientDisconnected {
                key: FileKey::new("old-file")
            })
        );
    }

    // ============================================
    // Request correlation
    // ============================================

    #[tokio::test(start_paused = true)]
    async fn send_command_without_clients_rejects_immediately() {
        let broker = test_broker();
        let result = broker.send_command("get_selection", json!({}), None, None).await;
        assert_eq!(result, Err(BrokerError::NoActiveFile));
    }

    #[tokio::test]
    async fn send_command_to_unknown_target_rejects_immediately() {
        let broker = test_broker();
        let (_t, _rx) = connect(&broker, "abc123");
        let target = FileKey::new("nope");
        let result = broker
            .send_command("get_selection", json!({}), None, Some(&target))
            .await;
        assert_eq!(result, Err(BrokerError::NotConnected { key: target }));
    }

    #[tokio::test(start_paused = true)]
    async fn response_resolves_command_and_cancels_its_timer() {
        let broker = test_broker();
        let (t, mut rx) = connect(&broker, "abc123");

        let command = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker.send_command("getData", json!({}), None, None).await
            })
        };
        settle().await;

        let frame = next_command(&mut rx);
        assert_eq!(frame["method"], "getData");
        let id = frame["id"].as_str().unwrap().to_string();

        broker.handle_frame(t, &format!(r#"{{"id":"{id}","result":{{"count":5}}}}"#));
        let result = command.await.unwrap();
        assert_eq!(result, Ok(json!({"count": 5})));

        // Advancing past the timeout must not produce a duplicate rejection:
        // the request entry is gone and the timer task finds nothing.
        tokio::time::advance(Duration::from_secs(20)).await;
        settle().await;
        broker.handle_frame(t, &format!(r#"{{"id":"{id}","result":{{"count":9}}}}"#));
    }

    #[tokio::test]
    async fn remote_error_is_rejected_verbatim() {
        let broker = test_broker();
        let (t, mut rx) = connect(&broker, "abc123");

        let command = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker.send_command("export_node", json!({}), None, None).await
            })
        };
        settle().await;
        let id = next_command(&mut rx)["id"].as_str().unwrap().to_string();

        broker.handle_frame(t, &format!(r#"{{"id":"{id}","error":"node not found: 12:7"}}"#));
        let result = command.await.unwrap();
        assert_eq!(result, Err(BrokerError::Remote("node not found: 12:7".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn command_times_out_without_response() {
        let broker = test_broker();
        let (_t, mut rx) = connect(&broker, "abc123");

        let command = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .send_command("slow_op", json!({}), Some(Duration::from_secs(1)), None)
                    .await
            })
        };
        settle().await;
        let _ = next_command(&mut rx);

        tokio::time::advance(Duration::from_millis(1100)).await;
        settle().await;

        let result = command.await.unwrap();
        assert_eq!(
            result,
            Err(BrokerError::CommandTimeout {
                method: "slow_op".into(),
                elapsed_ms: 1000,
            })
        );
    }

    #[tokio::test]
    async fn unknown_response_id_is_a_silent_noop() {
        let broker = test_broker();
        let (t, _rx) = connect(&broker, "abc123");
        broker.handle_frame(t, r#"{"id":"99-123456","result":{}}"#);
        assert!(broker.is_any_client_connected());
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped() {
        let broker = test_broker();
        let (t, _rx) = connect(&broker, "abc123");
        broker.handle_frame(t, "not json at all");
        broker.handle_frame(t, r#"{"type":"BOGUS","data":{}}"#);
        assert!(broker.is_any_client_connected());
    }

    // ============================================
    // Event ingestion & buffers
    // ============================================

    #[tokio::test]
    async fn log_buffer_keeps_most_recent_at_capacity() {
        let broker = test_broker();
        let (t, _rx) = connect(&broker, "abc123");
        for (i, message) in ["L1", "L2", "L3", "L4", "L5"].iter().enumerate() {
            broker.handle_frame(t, &log_frame(message, i as i64));
        }
        let logs = broker.logs(&LogQuery::default()).unwrap();
        assert_eq!(
            logs.iter().map(|l| l.message.as_str()).collect::<Vec<_>>(),
            vec!["L3", "L4", "L5"]
        );
    }

    #[tokio::test]
    async fn log_capture_truncates_message_and_caps_args() {
        let broker = test_broker();
        let (t, _rx) = connect(&broker, "abc123");
        broker.handle_frame(
            t,
            r#"{"type":"LOG_CAPTURE","data":{"level":"error","message":"abcdefghijklmnopqrstuvwxyz","args":[1,2,3,4],"timestamp":5}}"#,
        );
        let logs = broker.logs(&LogQuery::default()).unwrap();
        assert_eq!(logs[0].message, "abcdefghijklmnopqrst");
        assert_eq!(logs[0].args, vec![json!(1), json!(2)]);
        assert_eq!(logs[0].level, LogLevel::Error);
        assert_eq!(logs[0].source, FileKey::new("abc123"));
    }

    #[tokio::test]
    async fn document_change_caps_sampled_ids_and_broadcasts() {
        let broker = test_broker();
        let mut events = broker.subscribe();
        let (t, _rx) = connect(&broker, "abc123");

        broker.handle_frame(
            t,
            r#"{"type":"DOCUMENT_CHANGE","data":{"hasStyleChanges":false,"hasNodeChanges":true,"changedIds":["a","b","c","d","e","f","g"],"changeCount":7,"timestamp":9}}"#,
        );

        let changes = broker.document_changes(&ChangeQuery::default()).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].changed_ids.len(), 5);
        assert_eq!(changes[0].change_count, 7);

        // First event is the connect, second the tagged document change.
        assert!(matches!(
            events.recv().await.unwrap(),
            BridgeEvent::ClientConnected { .. }
        ));
        match events.recv().await.unwrap() {
            BridgeEvent::DocumentChanged { key, change } => {
                assert_eq!(key, FileKey::new("abc123"));
                assert_eq!(change.change_count, 7);
            }
            other => panic!("expected document change event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn selection_replaces_slot_and_updates_page() {
        let broker = test_broker();
        let (t, _rx) = connect(&broker, "abc123");

        broker.handle_frame(t, &selection_frame(100));
        broker.handle_frame(t, &selection_frame(200));

        let selection = broker.selection(None).unwrap().unwrap();
        assert_eq!(selection.timestamp.as_millis(), 200);
        assert_eq!(selection.nodes.len(), 1);

        let info = broker.client_info(None).unwrap();
        assert_eq!(info.current_page.as_deref(), Some("Page 1"));
    }

    #[tokio::test]
    async fn selection_nodes_are_capped_while_count_keeps_full_size() {
        let broker = test_broker();
        let (t, _rx) = connect(&broker, "abc123");

        let nodes: Vec<String> = (0..7)
            .map(|i| format!(r#"{{"id":"1:{i}","name":"Node {i}","type":"FRAME"}}"#))
            .collect();
        broker.handle_frame(
            t,
            &format!(
                r#"{{"type":"SELECTION_CHANGE","data":{{"nodes":[{}],"count":7,"timestamp":1}}}}"#,
                nodes.join(",")
            ),
        );

        let selection = broker.selection(None).unwrap().unwrap();
        assert_eq!(selection.nodes.len(), 5);
        assert_eq!(selection.nodes[0].id, "1:0");
        assert_eq!(selection.nodes[4].id, "1:4");
        assert_eq!(selection.count, 7);
    }

    #[tokio::test]
    async fn clear_operations_return_removed_counts() {
        let broker = test_broker();
        let (t, _rx) = connect(&broker, "abc123");
        broker.handle_frame(t, &log_frame("a", 1));
        broker.handle_frame(t, &log_frame("b", 2));
        broker.handle_frame(t, &doc_change_frame(3));

        assert_eq!(broker.clear_logs(None).unwrap(), 2);
        assert_eq!(broker.clear_logs(None).unwrap(), 0);
        assert_eq!(broker.clear_document_changes(None).unwrap(), 1);
        assert!(broker.logs(&LogQuery::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn accessors_reject_without_active_file() {
        let broker = test_broker();
        assert_eq!(
            broker.logs(&LogQuery::default()),
            Err(BrokerError::NoActiveFile)
        );
        assert_eq!(broker.clear_logs(None), Err(BrokerError::NoActiveFile));
        assert_eq!(broker.selection(None), Err(BrokerError::NoActiveFile));
    }

    #[tokio::test]
    async fn accessors_accept_explicit_file_key() {
        let broker = test_broker();
        let (ta, _ra) = connect(&broker, "A");
        let (_tb, _rb) = connect(&broker, "B");
        broker.handle_frame(ta, &log_frame("from A", 1));

        // B never logged; A did. Active is A (first identified).
        let query = LogQuery {
            file: Some(FileKey::new("A")),
            ..Default::default()
        };
        assert_eq!(broker.logs(&query).unwrap().len(), 1);
        let query = LogQuery {
            file: Some(FileKey::new("B")),
            ..Default::default()
        };
        assert!(broker.logs(&query).unwrap().is_empty());
    }

    // ============================================
    // Active file election
    // ============================================

    #[tokio::test]
    async fn selection_event_elects_sender_active() {
        let broker = test_broker();
        let (_ta, _ra) = connect(&broker, "A");
        let (tb, _rb) = connect(&broker, "B");
        assert_eq!(broker.active_file_key(), Some(FileKey::new("A")));

        broker.handle_frame(tb, &selection_frame(50));

        let files = broker.connected_files();
        assert_eq!(
            files
                .iter()
                .map(|f| (f.key.as_str(), f.is_active))
                .collect::<Vec<_>>(),
            vec![("A", false), ("B", true)]
        );
    }

    #[tokio::test]
    async fn set_active_file_reroutes_unscoped_commands() {
        let broker = test_broker();
        let (_ta, mut ra) = connect(&broker, "A");
        let (tb, _rb) = connect(&broker, "B");
        broker.handle_frame(tb, &selection_frame(50));

        assert!(broker.set_active_file(&FileKey::new("A")));
        assert_eq!(broker.active_file_key(), Some(FileKey::new("A")));

        let _command = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker.send_command("get_page", json!({}), None, None).await
            })
        };
        settle().await;
        assert_eq!(next_command(&mut ra)["method"], "get_page");
    }

    #[tokio::test]
    async fn set_active_file_fails_for_closed_or_unknown_targets() {
        let broker = test_broker();
        let (tb, _rb) = connect(&broker, "B");
        broker.transport_closed(tb);

        // In grace: state retained but transport not open.
        assert!(!broker.set_active_file(&FileKey::new("B")));
        assert!(!broker.set_active_file(&FileKey::new("missing")));
    }

    #[tokio::test]
    async fn page_change_updates_page_and_elects() {
        let broker = test_broker();
        let (_ta, _ra) = connect(&broker, "A");
        let (tb, _rb) = connect(&broker, "B");

        broker.handle_frame(tb, r#"{"type":"PAGE_CHANGE","data":{"page":"Page 2"}}"#);

        assert_eq!(broker.active_file_key(), Some(FileKey::new("B")));
        let info = broker.client_info(None).unwrap();
        assert_eq!(info.current_page.as_deref(), Some("Page 2"));
    }

    // ============================================
    // Grace keeper
    // ============================================

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_purges_client_and_rejects_its_requests_only() {
        let broker = test_broker();
        let (ta, mut ra) = connect(&broker, "A");
        let (tb, mut rb) = connect(&broker, "B");

        let spawn_command = |target: &str| {
            let broker = broker.clone();
            let target = FileKey::new(target);
            tokio::spawn(async move {
                broker
                    .send_command("get_document_info", json!({}), None, Some(&target))
                    .await
            })
        };
        let a1 = spawn_command("A");
        let a2 = spawn_command("A");
        let b1 = spawn_command("B");
        settle().await;
        let _ = next_command(&mut ra);
        let _ = next_command(&mut ra);
        let b_id = next_command(&mut rb)["id"].as_str().unwrap().to_string();

        broker.transport_closed(ta);
        tokio::time::advance(Duration::from_millis(5100)).await;
        settle().await;

        let expected = Err(BrokerError::ClientDisconnected {
            key: FileKey::new("A"),
        });
        assert_eq!(a1.await.unwrap(), expected);
        assert_eq!(a2.await.unwrap(), expected);

        // B's request is untouched and still resolvable.
        broker.handle_frame(tb, &format!(r#"{{"id":"{b_id}","result":"ok"}}"#));
        assert_eq!(b1.await.unwrap(), Ok(json!("ok")));

        // A is gone; the election moved to B.
        assert_eq!(broker.connected_files().len(), 1);
        assert_eq!(broker.active_file_key(), Some(FileKey::new("B")));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_cancels_the_purge() {
        let broker = test_broker();
        let (t1, _r1) = connect(&broker, "abc123");
        broker.handle_frame(t1, &log_frame("kept", 1));

        broker.transport_closed(t1);
        tokio::time::advance(Duration::from_millis(2000)).await;
        settle().await;

        let (t2, _r2) = attach(&broker);
        identify(&broker, t2, "abc123", "Untitled");

        // The stale grace timer fires and must be a no-op.
        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;

        assert!(broker.is_any_client_connected());
        assert_eq!(broker.logs(&LogQuery::default()).unwrap().len(), 1);
        assert_eq!(broker.active_file_key(), Some(FileKey::new("abc123")));
    }

    #[tokio::test(start_paused = true)]
    async fn active_client_purge_leaves_no_active_file_when_alone() {
        let broker = test_broker();
        let (t, _rx) = connect(&broker, "abc123");
        broker.transport_closed(t);

        tokio::time::advance(Duration::from_millis(5100)).await;
        settle().await;

        assert_eq!(broker.active_file_key(), None);
        assert!(broker.connected_files().is_empty());
        let result = broker.send_command("x", json!({}), None, None).await;
        assert_eq!(result, Err(BrokerError::NoActiveFile));
    }

    // ============================================
    // Shutdown
    // ============================================

    #[tokio::test(start_paused = true)]
    async fn shutdown_rejects_outstanding_requests_and_clears_state() {
        let broker = test_broker();
        let (_t, mut rx) = connect(&broker, "abc123");

        let command = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker.send_command("getData", json!({}), None, None).await
            })
        };
        settle().await;
        let _ = next_command(&mut rx);

        broker.shutdown().await;

        assert_eq!(command.await.unwrap(), Err(BrokerError::ShutdownInProgress));
        assert!(!broker.is_any_client_connected());
        assert!(broker.connected_files().is_empty());
        assert_eq!(broker.active_file_key(), None);
        // Client socket closed.
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn commands_after_shutdown_are_rejected() {
        let broker = test_broker();
        let (_t, _rx) = connect(&broker, "abc123");
        broker.shutdown().await;
        let result = broker.send_command("x", json!({}), None, None).await;
        assert_eq!(result, Err(BrokerError::ShutdownInProgress));
    }

    #[tokio::test]
    async fn client_info_reports_connection_state() {
        let broker = test_broker();
        let (t, _rx) = connect(&broker, "abc123");

        let info = broker.client_info(None).unwrap();
        assert!(info.connected);
        assert_eq!(info.name, "Untitled");

        broker.transport_closed(t);
        let key = FileKey::new("abc123");
        let info = broker.client_info(Some(&key)).unwrap();
        assert!(!info.connected);
    }
}
