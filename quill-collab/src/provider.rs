//! Sync provider: wires the document store, the update log and the
//! broadcast channel together.
//!
//! ```text
//!                 ┌─────────────────┐
//!   local edits ─►│ DocumentStore   │◄─ remote updates (origin tagged)
//!                 └───────┬─────────┘
//!                         │ captured deltas
//!                         ▼
//!                 ┌─────────────────┐   debounced flush
//!                 │ pending buffer  │ ─────────┬──────────────┐
//!                 └─────────────────┘          ▼              ▼
//!                                       ChannelSender     UpdateLog
//!                                       (broadcast)       (durable)
//! ```
//!
//! Lifecycle: `Connecting → Bootstrapping → Subscribing → Connected →
//! Destroyed`. Bootstrap replays the persisted history in one batched
//! transaction; a log read failure fails the join — an unreadable log is
//! not an empty document.
//!
//! A burst of keystroke-level edits inside one debounce window is merged
//! into a single combined update; the broadcast and the durable append
//! share the exact same text encoding, so live peers and later
//! bootstrappers replay byte-identical history.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::awareness::{
    self, AwarenessChange, AwarenessState, AwarenessSubscription, AwarenessTracker, CursorRange,
    UserInfo,
};
use crate::codec::{self, CodecError};
use crate::document::{DocumentError, DocumentStore, UpdateOrigin};
use crate::protocol::ChannelMessage;
use crate::storage::{PersistenceError, UpdateLog};
use crate::transport::{
    channel_name, ChannelBus, ChannelEvent, ChannelReceiver, ChannelSender, TransportError,
};

/// Debounce window for coalescing local edits before flush.
///
/// Fixed trade-off between edit-to-broadcast latency and message volume;
/// not adaptive.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// Default file path inside a document.
pub const DEFAULT_FILE_PATH: &str = "main.tex";

/// Provider lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    Connecting,
    Bootstrapping,
    Subscribing,
    Connected,
    Destroyed,
}

/// Provider construction options.
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    pub document_id: String,
    pub file_path: String,
    pub user_id: String,
    pub user_name: String,
    /// Display color; derived from the peer id when absent.
    pub user_color: Option<String>,
    pub debounce: Duration,
}

impl ProviderOptions {
    pub fn new(
        document_id: impl Into<String>,
        user_id: impl Into<String>,
        user_name: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            file_path: DEFAULT_FILE_PATH.to_string(),
            user_id: user_id.into(),
            user_name: user_name.into(),
            user_color: None,
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    pub fn with_file_path(mut self, file_path: impl Into<String>) -> Self {
        self.file_path = file_path.into();
        self
    }

    pub fn with_user_color(mut self, color: impl Into<String>) -> Self {
        self.user_color = Some(color.into());
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}

/// Provider errors.
#[derive(Debug)]
pub enum ProviderError {
    /// The persisted history could not be read — cannot join the document.
    Bootstrap(PersistenceError),
    Persistence(PersistenceError),
    Transport(TransportError),
    Document(DocumentError),
    Codec(CodecError),
    /// The provider was already destroyed.
    Destroyed,
    Internal(String),
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bootstrap(e) => write!(f, "Cannot join document: {e}"),
            Self::Persistence(e) => write!(f, "Persistence error: {e}"),
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::Document(e) => write!(f, "Document error: {e}"),
            Self::Codec(e) => write!(f, "Codec error: {e}"),
            Self::Destroyed => write!(f, "Provider destroyed"),
            Self::Internal(e) => write!(f, "Internal error: {e}"),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<PersistenceError> for ProviderError {
    fn from(e: PersistenceError) -> Self {
        Self::Persistence(e)
    }
}

impl From<TransportError> for ProviderError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<DocumentError> for ProviderError {
    fn from(e: DocumentError) -> Self {
        Self::Document(e)
    }
}

impl From<CodecError> for ProviderError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

/// State shared with the flush worker and the event pump.
struct ProviderShared {
    document: Arc<DocumentStore>,
    log: Arc<dyn UpdateLog>,
    sender: ChannelSender,
    awareness: Arc<AwarenessTracker>,
    peer_id: Uuid,
    document_id: String,
    file_path: String,
    state: RwLock<ProviderState>,
    pending: Arc<StdMutex<Vec<Vec<u8>>>>,
    shutdown: Notify,
    destroyed: AtomicBool,
}

/// The sync provider.
///
/// Owns exactly one channel subscription per `(document, file)` scope; the
/// document store is exclusively owned by this provider instance.
pub struct SyncProvider {
    shared: Arc<ProviderShared>,
    doc_subscription: StdMutex<Option<yrs::Subscription>>,
    flush_worker: StdMutex<Option<JoinHandle<()>>>,
    event_pump: StdMutex<Option<JoinHandle<()>>>,
}

impl SyncProvider {
    /// Join a document: bootstrap persisted history, subscribe to the
    /// broadcast channel, and start syncing.
    pub async fn connect(
        document: Arc<DocumentStore>,
        log: Arc<dyn UpdateLog>,
        bus: Arc<ChannelBus>,
        options: ProviderOptions,
    ) -> Result<Self, ProviderError> {
        let peer_id = Uuid::new_v4();
        let color = options
            .user_color
            .clone()
            .unwrap_or_else(|| awareness::color_for(peer_id));
        let user = UserInfo {
            id: options.user_id.clone(),
            name: options.user_name.clone(),
            color,
        };
        let awareness = Arc::new(AwarenessTracker::new(peer_id, user));
        let state = RwLock::new(ProviderState::Connecting);

        // Capture local deltas from the very start; bootstrap replays with
        // remote origin, so history never lands in this buffer.
        let pending: Arc<StdMutex<Vec<Vec<u8>>>> = Arc::new(StdMutex::new(Vec::new()));
        let (dirty_tx, dirty_rx) = mpsc::unbounded_channel::<()>();
        let buffer = pending.clone();
        let doc_subscription = document.observe_local_updates(move |update| {
            if let Ok(mut buffer) = buffer.lock() {
                buffer.push(update.to_vec());
            }
            let _ = dirty_tx.send(());
        })?;

        // Bootstrapping: replay the log in one batched transaction.
        *state.write().await = ProviderState::Bootstrapping;
        let records = log
            .load_since(&options.document_id, &options.file_path)
            .await
            .map_err(ProviderError::Bootstrap)?;
        if !records.is_empty() {
            let mut updates = Vec::with_capacity(records.len());
            for record in &records {
                updates.push(codec::decode(&record.update)?);
            }
            document.apply_history(&updates)?;
            log::debug!(
                "bootstrapped {} persisted updates for {}:{}",
                records.len(),
                options.document_id,
                options.file_path
            );
        }

        // Subscribing: open the channel and announce presence.
        *state.write().await = ProviderState::Subscribing;
        let channel = bus
            .subscribe(&channel_name(&options.document_id, &options.file_path), peer_id)
            .await;
        let (sender, events) = channel.split();
        sender.track()?;

        let shared = Arc::new(ProviderShared {
            document,
            log,
            sender,
            awareness,
            peer_id,
            document_id: options.document_id,
            file_path: options.file_path,
            state,
            pending,
            shutdown: Notify::new(),
            destroyed: AtomicBool::new(false),
        });

        let flush_worker = tokio::spawn(run_flush_worker(
            shared.clone(),
            dirty_rx,
            options.debounce,
        ));
        let event_pump = tokio::spawn(run_event_pump(shared.clone(), events));

        Ok(Self {
            shared,
            doc_subscription: StdMutex::new(Some(doc_subscription)),
            flush_worker: StdMutex::new(Some(flush_worker)),
            event_pump: StdMutex::new(Some(event_pump)),
        })
    }

    /// This replica's peer id (unique per provider instance).
    pub fn peer_id(&self) -> Uuid {
        self.shared.peer_id
    }

    pub async fn state(&self) -> ProviderState {
        *self.shared.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ProviderState::Connected
    }

    /// Merge a cursor change into the local awareness entry and broadcast
    /// it immediately — cursor responsiveness beats bandwidth here, so
    /// there is no debounce on this path.
    pub fn set_awareness(&self, cursor: Option<CursorRange>) -> Result<(), ProviderError> {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return Err(ProviderError::Destroyed);
        }
        let state = self.shared.awareness.set_local_cursor(cursor);
        let message = ChannelMessage::Awareness {
            sender: self.shared.peer_id,
            state,
        };
        self.shared.sender.send(&message)?;
        Ok(())
    }

    /// Current awareness entries, keyed by peer id (local peer included).
    pub fn awareness(&self) -> HashMap<Uuid, AwarenessState> {
        self.shared.awareness.snapshot()
    }

    /// Register an awareness observer; the handle unsubscribes on drop.
    pub fn on_awareness_update<F>(&self, callback: F) -> AwarenessSubscription
    where
        F: Fn(&AwarenessChange) + Send + Sync + 'static,
    {
        self.shared.awareness.observe(callback)
    }

    /// Write a full-state snapshot record and compact the log prefix.
    ///
    /// Safe at any time: replaying from the snapshot is equivalent to
    /// replaying the whole history.
    pub async fn snapshot(&self) -> Result<u64, ProviderError> {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return Err(ProviderError::Destroyed);
        }
        let encoded = codec::encode(&self.shared.document.encode_state());
        let id = self
            .shared
            .log
            .append(
                &self.shared.document_id,
                &self.shared.file_path,
                &encoded,
                true,
            )
            .await?;
        let removed = self
            .shared
            .log
            .compact(&self.shared.document_id, &self.shared.file_path)
            .await?;
        log::info!(
            "snapshot record {id} written for {}:{}, {removed} records compacted",
            self.shared.document_id,
            self.shared.file_path
        );
        Ok(id)
    }

    /// Tear down the provider.
    ///
    /// Pending updates are flushed before teardown completes — closing an
    /// editor must never drop typed content. Idempotent: a second call is
    /// a no-op and nothing double-sends.
    pub async fn destroy(&self) -> Result<(), ProviderError> {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Stop capturing local updates.
        if let Ok(mut subscription) = self.doc_subscription.lock() {
            subscription.take();
        }

        // Stop the debounce worker, waiting out any in-flight flush.
        self.shared.shutdown.notify_one();
        let worker = self
            .flush_worker
            .lock()
            .map(|mut handle| handle.take())
            .unwrap_or(None);
        if let Some(handle) = worker {
            let _ = handle.await;
        }

        // Final flush of anything still buffered.
        let flush_result = flush_pending(&self.shared).await;

        // Leave the channel (emits PeerLeft) and stop the event pump.
        self.shared.sender.leave();
        let pump = self
            .event_pump
            .lock()
            .map(|mut handle| handle.take())
            .unwrap_or(None);
        if let Some(handle) = pump {
            handle.abort();
            // Wait for the task to actually drop its shared references.
            let _ = handle.await;
        }

        *self.shared.state.write().await = ProviderState::Destroyed;
        flush_result
    }
}

/// Debounce worker: waits for a quiet window after a burst of local edits,
/// then flushes the buffer as one combined update.
async fn run_flush_worker(
    shared: Arc<ProviderShared>,
    mut dirty: mpsc::UnboundedReceiver<()>,
    debounce: Duration,
) {
    loop {
        tokio::select! {
            _ = shared.shutdown.notified() => return,
            nudge = dirty.recv() => {
                if nudge.is_none() {
                    return;
                }
            }
        }

        // Keep extending the quiet window while edits keep arriving.
        loop {
            tokio::select! {
                // destroy() drains the remainder itself.
                _ = shared.shutdown.notified() => return,
                _ = tokio::time::sleep(debounce) => break,
                more = dirty.recv() => {
                    if more.is_none() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = flush_pending(&shared).await {
            log::error!(
                "flush failed for {}:{}: {e}",
                shared.document_id,
                shared.file_path
            );
        }
    }
}

/// Merge the pending buffer into one combined update, broadcast it, and
/// append it durably — both paths carry the same text encoding.
async fn flush_pending(shared: &ProviderShared) -> Result<(), ProviderError> {
    let pending: Vec<Vec<u8>> = {
        let mut buffer = shared
            .pending
            .lock()
            .map_err(|_| ProviderError::Internal("pending buffer poisoned".into()))?;
        std::mem::take(&mut *buffer)
    };
    if pending.is_empty() {
        return Ok(());
    }

    let merged = DocumentStore::merge_updates(&pending)?;
    let encoded = codec::encode(&merged);

    let message = ChannelMessage::Update {
        sender: shared.peer_id,
        update: encoded.clone(),
    };
    if let Err(e) = shared.sender.send(&message) {
        // Non-fatal: already-applied local state survives, and peers
        // catch up from the log once connectivity resumes.
        log::warn!("broadcast failed, continuing offline: {e}");
    }

    let mut result = shared
        .log
        .append(&shared.document_id, &shared.file_path, &encoded, false)
        .await;
    if result.is_err() {
        // Re-appending identical bytes is safe: the merge is idempotent
        // even if the first attempt partially landed.
        log::warn!("log append failed, retrying with identical bytes");
        result = shared
            .log
            .append(&shared.document_id, &shared.file_path, &encoded, false)
            .await;
    }

    match result {
        Ok(id) => {
            log::debug!(
                "flushed {} buffered updates as record {id} for {}:{}",
                pending.len(),
                shared.document_id,
                shared.file_path
            );
            Ok(())
        }
        Err(e) => {
            // Keep the combined update queued so a later flush retries it.
            if let Ok(mut buffer) = shared.pending.lock() {
                buffer.insert(0, merged);
            }
            log::error!(
                "local edits for {}:{} are not durably saved yet: {e}",
                shared.document_id,
                shared.file_path
            );
            Err(ProviderError::Persistence(e))
        }
    }
}

/// Event pump: applies remote updates, tracks awareness, and drives the
/// `Connected` transition.
async fn run_event_pump(shared: Arc<ProviderShared>, mut events: ChannelReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Message(bytes) => handle_message(&shared, &bytes),
            ChannelEvent::MembershipSynced => {
                *shared.state.write().await = ProviderState::Connected;
                // Announce ourselves exactly once per connection — not
                // once per peer.
                broadcast_awareness(&shared);
            }
            ChannelEvent::PeerJoined { peer_id } => {
                log::debug!(
                    "peer {peer_id} joined {}:{}",
                    shared.document_id,
                    shared.file_path
                );
            }
            ChannelEvent::PeerLeft { peer_id } => {
                if shared.awareness.remove(peer_id) {
                    log::debug!(
                        "peer {peer_id} left {}:{}, awareness entry evicted",
                        shared.document_id,
                        shared.file_path
                    );
                }
            }
        }
    }

    if !shared.destroyed.load(Ordering::SeqCst) {
        // Transport gone: local editing continues, reconnection is the
        // embedding application's call.
        log::warn!(
            "broadcast channel closed for {}:{}; working offline",
            shared.document_id,
            shared.file_path
        );
        *shared.state.write().await = ProviderState::Connecting;
    }
}

fn handle_message(shared: &ProviderShared, bytes: &[u8]) {
    let message = match ChannelMessage::decode(bytes) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("rejected malformed channel message: {e}");
            return;
        }
    };
    // Self-suppression by sender id: correct even on transports that also
    // guarantee no self-delivery.
    if message.sender() == shared.peer_id {
        return;
    }
    match message {
        ChannelMessage::Update { sender, update } => {
            let raw = match codec::decode(&update) {
                Ok(raw) => raw,
                Err(e) => {
                    log::warn!("rejected undecodable update from {sender}: {e}");
                    return;
                }
            };
            if let Err(e) = shared.document.apply_update(&raw, UpdateOrigin::Remote) {
                // A corrupted update is a bug upstream; surface it loudly
                // but never crash the editor.
                log::error!("remote update from {sender} failed to apply: {e}");
            }
        }
        ChannelMessage::Awareness { sender, state } => {
            shared.awareness.apply_remote(sender, state);
        }
    }
}

fn broadcast_awareness(shared: &ProviderShared) {
    let message = ChannelMessage::Awareness {
        sender: shared.peer_id,
        state: shared.awareness.local_state(),
    };
    if let Err(e) = shared.sender.send(&message) {
        log::warn!("awareness broadcast failed: {e}");
    }
}
