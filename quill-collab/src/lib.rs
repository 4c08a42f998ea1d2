//! # quill-collab — Real-time document synchronization engine
//!
//! Conflict-free multiplayer editing for text documents: every replica
//! applies concurrent edits in whatever order they arrive and converges to
//! the same state, with durable history and live cursor presence.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   captured deltas    ┌──────────────┐
//! │ DocumentStore│ ───────────────────► │ SyncProvider │
//! │ (yrs CRDT)   │ ◄─────────────────── │ (orchestrator)│
//! └──────────────┘   remote updates     └──────┬───────┘
//!                                              │ debounced flush
//!                              ┌───────────────┼───────────────┐
//!                              ▼               ▼               ▼
//!                       ┌────────────┐  ┌────────────┐  ┌────────────┐
//!                       │ ChannelBus │  │ UpdateLog  │  │ Awareness  │
//!                       │ (pub/sub)  │  │ (append-   │  │ Tracker    │
//!                       │            │  │  only)     │  │ (cursors)  │
//!                       └────────────┘  └────────────┘  └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`codec`] — base64 text encoding for binary update fragments
//! - [`protocol`] — tagged wire envelope (bincode-encoded ChannelMessage)
//! - [`document`] — CRDT document store wrapping [`yrs::Doc`]
//! - [`storage`] — append-only update log (in-memory and RocksDB)
//! - [`transport`] — room-based broadcast bus with membership events
//! - [`awareness`] — ephemeral per-peer cursor/presence state
//! - [`provider`] — the sync provider orchestrating all of the above
//!
//! ## Guarantees
//!
//! - Merge is commutative and idempotent: replicas converge regardless of
//!   arrival order or duplication.
//! - A local edit is broadcast and persisted exactly once per debounce
//!   window; remote-origin changes are never re-broadcast.
//! - Replaying the log from the latest snapshot is equivalent to replaying
//!   the entire history, so compaction never loses state.
//! - Destroying a provider flushes pending edits before teardown.

pub mod awareness;
pub mod codec;
pub mod document;
pub mod protocol;
pub mod provider;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use awareness::{
    AwarenessChange, AwarenessState, AwarenessSubscription, AwarenessTracker, CursorRange,
    UserInfo,
};
pub use codec::CodecError;
pub use document::{DocumentError, DocumentStore, UpdateOrigin};
pub use protocol::ChannelMessage;
pub use provider::{
    ProviderError, ProviderOptions, ProviderState, SyncProvider, DEFAULT_DEBOUNCE,
    DEFAULT_FILE_PATH,
};
pub use storage::{
    MemoryLog, PersistenceError, RocksLog, RocksLogConfig, UpdateLog, UpdateRecord,
};
pub use transport::{
    channel_name, ChannelBus, ChannelEvent, ChannelReceiver, ChannelSender, DocChannel,
    TransportError,
};
