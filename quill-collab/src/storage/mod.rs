//! Durable, ordered, append-only storage for update history.
//!
//! ```text
//! ┌──────────────┐   append/load    ┌──────────────────────────────┐
//! │ SyncProvider │ ───────────────► │ UpdateLog                    │
//! │              │                  │  ├── MemoryLog (tests, SSR)  │
//! │              │                  │  └── RocksLog  (durable)     │
//! └──────────────┘                  └──────────────────────────────┘
//! ```
//!
//! Records are scoped per `(document_id, file_path)` with strictly
//! increasing ids. Replaying everything from the latest snapshot record
//! onward reconstructs a state equivalent to replaying the entire log —
//! that is what makes snapshot-based compaction safe.

pub mod log;
pub mod rocks;

pub use log::{MemoryLog, PersistenceError, UpdateLog, UpdateRecord};
pub use rocks::{RocksLog, RocksLogConfig};
