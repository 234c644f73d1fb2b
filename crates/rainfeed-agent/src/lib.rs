//! # Rainfeed Agent
//!
//! Consumer daemon that folds gauge snapshots into per-section records.
//!
//! ## Architecture
//!
//! The agent runs one task per concern:
//! 1. **Subscription**: receives snapshots from the bus and drops corrupt ones
//! 2. **Routing**: fans each snapshot out to the writers registered for its URLs
//! 3. **Writers**: one per section; resolve identity, merge readings, store on change
//! 4. **Supervisor**: starts the above, stops everything on the first fatal error

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalogue;
pub mod config;
pub mod identity;
pub mod persistence;
pub mod router;
pub mod runtime;
pub mod writer;

pub use catalogue::{load_catalogue, parse_catalogue, CatalogueError};
pub use config::AgentConfig;
pub use identity::IdentityIndex;
pub use persistence::{MemoryStore, PersistenceError, RecordStore, SqliteStore};
pub use router::{Delivery, DeliveryError, Listener, ListenerId, Receipt, SnapshotRouter};
pub use runtime::{snapshot_handler, Agent};
pub use writer::{RecordWriter, WriteOutcome, WriterConfig, WriterError, WriterState, WriterStatus};
