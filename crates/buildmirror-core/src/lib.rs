//! buildmirror-core library.
//!
//! Mirrors a CI server's build history into compacted local stores:
//! [`sync::SyncOrchestrator`] pages the server through a
//! [`remote::RemoteCiClient`], [`store::Stores`] keep references, full
//! builds and validity judgments, and a [`scheduler::Scheduler`] runs the
//! background refreshes.
//!
//! # Conventions
//!
//! - **Errors**: `thiserror` enums in [`error`]; `anyhow::Result` at the
//!   edges (config loading, database opening).
//! - **Logging**: `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod compactor;
pub mod config;
pub mod db;
pub mod error;
pub mod key;
pub mod kv;
pub mod model;
pub mod remote;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod timing;

pub use error::{ErrorCode, RemoteError, StoreError, SyncError};
pub use key::{CompositeKey, ServerMask};
