//! # zstate-store
//!
//! Persistence and interprocess coordination for zstate.
//!
//! This crate provides:
//! - A versioned State Store keyed by device, state type, sub-key and counter
//! - User/device authorization bookkeeping
//! - IPC providers offering named mutexes and shared data slots
//! - The [`InterProcessData`] façade used by subsystems
//! - The folder sync cycle tying store, engine and mutex together
//!
//! ## Architecture
//!
//! ```text
//!  request ──► FolderSync ──► InterProcessData ──► IpcProvider (sqlite | memory)
//!                  │
//!                  ├──► DiffState (zstate-core)
//!                  │
//!                  └──► StateStore ──► SQLite (states, users, settings)
//! ```
//!
//! ## Failure model
//!
//! Store lookups fail with [`StoreError`]; IPC calls never fail, they return
//! `false` / `None` and callers fall back.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cleanup;
pub mod config;
pub mod error;
pub mod interprocess;
pub mod ipc;
pub mod logging;
pub mod session;
pub mod storage;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{IpcError, StoreError, SyncCycleError, ZstateError};
pub use interprocess::{InterProcessData, IpcMutexGuard};
pub use ipc::{IpcProvider, IpcType, MutexToken, ProviderKind};
pub use session::{FolderSync, SyncOutcome};
pub use storage::{SqliteStateStore, StateStore, StateStoreExt};
