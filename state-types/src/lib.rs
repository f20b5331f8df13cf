//! # state-types
//!
//! Shared types for the zstate differential synchronization core.
//!
//! This crate provides the vocabulary used across all zstate crates:
//! - [`DeviceId`], [`StateType`], [`Counter`], [`StateKey`], [`SyncKey`] - State addressing
//! - [`SyncItemRef`], [`ModToken`], [`ItemFlags`] - Items as seen by the diff engine
//! - [`DiffChange`], [`StateUpdate`], [`RemoteOp`] - Change records
//! - [`ErrorKind`] - Error classification

#![warn(missing_docs)]
#![warn(clippy::all)]

mod change;
mod error;
mod ids;
mod item;

pub use change::{ChangeKind, DiffChange, RemoteOp, StateUpdate};
pub use error::ErrorKind;
pub use ids::{Counter, DeviceId, StateKey, StateType, SyncKey, SyncKeyError};
pub use item::{ItemFlags, ModToken, SyncItemRef};
