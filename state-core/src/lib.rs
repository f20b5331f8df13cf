//! # state-core
//!
//! Pure logic for zstate (no I/O, instant tests).
//!
//! This crate implements the differential state engine that compares a
//! folder's last-known item list with a fresh one, without touching a
//! database or a lock backend.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//!
//! Loading and persisting the state, and serializing concurrent sessions, is
//! done by `zstate-store`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conflict;
pub mod content;
pub mod diff;

pub use conflict::{classify, ItemStat};
pub use content::{ContentParameters, FilterType};
pub use diff::{DiffError, DiffPhase, DiffState};
