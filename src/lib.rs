//! Biotrack: a laboratory sample-tracking engine.
//!
//! The crate persists biosamples, their storage locations and their study
//! context in validated all-or-nothing batches. The main entry point is
//! [`Tracker`], which wires together:
//!
//! - [`SequenceAllocator`]: collision-free human-readable identifiers,
//! - [`LocationGrid`]: hierarchical storage with grid slots,
//! - [`ConcurrencyGuard`]: optimistic last-modified checks,
//! - [`SampleGraph`]: the biosample save pipeline,
//! - [`Cache`]: TTL caches with a background sweeper.
//!
//! Storage goes through the [`store::Backend`] trait, with in-memory and
//! SQLite implementations.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod allocator;
pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod expr;
pub mod graph;
pub mod grid;
pub mod guard;
pub mod model;
pub mod rights;
pub mod store;
pub mod telemetry;
pub mod types;

pub use allocator::{PatternContext, SequenceAllocator};
pub use cache::{Cache, CacheSweeper, PoolKey};
pub use config::EngineConfig;
pub use engine::{Tracker, TrackerBuilder};
pub use error::{Result, TrackError, ValidationKind};
pub use graph::{PersistReport, SampleGraph};
pub use grid::{LocationGrid, LocationReport};
pub use guard::ConcurrencyGuard;
pub use store::{Backend, MemoryBackend, SqliteBackend, Transaction};
pub use types::User;
