//! # kiln-engine
//!
//! The KilnDB engine: bulk loading and online index building over
//! MVCC tables.
//!
//! This crate ties the storage, transaction, and recovery layers
//! together behind one facade:
//!
//! - **Engine**: Owns the table directory, the transaction manager,
//!   the recovery log, and the checkpoint machinery. Raw puts and
//!   deletes, single-table or fanned out through a row generator, go
//!   through it.
//!
//! - **Bulk Loader**: Streams sorted rows into freshly redirected
//!   destination tables inside a transaction. Any failure converges
//!   on valid empty destinations.
//!
//! - **Hot Indexer**: Populates destination tables from a source that
//!   stays open for writes, replaying each row's version chain and
//!   adopting provisional versions into their owners. A shared scan
//!   position keeps the build and concurrent writers from delivering
//!   the same version twice.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                          Engine                            │
//! │                                                            │
//! │   put / put_multiple          Loader          Indexer      │
//! │        │                        │                │         │
//! │        ▼                        ▼                ▼         │
//! │  ┌───────────┐          ┌─────────────┐  ┌──────────────┐  │
//! │  │ row locks │          │  RunWriter  │  │ scan + replay│  │
//! │  │ + fan-out │          │  pipelines  │  │ + adoption   │  │
//! │  └───────────┘          └─────────────┘  └──────────────┘  │
//! │        │                        │                │         │
//! │        ▼                        ▼                ▼         │
//! │   TableStore / TableDirectory / TransactionManager         │
//! │              RecoveryLog + CheckpointManager               │
//! └────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// The engine facade.
///
/// This module provides:
/// - [`engine::Engine`]: Shared services and the raw write paths
pub mod engine;

/// Row generation for fanned-out writes.
///
/// This module provides:
/// - [`generator::RowGenerator`]: Derives destination rows from source rows
/// - [`generator::IdentityGenerator`]: Copies rows through unchanged
pub mod generator;

/// Online index building.
///
/// This module provides:
/// - [`indexer::Indexer`]: Builds destinations from a live source
/// - [`indexer::IndexerOptions`]: Poll interval control
pub mod indexer;

/// Bulk loading.
///
/// This module provides:
/// - [`loader::Loader`]: Sorted bulk ingest into fresh destinations
/// - [`loader::LoaderOptions`]: Put, emptiness, and locking behavior
pub mod loader;

/// Build counters and gauges.
///
/// This module provides:
/// - [`metrics::BuildMetrics`]: Loader and indexer counters
pub mod metrics;

mod estimate;
mod replay;

// Re-export commonly used types

pub use engine::Engine;
pub use generator::{IdentityGenerator, RowGenerator};
pub use indexer::{Indexer, IndexerOptions};
pub use loader::{ErrorCallback, Loader, LoaderOptions, PollCallback};
pub use metrics::BuildMetrics;
