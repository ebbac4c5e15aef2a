//! cellog-core: machining-cell event log and material/queue state engine
//!
//! This crate is the single source of truth for a machine-tool cell: an
//! append-only log of manufacturing events plus the bookkeeping needed to
//! answer "what is material X's history" and "what is in queue Q right now".
//! Machine-specific adapters translate controller telemetry into `record_*`
//! calls; status and reporting layers read derived state back out.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                          cellog-core                           │
//! ├────────────────────────────────────────────────────────────────┤
//! │  engine       │ CellLog facade: lock, transaction, notify      │
//! │  store        │ event append + counter/time/material queries   │
//! │  material     │ identity registry, serials, per-process paths  │
//! │  queues       │ FIFO/positional queues, casting allocation     │
//! │  inspection   │ count/frequency/interval sampling decisions    │
//! │  tools        │ tool-pocket snapshot reconciliation            │
//! │  corrections  │ swap material on pallet, invalidate cycle      │
//! │  schema       │ SQLite tables and migrations                   │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything persists in one embedded SQLite file. All operations are
//! serialized by a single engine-wide lock; each mutating call is one
//! transaction, and observers are notified per committed entry after the
//! commit, outside the lock.
//!
//! # Example
//!
//! ```rust,ignore
//! use cellog_core::{CellLog, CellogConfig, EventMaterial};
//!
//! let log = CellLog::open("cell.db", CellogConfig::default())?;
//! let id = log.allocate_material_id("J-2024-17", "housing", 2)?;
//! log.record_load_start(&[EventMaterial::new(id, 1)], "3", 1, chrono::Utc::now())?;
//! ```

pub mod config;
pub mod corrections;
pub mod engine;
pub mod error;
pub mod inspection;
pub mod material;
pub mod queues;
pub mod schema;
pub mod store;
pub mod tools;
pub mod types;

pub use config::CellogConfig;
pub use corrections::SwapResult;
pub use engine::CellLog;
pub use error::{CellogError, Result};
pub use inspection::expand_inspection_counter;
pub use schema::{Schema, SCHEMA_VERSION};
pub use tools::diff_snapshots;
pub use types::{
    ActualPath, EventMaterial, InspectionDecision, LogEntry, LogMaterial, LogType,
    MaterialDetails, NextPieceStation, PathInspection, QueuedMaterial, StationKind, Stop,
    ToolSnapshot, ToolUse,
};
