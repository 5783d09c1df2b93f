//! The reconciliation engine.
//!
//! Consumes `State` observations tagged with their origin backend,
//! resolves identity through an in-memory pointer index, classifies each
//! observation (add, update, metadata-only, ignore, conflict), and commits
//! the accumulated change set transactionally. The export planner walks
//! canonical records the other way, producing the queued requests that
//! converge a backend's view.

pub mod counters;
pub mod export;
pub mod index;
pub mod mapper;
pub mod options;
pub mod progress;

pub use counters::{Counters, Outcome};
pub use export::{plan_export, ExportOptions, ExportProgress, ExportStats};
pub use index::PointerIndex;
pub use mapper::{AddOutcome, Mapper, MapperError};
pub use options::{AddContext, Options};
pub use progress::SyncProgress;
