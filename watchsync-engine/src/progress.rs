//! Progress reporting for reconciliation runs.

/// Progress callback events emitted by the mapper.
///
/// Loading and committing are distinct phases with different shapes: the
/// load streams stored rows into the working set, the commit writes the
/// accumulated change set back out. Callers that don't care pass
/// `&|_| {}`; the export planner reports through its own
/// [`ExportProgress`](crate::export::ExportProgress) the same way.
#[derive(Debug, Clone)]
pub enum SyncProgress {
    /// A stored record is entering the working set.
    Loading {
        current: usize,
        total: usize,
        title: String,
    },
    /// The load finished; duplicates were skipped, so `loaded` may be
    /// less than the total reported while loading.
    Loaded { loaded: usize },
    /// The change set is about to be written.
    Committing { pending: usize },
    /// The commit finished (or was counted under dry run).
    Committed { written: u64, failed: u64 },
}
