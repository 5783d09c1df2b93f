//! Options controlling a reconciliation run.

use watchsync_model::Field;

/// Run-level tunables for the mapper.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Only update existing records' metadata; never create.
    pub import_metadata_only: bool,
    /// Disable the `after` time gate entirely.
    pub ignore_date: bool,
    /// Count everything, write nothing.
    pub dry_run: bool,
    /// Verbose per-decision logging.
    pub debug_trace: bool,
    /// In the time-gated path, still refresh metadata when it changed.
    pub always_update_meta: bool,
    /// Suppress the `close()` auto-commit.
    pub disable_autocommit: bool,
}

/// Per-call context for [`Mapper::add`](crate::mapper::Mapper::add).
#[derive(Debug, Clone, Default)]
pub struct AddContext {
    /// Timestamp of the last successful sync with the reporting backend.
    /// Observations at or before this point take the time-gated path.
    pub after: Option<i64>,
    /// Treat this one observation as metadata-only.
    pub metadata_only: bool,
    /// Override the field set compared during the general merge.
    pub diff_keys: Option<Vec<Field>>,
}

impl AddContext {
    pub fn after(after: i64) -> Self {
        Self {
            after: Some(after),
            ..Default::default()
        }
    }
}
