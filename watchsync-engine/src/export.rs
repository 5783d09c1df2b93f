//! Export planning: converge one backend's view to canonical state.
//!
//! For each canonical record the planner fetches the backend's current
//! view (concurrently, results handled serially), suppresses anything
//! already in sync or newer on the backend side, and enqueues the single
//! play-state request that closes the gap. Never retries: a failure is
//! logged and counted, and the next export run produces the request again
//! if the backend still diverges.

use futures::stream::{self, StreamExt};
use watchsync_backend::{BackendClient, BackendError, RequestQueue};
use watchsync_model::State;

/// Outstanding item fetches against one backend.
const EXPORT_CONCURRENCY: usize = 8;

/// Seconds of backend-newer drift tolerated before an export is
/// suppressed.
pub const DEFAULT_ALLOWED_TIME_DIFF: i64 = 10;

/// Options for an export run.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Only export records changed after this point (unix seconds).
    pub after: Option<i64>,
    /// Disable the `after` gate.
    pub ignore_date: bool,
    /// Log planned actions without enqueueing them.
    pub dry_run: bool,
    /// Drift tolerance in seconds.
    pub allowed_time_diff: i64,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            after: None,
            ignore_date: false,
            dry_run: false,
            allowed_time_diff: DEFAULT_ALLOWED_TIME_DIFF,
        }
    }
}

/// Progress callback events for an export run.
#[derive(Debug, Clone)]
pub enum ExportProgress {
    Planning { total: usize },
    Queued { title: String, watched: bool },
    Skipped { title: String, reason: String },
    Done,
}

/// Statistics from a single export run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExportStats {
    pub processed: u64,
    pub queued: u64,
    /// Backend already agrees with the canonical state.
    pub identical: u64,
    /// The backend never reported this title, so there is no id to act on.
    pub missing_local_id: u64,
    /// The backend no longer has the item.
    pub not_found: u64,
    pub errors: u64,
    /// The backend's state is newer than ours plus the drift tolerance.
    pub backend_newer: u64,
    /// The backend view carries no usable date to compare against.
    pub missing_date: u64,
    /// Unchanged since the last export point.
    pub unchanged_since: u64,
}

/// Plan the idempotent action list that converges `client`'s backend to
/// the canonical state of `entities`, enqueueing each action.
pub async fn plan_export<C, Q>(
    client: &C,
    queue: &Q,
    entities: &[State],
    options: &ExportOptions,
    progress: &dyn Fn(ExportProgress),
) -> ExportStats
where
    C: BackendClient,
    Q: RequestQueue,
{
    let mut stats = ExportStats::default();
    let backend = client.backend_id();

    // Gate and resolve backend item ids up front; only survivors cost an
    // HTTP round trip.
    let mut work: Vec<(&State, String)> = Vec::new();
    for entity in entities {
        stats.processed += 1;

        if let Some(after) = options.after {
            if !options.ignore_date && after > entity.updated {
                stats.unchanged_since += 1;
                progress(ExportProgress::Skipped {
                    title: entity.title.clone(),
                    reason: "not changed since last export".to_string(),
                });
                continue;
            }
        }

        match entity.metadata.get(backend).and_then(|meta| meta.id.clone()) {
            Some(item_id) => work.push((entity, item_id)),
            None => {
                log::warn!("'{}' has no {backend} item id, skipping", entity.title);
                stats.missing_local_id += 1;
                progress(ExportProgress::Skipped {
                    title: entity.title.clone(),
                    reason: format!("no {backend} item id"),
                });
            }
        }
    }

    progress(ExportProgress::Planning { total: work.len() });

    let mut views = stream::iter(work.into_iter().map(|(entity, item_id)| async move {
        let view = client.get_item(&item_id).await;
        (entity, item_id, view)
    }))
    .buffer_unordered(EXPORT_CONCURRENCY);

    while let Some((entity, item_id, view)) = views.next().await {
        let skip = |reason: String| ExportProgress::Skipped {
            title: entity.title.clone(),
            reason,
        };

        let remote = match view {
            Ok(remote) => remote,
            Err(BackendError::NotFound) => {
                log::warn!("'{}' is gone from {backend} (item {item_id})", entity.title);
                stats.not_found += 1;
                progress(skip("item not found".to_string()));
                continue;
            }
            Err(e) => {
                log::warn!("Fetching '{}' from {backend} failed: {e}", entity.title);
                stats.errors += 1;
                progress(skip(e.to_string()));
                continue;
            }
        };

        if remote.played() == entity.watched {
            stats.identical += 1;
            progress(skip("already in sync".to_string()));
            continue;
        }

        let backend_date = if remote.played() {
            remote.last_played_unix()
        } else {
            remote.date_created_unix()
        };
        let Some(backend_date) = backend_date else {
            log::warn!("'{}' on {backend} has no date to compare", entity.title);
            stats.missing_date += 1;
            progress(skip("no backend date".to_string()));
            continue;
        };

        if backend_date >= entity.updated + options.allowed_time_diff {
            stats.backend_newer += 1;
            progress(skip(format!(
                "backend state is newer ({backend_date} >= {})",
                entity.updated + options.allowed_time_diff
            )));
            continue;
        }

        let request = client.play_state_request(&item_id, entity);
        if options.dry_run {
            log::info!(
                "Dry run: would mark '{}' {} on {backend}",
                entity.title,
                if entity.watched { "played" } else { "unplayed" }
            );
        } else {
            queue.add(request);
        }
        stats.queued += 1;
        progress(ExportProgress::Queued {
            title: entity.title.clone(),
            watched: entity.watched,
        });
    }

    progress(ExportProgress::Done);
    stats
}
