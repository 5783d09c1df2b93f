//! The reconciliation mapper.
//!
//! Accumulates a working set of canonical records, classifies each
//! incoming observation against it, and commits the change set in one
//! transaction. Single-threaded by design: one run owns one working set.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;
use watchsync_db::{CommitStats, Store, StoreError};
use watchsync_model::{default_diff_keys, merge, Field, State};

use crate::counters::{Counters, Outcome};
use crate::index::PointerIndex;
use crate::options::{AddContext, Options};
use crate::progress::SyncProgress;

#[derive(Debug, Error)]
pub enum MapperError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

/// What happened to one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new record entered the working set.
    Added,
    /// An existing record changed.
    Updated,
    /// Only the per-backend metadata changed.
    MetadataUpdated,
    /// The record flipped from watched to unwatched.
    MarkedUnplayed,
    /// The observation matched but changed nothing.
    IgnoredNoChange,
    /// The observation was at or before the last sync point.
    IgnoredNotPlayedSinceLastSync,
    /// No usable identity on the observation.
    FailedNoGuid,
    /// Metadata-only mode and no existing record to attach to.
    FailedNotFound,
}

/// Result of one pass through the decision table: either a final outcome,
/// or a request to run the (now tainted) observation through once more.
enum Pass {
    Done(AddOutcome),
    Retaint,
}

pub struct Mapper {
    store: Store,
    options: Options,
    objects: HashMap<usize, State>,
    changed: BTreeSet<usize>,
    pointers: PointerIndex,
    counters: Counters,
    fully_loaded: bool,
    next_key: usize,
}

impl Mapper {
    pub fn new(store: Store, options: Options) -> Self {
        Self {
            store,
            options,
            objects: HashMap::new(),
            changed: BTreeSet::new(),
            pointers: PointerIndex::new(),
            counters: Counters::default(),
            fully_loaded: false,
            next_key: 0,
        }
    }

    /// Read stored records into the working set and register their
    /// pointers. With `since == None` the mapper is fully preloaded and
    /// never falls back to lazy storage lookups.
    pub fn load_data(
        &mut self,
        since: Option<i64>,
        progress: &dyn Fn(SyncProgress),
    ) -> Result<usize, MapperError> {
        let rows = self.store.get_all(since)?;
        let total = rows.len();
        let mut loaded = 0;

        for (i, state) in rows.into_iter().enumerate() {
            progress(SyncProgress::Loading {
                current: i + 1,
                total,
                title: state.title.clone(),
            });
            // Duplicate ids: first wins.
            if let Some(local) = state.local_pointer() {
                if self.pointers.contains(&local) {
                    continue;
                }
            }
            let key = self.alloc_key();
            self.pointers.add_pointers(&state, key);
            self.objects.insert(key, state);
            loaded += 1;
        }

        self.fully_loaded = since.is_none();
        progress(SyncProgress::Loaded { loaded });
        Ok(loaded)
    }

    /// Run one observation through the decision table.
    ///
    /// Exactly one counter is emitted per call; the returned outcome
    /// mirrors it for callers that branch on the decision.
    pub fn add(&mut self, entity: State, ctx: &AddContext) -> Result<AddOutcome, MapperError> {
        if !entity.has_guids() && !entity.has_relative_guid() {
            self.counters
                .bump(&entity.via, entity.media_type, Outcome::FailedNoGuid);
            log::warn!(
                "Ignoring '{}' from {}: no usable identity",
                entity.title,
                entity.via
            );
            return Ok(AddOutcome::FailedNoGuid);
        }

        let metadata_only = ctx.metadata_only || self.options.import_metadata_only;
        let mut entity = entity;

        match self.pass(&mut entity, ctx, metadata_only)? {
            Pass::Done(outcome) => Ok(outcome),
            // Conflict arbitration: the tainted copy goes around exactly
            // once more, and a tainted entity can never re-taint.
            Pass::Retaint => match self.pass(&mut entity, ctx, metadata_only)? {
                Pass::Done(outcome) => Ok(outcome),
                Pass::Retaint => Ok(AddOutcome::IgnoredNoChange),
            },
        }
    }

    fn pass(
        &mut self,
        entity: &mut State,
        ctx: &AddContext,
        metadata_only: bool,
    ) -> Result<Pass, MapperError> {
        let via = entity.via.clone();
        let media_type = entity.media_type;

        let key = match self.locate(entity)? {
            Some(key) => key,
            None => {
                if metadata_only {
                    self.counters.bump(&via, media_type, Outcome::Failed);
                    self.trace(|| {
                        format!("No existing record for '{}' in metadata-only mode", entity.title)
                    });
                    return Ok(Pass::Done(AddOutcome::FailedNotFound));
                }
                let key = self.alloc_key();
                self.pointers.add_pointers(entity, key);
                self.objects.insert(key, entity.clone());
                self.changed.insert(key);
                self.counters.bump(&via, media_type, Outcome::Added);
                self.trace(|| format!("Added '{}' via {via}", entity.title));
                return Ok(Pass::Done(AddOutcome::Added));
            }
        };

        // Metadata-only requests and tainted re-runs touch nothing but the
        // per-backend metadata (and the opaque extras riding along).
        if metadata_only || entity.tainted {
            return Ok(Pass::Done(self.apply_metadata(key, entity)));
        }

        // Time gate: an observation no newer than the last sync point
        // cannot change play state, with one exception — a legitimate
        // transition back to unplayed.
        if !self.options.ignore_date {
            if let Some(after) = ctx.after {
                if after >= entity.updated {
                    return Ok(Pass::Done(self.time_gated(key, entity, after)));
                }
            }
        }

        // Conflict: we know the title as played and a backend claims
        // unplayed without metadata to arbitrate (or with a play date
        // equal to its own last recorded one). Taint and re-process so
        // the claim is recorded without downgrading the play state.
        {
            let cur = &self.objects[&key];
            if cur.watched && !entity.watched {
                let meta = entity.metadata.get(&via);
                let has_meta = meta.is_some_and(|m| !m.is_empty());
                let same_play_date =
                    meta.and_then(|m| m.played_at) == Some(entity.updated);
                if !has_meta || same_play_date {
                    log::info!(
                        "Conflict for '{}': unplayed via {via} vs played; recording play date",
                        cur.title
                    );
                    entity.metadata.entry(via).or_default().played_at = Some(entity.updated);
                    entity.tainted = true;
                    return Ok(Pass::Retaint);
                }
            }
        }

        // General merge over the caller's key set (or everything except
        // the ignore-diff fields).
        let keys = match &ctx.diff_keys {
            Some(keys) => keys.clone(),
            None => default_diff_keys(),
        };
        let (next, changed_fields) = {
            let cur = &self.objects[&key];
            merge(cur, entity, &keys)
        };
        if changed_fields.is_empty() {
            self.counters.bump(&via, media_type, Outcome::IgnoredNoChange);
            self.trace(|| format!("No change for '{}' via {via}", entity.title));
            return Ok(Pass::Done(AddOutcome::IgnoredNoChange));
        }

        let watched_toggled = changed_fields.contains(&Field::Watched);
        // Fields excluded from diffing still ride along on a real change.
        let (next, _) = merge(&next, entity, &[Field::Via, Field::Extra]);

        if watched_toggled {
            log::info!(
                "'{}' is now {} per {via}",
                next.title,
                if next.watched { "played" } else { "unplayed" }
            );
        } else {
            self.trace(|| {
                let names: Vec<&str> = changed_fields.iter().map(|f| f.as_str()).collect();
                format!("Updated '{}' via {via}: {}", next.title, names.join(", "))
            });
        }

        self.replace(key, next);
        self.counters.bump(&via, media_type, Outcome::Updated);
        Ok(Pass::Done(AddOutcome::Updated))
    }

    /// The `after >= entity.updated` branch of the decision table.
    fn time_gated(&mut self, key: usize, entity: &State, after: i64) -> AddOutcome {
        let cur = &self.objects[&key];
        let via = entity.via.clone();
        let media_type = entity.media_type;

        if !entity.watched && cur.should_mark_as_unplayed(entity, after) {
            let (mut next, _) = merge(cur, entity, &[Field::Metadata, Field::Extra]);
            next.watched = false;
            next.updated = entity.updated;
            log::info!("Marked '{}' unplayed per {via}", next.title);
            self.replace(key, next);
            self.counters.bump(&via, media_type, Outcome::Updated);
            return AddOutcome::MarkedUnplayed;
        }

        if self.options.always_update_meta {
            let (next, changed_fields) = merge(cur, entity, &[Field::Metadata]);
            if !changed_fields.is_empty() {
                let (next, _) = merge(&next, entity, &[Field::Extra]);
                self.replace(key, next);
                self.counters.bump(&via, media_type, Outcome::Updated);
                return AddOutcome::MetadataUpdated;
            }
        }

        self.counters
            .bump(&via, media_type, Outcome::IgnoredNotPlayedSinceLastSync);
        self.trace(|| {
            format!(
                "'{}' via {via} not played since last sync ({} <= {after})",
                entity.title, entity.updated
            )
        });
        AddOutcome::IgnoredNotPlayedSinceLastSync
    }

    /// Apply only the metadata field (plus extras when it changed).
    fn apply_metadata(&mut self, key: usize, entity: &State) -> AddOutcome {
        let via = entity.via.clone();
        let media_type = entity.media_type;

        let (next, changed_fields) = {
            let cur = &self.objects[&key];
            merge(cur, entity, &[Field::Metadata])
        };
        if changed_fields.is_empty() {
            self.counters.bump(&via, media_type, Outcome::IgnoredNoChange);
            return AddOutcome::IgnoredNoChange;
        }

        let (next, _) = merge(&next, entity, &[Field::Extra]);
        self.replace(key, next);
        self.counters.bump(&via, media_type, Outcome::Updated);
        self.trace(|| format!("Refreshed metadata for '{}' via {via}", entity.title));
        AddOutcome::MetadataUpdated
    }

    /// Remove a record from the working set and from storage.
    pub fn remove(&mut self, entity: &State) -> Result<bool, MapperError> {
        let Some(key) = self.locate(entity)? else {
            return Ok(self.store.remove(entity)?);
        };
        let Some(state) = self.objects.get(&key).cloned() else {
            return Ok(false);
        };
        self.pointers.remove_pointers(&state, key);
        self.store.remove(&state)?;
        self.objects.remove(&key);
        self.changed.remove(&key);
        Ok(true)
    }

    /// Persist the change set in one transaction and reset the working
    /// set. Under `dry_run` the per-type counts are still produced but
    /// nothing is written.
    pub fn commit(
        &mut self,
        progress: &dyn Fn(SyncProgress),
    ) -> Result<CommitStats, MapperError> {
        let entities: Vec<State> = self
            .changed
            .iter()
            .filter_map(|key| self.objects.get(key).cloned())
            .collect();
        progress(SyncProgress::Committing {
            pending: entities.len(),
        });

        let stats = if self.options.dry_run {
            let mut stats = CommitStats::default();
            for entity in &entities {
                let counts = stats.for_type(entity.media_type);
                if entity.id.is_none() {
                    counts.added += 1;
                } else {
                    counts.updated += 1;
                }
            }
            log::info!("Dry run: skipped writing {} records", entities.len());
            stats
        } else {
            self.store.commit(entities)?
        };

        progress(SyncProgress::Committed {
            written: stats.total_written(),
            failed: stats.total_failed(),
        });
        self.reset();
        Ok(stats)
    }

    /// Clear the working set. Counters survive until taken.
    pub fn reset(&mut self) {
        self.objects.clear();
        self.changed.clear();
        self.pointers.clear();
        self.fully_loaded = false;
        self.next_key = 0;
    }

    /// Explicit teardown: commits a pending change set unless autocommit
    /// is disabled.
    pub fn close(mut self) -> Result<Option<CommitStats>, MapperError> {
        if !self.options.disable_autocommit && !self.changed.is_empty() {
            return self.commit(&|_| {}).map(Some);
        }
        Ok(None)
    }

    /// Resolve an entity against the working set without mutating it.
    pub fn get(&self, entity: &State) -> Option<&State> {
        let key = self.pointers.find(entity)?;
        self.objects.get(&key)
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn take_counters(&mut self) -> Counters {
        std::mem::take(&mut self.counters)
    }

    pub fn states(&self) -> impl Iterator<Item = &State> {
        self.objects.values()
    }

    pub fn pointer_index(&self) -> &PointerIndex {
        &self.pointers
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.changed.is_empty()
    }

    pub fn is_fully_loaded(&self) -> bool {
        self.fully_loaded
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Index lookup with a lazy storage fallback while not fully loaded.
    fn locate(&mut self, entity: &State) -> Result<Option<usize>, MapperError> {
        if let Some(key) = self.pointers.find(entity) {
            return Ok(Some(key));
        }
        if self.fully_loaded {
            return Ok(None);
        }
        match self.store.get(entity)? {
            Some(state) => {
                let key = self.alloc_key();
                self.pointers.add_pointers(&state, key);
                self.objects.insert(key, state);
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }

    /// Swap a record in place, re-registering its pointers first so a
    /// lookup can never observe a stale identity.
    fn replace(&mut self, key: usize, next: State) {
        if let Some(old) = self.objects.get(&key) {
            self.pointers.remove_pointers(old, key);
        }
        self.pointers.add_pointers(&next, key);
        self.objects.insert(key, next);
        self.changed.insert(key);
    }

    fn alloc_key(&mut self) -> usize {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    fn trace(&self, message: impl Fn() -> String) {
        if self.options.debug_trace {
            log::debug!("{}", message());
        }
    }
}
