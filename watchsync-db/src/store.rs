//! CRUD, lookup, and transactional commit for canonical records.

use std::cell::Cell;
use std::time::Duration;

use rand::Rng;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use thiserror::Error;
use watchsync_model::{InvalidState, MediaType, State};

use crate::sql::{quote_identifier, Driver};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialized column is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Record is already persisted with id {0}")]
    AlreadyPersisted(i64),
    #[error("Record has no primary key")]
    NoPrimaryKey,
    #[error("Invalid record: {0}")]
    InvalidState(#[from] InvalidState),
    #[error("Invalid identifier: '{0}'")]
    InvalidIdentifier(String),
}

/// Counts for one action kind during a batched commit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ActionCounts {
    pub added: u64,
    pub updated: u64,
    pub failed: u64,
}

/// Per-type commit counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommitStats {
    pub movies: ActionCounts,
    pub episodes: ActionCounts,
}

impl CommitStats {
    pub fn for_type(&mut self, media_type: MediaType) -> &mut ActionCounts {
        match media_type {
            MediaType::Movie => &mut self.movies,
            MediaType::Episode => &mut self.episodes,
        }
    }

    pub fn total_written(&self) -> u64 {
        self.movies.added + self.movies.updated + self.episodes.added + self.episodes.updated
    }

    pub fn total_failed(&self) -> u64 {
        self.movies.failed + self.episodes.failed
    }
}

/// Maximum executions of a single statement when the database is locked.
const MAX_LOCK_ATTEMPTS: u32 = 4;

const COLUMNS: &[&str] = &[
    "type", "watched", "updated", "via", "title", "year", "season", "episode", "guids", "parent",
    "metadata", "extra",
];

const SELECT_COLUMNS: &str = "id, type, watched, updated, via, title, year, season, episode, \
                              guids, parent, metadata, extra";

/// Durable persistence for `State` records.
///
/// Owns the SQLite connection. All statement executions run through a
/// bounded lock-retry loop, and the connection's prepared-statement cache
/// is flushed whenever an execution fails so a broken handle is never
/// reused.
pub struct Store {
    conn: Connection,
    in_txn: Cell<bool>,
    insert_sql: String,
    update_sql: String,
}

impl Store {
    pub fn new(conn: Connection) -> Result<Self, StoreError> {
        let insert_sql = build_insert_sql()?;
        let update_sql = build_update_sql()?;
        Ok(Self {
            conn,
            in_txn: Cell::new(false),
            insert_sql,
            update_sql,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Persist a new record. Assigns `state.id` on success.
    ///
    /// An unwatched record is normalized first: no backend may appear
    /// "played" while the canonical record is unplayed.
    pub fn insert(&self, state: &mut State) -> Result<(), StoreError> {
        if let Some(id) = state.id {
            return Err(StoreError::AlreadyPersisted(id));
        }
        state.validate()?;
        normalize_unwatched(state);

        let columns = json_columns(state)?;
        let id = self.with_retry(|conn| {
            let mut stmt = conn.prepare_cached(&self.insert_sql)?;
            stmt.execute(params![
                state.media_type.as_str(),
                state.watched,
                state.updated,
                state.via,
                state.title,
                state.year,
                state.season,
                state.episode,
                columns.guids,
                columns.parent,
                columns.metadata,
                columns.extra,
            ])?;
            Ok(conn.last_insert_rowid())
        })?;
        state.id = Some(id);
        Ok(())
    }

    /// Update a persisted record in place. Same normalization as `insert`.
    pub fn update(&self, state: &mut State) -> Result<(), StoreError> {
        let id = state.id.ok_or(StoreError::NoPrimaryKey)?;
        state.validate()?;
        normalize_unwatched(state);

        let columns = json_columns(state)?;
        self.with_retry(|conn| {
            let mut stmt = conn.prepare_cached(&self.update_sql)?;
            stmt.execute(params![
                state.media_type.as_str(),
                state.watched,
                state.updated,
                state.via,
                state.title,
                state.year,
                state.season,
                state.episode,
                columns.guids,
                columns.parent,
                columns.metadata,
                columns.extra,
                id,
            ])
        })?;
        Ok(())
    }

    /// Look up the stored record matching `entity`: directly by id when
    /// set, otherwise by external identity. At most one row is returned.
    pub fn get(&self, entity: &State) -> Result<Option<State>, StoreError> {
        if let Some(id) = entity.id {
            return self.get_by_id(id);
        }
        self.find_by_external_id(entity)
    }

    pub fn get_by_id(&self, id: i64) -> Result<Option<State>, StoreError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM state WHERE id = ?1");
        self.with_retry(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            match stmt.query_row(params![id], row_to_state) {
                Ok(state) => Ok(Some(state)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    /// Single-statement identity lookup: a `type` filter plus an
    /// OR-disjunction over relative identity (episodes), each non-empty
    /// GUID, and the reporting backend's own item id.
    pub fn find_by_external_id(&self, entity: &State) -> Result<Option<State>, StoreError> {
        let mut terms: Vec<String> = Vec::new();
        let mut bind: Vec<Value> = vec![Value::from(entity.media_type.as_str().to_string())];

        if entity.has_relative_guid() {
            let mut parent_terms = Vec::new();
            let mut parent_bind = Vec::new();
            for (ns, id) in entity.parent.iter().filter(|(_, id)| !id.is_empty()) {
                parent_terms.push("json_extract(parent, ?) = ?".to_string());
                parent_bind.push(Value::from(format!("$.{ns}")));
                parent_bind.push(Value::from(id.clone()));
            }
            terms.push(format!(
                "(season = ? AND episode = ? AND ({}))",
                parent_terms.join(" OR ")
            ));
            bind.push(Value::from(i64::from(entity.season.unwrap_or(0))));
            bind.push(Value::from(i64::from(entity.episode.unwrap_or(0))));
            bind.extend(parent_bind);
        }

        for (ns, id) in entity.guids.iter().filter(|(_, id)| !id.is_empty()) {
            terms.push("json_extract(guids, ?) = ?".to_string());
            bind.push(Value::from(format!("$.{ns}")));
            bind.push(Value::from(id.clone()));
        }

        if let Some(backend_id) = entity
            .metadata
            .get(&entity.via)
            .and_then(|meta| meta.id.clone())
        {
            terms.push("json_extract(metadata, ?) = ?".to_string());
            bind.push(Value::from(format!("$.{}.id", entity.via)));
            bind.push(Value::from(backend_id));
        }

        if terms.is_empty() {
            return Ok(None);
        }

        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM state WHERE type = ? AND ({}) LIMIT 1",
            terms.join(" OR ")
        );
        self.with_retry(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            match stmt.query_row(params_from_iter(bind.iter()), row_to_state) {
                Ok(state) => Ok(Some(state)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    /// Enumerate records changed after `since` (unix seconds), or all.
    pub fn get_all(&self, since: Option<i64>) -> Result<Vec<State>, StoreError> {
        self.with_retry(|conn| match since {
            Some(since) => {
                let sql =
                    format!("SELECT {SELECT_COLUMNS} FROM state WHERE updated > ?1 ORDER BY id");
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt.query_map(params![since], row_to_state)?;
                rows.collect()
            }
            None => {
                let sql = format!("SELECT {SELECT_COLUMNS} FROM state ORDER BY id");
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt.query_map([], row_to_state)?;
                rows.collect()
            }
        })
    }

    /// Delete the stored row for `entity`. Returns whether a row was found.
    pub fn remove(&self, entity: &State) -> Result<bool, StoreError> {
        let id = match entity.id {
            Some(id) => Some(id),
            None => self.get(entity)?.and_then(|s| s.id),
        };
        let Some(id) = id else {
            return Ok(false);
        };
        let deleted = self.with_retry(|conn| {
            let mut stmt = conn.prepare_cached("DELETE FROM state WHERE id = ?1")?;
            stmt.execute(params![id])
        })?;
        Ok(deleted > 0)
    }

    /// Run `f` inside a transaction. Re-entrant: a nested call joins the
    /// outer transaction instead of opening a new one. Rolls back on error.
    pub fn transactional<T>(
        &self,
        f: impl FnOnce(&Self) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        if self.in_txn.get() {
            return f(self);
        }

        self.with_retry(|conn| conn.execute_batch("BEGIN IMMEDIATE"))?;
        self.in_txn.set(true);
        let result = f(self);
        self.in_txn.set(false);

        match result {
            Ok(value) => {
                self.with_retry(|conn| conn.execute_batch("COMMIT"))?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Batched insert/update of a change set in one transaction.
    ///
    /// Row-level shape or serialization failures are counted and skipped;
    /// a SQLite error mid-statement aborts and rolls back the whole batch.
    pub fn commit(&self, entities: Vec<State>) -> Result<CommitStats, StoreError> {
        self.transactional(|store| {
            let mut stats = CommitStats::default();
            for mut entity in entities {
                let media_type = entity.media_type;
                let outcome = if entity.id.is_none() {
                    store.insert(&mut entity).map(|_| RowAction::Added)
                } else {
                    store.update(&mut entity).map(|_| RowAction::Updated)
                };
                match outcome {
                    Ok(RowAction::Added) => stats.for_type(media_type).added += 1,
                    Ok(RowAction::Updated) => stats.for_type(media_type).updated += 1,
                    Err(e @ StoreError::Sqlite(_)) => return Err(e),
                    Err(e) => {
                        log::warn!(
                            "Skipping bad row '{}' during commit: {e}",
                            entity.title
                        );
                        stats.for_type(media_type).failed += 1;
                    }
                }
            }
            Ok(stats)
        })
    }

    /// Execute `op`, retrying while SQLite reports the database as locked.
    ///
    /// Sleeps `4 + rand(1..=3)` seconds between attempts, up to
    /// `MAX_LOCK_ATTEMPTS` executions. Any terminal error flushes the
    /// prepared-statement cache before surfacing.
    fn with_retry<T>(
        &self,
        op: impl Fn(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let mut attempt = 1;
        loop {
            match op(&self.conn) {
                Ok(value) => return Ok(value),
                Err(e) if is_locked(&e) && attempt < MAX_LOCK_ATTEMPTS => {
                    let sleep_secs = 4 + rand::thread_rng().gen_range(1..=3);
                    log::warn!(
                        "Database is locked (attempt {attempt}/{MAX_LOCK_ATTEMPTS}), \
                         retrying in {sleep_secs}s"
                    );
                    std::thread::sleep(Duration::from_secs(sleep_secs));
                    attempt += 1;
                }
                Err(e) => {
                    self.conn.flush_prepared_statement_cache();
                    return Err(e.into());
                }
            }
        }
    }
}

enum RowAction {
    Added,
    Updated,
}

fn is_locked(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

/// The canonical record cannot be unplayed while any backend sub-record
/// still claims a play.
fn normalize_unwatched(state: &mut State) {
    if state.watched {
        return;
    }
    for meta in state.metadata.values_mut() {
        meta.watched = false;
        meta.played_at = None;
    }
}

struct JsonColumns {
    guids: String,
    parent: String,
    metadata: String,
    extra: String,
}

fn json_columns(state: &State) -> Result<JsonColumns, StoreError> {
    Ok(JsonColumns {
        guids: serde_json::to_string(&state.guids)?,
        parent: serde_json::to_string(&state.parent)?,
        metadata: serde_json::to_string(&state.metadata)?,
        extra: serde_json::to_string(&state.extra)?,
    })
}

fn build_insert_sql() -> Result<String, StoreError> {
    let table = quote_identifier(Driver::Sqlite, "state")?;
    let columns = COLUMNS
        .iter()
        .map(|c| quote_identifier(Driver::Sqlite, c))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");
    let placeholders = (1..=COLUMNS.len())
        .map(|n| format!("?{n}"))
        .collect::<Vec<_>>()
        .join(", ");
    Ok(format!(
        "INSERT INTO {table} ({columns}) VALUES ({placeholders})"
    ))
}

fn build_update_sql() -> Result<String, StoreError> {
    let table = quote_identifier(Driver::Sqlite, "state")?;
    let assignments = COLUMNS
        .iter()
        .enumerate()
        .map(|(i, c)| Ok(format!("{} = ?{}", quote_identifier(Driver::Sqlite, c)?, i + 1)))
        .collect::<Result<Vec<_>, StoreError>>()?
        .join(", ");
    let id = quote_identifier(Driver::Sqlite, "id")?;
    Ok(format!(
        "UPDATE {table} SET {assignments} WHERE {id} = ?{}",
        COLUMNS.len() + 1
    ))
}

fn row_to_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<State> {
    let type_text: String = row.get(1)?;
    let media_type = type_text.parse::<MediaType>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })?;

    Ok(State {
        id: Some(row.get(0)?),
        media_type,
        watched: row.get(2)?,
        updated: row.get(3)?,
        via: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        title: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        year: row.get(6)?,
        season: row.get(7)?,
        episode: row.get(8)?,
        guids: json_map(row, 9)?,
        parent: json_map(row, 10)?,
        metadata: json_map(row, 11)?,
        extra: json_map(row, 12)?,
        tainted: false,
    })
}

fn json_map<T: serde::de::DeserializeOwned + Default>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let text: Option<String> = row.get(idx)?;
    match text {
        None => Ok(T::default()),
        Some(text) if text.is_empty() => Ok(T::default()),
        Some(text) => serde_json::from_str(&text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        }),
    }
}
