//! The canonical `State` record and its identity vocabulary.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::fields::Field;
use crate::metadata::BackendMeta;

/// The kind of title a record represents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    #[default]
    Movie,
    Episode,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Movie => "movie",
            MediaType::Episode => "episode",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("Unknown media type: '{0}'")]
pub struct MediaTypeParseError(pub String);

impl FromStr for MediaType {
    type Err = MediaTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "movie" => Ok(MediaType::Movie),
            "episode" => Ok(MediaType::Episode),
            other => Err(MediaTypeParseError(other.to_string())),
        }
    }
}

/// A shape violation detected on a record.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InvalidState {
    #[error("Movies cannot carry season/episode/parent data")]
    MovieWithEpisodeFields,
    #[error("Episodes require both season and episode numbers")]
    EpisodeWithoutNumbers,
    #[error("Record has no updated timestamp")]
    NoTimestamp,
}

/// One logical title as the system understands it, independent of which
/// backend reported it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct State {
    /// Primary key, assigned by storage on first insert.
    pub id: Option<i64>,
    /// Immutable after creation.
    pub media_type: MediaType,
    /// Canonical play state.
    pub watched: bool,
    /// Unix seconds of the last play-state change.
    pub updated: i64,
    /// The backend that originated the most recent state.
    pub via: String,
    pub title: String,
    pub year: Option<i32>,
    pub season: Option<i32>,
    pub episode: Option<i32>,
    /// External ids by namespace (e.g. `imdb` → `tt0133093`).
    pub guids: BTreeMap<String, String>,
    /// For episodes, the parent show's GUIDs.
    pub parent: BTreeMap<String, String>,
    /// Each backend's last reported view, keyed by backend name.
    pub metadata: BTreeMap<String, BackendMeta>,
    /// Opaque per-backend attributes, never used in identity or merge.
    pub extra: BTreeMap<String, serde_json::Value>,
    /// One-shot reprocessing flag set during conflict arbitration.
    /// Never persisted.
    pub tainted: bool,
}

impl State {
    /// True when at least one GUID carries a non-empty external id.
    pub fn has_guids(&self) -> bool {
        self.guids.values().any(|v| !v.is_empty())
    }

    /// True when the record can be identified relative to its parent show.
    pub fn has_relative_guid(&self) -> bool {
        self.media_type == MediaType::Episode
            && self.season.is_some()
            && self.episode.is_some()
            && self.parent.values().any(|v| !v.is_empty())
    }

    /// Global identity pointers: `{ns}://{id}/{type}` per non-empty GUID.
    pub fn pointers(&self) -> Vec<String> {
        self.guids
            .iter()
            .filter(|(_, id)| !id.is_empty())
            .map(|(ns, id)| format!("{ns}://{id}/{}", self.media_type.as_str()))
            .collect()
    }

    /// Relative identity pointers: `r{ns}://{show_id}/{season}/{episode}`
    /// per non-empty parent GUID. Empty for anything but episodes.
    pub fn relative_pointers(&self) -> Vec<String> {
        if !self.has_relative_guid() {
            return Vec::new();
        }
        let (season, episode) = (self.season.unwrap_or(0), self.episode.unwrap_or(0));
        self.parent
            .iter()
            .filter(|(_, id)| !id.is_empty())
            .map(|(ns, id)| format!("r{ns}://{id}/{season}/{episode}"))
            .collect()
    }

    /// The reserved direct pointer for a persisted record.
    pub fn local_pointer(&self) -> Option<String> {
        self.id.map(|id| format!("local_db://{id}"))
    }

    /// Whether an incoming "unplayed" observation from `entity.via` is
    /// allowed to flip this record back to unwatched.
    ///
    /// Requires that the backend previously reported the title as played
    /// before the last sync point; an unknown-provenance "unplayed" never
    /// downgrades a known "played".
    pub fn should_mark_as_unplayed(&self, entity: &State, after: i64) -> bool {
        if !self.watched {
            return false;
        }
        match self.metadata.get(&entity.via) {
            Some(meta) => meta.watched && meta.played_at.is_some_and(|p| p < after),
            None => false,
        }
    }

    /// Check the §3.1-style shape invariants.
    pub fn validate(&self) -> Result<(), InvalidState> {
        match self.media_type {
            MediaType::Movie => {
                if self.season.is_some() || self.episode.is_some() || !self.parent.is_empty() {
                    return Err(InvalidState::MovieWithEpisodeFields);
                }
            }
            MediaType::Episode => {
                if self.season.is_none() || self.episode.is_none() {
                    return Err(InvalidState::EpisodeWithoutNumbers);
                }
            }
        }
        if self.updated <= 0 {
            return Err(InvalidState::NoTimestamp);
        }
        Ok(())
    }
}

/// Merge `incoming` into a clone of `cur` over the given keys.
///
/// Pure: returns the merged record and the fields that actually changed;
/// `cur` is untouched. Map-valued fields merge per key with incoming
/// entries winning; scalar fields are overwritten when the incoming side
/// carries a value.
pub fn merge(cur: &State, incoming: &State, keys: &[Field]) -> (State, Vec<Field>) {
    let mut next = cur.clone();
    let mut changed = Vec::new();

    for &field in keys {
        let did_change = match field {
            Field::Watched => {
                let c = next.watched != incoming.watched;
                next.watched = incoming.watched;
                c
            }
            Field::Updated => {
                let c = next.updated != incoming.updated;
                next.updated = incoming.updated;
                c
            }
            Field::Via => {
                if !incoming.via.is_empty() && next.via != incoming.via {
                    next.via = incoming.via.clone();
                    true
                } else {
                    false
                }
            }
            Field::Title => {
                if !incoming.title.is_empty() && next.title != incoming.title {
                    next.title = incoming.title.clone();
                    true
                } else {
                    false
                }
            }
            Field::Year => replace_some(&mut next.year, incoming.year),
            Field::Season => replace_some(&mut next.season, incoming.season),
            Field::Episode => replace_some(&mut next.episode, incoming.episode),
            Field::Guids => merge_map(&mut next.guids, &incoming.guids),
            Field::Parent => merge_map(&mut next.parent, &incoming.parent),
            Field::Metadata => merge_metadata(&mut next.metadata, &incoming.metadata),
            Field::Extra => merge_map(&mut next.extra, &incoming.extra),
        };
        if did_change {
            changed.push(field);
        }
    }

    (next, changed)
}

fn replace_some<T: PartialEq + Copy>(slot: &mut Option<T>, incoming: Option<T>) -> bool {
    match incoming {
        Some(v) if *slot != Some(v) => {
            *slot = Some(v);
            true
        }
        _ => false,
    }
}

fn merge_map<V: Clone + PartialEq>(
    target: &mut BTreeMap<String, V>,
    incoming: &BTreeMap<String, V>,
) -> bool {
    let mut changed = false;
    for (key, value) in incoming {
        if target.get(key) != Some(value) {
            target.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

fn merge_metadata(
    target: &mut BTreeMap<String, BackendMeta>,
    incoming: &BTreeMap<String, BackendMeta>,
) -> bool {
    let mut changed = false;
    for (backend, meta) in incoming {
        match target.get_mut(backend) {
            None => {
                target.insert(backend.clone(), meta.clone());
                changed = true;
            }
            Some(existing) => {
                if meta.id.is_some() && existing.id != meta.id {
                    existing.id = meta.id.clone();
                    changed = true;
                }
                if existing.watched != meta.watched {
                    existing.watched = meta.watched;
                    changed = true;
                }
                if meta.played_at.is_some() && existing.played_at != meta.played_at {
                    existing.played_at = meta.played_at;
                    changed = true;
                }
                changed |= merge_map(&mut existing.guids, &meta.guids);
                changed |= merge_map(&mut existing.parent, &meta.parent);
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::default_diff_keys;

    fn movie(via: &str, watched: bool, updated: i64) -> State {
        State {
            media_type: MediaType::Movie,
            watched,
            updated,
            via: via.to_string(),
            title: "The Matrix".to_string(),
            guids: BTreeMap::from([("imdb".to_string(), "tt0133093".to_string())]),
            ..Default::default()
        }
    }

    #[test]
    fn movie_pointers_use_type_suffix() {
        let state = movie("home", true, 100);
        assert_eq!(state.pointers(), vec!["imdb://tt0133093/movie"]);
        assert!(state.relative_pointers().is_empty());
    }

    #[test]
    fn episode_relative_pointers_combine_parent_and_numbers() {
        let state = State {
            media_type: MediaType::Episode,
            updated: 100,
            season: Some(2),
            episode: Some(5),
            parent: BTreeMap::from([
                ("tvdb".to_string(), "81189".to_string()),
                ("imdb".to_string(), "tt0903747".to_string()),
            ]),
            ..Default::default()
        };
        assert!(state.has_relative_guid());
        assert_eq!(
            state.relative_pointers(),
            vec!["rimdb://tt0903747/2/5", "rtvdb://81189/2/5"]
        );
    }

    #[test]
    fn empty_guid_values_do_not_count_as_identity() {
        let state = State {
            updated: 100,
            guids: BTreeMap::from([("imdb".to_string(), String::new())]),
            ..Default::default()
        };
        assert!(!state.has_guids());
        assert!(state.pointers().is_empty());
    }

    #[test]
    fn merge_is_a_no_op_for_identical_records() {
        let a = movie("home", true, 100);
        let (next, changed) = merge(&a, &a.clone(), &default_diff_keys());
        assert!(changed.is_empty());
        assert_eq!(next, a);
    }

    #[test]
    fn merge_unions_guids_and_reports_change() {
        let cur = movie("home", true, 100);
        let mut incoming = movie("other", true, 150);
        incoming
            .guids
            .insert("tmdb".to_string(), "603".to_string());

        let (next, changed) = merge(&cur, &incoming, &default_diff_keys());
        assert!(changed.contains(&Field::Guids));
        assert!(changed.contains(&Field::Updated));
        assert_eq!(next.guids.len(), 2);
        // Existing namespaces survive a merge that only adds new ones.
        assert_eq!(next.guids["imdb"], "tt0133093");
    }

    #[test]
    fn merge_does_not_blank_title_or_via() {
        let cur = movie("home", true, 100);
        let mut incoming = cur.clone();
        incoming.title = String::new();
        incoming.via = String::new();

        let (next, changed) = merge(&cur, &incoming, &default_diff_keys());
        assert!(changed.is_empty());
        assert_eq!(next.title, "The Matrix");
        assert_eq!(next.via, "home");
    }

    #[test]
    fn merge_metadata_merges_per_backend() {
        let mut cur = movie("a", true, 100);
        cur.metadata.insert(
            "a".to_string(),
            BackendMeta {
                id: Some("121".to_string()),
                watched: true,
                played_at: Some(100),
                ..Default::default()
            },
        );
        let mut incoming = movie("b", true, 150);
        incoming.metadata.insert(
            "b".to_string(),
            BackendMeta {
                id: Some("9000".to_string()),
                watched: true,
                played_at: Some(150),
                ..Default::default()
            },
        );

        let (next, changed) = merge(&cur, &incoming, &[Field::Metadata]);
        assert_eq!(changed, vec![Field::Metadata]);
        assert_eq!(next.metadata.len(), 2);
        assert_eq!(next.metadata["a"].played_at, Some(100));
        assert_eq!(next.metadata["b"].id.as_deref(), Some("9000"));
    }

    #[test]
    fn mark_unplayed_requires_recorded_play() {
        let mut cur = movie("a", true, 100);
        let incoming = movie("a", false, 450);

        // No metadata for the reporting backend: never downgrade.
        assert!(!cur.should_mark_as_unplayed(&incoming, 500));

        cur.metadata.insert(
            "a".to_string(),
            BackendMeta {
                watched: true,
                played_at: Some(100),
                ..Default::default()
            },
        );
        assert!(cur.should_mark_as_unplayed(&incoming, 500));

        // Played after the sync point: the gate does not apply.
        cur.metadata.get_mut("a").unwrap().played_at = Some(600);
        assert!(!cur.should_mark_as_unplayed(&incoming, 500));
    }

    #[test]
    fn validate_rejects_malformed_shapes() {
        let mut state = movie("a", true, 100);
        state.season = Some(1);
        assert!(matches!(
            state.validate(),
            Err(InvalidState::MovieWithEpisodeFields)
        ));

        let episode = State {
            media_type: MediaType::Episode,
            updated: 100,
            season: Some(1),
            ..Default::default()
        };
        assert!(matches!(
            episode.validate(),
            Err(InvalidState::EpisodeWithoutNumbers)
        ));

        let stale = State {
            updated: 0,
            ..movie("a", false, 0)
        };
        assert!(matches!(stale.validate(), Err(InvalidState::NoTimestamp)));
    }
}
