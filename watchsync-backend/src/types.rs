//! Wire types for the Jellyfin/Emby item API.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use watchsync_model::{BackendMeta, MediaType, State};

/// Play-state block attached to an item for the querying user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RemoteUserData {
    #[serde(default)]
    pub played: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_played_date: Option<DateTime<Utc>>,
}

/// One item as the backend currently sees it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RemoteItem {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "Type", default)]
    pub item_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provider_ids: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<RemoteUserData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub production_year: Option<i32>,
    /// For episodes: the owning series item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_id: Option<String>,
    /// For episodes: season number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_index_number: Option<i32>,
    /// For episodes: episode number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_number: Option<i32>,
}

/// Paged item listing response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ItemsPage {
    #[serde(default)]
    pub items: Vec<RemoteItem>,
    #[serde(default)]
    pub total_record_count: u64,
}

impl RemoteItem {
    pub fn played(&self) -> bool {
        self.user_data.as_ref().is_some_and(|u| u.played)
    }

    pub fn last_played_unix(&self) -> Option<i64> {
        self.user_data
            .as_ref()
            .and_then(|u| u.last_played_date)
            .map(|d| d.timestamp())
    }

    pub fn date_created_unix(&self) -> Option<i64> {
        self.date_created.map(|d| d.timestamp())
    }

    pub fn media_type(&self) -> Option<MediaType> {
        match self.item_type.as_str() {
            "Movie" => Some(MediaType::Movie),
            "Episode" => Some(MediaType::Episode),
            _ => None,
        }
    }

    /// Convert the backend's view into a canonical observation.
    ///
    /// `series_guids` supplies the parent show's identity for episodes
    /// (resolved separately; the item payload only carries `SeriesId`).
    /// Returns `None` for item types the core does not track, or when the
    /// backend reports no usable timestamp at all.
    pub fn into_state(
        self,
        backend_id: &str,
        series_guids: &BTreeMap<String, String>,
    ) -> Option<State> {
        let media_type = self.media_type()?;
        let watched = self.played();
        let played_at = self.last_played_unix();
        let updated = match played_at.or_else(|| self.date_created_unix()) {
            Some(ts) if ts > 0 => ts,
            _ => return None,
        };

        let guids = normalize_guids(&self.provider_ids);
        let parent = if media_type == MediaType::Episode {
            series_guids.clone()
        } else {
            BTreeMap::new()
        };

        let meta = BackendMeta {
            id: Some(self.id.clone()),
            watched,
            played_at: if watched { played_at } else { None },
            guids: guids.clone(),
            parent: parent.clone(),
        };

        Some(State {
            id: None,
            media_type,
            watched,
            updated,
            via: backend_id.to_string(),
            title: self.name.unwrap_or_default(),
            year: self.production_year,
            season: self.parent_index_number.filter(|_| media_type == MediaType::Episode),
            episode: self.index_number.filter(|_| media_type == MediaType::Episode),
            guids,
            parent,
            metadata: BTreeMap::from([(backend_id.to_string(), meta)]),
            extra: BTreeMap::new(),
            tainted: false,
        })
    }
}

/// Lowercase the provider namespaces (`Imdb` → `imdb`) and drop empties.
pub fn normalize_guids(provider_ids: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    provider_ids
        .iter()
        .filter(|(_, id)| !id.is_empty())
        .map(|(ns, id)| (ns.to_lowercase(), id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn item(item_type: &str) -> RemoteItem {
        RemoteItem {
            id: "121".to_string(),
            name: Some("The Matrix".to_string()),
            item_type: item_type.to_string(),
            provider_ids: BTreeMap::from([("Imdb".to_string(), "tt0133093".to_string())]),
            user_data: Some(RemoteUserData {
                played: true,
                last_played_date: Some(Utc.timestamp_opt(1000, 0).unwrap()),
            }),
            date_created: Some(Utc.timestamp_opt(500, 0).unwrap()),
            production_year: Some(1999),
            ..Default::default()
        }
    }

    #[test]
    fn wire_fields_deserialize_from_pascal_case() {
        let json = r#"{
            "Id": "121",
            "Type": "Movie",
            "ProviderIds": {"Imdb": "tt0133093"},
            "UserData": {"Played": true, "LastPlayedDate": "2024-03-01T12:00:00Z"},
            "DateCreated": "2023-01-01T00:00:00Z"
        }"#;
        let item: RemoteItem = serde_json::from_str(json).unwrap();
        assert!(item.played());
        assert!(item.last_played_unix().unwrap() > item.date_created_unix().unwrap());
    }

    #[test]
    fn movie_converts_to_observation() {
        let state = item("Movie").into_state("home", &BTreeMap::new()).unwrap();
        assert_eq!(state.media_type, MediaType::Movie);
        assert!(state.watched);
        assert_eq!(state.updated, 1000);
        assert_eq!(state.guids["imdb"], "tt0133093");
        assert_eq!(state.metadata["home"].id.as_deref(), Some("121"));
        assert_eq!(state.metadata["home"].played_at, Some(1000));
    }

    #[test]
    fn episode_takes_parent_identity_from_series_guids() {
        let mut remote = item("Episode");
        remote.series_id = Some("900".to_string());
        remote.parent_index_number = Some(2);
        remote.index_number = Some(5);
        let series = BTreeMap::from([("tvdb".to_string(), "81189".to_string())]);

        let state = remote.into_state("home", &series).unwrap();
        assert_eq!(state.media_type, MediaType::Episode);
        assert_eq!(state.season, Some(2));
        assert_eq!(state.parent["tvdb"], "81189");
        assert!(state.has_relative_guid());
    }

    #[test]
    fn unknown_types_and_dateless_items_are_dropped() {
        assert!(item("Trailer")
            .into_state("home", &BTreeMap::new())
            .is_none());

        let mut dateless = item("Movie");
        dateless.user_data = None;
        dateless.date_created = None;
        assert!(dateless.into_state("home", &BTreeMap::new()).is_none());
    }

    #[test]
    fn unplayed_items_keep_created_date_as_updated() {
        let mut remote = item("Movie");
        remote.user_data = Some(RemoteUserData::default());
        let state = remote.into_state("home", &BTreeMap::new()).unwrap();
        assert!(!state.watched);
        assert_eq!(state.updated, 500);
        assert_eq!(state.metadata["home"].played_at, None);
    }
}
