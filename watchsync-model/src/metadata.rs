//! Per-backend metadata sub-records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// What one backend last reported about a title.
///
/// This is the only place a backend's opinion is retained verbatim; the
/// canonical fields on `State` are the reconciled view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendMeta {
    /// The backend's internal item id for this title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// The backend's own play state.
    #[serde(default)]
    pub watched: bool,

    /// When the backend says the title was last played (unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub played_at: Option<i64>,

    /// The external GUIDs the backend reported for the title itself.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub guids: BTreeMap<String, String>,

    /// For episodes, the GUIDs the backend reported for the parent show.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parent: BTreeMap<String, String>,
}

impl BackendMeta {
    /// True when the backend has reported nothing of substance yet.
    pub fn is_empty(&self) -> bool {
        self.id.is_none()
            && !self.watched
            && self.played_at.is_none()
            && self.guids.is_empty()
            && self.parent.is_empty()
    }
}
