//! Field vocabulary for merge and diff decisions.

/// A mergeable field of the canonical record.
///
/// `type` is deliberately absent: a record's media type is immutable after
/// creation, so it never participates in merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Watched,
    Updated,
    Via,
    Title,
    Year,
    Season,
    Episode,
    Guids,
    Parent,
    Metadata,
    Extra,
}

impl Field {
    /// Column/log name for the field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Watched => "watched",
            Field::Updated => "updated",
            Field::Via => "via",
            Field::Title => "title",
            Field::Year => "year",
            Field::Season => "season",
            Field::Episode => "episode",
            Field::Guids => "guids",
            Field::Parent => "parent",
            Field::Metadata => "metadata",
            Field::Extra => "extra",
        }
    }
}

/// Every mergeable field, in column order.
pub const ENTITY_KEYS: &[Field] = &[
    Field::Watched,
    Field::Updated,
    Field::Via,
    Field::Title,
    Field::Year,
    Field::Season,
    Field::Episode,
    Field::Guids,
    Field::Parent,
    Field::Metadata,
    Field::Extra,
];

/// Fields that never count as a difference on their own.
///
/// `via` only names the reporter of the newest state and `extra` is opaque
/// per-backend baggage; both still ride along when another field changes.
pub const ENTITY_IGNORE_DIFF_CHANGES: &[Field] = &[Field::Via, Field::Extra];

/// The default key set for the general merge path.
pub fn default_diff_keys() -> Vec<Field> {
    ENTITY_KEYS
        .iter()
        .copied()
        .filter(|k| !ENTITY_IGNORE_DIFF_CHANGES.contains(k))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_diff_keys_exclude_via_and_extra() {
        let keys = default_diff_keys();
        assert!(!keys.contains(&Field::Via));
        assert!(!keys.contains(&Field::Extra));
        assert!(keys.contains(&Field::Watched));
        assert_eq!(keys.len(), ENTITY_KEYS.len() - ENTITY_IGNORE_DIFF_CHANGES.len());
    }
}
