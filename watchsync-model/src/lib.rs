//! Data model for cross-backend play-state synchronization.
//!
//! A [`State`] is the canonical record for one logical title (a movie or a
//! single episode), independent of which media-server backend reported it.
//! Identity across backends is carried by external GUIDs and, for episodes,
//! by the parent show's GUIDs plus season/episode numbers.

pub mod fields;
pub mod metadata;
pub mod state;

pub use fields::{default_diff_keys, Field, ENTITY_IGNORE_DIFF_CHANGES, ENTITY_KEYS};
pub use metadata::BackendMeta;
pub use state::{merge, InvalidState, MediaType, MediaTypeParseError, State};
