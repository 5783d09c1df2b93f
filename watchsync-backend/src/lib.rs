//! Backend collaborator surface for play-state synchronization.
//!
//! Defines the [`BackendClient`] contract the reconciliation core talks
//! to, a reqwest implementation for the Jellyfin/Emby wire, and the
//! outbound request queue contract used by the export planner.

pub mod client;
pub mod error;
pub mod queue;
pub mod types;

pub use client::{BackendClient, JellyfinClient, JellyfinConfig};
pub use error::BackendError;
pub use queue::{dispatch, DispatchStats, MemoryQueue, QueuedRequest, RequestQueue, UserData};
pub use types::{ItemsPage, RemoteItem, RemoteUserData};
