//! In-memory inverted index from identity keys to working-set keys.
//!
//! Two maps: `ptr` for global pointers (`{ns}://{id}/{type}`, plus the
//! reserved `local_db://{id}` form) and `rptr` for episode-relative
//! pointers. The mapper is the single writer; while a record is in the
//! working set its current pointer set must equal the keys it occupies
//! here, so any identity-bearing mutation removes the old entries before
//! registering the new ones.

use std::collections::HashMap;

use watchsync_model::State;

#[derive(Debug, Default)]
pub struct PointerIndex {
    ptr: HashMap<String, usize>,
    rptr: HashMap<String, usize>,
}

impl PointerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every current pointer of `state` under `key`.
    ///
    /// A pointer already owned by another record is left alone: a
    /// collision means "same title" and is resolved by merge, not by
    /// stealing the index slot.
    pub fn add_pointers(&mut self, state: &State, key: usize) {
        if let Some(local) = state.local_pointer() {
            self.ptr.entry(local).or_insert(key);
        }
        for pointer in state.pointers() {
            self.ptr.entry(pointer).or_insert(key);
        }
        for pointer in state.relative_pointers() {
            self.rptr.entry(pointer).or_insert(key);
        }
    }

    /// Drop every pointer of `state` that currently maps to `key`.
    pub fn remove_pointers(&mut self, state: &State, key: usize) {
        let mut remove = |map: &mut HashMap<String, usize>, pointer: String| {
            if map.get(&pointer) == Some(&key) {
                map.remove(&pointer);
            }
        };
        if let Some(local) = state.local_pointer() {
            remove(&mut self.ptr, local);
        }
        for pointer in state.pointers() {
            remove(&mut self.ptr, pointer);
        }
        for pointer in state.relative_pointers() {
            remove(&mut self.rptr, pointer);
        }
    }

    /// Resolve `entity` to a working-set key: direct `local_db://` form
    /// first, then relative pointers, then global pointers.
    pub fn find(&self, entity: &State) -> Option<usize> {
        if let Some(local) = entity.local_pointer() {
            if let Some(&key) = self.ptr.get(&local) {
                return Some(key);
            }
        }
        for pointer in entity.relative_pointers() {
            if let Some(&key) = self.rptr.get(&pointer) {
                return Some(key);
            }
        }
        for pointer in entity.pointers() {
            if let Some(&key) = self.ptr.get(&pointer) {
                return Some(key);
            }
        }
        None
    }

    pub fn contains(&self, pointer: &str) -> bool {
        self.ptr.contains_key(pointer) || self.rptr.contains_key(pointer)
    }

    /// Total number of registered pointers across both maps.
    pub fn len(&self) -> usize {
        self.ptr.len() + self.rptr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ptr.is_empty() && self.rptr.is_empty()
    }

    pub fn clear(&mut self) {
        self.ptr.clear();
        self.rptr.clear();
    }
}
