// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Archetype catalog and sparse entity index.
//!
//! Maps each unique signature to exactly one archetype and each live
//! entity id to its (archetype, row) location. Row removal is the
//! caller's job; `clear_location` only tombstones the sparse entry.

use std::ptr::NonNull;

use ahash::AHashMap;

use crate::archetype::{Archetype, ArchetypeSignature};
use crate::entity::EntityLocation;

/// The empty archetype is always bootstrapped at index 0, which keeps
/// component-less entities on the same code paths as everything else.
pub const EMPTY_ARCHETYPE: usize = 0;

/// Owns every archetype plus the sparse entity index
pub struct ArchetypeStorage {
    archetypes: Vec<Archetype>,
    archetype_index: AHashMap<ArchetypeSignature, usize>,
    locations: Vec<Option<EntityLocation>>,
}

impl ArchetypeStorage {
    pub fn new() -> Self {
        let mut storage = Self {
            // Start with reasonable defaults to avoid resize spikes
            archetypes: Vec::with_capacity(64),
            archetype_index: AHashMap::with_capacity(64),
            locations: Vec::new(),
        };
        storage.get_or_create_with(&ArchetypeSignature::new(), |_| {});
        storage
    }

    /// Look up the archetype for `signature`, creating it on first use.
    ///
    /// On creation the signature is copied into a heap-owned key and
    /// `on_create` runs once to register the columns. Signatures are
    /// canonical (sorted), so `(A, B)` and `(B, A)` map to one archetype.
    pub fn get_or_create_with<F>(&mut self, signature: &ArchetypeSignature, on_create: F) -> usize
    where
        F: FnOnce(&mut Archetype),
    {
        if let Some(&id) = self.archetype_index.get(signature) {
            return id;
        }

        let mut archetype = Archetype::new(signature.clone());
        on_create(&mut archetype);

        // Push the archetype first so the index never refers to a
        // missing entry
        self.archetypes.push(archetype);
        let id = self.archetypes.len() - 1;
        self.archetype_index.insert(signature.clone(), id);
        id
    }

    pub fn archetype(&self, id: usize) -> Option<&Archetype> {
        self.archetypes.get(id)
    }

    pub fn archetype_mut(&mut self, id: usize) -> Option<&mut Archetype> {
        self.archetypes.get_mut(id)
    }

    /// Indexed access for ids the caller got from this storage. An
    /// out-of-range id is an internal-consistency bug and panics.
    pub(crate) fn archetype_unchecked_mut(&mut self, id: usize) -> &mut Archetype {
        &mut self.archetypes[id]
    }

    /// All archetypes, creation order
    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    /// Internal helper exposing archetype pointers for query iteration
    ///
    /// # Safety
    /// Returned pointer is valid for the lifetime of the storage. Caller
    /// must ensure no aliasing violations when dereferencing.
    pub(crate) fn archetype_ptr_mut(&mut self, id: usize) -> Option<NonNull<Archetype>> {
        self.archetypes.get_mut(id).map(NonNull::from)
    }

    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    /// Split mutable access to two distinct archetypes (migration source
    /// and destination).
    pub(crate) fn archetype_pair_mut(
        &mut self,
        a: usize,
        b: usize,
    ) -> (&mut Archetype, &mut Archetype) {
        debug_assert_ne!(a, b);
        if a < b {
            let (left, right) = self.archetypes.split_at_mut(b);
            (&mut left[a], &mut right[0])
        } else {
            let (left, right) = self.archetypes.split_at_mut(a);
            (&mut right[0], &mut left[b])
        }
    }

    /// Location of a live entity id, if any
    pub fn location(&self, id: u32) -> Option<EntityLocation> {
        self.locations.get(id as usize).copied().flatten()
    }

    /// Record a location, growing the sparse index to cover `id`
    pub fn set_location(&mut self, id: u32, location: EntityLocation) {
        let index = id as usize;
        if index >= self.locations.len() {
            self.locations.resize(index + 1, None);
        }
        self.locations[index] = Some(location);
    }

    /// Tombstone the sparse entry for `id`. The caller performs the
    /// archetype row removal and propagates the swap-move.
    pub fn clear_location(&mut self, id: u32) {
        if let Some(slot) = self.locations.get_mut(id as usize) {
            *slot = None;
        }
    }

    /// Number of live sparse entries
    pub fn live_count(&self) -> usize {
        self.archetypes.iter().map(Archetype::len).sum()
    }
}

impl Default for ArchetypeStorage {
    fn default() -> Self {
        Self::new()
    }
}
