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

//! Query system with archetype filtering
//!
//! Type-safe component queries with automatic archetype matching.
//! Include positions are `&T`, `&mut T`, `Option<&T>`, `Option<&mut T>`
//! and `Entity`; filter positions are `With<T>`, `Without<T>` and tuples
//! of those.

use std::any::TypeId;
use std::marker::PhantomData;
use std::ptr::NonNull;

use smallvec::{smallvec, SmallVec};

use crate::archetype::{Archetype, ComponentColumn};
use crate::component::Component;
use crate::entity::Entity;
use crate::world::World;

const MAX_FILTER_COMPONENTS: usize = 8;

/// Component signature of a query, used as the archetype-match cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct QuerySignature {
    /// Components that must be present
    pub required: SmallVec<[TypeId; MAX_FILTER_COMPONENTS]>,
    /// Components that must be absent
    pub excluded: SmallVec<[TypeId; MAX_FILTER_COMPONENTS]>,
}

impl QuerySignature {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge two signatures into one canonical (sorted, deduplicated) set
    pub fn merge(mut self, other: QuerySignature) -> Self {
        self.required.extend(other.required);
        self.excluded.extend(other.excluded);
        self.required.sort();
        self.required.dedup();
        self.excluded.sort();
        self.excluded.dedup();
        self
    }

    /// Check if an archetype matches this signature
    pub fn matches(&self, archetype: &Archetype) -> bool {
        for &req in &self.required {
            if archetype.column_index(req).is_none() {
                return false;
            }
        }
        for &exc in &self.excluded {
            if archetype.column_index(exc).is_some() {
                return false;
            }
        }
        true
    }
}

/// Cached match list for a specific query signature
pub struct CachedQueryResult {
    pub matches: Vec<usize>,
    pub seen_archetypes: usize,
    pub signature: QuerySignature,
}

impl CachedQueryResult {
    pub fn new(signature: QuerySignature, archetypes: &[Archetype]) -> Self {
        let matches = archetypes
            .iter()
            .enumerate()
            .filter_map(|(id, arch)| signature.matches(arch).then_some(id))
            .collect();

        Self {
            matches,
            seen_archetypes: archetypes.len(),
            signature,
        }
    }

    /// Incremental update: archetypes are never destroyed, so only the
    /// tail needs checking.
    pub fn update(&mut self, archetypes: &[Archetype]) {
        let count = archetypes.len();
        if count > self.seen_archetypes {
            for (id, arch) in archetypes.iter().enumerate().skip(self.seen_archetypes) {
                if self.signature.matches(arch) {
                    self.matches.push(id);
                }
            }
            self.seen_archetypes = count;
        }
    }
}

/// Query filter trait for type-level archetype matching
pub trait QueryFilter {
    /// Check if archetype matches this query
    fn matches_archetype(archetype: &Archetype) -> bool;

    /// Component type ids that must be present
    fn required() -> SmallVec<[TypeId; MAX_FILTER_COMPONENTS]>;

    /// Component type ids that must be absent
    fn excluded() -> SmallVec<[TypeId; MAX_FILTER_COMPONENTS]> {
        SmallVec::new()
    }

    /// Canonical signature for caching
    fn signature() -> QuerySignature {
        let mut sig = QuerySignature::new();
        sig.required = Self::required();
        sig.excluded = Self::excluded();
        sig.required.sort();
        sig.required.dedup();
        sig.excluded.sort();
        sig.excluded.dedup();
        sig
    }
}

/// Trait for fetching component data from a matched archetype.
///
/// `prepare` resolves column pointers once per archetype; `fetch` walks
/// rows against that state.
///
/// # Safety
/// Implementations must only hand out items for rows that exist in the
/// archetype `prepare` ran against, and the returned state must stay
/// valid while that archetype's topology is unchanged.
pub unsafe trait QueryFetch: QueryFilter {
    /// The data yielded per row
    type Item<'w>;
    /// Per-archetype state (column pointers)
    type State;

    /// Prepare to fetch from an archetype
    fn prepare(archetype: &mut Archetype) -> Option<Self::State>;

    /// Fetch data for a specific row
    ///
    /// # Safety
    /// - `row` must be valid for the archetype used in `prepare`
    /// - the archetype must outlive `'w` and not change shape meanwhile
    unsafe fn fetch<'w>(state: &mut Self::State, row: usize) -> Option<Self::Item<'w>>;
}

// ---- include positions ----

impl<'a, T: Component> QueryFilter for &'a T {
    fn matches_archetype(archetype: &Archetype) -> bool {
        archetype.column_index(TypeId::of::<T>()).is_some()
    }

    fn required() -> SmallVec<[TypeId; MAX_FILTER_COMPONENTS]> {
        smallvec![TypeId::of::<T>()]
    }
}

unsafe impl<'a, T: Component> QueryFetch for &'a T {
    type Item<'w> = &'w T;
    type State = *const ComponentColumn;

    fn prepare(archetype: &mut Archetype) -> Option<Self::State> {
        archetype
            .column(TypeId::of::<T>())
            .map(|col| col as *const ComponentColumn)
    }

    unsafe fn fetch<'w>(state: &mut Self::State, row: usize) -> Option<Self::Item<'w>> {
        // SAFETY: the column pointer is valid for 'w per the trait contract
        let column = unsafe { &**state };
        column.get::<T>(row)
    }
}

impl<'a, T: Component> QueryFilter for &'a mut T {
    fn matches_archetype(archetype: &Archetype) -> bool {
        archetype.column_index(TypeId::of::<T>()).is_some()
    }

    fn required() -> SmallVec<[TypeId; MAX_FILTER_COMPONENTS]> {
        smallvec![TypeId::of::<T>()]
    }
}

unsafe impl<'a, T: Component> QueryFetch for &'a mut T {
    type Item<'w> = &'w mut T;
    type State = *mut ComponentColumn;

    fn prepare(archetype: &mut Archetype) -> Option<Self::State> {
        archetype
            .column_mut(TypeId::of::<T>())
            .map(|col| col as *mut ComponentColumn)
    }

    unsafe fn fetch<'w>(state: &mut Self::State, row: usize) -> Option<Self::Item<'w>> {
        // SAFETY: rows are visited once per iteration, so no two items
        // alias the same component
        let column = unsafe { &mut **state };
        column.get_mut::<T>(row)
    }
}

impl<'a, T: Component> QueryFilter for Option<&'a T> {
    fn matches_archetype(_archetype: &Archetype) -> bool {
        true
    }

    fn required() -> SmallVec<[TypeId; MAX_FILTER_COMPONENTS]> {
        SmallVec::new()
    }
}

unsafe impl<'a, T: Component> QueryFetch for Option<&'a T> {
    type Item<'w> = Option<&'w T>;
    type State = Option<*const ComponentColumn>;

    fn prepare(archetype: &mut Archetype) -> Option<Self::State> {
        Some(
            archetype
                .column(TypeId::of::<T>())
                .map(|col| col as *const ComponentColumn),
        )
    }

    unsafe fn fetch<'w>(state: &mut Self::State, row: usize) -> Option<Self::Item<'w>> {
        // Absent column means "absent" for every row of this archetype
        match *state {
            Some(column) => Some(unsafe { &*column }.get::<T>(row)),
            None => Some(None),
        }
    }
}

impl<'a, T: Component> QueryFilter for Option<&'a mut T> {
    fn matches_archetype(_archetype: &Archetype) -> bool {
        true
    }

    fn required() -> SmallVec<[TypeId; MAX_FILTER_COMPONENTS]> {
        SmallVec::new()
    }
}

unsafe impl<'a, T: Component> QueryFetch for Option<&'a mut T> {
    type Item<'w> = Option<&'w mut T>;
    type State = Option<*mut ComponentColumn>;

    fn prepare(archetype: &mut Archetype) -> Option<Self::State> {
        Some(
            archetype
                .column_mut(TypeId::of::<T>())
                .map(|col| col as *mut ComponentColumn),
        )
    }

    unsafe fn fetch<'w>(state: &mut Self::State, row: usize) -> Option<Self::Item<'w>> {
        match *state {
            Some(column) => Some(unsafe { &mut *column }.get_mut::<T>(row)),
            None => Some(None),
        }
    }
}

// The entity handle itself is a fetchable position:
// `world.query::<(Entity, &Health)>()`
impl QueryFilter for Entity {
    fn matches_archetype(_archetype: &Archetype) -> bool {
        true // all archetypes have entities
    }

    fn required() -> SmallVec<[TypeId; MAX_FILTER_COMPONENTS]> {
        SmallVec::new()
    }
}

unsafe impl QueryFetch for Entity {
    type Item<'w> = Entity;
    type State = *const [Entity];

    fn prepare(archetype: &mut Archetype) -> Option<Self::State> {
        Some(archetype.entities() as *const [Entity])
    }

    unsafe fn fetch<'w>(state: &mut Self::State, row: usize) -> Option<Self::Item<'w>> {
        // SAFETY: the entity slice stays in place while the query runs
        let slice = unsafe { &**state };
        slice.get(row).copied()
    }
}

// ---- filter positions ----

/// Require component T without fetching it
pub struct With<T: Component>(PhantomData<T>);

impl<T: Component> QueryFilter for With<T> {
    fn matches_archetype(archetype: &Archetype) -> bool {
        archetype.column_index(TypeId::of::<T>()).is_some()
    }

    fn required() -> SmallVec<[TypeId; MAX_FILTER_COMPONENTS]> {
        smallvec![TypeId::of::<T>()]
    }
}

/// Exclude archetypes containing component T
pub struct Without<T: Component>(PhantomData<T>);

impl<T: Component> QueryFilter for Without<T> {
    fn matches_archetype(archetype: &Archetype) -> bool {
        archetype.column_index(TypeId::of::<T>()).is_none()
    }

    fn required() -> SmallVec<[TypeId; MAX_FILTER_COMPONENTS]> {
        SmallVec::new()
    }

    fn excluded() -> SmallVec<[TypeId; MAX_FILTER_COMPONENTS]> {
        smallvec![TypeId::of::<T>()]
    }
}

impl QueryFilter for () {
    fn matches_archetype(_archetype: &Archetype) -> bool {
        true
    }

    fn required() -> SmallVec<[TypeId; MAX_FILTER_COMPONENTS]> {
        SmallVec::new()
    }
}

// Implement QueryFilter for tuples
macro_rules! impl_query_filter {
    ($($T:ident),+) => {
        impl<$($T: QueryFilter),+> QueryFilter for ($($T,)+) {
            fn matches_archetype(archetype: &Archetype) -> bool {
                $($T::matches_archetype(archetype))&&+
            }

            fn required() -> SmallVec<[TypeId; MAX_FILTER_COMPONENTS]> {
                let mut ids = SmallVec::new();
                $(ids.extend($T::required());)+
                ids
            }

            fn excluded() -> SmallVec<[TypeId; MAX_FILTER_COMPONENTS]> {
                let mut ids = SmallVec::new();
                $(ids.extend($T::excluded());)+
                ids
            }
        }
    };
}

impl_query_filter!(A);
impl_query_filter!(A, B);
impl_query_filter!(A, B, C);
impl_query_filter!(A, B, C, D);
impl_query_filter!(A, B, C, D, E);
impl_query_filter!(A, B, C, D, E, F);
impl_query_filter!(A, B, C, D, E, F, G);
impl_query_filter!(A, B, C, D, E, F, G, H);

// Implement QueryFetch for tuples of fetchable positions
macro_rules! impl_query_fetch {
    ($($T:ident),+) => {
        #[allow(non_snake_case)]
        unsafe impl<$($T: QueryFetch),+> QueryFetch for ($($T,)+) {
            type Item<'w> = ($($T::Item<'w>,)+);
            type State = ($($T::State,)+);

            fn prepare(archetype: &mut Archetype) -> Option<Self::State> {
                // SAFETY: each position resolves a distinct column (or the
                // entity list); the aliased archetype pointer is only used
                // to look up those disjoint parts.
                let ptr = archetype as *mut Archetype;
                Some(($($T::prepare(unsafe { &mut *ptr })?,)+))
            }

            unsafe fn fetch<'w>(state: &mut Self::State, row: usize) -> Option<Self::Item<'w>> {
                let ($($T,)+) = state;
                Some(($($T::fetch($T, row)?,)+))
            }
        }
    };
}

impl_query_fetch!(A);
impl_query_fetch!(A, B);
impl_query_fetch!(A, B, C);
impl_query_fetch!(A, B, C, D);
impl_query_fetch!(A, B, C, D, E);
impl_query_fetch!(A, B, C, D, E, F);
impl_query_fetch!(A, B, C, D, E, F, G);
impl_query_fetch!(A, B, C, D, E, F, G, H);

/// Typed view over every entity whose archetype matches the include set
/// `Q` and the filter set `F`.
///
/// Component data reached through the yielded references may be mutated
/// freely; structural changes must go through `Commands`.
pub struct Query<'w, Q: QueryFetch, F: QueryFilter = ()> {
    world: &'w mut World,
    matches: Vec<usize>,
    _phantom: PhantomData<fn() -> (Q, F)>,
}

impl<'w, Q: QueryFetch, F: QueryFilter> Query<'w, Q, F> {
    /// Create query using the world's archetype-match cache
    pub(crate) fn new(world: &'w mut World) -> Self {
        let signature = Q::signature().merge(F::signature());
        let matches = world.cached_match_indices(&signature);
        Self {
            world,
            matches,
            _phantom: PhantomData,
        }
    }

    /// Create query over a precomputed match list
    pub(crate) fn with_matches(world: &'w mut World, matches: Vec<usize>) -> Self {
        Self {
            world,
            matches,
            _phantom: PhantomData,
        }
    }

    /// Iterate matching rows
    pub fn iter(&mut self) -> QueryIter<'_, Q, F> {
        QueryIter::new(self.world, &self.matches)
    }

    /// Count matching entities without fetching
    pub fn count(&self) -> usize {
        self.matches
            .iter()
            .filter_map(|&id| self.world.archetype(id))
            .map(Archetype::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

impl<'w, Q: QueryFetch, F: QueryFilter> IntoIterator for Query<'w, Q, F> {
    type Item = Q::Item<'w>;
    type IntoIter = QueryIter<'w, Q, F>;

    fn into_iter(self) -> Self::IntoIter {
        QueryIter::new(self.world, &self.matches)
    }
}

/// Row iterator over matched archetypes
pub struct QueryIter<'w, Q: QueryFetch, F: QueryFilter = ()> {
    archetypes: Vec<NonNull<Archetype>>,
    archetype_index: usize,
    row: usize,
    state: Option<Q::State>,
    _phantom: PhantomData<(&'w mut World, fn() -> (Q, F))>,
}

impl<'w, Q: QueryFetch, F: QueryFilter> QueryIter<'w, Q, F> {
    fn new(world: &'w mut World, matched: &[usize]) -> Self {
        let mut archetypes = Vec::with_capacity(matched.len());
        for &id in matched {
            if let Some(ptr) = world.archetype_ptr_mut(id) {
                archetypes.push(ptr);
            }
        }

        Self {
            archetypes,
            archetype_index: 0,
            row: 0,
            state: None,
            _phantom: PhantomData,
        }
    }
}

impl<'w, Q: QueryFetch, F: QueryFilter> Iterator for QueryIter<'w, Q, F> {
    type Item = Q::Item<'w>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            // Acquire state for the current archetype if we don't have one
            if self.state.is_none() {
                if self.archetype_index >= self.archetypes.len() {
                    return None;
                }

                let ptr = self.archetypes[self.archetype_index].as_ptr();
                // SAFETY: pointer valid from World for 'w
                self.state = Q::prepare(unsafe { &mut *ptr });
                self.row = 0;

                if self.state.is_none() {
                    self.archetype_index += 1;
                    continue;
                }
            }

            let ptr = self.archetypes[self.archetype_index].as_ptr();
            let archetype = unsafe { &*ptr };

            if self.row >= archetype.len() {
                // Archetype exhausted, move next
                self.state = None;
                self.archetype_index += 1;
                continue;
            }

            let row = self.row;
            self.row += 1;

            // SAFETY: bounds checked above, state valid for this archetype
            if let Some(item) = unsafe { Q::fetch(self.state.as_mut().unwrap(), row) } {
                return Some(item);
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.len();
        (len, Some(len))
    }
}

impl<'w, Q: QueryFetch, F: QueryFilter> ExactSizeIterator for QueryIter<'w, Q, F> {
    fn len(&self) -> usize {
        if self.archetype_index >= self.archetypes.len() {
            return 0;
        }

        let mut count = 0;

        let current_ptr = self.archetypes[self.archetype_index].as_ptr();
        // SAFETY: all pointers in self.archetypes are valid for 'w
        let current = unsafe { &*current_ptr };
        count += current.len().saturating_sub(self.row);

        for archetype_ptr in self.archetypes.iter().skip(self.archetype_index + 1) {
            let archetype = unsafe { &*archetype_ptr.as_ptr() };
            count += archetype.len();
        }

        count
    }
}

/// Cached query state
///
/// Pre-computes which archetypes match the query and updates
/// incrementally as new archetypes appear. Systems keep one of these per
/// query parameter so matching cost is paid once per new archetype, not
/// once per call.
pub struct QueryState<Q: QueryFilter, F: QueryFilter = ()> {
    matches: Vec<usize>,
    seen_archetypes: usize,
    signature: QuerySignature,
    _phantom: PhantomData<fn() -> (Q, F)>,
}

impl<Q: QueryFilter, F: QueryFilter> QueryState<Q, F> {
    /// Create query state by scanning the world's archetypes once
    pub fn new(world: &World) -> Self {
        let signature = Q::signature().merge(F::signature());
        let matches = world
            .archetypes()
            .iter()
            .enumerate()
            .filter_map(|(id, arch)| signature.matches(arch).then_some(id))
            .collect();

        Self {
            matches,
            seen_archetypes: world.archetype_count(),
            signature,
            _phantom: PhantomData,
        }
    }

    /// Incrementally pick up archetypes created since the last call
    pub fn update(&mut self, world: &World) {
        let count = world.archetype_count();
        if count > self.seen_archetypes {
            for (id, arch) in world
                .archetypes()
                .iter()
                .enumerate()
                .skip(self.seen_archetypes)
            {
                if self.signature.matches(arch) {
                    self.matches.push(id);
                }
            }
            self.seen_archetypes = count;
        }
    }

    /// Matched archetype indices
    pub fn matches(&self) -> &[usize] {
        &self.matches
    }

    pub fn match_count(&self) -> usize {
        self.matches.len()
    }
}
