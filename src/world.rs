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

//! World: the façade over entity allocation, archetype storage,
//! resources and relations.
//!
//! Structural invariant upheld by every path here: a live entity has
//! exactly one (archetype, row) location, that row stores the entity, and
//! the sparse index agrees. Swap-removes propagate the moved entity's new
//! row before the mutation returns.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::ptr::NonNull;

use ahash::AHashMap;

#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::archetype::Archetype;
use crate::component::{Bundle, Component};
use crate::entity::{Entity, EntityAllocator, EntityLocation};
use crate::error::{EcsError, Result};
use crate::query::{CachedQueryResult, Query, QueryFetch, QueryFilter, QuerySignature};
use crate::relation::{Relation, RelationManager};
use crate::storage::{ArchetypeStorage, EMPTY_ARCHETYPE};

/// Structural delta direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StructuralKind {
    Added,
    Removed,
}

#[derive(Debug, Clone, Copy)]
struct StructuralRecord {
    type_id: TypeId,
    entity: Entity,
    kind: StructuralKind,
}

/// Append-only log of component add/remove deltas. `OnAdded<T>` and
/// `OnRemoved<T>` parameters snapshot the tail past their per-system
/// cursor.
#[derive(Default)]
struct StructuralLog {
    records: Vec<StructuralRecord>,
}

impl StructuralLog {
    fn record(&mut self, type_id: TypeId, entity: Entity, kind: StructuralKind) {
        self.records.push(StructuralRecord {
            type_id,
            entity,
            kind,
        });
    }

    fn since(&self, cursor: usize, type_id: TypeId, kind: StructuralKind) -> Vec<Entity> {
        let start = cursor.min(self.records.len());
        self.records[start..]
            .iter()
            .filter(|record| record.type_id == type_id && record.kind == kind)
            .map(|record| record.entity)
            .collect()
    }
}

/// Central ECS world holding all entities, components and resources
pub struct World {
    allocator: EntityAllocator,
    storage: ArchetypeStorage,

    /// Typed resources (singletons), one value per type
    resources: AHashMap<TypeId, Box<dyn Any + Send + Sync>>,

    /// Directed typed links between entities
    relations: RelationManager,

    /// Component add/remove deltas for OnAdded/OnRemoved snapshots
    structural: StructuralLog,

    /// Query match cache keyed by query signature
    query_cache: RefCell<AHashMap<QuerySignature, CachedQueryResult>>,
}

impl World {
    /// Create a new, empty world
    pub fn new() -> Self {
        Self {
            allocator: EntityAllocator::new(),
            storage: ArchetypeStorage::new(),
            resources: AHashMap::new(),
            relations: RelationManager::new(),
            structural: StructuralLog::default(),
            // Most apps run well under a hundred distinct queries
            query_cache: RefCell::new(AHashMap::with_capacity(32)),
        }
    }

    // ========== Entity lifecycle ==========

    /// Spawn a new entity with the given bundle of components
    pub fn spawn<B: Bundle>(&mut self, bundle: B) -> Entity {
        let entity = self.allocator.allocate();
        let signature = B::signature();

        #[cfg(feature = "profiling")]
        let span = info_span!(
            "world.spawn",
            bundle_components = signature.len(),
            archetype_count = self.storage.archetype_count()
        );
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let archetype_id = self
            .storage
            .get_or_create_with(&signature, |archetype| B::register_components(archetype));

        let archetype = self.storage.archetype_unchecked_mut(archetype_id);
        let row = archetype.allocate_row(entity);
        // SAFETY: the archetype was created from the bundle's signature
        // and the row is fresh
        unsafe {
            bundle.write_row(archetype, row);
        }

        self.storage
            .set_location(entity.id(), EntityLocation { archetype_id, row });
        for &type_id in signature.types() {
            self.structural
                .record(type_id, entity, StructuralKind::Added);
        }

        entity
    }

    /// Spawn an entity with no components; it lives in the empty archetype
    pub fn spawn_empty(&mut self) -> Entity {
        let entity = self.allocator.allocate();
        let archetype = self.storage.archetype_unchecked_mut(EMPTY_ARCHETYPE);
        let row = archetype.allocate_row(entity);
        self.storage.set_location(
            entity.id(),
            EntityLocation {
                archetype_id: EMPTY_ARCHETYPE,
                row,
            },
        );
        entity
    }

    /// Spawn `count` entities carrying copies of the same bundle,
    /// inserted contiguously into one archetype
    pub fn spawn_batch<B: Bundle + Clone>(&mut self, count: usize, bundle: B) -> Vec<Entity> {
        let signature = B::signature();
        let archetype_id = self
            .storage
            .get_or_create_with(&signature, |archetype| B::register_components(archetype));

        let mut entities = Vec::with_capacity(count);
        {
            let archetype = self.storage.archetype_unchecked_mut(archetype_id);
            archetype.reserve_rows(count);
        }

        for _ in 0..count {
            let entity = self.allocator.allocate();
            let archetype = self.storage.archetype_unchecked_mut(archetype_id);
            let row = archetype.allocate_row(entity);
            // SAFETY: as in spawn
            unsafe {
                bundle.clone().write_row(archetype, row);
            }
            self.storage
                .set_location(entity.id(), EntityLocation { archetype_id, row });
            for &type_id in signature.types() {
                self.structural
                    .record(type_id, entity, StructuralKind::Added);
            }
            entities.push(entity);
        }

        entities
    }

    /// Check if an entity handle refers to a live entity with a matching
    /// generation
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.allocator.generation(entity.id()) == Some(entity.generation())
            && self.storage.location(entity.id()).is_some()
    }

    /// Destroy an entity: relation cleanup, archetype swap-remove,
    /// sparse-index tombstone
    pub fn despawn(&mut self, entity: Entity) -> Result<()> {
        let location = self.location_of(entity)?;

        self.relations.remove_entity(entity);

        let type_ids: Vec<TypeId> = self.storage.archetypes()[location.archetype_id]
            .signature()
            .types()
            .to_vec();
        for type_id in type_ids {
            self.structural
                .record(type_id, entity, StructuralKind::Removed);
        }

        let archetype = self.storage.archetype_unchecked_mut(location.archetype_id);
        // SAFETY: location comes from the live sparse index
        let swapped = unsafe { archetype.remove_row(location.row) };
        if let Some(swapped_entity) = swapped {
            self.storage.set_location(swapped_entity.id(), location);
        }

        self.storage.clear_location(entity.id());
        self.allocator.retire(entity);
        Ok(())
    }

    // ========== Components ==========

    /// Add a component, migrating the entity to the archetype holding the
    /// enlarged signature. Adding an already present component overwrites
    /// it in place.
    pub fn add_component<T: Component>(&mut self, entity: Entity, component: T) -> Result<()> {
        let location = self.location_of(entity)?;
        let type_id = TypeId::of::<T>();
        if self.relations.is_reserved(type_id) {
            return Err(EcsError::ReservedComponentType);
        }

        let archetype = self.storage.archetype_unchecked_mut(location.archetype_id);
        if let Some(column) = archetype.column_mut(type_id) {
            column.replace(location.row, component);
            return Ok(());
        }

        let old_archetype = &self.storage.archetypes()[location.archetype_id];
        let new_signature = old_archetype.signature().with(type_id);

        // Capture empty column clones before touching the archetype list;
        // creating the destination may reallocate it.
        let mut columns_to_add = Vec::with_capacity(new_signature.len());
        for &existing in old_archetype.signature().types() {
            if let Some(column) = old_archetype.column(existing) {
                columns_to_add.push((existing, column.clone_empty()));
            }
        }

        let new_archetype_id = self.storage.get_or_create_with(&new_signature, |archetype| {
            for (existing, column) in columns_to_add {
                archetype.add_column_raw(existing, column);
            }
            archetype.register_component::<T>();
        });

        self.move_entity(entity, location, new_archetype_id, |archetype, row| {
            if let Some(column) = archetype.column_mut(type_id) {
                let ptr = column.get_ptr_mut(row) as *mut T;
                unsafe {
                    std::ptr::write(ptr, component);
                }
            }
        })?;

        self.structural
            .record(type_id, entity, StructuralKind::Added);
        Ok(())
    }

    /// Remove a component, migrating the entity to the shrunk archetype.
    /// Removing a component the entity does not have is a no-op.
    pub fn remove_component<T: Component>(&mut self, entity: Entity) -> Result<()> {
        let location = self.location_of(entity)?;
        let type_id = TypeId::of::<T>();
        if self.relations.is_reserved(type_id) {
            return Err(EcsError::ReservedComponentType);
        }

        let old_archetype = &self.storage.archetypes()[location.archetype_id];
        if !old_archetype.has_column(type_id) {
            return Ok(());
        }

        let new_signature = old_archetype.signature().without(type_id);
        let mut columns_to_add = Vec::with_capacity(new_signature.len());
        for &kept in new_signature.types() {
            if let Some(column) = old_archetype.column(kept) {
                columns_to_add.push((kept, column.clone_empty()));
            }
        }

        let new_archetype_id = self.storage.get_or_create_with(&new_signature, |archetype| {
            for (kept, column) in columns_to_add {
                archetype.add_column_raw(kept, column);
            }
        });

        self.move_entity(entity, location, new_archetype_id, |_, _| {})?;

        self.structural
            .record(type_id, entity, StructuralKind::Removed);
        Ok(())
    }

    /// Check if entity has a specific component
    pub fn has_component<T: Component>(&self, entity: Entity) -> Result<bool> {
        let location = self.location_of(entity)?;
        Ok(self.storage.archetypes()[location.archetype_id].has_column(TypeId::of::<T>()))
    }

    /// Immutable reference to a component, or `None` when absent
    pub fn get_component<T: Component>(&self, entity: Entity) -> Result<Option<&T>> {
        let location = self.location_of(entity)?;
        let archetype = &self.storage.archetypes()[location.archetype_id];
        Ok(archetype
            .column(TypeId::of::<T>())
            .and_then(|column| column.get::<T>(location.row)))
    }

    /// Mutable reference to a component, or `None` when absent
    pub fn get_component_mut<T: Component>(&mut self, entity: Entity) -> Result<Option<&mut T>> {
        let location = self.location_of(entity)?;
        let archetype = self.storage.archetype_unchecked_mut(location.archetype_id);
        Ok(archetype
            .column_mut(TypeId::of::<T>())
            .and_then(|column| column.get_mut::<T>(location.row)))
    }

    /// Type ids of every component on the entity, signature order
    pub fn component_types(&self, entity: Entity) -> Result<Vec<TypeId>> {
        let location = self.location_of(entity)?;
        Ok(self.storage.archetypes()[location.archetype_id]
            .signature()
            .types()
            .to_vec())
    }

    /// Internal: move entity between archetypes, copying the column
    /// intersection and dropping what the destination lacks
    fn move_entity<F>(
        &mut self,
        entity: Entity,
        old_location: EntityLocation,
        new_archetype_id: usize,
        on_new_location: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut Archetype, usize),
    {
        if old_location.archetype_id == new_archetype_id {
            return Ok(());
        }

        let (old_archetype, new_archetype) = self
            .storage
            .archetype_pair_mut(old_location.archetype_id, new_archetype_id);

        let new_row = new_archetype.allocate_row(entity);
        let new_types: Vec<TypeId> = new_archetype.signature().types().to_vec();
        let old_types: Vec<TypeId> = old_archetype.signature().types().to_vec();

        unsafe {
            // Copy the intersection byte-for-byte; ownership moves with
            // the bytes.
            for &type_id in &new_types {
                if let Some(old_column) = old_archetype.column_mut(type_id) {
                    if let Some(new_column) = new_archetype.column_mut(type_id) {
                        let size = old_column.item_size();
                        if size > 0 {
                            let src = old_column.get_ptr_mut(old_location.row);
                            let dst = new_column.get_ptr_mut(new_row);
                            std::ptr::copy_nonoverlapping(src, dst, size);
                        }
                    }
                }
            }

            // Values the destination has no column for stay behind and
            // must be destroyed here.
            for &type_id in &old_types {
                if !new_types.contains(&type_id) {
                    if let Some(column) = old_archetype.column_mut(type_id) {
                        column.drop_in_place(old_location.row);
                    }
                }
            }
        }

        on_new_location(new_archetype, new_row);

        // SAFETY: every value in the row was moved or dropped above
        let swapped = unsafe { old_archetype.forget_row(old_location.row) };

        if let Some(swapped_entity) = swapped {
            self.storage
                .set_location(swapped_entity.id(), old_location);
        }
        self.storage.set_location(
            entity.id(),
            EntityLocation {
                archetype_id: new_archetype_id,
                row: new_row,
            },
        );

        Ok(())
    }

    fn location_of(&self, entity: Entity) -> Result<EntityLocation> {
        if self.allocator.generation(entity.id()) != Some(entity.generation()) {
            return Err(EcsError::EntityNotAlive);
        }
        self.storage
            .location(entity.id())
            .ok_or(EcsError::EntityNotAlive)
    }

    // ========== Resources (singleton state) ==========

    /// Insert a resource, failing if one of this type already exists
    pub fn add_resource<R: Send + Sync + 'static>(&mut self, resource: R) -> Result<()> {
        let type_id = TypeId::of::<R>();
        if self.resources.contains_key(&type_id) {
            return Err(EcsError::ResourceAlreadyExists(type_id));
        }
        self.resources.insert(type_id, Box::new(resource));
        Ok(())
    }

    /// Insert a resource, replacing any existing value of the type
    pub fn insert_resource<R: Send + Sync + 'static>(&mut self, resource: R) {
        self.resources.insert(TypeId::of::<R>(), Box::new(resource));
    }

    /// Immutable reference to a resource
    pub fn resource<R: 'static>(&self) -> Option<&R> {
        self.resources
            .get(&TypeId::of::<R>())
            .and_then(|r| r.downcast_ref())
    }

    /// Mutable reference to a resource
    pub fn resource_mut<R: 'static>(&mut self) -> Option<&mut R> {
        self.resources
            .get_mut(&TypeId::of::<R>())
            .and_then(|r| r.downcast_mut())
    }

    /// Check if a resource exists
    pub fn has_resource<R: 'static>(&self) -> bool {
        self.resources.contains_key(&TypeId::of::<R>())
    }

    /// Remove a resource and return it
    pub fn remove_resource<R: 'static>(&mut self) -> Option<R> {
        self.resources
            .remove(&TypeId::of::<R>())
            .and_then(|r| r.downcast().ok())
            .map(|boxed| *boxed)
    }

    /// Type ids of all stored resources
    pub fn resource_type_ids(&self) -> Vec<TypeId> {
        self.resources.keys().copied().collect()
    }

    // ========== Relations ==========

    pub fn relations(&self) -> &RelationManager {
        &self.relations
    }

    pub fn relations_mut(&mut self) -> &mut RelationManager {
        &mut self.relations
    }

    /// Reserve a relation kind up front so the component API rejects it
    /// even before the first edge exists
    pub fn register_relation<K: Relation>(&mut self) {
        self.relations.register::<K>();
    }

    // ========== Queries ==========

    /// Query over the include set `Q`
    pub fn query<Q: QueryFetch>(&mut self) -> Query<'_, Q> {
        Query::new(self)
    }

    /// Query over the include set `Q` restricted by the filter set `F`
    pub fn query_filtered<Q: QueryFetch, F: QueryFilter>(&mut self) -> Query<'_, Q, F> {
        Query::new(self)
    }

    /// Matched archetype indices for a signature, cached incrementally
    pub(crate) fn cached_match_indices(&self, signature: &QuerySignature) -> Vec<usize> {
        let mut cache = self.query_cache.borrow_mut();
        if let Some(cached) = cache.get_mut(signature) {
            cached.update(self.storage.archetypes());
            return cached.matches.to_vec();
        }

        let cached = CachedQueryResult::new(signature.clone(), self.storage.archetypes());
        let matches = cached.matches.to_vec();
        cache.insert(signature.clone(), cached);
        matches
    }

    /// Drop all cached query match lists
    pub fn clear_query_cache(&self) {
        self.query_cache.borrow_mut().clear();
    }

    // ========== Introspection ==========

    /// Number of live entities
    pub fn entity_count(&self) -> usize {
        self.storage.live_count()
    }

    pub fn archetype_count(&self) -> usize {
        self.storage.archetype_count()
    }

    /// All archetypes, creation order
    pub fn archetypes(&self) -> &[Archetype] {
        self.storage.archetypes()
    }

    pub fn archetype(&self, id: usize) -> Option<&Archetype> {
        self.storage.archetype(id)
    }

    pub(crate) fn archetype_ptr_mut(&mut self, id: usize) -> Option<NonNull<Archetype>> {
        self.storage.archetype_ptr_mut(id)
    }

    // ========== Structural deltas ==========

    pub(crate) fn structural_len(&self) -> usize {
        self.structural.records.len()
    }

    pub(crate) fn structural_since(
        &self,
        cursor: usize,
        type_id: TypeId,
        kind: StructuralKind,
    ) -> Vec<Entity> {
        self.structural.since(cursor, type_id, kind)
    }

    /// Forget accumulated add/remove deltas. Readers whose cursor points
    /// past the truncated log see an empty snapshot next run.
    pub fn clear_structural_log(&mut self) {
        self.structural.records.clear();
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Velocity {
        x: f32,
        y: f32,
    }

    struct ChildOf;
    impl Relation for ChildOf {
        const EXCLUSIVE: bool = true;
    }

    #[test]
    fn test_spawn_despawn() -> Result<()> {
        let mut world = World::new();

        let entity = world.spawn((Position { x: 1.0, y: 2.0 },));
        assert!(world.is_alive(entity));
        assert_eq!(world.entity_count(), 1);

        world.despawn(entity)?;
        assert!(!world.is_alive(entity));
        assert_eq!(world.entity_count(), 0);

        // Double despawn fails
        assert_eq!(world.despawn(entity), Err(EcsError::EntityNotAlive));
        Ok(())
    }

    #[test]
    fn test_spawn_empty_lives_in_empty_archetype() -> Result<()> {
        let mut world = World::new();
        let entity = world.spawn_empty();
        assert!(world.is_alive(entity));
        assert!(world.component_types(entity)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_migration_preserves_data() -> Result<()> {
        let mut world = World::new();
        let entity = world.spawn((Position { x: 1.0, y: 2.0 },));

        assert!(world.has_component::<Position>(entity)?);
        assert!(!world.has_component::<Velocity>(entity)?);

        world.add_component(entity, Velocity { x: 3.0, y: 4.0 })?;
        assert!(world.has_component::<Position>(entity)?);
        assert!(world.has_component::<Velocity>(entity)?);
        assert_eq!(
            world.get_component::<Position>(entity)?,
            Some(&Position { x: 1.0, y: 2.0 })
        );
        Ok(())
    }

    #[test]
    fn test_add_then_remove_is_observably_noop() -> Result<()> {
        let mut world = World::new();
        let entity = world.spawn((Position { x: 0.0, y: 0.0 },));
        let before = world.component_types(entity)?;

        world.add_component(entity, Velocity { x: 1.0, y: 1.0 })?;
        world.remove_component::<Velocity>(entity)?;

        assert_eq!(world.component_types(entity)?, before);
        Ok(())
    }

    #[test]
    fn test_remove_absent_component_is_noop() -> Result<()> {
        let mut world = World::new();
        let entity = world.spawn((Position { x: 0.0, y: 0.0 },));
        world.remove_component::<Velocity>(entity)?;
        assert!(world.has_component::<Position>(entity)?);
        Ok(())
    }

    #[test]
    fn test_swap_remove_updates_moved_entity() -> Result<()> {
        let mut world = World::new();
        let e0 = world.spawn((Position { x: 0.0, y: 0.0 },));
        let e1 = world.spawn((Position { x: 1.0, y: 0.0 },));
        let e2 = world.spawn((Position { x: 2.0, y: 0.0 },));

        world.despawn(e0)?;
        assert!(world.is_alive(e1));
        assert!(world.is_alive(e2));
        assert_eq!(world.entity_count(), 2);

        // e2 was swapped into e0's row; its data must still resolve
        assert_eq!(
            world.get_component::<Position>(e2)?,
            Some(&Position { x: 2.0, y: 0.0 })
        );
        Ok(())
    }

    #[test]
    fn test_overwrite_existing_component_keeps_archetype() -> Result<()> {
        let mut world = World::new();
        let entity = world.spawn((Position { x: 1.0, y: 1.0 },));
        let archetypes_before = world.archetype_count();

        world.add_component(entity, Position { x: 9.0, y: 9.0 })?;
        assert_eq!(world.archetype_count(), archetypes_before);
        assert_eq!(
            world.get_component::<Position>(entity)?,
            Some(&Position { x: 9.0, y: 9.0 })
        );
        Ok(())
    }

    #[test]
    fn test_spawn_batch_is_contiguous() {
        let mut world = World::new();
        let entities = world.spawn_batch(3, (Position { x: 5.0, y: 5.0 },));
        assert_eq!(entities.len(), 3);
        assert_eq!(world.entity_count(), 3);

        // All rows share one archetype, insertion order
        let rows: Vec<usize> = entities
            .iter()
            .map(|&e| {
                world
                    .storage
                    .location(e.id())
                    .map(|location| location.row)
                    .unwrap()
            })
            .collect();
        assert_eq!(rows, vec![0, 1, 2]);
    }

    #[test]
    fn test_resource_singleton_contract() {
        let mut world = World::new();
        assert!(world.add_resource(42u32).is_ok());
        assert_eq!(world.resource::<u32>(), Some(&42));

        // Second add of the same type fails
        assert!(matches!(
            world.add_resource(7u32),
            Err(EcsError::ResourceAlreadyExists(_))
        ));

        *world.resource_mut::<u32>().unwrap() = 43;
        assert_eq!(world.remove_resource::<u32>(), Some(43));
        assert!(!world.has_resource::<u32>());
    }

    #[test]
    fn test_reserved_relation_types_rejected() {
        let mut world = World::new();
        world.register_relation::<ChildOf>();
        let entity = world.spawn((Position { x: 0.0, y: 0.0 },));

        assert_eq!(
            world.add_component(entity, ChildOf),
            Err(EcsError::ReservedComponentType)
        );
        assert_eq!(
            world.remove_component::<ChildOf>(entity),
            Err(EcsError::ReservedComponentType)
        );
    }

    #[test]
    fn test_despawn_cleans_relations() -> Result<()> {
        let mut world = World::new();
        let parent = world.spawn_empty();
        let child = world.spawn_empty();
        world.relations_mut().add::<ChildOf>(child, parent);

        world.despawn(parent)?;
        assert!(!world.relations().has::<ChildOf>(child, parent));
        assert_eq!(world.relations().parent::<ChildOf>(child), None);
        Ok(())
    }

    #[test]
    fn test_archetypes_never_share_signatures() {
        let mut world = World::new();
        world.spawn((Position { x: 0.0, y: 0.0 }, Velocity { x: 0.0, y: 0.0 }));
        world.spawn((Velocity { x: 0.0, y: 0.0 }, Position { x: 0.0, y: 0.0 }));

        // Same component set in a different order maps to one archetype
        assert_eq!(world.archetype_count(), 2); // empty + {Position, Velocity}
    }

    #[test]
    fn test_column_lengths_match_entity_counts() {
        let mut world = World::new();
        world.spawn_batch(4, (Position { x: 0.0, y: 0.0 },));

        for archetype in world.archetypes() {
            for &type_id in archetype.signature().types().to_vec().iter() {
                let column = archetype.column(type_id).unwrap();
                assert_eq!(column.len(), archetype.len());
            }
        }
    }
}
