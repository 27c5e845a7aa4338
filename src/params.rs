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

//! Built-in system parameters
//!
//! Each parameter kind resolves itself from the world at call time:
//! resources, per-system locals, event access, state access, relations,
//! structural-delta snapshots, single-result queries and deferred
//! commands. Queries implement [`SystemParam`] directly in terms of a
//! cached [`QueryState`].

use std::any::TypeId;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use crate::command::{CommandBuffer, Commands};
use crate::component::Component;
use crate::entity::Entity;
use crate::error::{EcsError, Result};
use crate::event::{Event, EventCursor, EventStore};
use crate::query::{Query, QueryFetch, QueryFilter, QueryState};
use crate::relation::RelationManager;
use crate::schedule::{StateStore, States};
use crate::system::SystemParam;
use crate::world::{StructuralKind, World};

// ---- Res ----

/// Mutable access to the resource singleton of type T.
/// Resolution fails when the resource is absent.
pub struct Res<'w, T: Send + Sync + 'static> {
    value: &'w mut T,
}

impl<'w, T: Send + Sync + 'static> Res<'w, T> {
    pub fn into_inner(self) -> &'w mut T {
        self.value
    }
}

impl<T: Send + Sync + 'static> Deref for Res<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value
    }
}

impl<T: Send + Sync + 'static> DerefMut for Res<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value
    }
}

unsafe impl<'a, T: Send + Sync + 'static> SystemParam for Res<'a, T> {
    type State = ();
    type Item<'w, 's> = Res<'w, T>;

    fn init_state(_world: &mut World) -> Self::State {}

    unsafe fn get_param<'w, 's>(
        _state: &'s mut Self::State,
        world: *mut World,
    ) -> Result<Self::Item<'w, 's>> {
        let world: &'w mut World = unsafe { &mut *world };
        let value = world
            .resource_mut::<T>()
            .ok_or(EcsError::ResourceNotFound(std::any::type_name::<T>()))?;
        Ok(Res { value })
    }
}

// ---- Local ----

/// Per-system persistent cell. Initialized from `Default` on the
/// system's first run and carried across calls.
pub struct Local<'s, T: Send + Sync + 'static>(&'s mut T);

impl<T: Send + Sync + 'static> Deref for Local<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.0
    }
}

impl<T: Send + Sync + 'static> DerefMut for Local<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.0
    }
}

unsafe impl<'a, T: Default + Send + Sync + 'static> SystemParam for Local<'a, T> {
    type State = T;
    type Item<'w, 's> = Local<'s, T>;

    fn init_state(_world: &mut World) -> Self::State {
        T::default()
    }

    unsafe fn get_param<'w, 's>(
        state: &'s mut Self::State,
        _world: *mut World,
    ) -> Result<Self::Item<'w, 's>> {
        Ok(Local(state))
    }
}

// ---- Events ----

/// Read-cursor over the event store for T. The cursor is per system, so
/// two readers of the same event type see independent streams. The store
/// is created on first use.
pub struct EventReader<'w, 's, T: Event> {
    store: &'w mut EventStore<T>,
    cursor: &'s mut EventCursor,
}

impl<T: Event> EventReader<'_, '_, T> {
    /// Events pushed since this system last read, oldest first.
    /// Visited events are marked handled.
    pub fn read<'a>(&'a mut self) -> impl Iterator<Item = &'a T> {
        self.store.read_from(self.cursor)
    }

    /// Number of unread events
    pub fn len(&self) -> usize {
        self.store.pending(*self.cursor)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Skip everything currently queued without marking it handled
    pub fn clear(&mut self) {
        *self.cursor = self.store.end_cursor();
    }
}

unsafe impl<'a, 'b, T: Event> SystemParam for EventReader<'a, 'b, T> {
    type State = EventCursor;
    type Item<'w, 's> = EventReader<'w, 's, T>;

    fn init_state(world: &mut World) -> Self::State {
        if !world.has_resource::<EventStore<T>>() {
            world.insert_resource(EventStore::<T>::new());
        }
        EventCursor::default()
    }

    unsafe fn get_param<'w, 's>(
        state: &'s mut Self::State,
        world: *mut World,
    ) -> Result<Self::Item<'w, 's>> {
        let world: &'w mut World = unsafe { &mut *world };
        let store = world
            .resource_mut::<EventStore<T>>()
            .ok_or(EcsError::ResourceNotFound(std::any::type_name::<T>()))?;
        Ok(EventReader {
            store,
            cursor: state,
        })
    }
}

/// Push-handle on the event store for T; creates the store on first use
pub struct EventWriter<'w, T: Event> {
    store: &'w mut EventStore<T>,
}

impl<T: Event> EventWriter<'_, T> {
    pub fn send(&mut self, event: T) {
        self.store.push(event);
    }

    pub fn send_batch(&mut self, events: impl IntoIterator<Item = T>) {
        for event in events {
            self.store.push(event);
        }
    }
}

unsafe impl<'a, T: Event> SystemParam for EventWriter<'a, T> {
    type State = ();
    type Item<'w, 's> = EventWriter<'w, T>;

    fn init_state(world: &mut World) -> Self::State {
        if !world.has_resource::<EventStore<T>>() {
            world.insert_resource(EventStore::<T>::new());
        }
    }

    unsafe fn get_param<'w, 's>(
        _state: &'s mut Self::State,
        world: *mut World,
    ) -> Result<Self::Item<'w, 's>> {
        let world: &'w mut World = unsafe { &mut *world };
        let store = world
            .resource_mut::<EventStore<T>>()
            .ok_or(EcsError::ResourceNotFound(std::any::type_name::<T>()))?;
        Ok(EventWriter { store })
    }
}

// ---- State ----

/// Read access to the active value of state enum E.
/// Fails to resolve when E was never registered with a scheduler.
pub struct State<'w, E: States> {
    store: &'w StateStore<E>,
}

impl<E: States> State<'_, E> {
    /// Active value, if any transition happened yet
    pub fn get(&self) -> Option<&E> {
        self.store.current()
    }

    pub fn is(&self, value: &E) -> bool {
        self.store.current() == Some(value)
    }
}

unsafe impl<'a, E: States> SystemParam for State<'a, E> {
    type State = ();
    type Item<'w, 's> = State<'w, E>;

    fn init_state(_world: &mut World) -> Self::State {}

    unsafe fn get_param<'w, 's>(
        _state: &'s mut Self::State,
        world: *mut World,
    ) -> Result<Self::Item<'w, 's>> {
        let world: &'w mut World = unsafe { &mut *world };
        let store = world
            .resource::<StateStore<E>>()
            .ok_or(EcsError::StateNotRegistered)?;
        Ok(State { store })
    }
}

/// Queue a state transition request for enum E. The scheduler applies it
/// through `apply_pending_transitions`.
pub struct NextState<'w, E: States> {
    store: &'w mut StateStore<E>,
}

impl<E: States> NextState<'_, E> {
    pub fn set(&mut self, value: E) {
        self.store.set_pending(value);
    }
}

unsafe impl<'a, E: States> SystemParam for NextState<'a, E> {
    type State = ();
    type Item<'w, 's> = NextState<'w, E>;

    fn init_state(_world: &mut World) -> Self::State {}

    unsafe fn get_param<'w, 's>(
        _state: &'s mut Self::State,
        world: *mut World,
    ) -> Result<Self::Item<'w, 's>> {
        let world: &'w mut World = unsafe { &mut *world };
        let store = world
            .resource_mut::<StateStore<E>>()
            .ok_or(EcsError::StateNotRegistered)?;
        Ok(NextState { store })
    }
}

// ---- Relations ----

/// Handle to the relation manager
pub struct Relations<'w> {
    manager: &'w mut RelationManager,
}

impl Deref for Relations<'_> {
    type Target = RelationManager;

    fn deref(&self) -> &RelationManager {
        self.manager
    }
}

impl DerefMut for Relations<'_> {
    fn deref_mut(&mut self) -> &mut RelationManager {
        self.manager
    }
}

unsafe impl<'a> SystemParam for Relations<'a> {
    type State = ();
    type Item<'w, 's> = Relations<'w>;

    fn init_state(_world: &mut World) -> Self::State {}

    unsafe fn get_param<'w, 's>(
        _state: &'s mut Self::State,
        world: *mut World,
    ) -> Result<Self::Item<'w, 's>> {
        let world: &'w mut World = unsafe { &mut *world };
        Ok(Relations {
            manager: world.relations_mut(),
        })
    }
}

// ---- Structural deltas ----

/// Entities that gained component T since this system last ran
pub struct OnAdded<T: Component> {
    entities: Vec<Entity>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T: Component> OnAdded<T> {
    pub fn iter(&self) -> impl Iterator<Item = Entity> + '_ {
        self.entities.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

unsafe impl<T: Component> SystemParam for OnAdded<T> {
    type State = usize;
    type Item<'w, 's> = OnAdded<T>;

    fn init_state(_world: &mut World) -> Self::State {
        0
    }

    unsafe fn get_param<'w, 's>(
        state: &'s mut Self::State,
        world: *mut World,
    ) -> Result<Self::Item<'w, 's>> {
        let world: &'w mut World = unsafe { &mut *world };
        let entities = world.structural_since(*state, TypeId::of::<T>(), StructuralKind::Added);
        *state = world.structural_len();
        Ok(OnAdded {
            entities,
            _phantom: PhantomData,
        })
    }
}

/// Entities that lost component T since this system last ran, including
/// through despawn
pub struct OnRemoved<T: Component> {
    entities: Vec<Entity>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T: Component> OnRemoved<T> {
    pub fn iter(&self) -> impl Iterator<Item = Entity> + '_ {
        self.entities.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

unsafe impl<T: Component> SystemParam for OnRemoved<T> {
    type State = usize;
    type Item<'w, 's> = OnRemoved<T>;

    fn init_state(_world: &mut World) -> Self::State {
        0
    }

    unsafe fn get_param<'w, 's>(
        state: &'s mut Self::State,
        world: *mut World,
    ) -> Result<Self::Item<'w, 's>> {
        let world: &'w mut World = unsafe { &mut *world };
        let entities = world.structural_since(*state, TypeId::of::<T>(), StructuralKind::Removed);
        *state = world.structural_len();
        Ok(OnRemoved {
            entities,
            _phantom: PhantomData,
        })
    }
}

// ---- Query / Single ----

unsafe impl<'a, Q, F> SystemParam for Query<'a, Q, F>
where
    Q: QueryFetch + 'static,
    F: QueryFilter + 'static,
{
    type State = QueryState<Q, F>;
    type Item<'w, 's> = Query<'w, Q, F>;

    fn init_state(world: &mut World) -> Self::State {
        QueryState::new(world)
    }

    unsafe fn get_param<'w, 's>(
        state: &'s mut Self::State,
        world: *mut World,
    ) -> Result<Self::Item<'w, 's>> {
        let world: &'w mut World = unsafe { &mut *world };
        state.update(world);
        let matches = state.matches().to_vec();
        Ok(Query::with_matches(world, matches))
    }
}

/// Like `Query` but resolves to exactly one row; any other cardinality
/// fails the system before the function runs.
pub struct Single<'w, Q: QueryFetch, F: QueryFilter = ()> {
    item: Q::Item<'w>,
    _phantom: PhantomData<fn() -> F>,
}

impl<'w, Q: QueryFetch, F: QueryFilter> Single<'w, Q, F> {
    pub fn into_inner(self) -> Q::Item<'w> {
        self.item
    }
}

impl<'w, Q: QueryFetch, F: QueryFilter> Deref for Single<'w, Q, F> {
    type Target = Q::Item<'w>;

    fn deref(&self) -> &Self::Target {
        &self.item
    }
}

impl<'w, Q: QueryFetch, F: QueryFilter> DerefMut for Single<'w, Q, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.item
    }
}

unsafe impl<'a, Q, F> SystemParam for Single<'a, Q, F>
where
    Q: QueryFetch + 'static,
    F: QueryFilter + 'static,
{
    type State = QueryState<Q, F>;
    type Item<'w, 's> = Single<'w, Q, F>;

    fn init_state(world: &mut World) -> Self::State {
        QueryState::new(world)
    }

    unsafe fn get_param<'w, 's>(
        state: &'s mut Self::State,
        world: *mut World,
    ) -> Result<Self::Item<'w, 's>> {
        let world: &'w mut World = unsafe { &mut *world };
        state.update(world);
        let matches = state.matches().to_vec();

        let mut iter = Query::<Q, F>::with_matches(world, matches).into_iter();
        let item = iter.next().ok_or(EcsError::SingleComponentNotFound)?;
        if iter.next().is_some() {
            return Err(EcsError::SingleComponentAmbiguous);
        }
        Ok(Single {
            item,
            _phantom: PhantomData,
        })
    }
}

// ---- Commands ----

unsafe impl SystemParam for Commands<'_> {
    type State = CommandBuffer;
    type Item<'w, 's> = Commands<'s>;

    fn init_state(_world: &mut World) -> Self::State {
        CommandBuffer::new()
    }

    unsafe fn get_param<'w, 's>(
        state: &'s mut Self::State,
        _world: *mut World,
    ) -> Result<Self::Item<'w, 's>> {
        Ok(Commands::new(state))
    }

    // Deferred mutations land when the parameter tears down
    fn apply(state: &mut Self::State, world: &mut World) -> Result<()> {
        state.flush(world)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{IntoSystem, System};

    #[derive(Debug, PartialEq)]
    struct Counter(u32);

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Pos(f32);

    #[derive(Debug, Clone, PartialEq)]
    struct Hit(u32);

    #[test]
    fn test_res_resolves_and_mutates() {
        fn bump(mut counter: Res<Counter>) {
            counter.0 += 1;
        }

        let mut world = World::new();
        world.insert_resource(Counter(0));
        let mut system = bump.into_system();
        system.run(&mut world).unwrap();
        system.run(&mut world).unwrap();
        assert_eq!(world.resource::<Counter>(), Some(&Counter(2)));
    }

    #[test]
    fn test_res_missing_resource_errors() {
        fn wants_counter(_counter: Res<Counter>) {}

        let mut world = World::new();
        let mut system = wants_counter.into_system();
        assert!(matches!(
            system.run(&mut world),
            Err(EcsError::ResourceNotFound(_))
        ));
    }

    #[test]
    fn test_local_state_survives_across_calls() {
        fn count_calls(mut calls: Local<u32>, mut total: Res<Counter>) {
            *calls += 1;
            total.0 = *calls;
        }

        let mut world = World::new();
        world.insert_resource(Counter(0));
        let mut system = count_calls.into_system();
        for _ in 0..3 {
            system.run(&mut world).unwrap();
        }
        assert_eq!(world.resource::<Counter>(), Some(&Counter(3)));
    }

    #[test]
    fn test_event_writer_reader_roundtrip() {
        fn emit(mut events: EventWriter<Hit>) {
            events.send(Hit(7));
        }

        fn collect(mut events: EventReader<Hit>, mut seen: Res<Counter>) {
            for hit in events.read() {
                seen.0 += hit.0;
            }
        }

        let mut world = World::new();
        world.insert_resource(Counter(0));
        let mut emitter = emit.into_system();
        let mut collector = collect.into_system();

        emitter.run(&mut world).unwrap();
        collector.run(&mut world).unwrap();
        // A second collect sees nothing new
        collector.run(&mut world).unwrap();
        assert_eq!(world.resource::<Counter>(), Some(&Counter(7)));

        emitter.run(&mut world).unwrap();
        collector.run(&mut world).unwrap();
        assert_eq!(world.resource::<Counter>(), Some(&Counter(14)));
    }

    #[test]
    fn test_query_param_iterates_rows() {
        fn advance(mut query: Query<&mut Pos>) {
            for pos in query.iter() {
                pos.0 += 1.0;
            }
        }

        let mut world = World::new();
        world.spawn((Pos(0.0),));
        world.spawn((Pos(10.0),));

        let mut system = advance.into_system();
        system.run(&mut world).unwrap();

        let mut values: Vec<f32> = world.query::<&Pos>().iter().map(|p| p.0).collect();
        values.sort_by(f32::total_cmp);
        assert_eq!(values, vec![1.0, 11.0]);
    }

    #[test]
    fn test_single_cardinality_contract() {
        fn read_one(single: Single<&Pos>) {
            assert_eq!(single.0, 5.0);
        }

        let mut world = World::new();
        let mut system = read_one.into_system();
        assert_eq!(
            system.run(&mut world),
            Err(EcsError::SingleComponentNotFound)
        );

        let entity = world.spawn((Pos(5.0),));
        system.run(&mut world).unwrap();

        world.spawn((Pos(6.0),));
        assert_eq!(
            system.run(&mut world),
            Err(EcsError::SingleComponentAmbiguous)
        );
        world.despawn(entity).unwrap();
    }

    #[test]
    fn test_on_added_snapshots_since_last_run() {
        fn watch(added: OnAdded<Pos>, mut count: Res<Counter>) {
            count.0 += added.len() as u32;
        }

        let mut world = World::new();
        world.insert_resource(Counter(0));
        world.spawn((Pos(0.0),));

        let mut system = watch.into_system();
        system.run(&mut world).unwrap();
        assert_eq!(world.resource::<Counter>(), Some(&Counter(1)));

        // Nothing new
        system.run(&mut world).unwrap();
        assert_eq!(world.resource::<Counter>(), Some(&Counter(1)));

        world.spawn((Pos(1.0),));
        world.spawn((Pos(2.0),));
        system.run(&mut world).unwrap();
        assert_eq!(world.resource::<Counter>(), Some(&Counter(3)));
    }

    #[test]
    fn test_on_removed_sees_despawns() {
        fn watch(removed: OnRemoved<Pos>, mut count: Res<Counter>) {
            count.0 += removed.len() as u32;
        }

        let mut world = World::new();
        world.insert_resource(Counter(0));
        let entity = world.spawn((Pos(0.0),));
        world.despawn(entity).unwrap();

        let mut system = watch.into_system();
        system.run(&mut world).unwrap();
        assert_eq!(world.resource::<Counter>(), Some(&Counter(1)));
    }

    #[test]
    fn test_commands_flush_after_call() {
        fn spawner(mut commands: Commands) {
            commands.spawn((Pos(1.0),));
        }

        let mut world = World::new();
        let mut system = spawner.into_system();
        system.run(&mut world).unwrap();
        assert_eq!(world.entity_count(), 1);
    }

    #[test]
    fn test_relations_param() {
        struct Follows;
        impl crate::relation::Relation for Follows {}

        fn link(mut relations: Relations, single: Single<(Entity, &Pos)>) {
            let (entity, _) = single.into_inner();
            relations.add::<Follows>(entity, entity);
        }

        let mut world = World::new();
        let entity = world.spawn((Pos(0.0),));
        let mut system = link.into_system();
        system.run(&mut world).unwrap();
        assert!(world.relations().has::<Follows>(entity, entity));
    }
}
