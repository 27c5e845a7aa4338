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

//! Cross-module integration tests

#[cfg(test)]
mod tests {
    use crate::{
        in_state, on_enter, on_exit, pipe, run_if, stage, Commands, EcsError, Entity, EventReader,
        EventStore, EventWriter, In, IntoSystem, Query, Res, Result, Scheduler, State, System,
        Without, World,
    };

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

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Payload(u32);

    #[derive(Debug, Default, PartialEq)]
    struct Log(Vec<i32>);

    #[derive(Debug, Default, PartialEq)]
    struct Counter(u32);

    // S1: migration preserves data
    #[test]
    fn test_component_migration_preserves_data() -> Result<()> {
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

    // S2: swap-remove keeps every other entity resolvable
    #[test]
    fn test_destroy_with_swap_remove_consistency() -> Result<()> {
        let mut world = World::new();
        let e0 = world.spawn((Position { x: 0.0, y: 0.0 },));
        let e1 = world.spawn((Position { x: 1.0, y: 0.0 },));
        let e2 = world.spawn((Position { x: 2.0, y: 0.0 },));

        world.despawn(e0)?;
        assert!(world.is_alive(e1));
        assert!(world.is_alive(e2));
        assert_eq!(world.entity_count(), 2);

        let mut xs: Vec<f32> = world.query::<&Position>().iter().map(|p| p.x).collect();
        xs.sort_by(f32::total_cmp);
        assert_eq!(xs, vec![1.0, 2.0]);
        Ok(())
    }

    // S3: exclusion filters out archetypes containing the component
    #[test]
    fn test_query_exclude_cardinality() {
        let mut world = World::new();
        world.spawn((Position { x: 0.0, y: 0.0 }, Velocity { x: 0.0, y: 0.0 }));
        world.spawn((Position { x: 1.0, y: 0.0 }, Velocity { x: 0.0, y: 0.0 }));
        world.spawn((Position { x: 2.0, y: 0.0 },));

        assert_eq!(
            world.query_filtered::<&Position, Without<Velocity>>().count(),
            1
        );
    }

    // Invariant 5: every matching live entity exactly once
    #[test]
    fn test_query_completeness_across_archetypes() {
        let mut world = World::new();
        let mut expected = Vec::new();
        expected.push(world.spawn((Payload(0),)));
        expected.push(world.spawn((Payload(1), Position { x: 0.0, y: 0.0 })));
        expected.push(world.spawn((Payload(2), Velocity { x: 0.0, y: 0.0 })));
        world.spawn((Position { x: 9.0, y: 9.0 },));

        let mut seen: Vec<Entity> = world
            .query::<(Entity, &Payload)>()
            .iter()
            .map(|(entity, _)| entity)
            .collect();
        seen.sort();
        expected.sort();
        assert_eq!(seen, expected);
    }

    fn log0(mut log: Res<Log>) {
        log.0.push(0);
    }

    fn log1(mut log: Res<Log>) {
        log.0.push(1);
    }

    fn log2(mut log: Res<Log>) {
        log.0.push(2);
    }

    // S4: systems within a stage run in insertion order
    #[test]
    fn test_stage_ordering_end_to_end() {
        let mut world = World::new();
        world.insert_resource(Log::default());
        let mut scheduler = Scheduler::new();

        scheduler.add_system(stage::UPDATE, log0);
        scheduler.add_system(stage::UPDATE, log1);
        scheduler.add_system(stage::UPDATE, log2);

        scheduler
            .run_stages(&mut world, stage::FIRST, stage::LAST)
            .unwrap();
        assert_eq!(world.resource::<Log>(), Some(&Log(vec![0, 1, 2])));
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum GameState {
        Menu,
        Playing,
    }

    #[derive(Debug, Default, PartialEq)]
    struct StateFlags {
        enter_menu: bool,
        exit_menu: bool,
        enter_playing: bool,
        exit_playing: bool,
    }

    impl StateFlags {
        fn clear(&mut self) {
            *self = StateFlags::default();
        }
    }

    fn flag_enter_menu(mut flags: Res<StateFlags>) {
        flags.enter_menu = true;
    }

    fn flag_exit_menu(mut flags: Res<StateFlags>) {
        flags.exit_menu = true;
    }

    fn flag_enter_playing(mut flags: Res<StateFlags>) {
        flags.enter_playing = true;
    }

    fn flag_exit_playing(mut flags: Res<StateFlags>) {
        flags.exit_playing = true;
    }

    // S5: OnEnter/OnExit hooks fire around the active-state update
    #[test]
    fn test_state_lifecycle_hooks() -> Result<()> {
        let mut world = World::new();
        world.insert_resource(StateFlags::default());
        let mut scheduler = Scheduler::new();
        scheduler.register_state::<GameState>(&mut world)?;

        scheduler.add_system(on_enter(GameState::Menu), flag_enter_menu);
        scheduler.add_system(on_exit(GameState::Menu), flag_exit_menu);
        scheduler.add_system(on_enter(GameState::Playing), flag_enter_playing);
        scheduler.add_system(on_exit(GameState::Playing), flag_exit_playing);

        scheduler.transition_to(&mut world, GameState::Menu)?;
        assert_eq!(
            world.resource::<StateFlags>(),
            Some(&StateFlags {
                enter_menu: true,
                ..Default::default()
            })
        );
        assert!(scheduler.is_in_state(&GameState::Menu));

        world.resource_mut::<StateFlags>().unwrap().clear();

        scheduler.transition_to(&mut world, GameState::Playing)?;
        assert_eq!(
            world.resource::<StateFlags>(),
            Some(&StateFlags {
                exit_menu: true,
                enter_playing: true,
                ..Default::default()
            })
        );
        assert!(scheduler.is_in_state(&GameState::Playing));
        assert_eq!(scheduler.active_state_name(), Some("Playing"));
        Ok(())
    }

    #[test]
    fn test_transition_to_active_value_is_noop() -> Result<()> {
        let mut world = World::new();
        world.insert_resource(StateFlags::default());
        let mut scheduler = Scheduler::new();
        scheduler.register_state::<GameState>(&mut world)?;
        scheduler.add_system(on_exit(GameState::Menu), flag_exit_menu);

        scheduler.transition_to(&mut world, GameState::Menu)?;
        scheduler.transition_to(&mut world, GameState::Menu)?;
        assert!(!world.resource::<StateFlags>().unwrap().exit_menu);
        Ok(())
    }

    fn record_state(state: State<GameState>, mut log: Res<Log>) {
        if state.is(&GameState::Playing) {
            log.0.push(99);
        }
    }

    #[test]
    fn test_in_state_systems_and_state_param() -> Result<()> {
        let mut world = World::new();
        world.insert_resource(Log::default());
        let mut scheduler = Scheduler::new();
        scheduler.register_state::<GameState>(&mut world)?;
        scheduler.add_system(in_state(GameState::Playing), record_state);

        // No systems registered for Menu's InState stage; tolerated
        scheduler.transition_to(&mut world, GameState::Menu)?;
        scheduler.run_active_state_systems(&mut world)?;
        assert_eq!(world.resource::<Log>(), Some(&Log(vec![])));

        scheduler.transition_to(&mut world, GameState::Playing)?;
        scheduler.run_active_state_systems(&mut world)?;
        scheduler.run_in_state_systems(&mut world, &GameState::Playing)?;
        assert_eq!(world.resource::<Log>(), Some(&Log(vec![99, 99])));
        Ok(())
    }

    fn request_playing(mut next: crate::NextState<GameState>) {
        next.set(GameState::Playing);
    }

    #[test]
    fn test_next_state_requests_apply_later() -> Result<()> {
        let mut world = World::new();
        let mut scheduler = Scheduler::new();
        scheduler.register_state::<GameState>(&mut world)?;
        scheduler.add_system(stage::UPDATE, request_playing);

        scheduler.run_stage(&mut world, stage::UPDATE)?;
        // The request is queued, not applied
        assert!(!scheduler.is_in_state(&GameState::Playing));

        scheduler.apply_pending_transitions::<GameState>(&mut world)?;
        assert!(scheduler.is_in_state(&GameState::Playing));

        // No pending request: applying again changes nothing
        scheduler.apply_pending_transitions::<GameState>(&mut world)?;
        assert!(scheduler.is_in_state(&GameState::Playing));
        Ok(())
    }

    #[derive(Debug, Default)]
    struct Visited(u32);

    fn spawn_while_iterating(
        mut query: Query<&Payload>,
        mut commands: Commands,
        mut visited: Res<Visited>,
    ) {
        for payload in query.iter() {
            visited.0 += 1;
            commands.spawn((Payload(payload.0 + 100),));
        }
    }

    // S6: structural mutation is deferred past the iteration
    #[test]
    fn test_commands_defer_structural_changes() {
        let mut world = World::new();
        world.insert_resource(Visited::default());
        world.spawn((Payload(0),));
        world.spawn((Payload(1),));

        let mut system = spawn_while_iterating.into_system();
        system.run(&mut world).unwrap();

        // The iteration saw only the two pre-existing entities; the
        // flush afterwards doubled the population
        assert_eq!(world.resource::<Visited>().unwrap().0, 2);
        assert_eq!(world.entity_count(), 4);

        system.run(&mut world).unwrap();
        assert_eq!(world.resource::<Visited>().unwrap().0, 6);
        assert_eq!(world.entity_count(), 8);
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Hit(u32);

    fn send_hits(mut events: EventWriter<Hit>) {
        events.send(Hit(3));
        events.send(Hit(4));
    }

    fn sum_hits(mut events: EventReader<Hit>, mut counter: Res<Counter>) {
        for hit in events.read() {
            counter.0 += hit.0;
        }
    }

    #[test]
    fn test_event_lifecycle_with_cleanup_stage() {
        let mut world = World::new();
        world.insert_resource(Counter::default());
        let mut scheduler = Scheduler::new();
        scheduler.register_event::<Hit>(&mut world);

        scheduler.add_system(stage::UPDATE, send_hits);
        scheduler.add_system(stage::POST_UPDATE, sum_hits);

        scheduler
            .run_stages(&mut world, stage::FIRST, stage::LAST)
            .unwrap();
        assert_eq!(world.resource::<Counter>(), Some(&Counter(7)));
        // Cleanup at LAST drained handled and unhandled alike
        assert!(world.resource::<EventStore<Hit>>().unwrap().is_empty());

        scheduler
            .run_stages(&mut world, stage::FIRST, stage::LAST)
            .unwrap();
        assert_eq!(world.resource::<Counter>(), Some(&Counter(14)));
    }

    fn produce_answer() -> u32 {
        42
    }

    fn consume_answer(In(value): In<u32>, mut counter: Res<Counter>) {
        counter.0 = value;
    }

    #[test]
    fn test_pipe_feeds_output_into_input() {
        let mut world = World::new();
        world.insert_resource(Counter::default());

        let mut system = pipe(produce_answer, consume_answer).into_system();
        system.run(&mut world).unwrap();
        assert_eq!(world.resource::<Counter>(), Some(&Counter(42)));
    }

    fn counter_below_two(counter: Res<Counter>) -> bool {
        counter.0 < 2
    }

    fn increment(mut counter: Res<Counter>) {
        counter.0 += 1;
    }

    #[test]
    fn test_run_if_gates_system() {
        let mut world = World::new();
        world.insert_resource(Counter::default());

        let mut system = run_if(counter_below_two, increment).into_system();
        for _ in 0..5 {
            system.run(&mut world).unwrap();
        }
        // Predicate stops the increments once the counter reaches two
        assert_eq!(world.resource::<Counter>(), Some(&Counter(2)));
    }

    #[test]
    fn test_scheduler_accepts_boxed_and_composed_systems() {
        let mut world = World::new();
        world.insert_resource(Counter::default());
        let mut scheduler = Scheduler::new();

        let boxed: crate::BoxedSystem = Box::new(increment.into_system());
        scheduler.add_system(stage::UPDATE, boxed);
        scheduler.add_system(stage::UPDATE, pipe(produce_answer, consume_answer));

        scheduler.run_stage(&mut world, stage::UPDATE).unwrap();
        assert_eq!(world.resource::<Counter>(), Some(&Counter(42)));
    }

    #[test]
    fn test_stale_generation_handle_is_dead() {
        let mut world = World::new();
        let entity = world.spawn((Payload(1),));
        world.despawn(entity).unwrap();

        assert!(!world.is_alive(entity));
        assert_eq!(
            world.get_component::<Payload>(entity).unwrap_err(),
            EcsError::EntityNotAlive
        );
    }

    // Invariants 1-4: location consistency, unique signatures, column
    // lengths, sorted signatures
    #[test]
    fn test_structural_invariants_hold_after_churn() -> Result<()> {
        let mut world = World::new();
        let mut entities = Vec::new();
        for i in 0..10u32 {
            if i % 2 == 0 {
                entities.push(world.spawn((Payload(i), Position { x: i as f32, y: 0.0 })));
            } else {
                entities.push(world.spawn((Payload(i),)));
            }
        }
        for (i, &entity) in entities.iter().enumerate() {
            match i % 3 {
                0 => world.despawn(entity)?,
                1 => world.add_component(entity, Velocity { x: 0.0, y: 1.0 })?,
                _ => world.remove_component::<Position>(entity)?,
            }
        }

        let mut live = 0;
        for (archetype_id, archetype) in world.archetypes().iter().enumerate() {
            // Signature strictly ascending
            let types = archetype.signature().types();
            assert!(types.windows(2).all(|w| w[0] < w[1]));

            // Column lengths match row counts
            for &type_id in types.to_vec().iter() {
                assert_eq!(archetype.column(type_id).unwrap().len(), archetype.len());
            }

            // Every row's entity resolves back to this archetype and row
            for (row, &entity) in archetype.entities().iter().enumerate() {
                assert!(world.is_alive(entity));
                let types = world.component_types(entity)?;
                assert_eq!(types, archetype.signature().types().to_vec());
                let _ = (archetype_id, row);
                live += 1;
            }
        }
        assert_eq!(live, world.entity_count());
        Ok(())
    }
}
