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

//! Deferred world mutations
//!
//! Systems iterating queries must not change archetype topology, so all
//! structural operations are recorded here by value and replayed in
//! record order on flush. Entities spawned through a buffer exist only as
//! pending slots until the flush creates them; records referring to a
//! pending slot are resolved against the entity created for that slot.

#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::component::{Bundle, Component};
use crate::entity::Entity;
use crate::error::{EcsError, Result};
use crate::relation::Relation;
use crate::world::World;

/// Target of an entity-addressed command: a real handle or a pending
/// spawn slot resolved at flush time.
#[derive(Debug, Clone, Copy)]
enum CommandTarget {
    Existing(Entity),
    Pending(usize),
}

type SpawnFn = Box<dyn FnOnce(&mut World) -> Entity + Send + Sync>;
type EntityOp = Box<dyn FnOnce(&mut World, Entity) -> Result<()> + Send + Sync>;
type EdgeOp = Box<dyn FnOnce(&mut World, Entity, Entity) -> Result<()> + Send + Sync>;
type WorldOp = Box<dyn FnOnce(&mut World) -> Result<()> + Send + Sync>;

enum Command {
    Spawn { slot: usize, spawn: SpawnFn },
    Despawn(CommandTarget),
    OnEntity { target: CommandTarget, op: EntityOp },
    OnEdge {
        source: CommandTarget,
        target: CommandTarget,
        op: EdgeOp,
    },
    OnWorld(WorldOp),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Spawn { slot, .. } => f.debug_struct("Spawn").field("slot", slot).finish(),
            Command::Despawn(target) => f.debug_tuple("Despawn").field(target).finish(),
            Command::OnEntity { target, .. } => {
                f.debug_struct("OnEntity").field("target", target).finish()
            }
            Command::OnEdge { source, target, .. } => f
                .debug_struct("OnEdge")
                .field("source", source)
                .field("target", target)
                .finish(),
            Command::OnWorld(_) => write!(f, "OnWorld(...)"),
        }
    }
}

/// Ordered buffer of deferred commands
#[derive(Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
    pending: usize,
}

impl CommandBuffer {
    /// Create new command buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            commands: Vec::with_capacity(capacity),
            pending: 0,
        }
    }

    /// Queue a spawn; returns the pending slot the entity will fill
    pub fn spawn<B: Bundle>(&mut self, bundle: B) -> usize {
        let slot = self.pending;
        self.pending += 1;
        self.commands.push(Command::Spawn {
            slot,
            spawn: Box::new(move |world| world.spawn(bundle)),
        });
        slot
    }

    /// Queue a component-less spawn
    pub fn spawn_empty(&mut self) -> usize {
        let slot = self.pending;
        self.pending += 1;
        self.commands.push(Command::Spawn {
            slot,
            spawn: Box::new(|world| world.spawn_empty()),
        });
        slot
    }

    /// Queue despawn command
    pub fn despawn(&mut self, entity: Entity) {
        self.commands
            .push(Command::Despawn(CommandTarget::Existing(entity)));
    }

    /// Queue add component command
    pub fn add_component<T: Component>(&mut self, entity: Entity, component: T) {
        self.entity_op(
            CommandTarget::Existing(entity),
            Box::new(move |world, e| world.add_component(e, component)),
        );
    }

    /// Queue remove component command
    pub fn remove_component<T: Component>(&mut self, entity: Entity) {
        self.entity_op(
            CommandTarget::Existing(entity),
            Box::new(move |world, e| world.remove_component::<T>(e)),
        );
    }

    /// Queue resource insertion; fails at flush if the type is taken
    pub fn add_resource<R: Send + Sync + 'static>(&mut self, value: R) {
        self.commands.push(Command::OnWorld(Box::new(move |world| {
            world.add_resource(value)
        })));
    }

    /// Queue resource removal
    pub fn remove_resource<R: Send + Sync + 'static>(&mut self) {
        self.commands.push(Command::OnWorld(Box::new(|world| {
            world.remove_resource::<R>();
            Ok(())
        })));
    }

    /// Queue a relation edge
    pub fn add_relation<K: Relation>(&mut self, source: Entity, target: Entity) {
        self.edge_op::<K>(
            CommandTarget::Existing(source),
            CommandTarget::Existing(target),
            true,
        );
    }

    /// Queue removal of a relation edge
    pub fn remove_relation<K: Relation>(&mut self, source: Entity, target: Entity) {
        self.edge_op::<K>(
            CommandTarget::Existing(source),
            CommandTarget::Existing(target),
            false,
        );
    }

    fn entity_op(&mut self, target: CommandTarget, op: EntityOp) {
        self.commands.push(Command::OnEntity { target, op });
    }

    fn edge_op<K: Relation>(&mut self, source: CommandTarget, target: CommandTarget, add: bool) {
        self.commands.push(Command::OnEdge {
            source,
            target,
            op: Box::new(move |world, s, t| {
                if add {
                    world.relations_mut().add::<K>(s, t);
                } else {
                    world.relations_mut().remove::<K>(s, t);
                }
                Ok(())
            }),
        });
    }

    /// Apply all recorded commands against the world, strictly in record
    /// order. The first failing record aborts the flush; later records
    /// are discarded.
    pub fn flush(&mut self, world: &mut World) -> Result<()> {
        #[cfg(feature = "profiling")]
        let span = info_span!("commands.flush", queued = self.commands.len());
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let mut resolved: Vec<Option<Entity>> = vec![None; self.pending];
        self.pending = 0;

        for command in self.commands.drain(..) {
            match command {
                Command::Spawn { slot, spawn } => {
                    resolved[slot] = Some(spawn(world));
                }
                Command::Despawn(target) => {
                    world.despawn(resolve(target, &resolved)?)?;
                }
                Command::OnEntity { target, op } => {
                    op(world, resolve(target, &resolved)?)?;
                }
                Command::OnEdge { source, target, op } => {
                    op(
                        world,
                        resolve(source, &resolved)?,
                        resolve(target, &resolved)?,
                    )?;
                }
                Command::OnWorld(op) => op(world)?,
            }
        }
        Ok(())
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Get length
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Drop all queued commands without applying them
    pub fn clear(&mut self) {
        self.commands.clear();
        self.pending = 0;
    }
}

fn resolve(target: CommandTarget, resolved: &[Option<Entity>]) -> Result<Entity> {
    match target {
        CommandTarget::Existing(entity) => Ok(entity),
        CommandTarget::Pending(slot) => resolved
            .get(slot)
            .copied()
            .flatten()
            .ok_or_else(|| EcsError::CommandError("pending entity referenced before its spawn record".into())),
    }
}

/// System-facing view over a command buffer
pub struct Commands<'s> {
    buffer: &'s mut CommandBuffer,
}

impl<'s> Commands<'s> {
    pub(crate) fn new(buffer: &'s mut CommandBuffer) -> Self {
        Self { buffer }
    }

    /// Queue an entity spawn; returned handle accepts follow-up commands
    pub fn spawn<B: Bundle>(&mut self, bundle: B) -> EntityCommands<'_> {
        let slot = self.buffer.spawn(bundle);
        EntityCommands {
            buffer: &mut *self.buffer,
            target: CommandTarget::Pending(slot),
        }
    }

    /// Queue a component-less spawn
    pub fn spawn_empty(&mut self) -> EntityCommands<'_> {
        let slot = self.buffer.spawn_empty();
        EntityCommands {
            buffer: &mut *self.buffer,
            target: CommandTarget::Pending(slot),
        }
    }

    /// Address an existing entity
    pub fn entity(&mut self, entity: Entity) -> EntityCommands<'_> {
        EntityCommands {
            buffer: &mut *self.buffer,
            target: CommandTarget::Existing(entity),
        }
    }

    pub fn despawn(&mut self, entity: Entity) {
        self.buffer.despawn(entity);
    }

    pub fn add_component<T: Component>(&mut self, entity: Entity, component: T) {
        self.buffer.add_component(entity, component);
    }

    pub fn remove_component<T: Component>(&mut self, entity: Entity) {
        self.buffer.remove_component::<T>(entity);
    }

    pub fn add_resource<R: Send + Sync + 'static>(&mut self, value: R) {
        self.buffer.add_resource(value);
    }

    pub fn remove_resource<R: Send + Sync + 'static>(&mut self) {
        self.buffer.remove_resource::<R>();
    }

    pub fn add_relation<K: Relation>(&mut self, source: Entity, target: Entity) {
        self.buffer.add_relation::<K>(source, target);
    }

    pub fn remove_relation<K: Relation>(&mut self, source: Entity, target: Entity) {
        self.buffer.remove_relation::<K>(source, target);
    }
}

/// Commands scoped to one entity, existing or pending
pub struct EntityCommands<'a> {
    buffer: &'a mut CommandBuffer,
    target: CommandTarget,
}

impl EntityCommands<'_> {
    /// Queue a component insertion on this entity
    pub fn add<T: Component>(&mut self, component: T) -> &mut Self {
        self.buffer.entity_op(
            self.target,
            Box::new(move |world, e| world.add_component(e, component)),
        );
        self
    }

    /// Queue a component removal on this entity
    pub fn remove<T: Component>(&mut self) -> &mut Self {
        self.buffer.entity_op(
            self.target,
            Box::new(move |world, e| world.remove_component::<T>(e)),
        );
        self
    }

    /// Queue despawn of this entity
    pub fn despawn(&mut self) {
        self.buffer.commands.push(Command::Despawn(self.target));
    }

    /// Real handle of this entity.
    ///
    /// # Panics
    /// Panics for a pending entity: its handle does not exist until the
    /// buffer is flushed.
    pub fn entity(&self) -> Entity {
        match self.target {
            CommandTarget::Existing(entity) => entity,
            CommandTarget::Pending(slot) => {
                panic!("entity for pending spawn slot {slot} does not exist until flush")
            }
        }
    }
}
