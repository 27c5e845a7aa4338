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

//! Archetype ECS with a stage-ordered scheduler.
//!
//! Entities live in archetypes (one storage block per component-type
//! set), queries filter archetypes by include/exclude signatures, systems
//! are plain functions with parameters resolved from the world, and a
//! single-threaded scheduler runs them in integer-stage order with state
//! transitions and deferred commands.

pub mod archetype;
pub mod command;
pub mod component;
pub mod entity;
pub mod error;
pub mod event;
pub mod params;
pub mod query;
pub mod relation;
pub mod schedule;
pub mod storage;
pub mod system;
pub mod world;

// Re-exports for convenience
pub use archetype::{Archetype, ArchetypeSignature, ComponentColumn};
pub use command::{CommandBuffer, Commands, EntityCommands};
pub use component::{Bundle, Component};
pub use entity::Entity;
pub use error::{EcsError, Result};
pub use event::{Event, EventStore};
pub use params::{
    EventReader, EventWriter, Local, NextState, OnAdded, OnRemoved, Relations, Res, Single, State,
};
pub use query::{Query, QueryFetch, QueryFilter, QueryState, With, Without};
pub use relation::{Relation, RelationManager};
pub use schedule::{
    in_state, on_enter, on_exit, stage, stage_id, ActiveState, Scheduler, StageInfo, StageLabel,
    StateStore, States,
};
pub use storage::ArchetypeStorage;
pub use system::{
    pipe, run_if, BoxedSystem, FunctionSystem, In, IntoSystem, System, SystemParam,
};
pub use world::World;

#[cfg(test)]
mod tests;
