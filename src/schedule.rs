//! Stage-ordered scheduler with integrated state machine.
//!
//! Stages are i32 buckets of systems. Predefined stages sit 100 000
//! apart so applications can insert between them; user stage types hash
//! into a reserved band at 2 000 000 and above. State-specialized stages
//! (OnEnter/OnExit/InState) hash the (enum type, variant name) pair into
//! three higher reserved bands, so `on_enter(GameState::Menu)` is an
//! ordinary stage id. Hash collisions inside a band merge the colliding
//! stages' behavior; with 64-bit inputs folded into a 100 000 000-wide
//! band that is accepted.
//!
//! Execution is single-threaded: systems run in insertion order within a
//! stage, stages run in ascending id order, and the first system error
//! aborts the current stage.

use std::any::TypeId;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use ahash::AHashSet;
use rustc_hash::FxHasher;

#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::error::{EcsError, Result};
use crate::event::{Event, EventStore};
use crate::params::Res;
use crate::system::{BoxedSystem, IntoSystem, System};
use crate::world::World;

/// Predefined stage ids, spaced 100 000 apart
pub mod stage {
    /// Lowest valid stage id
    pub const MIN: i32 = 0;
    /// One-off initialization work
    pub const STARTUP: i32 = 1_000;
    pub const FIRST: i32 = 100_000;
    pub const PRE_UPDATE: i32 = 200_000;
    pub const UPDATE: i32 = 300_000;
    pub const POST_UPDATE: i32 = 400_000;
    pub const LAST: i32 = 800_000;
    /// Highest valid stage id
    pub const MAX: i32 = i32::MAX;

    /// Hash-derived user stage types land at USER_BAND_BASE + hash % width
    pub(crate) const USER_BAND_BASE: i32 = 2_000_000;
    pub(crate) const USER_BAND_WIDTH: i32 = 100_000_000;

    pub(crate) const STATE_BAND_WIDTH: i32 = 100_000_000;
    pub(crate) const STATE_ON_EXIT_BASE: i32 = 1_000_000_000;
    pub(crate) const STATE_ON_ENTER_BASE: i32 = 1_100_000_000;
    pub(crate) const STATE_UPDATE_BASE: i32 = 1_200_000_000;
}

/// Application state enums usable with the scheduler's state machine
pub trait States: Send + Sync + Clone + PartialEq + std::fmt::Debug + 'static {}

impl<T: Send + Sync + Clone + PartialEq + std::fmt::Debug + 'static> States for T {}

/// World resource backing state access for one enum type.
/// Created by `Scheduler::register_state`.
pub struct StateStore<E: States> {
    current: Option<E>,
    pending: Option<E>,
}

impl<E: States> StateStore<E> {
    pub fn new() -> Self {
        Self {
            current: None,
            pending: None,
        }
    }

    /// Active value of this enum, if it is the scheduler's current state
    pub fn current(&self) -> Option<&E> {
        self.current.as_ref()
    }

    pub(crate) fn set_current(&mut self, value: E) {
        self.current = Some(value);
    }

    pub(crate) fn clear_current(&mut self) {
        self.current = None;
    }

    pub(crate) fn set_pending(&mut self, value: E) {
        self.pending = Some(value);
    }

    pub(crate) fn take_pending(&mut self) -> Option<E> {
        self.pending.take()
    }
}

impl<E: States> Default for StateStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Marker for user-defined stage types
pub trait StageLabel: 'static {
    /// Explicit stage id; hash-derived inside the user band when `None`
    fn priority() -> Option<i32> {
        None
    }
}

/// Stage id for a user stage type
pub fn stage_id<S: StageLabel>() -> i32 {
    match S::priority() {
        Some(priority) => priority,
        None => {
            let mut hasher = FxHasher::default();
            TypeId::of::<S>().hash(&mut hasher);
            stage::USER_BAND_BASE + (hasher.finish() % stage::USER_BAND_WIDTH as u64) as i32
        }
    }
}

/// Stage invoked when `value` becomes the active state
pub fn on_enter<E: States>(value: E) -> i32 {
    band_stage(stage::STATE_ON_ENTER_BASE, state_value_key(&value).0)
}

/// Stage invoked when `value` stops being the active state
pub fn on_exit<E: States>(value: E) -> i32 {
    band_stage(stage::STATE_ON_EXIT_BASE, state_value_key(&value).0)
}

/// Stage invoked by `run_in_state_systems` / `run_active_state_systems`
/// while `value` is active
pub fn in_state<E: States>(value: E) -> i32 {
    band_stage(stage::STATE_UPDATE_BASE, state_value_key(&value).0)
}

/// Combined hash over the enum type and the variant's debug name, plus
/// the name itself
fn state_value_key<E: States>(value: &E) -> (u64, String) {
    let name = format!("{value:?}");
    let mut hasher = FxHasher::default();
    TypeId::of::<E>().hash(&mut hasher);
    name.hash(&mut hasher);
    (hasher.finish(), name)
}

fn band_stage(base: i32, value_hash: u64) -> i32 {
    base + (value_hash % stage::STATE_BAND_WIDTH as u64) as i32
}

/// The scheduler's view of the active state value
#[derive(Clone)]
pub struct ActiveState {
    pub type_id: TypeId,
    pub value_hash: u64,
    pub name: String,
    clear_fn: fn(&mut World),
}

/// Diagnostic summary of one stage
#[derive(Debug, Clone)]
pub struct StageInfo {
    pub id: i32,
    pub system_count: usize,
    pub system_names: Vec<String>,
}

#[derive(Default)]
struct StageBucket {
    systems: Vec<BoxedSystem>,
}

/// Ordered bucket of systems keyed by integer stage id
pub struct Scheduler {
    stages: BTreeMap<i32, StageBucket>,
    registered_states: AHashSet<TypeId>,
    active_state: Option<ActiveState>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            stages: BTreeMap::new(),
            registered_states: AHashSet::new(),
            active_state: None,
        }
    }

    /// Register a stage id up front
    pub fn add_stage(&mut self, id: i32) -> Result<()> {
        if id < stage::MIN {
            return Err(EcsError::InvalidStageBounds(id));
        }
        if self.stages.contains_key(&id) {
            return Err(EcsError::StageExists(id));
        }
        self.stages.insert(id, StageBucket::default());
        Ok(())
    }

    /// Drop a stage and its systems; returns whether it existed
    pub fn remove_stage(&mut self, id: i32) -> bool {
        self.stages.remove(&id).is_some()
    }

    /// Append a system to a stage, registering the stage on first use.
    /// Accepts plain functions, typed systems and boxed handles.
    pub fn add_system<Marker>(&mut self, stage: i32, system: impl IntoSystem<Marker>) {
        self.stages
            .entry(stage)
            .or_default()
            .systems
            .push(Box::new(system.into_system()));
    }

    /// Run every system of a stage in insertion order. The first error
    /// aborts the stage and propagates; remaining systems are skipped.
    pub fn run_stage(&mut self, world: &mut World, stage: i32) -> Result<()> {
        let bucket = self
            .stages
            .get_mut(&stage)
            .ok_or(EcsError::StageHasNoSystems(stage))?;
        if bucket.systems.is_empty() {
            return Err(EcsError::StageHasNoSystems(stage));
        }

        #[cfg(feature = "profiling")]
        let span = info_span!("scheduler.run_stage", stage, systems = bucket.systems.len());
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        for system in &mut bucket.systems {
            system.run(world)?;
        }
        Ok(())
    }

    /// Run every registered stage with id in `[start, end]`, ascending
    pub fn run_stages(&mut self, world: &mut World, start: i32, end: i32) -> Result<()> {
        if start > end {
            return Ok(());
        }
        let ids: Vec<i32> = self.stages.range(start..=end).map(|(&id, _)| id).collect();
        for id in ids {
            self.run_stage(world, id)?;
        }
        Ok(())
    }

    /// Diagnostic info for a registered stage
    pub fn stage_info(&self, id: i32) -> Option<StageInfo> {
        self.stages.get(&id).map(|bucket| StageInfo {
            id,
            system_count: bucket.systems.len(),
            system_names: bucket
                .systems
                .iter()
                .map(|system| system.name().to_string())
                .collect(),
        })
    }

    /// Registered stage ids, ascending
    pub fn stage_ids(&self) -> Vec<i32> {
        self.stages.keys().copied().collect()
    }

    // ========== Events ==========

    /// Create the event store for T and schedule its cleanup at `LAST`
    pub fn register_event<T: Event>(&mut self, world: &mut World) {
        self.register_event_with_cleanup_at::<T>(world, stage::LAST);
    }

    /// Create the event store for T and schedule a system at
    /// `cleanup_stage` that discards handled and unhandled events alike
    pub fn register_event_with_cleanup_at<T: Event>(
        &mut self,
        world: &mut World,
        cleanup_stage: i32,
    ) {
        if !world.has_resource::<EventStore<T>>() {
            world.insert_resource(EventStore::<T>::new());
        }
        self.add_system(cleanup_stage, drain_event_store::<T>);
    }

    // ========== States ==========

    /// Accept state transitions for enum E and add its `StateStore`
    /// resource
    pub fn register_state<E: States>(&mut self, world: &mut World) -> Result<()> {
        if !self.registered_states.insert(TypeId::of::<E>()) {
            return Err(EcsError::StateAlreadyRegistered);
        }
        world.insert_resource(StateStore::<E>::new());
        Ok(())
    }

    /// Transition to `value`: OnExit(previous) runs first, then the
    /// active state updates, then OnEnter(value) runs. Transitioning to
    /// the already active value is a no-op. State stages with no systems
    /// are tolerated.
    pub fn transition_to<E: States>(&mut self, world: &mut World, value: E) -> Result<()> {
        if !self.registered_states.contains(&TypeId::of::<E>()) {
            return Err(EcsError::StateNotRegistered);
        }

        let (value_hash, name) = state_value_key(&value);
        if let Some(active) = &self.active_state {
            if active.type_id == TypeId::of::<E>() && active.value_hash == value_hash {
                return Ok(());
            }
        }

        #[cfg(feature = "profiling")]
        let span = info_span!("scheduler.transition", to = name.as_str());
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        if let Some(previous) = self.active_state.clone() {
            self.run_state_stage(world, band_stage(stage::STATE_ON_EXIT_BASE, previous.value_hash))?;
            (previous.clear_fn)(world);
        }

        if let Some(store) = world.resource_mut::<StateStore<E>>() {
            store.set_current(value);
        }
        self.active_state = Some(ActiveState {
            type_id: TypeId::of::<E>(),
            value_hash,
            name,
            clear_fn: clear_state_store::<E>,
        });

        self.run_state_stage(world, band_stage(stage::STATE_ON_ENTER_BASE, value_hash))
    }

    /// Apply a transition queued through the `NextState` parameter
    pub fn apply_pending_transitions<E: States>(&mut self, world: &mut World) -> Result<()> {
        let pending = world
            .resource_mut::<StateStore<E>>()
            .and_then(StateStore::take_pending);
        match pending {
            Some(value) => self.transition_to(world, value),
            None => Ok(()),
        }
    }

    pub fn is_in_state<E: States>(&self, value: &E) -> bool {
        match &self.active_state {
            Some(active) => {
                active.type_id == TypeId::of::<E>()
                    && active.value_hash == state_value_key(value).0
            }
            None => false,
        }
    }

    pub fn active_state(&self) -> Option<&ActiveState> {
        self.active_state.as_ref()
    }

    /// Variant name of the active state, e.g. `"Menu"`
    pub fn active_state_name(&self) -> Option<&str> {
        self.active_state.as_ref().map(|active| active.name.as_str())
    }

    /// Run the InState stage for `value`; a missing stage is not an error
    pub fn run_in_state_systems<E: States>(&mut self, world: &mut World, value: &E) -> Result<()> {
        self.run_state_stage(
            world,
            band_stage(stage::STATE_UPDATE_BASE, state_value_key(value).0),
        )
    }

    /// Run the InState stage of whatever state is active, if any
    pub fn run_active_state_systems(&mut self, world: &mut World) -> Result<()> {
        let value_hash = match &self.active_state {
            Some(active) => active.value_hash,
            None => return Ok(()),
        };
        self.run_state_stage(world, band_stage(stage::STATE_UPDATE_BASE, value_hash))
    }

    /// State-specialized stages tolerate absence
    fn run_state_stage(&mut self, world: &mut World, stage_id: i32) -> Result<()> {
        match self.run_stage(world, stage_id) {
            Err(EcsError::StageHasNoSystems(_)) => Ok(()),
            other => other,
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn drain_event_store<T: Event>(mut events: Res<EventStore<T>>) {
    events.discard_handled();
    events.discard_unhandled();
}

fn clear_state_store<E: States>(world: &mut World) {
    if let Some(store) = world.resource_mut::<StateStore<E>>() {
        store.clear_current();
    }
}
