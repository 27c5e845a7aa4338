//! Typed directed links between entities.
//!
//! A relation kind is a marker type. Each kind keeps an outgoing index
//! (source id to targets); kinds with `INDEXED = true` also keep the
//! symmetric incoming index so reverse lookups stay O(1). Edges may carry
//! per-edge data. Kinds are reserved component types: the generic
//! component API rejects them so these indices cannot be bypassed.

use std::any::{Any, TypeId};

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::entity::Entity;

/// Configuration of a relation kind.
///
/// `child —ChildOf→ parent` is the canonical reading: `parents` follows
/// outgoing edges, `children` follows incoming ones.
pub trait Relation: 'static + Send + Sync {
    /// A source may hold at most one outgoing edge of this kind; adding a
    /// second one replaces the first.
    const EXCLUSIVE: bool = false;

    /// Maintain the incoming index. Without it `children` lookups are
    /// unavailable and entity cleanup scans the outgoing index instead.
    const INDEXED: bool = true;
}

type EdgeList = SmallVec<[Entity; 4]>;

struct RelationTable {
    exclusive: bool,
    indexed: bool,
    outgoing: AHashMap<u32, EdgeList>,
    incoming: AHashMap<u32, EdgeList>,
    data: AHashMap<(u32, u32), Box<dyn Any + Send + Sync>>,
}

impl RelationTable {
    fn new(exclusive: bool, indexed: bool) -> Self {
        Self {
            exclusive,
            indexed,
            outgoing: AHashMap::new(),
            incoming: AHashMap::new(),
            data: AHashMap::new(),
        }
    }

    fn add(&mut self, source: Entity, target: Entity) {
        if self.exclusive {
            if let Some(existing) = self.outgoing.get(&source.id()).and_then(|t| t.first()) {
                let existing = *existing;
                self.remove(source, existing);
            }
        }

        let targets = self.outgoing.entry(source.id()).or_default();
        if targets.contains(&target) {
            return;
        }
        targets.push(target);

        if self.indexed {
            self.incoming.entry(target.id()).or_default().push(source);
        }
    }

    fn remove(&mut self, source: Entity, target: Entity) -> bool {
        let removed = match self.outgoing.get_mut(&source.id()) {
            Some(targets) => {
                let before = targets.len();
                targets.retain(|t| *t != target);
                if targets.is_empty() {
                    self.outgoing.remove(&source.id());
                }
                before > 0
            }
            None => false,
        };
        if !removed {
            return false;
        }

        if self.indexed {
            if let Some(sources) = self.incoming.get_mut(&target.id()) {
                sources.retain(|s| *s != source);
                if sources.is_empty() {
                    self.incoming.remove(&target.id());
                }
            }
        }
        self.data.remove(&(source.id(), target.id()));
        true
    }

    fn has(&self, source: Entity, target: Entity) -> bool {
        self.outgoing
            .get(&source.id())
            .is_some_and(|targets| targets.contains(&target))
    }

    fn remove_entity(&mut self, entity: Entity) {
        // Outgoing edges of the entity
        if let Some(targets) = self.outgoing.remove(&entity.id()) {
            for target in targets {
                if self.indexed {
                    if let Some(sources) = self.incoming.get_mut(&target.id()) {
                        sources.retain(|s| *s != entity);
                        if sources.is_empty() {
                            self.incoming.remove(&target.id());
                        }
                    }
                }
                self.data.remove(&(entity.id(), target.id()));
            }
        }

        // Edges pointing at the entity
        if self.indexed {
            if let Some(sources) = self.incoming.remove(&entity.id()) {
                for source in sources {
                    if let Some(targets) = self.outgoing.get_mut(&source.id()) {
                        targets.retain(|t| *t != entity);
                        if targets.is_empty() {
                            self.outgoing.remove(&source.id());
                        }
                    }
                    self.data.remove(&(source.id(), entity.id()));
                }
            }
        } else {
            // No incoming index; scan the outgoing side
            let mut emptied = Vec::new();
            for (&source_id, targets) in self.outgoing.iter_mut() {
                if targets.iter().any(|t| *t == entity) {
                    targets.retain(|t| *t != entity);
                    self.data.remove(&(source_id, entity.id()));
                    if targets.is_empty() {
                        emptied.push(source_id);
                    }
                }
            }
            for source_id in emptied {
                self.outgoing.remove(&source_id);
            }
        }
    }
}

/// Per-kind relation indices plus the reserved-type registry
pub struct RelationManager {
    tables: AHashMap<TypeId, RelationTable>,
}

impl RelationManager {
    pub fn new() -> Self {
        Self {
            tables: AHashMap::new(),
        }
    }

    /// Register a relation kind, reserving its component type.
    /// Happens implicitly on first use of the kind.
    pub fn register<K: Relation>(&mut self) {
        self.tables
            .entry(TypeId::of::<K>())
            .or_insert_with(|| RelationTable::new(K::EXCLUSIVE, K::INDEXED));
    }

    /// Whether a component type is reserved by a registered relation kind
    pub fn is_reserved(&self, type_id: TypeId) -> bool {
        self.tables.contains_key(&type_id)
    }

    fn table_mut<K: Relation>(&mut self) -> &mut RelationTable {
        self.register::<K>();
        self.tables.get_mut(&TypeId::of::<K>()).unwrap()
    }

    fn table<K: Relation>(&self) -> Option<&RelationTable> {
        self.tables.get(&TypeId::of::<K>())
    }

    /// Link `source` to `target` under kind K
    pub fn add<K: Relation>(&mut self, source: Entity, target: Entity) {
        self.table_mut::<K>().add(source, target);
    }

    /// Link `source` to `target` and attach per-edge data
    pub fn add_with_data<K: Relation, D: Send + Sync + 'static>(
        &mut self,
        source: Entity,
        target: Entity,
        data: D,
    ) {
        let table = self.table_mut::<K>();
        table.add(source, target);
        table
            .data
            .insert((source.id(), target.id()), Box::new(data));
    }

    /// Data attached to the edge, if any
    pub fn data<K: Relation, D: Send + Sync + 'static>(
        &self,
        source: Entity,
        target: Entity,
    ) -> Option<&D> {
        self.table::<K>()?
            .data
            .get(&(source.id(), target.id()))?
            .downcast_ref()
    }

    /// Remove the edge; returns whether it existed
    pub fn remove<K: Relation>(&mut self, source: Entity, target: Entity) -> bool {
        self.table_mut::<K>().remove(source, target)
    }

    pub fn has<K: Relation>(&self, source: Entity, target: Entity) -> bool {
        self.table::<K>()
            .is_some_and(|table| table.has(source, target))
    }

    /// Targets of the entity's outgoing edges
    pub fn parents<K: Relation>(&self, entity: Entity) -> Vec<Entity> {
        self.table::<K>()
            .and_then(|table| table.outgoing.get(&entity.id()))
            .map(|targets| targets.to_vec())
            .unwrap_or_default()
    }

    /// First target of the entity's outgoing edges
    pub fn parent<K: Relation>(&self, entity: Entity) -> Option<Entity> {
        self.table::<K>()?
            .outgoing
            .get(&entity.id())?
            .first()
            .copied()
    }

    /// Sources of edges pointing at the entity. Empty for unindexed kinds.
    pub fn children<K: Relation>(&self, entity: Entity) -> Vec<Entity> {
        self.table::<K>()
            .and_then(|table| table.incoming.get(&entity.id()))
            .map(|sources| sources.to_vec())
            .unwrap_or_default()
    }

    /// First source of edges pointing at the entity
    pub fn child<K: Relation>(&self, entity: Entity) -> Option<Entity> {
        self.table::<K>()?
            .incoming
            .get(&entity.id())?
            .first()
            .copied()
    }

    /// Purge the entity from every kind, both directions.
    /// Invoked by the world when the entity is destroyed.
    pub fn remove_entity(&mut self, entity: Entity) {
        for table in self.tables.values_mut() {
            table.remove_entity(entity);
        }
    }
}

impl Default for RelationManager {
    fn default() -> Self {
        Self::new()
    }
}
