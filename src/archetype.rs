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

//! Archetype storage: sorted signatures, row-parallel entity list and
//! type-erased component columns with swap-remove row management.

use std::any::TypeId;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::component::Component;
use crate::entity::Entity;

/// Sorted, deduplicated set of component type ids identifying an archetype.
///
/// Invariant: `types` is strictly ascending.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ArchetypeSignature {
    types: SmallVec<[TypeId; 8]>,
}

impl ArchetypeSignature {
    /// Empty signature (the archetype of component-less entities)
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a canonical signature from type ids in any order
    pub fn from_unsorted(type_ids: &[TypeId]) -> Self {
        let mut types: SmallVec<[TypeId; 8]> = SmallVec::from_slice(type_ids);
        types.sort();
        types.dedup();
        Self { types }
    }

    /// Signature with `type_id` added (no-op when already present)
    pub fn with(&self, type_id: TypeId) -> Self {
        let mut types = self.types.clone();
        if let Err(pos) = types.binary_search(&type_id) {
            types.insert(pos, type_id);
        }
        Self { types }
    }

    /// Signature with `type_id` removed (no-op when absent)
    pub fn without(&self, type_id: TypeId) -> Self {
        let mut types = self.types.clone();
        if let Ok(pos) = types.binary_search(&type_id) {
            types.remove(pos);
        }
        Self { types }
    }

    pub fn contains(&self, type_id: TypeId) -> bool {
        self.types.binary_search(&type_id).is_ok()
    }

    /// Type ids in ascending order
    pub fn types(&self) -> &[TypeId] {
        &self.types
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Archetype: Structure of Arrays storage for one component-type set
pub struct Archetype {
    signature: ArchetypeSignature,
    entities: Vec<Entity>,
    columns: Vec<ComponentColumn>,
    column_indices: FxHashMap<TypeId, usize>,
}

impl Archetype {
    /// Create new archetype with empty columns
    pub fn new(signature: ArchetypeSignature) -> Self {
        Self {
            signature,
            entities: Vec::new(),
            columns: Vec::new(),
            column_indices: FxHashMap::default(),
        }
    }

    /// Get signature
    pub fn signature(&self) -> &ArchetypeSignature {
        &self.signature
    }

    /// Register component column for type T
    pub fn register_component<T: Component>(&mut self) {
        let type_id = TypeId::of::<T>();
        if !self.column_indices.contains_key(&type_id) {
            let idx = self.columns.len();
            self.columns.push(ComponentColumn::new::<T>());
            self.column_indices.insert(type_id, idx);
        }
    }

    /// Register a pre-built (empty) column under a type id
    pub(crate) fn add_column_raw(&mut self, type_id: TypeId, column: ComponentColumn) {
        if !self.column_indices.contains_key(&type_id) {
            let idx = self.columns.len();
            self.columns.push(column);
            self.column_indices.insert(type_id, idx);
        }
    }

    /// Allocate row for entity
    pub fn allocate_row(&mut self, entity: Entity) -> usize {
        let row = self.entities.len();
        self.entities.push(entity);
        row
    }

    /// Swap-remove row from the entity list and every column, dropping the
    /// component values stored there.
    ///
    /// Returns the entity that was swapped into `row` so the caller can fix
    /// its sparse-index entry, or `None` when `row` was the last row.
    ///
    /// # Safety
    /// `row` must be a valid row index and every column must hold exactly
    /// one initialized value per row.
    pub unsafe fn remove_row(&mut self, row: usize) -> Option<Entity> {
        self.take_row(row, true)
    }

    /// Swap-remove row without dropping component values. Used after a
    /// migration has moved the row's bytes into another archetype and now
    /// owns them.
    ///
    /// # Safety
    /// Same as [`Archetype::remove_row`]; additionally every value in this
    /// row must have been moved out or dropped already.
    pub(crate) unsafe fn forget_row(&mut self, row: usize) -> Option<Entity> {
        self.take_row(row, false)
    }

    unsafe fn take_row(&mut self, row: usize, drop_values: bool) -> Option<Entity> {
        if row >= self.entities.len() {
            return None;
        }

        self.entities.swap_remove(row);
        for column in &mut self.columns {
            if drop_values {
                column.drop_in_place(row);
            }
            column.swap_remove_forget(row);
        }

        // If we swapped someone in, return their entity so the caller can
        // update their location
        if row < self.entities.len() {
            Some(self.entities[row])
        } else {
            None
        }
    }

    /// Get column immutably
    pub fn column(&self, type_id: TypeId) -> Option<&ComponentColumn> {
        let idx = *self.column_indices.get(&type_id)?;
        self.columns.get(idx)
    }

    /// Get column mutably
    pub fn column_mut(&mut self, type_id: TypeId) -> Option<&mut ComponentColumn> {
        let idx = *self.column_indices.get(&type_id)?;
        self.columns.get_mut(idx)
    }

    /// Get column index for a component type
    pub fn column_index(&self, type_id: TypeId) -> Option<usize> {
        self.column_indices.get(&type_id).copied()
    }

    pub fn has_column(&self, type_id: TypeId) -> bool {
        self.column_indices.contains_key(&type_id)
    }

    /// Reserve space for additional rows
    pub fn reserve_rows(&mut self, additional: usize) {
        if self.entities.capacity() - self.entities.len() < additional {
            self.entities.reserve(additional);
            for column in &mut self.columns {
                column.data.reserve(additional * column.item_size);
            }
        }
    }

    /// All entities, row order
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Type-erased component column: packed bytes with a fixed element stride
pub struct ComponentColumn {
    data: Vec<u8>,
    item_size: usize,
    drop_fn: Option<unsafe fn(*mut u8)>,
}

impl ComponentColumn {
    /// Create new column for type T
    pub fn new<T: Component>() -> Self {
        Self {
            data: Vec::new(),
            item_size: std::mem::size_of::<T>(),
            drop_fn: if std::mem::needs_drop::<T>() {
                Some(|ptr| unsafe {
                    std::ptr::drop_in_place(ptr as *mut T);
                })
            } else {
                None
            },
        }
    }

    /// New column with the same element layout but no data
    pub fn clone_empty(&self) -> Self {
        Self {
            data: Vec::new(),
            item_size: self.item_size,
            drop_fn: self.drop_fn,
        }
    }

    /// Mutable pointer to the element slot at `index`, growing the buffer
    /// to cover it when needed. The slot bytes are uninitialized on grow;
    /// the caller must write a full value before it is read or dropped.
    pub fn get_ptr_mut(&mut self, index: usize) -> *mut u8 {
        let offset = index * self.item_size;
        if offset + self.item_size > self.data.len() {
            self.data.resize(offset + self.item_size, 0);
        }
        unsafe { self.data.as_mut_ptr().add(offset) }
    }

    /// Get component at index
    ///
    /// Zero-sized components carry no bytes; callers bound-check rows
    /// against the archetype's entity list.
    pub fn get<T: Component>(&self, index: usize) -> Option<&T> {
        if self.item_size == 0 {
            return Some(unsafe { std::ptr::NonNull::<T>::dangling().as_ref() });
        }
        let offset = index * self.item_size;
        if offset + self.item_size > self.data.len() {
            return None;
        }
        Some(unsafe { &*(self.data.as_ptr().add(offset) as *const T) })
    }

    /// Get mutable component at index
    pub fn get_mut<T: Component>(&mut self, index: usize) -> Option<&mut T> {
        if self.item_size == 0 {
            return Some(unsafe { std::ptr::NonNull::<T>::dangling().as_mut() });
        }
        let offset = index * self.item_size;
        if offset + self.item_size > self.data.len() {
            return None;
        }
        Some(unsafe { &mut *(self.data.as_mut_ptr().add(offset) as *mut T) })
    }

    /// Drop the old value at `index` and write `value` in its place
    pub fn replace<T: Component>(&mut self, index: usize, value: T) {
        unsafe {
            self.drop_in_place(index);
            let ptr = self.get_ptr_mut(index) as *mut T;
            std::ptr::write(ptr, value);
        }
    }

    /// Run the element destructor for the value at `index`, leaving the
    /// bytes behind.
    ///
    /// # Safety
    /// `index` must hold an initialized value that is not dropped twice.
    pub(crate) unsafe fn drop_in_place(&mut self, index: usize) {
        if self.item_size == 0 {
            return;
        }
        if let Some(drop_fn) = self.drop_fn {
            let offset = index * self.item_size;
            if offset + self.item_size <= self.data.len() {
                drop_fn(self.data.as_mut_ptr().add(offset));
            }
        }
    }

    /// Move the last element's bytes into `index` and shrink by one element.
    /// The value previously at `index` is not dropped.
    ///
    /// # Safety
    /// `index` must be a valid element index.
    pub(crate) unsafe fn swap_remove_forget(&mut self, index: usize) {
        if self.item_size == 0 {
            return;
        }
        let count = self.len();
        if index >= count {
            return;
        }
        let last_start = (count - 1) * self.item_size;
        let index_start = index * self.item_size;
        if index_start != last_start {
            let src = self.data.as_ptr().add(last_start);
            let dst = self.data.as_mut_ptr().add(index_start);
            std::ptr::copy_nonoverlapping(src, dst, self.item_size);
        }
        self.data.truncate(last_start);
    }

    /// Element stride in bytes
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Number of stored elements
    pub fn len(&self) -> usize {
        if self.item_size == 0 {
            0
        } else {
            self.data.len() / self.item_size
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Drop for ComponentColumn {
    fn drop(&mut self) {
        if let Some(drop_fn) = self.drop_fn {
            let count = self.len();
            for i in 0..count {
                let offset = i * self.item_size;
                unsafe {
                    drop_fn(self.data.as_mut_ptr().add(offset));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityAllocator;

    #[test]
    fn test_signature_is_sorted_and_deduplicated() {
        let ids = [TypeId::of::<i32>(), TypeId::of::<f32>(), TypeId::of::<i32>()];
        let sig = ArchetypeSignature::from_unsorted(&ids);
        assert_eq!(sig.len(), 2);
        let types = sig.types();
        assert!(types.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_signature_with_without_roundtrip() {
        let sig = ArchetypeSignature::from_unsorted(&[TypeId::of::<i32>()]);
        let grown = sig.with(TypeId::of::<f32>());
        assert!(grown.contains(TypeId::of::<f32>()));
        let shrunk = grown.without(TypeId::of::<f32>());
        assert_eq!(shrunk, sig);
    }

    #[test]
    fn test_swap_remove_reports_moved_entity() {
        let mut allocator = EntityAllocator::new();
        let sig = ArchetypeSignature::from_unsorted(&[TypeId::of::<u64>()]);
        let mut arch = Archetype::new(sig);
        arch.register_component::<u64>();

        let e0 = allocator.allocate();
        let e1 = allocator.allocate();
        let e2 = allocator.allocate();
        for (i, e) in [e0, e1, e2].into_iter().enumerate() {
            let row = arch.allocate_row(e);
            let ptr = arch.column_mut(TypeId::of::<u64>()).unwrap().get_ptr_mut(row);
            unsafe { std::ptr::write(ptr as *mut u64, i as u64) };
        }

        let moved = unsafe { arch.remove_row(0) };
        assert_eq!(moved, Some(e2));
        assert_eq!(arch.len(), 2);
        // e2's value now lives at row 0
        let col = arch.column(TypeId::of::<u64>()).unwrap();
        assert_eq!(col.get::<u64>(0), Some(&2));
        assert_eq!(col.len(), 2);
    }

    #[test]
    fn test_column_length_tracks_rows() {
        let mut column = ComponentColumn::new::<u32>();
        for i in 0..4u32 {
            let ptr = column.get_ptr_mut(i as usize);
            unsafe { std::ptr::write(ptr as *mut u32, i) };
        }
        assert_eq!(column.len(), 4);
        assert_eq!(column.item_size(), 4);
        unsafe { column.swap_remove_forget(1) };
        assert_eq!(column.len(), 3);
        assert_eq!(column.get::<u32>(1), Some(&3));
    }
}
