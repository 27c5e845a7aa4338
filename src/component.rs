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

//! Component and Bundle traits
//!
//! Components are plain data attached to entities; the ECS never
//! interprets their bytes. A bundle is a tuple of components that spawns
//! together: it knows its canonical sorted signature and how to place
//! each field into the matching column of an archetype, so callers never
//! deal with per-field ordering.

use std::any::TypeId;

use crate::archetype::{Archetype, ArchetypeSignature};

/// Marker trait for components
///
/// Components must be 'static (no borrowed data)
pub trait Component: 'static + Send + Sync {}

/// Automatically implement Component for all valid types
impl<T: 'static + Send + Sync> Component for T {}

/// Tuple of components spawned together.
///
/// Field order is irrelevant to storage: `(A, B)` and `(B, A)` produce
/// the same signature and land in the same archetype. Duplicate types in
/// one bundle collapse to a single column; the last field of that type
/// wins.
pub trait Bundle: Send + Sync + 'static {
    /// Canonical (sorted, deduplicated) signature of the bundle's
    /// component types
    fn signature() -> ArchetypeSignature
    where
        Self: Sized;

    /// Ensure a column exists for every component type of the bundle
    fn register_components(archetype: &mut Archetype)
    where
        Self: Sized;

    /// Move every field into its column at `row`, each field resolving
    /// its own column by type id
    ///
    /// # Safety
    /// `archetype` must carry a column for every type in
    /// [`Bundle::signature`] and `row` must be a freshly allocated row
    /// whose slots hold no initialized values yet.
    unsafe fn write_row(self, archetype: &mut Archetype, row: usize);
}

macro_rules! impl_bundle {
    ($($T:ident),+) => {
        impl<$($T: Component),+> Bundle for ($($T,)+) {
            fn signature() -> ArchetypeSignature {
                ArchetypeSignature::from_unsorted(&[$(TypeId::of::<$T>()),+])
            }

            fn register_components(archetype: &mut Archetype) {
                $(archetype.register_component::<$T>();)+
            }

            #[allow(non_snake_case)]
            unsafe fn write_row(self, archetype: &mut Archetype, row: usize) {
                let ($($T,)+) = self;
                $(
                    let column = archetype
                        .column_mut(TypeId::of::<$T>())
                        .expect("bundle component column not registered");
                    std::ptr::write(column.get_ptr_mut(row) as *mut $T, $T);
                )+
            }
        }
    };
}

// Implement for tuples of 1-8 components
impl_bundle!(A);
impl_bundle!(A, B);
impl_bundle!(A, B, C);
impl_bundle!(A, B, C, D);
impl_bundle!(A, B, C, D, E);
impl_bundle!(A, B, C, D, E, F);
impl_bundle!(A, B, C, D, E, F, G);
impl_bundle!(A, B, C, D, E, F, G, H);
