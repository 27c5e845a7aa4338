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

//! Error types

use std::any::TypeId;
use std::fmt;

/// ECS error type
#[derive(Debug, Clone, PartialEq)]
pub enum EcsError {
    /// Operation on an unknown or destroyed entity
    EntityNotAlive,

    /// Component type is managed by the relation layer and cannot be
    /// added or removed through the generic component API
    ReservedComponentType,

    /// Resource of this type already registered
    ResourceAlreadyExists(TypeId),

    /// Resource of this type is missing
    ResourceNotFound(&'static str),

    /// Stage already registered
    StageExists(i32),

    /// Stage is unknown or holds no systems
    StageHasNoSystems(i32),

    /// Stage id lies outside the valid range
    InvalidStageBounds(i32),

    /// State enum already registered with the scheduler
    StateAlreadyRegistered,

    /// State enum was never registered with the scheduler
    StateNotRegistered,

    /// `Single` parameter matched no entity
    SingleComponentNotFound,

    /// `Single` parameter matched more than one entity
    SingleComponentAmbiguous,

    /// Command could not be applied
    CommandError(String),
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::EntityNotAlive => write!(f, "Entity is not alive"),
            EcsError::ReservedComponentType => {
                write!(f, "Component type is reserved by the relation layer")
            }
            EcsError::ResourceAlreadyExists(type_id) => {
                write!(f, "Resource already exists: {type_id:?}")
            }
            EcsError::ResourceNotFound(name) => write!(f, "Resource not found: {name}"),
            EcsError::StageExists(id) => write!(f, "Stage already exists: {id}"),
            EcsError::StageHasNoSystems(id) => write!(f, "Stage has no systems: {id}"),
            EcsError::InvalidStageBounds(id) => write!(f, "Stage id out of bounds: {id}"),
            EcsError::StateAlreadyRegistered => write!(f, "State already registered"),
            EcsError::StateNotRegistered => write!(f, "State not registered"),
            EcsError::SingleComponentNotFound => {
                write!(f, "Single parameter matched no entity")
            }
            EcsError::SingleComponentAmbiguous => {
                write!(f, "Single parameter matched more than one entity")
            }
            EcsError::CommandError(msg) => write!(f, "Command error: {msg}"),
        }
    }
}

impl std::error::Error for EcsError {}

/// Result type alias
pub type Result<T> = std::result::Result<T, EcsError>;
