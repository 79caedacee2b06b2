/*
 * Copyright 2024 Fluence Labs Limited
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use newtype_derive::newtype_fmt;
use serde::Deserialize;
use serde::Serialize;

pub type IdType = u32;

/// An opaque type that represents a logical CPU (a hardware thread)
/// as enumerated by the kernel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct CpuId(IdType);

/// An opaque type that represents a physical core.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct CoreId(IdType);

/// An opaque type that represents a die inside a package.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct DieId(IdType);

/// An opaque type that represents a physical CPU package (a socket).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct PackageId(IdType);

newtype_derive::NewtypeFrom! { () pub struct CpuId(IdType); }
newtype_derive::NewtypeDisplay! { () pub struct CpuId(IdType); }

newtype_derive::NewtypeFrom! { () pub struct CoreId(IdType); }
newtype_derive::NewtypeDisplay! { () pub struct CoreId(IdType); }

newtype_derive::NewtypeFrom! { () pub struct DieId(IdType); }
newtype_derive::NewtypeDisplay! { () pub struct DieId(IdType); }

newtype_derive::NewtypeFrom! { () pub struct PackageId(IdType); }
newtype_derive::NewtypeDisplay! { () pub struct PackageId(IdType); }

impl CpuId {
    pub const fn new(id: IdType) -> Self {
        Self(id)
    }
}

impl CoreId {
    pub const fn new(id: IdType) -> Self {
        Self(id)
    }
}

impl DieId {
    pub const fn new(id: IdType) -> Self {
        Self(id)
    }
}

impl PackageId {
    pub const fn new(id: IdType) -> Self {
        Self(id)
    }
}

impl From<CpuId> for usize {
    fn from(value: CpuId) -> usize {
        value.0 as usize
    }
}

impl From<CoreId> for usize {
    fn from(value: CoreId) -> usize {
        value.0 as usize
    }
}

impl From<DieId> for usize {
    fn from(value: DieId) -> usize {
        value.0 as usize
    }
}

impl From<PackageId> for usize {
    fn from(value: PackageId) -> usize {
        value.0 as usize
    }
}
