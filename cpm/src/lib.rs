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

#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![deny(
    dead_code,
    nonstandard_style,
    unused_imports,
    unused_mut,
    unused_variables,
    unused_unsafe,
    unreachable_patterns
)]

mod cpu;
mod cstates;
mod errors;
mod features;
mod host;
mod pool;
mod profile;
mod scaling;
mod topology;
mod uncore;

#[cfg(test)]
mod tests;

pub use cpm_config::LibConfig;
pub use cpm_shared::CoreId;
pub use cpm_shared::CpuId;
pub use cpm_shared::DieId;
pub use cpm_shared::PackageId;

pub use cpu::Cpu;
pub use cstates::CStates;
pub use errors::PowerError;
pub use errors::PowerResult;
pub use features::Feature;
pub use features::FeatureError;
pub use features::FeatureSet;
pub use features::FeatureStatus;
pub use host::Host;
pub use host::RESERVED_POOL_NAME;
pub use host::SHARED_POOL_NAME;
pub use pool::Pool;
pub use pool::PoolKind;
pub use profile::PowerProfile;
pub use scaling::CoreTypeList;
pub use scaling::FreqRange;
pub use scaling::GOVERNOR_PERFORMANCE;
pub use scaling::GOVERNOR_POWERSAVE;
pub use topology::Core;
pub use topology::Die;
pub use topology::Package;
pub use topology::Topology;
pub use uncore::Uncore;
