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

use thiserror::Error as ThisError;

use cpm_shared::CpuId;
use cpm_sysfs::SysfsError;

use crate::features::Feature;
use crate::features::FeatureError;

pub type PowerResult<T> = Result<T, PowerError>;

#[derive(Debug, ThisError)]
pub enum PowerError {
    #[error(transparent)]
    Sysfs(#[from] SysfsError),

    #[error("feature {feature} is unsupported: {source}")]
    FeatureUnsupported {
        feature: Feature,
        #[source]
        source: FeatureError,
    },

    #[error("none of the power management features is supported on this machine")]
    NoSupportedFeatures {
        errors: Vec<(Feature, FeatureError)>,
    },

    #[error("max frequency {max_khz} kHz cannot be lower than min {min_khz} kHz")]
    MaxBelowMin { min_khz: u64, max_khz: u64 },

    #[error("governor can only be one of {available:?}, got '{governor}'")]
    UnknownGovernor {
        governor: String,
        available: Vec<String>,
    },

    #[error("only the 'performance' epp can be used with the 'performance' governor, got '{0}'")]
    EppGovernorConflict(String),

    #[error("c-state '{0}' does not exist on this system")]
    UnknownCState(String),

    #[error("cpu {0} is not known to this host")]
    UnknownCpu(CpuId),

    #[error("cpu {cpu} is not in pool '{pool}'")]
    CpuNotInPool { cpu: CpuId, pool: String },

    #[error("pool with name '{0}' already exists")]
    PoolExists(String),

    #[error("'{0}' is a reserved pool name")]
    ReservedPoolName(String),

    #[error("pool '{0}' is not on this host")]
    UnknownPool(String),

    #[error("cannot set a power profile on the reserved pool")]
    ReservedPoolProfile,

    #[error("pool '{0}' is permanent and cannot be removed")]
    PermanentPool(String),

    #[error("cannot move cpu {cpu} from pool '{from}' to pool '{to}'")]
    InvalidTransition {
        cpu: CpuId,
        from: String,
        to: String,
    },

    #[error(
        "frequency range {min_khz}-{max_khz} kHz is outside the hardware envelope \
         {hw_min_khz}-{hw_max_khz} kHz of cpu {cpu}"
    )]
    HardwareBounds {
        cpu: CpuId,
        min_khz: u64,
        max_khz: u64,
        hw_min_khz: u64,
        hw_max_khz: u64,
    },

    #[error(
        "uncore range {min_khz}-{max_khz} kHz is outside the hardware range \
         {hw_min_khz}-{hw_max_khz} kHz"
    )]
    UncoreOutOfBounds {
        min_khz: u64,
        max_khz: u64,
        hw_min_khz: u64,
        hw_max_khz: u64,
    },

    #[error("failed to apply some c-states: {0:?}")]
    CStateWrites(Vec<PowerError>),

    #[error("the host this handle belongs to has been dropped")]
    HostReleased,
}

impl PowerError {
    pub(crate) fn invalid_transition(cpu: CpuId, from: &str, to: &str) -> Self {
        Self::InvalidTransition {
            cpu,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub(crate) fn cpu_not_in_pool(cpu: CpuId, pool: &str) -> Self {
        Self::CpuNotInPool {
            cpu,
            pool: pool.to_string(),
        }
    }
}
