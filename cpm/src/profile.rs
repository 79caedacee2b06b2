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

use std::sync::Arc;

use crate::errors::PowerError;
use crate::errors::PowerResult;
use crate::features::Feature;
use crate::host::Host;
use crate::scaling::CoreTypeList;
use crate::scaling::FreqRange;
use crate::scaling::GOVERNOR_PERFORMANCE;

/// An immutable description of the operating point a pool requests for its
/// cpus: governor, epp hint and the frequency window in kHz. Shared by
/// reference, never locked.
///
/// All frequencies are kHz end to end, matching the units of the cpufreq
/// sysfs files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PowerProfile {
    pub(crate) name: String,
    pub(crate) governor: String,
    /// Empty means the epp file is left untouched.
    pub(crate) epp: String,
    pub(crate) min_khz: u64,
    pub(crate) max_khz: u64,
    /// The window applied to efficient cores instead of (min, max).
    pub(crate) efficient: Option<FreqRange>,
}

impl PowerProfile {
    pub(crate) fn unchecked(
        name: &str,
        governor: &str,
        epp: &str,
        min_khz: u64,
        max_khz: u64,
        efficient: Option<FreqRange>,
    ) -> Self {
        Self {
            name: name.to_string(),
            governor: governor.to_string(),
            epp: epp.to_string(),
            min_khz,
            max_khz,
            efficient,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn governor(&self) -> &str {
        &self.governor
    }

    pub fn epp(&self) -> &str {
        &self.epp
    }

    pub fn min_khz(&self) -> u64 {
        self.min_khz
    }

    pub fn max_khz(&self) -> u64 {
        self.max_khz
    }

    pub fn efficient(&self) -> Option<FreqRange> {
        self.efficient
    }

    /// Picks the frequency window for a core type: E-cores get the
    /// efficient pair, everything else the base pair.
    pub(crate) fn freqs_for_core_type(
        &self,
        core_types: &CoreTypeList,
        core_type: usize,
    ) -> FreqRange {
        let base = FreqRange {
            min_khz: self.min_khz,
            max_khz: self.max_khz,
        };
        if core_type == core_types.ecore_index() && core_types.ecore_index() != core_types.pcore_index()
        {
            return self.efficient.unwrap_or(base);
        }
        base
    }
}

impl Host {
    /// Builds a validated profile for homogeneous machines. Frequencies
    /// are kHz.
    pub fn new_power_profile(
        &self,
        name: &str,
        min_khz: u64,
        max_khz: u64,
        governor: &str,
        epp: &str,
    ) -> PowerResult<Arc<PowerProfile>> {
        self.validate_profile(min_khz, max_khz, governor, epp)?;
        Ok(Arc::new(PowerProfile::unchecked(
            name, governor, epp, min_khz, max_khz, None,
        )))
    }

    /// Builds a validated profile carrying a separate frequency window for
    /// efficient cores.
    pub fn new_ecore_power_profile(
        &self,
        name: &str,
        min_khz: u64,
        max_khz: u64,
        efficient_min_khz: u64,
        efficient_max_khz: u64,
        governor: &str,
        epp: &str,
    ) -> PowerResult<Arc<PowerProfile>> {
        self.validate_profile(min_khz, max_khz, governor, epp)?;
        if efficient_min_khz > efficient_max_khz {
            return Err(PowerError::MaxBelowMin {
                min_khz: efficient_min_khz,
                max_khz: efficient_max_khz,
            });
        }
        Ok(Arc::new(PowerProfile::unchecked(
            name,
            governor,
            epp,
            min_khz,
            max_khz,
            Some(FreqRange {
                min_khz: efficient_min_khz,
                max_khz: efficient_max_khz,
            }),
        )))
    }

    fn validate_profile(
        &self,
        min_khz: u64,
        max_khz: u64,
        governor: &str,
        epp: &str,
    ) -> PowerResult<()> {
        if !self.features().is_supported(Feature::FrequencyScaling) {
            return Err(self.feature_unsupported(Feature::FrequencyScaling));
        }
        if min_khz > max_khz {
            return Err(PowerError::MaxBelowMin { min_khz, max_khz });
        }
        if !self
            .available_governors()
            .iter()
            .any(|available| available == governor)
        {
            return Err(PowerError::UnknownGovernor {
                governor: governor.to_string(),
                available: self.available_governors().to_vec(),
            });
        }
        if governor == GOVERNOR_PERFORMANCE && !epp.is_empty() && epp != GOVERNOR_PERFORMANCE {
            return Err(PowerError::EppGovernorConflict(epp.to_string()));
        }
        Ok(())
    }
}
