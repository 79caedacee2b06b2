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

//! Frequency scaling: the cpufreq probe, the core type table and the
//! frequency phase of cpu consolidation.

use cpm_shared::CpuId;
use cpm_sysfs::SysfsResult;
use cpm_sysfs::SysfsRoot;

use crate::cpu::Cpu;
use crate::errors::PowerError;
use crate::errors::PowerResult;
use crate::features::Feature;
use crate::features::FeatureError;
use crate::features::FeatureStatus;
use crate::host::Host;
use crate::profile::PowerProfile;

pub(crate) const SCALING_DRIVER_FILE: &str = "cpufreq/scaling_driver";
pub(crate) const AVAILABLE_GOVERNORS_FILE: &str = "cpufreq/scaling_available_governors";
pub(crate) const SCALING_GOVERNOR_FILE: &str = "cpufreq/scaling_governor";
pub(crate) const EPP_FILE: &str = "cpufreq/energy_performance_preference";
pub(crate) const CPUINFO_MIN_FREQ_FILE: &str = "cpufreq/cpuinfo_min_freq";
pub(crate) const CPUINFO_MAX_FREQ_FILE: &str = "cpufreq/cpuinfo_max_freq";
pub(crate) const SCALING_MIN_FREQ_FILE: &str = "cpufreq/scaling_min_freq";
pub(crate) const SCALING_MAX_FREQ_FILE: &str = "cpufreq/scaling_max_freq";

pub const GOVERNOR_PERFORMANCE: &str = "performance";
pub const GOVERNOR_POWERSAVE: &str = "powersave";

const DEFAULT_GOVERNOR: &str = GOVERNOR_POWERSAVE;
const DEFAULT_EPP: &str = "default";
const DEFAULT_PROFILE_NAME: &str = "default";

const SUPPORTED_SCALING_DRIVERS: [&str; 3] = ["intel_pstate", "intel_cpufreq", "acpi-cpufreq"];

/// How many distinct core types the efficient/performance split of a power
/// profile can describe.
pub(crate) const SUPPORTED_CORE_TYPES: usize = 2;

/// A hardware frequency envelope in kHz.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FreqRange {
    pub(crate) min_khz: u64,
    pub(crate) max_khz: u64,
}

impl FreqRange {
    pub fn min_khz(&self) -> u64 {
        self.min_khz
    }

    pub fn max_khz(&self) -> u64 {
        self.max_khz
    }
}

/// Distinct hardware envelopes observed during discovery. Cores refer to
/// entries by index, which classifies them as P-cores or E-cores on
/// heterogeneous machines.
#[derive(Clone, Debug, Default)]
pub struct CoreTypeList {
    types: Vec<FreqRange>,
    pcore: usize,
    ecore: usize,
}

impl CoreTypeList {
    /// Returns the index of the given envelope, appending it first if it
    /// has not been observed yet.
    pub(crate) fn append_if_unique(&mut self, min_khz: u64, max_khz: u64) -> usize {
        if let Some(index) = self
            .types
            .iter()
            .position(|range| range.min_khz == min_khz && range.max_khz == max_khz)
        {
            return index;
        }
        self.types.push(FreqRange { min_khz, max_khz });
        self.types.len() - 1
    }

    /// Recomputes the P-core and E-core reference indices: the entry with
    /// the highest max is the P-core, the entry with the highest max
    /// strictly below it is the E-core.
    pub(crate) fn compute_references(&mut self) {
        let Some(pcore) = self
            .types
            .iter()
            .enumerate()
            .max_by_key(|(_, range)| range.max_khz)
            .map(|(index, _)| index)
        else {
            return;
        };
        self.pcore = pcore;
        let pcore_max = self.types[pcore].max_khz;
        self.ecore = self
            .types
            .iter()
            .enumerate()
            .filter(|(_, range)| range.max_khz < pcore_max)
            .max_by_key(|(_, range)| range.max_khz)
            .map(|(index, _)| index)
            .unwrap_or(pcore);
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<FreqRange> {
        self.types.get(index).copied()
    }

    pub fn ranges(&self) -> &[FreqRange] {
        &self.types
    }

    pub fn pcore_index(&self) -> usize {
        self.pcore
    }

    pub fn ecore_index(&self) -> usize {
        self.ecore
    }
}

/// Side products of a successful frequency scaling probe.
pub(crate) struct ScalingInfo {
    pub(crate) governors: Vec<String>,
    pub(crate) default_profile: PowerProfile,
}

pub(crate) fn probe_frequency_scaling(sysfs: &SysfsRoot) -> (FeatureStatus, Option<ScalingInfo>) {
    let mut status = FeatureStatus::new(Feature::FrequencyScaling);

    let driver = match sysfs.read_cpu_string(CpuId::new(0), SCALING_DRIVER_FILE) {
        Ok(driver) => driver,
        Err(error) => {
            status.error = Some(FeatureError::probe(format!(
                "failed to read driver name: {error}"
            )));
            return (status, None);
        }
    };
    status.driver = driver.clone();
    if !SUPPORTED_SCALING_DRIVERS.contains(&driver.as_str()) {
        status.error = Some(FeatureError::UnsupportedDriver(driver));
        return (status, None);
    }

    let governors = match read_available_governors(sysfs) {
        Ok(governors) => governors,
        Err(error) => {
            status.error = Some(FeatureError::probe(format!(
                "failed to read available governors: {error}"
            )));
            return (status, None);
        }
    };

    match generate_default_profile(sysfs) {
        Ok(default_profile) => (
            status,
            Some(ScalingInfo {
                governors,
                default_profile,
            }),
        ),
        Err(error) => {
            status.error = Some(FeatureError::probe(format!(
                "failed to read default frequencies: {error}"
            )));
            (status, None)
        }
    }
}

pub(crate) fn probe_epp(sysfs: &SysfsRoot) -> FeatureStatus {
    let mut status = FeatureStatus::new(Feature::Epp);
    if !sysfs.cpu_file(CpuId::new(0), EPP_FILE).exists() {
        status.error = Some(FeatureError::probe(format!(
            "the {EPP_FILE} file does not exist"
        )));
    }
    status
}

fn read_available_governors(sysfs: &SysfsRoot) -> SysfsResult<Vec<String>> {
    let raw = sysfs.read_cpu_string(CpuId::new(0), AVAILABLE_GOVERNORS_FILE)?;
    Ok(raw.split_whitespace().map(str::to_string).collect())
}

/// The profile applied to cpus whose pool carries none, derived from the
/// hardware envelope of cpu 0.
fn generate_default_profile(sysfs: &SysfsRoot) -> SysfsResult<PowerProfile> {
    let max_khz = sysfs.read_cpu_u64(CpuId::new(0), CPUINFO_MAX_FREQ_FILE)?;
    let min_khz = sysfs.read_cpu_u64(CpuId::new(0), CPUINFO_MIN_FREQ_FILE)?;
    let epp = if sysfs.cpu_file(CpuId::new(0), EPP_FILE).exists() {
        DEFAULT_EPP
    } else {
        ""
    };
    Ok(PowerProfile::unchecked(
        DEFAULT_PROFILE_NAME,
        DEFAULT_GOVERNOR,
        epp,
        min_khz,
        max_khz,
        None,
    ))
}

impl Cpu {
    /// The frequency phase of consolidation. A silent no-op when frequency
    /// scaling is unsupported.
    pub(crate) fn update_frequencies(
        &self,
        host: &Host,
        profile: Option<&PowerProfile>,
    ) -> PowerResult<()> {
        if !host.features().is_supported(Feature::FrequencyScaling) {
            return Ok(());
        }
        let Some(profile) = profile.or_else(|| host.default_profile()) else {
            return Ok(());
        };

        host.sysfs()
            .write_cpu_value(self.id(), SCALING_GOVERNOR_FILE, profile.governor())?;
        if !profile.epp().is_empty() {
            host.sysfs()
                .write_cpu_value(self.id(), EPP_FILE, profile.epp())?;
        }

        let target = profile.freqs_for_core_type(host.core_types(), self.core_type());
        let Some(hardware) = host.core_types().get(self.core_type()) else {
            return Ok(());
        };
        if target.max_khz > hardware.max_khz || target.min_khz < hardware.min_khz {
            return Err(PowerError::HardwareBounds {
                cpu: self.id(),
                min_khz: target.min_khz,
                max_khz: target.max_khz,
                hw_min_khz: hardware.min_khz,
                hw_max_khz: hardware.max_khz,
            });
        }
        host.sysfs()
            .write_cpu_value(self.id(), SCALING_MAX_FREQ_FILE, target.max_khz)?;
        host.sysfs()
            .write_cpu_value(self.id(), SCALING_MIN_FREQ_FILE, target.min_khz)?;
        Ok(())
    }
}
