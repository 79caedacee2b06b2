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

//! C-states: the cpuidle probe, the name to state index map and the
//! C-state phase of cpu consolidation.

use std::collections::BTreeMap;
use std::fs;

use cpm_shared::CpuId;
use cpm_sysfs::SysfsRoot;

use crate::cpu::Cpu;
use crate::errors::PowerError;
use crate::errors::PowerResult;
use crate::features::Feature;
use crate::features::FeatureError;
use crate::features::FeatureStatus;
use crate::host::Host;

/// A C-state selection: state name to enabled. States missing from the map
/// are left untouched.
pub type CStates = BTreeMap<String, bool>;

const CSTATES_DIR: &str = "cpuidle";
const CSTATES_DRIVER_FILE: &str = "cpuidle/current_driver";
const SUPPORTED_CSTATES_DRIVERS: [&str; 2] = ["intel_idle", "acpi_idle"];

fn state_name_file(index: usize) -> String {
    format!("{CSTATES_DIR}/state{index}/name")
}

fn state_disable_file(index: usize) -> String {
    format!("{CSTATES_DIR}/state{index}/disable")
}

pub(crate) fn probe_cstates(
    sysfs: &SysfsRoot,
) -> (FeatureStatus, Option<BTreeMap<String, usize>>) {
    let mut status = FeatureStatus::new(Feature::CStates);

    let driver = match sysfs.read_cpu_string(CpuId::new(0), CSTATES_DRIVER_FILE) {
        Ok(driver) => driver,
        Err(error) => {
            status.error = Some(FeatureError::probe(format!(
                "failed to determine driver: {error}"
            )));
            return (status, None);
        }
    };
    status.driver = driver.clone();
    if !SUPPORTED_CSTATES_DRIVERS.contains(&driver.as_str()) {
        status.error = Some(FeatureError::UnsupportedDriver(driver));
        return (status, None);
    }

    match map_available_cstates(sysfs) {
        Ok(names) => (status, Some(names)),
        Err(error) => {
            status.error = Some(FeatureError::probe(format!(
                "failed to enumerate states: {error}"
            )));
            (status, None)
        }
    }
}

/// Builds the name to sysfs state index map from the `state<N>` directories
/// of cpu 0.
fn map_available_cstates(sysfs: &SysfsRoot) -> PowerResult<BTreeMap<String, usize>> {
    let states_dir = sysfs.cpu_file(CpuId::new(0), CSTATES_DIR);
    let entries = fs::read_dir(&states_dir)
        .map_err(|error| cpm_sysfs::SysfsError::Read {
            path: states_dir.clone(),
            io_error: error,
        })?;

    let mut names = BTreeMap::new();
    for entry in entries {
        let entry = entry.map_err(|error| cpm_sysfs::SysfsError::Read {
            path: states_dir.clone(),
            io_error: error,
        })?;
        let file_name = entry.file_name();
        let dir_name = file_name.to_string_lossy();
        let Some(index_text) = dir_name.strip_prefix("state") else {
            continue;
        };
        let Ok(index) = index_text.parse::<usize>() else {
            continue;
        };

        let state_name = sysfs.read_cpu_string(CpuId::new(0), &state_name_file(index))?;
        names.insert(state_name, index);
    }
    Ok(names)
}

impl Host {
    /// Names of every C-state discovered at init, ordered by state index.
    pub fn available_cstates(&self) -> Vec<String> {
        let mut states: Vec<_> = self.cstate_names().iter().collect();
        states.sort_by_key(|(_, index)| **index);
        states.into_iter().map(|(name, _)| name.clone()).collect()
    }

    /// Checks that every state named by a selection exists on this machine.
    pub fn validate_cstates(&self, states: &CStates) -> PowerResult<()> {
        if !self.features().is_supported(Feature::CStates) {
            return Err(self.feature_unsupported(Feature::CStates));
        }
        for name in states.keys() {
            if !self.cstate_names().contains_key(name) {
                return Err(PowerError::UnknownCState(name.clone()));
            }
        }
        Ok(())
    }
}

impl Cpu {
    /// The C-state phase of consolidation. A silent no-op when C-states are
    /// unsupported. The effective selection is the cpu override, else the
    /// pool selection, else every state enabled.
    pub(crate) fn update_cstates(
        &self,
        host: &Host,
        cpu_cstates: Option<&CStates>,
        pool_cstates: Option<&CStates>,
    ) -> PowerResult<()> {
        if !host.features().is_supported(Feature::CStates) {
            return Ok(());
        }
        if let Some(states) = cpu_cstates {
            return self.apply_cstates(host, states);
        }
        if let Some(states) = pool_cstates {
            return self.apply_cstates(host, states);
        }
        let all_enabled: CStates = host
            .cstate_names()
            .keys()
            .map(|name| (name.clone(), true))
            .collect();
        self.apply_cstates(host, &all_enabled)
    }

    fn apply_cstates(&self, host: &Host, states: &CStates) -> PowerResult<()> {
        let mut failures = Vec::new();
        for (name, enabled) in states {
            let Some(index) = host.cstate_names().get(name).copied() else {
                failures.push(PowerError::UnknownCState(name.clone()));
                continue;
            };
            let value = if *enabled { "0" } else { "1" };
            if let Err(error) =
                host.sysfs()
                    .write_cpu_value(self.id(), &state_disable_file(index), value)
            {
                failures.push(error.into());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(PowerError::CStateWrites(failures))
        }
    }
}
