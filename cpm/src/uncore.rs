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

//! Uncore frequency limits: the module probe, the validated value object
//! and per die application with die > package > topology inheritance.

use std::fs;
use std::path::Path;

use cpm_shared::DieId;
use cpm_shared::PackageId;
use cpm_sysfs::kernel_module_loaded;
use cpm_sysfs::SysfsRoot;

use crate::errors::PowerError;
use crate::errors::PowerResult;
use crate::features::Feature;
use crate::features::FeatureError;
use crate::features::FeatureStatus;
use crate::host::Host;
use crate::topology::Die;
use crate::topology::Package;
use crate::topology::Topology;

const UNCORE_KMOD_NAME: &str = "intel_uncore_frequency";
const UNCORE_DIR_NAME: &str = "intel_uncore_frequency";

const UNCORE_INIT_MAX_FREQ_FILE: &str = "initial_max_freq_khz";
const UNCORE_INIT_MIN_FREQ_FILE: &str = "initial_min_freq_khz";
const UNCORE_MAX_FREQ_FILE: &str = "max_freq_khz";
const UNCORE_MIN_FREQ_FILE: &str = "min_freq_khz";

/// The uncore driver accepts frequencies in 100 MHz steps.
const UNCORE_STEP_KHZ: u64 = 100_000;

/// An uncore frequency window in kHz, validated against the hardware range
/// and normalized to the driver step on construction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Uncore {
    pub(crate) min_khz: u64,
    pub(crate) max_khz: u64,
}

impl Uncore {
    pub fn min_khz(&self) -> u64 {
        self.min_khz
    }

    pub fn max_khz(&self) -> u64 {
        self.max_khz
    }
}

fn uncore_die_dir(package: PackageId, die: DieId) -> String {
    format!("{UNCORE_DIR_NAME}/package_{package:02}_die_{die:02}")
}

fn is_uncore_die_dir(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("package_") else {
        return false;
    };
    match rest.split_once("_die_") {
        Some((package, die)) => package.parse::<u32>().is_ok() && die.parse::<u32>().is_ok(),
        None => false,
    }
}

pub(crate) fn normalize_uncore_khz(freq_khz: u64) -> u64 {
    freq_khz - (freq_khz % UNCORE_STEP_KHZ)
}

pub(crate) fn probe_uncore(
    sysfs: &SysfsRoot,
    modules_path: &Path,
) -> (FeatureStatus, Option<Uncore>) {
    let mut status = FeatureStatus::new(Feature::Uncore);

    if !kernel_module_loaded(modules_path, UNCORE_KMOD_NAME) {
        status.error = Some(FeatureError::probe(format!(
            "kernel module {UNCORE_KMOD_NAME} not loaded"
        )));
        return (status, None);
    }

    let uncore_dir = sysfs.file(UNCORE_DIR_NAME);
    let entries = match fs::read_dir(&uncore_dir) {
        Ok(entries) => entries,
        Err(error) => {
            status.error = Some(FeatureError::probe(format!(
                "failed to open the uncore interface dir: {error}"
            )));
            return (status, None);
        }
    };
    let mut die_dirs: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| is_uncore_die_dir(name))
        .collect();
    die_dirs.sort();
    let Some(first) = die_dirs.first() else {
        status.error = Some(FeatureError::probe(
            "uncore interface dir empty or invalid".to_string(),
        ));
        return (status, None);
    };

    let init_max = sysfs.read_u64(&format!("{UNCORE_DIR_NAME}/{first}/{UNCORE_INIT_MAX_FREQ_FILE}"));
    let init_min = sysfs.read_u64(&format!("{UNCORE_DIR_NAME}/{first}/{UNCORE_INIT_MIN_FREQ_FILE}"));
    match (init_min, init_max) {
        (Ok(min_khz), Ok(max_khz)) => (status, Some(Uncore { min_khz, max_khz })),
        (Err(error), _) | (_, Err(error)) => {
            status.error = Some(FeatureError::probe(format!(
                "failed to determine init freq: {error}"
            )));
            (status, None)
        }
    }
}

impl Host {
    /// Builds an uncore window. The values must lie inside the hardware
    /// range reported at init and are truncated down to 100 MHz steps.
    pub fn new_uncore(&self, min_khz: u64, max_khz: u64) -> PowerResult<Uncore> {
        if !self.features().is_supported(Feature::Uncore) {
            return Err(self.feature_unsupported(Feature::Uncore));
        }
        let Some(hardware) = self.uncore_init() else {
            return Err(self.feature_unsupported(Feature::Uncore));
        };
        if min_khz < hardware.min_khz || max_khz > hardware.max_khz {
            return Err(PowerError::UncoreOutOfBounds {
                min_khz,
                max_khz,
                hw_min_khz: hardware.min_khz,
                hw_max_khz: hardware.max_khz,
            });
        }
        if max_khz < min_khz {
            return Err(PowerError::MaxBelowMin { min_khz, max_khz });
        }

        let normalized_min = normalize_uncore_khz(min_khz);
        if normalized_min != min_khz {
            tracing::info!(
                "uncore min frequency normalized from {min_khz} to {normalized_min} kHz"
            );
        }
        let normalized_max = normalize_uncore_khz(max_khz);
        if normalized_max != max_khz {
            tracing::info!(
                "uncore max frequency normalized from {max_khz} to {normalized_max} kHz"
            );
        }
        Ok(Uncore {
            min_khz: normalized_min,
            max_khz: normalized_max,
        })
    }
}

impl Topology {
    /// Sets or clears the machine wide uncore default and applies the
    /// effective value to every die.
    pub fn set_uncore(&self, uncore: Option<Uncore>) -> PowerResult<()> {
        *self.uncore.lock() = uncore;
        self.apply_uncore()
    }

    fn apply_uncore(&self) -> PowerResult<()> {
        for package in self.packages() {
            package.apply_uncore()?;
        }
        Ok(())
    }

    pub(crate) fn effective_uncore(&self) -> Option<Uncore> {
        let value = *self.uncore.lock();
        value.or_else(|| self.host.upgrade().and_then(|host| host.uncore_init()))
    }
}

impl Package {
    /// Sets or clears this package's uncore override and applies the
    /// effective value to every contained die.
    pub fn set_uncore(&self, uncore: Option<Uncore>) -> PowerResult<()> {
        *self.uncore.lock() = uncore;
        self.apply_uncore()
    }

    fn apply_uncore(&self) -> PowerResult<()> {
        for die in self.dies() {
            die.apply_uncore()?;
        }
        Ok(())
    }

    pub(crate) fn effective_uncore(&self) -> Option<Uncore> {
        let value = *self.uncore.lock();
        value.or_else(|| {
            self.host
                .upgrade()
                .and_then(|host| host.topology().effective_uncore())
        })
    }
}

impl Die {
    /// Sets or clears this die's uncore override and writes the effective
    /// value to its sysfs files.
    pub fn set_uncore(&self, uncore: Option<Uncore>) -> PowerResult<()> {
        *self.uncore.lock() = uncore;
        self.apply_uncore()
    }

    pub(crate) fn apply_uncore(&self) -> PowerResult<()> {
        let package = self.package().ok_or(PowerError::HostReleased)?;
        let host = package.host.upgrade().ok_or(PowerError::HostReleased)?;
        if !host.features().is_supported(Feature::Uncore) {
            return Err(host.feature_unsupported(Feature::Uncore));
        }
        let Some(uncore) = self.effective_uncore() else {
            return Ok(());
        };

        let die_dir = uncore_die_dir(package.id(), self.id());
        host.sysfs()
            .write_value(&format!("{die_dir}/{UNCORE_MAX_FREQ_FILE}"), uncore.max_khz)?;
        host.sysfs()
            .write_value(&format!("{die_dir}/{UNCORE_MIN_FREQ_FILE}"), uncore.min_khz)?;
        Ok(())
    }

    pub(crate) fn effective_uncore(&self) -> Option<Uncore> {
        let value = *self.uncore.lock();
        value.or_else(|| self.package().and_then(|package| package.effective_uncore()))
    }
}
