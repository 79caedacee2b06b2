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

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;

use cpm_config::LibConfig;
use cpm_shared::CpuId;
use cpm_sysfs::SysfsRoot;

use crate::cpu::Cpu;
use crate::cstates;
use crate::errors::PowerError;
use crate::errors::PowerResult;
use crate::features::Feature;
use crate::features::FeatureError;
use crate::features::FeatureSet;
use crate::pool::Pool;
use crate::pool::PoolKind;
use crate::profile::PowerProfile;
use crate::scaling;
use crate::scaling::CoreTypeList;
use crate::scaling::SUPPORTED_CORE_TYPES;
use crate::topology;
use crate::topology::DiscoveredTopology;
use crate::topology::Topology;
use crate::uncore;
use crate::uncore::Uncore;

pub const RESERVED_POOL_NAME: &str = "reserved";
pub const SHARED_POOL_NAME: &str = "shared";

/// The machine under management: the topology, the feature registry
/// snapshot, the two permanent pools and the exclusive pools. Created once
/// per process; nothing is written back at teardown.
pub struct Host {
    name: String,
    sysfs: SysfsRoot,
    features: FeatureSet,
    available_governors: Vec<String>,
    default_profile: Option<PowerProfile>,
    core_types: CoreTypeList,
    cstate_names: BTreeMap<String, usize>,
    uncore_init: Option<Uncore>,
    topology: Topology,
    reserved: Arc<Pool>,
    shared: Arc<Pool>,
    exclusive: Mutex<Vec<Arc<Pool>>>,
}

impl Host {
    /// Creates a host against the real kernel interfaces.
    pub fn create(name: impl Into<String>) -> PowerResult<Arc<Host>> {
        Self::create_with_config(name, &LibConfig::default())
    }

    /// Creates a host: runs every feature probe, discovers the topology
    /// and puts every cpu into the reserved pool.
    ///
    /// Individual probe failures are not fatal; they are logged and stay
    /// queryable through [`Host::features`]. Construction only fails when
    /// no feature at all is supported or when discovery fails.
    pub fn create_with_config(
        name: impl Into<String>,
        config: &LibConfig,
    ) -> PowerResult<Arc<Host>> {
        let sysfs = SysfsRoot::new(&config.cpu_path);

        let mut features = FeatureSet::uninitialised();
        let (scaling_status, scaling_info) = scaling::probe_frequency_scaling(&sysfs);
        features.set(Feature::FrequencyScaling, scaling_status);
        features.set(Feature::Epp, scaling::probe_epp(&sysfs));
        let (cstates_status, cstate_names) = cstates::probe_cstates(&sysfs);
        features.set(Feature::CStates, cstates_status);
        let (uncore_status, uncore_init) = uncore::probe_uncore(&sysfs, &config.module_path);
        features.set(Feature::Uncore, uncore_status);

        if !features.any_supported() {
            return Err(PowerError::NoSupportedFeatures {
                errors: features.errors(),
            });
        }
        for (feature, error) in features.errors() {
            tracing::warn!("feature {feature} is unavailable: {error}");
        }

        let cpu_count = match config.cpu_count {
            Some(count) => count,
            None => detected_cpu_count(&sysfs),
        };
        let scaling_supported = features.is_supported(Feature::FrequencyScaling);
        let DiscoveredTopology {
            cpus: discovered,
            mut core_types,
        } = topology::discover(&sysfs, cpu_count, scaling_supported)?;
        core_types.compute_references();
        if core_types.len() > SUPPORTED_CORE_TYPES {
            tracing::warn!(
                "{} core types detected, more than the supported {}",
                core_types.len(),
                SUPPORTED_CORE_TYPES
            );
        }

        let mut default_profile = scaling_info
            .as_ref()
            .map(|info| info.default_profile.clone());
        if scaling_supported && core_types.len() == SUPPORTED_CORE_TYPES {
            if let (Some(profile), Some(pcore), Some(ecore)) = (
                default_profile.as_mut(),
                core_types.get(core_types.pcore_index()),
                core_types.get(core_types.ecore_index()),
            ) {
                profile.min_khz = pcore.min_khz();
                profile.max_khz = pcore.max_khz();
                profile.efficient = Some(ecore);
            }
        }

        let available_governors = scaling_info
            .map(|info| info.governors)
            .unwrap_or_default();
        let cstate_names = cstate_names.unwrap_or_default();
        let name = name.into();

        let host = Arc::new_cyclic(|weak: &Weak<Host>| {
            let reserved = Arc::new(Pool::new(
                RESERVED_POOL_NAME,
                PoolKind::Reserved,
                weak.clone(),
            ));
            let shared = Arc::new(Pool::new(SHARED_POOL_NAME, PoolKind::Shared, weak.clone()));
            let topology = Topology::assemble(weak, &discovered, &reserved);
            reserved.seed_cpus(topology.cpus().iter().map(|cpu| cpu.id()));
            Host {
                name,
                sysfs,
                features,
                available_governors,
                default_profile,
                core_types,
                cstate_names,
                uncore_init,
                topology,
                reserved,
                shared,
                exclusive: Mutex::new(Vec::new()),
            }
        });
        tracing::info!(
            "discovered {} cpus on host {}",
            host.topology.cpus().len(),
            host.name
        );
        Ok(host)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    /// All failed features with their probe errors.
    pub fn feature_errors(&self) -> Vec<(Feature, FeatureError)> {
        self.features.errors()
    }

    pub(crate) fn feature_unsupported(&self, feature: Feature) -> PowerError {
        PowerError::FeatureUnsupported {
            feature,
            source: self
                .features
                .error(feature)
                .unwrap_or(FeatureError::Undefined),
        }
    }

    pub fn reserved_pool(&self) -> &Arc<Pool> {
        &self.reserved
    }

    pub fn shared_pool(&self) -> &Arc<Pool> {
        &self.shared
    }

    /// Creates a new, empty exclusive pool. The names of the permanent
    /// pools are rejected, as are duplicates.
    pub fn add_exclusive_pool(self: &Arc<Self>, name: impl Into<String>) -> PowerResult<Arc<Pool>> {
        let name = name.into();
        if name == RESERVED_POOL_NAME || name == SHARED_POOL_NAME {
            return Err(PowerError::ReservedPoolName(name));
        }
        let mut pools = self.exclusive.lock();
        if pools.iter().any(|pool| pool.name() == name) {
            return Err(PowerError::PoolExists(name));
        }
        let pool = Arc::new(Pool::new(name, PoolKind::Exclusive, Arc::downgrade(self)));
        pools.push(pool.clone());
        Ok(pool)
    }

    pub fn exclusive_pool(&self, name: &str) -> Option<Arc<Pool>> {
        self.exclusive
            .lock()
            .iter()
            .find(|pool| pool.name() == name)
            .cloned()
    }

    pub fn exclusive_pools(&self) -> Vec<Arc<Pool>> {
        self.exclusive.lock().clone()
    }

    pub(crate) fn remove_exclusive_pool(&self, pool: &Arc<Pool>) -> PowerResult<()> {
        let mut pools = self.exclusive.lock();
        match pools.iter().position(|candidate| Arc::ptr_eq(candidate, pool)) {
            Some(position) => {
                pools.remove(position);
                Ok(())
            }
            None => Err(PowerError::UnknownPool(pool.name().to_string())),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Every cpu of the machine, indexed by identifier.
    pub fn cpus(&self) -> &[Arc<Cpu>] {
        self.topology.cpus()
    }

    pub fn cpu(&self, id: CpuId) -> Option<&Arc<Cpu>> {
        self.topology.cpu(id)
    }

    pub(crate) fn cpus_by_ids(&self, ids: &[CpuId]) -> PowerResult<Vec<Arc<Cpu>>> {
        ids.iter()
            .map(|id| {
                self.cpu(*id)
                    .cloned()
                    .ok_or(PowerError::UnknownCpu(*id))
            })
            .collect()
    }

    /// Distinct hardware envelopes observed during discovery.
    pub fn core_types(&self) -> &CoreTypeList {
        &self.core_types
    }

    pub fn num_core_types(&self) -> usize {
        self.core_types.len()
    }

    /// Governor names the kernel offered at init.
    pub fn available_governors(&self) -> &[String] {
        &self.available_governors
    }

    pub(crate) fn sysfs(&self) -> &SysfsRoot {
        &self.sysfs
    }

    pub(crate) fn default_profile(&self) -> Option<&PowerProfile> {
        self.default_profile.as_ref()
    }

    pub(crate) fn cstate_names(&self) -> &BTreeMap<String, usize> {
        &self.cstate_names
    }

    pub(crate) fn uncore_init(&self) -> Option<Uncore> {
        self.uncore_init
    }
}

fn detected_cpu_count(sysfs: &SysfsRoot) -> u32 {
    sysfs.online_cpu_count().unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|count| count.get() as u32)
            .unwrap_or(1)
    })
}
