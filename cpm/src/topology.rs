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

//! The package / die / core / cpu tree, discovered once from sysfs and
//! immutable afterwards apart from the per node uncore override slots.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;

use cpm_shared::CoreId;
use cpm_shared::CpuId;
use cpm_shared::DieId;
use cpm_shared::PackageId;
use cpm_sysfs::SysfsRoot;

use crate::cpu::Cpu;
use crate::errors::PowerResult;
use crate::host::Host;
use crate::pool::Pool;
use crate::scaling::CoreTypeList;
use crate::scaling::CPUINFO_MAX_FREQ_FILE;
use crate::scaling::CPUINFO_MIN_FREQ_FILE;
use crate::uncore::Uncore;

const PACKAGE_ID_FILE: &str = "topology/physical_package_id";
const DIE_ID_FILE: &str = "topology/die_id";
const CORE_ID_FILE: &str = "topology/core_id";

pub struct Topology {
    packages: Vec<Arc<Package>>,
    cpus: Vec<Arc<Cpu>>,
    pub(crate) uncore: Mutex<Option<Uncore>>,
    pub(crate) host: Weak<Host>,
}

impl Topology {
    pub fn packages(&self) -> &[Arc<Package>] {
        &self.packages
    }

    pub fn package(&self, id: PackageId) -> Option<&Arc<Package>> {
        self.packages.iter().find(|package| package.id() == id)
    }

    /// Every cpu of the machine, indexed by its dense identifier.
    pub fn cpus(&self) -> &[Arc<Cpu>] {
        &self.cpus
    }

    pub fn cpu(&self, id: CpuId) -> Option<&Arc<Cpu>> {
        let index: usize = id.into();
        if let Some(cpu) = self.cpus.get(index) {
            if cpu.id() == id {
                return Some(cpu);
            }
        }
        self.cpus.iter().find(|cpu| cpu.id() == id)
    }
}

/// A physical cpu package (a socket).
pub struct Package {
    id: PackageId,
    dies: Vec<Arc<Die>>,
    cpus: Vec<Arc<Cpu>>,
    pub(crate) uncore: Mutex<Option<Uncore>>,
    pub(crate) host: Weak<Host>,
}

impl Package {
    pub fn id(&self) -> PackageId {
        self.id
    }

    pub fn dies(&self) -> &[Arc<Die>] {
        &self.dies
    }

    pub fn die(&self, id: DieId) -> Option<&Arc<Die>> {
        self.dies.iter().find(|die| die.id() == id)
    }

    pub fn cpus(&self) -> &[Arc<Cpu>] {
        &self.cpus
    }
}

pub struct Die {
    id: DieId,
    cores: Vec<Arc<Core>>,
    cpus: Vec<Arc<Cpu>>,
    pub(crate) uncore: Mutex<Option<Uncore>>,
    pub(crate) package: Weak<Package>,
}

impl Die {
    pub fn id(&self) -> DieId {
        self.id
    }

    pub fn cores(&self) -> &[Arc<Core>] {
        &self.cores
    }

    pub fn core(&self, id: CoreId) -> Option<&Arc<Core>> {
        self.cores.iter().find(|core| core.id() == id)
    }

    pub fn cpus(&self) -> &[Arc<Cpu>] {
        &self.cpus
    }

    pub fn package(&self) -> Option<Arc<Package>> {
        self.package.upgrade()
    }
}

/// A physical core, parent of one cpu, or two with SMT.
pub struct Core {
    id: CoreId,
    core_type: usize,
    cpus: Vec<Arc<Cpu>>,
    die: Weak<Die>,
}

impl Core {
    pub fn id(&self) -> CoreId {
        self.id
    }

    /// Index into the host's core type table.
    pub fn core_type(&self) -> usize {
        self.core_type
    }

    pub fn cpus(&self) -> &[Arc<Cpu>] {
        &self.cpus
    }

    pub fn die(&self) -> Option<Arc<Die>> {
        self.die.upgrade()
    }
}

pub(crate) struct DiscoveredCpu {
    pub(crate) id: u32,
    pub(crate) package_id: u32,
    pub(crate) die_id: u32,
    pub(crate) core_id: u32,
    pub(crate) core_type: usize,
}

pub(crate) struct DiscoveredTopology {
    pub(crate) cpus: Vec<DiscoveredCpu>,
    pub(crate) core_types: CoreTypeList,
}

/// Reads the topology identifiers of every online cpu. When frequency
/// scaling works the hardware envelope of each cpu feeds the core type
/// table. Any read failure aborts host construction.
pub(crate) fn discover(
    sysfs: &SysfsRoot,
    cpu_count: u32,
    read_freq_ranges: bool,
) -> PowerResult<DiscoveredTopology> {
    let mut core_types = CoreTypeList::default();
    let mut cpus = Vec::with_capacity(cpu_count as usize);
    for id in 0..cpu_count {
        let cpu = CpuId::new(id);
        let package_id = sysfs.read_cpu_u64(cpu, PACKAGE_ID_FILE)? as u32;
        let die_id = sysfs.read_cpu_u64(cpu, DIE_ID_FILE)? as u32;
        let core_id = sysfs.read_cpu_u64(cpu, CORE_ID_FILE)? as u32;
        let core_type = if read_freq_ranges {
            let min_khz = sysfs.read_cpu_u64(cpu, CPUINFO_MIN_FREQ_FILE)?;
            let max_khz = sysfs.read_cpu_u64(cpu, CPUINFO_MAX_FREQ_FILE)?;
            core_types.append_if_unique(min_khz, max_khz)
        } else {
            0
        };
        cpus.push(DiscoveredCpu {
            id,
            package_id,
            die_id,
            core_id,
            core_type,
        });
    }
    Ok(DiscoveredTopology { cpus, core_types })
}

impl Topology {
    /// Builds the immutable tree out of the discovery records. Every cpu
    /// starts in the given pool.
    pub(crate) fn assemble(
        host: &Weak<Host>,
        discovered: &[DiscoveredCpu],
        initial_pool: &Arc<Pool>,
    ) -> Topology {
        let mut grouped: BTreeMap<u32, BTreeMap<u32, BTreeMap<u32, Vec<&DiscoveredCpu>>>> =
            BTreeMap::new();
        for record in discovered {
            grouped
                .entry(record.package_id)
                .or_default()
                .entry(record.die_id)
                .or_default()
                .entry(record.core_id)
                .or_default()
                .push(record);
        }

        let mut all_cpus: Vec<Arc<Cpu>> = Vec::with_capacity(discovered.len());
        let mut packages = Vec::with_capacity(grouped.len());
        for (package_id, dies) in &grouped {
            let package = Arc::new_cyclic(|package_ref: &Weak<Package>| {
                let mut package_cpus = Vec::new();
                let mut die_nodes = Vec::with_capacity(dies.len());
                for (die_id, cores) in dies {
                    let die = Arc::new_cyclic(|die_ref: &Weak<Die>| {
                        let mut die_cpus = Vec::new();
                        let mut core_nodes = Vec::with_capacity(cores.len());
                        for (core_id, members) in cores {
                            let core = Arc::new_cyclic(|core_ref: &Weak<Core>| {
                                let cpus: Vec<Arc<Cpu>> = members
                                    .iter()
                                    .map(|member| {
                                        Arc::new(Cpu::new(
                                            CpuId::new(member.id),
                                            member.core_type,
                                            host.clone(),
                                            core_ref.clone(),
                                            initial_pool.clone(),
                                        ))
                                    })
                                    .collect();
                                Core {
                                    id: CoreId::new(*core_id),
                                    core_type: members[0].core_type,
                                    cpus,
                                    die: die_ref.clone(),
                                }
                            });
                            die_cpus.extend(core.cpus().iter().cloned());
                            all_cpus.extend(core.cpus().iter().cloned());
                            core_nodes.push(core);
                        }
                        Die {
                            id: DieId::new(*die_id),
                            cores: core_nodes,
                            cpus: die_cpus,
                            uncore: Mutex::new(None),
                            package: package_ref.clone(),
                        }
                    });
                    package_cpus.extend(die.cpus().iter().cloned());
                    die_nodes.push(die);
                }
                Package {
                    id: PackageId::new(*package_id),
                    dies: die_nodes,
                    cpus: package_cpus,
                    uncore: Mutex::new(None),
                    host: host.clone(),
                }
            });
            packages.push(package);
        }
        all_cpus.sort_by_key(|cpu| cpu.id());

        Topology {
            packages,
            cpus: all_cpus,
            uncore: Mutex::new(None),
            host: host.clone(),
        }
    }
}
