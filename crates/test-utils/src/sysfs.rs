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

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use tempfile::TempDir;

use cpm_config::LibConfig;

/// One fake logical CPU and the sysfs attributes created for it.
#[derive(Clone, Debug)]
pub struct CpuSpec {
    pub id: u32,
    pub package: u32,
    pub die: u32,
    pub core: u32,
    pub min_khz: u64,
    pub max_khz: u64,
    pub driver: String,
    pub governors: String,
    pub governor: String,
    pub epp: Option<String>,
    /// C-state directories as (name, sysfs state index) pairs.
    pub cstates: Vec<(String, u32)>,
}

impl CpuSpec {
    /// A P-core-ish default: one cpu per core, package 0, die 0,
    /// intel_pstate with the powersave governor active.
    pub fn new(id: u32) -> Self {
        Self {
            id,
            package: 0,
            die: 0,
            core: id,
            min_khz: 100_000,
            max_khz: 2_400_000,
            driver: "intel_pstate".to_string(),
            governors: "performance powersave".to_string(),
            governor: "powersave".to_string(),
            epp: Some("default".to_string()),
            cstates: Vec::new(),
        }
    }

    pub fn package(mut self, package: u32) -> Self {
        self.package = package;
        self
    }

    pub fn die(mut self, die: u32) -> Self {
        self.die = die;
        self
    }

    pub fn core(mut self, core: u32) -> Self {
        self.core = core;
        self
    }

    pub fn freqs(mut self, min_khz: u64, max_khz: u64) -> Self {
        self.min_khz = min_khz;
        self.max_khz = max_khz;
        self
    }

    pub fn driver(mut self, driver: &str) -> Self {
        self.driver = driver.to_string();
        self
    }

    pub fn governors(mut self, governors: &str) -> Self {
        self.governors = governors.to_string();
        self
    }

    pub fn governor(mut self, governor: &str) -> Self {
        self.governor = governor.to_string();
        self
    }

    pub fn epp(mut self, epp: Option<&str>) -> Self {
        self.epp = epp.map(str::to_string);
        self
    }

    pub fn cstates(mut self, cstates: &[(&str, u32)]) -> Self {
        self.cstates = cstates
            .iter()
            .map(|(name, index)| (name.to_string(), *index))
            .collect();
        self
    }
}

#[derive(Default)]
pub struct FakeSysfsBuilder {
    cpus: Vec<CpuSpec>,
    cstates_driver: Option<String>,
    uncore_dies: Vec<(u32, u32)>,
    uncore_init: Option<(u64, u64)>,
    modules: Vec<String>,
    online: Option<String>,
}

impl FakeSysfsBuilder {
    pub fn cpu(mut self, spec: CpuSpec) -> Self {
        self.cpus.push(spec);
        self
    }

    /// Adds `count` identical CPUs on package 0 / die 0, one cpu per core.
    pub fn homogeneous(mut self, count: u32, min_khz: u64, max_khz: u64) -> Self {
        for id in 0..count {
            self.cpus.push(CpuSpec::new(id).freqs(min_khz, max_khz));
        }
        self
    }

    pub fn cstates_driver(mut self, driver: &str) -> Self {
        self.cstates_driver = Some(driver.to_string());
        self
    }

    pub fn uncore(mut self, dies: &[(u32, u32)], init_min_khz: u64, init_max_khz: u64) -> Self {
        self.uncore_dies = dies.to_vec();
        self.uncore_init = Some((init_min_khz, init_max_khz));
        self
    }

    pub fn module(mut self, name: &str) -> Self {
        self.modules.push(name.to_string());
        self
    }

    pub fn online(mut self, range: &str) -> Self {
        self.online = Some(range.to_string());
        self
    }

    pub fn build(self) -> FakeSysfs {
        let dir = TempDir::new().expect("failed to create a fake sysfs tempdir");
        let base = dir.path().join("cpus");
        let cpu_count = self.cpus.len() as u32;

        for spec in &self.cpus {
            let cpu_dir = base.join(format!("cpu{}", spec.id));
            let topology = cpu_dir.join("topology");
            fs::create_dir_all(&topology).unwrap();
            fs::write(topology.join("physical_package_id"), format!("{}\n", spec.package)).unwrap();
            fs::write(topology.join("die_id"), format!("{}\n", spec.die)).unwrap();
            fs::write(topology.join("core_id"), format!("{}\n", spec.core)).unwrap();

            let cpufreq = cpu_dir.join("cpufreq");
            fs::create_dir_all(&cpufreq).unwrap();
            fs::write(cpufreq.join("scaling_driver"), format!("{}\n", spec.driver)).unwrap();
            fs::write(
                cpufreq.join("scaling_available_governors"),
                format!("{}\n", spec.governors),
            )
            .unwrap();
            fs::write(cpufreq.join("cpuinfo_min_freq"), format!("{}\n", spec.min_khz)).unwrap();
            fs::write(cpufreq.join("cpuinfo_max_freq"), format!("{}\n", spec.max_khz)).unwrap();
            fs::write(cpufreq.join("scaling_min_freq"), format!("{}", spec.min_khz)).unwrap();
            fs::write(cpufreq.join("scaling_max_freq"), format!("{}", spec.max_khz)).unwrap();
            fs::write(cpufreq.join("scaling_governor"), spec.governor.as_bytes()).unwrap();
            if let Some(epp) = &spec.epp {
                fs::write(cpufreq.join("energy_performance_preference"), epp.as_bytes()).unwrap();
            }

            for (name, index) in &spec.cstates {
                let state_dir = cpu_dir.join("cpuidle").join(format!("state{index}"));
                fs::create_dir_all(&state_dir).unwrap();
                fs::write(state_dir.join("name"), format!("{name}\n")).unwrap();
                fs::write(state_dir.join("disable"), "0").unwrap();
            }
        }

        if let Some(driver) = &self.cstates_driver {
            let cpuidle = base.join("cpu0").join("cpuidle");
            fs::create_dir_all(&cpuidle).unwrap();
            fs::write(cpuidle.join("current_driver"), format!("{driver}\n")).unwrap();
        }

        if let Some((init_min, init_max)) = self.uncore_init {
            for (package, die) in &self.uncore_dies {
                let die_dir = base
                    .join("intel_uncore_frequency")
                    .join(format!("package_{package:02}_die_{die:02}"));
                fs::create_dir_all(&die_dir).unwrap();
                fs::write(die_dir.join("initial_min_freq_khz"), format!("{init_min}\n")).unwrap();
                fs::write(die_dir.join("initial_max_freq_khz"), format!("{init_max}\n")).unwrap();
                fs::write(die_dir.join("min_freq_khz"), format!("{init_min}")).unwrap();
                fs::write(die_dir.join("max_freq_khz"), format!("{init_max}")).unwrap();
            }
        }

        fs::create_dir_all(&base).unwrap();
        let online = self
            .online
            .unwrap_or_else(|| format!("0-{}", cpu_count.saturating_sub(1)));
        fs::write(base.join("online"), format!("{online}\n")).unwrap();

        let modules_path = dir.path().join("modules");
        let mut listing = String::from("ext4 745472 4 - Live 0x0000000000000000\n");
        for module in &self.modules {
            listing.push_str(&format!("{module} 16384 0 - Live 0x0000000000000000\n"));
        }
        fs::write(&modules_path, listing).unwrap();

        FakeSysfs {
            dir,
            base,
            modules_path,
            cpu_count,
        }
    }
}

/// A fake sysfs tree on disk, removed on drop.
pub struct FakeSysfs {
    #[allow(dead_code)]
    dir: TempDir,
    base: PathBuf,
    modules_path: PathBuf,
    cpu_count: u32,
}

impl FakeSysfs {
    pub fn builder() -> FakeSysfsBuilder {
        FakeSysfsBuilder::default()
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    pub fn modules_path(&self) -> &Path {
        &self.modules_path
    }

    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    /// A `LibConfig` pointing the library at this tree.
    pub fn config(&self) -> LibConfig {
        LibConfig {
            cpu_path: self.base.clone(),
            module_path: self.modules_path.clone(),
            cpu_count: Some(self.cpu_count),
        }
    }

    /// Reads a file below the base path, trimming a trailing newline.
    pub fn read(&self, relative: &str) -> String {
        let raw = fs::read_to_string(self.base.join(relative))
            .unwrap_or_else(|error| panic!("failed to read fake sysfs file {relative}: {error}"));
        raw.strip_suffix('\n').unwrap_or(&raw).to_string()
    }

    /// Reads a property of one cpu, e.g. `cpufreq/scaling_governor`.
    pub fn read_cpu(&self, cpu: u32, relative: &str) -> String {
        self.read(&format!("cpu{cpu}/{relative}"))
    }

    /// Removes a file or directory below the base path, to provoke IO
    /// failures in the code under test.
    pub fn remove(&self, relative: &str) {
        let path = self.base.join(relative);
        if path.is_dir() {
            fs::remove_dir_all(&path).unwrap();
        } else {
            fs::remove_file(&path).unwrap();
        }
    }
}
