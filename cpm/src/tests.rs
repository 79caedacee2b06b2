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
use std::thread;
use std::time::Duration;

use cpm_shared::CpuId;
use cpm_test_utils::CpuSpec;
use cpm_test_utils::FakeSysfs;

use crate::CStates;
use crate::Host;
use crate::Pool;
use crate::PowerError;

fn sorted_ids(pool: &Arc<Pool>) -> Vec<u32> {
    let mut ids: Vec<u32> = pool.cpu_ids().into_iter().map(u32::from).collect();
    ids.sort_unstable();
    ids
}

fn selection(pairs: &[(&str, bool)]) -> CStates {
    pairs
        .iter()
        .map(|(name, enabled)| (name.to_string(), *enabled))
        .collect()
}

/// Every cpu must belong to exactly one pool, and the pool back pointer
/// must agree with the membership lists.
fn assert_partition(host: &Arc<Host>) {
    let mut pools: Vec<Arc<Pool>> =
        vec![host.reserved_pool().clone(), host.shared_pool().clone()];
    pools.extend(host.exclusive_pools());

    let mut seen: Vec<u32> = Vec::new();
    for pool in &pools {
        for cpu in pool.cpus() {
            assert!(
                Arc::ptr_eq(&cpu.pool(), pool),
                "cpu {} pool pointer disagrees with membership",
                cpu.id()
            );
            seen.push(cpu.id().into());
        }
    }
    seen.sort_unstable();
    let expected: Vec<u32> = (0..host.cpus().len() as u32).collect();
    assert_eq!(seen, expected);
}

fn homogeneous_host(count: u32) -> (FakeSysfs, Arc<Host>) {
    let fake = FakeSysfs::builder()
        .homogeneous(count, 100_000, 2_400_000)
        .build();
    let host = Host::create_with_config("host1", &fake.config()).unwrap();
    (fake, host)
}

/// CPUs 0..4 as performance cores, 4..8 as efficient cores.
fn heterogeneous_host() -> (FakeSysfs, Arc<Host>) {
    let mut builder = FakeSysfs::builder();
    for id in 0..4u32 {
        builder = builder.cpu(CpuSpec::new(id).freqs(200_000, 3_200_000));
    }
    for id in 4..8u32 {
        builder = builder.cpu(CpuSpec::new(id).freqs(200_000, 1_800_000));
    }
    let fake = builder.build();
    let host = Host::create_with_config("host1", &fake.config()).unwrap();
    (fake, host)
}

#[test]
fn bootstrap_places_every_cpu_in_the_reserved_pool() {
    let (_fake, host) = homogeneous_host(4);

    assert_eq!(sorted_ids(host.reserved_pool()), vec![0, 1, 2, 3]);
    assert!(host.shared_pool().cpu_ids().is_empty());
    assert!(host.exclusive_pools().is_empty());

    assert_eq!(host.num_core_types(), 1);
    assert_eq!(host.core_types().pcore_index(), 0);
    assert_eq!(host.core_types().ecore_index(), 0);
    assert_partition(&host);
}

#[test]
fn moving_cpus_into_an_exclusive_pool_applies_its_profile() {
    let mut builder = FakeSysfs::builder();
    for id in 0..4u32 {
        builder = builder.cpu(CpuSpec::new(id).governor("performance"));
    }
    let fake = builder.build();
    let host = Host::create_with_config("host1", &fake.config()).unwrap();

    let hot = host.add_exclusive_pool("hot").unwrap();
    let profile = host
        .new_power_profile("hot", 1_500_000, 2_400_000, "powersave", "performance")
        .unwrap();
    hot.set_power_profile(Some(profile)).unwrap();

    let targets = [CpuId::new(1), CpuId::new(2)];
    host.shared_pool().move_cpu_ids(&targets).unwrap();
    hot.move_cpu_ids(&targets).unwrap();

    assert_eq!(sorted_ids(host.reserved_pool()), vec![0, 3]);
    assert_eq!(sorted_ids(&hot), vec![1, 2]);
    assert_partition(&host);

    for id in [1u32, 2] {
        assert_eq!(fake.read_cpu(id, "cpufreq/scaling_governor"), "powersave");
        assert_eq!(
            fake.read_cpu(id, "cpufreq/energy_performance_preference"),
            "performance"
        );
        assert_eq!(fake.read_cpu(id, "cpufreq/scaling_max_freq"), "2400000");
        assert_eq!(fake.read_cpu(id, "cpufreq/scaling_min_freq"), "1500000");
    }
    for id in [0u32, 3] {
        assert_eq!(fake.read_cpu(id, "cpufreq/scaling_governor"), "performance");
        assert_eq!(
            fake.read_cpu(id, "cpufreq/energy_performance_preference"),
            "default"
        );
        assert_eq!(fake.read_cpu(id, "cpufreq/scaling_max_freq"), "2400000");
        assert_eq!(fake.read_cpu(id, "cpufreq/scaling_min_freq"), "100000");
    }
}

#[test]
fn exclusive_members_cannot_move_to_reserved() {
    let (fake, host) = homogeneous_host(4);

    let hot = host.add_exclusive_pool("hot").unwrap();
    host.shared_pool()
        .move_cpu_ids(&[CpuId::new(1)])
        .unwrap();
    hot.move_cpu_ids(&[CpuId::new(1)]).unwrap();

    let governor_before = fake.read_cpu(1, "cpufreq/scaling_governor");
    let cpu = host.cpu(CpuId::new(1)).unwrap();
    let result = cpu.set_pool(host.reserved_pool());

    assert!(matches!(result, Err(PowerError::InvalidTransition { .. })));
    assert_eq!(sorted_ids(&hot), vec![1]);
    assert!(Arc::ptr_eq(&cpu.pool(), &hot));
    assert_eq!(fake.read_cpu(1, "cpufreq/scaling_governor"), governor_before);
    assert_partition(&host);
}

#[test]
fn pool_movement_state_machine_matrix() {
    let (_fake, host) = homogeneous_host(4);
    let hot = host.add_exclusive_pool("hot").unwrap();
    let cold = host.add_exclusive_pool("cold").unwrap();
    let cpu = host.cpu(CpuId::new(0)).unwrap();

    // reserved -> reserved is a no-op
    cpu.set_pool(host.reserved_pool()).unwrap();
    assert!(Arc::ptr_eq(&cpu.pool(), host.reserved_pool()));

    // reserved -> exclusive is rejected
    assert!(matches!(
        cpu.set_pool(&hot),
        Err(PowerError::InvalidTransition { .. })
    ));

    // reserved -> shared, shared -> exclusive are allowed
    cpu.set_pool(host.shared_pool()).unwrap();
    cpu.set_pool(&hot).unwrap();

    // exclusive -> same exclusive is a no-op
    cpu.set_pool(&hot).unwrap();
    assert!(Arc::ptr_eq(&cpu.pool(), &hot));

    // exclusive -> different exclusive and exclusive -> reserved are rejected
    assert!(matches!(
        cpu.set_pool(&cold),
        Err(PowerError::InvalidTransition { .. })
    ));
    assert!(matches!(
        cpu.set_pool(host.reserved_pool()),
        Err(PowerError::InvalidTransition { .. })
    ));

    // exclusive -> shared -> reserved closes the loop
    cpu.set_pool(host.shared_pool()).unwrap();
    cpu.set_pool(host.reserved_pool()).unwrap();
    assert_partition(&host);
}

#[test]
fn heterogeneous_profile_splits_pcore_and_ecore_windows() {
    let (fake, host) = heterogeneous_host();

    assert_eq!(host.num_core_types(), 2);
    let core_types = host.core_types();
    assert_eq!(
        core_types.get(core_types.pcore_index()).unwrap().max_khz(),
        3_200_000
    );

    let profile = host
        .new_ecore_power_profile(
            "het",
            1_000_000,
            3_000_000,
            400_000,
            1_600_000,
            "powersave",
            "",
        )
        .unwrap();
    host.shared_pool().set_power_profile(Some(profile)).unwrap();
    host.shared_pool().move_cpus(host.cpus()).unwrap();

    for id in 0..4u32 {
        assert_eq!(fake.read_cpu(id, "cpufreq/scaling_min_freq"), "1000000");
        assert_eq!(fake.read_cpu(id, "cpufreq/scaling_max_freq"), "3000000");
    }
    for id in 4..8u32 {
        assert_eq!(fake.read_cpu(id, "cpufreq/scaling_min_freq"), "400000");
        assert_eq!(fake.read_cpu(id, "cpufreq/scaling_max_freq"), "1600000");
    }
    assert_partition(&host);
}

#[test]
fn base_window_outside_an_ecore_envelope_fails_consolidation() {
    let (_fake, host) = heterogeneous_host();

    let profile = host
        .new_power_profile("base-only", 1_000_000, 3_000_000, "powersave", "")
        .unwrap();
    host.shared_pool().set_power_profile(Some(profile)).unwrap();

    // a performance core fits the window
    host.shared_pool().move_cpu_ids(&[CpuId::new(0)]).unwrap();

    // an efficient core does not, and the move rolls back
    let result = host.shared_pool().move_cpu_ids(&[CpuId::new(5)]);
    assert!(matches!(result, Err(PowerError::HardwareBounds { .. })));
    let cpu = host.cpu(CpuId::new(5)).unwrap();
    assert!(Arc::ptr_eq(&cpu.pool(), host.reserved_pool()));
    assert_partition(&host);
}

#[test]
fn cstate_selection_writes_the_disable_files() {
    let mut builder = FakeSysfs::builder().cstates_driver("intel_idle");
    for id in 0..4u32 {
        builder = builder.cpu(CpuSpec::new(id).cstates(&[("C1", 1), ("C3", 3)]));
    }
    let fake = builder.build();
    let host = Host::create_with_config("host1", &fake.config()).unwrap();

    host.shared_pool().move_cpu_ids(&[CpuId::new(2)]).unwrap();
    host.shared_pool()
        .set_cstates(Some(selection(&[("C1", false), ("C3", true)])))
        .unwrap();

    assert_eq!(fake.read_cpu(2, "cpuidle/state1/disable"), "1");
    assert_eq!(fake.read_cpu(2, "cpuidle/state3/disable"), "0");
}

#[test]
fn cpu_cstate_override_shadows_the_pool_selection() {
    let mut builder = FakeSysfs::builder().cstates_driver("intel_idle");
    for id in 0..2u32 {
        builder = builder.cpu(CpuSpec::new(id).cstates(&[("C1", 1)]));
    }
    let fake = builder.build();
    let host = Host::create_with_config("host1", &fake.config()).unwrap();

    host.shared_pool().move_cpu_ids(&[CpuId::new(0)]).unwrap();
    host.shared_pool()
        .set_cstates(Some(selection(&[("C1", false)])))
        .unwrap();
    assert_eq!(fake.read_cpu(0, "cpuidle/state1/disable"), "1");

    let cpu = host.cpu(CpuId::new(0)).unwrap();
    cpu.set_cstates(Some(selection(&[("C1", true)]))).unwrap();
    assert_eq!(fake.read_cpu(0, "cpuidle/state1/disable"), "0");

    // dropping the override falls back to the pool selection
    cpu.set_cstates(None).unwrap();
    assert_eq!(fake.read_cpu(0, "cpuidle/state1/disable"), "1");
}

#[test]
fn unset_selections_leave_every_state_enabled() {
    let fake = FakeSysfs::builder()
        .cstates_driver("intel_idle")
        .cpu(CpuSpec::new(0).cstates(&[("POLL", 0), ("C1", 1)]))
        .build();
    let host = Host::create_with_config("host1", &fake.config()).unwrap();

    // disable first through an override, then drop it with no pool
    // selection in place: the default layer re-enables everything
    let cpu = host.cpu(CpuId::new(0)).unwrap();
    cpu.set_cstates(Some(selection(&[("POLL", false), ("C1", false)])))
        .unwrap();
    assert_eq!(fake.read_cpu(0, "cpuidle/state0/disable"), "1");
    assert_eq!(fake.read_cpu(0, "cpuidle/state1/disable"), "1");

    cpu.set_cstates(None).unwrap();
    assert_eq!(fake.read_cpu(0, "cpuidle/state0/disable"), "0");
    assert_eq!(fake.read_cpu(0, "cpuidle/state1/disable"), "0");
}

#[test]
fn uncore_overrides_inherit_die_package_topology() {
    let dies = [(0u32, 0u32), (0, 1), (1, 0), (1, 1)];
    let fake = FakeSysfs::builder()
        .cpu(CpuSpec::new(0))
        .cpu(CpuSpec::new(1).die(1).core(1))
        .cpu(CpuSpec::new(2).package(1).core(2))
        .cpu(CpuSpec::new(3).package(1).die(1).core(3))
        .uncore(&dies, 1_200_000, 2_400_000)
        .module("intel_uncore_frequency")
        .build();
    let host = Host::create_with_config("host1", &fake.config()).unwrap();
    let topology = host.topology();

    let package0 = topology.package(0.into()).unwrap();
    let package_window = host.new_uncore(1_400_000, 2_200_000).unwrap();
    package0.set_uncore(Some(package_window)).unwrap();

    for die in 0..2u32 {
        let dir = format!("intel_uncore_frequency/package_00_die_{die:02}");
        assert_eq!(fake.read(&format!("{dir}/max_freq_khz")), "2200000");
        assert_eq!(fake.read(&format!("{dir}/min_freq_khz")), "1400000");
    }
    // package 1 still carries the hardware init values
    for die in 0..2u32 {
        let dir = format!("intel_uncore_frequency/package_01_die_{die:02}");
        assert_eq!(fake.read(&format!("{dir}/max_freq_khz")), "2400000");
        assert_eq!(fake.read(&format!("{dir}/min_freq_khz")), "1200000");
    }

    let die0 = package0.die(0.into()).unwrap();
    let die_window = host.new_uncore(1_500_000, 2_100_000).unwrap();
    die0.set_uncore(Some(die_window)).unwrap();

    assert_eq!(
        fake.read("intel_uncore_frequency/package_00_die_00/max_freq_khz"),
        "2100000"
    );
    assert_eq!(
        fake.read("intel_uncore_frequency/package_00_die_00/min_freq_khz"),
        "1500000"
    );
    // the sibling die keeps the package override
    assert_eq!(
        fake.read("intel_uncore_frequency/package_00_die_01/max_freq_khz"),
        "2200000"
    );
    assert_eq!(
        fake.read("intel_uncore_frequency/package_00_die_01/min_freq_khz"),
        "1400000"
    );

    // dropping the die override restores the package level value
    die0.set_uncore(None).unwrap();
    assert_eq!(
        fake.read("intel_uncore_frequency/package_00_die_00/max_freq_khz"),
        "2200000"
    );

    // dropping the package override restores the topology default
    package0.set_uncore(None).unwrap();
    assert_eq!(
        fake.read("intel_uncore_frequency/package_00_die_00/max_freq_khz"),
        "2400000"
    );

    // a topology wide value reaches every die
    let system_window = host.new_uncore(1_300_000, 2_300_000).unwrap();
    topology.set_uncore(Some(system_window)).unwrap();
    for (package, die) in dies {
        let dir = format!("intel_uncore_frequency/package_{package:02}_die_{die:02}");
        assert_eq!(fake.read(&format!("{dir}/max_freq_khz")), "2300000");
        assert_eq!(fake.read(&format!("{dir}/min_freq_khz")), "1300000");
    }
}

#[test]
fn consolidation_is_idempotent() {
    let mut builder = FakeSysfs::builder().cstates_driver("intel_idle");
    for id in 0..2u32 {
        builder = builder.cpu(CpuSpec::new(id).cstates(&[("C1", 1)]));
    }
    let fake = builder.build();
    let host = Host::create_with_config("host1", &fake.config()).unwrap();

    let profile = host
        .new_power_profile("steady", 500_000, 2_000_000, "powersave", "default")
        .unwrap();
    host.shared_pool().move_cpu_ids(&[CpuId::new(1)]).unwrap();
    host.shared_pool()
        .set_power_profile(Some(profile.clone()))
        .unwrap();

    let files = [
        "cpufreq/scaling_governor",
        "cpufreq/energy_performance_preference",
        "cpufreq/scaling_min_freq",
        "cpufreq/scaling_max_freq",
        "cpuidle/state1/disable",
    ];
    let before: Vec<String> = files.iter().map(|file| fake.read_cpu(1, file)).collect();

    host.shared_pool().set_power_profile(Some(profile)).unwrap();

    let after: Vec<String> = files.iter().map(|file| fake.read_cpu(1, file)).collect();
    assert_eq!(before, after);
}

#[test]
fn failed_consolidation_rolls_the_move_back() {
    let (fake, host) = homogeneous_host(4);
    fake.remove("cpu1/cpufreq");

    let reserved_before = host.reserved_pool().cpu_ids();
    let result = host.shared_pool().move_cpu_ids(&[CpuId::new(1)]);

    assert!(matches!(result, Err(PowerError::Sysfs(_))));
    assert_eq!(host.reserved_pool().cpu_ids(), reserved_before);
    assert!(host.shared_pool().cpu_ids().is_empty());
    let cpu = host.cpu(CpuId::new(1)).unwrap();
    assert!(Arc::ptr_eq(&cpu.pool(), host.reserved_pool()));
    assert_partition(&host);
}

#[test]
fn declarative_membership_routes_between_pool_kinds() {
    let (_fake, host) = homogeneous_host(4);
    let shared = host.shared_pool();
    let reserved = host.reserved_pool();

    let both = host.cpus_by_ids(&[CpuId::new(0), CpuId::new(1)]).unwrap();
    shared.set_cpus(&both).unwrap();
    assert_eq!(sorted_ids(shared), vec![0, 1]);
    assert_eq!(sorted_ids(reserved), vec![2, 3]);

    // shrinking the shared set pushes the dropped cpu back to reserved
    let only_one = host.cpus_by_ids(&[CpuId::new(1)]).unwrap();
    shared.set_cpus(&only_one).unwrap();
    assert_eq!(sorted_ids(shared), vec![1]);
    assert_eq!(sorted_ids(reserved), vec![0, 2, 3]);

    // an exclusive pool pulls from shared and spills back to shared
    let hot = host.add_exclusive_pool("hot").unwrap();
    hot.set_cpus(&only_one).unwrap();
    assert_eq!(sorted_ids(&hot), vec![1]);
    hot.set_cpus(&[]).unwrap();
    assert_eq!(sorted_ids(&hot), Vec::<u32>::new());
    assert_eq!(sorted_ids(shared), vec![1]);

    // reserved refuses to pull a cpu owned by an exclusive pool
    hot.set_cpus(&only_one).unwrap();
    let result = reserved.set_cpus(&host.cpus_by_ids(&[CpuId::new(1)]).unwrap());
    assert!(matches!(result, Err(PowerError::InvalidTransition { .. })));

    assert_partition(&host);
}

#[test]
fn clearing_the_reserved_pool_moves_everything_to_shared() {
    let (_fake, host) = homogeneous_host(4);

    host.reserved_pool().clear().unwrap();
    assert_eq!(sorted_ids(host.shared_pool()), vec![0, 1, 2, 3]);
    assert!(host.reserved_pool().cpu_ids().is_empty());
    assert_partition(&host);
}

#[test]
fn removing_a_pool_spills_its_cpus_to_shared() {
    let (_fake, host) = homogeneous_host(4);
    let hot = host.add_exclusive_pool("hot").unwrap();

    host.shared_pool()
        .move_cpu_ids(&[CpuId::new(0), CpuId::new(1)])
        .unwrap();
    hot.move_cpu_ids(&[CpuId::new(0), CpuId::new(1)]).unwrap();

    hot.remove().unwrap();
    assert!(host.exclusive_pool("hot").is_none());
    assert_eq!(sorted_ids(host.shared_pool()), vec![0, 1]);
    assert_partition(&host);
}

#[test]
fn reserved_pool_refuses_a_power_profile() {
    let (_fake, host) = homogeneous_host(2);

    let profile = host
        .new_power_profile("p", 100_000, 2_400_000, "powersave", "")
        .unwrap();
    assert!(matches!(
        host.reserved_pool().set_power_profile(Some(profile)),
        Err(PowerError::ReservedPoolProfile)
    ));
}

#[test]
fn moving_an_unknown_cpu_id_fails() {
    let (_fake, host) = homogeneous_host(2);

    let result = host.shared_pool().move_cpu_ids(&[CpuId::new(7)]);
    assert!(matches!(result, Err(PowerError::UnknownCpu(_))));
}

#[test]
fn concurrent_move_and_profile_application_converge() {
    let _ = env_logger::builder().is_test(true).try_init();
    for _ in 0..5 {
        concurrent_move_and_profile_round();
    }
}

fn concurrent_move_and_profile_round() {
    let mut builder = FakeSysfs::builder();
    for id in 0..8u32 {
        builder = builder.cpu(CpuSpec::new(id).freqs(200_000, 3_600_000));
    }
    for id in 8..16u32 {
        builder = builder.cpu(CpuSpec::new(id).freqs(200_000, 1_800_000));
    }
    let fake = builder.build();
    let host = Host::create_with_config("host1", &fake.config()).unwrap();

    let profile = host
        .new_ecore_power_profile(
            "load",
            1_000_000,
            3_600_000,
            400_000,
            1_600_000,
            "performance",
            "performance",
        )
        .unwrap();

    let mover_host = host.clone();
    let mover = thread::spawn(move || {
        let shared = mover_host.shared_pool().clone();
        shared.move_cpus(mover_host.cpus())
    });

    let setter_host = host.clone();
    let setter_profile = profile.clone();
    let setter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(2));
        setter_host
            .shared_pool()
            .set_power_profile(Some(setter_profile))
    });

    mover.join().unwrap().unwrap();
    setter.join().unwrap().unwrap();

    assert_eq!(sorted_ids(host.shared_pool()), (0..16).collect::<Vec<_>>());
    let attached = host.shared_pool().power_profile().unwrap();
    assert!(Arc::ptr_eq(&attached, &profile));

    for id in 0..16u32 {
        assert_eq!(fake.read_cpu(id, "cpufreq/scaling_governor"), "performance");
        assert_eq!(
            fake.read_cpu(id, "cpufreq/energy_performance_preference"),
            "performance"
        );
    }
    for id in 0..8u32 {
        assert_eq!(fake.read_cpu(id, "cpufreq/scaling_max_freq"), "3600000");
        assert_eq!(fake.read_cpu(id, "cpufreq/scaling_min_freq"), "1000000");
    }
    for id in 8..16u32 {
        assert_eq!(fake.read_cpu(id, "cpufreq/scaling_max_freq"), "1600000");
        assert_eq!(fake.read_cpu(id, "cpufreq/scaling_min_freq"), "400000");
    }
    assert_partition(&host);
}
