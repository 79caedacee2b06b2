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
use std::sync::Weak;

use parking_lot::Mutex;

use cpm_shared::CpuId;

use crate::cpu::Cpu;
use crate::cstates::CStates;
use crate::errors::PowerError;
use crate::errors::PowerResult;
use crate::features::Feature;
use crate::host::Host;
use crate::profile::PowerProfile;

/// What a pool is for; the kind decides which operations it accepts and
/// which movements the state machine allows.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PoolKind {
    /// The bootstrap pool every cpu starts in. Carries no power profile.
    Reserved,
    /// The single routing pool cpus pass through between reserved and
    /// exclusive pools.
    Shared,
    /// A named, user created pool with an attached profile.
    Exclusive,
}

/// A named set of cpus sharing a power profile and a C-state selection.
///
/// The pool's mutex guards its membership list, profile and selection.
pub struct Pool {
    name: String,
    kind: PoolKind,
    host: Weak<Host>,
    pub(crate) state: Mutex<PoolState>,
}

#[derive(Default)]
pub(crate) struct PoolState {
    pub(crate) cpus: Vec<CpuId>,
    pub(crate) profile: Option<Arc<PowerProfile>>,
    pub(crate) cstates: Option<CStates>,
}

impl Pool {
    pub(crate) fn new(name: impl Into<String>, kind: PoolKind, host: Weak<Host>) -> Self {
        Self {
            name: name.into(),
            kind,
            host,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub(crate) fn is_exclusive(&self) -> bool {
        self.kind == PoolKind::Exclusive
    }

    fn host(&self) -> PowerResult<Arc<Host>> {
        self.host.upgrade().ok_or(PowerError::HostReleased)
    }

    /// Fills the membership list during host construction, before any
    /// consolidation can run.
    pub(crate) fn seed_cpus(&self, cpus: impl Iterator<Item = CpuId>) {
        let mut state = self.state.lock();
        state.cpus = cpus.collect();
    }

    /// Identifiers of the current members.
    pub fn cpu_ids(&self) -> Vec<CpuId> {
        self.state.lock().cpus.clone()
    }

    /// Snapshot of the current members.
    pub fn cpus(&self) -> Vec<Arc<Cpu>> {
        let Some(host) = self.host.upgrade() else {
            return Vec::new();
        };
        self.cpu_ids()
            .iter()
            .filter_map(|id| host.cpu(*id).cloned())
            .collect()
    }

    pub fn contains(&self, cpu: CpuId) -> bool {
        self.state.lock().cpus.contains(&cpu)
    }

    pub fn power_profile(&self) -> Option<Arc<PowerProfile>> {
        self.state.lock().profile.clone()
    }

    /// Attaches or clears the pool's power profile, then consolidates
    /// every member. Stops at the first failing member; already
    /// consolidated cpus are not undone.
    pub fn set_power_profile(&self, profile: Option<Arc<PowerProfile>>) -> PowerResult<()> {
        if self.kind == PoolKind::Reserved {
            return Err(PowerError::ReservedPoolProfile);
        }
        let host = self.host()?;
        tracing::debug!("setting power profile on pool {}", self.name);
        let members = {
            let mut state = self.state.lock();
            state.profile = profile;
            state.cpus.clone()
        };
        self.consolidate_members(&host, &members)
    }

    pub fn cstates(&self) -> Option<CStates> {
        self.state.lock().cstates.clone()
    }

    /// Stores a C-state selection for the pool after validating every
    /// state name, then consolidates every member.
    pub fn set_cstates(&self, cstates: Option<CStates>) -> PowerResult<()> {
        let host = self.host()?;
        if !host.features().is_supported(Feature::CStates) {
            return Err(host.feature_unsupported(Feature::CStates));
        }
        if let Some(selection) = cstates.as_ref() {
            host.validate_cstates(selection)?;
        }
        let members = {
            let mut state = self.state.lock();
            state.cstates = cstates;
            state.cpus.clone()
        };
        self.consolidate_members(&host, &members)
    }

    fn consolidate_members(&self, host: &Arc<Host>, members: &[CpuId]) -> PowerResult<()> {
        for id in members {
            let cpu = host.cpu(*id).ok_or(PowerError::UnknownCpu(*id))?;
            cpu.consolidate()?;
        }
        Ok(())
    }

    /// Moves the given cpus into this pool, one at a time, through each
    /// cpu's own state machine.
    pub fn move_cpus(self: &Arc<Self>, cpus: &[Arc<Cpu>]) -> PowerResult<()> {
        for cpu in cpus {
            cpu.set_pool(self)?;
        }
        Ok(())
    }

    pub fn move_cpu_ids(self: &Arc<Self>, ids: &[CpuId]) -> PowerResult<()> {
        let host = self.host()?;
        let cpus = host.cpus_by_ids(ids)?;
        self.move_cpus(&cpus)
    }

    /// Declarative membership: after a successful call exactly the
    /// requested cpus are members of this pool. Where the undesired
    /// members go depends on the pool kind.
    pub fn set_cpus(self: &Arc<Self>, requested: &[Arc<Cpu>]) -> PowerResult<()> {
        let host = self.host()?;
        match self.kind {
            PoolKind::Shared => self.set_cpus_shared(&host, requested),
            PoolKind::Reserved => self.set_cpus_reserved(&host, requested),
            PoolKind::Exclusive => self.set_cpus_exclusive(&host, requested),
        }
    }

    pub fn set_cpu_ids(self: &Arc<Self>, ids: &[CpuId]) -> PowerResult<()> {
        let host = self.host()?;
        let cpus = host.cpus_by_ids(ids)?;
        self.set_cpus(&cpus)
    }

    /// Requested cpus join the shared pool; members that are no longer
    /// requested drop back to reserved. Exclusive members stay untouched.
    fn set_cpus_shared(self: &Arc<Self>, host: &Arc<Host>, requested: &[Arc<Cpu>]) -> PowerResult<()> {
        for cpu in host.cpus() {
            if requested_contains(requested, cpu) {
                cpu.set_pool(self)?;
            } else if Arc::ptr_eq(&cpu.pool(), self) {
                cpu.set_pool(host.reserved_pool())?;
            }
        }
        Ok(())
    }

    /// Requested cpus join the reserved pool; requesting a cpu owned by an
    /// exclusive pool is an error. Members that are no longer requested
    /// move to shared.
    fn set_cpus_reserved(
        self: &Arc<Self>,
        host: &Arc<Host>,
        requested: &[Arc<Cpu>],
    ) -> PowerResult<()> {
        for cpu in host.cpus() {
            if requested_contains(requested, cpu) {
                let current = cpu.pool();
                if current.is_exclusive() {
                    return Err(PowerError::invalid_transition(
                        cpu.id(),
                        current.name(),
                        &self.name,
                    ));
                }
                cpu.set_pool(self)?;
            } else if Arc::ptr_eq(&cpu.pool(), self) {
                cpu.set_pool(host.shared_pool())?;
            }
        }
        Ok(())
    }

    /// Requested cpus join this exclusive pool; members that are no longer
    /// requested drop back to shared.
    fn set_cpus_exclusive(
        self: &Arc<Self>,
        host: &Arc<Host>,
        requested: &[Arc<Cpu>],
    ) -> PowerResult<()> {
        for cpu in host.cpus() {
            if requested_contains(requested, cpu) {
                cpu.set_pool(self)?;
            } else if Arc::ptr_eq(&cpu.pool(), self) {
                cpu.set_pool(host.shared_pool())?;
            }
        }
        Ok(())
    }

    /// Declarative empty membership.
    pub fn clear(self: &Arc<Self>) -> PowerResult<()> {
        self.set_cpus(&[])
    }

    /// Removes an exclusive pool: moves every member to shared, then
    /// detaches the pool from the host. Permanent pools refuse.
    pub fn remove(self: &Arc<Self>) -> PowerResult<()> {
        if self.kind != PoolKind::Exclusive {
            return Err(PowerError::PermanentPool(self.name.clone()));
        }
        self.clear()?;
        let host = self.host()?;
        host.remove_exclusive_pool(self)
    }
}

fn requested_contains(requested: &[Arc<Cpu>], cpu: &Arc<Cpu>) -> bool {
    requested.iter().any(|candidate| Arc::ptr_eq(candidate, cpu))
}
