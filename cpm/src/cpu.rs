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

use crate::cstates::CStates;
use crate::errors::PowerError;
use crate::errors::PowerResult;
use crate::features::Feature;
use crate::host::Host;
use crate::pool::Pool;
use crate::profile::PowerProfile;
use crate::topology::Core;

/// A logical cpu as seen by the OS: a physical core, or one of its
/// hardware threads when SMT is enabled.
///
/// The cpu's mutex guards its pool back pointer, its C-state override and
/// the sysfs writes of consolidation. Lock order everywhere is cpu first,
/// then pools.
pub struct Cpu {
    id: CpuId,
    core_type: usize,
    host: Weak<Host>,
    core: Weak<Core>,
    state: Mutex<CpuState>,
}

pub(crate) struct CpuState {
    pub(crate) pool: Arc<Pool>,
    pub(crate) cstates: Option<CStates>,
}

impl Cpu {
    pub(crate) fn new(
        id: CpuId,
        core_type: usize,
        host: Weak<Host>,
        core: Weak<Core>,
        pool: Arc<Pool>,
    ) -> Self {
        Self {
            id,
            core_type,
            host,
            core,
            state: Mutex::new(CpuState {
                pool,
                cstates: None,
            }),
        }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    pub fn core(&self) -> Option<Arc<Core>> {
        self.core.upgrade()
    }

    pub(crate) fn core_type(&self) -> usize {
        self.core_type
    }

    /// The pool this cpu currently belongs to.
    pub fn pool(&self) -> Arc<Pool> {
        self.state.lock().pool.clone()
    }

    /// The per cpu C-state override, if any.
    pub fn cstates(&self) -> Option<CStates> {
        self.state.lock().cstates.clone()
    }

    fn host(&self) -> PowerResult<Arc<Host>> {
        self.host.upgrade().ok_or(PowerError::HostReleased)
    }

    /// Moves this cpu to the target pool and consolidates it.
    ///
    /// Allowed movements are reserved <-> shared and shared <-> exclusive;
    /// a move to the current pool is a no-op. Moving between reserved and
    /// an exclusive pool, or between two exclusive pools, is rejected
    /// before anything is written. A failed consolidation restores the
    /// previous pool.
    pub fn set_pool(&self, target: &Arc<Pool>) -> PowerResult<()> {
        let host = self.host()?;
        let mut state = self.state.lock();
        let source = state.pool.clone();
        if Arc::ptr_eq(&source, target) {
            return Ok(());
        }
        tracing::info!(
            "moving cpu {} from pool {} to pool {}",
            self.id,
            source.name(),
            target.name()
        );

        let reserved = host.reserved_pool();
        if Arc::ptr_eq(&source, reserved) && target.is_exclusive() {
            return Err(PowerError::invalid_transition(
                self.id,
                source.name(),
                target.name(),
            ));
        }
        if source.is_exclusive() && target.is_exclusive() {
            return Err(PowerError::invalid_transition(
                self.id,
                source.name(),
                target.name(),
            ));
        }
        if source.is_exclusive() && Arc::ptr_eq(target, reserved) {
            return Err(PowerError::invalid_transition(
                self.id,
                source.name(),
                target.name(),
            ));
        }

        self.do_set_pool(&host, &mut state, &source, target)
    }

    /// The actual transfer, entered with the cpu lock held. Takes both
    /// pool locks, always in one stable order so opposing movers cannot
    /// deadlock, and keeps all three until the membership lists and the
    /// back pointer agree again.
    fn do_set_pool(
        &self,
        host: &Host,
        state: &mut CpuState,
        source: &Arc<Pool>,
        target: &Arc<Pool>,
    ) -> PowerResult<()> {
        let source_first = Arc::as_ptr(source) < Arc::as_ptr(target);
        let (first, second) = if source_first {
            (source, target)
        } else {
            (target, source)
        };
        let mut first_state = first.state.lock();
        let mut second_state = second.state.lock();
        let (source_state, target_state) = if source_first {
            (&mut *first_state, &mut *second_state)
        } else {
            (&mut *second_state, &mut *first_state)
        };

        state.pool = target.clone();
        let position = match source_state.cpus.iter().position(|id| *id == self.id) {
            Some(position) => {
                tracing::debug!("removing cpu {} from pool {}", self.id, source.name());
                source_state.cpus.remove(position);
                position
            }
            None => {
                state.pool = source.clone();
                return Err(PowerError::cpu_not_in_pool(self.id, source.name()));
            }
        };

        tracing::debug!("starting consolidation of cpu {}", self.id);
        if let Err(error) = self.consolidate_with(
            host,
            state.cstates.as_ref(),
            target_state.profile.as_deref(),
            target_state.cstates.as_ref(),
        ) {
            state.pool = source.clone();
            source_state.cpus.insert(position, self.id);
            return Err(error);
        }

        target_state.cpus.push(self.id);
        Ok(())
    }

    /// Sets or clears this cpu's C-state override and reconsolidates it.
    pub fn set_cstates(&self, cstates: Option<CStates>) -> PowerResult<()> {
        let host = self.host()?;
        if !host.features().is_supported(Feature::CStates) {
            return Err(host.feature_unsupported(Feature::CStates));
        }
        if let Some(selection) = cstates.as_ref() {
            host.validate_cstates(selection)?;
        }
        let mut state = self.state.lock();
        state.cstates = cstates;
        self.consolidate_locked(&host, &state)
    }

    /// Locked consolidation entry point: takes the cpu lock and makes
    /// sysfs match the model for this cpu.
    pub(crate) fn consolidate(&self) -> PowerResult<()> {
        let host = self.host()?;
        let state = self.state.lock();
        self.consolidate_locked(&host, &state)
    }

    /// Consolidation with the cpu lock already held. Briefly takes the
    /// pool lock to snapshot the profile and C-state selection.
    fn consolidate_locked(&self, host: &Host, state: &CpuState) -> PowerResult<()> {
        let pool = state.pool.clone();
        let (profile, pool_cstates) = {
            let pool_state = pool.state.lock();
            (pool_state.profile.clone(), pool_state.cstates.clone())
        };
        self.consolidate_with(
            host,
            state.cstates.as_ref(),
            profile.as_deref(),
            pool_cstates.as_ref(),
        )
    }

    /// The raw consolidation steps, used by the mover while it already
    /// holds the cpu lock and both pool locks.
    fn consolidate_with(
        &self,
        host: &Host,
        cpu_cstates: Option<&CStates>,
        profile: Option<&PowerProfile>,
        pool_cstates: Option<&CStates>,
    ) -> PowerResult<()> {
        self.update_frequencies(host, profile)?;
        self.update_cstates(host, cpu_cstates, pool_cstates)?;
        Ok(())
    }
}
