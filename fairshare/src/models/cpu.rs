/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Multicore CPU model (Cas01).
//!
//! Each host is one constraint of capacity `cores × speed`.  An execution
//! on `n` cores is a single variable of penalty `1/n` bounded by
//! `n × speed`: max-min gives it `n` times the share of a single-core
//! execution, without ever exceeding what `n` cores can do.

use slotmap::{SecondaryMap, SlotMap};
use tracing::{debug, info, warn};

use super::{check_amount, min_bound, user_rate};
use crate::lmm::ConstraintId;
use crate::resource::{
    ActionId, HostId, Model, ModelCore, ModelError, ModelOptions, ResourceEvent, ResourceRef,
    SuspendState,
};

/// One host's processor.
#[derive(Debug, Clone)]
pub struct Cpu {
    pub(crate) name: String,
    pub(crate) constraint: ConstraintId,
    /// Per-core speed of every pstate, in flops per second.
    pub(crate) speeds: Vec<f64>,
    pub(crate) pstate: usize,
    /// Availability ratio applied by trace events.
    pub(crate) speed_scale: f64,
    pub(crate) cores: usize,
    pub(crate) on: bool,
}

impl Cpu {
    pub(crate) fn new(name: String, constraint: ConstraintId, speeds: Vec<f64>, cores: usize) -> Self {
        Self {
            name,
            constraint,
            speeds,
            pstate: 0,
            speed_scale: 1.0,
            cores,
            on: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current per-core speed.
    pub fn speed(&self) -> f64 {
        self.speeds[self.pstate] * self.speed_scale
    }

    /// Current speed of the whole host.
    pub fn capacity(&self) -> f64 {
        self.cores as f64 * self.speed()
    }

    pub fn cores(&self) -> usize {
        self.cores
    }

    pub fn pstate(&self) -> usize {
        self.pstate
    }

    pub fn pstate_count(&self) -> usize {
        self.speeds.len()
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    pub fn constraint(&self) -> ConstraintId {
        self.constraint
    }
}

/// Validate a pstate table and a core count.
pub(crate) fn check_cpu(speeds: &[f64], cores: usize, name: &str) -> Result<(), ModelError> {
    if speeds.is_empty() {
        return Err(ModelError::InvalidAmount {
            what: "pstate count",
            value: 0.0,
        });
    }
    for &s in speeds {
        check_amount("speed", s)?;
    }
    if cores == 0 {
        return Err(ModelError::InvalidCoreCount {
            host: name.to_string(),
            requested: cores,
            available: cores,
        });
    }
    Ok(())
}

#[derive(Debug)]
pub struct CpuModel {
    core: ModelCore,
    hosts: SlotMap<HostId, Cpu>,
    /// Cores requested by each execution, to rebuild its bound.
    requested_cores: SecondaryMap<ActionId, usize>,
}

impl CpuModel {
    pub fn new(options: &ModelOptions) -> Result<Self, ModelError> {
        Ok(Self {
            core: ModelCore::new("cpu", options)?,
            hosts: SlotMap::with_key(),
            requested_cores: SecondaryMap::new(),
        })
    }

    /// Register a host with its per-core speed at every pstate.
    pub fn add_host(
        &mut self,
        name: impl Into<String>,
        speeds: Vec<f64>,
        cores: usize,
    ) -> Result<HostId, ModelError> {
        let name = name.into();
        check_cpu(&speeds, cores, &name)?;
        let capacity = cores as f64 * speeds[0];
        let constraint = self.core.system_mut().constraint_new(Some(capacity));
        info!(host = %name, cores, speed = speeds[0], pstates = speeds.len(), "cpu added");
        Ok(self.hosts.insert(Cpu::new(name, constraint, speeds, cores)))
    }

    pub fn host(&self, host: HostId) -> Option<&Cpu> {
        self.hosts.get(host)
    }

    pub fn host_by_name(&self, name: &str) -> Option<HostId> {
        self.hosts
            .iter()
            .find(|(_, cpu)| cpu.name == name)
            .map(|(id, _)| id)
    }

    fn cpu(&self, host: HostId) -> Result<&Cpu, ModelError> {
        self.hosts.get(host).ok_or(ModelError::StaleResource {
            kind: "host",
            model: "cpu",
        })
    }

    fn cpu_mut(&mut self, host: HostId) -> Result<&mut Cpu, ModelError> {
        self.hosts.get_mut(host).ok_or(ModelError::StaleResource {
            kind: "host",
            model: "cpu",
        })
    }

    /// Fraction of the host capacity in use after the last solve.
    pub fn load(&self, host: HostId) -> Result<f64, ModelError> {
        let cpu = self.cpu(host)?;
        let capacity = cpu.capacity();
        if capacity <= 0.0 {
            return Ok(0.0);
        }
        Ok(self.core.system().get_usage(cpu.constraint) / capacity)
    }

    /// Start computing `flops` on `requested_cores` cores of `host`.
    pub fn execution_start(
        &mut self,
        host: HostId,
        flops: f64,
        requested_cores: usize,
        user_bound: Option<f64>,
    ) -> Result<ActionId, ModelError> {
        check_amount("flops", flops)?;
        let cpu = self.cpu(host)?;
        if requested_cores == 0 || requested_cores > cpu.cores {
            return Err(ModelError::InvalidCoreCount {
                host: cpu.name.clone(),
                requested: requested_cores,
                available: cpu.cores,
            });
        }
        let (constraint, speed, on) = (cpu.constraint, cpu.speed(), cpu.on);
        let user_bound = user_rate(user_bound);

        let id = self.core.new_action(flops, !on);
        if !on {
            return Ok(id);
        }
        let bound = min_bound(Some(requested_cores as f64 * speed), user_bound);
        let var = self
            .core
            .new_variable(id, 1.0 / requested_cores as f64, bound, 1);
        self.core.system_mut().expand(constraint, var, 1.0);
        self.core.action_mut(id)?.user_bound = user_bound;
        self.requested_cores.insert(id, requested_cores);
        debug!(flops, cores = requested_cores, bound = ?bound, "execution started");
        Ok(id)
    }

    /// Single-core execution without user bound.
    pub fn execute(&mut self, host: HostId, flops: f64) -> Result<ActionId, ModelError> {
        self.execution_start(host, flops, 1, None)
    }

    /// Sleep on `host` for `duration` seconds; `None` sleeps forever.
    pub fn sleep(&mut self, host: HostId, duration: Option<f64>) -> Result<ActionId, ModelError> {
        if let Some(d) = duration {
            check_amount("sleep duration", d)?;
        }
        let id = self.execution_start(host, 1.0, 1, None)?;
        let action = self.core.action_mut(id)?;
        if !action.is_running() {
            return Ok(id);
        }
        action.max_duration = duration;
        action.suspended = SuspendState::Sleeping;
        let var = action.variable;
        if let Some(var) = var {
            self.core.system_mut().update_variable_penalty(var, 0.0);
        }
        if duration.is_none() {
            self.core.ignore(id);
        }
        debug!(duration = ?duration, "sleep started");
        Ok(id)
    }

    /// Switch `host` to another pstate.
    pub fn set_pstate(&mut self, host: HostId, pstate: usize) -> Result<(), ModelError> {
        let cpu = self.cpu_mut(host)?;
        if pstate >= cpu.speeds.len() {
            return Err(ModelError::InvalidPstate {
                host: cpu.name.clone(),
                pstate,
                count: cpu.speeds.len(),
            });
        }
        cpu.pstate = pstate;
        debug!(host = %cpu.name, pstate, speed = cpu.speed(), "pstate changed");
        self.on_speed_change(host)
    }

    /// Apply a speed-availability ratio (trace event).
    pub fn set_speed_scale(&mut self, host: HostId, scale: f64) -> Result<(), ModelError> {
        check_amount("speed scale", scale)?;
        self.cpu_mut(host)?.speed_scale = scale;
        self.on_speed_change(host)
    }

    /// Push the new capacity into the constraint and rebuild the bound of
    /// every execution running there.
    fn on_speed_change(&mut self, host: HostId) -> Result<(), ModelError> {
        let cpu = self.cpu(host)?;
        let (constraint, capacity, speed) = (cpu.constraint, cpu.capacity(), cpu.speed());
        self.core
            .system_mut()
            .update_constraint_bound(constraint, Some(capacity));

        for var in self.core.system().constraint_variables(constraint) {
            let Some(owner) = self.core.system().variable(var).owner() else {
                continue;
            };
            let Some(&cores) = self.requested_cores.get(owner) else {
                continue;
            };
            let user_bound = self.core.action(owner).and_then(|a| a.user_bound());
            let bound = min_bound(Some(cores as f64 * speed), user_bound);
            self.core.system_mut().update_variable_bound(var, bound);
        }
        Ok(())
    }

    pub fn turn_off(&mut self, host: HostId) -> Result<(), ModelError> {
        let cpu = self.cpu_mut(host)?;
        if !cpu.on {
            return Ok(());
        }
        cpu.on = false;
        let constraint = cpu.constraint;
        let failed = self.core.fail_actions_using(constraint);
        warn!(host = %self.hosts[host].name, failed, "cpu turned off");
        Ok(())
    }

    pub fn turn_on(&mut self, host: HostId) -> Result<(), ModelError> {
        let cpu = self.cpu_mut(host)?;
        cpu.on = true;
        info!(host = %cpu.name, "cpu turned on");
        Ok(())
    }
}

impl Model for CpuModel {
    fn core(&self) -> &ModelCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModelCore {
        &mut self.core
    }

    fn apply_event(&mut self, target: ResourceRef, event: ResourceEvent) -> Result<(), ModelError> {
        let ResourceRef::Host(host) = target else {
            return Err(ModelError::UnsupportedEvent { model: "cpu" });
        };
        match event {
            ResourceEvent::Speed(scale) => self.set_speed_scale(host, scale),
            ResourceEvent::State(true) => self.turn_on(host),
            ResourceEvent::State(false) => self.turn_off(host),
            _ => Err(ModelError::UnsupportedEvent { model: "cpu" }),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lmm::SolverAlgorithm;
    use crate::resource::{ActionState, UpdateAlgorithm};

    fn model(update: UpdateAlgorithm) -> CpuModel {
        let options = match update {
            UpdateAlgorithm::Full => ModelOptions::full(SolverAlgorithm::MaxMin),
            UpdateAlgorithm::Lazy => ModelOptions::lazy(SolverAlgorithm::MaxMin),
        };
        CpuModel::new(&options).unwrap()
    }

    fn run(m: &mut CpuModel) -> f64 {
        let mut now = 0.0;
        while let Some(delta) = m.next_occurring_event(now) {
            now += delta;
            m.update_actions_state(now, delta);
        }
        now
    }

    fn finish_time(m: &CpuModel, id: ActionId) -> f64 {
        m.action(id).and_then(|a| a.finish_time()).unwrap()
    }

    #[test]
    fn single_execution_runs_at_host_speed() {
        let mut m = model(UpdateAlgorithm::Full);
        let h = m.add_host("h", vec![10.0], 1).unwrap();
        let a = m.execute(h, 100.0).unwrap();
        run(&mut m);
        assert!((finish_time(&m, a) - 10.0).abs() < 1e-9);
        assert_eq!(m.action(a).unwrap().state(), ActionState::Finished);
    }

    #[test]
    fn single_core_execution_cannot_use_two_cores() {
        let mut m = model(UpdateAlgorithm::Lazy);
        let h = m.add_host("h", vec![10.0], 2).unwrap();
        let a = m.execute(h, 100.0).unwrap();
        assert_eq!(m.next_occurring_event(0.0), Some(10.0));
        assert!((m.load(h).unwrap() - 0.5).abs() < 1e-9);
        run(&mut m);
        assert!((finish_time(&m, a) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn multicore_execution_gets_proportional_share() {
        let mut m = model(UpdateAlgorithm::Full);
        let h = m.add_host("h", vec![10.0], 4).unwrap();
        let wide = m.execution_start(h, 300.0, 3, None).unwrap();
        let narrow = m.execution_start(h, 100.0, 1, None).unwrap();
        m.next_occurring_event(0.0);
        assert!((m.core().rate(wide) - 30.0).abs() < 1e-9);
        assert!((m.core().rate(narrow) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn oversubscribed_cores_are_shared() {
        let mut m = model(UpdateAlgorithm::Full);
        let h = m.add_host("h", vec![10.0], 2).unwrap();
        let ids: Vec<_> = (0..4).map(|_| m.execute(h, 50.0).unwrap()).collect();
        m.next_occurring_event(0.0);
        for &id in &ids {
            assert!((m.core().rate(id) - 5.0).abs() < 1e-9);
        }
    }

    #[test]
    fn user_bound_caps_the_rate() {
        let mut m = model(UpdateAlgorithm::Full);
        let h = m.add_host("h", vec![10.0], 1).unwrap();
        let a = m.execution_start(h, 100.0, 1, Some(4.0)).unwrap();
        assert_eq!(m.next_occurring_event(0.0), Some(25.0));
        assert_eq!(m.action(a).unwrap().user_bound(), Some(4.0));
    }

    #[test]
    fn too_many_cores_is_an_error() {
        let mut m = model(UpdateAlgorithm::Full);
        let h = m.add_host("h", vec![10.0], 2).unwrap();
        assert!(matches!(
            m.execution_start(h, 1.0, 3, None),
            Err(ModelError::InvalidCoreCount { requested: 3, available: 2, .. })
        ));
        assert!(m.execution_start(h, 1.0, 0, None).is_err());
        assert!(m.execute(h, -1.0).is_err());
    }

    #[test]
    fn sleep_takes_no_share() {
        for update in [UpdateAlgorithm::Full, UpdateAlgorithm::Lazy] {
            let mut m = model(update);
            let h = m.add_host("h", vec![10.0], 1).unwrap();
            let s = m.sleep(h, Some(3.0)).unwrap();
            let a = m.execute(h, 100.0).unwrap();
            run(&mut m);
            assert!((finish_time(&m, s) - 3.0).abs() < 1e-9, "{update}");
            assert!((finish_time(&m, a) - 10.0).abs() < 1e-9, "{update}");
        }
    }

    #[test]
    fn infinite_sleep_is_ignored() {
        let mut m = model(UpdateAlgorithm::Full);
        let h = m.add_host("h", vec![10.0], 1).unwrap();
        let s = m.sleep(h, None).unwrap();
        assert_eq!(m.action(s).unwrap().state(), ActionState::Ignored);
        assert_eq!(m.next_occurring_event(0.0), None);

        m.turn_off(h).unwrap();
        assert_eq!(m.action(s).unwrap().state(), ActionState::Failed);
    }

    #[test]
    fn pstate_change_rescales_running_actions() {
        let mut m = model(UpdateAlgorithm::Full);
        let h = m.add_host("h", vec![10.0, 5.0], 1).unwrap();
        let a = m.execute(h, 100.0).unwrap();

        let delta = m.next_occurring_event(0.0).unwrap();
        assert_eq!(delta, 10.0);
        m.update_actions_state(4.0, 4.0);
        m.set_pstate(h, 1).unwrap();
        // 60 flops left at 5 flops/s
        assert_eq!(m.next_occurring_event(4.0), Some(12.0));
        assert_eq!(m.core().system().get_bound(m.action(a).unwrap().variable().unwrap()), Some(5.0));

        assert!(matches!(
            m.set_pstate(h, 2),
            Err(ModelError::InvalidPstate { pstate: 2, count: 2, .. })
        ));
    }

    #[test]
    fn speed_event_slows_down_lazy_actions() {
        let mut m = model(UpdateAlgorithm::Lazy);
        let h = m.add_host("h", vec![10.0], 1).unwrap();
        let a = m.execute(h, 100.0).unwrap();
        m.next_occurring_event(0.0);
        m.update_actions_state(5.0, 5.0);
        m.apply_event(ResourceRef::Host(h), ResourceEvent::Speed(0.5))
            .unwrap();
        run_from(&mut m, 5.0);
        // 50 flops left at 5 flops/s
        assert!((finish_time(&m, a) - 15.0).abs() < 1e-9);
    }

    fn run_from(m: &mut CpuModel, mut now: f64) {
        while let Some(delta) = m.next_occurring_event(now) {
            now += delta;
            m.update_actions_state(now, delta);
        }
    }

    #[test]
    fn turning_off_fails_running_and_new_actions() {
        let mut m = model(UpdateAlgorithm::Lazy);
        let h = m.add_host("h", vec![10.0], 1).unwrap();
        let a = m.execute(h, 100.0).unwrap();
        m.next_occurring_event(0.0);

        m.apply_event(ResourceRef::Host(h), ResourceEvent::State(false))
            .unwrap();
        assert_eq!(m.action(a).unwrap().state(), ActionState::Failed);

        let b = m.execute(h, 10.0).unwrap();
        assert_eq!(m.action(b).unwrap().state(), ActionState::Failed);
        let done = m.take_completed();
        assert_eq!(done.len(), 2);

        m.apply_event(ResourceRef::Host(h), ResourceEvent::State(true))
            .unwrap();
        let c = m.execute(h, 10.0).unwrap();
        assert_eq!(m.action(c).unwrap().state(), ActionState::Started);
    }

    #[test]
    fn link_events_are_rejected() {
        let mut m = model(UpdateAlgorithm::Full);
        let h = m.add_host("h", vec![10.0], 1).unwrap();
        assert!(m
            .apply_event(ResourceRef::Host(h), ResourceEvent::Bandwidth(1.0))
            .is_err());
        assert!(m.host_by_name("h").is_some());
        assert!(m.host_by_name("nope").is_none());
    }
}
