/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Parallel-task model (L07).
//!
//! A parallel task computes `flops[i]` on every host `i` and sends
//! `bytes[i·n + j]` from host `i` to host `j`, all at the same pace: its
//! single variable is the fraction of the task done per second, and every
//! host and link it touches is expanded with the amount of work it needs
//! there.  Communications and plain executions are parallel tasks with one
//! or two hosts.
//!
//! The task first pays the largest route latency with a zero penalty.  Its
//! bound is the slowest of the CPU bounds (`speed / flops`), the TCP window
//! over the worst `latency × bytes` pair, and the rate the user asked for.
//!
//! Only the fair-bottleneck solver and the full update are supported.

use std::collections::BTreeSet;

use slotmap::{SecondaryMap, SlotMap};
use tracing::{debug, info, warn};

use super::cpu::{check_cpu, Cpu};
use super::network::{Link, LinkSharing};
use super::{check_amount, min_bound, user_rate};
use crate::lmm::{ConstraintId, SharingPolicy, SolverAlgorithm};
use crate::resource::{
    ActionId, HostId, LinkId, Model, ModelCore, ModelError, ModelOptions, ResourceEvent,
    ResourceRef, RoutingTable, SuspendState, UpdateAlgorithm,
};

/// What a running task needs to rebuild its bound.
#[derive(Debug, Clone)]
struct Task {
    hosts: Vec<HostId>,
    flops: Vec<f64>,
    bytes: Vec<f64>,
    rate: Option<f64>,
}

/// Bound of `task` given the current speeds and latencies.
fn task_bound(
    task: &Task,
    cpus: &SecondaryMap<HostId, Cpu>,
    links: &SlotMap<LinkId, Link>,
    routing: &RoutingTable,
    tcp_gamma: f64,
) -> Option<f64> {
    let cpu_bound = task
        .hosts
        .iter()
        .zip(&task.flops)
        .filter(|(_, f)| **f > 0.0)
        .filter_map(|(h, f)| cpus.get(*h).map(|cpu| cpu.speed() / f))
        .reduce(f64::min);

    let n = task.hosts.len();
    let mut lat_current: f64 = 0.0;
    for (k, &b) in task.bytes.iter().enumerate() {
        if b <= 0.0 {
            continue;
        }
        let Ok(route) = routing.route(task.hosts[k / n], task.hosts[k % n]) else {
            continue;
        };
        let lat: f64 = route.iter().filter_map(|l| links.get(*l)).map(Link::latency).sum();
        lat_current = lat_current.max(lat * b);
    }
    let lat_bound = (lat_current > 0.0 && tcp_gamma > 0.0).then(|| tcp_gamma / (2.0 * lat_current));

    min_bound(min_bound(lat_bound, cpu_bound), task.rate)
}

#[derive(Debug)]
pub struct PtaskModel {
    core: ModelCore,
    tcp_gamma: f64,
    routing: RoutingTable,
    cpus: SecondaryMap<HostId, Cpu>,
    links: SlotMap<LinkId, Link>,
    tasks: SecondaryMap<ActionId, Task>,
}

impl PtaskModel {
    /// # Errors
    /// [`ModelError::UnsupportedSolver`] for the max-min solver, which
    /// cannot share a resource between weights that are amounts of work.
    pub fn new(options: &ModelOptions, tcp_gamma: f64) -> Result<Self, ModelError> {
        if options.solver == SolverAlgorithm::MaxMin {
            return Err(ModelError::UnsupportedSolver {
                model: "host",
                solver: options.solver.to_string(),
            });
        }
        if options.update == UpdateAlgorithm::Lazy {
            warn!("parallel tasks only support the full update, ignoring lazy");
        }
        let options = ModelOptions {
            update: UpdateAlgorithm::Full,
            ..options.clone()
        };
        Ok(Self {
            core: ModelCore::new("host", &options)?,
            tcp_gamma,
            routing: RoutingTable::new(),
            cpus: SecondaryMap::new(),
            links: SlotMap::with_key(),
            tasks: SecondaryMap::new(),
        })
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn add_host(
        &mut self,
        name: impl Into<String>,
        speeds: Vec<f64>,
        cores: usize,
    ) -> Result<HostId, ModelError> {
        let name = name.into();
        check_cpu(&speeds, cores, &name)?;
        let constraint = self
            .core
            .system_mut()
            .constraint_new(Some(cores as f64 * speeds[0]));
        info!(host = %name, cores, speed = speeds[0], "ptask host added");
        let id = self.routing.add_host(name.clone());
        self.cpus.insert(id, Cpu::new(name, constraint, speeds, cores));
        Ok(id)
    }

    pub fn add_link(
        &mut self,
        name: impl Into<String>,
        bandwidth: f64,
        latency: f64,
        policy: SharingPolicy,
    ) -> Result<LinkId, ModelError> {
        let name = name.into();
        check_amount("bandwidth", bandwidth)?;
        check_amount("latency", latency)?;
        let system = self.core.system_mut();
        let constraint = system.constraint_new(Some(bandwidth));
        system.set_sharing_policy(constraint, policy);
        let sharing = match policy {
            SharingPolicy::Shared => LinkSharing::Shared,
            SharingPolicy::FatPipe => LinkSharing::FatPipe,
        };
        info!(link = %name, bandwidth, latency, "ptask link added");
        Ok(self
            .links
            .insert(Link::new(name, constraint, bandwidth, latency, sharing)))
    }

    pub fn add_route(
        &mut self,
        src: HostId,
        dst: HostId,
        links: Vec<LinkId>,
        symmetric: bool,
    ) -> Result<(), ModelError> {
        for l in &links {
            self.link(*l)?;
        }
        self.routing.add_route(src, dst, links, symmetric);
        Ok(())
    }

    pub fn host(&self, host: HostId) -> Option<&Cpu> {
        self.cpus.get(host)
    }

    pub fn link(&self, link: LinkId) -> Result<&Link, ModelError> {
        self.links.get(link).ok_or(ModelError::StaleResource {
            kind: "link",
            model: "host",
        })
    }

    fn cpu(&self, host: HostId) -> Result<&Cpu, ModelError> {
        self.cpus.get(host).ok_or(ModelError::StaleResource {
            kind: "host",
            model: "host",
        })
    }

    /// Start a parallel task.  `bytes` is either empty or a row-major
    /// `hosts × hosts` matrix.
    pub fn execute_parallel(
        &mut self,
        hosts: &[HostId],
        flops: &[f64],
        bytes: &[f64],
        rate: Option<f64>,
    ) -> Result<ActionId, ModelError> {
        let n = hosts.len();
        if flops.len() != n {
            return Err(ModelError::InvalidMatrix {
                got: flops.len(),
                expected: n,
            });
        }
        if !bytes.is_empty() && bytes.len() != n * n {
            return Err(ModelError::InvalidMatrix {
                got: bytes.len(),
                expected: n * n,
            });
        }
        for &f in flops {
            check_amount("flops", f)?;
        }
        for &b in bytes {
            check_amount("bytes", b)?;
        }

        let mut used_hosts = Vec::new();
        let mut failed = false;
        for (&h, &f) in hosts.iter().zip(flops) {
            let cpu = self.cpu(h)?;
            if f > 0.0 {
                used_hosts.push((cpu.constraint, f));
                failed |= !cpu.on;
            }
        }

        // (constraint, bytes) per crossed link, and the worst route latency
        let mut latency: f64 = 0.0;
        let mut used_links: Vec<(LinkId, f64)> = Vec::new();
        for (k, &b) in bytes.iter().enumerate() {
            if b <= 0.0 {
                continue;
            }
            let route = self.routing.route(hosts[k / n], hosts[k % n])?;
            let mut lat = 0.0;
            for l in route {
                let link = &self.links[l];
                lat += link.latency;
                failed |= !link.on;
                used_links.push((l, b));
            }
            latency = latency.max(lat);
        }
        let distinct_links = used_links.iter().map(|(l, _)| *l).collect::<BTreeSet<_>>().len();

        let id = self.core.new_action(1.0, failed);
        if failed {
            return Ok(id);
        }
        let rate = user_rate(rate);
        let var = self
            .core
            .new_variable(id, 1.0, rate, used_hosts.len() + distinct_links);
        self.core.action_mut(id)?.user_bound = rate;
        if latency > 0.0 {
            self.core.action_mut(id)?.latency = latency;
            self.core.system_mut().update_variable_penalty(var, 0.0);
        }

        let system = self.core.system_mut();
        for &(constraint, f) in &used_hosts {
            system.expand(constraint, var, f);
        }
        for &(l, b) in &used_links {
            system.expand_add(self.links[l].constraint, var, b);
        }
        if used_hosts.is_empty() && used_links.is_empty() {
            self.core.action_mut(id)?.remains = 0.0;
        }

        self.tasks.insert(
            id,
            Task {
                hosts: hosts.to_vec(),
                flops: flops.to_vec(),
                bytes: bytes.to_vec(),
                rate,
            },
        );
        if latency <= 0.0 {
            self.update_bound(id);
        }
        debug!(
            hosts = n,
            links = distinct_links,
            latency,
            "parallel task started"
        );
        Ok(id)
    }

    /// Compute `flops` on `host`.
    pub fn execution_start(
        &mut self,
        host: HostId,
        flops: f64,
        rate: Option<f64>,
    ) -> Result<ActionId, ModelError> {
        self.execute_parallel(&[host], &[flops], &[], rate)
    }

    /// Send `size` bytes from `src` to `dst`.
    pub fn communicate(
        &mut self,
        src: HostId,
        dst: HostId,
        size: f64,
        rate: Option<f64>,
    ) -> Result<ActionId, ModelError> {
        self.execute_parallel(&[src, dst], &[0.0, 0.0], &[0.0, size, 0.0, 0.0], rate)
    }

    /// Sleep on `host` for `duration` seconds; `None` sleeps forever.
    pub fn sleep(&mut self, host: HostId, duration: Option<f64>) -> Result<ActionId, ModelError> {
        if let Some(d) = duration {
            check_amount("sleep duration", d)?;
        }
        let id = self.execution_start(host, 1.0, None)?;
        let action = self.core.action_mut(id)?;
        if !action.is_running() {
            return Ok(id);
        }
        action.max_duration = duration;
        action.suspended = SuspendState::Sleeping;
        if let Some(var) = action.variable {
            self.core.system_mut().update_variable_penalty(var, 0.0);
        }
        if duration.is_none() {
            self.core.ignore(id);
        }
        Ok(id)
    }

    fn update_bound(&mut self, id: ActionId) {
        let Some(task) = self.tasks.get(id) else {
            return;
        };
        let bound = task_bound(task, &self.cpus, &self.links, &self.routing, self.tcp_gamma);
        if let Some(var) = self.core.action(id).and_then(|a| a.variable()) {
            self.core.system_mut().update_variable_bound(var, bound);
        }
    }

    /// Re-bound every task using `constraint` that already paid its latency.
    fn rebound_users(&mut self, constraint: ConstraintId) {
        let system = self.core.system();
        let owners: Vec<ActionId> = system
            .constraint_variables(constraint)
            .into_iter()
            .filter_map(|var| system.variable(var).owner())
            .collect();
        for id in owners {
            if self.core.action(id).is_some_and(|a| a.latency() <= 0.0) {
                self.update_bound(id);
            }
        }
    }

    pub fn set_speed_scale(&mut self, host: HostId, scale: f64) -> Result<(), ModelError> {
        check_amount("speed scale", scale)?;
        let cpu = self.cpus.get_mut(host).ok_or(ModelError::StaleResource {
            kind: "host",
            model: "host",
        })?;
        cpu.speed_scale = scale;
        let (constraint, capacity) = (cpu.constraint, cpu.capacity());
        debug!(host = %cpu.name, scale, "ptask host speed changed");
        self.core
            .system_mut()
            .update_constraint_bound(constraint, Some(capacity));
        self.rebound_users(constraint);
        Ok(())
    }

    pub fn set_bandwidth(&mut self, link: LinkId, bandwidth: f64) -> Result<(), ModelError> {
        check_amount("bandwidth", bandwidth)?;
        let l = self.link_mut(link)?;
        l.bandwidth = bandwidth;
        let (constraint, bw) = (l.constraint, l.bandwidth());
        self.core
            .system_mut()
            .update_constraint_bound(constraint, Some(bw));
        Ok(())
    }

    pub fn set_latency(&mut self, link: LinkId, latency: f64) -> Result<(), ModelError> {
        check_amount("latency", latency)?;
        let l = self.link_mut(link)?;
        l.latency = latency;
        let constraint = l.constraint;
        self.rebound_users(constraint);
        Ok(())
    }

    fn link_mut(&mut self, link: LinkId) -> Result<&mut Link, ModelError> {
        self.links.get_mut(link).ok_or(ModelError::StaleResource {
            kind: "link",
            model: "host",
        })
    }

    fn set_state(&mut self, target: ResourceRef, on: bool) -> Result<(), ModelError> {
        let constraint = match target {
            ResourceRef::Host(h) => {
                let cpu = self.cpus.get_mut(h).ok_or(ModelError::StaleResource {
                    kind: "host",
                    model: "host",
                })?;
                cpu.on = on;
                cpu.constraint
            }
            ResourceRef::Link(l) => {
                let link = self.link_mut(l)?;
                link.on = on;
                link.constraint
            }
            ResourceRef::Disk(_) => return Err(ModelError::UnsupportedEvent { model: "host" }),
        };
        if !on {
            let failed = self.core.fail_actions_using(constraint);
            warn!(?target, failed, "ptask resource turned off");
        }
        Ok(())
    }
}

impl Model for PtaskModel {
    fn core(&self) -> &ModelCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModelCore {
        &mut self.core
    }

    /// A task that paid its latency gets its bound, then its penalty back.
    fn update_actions_state(&mut self, now: f64, delta: f64) {
        let Self {
            core,
            tcp_gamma,
            routing,
            cpus,
            links,
            tasks,
        } = self;
        core.update_actions_state(now, delta, |core, id| {
            if let Some(task) = tasks.get(id) {
                let bound = task_bound(task, cpus, links, routing, *tcp_gamma);
                if let Some(var) = core.action(id).and_then(|a| a.variable()) {
                    core.system_mut().update_variable_bound(var, bound);
                }
            }
            core.restore_penalty(id);
        });
    }

    fn apply_event(&mut self, target: ResourceRef, event: ResourceEvent) -> Result<(), ModelError> {
        match (target, event) {
            (ResourceRef::Host(h), ResourceEvent::Speed(scale)) => self.set_speed_scale(h, scale),
            (ResourceRef::Link(l), ResourceEvent::Bandwidth(bw)) => self.set_bandwidth(l, bw),
            (ResourceRef::Link(l), ResourceEvent::Latency(lat)) => self.set_latency(l, lat),
            (target, ResourceEvent::State(on)) => self.set_state(target, on),
            _ => Err(ModelError::UnsupportedEvent { model: "host" }),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ActionState;

    fn model() -> PtaskModel {
        PtaskModel::new(&ModelOptions::full(SolverAlgorithm::FairBottleneck), 4_194_304.0).unwrap()
    }

    fn run(m: &mut PtaskModel) -> f64 {
        let mut now = 0.0;
        while let Some(delta) = m.next_occurring_event(now) {
            now += delta;
            m.update_actions_state(now, delta);
        }
        now
    }

    fn finish_time(m: &PtaskModel, id: ActionId) -> f64 {
        m.action(id).and_then(|a| a.finish_time()).unwrap()
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= 1e-6 * expected.abs().max(1.0),
            "expected {expected}, got {actual}"
        );
    }

    /// Two single-core hosts at 100 flop/s joined by a 100 B/s link.
    fn two_hosts(m: &mut PtaskModel, latency: f64) -> (HostId, HostId, LinkId) {
        let a = m.add_host("a", vec![100.0], 1).unwrap();
        let b = m.add_host("b", vec![100.0], 1).unwrap();
        let l = m.add_link("l", 100.0, latency, SharingPolicy::Shared).unwrap();
        m.add_route(a, b, vec![l], true).unwrap();
        (a, b, l)
    }

    #[test]
    fn maxmin_is_rejected() {
        let err = PtaskModel::new(&ModelOptions::full(SolverAlgorithm::MaxMin), 1.0).unwrap_err();
        assert!(matches!(err, ModelError::UnsupportedSolver { model: "host", .. }));
    }

    #[test]
    fn busiest_host_sets_the_pace() {
        let mut m = model();
        let (a, b, _) = two_hosts(&mut m, 0.0);
        let t = m.execute_parallel(&[a, b], &[100.0, 200.0], &[], None).unwrap();
        m.next_occurring_event(0.0);
        assert_close(m.core().rate(t), 0.5);
        run(&mut m);
        assert_close(finish_time(&m, t), 2.0);
    }

    #[test]
    fn bmf_shares_a_host_with_a_parallel_task() {
        let mut m = PtaskModel::new(&ModelOptions::full(SolverAlgorithm::Bmf), 4_194_304.0).unwrap();
        let (a, b, _) = two_hosts(&mut m, 0.0);
        let wide = m.execute_parallel(&[a, b], &[100.0, 200.0], &[], None).unwrap();
        let local = m.execution_start(a, 100.0, None).unwrap();
        m.next_occurring_event(0.0);
        assert_close(m.core().rate(wide), 0.5);
        assert_close(m.core().rate(local), 0.5);
        run(&mut m);
        assert_close(finish_time(&m, wide), 2.0);
        assert_close(finish_time(&m, local), 2.0);
    }

    #[test]
    fn communication_runs_over_the_route() {
        let mut m = model();
        let (a, b, _) = two_hosts(&mut m, 0.0);
        let c = m.communicate(a, b, 200.0, None).unwrap();
        run(&mut m);
        assert_close(finish_time(&m, c), 2.0);
    }

    #[test]
    fn latency_is_paid_first() {
        let mut m = model();
        let (a, b, _) = two_hosts(&mut m, 1.0);
        let c = m.communicate(a, b, 100.0, None).unwrap();
        assert_eq!(m.action(c).unwrap().latency(), 1.0);
        run(&mut m);
        assert_close(finish_time(&m, c), 2.0);
    }

    #[test]
    fn tasks_sharing_a_host_split_it() {
        let mut m = model();
        let (a, _, _) = two_hosts(&mut m, 0.0);
        let t1 = m.execution_start(a, 100.0, None).unwrap();
        let t2 = m.execution_start(a, 100.0, None).unwrap();
        run(&mut m);
        assert_close(finish_time(&m, t1), 2.0);
        assert_close(finish_time(&m, t2), 2.0);
    }

    #[test]
    fn user_rate_caps_the_task() {
        let mut m = model();
        let (a, _, _) = two_hosts(&mut m, 0.0);
        let t = m.execution_start(a, 100.0, Some(0.25)).unwrap();
        run(&mut m);
        assert_close(finish_time(&m, t), 4.0);
    }

    #[test]
    fn empty_task_completes_at_once() {
        let mut m = model();
        let (a, b, _) = two_hosts(&mut m, 0.0);
        let t = m.execute_parallel(&[a, b], &[0.0, 0.0], &[], None).unwrap();
        assert_eq!(m.next_occurring_event(0.0), Some(0.0));
        m.update_actions_state(0.0, 0.0);
        assert_eq!(m.action(t).unwrap().state(), ActionState::Finished);
    }

    #[test]
    fn matrix_sizes_are_checked() {
        let mut m = model();
        let (a, b, _) = two_hosts(&mut m, 0.0);
        assert_eq!(
            m.execute_parallel(&[a, b], &[1.0], &[], None).unwrap_err(),
            ModelError::InvalidMatrix { got: 1, expected: 2 }
        );
        assert_eq!(
            m.execute_parallel(&[a, b], &[1.0, 1.0], &[1.0; 3], None)
                .unwrap_err(),
            ModelError::InvalidMatrix { got: 3, expected: 4 }
        );
    }

    #[test]
    fn speed_event_rebounds_running_tasks() {
        let mut m = model();
        let (a, _, _) = two_hosts(&mut m, 0.0);
        let t = m.execution_start(a, 100.0, None).unwrap();
        m.next_occurring_event(0.0);
        m.update_actions_state(0.5, 0.5);
        m.apply_event(ResourceRef::Host(a), ResourceEvent::Speed(0.5))
            .unwrap();
        let var = m.action(t).unwrap().variable().unwrap();
        assert_close(m.core().system().get_bound(var).unwrap(), 0.5);
        let mut now = 0.5;
        while let Some(delta) = m.next_occurring_event(now) {
            now += delta;
            m.update_actions_state(now, delta);
        }
        // half done at full speed, the rest at half speed
        assert_close(finish_time(&m, t), 1.5);
    }

    #[test]
    fn link_failure_fails_the_task() {
        let mut m = model();
        let (a, b, l) = two_hosts(&mut m, 0.0);
        let c = m.communicate(a, b, 100.0, None).unwrap();
        m.apply_event(ResourceRef::Link(l), ResourceEvent::State(false))
            .unwrap();
        assert_eq!(m.action(c).unwrap().state(), ActionState::Failed);
        let again = m.communicate(a, b, 100.0, None).unwrap();
        assert_eq!(m.action(again).unwrap().state(), ActionState::Failed);
    }

    #[test]
    fn sleep_lasts_its_duration() {
        let mut m = model();
        let (a, _, _) = two_hosts(&mut m, 0.0);
        let s = m.sleep(a, Some(3.0)).unwrap();
        run(&mut m);
        assert_close(finish_time(&m, s), 3.0);
    }
}
