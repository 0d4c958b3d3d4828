/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Disk model (S19).
//!
//! A disk is three constraints: the shared one, bounded by the larger of its
//! read and write bandwidths, and one per direction.  An I/O takes one
//! element on the shared constraint and one on its direction, so reads and
//! writes are capped independently while still sharing the device.
//! Progress is counted in whole bytes.

use std::fmt;

use slotmap::SlotMap;
use tracing::{debug, info, warn};

use super::check_amount;
use crate::lmm::ConstraintId;
use crate::resource::{
    ActionId, DiskId, Model, ModelCore, ModelError, ModelOptions, ResourceEvent, ResourceRef,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Disk {
    pub(crate) name: String,
    pub(crate) constraint: ConstraintId,
    pub(crate) read_constraint: ConstraintId,
    pub(crate) write_constraint: ConstraintId,
    pub(crate) read_bandwidth: f64,
    pub(crate) write_bandwidth: f64,
    pub(crate) on: bool,
}

impl Disk {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read_bandwidth(&self) -> f64 {
        self.read_bandwidth
    }

    pub fn write_bandwidth(&self) -> f64 {
        self.write_bandwidth
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    pub fn constraint(&self) -> ConstraintId {
        self.constraint
    }

    /// Constraint capping the given direction.
    pub fn direction(&self, op: IoOp) -> ConstraintId {
        match op {
            IoOp::Read => self.read_constraint,
            IoOp::Write => self.write_constraint,
        }
    }

    fn shared_bound(&self) -> f64 {
        self.read_bandwidth.max(self.write_bandwidth)
    }
}

#[derive(Debug)]
pub struct DiskModel {
    core: ModelCore,
    disks: SlotMap<DiskId, Disk>,
}

impl DiskModel {
    pub fn new(options: &ModelOptions) -> Result<Self, ModelError> {
        let mut core = ModelCore::new("disk", options)?;
        core.set_integral_remains(true);
        Ok(Self {
            core,
            disks: SlotMap::with_key(),
        })
    }

    pub fn add_disk(
        &mut self,
        name: impl Into<String>,
        read_bandwidth: f64,
        write_bandwidth: f64,
    ) -> Result<DiskId, ModelError> {
        let name = name.into();
        check_amount("read bandwidth", read_bandwidth)?;
        check_amount("write bandwidth", write_bandwidth)?;
        let system = self.core.system_mut();
        let constraint = system.constraint_new(Some(read_bandwidth.max(write_bandwidth)));
        let read_constraint = system.constraint_new(Some(read_bandwidth));
        let write_constraint = system.constraint_new(Some(write_bandwidth));
        info!(disk = %name, read_bandwidth, write_bandwidth, "disk added");
        Ok(self.disks.insert(Disk {
            name,
            constraint,
            read_constraint,
            write_constraint,
            read_bandwidth,
            write_bandwidth,
            on: true,
        }))
    }

    pub fn disk(&self, disk: DiskId) -> Option<&Disk> {
        self.disks.get(disk)
    }

    pub fn disk_by_name(&self, name: &str) -> Option<DiskId> {
        self.disks
            .iter()
            .find(|(_, d)| d.name == name)
            .map(|(id, _)| id)
    }

    fn get(&self, disk: DiskId) -> Result<&Disk, ModelError> {
        self.disks.get(disk).ok_or(ModelError::StaleResource {
            kind: "disk",
            model: "disk",
        })
    }

    fn get_mut(&mut self, disk: DiskId) -> Result<&mut Disk, ModelError> {
        self.disks.get_mut(disk).ok_or(ModelError::StaleResource {
            kind: "disk",
            model: "disk",
        })
    }

    /// Read or write `size` bytes on `disk`.
    pub fn io_start(&mut self, disk: DiskId, size: f64, op: IoOp) -> Result<ActionId, ModelError> {
        check_amount("size", size)?;
        let d = self.get(disk)?;
        let (shared, direction, on) = (d.constraint, d.direction(op), d.on);

        let id = self.core.new_action(size, !on);
        if !on {
            return Ok(id);
        }
        let var = self.core.new_variable(id, 1.0, None, 2);
        let system = self.core.system_mut();
        system.expand(shared, var, 1.0);
        system.expand(direction, var, 1.0);
        debug!(disk = %self.disks[disk].name, size, %op, "io started");
        Ok(id)
    }

    pub fn read(&mut self, disk: DiskId, size: f64) -> Result<ActionId, ModelError> {
        self.io_start(disk, size, IoOp::Read)
    }

    pub fn write(&mut self, disk: DiskId, size: f64) -> Result<ActionId, ModelError> {
        self.io_start(disk, size, IoOp::Write)
    }

    pub fn set_read_bandwidth(&mut self, disk: DiskId, bandwidth: f64) -> Result<(), ModelError> {
        check_amount("read bandwidth", bandwidth)?;
        let d = self.get_mut(disk)?;
        d.read_bandwidth = bandwidth;
        self.rebound(disk, IoOp::Read);
        Ok(())
    }

    pub fn set_write_bandwidth(&mut self, disk: DiskId, bandwidth: f64) -> Result<(), ModelError> {
        check_amount("write bandwidth", bandwidth)?;
        let d = self.get_mut(disk)?;
        d.write_bandwidth = bandwidth;
        self.rebound(disk, IoOp::Write);
        Ok(())
    }

    /// Push the bandwidths of `disk` to its constraints after a change of
    /// direction `op`.
    fn rebound(&mut self, disk: DiskId, op: IoOp) {
        let d = &self.disks[disk];
        let (shared, direction, shared_bound) = (d.constraint, d.direction(op), d.shared_bound());
        let direction_bound = match op {
            IoOp::Read => d.read_bandwidth,
            IoOp::Write => d.write_bandwidth,
        };
        debug!(disk = %d.name, %op, bandwidth = direction_bound, "disk bandwidth changed");
        let system = self.core.system_mut();
        system.update_constraint_bound(direction, Some(direction_bound));
        system.update_constraint_bound(shared, Some(shared_bound));
    }

    pub fn turn_off(&mut self, disk: DiskId) -> Result<(), ModelError> {
        let d = self.get_mut(disk)?;
        if !d.on {
            return Ok(());
        }
        d.on = false;
        let constraint = d.constraint;
        let failed = self.core.fail_actions_using(constraint);
        warn!(disk = %self.disks[disk].name, failed, "disk turned off");
        Ok(())
    }

    pub fn turn_on(&mut self, disk: DiskId) -> Result<(), ModelError> {
        let d = self.get_mut(disk)?;
        d.on = true;
        info!(disk = %d.name, "disk turned on");
        Ok(())
    }
}

impl Model for DiskModel {
    fn core(&self) -> &ModelCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModelCore {
        &mut self.core
    }

    fn apply_event(&mut self, target: ResourceRef, event: ResourceEvent) -> Result<(), ModelError> {
        let ResourceRef::Disk(disk) = target else {
            return Err(ModelError::UnsupportedEvent { model: "disk" });
        };
        match event {
            ResourceEvent::ReadBandwidth(bw) => self.set_read_bandwidth(disk, bw),
            ResourceEvent::WriteBandwidth(bw) => self.set_write_bandwidth(disk, bw),
            ResourceEvent::State(true) => self.turn_on(disk),
            ResourceEvent::State(false) => self.turn_off(disk),
            _ => Err(ModelError::UnsupportedEvent { model: "disk" }),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lmm::SolverAlgorithm;
    use crate::resource::{ActionState, UpdateAlgorithm};

    fn model(update: UpdateAlgorithm) -> DiskModel {
        let options = match update {
            UpdateAlgorithm::Full => ModelOptions::full(SolverAlgorithm::MaxMin),
            UpdateAlgorithm::Lazy => ModelOptions::lazy(SolverAlgorithm::MaxMin),
        };
        DiskModel::new(&options).unwrap()
    }

    fn run_from(m: &mut DiskModel, mut now: f64) -> f64 {
        while let Some(delta) = m.next_occurring_event(now) {
            now += delta;
            m.update_actions_state(now, delta);
        }
        now
    }

    fn finish_time(m: &DiskModel, id: ActionId) -> f64 {
        m.action(id).and_then(|a| a.finish_time()).unwrap()
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-9, "expected {expected}, got {actual}");
    }

    #[test]
    fn read_runs_at_read_bandwidth() {
        let mut m = model(UpdateAlgorithm::Full);
        let d = m.add_disk("d", 100.0, 50.0).unwrap();
        let r = m.read(d, 1000.0).unwrap();
        let w = m.write(d, 1000.0).unwrap();
        m.next_occurring_event(0.0);
        // shared bound 100, read capped at 100, write at 50
        assert_close(m.core().rate(r), 50.0);
        assert_close(m.core().rate(w), 50.0);
    }

    #[test]
    fn directions_are_capped_independently() {
        let mut m = model(UpdateAlgorithm::Full);
        let d = m.add_disk("d", 100.0, 20.0).unwrap();
        let r = m.read(d, 1000.0).unwrap();
        let w = m.write(d, 1000.0).unwrap();
        m.next_occurring_event(0.0);
        assert_close(m.core().rate(w), 20.0);
        assert_close(m.core().rate(r), 80.0);
    }

    #[test]
    fn lazy_and_full_agree() {
        for update in [UpdateAlgorithm::Full, UpdateAlgorithm::Lazy] {
            let mut m = model(update);
            let d = m.add_disk("d", 100.0, 100.0).unwrap();
            let a = m.read(d, 100.0).unwrap();
            let b = m.write(d, 300.0).unwrap();
            run_from(&mut m, 0.0);
            assert_close(finish_time(&m, a), 2.0);
            assert_close(finish_time(&m, b), 4.0);
        }
    }

    #[test]
    fn remains_are_whole_bytes() {
        let mut m = model(UpdateAlgorithm::Full);
        let d = m.add_disk("d", 3.0, 3.0).unwrap();
        let r = m.read(d, 10.0).unwrap();
        let delta = m.next_occurring_event(0.0).unwrap();
        assert_close(delta, 10.0 / 3.0);
        m.update_actions_state(0.5, 0.5);
        // 1.5 bytes round to 2
        assert_eq!(m.action(r).unwrap().remains(), 8.0);
    }

    #[test]
    fn write_bandwidth_event_applies() {
        let mut m = model(UpdateAlgorithm::Lazy);
        let d = m.add_disk("d", 100.0, 10.0).unwrap();
        let w = m.write(d, 100.0).unwrap();
        m.next_occurring_event(0.0);
        m.update_actions_state(5.0, 5.0);
        m.apply_event(ResourceRef::Disk(d), ResourceEvent::WriteBandwidth(50.0))
            .unwrap();
        assert_eq!(
            m.core().system().get_constraint_bound(m.disk(d).unwrap().constraint()),
            Some(100.0)
        );
        run_from(&mut m, 5.0);
        assert_close(finish_time(&m, w), 6.0);
    }

    #[test]
    fn disk_failure_fails_io() {
        let mut m = model(UpdateAlgorithm::Full);
        let d = m.add_disk("d", 100.0, 100.0).unwrap();
        let r = m.read(d, 100.0).unwrap();
        m.turn_off(d).unwrap();
        assert_eq!(m.action(r).unwrap().state(), ActionState::Failed);
        let w = m.write(d, 100.0).unwrap();
        assert_eq!(m.action(w).unwrap().state(), ActionState::Failed);
        m.turn_on(d).unwrap();
        let ok = m.write(d, 100.0).unwrap();
        assert_eq!(m.action(ok).unwrap().state(), ActionState::Started);
    }

    #[test]
    fn bandwidth_events_reach_the_constraint_only() {
        let mut m = model(UpdateAlgorithm::Full);
        let d = m.add_disk("d", 10.0, 10.0).unwrap();
        assert!(m
            .apply_event(ResourceRef::Disk(d), ResourceEvent::Speed(2.0))
            .is_err());
        assert!(m.set_read_bandwidth(d, -1.0).is_err());
    }
}
