/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Simulation clock and event loop.
//!
//! The [`Engine`] owns the simulated date and the queue of scheduled
//! resource events (speed, bandwidth, latency and state changes read from
//! traces).  One [`Engine::solve`] step:
//!
//! 1. asks every model for the delay until its next event,
//! 2. shortens it to the next scheduled resource event, and to `max_date`,
//! 3. advances the clock and makes every model progress,
//! 4. applies the resource events that are now due.
//!
//! Models are passed in by the caller at every step; a scheduled event names
//! the model by its index in that slice.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use thiserror::Error;
use tracing::{debug, trace};

use crate::resource::{Completion, Model, ModelError, ResourceEvent, ResourceRef};

#[derive(Debug, Error, PartialEq)]
pub enum EngineError {
    #[error("no model at index {0}")]
    UnknownModel(usize),

    #[error("scheduled event at {date} is before the current date {now}")]
    EventInThePast { date: f64, now: f64 },

    #[error(transparent)]
    Model(#[from] ModelError),
}

/// A resource change to apply at a given date.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledEvent {
    pub date: f64,
    pub model: usize,
    pub target: ResourceRef,
    pub event: ResourceEvent,
}

#[derive(Debug)]
struct Queued {
    date: f64,
    seq: u64,
    event: ScheduledEvent,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.date
            .total_cmp(&other.date)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, Default)]
pub struct Engine {
    now: f64,
    events: BinaryHeap<Reverse<Queued>>,
    seq: u64,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> f64 {
        self.now
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    pub fn next_event_date(&self) -> Option<f64> {
        self.events.peek().map(|Reverse(q)| q.date)
    }

    /// Queue `event` on `target` of model `model` at `date`.  Events at the
    /// same date apply in scheduling order.
    pub fn schedule_event(
        &mut self,
        date: f64,
        model: usize,
        target: ResourceRef,
        event: ResourceEvent,
    ) -> Result<(), EngineError> {
        if date < self.now {
            return Err(EngineError::EventInThePast { date, now: self.now });
        }
        self.seq += 1;
        self.events.push(Reverse(Queued {
            date,
            seq: self.seq,
            event: ScheduledEvent {
                date,
                model,
                target,
                event,
            },
        }));
        Ok(())
    }

    /// Advance the simulation by one step.  Returns the elapsed time, or
    /// `None` when no model has anything left to do and no event is queued
    /// before `max_date`.
    pub fn solve(
        &mut self,
        models: &mut [&mut dyn Model],
        max_date: Option<f64>,
    ) -> Result<Option<f64>, EngineError> {
        let mut delta: Option<f64> = max_date.map(|d| (d - self.now).max(0.0));

        for model in models.iter_mut() {
            if let Some(next) = model.next_occurring_event(self.now) {
                trace!(model = model.name(), next, "model next event");
                delta = Some(delta.map_or(next, |d| d.min(next)));
            }
        }
        if let Some(date) = self.next_event_date() {
            let until_event = (date - self.now).max(0.0);
            delta = Some(delta.map_or(until_event, |d| d.min(until_event)));
        }

        let Some(delta) = delta else {
            debug!(now = self.now, "nothing left to simulate");
            return Ok(None);
        };
        self.now += delta;
        for model in models.iter_mut() {
            model.update_actions_state(self.now, delta);
        }
        self.apply_due_events(models)?;
        trace!(now = self.now, delta, "step");
        Ok(Some(delta))
    }

    fn apply_due_events(&mut self, models: &mut [&mut dyn Model]) -> Result<(), EngineError> {
        while self
            .events
            .peek()
            .is_some_and(|Reverse(q)| q.date <= self.now)
        {
            let Some(Reverse(q)) = self.events.pop() else {
                break;
            };
            let e = q.event;
            let model = models
                .get_mut(e.model)
                .ok_or(EngineError::UnknownModel(e.model))?;
            debug!(
                date = e.date,
                model = model.name(),
                target = ?e.target,
                event = ?e.event,
                "applying resource event"
            );
            model.apply_event(e.target, e.event)?;
        }
        Ok(())
    }

    /// Step until nothing is left or `max_date` is reached, and gather every
    /// completion in date order.
    pub fn run(
        &mut self,
        models: &mut [&mut dyn Model],
        max_date: Option<f64>,
    ) -> Result<Vec<(usize, Completion)>, EngineError> {
        let mut completions = Vec::new();
        loop {
            let step = self.solve(models, max_date)?;
            for (i, model) in models.iter_mut().enumerate() {
                completions.extend(model.take_completed().into_iter().map(|c| (i, c)));
            }
            let reached_max = max_date.is_some_and(|d| self.now >= d);
            if step.is_none() || reached_max {
                break;
            }
        }
        completions.sort_by(|a, b| a.1.date.total_cmp(&b.1.date));
        Ok(completions)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lmm::SolverAlgorithm;
    use crate::models::{CpuModel, LinkSharing, NetworkModel, NetworkParams};
    use crate::resource::{ActionState, FactorCurve, ModelOptions};

    fn cpu() -> CpuModel {
        CpuModel::new(&ModelOptions::lazy(SolverAlgorithm::MaxMin)).unwrap()
    }

    fn network() -> NetworkModel {
        let params = NetworkParams {
            crosstraffic: false,
            weight_s: 0.0,
            latency_factor: FactorCurve::constant(1.0),
            bandwidth_factor: FactorCurve::constant(1.0),
            ..NetworkParams::default()
        };
        NetworkModel::new(&ModelOptions::lazy(SolverAlgorithm::MaxMin), params).unwrap()
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= 1e-6 * expected.abs().max(1.0),
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn steps_to_the_earliest_model_event() {
        let mut cpus = cpu();
        let mut net = network();
        let h = cpus.add_host("h", vec![10.0], 1).unwrap();
        let a = net.add_host("a");
        let b = net.add_host("b");
        let l = net.add_link("l", 10.0, 0.0, LinkSharing::Shared).unwrap();
        net.add_route(a, b, vec![l], true).unwrap();

        let exec = cpus.execute(h, 30.0).unwrap();
        let comm = net.communicate(a, b, 50.0, None).unwrap();

        let mut engine = Engine::new();
        let mut models: [&mut dyn Model; 2] = [&mut cpus, &mut net];
        let done = engine.run(&mut models, None).unwrap();

        assert_eq!(done.len(), 2);
        assert_eq!(done[0].0, 0);
        assert_eq!(done[0].1.action, exec);
        assert_close(done[0].1.date, 3.0);
        assert_eq!(done[1].0, 1);
        assert_eq!(done[1].1.action, comm);
        assert_close(done[1].1.date, 5.0);
        assert_close(engine.now(), 5.0);
    }

    #[test]
    fn scheduled_speed_change_applies_on_time() {
        let mut cpus = cpu();
        let h = cpus.add_host("h", vec![10.0], 1).unwrap();
        let exec = cpus.execute(h, 100.0).unwrap();

        let mut engine = Engine::new();
        engine
            .schedule_event(5.0, 0, ResourceRef::Host(h), ResourceEvent::Speed(0.5))
            .unwrap();
        let mut models: [&mut dyn Model; 1] = [&mut cpus];
        let done = engine.run(&mut models, None).unwrap();

        // 50 flops at 10, then 50 at 5
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].1.action, exec);
        assert_close(done[0].1.date, 15.0);
        assert_eq!(engine.pending_events(), 0);
    }

    #[test]
    fn resource_failure_fails_running_actions() {
        let mut cpus = cpu();
        let h = cpus.add_host("h", vec![10.0], 1).unwrap();
        let exec = cpus.execute(h, 100.0).unwrap();

        let mut engine = Engine::new();
        engine
            .schedule_event(2.0, 0, ResourceRef::Host(h), ResourceEvent::State(false))
            .unwrap();
        let mut models: [&mut dyn Model; 1] = [&mut cpus];
        let done = engine.run(&mut models, None).unwrap();

        assert_eq!(done.len(), 1);
        assert_eq!(done[0].1.action, exec);
        assert_eq!(done[0].1.state, ActionState::Failed);
        assert_close(done[0].1.date, 2.0);
    }

    #[test]
    fn max_date_stops_the_clock() {
        let mut cpus = cpu();
        let h = cpus.add_host("h", vec![10.0], 1).unwrap();
        let exec = cpus.execute(h, 100.0).unwrap();

        let mut engine = Engine::new();
        let mut models: [&mut dyn Model; 1] = [&mut cpus];
        let done = engine.run(&mut models, Some(4.0)).unwrap();
        assert!(done.is_empty());
        assert_close(engine.now(), 4.0);
        assert_eq!(
            models[0].action(exec).unwrap().state(),
            ActionState::Started
        );
    }

    #[test]
    fn events_cannot_be_scheduled_in_the_past() {
        let mut cpus = cpu();
        let h = cpus.add_host("h", vec![10.0], 1).unwrap();
        cpus.execute(h, 10.0).unwrap();
        let mut engine = Engine::new();
        let mut models: [&mut dyn Model; 1] = [&mut cpus];
        engine.run(&mut models, None).unwrap();

        assert_eq!(
            engine.schedule_event(0.5, 0, ResourceRef::Host(h), ResourceEvent::Speed(1.0)),
            Err(EngineError::EventInThePast { date: 0.5, now: 1.0 })
        );
    }

    #[test]
    fn event_for_a_missing_model_is_an_error() {
        let mut cpus = cpu();
        let h = cpus.add_host("h", vec![10.0], 1).unwrap();
        let mut engine = Engine::new();
        engine
            .schedule_event(1.0, 3, ResourceRef::Host(h), ResourceEvent::Speed(1.0))
            .unwrap();
        let mut models: [&mut dyn Model; 1] = [&mut cpus];
        assert_eq!(
            engine.run(&mut models, None).unwrap_err(),
            EngineError::UnknownModel(3)
        );
    }

    #[test]
    fn idle_engine_returns_none() {
        let mut cpus = cpu();
        let mut engine = Engine::new();
        let mut models: [&mut dyn Model; 1] = [&mut cpus];
        assert_eq!(engine.solve(&mut models, None).unwrap(), None);
        assert_eq!(engine.now(), 0.0);
    }
}
