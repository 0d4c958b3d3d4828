/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! State shared by every resource model.
//!
//! [`ModelCore`] owns the sharing [`System`], the action arena and the
//! bookkeeping around it: the started and ignored lists, the completion
//! queue and, in lazy mode, the completion-date heap.  Concrete models add
//! their resources and the formulas that turn a request into a variable.
//!
//! Both update algorithms produce the same completion dates up to the
//! timing precision:
//!
//! * **Full** walks every started action at every event and subtracts
//!   `rate × delta` from its remaining work.
//! * **Lazy** only revisits actions whose share changed in the last solve,
//!   catches their remaining work up to `now`, and schedules their next
//!   completion date in an [`ActionHeap`].

use slotmap::SlotMap;
use tracing::{debug, info, trace};

use super::{
    Action, ActionHeap, ActionId, ActionState, Completion, HeapType, ModelError, ModelOptions,
    SuspendState, UpdateAlgorithm,
};
use crate::lmm::math::double_update;
use crate::lmm::{ConstraintId, System, VariableId};

#[derive(Debug)]
pub struct ModelCore {
    name: &'static str,
    system: System,
    update: UpdateAlgorithm,

    actions: SlotMap<ActionId, Action>,
    started: Vec<ActionId>,
    ignored: Vec<ActionId>,
    completed: Vec<Completion>,

    /// Actions to revisit at the next lazy event even if the solve did not
    /// report them (new actions, sleeps, paid latencies).
    pending: Vec<ActionId>,
    heap: ActionHeap,

    now: f64,
    /// Progress is counted in whole units (disk bytes).
    integral_remains: bool,
}

impl ModelCore {
    /// # Errors
    /// [`ModelError::LazyWithoutSelectiveUpdate`] for a lazy model without
    /// selective update, and [`ModelError::Solver`] for invalid precisions.
    pub fn new(name: &'static str, options: &ModelOptions) -> Result<Self, ModelError> {
        options.solver_config.validate()?;
        if options.update == UpdateAlgorithm::Lazy && !options.selective_update {
            return Err(ModelError::LazyWithoutSelectiveUpdate(name));
        }
        info!(
            model = name,
            solver = %options.solver,
            update = %options.update,
            selective_update = options.selective_update,
            "model initialised"
        );
        Ok(Self {
            name,
            system: System::build(options.solver, options.selective_update, options.solver_config),
            update: options.update,
            actions: SlotMap::with_key(),
            started: Vec::new(),
            ignored: Vec::new(),
            completed: Vec::new(),
            pending: Vec::new(),
            heap: ActionHeap::new(),
            now: 0.0,
            integral_remains: false,
        })
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn system(&self) -> &System {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut System {
        &mut self.system
    }

    pub fn update_algorithm(&self) -> UpdateAlgorithm {
        self.update
    }

    pub fn is_lazy(&self) -> bool {
        self.update == UpdateAlgorithm::Lazy
    }

    /// Date of the last update of this model.
    pub fn now(&self) -> f64 {
        self.now
    }

    pub fn action(&self, id: ActionId) -> Option<&Action> {
        self.actions.get(id)
    }

    pub fn started(&self) -> &[ActionId] {
        &self.started
    }

    pub fn ignored(&self) -> &[ActionId] {
        &self.ignored
    }

    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    pub fn heap(&self) -> &ActionHeap {
        &self.heap
    }

    pub(crate) fn set_integral_remains(&mut self, integral: bool) {
        self.integral_remains = integral;
    }

    pub(crate) fn action_mut(&mut self, id: ActionId) -> Result<&mut Action, ModelError> {
        self.actions
            .get_mut(id)
            .ok_or(ModelError::UnknownAction { model: self.name })
    }

    fn get(&self, id: ActionId) -> Result<&Action, ModelError> {
        self.actions
            .get(id)
            .ok_or(ModelError::UnknownAction { model: self.name })
    }

    fn remains_precision(&self) -> f64 {
        let c = self.system.config();
        c.maxmin_precision * c.timing_precision
    }

    fn timing_precision(&self) -> f64 {
        self.system.config().timing_precision
    }

    // ── Action creation ───────────────────────────────────────────────────────

    /// Register an action of `cost`.  A `failed` action (its resource is
    /// off) goes straight to the completion queue.
    pub(crate) fn new_action(&mut self, cost: f64, failed: bool) -> ActionId {
        let id = self.actions.insert(Action::new(cost, self.now));
        if failed {
            let action = &mut self.actions[id];
            action.state = ActionState::Failed;
            action.finish_time = Some(self.now);
            self.completed.push(Completion {
                action: id,
                state: ActionState::Failed,
                date: self.now,
            });
            debug!(model = self.name, cost, "action created on a resource that is off");
        } else {
            self.actions[id].state = ActionState::Started;
            self.started.push(id);
            self.touch(id);
        }
        id
    }

    /// Create the variable of `id` in the System.
    pub(crate) fn new_variable(
        &mut self,
        id: ActionId,
        penalty: f64,
        bound: Option<f64>,
        constraint_hint: usize,
    ) -> VariableId {
        let var = self
            .system
            .variable_new(Some(id), penalty, bound, constraint_hint);
        if let Some(action) = self.actions.get_mut(id) {
            action.variable = Some(var);
            action.sharing_penalty = if penalty > 0.0 { penalty } else { action.sharing_penalty };
        }
        var
    }

    /// Move a started action to the IGNORED list: it holds its variable but
    /// is never scheduled.
    pub(crate) fn ignore(&mut self, id: ActionId) {
        if let Some(action) = self.actions.get_mut(id) {
            if action.state == ActionState::Started {
                action.state = ActionState::Ignored;
                self.started.retain(|a| *a != id);
                self.heap.remove(id);
                self.ignored.push(id);
            }
        }
    }

    /// Schedule the action for a lazy date recomputation.
    pub(crate) fn touch(&mut self, id: ActionId) {
        if self.is_lazy() {
            self.pending.push(id);
        }
    }

    pub(crate) fn heap_update(&mut self, id: ActionId, date: f64, kind: HeapType) {
        self.heap.update(id, date, kind);
    }

    // ── Action operations ─────────────────────────────────────────────────────

    /// Current rate of the action (`0` once it left the System).
    pub fn rate(&self, id: ActionId) -> f64 {
        self.actions
            .get(id)
            .and_then(|a| a.variable)
            .map_or(0.0, |var| self.system.get_value(var))
    }

    /// Move the action to a terminal state and release its variable.
    pub(crate) fn finish(&mut self, id: ActionId, state: ActionState) {
        let now = self.now;
        let Some(action) = self.actions.get_mut(id) else {
            return;
        };
        if action.state.is_terminal() {
            return;
        }
        action.state = state;
        action.finish_time = Some(now);
        action.last_value = 0.0;
        let var = action.variable.take();

        self.started.retain(|a| *a != id);
        self.ignored.retain(|a| *a != id);
        self.heap.remove(id);
        if let Some(var) = var {
            self.system.variable_free(var);
        }
        debug!(model = self.name, ?state, date = now, "action done");
        self.completed.push(Completion {
            action: id,
            state,
            date: now,
        });
    }

    /// Cancel a running action.
    pub fn cancel(&mut self, id: ActionId) -> Result<(), ModelError> {
        let state = self.get(id)?.state;
        if matches!(state, ActionState::Started | ActionState::Ignored) {
            self.finish(id, ActionState::Canceled);
        }
        Ok(())
    }

    /// Destroy the action and forget about it.
    pub fn unref(&mut self, id: ActionId) -> Result<(), ModelError> {
        let action = self
            .actions
            .remove(id)
            .ok_or(ModelError::UnknownAction { model: self.name })?;
        self.started.retain(|a| *a != id);
        self.ignored.retain(|a| *a != id);
        self.heap.remove(id);
        if let Some(var) = action.variable {
            self.system.variable_free(var);
        }
        Ok(())
    }

    /// Stop the action from taking any share.  Sleeps cannot be suspended.
    pub fn suspend(&mut self, id: ActionId) -> Result<(), ModelError> {
        let now = self.now;
        let action = self.get(id)?;
        if action.suspended != SuspendState::Running || !action.is_running() {
            return Ok(());
        }
        if self.is_lazy() {
            self.update_remains_lazy(id, now);
            if let Some((date, HeapType::Latency)) = self.heap.entry(id) {
                self.action_mut(id)?.latency = (date - now).max(0.0);
            }
            self.heap.remove(id);
        }
        let action = self.action_mut(id)?;
        action.suspended = SuspendState::Suspended;
        action.last_value = 0.0;
        let var = action.variable;
        if let Some(var) = var {
            self.system.update_variable_penalty(var, 0.0);
        }
        trace!(model = self.name, date = now, "action suspended");
        Ok(())
    }

    /// Let a suspended action compete again.
    pub fn resume(&mut self, id: ActionId) -> Result<(), ModelError> {
        let now = self.now;
        let action = self.action_mut(id)?;
        if action.suspended != SuspendState::Suspended {
            return Ok(());
        }
        action.suspended = SuspendState::Running;
        action.last_update = now;
        let (latency, penalty, var) = (action.latency, action.sharing_penalty, action.variable);
        if latency > 0.0 {
            if self.is_lazy() {
                self.heap.update(id, now + latency, HeapType::Latency);
            }
        } else if let Some(var) = var {
            self.system.update_variable_penalty(var, penalty);
        }
        self.touch(id);
        trace!(model = self.name, date = now, "action resumed");
        Ok(())
    }

    /// Change the weight of the action in the sharing.
    pub fn set_sharing_penalty(&mut self, id: ActionId, penalty: f64) -> Result<(), ModelError> {
        if !(penalty > 0.0 && penalty.is_finite()) {
            return Err(ModelError::InvalidAmount {
                what: "sharing penalty",
                value: penalty,
            });
        }
        let now = self.now;
        if self.is_lazy() && self.get(id)?.is_running() {
            self.update_remains_lazy(id, now);
        }
        let action = self.action_mut(id)?;
        action.sharing_penalty = penalty;
        let active = action.suspended == SuspendState::Running && action.latency <= 0.0;
        if let (true, Some(var)) = (active, action.variable) {
            self.system.update_variable_penalty(var, penalty);
        }
        self.touch(id);
        Ok(())
    }

    /// Impose a maximal rate (`None` = unbounded) on the variable directly.
    pub fn set_bound(&mut self, id: ActionId, bound: Option<f64>) -> Result<(), ModelError> {
        let now = self.now;
        if self.is_lazy() && self.get(id)?.is_running() {
            self.update_remains_lazy(id, now);
        }
        let action = self.action_mut(id)?;
        action.user_bound = bound;
        if let Some(var) = action.variable {
            self.system.update_variable_bound(var, bound);
        }
        self.touch(id);
        Ok(())
    }

    /// Finish the action after `duration` seconds from now whatever its
    /// progress (`None` removes the limit).
    pub fn set_max_duration(&mut self, id: ActionId, duration: Option<f64>) -> Result<(), ModelError> {
        if let Some(d) = duration {
            if d.is_nan() || d < 0.0 {
                return Err(ModelError::InvalidAmount {
                    what: "max duration",
                    value: d,
                });
            }
        }
        let now = self.now;
        if self.is_lazy() && self.get(id)?.is_running() {
            self.update_remains_lazy(id, now);
        }
        self.action_mut(id)?.max_duration = duration;
        self.touch(id);
        Ok(())
    }

    /// Restore the sharing penalty of an action that finished paying its
    /// latency.  Default latency hook of every model.
    pub fn restore_penalty(&mut self, id: ActionId) {
        let Some(action) = self.actions.get(id) else {
            return;
        };
        if action.suspended != SuspendState::Running {
            return;
        }
        if let Some(var) = action.variable {
            self.system.update_variable_penalty(var, action.sharing_penalty);
        }
    }

    /// Fail every action with an element on `cnst` (its resource went off).
    pub(crate) fn fail_actions_using(&mut self, cnst: ConstraintId) -> usize {
        let owners: Vec<ActionId> = self
            .system
            .constraint_variables(cnst)
            .into_iter()
            .filter_map(|var| self.system.variable(var).owner())
            .collect();
        let mut failed = 0;
        for id in owners {
            let alive = self
                .actions
                .get(id)
                .is_some_and(|a| matches!(a.state, ActionState::Started | ActionState::Ignored));
            if alive {
                self.finish(id, ActionState::Failed);
                failed += 1;
            }
        }
        failed
    }

    pub fn take_completed(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completed)
    }

    // ── Progress ──────────────────────────────────────────────────────────────

    /// Catch the remaining work of a lazy action up to `now`.
    fn update_remains_lazy(&mut self, id: ActionId, now: f64) {
        let rate = self.rate(id);
        let remains_precision = self.remains_precision();
        let timing_precision = self.timing_precision();
        let integral = self.integral_remains;
        let Some(action) = self.actions.get_mut(id) else {
            return;
        };
        let delta = now - action.last_update;
        if action.remains > 0.0 {
            let mut done = action.last_value * delta;
            if integral {
                done = done.round_ties_even();
            }
            action.update_remains(done, remains_precision);
        }
        action.update_max_duration(delta, timing_precision);
        action.last_update = now;
        action.last_value = rate;
    }

    /// Solve the System and return the delay until the next event.
    pub fn next_occurring_event(&mut self, now: f64) -> Option<f64> {
        self.now = now;
        match self.update {
            UpdateAlgorithm::Full => self.next_occurring_event_full(),
            UpdateAlgorithm::Lazy => self.next_occurring_event_lazy(now),
        }
    }

    fn next_occurring_event_full(&mut self) -> Option<f64> {
        self.system.solve();
        self.pending.clear();

        let mut min: Option<f64> = None;
        for &id in &self.started {
            let action = &self.actions[id];
            let mut candidate: Option<f64> = None;
            if let Some(var) = action.variable {
                let v = self.system.variable(var);
                if v.penalty() > 0.0 {
                    if action.remains <= 0.0 || v.is_unconstrained() {
                        candidate = Some(0.0);
                    } else if v.value() > 0.0 {
                        candidate = Some(action.remains / v.value());
                    }
                }
            }
            let suspended = action.suspended == SuspendState::Suspended;
            if let Some(md) = action.max_duration.filter(|_| !suspended) {
                candidate = Some(candidate.map_or(md, |c| c.min(md)));
            }
            if action.latency > 0.0 && action.suspended == SuspendState::Running {
                let lat = action.latency;
                candidate = Some(candidate.map_or(lat, |c| c.min(lat)));
            }
            if let Some(c) = candidate {
                min = Some(min.map_or(c, |m| m.min(c)));
            }
        }
        trace!(model = self.name, next = ?min, "next event (full)");
        min
    }

    fn next_occurring_event_lazy(&mut self, now: f64) -> Option<f64> {
        self.system.solve();

        let mut modified = self.system.take_modified_actions();
        modified.append(&mut self.pending);
        let mut seen = std::collections::BTreeSet::new();
        modified.retain(|id| seen.insert(*id));

        for id in modified {
            let running = self
                .actions
                .get(id)
                .is_some_and(|a| a.is_running() && a.suspended != SuspendState::Suspended);
            if !running {
                continue;
            }
            // still paying its latency: its heap entry stands
            if self.actions[id].latency > 0.0 {
                continue;
            }
            self.update_remains_lazy(id, now);

            let action = &self.actions[id];
            let mut date: Option<(f64, HeapType)> = None;
            if let Some(var) = action.variable {
                let v = self.system.variable(var);
                if v.penalty() > 0.0 {
                    if action.remains <= 0.0 || v.is_unconstrained() {
                        date = Some((now, HeapType::Normal));
                    } else if v.value() > 0.0 {
                        date = Some((now + action.remains / v.value(), HeapType::Normal));
                    }
                }
            }
            if let Some(md) = action.max_duration {
                let end = now + md;
                if date.map_or(true, |(d, _)| end < d) {
                    date = Some((end, HeapType::MaxDuration));
                }
            }
            match date {
                Some((d, kind)) => {
                    trace!(model = self.name, date = d, ?kind, "action scheduled");
                    self.heap.update(id, d, kind);
                }
                None => self.heap.remove(id),
            }
        }

        let next = self.heap.top_date().map(|top| (top - now).max(0.0));
        trace!(model = self.name, next = ?next, "next event (lazy)");
        next
    }

    /// Make actions progress up to `now`.  `on_latency_paid` runs for every
    /// running action whose latency just reached zero.
    pub fn update_actions_state<F>(&mut self, now: f64, delta: f64, on_latency_paid: F)
    where
        F: FnMut(&mut ModelCore, ActionId),
    {
        self.now = now;
        match self.update {
            UpdateAlgorithm::Full => self.update_actions_state_full(now, delta, on_latency_paid),
            UpdateAlgorithm::Lazy => self.update_actions_state_lazy(now, on_latency_paid),
        }
    }

    fn update_actions_state_full<F>(&mut self, now: f64, delta: f64, mut on_latency_paid: F)
    where
        F: FnMut(&mut ModelCore, ActionId),
    {
        let remains_precision = self.remains_precision();
        let timing_precision = self.timing_precision();

        for id in self.started.clone() {
            let Some(action) = self.actions.get_mut(id) else {
                continue;
            };
            if !action.is_running() {
                continue;
            }
            // suspended time counts neither as latency nor as duration
            let suspended = action.suspended == SuspendState::Suspended;
            if action.latency > 0.0 && !suspended {
                if action.latency > delta {
                    double_update(&mut action.latency, delta, timing_precision);
                } else {
                    action.latency = 0.0;
                }
                if action.latency <= 0.0 && action.suspended == SuspendState::Running {
                    on_latency_paid(self, id);
                }
            }

            let Some(action) = self.actions.get(id) else {
                continue;
            };
            let (penalty, unconstrained, rate) = match action.variable {
                Some(var) => {
                    let v = self.system.variable(var);
                    (v.penalty(), v.is_unconstrained(), v.value())
                }
                None => (0.0, false, 0.0),
            };

            let integral = self.integral_remains;
            let action = &mut self.actions[id];
            if unconstrained && penalty > 0.0 {
                // uses no resource at all: completes at once
                action.remains = 0.0;
            } else {
                let mut done = rate * delta;
                if integral {
                    done = done.round_ties_even();
                }
                action.update_remains(done, remains_precision);
            }
            if !suspended {
                action.update_max_duration(delta, timing_precision);
            }
            action.last_update = now;
            action.last_value = rate;

            let finished = (action.remains <= 0.0 && penalty > 0.0)
                || action.max_duration.is_some_and(|md| md <= 0.0);
            if finished {
                self.finish(id, ActionState::Finished);
            }
        }
    }

    fn update_actions_state_lazy<F>(&mut self, now: f64, mut on_latency_paid: F)
    where
        F: FnMut(&mut ModelCore, ActionId),
    {
        let precision = self.timing_precision();
        while let Some(top) = self.heap.top_date() {
            if top > now + precision {
                break;
            }
            let Some((id, _, kind)) = self.heap.pop() else {
                break;
            };
            let Some(action) = self.actions.get_mut(id) else {
                continue;
            };
            if !action.is_running() {
                continue;
            }
            match kind {
                HeapType::Latency => {
                    action.latency = 0.0;
                    action.last_update = now;
                    if action.suspended == SuspendState::Running {
                        on_latency_paid(self, id);
                    }
                    self.touch(id);
                }
                HeapType::Normal => {
                    action.remains = 0.0;
                    action.last_update = now;
                    self.finish(id, ActionState::Finished);
                }
                HeapType::MaxDuration => {
                    self.update_remains_lazy(id, now);
                    self.finish(id, ActionState::Finished);
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lmm::SolverAlgorithm;
    use crate::resource::ModelOptions;

    fn core(update: UpdateAlgorithm) -> ModelCore {
        let options = match update {
            UpdateAlgorithm::Full => ModelOptions::full(SolverAlgorithm::MaxMin),
            UpdateAlgorithm::Lazy => ModelOptions::lazy(SolverAlgorithm::MaxMin),
        };
        ModelCore::new("test", &options).unwrap()
    }

    /// One action of `cost` alone on a constraint of `bound`.
    fn single(core: &mut ModelCore, bound: f64, cost: f64) -> (ConstraintId, ActionId) {
        let cnst = core.system_mut().constraint_new(Some(bound));
        let id = core.new_action(cost, false);
        let var = core.new_variable(id, 1.0, None, 1);
        core.system_mut().expand(cnst, var, 1.0);
        (cnst, id)
    }

    /// Drive the core alone until nothing is left to do.
    fn run(core: &mut ModelCore) -> f64 {
        let mut now = 0.0;
        while let Some(delta) = core.next_occurring_event(now) {
            now += delta;
            core.update_actions_state(now, delta, ModelCore::restore_penalty);
        }
        now
    }

    #[test]
    fn lazy_requires_selective_update() {
        let mut options = ModelOptions::lazy(SolverAlgorithm::MaxMin);
        options.selective_update = false;
        assert_eq!(
            ModelCore::new("cpu", &options).unwrap_err(),
            ModelError::LazyWithoutSelectiveUpdate("cpu")
        );
    }

    #[test]
    fn full_action_progresses_and_finishes() {
        let mut core = core(UpdateAlgorithm::Full);
        let (_, id) = single(&mut core, 10.0, 100.0);

        assert_eq!(core.next_occurring_event(0.0), Some(10.0));
        core.update_actions_state(5.0, 5.0, ModelCore::restore_penalty);
        assert_eq!(core.action(id).unwrap().remains(), 50.0);
        assert_eq!(core.action(id).unwrap().state(), ActionState::Started);

        assert_eq!(core.next_occurring_event(5.0), Some(5.0));
        core.update_actions_state(10.0, 5.0, ModelCore::restore_penalty);
        let a = core.action(id).unwrap();
        assert_eq!(a.state(), ActionState::Finished);
        assert_eq!(a.finish_time(), Some(10.0));
        assert_eq!(a.remains(), 0.0);
        assert!(a.variable().is_none());

        let done = core.take_completed();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].state, ActionState::Finished);
        assert!(core.started().is_empty());
    }

    #[test]
    fn lazy_and_full_finish_at_the_same_dates() {
        let mut dates = Vec::new();
        for update in [UpdateAlgorithm::Full, UpdateAlgorithm::Lazy] {
            let mut core = core(update);
            let cnst = core.system_mut().constraint_new(Some(10.0));
            for cost in [10.0, 40.0, 90.0] {
                let id = core.new_action(cost, false);
                let var = core.new_variable(id, 1.0, None, 1);
                core.system_mut().expand(cnst, var, 1.0);
            }
            run(&mut core);
            let mut finished: Vec<f64> = core.take_completed().iter().map(|c| c.date).collect();
            finished.sort_by(f64::total_cmp);
            dates.push(finished);
        }
        // 3 × 10/3 → 3s; 2 × 5 → 3 + 6 = 9s; alone at 10 → 9 + 5 = 14s
        for finished in &dates {
            assert_eq!(finished.len(), 3);
            assert!((finished[0] - 3.0).abs() < 1e-9);
            assert!((finished[1] - 9.0).abs() < 1e-9);
            assert!((finished[2] - 14.0).abs() < 1e-9);
        }
    }

    #[test]
    fn max_duration_finishes_early() {
        for update in [UpdateAlgorithm::Full, UpdateAlgorithm::Lazy] {
            let mut core = core(update);
            let (_, id) = single(&mut core, 1.0, 100.0);
            core.set_max_duration(id, Some(4.0)).unwrap();
            let end = run(&mut core);
            assert!((end - 4.0).abs() < 1e-9, "{update}: {end}");
            let a = core.action(id).unwrap();
            assert_eq!(a.state(), ActionState::Finished);
            assert!((a.remains() - 96.0).abs() < 1e-6);
        }
    }

    #[test]
    fn suspend_freezes_progress() {
        for update in [UpdateAlgorithm::Full, UpdateAlgorithm::Lazy] {
            let mut core = core(update);
            let (_, id) = single(&mut core, 10.0, 100.0);

            let delta = core.next_occurring_event(0.0).unwrap();
            assert_eq!(delta, 10.0);
            core.update_actions_state(2.0, 2.0, ModelCore::restore_penalty);
            core.suspend(id).unwrap();
            assert!(core.action(id).unwrap().is_suspended());
            assert_eq!(core.next_occurring_event(2.0), None);

            core.update_actions_state(7.0, 5.0, ModelCore::restore_penalty);
            core.resume(id).unwrap();
            let delta = core.next_occurring_event(7.0).unwrap();
            assert!((delta - 8.0).abs() < 1e-9, "{update}: {delta}");
        }
    }

    /// Like [`single`], but the action first pays `latency` seconds.
    fn delayed(core: &mut ModelCore, bound: f64, cost: f64, latency: f64) -> ActionId {
        let cnst = core.system_mut().constraint_new(Some(bound));
        let id = core.new_action(cost, false);
        let var = core.new_variable(id, 0.0, None, 1);
        core.system_mut().expand(cnst, var, 1.0);
        let action = core.action_mut(id).unwrap();
        action.latency = latency;
        action.sharing_penalty = 1.0;
        if core.is_lazy() {
            core.heap_update(id, latency, HeapType::Latency);
        }
        id
    }

    /// Step to `t`, suspend, step to `t + pause`, resume, then run to the end.
    fn pause_and_finish(core: &mut ModelCore, id: ActionId, t: f64, pause: f64) -> f64 {
        core.next_occurring_event(0.0);
        core.update_actions_state(t, t, ModelCore::restore_penalty);
        core.suspend(id).unwrap();
        core.next_occurring_event(t);
        core.update_actions_state(t + pause, pause, ModelCore::restore_penalty);
        core.resume(id).unwrap();

        let mut now = t + pause;
        while let Some(delta) = core.next_occurring_event(now) {
            now += delta;
            core.update_actions_state(now, delta, ModelCore::restore_penalty);
        }
        core.action(id).unwrap().finish_time().unwrap()
    }

    #[test]
    fn suspended_time_does_not_count_towards_max_duration() {
        for update in [UpdateAlgorithm::Full, UpdateAlgorithm::Lazy] {
            let mut core = core(update);
            let (_, id) = single(&mut core, 10.0, 100.0);
            core.set_max_duration(id, Some(6.0)).unwrap();

            // 2 s run, 5 s pause, 4 s of duration left
            let finish = pause_and_finish(&mut core, id, 2.0, 5.0);
            assert!((finish - 11.0).abs() < 1e-9, "{update}: {finish}");
            assert_eq!(core.action(id).unwrap().state(), ActionState::Finished);
        }
    }

    #[test]
    fn suspended_time_does_not_pay_latency() {
        for update in [UpdateAlgorithm::Full, UpdateAlgorithm::Lazy] {
            let mut core = core(update);
            let id = delayed(&mut core, 100.0, 100.0, 10.0);

            // 8 s of latency left at 7, paid at 15, then 1 s of transfer
            let finish = pause_and_finish(&mut core, id, 2.0, 5.0);
            assert!((finish - 16.0).abs() < 1e-9, "{update}: {finish}");
        }
    }

    #[test]
    fn cancel_and_unref() {
        let mut core = core(UpdateAlgorithm::Full);
        let (cnst, id) = single(&mut core, 10.0, 100.0);
        core.cancel(id).unwrap();
        assert_eq!(core.action(id).unwrap().state(), ActionState::Canceled);
        assert!(!core.system().constraint_used(cnst));

        core.unref(id).unwrap();
        assert!(core.action(id).is_none());
        assert!(matches!(core.unref(id), Err(ModelError::UnknownAction { .. })));
        assert!(core.cancel(id).is_err());
    }

    #[test]
    fn failed_actions_are_reported_at_once() {
        let mut core = core(UpdateAlgorithm::Full);
        let id = core.new_action(5.0, true);
        assert_eq!(core.action(id).unwrap().state(), ActionState::Failed);
        assert!(core.started().is_empty());
        assert_eq!(core.take_completed()[0].state, ActionState::Failed);
    }

    #[test]
    fn failing_a_constraint_fails_its_actions() {
        let mut core = core(UpdateAlgorithm::Lazy);
        let (cnst, a) = single(&mut core, 10.0, 100.0);
        let other = core.system_mut().constraint_new(Some(10.0));
        let b = core.new_action(100.0, false);
        let var = core.new_variable(b, 1.0, None, 1);
        core.system_mut().expand(other, var, 1.0);

        core.next_occurring_event(0.0);
        assert_eq!(core.fail_actions_using(cnst), 1);
        assert_eq!(core.action(a).unwrap().state(), ActionState::Failed);
        assert_eq!(core.action(b).unwrap().state(), ActionState::Started);
        assert!(!core.heap().contains(a));
    }

    #[test]
    fn sharing_penalty_changes_shares() {
        let mut core = core(UpdateAlgorithm::Full);
        let cnst = core.system_mut().constraint_new(Some(30.0));
        let mut ids = Vec::new();
        for _ in 0..2 {
            let id = core.new_action(100.0, false);
            let var = core.new_variable(id, 1.0, None, 1);
            core.system_mut().expand(cnst, var, 1.0);
            ids.push(id);
        }
        core.set_sharing_penalty(ids[0], 2.0).unwrap();
        core.next_occurring_event(0.0);
        assert!((core.rate(ids[0]) - 10.0).abs() < 1e-9);
        assert!((core.rate(ids[1]) - 20.0).abs() < 1e-9);
        assert!(core.set_sharing_penalty(ids[0], 0.0).is_err());
    }

    #[test]
    fn bound_limits_rate() {
        let mut core = core(UpdateAlgorithm::Lazy);
        let (_, id) = single(&mut core, 10.0, 100.0);
        core.set_bound(id, Some(4.0)).unwrap();
        assert_eq!(core.next_occurring_event(0.0), Some(25.0));
        assert_eq!(core.action(id).unwrap().user_bound(), Some(4.0));
    }

    #[test]
    fn unconstrained_action_completes_immediately() {
        for update in [UpdateAlgorithm::Full, UpdateAlgorithm::Lazy] {
            let mut core = core(update);
            let id = core.new_action(10.0, false);
            core.new_variable(id, 1.0, None, 0);
            assert_eq!(core.next_occurring_event(0.0), Some(0.0));
            core.update_actions_state(0.0, 0.0, ModelCore::restore_penalty);
            assert_eq!(core.action(id).unwrap().state(), ActionState::Finished);
        }
    }

    #[test]
    fn integral_remains_round_progress() {
        let mut core = core(UpdateAlgorithm::Full);
        core.set_integral_remains(true);
        let (_, id) = single(&mut core, 3.0, 100.0);
        core.next_occurring_event(0.0);
        core.update_actions_state(0.5, 0.5, ModelCore::restore_penalty);
        // 1.5 rounds to the even 2
        assert_eq!(core.action(id).unwrap().remains(), 98.0);
    }
}
