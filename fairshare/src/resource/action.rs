/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Activities progressing on resources.
//!
//! An [`Action`] is the model-side view of one computation, transfer or I/O:
//! an amount of work (`cost`), how much is left (`remains`), and the
//! [`Variable`](crate::lmm::Variable) whose solved value is its current
//! rate.  All mutation goes through
//! [`ModelCore`](super::ModelCore), which keeps the variable, the lazy heap
//! and the state lists consistent.
//!
//! ```text
//!            ┌──────────► FINISHED
//! INITED ─► STARTED ─────► FAILED      (resource turned off)
//!            │  ▲  └────► CANCELED
//!   suspend  ▼  │ resume
//!         (suspended)
//! ```
//! An infinite sleep is parked in IGNORED: it never completes by itself.

use slotmap::new_key_type;

use crate::lmm::math::double_update;
use crate::lmm::VariableId;

new_key_type! {
    /// Handle to an [`Action`] owned by a model.
    pub struct ActionId;
}

/// Lifecycle state of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    /// Created, not yet competing for resources.
    Inited,
    /// Competing for resources.
    Started,
    /// Completed its work or its maximal duration.
    Finished,
    /// A resource it used was turned off.
    Failed,
    /// Canceled by its owner.
    Canceled,
    /// Never progresses and is never scheduled (infinite sleep).
    Ignored,
}

impl ActionState {
    /// `true` once the action can no longer progress.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Canceled)
    }
}

/// Whether the action is currently allowed to progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendState {
    Running,
    Suspended,
    /// A sleep: holds no share of its resource by construction.
    Sleeping,
}

/// One activity.  Fields are read through accessors; writes go through
/// [`ModelCore`](super::ModelCore).
#[derive(Debug, Clone)]
pub struct Action {
    pub(crate) cost: f64,
    pub(crate) remains: f64,
    pub(crate) start_time: f64,
    pub(crate) finish_time: Option<f64>,
    /// Remaining time before the action is finished regardless of progress.
    pub(crate) max_duration: Option<f64>,
    pub(crate) state: ActionState,
    pub(crate) suspended: SuspendState,
    pub(crate) variable: Option<VariableId>,
    /// Penalty restored on the variable when it is (re-)enabled.
    pub(crate) sharing_penalty: f64,

    // lazy bookkeeping
    pub(crate) last_update: f64,
    pub(crate) last_value: f64,

    // network-like actions
    /// Latency still to be paid before the action takes any share.
    pub(crate) latency: f64,
    /// Unscaled route latency, used for the TCP window bound.
    pub(crate) lat_current: f64,
    /// Rate requested by the user, already combined with resource limits.
    pub(crate) user_bound: Option<f64>,
}

impl Action {
    pub(crate) fn new(cost: f64, now: f64) -> Self {
        Self {
            cost,
            remains: cost,
            start_time: now,
            finish_time: None,
            max_duration: None,
            state: ActionState::Inited,
            suspended: SuspendState::Running,
            variable: None,
            sharing_penalty: 1.0,
            last_update: now,
            last_value: 0.0,
            latency: 0.0,
            lat_current: 0.0,
            user_bound: None,
        }
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    /// Work left, as of the last update of the model.
    pub fn remains(&self) -> f64 {
        self.remains
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn finish_time(&self) -> Option<f64> {
        self.finish_time
    }

    pub fn max_duration(&self) -> Option<f64> {
        self.max_duration
    }

    pub fn state(&self) -> ActionState {
        self.state
    }

    pub fn suspend_state(&self) -> SuspendState {
        self.suspended
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended == SuspendState::Suspended
    }

    pub fn variable(&self) -> Option<VariableId> {
        self.variable
    }

    pub fn sharing_penalty(&self) -> f64 {
        self.sharing_penalty
    }

    pub fn latency(&self) -> f64 {
        self.latency
    }

    pub fn user_bound(&self) -> Option<f64> {
        self.user_bound
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state == ActionState::Started
    }

    pub(crate) fn update_remains(&mut self, delta: f64, precision: f64) {
        double_update(&mut self.remains, delta, precision);
    }

    pub(crate) fn update_max_duration(&mut self, delta: f64, precision: f64) {
        if let Some(max_duration) = self.max_duration.as_mut() {
            double_update(max_duration, delta, precision);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_action_has_full_remains() {
        let a = Action::new(42.0, 3.0);
        assert_eq!(a.remains(), 42.0);
        assert_eq!(a.start_time(), 3.0);
        assert_eq!(a.state(), ActionState::Inited);
        assert!(a.finish_time().is_none());
    }

    #[test]
    fn remains_snap_to_zero() {
        let mut a = Action::new(1.0, 0.0);
        a.update_remains(1.0 - 1e-16, 1e-14);
        assert_eq!(a.remains(), 0.0);
    }

    #[test]
    fn max_duration_counts_down() {
        let mut a = Action::new(1.0, 0.0);
        a.max_duration = Some(5.0);
        a.update_max_duration(2.0, 1e-9);
        assert_eq!(a.max_duration(), Some(3.0));
        a.update_max_duration(3.0, 1e-9);
        assert_eq!(a.max_duration(), Some(0.0));
    }

    #[test]
    fn terminal_states() {
        assert!(ActionState::Finished.is_terminal());
        assert!(ActionState::Failed.is_terminal());
        assert!(ActionState::Canceled.is_terminal());
        assert!(!ActionState::Started.is_terminal());
        assert!(!ActionState::Ignored.is_terminal());
    }
}
