/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Shared plumbing of the resource models.
//!
//! | Item | Role |
//! |---|---|
//! | [`Action`] | one computation / transfer / I/O and its progress |
//! | [`ModelCore`] | the System, the action arena, state lists, lazy heap |
//! | [`Model`] | what the [`Engine`](crate::engine::Engine) drives |
//! | [`RoutingTable`] | static routes between hosts |
//! | [`FactorCurve`] | size-dependent latency / bandwidth corrections |
//!
//! Every model follows the same cycle, driven by the engine:
//!
//! 1. `next_occurring_event(now)` solves the System and returns the delay
//!    until the first action completes, reaches its maximal duration or
//!    finishes paying its latency.
//! 2. The engine advances the clock by the smallest delay over all models.
//! 3. `update_actions_state(now, delta)` makes every action progress and
//!    moves completed ones to the completion queue.

pub mod action;
pub mod error;
pub mod factors;
pub mod heap;
pub mod model;
pub mod routing;

pub use action::{Action, ActionId, ActionState, SuspendState};
pub use error::ModelError;
pub use factors::FactorCurve;
pub use heap::{ActionHeap, HeapType};
pub use model::ModelCore;
pub use routing::RoutingTable;

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use slotmap::new_key_type;

use crate::lmm::{SolverAlgorithm, SolverConfig};

new_key_type! {
    /// Handle to a host (CPU) registered in a model.
    pub struct HostId;
    /// Handle to a network link registered in a model.
    pub struct LinkId;
    /// Handle to a disk registered in a model.
    pub struct DiskId;
}

// ── Options ───────────────────────────────────────────────────────────────────

/// How a model makes actions progress between events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum UpdateAlgorithm {
    /// Every started action is updated at every event.
    #[default]
    Full,
    /// Only actions whose share changed are revisited; completion dates are
    /// kept in a heap.
    Lazy,
}

impl FromStr for UpdateAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Full" => Ok(Self::Full),
            "Lazy" => Ok(Self::Lazy),
            other => Err(format!("unknown update algorithm '{other}' (valid: Full, Lazy)")),
        }
    }
}

impl fmt::Display for UpdateAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("Full"),
            Self::Lazy => f.write_str("Lazy"),
        }
    }
}

/// Construction parameters shared by every model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOptions {
    pub solver: SolverAlgorithm,
    pub update: UpdateAlgorithm,
    pub selective_update: bool,
    pub solver_config: SolverConfig,
}

impl ModelOptions {
    pub fn full(solver: SolverAlgorithm) -> Self {
        Self {
            solver,
            update: UpdateAlgorithm::Full,
            selective_update: false,
            solver_config: SolverConfig::default(),
        }
    }

    pub fn lazy(solver: SolverAlgorithm) -> Self {
        Self {
            solver,
            update: UpdateAlgorithm::Lazy,
            selective_update: true,
            solver_config: SolverConfig::default(),
        }
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

/// The resource an external event applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceRef {
    Host(HostId),
    Link(LinkId),
    Disk(DiskId),
}

/// Profile-driven change of a resource.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResourceEvent {
    /// Host speed scale (1.0 = nominal pstate speed).
    Speed(f64),
    /// Link bandwidth, in bytes per second.
    Bandwidth(f64),
    /// Link latency, in seconds.
    Latency(f64),
    ReadBandwidth(f64),
    WriteBandwidth(f64),
    /// `false` turns the resource off and fails the actions using it.
    State(bool),
}

/// One action leaving the STARTED state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Completion {
    pub action: ActionId,
    pub state: ActionState,
    pub date: f64,
}

// ── Model trait ───────────────────────────────────────────────────────────────

/// A resource family driven by the engine.
pub trait Model {
    fn core(&self) -> &ModelCore;

    fn core_mut(&mut self) -> &mut ModelCore;

    fn name(&self) -> &'static str {
        self.core().name()
    }

    /// Delay from `now` until the next event of this model, if any.
    fn next_occurring_event(&mut self, now: f64) -> Option<f64> {
        self.core_mut().next_occurring_event(now)
    }

    /// Make every action progress by `delta`, ending at `now`.
    fn update_actions_state(&mut self, now: f64, delta: f64) {
        self.core_mut()
            .update_actions_state(now, delta, ModelCore::restore_penalty);
    }

    fn apply_event(&mut self, target: ResourceRef, event: ResourceEvent) -> Result<(), ModelError>;

    fn take_completed(&mut self) -> Vec<Completion> {
        self.core_mut().take_completed()
    }

    fn action(&self, id: ActionId) -> Option<&Action> {
        self.core().action(id)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_algorithm_parses() {
        assert_eq!("Full".parse::<UpdateAlgorithm>(), Ok(UpdateAlgorithm::Full));
        assert_eq!("Lazy".parse::<UpdateAlgorithm>(), Ok(UpdateAlgorithm::Lazy));
        assert!("lazy".parse::<UpdateAlgorithm>().is_err());
        assert_eq!(UpdateAlgorithm::Lazy.to_string(), "Lazy");
    }

    #[test]
    fn lazy_options_enable_selective_update() {
        let o = ModelOptions::lazy(SolverAlgorithm::MaxMin);
        assert!(o.selective_update);
        assert_eq!(o.update, UpdateAlgorithm::Lazy);
        assert!(!ModelOptions::full(SolverAlgorithm::MaxMin).selective_update);
    }
}
