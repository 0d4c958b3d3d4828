/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Linear max-min (LMM) fair-sharing system.
//!
//! A [`System`] is a bipartite graph of capacity-limited [`Constraint`]s
//! (CPUs, links, disks) and demand [`Variable`]s (one per running activity),
//! joined by weighted [`Element`]s.  [`System::solve`] assigns a rate to every
//! variable so that no constraint is over-subscribed and the allocation is
//! fair according to the selected [`SolverAlgorithm`]:
//!
//! | Algorithm | Fairness | Used by |
//! |---|---|---|
//! | [`SolverAlgorithm::MaxMin`] | weighted max-min (progressive filling) | CPU, network, disk |
//! | [`SolverAlgorithm::FairBottleneck`] | equal per-round increments | parallel tasks, streaming I/O |
//! | [`SolverAlgorithm::Lagrange`] | protocol-curve utility (Reno, Vegas) | network (TCP models) |
//! | [`SolverAlgorithm::Bmf`] | bottleneck max fairness (per-resource equilibrium) | parallel tasks, streaming I/O |
//!
//! # Handles
//!
//! Constraints and variables live in generational arenas
//! ([`slotmap::SlotMap`]).  A freed handle is never reused silently: using it
//! panics instead of aliasing a newer object.  Constraint-side element lists
//! hold `(variable, element index)` pairs so a variable owns its elements and
//! a constraint only references them.
//!
//! # Selective update
//!
//! With selective update enabled, every mutation marks the transitive closure
//! of affected constraints as *modified* and only that sub-system is re-solved.
//! The owners of variables touched by the last solve are reported through
//! [`System::take_modified_actions`] so lazy models can recompute only those
//! completion dates.
//!
//! # Concurrency limit
//!
//! A constraint may cap the number of simultaneously enabled variables.  A
//! variable that would exceed a limit is kept disabled with a *staged* penalty
//! and enabled later, in order, when another variable leaves the constraint.

pub mod error;
pub mod lagrange;
pub mod math;

mod bmf;
mod bottleneck;
mod maxmin;

pub use error::SolverError;
pub use lagrange::{Protocol, ProtocolCurve};

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use slotmap::{new_key_type, SlotMap};
use tracing::{debug, trace, warn, Level};

use crate::resource::ActionId;
use math::double_positive;

new_key_type! {
    /// Handle to a [`Constraint`] owned by a [`System`].
    pub struct ConstraintId;
    /// Handle to a [`Variable`] owned by a [`System`].
    pub struct VariableId;
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Default relative precision of the sharing solvers.
pub const DEFAULT_MAXMIN_PRECISION: f64 = 1e-5;

/// Default precision on dates and remaining amounts.
pub const DEFAULT_TIMING_PRECISION: f64 = 1e-9;

/// Default cap on the allocation rounds of the BMF solver.
pub const DEFAULT_BMF_MAX_ITERATIONS: usize = 1000;

// ── Configuration ─────────────────────────────────────────────────────────────

/// Numeric policy shared by a [`System`] and the model that owns it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverConfig {
    /// Tolerance of capacity comparisons, scaled by each constraint's bound.
    pub maxmin_precision: f64,
    /// Tolerance of date and remaining-amount comparisons.
    pub timing_precision: f64,
    /// Concurrency limit given to every new constraint (`None` = unlimited).
    pub concurrency_limit: Option<usize>,
    /// Allocation rounds tried by [`SolverAlgorithm::Bmf`] before giving up.
    pub bmf_max_iterations: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            maxmin_precision: DEFAULT_MAXMIN_PRECISION,
            timing_precision: DEFAULT_TIMING_PRECISION,
            concurrency_limit: None,
            bmf_max_iterations: DEFAULT_BMF_MAX_ITERATIONS,
        }
    }
}

impl SolverConfig {
    /// Reject non-positive or non-finite precisions.
    pub fn validate(&self) -> Result<(), SolverError> {
        for (name, value) in [
            ("maxmin", self.maxmin_precision),
            ("timing", self.timing_precision),
        ] {
            if !(value > 0.0 && value.is_finite()) {
                return Err(SolverError::InvalidPrecision { name, value });
            }
        }
        if self.bmf_max_iterations == 0 {
            return Err(SolverError::InvalidIterations);
        }
        Ok(())
    }
}

/// How a constraint aggregates the consumption of its variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SharingPolicy {
    /// Σ weight × value ≤ bound.
    #[default]
    Shared,
    /// max(weight × value) ≤ bound: every variable may use the full capacity.
    FatPipe,
}

/// Sharing algorithm run by [`System::solve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolverAlgorithm {
    #[default]
    MaxMin,
    FairBottleneck,
    Lagrange(Protocol),
    Bmf,
}

impl FromStr for SolverAlgorithm {
    type Err = SolverError;

    /// Parse the solver names accepted in configuration files.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "maxmin" => Ok(Self::MaxMin),
            "fairbottleneck" => Ok(Self::FairBottleneck),
            "bmf" => Ok(Self::Bmf),
            "Reno" => Ok(Self::Lagrange(Protocol::Reno)),
            "Reno2" => Ok(Self::Lagrange(Protocol::Reno2)),
            "Vegas" => Ok(Self::Lagrange(Protocol::Vegas)),
            other => Err(SolverError::UnknownSolver(other.to_string())),
        }
    }
}

impl fmt::Display for SolverAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxMin => write!(f, "maxmin"),
            Self::FairBottleneck => write!(f, "fairbottleneck"),
            Self::Lagrange(protocol) => write!(f, "{protocol}"),
            Self::Bmf => write!(f, "bmf"),
        }
    }
}

// ── Graph entities ────────────────────────────────────────────────────────────

/// Reference from a constraint's element list into a variable's elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ElementRef {
    var: VariableId,
    idx: usize,
}

/// Weighted edge between a [`Constraint`] and a [`Variable`].
#[derive(Debug, Clone)]
pub struct Element {
    constraint: ConstraintId,
    consumption_weight: f64,
    max_consumption_weight: f64,
    /// Listed in the constraint's enabled set (otherwise in the disabled set).
    enabled: bool,
    /// Still competing for the constraint during the current solve.
    active: bool,
}

impl Element {
    pub fn constraint(&self) -> ConstraintId {
        self.constraint
    }

    pub fn consumption_weight(&self) -> f64 {
        self.consumption_weight
    }

    /// Largest weight ever folded into this element by
    /// [`System::expand_add`].
    pub fn max_consumption_weight(&self) -> f64 {
        self.max_consumption_weight
    }

    /// Contribution of this element to its constraint's concurrency.
    ///
    /// Elements lighter than one unit (cross-traffic) are not counted.
    fn concurrency(&self) -> usize {
        usize::from(self.consumption_weight >= 1.0)
    }
}

/// A capacity-limited resource.
#[derive(Debug)]
pub struct Constraint {
    bound: Option<f64>,
    sharing_policy: SharingPolicy,
    enabled: Vec<ElementRef>,
    disabled: Vec<ElementRef>,

    concurrency_limit: Option<usize>,
    concurrency_current: usize,
    concurrency_maximum: usize,

    // solver scratch
    remaining: f64,
    usage: f64,
    active_count: usize,
    light: Option<usize>,
    lambda: f64,
    new_lambda: f64,

    in_active_set: bool,
    modified: bool,
    rank: u64,
}

impl Constraint {
    fn new(bound: Option<f64>, concurrency_limit: Option<usize>, rank: u64) -> Self {
        Self {
            bound,
            sharing_policy: SharingPolicy::Shared,
            enabled: Vec::new(),
            disabled: Vec::new(),
            concurrency_limit,
            concurrency_current: 0,
            concurrency_maximum: 0,
            remaining: 0.0,
            usage: 0.0,
            active_count: 0,
            light: None,
            lambda: 0.0,
            new_lambda: 0.0,
            in_active_set: false,
            modified: false,
            rank,
        }
    }

    pub fn bound(&self) -> Option<f64> {
        self.bound
    }

    pub fn sharing_policy(&self) -> SharingPolicy {
        self.sharing_policy
    }

    fn concurrency_slack(&self) -> usize {
        match self.concurrency_limit {
            Some(limit) => limit.saturating_sub(self.concurrency_current),
            None => usize::MAX,
        }
    }
}

/// A demand: the rate of one activity.
#[derive(Debug)]
pub struct Variable {
    penalty: f64,
    staged_penalty: f64,
    bound: Option<f64>,
    value: f64,
    concurrency_share: usize,
    owner: Option<ActionId>,
    elements: Vec<Element>,

    // solver scratch
    visited: u32,
    saturated: bool,
    mu: f64,
    new_mu: f64,
    rank: u64,
}

impl Variable {
    /// Sharing penalty: the inverse of the variable's share.  `0` = disabled.
    pub fn penalty(&self) -> f64 {
        self.penalty
    }

    pub fn staged_penalty(&self) -> f64 {
        self.staged_penalty
    }

    pub fn bound(&self) -> Option<f64> {
        self.bound
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn owner(&self) -> Option<ActionId> {
        self.owner
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    /// `true` when no element carries a positive weight.
    pub fn is_unconstrained(&self) -> bool {
        self.elements.iter().all(|e| e.consumption_weight <= 0.0)
    }

    fn min_concurrency_slack(&self, constraints: &SlotMap<ConstraintId, Constraint>) -> usize {
        self.elements
            .iter()
            .map(|e| constraints[e.constraint].concurrency_slack())
            .min()
            .unwrap_or(usize::MAX)
    }
}

fn unlink(list: &mut Vec<ElementRef>, r: ElementRef) {
    if let Some(pos) = list.iter().position(|x| *x == r) {
        list.remove(pos);
    }
}

fn normalize_bound(bound: Option<f64>) -> Option<f64> {
    bound.filter(|b| *b >= 0.0)
}

// ── System ────────────────────────────────────────────────────────────────────

/// The fair-sharing system: constraints, variables and the solver driving
/// them.
///
/// A `System` is single-threaded and owned by exactly one resource model.
#[derive(Debug)]
pub struct System {
    algorithm: SolverAlgorithm,
    selective_update: bool,
    config: SolverConfig,

    constraints: SlotMap<ConstraintId, Constraint>,
    variables: SlotMap<VariableId, Variable>,

    /// Insertion-ordered views used for deterministic iteration.
    constraint_order: Vec<ConstraintId>,
    variable_order: Vec<VariableId>,

    active_constraints: Vec<ConstraintId>,
    modified_constraints: Vec<ConstraintId>,
    modified_actions: Vec<ActionId>,

    modified: bool,
    visited_counter: u32,
    next_rank: u64,
}

impl System {
    /// Build an empty system running `algorithm`.
    pub fn build(algorithm: SolverAlgorithm, selective_update: bool, config: SolverConfig) -> Self {
        debug!(
            algorithm = %algorithm,
            selective_update,
            precision = config.maxmin_precision,
            "building sharing system"
        );
        Self {
            algorithm,
            selective_update,
            config,
            constraints: SlotMap::with_key(),
            variables: SlotMap::with_key(),
            constraint_order: Vec::new(),
            variable_order: Vec::new(),
            active_constraints: Vec::new(),
            modified_constraints: Vec::new(),
            modified_actions: Vec::new(),
            modified: false,
            visited_counter: 1,
            next_rank: 0,
        }
    }

    /// Build a system from a configuration solver name.
    ///
    /// # Errors
    /// [`SolverError::UnknownSolver`] for an unrecognised name and
    /// [`SolverError::InvalidPrecision`] for a bad `config`.
    pub fn from_name(
        name: &str,
        selective_update: bool,
        config: SolverConfig,
    ) -> Result<Self, SolverError> {
        config.validate()?;
        let algorithm = name.parse::<SolverAlgorithm>()?;
        Ok(Self::build(algorithm, selective_update, config))
    }

    pub fn algorithm(&self) -> SolverAlgorithm {
        self.algorithm
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn selective_update(&self) -> bool {
        self.selective_update
    }

    /// `true` when a mutation happened since the last solve.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    fn take_rank(&mut self) -> u64 {
        self.next_rank += 1;
        self.next_rank
    }

    // ── Constraints ───────────────────────────────────────────────────────────

    /// Create a SHARED constraint of capacity `bound` (`None` = unbounded).
    pub fn constraint_new(&mut self, bound: Option<f64>) -> ConstraintId {
        let rank = self.take_rank();
        let cnst = Constraint::new(normalize_bound(bound), self.config.concurrency_limit, rank);
        let id = self.constraints.insert(cnst);
        self.constraint_order.push(id);
        trace!(rank, bound = ?bound, "constraint created");
        id
    }

    /// Destroy a constraint that no variable uses any more.
    ///
    /// # Panics
    /// If an element still references the constraint.
    pub fn constraint_free(&mut self, cnst: ConstraintId) {
        let c = &self.constraints[cnst];
        assert!(
            c.enabled.is_empty() && c.disabled.is_empty(),
            "cannot free constraint #{} while variables still use it",
            c.rank
        );
        self.make_constraint_inactive(cnst);
        self.constraints.remove(cnst);
        self.constraint_order.retain(|c| *c != cnst);
    }

    pub fn constraint(&self, cnst: ConstraintId) -> &Constraint {
        &self.constraints[cnst]
    }

    pub fn constraint_count(&self) -> usize {
        self.constraints.len()
    }

    /// Switch a constraint between SHARED and FATPIPE aggregation.
    pub fn set_sharing_policy(&mut self, cnst: ConstraintId, policy: SharingPolicy) {
        self.constraints[cnst].sharing_policy = policy;
        self.modified = true;
        self.update_modified_cnst_set(cnst);
    }

    /// Make the constraint FATPIPE.
    pub fn unshare(&mut self, cnst: ConstraintId) {
        self.set_sharing_policy(cnst, SharingPolicy::FatPipe);
    }

    pub fn get_constraint_bound(&self, cnst: ConstraintId) -> Option<f64> {
        self.constraints[cnst].bound
    }

    /// Change the capacity of a constraint; the next solve reflects it.
    pub fn update_constraint_bound(&mut self, cnst: ConstraintId, bound: Option<f64>) {
        self.modified = true;
        self.update_modified_cnst_set(cnst);
        self.constraints[cnst].bound = normalize_bound(bound);
    }

    /// `true` when at least one enabled variable uses the constraint.
    pub fn constraint_used(&self, cnst: ConstraintId) -> bool {
        !self.constraints[cnst].enabled.is_empty()
    }

    /// Amount of capacity consumed under the current solution.
    pub fn get_usage(&self, cnst: ConstraintId) -> f64 {
        let c = &self.constraints[cnst];
        let mut usage: f64 = 0.0;
        for r in &c.enabled {
            let var = &self.variables[r.var];
            let w = var.elements[r.idx].consumption_weight;
            if w <= 0.0 {
                continue;
            }
            match c.sharing_policy {
                SharingPolicy::Shared => usage += w * var.value,
                SharingPolicy::FatPipe => usage = usage.max(w * var.value),
            }
        }
        usage
    }

    /// Number of enabled variables consuming the constraint.
    pub fn get_variable_amount(&self, cnst: ConstraintId) -> usize {
        self.constraints[cnst]
            .enabled
            .iter()
            .filter(|r| self.variables[r.var].elements[r.idx].consumption_weight > 0.0)
            .count()
    }

    /// Variables attached to the constraint: enabled first, then disabled.
    pub fn constraint_variables(&self, cnst: ConstraintId) -> Vec<VariableId> {
        let c = &self.constraints[cnst];
        let mut seen = BTreeSet::new();
        c.enabled
            .iter()
            .chain(c.disabled.iter())
            .map(|r| r.var)
            .filter(|v| seen.insert(*v))
            .collect()
    }

    /// Set the concurrency limit of one constraint (`None` = unlimited).
    ///
    /// # Panics
    /// If the limit is below the number of variables currently enabled.
    pub fn set_concurrency_limit(&mut self, cnst: ConstraintId, limit: Option<usize>) {
        let c = &mut self.constraints[cnst];
        assert!(
            limit.map_or(true, |l| l >= c.concurrency_current),
            "concurrency limit {limit:?} below current concurrency {}",
            c.concurrency_current
        );
        c.concurrency_limit = limit;
    }

    pub fn get_concurrency_limit(&self, cnst: ConstraintId) -> Option<usize> {
        self.constraints[cnst].concurrency_limit
    }

    pub fn get_concurrency_current(&self, cnst: ConstraintId) -> usize {
        self.constraints[cnst].concurrency_current
    }

    /// Highest concurrency reached since the last reset.
    pub fn get_concurrency_maximum(&self, cnst: ConstraintId) -> usize {
        self.constraints[cnst].concurrency_maximum
    }

    pub fn reset_concurrency_maximum(&mut self, cnst: ConstraintId) {
        let c = &mut self.constraints[cnst];
        c.concurrency_maximum = c.concurrency_current;
    }

    /// Remaining room before the concurrency limit; `usize::MAX` if unlimited.
    pub fn get_concurrency_slack(&self, cnst: ConstraintId) -> usize {
        self.constraints[cnst].concurrency_slack()
    }

    // ── Variables ─────────────────────────────────────────────────────────────

    /// Create a variable owned by `owner`.
    ///
    /// `penalty` is the sharing penalty (`0` creates it disabled) and `bound`
    /// its maximum rate.  `constraint_hint` pre-sizes the element list.
    ///
    /// # Panics
    /// If `penalty` is negative.
    pub fn variable_new(
        &mut self,
        owner: Option<ActionId>,
        penalty: f64,
        bound: Option<f64>,
        constraint_hint: usize,
    ) -> VariableId {
        assert!(penalty >= 0.0, "variable penalty must not be negative ({penalty})");
        let rank = self.take_rank();
        let var = Variable {
            penalty,
            staged_penalty: 0.0,
            bound: normalize_bound(bound),
            value: 0.0,
            concurrency_share: 1,
            owner,
            elements: Vec::with_capacity(constraint_hint),
            visited: self.visited_counter.wrapping_sub(1),
            saturated: false,
            mu: 0.0,
            new_mu: 0.0,
            rank,
        };
        let id = self.variables.insert(var);
        self.variable_order.push(id);
        trace!(rank, penalty, bound = ?bound, "variable created");
        id
    }

    pub fn variable(&self, var: VariableId) -> &Variable {
        &self.variables[var]
    }

    pub fn variable_count(&self) -> usize {
        self.variables.len()
    }

    pub fn contains_variable(&self, var: VariableId) -> bool {
        self.variables.contains_key(var)
    }

    pub fn get_value(&self, var: VariableId) -> f64 {
        self.variables[var].value
    }

    pub fn get_bound(&self, var: VariableId) -> Option<f64> {
        self.variables[var].bound
    }

    pub fn get_penalty(&self, var: VariableId) -> f64 {
        self.variables[var].penalty
    }

    /// Constraints the variable is attached to, with their weights.
    pub fn variable_constraints(&self, var: VariableId) -> Vec<(ConstraintId, f64)> {
        self.variables[var]
            .elements
            .iter()
            .map(|e| (e.constraint, e.consumption_weight))
            .collect()
    }

    /// Number of concurrency units the variable takes on each constraint.
    pub fn set_concurrency_share(&mut self, var: VariableId, share: usize) {
        self.variables[var].concurrency_share = share;
    }

    /// Detach a variable from every constraint and destroy it.
    ///
    /// Staged variables waiting on the freed constraints get a chance to be
    /// enabled.
    pub fn variable_free(&mut self, var: VariableId) {
        self.modified = true;
        self.update_modified_cnst_set_from_variable(var);

        let enabled_var = self.variables[var].penalty > 0.0;
        let n = self.variables[var].elements.len();
        for idx in 0..n {
            if enabled_var {
                self.decrease_concurrency(var, idx);
            }
            let cnst = self.variables[var].elements[idx].constraint;
            let r = ElementRef { var, idx };
            let c = &mut self.constraints[cnst];
            unlink(&mut c.enabled, r);
            unlink(&mut c.disabled, r);
            if c.enabled.is_empty() && c.disabled.is_empty() {
                self.make_constraint_inactive(cnst);
            } else {
                self.on_disabled_var(cnst);
            }
        }
        self.variables.remove(var);
        self.variable_order.retain(|v| *v != var);
        self.check_concurrency();
    }

    /// Free every variable in the system.
    pub fn variable_free_all(&mut self) {
        for var in self.variable_order.clone() {
            self.variable_free(var);
        }
    }

    // ── Elements ──────────────────────────────────────────────────────────────

    /// Attach `var` to `cnst` with a new element of weight `consumption_weight`.
    ///
    /// If enabling the element would exceed the constraint's concurrency limit
    /// the variable is disabled and its penalty staged.
    pub fn expand(&mut self, cnst: ConstraintId, var: VariableId, consumption_weight: f64) {
        self.modified = true;

        // an element the variable already has on this constraint does not
        // need new room
        let share = self.variables[var].concurrency_share;
        let current_share: usize = if share > 1 {
            self.variables[var]
                .elements
                .iter()
                .filter(|e| e.constraint == cnst && e.enabled)
                .map(Element::concurrency)
                .sum()
        } else {
            0
        };

        let needed = if consumption_weight >= 1.0 {
            share.saturating_sub(current_share)
        } else {
            0
        };
        if self.variables[var].penalty > 0.0 && needed > self.constraints[cnst].concurrency_slack() {
            let penalty = self.variables[var].penalty;
            self.disable_var(var);
            for c in self.element_constraints(var) {
                self.on_disabled_var(c);
            }
            self.variables[var].staged_penalty = penalty;
            debug!(
                var = self.variables[var].rank,
                cnst = self.constraints[cnst].rank,
                "concurrency limit reached, variable staged"
            );
        }

        let enabled = self.variables[var].penalty > 0.0;
        let idx = self.variables[var].elements.len();
        self.variables[var].elements.push(Element {
            constraint: cnst,
            consumption_weight,
            max_consumption_weight: consumption_weight,
            enabled,
            active: false,
        });
        let r = ElementRef { var, idx };
        if enabled {
            self.constraints[cnst].enabled.push(r);
            self.increase_concurrency(var, idx);
        } else {
            self.constraints[cnst].disabled.push(r);
        }

        if !self.selective_update {
            self.make_constraint_active(cnst);
        } else if consumption_weight > 0.0 || enabled {
            self.make_constraint_active(cnst);
            self.update_modified_cnst_set(cnst);
            if let Some(first) = self.variables[var].elements.first().map(|e| e.constraint) {
                self.update_modified_cnst_set(first);
            }
        }
        self.check_concurrency();
    }

    /// Add `consumption_weight` to the element linking `var` and `cnst`,
    /// creating it if needed.  FATPIPE constraints keep the maximum instead of
    /// the sum.
    pub fn expand_add(&mut self, cnst: ConstraintId, var: VariableId, consumption_weight: f64) {
        self.modified = true;
        let Some(idx) = self.variables[var]
            .elements
            .iter()
            .position(|e| e.constraint == cnst)
        else {
            self.expand(cnst, var, consumption_weight);
            return;
        };

        let enabled = self.variables[var].penalty > 0.0;
        if enabled {
            self.decrease_concurrency(var, idx);
        }
        let policy = self.constraints[cnst].sharing_policy;
        let elem = &mut self.variables[var].elements[idx];
        match policy {
            SharingPolicy::Shared => elem.consumption_weight += consumption_weight,
            SharingPolicy::FatPipe => {
                elem.consumption_weight = elem.consumption_weight.max(consumption_weight)
            }
        }
        elem.max_consumption_weight = elem.max_consumption_weight.max(elem.consumption_weight);

        if enabled {
            let needed = self.variables[var].elements[idx].concurrency();
            if self.constraints[cnst].concurrency_slack() < needed {
                let penalty = self.variables[var].penalty;
                self.disable_var(var);
                for c in self.element_constraints(var) {
                    self.on_disabled_var(c);
                }
                self.variables[var].staged_penalty = penalty;
            } else {
                self.increase_concurrency(var, idx);
            }
        }
        self.update_modified_cnst_set(cnst);
        self.check_concurrency();
    }

    // ── Variable updates ──────────────────────────────────────────────────────

    /// Change the sharing penalty of a variable.
    ///
    /// Going to `0` disables the variable (its value drops to `0`); going from
    /// `0` to a positive penalty enables it, or stages it when a concurrency
    /// limit is in the way.
    ///
    /// # Panics
    /// If `penalty` is negative.
    pub fn update_variable_penalty(&mut self, var: VariableId, penalty: f64) {
        assert!(penalty >= 0.0, "variable penalty must not be negative ({penalty})");
        let current = self.variables[var].penalty;
        if penalty == current {
            if penalty <= 0.0 {
                self.variables[var].staged_penalty = 0.0;
            }
            return;
        }
        self.modified = true;

        let enabling = penalty > 0.0 && current <= 0.0;
        let disabling = penalty <= 0.0 && current > 0.0;

        if enabling {
            self.variables[var].staged_penalty = penalty;
            let v = &self.variables[var];
            if v.min_concurrency_slack(&self.constraints) < v.concurrency_share {
                debug!(var = v.rank, "not enough concurrency slack, penalty staged");
                return;
            }
            self.enable_var(var);
        } else if disabling {
            self.disable_var(var);
        } else {
            self.variables[var].penalty = penalty;
            self.update_modified_cnst_set_from_variable(var);
        }
        self.check_concurrency();
    }

    /// Alias of [`update_variable_penalty`](Self::update_variable_penalty)
    /// using the "weight" vocabulary.
    pub fn update_variable_weight(&mut self, var: VariableId, weight: f64) {
        self.update_variable_penalty(var, weight);
    }

    /// Change the maximum rate of a variable (`None` = unbounded).
    pub fn update_variable_bound(&mut self, var: VariableId, bound: Option<f64>) {
        self.modified = true;
        self.variables[var].bound = normalize_bound(bound);
        self.update_modified_cnst_set_from_variable(var);
    }

    fn element_constraints(&self, var: VariableId) -> Vec<ConstraintId> {
        self.variables[var].elements.iter().map(|e| e.constraint).collect()
    }

    fn enable_var(&mut self, var: VariableId) {
        let v = &mut self.variables[var];
        assert!(v.staged_penalty > 0.0, "staged penalty must be set before enabling");
        v.penalty = v.staged_penalty;
        v.staged_penalty = 0.0;

        let n = v.elements.len();
        for idx in 0..n {
            self.set_element_enabled(var, idx, true);
            self.increase_concurrency(var, idx);
        }
        // after the move, so the closure reaches through this variable
        self.update_modified_cnst_set_from_variable(var);
        self.check_concurrency();
    }

    fn disable_var(&mut self, var: VariableId) {
        assert!(
            self.variables[var].staged_penalty == 0.0,
            "staged penalty must be cleared before disabling"
        );
        // before the move, so the closure still reaches through this variable
        self.update_modified_cnst_set_from_variable(var);

        let n = self.variables[var].elements.len();
        for idx in 0..n {
            self.set_element_enabled(var, idx, false);
            self.decrease_concurrency(var, idx);
        }
        let v = &mut self.variables[var];
        v.penalty = 0.0;
        v.staged_penalty = 0.0;
        v.value = 0.0;
        self.check_concurrency();
    }

    /// Give staged variables of `cnst` a chance to start after a variable
    /// left it.
    fn on_disabled_var(&mut self, cnst: ConstraintId) {
        let Some(limit) = self.constraints[cnst].concurrency_limit else {
            return;
        };
        let staged: Vec<VariableId> = self.constraints[cnst].disabled.iter().map(|r| r.var).collect();
        for var in staged {
            let v = &self.variables[var];
            if v.staged_penalty > 0.0
                && v.min_concurrency_slack(&self.constraints) >= v.concurrency_share
            {
                debug!(var = v.rank, "enabling staged variable");
                self.enable_var(var);
            }
            let current = self.constraints[cnst].concurrency_current;
            assert!(current <= limit, "concurrency overflow on constraint");
            if current == limit {
                break;
            }
        }
    }

    fn set_element_enabled(&mut self, var: VariableId, idx: usize, enabled: bool) {
        let elem = &mut self.variables[var].elements[idx];
        if elem.enabled == enabled {
            return;
        }
        elem.enabled = enabled;
        if !enabled {
            elem.active = false;
        }
        let c = &mut self.constraints[elem.constraint];
        let r = ElementRef { var, idx };
        if enabled {
            unlink(&mut c.disabled, r);
            c.enabled.push(r);
        } else {
            unlink(&mut c.enabled, r);
            c.disabled.push(r);
        }
    }

    fn increase_concurrency(&mut self, var: VariableId, idx: usize) {
        let elem = &self.variables[var].elements[idx];
        let c = &mut self.constraints[elem.constraint];
        c.concurrency_current += elem.concurrency();
        c.concurrency_maximum = c.concurrency_maximum.max(c.concurrency_current);
        assert!(
            c.concurrency_limit.map_or(true, |l| c.concurrency_current <= l),
            "concurrency limit overflow on constraint #{}",
            c.rank
        );
    }

    fn decrease_concurrency(&mut self, var: VariableId, idx: usize) {
        let elem = &self.variables[var].elements[idx];
        let c = &mut self.constraints[elem.constraint];
        let n = elem.concurrency();
        assert!(
            c.concurrency_current >= n,
            "concurrency underflow on constraint #{}",
            c.rank
        );
        c.concurrency_current -= n;
    }

    // ── Active / modified sets ────────────────────────────────────────────────

    fn make_constraint_active(&mut self, cnst: ConstraintId) {
        let c = &mut self.constraints[cnst];
        if !c.in_active_set {
            c.in_active_set = true;
            self.active_constraints.push(cnst);
        }
    }

    fn make_constraint_inactive(&mut self, cnst: ConstraintId) {
        let c = &mut self.constraints[cnst];
        if c.in_active_set {
            c.in_active_set = false;
            self.active_constraints.retain(|x| *x != cnst);
        }
        if c.modified {
            c.modified = false;
            self.modified_constraints.retain(|x| *x != cnst);
        }
    }

    fn update_modified_cnst_set_from_variable(&mut self, var: VariableId) {
        if !self.selective_update {
            return;
        }
        if let Some(first) = self.variables[var].elements.first().map(|e| e.constraint) {
            self.update_modified_cnst_set(first);
        }
    }

    /// Mark `cnst` and every constraint reachable from it through enabled
    /// variables as modified.
    fn update_modified_cnst_set(&mut self, cnst: ConstraintId) {
        if !self.selective_update || self.constraints[cnst].modified {
            return;
        }
        self.constraints[cnst].modified = true;
        self.modified_constraints.push(cnst);

        let mut stack = vec![cnst];
        while let Some(c) = stack.pop() {
            let vars: Vec<VariableId> = self.constraints[c].enabled.iter().map(|r| r.var).collect();
            for var in vars {
                if self.variables[var].visited == self.visited_counter {
                    continue;
                }
                self.variables[var].visited = self.visited_counter;
                for other in self.element_constraints(var) {
                    let oc = &mut self.constraints[other];
                    if !oc.modified {
                        oc.modified = true;
                        self.modified_constraints.push(other);
                        stack.push(other);
                    }
                }
            }
        }
    }

    fn remove_all_modified_cnst_set(&mut self) {
        // bumping the counter un-flags every variable at once
        self.visited_counter = self.visited_counter.wrapping_add(1);
        if self.visited_counter == 1 {
            for var in self.variables.values_mut() {
                var.visited = 0;
            }
        }
        for cnst in self.modified_constraints.drain(..) {
            if let Some(c) = self.constraints.get_mut(cnst) {
                c.modified = false;
            }
        }
    }

    /// Owners of the variables whose value may have changed in the last
    /// solve.  Only filled when selective update is enabled.
    pub fn take_modified_actions(&mut self) -> Vec<ActionId> {
        std::mem::take(&mut self.modified_actions)
    }

    // ── Solve ─────────────────────────────────────────────────────────────────

    /// Recompute the value of every variable affected since the last solve.
    ///
    /// Returns immediately when nothing changed.
    pub fn solve(&mut self) {
        if !self.modified {
            return;
        }
        let cnst_list = if self.selective_update {
            self.modified_constraints.clone()
        } else {
            self.active_constraints.clone()
        };
        trace!(
            algorithm = %self.algorithm,
            constraints = cnst_list.len(),
            "solving"
        );

        match self.algorithm {
            SolverAlgorithm::MaxMin => self.maxmin_solve(&cnst_list),
            SolverAlgorithm::FairBottleneck => self.bottleneck_solve(),
            SolverAlgorithm::Lagrange(protocol) => self.lagrange_solve(&protocol),
            SolverAlgorithm::Bmf => self.bmf_solve(&cnst_list),
        }

        if self.selective_update {
            self.collect_modified_actions(&cnst_list);
            self.remove_all_modified_cnst_set();
        }
        self.modified = false;
        let violations = self.validate_solution();
        debug_assert!(
            violations == 0 || self.algorithm != SolverAlgorithm::MaxMin,
            "max-min solution escapes its bounds"
        );

        if tracing::enabled!(Level::TRACE) {
            self.print();
        }
        self.check_concurrency();
    }

    fn collect_modified_actions(&mut self, cnst_list: &[ConstraintId]) {
        let mut seen: BTreeSet<ActionId> = self.modified_actions.iter().copied().collect();
        for &cnst in cnst_list {
            let Some(c) = self.constraints.get(cnst) else {
                continue;
            };
            for r in &c.enabled {
                let var = &self.variables[r.var];
                if var.elements[r.idx].consumption_weight <= 0.0 {
                    continue;
                }
                if let Some(owner) = var.owner {
                    if seen.insert(owner) {
                        self.modified_actions.push(owner);
                    }
                }
            }
        }
    }

    /// Warn about, and clamp, values escaping their bounds by more than the
    /// solver precision.  Returns the number of violations found.
    fn validate_solution(&mut self) -> usize {
        let precision = self.config.maxmin_precision;
        let mut violations = 0;
        for var in self.variables.values_mut() {
            if let Some(bound) = var.bound {
                if double_positive(var.value - bound, bound.max(1.0) * precision) {
                    warn!(var = var.rank, value = var.value, bound, "variable exceeds its bound");
                    var.value = bound;
                    violations += 1;
                }
            }
        }
        for &cnst in &self.active_constraints {
            let Some(bound) = self.constraints[cnst].bound else {
                continue;
            };
            let usage = self.get_usage(cnst);
            if double_positive(usage - bound, bound * precision) {
                warn!(
                    cnst = self.constraints[cnst].rank,
                    usage, bound, "constraint is over-used"
                );
                violations += 1;
            }
        }
        violations
    }

    /// Dump the system at trace level.
    pub fn print(&self) {
        trace!("MAX-MIN ( {} )", self.algorithm);
        for &cnst in &self.active_constraints {
            let c = &self.constraints[cnst];
            let terms: Vec<String> = c
                .enabled
                .iter()
                .map(|r| {
                    let v = &self.variables[r.var];
                    format!(
                        "{}.'{}'({})",
                        v.elements[r.idx].consumption_weight, v.rank, v.value
                    )
                })
                .collect();
            let op = match c.sharing_policy {
                SharingPolicy::Shared => " + ",
                SharingPolicy::FatPipe => " , ",
            };
            trace!(
                "\t{} <= {:?} ('{}') [usage {}]",
                terms.join(op),
                c.bound,
                c.rank,
                self.get_usage(cnst)
            );
        }
        for &var in &self.variable_order {
            let v = &self.variables[var];
            trace!(
                "\t'{}'({}) : {} (bound {:?})",
                v.rank,
                v.penalty,
                v.value,
                v.bound
            );
        }
    }

    /// Verify element bookkeeping.  Only runs at trace level.
    fn check_concurrency(&self) {
        if !tracing::enabled!(Level::TRACE) {
            return;
        }
        for &cnst in &self.constraint_order {
            let c = &self.constraints[cnst];
            let mut concurrency = 0;
            for r in &c.enabled {
                let v = &self.variables[r.var];
                assert!(v.penalty > 0.0, "enabled element of a disabled variable");
                concurrency += v.elements[r.idx].concurrency();
            }
            for r in &c.disabled {
                assert!(
                    self.variables[r.var].penalty <= 0.0,
                    "disabled element of an enabled variable"
                );
            }
            assert!(
                c.concurrency_limit.map_or(true, |l| l >= concurrency),
                "concurrency check failed"
            );
            assert_eq!(
                concurrency, c.concurrency_current,
                "concurrency bookkeeping is broken"
            );
        }
        for &var in &self.variable_order {
            let v = &self.variables[var];
            let expected = v.penalty > 0.0;
            assert!(
                v.elements.iter().all(|e| e.enabled == expected),
                "elements of one variable in different sets"
            );
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn maxmin(selective: bool) -> System {
        System::build(SolverAlgorithm::MaxMin, selective, SolverConfig::default())
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    // ── Construction ──────────────────────────────────────────────────────────

    #[test]
    fn solver_names_parse() {
        assert_eq!("maxmin".parse::<SolverAlgorithm>(), Ok(SolverAlgorithm::MaxMin));
        assert_eq!(
            "fairbottleneck".parse::<SolverAlgorithm>(),
            Ok(SolverAlgorithm::FairBottleneck)
        );
        assert_eq!(
            "Vegas".parse::<SolverAlgorithm>(),
            Ok(SolverAlgorithm::Lagrange(Protocol::Vegas))
        );
        assert_eq!("bmf".parse::<SolverAlgorithm>(), Ok(SolverAlgorithm::Bmf));
        assert_eq!(SolverAlgorithm::Bmf.to_string(), "bmf");
        assert_eq!(
            "bogus".parse::<SolverAlgorithm>(),
            Err(SolverError::UnknownSolver("bogus".into()))
        );
    }

    #[test]
    fn from_name_rejects_bad_precision() {
        let config = SolverConfig {
            maxmin_precision: 0.0,
            ..SolverConfig::default()
        };
        let err = System::from_name("maxmin", false, config).unwrap_err();
        assert!(matches!(err, SolverError::InvalidPrecision { name: "maxmin", .. }));

        let config = SolverConfig {
            bmf_max_iterations: 0,
            ..SolverConfig::default()
        };
        let err = System::from_name("bmf", false, config).unwrap_err();
        assert_eq!(err, SolverError::InvalidIterations);
    }

    // ── Usage and bookkeeping ─────────────────────────────────────────────────

    #[test]
    fn usage_and_variable_amount_follow_solution() {
        let mut sys = maxmin(false);
        let c = sys.constraint_new(Some(10.0));
        let a = sys.variable_new(None, 1.0, None, 1);
        let b = sys.variable_new(None, 1.0, None, 1);
        sys.expand(c, a, 1.0);
        sys.expand(c, b, 1.0);
        sys.solve();

        assert!(sys.constraint_used(c));
        assert_eq!(sys.get_variable_amount(c), 2);
        assert!(close(sys.get_usage(c), 10.0));
        assert_eq!(sys.constraint_variables(c), vec![a, b]);
    }

    #[test]
    fn solve_without_modification_is_a_noop() {
        let mut sys = maxmin(false);
        let c = sys.constraint_new(Some(4.0));
        let a = sys.variable_new(None, 1.0, None, 1);
        sys.expand(c, a, 1.0);
        sys.solve();
        assert!(!sys.is_modified());
        let before = sys.get_value(a);
        sys.solve();
        assert_eq!(sys.get_value(a), before);
    }

    #[test]
    fn free_releases_constraint() {
        let mut sys = maxmin(false);
        let c = sys.constraint_new(Some(4.0));
        let a = sys.variable_new(None, 1.0, None, 1);
        sys.expand(c, a, 1.0);
        sys.variable_free(a);
        assert!(!sys.constraint_used(c));
        assert!(!sys.contains_variable(a));
        sys.constraint_free(c);
        assert_eq!(sys.constraint_count(), 0);
    }

    #[test]
    #[should_panic]
    fn negative_penalty_panics() {
        let mut sys = maxmin(false);
        sys.variable_new(None, -1.0, None, 1);
    }

    // ── Enable / disable ──────────────────────────────────────────────────────

    #[test]
    fn disable_then_enable_restores_solution() {
        let mut sys = maxmin(true);
        let c = sys.constraint_new(Some(9.0));
        let a = sys.variable_new(None, 1.0, None, 1);
        let b = sys.variable_new(None, 2.0, None, 1);
        sys.expand(c, a, 1.0);
        sys.expand(c, b, 1.0);
        sys.solve();
        let (va, vb) = (sys.get_value(a), sys.get_value(b));

        sys.update_variable_penalty(b, 0.0);
        sys.solve();
        assert_eq!(sys.get_value(b), 0.0);
        assert!(close(sys.get_value(a), 9.0));

        sys.update_variable_penalty(b, 2.0);
        sys.solve();
        assert!(close(sys.get_value(a), va));
        assert!(close(sys.get_value(b), vb));
    }

    #[test]
    fn expand_add_sums_shared_and_maxes_fatpipe() {
        let mut sys = maxmin(false);
        let shared = sys.constraint_new(Some(10.0));
        let fat = sys.constraint_new(Some(10.0));
        sys.unshare(fat);
        let v = sys.variable_new(None, 1.0, None, 2);
        sys.expand(shared, v, 1.0);
        sys.expand_add(shared, v, 0.5);
        sys.expand(fat, v, 1.0);
        sys.expand_add(fat, v, 0.5);

        let weights = sys.variable_constraints(v);
        assert_eq!(weights, vec![(shared, 1.5), (fat, 1.0)]);
    }

    // ── Concurrency limit ─────────────────────────────────────────────────────

    #[test]
    fn concurrency_limit_stages_and_releases() {
        let mut sys = maxmin(true);
        let c = sys.constraint_new(Some(10.0));
        sys.set_concurrency_limit(c, Some(1));
        let a = sys.variable_new(None, 1.0, None, 1);
        let b = sys.variable_new(None, 1.0, None, 1);
        sys.expand(c, a, 1.0);
        sys.expand(c, b, 1.0);

        assert_eq!(sys.get_concurrency_current(c), 1);
        assert_eq!(sys.get_penalty(b), 0.0);
        assert_eq!(sys.variable(b).staged_penalty(), 1.0);
        assert_eq!(sys.get_concurrency_slack(c), 0);

        sys.solve();
        assert!(close(sys.get_value(a), 10.0));
        assert_eq!(sys.get_value(b), 0.0);

        sys.variable_free(a);
        assert_eq!(sys.get_penalty(b), 1.0);
        sys.solve();
        assert!(close(sys.get_value(b), 10.0));
        assert_eq!(sys.get_concurrency_maximum(c), 1);
    }

    #[test]
    fn light_elements_do_not_count_towards_concurrency() {
        let mut sys = maxmin(false);
        let c = sys.constraint_new(Some(10.0));
        sys.set_concurrency_limit(c, Some(1));
        let a = sys.variable_new(None, 1.0, None, 1);
        let b = sys.variable_new(None, 1.0, None, 1);
        sys.expand(c, a, 1.0);
        sys.expand(c, b, 0.05);
        assert_eq!(sys.get_concurrency_current(c), 1);
        assert_eq!(sys.get_penalty(b), 1.0);
    }

    // ── Selective update ──────────────────────────────────────────────────────

    #[test]
    fn selective_update_reports_modified_owners() {
        use slotmap::SlotMap;
        let mut owners: SlotMap<ActionId, ()> = SlotMap::with_key();
        let (o1, o2) = (owners.insert(()), owners.insert(()));

        let mut sys = maxmin(true);
        let c1 = sys.constraint_new(Some(10.0));
        let c2 = sys.constraint_new(Some(10.0));
        let a = sys.variable_new(Some(o1), 1.0, None, 1);
        let b = sys.variable_new(Some(o2), 1.0, None, 1);
        sys.expand(c1, a, 1.0);
        sys.expand(c2, b, 1.0);
        sys.solve();
        let mut first = sys.take_modified_actions();
        first.sort();
        let mut expected = vec![o1, o2];
        expected.sort();
        assert_eq!(first, expected);

        // only c1 changes: only its owner is reported
        sys.update_constraint_bound(c1, Some(5.0));
        sys.solve();
        assert_eq!(sys.take_modified_actions(), vec![o1]);
        assert!(close(sys.get_value(a), 5.0));
        assert!(close(sys.get_value(b), 10.0));
    }
}
