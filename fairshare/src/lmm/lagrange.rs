/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Lagrangian relaxation of the sharing problem.
//!
//! Instead of max-min fairness, each variable maximises a concave utility
//! `f(x)` given by a TCP [`ProtocolCurve`].  The dual problem is solved by
//! coordinate descent: `mu` (one per bounded variable) is updated in closed
//! form and `lambda` (one per constraint) by dichotomy on the partial
//! derivative of the dual objective.
//!
//! Consumption weights are ignored: every element is assumed to consume one
//! unit of its constraint per unit of rate, as flows do on links.

use std::fmt;

use tracing::{debug, trace, warn};

use super::math::double_positive;
use super::{ConstraintId, System, Variable, VariableId};

// ── Constants ─────────────────────────────────────────────────────────────────

const MAX_ITERATIONS: usize = 100;

/// Convergence threshold on the variable values.  Not configurable.
const EPSILON_MIN_ERROR: f64 = 1e-5;

const DICHOTOMY_MIN_ERROR: f64 = 1e-14;

const RENO_SCALING: f64 = 1.0;
const RENO2_SCALING: f64 = 1.0;
const VEGAS_SCALING: f64 = 1000.0;

// ── Protocol curves ───────────────────────────────────────────────────────────

/// Utility function of a flow, with its derivative and the inverse of the
/// derivative.  `x` is a rate for `f`/`fprime` and a price for
/// `fprime_inverse`.
pub trait ProtocolCurve {
    fn f(&self, var: &Variable, x: f64) -> f64;
    fn fprime(&self, var: &Variable, x: f64) -> f64;
    fn fprime_inverse(&self, var: &Variable, x: f64) -> f64;
}

/// Built-in TCP utility curves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Reno,
    Reno2,
    Vegas,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Reno => "Reno",
            Protocol::Reno2 => "Reno2",
            Protocol::Vegas => "Vegas",
        };
        f.write_str(name)
    }
}

impl ProtocolCurve for Protocol {
    fn f(&self, var: &Variable, x: f64) -> f64 {
        let w = var.penalty;
        assert!(w > 0.0, "protocol curve evaluated on a disabled variable");
        match self {
            Protocol::Reno => RENO_SCALING * 1.5f64.sqrt() / w * (1.5f64.sqrt() * w * x).atan(),
            Protocol::Reno2 => RENO2_SCALING * (1.0 / w) * ((x * w) / (2.0 * x * w + 3.0)).ln(),
            Protocol::Vegas => VEGAS_SCALING * w * x.ln(),
        }
    }

    fn fprime(&self, var: &Variable, x: f64) -> f64 {
        let w = var.penalty;
        match self {
            Protocol::Reno => RENO_SCALING * 3.0 / (3.0 * w * w * x * x + 2.0),
            Protocol::Reno2 => RENO2_SCALING * 3.0 / (w * x * (2.0 * w * x + 3.0)),
            Protocol::Vegas => VEGAS_SCALING * w / x,
        }
    }

    fn fprime_inverse(&self, var: &Variable, x: f64) -> f64 {
        let w = var.penalty;
        assert!(w > 0.0, "protocol curve evaluated on a disabled variable");
        // a free resource puts no limit on the demand
        if x <= 0.0 {
            return f64::INFINITY;
        }
        match self {
            Protocol::Reno => {
                let res = 1.0 / (w * w * (x / RENO_SCALING)) - 2.0 / (3.0 * w * w);
                if res <= 0.0 {
                    0.0
                } else {
                    res.sqrt()
                }
            }
            Protocol::Reno2 => {
                let tmp = x * w * w;
                let res = tmp * (9.0 * x + 24.0);
                if res <= 0.0 {
                    0.0
                } else {
                    RENO2_SCALING * (-3.0 * tmp + res.sqrt()) / (4.0 * tmp)
                }
            }
            Protocol::Vegas => w / (x / VEGAS_SCALING),
        }
    }
}

// ── Solver ────────────────────────────────────────────────────────────────────

impl System {
    fn lambda_sum(&self, var: &Variable) -> f64 {
        var.elements
            .iter()
            .map(|e| self.constraints[e.constraint].lambda)
            .sum()
    }

    fn new_value(&self, curve: &impl ProtocolCurve, v: VariableId) -> f64 {
        let var = &self.variables[v];
        let mut price = self.lambda_sum(var);
        if var.bound.is_some() {
            price += var.mu;
        }
        curve.fprime_inverse(var, price)
    }

    fn new_mu(&self, curve: &impl ProtocolCurve, v: VariableId) -> f64 {
        let var = &self.variables[v];
        let bound = var.bound.unwrap_or(0.0);
        (curve.fprime(var, bound) - self.lambda_sum(var)).max(0.0)
    }

    fn dual_objective(
        &self,
        curve: &impl ProtocolCurve,
        var_list: &[VariableId],
        cnst_list: &[ConstraintId],
    ) -> f64 {
        let mut obj = 0.0;
        for &v in var_list {
            let var = &self.variables[v];
            let mut sigma = self.lambda_sum(var);
            if var.bound.is_some() {
                sigma += var.mu;
            }
            let x = curve.fprime_inverse(var, sigma);
            obj += curve.f(var, x) - sigma * x;
            if let Some(bound) = var.bound {
                obj += var.mu * bound;
            }
        }
        for &c in cnst_list {
            let cnst = &self.constraints[c];
            obj += cnst.lambda * cnst.bound.unwrap_or(0.0);
        }
        obj
    }

    /// d(dual)/d(lambda) of `cnst`, evaluated with `lambda` substituted.
    fn partial_diff_lambda(&self, curve: &impl ProtocolCurve, lambda: f64, cnst: ConstraintId) -> f64 {
        let c = &self.constraints[cnst];
        let mut diff = 0.0;
        for r in &c.enabled {
            let var = &self.variables[r.var];
            if var.is_unconstrained() {
                continue;
            }
            let mut sigma = self.lambda_sum(var);
            if var.bound.is_some() {
                sigma += var.mu;
            }
            sigma = (sigma - c.lambda) + lambda;
            diff -= curve.fprime_inverse(var, sigma);
        }
        diff + c.bound.unwrap_or(0.0)
    }

    fn dichotomy(&self, curve: &impl ProtocolCurve, init: f64, cnst: ConstraintId) -> f64 {
        let (mut min, mut max) = if init.abs() < 1e-20 { (0.5, 0.5) } else { (init, init) };

        let diff_0 = self.partial_diff_lambda(curve, 1e-16, cnst);
        if diff_0 >= 0.0 {
            trace!(diff = diff_0, "dichotomy returns 0");
            return 0.0;
        }

        let mut min_diff = self.partial_diff_lambda(curve, min, cnst);
        let mut max_diff = self.partial_diff_lambda(curve, max, cnst);
        let mut overall_error = 1.0;

        while overall_error > DICHOTOMY_MIN_ERROR {
            if min_diff > 0.0 && max_diff > 0.0 {
                if min == max {
                    min /= 2.0;
                    min_diff = self.partial_diff_lambda(curve, min, cnst);
                } else {
                    max = min;
                    max_diff = min_diff;
                }
            } else if min_diff < 0.0 && max_diff < 0.0 {
                if min == max {
                    max *= 2.0;
                    max_diff = self.partial_diff_lambda(curve, max, cnst);
                } else {
                    min = max;
                    min_diff = max_diff;
                }
            } else if min_diff < 0.0 && max_diff > 0.0 {
                let middle = (max + min) / 2.0;
                if (min - middle).abs() < 1e-20 || (max - middle).abs() < 1e-20 {
                    warn!(
                        min,
                        max,
                        "cannot improve convergence, reaching the limits of f64"
                    );
                    break;
                }
                let middle_diff = self.partial_diff_lambda(curve, middle, cnst);
                if middle_diff < 0.0 {
                    min = middle;
                    overall_error = max_diff - middle_diff;
                    min_diff = middle_diff;
                } else if middle_diff > 0.0 {
                    max = middle;
                    overall_error = max_diff - middle_diff;
                    max_diff = middle_diff;
                } else {
                    overall_error = 0.0;
                }
            } else if min_diff.abs() < 1e-20 {
                max = min;
                overall_error = 0.0;
            } else if max_diff.abs() < 1e-20 {
                min = max;
                overall_error = 0.0;
            } else {
                // min_diff > 0 > max_diff cannot happen on a concave dual
                warn!(min_diff, max_diff, "dichotomy lost its bracket");
                break;
            }
        }
        (min + max) / 2.0
    }

    fn check_feasible(&self, var_list: &[VariableId], cnst_list: &[ConstraintId], report: bool) -> bool {
        let precision = self.config.maxmin_precision;
        for &c in cnst_list {
            let cnst = &self.constraints[c];
            let Some(bound) = cnst.bound else {
                continue;
            };
            let total: f64 = cnst.enabled.iter().map(|r| self.variables[r.var].value).sum();
            if double_positive(total - bound, precision) {
                if report {
                    warn!(cnst = cnst.rank, bound, total, "constraint is over-used");
                }
                return false;
            }
        }
        for &v in var_list {
            let var = &self.variables[v];
            if let Some(bound) = var.bound {
                if double_positive(var.value - bound, precision) {
                    if report {
                        warn!(var = var.rank, bound, value = var.value, "variable is too large");
                    }
                    return false;
                }
            }
        }
        true
    }

    pub(super) fn lagrange_solve(&mut self, curve: &impl ProtocolCurve) {
        let cnst_list: Vec<ConstraintId> = self
            .active_constraints
            .iter()
            .copied()
            .filter(|c| self.constraints[*c].bound.is_some())
            .collect();

        for &c in &self.active_constraints {
            let cnst = &mut self.constraints[c];
            let bounded = cnst.bound.is_some();
            cnst.lambda = if bounded { 1.0 } else { 0.0 };
            cnst.new_lambda = if bounded { 2.0 } else { 0.0 };
        }

        let mut var_list: Vec<VariableId> = Vec::new();
        for &v in &self.variable_order {
            let var = &mut self.variables[v];
            if var.penalty <= 0.0 || var.is_unconstrained() {
                var.value = 0.0;
                continue;
            }
            if var.bound.is_some() {
                var.mu = 1.0;
                var.new_mu = 2.0;
            } else {
                var.mu = -1.0;
            }
            var_list.push(v);
        }
        for &v in &var_list {
            let value = self.new_value(curve, v);
            self.variables[v].value = value;
        }

        let mut obj = self.dual_objective(curve, &var_list, &cnst_list);
        let mut overall_modification = 1.0;
        let mut iteration = 0;

        while overall_modification > EPSILON_MIN_ERROR && iteration < MAX_ITERATIONS {
            iteration += 1;

            for &v in &var_list {
                if self.variables[v].bound.is_none() {
                    continue;
                }
                let mu = self.new_mu(curve, v);
                let var = &mut self.variables[v];
                var.new_mu = mu;
                var.mu = mu;
                let new_obj = self.dual_objective(curve, &var_list, &cnst_list);
                if obj - new_obj < -EPSILON_MIN_ERROR {
                    debug!(obj, new_obj, "mu step increased the dual objective");
                }
                obj = new_obj;
            }

            for &c in &cnst_list {
                let lambda = self.dichotomy(curve, self.constraints[c].lambda, c);
                let cnst = &mut self.constraints[c];
                cnst.new_lambda = lambda;
                cnst.lambda = lambda;
                let new_obj = self.dual_objective(curve, &var_list, &cnst_list);
                if obj - new_obj < -EPSILON_MIN_ERROR {
                    debug!(obj, new_obj, "lambda step increased the dual objective");
                }
                obj = new_obj;
            }

            overall_modification = 0.0;
            for &v in &var_list {
                let value = self.new_value(curve, v);
                let var = &mut self.variables[v];
                overall_modification = f64::max(overall_modification, (var.value - value).abs());
                var.value = value;
            }

            if !self.check_feasible(&var_list, &cnst_list, false) {
                overall_modification = 1.0;
            }
            trace!(iteration, overall_modification, "lagrange iteration");
        }

        self.check_feasible(&var_list, &cnst_list, true);
        if overall_modification <= EPSILON_MIN_ERROR {
            debug!(iteration, "lagrange converged");
        } else {
            debug!(iteration, "lagrange reached the iteration limit");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
