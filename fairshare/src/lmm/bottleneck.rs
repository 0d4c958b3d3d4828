/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Fair-bottleneck sharing: water-filling by equal increments.
//!
//! Every round splits each constraint's remaining capacity evenly among the
//! variables still growing on it, lets each variable grow by the smallest
//! share it is offered (or up to its bound), then charges the constraints.
//! A constraint that runs out freezes all of its variables.  Penalties are
//! ignored, which suits parallel tasks whose weights are amounts of work.

use tracing::trace;

use super::math::double_positive;
use super::{ConstraintId, SharingPolicy, System, VariableId};

impl System {
    pub(super) fn bottleneck_solve(&mut self) {
        let precision = self.config.maxmin_precision;

        let mut var_list: Vec<VariableId> = Vec::new();
        for &v in &self.variable_order {
            let var = &mut self.variables[v];
            var.value = 0.0;
            var.saturated = false;
            if var.penalty > 0.0 && !var.is_unconstrained() {
                var.saturated = true;
                var_list.push(v);
            }
        }

        let mut cnst_list: Vec<ConstraintId> = Vec::new();
        for &cnst in &self.active_constraints {
            let c = &mut self.constraints[cnst];
            c.remaining = c.bound.unwrap_or(f64::INFINITY);
            c.usage = 0.0;
            cnst_list.push(cnst);
        }

        let mut round = 0usize;
        while !var_list.is_empty() {
            round += 1;

            // per-variable share of every constraint
            cnst_list.retain(|&cnst| self.growing_count(cnst) > 0);
            for &cnst in &cnst_list {
                let nb = self.growing_count(cnst);
                let c = &mut self.constraints[cnst];
                c.usage = c.remaining / nb as f64;
            }

            // every growing variable takes its smallest offer
            let mut increments: Vec<(VariableId, f64)> = Vec::with_capacity(var_list.len());
            for &v in &var_list {
                let var = &self.variables[v];
                let mut inc = f64::INFINITY;
                for elem in &var.elements {
                    if elem.consumption_weight > 0.0 {
                        inc = inc.min(self.constraints[elem.constraint].usage / elem.consumption_weight);
                    }
                }
                if let Some(bound) = var.bound {
                    inc = inc.min((bound - var.value).max(0.0));
                }
                increments.push((v, inc));
            }

            let mut frozen: Vec<VariableId> = Vec::new();
            for &(v, inc) in &increments {
                let var = &mut self.variables[v];
                if inc.is_infinite() {
                    var.value = var.bound.unwrap_or(f64::INFINITY);
                    frozen.push(v);
                    continue;
                }
                var.value += inc;
                var.mu = inc;
                if var.bound.is_some_and(|b| var.value >= b) {
                    frozen.push(v);
                }
            }

            // charge the constraints with the increments of this round
            let mut exhausted: Vec<ConstraintId> = Vec::new();
            for &cnst in &cnst_list {
                let c = &self.constraints[cnst];
                let Some(bound) = c.bound else {
                    continue;
                };
                let mut charge: f64 = 0.0;
                for r in &c.enabled {
                    let var = &self.variables[r.var];
                    if !var.saturated {
                        continue;
                    }
                    let used = var.elements[r.idx].consumption_weight * var.mu;
                    match c.sharing_policy {
                        SharingPolicy::Shared => charge += used,
                        SharingPolicy::FatPipe => charge = charge.max(used),
                    }
                }
                let c = &mut self.constraints[cnst];
                c.remaining -= charge;
                if !double_positive(c.remaining, bound * precision) {
                    c.remaining = 0.0;
                    exhausted.push(cnst);
                }
            }
            for &cnst in &exhausted {
                for r in &self.constraints[cnst].enabled {
                    if self.variables[r.var].elements[r.idx].consumption_weight > 0.0 {
                        frozen.push(r.var);
                    }
                }
            }

            for v in frozen {
                self.variables[v].saturated = false;
            }
            for &v in &var_list {
                self.variables[v].mu = 0.0;
            }
            var_list.retain(|v| self.variables[*v].saturated);
            cnst_list.retain(|c| !exhausted.contains(c));
            trace!(round, growing = var_list.len(), "fair-bottleneck round");
        }
    }

    fn growing_count(&self, cnst: ConstraintId) -> usize {
        let c = &self.constraints[cnst];
        let nb = c
            .enabled
            .iter()
            .filter(|r| {
                let var = &self.variables[r.var];
                var.saturated && var.elements[r.idx].consumption_weight > 0.0
            })
            .count();
        if c.sharing_policy == SharingPolicy::FatPipe {
            nb.min(1)
        } else {
            nb
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use crate::lmm::{SolverAlgorithm, SolverConfig, System};

    fn bottleneck() -> System {
        System::build(SolverAlgorithm::FairBottleneck, true, SolverConfig::default())
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= 1e-6 * expected.abs().max(1.0),
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn equal_split_on_one_constraint() {
        let mut sys = bottleneck();
        let c = sys.constraint_new(Some(12.0));
        let vars: Vec<_> = (0..3).map(|_| sys.variable_new(None, 1.0, None, 1)).collect();
        for &v in &vars {
            sys.expand(c, v, 1.0);
        }
        sys.solve();
        for &v in &vars {
            assert_close(sys.get_value(v), 4.0);
        }
    }

    #[test]
    fn bounded_variable_releases_capacity() {
        let mut sys = bottleneck();
        let c = sys.constraint_new(Some(10.0));
        let a = sys.variable_new(None, 1.0, Some(1.0), 1);
        let b = sys.variable_new(None, 1.0, None, 1);
        sys.expand(c, a, 1.0);
        sys.expand(c, b, 1.0);
        sys.solve();
        assert_close(sys.get_value(a), 1.0);
        assert_close(sys.get_value(b), 9.0);
    }

    #[test]
    fn parallel_task_limited_by_busiest_resource() {
        // one task needs 100 units on c1 (cap 50) and 10 on c2 (cap 100)
        let mut sys = bottleneck();
        let c1 = sys.constraint_new(Some(50.0));
        let c2 = sys.constraint_new(Some(100.0));
        let v = sys.variable_new(None, 1.0, None, 2);
        sys.expand(c1, v, 100.0);
        sys.expand(c2, v, 10.0);
        sys.solve();
        assert_close(sys.get_value(v), 0.5);
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let mut sys = bottleneck();
        let c1 = sys.constraint_new(Some(10.0));
        let c2 = sys.constraint_new(Some(4.0));
        let f1 = sys.variable_new(None, 1.0, None, 1);
        let f2 = sys.variable_new(None, 1.0, None, 2);
        let f3 = sys.variable_new(None, 1.0, None, 1);
        sys.expand(c1, f1, 1.0);
        sys.expand(c1, f2, 1.0);
        sys.expand(c2, f2, 1.0);
        sys.expand(c2, f3, 1.0);
        sys.solve();
        assert!(sys.get_usage(c1) <= 10.0 + 1e-6);
        assert!(sys.get_usage(c2) <= 4.0 + 1e-6);
        assert_close(sys.get_value(f2), 2.0);
        assert_close(sys.get_value(f3), 2.0);
        assert_close(sys.get_value(f1), 8.0);
    }

    #[test]
    fn zero_work_variable_is_left_at_zero() {
        let mut sys = bottleneck();
        let c = sys.constraint_new(Some(10.0));
        let v = sys.variable_new(None, 1.0, None, 1);
        sys.expand(c, v, 0.0);
        sys.solve();
        assert_eq!(sys.get_value(v), 0.0);
    }
}
