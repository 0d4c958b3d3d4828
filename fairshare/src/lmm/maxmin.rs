/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Weighted max-min fairness by progressive filling.
//!
//! Each round finds the constraints with the smallest `remaining / usage`
//! ratio (the bottlenecks), fixes the variables crossing them, and subtracts
//! their consumption from every other constraint.  A variable whose own
//! bound is tighter than the bottleneck share is fixed at its bound first.
//!
//! Ties between equally saturated constraints are resolved by fixing all of
//! them in the same round, scanning the solve list in order.

use std::collections::{BTreeSet, VecDeque};

use slotmap::SlotMap;
use tracing::trace;

use super::math::{double_equals, double_positive, double_update};
use super::{Constraint, ConstraintId, SharingPolicy, System, VariableId};

/// A constraint that can still saturate in the current solve.
#[derive(Debug, Clone, Copy)]
struct Light {
    cnst: ConstraintId,
    remaining_over_usage: f64,
}

fn remove_light(light: &mut Vec<Light>, constraints: &mut SlotMap<ConstraintId, Constraint>, pos: usize) {
    light.swap_remove(pos);
    if let Some(moved) = light.get(pos) {
        constraints[moved.cnst].light = Some(pos);
    }
}

fn saturated_constraints_update(
    usage: f64,
    pos: usize,
    saturated: &mut Vec<usize>,
    min_usage: &mut f64,
) {
    if *min_usage < 0.0 || *min_usage > usage {
        *min_usage = usage;
        saturated.clear();
        saturated.push(pos);
    } else if *min_usage == usage {
        saturated.push(pos);
    }
}

impl System {
    fn saturated_variable_set_update(
        &mut self,
        light: &[Light],
        saturated_cnsts: &[usize],
        saturated_vars: &mut VecDeque<VariableId>,
    ) {
        for &pos in saturated_cnsts {
            let cnst = &self.constraints[light[pos].cnst];
            for r in &cnst.enabled {
                let var = &mut self.variables[r.var];
                let elem = &var.elements[r.idx];
                if elem.active && elem.consumption_weight > 0.0 && !var.saturated {
                    var.saturated = true;
                    saturated_vars.push_back(r.var);
                }
            }
        }
    }

    pub(super) fn maxmin_solve(&mut self, cnst_list: &[ConstraintId]) {
        let precision = self.config.maxmin_precision;

        for &cnst in cnst_list {
            for r in &self.constraints[cnst].enabled {
                self.variables[r.var].value = 0.0;
            }
        }

        let mut light: Vec<Light> = Vec::new();
        let mut saturated_cnsts: Vec<usize> = Vec::new();
        let mut min_usage = -1.0;
        let mut unbounded_users: Vec<VariableId> = Vec::new();

        for &cnst in cnst_list {
            let c = &mut self.constraints[cnst];
            c.light = None;
            c.usage = 0.0;
            c.active_count = 0;

            let Some(bound) = c.bound else {
                for r in &c.enabled {
                    let var = &mut self.variables[r.var];
                    var.elements[r.idx].active = false;
                    if var.elements[r.idx].consumption_weight > 0.0 {
                        unbounded_users.push(r.var);
                    }
                }
                continue;
            };
            c.remaining = bound;
            let positive = double_positive(c.remaining, bound * precision);

            let mut usage: f64 = 0.0;
            let mut active_count = 0;
            for r in &c.enabled {
                let var = &mut self.variables[r.var];
                let elem = &mut var.elements[r.idx];
                elem.active = positive && elem.consumption_weight > 0.0;
                if !elem.active {
                    continue;
                }
                let share = elem.consumption_weight / var.penalty;
                match c.sharing_policy {
                    SharingPolicy::Shared => usage += share,
                    SharingPolicy::FatPipe => usage = usage.max(share),
                }
                active_count += 1;
            }
            c.usage = usage;
            c.active_count = active_count;

            if positive && usage > 0.0 {
                let pos = light.len();
                c.light = Some(pos);
                let ratio = c.remaining / c.usage;
                light.push(Light {
                    cnst,
                    remaining_over_usage: ratio,
                });
                saturated_constraints_update(ratio, pos, &mut saturated_cnsts, &mut min_usage);
            }
        }

        let mut saturated_vars: VecDeque<VariableId> = VecDeque::new();
        self.saturated_variable_set_update(&light, &saturated_cnsts, &mut saturated_vars);

        let mut fixed: BTreeSet<VariableId> = BTreeSet::new();
        loop {
            // a variable bounded below the bottleneck share is fixed first
            let mut min_bound = -1.0;
            for &v in &saturated_vars {
                let var = &self.variables[v];
                if let Some(bound) = var.bound {
                    let weighted = bound * var.penalty;
                    if weighted < min_usage && (min_bound < 0.0 || weighted < min_bound) {
                        min_bound = weighted;
                    }
                }
            }

            while let Some(v) = saturated_vars.pop_front() {
                let var = &mut self.variables[v];
                var.saturated = false;
                let value = if min_bound < 0.0 {
                    Some(min_usage / var.penalty)
                } else {
                    var.bound
                        .filter(|b| double_equals(min_bound, b * var.penalty, precision))
                };
                let Some(value) = value else {
                    continue;
                };
                var.value = value;
                let penalty = var.penalty;
                fixed.insert(v);
                trace!(var = var.rank, value, "variable fixed");

                for idx in 0..self.variables[v].elements.len() {
                    let elem = &mut self.variables[v].elements[idx];
                    let was_active = elem.active;
                    elem.active = false;
                    let (cnst, w) = (elem.constraint, elem.consumption_weight);

                    let c = &mut self.constraints[cnst];
                    if was_active {
                        c.active_count = c.active_count.saturating_sub(1);
                    }
                    let Some(bound) = c.bound else {
                        continue;
                    };
                    match c.sharing_policy {
                        SharingPolicy::Shared => {
                            double_update(&mut c.remaining, w * value, bound * precision);
                            double_update(&mut c.usage, w / penalty, precision);
                        }
                        SharingPolicy::FatPipe => {
                            let mut usage: f64 = 0.0;
                            for r in &c.enabled {
                                let other = &self.variables[r.var];
                                let e = &other.elements[r.idx];
                                if e.active && e.consumption_weight > 0.0 {
                                    usage = usage.max(e.consumption_weight / other.penalty);
                                }
                            }
                            c.usage = usage;
                        }
                    }
                    let exhausted = !double_positive(c.usage, precision)
                        || !double_positive(c.remaining, bound * precision)
                        || c.active_count == 0;
                    if let Some(pos) = c.light {
                        if exhausted {
                            c.light = None;
                            remove_light(&mut light, &mut self.constraints, pos);
                        } else {
                            light[pos].remaining_over_usage = c.remaining / c.usage;
                        }
                    }
                }
            }

            // next bottleneck
            min_usage = -1.0;
            saturated_cnsts.clear();
            for (pos, l) in light.iter().enumerate() {
                saturated_constraints_update(
                    l.remaining_over_usage,
                    pos,
                    &mut saturated_cnsts,
                    &mut min_usage,
                );
            }
            self.saturated_variable_set_update(&light, &saturated_cnsts, &mut saturated_vars);

            if light.is_empty() {
                break;
            }
        }

        // variables that only cross unbounded constraints get their full request
        for v in unbounded_users {
            if fixed.contains(&v) {
                continue;
            }
            // a bounded constraint that never fixed the variable is exhausted
            let only_unbounded = self.variables[v]
                .elements
                .iter()
                .filter(|e| e.consumption_weight > 0.0)
                .all(|e| self.constraints[e.constraint].bound.is_none());
            let var = &mut self.variables[v];
            if only_unbounded && var.penalty > 0.0 {
                var.value = var.bound.unwrap_or(f64::INFINITY);
                fixed.insert(v);
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
