/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Bottleneck max fairness (BMF).
//!
//! Every variable (a *player*) picks the resource offering it the smallest
//! fair share, its bottleneck.  For a given allocation of players to
//! bottlenecks the rates solve a square linear system:
//!
//! | Resource kind | Rows |
//! |---|---|
//! | shared | `Σ A[r,i] ρ_i = C_r`, then `maxA[r,i] ρ_i = maxA[r,k] ρ_k` for each further player |
//! | FATPIPE | `A[r,i] ρ_i = C_r` for each player |
//! | own bound | `ρ_i = bound_i`, the capacity of shared resources reduced accordingly |
//!
//! The fair shares are then recomputed from the rates and players pick again,
//! until the allocation is stable.  An allocation seen twice means the
//! iteration cycles: the solver restarts from the next untried allocation.
//!
//! Unlike max-min, a variable crossing several resources is not held back
//! by the resources it does not bottleneck on, so parallel tasks get a
//! proportionally fairer share.  `maxA` carries the largest single element
//! scaled by the penalty, which keeps sub-flows of one variable from counting
//! as extra players.

use std::collections::{BTreeMap, BTreeSet};

use slotmap::SecondaryMap;
use tracing::{trace, warn};

use super::math::{double_positive, double_update};
use super::{ConstraintId, SharingPolicy, System, VariableId};

/// Players grouped by the resource they picked.  `None` holds the players
/// stopped by their own bound.
type Allocation = BTreeMap<Option<usize>, Vec<usize>>;

// ── Allocation enumeration ────────────────────────────────────────────────────

/// Walks every allocation mapping each player to one of the resources it
/// consumes, first resource first.
#[derive(Debug)]
struct AllocationGenerator {
    options: Vec<Vec<usize>>,
    cursor: Vec<usize>,
    started: bool,
    exhausted: bool,
}

impl AllocationGenerator {
    /// `a` is indexed `[resource][player]`.
    fn new(a: &[Vec<f64>], players: usize) -> Self {
        let options: Vec<Vec<usize>> = (0..players)
            .map(|p| (0..a.len()).filter(|&r| a[r][p] > 0.0).collect())
            .collect();
        let exhausted = options.iter().any(Vec::is_empty);
        Self {
            cursor: vec![0; players],
            options,
            started: false,
            exhausted,
        }
    }

    fn current(&self) -> Vec<usize> {
        self.cursor
            .iter()
            .zip(&self.options)
            .map(|(&i, options)| options[i])
            .collect()
    }
}

impl Iterator for AllocationGenerator {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if self.exhausted {
            return None;
        }
        if !self.started {
            self.started = true;
            return Some(self.current());
        }
        for p in 0..self.cursor.len() {
            self.cursor[p] += 1;
            if self.cursor[p] < self.options[p].len() {
                return Some(self.current());
            }
            self.cursor[p] = 0;
        }
        self.exhausted = true;
        None
    }
}

// ── Linear algebra ────────────────────────────────────────────────────────────

/// Solve `a · x = b` by Gaussian elimination with full pivoting.
///
/// A rank-deficient system gets its free unknowns set to `0`, which is the
/// solution BMF expects when bounded players leave empty columns.
fn solve_full_pivot(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Vec<f64> {
    let n = b.len();
    let mut columns: Vec<usize> = (0..n).collect();
    let mut rank = 0;
    let mut first_pivot = 0.0;

    for k in 0..n {
        let (mut pivot, mut pi, mut pj) = (0.0_f64, k, k);
        for (i, row) in a.iter().enumerate().skip(k) {
            for (j, &value) in row.iter().enumerate().skip(k) {
                if value.abs() > pivot {
                    (pivot, pi, pj) = (value.abs(), i, j);
                }
            }
        }
        if k == 0 {
            first_pivot = pivot;
        }
        if pivot == 0.0 || pivot <= first_pivot * n as f64 * f64::EPSILON {
            break;
        }

        a.swap(k, pi);
        b.swap(k, pi);
        for row in &mut a {
            row.swap(k, pj);
        }
        columns.swap(k, pj);

        let (pivot_row, pivot_rhs) = (a[k].clone(), b[k]);
        for i in k + 1..n {
            let factor = a[i][k] / pivot_row[k];
            if factor == 0.0 {
                continue;
            }
            for j in k..n {
                a[i][j] -= factor * pivot_row[j];
            }
            b[i] -= factor * pivot_rhs;
        }
        rank += 1;
    }

    let mut y = vec![0.0; n];
    for k in (0..rank).rev() {
        let tail: f64 = (k + 1..rank).map(|j| a[k][j] * y[j]).sum();
        y[k] = (b[k] - tail) / a[k][k];
    }
    let mut x = vec![0.0; n];
    for (k, &column) in columns.iter().enumerate() {
        x[column] = y[k];
    }
    x
}

// ── Solver ────────────────────────────────────────────────────────────────────

/// One BMF instance over dense matrices indexed `[resource][player]`.
#[derive(Debug)]
struct BmfSolver {
    a: Vec<Vec<f64>>,
    max_a: Vec<Vec<f64>>,
    capacity: Vec<f64>,
    shared: Vec<bool>,
    bounds: Vec<Option<f64>>,
    precision: f64,
    max_iterations: usize,
    generator: AllocationGenerator,
    tried: BTreeSet<Vec<Option<usize>>>,
}

impl BmfSolver {
    fn new(
        a: Vec<Vec<f64>>,
        max_a: Vec<Vec<f64>>,
        capacity: Vec<f64>,
        shared: Vec<bool>,
        bounds: Vec<Option<f64>>,
        precision: f64,
        max_iterations: usize,
    ) -> Self {
        let generator = AllocationGenerator::new(&a, bounds.len());
        Self {
            a,
            max_a,
            capacity,
            shared,
            bounds,
            precision,
            max_iterations,
            generator,
            tried: BTreeSet::new(),
        }
    }

    fn players(&self) -> usize {
        self.bounds.len()
    }

    fn resources(&self) -> usize {
        self.capacity.len()
    }

    fn tolerance(&self, magnitude: f64) -> f64 {
        self.precision * magnitude.abs().max(1.0)
    }

    /// Capacity of `r` left once the bounded players take their bound.
    fn resource_capacity(&self, r: usize, bounded: &[usize]) -> f64 {
        if !self.shared[r] {
            return self.capacity[r];
        }
        let taken: f64 = bounded
            .iter()
            .map(|&p| self.a[r][p] * self.bounds[p].unwrap_or(0.0))
            .sum();
        (self.capacity[r] - taken).max(0.0)
    }

    fn by_player(&self, alloc: &Allocation) -> Vec<Option<usize>> {
        let mut by_player = vec![None; self.players()];
        for (&resource, players) in alloc {
            for &p in players {
                by_player[p] = resource;
            }
        }
        by_player
    }

    /// Let every player pick its bottleneck under `fair_sharing`.
    ///
    /// Returns `None` when the allocation equals `last` or when every
    /// allocation has been tried.
    fn next_allocation(
        &mut self,
        fair_sharing: &[f64],
        last: &Allocation,
        initial: bool,
    ) -> Option<Allocation> {
        let mut alloc = Allocation::new();
        for p in 0..self.players() {
            let mut selected = None;
            let mut min_rate: Option<f64> = None;
            for r in 0..self.resources() {
                if self.a[r][p] <= 0.0 {
                    continue;
                }
                let rate = fair_sharing[r] / self.max_a[r][p];
                if min_rate.map_or(true, |min| double_positive(min - rate, self.tolerance(min))) {
                    selected = Some(r);
                    min_rate = Some(rate);
                }
            }
            if let (false, Some(bound), Some(rate)) = (initial, self.bounds[p], min_rate) {
                if double_positive(rate - bound, self.tolerance(rate)) {
                    selected = None;
                }
            }
            alloc.entry(selected).or_default().push(p);
        }

        if alloc == *last {
            return None;
        }
        let key = self.by_player(&alloc);
        if self.tried.insert(key) {
            return Some(alloc);
        }
        self.disturb()
    }

    /// Jump to the next allocation never tried since the last jump.
    fn disturb(&mut self) -> Option<Allocation> {
        while let Some(candidate) = self.generator.next() {
            let key: Vec<Option<usize>> = candidate.iter().copied().map(Some).collect();
            if self.tried.contains(&key) {
                continue;
            }
            trace!(allocation = ?candidate, "bmf allocation cycles, restarting");
            self.tried.clear();
            self.tried.insert(key);
            let mut alloc = Allocation::new();
            for (p, &r) in candidate.iter().enumerate() {
                alloc.entry(Some(r)).or_default().push(p);
            }
            return Some(alloc);
        }
        None
    }

    /// Rates of the players for a fixed allocation.
    fn equilibrium(&self, alloc: &Allocation) -> Vec<f64> {
        let n = self.players();
        let bounded: &[usize] = alloc.get(&None).map(Vec::as_slice).unwrap_or(&[]);
        let mut a_p = vec![vec![0.0; n]; n];
        let mut c_p = vec![0.0; n];

        // each unbounded player contributes exactly one row
        let mut row = 0;
        for (&resource, players) in alloc {
            let Some(r) = resource else {
                continue;
            };
            let capacity = self.resource_capacity(r, bounded);
            if self.shared[r] {
                a_p[row].copy_from_slice(&self.a[r]);
                c_p[row] = capacity;
                row += 1;
                if let Some((&i, others)) = players.split_first() {
                    for &k in others {
                        a_p[row][i] = self.max_a[r][i];
                        a_p[row][k] = -self.max_a[r][k];
                        row += 1;
                    }
                }
            } else {
                for &i in players {
                    a_p[row][i] = self.a[r][i];
                    c_p[row] = capacity;
                    row += 1;
                }
            }
        }

        for &p in bounded {
            for line in &mut a_p {
                line[p] = 0.0;
            }
        }
        let mut rho = solve_full_pivot(a_p, c_p);
        for &p in bounded {
            rho[p] = self.bounds[p].unwrap_or(0.0);
        }
        rho
    }

    fn set_fair_sharing(&self, alloc: &Allocation, rho: &[f64], fair_sharing: &mut [f64]) {
        for r in 0..self.resources() {
            // every player of an equilibrium gets the same share, any one will do
            if let Some(&p) = alloc.get(&Some(r)).and_then(|players| players.first()) {
                fair_sharing[r] = self.max_a[r][p] * rho[p];
                continue;
            }
            let mut overuse: f64 = self.a[r].iter().zip(rho).map(|(a, x)| a * x).sum();
            double_update(&mut overuse, self.capacity[r], self.precision);
            fair_sharing[r] = if overuse > 0.0 {
                let users = self.a[r]
                    .iter()
                    .filter(|&&a| double_positive(a, self.precision))
                    .count();
                self.capacity[r] / users.max(1) as f64
            } else {
                self.capacity[r]
            };
        }
    }

    /// `rho` respects every shared capacity, saturates some resource, and
    /// gives every player either its bound or the largest share of a
    /// saturated resource.
    fn is_bmf(&self, rho: &[f64]) -> bool {
        let mut any_saturated = false;
        let mut served = vec![false; self.players()];

        for r in 0..self.resources() {
            let remaining = if self.shared[r] {
                self.a[r].iter().zip(rho).map(|(a, x)| a * x).sum::<f64>() - self.capacity[r]
            } else {
                0.0
            };
            let tolerance = self.tolerance(self.capacity[r]);
            if double_positive(remaining, tolerance) {
                return false;
            }
            if remaining.abs() > tolerance {
                continue;
            }
            any_saturated = true;

            let usage: Vec<f64> = self.max_a[r].iter().zip(rho).map(|(m, x)| m * x).collect();
            let max_share = usage.iter().copied().fold(0.0, f64::max);
            for (p, &u) in usage.iter().enumerate() {
                if (u - max_share).abs() <= self.tolerance(max_share) {
                    served[p] = true;
                }
            }
        }

        for (p, bound) in self.bounds.iter().enumerate() {
            if let Some(bound) = *bound {
                if (rho[p] - bound).abs() <= self.tolerance(bound) {
                    served[p] = true;
                    any_saturated = true;
                }
            }
        }
        any_saturated && served.iter().all(|&s| s)
    }

    fn solve(&mut self) -> Vec<f64> {
        let mut fair_sharing = self.capacity.clone();
        let mut last = Allocation::new();
        let mut rho = vec![0.0; self.players()];

        let mut iteration = 0;
        while iteration < self.max_iterations {
            let Some(alloc) = self.next_allocation(&fair_sharing, &last, iteration == 0) else {
                break;
            };
            rho = self.equilibrium(&alloc);
            self.set_fair_sharing(&alloc, &rho, &mut fair_sharing);
            last = alloc;
            iteration += 1;
        }

        if !self.is_bmf(&rho) {
            warn!(
                iterations = iteration,
                players = self.players(),
                resources = self.resources(),
                rho = ?rho,
                "no bmf allocation found, raise bmf_max_iterations or lower the precision"
            );
        }
        trace!(iterations = iteration, "bmf solve done");
        rho
    }
}

// ── System glue ───────────────────────────────────────────────────────────────

impl System {
    pub(super) fn bmf_solve(&mut self, cnst_list: &[ConstraintId]) {
        let listed: BTreeSet<ConstraintId> = cnst_list.iter().copied().collect();

        // unbounded constraints never bottleneck and stay out of the matrices
        let mut index: SecondaryMap<ConstraintId, usize> = SecondaryMap::new();
        let mut capacity = Vec::new();
        let mut shared = Vec::new();
        for &cnst in cnst_list {
            let c = &self.constraints[cnst];
            let Some(bound) = c.bound else {
                continue;
            };
            index.insert(cnst, capacity.len());
            capacity.push(bound);
            shared.push(c.sharing_policy == SharingPolicy::Shared);
        }

        let resources = capacity.len();
        let mut a: Vec<Vec<f64>> = vec![Vec::new(); resources];
        let mut max_a: Vec<Vec<f64>> = vec![Vec::new(); resources];
        let mut bounds: Vec<Option<f64>> = Vec::new();
        let mut players: Vec<VariableId> = Vec::new();

        for &v in &self.variable_order {
            let var = &mut self.variables[v];
            if var.penalty <= 0.0 {
                continue;
            }
            let mut linked = false;
            let mut on_unbounded = false;
            let mut column = vec![0.0; resources];
            let mut max_column = vec![0.0_f64; resources];
            for elem in &var.elements {
                if !listed.contains(&elem.constraint) {
                    continue;
                }
                linked = true;
                if elem.consumption_weight <= 0.0 {
                    continue;
                }
                match index.get(elem.constraint) {
                    Some(&r) => {
                        column[r] += elem.consumption_weight;
                        max_column[r] =
                            max_column[r].max(elem.max_consumption_weight * var.penalty);
                    }
                    None => on_unbounded = true,
                }
            }
            if !linked {
                continue;
            }
            if column.iter().any(|&w| w > 0.0) {
                for r in 0..resources {
                    a[r].push(column[r]);
                    max_a[r].push(max_column[r]);
                }
                bounds.push(var.bound.filter(|b| *b > 0.0));
                players.push(v);
            } else if on_unbounded {
                var.value = var.bound.unwrap_or(f64::INFINITY);
            } else {
                // nothing to consume: any positive rate completes the work
                var.value = 1.0;
            }
        }

        if players.is_empty() {
            return;
        }
        let mut solver = BmfSolver::new(
            a,
            max_a,
            capacity,
            shared,
            bounds,
            self.config.maxmin_precision,
            self.config.bmf_max_iterations,
        );
        let rho = solver.solve();
        for (v, value) in players.into_iter().zip(rho) {
            self.variables[v].value = value.max(0.0);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
