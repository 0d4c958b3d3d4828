/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Precision-aware floating point helpers.
//!
//! Every comparison the solvers and models make against a capacity, a
//! remaining amount or a date goes through these three functions so that the
//! same tolerance rule is applied everywhere.  The tolerance is always passed
//! in explicitly: solvers scale it by the constraint bound, models use the
//! timing precision.

/// Subtract `delta` from `value` and snap the result to exactly `0.0` when it
/// falls below `precision`.
///
/// Snapping prevents long runs of tiny residues (`1e-17` bytes left to send)
/// that would otherwise keep an activity alive forever.
pub fn double_update(value: &mut f64, delta: f64, precision: f64) {
    *value -= delta;
    if *value < precision {
        *value = 0.0;
    }
}

/// `true` when `value` is strictly greater than `precision`.
pub fn double_positive(value: f64, precision: f64) -> bool {
    value > precision
}

/// `true` when `a` and `b` differ by less than `precision`.
pub fn double_equals(a: f64, b: f64, precision: f64) -> bool {
    (a - b).abs() < precision
}

// ── Tests ─────────────────────────────────────────────────────────────────────
