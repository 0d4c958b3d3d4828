/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Structured error types for solver construction.
//!
//! Misuse of a live [`System`](super::System) (stale handles, negative
//! penalties, concurrency overflow) is a programming error and panics.  Only
//! the selection of a solver, which usually comes from a configuration file,
//! is reported as a recoverable error.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SolverError {
    /// The solver name is not one of the known sharing algorithms.
    #[error("unknown solver: '{0}' (valid: maxmin, fairbottleneck, bmf, Reno, Reno2, Vegas)")]
    UnknownSolver(String),

    /// Precisions must be strictly positive and finite.
    #[error("invalid {name} precision: {value} (must be > 0)")]
    InvalidPrecision { name: &'static str, value: f64 },

    #[error("bmf_max_iterations must be at least 1")]
    InvalidIterations,
}
