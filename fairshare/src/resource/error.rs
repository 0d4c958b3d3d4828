/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Structured error types for the resource models.
//!
//! These are the recoverable failures of model-level operations: naming a
//! resource that does not exist, asking for a route that was never declared,
//! or feeding a model a value it cannot represent.  Resource failures during
//! a run are *not* errors: they surface as [`ActionState::Failed`].
//!
//! [`ActionState::Failed`]: super::ActionState::Failed

use thiserror::Error;

use crate::lmm::SolverError;

#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("unknown host '{0}'")]
    UnknownHost(String),

    #[error("unknown link '{0}'")]
    UnknownLink(String),

    #[error("unknown disk '{0}'")]
    UnknownDisk(String),

    /// The handle does not designate a live resource of this model.
    #[error("{kind} handle is not registered in the {model} model")]
    StaleResource {
        kind: &'static str,
        model: &'static str,
    },

    /// The action was already destroyed with [`unref`](super::ModelCore::unref).
    #[error("action handle is not registered in the {model} model")]
    UnknownAction { model: &'static str },

    #[error("no route from '{src}' to '{dst}'")]
    NoRoute { src: String, dst: String },

    #[error("invalid core count {requested} (host '{host}' has {available})")]
    InvalidCoreCount {
        host: String,
        requested: usize,
        available: usize,
    },

    #[error("pstate {pstate} out of range (host '{host}' has {count})")]
    InvalidPstate {
        host: String,
        pstate: usize,
        count: usize,
    },

    /// Speeds, bandwidths and costs must be finite and non-negative.
    #[error("invalid {what}: {value}")]
    InvalidAmount { what: &'static str, value: f64 },

    #[error("invalid factor curve '{0}' (expected 'f' or 'size:f;size:f;...')")]
    InvalidFactor(String),

    #[error("host '{host}' has no rate on WiFi link '{link}'")]
    MissingWifiRate { host: String, link: String },

    /// The lazy update mode relies on the modified-action set, which only
    /// selective update maintains.
    #[error("the {0} model needs selective update for the lazy update mode")]
    LazyWithoutSelectiveUpdate(&'static str),

    #[error("solver '{solver}' is not supported by the {model} model")]
    UnsupportedSolver { model: &'static str, solver: String },

    /// Parallel-task matrices are `hosts × hosts`, row-major.
    #[error("communication matrix has {got} entries, expected {expected}")]
    InvalidMatrix { got: usize, expected: usize },

    #[error("the {model} model does not handle this event")]
    UnsupportedEvent { model: &'static str },

    #[error(transparent)]
    Solver(#[from] SolverError),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
