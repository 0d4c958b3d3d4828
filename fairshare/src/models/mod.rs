/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Resource models.
//!
//! | Model | Resources | Action → variable | Default solver |
//! |---|---|---|---|
//! | [`CpuModel`] (Cas01) | hosts with pstates and cores | penalty `1/cores`, bound `cores × speed` | maxmin |
//! | [`NetworkModel`] (CM02) | links, WiFi links, loopback | one element per route link, latency first | maxmin |
//! | [`DiskModel`] (S19) | disks with read / write caps | disk + direction sub-constraint | maxmin |
//! | [`PtaskModel`] (L07) | hosts + links | one variable over every host and link | fairbottleneck |
//! | [`SioModel`] (S22) | disks + links | one variable over both disks and the route | fairbottleneck |

pub mod cpu;
pub mod disk;
pub mod network;
pub mod ptask;
pub mod sio;

pub use cpu::{Cpu, CpuModel};
pub use disk::{Disk, DiskModel, IoOp};
pub use network::{Link, LinkSharing, NetworkModel, NetworkParams};
pub use ptask::PtaskModel;
pub use sio::SioModel;

use crate::resource::ModelError;

/// Costs, speeds and bandwidths must be finite and non-negative.
pub(crate) fn check_amount(what: &'static str, value: f64) -> Result<f64, ModelError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(ModelError::InvalidAmount { what, value })
    }
}

/// A user rate of `None`, zero or below means "no limit".
pub(crate) fn user_rate(rate: Option<f64>) -> Option<f64> {
    rate.filter(|r| *r > 0.0)
}

/// `min` over optional upper limits; `None` is "no limit".
pub(crate) fn min_bound(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
