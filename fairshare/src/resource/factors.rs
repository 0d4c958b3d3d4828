/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Size-dependent correction factors for network transfers.
//!
//! A [`FactorCurve`] maps a message size to a multiplicative factor.  It is
//! written either as a constant (`"0.97"`) or as a piecewise table
//! `"threshold:factor;threshold:factor;..."`.  A size takes the factor of
//! the largest threshold it reaches; below every threshold the factor is 1.
//!
//! ```text
//! "65472:0.94;15424:0.69;0:0.81"
//!   size ≥ 65472           → 0.94
//!   15424 ≤ size < 65472   → 0.69
//!   0 ≤ size < 15424       → 0.81
//! ```

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use super::ModelError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawFactor")]
pub struct FactorCurve {
    /// `(threshold, factor)`, thresholds in decreasing order.
    steps: Vec<(f64, f64)>,
}

impl FactorCurve {
    pub fn constant(factor: f64) -> Self {
        Self {
            steps: vec![(f64::NEG_INFINITY, factor)],
        }
    }

    pub fn factor(&self, size: f64) -> f64 {
        self.steps
            .iter()
            .find(|(threshold, _)| size >= *threshold)
            .map_or(1.0, |(_, factor)| *factor)
    }

    pub fn is_constant(&self) -> bool {
        self.steps.len() == 1 && self.steps[0].0 == f64::NEG_INFINITY
    }
}

impl Default for FactorCurve {
    fn default() -> Self {
        Self::constant(1.0)
    }
}

impl FromStr for FactorCurve {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ModelError::InvalidFactor(s.to_string());
        let s = s.trim();
        if !s.contains(':') {
            let factor: f64 = s.parse().map_err(|_| invalid())?;
            if !factor.is_finite() {
                return Err(invalid());
            }
            return Ok(Self::constant(factor));
        }

        let mut steps = Vec::new();
        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (threshold, factor) = part.split_once(':').ok_or_else(invalid)?;
            let threshold: f64 = threshold.trim().parse().map_err(|_| invalid())?;
            let factor: f64 = factor.trim().parse().map_err(|_| invalid())?;
            if !threshold.is_finite() || !factor.is_finite() {
                return Err(invalid());
            }
            steps.push((threshold, factor));
        }
        if steps.is_empty() {
            return Err(invalid());
        }
        steps.sort_by(|a, b| b.0.total_cmp(&a.0));
        Ok(Self { steps })
    }
}

impl fmt::Display for FactorCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_constant() {
            return write!(f, "{}", self.steps[0].1);
        }
        for (i, (threshold, factor)) in self.steps.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{threshold}:{factor}")?;
        }
        Ok(())
    }
}

/// YAML accepts both `latency_factor: 13.01` and `latency_factor: "13.01"`.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawFactor {
    Number(f64),
    Text(String),
}

impl TryFrom<RawFactor> for FactorCurve {
    type Error = ModelError;

    fn try_from(raw: RawFactor) -> Result<Self, Self::Error> {
        match raw {
            RawFactor::Number(v) if v.is_finite() => Ok(Self::constant(v)),
            RawFactor::Number(v) => Err(ModelError::InvalidFactor(v.to_string())),
            RawFactor::Text(s) => s.parse(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
