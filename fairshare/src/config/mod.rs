/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Simulation configuration loading.
//!
//! Every key is optional; a missing key takes the default shown below.
//!
//! ```yaml
//! precision: 0.00001          # relative precision of the sharing solvers
//! timing_precision: 1.0e-9    # precision on dates and remaining amounts
//! concurrency_limit: ~        # per-constraint limit, unlimited by default
//! bmf_max_iterations: 1000    # allocation rounds of the bmf solver
//! cpu:
//!   solver: maxmin
//!   optim: Lazy
//! network:
//!   solver: maxmin            # or Reno, Reno2, Vegas
//!   optim: Lazy
//!   tcp_gamma: 4194304
//!   crosstraffic: true
//!   weight_s: 20537
//!   latency_factor: "13.01"
//!   bandwidth_factor: "0.97"  # or "65472:0.94;15424:0.69;0:0.81"
//!   loopback_bandwidth: 10.0e9
//!   loopback_latency: 0
//! disk:
//!   solver: maxmin
//!   optim: Full
//! host:                       # parallel tasks
//!   solver: fairbottleneck    # or bmf
//! sio:                        # streaming I/O
//!   solver: fairbottleneck    # or bmf
//! ```
//!
//! `selective_update` may be set per family; it defaults to `true` for the
//! lazy update and `false` otherwise.

pub mod scenario;

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::lmm::{SolverAlgorithm, SolverConfig, SolverError};
use crate::lmm::{DEFAULT_BMF_MAX_ITERATIONS, DEFAULT_MAXMIN_PRECISION, DEFAULT_TIMING_PRECISION};
use crate::models::NetworkParams;
use crate::resource::{FactorCurve, ModelOptions, UpdateAlgorithm};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{family}: invalid solver '{solver}'")]
    InvalidSolver {
        family: &'static str,
        solver: String,
    },

    #[error("{0}: the lazy update needs selective update")]
    LazyWithoutSelectiveUpdate(&'static str),

    #[error("{0}: the maxmin solver cannot share parallel work, use fairbottleneck or bmf")]
    MaxMinNotSupported(&'static str),

    #[error("invalid network parameter {name}: {value}")]
    InvalidNetworkParameter { name: &'static str, value: f64 },

    #[error(transparent)]
    Solver(#[from] SolverError),
}

// ── YAML types ────────────────────────────────────────────────────────────────

fn default_precision() -> f64 {
    DEFAULT_MAXMIN_PRECISION
}

fn default_timing_precision() -> f64 {
    DEFAULT_TIMING_PRECISION
}

fn default_bmf_max_iterations() -> usize {
    DEFAULT_BMF_MAX_ITERATIONS
}

fn default_maxmin() -> String {
    "maxmin".to_string()
}

fn default_fairbottleneck() -> String {
    "fairbottleneck".to_string()
}

/// Solver and update algorithm of a resource family.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FamilyConfig {
    #[serde(default = "default_maxmin")]
    pub solver: String,
    /// Family default when absent: lazy for cpu and network, full for disk.
    #[serde(default)]
    pub optim: Option<UpdateAlgorithm>,
    #[serde(default)]
    pub selective_update: Option<bool>,
}

impl Default for FamilyConfig {
    fn default() -> Self {
        Self {
            solver: default_maxmin(),
            optim: None,
            selective_update: None,
        }
    }
}

/// Parallel-task and streaming-I/O families: solver only.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BottleneckConfig {
    #[serde(default = "default_fairbottleneck")]
    pub solver: String,
}

impl Default for BottleneckConfig {
    fn default() -> Self {
        Self {
            solver: default_fairbottleneck(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    #[serde(default = "default_maxmin")]
    pub solver: String,
    #[serde(default)]
    pub optim: Option<UpdateAlgorithm>,
    #[serde(default)]
    pub selective_update: Option<bool>,
    #[serde(default = "default_tcp_gamma")]
    pub tcp_gamma: f64,
    #[serde(default = "default_true")]
    pub crosstraffic: bool,
    #[serde(default = "default_weight_s")]
    pub weight_s: f64,
    #[serde(default = "default_latency_factor")]
    pub latency_factor: FactorCurve,
    #[serde(default = "default_bandwidth_factor")]
    pub bandwidth_factor: FactorCurve,
    #[serde(default = "default_loopback_bandwidth")]
    pub loopback_bandwidth: f64,
    #[serde(default)]
    pub loopback_latency: f64,
}

fn default_tcp_gamma() -> f64 {
    NetworkParams::default().tcp_gamma
}

fn default_true() -> bool {
    true
}

fn default_weight_s() -> f64 {
    NetworkParams::default().weight_s
}

fn default_latency_factor() -> FactorCurve {
    NetworkParams::default().latency_factor
}

fn default_bandwidth_factor() -> FactorCurve {
    NetworkParams::default().bandwidth_factor
}

fn default_loopback_bandwidth() -> f64 {
    NetworkParams::default().loopback_bandwidth
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let p = NetworkParams::default();
        Self {
            solver: default_maxmin(),
            optim: None,
            selective_update: None,
            tcp_gamma: p.tcp_gamma,
            crosstraffic: p.crosstraffic,
            weight_s: p.weight_s,
            latency_factor: p.latency_factor,
            bandwidth_factor: p.bandwidth_factor,
            loopback_bandwidth: p.loopback_bandwidth,
            loopback_latency: p.loopback_latency,
        }
    }
}

/// Whole simulation configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimConfig {
    #[serde(default = "default_precision")]
    pub precision: f64,
    #[serde(default = "default_timing_precision")]
    pub timing_precision: f64,
    #[serde(default)]
    pub concurrency_limit: Option<usize>,
    #[serde(default = "default_bmf_max_iterations")]
    pub bmf_max_iterations: usize,
    #[serde(default)]
    pub cpu: FamilyConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub disk: FamilyConfig,
    #[serde(default)]
    pub host: BottleneckConfig,
    #[serde(default)]
    pub sio: BottleneckConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            precision: DEFAULT_MAXMIN_PRECISION,
            timing_precision: DEFAULT_TIMING_PRECISION,
            concurrency_limit: None,
            bmf_max_iterations: DEFAULT_BMF_MAX_ITERATIONS,
            cpu: FamilyConfig::default(),
            network: NetworkConfig::default(),
            disk: FamilyConfig::default(),
            host: BottleneckConfig::default(),
            sio: BottleneckConfig::default(),
        }
    }
}

// ── Loading and conversion ────────────────────────────────────────────────────

impl SimConfig {
    /// Parse and validate `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is not valid YAML, or
    /// selects an invalid combination of options.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        info!("Loading simulation configuration from: {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot open configuration file: {}", path.display()))?;
        let config: SimConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        debug!(?config, "configuration loaded");
        Ok(config)
    }

    /// Check every family can be built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cpu_options()?;
        self.network_options()?;
        self.disk_options()?;
        self.host_options()?;
        self.sio_options()?;
        self.network_params()?;
        Ok(())
    }

    pub fn solver_config(&self) -> Result<SolverConfig, ConfigError> {
        let config = SolverConfig {
            maxmin_precision: self.precision,
            timing_precision: self.timing_precision,
            concurrency_limit: self.concurrency_limit,
            bmf_max_iterations: self.bmf_max_iterations,
        };
        config.validate()?;
        Ok(config)
    }

    fn family_options(
        &self,
        family: &'static str,
        solver: &str,
        optim: UpdateAlgorithm,
        selective_update: Option<bool>,
        allow_lagrange: bool,
    ) -> Result<ModelOptions, ConfigError> {
        let invalid = || ConfigError::InvalidSolver {
            family,
            solver: solver.to_string(),
        };
        let algorithm: SolverAlgorithm = solver.parse().map_err(|_| invalid())?;
        if matches!(algorithm, SolverAlgorithm::Lagrange(_)) && !allow_lagrange {
            return Err(invalid());
        }
        let selective_update = match (optim, selective_update) {
            (UpdateAlgorithm::Lazy, Some(false)) => {
                return Err(ConfigError::LazyWithoutSelectiveUpdate(family))
            }
            (_, Some(s)) => s,
            (UpdateAlgorithm::Lazy, None) => true,
            (UpdateAlgorithm::Full, None) => false,
        };
        Ok(ModelOptions {
            solver: algorithm,
            update: optim,
            selective_update,
            solver_config: self.solver_config()?,
        })
    }

    pub fn cpu_options(&self) -> Result<ModelOptions, ConfigError> {
        let c = &self.cpu;
        let optim = c.optim.unwrap_or(UpdateAlgorithm::Lazy);
        self.family_options("cpu", &c.solver, optim, c.selective_update, false)
    }

    pub fn network_options(&self) -> Result<ModelOptions, ConfigError> {
        let n = &self.network;
        let optim = n.optim.unwrap_or(UpdateAlgorithm::Lazy);
        self.family_options("network", &n.solver, optim, n.selective_update, true)
    }

    pub fn disk_options(&self) -> Result<ModelOptions, ConfigError> {
        let d = &self.disk;
        let optim = d.optim.unwrap_or(UpdateAlgorithm::Full);
        self.family_options("disk", &d.solver, optim, d.selective_update, false)
    }

    fn bottleneck_options(
        &self,
        family: &'static str,
        solver: &str,
    ) -> Result<ModelOptions, ConfigError> {
        let options = self.family_options(family, solver, UpdateAlgorithm::Full, None, true)?;
        if options.solver == SolverAlgorithm::MaxMin {
            return Err(ConfigError::MaxMinNotSupported(family));
        }
        Ok(options)
    }

    pub fn host_options(&self) -> Result<ModelOptions, ConfigError> {
        self.bottleneck_options("host", &self.host.solver)
    }

    pub fn sio_options(&self) -> Result<ModelOptions, ConfigError> {
        self.bottleneck_options("sio", &self.sio.solver)
    }

    pub fn network_params(&self) -> Result<NetworkParams, ConfigError> {
        let n = &self.network;
        for (name, value) in [
            ("tcp_gamma", n.tcp_gamma),
            ("weight_s", n.weight_s),
            ("loopback_bandwidth", n.loopback_bandwidth),
            ("loopback_latency", n.loopback_latency),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::InvalidNetworkParameter { name, value });
            }
        }
        Ok(NetworkParams {
            tcp_gamma: n.tcp_gamma,
            crosstraffic: n.crosstraffic,
            weight_s: n.weight_s,
            latency_factor: n.latency_factor.clone(),
            bandwidth_factor: n.bandwidth_factor.clone(),
            loopback_bandwidth: n.loopback_bandwidth,
            loopback_latency: n.loopback_latency,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lmm::Protocol;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Helper: write a YAML string to a temp file and return it.
    fn yaml_tempfile(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    // ── Defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn empty_file_gives_defaults() {
        let f = yaml_tempfile("{}\n");
        let cfg = SimConfig::load_from_file(f.path()).unwrap();
        assert_eq!(cfg, SimConfig::default());

        let cpu = cfg.cpu_options().unwrap();
        assert_eq!(cpu.solver, SolverAlgorithm::MaxMin);
        assert_eq!(cpu.update, UpdateAlgorithm::Lazy);
        assert!(cpu.selective_update);

        let disk = cfg.disk_options().unwrap();
        assert_eq!(disk.update, UpdateAlgorithm::Full);
        assert!(!disk.selective_update);

        assert_eq!(cfg.host_options().unwrap().solver, SolverAlgorithm::FairBottleneck);
        assert_eq!(cfg.sio_options().unwrap().solver, SolverAlgorithm::FairBottleneck);

        let params = cfg.network_params().unwrap();
        assert_eq!(params, NetworkParams::default());
        assert_eq!(params.latency_factor.factor(1.0), 13.01);
    }

    #[test]
    fn full_file_is_applied() {
        let yaml = r#"
precision: 0.001
timing_precision: 1.0e-6
concurrency_limit: 4
cpu:
  solver: fairbottleneck
  optim: Full
network:
  solver: Vegas
  optim: Full
  selective_update: true
  tcp_gamma: 65536
  crosstraffic: false
  weight_s: 0
  latency_factor: 1
  bandwidth_factor: "65472:0.94;15424:0.69;0:0.81"
  loopback_bandwidth: 1.0e9
  loopback_latency: 0.001
disk:
  optim: Lazy
host:
  solver: Reno
"#;
        let f = yaml_tempfile(yaml);
        let cfg = SimConfig::load_from_file(f.path()).unwrap();

        let solver = cfg.solver_config().unwrap();
        assert_eq!(solver.maxmin_precision, 0.001);
        assert_eq!(solver.timing_precision, 1.0e-6);
        assert_eq!(solver.concurrency_limit, Some(4));

        let cpu = cfg.cpu_options().unwrap();
        assert_eq!(cpu.solver, SolverAlgorithm::FairBottleneck);
        assert_eq!(cpu.update, UpdateAlgorithm::Full);

        let net = cfg.network_options().unwrap();
        assert_eq!(net.solver, SolverAlgorithm::Lagrange(Protocol::Vegas));
        assert!(net.selective_update);

        let params = cfg.network_params().unwrap();
        assert_eq!(params.tcp_gamma, 65536.0);
        assert!(!params.crosstraffic);
        assert_eq!(params.latency_factor.factor(10.0), 1.0);
        assert_eq!(params.bandwidth_factor.factor(20000.0), 0.69);
        assert_eq!(params.loopback_latency, 0.001);

        assert!(cfg.disk_options().unwrap().selective_update);
        assert_eq!(
            cfg.host_options().unwrap().solver,
            SolverAlgorithm::Lagrange(Protocol::Reno)
        );
    }

    // ── Rejections ────────────────────────────────────────────────────────────

    #[test]
    fn maxmin_is_rejected_for_parallel_tasks() {
        let cfg = SimConfig {
            host: BottleneckConfig {
                solver: "maxmin".into(),
            },
            ..SimConfig::default()
        };
        assert_eq!(cfg.host_options(), Err(ConfigError::MaxMinNotSupported("host")));

        let f = yaml_tempfile("sio:\n  solver: maxmin\n");
        let err = SimConfig::load_from_file(f.path()).unwrap_err();
        assert!(format!("{err:#}").contains("maxmin"));
    }

    #[test]
    fn bmf_is_accepted_for_parallel_tasks() {
        let f = yaml_tempfile("bmf_max_iterations: 50\nhost:\n  solver: bmf\nsio:\n  solver: bmf\n");
        let cfg = SimConfig::load_from_file(f.path()).unwrap();
        assert_eq!(cfg.host_options().unwrap().solver, SolverAlgorithm::Bmf);
        assert_eq!(cfg.sio_options().unwrap().solver, SolverAlgorithm::Bmf);
        assert_eq!(cfg.solver_config().unwrap().bmf_max_iterations, 50);

        let f = yaml_tempfile("bmf_max_iterations: 0\n");
        assert!(SimConfig::load_from_file(f.path()).is_err());
    }

    #[test]
    fn lazy_without_selective_update_is_rejected() {
        let f = yaml_tempfile("cpu:\n  optim: Lazy\n  selective_update: false\n");
        assert!(SimConfig::load_from_file(f.path()).is_err());

        let mut cfg = SimConfig::default();
        cfg.network.selective_update = Some(false);
        assert_eq!(
            cfg.network_options(),
            Err(ConfigError::LazyWithoutSelectiveUpdate("network"))
        );
    }

    #[test]
    fn lagrange_is_only_for_network_and_bottleneck_families() {
        let mut cfg = SimConfig::default();
        cfg.cpu.solver = "Reno".into();
        assert_eq!(
            cfg.cpu_options(),
            Err(ConfigError::InvalidSolver {
                family: "cpu",
                solver: "Reno".into()
            })
        );
    }

    #[test]
    fn unknown_solver_is_rejected() {
        let f = yaml_tempfile("disk:\n  solver: fastest\n");
        let err = SimConfig::load_from_file(f.path()).unwrap_err();
        assert!(format!("{err:#}").contains("fastest"));
    }

    #[test]
    fn non_positive_precision_is_rejected() {
        let cfg = SimConfig {
            precision: 0.0,
            ..SimConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Solver(SolverError::InvalidPrecision { name: "maxmin", .. }))
        ));
    }

    #[test]
    fn bad_factor_curve_fails_to_parse() {
        let f = yaml_tempfile("network:\n  latency_factor: \"10:abc\"\n");
        assert!(SimConfig::load_from_file(f.path()).is_err());
    }

    #[test]
    fn negative_network_parameter_is_rejected() {
        let mut cfg = SimConfig::default();
        cfg.network.tcp_gamma = -1.0;
        assert_eq!(
            cfg.network_params(),
            Err(ConfigError::InvalidNetworkParameter {
                name: "tcp_gamma",
                value: -1.0
            })
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let f = yaml_tempfile("cpu:\n  solvr: maxmin\n");
        assert!(SimConfig::load_from_file(f.path()).is_err());
    }

    #[test]
    fn missing_file_returns_error() {
        assert!(SimConfig::load_from_file(Path::new("/nonexistent/path/config.yaml")).is_err());
    }
}
