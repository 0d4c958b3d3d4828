/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Scenario files: a platform, the activities to run on it and the resource
//! events to replay.
//!
//! ```yaml
//! hosts:
//!   - name: alice
//!     speed: [1.0e9, 5.0e8]       # per-core flop/s of every pstate
//!     cores: 2
//!     disks:
//!       - { name: ssd, read_bandwidth: 2.0e8, write_bandwidth: 1.0e8 }
//!   - name: bob
//!     speed: [1.0e9]
//! links:
//!   - { name: l1, bandwidth: 1.25e8, latency: 5.0e-5 }
//!   - { name: ap, sharing: wifi, rates: [5.4e7, 1.1e7], levels: { alice: 0 } }
//! routes:
//!   - { src: alice, dst: bob, links: [l1] }
//! activities:
//!   - { name: compute, kind: execute, host: alice, flops: 1.0e9 }
//!   - { name: send, kind: communicate, src: alice, dst: bob, bytes: 1.0e6, start: 0.5 }
//!   - { name: load, kind: read, disk: ssd, bytes: 4.0e8 }
//! events:
//!   - { at: 2.0, host: bob, speed: 0.5 }
//!   - { at: 3.0, link: l1, state: false }
//! ```
//!
//! Every host, link and disk is registered in each model that can use it,
//! so the same names work for plain activities, parallel tasks and streams.
//! WiFi links only exist in the network model.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use super::{ConfigError, SimConfig};
use crate::engine::{Engine, EngineError};
use crate::lmm::SharingPolicy;
use crate::models::{CpuModel, DiskModel, LinkSharing, NetworkModel, PtaskModel, SioModel};
use crate::resource::{
    ActionId, ActionState, DiskId, HostId, LinkId, Model, ModelError, ResourceEvent, ResourceRef,
};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("name '{0}' is declared twice")]
    DuplicateName(String),

    #[error("event #{index}: {reason}")]
    InvalidEvent { index: usize, reason: &'static str },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

// ── YAML types ────────────────────────────────────────────────────────────────

fn one() -> usize {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskSpec {
    pub name: String,
    pub read_bandwidth: f64,
    pub write_bandwidth: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostSpec {
    pub name: String,
    pub speed: Vec<f64>,
    #[serde(default = "one")]
    pub cores: usize,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharingSpec {
    #[default]
    Shared,
    #[serde(rename = "fatpipe")]
    FatPipe,
    Wifi,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkSpec {
    pub name: String,
    #[serde(default)]
    pub bandwidth: f64,
    #[serde(default)]
    pub latency: f64,
    #[serde(default)]
    pub sharing: SharingSpec,
    /// WiFi rate levels, in bytes per second.
    #[serde(default)]
    pub rates: Vec<f64>,
    /// WiFi rate level of every attached host.
    #[serde(default)]
    pub levels: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteSpec {
    pub src: String,
    pub dst: String,
    pub links: Vec<String>,
    #[serde(default = "default_true")]
    pub symmetric: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Activity {
    Execute {
        host: String,
        flops: f64,
        #[serde(default = "one")]
        cores: usize,
        #[serde(default)]
        bound: Option<f64>,
    },
    Sleep {
        host: String,
        #[serde(default)]
        duration: Option<f64>,
    },
    Communicate {
        src: String,
        dst: String,
        bytes: f64,
        #[serde(default)]
        rate: Option<f64>,
    },
    Read {
        disk: String,
        bytes: f64,
    },
    Write {
        disk: String,
        bytes: f64,
    },
    Parallel {
        hosts: Vec<String>,
        flops: Vec<f64>,
        #[serde(default)]
        bytes: Vec<f64>,
        #[serde(default)]
        rate: Option<f64>,
    },
    Stream {
        src: String,
        #[serde(default)]
        src_disk: Option<String>,
        dst: String,
        #[serde(default)]
        dst_disk: Option<String>,
        bytes: f64,
    },
}

impl Activity {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Execute { .. } => "execute",
            Self::Sleep { .. } => "sleep",
            Self::Communicate { .. } => "communicate",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::Parallel { .. } => "parallel",
            Self::Stream { .. } => "stream",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ActivitySpec {
    pub name: String,
    #[serde(default)]
    pub start: f64,
    #[serde(flatten)]
    pub activity: Activity,
}

/// One resource change.  Exactly one target and one change must be set.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventSpec {
    pub at: f64,
    pub host: Option<String>,
    pub link: Option<String>,
    pub disk: Option<String>,
    pub speed: Option<f64>,
    pub bandwidth: Option<f64>,
    pub latency: Option<f64>,
    pub read_bandwidth: Option<f64>,
    pub write_bandwidth: Option<f64>,
    pub state: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default)]
    pub hosts: Vec<HostSpec>,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
    #[serde(default)]
    pub activities: Vec<ActivitySpec>,
    #[serde(default)]
    pub events: Vec<EventSpec>,
}

impl Scenario {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        info!("Loading scenario from: {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot open scenario file: {}", path.display()))?;
        let scenario: Scenario = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML file: {}", path.display()))?;
        info!(
            hosts = scenario.hosts.len(),
            links = scenario.links.len(),
            activities = scenario.activities.len(),
            events = scenario.events.len(),
            "scenario loaded"
        );
        Ok(scenario)
    }
}

// ── Simulation ────────────────────────────────────────────────────────────────

const CPU: usize = 0;
const NETWORK: usize = 1;
const DISK: usize = 2;
const PTASK: usize = 3;
const SIO: usize = 4;

#[derive(Debug, Clone, Copy)]
struct HostIds {
    cpu: HostId,
    network: HostId,
    ptask: HostId,
    sio: HostId,
}

#[derive(Debug, Clone, Copy)]
struct LinkIds {
    network: LinkId,
    /// Wired links only.
    ptask: Option<LinkId>,
    sio: Option<LinkId>,
}

#[derive(Debug, Clone, Copy)]
struct DiskIds {
    disk: DiskId,
    sio: DiskId,
}

#[derive(Debug)]
struct Started {
    name: String,
    kind: &'static str,
    model: usize,
    action: ActionId,
}

/// Outcome of one activity.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityReport {
    pub name: String,
    pub kind: &'static str,
    pub state: ActionState,
    pub start: f64,
    pub finish: Option<f64>,
}

/// A scenario instantiated on the five models.
#[derive(Debug)]
pub struct Simulation {
    engine: Engine,
    cpu: CpuModel,
    network: NetworkModel,
    disk: DiskModel,
    ptask: PtaskModel,
    sio: SioModel,
    hosts: BTreeMap<String, HostIds>,
    links: BTreeMap<String, LinkIds>,
    disks: BTreeMap<String, DiskIds>,
    pending: Vec<ActivitySpec>,
    started: Vec<Started>,
}

impl Simulation {
    pub fn build(config: &SimConfig, scenario: &Scenario) -> Result<Self, ScenarioError> {
        let params = config.network_params()?;
        let tcp_gamma = params.tcp_gamma;
        let mut sim = Self {
            engine: Engine::new(),
            cpu: CpuModel::new(&config.cpu_options()?)?,
            network: NetworkModel::new(&config.network_options()?, params)?,
            disk: DiskModel::new(&config.disk_options()?)?,
            ptask: PtaskModel::new(&config.host_options()?, tcp_gamma)?,
            sio: SioModel::new(&config.sio_options()?, tcp_gamma)?,
            hosts: BTreeMap::new(),
            links: BTreeMap::new(),
            disks: BTreeMap::new(),
            pending: Vec::new(),
            started: Vec::new(),
        };

        for h in &scenario.hosts {
            sim.add_host(h)?;
        }
        for l in &scenario.links {
            sim.add_link(l)?;
        }
        for r in &scenario.routes {
            sim.add_route(r)?;
        }
        for (index, e) in scenario.events.iter().enumerate() {
            sim.schedule(index, e)?;
        }

        let mut pending = scenario.activities.clone();
        // stable: same-date activities start in file order
        pending.sort_by(|a, b| a.start.total_cmp(&b.start));
        sim.pending = pending;
        Ok(sim)
    }

    fn add_host(&mut self, h: &HostSpec) -> Result<(), ScenarioError> {
        if self.hosts.contains_key(&h.name) {
            return Err(ScenarioError::DuplicateName(h.name.clone()));
        }
        let ids = HostIds {
            cpu: self.cpu.add_host(h.name.as_str(), h.speed.clone(), h.cores)?,
            network: self.network.add_host(h.name.as_str()),
            ptask: self.ptask.add_host(h.name.as_str(), h.speed.clone(), h.cores)?,
            sio: self.sio.add_host(h.name.as_str()),
        };
        for d in &h.disks {
            if self.disks.contains_key(&d.name) {
                return Err(ScenarioError::DuplicateName(d.name.clone()));
            }
            let disk_ids = DiskIds {
                disk: self
                    .disk
                    .add_disk(d.name.as_str(), d.read_bandwidth, d.write_bandwidth)?,
                sio: self
                    .sio
                    .add_disk(ids.sio, d.name.as_str(), d.read_bandwidth, d.write_bandwidth)?,
            };
            self.disks.insert(d.name.clone(), disk_ids);
        }
        self.hosts.insert(h.name.clone(), ids);
        Ok(())
    }

    fn add_link(&mut self, l: &LinkSpec) -> Result<(), ScenarioError> {
        if self.links.contains_key(&l.name) {
            return Err(ScenarioError::DuplicateName(l.name.clone()));
        }
        let ids = match l.sharing {
            SharingSpec::Wifi => {
                let network = self
                    .network
                    .add_wifi_link(l.name.as_str(), l.rates.clone(), l.latency)?;
                for (host, level) in &l.levels {
                    let h = self.host(host)?;
                    self.network.set_host_rate(network, h.network, *level)?;
                }
                LinkIds {
                    network,
                    ptask: None,
                    sio: None,
                }
            }
            SharingSpec::Shared | SharingSpec::FatPipe => {
                let (sharing, policy) = if l.sharing == SharingSpec::FatPipe {
                    (LinkSharing::FatPipe, SharingPolicy::FatPipe)
                } else {
                    (LinkSharing::Shared, SharingPolicy::Shared)
                };
                LinkIds {
                    network: self
                        .network
                        .add_link(l.name.as_str(), l.bandwidth, l.latency, sharing)?,
                    ptask: Some(self.ptask.add_link(l.name.as_str(), l.bandwidth, l.latency, policy)?),
                    sio: Some(self.sio.add_link(l.name.as_str(), l.bandwidth, l.latency, policy)?),
                }
            }
        };
        self.links.insert(l.name.clone(), ids);
        Ok(())
    }

    fn add_route(&mut self, r: &RouteSpec) -> Result<(), ScenarioError> {
        let src = self.host(&r.src)?;
        let dst = self.host(&r.dst)?;
        let links = r
            .links
            .iter()
            .map(|name| self.link(name))
            .collect::<Result<Vec<_>, _>>()?;

        self.network.add_route(
            src.network,
            dst.network,
            links.iter().map(|l| l.network).collect(),
            r.symmetric,
        )?;
        let wired: Option<Vec<(LinkId, LinkId)>> =
            links.iter().map(|l| l.ptask.zip(l.sio)).collect();
        if let Some(wired) = wired {
            self.ptask.add_route(
                src.ptask,
                dst.ptask,
                wired.iter().map(|(p, _)| *p).collect(),
                r.symmetric,
            )?;
            self.sio.add_route(
                src.sio,
                dst.sio,
                wired.iter().map(|(_, s)| *s).collect(),
                r.symmetric,
            )?;
        } else {
            debug!(src = %r.src, dst = %r.dst, "route over WiFi: network model only");
        }
        Ok(())
    }

    fn host(&self, name: &str) -> Result<HostIds, ModelError> {
        self.hosts
            .get(name)
            .copied()
            .ok_or_else(|| ModelError::UnknownHost(name.to_string()))
    }

    fn link(&self, name: &str) -> Result<LinkIds, ModelError> {
        self.links
            .get(name)
            .copied()
            .ok_or_else(|| ModelError::UnknownLink(name.to_string()))
    }

    fn disk(&self, name: &str) -> Result<DiskIds, ModelError> {
        self.disks
            .get(name)
            .copied()
            .ok_or_else(|| ModelError::UnknownDisk(name.to_string()))
    }

    /// Turn one scenario event into engine events on every model holding
    /// the target.
    fn schedule(&mut self, index: usize, e: &EventSpec) -> Result<(), ScenarioError> {
        let invalid = |reason| ScenarioError::InvalidEvent { index, reason };
        let changes = [
            e.speed.map(ResourceEvent::Speed),
            e.bandwidth.map(ResourceEvent::Bandwidth),
            e.latency.map(ResourceEvent::Latency),
            e.read_bandwidth.map(ResourceEvent::ReadBandwidth),
            e.write_bandwidth.map(ResourceEvent::WriteBandwidth),
            e.state.map(ResourceEvent::State),
        ];
        let mut set = changes.into_iter().flatten();
        let (Some(change), None) = (set.next(), set.next()) else {
            return Err(invalid("exactly one change must be given"));
        };

        let targets: Vec<(usize, ResourceRef)> = match (&e.host, &e.link, &e.disk) {
            (Some(h), None, None) => {
                let ids = self.host(h)?;
                vec![(CPU, ResourceRef::Host(ids.cpu)), (PTASK, ResourceRef::Host(ids.ptask))]
            }
            (None, Some(l), None) => {
                let ids = self.link(l)?;
                let mut t = vec![(NETWORK, ResourceRef::Link(ids.network))];
                t.extend(ids.ptask.map(|p| (PTASK, ResourceRef::Link(p))));
                t.extend(ids.sio.map(|s| (SIO, ResourceRef::Link(s))));
                t
            }
            (None, None, Some(d)) => {
                let ids = self.disk(d)?;
                vec![(DISK, ResourceRef::Disk(ids.disk)), (SIO, ResourceRef::Disk(ids.sio))]
            }
            _ => return Err(invalid("exactly one of host, link or disk must be given")),
        };
        let applies = match change {
            ResourceEvent::Speed(_) => e.host.is_some(),
            ResourceEvent::Bandwidth(_) | ResourceEvent::Latency(_) => e.link.is_some(),
            ResourceEvent::ReadBandwidth(_) | ResourceEvent::WriteBandwidth(_) => e.disk.is_some(),
            ResourceEvent::State(_) => true,
        };
        if !applies {
            return Err(invalid("change does not apply to this kind of resource"));
        }
        for (model, target) in targets {
            self.engine.schedule_event(e.at, model, target, change)?;
        }
        Ok(())
    }

    fn start(&mut self, spec: &ActivitySpec) -> Result<Started, ScenarioError> {
        let (model, action) = match &spec.activity {
            Activity::Execute {
                host,
                flops,
                cores,
                bound,
            } => {
                let h = self.host(host)?;
                (CPU, self.cpu.execution_start(h.cpu, *flops, *cores, *bound)?)
            }
            Activity::Sleep { host, duration } => {
                let h = self.host(host)?;
                (CPU, self.cpu.sleep(h.cpu, *duration)?)
            }
            Activity::Communicate {
                src,
                dst,
                bytes,
                rate,
            } => {
                let (s, d) = (self.host(src)?, self.host(dst)?);
                (NETWORK, self.network.communicate(s.network, d.network, *bytes, *rate)?)
            }
            Activity::Read { disk, bytes } => {
                let d = self.disk(disk)?;
                (DISK, self.disk.read(d.disk, *bytes)?)
            }
            Activity::Write { disk, bytes } => {
                let d = self.disk(disk)?;
                (DISK, self.disk.write(d.disk, *bytes)?)
            }
            Activity::Parallel {
                hosts,
                flops,
                bytes,
                rate,
            } => {
                let ids = hosts
                    .iter()
                    .map(|h| self.host(h).map(|ids| ids.ptask))
                    .collect::<Result<Vec<_>, _>>()?;
                (PTASK, self.ptask.execute_parallel(&ids, flops, bytes, *rate)?)
            }
            Activity::Stream {
                src,
                src_disk,
                dst,
                dst_disk,
                bytes,
            } => {
                let (s, d) = (self.host(src)?, self.host(dst)?);
                let sd = src_disk.as_deref().map(|n| self.disk(n)).transpose()?;
                let dd = dst_disk.as_deref().map(|n| self.disk(n)).transpose()?;
                let action = self.sio.io_stream(
                    s.sio,
                    sd.map(|ids| ids.sio),
                    d.sio,
                    dd.map(|ids| ids.sio),
                    *bytes,
                )?;
                (SIO, action)
            }
        };
        info!(
            name = %spec.name,
            kind = spec.activity.kind(),
            date = self.engine.now(),
            "activity started"
        );
        Ok(Started {
            name: spec.name.clone(),
            kind: spec.activity.kind(),
            model,
            action,
        })
    }

    fn model(&self, index: usize) -> &dyn Model {
        match index {
            CPU => &self.cpu,
            NETWORK => &self.network,
            DISK => &self.disk,
            PTASK => &self.ptask,
            _ => &self.sio,
        }
    }

    pub fn now(&self) -> f64 {
        self.engine.now()
    }

    /// Run until every activity is over (or `max_date`), then report each
    /// started activity in start order.
    pub fn run(&mut self, max_date: Option<f64>) -> Result<Vec<ActivityReport>, ScenarioError> {
        loop {
            let now = self.engine.now();
            let due = self.pending.iter().take_while(|a| a.start <= now).count();
            for spec in self.pending.drain(..due).collect::<Vec<_>>() {
                let started = self.start(&spec)?;
                self.started.push(started);
            }

            let next_start = self.pending.first().map(|a| a.start);
            let limit = match (next_start, max_date) {
                (Some(s), Some(m)) => Some(s.min(m)),
                (s, m) => s.or(m),
            };

            let Self {
                engine,
                cpu,
                network,
                disk,
                ptask,
                sio,
                ..
            } = self;
            let mut models: [&mut dyn Model; 5] = [cpu, network, disk, ptask, sio];
            let step = engine.solve(&mut models, limit)?;
            for model in models.iter_mut() {
                for c in model.take_completed() {
                    debug!(model = model.name(), state = ?c.state, date = c.date, "action completed");
                }
            }

            let reached_max = max_date.is_some_and(|m| self.engine.now() >= m);
            if reached_max || (step.is_none() && self.pending.is_empty()) {
                break;
            }
        }
        info!(date = self.engine.now(), "simulation over");
        Ok(self.report())
    }

    fn report(&self) -> Vec<ActivityReport> {
        self.started
            .iter()
            .filter_map(|s| {
                let action = self.model(s.model).action(s.action)?;
                Some(ActivityReport {
                    name: s.name.clone(),
                    kind: s.kind,
                    state: action.state(),
                    start: action.start_time(),
                    finish: action.finish_time(),
                })
            })
            .collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Helper: write a YAML string to a temp file and return it.
    fn yaml_tempfile(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    /// Plain network parameters so that dates are easy to compute.
    fn config() -> SimConfig {
        let f = yaml_tempfile(
            r#"
network:
  crosstraffic: false
  weight_s: 0
  latency_factor: 1
  bandwidth_factor: 1
"#,
        );
        SimConfig::load_from_file(f.path()).unwrap()
    }

    fn load(yaml: &str) -> Scenario {
        let f = yaml_tempfile(yaml);
        Scenario::load_from_file(f.path()).unwrap()
    }

    fn report<'a>(reports: &'a [ActivityReport], name: &str) -> &'a ActivityReport {
        reports.iter().find(|r| r.name == name).unwrap()
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= 1e-6 * expected.abs().max(1.0),
            "expected {expected}, got {actual}"
        );
    }

    const PLATFORM: &str = r#"
hosts:
  - name: alice
    speed: [100.0, 50.0]
    cores: 2
    disks:
      - { name: ssd, read_bandwidth: 100.0, write_bandwidth: 50.0 }
  - name: bob
    speed: [100.0]
    disks:
      - { name: hdd, read_bandwidth: 100.0, write_bandwidth: 100.0 }
links:
  - { name: l1, bandwidth: 100.0, latency: 0.0 }
routes:
  - { src: alice, dst: bob, links: [l1] }
"#;

    #[test]
    fn parses_every_activity_kind() {
        let yaml = format!(
            "{PLATFORM}{}",
            r#"
activities:
  - { name: e, kind: execute, host: alice, flops: 100.0, cores: 2, bound: 150.0 }
  - { name: z, kind: sleep, host: bob, duration: 1.0 }
  - { name: c, kind: communicate, src: alice, dst: bob, bytes: 10.0, start: 0.5 }
  - { name: r, kind: read, disk: ssd, bytes: 10.0 }
  - { name: w, kind: write, disk: hdd, bytes: 10.0 }
  - { name: p, kind: parallel, hosts: [alice, bob], flops: [1.0, 1.0], bytes: [0, 1, 0, 0] }
  - { name: s, kind: stream, src: alice, src_disk: ssd, dst: bob, dst_disk: hdd, bytes: 10.0 }
"#
        );
        let scenario = load(&yaml);
        assert_eq!(scenario.hosts.len(), 2);
        assert_eq!(scenario.hosts[1].cores, 1);
        let kinds: Vec<_> = scenario.activities.iter().map(|a| a.activity.kind()).collect();
        assert_eq!(
            kinds,
            ["execute", "sleep", "communicate", "read", "write", "parallel", "stream"]
        );
        assert_eq!(scenario.activities[2].start, 0.5);
        assert_eq!(
            scenario.activities[0].activity,
            Activity::Execute {
                host: "alice".into(),
                flops: 100.0,
                cores: 2,
                bound: Some(150.0)
            }
        );
    }

    #[test]
    fn runs_activities_on_their_models() {
        let yaml = format!(
            "{PLATFORM}{}",
            r#"
activities:
  - { name: compute, kind: execute, host: alice, flops: 200.0 }
  - { name: send, kind: communicate, src: alice, dst: bob, bytes: 300.0 }
  - { name: load, kind: read, disk: ssd, bytes: 400.0 }
  - { name: late, kind: execute, host: bob, flops: 100.0, start: 10.0 }
  - { name: stream, kind: stream, src: alice, src_disk: ssd, dst: bob, dst_disk: hdd, bytes: 100.0 }
"#
        );
        let mut sim = Simulation::build(&config(), &load(&yaml)).unwrap();
        let reports = sim.run(None).unwrap();
        assert_eq!(reports.len(), 5);

        assert_close(report(&reports, "compute").finish.unwrap(), 2.0);
        assert_close(report(&reports, "send").finish.unwrap(), 3.0);
        assert_close(report(&reports, "load").finish.unwrap(), 4.0);
        let late = report(&reports, "late");
        assert_close(late.start, 10.0);
        assert_close(late.finish.unwrap(), 11.0);
        assert_close(report(&reports, "stream").finish.unwrap(), 1.0);
        assert!(reports.iter().all(|r| r.state == ActionState::Finished));
        assert_close(sim.now(), 11.0);
    }

    #[test]
    fn events_reach_every_model_holding_the_resource() {
        let yaml = format!(
            "{PLATFORM}{}",
            r#"
activities:
  - { name: send, kind: communicate, src: alice, dst: bob, bytes: 1000.0 }
  - { name: task, kind: parallel, hosts: [alice, bob], flops: [0, 0], bytes: [0, 1000, 0, 0] }
events:
  - { at: 1.0, link: l1, state: false }
"#
        );
        let mut sim = Simulation::build(&config(), &load(&yaml)).unwrap();
        let reports = sim.run(None).unwrap();
        for name in ["send", "task"] {
            let r = report(&reports, name);
            assert_eq!(r.state, ActionState::Failed, "{name}");
            assert_close(r.finish.unwrap(), 1.0);
        }
    }

    #[test]
    fn speed_event_slows_executions() {
        let yaml = format!(
            "{PLATFORM}{}",
            r#"
activities:
  - { name: compute, kind: execute, host: bob, flops: 200.0 }
events:
  - { at: 1.0, host: bob, speed: 0.5 }
"#
        );
        let mut sim = Simulation::build(&config(), &load(&yaml)).unwrap();
        let reports = sim.run(None).unwrap();
        assert_close(report(&reports, "compute").finish.unwrap(), 3.0);
    }

    #[test]
    fn max_date_cuts_the_run() {
        let yaml = format!(
            "{PLATFORM}{}",
            r#"
activities:
  - { name: compute, kind: execute, host: bob, flops: 1000.0 }
  - { name: never, kind: execute, host: bob, flops: 1.0, start: 50.0 }
"#
        );
        let mut sim = Simulation::build(&config(), &load(&yaml)).unwrap();
        let reports = sim.run(Some(5.0)).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].state, ActionState::Started);
        assert_eq!(reports[0].finish, None);
        assert_close(sim.now(), 5.0);
    }

    #[test]
    fn wifi_links_stay_in_the_network_model() {
        let yaml = r#"
hosts:
  - { name: phone, speed: [1.0] }
  - { name: server, speed: [1.0] }
links:
  - { name: ap, sharing: wifi, rates: [10.0, 5.0], levels: { phone: 1 } }
  - { name: wire, bandwidth: 1000.0, sharing: fatpipe }
routes:
  - { src: phone, dst: server, links: [ap, wire] }
activities:
  - { name: upload, kind: communicate, src: phone, dst: server, bytes: 50.0 }
"#;
        let mut sim = Simulation::build(&config(), &load(yaml)).unwrap();
        let reports = sim.run(None).unwrap();
        assert_close(report(&reports, "upload").finish.unwrap(), 10.0);
    }

    #[test]
    fn unknown_names_are_reported() {
        let yaml = r#"
hosts:
  - { name: a, speed: [1.0] }
routes:
  - { src: a, dst: b, links: [] }
"#;
        let err = Simulation::build(&config(), &load(yaml)).unwrap_err();
        assert!(matches!(err, ScenarioError::Model(ModelError::UnknownHost(ref h)) if h == "b"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let yaml = r#"
hosts:
  - { name: a, speed: [1.0] }
  - { name: a, speed: [2.0] }
"#;
        let err = Simulation::build(&config(), &load(yaml)).unwrap_err();
        assert!(matches!(err, ScenarioError::DuplicateName(ref n) if n == "a"));
    }

    #[test]
    fn malformed_events_are_rejected() {
        let two_changes = format!("{PLATFORM}events:\n  - {{ at: 1.0, host: alice, speed: 0.5, state: false }}\n");
        let err = Simulation::build(&config(), &load(&two_changes)).unwrap_err();
        assert!(matches!(err, ScenarioError::InvalidEvent { index: 0, .. }));

        let wrong_kind = format!("{PLATFORM}events:\n  - {{ at: 1.0, disk: ssd, speed: 0.5 }}\n");
        let err = Simulation::build(&config(), &load(&wrong_kind)).unwrap_err();
        assert!(matches!(err, ScenarioError::InvalidEvent { index: 0, .. }));
    }

    #[test]
    fn bundled_scenario_runs_to_completion() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("scenarios");
        let config = SimConfig::load_from_file(&dir.join("solver.yaml")).unwrap();
        let scenario = Scenario::load_from_file(&dir.join("two_hosts.yaml")).unwrap();
        let mut sim = Simulation::build(&config, &scenario).unwrap();
        let reports = sim.run(None).unwrap();

        assert_eq!(reports.len(), scenario.activities.len());
        for r in &reports {
            assert_eq!(r.state, ActionState::Finished, "{}", r.name);
            assert!(r.finish.unwrap() >= r.start, "{}", r.name);
        }
        assert_close(report(&reports, "nap").finish.unwrap(), 3.0);
    }

    #[test]
    fn unknown_activity_kind_fails_to_parse() {
        let f = yaml_tempfile("activities:\n  - { name: x, kind: teleport }\n");
        assert!(Scenario::load_from_file(f.path()).is_err());
    }
}
