/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Streaming I/O model (S22).
//!
//! A stream reads `size` bytes from a source disk, sends them over the
//! route between two hosts and writes them to a destination disk, all as one
//! action whose variable is the fraction of the stream done per second.
//! Either disk may be absent (plain transfer, local read or local write).
//!
//! The bound of a stream is the smallest of `read_bw / size` on the source
//! disk, `write_bw / size` on the destination disk and the TCP window
//! `tcp_gamma / (2 · latency · size)` of the route.  Like parallel tasks,
//! streams are shared with the fair-bottleneck solver and updated in full.

use std::collections::BTreeSet;

use slotmap::{SecondaryMap, SlotMap};
use tracing::{debug, info, warn};

use super::network::{Link, LinkSharing};
use super::{check_amount, min_bound};
use crate::lmm::{ConstraintId, SharingPolicy, SolverAlgorithm};
use crate::resource::{
    ActionId, DiskId, HostId, LinkId, Model, ModelCore, ModelError, ModelOptions, ResourceEvent,
    ResourceRef, RoutingTable, UpdateAlgorithm,
};

/// A disk attached to a host, seen as one shared constraint.
#[derive(Debug, Clone)]
pub struct StreamDisk {
    pub(crate) name: String,
    pub(crate) host: HostId,
    pub(crate) constraint: ConstraintId,
    pub(crate) read_bandwidth: f64,
    pub(crate) write_bandwidth: f64,
    pub(crate) on: bool,
}

impl StreamDisk {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> HostId {
        self.host
    }

    pub fn read_bandwidth(&self) -> f64 {
        self.read_bandwidth
    }

    pub fn write_bandwidth(&self) -> f64 {
        self.write_bandwidth
    }

    pub fn is_on(&self) -> bool {
        self.on
    }
}

#[derive(Debug, Clone)]
struct Stream {
    src_host: HostId,
    dst_host: HostId,
    src_disk: Option<DiskId>,
    dst_disk: Option<DiskId>,
    size: f64,
}

/// Bound of a stream given the current disk bandwidths and link latencies.
fn stream_bound(
    stream: &Stream,
    disks: &SlotMap<DiskId, StreamDisk>,
    links: &SlotMap<LinkId, Link>,
    routing: &RoutingTable,
    tcp_gamma: f64,
) -> Option<f64> {
    if stream.size <= 0.0 {
        return None;
    }
    let read = stream
        .src_disk
        .and_then(|d| disks.get(d))
        .map(|d| d.read_bandwidth / stream.size);
    let write = stream
        .dst_disk
        .and_then(|d| disks.get(d))
        .map(|d| d.write_bandwidth / stream.size);

    let mut network = None;
    if stream.src_host != stream.dst_host && tcp_gamma > 0.0 {
        if let Ok(route) = routing.route(stream.src_host, stream.dst_host) {
            let lat: f64 = route.iter().filter_map(|l| links.get(*l)).map(Link::latency).sum();
            if lat > 0.0 {
                network = Some(tcp_gamma / (2.0 * lat * stream.size));
            }
        }
    }
    min_bound(min_bound(read, write), network)
}

#[derive(Debug)]
pub struct SioModel {
    core: ModelCore,
    tcp_gamma: f64,
    routing: RoutingTable,
    disks: SlotMap<DiskId, StreamDisk>,
    links: SlotMap<LinkId, Link>,
    streams: SecondaryMap<ActionId, Stream>,
}

impl SioModel {
    /// # Errors
    /// [`ModelError::UnsupportedSolver`] for the max-min solver.
    pub fn new(options: &ModelOptions, tcp_gamma: f64) -> Result<Self, ModelError> {
        if options.solver == SolverAlgorithm::MaxMin {
            return Err(ModelError::UnsupportedSolver {
                model: "sio",
                solver: options.solver.to_string(),
            });
        }
        if options.update == UpdateAlgorithm::Lazy {
            warn!("streaming I/O only supports the full update, ignoring lazy");
        }
        let options = ModelOptions {
            update: UpdateAlgorithm::Full,
            ..options.clone()
        };
        Ok(Self {
            core: ModelCore::new("sio", &options)?,
            tcp_gamma,
            routing: RoutingTable::new(),
            disks: SlotMap::with_key(),
            links: SlotMap::with_key(),
            streams: SecondaryMap::new(),
        })
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn add_host(&mut self, name: impl Into<String>) -> HostId {
        self.routing.add_host(name)
    }

    pub fn add_disk(
        &mut self,
        host: HostId,
        name: impl Into<String>,
        read_bandwidth: f64,
        write_bandwidth: f64,
    ) -> Result<DiskId, ModelError> {
        let name = name.into();
        if !self.routing.contains_host(host) {
            return Err(ModelError::StaleResource {
                kind: "host",
                model: "sio",
            });
        }
        check_amount("read bandwidth", read_bandwidth)?;
        check_amount("write bandwidth", write_bandwidth)?;
        let constraint = self
            .core
            .system_mut()
            .constraint_new(Some(read_bandwidth.max(write_bandwidth)));
        info!(disk = %name, host = self.routing.host_name(host), read_bandwidth, write_bandwidth, "stream disk added");
        Ok(self.disks.insert(StreamDisk {
            name,
            host,
            constraint,
            read_bandwidth,
            write_bandwidth,
            on: true,
        }))
    }

    pub fn add_link(
        &mut self,
        name: impl Into<String>,
        bandwidth: f64,
        latency: f64,
        policy: SharingPolicy,
    ) -> Result<LinkId, ModelError> {
        let name = name.into();
        check_amount("bandwidth", bandwidth)?;
        check_amount("latency", latency)?;
        let system = self.core.system_mut();
        let constraint = system.constraint_new(Some(bandwidth));
        system.set_sharing_policy(constraint, policy);
        let sharing = match policy {
            SharingPolicy::Shared => LinkSharing::Shared,
            SharingPolicy::FatPipe => LinkSharing::FatPipe,
        };
        info!(link = %name, bandwidth, latency, "stream link added");
        Ok(self
            .links
            .insert(Link::new(name, constraint, bandwidth, latency, sharing)))
    }

    pub fn add_route(
        &mut self,
        src: HostId,
        dst: HostId,
        links: Vec<LinkId>,
        symmetric: bool,
    ) -> Result<(), ModelError> {
        for l in &links {
            self.link(*l)?;
        }
        self.routing.add_route(src, dst, links, symmetric);
        Ok(())
    }

    pub fn disk(&self, disk: DiskId) -> Result<&StreamDisk, ModelError> {
        self.disks.get(disk).ok_or(ModelError::StaleResource {
            kind: "disk",
            model: "sio",
        })
    }

    pub fn link(&self, link: LinkId) -> Result<&Link, ModelError> {
        self.links.get(link).ok_or(ModelError::StaleResource {
            kind: "link",
            model: "sio",
        })
    }

    /// Stream `size` bytes from `src_disk` on `src_host` to `dst_disk` on
    /// `dst_host`.
    pub fn io_stream(
        &mut self,
        src_host: HostId,
        src_disk: Option<DiskId>,
        dst_host: HostId,
        dst_disk: Option<DiskId>,
        size: f64,
    ) -> Result<ActionId, ModelError> {
        check_amount("size", size)?;
        for host in [src_host, dst_host] {
            if !self.routing.contains_host(host) {
                return Err(ModelError::StaleResource {
                    kind: "host",
                    model: "sio",
                });
            }
        }
        let mut disk_constraints = Vec::new();
        let mut failed = false;
        for d in [src_disk, dst_disk].into_iter().flatten() {
            let disk = self.disk(d)?;
            disk_constraints.push(disk.constraint);
            failed |= !disk.on;
        }

        let mut latency = 0.0;
        let mut route = Vec::new();
        if src_host != dst_host && size > 0.0 {
            route = self.routing.route(src_host, dst_host)?;
            for l in &route {
                let link = &self.links[*l];
                latency += link.latency;
                failed |= !link.on;
            }
        }
        let distinct_links = route.iter().collect::<BTreeSet<_>>().len();

        let id = self.core.new_action(1.0, failed);
        if failed {
            return Ok(id);
        }
        let var = self
            .core
            .new_variable(id, 1.0, None, disk_constraints.len() + distinct_links);
        if latency > 0.0 {
            self.core.action_mut(id)?.latency = latency;
            self.core.system_mut().update_variable_penalty(var, 0.0);
        }

        if size > 0.0 {
            let system = self.core.system_mut();
            for &cnst in &disk_constraints {
                system.expand(cnst, var, size);
            }
            for l in &route {
                system.expand_add(self.links[*l].constraint, var, size);
            }
        }
        if size <= 0.0 || disk_constraints.len() + distinct_links == 0 {
            self.core.action_mut(id)?.remains = 0.0;
        }

        self.streams.insert(
            id,
            Stream {
                src_host,
                dst_host,
                src_disk,
                dst_disk,
                size,
            },
        );
        if latency <= 0.0 {
            self.update_bound(id);
        }
        debug!(
            src = self.routing.host_name(src_host),
            dst = self.routing.host_name(dst_host),
            size,
            disks = disk_constraints.len(),
            links = distinct_links,
            latency,
            "stream started"
        );
        Ok(id)
    }

    /// Network transfer without disks.
    pub fn communicate(&mut self, src: HostId, dst: HostId, size: f64) -> Result<ActionId, ModelError> {
        self.io_stream(src, None, dst, None, size)
    }

    /// Local read of `size` bytes from `disk`.
    pub fn read(&mut self, disk: DiskId, size: f64) -> Result<ActionId, ModelError> {
        let host = self.disk(disk)?.host;
        self.io_stream(host, Some(disk), host, None, size)
    }

    /// Local write of `size` bytes to `disk`.
    pub fn write(&mut self, disk: DiskId, size: f64) -> Result<ActionId, ModelError> {
        let host = self.disk(disk)?.host;
        self.io_stream(host, None, host, Some(disk), size)
    }

    fn update_bound(&mut self, id: ActionId) {
        let Some(stream) = self.streams.get(id) else {
            return;
        };
        let bound = stream_bound(stream, &self.disks, &self.links, &self.routing, self.tcp_gamma);
        if let Some(var) = self.core.action(id).and_then(|a| a.variable()) {
            self.core.system_mut().update_variable_bound(var, bound);
        }
    }

    fn rebound_users(&mut self, constraint: ConstraintId) {
        let system = self.core.system();
        let owners: Vec<ActionId> = system
            .constraint_variables(constraint)
            .into_iter()
            .filter_map(|var| system.variable(var).owner())
            .collect();
        for id in owners {
            if self.core.action(id).is_some_and(|a| a.latency() <= 0.0) {
                self.update_bound(id);
            }
        }
    }

    fn disk_mut(&mut self, disk: DiskId) -> Result<&mut StreamDisk, ModelError> {
        self.disks.get_mut(disk).ok_or(ModelError::StaleResource {
            kind: "disk",
            model: "sio",
        })
    }

    fn link_mut(&mut self, link: LinkId) -> Result<&mut Link, ModelError> {
        self.links.get_mut(link).ok_or(ModelError::StaleResource {
            kind: "link",
            model: "sio",
        })
    }

    pub fn set_read_bandwidth(&mut self, disk: DiskId, bandwidth: f64) -> Result<(), ModelError> {
        check_amount("read bandwidth", bandwidth)?;
        self.disk_mut(disk)?.read_bandwidth = bandwidth;
        self.disk_changed(disk);
        Ok(())
    }

    pub fn set_write_bandwidth(&mut self, disk: DiskId, bandwidth: f64) -> Result<(), ModelError> {
        check_amount("write bandwidth", bandwidth)?;
        self.disk_mut(disk)?.write_bandwidth = bandwidth;
        self.disk_changed(disk);
        Ok(())
    }

    fn disk_changed(&mut self, disk: DiskId) {
        let d = &self.disks[disk];
        let (constraint, bound) = (d.constraint, d.read_bandwidth.max(d.write_bandwidth));
        debug!(disk = %d.name, read = d.read_bandwidth, write = d.write_bandwidth, "stream disk bandwidth changed");
        self.core
            .system_mut()
            .update_constraint_bound(constraint, Some(bound));
        self.rebound_users(constraint);
    }

    pub fn set_bandwidth(&mut self, link: LinkId, bandwidth: f64) -> Result<(), ModelError> {
        check_amount("bandwidth", bandwidth)?;
        let l = self.link_mut(link)?;
        l.bandwidth = bandwidth;
        let (constraint, bw) = (l.constraint, l.bandwidth());
        self.core
            .system_mut()
            .update_constraint_bound(constraint, Some(bw));
        Ok(())
    }

    pub fn set_latency(&mut self, link: LinkId, latency: f64) -> Result<(), ModelError> {
        check_amount("latency", latency)?;
        let l = self.link_mut(link)?;
        l.latency = latency;
        let constraint = l.constraint;
        self.rebound_users(constraint);
        Ok(())
    }

    fn set_state(&mut self, target: ResourceRef, on: bool) -> Result<(), ModelError> {
        let constraint = match target {
            ResourceRef::Disk(d) => {
                let disk = self.disk_mut(d)?;
                disk.on = on;
                disk.constraint
            }
            ResourceRef::Link(l) => {
                let link = self.link_mut(l)?;
                link.on = on;
                link.constraint
            }
            ResourceRef::Host(_) => return Err(ModelError::UnsupportedEvent { model: "sio" }),
        };
        if !on {
            let failed = self.core.fail_actions_using(constraint);
            warn!(?target, failed, "stream resource turned off");
        }
        Ok(())
    }
}

impl Model for SioModel {
    fn core(&self) -> &ModelCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModelCore {
        &mut self.core
    }

    fn update_actions_state(&mut self, now: f64, delta: f64) {
        let Self {
            core,
            tcp_gamma,
            routing,
            disks,
            links,
            streams,
        } = self;
        core.update_actions_state(now, delta, |core, id| {
            if let Some(stream) = streams.get(id) {
                let bound = stream_bound(stream, disks, links, routing, *tcp_gamma);
                if let Some(var) = core.action(id).and_then(|a| a.variable()) {
                    core.system_mut().update_variable_bound(var, bound);
                }
            }
            core.restore_penalty(id);
        });
    }

    fn apply_event(&mut self, target: ResourceRef, event: ResourceEvent) -> Result<(), ModelError> {
        match (target, event) {
            (ResourceRef::Disk(d), ResourceEvent::ReadBandwidth(bw)) => self.set_read_bandwidth(d, bw),
            (ResourceRef::Disk(d), ResourceEvent::WriteBandwidth(bw)) => self.set_write_bandwidth(d, bw),
            (ResourceRef::Link(l), ResourceEvent::Bandwidth(bw)) => self.set_bandwidth(l, bw),
            (ResourceRef::Link(l), ResourceEvent::Latency(lat)) => self.set_latency(l, lat),
            (target, ResourceEvent::State(on)) => self.set_state(target, on),
            _ => Err(ModelError::UnsupportedEvent { model: "sio" }),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
