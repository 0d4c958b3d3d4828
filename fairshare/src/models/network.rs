/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Flow-level network model (CM02).
//!
//! A communication first pays the latency of its route with a zero penalty,
//! then competes for bandwidth on every link of the route.  Its rate is
//! bounded by the slowest link (times the bandwidth factor), the TCP window
//! (`tcp_gamma / 2·latency`) and the rate the user asked for.
//!
//! | Link kind | Constraint | Element weight |
//! |---|---|---|
//! | shared | bandwidth, Σ usage | `1` (`0.05` for the reverse ACK flow) |
//! | fat pipe | bandwidth, max usage | same |
//! | WiFi | `1` (time share) | `1 / rate of the host on that link` |

use std::collections::{BTreeMap, BTreeSet};

use slotmap::{SecondaryMap, SlotMap};
use tracing::{debug, info, warn};

use super::{check_amount, min_bound, user_rate};
use crate::lmm::{ConstraintId, SharingPolicy};
use crate::resource::{
    ActionId, FactorCurve, HeapType, HostId, LinkId, Model, ModelCore, ModelError, ModelOptions,
    ResourceEvent, ResourceRef, RoutingTable, SuspendState,
};

/// Weight of the reverse (ACK) flow on every link of the back route.
const CROSSTRAFFIC_WEIGHT: f64 = 0.05;

// ── Parameters ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkParams {
    /// Maximal TCP window size, in bytes.
    pub tcp_gamma: f64,
    /// Model the reverse ACK flow of every communication.
    pub crosstraffic: bool,
    /// RTT-unfairness term added to the penalty of a flow per crossed link.
    pub weight_s: f64,
    pub latency_factor: FactorCurve,
    pub bandwidth_factor: FactorCurve,
    pub loopback_bandwidth: f64,
    pub loopback_latency: f64,
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self {
            tcp_gamma: 4_194_304.0,
            crosstraffic: true,
            weight_s: 20537.0,
            latency_factor: FactorCurve::constant(13.01),
            bandwidth_factor: FactorCurve::constant(0.97),
            loopback_bandwidth: 10e9,
            loopback_latency: 0.0,
        }
    }
}

impl NetworkParams {
    /// TCP window bound of a flow seeing `latency`.
    pub(crate) fn tcp_bound(&self, latency: f64) -> Option<f64> {
        (latency > 0.0 && self.tcp_gamma > 0.0).then(|| self.tcp_gamma / (2.0 * latency))
    }

    /// Penalty term of a flow crossing a link of `bandwidth`.
    fn weight_s_term(&self, bandwidth: f64) -> f64 {
        if self.weight_s > 0.0 && bandwidth > 0.0 {
            self.weight_s / bandwidth
        } else {
            0.0
        }
    }
}

// ── Links ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkSharing {
    #[default]
    Shared,
    FatPipe,
    Wifi,
}

#[derive(Debug, Clone)]
pub struct Link {
    pub(crate) name: String,
    pub(crate) constraint: ConstraintId,
    pub(crate) bandwidth: f64,
    pub(crate) bandwidth_scale: f64,
    pub(crate) latency: f64,
    pub(crate) sharing: LinkSharing,
    pub(crate) on: bool,
    /// WiFi rate levels and the level of every attached host.
    pub(crate) wifi_rates: Vec<f64>,
    pub(crate) host_rates: BTreeMap<HostId, usize>,
}

impl Link {
    pub(crate) fn new(
        name: String,
        constraint: ConstraintId,
        bandwidth: f64,
        latency: f64,
        sharing: LinkSharing,
    ) -> Self {
        Self {
            name,
            constraint,
            bandwidth,
            bandwidth_scale: 1.0,
            latency,
            sharing,
            on: true,
            wifi_rates: Vec::new(),
            host_rates: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current bandwidth, in bytes per second.
    pub fn bandwidth(&self) -> f64 {
        self.bandwidth * self.bandwidth_scale
    }

    pub fn latency(&self) -> f64 {
        self.latency
    }

    pub fn sharing(&self) -> LinkSharing {
        self.sharing
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    pub fn constraint(&self) -> ConstraintId {
        self.constraint
    }

    /// Rate of `host` on this WiFi link.
    pub fn host_rate(&self, host: HostId) -> Option<f64> {
        self.host_rates
            .get(&host)
            .and_then(|&level| self.wifi_rates.get(level).copied())
    }
}

/// What a communication needs to rebuild its bound.
#[derive(Debug, Clone)]
struct Comm {
    route: Vec<LinkId>,
    size: f64,
    rate: Option<f64>,
    /// Latency plus weight-S terms, before clamping to a valid penalty.
    raw_penalty: f64,
}

fn effective_penalty(raw: f64) -> f64 {
    if raw > 0.0 {
        raw
    } else {
        1.0
    }
}

// ── Model ─────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct NetworkModel {
    core: ModelCore,
    params: NetworkParams,
    links: SlotMap<LinkId, Link>,
    routing: RoutingTable,
    loopback: LinkId,
    comms: SecondaryMap<ActionId, Comm>,
}

impl NetworkModel {
    pub fn new(options: &ModelOptions, params: NetworkParams) -> Result<Self, ModelError> {
        check_amount("loopback bandwidth", params.loopback_bandwidth)?;
        check_amount("loopback latency", params.loopback_latency)?;
        let mut core = ModelCore::new("network", options)?;
        let mut links = SlotMap::with_key();

        let constraint = core
            .system_mut()
            .constraint_new(Some(params.loopback_bandwidth));
        core.system_mut()
            .set_sharing_policy(constraint, SharingPolicy::FatPipe);
        let loopback = links.insert(Link::new(
            "__loopback__".to_string(),
            constraint,
            params.loopback_bandwidth,
            params.loopback_latency,
            LinkSharing::FatPipe,
        ));
        let mut routing = RoutingTable::new();
        routing.set_loopback(loopback);

        Ok(Self {
            core,
            params,
            links,
            routing,
            loopback,
            comms: SecondaryMap::new(),
        })
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn loopback(&self) -> LinkId {
        self.loopback
    }

    pub fn add_host(&mut self, name: impl Into<String>) -> HostId {
        self.routing.add_host(name)
    }

    pub fn add_link(
        &mut self,
        name: impl Into<String>,
        bandwidth: f64,
        latency: f64,
        sharing: LinkSharing,
    ) -> Result<LinkId, ModelError> {
        let name = name.into();
        check_amount("bandwidth", bandwidth)?;
        check_amount("latency", latency)?;
        let bound = if sharing == LinkSharing::Wifi { 1.0 } else { bandwidth };
        let system = self.core.system_mut();
        let constraint = system.constraint_new(Some(bound));
        if sharing == LinkSharing::FatPipe {
            system.set_sharing_policy(constraint, SharingPolicy::FatPipe);
        }
        info!(link = %name, bandwidth, latency, ?sharing, "link added");
        Ok(self
            .links
            .insert(Link::new(name, constraint, bandwidth, latency, sharing)))
    }

    /// WiFi access point with several rate levels (bytes per second).
    pub fn add_wifi_link(
        &mut self,
        name: impl Into<String>,
        rates: Vec<f64>,
        latency: f64,
    ) -> Result<LinkId, ModelError> {
        for &r in &rates {
            check_amount("wifi rate", r)?;
        }
        let top = rates.iter().copied().fold(0.0, f64::max);
        let id = self.add_link(name, top, latency, LinkSharing::Wifi)?;
        self.links[id].wifi_rates = rates;
        Ok(id)
    }

    /// Attach `host` to a WiFi link at rate level `level`.
    pub fn set_host_rate(&mut self, link: LinkId, host: HostId, level: usize) -> Result<(), ModelError> {
        let host_name = self.routing.host_name(host).to_string();
        let l = self.link_mut(link)?;
        let valid = l.sharing == LinkSharing::Wifi && l.wifi_rates.get(level).is_some_and(|r| *r > 0.0);
        if !valid {
            return Err(ModelError::MissingWifiRate {
                host: host_name,
                link: l.name.clone(),
            });
        }
        l.host_rates.insert(host, level);
        Ok(())
    }

    pub fn add_route(
        &mut self,
        src: HostId,
        dst: HostId,
        links: Vec<LinkId>,
        symmetric: bool,
    ) -> Result<(), ModelError> {
        for &l in &links {
            self.link(l)?;
        }
        self.routing.add_route(src, dst, links, symmetric);
        Ok(())
    }

    pub fn link(&self, link: LinkId) -> Result<&Link, ModelError> {
        self.links.get(link).ok_or(ModelError::StaleResource {
            kind: "link",
            model: "network",
        })
    }

    fn link_mut(&mut self, link: LinkId) -> Result<&mut Link, ModelError> {
        self.links.get_mut(link).ok_or(ModelError::StaleResource {
            kind: "link",
            model: "network",
        })
    }

    pub fn link_by_name(&self, name: &str) -> Option<LinkId> {
        self.links
            .iter()
            .find(|(_, l)| l.name == name)
            .map(|(id, _)| id)
    }

    /// The WiFi link at one end of a route, with the rate of the host there.
    fn wifi_end(&self, link: Option<&LinkId>, host: HostId) -> Result<Option<(ConstraintId, f64)>, ModelError> {
        let Some(l) = link.and_then(|id| self.links.get(*id)) else {
            return Ok(None);
        };
        if l.sharing != LinkSharing::Wifi {
            return Ok(None);
        }
        match l.host_rate(host) {
            Some(rate) => Ok(Some((l.constraint, rate))),
            None => Err(ModelError::MissingWifiRate {
                host: self.routing.host_name(host).to_string(),
                link: l.name.clone(),
            }),
        }
    }

    /// Send `size` bytes from `src` to `dst`, at most at `rate` bytes/s.
    pub fn communicate(
        &mut self,
        src: HostId,
        dst: HostId,
        size: f64,
        rate: Option<f64>,
    ) -> Result<ActionId, ModelError> {
        check_amount("size", size)?;
        let rate = user_rate(rate);
        let route = self.routing.route(src, dst)?;
        let back_route = if self.params.crosstraffic && self.routing.has_route(dst, src) {
            self.routing.route(dst, src)?
        } else {
            Vec::new()
        };

        let src_wifi = self.wifi_end(route.first(), src)?;
        let dst_wifi = if route.len() > 1 {
            self.wifi_end(route.last(), dst)?
        } else {
            None
        };

        let failed = route
            .iter()
            .chain(back_route.iter())
            .any(|l| !self.links[*l].on);

        let mut latency = 0.0;
        let mut raw_penalty = 0.0;
        for l in route.iter().map(|id| &self.links[*id]) {
            latency += l.latency;
            raw_penalty += l.latency;
            if l.sharing != LinkSharing::Wifi {
                raw_penalty += self.params.weight_s_term(l.bandwidth());
            }
        }
        let lat_current = latency;
        let latency = latency * self.params.latency_factor.factor(size);

        let id = self.core.new_action(size, failed);
        if failed {
            debug!(
                src = self.routing.host_name(src),
                dst = self.routing.host_name(dst),
                "communication over a link that is off"
            );
            return Ok(id);
        }
        self.comms.insert(
            id,
            Comm {
                route: route.clone(),
                size,
                rate,
                raw_penalty,
            },
        );

        let penalty = effective_penalty(raw_penalty);
        let hint = route.len() + back_route.len();
        let var = if latency > 0.0 {
            let now = self.core.now();
            let var = self.core.new_variable(id, 0.0, None, hint);
            if self.core.is_lazy() {
                self.core.heap_update(id, now + latency, HeapType::Latency);
            }
            var
        } else {
            self.core.new_variable(id, penalty, None, hint)
        };
        {
            let action = self.core.action_mut(id)?;
            action.latency = latency;
            action.lat_current = lat_current;
            action.sharing_penalty = penalty;
        }
        self.update_bound(id);

        let system = self.core.system_mut();
        if let Some((cnst, host_rate)) = src_wifi {
            system.expand(cnst, var, 1.0 / host_rate);
        }
        if let Some((cnst, host_rate)) = dst_wifi {
            system.expand(cnst, var, 1.0 / host_rate);
        }
        let mut forward = BTreeSet::new();
        for &l in &route {
            let link = &self.links[l];
            if link.sharing != LinkSharing::Wifi && forward.insert(l) {
                system.expand(link.constraint, var, 1.0);
            }
        }
        if self.params.crosstraffic {
            if let Some((cnst, host_rate)) = dst_wifi {
                system.expand(cnst, var, CROSSTRAFFIC_WEIGHT / host_rate);
            }
            if let Some((cnst, host_rate)) = src_wifi {
                system.expand(cnst, var, CROSSTRAFFIC_WEIGHT / host_rate);
            }
            let mut backward = BTreeSet::new();
            for &l in &back_route {
                let link = &self.links[l];
                if link.sharing == LinkSharing::Wifi || !backward.insert(l) {
                    continue;
                }
                if forward.contains(&l) {
                    system.expand_add(link.constraint, var, CROSSTRAFFIC_WEIGHT);
                } else {
                    system.expand(link.constraint, var, CROSSTRAFFIC_WEIGHT);
                }
            }
        }

        debug!(
            src = self.routing.host_name(src),
            dst = self.routing.host_name(dst),
            size,
            latency,
            penalty,
            hops = route.len(),
            "communication started"
        );
        Ok(id)
    }

    /// Re-derive the bound of a communication from its route, its size and
    /// the rate requested for it.
    fn update_bound(&mut self, id: ActionId) {
        let Some(comm) = self.comms.get(id) else {
            return;
        };
        let Some(action) = self.core.action(id) else {
            return;
        };
        let Some(var) = action.variable() else {
            return;
        };
        let slowest = comm
            .route
            .iter()
            .filter_map(|l| self.links.get(*l))
            .filter(|l| l.sharing != LinkSharing::Wifi)
            .map(Link::bandwidth)
            .reduce(f64::min);
        let bandwidth_bound = slowest.map(|bw| bw * self.params.bandwidth_factor.factor(comm.size));
        let user_bound = min_bound(bandwidth_bound, comm.rate);
        let bound = min_bound(user_bound, self.params.tcp_bound(action.lat_current));

        if let Ok(action) = self.core.action_mut(id) {
            action.user_bound = user_bound;
        }
        self.core.system_mut().update_variable_bound(var, bound);
    }

    /// Owners of the variables attached to `link`.
    fn actions_on(&self, link: LinkId) -> Vec<ActionId> {
        let system = self.core.system();
        system
            .constraint_variables(self.links[link].constraint)
            .into_iter()
            .filter_map(|var| system.variable(var).owner())
            .collect()
    }

    /// Push a new penalty to a flow that is competing for bandwidth.
    fn refresh_penalty(&mut self, id: ActionId) {
        let Some(raw) = self.comms.get(id).map(|c| c.raw_penalty) else {
            return;
        };
        let Ok(action) = self.core.action_mut(id) else {
            return;
        };
        let penalty = effective_penalty(raw);
        action.sharing_penalty = penalty;
        let active = action.suspended == SuspendState::Running && action.latency <= 0.0;
        let var = action.variable;
        if let (true, Some(var)) = (active, var) {
            self.core.system_mut().update_variable_penalty(var, penalty);
        }
        self.core.touch(id);
    }

    pub fn set_bandwidth(&mut self, link: LinkId, bandwidth: f64) -> Result<(), ModelError> {
        check_amount("bandwidth", bandwidth)?;
        let l = self.link_mut(link)?;
        if l.sharing == LinkSharing::Wifi {
            return Err(ModelError::UnsupportedEvent { model: "network" });
        }
        let old = l.bandwidth();
        l.bandwidth = bandwidth;
        let (constraint, new) = (l.constraint, l.bandwidth());
        debug!(link = %l.name, old, new, "bandwidth changed");
        self.core
            .system_mut()
            .update_constraint_bound(constraint, Some(new));

        let delta = self.params.weight_s_term(new) - self.params.weight_s_term(old);
        for id in self.actions_on(link) {
            if let Some(comm) = self.comms.get_mut(id) {
                comm.raw_penalty += delta;
            }
            self.update_bound(id);
            if delta != 0.0 {
                self.refresh_penalty(id);
            } else {
                self.core.touch(id);
            }
        }
        Ok(())
    }

    pub fn set_latency(&mut self, link: LinkId, latency: f64) -> Result<(), ModelError> {
        check_amount("latency", latency)?;
        let l = self.link_mut(link)?;
        let delta = latency - l.latency;
        l.latency = latency;
        debug!(link = %l.name, latency, "latency changed");

        for id in self.actions_on(link) {
            if let Some(comm) = self.comms.get_mut(id) {
                comm.raw_penalty += delta;
            }
            if let Ok(action) = self.core.action_mut(id) {
                action.lat_current += delta;
            }
            self.update_bound(id);
            self.refresh_penalty(id);
        }
        Ok(())
    }

    pub fn turn_off(&mut self, link: LinkId) -> Result<(), ModelError> {
        let l = self.link_mut(link)?;
        if !l.on {
            return Ok(());
        }
        l.on = false;
        let constraint = l.constraint;
        let failed = self.core.fail_actions_using(constraint);
        warn!(link = %self.links[link].name, failed, "link turned off");
        Ok(())
    }

    pub fn turn_on(&mut self, link: LinkId) -> Result<(), ModelError> {
        let l = self.link_mut(link)?;
        l.on = true;
        info!(link = %l.name, "link turned on");
        Ok(())
    }
}

impl Model for NetworkModel {
    fn core(&self) -> &ModelCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModelCore {
        &mut self.core
    }

    fn apply_event(&mut self, target: ResourceRef, event: ResourceEvent) -> Result<(), ModelError> {
        let ResourceRef::Link(link) = target else {
            return Err(ModelError::UnsupportedEvent { model: "network" });
        };
        match event {
            ResourceEvent::Bandwidth(bw) => self.set_bandwidth(link, bw),
            ResourceEvent::Latency(lat) => self.set_latency(link, lat),
            ResourceEvent::State(true) => self.turn_on(link),
            ResourceEvent::State(false) => self.turn_off(link),
            _ => Err(ModelError::UnsupportedEvent { model: "network" }),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
