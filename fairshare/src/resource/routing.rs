/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Host registry and static routes.
//!
//! Routes are declared explicitly between pairs of hosts as ordered lists of
//! links.  A route from a host to itself falls back to the loopback link
//! when one was registered.  Routes are kept in a [`BTreeMap`] so dumps and
//! iteration are deterministic.

use std::collections::BTreeMap;

use slotmap::SlotMap;
use tracing::debug;

use super::{HostId, LinkId, ModelError};

#[derive(Debug, Default)]
pub struct RoutingTable {
    hosts: SlotMap<HostId, String>,
    routes: BTreeMap<(HostId, HostId), Vec<LinkId>>,
    loopback: Option<LinkId>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&mut self, name: impl Into<String>) -> HostId {
        self.hosts.insert(name.into())
    }

    pub fn host_name(&self, host: HostId) -> &str {
        self.hosts.get(host).map_or("<unknown>", String::as_str)
    }

    pub fn contains_host(&self, host: HostId) -> bool {
        self.hosts.contains_key(host)
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn hosts(&self) -> impl Iterator<Item = (HostId, &str)> {
        self.hosts.iter().map(|(id, name)| (id, name.as_str()))
    }

    pub fn set_loopback(&mut self, link: LinkId) {
        self.loopback = Some(link);
    }

    pub fn loopback(&self) -> Option<LinkId> {
        self.loopback
    }

    /// Declare the route `src → dst`.  With `symmetric`, the reverse route
    /// uses the same links in reverse order.
    pub fn add_route(&mut self, src: HostId, dst: HostId, links: Vec<LinkId>, symmetric: bool) {
        debug!(
            src = self.host_name(src),
            dst = self.host_name(dst),
            hops = links.len(),
            symmetric,
            "route added"
        );
        if symmetric && src != dst {
            let mut back = links.clone();
            back.reverse();
            self.routes.insert((dst, src), back);
        }
        self.routes.insert((src, dst), links);
    }

    /// Links crossed from `src` to `dst`, in order.
    pub fn route(&self, src: HostId, dst: HostId) -> Result<Vec<LinkId>, ModelError> {
        if let Some(links) = self.routes.get(&(src, dst)) {
            return Ok(links.clone());
        }
        if src == dst {
            return Ok(self.loopback.into_iter().collect());
        }
        Err(ModelError::NoRoute {
            src: self.host_name(src).to_string(),
            dst: self.host_name(dst).to_string(),
        })
    }

    /// Whether a route `src → dst` is known (loopback included).
    pub fn has_route(&self, src: HostId, dst: HostId) -> bool {
        src == dst || self.routes.contains_key(&(src, dst))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
