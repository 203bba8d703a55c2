//! Distribution of path rules to devices
//!
//! Assigns each traffic flow one primary enforcing device, works out the
//! address devices are managed through and assembles the per interface
//! ACLs and routes of every managed router into a [`DeviceConfig`].

use crate::core::analyze::{LocalRouters, describe};
use crate::core::diag::{DiagKind, Diagnostics, Staged};
use crate::core::expand::{CryptoSide, PathRule};
use crate::core::model::{
    Action, InterfaceId, ManagedKind, Model, NetworkId, ObjId, Router, RouterId, RuleId,
};
use crate::core::nat::NatDomains;
use crate::core::routes::ActiveRoutes;
use crate::core::service::Prt;
use crate::core::subnets::{AddressView, NatViews, ReroutePermits, ZoneSubnets};
use crate::core::topology::{Node, PathFinder};
use crate::utils::truncate_string;
use ipnetwork::IpNetwork;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::IpAddr;
use tracing::{debug, info};

/// Longest rule description kept as ACL line comment
pub const MAX_COMMENT_LEN: usize = 96;

// ═══════════════════════════════════════════════════════════════════════════
// Output types
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclLine {
    pub action: Action,
    pub src: IpNetwork,
    pub dst: IpNetwork,
    pub prt: Prt,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub log: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto: Option<CryptoSide>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub secondary: bool,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAcl {
    pub interface: String,
    pub lines: Vec<AclLine>,
    /// Networks allowed to leave through the interface they came in
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reroute_permit: Vec<IpNetwork>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteLine {
    pub destination: IpNetwork,
    pub interface: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_hop: Option<IpAddr>,
}

/// Everything the device syntax emitter needs for one router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub managed: ManagedKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_distribution_ip: Option<IpAddr>,
    pub interfaces: Vec<InterfaceAcl>,
    pub routes: Vec<RouteLine>,
}

impl DeviceConfig {
    pub fn acl(&self, interface: &str) -> Option<&InterfaceAcl> {
        self.interfaces.iter().find(|a| a.interface == interface)
    }

    pub fn line_count(&self) -> usize {
        self.interfaces.iter().map(|a| a.lines.len()).sum()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Policy distribution
// ═══════════════════════════════════════════════════════════════════════════

fn first_interface_ip(model: &Model, router: RouterId) -> Option<(InterfaceId, IpAddr)> {
    let mut candidates: Vec<(InterfaceId, IpAddr)> = model
        .router(router)
        .interfaces
        .iter()
        .filter_map(|i| model.interface(*i).ip.map(|ip| (*i, ip)))
        .collect();
    candidates.sort_by(|a, b| model.interface(a.0).name.cmp(&model.interface(b.0).name));
    candidates.into_iter().next()
}

/// Address every managed router with a `policy_distribution_point` is
/// reached at from that host.
pub fn set_policy_distribution_ip(
    model: &Model,
    domains: &NatDomains,
    views: &NatViews,
) -> Staged<BTreeMap<RouterId, IpAddr>> {
    let finder = PathFinder::new(model);
    let mut diagnostics = Diagnostics::new();
    let mut ips = BTreeMap::new();
    for router_id in model.managed_routers() {
        let router = model.router(router_id);
        let Some(host) = router.policy_distribution_point else {
            continue;
        };
        let host_zone = model.network(model.host(host).network).zone;
        let dist = finder.distances(Node::Router(router_id));
        let Some(path) = finder.walk(&dist, host_zone) else {
            diagnostics.warning(
                DiagKind::Distribution,
                format!(
                    "router:{} can't be reached from policy_distribution_point host:{}",
                    router.name,
                    model.host(host).name
                ),
            );
            continue;
        };
        let view = views.view(domains.of_zone(host_zone));
        let entry = path
            .hops
            .last()
            .and_then(|hop| model.interface(hop.in_intf).obj)
            .and_then(|obj| view.ip(obj))
            .map(|ip| ip.ip());
        match entry {
            Some(ip) => {
                ips.insert(router_id, ip);
            }
            None => match first_interface_ip(model, router_id) {
                Some((intf, ip)) => {
                    diagnostics.warning(
                        DiagKind::Distribution,
                        format!(
                            "router:{} is entered without IP address from host:{}, using interface:{}",
                            router.name,
                            model.host(host).name,
                            model.interface(intf).name
                        ),
                    );
                    ips.insert(router_id, ip);
                }
                None => diagnostics.warning(
                    DiagKind::Distribution,
                    format!("router:{} has no interface with IP address", router.name),
                ),
            },
        }
    }
    Staged::new(ips, diagnostics)
}

// ═══════════════════════════════════════════════════════════════════════════
// Primary / secondary
// ═══════════════════════════════════════════════════════════════════════════

const fn managed_rank(kind: Option<ManagedKind>) -> u8 {
    match kind {
        Some(ManagedKind::Full | ManagedKind::Local) => 0,
        Some(ManagedKind::Secondary) => 1,
        None => 2,
    }
}

/// Marks all but one path rule of each traffic flow as secondary.
///
/// The primary is, in order of preference, at the device the destination
/// is local to, at a fully managed device, closest to the destination, at
/// the lowest named device.
pub fn mark_secondary_rules(model: &Model, local: &LocalRouters, mut rules: Vec<PathRule>) -> Vec<PathRule> {
    let mut flows: BTreeMap<(RuleId, ObjId, ObjId, Prt, bool), Vec<usize>> = BTreeMap::new();
    for (index, r) in rules.iter().enumerate() {
        flows
            .entry((r.rule, r.src, r.dst, r.prt, r.reversed))
            .or_default()
            .push(index);
    }
    for members in flows.values() {
        let primary = members.iter().copied().min_by(|a, b| {
            let key = |i: usize| {
                let r = &rules[i];
                let device = model.router(r.device);
                (
                    !local.is_local(model, r.dst, r.device),
                    managed_rank(device.managed),
                    r.to_dst,
                    device.name.as_str(),
                )
            };
            key(*a).cmp(&key(*b))
        });
        for index in members {
            rules[*index].secondary = Some(*index) != primary;
        }
    }
    rules
}

// ═══════════════════════════════════════════════════════════════════════════
// Device configs
// ═══════════════════════════════════════════════════════════════════════════

/// Inputs of [`rules_distribution`] besides the rules.
pub struct Distribution<'a> {
    pub model: &'a Model,
    pub domains: &'a NatDomains,
    pub views: &'a NatViews,
    pub zone_subnets: &'a ZoneSubnets,
    pub routes: &'a ActiveRoutes,
    pub reroute: &'a ReroutePermits,
    pub distribution_ips: &'a BTreeMap<RouterId, IpAddr>,
}

impl Distribution<'_> {
    fn line(&self, device: &Router, r: &PathRule) -> Option<AclLine> {
        let model = self.model;
        let view = self.views.view(self.domains.of_interface(model, r.in_intf));
        // Deny lines are never widened.
        let coarse = r.secondary
            && r.action == Action::Permit
            && device.managed == Some(ManagedKind::Secondary);
        let (src, dst, prt) = if coarse {
            let subnets = self.zone_subnets;
            (subnets.network_of(model, r.src), subnets.network_of(model, r.dst), Prt::Ip)
        } else {
            (r.src, r.dst, r.prt)
        };
        let (Some(src_ip), Some(dst_ip)) = (view.ip(src), view.ip(dst)) else {
            debug!("Skipping path rule with invisible endpoint: {}", describe(model, r));
            return None;
        };
        Some(AclLine {
            action: r.action,
            src: src_ip,
            dst: dst_ip,
            prt,
            log: r.log,
            crypto: r.crypto.map(|c| c.side),
            secondary: r.secondary,
            comment: truncate_string(&describe(model, r), MAX_COMMENT_LEN),
        })
    }

    fn device(&self, router_id: RouterId, rules: &[&PathRule]) -> Option<DeviceConfig> {
        let model = self.model;
        let router = model.router(router_id);
        let managed = router.managed?;

        let mut interfaces: Vec<InterfaceId> = router.interfaces.clone();
        interfaces.sort_by(|a, b| model.interface(*a).name.cmp(&model.interface(*b).name));
        let mut acls = Vec::with_capacity(interfaces.len());
        for intf in interfaces {
            let mut at: Vec<&PathRule> = rules.iter().copied().filter(|r| r.in_intf == intf).collect();
            at.sort_by_key(|r| (r.action, r.rule));
            let mut seen = HashSet::new();
            let lines: Vec<AclLine> = at
                .into_iter()
                .filter_map(|r| self.line(router, r))
                .filter(|l| seen.insert((l.action, l.src, l.dst, l.prt, l.log, l.crypto)))
                .collect();
            let view = self.views.view(self.domains.of_interface(model, intf));
            let reroute_permit = self
                .reroute
                .of(intf)
                .iter()
                .filter_map(|obj| view.ip(*obj))
                .collect();
            acls.push(InterfaceAcl {
                interface: model.interface(intf).name.clone(),
                lines,
                reroute_permit,
            });
        }

        let referenced: BTreeSet<NetworkId> = rules
            .iter()
            .flat_map(|r| [r.src, r.dst])
            .filter_map(|o| model.obj(o).network)
            .collect();
        let routes = self
            .routes
            .of(router_id)
            .iter()
            .filter(|route| referenced.contains(&route.network))
            .map(|route| RouteLine {
                destination: route.dst,
                interface: model.interface(route.out_intf).name.clone(),
                next_hop: route.next_hop,
            })
            .collect();

        Some(DeviceConfig {
            name: router.name.clone(),
            model: router.model.clone(),
            managed,
            policy_distribution_ip: self.distribution_ips.get(&router_id).copied(),
            interfaces: acls,
            routes,
        })
    }
}

/// Assembles the config of every managed router, in router name order.
pub fn rules_distribution(dist: &Distribution<'_>, rules: &[PathRule]) -> Vec<DeviceConfig> {
    let mut by_device: BTreeMap<RouterId, Vec<&PathRule>> = BTreeMap::new();
    for r in rules {
        by_device.entry(r.device).or_default().push(r);
    }
    let devices: Vec<DeviceConfig> = dist
        .model
        .managed_routers()
        .into_par_iter()
        .filter_map(|router| {
            let rules = by_device.get(&router).map_or(&[][..], Vec::as_slice);
            dist.device(router, rules)
        })
        .collect();
    info!(
        "Distributed {} ACL lines to {} devices",
        devices.iter().map(DeviceConfig::line_count).sum::<usize>(),
        devices.len()
    );
    devices
}
