//! NAT domains and address translation
//!
//! A NAT domain is a maximal set of zones that see every network the same
//! way. Domains are found by flood fill: a router is crossed from interface
//! `i` to interface `j` only if both bind the same NAT tags. The tags bound
//! at the interfaces attached to a domain are the tags active in it.
//!
//! [`translate`] is the single place that decides how an object is seen
//! from a domain; every later stage goes through it.

use crate::core::addr;
use crate::core::diag::{DiagKind, Diagnostics, Staged};
use crate::core::model::{
    DomainId, InterfaceId, Model, NatDef, NatKind, NetworkId, ObjId, ObjKind, ZoneId,
};
use ipnetwork::IpNetwork;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatDomain {
    pub name: String,
    pub zones: Vec<ZoneId>,
    /// Tags consistently bound at all interfaces of the domain
    pub active: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatDomains {
    pub domains: Vec<NatDomain>,
    zone_domain: Vec<DomainId>,
    /// Translation type of every defined tag
    pub nat_types: BTreeMap<String, NatKind>,
    /// Tags with contradictory bindings, ignored during translation
    pub excluded: BTreeSet<String>,
}

impl NatDomains {
    pub fn domain(&self, id: DomainId) -> &NatDomain {
        &self.domains[id.index()]
    }

    pub fn ids(&self) -> impl Iterator<Item = DomainId> + '_ {
        (0..self.domains.len()).map(DomainId::from_index)
    }

    pub fn of_zone(&self, zone: ZoneId) -> DomainId {
        self.zone_domain[zone.index()]
    }

    pub fn of_interface(&self, model: &Model, intf: InterfaceId) -> DomainId {
        self.of_zone(model.interface(intf).zone)
    }
}

/// Address of an object as seen from one NAT domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", content = "ip", rename_all = "lowercase")]
pub enum NatAddr {
    Original(IpNetwork),
    Static(IpNetwork),
    /// Pool address of a dynamically translated object
    Dynamic(IpNetwork),
    Hidden,
}

impl NatAddr {
    /// Address to filter on, `None` if hidden.
    pub const fn ip(&self) -> Option<IpNetwork> {
        match self {
            NatAddr::Original(ip) | NatAddr::Static(ip) | NatAddr::Dynamic(ip) => Some(*ip),
            NatAddr::Hidden => None,
        }
    }

    pub const fn is_translated(&self) -> bool {
        !matches!(self, NatAddr::Original(_))
    }
}

/// Active NAT definition of a network in a domain, first tag in name order.
fn active_nat<'m>(
    model: &'m Model,
    domains: &NatDomains,
    network: NetworkId,
    domain: DomainId,
) -> Option<(&'m str, &'m NatDef)> {
    let active = &domains.domain(domain).active;
    model
        .network(network)
        .nat
        .iter()
        .find(|(tag, _)| active.contains(*tag) && !domains.excluded.contains(*tag))
        .map(|(tag, def)| (tag.as_str(), def))
}

/// Address of `obj` as seen from `domain`.
///
/// Pure function of its arguments.
pub fn translate(model: &Model, domains: &NatDomains, obj: ObjId, domain: DomainId) -> NatAddr {
    let o = model.obj(obj);
    let Some(network) = o.network else {
        return NatAddr::Original(o.ip);
    };
    let Some((tag, def)) = active_nat(model, domains, network, domain) else {
        return NatAddr::Original(o.ip);
    };
    let net_ip = model.network(network).ip;
    match def {
        NatDef::Static(target) => match o.kind {
            ObjKind::Network => NatAddr::Static(*target),
            _ => addr::translate_static(&o.ip, &net_ip, target)
                .map_or(NatAddr::Hidden, NatAddr::Static),
        },
        NatDef::Dynamic(pool) => match o.nat.get(tag) {
            Some(ip) => NatAddr::Static(addr::host_net(*ip)),
            None => NatAddr::Dynamic(*pool),
        },
        NatDef::Hidden => NatAddr::Hidden,
    }
}

/// Partitions the zones into NAT domains and derives the NAT type table.
pub fn distribute_nat_info(model: &Model) -> Staged<NatDomains> {
    let mut diagnostics = Diagnostics::new();
    let unassigned = DomainId(u32::MAX);
    let mut zone_domain = vec![unassigned; model.zones.len()];
    let mut domains = Vec::new();
    let mut excluded = BTreeSet::new();

    for start in model.zone_ids() {
        if zone_domain[start.index()] != unassigned {
            continue;
        }
        let id = DomainId::from_index(domains.len());
        let mut zones = Vec::new();
        let mut queue = VecDeque::from([start]);
        zone_domain[start.index()] = id;
        while let Some(zone) = queue.pop_front() {
            zones.push(zone);
            for i in &model.zone(zone).interfaces {
                let intf = model.interface(*i);
                for j in &model.router(intf.router).interfaces {
                    let other = model.interface(*j);
                    if j == i || other.bind_nat != intf.bind_nat {
                        continue;
                    }
                    if zone_domain[other.zone.index()] == unassigned {
                        zone_domain[other.zone.index()] = id;
                        queue.push_back(other.zone);
                    }
                }
            }
        }
        zones.sort();

        // Tags bound at the interfaces attached to this domain
        let attached: Vec<InterfaceId> = zones
            .iter()
            .flat_map(|z| model.zone(*z).interfaces.iter().copied())
            .collect();
        let mut union = BTreeSet::new();
        for i in &attached {
            union.extend(model.interface(*i).bind_nat.iter().cloned());
        }
        let name = format!("nat_domain:{}", model.zone(zones[0]).name);
        let mut active = BTreeSet::new();
        for tag in union {
            let missing = attached
                .iter()
                .find(|i| !model.interface(**i).bind_nat.contains(&tag));
            match missing {
                None => {
                    active.insert(tag);
                }
                Some(without) => {
                    let with = attached
                        .iter()
                        .find(|i| model.interface(**i).bind_nat.contains(&tag))
                        .copied()
                        .unwrap_or(*without);
                    diagnostics.error(
                        DiagKind::Topology,
                        format!(
                            "Inconsistent NAT in {name}: nat:{tag} is bound at interface:{} but not at interface:{}",
                            model.interface(with).name,
                            model.interface(*without).name
                        ),
                    );
                    excluded.insert(tag);
                }
            }
        }
        debug!("{name}: {} zones, active tags {:?}", zones.len(), active);
        domains.push(NatDomain {
            name,
            zones,
            active,
        });
    }

    let nat_types = nat_type_table(model, &mut diagnostics);
    let result = NatDomains {
        domains,
        zone_domain,
        nat_types,
        excluded,
    };
    check_nat_definitions(model, &result, &mut diagnostics);
    Staged::new(result, diagnostics)
}

/// Maps every tag to its translation type; dynamic wins over static.
fn nat_type_table(model: &Model, diagnostics: &mut Diagnostics) -> BTreeMap<String, NatKind> {
    let mut kinds: BTreeMap<String, BTreeSet<NatKind>> = BTreeMap::new();
    for net in &model.networks {
        for (tag, def) in &net.nat {
            kinds.entry(tag.clone()).or_default().insert(def.kind());
        }
    }
    kinds
        .into_iter()
        .map(|(tag, set)| {
            let kind = if set.contains(&NatKind::Hidden) {
                if set.len() > 1 {
                    diagnostics.error(
                        DiagKind::Nat,
                        format!("nat:{tag} is used as hidden and as non hidden NAT"),
                    );
                }
                NatKind::Hidden
            } else if set.contains(&NatKind::Dynamic) {
                NatKind::Dynamic
            } else {
                NatKind::Static
            };
            (tag, kind)
        })
        .collect()
}

fn check_nat_definitions(model: &Model, domains: &NatDomains, diagnostics: &mut Diagnostics) {
    let mut bound = BTreeSet::new();
    for intf in &model.interfaces {
        bound.extend(intf.bind_nat.iter().cloned());
    }
    for tag in &bound {
        if !domains.nat_types.contains_key(tag) {
            diagnostics.warning(
                DiagKind::Nat,
                format!("nat:{tag} is bound, but not defined for any network"),
            );
        }
    }
    for tag in domains.nat_types.keys() {
        if !bound.contains(tag) {
            diagnostics.warning(DiagKind::Nat, format!("nat:{tag} is defined, but not bound"));
        }
    }

    for (id, net) in model.network_ids().zip(&model.networks) {
        for (tag, def) in &net.nat {
            if let NatDef::Static(target) = def
                && target.prefix() != net.ip.prefix()
            {
                diagnostics.error(
                    DiagKind::Nat,
                    format!(
                        "Static nat:{tag} of network:{} must have the same prefix length as {}",
                        net.name, net.ip
                    ),
                );
            }
        }
        let own = domains.of_zone(net.zone);
        if let Some((tag, _)) = active_nat(model, domains, id, own) {
            diagnostics.warning(
                DiagKind::Nat,
                format!(
                    "network:{} is translated by nat:{tag} in its own {}",
                    net.name,
                    domains.domain(own).name
                ),
            );
        }
        for domain in &domains.domains {
            let tags: Vec<&String> = net
                .nat
                .keys()
                .filter(|t| domain.active.contains(*t))
                .collect();
            if tags.len() > 1 {
                diagnostics.error(
                    DiagKind::Nat,
                    format!(
                        "network:{} has multiple NAT tags active in {}: {}",
                        net.name,
                        domain.name,
                        tags.iter()
                            .map(|t| format!("nat:{t}"))
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                );
            }
        }
    }
}
