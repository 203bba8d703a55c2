//! Subnet hierarchies per zone and per NAT domain
//!
//! - [`find_subnets_in_zone`]: containment of the original addresses inside
//!   each zone, with `subnet_of` checks
//! - [`find_subnets_in_nat_domain`]: translated address of every object and
//!   the containment hierarchy as seen from each NAT domain
//! - [`link_reroute_permit`]: resolves reroute permits to network objects
//!
//! The per domain results are the [`AddressView`]s later stages filter on.

use crate::config::{CheckLevel, CompilerConfig};
use crate::core::addr;
use crate::core::diag::{DiagKind, Diagnostics, Staged};
use crate::core::model::{DomainId, InterfaceId, Model, ObjId, ObjKind, ObjRef, ZoneId};
use crate::core::nat::{NatAddr, NatDomains, translate};
use ipnetwork::IpNetwork;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Address lookups of one enforcement context.
pub trait AddressView {
    /// Address to filter on, `None` if the object is invisible.
    fn ip(&self, obj: ObjId) -> Option<IpNetwork>;

    /// Object whose address is exactly `ip`, networks preferred.
    fn obj_at(&self, ip: &IpNetwork) -> Option<ObjId>;
}

/// Containment entry: object, address, rank among equal addresses.
type Entry = (ObjId, IpNetwork, u8);

/// Smallest enclosing object for each entry.
///
/// Among identical addresses the lower rank encloses the higher one.
fn build_hierarchy(mut entries: Vec<Entry>) -> (HashMap<ObjId, ObjId>, HashMap<IpNetwork, Vec<ObjId>>) {
    entries.sort_by(|a, b| {
        (a.1.prefix(), a.2, a.0).cmp(&(b.1.prefix(), b.2, b.0))
    });
    let mut by_ip: HashMap<IpNetwork, Vec<ObjId>> = HashMap::new();
    for (obj, ip, _) in &entries {
        by_ip.entry(*ip).or_default().push(*obj);
    }
    let mut up = HashMap::new();
    for (obj, ip, _) in &entries {
        let same = &by_ip[ip];
        let pos = same.iter().position(|o| o == obj).unwrap_or(0);
        if pos > 0 {
            up.insert(*obj, same[pos - 1]);
            continue;
        }
        for prefix in (0..ip.prefix()).rev() {
            if let Some(parent) = addr::supernet(ip, prefix)
                && let Some(list) = by_ip.get(&parent)
                && let Some(last) = list.last()
            {
                up.insert(*obj, *last);
                break;
            }
        }
    }
    (up, by_ip)
}

// ═══════════════════════════════════════════════════════════════════════════
// Zones
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZoneSubnets {
    up: Vec<Option<ObjId>>,
}

impl ZoneSubnets {
    /// Smallest enclosing object in the same zone.
    pub fn up(&self, obj: ObjId) -> Option<ObjId> {
        self.up.get(obj.index()).copied().flatten()
    }

    /// Network `obj` is part of, `obj` itself for networks and aggregates.
    pub fn network_of(&self, model: &Model, obj: ObjId) -> ObjId {
        let mut current = obj;
        loop {
            match model.obj(current).kind {
                ObjKind::Network | ObjKind::Aggregate => return current,
                _ => match self.up(current) {
                    Some(parent) => current = parent,
                    None => return model.network_obj_of(obj),
                },
            }
        }
    }
}

fn zone_entries(model: &Model, zone: ZoneId) -> Vec<Entry> {
    let mut entries = Vec::new();
    for net in &model.zone(zone).networks {
        let network = model.network(*net);
        entries.push((network.obj, network.ip, ObjKind::Network.rank()));
        for host in &network.hosts {
            for subnet in &model.host(*host).subnets {
                entries.push((*subnet, model.obj(*subnet).ip, ObjKind::Subnet.rank()));
            }
        }
    }
    for intf in &model.zone(zone).interfaces {
        if let Some(obj) = model.interface(*intf).obj {
            let o = model.obj(obj);
            entries.push((obj, o.ip, o.kind.rank()));
        }
    }
    entries.sort();
    entries.dedup();
    entries
}

fn zone_subnets(model: &Model, config: &CompilerConfig, zone: ZoneId) -> Staged<Vec<(ObjId, ObjId)>> {
    let mut diagnostics = Diagnostics::new();
    let zone_name = &model.zone(zone).name;
    let (up, by_ip) = build_hierarchy(zone_entries(model, zone));

    let mut duplicates: Vec<(&IpNetwork, Vec<ObjId>)> = by_ip
        .iter()
        .map(|(ip, objs)| {
            let nets: Vec<ObjId> = objs
                .iter()
                .copied()
                .filter(|o| model.obj(*o).kind == ObjKind::Network)
                .collect();
            (ip, nets)
        })
        .filter(|(_, nets)| nets.len() > 1)
        .collect();
    duplicates.sort();
    for (ip, nets) in duplicates {
        let names: Vec<&str> = nets.iter().map(|o| model.obj(*o).name.as_str()).collect();
        diagnostics.error(
            DiagKind::Subnet,
            format!("{} have identical address {ip} in zone:{zone_name}", names.join(" and ")),
        );
    }

    for net_id in &model.zone(zone).networks {
        let net = model.network(*net_id);
        if let Some(declared) = net.subnet_of {
            let parent = model.network(declared);
            if declared == *net_id || !addr::contains(&parent.ip, &net.ip) {
                diagnostics.error(
                    DiagKind::Subnet,
                    format!(
                        "network:{} is declared subnet_of network:{}, but its address {} isn't inside {}",
                        net.name, parent.name, net.ip, parent.ip
                    ),
                );
            }
            continue;
        }
        if config.check_subnets == CheckLevel::No {
            continue;
        }
        if let Some(enclosing) = up.get(&net.obj)
            && model.obj(*enclosing).kind == ObjKind::Network
        {
            diagnostics.report(
                config.check_subnets,
                DiagKind::Subnet,
                format!(
                    "network:{} is subnet of {} in zone:{zone_name}; if desired, declare attribute 'subnet_of'",
                    net.name,
                    model.obj(*enclosing).name
                ),
            );
        }
    }

    let mut pairs: Vec<(ObjId, ObjId)> = up.into_iter().collect();
    pairs.sort();
    Staged::new(pairs, diagnostics)
}

/// Builds the containment hierarchy of every zone.
pub fn find_subnets_in_zone(model: &Model, config: &CompilerConfig) -> Staged<ZoneSubnets> {
    let results: Vec<Staged<Vec<(ObjId, ObjId)>>> = model
        .zone_ids()
        .collect::<Vec<_>>()
        .par_iter()
        .map(|zone| zone_subnets(model, config, *zone))
        .collect();
    let mut diagnostics = Diagnostics::new();
    let mut up = vec![None; model.objs.len()];
    for staged in results {
        for (obj, parent) in diagnostics.absorb(staged) {
            up[obj.index()] = Some(parent);
        }
    }
    Staged::new(ZoneSubnets { up }, diagnostics)
}

// ═══════════════════════════════════════════════════════════════════════════
// NAT domains
// ═══════════════════════════════════════════════════════════════════════════

/// Every object as seen from one NAT domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatView {
    pub domain: DomainId,
    addrs: Vec<NatAddr>,
    up: Vec<Option<ObjId>>,
    by_ip: HashMap<IpNetwork, ObjId>,
}

impl NatView {
    pub fn addr(&self, obj: ObjId) -> NatAddr {
        self.addrs[obj.index()]
    }

    /// Smallest enclosing object by translated address.
    pub fn up(&self, obj: ObjId) -> Option<ObjId> {
        self.up.get(obj.index()).copied().flatten()
    }
}

impl AddressView for NatView {
    fn ip(&self, obj: ObjId) -> Option<IpNetwork> {
        self.addr(obj).ip()
    }

    fn obj_at(&self, ip: &IpNetwork) -> Option<ObjId> {
        self.by_ip.get(ip).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatViews {
    views: Vec<NatView>,
}

impl NatViews {
    pub fn view(&self, domain: DomainId) -> &NatView {
        &self.views[domain.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &NatView> {
        self.views.iter()
    }
}

fn nat_view(model: &Model, domains: &NatDomains, domain: DomainId) -> NatView {
    let addrs: Vec<NatAddr> = model
        .obj_ids()
        .map(|obj| translate(model, domains, obj, domain))
        .collect();
    let entries: Vec<Entry> = model
        .obj_ids()
        .filter(|o| model.obj(*o).kind != ObjKind::Aggregate)
        .filter_map(|o| addrs[o.index()].ip().map(|ip| (o, ip, model.obj(o).kind.rank())))
        .collect();
    let (up_map, by_ip_all) = build_hierarchy(entries);
    let mut up = vec![None; model.objs.len()];
    for (obj, parent) in up_map {
        up[obj.index()] = Some(parent);
    }
    let mut by_ip: HashMap<IpNetwork, ObjId> = by_ip_all
        .into_iter()
        .filter_map(|(ip, objs)| objs.first().map(|o| (ip, *o)))
        .collect();
    // Aggregates fill addresses no network object has
    for zone in &model.zones {
        for agg in &zone.aggregates {
            by_ip.entry(model.obj(*agg).ip).or_insert(*agg);
        }
    }
    NatView {
        domain,
        addrs,
        up,
        by_ip,
    }
}

/// Computes the address view of every NAT domain.
///
/// A subnet relation between two networks that holds in one domain but not
/// in another is a warning.
pub fn find_subnets_in_nat_domain(model: &Model, domains: &NatDomains) -> Staged<NatViews> {
    let ids: Vec<DomainId> = domains.ids().collect();
    let views: Vec<NatView> = ids
        .par_iter()
        .map(|d| nat_view(model, domains, *d))
        .collect();
    debug!("Computed {} NAT domain views", views.len());

    let mut diagnostics = Diagnostics::new();
    let mut reported = BTreeSet::new();
    for view in &views {
        for net in &model.networks {
            let Some(parent) = view.up(net.obj) else {
                continue;
            };
            if model.obj(parent).kind != ObjKind::Network || reported.contains(&(net.obj, parent)) {
                continue;
            }
            for other in &views {
                if let (Some(child_ip), Some(parent_ip)) = (other.ip(net.obj), other.ip(parent))
                    && !addr::contains(&parent_ip, &child_ip)
                {
                    diagnostics.warning(
                        DiagKind::Subnet,
                        format!(
                            "network:{} is subnet of {} in {}, but not in {}",
                            net.name,
                            model.obj(parent).name,
                            domains.domain(view.domain).name,
                            domains.domain(other.domain).name
                        ),
                    );
                    reported.insert((net.obj, parent));
                    break;
                }
            }
        }
    }
    Staged::new(NatViews { views }, diagnostics)
}

// ═══════════════════════════════════════════════════════════════════════════
// Reroute permits
// ═══════════════════════════════════════════════════════════════════════════

/// Networks that may be rerouted back through the interface they came in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReroutePermits {
    pub by_interface: BTreeMap<InterfaceId, Vec<ObjId>>,
}

impl ReroutePermits {
    pub fn of(&self, intf: InterfaceId) -> &[ObjId] {
        self.by_interface.get(&intf).map_or(&[], Vec::as_slice)
    }
}

/// Resolves `reroute_permit` references to network objects of the
/// interface's zone.
pub fn link_reroute_permit(model: &Model) -> Staged<ReroutePermits> {
    let mut diagnostics = Diagnostics::new();
    let mut permits = ReroutePermits::default();
    for (index, intf) in model.interfaces.iter().enumerate() {
        if intf.reroute_permit.is_empty() {
            continue;
        }
        if !model.router(intf.router).is_managed() {
            diagnostics.warning(
                DiagKind::Reroute,
                format!("Ignoring reroute_permit at unmanaged interface:{}", intf.name),
            );
            continue;
        }
        let mut objs = Vec::new();
        for r in &intf.reroute_permit {
            match *r {
                ObjRef::Network(net) if model.network(net).zone == intf.zone => {
                    objs.push(model.network(net).obj);
                }
                ObjRef::Network(net) => diagnostics.error(
                    DiagKind::Reroute,
                    format!(
                        "network:{} of reroute_permit isn't in the zone of interface:{}",
                        model.network(net).name,
                        intf.name
                    ),
                ),
                other => diagnostics.error(
                    DiagKind::Reroute,
                    format!(
                        "reroute_permit of interface:{} must reference networks, not {}",
                        intf.name,
                        model.ref_name(other)
                    ),
                ),
            }
        }
        objs.sort();
        objs.dedup();
        permits
            .by_interface
            .insert(InterfaceId::from_index(index), objs);
    }
    Staged::new(permits, diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::nat::distribute_nat_info;
    use crate::core::test_helpers::{PolicyBuilder, two_zones};

    fn supernet_zone() -> PolicyBuilder {
        two_zones()
            .network("sup", "10.0.0.0/23", "z2")
            .network("lo", "10.0.0.0/24", "z2")
            .network("hi", "10.0.1.0/24", "z2")
    }

    #[test]
    fn test_zone_hierarchy() {
        let model = supernet_zone()
            .subnet_of("lo", "sup")
            .subnet_of("hi", "sup")
            .host("lo", "h", "10.0.0.9")
            .build();
        let staged = find_subnets_in_zone(&model, &CompilerConfig::default());
        assert!(staged.diagnostics.is_empty(), "{:?}", staged.diagnostics);
        let sup = model.find_obj("network:sup").unwrap();
        let lo = model.find_obj("network:lo").unwrap();
        let h = model.find_obj("host:h").unwrap();
        assert_eq!(staged.value.up(lo), Some(sup));
        assert_eq!(staged.value.up(h), Some(lo));
        assert_eq!(staged.value.up(sup), None);
        assert_eq!(staged.value.network_of(&model, h), lo);
        assert_eq!(staged.value.network_of(&model, lo), lo);
    }

    #[test]
    fn test_undeclared_subnet_reported_at_level() {
        let model = supernet_zone().build();
        let warn = find_subnets_in_zone(&model, &CompilerConfig::default());
        assert_eq!(warn.diagnostics.warning_count(), 2);

        let config = CompilerConfig {
            check_subnets: CheckLevel::Err,
            ..CompilerConfig::default()
        };
        let err = find_subnets_in_zone(&model, &config);
        assert_eq!(err.diagnostics.error_count(), 2);

        let config = CompilerConfig {
            check_subnets: CheckLevel::No,
            ..CompilerConfig::default()
        };
        assert!(find_subnets_in_zone(&model, &config).diagnostics.is_empty());
    }

    #[test]
    fn test_wrong_subnet_of_is_error() {
        let model = supernet_zone()
            .subnet_of("lo", "hi")
            .subnet_of("hi", "sup")
            .build();
        let staged = find_subnets_in_zone(&model, &CompilerConfig::default());
        assert_eq!(staged.diagnostics.error_count(), 1);
    }

    #[test]
    fn test_identical_networks_in_zone() {
        let model = two_zones().network("dup", "10.2.2.0/24", "z2").build();
        let staged = find_subnets_in_zone(&model, &CompilerConfig::default());
        let messages = staged.diagnostics.messages(DiagKind::Subnet);
        assert!(messages.iter().any(|m| m.contains("identical address")));
        assert!(staged.diagnostics.has_errors());
    }

    #[test]
    fn test_nat_view_translates_and_indexes() {
        let model = two_zones()
            .static_nat("n1", "x", "192.0.2.0/24")
            .host("n1", "h", "10.1.1.7")
            .bind_nat("r1", "e1", &["x"])
            .build();
        let domains = distribute_nat_info(&model).value;
        let views = find_subnets_in_nat_domain(&model, &domains).value;
        let outside = views.view(domains.of_zone(model.find_zone("z2").unwrap()));
        let n1 = model.find_obj("network:n1").unwrap();
        let h = model.find_obj("host:h").unwrap();
        assert_eq!(outside.ip(h), Some("192.0.2.7/32".parse().unwrap()));
        assert_eq!(outside.up(h), Some(n1));
        assert_eq!(outside.obj_at(&"192.0.2.0/24".parse().unwrap()), Some(n1));
        assert_eq!(outside.obj_at(&"10.1.1.0/24".parse().unwrap()), None);
    }

    #[test]
    fn test_subnet_relation_lost_by_nat_warns() {
        let model = supernet_zone()
            .subnet_of("lo", "sup")
            .subnet_of("hi", "sup")
            .static_nat("lo", "x", "192.0.2.0/24")
            .bind_nat("r1", "e0", &["x"])
            .build();
        let domains = distribute_nat_info(&model).value;
        let staged = find_subnets_in_nat_domain(&model, &domains);
        let messages = staged.diagnostics.messages(DiagKind::Subnet);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("network:lo is subnet of network:sup"));
    }

    #[test]
    fn test_reroute_permit_must_be_in_zone() {
        let model = two_zones()
            .reroute_permit("r1", "e0", &["network:n1", "network:n2"])
            .build();
        let staged = link_reroute_permit(&model);
        assert_eq!(staged.diagnostics.error_count(), 1);
        let e0 = model.find_interface("r1.e0").unwrap();
        assert_eq!(staged.value.of(e0), &[model.find_obj("network:n1").unwrap()]);
    }

    #[test]
    fn test_reroute_permit_rejects_groups() {
        let model = two_zones()
            .group("g", &["network:n1"])
            .reroute_permit("r1", "e0", &["group:g"])
            .build();
        let staged = link_reroute_permit(&model);
        assert!(staged.diagnostics.messages(DiagKind::Reroute)[0].contains("group:g"));
    }
}
