//! Active routes of managed routers
//!
//! Routes follow the same distance tables as rule paths, so every packet a
//! rule permits is routed along the path its rules were placed on.

use crate::core::diag::{DiagKind, Diagnostics, Staged};
use crate::core::model::{InterfaceId, Model, NetworkId, RouterId, ZoneId};
use crate::core::nat::NatDomains;
use crate::core::subnets::{AddressView, NatViews};
use crate::core::topology::{Distances, Node, PathFinder};
use ipnetwork::IpNetwork;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub network: NetworkId,
    /// Network address as seen behind the out interface
    pub dst: IpNetwork,
    pub out_intf: InterfaceId,
    pub next_hop: Option<IpAddr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveRoutes {
    pub by_router: BTreeMap<RouterId, Vec<Route>>,
}

impl ActiveRoutes {
    pub fn of(&self, router: RouterId) -> &[Route] {
        self.by_router.get(&router).map_or(&[], Vec::as_slice)
    }
}

fn router_routes(
    model: &Model,
    domains: &NatDomains,
    views: &NatViews,
    distances: &HashMap<ZoneId, Distances>,
    router: RouterId,
) -> Staged<Vec<Route>> {
    let finder = PathFinder::new(model);
    let mut diagnostics = Diagnostics::new();
    let attached: BTreeSet<ZoneId> = model
        .router(router)
        .interfaces
        .iter()
        .map(|i| model.interface(*i).zone)
        .collect();
    let mut routes = Vec::new();
    for (id, network) in model.network_ids().zip(&model.networks) {
        if attached.contains(&network.zone) {
            continue;
        }
        let Some(dist) = distances.get(&network.zone) else {
            continue;
        };
        let Some(out_intf) = finder.router_step(dist, router, None) else {
            continue;
        };
        let out = model.interface(out_intf);
        let view = views.view(domains.of_zone(out.zone));
        let Some(dst) = view.ip(network.obj) else {
            continue;
        };
        let next_hop = finder
            .zone_step(dist, out.zone)
            .and_then(|hop| model.interface(hop).obj)
            .and_then(|obj| view.ip(obj))
            .map(|ip| ip.ip());
        if next_hop.is_none() && !model.is_tunnel_interface(out_intf) {
            diagnostics.warning(
                DiagKind::Distribution,
                format!(
                    "No next hop address for network:{} at interface:{}",
                    network.name, out.name
                ),
            );
        }
        routes.push(Route {
            network: id,
            dst,
            out_intf,
            next_hop,
        });
    }
    Staged::new(routes, diagnostics)
}

/// Routes of every managed router towards every network not attached to it.
///
/// Hidden networks get no route.
pub fn find_active_routes(model: &Model, domains: &NatDomains, views: &NatViews) -> Staged<ActiveRoutes> {
    let finder = PathFinder::new(model);
    let zones: BTreeSet<ZoneId> = model.networks.iter().map(|n| n.zone).collect();
    let distances: HashMap<ZoneId, Distances> = zones
        .par_iter()
        .map(|z| (*z, finder.distances(Node::Zone(*z))))
        .collect();
    let results: Vec<(RouterId, Staged<Vec<Route>>)> = model
        .managed_routers()
        .into_par_iter()
        .map(|r| (r, router_routes(model, domains, views, &distances, r)))
        .collect();

    let mut diagnostics = Diagnostics::new();
    let mut routes = ActiveRoutes::default();
    for (router, staged) in results {
        routes.by_router.insert(router, diagnostics.absorb(staged));
    }
    info!(
        "Found {} active routes",
        routes.by_router.values().map(Vec::len).sum::<usize>()
    );
    Staged::new(routes, diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::nat::distribute_nat_info;
    use crate::core::subnets::find_subnets_in_nat_domain;
    use crate::core::test_helpers::{PolicyBuilder, two_zones};

    fn routes_of(builder: PolicyBuilder) -> (Model, Staged<ActiveRoutes>) {
        let model = builder.build();
        let domains = distribute_nat_info(&model).value;
        let views = find_subnets_in_nat_domain(&model, &domains).value;
        let routes = find_active_routes(&model, &domains, &views);
        (model, routes)
    }

    #[test]
    fn test_route_to_remote_network() {
        let (model, staged) = routes_of(
            two_zones()
                .network("n3", "10.3.3.0/24", "z3")
                .router("r2", None)
                .interface("r2", "e0", "n2", Some("10.2.2.2"))
                .interface("r2", "e1", "n3", Some("10.3.3.2")),
        );
        assert!(staged.diagnostics.is_empty());
        let r1 = model.find_router("r1").unwrap();
        let routes = staged.value.of(r1);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].dst, "10.3.3.0/24".parse::<IpNetwork>().unwrap());
        assert_eq!(routes[0].out_intf, model.find_interface("r1.e1").unwrap());
        assert_eq!(routes[0].next_hop, Some("10.2.2.2".parse().unwrap()));
    }

    #[test]
    fn test_route_uses_translated_address() {
        let (model, staged) = routes_of(
            two_zones()
                .network("n3", "10.3.3.0/24", "z3")
                .router("r2", None)
                .interface("r2", "e0", "n2", Some("10.2.2.2"))
                .interface("r2", "e1", "n3", Some("10.3.3.2"))
                .static_nat("n3", "x", "192.0.2.0/24")
                .bind_nat("r2", "e0", &["x"])
                .bind_nat("r1", "e1", &["x"]),
        );
        let r1 = model.find_router("r1").unwrap();
        assert_eq!(
            staged.value.of(r1)[0].dst,
            "192.0.2.0/24".parse::<IpNetwork>().unwrap()
        );
    }

    #[test]
    fn test_missing_next_hop_address_warns() {
        let (_, staged) = routes_of(
            two_zones()
                .network("n3", "10.3.3.0/24", "z3")
                .router("r2", None)
                .interface("r2", "e0", "n2", None)
                .interface("r2", "e1", "n3", Some("10.3.3.2")),
        );
        assert_eq!(staged.diagnostics.messages(DiagKind::Distribution).len(), 1);
    }
}
