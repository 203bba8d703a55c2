//! Zone / router graph and path finding
//!
//! The topology is a bipartite graph: zones and routers are nodes, every
//! interface is an edge between its router and its zone. Paths are found
//! with breadth-first distance tables towards a target node and then walked
//! greedily from the start, which makes every choice among equal-cost
//! alternatives explicit:
//!
//! - fewest hops
//! - from a zone, the router with the lowest name (then lowest interface name)
//! - from a router, tunnel pseudo zones first, then the lowest interface name
//!
//! Rule paths and active routes both use [`Distances`], so they always agree.

use crate::core::diag::{DiagKind, Diagnostics, Staged};
use crate::core::model::{InterfaceId, Model, RouterId, ZoneId};
use std::collections::{HashMap, VecDeque};

/// Node of the topology graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Node {
    Zone(ZoneId),
    Router(RouterId),
}

/// One router passed on a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hop {
    pub router: RouterId,
    pub in_intf: InterfaceId,
    /// `None` if the path ends at this router
    pub out_intf: Option<InterfaceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Path {
    pub hops: Vec<Hop>,
    /// Zones in path order, start and end included
    pub zones: Vec<ZoneId>,
}

impl Path {
    /// Returns `true` if the path enters or leaves a router through `intf`.
    pub fn uses_interface(&self, intf: InterfaceId) -> bool {
        self.hops
            .iter()
            .any(|h| h.in_intf == intf || h.out_intf == Some(intf))
    }
}

/// Hop counts of every node towards one target node.
#[derive(Debug, Clone)]
pub struct Distances {
    target: Node,
    zones: Vec<Option<u32>>,
    routers: Vec<Option<u32>>,
}

impl Distances {
    pub fn target(&self) -> Node {
        self.target
    }

    pub fn of(&self, node: Node) -> Option<u32> {
        match node {
            Node::Zone(z) => self.zones.get(z.index()).copied().flatten(),
            Node::Router(r) => self.routers.get(r.index()).copied().flatten(),
        }
    }
}

/// Path computations over a read-only model.
pub struct PathFinder<'a> {
    model: &'a Model,
}

impl<'a> PathFinder<'a> {
    pub fn new(model: &'a Model) -> Self {
        Self { model }
    }

    /// Breadth-first hop counts towards `target`.
    pub fn distances(&self, target: Node) -> Distances {
        let model = self.model;
        let mut dist = Distances {
            target,
            zones: vec![None; model.zones.len()],
            routers: vec![None; model.routers.len()],
        };
        let mut queue = VecDeque::new();
        set(&mut dist, target, 0);
        queue.push_back(target);
        while let Some(node) = queue.pop_front() {
            let d = dist.of(node).unwrap_or(0) + 1;
            let neighbors: Vec<Node> = match node {
                Node::Zone(z) => model
                    .zone(z)
                    .interfaces
                    .iter()
                    .map(|i| Node::Router(model.interface(*i).router))
                    .collect(),
                Node::Router(r) => model
                    .router(r)
                    .interfaces
                    .iter()
                    .map(|i| Node::Zone(model.interface(*i).zone))
                    .collect(),
            };
            for next in neighbors {
                if dist.of(next).is_none() {
                    set(&mut dist, next, d);
                    queue.push_back(next);
                }
            }
        }
        dist
    }

    /// Interface of `zone` leading to the next router towards the target.
    pub fn zone_step(&self, dist: &Distances, zone: ZoneId) -> Option<InterfaceId> {
        let model = self.model;
        let here = dist.of(Node::Zone(zone))?;
        if here == 0 {
            return None;
        }
        model
            .zone(zone)
            .interfaces
            .iter()
            .copied()
            .filter(|i| dist.of(Node::Router(model.interface(*i).router)) == Some(here - 1))
            .min_by(|a, b| {
                let (ia, ib) = (model.interface(*a), model.interface(*b));
                model
                    .router(ia.router)
                    .name
                    .cmp(&model.router(ib.router).name)
                    .then_with(|| ia.name.cmp(&ib.name))
            })
    }

    /// Interface of `router` leading to the next zone towards the target,
    /// never leaving through `in_intf`.
    pub fn router_step(
        &self,
        dist: &Distances,
        router: RouterId,
        in_intf: Option<InterfaceId>,
    ) -> Option<InterfaceId> {
        let model = self.model;
        let here = dist.of(Node::Router(router))?;
        if here == 0 {
            return None;
        }
        model
            .router(router)
            .interfaces
            .iter()
            .copied()
            .filter(|i| Some(*i) != in_intf)
            .filter(|i| dist.of(Node::Zone(model.interface(*i).zone)) == Some(here - 1))
            .min_by(|a, b| {
                let (ia, ib) = (model.interface(*a), model.interface(*b));
                let tunnel_a = model.zone(ia.zone).tunnel.is_none();
                let tunnel_b = model.zone(ib.zone).tunnel.is_none();
                tunnel_a.cmp(&tunnel_b).then_with(|| ia.name.cmp(&ib.name))
            })
    }

    /// Walks from `start` towards the target of `dist`.
    ///
    /// Returns `None` if the target is unreachable.
    pub fn walk(&self, dist: &Distances, start: ZoneId) -> Option<Path> {
        let model = self.model;
        dist.of(Node::Zone(start))?;
        let mut path = Path {
            hops: Vec::new(),
            zones: vec![start],
        };
        let mut zone = start;
        loop {
            if dist.target() == Node::Zone(zone) {
                return Some(path);
            }
            let in_intf = self.zone_step(dist, zone)?;
            let router = model.interface(in_intf).router;
            if dist.target() == Node::Router(router) {
                path.hops.push(Hop {
                    router,
                    in_intf,
                    out_intf: None,
                });
                return Some(path);
            }
            let out_intf = self.router_step(dist, router, Some(in_intf))?;
            path.hops.push(Hop {
                router,
                in_intf,
                out_intf: Some(out_intf),
            });
            zone = model.interface(out_intf).zone;
            path.zones.push(zone);
        }
    }

    pub fn path(&self, from: ZoneId, to: ZoneId) -> Option<Path> {
        self.walk(&self.distances(Node::Zone(to)), from)
    }
}

fn set(dist: &mut Distances, node: Node, value: u32) {
    match node {
        Node::Zone(z) => dist.zones[z.index()] = Some(value),
        Node::Router(r) => dist.routers[r.index()] = Some(value),
    }
}

/// A managed router must not have two interfaces in the same zone, its
/// filter couldn't tell the directions apart.
pub fn check_topology(model: &Model) -> Staged<()> {
    let mut diagnostics = Diagnostics::new();
    for router in &model.routers {
        if !router.is_managed() {
            continue;
        }
        let mut seen: HashMap<ZoneId, InterfaceId> = HashMap::new();
        for intf in &router.interfaces {
            let zone = model.interface(*intf).zone;
            if let Some(other) = seen.insert(zone, *intf) {
                diagnostics.error(
                    DiagKind::Topology,
                    format!(
                        "interface:{} and interface:{} of router:{} are both connected to zone:{}",
                        model.interface(other).name,
                        model.interface(*intf).name,
                        router.name,
                        model.zone(zone).name
                    ),
                );
            }
        }
    }
    Staged::new((), diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::PolicyBuilder;

    /// n1 - r1 - n2 - r2 - n3, plus a parallel r3 between n2 and n3
    fn chain() -> Model {
        PolicyBuilder::new()
            .network("n1", "10.1.0.0/24", "z1")
            .network("n2", "10.2.0.0/24", "z2")
            .network("n3", "10.3.0.0/24", "z3")
            .router("r1", Some("full"))
            .interface("r1", "e0", "n1", Some("10.1.0.1"))
            .interface("r1", "e1", "n2", Some("10.2.0.1"))
            .router("r3", Some("full"))
            .interface("r3", "e0", "n2", Some("10.2.0.3"))
            .interface("r3", "e1", "n3", Some("10.3.0.3"))
            .router("r2", Some("full"))
            .interface("r2", "e0", "n2", Some("10.2.0.2"))
            .interface("r2", "e1", "n3", Some("10.3.0.2"))
            .build()
    }

    #[test]
    fn test_path_hops_and_zones() {
        let model = chain();
        let finder = PathFinder::new(&model);
        let z1 = model.find_zone("z1").unwrap();
        let z3 = model.find_zone("z3").unwrap();
        let path = finder.path(z1, z3).unwrap();
        assert_eq!(path.hops.len(), 2);
        assert_eq!(path.zones.len(), 3);
        assert_eq!(model.router(path.hops[0].router).name, "r1");
    }

    #[test]
    fn test_equal_cost_prefers_lowest_router_name() {
        let model = chain();
        let finder = PathFinder::new(&model);
        let z1 = model.find_zone("z1").unwrap();
        let z3 = model.find_zone("z3").unwrap();
        let path = finder.path(z1, z3).unwrap();
        // r2 and r3 both connect z2 with z3
        assert_eq!(model.router(path.hops[1].router).name, "r2");
        let again = finder.path(z1, z3).unwrap();
        assert_eq!(path, again);
    }

    #[test]
    fn test_path_to_router_ends_with_open_hop() {
        let model = chain();
        let finder = PathFinder::new(&model);
        let z1 = model.find_zone("z1").unwrap();
        let r2 = model.find_router("r2").unwrap();
        let path = finder.walk(&finder.distances(Node::Router(r2)), z1).unwrap();
        let last = path.hops.last().unwrap();
        assert_eq!(last.router, r2);
        assert_eq!(last.out_intf, None);
    }

    #[test]
    fn test_same_zone_path_is_empty() {
        let model = chain();
        let finder = PathFinder::new(&model);
        let z2 = model.find_zone("z2").unwrap();
        let path = finder.path(z2, z2).unwrap();
        assert!(path.hops.is_empty());
        assert_eq!(path.zones, vec![z2]);
    }

    #[test]
    fn test_unreachable_zone() {
        let model = PolicyBuilder::new()
            .network("n1", "10.1.0.0/24", "z1")
            .network("n2", "10.2.0.0/24", "z2")
            .build();
        let finder = PathFinder::new(&model);
        let path = finder.path(
            model.find_zone("z1").unwrap(),
            model.find_zone("z2").unwrap(),
        );
        assert!(path.is_none());
    }

    #[test]
    fn test_managed_router_twice_in_zone_is_error() {
        let model = PolicyBuilder::new()
            .network("n1", "10.1.0.0/24", "z1")
            .network("n2", "10.2.0.0/24", "z1")
            .router("r1", Some("full"))
            .interface("r1", "e0", "n1", Some("10.1.0.1"))
            .interface("r1", "e1", "n2", Some("10.2.0.1"))
            .build();
        let staged = check_topology(&model);
        assert_eq!(staged.diagnostics.error_count(), 1);
        assert!(staged.diagnostics.has_fatal_errors());
    }
}
