//! Policy object model
//!
//! The model is an arena: every object lives in one `Vec` of [`Model`] and
//! refers to other objects by integer handle. It is built once by
//! [`crate::core::import`] and read-only for the whole pipeline; stages
//! return derived data instead of mutating it.

use crate::core::service::Prt;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

macro_rules! arena_id {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(
                Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
            )]
            #[serde(transparent)]
            pub struct $name(pub u32);

            impl $name {
                pub const fn index(self) -> usize {
                    self.0 as usize
                }

                pub fn from_index(index: usize) -> Self {
                    Self(u32::try_from(index).unwrap_or(u32::MAX))
                }
            }
        )*
    };
}

arena_id!(
    ZoneId,
    NetworkId,
    /// Addressable rule endpoint (network, host subnet, interface, aggregate)
    ObjId,
    HostId,
    RouterId,
    InterfaceId,
    TunnelId,
    AreaId,
    GroupId,
    ServiceId,
    RuleId,
    /// NAT domain, assigned by [`crate::core::nat`]
    DomainId,
    /// Path between two zones, assigned by [`crate::core::expand`]
    PathId,
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    pub name: String,
    pub networks: Vec<NetworkId>,
    pub interfaces: Vec<InterfaceId>,
    pub aggregates: Vec<ObjId>,
    /// Set for the pseudo zone of a tunnel
    pub tunnel: Option<TunnelId>,
}

/// NAT definition of a network for one tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "ip", rename_all = "lowercase")]
pub enum NatDef {
    /// 1:1 translation into a block of the same size
    Static(IpNetwork),
    /// Many to few translation into an address pool
    Dynamic(IpNetwork),
    /// Network is invisible
    Hidden,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum NatKind {
    #[strum(serialize = "static")]
    Static,
    #[strum(serialize = "dynamic")]
    Dynamic,
    #[strum(serialize = "hidden")]
    Hidden,
}

impl NatDef {
    pub const fn kind(&self) -> NatKind {
        match self {
            NatDef::Static(_) => NatKind::Static,
            NatDef::Dynamic(_) => NatKind::Dynamic,
            NatDef::Hidden => NatKind::Hidden,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub name: String,
    pub ip: IpNetwork,
    pub zone: ZoneId,
    pub obj: ObjId,
    pub nat: BTreeMap<String, NatDef>,
    /// Declared enclosing network
    pub subnet_of: Option<NetworkId>,
    pub hosts: Vec<HostId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjKind {
    Network,
    /// CIDR block of one or more hosts
    Subnet,
    Interface(InterfaceId),
    /// `any:` object of a zone
    Aggregate,
}

impl ObjKind {
    /// Order of objects with identical address: the network encloses its
    /// subnets and interfaces.
    pub const fn rank(self) -> u8 {
        match self {
            ObjKind::Aggregate => 0,
            ObjKind::Network => 1,
            ObjKind::Subnet => 2,
            ObjKind::Interface(_) => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Obj {
    pub name: String,
    pub ip: IpNetwork,
    pub kind: ObjKind,
    pub zone: ZoneId,
    /// Network the object is part of (`None` for aggregates)
    pub network: Option<NetworkId>,
    /// Fixed translated address per NAT tag (static entry inside a dynamic pool)
    pub nat: BTreeMap<String, IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub name: String,
    pub network: NetworkId,
    pub subnets: Vec<ObjId>,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum ManagedKind {
    /// Filters all traffic passing through
    #[strum(serialize = "full")]
    Full,
    /// Coarse filtering when another device filters the same traffic
    #[strum(serialize = "secondary")]
    Secondary,
    /// Filters only traffic from or to its local networks
    #[strum(serialize = "local")]
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Router {
    pub name: String,
    pub managed: Option<ManagedKind>,
    /// Filters each direction separately
    pub stateless: bool,
    pub model: Option<String>,
    pub interfaces: Vec<InterfaceId>,
    pub policy_distribution_point: Option<HostId>,
}

impl Router {
    pub const fn is_managed(&self) -> bool {
        self.managed.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelEnd {
    pub tunnel: TunnelId,
    /// Physical interface carrying the encrypted traffic
    pub real: InterfaceId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    /// `router.name`
    pub name: String,
    pub router: RouterId,
    pub zone: ZoneId,
    pub network: Option<NetworkId>,
    pub ip: Option<IpAddr>,
    pub obj: Option<ObjId>,
    pub bind_nat: BTreeSet<String>,
    pub reroute_permit: Vec<ObjRef>,
    pub tunnel: Option<TunnelEnd>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    pub name: String,
    pub zone: ZoneId,
    /// Tunnel interfaces of both routers
    pub ends: [InterfaceId; 2],
    /// Protocol of the encrypted traffic
    pub transport: Prt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Area {
    pub name: String,
    pub zones: Vec<ZoneId>,
}

/// Typed reference to a rule endpoint or a group of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjRef {
    Network(NetworkId),
    Host(HostId),
    Interface(InterfaceId),
    Any(ObjId),
    Group(GroupId),
    Area(AreaId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    pub members: Vec<ObjRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    pub prts: Vec<Prt>,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    // Deny sorts first: deny lines precede permit lines in every ACL
    #[strum(serialize = "deny")]
    Deny,
    #[strum(serialize = "permit")]
    Permit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub name: String,
    pub action: Action,
    pub src: Vec<ObjRef>,
    pub dst: Vec<ObjRef>,
    pub service: ServiceId,
    pub owner: Option<String>,
    /// Tunnel the traffic must use
    pub tunnel: Option<TunnelId>,
    pub log: bool,
    /// Generate reverse rules even on stateful devices
    pub stateless: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Model {
    pub zones: Vec<Zone>,
    pub networks: Vec<Network>,
    pub objs: Vec<Obj>,
    pub hosts: Vec<Host>,
    pub routers: Vec<Router>,
    pub interfaces: Vec<Interface>,
    pub tunnels: Vec<Tunnel>,
    pub areas: Vec<Area>,
    pub groups: Vec<Group>,
    pub services: Vec<Service>,
    pub rules: Vec<Rule>,
    pub owners: Vec<String>,
}

impl Model {
    pub fn zone(&self, id: ZoneId) -> &Zone {
        &self.zones[id.index()]
    }

    pub fn network(&self, id: NetworkId) -> &Network {
        &self.networks[id.index()]
    }

    pub fn obj(&self, id: ObjId) -> &Obj {
        &self.objs[id.index()]
    }

    pub fn host(&self, id: HostId) -> &Host {
        &self.hosts[id.index()]
    }

    pub fn router(&self, id: RouterId) -> &Router {
        &self.routers[id.index()]
    }

    pub fn interface(&self, id: InterfaceId) -> &Interface {
        &self.interfaces[id.index()]
    }

    pub fn tunnel(&self, id: TunnelId) -> &Tunnel {
        &self.tunnels[id.index()]
    }

    pub fn area(&self, id: AreaId) -> &Area {
        &self.areas[id.index()]
    }

    pub fn group(&self, id: GroupId) -> &Group {
        &self.groups[id.index()]
    }

    pub fn service(&self, id: ServiceId) -> &Service {
        &self.services[id.index()]
    }

    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id.index()]
    }

    pub fn zone_ids(&self) -> impl Iterator<Item = ZoneId> + '_ {
        (0..self.zones.len()).map(ZoneId::from_index)
    }

    pub fn obj_ids(&self) -> impl Iterator<Item = ObjId> + '_ {
        (0..self.objs.len()).map(ObjId::from_index)
    }

    pub fn router_ids(&self) -> impl Iterator<Item = RouterId> + '_ {
        (0..self.routers.len()).map(RouterId::from_index)
    }

    pub fn rule_ids(&self) -> impl Iterator<Item = RuleId> + '_ {
        (0..self.rules.len()).map(RuleId::from_index)
    }

    pub fn network_ids(&self) -> impl Iterator<Item = NetworkId> + '_ {
        (0..self.networks.len()).map(NetworkId::from_index)
    }

    /// Managed routers in name order.
    pub fn managed_routers(&self) -> Vec<RouterId> {
        let mut ids: Vec<RouterId> = self
            .router_ids()
            .filter(|r| self.router(*r).is_managed())
            .collect();
        ids.sort_by(|a, b| self.router(*a).name.cmp(&self.router(*b).name));
        ids
    }

    pub fn is_tunnel_interface(&self, id: InterfaceId) -> bool {
        self.interface(id).tunnel.is_some()
    }

    /// The other tunnel interface of the tunnel `id` belongs to.
    pub fn tunnel_peer(&self, id: InterfaceId) -> Option<InterfaceId> {
        let end = self.interface(id).tunnel?;
        let [a, b] = self.tunnel(end.tunnel).ends;
        Some(if a == id { b } else { a })
    }

    pub fn find_obj(&self, name: &str) -> Option<ObjId> {
        self.objs
            .iter()
            .position(|o| o.name == name)
            .map(ObjId::from_index)
    }

    pub fn find_router(&self, name: &str) -> Option<RouterId> {
        self.routers
            .iter()
            .position(|r| r.name == name)
            .map(RouterId::from_index)
    }

    pub fn find_interface(&self, name: &str) -> Option<InterfaceId> {
        self.interfaces
            .iter()
            .position(|i| i.name == name)
            .map(InterfaceId::from_index)
    }

    pub fn find_zone(&self, name: &str) -> Option<ZoneId> {
        self.zones
            .iter()
            .position(|z| z.name == name)
            .map(ZoneId::from_index)
    }

    pub fn find_rule(&self, name: &str) -> Option<RuleId> {
        self.rules
            .iter()
            .position(|r| r.name == name)
            .map(RuleId::from_index)
    }

    /// Network object an endpoint is coarsened to on secondary devices.
    pub fn network_obj_of(&self, obj: ObjId) -> ObjId {
        self.obj(obj)
            .network
            .map_or(obj, |n| self.network(n).obj)
    }

    /// Printable name of a typed reference.
    pub fn ref_name(&self, r: ObjRef) -> String {
        match r {
            ObjRef::Network(id) => format!("network:{}", self.network(id).name),
            ObjRef::Host(id) => format!("host:{}", self.host(id).name),
            ObjRef::Interface(id) => format!("interface:{}", self.interface(id).name),
            ObjRef::Any(id) => self.obj(id).name.clone(),
            ObjRef::Group(id) => format!("group:{}", self.group(id).name),
            ObjRef::Area(id) => format!("area:{}", self.area(id).name),
        }
    }
}
