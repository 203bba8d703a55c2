//! Policy model import
//!
//! Reads the JSON policy document produced by the external policy parser and
//! resolves every name into an arena handle. Anything the pipeline cannot
//! work with (dangling or duplicate names, addresses outside their network,
//! mixed address families) is a hard [`Error::Import`]; policy level findings
//! are left to the pipeline stages.

use crate::core::addr;
use crate::core::error::{Error, Result};
use crate::core::model::{
    Action, Area, AreaId, Group, GroupId, Host, HostId, Interface, InterfaceId, ManagedKind, Model,
    NatDef, Network, NetworkId, Obj, ObjId, ObjKind, ObjRef, Router, RouterId, Rule, Service,
    ServiceId, Tunnel, TunnelEnd, TunnelId, Zone, ZoneId,
};
use crate::core::service::Prt;
use crate::validators::{
    RefType, parse_typed_name, validate_device_name, validate_nat_tag, validate_object_name,
};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use tracing::info;

// ═══════════════════════════════════════════════════════════════════════════
// Input document
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyInput {
    #[serde(default)]
    pub networks: Vec<NetworkInput>,
    #[serde(default)]
    pub aggregates: Vec<AggregateInput>,
    #[serde(default)]
    pub areas: Vec<AreaInput>,
    #[serde(default)]
    pub routers: Vec<RouterInput>,
    #[serde(default)]
    pub tunnels: Vec<TunnelInput>,
    #[serde(default)]
    pub groups: Vec<GroupInput>,
    #[serde(default)]
    pub services: Vec<ServiceInput>,
    #[serde(default)]
    pub rules: Vec<RuleInput>,
    #[serde(default)]
    pub owners: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkInput {
    pub name: String,
    pub ip: IpNetwork,
    pub zone: String,
    #[serde(default)]
    pub nat: BTreeMap<String, NatDef>,
    #[serde(default)]
    pub subnet_of: Option<String>,
    #[serde(default)]
    pub hosts: Vec<HostInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostInput {
    pub name: String,
    #[serde(default)]
    pub ip: Option<IpAddr>,
    /// Inclusive address range, split into CIDR blocks
    #[serde(default)]
    pub range: Option<[IpAddr; 2]>,
    /// Fixed address inside a dynamic NAT pool
    #[serde(default)]
    pub nat: BTreeMap<String, IpAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregateInput {
    pub name: String,
    pub zone: String,
    /// Defaults to the whole IPv4 address space
    #[serde(default)]
    pub ip: Option<IpNetwork>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AreaInput {
    pub name: String,
    pub zones: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterInput {
    pub name: String,
    #[serde(default)]
    pub managed: Option<ManagedKind>,
    #[serde(default)]
    pub stateless: bool,
    #[serde(default)]
    pub model: Option<String>,
    /// Host name
    #[serde(default)]
    pub policy_distribution_point: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<InterfaceInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceInput {
    /// Short name, the full name is `router.name`
    pub name: String,
    pub network: String,
    #[serde(default)]
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub bind_nat: Vec<String>,
    #[serde(default)]
    pub reroute_permit: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelInput {
    pub name: String,
    pub ends: [TunnelEndInput; 2],
    /// Protocol of the encrypted traffic, `proto 50` if omitted
    #[serde(default)]
    pub transport: Option<Prt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelEndInput {
    pub router: String,
    /// Short name of the physical interface
    pub real: String,
    #[serde(default)]
    pub bind_nat: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupInput {
    pub name: String,
    #[serde(default)]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceInput {
    pub name: String,
    pub prts: Vec<Prt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleInput {
    pub name: String,
    #[serde(default = "default_action")]
    pub action: Action,
    pub src: Vec<String>,
    pub dst: Vec<String>,
    pub service: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub tunnel: Option<String>,
    #[serde(default)]
    pub log: bool,
    #[serde(default)]
    pub stateless: bool,
}

fn default_action() -> Action {
    Action::Permit
}

/// Default protocol of encrypted tunnel traffic (ESP).
pub const DEFAULT_TUNNEL_TRANSPORT: Prt = Prt::Proto(50);

// ═══════════════════════════════════════════════════════════════════════════
// Resolution
// ═══════════════════════════════════════════════════════════════════════════

/// Checks a name is unique within its namespace.
fn register<T: Copy>(
    names: &mut HashMap<String, T>,
    kind: &str,
    name: &str,
    id: T,
) -> Result<()> {
    let object = format!("{kind}:{name}");
    validate_object_name(name).map_err(|e| Error::import(&object, e))?;
    if names.insert(name.to_string(), id).is_some() {
        return Err(Error::import(object, "Duplicate definition"));
    }
    Ok(())
}

fn lookup<T: Copy>(names: &HashMap<String, T>, kind: &str, name: &str, context: &str) -> Result<T> {
    names
        .get(name)
        .copied()
        .ok_or_else(|| Error::import(context, format!("Unknown {kind}:{name}")))
}

#[derive(Default)]
struct Names {
    zones: HashMap<String, ZoneId>,
    networks: HashMap<String, NetworkId>,
    hosts: HashMap<String, HostId>,
    aggregates: HashMap<String, ObjId>,
    areas: HashMap<String, AreaId>,
    routers: HashMap<String, RouterId>,
    interfaces: HashMap<String, InterfaceId>,
    tunnels: HashMap<String, TunnelId>,
    groups: HashMap<String, GroupId>,
    services: HashMap<String, ServiceId>,
}

struct Importer {
    model: Model,
    names: Names,
}

impl Importer {
    fn zone_for(&mut self, name: &str) -> Result<ZoneId> {
        if let Some(id) = self.names.zones.get(name) {
            return Ok(*id);
        }
        let id = ZoneId::from_index(self.model.zones.len());
        register(&mut self.names.zones, "zone", name, id)?;
        self.model.zones.push(Zone {
            name: name.to_string(),
            networks: Vec::new(),
            interfaces: Vec::new(),
            aggregates: Vec::new(),
            tunnel: None,
        });
        Ok(id)
    }

    fn push_obj(&mut self, obj: Obj) -> ObjId {
        let id = ObjId::from_index(self.model.objs.len());
        self.model.objs.push(obj);
        id
    }

    fn networks(&mut self, input: &[NetworkInput]) -> Result<()> {
        for net in input {
            let object = format!("network:{}", net.name);
            let id = NetworkId::from_index(self.model.networks.len());
            register(&mut self.names.networks, "network", &net.name, id)?;
            if addr::normalize(net.ip) != net.ip {
                return Err(Error::import(object, format!("{} has host bits set", net.ip)));
            }
            for (tag, def) in &net.nat {
                validate_nat_tag(tag).map_err(|e| Error::import(&object, e))?;
                if let NatDef::Static(ip) | NatDef::Dynamic(ip) = def
                    && !addr::same_family(ip, &net.ip)
                {
                    return Err(Error::import(
                        &object,
                        format!("NAT address {ip} of nat:{tag} has wrong IP version"),
                    ));
                }
            }
            let zone = self.zone_for(&net.zone)?;
            let obj = self.push_obj(Obj {
                name: object,
                ip: net.ip,
                kind: ObjKind::Network,
                zone,
                network: Some(id),
                nat: BTreeMap::new(),
            });
            self.model.zones[zone.index()].networks.push(id);
            self.model.networks.push(Network {
                name: net.name.clone(),
                ip: net.ip,
                zone,
                obj,
                nat: net.nat.clone(),
                subnet_of: None,
                hosts: Vec::new(),
            });
        }

        // Second pass: references between networks and hosts
        for (index, net) in input.iter().enumerate() {
            let id = NetworkId::from_index(index);
            let object = format!("network:{}", net.name);
            if let Some(parent) = &net.subnet_of {
                let parent = lookup(&self.names.networks, "network", parent, &object)?;
                self.model.networks[index].subnet_of = Some(parent);
            }
            let mut shared: HashMap<IpNetwork, ObjId> = HashMap::new();
            for host in &net.hosts {
                let host_id = HostId::from_index(self.model.hosts.len());
                register(&mut self.names.hosts, "host", &host.name, host_id)?;
                let subnets = self.host_subnets(id, net, host, &mut shared)?;
                self.model.networks[index].hosts.push(host_id);
                self.model.hosts.push(Host {
                    name: host.name.clone(),
                    network: id,
                    subnets,
                });
            }
        }
        Ok(())
    }

    fn host_subnets(
        &mut self,
        network: NetworkId,
        net: &NetworkInput,
        host: &HostInput,
        shared: &mut HashMap<IpNetwork, ObjId>,
    ) -> Result<Vec<ObjId>> {
        let object = format!("host:{}", host.name);
        let blocks = match (host.ip, host.range) {
            (Some(ip), None) => vec![addr::host_net(ip)],
            (None, Some([lo, hi])) => {
                addr::range_to_cidrs(lo, hi).map_err(|e| Error::import(&object, e))?
            }
            _ => {
                return Err(Error::import(object, "Exactly one of 'ip' or 'range' required"));
            }
        };
        if !host.nat.is_empty() && host.ip.is_none() {
            return Err(Error::import(object, "NAT address requires a single 'ip'"));
        }
        for (tag, ip) in &host.nat {
            match net.nat.get(tag) {
                Some(NatDef::Dynamic(pool)) if addr::contains_addr(pool, *ip) => {}
                Some(NatDef::Dynamic(pool)) => {
                    return Err(Error::import(
                        object,
                        format!("NAT address {ip} is not inside pool {pool} of nat:{tag}"),
                    ));
                }
                _ => {
                    return Err(Error::import(
                        object,
                        format!("nat:{tag} is not a dynamic NAT of network:{}", net.name),
                    ));
                }
            }
        }

        let zone = self.model.network(network).zone;
        let mut subnets = Vec::with_capacity(blocks.len());
        for block in blocks {
            if !addr::contains(&net.ip, &block) {
                return Err(Error::import(
                    object,
                    format!("{block} doesn't match network:{}", net.name),
                ));
            }
            if let Some(obj) = shared.get(&block) {
                if !host.nat.is_empty() || !self.model.obj(*obj).nat.is_empty() {
                    return Err(Error::import(
                        object,
                        format!("Address {block} is shared with a host using NAT"),
                    ));
                }
                subnets.push(*obj);
                continue;
            }
            let obj = self.push_obj(Obj {
                name: object.clone(),
                ip: block,
                kind: ObjKind::Subnet,
                zone,
                network: Some(network),
                nat: host.nat.clone(),
            });
            shared.insert(block, obj);
            subnets.push(obj);
        }
        Ok(subnets)
    }

    fn aggregates(&mut self, input: &[AggregateInput]) -> Result<()> {
        for agg in input {
            let object = format!("any:{}", agg.name);
            let zone = lookup(&self.names.zones, "zone", &agg.zone, &object)?;
            let ip = match agg.ip {
                Some(ip) if addr::normalize(ip) != ip => {
                    return Err(Error::import(object, format!("{ip} has host bits set")));
                }
                Some(ip) => ip,
                None => addr::all_of_family(&addr::host_net(IpAddr::V4(Ipv4Addr::UNSPECIFIED))),
            };
            let id = self.push_obj(Obj {
                name: object,
                ip,
                kind: ObjKind::Aggregate,
                zone,
                network: None,
                nat: BTreeMap::new(),
            });
            register(&mut self.names.aggregates, "any", &agg.name, id)?;
            self.model.zones[zone.index()].aggregates.push(id);
        }
        Ok(())
    }

    fn routers(&mut self, input: &[RouterInput]) -> Result<()> {
        for router in input {
            let object = format!("router:{}", router.name);
            let id = RouterId::from_index(self.model.routers.len());
            register(&mut self.names.routers, "router", &router.name, id)?;
            validate_device_name(&router.name).map_err(|e| Error::import(&object, e))?;
            let policy_distribution_point = router
                .policy_distribution_point
                .as_deref()
                .map(|h| lookup(&self.names.hosts, "host", h, &object))
                .transpose()?;
            self.model.routers.push(Router {
                name: router.name.clone(),
                managed: router.managed,
                stateless: router.stateless,
                model: router.model.clone(),
                interfaces: Vec::new(),
                policy_distribution_point,
            });
            for intf in &router.interfaces {
                self.interface(id, intf)?;
            }
        }
        Ok(())
    }

    fn interface(&mut self, router: RouterId, input: &InterfaceInput) -> Result<InterfaceId> {
        let name = format!("{}.{}", self.model.router(router).name, input.name);
        let object = format!("interface:{name}");
        let id = InterfaceId::from_index(self.model.interfaces.len());
        register(&mut self.names.interfaces, "interface", &name, id)?;
        let network = lookup(&self.names.networks, "network", &input.network, &object)?;
        let net = self.model.network(network);
        let zone = net.zone;
        let net_ip = net.ip;
        let obj = match input.ip {
            Some(ip) if !addr::contains_addr(&net_ip, ip) => {
                return Err(Error::import(
                    object,
                    format!("IP address {ip} doesn't match network:{}", input.network),
                ));
            }
            Some(ip) => Some(self.push_obj(Obj {
                name: object.clone(),
                ip: addr::host_net(ip),
                kind: ObjKind::Interface(id),
                zone,
                network: Some(network),
                nat: BTreeMap::new(),
            })),
            None => None,
        };
        let bind_nat = nat_tags(&input.bind_nat, &object)?;
        self.model.zones[zone.index()].interfaces.push(id);
        self.model.routers[router.index()].interfaces.push(id);
        self.model.interfaces.push(Interface {
            name,
            router,
            zone,
            network: Some(network),
            ip: input.ip,
            obj,
            bind_nat,
            reroute_permit: Vec::new(),
            tunnel: None,
        });
        Ok(id)
    }

    /// Creates the pseudo zone and both tunnel interfaces of a tunnel.
    fn tunnels(&mut self, input: &[TunnelInput]) -> Result<()> {
        for tunnel in input {
            let object = format!("tunnel:{}", tunnel.name);
            let id = TunnelId::from_index(self.model.tunnels.len());
            register(&mut self.names.tunnels, "tunnel", &tunnel.name, id)?;
            let zone = self.zone_for(&object)?;
            self.model.zones[zone.index()].tunnel = Some(id);

            let mut ends = Vec::with_capacity(2);
            for end in &tunnel.ends {
                let router = lookup(&self.names.routers, "router", &end.router, &object)?;
                let real_name = format!("{}.{}", end.router, end.real);
                let real = lookup(&self.names.interfaces, "interface", &real_name, &object)?;
                if self.model.interface(real).ip.is_none() {
                    return Err(Error::import(
                        object,
                        format!("interface:{real_name} needs an IP address to carry the tunnel"),
                    ));
                }
                let name = format!("{}.{}", end.router, tunnel.name);
                let intf = InterfaceId::from_index(self.model.interfaces.len());
                register(&mut self.names.interfaces, "interface", &name, intf)?;
                let bind_nat = nat_tags(&end.bind_nat, &object)?;
                self.model.zones[zone.index()].interfaces.push(intf);
                self.model.routers[router.index()].interfaces.push(intf);
                self.model.interfaces.push(Interface {
                    name,
                    router,
                    zone,
                    network: None,
                    ip: None,
                    obj: None,
                    bind_nat,
                    reroute_permit: Vec::new(),
                    tunnel: Some(TunnelEnd { tunnel: id, real }),
                });
                ends.push(intf);
            }
            let [a, b] = [ends[0], ends[1]];
            if self.model.interface(a).router == self.model.interface(b).router {
                return Err(Error::import(object, "Both ends are on the same router"));
            }
            self.model.tunnels.push(Tunnel {
                name: tunnel.name.clone(),
                zone,
                ends: [a, b],
                transport: tunnel.transport.unwrap_or(DEFAULT_TUNNEL_TRANSPORT),
            });
        }
        Ok(())
    }

    fn areas(&mut self, input: &[AreaInput]) -> Result<()> {
        for area in input {
            let object = format!("area:{}", area.name);
            let id = AreaId::from_index(self.model.areas.len());
            register(&mut self.names.areas, "area", &area.name, id)?;
            let zones = area
                .zones
                .iter()
                .map(|z| lookup(&self.names.zones, "zone", z, &object))
                .collect::<Result<Vec<_>>>()?;
            self.model.areas.push(Area {
                name: area.name.clone(),
                zones,
            });
        }
        Ok(())
    }

    fn resolve_ref(&self, text: &str, context: &str) -> Result<ObjRef> {
        let typed = parse_typed_name(text).map_err(|e| Error::import(context, e))?;
        let name = typed.name.as_str();
        let names = &self.names;
        Ok(match typed.kind {
            RefType::Network => ObjRef::Network(lookup(&names.networks, "network", name, context)?),
            RefType::Host => ObjRef::Host(lookup(&names.hosts, "host", name, context)?),
            RefType::Interface => {
                ObjRef::Interface(lookup(&names.interfaces, "interface", name, context)?)
            }
            RefType::Any => ObjRef::Any(lookup(&names.aggregates, "any", name, context)?),
            RefType::Group => ObjRef::Group(lookup(&names.groups, "group", name, context)?),
            RefType::Area => ObjRef::Area(lookup(&names.areas, "area", name, context)?),
        })
    }

    fn resolve_refs(&self, texts: &[String], context: &str) -> Result<Vec<ObjRef>> {
        texts.iter().map(|t| self.resolve_ref(t, context)).collect()
    }

    fn reroute_permits(&mut self, input: &[RouterInput]) -> Result<()> {
        for router in input {
            for intf in &router.interfaces {
                if intf.reroute_permit.is_empty() {
                    continue;
                }
                let name = format!("{}.{}", router.name, intf.name);
                let id = lookup(&self.names.interfaces, "interface", &name, &name)?;
                let refs = self.resolve_refs(&intf.reroute_permit, &format!("interface:{name}"))?;
                self.model.interfaces[id.index()].reroute_permit = refs;
            }
        }
        Ok(())
    }

    fn groups(&mut self, input: &[GroupInput]) -> Result<()> {
        for (index, group) in input.iter().enumerate() {
            register(&mut self.names.groups, "group", &group.name, GroupId::from_index(index))?;
        }
        for group in input {
            let members = self.resolve_refs(&group.members, &format!("group:{}", group.name))?;
            self.model.groups.push(Group {
                name: group.name.clone(),
                members,
            });
        }
        Ok(())
    }

    fn services(&mut self, input: &[ServiceInput]) -> Result<()> {
        for service in input {
            let id = ServiceId::from_index(self.model.services.len());
            register(&mut self.names.services, "service", &service.name, id)?;
            self.model.services.push(Service {
                name: service.name.clone(),
                prts: service.prts.clone(),
            });
        }
        Ok(())
    }

    fn rules(&mut self, input: &[RuleInput], owners: &[String]) -> Result<()> {
        let mut seen = BTreeSet::new();
        for owner in owners {
            let object = format!("owner:{owner}");
            validate_object_name(owner).map_err(|e| Error::import(&object, e))?;
            if !seen.insert(owner.as_str()) {
                return Err(Error::import(object, "Duplicate definition"));
            }
        }
        let mut rule_names = HashMap::new();
        for rule in input {
            let object = format!("rule:{}", rule.name);
            register(&mut rule_names, "rule", &rule.name, ())?;
            let src = self.resolve_refs(&rule.src, &object)?;
            let dst = self.resolve_refs(&rule.dst, &object)?;
            let service = lookup(&self.names.services, "service", &rule.service, &object)?;
            let tunnel = rule
                .tunnel
                .as_deref()
                .map(|t| lookup(&self.names.tunnels, "tunnel", t, &object))
                .transpose()?;
            if let Some(owner) = &rule.owner
                && !seen.contains(owner.as_str())
            {
                return Err(Error::import(object, format!("Unknown owner:{owner}")));
            }
            self.model.rules.push(Rule {
                name: rule.name.clone(),
                action: rule.action,
                src,
                dst,
                service,
                owner: rule.owner.clone(),
                tunnel,
                log: rule.log,
                stateless: rule.stateless,
            });
        }
        self.model.owners = owners.to_vec();
        Ok(())
    }
}

fn nat_tags(tags: &[String], object: &str) -> Result<BTreeSet<String>> {
    tags.iter()
        .map(|t| {
            validate_nat_tag(t)
                .map(|()| t.clone())
                .map_err(|e| Error::import(object, e))
        })
        .collect()
}

/// Resolves a parsed policy document into a [`Model`].
///
/// # Errors
///
/// Returns [`Error::Import`] for duplicate or unknown names and for
/// addresses that don't fit their network.
pub fn import_policy(input: &PolicyInput) -> Result<Model> {
    let mut importer = Importer {
        model: Model::default(),
        names: Names::default(),
    };
    importer.networks(&input.networks)?;
    importer.aggregates(&input.aggregates)?;
    importer.routers(&input.routers)?;
    importer.tunnels(&input.tunnels)?;
    importer.areas(&input.areas)?;
    importer.groups(&input.groups)?;
    importer.reroute_permits(&input.routers)?;
    importer.services(&input.services)?;
    importer.rules(&input.rules, &input.owners)?;

    let model = importer.model;
    info!(
        "Imported {} networks, {} routers, {} rules in {} zones",
        model.networks.len(),
        model.routers.len(),
        model.rules.len(),
        model.zones.len()
    );
    Ok(model)
}

/// Parses and resolves a policy document from JSON text.
///
/// # Errors
///
/// Returns `Err` if the JSON is malformed or the model doesn't resolve.
pub fn parse_policy(json: &str) -> Result<Model> {
    let input: PolicyInput = serde_json::from_str(json)?;
    import_policy(&input)
}

/// Loads a policy model file.
///
/// # Errors
///
/// Returns `Err` if the file cannot be read or doesn't resolve.
///
/// # Async
/// Uses `tokio::fs` for non-blocking I/O.
pub async fn load_policy(path: &Path) -> Result<Model> {
    let json = tokio::fs::read_to_string(path).await?;
    parse_policy(&json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> serde_json::Value {
        json!({
            "networks": [
                { "name": "n1", "ip": "10.1.1.0/24", "zone": "z1",
                  "hosts": [
                      { "name": "h1", "ip": "10.1.1.10" },
                      { "name": "h2", "range": ["10.1.1.16", "10.1.1.31"] }
                  ] },
                { "name": "n2", "ip": "10.2.2.0/24", "zone": "z2" }
            ],
            "routers": [
                { "name": "r1", "managed": "full", "interfaces": [
                    { "name": "e0", "network": "n1", "ip": "10.1.1.1" },
                    { "name": "e1", "network": "n2", "ip": "10.2.2.1" }
                ] }
            ],
            "services": [ { "name": "web", "prts": ["tcp 80"] } ],
            "rules": [
                { "name": "r", "src": ["host:h1"], "dst": ["network:n2"], "service": "web" }
            ]
        })
    }

    fn import(value: &serde_json::Value) -> Result<Model> {
        parse_policy(&value.to_string())
    }

    #[test]
    fn test_import_resolves_names() {
        let model = import(&base()).unwrap();
        assert_eq!(model.zones.len(), 2);
        assert_eq!(model.interfaces.len(), 2);
        assert_eq!(model.router(RouterId(0)).managed, Some(ManagedKind::Full));
        let rule = model.rule(crate::core::model::RuleId(0));
        assert_eq!(rule.src, vec![ObjRef::Host(HostId(0))]);
        assert_eq!(rule.action, Action::Permit);
    }

    #[test]
    fn test_host_range_becomes_one_block() {
        let model = import(&base()).unwrap();
        let h2 = model.host(HostId(1));
        assert_eq!(h2.subnets.len(), 1);
        assert_eq!(model.obj(h2.subnets[0]).ip.to_string(), "10.1.1.16/28");
    }

    #[test]
    fn test_duplicate_network_rejected() {
        let mut value = base();
        value["networks"][1]["name"] = json!("n1");
        let err = import(&value).unwrap_err();
        assert!(err.to_string().contains("Duplicate definition"));
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let mut value = base();
        value["rules"][0]["dst"] = json!(["network:n9"]);
        let err = import(&value).unwrap_err();
        assert_eq!(err.to_string(), "Import error in rule:r: Unknown network:n9");
    }

    #[test]
    fn test_interface_outside_network_rejected() {
        let mut value = base();
        value["routers"][0]["interfaces"][0]["ip"] = json!("10.9.9.1");
        assert!(import(&value).is_err());
    }

    #[test]
    fn test_host_outside_network_rejected() {
        let mut value = base();
        value["networks"][0]["hosts"][0]["ip"] = json!("10.2.2.10");
        let err = import(&value).unwrap_err();
        assert!(err.to_string().contains("doesn't match network:n1"));
    }

    #[test]
    fn test_identical_host_blocks_are_shared() {
        let mut value = base();
        value["networks"][0]["hosts"] = json!([
            { "name": "a", "ip": "10.1.1.10" },
            { "name": "b", "range": ["10.1.1.10", "10.1.1.10"] }
        ]);
        let model = import(&value).unwrap();
        assert_eq!(model.host(HostId(0)).subnets, model.host(HostId(1)).subnets);
    }

    #[test]
    fn test_host_nat_requires_dynamic_pool() {
        let mut value = base();
        value["networks"][0]["nat"] = json!({ "out": { "type": "dynamic", "ip": "192.0.2.0/28" } });
        value["networks"][0]["hosts"][0]["nat"] = json!({ "out": "192.0.2.1" });
        assert!(import(&value).is_ok());

        value["networks"][0]["hosts"][0]["nat"] = json!({ "out": "198.51.100.1" });
        assert!(import(&value).is_err());
    }

    #[test]
    fn test_tunnel_creates_pseudo_zone() {
        let mut value = base();
        value["networks"]
            .as_array_mut()
            .unwrap()
            .push(json!({ "name": "n3", "ip": "10.3.3.0/24", "zone": "z3" }));
        value["routers"].as_array_mut().unwrap().push(json!(
            { "name": "r2", "interfaces": [
                { "name": "e0", "network": "n2", "ip": "10.2.2.2" },
                { "name": "e1", "network": "n3", "ip": "10.3.3.1" }
            ] }
        ));
        value["tunnels"] = json!([
            { "name": "vpn", "ends": [
                { "router": "r1", "real": "e1" },
                { "router": "r2", "real": "e0" }
            ] }
        ]);
        let model = import(&value).unwrap();
        let tunnel = model.tunnel(TunnelId(0));
        assert_eq!(model.zone(tunnel.zone).name, "tunnel:vpn");
        assert_eq!(tunnel.transport, Prt::Proto(50));
        assert_eq!(model.interface(tunnel.ends[0]).name, "r1.vpn");
        assert_eq!(model.tunnel_peer(tunnel.ends[0]), Some(tunnel.ends[1]));
    }

    #[test]
    fn test_unknown_owner_rejected() {
        let mut value = base();
        value["rules"][0]["owner"] = json!("ops");
        assert!(import(&value).is_err());
        value["owners"] = json!(["ops"]);
        assert!(import(&value).is_ok());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut value = base();
        value["rules"][0]["prio"] = json!(1);
        assert!(import(&value).is_err());
    }
}
