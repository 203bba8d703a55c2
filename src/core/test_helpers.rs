//! Shared test utilities for core module tests
//!
//! Provides a fluent [`PolicyBuilder`] so tests describe only the topology
//! and rules they care about. This module is only compiled in test mode.

use crate::core::import::{
    AggregateInput, AreaInput, GroupInput, HostInput, InterfaceInput, NetworkInput, PolicyInput,
    RouterInput, RuleInput, ServiceInput, TunnelEndInput, TunnelInput, import_policy,
};
use crate::core::model::{Action, ManagedKind, Model, NatDef};

/// Builds a [`PolicyInput`] step by step and imports it.
///
/// Methods that modify an existing object look it up by name and panic if
/// it hasn't been added yet.
///
/// # Example
///
/// ```ignore
/// let model = PolicyBuilder::new()
///     .network("n1", "10.1.0.0/24", "z1")
///     .network("n2", "10.2.0.0/24", "z2")
///     .router("r1", Some("full"))
///     .interface("r1", "e0", "n1", Some("10.1.0.1"))
///     .interface("r1", "e1", "n2", Some("10.2.0.1"))
///     .service("web", &["tcp 80"])
///     .rule("r", &["network:n1"], &["network:n2"], "web")
///     .build();
/// ```
#[derive(Debug, Clone, Default)]
pub struct PolicyBuilder {
    input: PolicyInput,
}

impl PolicyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn network_mut(&mut self, name: &str) -> &mut NetworkInput {
        self.input
            .networks
            .iter_mut()
            .find(|n| n.name == name)
            .unwrap_or_else(|| panic!("network {name} not defined"))
    }

    fn router_mut(&mut self, name: &str) -> &mut RouterInput {
        self.input
            .routers
            .iter_mut()
            .find(|r| r.name == name)
            .unwrap_or_else(|| panic!("router {name} not defined"))
    }

    fn interface_mut(&mut self, router: &str, name: &str) -> &mut InterfaceInput {
        self.router_mut(router)
            .interfaces
            .iter_mut()
            .find(|i| i.name == name)
            .unwrap_or_else(|| panic!("interface {router}.{name} not defined"))
    }

    fn rule_mut(&mut self, name: &str) -> &mut RuleInput {
        self.input
            .rules
            .iter_mut()
            .find(|r| r.name == name)
            .unwrap_or_else(|| panic!("rule {name} not defined"))
    }

    pub fn network(mut self, name: &str, ip: &str, zone: &str) -> Self {
        self.input.networks.push(NetworkInput {
            name: name.to_string(),
            ip: ip.parse().unwrap(),
            zone: zone.to_string(),
            nat: Default::default(),
            subnet_of: None,
            hosts: Vec::new(),
        });
        self
    }

    pub fn subnet_of(mut self, network: &str, parent: &str) -> Self {
        self.network_mut(network).subnet_of = Some(parent.to_string());
        self
    }

    pub fn static_nat(mut self, network: &str, tag: &str, ip: &str) -> Self {
        let def = NatDef::Static(ip.parse().unwrap());
        self.network_mut(network).nat.insert(tag.to_string(), def);
        self
    }

    pub fn dynamic_nat(mut self, network: &str, tag: &str, ip: &str) -> Self {
        let def = NatDef::Dynamic(ip.parse().unwrap());
        self.network_mut(network).nat.insert(tag.to_string(), def);
        self
    }

    pub fn hidden_nat(mut self, network: &str, tag: &str) -> Self {
        self.network_mut(network)
            .nat
            .insert(tag.to_string(), NatDef::Hidden);
        self
    }

    pub fn host(mut self, network: &str, name: &str, ip: &str) -> Self {
        self.network_mut(network).hosts.push(HostInput {
            name: name.to_string(),
            ip: Some(ip.parse().unwrap()),
            range: None,
            nat: Default::default(),
        });
        self
    }

    pub fn host_range(mut self, network: &str, name: &str, lo: &str, hi: &str) -> Self {
        self.network_mut(network).hosts.push(HostInput {
            name: name.to_string(),
            ip: None,
            range: Some([lo.parse().unwrap(), hi.parse().unwrap()]),
            nat: Default::default(),
        });
        self
    }

    pub fn host_nat(mut self, network: &str, host: &str, tag: &str, ip: &str) -> Self {
        let host = self
            .network_mut(network)
            .hosts
            .iter_mut()
            .find(|h| h.name == host)
            .unwrap_or_else(|| panic!("host {host} not defined"));
        host.nat.insert(tag.to_string(), ip.parse().unwrap());
        self
    }

    pub fn aggregate(mut self, name: &str, zone: &str) -> Self {
        self.input.aggregates.push(AggregateInput {
            name: name.to_string(),
            zone: zone.to_string(),
            ip: None,
        });
        self
    }

    pub fn area(mut self, name: &str, zones: &[&str]) -> Self {
        self.input.areas.push(AreaInput {
            name: name.to_string(),
            zones: zones.iter().map(ToString::to_string).collect(),
        });
        self
    }

    pub fn router(mut self, name: &str, managed: Option<&str>) -> Self {
        self.input.routers.push(RouterInput {
            name: name.to_string(),
            managed: managed.map(|m| m.parse::<ManagedKind>().unwrap()),
            stateless: false,
            model: None,
            policy_distribution_point: None,
            interfaces: Vec::new(),
        });
        self
    }

    pub fn stateless(mut self, router: &str) -> Self {
        self.router_mut(router).stateless = true;
        self
    }

    pub fn policy_distribution_point(mut self, router: &str, host: &str) -> Self {
        self.router_mut(router).policy_distribution_point = Some(host.to_string());
        self
    }

    pub fn interface(mut self, router: &str, name: &str, network: &str, ip: Option<&str>) -> Self {
        self.router_mut(router).interfaces.push(InterfaceInput {
            name: name.to_string(),
            network: network.to_string(),
            ip: ip.map(|i| i.parse().unwrap()),
            bind_nat: Vec::new(),
            reroute_permit: Vec::new(),
        });
        self
    }

    pub fn bind_nat(mut self, router: &str, intf: &str, tags: &[&str]) -> Self {
        self.interface_mut(router, intf).bind_nat = tags.iter().map(ToString::to_string).collect();
        self
    }

    pub fn reroute_permit(mut self, router: &str, intf: &str, refs: &[&str]) -> Self {
        self.interface_mut(router, intf).reroute_permit =
            refs.iter().map(ToString::to_string).collect();
        self
    }

    /// Tunnel between two routers, each end given as `(router, real interface)`.
    pub fn tunnel(mut self, name: &str, a: (&str, &str), b: (&str, &str)) -> Self {
        let end = |(router, real): (&str, &str)| TunnelEndInput {
            router: router.to_string(),
            real: real.to_string(),
            bind_nat: Vec::new(),
        };
        self.input.tunnels.push(TunnelInput {
            name: name.to_string(),
            ends: [end(a), end(b)],
            transport: None,
        });
        self
    }

    pub fn group(mut self, name: &str, members: &[&str]) -> Self {
        self.input.groups.push(GroupInput {
            name: name.to_string(),
            members: members.iter().map(ToString::to_string).collect(),
        });
        self
    }

    pub fn service(mut self, name: &str, prts: &[&str]) -> Self {
        self.input.services.push(ServiceInput {
            name: name.to_string(),
            prts: prts.iter().map(|p| p.parse().unwrap()).collect(),
        });
        self
    }

    pub fn owner(mut self, name: &str) -> Self {
        self.input.owners.push(name.to_string());
        self
    }

    pub fn rule(self, name: &str, src: &[&str], dst: &[&str], service: &str) -> Self {
        self.rule_with_action(name, Action::Permit, src, dst, service)
    }

    pub fn deny(self, name: &str, src: &[&str], dst: &[&str], service: &str) -> Self {
        self.rule_with_action(name, Action::Deny, src, dst, service)
    }

    fn rule_with_action(
        mut self,
        name: &str,
        action: Action,
        src: &[&str],
        dst: &[&str],
        service: &str,
    ) -> Self {
        self.input.rules.push(RuleInput {
            name: name.to_string(),
            action,
            src: src.iter().map(ToString::to_string).collect(),
            dst: dst.iter().map(ToString::to_string).collect(),
            service: service.to_string(),
            owner: None,
            tunnel: None,
            log: false,
            stateless: false,
        });
        self
    }

    pub fn rule_owner(mut self, rule: &str, owner: &str) -> Self {
        self.rule_mut(rule).owner = Some(owner.to_string());
        self
    }

    pub fn rule_tunnel(mut self, rule: &str, tunnel: &str) -> Self {
        self.rule_mut(rule).tunnel = Some(tunnel.to_string());
        self
    }

    pub fn rule_log(mut self, rule: &str) -> Self {
        self.rule_mut(rule).log = true;
        self
    }

    pub fn rule_stateless(mut self, rule: &str) -> Self {
        self.rule_mut(rule).stateless = true;
        self
    }

    pub fn input(&self) -> PolicyInput {
        self.input.clone()
    }

    pub fn build(self) -> Model {
        import_policy(&self.input).unwrap()
    }
}

/// Two zones joined by one full router: `n1 (z1) - r1 - n2 (z2)`.
pub fn two_zones() -> PolicyBuilder {
    PolicyBuilder::new()
        .network("n1", "10.1.1.0/24", "z1")
        .network("n2", "10.2.2.0/24", "z2")
        .router("r1", Some("full"))
        .interface("r1", "e0", "n1", Some("10.1.1.1"))
        .interface("r1", "e1", "n2", Some("10.2.2.1"))
}

/// `n1 - r1 (unmanaged spoke) - transit - r2 (managed hub) - n2` with a
/// tunnel `vpn` between the transit interfaces and one web rule `r` from
/// n1 to n2.
pub fn spoke_and_hub() -> PolicyBuilder {
    PolicyBuilder::new()
        .network("n1", "10.1.1.0/24", "z1")
        .network("transit", "198.51.100.0/24", "zt")
        .network("n2", "10.2.2.0/24", "z2")
        .router("r1", None)
        .interface("r1", "lan", "n1", Some("10.1.1.1"))
        .interface("r1", "wan", "transit", Some("198.51.100.1"))
        .router("r2", Some("full"))
        .interface("r2", "wan", "transit", Some("198.51.100.2"))
        .interface("r2", "lan", "n2", Some("10.2.2.1"))
        .tunnel("vpn", ("r1", "wan"), ("r2", "wan"))
        .service("web", &["tcp 80"])
        .rule("r", &["network:n1"], &["network:n2"], "web")
}
