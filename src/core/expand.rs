//! Rule expansion
//!
//! Turns the rules of the model into path rules, one per enforcement point:
//!
//! 1. [`check_service_owner`]: owner bookkeeping
//! 2. [`convert_hosts_in_rules`]: flattens groups, hosts and areas into
//!    objects and splits every rule into `(src, dst, prt)` triples
//! 3. [`group_path_rules`]: computes one path per (source zone, target) and
//!    places a [`PathRule`] at every managed router on it
//!
//! [`crate::core::crypto`] and [`crate::core::reverse`] add derived path
//! rules afterwards.

use crate::config::{CheckLevel, CompilerConfig};
use crate::core::diag::{DiagKind, Diagnostics, Staged};
use crate::core::model::{
    Action, GroupId, InterfaceId, Model, ObjId, ObjKind, ObjRef, PathId, RouterId, RuleId,
    TunnelId, ZoneId,
};
use crate::core::service::{Prt, Services};
use crate::core::topology::{Distances, Node, Path, PathFinder};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

/// Side of a tunnel a path rule filters.
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
)]
#[serde(rename_all = "lowercase")]
pub enum CryptoSide {
    /// Decrypted traffic leaving or entering the tunnel interface
    #[strum(serialize = "plain")]
    Plain,
    /// Transport packets carrying the tunnel
    #[strum(serialize = "encrypted")]
    Encrypted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Crypto {
    pub side: CryptoSide,
    pub tunnel: TunnelId,
}

/// Device and incoming interface a path rule is filtered at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Point {
    pub device: RouterId,
    pub in_intf: InterfaceId,
}

/// One `(src, dst, prt)` triple of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpandedRule {
    pub rule: RuleId,
    pub action: Action,
    pub src: ObjId,
    pub dst: ObjId,
    pub prt: Prt,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Expanded {
    pub permit: Vec<ExpandedRule>,
    pub deny: Vec<ExpandedRule>,
}

impl Expanded {
    pub fn len(&self) -> usize {
        self.permit.len() + self.deny.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permit.is_empty() && self.deny.is_empty()
    }

    /// Deny rules first, then permit rules, each in rule order.
    pub fn iter(&self) -> impl Iterator<Item = &ExpandedRule> {
        self.deny.iter().chain(&self.permit)
    }
}

/// Rule instance at one enforcement point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRule {
    pub rule: RuleId,
    pub action: Action,
    pub src: ObjId,
    pub dst: ObjId,
    pub prt: Prt,
    pub device: RouterId,
    pub in_intf: InterfaceId,
    /// `None` if the traffic is addressed to the device itself
    pub out_intf: Option<InterfaceId>,
    /// Index of the hop on the path
    pub hop: usize,
    /// Hops left until the destination
    pub to_dst: usize,
    pub path: PathId,
    pub crypto: Option<Crypto>,
    pub reversed: bool,
    pub secondary: bool,
    pub log: bool,
    /// Filtered per direction, by rule or by device
    pub stateless: bool,
}

impl PathRule {
    pub const fn point(&self) -> Point {
        Point {
            device: self.device,
            in_intf: self.in_intf,
        }
    }
}

/// Path rules and the paths they were placed on, indexed by [`PathId`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathRules {
    pub rules: Vec<PathRule>,
    pub paths: Vec<Path>,
}

impl PathRules {
    pub fn path(&self, id: PathId) -> &Path {
        &self.paths[id.index()]
    }

    pub fn add_path(&mut self, path: Path) -> PathId {
        self.paths.push(path);
        PathId::from_index(self.paths.len() - 1)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Owners
// ═══════════════════════════════════════════════════════════════════════════

/// Rules without owner are reported at `check_service_owner`, owners no
/// rule references are warnings.
pub fn check_service_owner(model: &Model, config: &CompilerConfig) -> Staged<()> {
    let mut diagnostics = Diagnostics::new();
    let mut used = BTreeSet::new();
    for rule in &model.rules {
        match &rule.owner {
            Some(owner) => {
                used.insert(owner.as_str());
            }
            None => diagnostics.report(
                config.check_service_owner,
                DiagKind::Owner,
                format!("Missing owner for rule:{}", rule.name),
            ),
        }
    }
    for owner in &model.owners {
        if !used.contains(owner.as_str()) {
            diagnostics.warning(DiagKind::Owner, format!("Unused owner:{owner}"));
        }
    }
    Staged::new((), diagnostics)
}

// ═══════════════════════════════════════════════════════════════════════════
// Object resolution
// ═══════════════════════════════════════════════════════════════════════════

struct Resolver<'m> {
    model: &'m Model,
    /// `None` while a group is being resolved
    groups: HashMap<GroupId, Option<Vec<ObjId>>>,
    recursive: BTreeSet<GroupId>,
    no_ip: BTreeSet<InterfaceId>,
    diagnostics: Diagnostics,
}

impl<'m> Resolver<'m> {
    fn new(model: &'m Model) -> Self {
        Self {
            model,
            groups: HashMap::new(),
            recursive: BTreeSet::new(),
            no_ip: BTreeSet::new(),
            diagnostics: Diagnostics::new(),
        }
    }

    fn resolve(&mut self, r: ObjRef, out: &mut Vec<ObjId>) {
        let model = self.model;
        match r {
            ObjRef::Network(id) => out.push(model.network(id).obj),
            ObjRef::Host(id) => out.extend(&model.host(id).subnets),
            ObjRef::Interface(id) => match model.interface(id).obj {
                Some(obj) => out.push(obj),
                None => {
                    if self.no_ip.insert(id) {
                        self.diagnostics.error(
                            DiagKind::Group,
                            format!(
                                "interface:{} without IP address can't be used in rules",
                                model.interface(id).name
                            ),
                        );
                    }
                }
            },
            ObjRef::Any(obj) => out.push(obj),
            ObjRef::Area(id) => {
                for zone in &model.area(id).zones {
                    out.extend(model.zone(*zone).networks.iter().map(|n| model.network(*n).obj));
                }
            }
            ObjRef::Group(id) => out.extend(self.group(id)),
        }
    }

    fn group(&mut self, id: GroupId) -> Vec<ObjId> {
        match self.groups.get(&id) {
            Some(Some(objs)) => return objs.clone(),
            Some(None) => {
                if self.recursive.insert(id) {
                    self.diagnostics.error(
                        DiagKind::Group,
                        format!("Found recursion in definition of group:{}", self.model.group(id).name),
                    );
                }
                return Vec::new();
            }
            None => {}
        }
        self.groups.insert(id, None);
        let model = self.model;
        let mut objs = Vec::new();
        for member in &model.group(id).members {
            self.resolve(*member, &mut objs);
        }
        self.groups.insert(id, Some(objs.clone()));
        objs
    }

    /// Objects of one rule side, first occurrence kept.
    fn side(&mut self, refs: &[ObjRef], what: &str, rule: &str, level: CheckLevel) -> Vec<ObjId> {
        let mut all = Vec::new();
        for r in refs {
            self.resolve(*r, &mut all);
        }
        let mut seen = BTreeSet::new();
        let mut duplicates = Vec::new();
        all.retain(|obj| {
            let fresh = seen.insert(*obj);
            if !fresh {
                duplicates.push(*obj);
            }
            fresh
        });
        if !duplicates.is_empty() {
            duplicates.dedup();
            let names: Vec<&str> = duplicates
                .iter()
                .map(|o| self.model.obj(*o).name.as_str())
                .collect();
            self.diagnostics.report(
                level,
                DiagKind::Group,
                format!("Duplicate elements in {what} of rule:{rule}: {}", names.join(", ")),
            );
        }
        all
    }
}

/// Resolves every rule to object triples, split by action.
///
/// A triple whose source and destination are the same object is dropped.
pub fn convert_hosts_in_rules(
    model: &Model,
    services: &Services,
    config: &CompilerConfig,
) -> Staged<Expanded> {
    let mut resolver = Resolver::new(model);
    let mut expanded = Expanded::default();
    for (id, rule) in model.rule_ids().zip(&model.rules) {
        let src = resolver.side(&rule.src, "src", &rule.name, config.check_duplicate_elements);
        let dst = resolver.side(&rule.dst, "dst", &rule.name, config.check_duplicate_elements);
        let target = match rule.action {
            Action::Permit => &mut expanded.permit,
            Action::Deny => &mut expanded.deny,
        };
        for s in &src {
            for d in dst.iter().filter(|d| *d != s) {
                for prt in services.prts(rule.service) {
                    target.push(ExpandedRule {
                        rule: id,
                        action: rule.action,
                        src: *s,
                        dst: *d,
                        prt: *prt,
                    });
                }
            }
        }
    }
    info!(
        "Expanded {} rules into {} permit and {} deny triples",
        model.rules.len(),
        expanded.permit.len(),
        expanded.deny.len()
    );
    Staged::new(expanded, resolver.diagnostics)
}

// ═══════════════════════════════════════════════════════════════════════════
// Paths
// ═══════════════════════════════════════════════════════════════════════════

/// Where traffic to `obj` ends: the router itself for interfaces of
/// managed routers, the object's zone otherwise.
pub fn target_of(model: &Model, obj: ObjId) -> Node {
    let o = model.obj(obj);
    if let ObjKind::Interface(intf) = o.kind {
        let router = model.interface(intf).router;
        if model.router(router).is_managed() {
            return Node::Router(router);
        }
    }
    Node::Zone(o.zone)
}

fn node_name(model: &Model, node: Node) -> String {
    match node {
        Node::Zone(z) => format!("zone:{}", model.zone(z).name),
        Node::Router(r) => format!("router:{}", model.router(r).name),
    }
}

/// Places one path rule at every managed router on the path of each triple.
pub fn group_path_rules(
    model: &Model,
    expanded: &Expanded,
    config: &CompilerConfig,
) -> Staged<PathRules> {
    let mut diagnostics = Diagnostics::new();
    let triples: Vec<&ExpandedRule> = expanded.iter().collect();
    let mut groups: BTreeMap<(ZoneId, Node), Vec<usize>> = BTreeMap::new();
    for (index, triple) in triples.iter().enumerate() {
        let key = (model.obj(triple.src).zone, target_of(model, triple.dst));
        groups.entry(key).or_default().push(index);
    }

    let finder = PathFinder::new(model);
    let targets: BTreeSet<Node> = groups.keys().map(|(_, target)| *target).collect();
    let distances: HashMap<Node, Distances> = targets
        .par_iter()
        .map(|target| (*target, finder.distances(*target)))
        .collect();
    let keys: Vec<(ZoneId, Node)> = groups.keys().copied().collect();
    let paths: Vec<Option<Path>> = keys
        .par_iter()
        .map(|(zone, target)| {
            distances
                .get(target)
                .and_then(|dist| finder.walk(dist, *zone))
        })
        .collect();
    debug!("Computed {} paths for {} targets", paths.len(), targets.len());

    let mut out = PathRules::default();
    let mut no_path = BTreeSet::new();
    let mut missed_tunnel = BTreeSet::new();
    let mut unenforceable = BTreeSet::new();
    for ((zone, target), path) in keys.into_iter().zip(paths) {
        let members = &groups[&(zone, target)];
        let Some(path) = path else {
            for index in members {
                let rule = triples[*index].rule;
                if no_path.insert((rule, zone, target)) {
                    diagnostics.error(
                        DiagKind::Path,
                        format!(
                            "No path from zone:{} to {} for rule:{}",
                            model.zone(zone).name,
                            node_name(model, target),
                            model.rule(rule).name
                        ),
                    );
                }
            }
            continue;
        };
        let managed: Vec<usize> = path
            .hops
            .iter()
            .enumerate()
            .filter(|(_, hop)| model.router(hop.router).is_managed())
            .map(|(n, _)| n)
            .collect();
        let hop_count = path.hops.len();
        let hops = path.hops.clone();
        let mut path_id = None;
        for index in members {
            let triple = triples[*index];
            let rule = model.rule(triple.rule);
            if let Some(tunnel) = rule.tunnel
                && !model.tunnel(tunnel).ends.iter().any(|i| path.uses_interface(*i))
            {
                if missed_tunnel.insert(triple.rule) {
                    diagnostics.error(
                        DiagKind::Path,
                        format!(
                            "rule:{} requires tunnel:{}, but its path doesn't cross it",
                            rule.name,
                            model.tunnel(tunnel).name
                        ),
                    );
                }
                continue;
            }
            if managed.is_empty() {
                if unenforceable.insert((triple.rule, triple.src, triple.dst)) {
                    diagnostics.report(
                        config.check_unenforceable,
                        DiagKind::Path,
                        format!(
                            "Unenforceable rule:{} from {} to {}",
                            rule.name,
                            model.obj(triple.src).name,
                            model.obj(triple.dst).name
                        ),
                    );
                }
                continue;
            }
            let id = *path_id.get_or_insert_with(|| out.add_path(path.clone()));
            for n in &managed {
                let hop = hops[*n];
                let device = model.router(hop.router);
                out.rules.push(PathRule {
                    rule: triple.rule,
                    action: triple.action,
                    src: triple.src,
                    dst: triple.dst,
                    prt: triple.prt,
                    device: hop.router,
                    in_intf: hop.in_intf,
                    out_intf: hop.out_intf,
                    hop: *n,
                    to_dst: hop_count - n - 1,
                    path: id,
                    crypto: None,
                    reversed: false,
                    secondary: false,
                    log: rule.log,
                    stateless: rule.stateless || device.stateless,
                });
            }
        }
    }
    info!(
        "Placed {} path rules on {} paths",
        out.rules.len(),
        out.paths.len()
    );
    Staged::new(out, diagnostics)
}
