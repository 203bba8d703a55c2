//! Redundancy and consistency analysis
//!
//! - [`mark_managed_local`] / [`filter_local_transit`]: transit traffic
//!   isn't filtered at `managed = local` routers
//! - [`check_unused_groups`]: definitions no rule reaches
//! - [`remove_redundancy`]: per point reductions from
//!   [`crate::core::redundancy`], with an audit record for every removal

use crate::config::CompilerConfig;
use crate::core::diag::{DiagKind, Diagnostics, Staged};
use crate::core::expand::{PathRule, PathRules, Point};
use crate::core::model::{
    GroupId, ManagedKind, Model, ObjId, ObjRef, RouterId, ServiceId, ZoneId,
};
use crate::core::nat::NatDomains;
use crate::core::redundancy::{Removal, RemovalKind, reduce_point};
use crate::core::subnets::NatViews;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::info;

// ═══════════════════════════════════════════════════════════════════════════
// Managed local
// ═══════════════════════════════════════════════════════════════════════════

/// Router each zone is local to, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalRouters {
    by_zone: Vec<Option<RouterId>>,
}

impl LocalRouters {
    pub fn of_zone(&self, zone: ZoneId) -> Option<RouterId> {
        self.by_zone.get(zone.index()).copied().flatten()
    }

    pub fn is_local(&self, model: &Model, obj: ObjId, router: RouterId) -> bool {
        self.of_zone(model.obj(obj).zone) == Some(router)
    }
}

/// Groups zones connected through unmanaged routers into clusters. A
/// cluster bordered by exactly one managed router is local to it.
pub fn mark_managed_local(model: &Model) -> LocalRouters {
    let mut by_zone = vec![None; model.zones.len()];
    let mut seen = vec![false; model.zones.len()];
    for start in model.zone_ids() {
        if seen[start.index()] {
            continue;
        }
        seen[start.index()] = true;
        let mut cluster = vec![start];
        let mut border = BTreeSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(zone) = queue.pop_front() {
            for intf in &model.zone(zone).interfaces {
                let router_id = model.interface(*intf).router;
                let router = model.router(router_id);
                if router.is_managed() {
                    border.insert(router_id);
                    continue;
                }
                for other in &router.interfaces {
                    let next = model.interface(*other).zone;
                    if !seen[next.index()] {
                        seen[next.index()] = true;
                        cluster.push(next);
                        queue.push_back(next);
                    }
                }
            }
        }
        if border.len() == 1
            && let Some(router) = border.first()
        {
            for zone in cluster {
                by_zone[zone.index()] = Some(*router);
            }
        }
    }
    LocalRouters { by_zone }
}

/// Drops path rules at `managed = local` routers whose endpoints are both
/// somewhere else.
pub fn filter_local_transit(model: &Model, local: &LocalRouters, path_rules: PathRules) -> PathRules {
    let PathRules { rules, paths } = path_rules;
    let rules = rules
        .into_iter()
        .filter(|r| {
            model.router(r.device).managed != Some(ManagedKind::Local)
                || local.is_local(model, r.src, r.device)
                || local.is_local(model, r.dst, r.device)
        })
        .collect();
    PathRules { rules, paths }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unused definitions
// ═══════════════════════════════════════════════════════════════════════════

/// Groups and services no rule references, directly or through nesting.
pub fn check_unused_groups(model: &Model) -> Staged<()> {
    let mut diagnostics = Diagnostics::new();
    let mut used_groups: BTreeSet<GroupId> = BTreeSet::new();
    let mut stack: Vec<GroupId> = Vec::new();
    let direct = |r: &ObjRef| match r {
        ObjRef::Group(g) => Some(*g),
        _ => None,
    };
    for rule in &model.rules {
        stack.extend(rule.src.iter().chain(&rule.dst).filter_map(direct));
    }
    while let Some(group) = stack.pop() {
        if used_groups.insert(group) {
            stack.extend(model.group(group).members.iter().filter_map(direct));
        }
    }
    for (index, group) in model.groups.iter().enumerate() {
        if !used_groups.contains(&GroupId::from_index(index)) {
            diagnostics.warning(DiagKind::Unused, format!("unused group:{}", group.name));
        }
    }

    let used_services: BTreeSet<_> = model.rules.iter().map(|r| r.service).collect();
    for (id, service) in model.services.iter().enumerate() {
        if !used_services.contains(&ServiceId::from_index(id)) {
            diagnostics.warning(DiagKind::Unused, format!("unused service:{}", service.name));
        }
    }
    Staged::new((), diagnostics)
}

// ═══════════════════════════════════════════════════════════════════════════
// Redundancy
// ═══════════════════════════════════════════════════════════════════════════

/// One removed path rule, as written to the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancyRecord {
    pub kind: RemovalKind,
    pub device: String,
    pub interface: String,
    pub removed: String,
    pub by: String,
}

/// `permit network:a -> host:b tcp 80 (rule:r)`
pub fn describe(model: &Model, rule: &PathRule) -> String {
    format!(
        "{} {} -> {} {} (rule:{})",
        rule.action,
        model.obj(rule.src).name,
        model.obj(rule.dst).name,
        rule.prt,
        model.rule(rule.rule).name
    )
}

fn record(model: &Model, removal: &Removal) -> RedundancyRecord {
    let r = &removal.removed;
    RedundancyRecord {
        kind: removal.kind,
        device: model.router(r.device).name.clone(),
        interface: model.interface(r.in_intf).name.clone(),
        removed: describe(model, r),
        by: describe(model, &removal.by),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Analyzed {
    pub rules: PathRules,
    pub audit: Vec<RedundancyRecord>,
}

/// Reduces the rules of every enforcement point in parallel.
pub fn remove_redundancy(
    model: &Model,
    domains: &NatDomains,
    views: &NatViews,
    path_rules: PathRules,
    config: &CompilerConfig,
) -> Staged<Analyzed> {
    let PathRules { rules, paths } = path_rules;
    let mut points: BTreeMap<Point, Vec<PathRule>> = BTreeMap::new();
    for rule in rules {
        points.entry(rule.point()).or_default().push(rule);
    }
    let reduced: Vec<_> = points
        .into_par_iter()
        .map(|(point, rules)| {
            let view = views.view(domains.of_interface(model, point.in_intf));
            reduce_point(rules, view, config.combine_subnets)
        })
        .collect();

    let mut diagnostics = Diagnostics::new();
    let mut kept = Vec::new();
    let mut audit = Vec::new();
    for point in reduced {
        kept.extend(point.rules);
        for removal in &point.removals {
            let rec = record(model, removal);
            if config.report_redundant_rules {
                diagnostics.info(
                    DiagKind::Redundancy,
                    format!(
                        "Removed {} rule at interface:{}: {} covered by {}",
                        rec.kind, rec.interface, rec.removed, rec.by
                    ),
                );
            }
            audit.push(rec);
        }
    }
    info!(
        "Redundancy analysis kept {} path rules, removed {}",
        kept.len(),
        audit.len()
    );
    Staged::new(
        Analyzed {
            rules: PathRules { rules: kept, paths },
            audit,
        },
        diagnostics,
    )
}
