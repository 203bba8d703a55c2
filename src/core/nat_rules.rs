//! NAT checks on path rules
//!
//! Filters can only match addresses that are the same everywhere a packet
//! is inspected. Path rules that would have to match a moving or invisible
//! address are reported and dropped.

use crate::core::diag::{DiagKind, Diagnostics, Staged};
use crate::core::expand::PathRules;
use crate::core::model::{Model, ObjId, PathId, RuleId, ZoneId};
use crate::core::nat::{NatAddr, NatDomains};
use crate::core::subnets::NatViews;
use ipnetwork::IpNetwork;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Distinct translated addresses of `obj` along a path.
fn translations(
    domains: &NatDomains,
    views: &NatViews,
    zones: &[ZoneId],
    obj: ObjId,
) -> BTreeSet<IpNetwork> {
    zones
        .iter()
        .map(|z| views.view(domains.of_zone(*z)).addr(obj))
        .filter(NatAddr::is_translated)
        .filter_map(|a| a.ip())
        .collect()
}

/// Drops path rules whose endpoint is translated to more than one address
/// along its path.
pub fn check_unstable_nat_rules(
    model: &Model,
    domains: &NatDomains,
    views: &NatViews,
    path_rules: PathRules,
) -> Staged<PathRules> {
    let mut diagnostics = Diagnostics::new();
    let mut stable: HashMap<(PathId, ObjId), bool> = HashMap::new();
    let mut reported = BTreeSet::new();
    let mut unstable: BTreeSet<(RuleId, PathId)> = BTreeSet::new();

    for rule in &path_rules.rules {
        for obj in [rule.src, rule.dst] {
            let key = (rule.path, obj);
            if stable.contains_key(&key) {
                if !stable[&key] {
                    unstable.insert((rule.rule, rule.path));
                }
                continue;
            }
            let addrs = translations(domains, views, &path_rules.path(rule.path).zones, obj);
            let ok = addrs.len() <= 1;
            stable.insert(key, ok);
            if ok {
                continue;
            }
            unstable.insert((rule.rule, rule.path));
            if reported.insert((rule.rule, obj)) {
                let list: Vec<String> = addrs.iter().map(ToString::to_string).collect();
                diagnostics.error(
                    DiagKind::UnstableNat,
                    format!(
                        "Unstable NAT of {} in rule:{}, translated to {} on its path",
                        model.obj(obj).name,
                        model.rule(rule.rule).name,
                        list.join(" and ")
                    ),
                );
            }
        }
    }

    let PathRules { rules, paths } = path_rules;
    let before = rules.len();
    let rules: Vec<_> = rules
        .into_iter()
        .filter(|r| !unstable.contains(&(r.rule, r.path)))
        .collect();
    debug!("Unstable NAT excluded {} path rules", before - rules.len());
    Staged::new(PathRules { rules, paths }, diagnostics)
}

/// Drops rules whose destination is dynamically translated or hidden, or
/// whose source is hidden, at one of their enforcement points.
///
/// The rule is excluded on the whole path, not only at the device where
/// the address can't be matched. Dynamically translated sources stay and
/// are filtered by their pool.
pub fn check_dynamic_nat_rules(
    model: &Model,
    domains: &NatDomains,
    views: &NatViews,
    path_rules: PathRules,
) -> Staged<PathRules> {
    let mut diagnostics = Diagnostics::new();
    let mut reported = BTreeSet::new();
    let mut excluded: BTreeSet<(RuleId, PathId)> = BTreeSet::new();
    for r in &path_rules.rules {
        let domain = domains.of_interface(model, r.in_intf);
        let view = views.view(domain);
        let problem = match (view.addr(r.src), view.addr(r.dst)) {
            (NatAddr::Hidden, _) => Some((r.src, "hidden")),
            (_, NatAddr::Hidden) => Some((r.dst, "hidden")),
            (_, NatAddr::Dynamic(_)) => Some((r.dst, "dynamically translated")),
            _ => None,
        };
        let Some((obj, how)) = problem else {
            continue;
        };
        excluded.insert((r.rule, r.path));
        if reported.insert((r.rule, obj, domain)) {
            diagnostics.error(
                DiagKind::DynamicNat,
                format!(
                    "{} is {how} in {} and can't be filtered for rule:{} at router:{}",
                    model.obj(obj).name,
                    domains.domain(domain).name,
                    model.rule(r.rule).name,
                    model.router(r.device).name
                ),
            );
        }
    }

    let PathRules { rules, paths } = path_rules;
    let before = rules.len();
    let rules: Vec<_> = rules
        .into_iter()
        .filter(|r| !excluded.contains(&(r.rule, r.path)))
        .collect();
    debug!("Dynamic NAT excluded {} path rules", before - rules.len());
    Staged::new(PathRules { rules, paths }, diagnostics)
}
