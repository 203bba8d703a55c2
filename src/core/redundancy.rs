//! Rule set reductions at one enforcement point
//!
//! All reductions compare addresses as seen from the point's NAT domain and
//! only ever remove a rule that another rule of the same action fully
//! covers. Deny rules are filtered before permit rules, so removing a
//! covered rule never changes which packets pass.
//!
//! Order: duplicates, combine, duplicates, supernet, redundant.

use crate::core::addr;
use crate::core::expand::{Crypto, PathRule};
use crate::core::model::{Action, InterfaceId, ObjId};
use crate::core::service::Prt;
use crate::core::subnets::AddressView;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum RemovalKind {
    #[strum(serialize = "duplicate")]
    Duplicate,
    /// Merged with its sibling into the enclosing block
    #[strum(serialize = "combined")]
    Combined,
    #[strum(serialize = "supernet")]
    Supernet,
    #[strum(serialize = "redundant")]
    Redundant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    pub kind: RemovalKind,
    pub removed: PathRule,
    /// Rule that covers the removed one
    pub by: PathRule,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reduced {
    pub rules: Vec<PathRule>,
    pub removals: Vec<Removal>,
}

/// Runs every reduction on the rules of one point.
pub fn reduce_point(rules: Vec<PathRule>, view: &dyn AddressView, combine: bool) -> Reduced {
    let mut removals = Vec::new();
    let mut rules = remove_duplicates(rules, &mut removals);
    if combine {
        rules = combine_subnets(rules, view, &mut removals);
        rules = remove_duplicates(rules, &mut removals);
    }
    rules = remove_supernet_rules(rules, view, &mut removals);
    rules = remove_redundant_rules(rules, view, &mut removals);
    Reduced { rules, removals }
}

/// A covering rule may only replace `removed` if the device handles both
/// identically apart from the match.
fn guard(removed: &PathRule, by: &PathRule) -> bool {
    let ok = (!removed.log || by.log)
        && removed.crypto == by.crypto
        && removed.stateless == by.stateless
        && (!removed.stateless || removed.out_intf == by.out_intf);
    if !ok {
        debug!(
            rule = removed.rule.0,
            by = by.rule.0,
            "Keeping covered path rule, flags of covering rule differ"
        );
    }
    ok
}

/// Everything but the endpoints.
type FlagKey = (Action, Prt, Option<InterfaceId>, Option<Crypto>, bool, bool, bool);

fn flag_key(r: &PathRule) -> FlagKey {
    (
        r.action,
        r.prt,
        r.out_intf,
        r.crypto,
        r.log,
        r.stateless,
        r.reversed,
    )
}

/// Collapses exact duplicates into the first occurrence.
pub fn remove_duplicates(rules: Vec<PathRule>, removals: &mut Vec<Removal>) -> Vec<PathRule> {
    let mut first: HashMap<(ObjId, ObjId, FlagKey), usize> = HashMap::new();
    let mut kept: Vec<PathRule> = Vec::with_capacity(rules.len());
    for rule in rules {
        let key = (rule.src, rule.dst, flag_key(&rule));
        if let Some(index) = first.get(&key) {
            removals.push(Removal {
                kind: RemovalKind::Duplicate,
                by: kept[*index].clone(),
                removed: rule,
            });
            continue;
        }
        first.insert(key, kept.len());
        kept.push(rule);
    }
    kept
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Src,
    Dst,
}

impl Side {
    const fn get(self, r: &PathRule) -> ObjId {
        match self {
            Side::Src => r.src,
            Side::Dst => r.dst,
        }
    }

    const fn other(self, r: &PathRule) -> ObjId {
        match self {
            Side::Src => r.dst,
            Side::Dst => r.src,
        }
    }

    fn set(self, r: &mut PathRule, obj: ObjId) {
        match self {
            Side::Src => r.src = obj,
            Side::Dst => r.dst = obj,
        }
    }
}

/// Merges rules for both halves of a block into one rule for the object
/// whose address is exactly that block, until nothing merges anymore.
pub fn combine_subnets(
    mut rules: Vec<PathRule>,
    view: &dyn AddressView,
    removals: &mut Vec<Removal>,
) -> Vec<PathRule> {
    loop {
        let mut changed = false;
        for side in [Side::Src, Side::Dst] {
            let (next, merged) = combine_once(rules, view, side, removals);
            rules = next;
            changed |= merged;
        }
        if !changed {
            return rules;
        }
    }
}

fn combine_once(
    rules: Vec<PathRule>,
    view: &dyn AddressView,
    side: Side,
    removals: &mut Vec<Removal>,
) -> (Vec<PathRule>, bool) {
    // Everything but the combined side must match.
    let key = |r: &PathRule| (r.rule, side.other(r), flag_key(r));
    let mut by_ip = HashMap::new();
    for (index, rule) in rules.iter().enumerate() {
        if let Some(ip) = view.ip(side.get(rule)) {
            by_ip.entry((key(rule), ip)).or_insert(index);
        }
    }

    let mut used = BTreeSet::new();
    let mut merged = Vec::new();
    for (index, rule) in rules.iter().enumerate() {
        if used.contains(&index) {
            continue;
        }
        let Some(ip) = view.ip(side.get(rule)) else {
            continue;
        };
        let Some(sibling) = addr::buddy(&ip) else {
            continue;
        };
        let Some(&other) = by_ip.get(&(key(rule), sibling)) else {
            continue;
        };
        if other == index || used.contains(&other) {
            continue;
        }
        let Some(parent) = addr::supernet(&ip, ip.prefix() - 1)
            .and_then(|block| view.obj_at(&block))
        else {
            continue;
        };
        used.insert(index);
        used.insert(other);
        let mut combined = rule.clone();
        side.set(&mut combined, parent);
        merged.push((index, other, combined));
    }
    if merged.is_empty() {
        return (rules, false);
    }

    for (a, b, combined) in &merged {
        for half in [a, b] {
            removals.push(Removal {
                kind: RemovalKind::Combined,
                removed: rules[*half].clone(),
                by: combined.clone(),
            });
        }
    }
    let mut replacement: HashMap<usize, PathRule> = HashMap::new();
    for (a, _, combined) in merged {
        replacement.insert(a, combined);
    }
    let next = rules
        .into_iter()
        .enumerate()
        .filter_map(|(index, rule)| match replacement.remove(&index) {
            Some(combined) => Some(combined),
            None if used.contains(&index) => None,
            None => Some(rule),
        })
        .collect();
    (next, true)
}

fn ips(rules: &[PathRule], view: &dyn AddressView) -> Vec<Option<(IpNetwork, IpNetwork)>> {
    rules
        .iter()
        .map(|r| Some((view.ip(r.src)?, view.ip(r.dst)?)))
        .collect()
}

fn retain_unmarked(rules: Vec<PathRule>, removed: &BTreeSet<usize>) -> Vec<PathRule> {
    rules
        .into_iter()
        .enumerate()
        .filter(|(index, _)| !removed.contains(index))
        .map(|(_, rule)| rule)
        .collect()
}

/// Removes rules whose src and dst are inside those of another rule with the
/// same action and a protocol at least as large, one endpoint strictly.
pub fn remove_supernet_rules(
    rules: Vec<PathRule>,
    view: &dyn AddressView,
    removals: &mut Vec<Removal>,
) -> Vec<PathRule> {
    let ips = ips(&rules, view);
    let mut index: HashMap<(Action, IpNetwork, IpNetwork), Vec<usize>> = HashMap::new();
    let mut src_prefixes = BTreeSet::new();
    let mut dst_prefixes = BTreeSet::new();
    for (i, (rule, ip)) in rules.iter().zip(&ips).enumerate() {
        if let Some((s, d)) = ip {
            index.entry((rule.action, *s, *d)).or_default().push(i);
            src_prefixes.insert(s.prefix());
            dst_prefixes.insert(d.prefix());
        }
    }

    let mut removed = BTreeSet::new();
    'rules: for (i, (rule, ip)) in rules.iter().zip(&ips).enumerate() {
        let Some((s, d)) = ip else {
            continue;
        };
        for ps in src_prefixes.range(..=s.prefix()) {
            for pd in dst_prefixes.range(..=d.prefix()) {
                if *ps == s.prefix() && *pd == d.prefix() {
                    continue;
                }
                let (Some(outer_s), Some(outer_d)) =
                    (addr::supernet(s, *ps), addr::supernet(d, *pd))
                else {
                    continue;
                };
                let Some(candidates) = index.get(&(rule.action, outer_s, outer_d)) else {
                    continue;
                };
                for c in candidates {
                    let cover = &rules[*c];
                    if cover.prt.contains(&rule.prt) && guard(rule, cover) {
                        removals.push(Removal {
                            kind: RemovalKind::Supernet,
                            removed: rule.clone(),
                            by: cover.clone(),
                        });
                        removed.insert(i);
                        continue 'rules;
                    }
                }
            }
        }
    }
    retain_unmarked(rules, &removed)
}

/// Removes rules with the same src and dst addresses as another rule of the
/// same action whose protocol strictly contains theirs.
pub fn remove_redundant_rules(
    rules: Vec<PathRule>,
    view: &dyn AddressView,
    removals: &mut Vec<Removal>,
) -> Vec<PathRule> {
    let ips = ips(&rules, view);
    let mut groups: HashMap<(Action, IpNetwork, IpNetwork), Vec<usize>> = HashMap::new();
    for (i, (rule, ip)) in rules.iter().zip(&ips).enumerate() {
        if let Some((s, d)) = ip {
            groups.entry((rule.action, *s, *d)).or_default().push(i);
        }
    }

    let mut removed = BTreeSet::new();
    for (i, (rule, ip)) in rules.iter().zip(&ips).enumerate() {
        let Some((s, d)) = ip else {
            continue;
        };
        let cover = groups[&(rule.action, *s, *d)].iter().map(|c| &rules[*c]).find(|c| {
            c.prt != rule.prt && c.prt.contains(&rule.prt) && guard(rule, c)
        });
        if let Some(cover) = cover {
            removals.push(Removal {
                kind: RemovalKind::Redundant,
                removed: rule.clone(),
                by: cover.clone(),
            });
            removed.insert(i);
        }
    }
    retain_unmarked(rules, &removed)
}
