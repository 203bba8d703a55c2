//! Reverse rules for stateless filtering
//!
//! A stateless filter doesn't remember connections, so answer packets need
//! their own rule on the interface the request left through.

use crate::core::expand::PathRule;
use crate::core::model::{Action, Model};
use tracing::debug;

/// Mirror rule of `rule`, if it needs one.
fn mirror(rule: &PathRule) -> Option<PathRule> {
    if rule.action != Action::Permit || rule.reversed || !rule.stateless {
        return None;
    }
    let out_intf = rule.out_intf?;
    Some(PathRule {
        src: rule.dst,
        dst: rule.src,
        prt: rule.prt.reverse(),
        in_intf: out_intf,
        out_intf: Some(rule.in_intf),
        reversed: true,
        ..rule.clone()
    })
}

/// Appends the mirror rules of permit rules filtered statelessly.
///
/// Rules addressed to the device itself have no outgoing interface and
/// get no mirror rule.
pub fn gen_reverse_rules(model: &Model, mut rules: Vec<PathRule>) -> Vec<PathRule> {
    let reversed: Vec<PathRule> = rules
        .iter()
        .filter(|r| model.router(r.device).is_managed())
        .filter_map(mirror)
        .collect();
    debug!("Generated {} reverse rules", reversed.len());
    rules.extend(reversed);
    rules
}
