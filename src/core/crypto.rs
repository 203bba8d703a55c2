//! Tunnel rules
//!
//! Traffic entering a device through a tunnel interface arrives twice: as
//! encrypted transport packets at the real interface and, after
//! decryption, as plaintext at the tunnel interface. Path rules touching a
//! tunnel interface are marked [`CryptoSide::Plain`]; for every plaintext
//! rule entering through a tunnel, encrypted rules for the transport are
//! added along the transport path.

use crate::core::diag::{Diagnostics, Staged};
use crate::core::expand::{Crypto, CryptoSide, PathRule, PathRules};
use crate::core::model::{Action, InterfaceId, Model, RuleId};
use crate::core::topology::{Hop, PathFinder};
use std::collections::BTreeSet;
use tracing::debug;

/// Marks plaintext rules and adds their encrypted transport rules.
pub fn expand_crypto(model: &Model, path_rules: PathRules) -> Staged<PathRules> {
    let finder = PathFinder::new(model);
    let PathRules { rules, paths } = path_rules;
    let mut out = PathRules {
        rules: Vec::with_capacity(rules.len()),
        paths,
    };
    let mut done: BTreeSet<(RuleId, InterfaceId)> = BTreeSet::new();
    let mut encrypted = Vec::new();

    for mut rule in rules {
        let tunnel_intf = [Some(rule.in_intf), rule.out_intf]
            .into_iter()
            .flatten()
            .find(|i| model.is_tunnel_interface(*i));
        if let Some(intf) = tunnel_intf
            && let Some(end) = model.interface(intf).tunnel
        {
            rule.crypto = Some(Crypto {
                side: CryptoSide::Plain,
                tunnel: end.tunnel,
            });
        }
        if model.is_tunnel_interface(rule.in_intf) && done.insert((rule.rule, rule.in_intf)) {
            encrypted.push(rule.clone());
        }
        out.rules.push(rule);
    }

    for plain in encrypted {
        add_transport_rules(model, &finder, &plain, &mut out);
    }
    debug!("Tunnel expansion produced {} path rules", out.rules.len());
    Staged::new(out, Diagnostics::new())
}

/// Encrypted rules from the peer's real interface to the local real
/// interface, at every managed router on the transport path and at the
/// device itself.
fn add_transport_rules(model: &Model, finder: &PathFinder<'_>, plain: &PathRule, out: &mut PathRules) {
    let Some(end) = model.interface(plain.in_intf).tunnel else {
        return;
    };
    let Some(peer) = model.tunnel_peer(plain.in_intf) else {
        return;
    };
    let Some(peer_end) = model.interface(peer).tunnel else {
        return;
    };
    let (local_real, peer_real) = (model.interface(end.real), model.interface(peer_end.real));
    let (Some(src), Some(dst)) = (peer_real.obj, local_real.obj) else {
        return;
    };
    let Some(mut path) = finder.path(peer_real.zone, local_real.zone) else {
        return;
    };
    path.hops.push(Hop {
        router: plain.device,
        in_intf: end.real,
        out_intf: None,
    });
    let hops = path.hops.clone();
    let hop_count = hops.len();
    let tunnel = model.tunnel(end.tunnel);
    let path_id = out.add_path(path);
    for (n, hop) in hops.iter().enumerate() {
        let device = model.router(hop.router);
        if !device.is_managed() {
            continue;
        }
        out.rules.push(PathRule {
            rule: plain.rule,
            action: Action::Permit,
            src,
            dst,
            prt: tunnel.transport,
            device: hop.router,
            in_intf: hop.in_intf,
            out_intf: hop.out_intf,
            hop: n,
            to_dst: hop_count - n - 1,
            path: path_id,
            crypto: Some(Crypto {
                side: CryptoSide::Encrypted,
                tunnel: end.tunnel,
            }),
            reversed: false,
            secondary: false,
            log: false,
            stateless: device.stateless,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use crate::core::expand::{convert_hosts_in_rules, group_path_rules};
    use crate::core::service::{Prt, normalize_services};
    use crate::core::test_helpers::spoke_and_hub;

    fn expand(model: &Model) -> PathRules {
        let config = CompilerConfig::default();
        let services = normalize_services(model).value;
        let expanded = convert_hosts_in_rules(model, &services, &config).value;
        let placed = group_path_rules(model, &expanded, &config).value;
        expand_crypto(model, placed).value
    }

    #[test]
    fn test_plaintext_and_encrypted_rule() {
        let model = spoke_and_hub().build();
        let rules = expand(&model).rules;
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].rule, rules[1].rule);

        let plain = &rules[0];
        assert_eq!(plain.crypto.map(|c| c.side), Some(CryptoSide::Plain));
        assert_eq!(plain.in_intf, model.find_interface("r2.vpn").unwrap());

        let enc = &rules[1];
        assert_eq!(enc.crypto.map(|c| c.side), Some(CryptoSide::Encrypted));
        assert_eq!(enc.prt, Prt::Proto(50));
        assert_eq!(enc.in_intf, model.find_interface("r2.wan").unwrap());
        assert_eq!(enc.out_intf, None);
        assert_eq!(enc.src, model.find_obj("interface:r1.wan").unwrap());
        assert_eq!(enc.dst, model.find_obj("interface:r2.wan").unwrap());
    }

    #[test]
    fn test_rules_without_tunnel_are_untouched() {
        let model = spoke_and_hub()
            .network("n3", "10.3.3.0/24", "z3")
            .interface("r2", "mgmt", "n3", Some("10.3.3.1"))
            .rule("local", &["network:n3"], &["network:n2"], "web")
            .build();
        let rules = expand(&model).rules;
        let local = model.find_rule("local").unwrap();
        let local_rules: Vec<&PathRule> = rules.iter().filter(|r| r.rule == local).collect();
        assert_eq!(local_rules.len(), 1);
        assert_eq!(local_rules[0].crypto, None);
    }
}
