//! Pipeline driver
//!
//! Runs the compiler stages in order over an imported [`Model`]. Every stage
//! hands its diagnostics back; the driver merges them and stops at the
//! stage boundaries listed in [`Stage`] when errors make the remaining
//! stages meaningless.

use crate::config::CompilerConfig;
use crate::core::analyze::{
    RedundancyRecord, check_unused_groups, filter_local_transit, mark_managed_local,
    remove_redundancy,
};
use crate::core::crypto::expand_crypto;
use crate::core::diag::Diagnostics;
use crate::core::distribute::{
    DeviceConfig, Distribution, mark_secondary_rules, rules_distribution,
    set_policy_distribution_ip,
};
use crate::core::expand::{PathRule, check_service_owner, convert_hosts_in_rules, group_path_rules};
use crate::core::model::Model;
use crate::core::nat::distribute_nat_info;
use crate::core::nat_rules::{check_dynamic_nat_rules, check_unstable_nat_rules};
use crate::core::reverse::gen_reverse_rules;
use crate::core::routes::find_active_routes;
use crate::core::service::normalize_services;
use crate::core::subnets::{find_subnets_in_nat_domain, find_subnets_in_zone, link_reroute_permit};
use crate::core::topology::check_topology;
use std::fmt;
use tracing::{info, warn};

/// Stage boundaries the pipeline can halt at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
pub enum Stage {
    /// NAT domains, NAT definitions and topology
    #[strum(serialize = "topology")]
    Topology,
    /// Zone subnets, reroute permits and services
    #[strum(serialize = "resolution")]
    Resolution,
    /// Rule expansion and analysis
    #[strum(serialize = "analysis")]
    Analysis,
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct Compiled {
    /// One config per managed router, in router name order
    pub devices: Vec<DeviceConfig>,
    pub audit: Vec<RedundancyRecord>,
    /// Warnings and infos, sorted for display
    pub diagnostics: Diagnostics,
    /// Final path rules including reverse rules and secondary marks
    pub rules: Vec<PathRule>,
}

/// Run stopped at a stage boundary because of errors.
#[derive(Debug, Clone)]
pub struct Halted {
    pub stage: Stage,
    pub diagnostics: Diagnostics,
}

impl fmt::Display for Halted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Aborted after {} stage with {} errors",
            self.stage,
            self.diagnostics.error_count()
        )
    }
}

fn halt(stage: Stage, mut diagnostics: Diagnostics) -> Halted {
    diagnostics.sort_for_display();
    warn!(
        "Halting after {} stage: {} errors",
        stage,
        diagnostics.error_count()
    );
    Halted { stage, diagnostics }
}

/// Compiles `model` into device configs.
///
/// Parallel work runs on a pool of `config.threads` workers, or on the
/// global rayon pool if unset.
///
/// # Errors
///
/// Returns [`Halted`] with all diagnostics collected so far if a stage
/// boundary is reached with errors.
pub fn compile(model: &Model, config: &CompilerConfig) -> Result<Compiled, Halted> {
    let Some(threads) = config.threads else {
        return run(model, config);
    };
    match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
        Ok(pool) => pool.install(|| run(model, config)),
        Err(e) => {
            warn!("Failed to build pool of {threads} threads, using global pool: {e}");
            run(model, config)
        }
    }
}

fn run(model: &Model, config: &CompilerConfig) -> Result<Compiled, Halted> {
    let mut diagnostics = Diagnostics::new();

    info!(
        "Compiling {} zones, {} routers, {} rules",
        model.zones.len(),
        model.routers.len(),
        model.rules.len()
    );
    let domains = diagnostics.absorb(distribute_nat_info(model));
    diagnostics.absorb(check_topology(model));
    if diagnostics.has_fatal_errors() {
        return Err(halt(Stage::Topology, diagnostics));
    }

    let zone_subnets = diagnostics.absorb(find_subnets_in_zone(model, config));
    let reroute = diagnostics.absorb(link_reroute_permit(model));
    let services = diagnostics.absorb(normalize_services(model));
    if diagnostics.has_errors() {
        return Err(halt(Stage::Resolution, diagnostics));
    }

    diagnostics.absorb(check_service_owner(model, config));
    let expanded = diagnostics.absorb(convert_hosts_in_rules(model, &services, config));
    let path_rules = diagnostics.absorb(group_path_rules(model, &expanded, config));
    let views = diagnostics.absorb(find_subnets_in_nat_domain(model, &domains));
    let path_rules = diagnostics.absorb(check_unstable_nat_rules(model, &domains, &views, path_rules));
    let path_rules = diagnostics.absorb(expand_crypto(model, path_rules));

    let local = mark_managed_local(model);
    let path_rules = filter_local_transit(model, &local, path_rules);
    let path_rules = diagnostics.absorb(check_dynamic_nat_rules(model, &domains, &views, path_rules));
    diagnostics.absorb(check_unused_groups(model));
    let analyzed = diagnostics.absorb(remove_redundancy(model, &domains, &views, path_rules, config));
    if diagnostics.has_errors() {
        return Err(halt(Stage::Analysis, diagnostics));
    }

    let distribution_ips = diagnostics.absorb(set_policy_distribution_ip(model, &domains, &views));
    let routes = diagnostics.absorb(find_active_routes(model, &domains, &views));
    let rules = gen_reverse_rules(model, analyzed.rules.rules);
    let rules = mark_secondary_rules(model, &local, rules);
    let dist = Distribution {
        model,
        domains: &domains,
        views: &views,
        zone_subnets: &zone_subnets,
        routes: &routes,
        reroute: &reroute,
        distribution_ips: &distribution_ips,
    };
    let devices = rules_distribution(&dist, &rules);

    diagnostics.sort_for_display();
    info!(
        "Compiled {} devices, {} warnings",
        devices.len(),
        diagnostics.warning_count()
    );
    Ok(Compiled {
        devices,
        audit: analyzed.audit,
        diagnostics,
        rules,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diag::DiagKind;
    use crate::core::test_helpers::two_zones;

    #[test]
    fn test_compile_two_zones() {
        let model = two_zones()
            .service("web", &["tcp 80"])
            .rule("r", &["network:n1"], &["network:n2"], "web")
            .build();
        let compiled = compile(&model, &CompilerConfig::default()).unwrap();
        assert_eq!(compiled.devices.len(), 1);
        let acl = compiled.devices[0].acl("r1.e0").unwrap();
        assert_eq!(acl.lines.len(), 1);
        assert_eq!(acl.lines[0].prt.to_string(), "tcp 80");
    }

    #[test]
    fn test_resolution_errors_halt() {
        let model = two_zones()
            .network("n3", "10.1.1.0/24", "z1")
            .service("web", &["tcp 80"])
            .rule("r", &["network:n1"], &["network:n2"], "web")
            .build();
        let halted = compile(&model, &CompilerConfig::default()).unwrap_err();
        assert_eq!(halted.stage, Stage::Resolution);
        assert!(!halted.diagnostics.messages(DiagKind::Subnet).is_empty());
    }

    #[test]
    fn test_fixed_thread_count() {
        let model = two_zones()
            .service("web", &["tcp 80"])
            .rule("r", &["network:n1"], &["network:n2"], "web")
            .build();
        let config = CompilerConfig {
            threads: Some(2),
            ..CompilerConfig::default()
        };
        let pooled = compile(&model, &config).unwrap();
        let global = compile(&model, &CompilerConfig::default()).unwrap();
        assert_eq!(pooled.devices, global.devices);
    }
}
