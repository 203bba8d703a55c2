//! Compiler core
//!
//! Stages, leaf first:
//!
//! - [`model`], [`import`], [`topology`]: arena object model, JSON import
//!   and the path finder
//! - [`nat`]: NAT domains and address translation
//! - [`subnets`], [`nat_rules`]: subnet relations per zone and per NAT
//!   domain, unstable and dynamic NAT checks, reroute permits
//! - [`service`], [`expand`], [`crypto`], [`reverse`]: rule expansion
//!   into path rules
//! - [`analyze`], [`redundancy`]: local routers, unused objects and
//!   redundant path rules
//! - [`routes`], [`distribute`]: active routes and per device configs
//! - [`pipeline`]: runs the stages in order
//! - [`emit`]: writes device configs
//! - [`diag`], [`error`], [`addr`]: diagnostics, errors, address helpers

pub mod addr;
pub mod analyze;
pub mod crypto;
pub mod diag;
pub mod distribute;
pub mod emit;
pub mod error;
pub mod expand;
pub mod import;
pub mod model;
pub mod nat;
pub mod nat_rules;
pub mod pipeline;
pub mod redundancy;
pub mod reverse;
pub mod routes;
pub mod service;
pub mod subnets;
pub mod topology;

#[cfg(test)]
pub mod test_helpers;
