//! netpolc - network policy compiler
//!
//! Compiles a declarative security policy over logical objects (hosts,
//! networks, groups, services) and a described topology (zones, routers,
//! interfaces, NAT domains) into per device packet filter rule sets.
//!
//! # Architecture
//!
//! - [`core`] - Object model, compiler stages and the pipeline driver
//! - [`audit`] - Log of path rules removed as redundant
//! - [`validators`] - Name and reference validation for model import
//! - [`config`] - Compiler configuration
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Example
//!
//! ```no_run
//! # async fn run() -> netpolc::Result<()> {
//! let model = netpolc::core::import::load_policy("policy.json".as_ref()).await?;
//! let config = netpolc::config::CompilerConfig::default();
//! match netpolc::core::pipeline::compile(&model, &config) {
//!     Ok(compiled) => {
//!         netpolc::core::emit::emit("out".as_ref(), &compiled).await?;
//!     }
//!     Err(halted) => eprintln!("{halted}"),
//! }
//! # Ok(())
//! # }
//! ```

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::model::Model;
pub use core::pipeline::{Compiled, Halted, compile};
