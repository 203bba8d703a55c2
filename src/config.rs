//! Compiler configuration
//!
//! Every field has a default so a partial `netpolc.json` is valid. The
//! lookup order is: explicit `--config` path, `netpolc.json` next to the
//! policy model, the user config directory, built-in defaults.

use crate::core::error::{Error, Result};
use crate::utils::get_config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name of the configuration file searched next to the model and in the
/// user config directory.
pub const CONFIG_FILE_NAME: &str = "netpolc.json";

/// Severity with which an optional check reports its findings.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum CheckLevel {
    /// Check is disabled
    #[strum(serialize = "no")]
    No,
    /// Findings are warnings
    #[default]
    #[strum(serialize = "warn")]
    Warn,
    /// Findings are errors and suppress emission
    #[strum(serialize = "err")]
    Err,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CompilerConfig {
    /// Subnet relation inside a zone without `subnet_of` declaration
    #[serde(default)]
    pub check_subnets: CheckLevel,
    /// Rule whose path has no managed device
    #[serde(default)]
    pub check_unenforceable: CheckLevel,
    /// Same object listed twice in src or dst of a rule
    #[serde(default)]
    pub check_duplicate_elements: CheckLevel,
    /// Rule without owner
    #[serde(default = "default_owner_level")]
    pub check_service_owner: CheckLevel,
    /// Emit an info diagnostic for every removed redundant path rule
    #[serde(default)]
    pub report_redundant_rules: bool,
    /// Merge sibling subnets into their enclosing object
    #[serde(default = "default_true")]
    pub combine_subnets: bool,
    /// Worker threads for per zone / per device work (None = rayon default)
    #[serde(default)]
    pub threads: Option<usize>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            check_subnets: CheckLevel::Warn,
            check_unenforceable: CheckLevel::Warn,
            check_duplicate_elements: CheckLevel::Warn,
            check_service_owner: default_owner_level(),
            report_redundant_rules: false,
            combine_subnets: true,
            threads: None,
        }
    }
}

fn default_owner_level() -> CheckLevel {
    CheckLevel::No
}

fn default_true() -> bool {
    true
}

impl CompilerConfig {
    /// Rejects settings that cannot be honored.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `threads` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.threads == Some(0) {
            return Err(Error::Config("threads must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Parses configuration from JSON text.
///
/// # Errors
///
/// Returns `Err` if the text is not valid JSON or contains unknown fields.
pub fn parse_config(json: &str) -> Result<CompilerConfig> {
    let config: CompilerConfig = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
}

/// Candidate files in lookup order.
fn config_candidates(explicit: Option<&Path>, model_path: &Path) -> Vec<PathBuf> {
    if let Some(path) = explicit {
        return vec![path.to_path_buf()];
    }
    let mut candidates = Vec::new();
    if let Some(dir) = model_path.parent() {
        candidates.push(dir.join(CONFIG_FILE_NAME));
    }
    if let Some(dir) = get_config_dir() {
        candidates.push(dir.join(CONFIG_FILE_NAME));
    }
    candidates
}

/// Loads the compiler configuration.
///
/// An explicit path must exist; implicit locations are optional.
///
/// # Errors
///
/// Returns `Err` if the explicit file cannot be read, or any found file
/// cannot be parsed.
///
/// # Async
/// Uses `tokio::fs` for non-blocking I/O.
pub async fn load_config(explicit: Option<&Path>, model_path: &Path) -> Result<CompilerConfig> {
    for path in config_candidates(explicit, model_path) {
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => {
                info!("Using configuration {}", path.display());
                return parse_config(&json);
            }
            Err(e) if explicit.is_none() && e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No configuration at {}", path.display());
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(CompilerConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = parse_config(r#"{ "check_subnets": "err" }"#).unwrap();
        assert_eq!(config.check_subnets, CheckLevel::Err);
        assert_eq!(config.check_unenforceable, CheckLevel::Warn);
        assert_eq!(config.check_service_owner, CheckLevel::No);
        assert!(config.combine_subnets);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(parse_config(r#"{ "check_everything": "warn" }"#).is_err());
    }

    #[test]
    fn test_zero_threads_rejected() {
        let err = parse_config(r#"{ "threads": 0 }"#).unwrap_err();
        assert!(err.to_string().contains("threads"));
    }

    #[test]
    fn test_check_level_parse() {
        assert_eq!("err".parse::<CheckLevel>().unwrap(), CheckLevel::Err);
        assert_eq!(CheckLevel::No.to_string(), "no");
    }

    #[test]
    fn test_explicit_path_is_only_candidate() {
        let candidates = config_candidates(
            Some(Path::new("/etc/netpolc.json")),
            Path::new("/policy/model.json"),
        );
        assert_eq!(candidates, vec![PathBuf::from("/etc/netpolc.json")]);
    }

    #[test]
    fn test_model_dir_is_first_implicit_candidate() {
        let candidates = config_candidates(None, Path::new("/policy/model.json"));
        assert_eq!(candidates[0], PathBuf::from("/policy/netpolc.json"));
    }

    #[tokio::test]
    async fn test_missing_implicit_config_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.json");
        let config = load_config(None, &model).await;
        // The user config directory may hold a file on developer machines;
        // only assert that loading does not fail on a missing model dir file.
        assert!(config.is_ok());
    }

    #[tokio::test]
    async fn test_missing_explicit_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.json");
        let result = load_config(Some(&missing), &dir.path().join("model.json")).await;
        assert!(result.is_err());
    }
}
