//! Writing compiled device configs
//!
//! Each device config is written as `<device>.json` using a temporary file
//! in the output directory, synced and then renamed over the target, so an
//! interrupted run never leaves a half written config behind. `index.json`
//! lists every written file with the SHA-256 checksum of its contents.

use crate::audit::log_removals;
use crate::core::distribute::DeviceConfig;
use crate::core::error::{Error, Result};
use crate::core::pipeline::Compiled;
use crate::validators::validate_device_name;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

pub const INDEX_FILE_NAME: &str = "index.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub device: String,
    pub file: String,
    pub sha256: String,
    /// Number of ACL lines over all interfaces
    pub lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Index {
    pub run_id: Uuid,
    pub generated: chrono::DateTime<chrono::Utc>,
    pub version: String,
    pub devices: Vec<IndexEntry>,
    #[serde(default)]
    pub removed_rules: usize,
}

fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Writes `bytes` to `path` via a synced temporary file in the same directory.
async fn write_atomic(path: PathBuf, bytes: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(&bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| Error::Emit {
            device: path.display().to_string(),
            message: e.error.to_string(),
        })?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Internal(format!("write task failed: {e}")))?
}

fn file_name(device: &DeviceConfig) -> Result<String> {
    validate_device_name(&device.name).map_err(|message| Error::Emit {
        device: device.name.clone(),
        message,
    })?;
    Ok(format!("{}.json", device.name))
}

/// Writes every device config of `compiled`, the index and the audit log
/// into `out_dir`, creating it if needed.
///
/// # Errors
///
/// Returns `Err` if a device name can't be used as file name or a file
/// can't be written. Files written before the failure are left in place,
/// the index is only written after all devices.
pub async fn emit(out_dir: &Path, compiled: &Compiled) -> Result<Index> {
    tokio::fs::create_dir_all(out_dir).await?;
    let run_id = Uuid::new_v4();

    let mut entries = Vec::with_capacity(compiled.devices.len());
    for device in &compiled.devices {
        let file = file_name(device)?;
        let json = serde_json::to_vec_pretty(device)?;
        let sha256 = checksum(&json);
        write_atomic(out_dir.join(&file), json).await?;
        entries.push(IndexEntry {
            device: device.name.clone(),
            file,
            sha256,
            lines: device.line_count(),
        });
    }

    let index = Index {
        run_id,
        generated: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        devices: entries,
        removed_rules: compiled.audit.len(),
    };
    write_atomic(out_dir.join(INDEX_FILE_NAME), serde_json::to_vec_pretty(&index)?).await?;
    log_removals(out_dir, run_id, &compiled.audit).await;

    info!(
        "Wrote {} device configs to {}",
        index.devices.len(),
        out_dir.display()
    );
    Ok(index)
}

/// Loads the index of `out_dir` and returns the devices whose file is
/// missing or doesn't match its checksum.
///
/// # Errors
///
/// Returns `Err` if the index can't be read or parsed.
pub async fn verify_output(out_dir: &Path) -> Result<Vec<String>> {
    let index: Index =
        serde_json::from_str(&tokio::fs::read_to_string(out_dir.join(INDEX_FILE_NAME)).await?)?;
    let mut mismatched = Vec::new();
    for entry in &index.devices {
        match tokio::fs::read(out_dir.join(&entry.file)).await {
            Ok(bytes) if checksum(&bytes) == entry.sha256 => {}
            Ok(_) => {
                warn!("Device config '{}' checksum mismatch", entry.file);
                mismatched.push(entry.device.clone());
            }
            Err(e) => {
                warn!("Device config '{}' unreadable: {}", entry.file, e);
                mismatched.push(entry.device.clone());
            }
        }
    }
    Ok(mismatched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use crate::core::pipeline::compile;
    use crate::core::test_helpers::two_zones;

    fn compiled() -> Compiled {
        let model = two_zones()
            .service("web", &["tcp 80"])
            .rule("r", &["network:n1"], &["network:n2"], "web")
            .build();
        compile(&model, &CompilerConfig::default()).unwrap()
    }

    #[test]
    fn test_checksum_is_hex_sha256() {
        assert_eq!(
            checksum(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_emit_writes_devices_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let index = emit(&out, &compiled()).await.unwrap();

        assert_eq!(index.devices.len(), 1);
        assert_eq!(index.devices[0].file, "r1.json");
        let text = tokio::fs::read_to_string(out.join("r1.json")).await.unwrap();
        let device: DeviceConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(device.name, "r1");
        assert_eq!(index.devices[0].lines, device.line_count());
        assert!(verify_output(&out).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_verify_detects_modified_file() {
        let dir = tempfile::tempdir().unwrap();
        emit(dir.path(), &compiled()).await.unwrap();
        tokio::fs::write(dir.path().join("r1.json"), "{}").await.unwrap();
        assert_eq!(verify_output(dir.path()).await.unwrap(), vec!["r1".to_string()]);
    }

    #[tokio::test]
    async fn test_unusable_device_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut compiled = compiled();
        compiled.devices[0].name = ".hidden".to_string();
        let err = emit(dir.path(), &compiled).await.unwrap_err();
        assert!(matches!(err, Error::Emit { .. }));
        assert!(!dir.path().join(INDEX_FILE_NAME).exists());
    }
}
