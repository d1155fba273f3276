//! Deployment configuration.
//!
//! Everything here is fixed at deployment time; nothing is mutable once a
//! storage instance has been built from it.

use nvs_error::{NvsError, Result};
use nvs_types::{
    DEFAULT_LINE_SIZE, DEFAULT_MAX_WRITE_LINES, DEFAULT_SIGNATURE, DEFAULT_SIGNATURE_OFFSET,
    DEFAULT_STORAGE_SIZE, LineSize, SIGNATURE_LEN, Signature, StorageGeometry,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_DEVICE_PATH: &str = "/fs/mtd";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Size of the logical image in bytes.
    pub storage_size: usize,
    /// Dirty-tracking granularity in bytes (power of two).
    pub line_size: u32,
    /// Upper bound on lines written by a single flush tick.
    pub max_write_lines: usize,
    pub device_path: PathBuf,
    /// Prior-format image to migrate from, if any.
    pub legacy_path: Option<PathBuf>,
    /// Where the legacy image is moved when archived. Defaults to the legacy
    /// path with a `.bak` extension.
    pub legacy_archive_path: Option<PathBuf>,
    pub signature: Signature,
    pub signature_offset: u64,
    /// Rename the legacy image after migration. Off by default so a
    /// recovery copy survives.
    pub archive_legacy_on_migrate: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_size: DEFAULT_STORAGE_SIZE,
            line_size: DEFAULT_LINE_SIZE,
            max_write_lines: DEFAULT_MAX_WRITE_LINES,
            device_path: PathBuf::from(DEFAULT_DEVICE_PATH),
            legacy_path: None,
            legacy_archive_path: None,
            signature: DEFAULT_SIGNATURE,
            signature_offset: DEFAULT_SIGNATURE_OFFSET,
            archive_legacy_on_migrate: false,
        }
    }
}

impl StorageConfig {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|err| {
            NvsError::InvalidConfig(format!("{}: {err}", path.display()))
        })
    }

    /// Validate sizes and signature placement.
    pub fn geometry(&self) -> Result<StorageGeometry> {
        let invalid = |err: nvs_types::GeometryError| NvsError::InvalidConfig(err.to_string());
        let line_size = LineSize::new(self.line_size).map_err(invalid)?;
        let geometry = StorageGeometry::new(self.storage_size, line_size, self.max_write_lines)
            .map_err(invalid)?;
        geometry
            .check_signature_offset(self.signature_offset)
            .map_err(invalid)?;
        Ok(geometry)
    }

    /// Minimum device length holding both the image and the signature.
    #[must_use]
    pub fn required_device_len(&self) -> u64 {
        let signature_end = self.signature_offset.saturating_add(SIGNATURE_LEN as u64);
        (self.storage_size as u64).max(signature_end)
    }

    #[must_use]
    pub fn legacy_archive_path(&self) -> Option<PathBuf> {
        self.legacy_archive_path.clone().or_else(|| {
            self.legacy_path
                .as_ref()
                .map(|legacy| legacy.with_extension("bak"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = StorageConfig::default();
        let geo = config.geometry().unwrap();
        assert_eq!(geo.storage_size(), 4096);
        assert_eq!(geo.line_count(), 32);
        assert_eq!(config.required_device_len(), 8192);
        assert!(!config.archive_legacy_on_migrate);
    }

    #[test]
    fn rejects_bad_line_size_and_overlapping_signature() {
        let config = StorageConfig {
            line_size: 100,
            ..StorageConfig::default()
        };
        assert!(matches!(config.geometry(), Err(NvsError::InvalidConfig(_))));

        let config = StorageConfig {
            signature_offset: 4000,
            ..StorageConfig::default()
        };
        let err = config.geometry().unwrap_err();
        assert!(err.to_string().contains("overlaps"));
    }

    #[test]
    fn rejects_oversized_run_and_signature_past_address_space() {
        let config = StorageConfig {
            max_write_lines: usize::MAX,
            ..StorageConfig::default()
        };
        assert!(matches!(config.geometry(), Err(NvsError::InvalidConfig(_))));

        let config = StorageConfig {
            signature_offset: u64::MAX,
            ..StorageConfig::default()
        };
        assert!(matches!(config.geometry(), Err(NvsError::InvalidConfig(_))));
        assert_eq!(config.required_device_len(), u64::MAX);
    }

    #[test]
    fn partial_json_takes_defaults() {
        let config: StorageConfig = serde_json::from_str(
            r#"{ "device_path": "/dev/mtd0", "legacy_path": "/fs/microsd/APM/ArduPlane.stg" }"#,
        )
        .unwrap();
        assert_eq!(config.device_path, PathBuf::from("/dev/mtd0"));
        assert_eq!(config.storage_size, 4096);
        assert_eq!(
            config.legacy_archive_path(),
            Some(PathBuf::from("/fs/microsd/APM/ArduPlane.bak"))
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let parsed: std::result::Result<StorageConfig, _> =
            serde_json::from_str(r#"{ "wear_leveling": true }"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        std::fs::write(&path, r#"{ "line_size": 64, "max_write_lines": 8 }"#).unwrap();
        let config = StorageConfig::from_json_file(&path).unwrap();
        assert_eq!(config.line_size, 64);
        assert_eq!(config.geometry().unwrap().line_count(), 64);

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            StorageConfig::from_json_file(&path),
            Err(NvsError::InvalidConfig(_))
        ));
    }
}
