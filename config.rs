//! Configuration management with environment variable support.
//!
//! This module provides [`Config`] for loading and validating SecureFS settings
//! from JSON files and environment variables, plus the [`MountFlags`] word.
//!
//! ## Environment Variables
//!
//! - `SECUREFS_STORAGE_DIR`: Override storage directory path
//! - `SECUREFS_KEY_FILE`: Override key file path
//! - `SECUREFS_CONFIG`: Override config file path

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable names for configuration overrides
pub const ENV_STORAGE_DIR: &str = "SECUREFS_STORAGE_DIR";
pub const ENV_KEY_FILE: &str = "SECUREFS_KEY_FILE";
pub const ENV_CONFIG_PATH: &str = "SECUREFS_CONFIG";

/// Key file name used when none is configured
pub const DEFAULT_KEY_FILE_NAME: &str = ".securefs.json";

pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Config file path: explicit argument, then `SECUREFS_CONFIG`, then `config.json`
pub fn resolve_config_path(path: Option<&str>) -> String {
    path.map(String::from)
        .or_else(|| env::var(ENV_CONFIG_PATH).ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string())
}

/// Mount option bits. Only `NO_AUTHENTICATION` and `READ_ONLY` affect the
/// block engine; the others belong to the directory layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MountFlags(u32);

impl MountFlags {
    pub const NO_AUTHENTICATION: Self = Self(0x1);
    pub const READ_ONLY: Self = Self(0x2);
    pub const STORE_TIME: Self = Self(0x4);
    pub const CASE_FOLD_FILENAME: Self = Self(0x8);
    pub const NFC_FILENAME: Self = Self(0x10);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Unknown bits are kept so a newer config survives a round trip
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn no_authentication(self) -> bool {
        self.contains(Self::NO_AUTHENTICATION)
    }

    pub fn read_only(self) -> bool {
        self.contains(Self::READ_ONLY)
    }
}

impl std::ops::BitOr for MountFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Password-based key derivation settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KdfConfig {
    pub min_iterations: u32,
    pub min_seconds: f64,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            min_iterations: 160_000,
            min_seconds: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage_dir: String,
    /// Defaults to `<storage_dir>/.securefs.json`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    #[serde(default)]
    pub kdf: KdfConfig,
    #[serde(default)]
    pub flags: MountFlags,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: "./storage".to_string(),
            key_file: None,
            kdf: KdfConfig::default(),
            flags: MountFlags::empty(),
        }
    }
}

impl Config {
    /// Load config from file path
    pub fn load(path: &str) -> Result<Self> {
        let s =
            fs::read_to_string(path).with_context(|| format!("reading config file {}", path))?;
        let mut config: Config =
            serde_json::from_str(&s).with_context(|| format!("parsing config file {}", path))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config with environment variable overrides. A missing file
    /// falls back to defaults.
    /// Priority: ENV vars > config file > defaults
    pub fn load_with_env(path: Option<&str>) -> Result<Self> {
        let config_path = resolve_config_path(path);

        let mut config = if Path::new(&config_path).exists() {
            info!(path = %config_path, "loading config from file");
            let s = fs::read_to_string(&config_path)
                .with_context(|| format!("reading config file {}", config_path))?;
            serde_json::from_str(&s)
                .with_context(|| format!("parsing config file {}", config_path))?
        } else {
            debug!(path = %config_path, "config file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(storage_dir) = env::var(ENV_STORAGE_DIR) {
            debug!(storage_dir = %storage_dir, "overriding storage_dir from environment");
            self.storage_dir = storage_dir;
        }

        if let Ok(key_file) = env::var(ENV_KEY_FILE) {
            debug!(key_file = %key_file, "overriding key_file from environment");
            self.key_file = Some(key_file);
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.storage_dir.trim().is_empty() {
            anyhow::bail!("storage_dir cannot be empty");
        }

        if let Some(key_file) = &self.key_file {
            if key_file.trim().is_empty() {
                anyhow::bail!("key_file cannot be empty when set");
            }
        }

        if !self.kdf.min_seconds.is_finite() || self.kdf.min_seconds < 0.0 {
            anyhow::bail!(
                "kdf.min_seconds must be a finite non-negative number, got {}",
                self.kdf.min_seconds
            );
        }

        if self.flags.no_authentication() {
            warn!("no-authentication mode: block tags will not be verified on read");
        }

        Ok(())
    }

    /// Create a new config with explicit storage directory and default settings
    pub fn new(storage_dir: impl Into<String>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_key_file(mut self, key_file: impl Into<String>) -> Self {
        self.key_file = Some(key_file.into());
        self
    }

    pub fn with_kdf(mut self, min_iterations: u32, min_seconds: f64) -> Self {
        self.kdf = KdfConfig {
            min_iterations,
            min_seconds,
        };
        self
    }

    pub fn with_flags(mut self, flags: MountFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn key_file_path(&self) -> PathBuf {
        match &self.key_file {
            Some(p) => PathBuf::from(p),
            None => Path::new(&self.storage_dir).join(DEFAULT_KEY_FILE_NAME),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_bits_match_on_disk_values() {
        assert_eq!(MountFlags::NO_AUTHENTICATION.bits(), 0x1);
        assert_eq!(MountFlags::READ_ONLY.bits(), 0x2);
        assert_eq!(MountFlags::STORE_TIME.bits(), 0x4);
        assert_eq!(MountFlags::CASE_FOLD_FILENAME.bits(), 0x8);
        assert_eq!(MountFlags::NFC_FILENAME.bits(), 0x10);
    }

    #[test]
    fn test_flag_queries() {
        let flags = MountFlags::NO_AUTHENTICATION | MountFlags::STORE_TIME;
        assert!(flags.no_authentication());
        assert!(!flags.read_only());
        assert_eq!(MountFlags::from_bits(flags.bits()), flags);
        assert!(!MountFlags::empty().no_authentication());
    }

    #[test]
    fn test_default_key_file_path() {
        let cfg = Config::new("/data/vault");
        assert_eq!(
            cfg.key_file_path(),
            Path::new("/data/vault").join(DEFAULT_KEY_FILE_NAME)
        );
        let cfg = cfg.with_key_file("/etc/securefs.json");
        assert_eq!(cfg.key_file_path(), PathBuf::from("/etc/securefs.json"));
    }

    #[test]
    fn test_config_json_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"storage_dir": "./s"}"#).unwrap();
        assert_eq!(cfg.kdf, KdfConfig::default());
        assert_eq!(cfg.flags, MountFlags::empty());

        let cfg: Config = serde_json::from_str(r#"{"storage_dir": "./s", "flags": 3}"#).unwrap();
        assert!(cfg.flags.no_authentication());
        assert!(cfg.flags.read_only());
    }

    #[test]
    fn test_load_with_env_missing_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("absent.json");
        let cfg = Config::load_with_env(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(cfg.kdf, KdfConfig::default());
        assert_eq!(resolve_config_path(Some("explicit.json")), "explicit.json");
    }

    #[test]
    fn test_load_reads_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(
            &path,
            r#"{"storage_dir": "/srv/vault", "kdf": {"min_iterations": 5, "min_seconds": 0.0}}"#,
        )
        .unwrap();
        let cfg = Config::load_with_env(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(cfg.kdf.min_iterations, 5);
        assert!(Config::load(tmp.path().join("nope.json").to_str().unwrap()).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(Config::new("").validate().is_err());
        assert!(Config::new("./s").with_kdf(1, -0.5).validate().is_err());
        assert!(Config::new("./s").with_kdf(1, 0.0).validate().is_ok());
    }
}
