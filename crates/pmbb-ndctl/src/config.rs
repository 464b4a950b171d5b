//! Where the platform's sysfs and device nodes live.

use std::env::VarError;
use std::path::PathBuf;

use pmbb_error::{PmbbError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysfsConfig {
    pub sysfs_root: PathBuf,
    pub dev_root: PathBuf,
}

impl Default for SysfsConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
        }
    }
}

impl SysfsConfig {
    pub const SYSFS_ENV_KEY: &'static str = "PMBB_SYSFS_ROOT";
    pub const DEV_ENV_KEY: &'static str = "PMBB_DEV_ROOT";

    #[must_use]
    pub fn new(sysfs_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            dev_root: dev_root.into(),
        }
    }

    /// Defaults overridden by `PMBB_SYSFS_ROOT` / `PMBB_DEV_ROOT`.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            sysfs_root: env_path(Self::SYSFS_ENV_KEY)?.unwrap_or(defaults.sysfs_root),
            dev_root: env_path(Self::DEV_ENV_KEY)?.unwrap_or(defaults.dev_root),
        })
    }

    /// `<sysfs>/dev/<class>/<major>:<minor>`.
    #[must_use]
    pub fn dev_link(&self, class: &str, major: u64, minor: u64) -> PathBuf {
        self.sysfs_root
            .join("dev")
            .join(class)
            .join(format!("{major}:{minor}"))
    }

    /// `<dev>/<name>`.
    #[must_use]
    pub fn dev_node(&self, name: &str) -> PathBuf {
        self.dev_root.join(name)
    }
}

fn env_path(key: &str) -> Result<Option<PathBuf>> {
    match std::env::var(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(PathBuf::from(value.trim()))),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(PmbbError::lookup(
            key,
            "environment value contains non-UTF-8 bytes",
        )),
    }
}
