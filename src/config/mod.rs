use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable holding `owner/name` of the release repository.
pub const REPO_ENV: &str = "TRAYBAR_UPDATER_REPO";
/// Overrides the running version (useful to force an update in development).
pub const VERSION_ENV: &str = "TRAYBAR_UPDATER_VERSION";

/// Updater tuning. Durations are in seconds so the struct can live in a settings file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdaterConfig {
    pub app_name: String,
    pub current_version: String,
    pub repo_owner: String,
    pub repo_name: String,
    /// Minimum time between automatic checks.
    pub check_interval_secs: u64,
    /// How often a long-running app re-evaluates whether a check is due.
    pub recheck_interval_secs: u64,
    pub retry_delay_secs: u64,
    pub max_retries: u32,
    /// A check with no answer after this long is failed.
    pub check_timeout_secs: u64,
    /// Delay before the first automatic check after launch.
    pub startup_delay_secs: u64,
    pub preflight_enabled: bool,
    pub preflight_timeout_secs: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            app_name: "Traybar".to_string(),
            current_version: env!("CARGO_PKG_VERSION").to_string(),
            repo_owner: String::new(),
            repo_name: String::new(),
            check_interval_secs: 24 * 60 * 60,
            recheck_interval_secs: 60 * 60,
            retry_delay_secs: 5,
            max_retries: 3,
            check_timeout_secs: 30,
            startup_delay_secs: 10,
            preflight_enabled: true,
            preflight_timeout_secs: 5,
        }
    }
}

impl UpdaterConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn recheck_interval(&self) -> Duration {
        // A zero interval would spin the auto-check loop
        Duration::from_secs(self.recheck_interval_secs.max(1))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn preflight_timeout(&self) -> Duration {
        Duration::from_secs(self.preflight_timeout_secs)
    }

    /// Defaults overridden by `TRAYBAR_UPDATER_REPO` and `TRAYBAR_UPDATER_VERSION`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let repo = std::env::var(REPO_ENV).map_err(|_| ConfigError::MissingRepo)?;
        let (owner, name) = parse_repo(&repo)?;
        config.repo_owner = owner;
        config.repo_name = name;
        if let Ok(version) = std::env::var(VERSION_ENV) {
            if !version.trim().is_empty() {
                config.current_version = version.trim().to_string();
            }
        }
        Ok(config)
    }
}

/// Split `owner/name` into its parts.
pub fn parse_repo(repo: &str) -> Result<(String, String), ConfigError> {
    match repo.trim().split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((owner.to_string(), name.to_string()))
        }
        _ => Err(ConfigError::InvalidRepo(repo.to_string())),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{} is not set (expected owner/name)", REPO_ENV)]
    MissingRepo,

    #[error("Invalid repository '{0}', expected owner/name")]
    InvalidRepo(String),
}
