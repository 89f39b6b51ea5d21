pub mod store;

pub use store::{JsonSettingsStore, MemorySettingsStore};

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The part of the app settings the updater reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdatePolicy {
    pub auto_check_and_install: bool,
    pub update_deferred: bool,
    /// Epoch milliseconds of the last successful check or download.
    pub last_check_timestamp: i64,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            auto_check_and_install: true,
            update_deferred: false,
            last_check_timestamp: 0,
        }
    }
}

impl UpdatePolicy {
    pub const AUTO_CHECK_KEY: &'static str = "autoCheckAndInstall";
    pub const DEFERRED_KEY: &'static str = "updateDeferred";
    pub const LAST_CHECK_KEY: &'static str = "lastCheckTimestamp";

    /// Whether at least `interval` has passed since the last check.
    /// A timestamp in the future (clock moved backwards) counts as due.
    pub fn is_check_due(&self, now_ms: i64, interval: Duration) -> bool {
        let elapsed = now_ms.saturating_sub(self.last_check_timestamp);
        elapsed < 0 || elapsed as u128 >= interval.as_millis()
    }
}

/// Settings persistence, owned by the host application.
///
/// Implementations must treat `update_policy` as an atomic read-modify-write
/// that leaves settings the updater does not know about untouched.
pub trait SettingsStore: Send + Sync {
    fn policy(&self) -> Result<UpdatePolicy>;

    fn update_policy(&self, update: &mut dyn FnMut(&mut UpdatePolicy)) -> Result<UpdatePolicy>;

    /// Overwrite all three policy fields at once.
    fn save_policy(&self, policy: &UpdatePolicy) -> Result<()> {
        self.update_policy(&mut |current| *current = policy.clone())?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Settings file is not a JSON object: {0}")]
    NotAnObject(PathBuf),

    #[error("No configuration directory available on this platform")]
    NoConfigDir,
}

pub type Result<T> = std::result::Result<T, SettingsError>;
