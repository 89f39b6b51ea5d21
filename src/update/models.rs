use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::settings::SettingsError;

/// Longest error text handed to the UI.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 200;

/// A discovered release, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseInfo {
    pub version: String,
    pub release_date: String,
    pub release_notes: Vec<String>,
    pub download_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Set only once the payload has been fetched and verified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_file: Option<PathBuf>,
}

/// Release notes in whatever shape the feed delivered them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RawReleaseNotes {
    Markdown(String),
    Items(Vec<String>),
    #[default]
    Missing,
}

impl From<Option<String>> for RawReleaseNotes {
    fn from(body: Option<String>) -> Self {
        match body {
            Some(text) => RawReleaseNotes::Markdown(text),
            None => RawReleaseNotes::Missing,
        }
    }
}

/// Release as reported by the remote feed, before it is normalized for display.
#[derive(Debug, Clone)]
pub struct RemoteRelease {
    pub version: String,
    pub published_at: Option<DateTime<Utc>>,
    pub notes: RawReleaseNotes,
    pub download_url: String,
    pub size_bytes: u64,
    pub sha256: Option<String>,
}

/// Update lifecycle state. Exactly one variant holds at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "status", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum UpdateState {
    #[default]
    Idle,
    Checking,
    Available { info: ReleaseInfo },
    Downloading { info: ReleaseInfo, progress: u8 },
    Downloaded { info: ReleaseInfo },
    Error { message: String, retry_count: u32 },
}

impl UpdateState {
    pub fn name(&self) -> &'static str {
        match self {
            UpdateState::Idle => "idle",
            UpdateState::Checking => "checking",
            UpdateState::Available { .. } => "available",
            UpdateState::Downloading { .. } => "downloading",
            UpdateState::Downloaded { .. } => "downloaded",
            UpdateState::Error { .. } => "error",
        }
    }

    /// True while a remote operation is running.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, UpdateState::Checking | UpdateState::Downloading { .. })
    }

    pub fn info(&self) -> Option<&ReleaseInfo> {
        match self {
            UpdateState::Available { info }
            | UpdateState::Downloading { info, .. }
            | UpdateState::Downloaded { info } => Some(info),
            _ => None,
        }
    }

    pub fn retry_count(&self) -> u32 {
        match self {
            UpdateState::Error { retry_count, .. } => *retry_count,
            _ => 0,
        }
    }
}

/// What asked for an update check. Only affects messaging and rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CheckTrigger {
    Auto,
    #[default]
    Manual,
    ContextMenu,
}

impl CheckTrigger {
    pub fn is_user_initiated(self) -> bool {
        !matches!(self, CheckTrigger::Auto)
    }
}

/// Reply envelope for every UI command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResponse {
    pub fn ok() -> Self {
        Self { success: true, error: None }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { success: false, error: Some(message.into()) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub speed_bps: u64,
}

impl DownloadProgress {
    /// Whole percentage, clamped to 0..=100. Unknown totals report 0.
    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        ((self.downloaded_bytes.saturating_mul(100)) / self.total_bytes).min(100) as u8
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("No network connection: {0}")]
    NetworkUnavailable(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Malformed release data: {0}")]
    Malformed(#[from] anyhow::Error),

    #[error("Update check timed out")]
    Timeout,

    #[error("{0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid update signature")]
    InvalidSignature,

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("{0}")]
    InvalidState(String),
}

impl UpdateError {
    /// Short text suitable for a toast or status line.
    pub fn user_message(&self) -> String {
        match self {
            UpdateError::NetworkUnavailable(_) => "No network connection".to_string(),
            UpdateError::Network(e) if e.is_connect() => "No network connection".to_string(),
            UpdateError::Network(e) if e.is_timeout() => "Update check timed out".to_string(),
            UpdateError::Timeout => "Update check timed out".to_string(),
            UpdateError::Malformed(_) | UpdateError::Json(_) => {
                "Could not read update information".to_string()
            }
            other => sanitize_message(&other.to_string()),
        }
    }

    /// Whether the coordinator may retry the failed operation on its own.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, UpdateError::InvalidState(_) | UpdateError::Settings(_))
    }
}

pub type UpdateResult<T> = Result<T, UpdateError>;

/// First line of `message`, whitespace collapsed, cut to `MAX_ERROR_MESSAGE_CHARS`.
pub fn sanitize_message(message: &str) -> String {
    let first_line = message.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let collapsed = first_line.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return "Unknown error".to_string();
    }
    if collapsed.chars().count() <= MAX_ERROR_MESSAGE_CHARS {
        return collapsed;
    }
    let mut cut: String = collapsed.chars().take(MAX_ERROR_MESSAGE_CHARS - 3).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> ReleaseInfo {
        ReleaseInfo {
            version: "2.0.0".into(),
            release_date: "Jan 5, 2025".into(),
            release_notes: vec!["Faster startup".into()],
            download_url: "https://example.invalid/app.dmg".into(),
            sha256: None,
            downloaded_file: None,
        }
    }

    #[test]
    fn state_serializes_as_tagged_object() {
        let state = UpdateState::Downloading { info: sample_info(), progress: 42 };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["status"], "downloading");
        assert_eq!(json["progress"], 42);
        assert_eq!(json["info"]["version"], "2.0.0");
        assert_eq!(json["info"]["releaseDate"], "Jan 5, 2025");

        let error = UpdateState::Error { message: "boom".into(), retry_count: 2 };
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["retryCount"], 2);
    }

    #[test]
    fn trigger_uses_kebab_case() {
        let trigger: CheckTrigger = serde_json::from_str("\"context-menu\"").unwrap();
        assert_eq!(trigger, CheckTrigger::ContextMenu);
        assert!(!CheckTrigger::Auto.is_user_initiated());
    }

    #[test]
    fn sanitize_keeps_first_line_and_truncates() {
        assert_eq!(sanitize_message("disk   full\nstack trace..."), "disk full");
        let long = "x".repeat(500);
        let cut = sanitize_message(&long);
        assert_eq!(cut.chars().count(), MAX_ERROR_MESSAGE_CHARS);
        assert!(cut.ends_with("..."));
        assert_eq!(sanitize_message("  \n "), "Unknown error");
    }

    #[test]
    fn progress_percent_is_clamped() {
        let p = DownloadProgress { downloaded_bytes: 150, total_bytes: 100, speed_bps: 0 };
        assert_eq!(p.percent(), 100);
        let unknown = DownloadProgress { downloaded_bytes: 10, total_bytes: 0, speed_bps: 0 };
        assert_eq!(unknown.percent(), 0);
    }

    #[test]
    fn user_messages_classify_errors() {
        assert_eq!(
            UpdateError::NetworkUnavailable("dns".into()).user_message(),
            "No network connection"
        );
        assert_eq!(UpdateError::Timeout.user_message(), "Update check timed out");
        assert_eq!(
            UpdateError::Malformed(anyhow::anyhow!("missing tag_name")).user_message(),
            "Could not read update information"
        );
        assert!(!UpdateError::InvalidState("nope".into()).is_retryable());
        assert!(UpdateError::Transport("503".into()).is_retryable());
    }
}
