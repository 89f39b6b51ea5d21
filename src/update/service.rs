use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::models::{
    DownloadProgress, RawReleaseNotes, ReleaseInfo, RemoteRelease, UpdateError, UpdateResult,
};
use super::transport::{ProgressFn, ReleaseSource, UpdateTransport};

#[cfg(target_os = "macos")]
pub const DEFAULT_ASSET_SUFFIXES: &[&str] = &[".dmg", ".zip"];
#[cfg(target_os = "windows")]
pub const DEFAULT_ASSET_SUFFIXES: &[&str] = &[".msi", ".exe"];
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub const DEFAULT_ASSET_SUFFIXES: &[&str] = &[".AppImage", ".deb", ".tar.gz"];

const USER_AGENT: &str = concat!("Traybar-Updater/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Longest gap between two body chunks before a download is abandoned.
const STALL_TIMEOUT: Duration = Duration::from_secs(30);

fn http_client() -> Client {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .unwrap_or_else(|e| {
            warn!("Failed to configure HTTP client, using defaults: {}", e);
            Client::new()
        })
}

/// Release feed backed by the GitHub "latest release" API.
pub struct GithubReleaseSource {
    client: Client,
    github_api_base: String,
    repo_owner: String,
    repo_name: String,
    asset_suffixes: Vec<String>,
}

impl GithubReleaseSource {
    pub fn new(repo_owner: String, repo_name: String) -> Self {
        Self {
            client: http_client(),
            github_api_base: "https://api.github.com".to_string(),
            repo_owner,
            repo_name,
            asset_suffixes: DEFAULT_ASSET_SUFFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Point at a different API host (GitHub Enterprise, test servers).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.github_api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    /// Asset name suffixes to look for, in order of preference.
    pub fn with_asset_suffixes(mut self, suffixes: &[&str]) -> Self {
        self.asset_suffixes = suffixes.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Parse GitHub release JSON into a RemoteRelease
    pub fn parse_github_release(&self, data: &Value) -> UpdateResult<RemoteRelease> {
        let tag_name = data["tag_name"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing tag_name in GitHub release"))?;

        // Remove 'v' prefix if present
        let version = tag_name.strip_prefix('v').unwrap_or(tag_name).to_string();

        let published_at = match data["published_at"].as_str() {
            Some(raw) => match chrono::DateTime::parse_from_rfc3339(raw) {
                Ok(date) => Some(date.with_timezone(&chrono::Utc)),
                Err(e) => {
                    warn!("Ignoring unparseable published_at '{}': {}", raw, e);
                    None
                }
            },
            None => None,
        };

        let notes = RawReleaseNotes::from(data["body"].as_str().map(str::to_string));

        let assets = data["assets"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Missing assets in GitHub release"))?;

        let asset = self
            .asset_suffixes
            .iter()
            .find_map(|suffix| {
                assets.iter().find(|asset| {
                    asset["name"].as_str().is_some_and(|name| name.ends_with(suffix.as_str()))
                })
            })
            .ok_or_else(|| {
                anyhow::anyhow!("No installable asset for this platform in release {}", tag_name)
            })?;

        let download_url = asset["browser_download_url"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing download URL in release asset"))?
            .to_string();

        let size_bytes = asset["size"].as_u64().unwrap_or(0);
        let sha256 = extract_sha256_from_body(data["body"].as_str().unwrap_or(""));

        Ok(RemoteRelease {
            version,
            published_at,
            notes,
            download_url,
            size_bytes,
            sha256,
        })
    }

    fn latest_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/releases/latest",
            self.github_api_base, self.repo_owner, self.repo_name
        )
    }
}

#[async_trait]
impl ReleaseSource for GithubReleaseSource {
    async fn probe(&self) -> UpdateResult<()> {
        // Any HTTP answer at all means the network is up
        match self
            .client
            .head(&self.github_api_base)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_connect() || e.is_timeout() || e.is_request() => {
                Err(UpdateError::NetworkUnavailable(e.to_string()))
            }
            Err(e) => Err(UpdateError::Network(e)),
        }
    }

    async fn latest_release(&self) -> UpdateResult<Option<RemoteRelease>> {
        let url = self.latest_url();
        debug!("Fetching latest release from: {}", url);

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            info!("No releases published for {}/{}", self.repo_owner, self.repo_name);
            return Ok(None);
        }

        if !response.status().is_success() {
            error!("GitHub API request failed with status: {}", response.status());
            return Err(UpdateError::Transport(format!(
                "GitHub API request failed with status {}",
                response.status()
            )));
        }

        let body = response.text().await?;
        let release_data: Value = serde_json::from_str(&body)?;
        let mut release = self.parse_github_release(&release_data)?;
        if release.sha256.is_none() {
            if let Some(url) = checksum_asset_url(&release_data, &release.download_url) {
                release.sha256 = self.fetch_checksum(&url).await;
            }
        }
        debug!("Latest release is {}", release.version);
        Ok(Some(release))
    }
}

impl GithubReleaseSource {
    /// Read a `<asset>.sha256` companion file. Failures only cost verification.
    async fn fetch_checksum(&self, url: &str) -> Option<String> {
        let request = self.client.get(url).header("User-Agent", USER_AGENT);
        let response = match request.send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!("Checksum asset request failed with status {}", response.status());
                return None;
            }
            Err(e) => {
                warn!("Failed to fetch checksum asset: {}", e);
                return None;
            }
        };
        let text = response.text().await.ok()?;
        let hash = text.split_whitespace().next()?.to_lowercase();
        if hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(hash)
        } else {
            warn!("Ignoring malformed checksum asset at {}", url);
            None
        }
    }
}

/// URL of the `<name>.sha256` asset published next to the chosen download.
fn checksum_asset_url(data: &Value, download_url: &str) -> Option<String> {
    let assets = data["assets"].as_array()?;
    let name = assets
        .iter()
        .find(|asset| asset["browser_download_url"].as_str() == Some(download_url))?["name"]
        .as_str()?;
    let companion = format!("{}.sha256", name);
    assets
        .iter()
        .find(|asset| asset["name"].as_str() == Some(companion.as_str()))?["browser_download_url"]
        .as_str()
        .map(str::to_string)
}

/// Extract a SHA256 hash from release notes (`sha256: <hex>` and similar).
pub fn extract_sha256_from_body(body: &str) -> Option<String> {
    let body_lower = body.to_lowercase();
    let keywords = ["sha256:", "sha256 ", "sha256="];

    for keyword in &keywords {
        if let Some(start) = body_lower.find(keyword) {
            let after_keyword = &body_lower[start + keyword.len()..];
            let hash: String = after_keyword
                .trim_start_matches(|c: char| c.is_whitespace() || c == '`')
                .chars()
                .take_while(|c| c.is_ascii_hexdigit())
                .collect();

            if hash.len() == 64 {
                debug!("Extracted SHA256 from release notes: {}", hash);
                return Some(hash);
            }
        }
    }

    None
}

/// Downloads release assets over HTTP and launches the platform installer.
pub struct HttpTransport {
    client: Client,
    download_dir: PathBuf,
    stall_timeout: Duration,
}

impl HttpTransport {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            client: http_client(),
            download_dir: download_dir.into(),
            stall_timeout: STALL_TIMEOUT,
        }
    }

    /// Give up when the server sends nothing for `stall_timeout`.
    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    /// Transport writing into `<cache dir>/<app_name>/updates`.
    pub fn in_cache_dir(app_name: &str) -> Self {
        let base = dirs::cache_dir().unwrap_or_else(std::env::temp_dir);
        Self::new(base.join(app_name).join("updates"))
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Verify file integrity when a hash is known
    pub async fn verify_download(
        &self,
        file_path: &Path,
        expected_hash: Option<&str>,
    ) -> UpdateResult<()> {
        let Some(expected) = expected_hash else {
            debug!("No hash provided, skipping verification");
            return Ok(());
        };

        let mut file = File::open(file_path).await?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 8192];

        loop {
            let bytes_read = file.read(&mut buffer).await?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        let computed_hash = format!("{:x}", hasher.finalize());
        let expected_lowercase = expected.to_lowercase();

        if computed_hash == expected_lowercase {
            info!("Update verification successful: {}", computed_hash);
            Ok(())
        } else {
            error!(
                "Update verification failed - expected: {}, computed: {}",
                expected_lowercase, computed_hash
            );
            Err(UpdateError::InvalidSignature)
        }
    }

    async fn fetch_to(
        &self,
        info: &ReleaseInfo,
        output_path: &Path,
        progress: &ProgressFn,
    ) -> UpdateResult<()> {
        let request = self
            .client
            .get(&info.download_url)
            .header("User-Agent", USER_AGENT)
            .send();
        let response = tokio::time::timeout(self.stall_timeout, request)
            .await
            .map_err(|_| self.stalled())??;

        if !response.status().is_success() {
            error!("Download request failed with status: {}", response.status());
            return Err(UpdateError::Transport(format!(
                "Download failed with status {}",
                response.status()
            )));
        }

        let total_bytes = response.content_length().unwrap_or(0);
        let mut file = File::create(output_path).await?;
        let mut downloaded = 0u64;
        let mut last_percent = 0u8;
        let mut stream = response.bytes_stream();
        let start_time = Instant::now();

        progress(0);
        loop {
            let next = futures_util::StreamExt::next(&mut stream);
            let chunk = match tokio::time::timeout(self.stall_timeout, next).await {
                Ok(Some(chunk)) => chunk?,
                Ok(None) => break,
                Err(_) => return Err(self.stalled()),
            };
            file.write_all(&chunk).await?;

            downloaded += chunk.len() as u64;
            let elapsed = start_time.elapsed().as_secs_f64();
            let snapshot = DownloadProgress {
                downloaded_bytes: downloaded,
                total_bytes,
                speed_bps: if elapsed > 0.0 {
                    (downloaded as f64 / elapsed) as u64
                } else {
                    0
                },
            };

            let percent = snapshot.percent();
            if percent != last_percent {
                last_percent = percent;
                debug!(
                    "Downloaded {} of {} bytes ({} B/s)",
                    downloaded, total_bytes, snapshot.speed_bps
                );
                progress(percent);
            }
        }

        file.flush().await?;
        info!("Update download completed: {} bytes", downloaded);
        Ok(())
    }

    fn stalled(&self) -> UpdateError {
        warn!("Download made no progress for {:?}", self.stall_timeout);
        UpdateError::Transport(format!("Download stalled after {:?}", self.stall_timeout))
    }
}

/// File name for a download URL, falling back to one built from the version.
pub fn file_name_for(info: &ReleaseInfo) -> String {
    let without_query = info.download_url.split(['?', '#']).next().unwrap_or("");
    match without_query.rsplit('/').next() {
        Some(name) if !name.is_empty() && name != "." && name != ".." => name.to_string(),
        _ => format!("update-{}", info.version),
    }
}

#[async_trait]
impl UpdateTransport for HttpTransport {
    async fn download(&self, info: &ReleaseInfo, progress: &ProgressFn) -> UpdateResult<PathBuf> {
        info!("Downloading update {} from: {}", info.version, info.download_url);
        tokio::fs::create_dir_all(&self.download_dir).await?;
        let output_path = self.download_dir.join(file_name_for(info));

        let result = match self.fetch_to(info, &output_path, progress).await {
            Ok(()) => self.verify_download(&output_path, info.sha256.as_deref()).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                progress(100);
                Ok(output_path)
            }
            Err(e) => {
                // Never leave a partial or unverified payload behind
                let _ = tokio::fs::remove_file(&output_path).await;
                Err(e)
            }
        }
    }

    fn quit_and_install(&self, info: &ReleaseInfo) -> UpdateResult<()> {
        let path = info
            .downloaded_file
            .as_ref()
            .ok_or_else(|| UpdateError::InvalidState("Update has not been downloaded".into()))?;
        if !path.exists() {
            return Err(UpdateError::Transport(format!(
                "Downloaded update is missing: {}",
                path.display()
            )));
        }

        info!("Launching installer for {}: {}", info.version, path.display());
        open_installer(path)
            .spawn()
            .map_err(|e| UpdateError::Transport(format!("Failed to launch installer: {}", e)))?;

        std::process::exit(0)
    }
}

fn open_installer(path: &Path) -> Command {
    #[cfg(target_os = "macos")]
    {
        let mut cmd = Command::new("open");
        cmd.arg(path);
        cmd
    }

    #[cfg(target_os = "windows")]
    {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", "start", ""]).arg(path);
        cmd
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        let mut cmd = Command::new("xdg-open");
        cmd.arg(path);
        cmd
    }
}
