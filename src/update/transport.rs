//! Seams between the coordinator and the outside world.

use std::path::PathBuf;

use super::models::{ReleaseInfo, RemoteRelease, UpdateResult};

/// Progress callback, whole percent.
pub type ProgressFn = dyn Fn(u8) + Send + Sync;

/// Where releases are discovered (a GitHub repository, a static feed).
#[async_trait::async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Cheap reachability check run before the real request.
    async fn probe(&self) -> UpdateResult<()> {
        Ok(())
    }

    /// Latest published release, or `None` when nothing has been published yet.
    async fn latest_release(&self) -> UpdateResult<Option<RemoteRelease>>;
}

/// Fetches and installs a release payload.
#[async_trait::async_trait]
pub trait UpdateTransport: Send + Sync {
    /// Download and verify the payload for `info`, reporting progress as it goes.
    async fn download(&self, info: &ReleaseInfo, progress: &ProgressFn) -> UpdateResult<PathBuf>;

    /// Hand the downloaded payload to the platform installer and quit.
    /// Only returns on failure in real implementations.
    fn quit_and_install(&self, info: &ReleaseInfo) -> UpdateResult<()>;
}
