//! The update state machine.
//!
//! One `UpdateCoordinator` is built at startup and cloned into whatever needs
//! it (UI command handlers, the settings listener). All state transitions
//! happen here; observers only ever receive snapshots.

use std::sync::{Arc, Weak};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::config::UpdaterConfig;
use crate::settings::{SettingsStore, UpdatePolicy};

use super::broadcaster::{ObserverHandle, StatusBroadcaster, StatusObserver};
use super::models::{
    CheckTrigger, CommandResponse, ReleaseInfo, RemoteRelease, UpdateError, UpdateResult,
    UpdateState,
};
use super::notes::format_release_notes;
use super::transport::{ReleaseSource, UpdateTransport};
use super::version::is_newer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Check,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Trigger(CheckTrigger),
    Retry,
}

#[derive(Default)]
struct Machine {
    state: UpdateState,
    /// Release behind the current, or most recently failed, download.
    release: Option<ReleaseInfo>,
    retry_count: u32,
    retry_timer: Option<JoinHandle<()>>,
    auto_check_task: Option<JoinHandle<()>>,
}

struct Inner {
    config: UpdaterConfig,
    settings: Arc<dyn SettingsStore>,
    source: Arc<dyn ReleaseSource>,
    transport: Arc<dyn UpdateTransport>,
    broadcaster: StatusBroadcaster,
    machine: Mutex<Machine>,
}

/// Cheap-to-clone handle to the update state machine.
#[derive(Clone)]
pub struct UpdateCoordinator {
    inner: Arc<Inner>,
}

impl UpdateCoordinator {
    pub fn new(
        config: UpdaterConfig,
        settings: Arc<dyn SettingsStore>,
        source: Arc<dyn ReleaseSource>,
        transport: Arc<dyn UpdateTransport>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                settings,
                source,
                transport,
                broadcaster: StatusBroadcaster::new(),
                machine: Mutex::new(Machine::default()),
            }),
        }
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.inner.config
    }

    /// Schedule automatic checks according to the stored policy.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let policy = self.inner.load_policy();
        self.apply_policy_change(&policy);
    }

    /// React to the user toggling automatic updates in the settings panel.
    pub fn apply_policy_change(&self, policy: &UpdatePolicy) {
        if policy.auto_check_and_install {
            self.inner.schedule_auto_checks(policy);
        } else {
            let task = self.inner.machine.lock().auto_check_task.take();
            if let Some(task) = task {
                task.abort();
                info!("Automatic update checks disabled, cancelled scheduled check");
            } else {
                info!("Automatic update checks disabled");
            }
        }
    }

    /// Persist the automatic-update toggle and apply it.
    pub fn set_auto_check_and_install(&self, enabled: bool) -> UpdateResult<UpdatePolicy> {
        let policy = self
            .inner
            .settings
            .update_policy(&mut |p| p.auto_check_and_install = enabled)?;
        self.apply_policy_change(&policy);
        Ok(policy)
    }

    /// Cancel every pending timer. In-flight operations run to completion.
    pub fn shutdown(&self) {
        let mut machine = self.inner.machine.lock();
        if let Some(task) = machine.auto_check_task.take() {
            task.abort();
        }
        if let Some(timer) = machine.retry_timer.take() {
            timer.abort();
        }
    }

    pub fn attach(&self, observer: Arc<dyn StatusObserver>) -> ObserverHandle {
        self.inner.broadcaster.attach(observer)
    }

    pub fn broadcaster(&self) -> &StatusBroadcaster {
        &self.inner.broadcaster
    }

    /// Snapshot for observers that attach late.
    pub fn current_state(&self) -> UpdateState {
        self.inner.machine.lock().state.clone()
    }

    pub fn policy(&self) -> UpdateResult<UpdatePolicy> {
        Ok(self.inner.settings.policy()?)
    }

    /// Whether an automatic retry is waiting to fire.
    pub fn has_pending_retry(&self) -> bool {
        self.inner
            .machine
            .lock()
            .retry_timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    pub async fn check_for_updates(&self, trigger: CheckTrigger) -> CommandResponse {
        match self.inner.run_check(Origin::Trigger(trigger)).await {
            Ok(()) => CommandResponse::ok(),
            Err(e) => CommandResponse::failed(e.user_message()),
        }
    }

    pub async fn download_update(&self) -> CommandResponse {
        let info = match self.inner.begin_download(Origin::Trigger(CheckTrigger::Manual)) {
            Ok(Some(info)) => info,
            Ok(None) => return CommandResponse::ok(),
            Err(e) => return CommandResponse::failed(e.user_message()),
        };
        match self.inner.run_download(info).await {
            Ok(()) => CommandResponse::ok(),
            Err(e) => CommandResponse::failed(e.user_message()),
        }
    }

    /// Clear the deferral flag and hand over to the platform installer.
    /// On success the process exits; failures leave state and retry count untouched.
    pub fn install_update(&self) -> CommandResponse {
        let info = match &self.inner.machine.lock().state {
            UpdateState::Downloaded { info } => info.clone(),
            _ => return CommandResponse::failed("No downloaded update to install"),
        };

        if let Err(e) = self.inner.settings.update_policy(&mut |p| p.update_deferred = false) {
            error!("Failed to clear update deferral before install: {}", e);
        }

        info!("Installing update {}", info.version);
        match self.inner.transport.quit_and_install(&info) {
            Ok(()) => CommandResponse::ok(),
            Err(e) => {
                error!("Update install failed: {}", e);
                CommandResponse::failed(e.user_message())
            }
        }
    }

    /// Install a downloaded update while the app quits, unless the user deferred
    /// it or turned automatic updates off. Returns whether the installer was started.
    pub fn install_on_quit(&self) -> bool {
        if !matches!(self.current_state(), UpdateState::Downloaded { .. }) {
            return false;
        }
        let policy = self.inner.load_policy();
        if !policy.auto_check_and_install {
            debug!("Automatic install disabled, leaving downloaded update in place");
            return false;
        }
        if policy.update_deferred {
            info!("Downloaded update was deferred, not installing on quit");
            return false;
        }
        self.install_update().success
    }

    /// Remember that the user postponed installing. The state itself is kept.
    pub fn defer_update(&self) -> CommandResponse {
        let version = match &self.inner.machine.lock().state {
            UpdateState::Available { info } | UpdateState::Downloaded { info } => {
                info.version.clone()
            }
            _ => return CommandResponse::failed("No update to defer"),
        };

        match self.inner.settings.update_policy(&mut |p| p.update_deferred = true) {
            Ok(_) => {
                info!("Update {} deferred by user", version);
                CommandResponse::ok()
            }
            Err(e) => {
                error!("Failed to persist update deferral: {}", e);
                CommandResponse::failed(format!("Could not save settings: {}", e))
            }
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn release_info(remote: RemoteRelease) -> ReleaseInfo {
    let release_notes = format_release_notes(&remote.notes, &remote.version);
    ReleaseInfo {
        release_date: remote
            .published_at
            .map(|date| date.format("%B %-d, %Y").to_string())
            .unwrap_or_default(),
        version: remote.version,
        release_notes,
        download_url: remote.download_url,
        sha256: remote.sha256,
        downloaded_file: None,
    }
}

impl Inner {
    fn load_policy(&self) -> UpdatePolicy {
        self.settings.policy().unwrap_or_else(|e| {
            warn!("Failed to read update policy, using defaults: {}", e);
            UpdatePolicy::default()
        })
    }

    fn persist(&self, what: &str, update: &mut dyn FnMut(&mut UpdatePolicy)) {
        if let Err(e) = self.settings.update_policy(update) {
            warn!("Failed to persist {}: {}", what, e);
        }
    }

    /// Store `state` and push it to observers. Observers run after the lock is released.
    fn commit(&self, machine: &mut Machine, state: UpdateState) -> UpdateState {
        if machine.state.name() != state.name() {
            info!("Update state {} -> {}", machine.state.name(), state.name());
        }
        machine.state = state;
        machine.state.clone()
    }

    /// Decide whether a check should run and, if so, enter `Checking`.
    fn begin_check(&self, origin: Origin) -> bool {
        let snapshot = {
            let mut machine = self.machine.lock();
            match &machine.state {
                UpdateState::Checking => {
                    debug!("Update check already in progress, ignoring request");
                    return false;
                }
                UpdateState::Downloading { .. } => {
                    debug!("Update download in progress, ignoring check request");
                    return false;
                }
                _ => {}
            }

            if matches!(machine.state, UpdateState::Downloaded { .. }) {
                let snapshot = machine.state.clone();
                drop(machine);
                if let Some(info) = snapshot.info() {
                    info!("Update {} already downloaded, skipping check", info.version);
                }
                self.broadcaster.publish(&snapshot);
                return false;
            }

            match origin {
                Origin::Trigger(trigger) if !trigger.is_user_initiated() => {
                    if matches!(machine.state, UpdateState::Error { .. })
                        && machine.retry_count >= self.config.max_retries
                    {
                        debug!("Automatic retries exhausted, waiting for a manual check");
                        return false;
                    }
                    if machine.retry_timer.as_ref().is_some_and(|t| !t.is_finished()) {
                        debug!("Retry already scheduled, skipping automatic check");
                        return false;
                    }
                    let policy = self.load_policy();
                    if !policy.is_check_due(now_ms(), self.config.check_interval()) {
                        debug!(
                            "Skipping automatic update check, last check at {}",
                            policy.last_check_timestamp
                        );
                        return false;
                    }
                }
                Origin::Trigger(trigger) => {
                    if let Some(timer) = machine.retry_timer.take() {
                        timer.abort();
                    }
                    machine.retry_count = 0;
                    debug!("Update check requested by user ({:?})", trigger);
                }
                Origin::Retry => {
                    // A user check may have resolved the error after this retry was spawned
                    if !matches!(machine.state, UpdateState::Error { .. }) {
                        debug!("Dropping stale retry, state is {}", machine.state.name());
                        return false;
                    }
                    machine.retry_timer = None;
                }
            }

            self.commit(&mut machine, UpdateState::Checking)
        };
        self.broadcaster.publish(&snapshot);
        true
    }

    async fn run_check(self: &Arc<Self>, origin: Origin) -> UpdateResult<()> {
        if !self.begin_check(origin) {
            return Ok(());
        }

        info!(
            "Checking for updates ({:?}), current version: {}",
            origin, self.config.current_version
        );

        match self.fetch_latest().await {
            Ok(Some(remote)) if is_newer(&self.config.current_version, &remote.version) => {
                self.on_update_found(remote);
                Ok(())
            }
            Ok(Some(remote)) => {
                info!("Up to date (latest release is {})", remote.version);
                self.on_no_update();
                Ok(())
            }
            Ok(None) => {
                self.on_no_update();
                Ok(())
            }
            Err(e) => {
                self.fail(Operation::Check, &e);
                Err(e)
            }
        }
    }

    async fn fetch_latest(&self) -> UpdateResult<Option<RemoteRelease>> {
        if self.config.preflight_enabled {
            match timeout(self.config.preflight_timeout(), self.source.probe()).await {
                Ok(Ok(())) => {}
                Ok(Err(UpdateError::NetworkUnavailable(reason))) => {
                    return Err(UpdateError::NetworkUnavailable(reason));
                }
                Ok(Err(e)) => return Err(UpdateError::NetworkUnavailable(e.to_string())),
                Err(_) => {
                    return Err(UpdateError::NetworkUnavailable(
                        "connectivity check timed out".to_string(),
                    ));
                }
            }
        }

        match timeout(self.config.check_timeout(), self.source.latest_release()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Release source did not answer within {:?}",
                    self.config.check_timeout()
                );
                Err(UpdateError::Timeout)
            }
        }
    }

    fn on_no_update(&self) {
        self.persist("last check time", &mut |p| p.last_check_timestamp = now_ms());
        let snapshot = {
            let mut machine = self.machine.lock();
            if !matches!(machine.state, UpdateState::Checking) {
                return;
            }
            machine.retry_count = 0;
            self.commit(&mut machine, UpdateState::Idle)
        };
        self.broadcaster.publish(&snapshot);
    }

    fn on_update_found(self: &Arc<Self>, remote: RemoteRelease) {
        let info = release_info(remote);
        info!("Update available: {} -> {}", self.config.current_version, info.version);

        let snapshot = {
            let mut machine = self.machine.lock();
            if !matches!(machine.state, UpdateState::Checking) {
                return;
            }
            machine.retry_count = 0;
            machine.release = Some(info.clone());
            self.commit(&mut machine, UpdateState::Available { info })
        };
        self.broadcaster.publish(&snapshot);

        if self.load_policy().auto_check_and_install {
            self.spawn_download(Origin::Trigger(CheckTrigger::Auto));
        }
    }

    /// Enter `Downloading`. `Ok(None)` means a download is already running.
    fn begin_download(&self, origin: Origin) -> UpdateResult<Option<ReleaseInfo>> {
        let (info, snapshot) = {
            let mut machine = self.machine.lock();
            let info = match (&machine.state, origin) {
                (UpdateState::Downloading { .. }, _) => {
                    debug!("Update download already in progress");
                    return Ok(None);
                }
                (UpdateState::Available { info }, _) => info.clone(),
                (UpdateState::Error { .. }, Origin::Retry) => match machine.release.clone() {
                    Some(info) => info,
                    None => {
                        return Err(UpdateError::InvalidState(
                            "No update available to download".to_string(),
                        ))
                    }
                },
                (UpdateState::Downloaded { .. }, _) => {
                    return Err(UpdateError::InvalidState(
                        "Update already downloaded".to_string(),
                    ))
                }
                _ => {
                    return Err(UpdateError::InvalidState(
                        "No update available to download".to_string(),
                    ))
                }
            };

            if origin == Origin::Retry {
                machine.retry_timer = None;
            }
            machine.release = Some(info.clone());
            let snapshot = self.commit(
                &mut machine,
                UpdateState::Downloading { info: info.clone(), progress: 0 },
            );
            (info, snapshot)
        };
        self.broadcaster.publish(&snapshot);
        Ok(Some(info))
    }

    fn spawn_download(self: &Arc<Self>, origin: Origin) {
        match self.begin_download(origin) {
            Ok(Some(info)) => {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    let _ = inner.run_download(info).await;
                });
            }
            Ok(None) => {}
            Err(e) => debug!("Not starting download: {}", e),
        }
    }

    async fn run_download(self: &Arc<Self>, info: ReleaseInfo) -> UpdateResult<()> {
        info!("Downloading update {}", info.version);
        let weak: Weak<Self> = Arc::downgrade(self);
        let progress = move |percent: u8| {
            if let Some(inner) = weak.upgrade() {
                inner.report_progress(percent);
            }
        };

        match self.transport.download(&info, &progress).await {
            Ok(path) => {
                self.on_downloaded(info, path);
                Ok(())
            }
            Err(e) => {
                self.fail(Operation::Download, &e);
                Err(e)
            }
        }
    }

    fn report_progress(&self, percent: u8) {
        let percent = percent.min(100);
        let snapshot = {
            let mut machine = self.machine.lock();
            match &mut machine.state {
                UpdateState::Downloading { progress, .. } if percent > *progress => {
                    *progress = percent;
                }
                _ => return,
            }
            machine.state.clone()
        };
        self.broadcaster.publish(&snapshot);
    }

    fn on_downloaded(&self, mut info: ReleaseInfo, path: std::path::PathBuf) {
        info!("Update {} downloaded to {}", info.version, path.display());
        info.downloaded_file = Some(path);

        self.persist("download completion", &mut |p| {
            p.last_check_timestamp = now_ms();
            p.update_deferred = false;
        });

        let snapshot = {
            let mut machine = self.machine.lock();
            if !matches!(machine.state, UpdateState::Downloading { .. }) {
                return;
            }
            machine.retry_count = 0;
            machine.release = Some(info.clone());
            self.commit(&mut machine, UpdateState::Downloaded { info })
        };
        self.broadcaster.publish(&snapshot);
    }

    /// Move to `Error` and schedule a retry while under the cap.
    fn fail(self: &Arc<Self>, operation: Operation, err: &UpdateError) {
        let max = self.config.max_retries;
        let snapshot = {
            let mut machine = self.machine.lock();
            if !machine.state.is_in_flight() {
                debug!("Ignoring stale {:?} failure: {}", operation, err);
                return;
            }

            machine.retry_count += 1;
            let retry_count = machine.retry_count;
            let base = err.user_message();
            let will_retry = err.is_retryable() && retry_count < max;

            let message = if will_retry {
                warn!(
                    "Update {:?} failed ({}), retrying in {:?} ({}/{})",
                    operation,
                    err,
                    self.config.retry_delay(),
                    retry_count,
                    max
                );
                machine.retry_timer = Some(self.schedule_retry(operation));
                format!("{}. Retrying... ({}/{})", base, retry_count, max)
            } else {
                error!(
                    "Update {:?} failed ({}), giving up after {} attempts",
                    operation, err, retry_count
                );
                base
            };

            self.commit(&mut machine, UpdateState::Error { message, retry_count })
        };
        self.broadcaster.publish(&snapshot);
    }

    fn schedule_retry(self: &Arc<Self>, operation: Operation) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let delay = self.config.retry_delay();
        tokio::spawn(async move {
            sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                match operation {
                    Operation::Check => inner.spawn_check(Origin::Retry),
                    Operation::Download => inner.spawn_download(Origin::Retry),
                }
            }
        })
    }

    fn spawn_check(self: &Arc<Self>, origin: Origin) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let _ = inner.run_check(origin).await;
        });
    }

    fn schedule_auto_checks(self: &Arc<Self>, policy: &UpdatePolicy) {
        let due = policy.is_check_due(now_ms(), self.config.check_interval());
        let first_delay = if due {
            self.config.startup_delay()
        } else {
            self.config.recheck_interval()
        };
        let recheck = self.config.recheck_interval();

        if due {
            info!("Automatic update check scheduled in {:?}", first_delay);
        } else {
            info!("Last update check is recent, next evaluation in {:?}", first_delay);
        }

        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut delay = first_delay;
            loop {
                sleep(delay).await;
                match weak.upgrade() {
                    // Spawned separately so cancelling this loop never interrupts a check
                    Some(inner) => inner.spawn_check(Origin::Trigger(CheckTrigger::Auto)),
                    None => break,
                }
                delay = recheck;
            }
        });

        let previous = self.machine.lock().auto_check_task.replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let machine = self.machine.get_mut();
        if let Some(task) = machine.auto_check_task.take() {
            task.abort();
        }
        if let Some(timer) = machine.retry_timer.take() {
            timer.abort();
        }
    }
}
