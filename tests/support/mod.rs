#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use traybar_updater_lib::config::UpdaterConfig;
use traybar_updater_lib::settings::{MemorySettingsStore, UpdatePolicy};
use traybar_updater_lib::update::{
    ChannelObserver, ObserverHandle, ProgressFn, RawReleaseNotes, ReleaseInfo, ReleaseSource,
    RemoteRelease, UpdateCoordinator, UpdateError, UpdateResult, UpdateState, UpdateTransport,
};

/// One scripted answer from the fake release feed.
pub enum Answer {
    Release(&'static str),
    NoRelease,
    Fail(&'static str),
    Hang,
    WaitFor(Arc<Notify>, &'static str),
}

/// How the fake feed answers the reachability check.
#[derive(Clone, Copy, Default)]
pub enum Reachability {
    #[default]
    Online,
    Offline,
    Stalled,
}

#[derive(Default)]
pub struct ScriptedSource {
    answers: Mutex<VecDeque<Answer>>,
    reachability: Mutex<Reachability>,
    /// Used once the script runs out.
    fallback: Mutex<Option<&'static str>>,
    pub calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(answers: Vec<Answer>) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.into()),
            ..Default::default()
        })
    }

    /// Every call fails with `message`.
    pub fn failing(message: &'static str) -> Arc<Self> {
        let source = Self::new(Vec::new());
        *source.fallback.lock() = Some(message);
        source
    }

    pub fn set_reachability(&self, reachability: Reachability) {
        *self.reachability.lock() = reachability;
    }

    pub fn push(&self, answer: Answer) {
        self.answers.lock().push_back(answer);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn remote(version: &str) -> RemoteRelease {
    RemoteRelease {
        version: version.to_string(),
        published_at: None,
        notes: RawReleaseNotes::Markdown(
            "## What's New\n- Faster startup\n- Fixed tray icon flicker\n- Dark mode".to_string(),
        ),
        download_url: format!("https://downloads.example.invalid/traybar-{}.dmg", version),
        size_bytes: 1024,
        sha256: None,
    }
}

#[async_trait::async_trait]
impl ReleaseSource for ScriptedSource {
    async fn probe(&self) -> UpdateResult<()> {
        let reachability = *self.reachability.lock();
        match reachability {
            Reachability::Online => Ok(()),
            Reachability::Offline => Err(UpdateError::Transport("dns lookup failed".to_string())),
            Reachability::Stalled => std::future::pending().await,
        }
    }

    async fn latest_release(&self) -> UpdateResult<Option<RemoteRelease>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let answer = self.answers.lock().pop_front();
        match answer {
            Some(Answer::Release(version)) => Ok(Some(remote(version))),
            Some(Answer::NoRelease) => Ok(None),
            Some(Answer::Fail(message)) => Err(UpdateError::Transport(message.to_string())),
            Some(Answer::Hang) => std::future::pending().await,
            Some(Answer::WaitFor(gate, version)) => {
                gate.notified().await;
                Ok(Some(remote(version)))
            }
            None => match *self.fallback.lock() {
                Some(message) => Err(UpdateError::Transport(message.to_string())),
                None => Ok(None),
            },
        }
    }
}

/// Download fake: reports a fixed progress script, optionally failing first.
pub struct FakeTransport {
    pub progress_script: Vec<u8>,
    failures_left: AtomicUsize,
    pub downloads: AtomicUsize,
    pub installs: Mutex<Vec<String>>,
    pub install_error: Mutex<Option<String>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Self::failing_downloads(0)
    }

    pub fn failing_downloads(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            progress_script: vec![0, 10, 45, 30, 80, 100],
            failures_left: AtomicUsize::new(failures),
            downloads: AtomicUsize::new(0),
            installs: Mutex::new(Vec::new()),
            install_error: Mutex::new(None),
        })
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl UpdateTransport for FakeTransport {
    async fn download(&self, info: &ReleaseInfo, progress: &ProgressFn) -> UpdateResult<PathBuf> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        progress(0);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(UpdateError::Transport("connection reset".to_string()));
        }
        for percent in &self.progress_script {
            tokio::task::yield_now().await;
            progress(*percent);
        }
        Ok(PathBuf::from(format!("/tmp/traybar-{}.dmg", info.version)))
    }

    fn quit_and_install(&self, info: &ReleaseInfo) -> UpdateResult<()> {
        if let Some(message) = self.install_error.lock().clone() {
            return Err(UpdateError::Transport(message));
        }
        self.installs.lock().push(info.version.clone());
        Ok(())
    }
}

pub struct Harness {
    pub coordinator: UpdateCoordinator,
    pub source: Arc<ScriptedSource>,
    pub transport: Arc<FakeTransport>,
    pub settings: Arc<MemorySettingsStore>,
    pub states: mpsc::UnboundedReceiver<UpdateState>,
    _observer: Arc<ChannelObserver>,
    _registration: ObserverHandle,
}

pub fn config(current_version: &str) -> UpdaterConfig {
    UpdaterConfig {
        current_version: current_version.to_string(),
        repo_owner: "acme".to_string(),
        repo_name: "traybar".to_string(),
        ..UpdaterConfig::default()
    }
}

pub fn harness(
    current_version: &str,
    policy: UpdatePolicy,
    source: Arc<ScriptedSource>,
    transport: Arc<FakeTransport>,
) -> Harness {
    let settings = Arc::new(MemorySettingsStore::new(policy));
    let coordinator = UpdateCoordinator::new(
        config(current_version),
        settings.clone(),
        source.clone(),
        transport.clone(),
    );
    let (observer, states) = ChannelObserver::new();
    let registration = coordinator.attach(observer.clone());
    Harness {
        coordinator,
        source,
        transport,
        settings,
        states,
        _observer: observer,
        _registration: registration,
    }
}

pub fn manual_policy() -> UpdatePolicy {
    UpdatePolicy {
        auto_check_and_install: false,
        ..UpdatePolicy::default()
    }
}

impl Harness {
    /// Collect published states until one matches `done`.
    pub async fn wait_for(&mut self, done: impl Fn(&UpdateState) -> bool) -> Vec<UpdateState> {
        let mut seen = Vec::new();
        loop {
            let state = tokio::time::timeout(Duration::from_secs(600), self.states.recv())
                .await
                .expect("timed out waiting for update state")
                .expect("status channel closed");
            let finished = done(&state);
            seen.push(state);
            if finished {
                return seen;
            }
        }
    }

    /// Everything published so far, without waiting.
    pub fn drain(&mut self) -> Vec<UpdateState> {
        let mut seen = Vec::new();
        while let Ok(state) = self.states.try_recv() {
            seen.push(state);
        }
        seen
    }
}
