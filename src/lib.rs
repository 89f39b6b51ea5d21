pub mod commands;
pub mod config;
pub mod settings;
pub mod update;

use std::sync::Arc;

use config::UpdaterConfig;
use settings::JsonSettingsStore;
use update::{GithubReleaseSource, HttpTransport, UpdateCoordinator};

/// Wire the production collaborators around a coordinator.
pub fn build_coordinator(config: UpdaterConfig) -> anyhow::Result<UpdateCoordinator> {
  let settings = JsonSettingsStore::in_config_dir(&config.app_name)?;
  log::info!("Update settings stored in {}", settings.path().display());

  let source = GithubReleaseSource::new(config.repo_owner.clone(), config.repo_name.clone());
  let transport = HttpTransport::in_cache_dir(&config.app_name);

  Ok(UpdateCoordinator::new(
    config,
    Arc::new(settings),
    Arc::new(source),
    Arc::new(transport),
  ))
}

#[cfg(feature = "tauri")]
struct TauriStatusObserver {
  handle: tauri::AppHandle,
}

/// Keeps the window observer registered for the lifetime of the app.
#[cfg(feature = "tauri")]
struct StatusBridge {
  _observer: Arc<TauriStatusObserver>,
  _registration: update::ObserverHandle,
}

#[cfg(feature = "tauri")]
impl update::StatusObserver for TauriStatusObserver {
  fn on_status(&self, state: &update::UpdateState) {
    use tauri::Emitter;

    if let Err(e) = self.handle.emit("updater:status", state) {
      log::warn!("Failed to emit update status: {}", e);
    }
  }
}

#[cfg(feature = "tauri")]
#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
  use tauri::Manager;

  tauri::Builder::default()
    .invoke_handler(tauri::generate_handler![
      commands::tauri_commands::check_for_updates,
      commands::tauri_commands::download_update,
      commands::tauri_commands::install_update,
      commands::tauri_commands::defer_update,
      commands::tauri_commands::get_update_status,
      commands::tauri_commands::get_update_policy,
      commands::tauri_commands::set_auto_update,
    ])
    .setup(|app| {
      if cfg!(debug_assertions) {
        app.handle().plugin(
          tauri_plugin_log::Builder::default()
            .level(log::LevelFilter::Info)
            .build(),
        )?;
      }

      let config = UpdaterConfig::from_env()?;
      let coordinator = build_coordinator(config)?;

      let observer = Arc::new(TauriStatusObserver {
        handle: app.handle().clone(),
      });
      let registration = coordinator.attach(observer.clone());
      app.manage(StatusBridge {
        _observer: observer,
        _registration: registration,
      });

      let scheduler = coordinator.clone();
      tauri::async_runtime::spawn(async move {
        scheduler.start();
      });
      app.manage(coordinator);

      log::info!("Traybar updater started");
      Ok(())
    })
    .build(tauri::generate_context!())
    .expect("error while building tauri application")
    .run(|app, event| {
      if let tauri::RunEvent::ExitRequested { .. } = event {
        if let Some(coordinator) = app.try_state::<UpdateCoordinator>() {
          coordinator.install_on_quit();
        }
      }
    });
}

/// Headless entry point: one manual check, then print the settled state as JSON.
#[cfg(not(feature = "tauri"))]
pub fn run() {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

  if let Err(e) = run_headless() {
    log::error!("Update check failed: {:#}", e);
    std::process::exit(1);
  }
}

#[cfg(not(feature = "tauri"))]
fn run_headless() -> anyhow::Result<()> {
  let runtime = tokio::runtime::Runtime::new()?;
  runtime.block_on(async {
    let config = UpdaterConfig::from_env()?;
    log::info!(
      "Checking {}/{} for releases newer than {}",
      config.repo_owner,
      config.repo_name,
      config.current_version
    );

    let coordinator = build_coordinator(config)?;
    // The broadcaster only holds weak references; keep the observers alive here
    let log_observer = Arc::new(update::LogObserver);
    let _log_registration = coordinator.attach(log_observer.clone());
    let (channel, mut rx) = update::ChannelObserver::new();
    let _channel_registration = coordinator.attach(channel.clone());

    let response = commands::check_for_updates(&coordinator, None).await;
    if let Some(error) = &response.error {
      log::warn!("{}", error);
    }

    // An auto-started download keeps running after the check returns
    while coordinator.current_state().is_in_flight() {
      if rx.recv().await.is_none() {
        break;
      }
    }

    coordinator.shutdown();
    println!("{}", serde_json::to_string_pretty(&coordinator.current_state())?);
    Ok(())
  })
}
