//! UI-facing command surface.
//!
//! The plain functions are what the desktop shell and the headless runner call;
//! with the `tauri` feature each one is also exposed as a `#[tauri::command]`.

use crate::settings::UpdatePolicy;
use crate::update::{CheckTrigger, CommandResponse, UpdateCoordinator, UpdateState};

/// Check for updates. Missing trigger means the user asked from the settings panel.
pub async fn check_for_updates(
    coordinator: &UpdateCoordinator,
    trigger: Option<CheckTrigger>,
) -> CommandResponse {
    coordinator
        .check_for_updates(trigger.unwrap_or(CheckTrigger::Manual))
        .await
}

pub async fn download_update(coordinator: &UpdateCoordinator) -> CommandResponse {
    coordinator.download_update().await
}

pub fn install_update(coordinator: &UpdateCoordinator) -> CommandResponse {
    coordinator.install_update()
}

pub fn defer_update(coordinator: &UpdateCoordinator) -> CommandResponse {
    coordinator.defer_update()
}

pub fn get_update_status(coordinator: &UpdateCoordinator) -> UpdateState {
    coordinator.current_state()
}

pub fn get_update_policy(coordinator: &UpdateCoordinator) -> Result<UpdatePolicy, String> {
    coordinator
        .policy()
        .map_err(|e| format!("Failed to read update settings: {}", e))
}

/// Persist the automatic-update toggle and reschedule checks to match.
pub fn set_auto_update(
    coordinator: &UpdateCoordinator,
    enabled: bool,
) -> Result<UpdatePolicy, String> {
    let policy = coordinator
        .set_auto_check_and_install(enabled)
        .map_err(|e| format!("Failed to save update settings: {}", e))?;
    Ok(policy)
}

#[cfg(feature = "tauri")]
pub mod tauri_commands {
    use tauri::State;

    use crate::settings::UpdatePolicy;
    use crate::update::{CheckTrigger, CommandResponse, UpdateCoordinator, UpdateState};

    #[tauri::command]
    pub async fn check_for_updates(
        trigger: Option<CheckTrigger>,
        coordinator: State<'_, UpdateCoordinator>,
    ) -> Result<CommandResponse, String> {
        Ok(super::check_for_updates(&coordinator, trigger).await)
    }

    #[tauri::command]
    pub async fn download_update(
        coordinator: State<'_, UpdateCoordinator>,
    ) -> Result<CommandResponse, String> {
        Ok(super::download_update(&coordinator).await)
    }

    #[tauri::command]
    pub fn install_update(coordinator: State<'_, UpdateCoordinator>) -> CommandResponse {
        super::install_update(&coordinator)
    }

    #[tauri::command]
    pub fn defer_update(coordinator: State<'_, UpdateCoordinator>) -> CommandResponse {
        super::defer_update(&coordinator)
    }

    #[tauri::command]
    pub fn get_update_status(coordinator: State<'_, UpdateCoordinator>) -> UpdateState {
        super::get_update_status(&coordinator)
    }

    #[tauri::command]
    pub fn get_update_policy(
        coordinator: State<'_, UpdateCoordinator>,
    ) -> Result<UpdatePolicy, String> {
        super::get_update_policy(&coordinator)
    }

    #[tauri::command]
    pub fn set_auto_update(
        enabled: bool,
        coordinator: State<'_, UpdateCoordinator>,
    ) -> Result<UpdatePolicy, String> {
        super::set_auto_update(&coordinator, enabled)
    }
}
