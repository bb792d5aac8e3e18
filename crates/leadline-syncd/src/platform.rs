//! Desktop notification backend for the daemon.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Mutex;

use async_trait::async_trait;
use leadline_core::config::State;
use leadline_core::{Notification, NotificationPlatform, PermissionState, PushSubscription, SyncError};
use tracing::{debug, warn};

type Result<T> = std::result::Result<T, SyncError>;

/// Shows notifications through `notify-send` (Linux) or `osascript` (macOS).
///
/// The permission decision is persisted in the state file so it survives
/// restarts. Push is available only when an endpoint is configured.
pub struct DesktopPlatform {
    permission: Mutex<PermissionState>,
    state_path: Option<PathBuf>,
    push: Option<PushSubscription>,
}

impl DesktopPlatform {
    pub fn new(
        permission: PermissionState,
        state_path: Option<PathBuf>,
        push: Option<PushSubscription>,
    ) -> Self {
        Self {
            permission: Mutex::new(permission),
            state_path,
            push,
        }
    }

    fn store(&self, permission: PermissionState) {
        match self.permission.lock() {
            Ok(mut guard) => *guard = permission,
            Err(poisoned) => *poisoned.into_inner() = permission,
        }
        let Some(path) = &self.state_path else {
            return;
        };
        // Reload so fields written by other components are kept
        let mut state = if path.exists() {
            match State::load_from(path) {
                Ok(state) => state,
                Err(e) => {
                    warn!("Not persisting notification permission: {e}");
                    return;
                }
            }
        } else {
            State::default()
        };
        state.notifications.permission = permission;
        if let Err(e) = state.save_to(path) {
            warn!("Failed to persist notification permission: {e}");
        }
    }
}

fn prompt_user() -> std::result::Result<bool, dialoguer::Error> {
    dialoguer::Confirm::new()
        .with_prompt("Allow leadline to show desktop notifications?")
        .default(true)
        .interact()
}

#[cfg(target_os = "macos")]
fn notification_command(notification: &Notification) -> Command {
    let script = format!(
        "display notification {:?} with title {:?}",
        notification.body, notification.title
    );
    let mut command = Command::new("osascript");
    command.arg("-e").arg(script);
    command
}

#[cfg(not(target_os = "macos"))]
fn notification_command(notification: &Notification) -> Command {
    let mut command = Command::new("notify-send");
    command.arg("--app-name=leadline");
    if let Some(tag) = &notification.tag {
        // Replaces an earlier notification with the same tag
        command
            .arg("--hint")
            .arg(format!("string:x-canonical-private-synchronous:{tag}"));
    }
    command.arg(&notification.title).arg(&notification.body);
    command
}

#[async_trait]
impl NotificationPlatform for DesktopPlatform {
    fn permission(&self) -> PermissionState {
        match self.permission.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    async fn request_permission(&self) -> Result<PermissionState> {
        if !std::io::stdin().is_terminal() {
            debug!("No terminal attached, leaving notification permission undecided");
            return Ok(self.permission());
        }
        let answer = tokio::task::spawn_blocking(prompt_user)
            .await
            .map_err(|e| SyncError::PermissionDenied(format!("prompt aborted: {e}")))?
            .map_err(|e| SyncError::PermissionDenied(format!("prompt failed: {e}")))?;
        let permission = if answer {
            PermissionState::Granted
        } else {
            PermissionState::Denied
        };
        self.store(permission);
        Ok(permission)
    }

    fn show(&self, notification: &Notification) -> Result<()> {
        let mut child = notification_command(notification)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                SyncError::PermissionDenied(format!("notification backend unavailable: {e}"))
            })?;
        // Reap the helper without blocking the caller
        std::thread::spawn(move || child.wait());
        Ok(())
    }

    async fn push_subscription(&self) -> Result<Option<PushSubscription>> {
        Ok(self.push.clone())
    }

    async fn drop_push_subscription(&self) -> Result<Option<PushSubscription>> {
        Ok(self.push.clone())
    }

    fn set_badge(&self, count: usize) -> Result<()> {
        debug!("{count} reminder(s) due");
        Ok(())
    }
}
