use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::config::State;
use crate::models::CurrentUser;

/// Seam to the external auth/session provider.
pub trait AuthProvider: Send + Sync {
    fn current_user(&self) -> Option<CurrentUser>;

    /// Bearer token for remote calls, if the session is valid
    fn access_token(&self) -> Option<String>;

    fn sign_out(&self);
}

/// Auth provider backed by the machine state file written at login.
///
/// The file is re-read whenever it changes on disk or the session held in
/// memory is no longer valid, so a login refreshed by another process is
/// picked up without a restart.
pub struct StateAuthProvider {
    state: RwLock<State>,
    path: Option<PathBuf>,
    /// Modification time of the file when it was last read or written
    loaded_at: Mutex<Option<SystemTime>>,
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl StateAuthProvider {
    /// Wrap an already loaded state; `path` is where it is refreshed from and
    /// where sign-out persists it.
    pub fn new(state: State, path: Option<PathBuf>) -> Self {
        let loaded_at = path.as_deref().and_then(modified);
        Self {
            state: RwLock::new(state),
            path,
            loaded_at: Mutex::new(loaded_at),
        }
    }

    fn loaded_at(&self) -> std::sync::MutexGuard<'_, Option<SystemTime>> {
        match self.loaded_at.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn refresh(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let current = modified(path);
        let mut loaded_at = self.loaded_at();
        let changed = current.is_some() && current != *loaded_at;
        if !changed && self.read_current(State::is_session_valid) {
            return;
        }
        if current.is_none() {
            return;
        }
        match State::load_from(path) {
            Ok(state) => {
                debug!("Reloaded session from {}", path.display());
                *self.write() = state;
                *loaded_at = current;
            }
            Err(e) => warn!("Failed to reload session: {e}"),
        }
    }

    fn read_current<T>(&self, f: impl FnOnce(&State) -> T) -> T {
        match self.state.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&State) -> T) -> T {
        self.refresh();
        self.read_current(f)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl AuthProvider for StateAuthProvider {
    fn current_user(&self) -> Option<CurrentUser> {
        self.read(State::current_user)
    }

    fn access_token(&self) -> Option<String> {
        self.read(|s| s.access_token().map(str::to_string))
    }

    fn sign_out(&self) {
        // Same lock order as `refresh`
        let mut loaded_at = self.loaded_at();
        let mut guard = self.write();
        guard.clear_session();
        if let Some(path) = &self.path {
            if let Err(e) = guard.save_to(path) {
                warn!("Failed to persist sign-out: {e}");
            }
            *loaded_at = modified(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sign_out_clears_and_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.toml");

        let mut state = State::default();
        let user = CurrentUser {
            id: "u1".into(),
            role: "admin".into(),
            email: Some("a@example.com".into()),
        };
        state.store_session(&user, "jwt".into(), None);

        let provider = StateAuthProvider::new(state, Some(path.clone()));
        assert_eq!(provider.current_user(), Some(user));
        assert_eq!(provider.access_token().as_deref(), Some("jwt"));

        provider.sign_out();
        assert!(provider.current_user().is_none());
        let saved = State::load_from(&path).unwrap();
        assert!(saved.auth.access_token.is_none());
    }

    #[test]
    fn session_written_by_another_process_is_picked_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.toml");
        let user = CurrentUser {
            id: "u1".into(),
            role: "telecaller".into(),
            email: None,
        };

        let mut expired = State::default();
        expired.store_session(
            &user,
            "old".into(),
            Some(chrono::Utc::now() - chrono::Duration::minutes(1)),
        );
        expired.save_to(&path).unwrap();
        let provider = StateAuthProvider::new(State::load_from(&path).unwrap(), Some(path.clone()));
        assert!(provider.access_token().is_none());

        // A fresh login rewrites the file
        let mut fresh = State::load_from(&path).unwrap();
        fresh.store_session(
            &user,
            "new".into(),
            Some(chrono::Utc::now() + chrono::Duration::hours(1)),
        );
        fresh.save_to(&path).unwrap();

        assert_eq!(provider.access_token().as_deref(), Some("new"));
        assert_eq!(provider.current_user(), Some(user));
    }
}
