//! Session Manager
//!
//! The orchestrator and the only interface peripheral UI code calls.
//! Composes the profile catalog, the credential store, and the process
//! supervisor: given a profile identifier and a mode it resolves the
//! profile and its credential material, drives the supervisor through its
//! state machine, and hands back a session handle.
//!
//! Policy: starting a session for a profile that already has a live session
//! is rejected with [`ManagerError::AlreadyActive`]; the caller stops the
//! existing session first if a restart is wanted.

use crate::catalog::{CatalogError, Profile, ProfileCatalog, ProfileId};
use crate::credentials::{Credential, CredentialError, CredentialStore, Secret};
use crate::settings::{Settings, SettingsError};
use crate::supervisor::{
    ProcessSupervisor, Session, SessionHandle, SessionId, SessionMode, SupervisorConfig,
    SupervisorError,
};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Freshly entered credentials for one start attempt.
///
/// Persisted only after the session reaches `Running`; a failed spawn leaves
/// no trace of them on disk.
#[derive(Debug)]
pub struct CredentialInput {
    pub username: String,
    pub secret: Secret,
}

/// Orchestrates catalog, store, and supervisor.
pub struct SessionManager {
    settings: Settings,
    catalog: RwLock<ProfileCatalog>,
    store: CredentialStore,
    supervisor: ProcessSupervisor,
}

impl SessionManager {
    /// Build a manager from loaded settings.
    ///
    /// Scans the profile directory once; call [`rescan`](Self::rescan) to
    /// pick up changes later.
    pub fn new(settings: Settings) -> Result<Self, ManagerError> {
        settings.validate()?;
        let catalog = ProfileCatalog::scan(&settings.profile_dir)?;
        let store = CredentialStore::open(&settings.credential_dir)?;
        let supervisor = ProcessSupervisor::new(SupervisorConfig::from_settings(&settings));

        info!(
            "Session manager ready: {} profiles under {}",
            catalog.len(),
            settings.profile_dir.display()
        );

        Ok(Self {
            settings,
            catalog: RwLock::new(catalog),
            store,
            supervisor,
        })
    }

    /// The settings this manager was built from.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Current catalog snapshot.
    pub async fn profiles(&self) -> Vec<Profile> {
        self.catalog.read().await.profiles().to_vec()
    }

    /// Re-scan the profile directory.
    pub async fn rescan(&self) -> Result<(), ManagerError> {
        let catalog = ProfileCatalog::scan(&self.settings.profile_dir)?;
        *self.catalog.write().await = catalog;
        Ok(())
    }

    /// Whether encrypted credentials are stored for a profile.
    pub fn has_credentials(&self, profile_id: &ProfileId) -> bool {
        self.store.contains(profile_id)
    }

    /// Remove the stored credentials for a profile.
    pub fn forget_credentials(&self, profile_id: &ProfileId) -> Result<(), ManagerError> {
        self.store.delete(profile_id)?;
        Ok(())
    }

    /// Start a session for a profile.
    ///
    /// Credential resolution: `fresh` input wins when given, otherwise the
    /// stored credential is used; a profile demanding auth with neither
    /// available fails with [`ManagerError::CredentialsRequired`]. Fresh
    /// credentials are encrypted and persisted once the session is running.
    pub async fn start(
        &self,
        profile_id: &ProfileId,
        mode: SessionMode,
        fresh: Option<CredentialInput>,
    ) -> Result<SessionHandle, ManagerError> {
        if let Some(existing) = self.supervisor.active_for_profile(profile_id).await {
            return Err(ManagerError::AlreadyActive(profile_id.clone(), existing.id));
        }

        let profile = self
            .catalog
            .read()
            .await
            .resolve(profile_id)
            .cloned()
            .ok_or_else(|| ManagerError::ProfileNotFound(profile_id.clone()))?;

        let (credential, fresh_supplied) = if profile.requires_credentials() {
            match fresh {
                Some(input) => (
                    Some(Credential {
                        profile_id: profile.id.clone(),
                        username: input.username,
                        secret: input.secret,
                    }),
                    true,
                ),
                None => match self.store.load(&profile.id) {
                    Ok(credential) => (Some(credential), false),
                    Err(CredentialError::NotFound(_)) => {
                        return Err(ManagerError::CredentialsRequired(profile.id.clone()));
                    }
                    Err(e) => return Err(e.into()),
                },
            }
        } else {
            (None, false)
        };

        let handle = self
            .supervisor
            .spawn(&profile, credential.as_ref(), mode)
            .await?;

        if fresh_supplied {
            if let Some(credential) = &credential {
                // The session is up; a persistence failure must not undo it.
                if let Err(e) =
                    self.store
                        .save(&profile.id, &credential.username, &credential.secret)
                {
                    warn!("Session {} is running but credentials were not saved: {}", handle.id(), e);
                }
            }
        }

        Ok(handle)
    }

    /// Stop a session gracefully (idempotent).
    pub async fn stop(&self, session_id: SessionId) -> Result<(), ManagerError> {
        self.supervisor.terminate(session_id, false).await?;
        Ok(())
    }

    /// Snapshot of one session.
    pub async fn status(&self, session_id: SessionId) -> Option<Session> {
        self.supervisor.status(session_id).await
    }

    /// Sessions currently occupying a profile.
    pub async fn list_active(&self) -> Vec<Session> {
        self.supervisor.active_sessions().await
    }
}

/// Session manager errors
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("unknown profile: {0}")]
    ProfileNotFound(ProfileId),

    #[error("profile {0} already has a live session ({1})")]
    AlreadyActive(ProfileId, SessionId),

    #[error("profile {0} requires credentials and none are stored")]
    CredentialsRequired(ProfileId),

    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::supervisor::SessionState;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    const CONNECTED_SCRIPT: &str =
        "#!/bin/sh\necho 'Initialization Sequence Completed'\nexec sleep 30\n";

    fn fixture(script: &str) -> (tempfile::TempDir, Settings) {
        let dir = tempfile::tempdir().unwrap();
        let profile_dir = dir.path().join("profiles");
        fs::create_dir_all(profile_dir.join("Location1")).unwrap();
        fs::write(
            profile_dir.join("Location1").join("config1.ovpn"),
            "remote vpn.example.com 1194\nauth-user-pass\n",
        )
        .unwrap();
        fs::write(
            profile_dir.join("open.ovpn"),
            "remote vpn.example.com 1194\n",
        )
        .unwrap();

        let binary = dir.path().join("fake-openvpn");
        fs::write(&binary, script).unwrap();
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();

        let settings = Settings {
            profile_dir,
            credential_dir: dir.path().join("creds"),
            openvpn_binary: binary.to_str().unwrap().to_string(),
            use_sudo: false,
            handshake_timeout_secs: 5,
            grace_period_secs: 2,
            debug_verbosity: 4,
        };
        (dir, settings)
    }

    fn fresh() -> Option<CredentialInput> {
        Some(CredentialInput {
            username: "alice".to_string(),
            secret: Secret::from("hunter2"),
        })
    }

    fn id(s: &str) -> ProfileId {
        ProfileId::from(s)
    }

    #[tokio::test]
    async fn test_daemon_start_persists_credentials_and_tracks_session() {
        let (_dir, settings) = fixture(CONNECTED_SCRIPT);
        let manager = SessionManager::new(settings).unwrap();

        let handle = manager
            .start(&id("Location1/config1"), SessionMode::Daemon, fresh())
            .await
            .unwrap();

        // Credentials landed encrypted
        assert!(manager.has_credentials(&id("Location1/config1")));

        let active = manager.list_active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].profile_id, id("Location1/config1"));
        assert_eq!(active[0].state, SessionState::Running);

        manager.stop(handle.id()).await.unwrap();
        assert!(manager.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_second_session_for_same_profile_is_rejected() {
        let (_dir, settings) = fixture(CONNECTED_SCRIPT);
        let manager = SessionManager::new(settings).unwrap();

        let handle = manager
            .start(&id("Location1/config1"), SessionMode::Daemon, fresh())
            .await
            .unwrap();

        let result = manager
            .start(&id("Location1/config1"), SessionMode::Daemon, None)
            .await;
        assert!(matches!(result, Err(ManagerError::AlreadyActive(_, _))));
        assert_eq!(manager.list_active().await.len(), 1);

        manager.stop(handle.id()).await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_profiles_run_concurrently() {
        let (_dir, settings) = fixture(CONNECTED_SCRIPT);
        let manager = SessionManager::new(settings).unwrap();

        let first = manager
            .start(&id("Location1/config1"), SessionMode::Daemon, fresh())
            .await
            .unwrap();
        let second = manager
            .start(&id("open"), SessionMode::Daemon, None)
            .await
            .unwrap();

        assert_eq!(manager.list_active().await.len(), 2);

        manager.stop(first.id()).await.unwrap();
        manager.stop(second.id()).await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_no_credential_write() {
        let (_dir, mut settings) = fixture(CONNECTED_SCRIPT);
        settings.openvpn_binary = "/no/such/openvpn-binary".to_string();
        let manager = SessionManager::new(settings).unwrap();

        let result = manager
            .start(&id("Location1/config1"), SessionMode::Daemon, fresh())
            .await;
        assert!(matches!(
            result,
            Err(ManagerError::Supervisor(SupervisorError::Spawn { .. }))
        ));

        assert!(!manager.has_credentials(&id("Location1/config1")));
        assert!(manager.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_profile() {
        let (_dir, settings) = fixture(CONNECTED_SCRIPT);
        let manager = SessionManager::new(settings).unwrap();

        let result = manager
            .start(&id("nope"), SessionMode::Daemon, None)
            .await;
        assert!(matches!(result, Err(ManagerError::ProfileNotFound(_))));
    }

    #[tokio::test]
    async fn test_credentials_required_without_stored_or_fresh() {
        let (_dir, settings) = fixture(CONNECTED_SCRIPT);
        let manager = SessionManager::new(settings).unwrap();

        let result = manager
            .start(&id("Location1/config1"), SessionMode::Daemon, None)
            .await;
        assert!(matches!(result, Err(ManagerError::CredentialsRequired(_))));
    }

    #[tokio::test]
    async fn test_stored_credentials_are_reused() {
        let (_dir, settings) = fixture(CONNECTED_SCRIPT);
        let manager = SessionManager::new(settings).unwrap();

        let first = manager
            .start(&id("Location1/config1"), SessionMode::Daemon, fresh())
            .await
            .unwrap();
        manager.stop(first.id()).await.unwrap();

        // No fresh input this time; the stored credential carries the start
        let second = manager
            .start(&id("Location1/config1"), SessionMode::Daemon, None)
            .await
            .unwrap();
        manager.stop(second.id()).await.unwrap();
    }

    #[tokio::test]
    async fn test_forget_credentials() {
        let (_dir, settings) = fixture(CONNECTED_SCRIPT);
        let manager = SessionManager::new(settings).unwrap();

        let handle = manager
            .start(&id("Location1/config1"), SessionMode::Daemon, fresh())
            .await
            .unwrap();
        manager.stop(handle.id()).await.unwrap();

        manager.forget_credentials(&id("Location1/config1")).unwrap();
        assert!(!manager.has_credentials(&id("Location1/config1")));

        let result = manager
            .start(&id("Location1/config1"), SessionMode::Daemon, None)
            .await;
        assert!(matches!(result, Err(ManagerError::CredentialsRequired(_))));
    }

    #[tokio::test]
    async fn test_profile_without_auth_needs_no_credentials() {
        let (_dir, settings) = fixture(CONNECTED_SCRIPT);
        let manager = SessionManager::new(settings).unwrap();

        let handle = manager
            .start(&id("open"), SessionMode::Daemon, None)
            .await
            .unwrap();
        assert!(!manager.has_credentials(&id("open")));

        manager.stop(handle.id()).await.unwrap();
    }

    #[test]
    fn test_missing_profile_dir_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            profile_dir: dir.path().join("absent"),
            credential_dir: dir.path().join("creds"),
            ..Settings::default()
        };

        let result = SessionManager::new(settings);
        assert!(matches!(result, Err(ManagerError::Settings(_))));
    }

    #[tokio::test]
    async fn test_rescan_picks_up_new_profiles() {
        let (dir, settings) = fixture(CONNECTED_SCRIPT);
        let manager = SessionManager::new(settings).unwrap();
        assert_eq!(manager.profiles().await.len(), 2);

        fs::write(
            dir.path().join("profiles").join("extra.ovpn"),
            "remote vpn.example.com 1194\n",
        )
        .unwrap();

        manager.rescan().await.unwrap();
        assert_eq!(manager.profiles().await.len(), 3);
    }

    #[tokio::test]
    async fn test_exit_to_shell_stops_debug_session_within_grace() {
        let (_dir, settings) = fixture(CONNECTED_SCRIPT);
        let grace = std::time::Duration::from_secs(settings.grace_period_secs);
        let manager = SessionManager::new(settings).unwrap();

        let mut handle = manager
            .start(&id("Location1/config1"), SessionMode::Debug, fresh())
            .await
            .unwrap();

        // The UI drops its output stream on the way out; that alone must not
        // stop anything
        drop(handle.take_output());
        let session = manager.status(handle.id()).await.unwrap();
        assert_eq!(session.state, SessionState::Running);

        let before = std::time::Instant::now();
        manager.stop(handle.id()).await.unwrap();
        assert!(before.elapsed() < grace, "stop exceeded the grace period");

        let session = manager.status(handle.id()).await.unwrap();
        assert_eq!(session.state, SessionState::Stopped);
        assert!(manager.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_through_manager() {
        let (_dir, settings) = fixture(CONNECTED_SCRIPT);
        let manager = SessionManager::new(settings).unwrap();

        let handle = manager
            .start(&id("open"), SessionMode::Daemon, None)
            .await
            .unwrap();

        manager.stop(handle.id()).await.unwrap();
        manager.stop(handle.id()).await.unwrap();

        let session = manager.status(handle.id()).await.unwrap();
        assert_eq!(session.state, SessionState::Stopped);
    }
}
