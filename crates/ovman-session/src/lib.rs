//! ovman-session - OpenVPN Connection Session Manager
//!
//! Lets an operator pick among pre-provisioned `.ovpn` profiles, reuse or
//! supply encrypted credentials, and launch/monitor/terminate the OpenVPN
//! client subprocess for the chosen profile.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     UI / CLI (caller)                    │
//! └───────────────┬──────────────────────────────────────────┘
//!                 │ start(profile, mode) / stop(session)
//!                 ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                     SessionManager                       │
//! │                                                          │
//! │  ┌────────────────┐ ┌─────────────────┐ ┌─────────────┐  │
//! │  │ ProfileCatalog │ │ CredentialStore │ │   Process   │  │
//! │  │  (.ovpn scan)  │ │ (AEAD at rest)  │ │ Supervisor  │  │
//! │  └────────────────┘ └─────────────────┘ └──────┬──────┘  │
//! └────────────────────────────────────────────────│─────────┘
//!                                                  │ spawn / SIGTERM
//!                                                  ▼
//!                                       ┌────────────────────┐
//!                                       │  openvpn --config  │
//!                                       └────────────────────┘
//! ```
//!
//! # Security
//!
//! - Credentials at rest are sealed with XChaCha20-Poly1305; tampering is
//!   detected, never silently decrypted wrong
//! - Secrets reach the subprocess through a transient `0600` file, never
//!   argv or the environment, and are redacted from all `Debug` output
//! - `sudo` wraps only the spawned client, not the manager process

mod catalog;
mod credentials;
mod manager;
mod settings;
mod supervisor;

pub use catalog::{CatalogError, Profile, ProfileCatalog, ProfileId};
pub use credentials::{Credential, CredentialError, CredentialStore, Secret};
pub use manager::{CredentialInput, ManagerError, SessionManager};
pub use settings::{Settings, SettingsError};
pub use supervisor::{
    ProcessSupervisor, Session, SessionHandle, SessionId, SessionMode, SessionState,
    SupervisorConfig, SupervisorError, running_as_root,
};
