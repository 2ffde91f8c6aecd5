//! Profile Catalog
//!
//! Discovers `.ovpn` configuration profiles under a root directory and maps
//! each one to a stable identifier derived from its relative path.
//!
//! A catalog is an immutable snapshot of one scan. Re-scanning an unchanged
//! tree yields the identical ordered profile list (lexicographic by relative
//! path), so identifiers are stable across runs.

use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Extension that marks a file as a connection profile.
const PROFILE_EXTENSION: &str = "ovpn";

/// OpenVPN directive that makes a profile require username/password auth.
const AUTH_DIRECTIVE: &str = "auth-user-pass";

/// Stable profile identifier.
///
/// Derived from the profile's path relative to the catalog root with the
/// extension stripped, e.g. `Location1/office` for
/// `<root>/Location1/office.ovpn`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProfileId(String);

impl ProfileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Flatten the id into a single filesystem-safe component.
    ///
    /// Used for deterministic credential file naming.
    pub fn flattened(&self) -> String {
        self.0.replace(['/', '\\'], "__")
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProfileId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A discovered connection profile.
#[derive(Debug, Clone)]
pub struct Profile {
    /// Stable identifier (relative path, extension stripped)
    pub id: ProfileId,
    /// Name shown in menus, e.g. `Location1/office.ovpn`
    pub display_name: String,
    /// Absolute path to the configuration file
    pub config_path: PathBuf,
    /// Immediate parent directory name, when grouped under one
    pub location_group: Option<String>,
}

impl Profile {
    /// Whether the profile's config demands username/password credentials.
    ///
    /// True when the file carries an `auth-user-pass` directive. Unreadable
    /// files are treated as not requiring credentials; the spawn will surface
    /// the real error.
    pub fn requires_credentials(&self) -> bool {
        match std::fs::read_to_string(&self.config_path) {
            Ok(content) => content
                .lines()
                .map(str::trim)
                .any(|line| line.starts_with(AUTH_DIRECTIVE)),
            Err(e) => {
                warn!("Could not read profile {}: {}", self.config_path.display(), e);
                false
            }
        }
    }
}

/// Snapshot of profiles found under one root directory.
#[derive(Debug, Clone)]
pub struct ProfileCatalog {
    root: PathBuf,
    profiles: Vec<Profile>,
}

impl ProfileCatalog {
    /// Walk `root` recursively and collect every `.ovpn` file as a profile.
    ///
    /// Unreadable entries are skipped with a warning instead of aborting the
    /// scan. The result is ordered lexicographically by relative path.
    pub fn scan(root: &Path) -> Result<Self, CatalogError> {
        if !root.is_dir() {
            return Err(CatalogError::RootNotFound(root.to_path_buf()));
        }

        let mut profiles = Vec::new();
        collect_profiles(root, root, &mut profiles);
        profiles.sort_by(|a, b| a.id.cmp(&b.id));

        debug!("Scanned {}: {} profiles", root.display(), profiles.len());

        Ok(Self {
            root: root.to_path_buf(),
            profiles,
        })
    }

    /// The scanned root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All profiles in scan order.
    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }

    /// Number of discovered profiles.
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Look up a profile by identifier.
    pub fn resolve(&self, id: &ProfileId) -> Option<&Profile> {
        self.profiles.iter().find(|p| &p.id == id)
    }
}

fn collect_profiles(root: &Path, dir: &Path, out: &mut Vec<Profile>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Skipping unreadable directory {}: {}", dir.display(), e);
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry in {}: {}", dir.display(), e);
                continue;
            }
        };

        let path = entry.path();
        if path.is_dir() {
            collect_profiles(root, &path, out);
            continue;
        }

        let is_profile = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == PROFILE_EXTENSION);
        if !is_profile {
            continue;
        }

        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let Some(relative_str) = relative.to_str() else {
            warn!("Skipping non-UTF8 profile path: {}", path.display());
            continue;
        };

        let id = relative_str
            .strip_suffix(&format!(".{}", PROFILE_EXTENSION))
            .unwrap_or(relative_str);

        let location_group = relative
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .map(String::from);

        out.push(Profile {
            id: ProfileId::new(id),
            display_name: relative_str.to_string(),
            config_path: path.clone(),
            location_group,
        });
    }
}

/// Catalog errors
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("profile directory not found: {0}")]
    RootNotFound(PathBuf),
}
