//! Authorization primitives: candidate keys and the oracle interface.
//!
//! The filtering engine depends only on the capability
//! `is_allowed(candidate) -> bool`. Three implementations are provided:
//! [`SetAuthorizer`] (a static allow-list loaded from a permissions file),
//! [`DenyAllAuthorizer`] (the fallback when no authorization source is
//! configured but startup is explicitly permitted), and
//! [`SpiceDbAuthorizer`] (a remote permission-check client with a
//! per-process cache).

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod spicedb;

pub use spicedb::{SpiceDbAuthorizer, SpiceDbConfig};

/// The permission assumed when a candidate or allow-list entry leaves it
/// empty.
pub const DEFAULT_PERMISSION: &str = "read";

/// Errors produced while constructing an authorizer.
#[derive(Debug, Error)]
pub enum AuthzError {
    /// Reading the permissions file failed.
    #[error("failed to read permissions file {path}: {source}")]
    Io {
        /// The file that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The permissions file is not valid JSON.
    #[error("failed to parse permissions file {path}: {source}")]
    Parse {
        /// The file that could not be parsed.
        path: PathBuf,
        /// The underlying JSON error.
        source: serde_json::Error,
    },

    /// The remote endpoint is missing or unparseable.
    #[error("invalid spicedb endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint {
        /// The endpoint as configured.
        endpoint: String,
        /// Why it was rejected.
        reason: String,
    },

    /// No bearer token was configured for the remote backend.
    #[error("spicedb token is required")]
    MissingToken,

    /// The subject string is not `type:id` or `type:id#relation`.
    #[error("invalid subject {value:?}, expected type:id or type:id#relation")]
    InvalidSubject {
        /// The subject as configured.
        value: String,
    },

    /// The consistency mode is not one of the supported values.
    #[error("unsupported spicedb consistency mode {value:?}")]
    InvalidConsistency {
        /// The mode as configured.
        value: String,
    },

    /// Building the HTTP client failed.
    #[error("failed to build spicedb http client: {0}")]
    Client(#[source] reqwest::Error),
}

/// An authorization subject derived from one record: the object a caller
/// must hold `permission` on for the record to become visible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateKey {
    /// The object type, e.g. `metric_row` or `job`.
    pub object_type: String,
    /// The object identifier within its type.
    pub object_id: String,
    /// The permission to check; empty normalizes to `read`.
    #[serde(default)]
    pub permission: String,
}

impl CandidateKey {
    /// Builds a candidate key, defaulting an empty permission to `read`.
    #[must_use]
    pub fn new(
        object_type: impl Into<String>,
        object_id: impl Into<String>,
        permission: impl Into<String>,
    ) -> Self {
        Self {
            object_type: object_type.into(),
            object_id: object_id.into(),
            permission: permission.into(),
        }
        .normalized()
    }

    /// Returns the key with an empty permission replaced by `read`.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.permission.is_empty() {
            self.permission = DEFAULT_PERMISSION.to_string();
        }
        self
    }
}

/// The authorization oracle.
///
/// Implementations must be shareable across concurrent reads; every method
/// takes `&self`.
pub trait Authorizer: Send + Sync {
    /// Returns whether the caller holds `candidate.permission` on the
    /// object identified by the candidate.
    fn is_allowed(&self, candidate: &CandidateKey) -> bool;
}

/// Serialized form of the permissions file: `{"allow": [CandidateKey, …]}`.
#[derive(Debug, Deserialize)]
struct PermissionsDoc {
    #[serde(default)]
    allow: Vec<CandidateKey>,
}

/// Authorizer backed by a static set of allowed candidate keys.
#[derive(Debug, Default)]
pub struct SetAuthorizer {
    allowed: HashSet<CandidateKey>,
}

impl SetAuthorizer {
    /// Builds an authorizer from an explicit list of allowed keys.
    ///
    /// Empty permissions default to `read`.
    #[must_use]
    pub fn new(allow: impl IntoIterator<Item = CandidateKey>) -> Self {
        Self {
            allowed: allow.into_iter().map(CandidateKey::normalized).collect(),
        }
    }

    /// Loads an authorizer from a JSON permissions file.
    ///
    /// # Errors
    ///
    /// Returns [`AuthzError::Io`] if the file cannot be read and
    /// [`AuthzError::Parse`] if it is not a valid permissions document.
    pub fn from_permissions_file(path: impl AsRef<Path>) -> Result<Self, AuthzError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| AuthzError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let doc: PermissionsDoc =
            serde_json::from_slice(&bytes).map_err(|source| AuthzError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::new(doc.allow))
    }

    /// Returns the allowed keys in a stable sorted order, for diagnostics.
    #[must_use]
    pub fn allowed_keys(&self) -> Vec<CandidateKey> {
        let mut keys: Vec<CandidateKey> = self.allowed.iter().cloned().collect();
        keys.sort_by(|a, b| {
            (&a.object_type, &a.object_id, &a.permission)
                .cmp(&(&b.object_type, &b.object_id, &b.permission))
        });
        keys
    }
}

impl Authorizer for SetAuthorizer {
    fn is_allowed(&self, candidate: &CandidateKey) -> bool {
        self.allowed.contains(candidate)
    }
}

/// Authorizer that denies every candidate.
///
/// Used when startup without an authorization source is explicitly
/// permitted: every record stays hidden, passthrough files stay readable.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAllAuthorizer;

impl Authorizer for DenyAllAuthorizer {
    fn is_allowed(&self, _candidate: &CandidateKey) -> bool {
        false
    }
}
