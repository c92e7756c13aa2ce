use std::path::PathBuf;

use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("opening store at {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("creating store directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store schema version {found} is newer than supported version {supported}")]
    UnsupportedSchemaVersion { found: u32, supported: u32 },
    #[error("invalid schema version {0}")]
    InvalidSchemaVersion(u32),
    #[error("{op} failed: {source}")]
    Write {
        op: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    #[error("{op} failed: {source}")]
    Read {
        op: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    #[error("snippet with id {id} not found")]
    NotFound { id: String },
}

/// Outcome of a read that never fails outward.
///
/// A failed read still yields the empty value, but the failure is kept so
/// callers (and tests) can tell "nothing stored" from "could not read".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Loaded<T> {
    Fresh(T),
    Degraded { value: T, reason: String },
}

impl<T> Loaded<T> {
    pub fn into_inner(self) -> T {
        match self {
            Loaded::Fresh(value) | Loaded::Degraded { value, .. } => value,
        }
    }

    pub fn value(&self) -> &T {
        match self {
            Loaded::Fresh(value) | Loaded::Degraded { value, .. } => value,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Loaded::Degraded { .. })
    }
}

impl<T: Default> Loaded<T> {
    pub(crate) fn or_empty(op: &'static str, result: Result<T, StoreError>) -> Self {
        match result {
            Ok(value) => Loaded::Fresh(value),
            Err(err) => {
                warn!(op, error = %err, "read failed; using empty result");
                Loaded::Degraded {
                    value: T::default(),
                    reason: err.to_string(),
                }
            }
        }
    }
}
