use crate::registry::ClientError;

/// Errors surfaced by the storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid reference format `{reference}`: {reason}.")]
    ReferenceFormat { reference: String, reason: String },
    /// The registry refused the custom manifest type. Only seen by callers
    /// when the image manifest fallback could not run.
    #[error("Registry does not accept the configuration manifest: {0}")]
    ManifestRejected(String),
    #[error("Expected 2 references in image manifest, found {found}.")]
    UnexpectedManifestShape { found: usize },
    #[error("Blob transfer failed while {action}: {source}")]
    BlobTransfer {
        action: &'static str,
        #[source]
        source: ClientError,
    },
    /// The payload could not be packed into an image layer. Only the image
    /// manifest fallback packs payloads.
    #[error("Payload cannot be stored as an image layer: {0}")]
    PayloadEncoding(#[source] std::io::Error),
    #[error("Invalid payload archive: {0}")]
    ArchiveFormat(#[source] std::io::Error),
    #[error("Registry request failed while {action}: {source}")]
    Registry {
        action: &'static str,
        #[source]
        source: ClientError,
    },
    #[error("Could not handle JSON for {what}: {source}")]
    Json {
        what:   &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{action} `{path}` failed: {source}")]
    Io {
        action: &'static str,
        path:   String,
        #[source]
        source: std::io::Error,
    },
    #[error("Operation was cancelled.")]
    Cancelled,
}

impl Error {
    pub(crate) fn registry(action: &'static str, source: ClientError) -> Self {
        match source {
            ClientError::Cancelled => Self::Cancelled,
            source => Self::Registry { action, source },
        }
    }

    pub(crate) fn blob(action: &'static str, source: ClientError) -> Self {
        match source {
            ClientError::Cancelled => Self::Cancelled,
            source => Self::BlobTransfer { action, source },
        }
    }

    /// An I/O failure on `path`.
    #[must_use]
    pub fn io(action: &'static str, path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.display().to_string(),
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
