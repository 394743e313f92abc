//! The registry operations the storage layer is built on.

use crate::context::Context;
use crate::digest::Digest;
use crate::manifest::Descriptor;
use crate::options::RegistryOptions;

pub mod http;
#[cfg(test)]
pub(crate) mod memory;

/// Failures reported by a [`RegistryClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The registry refused the request. `body` holds its error text, either
    /// the raw response or `CODE: message` lines from an `errors` document.
    #[error("Registry refused {url}: {body}")]
    Status {
        url:    String,
        status: Option<u16>,
        body:   String,
    },
    #[error("Request to {url} failed: {source}")]
    Transport {
        url:    String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Unexpected response from {url}: {reason}")]
    InvalidResponse { url: String, reason: String },
    #[error("Authentication against {registry} failed: {reason}")]
    Auth { registry: String, reason: String },
    #[error("Request was cancelled.")]
    Cancelled,
}

/// A manifest as returned by the registry, not yet interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawManifest {
    pub media_type: String,
    pub digest:     Digest,
    pub body:       Vec<u8>,
}

/// Registry operations for one endpoint. All calls honour the cancellation
/// context and return as soon as it fires.
pub trait RegistryClient {
    /// Repository names known to the registry.
    fn catalog(&self, ctx: &Context) -> Result<Vec<String>, ClientError>;

    fn tags(&self, ctx: &Context, repository: &str) -> Result<Vec<String>, ClientError>;

    /// Looks up the digest of the manifest a tag points to.
    fn resolve_tag(&self, ctx: &Context, repository: &str, tag: &str) -> Result<Digest, ClientError>;

    fn get_manifest(&self, ctx: &Context, repository: &str, digest: &Digest) -> Result<RawManifest, ClientError>;

    /// Stores a manifest under `tag` and returns its digest.
    fn put_manifest(&self, ctx: &Context, repository: &str, tag: &str, media_type: &str, body: &[u8]) -> Result<Digest, ClientError>;

    fn get_blob(&self, ctx: &Context, repository: &str, digest: &Digest) -> Result<Vec<u8>, ClientError>;

    /// Uploads a blob and returns the descriptor it is stored under.
    fn put_blob(&self, ctx: &Context, repository: &str, media_type: &str, data: &[u8]) -> Result<Descriptor, ClientError>;
}

/// Opens a [`RegistryClient`] for an endpoint such as `https://ghcr.io`.
pub trait Connect {
    type Client: RegistryClient;

    /// # Errors
    ///
    /// Fails if the endpoint cannot be turned into a client.
    fn connect(&self, endpoint: &str, opts: &RegistryOptions) -> Result<Self::Client, ClientError>;
}

/// Connects over HTTP with [`http::HttpRegistry`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpConnector;

impl Connect for HttpConnector {
    type Client = http::HttpRegistry;

    fn connect(&self, endpoint: &str, opts: &RegistryOptions) -> Result<Self::Client, ClientError> {
        http::HttpRegistry::new(endpoint, opts)
    }
}
