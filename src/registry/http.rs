//! [`RegistryClient`] over `oci_distribution`.
//!
//! The distribution client is async. Each call runs on a private current
//! thread runtime and is raced against the caller's [`Context`], so a
//! cancel drops the request even while it waits on the network. Do not call
//! into this type from inside another tokio runtime.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::{OciDistributionError, OciEnvelope};
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use serde::Deserialize;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tracing::debug;
use ureq::Agent;
use ureq::tls::TlsConfig;

use crate::context::Context;
use crate::digest::{Digest, DigestError};
use crate::manifest::{Descriptor, MANIFEST_ACCEPT, MEDIA_TYPE_OCI_MANIFEST, ManifestHead};
use crate::options::RegistryOptions;
use crate::registry::{ClientError, RawManifest, RegistryClient};

/// The catalog is read in one request of this size.
const CATALOG_PAGE_SIZE: &str = "10000";
const CATALOG_TIMEOUT: Duration = Duration::from_secs(60);
/// Tag used for references that only address a repository.
const REPOSITORY_TAG: &str = "latest";

#[derive(Debug, Deserialize)]
struct Catalog {
    #[serde(default)]
    repositories: Vec<String>,
}

/// A registry endpoint reached over HTTP(S).
pub struct HttpRegistry {
    client:     Client,
    auth:       RegistryAuth,
    runtime:    Runtime,
    endpoint:   String,
    registry:   String,
    /// Only used for the catalog, which `oci_distribution` does not cover.
    agent:      Agent,
    basic:      Option<String>,
    /// Repositories a token was requested for, as `push:<repo>`/`pull:<repo>`.
    authorized: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for HttpRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRegistry")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl HttpRegistry {
    /// `endpoint` may omit the scheme, `https://` is assumed then. A
    /// `http://` endpoint talks plain HTTP.
    ///
    /// # Errors
    ///
    /// Fails for endpoints with another scheme or with a path, and when the
    /// runtime cannot be started.
    pub fn new(endpoint: &str, opts: &RegistryOptions) -> Result<Self, ClientError> {
        let endpoint = endpoint.trim().trim_end_matches('/');
        let (plain_http, registry) = if let Some(host) = endpoint.strip_prefix("http://") {
            (true, host)
        } else if let Some(host) = endpoint.strip_prefix("https://") {
            (false, host)
        } else if endpoint.contains("://") {
            return Err(invalid_endpoint(endpoint, "unsupported scheme"));
        } else {
            (false, endpoint)
        };
        if registry.is_empty() || registry.contains('/') {
            return Err(invalid_endpoint(endpoint, "expected a registry host"));
        }
        let scheme = if plain_http { "http" } else { "https" };
        let endpoint = format!("{scheme}://{registry}");

        let client = Client::new(ClientConfig {
            protocol: if plain_http { ClientProtocol::Http } else { ClientProtocol::Https },
            accept_invalid_certificates: opts.insecure,
            ..Default::default()
        });
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ClientError::Transport {
                url:    endpoint.clone(),
                source: Box::new(e),
            })?;
        let agent = Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(CATALOG_TIMEOUT))
            .tls_config(TlsConfig::builder().disable_verification(opts.insecure).build())
            .build()
            .into();
        let (auth, basic) = if opts.has_credentials() {
            let basic = format!("Basic {}", STANDARD.encode(format!("{}:{}", opts.username, opts.password)));
            (RegistryAuth::Basic(opts.username.clone(), opts.password.clone()), Some(basic))
        } else {
            (RegistryAuth::Anonymous, None)
        };
        debug!("Connecting to {endpoint} (insecure: {}, credentials: {})", opts.insecure, basic.is_some());

        Ok(Self {
            client,
            auth,
            runtime,
            endpoint,
            registry: registry.to_owned(),
            agent,
            basic,
            authorized: Mutex::default(),
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Drives `call` to completion unless the context fires first.
    fn run<T>(&self, ctx: &Context, call: impl Future<Output = Result<T, ClientError>>) -> Result<T, ClientError> {
        if ctx.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        self.runtime.block_on(async {
            tokio::select! {
                () = ctx.cancelled() => Err(ClientError::Cancelled),
                result = call => result,
            }
        })
    }

    fn reference(&self, repository: &str, tag: &str) -> Reference {
        Reference::with_tag(self.registry.clone(), repository.to_owned(), tag.to_owned())
    }

    fn digest_reference(&self, repository: &str, digest: &Digest) -> Reference {
        Reference::with_digest(self.registry.clone(), repository.to_owned(), digest.to_string())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v2/{path}", self.endpoint)
    }

    /// Requests a token for `operation` once per repository. Pull and push
    /// calls without an `auth` argument rely on it.
    async fn authorize(&self, reference: &Reference, push: bool) -> Result<(), ClientError> {
        let key = format!("{}:{}", if push { "push" } else { "pull" }, reference.repository());
        if self.authorized.lock().unwrap_or_else(PoisonError::into_inner).contains(&key) {
            return Ok(());
        }
        let operation = if push { RegistryOperation::Push } else { RegistryOperation::Pull };
        self.client
            .auth(reference, &self.auth, operation)
            .await
            .map_err(|e| self.client_error(e, self.url("")))?;
        self.authorized.lock().unwrap_or_else(PoisonError::into_inner).insert(key);
        Ok(())
    }

    async fn pull_manifest(&self, reference: &Reference, url: &str) -> Result<(Vec<u8>, String), ClientError> {
        self.client
            .pull_manifest_raw(reference, &self.auth, MANIFEST_ACCEPT)
            .await
            .map_err(|e| self.client_error(e, url))
    }

    fn client_error(&self, error: OciDistributionError, url: impl Into<String>) -> ClientError {
        match error {
            OciDistributionError::ServerError { code, url, message } => ClientError::Status {
                url,
                status: Some(code),
                body: message,
            },
            OciDistributionError::RegistryError { envelope, url } => ClientError::Status {
                url,
                status: None,
                body: envelope_text(&envelope),
            },
            OciDistributionError::UnauthorizedError { url } => ClientError::Status {
                url,
                status: Some(401),
                body: "UNAUTHORIZED".to_owned(),
            },
            OciDistributionError::AuthenticationFailure(reason) => ClientError::Auth {
                registry: self.registry.clone(),
                reason,
            },
            error => ClientError::Transport {
                url:    url.into(),
                source: Box::new(error),
            },
        }
    }
}

impl RegistryClient for HttpRegistry {
    fn catalog(&self, ctx: &Context) -> Result<Vec<String>, ClientError> {
        let url = self.url("_catalog");
        let (agent, authorization, request_url) = (self.agent.clone(), self.basic.clone(), url.clone());
        self.run(ctx, async move {
            // ureq blocks, so the request runs on its own thread and a cancel
            // only stops waiting for it.
            let (sender, receiver) = oneshot::channel();
            std::thread::spawn(move || {
                let _ = sender.send(read_catalog(&agent, &request_url, authorization.as_deref()));
            });
            receiver.await.map_err(|e| ClientError::Transport {
                url,
                source: Box::new(e),
            })?
        })
    }

    fn tags(&self, ctx: &Context, repository: &str) -> Result<Vec<String>, ClientError> {
        let reference = self.reference(repository, REPOSITORY_TAG);
        let url = self.url(&format!("{repository}/tags/list"));
        self.run(ctx, async {
            let response = self
                .client
                .list_tags(&reference, &self.auth, None, None)
                .await
                .map_err(|e| self.client_error(e, &url))?;
            Ok(response.tags)
        })
    }

    fn resolve_tag(&self, ctx: &Context, repository: &str, tag: &str) -> Result<Digest, ClientError> {
        let reference = self.reference(repository, tag);
        let url = self.url(&format!("{repository}/manifests/{tag}"));
        // A GET with the full accept list, a HEAD would not announce the
        // configuration manifest type.
        let (_, digest) = self.run(ctx, self.pull_manifest(&reference, &url))?;
        digest.parse().map_err(|e: DigestError| ClientError::InvalidResponse {
            url,
            reason: e.to_string(),
        })
    }

    fn get_manifest(&self, ctx: &Context, repository: &str, digest: &Digest) -> Result<RawManifest, ClientError> {
        let reference = self.digest_reference(repository, digest);
        let url = self.url(&format!("{repository}/manifests/{digest}"));
        let (body, _) = self.run(ctx, self.pull_manifest(&reference, &url))?;
        if !digest.matches(&body) {
            return Err(ClientError::InvalidResponse {
                url,
                reason: "manifest content does not match its digest".to_owned(),
            });
        }
        let media_type = serde_json::from_slice::<ManifestHead>(&body)
            .ok()
            .and_then(|head| head.media_type)
            .unwrap_or_else(|| MEDIA_TYPE_OCI_MANIFEST.to_owned());
        Ok(RawManifest {
            media_type,
            digest: digest.clone(),
            body,
        })
    }

    fn put_manifest(&self, ctx: &Context, repository: &str, tag: &str, media_type: &str, body: &[u8]) -> Result<Digest, ClientError> {
        let reference = self.reference(repository, tag);
        let url = self.url(&format!("{repository}/manifests/{tag}"));
        let content_type = media_type.parse().map_err(|_| ClientError::InvalidResponse {
            url:    url.clone(),
            reason: format!("`{media_type}` is not a valid content type"),
        })?;
        self.run(ctx, async {
            self.authorize(&reference, true).await?;
            self.client
                .push_manifest_raw(&reference, body.to_vec(), content_type)
                .await
                .map_err(|e| self.client_error(e, &url))
        })?;
        Ok(Digest::sha256(body))
    }

    fn get_blob(&self, ctx: &Context, repository: &str, digest: &Digest) -> Result<Vec<u8>, ClientError> {
        let reference = self.reference(repository, REPOSITORY_TAG);
        let url = self.url(&format!("{repository}/blobs/{digest}"));
        let descriptor = OciDescriptor {
            digest: digest.to_string(),
            ..Default::default()
        };
        let data = self.run(ctx, async {
            self.authorize(&reference, false).await?;
            let mut data = Vec::new();
            self.client
                .pull_blob(&reference, &descriptor, &mut data)
                .await
                .map_err(|e| self.client_error(e, &url))?;
            Ok(data)
        })?;
        if !digest.matches(&data) {
            return Err(ClientError::InvalidResponse {
                url,
                reason: "blob content does not match its digest".to_owned(),
            });
        }
        Ok(data)
    }

    fn put_blob(&self, ctx: &Context, repository: &str, media_type: &str, data: &[u8]) -> Result<Descriptor, ClientError> {
        let reference = self.reference(repository, REPOSITORY_TAG);
        let descriptor = Descriptor {
            media_type: media_type.to_owned(),
            size:       data.len() as u64,
            digest:     Digest::sha256(data),
        };
        let url = self.url(&format!("{repository}/blobs/uploads/"));
        self.run(ctx, async {
            self.authorize(&reference, true).await?;
            self.client
                .push_blob(&reference, data, descriptor.digest.as_str())
                .await
                .map_err(|e| self.client_error(e, &url))
        })?;
        debug!("Uploaded blob {} ({} bytes) to {repository}", descriptor.digest, descriptor.size);
        Ok(descriptor)
    }
}

fn invalid_endpoint(endpoint: &str, reason: &str) -> ClientError {
    ClientError::InvalidResponse {
        url:    endpoint.to_owned(),
        reason: reason.to_owned(),
    }
}

fn read_catalog(agent: &Agent, url: &str, authorization: Option<&str>) -> Result<Vec<String>, ClientError> {
    let request = agent.get(url).query("n", CATALOG_PAGE_SIZE);
    let request = match authorization {
        Some(value) => request.header("Authorization", value),
        None => request,
    };
    let mut response = request.call().map_err(|e| ClientError::Transport {
        url:    url.to_owned(),
        source: Box::new(e),
    })?;
    if !response.status().is_success() {
        return Err(ClientError::Status {
            url:    url.to_owned(),
            status: Some(response.status().as_u16()),
            body:   response.body_mut().read_to_string().unwrap_or_default(),
        });
    }
    let catalog: Catalog = response.body_mut().read_json().map_err(|e| ClientError::InvalidResponse {
        url:    url.to_owned(),
        reason: e.to_string(),
    })?;
    Ok(catalog.repositories)
}

/// `CODE: message` per entry of a registry `errors` document.
fn envelope_text(envelope: &OciEnvelope) -> String {
    envelope
        .errors
        .iter()
        .map(|error| format!("{}: {}", error_code_name(&error.code), error.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// The wire spelling of an error code, e.g. `ManifestInvalid` becomes
/// `MANIFEST_INVALID`.
fn error_code_name(code: &impl std::fmt::Debug) -> String {
    let mut name = String::new();
    for (index, c) in format!("{code:?}").chars().enumerate() {
        if c.is_ascii_uppercase() && index > 0 {
            name.push('_');
        }
        name.push(c.to_ascii_uppercase());
    }
    name
}
