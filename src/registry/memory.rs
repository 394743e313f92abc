//! In-memory registry used by the storage and negotiation tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::context::Context;
use crate::digest::Digest;
use crate::manifest::{Descriptor, MEDIA_TYPE_CONFIG, MEDIA_TYPE_MANIFEST};
use crate::options::RegistryOptions;
use crate::registry::{ClientError, Connect, RawManifest, RegistryClient};

#[derive(Debug, Default)]
pub(crate) struct State {
    /// Every client call, e.g. `put_manifest application/...`.
    pub calls:         Vec<String>,
    pub manifests:     HashMap<Digest, RawManifest>,
    pub tags:          BTreeMap<String, BTreeMap<String, Digest>>,
    pub blobs:         HashMap<Digest, Vec<u8>>,
    /// Body returned with a 400 when the custom manifest type is pushed.
    pub reject_custom: Option<String>,
    /// Body returned with a 400 when an image manifest is pushed.
    pub reject_image:  Option<String>,
    /// Body returned with a 401 for every manifest push.
    pub deny_push:     Option<String>,
    /// Endpoint and options of every `connect`.
    pub connections:   Vec<(String, RegistryOptions)>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryRegistry {
    state: Arc<Mutex<State>>,
}

impl MemoryRegistry {
    pub(crate) fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn rejecting_custom_manifests(message: &str) -> Self {
        let registry = Self::default();
        registry.state().reject_custom = Some(message.to_owned());
        registry
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    fn record(&self, call: String) {
        self.state().calls.push(call);
    }

    /// Stores a manifest directly, bypassing the call log.
    pub(crate) fn insert_manifest(&self, repository: &str, tag: &str, media_type: &str, body: &[u8]) -> Digest {
        let digest = Digest::sha256(body);
        let mut state = self.state();
        state.manifests.insert(
            digest.clone(),
            RawManifest {
                media_type: media_type.to_owned(),
                digest:     digest.clone(),
                body:       body.to_vec(),
            },
        );
        state
            .tags
            .entry(repository.to_owned())
            .or_default()
            .insert(tag.to_owned(), digest.clone());
        digest
    }
}

fn status(url: String, status: u16, body: &str) -> ClientError {
    ClientError::Status {
        url,
        status: Some(status),
        body: body.to_owned(),
    }
}

impl RegistryClient for MemoryRegistry {
    fn catalog(&self, ctx: &Context) -> Result<Vec<String>, ClientError> {
        if ctx.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        self.record("catalog".to_owned());
        Ok(self.state().tags.keys().cloned().collect())
    }

    fn tags(&self, ctx: &Context, repository: &str) -> Result<Vec<String>, ClientError> {
        if ctx.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        self.record(format!("tags {repository}"));
        self.state()
            .tags
            .get(repository)
            .map(|tags| tags.keys().cloned().collect())
            .ok_or_else(|| status(format!("/v2/{repository}/tags/list"), 404, "NAME_UNKNOWN"))
    }

    fn resolve_tag(&self, ctx: &Context, repository: &str, tag: &str) -> Result<Digest, ClientError> {
        if ctx.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        self.record(format!("resolve_tag {repository}:{tag}"));
        self.state()
            .tags
            .get(repository)
            .and_then(|tags| tags.get(tag))
            .cloned()
            .ok_or_else(|| status(format!("/v2/{repository}/manifests/{tag}"), 404, "MANIFEST_UNKNOWN"))
    }

    fn get_manifest(&self, ctx: &Context, repository: &str, digest: &Digest) -> Result<RawManifest, ClientError> {
        if ctx.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        self.record(format!("get_manifest {digest}"));
        self.state()
            .manifests
            .get(digest)
            .cloned()
            .ok_or_else(|| status(format!("/v2/{repository}/manifests/{digest}"), 404, "MANIFEST_UNKNOWN"))
    }

    fn put_manifest(&self, ctx: &Context, repository: &str, tag: &str, media_type: &str, body: &[u8]) -> Result<Digest, ClientError> {
        if ctx.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        self.record(format!("put_manifest {media_type}"));
        let url = format!("/v2/{repository}/manifests/{tag}");
        if let Some(message) = self.state().deny_push.clone() {
            return Err(status(url, 401, &message));
        }
        let rejection = match media_type {
            MEDIA_TYPE_CONFIG => self.state().reject_custom.clone(),
            MEDIA_TYPE_MANIFEST => self.state().reject_image.clone(),
            _ => None,
        };
        if let Some(message) = rejection {
            return Err(status(url, 400, &message));
        }
        Ok(self.insert_manifest(repository, tag, media_type, body))
    }

    fn get_blob(&self, ctx: &Context, repository: &str, digest: &Digest) -> Result<Vec<u8>, ClientError> {
        if ctx.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        self.record(format!("get_blob {digest}"));
        self.state()
            .blobs
            .get(digest)
            .cloned()
            .ok_or_else(|| status(format!("/v2/{repository}/blobs/{digest}"), 404, "BLOB_UNKNOWN"))
    }

    fn put_blob(&self, ctx: &Context, _repository: &str, media_type: &str, data: &[u8]) -> Result<Descriptor, ClientError> {
        if ctx.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        self.record(format!("put_blob {media_type}"));
        let digest = Digest::sha256(data);
        self.state().blobs.insert(digest.clone(), data.to_vec());
        Ok(Descriptor {
            media_type: media_type.to_owned(),
            size: data.len() as u64,
            digest,
        })
    }
}

/// Hands out clones sharing one [`MemoryRegistry`].
#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryConnector {
    pub registry: MemoryRegistry,
}

impl Connect for MemoryConnector {
    type Client = MemoryRegistry;

    fn connect(&self, endpoint: &str, opts: &RegistryOptions) -> Result<Self::Client, ClientError> {
        self.registry.state().connections.push((endpoint.to_owned(), opts.clone()));
        Ok(self.registry.clone())
    }
}
