//! Chooses the manifest format a payload is stored in.
//!
//! Pushes try the configuration manifest first and fall back to a two layer
//! image manifest once if the registry does not recognise it. Pulls branch on
//! the media type that was actually stored.

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use tracing::{debug, info};

use crate::codec::{self, Payload};
use crate::context::Context;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::manifest::{
    ConfigManifest, ImageConfig, ImageManifest, MEDIA_TYPE_CONFIG, MEDIA_TYPE_IMAGE_CONFIG, MEDIA_TYPE_LAYER, MEDIA_TYPE_MANIFEST,
};
use crate::reference::ParsedReference;
use crate::registry::{ClientError, RegistryClient};

/// Image config labels, only written by the image manifest fallback.
pub type Labels = BTreeMap<String, String>;

/// Result of pushing the configuration manifest.
#[derive(Debug)]
pub enum PushOutcome {
    Pushed(Digest),
    /// The registry does not know the manifest type. Holds its message.
    RetryWithLegacy(String),
    Fatal(Error),
}

/// Sorts a failed manifest push into a retryable format rejection or a
/// fatal error. Registries only report the rejection in the error text, so
/// this is the one place that inspects it.
#[must_use]
pub fn classify_rejection(error: ClientError) -> PushOutcome {
    match error {
        ClientError::Status { body, .. } if is_format_rejection(&body) => PushOutcome::RetryWithLegacy(body),
        error => PushOutcome::Fatal(Error::registry("pushing the configuration manifest", error)),
    }
}

/// Matches `manifest invalid` and `manifest unknown` in any casing, and the
/// `MANIFEST_INVALID` / `MANIFEST_UNKNOWN` error codes.
fn is_format_rejection(text: &str) -> bool {
    let text = text.to_ascii_lowercase().replace('_', " ");
    text.contains("manifest invalid") || text.contains("manifest unknown")
}

/// Stores `payload` under the reference's tag and returns the manifest
/// digest.
///
/// # Errors
///
/// Any failure other than the first format rejection. A rejected fallback
/// manifest is reported as [`Error::ManifestRejected`].
pub fn push<C>(client: &C, ctx: &Context, reference: &ParsedReference, payload: &Payload, labels: &Labels) -> Result<Digest>
where
    C: RegistryClient + ?Sized,
{
    match push_config_manifest(client, ctx, reference, payload) {
        PushOutcome::Pushed(digest) => {
            if !labels.is_empty() {
                debug!("Labels are not stored with configuration manifests");
            }
            Ok(digest)
        }
        PushOutcome::RetryWithLegacy(reason) => {
            info!("{} does not accept configuration manifests, pushing an image instead", reference.domain());
            debug!("Rejection: {reason}");
            push_image_manifest(client, ctx, reference, payload, labels)
        }
        PushOutcome::Fatal(error) => Err(error),
    }
}

fn push_config_manifest<C>(client: &C, ctx: &Context, reference: &ParsedReference, payload: &Payload) -> PushOutcome
where
    C: RegistryClient + ?Sized,
{
    let body = serde_json::to_string(payload)
        .map(ConfigManifest::new)
        .and_then(|manifest| serde_json::to_vec(&manifest));
    let body = match body {
        Ok(body) => body,
        Err(source) => {
            return PushOutcome::Fatal(Error::Json {
                what: "configuration manifest",
                source,
            });
        }
    };
    debug!("Pushing configuration manifest to {reference}");
    match client.put_manifest(ctx, reference.path(), reference.tag(), MEDIA_TYPE_CONFIG, &body) {
        Ok(digest) => PushOutcome::Pushed(digest),
        Err(error) => classify_rejection(error),
    }
}

/// Uploads the payload layer, then the image config, then the manifest.
/// Blobs uploaded before a failure stay in the registry.
fn push_image_manifest<C>(client: &C, ctx: &Context, reference: &ParsedReference, payload: &Payload, labels: &Labels) -> Result<Digest>
where
    C: RegistryClient + ?Sized,
{
    let repository = reference.path();
    let encoded = codec::encode(payload).map_err(Error::PayloadEncoding)?;

    let layer = client
        .put_blob(ctx, repository, MEDIA_TYPE_LAYER, &encoded.compressed)
        .map_err(|e| Error::blob("uploading the payload layer", e))?;

    let created = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let image_config = ImageConfig::synthetic(encoded.diff_id, labels.clone(), created);
    let image_config = serde_json::to_vec(&image_config).map_err(|source| Error::Json {
        what: "image config",
        source,
    })?;
    let config = client
        .put_blob(ctx, repository, MEDIA_TYPE_IMAGE_CONFIG, &image_config)
        .map_err(|e| Error::blob("uploading the image config", e))?;

    let manifest = serde_json::to_vec(&ImageManifest::new(config, vec![layer])).map_err(|source| Error::Json {
        what: "image manifest",
        source,
    })?;
    debug!("Pushing image manifest to {reference}");
    client
        .put_manifest(ctx, repository, reference.tag(), MEDIA_TYPE_MANIFEST, &manifest)
        .map_err(|error| match error {
            ClientError::Status { body, .. } if is_format_rejection(&body) => Error::ManifestRejected(body),
            error => Error::registry("pushing the image manifest", error),
        })
}

/// Reads the payload stored under the reference's tag, in either format.
///
/// # Errors
///
/// Registry failures, an image manifest without exactly two references, or
/// a payload that cannot be decoded.
pub fn pull<C>(client: &C, ctx: &Context, reference: &ParsedReference) -> Result<Payload>
where
    C: RegistryClient + ?Sized,
{
    let repository = reference.path();
    let digest = client
        .resolve_tag(ctx, repository, reference.tag())
        .map_err(|e| Error::registry("resolving the tag", e))?;
    let manifest = client
        .get_manifest(ctx, repository, &digest)
        .map_err(|e| Error::registry("fetching the manifest", e))?;

    if manifest.media_type == MEDIA_TYPE_CONFIG {
        debug!("{reference} holds a configuration manifest");
        let envelope: ConfigManifest = serde_json::from_slice(&manifest.body).map_err(|source| Error::Json {
            what: "configuration manifest",
            source,
        })?;
        return serde_json::from_str(&envelope.payload).map_err(|source| Error::Json {
            what: "configuration payload",
            source,
        });
    }

    debug!("{reference} holds a {} manifest, reading it as an image", manifest.media_type);
    let image: ImageManifest = serde_json::from_slice(&manifest.body).map_err(|source| Error::Json {
        what: "image manifest",
        source,
    })?;
    let references = image.references();
    let [_, layer] = references.as_slice() else {
        return Err(Error::UnexpectedManifestShape { found: references.len() });
    };
    let compressed = client
        .get_blob(ctx, repository, &layer.digest)
        .map_err(|e| Error::blob("downloading the payload layer", e))?;
    codec::decode_gzip(&compressed).map_err(Error::ArchiveFormat)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use std::io::Read;

    use flate2::read::GzDecoder;
    use pretty_assertions::assert_eq;

    use crate::codec::Payload;
    use crate::context::Context;
    use crate::digest::Digest;
    use crate::error::Error;
    use crate::manifest::{
        ConfigManifest, Descriptor, ImageConfig, ImageManifest, MEDIA_TYPE_CONFIG, MEDIA_TYPE_IMAGE_CONFIG, MEDIA_TYPE_LAYER,
        MEDIA_TYPE_MANIFEST,
    };
    use crate::negotiator::{Labels, PushOutcome, classify_rejection, pull, push};
    use crate::reference::ParsedReference;
    use crate::registry::memory::MemoryRegistry;
    use crate::registry::{ClientError, RawManifest, RegistryClient};

    fn reference() -> ParsedReference {
        ParsedReference::parse("localhost:5000/team/app:1.0").unwrap()
    }

    fn payload() -> Payload {
        Payload::from([
            ("metadata.yml".to_owned(), "name: app\nversion: 1.0\n".to_owned()),
            ("docker-compose.yml".to_owned(), "services:\n  web:\n    image: nginx\n".to_owned()),
            ("parameters.yml".to_owned(), "port: 80\n".to_owned()),
        ])
    }

    fn rejection(body: &str) -> ClientError {
        ClientError::Status {
            url:    "/v2/app/manifests/latest".to_owned(),
            status: Some(400),
            body:   body.to_owned(),
        }
    }

    fn stored_manifest(registry: &MemoryRegistry) -> RawManifest {
        let ctx = Context::new();
        let digest = registry.resolve_tag(&ctx, "team/app", "1.0").unwrap();
        registry.get_manifest(&ctx, "team/app", &digest).unwrap()
    }

    #[test]
    fn rejection_messages() {
        for body in [
            "manifest invalid",
            "manifest Unknown",
            "MANIFEST_UNKNOWN",
            r#"{"errors":[{"code":"MANIFEST_INVALID","message":"manifest invalid","detail":{}}]}"#,
        ] {
            assert!(
                matches!(classify_rejection(rejection(body)), PushOutcome::RetryWithLegacy(ref message) if message == body),
                "{body}"
            );
        }
        for body in ["unauthorized: authentication required", "blob unknown", "invalid manifest"] {
            assert!(matches!(
                classify_rejection(rejection(body)),
                PushOutcome::Fatal(Error::Registry { .. })
            ));
        }
        assert!(matches!(
            classify_rejection(ClientError::InvalidResponse {
                url:    String::new(),
                reason: "manifest invalid".to_owned(),
            }),
            PushOutcome::Fatal(_)
        ));
        assert!(matches!(classify_rejection(ClientError::Cancelled), PushOutcome::Fatal(Error::Cancelled)));
    }

    #[test]
    fn config_manifest_round_trip() {
        let registry = MemoryRegistry::default();
        let ctx = Context::new();
        let labels = Labels::from([("ignored".to_owned(), "yes".to_owned())]);

        let digest = push(&registry, &ctx, &reference(), &payload(), &labels).unwrap();
        assert_eq!(registry.calls(), vec![format!("put_manifest {MEDIA_TYPE_CONFIG}")]);

        let stored = stored_manifest(&registry);
        assert_eq!(stored.digest, digest);
        let envelope: ConfigManifest = serde_json::from_slice(&stored.body).unwrap();
        assert_eq!(envelope, ConfigManifest::new(serde_json::to_string(&payload()).unwrap()));

        assert_eq!(pull(&registry, &ctx, &reference()).unwrap(), payload());
        assert!(registry.state().blobs.is_empty());
    }

    #[test]
    fn falls_back_to_image_manifest_once() {
        let registry = MemoryRegistry::rejecting_custom_manifests(r#"{"errors":[{"code":"MANIFEST_INVALID","message":"manifest invalid"}]}"#);
        let ctx = Context::new();
        let labels = Labels::from([("com.example.owner".to_owned(), "ops".to_owned())]);

        let digest = push(&registry, &ctx, &reference(), &payload(), &labels).unwrap();
        assert_eq!(
            registry.calls(),
            vec![
                format!("put_manifest {MEDIA_TYPE_CONFIG}"),
                format!("put_blob {MEDIA_TYPE_LAYER}"),
                format!("put_blob {MEDIA_TYPE_IMAGE_CONFIG}"),
                format!("put_manifest {MEDIA_TYPE_MANIFEST}"),
            ]
        );

        let stored = stored_manifest(&registry);
        assert_eq!(stored.digest, digest);
        assert_eq!(stored.media_type, MEDIA_TYPE_MANIFEST);
        let image: ImageManifest = serde_json::from_slice(&stored.body).unwrap();
        assert_eq!(image.references().len(), 2);
        assert_eq!(image.config.media_type, MEDIA_TYPE_IMAGE_CONFIG);
        assert_eq!(image.layers[0].media_type, MEDIA_TYPE_LAYER);

        assert_eq!(pull(&registry, &ctx, &reference()).unwrap(), payload());
    }

    #[test]
    fn image_config_declares_uncompressed_digest() {
        let registry = MemoryRegistry::rejecting_custom_manifests("manifest invalid");
        let ctx = Context::new();
        let labels = Labels::from([("owner".to_owned(), "ops".to_owned())]);
        push(&registry, &ctx, &reference(), &payload(), &labels).unwrap();

        let image: ImageManifest = serde_json::from_slice(&stored_manifest(&registry).body).unwrap();
        let layer_blob = registry.get_blob(&ctx, "team/app", &image.layers[0].digest).unwrap();
        let config_blob = registry.get_blob(&ctx, "team/app", &image.config.digest).unwrap();
        let config: ImageConfig = serde_json::from_slice(&config_blob).unwrap();

        let mut tar_bytes = Vec::new();
        GzDecoder::new(layer_blob.as_slice()).read_to_end(&mut tar_bytes).unwrap();
        assert_eq!(config.rootfs.diff_ids, vec![Digest::sha256(&tar_bytes)]);
        assert_ne!(config.rootfs.diff_ids[0], image.layers[0].digest);
        assert_eq!(config.config.labels, labels);
        assert_eq!(config.architecture, "config");
        assert_eq!(config.history.len(), 1);
    }

    #[test]
    fn fatal_push_errors_do_not_fall_back() {
        let registry = MemoryRegistry::default();
        registry.state().deny_push = Some("UNAUTHORIZED: authentication required".to_owned());
        let result = push(&registry, &Context::new(), &reference(), &payload(), &Labels::new());
        assert!(matches!(
            result,
            Err(Error::Registry {
                source: ClientError::Status { status: Some(401), .. },
                ..
            })
        ));
        assert_eq!(registry.calls(), vec![format!("put_manifest {MEDIA_TYPE_CONFIG}")]);

        let registry = MemoryRegistry::rejecting_custom_manifests("denied: quota exceeded");
        assert!(push(&registry, &Context::new(), &reference(), &payload(), &Labels::new()).is_err());
        assert_eq!(registry.calls().len(), 1);
    }

    #[test]
    fn rejected_fallback_surfaces_manifest_rejected() {
        let registry = MemoryRegistry::rejecting_custom_manifests("manifest invalid");
        registry.state().reject_image = Some("MANIFEST_INVALID".to_owned());
        let result = push(&registry, &Context::new(), &reference(), &payload(), &Labels::new());
        assert!(matches!(result, Err(Error::ManifestRejected(ref message)) if message == "MANIFEST_INVALID"));
        // Blobs uploaded before the failure are left behind.
        assert_eq!(registry.state().blobs.len(), 2);
    }

    #[test]
    fn unpackable_keys_fail_before_any_upload() {
        let registry = MemoryRegistry::rejecting_custom_manifests("manifest invalid");
        let payload = Payload::from([("../escape".to_owned(), "x".to_owned())]);
        let result = push(&registry, &Context::new(), &reference(), &payload, &Labels::new());
        assert!(
            matches!(result, Err(Error::PayloadEncoding(ref e)) if e.kind() == std::io::ErrorKind::InvalidInput),
            "{result:?}"
        );
        assert_eq!(registry.calls(), vec![format!("put_manifest {MEDIA_TYPE_CONFIG}")]);
        assert!(registry.state().blobs.is_empty());

        // The custom manifest stores the key as text, so the same payload
        // pushes fine where that manifest is accepted.
        assert!(push(&MemoryRegistry::default(), &Context::new(), &reference(), &payload, &Labels::new()).is_ok());
    }

    #[test]
    fn unexpected_reference_count_fetches_no_blob() {
        let registry = MemoryRegistry::default();
        let descriptor = |content: &[u8]| Descriptor {
            media_type: MEDIA_TYPE_LAYER.to_owned(),
            size:       content.len() as u64,
            digest:     Digest::sha256(content),
        };
        let image = ImageManifest::new(descriptor(b"config"), vec![descriptor(b"one"), descriptor(b"two")]);
        let body = serde_json::to_vec(&image).unwrap();
        registry.insert_manifest("team/app", "1.0", MEDIA_TYPE_MANIFEST, &body);

        let result = pull(&registry, &Context::new(), &reference());
        assert!(matches!(result, Err(Error::UnexpectedManifestShape { found: 3 })));
        assert!(registry.calls().iter().all(|call| !call.starts_with("get_blob")));

        let image = ImageManifest::new(descriptor(b"config"), Vec::new());
        registry.insert_manifest("team/app", "1.0", MEDIA_TYPE_MANIFEST, &serde_json::to_vec(&image).unwrap());
        assert!(matches!(
            pull(&registry, &Context::new(), &reference()),
            Err(Error::UnexpectedManifestShape { found: 1 })
        ));
    }

    #[test]
    fn corrupt_layer_is_an_archive_error() {
        let registry = MemoryRegistry::rejecting_custom_manifests("manifest invalid");
        let ctx = Context::new();
        push(&registry, &ctx, &reference(), &payload(), &Labels::new()).unwrap();
        let image: ImageManifest = serde_json::from_slice(&stored_manifest(&registry).body).unwrap();
        registry.state().blobs.insert(image.layers[0].digest.clone(), b"not gzip".to_vec());

        assert!(matches!(pull(&registry, &ctx, &reference()), Err(Error::ArchiveFormat(_))));
    }

    #[test]
    fn missing_tag_is_a_registry_error() {
        let registry = MemoryRegistry::default();
        assert!(matches!(
            pull(&registry, &Context::new(), &reference()),
            Err(Error::Registry {
                source: ClientError::Status { status: Some(404), .. },
                ..
            })
        ));
    }

    #[test]
    fn cancelled_context_stops_before_any_call() {
        let registry = MemoryRegistry::rejecting_custom_manifests("manifest invalid");
        let ctx = Context::new();
        ctx.cancel();
        assert!(matches!(
            push(&registry, &ctx, &reference(), &payload(), &Labels::new()),
            Err(Error::Cancelled)
        ));
        assert!(matches!(pull(&registry, &ctx, &reference()), Err(Error::Cancelled)));
        assert!(registry.calls().is_empty());
    }
}
