use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// Manifest type that carries the payload map inline.
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.regstash.config.v1+json";
pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_IMAGE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const MEDIA_TYPE_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Everything a manifest read is prepared to receive.
pub const MANIFEST_ACCEPT: &[&str] = &[MEDIA_TYPE_CONFIG, MEDIA_TYPE_MANIFEST, MEDIA_TYPE_OCI_MANIFEST];

const SCHEMA_VERSION: u32 = 2;
const SYNTHETIC_PLATFORM: &str = "config";
const SYNTHETIC_HISTORY: &str = "COPY configfile /";

/// The preferred envelope: the payload map serialised to a JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigManifest {
    pub schema_version: u32,
    pub media_type:     String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub payload:        String,
}

impl ConfigManifest {
    #[must_use]
    pub fn new(payload: String) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            media_type: MEDIA_TYPE_CONFIG.to_owned(),
            payload,
        }
    }
}

/// Only used to read `mediaType` before committing to a manifest shape.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ManifestHead {
    #[serde(default)]
    pub media_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub size:       u64,
    pub digest:     Digest,
}

/// Schema 2 image manifest, as used by the image fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type:     Option<String>,
    pub config:         Descriptor,
    #[serde(default)]
    pub layers:         Vec<Descriptor>,
}

impl ImageManifest {
    #[must_use]
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            media_type: Some(MEDIA_TYPE_MANIFEST.to_owned()),
            config,
            layers,
        }
    }

    /// The config descriptor followed by the layers.
    #[must_use]
    pub fn references(&self) -> Vec<&Descriptor> {
        std::iter::once(&self.config).chain(&self.layers).collect()
    }
}

/// The placeholder image config stored next to the payload layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub created:      String,
    pub architecture: String,
    pub os:           String,
    pub config:       ContainerConfig,
    pub rootfs:       RootFs,
    pub history:      Vec<History>,
}

impl ImageConfig {
    /// `diff_id` is the digest of the uncompressed layer, which is not the
    /// digest the compressed blob is stored under.
    #[must_use]
    pub fn synthetic(diff_id: Digest, labels: BTreeMap<String, String>, created: String) -> Self {
        Self {
            created,
            architecture: SYNTHETIC_PLATFORM.to_owned(),
            os: SYNTHETIC_PLATFORM.to_owned(),
            config: ContainerConfig { labels },
            rootfs: RootFs {
                kind:     "layers".to_owned(),
                diff_ids: vec![diff_id],
            },
            history: vec![History {
                created_by: SYNTHETIC_HISTORY.to_owned(),
            }],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Labels", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind:     String,
    pub diff_ids: Vec<Digest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    pub created_by: String,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::digest::Digest;
    use crate::manifest::{ConfigManifest, Descriptor, ImageConfig, ImageManifest, MEDIA_TYPE_CONFIG, MEDIA_TYPE_LAYER};

    #[test]
    fn config_manifest_wire_shape() {
        let manifest = ConfigManifest::new(r#"{"config":"hello"}"#.to_owned());
        let value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(
            value,
            json!({
                "schemaVersion": 2,
                "mediaType": MEDIA_TYPE_CONFIG,
                "payload": "{\"config\":\"hello\"}",
            })
        );
    }

    #[test]
    fn image_manifest_references_config_first() {
        let config = Descriptor {
            media_type: "c".to_owned(),
            size:       1,
            digest:     Digest::sha256(b"c"),
        };
        let layer = Descriptor {
            media_type: MEDIA_TYPE_LAYER.to_owned(),
            size:       2,
            digest:     Digest::sha256(b"l"),
        };
        let manifest = ImageManifest::new(config.clone(), vec![layer.clone()]);
        assert_eq!(manifest.references(), vec![&config, &layer]);

        let parsed: ImageManifest = serde_json::from_slice(&serde_json::to_vec(&manifest).unwrap()).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn synthetic_config_wire_shape() {
        let diff_id = Digest::sha256(b"tar");
        let labels = BTreeMap::from([("owner".to_owned(), "ops".to_owned())]);
        let config = ImageConfig::synthetic(diff_id.clone(), labels, "2024-01-01T00:00:00Z".to_owned());
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["architecture"], "config");
        assert_eq!(value["os"], "config");
        assert_eq!(value["config"]["Labels"]["owner"], "ops");
        assert_eq!(value["rootfs"], json!({"type": "layers", "diff_ids": [diff_id.as_str()]}));
        assert_eq!(value["history"], json!([{"created_by": "COPY configfile /"}]));

        let unlabelled = ImageConfig::synthetic(diff_id, BTreeMap::new(), String::new());
        assert_eq!(serde_json::to_value(&unlabelled).unwrap()["config"], json!({}));
    }
}
