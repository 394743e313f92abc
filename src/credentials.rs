//! Registry credentials from the docker client configuration.
//!
//! Reads `$DOCKER_CONFIG/config.json`, or `~/.docker/config.json`. Entries
//! can be stored inline under `auths` or delegated to a
//! `docker-credential-<helper>` program via `credsStore` and `credHelpers`.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use tracing::debug;

/// Key the default registry's credentials are stored under.
pub const DEFAULT_REGISTRY_KEY: &str = "https://index.docker.io/v1/";
const DEFAULT_REGISTRY_ENDPOINT: &str = "https://registry-1.docker.io";
const CONFIG_DIR_ENV: &str = "DOCKER_CONFIG";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("No docker configuration found at `{0}`.")]
    NoConfig(PathBuf),
    #[error("Could not read `{path}`: {source}")]
    Read {
        path:   PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Could not parse `{path}`: {source}")]
    Parse {
        path:   PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("No credentials stored for `{0}`.")]
    NotFound(String),
    #[error("Stored credentials for `{0}` are malformed.")]
    InvalidAuth(String),
    #[error("Credential helper `{helper}` failed: {reason}")]
    Helper { helper: String, reason: String },
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").field("username", &self.username).finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DockerConfig {
    #[serde(default)]
    auths:        HashMap<String, AuthEntry>,
    #[serde(default)]
    creds_store:  Option<String>,
    #[serde(default)]
    cred_helpers: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth:     Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HelperResponse {
    username: String,
    secret:   String,
}

/// Looks up credentials for registry endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialResolver {
    config_path: Option<PathBuf>,
}

impl Default for CredentialResolver {
    fn default() -> Self {
        Self::from_env()
    }
}

impl CredentialResolver {
    /// Uses `DOCKER_CONFIG` if set, the home directory otherwise.
    #[must_use]
    pub fn from_env() -> Self {
        let dir = std::env::var_os(CONFIG_DIR_ENV)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|home| home.join(".docker")));
        Self {
            config_path: dir.map(|dir| dir.join(CONFIG_FILE)),
        }
    }

    #[must_use]
    pub fn with_config_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Never fails: a missing file or entry gives empty credentials, and
    /// the registry decides whether anonymous access is enough.
    #[must_use]
    pub fn resolve(&self, domain: &str) -> Credentials {
        match self.lookup(domain) {
            Ok(credentials) => {
                debug!("Using stored credentials for {domain}");
                credentials
            }
            Err(e) => {
                debug!("Continuing without credentials for {domain}: {e}");
                Credentials::default()
            }
        }
    }

    /// # Errors
    ///
    /// Fails when there is no configuration, no entry for the domain, or the
    /// entry cannot be read.
    pub fn lookup(&self, domain: &str) -> Result<Credentials, CredentialError> {
        let path = self.config_path.as_deref().ok_or_else(|| CredentialError::NoConfig(PathBuf::from(CONFIG_FILE)))?;
        let config = load_config(path)?;
        let key = credential_key(domain);

        let helper = config.cred_helpers.get(&key).or(config.creds_store.as_ref());
        if let Some(helper) = helper {
            match run_helper(helper, &key) {
                Ok(credentials) => return Ok(credentials),
                Err(e) => debug!("{e}, falling back to inline entries"),
            }
        }

        let entry = config
            .auths
            .get(&key)
            .or_else(|| {
                let wanted = normalize_key(&key);
                config
                    .auths
                    .iter()
                    .find_map(|(candidate, entry)| (normalize_key(candidate) == wanted).then_some(entry))
            })
            .ok_or_else(|| CredentialError::NotFound(key.clone()))?;
        decode_entry(&key, entry)
    }
}

/// The config key for an endpoint. The default registry keeps its
/// historical key, other endpoints are keyed by host.
#[must_use]
pub fn credential_key(domain: &str) -> String {
    let domain = domain.trim_end_matches('/');
    if domain == DEFAULT_REGISTRY_ENDPOINT {
        DEFAULT_REGISTRY_KEY.to_owned()
    } else {
        domain.strip_prefix("https://").unwrap_or(domain).to_owned()
    }
}

/// Host part of a key, so `https://ghcr.io/` matches `ghcr.io`.
fn normalize_key(key: &str) -> String {
    let key = key.strip_prefix("https://").or_else(|| key.strip_prefix("http://")).unwrap_or(key);
    let host = key.split('/').next().unwrap_or(key).to_ascii_lowercase();
    if host == "docker.io" || host == "registry-1.docker.io" {
        "index.docker.io".to_owned()
    } else {
        host
    }
}

fn load_config(path: &Path) -> Result<DockerConfig, CredentialError> {
    if !path.exists() {
        return Err(CredentialError::NoConfig(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path).map_err(|source| CredentialError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| CredentialError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn decode_entry(key: &str, entry: &AuthEntry) -> Result<Credentials, CredentialError> {
    if let Some(auth) = entry.auth.as_deref().filter(|auth| !auth.is_empty()) {
        let decoded = STANDARD.decode(auth).map_err(|_| CredentialError::InvalidAuth(key.to_owned()))?;
        let decoded = String::from_utf8(decoded).map_err(|_| CredentialError::InvalidAuth(key.to_owned()))?;
        let (username, password) = decoded.split_once(':').ok_or_else(|| CredentialError::InvalidAuth(key.to_owned()))?;
        return Ok(Credentials {
            username: username.to_owned(),
            password: password.to_owned(),
        });
    }
    match (&entry.username, &entry.password) {
        (Some(username), Some(password)) if !username.is_empty() => Ok(Credentials {
            username: username.clone(),
            password: password.clone(),
        }),
        _ => Err(CredentialError::NotFound(key.to_owned())),
    }
}

/// Runs `docker-credential-<helper> get` with the key on stdin.
fn run_helper(helper: &str, key: &str) -> Result<Credentials, CredentialError> {
    let program = format!("docker-credential-{helper}");
    let helper_error = |reason: String| CredentialError::Helper {
        helper: program.clone(),
        reason,
    };
    let mut child = Command::new(&program)
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| helper_error(e.to_string()))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(key.as_bytes()).map_err(|e| helper_error(e.to_string()))?;
    }
    let output = child.wait_with_output().map_err(|e| helper_error(e.to_string()))?;
    if !output.status.success() {
        return Err(helper_error(String::from_utf8_lossy(&output.stdout).trim().to_owned()));
    }
    let response: HelperResponse = serde_json::from_slice(&output.stdout).map_err(|e| helper_error(e.to_string()))?;
    Ok(Credentials {
        username: response.username,
        password: response.secret,
    })
}
