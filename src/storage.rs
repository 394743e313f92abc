//! Public entry points: list, pull and push configuration payloads.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::codec::Payload;
use crate::context::Context;
use crate::credentials::CredentialResolver;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::negotiator::{self, Labels};
use crate::options::RegistryOptions;
use crate::reference::{self, ParsedReference};
use crate::registry::{Connect, HttpConnector, RegistryClient};

/// Key the single payload operations read and write.
pub const CONFIG_KEY: &str = "config";

/// Stores payloads in registries reached through `C`.
#[derive(Debug, Clone)]
pub struct Storage<C = HttpConnector> {
    connector:   C,
    credentials: CredentialResolver,
}

impl Storage {
    /// Talks HTTP and reads the docker client's stored credentials.
    #[must_use]
    pub fn new() -> Self {
        Self::with_parts(HttpConnector, CredentialResolver::from_env())
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connect> Storage<C> {
    #[must_use]
    pub const fn with_parts(connector: C, credentials: CredentialResolver) -> Self {
        Self { connector, credentials }
    }

    /// Repository names in the registry at `endpoint`.
    ///
    /// # Errors
    ///
    /// Fails if the registry cannot be reached or refuses the catalog.
    pub fn list_registry(&self, ctx: &Context, endpoint: &str, opts: &RegistryOptions) -> Result<Vec<String>> {
        let client = self.connect(endpoint, opts)?;
        let repositories = client.catalog(ctx).map_err(|e| Error::registry("listing repositories", e))?;
        debug!("{endpoint} holds {} repositories", repositories.len());
        Ok(repositories)
    }

    /// Tags of `repository`. A tag in the reference is ignored.
    ///
    /// # Errors
    ///
    /// Fails on a malformed reference or a registry error.
    pub fn list_repository(&self, ctx: &Context, repository: &str, opts: &RegistryOptions) -> Result<Vec<String>> {
        let reference = ParsedReference::parse(repository)?;
        let client = self.connect(reference.domain(), opts)?;
        client
            .tags(ctx, reference.path())
            .map_err(|e| Error::registry("listing tags", e))
    }

    /// The payload stored under [`CONFIG_KEY`], empty if there is none.
    ///
    /// # Errors
    ///
    /// See [`Storage::pull_config_multi`].
    pub fn pull_config(&self, ctx: &Context, repo_tag: &str, opts: &RegistryOptions) -> Result<String> {
        let mut payload = self.pull_config_multi(ctx, repo_tag, opts)?;
        Ok(payload.remove(CONFIG_KEY).unwrap_or_default())
    }

    /// The full mapping stored under `repo_tag`.
    ///
    /// # Errors
    ///
    /// Fails on a malformed reference, a registry error, or a stored payload
    /// that cannot be decoded.
    pub fn pull_config_multi(&self, ctx: &Context, repo_tag: &str, opts: &RegistryOptions) -> Result<Payload> {
        let reference = ParsedReference::parse(repo_tag)?;
        let client = self.connect(reference.domain(), opts)?;
        let payload = negotiator::pull(&client, ctx, &reference)?;
        info!("Pulled {} file(s) from {reference}", payload.len());
        Ok(payload)
    }

    /// Stores `payload` under [`CONFIG_KEY`] and returns the manifest digest.
    ///
    /// # Errors
    ///
    /// See [`Storage::push_config_multi`].
    pub fn push_config(&self, ctx: &Context, payload: &str, repo_tag: &str, opts: &RegistryOptions, labels: &Labels) -> Result<Digest> {
        let payload = Payload::from([(CONFIG_KEY.to_owned(), payload.to_owned())]);
        self.push_config_multi(ctx, &payload, repo_tag, opts, labels)
    }

    /// Stores the full mapping and returns the manifest digest. `labels` only
    /// end up in the registry if it falls back to an image manifest.
    ///
    /// # Errors
    ///
    /// Fails on a malformed reference or any registry error other than the
    /// first rejection of the configuration manifest.
    pub fn push_config_multi(
        &self,
        ctx: &Context,
        payload: &Payload,
        repo_tag: &str,
        opts: &RegistryOptions,
        labels: &Labels,
    ) -> Result<Digest> {
        let reference = ParsedReference::parse(repo_tag)?;
        let client = self.connect(reference.domain(), opts)?;
        let digest = negotiator::push(&client, ctx, &reference, payload, labels)?;
        info!("Pushed {} file(s) to {reference} as {digest}", payload.len());
        Ok(digest)
    }

    /// Pulls the mapping and writes each entry as a file into a new
    /// directory `<output_dir>/<name>`, where `name` is the last segment of
    /// the repository. Keys that are not plain file names are skipped.
    ///
    /// # Errors
    ///
    /// Fails if the pull fails, the directory already exists, or a file
    /// cannot be written.
    pub fn pull_to_directory(&self, ctx: &Context, repo_tag: &str, output_dir: &Path, opts: &RegistryOptions) -> Result<PathBuf> {
        let payload = self.pull_config_multi(ctx, repo_tag, opts)?;
        let target = output_dir.join(reference::local_name(repo_tag.trim()));
        fs::create_dir(&target).map_err(|e| Error::io("Creating directory", &target, e))?;

        for (key, content) in &payload {
            if !is_safe_key(key) {
                warn!("Skipping `{key}`, it is not a plain file name");
                continue;
            }
            let path = target.join(key);
            fs::write(&path, content).map_err(|e| Error::io("Writing", &path, e))?;
            set_file_mode(&path)?;
            debug!("Wrote {}", path.display());
        }
        Ok(target)
    }

    /// Pushes the regular files directly inside `dir`, keyed by file name.
    ///
    /// # Errors
    ///
    /// Fails if the directory or one of its files cannot be read, or the
    /// push fails.
    pub fn push_directory(&self, ctx: &Context, dir: &Path, repo_tag: &str, opts: &RegistryOptions, labels: &Labels) -> Result<Digest> {
        let mut payload = Payload::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| Error::io("Reading directory", dir, e.into()))?;
            if !entry.file_type().is_file() {
                debug!("Skipping {}", entry.path().display());
                continue;
            }
            let content = fs::read_to_string(entry.path()).map_err(|e| Error::io("Reading", entry.path(), e))?;
            payload.insert(entry.file_name().to_string_lossy().into_owned(), content);
        }
        self.push_config_multi(ctx, &payload, repo_tag, opts, labels)
    }

    /// Connects with `opts`, filling in stored credentials when no username
    /// was given.
    fn connect(&self, domain: &str, opts: &RegistryOptions) -> Result<C::Client> {
        let opts = if opts.has_credentials() {
            opts.clone()
        } else {
            let stored = self.credentials.resolve(domain);
            RegistryOptions {
                username: stored.username,
                password: stored.password,
                insecure: opts.insecure,
            }
        };
        self.connector
            .connect(domain, &opts)
            .map_err(|e| Error::registry("connecting", e))
    }
}

/// Whether `key` can be used as a file name inside the output directory.
#[must_use]
pub fn is_safe_key(key: &str) -> bool {
    !(key.is_empty() || key == "." || key == ".." || key.contains('/') || key.contains('\\'))
}

#[cfg(unix)]
fn set_file_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644)).map_err(|e| Error::io("Setting permissions on", path, e))
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
fn set_file_mode(_path: &Path) -> Result<()> {
    Ok(())
}
