use std::fmt::{Display, Formatter};
use std::str::FromStr;

use oci_distribution::Reference;

use crate::error::{Error, Result};

/// Domain assumed when a reference does not name a registry.
pub const DEFAULT_DOMAIN: &str = "docker.io";
/// Host that actually serves the default registry's API.
pub const DEFAULT_ENDPOINT_HOST: &str = "registry-1.docker.io";
const LEGACY_DEFAULT_DOMAIN: &str = "index.docker.io";
const OFFICIAL_NAMESPACE: &str = "library";
const DEFAULT_TAG: &str = "latest";

/// A `repository[:tag]` string resolved against a registry endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReference {
    /// Endpoint with an explicit `https://` scheme.
    domain: String,
    path:   String,
    tag:    String,
}

impl ParsedReference {
    /// Parses and normalises a reference, e.g. `nginx` becomes
    /// `https://registry-1.docker.io`, `library/nginx`, `latest`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReferenceFormat`] if the string does not follow the
    /// registry reference grammar. Digest references are not accepted.
    pub fn parse(repo_tag: &str) -> Result<Self> {
        let input = repo_tag.trim();
        if input.is_empty() {
            return Err(format_error(repo_tag, "reference is empty"));
        }
        if input.contains('@') {
            return Err(format_error(repo_tag, "digest references are not supported"));
        }
        let reference = input
            .parse::<Reference>()
            .map_err(|e| format_error(repo_tag, &e.to_string()))?;
        if reference.digest().is_some() {
            return Err(format_error(repo_tag, "digest references are not supported"));
        }

        let registry = reference.registry();
        // Only a dotted name, a host with a port or localhost is a registry.
        if !registry.contains('.') && !registry.contains(':') && registry != "localhost" {
            return Err(format_error(repo_tag, "invalid registry domain"));
        }
        if reference.repository().chars().any(|c| c.is_ascii_uppercase()) {
            return Err(format_error(repo_tag, "repository name must be lowercase"));
        }

        let host = if registry == DEFAULT_DOMAIN || registry == LEGACY_DEFAULT_DOMAIN {
            DEFAULT_ENDPOINT_HOST
        } else {
            registry
        };
        let path = reference.repository();
        let path = if host == DEFAULT_ENDPOINT_HOST && !path.contains('/') {
            format!("{OFFICIAL_NAMESPACE}/{path}")
        } else {
            path.to_owned()
        };
        Ok(Self {
            domain: format!("https://{host}"),
            path,
            tag:    reference.tag().unwrap_or(DEFAULT_TAG).to_owned(),
        })
    }

    /// The endpoint, e.g. `https://ghcr.io`.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Repository path without the domain, e.g. `library/nginx`.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The endpoint without its scheme.
    #[must_use]
    pub fn host(&self) -> &str {
        self.domain.strip_prefix("https://").unwrap_or(&self.domain)
    }
}

impl Display for ParsedReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.host(), self.path, self.tag)
    }
}

impl FromStr for ParsedReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Returns the `[domain/]repository` part of a `repository[:tag]` string
/// without parsing it, stepping over a port in the domain, e.g.
/// `localhost:5000/team/app:1.0` yields `5000/team/app`. Only the last path
/// segment of the result is meaningful as a local name.
#[must_use]
pub fn repository_part(repo_tag: &str) -> &str {
    let components: Vec<&str> = repo_tag.split(':').collect();
    match components.as_slice() {
        [_, middle, _] => *middle,
        [_, middle] if middle.contains('/') => *middle,
        _ => components.first().copied().unwrap_or_default(),
    }
}

/// The last path segment of [`repository_part`], e.g. `app`.
#[must_use]
pub fn local_name(repo_tag: &str) -> &str {
    let repository = repository_part(repo_tag);
    repository.rsplit('/').next().unwrap_or(repository)
}

fn format_error(reference: &str, reason: &str) -> Error {
    Error::ReferenceFormat {
        reference: reference.to_owned(),
        reason:    reason.to_owned(),
    }
}
