/// Environment variable that turns on insecure registry transport.
pub const INSECURE_ENV: &str = "REGSTASH_INSECURE_REGISTRY";

/// Per-call registry settings.
///
/// When `username` is empty the credential store is consulted before the
/// registry is contacted.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RegistryOptions {
    pub username: String,
    pub password: String,
    /// Skip TLS certificate verification.
    pub insecure: bool,
}

impl RegistryOptions {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            insecure: false,
        }
    }

    #[must_use]
    pub const fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Also enables insecure mode when [`INSECURE_ENV`] is set to a non-empty
    /// value. Only the command line layer calls this.
    #[must_use]
    pub fn with_env_insecure(self) -> Self {
        let from_env = std::env::var_os(INSECURE_ENV).is_some_and(|value| !value.is_empty());
        let insecure = self.insecure || from_env;
        self.insecure(insecure)
    }

    #[must_use]
    pub const fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }
}

// Keeps passwords out of debug logs.
impl std::fmt::Debug for RegistryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryOptions")
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "<redacted>" })
            .field("insecure", &self.insecure)
            .finish()
    }
}
