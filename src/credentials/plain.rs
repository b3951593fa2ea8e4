//! Backends that need no external store: inline config values and
//! environment variables.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;

use super::{CredentialError, CredentialKind, SecretBackend};

/// Credentials written directly into the config file.
pub struct InlineBackend {
    username: String,
    password: String,
}

impl InlineBackend {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl SecretBackend for InlineBackend {
    fn kind(&self) -> CredentialKind {
        CredentialKind::File
    }

    async fn username(&self) -> Result<String, CredentialError> {
        Ok(self.username.clone())
    }

    async fn password(&self) -> Result<SecretString, CredentialError> {
        Ok(SecretString::from(self.password.clone()))
    }
}

/// Environment lookup, injectable so tests never touch the process env.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub(crate) fn process_env() -> EnvLookup {
    Arc::new(|key: &str| std::env::var(key).ok())
}

/// Reads two named environment variables at resolution time.
///
/// Unset variables resolve to empty strings; completeness is checked by
/// the resolver.
pub struct EnvBackend {
    username_key: String,
    password_key: String,
    lookup: EnvLookup,
}

impl EnvBackend {
    pub fn new(
        username_key: impl Into<String>,
        password_key: impl Into<String>,
        lookup: EnvLookup,
    ) -> Self {
        Self {
            username_key: username_key.into(),
            password_key: password_key.into(),
            lookup,
        }
    }

    fn read(&self, key: &str) -> String {
        (self.lookup)(key).unwrap_or_default()
    }
}

#[async_trait]
impl SecretBackend for EnvBackend {
    fn kind(&self) -> CredentialKind {
        CredentialKind::Env
    }

    async fn username(&self) -> Result<String, CredentialError> {
        Ok(self.read(&self.username_key))
    }

    async fn password(&self) -> Result<SecretString, CredentialError> {
        Ok(SecretString::from(self.read(&self.password_key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> EnvLookup {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Arc::new(move |key: &str| vars.get(key).cloned())
    }

    #[tokio::test]
    async fn inline_values_resolve() -> anyhow::Result<()> {
        let cred = InlineBackend::new("u", "p").fetch().await?;
        assert_eq!(cred.kind(), CredentialKind::File);
        assert_eq!(cred.username(), "u");
        assert_eq!(cred.password().expose_secret(), "p");
        assert!(cred.is_fully_resolved());
        Ok(())
    }

    #[tokio::test]
    async fn env_reads_named_variables() -> anyhow::Result<()> {
        let backend = EnvBackend::new(
            "BANK_USER",
            "BANK_PASS",
            env(&[("BANK_USER", "someone"), ("BANK_PASS", "secret")]),
        );
        let cred = backend.fetch().await?;
        assert_eq!(cred.username(), "someone");
        assert_eq!(cred.password().expose_secret(), "secret");
        assert!(cred.is_fully_resolved());
        Ok(())
    }

    #[tokio::test]
    async fn env_unset_variable_is_empty_not_error() -> anyhow::Result<()> {
        let backend = EnvBackend::new("BANK_USER", "BANK_PASS", env(&[("BANK_USER", "someone")]));
        let cred = backend.fetch().await?;
        assert_eq!(cred.password().expose_secret(), "");
        assert!(!cred.is_fully_resolved());
        assert_eq!(cred.missing_fields(), vec!["password"]);
        Ok(())
    }
}
