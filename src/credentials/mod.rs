//! Credential resolution.
//!
//! Each source names a secret backend in its configuration:
//!
//! ```toml
//! [sources.credentials]
//! type = "password-manager"
//! secret = "banks/anz"
//! otp_field = "totp"
//! ```
//!
//! [`CredentialResolver`] turns that descriptor into a [`ResolvedCredential`]
//! and refuses to hand back anything that is not fully resolved.

mod descriptor;
mod keychain;
mod pass;
mod plain;
mod resolver;
mod totp;

pub use descriptor::SecretDescriptor;
pub use keychain::{KeychainBackend, KeychainClient, OsKeychain};
pub use pass::{PassCli, PassClient, PasswordManagerBackend, PasswordManagerConfig};
pub use plain::{EnvBackend, EnvLookup, InlineBackend};
pub use resolver::CredentialResolver;
pub use totp::{TotpError, TotpSeed};

use std::fmt;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

/// Which backend produced a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    File,
    Env,
    PasswordManager,
    /// Password manager entry that also carries a TOTP seed.
    PasswordManagerTotp,
    Keychain,
}

impl CredentialKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialKind::File => "file",
            CredentialKind::Env => "env",
            CredentialKind::PasswordManager => "password-manager",
            CredentialKind::PasswordManagerTotp => "password-manager-totp",
            CredentialKind::Keychain => "keychain",
        }
    }

    /// Whether a one-time code is part of a complete credential.
    pub fn requires_otp(self) -> bool {
        matches!(self, CredentialKind::PasswordManagerTotp)
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("{backend} secret unavailable: {reason}")]
    Unavailable {
        backend: CredentialKind,
        reason: String,
    },

    #[error("{kind} credentials incomplete: missing {}", .missing.join(", "))]
    Incomplete {
        kind: CredentialKind,
        missing: Vec<&'static str>,
    },
}

impl CredentialError {
    pub(crate) fn unavailable(backend: CredentialKind, reason: impl fmt::Display) -> Self {
        CredentialError::Unavailable {
            backend,
            reason: reason.to_string(),
        }
    }
}

/// Login secrets for one source. Lives in memory only.
pub struct ResolvedCredential {
    kind: CredentialKind,
    username: String,
    password: SecretString,
    otp: Option<SecretString>,
}

impl ResolvedCredential {
    pub fn new(kind: CredentialKind, username: impl Into<String>, password: SecretString) -> Self {
        Self {
            kind,
            username: username.into(),
            password,
            otp: None,
        }
    }

    pub fn with_otp(mut self, otp: SecretString) -> Self {
        self.otp = Some(otp);
        self
    }

    pub fn kind(&self) -> CredentialKind {
        self.kind
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &SecretString {
        &self.password
    }

    pub fn otp(&self) -> Option<&SecretString> {
        self.otp.as_ref()
    }

    /// Names of required fields that are empty for this credential's kind.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.username.is_empty() {
            missing.push("username");
        }
        if self.password.expose_secret().is_empty() {
            missing.push("password");
        }
        if self.kind.requires_otp() {
            let otp_empty = self
                .otp
                .as_ref()
                .map(|otp| otp.expose_secret().is_empty())
                .unwrap_or(true);
            if otp_empty {
                missing.push("otp");
            }
        }
        missing
    }

    pub fn is_fully_resolved(&self) -> bool {
        self.missing_fields().is_empty()
    }
}

impl fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("kind", &self.kind)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("otp", &self.otp.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// A source of login secrets.
///
/// Every backend answers the same questions, so the resolver never has
/// to branch on the backend once it is built.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    fn kind(&self) -> CredentialKind;

    async fn username(&self) -> Result<String, CredentialError>;

    async fn password(&self) -> Result<SecretString, CredentialError>;

    /// One-time code, for backends configured with a TOTP seed.
    async fn otp(&self) -> Result<Option<SecretString>, CredentialError> {
        Ok(None)
    }

    /// Collect every field into a credential without checking completeness.
    async fn fetch(&self) -> Result<ResolvedCredential, CredentialError> {
        let username = self.username().await?;
        let password = self.password().await?;
        let credential = ResolvedCredential::new(self.kind(), username, password);
        Ok(match self.otp().await? {
            Some(otp) => credential.with_otp(otp),
            None => credential,
        })
    }
}
