//! Password-store (pass / gopass) credential backend.
//!
//! Entries use the pass convention: the first line is the password and
//! the remaining lines are `field-name: value` pairs.

use std::collections::HashMap;
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::OnceCell;

use super::totp::TotpSeed;
use super::{CredentialError, CredentialKind, SecretBackend};
use crate::clock::Clock;

/// Reads raw entries from a password store.
pub trait PassClient: Send + Sync {
    fn show(&self, path: &str) -> Result<String>;
}

/// Shells out to `pass show <path>` (or any compatible program).
#[derive(Debug, Clone)]
pub struct PassCli {
    program: String,
}

impl PassCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for PassCli {
    fn default() -> Self {
        Self::new("pass")
    }
}

impl PassClient for PassCli {
    fn show(&self, path: &str) -> Result<String> {
        let output = Command::new(&self.program)
            .arg("show")
            .arg(path)
            .output()
            .with_context(|| format!("Failed to run {} command", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{} show failed: {}", self.program, stderr.trim());
        }

        String::from_utf8(output.stdout).context("Invalid UTF-8 in password store output")
    }
}

/// Field mapping for one password store entry.
#[derive(Debug, Clone)]
pub struct PasswordManagerConfig {
    pub secret: String,
    pub username_field: String,
    pub password_field: String,
    pub otp_field: Option<String>,
}

/// Credential backend over a single password store entry.
///
/// The entry is read once and shared by every field lookup.
pub struct PasswordManagerBackend {
    config: PasswordManagerConfig,
    client: Arc<dyn PassClient>,
    clock: Arc<dyn Clock>,
    entry: OnceCell<PassEntry>,
}

impl PasswordManagerBackend {
    pub fn new(
        config: PasswordManagerConfig,
        client: Arc<dyn PassClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            client,
            clock,
            entry: OnceCell::new(),
        }
    }

    async fn entry(&self) -> Result<&PassEntry, CredentialError> {
        self.entry
            .get_or_try_init(|| async {
                let client = self.client.clone();
                let secret = self.config.secret.clone();
                let shown = tokio::task::spawn_blocking(move || client.show(&secret))
                    .await
                    .map_err(|e| CredentialError::unavailable(self.kind(), e))?;
                shown
                    .map(|content| PassEntry::parse(&content))
                    .map_err(|e| CredentialError::unavailable(self.kind(), format!("{e:#}")))
            })
            .await
    }

    fn field<'a>(&self, entry: &'a PassEntry, name: &str) -> Result<&'a str, CredentialError> {
        let value = if name == "password" {
            entry.password.as_deref()
        } else {
            entry.fields.get(name).map(String::as_str)
        };
        value.ok_or_else(|| {
            CredentialError::unavailable(
                self.kind(),
                format!("field {name:?} not found in {}", self.config.secret),
            )
        })
    }
}

#[async_trait]
impl SecretBackend for PasswordManagerBackend {
    fn kind(&self) -> CredentialKind {
        if self.config.otp_field.is_some() {
            CredentialKind::PasswordManagerTotp
        } else {
            CredentialKind::PasswordManager
        }
    }

    async fn username(&self) -> Result<String, CredentialError> {
        let entry = self.entry().await?;
        self.field(entry, &self.config.username_field)
            .map(str::to_string)
    }

    async fn password(&self) -> Result<SecretString, CredentialError> {
        let entry = self.entry().await?;
        self.field(entry, &self.config.password_field)
            .map(|value| SecretString::from(value.to_string()))
    }

    async fn otp(&self) -> Result<Option<SecretString>, CredentialError> {
        let Some(otp_field) = &self.config.otp_field else {
            return Ok(None);
        };
        let entry = self.entry().await?;
        let seed = TotpSeed::parse(self.field(entry, otp_field)?)
            .map_err(|e| CredentialError::unavailable(self.kind(), e))?;
        let code = seed
            .code_at(self.clock.now())
            .map_err(|e| CredentialError::unavailable(self.kind(), e))?;
        Ok(Some(SecretString::from(code)))
    }
}

/// Parsed pass entry.
#[derive(Debug, Default)]
struct PassEntry {
    /// The first line.
    password: Option<String>,
    /// Additional fields in `name: value` format.
    fields: HashMap<String, String>,
}

impl PassEntry {
    fn parse(content: &str) -> Self {
        let mut lines = content.lines();
        let password = lines
            .next()
            .map(|s| s.trim_end().to_string())
            .filter(|s| !s.is_empty());
        let mut fields = HashMap::new();

        for line in lines {
            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim();
                if key.is_empty() {
                    continue;
                }
                fields.insert(key.to_string(), value.trim().to_string());
            }
        }

        Self { password, fields }
    }
}
