//! OS keychain credential backend.
//!
//! Keychain items are addressed by a `service`/`account` pair and store
//! only a password, so the account name is reported as the username.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use secrecy::SecretString;

use super::{CredentialError, CredentialKind, SecretBackend};

/// Looks up a password by service and account.
pub trait KeychainClient: Send + Sync {
    /// Returns `Ok(None)` if no such item exists.
    fn password(&self, service: &str, account: &str) -> Result<Option<String>>;
}

/// The platform keychain (Secret Service, macOS Keychain, Windows
/// Credential Manager) via `keyring`.
#[derive(Debug, Clone, Default)]
pub struct OsKeychain;

impl KeychainClient for OsKeychain {
    fn password(&self, service: &str, account: &str) -> Result<Option<String>> {
        let entry = keyring::Entry::new(service, account)?;
        match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct KeychainBackend {
    service: String,
    account: String,
    client: Arc<dyn KeychainClient>,
}

impl KeychainBackend {
    pub fn new(
        service: impl Into<String>,
        account: impl Into<String>,
        client: Arc<dyn KeychainClient>,
    ) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
            client,
        }
    }
}

#[async_trait]
impl SecretBackend for KeychainBackend {
    fn kind(&self) -> CredentialKind {
        CredentialKind::Keychain
    }

    async fn username(&self) -> Result<String, CredentialError> {
        Ok(self.account.clone())
    }

    async fn password(&self) -> Result<SecretString, CredentialError> {
        let lookup = format!("{}/{}", self.service, self.account);
        let client = self.client.clone();
        let (service, account) = (self.service.clone(), self.account.clone());
        let found = tokio::task::spawn_blocking(move || client.password(&service, &account))
            .await
            .map_err(|e| CredentialError::unavailable(self.kind(), format!("{lookup}: {e}")))?;
        match found {
            Ok(Some(value)) => Ok(SecretString::from(value)),
            Ok(None) => Err(CredentialError::unavailable(
                self.kind(),
                format!("no keychain item for {lookup}"),
            )),
            Err(e) => Err(CredentialError::unavailable(
                self.kind(),
                format!("{lookup}: {e:#}"),
            )),
        }
    }
}
