use std::sync::Arc;

use super::keychain::{KeychainBackend, KeychainClient, OsKeychain};
use super::pass::{PassCli, PassClient, PasswordManagerBackend, PasswordManagerConfig};
use super::plain::{process_env, EnvBackend, EnvLookup, InlineBackend};
use super::{CredentialError, ResolvedCredential, SecretBackend, SecretDescriptor};
use crate::clock::{Clock, SystemClock};

/// Builds the backend named by a [`SecretDescriptor`] and resolves it.
///
/// External collaborators (clock, environment, password store, keychain)
/// default to the real system and can be swapped for tests.
pub struct CredentialResolver {
    clock: Arc<dyn Clock>,
    env: EnvLookup,
    pass_client: Option<Arc<dyn PassClient>>,
    keychain: Arc<dyn KeychainClient>,
}

impl Default for CredentialResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialResolver {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            env: process_env(),
            pass_client: None,
            keychain: Arc::new(OsKeychain),
        }
    }

    /// Time source for one-time codes.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_env(mut self, env: EnvLookup) -> Self {
        self.env = env;
        self
    }

    /// Use this client instead of running the descriptor's `program`.
    pub fn with_pass_client(mut self, client: Arc<dyn PassClient>) -> Self {
        self.pass_client = Some(client);
        self
    }

    pub fn with_keychain(mut self, keychain: Arc<dyn KeychainClient>) -> Self {
        self.keychain = keychain;
        self
    }

    pub fn backend(&self, descriptor: &SecretDescriptor) -> Box<dyn SecretBackend> {
        match descriptor {
            SecretDescriptor::File { username, password } => {
                Box::new(InlineBackend::new(username, password))
            }
            SecretDescriptor::Env {
                username_key,
                password_key,
            } => Box::new(EnvBackend::new(
                username_key,
                password_key,
                self.env.clone(),
            )),
            SecretDescriptor::PasswordManager {
                secret,
                username_field,
                password_field,
                otp_field,
                program,
            } => {
                let client = self
                    .pass_client
                    .clone()
                    .unwrap_or_else(|| Arc::new(PassCli::new(program)) as Arc<dyn PassClient>);
                Box::new(PasswordManagerBackend::new(
                    PasswordManagerConfig {
                        secret: secret.clone(),
                        username_field: username_field.clone(),
                        password_field: password_field.clone(),
                        otp_field: otp_field.clone(),
                    },
                    client,
                    self.clock.clone(),
                ))
            }
            SecretDescriptor::Keychain { service, account } => Box::new(KeychainBackend::new(
                service,
                account,
                self.keychain.clone(),
            )),
        }
    }

    /// Resolve a descriptor into a usable credential.
    ///
    /// Fails with [`CredentialError::Incomplete`] if any required field
    /// came back empty. Nothing is retried.
    pub async fn resolve(
        &self,
        descriptor: &SecretDescriptor,
    ) -> Result<ResolvedCredential, CredentialError> {
        tracing::debug!(backend = %descriptor.kind(), "Resolving credentials");

        let credential = self.backend(descriptor).fetch().await?;
        let missing = credential.missing_fields();
        if !missing.is_empty() {
            return Err(CredentialError::Incomplete {
                kind: credential.kind(),
                missing,
            });
        }
        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::credentials::CredentialKind;
    use anyhow::Result;
    use chrono::{TimeZone, Utc};
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    struct Entries(HashMap<&'static str, &'static str>);

    impl PassClient for Entries {
        fn show(&self, path: &str) -> Result<String> {
            self.0
                .get(path)
                .map(|s| s.to_string())
                .ok_or_else(|| anyhow::anyhow!("{path} is not in the password store"))
        }
    }

    struct NoKeychain;

    impl KeychainClient for NoKeychain {
        fn password(&self, _service: &str, _account: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    fn resolver() -> CredentialResolver {
        let entries = HashMap::from([(
            "banks/anz",
            "pw\nusername: someone\ntotp: otpauth://totp/anz?secret=rpna55555qyho42j",
        )]);
        CredentialResolver::new()
            .with_clock(Arc::new(FixedClock::new(
                Utc.with_ymd_and_hms(2022, 1, 1, 2, 1, 1).unwrap(),
            )))
            .with_env(Arc::new(|key: &str| (key == "USER_ONLY").then(|| "u".to_string())))
            .with_pass_client(Arc::new(Entries(entries)))
            .with_keychain(Arc::new(NoKeychain))
    }

    fn totp_descriptor() -> SecretDescriptor {
        SecretDescriptor::PasswordManager {
            secret: "banks/anz".to_string(),
            username_field: "username".to_string(),
            password_field: "password".to_string(),
            otp_field: Some("totp".to_string()),
            program: "pass".to_string(),
        }
    }

    #[tokio::test]
    async fn resolves_inline_file() -> Result<()> {
        let cred = resolver()
            .resolve(&SecretDescriptor::File {
                username: "u".to_string(),
                password: "p".to_string(),
            })
            .await?;
        assert!(cred.is_fully_resolved());
        assert_eq!(cred.kind(), CredentialKind::File);
        Ok(())
    }

    #[tokio::test]
    async fn env_with_unset_variable_is_incomplete() {
        let err = resolver()
            .resolve(&SecretDescriptor::Env {
                username_key: "USER_ONLY".to_string(),
                password_key: "UNSET".to_string(),
            })
            .await
            .unwrap_err();
        match err {
            CredentialError::Incomplete { kind, missing } => {
                assert_eq!(kind, CredentialKind::Env);
                assert_eq!(missing, vec!["password"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn otp_is_deterministic_for_fixed_time() -> Result<()> {
        let resolver = resolver();
        let first = resolver.resolve(&totp_descriptor()).await?;
        let second = resolver.resolve(&totp_descriptor()).await?;

        assert_eq!(first.kind(), CredentialKind::PasswordManagerTotp);
        let first_code = first.otp().map(|c| c.expose_secret().to_string());
        let second_code = second.otp().map(|c| c.expose_secret().to_string());
        assert!(first_code.is_some());
        assert_eq!(first_code, second_code);
        Ok(())
    }

    #[tokio::test]
    async fn missing_password_entry_is_unavailable() {
        let err = resolver()
            .resolve(&SecretDescriptor::PasswordManager {
                secret: "banks/missing".to_string(),
                username_field: "username".to_string(),
                password_field: "password".to_string(),
                otp_field: None,
                program: "pass".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn missing_keychain_item_is_unavailable() {
        let err = resolver()
            .resolve(&SecretDescriptor::Keychain {
                service: "anz".to_string(),
                account: "someone".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CredentialError::Unavailable {
                backend: CredentialKind::Keychain,
                ..
            }
        ));
    }
}
