//! Secret descriptors, as embedded in each source's configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::CredentialKind;

fn default_username_field() -> String {
    "username".to_string()
}

fn default_password_field() -> String {
    "password".to_string()
}

fn default_pass_program() -> String {
    "pass".to_string()
}

/// Where a source's login secrets live.
///
/// Exactly one backend's locator fields are present, selected by `type`:
///
/// ```toml
/// [sources.credentials]
/// type = "keychain"
/// service = "anz"
/// account = "someone@example.com"
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum SecretDescriptor {
    /// Values embedded directly in the config file.
    File { username: String, password: String },

    /// Names of two environment variables read at resolution time.
    Env {
        username_key: String,
        password_key: String,
    },

    /// A pass/gopass entry.
    PasswordManager {
        /// Entry path, e.g. `banks/anz`.
        secret: String,
        #[serde(default = "default_username_field")]
        username_field: String,
        /// `"password"` means the entry's first line.
        #[serde(default = "default_password_field")]
        password_field: String,
        /// Field holding an `otpauth://` URI or base32 seed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        otp_field: Option<String>,
        #[serde(default = "default_pass_program")]
        program: String,
    },

    /// OS keychain item; `account` doubles as the username.
    Keychain { service: String, account: String },
}

impl SecretDescriptor {
    pub fn kind(&self) -> CredentialKind {
        match self {
            SecretDescriptor::File { .. } => CredentialKind::File,
            SecretDescriptor::Env { .. } => CredentialKind::Env,
            SecretDescriptor::PasswordManager {
                otp_field: Some(_), ..
            } => CredentialKind::PasswordManagerTotp,
            SecretDescriptor::PasswordManager { .. } => CredentialKind::PasswordManager,
            SecretDescriptor::Keychain { .. } => CredentialKind::Keychain,
        }
    }
}

impl fmt::Debug for SecretDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretDescriptor::File { username, .. } => f
                .debug_struct("File")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            SecretDescriptor::Env {
                username_key,
                password_key,
            } => f
                .debug_struct("Env")
                .field("username_key", username_key)
                .field("password_key", password_key)
                .finish(),
            SecretDescriptor::PasswordManager {
                secret,
                username_field,
                password_field,
                otp_field,
                program,
            } => f
                .debug_struct("PasswordManager")
                .field("secret", secret)
                .field("username_field", username_field)
                .field("password_field", password_field)
                .field("otp_field", otp_field)
                .field("program", program)
                .finish(),
            SecretDescriptor::Keychain { service, account } => f
                .debug_struct("Keychain")
                .field("service", service)
                .field("account", account)
                .finish(),
        }
    }
}
