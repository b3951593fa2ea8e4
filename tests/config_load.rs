use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use bankdownloader::config::ResolvedConfig;
use bankdownloader::credentials::{CredentialKind, SecretDescriptor};
use bankdownloader::schedule::Strategy;
use tempfile::TempDir;

const FULL_CONFIG: &str = r#"
data_dir = "data"
history_file = "state/history.json"
download_dir = "/srv/exports"
strategy = "days-ago"
min_gap_days = 2
headless = false
session_timeout = "5m"

[[sources]]
name = "anz"
script = "anz-internet-banking"
days_to_fetch = 14

[sources.credentials]
type = "password-manager"
secret = "banks/anz"
otp_field = "totp"
program = "gopass"

[[sources.accounts]]
name = "Everyday"
number = "111"

[[sources]]
name = "ing"

[sources.credentials]
type = "keychain"
service = "ing"
account = "someone@example.com"

[[sources.accounts]]
name = "Orange Everyday"
number = "222"
output_template = "ing/{{number}}.csv"
"#;

#[test]
fn loads_full_config_relative_to_file() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("bankdownloader.toml");
    std::fs::write(&path, FULL_CONFIG)?;

    let config = ResolvedConfig::load(&path)?;
    let root = dir.path().canonicalize()?;

    assert_eq!(config.data_dir, root.join("data"));
    assert_eq!(config.history_path, root.join("data/state/history.json"));
    assert_eq!(config.download_dir, PathBuf::from("/srv/exports"));
    assert_eq!(config.strategy, Strategy::DaysAgo);
    assert_eq!(config.skip_policy.min_gap_days, 2);
    assert!(!config.headless);
    assert_eq!(config.session_timeout, Duration::from_secs(300));

    let anz = config.source("anz").expect("anz");
    assert_eq!(anz.script, "anz-internet-banking");
    assert_eq!(anz.credentials.kind(), CredentialKind::PasswordManagerTotp);
    match &anz.credentials {
        SecretDescriptor::PasswordManager {
            username_field,
            password_field,
            program,
            ..
        } => {
            assert_eq!(username_field, "username");
            assert_eq!(password_field, "password");
            assert_eq!(program, "gopass");
        }
        other => panic!("unexpected descriptor {other:?}"),
    }

    let ing = config.source("ing").expect("ing");
    assert_eq!(ing.script, "ing");
    assert_eq!(ing.days_to_fetch, 30);
    assert_eq!(ing.export_format, "csv");
    assert_eq!(ing.accounts[0].template.as_str(), "ing/{{number}}.csv");
    assert_eq!(ing.credentials.kind(), CredentialKind::Keychain);
    Ok(())
}

#[test]
fn history_override_replaces_configured_path() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("bankdownloader.toml");
    std::fs::write(&path, FULL_CONFIG)?;

    let config = ResolvedConfig::load(&path)?.with_history_path("/tmp/elsewhere.json");
    assert_eq!(config.history_path, PathBuf::from("/tmp/elsewhere.json"));
    Ok(())
}

#[test]
fn malformed_template_is_rejected_at_startup() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("bankdownloader.toml");
    std::fs::write(
        &path,
        FULL_CONFIG.replace("ing/{{number}}.csv", "ing/{{number}.csv"),
    )?;

    let err = ResolvedConfig::load(&path).unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("Orange Everyday"), "{message}");
    assert!(message.contains("unclosed placeholder"), "{message}");
    Ok(())
}

#[test]
fn missing_config_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    assert!(ResolvedConfig::load(&dir.path().join("nope.toml")).is_err());
}
