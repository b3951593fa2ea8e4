use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::credentials::SecretDescriptor;
use crate::download::FilenameTemplate;
use crate::duration::deserialize_duration;
use crate::schedule::{SkipPolicy, Strategy};

pub const CONFIG_FILE_NAME: &str = "bankdownloader.toml";

fn default_history_file() -> PathBuf {
    PathBuf::from("history.json")
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_min_gap_days() -> u32 {
    SkipPolicy::default().min_gap_days
}

fn default_headless() -> bool {
    true
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_days_to_fetch() -> u32 {
    30
}

fn default_export_format() -> String {
    "csv".to_string()
}

fn default_output_template() -> String {
    "{{source-slug}}/{{account-slug}}-{{from}}-{{to}}.csv".to_string()
}

/// One account at a source.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    pub number: String,
    /// Overrides the source's `output_template` for this account.
    #[serde(default)]
    pub output_template: Option<String>,
}

/// A bank (or other site) to download from.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,

    /// Site script to run. Defaults to `name`.
    #[serde(default)]
    pub script: Option<String>,

    /// Site URL handed to the script.
    #[serde(default)]
    pub domain: Option<String>,

    /// Lookback for scheduling, in days.
    #[serde(default = "default_days_to_fetch")]
    pub days_to_fetch: u32,

    #[serde(default = "default_export_format")]
    pub export_format: String,

    #[serde(default = "default_output_template")]
    pub output_template: String,

    pub credentials: SecretDescriptor,

    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// Application configuration, as written in `bankdownloader.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Path to data directory. If relative, resolved from config file location.
    /// If not specified, defaults to the config file's directory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Relative to `data_dir`.
    #[serde(default = "default_history_file")]
    pub history_file: PathBuf,

    /// Relative to `data_dir`. Rendered templates land beneath it.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    #[serde(default)]
    pub strategy: Strategy,

    #[serde(default = "default_min_gap_days")]
    pub min_gap_days: u32,

    #[serde(default = "default_headless")]
    pub headless: bool,

    /// Overall budget for one browser session.
    #[serde(
        default = "default_session_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub session_timeout: Duration,

    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            history_file: default_history_file(),
            download_dir: default_download_dir(),
            strategy: Strategy::default(),
            min_gap_days: default_min_gap_days(),
            headless: default_headless(),
            session_timeout: default_session_timeout(),
            sources: Vec::new(),
        }
    }
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Resolve the data directory path.
    ///
    /// If `data_dir` is set and relative, it's resolved relative to `config_dir`.
    /// If `data_dir` is not set, returns `config_dir`.
    pub fn resolve_data_dir(&self, config_dir: &Path) -> PathBuf {
        match &self.data_dir {
            Some(data_dir) if data_dir.is_absolute() => data_dir.clone(),
            Some(data_dir) => config_dir.join(data_dir),
            None => config_dir.to_path_buf(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedAccount {
    pub name: String,
    pub number: String,
    pub template: FilenameTemplate,
}

#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub name: String,
    pub script: String,
    pub domain: Option<String>,
    pub days_to_fetch: u32,
    pub export_format: String,
    pub credentials: SecretDescriptor,
    pub accounts: Vec<ResolvedAccount>,
}

/// Loaded configuration with resolved paths and compiled templates.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub data_dir: PathBuf,
    pub history_path: PathBuf,
    pub download_dir: PathBuf,
    pub strategy: Strategy,
    pub skip_policy: SkipPolicy,
    pub headless: bool,
    pub session_timeout: Duration,
    pub sources: Vec<ResolvedSource>,
}

/// Returns the default config file path.
///
/// Resolution order:
/// 1. `./bankdownloader.toml` if it exists in current directory
/// 2. `~/.local/share/bankdownloader/bankdownloader.toml` (XDG data directory)
pub fn default_config_path() -> PathBuf {
    let local_config = PathBuf::from(CONFIG_FILE_NAME);
    if local_config.exists() {
        return local_config;
    }

    if let Some(data_dir) = dirs::data_dir() {
        return data_dir.join("bankdownloader").join(CONFIG_FILE_NAME);
    }

    local_config
}

impl ResolvedConfig {
    /// Load and resolve config from a file path.
    ///
    /// Paths are resolved relative to the config file's parent directory.
    pub fn load(config_path: &Path) -> Result<Self> {
        let config_path = config_path
            .canonicalize()
            .with_context(|| format!("Config file not found: {}", config_path.display()))?;

        let config_dir = config_path
            .parent()
            .context("Config file has no parent directory")?;

        let config = Config::load(&config_path)?;
        Self::resolve(config, config_dir)
            .with_context(|| format!("Invalid config file: {}", config_path.display()))
    }

    /// Validate `config` and resolve its paths against `config_dir`.
    pub fn resolve(config: Config, config_dir: &Path) -> Result<Self> {
        let data_dir = config.resolve_data_dir(config_dir);

        let mut seen = HashSet::new();
        let mut sources = Vec::with_capacity(config.sources.len());
        for source in config.sources {
            if !seen.insert(source.name.trim().to_string()) {
                anyhow::bail!("Duplicate source name {:?}", source.name.trim());
            }
            sources.push(resolve_source(source)?);
        }

        Ok(Self {
            history_path: data_dir.join(&config.history_file),
            download_dir: data_dir.join(&config.download_dir),
            data_dir,
            strategy: config.strategy,
            skip_policy: SkipPolicy {
                min_gap_days: config.min_gap_days,
            },
            headless: config.headless,
            session_timeout: config.session_timeout,
            sources,
        })
    }

    /// Replace the history location, e.g. from `--history`.
    pub fn with_history_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.history_path = path.into();
        self
    }

    pub fn source(&self, name: &str) -> Option<&ResolvedSource> {
        self.sources.iter().find(|s| s.name == name)
    }
}

fn resolve_source(source: SourceConfig) -> Result<ResolvedSource> {
    let name = source.name.trim().to_string();
    if name.is_empty() {
        anyhow::bail!("Source name must not be empty");
    }
    if source.days_to_fetch == 0 {
        anyhow::bail!("Source {name:?}: days_to_fetch must be at least 1");
    }

    let default_template = FilenameTemplate::parse(&source.output_template)
        .with_context(|| format!("Source {name:?}: invalid output_template"))?;

    let mut numbers = HashSet::new();
    let mut accounts = Vec::with_capacity(source.accounts.len());
    for account in source.accounts {
        let number = account.number.trim().to_string();
        if number.is_empty() {
            anyhow::bail!("Source {name:?}: account {:?} has no number", account.name);
        }
        if !numbers.insert(number.clone()) {
            anyhow::bail!("Source {name:?}: duplicate account number {number:?}");
        }
        let template = match &account.output_template {
            Some(template) => FilenameTemplate::parse(template).with_context(|| {
                format!(
                    "Source {name:?}: account {:?}: invalid output_template",
                    account.name
                )
            })?,
            None => default_template.clone(),
        };
        accounts.push(ResolvedAccount {
            name: account.name,
            number,
            template,
        });
    }

    if accounts.is_empty() {
        tracing::warn!(source = %name, "Source has no accounts configured");
    }

    Ok(ResolvedSource {
        script: source.script.unwrap_or_else(|| name.clone()),
        name,
        domain: source.domain,
        days_to_fetch: source.days_to_fetch,
        export_format: source.export_format,
        credentials: source.credentials,
        accounts,
    })
}

/// Commented config written by `bankdownloader init`.
pub const STARTER_CONFIG: &str = r#"# bankdownloader configuration

# Paths are relative to this file unless absolute.
# data_dir = "."
history_file = "history.json"
download_dir = "downloads"

# "since-last-download" continues from the last recorded fetch;
# "days-ago" always fetches the last days_to_fetch days.
strategy = "since-last-download"
min_gap_days = 1

headless = true
session_timeout = "60s"

[[sources]]
name = "example-bank"
# script = "example-bank"
domain = "https://bank.example.com"
days_to_fetch = 30
export_format = "csv"
output_template = "{{source-slug}}/{{account-slug}}-{{from}}-{{to}}.csv"

[sources.credentials]
type = "env"
username_key = "EXAMPLE_BANK_USERNAME"
password_key = "EXAMPLE_BANK_PASSWORD"

[[sources.accounts]]
name = "Everyday"
number = "000000000"
"#;

/// Write [`STARTER_CONFIG`] to `path` unless a file is already there.
///
/// Returns `false` if the file existed.
pub fn write_starter_config(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, STARTER_CONFIG)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;
    Ok(true)
}
