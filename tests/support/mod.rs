#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use bankdownloader::automation::{mask, Automation, AutomationError};
use bankdownloader::config::{Config, ResolvedConfig};
use bankdownloader::credentials::{CredentialResolver, EnvLookup, ResolvedCredential};
use bankdownloader::download::{DownloadCoordinator, DownloadEvents, DownloadProgress, DownloadState};
use bankdownloader::sync::{ExportRequest, SiteScript};
use futures::stream::BoxStream;
use futures::StreamExt;
use secrecy::ExposeSecret;
use tokio::sync::mpsc;

/// In-memory stand-in for a browser page.
///
/// Clicking a selector registered with [`FakeBrowser::with_download_on`]
/// writes a file into the scratch directory and reports it complete, the
/// way Chromium does with `allowAndName`.
#[derive(Default)]
pub struct FakeBrowser {
    actions: Mutex<Vec<String>>,
    download_selectors: Mutex<HashSet<String>>,
    missing: Mutex<HashSet<String>>,
    silent: Mutex<bool>,
    scratch: Mutex<Option<PathBuf>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DownloadProgress>>>,
    next_guid: AtomicUsize,
}

impl FakeBrowser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_download_on(self: Arc<Self>, selector: &str) -> Arc<Self> {
        self.download_selectors
            .lock()
            .unwrap()
            .insert(selector.to_string());
        self
    }

    pub fn with_missing(self: Arc<Self>, selector: &str) -> Arc<Self> {
        self.missing.lock().unwrap().insert(selector.to_string());
        self
    }

    /// Downloads start but never report completion.
    pub fn silent(self: Arc<Self>) -> Arc<Self> {
        *self.silent.lock().unwrap() = true;
        self
    }

    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().unwrap().clone()
    }

    fn record(&self, action: String) {
        self.actions.lock().unwrap().push(action);
    }

    fn check(&self, selector: &str) -> Result<(), AutomationError> {
        if self.missing.lock().unwrap().contains(selector) {
            return Err(AutomationError::ElementNotFound {
                selector: selector.to_string(),
            });
        }
        Ok(())
    }

    fn emit_download(&self, contents: &str) -> Result<(), AutomationError> {
        let guid = format!("guid-{}", self.next_guid.fetch_add(1, Ordering::SeqCst));
        let scratch = self
            .scratch
            .lock()
            .unwrap()
            .clone()
            .expect("download behavior not prepared");
        std::fs::write(scratch.join(&guid), contents).unwrap();

        if *self.silent.lock().unwrap() {
            return Err(AutomationError::NavigationAborted);
        }
        let subscribers = self.subscribers.lock().unwrap();
        for state in [DownloadState::InProgress, DownloadState::Completed] {
            for tx in subscribers.iter() {
                let _ = tx.send(DownloadProgress {
                    guid: guid.clone(),
                    state,
                    received_bytes: contents.len() as u64,
                    total_bytes: contents.len() as u64,
                });
            }
        }
        // Chromium aborts the navigation a download click started.
        Err(AutomationError::NavigationAborted)
    }
}

#[async_trait]
impl Automation for FakeBrowser {
    async fn goto(&self, url: &str) -> Result<(), AutomationError> {
        self.record(format!("goto {url}"));
        Ok(())
    }

    async fn find(&self, selector: &str) -> Result<(), AutomationError> {
        self.check(selector)
    }

    async fn click(&self, selector: &str) -> Result<(), AutomationError> {
        self.check(selector)?;
        self.record(format!("click {selector}"));
        if self.download_selectors.lock().unwrap().contains(selector) {
            return self.emit_download("date,amount,description\n2024-03-01,-10.00,Coffee\n");
        }
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), AutomationError> {
        self.check(selector)?;
        self.record(format!("fill {selector} {value}"));
        Ok(())
    }

    async fn fill_sensitive(&self, selector: &str, value: &str) -> Result<(), AutomationError> {
        self.check(selector)?;
        self.record(format!("fill {selector} {}", mask(value)));
        Ok(())
    }
}

#[async_trait]
impl DownloadEvents for FakeBrowser {
    async fn prepare(&self, scratch_dir: &Path) -> Result<()> {
        *self.scratch.lock().unwrap() = Some(scratch_dir.to_path_buf());
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, DownloadProgress>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|p| (p, rx))
        })
        .boxed())
    }
}

/// Site script against [`FakeBrowser`] selectors.
#[derive(Default)]
pub struct FakeScript {
    pub name: String,
    pub fail_login: bool,
    pub fail_accounts: HashSet<String>,
    pub logins: Mutex<Vec<String>>,
    pub requests: Mutex<Vec<ExportRequest>>,
}

impl FakeScript {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn failing_login(mut self) -> Self {
        self.fail_login = true;
        self
    }

    pub fn failing_account(mut self, number: &str) -> Self {
        self.fail_accounts.insert(number.to_string());
        self
    }

    pub fn requests(&self) -> Vec<ExportRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SiteScript for FakeScript {
    fn name(&self) -> &str {
        &self.name
    }

    async fn login(
        &self,
        automation: &dyn Automation,
        domain: Option<&str>,
        credential: &ResolvedCredential,
    ) -> Result<()> {
        self.logins
            .lock()
            .unwrap()
            .push(credential.username().to_string());
        if self.fail_login {
            anyhow::bail!("invalid username or password");
        }
        automation.goto(domain.unwrap_or("about:blank")).await?;
        automation.fill("#username", credential.username()).await?;
        automation
            .fill_sensitive("#password", credential.password().expose_secret())
            .await?;
        automation.click("#login").await?;
        Ok(())
    }

    async fn export(
        &self,
        automation: &dyn Automation,
        downloads: &DownloadCoordinator,
        request: &ExportRequest,
    ) -> Result<PathBuf> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail_accounts.contains(&request.account_number) {
            anyhow::bail!("export form rejected the date range");
        }
        automation
            .fill("#from", &request.window.from.to_string())
            .await?;
        automation.fill("#to", &request.window.to.to_string()).await?;
        let path = downloads
            .download(&request.target, || automation.click("#export"))
            .await?;
        Ok(path)
    }
}

pub fn env(pairs: &[(&str, &str)]) -> EnvLookup {
    let vars: std::collections::HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Arc::new(move |key: &str| vars.get(key).cloned())
}

pub fn resolver() -> CredentialResolver {
    CredentialResolver::new().with_env(env(&[
        ("ANZ_USERNAME", "someone"),
        ("ANZ_PASSWORD", "hunter2"),
    ]))
}

pub const ANZ_CONFIG: &str = r#"
strategy = "since-last-download"

[[sources]]
name = "anz"
domain = "https://anz.example.com"
days_to_fetch = 30
output_template = "{{source-slug}}/{{account-slug}}-{{from}}-{{to}}.csv"

[sources.credentials]
type = "env"
username_key = "ANZ_USERNAME"
password_key = "ANZ_PASSWORD"

[[sources.accounts]]
name = "My Account"
number = "123456789"

[[sources.accounts]]
name = "Savings"
number = "987654321"
"#;

pub fn resolved_config(toml_text: &str, dir: &Path) -> Result<ResolvedConfig> {
    let config: Config = toml::from_str(toml_text)?;
    ResolvedConfig::resolve(config, dir)
}
