//! Chromium session driven over the DevTools protocol.
//!
//! One [`BrowserSession`] owns one browser process and one page. It
//! implements both [`Automation`] for site scripts and [`DownloadEvents`]
//! for the download coordinator. Every wait is bounded by the session's
//! [`SessionDeadline`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::{
    DownloadProgressState, EventDownloadProgress, SetDownloadBehaviorBehavior,
    SetDownloadBehaviorParams,
};
use chromiumoxide::element::Element;
use chromiumoxide::Page;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::automation::{mask, Automation, AutomationError};
use crate::download::{DownloadEvents, DownloadProgress, DownloadState, SessionDeadline};

const FIND_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Default)]
pub struct BrowserOptions {
    pub headless: bool,
    pub no_sandbox: bool,
    /// Use this executable instead of searching for Chrome/Chromium.
    pub chrome_executable: Option<PathBuf>,
}

pub struct BrowserSession {
    browser: Mutex<Option<Browser>>,
    page: Page,
    handler_task: JoinHandle<()>,
    deadline: SessionDeadline,
}

impl BrowserSession {
    /// Launch the browser and open a blank page. The deadline starts now.
    pub async fn launch(options: &BrowserOptions, budget: Duration) -> Result<Self> {
        let chrome_path = match &options.chrome_executable {
            Some(path) => path.clone(),
            None => find_chrome().map(PathBuf::from).context(
                "Chrome/Chromium not found. Please install Chrome or Chromium to download exports.",
            )?,
        };

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .viewport(None)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        if !options.headless {
            builder = builder.with_head();
        }
        if options.no_sandbox {
            builder = builder.arg("--no-sandbox");
        }
        let config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to configure browser: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("Failed to launch browser")?;
        let handler_task = tokio::spawn(async move { while (handler.next().await).is_some() {} });

        let page = browser
            .new_page("about:blank")
            .await
            .context("Failed to open browser page")?;

        tracing::info!(headless = options.headless, budget = ?budget, "Browser session started");

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            page,
            handler_task,
            deadline: SessionDeadline::start(budget),
        })
    }

    pub fn deadline(&self) -> SessionDeadline {
        self.deadline
    }

    /// Close the browser process. Later calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        if let Some(mut browser) = self.browser.lock().await.take() {
            browser.close().await.context("Failed to close browser")?;
            let _ = browser.wait().await;
        }
        self.handler_task.abort();
        Ok(())
    }

    async fn element(&self, selector: &str) -> Result<Element, AutomationError> {
        self.find(selector).await?;
        self.page
            .find_element(selector)
            .await
            .map_err(|_| AutomationError::ElementNotFound {
                selector: selector.to_string(),
            })
    }

    async fn type_into(
        &self,
        selector: &str,
        value: &str,
        shown: &str,
    ) -> Result<(), AutomationError> {
        tracing::debug!(selector, value = shown, "Filling field");
        let element = self.element(selector).await?;
        let typing = async {
            element.click().await?;
            element.type_str(value).await?;
            Ok::<_, chromiumoxide::error::CdpError>(())
        };
        match self.deadline.timeout(typing).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(classify("fill", selector, e)),
            Err(_) => Err(AutomationError::Timeout),
        }
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        self.handler_task.abort();
    }
}

fn classify(
    action: &'static str,
    selector: &str,
    error: chromiumoxide::error::CdpError,
) -> AutomationError {
    let message = error.to_string();
    if message.contains("net::ERR_ABORTED") {
        AutomationError::NavigationAborted
    } else {
        AutomationError::interaction(action, selector, message)
    }
}

#[async_trait]
impl Automation for BrowserSession {
    async fn goto(&self, url: &str) -> Result<(), AutomationError> {
        tracing::debug!(url, "Navigating");
        match self.deadline.timeout(self.page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(classify("goto", url, e)),
            Err(_) => Err(AutomationError::Timeout),
        }
    }

    async fn find(&self, selector: &str) -> Result<(), AutomationError> {
        let poll = async {
            loop {
                if self.page.find_element(selector).await.is_ok() {
                    return;
                }
                tokio::time::sleep(FIND_POLL_INTERVAL).await;
            }
        };
        self.deadline
            .timeout(poll)
            .await
            .map_err(|_| AutomationError::ElementNotFound {
                selector: selector.to_string(),
            })
    }

    async fn click(&self, selector: &str) -> Result<(), AutomationError> {
        tracing::debug!(selector, "Clicking");
        let element = self.element(selector).await?;
        match self.deadline.timeout(element.click()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(classify("click", selector, e)),
            Err(_) => Err(AutomationError::Timeout),
        }
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), AutomationError> {
        self.type_into(selector, value, value).await
    }

    async fn fill_sensitive(&self, selector: &str, value: &str) -> Result<(), AutomationError> {
        self.type_into(selector, value, &mask(value)).await
    }
}

#[async_trait]
impl DownloadEvents for BrowserSession {
    async fn prepare(&self, scratch_dir: &Path) -> Result<()> {
        let params = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::AllowAndName)
            .download_path(scratch_dir.display().to_string())
            .events_enabled(true)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build download params: {e}"))?;

        self.page
            .execute(params)
            .await
            .context("Failed to set download behavior")?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, DownloadProgress>> {
        let events = self
            .page
            .event_listener::<EventDownloadProgress>()
            .await
            .context("Failed to listen for download progress")?;

        Ok(events
            .map(|event| DownloadProgress {
                guid: event.guid.clone(),
                state: match event.state {
                    DownloadProgressState::InProgress => DownloadState::InProgress,
                    DownloadProgressState::Completed => DownloadState::Completed,
                    DownloadProgressState::Canceled => DownloadState::Canceled,
                },
                received_bytes: event.received_bytes.max(0.0) as u64,
                total_bytes: event.total_bytes.max(0.0) as u64,
            })
            .boxed())
    }
}

/// Find Chrome/Chromium executable.
fn find_chrome() -> Option<String> {
    for name in ["google-chrome", "chromium", "chromium-browser"] {
        if let Ok(output) = std::process::Command::new("which").arg(name).output() {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    return Some(path);
                }
            }
        }
    }

    let candidates = [
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
        "/run/current-system/sw/bin/google-chrome",
        "/run/current-system/sw/bin/chromium",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
    ];

    candidates
        .into_iter()
        .find(|candidate| Path::new(candidate).exists())
        .map(str::to_string)
}
