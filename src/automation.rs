//! Page-level actions that site scripts drive.
//!
//! [`Automation`] is what bank scripts talk to. The Chromium-backed
//! implementation lives in `browser`; tests substitute their own.

use async_trait::async_trait;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AutomationError {
    /// The page navigated away or the request was aborted. Expected when
    /// a click starts a download.
    #[error("navigation aborted")]
    NavigationAborted,

    #[error("element not found: {selector}")]
    ElementNotFound { selector: String },

    #[error("{action} on {selector} failed: {message}")]
    Interaction {
        action: &'static str,
        selector: String,
        message: String,
    },

    #[error("browser session timed out")]
    Timeout,
}

impl AutomationError {
    pub fn interaction(
        action: &'static str,
        selector: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::Interaction {
            action,
            selector: selector.into(),
            message: message.to_string(),
        }
    }
}

/// Minimal set of page interactions.
///
/// Every call is bounded by the session deadline of the implementation.
#[async_trait]
pub trait Automation: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), AutomationError>;

    /// Wait until an element matching `selector` exists.
    async fn find(&self, selector: &str) -> Result<(), AutomationError>;

    async fn click(&self, selector: &str) -> Result<(), AutomationError>;

    async fn fill(&self, selector: &str, value: &str) -> Result<(), AutomationError>;

    /// Like [`Automation::fill`], for values that must not appear in logs.
    async fn fill_sensitive(&self, selector: &str, value: &str) -> Result<(), AutomationError>;
}

/// Placeholder shown in logs instead of a sensitive value.
pub fn mask(value: &str) -> String {
    "*".repeat(value.chars().count())
}
