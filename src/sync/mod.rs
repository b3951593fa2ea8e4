mod orchestrator;

pub use orchestrator::{
    target_path, AccountOutcome, Orchestrator, Outcome, PlannedAccount, RunSummary, Stage,
};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use crate::automation::Automation;
use crate::credentials::ResolvedCredential;
use crate::download::DownloadCoordinator;
use crate::schedule::DateWindow;

/// What a site script needs to export one account's transactions.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub source: String,
    pub domain: Option<String>,
    pub export_format: String,
    pub account_name: String,
    pub account_number: String,
    pub window: DateWindow,
    /// Where the finished file must end up.
    pub target: PathBuf,
}

/// Drives one bank's web UI.
///
/// Scripts only know selectors and page flow. Downloads go through the
/// [`DownloadCoordinator`] so the file lands at `request.target`.
#[async_trait::async_trait]
pub trait SiteScript: Send + Sync {
    /// Registry key for this script.
    fn name(&self) -> &str;

    async fn login(
        &self,
        automation: &dyn Automation,
        domain: Option<&str>,
        credential: &ResolvedCredential,
    ) -> Result<()>;

    /// Export `request.window` for one account. Returns the saved path.
    async fn export(
        &self,
        automation: &dyn Automation,
        downloads: &DownloadCoordinator,
        request: &ExportRequest,
    ) -> Result<PathBuf>;
}

/// Site scripts by name.
#[derive(Default, Clone)]
pub struct ScriptRegistry {
    scripts: BTreeMap<String, Arc<dyn SiteScript>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts compiled into this build. None ship yet.
    pub fn builtin() -> Self {
        Self::new()
    }

    /// Add a script under its own name, replacing any previous one.
    pub fn register(&mut self, script: Arc<dyn SiteScript>) -> &mut Self {
        self.scripts.insert(script.name().to_string(), script);
        self
    }

    pub fn with(mut self, script: Arc<dyn SiteScript>) -> Self {
        self.register(script);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SiteScript>> {
        self.scripts.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.scripts.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait::async_trait]
    impl SiteScript for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn login(
            &self,
            _automation: &dyn Automation,
            _domain: Option<&str>,
            _credential: &ResolvedCredential,
        ) -> Result<()> {
            Ok(())
        }

        async fn export(
            &self,
            _automation: &dyn Automation,
            _downloads: &DownloadCoordinator,
            request: &ExportRequest,
        ) -> Result<PathBuf> {
            Ok(request.target.clone())
        }
    }

    #[test]
    fn builtin_registry_is_empty() {
        assert!(ScriptRegistry::builtin().is_empty());
    }

    #[test]
    fn scripts_are_looked_up_by_name() {
        let registry = ScriptRegistry::new()
            .with(Arc::new(Named("ing")))
            .with(Arc::new(Named("anz")));

        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["anz", "ing"]);
        assert_eq!(registry.get("anz").map(|s| s.name().to_string()), Some("anz".to_string()));
        assert!(registry.get("westpac").is_none());
    }

    #[test]
    fn registering_same_name_replaces() {
        let mut registry = ScriptRegistry::new();
        registry.register(Arc::new(Named("anz")));
        registry.register(Arc::new(Named("anz")));
        assert_eq!(registry.names().count(), 1);
    }
}
