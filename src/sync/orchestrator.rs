//! Runs every configured source/account once, recording what was fetched.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::automation::Automation;
use crate::config::{ResolvedAccount, ResolvedConfig, ResolvedSource};
use crate::credentials::CredentialResolver;
use crate::download::{DownloadCoordinator, TemplateContext};
use crate::history::{HistoryEvent, HistoryStore};
use crate::schedule::{DateWindow, ScheduleDecision, ScheduleError, Scheduler, SkipReason, Strategy};

use super::{ExportRequest, ScriptRegistry};

/// Where in the per-account pipeline something went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Schedule,
    Credentials,
    Script,
    Login,
    Export,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Schedule => "schedule",
            Stage::Credentials => "credentials",
            Stage::Script => "script",
            Stage::Login => "login",
            Stage::Export => "export",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Downloaded { path: PathBuf, window: DateWindow },
    Skipped { reason: SkipReason },
    Failed { stage: Stage, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountOutcome {
    pub source: String,
    pub account_name: String,
    pub account_number: String,
    pub outcome: Outcome,
}

/// Per-account results of one run, in config order.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub outcomes: Vec<AccountOutcome>,
}

impl RunSummary {
    /// Accounts a download was attempted for.
    pub fn attempted(&self) -> usize {
        self.outcomes.len() - self.skipped()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Downloaded { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Failed { .. }))
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }

    fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.outcome)).count()
    }
}

/// One row of a dry run.
#[derive(Debug)]
pub struct PlannedAccount {
    pub source: String,
    pub account_name: String,
    pub account_number: String,
    pub decision: Result<ScheduleDecision, ScheduleError>,
    /// Rendered destination when the decision is a fetch.
    pub target: Option<PathBuf>,
}

/// Destination for one account's export: the rendered template under
/// `download_dir`.
pub fn target_path(
    download_dir: &Path,
    source: &ResolvedSource,
    account: &ResolvedAccount,
    window: DateWindow,
) -> PathBuf {
    let ctx = TemplateContext::new(&source.name, &account.name, &account.number, window);
    download_dir.join(account.template.render(&ctx))
}

pub struct Orchestrator {
    config: ResolvedConfig,
    registry: ScriptRegistry,
    resolver: CredentialResolver,
    scheduler: Scheduler,
    strategy: Strategy,
}

impl Orchestrator {
    pub fn new(config: ResolvedConfig, registry: ScriptRegistry) -> Self {
        let scheduler = Scheduler::default().with_policy(config.skip_policy);
        let strategy = config.strategy;
        Self {
            config,
            registry,
            resolver: CredentialResolver::new(),
            scheduler,
            strategy,
        }
    }

    pub fn with_resolver(mut self, resolver: CredentialResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Override the configured strategy for this run.
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    fn decide(
        &self,
        history: &HistoryStore,
        source: &ResolvedSource,
        account: &ResolvedAccount,
    ) -> Result<ScheduleDecision, ScheduleError> {
        self.scheduler.next_window(
            history,
            &source.name,
            &account.number,
            source.days_to_fetch,
            self.strategy,
        )
    }

    /// What a run would do right now, without opening a browser.
    pub fn plan(&self, history: &HistoryStore) -> Vec<PlannedAccount> {
        let mut planned = Vec::new();
        for source in &self.config.sources {
            for account in &source.accounts {
                let decision = self.decide(history, source, account);
                let target = decision
                    .as_ref()
                    .ok()
                    .and_then(ScheduleDecision::window)
                    .map(|window| target_path(&self.config.download_dir, source, account, window));
                planned.push(PlannedAccount {
                    source: source.name.clone(),
                    account_name: account.name.clone(),
                    account_number: account.number.clone(),
                    decision,
                    target,
                });
            }
        }
        planned
    }

    /// Process every source serially.
    ///
    /// Per-account failures are collected in the summary. Only a failure
    /// to persist history aborts the run.
    pub async fn run(
        &self,
        history: &mut HistoryStore,
        automation: &dyn Automation,
        downloads: &DownloadCoordinator,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        for source in &self.config.sources {
            self.run_source(source, history, automation, downloads, &mut summary)
                .await?;
        }

        tracing::info!(
            attempted = summary.attempted(),
            succeeded = summary.succeeded(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            "Run finished"
        );
        Ok(summary)
    }

    async fn run_source(
        &self,
        source: &ResolvedSource,
        history: &mut HistoryStore,
        automation: &dyn Automation,
        downloads: &DownloadCoordinator,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let push = |summary: &mut RunSummary, account: &ResolvedAccount, outcome: Outcome| {
            log_outcome(&source.name, &account.number, &outcome);
            summary.outcomes.push(AccountOutcome {
                source: source.name.clone(),
                account_name: account.name.clone(),
                account_number: account.number.clone(),
                outcome,
            });
        };

        // Schedule first so a source with nothing to fetch never logs in.
        let mut pending = Vec::new();
        for account in &source.accounts {
            match self.decide(history, source, account) {
                Ok(ScheduleDecision::Fetch(window)) => pending.push((account, window)),
                Ok(ScheduleDecision::Skip(reason)) => {
                    push(summary, account, Outcome::Skipped { reason })
                }
                Err(e) => push(
                    summary,
                    account,
                    Outcome::Failed {
                        stage: Stage::Schedule,
                        error: e.to_string(),
                    },
                ),
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        let fail_all = |summary: &mut RunSummary, stage: Stage, error: String| {
            for (account, _) in &pending {
                push(
                    summary,
                    *account,
                    Outcome::Failed {
                        stage,
                        error: error.clone(),
                    },
                );
            }
        };

        let credential = match self.resolver.resolve(&source.credentials).await {
            Ok(credential) => credential,
            Err(e) => {
                fail_all(summary, Stage::Credentials, e.to_string());
                return Ok(());
            }
        };

        let Some(script) = self.registry.get(&source.script) else {
            fail_all(
                summary,
                Stage::Script,
                format!("no site script named {:?}", source.script),
            );
            return Ok(());
        };

        tracing::info!(source = %source.name, script = %source.script, "Logging in");
        if let Err(e) = script
            .login(automation, source.domain.as_deref(), &credential)
            .await
        {
            fail_all(summary, Stage::Login, format!("{e:#}"));
            return Ok(());
        }

        for (account, window) in &pending {
            let request = ExportRequest {
                source: source.name.clone(),
                domain: source.domain.clone(),
                export_format: source.export_format.clone(),
                account_name: account.name.clone(),
                account_number: account.number.clone(),
                window: *window,
                target: target_path(&self.config.download_dir, source, account, *window),
            };

            tracing::info!(
                source = %source.name,
                account = %account.number,
                from = %window.from,
                to = %window.to,
                "Exporting"
            );
            let outcome = match script.export(automation, downloads, &request).await {
                Ok(path) => {
                    history.record(HistoryEvent::new(&source.name, &account.number, window.to));
                    history
                        .save()
                        .context("Failed to save history after a successful download")?;
                    Outcome::Downloaded {
                        path,
                        window: *window,
                    }
                }
                Err(e) => Outcome::Failed {
                    stage: Stage::Export,
                    error: format!("{e:#}"),
                },
            };
            push(summary, *account, outcome);
        }

        Ok(())
    }
}

fn log_outcome(source: &str, account: &str, outcome: &Outcome) {
    match outcome {
        Outcome::Downloaded { path, window } => tracing::info!(
            source,
            account,
            path = %path.display(),
            window = %window,
            "Downloaded"
        ),
        Outcome::Skipped { reason } => tracing::info!(source, account, %reason, "Skipped"),
        Outcome::Failed { stage, error } => {
            tracing::warn!(source, account, %stage, error = %error, "Failed")
        }
    }
}
