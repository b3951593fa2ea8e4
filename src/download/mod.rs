//! Turns a click on an "export" button into a file at a known path.
//!
//! The browser saves downloads into a scratch directory under a GUID. A
//! download goes through three steps, and each step is its own type so
//! they cannot be reordered:
//!
//! 1. [`DownloadCoordinator::arm`] subscribes to progress events
//!    *before* anything is clicked, so a fast download is never missed.
//! 2. [`ArmedDownload::trigger`] runs the caller's action.
//! 3. [`TriggeredDownload::finish`] waits for completion under the
//!    session deadline and moves the file to its final name.

mod deadline;
pub mod template;

pub use deadline::{DeadlineExceeded, SessionDeadline};
pub use template::{slugify, FilenameTemplate, TemplateContext, TemplateError, TemplateKey};

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tempfile::NamedTempFile;
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::automation::AutomationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    InProgress,
    Completed,
    Canceled,
}

/// One progress notification from the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadProgress {
    pub guid: String,
    pub state: DownloadState,
    pub received_bytes: u64,
    pub total_bytes: u64,
}

/// Source of browser download notifications.
#[async_trait]
pub trait DownloadEvents: Send + Sync {
    /// Make the browser save downloads into `scratch_dir`, named by GUID,
    /// with progress events enabled.
    async fn prepare(&self, scratch_dir: &Path) -> anyhow::Result<()>;

    /// Progress events from now on.
    async fn subscribe(&self) -> anyhow::Result<BoxStream<'static, DownloadProgress>>;
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download trigger failed: {0}")]
    Interaction(#[source] AutomationError),

    #[error("download did not complete in time")]
    Timeout(#[source] DeadlineExceeded),

    #[error("download {guid} was canceled by the browser")]
    Canceled { guid: String },

    #[error("browser reported download {guid} complete but {path} does not exist")]
    FileMissing { guid: String, path: PathBuf },

    #[error("failed to move download to {target}")]
    RelocateFailed {
        target: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("browser download events failed: {0:#}")]
    Browser(anyhow::Error),
}

/// Serializes downloads within one browser session.
pub struct DownloadCoordinator {
    events: Arc<dyn DownloadEvents>,
    scratch_dir: PathBuf,
    deadline: SessionDeadline,
    permit: Arc<Mutex<()>>,
}

impl DownloadCoordinator {
    pub fn new(
        events: Arc<dyn DownloadEvents>,
        scratch_dir: impl Into<PathBuf>,
        deadline: SessionDeadline,
    ) -> Self {
        Self {
            events,
            scratch_dir: scratch_dir.into(),
            deadline,
            permit: Arc::new(Mutex::new(())),
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn deadline(&self) -> SessionDeadline {
        self.deadline
    }

    /// Start listening for the next download.
    ///
    /// Waits for any other in-flight download in this session to finish
    /// first. The listener reports the first completed or canceled
    /// download exactly once.
    pub async fn arm(&self) -> Result<ArmedDownload, DownloadError> {
        let permit = self
            .deadline
            .timeout(self.permit.clone().lock_owned())
            .await
            .map_err(DownloadError::Timeout)?;

        std::fs::create_dir_all(&self.scratch_dir).map_err(|e| {
            DownloadError::Browser(anyhow::Error::new(e).context(format!(
                "Failed to create scratch directory {}",
                self.scratch_dir.display()
            )))
        })?;
        self.events
            .prepare(&self.scratch_dir)
            .await
            .map_err(DownloadError::Browser)?;
        let mut stream = self
            .events
            .subscribe()
            .await
            .map_err(DownloadError::Browser)?;

        let (tx, rx) = oneshot::channel();
        let listener = tokio::spawn(async move {
            while let Some(progress) = stream.next().await {
                match progress.state {
                    DownloadState::InProgress => {
                        tracing::trace!(
                            guid = %progress.guid,
                            received = progress.received_bytes,
                            total = progress.total_bytes,
                            "Download progress"
                        );
                    }
                    DownloadState::Completed | DownloadState::Canceled => {
                        let _ = tx.send(progress);
                        return;
                    }
                }
            }
        });

        tracing::debug!(scratch = %self.scratch_dir.display(), "Download listener armed");
        Ok(ArmedDownload {
            inner: InFlight {
                scratch_dir: self.scratch_dir.clone(),
                deadline: self.deadline,
                done: rx,
                listener: Listener(listener),
                _permit: permit,
            },
        })
    }

    /// Arm, trigger and finish in one call. Returns the final path.
    pub async fn download<F, Fut>(&self, target: &Path, action: F) -> Result<PathBuf, DownloadError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<(), AutomationError>> + Send,
    {
        self.arm().await?.trigger(action).await?.finish(target).await
    }
}

struct Listener(JoinHandle<()>);

impl Drop for Listener {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct InFlight {
    scratch_dir: PathBuf,
    deadline: SessionDeadline,
    done: oneshot::Receiver<DownloadProgress>,
    listener: Listener,
    _permit: OwnedMutexGuard<()>,
}

/// A listener is running; the download has not been started yet.
pub struct ArmedDownload {
    inner: InFlight,
}

impl ArmedDownload {
    /// Run the action that starts the download.
    ///
    /// A navigation abort is expected when a click turns into a download
    /// and is not an error.
    pub async fn trigger<F, Fut>(self, action: F) -> Result<TriggeredDownload, DownloadError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<(), AutomationError>> + Send,
    {
        match self.inner.deadline.timeout(action()).await {
            Ok(Ok(())) => {}
            Ok(Err(AutomationError::NavigationAborted)) => {
                tracing::debug!("Navigation aborted by download; continuing");
            }
            Ok(Err(e)) => return Err(DownloadError::Interaction(e)),
            Err(elapsed) => return Err(DownloadError::Timeout(elapsed)),
        }
        Ok(TriggeredDownload { inner: self.inner })
    }
}

/// The download has been started.
pub struct TriggeredDownload {
    inner: InFlight,
}

impl TriggeredDownload {
    /// Wait for the browser to finish and move the file to `target`.
    ///
    /// On any error nothing is written at `target`.
    pub async fn finish(self, target: &Path) -> Result<PathBuf, DownloadError> {
        let InFlight {
            scratch_dir,
            deadline,
            done,
            listener,
            _permit,
        } = self.inner;

        let progress = deadline
            .timeout(done)
            .await
            .map_err(DownloadError::Timeout)?
            .map_err(|_| {
                DownloadError::Browser(anyhow::anyhow!(
                    "download event stream ended before the download finished"
                ))
            })?;
        drop(listener);

        if progress.state == DownloadState::Canceled {
            return Err(DownloadError::Canceled {
                guid: progress.guid,
            });
        }

        let downloaded = scratch_dir.join(&progress.guid);
        if !downloaded.is_file() {
            return Err(DownloadError::FileMissing {
                guid: progress.guid,
                path: downloaded,
            });
        }

        relocate(&downloaded, target)?;
        tracing::info!(
            path = %target.display(),
            bytes = progress.received_bytes,
            "Download saved"
        );
        Ok(target.to_path_buf())
    }
}

/// Move `from` to `to` so that `to` is either absent or complete.
///
/// Falls back to copy-then-rename when a plain rename fails, e.g. when the
/// scratch directory is on another filesystem.
fn relocate(from: &Path, to: &Path) -> Result<(), DownloadError> {
    let failed = |source: std::io::Error| DownloadError::RelocateFailed {
        target: to.to_path_buf(),
        source,
    };

    let dir = match to.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(failed)?;

    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }

    let mut tmp = NamedTempFile::new_in(&dir).map_err(failed)?;
    let mut input = std::fs::File::open(from).map_err(failed)?;
    std::io::copy(&mut input, tmp.as_file_mut()).map_err(failed)?;
    tmp.as_file().sync_all().map_err(failed)?;
    tmp.persist(to).map_err(|e| failed(e.error))?;

    if let Err(e) = std::fs::remove_file(from) {
        tracing::warn!(path = %from.display(), error = %e, "Failed to remove scratch download");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    /// Events fed by the test through an unbounded channel.
    struct ChannelEvents {
        rx: StdMutex<Option<mpsc::UnboundedReceiver<DownloadProgress>>>,
    }

    fn channel_events() -> (Arc<ChannelEvents>, mpsc::UnboundedSender<DownloadProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(ChannelEvents {
                rx: StdMutex::new(Some(rx)),
            }),
            tx,
        )
    }

    #[async_trait]
    impl DownloadEvents for ChannelEvents {
        async fn prepare(&self, _scratch_dir: &Path) -> anyhow::Result<()> {
            Ok(())
        }

        async fn subscribe(&self) -> anyhow::Result<BoxStream<'static, DownloadProgress>> {
            let rx = self
                .rx
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| anyhow::anyhow!("already subscribed"))?;
            Ok(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|p| (p, rx))
            })
            .boxed())
        }
    }

    fn event(guid: &str, state: DownloadState) -> DownloadProgress {
        DownloadProgress {
            guid: guid.to_string(),
            state,
            received_bytes: 5,
            total_bytes: 5,
        }
    }

    fn coordinator(
        events: Arc<ChannelEvents>,
        scratch: &Path,
        budget: Duration,
    ) -> DownloadCoordinator {
        DownloadCoordinator::new(events, scratch, SessionDeadline::start(budget))
    }

    #[tokio::test]
    async fn moves_completed_download_to_target() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let scratch = dir.path().join("scratch");
        let target = dir.path().join("out").join("anz").join("jan.csv");
        let (events, tx) = channel_events();
        let coordinator = coordinator(events, &scratch, Duration::from_secs(5));

        let scratch_file = scratch.join("guid-1");
        let saved = coordinator
            .download(&target, || async move {
                std::fs::write(&scratch_file, "a,b\n").unwrap();
                tx.send(event("guid-1", DownloadState::InProgress)).unwrap();
                tx.send(event("guid-1", DownloadState::Completed)).unwrap();
                Err(AutomationError::NavigationAborted)
            })
            .await?;

        assert_eq!(saved, target);
        assert_eq!(std::fs::read_to_string(&target)?, "a,b\n");
        assert!(!scratch.join("guid-1").exists());
        Ok(())
    }

    #[tokio::test]
    async fn times_out_without_completion() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let target = dir.path().join("never.csv");
        let (events, _tx) = channel_events();
        let coordinator = coordinator(events, &dir.path().join("scratch"), Duration::from_millis(100));

        let err = coordinator
            .download(&target, || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Timeout(_)));
        assert!(!target.exists());
        Ok(())
    }

    #[tokio::test]
    async fn trigger_failure_is_interaction_error() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let (events, _tx) = channel_events();
        let coordinator = coordinator(events, &dir.path().join("scratch"), Duration::from_secs(5));

        let err = coordinator
            .download(&dir.path().join("x.csv"), || async {
                Err(AutomationError::ElementNotFound {
                    selector: "#export".to_string(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DownloadError::Interaction(AutomationError::ElementNotFound { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn canceled_and_missing_downloads_fail() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let target = dir.path().join("x.csv");

        let (events, tx) = channel_events();
        let canceled = coordinator(events, &dir.path().join("a"), Duration::from_secs(5));
        let err = canceled
            .download(&target, || async move {
                tx.send(event("g", DownloadState::Canceled)).unwrap();
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Canceled { .. }));

        let (events, tx) = channel_events();
        let missing = coordinator(events, &dir.path().join("b"), Duration::from_secs(5));
        let err = missing
            .download(&target, || async move {
                tx.send(event("g", DownloadState::Completed)).unwrap();
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::FileMissing { .. }));
        assert!(!target.exists());
        Ok(())
    }

    #[tokio::test]
    async fn failed_relocation_leaves_nothing_at_target() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let scratch = dir.path().join("scratch");
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory")?;
        let target = blocker.join("out.csv");

        let (events, tx) = channel_events();
        let coordinator = coordinator(events, &scratch, Duration::from_secs(5));
        let scratch_file = scratch.join("guid-1");
        let err = coordinator
            .download(&target, || async move {
                std::fs::write(&scratch_file, "a,b\n").unwrap();
                tx.send(event("guid-1", DownloadState::Completed)).unwrap();
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::RelocateFailed { .. }), "{err:?}");
        assert!(!target.exists());
        assert_eq!(std::fs::read_to_string(&blocker)?, "not a directory");
        Ok(())
    }

    #[tokio::test]
    async fn only_one_download_armed_at_a_time() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let (events, _tx) = channel_events();
        let coordinator = coordinator(events, &dir.path().join("scratch"), Duration::from_secs(5));

        let first = coordinator.arm().await?;
        let second = tokio::time::timeout(Duration::from_millis(50), coordinator.arm()).await;
        assert!(second.is_err(), "second arm should wait for the first");
        drop(first);
        Ok(())
    }

    #[test]
    fn relocate_replaces_existing_target() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let from = dir.path().join("guid");
        let to = dir.path().join("nested").join("out.csv");
        std::fs::create_dir_all(to.parent().unwrap())?;
        std::fs::write(&to, "old")?;
        std::fs::write(&from, "new")?;

        relocate(&from, &to)?;
        assert_eq!(std::fs::read_to_string(&to)?, "new");
        assert!(!from.exists());
        Ok(())
    }
}
