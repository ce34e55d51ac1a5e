//! Console presenter with optional image saving

use anyhow::{Context, Result};
use inkview_client::{LogPresenter, Presenter};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

enum Job {
    Save(String),
    Flush(oneshot::Sender<()>),
}

/// Logs loop activity, prints alerts to stderr and, when an output path is
/// set, downloads every shown image into that file.
///
/// Downloads run one at a time on a background task, so the file always ends
/// up holding the most recently shown image.
pub struct ConsolePresenter {
    log: LogPresenter,
    jobs: Option<mpsc::UnboundedSender<Job>>,
}

impl ConsolePresenter {
    /// Must be called from within a tokio runtime when `output` is set
    pub fn new(output: Option<PathBuf>, timeout: Duration) -> Result<Self> {
        let Some(output) = output else {
            return Ok(Self {
                log: LogPresenter,
                jobs: None,
            });
        };

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(format!("Inkview/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to create image download client")?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Save(url) => match save_image(&client, &url, &output).await {
                        Ok(()) => info!("Saved {} to {}", url, output.display()),
                        Err(e) => warn!("Failed to save image {}: {:#}", url, e),
                    },
                    Job::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Ok(Self {
            log: LogPresenter,
            jobs: Some(tx),
        })
    }

    /// Wait until every queued image download has finished
    pub async fn flush(&self) {
        let Some(jobs) = &self.jobs else {
            return;
        };

        let (done, wait) = oneshot::channel();
        if jobs.send(Job::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

impl Presenter for ConsolePresenter {
    fn show_image(&self, url: &str) {
        self.log.show_image(url);

        if let Some(jobs) = &self.jobs {
            let _ = jobs.send(Job::Save(url.to_string()));
        }
    }

    fn set_controls_enabled(&self, running: bool) {
        self.log.set_controls_enabled(running);
    }

    fn alert(&self, message: &str) {
        self.log.alert(message);
        eprintln!("inkview: {}", message);
    }
}

/// Download `url` into `path` via a `.partial` file and rename
async fn save_image(client: &reqwest::Client, url: &str, path: &Path) -> Result<()> {
    let response = client.get(url).send().await?.error_for_status()?;
    let bytes = response.bytes().await?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let partial = partial_path(path);
    tokio::fs::write(&partial, &bytes)
        .await
        .with_context(|| format!("failed to write {}", partial.display()))?;
    tokio::fs::rename(&partial, path).await?;

    Ok(())
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".partial");
    PathBuf::from(name)
}
