//! Durable recorder for findings and stats snapshots.
//!
//! Findings go to an append-only JSON Lines file. The stats snapshot is a single JSON
//! document replaced atomically through a temporary file and a rename.

use crate::types::{Finding, Stats};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;
use tracing::{debug, info, instrument, warn};

/// Failure writing to durable storage.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("partial append to {path}, not retried: {source}")]
    PartialAppend { path: PathBuf, source: io::Error },
    #[error("failed to sync {path}: {source}")]
    Sync { path: PathBuf, source: io::Error },
    #[error("failed to replace {path}: {source}")]
    Rename { path: PathBuf, source: io::Error },
}

impl RecorderError {
    /// True when nothing reached the file, so another attempt cannot duplicate a record.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RecorderError::Open { .. } | RecorderError::Write { .. })
    }
}

/// Formal contract for durable output.
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Append one finding. Never reorders or deduplicates.
    async fn append_finding(&self, finding: &Finding) -> Result<(), RecorderError>;

    /// Replace the stored snapshot. Last write wins.
    async fn write_snapshot(&self, stats: &Stats) -> Result<(), RecorderError>;
}

/// File-backed recorder.
pub struct FileRecorder {
    findings_path: PathBuf,
    snapshot_path: PathBuf,
    append_attempts: usize,
    retry_delay: Duration,
    append_lock: Mutex<()>,
    snapshot_lock: Mutex<()>,
}

impl FileRecorder {
    pub fn new(findings_path: impl AsRef<Path>, snapshot_path: impl AsRef<Path>) -> Self {
        Self {
            findings_path: findings_path.as_ref().to_path_buf(),
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
            append_attempts: 3,
            retry_delay: Duration::from_millis(250),
            append_lock: Mutex::new(()),
            snapshot_lock: Mutex::new(()),
        }
    }

    /// Set how many times an append is attempted in total.
    pub fn with_append_attempts(mut self, attempts: usize) -> Self {
        self.append_attempts = attempts.max(1);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn findings_path(&self) -> &Path {
        &self.findings_path
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    async fn try_append(&self, line: &[u8]) -> Result<(), RecorderError> {
        let path = &self.findings_path;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|source| RecorderError::Open {
                path: path.clone(),
                source,
            })?;

        let len_before = file
            .metadata()
            .await
            .map_err(|source| RecorderError::Open {
                path: path.clone(),
                source,
            })?
            .len();

        if let Err(source) = file.write_all(line).await {
            let len_after = file.metadata().await.map(|m| m.len()).ok();
            return Err(if len_after == Some(len_before) {
                RecorderError::Write {
                    path: path.clone(),
                    source,
                }
            } else {
                RecorderError::PartialAppend {
                    path: path.clone(),
                    source,
                }
            });
        }

        file.sync_data().await.map_err(|source| RecorderError::Sync {
            path: path.clone(),
            source,
        })
    }
}

#[async_trait]
impl Recorder for FileRecorder {
    #[instrument(skip(self, finding), fields(address = %finding.address))]
    async fn append_finding(&self, finding: &Finding) -> Result<(), RecorderError> {
        let mut line = serde_json::to_vec(finding)?;
        line.push(b'\n');

        let _guard = self.append_lock.lock().await;
        let strategy = FixedInterval::new(self.retry_delay).take(self.append_attempts - 1);

        RetryIf::spawn(
            strategy,
            || self.try_append(&line),
            |e: &RecorderError| {
                if e.is_retryable() {
                    warn!("Finding append failed, retrying: {}", e);
                }
                e.is_retryable()
            },
        )
        .await?;

        info!("Finding appended to {}", self.findings_path.display());
        Ok(())
    }

    #[instrument(skip(self, stats))]
    async fn write_snapshot(&self, stats: &Stats) -> Result<(), RecorderError> {
        let json = serde_json::to_vec_pretty(stats)?;
        let path = &self.snapshot_path;
        let tmp_path = tmp_path_for(path);

        let _guard = self.snapshot_lock.lock().await;

        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|source| RecorderError::Open {
                path: tmp_path.clone(),
                source,
            })?;
        file.write_all(&json)
            .await
            .map_err(|source| RecorderError::Write {
                path: tmp_path.clone(),
                source,
            })?;
        file.sync_all().await.map_err(|source| RecorderError::Sync {
            path: tmp_path.clone(),
            source,
        })?;
        drop(file);

        fs::rename(&tmp_path, path)
            .await
            .map_err(|source| RecorderError::Rename {
                path: path.clone(),
                source,
            })?;

        debug!("Snapshot written to {}", path.display());
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "snapshot".into());
    name.push(".tmp");
    path.with_file_name(name)
}

/// Load the stored snapshot.
///
/// A missing, unreadable or unparseable file yields zeroed stats; startup never fails
/// on a bad snapshot.
pub async fn load_snapshot(path: impl AsRef<Path>) -> Stats {
    let path = path.as_ref();

    let raw = match fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("No snapshot at {}, starting from zero", path.display());
            return Stats::default();
        }
        Err(e) => {
            warn!("Failed to read snapshot {}: {}. Starting from zero", path.display(), e);
            return Stats::default();
        }
    };

    match serde_json::from_slice::<Stats>(&raw) {
        Ok(stats) => {
            let stats = stats.normalized();
            info!(
                "Loaded snapshot from {}: {} success, {} failed",
                path.display(),
                stats.success,
                stats.fail
            );
            stats
        }
        Err(e) => {
            warn!("Snapshot {} is corrupted: {}. Starting from zero", path.display(), e);
            Stats::default()
        }
    }
}
