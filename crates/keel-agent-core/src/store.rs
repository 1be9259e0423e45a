use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::state::{Checkpoint, State};

const MAX_THREAD_ID_LEN: usize = 128;

/// Listing entry for a stored thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSummary {
    #[serde(rename = "threadId")]
    pub thread_id: String,
    pub version: u64,
    #[serde(rename = "messageCount")]
    pub message_count: usize,
    pub pending: bool,
}

impl ThreadSummary {
    fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self {
            thread_id: checkpoint.thread_id.clone(),
            version: checkpoint.version,
            message_count: checkpoint.state.messages.len(),
            pending: checkpoint.state.pending.is_some(),
        }
    }
}

/// Versioned, thread-keyed checkpoint persistence. Writers must present the
/// version they read (`0` for a new thread); a mismatch is [`StoreError::Stale`].
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>, StoreError>;

    async fn put(
        &self,
        thread_id: &str,
        expected_version: u64,
        state: &State,
    ) -> Result<u64, StoreError>;

    /// Newest first.
    async fn history(
        &self,
        thread_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Checkpoint>, StoreError>;

    async fn list_threads(&self) -> Result<Vec<ThreadSummary>, StoreError>;

    /// Returns whether the thread existed.
    async fn delete_thread(&self, thread_id: &str) -> Result<bool, StoreError>;
}

pub type StateStoreRef = Arc<dyn StateStore>;

pub fn validate_thread_id(thread_id: &str) -> Result<(), StoreError> {
    let valid = !thread_id.is_empty()
        && thread_id.len() <= MAX_THREAD_ID_LEN
        && thread_id != "."
        && thread_id != ".."
        && thread_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidThreadId(thread_id.to_string()))
    }
}

fn check_version(thread_id: &str, expected: u64, actual: u64) -> Result<(), StoreError> {
    if expected == actual {
        return Ok(());
    }
    Err(StoreError::Stale {
        thread_id: thread_id.to_string(),
        expected,
        actual,
    })
}

fn newest_first(mut lineage: Vec<Checkpoint>, limit: Option<usize>) -> Vec<Checkpoint> {
    lineage.reverse();
    if let Some(limit) = limit {
        lineage.truncate(limit);
    }
    lineage
}

/// Keeps every checkpoint of every thread in process memory.
#[derive(Default)]
pub struct MemoryStateStore {
    threads: RwLock<HashMap<String, Vec<Checkpoint>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        validate_thread_id(thread_id)?;
        let threads = self.threads.read().await;
        Ok(threads
            .get(thread_id)
            .and_then(|lineage| lineage.last())
            .cloned())
    }

    async fn put(
        &self,
        thread_id: &str,
        expected_version: u64,
        state: &State,
    ) -> Result<u64, StoreError> {
        validate_thread_id(thread_id)?;
        let mut threads = self.threads.write().await;
        let current = threads
            .get(thread_id)
            .and_then(|lineage| lineage.last())
            .map(|checkpoint| checkpoint.version)
            .unwrap_or(0);
        check_version(thread_id, expected_version, current)?;

        let version = current + 1;
        threads.entry(thread_id.to_string()).or_default().push(Checkpoint {
            thread_id: thread_id.to_string(),
            version,
            state: state.clone(),
        });
        debug!(thread_id, version, "checkpoint stored in memory");
        Ok(version)
    }

    async fn history(
        &self,
        thread_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Checkpoint>, StoreError> {
        validate_thread_id(thread_id)?;
        let threads = self.threads.read().await;
        let lineage = threads.get(thread_id).cloned().unwrap_or_default();
        Ok(newest_first(lineage, limit))
    }

    async fn list_threads(&self) -> Result<Vec<ThreadSummary>, StoreError> {
        let threads = self.threads.read().await;
        let mut summaries = threads
            .values()
            .filter_map(|lineage| lineage.last())
            .map(ThreadSummary::from_checkpoint)
            .collect::<Vec<_>>();
        summaries.sort_by(|left, right| left.thread_id.cmp(&right.thread_id));
        Ok(summaries)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<bool, StoreError> {
        validate_thread_id(thread_id)?;
        Ok(self.threads.write().await.remove(thread_id).is_some())
    }
}

/// One `<thread_id>.jsonl` file per thread, one checkpoint per line,
/// append-only.
pub struct JsonlStateStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn thread_path(&self, thread_id: &str) -> Result<PathBuf, StoreError> {
        validate_thread_id(thread_id)?;
        Ok(self.dir.join(format!("{thread_id}.jsonl")))
    }

    async fn read_raw(path: &Path) -> Result<String, StoreError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(content),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(error) => Err(error.into()),
        }
    }

    async fn read_lineage(&self, path: &Path) -> Result<Vec<Checkpoint>, StoreError> {
        let content = Self::read_raw(path).await?;
        Ok(parse_lineage(path, &content)?.checkpoints)
    }
}

struct ParsedLineage {
    checkpoints: Vec<Checkpoint>,
    /// Byte length of the file without a torn trailing line.
    intact_len: usize,
}

/// A crash mid-append can leave a partial final line; it is skipped so the
/// previous checkpoint stays current. Corruption anywhere else is an error.
fn parse_lineage(path: &Path, content: &str) -> Result<ParsedLineage, StoreError> {
    let lines = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>();
    let mut checkpoints = Vec::with_capacity(lines.len());
    let mut intact_len = content.len();
    for (index, line) in lines.iter().enumerate() {
        match serde_json::from_str::<Checkpoint>(line) {
            Ok(checkpoint) => checkpoints.push(checkpoint),
            Err(error) if index + 1 == lines.len() => {
                warn!(
                    path = %path.display(),
                    error = %error,
                    "ignoring truncated trailing checkpoint line"
                );
                intact_len = content
                    .trim_end()
                    .rfind('\n')
                    .map(|newline| newline + 1)
                    .unwrap_or(0);
            }
            Err(error) => return Err(error.into()),
        }
    }
    Ok(ParsedLineage {
        checkpoints,
        intact_len,
    })
}

#[async_trait]
impl StateStore for JsonlStateStore {
    async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let path = self.thread_path(thread_id)?;
        Ok(self.read_lineage(&path).await?.pop())
    }

    async fn put(
        &self,
        thread_id: &str,
        expected_version: u64,
        state: &State,
    ) -> Result<u64, StoreError> {
        let path = self.thread_path(thread_id)?;
        let _guard = self.write_lock.lock().await;

        let content = Self::read_raw(&path).await?;
        let parsed = parse_lineage(&path, &content)?;
        let current = parsed
            .checkpoints
            .last()
            .map(|checkpoint| checkpoint.version)
            .unwrap_or(0);
        check_version(thread_id, expected_version, current)?;

        let version = current + 1;
        let checkpoint = Checkpoint {
            thread_id: thread_id.to_string(),
            version,
            state: state.clone(),
        };
        let mut line = String::new();
        let intact = &content[..parsed.intact_len];
        if !intact.is_empty() && !intact.ends_with('\n') {
            line.push('\n');
        }
        line.push_str(&serde_json::to_string(&checkpoint)?);
        line.push('\n');

        tokio::fs::create_dir_all(&self.dir).await?;
        if parsed.intact_len < content.len() {
            let file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
            file.set_len(parsed.intact_len as u64).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;

        debug!(thread_id, version, path = %path.display(), "checkpoint appended");
        Ok(version)
    }

    async fn history(
        &self,
        thread_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Checkpoint>, StoreError> {
        let path = self.thread_path(thread_id)?;
        Ok(newest_first(self.read_lineage(&path).await?, limit))
    }

    async fn list_threads(&self) -> Result<Vec<ThreadSummary>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "jsonl") {
                continue;
            }
            if let Some(checkpoint) = self.read_lineage(&path).await?.pop() {
                summaries.push(ThreadSummary::from_checkpoint(&checkpoint));
            }
        }
        summaries.sort_by(|left, right| left.thread_id.cmp(&right.thread_id));
        Ok(summaries)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<bool, StoreError> {
        let path = self.thread_path(thread_id)?;
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }
}
