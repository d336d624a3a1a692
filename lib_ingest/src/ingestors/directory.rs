//! Spool directory readers.
//!
//! Files are picked up in name order and read whole. A file stays in the
//! spool until every message framed from it has been acknowledged or
//! rejected; only then is it moved to the processed directory (or removed
//! when none is configured). Closing the reader leaves files with unhandled
//! messages in place, so their records are read again on the next start.
//! Line readers emit one message per non-empty line; document readers emit
//! one message per file. Rejects are not redelivered.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::SourceAdapter;
use crate::configs::{RunMode, SourceDescriptor};
use crate::core::event::{RawMessage, ATTR_FILE_NAME};
use crate::errors::AdapterError;

/// Poll interval used by `watch` readers.
const WATCH_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Lines { header_lines: usize },
    Document,
}

/// A file that has been read but still has messages out.
#[derive(Debug)]
struct OpenFile {
    path: PathBuf,
    outstanding: usize,
}

#[derive(Debug, Default)]
struct Spool {
    queue: VecDeque<RawMessage>,
    open: HashMap<String, OpenFile>,
}

/// Reads records from files dropped into a directory.
#[derive(Debug)]
pub struct DirectoryAdapter {
    reader_id: String,
    source_dir: PathBuf,
    processed_dir: Option<PathBuf>,
    poll: Duration,
    on_demand: bool,
    framing: Framing,
    spool: Mutex<Spool>,
    closed: CancellationToken,
}

impl DirectoryAdapter {
    /// One message per line (`*file_csv`, `*flatstore`).
    pub fn lines(desc: &SourceDescriptor) -> Self {
        Self::with_framing(desc, Framing::Lines { header_lines: desc.opts.header_lines })
    }

    /// One message per file (`*file_json`).
    pub fn documents(desc: &SourceDescriptor) -> Self {
        Self::with_framing(desc, Framing::Document)
    }

    fn with_framing(desc: &SourceDescriptor, framing: Framing) -> Self {
        Self {
            reader_id: desc.id.clone(),
            source_dir: PathBuf::from(&desc.source_path),
            processed_dir: desc.processed_path.clone(),
            poll: match desc.run_mode {
                RunMode::Watch => WATCH_POLL.min(desc.run_delay.max(Duration::from_millis(1))),
                _ => desc.run_delay.max(Duration::from_millis(1)),
            },
            on_demand: desc.run_mode == RunMode::OnDemand,
            framing,
            spool: Mutex::new(Spool::default()),
            closed: CancellationToken::new(),
        }
    }

    /// Reads every file in the directory that is not already open. Files
    /// yielding no records are retired at once.
    async fn scan(&self, spool: &mut Spool) -> Result<(), AdapterError> {
        let mut entries = tokio::fs::read_dir(&self.source_dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || spool.open.contains_key(&name) {
                continue;
            }
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                files.push((name, entry.path()));
            }
        }
        files.sort();

        for (name, path) in files {
            let content = match tokio::fs::read(&path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(reader = %self.reader_id, file = %path.display(), error = %e, "failed to read file, skipping");
                    continue;
                }
            };
            let mut records = Vec::new();
            self.frame(&name, content, &mut records);
            debug!(reader = %self.reader_id, file = %name, records = records.len(), "file read");
            if records.is_empty() {
                self.retire(&name, &path).await;
                continue;
            }
            spool.open.insert(
                name,
                OpenFile {
                    path,
                    outstanding: records.len(),
                },
            );
            spool.queue.extend(records);
        }
        Ok(())
    }

    /// Counts one message of its file as handled and retires the file when
    /// it was the last one. The spool stays locked until the file is gone so
    /// a concurrent scan cannot read it again.
    async fn settle(&self, msg: &RawMessage) {
        let Some(name) = msg.attribute(ATTR_FILE_NAME) else {
            return;
        };
        let mut spool = self.spool.lock().await;
        let Some(file) = spool.open.get_mut(name) else {
            return;
        };
        file.outstanding = file.outstanding.saturating_sub(1);
        if file.outstanding > 0 {
            return;
        }
        if let Some(file) = spool.open.remove(name) {
            debug!(reader = %self.reader_id, file = %name, "file processed");
            self.retire(name, &file.path).await;
        }
    }

    /// Messages read from files but not handed out yet.
    pub async fn queued(&self) -> usize {
        self.spool.lock().await.queue.len()
    }

    fn frame(&self, name: &str, content: Vec<u8>, out: &mut Vec<RawMessage>) {
        match self.framing {
            Framing::Document => {
                out.push(RawMessage::new(name, content).with_attribute(ATTR_FILE_NAME, name));
            }
            Framing::Lines { header_lines } => {
                let text = String::from_utf8_lossy(&content);
                for (idx, line) in text.lines().enumerate().skip(header_lines) {
                    if line.trim().is_empty() {
                        continue;
                    }
                    out.push(
                        RawMessage::new(format!("{name}:{}", idx + 1), line.to_string())
                            .with_attribute(ATTR_FILE_NAME, name),
                    );
                }
            }
        }
    }

    async fn retire(&self, name: &str, path: &Path) {
        let result = match &self.processed_dir {
            Some(dir) => tokio::fs::rename(path, dir.join(name)).await,
            None => tokio::fs::remove_file(path).await,
        };
        if let Err(e) = result {
            warn!(reader = %self.reader_id, file = %path.display(), error = %e, "failed to retire consumed file");
        }
    }
}

#[async_trait]
impl SourceAdapter for DirectoryAdapter {
    async fn connect(&self) -> Result<(), AdapterError> {
        let meta = tokio::fs::metadata(&self.source_dir).await.map_err(|e| AdapterError::Connect {
            target: self.source_dir.display().to_string(),
            reason: e.to_string(),
        })?;
        if !meta.is_dir() {
            return Err(AdapterError::Connect {
                target: self.source_dir.display().to_string(),
                reason: "not a directory".into(),
            });
        }
        if let Some(dir) = &self.processed_dir {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }

    async fn next(&self) -> Result<Option<RawMessage>, AdapterError> {
        loop {
            if self.closed.is_cancelled() {
                return Ok(None);
            }
            {
                let mut spool = self.spool.lock().await;
                if spool.queue.is_empty() {
                    self.scan(&mut spool).await?;
                }
                if let Some(msg) = spool.queue.pop_front() {
                    return Ok(Some(msg));
                }
            }
            if self.on_demand {
                return Ok(None);
            }
            tokio::select! {
                _ = self.closed.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.poll) => {}
            }
        }
    }

    async fn ack(&self, msg: &RawMessage) -> Result<(), AdapterError> {
        self.settle(msg).await;
        Ok(())
    }

    async fn reject(&self, msg: &RawMessage, _redeliver: bool) -> Result<(), AdapterError> {
        self.settle(msg).await;
        Ok(())
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.closed.cancel();
        let spool = self.spool.lock().await;
        if !spool.open.is_empty() {
            debug!(
                reader = %self.reader_id,
                files = spool.open.len(),
                queued = spool.queue.len(),
                "leaving partly processed files in the spool"
            );
        }
        Ok(())
    }

    fn redeliverable(&self) -> bool {
        false
    }

    fn supports_manual(&self) -> bool {
        true
    }
}
