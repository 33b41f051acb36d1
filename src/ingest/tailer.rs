//! File tailer for reading new lines from a growing log file.
//!
//! Tracks a byte offset and the file's inode. Truncation (size below the
//! offset) or recreation under the same path (inode change) restarts reading
//! from the beginning. Only newline-terminated lines are returned; a partial
//! trailing line stays unread until the writer finishes it.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::StartPosition;
use crate::error::{ExporterError, Result};

/// Maximum number of bytes consumed by a single `read_new_lines()` call.
const MAX_READ_BYTES: u64 = 4 * 1024 * 1024;

pub struct FileTailer {
    path: PathBuf,
    offset: u64,
    inode: u64,
}

impl FileTailer {
    /// Start tailing `path`, either from its first byte or from its current end.
    ///
    /// Fails if the file does not exist or cannot be stat'd.
    pub async fn open(path: impl Into<PathBuf>, start: StartPosition) -> Result<Self> {
        let path = path.into();
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| ExporterError::io(&path, e))?;

        if !metadata.is_file() {
            return Err(ExporterError::io(
                &path,
                io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }

        // Opening proves read permission up front rather than on the first poll
        File::open(&path)
            .await
            .map_err(|e| ExporterError::io(&path, e))?;

        let offset = match start {
            StartPosition::Beginning => 0,
            StartPosition::End => metadata.len(),
        };

        Ok(Self {
            inode: get_inode(&metadata),
            path,
            offset,
        })
    }

    /// Read complete lines appended since the last call.
    ///
    /// A missing file yields no lines (it may be mid-recreation).
    pub async fn read_new_lines(&mut self) -> Result<Vec<String>> {
        let metadata = match fs::metadata(&self.path).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ExporterError::io(&self.path, e)),
        };

        let current_inode = get_inode(&metadata);
        let current_size = metadata.len();

        if current_inode != self.inode || current_size < self.offset {
            tracing::warn!(
                path = %self.path.display(),
                previous_offset = self.offset,
                current_size,
                "Log file truncated or recreated, reading from the start"
            );
            self.inode = current_inode;
            self.offset = 0;
        }

        if current_size <= self.offset {
            return Ok(Vec::new());
        }

        let to_read = (current_size - self.offset).min(MAX_READ_BYTES);
        let buffer = self
            .read_chunk(to_read)
            .await
            .map_err(|e| ExporterError::io(&self.path, e))?;

        let (lines, consumed) = split_complete_lines(&buffer, to_read == MAX_READ_BYTES);
        self.offset += consumed as u64;

        Ok(lines)
    }

    async fn read_chunk(&self, len: u64) -> io::Result<Vec<u8>> {
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(self.offset)).await?;

        let mut buffer = Vec::with_capacity(len as usize);
        file.take(len).read_to_end(&mut buffer).await?;
        Ok(buffer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// Split `buffer` into lines, returning them and the number of bytes they covered.
///
/// Bytes after the last newline are left unconsumed unless `force` is set,
/// which only happens when a single line fills a whole read.
fn split_complete_lines(buffer: &[u8], force: bool) -> (Vec<String>, usize) {
    let consumed = match buffer.iter().rposition(|&b| b == b'\n') {
        Some(pos) => pos + 1,
        None if force => buffer.len(),
        None => return (Vec::new(), 0),
    };

    let complete = &buffer[..consumed];
    let body = complete.strip_suffix(b"\n").unwrap_or(complete);

    let lines = body
        .split(|&b| b == b'\n')
        .map(|line| {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            String::from_utf8_lossy(line).into_owned()
        })
        .collect();

    (lines, consumed)
}

/// Spawn the task that polls `tailer` and queues its lines.
///
/// The task runs until `stop` fires or the line receiver is dropped. When
/// `stop` receives a value the file is read to its current end one last time
/// before the handle is released, so nothing written before the stop is lost.
/// Dropping the `stop` sender ends the task without that final read.
pub fn spawn_follower(
    tailer: FileTailer,
    lines: mpsc::Sender<String>,
    poll_interval: Duration,
    stop: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        follow(tailer, lines, poll_interval, stop).await;
    })
}

async fn follow(
    mut tailer: FileTailer,
    lines: mpsc::Sender<String>,
    poll_interval: Duration,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        if !forward(&mut tailer, &lines).await {
            return;
        }

        tokio::select! {
            biased;
            requested = &mut stop => {
                if requested.is_ok() {
                    drain(&mut tailer, &lines).await;
                }
                tracing::debug!(path = %tailer.path().display(), offset = tailer.offset(), "Follower stopped");
                return;
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

/// One poll. Returns false once nobody is listening.
async fn forward(tailer: &mut FileTailer, lines: &mpsc::Sender<String>) -> bool {
    match tailer.read_new_lines().await {
        Ok(batch) => {
            for line in batch {
                if lines.send(line).await.is_err() {
                    return false;
                }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read log file");
        }
    }
    true
}

/// Read until the file has nothing more to give
async fn drain(tailer: &mut FileTailer, lines: &mpsc::Sender<String>) {
    loop {
        match tailer.read_new_lines().await {
            Ok(batch) if batch.is_empty() => return,
            Ok(batch) => {
                for line in batch {
                    if lines.send(line).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed final read of log file");
                return;
            }
        }
    }
}

/// Extract inode from file metadata (Linux-specific).
#[cfg(unix)]
fn get_inode(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

/// Fallback for non-Unix: always returns 0, relying on size-based rotation detection.
#[cfg(not(unix))]
fn get_inode(_metadata: &std::fs::Metadata) -> u64 {
    0
}
