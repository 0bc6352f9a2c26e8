use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Snapshot of a file or directory inside a translator's namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: PathBuf,
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl Entry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Last path component, falling back to the whole path for roots
    pub(crate) fn name_of(path: &Path) -> String {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned())
    }
}

/// Type of entry (regular file or directory)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// How a destination file is opened for writing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Create the file, or truncate it to zero length if it exists
    #[default]
    Truncate,
    /// Create the file if missing, then append after its current end
    Append,
    /// Fail with `AlreadyExists` if the file is already there
    CreateNew,
}

/// Configuration for transfer operations
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Buffer size for read/write operations in bytes
    pub io_size: usize,
    /// Policy for opening destination files
    pub write_mode: WriteMode,
}

impl Default for TransferConfig {
    /// - io_size: 65536 (64KB)
    /// - write_mode: truncate-or-create
    fn default() -> Self {
        Self {
            io_size: 65536,
            write_mode: WriteMode::Truncate,
        }
    }
}

impl TransferConfig {
    pub fn new(io_size: usize, write_mode: WriteMode) -> Self {
        Self {
            io_size: io_size.max(1),
            write_mode,
        }
    }
}

/// Internal configuration wrapper with Arc for shared ownership
#[derive(Debug, Clone)]
pub(crate) struct TransferConfigArc {
    pub(crate) inner: Arc<TransferConfig>,
}

impl From<TransferConfig> for TransferConfigArc {
    fn from(config: TransferConfig) -> Self {
        Self {
            inner: Arc::new(config),
        }
    }
}

impl std::ops::Deref for TransferConfigArc {
    type Target = TransferConfig;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Progress information for one file of an ongoing transfer
#[derive(Debug, Clone, PartialEq)]
pub struct FileTransferProgress {
    /// Source file path
    pub src_file: String,
    /// Destination file path
    pub dest_file: String,
    /// Total size of the file in bytes
    pub file_size: u64,
    /// Bytes written to the destination so far, never decreasing for a file
    pub bytes_written: u64,
    /// Length of the chunk that produced this event
    pub chunk_len: usize,
    /// Throughput in KiB per second, measured once per elapsed second
    pub speed_kbps: Option<f64>,
}

impl FileTransferProgress {
    /// Percentage of transfer completed (0.0 to 100.0)
    pub fn percentage(&self) -> f64 {
        if self.file_size == 0 {
            100.0
        } else {
            (self.bytes_written as f64 / self.file_size as f64 * 100.0).min(100.0)
        }
    }
}

/// Events emitted by the orchestrator, in order, for every copied file
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// A new file begins; its byte counter starts from zero
    FileStarted {
        src_file: String,
        dest_file: String,
        file_size: u64,
        /// 1-based position of the file in the queue
        index: usize,
        /// Files known so far; grows as directories are expanded
        queued: usize,
    },
    Progress(FileTransferProgress),
    FileFinished {
        src_file: String,
        file_size: u64,
        bytes_written: u64,
        /// Last measured rate, `None` when the copy took under one interval
        speed_kbps: Option<f64>,
        files_completed: usize,
        queued: usize,
    },
    DirectoryCreated {
        path: String,
    },
}

/// Totals for a (possibly interrupted) transfer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferSummary {
    pub files_completed: usize,
    pub files_total: usize,
    pub bytes_written: u64,
    pub elapsed: Duration,
}

/// Result of a transfer operation
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    /// Transfer completed successfully
    Completed(TransferSummary),
    /// Transfer was cancelled by user
    Cancelled(TransferSummary),
}

impl TransferOutcome {
    pub fn summary(&self) -> &TransferSummary {
        match self {
            TransferOutcome::Completed(s) | TransferOutcome::Cancelled(s) => s,
        }
    }
}
