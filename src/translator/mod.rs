//! Uniform file-system view over local disk and SFTP-backed remotes.

use std::path::Path;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::stream::{ChunkSink, ChunkSource};
use crate::types::{Entry, WriteMode};

/// Module for the machine's own file system
pub(crate) mod local;

/// Module for files reached through an SFTP channel
pub(crate) mod remote;

pub use local::LocalTranslator;
pub use remote::SftpTranslator;

/// Lazy, finite listing of a directory. Each call to
/// [`Translator::list`] starts a fresh enumeration.
pub type EntryStream<'a> = BoxStream<'a, Result<Entry>>;

/// File-system-like capability shared by every backend
#[async_trait]
pub trait Translator: Send + Sync {
    /// Short label used in log lines and status output
    fn label(&self) -> &str;

    /// Looks `path` up and returns its metadata, or `PathNotFound`
    async fn resolve(&self, path: &Path) -> Result<Entry>;

    /// Enumerates the children of a directory entry
    async fn list(&self, dir: &Entry) -> Result<EntryStream<'_>>;

    /// Opens a file entry for reading from its first byte
    async fn open_for_read(&self, entry: &Entry) -> Result<Box<dyn ChunkSource>>;

    /// Opens `path` for writing according to `mode`:
    ///
    /// - [`WriteMode::Truncate`] creates the file, or empties an existing one
    /// - [`WriteMode::Append`] creates the file if needed and writes after its end
    /// - [`WriteMode::CreateNew`] fails with `AlreadyExists` when the path exists
    async fn open_for_write(&self, path: &Path, mode: WriteMode) -> Result<Box<dyn ChunkSink>>;

    /// Creates `path` and any missing parents, returning the directory entry
    async fn create_dir_all(&self, path: &Path) -> Result<Entry>;

    /// Releases the backend. Dropping a translator also releases it, but
    /// without reporting errors.
    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
