use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::BytesMut;
use futures::stream::StreamExt;
use openssh_sftp_client::Sftp;
use openssh_sftp_client::error::SftpErrorKind;
use openssh_sftp_client::file::File;
use openssh_sftp_client::metadata::MetaData;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::stream::{ByteChunk, ChunkSink, ChunkSource};
use crate::translator::{EntryStream, Translator};
use crate::types::{Entry, EntryKind, TransferConfig, TransferConfigArc, WriteMode};

/// Translator for files on a remote server, reached through an SFTP channel
#[derive(Debug)]
pub struct SftpTranslator {
    pub(crate) sftp: Sftp,
    pub(crate) config: TransferConfigArc,
    label: String,
}

impl SftpTranslator {
    /// Creates a new translator over an open SFTP channel (internal use)
    pub(crate) fn new(sftp: Sftp, config: TransferConfig, label: String) -> Self {
        Self {
            sftp,
            config: config.into(),
            label,
        }
    }
}

/// Maps an SFTP error for `path` onto the entry-level taxonomy
fn map_sftp_error(path: &Path, err: openssh_sftp_client::Error) -> Error {
    let kind = match &err {
        openssh_sftp_client::Error::SftpError(kind, _) => Some(*kind),
        _ => None,
    };
    error_for_kind(path, kind, &err)
}

/// `kind` is the status code the server replied with, if any
fn error_for_kind(
    path: &Path,
    kind: Option<SftpErrorKind>,
    detail: impl std::fmt::Display,
) -> Error {
    match kind {
        Some(SftpErrorKind::NoSuchFile) => Error::PathNotFound(path.to_path_buf()),
        Some(SftpErrorKind::PermDenied) => Error::PermissionDenied(path.to_path_buf()),
        _ => Error::Io {
            path: path.to_path_buf(),
            source: std::io::Error::other(format!("SFTP error: {detail}")),
        },
    }
}

/// Every ancestor of `path` from the root down, `path` itself last
fn dir_prefixes(path: &Path) -> Vec<PathBuf> {
    let mut current = PathBuf::new();
    path.components()
        .map(|component| {
            current.push(component);
            current.clone()
        })
        .collect()
}

fn entry_from_metadata(path: PathBuf, metadata: &MetaData) -> Entry {
    let is_dir = metadata.file_type().is_some_and(|t| t.is_dir());
    Entry {
        name: Entry::name_of(&path),
        kind: if is_dir {
            EntryKind::Directory
        } else {
            EntryKind::File
        },
        size: if is_dir { 0 } else { metadata.len().unwrap_or(0) },
        modified: metadata.modified().map(|t| t.as_system_time()),
        path,
    }
}

#[async_trait]
impl Translator for SftpTranslator {
    fn label(&self) -> &str {
        &self.label
    }

    /// Closes the SFTP channel and releases resources
    async fn close(self: Box<Self>) -> Result<()> {
        info!("Closing sftp channel to {}", self.label);
        let label = self.label;
        self.sftp.close().await.map_err(|e| Error::Io {
            path: PathBuf::from(label),
            source: std::io::Error::other(e.to_string()),
        })
    }

    async fn resolve(&self, path: &Path) -> Result<Entry> {
        let metadata = self
            .sftp
            .fs()
            .metadata(path)
            .await
            .map_err(|e| map_sftp_error(path, e))?;
        Ok(entry_from_metadata(path.to_path_buf(), &metadata))
    }

    async fn list(&self, dir: &Entry) -> Result<EntryStream<'_>> {
        let remote_dir = dir.path.clone();
        let handle = self
            .sftp
            .fs()
            .open_dir(&remote_dir)
            .await
            .map_err(|e| map_sftp_error(&remote_dir, e))?;

        let entries = handle.read_dir().filter_map(move |entry| {
            let remote_dir = remote_dir.clone();
            async move {
                match entry {
                    Ok(entry) => {
                        let file_name = entry.filename().file_name()?;
                        if file_name == "." || file_name == ".." {
                            return None;
                        }
                        let path = remote_dir.join(file_name);
                        Some(Ok(entry_from_metadata(path, &entry.metadata())))
                    }
                    Err(e) => {
                        error!("Failed to list remote directory: {e}");
                        Some(Err(map_sftp_error(&remote_dir, e)))
                    }
                }
            }
        });
        Ok(entries.boxed())
    }

    async fn open_for_read(&self, entry: &Entry) -> Result<Box<dyn ChunkSource>> {
        let file = self
            .sftp
            .open(&entry.path)
            .await
            .map_err(|e| map_sftp_error(&entry.path, e))?;
        info!("Remote file opened: {:?}", entry.path);
        Ok(Box::new(SftpFileSource {
            file: Some(file),
            io_size: self.config.io_size,
        }))
    }

    async fn open_for_write(&self, path: &Path, mode: WriteMode) -> Result<Box<dyn ChunkSink>> {
        let opened = match mode {
            WriteMode::Truncate => self.sftp.create(path).await,
            WriteMode::Append => {
                self.sftp
                    .options()
                    .write(true)
                    .append(true)
                    .create(true)
                    .open(path)
                    .await
            }
            WriteMode::CreateNew => {
                // SFTPv3 servers report a generic failure for O_EXCL, so check first
                if self.sftp.fs().metadata(path).await.is_ok() {
                    return Err(Error::AlreadyExists(path.to_path_buf()));
                }
                self.sftp
                    .options()
                    .write(true)
                    .create_new(true)
                    .open(path)
                    .await
            }
        };
        let file = opened.map_err(|e| {
            error!("Failed to open file: {:?} ERROR: {:?}", path, e);
            map_sftp_error(path, e)
        })?;
        info!("Remote file opened for write ({:?}): {:?}", mode, path);
        Ok(Box::new(SftpFileSink { file: Some(file) }))
    }

    async fn create_dir_all(&self, path: &Path) -> Result<Entry> {
        let mut fs = self.sftp.fs();
        for current in dir_prefixes(path) {
            match fs.metadata(&current).await {
                Ok(metadata) if metadata.file_type().is_some_and(|t| t.is_dir()) => continue,
                Ok(_) => return Err(Error::AlreadyExists(current)),
                Err(_) => {
                    debug!("Creating remote directory {:?}", current);
                    fs.create_dir(&current)
                        .await
                        .map_err(|e| map_sftp_error(&current, e))?;
                }
            }
        }
        self.resolve(path).await
    }
}

/// Reads a remote file one request at a time
struct SftpFileSource {
    file: Option<File>,
    io_size: usize,
}

#[async_trait]
impl ChunkSource for SftpFileSource {
    async fn next_chunk(&mut self) -> Result<ByteChunk> {
        let file = self.file.as_mut().ok_or(Error::Cancelled)?;
        let buffer = BytesMut::with_capacity(self.io_size);
        match file.read(self.io_size as u32, buffer).await {
            Ok(Some(buf)) => Ok(ByteChunk::data(buf.freeze())),
            Ok(None) => {
                info!("End of remote file reached");
                Ok(ByteChunk::end())
            }
            Err(e) => {
                error!("Error reading remote file: {:?}", e);
                Err(Error::ReadFailure(e.to_string()))
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.close()
                .await
                .map_err(|e| Error::ReadFailure(e.to_string()))?;
        }
        Ok(())
    }
}

/// Writes chunks to a remote file, each acknowledged once the server replied
struct SftpFileSink {
    file: Option<File>,
}

#[async_trait]
impl ChunkSink for SftpFileSink {
    async fn accept(&mut self, chunk: ByteChunk) -> Result<usize> {
        let file = self.file.as_mut().ok_or(Error::Cancelled)?;
        let data = chunk.into_bytes();
        file.write_all(&data)
            .await
            .map_err(|e| Error::WriteFailure(format!("SFTP write error: {e}")))?;
        Ok(data.len())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.close()
                .await
                .map_err(|e| Error::WriteFailure(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_status_codes_map_to_entry_errors() {
        let path = Path::new("/srv/data/report.csv");

        assert!(matches!(
            error_for_kind(path, Some(SftpErrorKind::NoSuchFile), "gone"),
            Error::PathNotFound(p) if p == path
        ));
        assert!(matches!(
            error_for_kind(path, Some(SftpErrorKind::PermDenied), "nope"),
            Error::PermissionDenied(p) if p == path
        ));
        match error_for_kind(path, Some(SftpErrorKind::Failure), "disk full") {
            Error::Io { path: p, source } => {
                assert_eq!(p, path);
                assert!(source.to_string().contains("disk full"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn protocol_errors_stay_io_errors() {
        let path = Path::new("/srv/data");
        let err = map_sftp_error(path, openssh_sftp_client::Error::InvalidResponse(&"garbled"));
        match err {
            Error::Io { path: p, source } => {
                assert_eq!(p, path);
                assert!(source.to_string().starts_with("SFTP error: "));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(matches!(
            map_sftp_error(path, openssh_sftp_client::Error::HandleTooLong),
            Error::Io { .. }
        ));
    }

    #[test]
    fn directories_are_created_top_down() {
        assert_eq!(
            dir_prefixes(Path::new("/home/alice/backup")),
            vec![
                PathBuf::from("/"),
                PathBuf::from("/home"),
                PathBuf::from("/home/alice"),
                PathBuf::from("/home/alice/backup"),
            ]
        );
        assert_eq!(
            dir_prefixes(Path::new("out/nested")),
            vec![PathBuf::from("out"), PathBuf::from("out/nested")]
        );
        assert!(dir_prefixes(Path::new("")).is_empty());
    }
}
