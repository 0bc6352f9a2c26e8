use std::fs::Metadata;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::fs;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::stream::{ChunkSink, ChunkSource, ReaderSource, WriterSink};
use crate::translator::{EntryStream, Translator};
use crate::types::{Entry, EntryKind, TransferConfig, TransferConfigArc, WriteMode};

/// Translator backed by the local file system
#[derive(Debug, Clone)]
pub struct LocalTranslator {
    config: TransferConfigArc,
}

impl LocalTranslator {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config: config.into(),
        }
    }
}

impl Default for LocalTranslator {
    fn default() -> Self {
        Self::new(TransferConfig::default())
    }
}

fn entry_from_metadata(path: PathBuf, metadata: &Metadata) -> Entry {
    let kind = if metadata.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    };
    Entry {
        name: Entry::name_of(&path),
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        modified: metadata.modified().ok(),
        kind,
        path,
    }
}

#[async_trait]
impl Translator for LocalTranslator {
    fn label(&self) -> &str {
        "local"
    }

    async fn resolve(&self, path: &Path) -> Result<Entry> {
        let metadata = fs::metadata(path)
            .await
            .map_err(|e| Error::from_io(path, e))?;
        Ok(entry_from_metadata(path.to_path_buf(), &metadata))
    }

    async fn list(&self, dir: &Entry) -> Result<EntryStream<'_>> {
        let read_dir = fs::read_dir(&dir.path)
            .await
            .map_err(|e| Error::from_io(&dir.path, e))?;
        let dir_path = dir.path.clone();

        let entries = stream::unfold(Some(read_dir), move |state| {
            let dir_path = dir_path.clone();
            async move {
                let mut read_dir = state?;
                match read_dir.next_entry().await {
                    Ok(Some(child)) => {
                        let path = child.path();
                        let item = fs::metadata(&path)
                            .await
                            .map(|metadata| entry_from_metadata(path.clone(), &metadata))
                            .map_err(|e| Error::from_io(&path, e));
                        Some((item, Some(read_dir)))
                    }
                    Ok(None) => None,
                    Err(e) => Some((Err(Error::from_io(dir_path, e)), None)),
                }
            }
        });
        Ok(entries.boxed())
    }

    async fn open_for_read(&self, entry: &Entry) -> Result<Box<dyn ChunkSource>> {
        if entry.is_dir() {
            return Err(Error::Io {
                path: entry.path.clone(),
                source: std::io::Error::other("is a directory"),
            });
        }
        let file = fs::File::open(&entry.path)
            .await
            .map_err(|e| Error::from_io(&entry.path, e))?;
        info!("Local file opened: {:?}", entry.path);
        Ok(Box::new(ReaderSource::new(file, self.config.io_size)))
    }

    async fn open_for_write(&self, path: &Path, mode: WriteMode) -> Result<Box<dyn ChunkSink>> {
        let mut options = fs::OpenOptions::new();
        match mode {
            WriteMode::Truncate => options.write(true).create(true).truncate(true),
            WriteMode::Append => options.append(true).create(true),
            WriteMode::CreateNew => options.write(true).create_new(true),
        };
        let file = options
            .open(path)
            .await
            .map_err(|e| Error::from_io(path, e))?;
        debug!("Local file opened for write ({:?}): {:?}", mode, path);
        Ok(Box::new(WriterSink::new(file)))
    }

    async fn create_dir_all(&self, path: &Path) -> Result<Entry> {
        fs::create_dir_all(path)
            .await
            .map_err(|e| Error::from_io(path, e))?;
        self.resolve(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ByteChunk;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn resolve_reports_kind_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.bin");
        std::fs::write(&file, vec![7u8; 42]).unwrap();
        let translator = LocalTranslator::default();

        let entry = translator.resolve(&file).await.unwrap();
        assert_eq!(entry.kind, EntryKind::File);
        assert_eq!(entry.size, 42);
        assert_eq!(entry.name, "a.bin");

        let entry = translator.resolve(dir.path()).await.unwrap();
        assert!(entry.is_dir());

        let missing = translator.resolve(&dir.path().join("missing")).await;
        assert!(matches!(missing, Err(Error::PathNotFound(_))));
    }

    #[tokio::test]
    async fn list_restarts_on_every_call() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one"), b"1").unwrap();
        std::fs::create_dir(dir.path().join("two")).unwrap();
        let translator = LocalTranslator::default();
        let root = translator.resolve(dir.path()).await.unwrap();

        for _ in 0..2 {
            let mut names: Vec<String> = translator
                .list(&root)
                .await
                .unwrap()
                .map_ok(|e| e.name)
                .try_collect()
                .await
                .unwrap();
            names.sort();
            assert_eq!(names, vec!["one".to_string(), "two".to_string()]);
        }
    }

    #[tokio::test]
    async fn write_modes_are_explicit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        std::fs::write(&path, b"previous contents").unwrap();
        let translator = LocalTranslator::default();

        let mut sink = translator
            .open_for_write(&path, WriteMode::Truncate)
            .await
            .unwrap();
        sink.accept(ByteChunk::data(&b"new"[..])).await.unwrap();
        sink.close().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");

        let mut sink = translator
            .open_for_write(&path, WriteMode::Append)
            .await
            .unwrap();
        sink.accept(ByteChunk::data(&b"+more"[..])).await.unwrap();
        sink.close().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new+more");

        let clobber = translator.open_for_write(&path, WriteMode::CreateNew).await;
        assert!(matches!(clobber, Err(Error::AlreadyExists(_))));
    }
}
