//! Entry-to-entry copies between two translators.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures::TryStreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::stream::{PumpOutcome, pump};
use crate::translator::Translator;
use crate::types::{
    Entry, FileTransferProgress, TransferEvent, TransferOutcome, TransferSummary, WriteMode,
};

const SPEED_INTERVAL: Duration = Duration::from_secs(1);

/// Per-file copy state. Only the orchestrator mutates it.
#[derive(Debug)]
pub(crate) struct TransferState {
    pub(crate) src: Entry,
    pub(crate) dest: PathBuf,
    pub(crate) bytes_written: u64,
    pub(crate) started: Instant,
    interval_start: Instant,
    interval_bytes: u64,
    pub(crate) speed_kbps: Option<f64>,
}

impl TransferState {
    pub(crate) fn new(src: Entry, dest: PathBuf, now: Instant) -> Self {
        Self {
            src,
            dest,
            bytes_written: 0,
            started: now,
            interval_start: now,
            interval_bytes: 0,
            speed_kbps: None,
        }
    }

    /// Counts an acknowledged chunk. The rate is refreshed only once a
    /// whole interval has elapsed, then the interval starts over.
    pub(crate) fn record(&mut self, chunk_len: usize, now: Instant) {
        self.bytes_written += chunk_len as u64;
        self.interval_bytes += chunk_len as u64;
        let elapsed = now.saturating_duration_since(self.interval_start);
        if elapsed >= SPEED_INTERVAL {
            self.speed_kbps = Some(self.interval_bytes as f64 / 1024.0 / elapsed.as_secs_f64());
            self.interval_start = now;
            self.interval_bytes = 0;
        }
    }

    fn progress(&self, chunk_len: usize) -> FileTransferProgress {
        FileTransferProgress {
            src_file: self.src.path.display().to_string(),
            dest_file: self.dest.display().to_string(),
            file_size: self.src.size,
            bytes_written: self.bytes_written,
            chunk_len,
            speed_kbps: self.speed_kbps,
        }
    }
}

/// Copies entries from one translator into another, one file at a time
pub struct TransferOrchestrator<'a> {
    source: &'a dyn Translator,
    destination: &'a dyn Translator,
    write_mode: WriteMode,
    events: UnboundedSender<TransferEvent>,
}

impl<'a> TransferOrchestrator<'a> {
    /// # Arguments
    ///
    /// * `source` - Translator the files are read from
    /// * `destination` - Translator the files are written to
    /// * `write_mode` - How existing destination files are treated
    /// * `events` - Receives a [`TransferEvent`] for every step; a closed
    ///   receiver does not stop the copy
    pub fn new(
        source: &'a dyn Translator,
        destination: &'a dyn Translator,
        write_mode: WriteMode,
        events: UnboundedSender<TransferEvent>,
    ) -> Self {
        Self {
            source,
            destination,
            write_mode,
            events,
        }
    }

    /// Resolves every source path up front so a missing source fails the
    /// whole copy before anything is written.
    ///
    /// # Errors
    ///
    /// The first path the source translator cannot resolve, usually
    /// [`Error::PathNotFound`](crate::Error::PathNotFound).
    pub async fn resolve_sources(&self, paths: &[PathBuf]) -> Result<Vec<Entry>> {
        let mut entries = Vec::with_capacity(paths.len());
        for path in paths {
            entries.push(self.source.resolve(path).await?);
        }
        Ok(entries)
    }

    /// Copies `sources` to `destination`, in input order.
    ///
    /// Directories are created recursively on the destination side. The
    /// first error aborts the remaining queue. Cancellation stops the current
    /// file and everything after it, and resolves as
    /// [`TransferOutcome::Cancelled`].
    ///
    /// # Arguments
    ///
    /// * `sources` - Entries returned by [`Self::resolve_sources`]
    /// * `destination` - Target file, or directory the sources are copied into
    /// * `cancel_token` - Token for cancelling the copy
    ///
    /// # Returns
    ///
    /// Returns a `TransferOutcome` carrying the totals reached:
    /// - `Completed` when every queued file was copied
    /// - `Cancelled` if the token fired first
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Several sources are copied to something that is not a directory
    /// - A file cannot be opened, read or written
    /// - A destination directory cannot be created
    ///
    /// # Example
    ///
    /// ```ignore
    /// let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    /// let orchestrator = TransferOrchestrator::new(&local, &remote, WriteMode::Truncate, tx);
    /// let entries = orchestrator.resolve_sources(&[PathBuf::from("report.csv")]).await?;
    /// let outcome = orchestrator
    ///     .copy(entries, Path::new("/srv/inbox"), &CancellationToken::new())
    ///     .await?;
    /// println!("{} bytes", outcome.summary().bytes_written);
    /// ```
    pub async fn copy(
        &self,
        sources: Vec<Entry>,
        destination: &Path,
        cancel_token: &CancellationToken,
    ) -> Result<TransferOutcome> {
        let started = Instant::now();
        let mut summary = TransferSummary::default();
        let mut queue = self.plan(sources, destination).await?;
        summary.files_total = queue.iter().filter(|(e, _)| !e.is_dir()).count();

        while let Some((entry, target)) = queue.pop_front() {
            if cancel_token.is_cancelled() {
                info!("Transfer cancelled before {:?}", entry.path);
                summary.elapsed = started.elapsed();
                return Ok(TransferOutcome::Cancelled(summary));
            }

            if entry.is_dir() {
                self.destination.create_dir_all(&target).await?;
                self.emit(TransferEvent::DirectoryCreated {
                    path: target.display().to_string(),
                });
                let children: Vec<Entry> = self.source.list(&entry).await?.try_collect().await?;
                debug!("{:?} has {} entries", entry.path, children.len());
                summary.files_total += children.iter().filter(|c| !c.is_dir()).count();
                // children go ahead of the rest of the queue, in listing order
                for child in children.into_iter().rev() {
                    let child_target = target.join(&child.name);
                    queue.push_front((child, child_target));
                }
                continue;
            }

            let index = summary.files_completed + 1;
            let state = TransferState::new(entry, target, Instant::now());
            match self.copy_file(state, index, &summary, cancel_token).await {
                Ok(PumpOutcome::Finished(bytes)) => {
                    summary.files_completed += 1;
                    summary.bytes_written += bytes;
                }
                Ok(PumpOutcome::Cancelled(bytes)) => {
                    summary.bytes_written += bytes;
                    summary.elapsed = started.elapsed();
                    info!(
                        "Transfer cancelled by user after {} of {} files",
                        summary.files_completed, summary.files_total
                    );
                    return Ok(TransferOutcome::Cancelled(summary));
                }
                Err(e) => {
                    error!("Transfer aborted: {}", e);
                    return Err(e);
                }
            }
        }

        summary.elapsed = started.elapsed();
        info!(
            "Copied {} files ({} bytes) in {:?}",
            summary.files_completed, summary.bytes_written, summary.elapsed
        );
        Ok(TransferOutcome::Completed(summary))
    }

    /// Maps every source onto its destination path
    async fn plan(
        &self,
        sources: Vec<Entry>,
        destination: &Path,
    ) -> Result<VecDeque<(Entry, PathBuf)>> {
        if sources.is_empty() {
            return Err(Error::Validation("no source given".into()));
        }
        let single = sources.len() == 1;
        let into_directory = match self.destination.resolve(destination).await {
            Ok(dest) if dest.is_dir() => true,
            Ok(_) if single && !sources[0].is_dir() => false,
            Ok(_) => {
                return Err(Error::Validation(format!(
                    "destination {} is not a directory",
                    destination.display()
                )));
            }
            Err(Error::PathNotFound(_)) if single => false,
            Err(e) => return Err(e),
        };

        Ok(sources
            .into_iter()
            .map(|entry| {
                let target = if into_directory {
                    destination.join(&entry.name)
                } else {
                    destination.to_path_buf()
                };
                (entry, target)
            })
            .collect())
    }

    async fn copy_file(
        &self,
        mut state: TransferState,
        index: usize,
        summary: &TransferSummary,
        cancel_token: &CancellationToken,
    ) -> Result<PumpOutcome> {
        info!(
            "Copying {:?} ({} bytes) to {:?} on {}",
            state.src.path,
            state.src.size,
            state.dest,
            self.destination.label()
        );
        let mut source = self.source.open_for_read(&state.src).await?;
        let mut sink = self
            .destination
            .open_for_write(&state.dest, self.write_mode)
            .await?;

        self.emit(TransferEvent::FileStarted {
            src_file: state.src.path.display().to_string(),
            dest_file: state.dest.display().to_string(),
            file_size: state.src.size,
            index,
            queued: summary.files_total,
        });

        let events = self.events.clone();
        let outcome = pump(source.as_mut(), sink.as_mut(), cancel_token, |chunk_len| {
            state.record(chunk_len, Instant::now());
            let _ = events.send(TransferEvent::Progress(state.progress(chunk_len)));
        })
        .await?;

        if let PumpOutcome::Finished(bytes) = outcome {
            debug!(
                "{:?} finished in {:?}",
                state.src.path,
                state.started.elapsed()
            );
            self.emit(TransferEvent::FileFinished {
                src_file: state.src.path.display().to_string(),
                file_size: state.src.size,
                bytes_written: bytes,
                speed_kbps: state.speed_kbps,
                files_completed: summary.files_completed + 1,
                queued: summary.files_total,
            });
        }
        Ok(outcome)
    }

    fn emit(&self, event: TransferEvent) {
        // a dropped receiver only means nobody is watching
        let _ = self.events.send(event);
    }
}
