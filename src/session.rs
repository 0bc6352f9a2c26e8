//! One control-loop lifetime: runs an operation, maps Ctrl-C onto its
//! cancellation token and renders status on the terminal.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{ConnectOptions, Connection, ConnectionManager};
use crate::error::{Error, Result};
use crate::location::{Destination, FileLocation};
use crate::stream::{PumpOutcome, ReaderSource, WriterSink, pump};
use crate::transfer::TransferOrchestrator;
use crate::translator::{LocalTranslator, Translator};
use crate::trust::LinePrompt;
use crate::types::{TransferConfig, TransferEvent, TransferOutcome};

/// Exit code used when the user interrupts the session
pub const EXIT_CANCELLED: i32 = 130;

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Completed,
    Cancelled,
    Failed(String),
}

impl SessionStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionStatus::Completed => 0,
            SessionStatus::Cancelled => EXIT_CANCELLED,
            SessionStatus::Failed(_) => 1,
        }
    }
}

/// Single terminal line that is rewritten in place.
///
/// A shorter line is padded with spaces up to the length of the previous
/// one so no stale characters survive. Final lines always start fresh.
pub struct StatusLine<W: Write = Box<dyn Write + Send>> {
    out: W,
    last_len: usize,
}

impl StatusLine {
    pub fn stderr() -> Self {
        Self::new(Box::new(io::stderr()))
    }
}

impl<W: Write> StatusLine<W> {
    pub fn new(out: W) -> Self {
        Self { out, last_len: 0 }
    }

    /// Overwrites the current line
    pub fn update(&mut self, line: &str) {
        let len = line.chars().count();
        let pad = self.last_len.saturating_sub(len);
        self.write(&format!("\r{line}{:pad$}", ""));
        self.last_len = len;
    }

    /// Rewrites the current line one last time and moves past it
    pub fn commit(&mut self, line: &str) {
        self.update(line);
        self.write("\n");
        self.last_len = 0;
    }

    /// Prints `line` on a line of its own and forgets the in-place line
    pub fn finish(&mut self, line: &str) {
        if self.last_len > 0 {
            self.write("\n");
            self.last_len = 0;
        }
        self.write(&format!("{line}\n"));
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write(&mut self, text: &str) {
        if let Err(e) = self.out.write_all(text.as_bytes()).and_then(|_| self.out.flush()) {
            debug!("Failed to write status line: {e}");
        }
    }
}

/// Renders `<filename> - <bytesCopied> of <totalSize> - <speed>kb/S`
pub fn progress_line(
    file: &str,
    bytes_written: u64,
    file_size: u64,
    speed_kbps: Option<f64>,
) -> String {
    let name = Path::new(file)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.to_string());
    format!(
        "{name} - {bytes_written} of {file_size} - {:.0}kb/S",
        speed_kbps.unwrap_or(0.0)
    )
}

/// State shared by the session and its operation
pub struct SessionContext {
    manager: Arc<ConnectionManager>,
    options: ConnectOptions,
    cancel_token: CancellationToken,
    /// Most recently established connection
    connection: Option<Arc<dyn Connection>>,
    pub status: StatusLine,
}

impl SessionContext {
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Dials `host_spec`, resolving aliases through the credential store
    pub async fn connect(&mut self, host_spec: &str) -> Result<Arc<dyn Connection>> {
        let destination = Destination::parse(host_spec, self.manager.resolver().store().as_ref())?;
        let connection = self
            .manager
            .dial(&destination, &self.options, &self.cancel_token)
            .await?;
        self.status.finish(&format!("Connected to {}", destination.host));
        self.connection = Some(connection.clone());
        Ok(connection)
    }

    /// Opens the translator serving `location`
    async fn translator(
        &mut self,
        location: &FileLocation,
        config: &TransferConfig,
    ) -> Result<Box<dyn Translator>> {
        let Some(host_spec) = &location.host_spec else {
            return Ok(Box::new(LocalTranslator::new(config.clone())));
        };
        let connection = self.connect(host_spec).await?;
        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => Err(Error::Cancelled),
            translator = connection.open_sftp(config.clone()) => translator,
        }
    }
}

/// Work a session drives to completion
#[async_trait]
pub trait Operation: Send {
    /// Runs until done. Cancellation resolves as
    /// `Ok(SessionStatus::Cancelled)` or `Err(Error::Cancelled)`.
    async fn run(&mut self, ctx: &mut SessionContext) -> Result<SessionStatus>;
}

/// Control loop for one operation
pub struct Session<O: Operation> {
    operation: O,
    ctx: SessionContext,
}

impl<O: Operation> Session<O> {
    /// # Arguments
    ///
    /// * `operation` - Work to drive, e.g. [`FileTransfer`] or [`InteractiveShell`]
    /// * `manager` - Dials every host the operation names
    /// * `options` - Identity and timeout used for each dial
    ///
    /// # Example
    ///
    /// ```ignore
    /// let transfer = FileTransfer::new(&sources, "/sftp:box:/srv/inbox", config)?;
    /// let status = Session::new(transfer, manager, options).run().await;
    /// std::process::exit(status.exit_code());
    /// ```
    pub fn new(operation: O, manager: Arc<ConnectionManager>, options: ConnectOptions) -> Self {
        Self {
            operation,
            ctx: SessionContext {
                manager,
                options,
                cancel_token: CancellationToken::new(),
                connection: None,
                status: StatusLine::stderr(),
            },
        }
    }

    pub fn with_status(mut self, status: StatusLine) -> Self {
        self.ctx.status = status;
        self
    }

    /// Token cancelled by Ctrl-C. Cancelling it more than once is harmless.
    pub fn cancel_token(&self) -> CancellationToken {
        self.ctx.cancel_token.clone()
    }

    /// Runs the operation until it completes, fails or is interrupted, then
    /// prints the final status on a fresh line and closes pooled connections.
    ///
    /// # Returns
    ///
    /// - `Completed` if the operation finished
    /// - `Cancelled` after Ctrl-C or a cancelled token
    /// - `Failed` with the error message otherwise
    pub async fn run(mut self) -> SessionStatus {
        let cancel_token = self.ctx.cancel_token.clone();
        let interrupts = tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, cancelling");
                cancel_token.cancel();
            }
        });

        let status = match self.operation.run(&mut self.ctx).await {
            Ok(status) => status,
            Err(e) if e.is_cancelled() => SessionStatus::Cancelled,
            Err(e) => {
                if e.is_connection_level() {
                    warn!("Session aborted: {}", e);
                } else {
                    warn!("Transfer failed: {}", e);
                }
                SessionStatus::Failed(e.to_string())
            }
        };
        interrupts.abort();

        match &status {
            SessionStatus::Completed => {}
            SessionStatus::Cancelled => self.ctx.status.finish("Cancelled."),
            SessionStatus::Failed(message) => self.ctx.status.finish(&format!("Error: {message}")),
        }
        if let Some(connection) = self.ctx.connection.take() {
            debug!("Releasing connection to {}", connection.destination());
        }
        self.ctx.manager.disconnect_all().await;
        status
    }
}

/// Copies one or more sources to a destination
pub struct FileTransfer {
    sources: Vec<FileLocation>,
    destination: FileLocation,
    config: TransferConfig,
}

impl FileTransfer {
    /// Parses every location up front so malformed input fails before any
    /// connection is attempted. All sources must live on the same host.
    ///
    /// # Arguments
    ///
    /// * `sources` - Local paths or `/<protocol>:<host-spec>:<path>` locations
    /// * `destination` - Target file or directory, in the same notation
    /// * `config` - Chunk size and write mode
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for a malformed location, an empty source list,
    /// or sources spread over several hosts.
    pub fn new(sources: &[String], destination: &str, config: TransferConfig) -> Result<Self> {
        let sources = sources
            .iter()
            .map(|s| s.parse::<FileLocation>())
            .collect::<Result<Vec<_>>>()?;
        let Some(first) = sources.first() else {
            return Err(Error::Validation("no source given".into()));
        };
        if sources.iter().any(|s| s.host_spec != first.host_spec) {
            return Err(Error::Validation(
                "all sources must be on the same host".into(),
            ));
        }
        Ok(Self {
            sources,
            destination: destination.parse()?,
            config,
        })
    }
}

#[async_trait]
impl Operation for FileTransfer {
    async fn run(&mut self, ctx: &mut SessionContext) -> Result<SessionStatus> {
        let source = ctx.translator(&self.sources[0], &self.config).await?;
        let destination = ctx.translator(&self.destination, &self.config).await?;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let paths: Vec<PathBuf> = self.sources.iter().map(|s| PathBuf::from(&s.path)).collect();
        let dest_path = PathBuf::from(&self.destination.path);
        let cancel_token = ctx.cancel_token.clone();
        let write_mode = self.config.write_mode;
        let (source_ref, destination_ref) = (source.as_ref(), destination.as_ref());
        let copy = async move {
            let orchestrator = TransferOrchestrator::new(source_ref, destination_ref, write_mode, tx);
            let entries = orchestrator.resolve_sources(&paths).await?;
            orchestrator.copy(entries, &dest_path, &cancel_token).await
        };

        let status = &mut ctx.status;
        let render = async {
            while let Some(event) = rx.recv().await {
                match event {
                    TransferEvent::FileStarted { src_file, file_size, .. } => {
                        status.update(&progress_line(&src_file, 0, file_size, None));
                    }
                    TransferEvent::Progress(p) => status.update(&progress_line(
                        &p.src_file,
                        p.bytes_written,
                        p.file_size,
                        p.speed_kbps,
                    )),
                    TransferEvent::FileFinished {
                        src_file,
                        file_size,
                        bytes_written,
                        speed_kbps,
                        files_completed,
                        queued,
                    } => {
                        status.commit(&progress_line(
                            &src_file,
                            bytes_written,
                            file_size,
                            speed_kbps,
                        ));
                        debug!("{} done ({}/{})", src_file, files_completed, queued);
                    }
                    TransferEvent::DirectoryCreated { path } => debug!("Created {}", path),
                }
            }
        };
        let (outcome, ()) = tokio::join!(copy, render);

        for translator in [source, destination] {
            let label = translator.label().to_string();
            if let Err(e) = translator.close().await {
                warn!("Failed to close {}: {}", label, e);
            }
        }

        let outcome = outcome?;
        let summary = outcome.summary();
        let line = format!(
            "{} of {} files copied ({} bytes) in {:.1}s",
            summary.files_completed,
            summary.files_total,
            summary.bytes_written,
            summary.elapsed.as_secs_f64()
        );
        Ok(match outcome {
            TransferOutcome::Completed(_) => {
                ctx.status.finish(&line);
                SessionStatus::Completed
            }
            TransferOutcome::Cancelled(_) => {
                ctx.status.finish(&line);
                SessionStatus::Cancelled
            }
        })
    }
}

/// Remote login shell wired to the local stdin and stdout
pub struct InteractiveShell {
    host_spec: String,
}

impl InteractiveShell {
    pub fn new(host_spec: impl Into<String>) -> Result<Self> {
        let host_spec = host_spec.into();
        if host_spec.is_empty() {
            return Err(Error::Validation("missing host for shell".into()));
        }
        Ok(Self { host_spec })
    }
}

#[async_trait]
impl Operation for InteractiveShell {
    async fn run(&mut self, ctx: &mut SessionContext) -> Result<SessionStatus> {
        let connection = ctx.connect(&self.host_spec).await?;
        let (mut remote_out, mut remote_in) = connection.open_interactive_shell().await?;
        let mut local_in = ReaderSource::new(tokio::io::stdin(), 1024);
        let mut local_out = WriterSink::new(tokio::io::stdout());

        // ends both directions once the remote side closes
        let shell_token = ctx.cancel_token.child_token();
        let output = async {
            let result = pump(remote_out.as_mut(), &mut local_out, &shell_token, |_| {}).await;
            shell_token.cancel();
            result
        };
        let input = pump(&mut local_in, remote_in.as_mut(), &shell_token, |_| {});
        let (output, input) = tokio::join!(output, input);

        if ctx.cancel_token.is_cancelled() {
            return Ok(SessionStatus::Cancelled);
        }
        if let Err(e) = input {
            debug!("Shell input ended with {}", e);
        }
        match output? {
            PumpOutcome::Finished(bytes) => {
                info!("Shell closed after {} bytes of output", bytes);
                ctx.status.finish(&format!("Connection to {} closed.", self.host_spec));
                Ok(SessionStatus::Completed)
            }
            PumpOutcome::Cancelled(_) => Ok(SessionStatus::Cancelled),
        }
    }
}

/// Terminal-backed [`LinePrompt`] writing to stderr
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

#[async_trait]
impl LinePrompt for TerminalPrompt {
    async fn read_line(&self, prompt: &str, echo: bool) -> Option<String> {
        let prompt = prompt.to_string();
        let answer = tokio::task::spawn_blocking(move || -> io::Result<Option<String>> {
            if !echo {
                return rpassword::prompt_password(prompt).map(Some);
            }
            let mut stderr = io::stderr();
            stderr.write_all(prompt.as_bytes())?;
            stderr.flush()?;
            let mut line = String::new();
            if io::stdin().read_line(&mut line)? == 0 {
                return Ok(None);
            }
            Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
        })
        .await;
        match answer {
            Ok(Ok(line)) => line,
            Ok(Err(e)) => {
                debug!("Failed to read from terminal: {e}");
                None
            }
            Err(e) => {
                warn!("Prompt task failed: {e}");
                None
            }
        }
    }

    async fn notify(&self, message: &str) {
        eprintln!("{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthChainResolver, AuthKind, MemoryCredentialStore};
    use crate::connection::tests::{Counters, MockDialer};
    use crate::trust::tests::ScriptedPrompt;
    use crate::trust::{HostClassification, HostTrustVerifier};
    use std::sync::Mutex;
    use std::sync::atomic::Ordering;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn manager() -> (Arc<ConnectionManager>, Arc<Counters>) {
        let dialer = MockDialer::new(HostClassification::KnownMatching, AuthKind::None);
        let counters = dialer.counters.clone();
        let prompt = Arc::new(ScriptedPrompt::new(&[]));
        let resolver = AuthChainResolver::new(Arc::new(MemoryCredentialStore::new()), prompt.clone());
        let manager =
            ConnectionManager::new(Arc::new(dialer), resolver, HostTrustVerifier::new(prompt))
                .pooled();
        (Arc::new(manager), counters)
    }

    #[test]
    fn status_line_pads_over_longer_text() {
        let mut line = StatusLine::new(Vec::new());
        line.update("file.bin - 100 of 250 - 3kb/S");
        line.update("x - 1 of 2");
        line.finish("done");

        let out = String::from_utf8(line.into_inner()).unwrap();
        let expected_pad = " ".repeat("file.bin - 100 of 250 - 3kb/S".len() - "x - 1 of 2".len());
        assert!(out.contains(&format!("\rx - 1 of 2{expected_pad}")));
        assert!(out.ends_with("\ndone\n"));
    }

    #[test]
    fn committed_line_is_kept() {
        let mut line = StatusLine::new(Vec::new());
        line.update("a - 64 of 100 - 0kb/S");
        line.commit("a - 100 of 100 - 0kb/S");
        line.update("b - 0 of 9 - 0kb/S");
        line.finish("done");

        let out = String::from_utf8(line.into_inner()).unwrap();
        assert_eq!(
            out,
            "\ra - 64 of 100 - 0kb/S\ra - 100 of 100 - 0kb/S\n\rb - 0 of 9 - 0kb/S\ndone\n"
        );
    }

    #[test]
    fn final_line_without_progress_needs_no_break() {
        let mut line = StatusLine::new(Vec::new());
        line.finish("Connected to example.com");
        assert_eq!(line.into_inner(), b"Connected to example.com\n");
    }

    #[test]
    fn progress_line_format() {
        assert_eq!(
            progress_line("/data/report.csv", 512, 2048, Some(12.4)),
            "report.csv - 512 of 2048 - 12kb/S"
        );
        assert_eq!(progress_line("a", 0, 0, None), "a - 0 of 0 - 0kb/S");
    }

    #[test]
    fn exit_codes() {
        assert_eq!(SessionStatus::Completed.exit_code(), 0);
        assert_eq!(SessionStatus::Cancelled.exit_code(), EXIT_CANCELLED);
        assert_eq!(SessionStatus::Failed("x".into()).exit_code(), 1);
    }

    #[test]
    fn malformed_locations_fail_before_connecting() {
        let err = FileTransfer::new(&["/sftp:onlyonecolon".into()], "out", TransferConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Validation(_)));

        let err = FileTransfer::new(
            &["/sftp:a@one:x".into(), "/sftp:a@two:y".into()],
            "out",
            TransferConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::Validation(_)));
        assert!(InteractiveShell::new("").is_err());
    }

    #[tokio::test]
    async fn local_copy_session_completes() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.txt");
        std::fs::write(&src, b"hello session").unwrap();
        let dest = dir.path().join("out.txt");

        let (manager, counters) = manager();
        let buf = SharedBuf::default();
        let op = FileTransfer::new(
            &[src.display().to_string()],
            &dest.display().to_string(),
            TransferConfig::default(),
        )
        .unwrap();
        let status = Session::new(op, manager, ConnectOptions::default())
            .with_status(StatusLine::new(Box::new(buf.clone())))
            .run()
            .await;

        assert_eq!(status, SessionStatus::Completed);
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello session");
        assert!(buf.text().contains("in.txt - 13 of 13"));
        assert!(buf.text().contains("1 of 1 files copied"));
        assert_eq!(counters.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn every_file_keeps_its_final_progress_line() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, vec![1u8; 100]).unwrap();
        std::fs::write(&b, vec![2u8; 250]).unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir(&out).unwrap();

        let (manager, _) = manager();
        let buf = SharedBuf::default();
        let op = FileTransfer::new(
            &[a.display().to_string(), b.display().to_string()],
            &out.display().to_string(),
            TransferConfig::new(64, crate::types::WriteMode::Truncate),
        )
        .unwrap();
        let status = Session::new(op, manager, ConnectOptions::default())
            .with_status(StatusLine::new(Box::new(buf.clone())))
            .run()
            .await;

        assert_eq!(status, SessionStatus::Completed);
        let text = buf.text();
        assert!(text.contains("\ra - 100 of 100 - 0kb/S\n"), "{text:?}");
        assert!(text.contains("\rb - 250 of 250 - 0kb/S\n"), "{text:?}");
        assert!(text.contains("\n2 of 2 files copied (350 bytes)"));
    }

    #[tokio::test]
    async fn remote_copy_dials_once_and_reports_host() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.txt");
        std::fs::write(&src, b"via mock").unwrap();
        let dest = dir.path().join("out.txt");

        let (manager, counters) = manager();
        let buf = SharedBuf::default();
        // the mock connection serves sftp from the local disk
        let op = FileTransfer::new(
            &[format!("/sftp:alice@example.com:{}", src.display())],
            &dest.display().to_string(),
            TransferConfig::default(),
        )
        .unwrap();
        let status = Session::new(op, manager, ConnectOptions::default())
            .with_status(StatusLine::new(Box::new(buf.clone())))
            .run()
            .await;

        assert_eq!(status, SessionStatus::Completed);
        assert_eq!(std::fs::read(&dest).unwrap(), b"via mock");
        assert!(buf.text().contains("Connected to example.com\n"));
        assert_eq!(counters.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_session_reports_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.txt");
        std::fs::write(&src, b"never copied").unwrap();

        let (manager, _) = manager();
        let buf = SharedBuf::default();
        let op = FileTransfer::new(
            &[src.display().to_string()],
            &dir.path().join("out.txt").display().to_string(),
            TransferConfig::default(),
        )
        .unwrap();
        let session = Session::new(op, manager, ConnectOptions::default())
            .with_status(StatusLine::new(Box::new(buf.clone())));
        let token = session.cancel_token();
        token.cancel();
        token.cancel();

        let status = session.run().await;
        assert_eq!(status, SessionStatus::Cancelled);
        assert_eq!(status.exit_code(), EXIT_CANCELLED);
        assert!(!dir.path().join("out.txt").exists());
    }

    #[tokio::test]
    async fn missing_source_fails_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager();
        let buf = SharedBuf::default();
        let op = FileTransfer::new(
            &[dir.path().join("absent").display().to_string()],
            &dir.path().join("out").display().to_string(),
            TransferConfig::default(),
        )
        .unwrap();

        let status = Session::new(op, manager, ConnectOptions::default())
            .with_status(StatusLine::new(Box::new(buf.clone())))
            .run()
            .await;

        assert!(matches!(status, SessionStatus::Failed(_)));
        assert!(buf.text().starts_with("Error: no such file or directory"));
    }
}
