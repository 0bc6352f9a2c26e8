use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use openssh::{KnownHosts, Session, SessionBuilder, Stdio};
use openssh_sftp_client::{Sftp, SftpOptions};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthKind, AuthMethod};
use crate::connection::askpass::{ASKPASS_SOCKET_ENV, AskpassServer, Responder};
use crate::connection::{AuthResponse, ConnectOptions, Connection, Dialer, Transport};
use crate::error::{Error, Result};
use crate::location::{DEFAULT_SSH_PORT, Destination};
use crate::stream::{ChunkSink, ChunkSource, ReaderSource, WriterSink};
use crate::translator::{SftpTranslator, Translator};
use crate::trust::{HostClassification, HostIdentity};
use crate::types::TransferConfig;

/// Key types in the order their fingerprint is preferred for display
const PREFERRED_KEY_TYPES: [&str; 4] = [
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "rsa-sha2-512",
    "ssh-rsa",
];

/// Remote command started for interactive sessions
const LOGIN_SHELL: &str = "exec \"${SHELL:-/bin/sh}\" -i";

/// Distinguishes control directories of masters started by this process
static MASTER_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Dials through the system `ssh` binary using a control master
#[derive(Debug, Clone)]
pub struct OpensshDialer {
    control_dir: PathBuf,
    known_hosts: PathBuf,
}

impl OpensshDialer {
    /// # Arguments
    ///
    /// * `control_dir` - Directory for SSH control sockets
    /// * `known_hosts` - Host key file consulted and updated on trust decisions
    pub fn new(control_dir: impl Into<PathBuf>, known_hosts: impl Into<PathBuf>) -> Self {
        Self {
            control_dir: control_dir.into(),
            known_hosts: known_hosts.into(),
        }
    }
}

#[async_trait]
impl Dialer for OpensshDialer {
    async fn dial(
        &self,
        destination: &Destination,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Transport>> {
        tokio::fs::create_dir_all(&self.control_dir)
            .await
            .map_err(|e| Error::from_io(&self.control_dir, e))?;
        Ok(Box::new(OpensshTransport {
            destination: destination.clone(),
            connect_timeout: options.connect_timeout,
            control_dir: self.control_dir.clone(),
            known_hosts: self.known_hosts.clone(),
            scanned: Vec::new(),
            session: None,
            master_dir: None,
        }))
    }
}

/// One `known_hosts`-style key line
#[derive(Debug, Clone, PartialEq, Eq)]
struct HostKeyLine {
    key_type: String,
    blob: String,
}

/// Parses `host type base64 [comment]` lines, skipping comments and markers
fn parse_key_lines(output: &str) -> Vec<HostKeyLine> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('@'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace().skip(1);
            Some(HostKeyLine {
                key_type: fields.next()?.to_string(),
                blob: fields.next()?.to_string(),
            })
        })
        .collect()
}

/// OpenSSH-style `SHA256:` fingerprint of a base64 key blob
pub(crate) fn fingerprint(blob: &str) -> Option<String> {
    let raw = STANDARD.decode(blob).ok()?;
    Some(format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(&raw))))
}

/// Compares the keys the server offered with the stored ones
fn classify(scanned: &[HostKeyLine], known: Option<&[HostKeyLine]>) -> HostClassification {
    match known {
        None => HostClassification::NotFound,
        Some([]) => HostClassification::Unknown,
        Some(known) if scanned.iter().any(|k| known.contains(k)) => {
            HostClassification::KnownMatching
        }
        Some(_) => HostClassification::KnownChanged,
    }
}

fn preferred_key(scanned: &[HostKeyLine]) -> Option<&HostKeyLine> {
    PREFERRED_KEY_TYPES
        .iter()
        .find_map(|t| scanned.iter().find(|k| k.key_type == *t))
        .or_else(|| scanned.first())
}

/// Transport state between dial and authentication
struct OpensshTransport {
    destination: Destination,
    connect_timeout: Duration,
    control_dir: PathBuf,
    known_hosts: PathBuf,
    scanned: Vec<HostKeyLine>,
    session: Option<Session>,
    /// Control directory of a master started without `SessionBuilder`
    master_dir: Option<PathBuf>,
}

impl OpensshTransport {
    /// Host pattern as written to known_hosts
    fn host_pattern(&self) -> String {
        if self.destination.port == DEFAULT_SSH_PORT {
            self.destination.host.clone()
        } else {
            format!("[{}]:{}", self.destination.host, self.destination.port)
        }
    }

    fn dial_error(&self, reason: impl Into<String>) -> Error {
        Error::Dial {
            destination: self.destination.to_string(),
            reason: reason.into(),
        }
    }

    async fn scan_host_keys(&self) -> Result<Vec<HostKeyLine>> {
        let timeout = self.connect_timeout.as_secs().max(1).to_string();
        let port = self.destination.port.to_string();
        let output = Command::new("ssh-keyscan")
            .args(["-T", timeout.as_str(), "-p", port.as_str()])
            .arg(&self.destination.host)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.dial_error(format!("failed to run ssh-keyscan: {e}")))?;
        let keys = parse_key_lines(&String::from_utf8_lossy(&output.stdout));
        if keys.is_empty() {
            return Err(self.dial_error(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(keys)
    }

    /// `None` when there is no known_hosts file at all
    async fn known_host_keys(&self) -> Result<Option<Vec<HostKeyLine>>> {
        if !tokio::fs::try_exists(&self.known_hosts).await.unwrap_or(false) {
            return Ok(None);
        }
        let output = Command::new("ssh-keygen")
            .arg("-F")
            .arg(self.host_pattern())
            .arg("-f")
            .arg(&self.known_hosts)
            .output()
            .await
            .map_err(|e| Error::from_io(&self.known_hosts, e))?;
        // ssh-keygen exits with 1 when the host is simply not present
        Ok(Some(parse_key_lines(&String::from_utf8_lossy(&output.stdout))))
    }

    /// Arguments for a control master that authenticates only with `kind`.
    ///
    /// `SessionBuilder` always passes `BatchMode=yes`, which stops `ssh` from
    /// asking for passwords at all, so these masters are started by hand.
    fn askpass_master_args(&self, kind: AuthKind, ctl: &Path, log: &Path) -> Vec<OsString> {
        let mut known_hosts = OsString::from("UserKnownHostsFile=");
        known_hosts.push(&self.known_hosts);
        let mut args: Vec<OsString> = vec![
            "-E".into(),
            log.into(),
            "-S".into(),
            ctl.into(),
            "-M".into(),
            "-f".into(),
            "-N".into(),
            "-o".into(),
            "ControlPersist=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=yes".into(),
            "-o".into(),
            known_hosts,
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)).into(),
            "-o".into(),
            format!("PreferredAuthentications={kind}").into(),
            "-o".into(),
            "PubkeyAuthentication=no".into(),
            "-o".into(),
            "NumberOfPasswordPrompts=1".into(),
            "-p".into(),
            self.destination.port.to_string().into(),
        ];
        if let Some(user) = &self.destination.user {
            args.push("-l".into());
            args.push(user.into());
        }
        args.push(self.destination.host.as_str().into());
        args
    }

    /// Starts a master whose prompts are answered by `responder`
    async fn connect_with_askpass(
        &mut self,
        kind: AuthKind,
        responder: Responder,
    ) -> Result<AuthResponse> {
        let helper = std::env::current_exe()
            .map_err(|e| self.dial_error(format!("cannot locate askpass helper: {e}")))?;
        let dir = self.control_dir.join(format!(
            ".fcp-{}-{}",
            std::process::id(),
            MASTER_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::from_io(&dir, e))?;
        let socket = dir.join("askpass");
        let server = AskpassServer::bind(&socket, responder).map_err(|e| Error::from_io(&socket, e))?;
        let ctl = dir.join("master");
        let log = dir.join("log");

        debug!("Starting {} master for {}", kind, self.destination);
        let status = Command::new("ssh")
            .args(self.askpass_master_args(kind, &ctl, &log))
            .env("SSH_ASKPASS", &helper)
            .env("SSH_ASKPASS_REQUIRE", "force")
            .env(ASKPASS_SOCKET_ENV, server.socket())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| self.dial_error(format!("failed to run ssh: {e}")))?;
        debug!("ssh asked {} question(s)", server.prompts_seen());
        drop(server);

        if status.success() {
            self.session = Some(Session::resume(
                ctl.into_boxed_path(),
                Some(log.into_boxed_path()),
            ));
            self.master_dir = Some(dir);
            return Ok(AuthResponse::Accepted);
        }

        let output = tokio::fs::read_to_string(&log).await.unwrap_or_default();
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            debug!("Failed to remove {:?}: {e}", dir);
        }
        let reason = output.trim().to_string();
        if reason.contains("Permission denied") {
            Ok(AuthResponse::Rejected(reason))
        } else {
            error!("Failed to connect to {}: {}", self.destination, reason);
            Err(self.dial_error(reason))
        }
    }

    async fn connect_with(&mut self, keyfile: Option<&Path>) -> Result<AuthResponse> {
        let mut builder = SessionBuilder::default();
        builder
            .control_directory(&self.control_dir)
            .known_hosts_check(KnownHosts::Strict)
            .user_known_hosts_file(&self.known_hosts)
            .connect_timeout(self.connect_timeout)
            .port(self.destination.port);
        if let Some(user) = &self.destination.user {
            builder.user(user.clone());
        }
        if let Some(keyfile) = keyfile {
            builder.keyfile(keyfile);
        }

        match builder.connect(&self.destination.host).await {
            Ok(session) => {
                self.session = Some(session);
                Ok(AuthResponse::Accepted)
            }
            Err(e) => {
                let reason = e.to_string();
                let detail = std::error::Error::source(&e)
                    .map(|s| s.to_string())
                    .unwrap_or_default();
                if reason.contains("Permission denied") || detail.contains("Permission denied") {
                    Ok(AuthResponse::Rejected(format!("{reason} {detail}").trim().to_string()))
                } else {
                    error!("Failed to connect to {}: {:?}", self.destination, e);
                    Err(self.dial_error(format!("{reason} {detail}").trim().to_string()))
                }
            }
        }
    }
}

#[async_trait]
impl Transport for OpensshTransport {
    async fn handshake(&mut self) -> Result<HostIdentity> {
        self.scanned = self.scan_host_keys().await?;
        let known = self.known_host_keys().await?;
        let classification = classify(&self.scanned, known.as_deref());
        let fingerprint = preferred_key(&self.scanned)
            .and_then(|k| fingerprint(&k.blob))
            .unwrap_or_default();
        debug!(
            "Host {} classified as {:?} ({})",
            self.destination, classification, fingerprint
        );
        Ok(HostIdentity {
            host: self.destination.host.clone(),
            fingerprint,
            classification,
        })
    }

    async fn persist_host_identity(&mut self, identity: &HostIdentity) -> Result<()> {
        let pattern = self.host_pattern();
        if identity.classification == HostClassification::KnownChanged {
            let status = Command::new("ssh-keygen")
                .arg("-R")
                .arg(&pattern)
                .arg("-f")
                .arg(&self.known_hosts)
                .output()
                .await
                .map_err(|e| Error::from_io(&self.known_hosts, e))?;
            if !status.status.success() {
                warn!("ssh-keygen -R {} exited with {}", pattern, status.status);
            }
        }

        if let Some(parent) = self.known_hosts.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::from_io(parent, e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.known_hosts)
            .await
            .map_err(|e| Error::from_io(&self.known_hosts, e))?;
        let lines: String = self
            .scanned
            .iter()
            .map(|k| format!("{} {} {}\n", pattern, k.key_type, k.blob))
            .collect();
        file.write_all(lines.as_bytes())
            .await
            .map_err(|e| Error::from_io(&self.known_hosts, e))?;
        file.flush()
            .await
            .map_err(|e| Error::from_io(&self.known_hosts, e))?;
        info!("Stored host key for {} in {:?}", pattern, self.known_hosts);
        Ok(())
    }

    async fn authenticate(&mut self, method: &AuthMethod) -> Result<AuthResponse> {
        match method {
            AuthMethod::PublicKey(key) => self.connect_with(Some(&key.path)).await,
            // ssh falls back to the agent and its own configured identities
            AuthMethod::None => self.connect_with(None).await,
            AuthMethod::Password(secret) => {
                self.connect_with_askpass(AuthKind::Password, Responder::Secret(secret.clone()))
                    .await
            }
            AuthMethod::KeyboardInteractive(prompt) => {
                self.connect_with_askpass(
                    AuthKind::KeyboardInteractive,
                    Responder::Prompt(prompt.clone()),
                )
                .await
            }
        }
    }

    async fn establish(self: Box<Self>) -> Result<Arc<dyn Connection>> {
        let destination = self.destination.clone();
        let session = self
            .session
            .ok_or_else(|| Error::Dial {
                destination: destination.to_string(),
                reason: "not authenticated".into(),
            })?;
        Ok(Arc::new(OpensshConnection {
            destination,
            session: Mutex::new(Some(Arc::new(session))),
            master_dir: self.master_dir,
        }))
    }
}

/// Routine to check the underlying SSH connection is active or not for the SFTP client.
/// This function runs in a loop, checking the connection every 10 seconds.
/// It will continue indefinitely until the connection fails.
fn check_connection<'session>(
    session: &'session Session,
) -> std::pin::Pin<
    Box<dyn std::future::Future<Output = Result<(), openssh::Error>> + Send + Sync + 'session>,
> {
    Box::pin(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(10)).await;
            session.check().await?;
        }
        #[allow(unreachable_code)]
        Ok(())
    })
}

/// Authenticated connection over an OpenSSH control master.
///
/// The session lock serializes channel opening so requests on one
/// connection never interleave.
struct OpensshConnection {
    destination: Destination,
    session: Mutex<Option<Arc<Session>>>,
    /// Removed once the master has exited
    master_dir: Option<PathBuf>,
}

impl OpensshConnection {
    fn closed_error(&self) -> Error {
        Error::Dial {
            destination: self.destination.to_string(),
            reason: "SSH session not connected".into(),
        }
    }
}

#[async_trait]
impl Connection for OpensshConnection {
    fn destination(&self) -> &Destination {
        &self.destination
    }

    async fn open_sftp(&self, config: TransferConfig) -> Result<Box<dyn Translator>> {
        debug!("Creating sftp client from session");
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or_else(|| self.closed_error())?;
        session.check().await.map_err(|_| Error::Dial {
            destination: self.destination.to_string(),
            reason: "sftp session is already closed".into(),
        })?;

        let sftp = Sftp::from_clonable_session_with_check_connection(
            session.clone(),
            SftpOptions::default(),
            check_connection, /* if the ssh connection is dropped this sftp client can notice and fail the ongoing operation */
        )
        .await
        .map_err(|e| Error::Dial {
            destination: self.destination.to_string(),
            reason: format!("failed to start sftp subsystem: {e}"),
        })?;
        debug!("sftp client created successfully");
        Ok(Box::new(SftpTranslator::new(
            sftp,
            config,
            self.destination.to_string(),
        )))
    }

    async fn open_interactive_shell(&self) -> Result<(Box<dyn ChunkSource>, Box<dyn ChunkSink>)> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or_else(|| self.closed_error())?;
        let mut child = session
            .clone()
            .arc_raw_command(LOGIN_SHELL)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .await
            .map_err(|e| Error::Dial {
                destination: self.destination.to_string(),
                reason: format!("failed to start shell: {e}"),
            })?;
        let stdin = child.stdin().take().ok_or_else(|| self.closed_error())?;
        let stdout = child.stdout().take().ok_or_else(|| self.closed_error())?;
        info!("Interactive shell opened on {}", self.destination);
        let destination = self.destination.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!("Shell on {} exited with {:?}", destination, status),
                Err(e) => warn!("Shell on {} ended abnormally: {}", destination, e),
            }
        });
        Ok((
            Box::new(ReaderSource::new(stdout, 4096)),
            Box::new(WriterSink::new(stdin)),
        ))
    }

    async fn is_alive(&self) -> bool {
        match self.session.lock().await.as_ref() {
            Some(session) => session.check().await.is_ok(),
            None => false,
        }
    }

    /// Closes the SSH session if no SFTP clients are using it
    async fn close(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.take() else {
            return Ok(());
        };
        match Arc::try_unwrap(session) {
            Ok(session) => {
                info!("No sftp client is using the session anymore so can close the session");
                session.close().await.map_err(|e| Error::Dial {
                    destination: self.destination.to_string(),
                    reason: e.to_string(),
                })?;
                if let Some(dir) = &self.master_dir {
                    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                        debug!("Failed to remove {:?}: {e}", dir);
                    }
                }
                Ok(())
            }
            Err(session) => {
                // Put it back if we couldn't close it
                error!("Some sftp client still has the session instance so could not close session");
                *guard = Some(session);
                Err(self.closed_error())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCAN: &str = "\
# example.com:22 SSH-2.0-OpenSSH_9.6
example.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl
example.com ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQ
";

    #[test]
    fn parses_scan_output() {
        let keys = parse_key_lines(SCAN);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].key_type, "ssh-ed25519");
        assert_eq!(preferred_key(&keys).unwrap().key_type, "ssh-ed25519");
    }

    #[test]
    fn fingerprint_is_unpadded_sha256() {
        let keys = parse_key_lines(SCAN);
        let fp = fingerprint(&keys[0].blob).unwrap();
        assert!(fp.starts_with("SHA256:"));
        assert_eq!(fp.len(), "SHA256:".len() + 43);
        assert!(!fp.ends_with('='));
        assert!(fingerprint("not base64!").is_none());
    }

    fn transport(user: Option<&str>, port: u16) -> OpensshTransport {
        OpensshTransport {
            destination: Destination {
                user: user.map(str::to_string),
                host: "example.com".into(),
                port,
                alias: "box".into(),
            },
            connect_timeout: Duration::from_secs(15),
            control_dir: PathBuf::from("/tmp/fcp"),
            known_hosts: PathBuf::from("/home/alice/.ssh/known_hosts"),
            scanned: Vec::new(),
            session: None,
            master_dir: None,
        }
    }

    #[test]
    fn askpass_master_allows_prompts_for_one_method() {
        let transport = transport(Some("alice"), 2222);
        let args: Vec<String> = transport
            .askpass_master_args(
                AuthKind::KeyboardInteractive,
                Path::new("/tmp/fcp/.fcp-1-0/master"),
                Path::new("/tmp/fcp/.fcp-1-0/log"),
            )
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect();

        assert!(!args.iter().any(|a| a.starts_with("BatchMode")));
        for option in [
            "PreferredAuthentications=keyboard-interactive",
            "PubkeyAuthentication=no",
            "StrictHostKeyChecking=yes",
            "UserKnownHostsFile=/home/alice/.ssh/known_hosts",
            "ConnectTimeout=15",
        ] {
            assert!(args.iter().any(|a| a == option), "missing {option}");
        }
        assert_eq!(&args[..4], ["-E", "/tmp/fcp/.fcp-1-0/log", "-S", "/tmp/fcp/.fcp-1-0/master"]);
        assert_eq!(&args[args.len() - 5..], ["-p", "2222", "-l", "alice", "example.com"]);

        let anonymous = self::transport(None, DEFAULT_SSH_PORT);
        let args = anonymous.askpass_master_args(AuthKind::Password, Path::new("m"), Path::new("l"));
        assert!(args.contains(&OsString::from("PreferredAuthentications=password")));
        assert!(!args.contains(&OsString::from("-l")));
    }

    #[test]
    fn classification_follows_known_hosts() {
        let scanned = parse_key_lines(SCAN);
        let changed = parse_key_lines("example.com ssh-ed25519 AAAAother");

        assert_eq!(classify(&scanned, None), HostClassification::NotFound);
        assert_eq!(classify(&scanned, Some(&[])), HostClassification::Unknown);
        assert_eq!(
            classify(&scanned, Some(&scanned[1..])),
            HostClassification::KnownMatching
        );
        assert_eq!(
            classify(&scanned, Some(&changed)),
            HostClassification::KnownChanged
        );
    }
}
