// Module declarations
mod auth;
mod config;
mod connection;
mod error;
mod location;
mod session;
mod stream;
mod transfer;
mod translator;
mod trust;
mod types;

// Public API exports
pub use auth::{
    AuthChainResolver, AuthKind, AuthMethod, CredentialStore, DEFAULT_KEY_NAMES, HostRecord,
    KeyMaterial, MemoryCredentialStore, Secret, SshDirCredentialStore,
};
pub use config::{ClientConfig, default_config_path};
pub use connection::{
    ASKPASS_SOCKET_ENV, AuthResponse, ConnectOptions, Connection, ConnectionManager, Dialer,
    OpensshDialer, Transport, askpass_helper,
};
pub use error::{AuthAttempt, Error, Result};
pub use location::{DEFAULT_SSH_PORT, Destination, FileLocation, Protocol};
pub use session::{
    EXIT_CANCELLED, FileTransfer, InteractiveShell, Operation, Session, SessionContext,
    SessionStatus, StatusLine, TerminalPrompt, progress_line,
};
pub use stream::{
    ByteChunk, ChunkSink, ChunkSource, PumpOutcome, ReaderSource, WriterSink, pump,
};
pub use transfer::TransferOrchestrator;
pub use translator::{EntryStream, LocalTranslator, SftpTranslator, Translator};
pub use trust::{HostClassification, HostIdentity, HostTrustVerifier, LinePrompt, TrustDecision};
pub use types::{
    Entry, EntryKind, FileTransferProgress, TransferConfig, TransferEvent, TransferOutcome,
    TransferSummary, WriteMode,
};

// Re-export commonly used external types for convenience
pub use tokio_util::sync::CancellationToken;
