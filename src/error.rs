use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::auth::AuthKind;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One failed authentication attempt, kept for the `AuthExhausted` report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthAttempt {
    pub kind: AuthKind,
    pub reason: String,
}

/// Errors surfaced by connections, translators and transfers
#[derive(Debug, Error)]
pub enum Error {
    /// Bad user input, detected locally before any connection attempt
    #[error("validation error: {0}")]
    Validation(String),

    #[error("could not connect to {destination}: {reason}")]
    Dial { destination: String, reason: String },

    #[error("authentication failed, tried {}", AttemptList(.attempts))]
    AuthExhausted { attempts: Vec<AuthAttempt> },

    #[error("host key for {host} was rejected (fingerprint {fingerprint})")]
    HostKeyRejected { host: String, fingerprint: String },

    #[error("no such file or directory: {}", .0.display())]
    PathNotFound(PathBuf),

    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("read error: {0}")]
    ReadFailure(String),

    #[error("write error: {0}")]
    WriteFailure(String),

    /// The operation was interrupted by the user. Not counted as a failure.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Map an io error on `path` onto the entry-level taxonomy
    pub fn from_io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        let path = path.into();
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::PathNotFound(path),
            std::io::ErrorKind::PermissionDenied => Error::PermissionDenied(path),
            std::io::ErrorKind::AlreadyExists => Error::AlreadyExists(path),
            _ => Error::Io { path, source: err },
        }
    }

    /// Connection-level errors end the whole session, the others only the
    /// current transfer.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Error::Dial { .. } | Error::AuthExhausted { .. } | Error::HostKeyRejected { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

struct AttemptList<'a>(&'a [AuthAttempt]);

impl fmt::Display for AttemptList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("no methods");
        }
        for (i, attempt) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} ({})", attempt.kind, attempt.reason)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_entry_errors() {
        let err = Error::from_io("/nope", std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(matches!(err, Error::PathNotFound(p) if p == PathBuf::from("/nope")));

        let err = Error::from_io("/x", std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(matches!(err, Error::PermissionDenied(_)));

        let err = Error::from_io("/x", std::io::Error::other("disk on fire"));
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn auth_exhausted_lists_every_attempt() {
        let err = Error::AuthExhausted {
            attempts: vec![
                AuthAttempt {
                    kind: AuthKind::PublicKey,
                    reason: "rejected".into(),
                },
                AuthAttempt {
                    kind: AuthKind::None,
                    reason: "rejected".into(),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "authentication failed, tried publickey (rejected), none (rejected)"
        );
        assert!(err.is_connection_level());
        assert!(!Error::Cancelled.is_connection_level());
    }
}
