//! Parsing of `[/proto:host-spec:]path` locations and host specs.

use std::fmt;
use std::str::FromStr;

use crate::auth::CredentialStore;
use crate::error::{Error, Result};

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Protocol prefix of a location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Local,
    Scp,
    Sftp,
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Protocol::Local),
            "scp" => Ok(Protocol::Scp),
            // remote paths without a protocol default to sftp
            "sftp" | "" => Ok(Protocol::Sftp),
            other => Err(Error::Validation(format!("unknown protocol '{other}'"))),
        }
    }
}

/// A parsed command-line location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLocation {
    pub proto: Protocol,
    pub host_spec: Option<String>,
    pub path: String,
}

impl FileLocation {
    pub fn is_local(&self) -> bool {
        self.proto == Protocol::Local
    }
}

impl FromStr for FileLocation {
    type Err = Error;

    /// Relative paths and absolute paths without `:` are local. Otherwise the
    /// location must be `/proto:host-spec:path`, where the host spec may carry
    /// a `:port` suffix.
    fn from_str(raw: &str) -> Result<Self> {
        let Some(rest) = raw.strip_prefix('/') else {
            return Ok(FileLocation {
                proto: Protocol::Local,
                host_spec: None,
                path: raw.to_string(),
            });
        };

        let components: Vec<&str> = rest.split(':').collect();
        match components.as_slice() {
            [_] => Ok(FileLocation {
                proto: Protocol::Local,
                host_spec: None,
                path: raw.to_string(),
            }),
            [proto, host @ .., path] if (1..=2).contains(&host.len()) => {
                let proto: Protocol = proto.parse()?;
                let host = host.join(":");
                if proto == Protocol::Local {
                    if !host.is_empty() {
                        return Err(Error::Validation(format!(
                            "local path '{raw}' cannot name a host"
                        )));
                    }
                    return Ok(FileLocation {
                        proto,
                        host_spec: None,
                        path: path.to_string(),
                    });
                }
                if host.is_empty() || host.starts_with(':') {
                    return Err(Error::Validation(format!("missing host in '{raw}'")));
                }
                Ok(FileLocation {
                    proto,
                    host_spec: Some(host),
                    path: if path.is_empty() { ".".into() } else { path.to_string() },
                })
            }
            _ => Err(Error::Validation(format!(
                "'{raw}': path format can only be /<protocol>:<host>:<path>"
            ))),
        }
    }
}

/// Where to connect, after host aliases are resolved
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub user: Option<String>,
    pub host: String,
    pub port: u16,
    /// Name used to look up the stored host record
    pub alias: String,
}

impl Destination {
    /// Parses `user@host[:port]`, `user@host#port` or a stored host alias
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for an empty user or host, or a port that is
    /// not a number.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let dest = Destination::parse("alice@example.com#2222", &store)?;
    /// assert_eq!(dest.port, 2222);
    /// ```
    pub fn parse(spec: &str, store: &dyn CredentialStore) -> Result<Self> {
        let (user, rest) = match spec.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => return Err(Error::Validation(format!("empty user in '{spec}'"))),
            None => (None, spec),
        };
        let (host, port) = match rest.split_once([':', '#']) {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::Validation(format!("invalid port '{port}' in '{spec}'")))?;
                (host, Some(port))
            }
            None => (rest, None),
        };
        if host.is_empty() {
            return Err(Error::Validation(format!("missing host in '{spec}'")));
        }

        let record = store.host(host);
        Ok(Destination {
            user: user.or_else(|| record.as_ref().and_then(|r| r.user.clone())),
            port: port
                .or_else(|| record.as_ref().and_then(|r| r.port))
                .unwrap_or(DEFAULT_SSH_PORT),
            alias: host.to_string(),
            host: record
                .and_then(|r| r.hostname)
                .unwrap_or_else(|| host.to_string()),
        })
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        write!(f, "{}", self.host)?;
        if self.port != DEFAULT_SSH_PORT {
            write!(f, ":{}", self.port)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{HostRecord, MemoryCredentialStore};

    #[test]
    fn plain_paths_are_local() {
        let loc: FileLocation = "notes.txt".parse().unwrap();
        assert_eq!(loc.proto, Protocol::Local);
        assert_eq!(loc.path, "notes.txt");

        let loc: FileLocation = "/var/tmp/notes.txt".parse().unwrap();
        assert!(loc.is_local());
        assert_eq!(loc.path, "/var/tmp/notes.txt");
    }

    #[test]
    fn full_remote_location() {
        let loc: FileLocation = "/sftp:alice@example.com:/srv/data".parse().unwrap();
        assert_eq!(loc.proto, Protocol::Sftp);
        assert_eq!(loc.host_spec.as_deref(), Some("alice@example.com"));
        assert_eq!(loc.path, "/srv/data");

        let loc: FileLocation = "/scp:alice@example.com:2222:file".parse().unwrap();
        assert_eq!(loc.proto, Protocol::Scp);
        assert_eq!(loc.host_spec.as_deref(), Some("alice@example.com:2222"));
        assert_eq!(loc.path, "file");
    }

    #[test]
    fn wrong_component_count_is_rejected() {
        for raw in ["/sftp:onlyonecolon", "/a:b:c:d:e", "/ftp:host:path", "/sftp::path"] {
            let err = raw.parse::<FileLocation>().unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{raw} should not parse");
        }
    }

    #[test]
    fn host_specs_resolve_aliases() {
        let store = MemoryCredentialStore::new().with_host(HostRecord {
            alias: "box".into(),
            hostname: Some("10.0.0.7".into()),
            user: Some("deploy".into()),
            port: Some(2200),
            ..Default::default()
        });

        let dest = Destination::parse("box", &store).unwrap();
        assert_eq!(dest.host, "10.0.0.7");
        assert_eq!(dest.user.as_deref(), Some("deploy"));
        assert_eq!(dest.port, 2200);
        assert_eq!(dest.alias, "box");

        let dest = Destination::parse("root@example.com#2022", &store).unwrap();
        assert_eq!(dest.to_string(), "root@example.com:2022");

        assert!(Destination::parse("root@example.com:http", &store).is_err());
        assert!(Destination::parse("@example.com", &store).is_err());
    }
}
