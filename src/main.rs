//! fcp: copies files between local disk and SSH hosts, or opens a remote shell.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use rusty_fcp::{
    ASKPASS_SOCKET_ENV, AuthChainResolver, ClientConfig, ConnectionManager, FileTransfer, HostTrustVerifier,
    InteractiveShell, OpensshDialer, Session, SessionStatus, TerminalPrompt, WriteMode,
    askpass_helper,
};

/// Copy files between local and remote locations.
///
/// Remote locations are written `/<protocol>:<host-spec>:<path>`, where the
/// protocol is `sftp`, `scp` or empty, and the host spec is
/// `user@host[:port]`, `user@host#port` or a configured host alias.
#[derive(Debug, Parser)]
#[command(name = "fcp", version)]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Private key to offer first: a key name in the ssh directory or a path
    #[arg(short, long)]
    identity: Option<String>,

    /// Append to existing destination files instead of truncating them
    #[arg(long, conflicts_with = "no_clobber")]
    append: bool,

    /// Fail instead of overwriting existing destination files
    #[arg(short = 'n', long)]
    no_clobber: bool,

    /// Config file (defaults to <config dir>/rusty_fcp/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Open an interactive shell on the given host spec instead of copying
    #[arg(long, value_name = "HOST_SPEC", conflicts_with = "paths")]
    shell: Option<String>,

    /// Sources followed by the destination
    #[arg(value_name = "PATH", num_args = 2.., required_unless_present = "shell")]
    paths: Vec<String>,
}

impl Cli {
    fn write_mode(&self) -> WriteMode {
        if self.append {
            WriteMode::Append
        } else if self.no_clobber {
            WriteMode::CreateNew
        } else {
            WriteMode::Truncate
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // started by ssh to answer a password or keyboard-interactive prompt
    if let Some(socket) = std::env::var_os(ASKPASS_SOCKET_ENV) {
        let prompt = std::env::args().nth(1).unwrap_or_default();
        let code = match askpass_helper(Path::new(&socket), &prompt) {
            Ok(Some(answer)) => {
                println!("{answer}");
                0
            }
            Ok(None) => 1,
            Err(e) => {
                eprintln!("fcp: askpass: {e}");
                1
            }
        };
        std::process::exit(code);
    }

    let cli = Cli::parse();

    // Initialize logging
    let level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "fcp starting");

    let status = match run(cli).await {
        Ok(status) => status,
        Err(e) => {
            error!("{e:#}");
            eprintln!("fcp: {e:#}");
            SessionStatus::Failed(e.to_string())
        }
    };
    // stdin readers may still be parked on a blocking thread
    std::process::exit(status.exit_code());
}

async fn run(cli: Cli) -> anyhow::Result<SessionStatus> {
    let config = ClientConfig::load(cli.config.as_deref()).context("failed to load config")?;

    let prompt = Arc::new(TerminalPrompt);
    let resolver = AuthChainResolver::new(Arc::new(config.credential_store()), prompt.clone());
    let dialer = OpensshDialer::new(&config.control_dir, config.known_hosts_path());
    let manager = Arc::new(
        ConnectionManager::new(Arc::new(dialer), resolver, HostTrustVerifier::new(prompt))
            .pooled(),
    );
    let options = config.connect_options(cli.identity.clone());

    if let Some(host_spec) = &cli.shell {
        let shell = InteractiveShell::new(host_spec.as_str())?;
        return Ok(Session::new(shell, manager, options).run().await);
    }

    let Some((destination, sources)) = cli.paths.split_last() else {
        anyhow::bail!("missing destination");
    };
    let transfer = FileTransfer::new(sources, destination, config.transfer_config(cli.write_mode()))?;
    Ok(Session::new(transfer, manager, options).run().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_copy_and_shell() {
        let cli = Cli::try_parse_from(["fcp", "-vv", "--append", "a", "b", "/sftp:box:/srv"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.write_mode(), WriteMode::Append);
        assert_eq!(cli.paths.len(), 3);

        let cli = Cli::try_parse_from(["fcp", "--shell", "alice@example.com"]).unwrap();
        assert_eq!(cli.shell.as_deref(), Some("alice@example.com"));

        assert!(Cli::try_parse_from(["fcp", "only-one"]).is_err());
        assert!(Cli::try_parse_from(["fcp", "--append", "-n", "a", "b"]).is_err());
    }
}
