//! Answers `SSH_ASKPASS` prompts of an `ssh` child over a Unix socket.
//!
//! `ssh` runs `fcp` again as its askpass program. That helper process
//! forwards the prompt to the socket named by [`ASKPASS_SOCKET_ENV`] and
//! prints whatever the parent answers.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::auth::Secret;
use crate::trust::LinePrompt;

/// Environment variable naming the socket the helper talks to
pub const ASKPASS_SOCKET_ENV: &str = "FCP_ASKPASS_SOCKET";

/// Source of answers for one authentication attempt
#[derive(Clone)]
pub(crate) enum Responder {
    /// Stored password, handed out for the first prompt only
    Secret(Secret),
    /// Every prompt is relayed to the user without echo
    Prompt(Arc<dyn LinePrompt>),
}

impl Responder {
    async fn answer(&self, prompt: &str, seen: usize) -> Option<String> {
        match self {
            Responder::Secret(secret) => (seen == 0).then(|| secret.expose().to_string()),
            Responder::Prompt(user) => user.read_line(prompt, false).await,
        }
    }
}

struct Shared {
    responder: Responder,
    prompts: AtomicUsize,
}

/// Listener answering askpass requests until dropped
pub(crate) struct AskpassServer {
    socket: PathBuf,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl AskpassServer {
    pub(crate) fn bind(socket: impl Into<PathBuf>, responder: Responder) -> io::Result<Self> {
        let socket = socket.into();
        let listener = UnixListener::bind(&socket)?;
        let shared = Arc::new(Shared {
            responder,
            prompts: AtomicUsize::new(0),
        });
        let task = tokio::spawn(serve(listener, shared.clone()));
        Ok(Self {
            socket,
            shared,
            task,
        })
    }

    pub(crate) fn socket(&self) -> &Path {
        &self.socket
    }

    pub(crate) fn prompts_seen(&self) -> usize {
        self.shared.prompts.load(Ordering::SeqCst)
    }
}

impl Drop for AskpassServer {
    fn drop(&mut self) {
        self.task.abort();
        let _ = std::fs::remove_file(&self.socket);
    }
}

async fn serve(listener: UnixListener, shared: Arc<Shared>) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!("Askpass listener failed: {e}");
                return;
            }
        };
        // ssh asks one question at a time
        if let Err(e) = answer_one(stream, &shared).await {
            debug!("Askpass request dropped: {e}");
        }
    }
}

async fn answer_one(mut stream: UnixStream, shared: &Shared) -> io::Result<()> {
    let mut prompt = String::new();
    stream.read_to_string(&mut prompt).await?;
    let seen = shared.prompts.fetch_add(1, Ordering::SeqCst);
    debug!("ssh asked {:?}", prompt.trim());
    match shared.responder.answer(&prompt, seen).await {
        Some(answer) => {
            stream.write_all(answer.as_bytes()).await?;
            stream.write_all(b"\n").await?;
        }
        None => debug!("No answer for askpass prompt"),
    }
    stream.shutdown().await
}

/// Client side, run in the helper process `ssh` starts.
///
/// # Arguments
///
/// * `socket` - Value of [`ASKPASS_SOCKET_ENV`]
/// * `prompt` - The prompt `ssh` passed as first argument
///
/// # Returns
///
/// The answer without its trailing newline, or `None` when the parent
/// declined to answer.
pub fn askpass_helper(socket: &Path, prompt: &str) -> io::Result<Option<String>> {
    let mut stream = std::os::unix::net::UnixStream::connect(socket)?;
    stream.write_all(prompt.as_bytes())?;
    stream.shutdown(std::net::Shutdown::Write)?;
    let mut answer = String::new();
    stream.read_to_string(&mut answer)?;
    Ok(answer.strip_suffix('\n').map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::tests::ScriptedPrompt;

    async fn ask(socket: &Path, prompt: &str) -> Option<String> {
        let socket = socket.to_path_buf();
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || askpass_helper(&socket, &prompt))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn keyboard_interactive_prompts_reach_the_user() {
        let dir = tempfile::tempdir().unwrap();
        let user = Arc::new(ScriptedPrompt::new(&[Some("123456")]));
        let server =
            AskpassServer::bind(dir.path().join("askpass"), Responder::Prompt(user.clone())).unwrap();

        let answer = ask(server.socket(), "(alice@example.com) Verification code: ").await;
        assert_eq!(answer.as_deref(), Some("123456"));
        assert_eq!(
            user.shown.lock().unwrap().as_slice(),
            ["?(alice@example.com) Verification code: "]
        );

        // the user gave up
        assert_eq!(ask(server.socket(), "Verification code: ").await, None);
        assert_eq!(user.questions_asked(), 2);
        assert_eq!(server.prompts_seen(), 2);
    }

    #[tokio::test]
    async fn stored_password_is_given_once() {
        let dir = tempfile::tempdir().unwrap();
        let server = AskpassServer::bind(
            dir.path().join("askpass"),
            Responder::Secret(Secret::new("hunter2")),
        )
        .unwrap();

        assert_eq!(
            ask(server.socket(), "alice@example.com's password: ").await.as_deref(),
            Some("hunter2")
        );
        assert_eq!(ask(server.socket(), "alice@example.com's password: ").await, None);

        let socket = server.socket().to_path_buf();
        drop(server);
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn empty_answer_is_still_an_answer() {
        let dir = tempfile::tempdir().unwrap();
        let user = Arc::new(ScriptedPrompt::new(&[Some("")]));
        let server = AskpassServer::bind(dir.path().join("askpass"), Responder::Prompt(user)).unwrap();

        assert_eq!(ask(server.socket(), "Passphrase: ").await.as_deref(), Some(""));
    }
}
