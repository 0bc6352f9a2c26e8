//! Decides whether a server's host key is trusted.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{Error, Result};

const HOST_KEY_CHANGED_WARNING: &str = "\
@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@
@    WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!     @
@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@";

/// Line-oriented access to the user's terminal
#[async_trait]
pub trait LinePrompt: Send + Sync {
    /// Shows `prompt` and reads one line of input, without echo when `echo`
    /// is false. `None` means the input could not be read.
    async fn read_line(&self, prompt: &str, echo: bool) -> Option<String>;

    /// Prints a message on its own line
    async fn notify(&self, message: &str);
}

/// How the transport classified the server's key against stored host keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostClassification {
    KnownMatching,
    KnownChanged,
    Unknown,
    /// No host key store exists yet
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub host: String,
    pub fingerprint: String,
    pub classification: HostClassification,
}

impl fmt::Display for HostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.host, self.fingerprint)
    }
}

/// Result of a successful verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    /// The key already matched the stored one; nothing to persist
    AlreadyTrusted,
    /// The user accepted the key; the caller persists it
    Accepted,
}

/// Host key verification against the user's answer
#[derive(Clone)]
pub struct HostTrustVerifier {
    prompt: Arc<dyn LinePrompt>,
}

impl HostTrustVerifier {
    pub fn new(prompt: Arc<dyn LinePrompt>) -> Self {
        Self { prompt }
    }

    /// Accepts matching keys silently. Anything else needs an explicit "yes";
    /// an empty or unreadable answer rejects the key.
    ///
    /// # Errors
    ///
    /// [`Error::HostKeyRejected`] unless the key matched or the user accepted it.
    pub async fn verify(&self, identity: &HostIdentity) -> Result<TrustDecision> {
        let question = match identity.classification {
            HostClassification::KnownMatching => {
                info!("Host key for {} matches the stored key", identity.host);
                return Ok(TrustDecision::AlreadyTrusted);
            }
            HostClassification::KnownChanged => {
                warn!("Host key for {} has changed", identity.host);
                self.prompt
                    .notify(&format!(
                        "{HOST_KEY_CHANGED_WARNING}\n\
                         Host key for server changed. It is now: Public key hash {}.\n\n\
                         An attacker might change the default server key to confuse your client \
                         into thinking the key does not exist. It is also possible that the host \
                         key has just been changed.\n",
                        identity.fingerprint
                    ))
                    .await;
                "Accepting the following prompt will replace the old fingerprint. \
                 Do you trust the host key? [y/N]: "
                    .to_string()
            }
            HostClassification::Unknown | HostClassification::NotFound => format!(
                "Public key hash: {}. The server is unknown. Do you trust the host key? [y/N]: ",
                identity.fingerprint
            ),
        };

        match self.prompt.read_line(&question, true).await {
            Some(answer) if answer.trim().to_lowercase().starts_with('y') => {
                info!("Host key for {} accepted by user", identity.host);
                Ok(TrustDecision::Accepted)
            }
            Some(_) => Err(rejected(identity)),
            None => {
                self.prompt.notify("Cannot read input.").await;
                Err(rejected(identity))
            }
        }
    }
}

fn rejected(identity: &HostIdentity) -> Error {
    Error::HostKeyRejected {
        host: identity.host.clone(),
        fingerprint: identity.fingerprint.clone(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Prompt that replays canned answers and records what was shown
    pub(crate) struct ScriptedPrompt {
        answers: Mutex<VecDeque<Option<String>>>,
        pub(crate) shown: Mutex<Vec<String>>,
    }

    impl ScriptedPrompt {
        pub(crate) fn new(answers: &[Option<&str>]) -> Self {
            Self {
                answers: Mutex::new(answers.iter().map(|a| a.map(str::to_string)).collect()),
                shown: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn questions_asked(&self) -> usize {
            self.shown
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.starts_with("?"))
                .count()
        }
    }

    #[async_trait]
    impl LinePrompt for ScriptedPrompt {
        async fn read_line(&self, prompt: &str, _echo: bool) -> Option<String> {
            self.shown.lock().unwrap().push(format!("?{prompt}"));
            self.answers.lock().unwrap().pop_front().flatten()
        }

        async fn notify(&self, message: &str) {
            self.shown.lock().unwrap().push(message.to_string());
        }
    }

    fn identity(classification: HostClassification) -> HostIdentity {
        HostIdentity {
            host: "example.com".into(),
            fingerprint: "SHA256:abc".into(),
            classification,
        }
    }

    #[tokio::test]
    async fn matching_key_needs_no_answer() {
        let prompt = Arc::new(ScriptedPrompt::new(&[]));
        let verifier = HostTrustVerifier::new(prompt.clone());

        let decision = verifier
            .verify(&identity(HostClassification::KnownMatching))
            .await
            .unwrap();

        assert_eq!(decision, TrustDecision::AlreadyTrusted);
        assert_eq!(prompt.questions_asked(), 0);
    }

    #[tokio::test]
    async fn changed_key_warns_and_requires_yes() {
        let prompt = Arc::new(ScriptedPrompt::new(&[Some("n")]));
        let verifier = HostTrustVerifier::new(prompt.clone());

        let err = verifier
            .verify(&identity(HostClassification::KnownChanged))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::HostKeyRejected { .. }));
        let shown = prompt.shown.lock().unwrap();
        assert!(shown[0].contains("REMOTE HOST IDENTIFICATION HAS CHANGED"));
        assert!(shown[0].contains("SHA256:abc"));

        let prompt = Arc::new(ScriptedPrompt::new(&[Some("Yes")]));
        let verifier = HostTrustVerifier::new(prompt);
        let decision = verifier
            .verify(&identity(HostClassification::KnownChanged))
            .await
            .unwrap();
        assert_eq!(decision, TrustDecision::Accepted);
    }

    #[tokio::test]
    async fn unknown_host_fails_closed() {
        for answers in [vec![Some("")], vec![None]] {
            let prompt = Arc::new(ScriptedPrompt::new(&answers));
            let verifier = HostTrustVerifier::new(prompt);
            let err = verifier
                .verify(&identity(HostClassification::Unknown))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::HostKeyRejected { .. }));
        }

        let prompt = Arc::new(ScriptedPrompt::new(&[Some("y")]));
        let verifier = HostTrustVerifier::new(prompt.clone());
        let decision = verifier
            .verify(&identity(HostClassification::NotFound))
            .await
            .unwrap();
        assert_eq!(decision, TrustDecision::Accepted);
        assert!(prompt.shown.lock().unwrap()[0].contains("Public key hash: SHA256:abc"));
    }
}
