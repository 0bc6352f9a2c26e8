//! Dialing, host verification, authentication and connection pooling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{AuthChainResolver, AuthMethod};
use crate::error::{AuthAttempt, Error, Result};
use crate::location::Destination;
use crate::stream::{ChunkSink, ChunkSource};
use crate::translator::Translator;
use crate::trust::{HostIdentity, HostTrustVerifier, TrustDecision};
use crate::types::TransferConfig;

pub(crate) mod askpass;
/// Module for the OpenSSH-backed transport
pub(crate) mod openssh;

pub use self::askpass::{ASKPASS_SOCKET_ENV, askpass_helper};
pub use self::openssh::OpensshDialer;

/// Settings that, together with the destination, identify a pooled connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectOptions {
    /// Explicit identity: key id from the credential store, or a key file path
    pub identity: Option<String>,
    pub connect_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            identity: None,
            connect_timeout: Duration::from_secs(60),
        }
    }
}

/// Server's answer to one authentication attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResponse {
    Accepted,
    Rejected(String),
}

/// Opens transports to a destination
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        destination: &Destination,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Transport>>;
}

/// A transport in the middle of session setup
#[async_trait]
pub trait Transport: Send {
    /// Runs the key exchange and reports how the server key compares to
    /// the stored host keys
    async fn handshake(&mut self) -> Result<HostIdentity>;

    /// Stores the server key after the user accepted it
    async fn persist_host_identity(&mut self, identity: &HostIdentity) -> Result<()>;

    /// Tries exactly one method. `Err` is reserved for transport failures.
    async fn authenticate(&mut self, method: &AuthMethod) -> Result<AuthResponse>;

    /// Turns an authenticated transport into a usable connection
    async fn establish(self: Box<Self>) -> Result<Arc<dyn Connection>>;
}

/// An authenticated SSH connection that can open channels
#[async_trait]
pub trait Connection: Send + Sync {
    fn destination(&self) -> &Destination;

    async fn open_sftp(&self, config: TransferConfig) -> Result<Box<dyn Translator>>;

    /// Starts a remote login shell; returns its output and input ends
    async fn open_interactive_shell(&self) -> Result<(Box<dyn ChunkSource>, Box<dyn ChunkSink>)>;

    async fn is_alive(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

type PoolKey = (Destination, ConnectOptions);
type PoolSlot = Arc<OnceCell<Arc<dyn Connection>>>;

/// Dials destinations and, when pooling, shares one connection per
/// destination and options
pub struct ConnectionManager {
    dialer: Arc<dyn Dialer>,
    resolver: AuthChainResolver,
    verifier: HostTrustVerifier,
    pool: Option<Mutex<HashMap<PoolKey, PoolSlot>>>,
}

impl ConnectionManager {
    /// # Arguments
    ///
    /// * `dialer` - Opens transports, e.g. [`OpensshDialer`]
    /// * `resolver` - Builds the authentication chain for each destination
    /// * `verifier` - Asks the user about unknown or changed host keys
    ///
    /// The manager dials afresh every time until [`Self::pooled`] is called.
    pub fn new(
        dialer: Arc<dyn Dialer>,
        resolver: AuthChainResolver,
        verifier: HostTrustVerifier,
    ) -> Self {
        Self {
            dialer,
            resolver,
            verifier,
            pool: None,
        }
    }

    pub fn pooled(mut self) -> Self {
        self.pool = Some(Mutex::new(HashMap::new()));
        self
    }

    pub fn resolver(&self) -> &AuthChainResolver {
        &self.resolver
    }

    /// Returns a connection to `destination`.
    ///
    /// With pooling, concurrent calls for the same key wait for the first
    /// dial instead of starting their own handshake. A failed dial is not
    /// cached, and nothing is retried here.
    ///
    /// # Arguments
    ///
    /// * `destination` - Host to connect to
    /// * `options` - Identity and timeout; part of the pool key
    /// * `cancel_token` - Token for abandoning the handshake
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The host cannot be reached ([`Error::Dial`])
    /// - The user rejected the host key ([`Error::HostKeyRejected`])
    /// - Every authentication method failed ([`Error::AuthExhausted`])
    /// - The token fired first ([`Error::Cancelled`])
    ///
    /// # Example
    ///
    /// ```ignore
    /// let manager = ConnectionManager::new(dialer, resolver, verifier).pooled();
    /// let connection = manager.dial(&dest, &ConnectOptions::default(), &token).await?;
    /// let sftp = connection.open_sftp(TransferConfig::default()).await?;
    /// ```
    pub async fn dial(
        &self,
        destination: &Destination,
        options: &ConnectOptions,
        cancel_token: &CancellationToken,
    ) -> Result<Arc<dyn Connection>> {
        let Some(pool) = &self.pool else {
            return self.connect(destination, options, cancel_token).await;
        };

        let key = (destination.clone(), options.clone());
        let slot = pool.lock().await.entry(key.clone()).or_default().clone();
        let connection = slot
            .get_or_try_init(|| self.connect(destination, options, cancel_token))
            .await?
            .clone();
        if connection.is_alive().await {
            return Ok(connection);
        }

        warn!("Pooled connection to {} is dead, dialing again", destination);
        // Only the first caller to notice replaces the slot; later ones join it
        let fresh = {
            let mut slots = pool.lock().await;
            let current = slots.entry(key).or_default();
            if Arc::ptr_eq(current, &slot) {
                *current = Arc::new(OnceCell::new());
            }
            current.clone()
        };
        Ok(fresh
            .get_or_try_init(|| self.connect(destination, options, cancel_token))
            .await?
            .clone())
    }

    /// Closes every pooled connection
    pub async fn disconnect_all(&self) {
        let Some(pool) = &self.pool else { return };
        let slots: Vec<PoolSlot> = pool.lock().await.drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            if let Some(connection) = slot.get() {
                if let Err(e) = connection.close().await {
                    warn!("Failed to close connection to {}: {e}", connection.destination());
                }
            }
        }
    }

    async fn connect(
        &self,
        destination: &Destination,
        options: &ConnectOptions,
        cancel_token: &CancellationToken,
    ) -> Result<Arc<dyn Connection>> {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("Connection to {} cancelled by user", destination);
                Err(Error::Cancelled)
            }
            connection = self.establish(destination, options) => connection,
        }
    }

    async fn establish(
        &self,
        destination: &Destination,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn Connection>> {
        info!("Connecting to {}", destination);
        let mut transport = self.dialer.dial(destination, options).await?;

        let identity = transport.handshake().await?;
        if self.verifier.verify(&identity).await? == TrustDecision::Accepted {
            transport.persist_host_identity(&identity).await?;
        }

        let methods = self
            .resolver
            .resolve(options.identity.as_deref(), &destination.alias);
        let mut attempts = Vec::with_capacity(methods.len());
        for method in &methods {
            debug!("Trying {} authentication for {}", method.kind(), destination);
            match transport.authenticate(method).await? {
                AuthResponse::Accepted => {
                    info!("Authenticated to {} with {}", destination, method.kind());
                    return transport.establish().await;
                }
                AuthResponse::Rejected(reason) => {
                    debug!("{} authentication rejected: {}", method.kind(), reason);
                    attempts.push(AuthAttempt {
                        kind: method.kind(),
                        reason,
                    });
                }
            }
        }
        Err(Error::AuthExhausted { attempts })
    }
}
