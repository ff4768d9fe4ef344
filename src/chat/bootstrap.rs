//! One-shot setup of the whole chat stack.
//!
//! [`bootstrap`] brings up the host, discovery, the topic and the session in
//! a background task and reports the outcome on exactly one of two oneshot
//! channels. The caller can keep rendering a "connecting" state while it
//! waits. There is no retry: to try again, start a new bootstrap.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use super::session::{ChatSession, SessionResources};
use crate::config::NetConfig;
use crate::net::discovery::{Discovery, DiscoveryError};
use crate::net::host::{Host, HostError};
use crate::net::pubsub::{self, PubSubError};

/// Setup failure, tagged with the stage that failed
#[derive(Error, Debug, Clone)]
pub enum BootstrapError {
    #[error("identity setup failed: {0}")]
    Identity(#[from] HostError),

    #[error("discovery setup failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("joining chat topic failed: {0}")]
    Join(#[from] PubSubError),

    #[error("session setup failed: {0}")]
    Session(Arc<str>),

    /// The setup task panicked before reporting an outcome
    #[error("setup was aborted")]
    Aborted,
}

/// Readiness as seen by a consumer. Moves out of `Connecting` at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReadinessState {
    #[default]
    Connecting,
    Ready,
    Failed(String),
}

impl ReadinessState {
    /// Returns true for `Ready` and `Failed`.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Connecting)
    }

    /// Moves to `next` if still connecting. Returns whether the state changed.
    pub fn resolve(&mut self, next: ReadinessState) -> bool {
        if self.is_terminal() || !next.is_terminal() {
            return false;
        }
        *self = next;
        true
    }
}

/// Pending outcome of a bootstrap.
///
/// Exactly one of `ready` and `failed` receives a value; the sender of the
/// other is dropped without sending.
#[derive(Debug)]
pub struct Bootstrap<T> {
    pub ready: oneshot::Receiver<T>,
    pub failed: oneshot::Receiver<BootstrapError>,
}

impl<T> Bootstrap<T> {
    /// Waits for whichever outcome arrives.
    pub async fn wait(self) -> Result<T, BootstrapError> {
        let Bootstrap {
            mut ready,
            mut failed,
        } = self;

        tokio::select! {
            value = &mut ready => match value {
                Ok(value) => Ok(value),
                Err(_) => Err(failed.await.unwrap_or(BootstrapError::Aborted)),
            },
            err = &mut failed => match err {
                Ok(err) => Err(err),
                Err(_) => ready.await.map_err(|_| BootstrapError::Aborted),
            },
        }
    }
}

/// Runs a setup future in the background and splits its outcome.
pub struct Bootstrapper;

impl Bootstrapper {
    /// Spawns `setup` on the current runtime.
    ///
    /// A panic inside `setup` is reported as [`BootstrapError::Aborted`].
    pub fn spawn<T, F>(setup: F) -> Bootstrap<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, BootstrapError>> + Send + 'static,
    {
        Self::spawn_with_cleanup(setup, |_unclaimed| async {})
    }

    /// Like [`Bootstrapper::spawn`], but hands a successful result to
    /// `cleanup` when nobody is left to receive it.
    pub fn spawn_with_cleanup<T, F, C, CF>(setup: F, cleanup: C) -> Bootstrap<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, BootstrapError>> + Send + 'static,
        C: FnOnce(T) -> CF + Send + 'static,
        CF: Future<Output = ()> + Send,
    {
        let (ready_tx, ready) = oneshot::channel();
        let (failed_tx, failed) = oneshot::channel();

        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(setup)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!("Bootstrap task panicked");
                    Err(BootstrapError::Aborted)
                });

            match outcome {
                Ok(value) => {
                    info!("Bootstrap complete");
                    if let Err(unclaimed) = ready_tx.send(value) {
                        info!("Bootstrap result was not collected, releasing it");
                        cleanup(unclaimed).await;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Bootstrap failed");
                    let _ = failed_tx.send(e);
                }
            }
        });

        Bootstrap { ready, failed }
    }
}

/// Starts the full chat stack with `config`.
pub fn bootstrap(config: NetConfig) -> Bootstrap<ChatSession> {
    Bootstrapper::spawn_with_cleanup(setup(config), |session| async move {
        session.shutdown().await;
    })
}

#[instrument(name = "bootstrap", skip_all, fields(topic = %config.topic))]
async fn setup(config: NetConfig) -> Result<ChatSession, BootstrapError> {
    let host = Arc::new(Host::create(&config).await?);
    let cancel = CancellationToken::new();

    let mut discovery = match Discovery::start(&host, &config, &cancel) {
        Ok(discovery) => discovery,
        Err(e) => {
            host.shutdown().await;
            return Err(e.into());
        }
    };

    let (publisher, subscription) =
        match pubsub::join(&cancel, &host, discovery.take_dial_queue(), &config) {
            Ok(joined) => joined,
            Err(e) => {
                cancel.cancel();
                host.shutdown().await;
                return Err(e.into());
            }
        };

    let session = ChatSession::new(host.node_id(), publisher, subscription)
        .with_delivery_capacity(config.delivery_capacity)
        .with_resources(SessionResources {
            host,
            discovery,
            cancel,
        });

    Ok(session)
}
