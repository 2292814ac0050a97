pub mod codes;
mod connection;
mod handlers;
pub mod registry;
mod session;
#[cfg(test)]
mod tests;
mod uploads;

use self::codes::CodeManager;
use self::registry::{ConnectionHandle, Control, SessionRegistry};
use crate::config::{MailMode, ServerConfig};
use crate::mail::{CaptureMailer, LogMailer, Mailer};
use comcore_storage::{Store, StorageError};
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_rustls::{rustls, TlsAcceptor};
use tracing::{error, info, warn};

const DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum ServerError {
    Storage,
    Tls,
    Io,
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage => write!(f, "storage failure"),
            Self::Tls => write!(f, "tls configuration failure"),
            Self::Io => write!(f, "io failure"),
        }
    }
}

impl Error for ServerError {}

/// Anticipated, caller-visible request failures. `Unauthorized` additionally
/// forces the connection back to the logged-out state after the error reply;
/// `Internal` details are logged and never shown to the client.
#[derive(Debug)]
pub enum RequestError {
    Invalid(String),
    Unauthorized,
    Internal(String),
}

impl Display for RequestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid(message) => write!(f, "{}", message),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::Internal(detail) => write!(f, "internal error: {}", detail),
        }
    }
}

impl Error for RequestError {}

impl From<StorageError> for RequestError {
    fn from(err: StorageError) -> Self {
        RequestError::Invalid(err.to_string())
    }
}

pub struct AppState {
    pub config: ServerConfig,
    pub store: Store,
    pub codes: CodeManager,
    pub registry: SessionRegistry,
    pub mailer: Arc<dyn Mailer>,
    connections: Mutex<HashMap<u64, ConnectionHandle>>,
    next_connection: AtomicU64,
}

impl AppState {
    pub fn init(config: ServerConfig) -> Arc<AppState> {
        let mailer: Arc<dyn Mailer> = match config.mail {
            MailMode::Log => Arc::new(LogMailer),
            MailMode::Capture => Arc::new(CaptureMailer::new()),
        };
        Self::with_mailer(config, mailer)
    }

    pub fn with_mailer(config: ServerConfig, mailer: Arc<dyn Mailer>) -> Arc<AppState> {
        Arc::new(AppState {
            config,
            store: Store::open(),
            codes: CodeManager::new(),
            registry: SessionRegistry::new(),
            mailer,
            connections: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
        })
    }

    pub(crate) fn allocate_connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) async fn register_connection(&self, id: u64, handle: ConnectionHandle) {
        self.connections.lock().await.insert(id, handle);
    }

    pub(crate) async fn deregister_connection(&self, id: u64) {
        self.connections.lock().await.remove(&id);
    }

    /// Pushes a frame to every member of the group, except the originating
    /// connection. Recipients are read after the store write committed, so
    /// anyone reacting to the push observes the new state.
    pub async fn forward_group(
        &self,
        group: i64,
        kind: &str,
        data: Value,
        except: Option<u64>,
    ) -> Result<(), RequestError> {
        let users = self.store.get_users(group).await?;
        for user in users {
            self.registry
                .forward(user.id, kind, data.clone(), except)
                .await;
        }
        Ok(())
    }

    /// Sends `end` to every live connection and waits for the pumps to
    /// drain, bounded by a grace period.
    pub async fn shutdown(&self) {
        {
            let connections = self.connections.lock().await;
            info!(connections = connections.len(), "draining connections");
            for handle in connections.values() {
                let _ = handle.control.send(Control::End);
            }
        }
        let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
        loop {
            if self.connections.lock().await.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("connection drain timed out");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if let Err(err) = self.store.close().await {
            error!(error = %err, "store close failure");
        }
        info!("shutdown complete");
    }
}

fn build_tls_acceptor(config: &ServerConfig) -> Result<TlsAcceptor, ServerError> {
    let cert_pem = std::fs::read(&config.tls_cert).map_err(|_| ServerError::Tls)?;
    let key_pem = std::fs::read(&config.tls_key).map_err(|_| ServerError::Tls)?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ServerError::Tls)?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|_| ServerError::Tls)?
        .ok_or(ServerError::Tls)?;
    let tls = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|_| ServerError::Tls)?;
    Ok(TlsAcceptor::from(Arc::new(tls)))
}

/// Initializes state, accepts TLS connections until `SIGINT`, then runs the
/// graceful shutdown sequence.
pub async fn run(config: ServerConfig) -> Result<(), ServerError> {
    let state = AppState::init(config);
    state
        .store
        .initialize()
        .await
        .map_err(|_| ServerError::Storage)?;
    let acceptor = build_tls_acceptor(&state.config)?;
    let listener = TcpListener::bind(&state.config.bind)
        .await
        .map_err(|_| ServerError::Io)?;
    info!(address = %state.config.bind, domain = %state.config.domain, "comcore listening");

    let accept_state = Arc::clone(&state);
    let accept_task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let state = Arc::clone(&accept_state);
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => connection::serve(tls_stream, state).await,
                            Err(err) => {
                                warn!(peer = %peer, error = %err, "tls handshake failed");
                            }
                        }
                    });
                }
                Err(err) => error!(error = %err, "accept failure"),
            }
        }
    });

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "signal listener failure");
    }
    info!("shutdown requested");
    accept_task.abort();
    state.shutdown().await;
    Ok(())
}
