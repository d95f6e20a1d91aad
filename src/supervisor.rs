//! Connection supervisor
//!
//! Accepts connections, gives each one its own detector instance and session
//! task, and keeps a registry of live sessions for shutdown draining. A
//! failing or panicking session only ever ends its own task.

use crate::config::ServerConfig;
use crate::detector::DetectorTemplate;
use crate::error::SessionError;
use crate::protocol::{Frame, FrameCodec};
use crate::session::{Session, SessionConfig, SessionStats};
use futures::SinkExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinSet;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Pause after a failed accept (e.g. file descriptor exhaustion)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bookkeeping for one live session
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub peer: String,
    pub started_at: Instant,
}

/// Live sessions, shared between the accept loop and session exit paths
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<Uuid, SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a session; it is removed again when the guard drops
    pub fn register(&self, id: Uuid, peer: impl Into<String>) -> RegistryGuard {
        self.sessions.lock().insert(
            id,
            SessionEntry {
                peer: peer.into(),
                started_at: Instant::now(),
            },
        );

        RegistryGuard {
            registry: self.clone(),
            id,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.sessions.lock().contains_key(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<SessionEntry> {
        self.sessions.lock().get(id).cloned()
    }
}

/// Removes its session from the registry on drop, including during unwinding
pub struct RegistryGuard {
    registry: SessionRegistry,
    id: Uuid,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        if let Some(entry) = self.registry.sessions.lock().remove(&self.id) {
            debug!(
                "Session {} deregistered after {:?}",
                self.id,
                entry.started_at.elapsed()
            );
        }
    }
}

/// TCP accept loop that owns every session's lifecycle
pub struct Supervisor {
    listener: TcpListener,
    template: Arc<dyn DetectorTemplate>,
    session_config: SessionConfig,
    max_sessions: usize,
    shutdown_grace: Duration,
    registry: SessionRegistry,
}

impl Supervisor {
    /// Bind the listening socket
    pub async fn listen(
        addr: impl ToSocketAddrs,
        template: Arc<dyn DetectorTemplate>,
        config: &ServerConfig,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            template,
            session_config: config.session_config(),
            max_sessions: config.max_sessions,
            shutdown_grace: config.shutdown_grace(),
            registry: SessionRegistry::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> SessionRegistry {
        self.registry.clone()
    }

    /// Accept connections until `shutdown` is cancelled, then drain sessions
    pub async fn run(self, shutdown: CancellationToken) {
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_session(&mut sessions, stream, peer, &shutdown),
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!("Session task failed: {}", e);
                    }
                }
            }
        }

        info!("Shutting down, draining {} sessions", self.registry.len());

        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while let Some(joined) = sessions.join_next().await {
                if let Err(e) = joined {
                    error!("Session task failed: {}", e);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "Shutdown grace of {:?} elapsed, aborting {} sessions",
                self.shutdown_grace,
                sessions.len()
            );
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }

        info!("Supervisor stopped");
    }

    fn spawn_session(
        &self,
        sessions: &mut JoinSet<()>,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: &CancellationToken,
    ) {
        let codec = self.session_config.codec();

        if self.registry.len() >= self.max_sessions {
            warn!("Rejecting {}: {} sessions active", peer, self.max_sessions);
            let err = SessionError::ServerBusy(format!("{} sessions active", self.max_sessions));
            sessions.spawn(reject(stream, codec, err));
            return;
        }

        let detector = match self.template.instantiate() {
            Ok(detector) => detector,
            Err(e) => {
                error!("Failed to create detector for {}: {}", peer, e);
                sessions.spawn(reject(stream, codec, e.into()));
                return;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
        }

        let id = Uuid::new_v4();
        let guard = self.registry.register(id, peer.to_string());
        let (reader, writer) = stream.into_split();
        let session = Session::new(
            id,
            reader,
            writer,
            detector,
            &self.session_config,
            shutdown.child_token(),
        );

        info!("Accepted {} as session {} ({} active)", peer, id, self.registry.len());

        let span = info_span!("session", %id, %peer);
        sessions.spawn(
            async move {
                let _guard = guard;
                match session.run().await {
                    Ok(stats) => debug!("Session finished: {:?}", stats),
                    Err(e) => debug!("Session ended with {}: {}", e.code(), e),
                }
            }
            .instrument(span),
        );
    }
}

/// Tell a client why it is being turned away, then close
async fn reject(stream: TcpStream, codec: FrameCodec, err: SessionError) {
    let mut writer = FramedWrite::new(stream, codec);

    if let Err(e) = writer.send(Frame::error(err.code(), err.to_string())).await {
        debug!("Could not deliver rejection: {}", e);
    }
    if let Err(e) = writer.close().await {
        debug!("Error closing rejected connection: {}", e);
    }
}

/// Run exactly one session over stdin/stdout
pub async fn serve_stdio(
    template: Arc<dyn DetectorTemplate>,
    config: &SessionConfig,
    shutdown: CancellationToken,
) -> Result<SessionStats, SessionError> {
    let detector = template.instantiate()?;
    let session = Session::new(
        Uuid::new_v4(),
        tokio::io::stdin(),
        tokio::io::stdout(),
        detector,
        config,
        shutdown,
    );

    session.run().await
}
