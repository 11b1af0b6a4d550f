use crate::server::handler::handle_session;
use crate::server::pool::Pool;
use crate::session::SessionRegistry;
use crate::utils::error::{MypoolerError, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often the shutdown wait re-checks the live-session count.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The proxy: one unix-socket listener, one pool, one registry of live
/// sessions. Constructed once; `run` accepts until `shutdown` is called,
/// after which the proxy is permanently closed.
pub struct ProxyServer {
    pool: Arc<Pool>,
    socket_path: PathBuf,
    registry: Arc<SessionRegistry>,
    shutdown_token: CancellationToken,
    debug_stats: Arc<AtomicBool>,
}

impl ProxyServer {
    /// The pool is injected rather than ambient so several independent
    /// proxies can coexist in one process.
    pub fn new(pool: Pool, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            pool: Arc::new(pool),
            socket_path: socket_path.into(),
            registry: Arc::new(SessionRegistry::new()),
            shutdown_token: CancellationToken::new(),
            debug_stats: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Turn on per-session pool-state logging. Observability only.
    pub fn set_debug(&self) {
        self.debug_stats.store(true, Ordering::Relaxed);
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn live_sessions(&self) -> usize {
        self.registry.len()
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    /// Bind the unix socket and accept clients until shutdown. Each client
    /// gets its own task; the accept loop never waits on a session.
    pub async fn run(&self) -> Result<()> {
        if self.shutdown_token.is_cancelled() {
            warn!("Proxy already shut down, refusing to run again");
            return Ok(());
        }

        // A previous process may have left its socket file behind.
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => debug!("Removed stale socket file {}", self.socket_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(MypoolerError::Io(e)),
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!(
            "Listening on {} (pool size {})",
            self.socket_path.display(),
            self.pool.options().max_size
        );

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => self.spawn_session(stream),
                    Err(e) => {
                        // Transient accept failures (fd pressure) are logged
                        // and the loop keeps going.
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }

        info!("Listener stopped");
        Ok(())
    }

    fn spawn_session(&self, stream: UnixStream) {
        // An accept can slip in between shutdown firing the token and the
        // accept loop observing it; such a session would miss cancel_all,
        // so refuse it here instead of registering it.
        if self.shutdown_token.is_cancelled() {
            debug!("Refusing connection accepted during shutdown");
            drop(stream);
            return;
        }

        let cancel = CancellationToken::new();
        let session_id = self.registry.register(cancel.clone());
        let pool = self.pool.clone();
        let registry = self.registry.clone();
        let debug_stats = self.debug_stats.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_session(stream, pool, session_id, cancel, debug_stats).await {
                warn!(session = %session_id, "Session ended with error: {}", e);
            }
            registry.deregister(&session_id);
        });
    }

    /// Graceful shutdown: stop accepting, signal every live session, drain
    /// the pool, then wait for sessions to finish. Fails with
    /// [`MypoolerError::ShutdownTimeout`] if any session outlives the
    /// deadline. Safe to call with no sessions active, and calling it again
    /// after completion is a no-op.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        if self.shutdown_token.is_cancelled() {
            debug!("Shutdown already in progress");
            return Ok(());
        }

        info!(
            live_sessions = self.registry.len(),
            "Shutting down, draining sessions"
        );
        self.shutdown_token.cancel();
        self.registry.cancel_all();
        self.pool.drain().await;

        let started = Instant::now();
        loop {
            let active = self.registry.len();
            if active == 0 {
                break;
            }
            if started.elapsed() >= deadline {
                error!(active, "Shutdown deadline exceeded");
                return Err(MypoolerError::ShutdownTimeout { active });
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove socket file: {}", e);
            }
        }

        info!("Shutdown complete");
        Ok(())
    }
}
