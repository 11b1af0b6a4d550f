use crate::server::pool::Pool;
use crate::server::relay::relay_streams;
use crate::utils::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Drive one client connection through its whole life: bind an upstream
/// connection, relay opaquely in both directions, then return or discard
/// the upstream depending on how the relay ended.
///
/// A binding failure (dial error, pool timeout, pool closed) closes the
/// client immediately; no upstream bytes have flowed, so there is nothing
/// else to unwind. The error is surfaced to the caller for logging only;
/// it never affects other sessions.
pub async fn handle_session(
    mut client: UnixStream,
    pool: Arc<Pool>,
    session_id: Uuid,
    cancel: CancellationToken,
    debug_stats: Arc<AtomicBool>,
) -> Result<()> {
    // Binding
    let mut conn = match pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => {
            debug!(session = %session_id, "Binding failed: {}", e);
            // Dropping the client stream is the refusal: the client sees an
            // immediate close instead of a hung socket.
            return Err(e);
        }
    };

    debug!(
        session = %session_id,
        conn_age_ms = conn.age().as_millis() as u64,
        "Session bound to upstream connection"
    );
    if debug_stats.load(Ordering::Relaxed) {
        let stats = pool.stats().await;
        info!(
            session = %session_id,
            outstanding = stats.outstanding,
            idle = stats.idle,
            created = stats.created,
            "Pool state at bind"
        );
    }

    // Relaying
    let (client_read, client_write) = client.split();
    let (upstream_read, upstream_write) = conn.stream_mut().split();
    let report = relay_streams(
        client_read,
        client_write,
        upstream_read,
        upstream_write,
        cancel,
    )
    .await;

    debug!(
        session = %session_id,
        up_bytes = report.client_to_upstream.totals.bytes,
        down_bytes = report.upstream_to_client.totals.bytes,
        up_end = ?report.client_to_upstream.end,
        down_end = ?report.upstream_to_client.end,
        "Relay finished"
    );

    // Closing: a clean client end-of-stream returns the connection for
    // reuse; anything else leaves it in an unknown state, so it is closed.
    if report.upstream_reusable() {
        pool.release(conn).await;
    } else {
        conn.mark_unhealthy();
        pool.discard(conn).await;
    }

    if debug_stats.load(Ordering::Relaxed) {
        let stats = pool.stats().await;
        info!(
            session = %session_id,
            outstanding = stats.outstanding,
            idle = stats.idle,
            "Pool state at close"
        );
    }

    Ok(())
}
