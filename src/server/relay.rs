use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

// 32KB halves the syscall count on large result sets compared to 16KB.
const BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

/// Why a directional copy loop stopped.
#[derive(Debug)]
pub enum RelayEnd {
    /// The read side reached end-of-stream.
    ReadEof,
    /// The session was cancelled before this direction finished.
    Cancelled,
    ReadError(std::io::Error),
    WriteError(std::io::Error),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RelayTotals {
    pub bytes: u64,
    pub packets: u64,
}

#[derive(Debug)]
pub struct DirectionReport {
    pub end: RelayEnd,
    pub totals: RelayTotals,
}

/// Outcome of a full bidirectional relay.
#[derive(Debug)]
pub struct RelayReport {
    pub client_to_upstream: DirectionReport,
    pub upstream_to_client: DirectionReport,
}

impl RelayReport {
    /// The upstream connection may go back to the pool only when the client
    /// finished with a clean end-of-stream and the upstream leg saw no
    /// traffic failure of its own. An upstream EOF, an error on either leg,
    /// or an external cancellation all leave the connection in an unknown
    /// protocol state, so it must be discarded.
    pub fn upstream_reusable(&self) -> bool {
        matches!(self.client_to_upstream.end, RelayEnd::ReadEof)
            && matches!(self.upstream_to_client.end, RelayEnd::Cancelled)
    }
}

/// Relay bytes in both directions until one side finishes or `cancel` fires.
///
/// Bytes are forwarded opaquely and in arrival order; nothing is inspected
/// or rewritten. The first direction to stop cancels the other so no
/// half-open pipe lingers. No shutdown is propagated on either write half
/// here: the caller decides whether the upstream stream is pooled (and must
/// stay fully open) or dropped.
pub async fn relay_streams<CR, CW, UR, UW>(
    client_read: CR,
    client_write: CW,
    upstream_read: UR,
    upstream_write: UW,
    cancel: CancellationToken,
) -> RelayReport
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    UR: AsyncRead + Unpin,
    UW: AsyncWrite + Unpin,
{
    // Local token: lets whichever direction finishes first stop the other,
    // while still observing the session-level cancel.
    let local = cancel.child_token();

    let upload = async {
        let report = copy_direction(
            client_read,
            upstream_write,
            &local,
            Direction::ClientToUpstream,
        )
        .await;
        local.cancel();
        report
    };

    let download = async {
        let report = copy_direction(
            upstream_read,
            client_write,
            &local,
            Direction::UpstreamToClient,
        )
        .await;
        local.cancel();
        report
    };

    let (client_to_upstream, upstream_to_client) = tokio::join!(upload, download);

    RelayReport {
        client_to_upstream,
        upstream_to_client,
    }
}

async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    cancel: &CancellationToken,
    direction: Direction,
) -> DirectionReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = [0u8; BUFFER_SIZE];
    let mut totals = RelayTotals::default();

    loop {
        let read_result = tokio::select! {
            _ = cancel.cancelled() => {
                trace!("Direction {:?} cancelled", direction);
                return DirectionReport {
                    end: RelayEnd::Cancelled,
                    totals,
                };
            }
            result = reader.read(&mut buffer) => result,
        };

        let bytes_read = match read_result {
            Ok(0) => {
                trace!("Direction {:?} reached EOF", direction);
                return DirectionReport {
                    end: RelayEnd::ReadEof,
                    totals,
                };
            }
            Ok(n) => n,
            Err(e) => {
                error!("Read error on {:?}: {}", direction, e);
                return DirectionReport {
                    end: RelayEnd::ReadError(e),
                    totals,
                };
            }
        };

        if let Err(e) = writer.write_all(&buffer[..bytes_read]).await {
            error!("Write error on {:?}: {}", direction, e);
            return DirectionReport {
                end: RelayEnd::WriteError(e),
                totals,
            };
        }

        totals.bytes = totals.bytes.saturating_add(bytes_read as u64);
        totals.packets = totals.packets.saturating_add(1);
    }
}
