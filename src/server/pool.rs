use crate::utils::error::{MypoolerError, Result};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, trace};

/// Pool configuration, immutable after construction.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Upstream MySQL host.
    pub host: String,
    /// Upstream MySQL port.
    pub port: u16,
    /// Maximum number of connections, borrowed and idle combined.
    pub max_size: usize,
    /// Maximum connection lifetime. Zero disables expiry.
    pub max_lifetime: Duration,
    /// How long an acquire may wait when the pool is saturated.
    pub wait_timeout: Duration,
}

/// A single TCP connection to the upstream server with lifetime metadata.
#[derive(Debug)]
pub struct UpstreamConn {
    stream: TcpStream,
    created_at: Instant,
    last_used: Instant,
    healthy: bool,
}

impl UpstreamConn {
    fn new(stream: TcpStream) -> Self {
        let now = Instant::now();
        Self {
            stream,
            created_at: now,
            last_used: now,
            healthy: true,
        }
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Flag the connection so it is closed instead of pooled on release.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    fn is_expired(&self, max_lifetime: Duration) -> bool {
        !max_lifetime.is_zero() && self.created_at.elapsed() >= max_lifetime
    }

    fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}

/// What a saturated acquirer receives when capacity frees up.
///
/// A released connection is handed over directly; a discarded or expired one
/// frees capacity and the woken waiter dials its own replacement.
enum Handoff {
    Conn(UpstreamConn),
    Capacity,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Handoff>,
}

struct PoolState {
    idle: Vec<UpstreamConn>,
    outstanding: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    created: u64,
    closed: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.outstanding + self.idle.len()
    }
}

/// Snapshot of pool bookkeeping for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub outstanding: usize,
    pub idle: usize,
    pub created: u64,
    pub max_size: usize,
}

/// Bounded pool of upstream connections.
///
/// `outstanding + idle <= max_size` holds at all times. Acquires beyond
/// capacity queue FIFO and fail with [`MypoolerError::PoolTimeout`] once
/// `wait_timeout` elapses. All bookkeeping lives behind a single mutex which
/// is never held across a dial or a wait.
pub struct Pool {
    options: PoolOptions,
    state: Mutex<PoolState>,
}

impl Pool {
    pub fn new(options: PoolOptions) -> Self {
        Self {
            options,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                outstanding: 0,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
                created: 0,
                closed: false,
            }),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Borrow a connection: reuse an idle one, dial a new one while under
    /// capacity, or wait FIFO for up to `wait_timeout` when saturated.
    pub async fn acquire(&self) -> Result<UpstreamConn> {
        let (waiter_id, mut rx) = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(MypoolerError::PoolClosed);
            }

            // Idle connections are reused LIFO to favor warm ones; stale
            // entries found on the way are closed and skipped.
            if let Some(mut conn) = self.pop_live_idle(&mut state) {
                conn.touch();
                state.outstanding += 1;
                trace!(
                    idle = state.idle.len(),
                    outstanding = state.outstanding,
                    "Reusing idle upstream connection"
                );
                return Ok(conn);
            }

            if state.total() < self.options.max_size {
                // Reserve the slot before dialing so concurrent acquires
                // cannot overshoot max_size while the dial is in flight.
                state.outstanding += 1;
                drop(state);
                return self.dial_reserved().await;
            }

            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back(Waiter { id, tx });
            trace!(waiters = state.waiters.len(), "Pool saturated, queuing");
            (id, rx)
        };

        match timeout(self.options.wait_timeout, &mut rx).await {
            Ok(Ok(Handoff::Conn(conn))) => Ok(conn),
            Ok(Ok(Handoff::Capacity)) => self.dial_reserved().await,
            // Sender dropped without a handoff: the pool was drained.
            Ok(Err(_)) => Err(MypoolerError::PoolClosed),
            Err(_) => self.give_up_waiting(waiter_id, rx).await,
        }
    }

    /// The wait timer fired. Dequeue ourselves under the lock; if a handoff
    /// won the race against the timer, consume it instead of leaking it.
    async fn give_up_waiting(
        &self,
        waiter_id: u64,
        mut rx: oneshot::Receiver<Handoff>,
    ) -> Result<UpstreamConn> {
        {
            let mut state = self.state.lock().await;
            if let Some(pos) = state.waiters.iter().position(|w| w.id == waiter_id) {
                state.waiters.remove(pos);
                debug!("Acquire timed out after {:?}", self.options.wait_timeout);
                return Err(MypoolerError::PoolTimeout);
            }
        }

        // No longer queued, so a handoff was sent (or the pool drained)
        // before we reacquired the lock.
        match rx.try_recv() {
            Ok(Handoff::Conn(conn)) => Ok(conn),
            Ok(Handoff::Capacity) => self.dial_reserved().await,
            Err(_) => Err(MypoolerError::PoolClosed),
        }
    }

    /// Dial the upstream with a slot already reserved in `outstanding`.
    /// On failure the reservation is rolled back and passed to the next
    /// waiter, since the capacity is genuinely free again.
    async fn dial_reserved(&self) -> Result<UpstreamConn> {
        let target = (self.options.host.as_str(), self.options.port);
        match TcpStream::connect(target).await {
            Ok(stream) => {
                let mut state = self.state.lock().await;
                state.created += 1;
                debug!(
                    created = state.created,
                    outstanding = state.outstanding,
                    "Dialed new upstream connection"
                );
                Ok(UpstreamConn::new(stream))
            }
            Err(e) => {
                let mut state = self.state.lock().await;
                state.outstanding -= 1;
                Self::wake_one_with_capacity(&mut state);
                Err(MypoolerError::Dial {
                    host: self.options.host.clone(),
                    port: self.options.port,
                    source: e,
                })
            }
        }
    }

    /// Return a connection after a clean session. Expired or unhealthy
    /// connections are closed; otherwise the connection goes straight to the
    /// longest-waiting acquirer, or back to the idle set.
    pub async fn release(&self, mut conn: UpstreamConn) {
        let mut state = self.state.lock().await;
        state.outstanding -= 1;

        if state.closed {
            debug!("Pool draining, closing returned connection");
            return;
        }

        if !conn.healthy || conn.is_expired(self.options.max_lifetime) {
            debug!(
                age = ?conn.age(),
                healthy = conn.healthy,
                "Closing returned connection instead of pooling it"
            );
            drop(conn);
            Self::wake_one_with_capacity(&mut state);
            return;
        }

        conn.touch();
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.tx.send(Handoff::Conn(conn)) {
                Ok(()) => {
                    // The connection stays borrowed, now by the waiter.
                    state.outstanding += 1;
                    trace!("Handed released connection to a waiter");
                    return;
                }
                // Waiter gave up; its receiver is gone. Try the next one.
                Err(Handoff::Conn(back)) => conn = back,
                Err(Handoff::Capacity) => unreachable!("we sent a connection"),
            }
        }

        state.idle.push(conn);
        trace!(idle = state.idle.len(), "Returned connection to idle set");
    }

    /// Drop a connection that hit an I/O error mid-session. The freed slot
    /// is offered to the next waiter, which dials a replacement.
    pub async fn discard(&self, conn: UpstreamConn) {
        let mut state = self.state.lock().await;
        state.outstanding -= 1;
        debug!(age = ?conn.age(), "Discarding broken upstream connection");
        drop(conn);
        if !state.closed {
            Self::wake_one_with_capacity(&mut state);
        }
    }

    /// Close every idle connection and fail every queued acquire. Borrowed
    /// connections are closed as their sessions return them. Subsequent
    /// acquires fail with [`MypoolerError::PoolClosed`].
    pub async fn drain(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        let idle = state.idle.len();
        let waiting = state.waiters.len();
        state.idle.clear();
        // Dropping the senders wakes the waiters with PoolClosed.
        state.waiters.clear();
        debug!(
            idle_closed = idle,
            waiters_failed = waiting,
            outstanding = state.outstanding,
            "Pool drained"
        );
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            outstanding: state.outstanding,
            idle: state.idle.len(),
            created: state.created,
            max_size: self.options.max_size,
        }
    }

    fn pop_live_idle(&self, state: &mut PoolState) -> Option<UpstreamConn> {
        while let Some(conn) = state.idle.pop() {
            if conn.healthy && !conn.is_expired(self.options.max_lifetime) {
                return Some(conn);
            }
            debug!(age = ?conn.age(), "Closing stale idle connection");
        }
        None
    }

    /// Pass freed capacity to the longest-waiting live acquirer. The slot is
    /// reserved on its behalf before the lock is released.
    fn wake_one_with_capacity(state: &mut PoolState) {
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.tx.send(Handoff::Capacity).is_ok() {
                state.outstanding += 1;
                return;
            }
        }
    }
}
