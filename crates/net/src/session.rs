//! Per-connection sessions
//!
//! A session owns one socket. The task running [`run`] owns the read half
//! and the dispatcher state for the connection; a writer task owns the write
//! half and drains a bounded queue. Any task may call [`Session::send`]
//! without touching the socket, and frames leave in the order they were
//! queued.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, trace, warn};

use crate::codec::{FrameCodec, Inbound, Outbound};
use crate::dispatcher::{Dispatcher, Peer};
use crate::error::{Error, Result};
use crate::protocol::{ErrorCode, Message};

/// Process-unique connection identity, assigned at accept time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Reading and writing
    Active,
    /// Close requested, loops winding down
    Closing,
    /// Removed from rooms and registry; terminal
    Closed,
}

const ACTIVE: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Knobs the listener hands to every session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Close the session when no frame arrives for this long
    pub idle_timeout: Option<Duration>,
    /// How long queued frames may keep flushing after close
    pub close_linger: Duration,
    pub max_frame_size: usize,
    pub outbound_queue: usize,
}

/// Shared handle to one client connection
pub struct Session {
    id: ConnectionId,
    peer_addr: SocketAddr,
    state: AtomicU8,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
}

/// Strong reference to a session; keeps it alive while a caller uses it
pub type SessionHandle = Arc<Session>;

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Create a session and the receiving end of its outbound queue.
    ///
    /// `cancel` is usually a child of the server's shutdown token, so server
    /// shutdown closes every session.
    pub fn new(
        id: ConnectionId,
        peer_addr: SocketAddr,
        queue_capacity: usize,
        cancel: CancellationToken,
    ) -> (SessionHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(queue_capacity.clamp(1, Semaphore::MAX_PERMITS));
        let session = Arc::new(Session {
            id,
            peer_addr,
            state: AtomicU8::new(ACTIVE),
            outbound: tx,
            cancel,
        });
        (session, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::Acquire) {
            ACTIVE => SessionState::Active,
            CLOSING => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Queue a frame for delivery.
    ///
    /// Never waits. A full queue means the peer is not keeping up; the frame
    /// is dropped and the session is closed.
    pub fn send(&self, frame: Outbound) -> Result<()> {
        if !self.is_active() {
            return Err(Error::SessionClosed(self.id));
        }

        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(conn_id = %self.id, "Outbound queue full, closing slow session");
                self.close();
                Err(Error::Backpressure(self.id))
            }
            Err(TrySendError::Closed(_)) => {
                self.close();
                Err(Error::SessionClosed(self.id))
            }
        }
    }

    /// Serialize and queue a message
    pub fn send_message(&self, msg: &Message) -> Result<()> {
        self.send(Outbound::from_message(msg)?)
    }

    /// Request the session to close. Safe to call any number of times from
    /// any task, including the session's own loops.
    pub fn close(&self) {
        if self
            .state
            .compare_exchange(ACTIVE, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(conn_id = %self.id, "Session closing");
        }
        self.cancel.cancel();
    }

    /// Resolves once the session has been asked to close
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    fn mark_closed(&self) {
        self.state.store(CLOSED, Ordering::Release);
    }
}

/// Drive a session until it closes, then tear it down.
///
/// Teardown order: stop reading, give queued frames `close_linger` to flush,
/// leave the room and unregister, mark Closed.
pub async fn run<R, W>(
    session: SessionHandle,
    outbound_rx: mpsc::Receiver<Outbound>,
    reader: R,
    writer: W,
    dispatcher: Arc<Dispatcher>,
    settings: SessionSettings,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let sink = FramedWrite::new(writer, FrameCodec::with_max_frame_size(settings.max_frame_size));
    let mut writer_task = tokio::spawn(write_loop(session.clone(), sink, outbound_rx));

    let frames = FramedRead::new(
        ActivityReader::new(reader),
        FrameCodec::with_max_frame_size(settings.max_frame_size),
    );
    let mut peer = Peer::new(session.clone());

    match read_loop(&mut peer, frames, &dispatcher, settings.idle_timeout).await {
        Ok(()) => debug!(conn_id = %session.id(), "Session close requested"),
        Err(e) if e.is_disconnect() => {
            debug!(conn_id = %session.id(), error = %e, "Peer disconnected")
        }
        Err(e) => {
            warn!(conn_id = %session.id(), error = %e, "Closing session");
            let _ = session.send_message(&Message::error(ErrorCode::Protocol, e.to_string()));
        }
    }

    // Also covers a parent token firing without anyone calling close()
    session.close();

    if tokio::time::timeout(settings.close_linger, &mut writer_task)
        .await
        .is_err()
    {
        writer_task.abort();
    }

    dispatcher.disconnect(&peer).await;
    session.mark_closed();
}

/// Read half that remembers when bytes last arrived
struct ActivityReader<R> {
    inner: R,
    last_read: Instant,
}

impl<R> ActivityReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            last_read: Instant::now(),
        }
    }

    fn last_read(&self) -> Instant {
        self.last_read
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ActivityReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(result, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.last_read = Instant::now();
        }
        result
    }
}

/// Decode frames and hand them to the dispatcher, one at a time
async fn read_loop<R>(
    peer: &mut Peer,
    mut frames: FramedRead<ActivityReader<R>, FrameCodec>,
    dispatcher: &Dispatcher,
    idle_timeout: Option<Duration>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let session = peer.session().clone();
    loop {
        let next = tokio::select! {
            biased;
            _ = session.cancelled() => return Ok(()),
            next = next_frame(&mut frames, idle_timeout) => next?,
        };

        let Some(Inbound { sequence, message }) = next else {
            return Err(Error::ConnectionClosed);
        };
        trace!(conn_id = %session.id(), sequence, kind = ?message.kind(), "Frame received");

        dispatcher.handle(peer, message).await?;
    }
}

/// Next decoded frame. The idle clock restarts whenever any bytes arrive,
/// so a large frame trickling in is not cut off.
async fn next_frame<R>(
    frames: &mut FramedRead<ActivityReader<R>, FrameCodec>,
    idle_timeout: Option<Duration>,
) -> Result<Option<Inbound>>
where
    R: AsyncRead + Unpin,
{
    let Some(limit) = idle_timeout else {
        return frames.next().await.transpose();
    };

    loop {
        let deadline = frames.get_ref().last_read() + limit;
        // FramedRead keeps partial frames buffered across cancelled polls
        if let Ok(next) = tokio::time::timeout_at(deadline, frames.next()).await {
            return next.transpose();
        }
        if frames.get_ref().last_read() + limit <= Instant::now() {
            return Err(Error::IdleTimeout);
        }
    }
}

/// Writer task - drains the outbound queue onto the socket.
///
/// Frames already queued when the session closes are still written; the
/// loop stops once the queue is empty.
async fn write_loop<W>(
    session: SessionHandle,
    mut sink: FramedWrite<W, FrameCodec>,
    mut rx: mpsc::Receiver<Outbound>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = session.cancelled() => break,
        };

        // Batch whatever else is already queued into one flush
        let mut result = sink.feed(frame).await;
        while result.is_ok() {
            match rx.try_recv() {
                Ok(next) => result = sink.feed(next).await,
                Err(_) => break,
            }
        }
        if result.is_ok() {
            result = SinkExt::<Outbound>::flush(&mut sink).await;
        }

        if let Err(e) = result {
            debug!(conn_id = %session.id(), error = %e, "Write failed");
            session.close();
            break;
        }
    }
}

#[cfg(test)]
pub(crate) fn test_session(id: u64, queue_capacity: usize) -> (SessionHandle, mpsc::Receiver<Outbound>) {
    Session::new(
        ConnectionId::new(id),
        SocketAddr::from(([127, 0, 0, 1], 40000 + id as u16)),
        queue_capacity,
        CancellationToken::new(),
    )
}
