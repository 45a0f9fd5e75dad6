//! TCP listener for the chat server
//!
//! Accepts connections, gives each one a session and a task, and refuses
//! connections beyond the configured limit with a single `ServerFull` frame.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::codec::Outbound;
use crate::config::ServerConfig;
use crate::dispatcher::{validate_name, Dispatcher};
use crate::error::Result;
use crate::protocol::{ErrorCode, Message};
use crate::registry::Registry;
use crate::room::RoomManager;
use crate::session::{self, ConnectionId, Session, SessionSettings};

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound on writing the rejection frame to a refused peer
const REJECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything the accept loop hands to a new connection
struct Listener {
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    settings: SessionSettings,
    limiter: Arc<Semaphore>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    next_id: AtomicU64,
}

/// Running chat server handle
pub struct Server {
    addr: SocketAddr,
    registry: Arc<Registry>,
    rooms: Arc<RoomManager>,
    limiter: Arc<Semaphore>,
    max_connections: usize,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Server {
    /// Bind and start accepting connections in the background
    pub async fn start(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let addr = listener.local_addr()?;

        let registry = Arc::new(Registry::new());
        let rooms = Arc::new(RoomManager::new(config.history_capacity));
        for room in config.initial_rooms.iter().map(String::as_str).chain(config.default_room()) {
            match validate_name("room", room) {
                Ok(()) => {
                    rooms.ensure(room).await;
                }
                Err(e) => warn!(room = %room, error = %e, "Skipping configured room"),
            }
        }

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            rooms.clone(),
            config.default_room().map(str::to_string),
        ));

        let limiter = Arc::new(Semaphore::new(config.max_connections));
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();

        let context = Arc::new(Listener {
            registry: registry.clone(),
            dispatcher,
            settings: config.session_settings(),
            limiter: limiter.clone(),
            shutdown: shutdown.clone(),
            tasks: tasks.clone(),
            next_id: AtomicU64::new(1),
        });
        tasks.spawn(accept_loop(listener, context));

        info!(
            addr = %addr,
            max_connections = config.max_connections,
            "Server started"
        );

        Ok(Server {
            addr,
            registry,
            rooms,
            limiter,
            max_connections: config.max_connections,
            shutdown,
            tasks,
        })
    }

    /// Get the server's bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    /// Connections currently holding a slot
    pub fn live_connections(&self) -> usize {
        self.max_connections - self.limiter.available_permits()
    }

    /// Stop accepting and close every session
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Server shutdown initiated");
        }
        self.shutdown.cancel();
    }

    /// Wait for the listener and every connection task to finish.
    /// Only returns after [`Server::shutdown`].
    pub async fn wait(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        info!("Server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Accept incoming connections until shutdown
async fn accept_loop(listener: TcpListener, context: Arc<Listener>) {
    loop {
        tokio::select! {
            _ = context.shutdown.cancelled() => {
                info!("Accept loop shutting down");
                break;
            }
            result = listener.accept() => match result {
                Ok((stream, addr)) => admit(&context, stream, addr),
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

fn admit(context: &Arc<Listener>, stream: TcpStream, addr: SocketAddr) {
    let Ok(permit) = context.limiter.clone().try_acquire_owned() else {
        warn!(addr = %addr, "Connection limit reached, refusing");
        context.tasks.spawn(reject(stream));
        return;
    };

    let id = ConnectionId::new(context.next_id.fetch_add(1, Ordering::Relaxed));
    context
        .tasks
        .spawn(handle_connection(context.clone(), stream, addr, id, permit));
}

/// Tell a refused peer why, then hang up
async fn reject(mut stream: TcpStream) {
    let frame = match Outbound::from_message(&Message::error(ErrorCode::ServerFull, "server is full")) {
        Ok(frame) => frame,
        Err(e) => {
            error!(error = %e, "Failed to encode rejection");
            return;
        }
    };
    let bytes = frame.to_bytes(1);

    let written = tokio::time::timeout(REJECT_TIMEOUT, async {
        stream.write_all(&bytes).await?;
        stream.shutdown().await
    })
    .await;
    if !matches!(written, Ok(Ok(()))) {
        debug!("Refused peer went away before the rejection was sent");
    }
}

/// Handle a single client connection
async fn handle_connection(
    context: Arc<Listener>,
    stream: TcpStream,
    addr: SocketAddr,
    id: ConnectionId,
    _permit: OwnedSemaphorePermit,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(conn_id = %id, error = %e, "Failed to set TCP_NODELAY");
    }
    let (reader, writer) = stream.into_split();

    let (session, outbound_rx) = Session::new(
        id,
        addr,
        context.settings.outbound_queue,
        context.shutdown.child_token(),
    );
    context.registry.register(session.clone()).await;
    info!(conn_id = %id, addr = %addr, "Connection accepted");

    session::run(
        session,
        outbound_rx,
        reader,
        writer,
        context.dispatcher.clone(),
        context.settings.clone(),
    )
    .await;

    info!(conn_id = %id, "Connection closed");
}
