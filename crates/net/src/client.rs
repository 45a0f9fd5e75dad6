//! TCP client for a chat server
//!
//! A background task owns the socket. Outgoing messages go through a command
//! channel; incoming ones come back through [`Client::next_message`].

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::codec::FrameCodec;
use crate::error::{Error, Result};
use crate::protocol::Message;

/// Depth of the command and incoming message channels
const CHANNEL_CAPACITY: usize = 256;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

enum ClientCommand {
    Send(Message),
    Quit,
}

/// Client handle for network operations
pub struct Client {
    addr: SocketAddr,
    state: Arc<RwLock<ConnectionState>>,
    incoming: mpsc::Receiver<Message>,
    cmd_tx: mpsc::Sender<ClientCommand>,
}

impl Client {
    /// Connect to a chat server
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        info!(addr = %addr, "Connecting to server");

        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let (incoming_tx, incoming) = mpsc::channel(CHANNEL_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(connection_task(
            FramedRead::new(reader, FrameCodec::new()),
            FramedWrite::new(writer, FrameCodec::new()),
            state.clone(),
            incoming_tx,
            cmd_rx,
        ));

        Ok(Client {
            addr,
            state,
            incoming,
            cmd_tx,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Next message from the server; `None` once the connection is gone
    pub async fn next_message(&mut self) -> Option<Message> {
        self.incoming.recv().await
    }

    /// Queue any message for the server
    pub async fn send(&self, msg: Message) -> Result<()> {
        self.cmd_tx
            .send(ClientCommand::Send(msg))
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Authenticate under `name`
    pub async fn join(&self, name: &str) -> Result<()> {
        self.send(Message::join(name)).await
    }

    /// Say something in the current room
    pub async fn say(&self, text: &str) -> Result<()> {
        self.send(Message::broadcast(text)).await
    }

    pub async fn join_room(&self, room: &str) -> Result<()> {
        self.send(Message::room_join(room)).await
    }

    pub async fn leave_room(&self, room: &str) -> Result<()> {
        self.send(Message::room_leave(room)).await
    }

    pub async fn private_message(&self, target: &str, text: &str) -> Result<()> {
        self.send(Message::private(target, text)).await
    }

    pub async fn list_users(&self) -> Result<()> {
        self.send(Message::UserListRequest).await
    }

    pub async fn list_rooms(&self) -> Result<()> {
        self.send(Message::RoomListRequest).await
    }

    pub async fn heartbeat(&self) -> Result<()> {
        self.send(Message::heartbeat()).await
    }

    /// Say goodbye and close the connection
    pub async fn quit(&self) -> Result<()> {
        self.cmd_tx
            .send(ClientCommand::Quit)
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Get current connection state
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }
}

/// Main connection task
async fn connection_task(
    mut frames: FramedRead<OwnedReadHalf, FrameCodec>,
    mut sink: FramedWrite<OwnedWriteHalf, FrameCodec>,
    state: Arc<RwLock<ConnectionState>>,
    incoming_tx: mpsc::Sender<Message>,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
) {
    loop {
        tokio::select! {
            // Incoming message from server
            frame = frames.next() => match frame {
                Some(Ok(inbound)) => {
                    if incoming_tx.send(inbound.message).await.is_err() {
                        debug!("Client handle dropped");
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Read error");
                    break;
                }
                None => {
                    debug!("Server closed connection");
                    break;
                }
            },

            // Outgoing command
            cmd = cmd_rx.recv() => match cmd {
                Some(ClientCommand::Send(msg)) => {
                    if let Err(e) = sink.send(msg).await {
                        warn!(error = %e, "Write error");
                        break;
                    }
                }
                Some(ClientCommand::Quit) => {
                    if let Err(e) = sink.send(Message::leave()).await {
                        debug!(error = %e, "Failed to send Leave");
                    }
                    debug!("Quit requested");
                    break;
                }
                None => break,
            },
        }
    }

    *state.write().await = ConnectionState::Disconnected;
    info!("Disconnected from server");
}
