use std::{
    fmt,
    io::ErrorKind,
    net::{SocketAddr, TcpListener, TcpStream},
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};
use tungstenite::{
    handshake::{
        server::{NoCallback, ServerHandshake},
        HandshakeError, MidHandshake,
    },
    Message, WebSocket,
};

use crate::{BarFrame, ProtocolConfig, Result, ServerConfig, VisBridgeError};

/// Destination for bar frames.
pub trait FrameSink {
    /// Picks up connection changes. Must not block waiting for a client.
    fn poll(&mut self);

    /// Whether a client is currently attached.
    fn has_client(&self) -> bool;

    /// Sends one frame to the attached client. Returns `false` when there is
    /// no client or the client was dropped because the send failed.
    fn send(&mut self, frame: &BarFrame) -> bool;

    /// Disconnects the client and stops accepting new ones.
    fn stop(&mut self) {}
}

type Handshake = ServerHandshake<TcpStream, NoCallback>;
type HandshakeOutcome = std::result::Result<WebSocket<TcpStream>, HandshakeError<Handshake>>;

struct Client {
    id: u64,
    peer: SocketAddr,
    socket: WebSocket<TcpStream>,
}

impl Client {
    fn close(mut self) {
        let _ = self.socket.close(None);
        let _ = self.socket.flush();
    }
}

/// Connection whose upgrade request has not fully arrived yet.
struct Upgrade {
    peer: SocketAddr,
    deadline: Instant,
    handshake: MidHandshake<Handshake>,
}

/// WebSocket server holding at most one client.
///
/// Accepted sockets stay non-blocking until their upgrade completes, and
/// each [`FrameSink::poll`] only advances handshakes as far as the bytes
/// already received allow. A newly upgraded connection replaces the current
/// client, which receives a close frame. Disconnects are only noticed when a
/// send fails.
pub struct WsServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    client: Option<Client>,
    upgrades: Vec<Upgrade>,
    handshake_timeout: Duration,
    send_timeout: Duration,
    accepted: u64,
}

impl WsServer {
    /// Binds the listener in non-blocking mode.
    pub fn bind(protocol: &ProtocolConfig, server: &ServerConfig) -> Result<Self> {
        let address = format!("{}:{}", server.bind_address, protocol.port);
        let listener = TcpListener::bind(&address)
            .map_err(|err| VisBridgeError::server(format!("cannot listen on {address}: {err}")))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        info!(url = %format!("ws://{local_addr}"), "listening for a visualiser client");

        Ok(Self {
            listener,
            local_addr,
            client: None,
            upgrades: Vec::new(),
            handshake_timeout: server.handshake_timeout(),
            send_timeout: server.send_timeout(),
            accepted: 0,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Peer address of the attached client.
    pub fn client_peer(&self) -> Option<SocketAddr> {
        self.client.as_ref().map(|client| client.peer)
    }

    /// Number of connections that completed the upgrade handshake.
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Number of connections still waiting for their upgrade request.
    pub fn pending_upgrades(&self) -> usize {
        self.upgrades.len()
    }

    fn accept_new(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = self.start_upgrade(stream, peer) {
                        warn!(stage = "send", %peer, %err, "rejected connection");
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(stage = "send", %err, "accept failed");
                    break;
                }
            }
        }
    }

    fn start_upgrade(&mut self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        debug!(%peer, "connection accepted, awaiting upgrade");

        let deadline = Instant::now() + self.handshake_timeout;
        self.settle(tungstenite::accept(stream), peer, deadline);
        Ok(())
    }

    fn advance_upgrades(&mut self) {
        for upgrade in std::mem::take(&mut self.upgrades) {
            let Upgrade {
                peer,
                deadline,
                handshake,
            } = upgrade;
            self.settle(handshake.handshake(), peer, deadline);
        }
    }

    /// Attaches a finished handshake, parks an interrupted one until its
    /// deadline, and drops a failed one.
    fn settle(&mut self, outcome: HandshakeOutcome, peer: SocketAddr, deadline: Instant) {
        match outcome {
            Ok(socket) => {
                if let Err(err) = self.attach(socket, peer) {
                    warn!(stage = "send", %peer, %err, "could not configure client socket");
                }
            }
            Err(HandshakeError::Interrupted(handshake)) => {
                if Instant::now() < deadline {
                    self.upgrades.push(Upgrade {
                        peer,
                        deadline,
                        handshake,
                    });
                } else {
                    warn!(stage = "send", %peer, "websocket handshake timed out");
                }
            }
            Err(HandshakeError::Failure(err)) => {
                warn!(stage = "send", %peer, %err, "websocket handshake failed");
            }
        }
    }

    fn attach(&mut self, mut socket: WebSocket<TcpStream>, peer: SocketAddr) -> Result<()> {
        let stream = socket.get_mut();
        stream.set_nonblocking(false)?;
        stream.set_write_timeout(Some(self.send_timeout))?;

        self.accepted += 1;
        let client = Client {
            id: self.accepted,
            peer,
            socket,
        };

        if let Some(previous) = self.client.take() {
            info!(
                old_client = previous.id,
                old_peer = %previous.peer,
                client = client.id,
                %peer,
                "new client replaces the attached one"
            );
            previous.close();
        } else {
            info!(client = client.id, %peer, "client connected");
        }

        self.client = Some(client);
        Ok(())
    }
}

impl FrameSink for WsServer {
    fn poll(&mut self) {
        self.advance_upgrades();
        self.accept_new();
    }

    fn has_client(&self) -> bool {
        self.client.is_some()
    }

    fn send(&mut self, frame: &BarFrame) -> bool {
        let Some(client) = self.client.as_mut() else {
            return false;
        };

        match client.socket.send(Message::Binary(frame.to_le_bytes())) {
            Ok(()) => true,
            Err(err) => {
                info!(client = client.id, peer = %client.peer, %err, "client disconnected");
                self.client = None;
                false
            }
        }
    }

    fn stop(&mut self) {
        self.upgrades.clear();
        if let Some(client) = self.client.take() {
            debug!(client = client.id, "closing client connection");
            client.close();
        }
    }
}

impl Drop for WsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for WsServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsServer")
            .field("local_addr", &self.local_addr)
            .field("client", &self.client_peer())
            .field("pending_upgrades", &self.upgrades.len())
            .field("accepted", &self.accepted)
            .finish()
    }
}
