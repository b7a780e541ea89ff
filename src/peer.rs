use std::fmt;
use std::net::{Shutdown, SocketAddrV4, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;

use crate::bus::{EventQueue, NetEvent};
use crate::wire::{Frame, Message, WireError};
use crate::{log_debug, log_warn};

/// How many times `open` attempts to connect before giving up.
const CONNECT_ATTEMPTS: u32 = 3;
/// Fixed delay between connect attempts.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(3);

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique handle for a peer record. Events name peers by id, so
/// the record itself stays exclusively owned by whichever topology list
/// currently holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(u64);

impl PeerId {
    pub fn next() -> PeerId {
        PeerId(NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One remote node: its address, branch coordinates and (when connected)
/// the stream to it.
///
/// The stream is shared between exactly one read task and the control
/// loop's sends; writes never race because every send happens either on
/// the control loop or during the pre-loop handshake.
pub struct Peer {
    id: PeerId,
    addr: SocketAddrV4,
    stream: Option<Arc<TcpStream>>,
    generation: u16,
    sibling_number: u16,
    terminal: bool,
    tcp_port: u16,
    bus: Arc<EventQueue>,
}

impl Peer {
    /// A peer whose branch coordinates are not known yet. `addr` is the
    /// endpoint the peer accepts connections on.
    pub fn new(addr: SocketAddrV4, bus: Arc<EventQueue>) -> Peer {
        Peer {
            id: PeerId::next(),
            addr,
            stream: None,
            generation: 0,
            sibling_number: 0,
            terminal: false,
            tcp_port: addr.port(),
            bus,
        }
    }

    /// A peer created from an accepted inbound stream. `addr` is the
    /// remote's ephemeral source address; the listening port arrives later
    /// with its join request.
    pub fn accepted(stream: TcpStream, addr: SocketAddrV4, bus: Arc<EventQueue>) -> Peer {
        Peer {
            id: PeerId::next(),
            addr,
            stream: Some(Arc::new(stream)),
            generation: 0,
            sibling_number: 0,
            terminal: false,
            tcp_port: 0,
            bus,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddrV4 {
        self.addr
    }

    pub fn generation(&self) -> u16 {
        self.generation
    }

    pub fn sibling_number(&self) -> u16 {
        self.sibling_number
    }

    pub fn terminal(&self) -> bool {
        self.terminal
    }

    /// The port the peer accepts inbound connections on, as opposed to the
    /// ephemeral source port of an existing connection.
    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn set_generation(&mut self, generation: u16) {
        self.generation = generation;
    }

    pub fn set_sibling_number(&mut self, sibling_number: u16) {
        self.sibling_number = sibling_number;
    }

    pub fn set_terminal(&mut self, terminal: bool) {
        self.terminal = terminal;
    }

    pub fn set_tcp_port(&mut self, tcp_port: u16) {
        self.tcp_port = tcp_port;
    }

    /// Opens a connection to the peer, closing any existing stream first.
    /// Retries a fixed number of times with a fixed delay.
    pub fn open(&mut self) -> anyhow::Result<()> {
        self.close();

        let mut attempt = 0;
        loop {
            attempt += 1;
            match TcpStream::connect(self.addr) {
                Ok(stream) => {
                    self.stream = Some(Arc::new(stream));
                    return Ok(());
                }
                Err(err) if attempt < CONNECT_ATTEMPTS => {
                    log_warn!(
                        "Peer",
                        "connect to {} failed (attempt {}/{}): {}",
                        self.addr,
                        attempt,
                        CONNECT_ATTEMPTS,
                        err
                    );
                    thread::sleep(CONNECT_RETRY_DELAY);
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("unable to connect to {}", self.addr))
                }
            }
        }
    }

    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    pub fn send(&self, msg: &Message) -> anyhow::Result<()> {
        let stream = self
            .stream
            .as_ref()
            .with_context(|| format!("no open stream to {}", self.addr))?;
        let mut frame = msg.encode()?;
        let mut sock: &TcpStream = stream;
        frame
            .send(&mut sock)
            .with_context(|| format!("unable to send to {}", self.addr))
    }

    /// Blocking receive of a single frame. Only used during the join
    /// handshake, before the read task takes over the stream.
    pub fn recv(&self) -> anyhow::Result<Frame> {
        let stream = self
            .stream
            .as_ref()
            .with_context(|| format!("no open stream to {}", self.addr))?;
        let mut sock: &TcpStream = stream;
        Ok(Frame::recv(&mut sock)?)
    }

    /// Spawns the dedicated read task for this peer. Every decoded frame is
    /// published as `MessageReceived`; the first receive failure publishes
    /// `PeerDisconnected` and ends the task.
    pub fn spawn_listen(&self) {
        let Some(stream) = self.stream.clone() else {
            return;
        };
        let id = self.id;
        let addr = self.addr;
        let bus = self.bus.clone();

        thread::spawn(move || {
            let mut sock: &TcpStream = &stream;
            loop {
                let mut frame = match Frame::recv(&mut sock) {
                    Ok(frame) => frame,
                    Err(err) => {
                        log_debug!("Peer", "read loop for {} ({}) ended: {}", id, addr, err);
                        break;
                    }
                };
                match Message::decode(&mut frame) {
                    Ok(msg) => bus.push(NetEvent::MessageReceived(id, msg)),
                    Err(err @ (WireError::UnknownHeader(_) | WireError::Malformed(_))) => {
                        // The frame boundary was already consumed, so the
                        // stream stays in sync; drop the message only.
                        log_warn!("Peer", "dropping message from {} ({}): {}", id, addr, err);
                    }
                    Err(err) => {
                        log_warn!("Peer", "read loop for {} ({}) failed: {}", id, addr, err);
                        break;
                    }
                }
            }
            bus.push(NetEvent::PeerDisconnected(id));
            let _ = stream.shutdown(Shutdown::Both);
        });
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("generation", &self.generation)
            .field("sibling_number", &self.sibling_number)
            .field("terminal", &self.terminal)
            .field("tcp_port", &self.tcp_port)
            .field("open", &self.is_open())
            .finish()
    }
}
