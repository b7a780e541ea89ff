use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;

use anyhow::Context;

use crate::bus::{EventQueue, NetEvent};
use crate::peer::Peer;
use crate::{log_info, log_warn};

/// Accepts inbound connections and turns each one into a fresh peer on
/// the bus. Terminal nodes never construct one of these.
pub struct Listener {
    socket: TcpListener,
}

impl Listener {
    /// Binds on all interfaces. Bind failure is fatal to startup.
    pub fn bind(port: u16) -> anyhow::Result<Listener> {
        let socket = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .with_context(|| format!("unable to bind port {}", port))?;
        Ok(Listener { socket })
    }

    /// The actually bound port. Differs from the requested one only when
    /// binding port 0.
    pub fn local_port(&self) -> anyhow::Result<u16> {
        Ok(self.socket.local_addr().context("listener has no address")?.port())
    }

    /// Runs the accept loop on its own thread. Accepted peers carry no
    /// branch coordinates; the control loop admits them once their join
    /// request arrives. An accept failure ends the loop and is reported as
    /// `ListenFailed`.
    pub fn spawn_accept(self, bus: Arc<EventQueue>) {
        thread::spawn(move || loop {
            match self.socket.accept() {
                Ok((stream, addr)) => {
                    let addr = match addr {
                        SocketAddr::V4(v4) => v4,
                        SocketAddr::V6(_) => {
                            log_warn!("Listener", "ignoring non-IPv4 connection from {}", addr);
                            continue;
                        }
                    };
                    log_info!("Listener", "node at {} connected", addr);
                    let peer = Peer::accepted(stream, addr, bus.clone());
                    bus.push(NetEvent::IncomingConnection(peer));
                }
                Err(err) => {
                    bus.push(NetEvent::ListenFailed(err));
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpStream;

    use super::*;

    #[test]
    fn accepted_stream_becomes_incoming_connection() {
        let bus = Arc::new(EventQueue::new());
        let listener = Listener::bind(0).unwrap();
        let port = listener.local_port().unwrap();
        listener.spawn_accept(bus.clone());

        let _client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();

        match bus.next() {
            NetEvent::IncomingConnection(peer) => {
                assert!(peer.is_open());
                assert_eq!(peer.sibling_number(), 0);
                assert_eq!(peer.generation(), 0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
