mod control;
mod handshake;

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::Arc;

use crate::bus::EventQueue;
use crate::listener::Listener;
use crate::log_info;
use crate::peer::{Peer, PeerId};
use crate::topology::Topology;

/// The per-process overlay node: topology state, the event bus and the
/// control loop serializing every state transition.
pub struct Overlay {
    topology: Topology,
    bus: Arc<EventQueue>,
    /// Accepted streams whose join request has not arrived yet. Not part
    /// of the topology until admission.
    pending: HashMap<PeerId, Peer>,
}

impl Overlay {
    /// A root node: no parent, generation zero.
    pub fn root() -> Overlay {
        Overlay::with_topology(Topology::new(false))
    }

    /// A child node that joins the overlay through `parent_addr`.
    pub fn child(parent_addr: SocketAddrV4, terminal: bool) -> Overlay {
        let mut overlay = Overlay::with_topology(Topology::new(terminal));
        let parent = Peer::new(parent_addr, overlay.bus.clone());
        overlay.topology.push_ancestor(parent);
        overlay
    }

    fn with_topology(topology: Topology) -> Overlay {
        Overlay {
            topology,
            bus: Arc::new(EventQueue::new()),
            pending: HashMap::new(),
        }
    }

    pub fn set_key(&mut self, key: String) {
        self.topology.set_key(key);
    }

    pub fn set_dir(&mut self, dir: PathBuf) {
        self.topology.set_dir(dir);
    }

    pub fn set_tcp_port(&mut self, tcp_port: u16) {
        self.topology.set_tcp_port(tcp_port);
    }

    pub fn set_max_conn(&mut self, max_conn: u16) {
        self.topology.set_max_conn(max_conn);
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn bus(&self) -> &Arc<EventQueue> {
        &self.bus
    }

    /// Brings the node into the overlay: binds the listener (unless
    /// terminal), joins through the parent (unless root), then starts
    /// accepting. The join handshake here is the only code path touching
    /// topology outside the control loop, and it finishes before the loop
    /// exists.
    pub fn start(&mut self) -> anyhow::Result<()> {
        let listener = if self.topology.terminal() {
            None
        } else {
            let listener = Listener::bind(self.topology.tcp_port())?;
            // Advertise the port actually bound, which matters when the
            // configured port was 0.
            self.topology.set_tcp_port(listener.local_port()?);
            Some(listener)
        };

        if !self.topology.is_root() {
            self.join_parent()?;
        }

        if let Some(listener) = listener {
            log_info!(
                "Overlay",
                "listening for nodes on port {}",
                self.topology.tcp_port()
            );
            listener.spawn_accept(self.bus.clone());
        }

        Ok(())
    }

    /// Drains the bus forever. Only a recovery failure or a dead listener
    /// ends the loop, and both are fatal to the process.
    pub fn run(&mut self) -> anyhow::Result<()> {
        loop {
            self.step()?;
        }
    }
}
