use std::path::PathBuf;

use crate::log_warn;
use crate::peer::{Peer, PeerId};

pub const DEFAULT_TCP_PORT: u16 = 26005;
pub const DEFAULT_MAX_CONN: u16 = 10;

/// The overlay as seen from this process: the chain of ancestors above it,
/// the siblings beside it and the children below it, plus this node's own
/// branch coordinates and configuration.
///
/// Mutations are serialized by the control loop; the join handshake is the
/// one exception and runs strictly before the loop starts.
pub struct Topology {
    /// Index 0 is the immediate parent, the last entry the root-most known
    /// ancestor. Empty exactly when this node is root.
    ancestry: Vec<Peer>,
    /// Peers sharing this node's parent. Ordinals are unique.
    siblings: Vec<Peer>,
    /// Admitted children. Terminal children are held here but never
    /// advertised to anyone.
    children: Vec<Peer>,
    generation: u16,
    sibling_number: u16,
    terminal: bool,
    key: String,
    dir: Option<PathBuf>,
    tcp_port: u16,
    max_conn: u16,
    next_sibling_number: u16,
}

impl Topology {
    pub fn new(terminal: bool) -> Topology {
        Topology {
            ancestry: Vec::new(),
            siblings: Vec::new(),
            children: Vec::new(),
            generation: 0,
            sibling_number: 0,
            terminal,
            key: String::new(),
            dir: None,
            tcp_port: DEFAULT_TCP_PORT,
            max_conn: DEFAULT_MAX_CONN,
            next_sibling_number: 1,
        }
    }

    pub fn set_key(&mut self, key: String) {
        self.key = key;
    }

    pub fn set_dir(&mut self, dir: PathBuf) {
        self.dir = Some(dir);
    }

    pub fn set_tcp_port(&mut self, tcp_port: u16) {
        self.tcp_port = tcp_port;
    }

    pub fn set_max_conn(&mut self, max_conn: u16) {
        self.max_conn = max_conn;
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn dir(&self) -> Option<&PathBuf> {
        self.dir.as_ref()
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    pub fn max_conn(&self) -> u16 {
        self.max_conn
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

    pub fn set_generation(&mut self, generation: u16) {
        self.generation = generation;
    }

    pub fn set_sibling_number(&mut self, sibling_number: u16) {
        self.sibling_number = sibling_number;
    }

    pub fn is_root(&self) -> bool {
        self.ancestry.is_empty()
    }

    pub fn parent(&self) -> Option<&Peer> {
        self.ancestry.first()
    }

    pub fn parent_mut(&mut self) -> Option<&mut Peer> {
        self.ancestry.first_mut()
    }

    /// Whether `id` names the immediate parent. Only the parent's topology
    /// updates are accepted.
    pub fn is_parent(&self, id: PeerId) -> bool {
        self.parent().map(|p| p.id() == id).unwrap_or(false)
    }

    pub fn ancestry(&self) -> &[Peer] {
        &self.ancestry
    }

    pub fn siblings(&self) -> &[Peer] {
        &self.siblings
    }

    pub fn children(&self) -> &[Peer] {
        &self.children
    }

    pub fn push_ancestor(&mut self, peer: Peer) {
        self.ancestry.push(peer);
    }

    pub fn set_ancestry(&mut self, ancestry: Vec<Peer>) {
        self.ancestry = ancestry;
    }

    pub fn take_ancestry(&mut self) -> Vec<Peer> {
        std::mem::take(&mut self.ancestry)
    }

    /// Drops every ancestor past the immediate parent.
    pub fn trim_ancestry_to_parent(&mut self) {
        self.ancestry.truncate(1);
    }

    /// Inserts a sibling. A duplicate ordinal replaces the previous entry.
    pub fn add_sibling(&mut self, peer: Peer) {
        self.siblings
            .retain(|s| s.sibling_number() != peer.sibling_number());
        self.siblings.push(peer);
    }

    pub fn remove_sibling(&mut self, sibling_number: u16) -> Option<Peer> {
        let index = self
            .siblings
            .iter()
            .position(|s| s.sibling_number() == sibling_number)?;
        Some(self.siblings.remove(index))
    }

    pub fn take_siblings(&mut self) -> Vec<Peer> {
        std::mem::take(&mut self.siblings)
    }

    pub fn clear_siblings(&mut self) {
        self.siblings.clear();
    }

    /// The sibling holding the lowest ordinal, the parent candidate during
    /// recovery.
    pub fn min_sibling(&self) -> Option<&Peer> {
        self.siblings.iter().min_by_key(|s| s.sibling_number())
    }

    pub fn add_child(&mut self, peer: Peer) {
        self.children.push(peer);
    }

    pub fn remove_child(&mut self, id: PeerId) -> Option<Peer> {
        let index = self.children.iter().position(|c| c.id() == id)?;
        Some(self.children.remove(index))
    }

    pub fn is_child(&self, id: PeerId) -> bool {
        self.children.iter().any(|c| c.id() == id)
    }

    /// Hands out the next sibling ordinal. Starts at 1 and wraps from
    /// 65535 back to 1; ordinal 0 is reserved for the root.
    pub fn next_sibling_number(&mut self) -> u16 {
        if self.next_sibling_number == u16::MAX {
            log_warn!("Topology", "sibling ordinal space wrapped");
            self.next_sibling_number = 1;
        }

        let assigned = self.next_sibling_number;
        self.next_sibling_number += 1;
        assigned
    }

    /// Peers a message should be relayed to: the parent (if any) plus all
    /// live children, minus the originator.
    pub fn relay_targets(&self, originator: Option<PeerId>) -> Vec<&Peer> {
        let mut targets: Vec<&Peer> = Vec::new();
        if let Some(parent) = self.parent() {
            targets.push(parent);
        }
        targets.extend(self.children.iter().filter(|c| c.is_open()));
        if let Some(originator) = originator {
            targets.retain(|p| p.id() != originator);
        }
        targets
    }
}
