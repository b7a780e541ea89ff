use anyhow::{bail, Context};

use crate::peer::Peer;
use crate::wire::Message;
use crate::{log_info, log_warn};

use super::Overlay;

impl Overlay {
    /// The outbound join: open the parent stream, present the key, adopt
    /// the assigned position from the reply, then hand the stream to its
    /// read task. Runs synchronously, outside the control loop, once at
    /// startup and once per parent-change attempt.
    pub(crate) fn join_parent(&mut self) -> anyhow::Result<()> {
        let request = Message::ConnReq {
            terminal: self.topology.terminal(),
            tcp_port: if self.topology.terminal() {
                0
            } else {
                self.topology.tcp_port()
            },
            key: self.topology.key().to_string(),
        };

        let update = {
            let parent = self.topology.parent_mut().context("no parent to join")?;
            parent.open()?;

            log_info!(
                "Overlay",
                "sending join request to parent at {}",
                parent.addr()
            );
            parent.send(&request)?;

            let mut frame = parent.recv().context("no handshake reply from parent")?;
            match Message::decode(&mut frame) {
                Ok(Message::Topology(update)) => update,
                Ok(Message::ConnBad) => bail!("join rejected: bad key"),
                Ok(other) => bail!("unexpected handshake reply {:#04x}", other.header()),
                Err(err) => return Err(err).context("handshake reply"),
            }
        };

        self.adopt(update);
        log_info!(
            "Overlay",
            "joined as generation {}, sibling {} ({} ancestors, {} siblings)",
            self.topology.generation(),
            self.topology.sibling_number(),
            self.topology.ancestry().len(),
            self.topology.siblings().len()
        );

        if let Some(parent) = self.topology.parent() {
            parent.spawn_listen();
        }
        Ok(())
    }

    /// Reorganizes after the parent link broke. The sibling holding the
    /// lowest ordinal becomes the new parent; when this node itself holds
    /// the lowest ordinal it promotes and its former siblings come to it.
    /// Runs inside the control loop; no other event is processed until it
    /// finishes. Failure to place the node is fatal.
    pub(crate) fn change_parent(&mut self) -> anyhow::Result<()> {
        let mut former = self.topology.take_ancestry();
        if former.is_empty() {
            return Ok(());
        }
        let mut dead = former.remove(0);
        dead.close();

        let own_ordinal = self.topology.sibling_number();
        match self.topology.min_sibling().map(|s| s.sibling_number()) {
            Some(lowest) if lowest < own_ordinal => self.attach_to_sibling(lowest),
            _ => self.promote(former),
        }
    }

    /// Promotion path: this node becomes the parent of its former
    /// siblings, then tries to hang itself under the surviving ancestors,
    /// nearest first. With no reachable ancestor a non-terminal node
    /// continues as root.
    fn promote(&mut self, former_ancestry: Vec<Peer>) -> anyhow::Result<()> {
        log_info!("Overlay", "taking over as parent of former siblings");
        for mut sibling in self.topology.take_siblings() {
            sibling.close();
        }

        for ancestor in former_ancestry {
            let addr = ancestor.addr();
            self.topology.set_ancestry(vec![ancestor]);
            match self.join_parent() {
                Ok(()) => {
                    log_info!("Overlay", "rejoined through ancestor at {}", addr);
                    self.relay_topology_to_children();
                    return Ok(());
                }
                Err(err) => {
                    log_warn!("Overlay", "ancestor at {} unreachable: {}", addr, err);
                    for mut failed in self.topology.take_ancestry() {
                        failed.close();
                    }
                }
            }
        }

        if self.topology.terminal() {
            bail!("no parent candidates left and a terminal node cannot become root");
        }

        self.topology.set_generation(0);
        self.topology.set_sibling_number(0);
        log_info!("Overlay", "no reachable ancestor; continuing as root");
        self.relay_topology_to_children();
        Ok(())
    }

    /// Attach path: hand over to the lowest-ordinal sibling and rejoin
    /// through it. Every other sibling and every old ancestor is dropped;
    /// they will be re-learned from the new parent's reply.
    fn attach_to_sibling(&mut self, lowest: u16) -> anyhow::Result<()> {
        let new_parent = self
            .topology
            .remove_sibling(lowest)
            .context("parent candidate vanished")?;
        for mut sibling in self.topology.take_siblings() {
            sibling.close();
        }

        log_info!("Overlay", "attaching to new parent at {}", new_parent.addr());
        self.topology.set_ancestry(vec![new_parent]);
        self.join_parent().context("unable to attach to new parent")?;
        self.relay_topology_to_children();
        Ok(())
    }
}
