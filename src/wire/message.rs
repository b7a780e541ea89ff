use std::io;
use std::net::Ipv4Addr;

use crate::wire::frame::{self, Frame};
use crate::wire::payload::Payload;
use crate::wire::WireError;

/// An ancestor as it travels inside topology payloads: the address and
/// port the node accepts connections on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEntry {
    pub addr: Ipv4Addr,
    pub port: u16,
}

/// A sibling as it travels inside topology payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiblingEntry {
    pub addr: Ipv4Addr,
    pub port: u16,
    pub sibling_number: u16,
}

/// `CONN_REP` / `NET_TOP` payload: the receiver's position plus its local
/// topology from the sender's viewpoint. The ancestry never includes the
/// sender itself; terminal peers are never listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyUpdate {
    pub parent_generation: u16,
    pub sibling_number: u16,
    pub ancestry: Vec<PeerEntry>,
    pub siblings: Vec<SiblingEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Join request. A terminal joiner advertises port 0.
    ConnReq {
        terminal: bool,
        tcp_port: u16,
        key: String,
    },
    /// Handshake reply or mid-session topology push; same code on the
    /// wire, same handling on receipt.
    Topology(TopologyUpdate),
    /// Key rejected; the sender closes the stream right after.
    ConnBad,
    /// A new non-terminal sibling.
    SiblingAdd(SiblingEntry),
    /// A sibling departed.
    SiblingRmv { sibling_number: u16 },
}

impl Message {
    pub fn header(&self) -> u8 {
        match self {
            Message::ConnReq { .. } => frame::CONN_REQ,
            Message::Topology(_) => frame::CONN_REP,
            Message::ConnBad => frame::CONN_BAD,
            Message::SiblingAdd(_) => frame::SIBLING_ADD,
            Message::SiblingRmv { .. } => frame::SIBLING_RMV,
        }
    }

    pub fn encode(&self) -> io::Result<Frame> {
        let mut payload = Payload::new();

        match self {
            Message::ConnReq {
                terminal,
                tcp_port,
                key,
            } => {
                payload.write_u8(*terminal as u8)?;
                payload.write_u16(*tcp_port)?;
                payload.write_u32(key.len() as u32)?;
                payload.write_bytes(key.as_bytes())?;
            }
            Message::Topology(update) => {
                payload.write_u16(update.ancestry.len() as u16)?;
                payload.write_u16(update.siblings.len() as u16)?;
                payload.write_u16(update.parent_generation)?;
                payload.write_u16(update.sibling_number)?;
                for ancestor in &update.ancestry {
                    payload.write_u32(u32::from(ancestor.addr))?;
                    payload.write_u16(ancestor.port)?;
                }
                for sibling in &update.siblings {
                    payload.write_u32(u32::from(sibling.addr))?;
                    payload.write_u16(sibling.port)?;
                    payload.write_u16(sibling.sibling_number)?;
                }
            }
            Message::ConnBad => {}
            Message::SiblingAdd(sibling) => {
                payload.write_u32(u32::from(sibling.addr))?;
                payload.write_u16(sibling.port)?;
                payload.write_u16(sibling.sibling_number)?;
            }
            Message::SiblingRmv { sibling_number } => {
                payload.write_u16(*sibling_number)?;
            }
        }

        Ok(Frame::new(self.header(), payload))
    }

    pub fn decode(frame: &mut Frame) -> Result<Message, WireError> {
        frame.payload.rewind()?;

        let decoded = match frame.header {
            frame::CONN_BAD => return Ok(Message::ConnBad),
            frame::CONN_REQ => decode_conn_req(&mut frame.payload),
            frame::CONN_REP => decode_topology(&mut frame.payload),
            frame::SIBLING_ADD => read_sibling(&mut frame.payload).map(Message::SiblingAdd),
            frame::SIBLING_RMV => decode_sibling_rmv(&mut frame.payload),
            other => return Err(WireError::UnknownHeader(other)),
        };

        decoded.map_err(|_| WireError::Malformed(frame.header))
    }
}

fn decode_conn_req(payload: &mut Payload) -> io::Result<Message> {
    let terminal = payload.read_u8()? != 0;
    let tcp_port = payload.read_u16()?;
    let key_len = payload.read_u32()? as u64;

    // The declared key length must account for every remaining byte, which
    // also bounds the allocation below.
    if key_len != payload.remaining()? {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "key length disagrees with payload size",
        ));
    }

    let key = String::from_utf8(payload.read_bytes(key_len as usize)?)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "key is not utf-8"))?;

    Ok(Message::ConnReq {
        terminal,
        tcp_port,
        key,
    })
}

fn decode_topology(payload: &mut Payload) -> io::Result<Message> {
    let ancestry_size = payload.read_u16()? as usize;
    let sibling_size = payload.read_u16()? as usize;
    let parent_generation = payload.read_u16()?;
    let sibling_number = payload.read_u16()?;

    let mut ancestry = Vec::with_capacity(ancestry_size);
    for _ in 0..ancestry_size {
        let addr = Ipv4Addr::from(payload.read_u32()?);
        let port = payload.read_u16()?;
        ancestry.push(PeerEntry { addr, port });
    }

    let mut siblings = Vec::with_capacity(sibling_size);
    for _ in 0..sibling_size {
        siblings.push(read_sibling(payload)?);
    }

    Ok(Message::Topology(TopologyUpdate {
        parent_generation,
        sibling_number,
        ancestry,
        siblings,
    }))
}

fn decode_sibling_rmv(payload: &mut Payload) -> io::Result<Message> {
    let sibling_number = payload.read_u16()?;
    Ok(Message::SiblingRmv { sibling_number })
}

fn read_sibling(payload: &mut Payload) -> io::Result<SiblingEntry> {
    let addr = Ipv4Addr::from(payload.read_u32()?);
    let port = payload.read_u16()?;
    let sibling_number = payload.read_u16()?;
    Ok(SiblingEntry {
        addr,
        port,
        sibling_number,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) -> Message {
        let mut frame = msg.encode().unwrap();
        Message::decode(&mut frame).unwrap()
    }

    fn wire_bytes(msg: &Message) -> Vec<u8> {
        let mut wire = Vec::new();
        msg.encode().unwrap().send(&mut wire).unwrap();
        wire
    }

    #[test]
    fn conn_req_round_trip() {
        let msg = Message::ConnReq {
            terminal: false,
            tcp_port: 26006,
            key: "secret".to_string(),
        };
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn conn_req_wire_layout() {
        let msg = Message::ConnReq {
            terminal: true,
            tcp_port: 26006,
            key: "k".to_string(),
        };
        // header 0x01, length 8, then terminal | port | key length | key.
        assert_eq!(hex::encode(wire_bytes(&msg)), "0100000008016596000000016b");
    }

    #[test]
    fn conn_bad_has_no_payload() {
        assert_eq!(hex::encode(wire_bytes(&Message::ConnBad)), "0300000000");
        assert_eq!(round_trip(Message::ConnBad), Message::ConnBad);
    }

    #[test]
    fn topology_round_trip() {
        let msg = Message::Topology(TopologyUpdate {
            parent_generation: 3,
            sibling_number: 12,
            ancestry: vec![
                PeerEntry {
                    addr: Ipv4Addr::new(10, 0, 0, 1),
                    port: 26005,
                },
                PeerEntry {
                    addr: Ipv4Addr::new(10, 0, 0, 2),
                    port: 26005,
                },
            ],
            siblings: vec![SiblingEntry {
                addr: Ipv4Addr::new(192, 168, 1, 9),
                port: 26007,
                sibling_number: 4,
            }],
        });
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn empty_topology_wire_layout() {
        let msg = Message::Topology(TopologyUpdate {
            parent_generation: 0,
            sibling_number: 1,
            ancestry: vec![],
            siblings: vec![],
        });
        // The reply a first child gets from a fresh root.
        assert_eq!(
            hex::encode(wire_bytes(&msg)),
            "02000000080000000000000001"
        );
    }

    #[test]
    fn sibling_add_round_trip() {
        let msg = Message::SiblingAdd(SiblingEntry {
            addr: Ipv4Addr::new(127, 0, 0, 1),
            port: 26007,
            sibling_number: 2,
        });
        assert_eq!(round_trip(msg.clone()), msg);

        // addr | port | sibling number, all big-endian.
        assert_eq!(hex::encode(wire_bytes(&msg)), "04000000087f00000165970002");
    }

    #[test]
    fn sibling_rmv_round_trip() {
        let msg = Message::SiblingRmv { sibling_number: 65534 };
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn unknown_header_is_rejected() {
        let mut frame = Frame::new(0x7e, Payload::new());
        let err = Message::decode(&mut frame).unwrap_err();
        assert!(matches!(err, WireError::UnknownHeader(0x7e)));
    }

    #[test]
    fn conn_req_with_lying_key_length_is_malformed() {
        let mut payload = Payload::new();
        payload.write_u8(0).unwrap();
        payload.write_u16(26006).unwrap();
        payload.write_u32(100).unwrap();
        payload.write_bytes(b"shortkey").unwrap();
        let mut frame = Frame::new(frame::CONN_REQ, payload);

        let err = Message::decode(&mut frame).unwrap_err();
        assert!(matches!(err, WireError::Malformed(frame::CONN_REQ)));
    }

    #[test]
    fn truncated_topology_is_malformed() {
        let mut payload = Payload::new();
        payload.write_u16(2).unwrap(); // claims two ancestors
        payload.write_u16(0).unwrap();
        payload.write_u16(0).unwrap();
        payload.write_u16(1).unwrap();
        let mut frame = Frame::new(frame::NET_TOP, payload);

        let err = Message::decode(&mut frame).unwrap_err();
        assert!(matches!(err, WireError::Malformed(frame::NET_TOP)));
    }
}
