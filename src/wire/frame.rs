use std::io::{self, Read, Write};

use crate::wire::payload::Payload;
use crate::wire::WireError;

/// Join request: terminality, listening port and the shared key.
pub const CONN_REQ: u8 = 0x01;
/// Handshake reply from a parent. Carries the joiner's assigned position
/// and its local topology.
pub const CONN_REP: u8 = 0x02;
/// Mid-session topology push from the parent. Same code and layout as
/// `CONN_REP`; receivers treat the two identically.
pub const NET_TOP: u8 = 0x02;
/// Key rejected. No payload; the sender closes right after.
pub const CONN_BAD: u8 = 0x03;
/// A new non-terminal sibling joined under the same parent.
pub const SIBLING_ADD: u8 = 0x04;
/// A sibling departed.
pub const SIBLING_RMV: u8 = 0x05;

/// Chunk size for streaming a payload in and out of a socket.
const BUFFER_SIZE: usize = 8192;

/// One wire frame: `header u8 || length u32 (big-endian) || payload`.
/// The length counts the payload only.
#[derive(Debug)]
pub struct Frame {
    pub header: u8,
    pub payload: Payload,
}

impl Frame {
    pub fn new(header: u8, payload: Payload) -> Frame {
        Frame { header, payload }
    }

    /// Writes the header, payload length and payload to the stream.
    pub fn send(&mut self, stream: &mut impl Write) -> io::Result<()> {
        let size = self.payload.size()? as u32;

        stream.write_all(&[self.header])?;
        stream.write_all(&size.to_be_bytes())?;

        self.payload.rewind()?;
        let mut remaining = size as usize;
        let mut chunk = [0u8; BUFFER_SIZE];
        while remaining > 0 {
            let want = remaining.min(BUFFER_SIZE);
            self.payload.read_exact(&mut chunk[..want])?;
            stream.write_all(&chunk[..want])?;
            remaining -= want;
        }

        Ok(())
    }

    /// Blocks until one whole frame has arrived. Reads are looped to
    /// completion; a short read on any field means the peer closed the
    /// stream. The payload cursor is rewound before hand-off.
    pub fn recv(stream: &mut impl Read) -> Result<Frame, WireError> {
        let mut header = [0u8; 1];
        read_field(stream, &mut header)?;

        let mut size_buf = [0u8; 4];
        read_field(stream, &mut size_buf)?;
        let mut remaining = u32::from_be_bytes(size_buf) as usize;

        let mut payload = Payload::new();
        let mut chunk = [0u8; BUFFER_SIZE];
        while remaining > 0 {
            let want = remaining.min(BUFFER_SIZE);
            read_field(stream, &mut chunk[..want])?;
            payload.write_bytes(&chunk[..want])?;
            remaining -= want;
        }
        payload.rewind()?;

        Ok(Frame {
            header: header[0],
            payload,
        })
    }
}

fn read_field(stream: &mut impl Read, buf: &mut [u8]) -> Result<(), WireError> {
    stream.read_exact(buf).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => WireError::PeerClosed,
        _ => WireError::Io(err),
    })
}
