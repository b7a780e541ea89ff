use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};

use tempfile::SpooledTempFile;

/// Payloads stay in memory up to this size, then spill to a temp file.
const SPOOL_THRESHOLD: usize = 64 * 1024;

/// A seekable payload buffer with typed big-endian reads and writes.
///
/// Backed by an OS temp file past the spool threshold, so a large payload
/// never has to fit in memory. All multi-byte integers are big-endian on
/// the wire and host-endian in and out of these methods.
pub struct Payload {
    buf: SpooledTempFile,
}

impl Payload {
    pub fn new() -> Payload {
        Payload {
            buf: SpooledTempFile::new(SPOOL_THRESHOLD),
        }
    }

    pub fn write_u8(&mut self, val: u8) -> io::Result<()> {
        self.buf.write_all(&[val])
    }

    pub fn write_u16(&mut self, val: u16) -> io::Result<()> {
        self.buf.write_all(&val.to_be_bytes())
    }

    pub fn write_u32(&mut self, val: u32) -> io::Result<()> {
        self.buf.write_all(&val.to_be_bytes())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.buf.write_all(bytes)
    }

    pub fn read_u8(&mut self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.buf.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self) -> io::Result<u16> {
        let mut buf = [0u8; 2];
        self.buf.read_exact(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    pub fn read_u32(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.buf.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    pub fn read_bytes(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.buf.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Total payload size, independent of the current cursor.
    pub fn size(&mut self) -> io::Result<u64> {
        let position = self.buf.stream_position()?;
        let size = self.buf.seek(SeekFrom::End(0))?;
        self.buf.seek(SeekFrom::Start(position))?;
        Ok(size)
    }

    /// Bytes left between the cursor and the end of the payload.
    pub fn remaining(&mut self) -> io::Result<u64> {
        let position = self.buf.stream_position()?;
        let size = self.buf.seek(SeekFrom::End(0))?;
        self.buf.seek(SeekFrom::Start(position))?;
        Ok(size - position)
    }

    /// Moves the read cursor back to the start of the payload.
    pub fn rewind(&mut self) -> io::Result<()> {
        self.buf.seek(SeekFrom::Start(0))?;
        Ok(())
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::new()
    }
}

impl Read for Payload {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.buf.read(buf)
    }
}

impl Write for Payload {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.buf.flush()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Payload")
    }
}
