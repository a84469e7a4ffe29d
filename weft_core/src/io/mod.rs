//! Byte-level I/O shared by templates, the host runtime and the IPC channel.

pub mod buffer;
pub mod input;
pub mod memory;
pub mod tcp;

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

pub use buffer::{ArraySource, Buffer};
pub use input::{InputLayout, InputValue};
pub use memory::MemoryChannel;
pub use tcp::{TcpChannel, TcpIpcListener};

/// Longest line `read_line` accepts, terminator included.
pub const MAX_LINE_LENGTH: usize = 8192;

/// Wire encoding of multi-byte scalars. Big-endian unless configured
/// otherwise.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ByteOrder {
    #[default]
    BigEndian,
    LittleEndian,
}

impl ByteOrder {
    /// Appends the low `width` bytes of `value`.
    ///
    /// # Arguments
    /// * `value` - The scalar; higher bytes beyond `width` are dropped.
    /// * `width` - Number of bytes to emit, at most 8.
    /// * `out` - Destination vector.
    pub fn encode(self, value: u64, width: usize, out: &mut Vec<u8>) {
        let be = value.to_be_bytes();
        let bytes = &be[8 - width..];
        match self {
            ByteOrder::BigEndian => out.extend_from_slice(bytes),
            ByteOrder::LittleEndian => out.extend(bytes.iter().rev()),
        }
    }

    /// Reassembles an integer from up to 8 bytes in this order.
    pub fn decode(self, bytes: &[u8]) -> u64 {
        let fold = |acc: u64, b: &u8| (acc << 8) | u64::from(*b);
        match self {
            ByteOrder::BigEndian => bytes.iter().fold(0, fold),
            ByteOrder::LittleEndian => bytes.iter().rev().fold(0, fold),
        }
    }
}

/// Failure on a byte stream, either the target channel or an in-memory
/// source.
#[derive(Error, Debug)]
pub enum IoError {
    #[error("timed out while {0}")]
    Timeout(&'static str),
    #[error("channel closed by peer")]
    Closed,
    #[error("no channel is attached")]
    NotConnected,
    #[error("malformed line: {0}")]
    MalformedLine(&'static str),
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("source exhausted: wanted {wanted} byte(s), {available} available")]
    UnexpectedEnd { wanted: usize, available: usize },
    #[error("{0}")]
    Layout(String),
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

/// Readable end of a byte stream.
pub trait Source {
    /// Fills `buf` completely or fails.
    fn receive(&mut self, buf: &mut [u8]) -> Result<(), IoError>;

    /// Byte order used to decode multi-byte scalars.
    fn read_order(&self) -> ByteOrder;

    /// Reads an unsigned integer of `width` bytes (at most 8).
    ///
    /// # Returns
    /// The value zero-extended to `u64`, or the error from `receive`.
    fn read_uint(&mut self, width: usize) -> Result<u64, IoError> {
        let mut bytes = [0u8; 8];
        self.receive(&mut bytes[..width])?;
        Ok(self.read_order().decode(&bytes[..width]))
    }

    fn read_u8(&mut self) -> Result<u8, IoError> {
        Ok(self.read_uint(1)? as u8)
    }

    fn read_u16(&mut self) -> Result<u16, IoError> {
        Ok(self.read_uint(2)? as u16)
    }

    fn read_u32(&mut self) -> Result<u32, IoError> {
        Ok(self.read_uint(4)? as u32)
    }

    fn read_u64(&mut self) -> Result<u64, IoError> {
        self.read_uint(8)
    }

    /// Reads one CRLF-terminated line and returns it without the
    /// terminator. A CR not followed by LF, or a bare LF, is an error.
    fn read_line(&mut self) -> Result<String, IoError> {
        let mut line = Vec::new();
        let mut seen_cr = false;
        loop {
            if line.len() + 1 >= MAX_LINE_LENGTH {
                return Err(IoError::LineTooLong(MAX_LINE_LENGTH));
            }
            let byte = self.read_u8()?;
            match (seen_cr, byte) {
                (true, b'\n') => break,
                (true, b'\r') => return Err(IoError::MalformedLine("duplicate CR")),
                (true, _) => return Err(IoError::MalformedLine("CR without LF")),
                (false, b'\r') => seen_cr = true,
                (false, b'\n') => return Err(IoError::MalformedLine("LF without CR")),
                (false, other) => line.push(other),
            }
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }
}

/// Writable end of a byte stream.
pub trait Destination {
    /// Writes all of `data` or fails.
    fn send(&mut self, data: &[u8]) -> Result<(), IoError>;

    /// Byte order used to encode multi-byte scalars.
    fn write_order(&self) -> ByteOrder;

    /// Writes the low `width` bytes of `value` (at most 8).
    fn write_uint(&mut self, value: u64, width: usize) -> Result<(), IoError> {
        let mut bytes = Vec::with_capacity(width);
        self.write_order().encode(value, width, &mut bytes);
        self.send(&bytes)
    }

    fn write_u8(&mut self, value: u8) -> Result<(), IoError> {
        self.send(&[value])
    }

    fn write_u16(&mut self, value: u16) -> Result<(), IoError> {
        self.write_uint(u64::from(value), 2)
    }

    fn write_u32(&mut self, value: u32) -> Result<(), IoError> {
        self.write_uint(u64::from(value), 4)
    }

    fn write_u64(&mut self, value: u64) -> Result<(), IoError> {
        self.write_uint(value, 8)
    }
}

/// Duplex channel to the process under test.
pub trait IpcChannel: Source + Destination {}

impl<T: Source + Destination> IpcChannel for T {}

/// Listening side of the IPC transport.
pub trait IpcListener {
    /// Waits up to `timeout` for the target to connect.
    ///
    /// # Returns
    /// * `Ok(Some(channel))` - A peer connected.
    /// * `Ok(None)` - Nobody connected in time.
    /// * `Err(_)` - The listening socket failed.
    fn accept(&mut self, timeout: Duration) -> Result<Option<Box<dyn IpcChannel>>, IoError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_order_encodes_low_bytes() {
        let mut big = Vec::new();
        ByteOrder::BigEndian.encode(0xDEAD_BEEF, 4, &mut big);
        assert_eq!(big, vec![0xDE, 0xAD, 0xBE, 0xEF]);

        let mut little = Vec::new();
        ByteOrder::LittleEndian.encode(0xDEAD_BEEF, 4, &mut little);
        assert_eq!(little, vec![0xEF, 0xBE, 0xAD, 0xDE]);

        let mut three = Vec::new();
        ByteOrder::BigEndian.encode(0x0102_0304, 3, &mut three);
        assert_eq!(three, vec![0x02, 0x03, 0x04]);
    }

    #[test]
    fn byte_order_decode_inverts_encode() {
        assert_eq!(ByteOrder::BigEndian.decode(&[0x12, 0x34]), 0x1234);
        assert_eq!(ByteOrder::LittleEndian.decode(&[0x12, 0x34]), 0x3412);
    }

    #[test]
    fn read_line_strips_crlf() {
        let mut source = ArraySource::new(b"hello\r\nworld\r\n", ByteOrder::BigEndian);
        assert_eq!(source.read_line().unwrap(), "hello");
        assert_eq!(source.read_line().unwrap(), "world");
    }

    #[test]
    fn read_line_rejects_bad_terminators() {
        let cases: [&[u8]; 3] = [b"bare\n", b"double\r\r\n", b"lonely\rx"];
        for data in cases {
            let mut source = ArraySource::new(data, ByteOrder::BigEndian);
            match source.read_line() {
                Err(IoError::MalformedLine(_)) => {}
                other => panic!("Expected MalformedLine for {data:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn read_line_enforces_maximum_length() {
        let data = vec![b'A'; MAX_LINE_LENGTH + 10];
        let mut source = ArraySource::new(&data, ByteOrder::BigEndian);
        assert!(matches!(source.read_line(), Err(IoError::LineTooLong(_))));
    }
}
