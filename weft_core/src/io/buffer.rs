use super::{ByteOrder, IoError, Source};

/// Growable output buffer that templates and mutators serialize into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    order: ByteOrder,
}

impl Buffer {
    /// Creates an empty buffer writing multi-byte scalars in `order`.
    pub fn new(order: ByteOrder) -> Self {
        Self {
            data: Vec::new(),
            order,
        }
    }

    /// Byte order currently used by `put_uint`.
    pub fn order(&self) -> ByteOrder {
        self.order
    }

    /// Runs `f` with a temporarily switched byte order.
    pub fn with_order<R>(&mut self, order: ByteOrder, f: impl FnOnce(&mut Self) -> R) -> R {
        let saved = std::mem::replace(&mut self.order, order);
        let result = f(self);
        self.order = saved;
        result
    }

    /// Appends a single byte; byte order does not apply.
    pub fn put_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    /// Writes the low `width` bytes of `value` in the active byte order.
    pub fn put_uint(&mut self, value: u64, width: usize) {
        self.order.encode(value, width, &mut self.data);
    }

    /// Appends raw bytes as they are.
    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the buffer, returning the serialized bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

/// Reads from a borrowed byte slice.
#[derive(Debug)]
pub struct ArraySource<'a> {
    data: &'a [u8],
    offset: usize,
    order: ByteOrder,
}

impl<'a> ArraySource<'a> {
    /// Starts reading at the beginning of `data`.
    pub fn new(data: &'a [u8], order: ByteOrder) -> Self {
        Self {
            data,
            offset: 0,
            order,
        }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

impl Source for ArraySource<'_> {
    /// A read past the end fails with `IoError::UnexpectedEnd` and consumes
    /// nothing.
    fn receive(&mut self, buf: &mut [u8]) -> Result<(), IoError> {
        if buf.len() > self.remaining() {
            return Err(IoError::UnexpectedEnd {
                wanted: buf.len(),
                available: self.remaining(),
            });
        }
        buf.copy_from_slice(&self.data[self.offset..self.offset + buf.len()]);
        self.offset += buf.len();
        Ok(())
    }

    fn read_order(&self) -> ByteOrder {
        self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_writes_in_active_order() {
        let mut buffer = Buffer::new(ByteOrder::BigEndian);
        buffer.put_uint(0x0102, 2);
        buffer.with_order(ByteOrder::LittleEndian, |b| b.put_uint(0x0304, 2));
        buffer.put_u8(0xFF);
        assert_eq!(buffer.as_slice(), &[0x01, 0x02, 0x04, 0x03, 0xFF]);
        assert_eq!(buffer.order(), ByteOrder::BigEndian, "Order must be restored");
    }

    #[test]
    fn array_source_reads_scalars_in_order() {
        let data = [0x00, 0x2A, 0x01, 0x00, 0x00, 0x00];
        let mut source = ArraySource::new(&data, ByteOrder::BigEndian);
        assert_eq!(source.read_u16().unwrap(), 42);
        let mut little = ArraySource::new(&data[2..], ByteOrder::LittleEndian);
        assert_eq!(little.read_u32().unwrap(), 1);
        assert_eq!(little.remaining(), 0);
    }

    #[test]
    fn array_source_reports_short_reads() {
        let mut source = ArraySource::new(&[1, 2], ByteOrder::BigEndian);
        match source.read_u32() {
            Err(IoError::UnexpectedEnd { wanted, available }) => {
                assert_eq!((wanted, available), (4, 2));
            }
            other => panic!("Expected UnexpectedEnd, got {other:?}"),
        }
    }
}
