use super::{ByteOrder, Destination, IoError, Source};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Channel backed by memory: reads drain a scripted reply, writes are
/// appended to a shared log the caller can inspect after the channel has
/// been handed away.
pub struct MemoryChannel {
    incoming: VecDeque<u8>,
    sent: Rc<RefCell<Vec<u8>>>,
    order: ByteOrder,
}

impl MemoryChannel {
    pub fn new(incoming: &[u8], order: ByteOrder) -> Self {
        Self {
            incoming: incoming.iter().copied().collect(),
            sent: Rc::new(RefCell::new(Vec::new())),
            order,
        }
    }

    /// Handle on everything written to the channel so far.
    pub fn sent(&self) -> Rc<RefCell<Vec<u8>>> {
        Rc::clone(&self.sent)
    }
}

impl Source for MemoryChannel {
    /// Running out of scripted bytes looks like the peer hanging up.
    fn receive(&mut self, buf: &mut [u8]) -> Result<(), IoError> {
        if self.incoming.len() < buf.len() {
            self.incoming.clear();
            return Err(IoError::Closed);
        }
        let wanted = buf.len();
        for (slot, byte) in buf.iter_mut().zip(self.incoming.drain(..wanted)) {
            *slot = byte;
        }
        Ok(())
    }

    fn read_order(&self) -> ByteOrder {
        self.order
    }
}

impl Destination for MemoryChannel {
    fn send(&mut self, data: &[u8]) -> Result<(), IoError> {
        self.sent.borrow_mut().extend_from_slice(data);
        Ok(())
    }

    fn write_order(&self) -> ByteOrder {
        self.order
    }
}
