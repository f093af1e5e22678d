use bytes::{Buf, BytesMut};
use std::io;

/// Bounded contiguous byte FIFO used as a per-connection transmit queue.
/// Data is appended at the tail and drained from the head; `append` refuses
/// writes that would exceed the cap so callers see backpressure rather than
/// unbounded growth.
pub struct TxQueue {
    data: BytesMut,
    max_len: usize,
}

impl TxQueue {
    #[inline]
    pub fn new(max_len: usize) -> TxQueue {
        TxQueue {
            data: BytesMut::with_capacity(max_len),
            max_len,
        }
    }

    /// The number of bytes queued.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining capacity before the cap.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.max_len - self.data.len()
    }

    /// Append bytes to the tail. Returns false (queuing nothing) if the queue
    /// would overflow its cap.
    #[inline]
    pub fn append(&mut self, buf: &[u8]) -> bool {
        if self.data.len() + buf.len() > self.max_len {
            return false;
        }
        self.data.extend_from_slice(buf);
        true
    }

    /// Slice of the queued data, oldest first.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Drop `count` bytes from the head after they have been sent.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        self.data.advance(count);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Write as much queued data as the writer accepts, consuming what was
    /// written. Stops on WouldBlock without error.
    pub fn drain_to<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let mut written = 0;
        while !self.data.is_empty() {
            match writer.write(&self.data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.data.advance(count);
                    written += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }
        Ok(written)
    }
}
