//! Forward byte sink with a buffered cursor window.
//!
//! The fast path of [`Writer::write`] copies into a private window; the slow
//! path hands the filled window downstream and, for large writes, links the
//! data structurally instead of copying. [`ChainWriter`] is the in-memory
//! destination used throughout the chunk codecs.

use anyhow::Result;
use bytes::BytesMut;

use crate::chain::{Chain, MAX_BYTES_TO_COPY};
use crate::object::{Object, ObjectState};
use crate::varint;

/// Window allocation granularity.
pub(crate) const BUFFER_SIZE: usize = 4096;

/// Abstract forward byte sink.
///
/// `pos()` is monotonic and counts the bytes successfully written since
/// construction. Any failure poisons the writer: later calls short-circuit
/// with the retained message until `close`.
pub trait Writer: Object {
    /// Writes all of `src`.
    fn write(&mut self, src: &[u8]) -> Result<()>;

    /// Writes a chain, sharing its blocks with the destination when that is
    /// cheaper than copying.
    fn write_chain(&mut self, src: Chain) -> Result<()>;

    fn pos(&self) -> u64;

    fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.write(&[byte])
    }

    fn write_varint64(&mut self, value: u64) -> Result<()> {
        let mut buf = [0u8; varint::MAX_LEN_U64];
        let len = varint::encode_u64(value, &mut buf);
        self.write(&buf[..len])
    }

    fn write_varint32(&mut self, value: u32) -> Result<()> {
        self.write_varint64(u64::from(value))
    }
}

/// A [`Writer`] that appends to an owned [`Chain`].
pub struct ChainWriter {
    state: ObjectState,
    dest: Chain,
    /// Buffer window: start is offset 0, the cursor is `buf.len()`, the limit
    /// is `buf.capacity()`.
    buf: BytesMut,
    /// Destination position corresponding to the window start.
    start_pos: u64,
}

impl Default for ChainWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainWriter {
    pub fn new() -> Self {
        ChainWriter {
            state: ObjectState::open(),
            dest: Chain::new(),
            buf: BytesMut::new(),
            start_pos: 0,
        }
    }

    /// Bytes written into the current window.
    pub fn written_to_buffer(&self) -> usize {
        if self.healthy() {
            self.buf.len()
        } else {
            0
        }
    }

    /// Space left in the current window.
    pub fn available(&self) -> usize {
        if self.healthy() {
            self.buf.capacity() - self.buf.len()
        } else {
            0
        }
    }

    pub fn buffer_size(&self) -> usize {
        if self.healthy() {
            self.buf.capacity()
        } else {
            0
        }
    }

    /// Closes the writer and yields the accumulated chain.
    pub fn into_chain(mut self) -> Result<Chain> {
        if !self.close() {
            anyhow::bail!("{}", self.message().unwrap_or("close failed"));
        }
        Ok(std::mem::take(&mut self.dest))
    }

    /// Returns to an empty healthy writer.
    pub fn reset(&mut self) {
        self.state.reset();
        self.dest.clear();
        self.buf.clear();
        self.start_pos = 0;
    }

    fn push_window(&mut self) {
        if !self.buf.is_empty() {
            self.start_pos += self.buf.len() as u64;
            self.dest.append_bytes(self.buf.split().freeze());
        }
    }

    fn check_no_overflow(&self, len: usize) -> Result<()> {
        if len as u64 > u64::MAX - self.pos() {
            return self.state.fail("Writer position overflow");
        }
        Ok(())
    }

    fn write_slow(&mut self, src: &[u8]) -> Result<()> {
        self.push_window();
        if src.len() <= MAX_BYTES_TO_COPY {
            self.buf.reserve(BUFFER_SIZE);
            self.buf.extend_from_slice(src);
        } else {
            self.dest.append_slice(src);
            self.start_pos += src.len() as u64;
        }
        Ok(())
    }
}

impl Object for ChainWriter {
    fn state(&self) -> &ObjectState {
        &self.state
    }

    fn done(&mut self) {
        self.push_window();
        self.buf = BytesMut::new();
    }
}

impl Writer for ChainWriter {
    fn write(&mut self, src: &[u8]) -> Result<()> {
        self.state.check_healthy()?;
        self.check_no_overflow(src.len())?;
        if src.len() <= self.buf.capacity() - self.buf.len() {
            self.buf.extend_from_slice(src);
            return Ok(());
        }
        self.write_slow(src)
    }

    fn write_chain(&mut self, src: Chain) -> Result<()> {
        self.state.check_healthy()?;
        self.check_no_overflow(src.size())?;
        if src.size() <= MAX_BYTES_TO_COPY {
            if src.size() > self.buf.capacity() - self.buf.len() {
                self.push_window();
                self.buf.reserve(BUFFER_SIZE);
            }
            for block in src.blocks() {
                self.buf.extend_from_slice(block);
            }
            return Ok(());
        }
        self.push_window();
        self.start_pos += src.size() as u64;
        self.dest.append_chain(src);
        Ok(())
    }

    fn pos(&self) -> u64 {
        self.start_pos + self.buf.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn small_writes_accumulate_in_window() {
        let mut w = ChainWriter::new();
        w.write(b"abc").unwrap();
        w.write(b"def").unwrap();
        assert_eq!(w.pos(), 6);
        assert_eq!(w.written_to_buffer(), 6);
        assert_eq!(
            w.written_to_buffer() + w.available(),
            w.buffer_size()
        );
        assert_eq!(w.into_chain().unwrap().to_vec(), b"abcdef");
    }

    #[test]
    fn large_write_bypasses_window() {
        let big = vec![5u8; 2 * MAX_BYTES_TO_COPY];
        let mut w = ChainWriter::new();
        w.write(b"head").unwrap();
        w.write(&big).unwrap();
        assert_eq!(w.pos(), 4 + big.len() as u64);
        let chain = w.into_chain().unwrap();
        let mut expected = b"head".to_vec();
        expected.extend_from_slice(&big);
        assert_eq!(chain.to_vec(), expected);
    }

    #[test]
    fn write_chain_links_large_blocks() {
        let block = Bytes::from(vec![9u8; 1000]);
        let mut src = Chain::new();
        src.append_bytes(block.clone());

        let mut w = ChainWriter::new();
        w.write_chain(src).unwrap();
        let blocks = w.into_chain().unwrap().into_blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].as_ptr(), block.as_ptr());
    }

    #[test]
    fn write_chain_copies_small_chains() {
        let mut src = Chain::new();
        src.append_slice(b"tiny");
        let mut w = ChainWriter::new();
        w.write(b"x").unwrap();
        w.write_chain(src).unwrap();
        assert_eq!(w.pos(), 5);
        assert_eq!(w.into_chain().unwrap().to_vec(), b"xtiny");
    }

    #[test]
    fn varints_and_bytes() {
        let mut w = ChainWriter::new();
        w.write_byte(0x01).unwrap();
        w.write_varint64(300).unwrap();
        assert_eq!(w.into_chain().unwrap().to_vec(), vec![0x01, 0xAC, 0x02]);
    }

    #[test]
    fn failed_writer_reports_zero_window() {
        let mut w = ChainWriter::new();
        w.write(b"abc").unwrap();
        let _ = w.state().fail::<()>("simulated failure");
        assert_eq!(w.written_to_buffer(), 0);
        assert_eq!(w.available(), 0);
        assert_eq!(w.buffer_size(), 0);
        assert!(w.write(b"more").is_err());
    }

    #[test]
    fn close_is_idempotent() {
        let mut w = ChainWriter::new();
        w.write(b"abc").unwrap();
        assert!(w.close());
        assert!(w.close());
    }

    #[test]
    fn reset_allows_reuse() {
        let mut w = ChainWriter::new();
        w.write(b"junk").unwrap();
        let _ = w.state().fail::<()>("bad");
        w.reset();
        assert!(w.healthy());
        w.write(b"ok").unwrap();
        assert_eq!(w.into_chain().unwrap().to_vec(), b"ok");
    }
}
