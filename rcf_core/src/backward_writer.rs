//! Backward byte sink: bytes are prepended, the cursor moves from high
//! offsets toward zero.
//!
//! Protocol-buffer submessages are length-delimited, with the length ahead of
//! the body. Assembling a record back to front lets the transpose decoder
//! emit a body first and prepend `tag | varint(len)` once the length is
//! known, in a single pass. Flushing is deliberately unsupported; the writer
//! lives only for the duration of one chunk decode.

use anyhow::Result;

use crate::chain::{Chain, MAX_BYTES_TO_COPY};
use crate::object::{Object, ObjectState};
use crate::varint;
use crate::writer::BUFFER_SIZE;

/// A byte sink assembling a [`Chain`] from back to front.
///
/// The buffer window runs downward: `start` is the window's byte length,
/// `cursor` decreases from `start` toward the limit at 0 as data is
/// prepended. `pos()` counts the bytes prepended since construction.
pub struct ChainBackwardWriter {
    state: ObjectState,
    dest: Chain,
    /// Window storage; the filled region is `buf[cursor..]`.
    buf: Vec<u8>,
    cursor: usize,
    /// Destination position corresponding to the window start.
    start_pos: u64,
}

impl Default for ChainBackwardWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainBackwardWriter {
    pub fn new() -> Self {
        ChainBackwardWriter {
            state: ObjectState::open(),
            dest: Chain::new(),
            buf: Vec::new(),
            cursor: 0,
            start_pos: 0,
        }
    }

    pub fn pos(&self) -> u64 {
        self.start_pos + self.written_to_buffer() as u64
    }

    pub fn written_to_buffer(&self) -> usize {
        if self.state.healthy() {
            self.buf.len() - self.cursor
        } else {
            0
        }
    }

    pub fn available(&self) -> usize {
        if self.state.healthy() {
            self.cursor
        } else {
            0
        }
    }

    pub fn buffer_size(&self) -> usize {
        if self.state.healthy() {
            self.buf.len()
        } else {
            0
        }
    }

    /// Prepends all of `src`.
    pub fn write(&mut self, src: &[u8]) -> Result<()> {
        self.state.check_healthy()?;
        self.check_no_overflow(src.len())?;
        if src.len() <= self.cursor {
            self.cursor -= src.len();
            self.buf[self.cursor..self.cursor + src.len()].copy_from_slice(src);
            return Ok(());
        }
        self.write_slow(src)
    }

    pub fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.write(&[byte])
    }

    /// Prepends the varint encoding of `value`.
    pub fn write_varint64(&mut self, value: u64) -> Result<()> {
        let mut buf = [0u8; varint::MAX_LEN_U64];
        let len = varint::encode_u64(value, &mut buf);
        self.write(&buf[..len])
    }

    /// Prepends a chain, sharing its blocks when that is cheaper than
    /// copying.
    pub fn write_chain(&mut self, src: Chain) -> Result<()> {
        self.state.check_healthy()?;
        self.check_no_overflow(src.size())?;
        if src.size() <= MAX_BYTES_TO_COPY && src.size() <= self.cursor {
            self.cursor -= src.size();
            let mut at = self.cursor;
            for block in src.blocks() {
                self.buf[at..at + block.len()].copy_from_slice(block);
                at += block.len();
            }
            return Ok(());
        }
        self.push_window();
        self.start_pos += src.size() as u64;
        self.dest.prepend_chain(src);
        Ok(())
    }

    /// Closes the writer and yields the assembled chain.
    pub fn into_chain(mut self) -> Result<Chain> {
        if !self.close() {
            anyhow::bail!("{}", self.message().unwrap_or("close failed"));
        }
        Ok(std::mem::take(&mut self.dest))
    }

    fn push_window(&mut self) {
        if self.cursor < self.buf.len() {
            self.start_pos += (self.buf.len() - self.cursor) as u64;
            let filled = self.buf.split_off(self.cursor);
            self.dest.prepend_bytes(filled.into());
        }
        self.buf.clear();
        self.cursor = 0;
    }

    fn write_slow(&mut self, src: &[u8]) -> Result<()> {
        self.push_window();
        if src.len() <= MAX_BYTES_TO_COPY {
            self.buf.resize(BUFFER_SIZE, 0);
            self.cursor = self.buf.len() - src.len();
            self.buf[self.cursor..].copy_from_slice(src);
        } else {
            self.start_pos += src.len() as u64;
            self.dest.prepend_slice(src);
        }
        Ok(())
    }

    fn check_no_overflow(&self, len: usize) -> Result<()> {
        if len as u64 > u64::MAX - self.pos() {
            return self.state.fail("BackwardWriter position overflow");
        }
        Ok(())
    }
}

impl Object for ChainBackwardWriter {
    fn state(&self) -> &ObjectState {
        &self.state
    }

    fn done(&mut self) {
        self.push_window();
        self.buf = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn prepends_back_to_front() {
        let mut w = ChainBackwardWriter::new();
        w.write(b"world").unwrap();
        w.write(b" ").unwrap();
        w.write(b"hello").unwrap();
        assert_eq!(w.pos(), 11);
        assert_eq!(w.into_chain().unwrap().to_vec(), b"hello world");
    }

    #[test]
    fn window_invariant_holds() {
        let mut w = ChainBackwardWriter::new();
        w.write(b"abcdef").unwrap();
        assert_eq!(w.written_to_buffer() + w.available(), w.buffer_size());
        assert_eq!(w.written_to_buffer(), 6);
    }

    #[test]
    fn large_write_becomes_own_block() {
        let big = vec![3u8; 2 * MAX_BYTES_TO_COPY];
        let mut w = ChainBackwardWriter::new();
        w.write(b"suffix").unwrap();
        w.write(&big).unwrap();
        w.write(b"prefix").unwrap();
        let mut expected = b"prefix".to_vec();
        expected.extend_from_slice(&big);
        expected.extend_from_slice(b"suffix");
        assert_eq!(w.into_chain().unwrap().to_vec(), expected);
    }

    #[test]
    fn write_chain_shares_large_blocks() {
        let block = Bytes::from(vec![8u8; 1000]);
        let mut src = Chain::new();
        src.append_bytes(block.clone());

        let mut w = ChainBackwardWriter::new();
        w.write(b"end").unwrap();
        w.write_chain(src).unwrap();
        assert_eq!(w.pos(), 1003);
        let out = w.into_chain().unwrap();
        assert_eq!(out.to_vec()[..1000], *block.as_ref());
    }

    #[test]
    fn varint_prepend_matches_forward_encoding() {
        let mut w = ChainBackwardWriter::new();
        w.write(b"tail").unwrap();
        w.write_varint64(300).unwrap();
        assert_eq!(w.into_chain().unwrap().to_vec(), b"\xAC\x02tail");
    }

    #[test]
    fn submessage_assembly_pattern() {
        // Simulate: body written first, then varint(len) and tag prepended.
        let mut w = ChainBackwardWriter::new();
        w.write(b"body").unwrap();
        let body_len = w.pos();
        w.write_varint64(body_len).unwrap();
        w.write_byte(0x12).unwrap();
        assert_eq!(w.into_chain().unwrap().to_vec(), b"\x12\x04body");
    }

    #[test]
    fn failed_writer_zeroes_window() {
        let mut w = ChainBackwardWriter::new();
        w.write(b"abc").unwrap();
        let _ = w.state().fail::<()>("simulated");
        assert_eq!(w.written_to_buffer(), 0);
        assert_eq!(w.available(), 0);
        assert_eq!(w.buffer_size(), 0);
        assert!(w.write(b"x").is_err());
    }
}
