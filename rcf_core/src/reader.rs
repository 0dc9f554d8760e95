//! Byte sources with a buffered cursor window.
//!
//! [`Reader`] is the abstract source consumed by the chunk decoders;
//! [`ChainReader`] reads from an owned [`Chain`], where the window is the
//! current block and refills simply step to the next block. Sub-ranges can
//! be handed out as zero-copy chains, which is how decompressed streams move
//! between the codec stages without copying.

use anyhow::{bail, Result};
use bytes::Bytes;

use crate::chain::Chain;

/// Abstract byte source. `pos()` reports the absolute source position.
pub trait Reader {
    fn pos(&self) -> u64;

    /// Reads up to `dst.len()` bytes, returning how many were read; zero
    /// means end of source.
    fn read_some(&mut self, dst: &mut [u8]) -> Result<usize>;

    /// Reads exactly `dst.len()` bytes or fails.
    fn read(&mut self, dst: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < dst.len() {
            let n = self.read_some(&mut dst[filled..])?;
            if n == 0 {
                bail!(
                    "truncated input: wanted {} bytes, got {}",
                    dst.len(),
                    filled
                );
            }
            filled += n;
        }
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read(&mut byte)?;
        Ok(byte[0])
    }

    fn read_varint64(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_byte()?;
            if shift == 63 && byte > 1 {
                bail!("varint overflows 64 bits");
            }
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift >= 64 {
                bail!("varint longer than 10 bytes");
            }
        }
    }

    fn read_varint32(&mut self) -> Result<u32> {
        let value = self.read_varint64()?;
        if value > u64::from(u32::MAX) {
            bail!("varint overflows 32 bits");
        }
        Ok(value as u32)
    }

    /// Reads `len` bytes into a new chain. The default copies; sources backed
    /// by chains share blocks instead.
    fn read_chain(&mut self, len: usize) -> Result<Chain> {
        let mut buf = vec![0u8; len];
        self.read(&mut buf)?;
        Ok(Chain::from(buf))
    }

    /// Discards `len` bytes.
    fn skip(&mut self, len: u64) -> Result<()> {
        let mut remaining = len;
        let mut scratch = [0u8; 256];
        while remaining > 0 {
            let want = (remaining as usize).min(scratch.len());
            self.read(&mut scratch[..want])?;
            remaining -= want as u64;
        }
        Ok(())
    }
}

/// A [`Reader`] over an owned [`Chain`].
pub struct ChainReader {
    blocks: Vec<Bytes>,
    size: u64,
    /// Index of the block holding the cursor.
    block_index: usize,
    /// Cursor offset within the current block.
    offset: usize,
    /// Absolute position of the start of the current block.
    block_start: u64,
}

impl ChainReader {
    pub fn new(chain: Chain) -> Self {
        let size = chain.size() as u64;
        ChainReader {
            blocks: chain.into_blocks(),
            size,
            block_index: 0,
            offset: 0,
            block_start: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn remaining(&self) -> u64 {
        self.size - self.pos()
    }

    pub fn at_end(&self) -> bool {
        self.remaining() == 0
    }

    /// Repositions the cursor to an absolute offset, clamped to the size.
    pub fn seek(&mut self, pos: u64) {
        let pos = pos.min(self.size);
        // Restart from the front; chunks are small enough that the scan is
        // irrelevant next to the decode work around it.
        self.block_index = 0;
        self.offset = 0;
        self.block_start = 0;
        let mut remaining = pos;
        while let Some(block) = self.blocks.get(self.block_index) {
            if remaining < block.len() as u64 {
                self.offset = remaining as usize;
                return;
            }
            remaining -= block.len() as u64;
            self.block_start += block.len() as u64;
            self.block_index += 1;
        }
        self.offset = 0;
    }

    fn advance(&mut self, mut n: usize) {
        while n > 0 {
            let block_len = self.blocks[self.block_index].len();
            let step = n.min(block_len - self.offset);
            self.offset += step;
            n -= step;
            if self.offset == block_len {
                self.block_start += block_len as u64;
                self.block_index += 1;
                self.offset = 0;
            }
        }
    }
}

impl Reader for ChainReader {
    fn pos(&self) -> u64 {
        self.block_start + self.offset as u64
    }

    fn read_some(&mut self, dst: &mut [u8]) -> Result<usize> {
        let Some(block) = self.blocks.get(self.block_index) else {
            return Ok(0);
        };
        let available = &block[self.offset..];
        let n = available.len().min(dst.len());
        dst[..n].copy_from_slice(&available[..n]);
        self.advance(n);
        Ok(n)
    }

    fn read_chain(&mut self, len: usize) -> Result<Chain> {
        if len as u64 > self.remaining() {
            bail!(
                "truncated input: wanted {} bytes, got {}",
                len,
                self.remaining()
            );
        }
        let mut out = Chain::new();
        let mut want = len;
        while want > 0 {
            let block = &self.blocks[self.block_index];
            let take = want.min(block.len() - self.offset);
            out.append_bytes(block.slice(self.offset..self.offset + take));
            self.advance(take);
            want -= take;
        }
        Ok(out)
    }

    fn skip(&mut self, len: u64) -> Result<()> {
        if len > self.remaining() {
            bail!("truncated input: cannot skip {} bytes", len);
        }
        self.advance(len as usize);
        Ok(())
    }
}

/// Adapts a [`Reader`] to [`std::io::Read`] for the compression backends.
pub struct IoReader<'a, R: Reader + ?Sized>(pub &'a mut R);

impl<R: Reader + ?Sized> std::io::Read for IoReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0
            .read_some(buf)
            .map_err(|e| std::io::Error::other(e.to_string()))
    }
}
