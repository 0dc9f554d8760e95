//! A non-contiguous byte buffer with cheap concatenation and slicing.
//!
//! A [`Chain`] is an ordered sequence of refcounted immutable blocks
//! ([`bytes::Bytes`]) plus a mutable tail that absorbs small appends. Large
//! appends and whole-chain appends link blocks structurally instead of
//! copying, which is what makes the writers' slow paths and the codecs'
//! stream hand-offs cheap.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// Writes of at most this many bytes are copied into a boundary block;
/// anything larger is retained as its own shared block.
pub const MAX_BYTES_TO_COPY: usize = 511;

/// Allocation granularity of the mutable tail block.
const TAIL_CAPACITY: usize = 4096;

/// An ordered sequence of shared immutable blocks with mutation restricted to
/// the two ends.
///
/// Invariants: the concatenation of the blocks equals the logical byte
/// sequence, empty blocks are never retained, and `size` caches the sum of
/// block lengths.
#[derive(Default)]
pub struct Chain {
    blocks: VecDeque<Bytes>,
    tail: BytesMut,
    size: usize,
}

impl Chain {
    pub fn new() -> Self {
        Chain::default()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.tail.clear();
        self.size = 0;
    }

    /// Appends a byte slice, copying small slices into the tail block and
    /// retaining large ones as their own block.
    pub fn append_slice(&mut self, src: &[u8]) {
        if src.is_empty() {
            return;
        }
        if src.len() <= MAX_BYTES_TO_COPY {
            if self.tail.capacity() - self.tail.len() < src.len() {
                self.tail.reserve(TAIL_CAPACITY.max(src.len()));
            }
            self.tail.extend_from_slice(src);
        } else {
            self.freeze_tail();
            self.blocks.push_back(Bytes::copy_from_slice(src));
        }
        self.size += src.len();
    }

    /// Appends an owned block. Shared zero-copy when large.
    pub fn append_bytes(&mut self, src: Bytes) {
        if src.is_empty() {
            return;
        }
        if src.len() <= MAX_BYTES_TO_COPY {
            self.append_slice(&src);
        } else {
            self.size += src.len();
            self.freeze_tail();
            self.blocks.push_back(src);
        }
    }

    /// Appends another chain, sharing its blocks.
    pub fn append_chain(&mut self, src: Chain) {
        for block in src.into_block_iter() {
            self.append_bytes(block);
        }
    }

    /// Prepends a byte slice. Small slices are merged with a small front
    /// block when possible.
    pub fn prepend_slice(&mut self, src: &[u8]) {
        if src.is_empty() {
            return;
        }
        self.size += src.len();
        if src.len() <= MAX_BYTES_TO_COPY {
            if let Some(front) = self.blocks.front() {
                if front.len() + src.len() <= MAX_BYTES_TO_COPY {
                    let mut merged = BytesMut::with_capacity(front.len() + src.len());
                    merged.extend_from_slice(src);
                    merged.extend_from_slice(front);
                    self.blocks[0] = merged.freeze();
                    return;
                }
            } else if !self.tail.is_empty() && self.tail.len() + src.len() <= MAX_BYTES_TO_COPY {
                let mut merged = BytesMut::with_capacity(self.tail.len() + src.len());
                merged.extend_from_slice(src);
                merged.extend_from_slice(&self.tail);
                self.tail = merged;
                return;
            }
        }
        self.blocks.push_front(Bytes::copy_from_slice(src));
    }

    /// Prepends an owned block without copying when large.
    pub fn prepend_bytes(&mut self, src: Bytes) {
        if src.is_empty() {
            return;
        }
        if src.len() <= MAX_BYTES_TO_COPY {
            self.prepend_slice(&src);
        } else {
            self.size += src.len();
            self.blocks.push_front(src);
        }
    }

    /// Prepends another chain, sharing its blocks.
    pub fn prepend_chain(&mut self, src: Chain) {
        for block in src.into_block_iter().rev() {
            self.prepend_bytes(block);
        }
    }

    /// Iterates the contiguous byte ranges of the chain in order.
    pub fn blocks(&self) -> impl Iterator<Item = &[u8]> {
        self.blocks
            .iter()
            .map(|b| b.as_ref())
            .chain(if self.tail.is_empty() {
                None
            } else {
                Some(self.tail.as_ref())
            })
    }

    /// Copies the whole chain into `dst`.
    ///
    /// Panics if `dst` is shorter than `size()`.
    pub fn copy_to(&self, dst: &mut [u8]) {
        let mut at = 0;
        for block in self.blocks() {
            dst[at..at + block.len()].copy_from_slice(block);
            at += block.len();
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0; self.size];
        self.copy_to(&mut out);
        out
    }

    /// The chain's bytes as one contiguous block, zero-copy when the chain
    /// already consists of a single block.
    pub fn to_bytes(&self) -> Bytes {
        if self.blocks.is_empty() {
            return self.tail.clone().freeze();
        }
        if self.blocks.len() == 1 && self.tail.is_empty() {
            return self.blocks[0].clone();
        }
        Bytes::from(self.to_vec())
    }

    /// A zero-copy sub-chain covering `start..start + len`.
    ///
    /// Panics if the range exceeds `size()`.
    pub fn range(&self, start: usize, len: usize) -> Chain {
        assert!(
            start.checked_add(len).is_some_and(|end| end <= self.size),
            "chain range out of bounds"
        );
        let mut out = Chain::new();
        let mut skip = start;
        let mut want = len;
        for block in self.blocks.iter() {
            if want == 0 {
                break;
            }
            if skip >= block.len() {
                skip -= block.len();
                continue;
            }
            let take = (block.len() - skip).min(want);
            out.append_bytes(block.slice(skip..skip + take));
            skip = 0;
            want -= take;
        }
        if want > 0 {
            out.append_slice(&self.tail[skip..skip + want]);
        }
        out
    }

    /// Consumes the chain into its blocks, freezing the tail.
    pub fn into_blocks(mut self) -> Vec<Bytes> {
        self.freeze_tail();
        self.blocks.into()
    }

    fn into_block_iter(mut self) -> impl DoubleEndedIterator<Item = Bytes> {
        self.freeze_tail();
        self.blocks.into_iter()
    }

    fn freeze_tail(&mut self) {
        if !self.tail.is_empty() {
            self.blocks.push_back(self.tail.split().freeze());
        }
    }
}

impl Clone for Chain {
    fn clone(&self) -> Self {
        let mut blocks: VecDeque<Bytes> = self.blocks.clone();
        if !self.tail.is_empty() {
            blocks.push_back(Bytes::copy_from_slice(&self.tail));
        }
        Chain {
            blocks,
            tail: BytesMut::new(),
            size: self.size,
        }
    }
}

impl PartialEq for Chain {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size && iter_eq(self.blocks(), other.blocks())
    }
}

impl Eq for Chain {}

impl PartialEq<[u8]> for Chain {
    fn eq(&self, other: &[u8]) -> bool {
        self.size == other.len() && iter_eq(self.blocks(), std::iter::once(other))
    }
}

impl PartialEq<&[u8]> for Chain {
    fn eq(&self, other: &&[u8]) -> bool {
        self == *other
    }
}

fn iter_eq<'a>(
    lhs: impl Iterator<Item = &'a [u8]>,
    rhs: impl Iterator<Item = &'a [u8]>,
) -> bool {
    // Block boundaries may differ; compare the logical byte sequences.
    let mut lhs = lhs.filter(|b| !b.is_empty());
    let mut rhs = rhs.filter(|b| !b.is_empty());
    let (mut left, mut right): (&[u8], &[u8]) = (&[], &[]);
    loop {
        if left.is_empty() {
            left = match lhs.next() {
                Some(b) => b,
                None => return right.is_empty() && rhs.next().is_none(),
            };
        }
        if right.is_empty() {
            right = match rhs.next() {
                Some(b) => b,
                None => return false,
            };
        }
        let n = left.len().min(right.len());
        if left[..n] != right[..n] {
            return false;
        }
        left = &left[n..];
        right = &right[n..];
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("size", &self.size)
            .field("blocks", &(self.blocks.len() + usize::from(!self.tail.is_empty())))
            .finish()
    }
}

impl From<Vec<u8>> for Chain {
    fn from(src: Vec<u8>) -> Self {
        let mut chain = Chain::new();
        chain.append_bytes(Bytes::from(src));
        chain
    }
}

impl From<Bytes> for Chain {
    fn from(src: Bytes) -> Self {
        let mut chain = Chain::new();
        chain.append_bytes(src);
        chain
    }
}

impl From<&[u8]> for Chain {
    fn from(src: &[u8]) -> Self {
        let mut chain = Chain::new();
        chain.append_slice(src);
        chain
    }
}
