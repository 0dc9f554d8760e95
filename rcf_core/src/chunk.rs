//! Chunk framing: the fixed header that makes each chunk independently
//! decodable, plus [`Chunk`] read/write over the stream abstractions.

use anyhow::{bail, Result};
use xxhash_rust::xxh3::{xxh3_64, Xxh3};

use crate::chain::Chain;
use crate::reader::Reader;
use crate::writer::Writer;

/// Fixed size of the chunk header in bytes.
///   data_size:u64 + data_hash:u64 + num_records:u64 + decoded_data_size:u64
///   + chunk_type:u8 + reserved[7] + header_hash:u64
///   = 8 + 8 + 8 + 8 + 1 + 7 + 8 = 48
pub const CHUNK_HEADER_SIZE: u64 = 48;

/// Discriminates how chunk data encodes its records.
///
/// `FileSignature` and `Padding` belong to the file framing layer; they are
/// representable so readers can recognize and skip them, but the record
/// codecs never produce them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkType {
    Padding = b'p',
    Simple = b'r',
    FileSignature = b's',
    Transpose = b't',
}

impl TryFrom<u8> for ChunkType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            b'p' => Ok(ChunkType::Padding),
            b'r' => Ok(ChunkType::Simple),
            b's' => Ok(ChunkType::FileSignature),
            b't' => Ok(ChunkType::Transpose),
            _ => bail!("unsupported chunk type {:#04x}", value),
        }
    }
}

/// Decoded representation of the 48-byte chunk header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Length of the chunk data in bytes.
    pub data_size: u64,
    /// xxh3-64 of the chunk data.
    pub data_hash: u64,
    pub chunk_type: ChunkType,
    pub num_records: u64,
    /// Sum of record sizes before compression.
    pub decoded_data_size: u64,
}

impl ChunkHeader {
    /// Serialize to exactly `CHUNK_HEADER_SIZE` bytes, computing the header
    /// hash over the leading 40.
    pub fn to_bytes(&self) -> [u8; CHUNK_HEADER_SIZE as usize] {
        let mut buf = [0u8; CHUNK_HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(&self.data_size.to_le_bytes());
        buf[8..16].copy_from_slice(&self.data_hash.to_le_bytes());
        buf[16..24].copy_from_slice(&self.num_records.to_le_bytes());
        buf[24..32].copy_from_slice(&self.decoded_data_size.to_le_bytes());
        buf[32] = self.chunk_type as u8;
        // reserved[7] stays zero
        let header_hash = xxh3_64(&buf[..40]);
        buf[40..48].copy_from_slice(&header_hash.to_le_bytes());
        buf
    }

    /// Deserialize from `CHUNK_HEADER_SIZE` bytes, verifying the header hash.
    pub fn from_bytes(buf: &[u8; CHUNK_HEADER_SIZE as usize]) -> Result<Self> {
        let stored_hash = u64::from_le_bytes(buf[40..48].try_into()?);
        let computed = xxh3_64(&buf[..40]);
        if stored_hash != computed {
            bail!(
                "corrupted chunk header: hash {:016x} does not match {:016x}",
                stored_hash,
                computed
            );
        }
        Ok(ChunkHeader {
            data_size: u64::from_le_bytes(buf[0..8].try_into()?),
            data_hash: u64::from_le_bytes(buf[8..16].try_into()?),
            num_records: u64::from_le_bytes(buf[16..24].try_into()?),
            decoded_data_size: u64::from_le_bytes(buf[24..32].try_into()?),
            chunk_type: ChunkType::try_from(buf[32])?,
        })
    }
}

/// An immutable encoded chunk: header plus opaque data bytes.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub header: ChunkHeader,
    pub data: Chain,
}

impl Chunk {
    /// Builds a chunk around encoded data, computing sizes and hashes.
    pub fn new(
        chunk_type: ChunkType,
        num_records: u64,
        decoded_data_size: u64,
        data: Chain,
    ) -> Self {
        let mut hasher = Xxh3::new();
        for block in data.blocks() {
            hasher.update(block);
        }
        let header = ChunkHeader {
            data_size: data.size() as u64,
            data_hash: hasher.digest(),
            chunk_type,
            num_records,
            decoded_data_size,
        };
        Chunk { header, data }
    }

    pub fn write_to(&self, dest: &mut dyn Writer) -> Result<()> {
        dest.write(&self.header.to_bytes())?;
        dest.write_chain(self.data.clone())
    }

    /// Reads and validates one chunk, including the data hash.
    pub fn read_from(src: &mut impl Reader) -> Result<Chunk> {
        let mut header_buf = [0u8; CHUNK_HEADER_SIZE as usize];
        src.read(&mut header_buf)?;
        let header = ChunkHeader::from_bytes(&header_buf)?;

        let data_size = usize::try_from(header.data_size)
            .map_err(|_| anyhow::anyhow!("chunk data size too large"))?;
        let data = src.read_chain(data_size)?;

        let mut hasher = Xxh3::new();
        for block in data.blocks() {
            hasher.update(block);
        }
        if hasher.digest() != header.data_hash {
            bail!(
                "corrupted chunk data: hash {:016x} does not match {:016x}",
                header.data_hash,
                hasher.digest()
            );
        }
        Ok(Chunk { header, data })
    }
}
