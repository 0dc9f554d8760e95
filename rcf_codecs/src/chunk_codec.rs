//! Chunk-level entry points: the [`ChunkEncoder`] trait implemented by both
//! codecs, and [`ChunkDecoder`], which parses an encoded chunk and exposes
//! its records by index.

use anyhow::Result;
use bytes::Bytes;
use rcf_core::backward_writer::ChainBackwardWriter;
use rcf_core::chunk::{Chunk, ChunkType};
use rcf_core::object::{Object, ObjectState};
use rcf_core::reader::{ChainReader, Reader};
use rcf_core::writer::Writer;
use rcf_core::{Chain, ChainWriter};
use tracing::debug;

use crate::field_filter::FieldFilter;
use crate::simple::SimpleDecoder;
use crate::transpose::TransposeDecoder;

/// Batches records and encodes them into one chunk's data bytes.
///
/// Record count and decoded data size are reported out of band by
/// `encode_and_close`; the chunk framing records them in the header.
pub trait ChunkEncoder: Object {
    fn add_record(&mut self, record: &[u8]) -> Result<()>;

    fn add_record_chain(&mut self, record: &Chain) -> Result<()>;

    /// Adds multiple records expressed as concatenated values plus sorted
    /// end positions.
    ///
    /// Preconditions: `limits` are sorted and `limits.last()` equals
    /// `records.size()`.
    fn add_records(&mut self, records: Chain, limits: Vec<usize>) -> Result<()> {
        assert_eq!(
            limits.last().copied().unwrap_or(0),
            records.size(),
            "record end positions do not match concatenated record values"
        );
        let mut start = 0usize;
        for limit in limits {
            assert!(limit >= start, "record end positions not sorted");
            self.add_record_chain(&records.range(start, limit - start))?;
            start = limit;
        }
        Ok(())
    }

    /// Number of records added so far.
    fn num_records(&self) -> u64;

    /// Encodes the chunk data into `dest` and closes the encoder. Returns
    /// `(num_records, decoded_data_size)`.
    fn encode_and_close(&mut self, dest: &mut dyn Writer) -> Result<(u64, u64)>;

    /// The chunk type to record in the chunk header.
    fn chunk_type(&self) -> ChunkType;

    /// Encodes into a framed [`Chunk`], closing the encoder.
    fn encode_chunk(&mut self) -> Result<Chunk>
    where
        Self: Sized,
    {
        let chunk_type = self.chunk_type();
        let mut writer = ChainWriter::new();
        let (num_records, decoded_data_size) = self.encode_and_close(&mut writer)?;
        Ok(Chunk::new(
            chunk_type,
            num_records,
            decoded_data_size,
            writer.into_chain()?,
        ))
    }
}

/// Options for [`ChunkDecoder`].
#[derive(Debug, Clone, Default)]
pub struct ChunkDecoderOptions {
    skip_errors: bool,
    field_filter: FieldFilter,
}

impl ChunkDecoderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// When true, records rejected by the caller's parse function in
    /// [`ChunkDecoder::read_record_with`] are skipped instead of failing the
    /// decoder.
    pub fn set_skip_errors(mut self, skip_errors: bool) -> Self {
        self.skip_errors = skip_errors;
        self
    }

    /// Restricts returned records to a subset of fields. Only the transpose
    /// codec can act on this; simple chunks return whole records.
    pub fn set_field_filter(mut self, field_filter: FieldFilter) -> Self {
        self.field_filter = field_filter;
        self
    }
}

/// Decodes one chunk and reads its records in order or by index.
///
/// Invariants: `limits` are sorted, `index() <= num_records()`, and a failed
/// decoder reports `index() == num_records()` so reads simply stop.
pub struct ChunkDecoder {
    state: ObjectState,
    skip_errors: bool,
    field_filter: FieldFilter,
    limits: Vec<u64>,
    values_reader: ChainReader,
    index: u64,
    skipped_records: u64,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new(ChunkDecoderOptions::default())
    }
}

impl ChunkDecoder {
    /// Creates an empty decoder; `reset_chunk` loads a chunk into it.
    pub fn new(options: ChunkDecoderOptions) -> Self {
        ChunkDecoder {
            state: ObjectState::open(),
            skip_errors: options.skip_errors,
            field_filter: options.field_filter,
            limits: Vec::new(),
            values_reader: ChainReader::new(Chain::new()),
            index: 0,
            skipped_records: 0,
        }
    }

    /// Returns the decoder to the empty healthy state.
    pub fn reset(&mut self) {
        self.state.reset();
        self.limits.clear();
        self.values_reader = ChainReader::new(Chain::new());
        self.index = 0;
        self.skipped_records = 0;
    }

    /// Resets the decoder and parses `chunk`.
    pub fn reset_chunk(&mut self, chunk: &Chunk) -> Result<()> {
        self.reset();
        let header = &chunk.header;
        let mut src = ChainReader::new(chunk.data.clone());
        match header.chunk_type {
            ChunkType::Simple => {
                let mut decoder = SimpleDecoder::new();
                let decoded = decoder.decode(
                    &mut src,
                    header.num_records,
                    header.decoded_data_size,
                );
                let (values, limits) = self.state.track(decoded)?;
                self.limits = limits;
                self.values_reader = ChainReader::new(values);
            }
            ChunkType::Transpose => {
                let mut decoder = TransposeDecoder::new();
                let mut dest = ChainBackwardWriter::new();
                let mut limits = Vec::new();
                let decoded = decoder.decode(
                    &mut src,
                    header.num_records,
                    header.decoded_data_size,
                    &self.field_filter,
                    &mut dest,
                    &mut limits,
                );
                self.state.track(decoded)?;
                let values = self.state.track(dest.into_chain())?;
                self.limits = limits;
                self.values_reader = ChainReader::new(values);
            }
            // File framing chunks carry no records.
            ChunkType::FileSignature | ChunkType::Padding => {}
        }
        debug!(
            chunk_type = ?header.chunk_type,
            num_records = self.limits.len(),
            "chunk decoded"
        );
        Ok(())
    }

    pub fn num_records(&self) -> u64 {
        self.limits.len() as u64
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    /// Number of records skipped because they could not be parsed.
    pub fn skipped_records(&self) -> u64 {
        self.skipped_records
    }

    /// Positions the cursor at record `index`, clamped to `num_records()`.
    pub fn set_index(&mut self, index: u64) {
        self.index = index.min(self.num_records());
        let start = if self.index == 0 {
            0
        } else {
            self.limits[self.index as usize - 1]
        };
        self.values_reader.seek(start);
    }

    /// Reads the next record as a zero-copy chain; `None` when the chunk
    /// ends.
    pub fn read_record_chain(&mut self) -> Option<Chain> {
        if self.index == self.num_records() {
            return None;
        }
        let start = self.values_reader.pos();
        let limit = self.limits[self.index as usize];
        self.index += 1;
        debug_assert!(limit >= start, "record end positions not sorted");
        let record = self
            .values_reader
            .read_chain((limit - start) as usize)
            .expect("record ranges are validated when the chunk is parsed");
        Some(record)
    }

    /// Reads the next record as contiguous bytes; `None` when the chunk
    /// ends.
    pub fn read_record(&mut self) -> Option<Bytes> {
        self.read_record_chain().map(|chain| chain.to_bytes())
    }

    /// Reads the next record through the caller's parse function. With
    /// `skip_errors`, unparsable records are counted and skipped; otherwise
    /// the first one fails the decoder.
    pub fn read_record_with<T>(
        &mut self,
        mut parse: impl FnMut(&[u8]) -> Result<T>,
    ) -> Result<Option<T>> {
        self.state.check_healthy()?;
        while let Some(record) = self.read_record() {
            match parse(&record) {
                Ok(value) => return Ok(Some(value)),
                Err(e) => {
                    if self.skip_errors {
                        self.skipped_records += 1;
                        continue;
                    }
                    self.set_index(self.num_records());
                    return self.state.fail(format!("cannot parse record: {e}"));
                }
            }
        }
        Ok(None)
    }
}

impl Object for ChunkDecoder {
    fn state(&self) -> &ObjectState {
        &self.state
    }

    fn done(&mut self) {}
}
