//! The simple chunk codec: per-record sizes followed by concatenated record
//! values, each stream independently compressed.
//!
//! Chunk data layout:
//!
//! ```text
//! [compression_type: u8]
//! [uvarint: len(compressed_sizes)] [compressed_sizes]
//! [compressed_values]                          -- to end of chunk
//! ```
//!
//! The uncompressed sizes stream is one varint per record; the values stream
//! is the records back to back. Record count and decoded data size travel in
//! the chunk header, not in the data.

use anyhow::Result;
use rcf_core::chunk::ChunkType;
use rcf_core::object::{Object, ObjectState};
use rcf_core::reader::{ChainReader, Reader};
use rcf_core::writer::Writer;
use rcf_core::{Chain, ChainWriter};
use tracing::debug;

use crate::chunk_codec::ChunkEncoder;
use crate::compressor::{decompress, CompressionType, Compressor, CompressorOptions};

/// Encodes records as a sizes stream plus a values stream.
pub struct SimpleEncoder {
    state: ObjectState,
    options: CompressorOptions,
    num_records: u64,
    sizes_compressor: Compressor,
    values_compressor: Compressor,
}

impl SimpleEncoder {
    /// `size_hint` estimates the total decoded size of all records and is
    /// forwarded to the values compressor.
    pub fn new(options: CompressorOptions, size_hint: u64) -> Self {
        SimpleEncoder {
            state: ObjectState::open(),
            options,
            num_records: 0,
            sizes_compressor: Compressor::new(options),
            values_compressor: Compressor::with_size_hint(options, size_hint),
        }
    }

    /// Returns the encoder to its empty healthy state.
    pub fn reset(&mut self) {
        self.state.reset();
        self.num_records = 0;
        self.sizes_compressor.reset();
        self.values_compressor.reset();
    }

    fn bump_record_count(&mut self, added: u64) -> Result<()> {
        match self.num_records.checked_add(added) {
            Some(total) => {
                self.num_records = total;
                Ok(())
            }
            None => self.state.fail("Too many records"),
        }
    }
}

impl Object for SimpleEncoder {
    fn state(&self) -> &ObjectState {
        &self.state
    }

    fn done(&mut self) {
        if !self.sizes_compressor.close() {
            let message = self
                .sizes_compressor
                .message()
                .unwrap_or("sizes compressor failed")
                .to_string();
            let _ = self.state.fail::<()>(message);
        }
        if !self.values_compressor.close() {
            let message = self
                .values_compressor
                .message()
                .unwrap_or("values compressor failed")
                .to_string();
            let _ = self.state.fail::<()>(message);
        }
        self.num_records = 0;
    }
}

impl ChunkEncoder for SimpleEncoder {
    fn add_record(&mut self, record: &[u8]) -> Result<()> {
        self.state.check_healthy()?;
        self.bump_record_count(1)?;
        let write_size = self
            .sizes_compressor
            .writer()
            .write_varint64(record.len() as u64);
        self.state.track(write_size)?;
        self.state
            .track(self.values_compressor.writer().write(record))
    }

    fn add_record_chain(&mut self, record: &Chain) -> Result<()> {
        self.state.check_healthy()?;
        self.bump_record_count(1)?;
        let write_size = self
            .sizes_compressor
            .writer()
            .write_varint64(record.size() as u64);
        self.state.track(write_size)?;
        self.state
            .track(self.values_compressor.writer().write_chain(record.clone()))
    }

    fn add_records(&mut self, records: Chain, limits: Vec<usize>) -> Result<()> {
        assert_eq!(
            limits.last().copied().unwrap_or(0),
            records.size(),
            "record end positions do not match concatenated record values"
        );
        self.state.check_healthy()?;
        self.bump_record_count(limits.len() as u64)?;
        let mut start = 0usize;
        for limit in limits {
            assert!(limit >= start, "record end positions not sorted");
            let write_size = self
                .sizes_compressor
                .writer()
                .write_varint64((limit - start) as u64);
            self.state.track(write_size)?;
            start = limit;
        }
        self.state
            .track(self.values_compressor.writer().write_chain(records))
    }

    fn num_records(&self) -> u64 {
        self.num_records
    }

    fn encode_and_close(&mut self, dest: &mut dyn Writer) -> Result<(u64, u64)> {
        self.state.check_healthy()?;
        let num_records = self.num_records;
        let decoded_data_size = self.values_compressor.writer().pos();

        let compression_byte = dest.write_byte(self.options.compression_type() as u8);
        self.state.track(compression_byte)?;

        let mut compressed_sizes_writer = ChainWriter::new();
        let sizes = self
            .sizes_compressor
            .encode_and_close(&mut compressed_sizes_writer);
        self.state.track(sizes)?;
        let compressed_sizes = self.state.track(compressed_sizes_writer.into_chain())?;
        self.state
            .track(dest.write_varint64(compressed_sizes.size() as u64))?;
        self.state.track(dest.write_chain(compressed_sizes))?;

        let values = self.values_compressor.encode_and_close(dest);
        self.state.track(values)?;

        debug!(
            num_records,
            decoded_data_size,
            compression = ?self.options.compression_type(),
            "encoded simple chunk"
        );
        self.close();
        Ok((num_records, decoded_data_size))
    }

    fn chunk_type(&self) -> ChunkType {
        ChunkType::Simple
    }
}

/// Decodes a simple chunk into its values chain and record end offsets.
pub struct SimpleDecoder {
    state: ObjectState,
}

impl Default for SimpleDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SimpleDecoder {
    pub fn new() -> Self {
        SimpleDecoder {
            state: ObjectState::open(),
        }
    }

    /// Decodes chunk data from `src`, returning the concatenated record
    /// values and the sorted record end positions.
    pub fn decode(
        &mut self,
        src: &mut ChainReader,
        num_records: u64,
        decoded_data_size: u64,
    ) -> Result<(Chain, Vec<u64>)> {
        self.state.check_healthy()?;

        let compression_byte = self.state.track(src.read_byte())?;
        let compression_type = self
            .state
            .track(CompressionType::try_from(compression_byte))?;

        let compressed_sizes_len = self.state.track(src.read_varint64())?;
        let compressed_sizes_len = match usize::try_from(compressed_sizes_len) {
            Ok(len) if len as u64 <= src.remaining() => len,
            _ => return self.state.fail("compressed sizes stream overruns chunk"),
        };
        let compressed_sizes = self.state.track(src.read_chain(compressed_sizes_len))?;
        let sizes = self
            .state
            .track(decompress(compressed_sizes, compression_type))?;
        let mut sizes_reader = ChainReader::new(sizes);

        let rest = src.remaining() as usize;
        let compressed_values = self.state.track(src.read_chain(rest))?;
        let values = self
            .state
            .track(decompress(compressed_values, compression_type))?;

        let mut limits = Vec::with_capacity(num_records.min(4096) as usize);
        let mut end: u64 = 0;
        for _ in 0..num_records {
            let size = self.state.track(sizes_reader.read_varint64())?;
            end = match end.checked_add(size) {
                Some(end) => end,
                None => return self.state.fail("record sizes overflow"),
            };
            limits.push(end);
        }
        if !sizes_reader.at_end() {
            return self.state.fail("trailing data in sizes stream");
        }
        if end != values.size() as u64 {
            return self.state.fail(format!(
                "sizes/values mismatch: records end at {} but values stream has {} bytes",
                end,
                values.size()
            ));
        }
        if end != decoded_data_size {
            return self.state.fail(format!(
                "decoded data size mismatch: expected {}, got {}",
                decoded_data_size, end
            ));
        }
        debug!(num_records, decoded_data_size, "decoded simple chunk");
        Ok((values, limits))
    }
}

impl Object for SimpleDecoder {
    fn state(&self) -> &ObjectState {
        &self.state
    }

    fn done(&mut self) {}
}
