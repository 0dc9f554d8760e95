//! The transpose encoder: splits protobuf records into per-field column
//! buffers, dedups record structures into state-machine node chains, groups
//! buffers into compression buckets and emits the canonical transpose chunk
//! layout.
//!
//! Chunk data layout:
//!
//! ```text
//! [compression_type: u8]
//! [uvarint: len(compressed_header)] [compressed_header]
//! [compressed_transitions]
//! [compressed_bucket 0] ... [compressed_bucket B-1]
//! ```
//!
//! The header lists the transitions length, bucket lengths, the buffer table
//! and the state-machine nodes. Records are decoded last to first (the
//! decoder assembles output back to front), so transitions and column
//! payloads are written in reverse record order.

use std::collections::HashMap;

use anyhow::Result;
use bytes::Bytes;
use rcf_core::chunk::ChunkType;
use rcf_core::object::{Object, ObjectState};
use rcf_core::varint;
use rcf_core::writer::Writer;
use rcf_core::{Chain, ChainWriter};
use tracing::debug;

use crate::chunk_codec::ChunkEncoder;
use crate::compressor::{Compressor, CompressorOptions};
use crate::transpose::internal::{
    parse_record, CallbackCode, Event, TagData, WIRE_FIXED32, WIRE_FIXED64,
    WIRE_LENGTH_DELIMITED, WIRE_VARINT,
};

/// Default uncompressed size at which a bucket is closed.
pub const DEFAULT_BUCKET_SIZE: usize = 64 * 1024;

/// One state machine node as the encoder plans it. Structurally identical
/// records intern to the same `Vec<NodeSpec>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum NodeSpec {
    CopyTag { tag_data: TagData },
    CopyTagAndVarint { tag_data: TagData, column: u32 },
    CopyTagAndBytes { tag_data: TagData, column: u32, len: u32 },
    CopyTagAndLengthDelimited { tag_data: TagData, column: u32 },
    StartSubmessage { tag_data: TagData },
    EndSubmessage,
    NonProtoRecord { column: u32 },
    EndOfRecord,
}

/// Identity of a column buffer: the tag path from the root plus the value
/// shape stored there.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ColumnKey {
    Field { path: Vec<u32>, kind: ColumnKind },
    NonProto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ColumnKind {
    Varint,
    Fixed32,
    Fixed64,
    LengthDelimited,
}

/// One value routed to a column, in replay order within its record.
struct Payload {
    column: u32,
    /// Whether the bytes get a varint length prefix in the buffer.
    length_prefixed: bool,
    bytes: Bytes,
}

struct RecordRepr {
    structure: u32,
    payloads: Vec<Payload>,
}

/// Encodes records into the transpose chunk format.
pub struct TransposeEncoder {
    state: ObjectState,
    options: CompressorOptions,
    bucket_size: usize,
    num_records: u64,
    decoded_data_size: u64,
    column_ids: HashMap<ColumnKey, u32>,
    num_columns: u32,
    structures: Vec<Vec<NodeSpec>>,
    structure_ids: HashMap<Vec<NodeSpec>, u32>,
    records: Vec<RecordRepr>,
}

impl TransposeEncoder {
    pub fn new(options: CompressorOptions) -> Self {
        TransposeEncoder::with_bucket_size(options, DEFAULT_BUCKET_SIZE)
    }

    pub fn with_bucket_size(options: CompressorOptions, bucket_size: usize) -> Self {
        TransposeEncoder {
            state: ObjectState::open(),
            options,
            bucket_size: bucket_size.max(1),
            num_records: 0,
            decoded_data_size: 0,
            column_ids: HashMap::new(),
            num_columns: 0,
            structures: Vec::new(),
            structure_ids: HashMap::new(),
            records: Vec::new(),
        }
    }

    /// Returns the encoder to its empty healthy state.
    pub fn reset(&mut self) {
        self.state.reset();
        self.num_records = 0;
        self.decoded_data_size = 0;
        self.column_ids.clear();
        self.num_columns = 0;
        self.structures.clear();
        self.structure_ids.clear();
        self.records.clear();
    }

    fn ingest(&mut self, bytes: Bytes) -> Result<()> {
        self.state.check_healthy()?;
        if self.num_records == u64::MAX {
            return self.state.fail("Too many records");
        }
        self.decoded_data_size = match self
            .decoded_data_size
            .checked_add(bytes.len() as u64)
        {
            Some(total) => total,
            None => return self.state.fail("Decoded data size too large"),
        };
        self.num_records += 1;

        let (specs, payloads) = match parse_record(&bytes) {
            Ok(events) => self.plan_proto_record(&events),
            Err(_) => self.plan_non_proto_record(bytes),
        };
        let structure = self.intern_structure(specs);
        self.records.push(RecordRepr {
            structure,
            payloads,
        });
        Ok(())
    }

    /// Plans the replay of a parsed record: the reverse of the event order,
    /// with submessage boundaries swapped, ending in `EndOfRecord`.
    fn plan_proto_record(&mut self, events: &[Event]) -> (Vec<NodeSpec>, Vec<Payload>) {
        let mut specs = Vec::with_capacity(events.len() + 1);
        let mut payloads = Vec::new();
        let mut path: Vec<u32> = Vec::new();
        for event in events.iter().rev() {
            match event {
                Event::SubmessageEnd { field } => {
                    path.push(*field);
                    specs.push(NodeSpec::StartSubmessage {
                        tag_data: TagData::new((field << 3) | WIRE_LENGTH_DELIMITED, None),
                    });
                }
                Event::SubmessageStart { .. } => {
                    path.pop();
                    specs.push(NodeSpec::EndSubmessage);
                }
                Event::Varint { field, value } => {
                    let tag = (field << 3) | WIRE_VARINT;
                    if value.len() == 1 {
                        // Single-byte values ride inline in the tag data.
                        specs.push(NodeSpec::CopyTag {
                            tag_data: TagData::new(tag, Some(value[0])),
                        });
                    } else {
                        let column = self.column_id(&path, *field, ColumnKind::Varint);
                        specs.push(NodeSpec::CopyTagAndVarint {
                            tag_data: TagData::new(tag, None),
                            column,
                        });
                        payloads.push(Payload {
                            column,
                            length_prefixed: false,
                            bytes: value.clone(),
                        });
                    }
                }
                Event::Fixed32 { field, value } => {
                    let column = self.column_id(&path, *field, ColumnKind::Fixed32);
                    specs.push(NodeSpec::CopyTagAndBytes {
                        tag_data: TagData::new((field << 3) | WIRE_FIXED32, None),
                        column,
                        len: 4,
                    });
                    payloads.push(Payload {
                        column,
                        length_prefixed: false,
                        bytes: value.clone(),
                    });
                }
                Event::Fixed64 { field, value } => {
                    let column = self.column_id(&path, *field, ColumnKind::Fixed64);
                    specs.push(NodeSpec::CopyTagAndBytes {
                        tag_data: TagData::new((field << 3) | WIRE_FIXED64, None),
                        column,
                        len: 8,
                    });
                    payloads.push(Payload {
                        column,
                        length_prefixed: false,
                        bytes: value.clone(),
                    });
                }
                Event::LengthDelimited { field, payload } => {
                    let column = self.column_id(&path, *field, ColumnKind::LengthDelimited);
                    specs.push(NodeSpec::CopyTagAndLengthDelimited {
                        tag_data: TagData::new((field << 3) | WIRE_LENGTH_DELIMITED, None),
                        column,
                    });
                    payloads.push(Payload {
                        column,
                        length_prefixed: true,
                        bytes: payload.clone(),
                    });
                }
            }
        }
        specs.push(NodeSpec::EndOfRecord);
        (specs, payloads)
    }

    fn plan_non_proto_record(&mut self, bytes: Bytes) -> (Vec<NodeSpec>, Vec<Payload>) {
        let column = self.column_id_for(ColumnKey::NonProto);
        (
            vec![NodeSpec::NonProtoRecord { column }, NodeSpec::EndOfRecord],
            vec![Payload {
                column,
                length_prefixed: true,
                bytes,
            }],
        )
    }

    fn column_id(&mut self, path: &[u32], field: u32, kind: ColumnKind) -> u32 {
        let mut full_path = Vec::with_capacity(path.len() + 1);
        full_path.extend_from_slice(path);
        full_path.push(field);
        self.column_id_for(ColumnKey::Field {
            path: full_path,
            kind,
        })
    }

    fn column_id_for(&mut self, key: ColumnKey) -> u32 {
        if let Some(&id) = self.column_ids.get(&key) {
            return id;
        }
        let id = self.num_columns;
        self.num_columns += 1;
        self.column_ids.insert(key, id);
        id
    }

    fn intern_structure(&mut self, specs: Vec<NodeSpec>) -> u32 {
        if let Some(&id) = self.structure_ids.get(&specs) {
            return id;
        }
        let id = self.structures.len() as u32;
        self.structure_ids.insert(specs.clone(), id);
        self.structures.push(specs);
        id
    }

    fn compress_chain(&self, chain: Chain) -> Result<Chain> {
        let mut compressor =
            Compressor::with_size_hint(self.options, chain.size() as u64);
        compressor.writer().write_chain(chain)?;
        let mut writer = ChainWriter::new();
        compressor.encode_and_close(&mut writer)?;
        writer.into_chain()
    }

    fn write_node(writer: &mut ChainWriter, spec: &NodeSpec, next: u32) -> Result<()> {
        let (code, tag_data, buffer, fixed_len) = match spec {
            NodeSpec::CopyTag { tag_data } => (CallbackCode::CopyTag, *tag_data, None, None),
            NodeSpec::CopyTagAndVarint { tag_data, column } => {
                (CallbackCode::CopyTagAndVarint, *tag_data, Some(*column), None)
            }
            NodeSpec::CopyTagAndBytes {
                tag_data,
                column,
                len,
            } => (
                CallbackCode::CopyTagAndBytes,
                *tag_data,
                Some(*column),
                Some(*len),
            ),
            NodeSpec::CopyTagAndLengthDelimited { tag_data, column } => (
                CallbackCode::CopyTagAndLengthDelimited,
                *tag_data,
                Some(*column),
                None,
            ),
            NodeSpec::StartSubmessage { tag_data } => {
                (CallbackCode::StartSubmessage, *tag_data, None, None)
            }
            NodeSpec::EndSubmessage => {
                (CallbackCode::EndSubmessage, TagData::empty(), None, None)
            }
            NodeSpec::NonProtoRecord { column } => (
                CallbackCode::NonProtoRecord,
                TagData::empty(),
                Some(*column),
                None,
            ),
            NodeSpec::EndOfRecord => (CallbackCode::EndOfRecord, TagData::empty(), None, None),
        };
        writer.write_byte(code as u8)?;
        writer.write_byte(tag_data.as_slice().len() as u8)?;
        writer.write(tag_data.as_slice())?;
        if let Some(buffer) = buffer {
            writer.write_varint32(buffer)?;
        }
        if let Some(len) = fixed_len {
            writer.write_varint32(len)?;
        }
        if code != CallbackCode::EndOfRecord {
            writer.write_varint32(next)?;
        }
        Ok(())
    }
}

impl Object for TransposeEncoder {
    fn state(&self) -> &ObjectState {
        &self.state
    }

    fn done(&mut self) {
        self.records.clear();
        self.structures.clear();
        self.structure_ids.clear();
        self.column_ids.clear();
    }
}

impl ChunkEncoder for TransposeEncoder {
    fn add_record(&mut self, record: &[u8]) -> Result<()> {
        self.ingest(Bytes::copy_from_slice(record))
    }

    fn add_record_chain(&mut self, record: &Chain) -> Result<()> {
        self.ingest(record.to_bytes())
    }

    fn num_records(&self) -> u64 {
        self.num_records
    }

    fn encode_and_close(&mut self, dest: &mut dyn Writer) -> Result<(u64, u64)> {
        self.state.check_healthy()?;
        let num_records = self.num_records;
        let decoded_data_size = self.decoded_data_size;

        // Node indices: structures laid out back to back, each a linear chain.
        let mut structure_base = Vec::with_capacity(self.structures.len());
        let mut total_nodes: u32 = 0;
        for structure in &self.structures {
            structure_base.push(total_nodes);
            total_nodes = match total_nodes.checked_add(structure.len() as u32) {
                Some(total) => total,
                None => return self.state.fail("too many state machine nodes"),
            };
        }

        // Column buffers and transitions are consumed by the decoder in
        // reverse record order.
        let mut buffers: Vec<Chain> = (0..self.num_columns).map(|_| Chain::new()).collect();
        let mut transitions = Compressor::new(self.options);
        for record in self.records.iter().rev() {
            for payload in &record.payloads {
                let buffer = &mut buffers[payload.column as usize];
                if payload.length_prefixed {
                    let mut prefix = [0u8; varint::MAX_LEN_U64];
                    let len = varint::encode_u64(payload.bytes.len() as u64, &mut prefix);
                    buffer.append_slice(&prefix[..len]);
                }
                buffer.append_bytes(payload.bytes.clone());
            }
            let start = structure_base[record.structure as usize];
            self.state.track(transitions.writer().write_varint32(start))?;
        }
        let mut transitions_writer = ChainWriter::new();
        self.state
            .track(transitions.encode_and_close(&mut transitions_writer))?;
        let transitions_chain = self.state.track(transitions_writer.into_chain())?;

        // Greedy bucketing in buffer order: close a bucket once it holds at
        // least bucket_size decoded bytes.
        let mut bucket_of_buffer: Vec<u32> = Vec::with_capacity(buffers.len());
        let mut buffer_sizes: Vec<u64> = Vec::with_capacity(buffers.len());
        let mut bucket_chains: Vec<Chain> = Vec::new();
        let mut current = Chain::new();
        for buffer in buffers {
            buffer_sizes.push(buffer.size() as u64);
            bucket_of_buffer.push(bucket_chains.len() as u32);
            current.append_chain(buffer);
            if current.size() >= self.bucket_size {
                bucket_chains.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            bucket_chains.push(current);
        }
        let mut compressed_buckets = Vec::with_capacity(bucket_chains.len());
        for bucket in bucket_chains {
            let compressed = self.compress_chain(bucket);
            compressed_buckets.push(self.state.track(compressed)?);
        }

        // Header.
        let mut header = Compressor::new(self.options);
        let result = (|| -> Result<()> {
            let writer = header.writer();
            writer.write_varint64(transitions_chain.size() as u64)?;
            writer.write_varint32(compressed_buckets.len() as u32)?;
            for bucket in &compressed_buckets {
                writer.write_varint64(bucket.size() as u64)?;
            }
            writer.write_varint32(bucket_of_buffer.len() as u32)?;
            for &bucket in &bucket_of_buffer {
                writer.write_varint32(bucket)?;
            }
            for &size in &buffer_sizes {
                writer.write_varint64(size)?;
            }
            writer.write_varint32(total_nodes)?;
            for (structure, &base) in self.structures.iter().zip(&structure_base) {
                for (offset, spec) in structure.iter().enumerate() {
                    Self::write_node(writer, spec, base + offset as u32 + 1)?;
                }
            }
            Ok(())
        })();
        self.state.track(result)?;
        let mut header_writer = ChainWriter::new();
        self.state.track(header.encode_and_close(&mut header_writer))?;
        let header_chain = self.state.track(header_writer.into_chain())?;

        // Assemble the chunk data.
        self.state
            .track(dest.write_byte(self.options.compression_type() as u8))?;
        self.state
            .track(dest.write_varint64(header_chain.size() as u64))?;
        self.state.track(dest.write_chain(header_chain))?;
        self.state.track(dest.write_chain(transitions_chain))?;
        let num_buckets = compressed_buckets.len();
        for bucket in compressed_buckets {
            self.state.track(dest.write_chain(bucket))?;
        }

        debug!(
            num_records,
            decoded_data_size,
            num_buffers = bucket_of_buffer.len(),
            num_buckets,
            num_nodes = total_nodes,
            "encoded transpose chunk"
        );
        self.close();
        Ok((num_records, decoded_data_size))
    }

    fn chunk_type(&self) -> ChunkType {
        ChunkType::Transpose
    }
}
