//! The transpose decoder: a non-recursive virtual machine that replays the
//! chunk's state machine, reassembling records back to front into a
//! [`ChainBackwardWriter`].
//!
//! Untrusted input discipline: every table index is bounds-checked at parse
//! time, the node graph is rejected if it contains a cycle of non-consuming
//! nodes, and the replay loop independently aborts if it ever takes more
//! consecutive non-consuming steps than there are nodes (a cycle can become
//! non-consuming only under filtering, which the static check cannot see).

use anyhow::{anyhow, bail, Result};
use rcf_core::backward_writer::ChainBackwardWriter;
use rcf_core::object::{Object, ObjectState};
use rcf_core::reader::{ChainReader, Reader};
use rcf_core::Chain;
use tracing::debug;

use crate::compressor::{decompress, CompressionType};
use crate::field_filter::FieldFilter;
use crate::transpose::internal::{CallbackCode, TagData};

/// Parsed state machine node.
#[derive(Clone, Copy)]
struct Node {
    callback: CallbackCode,
    tag_data: TagData,
    /// Field number from the tag data; 0 when the node carries no tag.
    field: u32,
    buffer: u32,
    fixed_len: u32,
    next: u32,
}

struct Bucket {
    /// Compressed bytes, present until the bucket is decompressed.
    compressed: Option<Chain>,
    /// Global indices of the buffers stored in this bucket, in order.
    members: Vec<u32>,
}

struct BufferSlot {
    bucket: u32,
    decoded_len: u64,
    reader: Option<ChainReader>,
}

struct Context {
    compression_type: CompressionType,
    nodes: Vec<Node>,
    buckets: Vec<Bucket>,
    buffers: Vec<BufferSlot>,
    transitions: ChainReader,
    filtering: bool,
}

struct StackEntry {
    /// `dest.pos()` when the submessage body started (its end in the output).
    end_pos: u64,
    tag_data: TagData,
    /// Entered only as an ancestor of included fields; drop it if the body
    /// filters down to nothing.
    elide_if_empty: bool,
}

/// Decodes transpose chunks.
pub struct TransposeDecoder {
    state: ObjectState,
}

impl Default for TransposeDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl TransposeDecoder {
    pub fn new() -> Self {
        TransposeDecoder {
            state: ObjectState::open(),
        }
    }

    /// Decodes chunk data from `src`, writing concatenated record values to
    /// `dest` and the sorted record end positions to `limits`.
    ///
    /// Precondition: `dest.pos() == 0`.
    pub fn decode(
        &mut self,
        src: &mut ChainReader,
        num_records: u64,
        decoded_data_size: u64,
        field_filter: &FieldFilter,
        dest: &mut ChainBackwardWriter,
        limits: &mut Vec<u64>,
    ) -> Result<()> {
        debug_assert_eq!(dest.pos(), 0, "destination must start at position 0");
        self.state.check_healthy()?;
        limits.clear();

        let mut context = self
            .state
            .track(parse(src, field_filter.include_all()))?;
        let mut rev_limits = Vec::with_capacity(num_records.min(4096) as usize);
        self.state.track(decode_records(
            &mut context,
            num_records,
            decoded_data_size,
            field_filter,
            dest,
            &mut rev_limits,
        ))?;

        // Records were replayed last to first; rectify the collected end
        // positions into forward record end offsets.
        let total = rev_limits.last().copied().unwrap_or(0);
        limits.reserve(rev_limits.len());
        for i in 0..rev_limits.len() {
            if i + 1 < rev_limits.len() {
                limits.push(total - rev_limits[rev_limits.len() - 2 - i]);
            } else {
                limits.push(total);
            }
        }
        debug!(
            num_records,
            decoded_data_size,
            filtering = context.filtering,
            "decoded transpose chunk"
        );
        Ok(())
    }
}

impl Object for TransposeDecoder {
    fn state(&self) -> &ObjectState {
        &self.state
    }

    fn done(&mut self) {}
}

// ── Header parsing ─────────────────────────────────────────────────────────

fn parse(src: &mut ChainReader, include_all: bool) -> Result<Context> {
    let compression_type = CompressionType::try_from(src.read_byte()?)?;
    let header_len = checked_len(src.read_varint64()?, "transpose header")?;
    let header = decompress(src.read_chain(header_len)?, compression_type)?;
    let mut header_reader = ChainReader::new(header);

    let transitions_len = checked_len(header_reader.read_varint64()?, "transitions stream")?;
    // Each table entry occupies at least one header byte, which bounds the
    // counts an honest header can carry.
    let table_count = |count: u32, reader: &ChainReader, what: &str| -> Result<usize> {
        if u64::from(count) > reader.remaining() {
            bail!("{} count {} exceeds header size", what, count);
        }
        Ok(count as usize)
    };
    let num_buckets = header_reader.read_varint32()?;
    let num_buckets = table_count(num_buckets, &header_reader, "bucket")?;
    let mut bucket_lens = Vec::with_capacity(num_buckets);
    for _ in 0..num_buckets {
        bucket_lens.push(checked_len(header_reader.read_varint64()?, "bucket")?);
    }

    let num_buffers = header_reader.read_varint32()?;
    let num_buffers = table_count(num_buffers, &header_reader, "buffer")?;
    let mut members: Vec<Vec<u32>> = vec![Vec::new(); num_buckets];
    let mut buffers = Vec::with_capacity(num_buffers.min(4096));
    let mut previous_bucket: u32 = 0;
    for index in 0..num_buffers {
        let bucket = header_reader.read_varint32()?;
        if (bucket as usize) >= num_buckets {
            bail!("buffer bucket index {} out of range", bucket);
        }
        if bucket < previous_bucket {
            bail!("buffer bucket indices not sorted");
        }
        previous_bucket = bucket;
        members[bucket as usize].push(index as u32);
        buffers.push(BufferSlot {
            bucket,
            decoded_len: 0,
            reader: None,
        });
    }
    for slot in buffers.iter_mut() {
        slot.decoded_len = header_reader.read_varint64()?;
    }

    let num_nodes = header_reader.read_varint32()?;
    let num_nodes = table_count(num_nodes, &header_reader, "node")?;
    let mut nodes = Vec::with_capacity(num_nodes);
    for _ in 0..num_nodes {
        nodes.push(parse_node(
            &mut header_reader,
            num_buffers as u32,
            num_nodes as u32,
        )?);
    }
    if !header_reader.at_end() {
        bail!("trailing bytes in transpose header");
    }

    check_no_implicit_loop(&nodes)?;

    let transitions_chain = src.read_chain(transitions_len)?;
    let transitions = ChainReader::new(decompress(transitions_chain, compression_type)?);

    let mut buckets = Vec::with_capacity(num_buckets);
    for (len, members) in bucket_lens.into_iter().zip(members) {
        buckets.push(Bucket {
            compressed: Some(src.read_chain(len)?),
            members,
        });
    }
    if !src.at_end() {
        bail!("trailing data after transpose buckets");
    }

    let mut context = Context {
        compression_type,
        nodes,
        buckets,
        buffers,
        transitions,
        filtering: !include_all,
    };
    if include_all {
        // Without filtering every bucket is needed; decompress eagerly.
        for bucket in 0..context.buckets.len() {
            context.decompress_bucket(bucket)?;
        }
    }
    Ok(context)
}

fn parse_node(reader: &mut ChainReader, num_buffers: u32, num_nodes: u32) -> Result<Node> {
    let callback = CallbackCode::try_from(reader.read_byte()?)?;
    let tag_len = reader.read_byte()? as usize;
    if tag_len > 6 {
        bail!("tag data longer than 6 bytes");
    }
    let mut tag_bytes = [0u8; 6];
    reader.read(&mut tag_bytes[..tag_len])?;
    let tag_data = TagData::from_slice(&tag_bytes[..tag_len])?;
    let field = if tag_data.is_empty() {
        0
    } else {
        tag_data.field()?
    };

    let buffer = if callback.consumes_input() {
        let buffer = reader.read_varint32()?;
        if buffer >= num_buffers {
            bail!("buffer index {} out of range", buffer);
        }
        buffer
    } else {
        0
    };
    let fixed_len = if callback == CallbackCode::CopyTagAndBytes {
        reader.read_varint32()?
    } else {
        0
    };
    let next = if callback != CallbackCode::EndOfRecord {
        let next = reader.read_varint32()?;
        if next >= num_nodes {
            bail!("next node index {} out of range", next);
        }
        next
    } else {
        0
    };
    Ok(Node {
        callback,
        tag_data,
        field,
        buffer,
        fixed_len,
        next,
    })
}

/// Rejects node graphs with a cycle among nodes that consume no buffer
/// input; such a cycle would let one record produce unbounded output.
fn check_no_implicit_loop(nodes: &[Node]) -> Result<()> {
    const WHITE: u8 = 0;
    const GRAY: u8 = 1;
    const BLACK: u8 = 2;
    let structural = |node: &Node| {
        !node.callback.consumes_input() && node.callback != CallbackCode::EndOfRecord
    };
    let mut color = vec![WHITE; nodes.len()];
    for start in 0..nodes.len() {
        if color[start] != WHITE || !structural(&nodes[start]) {
            continue;
        }
        // Out-degree is one, so each walk is a simple path until it leaves
        // the structural subgraph or closes a cycle.
        let mut trail = Vec::new();
        let mut current = start;
        loop {
            if !structural(&nodes[current]) || color[current] == BLACK {
                break;
            }
            if color[current] == GRAY {
                bail!("implicit loop in record state machine");
            }
            color[current] = GRAY;
            trail.push(current);
            current = nodes[current].next as usize;
        }
        for index in trail {
            color[index] = BLACK;
        }
    }
    Ok(())
}

fn checked_len(len: u64, what: &str) -> Result<usize> {
    usize::try_from(len).map_err(|_| anyhow!("{} length {} too large", what, len))
}

// ── Replay ─────────────────────────────────────────────────────────────────

impl Context {
    fn decompress_bucket(&mut self, bucket_index: usize) -> Result<()> {
        let compression_type = self.compression_type;
        let bucket = &mut self.buckets[bucket_index];
        let Some(compressed) = bucket.compressed.take() else {
            return Ok(());
        };
        let decoded = decompress(compressed, compression_type)?;
        let mut offset = 0usize;
        for &member in &bucket.members {
            let slot = &mut self.buffers[member as usize];
            let len = checked_len(slot.decoded_len, "buffer")?;
            if offset + len > decoded.size() {
                bail!(
                    "bucket {} too short for its buffers: {} < {}",
                    bucket_index,
                    decoded.size(),
                    offset + len
                );
            }
            slot.reader = Some(ChainReader::new(decoded.range(offset, len)));
            offset += len;
        }
        if offset != decoded.size() {
            bail!(
                "bucket {} size mismatch: buffers cover {} of {} bytes",
                bucket_index,
                offset,
                decoded.size()
            );
        }
        Ok(())
    }

    /// On-demand accessor used under filtering; decompresses the containing
    /// bucket on first touch.
    fn buffer_reader(&mut self, index: u32) -> Result<&mut ChainReader> {
        let bucket = self.buffers[index as usize].bucket as usize;
        if self.buffers[index as usize].reader.is_none() {
            self.decompress_bucket(bucket)?;
        }
        self.buffers[index as usize]
            .reader
            .as_mut()
            .ok_or_else(|| anyhow!("buffer {} missing from its bucket", index))
    }
}

fn decode_records(
    context: &mut Context,
    num_records: u64,
    decoded_data_size: u64,
    filter: &FieldFilter,
    dest: &mut ChainBackwardWriter,
    rev_limits: &mut Vec<u64>,
) -> Result<()> {
    let num_nodes = context.nodes.len() as u64;
    let mut stack: Vec<StackEntry> = Vec::new();
    let mut path: Vec<u32> = Vec::new();

    for _ in 0..num_records {
        let start = context.transitions.read_varint32()?;
        if u64::from(start) >= num_nodes {
            bail!("state machine start node {} out of range", start);
        }
        stack.clear();
        path.clear();
        let mut skipped_level: u32 = 0;
        let mut node_index = start;
        let mut idle_steps: u64 = 0;
        loop {
            let node = context.nodes[node_index as usize];
            let mut consumed = false;
            match node.callback {
                CallbackCode::CopyTag => {
                    if skipped_level == 0 && field_included(context, filter, &mut path, node.field)
                    {
                        dest.write(node.tag_data.as_slice())?;
                    }
                }
                CallbackCode::CopyTagAndVarint => {
                    if skipped_level == 0 && field_included(context, filter, &mut path, node.field)
                    {
                        let reader = context.buffer_reader(node.buffer)?;
                        let (bytes, len, _) = read_varint_verbatim(reader)?;
                        dest.write(&bytes[..len])?;
                        dest.write(node.tag_data.as_slice())?;
                        consumed = true;
                    }
                }
                CallbackCode::CopyTagAndBytes => {
                    if skipped_level == 0 && field_included(context, filter, &mut path, node.field)
                    {
                        let reader = context.buffer_reader(node.buffer)?;
                        let value = reader.read_chain(node.fixed_len as usize)?;
                        dest.write_chain(value)?;
                        dest.write(node.tag_data.as_slice())?;
                        consumed = true;
                    }
                }
                CallbackCode::CopyTagAndLengthDelimited => {
                    if skipped_level == 0 && field_included(context, filter, &mut path, node.field)
                    {
                        let reader = context.buffer_reader(node.buffer)?;
                        let (len_bytes, len_len, payload_len) = read_varint_verbatim(reader)?;
                        let payload = reader.read_chain(checked_len(payload_len, "field value")?)?;
                        dest.write_chain(payload)?;
                        dest.write(&len_bytes[..len_len])?;
                        dest.write(node.tag_data.as_slice())?;
                        consumed = true;
                    }
                }
                CallbackCode::StartSubmessage => {
                    if skipped_level > 0 {
                        skipped_level += 1;
                    } else {
                        path.push(node.field);
                        if context.filtering && !filter.enters(&path) {
                            path.pop();
                            skipped_level = 1;
                        } else {
                            let elide_if_empty =
                                context.filtering && !filter.includes(&path);
                            stack.push(StackEntry {
                                end_pos: dest.pos(),
                                tag_data: node.tag_data,
                                elide_if_empty,
                            });
                        }
                    }
                }
                CallbackCode::EndSubmessage => {
                    if skipped_level > 0 {
                        skipped_level -= 1;
                    } else {
                        let Some(entry) = stack.pop() else {
                            bail!("unbalanced submessage in state machine");
                        };
                        path.pop();
                        let body_len = dest.pos() - entry.end_pos;
                        if body_len != 0 || !entry.elide_if_empty {
                            dest.write_varint64(body_len)?;
                            dest.write(entry.tag_data.as_slice())?;
                        }
                    }
                }
                CallbackCode::NonProtoRecord => {
                    let reader = context.buffer_reader(node.buffer)?;
                    let (_, _, record_len) = read_varint_verbatim(reader)?;
                    let record = reader.read_chain(checked_len(record_len, "record")?)?;
                    dest.write_chain(record)?;
                    consumed = true;
                }
                CallbackCode::EndOfRecord => {
                    if !stack.is_empty() || skipped_level != 0 {
                        bail!("unbalanced submessage at end of record");
                    }
                    break;
                }
            }
            if consumed {
                idle_steps = 0;
            } else {
                idle_steps += 1;
                if idle_steps > num_nodes {
                    bail!("implicit loop in record state machine");
                }
            }
            node_index = node.next;
        }
        rev_limits.push(dest.pos());
        if !context.filtering && dest.pos() > decoded_data_size {
            bail!(
                "decoded data size exceeded: {} > {}",
                dest.pos(),
                decoded_data_size
            );
        }
    }

    if !context.transitions.at_end() {
        bail!("trailing transitions data");
    }
    if !context.filtering {
        if dest.pos() != decoded_data_size {
            bail!(
                "decoded data size mismatch: expected {}, got {}",
                decoded_data_size,
                dest.pos()
            );
        }
        for (index, slot) in context.buffers.iter().enumerate() {
            let consumed = slot.reader.as_ref().is_some_and(|r| r.at_end());
            if !consumed {
                bail!("buffer {} not fully consumed", index);
            }
        }
    }
    Ok(())
}

/// Filter check for a leaf field at the current path. Always true without
/// filtering or inside an included subtree.
fn field_included(
    context: &Context,
    filter: &FieldFilter,
    path: &mut Vec<u32>,
    field: u32,
) -> bool {
    if !context.filtering {
        return true;
    }
    path.push(field);
    let included = filter.includes(path);
    path.pop();
    included
}

/// Reads one varint from a buffer, preserving its exact bytes.
fn read_varint_verbatim(reader: &mut ChainReader) -> Result<([u8; 10], usize, u64)> {
    let mut bytes = [0u8; 10];
    let mut value: u64 = 0;
    for i in 0..10 {
        let byte = reader.read_byte()?;
        bytes[i] = byte;
        if i == 9 && byte > 1 {
            bail!("varint overflows 64 bits");
        }
        value |= u64::from(byte & 0x7F) << (7 * i as u32);
        if byte & 0x80 == 0 {
            return Ok((bytes, i + 1, value));
        }
    }
    bail!("varint longer than 10 bytes")
}
