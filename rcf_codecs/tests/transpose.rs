//! Transpose codec behavior: protobuf round trips, field projection, and
//! rejection of hostile state machines.

use rcf_codecs::{
    ChunkDecoder, ChunkDecoderOptions, ChunkEncoder, CompressorOptions, FieldFilter,
    TransposeDecoder, TransposeEncoder,
};
use rcf_core::backward_writer::ChainBackwardWriter;
use rcf_core::object::Object;
use rcf_core::reader::ChainReader;
use rcf_core::Chain;

fn uncompressed() -> CompressorOptions {
    CompressorOptions::parse("uncompressed").unwrap()
}

// ── wire builders ──────────────────────────────────────────────────────────

fn uvarint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            return out;
        }
    }
}

fn field_varint(field: u32, value: u64) -> Vec<u8> {
    let mut out = uvarint(u64::from(field << 3));
    out.extend(uvarint(value));
    out
}

fn field_bytes(field: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = uvarint(u64::from((field << 3) | 2));
    out.extend(uvarint(payload.len() as u64));
    out.extend_from_slice(payload);
    out
}

fn field_fixed32(field: u32, value: u32) -> Vec<u8> {
    let mut out = uvarint(u64::from((field << 3) | 5));
    out.extend_from_slice(&value.to_le_bytes());
    out
}

fn field_fixed64(field: u32, value: u64) -> Vec<u8> {
    let mut out = uvarint(u64::from((field << 3) | 1));
    out.extend_from_slice(&value.to_le_bytes());
    out
}

fn encode_records(records: &[Vec<u8>], options: CompressorOptions) -> rcf_core::Chunk {
    let mut encoder = TransposeEncoder::new(options);
    for record in records {
        encoder.add_record(record).unwrap();
    }
    encoder.encode_chunk().unwrap()
}

fn decode_with_filter(chunk: &rcf_core::Chunk, filter: FieldFilter) -> Vec<Vec<u8>> {
    let mut decoder =
        ChunkDecoder::new(ChunkDecoderOptions::new().set_field_filter(filter));
    decoder.reset_chunk(chunk).unwrap();
    let mut records = Vec::new();
    while let Some(record) = decoder.read_record() {
        records.push(record.to_vec());
    }
    assert!(decoder.healthy());
    records
}

// ── round trips ────────────────────────────────────────────────────────────

#[test]
fn assorted_proto_records_roundtrip() {
    let nested = {
        let mut inner = field_varint(1, 42);
        inner.extend(field_bytes(2, b"deep"));
        let mut mid = field_bytes(3, &inner);
        mid.extend(field_fixed32(4, 0xDEAD_BEEF));
        mid
    };
    let records: Vec<Vec<u8>> = vec![
        Vec::new(),
        field_varint(1, 0),
        field_varint(1, 300_000),
        field_fixed64(9, u64::MAX),
        field_bytes(5, b""),
        field_bytes(5, b"hello world"),
        nested.clone(),
        nested,
        [field_varint(1, 1), field_varint(1, 2), field_varint(1, 3)].concat(),
    ];
    for options in [uncompressed(), CompressorOptions::parse("zstd:3").unwrap()] {
        let chunk = encode_records(&records, options);
        assert_eq!(decode_with_filter(&chunk, FieldFilter::all()), records);
    }
}

#[test]
fn non_proto_records_roundtrip_verbatim() {
    let records: Vec<Vec<u8>> = vec![
        b"plain text, not a message".to_vec(),
        vec![0xFF, 0xFE, 0x00, 0x01],
        vec![0x0B], // group wire type is never transposed
        vec![0x08], // truncated varint field
        Vec::new(), // empty parses as a proto, mixing both paths
    ];
    let chunk = encode_records(&records, uncompressed());
    assert_eq!(decode_with_filter(&chunk, FieldFilter::all()), records);
}

#[test]
fn mixed_proto_and_non_proto_with_repeated_structures() {
    let mut records = Vec::new();
    for i in 0..200u64 {
        records.push(field_varint(1, i % 5)); // shared structures, inline values
        if i % 7 == 0 {
            records.push(vec![0xFF; (i % 13) as usize + 1]);
        }
    }
    for options in [uncompressed(), CompressorOptions::parse("brotli:3").unwrap()] {
        let chunk = encode_records(&records, options);
        assert_eq!(decode_with_filter(&chunk, FieldFilter::all()), records);
    }
}

#[test]
fn tiny_buckets_still_roundtrip() {
    // One bucket per buffer.
    let mut encoder =
        TransposeEncoder::with_bucket_size(CompressorOptions::parse("zstd:3").unwrap(), 1);
    let records: Vec<Vec<u8>> = vec![
        [field_varint(1, 1000), field_bytes(2, b"abc")].concat(),
        [field_varint(1, 2000), field_bytes(2, b"defg")].concat(),
        field_fixed32(3, 7),
    ];
    for record in &records {
        encoder.add_record(record).unwrap();
    }
    let chunk = encoder.encode_chunk().unwrap();
    assert_eq!(decode_with_filter(&chunk, FieldFilter::all()), records);
}

#[test]
fn limits_are_sorted_and_sum_to_decoded_size() {
    let records: Vec<Vec<u8>> = vec![
        field_varint(1, 7),
        Vec::new(),
        field_bytes(2, b"abcdef"),
        b"not proto \xFF\xFF".to_vec(),
    ];
    let chunk = encode_records(&records, uncompressed());

    let mut decoder = TransposeDecoder::new();
    let mut src = ChainReader::new(chunk.data.clone());
    let mut dest = ChainBackwardWriter::new();
    let mut limits = Vec::new();
    decoder
        .decode(
            &mut src,
            chunk.header.num_records,
            chunk.header.decoded_data_size,
            &FieldFilter::all(),
            &mut dest,
            &mut limits,
        )
        .unwrap();

    assert!(limits.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(limits.last().copied(), Some(chunk.header.decoded_data_size));
    assert_eq!(limits.len() as u64, chunk.header.num_records);
    assert_eq!(dest.pos(), chunk.header.decoded_data_size);
}

// ── field filtering ────────────────────────────────────────────────────────

#[test]
fn filter_projects_away_sibling_submessage() {
    // { f1: "x", f2: { g1: 42 } } filtered to {f1} must lose f2 entirely.
    let record = [field_bytes(1, b"x"), field_bytes(2, &field_varint(1, 42))].concat();
    let chunk = encode_records(&[record], uncompressed());

    let projected = decode_with_filter(&chunk, FieldFilter::including([vec![1]]));
    assert_eq!(projected, vec![field_bytes(1, b"x")]);
}

#[test]
fn filter_keeps_whole_included_subtree() {
    let submessage = field_bytes(2, &field_varint(1, 42));
    let record = [field_bytes(1, b"x"), submessage.clone()].concat();
    let chunk = encode_records(&[record], uncompressed());

    let projected = decode_with_filter(&chunk, FieldFilter::including([vec![2]]));
    assert_eq!(projected, vec![submessage]);
}

#[test]
fn filter_descends_into_submessages() {
    // f2 = { g1: 42, g3: "keep" }, filter {f2.g3} keeps only g3 inside f2.
    let inner = [field_varint(1, 42), field_bytes(3, b"keep")].concat();
    let record = [field_bytes(1, b"x"), field_bytes(2, &inner)].concat();
    let chunk = encode_records(&[record], uncompressed());

    let projected = decode_with_filter(&chunk, FieldFilter::including([vec![2, 3]]));
    assert_eq!(projected, vec![field_bytes(2, &field_bytes(3, b"keep"))]);
}

#[test]
fn submessage_filtered_to_nothing_is_elided() {
    // filter {f2.g5} matches nothing inside f2, so f2 vanishes including its
    // length prefix.
    let record = [field_bytes(1, b"x"), field_bytes(2, &field_varint(1, 42))].concat();
    let chunk = encode_records(&[record], uncompressed());

    let projected = decode_with_filter(&chunk, FieldFilter::including([vec![2, 5]]));
    assert_eq!(projected, vec![Vec::new()]);
}

#[test]
fn non_proto_records_ignore_the_filter() {
    let records: Vec<Vec<u8>> = vec![b"\xFF raw bytes".to_vec(), field_varint(9, 1)];
    let chunk = encode_records(&records, uncompressed());

    let projected = decode_with_filter(&chunk, FieldFilter::including([vec![1]]));
    assert_eq!(projected[0], records[0]);
    assert_eq!(projected[1], Vec::new());
}

#[test]
fn filtered_decode_skips_untouched_buckets() {
    // Filtering keeps buckets compressed until touched; a filter that only
    // needs inline values must not fail on unconsumed buffers.
    let records: Vec<Vec<u8>> = (0..50)
        .map(|i| [field_varint(1, i % 3), field_bytes(2, b"payload")].concat())
        .collect();
    let chunk = encode_records(&records, CompressorOptions::parse("zstd:3").unwrap());
    let projected = decode_with_filter(&chunk, FieldFilter::including([vec![1]]));
    for (got, i) in projected.iter().zip(0..50) {
        assert_eq!(*got, field_varint(1, i % 3));
    }
}

// ── hostile state machines ─────────────────────────────────────────────────

/// Builds transpose chunk data by hand: uncompressed, no buffers, a given
/// node table, and one start index per record.
fn handcrafted_chunk(nodes: &[Vec<u8>], starts: &[u32]) -> Chain {
    let mut transitions = Vec::new();
    for &start in starts {
        transitions.extend(uvarint(u64::from(start)));
    }
    let mut header = Vec::new();
    header.extend(uvarint(transitions.len() as u64)); // transitions length
    header.extend(uvarint(0)); // num_buckets
    header.extend(uvarint(0)); // num_buffers
    header.extend(uvarint(nodes.len() as u64)); // num_nodes
    for node in nodes {
        header.extend_from_slice(node);
    }

    let mut data = vec![0x00]; // compression type: none
    data.extend(uvarint(header.len() as u64));
    data.extend(header);
    data.extend(transitions);
    Chain::from(data)
}

fn copy_tag_node(tag: u8, next: u32) -> Vec<u8> {
    let mut node = vec![0x00, 0x01, tag]; // CopyTag, 1 tag byte
    node.extend(uvarint(u64::from(next)));
    node
}

fn end_of_record_node() -> Vec<u8> {
    vec![0x07, 0x00] // EndOfRecord, no tag data
}

fn try_decode(data: Chain, num_records: u64) -> (anyhow::Result<()>, u64, Vec<u64>) {
    let mut decoder = TransposeDecoder::new();
    let mut src = ChainReader::new(data);
    let mut dest = ChainBackwardWriter::new();
    let mut limits = Vec::new();
    let result = decoder.decode(
        &mut src,
        num_records,
        1 << 20,
        &FieldFilter::all(),
        &mut dest,
        &mut limits,
    );
    (result, dest.pos(), limits)
}

#[test]
fn structural_cycle_is_rejected_before_decoding() {
    // A CopyTag node pointing at itself: unbounded output per record.
    let data = handcrafted_chunk(&[copy_tag_node(0x08, 0)], &[0]);
    let (result, written, limits) = try_decode(data, 1);
    let err = result.unwrap_err();
    assert!(err.to_string().contains("implicit loop"), "{err}");
    assert_eq!(written, 0, "no record may be emitted");
    assert!(limits.is_empty());
}

#[test]
fn two_node_structural_cycle_is_rejected() {
    let data = handcrafted_chunk(
        &[copy_tag_node(0x08, 1), copy_tag_node(0x10, 0)],
        &[0],
    );
    let (result, written, _) = try_decode(data, 1);
    assert!(result.unwrap_err().to_string().contains("implicit loop"));
    assert_eq!(written, 0);
}

#[test]
fn acyclic_handcrafted_machine_decodes() {
    // CopyTag(0x08 inline? no — bare tag) then EndOfRecord. The output is the
    // tag byte alone, which is fine: the decoder replays, it does not parse.
    let data = handcrafted_chunk(
        &[copy_tag_node(0x08, 1), end_of_record_node()],
        &[0, 0],
    );
    let mut decoder = TransposeDecoder::new();
    let mut src = ChainReader::new(data);
    let mut dest = ChainBackwardWriter::new();
    let mut limits = Vec::new();
    decoder
        .decode(&mut src, 2, 2, &FieldFilter::all(), &mut dest, &mut limits)
        .unwrap();
    assert_eq!(limits, vec![1, 2]);
    assert_eq!(dest.into_chain().unwrap().to_vec(), vec![0x08, 0x08]);
}

#[test]
fn out_of_range_indices_are_rejected() {
    // next index beyond the node table
    let data = handcrafted_chunk(&[copy_tag_node(0x08, 7)], &[0]);
    assert!(try_decode(data, 1).0.is_err());

    // start index beyond the node table
    let data = handcrafted_chunk(
        &[copy_tag_node(0x08, 1), end_of_record_node()],
        &[5],
    );
    assert!(try_decode(data, 1).0.is_err());

    // buffer index with no buffers: NonProtoRecord referencing buffer 0
    let mut non_proto = vec![0x06, 0x00]; // NonProtoRecord, no tag
    non_proto.extend(uvarint(0)); // buffer 0
    non_proto.extend(uvarint(1)); // next
    let data = handcrafted_chunk(&[non_proto, end_of_record_node()], &[0]);
    assert!(try_decode(data, 1).0.is_err());
}

#[test]
fn unbalanced_submessages_are_rejected() {
    // EndSubmessage with nothing on the stack.
    let mut end_sub = vec![0x05, 0x00]; // EndSubmessage, no tag
    end_sub.extend(uvarint(1)); // next
    let data = handcrafted_chunk(&[end_sub, end_of_record_node()], &[0]);
    let (result, _, _) = try_decode(data, 1);
    assert!(result
        .unwrap_err()
        .to_string()
        .contains("unbalanced submessage"));

    // StartSubmessage never closed before EndOfRecord.
    let mut start_sub = vec![0x04, 0x01, 0x12]; // StartSubmessage, tag 0x12
    start_sub.extend(uvarint(1)); // next
    let data = handcrafted_chunk(&[start_sub, end_of_record_node()], &[0]);
    let (result, _, _) = try_decode(data, 1);
    assert!(result
        .unwrap_err()
        .to_string()
        .contains("unbalanced submessage"));
}

#[test]
fn decoder_object_state_tracks_failure() {
    let data = handcrafted_chunk(&[copy_tag_node(0x08, 0)], &[0]);
    let mut decoder = TransposeDecoder::new();
    let mut src = ChainReader::new(data);
    let mut dest = ChainBackwardWriter::new();
    let mut limits = Vec::new();
    let _ = decoder.decode(
        &mut src,
        1,
        10,
        &FieldFilter::all(),
        &mut dest,
        &mut limits,
    );
    assert!(!decoder.healthy());
    assert!(decoder
        .message()
        .is_some_and(|m| m.contains("implicit loop")));
}
