pub mod chunk_codec;
pub mod compressor;
pub mod field_filter;
pub mod simple;
pub mod transpose;

pub use chunk_codec::{ChunkDecoder, ChunkDecoderOptions, ChunkEncoder};
pub use compressor::{decompress, CompressionType, Compressor, CompressorOptions};
pub use field_filter::FieldFilter;
pub use simple::{SimpleDecoder, SimpleEncoder};
pub use transpose::{TransposeDecoder, TransposeEncoder, DEFAULT_BUCKET_SIZE};
