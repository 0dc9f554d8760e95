pub mod backward_writer;
pub mod chain;
pub mod chunk;
pub mod object;
pub mod reader;
pub mod varint;
pub mod writer;

pub use backward_writer::ChainBackwardWriter;
pub use chain::{Chain, MAX_BYTES_TO_COPY};
pub use chunk::{Chunk, ChunkHeader, ChunkType, CHUNK_HEADER_SIZE};
pub use object::{Object, ObjectState};
pub use reader::{ChainReader, IoReader, Reader};
pub use writer::{ChainWriter, Writer};
