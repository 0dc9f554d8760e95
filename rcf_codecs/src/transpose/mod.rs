pub mod decoder;
pub mod encoder;
pub(crate) mod internal;

pub use decoder::TransposeDecoder;
pub use encoder::{TransposeEncoder, DEFAULT_BUCKET_SIZE};
