//! Block compression behind a single writer interface.
//!
//! A [`Compressor`] accumulates uncompressed bytes through an ordinary
//! [`ChainWriter`] and emits the compressed stream on
//! [`Compressor::encode_and_close`]. Streams compressed with anything other
//! than [`CompressionType::None`] are prefixed with a varint of the decoded
//! size, so decompressors can pre-size their output and validate it.

use std::io::{Read as _, Write as _};

use anyhow::{bail, Context as _, Result};
use rcf_core::object::{Object, ObjectState};
use rcf_core::reader::{ChainReader, IoReader, Reader};
use rcf_core::writer::{ChainWriter, Writer};
use rcf_core::Chain;

// ── Compression types ──────────────────────────────────────────────────────

/// On-the-wire compression tag. The byte values are part of the chunk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Brotli = 1,
    Zstd = 2,
}

impl TryFrom<u8> for CompressionType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Brotli),
            2 => Ok(CompressionType::Zstd),
            _ => bail!("unsupported compression type {}", value),
        }
    }
}

// ── Option bounds ──────────────────────────────────────────────────────────

pub const MIN_BROTLI: i32 = 0;
pub const MAX_BROTLI: i32 = 11;
pub const DEFAULT_BROTLI: i32 = 9;

pub const MIN_ZSTD: i32 = 1;
pub const MAX_ZSTD: i32 = 22;
pub const DEFAULT_ZSTD: i32 = 9;

pub const MIN_WINDOW_LOG: i32 = 10;
/// Ceiling across algorithms; brotli itself tops out at
/// [`MAX_BROTLI_WINDOW_LOG`].
pub const MAX_WINDOW_LOG: i32 = 31;
pub const MAX_BROTLI_WINDOW_LOG: i32 = 24;
/// Brotli window used under `window_log: auto`.
const DEFAULT_BROTLI_WINDOW_LOG: i32 = 22;
/// Sentinel: keep the algorithm's own default window.
pub const WINDOW_LOG_AUTO: i32 = -1;

// ── Options ────────────────────────────────────────────────────────────────

/// Compression algorithm, level and window size.
///
/// Default: Brotli at level 9 with an automatic window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressorOptions {
    compression_type: CompressionType,
    level: i32,
    window_log: i32,
}

impl Default for CompressorOptions {
    fn default() -> Self {
        CompressorOptions {
            compression_type: CompressionType::Brotli,
            level: DEFAULT_BROTLI,
            window_log: WINDOW_LOG_AUTO,
        }
    }
}

impl CompressorOptions {
    /// Parses options from text:
    ///
    /// ```text
    ///   options ::= option? ("," option?)*
    ///   option ::=
    ///     "uncompressed" |
    ///     "brotli" (":" brotli_level)? |
    ///     "zstd" (":" zstd_level)? |
    ///     "window_log" ":" window_log
    ///   brotli_level ::= integer 0..11 (default 9)
    ///   zstd_level ::= integer 1..22 (default 9)
    ///   window_log ::= "auto" or integer 10..31
    /// ```
    pub fn parse(text: &str) -> Result<Self> {
        let mut options = CompressorOptions::default();
        for option in text.split(',') {
            if option.is_empty() {
                continue;
            }
            let (key, value) = match option.split_once(':') {
                Some((key, value)) => (key, Some(value)),
                None => (option, None),
            };
            match key {
                "uncompressed" => {
                    if value.is_some() {
                        bail!("option uncompressed does not take a value");
                    }
                    options.set_uncompressed();
                }
                "brotli" => {
                    let level = match value {
                        Some(text) => parse_int("brotli", text, MIN_BROTLI, MAX_BROTLI)?,
                        None => DEFAULT_BROTLI,
                    };
                    options.set_brotli(level);
                }
                "zstd" => {
                    let level = match value {
                        Some(text) => parse_int("zstd", text, MIN_ZSTD, MAX_ZSTD)?,
                        None => DEFAULT_ZSTD,
                    };
                    options.set_zstd(level);
                }
                "window_log" => {
                    let Some(text) = value else {
                        bail!("option window_log requires a value");
                    };
                    if text == "auto" {
                        options.set_window_log(WINDOW_LOG_AUTO);
                    } else {
                        options.set_window_log(parse_int(
                            "window_log",
                            text,
                            MIN_WINDOW_LOG,
                            MAX_WINDOW_LOG,
                        )?);
                    }
                }
                _ => bail!("unknown compressor option {:?}", option),
            }
        }
        Ok(options)
    }

    pub fn set_uncompressed(&mut self) -> &mut Self {
        self.compression_type = CompressionType::None;
        self.level = 0;
        self
    }

    /// Precondition: `level` within 0..=11.
    pub fn set_brotli(&mut self, level: i32) -> &mut Self {
        debug_assert!(
            (MIN_BROTLI..=MAX_BROTLI).contains(&level),
            "brotli compression level out of range"
        );
        self.compression_type = CompressionType::Brotli;
        self.level = level;
        self
    }

    /// Precondition: `level` within 1..=22.
    pub fn set_zstd(&mut self, level: i32) -> &mut Self {
        debug_assert!(
            (MIN_ZSTD..=MAX_ZSTD).contains(&level),
            "zstd compression level out of range"
        );
        self.compression_type = CompressionType::Zstd;
        self.level = level;
        self
    }

    /// Precondition: `window_log` is [`WINDOW_LOG_AUTO`] or within 10..=31.
    pub fn set_window_log(&mut self, window_log: i32) -> &mut Self {
        debug_assert!(
            window_log == WINDOW_LOG_AUTO
                || (MIN_WINDOW_LOG..=MAX_WINDOW_LOG).contains(&window_log),
            "window log out of range"
        );
        self.window_log = window_log;
        self
    }

    pub fn compression_type(&self) -> CompressionType {
        self.compression_type
    }

    pub fn compression_level(&self) -> i32 {
        self.level
    }

    pub fn window_log(&self) -> i32 {
        self.window_log
    }
}

fn parse_int(option: &str, text: &str, min: i32, max: i32) -> Result<i32> {
    let value: i32 = text
        .parse()
        .with_context(|| format!("option {option} requires an integer, got {text:?}"))?;
    if !(min..=max).contains(&value) {
        bail!("option {option}: {value} is out of range {min}..={max}");
    }
    Ok(value)
}

// ── Compressor ─────────────────────────────────────────────────────────────

/// Accumulates an uncompressed stream and compresses it on close.
pub struct Compressor {
    state: ObjectState,
    options: CompressorOptions,
    size_hint: u64,
    writer: ChainWriter,
}

impl Compressor {
    pub fn new(options: CompressorOptions) -> Self {
        Compressor::with_size_hint(options, 0)
    }

    /// `size_hint` is the expected total uncompressed size; zstd uses it as
    /// the pledged source size when it turns out exact.
    pub fn with_size_hint(options: CompressorOptions, size_hint: u64) -> Self {
        Compressor {
            state: ObjectState::open(),
            options,
            size_hint,
            writer: ChainWriter::new(),
        }
    }

    /// The stream collecting uncompressed bytes.
    pub fn writer(&mut self) -> &mut ChainWriter {
        &mut self.writer
    }

    /// Returns to an empty healthy compressor.
    pub fn reset(&mut self) {
        self.state.reset();
        self.writer.reset();
    }

    /// Compresses the accumulated bytes into `dest` and closes the
    /// compressor.
    pub fn encode_and_close(&mut self, dest: &mut dyn Writer) -> Result<()> {
        self.state.check_healthy()?;
        let uncompressed = match std::mem::take(&mut self.writer).into_chain() {
            Ok(chain) => chain,
            Err(e) => return self.state.fail(format!("compressor buffer: {e}")),
        };
        let decoded_size = uncompressed.size() as u64;

        let result = match self.options.compression_type {
            CompressionType::None => dest.write_chain(uncompressed),
            CompressionType::Brotli => {
                match brotli_compress(&uncompressed, &self.options) {
                    Ok(compressed) => dest
                        .write_varint64(decoded_size)
                        .and_then(|()| dest.write(&compressed)),
                    Err(e) => Err(e),
                }
            }
            CompressionType::Zstd => {
                match zstd_compress(&uncompressed, &self.options, self.size_hint) {
                    Ok(compressed) => dest
                        .write_varint64(decoded_size)
                        .and_then(|()| dest.write(&compressed)),
                    Err(e) => Err(e),
                }
            }
        };
        if let Err(e) = result {
            return self.state.fail(e.to_string());
        }
        self.close();
        Ok(())
    }
}

impl Object for Compressor {
    fn state(&self) -> &ObjectState {
        &self.state
    }

    fn done(&mut self) {
        let _ = self.writer.close();
    }
}

fn brotli_compress(src: &Chain, options: &CompressorOptions) -> Result<Vec<u8>> {
    let window_log = match options.window_log {
        WINDOW_LOG_AUTO => DEFAULT_BROTLI_WINDOW_LOG,
        w if w <= MAX_BROTLI_WINDOW_LOG => w,
        w => bail!("window_log {w} is out of range {MIN_WINDOW_LOG}..={MAX_BROTLI_WINDOW_LOG} for brotli"),
    };
    let mut out = Vec::new();
    {
        let mut encoder = brotli::CompressorWriter::new(
            &mut out,
            4096,
            options.level as u32,
            window_log as u32,
        );
        for block in src.blocks() {
            encoder
                .write_all(block)
                .context("brotli compression failed")?;
        }
        encoder.flush().context("brotli compression failed")?;
    }
    Ok(out)
}

fn zstd_compress(src: &Chain, options: &CompressorOptions, size_hint: u64) -> Result<Vec<u8>> {
    let mut encoder = zstd::stream::write::Encoder::new(Vec::new(), options.level)
        .context("zstd encoder init failed")?;
    let window_log = if options.window_log != WINDOW_LOG_AUTO {
        Some(options.window_log as u32)
    } else if size_hint > 0 {
        // Auto: size the window to the expected input, capped well below the
        // format maximum so small chunks stay cheap to decode.
        let needed = u64::BITS - (size_hint - 1).leading_zeros();
        Some(needed.clamp(MIN_WINDOW_LOG as u32, 27))
    } else {
        None
    };
    if let Some(window_log) = window_log {
        encoder
            .set_parameter(zstd::stream::raw::CParameter::WindowLog(window_log))
            .context("zstd window_log rejected")?;
    }
    encoder
        .set_pledged_src_size(Some(src.size() as u64))
        .context("zstd pledged size rejected")?;
    for block in src.blocks() {
        encoder.write_all(block).context("zstd compression failed")?;
    }
    encoder.finish().context("zstd compression failed")
}

// ── Decompression ──────────────────────────────────────────────────────────

/// Decompresses one stream produced by [`Compressor::encode_and_close`].
pub fn decompress(compressed: Chain, compression_type: CompressionType) -> Result<Chain> {
    if compression_type == CompressionType::None {
        return Ok(compressed);
    }
    let mut reader = ChainReader::new(compressed);
    let decoded_size = reader
        .read_varint64()
        .context("truncated compressed stream")?;
    let decoded_size_usize = usize::try_from(decoded_size)
        .map_err(|_| anyhow::anyhow!("decoded size too large"))?;

    // Bound the read so a lying size prefix cannot balloon the allocation.
    let mut out = Vec::with_capacity(decoded_size_usize.min(1 << 24));
    let read = match compression_type {
        CompressionType::Brotli => {
            let mut decoder = brotli::Decompressor::new(IoReader(&mut reader), 4096);
            std::io::Read::take(&mut decoder, decoded_size.saturating_add(1))
                .read_to_end(&mut out)
                .context("brotli decompression failed")?
        }
        CompressionType::Zstd => {
            let mut decoder = zstd::stream::read::Decoder::new(IoReader(&mut reader))
                .context("zstd decoder init failed")?;
            decoder
                .window_log_max(MAX_WINDOW_LOG as u32)
                .context("zstd window_log_max rejected")?;
            std::io::Read::take(&mut decoder, decoded_size.saturating_add(1))
                .read_to_end(&mut out)
                .context("zstd decompression failed")?
        }
        CompressionType::None => unreachable!(),
    };
    if read as u64 != decoded_size {
        bail!(
            "decompressed size mismatch: stream declares {} bytes, got {}",
            decoded_size,
            read
        );
    }
    Ok(Chain::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(options: CompressorOptions, payload: &[u8]) {
        let mut compressor = Compressor::with_size_hint(options, payload.len() as u64);
        compressor.writer().write(payload).unwrap();
        let mut dest = ChainWriter::new();
        compressor.encode_and_close(&mut dest).unwrap();
        assert!(compressor.closed());

        let encoded = dest.into_chain().unwrap();
        let decoded = decompress(encoded, options.compression_type()).unwrap();
        assert_eq!(decoded.to_vec(), payload);
    }

    fn compressible(len: usize) -> Vec<u8> {
        let pattern = b"the quick brown fox jumps over the lazy dog. ";
        (0..len).map(|i| pattern[i % pattern.len()]).collect()
    }

    #[test]
    fn roundtrip_uncompressed() {
        let mut options = CompressorOptions::default();
        options.set_uncompressed();
        roundtrip(options, &compressible(10_000));
        roundtrip(options, b"");
    }

    #[test]
    fn roundtrip_brotli() {
        roundtrip(CompressorOptions::default(), &compressible(10_000));
        roundtrip(CompressorOptions::default(), b"");
    }

    #[test]
    fn roundtrip_zstd() {
        let mut options = CompressorOptions::default();
        options.set_zstd(3);
        roundtrip(options, &compressible(10_000));
        roundtrip(options, b"");
    }

    #[test]
    fn roundtrip_with_explicit_window_log() {
        let mut options = CompressorOptions::default();
        options.set_zstd(5).set_window_log(12);
        roundtrip(options, &compressible(50_000));

        let mut options = CompressorOptions::default();
        options.set_brotli(5).set_window_log(12);
        roundtrip(options, &compressible(50_000));
    }

    #[test]
    fn uncompressed_stream_has_no_framing() {
        let mut options = CompressorOptions::default();
        options.set_uncompressed();
        let mut compressor = Compressor::new(options);
        compressor.writer().write(b"abc").unwrap();
        let mut dest = ChainWriter::new();
        compressor.encode_and_close(&mut dest).unwrap();
        assert_eq!(dest.into_chain().unwrap().to_vec(), b"abc");
    }

    #[test]
    fn corrupt_stream_fails_decompression() {
        let mut options = CompressorOptions::default();
        options.set_zstd(3);
        let mut compressor = Compressor::new(options);
        compressor.writer().write(&compressible(5000)).unwrap();
        let mut dest = ChainWriter::new();
        compressor.encode_and_close(&mut dest).unwrap();
        let mut bytes = dest.into_chain().unwrap().to_vec();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        assert!(decompress(Chain::from(bytes), CompressionType::Zstd).is_err());
    }

    #[test]
    fn reset_allows_reuse() {
        let mut compressor = Compressor::new(CompressorOptions::default());
        compressor.writer().write(b"first").unwrap();
        let mut dest = ChainWriter::new();
        compressor.encode_and_close(&mut dest).unwrap();

        compressor.reset();
        assert!(compressor.healthy());
        compressor.writer().write(b"second").unwrap();
        let mut dest = ChainWriter::new();
        compressor.encode_and_close(&mut dest).unwrap();
        let decoded =
            decompress(dest.into_chain().unwrap(), CompressionType::Brotli).unwrap();
        assert_eq!(decoded.to_vec(), b"second");
    }

    // ── option parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_defaults() {
        let options = CompressorOptions::parse("").unwrap();
        assert_eq!(options.compression_type(), CompressionType::Brotli);
        assert_eq!(options.compression_level(), DEFAULT_BROTLI);
        assert_eq!(options.window_log(), WINDOW_LOG_AUTO);
    }

    #[test]
    fn parse_each_algorithm() {
        let options = CompressorOptions::parse("uncompressed").unwrap();
        assert_eq!(options.compression_type(), CompressionType::None);

        let options = CompressorOptions::parse("brotli").unwrap();
        assert_eq!(options.compression_type(), CompressionType::Brotli);
        assert_eq!(options.compression_level(), 9);

        let options = CompressorOptions::parse("brotli:4").unwrap();
        assert_eq!(options.compression_level(), 4);

        let options = CompressorOptions::parse("zstd:15,window_log:20").unwrap();
        assert_eq!(options.compression_type(), CompressionType::Zstd);
        assert_eq!(options.compression_level(), 15);
        assert_eq!(options.window_log(), 20);
    }

    #[test]
    fn parse_window_log_auto_and_empty_options() {
        let options = CompressorOptions::parse("zstd,,window_log:auto,").unwrap();
        assert_eq!(options.compression_type(), CompressionType::Zstd);
        assert_eq!(options.window_log(), WINDOW_LOG_AUTO);
    }

    #[test]
    fn parse_rejects_out_of_range() {
        assert!(CompressorOptions::parse("brotli:12").is_err());
        assert!(CompressorOptions::parse("brotli:-1").is_err());
        assert!(CompressorOptions::parse("zstd:0").is_err());
        assert!(CompressorOptions::parse("zstd:23").is_err());
        assert!(CompressorOptions::parse("window_log:9").is_err());
        assert!(CompressorOptions::parse("window_log:32").is_err());
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(CompressorOptions::parse("lz4").is_err());
        assert!(CompressorOptions::parse("window_log").is_err());
        assert!(CompressorOptions::parse("zstd:fast").is_err());
        assert!(CompressorOptions::parse("uncompressed:1").is_err());
    }

    #[test]
    fn brotli_rejects_oversized_window_at_encode() {
        let mut options = CompressorOptions::default();
        options.set_brotli(5).set_window_log(30);
        let mut compressor = Compressor::new(options);
        compressor.writer().write(b"data").unwrap();
        let mut dest = ChainWriter::new();
        let err = compressor.encode_and_close(&mut dest).unwrap_err();
        assert!(err.to_string().contains("window_log"), "{err}");
        assert!(!compressor.healthy());
    }

    #[test]
    fn unknown_compression_byte_rejected() {
        assert!(CompressionType::try_from(3).is_err());
        assert_eq!(CompressionType::try_from(0).unwrap(), CompressionType::None);
        assert_eq!(
            CompressionType::try_from(1).unwrap(),
            CompressionType::Brotli
        );
        assert_eq!(CompressionType::try_from(2).unwrap(), CompressionType::Zstd);
    }
}
