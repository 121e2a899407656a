//! Bitpacked serialization streams.
//!
//! One `Stream` trait with three implementations keeps a message's read,
//! write, and size-measure paths textually identical: the same serialize
//! routine runs against a `WriteStream` when encoding, a `ReadStream` when
//! decoding, and a `MeasureStream` when pre-checking packet budgets. An
//! encoder and decoder that share one routine cannot drift apart.
//!
//! Bits are packed LSB-first into little-endian 32-bit words through a
//! 64-bit scratch register.

use std::sync::OnceLock;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use packmux_core::constants::PROTOCOL_STRING;

/// Errors produced while serializing.
///
/// Any failure leaves the stream in an undefined position; callers discard
/// the stream and the packet it was building or parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StreamError {
    /// A read or write ran past the end of the buffer.
    #[error("stream overflow")]
    Overflow,
    /// A decoded value fell outside its declared range.
    #[error("value out of range")]
    ValueOutOfRange,
    /// Alignment padding bits were nonzero on read.
    #[error("alignment padding was not zero")]
    AlignNotZero,
    /// The serialize-check magic did not match.
    #[error("serialize check mismatch")]
    CheckMismatch,
}

/// The 32-bit magic written by `serialize_check`, derived from the protocol
/// identification string so a version bump fails the check against older
/// builds.
pub fn check_magic() -> u32 {
    static MAGIC: OnceLock<u32> = OnceLock::new();
    *MAGIC.get_or_init(|| crc32fast::hash(PROTOCOL_STRING.as_bytes()))
}

/// Capability shared by the write, read, and measure streams.
///
/// `serialize_bits` takes the value by `&mut` so one call site serves both
/// directions: writing reads the value, reading overwrites it, measuring
/// ignores it.
pub trait Stream {
    /// True when deserializing from received bytes.
    fn is_reading(&self) -> bool;
    /// True when producing bytes or measuring how many would be produced.
    fn is_writing(&self) -> bool;
    /// Serializes the low `bits` (1..=32) of `value`.
    fn serialize_bits(&mut self, value: &mut u32, bits: u32) -> Result<(), StreamError>;
    /// Inserts up to 7 zero bits so the stream lands on a byte boundary.
    fn serialize_align(&mut self) -> Result<(), StreamError>;
    /// Serializes a raw byte run. Callers align first; byte runs on an
    /// unaligned stream are a logic error.
    fn serialize_byte_run(&mut self, bytes: &mut [u8]) -> Result<(), StreamError>;
    /// Aligns, then serializes the 32-bit protocol magic, failing the stream
    /// on mismatch. Used to detect encoder/decoder drift and truncation.
    fn serialize_check(&mut self) -> Result<(), StreamError>;
    /// Bits consumed or produced so far.
    fn bits_processed(&self) -> u32;
}

fn bit_mask(bits: u32) -> u32 {
    if bits == 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}

// ---------------------------------------------------------------------------
// WriteStream
// ---------------------------------------------------------------------------

/// Packs bits into an internal word buffer, bounded by a byte capacity.
#[derive(Debug)]
pub struct WriteStream {
    words: Vec<u32>,
    scratch: u64,
    scratch_bits: u32,
    word_index: usize,
    bits_written: u32,
    num_bits: u32,
}

impl WriteStream {
    /// Creates a write stream that refuses to grow past `capacity_bytes`.
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            words: vec![0u32; (capacity_bytes + 3) / 4],
            scratch: 0,
            scratch_bits: 0,
            word_index: 0,
            bits_written: 0,
            num_bits: (capacity_bytes * 8) as u32,
        }
    }

    fn write_bits(&mut self, value: u32, bits: u32) -> Result<(), StreamError> {
        debug_assert!((1..=32).contains(&bits));
        if self.bits_written + bits > self.num_bits {
            return Err(StreamError::Overflow);
        }
        self.scratch |= u64::from(value & bit_mask(bits)) << self.scratch_bits;
        self.scratch_bits += bits;
        while self.scratch_bits >= 32 {
            self.words[self.word_index] = self.scratch as u32;
            self.word_index += 1;
            self.scratch >>= 32;
            self.scratch_bits -= 32;
        }
        self.bits_written += bits;
        Ok(())
    }

    /// Flushes the scratch register into the word buffer.
    pub fn flush(&mut self) {
        if self.scratch_bits > 0 {
            self.words[self.word_index] = self.scratch as u32;
            self.word_index += 1;
            self.scratch = 0;
            self.scratch_bits = 0;
        }
    }

    /// Bytes produced so far, rounding the final partial byte up.
    pub fn bytes_processed(&self) -> usize {
        (self.bits_written as usize + 7) / 8
    }

    /// Flushes and returns the packed bytes.
    pub fn finish(mut self) -> Vec<u8> {
        self.flush();
        let num_bytes = self.bytes_processed();
        let num_words = (num_bytes + 3) / 4;
        let mut bytes = vec![0u8; num_words * 4];
        LittleEndian::write_u32_into(&self.words[..num_words], &mut bytes);
        bytes.truncate(num_bytes);
        bytes
    }
}

impl Stream for WriteStream {
    fn is_reading(&self) -> bool {
        false
    }

    fn is_writing(&self) -> bool {
        true
    }

    fn serialize_bits(&mut self, value: &mut u32, bits: u32) -> Result<(), StreamError> {
        self.write_bits(*value, bits)
    }

    fn serialize_align(&mut self) -> Result<(), StreamError> {
        let remainder = self.bits_written % 8;
        if remainder != 0 {
            self.write_bits(0, 8 - remainder)?;
        }
        Ok(())
    }

    fn serialize_byte_run(&mut self, bytes: &mut [u8]) -> Result<(), StreamError> {
        debug_assert!(self.bits_written % 8 == 0, "byte run on unaligned stream");
        for byte in bytes.iter() {
            self.write_bits(u32::from(*byte), 8)?;
        }
        Ok(())
    }

    fn serialize_check(&mut self) -> Result<(), StreamError> {
        self.serialize_align()?;
        self.write_bits(check_magic(), 32)
    }

    fn bits_processed(&self) -> u32 {
        self.bits_written
    }
}

// ---------------------------------------------------------------------------
// ReadStream
// ---------------------------------------------------------------------------

/// Unpacks bits from a received byte buffer.
#[derive(Debug)]
pub struct ReadStream<'a> {
    data: &'a [u8],
    scratch: u64,
    scratch_bits: u32,
    byte_index: usize,
    bits_read: u32,
    num_bits: u32,
}

impl<'a> ReadStream<'a> {
    /// Creates a read stream over `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            scratch: 0,
            scratch_bits: 0,
            byte_index: 0,
            bits_read: 0,
            num_bits: (data.len() * 8) as u32,
        }
    }

    fn load_word(&mut self) {
        let remaining = self.data.len() - self.byte_index;
        let take = remaining.min(4);
        let mut raw = [0u8; 4];
        raw[..take].copy_from_slice(&self.data[self.byte_index..self.byte_index + take]);
        self.scratch |= u64::from(LittleEndian::read_u32(&raw)) << self.scratch_bits;
        self.scratch_bits += 32;
        self.byte_index += take;
    }

    fn read_bits(&mut self, bits: u32) -> Result<u32, StreamError> {
        debug_assert!((1..=32).contains(&bits));
        if self.bits_read + bits > self.num_bits {
            return Err(StreamError::Overflow);
        }
        if self.scratch_bits < bits {
            self.load_word();
        }
        let value = (self.scratch as u32) & bit_mask(bits);
        self.scratch >>= bits;
        self.scratch_bits -= bits;
        self.bits_read += bits;
        Ok(value)
    }
}

impl Stream for ReadStream<'_> {
    fn is_reading(&self) -> bool {
        true
    }

    fn is_writing(&self) -> bool {
        false
    }

    fn serialize_bits(&mut self, value: &mut u32, bits: u32) -> Result<(), StreamError> {
        *value = self.read_bits(bits)?;
        Ok(())
    }

    fn serialize_align(&mut self) -> Result<(), StreamError> {
        let remainder = self.bits_read % 8;
        if remainder != 0 {
            let padding = self.read_bits(8 - remainder)?;
            if padding != 0 {
                return Err(StreamError::AlignNotZero);
            }
        }
        Ok(())
    }

    fn serialize_byte_run(&mut self, bytes: &mut [u8]) -> Result<(), StreamError> {
        debug_assert!(self.bits_read % 8 == 0, "byte run on unaligned stream");
        for byte in bytes.iter_mut() {
            *byte = self.read_bits(8)? as u8;
        }
        Ok(())
    }

    fn serialize_check(&mut self) -> Result<(), StreamError> {
        self.serialize_align()?;
        let magic = self.read_bits(32)?;
        if magic != check_magic() {
            return Err(StreamError::CheckMismatch);
        }
        Ok(())
    }

    fn bits_processed(&self) -> u32 {
        self.bits_read
    }
}

// ---------------------------------------------------------------------------
// MeasureStream
// ---------------------------------------------------------------------------

/// Counts the bits a write would produce without touching a buffer.
///
/// Reports itself as writing so serialize routines take the same branches
/// they take when encoding.
#[derive(Debug, Default)]
pub struct MeasureStream {
    bits: u32,
}

impl MeasureStream {
    /// Creates an empty measure stream.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Stream for MeasureStream {
    fn is_reading(&self) -> bool {
        false
    }

    fn is_writing(&self) -> bool {
        true
    }

    fn serialize_bits(&mut self, _value: &mut u32, bits: u32) -> Result<(), StreamError> {
        debug_assert!((1..=32).contains(&bits));
        self.bits += bits;
        Ok(())
    }

    fn serialize_align(&mut self) -> Result<(), StreamError> {
        self.bits += (8 - self.bits % 8) % 8;
        Ok(())
    }

    fn serialize_byte_run(&mut self, bytes: &mut [u8]) -> Result<(), StreamError> {
        self.bits += bytes.len() as u32 * 8;
        Ok(())
    }

    fn serialize_check(&mut self) -> Result<(), StreamError> {
        self.serialize_align()?;
        self.bits += 32;
        Ok(())
    }

    fn bits_processed(&self) -> u32 {
        self.bits
    }
}

// ---------------------------------------------------------------------------
// Serialization helpers
// ---------------------------------------------------------------------------

/// Bits needed to represent values in `0..=max`.
pub fn bits_required(max: u32) -> u32 {
    if max == 0 {
        0
    } else {
        32 - max.leading_zeros()
    }
}

/// Serializes an integer known to lie in `[min, max]`, using the minimum
/// number of bits for the range. Fails the stream with `ValueOutOfRange`
/// when a decoded value escapes the range.
pub fn serialize_int(
    stream: &mut dyn Stream,
    value: &mut i32,
    min: i32,
    max: i32,
) -> Result<(), StreamError> {
    debug_assert!(min <= max);
    let range = (i64::from(max) - i64::from(min)) as u32;
    let bits = bits_required(range);
    if bits == 0 {
        if stream.is_reading() {
            *value = min;
        }
        return Ok(());
    }
    let mut unsigned = if stream.is_writing() {
        debug_assert!(*value >= min && *value <= max);
        (i64::from(*value) - i64::from(min)) as u32
    } else {
        0
    };
    stream.serialize_bits(&mut unsigned, bits)?;
    if stream.is_reading() {
        if unsigned > range {
            return Err(StreamError::ValueOutOfRange);
        }
        *value = (i64::from(min) + i64::from(unsigned)) as i32;
    }
    Ok(())
}

/// Serializes a full 16-bit value.
pub fn serialize_u16(stream: &mut dyn Stream, value: &mut u16) -> Result<(), StreamError> {
    let mut wide = u32::from(*value);
    stream.serialize_bits(&mut wide, 16)?;
    *value = wide as u16;
    Ok(())
}

/// Serializes a full 32-bit value.
pub fn serialize_u32(stream: &mut dyn Stream, value: &mut u32) -> Result<(), StreamError> {
    stream.serialize_bits(value, 32)
}

/// Serializes a single bit.
pub fn serialize_bool(stream: &mut dyn Stream, value: &mut bool) -> Result<(), StreamError> {
    let mut bit = u32::from(*value);
    stream.serialize_bits(&mut bit, 1)?;
    *value = bit != 0;
    Ok(())
}

/// Aligns to a byte boundary, then serializes a raw byte run.
pub fn serialize_bytes(stream: &mut dyn Stream, bytes: &mut [u8]) -> Result<(), StreamError> {
    stream.serialize_align()?;
    stream.serialize_byte_run(bytes)
}
