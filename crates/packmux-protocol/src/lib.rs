#![warn(missing_docs)]

//! packmux-protocol: the serialization and bookkeeping primitives under the
//! packmux connection layer.
//!
//! - Bitpacked streams with unified read/write/measure serialization
//! - Wrapping 16-bit sequence arithmetic and the sequence buffer
//! - The reference-counted message model and message factory

/// Bitpacked streams and serialization helpers.
pub mod bitstream;
/// Reference-counted messages and the message factory.
pub mod message;
/// Circular buffers keyed by wrapping sequence numbers.
pub mod sequence_buffer;

pub use bitstream::{
    bits_required, serialize_bool, serialize_bytes, serialize_int, serialize_u16, serialize_u32,
    MeasureStream, ReadStream, Stream, StreamError, WriteStream,
};
pub use message::{BlockBuffer, Message, MessageBody, MessageFactory, MessageRef};
pub use sequence_buffer::{
    sequence_greater_than, sequence_less_than, SequenceBuffer, SequenceNumber,
};
