#![warn(missing_docs)]

//! packmux-core: foundational types for the packmux connection layer.
//!
//! This crate provides the minimal set of types shared across all layers:
//! - Channel and connection configuration
//! - Error taxonomy
//! - Protocol constants
//! - Per-connection memory accounting
//!
//! Protocol logic lives in the specialized crates:
//! - `packmux-protocol`: bitpacked streams, sequence buffers, message model
//! - `packmux-connection`: channels, packet envelope, connection orchestration

/// Protocol constants shared across layers.
pub mod constants {
    /// Maximum number of channels a connection may be configured with.
    pub const MAX_CHANNELS: usize = 64;

    /// Width of the piggybacked ack bitfield carried by every packet.
    ///
    /// Bit `i` acknowledges sequence `ack - i`, so a sent packet has 32
    /// received packets' worth of chances to learn it arrived before the
    /// resend timer takes over.
    pub const SEQUENCE_ACK_BITS: u32 = 32;

    /// Conservative bit estimate for the fixed part of a connection packet:
    /// ack (16) + ack bits (32) + entry count (up to 7) + trailing check (32)
    /// plus alignment slack.
    pub const CONSERVATIVE_PACKET_HEADER_BITS: u32 = 96;

    /// Conservative bit estimate for one channel entry header (channel id,
    /// block discriminator, message count).
    pub const CONSERVATIVE_CHANNEL_HEADER_BITS: u32 = 32;

    /// Conservative per-message overhead (id delta + type index) added on
    /// top of a message body's measured bits.
    pub const CONSERVATIVE_MESSAGE_HEADER_BITS: u32 = 32;

    /// Conservative bit estimate for a block fragment header (message id,
    /// fragment id, fragment count, byte count, alignment).
    pub const CONSERVATIVE_FRAGMENT_HEADER_BITS: u32 = 96;

    /// Protocol identification string. The 32-bit serialize-check magic is
    /// the CRC32 of this string, so bumping the version here desyncs the
    /// check against older builds by construction.
    pub const PROTOCOL_STRING: &str = "packmux 1";

    /// Budget bytes reserved for each live message envelope.
    pub const MESSAGE_ENVELOPE_CHARGE: usize = 64;

    /// Budget bytes reserved per channel entry when a packet allocates its
    /// entry array.
    pub const CHANNEL_ENTRY_CHARGE: usize = 256;
}

/// Per-connection memory accounting.
pub mod budget;
/// Channel and connection configuration.
pub mod config;
/// Error types.
pub mod error;
