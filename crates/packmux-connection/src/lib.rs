#![warn(missing_docs)]

//! packmux-connection: multiplexes logical message streams over an
//! unreliable, unordered datagram transport.
//!
//! A [`Connection`] owns a fixed array of channels, each providing its own
//! delivery guarantee (reliable-ordered with block transfer, or
//! unreliable-unordered). Each tick the connection assembles one bitpacked
//! packet from the channels' pending data under a shared bit budget, and
//! processes received packets back into per-channel message streams. Acks
//! piggyback on every packet; reliable channels retransmit until acked.
//!
//! Socket I/O, handshakes, and encryption live outside this crate: the
//! transport hands in `(sequence, bytes)` pairs and carries out whatever
//! `generate_packet` produces.

/// Channel implementations and dispatch.
pub mod channel;
/// Connection orchestration and ack processing.
pub mod connection;
/// Connection counters.
pub mod counters;
/// The per-datagram packet envelope and its wire codec.
pub mod packet;

pub use channel::{Channel, ReliableOrderedChannel, UnreliableUnorderedChannel};
pub use connection::Connection;
pub use counters::ConnectionCounters;
pub use packet::{ChannelPacketData, ChannelPayload, ConnectionPacket, FragmentData};
