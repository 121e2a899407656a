//! Channel implementations and the dispatch wrapper.
//!
//! Channels are a closed set of two variants behind a tagged enum rather
//! than trait objects: the hot path is a per-tick fan-out over a small fixed
//! array, which a `match` serves without indirection.

mod reliable;
mod unreliable;

use std::{rc::Rc, time::Instant};

use packmux_core::{
    config::{ChannelConfig, ChannelKind},
    constants::CONSERVATIVE_MESSAGE_HEADER_BITS,
    error::{ChannelErrorKind, ErrorKind},
};
use packmux_protocol::{MeasureStream, MessageFactory, MessageRef, Stream};

use crate::packet::ChannelPacketData;

pub use reliable::ReliableOrderedChannel;
pub use unreliable::UnreliableUnorderedChannel;

/// Conservative wire cost of a message: measured body bits plus the
/// per-message id/type overhead. `None` when the body's serialize routine
/// fails, which a correct schema never does while measuring.
pub(crate) fn measure_message_bits(message: &MessageRef) -> Option<u32> {
    let mut measure = MeasureStream::new();
    message.borrow_mut().serialize_body(&mut measure).ok()?;
    Some(measure.bits_processed() + CONSERVATIVE_MESSAGE_HEADER_BITS)
}

/// A logical message stream with its own delivery guarantee and queues.
#[derive(Debug)]
pub enum Channel {
    /// Exactly-once, in-order delivery with block transfer.
    ReliableOrdered(ReliableOrderedChannel),
    /// Best-effort per-packet batching.
    UnreliableUnordered(UnreliableUnorderedChannel),
}

impl Channel {
    /// Creates the channel variant selected by `config.kind`.
    pub fn new(
        config: ChannelConfig,
        channel_id: u8,
        factory: Rc<dyn MessageFactory>,
        now: Instant,
    ) -> Self {
        match config.kind {
            ChannelKind::ReliableOrdered => Channel::ReliableOrdered(
                ReliableOrderedChannel::new(config, channel_id, factory, now),
            ),
            ChannelKind::UnreliableUnordered => {
                Channel::UnreliableUnordered(UnreliableUnorderedChannel::new(config, channel_id, now))
            }
        }
    }

    /// The channel's id within its connection.
    pub fn channel_id(&self) -> u8 {
        match self {
            Channel::ReliableOrdered(channel) => channel.channel_id(),
            Channel::UnreliableUnordered(channel) => channel.channel_id(),
        }
    }

    /// True when `send_message` would accept a message right now.
    pub fn can_send_message(&self) -> bool {
        match self {
            Channel::ReliableOrdered(channel) => channel.can_send_message(),
            Channel::UnreliableUnordered(channel) => channel.can_send_message(),
        }
    }

    /// Queues a message for delivery.
    pub fn send_message(&mut self, message: MessageRef) -> Result<(), ErrorKind> {
        match self {
            Channel::ReliableOrdered(channel) => channel.send_message(message),
            Channel::UnreliableUnordered(channel) => channel.send_message(message),
        }
    }

    /// Returns the next deliverable message, if any.
    pub fn receive_message(&mut self) -> Option<MessageRef> {
        match self {
            Channel::ReliableOrdered(channel) => channel.receive_message(),
            Channel::UnreliableUnordered(channel) => channel.receive_message(),
        }
    }

    /// Produces up to `available_bits` of payload for the packet being
    /// assembled under `packet_sequence`. Returns the payload slice and a
    /// conservative bit count, or `None` when the channel has nothing that
    /// fits.
    pub fn get_packet_data(
        &mut self,
        packet_sequence: u16,
        available_bits: u32,
    ) -> Option<(ChannelPacketData, u32)> {
        match self {
            Channel::ReliableOrdered(channel) => {
                channel.get_packet_data(packet_sequence, available_bits)
            }
            Channel::UnreliableUnordered(channel) => channel.get_packet_data(available_bits),
        }
    }

    /// Ingests a received payload slice addressed to this channel.
    pub fn process_packet_data(&mut self, data: &ChannelPacketData) {
        match self {
            Channel::ReliableOrdered(channel) => channel.process_packet_data(data),
            Channel::UnreliableUnordered(channel) => channel.process_packet_data(data),
        }
    }

    /// Notifies the channel that the packet sent as `packet_sequence` was
    /// acknowledged by the peer.
    pub fn process_ack(&mut self, packet_sequence: u16) {
        match self {
            Channel::ReliableOrdered(channel) => channel.process_ack(packet_sequence),
            Channel::UnreliableUnordered(_) => {}
        }
    }

    /// Advances the channel's clock.
    pub fn advance_time(&mut self, now: Instant) {
        match self {
            Channel::ReliableOrdered(channel) => channel.advance_time(now),
            Channel::UnreliableUnordered(channel) => channel.advance_time(now),
        }
    }

    /// The channel's terminal error state, if any.
    pub fn error(&self) -> Option<ChannelErrorKind> {
        match self {
            Channel::ReliableOrdered(channel) => channel.error(),
            Channel::UnreliableUnordered(_) => None,
        }
    }

    /// Drops all queued and in-flight state and clears any error.
    pub fn reset(&mut self) {
        match self {
            Channel::ReliableOrdered(channel) => channel.reset(),
            Channel::UnreliableUnordered(channel) => channel.reset(),
        }
    }

    /// The oldest reliable message id not yet acknowledged, when this is a
    /// reliable channel.
    pub fn oldest_unacked_message_id(&self) -> Option<u16> {
        match self {
            Channel::ReliableOrdered(channel) => Some(channel.oldest_unacked_message_id()),
            Channel::UnreliableUnordered(_) => None,
        }
    }
}
