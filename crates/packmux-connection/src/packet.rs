//! The per-datagram packet envelope and its wire codec.
//!
//! A [`ConnectionPacket`] is one datagram's logical content: the piggybacked
//! ack fields plus up to one payload slice per channel. The packet sequence
//! number itself travels out-of-band with the transport.
//!
//! One `serialize` routine drives reading, writing, and measuring through
//! the [`Stream`] trait, so the encoder and decoder cannot drift. Wire
//! layout, bit by bit:
//!
//! 1. `ack` (16 bits), `ack_bits` (32 bits)
//! 2. entry count: enough bits for `0..=num_channels`
//! 3. per entry: channel id (if more than one channel), a one-bit
//!    block-fragment discriminator, then the messages or fragment payload
//!
//! The trailing serialize-check magic is applied by the connection after the
//! packet body.

use std::rc::Rc;

use packmux_core::{
    budget::MemoryBudget,
    config::{ChannelConfig, ChannelKind, ConnectionConfig},
    constants::CHANNEL_ENTRY_CHARGE,
    error::ErrorKind,
};
use packmux_protocol::{
    bits_required, serialize_bool, serialize_bytes, serialize_int, serialize_u16, serialize_u32,
    MessageFactory, MessageRef, Stream, StreamError,
};

fn stream_err(_: StreamError) -> ErrorKind {
    ErrorKind::SerializeFailure
}

/// One channel's slice of a datagram.
#[derive(Debug, Default)]
pub struct ChannelPacketData {
    /// The channel this slice belongs to.
    pub channel_id: u8,
    /// Set by the writer when a message body failed to serialize, so the
    /// failure can be attributed to a channel in diagnostics.
    pub failed_to_serialize: bool,
    /// The slice payload.
    pub payload: ChannelPayload,
}

/// Payload variants a channel can contribute to a packet.
#[derive(Debug)]
pub enum ChannelPayload {
    /// A batch of whole messages. Reliable channels carry the message ids on
    /// the wire; unreliable channels do not.
    Messages(Vec<MessageRef>),
    /// One fragment of a block message.
    Fragment(FragmentData),
}

impl Default for ChannelPayload {
    fn default() -> Self {
        ChannelPayload::Messages(Vec::new())
    }
}

/// One fragment of a block transfer.
#[derive(Debug, Default)]
pub struct FragmentData {
    /// Id of the block message being transferred.
    pub message_id: u16,
    /// Index of this fragment within the block.
    pub fragment_id: u16,
    /// Total fragments in the block.
    pub num_fragments: u16,
    /// This fragment's bytes.
    pub data: Vec<u8>,
    /// The block's header message; present only on fragment zero.
    pub header: Option<MessageRef>,
}

/// Budget reservation held for a packet's channel entry array, released
/// when the packet drops.
#[derive(Debug)]
struct EntryCharge {
    budget: Rc<MemoryBudget>,
    bytes: usize,
}

impl EntryCharge {
    fn reserve(budget: &Rc<MemoryBudget>, bytes: usize) -> Option<Self> {
        budget.reserve(bytes).then(|| Self { budget: Rc::clone(budget), bytes })
    }
}

impl Drop for EntryCharge {
    fn drop(&mut self) {
        self.budget.release(self.bytes);
    }
}

/// A single datagram's logical content.
///
/// Dropping a packet releases every message reference it holds along with
/// the entry-array charge, whether the packet was built for sending or
/// allocated while deserializing.
#[derive(Debug, Default)]
pub struct ConnectionPacket {
    /// Newest received packet sequence, piggybacked for the peer.
    pub ack: u16,
    /// Bit `i` acknowledges sequence `ack - i`.
    pub ack_bits: u32,
    /// Per-channel payload slices.
    pub entries: Vec<ChannelPacketData>,
    entry_charge: Option<EntryCharge>,
}

impl ConnectionPacket {
    /// Creates an empty packet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the channel entries, reserving their allocation from the
    /// factory's budget. On the server the factory carries the per-client
    /// budget, so a client flooding entries exhausts only its own silo.
    pub fn install_entries(
        &mut self,
        factory: &dyn MessageFactory,
        entries: Vec<ChannelPacketData>,
    ) -> Result<(), ErrorKind> {
        let charge = EntryCharge::reserve(factory.budget(), entries.len() * CHANNEL_ENTRY_CHARGE)
            .ok_or(ErrorKind::OutOfMemory)?;
        self.entries = entries;
        self.entry_charge = Some(charge);
        Ok(())
    }

    /// Serializes the packet body. One routine serves write, read, and
    /// measure; on read, entries and messages are allocated through the
    /// factory as they are decoded.
    pub fn serialize(
        &mut self,
        stream: &mut dyn Stream,
        factory: &dyn MessageFactory,
        config: &ConnectionConfig,
    ) -> Result<(), ErrorKind> {
        serialize_u16(stream, &mut self.ack).map_err(stream_err)?;
        serialize_u32(stream, &mut self.ack_bits).map_err(stream_err)?;

        let num_channels = config.num_channels() as i32;
        let mut num_entries = self.entries.len() as i32;
        serialize_int(stream, &mut num_entries, 0, num_channels).map_err(stream_err)?;

        if stream.is_reading() {
            let mut entries = Vec::new();
            entries.resize_with(num_entries as usize, ChannelPacketData::default);
            self.install_entries(factory, entries)?;
        }

        for index in 0..num_entries as usize {
            if let Err(kind) = serialize_entry(stream, &mut self.entries[index], factory, config) {
                self.entries[index].failed_to_serialize = true;
                return Err(kind);
            }
        }
        Ok(())
    }
}

fn serialize_entry(
    stream: &mut dyn Stream,
    entry: &mut ChannelPacketData,
    factory: &dyn MessageFactory,
    config: &ConnectionConfig,
) -> Result<(), ErrorKind> {
    let num_channels = config.num_channels() as i32;
    if num_channels > 1 {
        let mut channel_id = i32::from(entry.channel_id);
        serialize_int(stream, &mut channel_id, 0, num_channels - 1).map_err(stream_err)?;
        entry.channel_id = channel_id as u8;
    } else {
        entry.channel_id = 0;
    }
    let channel_config = &config.channels[entry.channel_id as usize];

    let mut is_fragment = matches!(entry.payload, ChannelPayload::Fragment(_));
    serialize_bool(stream, &mut is_fragment).map_err(stream_err)?;

    if stream.is_reading() {
        entry.payload = if is_fragment {
            ChannelPayload::Fragment(FragmentData::default())
        } else {
            ChannelPayload::Messages(Vec::new())
        };
    }

    match &mut entry.payload {
        ChannelPayload::Messages(messages) => {
            serialize_messages(stream, messages, factory, channel_config)
        }
        ChannelPayload::Fragment(fragment) => {
            serialize_fragment(stream, fragment, factory, channel_config)
        }
    }
}

fn serialize_message_type(
    stream: &mut dyn Stream,
    message_type: &mut u8,
    factory: &dyn MessageFactory,
) -> Result<(), ErrorKind> {
    let mut wide = i32::from(*message_type);
    serialize_int(stream, &mut wide, 0, i32::from(factory.num_types()) - 1)
        .map_err(stream_err)?;
    *message_type = wide as u8;
    Ok(())
}

fn serialize_messages(
    stream: &mut dyn Stream,
    messages: &mut Vec<MessageRef>,
    factory: &dyn MessageFactory,
    channel_config: &ChannelConfig,
) -> Result<(), ErrorKind> {
    let max_messages = i32::from(channel_config.max_messages_per_packet);
    let mut count = messages.len() as i32;
    serialize_int(stream, &mut count, 0, max_messages).map_err(stream_err)?;

    let reliable = channel_config.kind == ChannelKind::ReliableOrdered;
    // All selectable ids lie within one send-queue window, so consecutive
    // deltas fit in a config-derived fixed width both sides agree on.
    let delta_bits = bits_required(u32::from(channel_config.send_queue_size).saturating_sub(2));

    let mut previous_id = 0u16;
    for index in 0..count as usize {
        let mut message_id = if stream.is_reading() {
            0
        } else {
            messages[index].borrow().id()
        };

        if reliable {
            if index == 0 {
                serialize_u16(stream, &mut message_id).map_err(stream_err)?;
            } else if delta_bits > 0 {
                let mut delta =
                    u32::from(message_id.wrapping_sub(previous_id).wrapping_sub(1));
                stream.serialize_bits(&mut delta, delta_bits).map_err(stream_err)?;
                message_id = previous_id.wrapping_add(1).wrapping_add(delta as u16);
            } else {
                message_id = previous_id.wrapping_add(1);
            }
            previous_id = message_id;
        }

        if stream.is_reading() {
            let mut message_type = 0u8;
            serialize_message_type(stream, &mut message_type, factory)?;
            let message = factory.create(message_type).ok_or(ErrorKind::OutOfMemory)?;
            {
                let mut message = message.borrow_mut();
                message.assign_id(message_id);
                message.serialize_body(stream).map_err(stream_err)?;
            }
            messages.push(message);
        } else {
            let message = &messages[index];
            let mut message = message.borrow_mut();
            let mut message_type = message.message_type();
            serialize_message_type(stream, &mut message_type, factory)?;
            message.serialize_body(stream).map_err(stream_err)?;
        }
    }
    Ok(())
}

fn serialize_fragment(
    stream: &mut dyn Stream,
    fragment: &mut FragmentData,
    factory: &dyn MessageFactory,
    channel_config: &ChannelConfig,
) -> Result<(), ErrorKind> {
    let max_fragments = channel_config.max_fragments();

    serialize_u16(stream, &mut fragment.message_id).map_err(stream_err)?;

    let fragment_id_bits = bits_required(u32::from(max_fragments).saturating_sub(1));
    if fragment_id_bits > 0 {
        let mut fragment_id = u32::from(fragment.fragment_id);
        stream.serialize_bits(&mut fragment_id, fragment_id_bits).map_err(stream_err)?;
        fragment.fragment_id = fragment_id as u16;
    } else {
        fragment.fragment_id = 0;
    }

    let mut num_fragments = i32::from(fragment.num_fragments);
    serialize_int(stream, &mut num_fragments, 0, i32::from(max_fragments))
        .map_err(stream_err)?;
    fragment.num_fragments = num_fragments as u16;

    let mut num_bytes = fragment.data.len() as i32;
    serialize_int(stream, &mut num_bytes, 0, i32::from(channel_config.block_fragment_size))
        .map_err(stream_err)?;
    if stream.is_reading() {
        fragment.data = vec![0; num_bytes as usize];
    }
    serialize_bytes(stream, &mut fragment.data).map_err(stream_err)?;

    if fragment.fragment_id == 0 {
        if stream.is_reading() {
            let mut message_type = 0u8;
            serialize_message_type(stream, &mut message_type, factory)?;
            let header = factory.create(message_type).ok_or(ErrorKind::OutOfMemory)?;
            {
                let mut header = header.borrow_mut();
                header.assign_id(fragment.message_id);
                header.serialize_body(stream).map_err(stream_err)?;
            }
            fragment.header = Some(header);
        } else {
            let header = fragment.header.as_ref().ok_or(ErrorKind::SerializeFailure)?;
            let mut header = header.borrow_mut();
            let mut message_type = header.message_type();
            serialize_message_type(stream, &mut message_type, factory)?;
            header.serialize_body(stream).map_err(stream_err)?;
        }
    }
    Ok(())
}
