//! Connection orchestration: per-tick packet assembly, received-packet
//! bookkeeping, and the piggybacked ack protocol.

use std::{rc::Rc, time::Instant};

use packmux_core::{
    config::ConnectionConfig,
    constants::{
        CONSERVATIVE_CHANNEL_HEADER_BITS, CONSERVATIVE_PACKET_HEADER_BITS, SEQUENCE_ACK_BITS,
    },
    error::{ChannelErrorKind, ErrorKind},
};
use packmux_protocol::{
    MessageFactory, MessageRef, ReadStream, SequenceBuffer, Stream, WriteStream,
};

use crate::{
    channel::Channel,
    counters::ConnectionCounters,
    packet::{ChannelPacketData, ConnectionPacket},
};

#[derive(Debug)]
struct SentPacketData {
    acked: bool,
}

#[derive(Debug)]
struct ReceivedPacketData;

/// Multiplexes a fixed set of channels over one datagram flow.
///
/// Driven by periodic ticks: `advance_time`, then `generate_packet` for the
/// transport to carry out, then `process_packet` for whatever arrived. All
/// operations are synchronous and bounded by the configured queue sizes; a
/// connection is single-threaded and owned by whoever drives it.
#[derive(Debug)]
pub struct Connection {
    config: ConnectionConfig,
    factory: Rc<dyn MessageFactory>,
    channels: Vec<Channel>,
    sent_packets: SequenceBuffer<SentPacketData>,
    received_packets: SequenceBuffer<ReceivedPacketData>,
    counters: ConnectionCounters,
    error: Option<ErrorKind>,
}

impl Connection {
    /// Creates a connection with one channel per `config.channels` entry.
    pub fn new(
        factory: Rc<dyn MessageFactory>,
        config: ConnectionConfig,
        now: Instant,
    ) -> Result<Self, ErrorKind> {
        config.validate()?;
        let channels = config
            .channels
            .iter()
            .enumerate()
            .map(|(channel_id, channel_config)| {
                Channel::new(channel_config.clone(), channel_id as u8, Rc::clone(&factory), now)
            })
            .collect();
        let sent_packets = SequenceBuffer::with_capacity(config.sent_packets_window);
        let received_packets = SequenceBuffer::with_capacity(config.received_packets_window);
        Ok(Self {
            config,
            factory,
            channels,
            sent_packets,
            received_packets,
            counters: ConnectionCounters::default(),
            error: None,
        })
    }

    /// The connection's terminal error, if any.
    pub fn error(&self) -> Option<ErrorKind> {
        self.error
    }

    /// Packet-level counters.
    pub fn counters(&self) -> &ConnectionCounters {
        &self.counters
    }

    /// Borrows a channel for inspection.
    pub fn channel(&self, channel_id: u8) -> Option<&Channel> {
        self.channels.get(channel_id as usize)
    }

    fn channel_mut(&mut self, channel_id: u8) -> Result<&mut Channel, ErrorKind> {
        self.channels
            .get_mut(channel_id as usize)
            .ok_or(ErrorKind::InvalidChannel(channel_id))
    }

    /// True when `send_message` on `channel_id` would accept a message.
    pub fn can_send_message(&self, channel_id: u8) -> bool {
        self.channels
            .get(channel_id as usize)
            .map_or(false, |channel| channel.can_send_message())
    }

    /// Queues `message` on `channel_id`.
    pub fn send_message(&mut self, channel_id: u8, message: MessageRef) -> Result<(), ErrorKind> {
        self.channel_mut(channel_id)?.send_message(message)
    }

    /// Returns the next deliverable message on `channel_id`, if any.
    pub fn receive_message(&mut self, channel_id: u8) -> Option<MessageRef> {
        self.channels.get_mut(channel_id as usize)?.receive_message()
    }

    /// Assembles one outgoing packet under sequence `sequence` into `out`,
    /// returning the number of bytes written.
    ///
    /// Channels are polled in id order and the first channel with data wins
    /// whatever budget it asks for; operators order higher-priority channels
    /// first. A packet with no channel data still carries acks.
    pub fn generate_packet(&mut self, sequence: u16, out: &mut [u8]) -> Result<usize, ErrorKind> {
        if self.error.is_some() {
            return Err(ErrorKind::ConnectionErrored);
        }
        let max_bytes = out.len().min(self.config.max_packet_size);

        let mut packet = ConnectionPacket::new();
        packet.ack = self.received_packets.newest();
        packet.ack_bits = self.generate_ack_bits(packet.ack);

        let mut available_bits =
            (max_bytes * 8) as i64 - i64::from(CONSERVATIVE_PACKET_HEADER_BITS);
        let mut entries: Vec<ChannelPacketData> = Vec::new();
        for channel in &mut self.channels {
            if available_bits <= i64::from(CONSERVATIVE_CHANNEL_HEADER_BITS) {
                break;
            }
            if let Some((data, bits)) = channel.get_packet_data(sequence, available_bits as u32) {
                available_bits -= i64::from(bits) + i64::from(CONSERVATIVE_CHANNEL_HEADER_BITS);
                entries.push(data);
            }
        }
        packet.install_entries(self.factory.as_ref(), entries)?;

        let _ = self.sent_packets.insert(sequence, SentPacketData { acked: false });
        self.counters.packets_generated += 1;

        let mut stream = WriteStream::new(max_bytes);
        packet
            .serialize(&mut stream, self.factory.as_ref(), &self.config)
            .map_err(|kind| {
                tracing::warn!(sequence, ?kind, "failed to write connection packet");
                kind
            })?;
        stream.serialize_check().map_err(|_| ErrorKind::SerializeFailure)?;
        let bytes = stream.finish();
        out[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    /// Processes one received packet: stale rejection, piggybacked acks,
    /// then per-channel dispatch.
    ///
    /// Duplicate and below-window sequences are dropped and counted without
    /// touching channel state, which makes reprocessing a duplicate packet a
    /// no-op. A parse failure drops the packet; channel slices processed
    /// before the failure point have already committed their effects.
    pub fn process_packet(&mut self, sequence: u16, data: &[u8]) -> Result<(), ErrorKind> {
        if self.error.is_some() {
            return Err(ErrorKind::ConnectionErrored);
        }
        if self.received_packets.exists(sequence) {
            self.counters.packets_stale += 1;
            return Err(ErrorKind::StalePacket(sequence));
        }
        if self.received_packets.insert(sequence, ReceivedPacketData).is_none() {
            self.counters.packets_stale += 1;
            tracing::warn!(sequence, "dropping stale packet below the received window");
            return Err(ErrorKind::StalePacket(sequence));
        }

        let mut packet = ConnectionPacket::new();
        let mut stream = ReadStream::new(data);
        packet
            .serialize(&mut stream, self.factory.as_ref(), &self.config)
            .and_then(|()| {
                stream.serialize_check().map_err(|_| ErrorKind::SerializeFailure)
            })
            .map_err(|kind| {
                tracing::warn!(sequence, ?kind, "dropping unparseable packet");
                kind
            })?;
        self.counters.packets_processed += 1;

        self.process_acks(packet.ack, packet.ack_bits);

        for entry in &packet.entries {
            match self.channels.get_mut(entry.channel_id as usize) {
                Some(channel) => channel.process_packet_data(entry),
                None => return Err(ErrorKind::InvalidChannel(entry.channel_id)),
            }
        }
        Ok(())
    }

    /// Applies a received `(ack, ack_bits)` pair: every newly confirmed
    /// sequence is marked acked once and fanned out to the channels. Acked
    /// stays acked until `reset`.
    pub fn process_acks(&mut self, ack: u16, mut ack_bits: u32) {
        for i in 0..SEQUENCE_ACK_BITS as u16 {
            if ack_bits & 1 != 0 {
                let sequence = ack.wrapping_sub(i);
                if let Some(sent) = self.sent_packets.find_mut(sequence) {
                    if !sent.acked {
                        sent.acked = true;
                        self.counters.packets_acked += 1;
                        for channel in &mut self.channels {
                            channel.process_ack(sequence);
                        }
                    }
                }
            }
            ack_bits >>= 1;
        }
    }

    fn generate_ack_bits(&self, ack: u16) -> u32 {
        let mut ack_bits = 0u32;
        for i in 0..SEQUENCE_ACK_BITS as u16 {
            if self.received_packets.exists(ack.wrapping_sub(i)) {
                ack_bits |= 1u32 << i;
            }
        }
        ack_bits
    }

    /// Advances every channel's clock, then latches the first terminal
    /// channel error into the connection, which refuses packet generation
    /// from then on.
    pub fn advance_time(&mut self, now: Instant) {
        for channel in &mut self.channels {
            channel.advance_time(now);
        }
        if self.error.is_none() {
            for channel in &self.channels {
                if let Some(kind) = channel.error() {
                    let channel_id = channel.channel_id();
                    tracing::warn!(channel_id, ?kind, "channel error, connection halted");
                    self.error = Some(match kind {
                        ChannelErrorKind::Desync => ErrorKind::ChannelDesync(channel_id),
                        ChannelErrorKind::OutOfMemory => ErrorKind::OutOfMemory,
                    });
                    break;
                }
            }
        }
    }

    /// Abandons all in-flight state: channels, packet windows, counters, and
    /// any latched error.
    pub fn reset(&mut self) {
        self.error = None;
        for channel in &mut self.channels {
            channel.reset();
        }
        self.sent_packets.reset();
        self.received_packets.reset();
        self.counters.reset();
    }
}
