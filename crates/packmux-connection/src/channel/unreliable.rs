//! Best-effort message batching with no acks and no retransmission.

use std::{collections::VecDeque, rc::Rc, time::Instant};

use packmux_core::{config::ChannelConfig, error::ErrorKind};
use packmux_protocol::MessageRef;

use crate::{
    channel::measure_message_bits,
    packet::{ChannelPacketData, ChannelPayload},
};

/// Unreliable, unordered channel.
///
/// Messages are batched into whichever packet is generated next and then
/// forgotten; whatever the transport loses stays lost. Both queues are
/// bounded: the send queue discards its oldest entry to make room, the
/// receive queue discards new arrivals when full.
#[derive(Debug)]
pub struct UnreliableUnorderedChannel {
    channel_id: u8,
    config: ChannelConfig,
    time: Instant,
    send_queue: VecDeque<MessageRef>,
    receive_queue: VecDeque<MessageRef>,
}

impl UnreliableUnorderedChannel {
    /// Creates the channel.
    pub fn new(config: ChannelConfig, channel_id: u8, now: Instant) -> Self {
        let send_capacity = config.send_queue_size as usize;
        let receive_capacity = config.receive_queue_size as usize;
        Self {
            channel_id,
            config,
            time: now,
            send_queue: VecDeque::with_capacity(send_capacity),
            receive_queue: VecDeque::with_capacity(receive_capacity),
        }
    }

    /// The channel's id within its connection.
    pub fn channel_id(&self) -> u8 {
        self.channel_id
    }

    /// Always true: a full send queue makes room by discarding its oldest
    /// message.
    pub fn can_send_message(&self) -> bool {
        true
    }

    /// Queues `message` for the next packet. Block messages are not
    /// supported on unreliable channels and are rejected.
    pub fn send_message(&mut self, message: MessageRef) -> Result<(), ErrorKind> {
        if message.borrow().is_block() {
            debug_assert!(false, "block messages require a reliable-ordered channel");
            return Err(ErrorKind::BlocksNotAllowed);
        }
        if self.send_queue.len() >= self.config.send_queue_size as usize {
            self.send_queue.pop_front();
        }
        self.send_queue.push_back(message);
        Ok(())
    }

    /// Drains queued messages that fit within `available_bits`, front first.
    pub fn get_packet_data(&mut self, available_bits: u32) -> Option<(ChannelPacketData, u32)> {
        let budget = if self.config.packet_budget_bits > 0 {
            available_bits.min(self.config.packet_budget_bits)
        } else {
            available_bits
        };

        let mut messages = Vec::new();
        let mut used_bits = 0u32;
        while messages.len() < self.config.max_messages_per_packet as usize {
            let Some(front) = self.send_queue.front() else { break };
            let Some(message_bits) = measure_message_bits(front) else {
                tracing::warn!(channel_id = self.channel_id, "dropping unmeasurable message");
                self.send_queue.pop_front();
                continue;
            };
            if used_bits + message_bits > budget {
                break;
            }
            used_bits += message_bits;
            messages.push(self.send_queue.pop_front().expect("front checked above"));
        }

        if messages.is_empty() {
            return None;
        }
        let data = ChannelPacketData {
            channel_id: self.channel_id,
            failed_to_serialize: false,
            payload: ChannelPayload::Messages(messages),
        };
        Some((data, used_bits))
    }

    /// Enqueues each decoded message for the application, dropping arrivals
    /// that do not fit the bounded receive queue.
    pub fn process_packet_data(&mut self, data: &ChannelPacketData) {
        let ChannelPayload::Messages(messages) = &data.payload else {
            tracing::warn!(
                channel_id = self.channel_id,
                "ignoring block fragment on unreliable channel"
            );
            return;
        };
        for message in messages {
            if self.receive_queue.len() >= self.config.receive_queue_size as usize {
                return;
            }
            self.receive_queue.push_back(Rc::clone(message));
        }
    }

    /// Returns the oldest received message, if any.
    pub fn receive_message(&mut self) -> Option<MessageRef> {
        self.receive_queue.pop_front()
    }

    /// Advances the channel's clock.
    pub fn advance_time(&mut self, now: Instant) {
        self.time = now;
    }

    /// Discards all queued messages.
    pub fn reset(&mut self) {
        self.send_queue.clear();
        self.receive_queue.clear();
    }
}
