//! Exactly-once, in-order message delivery over a lossy transport, plus
//! chunked transfer of block messages too large for one packet.

use std::{rc::Rc, time::Instant};

use packmux_core::{
    config::ChannelConfig,
    constants::CONSERVATIVE_FRAGMENT_HEADER_BITS,
    error::{ChannelErrorKind, ErrorKind},
};
use packmux_protocol::{
    sequence_greater_than, sequence_less_than, BlockBuffer, MessageFactory, MessageRef,
    SequenceBuffer,
};

use crate::{
    channel::measure_message_bits,
    packet::{ChannelPacketData, ChannelPayload, FragmentData},
};

#[derive(Debug)]
struct SendQueueEntry {
    message: MessageRef,
    measured_bits: u32,
    time_last_sent: Option<Instant>,
}

/// What a given sent packet carried for this channel, so an ack for that
/// packet can release the right messages.
#[derive(Debug)]
enum SentPacketEntry {
    Messages { message_ids: Vec<u16> },
    Fragment { message_id: u16, fragment_id: u16 },
}

/// In-flight outgoing block transfer. At most one per channel.
#[derive(Debug)]
struct SendBlock {
    message_id: u16,
    num_fragments: u16,
    num_acked: u16,
    acked: Vec<bool>,
    time_fragment_last_sent: Vec<Option<Instant>>,
}

/// In-flight incoming block reassembly. At most one per channel.
#[derive(Debug)]
struct ReceiveBlock {
    message_id: u16,
    num_fragments: u16,
    num_received: u16,
    received: Vec<bool>,
    last_fragment_bytes: usize,
    buffer: BlockBuffer,
    header: Option<MessageRef>,
}

/// Reliable, ordered channel.
///
/// Messages get ascending 16-bit ids on send and sit in the send queue until
/// acked; packets carry contiguous runs of resend-eligible ids, and the
/// receive side delivers strictly in id order, holding out-of-order arrivals
/// in a fixed window. A block message at the front of the queue switches the
/// channel into fragment mode until every fragment is acked.
#[derive(Debug)]
pub struct ReliableOrderedChannel {
    channel_id: u8,
    config: ChannelConfig,
    factory: Rc<dyn MessageFactory>,
    time: Instant,
    error: Option<ChannelErrorKind>,
    send_message_id: u16,
    receive_message_id: u16,
    oldest_unacked_message_id: u16,
    send_queue: SequenceBuffer<SendQueueEntry>,
    receive_queue: SequenceBuffer<MessageRef>,
    sent_packets: SequenceBuffer<SentPacketEntry>,
    send_block: Option<SendBlock>,
    receive_block: Option<ReceiveBlock>,
}

impl ReliableOrderedChannel {
    /// Creates the channel. The sent-packet window matches the send queue
    /// size, which bounds how long an in-flight packet's message list is
    /// remembered.
    pub fn new(
        config: ChannelConfig,
        channel_id: u8,
        factory: Rc<dyn MessageFactory>,
        now: Instant,
    ) -> Self {
        let send_queue = SequenceBuffer::with_capacity(config.send_queue_size);
        let receive_queue = SequenceBuffer::with_capacity(config.receive_queue_size);
        let sent_packets = SequenceBuffer::with_capacity(config.send_queue_size);
        Self {
            channel_id,
            config,
            factory,
            time: now,
            error: None,
            send_message_id: 0,
            receive_message_id: 0,
            oldest_unacked_message_id: 0,
            send_queue,
            receive_queue,
            sent_packets,
            send_block: None,
            receive_block: None,
        }
    }

    /// The channel's id within its connection.
    pub fn channel_id(&self) -> u8 {
        self.channel_id
    }

    /// The channel's terminal error state, if any.
    pub fn error(&self) -> Option<ChannelErrorKind> {
        self.error
    }

    /// The oldest message id the peer has not acknowledged yet. Equal to the
    /// next send id when nothing is in flight.
    pub fn oldest_unacked_message_id(&self) -> u16 {
        self.oldest_unacked_message_id
    }

    fn error_kind(&self, kind: ChannelErrorKind) -> ErrorKind {
        match kind {
            ChannelErrorKind::Desync => ErrorKind::ChannelDesync(self.channel_id),
            ChannelErrorKind::OutOfMemory => ErrorKind::OutOfMemory,
        }
    }

    fn desync(&mut self, reason: &'static str) {
        tracing::warn!(channel_id = self.channel_id, reason, "reliable channel desync");
        self.error = Some(ChannelErrorKind::Desync);
    }

    /// True when the send queue has a free slot for the next message id.
    pub fn can_send_message(&self) -> bool {
        self.send_queue.available(self.send_message_id)
    }

    /// Assigns the next message id and queues the message until acked.
    ///
    /// Block messages must carry an attached, non-empty block no larger than
    /// `max_block_size`. Fails with `SendQueueFull` while the window is
    /// saturated; the application retries after acks drain it.
    pub fn send_message(&mut self, message: MessageRef) -> Result<(), ErrorKind> {
        if let Some(kind) = self.error {
            return Err(self.error_kind(kind));
        }
        if !self.can_send_message() {
            return Err(ErrorKind::SendQueueFull);
        }
        {
            let borrowed = message.borrow();
            if borrowed.is_block() {
                let block_len = borrowed.block().map_or(0, |block| block.len());
                if block_len == 0 {
                    debug_assert!(false, "block message sent without an attached block");
                    return Err(ErrorKind::InvalidConfiguration(
                        "block message has no attached block",
                    ));
                }
                if block_len > self.config.max_block_size as usize {
                    return Err(ErrorKind::InvalidConfiguration(
                        "block exceeds max_block_size",
                    ));
                }
            }
        }

        let message_id = self.send_message_id;
        message.borrow_mut().assign_id(message_id);
        let measured_bits =
            measure_message_bits(&message).ok_or(ErrorKind::SerializeFailure)?;
        let _ = self.send_queue.insert(
            message_id,
            SendQueueEntry { message, measured_bits, time_last_sent: None },
        );
        self.send_message_id = self.send_message_id.wrapping_add(1);
        Ok(())
    }

    /// Returns the next in-order message, if it has arrived.
    pub fn receive_message(&mut self) -> Option<MessageRef> {
        if self.error.is_some() {
            return None;
        }
        let message = self.receive_queue.remove(self.receive_message_id)?;
        self.receive_message_id = self.receive_message_id.wrapping_add(1);
        Some(message)
    }

    /// Selects payload for the packet being assembled under
    /// `packet_sequence`: either a run of resend-eligible messages or one
    /// block fragment.
    pub fn get_packet_data(
        &mut self,
        packet_sequence: u16,
        available_bits: u32,
    ) -> Option<(ChannelPacketData, u32)> {
        if self.error.is_some() {
            return None;
        }
        let budget_bits = if self.config.packet_budget_bits > 0 {
            available_bits.min(self.config.packet_budget_bits)
        } else {
            available_bits
        };
        if budget_bits == 0 {
            return None;
        }

        let fragment_mode = self.send_block.is_some()
            || self
                .send_queue
                .find(self.oldest_unacked_message_id)
                .map_or(false, |entry| entry.message.borrow().is_block());
        if fragment_mode {
            self.get_fragment_packet_data(packet_sequence, budget_bits)
        } else {
            self.get_messages_packet_data(packet_sequence, budget_bits)
        }
    }

    /// Picks unacked, resend-eligible ids ascending from the oldest unacked
    /// message, stopping at the first id that does not fit the budget so
    /// later ids wait for the next packet. A block message also stops the
    /// scan; it goes out as fragments once everything before it is acked.
    fn get_messages_packet_data(
        &mut self,
        packet_sequence: u16,
        budget_bits: u32,
    ) -> Option<(ChannelPacketData, u32)> {
        let now = self.time;
        let resend = self.config.message_resend_time;

        let mut message_ids = Vec::new();
        let mut used_bits = 0u32;
        let mut id = self.oldest_unacked_message_id;
        while id != self.send_message_id
            && message_ids.len() < self.config.max_messages_per_packet as usize
        {
            if let Some(entry) = self.send_queue.find(id) {
                if entry.message.borrow().is_block() {
                    break;
                }
                let eligible = entry
                    .time_last_sent
                    .map_or(true, |last| now.saturating_duration_since(last) >= resend);
                if eligible {
                    if used_bits + entry.measured_bits > budget_bits {
                        break;
                    }
                    used_bits += entry.measured_bits;
                    message_ids.push(id);
                }
            }
            id = id.wrapping_add(1);
        }

        if message_ids.is_empty() {
            return None;
        }

        let mut messages = Vec::with_capacity(message_ids.len());
        for &message_id in &message_ids {
            let entry = self.send_queue.find_mut(message_id).expect("selected id is queued");
            entry.time_last_sent = Some(now);
            messages.push(Rc::clone(&entry.message));
        }
        let _ = self.sent_packets.insert(packet_sequence, SentPacketEntry::Messages { message_ids });

        let data = ChannelPacketData {
            channel_id: self.channel_id,
            failed_to_serialize: false,
            payload: ChannelPayload::Messages(messages),
        };
        Some((data, used_bits))
    }

    fn start_block_send(&mut self) {
        let message_id = self.oldest_unacked_message_id;
        let Some(entry) = self.send_queue.find(message_id) else { return };
        let Some(block_len) = entry.message.borrow().block().map(|block| block.len()) else {
            debug_assert!(false, "block message in queue without an attached block");
            return;
        };
        let fragment_size = self.config.block_fragment_size as usize;
        let num_fragments = ((block_len + fragment_size - 1) / fragment_size).max(1) as u16;
        self.send_block = Some(SendBlock {
            message_id,
            num_fragments,
            num_acked: 0,
            acked: vec![false; num_fragments as usize],
            time_fragment_last_sent: vec![None; num_fragments as usize],
        });
    }

    /// Emits at most one fragment of the active block per packet, resending
    /// fragments whose timer has elapsed. Fragment zero carries the block's
    /// header message.
    fn get_fragment_packet_data(
        &mut self,
        packet_sequence: u16,
        budget_bits: u32,
    ) -> Option<(ChannelPacketData, u32)> {
        if self.send_block.is_none() {
            self.start_block_send();
        }
        let (message_id, num_fragments) = {
            let send_block = self.send_block.as_ref()?;
            (send_block.message_id, send_block.num_fragments)
        };

        let message = Rc::clone(&self.send_queue.find(message_id)?.message);
        let block_len = message.borrow().block().map(|block| block.len())?;
        let fragment_size = self.config.block_fragment_size as usize;

        let now = self.time;
        let resend = self.config.fragment_resend_time;
        let fragment_id = {
            let send_block = self.send_block.as_ref()?;
            (0..num_fragments).find(|&fragment| {
                !send_block.acked[fragment as usize]
                    && send_block.time_fragment_last_sent[fragment as usize]
                        .map_or(true, |last| now.saturating_duration_since(last) >= resend)
            })?
        };

        let start = fragment_id as usize * fragment_size;
        let end = (start + fragment_size).min(block_len);
        let fragment_len = end - start;

        let mut bits = CONSERVATIVE_FRAGMENT_HEADER_BITS + fragment_len as u32 * 8;
        let header = if fragment_id == 0 {
            bits += measure_message_bits(&message)?;
            Some(Rc::clone(&message))
        } else {
            None
        };
        if bits > budget_bits {
            return None;
        }

        let fragment_bytes =
            message.borrow().block().map(|block| block.as_slice()[start..end].to_vec())?;

        let send_block = self.send_block.as_mut().expect("checked above");
        send_block.time_fragment_last_sent[fragment_id as usize] = Some(now);
        self.sent_packets
            .insert(packet_sequence, SentPacketEntry::Fragment { message_id, fragment_id });

        let data = ChannelPacketData {
            channel_id: self.channel_id,
            failed_to_serialize: false,
            payload: ChannelPayload::Fragment(FragmentData {
                message_id,
                fragment_id,
                num_fragments,
                data: fragment_bytes,
                header,
            }),
        };
        Some((data, bits))
    }

    /// Releases everything the acked packet carried and advances the oldest
    /// unacked id over the vacated slots.
    pub fn process_ack(&mut self, packet_sequence: u16) {
        let Some(entry) = self.sent_packets.remove(packet_sequence) else { return };
        match entry {
            SentPacketEntry::Messages { message_ids } => {
                for message_id in message_ids {
                    self.send_queue.remove(message_id);
                }
            }
            SentPacketEntry::Fragment { message_id, fragment_id } => {
                let block_complete = match self.send_block.as_mut() {
                    Some(send_block)
                        if send_block.message_id == message_id
                            && !send_block.acked[fragment_id as usize] =>
                    {
                        send_block.acked[fragment_id as usize] = true;
                        send_block.num_acked += 1;
                        send_block.num_acked == send_block.num_fragments
                    }
                    _ => false,
                };
                if block_complete {
                    self.send_queue.remove(message_id);
                    self.send_block = None;
                }
            }
        }
        self.advance_oldest_unacked();
    }

    fn advance_oldest_unacked(&mut self) {
        while self.oldest_unacked_message_id != self.send_message_id
            && self.send_queue.available(self.oldest_unacked_message_id)
        {
            self.oldest_unacked_message_id = self.oldest_unacked_message_id.wrapping_add(1);
        }
    }

    /// Ingests a received payload slice.
    pub fn process_packet_data(&mut self, data: &ChannelPacketData) {
        if self.error.is_some() {
            return;
        }
        match &data.payload {
            ChannelPayload::Messages(messages) => {
                for message in messages {
                    self.process_message(message);
                    if self.error.is_some() {
                        return;
                    }
                }
            }
            ChannelPayload::Fragment(fragment) => self.process_fragment(fragment),
        }
    }

    fn process_message(&mut self, message: &MessageRef) {
        let message_id = message.borrow().id();
        if sequence_less_than(message_id, self.receive_message_id) {
            return; // already delivered; the peer resent before our ack landed
        }
        let newest_allowed =
            self.receive_message_id.wrapping_add(self.config.receive_queue_size - 1);
        if sequence_greater_than(message_id, newest_allowed) {
            // An honest sender's window never runs this far ahead.
            self.desync("message id beyond receive window");
            return;
        }
        if self.receive_queue.exists(message_id) {
            return;
        }
        let _ = self.receive_queue.insert(message_id, Rc::clone(message));
    }

    fn process_fragment(&mut self, fragment: &FragmentData) {
        let max_fragments = self.config.max_fragments();
        if fragment.num_fragments == 0 || fragment.num_fragments > max_fragments {
            self.desync("fragment count out of range");
            return;
        }
        if fragment.fragment_id >= fragment.num_fragments {
            self.desync("fragment id out of range");
            return;
        }
        let fragment_size = self.config.block_fragment_size as usize;
        let last = fragment.fragment_id == fragment.num_fragments - 1;
        let valid_len = if last {
            (1..=fragment_size).contains(&fragment.data.len())
        } else {
            fragment.data.len() == fragment_size
        };
        if !valid_len {
            self.desync("fragment length inconsistent");
            return;
        }
        let min_total =
            (u64::from(fragment.num_fragments) - 1) * fragment_size as u64 + 1;
        if min_total > u64::from(self.config.max_block_size) {
            self.desync("block exceeds max_block_size");
            return;
        }
        if fragment.fragment_id == 0
            && !fragment.header.as_ref().map_or(false, |header| header.borrow().is_block())
        {
            self.desync("fragment zero without a block header message");
            return;
        }

        let message_id = fragment.message_id;
        if sequence_less_than(message_id, self.receive_message_id) {
            return; // block already delivered
        }
        if self.receive_queue.exists(message_id) {
            return; // block already reassembled, awaiting delivery
        }
        let newest_allowed =
            self.receive_message_id.wrapping_add(self.config.receive_queue_size - 1);
        if sequence_greater_than(message_id, newest_allowed) {
            self.desync("block message id beyond receive window");
            return;
        }

        // One block in flight at a time; a mismatched id is a stray
        // retransmit from an already-completed transfer.
        if self.receive_block.as_ref().map_or(false, |block| block.message_id != message_id) {
            return;
        }

        if self.receive_block.is_none() {
            let capacity = fragment.num_fragments as usize * fragment_size;
            let Some(buffer) = BlockBuffer::allocate(self.factory.budget(), capacity) else {
                tracing::warn!(
                    channel_id = self.channel_id,
                    capacity,
                    "block reassembly exceeds memory budget"
                );
                self.error = Some(ChannelErrorKind::OutOfMemory);
                return;
            };
            self.receive_block = Some(ReceiveBlock {
                message_id,
                num_fragments: fragment.num_fragments,
                num_received: 0,
                received: vec![false; fragment.num_fragments as usize],
                last_fragment_bytes: 0,
                buffer,
                header: None,
            });
        }

        let receive_block = self.receive_block.as_mut().expect("created above");
        if receive_block.num_fragments != fragment.num_fragments {
            self.desync("fragment count changed mid-block");
            return;
        }
        if receive_block.received[fragment.fragment_id as usize] {
            return; // duplicate fragment
        }

        let start = fragment.fragment_id as usize * fragment_size;
        receive_block.buffer.as_mut_slice()[start..start + fragment.data.len()]
            .copy_from_slice(&fragment.data);
        receive_block.received[fragment.fragment_id as usize] = true;
        receive_block.num_received += 1;
        if last {
            receive_block.last_fragment_bytes = fragment.data.len();
        }
        if fragment.fragment_id == 0 {
            receive_block.header = fragment.header.clone();
        }

        if receive_block.num_received == receive_block.num_fragments {
            self.finish_receive_block();
        }
    }

    fn finish_receive_block(&mut self) {
        let Some(receive_block) = self.receive_block.take() else { return };
        let fragment_size = self.config.block_fragment_size as usize;
        let total =
            (receive_block.num_fragments as usize - 1) * fragment_size
                + receive_block.last_fragment_bytes;
        if total > self.config.max_block_size as usize {
            self.desync("block exceeds max_block_size");
            return;
        }
        let Some(header) = receive_block.header else {
            self.desync("block completed without a header message");
            return;
        };
        let mut buffer = receive_block.buffer;
        buffer.truncate(total);
        header.borrow_mut().attach_block(buffer);
        let _ = self.receive_queue.insert(receive_block.message_id, header);
    }

    /// Advances the channel's clock, making overdue messages and fragments
    /// eligible for resend.
    pub fn advance_time(&mut self, now: Instant) {
        self.time = now;
    }

    /// Drops all queued and in-flight state and clears any error.
    pub fn reset(&mut self) {
        self.error = None;
        self.send_message_id = 0;
        self.receive_message_id = 0;
        self.oldest_unacked_message_id = 0;
        self.send_queue.reset();
        self.receive_queue.reset();
        self.sent_packets.reset();
        self.send_block = None;
        self.receive_block = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use packmux_core::{budget::MemoryBudget, config::ChannelKind};
    use packmux_protocol::{serialize_u32, MessageBody, Stream, StreamError};

    #[derive(Debug, Default)]
    struct Item {
        value: u32,
    }

    impl MessageBody for Item {
        fn serialize(&mut self, stream: &mut dyn Stream) -> Result<(), StreamError> {
            serialize_u32(stream, &mut self.value)
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[derive(Debug, Default)]
    struct BlockHeader;

    impl MessageBody for BlockHeader {
        fn serialize(&mut self, _stream: &mut dyn Stream) -> Result<(), StreamError> {
            Ok(())
        }

        fn is_block(&self) -> bool {
            true
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct Factory {
        budget: Rc<MemoryBudget>,
    }

    impl Factory {
        fn shared() -> Rc<Self> {
            Rc::new(Self { budget: Rc::new(MemoryBudget::unlimited()) })
        }
    }

    impl MessageFactory for Factory {
        fn create_body(&self, message_type: u8) -> Option<Box<dyn MessageBody>> {
            match message_type {
                0 => Some(Box::<Item>::default()),
                1 => Some(Box::<BlockHeader>::default()),
                _ => None,
            }
        }

        fn num_types(&self) -> u8 {
            2
        }

        fn budget(&self) -> &Rc<MemoryBudget> {
            &self.budget
        }
    }

    fn small_config() -> ChannelConfig {
        let mut config = ChannelConfig::new(ChannelKind::ReliableOrdered);
        config.send_queue_size = 8;
        config.receive_queue_size = 8;
        config.max_messages_per_packet = 4;
        config.block_fragment_size = 16;
        config.max_block_size = 64;
        config
    }

    fn make_channel() -> (ReliableOrderedChannel, Rc<Factory>, Instant) {
        let factory = Factory::shared();
        let now = Instant::now();
        let channel = ReliableOrderedChannel::new(
            small_config(),
            0,
            factory.clone(),
            now,
        );
        (channel, factory, now)
    }

    fn block_message(factory: &Factory, bytes: &[u8]) -> MessageRef {
        let message = factory.create(1).unwrap();
        let buffer = BlockBuffer::from_vec(factory.budget(), bytes.to_vec()).unwrap();
        message.borrow_mut().attach_block(buffer);
        message
    }

    #[test]
    fn test_send_assigns_ascending_ids() {
        let (mut channel, factory, _) = make_channel();
        for expected in 0..3u16 {
            let message = factory.create(0).unwrap();
            channel.send_message(Rc::clone(&message)).unwrap();
            assert_eq!(message.borrow().id(), expected);
        }
    }

    #[test]
    fn test_send_queue_full_is_recoverable() {
        let (mut channel, factory, _) = make_channel();
        for _ in 0..8 {
            channel.send_message(factory.create(0).unwrap()).unwrap();
        }
        assert!(!channel.can_send_message());
        assert_eq!(
            channel.send_message(factory.create(0).unwrap()),
            Err(ErrorKind::SendQueueFull)
        );

        // Ack the first batch and slots free up.
        let (_, _) = channel.get_packet_data(0, 10_000).unwrap();
        channel.process_ack(0);
        assert!(channel.can_send_message());
    }

    #[test]
    fn test_packet_data_selects_in_id_order() {
        let (mut channel, factory, _) = make_channel();
        for _ in 0..6 {
            channel.send_message(factory.create(0).unwrap()).unwrap();
        }
        let (data, _) = channel.get_packet_data(0, 100_000).unwrap();
        match data.payload {
            ChannelPayload::Messages(messages) => {
                // max_messages_per_packet caps the batch at 4.
                let ids: Vec<u16> = messages.iter().map(|m| m.borrow().id()).collect();
                assert_eq!(ids, vec![0, 1, 2, 3]);
            }
            other => panic!("expected messages, got {other:?}"),
        }
    }

    #[test]
    fn test_messages_not_resent_before_timer() {
        let (mut channel, factory, now) = make_channel();
        channel.send_message(factory.create(0).unwrap()).unwrap();

        assert!(channel.get_packet_data(0, 10_000).is_some());
        // Same tick: nothing is eligible.
        assert!(channel.get_packet_data(1, 10_000).is_none());

        channel.advance_time(now + Duration::from_millis(150));
        assert!(channel.get_packet_data(2, 10_000).is_some());
    }

    #[test]
    fn test_ack_releases_and_advances_oldest() {
        let (mut channel, factory, _) = make_channel();
        for _ in 0..4 {
            channel.send_message(factory.create(0).unwrap()).unwrap();
        }
        let _ = channel.get_packet_data(7, 10_000).unwrap();
        assert_eq!(channel.oldest_unacked_message_id(), 0);

        channel.process_ack(7);
        assert_eq!(channel.oldest_unacked_message_id(), 4);
        assert!(channel.get_packet_data(8, 10_000).is_none());
    }

    #[test]
    fn test_duplicate_ack_is_harmless() {
        let (mut channel, factory, _) = make_channel();
        channel.send_message(factory.create(0).unwrap()).unwrap();
        let _ = channel.get_packet_data(3, 10_000).unwrap();
        channel.process_ack(3);
        channel.process_ack(3);
        assert_eq!(channel.oldest_unacked_message_id(), 1);
    }

    #[test]
    fn test_receive_delivers_in_order_across_gaps() {
        let (mut channel, factory, _) = make_channel();

        let later = factory.create(0).unwrap();
        later.borrow_mut().assign_id(1);
        channel.process_packet_data(&ChannelPacketData {
            channel_id: 0,
            failed_to_serialize: false,
            payload: ChannelPayload::Messages(vec![later]),
        });
        assert!(channel.receive_message().is_none());

        let first = factory.create(0).unwrap();
        first.borrow_mut().assign_id(0);
        channel.process_packet_data(&ChannelPacketData {
            channel_id: 0,
            failed_to_serialize: false,
            payload: ChannelPayload::Messages(vec![first]),
        });

        assert_eq!(channel.receive_message().unwrap().borrow().id(), 0);
        assert_eq!(channel.receive_message().unwrap().borrow().id(), 1);
        assert!(channel.receive_message().is_none());
    }

    #[test]
    fn test_id_beyond_receive_window_desyncs() {
        let (mut channel, factory, _) = make_channel();
        let message = factory.create(0).unwrap();
        message.borrow_mut().assign_id(100); // receive window is 0..8
        channel.process_packet_data(&ChannelPacketData {
            channel_id: 0,
            failed_to_serialize: false,
            payload: ChannelPayload::Messages(vec![message]),
        });
        assert_eq!(channel.error(), Some(ChannelErrorKind::Desync));
    }

    #[test]
    fn test_block_send_emits_one_fragment_per_packet() {
        let (mut channel, factory, _) = make_channel();
        // 40 bytes over 16-byte fragments: 3 fragments, last is 8 bytes.
        channel.send_message(block_message(&factory, &[7u8; 40])).unwrap();

        let (data, _) = channel.get_packet_data(0, 100_000).unwrap();
        match data.payload {
            ChannelPayload::Fragment(fragment) => {
                assert_eq!(fragment.fragment_id, 0);
                assert_eq!(fragment.num_fragments, 3);
                assert_eq!(fragment.data.len(), 16);
                assert!(fragment.header.is_some());
            }
            other => panic!("expected fragment, got {other:?}"),
        }

        let (data, _) = channel.get_packet_data(1, 100_000).unwrap();
        match data.payload {
            ChannelPayload::Fragment(fragment) => {
                assert_eq!(fragment.fragment_id, 1);
                assert!(fragment.header.is_none());
            }
            other => panic!("expected fragment, got {other:?}"),
        }

        let (data, _) = channel.get_packet_data(2, 100_000).unwrap();
        match data.payload {
            ChannelPayload::Fragment(fragment) => {
                assert_eq!(fragment.fragment_id, 2);
                assert_eq!(fragment.data.len(), 8);
            }
            other => panic!("expected fragment, got {other:?}"),
        }

        // All fragments in flight; nothing eligible until the resend timer.
        assert!(channel.get_packet_data(3, 100_000).is_none());
    }

    #[test]
    fn test_block_completes_when_all_fragments_ack() {
        let (mut channel, factory, _) = make_channel();
        channel.send_message(block_message(&factory, &[9u8; 40])).unwrap();

        for seq in 0..3u16 {
            assert!(channel.get_packet_data(seq, 100_000).is_some());
        }
        channel.process_ack(0);
        channel.process_ack(2);
        assert_eq!(channel.oldest_unacked_message_id(), 0);

        channel.process_ack(1);
        assert_eq!(channel.oldest_unacked_message_id(), 1);
        assert!(channel.can_send_message());
    }

    #[test]
    fn test_block_reassembly_out_of_order() {
        let (mut send_channel, factory, _) = make_channel();
        let payload: Vec<u8> = (0..40u8).collect();
        send_channel.send_message(block_message(&factory, &payload)).unwrap();

        let mut fragments = Vec::new();
        for seq in 0..3u16 {
            let (data, _) = send_channel.get_packet_data(seq, 100_000).unwrap();
            fragments.push(data);
        }
        fragments.reverse();

        let (mut receive_channel, _, _) = make_channel();
        for fragment in &fragments {
            receive_channel.process_packet_data(fragment);
        }

        let message = receive_channel.receive_message().unwrap();
        let message = message.borrow();
        assert!(message.is_block());
        assert_eq!(message.block().unwrap().as_slice(), payload.as_slice());
    }

    #[test]
    fn test_oversized_block_desyncs_receiver() {
        let (mut channel, factory, _) = make_channel();
        // With max_block_size 50 and 16-byte fragments, 4 fragments are
        // allowed but a full-size last fragment declares 64 total bytes.
        channel.config.max_block_size = 50;
        let header = factory.create(1).unwrap();
        header.borrow_mut().assign_id(0);
        for fragment_id in 0..4u16 {
            channel.process_packet_data(&ChannelPacketData {
                channel_id: 0,
                failed_to_serialize: false,
                payload: ChannelPayload::Fragment(FragmentData {
                    message_id: 0,
                    fragment_id,
                    num_fragments: 4,
                    data: vec![0xEE; 16],
                    header: (fragment_id == 0).then(|| Rc::clone(&header)),
                }),
            });
        }
        // Declared total 64 exceeds the 50-byte maximum at completion.
        assert_eq!(channel.error(), Some(ChannelErrorKind::Desync));
    }

    #[test]
    fn test_fragment_count_out_of_range_desyncs() {
        let (mut channel, _, _) = make_channel();
        channel.process_packet_data(&ChannelPacketData {
            channel_id: 0,
            failed_to_serialize: false,
            payload: ChannelPayload::Fragment(FragmentData {
                message_id: 0,
                fragment_id: 0,
                num_fragments: 100,
                data: vec![0; 16],
                header: None,
            }),
        });
        assert_eq!(channel.error(), Some(ChannelErrorKind::Desync));
    }

    #[test]
    fn test_reset_clears_error_and_state() {
        let (mut channel, factory, _) = make_channel();
        channel.send_message(factory.create(0).unwrap()).unwrap();
        channel.desync("test");
        assert!(channel.error().is_some());

        channel.reset();
        assert!(channel.error().is_none());
        assert_eq!(channel.oldest_unacked_message_id(), 0);
        assert!(channel.can_send_message());
    }
}
