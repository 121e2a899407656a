//! Integration tests for the packmux-connection crate.
//!
//! Each scenario wires two connections through a deterministic in-memory
//! transport and drives them with fixed-interval ticks. Loss and reordering
//! are simulated with counter-based filters so every run takes the same
//! path.

use std::{
    rc::Rc,
    time::{Duration, Instant},
};

use packmux_connection::Connection;
use packmux_core::{
    budget::MemoryBudget,
    config::{ChannelConfig, ChannelKind, ConnectionConfig},
    error::ErrorKind,
};
use packmux_protocol::{
    serialize_u32, BlockBuffer, MessageBody, MessageFactory, MessageRef, Stream, StreamError,
    WriteStream,
};

const TYPE_NUMBERED: u8 = 0;
const TYPE_BLOB: u8 = 1;

#[derive(Debug, Default, PartialEq)]
struct Numbered {
    value: u32,
}

impl MessageBody for Numbered {
    fn serialize(&mut self, stream: &mut dyn Stream) -> Result<(), StreamError> {
        serialize_u32(stream, &mut self.value)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[derive(Debug, Default, PartialEq)]
struct Blob {
    tag: u32,
}

impl MessageBody for Blob {
    fn serialize(&mut self, stream: &mut dyn Stream) -> Result<(), StreamError> {
        serialize_u32(stream, &mut self.tag)
    }

    fn is_block(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

struct TestFactory {
    budget: Rc<MemoryBudget>,
}

impl TestFactory {
    fn unlimited() -> Rc<Self> {
        Rc::new(Self { budget: Rc::new(MemoryBudget::unlimited()) })
    }

    fn with_limit(limit: usize) -> Rc<Self> {
        Rc::new(Self { budget: Rc::new(MemoryBudget::with_limit(limit)) })
    }
}

impl MessageFactory for TestFactory {
    fn create_body(&self, message_type: u8) -> Option<Box<dyn MessageBody>> {
        match message_type {
            TYPE_NUMBERED => Some(Box::<Numbered>::default()),
            TYPE_BLOB => Some(Box::<Blob>::default()),
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

fn numbered_message(factory: &TestFactory, value: u32) -> MessageRef {
    let mut encoded = WriteStream::new(8);
    let mut v = value;
    serialize_u32(&mut encoded, &mut v).unwrap();
    let bytes = encoded.finish();

    let message = factory.create(TYPE_NUMBERED).unwrap();
    message
        .borrow_mut()
        .serialize_body(&mut packmux_protocol::ReadStream::new(&bytes))
        .unwrap();
    message
}

fn reliable_config() -> ConnectionConfig {
    ConnectionConfig::default()
}

fn unreliable_config() -> ConnectionConfig {
    ConnectionConfig {
        channels: vec![ChannelConfig::new(ChannelKind::UnreliableUnordered)],
        ..ConnectionConfig::default()
    }
}

/// Two connections plus the tick/transport plumbing between them.
struct Pair {
    factory: Rc<TestFactory>,
    a: Connection,
    b: Connection,
    a_sequence: u16,
    b_sequence: u16,
    a_to_b_count: u64,
    time: Instant,
}

impl Pair {
    fn new(config: ConnectionConfig) -> Self {
        let factory = TestFactory::unlimited();
        let time = Instant::now();
        Self {
            a: Connection::new(factory.clone(), config.clone(), time).unwrap(),
            b: Connection::new(TestFactory::unlimited(), config, time).unwrap(),
            factory,
            a_sequence: 0,
            b_sequence: 0,
            a_to_b_count: 0,
            time,
        }
    }

    fn send_numbered(&mut self, channel_id: u8, value: u32) {
        let message = numbered_message(&self.factory, value);
        self.a.send_message(channel_id, message).unwrap();
    }

    /// One simulated tick: both sides advance time and exchange one packet
    /// each. `deliver_a_to_b` decides whether a given a->b packet survives
    /// (its argument counts a->b packets from zero). The b->a direction is
    /// lossless so acks flow.
    fn tick(&mut self, deliver_a_to_b: impl Fn(u64) -> bool) {
        self.time += Duration::from_millis(50);
        self.a.advance_time(self.time);
        self.b.advance_time(self.time);

        let mut buffer = [0u8; 1500];

        let written = self.a.generate_packet(self.a_sequence, &mut buffer).unwrap();
        if deliver_a_to_b(self.a_to_b_count) {
            let _ = self.b.process_packet(self.a_sequence, &buffer[..written]);
        }
        self.a_to_b_count += 1;
        self.a_sequence = self.a_sequence.wrapping_add(1);

        let written = self.b.generate_packet(self.b_sequence, &mut buffer).unwrap();
        let _ = self.a.process_packet(self.b_sequence, &buffer[..written]);
        self.b_sequence = self.b_sequence.wrapping_add(1);
    }

    fn drain_b(&mut self, channel_id: u8) -> Vec<u32> {
        let mut values = Vec::new();
        while let Some(message) = self.b.receive_message(channel_id) {
            values.push(message.borrow().body_as::<Numbered>().unwrap().value);
        }
        values
    }
}

#[test]
fn test_lossless_reliable_echo() {
    let mut pair = Pair::new(reliable_config());
    for value in 0..100 {
        pair.send_numbered(0, value);
    }

    let mut received = Vec::new();
    for _ in 0..50 {
        pair.tick(|_| true);
        received.extend(pair.drain_b(0));
        if received.len() == 100 {
            break;
        }
    }

    assert_eq!(received, (0..100).collect::<Vec<u32>>());
}

#[test]
fn test_reliable_delivery_under_50_percent_loss() {
    let mut config = reliable_config();
    // Three ticks between resends, against a two-tick drop pattern, so a
    // retransmission never stays phase-locked onto dropped packets.
    config.channels[0].message_resend_time = Duration::from_millis(120);
    let mut pair = Pair::new(config);
    for value in 0..100 {
        pair.send_numbered(0, value);
    }

    let mut received = Vec::new();
    for _ in 0..400 {
        // Drop every other a->b packet.
        pair.tick(|count| count % 2 == 0);
        received.extend(pair.drain_b(0));
        if received.len() == 100 && pair.a.channel(0).unwrap().oldest_unacked_message_id() == Some(100)
        {
            break;
        }
    }

    assert_eq!(received, (0..100).collect::<Vec<u32>>());
    // Every send has been acked: the oldest unacked id caught up with the
    // next id to assign.
    assert_eq!(pair.a.channel(0).unwrap().oldest_unacked_message_id(), Some(100));
}

#[test]
fn test_reliable_delivery_survives_reordering() {
    let factory = TestFactory::unlimited();
    let config = reliable_config();
    let time = Instant::now();
    let mut a = Connection::new(factory.clone(), config.clone(), time).unwrap();
    let mut b = Connection::new(TestFactory::unlimited(), config, time).unwrap();

    for value in 0..100u32 {
        a.send_message(0, numbered_message(&factory, value)).unwrap();
    }

    let mut now = time;
    let mut sequence = 0u16;
    let mut received = Vec::new();
    let mut buffer = [0u8; 1500];

    for _ in 0..100 {
        now += Duration::from_millis(50);
        a.advance_time(now);
        b.advance_time(now);

        // Generate a burst of four packets and deliver them in reverse
        // order within the window.
        let mut burst = Vec::new();
        for _ in 0..4 {
            let written = a.generate_packet(sequence, &mut buffer).unwrap();
            burst.push((sequence, buffer[..written].to_vec()));
            sequence = sequence.wrapping_add(1);
        }
        for (packet_sequence, bytes) in burst.iter().rev() {
            let _ = b.process_packet(*packet_sequence, bytes);
        }

        while let Some(message) = b.receive_message(0) {
            received.push(message.borrow().body_as::<Numbered>().unwrap().value);
        }

        // Lossless return path for acks.
        let written = b.generate_packet(sequence, &mut buffer).unwrap();
        let _ = a.process_packet(sequence, &buffer[..written]);
        sequence = sequence.wrapping_add(1);

        if received.len() == 100 {
            break;
        }
    }

    assert_eq!(received, (0..100).collect::<Vec<u32>>());
}

#[test]
fn test_block_transfer_round_trip() {
    let mut config = reliable_config();
    config.channels[0].max_block_size = 256 * 1024;
    config.channels[0].block_fragment_size = 1024;

    let mut pair = Pair::new(config);
    let factory = pair.factory.clone();

    let payload: Vec<u8> = (0..64 * 1024u32).map(|i| (i * 31 + 7) as u8).collect();
    let message = factory.create(TYPE_BLOB).unwrap();
    {
        let mut encoded = WriteStream::new(8);
        let mut tag = 0xC0FFEEu32;
        serialize_u32(&mut encoded, &mut tag).unwrap();
        let bytes = encoded.finish();
        let mut borrowed = message.borrow_mut();
        borrowed.serialize_body(&mut packmux_protocol::ReadStream::new(&bytes)).unwrap();
        borrowed.attach_block(BlockBuffer::from_vec(factory.budget(), payload.clone()).unwrap());
    }
    pair.a.send_message(0, message).unwrap();

    let mut delivered = None;
    // 64 fragments, one per packet, plus retransmit slack.
    for _ in 0..400 {
        pair.tick(|_| true);
        if let Some(received) = pair.b.receive_message(0) {
            delivered = Some(received);
            break;
        }
    }

    let delivered = delivered.expect("block was not delivered");
    let delivered = delivered.borrow();
    assert!(delivered.is_block());
    assert_eq!(delivered.body_as::<Blob>().unwrap().tag, 0xC0FFEE);
    assert_eq!(delivered.block().unwrap().as_slice(), payload.as_slice());
    assert!(pair.b.receive_message(0).is_none(), "exactly one message expected");
}

#[test]
fn test_stale_packet_dropped_and_counted() {
    let mut sender = Connection::new(
        TestFactory::unlimited(),
        reliable_config(),
        Instant::now(),
    )
    .unwrap();
    let mut receiver = Connection::new(
        TestFactory::unlimited(),
        reliable_config(),
        Instant::now(),
    )
    .unwrap();

    let mut buffer = [0u8; 1500];

    // Land a packet far into the sequence space, then one below the
    // receiver's 1024-entry window floor.
    let written = sender.generate_packet(2000, &mut buffer).unwrap();
    receiver.process_packet(2000, &buffer[..written]).unwrap();

    let written = sender.generate_packet(100, &mut buffer).unwrap();
    assert_eq!(
        receiver.process_packet(100, &buffer[..written]),
        Err(ErrorKind::StalePacket(100))
    );
    assert_eq!(receiver.counters().packets_stale, 1);
    assert_eq!(receiver.counters().packets_processed, 1);
    assert!(receiver.error().is_none());
}

#[test]
fn test_unreliable_drops_silently_under_loss() {
    let mut pair = Pair::new(unreliable_config());

    let mut received = Vec::new();
    for value in 0..100u32 {
        pair.send_numbered(0, value);
        // One tick per message keeps each send in its own packet; drop every
        // other a->b packet.
        pair.tick(|count| count % 2 == 0);
        received.extend(pair.drain_b(0));
    }
    for _ in 0..10 {
        pair.tick(|count| count % 2 == 0);
        received.extend(pair.drain_b(0));
    }

    // A subset arrived, nothing was retransmitted, order of survivors held.
    assert!(received.len() <= 100);
    assert!(!received.is_empty());
    assert!(received.windows(2).all(|w| w[0] < w[1]), "survivor order broken: {received:?}");
}

#[test]
fn test_budget_exhaustion_is_siloed_per_connection() {
    let starving = TestFactory::with_limit(256);
    let healthy = TestFactory::unlimited();

    // Exhaust the starving factory.
    let mut held = Vec::new();
    while let Some(message) = starving.create(TYPE_NUMBERED) {
        held.push(message);
    }
    assert!(starving.create(TYPE_NUMBERED).is_none());

    // The healthy factory is unaffected.
    assert!(healthy.create(TYPE_NUMBERED).is_some());
    assert!(healthy.budget().remaining() > 0);

    // Releasing the starving connection's messages restores its own silo.
    held.clear();
    assert!(starving.create(TYPE_NUMBERED).is_some());
}

#[test]
fn test_oversized_block_errors_the_connection() {
    // Both sides agree on config where max_block_size is not a multiple of
    // the fragment size, so a crafted full-size final fragment overflows it.
    let mut config = reliable_config();
    config.channels[0].block_fragment_size = 1024;
    config.channels[0].max_block_size = 1500; // two fragments allowed

    let factory = TestFactory::unlimited();
    let time = Instant::now();
    let mut receiver = Connection::new(TestFactory::unlimited(), config.clone(), time).unwrap();

    for fragment_id in 0..2u16 {
        let header = (fragment_id == 0).then(|| {
            let header = factory.create(TYPE_BLOB).unwrap();
            header.borrow_mut().assign_id(0);
            header
        });
        let mut packet = packmux_connection::ConnectionPacket::new();
        packet
            .install_entries(
                factory.as_ref(),
                vec![packmux_connection::ChannelPacketData {
                    channel_id: 0,
                    failed_to_serialize: false,
                    payload: packmux_connection::ChannelPayload::Fragment(
                        packmux_connection::FragmentData {
                            message_id: 0,
                            fragment_id,
                            num_fragments: 2,
                            data: vec![0x5A; 1024], // full-size final fragment
                            header,
                        },
                    ),
                }],
            )
            .unwrap();

        let mut stream = WriteStream::new(1500);
        packet.serialize(&mut stream, factory.as_ref(), &config).unwrap();
        stream.serialize_check().unwrap();
        let bytes = stream.finish();
        let _ = receiver.process_packet(fragment_id, &bytes);
    }

    // The declared 2048-byte block exceeds the 1500-byte maximum; the
    // channel desyncs and the connection refuses further generation.
    receiver.advance_time(time + Duration::from_millis(50));
    assert_eq!(receiver.error(), Some(ErrorKind::ChannelDesync(0)));
    let mut buffer = [0u8; 1500];
    assert_eq!(
        receiver.generate_packet(0, &mut buffer),
        Err(ErrorKind::ConnectionErrored)
    );
    assert!(receiver.receive_message(0).is_none());
}

#[test]
fn test_two_channels_multiplex_independently() {
    let config = ConnectionConfig {
        channels: vec![
            ChannelConfig::new(ChannelKind::ReliableOrdered),
            ChannelConfig::new(ChannelKind::UnreliableUnordered),
        ],
        ..ConnectionConfig::default()
    };
    let mut pair = Pair::new(config);

    for value in 0..10u32 {
        pair.send_numbered(0, value);
        pair.send_numbered(1, value + 1000);
    }

    let mut reliable = Vec::new();
    let mut unreliable = Vec::new();
    for _ in 0..20 {
        pair.tick(|_| true);
        reliable.extend(pair.drain_b(0));
        while let Some(message) = pair.b.receive_message(1) {
            unreliable.push(message.borrow().body_as::<Numbered>().unwrap().value);
        }
    }

    assert_eq!(reliable, (0..10).collect::<Vec<u32>>());
    assert_eq!(unreliable, (1000..1010).collect::<Vec<u32>>());
}
