//! Two connections wired through a lossy in-memory link.
//!
//! Side A sends 50 numbered reliable messages; the link drops every third
//! packet, and the reliable channel retransmits until side B has delivered
//! all of them in order.
//!
//! Run with: `cargo run --example echo`

use std::{
    rc::Rc,
    time::{Duration, Instant},
};

use packmux::{
    serialize_u32, Connection, ConnectionConfig, MemoryBudget, MessageBody, MessageFactory,
    MessageRef, ReadStream, Stream, StreamError, WriteStream,
};

#[derive(Debug, Default)]
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

struct Schema {
    budget: Rc<MemoryBudget>,
}

impl Schema {
    fn new() -> Rc<Self> {
        Rc::new(Self { budget: Rc::new(MemoryBudget::unlimited()) })
    }
}

impl MessageFactory for Schema {
    fn create_body(&self, message_type: u8) -> Option<Box<dyn MessageBody>> {
        (message_type == 0).then(|| Box::<Numbered>::default() as Box<dyn MessageBody>)
    }

    fn num_types(&self) -> u8 {
        1
    }

    fn budget(&self) -> &Rc<MemoryBudget> {
        &self.budget
    }
}

fn numbered(factory: &Schema, value: u32) -> MessageRef {
    let mut encoded = WriteStream::new(8);
    let mut v = value;
    serialize_u32(&mut encoded, &mut v).unwrap();
    let bytes = encoded.finish();

    let message = factory.create(0).unwrap();
    message.borrow_mut().serialize_body(&mut ReadStream::new(&bytes)).unwrap();
    message
}

fn main() {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    let factory_a = Schema::new();
    let factory_b = Schema::new();
    let mut now = Instant::now();

    let mut a = Connection::new(factory_a.clone(), ConnectionConfig::default(), now).unwrap();
    let mut b = Connection::new(factory_b, ConnectionConfig::default(), now).unwrap();

    for value in 0..50 {
        a.send_message(0, numbered(&factory_a, value)).unwrap();
    }

    let mut buffer = [0u8; 1200];
    let mut sequence = 0u16;
    let mut delivered = Vec::new();

    while delivered.len() < 50 {
        now += Duration::from_millis(50);
        a.advance_time(now);
        b.advance_time(now);

        // a -> b, dropping every third packet.
        let written = a.generate_packet(sequence, &mut buffer).unwrap();
        if sequence % 3 != 2 {
            let _ = b.process_packet(sequence, &buffer[..written]);
        } else {
            tracing::debug!(sequence, "link dropped packet");
        }
        sequence = sequence.wrapping_add(1);

        // b -> a carries the acks back, lossless.
        let written = b.generate_packet(sequence, &mut buffer).unwrap();
        let _ = a.process_packet(sequence, &buffer[..written]);
        sequence = sequence.wrapping_add(1);

        while let Some(message) = b.receive_message(0) {
            let value = message.borrow().body_as::<Numbered>().unwrap().value;
            delivered.push(value);
        }
    }

    tracing::info!(count = delivered.len(), "all messages delivered in order");
    assert_eq!(delivered, (0..50).collect::<Vec<u32>>());
    println!("echoed {} reliable messages across a lossy link", delivered.len());
}
