#![warn(missing_docs)]

//! Packmux: a small public API facade for the workspace.
//!
//! This crate provides a clean, stable surface that re-exports the most
//! commonly used types for multiplexing message streams over an unreliable
//! datagram transport:
//!
//! - Connection and configuration (`Connection`, `ConnectionConfig`,
//!   `ChannelConfig`, `ChannelKind`)
//! - The message model (`Message`, `MessageBody`, `MessageFactory`,
//!   `MessageRef`, `BlockBuffer`)
//! - Serialization streams for message schemas (`Stream` and helpers)
//! - Errors and counters (`ErrorKind`, `ConnectionCounters`)
//!
//! Example
//! ```
//! use std::{rc::Rc, time::Instant};
//! use packmux::{
//!     Connection, ConnectionConfig, MemoryBudget, MessageBody, MessageFactory, Stream,
//!     StreamError,
//! };
//!
//! #[derive(Debug, Default)]
//! struct Hello {
//!     value: u32,
//! }
//!
//! impl MessageBody for Hello {
//!     fn serialize(&mut self, stream: &mut dyn Stream) -> Result<(), StreamError> {
//!         packmux::serialize_u32(stream, &mut self.value)
//!     }
//!     fn as_any(&self) -> &dyn std::any::Any {
//!         self
//!     }
//! }
//!
//! struct Schema {
//!     budget: Rc<MemoryBudget>,
//! }
//!
//! impl MessageFactory for Schema {
//!     fn create_body(&self, message_type: u8) -> Option<Box<dyn MessageBody>> {
//!         (message_type == 0).then(|| Box::<Hello>::default() as Box<dyn MessageBody>)
//!     }
//!     fn num_types(&self) -> u8 {
//!         1
//!     }
//!     fn budget(&self) -> &Rc<MemoryBudget> {
//!         &self.budget
//!     }
//! }
//!
//! let factory = Rc::new(Schema { budget: Rc::new(MemoryBudget::unlimited()) });
//! let mut connection =
//!     Connection::new(factory.clone(), ConnectionConfig::default(), Instant::now()).unwrap();
//!
//! let message = factory.create(0).unwrap();
//! connection.send_message(0, message).unwrap();
//!
//! let mut buffer = [0u8; 1200];
//! let written = connection.generate_packet(0, &mut buffer).unwrap();
//! assert!(written > 0);
//! ```

// Core configuration, errors, and memory accounting
pub use packmux_core::{
    budget::MemoryBudget,
    config::{ChannelConfig, ChannelKind, ConnectionConfig},
    constants,
    error::{ChannelErrorKind, ErrorKind},
};
// Serialization and the message model
pub use packmux_protocol::{
    bits_required, serialize_bool, serialize_bytes, serialize_int, serialize_u16, serialize_u32,
    BlockBuffer, MeasureStream, Message, MessageBody, MessageFactory, MessageRef, ReadStream,
    Stream, StreamError, WriteStream,
};
// Connection layer
pub use packmux_connection::{Channel, Connection, ConnectionCounters};

/// Convenience prelude with the most commonly used items.
pub mod prelude {
    pub use crate::{
        BlockBuffer, ChannelConfig, ChannelKind, Connection, ConnectionConfig, ErrorKind,
        MemoryBudget, Message, MessageBody, MessageFactory, MessageRef, Stream, StreamError,
    };
}
