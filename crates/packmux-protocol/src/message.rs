//! Reference-counted messages and the message factory.
//!
//! A message is an opaque, factory-constructed unit shared between the
//! sender's in-flight queue (until acked), per-packet envelopes (until
//! serialized), and the application on handoff. Shared ownership is modeled
//! with `Rc`: cloning a [`MessageRef`] acquires a reference, dropping one
//! releases it, and a fully released message is unobservable afterward.
//!
//! Every live envelope and block buffer reserves bytes from the factory's
//! [`MemoryBudget`], the per-connection silo that keeps one client's
//! resource exhaustion from touching another's.

use std::{cell::RefCell, fmt, rc::Rc};

use packmux_core::{budget::MemoryBudget, constants::MESSAGE_ENVELOPE_CHARGE};

use crate::bitstream::{Stream, StreamError};

/// Shared handle to a message.
pub type MessageRef = Rc<RefCell<Message>>;

/// Application-defined message payload.
///
/// The single `serialize` routine runs against all three stream modes, so
/// read, write, and measure cannot drift apart. Implementations branch on
/// `stream.is_reading()` only when allocation is unavoidable.
pub trait MessageBody: fmt::Debug {
    /// Serializes the body's fields.
    fn serialize(&mut self, stream: &mut dyn Stream) -> Result<(), StreamError>;

    /// True when this message type carries a block buffer too large for a
    /// single packet. Block messages are only valid on reliable channels.
    fn is_block(&self) -> bool {
        false
    }

    /// Upcast for concrete-type recovery on receive.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Byte buffer owned by a block message, charged against the connection's
/// memory budget for its whole lifetime.
pub struct BlockBuffer {
    data: Vec<u8>,
    budget: Rc<MemoryBudget>,
}

impl BlockBuffer {
    /// Allocates a zero-filled buffer of `len` bytes, or `None` when the
    /// budget cannot cover it.
    pub fn allocate(budget: &Rc<MemoryBudget>, len: usize) -> Option<Self> {
        budget.reserve(len).then(|| Self { data: vec![0; len], budget: Rc::clone(budget) })
    }

    /// Takes ownership of `data`, charging its length to the budget.
    pub fn from_vec(budget: &Rc<MemoryBudget>, data: Vec<u8>) -> Option<Self> {
        budget.reserve(data.len()).then(|| Self { data, budget: Rc::clone(budget) })
    }

    /// Buffer length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The buffer contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// The buffer contents, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Shrinks the buffer to `len` bytes, returning the difference to the
    /// budget. Used when an over-allocated reassembly buffer learns the
    /// block's exact size. Growing is not supported; a longer `len` is a
    /// no-op.
    pub fn truncate(&mut self, len: usize) {
        if len < self.data.len() {
            self.budget.release(self.data.len() - len);
            self.data.truncate(len);
        }
    }
}

impl Drop for BlockBuffer {
    fn drop(&mut self) {
        self.budget.release(self.data.len());
    }
}

impl fmt::Debug for BlockBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockBuffer").field("len", &self.data.len()).finish()
    }
}

/// A factory-constructed message: type index, channel-assigned id, the
/// application body, and optionally an attached block buffer.
pub struct Message {
    message_type: u8,
    id: u16,
    body: Box<dyn MessageBody>,
    block: Option<BlockBuffer>,
    budget: Rc<MemoryBudget>,
}

impl Message {
    /// The factory type index this message was created with.
    pub fn message_type(&self) -> u8 {
        self.message_type
    }

    /// The message id. Zero until a reliable channel assigns one on send.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Assigns the message id. Called by the reliable channel on send and by
    /// the packet reader on receive.
    pub fn assign_id(&mut self, id: u16) {
        self.id = id;
    }

    /// True when the body declares itself a block message.
    pub fn is_block(&self) -> bool {
        self.body.is_block()
    }

    /// Runs the body's unified serialize routine against `stream`.
    pub fn serialize_body(&mut self, stream: &mut dyn Stream) -> Result<(), StreamError> {
        self.body.serialize(stream)
    }

    /// Borrows the body for concrete-type recovery.
    pub fn body(&self) -> &dyn MessageBody {
        &*self.body
    }

    /// Downcasts the body to a concrete message type.
    pub fn body_as<T: MessageBody + 'static>(&self) -> Option<&T> {
        self.body.as_any().downcast_ref::<T>()
    }

    /// Attaches a block buffer. The message owns it until detached or
    /// dropped.
    pub fn attach_block(&mut self, block: BlockBuffer) {
        debug_assert!(self.is_block(), "attaching a block to a non-block message");
        debug_assert!(self.block.is_none(), "message already owns a block");
        self.block = Some(block);
    }

    /// Detaches and returns the block buffer, if any.
    pub fn detach_block(&mut self) -> Option<BlockBuffer> {
        self.block.take()
    }

    /// Borrows the attached block buffer, if any.
    pub fn block(&self) -> Option<&BlockBuffer> {
        self.block.as_ref()
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        self.budget.release(MESSAGE_ENVELOPE_CHARGE);
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.message_type)
            .field("id", &self.id)
            .field("body", &self.body)
            .field("block", &self.block)
            .finish()
    }
}

/// Creates messages from type indices and carries the per-connection memory
/// budget.
///
/// Applications implement `create_body` to dispatch on their schema's type
/// indices; the provided `create` wraps bodies in budget-charged envelopes.
pub trait MessageFactory {
    /// Builds the body for `message_type`, or `None` for unknown types.
    fn create_body(&self, message_type: u8) -> Option<Box<dyn MessageBody>>;

    /// Number of message types in the schema. Valid types are
    /// `0..num_types`.
    fn num_types(&self) -> u8;

    /// The memory budget all allocations on this connection flow through.
    fn budget(&self) -> &Rc<MemoryBudget>;

    /// Creates a message of `message_type`, or `None` when the type is
    /// unknown or the budget is exhausted.
    fn create(&self, message_type: u8) -> Option<MessageRef> {
        if message_type >= self.num_types() {
            return None;
        }
        let body = self.create_body(message_type)?;
        let budget = Rc::clone(self.budget());
        if !budget.reserve(MESSAGE_ENVELOPE_CHARGE) {
            return None;
        }
        Some(Rc::new(RefCell::new(Message {
            message_type,
            id: 0,
            body,
            block: None,
            budget,
        })))
    }
}

impl fmt::Debug for dyn MessageFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageFactory").field("num_types", &self.num_types()).finish()
    }
}
