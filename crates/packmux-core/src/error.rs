use thiserror::Error;

/// Errors surfaced by the connection layer.
///
/// Recoverable kinds (`SendQueueFull`, `StalePacket`, `SerializeFailure`)
/// leave the connection usable; the rest are terminal until
/// `Connection::reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    /// The reliable send queue has no free slot for the next message id.
    /// Retry after acks drain the queue.
    #[error("channel send queue is full")]
    SendQueueFull,

    /// The connection's memory budget was exhausted while allocating.
    #[error("memory budget exhausted")]
    OutOfMemory,

    /// A received packet's sequence number fell below the received-packet
    /// window, or duplicated a sequence already processed.
    #[error("stale packet sequence {0}")]
    StalePacket(u16),

    /// A received packet failed to deserialize. The packet is dropped;
    /// the connection continues.
    #[error("packet failed to deserialize")]
    SerializeFailure,

    /// A channel observed protocol corruption (receive window violation,
    /// fragment index out of range, oversized block). Terminal.
    #[error("channel {0} desynced")]
    ChannelDesync(u8),

    /// The connection is in an errored state and refuses packet generation.
    #[error("connection is in an errored state")]
    ConnectionErrored,

    /// A channel id outside the configured range was used.
    #[error("invalid channel id {0}")]
    InvalidChannel(u8),

    /// Block messages are not supported on this channel type.
    #[error("channel does not support block messages")]
    BlocksNotAllowed,

    /// A configuration invariant does not hold.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(&'static str),
}

/// Terminal per-channel error states.
///
/// Once set, a channel stops producing and consuming packet data; the owning
/// connection observes the state on its next `advance_time` and transitions
/// to errored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelErrorKind {
    /// The peer sent data that violates the protocol: a message id beyond
    /// the receive window, an out-of-range fragment, or a block larger than
    /// the configured maximum.
    #[error("desync")]
    Desync,

    /// The memory budget was exhausted while buffering received data.
    #[error("out of memory")]
    OutOfMemory,
}
