//! Per-connection packet counters.

/// Counts packet-level events on a connection.
///
/// Stale counts in particular are the observable side of the
/// received-window floor: packets arriving below it are dropped without
/// touching channel state.
#[derive(Debug, Clone, Default)]
pub struct ConnectionCounters {
    /// Packets produced by `generate_packet`.
    pub packets_generated: u64,
    /// Received packets that parsed and were dispatched to channels.
    pub packets_processed: u64,
    /// Sent packet sequences confirmed by the peer's acks.
    pub packets_acked: u64,
    /// Received packets dropped as stale or duplicate.
    pub packets_stale: u64,
}

impl ConnectionCounters {
    /// Resets all counters to zero.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
