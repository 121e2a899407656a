use std::time::Duration;

use crate::{constants::MAX_CHANNELS, error::ErrorKind};

/// Delivery guarantee provided by a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    /// Exactly-once, in-order delivery with retransmission; supports block
    /// messages larger than a single packet.
    ReliableOrdered,
    /// Best-effort per-packet batching; messages are never retransmitted
    /// and arrive in whatever order packets survive.
    UnreliableUnordered,
}

/// Configuration for a single channel.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Delivery guarantee for this channel.
    pub kind: ChannelKind,
    /// Number of send queue slots. Must be a power of two.
    pub send_queue_size: u16,
    /// Number of receive queue slots. Must be a power of two.
    pub receive_queue_size: u16,
    /// Upper bound on messages packed into one packet for this channel.
    pub max_messages_per_packet: u16,
    /// Per-packet bit budget for this channel. Zero means no per-channel cap
    /// beyond the packet's remaining space.
    pub packet_budget_bits: u32,
    /// Minimum interval before an unacked message is sent again.
    pub message_resend_time: Duration,
    /// Size of each block fragment in bytes.
    pub block_fragment_size: u16,
    /// Largest block message accepted, in bytes.
    pub max_block_size: u32,
    /// Minimum interval before an unacked block fragment is sent again.
    pub fragment_resend_time: Duration,
}

impl ChannelConfig {
    /// Creates a config of the given kind with default tuning.
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            send_queue_size: 1024,
            receive_queue_size: 1024,
            max_messages_per_packet: 64,
            packet_budget_bits: 0,
            message_resend_time: Duration::from_millis(100),
            block_fragment_size: 1024,
            max_block_size: 256 * 1024,
            fragment_resend_time: Duration::from_millis(250),
        }
    }

    /// Number of fragments the largest accepted block splits into.
    pub fn max_fragments(&self) -> u16 {
        let fragment = self.block_fragment_size as u32;
        ((self.max_block_size + fragment - 1) / fragment) as u16
    }

    /// Checks the configuration invariants.
    pub fn validate(&self) -> Result<(), ErrorKind> {
        if self.send_queue_size == 0 || !self.send_queue_size.is_power_of_two() {
            return Err(ErrorKind::InvalidConfiguration(
                "send_queue_size must be a nonzero power of two",
            ));
        }
        if self.receive_queue_size == 0 || !self.receive_queue_size.is_power_of_two() {
            return Err(ErrorKind::InvalidConfiguration(
                "receive_queue_size must be a nonzero power of two",
            ));
        }
        if self.max_messages_per_packet == 0 {
            return Err(ErrorKind::InvalidConfiguration("max_messages_per_packet must be nonzero"));
        }
        if self.max_block_size == 0 {
            return Err(ErrorKind::InvalidConfiguration("max_block_size must be nonzero"));
        }
        if self.block_fragment_size == 0 {
            return Err(ErrorKind::InvalidConfiguration("block_fragment_size must be nonzero"));
        }
        Ok(())
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new(ChannelKind::ReliableOrdered)
    }
}

/// Configuration for a connection and its channels.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Largest packet `generate_packet` may produce, in bytes. Expected to
    /// sit at or below the transport MTU.
    pub max_packet_size: usize,
    /// Per-channel configuration; the index is the channel id.
    pub channels: Vec<ChannelConfig>,
    /// Window of sent packet sequences tracked for acks. 65536 must divide
    /// evenly by this so wrap arithmetic is exact.
    pub sent_packets_window: u16,
    /// Window of received packet sequences tracked for ack generation and
    /// stale rejection. Same divisibility requirement.
    pub received_packets_window: u16,
}

impl ConnectionConfig {
    /// Number of configured channels.
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Checks the configuration invariants, including each channel's.
    pub fn validate(&self) -> Result<(), ErrorKind> {
        if self.channels.is_empty() || self.channels.len() > MAX_CHANNELS {
            return Err(ErrorKind::InvalidConfiguration("channel count must be in 1..=64"));
        }
        if self.max_packet_size == 0 {
            return Err(ErrorKind::InvalidConfiguration("max_packet_size must be nonzero"));
        }
        for window in [self.sent_packets_window, self.received_packets_window] {
            if window == 0 || 65536 % window as u32 != 0 {
                return Err(ErrorKind::InvalidConfiguration(
                    "packet windows must evenly divide 65536",
                ));
            }
        }
        for channel in &self.channels {
            channel.validate()?;
        }
        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_packet_size: 1200,
            channels: vec![ChannelConfig::new(ChannelKind::ReliableOrdered)],
            sent_packets_window: 1024,
            received_packets_window: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ConnectionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_queue_sizes_must_be_powers_of_two() {
        let mut config = ChannelConfig::default();
        config.send_queue_size = 1000;
        assert!(config.validate().is_err());

        config.send_queue_size = 1024;
        config.receive_queue_size = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_window_must_divide_65536() {
        let mut config = ConnectionConfig::default();
        config.sent_packets_window = 1000;
        assert!(config.validate().is_err());

        config.sent_packets_window = 256;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_channel_count_bounds() {
        let mut config = ConnectionConfig::default();
        config.channels.clear();
        assert!(config.validate().is_err());

        config.channels = vec![ChannelConfig::default(); MAX_CHANNELS + 1];
        assert!(config.validate().is_err());

        config.channels.truncate(MAX_CHANNELS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_max_fragments_rounds_up() {
        let mut config = ChannelConfig::default();
        config.max_block_size = 2500;
        config.block_fragment_size = 1024;
        assert_eq!(config.max_fragments(), 3);

        config.max_block_size = 2048;
        assert_eq!(config.max_fragments(), 2);
    }
}
