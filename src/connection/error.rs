use thiserror::Error;

use tidelink_serde::SerdeErr;

use crate::{
    channels::channel_table::ChannelTableError,
    connection::{channel_record::ChannelRecordError, packet_notify::PacketNotifyError},
    types::{ChannelIndex, PacketIndex},
};

/// A violation of the wire protocol by the remote peer. Every variant closes
/// the connection immediately; adversarial or corrupted packets must never
/// be silently accepted (SECURITY boundary).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    /// Packet was empty or its trailing padding carried no termination
    /// marker bit
    #[error("Packet of {byte_len} bytes has no valid termination marker. Truncated, corrupted or forged packet")]
    MalformedPacket { byte_len: usize },

    /// The packet notify header could not be decoded
    #[error("Failed to read packet notify header. Malformed or malicious packet")]
    MalformedNotifyHeader,

    /// The peer's ack data references sequences that were never sent
    #[error("Invalid ack data: {0}")]
    InvalidAckData(#[from] PacketNotifyError),

    /// A bunch header could not be decoded
    #[error("Bunch header overflowed the packet. Malformed or malicious packet")]
    MalformedBunchHeader,

    /// A bunch addressed a channel index beyond the configured table size
    #[error("Bunch channel index {channel_index} exceeds the channel limit {max_channels}")]
    ChannelIndexOutOfBounds {
        channel_index: ChannelIndex,
        max_channels: u32,
    },

    /// A bunch named a different channel type than the channel existing at
    /// that index
    #[error("Existing channel at index {channel_index} is {existing}, but the incoming bunch expects {incoming}")]
    ChannelNameMismatch {
        channel_index: ChannelIndex,
        existing: &'static str,
        incoming: &'static str,
    },

    /// A bunch claimed more payload bits than remain in the packet
    #[error("Bunch claims {claimed_bits} payload bits but only {remaining_bits} remain in the packet")]
    BunchDataOverflow {
        claimed_bits: u32,
        remaining_bits: u32,
    },

    /// Data arrived for a non-control channel before the control channel
    /// was opened
    #[error("Received a bunch for channel {channel_index} before the control channel was created")]
    BunchBeforeControlChannel { channel_index: ChannelIndex },

    /// The control channel was closed before it was ever opened
    #[error("Received control channel close before open")]
    ControlChannelCloseBeforeOpen,

    /// Partial-bunch reassembly rules were broken
    #[error("Malformed partial bunch on channel {channel_index}: {reason}")]
    MalformedPartialBunch {
        channel_index: ChannelIndex,
        reason: &'static str,
    },

    /// A packet-handler stage rejected the payload
    #[error("Packet handler stage rejected an incoming packet: {reason}")]
    HandlerRejected { reason: &'static str },
}

/// Why a connection reached the Closed state. Reported to the owner exactly
/// once, through the event queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// The owner requested the close
    Requested,
    /// No packet arrived within the configured timeout
    Timeout,
    /// The peer violated the protocol
    Violation(ProtocolViolation),
    /// An internal bookkeeping invariant broke; closing is the only safe
    /// response
    InternalError(ChannelRecordError),
    /// Sustained rate of rejected operations crossed the abuse threshold
    Abuse { rejected_per_second: u32 },
}

/// Errors returned by connection operations that fail locally without
/// affecting the connection's state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The connection is already closed
    #[error("Operation attempted on a closed connection")]
    Closed,

    /// The channel table refused the operation
    #[error("Channel table error: {0}")]
    ChannelTable(#[from] ChannelTableError),

    /// A channel send failed
    #[error("Send failed on channel {channel_index}: {reason}")]
    SendFailed {
        channel_index: ChannelIndex,
        reason: &'static str,
    },

    /// Serialization failed while assembling an outgoing packet
    #[error("Serialization error while assembling packet {packet_id}")]
    SerializationFailed { packet_id: PacketIndex },
}

impl From<SerdeErr> for ProtocolViolation {
    fn from(_: SerdeErr) -> Self {
        ProtocolViolation::MalformedBunchHeader
    }
}
