//! # Tidelink
//! A per-peer connection protocol engine: turns unreliable, unordered
//! packets into ordered, reliable, partially-reliable logical channels,
//! and back. Packet acknowledgment uses a compact bit-history window;
//! out-of-order packets are cached and replayed in sequence; oversized
//! messages are fragmented into partial bunches and reassembled.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

pub use tidelink_serde::{
    BitCounter, BitReader, BitWrite, BitWriter, ConstBitLength, Serde, SerdeErr, UnsignedInteger,
    UnsignedVariableInteger, MTU_SIZE_BITS, MTU_SIZE_BYTES,
};

mod channels;
mod connection;
mod constants;
mod timer;
mod types;
mod wrapping_number;

pub use channels::{
    bunch::{BunchHeader, CloseReason, InBunch, OutBunch},
    channel::{Channel, ChannelName, ChannelPermissions, ChannelSignal},
    channel_table::{ChannelTable, ChannelTableError, CONTROL_CHANNEL_INDEX},
};
pub use connection::{
    channel_record::{ChannelRecord, ChannelRecordError},
    config::{ConnectionConfig, OrderCorrectionConfig},
    connection::{Connection, ConnectionState},
    error::{CloseCause, ConnectionError, ProtocolViolation},
    events::ConnectionEvent,
    handler::{HandlerPipeline, PacketHandler},
    packet_notify::{PacketNotify, PacketNotifyError, PacketNotifyHeader},
    packet_order_cache::PacketOrderCache,
    sequence_history::{SequenceHistory, HISTORY_LENGTH},
    transport::{BufferedTransport, PacketTraits, Transport},
};
pub use constants::{CHSEQUENCE_BITS, MAX_CHSEQUENCE};
pub use timer::Timer;
pub use types::{ChannelIndex, HostType, PacketIndex};
pub use wrapping_number::{
    make_relative, sequence_greater_than, sequence_less_than, wrapping_diff,
};
