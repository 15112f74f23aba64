use crate::{channels::channel::ChannelName, connection::error::CloseCause, types::ChannelIndex};

/// Events surfaced to the connection's owner: lifecycle transitions,
/// channel open/close notifications and reassembled channel payloads.
/// Drained via `Connection::take_events`.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The control channel confirmed the peer; the connection is Open
    Opened,
    /// The connection reached its terminal state. Emitted exactly once.
    Closed { cause: CloseCause },
    /// A channel finished its open handshake
    ChannelOpened {
        channel_index: ChannelIndex,
        name: ChannelName,
    },
    /// A channel was closed, locally or by the peer
    ChannelClosed { channel_index: ChannelIndex },
    /// A fully reassembled message for the application layer
    Bunch {
        channel_index: ChannelIndex,
        payload: Box<[u8]>,
        payload_bits: u32,
    },
}
