/// Span of the per-channel reliable sequence counters. Reliable sequences
/// are written wrapped to this power-of-two range and reconstructed with
/// `make_relative` against the channel's last processed sequence.
pub const MAX_CHSEQUENCE: u16 = 1024;
/// Bits used to serialize a wrapped per-channel reliable sequence
pub const CHSEQUENCE_BITS: u8 = 10;

/// Serialized width of a packet notify header: seq + acked seq + history.
/// Constant width is a hard requirement, since the header is refreshed in
/// place after the payload has been appended.
pub const NOTIFY_HEADER_BITS: u32 = 16 + 16 + 32;

/// Bits reserved at the end of every packet for the termination marker and
/// byte-boundary padding
pub const PACKET_TRAILER_BITS: u32 = 8;

/// Bits used to serialize a bunch's payload length
pub const BUNCH_SIZE_BITS: u8 = 14;

/// Upper bound on the serialized size of one bunch header
pub const MAX_BUNCH_HEADER_BITS: u32 = 64;

/// Upper bound on bits a partial-bunch reassembly may accumulate. A sender
/// claiming more is treated as a protocol violation.
pub const MAX_PARTIAL_BUNCH_BITS: u32 = 1 << 20;
