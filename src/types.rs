/// Identifies one transmitted packet; wraps modulo the full u16 range
pub type PacketIndex = u16;
/// Index of a logical channel within a connection's channel table
pub type ChannelIndex = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HostType {
    Server,
    Client,
}

impl HostType {
    pub fn invert(self) -> Self {
        match self {
            HostType::Server => HostType::Client,
            HostType::Client => HostType::Server,
        }
    }
}
