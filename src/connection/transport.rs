/// Flags describing an outgoing packet, carried to the transport for
/// instrumentation only; they never change what is sent
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketTraits {
    /// The packet carries no bunch data, only acks/keep-alive
    pub is_keep_alive: bool,
}

/// The transport collaborator: a best-effort, unordered, lossy UDP-like
/// send primitive. The engine never assumes delivery.
pub trait Transport {
    fn low_level_send(&mut self, bytes: &[u8], bit_count: u32, traits: PacketTraits);
}

/// A transport that collects sent packets, used by tests and by offline
/// record/replay owners
#[derive(Default)]
pub struct BufferedTransport {
    sent: Vec<(Box<[u8]>, u32, PacketTraits)>,
}

impl BufferedTransport {
    pub fn new() -> Self {
        Self { sent: Vec::new() }
    }

    pub fn take_sent(&mut self) -> Vec<(Box<[u8]>, u32, PacketTraits)> {
        std::mem::take(&mut self.sent)
    }

    pub fn sent_count(&self) -> usize {
        self.sent.len()
    }
}

impl Transport for BufferedTransport {
    fn low_level_send(&mut self, bytes: &[u8], bit_count: u32, traits: PacketTraits) {
        self.sent.push((bytes.into(), bit_count, traits));
    }
}
