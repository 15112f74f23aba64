/// One stage of the packet-handler pipeline: an opaque byte transform such
/// as encryption or compression. Stages run in order on outgoing packets
/// and in reverse order on incoming packets, strictly outside the engine's
/// own header framing: the notify header is innermost on the wire.
pub trait PacketHandler {
    /// Transforms a received buffer back into engine-readable bytes.
    /// Returning an error rejects the packet as a protocol violation.
    fn incoming(&mut self, bytes: &[u8]) -> Result<Vec<u8>, &'static str>;

    /// Transforms an assembled packet before it reaches the transport
    fn outgoing(&mut self, bytes: Vec<u8>) -> Vec<u8>;
}

/// An ordered chain of packet-handler stages
#[derive(Default)]
pub struct HandlerPipeline {
    stages: Vec<Box<dyn PacketHandler>>,
}

impl HandlerPipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn push(&mut self, stage: Box<dyn PacketHandler>) {
        self.stages.push(stage);
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn process_incoming(&mut self, bytes: &[u8]) -> Result<Vec<u8>, &'static str> {
        let mut current = bytes.to_vec();
        for stage in self.stages.iter_mut().rev() {
            current = stage.incoming(&current)?;
        }
        Ok(current)
    }

    pub fn process_outgoing(&mut self, bytes: Vec<u8>) -> Vec<u8> {
        let mut current = bytes;
        for stage in self.stages.iter_mut() {
            current = stage.outgoing(current);
        }
        current
    }
}
