/// Biggest packet the engine will hand to a transport, in bytes
pub const MTU_SIZE_BYTES: usize = 1472;
/// Biggest packet the engine will hand to a transport, in bits
pub const MTU_SIZE_BITS: u32 = (MTU_SIZE_BYTES as u32) * 8;

pub trait BitWrite {
    fn write_bit(&mut self, bit: bool);
    fn write_byte(&mut self, byte: u8);
    fn count_bits(&mut self, bits: u32);
    fn is_counter(&self) -> bool;
}

/// A bit-level writer with a bounded buffer, used to assemble outgoing
/// packets. Bits are packed LSB-first within each byte, matching BitReader.
#[derive(Debug, PartialEq)]
pub struct BitWriter {
    scratch: u8,
    scratch_index: u8,
    buffer: Vec<u8>,
    bits_written: u32,
    max_bits: u32,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::with_max_bits(MTU_SIZE_BITS)
    }

    /// A writer allowed to grow beyond MTU size, for staging data that will
    /// be fragmented before it reaches the wire.
    pub fn with_max_bits(max_bits: u32) -> Self {
        Self {
            scratch: 0,
            scratch_index: 0,
            buffer: Vec::with_capacity(MTU_SIZE_BYTES),
            bits_written: 0,
            max_bits,
        }
    }

    pub fn bits_written(&self) -> u32 {
        self.bits_written
    }

    /// Bits that may still be written before hitting the configured maximum
    pub fn bits_free(&self) -> u32 {
        self.max_bits - self.bits_written
    }

    /// Appends `bit_count` bits out of `bytes` (LSB-first per byte)
    pub fn write_bits(&mut self, bytes: &[u8], bit_count: u32) {
        let mut remaining = bit_count;
        for byte in bytes {
            if remaining == 0 {
                break;
            }
            let mut temp = *byte;
            let chunk = remaining.min(8);
            for _ in 0..chunk {
                self.write_bit(temp & 1 != 0);
                temp >>= 1;
            }
            remaining -= chunk;
        }
    }

    fn flush_scratch(&mut self) {
        if self.scratch_index > 0 {
            let byte = (self.scratch << (8 - self.scratch_index)).reverse_bits();
            self.buffer.push(byte);
            self.scratch = 0;
            self.scratch_index = 0;
        }
    }

    pub fn to_bytes(mut self) -> Box<[u8]> {
        self.flush_scratch();
        self.buffer.into_boxed_slice()
    }

    /// Finalizes a wire packet: appends the termination marker bit, then
    /// zero-pads to a byte boundary. BitReader::from_packet reverses this.
    pub fn to_packet(mut self) -> Box<[u8]> {
        self.write_bit(true);
        self.flush_scratch();
        self.buffer.into_boxed_slice()
    }

    /// Overwrites the first `bytes.len()` flushed bytes in place. Used to
    /// refresh a packet header after the payload has been appended; the
    /// replacement must serialize to exactly the same bit width as the
    /// original header.
    pub fn overwrite_front_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.buffer.len());
        self.buffer[..bytes.len()].copy_from_slice(bytes);
    }
}

impl BitWrite for BitWriter {
    fn write_bit(&mut self, bit: bool) {
        debug_assert!(
            self.bits_written < self.max_bits,
            "BitWriter overflowed its maximum of {} bits",
            self.max_bits
        );

        self.scratch <<= 1;

        if bit {
            self.scratch |= 1;
        }

        self.scratch_index += 1;
        self.bits_written += 1;

        if self.scratch_index >= 8 {
            self.buffer.push(self.scratch.reverse_bits());
            self.scratch_index = 0;
            self.scratch = 0;
        }
    }

    fn write_byte(&mut self, byte: u8) {
        let mut temp = byte;
        for _ in 0..8 {
            self.write_bit(temp & 1 != 0);
            temp >>= 1;
        }
    }

    fn count_bits(&mut self, _bits: u32) {
        // real writers write, only BitCounter counts
    }

    fn is_counter(&self) -> bool {
        false
    }
}

/// A BitWrite implementation that measures serialized size without storing
/// anything, used for will-it-fit checks before committing to a buffer.
pub struct BitCounter {
    bits: u32,
    max_bits: u32,
}

impl BitCounter {
    pub fn new(max_bits: u32) -> Self {
        Self { bits: 0, max_bits }
    }

    pub fn bits_needed(&self) -> u32 {
        self.bits
    }

    pub fn overflowed(&self) -> bool {
        self.bits > self.max_bits
    }
}

impl BitWrite for BitCounter {
    fn write_bit(&mut self, _bit: bool) {
        self.bits += 1;
    }

    fn write_byte(&mut self, _byte: u8) {
        self.bits += 8;
    }

    fn count_bits(&mut self, bits: u32) {
        self.bits += bits;
    }

    fn is_counter(&self) -> bool {
        true
    }
}
