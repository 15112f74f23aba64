use crate::SerdeErr;

/// A bounds-checked bit-level reader over a received buffer. Bits are read
/// LSB-first within each byte, matching BitWriter. Every read past the end
/// of the buffer returns an error; incoming packets are untrusted.
pub struct BitReader<'b> {
    buffer: &'b [u8],
    byte_index: usize,
    scratch: u8,
    scratch_index: u8,
    bits_read: u32,
    bit_limit: u32,
}

impl<'b> BitReader<'b> {
    pub fn new(buffer: &'b [u8]) -> Self {
        Self {
            buffer,
            byte_index: 0,
            scratch: 0,
            scratch_index: 0,
            bits_read: 0,
            bit_limit: (buffer.len() as u32) * 8,
        }
    }

    /// Strips and validates the packet termination marker written by
    /// BitWriter::to_packet. Rejects empty packets and packets whose
    /// trailing padding carries no marker bit, which is the first line of
    /// defense against truncated or forged input.
    pub fn from_packet(buffer: &'b [u8]) -> Result<Self, SerdeErr> {
        let Some(last_nonzero) = buffer.iter().rposition(|byte| *byte != 0) else {
            return Err(SerdeErr);
        };

        // The terminator is the last-written bit of the final in-use byte,
        // which with LSB-first packing is its highest set bit.
        let marker_bit = 7 - buffer[last_nonzero].leading_zeros();
        let payload_bits = (last_nonzero as u32) * 8 + marker_bit;

        let mut reader = Self::new(buffer);
        reader.bit_limit = payload_bits;
        Ok(reader)
    }

    pub fn bits_remaining(&self) -> u32 {
        self.bit_limit - self.bits_read
    }

    pub fn read_bit(&mut self) -> Result<bool, SerdeErr> {
        if self.bits_read >= self.bit_limit {
            return Err(SerdeErr);
        }

        if self.scratch_index == 0 {
            self.scratch = self.buffer[self.byte_index];
            self.byte_index += 1;
            self.scratch_index = 8;
        }

        let bit = self.scratch & 1 != 0;
        self.scratch >>= 1;
        self.scratch_index -= 1;
        self.bits_read += 1;
        Ok(bit)
    }

    pub fn read_byte(&mut self) -> Result<u8, SerdeErr> {
        let mut output: u8 = 0;
        for index in 0..8 {
            if self.read_bit()? {
                output |= 1 << index;
            }
        }
        Ok(output)
    }

    /// Copies the next `bit_count` bits into an owned buffer, zero-padding
    /// the final byte. Used to carve a bunch payload out of a packet.
    pub fn read_bits_to_boxed(&mut self, bit_count: u32) -> Result<Box<[u8]>, SerdeErr> {
        if bit_count > self.bits_remaining() {
            return Err(SerdeErr);
        }

        let byte_len = ((bit_count + 7) / 8) as usize;
        let mut output = vec![0u8; byte_len];
        for bit in 0..bit_count {
            if self.read_bit()? {
                output[(bit / 8) as usize] |= 1 << (bit % 8);
            }
        }
        Ok(output.into_boxed_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BitWrite, BitWriter};

    #[test]
    fn read_back_bytes() {
        let mut writer = BitWriter::new();
        writer.write_byte(0x12);
        writer.write_byte(0xFE);
        let bytes = writer.to_bytes();

        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read_byte(), Ok(0x12));
        assert_eq!(reader.read_byte(), Ok(0xFE));
        assert!(reader.read_byte().is_err());
    }

    #[test]
    fn zero_length_packet_rejected() {
        assert!(BitReader::from_packet(&[]).is_err());
    }

    #[test]
    fn all_zero_packet_rejected() {
        assert!(BitReader::from_packet(&[0, 0, 0]).is_err());
    }

    #[test]
    fn carve_out_payload() {
        let mut writer = BitWriter::new();
        writer.write_byte(0xAB);
        writer.write_bit(true);
        writer.write_bit(true);
        let bytes = writer.to_bytes();

        let mut reader = BitReader::new(&bytes);
        let payload = reader.read_bits_to_boxed(10).expect("10 bits available");
        assert_eq!(payload.len(), 2);
        assert_eq!(payload[0], 0xAB);
        assert_eq!(payload[1], 0b0000_0011);
        assert!(reader.read_bits_to_boxed(8).is_err());
    }
}
