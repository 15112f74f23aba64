use crate::{BitReader, BitWrite, ConstBitLength, Serde, SerdeErr};

/// An unsigned integer serialized with a fixed number of bits
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct UnsignedInteger<const BITS: u8> {
    value: u64,
}

impl<const BITS: u8> UnsignedInteger<BITS> {
    pub fn new<T: Into<u64>>(value: T) -> Self {
        let value = value.into();
        debug_assert!(BITS > 0 && BITS <= 64, "invalid bit width");
        debug_assert!(
            BITS == 64 || value < (1u64 << BITS),
            "with {} bits, can't encode {}",
            BITS,
            value
        );
        Self { value }
    }

    pub fn get(&self) -> u64 {
        self.value
    }
}

impl<const BITS: u8> Serde for UnsignedInteger<BITS> {
    fn ser(&self, writer: &mut dyn BitWrite) {
        let mut value = self.value;
        for _ in 0..BITS {
            writer.write_bit(value & 1 != 0);
            value >>= 1;
        }
    }

    fn de(reader: &mut BitReader) -> Result<Self, SerdeErr> {
        let mut value: u64 = 0;
        for index in 0..BITS {
            if reader.read_bit()? {
                value |= 1u64 << index;
            }
        }
        Ok(Self { value })
    }

    fn bit_length(&self) -> u32 {
        Self::const_bit_length()
    }
}

impl<const BITS: u8> ConstBitLength for UnsignedInteger<BITS> {
    fn const_bit_length() -> u32 {
        BITS as u32
    }
}

/// An unsigned integer serialized in chunks of BITS, each preceded by a
/// proceed bit. Small values stay small on the wire, large values still fit.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct UnsignedVariableInteger<const BITS: u8> {
    value: u64,
}

impl<const BITS: u8> UnsignedVariableInteger<BITS> {
    pub fn new<T: Into<u64>>(value: T) -> Self {
        debug_assert!(BITS > 0 && BITS < 64, "invalid chunk width");
        Self {
            value: value.into(),
        }
    }

    pub fn get(&self) -> u64 {
        self.value
    }
}

impl<const BITS: u8> Serde for UnsignedVariableInteger<BITS> {
    fn ser(&self, writer: &mut dyn BitWrite) {
        let mut value = self.value;
        loop {
            let proceed = value >= (1u64 << BITS);
            writer.write_bit(proceed);
            for _ in 0..BITS {
                writer.write_bit(value & 1 != 0);
                value >>= 1;
            }
            if !proceed {
                return;
            }
        }
    }

    fn de(reader: &mut BitReader) -> Result<Self, SerdeErr> {
        let mut value: u64 = 0;
        let mut shift: u32 = 0;
        loop {
            let proceed = reader.read_bit()?;
            for _ in 0..BITS {
                if shift >= 64 {
                    // More chunks than a u64 can hold: malformed input
                    return Err(SerdeErr);
                }
                if reader.read_bit()? {
                    value |= 1u64 << shift;
                }
                shift += 1;
            }
            if !proceed {
                return Ok(Self { value });
            }
        }
    }

    fn bit_length(&self) -> u32 {
        let mut output: u32 = 0;
        let mut value = self.value;
        loop {
            let proceed = value >= (1u64 << BITS);
            output += 1 + BITS as u32;
            value >>= BITS;
            if !proceed {
                return output;
            }
        }
    }
}
