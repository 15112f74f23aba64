use crate::{BitReader, BitWrite, SerdeErr};

/// A type that can be serialized to and from a bit stream
pub trait Serde: Sized {
    fn ser(&self, writer: &mut dyn BitWrite);
    fn de(reader: &mut BitReader) -> Result<Self, SerdeErr>;
    fn bit_length(&self) -> u32;
}

/// A type whose serialized size never varies
pub trait ConstBitLength {
    fn const_bit_length() -> u32;
}

impl Serde for bool {
    fn ser(&self, writer: &mut dyn BitWrite) {
        writer.write_bit(*self);
    }

    fn de(reader: &mut BitReader) -> Result<Self, SerdeErr> {
        reader.read_bit()
    }

    fn bit_length(&self) -> u32 {
        <Self as ConstBitLength>::const_bit_length()
    }
}

impl ConstBitLength for bool {
    fn const_bit_length() -> u32 {
        1
    }
}

impl Serde for u8 {
    fn ser(&self, writer: &mut dyn BitWrite) {
        writer.write_byte(*self);
    }

    fn de(reader: &mut BitReader) -> Result<Self, SerdeErr> {
        reader.read_byte()
    }

    fn bit_length(&self) -> u32 {
        <Self as ConstBitLength>::const_bit_length()
    }
}

impl ConstBitLength for u8 {
    fn const_bit_length() -> u32 {
        8
    }
}

impl Serde for u16 {
    fn ser(&self, writer: &mut dyn BitWrite) {
        for byte in self.to_le_bytes() {
            writer.write_byte(byte);
        }
    }

    fn de(reader: &mut BitReader) -> Result<Self, SerdeErr> {
        let mut bytes = [0u8; 2];
        for byte in &mut bytes {
            *byte = reader.read_byte()?;
        }
        Ok(u16::from_le_bytes(bytes))
    }

    fn bit_length(&self) -> u32 {
        <Self as ConstBitLength>::const_bit_length()
    }
}

impl ConstBitLength for u16 {
    fn const_bit_length() -> u32 {
        16
    }
}

impl Serde for u32 {
    fn ser(&self, writer: &mut dyn BitWrite) {
        for byte in self.to_le_bytes() {
            writer.write_byte(byte);
        }
    }

    fn de(reader: &mut BitReader) -> Result<Self, SerdeErr> {
        let mut bytes = [0u8; 4];
        for byte in &mut bytes {
            *byte = reader.read_byte()?;
        }
        Ok(u32::from_le_bytes(bytes))
    }

    fn bit_length(&self) -> u32 {
        <Self as ConstBitLength>::const_bit_length()
    }
}

impl ConstBitLength for u32 {
    fn const_bit_length() -> u32 {
        32
    }
}

#[cfg(test)]
mod tests {
    use crate::{BitReader, BitWriter, Serde};

    #[test]
    fn primitives_round_trip() {
        let mut writer = BitWriter::new();

        true.ser(&mut writer);
        0xA5u8.ser(&mut writer);
        0xBEEFu16.ser(&mut writer);
        0xDEAD_BEEFu32.ser(&mut writer);
        false.ser(&mut writer);

        let bytes = writer.to_bytes();
        let mut reader = BitReader::new(&bytes);

        assert_eq!(bool::de(&mut reader), Ok(true));
        assert_eq!(u8::de(&mut reader), Ok(0xA5));
        assert_eq!(u16::de(&mut reader), Ok(0xBEEF));
        assert_eq!(u32::de(&mut reader), Ok(0xDEAD_BEEF));
        assert_eq!(bool::de(&mut reader), Ok(false));
    }
}
