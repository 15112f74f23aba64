use tidelink_serde::{BitReader, BitWrite, Serde, SerdeErr};

/// Number of per-packet delivered/lost decisions a notify header can carry
pub const HISTORY_LENGTH: u32 = 32;

/// A bounded bit history of delivered/lost decisions for received packets.
/// Bit 0 describes the most recently recorded sequence, bit k the sequence
/// k steps before it. Older decisions fall off the end; the connection must
/// flush before more than HISTORY_LENGTH decisions accumulate unsent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SequenceHistory {
    word: u32,
}

impl SequenceHistory {
    pub fn new() -> Self {
        Self { word: 0 }
    }

    pub fn from_word(word: u32) -> Self {
        Self { word }
    }

    pub fn word(&self) -> u32 {
        self.word
    }

    /// Records the decision for the next sequence, aging every prior entry
    pub fn push(&mut self, delivered: bool) {
        self.word = (self.word << 1) | u32::from(delivered);
    }

    /// Whether the sequence `index` steps behind the most recent one was
    /// delivered. Anything beyond the window reads as lost.
    pub fn is_delivered(&self, index: u32) -> bool {
        if index >= HISTORY_LENGTH {
            return false;
        }
        (self.word >> index) & 1 != 0
    }
}

impl Serde for SequenceHistory {
    fn ser(&self, writer: &mut dyn BitWrite) {
        self.word.ser(writer);
    }

    fn de(reader: &mut BitReader) -> Result<Self, SerdeErr> {
        Ok(Self {
            word: u32::de(reader)?,
        })
    }

    fn bit_length(&self) -> u32 {
        HISTORY_LENGTH
    }
}
