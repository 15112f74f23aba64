use tidelink_serde::{
    BitReader, BitWrite, Serde, SerdeErr, UnsignedInteger, UnsignedVariableInteger,
};

use crate::{
    channels::channel::ChannelName,
    constants::{BUNCH_SIZE_BITS, CHSEQUENCE_BITS},
    types::{ChannelIndex, PacketIndex},
};

/// Why a channel is being closed, carried in the close bunch so the remote
/// side can distinguish teardown from dormancy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    Destroyed,
    Dormancy,
    Error,
}

impl Serde for CloseReason {
    fn ser(&self, writer: &mut dyn BitWrite) {
        let index: u8 = match self {
            CloseReason::Destroyed => 0,
            CloseReason::Dormancy => 1,
            CloseReason::Error => 2,
        };
        UnsignedInteger::<2>::new(index).ser(writer);
    }

    fn de(reader: &mut BitReader) -> Result<Self, SerdeErr> {
        match UnsignedInteger::<2>::de(reader)?.get() {
            0 => Ok(CloseReason::Destroyed),
            1 => Ok(CloseReason::Dormancy),
            2 => Ok(CloseReason::Error),
            _ => Err(SerdeErr),
        }
    }

    fn bit_length(&self) -> u32 {
        2
    }
}

/// The framed header preceding every bunch payload on the wire.
///
/// Serialized layout:
/// `[control][open?][close?][closeReason?][replicationPaused][reliable]
///  [channelIndex(packed)][hasPackageMapExports][hasMustBeMappedGUIDs]
///  [partial][reliableSeq?][partialInitial?][partialFinal?][channelName?]
///  [payloadBitLength]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BunchHeader {
    pub open: bool,
    pub close: bool,
    pub close_reason: CloseReason,
    pub replication_paused: bool,
    pub reliable: bool,
    pub channel_index: ChannelIndex,
    pub has_package_map_exports: bool,
    pub has_must_be_mapped_guids: bool,
    pub partial: bool,
    pub partial_initial: bool,
    pub partial_final: bool,
    /// Reliable sequence wrapped to the channel sequence span; only on the
    /// wire when `reliable`
    pub wrapped_reliable_seq: u16,
    /// Present when the bunch is reliable or opens the channel
    pub channel_name: Option<ChannelName>,
    pub payload_bits: u32,
}

impl Default for BunchHeader {
    fn default() -> Self {
        Self {
            open: false,
            close: false,
            close_reason: CloseReason::Destroyed,
            replication_paused: false,
            reliable: false,
            channel_index: 0,
            has_package_map_exports: false,
            has_must_be_mapped_guids: false,
            partial: false,
            partial_initial: false,
            partial_final: false,
            wrapped_reliable_seq: 0,
            channel_name: None,
            payload_bits: 0,
        }
    }
}

impl Serde for BunchHeader {
    fn ser(&self, writer: &mut dyn BitWrite) {
        let control = self.open || self.close;
        control.ser(writer);
        if control {
            self.open.ser(writer);
            self.close.ser(writer);
            if self.close {
                self.close_reason.ser(writer);
            }
        }
        self.replication_paused.ser(writer);
        self.reliable.ser(writer);
        UnsignedVariableInteger::<4>::new(u64::from(self.channel_index)).ser(writer);
        self.has_package_map_exports.ser(writer);
        self.has_must_be_mapped_guids.ser(writer);
        self.partial.ser(writer);
        if self.reliable {
            UnsignedInteger::<CHSEQUENCE_BITS>::new(self.wrapped_reliable_seq).ser(writer);
        }
        if self.partial {
            self.partial_initial.ser(writer);
            self.partial_final.ser(writer);
        }
        if self.reliable || self.open {
            // a bunch that can create a channel must carry the name
            self.channel_name
                .unwrap_or(ChannelName::Control)
                .ser(writer);
        }
        UnsignedInteger::<BUNCH_SIZE_BITS>::new(self.payload_bits).ser(writer);
    }

    fn de(reader: &mut BitReader) -> Result<Self, SerdeErr> {
        let control = bool::de(reader)?;
        let open = if control { bool::de(reader)? } else { false };
        let close = if control { bool::de(reader)? } else { false };
        let close_reason = if close {
            CloseReason::de(reader)?
        } else {
            CloseReason::Destroyed
        };
        let replication_paused = bool::de(reader)?;
        let reliable = bool::de(reader)?;
        let channel_index = UnsignedVariableInteger::<4>::de(reader)?.get();
        if channel_index > u64::from(u32::MAX) {
            return Err(SerdeErr);
        }
        let has_package_map_exports = bool::de(reader)?;
        let has_must_be_mapped_guids = bool::de(reader)?;
        let partial = bool::de(reader)?;
        let wrapped_reliable_seq = if reliable {
            UnsignedInteger::<CHSEQUENCE_BITS>::de(reader)?.get() as u16
        } else {
            0
        };
        let partial_initial = if partial { bool::de(reader)? } else { false };
        let partial_final = if partial { bool::de(reader)? } else { false };
        let channel_name = if reliable || open {
            Some(ChannelName::de(reader)?)
        } else {
            None
        };
        let payload_bits = UnsignedInteger::<BUNCH_SIZE_BITS>::de(reader)?.get() as u32;

        Ok(Self {
            open,
            close,
            close_reason,
            replication_paused,
            reliable,
            channel_index: channel_index as ChannelIndex,
            has_package_map_exports,
            has_must_be_mapped_guids,
            partial,
            partial_initial,
            partial_final,
            wrapped_reliable_seq,
            channel_name,
            payload_bits,
        })
    }

    fn bit_length(&self) -> u32 {
        let mut output = 1; // control bit
        if self.open || self.close {
            output += 2;
            if self.close {
                output += self.close_reason.bit_length();
            }
        }
        output += 2; // replication_paused + reliable
        output += UnsignedVariableInteger::<4>::new(u64::from(self.channel_index)).bit_length();
        output += 3; // exports + must-be-mapped + partial
        if self.reliable {
            output += CHSEQUENCE_BITS as u32;
        }
        if self.partial {
            output += 2;
        }
        if self.reliable || self.open {
            output += 2;
        }
        output += BUNCH_SIZE_BITS as u32;
        output
    }
}

/// A received bunch: decoded header, resolved absolute reliable sequence,
/// and the raw payload carved out of the packet
#[derive(Clone, Debug, PartialEq)]
pub struct InBunch {
    pub header: BunchHeader,
    /// Absolute reliable sequence (0 for unsequenced bunches)
    pub ch_sequence: u16,
    pub payload: Box<[u8]>,
}

/// An outgoing bunch staged in a channel's retransmission ledger until the
/// packet that carried it is acked
#[derive(Clone, Debug, PartialEq)]
pub struct OutBunch {
    pub header: BunchHeader,
    /// Absolute reliable sequence assigned by the sending channel
    pub ch_sequence: u16,
    pub payload: Box<[u8]>,
    /// Packet the bunch was last transmitted in
    pub packet_index: PacketIndex,
}
