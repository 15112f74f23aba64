use log::{trace, warn};

use tidelink_serde::{
    BitReader, BitWrite, BitWriter, Serde, SerdeErr, UnsignedInteger, MTU_SIZE_BITS,
};

use crate::{
    channels::bunch::{BunchHeader, CloseReason, InBunch, OutBunch},
    connection::error::{ConnectionError, ProtocolViolation},
    constants::{
        MAX_BUNCH_HEADER_BITS, MAX_CHSEQUENCE, MAX_PARTIAL_BUNCH_BITS, NOTIFY_HEADER_BITS,
        PACKET_TRAILER_BITS,
    },
    types::{ChannelIndex, HostType, PacketIndex},
    wrapping_number::sequence_greater_than,
};

/// The closed set of logical channel kinds multiplexed over a connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelName {
    Control,
    Actor,
    Voice,
}

/// What each channel kind is allowed to do. Consulted when a remote open
/// bunch asks for a channel that does not exist yet.
#[derive(Clone, Copy, Debug)]
pub struct ChannelPermissions {
    /// A client may open this channel on the server
    pub client_open: bool,
    /// The server may open this channel on a client
    pub server_open: bool,
    /// The channel wants a call every connection tick
    pub tick: bool,
}

impl ChannelName {
    pub fn permissions(&self) -> ChannelPermissions {
        match self {
            ChannelName::Control => ChannelPermissions {
                client_open: true,
                server_open: true,
                tick: true,
            },
            // actor channels are driven by server-side replication only
            ChannelName::Actor => ChannelPermissions {
                client_open: false,
                server_open: true,
                tick: true,
            },
            ChannelName::Voice => ChannelPermissions {
                client_open: true,
                server_open: true,
                tick: false,
            },
        }
    }

    /// Whether `opener` is allowed to remotely create this channel kind
    pub fn openable_by(&self, opener: HostType) -> bool {
        let permissions = self.permissions();
        match opener {
            HostType::Server => permissions.server_open,
            HostType::Client => permissions.client_open,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelName::Control => "Control",
            ChannelName::Actor => "Actor",
            ChannelName::Voice => "Voice",
        }
    }
}

impl Serde for ChannelName {
    fn ser(&self, writer: &mut dyn BitWrite) {
        let index: u8 = match self {
            ChannelName::Control => 0,
            ChannelName::Actor => 1,
            ChannelName::Voice => 2,
        };
        UnsignedInteger::<2>::new(index).ser(writer);
    }

    fn de(reader: &mut BitReader) -> Result<Self, SerdeErr> {
        match UnsignedInteger::<2>::de(reader)?.get() {
            0 => Ok(ChannelName::Control),
            1 => Ok(ChannelName::Actor),
            2 => Ok(ChannelName::Voice),
            _ => Err(SerdeErr),
        }
    }

    fn bit_length(&self) -> u32 {
        2
    }
}

/// Something a channel tells its connection after processing received data
#[derive(Debug, PartialEq, Eq)]
pub enum ChannelSignal {
    /// The peer's open bunch was processed
    Opened,
    /// The peer closed the channel
    Closed(CloseReason),
    /// A complete (possibly reassembled) payload for the application
    Delivered {
        payload: Box<[u8]>,
        payload_bits: u32,
    },
}

/// In-progress reassembly of a sequence of partial bunches
#[derive(Debug, PartialEq)]
struct PartialAssembly {
    reliable: bool,
    /// Reliable sequence the next fragment must carry
    next_sequence: u16,
    open: bool,
    close: bool,
    close_reason: CloseReason,
    staging: BitWriter,
}

/// One logical, independently sequenced stream over the connection.
///
/// The channel owns its reliable sequence counters, the retransmission
/// ledger of unacked outgoing reliable bunches, the buffer of incoming
/// reliable bunches that arrived ahead of sequence, and any in-progress
/// partial-bunch reassembly.
#[derive(Debug, PartialEq)]
pub struct Channel {
    index: ChannelIndex,
    name: ChannelName,
    /// Peer's open bunch has been processed
    open: bool,
    /// A close has been sent or received; no further sends are accepted
    closing: bool,
    /// Latest incoming reliable sequence processed in order
    in_reliable: u16,
    /// Latest outgoing reliable sequence assigned
    out_reliable: u16,
    /// Unacked outgoing reliable bunches, in sequence order
    out_rec: Vec<SentBunch>,
    /// Incoming reliable bunches ahead of sequence, in sequence order
    in_rec: Vec<InBunch>,
    partial: Option<PartialAssembly>,
}

#[derive(Debug, PartialEq)]
struct SentBunch {
    bunch: OutBunch,
    needs_resend: bool,
}

impl Channel {
    pub fn new(index: ChannelIndex, name: ChannelName) -> Self {
        Self {
            index,
            name,
            open: false,
            closing: false,
            in_reliable: 0,
            out_reliable: 0,
            out_rec: Vec::new(),
            in_rec: Vec::new(),
            partial: None,
        }
    }

    pub fn index(&self) -> ChannelIndex {
        self.index
    }

    pub fn name(&self) -> ChannelName {
        self.name
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// The channel's slot may be reused only once every reliable bunch it
    /// ever sent has been acknowledged
    pub fn is_drained(&self) -> bool {
        self.closing && self.out_rec.is_empty()
    }

    pub fn in_reliable(&self) -> u16 {
        self.in_reliable
    }

    // --- receive path ---

    /// Feeds one raw bunch carved out of a received packet. Handles reliable
    /// sequencing (duplicates dropped, ahead-of-sequence buffered), then
    /// forwards in-order bunches into partial reassembly.
    pub fn received_raw_bunch(
        &mut self,
        bunch: InBunch,
    ) -> Result<Vec<ChannelSignal>, ProtocolViolation> {
        let mut signals = Vec::new();

        if bunch.header.reliable {
            if !sequence_greater_than(bunch.ch_sequence, self.in_reliable) {
                trace!(
                    "Channel {} dropping duplicate reliable bunch, sequence {}",
                    self.index,
                    bunch.ch_sequence
                );
                return Ok(signals);
            }
            if bunch.ch_sequence != self.in_reliable.wrapping_add(1) {
                self.buffer_ahead_of_sequence(bunch);
                return Ok(signals);
            }
        } else if bunch.header.open && !(bunch.header.close || bunch.header.partial) {
            // an unreliable open is only meaningful when it also closes or
            // starts a partial sequence; anything else lost its context
            warn!(
                "Channel {} dropping invalid unreliable open bunch",
                self.index
            );
            return Ok(signals);
        }

        self.received_next_bunch(bunch, &mut signals)?;

        // earlier arrivals may now be in sequence
        while let Some(front) = self.in_rec.first() {
            if front.ch_sequence != self.in_reliable.wrapping_add(1) {
                break;
            }
            let next = self.in_rec.remove(0);
            self.received_next_bunch(next, &mut signals)?;
        }

        Ok(signals)
    }

    fn buffer_ahead_of_sequence(&mut self, bunch: InBunch) {
        let mut insert_at = self.in_rec.len();
        for (position, existing) in self.in_rec.iter().enumerate() {
            if existing.ch_sequence == bunch.ch_sequence {
                // duplicate of an already-buffered bunch
                return;
            }
            if sequence_greater_than(existing.ch_sequence, bunch.ch_sequence) {
                insert_at = position;
                break;
            }
        }
        trace!(
            "Channel {} buffering reliable bunch {} ahead of sequence (expecting {})",
            self.index,
            bunch.ch_sequence,
            self.in_reliable.wrapping_add(1)
        );
        self.in_rec.insert(insert_at, bunch);
    }

    /// Processes a bunch that is in sequence: partial reassembly, then
    /// delivery
    fn received_next_bunch(
        &mut self,
        bunch: InBunch,
        signals: &mut Vec<ChannelSignal>,
    ) -> Result<(), ProtocolViolation> {
        if bunch.header.reliable {
            self.in_reliable = bunch.ch_sequence;
        }

        if bunch.header.partial {
            return self.received_partial_bunch(bunch, signals);
        }

        self.deliver(
            bunch.header.open,
            bunch.header.close,
            bunch.header.close_reason,
            bunch.payload,
            bunch.header.payload_bits,
            signals,
        );
        Ok(())
    }

    fn received_partial_bunch(
        &mut self,
        bunch: InBunch,
        signals: &mut Vec<ChannelSignal>,
    ) -> Result<(), ProtocolViolation> {
        if bunch.header.partial_initial {
            if let Some(pending) = &self.partial {
                if pending.reliable && bunch.header.reliable {
                    // two interleaved reliable partial sequences cannot both
                    // be honored
                    return Err(ProtocolViolation::MalformedPartialBunch {
                        channel_index: self.index,
                        reason: "reliable partial started while a reliable partial was pending",
                    });
                }
                warn!(
                    "Channel {} discarding incomplete unreliable partial bunch",
                    self.index
                );
            }
            let mut staging = BitWriter::with_max_bits(MAX_PARTIAL_BUNCH_BITS);
            staging.write_bits(&bunch.payload, bunch.header.payload_bits);
            self.partial = Some(PartialAssembly {
                reliable: bunch.header.reliable,
                next_sequence: bunch.ch_sequence.wrapping_add(1),
                open: bunch.header.open,
                close: bunch.header.close,
                close_reason: bunch.header.close_reason,
                staging,
            });
            return Ok(());
        }

        let Some(pending) = &mut self.partial else {
            if bunch.header.reliable {
                return Err(ProtocolViolation::MalformedPartialBunch {
                    channel_index: self.index,
                    reason: "reliable partial continuation with no initial fragment",
                });
            }
            // the unreliable initial fragment was lost with its packet
            trace!(
                "Channel {} dropping unreliable partial continuation, initial lost",
                self.index
            );
            return Ok(());
        };

        if pending.reliable != bunch.header.reliable {
            return Err(ProtocolViolation::MalformedPartialBunch {
                channel_index: self.index,
                reason: "partial fragments changed reliability mid-sequence",
            });
        }
        if pending.reliable && bunch.ch_sequence != pending.next_sequence {
            return Err(ProtocolViolation::MalformedPartialBunch {
                channel_index: self.index,
                reason: "reliable partial fragment out of sequence",
            });
        }
        if pending.staging.bits_written() + bunch.header.payload_bits > MAX_PARTIAL_BUNCH_BITS {
            return Err(ProtocolViolation::MalformedPartialBunch {
                channel_index: self.index,
                reason: "reassembled payload exceeds the partial bunch limit",
            });
        }

        pending.staging.write_bits(&bunch.payload, bunch.header.payload_bits);
        pending.next_sequence = bunch.ch_sequence.wrapping_add(1);
        pending.close |= bunch.header.close;
        if bunch.header.close {
            pending.close_reason = bunch.header.close_reason;
        }

        if bunch.header.partial_final {
            let complete = self
                .partial
                .take()
                .ok_or(ProtocolViolation::MalformedPartialBunch {
                    channel_index: self.index,
                    reason: "reliable partial continuation with no initial fragment",
                })?;
            let payload_bits = complete.staging.bits_written();
            self.deliver(
                complete.open,
                complete.close,
                complete.close_reason,
                complete.staging.to_bytes(),
                payload_bits,
                signals,
            );
        }
        Ok(())
    }

    fn deliver(
        &mut self,
        open: bool,
        close: bool,
        close_reason: CloseReason,
        payload: Box<[u8]>,
        payload_bits: u32,
        signals: &mut Vec<ChannelSignal>,
    ) {
        if open && !self.open {
            self.open = true;
            signals.push(ChannelSignal::Opened);
        }
        if payload_bits > 0 {
            signals.push(ChannelSignal::Delivered {
                payload,
                payload_bits,
            });
        }
        if close && !self.closing {
            self.closing = true;
            signals.push(ChannelSignal::Closed(close_reason));
        }
    }

    // --- send path ---

    /// Largest payload a single bunch can carry and still fit in one packet
    /// next to the notify header and its own header
    pub fn max_single_bunch_payload_bits() -> u32 {
        MTU_SIZE_BITS - NOTIFY_HEADER_BITS - MAX_BUNCH_HEADER_BITS - PACKET_TRAILER_BITS
    }

    /// Frames a payload for transmission, fragmenting into partial bunches
    /// when it cannot fit in a single packet. Reliable bunches enter the
    /// retransmission ledger; the caller stamps each with its packet index
    /// via `bunch_sent` after the actual flush.
    pub fn send_bunch(
        &mut self,
        payload: &[u8],
        payload_bits: u32,
        reliable: bool,
    ) -> Result<Vec<OutBunch>, ConnectionError> {
        self.build_bunches(payload, payload_bits, reliable, false, false, CloseReason::Destroyed)
    }

    /// Frames the bunch that opens this channel on the peer
    pub fn send_open_bunch(&mut self) -> Result<Vec<OutBunch>, ConnectionError> {
        self.build_bunches(&[], 0, true, true, false, CloseReason::Destroyed)
    }

    /// Frames the reliable bunch that closes this channel, and marks the
    /// channel closing so further sends are refused
    pub fn send_close_bunch(
        &mut self,
        reason: CloseReason,
    ) -> Result<Vec<OutBunch>, ConnectionError> {
        let bunches = self.build_bunches(&[], 0, true, false, true, reason)?;
        self.closing = true;
        Ok(bunches)
    }

    fn build_bunches(
        &mut self,
        payload: &[u8],
        payload_bits: u32,
        reliable: bool,
        open: bool,
        close: bool,
        close_reason: CloseReason,
    ) -> Result<Vec<OutBunch>, ConnectionError> {
        if self.closing && !close {
            return Err(ConnectionError::SendFailed {
                channel_index: self.index,
                reason: "channel is closing",
            });
        }
        if u64::from(payload_bits) > (payload.len() as u64) * 8 {
            return Err(ConnectionError::SendFailed {
                channel_index: self.index,
                reason: "declared bit length exceeds the payload buffer",
            });
        }
        // the receive side refuses reassemblies past this limit; sending
        // more would close the honest peer's connection
        if payload_bits > MAX_PARTIAL_BUNCH_BITS {
            return Err(ConnectionError::SendFailed {
                channel_index: self.index,
                reason: "payload exceeds the partial bunch limit",
            });
        }

        let max_fragment_bits = Self::max_single_bunch_payload_bits();
        let partial = payload_bits > max_fragment_bits;
        if partial && !reliable {
            return Err(ConnectionError::SendFailed {
                channel_index: self.index,
                reason: "unreliable payload exceeds a single packet",
            });
        }

        let fragment_count = if partial {
            ((payload_bits + max_fragment_bits - 1) / max_fragment_bits) as usize
        } else {
            1
        };

        let mut output = Vec::with_capacity(fragment_count);
        for fragment in 0..fragment_count {
            let first = fragment == 0;
            let last = fragment == fragment_count - 1;
            let fragment_bits = if partial && !last {
                max_fragment_bits
            } else {
                payload_bits - (fragment as u32) * max_fragment_bits
            };
            let start_bit = (fragment as u32) * max_fragment_bits;
            let fragment_payload = carve_bits(payload, start_bit, fragment_bits);

            let ch_sequence = if reliable {
                self.out_reliable = self.out_reliable.wrapping_add(1);
                self.out_reliable
            } else {
                0
            };

            let header = BunchHeader {
                open: open && first,
                close: close && last,
                close_reason,
                reliable,
                channel_index: self.index,
                partial,
                partial_initial: partial && first,
                partial_final: partial && last,
                wrapped_reliable_seq: ch_sequence & (MAX_CHSEQUENCE - 1),
                channel_name: if reliable || (open && first) {
                    Some(self.name)
                } else {
                    None
                },
                payload_bits: fragment_bits,
                ..Default::default()
            };

            let bunch = OutBunch {
                header,
                ch_sequence,
                payload: fragment_payload,
                packet_index: 0,
            };
            if reliable {
                self.out_rec.push(SentBunch {
                    bunch: bunch.clone(),
                    needs_resend: false,
                });
            }
            output.push(bunch);
        }
        Ok(output)
    }

    /// Stamps a reliable bunch with the packet that carried it
    pub fn bunch_sent(&mut self, ch_sequence: u16, packet_index: PacketIndex) {
        for sent in &mut self.out_rec {
            if sent.bunch.ch_sequence == ch_sequence {
                sent.bunch.packet_index = packet_index;
                sent.needs_resend = false;
                return;
            }
        }
    }

    // --- ack path ---

    /// The packet carrying some of this channel's bunches was delivered
    pub fn received_ack(&mut self, packet_index: PacketIndex) {
        let before = self.out_rec.len();
        self.out_rec
            .retain(|sent| sent.bunch.packet_index != packet_index);
        if before != self.out_rec.len() {
            trace!(
                "Channel {} acked packet {}, {} reliable bunches outstanding",
                self.index,
                packet_index,
                self.out_rec.len()
            );
        }
    }

    /// The packet carrying some of this channel's bunches was lost; queue
    /// those bunches for retransmission
    pub fn received_nak(&mut self, packet_index: PacketIndex) {
        for sent in &mut self.out_rec {
            if sent.bunch.packet_index == packet_index {
                sent.needs_resend = true;
            }
        }
    }

    /// Drains the bunches due for retransmission, oldest sequence first
    pub fn take_resends(&mut self) -> Vec<OutBunch> {
        let mut output = Vec::new();
        for sent in &mut self.out_rec {
            if sent.needs_resend {
                sent.needs_resend = false;
                output.push(sent.bunch.clone());
            }
        }
        output
    }

    pub fn has_pending_resends(&self) -> bool {
        self.out_rec.iter().any(|sent| sent.needs_resend)
    }
}

/// Copies `bit_count` bits starting at `start_bit` into a fresh buffer
fn carve_bits(source: &[u8], start_bit: u32, bit_count: u32) -> Box<[u8]> {
    let byte_len = ((bit_count + 7) / 8) as usize;
    let mut output = vec![0u8; byte_len];
    for bit in 0..bit_count {
        let source_bit = start_bit + bit;
        let set = source[(source_bit / 8) as usize] & (1 << (source_bit % 8)) != 0;
        if set {
            output[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }
    output.into_boxed_slice()
}
