use thiserror::Error;

use tidelink_serde::{BitReader, BitWrite, Serde, SerdeErr};

use crate::{
    connection::sequence_history::SequenceHistory,
    types::PacketIndex,
    wrapping_number::{sequence_less_than, wrapping_diff},
};

/// Errors surfaced while applying a peer's notify header. These indicate a
/// misbehaving or malicious peer; the caller decides whether to close.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketNotifyError {
    /// Peer acknowledged a sequence we have not sent yet (SECURITY: forged
    /// or corrupted ack data)
    #[error("Peer acked sequence {acked} but next outgoing sequence is {next_out}. Ack data is forged or corrupted")]
    AckedUnsentSequence {
        acked: PacketIndex,
        next_out: PacketIndex,
    },
}

/// The decoded header of a received packet: the peer's packet sequence plus
/// its view of our outgoing packets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketNotifyHeader {
    pub seq: PacketIndex,
    pub acked_seq: PacketIndex,
    pub history: SequenceHistory,
}

impl Serde for PacketNotifyHeader {
    fn ser(&self, writer: &mut dyn BitWrite) {
        self.seq.ser(writer);
        self.acked_seq.ser(writer);
        self.history.ser(writer);
    }

    fn de(reader: &mut BitReader) -> Result<Self, SerdeErr> {
        Ok(Self {
            seq: PacketIndex::de(reader)?,
            acked_seq: PacketIndex::de(reader)?,
            history: SequenceHistory::de(reader)?,
        })
    }

    fn bit_length(&self) -> u32 {
        crate::constants::NOTIFY_HEADER_BITS
    }
}

/// Sliding-window acknowledgment engine: tracks incoming and outgoing packet
/// sequences and guarantees that every transmitted sequence eventually
/// receives exactly one delivered/lost notification.
pub struct PacketNotify {
    /// Last accepted incoming sequence
    in_seq: PacketIndex,
    /// Last incoming sequence whose ack/nak decision has been recorded
    in_ack_seq: PacketIndex,
    /// Decisions for `in_ack_seq` going backwards
    in_history: SequenceHistory,
    /// Sequence the next flushed packet will carry
    out_seq: PacketIndex,
    /// Last outgoing sequence for which a notification has been dispatched
    out_ack_seq: PacketIndex,
}

impl PacketNotify {
    pub fn new() -> Self {
        let mut notify = Self {
            in_seq: 0,
            in_ack_seq: 0,
            in_history: SequenceHistory::new(),
            out_seq: 0,
            out_ack_seq: 0,
        };
        notify.init(PacketIndex::MAX, 0);
        notify
    }

    /// Seeds the sequence state. `initial_in` is the sequence immediately
    /// before the first packet the peer will send; `initial_out` is the
    /// sequence our first packet will carry.
    pub fn init(&mut self, initial_in: PacketIndex, initial_out: PacketIndex) {
        self.in_seq = initial_in;
        self.in_ack_seq = initial_in;
        self.in_history = SequenceHistory::new();
        self.out_seq = initial_out;
        // one behind, so loss of the very first packet is detected
        self.out_ack_seq = initial_out.wrapping_sub(1);
    }

    /// The sequence the packet currently being assembled will carry
    pub fn out_seq(&self) -> PacketIndex {
        self.out_seq
    }

    pub fn in_seq(&self) -> PacketIndex {
        self.in_seq
    }

    /// Encodes the current sequence/ack state. Constant bit width for a
    /// given connection, so the header can be rewritten in place later.
    pub fn write_header(&self, writer: &mut dyn BitWrite) {
        PacketNotifyHeader {
            seq: self.out_seq,
            acked_seq: self.in_ack_seq,
            history: self.in_history,
        }
        .ser(writer);
    }

    /// Decodes a peer's header. Malformed data is reported to the caller.
    pub fn read_header(reader: &mut BitReader) -> Result<PacketNotifyHeader, SerdeErr> {
        PacketNotifyHeader::de(reader)
    }

    /// Signed distance between the received sequence and the expected next
    /// sequence. Positive means ahead (possible gap), zero or negative means
    /// duplicate or stale. Headers whose ack data regresses behind what has
    /// already been dispatched are reported as stale (0) so they are never
    /// processed twice.
    pub fn get_sequence_delta(&self, header: &PacketNotifyHeader) -> i32 {
        let seq_delta = i32::from(wrapping_diff(self.in_seq, header.seq));
        if seq_delta <= 0 {
            return seq_delta;
        }
        if sequence_less_than(header.acked_seq, self.out_ack_seq) {
            return 0;
        }
        seq_delta
    }

    /// Accepts a header (after the caller has resolved gap handling) and
    /// walks every newly acknowledged or lost outgoing sequence in order,
    /// invoking `on_notify(seq, delivered)` exactly once for each. Sequences
    /// older than the history window are pessimistically reported lost.
    pub fn update<F>(
        &mut self,
        header: &PacketNotifyHeader,
        mut on_notify: F,
    ) -> Result<(), PacketNotifyError>
    where
        F: FnMut(PacketIndex, bool),
    {
        // A peer may only ack sequences that have actually been flushed
        if header.acked_seq != self.out_ack_seq
            && !sequence_less_than(header.acked_seq, self.out_seq)
        {
            return Err(PacketNotifyError::AckedUnsentSequence {
                acked: header.acked_seq,
                next_out: self.out_seq,
            });
        }

        let count = i32::from(wrapping_diff(self.out_ack_seq, header.acked_seq));
        for offset in 0..count {
            let seq = self.out_ack_seq.wrapping_add((offset + 1) as PacketIndex);
            let history_index = (count - 1 - offset) as u32;
            on_notify(seq, header.history.is_delivered(history_index));
        }

        self.out_ack_seq = header.acked_seq;
        self.in_seq = header.seq;
        Ok(())
    }

    /// Records that the just-processed incoming sequence was accepted. Any
    /// skipped intermediate sequences are implicitly recorded as lost.
    pub fn ack_seq(&mut self, seq: PacketIndex) {
        self.record_in_decision(seq, true);
    }

    /// Records that the just-processed incoming sequence was rejected, so
    /// the peer learns about the drop as quickly as possible
    pub fn nak_seq(&mut self, seq: PacketIndex) {
        self.record_in_decision(seq, false);
    }

    fn record_in_decision(&mut self, seq: PacketIndex, delivered: bool) {
        while sequence_less_than(self.in_ack_seq, seq) {
            self.in_ack_seq = self.in_ack_seq.wrapping_add(1);
            self.in_history
                .push(delivered && self.in_ack_seq == seq);
        }
    }

    /// Advances the outgoing sequence after a successful flush
    pub fn commit_and_increment_out_seq(&mut self) {
        self.out_seq = self.out_seq.wrapping_add(1);
    }
}

impl Default for PacketNotify {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidelink_serde::{BitReader, BitWriter};

    fn header(seq: u16, acked_seq: u16, history: SequenceHistory) -> PacketNotifyHeader {
        PacketNotifyHeader {
            seq,
            acked_seq,
            history,
        }
    }

    fn paired() -> (PacketNotify, PacketNotify) {
        let mut a = PacketNotify::new();
        let mut b = PacketNotify::new();
        a.init(PacketIndex::MAX, 0);
        b.init(PacketIndex::MAX, 0);
        (a, b)
    }

    #[test]
    fn header_round_trip() {
        let (notify, _) = paired();
        let mut writer = BitWriter::new();
        notify.write_header(&mut writer);
        assert_eq!(writer.bits_written(), crate::constants::NOTIFY_HEADER_BITS);

        let bytes = writer.to_bytes();
        let mut reader = BitReader::new(&bytes);
        let decoded = PacketNotify::read_header(&mut reader).expect("valid header");
        assert_eq!(decoded.seq, 0);
        assert_eq!(decoded.acked_seq, PacketIndex::MAX);
    }

    #[test]
    fn truncated_header_rejected() {
        let bytes = [0u8; 3];
        let mut reader = BitReader::new(&bytes);
        assert!(PacketNotify::read_header(&mut reader).is_err());
    }

    #[test]
    fn sequence_delta_ahead_and_duplicate() {
        let (notify, _) = paired();
        // expected next is 0 (in_seq == MAX)
        assert_eq!(notify.get_sequence_delta(&header(0, PacketIndex::MAX, SequenceHistory::new())), 1);
        assert_eq!(notify.get_sequence_delta(&header(2, PacketIndex::MAX, SequenceHistory::new())), 3);
        assert_eq!(
            notify.get_sequence_delta(&header(PacketIndex::MAX, PacketIndex::MAX, SequenceHistory::new())),
            0
        );
    }

    #[test]
    fn every_sent_sequence_notified_exactly_once() {
        let (mut a, _) = paired();
        // a flushes packets 0..5
        for _ in 0..5 {
            a.commit_and_increment_out_seq();
        }

        // peer acked 0, 2, 4; lost 1, 3
        let mut history = SequenceHistory::new();
        for seq in 0u16..5 {
            history.push(seq % 2 == 0);
        }

        let mut notified = Vec::new();
        a.update(&header(0, 4, history), |seq, delivered| {
            notified.push((seq, delivered));
        })
        .expect("valid header");

        assert_eq!(
            notified,
            vec![(0, true), (1, false), (2, true), (3, false), (4, true)]
        );

        // a second identical header produces no duplicate notifications
        let mut again = Vec::new();
        a.update(&header(0, 4, history), |seq, delivered| {
            again.push((seq, delivered));
        })
        .expect("valid header");
        assert!(again.is_empty());
    }

    #[test]
    fn acked_unsent_sequence_is_error() {
        let (mut a, _) = paired();
        a.commit_and_increment_out_seq(); // only packet 0 flushed, out_seq = 1

        let result = a.update(&header(0, 5, SequenceHistory::new()), |_, _| {});
        assert_eq!(
            result,
            Err(PacketNotifyError::AckedUnsentSequence {
                acked: 5,
                next_out: 1
            })
        );
    }

    #[test]
    fn gap_in_incoming_decisions_recorded_as_lost() {
        let (mut a, _) = paired();
        a.ack_seq(0);
        // sequences 1 and 2 never decided; acking 3 naks them implicitly
        a.ack_seq(3);

        // history bit 0 = seq 3 (delivered), bits 1-2 = seqs 2,1 (lost),
        // bit 3 = seq 0 (delivered)
        let mut writer = BitWriter::new();
        a.write_header(&mut writer);
        let bytes = writer.to_bytes();
        let mut reader = BitReader::new(&bytes);
        let decoded = PacketNotify::read_header(&mut reader).expect("valid header");

        assert_eq!(decoded.acked_seq, 3);
        assert!(decoded.history.is_delivered(0));
        assert!(!decoded.history.is_delivered(1));
        assert!(!decoded.history.is_delivered(2));
        assert!(decoded.history.is_delivered(3));
    }

    #[test]
    fn overshooting_history_window_reports_lost() {
        let (mut a, _) = paired();
        for _ in 0..40 {
            a.commit_and_increment_out_seq();
        }

        // peer delivered everything but its history only covers the last 32
        let mut history = SequenceHistory::new();
        for _ in 0..40 {
            history.push(true);
        }

        let mut lost = Vec::new();
        a.update(&header(0, 39, history), |seq, delivered| {
            if !delivered {
                lost.push(seq);
            }
        })
        .expect("valid header");

        // the first 8 sequences aged out of the window: pessimistic naks
        assert_eq!(lost, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }
}
