use std::collections::VecDeque;

use thiserror::Error;

use crate::types::{ChannelIndex, PacketIndex};

/// Errors that can occur while consuming the channel record. These mean the
/// caller consumed packets out of flush order, which is an internal
/// invariant breach, not a network condition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelRecordError {
    /// The record was consumed for a packet id that was never pushed
    #[error("Channel record is empty, but a notification arrived for packet {packet_id}. Notifications must match flushed packets")]
    Empty { packet_id: PacketIndex },

    /// The front of the record does not match the packet being consumed
    #[error("Channel record front is packet {front}, but packet {expected} was consumed. Packets must be consumed in flush order")]
    UnexpectedPacketId {
        front: PacketIndex,
        expected: PacketIndex,
    },

    /// The front of the record is a channel entry with no preceding marker
    #[error("Channel record front is a channel entry without a packet marker. The record was corrupted or consumed out of order")]
    MissingMarker,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ChannelRecordEntry {
    is_marker: bool,
    value: u32,
}

/// An append-only ledger mapping each flushed outgoing packet to the logical
/// channels that wrote data into it. Entries are stored in flush order in a
/// dense ring; one packet-id marker per flushed packet, followed by the
/// channel indices written into that packet (deduplicated per packet).
/// Consumed front-to-back, exactly once per packet, as ack/nak
/// notifications arrive.
pub struct ChannelRecord {
    record: VecDeque<ChannelRecordEntry>,
    last_packet_id: Option<PacketIndex>,
}

impl ChannelRecord {
    pub fn new() -> Self {
        Self {
            record: VecDeque::new(),
            last_packet_id: None,
        }
    }

    /// Pushes a marker for `packet_id` unless it is already the most recent
    /// marker, guaranteeing at most one marker per flushed packet
    pub fn push_packet_id(&mut self, packet_id: PacketIndex) {
        if self.last_packet_id == Some(packet_id) {
            return;
        }
        self.record.push_back(ChannelRecordEntry {
            is_marker: true,
            value: u32::from(packet_id),
        });
        self.last_packet_id = Some(packet_id);
    }

    /// Records that `channel_index` wrote data into `packet_id`, pushing
    /// the packet marker first if needed
    pub fn push_channel_record(&mut self, packet_id: PacketIndex, channel_index: ChannelIndex) {
        self.push_packet_id(packet_id);
        self.record.push_back(ChannelRecordEntry {
            is_marker: false,
            value: channel_index,
        });
    }

    /// Pops entries for `packet_id`, invoking `func(packet_id,
    /// channel_index)` once per run of equal channel indices. Consecutive
    /// duplicates collapse; non-consecutive repeats of a channel invoke
    /// `func` again, recording real multiple-write occurrences.
    pub fn consume_for_packet<F>(
        &mut self,
        packet_id: PacketIndex,
        mut func: F,
    ) -> Result<(), ChannelRecordError>
    where
        F: FnMut(PacketIndex, ChannelIndex),
    {
        let Some(front) = self.record.pop_front() else {
            return Err(ChannelRecordError::Empty { packet_id });
        };

        if !front.is_marker {
            return Err(ChannelRecordError::MissingMarker);
        }
        if front.value != u32::from(packet_id) {
            return Err(ChannelRecordError::UnexpectedPacketId {
                front: front.value as PacketIndex,
                expected: packet_id,
            });
        }

        let mut previous_channel: Option<ChannelIndex> = None;
        while let Some(entry) = self.record.front() {
            if entry.is_marker {
                break;
            }
            let channel_index = entry.value;
            self.record.pop_front();

            if previous_channel != Some(channel_index) {
                func(packet_id, channel_index);
                previous_channel = Some(channel_index);
            }
        }

        if self.record.is_empty() {
            self.last_packet_id = None;
        }
        Ok(())
    }

    /// Drains the entire ledger, treating every in-flight packet as
    /// delivered. Used when a connection runs in internal-ack mode.
    pub fn consume_all<F>(&mut self, mut func: F)
    where
        F: FnMut(ChannelIndex),
    {
        let mut previous_channel: Option<ChannelIndex> = None;
        while let Some(entry) = self.record.pop_front() {
            if entry.is_marker {
                continue;
            }
            let channel_index = entry.value;
            if previous_channel != Some(channel_index) {
                func(channel_index);
                previous_channel = Some(channel_index);
            }
        }
        self.last_packet_id = None;
    }

    pub fn is_empty(&self) -> bool {
        self.record.is_empty()
    }
}

impl Default for ChannelRecord {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_marker_per_packet() {
        let mut record = ChannelRecord::new();
        record.push_packet_id(7);
        record.push_packet_id(7);
        record.push_channel_record(7, 3);

        let mut seen = Vec::new();
        record
            .consume_for_packet(7, |packet_id, channel| seen.push((packet_id, channel)))
            .expect("in order");
        assert_eq!(seen, vec![(7, 3)]);
        assert!(record.is_empty());
    }

    #[test]
    fn consecutive_duplicates_collapse() {
        let mut record = ChannelRecord::new();
        record.push_channel_record(1, 5);
        record.push_channel_record(1, 5);
        record.push_channel_record(1, 5);
        record.push_channel_record(1, 2);
        record.push_channel_record(1, 5);

        let mut seen = Vec::new();
        record
            .consume_for_packet(1, |_, channel| seen.push(channel))
            .expect("in order");
        // non-consecutive repeat of channel 5 invokes again
        assert_eq!(seen, vec![5, 2, 5]);
    }

    #[test]
    fn fifo_across_packets() {
        let mut record = ChannelRecord::new();
        record.push_channel_record(1, 0);
        record.push_channel_record(2, 4);
        record.push_packet_id(3); // keep-alive, no channel data

        let mut seen = Vec::new();
        record.consume_for_packet(1, |p, c| seen.push((p, c))).unwrap();
        record.consume_for_packet(2, |p, c| seen.push((p, c))).unwrap();
        record.consume_for_packet(3, |p, c| seen.push((p, c))).unwrap();

        assert_eq!(seen, vec![(1, 0), (2, 4)]);
        assert!(record.is_empty());
    }

    #[test]
    fn out_of_order_consume_is_error() {
        let mut record = ChannelRecord::new();
        record.push_channel_record(1, 0);
        record.push_channel_record(2, 0);

        assert_eq!(
            record.consume_for_packet(2, |_, _| {}),
            Err(ChannelRecordError::UnexpectedPacketId {
                front: 1,
                expected: 2
            })
        );
    }

    #[test]
    fn empty_consume_is_error() {
        let mut record = ChannelRecord::new();
        assert_eq!(
            record.consume_for_packet(9, |_, _| {}),
            Err(ChannelRecordError::Empty { packet_id: 9 })
        );
    }

    #[test]
    fn consume_all_drains_everything() {
        let mut record = ChannelRecord::new();
        record.push_channel_record(1, 0);
        record.push_channel_record(1, 3);
        record.push_channel_record(2, 3);
        record.push_channel_record(2, 8);

        let mut seen = Vec::new();
        record.consume_all(|channel| seen.push(channel));
        // channel 3 repeats across the packet boundary and collapses
        assert_eq!(seen, vec![0, 3, 8]);
        assert!(record.is_empty());
    }
}
