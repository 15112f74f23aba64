use log::warn;
use thiserror::Error;

use crate::{
    channels::channel::{Channel, ChannelName},
    types::ChannelIndex,
};

/// Index of the control channel. It must exist before any other channel may
/// process data.
pub const CONTROL_CHANNEL_INDEX: ChannelIndex = 0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelTableError {
    #[error("Channel index {channel_index} is outside the table of {max_channels} slots")]
    IndexOutOfBounds {
        channel_index: ChannelIndex,
        max_channels: u32,
    },

    #[error("Channel index {channel_index} is already occupied")]
    IndexOccupied { channel_index: ChannelIndex },

    /// The previous occupant still has unacknowledged reliable bunches in
    /// flight; its index may not be reused until they drain
    #[error("Channel index {channel_index} is draining and may not be reused yet")]
    IndexDraining { channel_index: ChannelIndex },

    #[error("No channel available, all {max_channels} slots are in use")]
    TableFull { max_channels: u32 },
}

/// Fixed-size arena of channel slots with a free-list for local allocation.
/// A closing channel keeps its slot until every reliable bunch it sent has
/// been acknowledged, so an index is never reused while the prior occupant
/// still has sends in flight.
pub struct ChannelTable {
    slots: Vec<Option<Channel>>,
    /// Free non-control indices, smallest on top
    free: Vec<ChannelIndex>,
    full_warned: bool,
}

impl ChannelTable {
    pub fn new(max_channels: u32) -> Self {
        let mut slots = Vec::with_capacity(max_channels as usize);
        slots.resize_with(max_channels as usize, || None);
        let free = (1..max_channels).rev().collect();
        Self {
            slots,
            free,
            full_warned: false,
        }
    }

    pub fn max_channels(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn get(&self, channel_index: ChannelIndex) -> Option<&Channel> {
        self.slots.get(channel_index as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, channel_index: ChannelIndex) -> Option<&mut Channel> {
        self.slots.get_mut(channel_index as usize)?.as_mut()
    }

    pub fn has_control_channel(&self) -> bool {
        self.get(CONTROL_CHANNEL_INDEX).is_some()
    }

    /// Creates a channel at a specific index, as directed by a remote open
    /// bunch
    pub fn create_at(
        &mut self,
        channel_index: ChannelIndex,
        name: ChannelName,
    ) -> Result<&mut Channel, ChannelTableError> {
        let max_channels = self.max_channels();
        let Some(slot) = self.slots.get_mut(channel_index as usize) else {
            return Err(ChannelTableError::IndexOutOfBounds {
                channel_index,
                max_channels,
            });
        };
        if let Some(existing) = slot {
            if existing.is_closing() {
                return Err(ChannelTableError::IndexDraining { channel_index });
            }
            return Err(ChannelTableError::IndexOccupied { channel_index });
        }
        let channel = slot.insert(Channel::new(channel_index, name));
        self.free.retain(|free_index| *free_index != channel_index);
        Ok(channel)
    }

    /// Allocates a channel on the first free local index
    pub fn allocate(&mut self, name: ChannelName) -> Result<ChannelIndex, ChannelTableError> {
        let Some(channel_index) = self.free.pop() else {
            let max_channels = self.max_channels();
            if !self.full_warned {
                // rate-limited: one warning until a slot frees up
                warn!("No channel available, all {} slots are in use", max_channels);
                self.full_warned = true;
            }
            return Err(ChannelTableError::TableFull { max_channels });
        };
        self.slots[channel_index as usize] = Some(Channel::new(channel_index, name));
        Ok(channel_index)
    }

    /// Releases every fully drained closing channel and returns its index to
    /// the free-list
    pub fn reap_drained(&mut self) -> Vec<ChannelIndex> {
        let mut reaped = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let drained = slot.as_ref().is_some_and(|channel| channel.is_drained());
            if drained {
                *slot = None;
                let channel_index = index as ChannelIndex;
                if channel_index != CONTROL_CHANNEL_INDEX {
                    self.free.push(channel_index);
                }
                self.full_warned = false;
                reaped.push(channel_index);
            }
        }
        reaped
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Channel> {
        self.slots.iter_mut().filter_map(|slot| slot.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::bunch::CloseReason;

    #[test]
    fn control_index_reserved_for_explicit_creation() {
        let mut table = ChannelTable::new(4);
        assert!(!table.has_control_channel());

        let first = table.allocate(ChannelName::Actor).unwrap();
        assert_ne!(first, CONTROL_CHANNEL_INDEX);

        table
            .create_at(CONTROL_CHANNEL_INDEX, ChannelName::Control)
            .unwrap();
        assert!(table.has_control_channel());
    }

    #[test]
    fn occupied_index_refused() {
        let mut table = ChannelTable::new(4);
        table.create_at(2, ChannelName::Actor).unwrap();
        assert_eq!(
            table.create_at(2, ChannelName::Actor),
            Err(ChannelTableError::IndexOccupied { channel_index: 2 })
        );
    }

    #[test]
    fn out_of_bounds_index_refused() {
        let mut table = ChannelTable::new(4);
        assert_eq!(
            table.create_at(9, ChannelName::Actor),
            Err(ChannelTableError::IndexOutOfBounds {
                channel_index: 9,
                max_channels: 4
            })
        );
    }

    #[test]
    fn table_full_reports_locally() {
        let mut table = ChannelTable::new(3);
        table.allocate(ChannelName::Actor).unwrap();
        table.allocate(ChannelName::Actor).unwrap();
        assert_eq!(
            table.allocate(ChannelName::Actor),
            Err(ChannelTableError::TableFull { max_channels: 3 })
        );
    }

    #[test]
    fn draining_index_not_reused() {
        let mut table = ChannelTable::new(4);
        let index = table.allocate(ChannelName::Actor).unwrap();

        // leave an unacked reliable bunch in flight, then close
        {
            let channel = table.get_mut(index).unwrap();
            let bunches = channel.send_bunch(b"x", 8, true).unwrap();
            channel.bunch_sent(bunches[0].ch_sequence, 1);
            let close = channel.send_close_bunch(CloseReason::Destroyed).unwrap();
            channel.bunch_sent(close[0].ch_sequence, 2);
        }

        assert!(table.reap_drained().is_empty());
        assert_eq!(
            table.create_at(index, ChannelName::Actor),
            Err(ChannelTableError::IndexDraining {
                channel_index: index
            })
        );

        let channel = table.get_mut(index).unwrap();
        channel.received_ack(1);
        channel.received_ack(2);
        assert_eq!(table.reap_drained(), vec![index]);
        assert!(table.create_at(index, ChannelName::Actor).is_ok());
    }
}
