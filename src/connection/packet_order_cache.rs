use log::trace;

/// A bounded circular buffer that holds early-arrived packets until the
/// missing intermediate sequences show up, or a flush gives up and treats
/// the gap as loss. Slot index is `sequence_delta - 1`: while the cache is
/// filling, every positive-delta packet goes through it, so the in-order
/// packet lands in slot 0 and is immediately flushed back out. Routing all
/// packets through the cache keeps slot positions aligned with sequence
/// numbers. Capacity is a power of two so index arithmetic stays cheap.
pub struct PacketOrderCache {
    slots: Vec<Option<Box<[u8]>>>,
    start_idx: usize,
    count: usize,
    /// Set when an out-of-range sequence was clamped into the last slot; the
    /// next flush must then drain the whole cache, since slot positions no
    /// longer line up with sequence numbers past that point.
    force_flush_tail: bool,
}

impl PacketOrderCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two();
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            start_idx: 0,
            count: 0,
            force_flush_tail: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_filling(&self) -> bool {
        self.count > 0
    }

    /// Caches a packet that arrived `sequence_delta` ahead of the last
    /// accepted sequence. Returns false when the packet should be treated
    /// as loss instead (non-positive delta), or when the slot is already
    /// occupied (duplicate). A delta beyond capacity is clamped to the last
    /// slot and arms a whole-cache flush.
    pub fn try_cache(&mut self, sequence_delta: i32, packet: Box<[u8]>) -> bool {
        if sequence_delta <= 0 {
            return false;
        }

        let linear_idx = (sequence_delta - 1) as usize;
        let capacity = self.capacity();
        let clamped = linear_idx >= capacity - 1;
        let linear_idx = if clamped { capacity - 1 } else { linear_idx };

        if clamped {
            self.force_flush_tail = true;
        }

        let slot_idx = (self.start_idx + linear_idx) & (capacity - 1);
        if self.slots[slot_idx].is_some() {
            // duplicate arrival for a cached sequence
            return false;
        }

        trace!(
            "out-of-order cache: storing sequence offset {} (capacity: {})",
            linear_idx,
            capacity
        );
        self.slots[slot_idx] = Some(packet);
        self.count += 1;
        true
    }

    /// Drains cached packets in sequence order starting at the oldest slot,
    /// stopping at the first empty slot unless a full flush was forced.
    /// Empty slots drained during a forced flush represent sequences that
    /// never arrived; the caller counts them as loss.
    pub fn flush(&mut self, force: bool) -> Vec<Option<Box<[u8]>>> {
        let force = force || self.force_flush_tail;
        self.force_flush_tail = false;

        let capacity = self.capacity();
        let mut drained = Vec::new();

        while self.count > 0 {
            let slot = self.slots[self.start_idx].take();
            if slot.is_none() && !force {
                break;
            }

            if slot.is_some() {
                self.count -= 1;
            }
            drained.push(slot);
            self.start_idx = (self.start_idx + 1) & (capacity - 1);
        }

        // drop trailing holes; only gaps between real packets matter
        while drained.last().is_some_and(|slot| slot.is_none()) {
            drained.pop();
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(tag: u8) -> Box<[u8]> {
        vec![tag].into_boxed_slice()
    }

    #[test]
    fn rounds_capacity_to_power_of_two() {
        let cache = PacketOrderCache::new(6);
        assert_eq!(cache.capacity(), 8);
    }

    #[test]
    fn caches_and_flushes_in_sequence_order() {
        let mut cache = PacketOrderCache::new(4);
        // expected seq missing; deltas 2 and 3 arrive early
        assert!(cache.try_cache(2, packet(12)));
        assert!(cache.try_cache(3, packet(13)));

        // the missing sequence joins the cache while it is filling, then
        // the whole run flushes in order
        assert!(cache.try_cache(1, packet(11)));
        let drained = cache.flush(false);
        let tags: Vec<u8> = drained.into_iter().map(|slot| slot.unwrap()[0]).collect();
        assert_eq!(tags, vec![11, 12, 13]);
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn stops_at_gap_unless_forced() {
        let mut cache = PacketOrderCache::new(8);
        assert!(cache.try_cache(1, packet(1)));
        assert!(cache.try_cache(2, packet(2)));
        assert!(cache.try_cache(4, packet(4)));

        let drained = cache.flush(false);
        assert_eq!(drained.len(), 2);
        assert_eq!(cache.count(), 1);

        let drained = cache.flush(true);
        assert_eq!(drained.len(), 2);
        assert!(drained[0].is_none());
        assert_eq!(drained[1].as_ref().unwrap()[0], 4);
    }

    #[test]
    fn duplicate_slot_rejected() {
        let mut cache = PacketOrderCache::new(4);
        assert!(cache.try_cache(2, packet(1)));
        assert!(!cache.try_cache(2, packet(1)));
        assert_eq!(cache.count(), 1);
    }

    #[test]
    fn non_positive_delta_rejected() {
        let mut cache = PacketOrderCache::new(4);
        assert!(!cache.try_cache(0, packet(1)));
        assert!(!cache.try_cache(-3, packet(1)));
    }

    #[test]
    fn out_of_range_clamps_and_forces_full_flush() {
        let mut cache = PacketOrderCache::new(4);
        assert!(cache.try_cache(2, packet(2)));
        // delta 9 exceeds capacity; clamped into the last slot
        assert!(cache.try_cache(9, packet(9)));

        let drained = cache.flush(false);
        // whole cache drains, holes included
        assert_eq!(drained.len(), 4);
        assert!(drained[0].is_none());
        assert_eq!(drained[1].as_ref().unwrap()[0], 2);
        assert!(drained[2].is_none());
        assert_eq!(drained[3].as_ref().unwrap()[0], 9);
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn slot_indexing_wraps_after_partial_drain() {
        let mut cache = PacketOrderCache::new(4);
        assert!(cache.try_cache(1, packet(1)));
        let drained = cache.flush(false);
        assert_eq!(drained.len(), 1);
        // start index has advanced; new deltas are relative to it
        assert!(cache.try_cache(4, packet(44)));
        let drained = cache.flush(true);
        assert_eq!(drained.len(), 4);
        assert_eq!(drained[3].as_ref().unwrap()[0], 44);
    }
}
