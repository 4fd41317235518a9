//! Fixed pool of sector slots shared between the read state machine (producer) and the consumer
//!
//! Slots are overwritten in order, like a FIFO, but they're looked up by block number so a
//! consumer can find any sector still present regardless of the order it was decoded in.

use std::cmp::min;
use std::convert::TryFrom;

/// Size of a cooked data sector
pub const SECTOR_SIZE: usize = 2048;

pub struct SectorSlot {
    /// Sector payload
    data: Box<[u8; SECTOR_SIZE]>,
    /// Block currently held by the slot, `None` if empty or being overwritten
    tag: Option<u32>,
}

impl SectorSlot {
    fn new() -> SectorSlot {
        SectorSlot {
            data: Box::new([0; SECTOR_SIZE]),
            tag: None,
        }
    }

    pub fn tag(&self) -> Option<u32> {
        self.tag
    }
}

/// Byte range the consumer is still waiting for. Consumer reads don't have to be sector aligned.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ReadDemand {
    /// Absolute byte offset of the next byte to deliver, from the start of block 0
    pub offset: u64,
    /// Number of bytes left to deliver
    pub remaining: u64,
}

impl ReadDemand {
    pub fn from_blocks(start: u32, count: u32) -> ReadDemand {
        ReadDemand {
            offset: u64::from(start) * SECTOR_SIZE as u64,
            remaining: u64::from(count) * SECTOR_SIZE as u64,
        }
    }

    /// Block containing the next byte to deliver, `None` if the offset is past anything a
    /// block number can describe
    pub fn checked_block(&self) -> Option<u32> {
        u32::try_from(self.offset / SECTOR_SIZE as u64).ok()
    }

    /// Block containing the next byte to deliver, saturated to `u32::MAX`
    pub fn block(&self) -> u32 {
        self.checked_block().unwrap_or(u32::MAX)
    }

    /// First block past the end of the demand, saturated to `u32::MAX`
    pub fn end_block(&self) -> u32 {
        let end = self.end_offset();
        let size = SECTOR_SIZE as u64;

        let mut blocks = end / size;

        if end % size != 0 {
            blocks += 1;
        }

        u32::try_from(blocks).unwrap_or(u32::MAX)
    }

    pub fn end_offset(&self) -> u64 {
        self.offset.saturating_add(self.remaining)
    }

    pub fn is_satisfied(&self) -> bool {
        self.remaining == 0
    }

    pub fn advance(&mut self, bytes: u64) {
        debug_assert!(bytes <= self.remaining);

        self.offset += bytes;
        self.remaining -= bytes;
    }
}

pub struct RingBuffer {
    slots: Vec<SectorSlot>,
    /// Index of the next slot to overwrite
    next_fill: usize,
    /// Slot most recently handed to the consumer
    active_consumer_slot: Option<usize>,
    /// Slot being filled and the block it's going to hold. There's never more than one.
    filling: Option<(usize, u32)>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> RingBuffer {
        RingBuffer {
            slots: (0..capacity).map(|_| SectorSlot::new()).collect(),
            next_fill: 0,
            active_consumer_slot: None,
            filling: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[SectorSlot] {
        &self.slots
    }

    pub fn active_consumer_slot(&self) -> Option<usize> {
        self.active_consumer_slot
    }

    /// Slot currently being filled, if any
    pub fn filling(&self) -> Option<usize> {
        self.filling.map(|(i, _)| i)
    }

    pub fn lookup(&self, block: u32) -> Option<usize> {
        self.slots.iter().position(|s| s.tag == Some(block))
    }

    pub fn contains(&self, block: u32) -> bool {
        self.lookup(block).is_some()
    }

    /// Grab the next slot to receive `block`. The slot is marked empty until `commit_fill` is
    /// called. If a previous fill was never committed it's abandoned, its slot stays empty.
    pub fn begin_fill(&mut self, block: u32) -> usize {
        if let Some((index, pending)) = self.filling.take() {
            warn!(
                "Abandoning uncommitted fill of block {} in slot {}",
                pending, index
            );
        }

        // Make sure we never end up with two slots claiming the same block
        if let Some(stale) = self.lookup(block) {
            self.slots[stale].tag = None;
        }

        let index = self.next_fill;

        self.slots[index].tag = None;
        self.next_fill = (index + 1) % self.slots.len();
        self.filling = Some((index, block));

        index
    }

    /// Payload of the slot being filled
    pub fn fill_buffer(&mut self, index: usize) -> &mut [u8; SECTOR_SIZE] {
        &mut self.slots[index].data
    }

    /// Publish the slot returned by `begin_fill`. Returns false (and leaves the ring untouched)
    /// if `index`/`block` don't match the pending fill.
    pub fn commit_fill(&mut self, index: usize, block: u32) -> bool {
        if self.filling != Some((index, block)) {
            warn!(
                "Commit of block {} in slot {} doesn't match pending fill {:?}",
                block, index, self.filling
            );
            return false;
        }

        self.slots[index].tag = Some(block);
        self.filling = None;

        true
    }

    /// Drop the pending fill, if any. Its slot stays empty until it's overwritten.
    pub fn abandon_fill(&mut self) {
        self.filling = None;
    }

    /// Forget every sector. Any pending fill is abandoned as well.
    pub fn invalidate_all(&mut self) {
        for slot in &mut self.slots {
            slot.tag = None;
        }

        self.filling = None;
        self.active_consumer_slot = None;
    }

    /// Copy the contiguous run of cached bytes starting at `demand.offset` into `dst` and
    /// advance `demand` accordingly. Returns the number of bytes copied, 0 if the block
    /// containing `demand.offset` isn't in the ring.
    pub fn drain(&mut self, dst: &mut [u8], demand: &mut ReadDemand) -> usize {
        let mut copied = 0;

        while copied < dst.len() && !demand.is_satisfied() {
            let index = match demand.checked_block().and_then(|b| self.lookup(b)) {
                Some(i) => i,
                None => break,
            };

            let start = (demand.offset % SECTOR_SIZE as u64) as usize;

            let len = min(SECTOR_SIZE - start, dst.len() - copied);
            let len = min(len as u64, demand.remaining) as usize;

            dst[copied..copied + len].copy_from_slice(&self.slots[index].data[start..start + len]);

            copied += len;
            demand.advance(len as u64);
            self.active_consumer_slot = Some(index);
        }

        copied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(block: u32) -> [u8; SECTOR_SIZE] {
        let mut data = [0; SECTOR_SIZE];

        for (i, b) in data.iter_mut().enumerate() {
            *b = (block as u8).wrapping_mul(13) ^ (i as u8) ^ ((i >> 8) as u8);
        }

        data
    }

    fn fill(ring: &mut RingBuffer, block: u32) {
        let i = ring.begin_fill(block);
        *ring.fill_buffer(i) = pattern(block);
        assert!(ring.commit_fill(i, block));
    }

    /// Minimal xorshift so that the sequences are reproducible
    struct Rng(u32);

    impl Rng {
        fn next(&mut self) -> u32 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            self.0 = x;
            x
        }
    }

    fn empty_slots(ring: &RingBuffer) -> usize {
        ring.slots().iter().filter(|s| s.tag().is_none()).count()
    }

    #[test]
    fn lookup_after_fill() {
        let mut ring = RingBuffer::new(4);

        assert_eq!(ring.lookup(7), None);

        fill(&mut ring, 7);
        fill(&mut ring, 8);

        assert_eq!(ring.lookup(7), Some(0));
        assert_eq!(ring.lookup(8), Some(1));
        assert_eq!(ring.lookup(9), None);
    }

    #[test]
    fn fifo_overwrite() {
        let mut ring = RingBuffer::new(4);

        for b in 0..6 {
            fill(&mut ring, b);
        }

        assert!(!ring.contains(0));
        assert!(!ring.contains(1));
        for b in 2..6 {
            assert!(ring.contains(b));
        }
    }

    #[test]
    fn uncommitted_slot_is_never_found() {
        let mut ring = RingBuffer::new(4);

        let i = ring.begin_fill(3);
        assert_eq!(ring.filling(), Some(i));
        assert_eq!(ring.lookup(3), None);

        // Abandoned by the next fill
        fill(&mut ring, 4);
        assert_eq!(ring.lookup(3), None);
        assert_eq!(ring.filling(), None);

        // Stale commit is refused
        assert!(!ring.commit_fill(i, 3));
        assert_eq!(ring.lookup(3), None);
    }

    #[test]
    fn refill_replaces_stale_copy() {
        let mut ring = RingBuffer::new(4);

        fill(&mut ring, 10);
        fill(&mut ring, 10);

        assert_eq!(ring.slots().iter().filter(|s| s.tag() == Some(10)).count(), 1);
        assert_eq!(ring.lookup(10), Some(1));
    }

    #[test]
    fn at_most_one_open_fill() {
        let mut rng = Rng(0x1234_5678);
        let mut ring = RingBuffer::new(16);
        let mut pending: Option<(usize, u32)> = None;

        for _ in 0..10_000 {
            match rng.next() % 5 {
                0 | 1 => {
                    let block = rng.next() % 64;
                    pending = Some((ring.begin_fill(block), block));
                }
                2 | 3 => {
                    if let Some((i, b)) = pending.take() {
                        ring.commit_fill(i, b);
                    }
                }
                _ => {
                    ring.invalidate_all();
                    pending = None;
                }
            }

            let open = ring.filling().iter().count();
            assert!(open <= 1);

            // Any empty slot other than the one being filled is a slot that was never written
            // or invalidated, never a second open fill.
            if let Some(i) = ring.filling() {
                assert_eq!(ring.slots()[i].tag(), None);
            }

            // Tags are unique
            let mut tags: Vec<u32> = ring.slots().iter().filter_map(|s| s.tag()).collect();
            let n = tags.len();
            tags.sort();
            tags.dedup();
            assert_eq!(tags.len(), n);
        }
    }

    #[test]
    fn invalidate_is_idempotent() {
        let mut ring = RingBuffer::new(8);

        for b in 0..5 {
            fill(&mut ring, b);
        }
        ring.begin_fill(5);

        ring.invalidate_all();
        assert_eq!(empty_slots(&ring), 8);
        assert_eq!(ring.filling(), None);

        ring.invalidate_all();
        assert_eq!(empty_slots(&ring), 8);
        assert_eq!(ring.filling(), None);
        assert_eq!(ring.active_consumer_slot(), None);
    }

    #[test]
    fn drain_whole_sectors() {
        let mut ring = RingBuffer::new(8);

        for b in 100..104 {
            fill(&mut ring, b);
        }

        let mut demand = ReadDemand::from_blocks(100, 4);
        let mut buf = vec![0; 4 * SECTOR_SIZE];

        assert_eq!(ring.drain(&mut buf, &mut demand), 4 * SECTOR_SIZE);
        assert!(demand.is_satisfied());

        for (n, chunk) in buf.chunks(SECTOR_SIZE).enumerate() {
            assert_eq!(chunk, &pattern(100 + n as u32)[..]);
        }

        assert_eq!(ring.active_consumer_slot(), ring.lookup(103));
    }

    #[test]
    fn drain_stops_at_hole() {
        let mut ring = RingBuffer::new(8);

        fill(&mut ring, 0);
        fill(&mut ring, 1);
        fill(&mut ring, 3);

        let mut demand = ReadDemand::from_blocks(0, 4);
        let mut buf = vec![0; 4 * SECTOR_SIZE];

        assert_eq!(ring.drain(&mut buf, &mut demand), 2 * SECTOR_SIZE);
        assert_eq!(demand.block(), 2);
        assert_eq!(demand.remaining, 2 * SECTOR_SIZE as u64);

        // Nothing more until block 2 shows up
        assert_eq!(ring.drain(&mut buf, &mut demand), 0);

        fill(&mut ring, 2);
        assert_eq!(ring.drain(&mut buf, &mut demand), 2 * SECTOR_SIZE);
        assert_eq!(&buf[..SECTOR_SIZE], &pattern(2)[..]);
        assert_eq!(&buf[SECTOR_SIZE..2 * SECTOR_SIZE], &pattern(3)[..]);
    }

    #[test]
    fn drain_partial_sectors() {
        let mut ring = RingBuffer::new(8);

        fill(&mut ring, 5);
        fill(&mut ring, 6);

        // Start 100 bytes before the end of block 5, take 300 bytes
        let offset = 5 * SECTOR_SIZE as u64 + (SECTOR_SIZE as u64 - 100);
        let mut demand = ReadDemand {
            offset,
            remaining: 300,
        };
        assert_eq!(demand.block(), 5);
        assert_eq!(demand.end_block(), 7);

        let mut buf = vec![0; 1000];

        assert_eq!(ring.drain(&mut buf, &mut demand), 300);
        assert!(demand.is_satisfied());

        let p5 = pattern(5);
        let p6 = pattern(6);
        assert_eq!(&buf[..100], &p5[SECTOR_SIZE - 100..]);
        assert_eq!(&buf[100..300], &p6[..200]);
    }

    #[test]
    fn drain_limited_by_destination() {
        let mut ring = RingBuffer::new(8);

        fill(&mut ring, 0);

        let mut demand = ReadDemand::from_blocks(0, 1);
        let mut buf = vec![0; 10];

        assert_eq!(ring.drain(&mut buf, &mut demand), 10);
        assert_eq!(demand.offset, 10);
        assert_eq!(demand.remaining, SECTOR_SIZE as u64 - 10);
        assert_eq!(&buf[..], &pattern(0)[..10]);
    }

    #[test]
    fn offsets_past_the_last_block() {
        let mut ring = RingBuffer::new(4);

        fill(&mut ring, 0);

        // Would be block 0 if the block number wrapped
        let mut demand = ReadDemand {
            offset: (1 << 32) * SECTOR_SIZE as u64,
            remaining: 16,
        };
        assert_eq!(demand.checked_block(), None);
        assert_eq!(demand.block(), u32::MAX);

        let mut buf = vec![0; 16];

        assert_eq!(ring.drain(&mut buf, &mut demand), 0);
        assert_eq!(demand.remaining, 16);

        let mut demand = ReadDemand {
            offset: u64::MAX - 4,
            remaining: 16,
        };
        assert_eq!(demand.end_offset(), u64::MAX);
        assert_eq!(demand.end_block(), u32::MAX);
        assert_eq!(ring.drain(&mut buf, &mut demand), 0);
    }
}
