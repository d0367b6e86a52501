//! Lock-protected circular queue of fixed-size records in shared memory.
//!
//! The queue lives in a [`SharedRegion`] laid out as a 16-byte header
//! `{element_size, max_elements, read_index, write_index}` (four `u32`
//! words) followed by `max_elements * element_size` bytes of slot storage.
//! The two sides never share a lock. Only the producer advances the write
//! index and only the consumer advances the read index; each side
//! serializes its own callers with a local mutex.
//!
//! # Full vs. empty
//!
//! Two raw positions cannot tell "all slots used" from "no slots used".
//! Each index word therefore carries the slot position in its low 31 bits
//! (always `< max_elements`) and a lap parity in bit 31 that flips every
//! time the position wraps. With positions `r`, `w` and laps `lr`, `lw`:
//!
//! ```text
//! occupancy = w - r              if lr == lw   (writer is on the reader's lap)
//!           = max - r + w        if lr != lw   (writer is one lap ahead)
//! ```
//!
//! The writer can never be more than one lap ahead, so occupancy is always
//! in `0..=max`: empty is `occupancy == 0`, full is `occupancy == max`, and
//! both hold at once only if `max == 0`, which `create` rejects. `write`,
//! `read`, `is_empty` and `is_full` all go through the same
//! `occupancy` function.

use crate::error::{LinkError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{fence, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

/// Bytes of queue header at the start of a region
pub const HEADER_SIZE: usize = 16;

const ELEMENT_SIZE_WORD: usize = 0;
const MAX_ELEMENTS_WORD: usize = 1;
const READ_INDEX_WORD: usize = 2;
const WRITE_INDEX_WORD: usize = 3;

const LAP_BIT: u32 = 1 << 31;
const POS_MASK: u32 = !LAP_BIT;

/// Largest slot count an index word can address
pub const MAX_ELEMENTS_LIMIT: u32 = POS_MASK;

/// A block of memory visible to both participating cores
///
/// Every access is an atomic load or store, so the region can be shared
/// between threads standing in for cores without any `unsafe`.
#[derive(Debug)]
pub struct SharedRegion {
    header: [AtomicU32; 4],
    data: Box<[AtomicU8]>,
}

impl SharedRegion {
    /// Allocate a zeroed region of `size` bytes, header included
    pub fn new(size: usize) -> Result<Arc<Self>> {
        if size < HEADER_SIZE {
            return Err(LinkError::invalid(format!(
                "shared region of {size} bytes cannot hold a {HEADER_SIZE}-byte header"
            )));
        }
        let data = (0..size - HEADER_SIZE).map(|_| AtomicU8::new(0)).collect();
        Ok(Arc::new(Self {
            header: Default::default(),
            data,
        }))
    }

    /// Allocate a region sized exactly for a queue of this geometry
    pub fn for_queue(max_elements: u32, element_size: u32) -> Result<Arc<Self>> {
        Self::new(Self::required_size(max_elements, element_size))
    }

    /// Bytes needed for a queue of this geometry, header included
    pub fn required_size(max_elements: u32, element_size: u32) -> usize {
        HEADER_SIZE + max_elements as usize * element_size as usize
    }

    /// Total size in bytes, header included
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.data.len()
    }

    fn load(&self, word: usize) -> u32 {
        self.header[word].load(Ordering::Acquire)
    }

    fn store(&self, word: usize, value: u32) {
        self.header[word].store(value, Ordering::Release);
    }

    /// Force a store to complete before returning: full fence, then read
    /// the word back. The read-back is what a non-coherent reader would
    /// observe once the write has landed.
    fn store_and_complete(&self, word: usize, value: u32) {
        self.store(word, value);
        fence(Ordering::SeqCst);
        let readback = self.load(word);
        debug_assert_eq!(readback, value, "shared header word {word} did not settle");
    }

    fn complete(&self) {
        fence(Ordering::SeqCst);
        let _ = self.load(WRITE_INDEX_WORD);
    }

    fn copy_in(&self, offset: usize, src: &[u8], slot_len: usize) {
        let slot = &self.data[offset..offset + slot_len];
        for (i, byte) in slot.iter().enumerate() {
            byte.store(src.get(i).copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    fn copy_out(&self, offset: usize, dst: &mut [u8]) {
        let slot = &self.data[offset..offset + dst.len()];
        for (out, byte) in dst.iter_mut().zip(slot) {
            *out = byte.load(Ordering::Relaxed);
        }
    }
}

fn advance(index: u32, max_elements: u32) -> u32 {
    let pos = index & POS_MASK;
    let lap = index & LAP_BIT;
    if pos + 1 == max_elements {
        lap ^ LAP_BIT
    } else {
        lap | (pos + 1)
    }
}

fn occupancy(read: u32, write: u32, max_elements: u32) -> Result<u32> {
    let (r, w) = (read & POS_MASK, write & POS_MASK);
    if r >= max_elements || w >= max_elements {
        return Err(LinkError::invalid(format!(
            "queue index out of range: read {r}, write {w}, max {max_elements}"
        )));
    }
    if read & LAP_BIT == write & LAP_BIT {
        w.checked_sub(r).ok_or_else(|| {
            LinkError::invalid(format!("write index {w} behind read index {r} on the same lap"))
        })
    } else if w <= r {
        Ok(max_elements - r + w)
    } else {
        Err(LinkError::invalid(format!(
            "write index {w} more than one lap ahead of read index {r}"
        )))
    }
}

/// Local handle onto a ring queue living in a [`SharedRegion`]
///
/// Each side of the channel holds its own handle; handles on the same side
/// may be shared between threads (`write` and `read` take `&self`).
#[derive(Debug)]
pub struct IpcQueue {
    region: Arc<SharedRegion>,
    element_size: u32,
    max_elements: u32,
    lock: Mutex<()>,
}

impl IpcQueue {
    /// Initialize the header in `region` and return the creating side's handle
    pub fn create(max_elements: u32, region: Arc<SharedRegion>, element_size: u32) -> Result<Self> {
        if max_elements == 0 || element_size == 0 {
            return Err(LinkError::invalid(format!(
                "queue geometry must be non-zero: \
                 max_elements {max_elements}, element_size {element_size}"
            )));
        }
        if max_elements > MAX_ELEMENTS_LIMIT {
            return Err(LinkError::invalid(format!(
                "max_elements {max_elements} exceeds {MAX_ELEMENTS_LIMIT}"
            )));
        }
        let needed = SharedRegion::required_size(max_elements, element_size);
        if region.size() < needed {
            return Err(LinkError::invalid(format!(
                "shared region is {} bytes, queue needs {needed}",
                region.size()
            )));
        }

        let queue = Self {
            region,
            element_size,
            max_elements,
            lock: Mutex::new(()),
        };
        {
            let _guard = queue.lock.lock();
            queue.region.store(READ_INDEX_WORD, 0);
            queue.region.store(WRITE_INDEX_WORD, 0);
            queue.region.store(ELEMENT_SIZE_WORD, element_size);
            queue.region.store_and_complete(MAX_ELEMENTS_WORD, max_elements);
        }
        tracing::debug!(max_elements, element_size, "ipc queue created");
        Ok(queue)
    }

    /// Attach to a queue another side created, recovering its geometry from
    /// the shared header
    ///
    /// `reset_read` / `reset_write` move the corresponding position back to
    /// slot zero, so a restarting side can rejoin while the other keeps
    /// running. Occupancy afterwards matches plain modulo arithmetic on the
    /// zeroed positions: resetting the read side re-exposes slots
    /// `0..write`, resetting the write side leaves `max - read` slots (or
    /// none when the reader is at slot zero).
    pub fn reset(region: Arc<SharedRegion>, reset_read: bool, reset_write: bool) -> Result<Self> {
        let element_size = region.load(ELEMENT_SIZE_WORD);
        let max_elements = region.load(MAX_ELEMENTS_WORD);
        if max_elements == 0 || element_size == 0 {
            return Err(LinkError::invalid(
                "shared header holds no queue (element size or count is zero)",
            ));
        }
        if max_elements > MAX_ELEMENTS_LIMIT
            || region.size() < SharedRegion::required_size(max_elements, element_size)
        {
            return Err(LinkError::invalid(format!(
                "shared header geometry {max_elements}x{element_size} \
                 does not fit a {}-byte region",
                region.size()
            )));
        }

        let queue = Self {
            region,
            element_size,
            max_elements,
            lock: Mutex::new(()),
        };
        {
            let _guard = queue.lock.lock();
            let read = queue.region.load(READ_INDEX_WORD);
            let write = queue.region.load(WRITE_INDEX_WORD);
            match (reset_read, reset_write) {
                (true, true) => {
                    queue.region.store(READ_INDEX_WORD, 0);
                    queue.region.store(WRITE_INDEX_WORD, 0);
                }
                (true, false) => queue.region.store(READ_INDEX_WORD, write & LAP_BIT),
                (false, true) => {
                    let lap = if read & POS_MASK == 0 {
                        read & LAP_BIT
                    } else {
                        (read & LAP_BIT) ^ LAP_BIT
                    };
                    queue.region.store(WRITE_INDEX_WORD, lap);
                }
                (false, false) => {}
            }
            queue.region.complete();
        }
        tracing::debug!(
            max_elements,
            element_size,
            reset_read,
            reset_write,
            "ipc queue attached"
        );
        Ok(queue)
    }

    /// Invalidate the shared header; later operations from either side fail
    /// with `InvalidParams`
    pub fn delete(&self) -> Result<()> {
        let _guard = self.lock.lock();
        self.region.store(ELEMENT_SIZE_WORD, 0);
        self.region.store_and_complete(MAX_ELEMENTS_WORD, 0);
        tracing::debug!("ipc queue deleted");
        Ok(())
    }

    /// Slot size in bytes
    pub fn element_size(&self) -> u32 {
        self.element_size
    }

    /// Slot count
    pub fn max_elements(&self) -> u32 {
        self.max_elements
    }

    /// Shared region backing this queue
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    fn check_geometry(&self) -> Result<()> {
        let element_size = self.region.load(ELEMENT_SIZE_WORD);
        let max_elements = self.region.load(MAX_ELEMENTS_WORD);
        if element_size != self.element_size || max_elements != self.max_elements {
            return Err(LinkError::invalid(format!(
                "shared header {max_elements}x{element_size} disagrees with local handle {}x{}",
                self.max_elements, self.element_size
            )));
        }
        Ok(())
    }

    fn slot_offset(&self, index: u32) -> usize {
        (index & POS_MASK) as usize * self.element_size as usize
    }

    /// Write one element; `data` may be shorter than the element size
    /// (the rest of the slot is zeroed) but one call always uses one slot
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if data.len() > self.element_size as usize {
            return Err(LinkError::invalid(format!(
                "{} bytes do not fit a {}-byte element",
                data.len(),
                self.element_size
            )));
        }
        self.check_geometry()?;

        let _guard = self.lock.lock();
        let read = self.region.load(READ_INDEX_WORD);
        let write = self.region.load(WRITE_INDEX_WORD);
        if occupancy(read, write, self.max_elements)? == self.max_elements {
            tracing::trace!("ipc queue full");
            return Err(LinkError::Again);
        }

        self.region
            .copy_in(self.slot_offset(write), data, self.element_size as usize);
        self.region
            .store_and_complete(WRITE_INDEX_WORD, advance(write, self.max_elements));
        Ok(())
    }

    /// Read one element into `data`; the caller must know how many bytes
    /// the element carries (at most the element size)
    pub fn read(&self, data: &mut [u8]) -> Result<()> {
        if data.len() > self.element_size as usize {
            return Err(LinkError::invalid(format!(
                "cannot read {} bytes from a {}-byte element",
                data.len(),
                self.element_size
            )));
        }
        self.check_geometry()?;

        let _guard = self.lock.lock();
        let read = self.region.load(READ_INDEX_WORD);
        let write = self.region.load(WRITE_INDEX_WORD);
        if occupancy(read, write, self.max_elements)? == 0 {
            tracing::trace!("ipc queue empty");
            return Err(LinkError::Again);
        }

        self.region.copy_out(self.slot_offset(read), data);
        self.region
            .store_and_complete(READ_INDEX_WORD, advance(read, self.max_elements));
        Ok(())
    }

    /// Number of elements waiting to be read
    pub fn len(&self) -> Result<u32> {
        self.check_geometry()?;
        let _guard = self.lock.lock();
        occupancy(
            self.region.load(READ_INDEX_WORD),
            self.region.load(WRITE_INDEX_WORD),
            self.max_elements,
        )
    }

    /// True when a `read` would return `Again`
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// True when a `write` would return `Again`
    pub fn is_full(&self) -> Result<bool> {
        Ok(self.len()? == self.max_elements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(max: u32, size: u32) -> IpcQueue {
        let region = SharedRegion::for_queue(max, size).unwrap();
        IpcQueue::create(max, region, size).unwrap()
    }

    #[test]
    fn test_create_rejects_zero_geometry() {
        let region = SharedRegion::for_queue(4, 16).unwrap();
        assert!(matches!(
            IpcQueue::create(0, region.clone(), 16),
            Err(LinkError::InvalidParams(_))
        ));
        assert!(matches!(
            IpcQueue::create(4, region, 0),
            Err(LinkError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_create_rejects_small_region() {
        let region = SharedRegion::new(HEADER_SIZE + 10).unwrap();
        assert!(matches!(
            IpcQueue::create(4, region, 16),
            Err(LinkError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_four_slot_wraparound() {
        let q = queue(4, 16);
        for i in 0..4u8 {
            q.write(&[i; 16]).unwrap();
        }
        assert!(q.is_full().unwrap());
        assert!(matches!(q.write(&[9; 16]), Err(LinkError::Again)));

        let mut out = [0u8; 16];
        q.read(&mut out).unwrap();
        assert_eq!(out, [0; 16]);
        q.write(&[4; 16]).unwrap();
        assert!(q.is_full().unwrap());

        for expected in 1..=4u8 {
            q.read(&mut out).unwrap();
            assert_eq!(out, [expected; 16]);
        }
        assert!(q.is_empty().unwrap());
        assert!(matches!(q.read(&mut out), Err(LinkError::Again)));
    }

    #[test]
    fn test_index_words_carry_lap_bit() {
        let q = queue(4, 4);
        for i in 0..4u8 {
            q.write(&[i; 4]).unwrap();
        }
        // slot 0 on the second lap: the raw word is not below max_elements
        let write = q.region.load(WRITE_INDEX_WORD);
        assert_eq!(write, LAP_BIT);
        assert!(write >= q.max_elements());
        assert_eq!(write & POS_MASK, 0);
        assert_eq!(q.region.load(READ_INDEX_WORD), 0);

        let mut out = [0u8; 4];
        for _ in 0..4 {
            q.read(&mut out).unwrap();
        }
        assert_eq!(q.region.load(READ_INDEX_WORD), LAP_BIT);
        assert!(q.is_empty().unwrap());
    }

    #[test]
    fn test_full_failure_leaves_state_unchanged() {
        let q = queue(2, 4);
        q.write(&[1, 1, 1, 1]).unwrap();
        q.write(&[2, 2, 2, 2]).unwrap();
        let before = (
            q.region.load(READ_INDEX_WORD),
            q.region.load(WRITE_INDEX_WORD),
        );
        assert!(matches!(q.write(&[3, 3, 3, 3]), Err(LinkError::Again)));
        assert_eq!(
            before,
            (
                q.region.load(READ_INDEX_WORD),
                q.region.load(WRITE_INDEX_WORD)
            )
        );
        let mut out = [0u8; 4];
        q.read(&mut out).unwrap();
        assert_eq!(out, [1, 1, 1, 1]);
    }

    #[test]
    fn test_single_slot_queue() {
        let q = queue(1, 8);
        assert!(q.is_empty().unwrap());
        assert!(!q.is_full().unwrap());
        q.write(&[7]).unwrap();
        assert!(q.is_full().unwrap());
        assert!(!q.is_empty().unwrap());
        let mut out = [0u8; 1];
        q.read(&mut out).unwrap();
        assert_eq!(out, [7]);
        assert!(q.is_empty().unwrap());
    }

    #[test]
    fn test_short_write_consumes_one_slot_and_zeroes_tail() {
        let q = queue(2, 8);
        q.write(&[0xAA; 8]).unwrap();
        let mut out = [0u8; 8];
        q.read(&mut out).unwrap();
        q.write(&[0xAA; 8]).unwrap();
        q.write(&[1, 2]).unwrap();
        assert_eq!(q.len().unwrap(), 2);
        q.read(&mut out).unwrap();
        q.read(&mut out).unwrap();
        assert_eq!(out, [1, 2, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_oversized_data_rejected() {
        let q = queue(2, 4);
        assert!(matches!(
            q.write(&[0; 5]),
            Err(LinkError::InvalidParams(_))
        ));
        let mut out = [0u8; 5];
        assert!(matches!(
            q.read(&mut out),
            Err(LinkError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_reset_recovers_geometry_from_header() {
        let region = SharedRegion::for_queue(8, 12).unwrap();
        let producer = IpcQueue::create(8, region.clone(), 12).unwrap();
        producer.write(&[5; 12]).unwrap();

        let consumer = IpcQueue::reset(region, false, false).unwrap();
        assert_eq!(consumer.max_elements(), 8);
        assert_eq!(consumer.element_size(), 12);
        let mut out = [0u8; 12];
        consumer.read(&mut out).unwrap();
        assert_eq!(out, [5; 12]);
        assert!(producer.is_empty().unwrap());
    }

    #[test]
    fn test_reset_on_blank_region_fails() {
        let region = SharedRegion::for_queue(4, 4).unwrap();
        assert!(matches!(
            IpcQueue::reset(region, true, true),
            Err(LinkError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_reset_read_reexposes_written_slots() {
        let region = SharedRegion::for_queue(4, 4).unwrap();
        let producer = IpcQueue::create(4, region.clone(), 4).unwrap();
        for i in 0..3u8 {
            producer.write(&[i; 4]).unwrap();
        }
        let mut out = [0u8; 4];
        producer.read(&mut out).unwrap();
        producer.read(&mut out).unwrap();
        assert_eq!(producer.len().unwrap(), 1);

        let consumer = IpcQueue::reset(region, true, false).unwrap();
        assert_eq!(consumer.len().unwrap(), 3);
        consumer.read(&mut out).unwrap();
        assert_eq!(out, [0; 4]);
    }

    #[test]
    fn test_reset_write_after_wrap() {
        let region = SharedRegion::for_queue(4, 4).unwrap();
        let q = IpcQueue::create(4, region.clone(), 4).unwrap();
        let mut out = [0u8; 4];
        for i in 0..6u8 {
            q.write(&[i; 4]).unwrap();
            q.read(&mut out).unwrap();
        }
        // read and write both at position 2 on lap 1
        let restarted = IpcQueue::reset(region.clone(), false, true).unwrap();
        assert_eq!(restarted.len().unwrap(), 2);

        let both = IpcQueue::reset(region, true, true).unwrap();
        assert!(both.is_empty().unwrap());
    }

    #[test]
    fn test_delete_invalidates_both_sides() {
        let region = SharedRegion::for_queue(4, 4).unwrap();
        let producer = IpcQueue::create(4, region.clone(), 4).unwrap();
        let consumer = IpcQueue::reset(region, false, false).unwrap();
        producer.delete().unwrap();
        assert!(matches!(
            producer.write(&[1]),
            Err(LinkError::InvalidParams(_))
        ));
        let mut out = [0u8; 1];
        assert!(matches!(
            consumer.read(&mut out),
            Err(LinkError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_geometry_mismatch_fails_fast() {
        let region = SharedRegion::for_queue(8, 8).unwrap();
        let first = IpcQueue::create(4, region.clone(), 8).unwrap();
        let _second = IpcQueue::create(8, region, 8).unwrap();
        assert!(matches!(
            first.write(&[1]),
            Err(LinkError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_occupancy_exhaustive_small_capacities() {
        for max in 1..=5u32 {
            let q = queue(max, 1);
            let mut model = 0u32;
            // two full laps of fill-then-drain plus interleaving
            for step in 0..(4 * (max + 1) * max) {
                let write = (step / (max + 1)) % 2 == 0;
                let result = if write {
                    q.write(&[step as u8])
                } else {
                    let mut out = [0u8; 1];
                    q.read(&mut out)
                };
                match result {
                    Ok(()) if write => model += 1,
                    Ok(()) => model -= 1,
                    Err(LinkError::Again) => {
                        assert!(if write { model == max } else { model == 0 });
                    }
                    Err(e) => panic!("unexpected error {e}"),
                }
                let empty = q.is_empty().unwrap();
                let full = q.is_full().unwrap();
                assert_eq!(q.len().unwrap(), model);
                assert_eq!(empty, model == 0);
                assert_eq!(full, model == max);
                assert!(!(empty && full));
            }
        }
    }
}
