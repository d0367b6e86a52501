//! Buffer descriptors and the lists they travel in.
//!
//! Descriptors live in a per-stage arena ([`BufferPool`]) created when the
//! stage is created. A [`BufferRef`] is a move-only handle (slot index plus
//! generation) onto one arena slot; it is what moves between stages.
//!
//! A frame can be fanned out without copying: [`BufferRef::duplicate`] and
//! [`BufferRef::split`] create derived descriptors that point back at the
//! ultimate original and bump its duplicate/split count. The original only
//! returns to the free pool once its holder has released it *and* every
//! derived descriptor has been released.

use crate::error::{LinkError, Result};
use crate::memory::{MemAllocator, MemBlock, PoolId};
use crate::registry::StageId;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Maximum number of buffers exchanged in one [`BufferList`]
pub const MAX_BUFFERS_IN_LIST: usize = 64;

/// Channel numbers must stay below this
pub const MAX_CHANNELS: u32 = 255;

/// Largest payload carried inline in a descriptor
pub const MAX_INLINE_PAYLOAD: usize = 4096;

const PAYLOAD_ALIGN: usize = 128;

/// Payload kind carried by a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferType {
    /// Raw video frame
    #[default]
    VideoFrame,
    /// Encoded bitstream
    Bitstream,
    /// Metadata block
    Metadata,
    /// Several frames composited into one buffer
    Composite,
}

impl BufferType {
    /// Wire tag
    pub fn as_u8(self) -> u8 {
        match self {
            BufferType::VideoFrame => 0,
            BufferType::Bitstream => 1,
            BufferType::Metadata => 2,
            BufferType::Composite => 3,
        }
    }

    /// Decode a wire tag
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(BufferType::VideoFrame),
            1 => Some(BufferType::Bitstream),
            2 => Some(BufferType::Metadata),
            3 => Some(BufferType::Composite),
            _ => None,
        }
    }
}

/// Metadata the current holder of a buffer may change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferDescriptor {
    /// Payload kind
    pub buf_type: BufferType,
    /// Channel, `< MAX_CHANNELS`
    pub ch_num: u32,
    /// When the source produced the buffer, in microseconds
    pub src_timestamp: u64,
    /// When the buffer reached the current stage, in microseconds
    pub local_timestamp: u64,
    /// Valid payload bytes
    pub payload_size: u32,
    /// Opaque address of the payload in the allocator's address space
    pub payload_addr: u64,
    /// Free-form flags carried across stages
    pub flags: u32,
}

/// Integer form of a [`BufferRef`], for crossing a processor boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawBuffer {
    /// Arena slot
    pub slot: u32,
    /// Generation the slot had when the handle was made
    pub generation: u32,
}

impl RawBuffer {
    /// Pack into one word
    pub fn to_u64(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.slot)
    }

    /// Unpack from one word
    pub fn from_u64(word: u64) -> Self {
        Self {
            slot: word as u32,
            generation: (word >> 32) as u32,
        }
    }
}

/// What a release did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The original went back to its owner's free pool
    Recycled,
    /// The original is released but derived descriptors still hold it
    Deferred,
    /// A derived descriptor was retired; the original is still held
    Derived,
}

/// A descriptor that just returned to its free pool
#[derive(Debug, Clone)]
pub struct RecycledBuffer {
    /// Last metadata the descriptor carried
    pub descriptor: BufferDescriptor,
    private: Vec<(StageId, u64)>,
}

impl RecycledBuffer {
    /// Private word a stage attached while holding the buffer
    pub fn private(&self, owner: StageId) -> Option<u64> {
        lookup_private(&self.private, owner)
    }
}

type RecycleHook = Box<dyn Fn(&RecycledBuffer) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotKind {
    Original,
    Duplicate { origin: u32 },
    Split { origin: u32, offset: usize, len: usize },
}

/// Payload of an original, under its own lock rather than the pool's
#[derive(Debug)]
struct Payload {
    addr: u64,
    size: usize,
    block: Arc<RwLock<MemBlock>>,
}

impl Payload {
    fn new(block: MemBlock) -> Self {
        Self {
            addr: block.addr(),
            size: block.size(),
            block: Arc::new(RwLock::new(block)),
        }
    }
}

#[derive(Debug)]
struct Slot {
    desc: BufferDescriptor,
    kind: SlotKind,
    generation: u32,
    live: bool,
    private: Vec<(StageId, u64)>,
    // Original slots only
    payload: Option<Payload>,
    dup_count: u32,
    split_count: u32,
    released: bool,
}

impl Slot {
    fn new(kind: SlotKind, payload: Option<Payload>) -> Self {
        let payload_addr = payload.as_ref().map_or(0, |p| p.addr);
        Self {
            desc: BufferDescriptor {
                payload_addr,
                ..Default::default()
            },
            kind,
            generation: 0,
            live: false,
            private: Vec::new(),
            payload,
            dup_count: 0,
            split_count: 0,
            released: false,
        }
    }

    fn retire(&mut self) {
        self.live = false;
        self.generation = self.generation.wrapping_add(1);
    }
}

#[derive(Debug)]
struct PoolInner {
    slots: Vec<Slot>,
    free_originals: VecDeque<u32>,
    free_derived: Vec<u32>,
    recycled: u64,
}

impl PoolInner {
    fn check(&self, slot: u32, generation: u32) -> Result<()> {
        match self.slots.get(slot as usize) {
            Some(s) if s.live && s.generation == generation => Ok(()),
            Some(_) => Err(LinkError::violation(format!(
                "buffer slot {slot} (generation {generation}) was already released"
            ))),
            None => Err(LinkError::violation(format!("buffer slot {slot} does not exist"))),
        }
    }

    fn origin_of(&self, slot: u32) -> u32 {
        match self.slots[slot as usize].kind {
            SlotKind::Original => slot,
            SlotKind::Duplicate { origin } | SlotKind::Split { origin, .. } => origin,
        }
    }

    /// Byte range of the original payload visible through `slot`
    fn view(&self, slot: u32) -> (usize, usize) {
        let origin = self.origin_of(slot);
        let capacity = self.slots[origin as usize]
            .payload
            .as_ref()
            .map_or(0, |p| p.size);
        match self.slots[slot as usize].kind {
            SlotKind::Split { offset, len, .. } => (offset, len),
            _ => (0, capacity),
        }
    }

    /// Address of the first byte of the view through `slot`, 0 without payload
    fn view_addr(&self, slot: u32) -> u64 {
        let origin = self.origin_of(slot);
        let (offset, _) = self.view(slot);
        self.slots[origin as usize]
            .payload
            .as_ref()
            .map_or(0, |p| p.addr + offset as u64)
    }

    fn recycle(&mut self, slot: u32) -> RecycledBuffer {
        let s = &mut self.slots[slot as usize];
        s.retire();
        s.released = false;
        self.free_originals.push_back(slot);
        self.recycled += 1;
        RecycledBuffer {
            descriptor: s.desc,
            private: std::mem::take(&mut s.private),
        }
    }
}

fn lookup_private(private: &[(StageId, u64)], owner: StageId) -> Option<u64> {
    private
        .iter()
        .find(|(id, _)| *id == owner)
        .map(|&(_, value)| value)
}

/// Snapshot of a pool's occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Originals ready to be acquired
    pub free: usize,
    /// Originals acquired and not yet back in the pool
    pub outstanding: usize,
    /// Live duplicate/split descriptors
    pub derived: usize,
    /// Times an original returned to the pool
    pub recycled: u64,
}

/// Arena of descriptors owned by one stage
pub struct BufferPool {
    owner: StageId,
    num_buffers: usize,
    allocator: Arc<dyn MemAllocator>,
    inner: Mutex<PoolInner>,
    recycle_hook: RwLock<Option<RecycleHook>>,
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("owner", &self.owner)
            .field("num_buffers", &self.num_buffers)
            .field("status", &self.status())
            .finish()
    }
}

impl BufferPool {
    /// Allocate `num_buffers` originals with `payload_size` bytes each from
    /// `pool`, plus room for `max_derived` duplicate/split descriptors
    ///
    /// A `payload_size` of zero creates descriptor-only buffers whose
    /// payload lives elsewhere and is referenced by address.
    pub fn new(
        owner: StageId,
        num_buffers: usize,
        payload_size: usize,
        allocator: Arc<dyn MemAllocator>,
        pool: PoolId,
        max_derived: usize,
    ) -> Result<Arc<Self>> {
        if num_buffers == 0 {
            return Err(LinkError::invalid(format!(
                "stage {owner}: buffer pool needs at least one buffer"
            )));
        }
        if num_buffers + max_derived > u32::MAX as usize {
            return Err(LinkError::exhausted(format!(
                "stage {owner}: {num_buffers} + {max_derived} descriptors exceed the slot space"
            )));
        }

        let mut slots = Vec::with_capacity(num_buffers + max_derived);
        for _ in 0..num_buffers {
            let payload = if payload_size > 0 {
                Some(Payload::new(allocator.alloc(pool, payload_size, PAYLOAD_ALIGN)?))
            } else {
                None
            };
            slots.push(Slot::new(SlotKind::Original, payload));
        }
        for _ in 0..max_derived {
            slots.push(Slot::new(SlotKind::Duplicate { origin: 0 }, None));
        }

        tracing::debug!(%owner, num_buffers, payload_size, max_derived, "buffer pool created");
        Ok(Arc::new(Self {
            owner,
            num_buffers,
            allocator,
            inner: Mutex::new(PoolInner {
                slots,
                free_originals: (0..num_buffers as u32).collect(),
                free_derived: (num_buffers as u32..(num_buffers + max_derived) as u32)
                    .rev()
                    .collect(),
                recycled: 0,
            }),
            recycle_hook: RwLock::new(None),
        }))
    }

    /// Stage that owns this pool
    pub fn owner(&self) -> StageId {
        self.owner
    }

    /// Number of original descriptors
    pub fn num_buffers(&self) -> usize {
        self.num_buffers
    }

    /// Call `hook` every time an original returns to the free pool
    ///
    /// The hook runs after the pool lock is dropped, on the releasing thread.
    pub fn set_recycle_hook(&self, hook: impl Fn(&RecycledBuffer) + Send + Sync + 'static) {
        *self.recycle_hook.write() = Some(Box::new(hook));
    }

    /// Take a free original, or `None` if all are in use
    pub fn acquire(self: &Arc<Self>) -> Option<BufferRef> {
        let mut inner = self.inner.lock();
        let slot = inner.free_originals.pop_front()?;
        let s = &mut inner.slots[slot as usize];
        s.live = true;
        s.released = false;
        s.desc = BufferDescriptor {
            payload_addr: s.payload.as_ref().map_or(0, |p| p.addr),
            ..Default::default()
        };
        let generation = s.generation;
        Some(BufferRef::held(self, slot, generation))
    }

    /// Rebuild a handle from its integer form
    ///
    /// The rebuilt handle owns the reference, so pair it with
    /// [`BufferRef::into_raw`]. Fails with `ProtocolViolation` if the slot
    /// was released since the handle was made.
    pub fn from_raw(self: &Arc<Self>, raw: RawBuffer) -> Result<BufferRef> {
        self.inner.lock().check(raw.slot, raw.generation)?;
        Ok(BufferRef::held(self, raw.slot, raw.generation))
    }

    /// Occupancy snapshot
    pub fn status(&self) -> PoolStatus {
        let inner = self.inner.lock();
        let free = inner.free_originals.len();
        let derived_slots = inner.slots.len() - self.num_buffers;
        PoolStatus {
            free,
            outstanding: self.num_buffers - free,
            derived: derived_slots - inner.free_derived.len(),
            recycled: inner.recycled,
        }
    }

    fn run_hook(&self, recycled: Option<RecycledBuffer>) {
        if let Some(recycled) = recycled {
            if let Some(hook) = self.recycle_hook.read().as_ref() {
                hook(&recycled);
            }
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        for slot in self.inner.get_mut().slots.iter_mut() {
            let Some(payload) = slot.payload.take() else {
                continue;
            };
            match Arc::try_unwrap(payload.block) {
                Ok(block) => {
                    if let Err(e) = self.allocator.free(block.into_inner()) {
                        tracing::warn!(owner = %self.owner, error = %e, "failed to free payload");
                    }
                }
                Err(_) => tracing::warn!(owner = %self.owner, "payload still borrowed, not freed"),
            }
        }
    }
}

/// Move-only handle onto one descriptor
///
/// Hand it back with [`BufferRef::release`] (usually by the owning stage
/// when a consumer returns it). A handle dropped without a release is
/// released on drop and logged, so the slot is never lost.
#[must_use = "a buffer must be released back to its pool"]
pub struct BufferRef {
    pool: Arc<BufferPool>,
    slot: u32,
    generation: u32,
    held: bool,
}

impl fmt::Debug for BufferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRef")
            .field("owner", &self.pool.owner)
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for BufferRef {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        match self.give_back() {
            Ok(outcome) => tracing::warn!(
                owner = %self.pool.owner,
                slot = self.slot,
                ?outcome,
                "buffer dropped without release"
            ),
            Err(e) => tracing::debug!(
                owner = %self.pool.owner,
                slot = self.slot,
                error = %e,
                "stale handle dropped"
            ),
        }
    }
}

impl BufferRef {
    fn held(pool: &Arc<BufferPool>, slot: u32, generation: u32) -> Self {
        Self {
            pool: Arc::clone(pool),
            slot,
            generation,
            held: true,
        }
    }

    /// Pool the descriptor belongs to
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Stage that owns the descriptor's pool
    pub fn owner(&self) -> StageId {
        self.pool.owner
    }

    /// Integer form, see [`BufferPool::from_raw`]
    pub fn to_raw(&self) -> RawBuffer {
        RawBuffer {
            slot: self.slot,
            generation: self.generation,
        }
    }

    /// Give up the handle but keep the reference, to be rebuilt with
    /// [`BufferPool::from_raw`]
    pub fn into_raw(mut self) -> RawBuffer {
        self.held = false;
        self.to_raw()
    }

    /// True for a descriptor made by [`BufferRef::duplicate`]
    pub fn is_duplicate(&self) -> Result<bool> {
        let inner = self.pool.inner.lock();
        inner.check(self.slot, self.generation)?;
        Ok(matches!(
            inner.slots[self.slot as usize].kind,
            SlotKind::Duplicate { .. }
        ))
    }

    /// Copy of the current metadata
    pub fn descriptor(&self) -> Result<BufferDescriptor> {
        let inner = self.pool.inner.lock();
        inner.check(self.slot, self.generation)?;
        Ok(inner.slots[self.slot as usize].desc)
    }

    /// Change metadata; rejected changes leave the descriptor untouched
    ///
    /// Pointing `payload_addr` away from the local payload turns the
    /// descriptor into a reference to a payload held elsewhere; its size is
    /// then not bounded by the local buffer and its bytes are not readable
    /// through [`BufferRef::with_payload`].
    pub fn update(&self, f: impl FnOnce(&mut BufferDescriptor)) -> Result<()> {
        let mut inner = self.pool.inner.lock();
        inner.check(self.slot, self.generation)?;
        let (_, view_len) = inner.view(self.slot);
        let local_addr = inner.view_addr(self.slot);
        let has_payload = inner.slots[inner.origin_of(self.slot) as usize]
            .payload
            .is_some();

        let mut desc = inner.slots[self.slot as usize].desc;
        f(&mut desc);
        if desc.ch_num >= MAX_CHANNELS {
            return Err(LinkError::invalid(format!(
                "channel {} must be below {MAX_CHANNELS}",
                desc.ch_num
            )));
        }
        if has_payload && desc.payload_addr == local_addr && desc.payload_size as usize > view_len {
            return Err(LinkError::invalid(format!(
                "payload size {} exceeds the {view_len}-byte buffer",
                desc.payload_size
            )));
        }
        inner.slots[self.slot as usize].desc = desc;
        Ok(())
    }

    /// Block behind this descriptor and the byte range it sees
    fn payload_view(&self, inner: &PoolInner) -> Option<(Arc<RwLock<MemBlock>>, usize, usize)> {
        let (offset, len) = inner.view(self.slot);
        let origin = inner.origin_of(self.slot);
        inner.slots[origin as usize]
            .payload
            .as_ref()
            .map(|p| (Arc::clone(&p.block), offset, len))
    }

    /// Read the valid payload bytes (`payload_size` of them)
    ///
    /// `f` sees an empty slice when the payload is not held locally. Only
    /// the payload's own lock is held while `f` runs; `f` must not write
    /// the same payload.
    pub fn with_payload<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let view = {
            let inner = self.pool.inner.lock();
            inner.check(self.slot, self.generation)?;
            let desc = inner.slots[self.slot as usize].desc;
            if desc.payload_addr != inner.view_addr(self.slot) {
                None
            } else {
                let size = desc.payload_size as usize;
                self.payload_view(&inner)
                    .map(|(block, offset, len)| (block, offset, size.min(len)))
            }
        };
        match view {
            Some((block, offset, size)) => Ok(f(&block.read().as_slice()[offset..offset + size])),
            None => Ok(f(&[])),
        }
    }

    /// Write into the whole payload area visible through this descriptor
    ///
    /// Duplicates share the original's bytes and may only read them.
    pub fn with_payload_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let view = {
            let inner = self.pool.inner.lock();
            inner.check(self.slot, self.generation)?;
            if matches!(
                inner.slots[self.slot as usize].kind,
                SlotKind::Duplicate { .. }
            ) {
                return Err(LinkError::violation(format!(
                    "slot {} is a duplicate; its payload is read-only",
                    self.slot
                )));
            }
            self.payload_view(&inner)
        };
        match view {
            Some((block, offset, len)) => {
                Ok(f(&mut block.write().as_mut_slice()[offset..offset + len]))
            }
            None => Ok(f(&mut [])),
        }
    }

    /// Attach a private word for stage `owner`; other stages ignore it
    pub fn set_private(&self, owner: StageId, value: u64) -> Result<()> {
        let mut inner = self.pool.inner.lock();
        inner.check(self.slot, self.generation)?;
        let private = &mut inner.slots[self.slot as usize].private;
        match private.iter_mut().find(|(id, _)| *id == owner) {
            Some(entry) => entry.1 = value,
            None => private.push((owner, value)),
        }
        Ok(())
    }

    /// Private word stage `owner` attached, if any
    pub fn private(&self, owner: StageId) -> Result<Option<u64>> {
        let inner = self.pool.inner.lock();
        inner.check(self.slot, self.generation)?;
        Ok(lookup_private(
            &inner.slots[self.slot as usize].private,
            owner,
        ))
    }

    fn derive(
        &self,
        kind_for: impl FnOnce(u32, (usize, usize)) -> Result<SlotKind>,
    ) -> Result<BufferRef> {
        let mut inner = self.pool.inner.lock();
        inner.check(self.slot, self.generation)?;
        let origin = inner.origin_of(self.slot);
        let view = inner.view(self.slot);
        let kind = kind_for(origin, view)?;

        let slot = inner.free_derived.pop().ok_or_else(|| {
            LinkError::exhausted(format!(
                "stage {}: no duplicate/split descriptors left",
                self.pool.owner
            ))
        })?;
        let mut desc = inner.slots[self.slot as usize].desc;
        let block_addr = inner.view_addr(origin);
        if let SlotKind::Split { offset, len, .. } = kind {
            desc.payload_addr = block_addr + offset as u64;
            desc.payload_size = len as u32;
        }

        let o = &mut inner.slots[origin as usize];
        match kind {
            SlotKind::Split { .. } => o.split_count += 1,
            _ => o.dup_count += 1,
        }

        let s = &mut inner.slots[slot as usize];
        s.kind = kind;
        s.desc = desc;
        s.live = true;
        s.private.clear();
        Ok(BufferRef::held(&self.pool, slot, s.generation))
    }

    /// New descriptor sharing this buffer's payload
    ///
    /// Counts against the ultimate original, so duplicating a duplicate
    /// still keeps the original alive.
    pub fn duplicate(&self) -> Result<BufferRef> {
        self.derive(|origin, _| Ok(SlotKind::Duplicate { origin }))
    }

    /// New descriptor over `len` bytes at `offset` within this buffer's
    /// payload view
    pub fn split(&self, offset: usize, len: usize) -> Result<BufferRef> {
        self.derive(|origin, (base, view_len)| {
            if len == 0 || offset.checked_add(len).map_or(true, |end| end > view_len) {
                return Err(LinkError::invalid(format!(
                    "split {offset}+{len} is outside the {view_len}-byte view"
                )));
            }
            Ok(SlotKind::Split {
                origin,
                offset: base + offset,
                len,
            })
        })
    }

    /// Give up this reference
    ///
    /// Releasing the same descriptor twice is a `ProtocolViolation`.
    pub fn release(mut self) -> Result<Release> {
        self.held = false;
        self.give_back()
    }

    fn give_back(&self) -> Result<Release> {
        let (outcome, recycled) = {
            let mut inner = self.pool.inner.lock();
            inner.check(self.slot, self.generation)?;
            match inner.slots[self.slot as usize].kind {
                SlotKind::Original => {
                    let s = &mut inner.slots[self.slot as usize];
                    if s.released {
                        return Err(LinkError::violation(format!(
                            "original buffer slot {} released twice",
                            self.slot
                        )));
                    }
                    s.released = true;
                    if s.dup_count == 0 && s.split_count == 0 {
                        (Release::Recycled, Some(inner.recycle(self.slot)))
                    } else {
                        (Release::Deferred, None)
                    }
                }
                kind @ (SlotKind::Duplicate { origin } | SlotKind::Split { origin, .. }) => {
                    inner.slots[self.slot as usize].retire();
                    inner.free_derived.push(self.slot);

                    let o = &mut inner.slots[origin as usize];
                    let count = match kind {
                        SlotKind::Split { .. } => &mut o.split_count,
                        _ => &mut o.dup_count,
                    };
                    *count = count.checked_sub(1).ok_or_else(|| {
                        LinkError::violation(format!(
                            "derived count of original slot {origin} underflowed"
                        ))
                    })?;
                    if o.released && o.dup_count == 0 && o.split_count == 0 {
                        (Release::Recycled, Some(inner.recycle(origin)))
                    } else {
                        (Release::Derived, None)
                    }
                }
            }
        };
        self.pool.run_hook(recycled);
        Ok(outcome)
    }
}

/// Bounded, ordered list of buffers exchanged in one call
///
/// An empty list is the normal "nothing available right now" answer.
#[derive(Debug)]
pub struct BufferList {
    buffers: Vec<BufferRef>,
    capacity: usize,
}

impl BufferList {
    /// Empty list holding up to [`MAX_BUFFERS_IN_LIST`] buffers
    pub fn new() -> Self {
        Self {
            buffers: Vec::with_capacity(MAX_BUFFERS_IN_LIST),
            capacity: MAX_BUFFERS_IN_LIST,
        }
    }

    /// Empty list with a configured capacity in `1..=MAX_BUFFERS_IN_LIST`
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > MAX_BUFFERS_IN_LIST {
            return Err(LinkError::Config(format!(
                "buffer list capacity must be in 1..={MAX_BUFFERS_IN_LIST}, got {capacity}"
            )));
        }
        Ok(Self {
            buffers: Vec::with_capacity(capacity),
            capacity,
        })
    }

    /// Append a buffer, handing it back if the list is full
    pub fn push(&mut self, buf: BufferRef) -> std::result::Result<(), BufferRef> {
        if self.buffers.len() >= self.capacity {
            return Err(buf);
        }
        self.buffers.push(buf);
        Ok(())
    }

    /// Number of buffers in the list
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// True if the list holds no buffers
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// True if another push would fail
    pub fn is_full(&self) -> bool {
        self.buffers.len() >= self.capacity
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterate in list order
    pub fn iter(&self) -> std::slice::Iter<'_, BufferRef> {
        self.buffers.iter()
    }

    /// Buffers as a slice
    pub fn as_slice(&self) -> &[BufferRef] {
        &self.buffers
    }

    /// Remove every buffer, keeping the capacity
    pub fn drain(&mut self) -> std::vec::Drain<'_, BufferRef> {
        self.buffers.drain(..)
    }
}

impl Default for BufferList {
    fn default() -> Self {
        Self::new()
    }
}

impl IntoIterator for BufferList {
    type Item = BufferRef;
    type IntoIter = std::vec::IntoIter<BufferRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.buffers.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HeapAllocator;

    fn pool(num: usize, payload: usize) -> Arc<BufferPool> {
        BufferPool::new(
            StageId::new(0, 1),
            num,
            payload,
            Arc::new(HeapAllocator::new()),
            PoolId::FRAME,
            8,
        )
        .unwrap()
    }

    #[test]
    fn test_acquire_until_exhausted() {
        let pool = pool(2, 16);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.status().outstanding, 2);
        assert_eq!(a.release().unwrap(), Release::Recycled);
        assert_eq!(b.release().unwrap(), Release::Recycled);
        assert_eq!(pool.status().free, 2);
    }

    #[test]
    fn test_two_duplicates_recycle_on_third_release() {
        let pool = pool(1, 16);
        let original = pool.acquire().unwrap();
        let dup1 = original.duplicate().unwrap();
        let dup2 = dup1.duplicate().unwrap();

        assert_eq!(original.release().unwrap(), Release::Deferred);
        assert_eq!(pool.status().free, 0);
        assert_eq!(dup2.release().unwrap(), Release::Derived);
        assert_eq!(pool.status().free, 0);
        assert_eq!(dup1.release().unwrap(), Release::Recycled);
        assert_eq!(pool.status().free, 1);
        assert_eq!(pool.status().recycled, 1);
        assert_eq!(pool.status().derived, 0);
    }

    #[test]
    fn test_original_released_last() {
        let pool = pool(1, 16);
        let original = pool.acquire().unwrap();
        let dup = original.duplicate().unwrap();
        assert_eq!(dup.release().unwrap(), Release::Derived);
        assert_eq!(original.release().unwrap(), Release::Recycled);
    }

    #[test]
    fn test_double_release_detected() {
        let pool = pool(1, 16);
        let original = pool.acquire().unwrap();
        let raw = original.to_raw();
        original.release().unwrap();
        assert!(matches!(
            pool.from_raw(raw),
            Err(LinkError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_double_release_of_deferred_original_detected() {
        let pool = pool(1, 16);
        let original = pool.acquire().unwrap();
        let dup = original.duplicate().unwrap();
        let alias = pool.from_raw(original.to_raw()).unwrap();
        assert_eq!(original.release().unwrap(), Release::Deferred);
        assert!(matches!(
            alias.release(),
            Err(LinkError::ProtocolViolation(_))
        ));
        assert_eq!(dup.release().unwrap(), Release::Recycled);
    }

    #[test]
    fn test_stale_duplicate_detected() {
        let pool = pool(1, 16);
        let original = pool.acquire().unwrap();
        let dup = original.duplicate().unwrap();
        let alias = pool.from_raw(dup.to_raw()).unwrap();
        dup.release().unwrap();
        assert!(matches!(
            alias.release(),
            Err(LinkError::ProtocolViolation(_))
        ));
        original.release().unwrap();
    }

    #[test]
    fn test_derived_slots_exhausted() {
        let pool = BufferPool::new(
            StageId::new(0, 1),
            1,
            16,
            Arc::new(HeapAllocator::new()),
            PoolId::FRAME,
            1,
        )
        .unwrap();
        let original = pool.acquire().unwrap();
        let dup = original.duplicate().unwrap();
        assert!(matches!(
            original.duplicate(),
            Err(LinkError::ResourceExhausted(_))
        ));
        dup.release().unwrap();
        original.release().unwrap();
    }

    #[test]
    fn test_duplicate_shares_payload_read_only() {
        let pool = pool(1, 8);
        let original = pool.acquire().unwrap();
        original
            .with_payload_mut(|p| p[..3].copy_from_slice(&[1, 2, 3]))
            .unwrap();
        original.update(|d| d.payload_size = 3).unwrap();

        let dup = original.duplicate().unwrap();
        assert_eq!(dup.with_payload(|p| p.to_vec()).unwrap(), vec![1, 2, 3]);
        assert!(matches!(
            dup.with_payload_mut(|p| p[0] = 9),
            Err(LinkError::ProtocolViolation(_))
        ));
        assert_eq!(
            dup.descriptor().unwrap().payload_addr,
            original.descriptor().unwrap().payload_addr
        );
        dup.release().unwrap();
        original.release().unwrap();
    }

    #[test]
    fn test_split_views_disjoint_ranges() {
        let pool = pool(1, 8);
        let original = pool.acquire().unwrap();
        original
            .with_payload_mut(|p| p.copy_from_slice(&[0, 1, 2, 3, 4, 5, 6, 7]))
            .unwrap();
        let top = original.split(0, 4).unwrap();
        let bottom = original.split(4, 4).unwrap();
        assert_eq!(bottom.with_payload(|p| p.to_vec()).unwrap(), vec![4, 5, 6, 7]);
        bottom.with_payload_mut(|p| p[0] = 40).unwrap();
        assert_eq!(
            bottom.descriptor().unwrap().payload_addr,
            original.descriptor().unwrap().payload_addr + 4
        );
        assert!(matches!(
            original.split(6, 4),
            Err(LinkError::InvalidParams(_))
        ));

        assert_eq!(original.release().unwrap(), Release::Deferred);
        assert_eq!(top.release().unwrap(), Release::Derived);
        assert_eq!(bottom.release().unwrap(), Release::Recycled);
    }

    #[test]
    fn test_update_validates_channel_and_size() {
        let pool = pool(1, 8);
        let buf = pool.acquire().unwrap();
        assert!(matches!(
            buf.update(|d| d.ch_num = 255),
            Err(LinkError::InvalidParams(_))
        ));
        assert!(matches!(
            buf.update(|d| d.payload_size = 9),
            Err(LinkError::InvalidParams(_))
        ));
        assert_eq!(buf.descriptor().unwrap().ch_num, 0);
        buf.update(|d| {
            d.ch_num = 254;
            d.buf_type = BufferType::Bitstream;
        })
        .unwrap();
        assert_eq!(buf.descriptor().unwrap().buf_type, BufferType::Bitstream);
        buf.release().unwrap();
    }

    #[test]
    fn test_external_payload_reference() {
        let pool = pool(1, 8);
        let buf = pool.acquire().unwrap();
        let local = buf.descriptor().unwrap().payload_addr;
        buf.update(|d| {
            d.payload_addr = 0xdead_0000;
            d.payload_size = 1 << 20;
        })
        .unwrap();
        assert!(buf.with_payload(|p| p.is_empty()).unwrap());
        buf.release().unwrap();

        let again = pool.acquire().unwrap();
        assert_eq!(again.descriptor().unwrap().payload_addr, local);
        again.release().unwrap();
    }

    #[test]
    fn test_private_words_per_stage() {
        let pool = pool(1, 0);
        let buf = pool.acquire().unwrap();
        let a = StageId::new(0, 2);
        let b = StageId::new(1, 3);
        buf.set_private(a, 11).unwrap();
        buf.set_private(b, 22).unwrap();
        buf.set_private(a, 12).unwrap();
        assert_eq!(buf.private(a).unwrap(), Some(12));
        assert_eq!(buf.private(b).unwrap(), Some(22));
        assert_eq!(buf.private(StageId::new(0, 9)).unwrap(), None);
        buf.release().unwrap();
    }

    #[test]
    fn test_recycle_hook_sees_private_word() {
        let pool = pool(1, 0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let tag = StageId::new(2, 5);
        pool.set_recycle_hook(move |r| sink.lock().push(r.private(tag)));

        let buf = pool.acquire().unwrap();
        buf.set_private(tag, 77).unwrap();
        let dup = buf.duplicate().unwrap();
        buf.release().unwrap();
        assert!(seen.lock().is_empty());
        dup.release().unwrap();
        assert_eq!(*seen.lock(), vec![Some(77)]);

        let again = pool.acquire().unwrap();
        assert_eq!(again.private(tag).unwrap(), None);
        again.release().unwrap();
    }

    #[test]
    fn test_pool_frees_payload_on_drop() {
        let heap = Arc::new(HeapAllocator::new());
        let pool = BufferPool::new(
            StageId::new(0, 1),
            3,
            64,
            heap.clone(),
            PoolId::FRAME,
            0,
        )
        .unwrap();
        assert_eq!(heap.used(PoolId::FRAME), 192);
        drop(pool);
        assert_eq!(heap.used(PoolId::FRAME), 0);
    }

    #[test]
    fn test_buffer_list_capacity() {
        let pool = pool(3, 0);
        let mut list = BufferList::with_capacity(2).unwrap();
        assert!(list.is_empty());
        list.push(pool.acquire().unwrap()).unwrap();
        list.push(pool.acquire().unwrap()).unwrap();
        assert!(list.is_full());
        let rejected = list.push(pool.acquire().unwrap()).unwrap_err();
        rejected.release().unwrap();
        assert_eq!(list.len(), 2);
        for buf in list {
            buf.release().unwrap();
        }
        assert!(BufferList::with_capacity(65).is_err());
        assert!(BufferList::with_capacity(0).is_err());
    }

    #[test]
    fn test_dropped_handles_return_to_pool() {
        let pool = pool(1, 16);
        let mut list = BufferList::new();
        let original = pool.acquire().unwrap();
        list.push(original.duplicate().unwrap()).unwrap();
        list.push(original).unwrap();
        drop(list);

        let status = pool.status();
        assert_eq!(status.free, 1);
        assert_eq!(status.derived, 0);
        assert_eq!(status.recycled, 1);
        let again = pool.acquire().unwrap();
        again.release().unwrap();
        assert_eq!(pool.status().recycled, 2);
    }

    #[test]
    fn test_into_raw_keeps_reference() {
        let pool = pool(1, 0);
        let raw = pool.acquire().unwrap().into_raw();
        assert_eq!(pool.status().outstanding, 1);
        let buf = pool.from_raw(raw).unwrap();
        assert_eq!(buf.release().unwrap(), Release::Recycled);
        assert_eq!(pool.status().recycled, 1);
    }

    #[test]
    fn test_payload_access_leaves_pool_usable() {
        let pool = pool(2, 8);
        let buf = pool.acquire().unwrap();
        let (tx, rx) = crossbeam::channel::bounded(1);
        buf.with_payload_mut(|p| {
            p[0] = 1;
            let other = Arc::clone(&pool);
            std::thread::spawn(move || {
                let acquired = other.acquire().map(|b| b.release().is_ok());
                let _ = tx.send(acquired);
            });
            let acquired = rx.recv_timeout(std::time::Duration::from_secs(5));
            assert_eq!(acquired, Ok(Some(true)));
        })
        .unwrap();
        buf.release().unwrap();
    }

    #[test]
    fn test_raw_word_roundtrip() {
        let raw = RawBuffer {
            slot: 7,
            generation: 3,
        };
        assert_eq!(RawBuffer::from_u64(raw.to_u64()), raw);
    }
}
