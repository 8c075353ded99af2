//! Chunked freelist for fixed-size provider records
//!
//! VCs and EQ event records come from here instead of the global
//! allocator on the connection/event hot path.
//!
//! - Storage grows in chunks; a chunk is never shrunk or freed before
//!   the whole freelist goes away.
//! - Each refill is `refill_size` elements. After a refill the next
//!   refill size is multiplied by `growth_factor`, capped at
//!   `max_refill_size`.
//! - The free list is LIFO: a freed slot is the next one handed out.
//! - Slots are never zeroed. The caller writes a value before reading it
//!   and takes it out (or drops it) before freeing the slot.
//! - NOT internally synchronized. Keep each freelist behind the lock of
//!   the subsystem that owns it.
//!
//! The element type fixes both the element size and where the link
//! lives: free slots are tracked as typed `Slot` handles, so there is no
//! caller-supplied link offset to get wrong.

use core::mem::{self, MaybeUninit};

use crate::error::{FabricError, FabricResult};
use crate::kprint::Subsys;
use crate::{gnix_debug, gnix_trace};

/// Initial fill when the caller passes 0
pub const SFL_INIT_SIZE: usize = 100;
/// First refill size when the caller passes 0
pub const SFL_INIT_REFILL_SIZE: usize = 10;
/// Refill multiplier when the caller passes 0
pub const SFL_GROWTH_FACTOR: usize = 2;

/// Refill policy; zero fields select the defaults above
///
/// `max_refill_size == 0` resolves to the initial fill size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreelistConfig {
    pub init_size: usize,
    pub refill_size: usize,
    pub growth_factor: usize,
    pub max_refill_size: usize,
}

impl FreelistConfig {
    pub const fn new(
        init_size: usize,
        refill_size: usize,
        growth_factor: usize,
        max_refill_size: usize,
    ) -> Self {
        FreelistConfig { init_size, refill_size, growth_factor, max_refill_size }
    }

    /// Fill in defaults for unspecified fields.
    pub fn resolved(&self) -> FreelistConfig {
        let init_size = nonzero_or(self.init_size, SFL_INIT_SIZE);
        FreelistConfig {
            init_size,
            refill_size: nonzero_or(self.refill_size, SFL_INIT_REFILL_SIZE),
            growth_factor: nonzero_or(self.growth_factor, SFL_GROWTH_FACTOR),
            max_refill_size: nonzero_or(self.max_refill_size, init_size),
        }
    }
}

#[inline]
fn nonzero_or(v: usize, default: usize) -> usize {
    if v != 0 { v } else { default }
}

/// Handle to one element of a `Freelist`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot {
    chunk: u32,
    index: u32,
}

/// Pool of fixed-size `T` slots with amortized chunked growth
pub struct Freelist<T> {
    /// Every block ever allocated; released together at teardown
    chunks: Vec<Box<[MaybeUninit<T>]>>,
    /// Available slots, top of stack is handed out next
    free: Vec<Slot>,
    refill_size: usize,
    growth_factor: usize,
    max_refill_size: usize,
    /// Refills triggered by `alloc` on an empty list (the initial fill
    /// is not counted)
    refills: usize,
}

impl<T> Freelist<T> {
    /// Create a freelist and perform the initial fill.
    ///
    /// Panics if `T` is zero-sized.
    pub fn new(config: FreelistConfig) -> FabricResult<Self> {
        assert!(mem::size_of::<T>() > 0, "freelist element must not be zero-sized");

        let cfg = config.resolved();
        let mut fl = Freelist {
            chunks: Vec::new(),
            free: Vec::new(),
            refill_size: cfg.refill_size,
            growth_factor: cfg.growth_factor,
            max_refill_size: cfg.max_refill_size,
            refills: 0,
        };
        fl.refill(cfg.init_size)?;
        gnix_debug!(
            Subsys::Freelist,
            "init elem_size={} fill={} refill={} growth={} max_refill={}",
            mem::size_of::<T>(),
            cfg.init_size,
            cfg.refill_size,
            cfg.growth_factor,
            cfg.max_refill_size
        );
        Ok(fl)
    }

    /// Add one chunk of `n` slots.
    ///
    /// On allocation failure nothing is linked and `NoMemory` is returned.
    fn refill(&mut self, n: usize) -> FabricResult<()> {
        assert!(n > 0);

        let mut block: Vec<MaybeUninit<T>> = Vec::new();
        block.try_reserve_exact(n)?;
        self.chunks.try_reserve(1)?;
        self.free.try_reserve(n)?;

        block.resize_with(n, MaybeUninit::uninit);
        let chunk = u32::try_from(self.chunks.len()).map_err(|_| FabricError::NoMemory)?;
        self.chunks.push(block.into_boxed_slice());

        // Reverse so the lowest index is popped first.
        self.free.extend((0..n as u32).rev().map(|index| Slot { chunk, index }));
        gnix_trace!(Subsys::Freelist, "refill chunk={} n={}", chunk, n);
        Ok(())
    }

    /// Take a slot, growing the pool if the free list is empty.
    pub fn alloc(&mut self) -> FabricResult<Slot> {
        if let Some(slot) = self.free.pop() {
            return Ok(slot);
        }

        self.refill(self.refill_size)?;
        self.refills += 1;
        if self.refill_size < self.max_refill_size {
            let grown = self.refill_size.saturating_mul(self.growth_factor);
            self.refill_size = grown.min(self.max_refill_size);
        }

        self.free.pop().ok_or(FabricError::Again)
    }

    /// Return a slot. Whatever value it holds is not dropped.
    pub fn free(&mut self, slot: Slot) {
        debug_assert!(self.owns(slot));
        self.free.push(slot);
    }

    /// Store `value` in `slot`, overwriting without dropping the old bytes.
    pub fn write(&mut self, slot: Slot, value: T) -> &mut T {
        self.raw_mut(slot).write(value)
    }

    /// # Safety
    ///
    /// `slot` must hold a value written with `write` and not yet taken.
    pub unsafe fn get(&self, slot: Slot) -> &T {
        self.chunks[slot.chunk as usize][slot.index as usize].assume_init_ref()
    }

    /// # Safety
    ///
    /// Same contract as `get`.
    pub unsafe fn get_mut(&mut self, slot: Slot) -> &mut T {
        self.raw_mut(slot).assume_init_mut()
    }

    /// Move the value out, leaving the slot logically uninitialized.
    ///
    /// # Safety
    ///
    /// Same contract as `get`; the slot must not be read again until it
    /// is rewritten.
    pub unsafe fn take(&mut self, slot: Slot) -> T {
        self.raw_mut(slot).assume_init_read()
    }

    /// Release every chunk. Element destructors do not run and the free
    /// list is not checked for completeness. Returns the chunk count.
    pub fn destroy(self) -> usize {
        let released = self.chunks.len();
        gnix_debug!(
            Subsys::Freelist,
            "destroy chunks={} outstanding={}",
            released,
            self.in_use()
        );
        released
    }

    #[inline]
    fn raw_mut(&mut self, slot: Slot) -> &mut MaybeUninit<T> {
        &mut self.chunks[slot.chunk as usize][slot.index as usize]
    }

    /// True if `slot` points into one of this freelist's chunks.
    pub fn owns(&self, slot: Slot) -> bool {
        self.chunks
            .get(slot.chunk as usize)
            .map_or(false, |c| (slot.index as usize) < c.len())
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Total slots across all chunks
    pub fn capacity(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }

    pub fn in_use(&self) -> usize {
        self.capacity() - self.free.len()
    }

    /// Size of the next refill
    pub fn refill_size(&self) -> usize {
        self.refill_size
    }

    pub fn max_refill_size(&self) -> usize {
        self.max_refill_size
    }

    pub fn refill_count(&self) -> usize {
        self.refills
    }
}
