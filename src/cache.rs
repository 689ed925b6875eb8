//! Position evaluation cache.
//!
//! A direct-mapped table of `2^k` slots keyed by a 10-byte position key and
//! an [`EvalContext`]. A new entry always replaces whatever occupied its
//! slot.
//!
//! Every slot word is an atomic, so concurrent access is never undefined
//! behaviour. Two access modes are offered:
//! - locked: a per-slot spin lock makes each read and write atomic as a whole
//! - unlocked: plain relaxed accesses; a checksum over the slot contents
//!   rejects torn reads, which are reported as misses
//!
//! The unlocked mode is for single-worker use where no other thread touches
//! the table.

use std::hint;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::error::CacheError;
use crate::nn::{Outputs, NUM_OUTPUTS};

/// Opaque 10-byte position identifier.
pub type PositionKey = [u8; 10];

/// Context value of a slot that never held an entry. [`EvalContext`] never
/// packs to this.
const EMPTY_CONTEXT: u32 = u32::MAX;

const KEY_WORDS: usize = 3;

/// Packed evaluation settings an entry was computed under.
///
/// Layout:
/// - bits 0-3: plies
/// - bit 4: cubeful
/// - bit 5: pruning nets allowed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct EvalContext(u32);

impl EvalContext {
    pub const MAX_PLIES: u8 = 0xF;

    #[must_use]
    pub const fn new(plies: u8, cubeful: bool, use_prune: bool) -> Self {
        let plies = if plies > Self::MAX_PLIES {
            Self::MAX_PLIES
        } else {
            plies
        };
        EvalContext(plies as u32 | (cubeful as u32) << 4 | (use_prune as u32) << 5)
    }

    #[inline]
    #[must_use]
    pub const fn plies(self) -> u8 {
        (self.0 & 0xF) as u8
    }

    #[inline]
    #[must_use]
    pub const fn cubeful(self) -> bool {
        self.0 & (1 << 4) != 0
    }

    #[inline]
    #[must_use]
    pub const fn use_prune(self) -> bool {
        self.0 & (1 << 5) != 0
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Same settings one ply shallower.
    #[must_use]
    pub const fn shallower(self) -> Self {
        let plies = self.plies().saturating_sub(1);
        EvalContext(self.0 & !0xF | plies as u32)
    }
}

/// Result of a cache probe. `slot` is where an entry for the key belongs
/// and is passed back to [`EvalCache::add`] after a miss.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Probe {
    pub slot: usize,
    pub value: Option<Outputs>,
}

/// Counters and size of a cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CacheStats {
    pub lookups: u64,
    pub hits: u64,
    pub capacity: usize,
}

impl CacheStats {
    /// Hits per lookup, 0 when nothing was looked up.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }
}

fn key_words(key: &PositionKey) -> [u32; KEY_WORDS] {
    [
        u32::from_le_bytes([key[0], key[1], key[2], key[3]]),
        u32::from_le_bytes([key[4], key[5], key[6], key[7]]),
        u32::from_le_bytes([key[8], key[9], 0, 0]),
    ]
}

fn checksum(key: &[u32; KEY_WORDS], context: u32, values: &[u32; NUM_OUTPUTS]) -> u32 {
    let mut h: u32 = 0x811C_9DC5;
    for &w in key.iter().chain(std::iter::once(&context)).chain(values) {
        h = (h ^ w).wrapping_mul(0x0100_0193);
        h ^= h >> 15;
    }
    h
}

/// Snapshot of a slot's words.
struct SlotWords {
    key: [u32; KEY_WORDS],
    context: u32,
    values: [u32; NUM_OUTPUTS],
    check: u32,
}

impl SlotWords {
    fn verifies(&self) -> bool {
        self.check == checksum(&self.key, self.context, &self.values)
    }

    fn outputs(&self) -> Outputs {
        self.values.map(f32::from_bits)
    }
}

#[repr(C)]
struct Slot {
    key: [AtomicU32; KEY_WORDS],
    context: AtomicU32,
    values: [AtomicU32; NUM_OUTPUTS],
    check: AtomicU32,
    lock: AtomicBool,
}

/// Releases a slot's spin lock on drop.
struct SlotGuard<'a>(&'a AtomicBool);

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Slot {
    fn empty() -> Self {
        let key = [0u32; KEY_WORDS];
        let values = [0u32; NUM_OUTPUTS];
        Slot {
            key: key.map(AtomicU32::new),
            context: AtomicU32::new(EMPTY_CONTEXT),
            values: values.map(AtomicU32::new),
            check: AtomicU32::new(checksum(&key, EMPTY_CONTEXT, &values)),
            lock: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> SlotGuard<'_> {
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.lock.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
        SlotGuard(&self.lock)
    }

    fn load(&self) -> SlotWords {
        SlotWords {
            key: [0, 1, 2].map(|i| self.key[i].load(Ordering::Relaxed)),
            context: self.context.load(Ordering::Relaxed),
            values: [0, 1, 2, 3, 4].map(|i| self.values[i].load(Ordering::Relaxed)),
            check: self.check.load(Ordering::Relaxed),
        }
    }

    fn store(&self, key: &[u32; KEY_WORDS], context: u32, outputs: &Outputs) {
        let values = outputs.map(f32::to_bits);
        for (slot, &w) in self.key.iter().zip(key) {
            slot.store(w, Ordering::Relaxed);
        }
        self.context.store(context, Ordering::Relaxed);
        for (slot, &w) in self.values.iter().zip(&values) {
            slot.store(w, Ordering::Relaxed);
        }
        self.check
            .store(checksum(key, context, &values), Ordering::Relaxed);
    }

    fn clear(&mut self) {
        *self = Slot::empty();
    }
}

/// Direct-mapped evaluation cache.
pub struct EvalCache {
    slots: Box<[Slot]>,
    mask: usize,
    lookups: AtomicU64,
    hits: AtomicU64,
}

fn allocate(requested: usize) -> Result<Box<[Slot]>, CacheError> {
    let slots = requested
        .max(1)
        .checked_next_power_of_two()
        .ok_or(CacheError::Allocation { slots: requested })?;

    let mut table = Vec::new();
    table
        .try_reserve_exact(slots)
        .map_err(|_| CacheError::Allocation { slots })?;
    table.extend((0..slots).map(|_| Slot::empty()));
    Ok(table.into_boxed_slice())
}

impl EvalCache {
    /// Create a cache with at least `capacity` slots (rounded up to a power of two).
    pub fn new(capacity: usize) -> Result<Self, CacheError> {
        let slots = allocate(capacity)?;
        log::debug!("evaluation cache: {} slots", slots.len());
        Ok(Self {
            mask: slots.len() - 1,
            slots,
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        })
    }

    /// Reallocate with a new capacity. Contents and counters are lost.
    pub fn resize(&mut self, capacity: usize) -> Result<(), CacheError> {
        let slots = allocate(capacity)?;
        log::debug!(
            "evaluation cache resized: {} -> {} slots",
            self.slots.len(),
            slots.len()
        );
        self.mask = slots.len() - 1;
        self.slots = slots;
        *self.lookups.get_mut() = 0;
        *self.hits.get_mut() = 0;
        Ok(())
    }

    /// Empty every slot. Counters are kept.
    pub fn flush(&mut self) {
        self.slots.iter_mut().for_each(Slot::clear);
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slot index for a key and context.
    #[inline]
    #[must_use]
    pub fn bucket(&self, key: &PositionKey, ctx: EvalContext) -> usize {
        let [w0, w1, w2] = key_words(key);
        let mut h = u64::from(w0) | u64::from(w1) << 32;
        h ^= u64::from(w2) << 32 | u64::from(ctx.bits());
        h = h.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        h ^= h >> 29;
        h = h.wrapping_mul(0xBF58_476D_1CE4_E5B9);
        h ^= h >> 32;
        (h as usize) & self.mask
    }

    fn probe_words(&self, key: &PositionKey, ctx: EvalContext, locked: bool) -> Probe {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let slot = self.bucket(key, ctx);
        let entry = &self.slots[slot];

        let words = if locked {
            let _guard = entry.lock();
            entry.load()
        } else {
            entry.load()
        };

        let hit = words.context == ctx.bits() && words.key == key_words(key) && words.verifies();
        let value = if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(words.outputs())
        } else {
            None
        };
        Probe { slot, value }
    }

    /// Look up an entry, holding the slot lock while reading.
    #[inline]
    pub fn lookup(&self, key: &PositionKey, ctx: EvalContext) -> Probe {
        self.probe_words(key, ctx, true)
    }

    /// Look up an entry without taking the slot lock.
    #[inline]
    pub fn lookup_unlocked(&self, key: &PositionKey, ctx: EvalContext) -> Probe {
        self.probe_words(key, ctx, false)
    }

    /// Store an entry in `slot`, replacing its previous contents.
    #[inline]
    pub fn add(&self, slot: usize, key: &PositionKey, ctx: EvalContext, outputs: &Outputs) {
        let entry = &self.slots[slot & self.mask];
        let _guard = entry.lock();
        entry.store(&key_words(key), ctx.bits(), outputs);
    }

    /// Store an entry without taking the slot lock.
    #[inline]
    pub fn add_unlocked(&self, slot: usize, key: &PositionKey, ctx: EvalContext, outputs: &Outputs) {
        self.slots[slot & self.mask].store(&key_words(key), ctx.bits(), outputs);
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            lookups: self.lookups.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            capacity: self.slots.len(),
        }
    }

    /// Number of slots holding an entry.
    #[must_use]
    pub fn used(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.context.load(Ordering::Relaxed) != EMPTY_CONTEXT)
            .count()
    }

    /// Whether every slot's check word matches its contents.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.slots.iter().all(|s| s.load().verifies())
    }
}

/// How evaluation code reaches the cache.
pub trait CacheAccess {
    fn lookup(cache: &EvalCache, key: &PositionKey, ctx: EvalContext) -> Probe;
    fn add(cache: &EvalCache, slot: usize, key: &PositionKey, ctx: EvalContext, outputs: &Outputs);
}

/// Slot-locked access, for several workers sharing the cache.
pub struct Locked;

/// Lock-free access, for a single worker.
pub struct Unlocked;

impl CacheAccess for Locked {
    #[inline]
    fn lookup(cache: &EvalCache, key: &PositionKey, ctx: EvalContext) -> Probe {
        cache.lookup(key, ctx)
    }

    #[inline]
    fn add(cache: &EvalCache, slot: usize, key: &PositionKey, ctx: EvalContext, outputs: &Outputs) {
        cache.add(slot, key, ctx, outputs);
    }
}

impl CacheAccess for Unlocked {
    #[inline]
    fn lookup(cache: &EvalCache, key: &PositionKey, ctx: EvalContext) -> Probe {
        cache.lookup_unlocked(key, ctx)
    }

    #[inline]
    fn add(cache: &EvalCache, slot: usize, key: &PositionKey, ctx: EvalContext, outputs: &Outputs) {
        cache.add_unlocked(slot, key, ctx, outputs);
    }
}
