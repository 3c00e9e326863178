//! Slot arbitration engine.
//!
//! The arbiter owns no payload data. It hands out *slot indices*: one slot is
//! always held by the producer for writing, and each consumer latches onto
//! the most recently published slot for reading. With `max_readers` consumers
//! the table holds `max_readers + 2` slots, which is exactly enough for the
//! producer to always find a free slot on publish without waiting on any
//! reader (see [`WriteSlot::publish`]).
//!
//! Each slot's state is one atomic cell:
//!
//! ```text
//! cell == -1   WRITING  held by the producer
//! cell ==  0   FREE     no reader attached, claimable by the producer
//! cell ==  K   READING  observed by K consumers
//! ```
//!
//! Transitions: `FREE -> WRITING` by the producer's publish scan;
//! `WRITING -> FREE` by the next publish releasing the written slot;
//! `FREE/READING -> READING` by a consumer latching; `READING -> FREE` or a
//! smaller `READING` by a consumer releasing.

use crate::error::ExchangeError;
use crate::table::{ChunkTable, MAX_ELEMENTS};
use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};

/// Most readers an arbiter can ever be grown to serve.
pub const MAX_READERS: usize = MAX_ELEMENTS - 2;

/// Slot arbitration engine for one producer and a bounded set of consumers.
///
/// The arbiter admits at most one [`WriteSlot`] and at most `max_readers`
/// valid [`ReadSlot`]s at a time. Registration, publish, latch and release
/// are all lock-free and allocation-free; only [`Arbiter::reset`],
/// [`Arbiter::ensure_space_for_readers`] and [`Lockout`] take the internal
/// size lock, and none of those run on the hot path.
///
/// The arbiter is index-only: pair it with storage of `slot_count()`
/// elements (the crate's `Exchange` does this) and index that storage with
/// the slot a handle reports.
pub struct Arbiter {
    /// Per-slot state cells; length is `max_readers + 2`.
    cells: ChunkTable<CachePadded<AtomicI32>>,

    /// Most recently published slot, or -1 before the first publish.
    latest: CachePadded<AtomicI32>,

    /// The producer's current slot. Only the registered producer (or a
    /// `Lockout` holder) touches this, always with relaxed ordering: the
    /// `n_writers` acquire/release pair carries the value from one producer
    /// to the next.
    writer_index: CachePadded<AtomicI32>,

    /// Producer token, 0 or 1.
    n_writers: CachePadded<AtomicU32>,

    /// Count of registered consumers, at most `max_readers`.
    n_readers: CachePadded<AtomicUsize>,

    /// Serializes growth of the cell table with reset and exclusive access.
    size_lock: Mutex<()>,
}

impl Arbiter {
    /// Creates an arbiter serving up to `max_readers` concurrent consumers.
    ///
    /// Allocates `max_readers + 2` slot cells and establishes the initial
    /// state via [`Arbiter::reset`]: the producer owns slot 0 and nothing
    /// has been published.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::InvalidMaxReaders`] if `max_readers` is zero or
    /// above [`MAX_READERS`].
    pub fn new(max_readers: usize) -> Result<Self, ExchangeError> {
        if max_readers < 1 || max_readers > MAX_READERS {
            return Err(ExchangeError::InvalidMaxReaders(max_readers));
        }
        let arbiter = Self {
            cells: ChunkTable::with_len(max_readers + 2, || CachePadded::new(AtomicI32::new(0))),
            latest: CachePadded::new(AtomicI32::new(-1)),
            writer_index: CachePadded::new(AtomicI32::new(0)),
            n_writers: CachePadded::new(AtomicU32::new(0)),
            n_readers: CachePadded::new(AtomicUsize::new(0)),
            size_lock: Mutex::new(()),
        };
        arbiter
            .reset()
            .expect("no handles can exist during construction");
        Ok(arbiter)
    }

    /// Returns to the state where nothing has been published yet.
    ///
    /// The producer owns slot 0 afterwards, so `cells[0]` holds the -1
    /// sentinel even though no [`WriteSlot`] exists; the next producer to
    /// register picks it up.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::Busy`] if any read or write handle is outstanding;
    /// nothing is changed in that case.
    pub fn reset(&self) -> Result<(), ExchangeError> {
        let lock = Lockout::try_new(self);
        if !lock.is_valid() {
            return Err(ExchangeError::Busy);
        }

        self.writer_index.store(0, Ordering::Relaxed);
        self.latest.store(-1, Ordering::Relaxed);

        let cell_count = self.cells.len();
        for i in 1..cell_count {
            self.cell(i).store(0, Ordering::Relaxed);
        }
        self.cell(0).store(-1, Ordering::Release);

        Ok(())
    }

    /// Maximum number of concurrently registered consumers.
    #[inline]
    pub fn max_readers(&self) -> usize {
        self.cells.len() - 2
    }

    /// Number of slots, always `max_readers() + 2`.
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.cells.len()
    }

    /// Grows the slot table so that `target` consumers can register.
    ///
    /// No-op when `target <= max_readers()`. Appended cells start FREE;
    /// existing cells are untouched and keep their addresses, so live
    /// handles are unaffected. Growth is monotonic; this is the only way
    /// the advertised capacity changes after construction.
    ///
    /// Callers pairing the arbiter with their own slot storage must extend
    /// that storage to `slot_count()` elements *before* calling this, or the
    /// producer may be handed a slot with no backing storage.
    ///
    /// # Panics
    ///
    /// Panics if `target + 2` exceeds the table's hard capacity
    /// ([`MAX_READERS`] readers).
    pub fn ensure_space_for_readers(&self, target: usize) {
        let _guard = self.size_lock.lock();
        self.grow_cells_locked(target);
    }

    /// Growth body. The caller must hold `size_lock`.
    pub(crate) fn grow_cells_locked(&self, target: usize) {
        if target <= self.max_readers() {
            return;
        }
        // Serialized by size_lock, held by the caller.
        unsafe {
            self.cells
                .grow(target + 2, || CachePadded::new(AtomicI32::new(0)));
        }
    }

    pub(crate) fn size_lock(&self) -> &Mutex<()> {
        &self.size_lock
    }

    #[inline]
    fn cell(&self, index: usize) -> &AtomicI32 {
        self.cells.get(index)
    }

    /// Claims the producer token. False if a producer is already registered.
    fn try_claim_writer(&self) -> bool {
        self.n_writers
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn release_writer(&self) {
        let prev = self.n_writers.swap(0, Ordering::Release);
        debug_assert_eq!(prev, 1);
    }

    /// Claims one consumer token. False if `max_readers` consumers are
    /// already registered.
    fn try_claim_reader(&self) -> bool {
        let mut current = self.n_readers.load(Ordering::Relaxed);
        loop {
            if current >= self.max_readers() {
                return false;
            }
            match self.n_readers.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn release_reader(&self) {
        let prev = self.n_readers.fetch_sub(1, Ordering::Release);
        debug_assert!(prev >= 1);
    }

    /// Claims every consumer token at once. The caller must hold
    /// `size_lock` so `max_readers` cannot change underneath the claim.
    fn try_claim_all_readers(&self) -> bool {
        self.n_readers
            .compare_exchange(0, self.max_readers(), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn release_all_readers(&self) {
        self.n_readers.store(0, Ordering::Release);
    }

    /// The publish algorithm. Only called through a registered [`WriteSlot`],
    /// so exactly one thread runs it at a time; it is not reentrant.
    fn push_write(&self) {
        let writer = self.writer_index.load(Ordering::Relaxed);
        debug_assert!(writer >= 0);

        // The just-written slot becomes observable: FREE first, then named
        // as latest. Between here and the successful claim below no cell
        // holds -1; only this producer can observe that window.
        self.cell(writer as usize).store(0, Ordering::Relaxed);

        // Seq-cst, sharing one total order with the claim CAS below, the
        // reader release decrement and the latch's load of `latest`. See
        // the ordering note in `ReadSlot::acquire_latest`.
        self.latest.store(writer, Ordering::SeqCst);

        // The sum of non-negative cells never exceeds max_readers and the
        // table holds max_readers + 2 cells, so at least two cells are 0.
        // At most one of those is `writer` (skipped below), leaving at
        // least one claimable cell.
        let cell_count = self.cells.len();
        let mut next = -1;
        for i in 0..cell_count {
            if i as i32 == writer {
                // Don't reclaim what was just handed to the readers.
                continue;
            }
            if self
                .cell(i)
                .compare_exchange(0, -1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                next = i as i32;
                break;
            }
        }

        assert!(
            next != -1,
            "publish found no free slot: reader accounting is corrupt"
        );
        self.writer_index.store(next, Ordering::Relaxed);
    }
}

impl fmt::Debug for Arbiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arbiter")
            .field("max_readers", &self.max_readers())
            .field("latest", &self.latest.load(Ordering::Relaxed))
            .field("n_writers", &self.n_writers.load(Ordering::Relaxed))
            .field("n_readers", &self.n_readers.load(Ordering::Relaxed))
            .finish()
    }
}

/// Scoped producer registration.
///
/// While this handle is alive no other producer can register. It always
/// names a current write slot; [`WriteSlot::publish`] hands that slot to the
/// readers and claims a fresh one. Dropping the handle releases the producer
/// token but leaves the slot assignment in place for the next producer.
#[derive(Debug)]
pub struct WriteSlot<'a> {
    owner: &'a Arbiter,
}

impl<'a> WriteSlot<'a> {
    /// Registers as the producer. `None` if a producer already exists
    /// (requesting a second producer is a caller bug, but a recoverable
    /// one).
    pub fn try_new(owner: &'a Arbiter) -> Option<Self> {
        owner.try_claim_writer().then_some(Self { owner })
    }

    /// The slot currently owned for writing.
    #[inline]
    pub fn index(&self) -> usize {
        self.owner.writer_index.load(Ordering::Relaxed) as usize
    }

    /// Publishes the current slot and claims a new one.
    ///
    /// After this call, consumers latching see the just-written slot (or a
    /// later one) and [`WriteSlot::index`] names a fresh slot no consumer
    /// is attached to. Never blocks, never allocates, never fails.
    ///
    /// # Panics
    ///
    /// Panics if the slot scan finds no free cell, which cannot happen
    /// unless the engine state has been corrupted.
    pub fn publish(&mut self) {
        self.owner.push_write();
    }
}

impl Drop for WriteSlot<'_> {
    fn drop(&mut self) {
        self.owner.release_writer();
    }
}

/// Scoped consumer registration.
///
/// A read slot may be *invalid* (construction found `max_readers` consumers
/// already registered); invalid handles expose nothing and can retry via
/// [`ReadSlot::try_make_valid`], which is how admission after
/// [`Arbiter::ensure_space_for_readers`] works. A valid handle tracks one
/// slot index — the latest published slot at the time it last latched — and
/// keeps that slot's reader count raised until it advances or drops.
#[derive(Debug)]
pub struct ReadSlot<'a> {
    owner: &'a Arbiter,
    valid: bool,
    /// Latched slot, or -1 when nothing had been published at latch time.
    index: i32,
}

impl<'a> ReadSlot<'a> {
    /// Registers as a consumer and latches onto the latest published slot.
    /// Always constructs; check [`ReadSlot::is_valid`].
    pub fn new(owner: &'a Arbiter) -> Self {
        let valid = owner.try_claim_reader();
        let mut slot = Self {
            owner,
            valid,
            index: -1,
        };
        if valid {
            slot.acquire_latest();
        }
        slot
    }

    /// Whether registration succeeded.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Whether there is a latched slot to read. False before the first
    /// publish; that state is a query, not an error.
    #[inline]
    pub fn can_read(&self) -> bool {
        self.valid && self.index != -1
    }

    /// The latched slot, or `None` when invalid or nothing was published.
    #[inline]
    pub fn index(&self) -> Option<usize> {
        (self.valid && self.index >= 0).then_some(self.index as usize)
    }

    /// Whether the producer has published a version this handle has not
    /// latched. Once true, it stays true until [`ReadSlot::advance`]:
    /// `latest` may move further, but never back onto the latched slot.
    pub fn has_update(&self) -> bool {
        let latest = self.owner.latest.load(Ordering::Relaxed);
        self.valid && latest != -1 && latest != self.index
    }

    /// Re-latches onto the latest published slot. No-op when invalid or
    /// when no newer version exists. Never blocks or allocates.
    pub fn advance(&mut self) {
        if !self.valid || !self.has_update() {
            return;
        }
        self.finish_read();
        self.acquire_latest();
    }

    /// Retries registration for an invalid handle, typically after
    /// [`Arbiter::ensure_space_for_readers`] raised the capacity. Returns
    /// the resulting validity.
    pub fn try_make_valid(&mut self) -> bool {
        if !self.valid {
            self.valid = self.owner.try_claim_reader();
            if self.valid {
                self.acquire_latest();
            }
        }
        self.valid
    }

    /// Detaches from the current slot, if any.
    fn finish_read(&mut self) {
        if self.index != -1 {
            let prev = self
                .owner
                .cell(self.index as usize)
                .fetch_sub(1, Ordering::SeqCst);
            assert!(prev > 0, "released a slot that had no registered readers");
        }
        self.index = -1;
    }

    /// The latch: loads `latest` and raises that slot's reader count.
    fn acquire_latest(&mut self) {
        // The seq-cst total order over {this load, the publish `latest`
        // store, the publish claim CAS, the release decrement} is what
        // keeps a re-latching reader out of two slots at once. If this
        // load is ordered before a publish's `latest` store, the reader's
        // preceding decrement is too, so the publish scan observes it and
        // never mistakes the still-held slot for free. If it is ordered
        // after, it reads a slot at least as new as that publish's, and
        // the increment lands on the published slot or a later one.
        let mut target = self.owner.latest.load(Ordering::SeqCst);

        if target != -1 {
            let mut readers = 0;
            loop {
                match self.owner.cell(target as usize).compare_exchange_weak(
                    readers,
                    readers + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(-1) => {
                        // The producer reclaimed that slot, so a newer
                        // latest has already been designated.
                        target = self.owner.latest.load(Ordering::Relaxed);
                        assert!(target != -1, "latest regressed after a publish");
                        readers = 0;
                    }
                    Err(observed) => readers = observed,
                }
            }
        }

        self.index = target;
    }
}

impl Drop for ReadSlot<'_> {
    fn drop(&mut self) {
        if self.valid {
            self.finish_read();
            self.owner.release_reader();
        }
    }
}

/// Scoped exclusive access: the producer token, every consumer token and
/// the size lock, all at once.
///
/// Valid only if nothing else held any of the three at construction time.
/// While a valid lockout is alive no handle can register and the slot table
/// cannot grow, so the holder may walk every slot without interference.
/// Bulk operations (`reset`, the typed layer's `map`) are built on this.
pub struct Lockout<'a> {
    owner: &'a Arbiter,
    holds_readers: bool,
    holds_writer: bool,
    /// Declared last: the size lock is released after the tokens.
    _size_guard: MutexGuard<'a, ()>,
}

impl<'a> Lockout<'a> {
    /// Attempts the triple claim: size lock, then all consumer tokens, then
    /// the producer token. Always constructs; check [`Lockout::is_valid`].
    /// A partial claim is released on drop like a full one.
    pub fn try_new(owner: &'a Arbiter) -> Self {
        let size_guard = owner.size_lock.lock();
        let holds_readers = owner.try_claim_all_readers();
        let holds_writer = owner.try_claim_writer();
        Self {
            owner,
            holds_readers,
            holds_writer,
            _size_guard: size_guard,
        }
    }

    /// Whether every claim succeeded.
    pub fn is_valid(&self) -> bool {
        self.holds_readers && self.holds_writer
    }
}

impl Drop for Lockout<'_> {
    fn drop(&mut self) {
        if self.holds_writer {
            self.owner.release_writer();
        }
        if self.holds_readers {
            self.owner.release_all_readers();
        }
    }
}
