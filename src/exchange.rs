//! Typed storage over the slot arbitration engine.
//!
//! [`Exchange<T>`] allocates `max_readers + 2` instances of `T` up front and
//! pairs them with an [`Arbiter`]; publishing and reading exchange slot
//! indices, never copies of `T`. The writer mutates its slot in place
//! through [`Writer`], readers borrow theirs through [`Reader`].

use crate::arbiter::{Arbiter, Lockout, ReadSlot, WriteSlot};
use crate::error::ExchangeError;
use crate::table::ChunkTable;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};

/// A latest-value exchange between one producer and up to `max_readers`
/// consumers.
///
/// The producer obtains a [`Writer`] via [`Exchange::write`], fills the slot
/// it dereferences to, and calls [`Writer::publish`]; consumers obtain
/// [`Reader`]s and poll [`Reader::has_update`] / [`Reader::pull_update`].
/// None of those operations block, wait on another thread, or allocate.
/// A consumer is not guaranteed to observe every published version; it
/// always observes the most recent one at its own pace.
///
/// Slot values persist across publishes: the slot handed to the writer
/// holds whatever version was written into it up to `max_readers + 2`
/// publishes ago, which makes incremental updates cheap for large `T`.
/// Use [`Exchange::map`] to rewrite every copy while no handles exist.
pub struct Exchange<T> {
    arbiter: Arbiter,

    /// One `T` per slot. A slot is mutated only while its state cell holds
    /// the WRITING sentinel, and borrowed only while the borrowing reader
    /// keeps its reader count raised; the arbiter guarantees those never
    /// overlap.
    slots: ChunkTable<CachePadded<UnsafeCell<T>>>,

    /// Source for slots added by growth, kept in step by `map`.
    template: Mutex<T>,
}

unsafe impl<T: Send> Send for Exchange<T> {}
unsafe impl<T: Send + Sync> Sync for Exchange<T> {}

impl<T: Clone> Exchange<T> {
    /// Creates an exchange for up to `max_readers` concurrent readers, with
    /// every slot cloned from `initial`.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::InvalidMaxReaders`] if `max_readers` is zero or
    /// above [`crate::arbiter::MAX_READERS`].
    pub fn new(max_readers: usize, initial: T) -> Result<Self, ExchangeError> {
        let arbiter = Arbiter::new(max_readers)?;
        let slots = ChunkTable::with_len(arbiter.slot_count(), || {
            CachePadded::new(UnsafeCell::new(initial.clone()))
        });
        Ok(Self {
            arbiter,
            slots,
            template: Mutex::new(initial),
        })
    }

    /// Registers the producer. `None` if one already exists.
    pub fn write(&self) -> Option<Writer<'_, T>> {
        WriteSlot::try_new(&self.arbiter).map(|slot| Writer {
            exchange: self,
            slot,
        })
    }

    /// Registers a consumer. Always constructs; the handle is invalid when
    /// `max_readers` consumers are already registered — check
    /// [`Reader::is_valid`] or retry with [`Reader::try_make_valid`].
    pub fn read(&self) -> Reader<'_, T> {
        Reader {
            exchange: self,
            slot: ReadSlot::new(&self.arbiter),
        }
    }

    /// Registers a consumer, growing the exchange as needed.
    ///
    /// When the exchange is full this raises the capacity by one (a fresh
    /// slot cloned from the template) and retries, so the returned handle
    /// is always valid. Unlike [`Exchange::read`] this may allocate and
    /// take the size lock.
    pub fn read_or_grow(&self) -> Reader<'_, T> {
        let mut reader = self.read();
        while !reader.is_valid() {
            self.ensure_space_for_readers(self.max_readers() + 1);
            reader.try_make_valid();
        }
        reader
    }

    /// Maximum number of concurrently registered readers.
    pub fn max_readers(&self) -> usize {
        self.arbiter.max_readers()
    }

    /// Grows the exchange so that `target` readers can register. No-op if
    /// it is already that large. Live handles are unaffected.
    ///
    /// # Panics
    ///
    /// Panics if `target` exceeds [`crate::arbiter::MAX_READERS`].
    pub fn ensure_space_for_readers(&self, target: usize) {
        let _guard = self.arbiter.size_lock().lock();
        if target <= self.arbiter.max_readers() {
            return;
        }
        {
            // Storage grows first: the arbiter must never advertise a slot
            // without backing storage.
            let template = self.template.lock();
            unsafe {
                self.slots.grow(target + 2, || {
                    CachePadded::new(UnsafeCell::new(template.clone()))
                });
            }
        }
        self.arbiter.grow_cells_locked(target);
    }

    /// Applies `f` to every slot value in index order, exactly once each,
    /// and to the growth template, so configuration changes reach every
    /// current and future copy.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::Busy`] if any read or write handle is outstanding.
    pub fn map(&self, mut f: impl FnMut(&mut T)) -> Result<(), ExchangeError> {
        let lock = Lockout::try_new(&self.arbiter);
        if !lock.is_valid() {
            return Err(ExchangeError::Busy);
        }
        for i in 0..self.arbiter.slot_count() {
            // The lockout excludes every handle, so no slot is borrowed.
            f(unsafe { &mut *self.slots.get(i).get() });
        }
        f(&mut self.template.lock());
        Ok(())
    }

    /// Returns to the state where nothing has been published. Slot values
    /// are left as-is but become unobservable until published again.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::Busy`] if any read or write handle is outstanding.
    pub fn reset(&self) -> Result<(), ExchangeError> {
        self.arbiter.reset()
    }
}

impl<T> Exchange<T> {
    #[inline]
    fn slot(&self, index: usize) -> *mut T {
        self.slots.get(index).get()
    }
}

impl<T> fmt::Debug for Exchange<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("arbiter", &self.arbiter)
            .finish_non_exhaustive()
    }
}

/// Scoped producer access to the exchange.
///
/// Dereferences to the current write slot's value. The slot's previous
/// contents (from `max_readers + 2` publishes ago, or the initial clone)
/// are still there — overwrite or update in place, then call
/// [`Writer::publish`].
pub struct Writer<'a, T> {
    exchange: &'a Exchange<T>,
    slot: WriteSlot<'a>,
}

impl<'a, T> Writer<'a, T> {
    /// The slot currently owned for writing.
    pub fn index(&self) -> usize {
        self.slot.index()
    }

    /// Makes the current slot's value visible to readers and claims a fresh
    /// slot. Never blocks, never allocates, never fails.
    pub fn publish(&mut self) {
        self.slot.publish();
    }
}

impl<'a, T: Clone> Writer<'a, T> {
    /// Moves `value` into the write slot and publishes it.
    pub fn publish_value(&mut self, value: T) {
        **self = value;
        self.publish();
    }

    /// Clones `value` into the write slot and publishes it.
    pub fn publish_from(&mut self, value: &T) {
        (**self).clone_from(value);
        self.publish();
    }
}

impl<T> Deref for Writer<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // The write slot's cell holds the WRITING sentinel; no reader can
        // latch it (the latch retries on the sentinel), so this access is
        // exclusive.
        unsafe { &*self.exchange.slot(self.slot.index()) }
    }
}

impl<T> DerefMut for Writer<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // See `deref`.
        unsafe { &mut *self.exchange.slot(self.slot.index()) }
    }
}

impl<T> fmt::Debug for Writer<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer").field("index", &self.index()).finish()
    }
}

/// Scoped consumer access to the exchange.
///
/// [`Reader::get`] borrows the latched version; it stays stable until this
/// reader pulls a newer one or drops, no matter how far the producer runs
/// ahead.
pub struct Reader<'a, T> {
    exchange: &'a Exchange<T>,
    slot: ReadSlot<'a>,
}

impl<'a, T> Reader<'a, T> {
    /// Whether registration succeeded.
    pub fn is_valid(&self) -> bool {
        self.slot.is_valid()
    }

    /// Whether there is a latched version to read. False before the first
    /// publish.
    pub fn can_read(&self) -> bool {
        self.slot.can_read()
    }

    /// The latched slot index, or `None` when there is nothing to read.
    pub fn index(&self) -> Option<usize> {
        self.slot.index()
    }

    /// Borrows the latched version, or `None` when invalid or nothing has
    /// been published.
    pub fn get(&self) -> Option<&T> {
        // A latched slot's reader count stays >= 1 until pull_update or
        // drop, so the producer cannot claim it while this borrow lives.
        self.slot
            .index()
            .map(|index| unsafe { &*self.exchange.slot(index) })
    }

    /// Whether the producer has published a version this reader has not
    /// seen. Once true, stays true until [`Reader::pull_update`].
    pub fn has_update(&self) -> bool {
        self.slot.has_update()
    }

    /// Latches onto the most recent published version. No-op when invalid
    /// or already current. Never blocks or allocates.
    pub fn pull_update(&mut self) {
        self.slot.advance();
    }

    /// Retries registration for an invalid handle, typically after growth.
    /// Returns the resulting validity.
    pub fn try_make_valid(&mut self) -> bool {
        self.slot.try_make_valid()
    }
}

impl<T> fmt::Debug for Reader<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("valid", &self.is_valid())
            .field("index", &self.index())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_round_trip() {
        let exchange = Exchange::new(1, 0u64).unwrap();

        let mut reader = exchange.read();
        assert!(reader.is_valid());
        assert!(!reader.can_read());
        assert_eq!(reader.get(), None);

        let mut writer = exchange.write().unwrap();
        *writer = 42;
        writer.publish();

        assert!(reader.has_update());
        reader.pull_update();
        assert_eq!(reader.get(), Some(&42));
        assert!(!reader.has_update());
    }

    #[test]
    fn reader_keeps_its_version_while_writer_runs_ahead() {
        let exchange = Exchange::new(1, 0u32).unwrap();
        let mut writer = exchange.write().unwrap();
        let mut reader = exchange.read();

        writer.publish_value(1);
        reader.pull_update();
        let held = reader.get().copied();
        assert_eq!(held, Some(1));

        // The writer cycles through every other slot; the latched one is
        // pinned by the reader and must keep its value.
        for v in 2..20u32 {
            writer.publish_value(v);
        }
        assert_eq!(reader.get(), Some(&1));

        reader.pull_update();
        assert_eq!(reader.get(), Some(&19));
    }

    #[test]
    fn second_writer_refused() {
        let exchange = Exchange::new(1, 0u8).unwrap();
        let writer = exchange.write().unwrap();
        assert!(exchange.write().is_none());
        drop(writer);
        assert!(exchange.write().is_some());
    }

    #[test]
    fn publish_from_clones_the_source() {
        let exchange = Exchange::new(1, String::new()).unwrap();
        let mut writer = exchange.write().unwrap();
        let mut reader = exchange.read();

        let source = String::from("config v2");
        writer.publish_from(&source);
        assert_eq!(source, "config v2");

        reader.pull_update();
        assert_eq!(reader.get().map(String::as_str), Some("config v2"));
    }

    #[test]
    fn map_rewrites_every_slot_and_the_template() {
        let exchange = Exchange::new(2, 1u32).unwrap();

        let mut visited = 0;
        exchange
            .map(|v| {
                *v = 7;
                visited += 1;
            })
            .unwrap();
        assert_eq!(visited, exchange.max_readers() + 2 + 1); // slots + template

        // Growth clones the template, so grown slots carry the change too.
        exchange.ensure_space_for_readers(4);
        let mut values = Vec::new();
        exchange.map(|v| values.push(*v)).unwrap();
        assert_eq!(values.len(), 6 + 1);
        assert!(values.iter().all(|&v| v == 7));
    }

    #[test]
    fn map_and_reset_refused_while_handles_live() {
        let exchange = Exchange::new(1, 0u8).unwrap();
        let reader = exchange.read();

        assert_eq!(exchange.map(|_| {}).unwrap_err(), ExchangeError::Busy);
        assert_eq!(exchange.reset().unwrap_err(), ExchangeError::Busy);

        drop(reader);
        exchange.map(|_| {}).unwrap();
        exchange.reset().unwrap();
    }

    #[test]
    fn reset_makes_published_data_unobservable() {
        let exchange = Exchange::new(1, 0u32).unwrap();
        {
            let mut writer = exchange.write().unwrap();
            writer.publish_value(5);
        }
        exchange.reset().unwrap();

        let reader = exchange.read();
        assert!(!reader.can_read());
        assert_eq!(reader.get(), None);
    }

    #[test]
    fn read_or_grow_admits_beyond_initial_capacity() {
        let exchange = Exchange::new(1, 0u16).unwrap();
        let r1 = exchange.read();
        assert!(r1.is_valid());
        assert!(!exchange.read().is_valid());

        let r2 = exchange.read_or_grow();
        assert!(r2.is_valid());
        assert!(exchange.max_readers() >= 2);
    }

    #[test]
    fn grow_then_admit_and_observe() {
        let exchange = Exchange::new(1, 0u32).unwrap();
        let mut r1 = exchange.read();
        assert!(r1.is_valid());

        exchange.ensure_space_for_readers(3);
        let mut r2 = exchange.read();
        let mut r3 = exchange.read();
        assert!(r2.is_valid() && r3.is_valid());

        let mut writer = exchange.write().unwrap();
        writer.publish_value(9);

        for reader in [&mut r1, &mut r2, &mut r3] {
            reader.pull_update();
            assert_eq!(reader.get(), Some(&9));
        }
    }

    #[test]
    fn writer_slot_retains_stale_value_for_in_place_update() {
        #[derive(Clone, PartialEq, Debug)]
        struct Counters(Vec<u64>);

        let exchange = Exchange::new(1, Counters(vec![0; 4])).unwrap();
        let mut writer = exchange.write().unwrap();
        let mut reader = exchange.read();

        // Each publish bumps one counter in whatever version the slot
        // holds; after cycling all slots the writer sees its own earlier
        // updates and can touch only what changed.
        for i in 0..8 {
            writer.0[i % 4] += 1;
            writer.publish();
        }
        reader.pull_update();
        let total: u64 = reader.get().unwrap().0.iter().sum();
        assert!(total >= 1);
    }
}
