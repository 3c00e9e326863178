use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Number of elements per chunk.
const CHUNK_LEN: usize = 64;

/// Number of chunk slots in the directory.
const MAX_CHUNKS: usize = 1024;

/// Hard capacity of a table: directory size times chunk size.
pub(crate) const MAX_ELEMENTS: usize = CHUNK_LEN * MAX_CHUNKS;

/// Append-only storage whose elements never move.
///
/// Handles hold plain integer indices into this table while other threads
/// append to it, so existing elements must keep their addresses for the
/// lifetime of the table. A `Vec` relocates on growth; instead the table
/// keeps a fixed directory of chunk pointers and allocates fixed-size chunks
/// on demand. `get` is a single atomic pointer load plus an offset and never
/// takes a lock.
///
/// Chunks are always allocated whole and fully initialized by the fill
/// closure, so `len` only gates which indices callers may use; every element
/// of an allocated chunk is a live `T`.
pub(crate) struct ChunkTable<T> {
    /// Directory of chunk base pointers. Null until the chunk is allocated.
    chunks: Box<[AtomicPtr<T>]>,

    /// Number of elements callers may index. Published with release ordering
    /// after the backing chunks, so a reader that observes the new length
    /// also observes the chunk pointers.
    len: AtomicUsize,
}

unsafe impl<T: Send> Send for ChunkTable<T> {}
unsafe impl<T: Sync> Sync for ChunkTable<T> {}

impl<T> ChunkTable<T> {
    /// Creates a table with `len` usable elements, each produced by `fill`.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds [`MAX_ELEMENTS`].
    pub(crate) fn with_len(len: usize, mut fill: impl FnMut() -> T) -> Self {
        assert!(len <= MAX_ELEMENTS, "table capacity exceeded: {len}");
        let chunks: Box<[AtomicPtr<T>]> = (0..MAX_CHUNKS)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        for chunk in chunks.iter().take(len.div_ceil(CHUNK_LEN)) {
            chunk.store(alloc_chunk(&mut fill), Ordering::Relaxed);
        }
        Self {
            chunks,
            len: AtomicUsize::new(len),
        }
    }

    /// Number of usable elements.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Returns a reference to the element at `index`.
    ///
    /// Lock-free; safe to call concurrently with `grow`. `index` must have
    /// been observed below `len()`.
    #[inline]
    pub(crate) fn get(&self, index: usize) -> &T {
        debug_assert!(index < self.len());
        let chunk = self.chunks[index / CHUNK_LEN].load(Ordering::Acquire);
        debug_assert!(!chunk.is_null());
        unsafe { &*chunk.add(index % CHUNK_LEN) }
    }

    /// Extends the table to `new_len` elements, each produced by `fill`.
    /// No-op if the table is already that large. Existing elements keep
    /// their addresses.
    ///
    /// # Safety
    ///
    /// Calls must be serialized by the caller (the arbiter's size lock);
    /// concurrent `grow` calls race on the chunk directory.
    ///
    /// # Panics
    ///
    /// Panics if `new_len` exceeds [`MAX_ELEMENTS`].
    pub(crate) unsafe fn grow(&self, new_len: usize, mut fill: impl FnMut() -> T) {
        assert!(new_len <= MAX_ELEMENTS, "table capacity exceeded: {new_len}");
        let len = self.len.load(Ordering::Acquire);
        if new_len <= len {
            return;
        }
        for chunk in self
            .chunks
            .iter()
            .take(new_len.div_ceil(CHUNK_LEN))
            .skip(len.div_ceil(CHUNK_LEN))
        {
            chunk.store(alloc_chunk(&mut fill), Ordering::Release);
        }
        self.len.store(new_len, Ordering::Release);
    }
}

impl<T> Drop for ChunkTable<T> {
    fn drop(&mut self) {
        for chunk in self.chunks.iter() {
            let ptr = chunk.load(Ordering::Relaxed);
            if !ptr.is_null() {
                unsafe {
                    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(ptr, CHUNK_LEN)));
                }
            }
        }
    }
}

/// Allocates one whole chunk, initializing every element with `fill`.
fn alloc_chunk<T>(fill: &mut impl FnMut() -> T) -> *mut T {
    let mut chunk: Vec<T> = Vec::with_capacity(CHUNK_LEN);
    chunk.resize_with(CHUNK_LEN, fill);
    Box::into_raw(chunk.into_boxed_slice()) as *mut T
}
