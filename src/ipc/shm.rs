/*!
 * Shared Memory
 *
 * Anonymous `MAP_SHARED` mappings that survive `fork()`: the parent maps,
 * children inherit the same physical pages. Everything the process family
 * shares (primitives, task queues, value handles) lives in one of these.
 */

use crate::core::backoff::adaptive_backoff;
use crate::core::limits::DEFAULT_SHARED_VALUE_BYTES;
use miette::Diagnostic;
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ffi::c_void;
use std::marker::PhantomData;
use std::mem::size_of;
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Shared memory operation result
pub type ShmResult<T> = Result<T, ShmError>;

/// Shared memory errors
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum ShmError {
    #[error("Cannot map a zero-sized region")]
    ZeroSized,

    #[error("mmap failed: {0}")]
    MapFailed(String),

    #[error("Encoded value is {size} bytes, capacity is {capacity}")]
    ValueTooLarge { size: usize, capacity: usize },

    #[error("Codec error: {0}")]
    Codec(String),
}

impl From<bincode::Error> for ShmError {
    fn from(err: bincode::Error) -> Self {
        ShmError::Codec(err.to_string())
    }
}

/// One anonymous shared mapping
pub struct SharedMemory {
    ptr: NonNull<c_void>,
    len: usize,
}

// The mapping is plain bytes; all access goes through atomics or a spin lock.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Map `len` zero-filled bytes shared with future children
    pub fn allocate(len: usize) -> ShmResult<Self> {
        let length = NonZeroUsize::new(len).ok_or(ShmError::ZeroSized)?;
        let ptr = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(|e| ShmError::MapFailed(e.to_string()))?;

        Ok(Self { ptr, len })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr().cast()
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        // Each process unmaps its own view; the pages live on while any view remains.
        let _ = unsafe { munmap(self.ptr, self.len) };
    }
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Types that are valid when all-zero and contain only atomics.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` (or a single atomic), hold no pointers,
/// and be valid for the all-zero bit pattern.
pub(crate) unsafe trait ShmSafe: Sync {}

unsafe impl ShmSafe for AtomicU32 {}
unsafe impl ShmSafe for AtomicU64 {}
unsafe impl ShmSafe for AtomicI64 {}
unsafe impl ShmSafe for AtomicUsize {}

/// A `T` placed at the start of its own shared mapping
pub(crate) struct SharedCell<T: ShmSafe> {
    mem: Arc<SharedMemory>,
    _marker: PhantomData<T>,
}

impl<T: ShmSafe> SharedCell<T> {
    pub fn new() -> ShmResult<Self> {
        Self::with_trailing(0)
    }

    /// Allocate `T` followed by `extra` bytes of trailing storage
    pub fn with_trailing(extra: usize) -> ShmResult<Self> {
        let mem = SharedMemory::allocate(size_of::<T>().max(1) + extra)?;
        Ok(Self {
            mem: Arc::new(mem),
            _marker: PhantomData,
        })
    }

    /// Pointer to the trailing storage after `T`
    pub fn trailing_ptr(&self) -> *mut u8 {
        unsafe { self.mem.as_ptr().add(size_of::<T>().max(1)) }
    }

    pub fn trailing_len(&self) -> usize {
        self.mem.len() - size_of::<T>().max(1)
    }
}

impl<T: ShmSafe> Deref for SharedCell<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Page-aligned, zero-filled, and T is valid for zero bytes.
        unsafe { &*(self.mem.as_ptr() as *const T) }
    }
}

impl<T: ShmSafe> Clone for SharedCell<T> {
    fn clone(&self) -> Self {
        Self {
            mem: Arc::clone(&self.mem),
            _marker: PhantomData,
        }
    }
}

/// Spin lock over one word of shared memory
pub(crate) fn spin_lock(word: &AtomicU32) -> SpinGuard<'_> {
    let mut retries = 0u32;
    while word
        .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        adaptive_backoff(retries);
        retries = retries.saturating_add(1);
    }
    SpinGuard { word }
}

pub(crate) struct SpinGuard<'a> {
    word: &'a AtomicU32,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.word.store(0, Ordering::Release);
    }
}

/// Counter visible to every process forked after its creation
#[derive(Clone)]
pub struct SharedCounter {
    cell: SharedCell<AtomicI64>,
}

impl SharedCounter {
    pub fn new(initial: i64) -> ShmResult<Self> {
        let cell = SharedCell::<AtomicI64>::new()?;
        cell.store(initial, Ordering::SeqCst);
        Ok(Self { cell })
    }

    pub fn get(&self) -> i64 {
        self.cell.load(Ordering::SeqCst)
    }

    pub fn set(&self, value: i64) {
        self.cell.store(value, Ordering::SeqCst);
    }

    /// Add `delta` and return the new value
    pub fn add(&self, delta: i64) -> i64 {
        self.cell.fetch_add(delta, Ordering::SeqCst) + delta
    }

    pub fn increment(&self) -> i64 {
        self.add(1)
    }
}

impl std::fmt::Debug for SharedCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SharedCounter").field(&self.get()).finish()
    }
}

#[repr(C)]
struct ValueHeader {
    lock: AtomicU32,
    len: AtomicU64,
}

unsafe impl ShmSafe for ValueHeader {}

/// Serialized value in shared memory, readable and writable from any process
/// forked after its creation.
///
/// Created once by the caller and captured by worker closures; every access
/// takes the slot's spin lock, so `update` is atomic across processes.
pub struct Shared<T> {
    cell: SharedCell<ValueHeader>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Shared<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(value: &T) -> ShmResult<Self> {
        Self::with_capacity(value, DEFAULT_SHARED_VALUE_BYTES)
    }

    /// Reserve `capacity` bytes for the encoded value
    pub fn with_capacity(value: &T, capacity: usize) -> ShmResult<Self> {
        let shared = Self {
            cell: SharedCell::with_trailing(capacity)?,
            _marker: PhantomData,
        };
        shared.store(value)?;
        Ok(shared)
    }

    pub fn capacity(&self) -> usize {
        self.cell.trailing_len()
    }

    pub fn load(&self) -> ShmResult<T> {
        let _guard = spin_lock(&self.cell.lock);
        self.read_locked()
    }

    pub fn store(&self, value: &T) -> ShmResult<()> {
        let bytes = bincode::serialize(value)?;
        let _guard = spin_lock(&self.cell.lock);
        self.write_locked(&bytes)
    }

    /// Read-modify-write under the slot lock; returns the stored value
    pub fn update<F>(&self, f: F) -> ShmResult<T>
    where
        F: FnOnce(&mut T),
    {
        let _guard = spin_lock(&self.cell.lock);
        let mut value = self.read_locked()?;
        f(&mut value);
        let bytes = bincode::serialize(&value)?;
        self.write_locked(&bytes)?;
        Ok(value)
    }

    fn read_locked(&self) -> ShmResult<T> {
        let len = self.cell.len.load(Ordering::Acquire) as usize;
        let bytes = unsafe { std::slice::from_raw_parts(self.cell.trailing_ptr(), len) };
        Ok(bincode::deserialize(bytes)?)
    }

    fn write_locked(&self, bytes: &[u8]) -> ShmResult<()> {
        let capacity = self.capacity();
        if bytes.len() > capacity {
            return Err(ShmError::ValueTooLarge {
                size: bytes.len(),
                capacity,
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.cell.trailing_ptr(), bytes.len());
        }
        self.cell.len.store(bytes.len() as u64, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_sized_rejected() {
        assert!(matches!(SharedMemory::allocate(0), Err(ShmError::ZeroSized)));
    }

    #[test]
    fn test_counter_arithmetic() {
        let counter = SharedCounter::new(5).unwrap();
        assert_eq!(counter.increment(), 6);
        assert_eq!(counter.add(-2), 4);
        counter.set(10);
        assert_eq!(counter.get(), 10);
    }

    #[test]
    fn test_shared_value_update() {
        let shared = Shared::new(&vec![1u32, 2]).unwrap();
        let updated = shared.update(|v| v.push(3)).unwrap();
        assert_eq!(updated, vec![1, 2, 3]);
        assert_eq!(shared.load().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_shared_value_too_large() {
        let shared = Shared::with_capacity(&String::new(), 16).unwrap();
        let err = shared.store(&"x".repeat(64)).unwrap_err();
        assert!(matches!(err, ShmError::ValueTooLarge { .. }));
        // Previous value untouched
        assert_eq!(shared.load().unwrap(), "");
    }

    #[test]
    fn test_clones_share_storage() {
        let a = Shared::new(&0u64).unwrap();
        let b = a.clone();
        a.store(&42).unwrap();
        assert_eq!(b.load().unwrap(), 42);
    }
}
