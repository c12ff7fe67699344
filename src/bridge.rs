//! Bridges to the hardware and driver layers.
//!
//! This crate never touches a page-table entry, a frame of physical memory,
//! a swap partition, or a filesystem directly. Each of those concerns is
//! represented by one trait in this module, implemented by the embedding
//! kernel and handed in as a trait object. The traits are deliberately
//! narrow: they carry exactly the operations the paging policy needs and
//! nothing else, so the policy code cannot grow hidden dependencies on a
//! particular machine.
//!
//! All four traits are `Send + Sync`; the frame table and every address
//! space may be reached from any core.

use crate::VmError;
use crate::addressing::{PAGE_SIZE, Pa, Va};
use alloc::sync::Arc;
use core::marker::PhantomData;

/// Hardware translation table of a single address space.
///
/// One instance per process, owned by the corresponding
/// [`AddressSpace`](crate::AddressSpace). The implementation is expected to
/// perform any TLB shootdown required for [`clear`](Self::clear) before
/// returning; once `clear` returns, no core may observe the old
/// translation.
pub trait TranslationMap: Send + Sync {
    /// Installs a translation from `va` to `pa` with the given write
    /// permission.
    ///
    /// Returns `false` if the translation could not be installed, for
    /// example because an intermediate table could not be allocated. The
    /// caller treats that as resource exhaustion.
    fn install(&self, va: Va, pa: Pa, writable: bool) -> bool;

    /// Removes the translation for `va`, if any.
    fn clear(&self, va: Va);

    /// Returns the physical address currently mapped at `va`.
    fn lookup(&self, va: Va) -> Option<Pa>;

    /// Whether the hardware dirty bit is set for the mapping at `va`.
    ///
    /// Returns `false` when no mapping is installed.
    fn is_dirty(&self, va: Va) -> bool;
}

/// Allocator of raw physical pages.
///
/// The pool knows nothing about paging policy; it hands out page-aligned
/// physical addresses and maps them into the kernel's window so their
/// contents can be read and written.
pub trait PhysicalPool: Send + Sync {
    /// Allocates one physical page, or `None` if the pool is exhausted.
    fn allocate(&self) -> Option<Pa>;

    /// Returns a previously allocated page to the pool.
    fn release(&self, pa: Pa);

    /// Returns a kernel-accessible pointer to the frame at `pa`.
    ///
    /// The pointer is valid for [`PAGE_SIZE`] bytes for as long as the
    /// frame remains allocated.
    fn map_frame(&self, pa: Pa) -> *mut u8;
}

/// Index of a page-sized slot on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapSlot(pub usize);

/// Page-granular backing store for evicted anonymous pages.
pub trait SwapDevice: Send + Sync {
    /// Reserves one free slot.
    ///
    /// # Errors
    /// [`VmError::ResourceExhaustion`] if the device is full.
    fn alloc_slot(&self) -> Result<SwapSlot, VmError>;

    /// Releases a slot reserved by [`alloc_slot`](Self::alloc_slot).
    fn free_slot(&self, slot: SwapSlot);

    /// Writes one page of data into `slot`.
    ///
    /// # Errors
    /// [`VmError::BackingIo`] on a device failure.
    fn write(&self, slot: SwapSlot, src: &[u8; PAGE_SIZE]) -> Result<(), VmError>;

    /// Reads one page of data out of `slot`.
    ///
    /// # Errors
    /// [`VmError::BackingIo`] on a device failure.
    fn read(&self, slot: SwapSlot, dst: &mut [u8; PAGE_SIZE]) -> Result<(), VmError>;
}

/// A file that can back pages of an address space.
///
/// Offsets are absolute byte positions within the file. Reads past the end
/// of the file return a short count rather than an error; the pager zeroes
/// the remainder of the page itself.
pub trait BackingFile: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `position`.
    ///
    /// Returns the number of bytes actually read, which is smaller than
    /// `buf.len()` only at end of file.
    ///
    /// # Errors
    /// [`VmError::BackingIo`] on a device failure.
    fn read(&self, position: usize, buf: &mut [u8]) -> Result<usize, VmError>;

    /// Writes `buf` starting at `position`.
    ///
    /// # Errors
    /// [`VmError::BackingIo`] on a device failure.
    fn write(&self, position: usize, buf: &[u8]) -> Result<usize, VmError>;
}

/// Adapter for the [`BackingFile`] object.
#[derive(Clone)]
pub struct FileHandle(pub Arc<dyn BackingFile>);

impl core::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "FileHandle({:p})", Arc::as_ptr(&self.0))
    }
}

impl FileHandle {
    /// Whether two handles refer to the same underlying file object.
    pub fn same_file(&self, other: &FileHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A borrowed view of one physical frame's memory.
///
/// Constructed from a [`PhysicalPool`] and a frame's physical address; the
/// lifetime brand ties the view to the pool borrow so the raw pointer
/// cannot outlive the mapping that produced it.
pub struct FrameRef<'a> {
    ptr: *mut u8,
    _lt: PhantomData<&'a dyn PhysicalPool>,
}

impl<'a> FrameRef<'a> {
    /// Creates a view of the frame at `pa`.
    ///
    /// # Safety contract
    /// The caller must ensure the frame at `pa` stays allocated and is not
    /// concurrently evicted for the lifetime of the view. Within this crate
    /// that is guaranteed by holding the frame-table lock or by pinning the
    /// frame.
    pub fn new(pool: &'a dyn PhysicalPool, pa: Pa) -> Self {
        Self {
            ptr: pool.map_frame(pa),
            _lt: PhantomData,
        }
    }

    /// The frame contents as a page-sized byte array.
    pub fn bytes(&self) -> &[u8; PAGE_SIZE] {
        // Valid by the construction contract: `ptr` addresses one whole
        // allocated frame.
        unsafe { &*(self.ptr as *const [u8; PAGE_SIZE]) }
    }

    /// The frame contents as a mutable page-sized byte array.
    pub fn bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        unsafe { &mut *(self.ptr as *mut [u8; PAGE_SIZE]) }
    }
}
