//! Per-page bookkeeping: descriptors, backing state, and initializers.
//!
//! Every virtual page an address space knows about is represented by one
//! [`PageDescriptor`]. The descriptor records the page's permissions, its
//! current [`Backing`], and, when resident, which physical frame holds it.
//! The backing is a state machine:
//!
//! ```text
//! Uninit ──(first claim)──▶ Anonymous ◀──(evict/swap-in)──▶ Anonymous
//!    └────(first claim)──▶ FileBacked ◀──(evict/re-read)──▶ FileBacked
//! ```
//!
//! An `Uninit` page has never been materialized; it carries a
//! [`PageInitializer`] that produces the first contents and an
//! [`EventualBacking`] describing what the page becomes afterwards. The
//! transition happens exactly once, on the first successful claim.

use crate::VmError;
use crate::addressing::{PAGE_SIZE, Pa, Va};
use crate::bridge::{FileHandle, SwapSlot};
use crate::frame::FrameId;
use alloc::sync::Arc;

/// Produces the first contents of a lazily registered page.
///
/// Implementations capture whatever context they need (a file handle, an
/// offset, nothing at all); the pager invokes them exactly once per page,
/// on the first claim, with a zeroed frame.
pub trait PageInitializer: Send + Sync {
    /// Fills `frame` with the initial contents of the page at `va`.
    ///
    /// `frame` arrives zeroed. On error the page stays uninitialized and
    /// the fault that triggered the claim fails.
    fn initialize(&self, va: Va, frame: &mut [u8; PAGE_SIZE]) -> Result<(), VmError>;
}

/// The stock initializer for anonymous pages: leaves the frame zeroed.
pub struct ZeroFill;

impl PageInitializer for ZeroFill {
    fn initialize(&self, _va: Va, _frame: &mut [u8; PAGE_SIZE]) -> Result<(), VmError> {
        Ok(())
    }
}

/// Initializer that loads a page's contents from a file.
///
/// Reads `read_len` bytes starting at `offset`; the rest of the frame
/// stays zeroed. Used for the data-past-EOF portion of executable
/// segments as well as plain mappings.
pub struct FileRead {
    /// File to read from.
    pub file: FileHandle,
    /// Byte offset of this page's contents within the file.
    pub offset: usize,
    /// Number of bytes to read; the remainder of the page is zero.
    pub read_len: usize,
}

impl PageInitializer for FileRead {
    fn initialize(&self, _va: Va, frame: &mut [u8; PAGE_SIZE]) -> Result<(), VmError> {
        let want = self.read_len.min(PAGE_SIZE);
        // A short read at EOF is fine; the tail is already zero.
        self.file.0.read(self.offset, &mut frame[..want])?;
        Ok(())
    }
}

/// The materialized kind of a page, ignoring the uninitialized state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Backed by swap once evicted; contents exist nowhere else.
    Anonymous,
    /// Backed by a region of a file.
    FileBacked,
}

/// What an uninitialized page becomes after its first claim.
#[derive(Clone)]
pub enum EventualBacking {
    /// Becomes a swap-backed anonymous page.
    Anonymous,
    /// Becomes a file-backed page over the given file region.
    FileBacked {
        /// Backing file.
        file: FileHandle,
        /// Byte offset of the page's region within the file.
        offset: usize,
        /// Bytes of the page that come from the file.
        read_len: usize,
        /// Bytes of zero padding after the file contents.
        zero_len: usize,
    },
}

impl EventualBacking {
    /// The kind this eventual backing materializes into.
    pub fn kind(&self) -> PageKind {
        match self {
            EventualBacking::Anonymous => PageKind::Anonymous,
            EventualBacking::FileBacked { .. } => PageKind::FileBacked,
        }
    }

    pub(crate) fn into_backing(self) -> Backing {
        match self {
            EventualBacking::Anonymous => Backing::Anonymous { swap_slot: None },
            EventualBacking::FileBacked {
                file,
                offset,
                read_len,
                zero_len,
            } => Backing::FileBacked {
                file,
                offset,
                read_len,
                zero_len,
            },
        }
    }
}

/// The backing state of a page.
pub enum Backing {
    /// Never materialized. Holds the recipe for the first contents.
    Uninit {
        /// Runs once, on the first claim.
        initializer: Arc<dyn PageInitializer>,
        /// What the page becomes after initialization.
        eventual: EventualBacking,
    },
    /// Materialized at least once; contents live in the frame or in swap.
    Anonymous {
        /// Occupied while the page is evicted; `None` while resident or
        /// never yet evicted.
        swap_slot: Option<SwapSlot>,
    },
    /// Materialized at least once; contents live in the frame or in the
    /// file region.
    FileBacked {
        /// Backing file.
        file: FileHandle,
        /// Byte offset of the page's region within the file.
        offset: usize,
        /// Bytes of the page that come from the file.
        read_len: usize,
        /// Bytes of zero padding after the file contents.
        zero_len: usize,
    },
}

/// Residency record of a page: which frame holds it and where that frame
/// lives in physical memory.
///
/// The physical address is duplicated here so holders of the address-space
/// lock can reach frame contents without consulting the frame table.
#[derive(Debug, Clone, Copy)]
pub struct Residency {
    /// Frame-table slot holding this page.
    pub frame: FrameId,
    /// Physical address of that frame.
    pub pa: Pa,
}

/// Supplemental bookkeeping for one virtual page.
pub struct PageDescriptor {
    pub(crate) va: Va,
    pub(crate) writable: bool,
    pub(crate) backing: Backing,
    pub(crate) frame: Option<Residency>,
}

impl PageDescriptor {
    /// The page-aligned virtual address this descriptor covers.
    pub fn va(&self) -> Va {
        self.va
    }

    /// Whether user writes to this page are permitted.
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Whether the page currently occupies a physical frame.
    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// The kind the page has, or will have once materialized.
    pub fn eventual_kind(&self) -> PageKind {
        match &self.backing {
            Backing::Uninit { eventual, .. } => eventual.kind(),
            Backing::Anonymous { .. } => PageKind::Anonymous,
            Backing::FileBacked { .. } => PageKind::FileBacked,
        }
    }
}
