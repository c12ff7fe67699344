//! Physical and virtual memory addressing.
//!
//! This module provides the two address newtypes the rest of the crate is
//! built on: [`Va`] for a virtual address inside a user address space and
//! [`Pa`] for a physical address handed out by the physical-page pool.
//! Keeping the two spaces as distinct types makes it impossible to install
//! a translation backwards or to index the supplemental page table with a
//! physical address.
//!
//! Both types are thin wrappers around `usize` with checked constructors
//! and page-alignment helpers. Arithmetic that cannot produce an invalid
//! address (adding an in-page offset, aligning down) is provided directly;
//! anything else goes through `into_usize` so the cast is visible at the
//! call site.

/// The size of a single page in memory, in bytes.
pub const PAGE_SIZE: usize = 0x1000;

/// The shift amount to get the page number from a given address.
pub const PAGE_SHIFT: usize = 12;

/// A mask for extracting the offset within a page from a given address.
pub const PAGE_MASK: usize = 0xfff;

/// Represents a virtual address of a user address space.
///
/// A [`Va`] is not required to be page-aligned; fault addresses arrive with
/// their page offset intact. Use [`Va::page_down`] to obtain the page key
/// used by the supplemental page table.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// Creates a new virtual address if the address is canonical.
    ///
    /// # Returns
    /// - `Some(Va)` if the address lies in either canonical half.
    /// - `None` otherwise.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < 0x0000_8000_0000_0000 || addr >= 0xffff_8000_0000_0000 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast the virtual address into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Align down the virtual address to the page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Align up the virtual address to the page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Extracts the offset within the page from this address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Whether this address sits exactly on a page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }
}

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va({:#x})", self.0)
    }
}

impl core::ops::Add<usize> for Va {
    type Output = Va;
    fn add(self, rhs: usize) -> Va {
        Va(self.0 + rhs)
    }
}

impl core::ops::Sub<usize> for Va {
    type Output = Va;
    fn sub(self, rhs: usize) -> Va {
        Va(self.0 - rhs)
    }
}

impl core::ops::Sub<Va> for Va {
    type Output = usize;
    fn sub(self, rhs: Va) -> usize {
        self.0 - rhs.0
    }
}

/// Represents a physical address.
///
/// Physical addresses are produced only by the physical-page pool and are
/// consumed by the hardware translation bridge; this crate never does
/// arithmetic on them beyond identifying the frame they belong to.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// Creates a new physical address if the address is valid.
    ///
    /// # Returns
    /// - `Some(Pa)` if the address falls within the physical address range.
    /// - `None` otherwise.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < 0xffff_0000_0000_0000 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast the physical address into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Align down the physical address to the page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }
}

impl core::fmt::Debug for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa({:#x})", self.0)
    }
}
