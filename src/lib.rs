//! # Demand-paged virtual memory management.
//!
//! This crate implements the machinery a kernel needs to run processes with
//! lazily populated address spaces: a per-process supplemental page table
//! that records how every virtual page is backed, a global frame table that
//! arbitrates physical memory and evicts under pressure, a page-fault
//! resolver that decides fault legitimacy and materializes pages on demand,
//! and a deep-copy protocol used when an address space is cloned.
//!
//! The crate owns the policy; the surrounding kernel owns the mechanism.
//! Every interaction with hardware or drivers goes through one of four
//! narrow traits defined in [`bridge`]:
//!
//! - [`bridge::TranslationMap`] — install/clear/query hardware
//!   virtual-to-physical translations for one address space.
//! - [`bridge::PhysicalPool`] — raw physical page allocation and access to
//!   frame memory.
//! - [`bridge::SwapDevice`] — page-granular backing store for evicted
//!   anonymous pages.
//! - [`bridge::BackingFile`] — positional reads and writes for file-backed
//!   pages.
//!
//! ## Lifecycle of a page
//!
//! A page comes into existence through [`AddressSpace::register_lazy`] (or
//! one of its convenience wrappers), which records the page's permissions
//! and a recipe for producing its first contents without allocating any
//! memory. The first access faults; [`AddressSpace::handle_fault`] decides
//! whether the fault is legitimate and, if so, claims the page: a frame is
//! acquired from the [`FrameTable`] (evicting a victim if the pool is dry),
//! the hardware translation is installed, and the backing-specific
//! materialization runs — zero fill, file read, or swap-in. From then on the
//! page cycles between resident and evicted until it is removed or the
//! address space is destroyed.
//!
//! ## Locking
//!
//! The frame table keeps one global lock held across victim selection,
//! eviction, and reassignment, so two concurrent faults can never tear the
//! same frame in half. Each address space has its own lock around the
//! supplemental page table. The frame table may take an address-space lock
//! while evicting; holders of an address-space lock must never call into
//! the frame table. All public entry points obey this order.

#![no_std]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod addressing;
pub mod bridge;
pub mod fault;
pub mod fork;
pub mod frame;
pub mod page;
pub mod spt;

#[cfg(test)]
pub(crate) mod testing;

pub use addressing::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, Pa, Va};
pub use fault::{FaultFlags, PageFault};
pub use fork::duplicate;
pub use frame::{FrameId, FrameTable};
pub use page::{
    Backing, EventualBacking, FileRead, PageDescriptor, PageInitializer, PageKind, ZeroFill,
};
pub use spt::{AddressSpace, StackLayout};

use thiserror::Error;

/// Enum representing errors that can occur during a memory operation.
///
/// Each variant corresponds to a distinct failure class; none of them are
/// swallowed internally. A fault-path error terminates the faulting
/// process; a registration or duplication error is surfaced to the caller
/// unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    /// A page is already registered at the requested virtual address.
    #[error("virtual page is already registered")]
    DuplicateRegistration,
    /// A write access hit a page that is not writable, or a protection
    /// fault was raised on a present mapping.
    #[error("access violates page permissions")]
    PermissionViolation,
    /// The address is covered by no registered page and is not a valid
    /// stack-growth candidate.
    #[error("no registered page covers the address")]
    SegmentationViolation,
    /// No physical frame could be obtained even after attempting eviction,
    /// or the hardware translation table itself is out of resources.
    #[error("out of physical memory resources")]
    ResourceExhaustion,
    /// A swap or file transfer failed.
    #[error("backing store I/O failed")]
    BackingIo,
}

impl VmError {
    /// Converts the error into the conventional negative errno value, for
    /// use as a raw system-call return value.
    pub fn errno(self) -> isize {
        match self {
            VmError::DuplicateRegistration => -17, // EEXIST
            VmError::PermissionViolation => -13,   // EACCES
            VmError::SegmentationViolation => -14, // EFAULT
            VmError::ResourceExhaustion => -12,    // ENOMEM
            VmError::BackingIo => -5,              // EIO
        }
    }
}
