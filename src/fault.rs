//! Page-fault decoding and resolution.
//!
//! The hardware reports a fault as an error-code bitfield plus the
//! faulting address; the trap handler packages those into a [`PageFault`]
//! and hands it to [`AddressSpace::handle_fault`]. Resolution proceeds in
//! a fixed order:
//!
//! 1. A fault on a *present* mapping is a protection violation, never a
//!    paging event.
//! 2. If the address is an unregistered, legitimate stack growth, a fresh
//!    anonymous page is registered on the spot.
//! 3. The supplemental page table is consulted; no descriptor means the
//!    access is a segmentation violation.
//! 4. A write to a read-only page is refused.
//! 5. Otherwise the page is claimed, which materializes it.
//!
//! Faults taken while the CPU was already in kernel mode (a system call
//! touching user memory) use the user stack pointer recorded at kernel
//! entry for the stack-growth decision, since the trapping `rsp` then
//! points into the kernel stack.

use crate::VmError;
use crate::addressing::Va;
use crate::frame::FrameTable;
use crate::spt::AddressSpace;
use alloc::sync::Arc;
use bitflags::bitflags;

bitflags! {
    /// Hardware page-fault error code bits.
    pub struct FaultFlags: u32 {
        /// The fault was a protection violation on a present mapping.
        /// Clear means the mapping was not present.
        const PRESENT = 1 << 0;
        /// The access was a write.
        const WRITE = 1 << 1;
        /// The access originated in user mode.
        const USER = 1 << 2;
    }
}

/// A decoded page fault.
#[derive(Debug, Clone, Copy)]
pub struct PageFault {
    /// The faulting address, not necessarily page-aligned.
    pub addr: Va,
    /// The stack pointer at the time of the trap.
    pub trap_rsp: usize,
    /// Whether the access was a write.
    pub write: bool,
    /// Whether the access came from user mode.
    pub user: bool,
    /// Whether the mapping was absent (as opposed to a protection fault).
    pub not_present: bool,
}

impl PageFault {
    /// Builds a fault record from already-decoded fields.
    pub fn new(addr: Va, trap_rsp: usize, write: bool, user: bool, not_present: bool) -> Self {
        Self {
            addr,
            trap_rsp,
            write,
            user,
            not_present,
        }
    }

    /// Decodes a hardware error code into a fault record.
    pub fn from_error_code(addr: Va, trap_rsp: usize, error_code: u32) -> Self {
        let flags = FaultFlags::from_bits_truncate(error_code);
        Self {
            addr,
            trap_rsp,
            write: flags.contains(FaultFlags::WRITE),
            user: flags.contains(FaultFlags::USER),
            not_present: !flags.contains(FaultFlags::PRESENT),
        }
    }
}

impl AddressSpace {
    /// Resolves a page fault against this address space.
    ///
    /// On success the faulting access can be retried and will proceed. An
    /// error means the access is illegal or unservable and the faulting
    /// process should be terminated.
    ///
    /// # Errors
    /// - [`VmError::PermissionViolation`] for protection faults and writes
    ///   to read-only pages.
    /// - [`VmError::SegmentationViolation`] if no page covers the address
    ///   and it is not a valid stack growth.
    /// - [`VmError::ResourceExhaustion`] / [`VmError::BackingIo`] if the
    ///   claim could not be serviced.
    pub fn handle_fault(
        self: &Arc<Self>,
        frames: &FrameTable,
        fault: PageFault,
    ) -> Result<(), VmError> {
        if !fault.not_present {
            // The mapping exists; the hardware refused the access.
            log::debug!("protection fault at {:?}", fault.addr);
            return Err(VmError::PermissionViolation);
        }

        let rsp = if fault.user {
            fault.trap_rsp
        } else {
            self.recorded_user_rsp()
        };

        if self.stack().grows_to(fault.addr, rsp) && !self.contains(fault.addr) {
            log::trace!("growing stack to cover {:?}", fault.addr);
            self.register_anonymous(fault.addr, true)?;
        }

        let writable = self
            .find(fault.addr, |pd| pd.writable())
            .ok_or(VmError::SegmentationViolation)?;
        if fault.write && !writable {
            return Err(VmError::PermissionViolation);
        }

        self.claim_page(fault.addr, frames)
    }
}
