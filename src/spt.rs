//! Address spaces and the supplemental page table.
//!
//! The hardware translation table only answers "where is this page right
//! now"; the supplemental page table (SPT) answers everything else: what a
//! page's permissions are, how to produce its contents, and where they went
//! when the page was evicted. [`AddressSpace`] owns one SPT, the handle to
//! the process's hardware [`TranslationMap`], the process's stack layout,
//! and the last user stack pointer recorded on kernel entry.
//!
//! Registration is the only way a page comes into existence, and it
//! allocates no memory for contents: the descriptor records a recipe and
//! the first fault pays for the frame. Claiming makes a registered page
//! resident; it is idempotent, so a racing second claim of the same page
//! never allocates a second frame.
//!
//! Locking: the SPT mutex is a leaf lock. Code holding it must not call
//! into the [`FrameTable`]; `do_claim` below is shaped around that rule,
//! acquiring the frame before taking the SPT lock and committing it after
//! releasing it.

use crate::VmError;
use crate::addressing::{PAGE_SIZE, Pa, Va};
use crate::bridge::{FileHandle, FrameRef, PhysicalPool, SwapDevice, TranslationMap};
use crate::frame::FrameTable;
use crate::page::{
    Backing, EventualBacking, FileRead, PageDescriptor, PageInitializer, Residency, ZeroFill,
};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;
use core::sync::atomic::{AtomicUsize, Ordering};
use hashbrown::HashMap;
use hashbrown::hash_map::Entry;
use spin::Mutex;

/// Placement of a process's user stack.
#[derive(Debug, Clone, Copy)]
pub struct StackLayout {
    /// Highest address of the stack region (exclusive page boundary).
    pub top: Va,
    /// Maximum size the stack may grow to, in bytes.
    pub max_size: usize,
}

impl StackLayout {
    /// Whether a fault at `addr` with stack pointer `rsp` is a legitimate
    /// stack growth.
    ///
    /// Accepts accesses at or above `rsp - 8` (the push instruction writes
    /// below the pointer it traps with) that fall inside the stack region,
    /// down to at most `max_size` bytes below the top.
    pub fn grows_to(&self, addr: Va, rsp: usize) -> bool {
        let top = self.top.into_usize();
        let low = top - self.max_size;
        let a = addr.into_usize();
        let r = rsp.saturating_sub(8);
        low <= r && r <= a && a <= top
    }
}

/// One process's virtual address space: the supplemental page table plus
/// the handles needed to resolve faults within it.
pub struct AddressSpace {
    pub(crate) pages: Mutex<HashMap<Va, PageDescriptor>>,
    translation: Arc<dyn TranslationMap>,
    stack: StackLayout,
    user_rsp: AtomicUsize,
}

impl AddressSpace {
    /// Creates an empty address space over the given hardware translation
    /// table.
    pub fn new(translation: Arc<dyn TranslationMap>, stack: StackLayout) -> Arc<Self> {
        Arc::new(Self {
            pages: Mutex::new(HashMap::new()),
            translation,
            stack,
            user_rsp: AtomicUsize::new(0),
        })
    }

    /// The hardware translation table of this address space.
    pub fn translation(&self) -> &Arc<dyn TranslationMap> {
        &self.translation
    }

    /// The stack layout this address space was created with.
    pub fn stack(&self) -> StackLayout {
        self.stack
    }

    /// Records the user stack pointer at kernel entry.
    ///
    /// Faults taken while already in the kernel use this value for the
    /// stack-growth decision, because the trapping `rsp` is then a kernel
    /// stack pointer.
    pub fn record_user_rsp(&self, rsp: usize) {
        self.user_rsp.store(rsp, Ordering::Relaxed);
    }

    pub(crate) fn recorded_user_rsp(&self) -> usize {
        self.user_rsp.load(Ordering::Relaxed)
    }

    /// Registers a page at `va` to be materialized on first access.
    ///
    /// `va` is aligned down to its page. `initializer` runs exactly once,
    /// against a zeroed frame, when the page is first claimed; afterwards
    /// the page behaves according to `eventual`.
    ///
    /// # Errors
    /// [`VmError::DuplicateRegistration`] if the page is already
    /// registered.
    pub fn register_lazy(
        &self,
        va: Va,
        writable: bool,
        eventual: EventualBacking,
        initializer: Arc<dyn PageInitializer>,
    ) -> Result<(), VmError> {
        let va = va.page_down();
        self.insert(PageDescriptor {
            va,
            writable,
            backing: Backing::Uninit {
                initializer,
                eventual,
            },
            frame: None,
        })
    }

    /// Registers a zero-filled, swap-backed page at `va`.
    pub fn register_anonymous(&self, va: Va, writable: bool) -> Result<(), VmError> {
        self.register_lazy(va, writable, EventualBacking::Anonymous, Arc::new(ZeroFill))
    }

    /// Registers a page backed by `read_len` bytes of `file` at `offset`,
    /// zero-padded to the end of the page.
    pub fn register_file_backed(
        &self,
        va: Va,
        writable: bool,
        file: FileHandle,
        offset: usize,
        read_len: usize,
    ) -> Result<(), VmError> {
        let read_len = read_len.min(PAGE_SIZE);
        let initializer = Arc::new(FileRead {
            file: file.clone(),
            offset,
            read_len,
        });
        self.register_lazy(
            va,
            writable,
            EventualBacking::FileBacked {
                file,
                offset,
                read_len,
                zero_len: PAGE_SIZE - read_len,
            },
            initializer,
        )
    }

    pub(crate) fn insert(&self, pd: PageDescriptor) -> Result<(), VmError> {
        let mut pages = self.pages.lock();
        match pages.entry(pd.va) {
            Entry::Occupied(_) => Err(VmError::DuplicateRegistration),
            Entry::Vacant(slot) => {
                slot.insert(pd);
                Ok(())
            }
        }
    }

    /// Runs `f` against the descriptor covering `va`, if one is
    /// registered.
    ///
    /// The closure runs under the SPT lock; it must not call back into
    /// this address space or the frame table.
    pub fn find<R>(&self, va: Va, f: impl FnOnce(&PageDescriptor) -> R) -> Option<R> {
        let pages = self.pages.lock();
        pages.get(&va.page_down()).map(f)
    }

    /// Whether a page is registered at `va`.
    pub fn contains(&self, va: Va) -> bool {
        self.pages.lock().contains_key(&va.page_down())
    }

    /// Makes the page covering `va` resident, materializing its contents.
    ///
    /// A no-op if the page is already resident.
    ///
    /// # Errors
    /// - [`VmError::SegmentationViolation`] if no page is registered at
    ///   `va`.
    /// - [`VmError::ResourceExhaustion`] if no frame or translation entry
    ///   could be obtained.
    /// - [`VmError::BackingIo`] if swap-in or the file read failed.
    pub fn claim_page(self: &Arc<Self>, va: Va, frames: &FrameTable) -> Result<(), VmError> {
        self.do_claim(va, frames, false).map(|_| ())
    }

    /// Claim with control over whether the frame stays pinned afterwards.
    ///
    /// Duplication keeps the destination frame pinned while it copies into
    /// it; the regular fault path does not.
    pub(crate) fn do_claim(
        self: &Arc<Self>,
        va: Va,
        frames: &FrameTable,
        keep_pinned: bool,
    ) -> Result<Residency, VmError> {
        let va = va.page_down();

        // Fast path: already resident.
        {
            let pages = self.pages.lock();
            let pd = pages.get(&va).ok_or(VmError::SegmentationViolation)?;
            if let Some(res) = pd.frame {
                return Ok(res);
            }
        }

        // Acquire with no SPT lock held (the frame table may take SPT
        // locks to evict). The grant arrives zeroed and pinned, so it
        // cannot be chosen as a victim while we fill it.
        let grant = frames.acquire()?;
        let pa = grant.pa();

        let outcome = {
            let mut pages = self.pages.lock();
            match pages.get_mut(&va) {
                None => Err(VmError::SegmentationViolation),
                Some(pd) => {
                    if let Some(res) = pd.frame {
                        // Lost the race to a concurrent claim.
                        Ok(Some(res))
                    } else {
                        match materialize(pd, frames.pool(), frames.swap(), pa) {
                            Err(e) => Err(e),
                            Ok(()) if !self.translation.install(va, pa, pd.writable) => {
                                Err(VmError::ResourceExhaustion)
                            }
                            Ok(()) => {
                                pd.frame = Some(Residency {
                                    frame: grant.id(),
                                    pa,
                                });
                                Ok(None)
                            }
                        }
                    }
                }
            }
        };

        match outcome {
            Ok(None) => {
                let res = Residency {
                    frame: grant.id(),
                    pa,
                };
                frames.commit(grant, self, va, keep_pinned);
                Ok(res)
            }
            Ok(Some(res)) => {
                frames.discard(grant);
                Ok(res)
            }
            Err(e) => {
                frames.discard(grant);
                Err(e)
            }
        }
    }

    /// Unregisters the page at `va`, tearing down its frame, swap slot,
    /// and translation. Returns whether a page was registered there.
    pub fn remove(self: &Arc<Self>, va: Va, frames: &FrameTable) -> bool {
        let pd = { self.pages.lock().remove(&va.page_down()) };
        match pd {
            Some(pd) => {
                frames.detach(self, pd);
                true
            }
            None => false,
        }
    }

    /// Tears down every page of this address space: dirty resident
    /// file-backed pages are written back, frames are released, swap slots
    /// are freed, and all translations are cleared.
    pub fn destroy_all(self: &Arc<Self>, frames: &FrameTable) {
        let drained: Vec<PageDescriptor> = {
            let mut pages = self.pages.lock();
            pages.drain().map(|(_, pd)| pd).collect()
        };
        for pd in drained {
            frames.detach(self, pd);
        }
    }
}

/// Fills the frame at `pa` with the page's contents and advances the
/// backing state machine.
///
/// The frame arrives zeroed. On error the backing is left exactly as it
/// was, so the claim can be retried.
pub(crate) fn materialize(
    pd: &mut PageDescriptor,
    pool: &dyn PhysicalPool,
    swap: &dyn SwapDevice,
    pa: Pa,
) -> Result<(), VmError> {
    let mut frame = FrameRef::new(pool, pa);
    let bytes = frame.bytes_mut();

    if matches!(pd.backing, Backing::Uninit { .. }) {
        let taken = mem::replace(&mut pd.backing, Backing::Anonymous { swap_slot: None });
        let Backing::Uninit {
            initializer,
            eventual,
        } = taken
        else {
            unreachable!()
        };
        return match initializer.initialize(pd.va, bytes) {
            Ok(()) => {
                pd.backing = eventual.into_backing();
                Ok(())
            }
            Err(e) => {
                pd.backing = Backing::Uninit {
                    initializer,
                    eventual,
                };
                Err(e)
            }
        };
    }

    match &mut pd.backing {
        Backing::Anonymous { swap_slot } => {
            if let Some(slot) = swap_slot.take() {
                match swap.read(slot, bytes) {
                    Ok(()) => {
                        swap.free_slot(slot);
                        log::trace!("swap-in {:?} from slot {}", pd.va, slot.0);
                        Ok(())
                    }
                    Err(e) => {
                        *swap_slot = Some(slot);
                        Err(e)
                    }
                }
            } else {
                // Never evicted: a fresh frame is already zeroed.
                Ok(())
            }
        }
        Backing::FileBacked {
            file,
            offset,
            read_len,
            ..
        } => {
            let want = (*read_len).min(PAGE_SIZE);
            file.0.read(*offset, &mut bytes[..want])?;
            Ok(())
        }
        Backing::Uninit { .. } => unreachable!(),
    }
}
