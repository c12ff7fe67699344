//! The global frame table: physical-frame accounting and eviction.
//!
//! Every frame lent to user pages is tracked by one entry in a slab. An
//! entry records the frame's physical address, a software
//! reference bit for the replacement policy, a pin flag, and the list of
//! `(address space, va)` owners mapping the frame. Anonymous pages always
//! have exactly one owner; file-backed frames may be shared by several
//! address spaces after duplication, which is why owners are a list and
//! why eviction detaches every sharer before the frame is reused.
//!
//! Replacement is a second-chance clock: the hand walks the slab, clearing
//! reference bits as it passes and selecting the first frame whose bit is
//! already clear. Pinned frames (mid-materialization or mid-copy) are
//! never candidates. The reference bit is set whenever a frame is claimed
//! or attached.
//!
//! One mutex guards the whole table and stays held across victim
//! selection, content securing (swap-out or file write-back) and owner
//! detachment, so a fault on one core can never observe a half-evicted
//! frame built by another. Taking an address-space lock while holding the
//! table lock is part of the crate's lock order; the reverse never
//! happens.

use crate::VmError;
use crate::addressing::{PAGE_SIZE, Pa, Va};
use crate::bridge::{FileHandle, FrameRef, PhysicalPool, SwapDevice};
use crate::page::Backing;
use crate::spt::AddressSpace;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::mem;
use spin::Mutex;

/// Index of a frame's slot in the frame table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameId(pub(crate) usize);

struct FrameEntry {
    pa: Pa,
    owners: Vec<(Weak<AddressSpace>, Va)>,
    referenced: bool,
    pinned: bool,
}

struct Inner {
    frames: slab::Slab<FrameEntry>,
    hand: usize,
}

/// A freshly acquired frame, zeroed and pinned, not yet linked to a page.
///
/// Must be either committed or discarded; dropping it on the floor would
/// pin the frame forever.
pub(crate) struct FrameGrant {
    id: FrameId,
    pa: Pa,
}

impl FrameGrant {
    pub(crate) fn id(&self) -> FrameId {
        self.id
    }

    pub(crate) fn pa(&self) -> Pa {
        self.pa
    }
}

/// Global arbiter of physical frames for user pages.
pub struct FrameTable {
    pool: Arc<dyn PhysicalPool>,
    swap: Arc<dyn SwapDevice>,
    inner: Mutex<Inner>,
}

fn owner_is(entry: &(Weak<AddressSpace>, Va), space: &Arc<AddressSpace>, va: Va) -> bool {
    entry.1 == va && core::ptr::eq(entry.0.as_ptr(), Arc::as_ptr(space))
}

impl FrameTable {
    /// Creates a frame table over the given physical pool and swap device.
    pub fn new(pool: Arc<dyn PhysicalPool>, swap: Arc<dyn SwapDevice>) -> Self {
        Self {
            pool,
            swap,
            inner: Mutex::new(Inner {
                frames: slab::Slab::new(),
                hand: 0,
            }),
        }
    }

    /// Number of frames currently lent to user pages.
    pub fn resident_frames(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub(crate) fn pool(&self) -> &dyn PhysicalPool {
        &*self.pool
    }

    pub(crate) fn swap(&self) -> &dyn SwapDevice {
        &*self.swap
    }

    /// Obtains a zeroed, pinned frame, evicting a victim if the pool is
    /// dry.
    ///
    /// # Errors
    /// - [`VmError::ResourceExhaustion`] if the pool is empty and no
    ///   unpinned victim exists.
    /// - [`VmError::BackingIo`] if securing the victim's contents failed.
    pub(crate) fn acquire(&self) -> Result<FrameGrant, VmError> {
        let mut inner = self.inner.lock();
        let pa = match self.pool.allocate() {
            Some(pa) => pa,
            None => self.evict_one(&mut inner)?,
        };
        // Zero before hand-off so no prior contents can leak.
        unsafe { core::ptr::write_bytes(self.pool.map_frame(pa), 0, PAGE_SIZE) };
        let id = FrameId(inner.frames.insert(FrameEntry {
            pa,
            owners: Vec::new(),
            referenced: true,
            pinned: true,
        }));
        Ok(FrameGrant { id, pa })
    }

    /// Links a grant to the page that now occupies it and, unless
    /// `keep_pinned`, makes the frame eligible for eviction.
    pub(crate) fn commit(
        &self,
        grant: FrameGrant,
        space: &Arc<AddressSpace>,
        va: Va,
        keep_pinned: bool,
    ) {
        let mut inner = self.inner.lock();
        let entry = inner
            .frames
            .get_mut(grant.id.0)
            .expect("granted frame vanished");
        entry.owners.push((Arc::downgrade(space), va));
        entry.referenced = true;
        entry.pinned = keep_pinned;
    }

    /// Returns an unused grant's frame to the pool.
    pub(crate) fn discard(&self, grant: FrameGrant) {
        {
            let mut inner = self.inner.lock();
            inner.frames.remove(grant.id.0);
        }
        self.pool.release(grant.pa);
    }

    /// Clears the pin left by a `keep_pinned` commit or by
    /// [`attach_shared`](Self::attach_shared).
    pub(crate) fn unpin(&self, id: FrameId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.frames.get_mut(id.0) {
            entry.pinned = false;
        }
    }

    /// Adds `(dst, va)` as a co-owner of the frame `(src, src_va)` maps,
    /// pinning the frame until the caller finishes linking.
    ///
    /// Returns the frame's physical address, or `None` if the source no
    /// longer owns the frame (it was evicted concurrently).
    pub(crate) fn attach_shared(
        &self,
        dst: &Arc<AddressSpace>,
        va: Va,
        src: &Arc<AddressSpace>,
        src_va: Va,
        id: FrameId,
    ) -> Option<Pa> {
        let mut inner = self.inner.lock();
        let entry = inner.frames.get_mut(id.0)?;
        if !entry.owners.iter().any(|o| owner_is(o, src, src_va)) {
            return None;
        }
        entry.owners.push((Arc::downgrade(dst), va));
        entry.referenced = true;
        entry.pinned = true;
        Some(entry.pa)
    }

    /// Reverses a failed [`attach_shared`](Self::attach_shared): drops the
    /// co-owner entry and the pin.
    pub(crate) fn detach_shared(&self, space: &Arc<AddressSpace>, va: Va, id: FrameId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.frames.get_mut(id.0) {
            entry.owners.retain(|o| !owner_is(o, space, va));
            entry.pinned = false;
        }
    }

    /// Finalizes the removal of a page from an address space: writes back
    /// dirty file-backed contents, clears the translation, drops the
    /// owner link, releases the frame once the last owner is gone, and
    /// frees any swap slot the page held.
    pub(crate) fn detach(&self, space: &Arc<AddressSpace>, pd: crate::page::PageDescriptor) {
        if let Some(res) = pd.frame {
            // Sample the dirty bit before the translation goes away.
            let dirty = pd.writable && space.translation().is_dirty(pd.va);
            let mut release_frame = false;
            {
                let mut inner = self.inner.lock();
                if let Some(entry) = inner.frames.get_mut(res.frame.0) {
                    // Guard against slot reuse after a concurrent eviction.
                    let still_owner = entry.pa == res.pa
                        && entry.owners.iter().any(|o| owner_is(o, space, pd.va));
                    if still_owner {
                        if dirty {
                            if let Backing::FileBacked {
                                file,
                                offset,
                                read_len,
                                ..
                            } = &pd.backing
                            {
                                write_back(self.pool(), res.pa, file, *offset, *read_len);
                            }
                        }
                        space.translation().clear(pd.va);
                        entry.owners.retain(|o| !owner_is(o, space, pd.va));
                        release_frame = entry.owners.is_empty() && !entry.pinned;
                    }
                }
                if release_frame {
                    inner.frames.remove(res.frame.0);
                }
            }
            if release_frame {
                self.pool.release(res.pa);
            }
        }
        if let Backing::Anonymous {
            swap_slot: Some(slot),
        } = pd.backing
        {
            self.swap.free_slot(slot);
        }
    }

    /// Evicts one victim and returns its now-free physical address.
    /// Called with the table lock held.
    fn evict_one(&self, inner: &mut Inner) -> Result<Pa, VmError> {
        let victim = select_victim(inner).ok_or(VmError::ResourceExhaustion)?;
        let entry = inner.frames.get_mut(victim).expect("victim vanished");
        let pa = entry.pa;
        let owners = mem::take(&mut entry.owners);
        log::debug!("evicting frame {:?} ({} owner(s))", pa, owners.len());
        match self.secure_and_detach(pa, &owners) {
            Ok(()) => {
                inner.frames.remove(victim);
                Ok(pa)
            }
            Err(e) => {
                // Contents were not secured; the frame stays as it was.
                inner
                    .frames
                    .get_mut(victim)
                    .expect("victim vanished")
                    .owners = owners;
                Err(e)
            }
        }
    }

    /// Secures a victim frame's contents, then detaches every owner.
    ///
    /// Phase one (fallible): swap-out for anonymous pages, write-back for
    /// dirty writable file-backed pages, nothing for clean ones. Phase two
    /// (infallible): clear every owner's translation and residency. No
    /// state is mutated unless phase one succeeded.
    fn secure_and_detach(
        &self,
        pa: Pa,
        owners: &[(Weak<AddressSpace>, Va)],
    ) -> Result<(), VmError> {
        let live: Vec<(Arc<AddressSpace>, Va)> = owners
            .iter()
            .filter_map(|(w, va)| w.upgrade().map(|s| (s, *va)))
            .collect();

        enum Plan {
            SwapOut,
            WriteBack {
                file: FileHandle,
                offset: usize,
                len: usize,
            },
            Drop,
        }

        // Classify via the first owner whose descriptor survives. Owners
        // of one frame all describe the same backing.
        let mut plan = Plan::Drop;
        for (space, va) in &live {
            let pages = space.pages.lock();
            let Some(pd) = pages.get(va) else { continue };
            plan = match &pd.backing {
                Backing::Anonymous { .. } => Plan::SwapOut,
                Backing::FileBacked {
                    file,
                    offset,
                    read_len,
                    ..
                } => {
                    let dirty = pd.writable
                        && live.iter().any(|(s, v)| s.translation().is_dirty(*v));
                    if dirty {
                        Plan::WriteBack {
                            file: file.clone(),
                            offset: *offset,
                            len: (*read_len).min(PAGE_SIZE),
                        }
                    } else {
                        Plan::Drop
                    }
                }
                Backing::Uninit { .. } => Plan::Drop,
            };
            break;
        }

        let view = FrameRef::new(self.pool(), pa);
        let slot = match plan {
            Plan::SwapOut => {
                let slot = self.swap.alloc_slot()?;
                if let Err(e) = self.swap.write(slot, view.bytes()) {
                    self.swap.free_slot(slot);
                    return Err(e);
                }
                log::trace!("swap-out {:?} to slot {}", pa, slot.0);
                Some(slot)
            }
            Plan::WriteBack { file, offset, len } => {
                file.0.write(offset, &view.bytes()[..len])?;
                None
            }
            Plan::Drop => None,
        };

        for (space, va) in &live {
            space.translation().clear(*va);
            let mut pages = space.pages.lock();
            if let Some(pd) = pages.get_mut(va) {
                pd.frame = None;
                if let (Some(slot), Backing::Anonymous { swap_slot }) = (slot, &mut pd.backing) {
                    *swap_slot = Some(slot);
                }
            }
        }
        Ok(())
    }
}

/// Second-chance clock scan. Returns the slab key of the victim, or `None`
/// if every frame is pinned.
fn select_victim(inner: &mut Inner) -> Option<usize> {
    let keys: Vec<usize> = inner
        .frames
        .iter()
        .filter(|(_, e)| !e.pinned)
        .map(|(k, _)| k)
        .collect();
    if keys.is_empty() {
        return None;
    }
    let start = keys.iter().position(|&k| k >= inner.hand).unwrap_or(0);
    // At most two sweeps: the first clears reference bits, the second is
    // then guaranteed to find a victim.
    for _ in 0..2 {
        for i in 0..keys.len() {
            let k = keys[(start + i) % keys.len()];
            let entry = inner.frames.get_mut(k).expect("scanned frame vanished");
            if entry.referenced {
                entry.referenced = false;
            } else {
                inner.hand = k + 1;
                return Some(k);
            }
        }
    }
    None
}

fn write_back(pool: &dyn PhysicalPool, pa: Pa, file: &FileHandle, offset: usize, read_len: usize) {
    let view = FrameRef::new(pool, pa);
    if file
        .0
        .write(offset, &view.bytes()[..read_len.min(PAGE_SIZE)])
        .is_err()
    {
        log::warn!("file write-back failed for frame {:?}", pa);
    }
}
