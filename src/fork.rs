//! Address-space duplication.
//!
//! [`duplicate`] gives a child address space its own copy of everything
//! the parent has registered, preserving laziness where possible:
//!
//! - Never-materialized pages are re-registered with the same initializer
//!   and stay lazy; the child pays for them only if it ever touches them.
//! - File-backed pages are re-registered over the same file region. If the
//!   parent's copy is resident, the child is attached to the very same
//!   frame rather than re-reading the file; the frame's owner list keeps
//!   both translations honest across eviction.
//! - Anonymous pages that have been materialized get an eager, independent
//!   copy: the child's page is claimed and the parent's bytes are copied
//!   in, swapping the parent's page back in first if it was evicted.
//!
//! The first failure aborts the duplication; the caller is expected to
//! tear the partially built child down with
//! [`AddressSpace::destroy_all`](crate::AddressSpace::destroy_all).

use crate::VmError;
use crate::addressing::Va;
use crate::bridge::{FileHandle, FrameRef};
use crate::frame::FrameTable;
use crate::page::{
    Backing, EventualBacking, PageDescriptor, PageInitializer, Residency,
};
use crate::spt::AddressSpace;
use alloc::sync::Arc;
use alloc::vec::Vec;

enum Entry {
    Uninit {
        va: Va,
        writable: bool,
        initializer: Arc<dyn PageInitializer>,
        eventual: EventualBacking,
    },
    FileBacked {
        va: Va,
        writable: bool,
        file: FileHandle,
        offset: usize,
        read_len: usize,
        zero_len: usize,
        resident: Option<Residency>,
    },
    Anonymous {
        va: Va,
        writable: bool,
    },
}

/// Populates empty `dst` with a copy of every page registered in `src`.
///
/// # Errors
/// Propagates the first registration, claim, or copy failure. `dst` is
/// left partially populated; tear it down with `destroy_all`.
pub fn duplicate(
    dst: &Arc<AddressSpace>,
    src: &Arc<AddressSpace>,
    frames: &FrameTable,
) -> Result<(), VmError> {
    let snapshot: Vec<Entry> = {
        let pages = src.pages.lock();
        pages
            .values()
            .map(|pd| match &pd.backing {
                Backing::Uninit {
                    initializer,
                    eventual,
                } => Entry::Uninit {
                    va: pd.va,
                    writable: pd.writable,
                    initializer: initializer.clone(),
                    eventual: eventual.clone(),
                },
                Backing::FileBacked {
                    file,
                    offset,
                    read_len,
                    zero_len,
                } => Entry::FileBacked {
                    va: pd.va,
                    writable: pd.writable,
                    file: file.clone(),
                    offset: *offset,
                    read_len: *read_len,
                    zero_len: *zero_len,
                    resident: pd.frame,
                },
                Backing::Anonymous { .. } => Entry::Anonymous {
                    va: pd.va,
                    writable: pd.writable,
                },
            })
            .collect()
    };
    log::debug!("duplicating address space ({} pages)", snapshot.len());

    for entry in snapshot {
        match entry {
            Entry::Uninit {
                va,
                writable,
                initializer,
                eventual,
            } => {
                dst.register_lazy(va, writable, eventual, initializer)?;
            }
            Entry::FileBacked {
                va,
                writable,
                file,
                offset,
                read_len,
                zero_len,
                resident,
            } => {
                dst.insert(PageDescriptor {
                    va,
                    writable,
                    backing: Backing::FileBacked {
                        file,
                        offset,
                        read_len,
                        zero_len,
                    },
                    frame: None,
                })?;
                if let Some(res) = resident {
                    share_file_frame(dst, src, va, frames, res)?;
                }
            }
            Entry::Anonymous { va, writable } => {
                dst.register_anonymous(va, writable)?;
                copy_anonymous(dst, src, va, frames)?;
            }
        }
    }
    Ok(())
}

/// Attaches `dst`'s page at `va` to the frame `src` has resident there.
///
/// If the frame was evicted in the meantime the child's page simply starts
/// non-resident and re-reads the file on first touch.
fn share_file_frame(
    dst: &Arc<AddressSpace>,
    src: &Arc<AddressSpace>,
    va: Va,
    frames: &FrameTable,
    res: Residency,
) -> Result<(), VmError> {
    let Some(pa) = frames.attach_shared(dst, va, src, va, res.frame) else {
        return Ok(());
    };
    let writable = dst
        .find(va, |pd| pd.writable())
        .ok_or(VmError::SegmentationViolation)?;
    if !dst.translation().install(va, pa, writable) {
        frames.detach_shared(dst, va, res.frame);
        return Err(VmError::ResourceExhaustion);
    }
    {
        let mut pages = dst.pages.lock();
        if let Some(pd) = pages.get_mut(&va) {
            pd.frame = Some(Residency {
                frame: res.frame,
                pa,
            });
        }
    }
    frames.unpin(res.frame);
    Ok(())
}

/// Claims `dst`'s anonymous page at `va` and fills it with the current
/// contents of `src`'s page, swapping the source back in if needed.
fn copy_anonymous(
    dst: &Arc<AddressSpace>,
    src: &Arc<AddressSpace>,
    va: Va,
    frames: &FrameTable,
) -> Result<(), VmError> {
    // Pinned so the destination frame cannot be evicted mid-copy.
    let dst_res = dst.do_claim(va, frames, true)?;
    let result = (|| loop {
        let copied = {
            let pages = src.pages.lock();
            match pages.get(&va) {
                // Source page vanished; the zeroed copy stands.
                None => true,
                Some(pd) => match pd.frame {
                    Some(src_res) => {
                        let src_view = FrameRef::new(frames.pool(), src_res.pa);
                        let mut dst_view = FrameRef::new(frames.pool(), dst_res.pa);
                        dst_view.bytes_mut().copy_from_slice(src_view.bytes());
                        true
                    }
                    None => false,
                },
            }
        };
        if copied {
            return Ok(());
        }
        // Evicted source: force it resident, then retry the copy.
        src.claim_page(va, frames)?;
    })();
    frames.unpin(dst_res.frame);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::PAGE_SIZE;
    use crate::bridge::TranslationMap;
    use crate::testing::Fixture;

    fn pattern(seed: u8) -> [u8; PAGE_SIZE] {
        let mut p = [0u8; PAGE_SIZE];
        for (i, b) in p.iter_mut().enumerate() {
            *b = seed.wrapping_add(i as u8);
        }
        p
    }

    fn write_page(fx: &Fixture, space: &Arc<AddressSpace>, va: Va, seed: u8) {
        let pa = space.translation().lookup(va).expect("page resident");
        let mut view = FrameRef::new(&*fx.pool, pa);
        view.bytes_mut().copy_from_slice(&pattern(seed));
    }

    fn read_page(fx: &Fixture, space: &Arc<AddressSpace>, va: Va) -> [u8; PAGE_SIZE] {
        let pa = space.translation().lookup(va).expect("page resident");
        *FrameRef::new(&*fx.pool, pa).bytes()
    }

    #[test]
    fn anonymous_pages_are_independent_copies() {
        let fx = Fixture::new(8);
        let va = Va::new(0x1000).unwrap();
        fx.space.register_anonymous(va, true).unwrap();
        fx.space.claim_page(va, &fx.frames).unwrap();
        write_page(&fx, &fx.space, va, 0x10);

        let (child, _) = fx.child();
        duplicate(&child, &fx.space, &fx.frames).unwrap();

        assert_eq!(fx.pool.in_use(), 2);
        assert_eq!(read_page(&fx, &child, va), pattern(0x10));

        // Writes to the parent do not bleed into the child, nor the
        // other way around.
        write_page(&fx, &fx.space, va, 0x77);
        assert_eq!(read_page(&fx, &child, va), pattern(0x10));
        write_page(&fx, &child, va, 0x2b);
        assert_eq!(read_page(&fx, &fx.space, va), pattern(0x77));
    }

    #[test]
    fn uninitialized_pages_stay_lazy() {
        let fx = Fixture::new(4);
        let va = Va::new(0x3000).unwrap();
        fx.space.register_anonymous(va, true).unwrap();

        let (child, _) = fx.child();
        duplicate(&child, &fx.space, &fx.frames).unwrap();

        assert!(child.contains(va));
        assert!(!child.find(va, |pd| pd.is_resident()).unwrap());
        assert_eq!(fx.pool.in_use(), 0);
    }

    #[test]
    fn resident_file_pages_share_one_frame() {
        let fx = Fixture::new(4);
        let va = Va::new(0x2000).unwrap();
        let file = fx.file_with(&[0xcd; 256]);
        fx.space
            .register_file_backed(va, false, file, 0, 256)
            .unwrap();
        fx.space.claim_page(va, &fx.frames).unwrap();

        let (child, child_tr) = fx.child();
        duplicate(&child, &fx.space, &fx.frames).unwrap();

        assert_eq!(fx.pool.in_use(), 1);
        let parent_pa = fx.translation.lookup(va).unwrap();
        assert_eq!(child_tr.lookup(va), Some(parent_pa));
        assert!(child.find(va, |pd| pd.is_resident()).unwrap());
    }

    #[test]
    fn evicting_a_shared_frame_detaches_both_owners() {
        let fx = Fixture::new(1);
        let shared = Va::new(0x2000).unwrap();
        let file = fx.file_with(&[0xcd; 256]);
        fx.space
            .register_file_backed(shared, false, file, 0, 256)
            .unwrap();
        fx.space.claim_page(shared, &fx.frames).unwrap();

        let (child, child_tr) = fx.child();
        duplicate(&child, &fx.space, &fx.frames).unwrap();

        // Pressure from a third page evicts the shared frame.
        let anon = Va::new(0x5000).unwrap();
        child.register_anonymous(anon, true).unwrap();
        child.claim_page(anon, &fx.frames).unwrap();

        assert!(fx.translation.lookup(shared).is_none());
        assert!(child_tr.lookup(shared).is_none());
        assert!(!fx.space.find(shared, |pd| pd.is_resident()).unwrap());
        assert!(!child.find(shared, |pd| pd.is_resident()).unwrap());
    }

    #[test]
    fn swapped_out_pages_are_copied_through_swap_in() {
        let fx = Fixture::new(2);
        let a = Va::new(0x1000).unwrap();
        let b = Va::new(0x2000).unwrap();
        let c = Va::new(0x3000).unwrap();
        for &va in &[a, b, c] {
            fx.space.register_anonymous(va, true).unwrap();
        }
        fx.space.claim_page(a, &fx.frames).unwrap();
        write_page(&fx, &fx.space, a, 0x42);
        fx.space.claim_page(b, &fx.frames).unwrap();
        // Claiming c evicts a into swap.
        fx.space.claim_page(c, &fx.frames).unwrap();
        assert!(!fx.space.find(a, |pd| pd.is_resident()).unwrap());

        let (child, _) = fx.child();
        duplicate(&child, &fx.space, &fx.frames).unwrap();

        child.claim_page(a, &fx.frames).unwrap();
        assert_eq!(read_page(&fx, &child, a), pattern(0x42));
    }

    #[test]
    fn duplication_failure_propagates() {
        // One frame total: the child's copy pins it, so swapping the
        // parent's page back in has no victim left.
        let fx = Fixture::new(1);
        let va = Va::new(0x1000).unwrap();
        fx.space.register_anonymous(va, true).unwrap();
        fx.space.claim_page(va, &fx.frames).unwrap();

        let (child, _) = fx.child();
        assert_eq!(
            duplicate(&child, &fx.space, &fx.frames),
            Err(VmError::ResourceExhaustion)
        );
        // The child's zeroed copy was claimed before the failure and the
        // parent's page went to swap to make room for it.
        assert_eq!(fx.pool.in_use(), 1);
        assert_eq!(fx.swap.slots_in_use(), 1);
        // The partial child can still be torn down.
        child.destroy_all(&fx.frames);
        assert_eq!(fx.pool.in_use(), 0);
    }
}
