//! In-memory fakes for the bridge traits, shared by the unit tests.
//!
//! `TestPool` carves frames out of a leaked heap buffer so `map_frame`
//! hands out real pointers; `TestTranslation` is a hash map with a manual
//! dirty set; `TestSwap` stores page images in boxed arrays and can be
//! told to fail writes; `TestFile` is a growable byte vector. `Fixture`
//! wires one of each to a `FrameTable` and an `AddressSpace`.

use crate::VmError;
use crate::addressing::{PAGE_SIZE, Pa, Va};
use crate::bridge::{
    BackingFile, FileHandle, PhysicalPool, SwapDevice, SwapSlot, TranslationMap,
};
use crate::frame::FrameTable;
use crate::spt::{AddressSpace, StackLayout};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;
use std::collections::{HashMap, HashSet};

pub(crate) const STACK_TOP: usize = 0x7000_0000;

pub(crate) struct TestPool {
    base: *mut u8,
    frames: usize,
    free: Mutex<Vec<usize>>,
}

// The raw base pointer is only ever used to address disjoint frames.
unsafe impl Send for TestPool {}
unsafe impl Sync for TestPool {}

impl TestPool {
    pub(crate) fn new(frames: usize) -> Self {
        let buf = vec![0u8; frames.max(1) * PAGE_SIZE].into_boxed_slice();
        Self {
            base: Box::leak(buf).as_mut_ptr(),
            frames,
            free: Mutex::new((0..frames).rev().collect()),
        }
    }

    pub(crate) fn in_use(&self) -> usize {
        self.frames - self.free.lock().len()
    }

    // Pa zero is suspicious in real kernels, so frame i lives at (i+1) << 12.
    fn index(&self, pa: Pa) -> usize {
        pa.into_usize() / PAGE_SIZE - 1
    }
}

impl PhysicalPool for TestPool {
    fn allocate(&self) -> Option<Pa> {
        let idx = self.free.lock().pop()?;
        Pa::new((idx + 1) * PAGE_SIZE)
    }

    fn release(&self, pa: Pa) {
        self.free.lock().push(self.index(pa));
    }

    fn map_frame(&self, pa: Pa) -> *mut u8 {
        unsafe { self.base.add(self.index(pa) * PAGE_SIZE) }
    }
}

pub(crate) struct TestTranslation {
    map: Mutex<HashMap<Va, (Pa, bool)>>,
    dirty: Mutex<HashSet<Va>>,
    capacity: usize,
}

impl TestTranslation {
    pub(crate) fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    /// A bounded translation table; installs beyond `capacity` fail, which
    /// tests use to simulate page-table allocation failure.
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            capacity,
        }
    }

    pub(crate) fn set_dirty(&self, va: Va) {
        self.dirty.lock().insert(va.page_down());
    }
}

impl TranslationMap for TestTranslation {
    fn install(&self, va: Va, pa: Pa, writable: bool) -> bool {
        let mut map = self.map.lock();
        if map.len() >= self.capacity {
            return false;
        }
        map.insert(va.page_down(), (pa, writable));
        true
    }

    fn clear(&self, va: Va) {
        self.map.lock().remove(&va.page_down());
        self.dirty.lock().remove(&va.page_down());
    }

    fn lookup(&self, va: Va) -> Option<Pa> {
        self.map.lock().get(&va.page_down()).map(|&(pa, _)| pa)
    }

    fn is_dirty(&self, va: Va) -> bool {
        self.dirty.lock().contains(&va.page_down())
    }
}

enum Slot {
    Free,
    Reserved,
    Full(Box<[u8; PAGE_SIZE]>),
}

pub(crate) struct TestSwap {
    slots: Mutex<Vec<Slot>>,
    fail_writes: AtomicBool,
}

impl TestSwap {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub(crate) fn slots_in_use(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|s| !matches!(s, Slot::Free))
            .count()
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }
}

impl SwapDevice for TestSwap {
    fn alloc_slot(&self) -> Result<SwapSlot, VmError> {
        let mut slots = self.slots.lock();
        if let Some(i) = slots.iter().position(|s| matches!(s, Slot::Free)) {
            slots[i] = Slot::Reserved;
            Ok(SwapSlot(i))
        } else {
            slots.push(Slot::Reserved);
            Ok(SwapSlot(slots.len() - 1))
        }
    }

    fn free_slot(&self, slot: SwapSlot) {
        self.slots.lock()[slot.0] = Slot::Free;
    }

    fn write(&self, slot: SwapSlot, src: &[u8; PAGE_SIZE]) -> Result<(), VmError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(VmError::BackingIo);
        }
        self.slots.lock()[slot.0] = Slot::Full(Box::new(*src));
        Ok(())
    }

    fn read(&self, slot: SwapSlot, dst: &mut [u8; PAGE_SIZE]) -> Result<(), VmError> {
        match &self.slots.lock()[slot.0] {
            Slot::Full(data) => {
                dst.copy_from_slice(&data[..]);
                Ok(())
            }
            _ => Err(VmError::BackingIo),
        }
    }
}

pub(crate) struct TestFile {
    data: Mutex<Vec<u8>>,
}

impl TestFile {
    pub(crate) fn with_contents(bytes: &[u8]) -> Self {
        Self {
            data: Mutex::new(bytes.to_vec()),
        }
    }

    pub(crate) fn set_contents(&self, bytes: &[u8]) {
        *self.data.lock() = bytes.to_vec();
    }

    pub(crate) fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl BackingFile for TestFile {
    fn read(&self, position: usize, buf: &mut [u8]) -> Result<usize, VmError> {
        let data = self.data.lock();
        if position >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - position);
        buf[..n].copy_from_slice(&data[position..position + n]);
        Ok(n)
    }

    fn write(&self, position: usize, buf: &[u8]) -> Result<usize, VmError> {
        let mut data = self.data.lock();
        if position + buf.len() > data.len() {
            data.resize(position + buf.len(), 0);
        }
        data[position..position + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }
}

pub(crate) struct Fixture {
    pub(crate) pool: Arc<TestPool>,
    pub(crate) swap: Arc<TestSwap>,
    pub(crate) translation: Arc<TestTranslation>,
    pub(crate) backing: Arc<TestFile>,
    pub(crate) frames: FrameTable,
    pub(crate) space: Arc<AddressSpace>,
}

impl Fixture {
    pub(crate) fn new(frames: usize) -> Self {
        Self::with_translation_capacity(frames, usize::MAX)
    }

    pub(crate) fn with_translation_capacity(frames: usize, capacity: usize) -> Self {
        let pool = Arc::new(TestPool::new(frames));
        let swap = Arc::new(TestSwap::new());
        let translation = Arc::new(TestTranslation::with_capacity(capacity));
        let backing = Arc::new(TestFile::with_contents(&[]));
        let table = FrameTable::new(pool.clone(), swap.clone());
        let space = AddressSpace::new(translation.clone(), Self::stack());
        Self {
            pool,
            swap,
            translation,
            backing,
            frames: table,
            space,
        }
    }

    fn stack() -> StackLayout {
        StackLayout {
            top: Va::new(STACK_TOP).unwrap(),
            max_size: 1 << 20,
        }
    }

    /// Points the fixture's backing file at `bytes` and returns a handle.
    pub(crate) fn file_with(&self, bytes: &[u8]) -> FileHandle {
        self.backing.set_contents(bytes);
        FileHandle(self.backing.clone())
    }

    /// A second, empty address space sharing the fixture's frame table.
    pub(crate) fn child(&self) -> (Arc<AddressSpace>, Arc<TestTranslation>) {
        let translation = Arc::new(TestTranslation::new());
        (
            AddressSpace::new(translation.clone(), Self::stack()),
            translation,
        )
    }
}
