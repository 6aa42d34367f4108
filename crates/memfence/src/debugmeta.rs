//! Per-allocation debug records and the dangling-object index.
//!
//! Every pool allocation gets a record stamped with monotonically
//! increasing allocation/free generation numbers and the program counters
//! that performed them. Records live in a process-lifetime arena and are
//! never reclaimed: the fault handler must still be able to describe an
//! object long after it was freed.

use crate::platform;
use crate::report;
use crate::splay::SplayTree;
use crate::sync::HandlerShared;
use crate::util::align_up;
use core::ptr;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Allocation history of one object. Immutable after free.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DebugMetaData {
    pub alloc_id: u64,
    /// 0 while the object is live.
    pub free_id: u64,
    pub alloc_pc: usize,
    /// 0 while the object is live.
    pub free_pc: usize,
    /// Canonical (pre-remap) base address of the object's storage.
    pub canon: usize,
    /// Object length in bytes.
    pub len: usize,
}

static GLOBAL_ALLOC_ID: AtomicU64 = AtomicU64::new(0);
static GLOBAL_FREE_ID: AtomicU64 = AtomicU64::new(0);

/// Record capacity. Reserved virtually; only touched pages are backed.
const META_CAPACITY: usize = 1 << 22;

static META_BASE: AtomicUsize = AtomicUsize::new(0);
static META_BUMP: AtomicUsize = AtomicUsize::new(0);

fn ensure_arena() -> *mut DebugMetaData {
    let base = META_BASE.load(Ordering::Acquire);
    if base != 0 {
        return base as *mut DebugMetaData;
    }
    let bytes = align_up(
        META_CAPACITY * core::mem::size_of::<DebugMetaData>(),
        crate::util::PAGE_SIZE,
    );
    let mem = unsafe { platform::map_reserved(bytes) };
    if mem.is_null() {
        report::abort_with_message("memfence: debug metadata arena reservation failed\n");
    }
    match META_BASE.compare_exchange(0, mem as usize, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => mem as *mut DebugMetaData,
        Err(existing) => {
            unsafe { platform::unmap(mem, bytes) };
            existing as *mut DebugMetaData
        }
    }
}

/// Handle into the metadata arena. 0 is reserved for "no record".
pub type MetaId = u64;

/// Stamp a new record with the next allocation generation number.
pub fn record_alloc(alloc_pc: usize, canon: usize, len: usize) -> MetaId {
    let base = ensure_arena();
    let idx = META_BUMP.fetch_add(1, Ordering::Relaxed);
    if idx >= META_CAPACITY {
        report::abort_with_message("memfence: out of debug metadata records\n");
    }
    let alloc_id = GLOBAL_ALLOC_ID.fetch_add(1, Ordering::Relaxed) + 1;
    unsafe {
        base.add(idx).write(DebugMetaData {
            alloc_id,
            free_id: 0,
            alloc_pc,
            free_pc: 0,
            canon,
            len,
        });
    }
    (idx as u64) + 1
}

/// Stamp the free side of a record with the next free generation number.
pub fn mark_freed(id: MetaId, free_pc: usize) {
    if id == 0 {
        return;
    }
    let base = ensure_arena();
    let free_id = GLOBAL_FREE_ID.fetch_add(1, Ordering::Relaxed) + 1;
    unsafe {
        let rec = base.add((id - 1) as usize);
        (*rec).free_id = free_id;
        (*rec).free_pc = free_pc;
    }
}

/// Copy a record out. Record memory is stable and freed records are
/// immutable, so this is safe to call from the signal handler.
pub fn snapshot(id: MetaId) -> Option<DebugMetaData> {
    if id == 0 || (id - 1) as usize >= META_BUMP.load(Ordering::Acquire) {
        return None;
    }
    let base = META_BASE.load(Ordering::Acquire);
    if base == 0 {
        return None;
    }
    unsafe { Some(ptr::read((base as *const DebugMetaData).add((id - 1) as usize))) }
}

// ---------------------------------------------------------------------------
// Dangling-object index
// ---------------------------------------------------------------------------

/// Global index from shadow address ranges to metadata records. Entries
/// are inserted at allocation and retained forever; the fault handler
/// resolves faulting addresses here to produce dangling-pointer reports.
static DANGLING: HandlerShared<SplayTree> = HandlerShared::new(SplayTree::new());

/// Record a live object's shadow range.
pub fn dangling_insert(shadow: usize, len: usize, id: MetaId) {
    DANGLING.write(|tree| unsafe { tree.insert(shadow, len, id) });
}

/// Resolve an address against the index, taking the lock. Used on the
/// normal (non-handler) paths, e.g. free-error classification.
pub fn dangling_lookup(addr: usize) -> Option<(usize, usize, MetaId)> {
    DANGLING.read(|tree| unsafe { tree.find_read_only(addr) })
}

/// Resolve an address without blocking: the signal-handler path.
pub fn dangling_lookup_handler(addr: usize) -> Option<(usize, usize, MetaId)> {
    DANGLING
        .read_handler(|tree| unsafe { tree.find_read_only(addr) })
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_numbers_increase() {
        let a = record_alloc(0x1111, 0x8000, 32);
        let b = record_alloc(0x2222, 0x9000, 32);
        let ra = snapshot(a).unwrap();
        let rb = snapshot(b).unwrap();
        assert!(rb.alloc_id > ra.alloc_id);
        assert_eq!(ra.free_id, 0);

        mark_freed(a, 0x3333);
        let ra = snapshot(a).unwrap();
        assert!(ra.free_id > 0);
        assert_eq!(ra.free_pc, 0x3333);
        // The other record is untouched.
        assert_eq!(snapshot(b).unwrap().free_id, 0);
    }

    #[test]
    fn snapshot_of_unknown_id_is_none() {
        assert!(snapshot(0).is_none());
        assert!(snapshot(u64::MAX).is_none());
    }

    #[test]
    fn dangling_index_resolves_interior_pointers() {
        let id = record_alloc(0xabcd, 0xdead0000, 64);
        dangling_insert(0x7f00_0000_0000, 64, id);
        let (start, len, got) = dangling_lookup(0x7f00_0000_0020).unwrap();
        assert_eq!((start, len, got), (0x7f00_0000_0000, 64, id));
        assert_eq!(
            dangling_lookup_handler(0x7f00_0000_003f).map(|r| r.2),
            Some(id)
        );
        assert!(dangling_lookup(0x7f00_0000_0040).is_none());
    }
}
