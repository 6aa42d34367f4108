//! The out-of-bounds rewrite region.
//!
//! A 1 GiB stretch of address space is reserved with no access rights at
//! startup. When a bounds check sees the pointer move to (or past) the end
//! of its object, it hands back a fresh address from this region instead of
//! the real out-of-bounds address: comparisons and further arithmetic keep
//! working, but any dereference faults and the handler can name the object
//! the pointer came from. A pointer is recognized as rewritten by a range
//! compare against the region bounds.

use crate::platform;
use crate::report;
use crate::splay::SplayTree;
use crate::sync::HandlerShared;
use crate::util::{align_up, OOB_REGION_BYTES, PAGE_SIZE};
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

static INVALID_LOWER: AtomicUsize = AtomicUsize::new(0);
static INVALID_UPPER: AtomicUsize = AtomicUsize::new(0);
static CURSOR: AtomicUsize = AtomicUsize::new(0);
static STATE: AtomicU8 = AtomicU8::new(0);

/// Reserve the rewrite region. Idempotent.
pub fn ensure_init() {
    if STATE.swap(1, Ordering::AcqRel) != 0 {
        // Another caller won the race; wait for the bounds to appear.
        while INVALID_LOWER.load(Ordering::Acquire) == 0 {
            core::hint::spin_loop();
        }
        return;
    }
    let mem = unsafe { platform::map_inaccessible(OOB_REGION_BYTES) };
    if mem.is_null() {
        report::abort_with_message("memfence: rewrite region reservation failed\n");
    }
    let lower = mem as usize;
    CURSOR.store(lower, Ordering::Relaxed);
    INVALID_UPPER.store(lower + OOB_REGION_BYTES, Ordering::Release);
    INVALID_LOWER.store(lower, Ordering::Release);
}

/// Region bounds, `(lower, upper)`. Zero until init.
pub fn bounds() -> (usize, usize) {
    (
        INVALID_LOWER.load(Ordering::Acquire),
        INVALID_UPPER.load(Ordering::Acquire),
    )
}

/// Is `p` a rewrite pointer?
#[inline]
pub fn contains(p: usize) -> bool {
    let lower = INVALID_LOWER.load(Ordering::Acquire);
    lower != 0 && p >= lower && p < INVALID_UPPER.load(Ordering::Acquire)
}

/// Hand out the next unique invalid address, or None when the region is
/// exhausted (the caller then falls back per the strictness mode).
pub fn mint() -> Option<usize> {
    let upper = INVALID_UPPER.load(Ordering::Acquire);
    if upper == 0 {
        return None;
    }
    let p = CURSOR.fetch_add(1, Ordering::Relaxed) + 1;
    if p >= upper {
        // Saturate so repeated failures do not wrap the cursor around.
        CURSOR.store(upper, Ordering::Relaxed);
        return None;
    }
    Some(p)
}

// ---------------------------------------------------------------------------
// Rewrite records
// ---------------------------------------------------------------------------

/// What a rewrite pointer stands for: the address the program computed and
/// the extent of the object it ran off of.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RewriteRecord {
    pub intended: usize,
    pub obj_start: usize,
    pub obj_len: usize,
}

const RECORD_CAPACITY: usize = 1 << 22;

static RECORD_BASE: AtomicUsize = AtomicUsize::new(0);
static RECORD_BUMP: AtomicUsize = AtomicUsize::new(0);

fn record_arena() -> *mut RewriteRecord {
    let base = RECORD_BASE.load(Ordering::Acquire);
    if base != 0 {
        return base as *mut RewriteRecord;
    }
    let bytes = align_up(RECORD_CAPACITY * core::mem::size_of::<RewriteRecord>(), PAGE_SIZE);
    let mem = unsafe { platform::map_reserved(bytes) };
    if mem.is_null() {
        report::abort_with_message("memfence: rewrite record arena reservation failed\n");
    }
    match RECORD_BASE.compare_exchange(0, mem as usize, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => mem as *mut RewriteRecord,
        Err(existing) => {
            unsafe { platform::unmap(mem, bytes) };
            existing as *mut RewriteRecord
        }
    }
}

/// Store a rewrite record; the returned id is the splay tag for both the
/// per-pool rewrite tree and the global one.
pub fn record(intended: usize, obj_start: usize, obj_len: usize) -> u64 {
    let base = record_arena();
    let idx = RECORD_BUMP.fetch_add(1, Ordering::Relaxed);
    if idx >= RECORD_CAPACITY {
        report::abort_with_message("memfence: out of rewrite records\n");
    }
    unsafe {
        base.add(idx).write(RewriteRecord {
            intended,
            obj_start,
            obj_len,
        });
    }
    (idx as u64) + 1
}

/// Read a record back. Records are immutable once written.
pub fn record_get(id: u64) -> Option<RewriteRecord> {
    if id == 0 || (id - 1) as usize >= RECORD_BUMP.load(Ordering::Acquire) {
        return None;
    }
    let base = RECORD_BASE.load(Ordering::Acquire);
    if base == 0 {
        return None;
    }
    unsafe { Some(*(base as *const RewriteRecord).add((id - 1) as usize)) }
}

// ---------------------------------------------------------------------------
// Global rewrite index
// ---------------------------------------------------------------------------

/// Every minted rewrite pointer is also indexed globally so the fault
/// handler (which has no pool in hand) can resolve it.
static REWRITES: HandlerShared<SplayTree> = HandlerShared::new(SplayTree::new());

pub fn global_insert(rewrite_ptr: usize, id: u64) {
    REWRITES.write(|tree| unsafe { tree.insert(rewrite_ptr, 1, id) });
}

/// Locked lookup for the normal paths (baggy get_actual_value).
pub fn global_lookup(rewrite_ptr: usize) -> Option<RewriteRecord> {
    REWRITES
        .read(|tree| unsafe { tree.find_read_only(rewrite_ptr) })
        .and_then(|(_, _, id)| record_get(id))
}

/// Lock-free lookup for the signal handler, sequence-validated.
pub fn global_lookup_handler(rewrite_ptr: usize) -> Option<RewriteRecord> {
    REWRITES
        .read_handler(|tree| unsafe { tree.find_read_only(rewrite_ptr) })
        .flatten()
        .and_then(|(_, _, id)| record_get(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_pointers_are_unique_and_in_range() {
        ensure_init();
        let (lower, upper) = bounds();
        assert!(lower != 0 && upper == lower + OOB_REGION_BYTES);

        let a = mint().unwrap();
        let b = mint().unwrap();
        assert_ne!(a, b);
        assert!(contains(a) && contains(b));
        assert!(!contains(lower.wrapping_sub(1)));
        assert!(!contains(upper));
    }

    #[test]
    fn records_round_trip() {
        let id = record(0x4000_0010, 0x4000_0000, 16);
        let rec = record_get(id).unwrap();
        assert_eq!(rec.intended, 0x4000_0010);
        assert_eq!(rec.obj_start, 0x4000_0000);
        assert_eq!(rec.obj_len, 16);
        assert!(record_get(0).is_none());
    }

    #[test]
    fn global_index_resolves_handler_side() {
        ensure_init();
        let p = mint().unwrap();
        let id = record(0x1234, 0x1000, 64);
        global_insert(p, id);
        assert_eq!(global_lookup(p).unwrap().intended, 0x1234);
        assert_eq!(global_lookup_handler(p).unwrap().obj_len, 64);
        assert!(global_lookup(p + 1).is_none());
    }
}
