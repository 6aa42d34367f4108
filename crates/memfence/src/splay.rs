//! Interval splay trees over an mmap-backed node arena.
//!
//! Every index in the runtime (per-pool live objects, per-pool rewrite
//! records, the external-object table, the dangling-object table) is one of
//! these trees. Keys are half-open intervals `[start, start+len)` with an
//! opaque u64 tag. The splay discipline keeps recently touched objects at
//! the root, which is exactly the common case: a pointer that was just
//! allocated, checked, or freed.
//!
//! Nodes come from a single process-wide arena reserved up front, so node
//! addresses are stable for the whole process lifetime. Mutating operations
//! require external locking (each tree owner holds its own mutex); the
//! read-only lookup never rotates and is safe to run from the signal
//! handler under the owner's sequence-validation protocol.

use crate::platform;
use crate::report;
use crate::sync::RawMutex;
use crate::util::align_up;
use core::ptr;
use core::sync::atomic::{AtomicU8, Ordering};

#[repr(C)]
pub struct Node {
    start: usize,
    len: usize,
    tag: u64,
    left: *mut Node,
    right: *mut Node,
}

impl Node {
    #[inline]
    fn contains(&self, key: usize) -> bool {
        self.start <= key && key < self.start + self.len
    }
}

/// Maximum live nodes across all trees. The reservation is virtual
/// (lazily backed), so the cost of a generous cap is address space only.
const ARENA_CAPACITY: usize = 1 << 23;

struct ArenaInner {
    base: *mut Node,
    bump: usize,
    free_head: *mut Node,
}

struct Arena {
    lock: RawMutex,
    inner: core::cell::UnsafeCell<ArenaInner>,
}

unsafe impl Sync for Arena {}

static ARENA: Arena = Arena {
    lock: RawMutex::new(),
    inner: core::cell::UnsafeCell::new(ArenaInner {
        base: ptr::null_mut(),
        bump: 0,
        free_head: ptr::null_mut(),
    }),
};

static ARENA_STATE: AtomicU8 = AtomicU8::new(0);

/// Reserve the node arena. Idempotent; called from runtime init and lazily
/// from the first tree mutation (unit tests skip explicit init).
pub fn ensure_arena() {
    if ARENA_STATE.load(Ordering::Acquire) == 2 {
        return;
    }
    ARENA.lock.lock();
    if ARENA_STATE.load(Ordering::Relaxed) != 2 {
        let bytes = align_up(ARENA_CAPACITY * core::mem::size_of::<Node>(), crate::util::PAGE_SIZE);
        let mem = unsafe { platform::map_reserved(bytes) };
        if mem.is_null() {
            ARENA.lock.unlock();
            report::abort_with_message("memfence: object index arena reservation failed\n");
        }
        unsafe {
            (*ARENA.inner.get()).base = mem as *mut Node;
        }
        ARENA_STATE.store(2, Ordering::Release);
    }
    ARENA.lock.unlock();
}

unsafe fn node_alloc(start: usize, len: usize, tag: u64) -> *mut Node {
    ensure_arena();
    ARENA.lock.lock();
    let inner = &mut *ARENA.inner.get();
    let node = if !inner.free_head.is_null() {
        let n = inner.free_head;
        inner.free_head = (*n).left;
        n
    } else {
        if inner.bump >= ARENA_CAPACITY {
            ARENA.lock.unlock();
            report::abort_with_message("memfence: out of object index nodes\n");
        }
        let n = inner.base.add(inner.bump);
        inner.bump += 1;
        n
    };
    ARENA.lock.unlock();

    node.write(Node {
        start,
        len,
        tag,
        left: ptr::null_mut(),
        right: ptr::null_mut(),
    });
    node
}

unsafe fn node_free(node: *mut Node) {
    ARENA.lock.lock();
    let inner = &mut *ARENA.inner.get();
    (*node).left = inner.free_head;
    (*node).right = ptr::null_mut();
    (*node).len = 0;
    inner.free_head = node;
    ARENA.lock.unlock();
}

/// Top-down splay: bring the node whose interval contains `key` (or the
/// last node on the search path) to the root.
unsafe fn splay(mut t: *mut Node, key: usize) -> *mut Node {
    if t.is_null() {
        return t;
    }
    let mut header = Node {
        start: 0,
        len: 0,
        tag: 0,
        left: ptr::null_mut(),
        right: ptr::null_mut(),
    };
    let hp: *mut Node = &mut header;
    let mut l = hp;
    let mut r = hp;

    loop {
        if key < (*t).start {
            if (*t).left.is_null() {
                break;
            }
            if key < (*(*t).left).start {
                // Rotate right
                let y = (*t).left;
                (*t).left = (*y).right;
                (*y).right = t;
                t = y;
                if (*t).left.is_null() {
                    break;
                }
            }
            // Link right
            (*r).left = t;
            r = t;
            t = (*t).left;
        } else if key >= (*t).start + (*t).len {
            if (*t).right.is_null() {
                break;
            }
            {
                let rc = (*t).right;
                if key >= (*rc).start + (*rc).len {
                    // Rotate left
                    (*t).right = (*rc).left;
                    (*rc).left = t;
                    t = rc;
                    if (*t).right.is_null() {
                        break;
                    }
                }
            }
            // Link left
            (*l).right = t;
            l = t;
            t = (*t).right;
        } else {
            break;
        }
    }

    // Reassemble
    (*l).right = (*t).left;
    (*r).left = (*t).right;
    (*t).left = header.right;
    (*t).right = header.left;
    t
}

/// Result of a splaying lookup. On a miss, the nearest interval on the
/// search path (now at the root) is reported so callers can attach an
/// object extent to out-of-bounds diagnostics.
pub enum Find {
    Hit { start: usize, len: usize, tag: u64 },
    Miss { nearest: Option<(usize, usize)> },
}

/// An interval splay tree. `#[repr(C)]` because it is embedded in the pool
/// descriptor whose storage the instrumented program provides.
#[repr(C)]
pub struct SplayTree {
    root: *mut Node,
}

impl SplayTree {
    pub const fn new() -> Self {
        SplayTree {
            root: ptr::null_mut(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_null()
    }

    /// Insert `[start, start+len) -> tag`. Re-inserting an existing start
    /// updates the record in place. Intervals must not overlap; overlap
    /// checking is the caller's contract.
    ///
    /// # Safety
    /// Caller must hold the tree owner's lock.
    pub unsafe fn insert(&mut self, start: usize, len: usize, tag: u64) {
        debug_assert!(len >= 1);
        if self.root.is_null() {
            self.root = node_alloc(start, len, tag);
            return;
        }
        self.root = splay(self.root, start);
        let t = self.root;
        if (*t).contains(start) && (*t).start == start {
            (*t).len = len;
            (*t).tag = tag;
            return;
        }
        let node = node_alloc(start, len, tag);
        if start < (*t).start {
            (*node).left = (*t).left;
            (*node).right = t;
            (*t).left = ptr::null_mut();
        } else {
            (*node).right = (*t).right;
            (*node).left = t;
            (*t).right = ptr::null_mut();
        }
        self.root = node;
    }

    /// Remove the interval containing `key`. Returns false if no interval
    /// contains it.
    ///
    /// # Safety
    /// Caller must hold the tree owner's lock.
    pub unsafe fn remove(&mut self, key: usize) -> bool {
        if self.root.is_null() {
            return false;
        }
        self.root = splay(self.root, key);
        let t = self.root;
        if !(*t).contains(key) {
            return false;
        }
        self.root = if (*t).left.is_null() {
            (*t).right
        } else {
            let x = splay((*t).left, key);
            (*x).right = (*t).right;
            x
        };
        node_free(t);
        true
    }

    /// Locate the interval containing `*key`; on success overwrite `*key`
    /// with the interval start and write the length and tag out.
    ///
    /// # Safety
    /// Caller must hold the tree owner's lock.
    pub unsafe fn retrieve(&mut self, key: &mut usize, len: &mut usize, tag: &mut u64) -> bool {
        match self.find(*key) {
            Find::Hit { start, len: l, tag: t } => {
                *key = start;
                *len = l;
                *tag = t;
                true
            }
            Find::Miss { .. } => false,
        }
    }

    /// Splaying lookup with nearest-interval information on a miss.
    ///
    /// # Safety
    /// Caller must hold the tree owner's lock.
    pub unsafe fn find(&mut self, key: usize) -> Find {
        if self.root.is_null() {
            return Find::Miss { nearest: None };
        }
        self.root = splay(self.root, key);
        let t = self.root;
        if (*t).contains(key) {
            Find::Hit {
                start: (*t).start,
                len: (*t).len,
                tag: (*t).tag,
            }
        } else {
            Find::Miss {
                nearest: Some(((*t).start, (*t).len)),
            }
        }
    }

    /// Plain descent without rotation. The only lookup the signal handler
    /// may use: it never writes to the tree.
    ///
    /// # Safety
    /// Caller is responsible for consistency (sequence validation); node
    /// memory itself is stable for the process lifetime.
    pub unsafe fn find_read_only(&self, key: usize) -> Option<(usize, usize, u64)> {
        let mut t = self.root;
        let mut depth = 0usize;
        while !t.is_null() {
            // A torn read during a racing rotation cannot produce a valid
            // cycle-free path longer than the arena; bail out well before.
            depth += 1;
            if depth > 1 << 20 {
                return None;
            }
            if key < (*t).start {
                t = (*t).left;
            } else if key >= (*t).start + (*t).len {
                t = (*t).right;
            } else {
                return Some(((*t).start, (*t).len, (*t).tag));
            }
        }
        None
    }

    /// Free every node back to the arena.
    ///
    /// # Safety
    /// Caller must hold the tree owner's lock.
    pub unsafe fn clear(&mut self) {
        let mut t = self.root;
        while !t.is_null() {
            if (*t).left.is_null() {
                let next = (*t).right;
                node_free(t);
                t = next;
            } else {
                // Rotate the left child up, shrinking the left spine.
                let y = (*t).left;
                (*t).left = (*y).right;
                (*y).right = t;
                t = y;
            }
        }
        self.root = ptr::null_mut();
    }
}

impl Default for SplayTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_retrieve_remove() {
        let mut t = SplayTree::new();
        unsafe {
            t.insert(0x1000, 64, 7);
            t.insert(0x2000, 16, 8);
            t.insert(0x3000, 1, 9);

            let mut key = 0x1020;
            let mut len = 0;
            let mut tag = 0;
            assert!(t.retrieve(&mut key, &mut len, &mut tag));
            assert_eq!((key, len, tag), (0x1000, 64, 7));

            // One past the end is not contained.
            let mut key = 0x1040;
            assert!(!t.retrieve(&mut key, &mut len, &mut tag));

            // Last byte is contained.
            let mut key = 0x103f;
            assert!(t.retrieve(&mut key, &mut len, &mut tag));
            assert_eq!(key, 0x1000);

            assert!(t.remove(0x2000 + 5));
            let mut key = 0x2000;
            assert!(!t.retrieve(&mut key, &mut len, &mut tag));

            // Other intervals survive the removal.
            let mut key = 0x3000;
            assert!(t.retrieve(&mut key, &mut len, &mut tag));
            assert_eq!((key, len, tag), (0x3000, 1, 9));

            t.clear();
            assert!(t.is_empty());
        }
    }

    #[test]
    fn remove_missing_is_false() {
        let mut t = SplayTree::new();
        unsafe {
            assert!(!t.remove(0x1234));
            t.insert(0x1000, 8, 1);
            assert!(!t.remove(0x999));
            assert!(!t.remove(0x1008));
            assert!(t.remove(0x1000));
            assert!(t.is_empty());
        }
    }

    #[test]
    fn miss_reports_nearest_interval() {
        let mut t = SplayTree::new();
        unsafe {
            t.insert(0x5000, 16, 1);
            match t.find(0x5010) {
                Find::Miss { nearest } => assert_eq!(nearest, Some((0x5000, 16))),
                Find::Hit { .. } => panic!("0x5010 is one past the end"),
            }
        }
    }

    #[test]
    fn read_only_lookup_matches() {
        let mut t = SplayTree::new();
        unsafe {
            for i in 0..64usize {
                t.insert(0x10000 + i * 0x100, 0x80, i as u64);
            }
            for i in 0..64usize {
                let got = t.find_read_only(0x10000 + i * 0x100 + 0x7f);
                assert_eq!(got, Some((0x10000 + i * 0x100, 0x80, i as u64)));
                assert_eq!(t.find_read_only(0x10000 + i * 0x100 + 0x80), None);
            }
            t.clear();
        }
    }

    #[test]
    fn update_in_place_on_same_start() {
        let mut t = SplayTree::new();
        unsafe {
            t.insert(0x7000, 32, 1);
            t.insert(0x7000, 48, 2);
            let mut key = 0x7020;
            let mut len = 0;
            let mut tag = 0;
            assert!(t.retrieve(&mut key, &mut len, &mut tag));
            assert_eq!((key, len, tag), (0x7000, 48, 2));
            t.clear();
        }
    }

    #[test]
    fn many_nodes_reuse_freed_slots() {
        let mut t = SplayTree::new();
        unsafe {
            for round in 0..4 {
                for i in 0..1024usize {
                    t.insert(0x100000 * (round + 1) + i * 64, 64, i as u64);
                }
                for i in 0..1024usize {
                    assert!(t.remove(0x100000 * (round + 1) + i * 64));
                }
                assert!(t.is_empty());
            }
        }
    }
}
