//! The pool/splay engine.
//!
//! A pool is a set of same-size objects served from one-page bitmap slabs
//! (large requests get dedicated multi-page single-array slabs). Every live
//! object is indexed in the pool's splay tree under the address the program
//! holds; with dangling-pointer detection on, that address is a shadow
//! mapping of the canonical frames, protected when the object is freed.

pub mod slab;

use crate::config;
use crate::debugmeta;
use crate::extobj;
use crate::oob;
use crate::paging;
use crate::report::{self, Violation, ViolationKind};
use crate::splay::{Find, SplayTree};
use crate::sync::RawMutex;
use crate::util::page_base;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};
use slab::Slab;

const POOL_MAGIC: u32 = 0x4d_46_50_4c; // "MFPL"

/// Inline capacity of the owned-slab address set before spilling to a
/// hash table.
const ADDR_ARR_SIZE: usize = 16;

/// Set of page addresses owned by a pool's slabs. Small pools stay in the
/// inline array; busy pools spill into an open-addressing table.
#[repr(C)]
struct SlabAddrSet {
    inline: [usize; ADDR_ARR_SIZE],
    count: usize,
    spill: *mut usize,
    spill_cap: usize,
}

impl SlabAddrSet {
    const fn new() -> Self {
        SlabAddrSet {
            inline: [0; ADDR_ARR_SIZE],
            count: 0,
            spill: ptr::null_mut(),
            spill_cap: 0,
        }
    }

    unsafe fn insert(&mut self, page: usize) {
        debug_assert!(page != 0);
        if self.spill.is_null() {
            if self.count < ADDR_ARR_SIZE {
                self.inline[self.count] = page;
                self.count += 1;
                return;
            }
            self.spill_to_table();
        }
        self.table_insert(page);
    }

    unsafe fn spill_to_table(&mut self) {
        let cap = 1024usize;
        let bytes = crate::util::align_up(cap * 8, crate::util::PAGE_SIZE);
        let mem = crate::platform::map_anonymous(bytes);
        if mem.is_null() {
            report::abort_with_message("memfence: slab address set allocation failed\n");
        }
        self.spill = mem as *mut usize;
        self.spill_cap = cap;
        let inline = self.inline;
        let count = self.count;
        self.count = 0;
        for &page in inline.iter().take(count) {
            self.table_insert(page);
        }
    }

    unsafe fn table_insert(&mut self, page: usize) {
        if self.count * 4 >= self.spill_cap * 3 {
            self.grow();
        }
        let mask = self.spill_cap - 1;
        let mut idx = hash_addr(page) & mask;
        loop {
            let slot = self.spill.add(idx);
            if slot.read() == 0 {
                slot.write(page);
                self.count += 1;
                return;
            }
            if slot.read() == page {
                return;
            }
            idx = (idx + 1) & mask;
        }
    }

    unsafe fn grow(&mut self) {
        let old = self.spill;
        let old_cap = self.spill_cap;
        let new_cap = old_cap * 2;
        let bytes = crate::util::align_up(new_cap * 8, crate::util::PAGE_SIZE);
        let mem = crate::platform::map_anonymous(bytes);
        if mem.is_null() {
            report::abort_with_message("memfence: slab address set growth failed\n");
        }
        self.spill = mem as *mut usize;
        self.spill_cap = new_cap;
        self.count = 0;
        for i in 0..old_cap {
            let page = old.add(i).read();
            if page != 0 {
                self.table_insert(page);
            }
        }
        crate::platform::unmap(
            old as *mut u8,
            crate::util::align_up(old_cap * 8, crate::util::PAGE_SIZE),
        );
    }

    unsafe fn contains(&self, page: usize) -> bool {
        if self.spill.is_null() {
            return self.inline.iter().take(self.count).any(|&p| p == page);
        }
        let mask = self.spill_cap - 1;
        let mut idx = hash_addr(page) & mask;
        loop {
            let v = self.spill.add(idx).read();
            if v == page {
                return true;
            }
            if v == 0 {
                return false;
            }
            idx = (idx + 1) & mask;
        }
    }

    unsafe fn release(&mut self) {
        if !self.spill.is_null() {
            crate::platform::unmap(
                self.spill as *mut u8,
                crate::util::align_up(self.spill_cap * 8, crate::util::PAGE_SIZE),
            );
        }
        *self = SlabAddrSet::new();
    }
}

#[inline]
fn hash_addr(key: usize) -> usize {
    let mut x = key as u64;
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^= x >> 31;
    x as usize
}

struct PoolInner {
    node_size: usize,
    /// Slabs with at least one free node.
    partial: *mut Slab,
    /// Completely allocated slabs.
    full: *mut Slab,
    /// Single-array slabs.
    large_arrays: *mut Slab,
    /// Live objects, keyed by the address the program holds.
    objects: SplayTree,
    /// Rewrite pointers minted for this pool's objects.
    oob: SplayTree,
    addr_set: SlabAddrSet,
    num_slabs: usize,
    /// Set when the compiler registers stack objects here.
    stack_pool: bool,
}

/// A pool descriptor. The instrumented program provides the storage (as a
/// global or stack variable the compiler emitted); `init` builds the
/// descriptor in place.
#[repr(C)]
pub struct Pool {
    lock: RawMutex,
    magic: AtomicU32,
    inner: UnsafeCell<PoolInner>,
}

unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    /// Initialize a pool descriptor in place. Idempotent: re-initializing
    /// a live pool is a no-op.
    ///
    /// # Safety
    /// `pool` must point to storage of at least `size_of::<Pool>()` bytes
    /// that is either zeroed or a previously initialized descriptor.
    pub unsafe fn init(pool: *mut Pool, node_size: usize) {
        if pool.is_null() {
            return;
        }
        if (*pool).magic.load(Ordering::Acquire) == POOL_MAGIC {
            return;
        }
        paging::ensure_init(config::remap_objects());
        crate::splay::ensure_arena();
        pool.write(Pool {
            lock: RawMutex::new(),
            magic: AtomicU32::new(POOL_MAGIC),
            inner: UnsafeCell::new(PoolInner {
                // Unique pointers even for zero-byte requests.
                node_size: if node_size == 0 { 1 } else { node_size },
                partial: ptr::null_mut(),
                full: ptr::null_mut(),
                large_arrays: ptr::null_mut(),
                objects: SplayTree::new(),
                oob: SplayTree::new(),
                addr_set: SlabAddrSet::new(),
                num_slabs: 0,
                stack_pool: false,
            }),
        });
    }

    #[inline]
    fn live(&self) -> bool {
        self.magic.load(Ordering::Acquire) == POOL_MAGIC
    }

    /// Tear down the pool: all indices and slabs are released. No
    /// operation is permitted afterwards (they become no-ops).
    ///
    /// # Safety
    /// No other thread may be using the pool.
    pub unsafe fn destroy(&self) {
        if !self.live() {
            return;
        }
        self.lock.lock();
        let inner = &mut *self.inner.get();
        inner.objects.clear();
        inner.oob.clear();
        for list in [inner.partial, inner.full, inner.large_arrays] {
            let mut s = list;
            while !s.is_null() {
                let next = (*s).next_slab();
                Slab::destroy(s);
                s = next;
            }
        }
        inner.partial = ptr::null_mut();
        inner.full = ptr::null_mut();
        inner.large_arrays = ptr::null_mut();
        inner.addr_set.release();
        inner.num_slabs = 0;
        self.magic.store(0, Ordering::Release);
        self.lock.unlock();
    }

    pub fn node_size(&self) -> usize {
        unsafe { (*self.inner.get()).node_size }
    }

    /// Whether the compiler has registered stack objects in this pool.
    /// A stricter mode restricting such pools to one live allocation may
    /// key off this.
    pub fn is_stack_pool(&self) -> bool {
        unsafe { (*self.inner.get()).stack_pool }
    }

    /// Allocate `n` bytes (at least one node). Returns the address the
    /// program should use: the shadow address under dangling-pointer
    /// detection, the canonical one otherwise.
    ///
    /// # Safety
    /// The pool must be initialized.
    pub unsafe fn alloc(&self, n: usize, pc: usize) -> *mut u8 {
        if !self.live() {
            report::abort_with_message("memfence: poolalloc on an uninitialized pool\n");
        }
        self.lock.lock();
        let inner = &mut *self.inner.get();

        let n = if n == 0 { 1 } else { n };
        let node_size = inner.node_size;
        let nodes = n.div_ceil(node_size);
        let canon = Self::alloc_nodes(inner, nodes);

        let user = if paging::remap_enabled() {
            paging::remap_object(canon, n)
        } else {
            canon
        };
        let meta_id = debugmeta::record_alloc(pc, canon, n);
        if paging::remap_enabled() {
            debugmeta::dangling_insert(user, n, meta_id);
        }
        inner.objects.insert(user, n, meta_id);
        self.lock.unlock();

        if config::log_registrations() {
            report::warn(b"poolalloc registered", user, pc);
        }
        user as *mut u8
    }

    unsafe fn alloc_nodes(inner: &mut PoolInner, nodes: usize) -> usize {
        let node_size = inner.node_size;
        let capacity = slab::slab_capacity(node_size);

        if capacity == 0 || nodes > capacity {
            let s = Slab::create_single_array(node_size, nodes, &mut inner.large_arrays);
            Self::note_slab_pages(inner, s);
            return (*s).element_addr(0, node_size) as usize;
        }

        // Scan the partially-used slabs for an opening.
        let mut ps = inner.partial;
        while !ps.is_null() {
            let got = if nodes == 1 {
                (*ps).allocate_single()
            } else {
                (*ps).allocate_multiple(nodes)
            };
            if let Some(idx) = got {
                if (*ps).is_full() {
                    (*ps).unlink_from_list();
                    (*ps).add_to_list(&mut inner.full);
                }
                return (*ps).element_addr(idx, node_size) as usize;
            }
            ps = (*ps).next_slab();
        }

        // No opening anywhere: new slab.
        let s = Slab::create(node_size, &mut inner.partial);
        Self::note_slab_pages(inner, s);
        let idx = match if nodes == 1 {
            (*s).allocate_single()
        } else {
            (*s).allocate_multiple(nodes)
        } {
            Some(idx) => idx,
            None => report::abort_with_message("memfence: fresh slab refused an allocation\n"),
        };
        if (*s).is_full() {
            (*s).unlink_from_list();
            (*s).add_to_list(&mut inner.full);
        }
        (*s).element_addr(idx, node_size) as usize
    }

    unsafe fn note_slab_pages(inner: &mut PoolInner, s: *mut Slab) {
        let base = s as usize;
        let pages = (*s).page_count();
        for i in 0..pages {
            inner.addr_set.insert(base + i * crate::util::PAGE_SIZE);
        }
        inner.num_slabs += 1;
    }

    /// Free the object containing `p`.
    ///
    /// # Safety
    /// The pool must be initialized; `p` should be an address this pool
    /// returned (anything else produces a violation report).
    pub unsafe fn free(&self, p: usize, pc: usize) {
        if !self.live() || p == 0 {
            return;
        }
        self.lock.lock();
        let inner = &mut *self.inner.get();

        let (start, len, meta_id) = match inner.objects.find(p) {
            Find::Hit { start, len, tag } => (start, len, tag),
            Find::Miss { .. } => {
                self.lock.unlock();
                self.report_bad_free(p, pc);
                return;
            }
        };

        debugmeta::mark_freed(meta_id, pc);

        // Records registered with `register` carry no metadata and own no
        // slab storage; freeing one just drops the registration.
        if meta_id != 0 {
            if paging::remap_enabled() {
                // Trap every later access through this (shadow) range.
                paging::protect_range(start, len);
            }
            inner.objects.remove(start);
            let canon = match debugmeta::snapshot(meta_id) {
                Some(meta) if meta.canon != 0 => meta.canon,
                _ => start,
            };
            Self::release_nodes(inner, canon);
        } else {
            inner.objects.remove(start);
        }
        self.lock.unlock();

        if config::log_registrations() {
            report::warn(b"poolfree released", start, pc);
        }
    }

    unsafe fn release_nodes(inner: &mut PoolInner, canon: usize) {
        let node_size = inner.node_size;

        // The slab lists are short: the brute-force search only runs on
        // the free path, and the object just freed is usually in the
        // first slab or two.
        for list in [inner.partial, inner.full, inner.large_arrays] {
            let mut s = list;
            while !s.is_null() {
                let next = (*s).next_slab();
                if (*s).contains_addr(canon) {
                    if (*s).is_single_array() {
                        (*s).unlink_from_list();
                        Slab::destroy(s);
                        inner.num_slabs -= 1;
                        return;
                    }
                    let idx = match (*s).contains_element(canon, node_size) {
                        Some(idx) => idx,
                        None => report::abort_with_message(
                            "memfence: freed object does not map to a slab node\n",
                        ),
                    };
                    let was_full = (*s).is_full();
                    (*s).free_element(idx);
                    if was_full {
                        (*s).unlink_from_list();
                        (*s).add_to_list(&mut inner.partial);
                    } else if (*s).is_empty() && inner.partial != s {
                        // Keep empty slabs at the head so allocations find
                        // them first.
                        (*s).unlink_from_list();
                        (*s).add_to_list(&mut inner.partial);
                    }
                    return;
                }
                s = next;
            }
        }
        report::abort_with_message("memfence: freed object not found in any slab\n");
    }

    unsafe fn report_bad_free(&self, p: usize, pc: usize) {
        // Distinguish a stale free of once-owned memory from a free of a
        // pointer this pool never produced.
        let mut v;
        if let Some((start, len, meta_id)) = debugmeta::dangling_lookup(p) {
            v = Violation::new(ViolationKind::DoubleFree, pc, p);
            v.object = Some((start, len));
            v.meta = debugmeta::snapshot(meta_id);
        } else {
            let inner = &*self.inner.get();
            let owned = inner.addr_set.contains(page_base(p));
            v = Violation::new(
                if owned {
                    ViolationKind::DoubleFree
                } else {
                    ViolationKind::InvalidFree
                },
                pc,
                p,
            );
        }
        report::emit(&v);
    }

    /// Standard realloc semantics on top of alloc + free. Shrinking keeps
    /// exactly the first `n` bytes.
    ///
    /// # Safety
    /// As `alloc`/`free`.
    pub unsafe fn realloc(&self, p: usize, n: usize, pc: usize) -> *mut u8 {
        if p == 0 {
            return self.alloc(n, pc);
        }
        if n == 0 {
            self.free(p, pc);
            return ptr::null_mut();
        }

        let old_len = {
            self.lock.lock();
            let inner = &mut *self.inner.get();
            let found = inner.objects.find(p);
            self.lock.unlock();
            match found {
                Find::Hit { len, .. } => Some(len),
                Find::Miss { .. } => None,
            }
        };

        let fresh = self.alloc(n, pc);
        match old_len {
            Some(old) => {
                ptr::copy_nonoverlapping(p as *const u8, fresh, old.min(n));
                self.free(p, pc);
            }
            None => {
                // Reports the bad pointer; the new allocation is returned
                // uninitialized.
                self.free(p, pc);
            }
        }
        fresh
    }

    /// # Safety
    /// As `alloc`.
    pub unsafe fn calloc(&self, number: usize, size: usize, pc: usize) -> *mut u8 {
        let total = match number.checked_mul(size) {
            Some(t) => t,
            None => return ptr::null_mut(),
        };
        let p = self.alloc(total, pc);
        p.write_bytes(0, total.max(1));
        p
    }

    /// # Safety
    /// `s` must be a NUL-terminated string or null.
    pub unsafe fn strdup(&self, s: *const u8, pc: usize) -> *mut u8 {
        if s.is_null() {
            return ptr::null_mut();
        }
        let len = libc::strlen(s as *const libc::c_char) + 1;
        let p = self.alloc(len, pc);
        ptr::copy_nonoverlapping(s, p, len);
        p
    }

    /// Register externally-allocated memory (stack objects, globals,
    /// custom allocations) with this pool.
    ///
    /// # Safety
    /// The pool must be initialized.
    pub unsafe fn register(&self, p: usize, n: usize, pc: usize) {
        if !self.live() || p == 0 {
            return;
        }
        self.lock.lock();
        let inner = &mut *self.inner.get();
        inner.objects.insert(p, if n == 0 { 1 } else { n }, 0);
        self.lock.unlock();
        if config::log_registrations() {
            report::warn(b"poolregister", p, pc);
        }
    }

    /// Register a stack object. Re-registering a still-live interval is
    /// the signature of a stack allocation inside a loop, which this
    /// runtime does not support; it fails loudly rather than corrupting
    /// the index.
    ///
    /// # Safety
    /// As `register`.
    pub unsafe fn register_stack(&self, p: usize, n: usize, pc: usize) {
        if !self.live() || p == 0 {
            return;
        }
        self.lock.lock();
        let inner = &mut *self.inner.get();
        if let Find::Hit { start, .. } = inner.objects.find(p) {
            if start == p {
                self.lock.unlock();
                report::abort_with_message(
                    "memfence: unsupported construct: stack object registered twice \
                     (alloca inside a loop?)\n",
                );
            }
        }
        inner.stack_pool = true;
        inner.objects.insert(p, if n == 0 { 1 } else { n }, 0);
        self.lock.unlock();
        if config::log_registrations() {
            report::warn(b"poolregister_stack", p, pc);
        }
    }

    /// Remove a registration.
    ///
    /// # Safety
    /// The pool must be initialized.
    pub unsafe fn unregister(&self, p: usize) {
        if !self.live() || p == 0 {
            return;
        }
        self.lock.lock();
        let inner = &mut *self.inner.get();
        inner.objects.remove(p);
        self.lock.unlock();
    }

    /// Assert that `p` points into some live object of this pool.
    /// The unchecked variant also accepts external objects and only warns
    /// on a miss.
    ///
    /// # Safety
    /// The pool must be initialized.
    pub unsafe fn check(&self, p: usize, pc: usize, unchecked: bool) {
        if !self.live() {
            return;
        }
        self.lock.lock();
        let inner = &mut *self.inner.get();
        let node_size = inner.node_size;
        let found = inner.objects.find(p);
        self.lock.unlock();

        let nearest = match found {
            Find::Hit { .. } => return,
            Find::Miss { nearest } => nearest,
        };

        if unchecked {
            if extobj::lookup(p).is_some() {
                return;
            }
            report::warn(b"poolcheckui miss", p, pc);
            return;
        }

        let mut v = Violation::new(Self::classify_miss(node_size, p, nearest), pc, p);
        v.object = nearest;
        report::emit(&v);
    }

    /// A pointer just past a known object is an out-of-bounds access on
    /// that object; with no object anywhere near, it is a plain bad
    /// load/store.
    fn classify_miss(
        node_size: usize,
        p: usize,
        nearest: Option<(usize, usize)>,
    ) -> ViolationKind {
        match nearest {
            Some((start, len)) if p >= start && p < start + len + node_size => {
                ViolationKind::OutOfBounds
            }
            _ => ViolationKind::LoadStore,
        }
    }

    /// Assert that `p` is in a live object and that its offset within the
    /// object, modulo the node size, falls in `[lo, hi]`.
    ///
    /// # Safety
    /// The pool must be initialized.
    pub unsafe fn check_align(&self, p: usize, lo: usize, hi: usize, pc: usize) {
        if !self.live() {
            return;
        }
        let node_size = self.node_size();
        if lo > hi || hi >= node_size {
            report::abort_with_message("memfence: poolcheckalign offsets exceed the node size\n");
        }
        self.lock.lock();
        let inner = &mut *self.inner.get();
        let found = inner.objects.find(p);
        self.lock.unlock();

        let (ok, object) = match found {
            Find::Hit { start, len, .. } => {
                let off = (p - start) % node_size;
                (off >= lo && off <= hi, Some((start, len)))
            }
            Find::Miss { .. } => (false, None),
        };
        if !ok {
            let mut v = Violation::new(ViolationKind::Align, pc, p);
            v.object = object;
            report::emit(&v);
        }
    }

    /// Given an in-bounds `src`, decide whether the computed `dst` stays
    /// in the same object. One past the end yields a rewrite pointer
    /// silently; anything further is reported and, in permissive mode
    /// with rewriting enabled, still yields a rewrite pointer so a later
    /// dereference traps. `get_actual_value` inverts either rewrite.
    ///
    /// # Safety
    /// The pool must be initialized.
    pub unsafe fn bounds_check(
        &self,
        src: usize,
        dst: usize,
        pc: usize,
        unchecked: bool,
    ) -> usize {
        if !self.live() {
            return dst;
        }
        self.lock.lock();
        let inner = &mut *self.inner.get();
        let found = inner.objects.find(src);

        if let Find::Hit { start, len, .. } = found {
            if start <= dst && dst < start + len {
                self.lock.unlock();
                return dst;
            }
            // One past the end is the accepted C idiom: rewrite without
            // a report.
            if dst == start + len && config::rewrite_oob() {
                if let Some((rewrite, id)) = Self::mint_pool_rewrite(inner, dst, start, len) {
                    self.lock.unlock();
                    oob::global_insert(rewrite, id);
                    if config::log_registrations() {
                        report::warn(b"boundscheck rewrite", rewrite, pc);
                    }
                    return rewrite;
                }
            }
            self.lock.unlock();

            let mut v = Violation::new(ViolationKind::OutOfBounds, pc, dst);
            v.object = Some((start, len));
            v.intended = Some(dst);
            report::emit(&v);

            // Still here means permissive mode: hand back a rewrite
            // pointer anyway, like the baggy engine, falling back to the
            // raw destination only when the region is exhausted.
            if config::rewrite_oob() {
                self.lock.lock();
                let inner = &mut *self.inner.get();
                let minted = Self::mint_pool_rewrite(inner, dst, start, len);
                self.lock.unlock();
                if let Some((rewrite, id)) = minted {
                    oob::global_insert(rewrite, id);
                    return rewrite;
                }
            }
            return dst;
        }
        self.lock.unlock();

        if unchecked {
            // Incomplete analysis: the source may be an external object.
            if let Some((start, len)) = extobj::lookup(src) {
                if start <= dst && dst <= start + len {
                    return dst;
                }
            }
            report::warn(b"boundscheckui miss", src, pc);
            return dst;
        }

        let mut v = Violation::new(ViolationKind::OutOfBounds, pc, dst);
        v.intended = Some(dst);
        report::emit(&v);
        dst
    }

    /// Mint a rewrite pointer for `intended`, record the object it ran
    /// off of, and index it in this pool's rewrite tree. None when the
    /// rewrite region is exhausted. Caller must hold the pool lock and
    /// publish the returned id in the global index after unlocking.
    unsafe fn mint_pool_rewrite(
        inner: &mut PoolInner,
        intended: usize,
        start: usize,
        len: usize,
    ) -> Option<(usize, u64)> {
        let rewrite = oob::mint()?;
        let id = oob::record(intended, start, len);
        inner.oob.insert(rewrite, 1, id);
        Some((rewrite, id))
    }

    /// Reverse an out-of-bounds rewrite: return the address the program
    /// originally computed. Identity for pointers outside the rewrite
    /// region.
    ///
    /// # Safety
    /// The pool must be initialized.
    pub unsafe fn get_actual_value(&self, p: usize) -> usize {
        if !oob::contains(p) {
            return p;
        }
        if self.live() {
            self.lock.lock();
            let inner = &mut *self.inner.get();
            let found = inner.oob.find(p);
            self.lock.unlock();
            if let Find::Hit { tag, .. } = found {
                if let Some(rec) = oob::record_get(tag) {
                    return rec.intended;
                }
            }
        }
        // The rewrite may have been minted through another pool.
        if let Some(rec) = oob::global_lookup(p) {
            return rec.intended;
        }
        report::abort_with_message("memfence: rewritten pointer has no recorded origin\n");
    }
}
