//! The page manager.
//!
//! Pool slabs draw fixed-size pages from here. With dangling-pointer
//! detection enabled, every page comes out of a growable anonymous file
//! mapped `MAP_SHARED`: mapping the same file offset a second time yields a
//! shadow alias of the same physical frames that can be protected
//! independently of the canonical mapping. Freed objects have their shadow
//! pages protected and the shadow address space is never reused, so stale
//! pointers keep faulting for the life of the process while the canonical
//! frames go back into circulation.
//!
//! Without dangling detection the manager degrades to plain anonymous
//! pages and `remap_object` is the identity.

use crate::platform;
use crate::report;
use crate::sync::RawMutex;
use crate::util::{align_up, page_base, pages_covering, PAGE_SIZE};
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Open-addressing map from canonical page address to frame-file offset.
/// Entries are never removed: a freed page keeps its offset for reuse.
struct OffsetTable {
    entries: *mut OffEntry,
    capacity: usize,
    count: usize,
    mapped_size: usize,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct OffEntry {
    /// Page address (0 = empty slot).
    key: usize,
    offset: usize,
}

/// splitmix64 finalizer for pointer keys.
#[inline]
fn hash_page(key: usize) -> usize {
    let mut x = key as u64;
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^= x >> 31;
    x as usize
}

impl OffsetTable {
    const INITIAL_CAPACITY: usize = 4096;

    const fn new() -> Self {
        OffsetTable {
            entries: ptr::null_mut(),
            capacity: 0,
            count: 0,
            mapped_size: 0,
        }
    }

    unsafe fn init(&mut self) {
        let size = align_up(
            Self::INITIAL_CAPACITY * core::mem::size_of::<OffEntry>(),
            PAGE_SIZE,
        );
        let mem = platform::map_anonymous(size);
        if mem.is_null() {
            report::abort_with_message("memfence: page offset table allocation failed\n");
        }
        self.entries = mem as *mut OffEntry;
        self.capacity = Self::INITIAL_CAPACITY;
        self.mapped_size = size;
    }

    unsafe fn insert(&mut self, key: usize, offset: usize) {
        debug_assert!(key != 0 && key & (PAGE_SIZE - 1) == 0);
        if self.count * 4 >= self.capacity * 3 {
            self.grow();
        }
        let mask = self.capacity - 1;
        let mut idx = hash_page(key) & mask;
        loop {
            let entry = &mut *self.entries.add(idx);
            if entry.key == 0 || entry.key == key {
                if entry.key == 0 {
                    self.count += 1;
                }
                entry.key = key;
                entry.offset = offset;
                return;
            }
            idx = (idx + 1) & mask;
        }
    }

    unsafe fn get(&self, key: usize) -> Option<usize> {
        if self.capacity == 0 {
            return None;
        }
        let mask = self.capacity - 1;
        let mut idx = hash_page(key) & mask;
        loop {
            let entry = &*self.entries.add(idx);
            if entry.key == key {
                return Some(entry.offset);
            }
            if entry.key == 0 {
                return None;
            }
            idx = (idx + 1) & mask;
        }
    }

    unsafe fn grow(&mut self) {
        let new_capacity = self.capacity * 2;
        let new_size = align_up(new_capacity * core::mem::size_of::<OffEntry>(), PAGE_SIZE);
        let new_mem = platform::map_anonymous(new_size);
        if new_mem.is_null() {
            report::abort_with_message("memfence: page offset table growth failed\n");
        }
        let new_entries = new_mem as *mut OffEntry;
        let old_entries = self.entries;
        let old_capacity = self.capacity;
        let old_size = self.mapped_size;

        self.entries = new_entries;
        self.capacity = new_capacity;
        self.mapped_size = new_size;
        self.count = 0;

        let mask = new_capacity - 1;
        for i in 0..old_capacity {
            let entry = &*old_entries.add(i);
            if entry.key != 0 {
                let mut idx = hash_page(entry.key) & mask;
                loop {
                    let slot = &mut *new_entries.add(idx);
                    if slot.key == 0 {
                        *slot = *entry;
                        self.count += 1;
                        break;
                    }
                    idx = (idx + 1) & mask;
                }
            }
        }

        platform::unmap(old_entries as *mut u8, old_size);
    }
}

struct PagingInner {
    /// Frame file descriptor; -1 when remapping is disabled.
    fd: i32,
    /// High-water mark of the frame file.
    file_len: usize,
    /// Intrusive free list of single canonical pages; the link lives in
    /// the first word of the (still mapped, read-write) page itself.
    free_head: *mut u8,
    table: OffsetTable,
    remap: bool,
}

struct Paging {
    lock: RawMutex,
    inner: UnsafeCell<PagingInner>,
}

unsafe impl Sync for Paging {}

static PAGING: Paging = Paging {
    lock: RawMutex::new(),
    inner: UnsafeCell::new(PagingInner {
        fd: -1,
        file_len: 0,
        free_head: ptr::null_mut(),
        table: OffsetTable::new(),
        remap: false,
    }),
};

static STATE: AtomicU8 = AtomicU8::new(0);
static MEM_USAGE: AtomicUsize = AtomicUsize::new(0);

/// Initialize the page manager. The remapping mode is fixed by the first
/// call; later calls are no-ops.
pub fn ensure_init(remap: bool) {
    if STATE.load(Ordering::Acquire) == 2 {
        return;
    }
    PAGING.lock.lock();
    if STATE.load(Ordering::Relaxed) != 2 {
        let inner = unsafe { &mut *PAGING.inner.get() };
        if remap {
            let fd = platform::frame_file_create();
            if fd < 0 {
                PAGING.lock.unlock();
                report::abort_with_message("memfence: frame file creation failed\n");
            }
            inner.fd = fd;
            unsafe { inner.table.init() };
        }
        inner.remap = remap;
        STATE.store(2, Ordering::Release);
    }
    PAGING.lock.unlock();
}

/// Whether shadow remapping is active.
pub fn remap_enabled() -> bool {
    STATE.load(Ordering::Acquire) == 2 && unsafe { (*PAGING.inner.get()).remap }
}

/// Total bytes of page-manager memory handed to pools.
pub fn mem_usage() -> usize {
    MEM_USAGE.load(Ordering::Relaxed)
}

unsafe fn map_new_pages(inner: &mut PagingInner, n: usize) -> *mut u8 {
    let bytes = n * PAGE_SIZE;
    if inner.remap {
        let offset = inner.file_len;
        if !platform::frame_file_grow(inner.fd, offset + bytes) {
            report::abort_with_message("memfence: frame file growth failed\n");
        }
        let mem = platform::map_frames(inner.fd, offset, bytes);
        if mem.is_null() {
            report::abort_with_message("memfence: canonical page mapping failed\n");
        }
        inner.file_len = offset + bytes;
        for i in 0..n {
            inner.table.insert(mem as usize + i * PAGE_SIZE, offset + i * PAGE_SIZE);
        }
        mem
    } else {
        let mem = platform::map_anonymous(bytes);
        if mem.is_null() {
            report::abort_with_message("memfence: page allocation failed\n");
        }
        mem
    }
}

/// Allocate one canonical page. Aborts on OOM; there is no graceful
/// recovery from a failed page allocation in this runtime.
pub fn alloc_page() -> *mut u8 {
    PAGING.lock.lock();
    let inner = unsafe { &mut *PAGING.inner.get() };
    let page = unsafe {
        if !inner.free_head.is_null() {
            let p = inner.free_head;
            inner.free_head = (p as *mut *mut u8).read();
            p.write_bytes(0, core::mem::size_of::<*mut u8>());
            p
        } else {
            map_new_pages(inner, 1)
        }
    };
    PAGING.lock.unlock();
    MEM_USAGE.fetch_add(PAGE_SIZE, Ordering::Relaxed);
    page
}

/// Allocate `n` contiguous canonical pages (large-array slabs). These are
/// always fresh mappings; freed runs are recycled page by page.
pub fn alloc_n_pages(n: usize) -> *mut u8 {
    debug_assert!(n >= 1);
    PAGING.lock.lock();
    let inner = unsafe { &mut *PAGING.inner.get() };
    let mem = unsafe { map_new_pages(inner, n) };
    PAGING.lock.unlock();
    MEM_USAGE.fetch_add(n * PAGE_SIZE, Ordering::Relaxed);
    mem
}

/// Return a canonical page for reuse. The mapping stays; only the frame is
/// recycled. Any protected shadow aliases keep faulting.
///
/// # Safety
/// `page` must have been returned by `alloc_page`/`alloc_n_pages` (any
/// single page of a multi-page run) and must not be used afterwards.
pub unsafe fn free_page(page: *mut u8) {
    debug_assert!(page as usize & (PAGE_SIZE - 1) == 0);
    PAGING.lock.lock();
    let inner = &mut *PAGING.inner.get();
    (page as *mut *mut u8).write(inner.free_head);
    inner.free_head = page;
    PAGING.lock.unlock();
    MEM_USAGE.fetch_sub(PAGE_SIZE, Ordering::Relaxed);
}

/// Produce a shadow alias of the object at canonical address `canon`
/// spanning `len` bytes. The shadow covers whole pages; the returned
/// address preserves the intra-page offset. Identity when remapping is
/// disabled.
///
/// # Safety
/// `canon` must lie within pages obtained from this manager.
pub unsafe fn remap_object(canon: usize, len: usize) -> usize {
    PAGING.lock.lock();
    let inner = &mut *PAGING.inner.get();
    if !inner.remap {
        PAGING.lock.unlock();
        return canon;
    }
    let page = page_base(canon);
    let in_page = canon - page;
    let npages = pages_covering(canon, len);
    let offset = match inner.table.get(page) {
        Some(off) => off,
        None => {
            PAGING.lock.unlock();
            report::abort_with_message("memfence: remap of an address not owned by the page manager\n");
        }
    };
    let shadow = platform::map_frames(inner.fd, offset, npages * PAGE_SIZE);
    PAGING.lock.unlock();
    if shadow.is_null() {
        report::abort_with_message("memfence: shadow mapping failed\n");
    }
    shadow as usize + in_page
}

/// Make every page overlapping `[addr, addr+len)` inaccessible.
///
/// # Safety
/// The range must be a live shadow mapping.
pub unsafe fn protect_range(addr: usize, len: usize) {
    let base = page_base(addr);
    let npages = pages_covering(addr, len);
    platform::protect_none(base as *mut u8, npages * PAGE_SIZE);
}

/// Restore access to every page overlapping `[addr, addr+len)`.
/// Takes no lock: the signal handler calls this to let the program
/// continue after a report in warn-and-continue mode.
///
/// # Safety
/// The range must be a shadow mapping previously protected.
pub unsafe fn unprotect_range(addr: usize, len: usize) {
    let base = page_base(addr);
    let npages = pages_covering(addr, len);
    platform::protect_read_write(base as *mut u8, npages * PAGE_SIZE);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_are_usable_and_recycled() {
        ensure_init(true);
        let a = alloc_page();
        unsafe {
            // Write through the whole page.
            a.write_bytes(0x5A, PAGE_SIZE);
            assert_eq!(a.add(PAGE_SIZE - 1).read(), 0x5A);
            free_page(a);
        }
        let b = alloc_page();
        assert_eq!(b as usize & (PAGE_SIZE - 1), 0);
        unsafe {
            b.write_bytes(0x11, PAGE_SIZE);
            assert_eq!(b.read(), 0x11);
            free_page(b);
        }
    }

    #[test]
    fn shadow_aliases_canonical_frames() {
        ensure_init(true);
        let canon = alloc_page() as usize;
        unsafe {
            let shadow = remap_object(canon + 32, 64);
            assert_ne!(page_base(shadow), page_base(canon));
            // A write through the canonical mapping is visible in the shadow.
            ((canon + 40) as *mut u8).write(0xEE);
            assert_eq!(((shadow + 8) as *const u8).read(), 0xEE);
            // And vice versa.
            (shadow as *mut u8).write(0x77);
            assert_eq!(((canon + 32) as *const u8).read(), 0x77);
            free_page(canon as *mut u8);
        }
    }

    #[test]
    fn multi_page_runs_are_contiguous() {
        ensure_init(true);
        let run = alloc_n_pages(3);
        unsafe {
            run.write_bytes(0xAB, 3 * PAGE_SIZE);
            let shadow = remap_object(run as usize + PAGE_SIZE - 8, 16);
            // The span straddles two pages; both must alias the run.
            assert_eq!((shadow as *const u8).read(), 0xAB);
            assert_eq!(((shadow + 15) as *const u8).read(), 0xAB);
            for i in 0..3 {
                free_page(run.add(i * PAGE_SIZE));
            }
        }
    }
}
