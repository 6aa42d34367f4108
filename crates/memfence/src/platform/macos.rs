use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

/// Map anonymous read-write memory.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANON,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// macOS overcommits anonymous mappings by default; no MAP_NORESERVE needed.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn map_reserved(size: usize) -> *mut u8 {
    map_anonymous(size)
}

/// Reserve address space with PROT_NONE.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn map_inaccessible(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANON,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// Unmap memory.
///
/// # Safety
/// `ptr` must have been returned by a map function with the same `size`.
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    libc::munmap(ptr as *mut libc::c_void, size);
}

/// # Safety
/// Region must be valid and page-aligned.
pub unsafe fn protect_none(ptr: *mut u8, size: usize) {
    libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_NONE);
}

/// # Safety
/// Region must be valid and page-aligned.
pub unsafe fn protect_read_write(ptr: *mut u8, size: usize) {
    libc::mprotect(
        ptr as *mut libc::c_void,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
    );
}

/// No memfd on macOS; use an unlinked POSIX shared memory object instead.
pub fn frame_file_create() -> i32 {
    static SEQ: AtomicU32 = AtomicU32::new(0);

    let mut name = *b"/memfence.000000.000000\0";
    let pid = unsafe { libc::getpid() } as u32;
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    write_u32_hex(&mut name[10..16], pid);
    write_u32_hex(&mut name[17..23], seq);

    unsafe {
        let fd = libc::shm_open(
            name.as_ptr() as *const libc::c_char,
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            0o600,
        );
        if fd >= 0 {
            libc::shm_unlink(name.as_ptr() as *const libc::c_char);
        }
        fd
    }
}

fn write_u32_hex(out: &mut [u8], mut v: u32) {
    for slot in out.iter_mut().rev() {
        let digit = (v & 0xF) as u8;
        *slot = if digit < 10 {
            b'0' + digit
        } else {
            b'a' + digit - 10
        };
        v >>= 4;
    }
}

/// # Safety
/// `fd` must be a frame file descriptor.
pub unsafe fn frame_file_grow(fd: i32, len: usize) -> bool {
    libc::ftruncate(fd, len as libc::off_t) == 0
}

/// # Safety
/// `offset + size` must be within the file, both page-aligned.
pub unsafe fn map_frames(fd: i32, offset: usize, size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED,
        fd,
        offset as libc::off_t,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// Write to stderr fd 2. Async-signal-safe; never allocates.
pub fn write_stderr(bytes: &[u8]) {
    unsafe {
        libc::write(2, bytes.as_ptr() as *const libc::c_void, bytes.len());
    }
}
