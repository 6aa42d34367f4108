use core::ptr;

/// Map anonymous read-write memory.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// Map a large region with lazy backing. Only touched pages consume
/// physical memory, so multi-terabyte shadow tables are cheap.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn map_reserved(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// Reserve address space with PROT_NONE. Dereferencing any address in the
/// region faults.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn map_inaccessible(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
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

/// Mark memory as inaccessible.
///
/// # Safety
/// Region must be valid and page-aligned.
pub unsafe fn protect_none(ptr: *mut u8, size: usize) {
    libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_NONE);
}

/// Mark memory as read-write.
///
/// # Safety
/// Region must be valid and page-aligned.
pub unsafe fn protect_read_write(ptr: *mut u8, size: usize) {
    libc::mprotect(
        ptr as *mut libc::c_void,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
    );
}

/// Create the anonymous file backing remappable page frames.
pub fn frame_file_create() -> i32 {
    let name = b"memfence-frames\0";
    unsafe { libc::memfd_create(name.as_ptr() as *const libc::c_char, 0) }
}

/// Extend the frame file.
///
/// # Safety
/// `fd` must be a frame file descriptor.
pub unsafe fn frame_file_grow(fd: i32, len: usize) -> bool {
    libc::ftruncate(fd, len as libc::off_t) == 0
}

/// Map frames from the file. Shared, so a second mapping of the same
/// offset aliases the same physical memory and can be protected
/// independently.
///
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
