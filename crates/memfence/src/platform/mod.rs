#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub use linux as sys;

#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "macos")]
pub use macos as sys;

/// Map anonymous read-write memory. Returns null on failure.
///
/// # Safety
/// Caller must ensure `size` is page-aligned and non-zero.
#[inline]
pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    sys::map_anonymous(size)
}

/// Map a large anonymous region with lazy physical backing
/// (`MAP_NORESERVE`). Returns null on failure.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
#[inline]
pub unsafe fn map_reserved(size: usize) -> *mut u8 {
    sys::map_reserved(size)
}

/// Reserve address space with no access rights at all. Used for the
/// out-of-bounds rewrite region: any dereference must fault.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
#[inline]
pub unsafe fn map_inaccessible(size: usize) -> *mut u8 {
    sys::map_inaccessible(size)
}

/// Unmap previously mapped memory.
///
/// # Safety
/// `ptr` must have been returned by one of the map functions and `size`
/// must match.
#[inline]
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    sys::unmap(ptr, size);
}

/// Mark a region inaccessible. Accesses through it raise SIGSEGV/SIGBUS.
///
/// # Safety
/// `ptr` and `size` must refer to a valid mapped region and be page-aligned.
#[inline]
pub unsafe fn protect_none(ptr: *mut u8, size: usize) {
    sys::protect_none(ptr, size);
}

/// Mark a region readable and writable again.
///
/// This is called from the signal handler and must stay a bare syscall
/// wrapper: no locks, no allocation.
///
/// # Safety
/// `ptr` and `size` must refer to a valid mapped region and be page-aligned.
#[inline]
pub unsafe fn protect_read_write(ptr: *mut u8, size: usize) {
    sys::protect_read_write(ptr, size);
}

/// Create a shareable page-frame file for remappable allocations.
/// Returns -1 on failure.
#[inline]
pub fn frame_file_create() -> i32 {
    sys::frame_file_create()
}

/// Grow the frame file to `len` bytes. Returns false on failure.
///
/// # Safety
/// `fd` must be a frame file descriptor.
#[inline]
pub unsafe fn frame_file_grow(fd: i32, len: usize) -> bool {
    sys::frame_file_grow(fd, len)
}

/// Map `size` bytes of the frame file at `offset`, read-write, shared.
/// Every mapping of the same offset aliases the same physical frames.
///
/// # Safety
/// `fd` must be a frame file descriptor, `offset + size` within its length,
/// both page-aligned.
#[inline]
pub unsafe fn map_frames(fd: i32, offset: usize, size: usize) -> *mut u8 {
    sys::map_frames(fd, offset, size)
}

/// Write raw bytes to stderr. Async-signal-safe.
#[inline]
pub fn write_stderr(bytes: &[u8]) {
    sys::write_stderr(bytes);
}
