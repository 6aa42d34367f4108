//! The baggy-bounds engine.
//!
//! Objects are padded to a power of two and aligned to their padded size,
//! so recovering an object from any interior pointer takes two loads, an
//! AND, and a shift: the shadow table yields the size class `s`, masking
//! the low `s` bits of the pointer yields the base. Bounds are the padded
//! bounds; overflows within the padding are tolerated by construction.
//!
//! The requested length is kept in an 8-byte trailer at the top of the
//! padded block, which is why the class is chosen to fit `n + 8` bytes.

pub mod table;

use crate::config;
use crate::extobj;
use crate::oob;
use crate::report::{self, Violation, ViolationKind};
use crate::util::SLOT_BITS;
use core::ptr;

const TRAILER_BYTES: usize = 8;
const TRAILER_MAGIC: u32 = 0x4d465442; // "MFTB"

#[repr(C)]
#[derive(Clone, Copy)]
struct Trailer {
    requested: u32,
    magic: u32,
}

/// Smallest class `s >= SLOT_BITS` with `2^s >= len`.
fn class_for(len: usize) -> u8 {
    let len = len.max(1);
    let mut s = (usize::BITS - (len - 1).leading_zeros()) as u8;
    if (s as u32) < SLOT_BITS {
        s = SLOT_BITS as u8;
    }
    s
}

unsafe fn trailer_ptr(block: usize, s: u8) -> *mut Trailer {
    (block + (1usize << s) - TRAILER_BYTES) as *mut Trailer
}

/// Allocate `n` bytes in a `2^s`-aligned, `2^s`-byte block, stamp the
/// shadow slots, and record the requested length in the trailer.
///
/// # Safety
/// The shadow table must be initialized.
pub unsafe fn alloc(n: usize, _pc: usize) -> *mut u8 {
    let n = if n == 0 { 1 } else { n };
    let padded = match n.checked_add(TRAILER_BYTES) {
        Some(p) if p <= 1 << 47 => p,
        _ => return ptr::null_mut(),
    };
    let s = class_for(padded);
    let size = 1usize << s;

    let mut p: *mut libc::c_void = ptr::null_mut();
    if libc::posix_memalign(&mut p, size, size) != 0 {
        return ptr::null_mut();
    }
    let block = p as usize;
    table::stamp(block, s);
    trailer_ptr(block, s).write(Trailer {
        requested: n.min(u32::MAX as usize) as u32,
        magic: TRAILER_MAGIC,
    });
    block as *mut u8
}

/// Release a block allocated by `alloc`.
///
/// # Safety
/// The shadow table must be initialized.
pub unsafe fn free(p: usize, pc: usize) {
    if p == 0 {
        return;
    }
    let s = table::size_class_of(p);
    if s == 0 {
        let v = Violation::new(ViolationKind::InvalidFree, pc, p);
        report::emit(&v);
        return;
    }
    let block = p & !((1usize << s) - 1);
    if block != p {
        // Freeing an interior pointer.
        let mut v = Violation::new(ViolationKind::InvalidFree, pc, p);
        v.object = Some((block, 1usize << s));
        report::emit(&v);
        return;
    }
    table::clear(block, s);
    libc::free(block as *mut libc::c_void);
}

/// Stamp the shadow slots for memory that is already allocated and
/// already `2^s`-aligned (stack objects, globals, caller-aligned heap).
/// Misaligned registrations are a compiler bug and fail loudly.
///
/// # Safety
/// The shadow table must be initialized.
pub unsafe fn register(p: usize, n: usize, _pc: usize) {
    if p == 0 {
        return;
    }
    let s = class_for(n);
    let block = p & !((1usize << s) - 1);
    if block != p {
        report::abort_with_message(
            "memfence: baggy registration of a misaligned object (compiler must align)\n",
        );
    }
    table::stamp(block, s);
}

/// Clear the slots of a registered or allocated object.
///
/// # Safety
/// The shadow table must be initialized.
pub unsafe fn unregister(p: usize) {
    if p == 0 {
        return;
    }
    let s = table::size_class_of(p);
    if s == 0 {
        return;
    }
    let block = p & !((1usize << s) - 1);
    table::clear(block, s);
}

/// Standard realloc on top of alloc/free. The old requested length comes
/// from the trailer; shrinking keeps exactly the first `n` bytes.
///
/// # Safety
/// The shadow table must be initialized; `p` must be null or a live
/// allocation of this engine.
pub unsafe fn realloc(p: usize, n: usize, pc: usize) -> *mut u8 {
    if p == 0 {
        return alloc(n, pc);
    }
    if n == 0 {
        free(p, pc);
        return ptr::null_mut();
    }
    let fresh = alloc(n, pc);
    if fresh.is_null() {
        return ptr::null_mut();
    }
    let s = table::size_class_of(p);
    if s != 0 {
        let block = p & !((1usize << s) - 1);
        let trailer = trailer_ptr(block, s).read();
        let old_len = if trailer.magic == TRAILER_MAGIC {
            trailer.requested as usize
        } else {
            1usize << s
        };
        ptr::copy_nonoverlapping(p as *const u8, fresh, old_len.min(n));
        free(p, pc);
    }
    fresh
}

/// # Safety
/// As `alloc`.
pub unsafe fn calloc(number: usize, size: usize, pc: usize) -> *mut u8 {
    let total = match number.checked_mul(size) {
        Some(t) => t,
        None => return ptr::null_mut(),
    };
    let p = alloc(total, pc);
    if !p.is_null() {
        p.write_bytes(0, total.max(1));
    }
    p
}

/// # Safety
/// `s` must be a NUL-terminated string or null.
pub unsafe fn strdup(s: *const u8, pc: usize) -> *mut u8 {
    if s.is_null() {
        return ptr::null_mut();
    }
    let len = libc::strlen(s as *const libc::c_char) + 1;
    let p = alloc(len, pc);
    if !p.is_null() {
        ptr::copy_nonoverlapping(s, p, len);
    }
    p
}

/// Bounds check: `dst` must stay within the padded block of `src`.
/// One past the end mints a rewrite pointer; further out is a violation
/// (which, in permissive mode with rewriting on, also yields a rewrite
/// pointer so a later dereference still traps).
///
/// # Safety
/// The shadow table must be initialized.
pub unsafe fn bounds_check(src: usize, dst: usize, pc: usize) -> usize {
    let s = table::size_class_of(src);
    if s == 0 {
        // Not one of ours; fall back to the external-object table.
        if let Some((start, len)) = extobj::lookup(src) {
            if start <= dst && dst <= start + len {
                return dst;
            }
        }
        report::warn(b"boundscheck on unregistered source", src, pc);
        return dst;
    }

    let size = 1usize << s;
    let base = src & !(size - 1);
    if base <= dst && dst < base + size {
        return dst;
    }

    if dst == base + size && config::rewrite_oob() {
        return mint_rewrite(dst, base, size);
    }

    let mut v = Violation::new(ViolationKind::OutOfBounds, pc, dst);
    v.object = Some((base, size));
    v.intended = Some(dst);
    report::emit(&v);

    if config::rewrite_oob() {
        return mint_rewrite(dst, base, size);
    }
    dst
}

unsafe fn mint_rewrite(intended: usize, base: usize, size: usize) -> usize {
    match oob::mint() {
        Some(rewrite) => {
            let id = oob::record(intended, base, size);
            oob::global_insert(rewrite, id);
            rewrite
        }
        None => intended,
    }
}

/// Load/store check: the `len` bytes at `p` must lie within one object.
///
/// # Safety
/// The shadow table must be initialized.
pub unsafe fn load_check(p: usize, len: usize, pc: usize) {
    let s = table::size_class_of(p);
    if s == 0 {
        let v = Violation::new(ViolationKind::LoadStore, pc, p);
        report::emit(&v);
        return;
    }
    let size = 1usize << s;
    let base = p & !(size - 1);
    let last = p + len.max(1) - 1;
    if last & !(size - 1) != base {
        let mut v = Violation::new(ViolationKind::OutOfBounds, pc, last);
        v.object = Some((base, size));
        report::emit(&v);
    }
}

/// Reverse an out-of-bounds rewrite. Identity outside the rewrite region.
///
/// # Safety
/// The shadow table must be initialized.
pub unsafe fn get_actual_value(p: usize) -> usize {
    if !oob::contains(p) {
        return p;
    }
    match oob::global_lookup(p) {
        Some(rec) => rec.intended,
        None => report::abort_with_message(
            "memfence: rewritten pointer has no recorded origin\n",
        ),
    }
}

/// Copy and register the argv array and every argv string, returning the
/// new (aligned, shadow-stamped) argv.
///
/// # Safety
/// `argv` must be a valid argv array of `argc` strings.
pub unsafe fn argv_register(argc: i32, argv: *mut *mut u8, pc: usize) -> *mut *mut u8 {
    if argv.is_null() || argc < 0 {
        return argv;
    }
    let n = argc as usize;
    let arr = alloc((n + 1) * core::mem::size_of::<*mut u8>(), pc) as *mut *mut u8;
    if arr.is_null() {
        return argv;
    }
    for i in 0..n {
        let src = argv.add(i).read();
        let len = libc::strlen(src as *const libc::c_char) + 1;
        let copy = alloc(len, pc);
        ptr::copy_nonoverlapping(src as *const u8, copy, len);
        arr.add(i).write(copy);
    }
    arr.add(n).write(ptr::null_mut());
    arr
}
