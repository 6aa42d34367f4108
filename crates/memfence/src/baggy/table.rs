//! The flat shadow size table.
//!
//! One byte per 16-byte slot of the user address space, holding the size
//! class `s` of the object covering that slot (0 = no object). The whole
//! table is one lazily-backed mapping reserved at init; lookup is a single
//! load. Slots are single bytes, so stores need no locking.

use crate::platform;
use crate::report;
use crate::util::{SHADOW_TABLE_BYTES, SLOT_BITS};
use core::sync::atomic::{AtomicUsize, Ordering};

static BASE: AtomicUsize = AtomicUsize::new(0);

/// Reserve the table. Idempotent.
pub fn ensure_init() {
    if BASE.load(Ordering::Acquire) != 0 {
        return;
    }
    let mem = unsafe { platform::map_reserved(SHADOW_TABLE_BYTES) };
    if mem.is_null() {
        report::abort_with_message("memfence: shadow size table reservation failed\n");
    }
    if BASE
        .compare_exchange(0, mem as usize, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        unsafe { platform::unmap(mem, SHADOW_TABLE_BYTES) };
    }
}

#[inline]
fn base() -> usize {
    BASE.load(Ordering::Acquire)
}

#[inline]
fn slot_index(addr: usize) -> Option<usize> {
    let idx = addr >> SLOT_BITS;
    if idx < SHADOW_TABLE_BYTES {
        Some(idx)
    } else {
        None
    }
}

/// Size class of the object covering `addr`, or 0 if none.
#[inline]
pub fn size_class_of(addr: usize) -> u8 {
    let base = base();
    if base == 0 {
        return 0;
    }
    match slot_index(addr) {
        Some(idx) => unsafe { ((base + idx) as *const u8).read() },
        None => 0,
    }
}

/// Stamp the slots covering the `2^s`-aligned block at `block` with `s`.
///
/// # Safety
/// `block` must be `2^s`-aligned and the table must be initialized.
pub unsafe fn stamp(block: usize, s: u8) {
    debug_assert!(s as u32 >= SLOT_BITS);
    debug_assert!(block & ((1usize << s) - 1) == 0);
    let base = base();
    if base == 0 {
        return;
    }
    let Some(idx) = slot_index(block) else { return };
    let slots = 1usize << (s as u32 - SLOT_BITS);
    ((base + idx) as *mut u8).write_bytes(s, slots);
}

/// Clear the slots covering the `2^s`-aligned block at `block`.
///
/// # Safety
/// As `stamp`.
pub unsafe fn clear(block: usize, s: u8) {
    debug_assert!(s as u32 >= SLOT_BITS);
    let base = base();
    if base == 0 {
        return;
    }
    let Some(idx) = slot_index(block) else { return };
    let slots = 1usize << (s as u32 - SLOT_BITS);
    ((base + idx) as *mut u8).write_bytes(0, slots);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_and_clear_cover_the_block() {
        ensure_init();
        // A fake 64-byte object at a 64-byte-aligned address.
        let block = 0x1234_5678_0040usize;
        unsafe {
            stamp(block, 6);
            // All four 16-byte slots carry the class.
            for off in (0..64).step_by(16) {
                assert_eq!(size_class_of(block + off), 6);
            }
            assert_eq!(size_class_of(block + 64), 0);
            assert_eq!(size_class_of(block - 1), 0);
            clear(block, 6);
            for off in (0..64).step_by(16) {
                assert_eq!(size_class_of(block + off), 0);
            }
        }
    }

    #[test]
    fn out_of_range_addresses_have_no_class() {
        ensure_init();
        assert_eq!(size_class_of(usize::MAX), 0);
    }
}
