#![no_main]

use libfuzzer_sys::fuzz_target;
use memfence::abi::*;
use memfence::pool::Pool;
use std::ffi::c_void;
use std::sync::Once;

/// Fuzz target that interprets a byte slice as a sequence of pool
/// operations in permissive mode (violations report but never abort).
///
/// Each operation is encoded as:
///   byte 0: opcode (0=alloc, 1=free, 2=realloc, 3=check, 4=boundscheck,
///           5=register, 6=unregister)
///   byte 1-2: size / offset (little-endian u16)
///   byte 3: slot index (which tracked pointer to operate on)
///
/// We track up to 32 live pointers.
const MAX_SLOTS: usize = 32;

static INIT: Once = Once::new();

fuzz_target!(|data: &[u8]| {
    INIT.call_once(|| unsafe {
        pool_init_runtime(0, 1, 0);
    });

    let mut storage = core::mem::MaybeUninit::<Pool>::zeroed();
    let pool = storage.as_mut_ptr();
    unsafe { poolinit(pool, 8) };

    let mut slots: [*mut c_void; MAX_SLOTS] = [std::ptr::null_mut(); MAX_SLOTS];
    let mut external = [0u8; 256];

    let mut i = 0;
    while i + 4 <= data.len() {
        let opcode = data[i] % 7;
        let size = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
        let slot = (data[i + 3] as usize) % MAX_SLOTS;
        i += 4;

        unsafe {
            match opcode {
                0 => {
                    if slots[slot].is_null() {
                        // Sizes capped well above the single-array
                        // threshold to cover both slab paths.
                        let p = poolalloc(pool, (size % 65536) as u32);
                        if !p.is_null() {
                            (p as *mut u8).write_bytes(0xA5, 1);
                        }
                        slots[slot] = p;
                    }
                }
                1 => {
                    if !slots[slot].is_null() {
                        poolfree(pool, slots[slot]);
                        slots[slot] = std::ptr::null_mut();
                    }
                }
                2 => {
                    if !slots[slot].is_null() {
                        let p = poolrealloc(pool, slots[slot], (size % 65536) as u32);
                        slots[slot] = p;
                    }
                }
                3 => {
                    // Check an arbitrary offset off a live pointer; in
                    // permissive mode a miss only reports.
                    if !slots[slot].is_null() {
                        let p = (slots[slot] as usize).wrapping_add(size % 128);
                        poolcheckui(pool, p as *mut c_void);
                    }
                }
                4 => {
                    if !slots[slot].is_null() {
                        let src = slots[slot];
                        let dst = (src as usize).wrapping_add(size % 128) as *mut c_void;
                        let r = boundscheck(pool, src, dst);
                        let _ = pchk_getActualValue(pool, r);
                    }
                }
                5 => {
                    poolregister(
                        pool,
                        external.as_mut_ptr() as *mut c_void,
                        (size % 256).max(1) as u32,
                    );
                }
                6 => {
                    poolunregister(pool, external.as_mut_ptr() as *mut c_void);
                }
                _ => unreachable!(),
            }
        }
    }

    unsafe { pooldestroy(pool) };
});
