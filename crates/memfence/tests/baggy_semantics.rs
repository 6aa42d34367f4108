//! Baggy-bounds engine semantics through the `__bb_` ABI, permissive mode.

use memfence::abi::*;
use memfence::baggy::table;
use memfence::oob;
use std::ffi::c_void;
use std::ptr;

fn init() -> *mut c_void {
    unsafe {
        __bb_pool_init_runtime(0, 1, 0);
        __bb_poolinit(ptr::null_mut(), 0)
    }
}

#[test]
fn alloc_is_power_of_two_aligned_and_stamped() {
    let pool = init();
    unsafe {
        // 5 bytes plus the 8-byte trailer fit a 16-byte block: class 4.
        let p = __bb_poolalloc(pool, 5) as usize;
        assert!(p != 0);
        assert_eq!(p & 15, 0);
        assert_eq!(table::size_class_of(p), 4);

        __bb_poolfree(pool, p as *mut c_void);
        assert_eq!(table::size_class_of(p), 0);
    }
}

#[test]
fn boundscheck_padded_bounds_and_one_past() {
    let pool = init();
    unsafe {
        let p = __bb_poolalloc(pool, 5) as usize;
        assert_eq!(table::size_class_of(p), 4);

        // Anywhere inside the padded 16 bytes passes untouched.
        for off in 0..16usize {
            let q = __bb_boundscheck(pool, p as *mut c_void, (p + off) as *mut c_void);
            assert_eq!(q as usize, p + off);
        }

        // One past the padded end becomes a rewrite pointer.
        let q = __bb_boundscheck(pool, p as *mut c_void, (p + 16) as *mut c_void) as usize;
        let (lower, upper) = oob::bounds();
        assert!(q >= lower && q < upper);
        assert_eq!(
            __bb_getActualValue(pool, q as *mut c_void) as usize,
            p + 16
        );

        // Far out of bounds in permissive mode: also rewritten (and
        // reported; reports do not abort here).
        let q2 = __bb_boundscheck(pool, p as *mut c_void, (p + 17) as *mut c_void) as usize;
        assert!(q2 >= lower && q2 < upper);
        assert_ne!(q, q2);

        __bb_poolfree(pool, p as *mut c_void);
    }
}

#[test]
fn registration_stamps_aligned_foreign_memory() {
    let pool = init();
    unsafe {
        // A 64-byte-aligned, 64-byte block of our own.
        let mut raw: *mut c_void = ptr::null_mut();
        assert_eq!(libc::posix_memalign(&mut raw, 64, 64), 0);
        let p = raw as usize;

        __bb_poolregister(pool, raw, 64);
        assert_eq!(table::size_class_of(p), 6);
        assert_eq!(table::size_class_of(p + 63), 6);

        __bb_poolunregister(pool, raw);
        assert_eq!(table::size_class_of(p), 0);
        libc::free(raw);
    }
}

#[test]
fn realloc_preserves_data_across_classes() {
    let pool = init();
    unsafe {
        let p = __bb_poolalloc(pool, 20) as *mut u8;
        for i in 0..20 {
            p.add(i).write(i as u8 + 1);
        }

        // Grow into a larger class.
        let q = __bb_poolrealloc(pool, p as *mut c_void, 200) as *mut u8;
        assert!(!q.is_null());
        for i in 0..20 {
            assert_eq!(q.add(i).read(), i as u8 + 1);
        }

        // Shrink: the first 4 bytes survive.
        let r = __bb_poolrealloc(pool, q as *mut c_void, 4) as *mut u8;
        assert!(!r.is_null());
        for i in 0..4 {
            assert_eq!(r.add(i).read(), i as u8 + 1);
        }

        assert!(__bb_poolrealloc(pool, r as *mut c_void, 0).is_null());
        // NULL input allocates.
        let s = __bb_poolrealloc(pool, ptr::null_mut(), 8);
        assert!(!s.is_null());
        __bb_poolfree(pool, s);
    }
}

#[test]
fn calloc_zero_fills_and_strdup_copies() {
    let pool = init();
    unsafe {
        let p = __bb_poolcalloc(pool, 6, 7) as *mut u8;
        assert!(!p.is_null());
        for i in 0..42 {
            assert_eq!(p.add(i).read(), 0);
        }
        __bb_poolfree(pool, p as *mut c_void);

        let src = b"baggy\0";
        let d = __bb_poolstrdup(pool, src.as_ptr() as *const libc::c_char) as *mut u8;
        for (i, &b) in src.iter().enumerate() {
            assert_eq!(d.add(i).read(), b);
        }
        __bb_poolfree(pool, d as *mut c_void);
    }
}

#[test]
fn loadcheck_passes_within_one_object() {
    let pool = init();
    unsafe {
        let p = __bb_poolalloc(pool, 24) as usize;
        // 24 + 8 pads to 32: spans exactly one 32-byte block.
        __bb_loadcheck(p as *mut c_void, 24);
        __bb_loadcheck((p + 23) as *mut c_void, 1);
        __bb_poolfree(pool, p as *mut c_void);
    }
}

#[test]
fn argv_copies_are_aligned_and_tracked() {
    let pool = init();
    let s0 = b"prog\0".to_vec();
    let s1 = b"arg\0".to_vec();
    let mut argv = [
        s0.as_ptr() as *mut libc::c_char,
        s1.as_ptr() as *mut libc::c_char,
        ptr::null_mut(),
    ];
    unsafe {
        let out = __bb_poolargvregister(2, argv.as_mut_ptr());
        assert!(!out.is_null());
        assert_ne!(out, argv.as_mut_ptr());
        for i in 0..2usize {
            let arg = out.add(i).read();
            assert!(!arg.is_null());
            // Copies live in stamped storage and compare equal.
            assert_ne!(table::size_class_of(arg as usize), 0);
            assert_eq!(libc::strcmp(arg, argv[i]), 0);
        }
        assert!(out.add(2).read().is_null());
        let _ = pool;
    }
}

#[test]
fn get_actual_value_is_identity_off_region() {
    let pool = init();
    unsafe {
        let p = __bb_poolalloc(pool, 8);
        assert_eq!(__bb_getActualValue(pool, p), p);
        __bb_poolfree(pool, p);
    }
}
