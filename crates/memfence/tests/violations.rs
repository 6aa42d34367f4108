//! Violation detection tests.
//!
//! Scenarios that must abort (strict mode) or must survive a trapped fault
//! (permissive mode) run as subprocesses: we re-invoke the test binary with
//! an environment variable naming the scenario, then inspect the child's
//! exit status and stderr.

use core::mem::MaybeUninit;
use memfence::abi::*;
use memfence::oob;
use memfence::pool::Pool;
use std::ffi::c_void;
use std::ptr;

fn new_pool(node_size: u32) -> *mut Pool {
    let storage = Box::leak(Box::new(MaybeUninit::<Pool>::zeroed()));
    let p = storage.as_mut_ptr();
    unsafe { poolinit(p, node_size) };
    p
}

// ---------------------------------------------------------------------------
// Subprocess helpers
// ---------------------------------------------------------------------------

fn run_scenario(name: &str) -> std::process::Output {
    let exe = std::env::current_exe().expect("cannot determine test binary path");
    std::process::Command::new(&exe)
        .env("MEMFENCE_VIOLATION_SCENARIO", name)
        .arg("--exact")
        .arg("scenario_driver")
        .arg("--nocapture")
        .env("RUST_TEST_THREADS", "1")
        .output()
        .expect("failed to spawn subprocess")
}

/// The child must die abnormally and its stderr must carry the report.
fn expect_abort_subprocess(name: &str, expected_msg: &str) {
    let output = run_scenario(name);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        !output.status.success(),
        "scenario '{}' should have aborted. stderr:\n{}",
        name,
        stderr
    );
    assert!(
        stderr.contains(expected_msg),
        "scenario '{}' stderr does not contain '{}'. Full stderr:\n{}",
        name,
        expected_msg,
        stderr
    );
}

/// The child must finish normally, print `marker` on stdout, and (when
/// given) carry `stderr_frag` in its report stream.
fn expect_survival_subprocess(name: &str, marker: &str, stderr_frag: Option<&str>) {
    let output = run_scenario(name);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        output.status.success(),
        "scenario '{}' should have survived. stdout:\n{}\nstderr:\n{}",
        name,
        stdout,
        stderr
    );
    assert!(
        stdout.contains(marker),
        "scenario '{}' did not reach its completion marker. stdout:\n{}\nstderr:\n{}",
        name,
        stdout,
        stderr
    );
    if let Some(frag) = stderr_frag {
        assert!(
            stderr.contains(frag),
            "scenario '{}' stderr does not contain '{}'. Full stderr:\n{}",
            name,
            frag,
            stderr
        );
    }
}

// ---------------------------------------------------------------------------
// Scenario driver
// ---------------------------------------------------------------------------

#[test]
fn scenario_driver() {
    let scenario = match std::env::var("MEMFENCE_VIOLATION_SCENARIO") {
        Ok(s) => s,
        Err(_) => return, // Not a subprocess invocation; skip.
    };

    match scenario.as_str() {
        "oob_poolcheck" => scenario_oob_poolcheck(),
        "oob_deref_rewrite" => scenario_oob_deref_rewrite(),
        "dangling_deref" => scenario_dangling_deref(),
        "dangling_warn_continue" => scenario_dangling_warn_continue(),
        "double_free" => scenario_double_free(),
        "invalid_free" => scenario_invalid_free(),
        "align_violation" => scenario_align_violation(),
        "funccheck_miss" => scenario_funccheck_miss(),
        "stack_loop_register" => scenario_stack_loop_register(),
        "unregister_then_check" => scenario_unregister_then_check(),
        "uninit_deref" => scenario_uninit_deref(),
        "baggy_oob_strict" => scenario_baggy_oob_strict(),
        "strict_clean_walkthrough" => scenario_strict_clean_walkthrough(),
        _ => panic!("unknown scenario: {}", scenario),
    }
}

/// Pointer walks off the object; poolcheck must fail on the first byte
/// past the end.
fn scenario_oob_poolcheck() {
    unsafe {
        pool_init_runtime(1, 1, 1);
        let pool = new_pool(8);
        let p = poolalloc(pool, 16) as *mut u8;
        poolcheck(pool, p as *mut c_void);
        poolcheck(pool, p.add(15) as *mut c_void);
        // One past the end: strict mode aborts here.
        poolcheck(pool, p.add(16) as *mut c_void);
    }
    unreachable!("out-of-bounds poolcheck was not detected");
}

/// A rewritten one-past pointer is dereferenced; the fault handler must
/// classify the access and abort.
fn scenario_oob_deref_rewrite() {
    unsafe {
        pool_init_runtime(1, 1, 1);
        let pool = new_pool(8);
        let p = poolalloc(pool, 16) as *mut u8;
        let q = boundscheck(pool, p as *mut c_void, p.add(16) as *mut c_void);

        let (lower, upper) = oob::bounds();
        assert!((q as usize) >= lower && (q as usize) < upper);
        assert_eq!(
            pchk_getActualValue(pool, q) as usize,
            p as usize + 16
        );

        // The dereference faults into the handler.
        let _ = ptr::read_volatile(q as *const u8);
    }
    unreachable!("rewrite pointer dereference was not trapped");
}

/// Use after free with dangling detection: the freed object's shadow pages
/// are protected, so the load traps and the report carries the allocation
/// history.
fn scenario_dangling_deref() {
    unsafe {
        pool_init_runtime(1, 1, 1);
        let pool = new_pool(8);
        let p = poolalloc(pool, 32) as *mut u8;
        ptr::write_bytes(p, 0xCC, 32);
        poolfree(pool, p as *mut c_void);
        let _ = ptr::read_volatile(p);
    }
    unreachable!("dangling dereference was not trapped");
}

/// Same as above but permissive: the handler unprotects, reports, and the
/// program keeps running.
fn scenario_dangling_warn_continue() {
    unsafe {
        pool_init_runtime(1, 1, 0);
        let pool = new_pool(8);
        let p = poolalloc(pool, 32) as *mut u8;
        ptr::write_bytes(p, 0xCC, 32);
        poolfree(pool, p as *mut c_void);
        let v = ptr::read_volatile(p);
        // The frames were freed but stay mapped; the load completes after
        // the handler unprotects the shadow.
        let _ = v;
    }
    println!("CONTINUED_OK");
}

fn scenario_double_free() {
    unsafe {
        pool_init_runtime(1, 1, 1);
        let pool = new_pool(8);
        let p = poolalloc(pool, 24);
        poolfree(pool, p);
        poolfree(pool, p);
    }
    unreachable!("double free was not detected");
}

fn scenario_invalid_free() {
    unsafe {
        pool_init_runtime(1, 1, 1);
        let pool = new_pool(8);
        let mut stack_var = 0u64;
        poolfree(pool, &mut stack_var as *mut u64 as *mut c_void);
    }
    unreachable!("invalid free was not detected");
}

/// Node size 8, offset window [0,0]: a pointer 3 bytes into a node fails.
fn scenario_align_violation() {
    unsafe {
        pool_init_runtime(1, 1, 1);
        let pool = new_pool(8);
        let p = poolalloc(pool, 16) as *mut u8;
        // Node-aligned interior pointers pass.
        poolcheckalign(pool, p as *mut c_void, 0, 0);
        poolcheckalign(pool, p.add(8) as *mut c_void, 0, 0);
        // Misaligned: abort.
        poolcheckalign(pool, p.add(3) as *mut c_void, 0, 0);
    }
    unreachable!("alignment violation was not detected");
}

fn scenario_funccheck_miss() {
    extern "C" fn fa() {}
    extern "C" fn fb() {}
    extern "C" fn fc() {}
    extern "C" fn fd() {}

    let (fa, fb, fc, fd) = (
        fa as usize as *const c_void,
        fb as usize as *const c_void,
        fc as usize as *const c_void,
        fd as usize as *const c_void,
    );
    unsafe {
        pool_init_runtime(1, 1, 1);
        let targets = [fa, fb, fc];
        // A listed target passes.
        funccheck(3, fa, targets.as_ptr());
        funccheck(3, fc, targets.as_ptr());
        // An unlisted one aborts.
        funccheck(3, fd, targets.as_ptr());
    }
    unreachable!("indirect-call violation was not detected");
}

/// Registering the same stack interval twice without unregistering is the
/// alloca-in-a-loop pattern, which is unsupported and fails loudly.
fn scenario_stack_loop_register() {
    unsafe {
        pool_init_runtime(1, 1, 1);
        let pool = new_pool(4);
        let mut frame = [0u8; 32];
        poolregister_stack(pool, frame.as_mut_ptr() as *mut c_void, 32);
        poolregister_stack(pool, frame.as_mut_ptr() as *mut c_void, 32);
    }
    unreachable!("stack re-registration was not rejected");
}

/// After unregistration the interval is gone from the index: the same
/// pointer that passed poolcheck before must now fail it.
fn scenario_unregister_then_check() {
    unsafe {
        pool_init_runtime(1, 1, 1);
        let pool = new_pool(4);
        let mut buf = [0u8; 64];
        let base = buf.as_mut_ptr() as *mut c_void;
        poolregister(pool, base, 64);
        poolcheck(pool, base);
        poolunregister(pool, base);
        poolcheck(pool, base);
    }
    unreachable!("check of an unregistered interval was not detected");
}

/// A never-initialized pointer lands in the zero page.
fn scenario_uninit_deref() {
    unsafe {
        pool_init_runtime(1, 1, 1);
        let _ = ptr::read_volatile(0x10 as *const u8);
    }
    unreachable!("uninitialized pointer dereference was not trapped");
}

/// Baggy engine, strict: two past the padded end is not the one-past
/// idiom and must abort.
fn scenario_baggy_oob_strict() {
    unsafe {
        __bb_pool_init_runtime(0, 1, 1);
        let pool = __bb_poolinit(ptr::null_mut(), 0);
        let p = __bb_poolalloc(pool, 5) as usize;
        // In-bounds and one-past both pass (one-past as a rewrite).
        let ok = __bb_boundscheck(pool, p as *mut c_void, (p + 15) as *mut c_void);
        assert_eq!(ok as usize, p + 15);
        let _rewrite = __bb_boundscheck(pool, p as *mut c_void, (p + 16) as *mut c_void);
        // Two past: abort.
        let _ = __bb_boundscheck(pool, p as *mut c_void, (p + 17) as *mut c_void);
    }
    unreachable!("baggy out-of-bounds was not detected");
}

/// Everything in here is legitimate; under strict mode any false positive
/// aborts the process and fails the test.
fn scenario_strict_clean_walkthrough() {
    unsafe {
        pool_init_runtime(1, 1, 1);
        let pool = new_pool(8);

        let p = poolalloc(pool, 64) as *mut u8;
        for off in 0..64usize {
            poolcheck(pool, p.add(off) as *mut c_void);
        }
        let q = poolrealloc(pool, p as *mut c_void, 32) as *mut u8;
        poolcheck(pool, q as *mut c_void);
        poolfree(pool, q as *mut c_void);

        // Environment-style string walk over registered externals.
        let strings = [b"HOME=/root\0".as_slice(), b"TERM=dumb\0".as_slice()];
        let string_pool = new_pool(1);
        for s in strings {
            poolregister(string_pool, s.as_ptr() as *mut c_void, s.len() as u32);
            for i in 0..s.len() {
                poolcheck(string_pool, s.as_ptr().add(i) as *mut c_void);
            }
            poolunregister(string_pool, s.as_ptr() as *mut c_void);
        }

        pooldestroy(pool);
        pooldestroy(string_pool);
    }
    println!("WALKTHROUGH_OK");
}

// ---------------------------------------------------------------------------
// Assertions on the scenarios
// ---------------------------------------------------------------------------

#[test]
fn out_of_bounds_poolcheck_aborts() {
    expect_abort_subprocess("oob_poolcheck", "type=OUT_OF_BOUNDS");
}

#[test]
fn rewrite_pointer_dereference_is_trapped() {
    expect_abort_subprocess("oob_deref_rewrite", "type=OUT_OF_BOUNDS");
}

#[test]
fn dangling_dereference_reports_allocation_history() {
    let output = run_scenario("dangling_deref");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success(), "stderr:\n{}", stderr);
    assert!(stderr.contains("type=DANGLING"), "stderr:\n{}", stderr);
    // First and only allocation and free of that process.
    assert!(
        stderr.contains("Allocation generation number    : 1"),
        "stderr:\n{}",
        stderr
    );
    assert!(
        stderr.contains("Free generation number          : 1"),
        "stderr:\n{}",
        stderr
    );
}

#[test]
fn dangling_dereference_continues_in_permissive_mode() {
    expect_survival_subprocess("dangling_warn_continue", "CONTINUED_OK", Some("type=DANGLING"));
}

#[test]
fn double_free_aborts() {
    expect_abort_subprocess("double_free", "type=DOUBLE_FREE");
}

#[test]
fn invalid_free_aborts() {
    expect_abort_subprocess("invalid_free", "type=INVALID_FREE");
}

#[test]
fn alignment_violation_aborts() {
    expect_abort_subprocess("align_violation", "type=ALIGN");
}

#[test]
fn indirect_call_violation_aborts() {
    expect_abort_subprocess("funccheck_miss", "outside the target set");
}

#[test]
fn stack_reregistration_aborts() {
    expect_abort_subprocess("stack_loop_register", "unsupported construct");
}

#[test]
fn unregistered_intervals_fail_checks() {
    expect_abort_subprocess("unregister_then_check", "MEMFENCE: violation");
}

#[test]
fn uninitialized_dereference_aborts() {
    expect_abort_subprocess("uninit_deref", "type=UNINITIALIZED");
}

#[test]
fn baggy_out_of_bounds_aborts_in_strict_mode() {
    expect_abort_subprocess("baggy_oob_strict", "type=OUT_OF_BOUNDS");
}

#[test]
fn strict_mode_has_no_false_positives() {
    expect_survival_subprocess("strict_clean_walkthrough", "WALKTHROUGH_OK", None);
}
