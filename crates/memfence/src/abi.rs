//! The instrumented-program ABI.
//!
//! The compiler rewrites programs to call these symbols. The pool/splay
//! engine exports the unprefixed names; the baggy-bounds engine exports the
//! same operations under a `__bb_` prefix. Both live in one shared object
//! and the compiler emits one set or the other.
//!
//! Every entry captures its caller's program counter for reports, then
//! forwards to the engine modules. No Rust panic may escape these
//! functions; the engines report violations and return conservative
//! results instead.

use crate::baggy;
use crate::init;
use crate::paging;
use crate::pool::Pool;
use crate::report::{self, Violation, ViolationKind};
use crate::util::caller_pc;
use core::ffi::{c_char, c_int, c_uint, c_void};
use core::ptr;

// ============================================================================
// Runtime initialization
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn pool_init_runtime(dangling: c_uint, rewrite_oob: c_uint, terminate: c_uint) {
    init::runtime_init(dangling, rewrite_oob, terminate);
}

#[no_mangle]
pub unsafe extern "C" fn __bb_pool_init_runtime(
    dangling: c_uint,
    rewrite_oob: c_uint,
    terminate: c_uint,
) {
    init::baggy_runtime_init(dangling, rewrite_oob, terminate);
}

// ============================================================================
// Pool lifecycle
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn poolinit(pool: *mut Pool, node_size: c_uint) {
    Pool::init(pool, node_size as usize);
}

#[no_mangle]
pub unsafe extern "C" fn pooldestroy(pool: *mut Pool) {
    if let Some(pool) = pool.as_ref() {
        pool.destroy();
    }
}

// ============================================================================
// Pool allocation
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn poolalloc(pool: *mut Pool, num_bytes: c_uint) -> *mut c_void {
    let pc = caller_pc();
    match pool.as_ref() {
        Some(pool) => pool.alloc(num_bytes as usize, pc) as *mut c_void,
        None => report::abort_with_message("memfence: poolalloc with a null pool\n"),
    }
}

#[no_mangle]
pub unsafe extern "C" fn poolrealloc(
    pool: *mut Pool,
    node: *mut c_void,
    num_bytes: c_uint,
) -> *mut c_void {
    let pc = caller_pc();
    match pool.as_ref() {
        Some(pool) => pool.realloc(node as usize, num_bytes as usize, pc) as *mut c_void,
        None => ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn poolcalloc(
    pool: *mut Pool,
    number: c_uint,
    num_bytes: c_uint,
) -> *mut c_void {
    let pc = caller_pc();
    match pool.as_ref() {
        Some(pool) => pool.calloc(number as usize, num_bytes as usize, pc) as *mut c_void,
        None => ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn poolstrdup(pool: *mut Pool, node: *const c_char) -> *mut c_void {
    let pc = caller_pc();
    match pool.as_ref() {
        Some(pool) => pool.strdup(node as *const u8, pc) as *mut c_void,
        None => ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn poolfree(pool: *mut Pool, node: *mut c_void) {
    let pc = caller_pc();
    if let Some(pool) = pool.as_ref() {
        pool.free(node as usize, pc);
    }
}

// ============================================================================
// Pool registration
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn poolregister(pool: *mut Pool, ptr: *mut c_void, num_bytes: c_uint) {
    let pc = caller_pc();
    if let Some(pool) = pool.as_ref() {
        pool.register(ptr as usize, num_bytes as usize, pc);
    }
}

#[no_mangle]
pub unsafe extern "C" fn poolregister_stack(pool: *mut Pool, ptr: *mut c_void, num_bytes: c_uint) {
    let pc = caller_pc();
    if let Some(pool) = pool.as_ref() {
        pool.register_stack(ptr as usize, num_bytes as usize, pc);
    }
}

#[no_mangle]
pub unsafe extern "C" fn poolregister_global(pool: *mut Pool, ptr: *mut c_void, num_bytes: c_uint) {
    let pc = caller_pc();
    if let Some(pool) = pool.as_ref() {
        pool.register(ptr as usize, num_bytes as usize, pc);
    }
}

#[no_mangle]
pub unsafe extern "C" fn poolunregister(pool: *mut Pool, ptr: *mut c_void) {
    if let Some(pool) = pool.as_ref() {
        pool.unregister(ptr as usize);
    }
}

#[no_mangle]
pub unsafe extern "C" fn poolunregister_stack(pool: *mut Pool, ptr: *mut c_void) {
    if let Some(pool) = pool.as_ref() {
        pool.unregister(ptr as usize);
    }
}

/// Register an object the instrumented world did not allocate (argv
/// strings, environ, getenv results). Consulted by the `*ui` checks.
#[no_mangle]
pub unsafe extern "C" fn pool_register_external(ptr: *const c_void, num_bytes: c_uint) {
    crate::extobj::register(ptr as usize, num_bytes as usize);
}

/// Register every argv string (and the argv array itself) as external
/// objects, so string walks through the environment check out.
#[no_mangle]
pub unsafe extern "C" fn poolargvregister(argc: c_int, argv: *mut *mut c_char) -> *mut *mut c_char {
    if argv.is_null() || argc < 0 {
        return argv;
    }
    for i in 0..argc as usize {
        let arg = argv.add(i).read();
        if !arg.is_null() {
            let len = libc::strlen(arg) + 1;
            crate::extobj::register(arg as usize, len);
        }
    }
    crate::extobj::register(argv as usize, (argc as usize + 1) * core::mem::size_of::<*mut c_char>());
    argv
}

// ============================================================================
// Pool checks
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn poolcheck(pool: *mut Pool, node: *mut c_void) {
    let pc = caller_pc();
    if let Some(pool) = pool.as_ref() {
        pool.check(node as usize, pc, false);
    }
}

#[no_mangle]
pub unsafe extern "C" fn poolcheckui(pool: *mut Pool, node: *mut c_void) {
    let pc = caller_pc();
    if let Some(pool) = pool.as_ref() {
        pool.check(node as usize, pc, true);
    }
}

#[no_mangle]
pub unsafe extern "C" fn poolcheckalign(
    pool: *mut Pool,
    node: *mut c_void,
    start_offset: c_uint,
    end_offset: c_uint,
) {
    let pc = caller_pc();
    if let Some(pool) = pool.as_ref() {
        pool.check_align(node as usize, start_offset as usize, end_offset as usize, pc);
    }
}

#[no_mangle]
pub unsafe extern "C" fn boundscheck(
    pool: *mut Pool,
    source: *mut c_void,
    dest: *mut c_void,
) -> *mut c_void {
    let pc = caller_pc();
    match pool.as_ref() {
        Some(pool) => pool.bounds_check(source as usize, dest as usize, pc, false) as *mut c_void,
        None => dest,
    }
}

#[no_mangle]
pub unsafe extern "C" fn boundscheckui(
    pool: *mut Pool,
    source: *mut c_void,
    dest: *mut c_void,
) -> *mut c_void {
    let pc = caller_pc();
    match pool.as_ref() {
        Some(pool) => pool.bounds_check(source as usize, dest as usize, pc, true) as *mut c_void,
        None => dest,
    }
}

#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn pchk_getActualValue(pool: *mut Pool, src: *mut c_void) -> *mut c_void {
    match pool.as_ref() {
        Some(pool) => pool.get_actual_value(src as usize) as *mut c_void,
        None => src,
    }
}

/// Exact bounds check with both bounds in hand; no index lookup.
/// `base <= result < end` passes; `result == end` is the one-past idiom.
#[no_mangle]
pub unsafe extern "C" fn exactcheck2(
    base: *mut c_void,
    result: *mut c_void,
    end: *mut c_void,
) -> *mut c_void {
    let pc = caller_pc();
    let (b, r, e) = (base as usize, result as usize, end as usize);
    exactcheck2_impl(b, r, e, pc) as *mut c_void
}

pub(crate) unsafe fn exactcheck2_impl(base: usize, result: usize, end: usize, pc: usize) -> usize {
    if base <= result && result < end {
        return result;
    }
    if result == end && crate::config::rewrite_oob() {
        if let Some(rewrite) = crate::oob::mint() {
            let id = crate::oob::record(result, base, end - base);
            crate::oob::global_insert(rewrite, id);
            return rewrite;
        }
    }
    let mut v = Violation::new(ViolationKind::OutOfBounds, pc, result);
    if end > base {
        v.object = Some((base, end - base));
    }
    v.intended = Some(result);
    report::emit(&v);
    result
}

/// Inlined load/store check: `base <= ptr` and `ptr + len <= base + size`.
#[no_mangle]
pub unsafe extern "C" fn fastlscheck(
    base: *const c_char,
    ptr: *const c_char,
    size: c_uint,
    len: c_uint,
) {
    let pc = caller_pc();
    let (b, p) = (base as usize, ptr as usize);
    let (size, len) = (size as usize, len as usize);
    if b <= p && p + len <= b + size {
        return;
    }
    let mut v = Violation::new(ViolationKind::LoadStore, pc, p);
    v.object = Some((b, size));
    report::emit(&v);
}

// ============================================================================
// Indirect-call target check
// ============================================================================

/// True when `f` appears among the `num` entries of `targets`.
pub fn funccheck_ok(num: usize, f: *const c_void, targets: *const *const c_void) -> bool {
    if targets.is_null() {
        return false;
    }
    for i in 0..num {
        if unsafe { targets.add(i).read() } == f {
            return true;
        }
    }
    false
}

/// Validate an indirect call target against the list of admissible
/// functions. A miss is a control-flow hijack in progress; there is no
/// warn-and-continue for this one.
///
/// The C-variadic prototype of the original cannot be written in stable
/// Rust, so the target list arrives as a pointer to an array of `num`
/// function pointers.
#[no_mangle]
pub unsafe extern "C" fn funccheck(num: c_uint, f: *const c_void, targets: *const *const c_void) {
    if funccheck_ok(num as usize, f, targets) {
        return;
    }
    report::abort_with_message("memfence: indirect call to a function outside the target set\n");
}

// ============================================================================
// Statistics
// ============================================================================

/// One-line memory usage summary on stderr.
#[no_mangle]
pub unsafe extern "C" fn poolstats() {
    report::stat(b"pool memory usage bytes", paging::mem_usage());
}

// ============================================================================
// Baggy-bounds engine
// ============================================================================

/// Baggy pools carry no state; the handle is returned unchanged so the
/// compiler can thread it through the same call shapes as the pool engine.
#[no_mangle]
pub unsafe extern "C" fn __bb_poolinit(pool: *mut c_void, _node_size: c_uint) -> *mut c_void {
    pool
}

#[no_mangle]
pub unsafe extern "C" fn __bb_pooldestroy(_pool: *mut c_void) {}

#[no_mangle]
pub unsafe extern "C" fn __bb_poolalloc(_pool: *mut c_void, num_bytes: c_uint) -> *mut c_void {
    let pc = caller_pc();
    baggy::alloc(num_bytes as usize, pc) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn __bb_poolfree(_pool: *mut c_void, node: *mut c_void) {
    let pc = caller_pc();
    baggy::free(node as usize, pc);
}

#[no_mangle]
pub unsafe extern "C" fn __bb_poolrealloc(
    _pool: *mut c_void,
    node: *mut c_void,
    num_bytes: c_uint,
) -> *mut c_void {
    let pc = caller_pc();
    baggy::realloc(node as usize, num_bytes as usize, pc) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn __bb_poolcalloc(
    _pool: *mut c_void,
    number: c_uint,
    num_bytes: c_uint,
) -> *mut c_void {
    let pc = caller_pc();
    baggy::calloc(number as usize, num_bytes as usize, pc) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn __bb_poolstrdup(_pool: *mut c_void, node: *const c_char) -> *mut c_void {
    let pc = caller_pc();
    baggy::strdup(node as *const u8, pc) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn __bb_poolregister(_pool: *mut c_void, ptr: *mut c_void, num_bytes: c_uint) {
    let pc = caller_pc();
    baggy::register(ptr as usize, num_bytes as usize, pc);
}

#[no_mangle]
pub unsafe extern "C" fn __bb_poolregister_stack(
    _pool: *mut c_void,
    ptr: *mut c_void,
    num_bytes: c_uint,
) {
    let pc = caller_pc();
    baggy::register(ptr as usize, num_bytes as usize, pc);
}

#[no_mangle]
pub unsafe extern "C" fn __bb_poolregister_global(
    _pool: *mut c_void,
    ptr: *mut c_void,
    num_bytes: c_uint,
) {
    let pc = caller_pc();
    baggy::register(ptr as usize, num_bytes as usize, pc);
}

#[no_mangle]
pub unsafe extern "C" fn __bb_poolunregister(_pool: *mut c_void, ptr: *mut c_void) {
    baggy::unregister(ptr as usize);
}

#[no_mangle]
pub unsafe extern "C" fn __bb_poolunregister_stack(_pool: *mut c_void, ptr: *mut c_void) {
    baggy::unregister(ptr as usize);
}

#[no_mangle]
pub unsafe extern "C" fn __bb_boundscheck(
    _pool: *mut c_void,
    source: *mut c_void,
    dest: *mut c_void,
) -> *mut c_void {
    let pc = caller_pc();
    baggy::bounds_check(source as usize, dest as usize, pc) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn __bb_loadcheck(ptr: *mut c_void, len: c_uint) {
    let pc = caller_pc();
    baggy::load_check(ptr as usize, len as usize, pc);
}

#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn __bb_getActualValue(_pool: *mut c_void, src: *mut c_void) -> *mut c_void {
    baggy::get_actual_value(src as usize) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn __bb_poolargvregister(
    argc: c_int,
    argv: *mut *mut c_char,
) -> *mut *mut c_char {
    let pc = caller_pc();
    baggy::argv_register(argc, argv as *mut *mut u8, pc) as *mut *mut c_char
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn funccheck_membership() {
        let a = 0x1000 as *const c_void;
        let b = 0x2000 as *const c_void;
        let c = 0x3000 as *const c_void;
        let list = [a, b, c];
        assert!(funccheck_ok(3, a, list.as_ptr()));
        assert!(funccheck_ok(3, c, list.as_ptr()));
        assert!(!funccheck_ok(3, 0x4000 as *const c_void, list.as_ptr()));
        assert!(!funccheck_ok(2, c, list.as_ptr()));
        assert!(!funccheck_ok(0, a, list.as_ptr()));
        assert!(!funccheck_ok(1, a, core::ptr::null()));
    }
}
