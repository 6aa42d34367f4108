use crate::baggy;
use crate::config;
use crate::fault;
use crate::oob;
use crate::paging;
use crate::splay;
use core::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

static STATE: AtomicU8 = AtomicU8::new(UNINIT);

/// Initialize the runtime for the pool/splay engine. The first caller's
/// flags win; later calls are no-ops.
///
/// # Safety
/// Must be callable before main() from instrumented startup code; reads
/// the environment, so no other thread may be mutating it.
pub unsafe fn runtime_init(dangling: u32, rewrite_oob: u32, terminate: u32) {
    if !begin_init() {
        return;
    }
    config::set_runtime_flags(dangling, rewrite_oob, terminate);
    config::read_env();
    splay::ensure_arena();
    oob::ensure_init();
    paging::ensure_init(dangling != 0);
    fault::install();
    STATE.store(READY, Ordering::Release);
}

/// Initialize the runtime for the baggy-bounds engine: the shadow size
/// table replaces the page manager.
///
/// # Safety
/// As `runtime_init`.
pub unsafe fn baggy_runtime_init(dangling: u32, rewrite_oob: u32, terminate: u32) {
    if !begin_init() {
        return;
    }
    config::set_runtime_flags(dangling, rewrite_oob, terminate);
    config::read_env();
    splay::ensure_arena();
    oob::ensure_init();
    baggy::table::ensure_init();
    fault::install();
    STATE.store(READY, Ordering::Release);
}

fn begin_init() -> bool {
    match STATE.compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => true,
        Err(INITIALIZING) => {
            while STATE.load(Ordering::Acquire) == INITIALIZING {
                core::hint::spin_loop();
            }
            false
        }
        Err(_) => false,
    }
}

pub fn ready() -> bool {
    STATE.load(Ordering::Acquire) == READY
}
