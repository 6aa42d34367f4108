use core::sync::atomic::{AtomicBool, Ordering};

/// Runtime options, set once by `pool_init_runtime` and read everywhere.
/// Mirrors the flags the instrumenting compiler passes at startup.
static REMAP_OBJECTS: AtomicBool = AtomicBool::new(false);
static REWRITE_OOB: AtomicBool = AtomicBool::new(false);
static TERMINATE_ON_ERROR: AtomicBool = AtomicBool::new(false);

/// Diagnostic logging of object registrations (env kill-switch style).
static LOG_REGS: AtomicBool = AtomicBool::new(false);

/// Apply the `pool_init_runtime` flags.
pub fn set_runtime_flags(dangling: u32, rewrite_oob: u32, terminate: u32) {
    REMAP_OBJECTS.store(dangling != 0, Ordering::Relaxed);
    REWRITE_OOB.store(rewrite_oob != 0, Ordering::Relaxed);
    TERMINATE_ON_ERROR.store(terminate != 0, Ordering::Relaxed);
}

/// Read configuration from environment variables.
/// Must be called during init, before other threads exist.
///
/// # Safety
/// Calls libc::getenv, which is not thread-safe against a mutating
/// environment; callers invoke this once from runtime init.
pub unsafe fn read_env() {
    if env_set(b"MEMFENCE_LOG_REGS\0") {
        LOG_REGS.store(true, Ordering::Relaxed);
    }
}

/// Dangling-pointer detection: remap objects to shadow pages and protect
/// them on free.
#[inline]
pub fn remap_objects() -> bool {
    REMAP_OBJECTS.load(Ordering::Relaxed)
}

/// Out-of-bounds rewriting: hand out pointers into the reserved invalid
/// region instead of failing on the one-past-the-end idiom.
#[inline]
pub fn rewrite_oob() -> bool {
    REWRITE_OOB.load(Ordering::Relaxed)
}

/// Abort on the first violation instead of warn-and-continue.
#[inline]
pub fn terminate_on_error() -> bool {
    TERMINATE_ON_ERROR.load(Ordering::Relaxed)
}

#[inline]
pub fn log_registrations() -> bool {
    LOG_REGS.load(Ordering::Relaxed)
}

unsafe fn env_set(key: &[u8]) -> bool {
    !libc::getenv(key.as_ptr() as *const libc::c_char).is_null()
}
