//! The external-object table: objects the program received from outside
//! the instrumented world (argv strings, `environ`, `getenv` results).
//!
//! One global splay tree, populated by an explicit registration call and
//! consulted by the unchecked (`*ui`) variants and the fault reporter.
//! The engine never frees these objects.

use crate::splay::SplayTree;
use crate::sync::RawMutex;

struct ExternalObjects {
    lock: RawMutex,
    tree: core::cell::UnsafeCell<SplayTree>,
}

unsafe impl Sync for ExternalObjects {}

static EXTERNAL: ExternalObjects = ExternalObjects {
    lock: RawMutex::new(),
    tree: core::cell::UnsafeCell::new(SplayTree::new()),
};

/// Register `[p, p+len)` as an external object.
pub fn register(p: usize, len: usize) {
    if p == 0 || len == 0 {
        return;
    }
    EXTERNAL.lock.lock();
    unsafe {
        (*EXTERNAL.tree.get()).insert(p, len, 0);
    }
    EXTERNAL.lock.unlock();
}

/// Find the external object containing `p`.
pub fn lookup(p: usize) -> Option<(usize, usize)> {
    EXTERNAL.lock.lock();
    let result = unsafe { (*EXTERNAL.tree.get()).find_read_only(p) };
    EXTERNAL.lock.unlock();
    result.map(|(start, len, _)| (start, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_objects_are_found() {
        register(0x6000_0000_0000, 40);
        assert_eq!(lookup(0x6000_0000_0027), Some((0x6000_0000_0000, 40)));
        assert_eq!(lookup(0x6000_0000_0028), None);
        // Degenerate registrations are ignored.
        register(0, 10);
        register(0x123, 0);
        assert_eq!(lookup(0x123), None);
    }
}
