//! Locking shaped to this runtime's two constraints: no allocation (the
//! engine is loaded under arbitrary C programs, so std::sync is off
//! limits), and no blocking in signal context (the handler may interrupt
//! the very thread that holds a lock, so taking one there can
//! self-deadlock).
//!
//! Writers and ordinary readers serialize on `RawMutex`. Structures the
//! fault handler consults get a second, lock-free read path through
//! `HandlerShared`, which couples the writer mutex with a sequence
//! counter the handler validates its snapshots against.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

const UNLOCKED: u32 = 0;
const HELD: u32 = 1;
const CONTENDED: u32 = 2;

/// Spins before sleeping in the kernel. The critical sections behind
/// these locks are a few pointer writes (splay rotations, bitmap flips,
/// cursor bumps), so a short spin usually beats a futex round trip.
const SPIN_LIMIT: u32 = 64;

pub struct RawMutex {
    state: AtomicU32,
}

impl RawMutex {
    pub const fn new() -> Self {
        RawMutex {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    #[inline]
    pub fn lock(&self) {
        if self
            .state
            .compare_exchange(UNLOCKED, HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_contended();
    }

    #[cold]
    fn lock_contended(&self) {
        let mut spins = 0;
        while spins < SPIN_LIMIT {
            if self.state.load(Ordering::Relaxed) == UNLOCKED
                && self
                    .state
                    .compare_exchange(UNLOCKED, HELD, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            core::hint::spin_loop();
            spins += 1;
        }
        // Announce a sleeper and wait until the holder hands off.
        while self.state.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            futex_wait(&self.state, CONTENDED);
        }
    }

    #[inline]
    pub fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            futex_wake(&self.state);
        }
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
fn futex_wait(state: &AtomicU32, expected: u32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            state as *const AtomicU32,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            core::ptr::null::<libc::timespec>(),
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wait(_state: &AtomicU32, _expected: u32) {
    core::hint::spin_loop();
}

#[cfg(target_os = "linux")]
fn futex_wake(state: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            state as *const AtomicU32,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            1i32,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wake(_state: &AtomicU32) {}

/// Attempts before a handler-side read gives up and the caller degrades
/// (classifies with less metadata).
const READ_RETRIES: usize = 64;

/// State with one writer discipline and two read paths.
///
/// Mutations and ordinary lookups go through the writer mutex. The fault
/// handler instead reads a sequence-validated snapshot: `write` bumps the
/// sequence to odd before touching the data and back to even after, and a
/// `read_handler` result only counts if the sequence was even and
/// unchanged around the read.
pub struct HandlerShared<T> {
    writer: RawMutex,
    seq: AtomicUsize,
    data: UnsafeCell<T>,
}

// Access is confined to the write/read/read_handler discipline below;
// the inner value is never handed out by reference.
unsafe impl<T> Sync for HandlerShared<T> {}

impl<T> HandlerShared<T> {
    pub const fn new(data: T) -> Self {
        HandlerShared {
            writer: RawMutex::new(),
            seq: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Mutate under the writer lock. Handler readers see the sequence as
    /// odd for the duration and retry.
    pub fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.writer.lock();
        self.seq.fetch_add(1, Ordering::Release);
        let result = f(unsafe { &mut *self.data.get() });
        self.seq.fetch_add(1, Ordering::Release);
        self.writer.unlock();
        result
    }

    /// Read under the writer lock. For every path that is allowed to
    /// block (anything outside the fault handler).
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.writer.lock();
        let result = f(unsafe { &*self.data.get() });
        self.writer.unlock();
        result
    }

    /// Lock-free read for signal context. The closure may observe state
    /// mid-mutation and must tolerate that (bounded traversals only); a
    /// result is discarded unless the sequence held still across it.
    pub fn read_handler<R>(&self, mut f: impl FnMut(&T) -> R) -> Option<R> {
        for _ in 0..READ_RETRIES {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 != 0 {
                core::hint::spin_loop();
                continue;
            }
            let result = f(unsafe { &*self.data.get() });
            if self.seq.load(Ordering::Acquire) == before {
                return Some(result);
            }
        }
        None
    }
}
