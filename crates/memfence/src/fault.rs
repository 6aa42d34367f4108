//! SIGSEGV/SIGBUS interception.
//!
//! Faults reach us three ways: a dereference of a protected shadow page
//! (dangling pointer), a dereference of a rewrite pointer (out of bounds),
//! or a stray access the checks never saw. The handler classifies the
//! faulting address, emits a report, and either aborts (strict mode) or
//! lets the program continue where that is meaningful.
//!
//! Signal context rules: everything called from here is async-signal-safe
//! (`write`, `mprotect`, `sigaction`, `abort`), and all metadata reads go
//! through the lock-free sequence-validated lookups. No mutex is ever
//! taken.

use crate::debugmeta;
use crate::oob;
use crate::paging;
use crate::report::{self, Violation, ViolationKind};
use crate::util::UNINIT_UPPER;
use core::mem;

/// Install the handler for SIGSEGV and SIGBUS.
pub fn install() {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = fault_handler
            as unsafe extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void)
            as usize;
        sa.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(libc::SIGSEGV, &sa, core::ptr::null_mut()) == -1 {
            report::abort_with_message("memfence: SIGSEGV handler installation failed\n");
        }
        if libc::sigaction(libc::SIGBUS, &sa, core::ptr::null_mut()) == -1 {
            report::abort_with_message("memfence: SIGBUS handler installation failed\n");
        }
    }
}

/// Restore the default disposition. A fault while we run the handler must
/// terminate the process instead of recursing.
unsafe fn disarm() {
    let mut sa: libc::sigaction = mem::zeroed();
    sa.sa_sigaction = libc::SIG_DFL;
    libc::sigemptyset(&mut sa.sa_mask);
    libc::sigaction(libc::SIGSEGV, &sa, core::ptr::null_mut());
    libc::sigaction(libc::SIGBUS, &sa, core::ptr::null_mut());
}

/// The program counter at which a fault was taken, from the signal
/// context. 0 when the platform layout is unknown.
unsafe fn program_counter(context: *mut libc::c_void) -> usize {
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        if context.is_null() {
            return 0;
        }
        let uc = context as *const libc::ucontext_t;
        return (*uc).uc_mcontext.gregs[libc::REG_RIP as usize] as usize;
    }
    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    {
        if context.is_null() {
            return 0;
        }
        let uc = context as *const libc::ucontext_t;
        return (*uc).uc_mcontext.pc as usize;
    }
    #[allow(unreachable_code)]
    {
        let _ = context;
        0
    }
}

unsafe extern "C" fn fault_handler(
    _sig: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    disarm();

    #[cfg(target_os = "linux")]
    let fault_addr = if info.is_null() {
        0
    } else {
        (*info).si_addr() as usize
    };
    #[cfg(not(target_os = "linux"))]
    let fault_addr = if info.is_null() {
        0
    } else {
        (*info).si_addr as usize
    };
    let pc = program_counter(context);

    // A fault in the zero page means the program dereferenced a pointer
    // that was never initialized.
    if fault_addr < UNINIT_UPPER {
        let v = Violation::new(ViolationKind::Uninitialized, pc, fault_addr);
        report::emit(&v);
        return;
    }

    // A fault in the rewrite region is a dereference of a pointer that a
    // bounds check already diagnosed as out of bounds.
    if oob::contains(fault_addr) {
        let mut v = Violation::new(ViolationKind::OutOfBounds, pc, fault_addr);
        if let Some(rec) = oob::global_lookup_handler(fault_addr) {
            v.intended = Some(rec.intended);
            v.object = Some((rec.obj_start, rec.obj_len));
        }
        report::emit(&v);
        return;
    }

    // A fault inside a tracked shadow range is a dangling-pointer access
    // if the object has been freed.
    if let Some((start, len, meta_id)) = debugmeta::dangling_lookup_handler(fault_addr) {
        let meta = debugmeta::snapshot(meta_id);
        if let Some(meta) = meta {
            if meta.free_id != 0 {
                // Unprotect first so the program can continue past the
                // report in warn-and-continue mode.
                paging::unprotect_range(start, len);
                let mut v = Violation::new(ViolationKind::Dangling, pc, fault_addr);
                v.object = Some((start, len));
                v.meta = Some(meta);
                report::emit(&v);
                // The access can now succeed; rearm for the next fault.
                install();
                return;
            }
        }
        let mut v = Violation::new(ViolationKind::LoadStore, pc, fault_addr);
        v.object = Some((start, len));
        v.meta = meta;
        report::emit(&v);
        return;
    }

    // No metadata anywhere: report what little we know. The default
    // disposition stays in place, so if the program retries the access it
    // terminates instead of looping through the handler.
    let v = Violation::new(ViolationKind::Unknown, pc, fault_addr);
    report::emit(&v);
}
