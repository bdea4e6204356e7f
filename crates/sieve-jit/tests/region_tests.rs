//! Protection lifecycle of code regions

#![cfg(target_os = "linux")]

use sieve_jit::{LockedRegion, WritableRegion, jit_memory_in_use};

fn locked_region() -> LockedRegion {
    let mut region =
        WritableRegion::alloc(64, 8, |bytes| bytes.fill(0xcc), usize::MAX, false).expect("alloc");
    region.image_mut()[0] = 0x90;
    region.lock(1).expect("lock")
}

#[test]
fn write_to_locked_region_faults() {
    let region = locked_region();
    let target = region.image_addr() as *mut u8;

    // SAFETY: the child only performs the faulting write and exits.
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        unsafe {
            std::ptr::write_volatile(target, 0);
            libc::_exit(0);
        }
    }

    let mut status = 0;
    // SAFETY: `pid` is our child.
    let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(rc, pid);
    assert!(libc::WIFSIGNALED(status), "child wrote to a locked region");
    assert_eq!(libc::WTERMSIG(status), libc::SIGSEGV);
    assert_eq!(region.image(), &[0x90]);
}

#[test]
fn region_memory_is_accounted() {
    let region = locked_region();
    assert!(jit_memory_in_use() >= region.size());
}
