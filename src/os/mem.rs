use std::sync::LazyLock;

use libc::{c_void, iovec, pid_t, EFAULT, EINVAL, ENOMEM, EPERM, ESRCH};
use log::{debug, warn};

use crate::mem::{range_end, AccessError, AccessFault, MemoryReader};

static PAGE_SIZE: LazyLock<u64> = LazyLock::new(|| page_size::get() as u64);

/// `UIO_MAXIOV`: the kernel rejects calls with more remote iovecs than this
const MAX_IOVECS: usize = 1024;

fn errno() -> i32 {
    // SAFETY: `__errno_location()` always returns a valid thread-local pointer
    unsafe { *libc::__errno_location() }
}

fn errno_name(errno: i32) -> &'static str {
    match errno {
        EFAULT => "EFAULT",
        EINVAL => "EINVAL",
        ENOMEM => "ENOMEM",
        EPERM => "EPERM",
        ESRCH => "ESRCH",
        _ => "unknown",
    }
}

/// The address space of a live process, read with `process_vm_readv()`.
///
/// Nothing is stopped or frozen; every read sees whatever the target has in
/// memory at that instant.
pub struct ProcessMemory {
    pid: pid_t,
}

impl ProcessMemory {
    /// Check that `pid` exists and that we may signal it, which is the same
    /// permission check `process_vm_readv()` makes.
    pub fn attach(pid: pid_t) -> Result<Self, std::io::Error> {
        // SAFETY: signal 0 performs only the existence and permission checks
        if unsafe { libc::kill(pid, 0) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        debug!("attached to pid {pid}");
        Ok(Self { pid })
    }

    pub const fn pid(&self) -> pid_t {
        self.pid
    }

    #[cold]
    fn os_error(&self, address: u64, len: usize, errno: i32) -> AccessError {
        let errno = errno_name(errno);
        warn!("process_vm_readv(pid {}) at {address:#x} failed: {errno}", self.pid);
        AccessError::new(address, len, AccessFault::Os { errno })
    }

    /// One `process_vm_readv()` call for at most [`MAX_IOVECS`] pieces that
    /// together cover exactly `buf`. Returns the bytes transferred.
    fn read_batch(&self, buf: &mut [u8], pieces: &[(u64, usize)]) -> Result<usize, i32> {
        let local = iovec {
            iov_base: buf.as_mut_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
        let remote: Vec<iovec> = pieces
            .iter()
            .map(|&(base, len)| iovec {
                iov_base: base as *mut c_void,
                iov_len: len,
            })
            .collect();

        // SAFETY:
        // - `local` describes exactly `buf`, which we hold mutably
        // - `remote` addresses are never dereferenced in our address space
        let read = unsafe {
            libc::process_vm_readv(
                self.pid,
                &local,
                1,
                remote.as_ptr(),
                remote.len() as _,
                0,
            )
        };
        if read < 0 {
            Err(errno())
        } else {
            Ok(read as usize)
        }
    }
}

/// Split `address..address + len` into page-bounded pieces, so a partial
/// transfer stops exactly at the first unreadable page.
fn page_iovecs(address: u64, len: usize, page: u64) -> Vec<(u64, usize)> {
    let mut out = Vec::new();
    let mut cur = address;
    let end = address + len as u64;
    while cur < end {
        let next_page = (cur / page + 1).saturating_mul(page);
        let piece_end = next_page.min(end);
        out.push((cur, (piece_end - cur) as usize));
        cur = piece_end;
    }
    out
}

impl MemoryReader for ProcessMemory {
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), AccessError> {
        range_end(address, buf.len())?;
        let len = buf.len();
        let pieces = page_iovecs(address, len, *PAGE_SIZE);

        let mut done = 0;
        for batch in pieces.chunks(MAX_IOVECS) {
            let batch_len: usize = batch.iter().map(|&(_, n)| n).sum();
            match self.read_batch(&mut buf[done..done + batch_len], batch) {
                Ok(read) if read == batch_len => done += read,
                Ok(read) => {
                    return Err(AccessError::new(
                        address,
                        len,
                        AccessFault::Short { read: done + read },
                    ))
                }
                // the batch's first page is not mapped
                Err(EFAULT) if done == 0 => return Err(AccessError::unmapped(address, len)),
                Err(EFAULT) => {
                    return Err(AccessError::new(address, len, AccessFault::Short { read: done }))
                }
                Err(errno) => return Err(self.os_error(address, len, errno)),
            }
        }
        Ok(())
    }
}
