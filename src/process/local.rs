//! The calling process on Linux.
//!
//! Regions come from `/proc/self/maps`. Call stubs run on a `std::thread`, and
//! the four helper routines are emulated with a thread-local last-error value
//! using the Windows calling convention the stubs expect.

use std::cell::Cell;
use std::fs;
use std::ptr;
use std::sync::OnceLock;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use libc::{
    MAP_ANONYMOUS, MAP_FAILED, MAP_FIXED_NOREPLACE, MAP_PRIVATE, PROT_EXEC, PROT_NONE, PROT_READ,
    PROT_WRITE, c_int, c_void,
};
use regex::Regex;
use tracing::{debug, trace};

use super::{
    AddressSpace, HelperRoutines, Protection, RegionInfo, RegionKind, RegionState, RemoteProcess,
};
use crate::alloc::Bound;
use crate::err::{Error, Result};

thread_local! {
    static LAST_ERROR: Cell<u32> = const { Cell::new(0) };
}

/// Sets the calling thread's emulated last-error value.
pub fn set_last_error(code: u32) {
    LAST_ERROR.with(|e| e.set(code));
}

/// Gets the calling thread's emulated last-error value.
pub fn get_last_error() -> u32 {
    LAST_ERROR.with(|e| e.get())
}

#[cfg(target_arch = "x86_64")]
mod shims {
    pub(super) extern "win64" fn get_last_error() -> u32 {
        super::get_last_error()
    }
    pub(super) extern "win64" fn set_last_error(code: u32) {
        super::set_last_error(code)
    }
    pub(super) extern "win64" fn is_debugger_present() -> i32 {
        0
    }
    pub(super) extern "win64" fn debug_break() {
        unsafe { libc::raise(libc::SIGTRAP) };
    }
    pub(super) type Entry = extern "win64" fn(usize) -> u32;
}

#[cfg(target_arch = "x86")]
mod shims {
    pub(super) extern "stdcall" fn get_last_error() -> u32 {
        super::get_last_error()
    }
    pub(super) extern "stdcall" fn set_last_error(code: u32) {
        super::set_last_error(code)
    }
    pub(super) extern "stdcall" fn is_debugger_present() -> i32 {
        0
    }
    pub(super) extern "stdcall" fn debug_break() {
        unsafe { libc::raise(libc::SIGTRAP) };
    }
    pub(super) type Entry = extern "stdcall" fn(usize) -> u32;
}

fn errno_error(op: &'static str) -> Error {
    Error::Os {
        op,
        code: std::io::Error::last_os_error().raw_os_error().unwrap_or(0) as u32,
    }
}

fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 0x1000,
    })
}

fn maps_regex() -> Result<&'static Regex> {
    static RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([0-9a-f]+)-([0-9a-f]+)\s+([r-])([w-])([x-])([ps])\s+[0-9a-f]+\s+\S+\s+(\d+)")
    })
    .as_ref()
    .map_err(|_| Error::InvalidParameter)
}

#[derive(Debug, Clone, Copy)]
struct Mapping {
    start: usize,
    end: usize,
    protect: Protection,
    kind: RegionKind,
}

fn to_prot(protect: Protection) -> c_int {
    let mut prot = PROT_NONE;
    if protect.is_readable() {
        prot |= PROT_READ;
    }
    if protect.is_writable() {
        prot |= PROT_WRITE;
    }
    if protect.is_executable() {
        prot |= PROT_EXEC;
        // executable-only pages are readable on x86
        prot |= PROT_READ;
    }
    prot
}

/// The current process, seen through the [`AddressSpace`] interface.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalProcess;

impl LocalProcess {
    /// Creates a handle to the current process.
    pub fn new() -> Self {
        Self
    }

    fn mappings(&self) -> Result<Vec<Mapping>> {
        let maps = fs::read_to_string("/proc/self/maps")?;
        let re = maps_regex()?;
        let mut ret = vec![];
        for line in maps.lines() {
            let Some(caps) = re.captures(line) else {
                continue;
            };
            let field = |i: usize| caps.get(i).map_or("", |m| m.as_str());
            let (Ok(start), Ok(end)) = (
                usize::from_str_radix(field(1), 16),
                usize::from_str_radix(field(2), 16),
            ) else {
                continue;
            };
            let protect = Protection::from_access(field(3) == "r", field(4) == "w", field(5) == "x");
            let kind = match (field(7) != "0", field(6)) {
                (false, _) => RegionKind::Private,
                (true, "p") => RegionKind::Image,
                (true, _) => RegionKind::Mapped,
            };
            ret.push(Mapping {
                start,
                end,
                protect,
                kind,
            });
        }
        Ok(ret)
    }

    /// Checks that `addr..addr + len` is mapped and every mapping allows `ok`.
    fn check_range(&self, addr: usize, len: usize, ok: fn(Protection) -> bool) -> Result<()> {
        let end = addr.checked_add(len).ok_or(Error::InvalidParameter)?;
        let mut cur = addr;
        for m in self.mappings()? {
            if cur >= end {
                break;
            }
            if m.end <= cur {
                continue;
            }
            if m.start > cur || !ok(m.protect) {
                break;
            }
            cur = m.end;
        }
        if cur >= end {
            Ok(())
        } else {
            Err(Error::Os {
                op: "access",
                code: libc::EFAULT as u32,
            })
        }
    }

    fn try_map_at(&self, addr: usize, size: usize, protect: Protection) -> Option<usize> {
        let mem = unsafe {
            libc::mmap(
                addr as *mut c_void,
                size,
                to_prot(protect),
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        if mem == MAP_FAILED {
            return None;
        }
        if mem as usize != addr {
            // kernels without MAP_FIXED_NOREPLACE treat the address as a hint
            unsafe { libc::munmap(mem, size) };
            return None;
        }
        Some(addr)
    }
}

impl AddressSpace for LocalProcess {
    fn query(&self, addr: usize) -> Result<RegionInfo> {
        let maps = self.mappings()?;
        let mut free_start = 0usize;
        for m in &maps {
            if addr < m.start {
                return Ok(RegionInfo {
                    base: free_start,
                    alloc_base: 0,
                    alloc_protect: Protection::empty(),
                    protect: Protection::NOACCESS,
                    size: m.start - free_start,
                    state: RegionState::Free,
                    kind: RegionKind::None,
                });
            }
            if addr < m.end {
                return Ok(RegionInfo {
                    base: m.start,
                    alloc_base: m.start,
                    alloc_protect: m.protect,
                    protect: m.protect,
                    size: m.end - m.start,
                    state: RegionState::Commit,
                    kind: m.kind,
                });
            }
            free_start = m.end;
        }
        let size = usize::MAX - free_start;
        if addr >= free_start + size {
            return Err(Error::Os {
                op: "query",
                code: libc::EINVAL as u32,
            });
        }
        Ok(RegionInfo {
            base: free_start,
            alloc_base: 0,
            alloc_protect: Protection::empty(),
            protect: Protection::NOACCESS,
            size,
            state: RegionState::Free,
            kind: RegionKind::None,
        })
    }

    fn read_raw(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        self.check_range(addr, buf.len(), Protection::is_readable)?;
        unsafe { ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    fn write_raw(&self, addr: usize, data: &[u8]) -> Result<()> {
        self.check_range(addr, data.len(), Protection::is_writable)?;
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len()) };
        Ok(())
    }

    fn protect(&self, addr: usize, len: usize, protect: Protection) -> Result<Protection> {
        let old = self.query(addr)?.protect;
        let page = page_size();
        let start = addr & !(page - 1);
        let end = (addr + len.max(1) + page - 1) & !(page - 1);
        let ret = unsafe { libc::mprotect(start as *mut c_void, end - start, to_prot(protect)) };
        if ret != 0 {
            return Err(errno_error("mprotect"));
        }
        trace!(start, end, ?old, new = ?protect, "mprotect");
        Ok(old)
    }

    fn alloc(&self, size: usize, protect: Protection) -> Result<usize> {
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                to_prot(protect),
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mem == MAP_FAILED {
            return Err(errno_error("mmap"));
        }
        Ok(mem as usize)
    }

    fn alloc_near(&self, hint: usize, size: usize, protect: Protection) -> Result<usize> {
        let page = page_size();
        let size = (size + page - 1) & !(page - 1);
        let bnd = Bound::new(hint as u64, size as u64);

        // candidate addresses at both edges of every gap, nearest first
        let maps = self.mappings()?;
        let mut candidates = vec![];
        let mut gap_start = page;
        for m in maps.iter().map(|m| (m.start, m.end)).chain([(usize::MAX, usize::MAX)]) {
            let gap_end = m.0;
            if gap_end > gap_start && gap_end - gap_start >= size {
                candidates.push(gap_start);
                candidates.push((gap_end - size) & !(page - 1));
            }
            gap_start = gap_start.max(m.1);
        }
        candidates.retain(|&c| c >= page && bnd.contains(c as u64));
        candidates.sort_by_key(|&c| c.abs_diff(hint));

        for addr in candidates {
            if let Some(mem) = self.try_map_at(addr, size, protect) {
                debug!(hint, addr = mem, size, "allocated near");
                return Ok(mem);
            }
        }
        Err(Error::Os {
            op: "mmap",
            code: libc::ENOMEM as u32,
        })
    }

    fn free(&self, addr: usize, size: usize) -> Result<()> {
        let page = page_size();
        let size = (size.max(1) + page - 1) & !(page - 1);
        if unsafe { libc::munmap(addr as *mut c_void, size) } != 0 {
            return Err(errno_error("munmap"));
        }
        Ok(())
    }

    fn flush_instruction_cache(&self, _addr: usize, _len: usize) -> Result<()> {
        // x86 keeps instruction fetch coherent with stores
        Ok(())
    }
}

impl RemoteProcess for LocalProcess {
    fn helper_routines(&self) -> Result<HelperRoutines> {
        Ok(HelperRoutines {
            get_last_error: shims::get_last_error as *const () as usize,
            set_last_error: shims::set_last_error as *const () as usize,
            is_debugger_present: shims::is_debugger_present as *const () as usize,
            debug_break: shims::debug_break as *const () as usize,
        })
    }

    fn run_thread(&self, entry: usize, param: usize, timeout: Option<Duration>) -> Result<u32> {
        let entry = unsafe { std::mem::transmute::<usize, shims::Entry>(entry) };
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("remotehook-stub".into())
            .spawn(move || {
                let code = entry(param);
                let _ = tx.send(code);
            })?;

        let code = match timeout {
            Some(t) => match rx.recv_timeout(t) {
                Ok(code) => code,
                Err(RecvTimeoutError::Timeout) => return Err(Error::RemoteTimeout(t)),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Os {
                        op: "thread",
                        code: libc::ECHILD as u32,
                    });
                }
            },
            None => rx.recv().map_err(|_| Error::Os {
                op: "thread",
                code: libc::ECHILD as u32,
            })?,
        };
        let _ = handle.join();
        Ok(code)
    }
}
