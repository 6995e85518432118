//! Address-space and remote-thread primitives.
//!
//! [`AddressSpace`] is the raw surface a backend has to provide. The
//! protection-aware accessors built on top of it live in [`crate::memory`].

use std::time::Duration;

use bitflags::bitflags;

use crate::err::Result;

#[cfg(all(unix, target_os = "linux"))]
mod local;
#[cfg(windows)]
mod windows;

#[cfg(all(unix, target_os = "linux"))]
pub use local::{LocalProcess, get_last_error, set_last_error};
#[cfg(windows)]
pub(crate) use windows::to_wide;
#[cfg(windows)]
pub use windows::{ModuleEntry, Process, ProcessEntry, processes};

bitflags! {
    /// Page protection. Values follow the Windows `PAGE_*` constants.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        /// No access
        const NOACCESS = 0x01;
        /// Read only
        const READONLY = 0x02;
        /// Read and write
        const READWRITE = 0x04;
        /// Copy-on-write
        const WRITECOPY = 0x08;
        /// Execute only
        const EXECUTE = 0x10;
        /// Execute and read
        const EXECUTE_READ = 0x20;
        /// Execute, read and write
        const EXECUTE_READWRITE = 0x40;
        /// Execute and copy-on-write
        const EXECUTE_WRITECOPY = 0x80;
        /// Guard page modifier
        const GUARD = 0x100;
        /// Non-cached modifier
        const NOCACHE = 0x200;
        /// Write-combined modifier
        const WRITECOMBINE = 0x400;
    }
}

impl Protection {
    /// Whether the protection allows reading.
    pub fn is_readable(self) -> bool {
        self.intersects(
            Self::READONLY
                | Self::READWRITE
                | Self::WRITECOPY
                | Self::EXECUTE_READ
                | Self::EXECUTE_READWRITE
                | Self::EXECUTE_WRITECOPY,
        )
    }

    /// Whether the protection allows writing.
    pub fn is_writable(self) -> bool {
        self.intersects(
            Self::READWRITE | Self::WRITECOPY | Self::EXECUTE_READWRITE | Self::EXECUTE_WRITECOPY,
        )
    }

    /// Whether the protection allows executing.
    pub fn is_executable(self) -> bool {
        self.intersects(
            Self::EXECUTE | Self::EXECUTE_READ | Self::EXECUTE_READWRITE | Self::EXECUTE_WRITECOPY,
        )
    }

    /// Whether the guard modifier is set.
    pub fn is_guard(self) -> bool {
        self.contains(Self::GUARD)
    }

    /// Builds the protection from separate access bits.
    pub fn from_access(read: bool, write: bool, execute: bool) -> Self {
        match (read, write, execute) {
            (false, false, false) => Self::NOACCESS,
            (true, false, false) => Self::READONLY,
            (_, true, false) => Self::READWRITE,
            (false, false, true) => Self::EXECUTE,
            (true, false, true) => Self::EXECUTE_READ,
            (_, true, true) => Self::EXECUTE_READWRITE,
        }
    }
}

/// Allocation state of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    /// Backed by memory
    Commit,
    /// Reserved, not backed
    Reserve,
    /// Not allocated
    Free,
}

/// What backs a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Mapped view of an executable image
    Image,
    /// Mapped view of a section or file
    Mapped,
    /// Private memory
    Private,
    /// Free region
    None,
}

/// Descriptor returned by [`AddressSpace::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    /// Base of the region containing the queried address
    pub base: usize,
    /// Base of the allocation the region belongs to
    pub alloc_base: usize,
    /// Protection the allocation was created with
    pub alloc_protect: Protection,
    /// Current protection
    pub protect: Protection,
    /// Size of the region in bytes
    pub size: usize,
    /// Allocation state
    pub state: RegionState,
    /// Backing kind
    pub kind: RegionKind,
}

impl RegionInfo {
    /// One past the last byte of the region.
    pub fn end(&self) -> usize {
        self.base.saturating_add(self.size)
    }

    /// Whether `addr` lies inside the region.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }
}

/// Raw memory primitives of a process.
///
/// `read_raw`/`write_raw` don't touch page protection; use [`crate::memory::read`]
/// and [`crate::memory::write`] to get the protection handling.
pub trait AddressSpace {
    /// Describes the region containing `addr`.
    fn query(&self, addr: usize) -> Result<RegionInfo>;

    /// Reads exactly `buf.len()` bytes.
    fn read_raw(&self, addr: usize, buf: &mut [u8]) -> Result<()>;

    /// Writes all of `data`.
    fn write_raw(&self, addr: usize, data: &[u8]) -> Result<()>;

    /// Changes the protection of the pages covering `addr..addr + len` and
    /// returns the previous protection.
    fn protect(&self, addr: usize, len: usize, protect: Protection) -> Result<Protection>;

    /// Allocates `size` bytes of committed memory.
    fn alloc(&self, size: usize, protect: Protection) -> Result<usize>;

    /// Allocates `size` bytes within a rel32 displacement of `hint`.
    ///
    /// The default implementation ignores the hint.
    fn alloc_near(&self, hint: usize, size: usize, protect: Protection) -> Result<usize> {
        let _ = hint;
        self.alloc(size, protect)
    }

    /// Releases memory returned by `alloc` or `alloc_near`.
    fn free(&self, addr: usize, size: usize) -> Result<()>;

    /// Flushes the instruction cache over the range.
    fn flush_instruction_cache(&self, addr: usize, len: usize) -> Result<()>;
}

/// Addresses of the helper routines used by generated call stubs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelperRoutines {
    /// `GetLastError`
    pub get_last_error: usize,
    /// `SetLastError`
    pub set_last_error: usize,
    /// `IsDebuggerPresent`
    pub is_debugger_present: usize,
    /// `DebugBreak`
    pub debug_break: usize,
}

/// A process that can run code on a fresh thread.
pub trait RemoteProcess: AddressSpace {
    /// Resolves the helper routines inside the process.
    fn helper_routines(&self) -> Result<HelperRoutines>;

    /// Starts a thread at `entry` with `param` and waits for it.
    ///
    /// Returns the thread's exit code. `None` waits forever.
    fn run_thread(&self, entry: usize, param: usize, timeout: Option<Duration>) -> Result<u32>;
}

/// Iterator over every region of an address space, from address 0 upward.
pub struct Regions<'a, S: AddressSpace + ?Sized> {
    space: &'a S,
    next: Option<usize>,
}

/// Enumerates the regions of `space`.
///
/// Iteration stops at the first address the backend can't query, which is
/// the end of the user address space.
pub fn regions<S: AddressSpace + ?Sized>(space: &S) -> Regions<'_, S> {
    Regions {
        space,
        next: Some(0),
    }
}

impl<S: AddressSpace + ?Sized> Iterator for Regions<'_, S> {
    type Item = RegionInfo;

    fn next(&mut self) -> Option<RegionInfo> {
        let addr = self.next?;
        match self.space.query(addr) {
            Ok(info) if info.size > 0 => {
                self.next = info.base.checked_add(info.size);
                Some(info)
            }
            _ => {
                self.next = None;
                None
            }
        }
    }
}
