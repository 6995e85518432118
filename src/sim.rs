//! An in-memory address space for tests.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::Range;
use std::time::Duration;

use crate::err::{Error, Result};
use crate::process::{
    AddressSpace, HelperRoutines, Protection, RegionInfo, RegionKind, RegionState, RemoteProcess,
};

const ERROR_NOACCESS: u32 = 998;

struct Region {
    data: Vec<u8>,
    protect: Protection,
}

struct State {
    regions: BTreeMap<usize, Region>,
    next_alloc: usize,
    protect_calls: usize,
    flushes: Vec<(usize, usize)>,
    threads: Vec<usize>,
    hang_threads: bool,
}

pub(crate) struct SimSpace {
    state: RefCell<State>,
}

impl SimSpace {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(State {
                regions: BTreeMap::new(),
                next_alloc: 0x7000_0000,
                protect_calls: 0,
                flushes: vec![],
                threads: vec![],
                hang_threads: false,
            }),
        }
    }

    pub fn map(&self, base: usize, data: &[u8], protect: Protection) {
        self.state.borrow_mut().regions.insert(
            base,
            Region {
                data: data.to_vec(),
                protect,
            },
        );
    }

    pub fn set_next_alloc(&self, addr: usize) {
        self.state.borrow_mut().next_alloc = addr;
    }

    pub fn bytes(&self, addr: usize, len: usize) -> Vec<u8> {
        let state = self.state.borrow();
        let (base, region) = state
            .regions
            .range(..=addr)
            .next_back()
            .filter(|(base, r)| addr + len <= *base + r.data.len())
            .unwrap_or_else(|| panic!("{addr:#x} not mapped"));
        region.data[addr - base..addr - base + len].to_vec()
    }

    pub fn protection_at(&self, addr: usize) -> Protection {
        self.query(addr).unwrap().protect
    }

    pub fn is_mapped(&self, addr: usize) -> bool {
        self.query(addr).is_ok_and(|r| r.state == RegionState::Commit)
    }

    pub fn protect_calls(&self) -> usize {
        self.state.borrow().protect_calls
    }

    pub fn flushes(&self) -> Vec<(usize, usize)> {
        self.state.borrow().flushes.clone()
    }

    pub fn region_count(&self) -> usize {
        self.state.borrow().regions.len()
    }

    /// Makes every thread started from now on run past its timeout.
    pub fn hang_threads(&self) {
        self.state.borrow_mut().hang_threads = true;
    }

    /// Entry points of the threads started so far.
    pub fn threads(&self) -> Vec<usize> {
        self.state.borrow().threads.clone()
    }

    fn with_region<T>(
        &self,
        addr: usize,
        len: usize,
        f: impl FnOnce(&mut Region, usize) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.borrow_mut();
        let (base, region) = state
            .regions
            .range_mut(..=addr)
            .next_back()
            .filter(|(base, r)| addr + len <= **base + r.data.len())
            .ok_or(Error::Os {
                op: "access",
                code: ERROR_NOACCESS,
            })?;
        let off = addr - *base;
        f(region, off)
    }

    /// Runs `f` over each piece of `addr..addr + len`, which may span
    /// adjacent regions. `f` gets the region, the offset in it and the range
    /// of the caller's buffer.
    fn for_each_piece(
        &self,
        addr: usize,
        len: usize,
        mut f: impl FnMut(&mut Region, usize, Range<usize>) -> Result<()>,
    ) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let mut done = 0;
        while done < len {
            let cur = addr + done;
            let (base, region) = state
                .regions
                .range_mut(..=cur)
                .next_back()
                .filter(|(base, r)| cur < **base + r.data.len())
                .ok_or(Error::Os {
                    op: "access",
                    code: ERROR_NOACCESS,
                })?;
            let off = cur - *base;
            let n = (region.data.len() - off).min(len - done);
            f(region, off, done..done + n)?;
            done += n;
        }
        Ok(())
    }
}

impl AddressSpace for SimSpace {
    fn query(&self, addr: usize) -> Result<RegionInfo> {
        let state = self.state.borrow();
        let mut free_start = 0;
        for (&base, region) in &state.regions {
            let end = base + region.data.len();
            if addr < base {
                break;
            }
            if addr < end {
                return Ok(RegionInfo {
                    base,
                    alloc_base: base,
                    alloc_protect: region.protect,
                    protect: region.protect,
                    size: region.data.len(),
                    state: RegionState::Commit,
                    kind: RegionKind::Private,
                });
            }
            free_start = end;
        }
        let free_end = state
            .regions
            .range(addr..)
            .next()
            .map_or(usize::MAX, |(&base, _)| base);
        if addr >= free_end {
            return Err(Error::InvalidParameter);
        }
        Ok(RegionInfo {
            base: free_start,
            alloc_base: 0,
            alloc_protect: Protection::empty(),
            protect: Protection::NOACCESS,
            size: free_end - free_start,
            state: RegionState::Free,
            kind: RegionKind::None,
        })
    }

    fn read_raw(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        self.for_each_piece(addr, buf.len(), |r, off, piece| {
            if !r.protect.is_readable() || r.protect.is_guard() {
                return Err(Error::Os {
                    op: "ReadProcessMemory",
                    code: ERROR_NOACCESS,
                });
            }
            let n = piece.len();
            buf[piece].copy_from_slice(&r.data[off..off + n]);
            Ok(())
        })
    }

    fn write_raw(&self, addr: usize, data: &[u8]) -> Result<()> {
        self.for_each_piece(addr, data.len(), |r, off, piece| {
            if !r.protect.is_writable() || r.protect.is_guard() {
                return Err(Error::Os {
                    op: "WriteProcessMemory",
                    code: ERROR_NOACCESS,
                });
            }
            let n = piece.len();
            r.data[off..off + n].copy_from_slice(&data[piece]);
            Ok(())
        })
    }

    fn protect(&self, addr: usize, len: usize, protect: Protection) -> Result<Protection> {
        let old = self.with_region(addr, len, |r, _| {
            let old = r.protect;
            r.protect = protect;
            Ok(old)
        })?;
        self.state.borrow_mut().protect_calls += 1;
        Ok(old)
    }

    fn alloc(&self, size: usize, protect: Protection) -> Result<usize> {
        let base = {
            let mut state = self.state.borrow_mut();
            let base = state.next_alloc;
            state.next_alloc += ((size + 0xfff) & !0xfff) + 0x1000;
            base
        };
        self.map(base, &vec![0; size], protect);
        Ok(base)
    }

    fn free(&self, addr: usize, _size: usize) -> Result<()> {
        self.state
            .borrow_mut()
            .regions
            .remove(&addr)
            .map(|_| ())
            .ok_or(Error::InvalidParameter)
    }

    fn flush_instruction_cache(&self, addr: usize, len: usize) -> Result<()> {
        self.state.borrow_mut().flushes.push((addr, len));
        Ok(())
    }
}

/// Threads never execute anything; result buffers keep whatever was written.
impl RemoteProcess for SimSpace {
    fn helper_routines(&self) -> Result<HelperRoutines> {
        Ok(HelperRoutines {
            get_last_error: 0x7ff0_1000,
            set_last_error: 0x7ff0_2000,
            is_debugger_present: 0x7ff0_3000,
            debug_break: 0x7ff0_4000,
        })
    }

    fn run_thread(&self, entry: usize, _param: usize, timeout: Option<Duration>) -> Result<u32> {
        let mut state = self.state.borrow_mut();
        state.threads.push(entry);
        match (state.hang_threads, timeout) {
            (true, Some(timeout)) => Err(Error::RemoteTimeout(timeout)),
            _ => Ok(0),
        }
    }
}
