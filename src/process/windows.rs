use core::ffi::c_void;
use std::ffi::{CString, OsStr, OsString};
use std::mem::{MaybeUninit, size_of};
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::ptr::{null, null_mut};
use std::time::Duration;

use tracing::{debug, trace};
use windows_sys::Win32::Foundation::{
    CloseHandle, DUPLICATE_SAME_ACCESS, DuplicateHandle, ERROR_BAD_LENGTH,
    ERROR_INVALID_PARAMETER, FALSE, GetLastError, HANDLE, HMODULE, INVALID_HANDLE_VALUE,
    WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::System::Diagnostics::Debug::{
    FlushInstructionCache, ReadProcessMemory, WriteProcessMemory,
};
use windows_sys::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, MODULEENTRY32W, Module32FirstW, Module32NextW, PROCESSENTRY32W,
    Process32FirstW, Process32NextW, TH32CS_SNAPMODULE, TH32CS_SNAPMODULE32, TH32CS_SNAPPROCESS,
};
use windows_sys::Win32::System::LibraryLoader::{
    DONT_RESOLVE_DLL_REFERENCES, FreeLibrary, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
    GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT, GetModuleFileNameW, GetModuleHandleExW,
    GetModuleHandleW, GetProcAddress, LoadLibraryExW,
};
use windows_sys::Win32::System::Memory::{
    MEM_COMMIT, MEM_FREE, MEM_IMAGE, MEM_MAPPED, MEM_PRIVATE, MEM_RELEASE, MEM_RESERVE,
    MEMORY_BASIC_INFORMATION, VirtualAllocEx, VirtualFreeEx, VirtualProtectEx, VirtualQueryEx,
};
use windows_sys::Win32::System::Threading::{
    CreateRemoteThread, GetCurrentProcess, GetCurrentProcessId, GetExitCodeThread, INFINITE,
    OpenProcess, PROCESS_ALL_ACCESS, WaitForSingleObject,
};

use super::{
    AddressSpace, HelperRoutines, Protection, RegionInfo, RegionKind, RegionState, RemoteProcess,
};
use crate::alloc::Bound;
use crate::err::{Error, Result};

const ALLOCATION_GRANULARITY: u64 = 0x1_0000;

fn os_error(op: &'static str) -> Error {
    Error::Os {
        op,
        code: unsafe { GetLastError() },
    }
}

pub(crate) fn to_wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(Some(0)).collect()
}

fn from_wide(buf: &[u16]) -> OsString {
    let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    OsString::from_wide(&buf[..len])
}

struct Handle(HANDLE);

// Kernel handles may be used from any thread.
unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.0.is_null() && self.0 != INVALID_HANDLE_VALUE {
            unsafe { CloseHandle(self.0) };
        }
    }
}

/// A module loaded in a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleEntry {
    /// Load address, also the module handle
    pub base: usize,
    /// Size of the image in bytes
    pub size: usize,
    /// File name
    pub name: String,
    /// Full path
    pub path: PathBuf,
}

/// A running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    /// Process id
    pub pid: u32,
    /// Executable file name
    pub name: String,
}

/// Lists the processes running on the system.
pub fn processes() -> Result<Vec<ProcessEntry>> {
    let snapshot = Handle(unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) });
    if snapshot.0 == INVALID_HANDLE_VALUE {
        return Err(os_error("CreateToolhelp32Snapshot"));
    }
    let mut entry = PROCESSENTRY32W {
        dwSize: size_of::<PROCESSENTRY32W>() as u32,
        ..Default::default()
    };
    let mut ret = vec![];
    if unsafe { Process32FirstW(snapshot.0, &mut entry) } == FALSE {
        return Err(os_error("Process32FirstW"));
    }
    loop {
        ret.push(ProcessEntry {
            pid: entry.th32ProcessID,
            name: from_wide(&entry.szExeFile).to_string_lossy().into_owned(),
        });
        if unsafe { Process32NextW(snapshot.0, &mut entry) } == FALSE {
            break;
        }
    }
    Ok(ret)
}

/// A process opened with full access.
///
/// The handle is closed on drop; [`Process::try_clone`] duplicates it.
pub struct Process {
    handle: Handle,
    pid: u32,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process").field("pid", &self.pid).finish()
    }
}

enum NearQuery {
    Success(u64),
    NotUsable(u64, u64),
    OverLimit,
    Fail(u32),
}

impl Process {
    /// Opens the process `pid`.
    pub fn open(pid: u32) -> Result<Self> {
        let handle = unsafe { OpenProcess(PROCESS_ALL_ACCESS, FALSE, pid) };
        if handle.is_null() {
            return Err(os_error("OpenProcess"));
        }
        debug!(pid, "opened process");
        Ok(Self {
            handle: Handle(handle),
            pid,
        })
    }

    /// Opens the calling process.
    pub fn current() -> Result<Self> {
        Self::open(unsafe { GetCurrentProcessId() })
    }

    /// Process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Duplicates the handle; both copies are closed independently.
    pub fn try_clone(&self) -> Result<Self> {
        let mut new_handle: HANDLE = null_mut();
        let ok = unsafe {
            DuplicateHandle(
                GetCurrentProcess(),
                self.handle.0,
                GetCurrentProcess(),
                &mut new_handle,
                0,
                FALSE,
                DUPLICATE_SAME_ACCESS,
            )
        };
        if ok == FALSE {
            return Err(os_error("DuplicateHandle"));
        }
        Ok(Self {
            handle: Handle(new_handle),
            pid: self.pid,
        })
    }

    /// Lists the modules loaded in the process.
    pub fn modules(&self) -> Result<Vec<ModuleEntry>> {
        let snapshot = loop {
            let h = unsafe {
                CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, self.pid)
            };
            if h != INVALID_HANDLE_VALUE {
                break Handle(h);
            }
            // the loader list is being modified, try again
            if unsafe { GetLastError() } != ERROR_BAD_LENGTH {
                return Err(os_error("CreateToolhelp32Snapshot"));
            }
        };

        let mut entry = MODULEENTRY32W {
            dwSize: size_of::<MODULEENTRY32W>() as u32,
            ..Default::default()
        };
        let mut ret = vec![];
        if unsafe { Module32FirstW(snapshot.0, &mut entry) } == FALSE {
            return Err(os_error("Module32FirstW"));
        }
        loop {
            ret.push(ModuleEntry {
                base: entry.modBaseAddr as usize,
                size: entry.modBaseSize as usize,
                name: from_wide(&entry.szModule).to_string_lossy().into_owned(),
                path: PathBuf::from(from_wide(&entry.szExePath)),
            });
            if unsafe { Module32NextW(snapshot.0, &mut entry) } == FALSE {
                break;
            }
        }
        Ok(ret)
    }

    /// Finds a module by file name or full path, case-insensitively.
    pub fn find_module(&self, name: &str) -> Result<ModuleEntry> {
        self.modules()?
            .into_iter()
            .find(|m| {
                m.name.eq_ignore_ascii_case(name)
                    || m.path.to_string_lossy().eq_ignore_ascii_case(name)
            })
            .ok_or_else(|| Error::ModuleNotFound(name.to_owned()))
    }

    /// Finds the module loaded at `base`.
    pub fn module_by_base(&self, base: usize) -> Result<ModuleEntry> {
        self.modules()?
            .into_iter()
            .find(|m| m.base == base)
            .ok_or_else(|| Error::ModuleNotFound(format!("{base:#x}")))
    }

    /// Resolves `export` of the module named `module` inside the process.
    pub fn proc_address(&self, module: &str, export: &str) -> Result<usize> {
        let entry = self.find_module(module)?;
        self.export_address(&entry, export)
    }

    /// Resolves `export` of a module of this process.
    ///
    /// The module is mapped locally to compute the export's RVA, following
    /// forwarders to the module that really implements it.
    pub fn export_address(&self, module: &ModuleEntry, export: &str) -> Result<usize> {
        let (owner, rva) = local_export_rva(&module.path, export)?;
        let base = if owner.eq_ignore_ascii_case(&module.name) {
            module.base
        } else {
            self.find_module(&owner)?.base
        };
        trace!(module = %module.name, export, owner, rva, "resolved export");
        Ok(base + rva)
    }

    fn query_and_alloc(&self, addr: u64, size: u64, protect: Protection, high: bool) -> NearQuery {
        let mut mbi = MaybeUninit::<MEMORY_BASIC_INFORMATION>::zeroed();
        let ret = unsafe {
            VirtualQueryEx(
                self.handle.0,
                addr as usize as *const c_void,
                mbi.as_mut_ptr(),
                size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if ret == 0 {
            let last_err = unsafe { GetLastError() };
            // the address is above the highest accessible address
            return if last_err == ERROR_INVALID_PARAMETER {
                NearQuery::OverLimit
            } else {
                NearQuery::Fail(last_err)
            };
        }
        let mbi = unsafe { mbi.assume_init() };
        let base = mbi.BaseAddress as usize as u64;
        let region_size = mbi.RegionSize as u64;
        if mbi.State != MEM_FREE {
            return NearQuery::NotUsable(base, region_size);
        }
        let end = base + region_size;
        let candidate = if high {
            end.saturating_sub(size) & !(ALLOCATION_GRANULARITY - 1)
        } else {
            (base + ALLOCATION_GRANULARITY - 1) & !(ALLOCATION_GRANULARITY - 1)
        };
        if candidate < base || candidate + size > end {
            return NearQuery::NotUsable(base, region_size);
        }
        let mem = unsafe {
            VirtualAllocEx(
                self.handle.0,
                candidate as usize as *const c_void,
                size as usize,
                MEM_COMMIT | MEM_RESERVE,
                protect.bits(),
            )
        };
        if mem.is_null() {
            NearQuery::NotUsable(base, region_size)
        } else {
            NearQuery::Success(mem as usize as u64)
        }
    }
}

struct LibraryGuard(HMODULE);

impl Drop for LibraryGuard {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { FreeLibrary(self.0) };
        }
    }
}

fn module_file_name(module: HMODULE) -> Result<String> {
    let mut buf = vec![0u16; 1024];
    let len = unsafe { GetModuleFileNameW(module, buf.as_mut_ptr(), buf.len() as u32) };
    if len == 0 {
        return Err(os_error("GetModuleFileNameW"));
    }
    let path = PathBuf::from(OsString::from_wide(&buf[..len as usize]));
    Ok(path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default())
}

fn local_export_rva(path: &Path, export: &str) -> Result<(String, usize)> {
    let wide = to_wide(path.as_os_str());
    let mut module = unsafe { GetModuleHandleW(wide.as_ptr()) };
    let mut _unload = LibraryGuard(null_mut());
    if module.is_null() {
        module = unsafe { LoadLibraryExW(wide.as_ptr(), null_mut(), DONT_RESOLVE_DLL_REFERENCES) };
        if module.is_null() {
            return Err(os_error("LoadLibraryExW"));
        }
        _unload = LibraryGuard(module);
    }

    let name = CString::new(export).map_err(|_| Error::InvalidParameter)?;
    let proc = unsafe { GetProcAddress(module, name.as_ptr().cast()) }
        .ok_or_else(|| Error::ExportNotFound(export.to_owned()))?;
    let addr = proc as usize;

    let mut owner: HMODULE = null_mut();
    let ok = unsafe {
        GetModuleHandleExW(
            GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
            addr as *const u16,
            &mut owner,
        )
    };
    if ok == FALSE {
        return Err(os_error("GetModuleHandleExW"));
    }
    Ok((module_file_name(owner)?, addr - owner as usize))
}

impl AddressSpace for Process {
    fn query(&self, addr: usize) -> Result<RegionInfo> {
        let mut mbi = MaybeUninit::<MEMORY_BASIC_INFORMATION>::zeroed();
        let ret = unsafe {
            VirtualQueryEx(
                self.handle.0,
                addr as *const c_void,
                mbi.as_mut_ptr(),
                size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if ret == 0 {
            return Err(os_error("VirtualQueryEx"));
        }
        let mbi = unsafe { mbi.assume_init() };
        let state = match mbi.State {
            MEM_COMMIT => RegionState::Commit,
            MEM_RESERVE => RegionState::Reserve,
            _ => RegionState::Free,
        };
        let kind = match mbi.Type {
            MEM_IMAGE => RegionKind::Image,
            MEM_MAPPED => RegionKind::Mapped,
            MEM_PRIVATE => RegionKind::Private,
            _ => RegionKind::None,
        };
        Ok(RegionInfo {
            base: mbi.BaseAddress as usize,
            alloc_base: mbi.AllocationBase as usize,
            alloc_protect: Protection::from_bits_truncate(mbi.AllocationProtect),
            protect: Protection::from_bits_truncate(mbi.Protect),
            size: mbi.RegionSize,
            state,
            kind,
        })
    }

    fn read_raw(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        let mut read = 0usize;
        let ok = unsafe {
            ReadProcessMemory(
                self.handle.0,
                addr as *const c_void,
                buf.as_mut_ptr().cast(),
                buf.len(),
                &mut read,
            )
        };
        if ok == FALSE || read != buf.len() {
            return Err(os_error("ReadProcessMemory"));
        }
        Ok(())
    }

    fn write_raw(&self, addr: usize, data: &[u8]) -> Result<()> {
        let mut written = 0usize;
        let ok = unsafe {
            WriteProcessMemory(
                self.handle.0,
                addr as *const c_void,
                data.as_ptr().cast(),
                data.len(),
                &mut written,
            )
        };
        if ok == FALSE || written != data.len() {
            return Err(os_error("WriteProcessMemory"));
        }
        Ok(())
    }

    fn protect(&self, addr: usize, len: usize, protect: Protection) -> Result<Protection> {
        let mut old = 0u32;
        let ok = unsafe {
            VirtualProtectEx(
                self.handle.0,
                addr as *const c_void,
                len,
                protect.bits(),
                &mut old,
            )
        };
        if ok == FALSE {
            return Err(os_error("VirtualProtectEx"));
        }
        Ok(Protection::from_bits_truncate(old))
    }

    fn alloc(&self, size: usize, protect: Protection) -> Result<usize> {
        let mem = unsafe {
            VirtualAllocEx(
                self.handle.0,
                null(),
                size,
                MEM_COMMIT | MEM_RESERVE,
                protect.bits(),
            )
        };
        if mem.is_null() {
            return Err(os_error("VirtualAllocEx"));
        }
        Ok(mem as usize)
    }

    fn alloc_near(&self, hint: usize, size: usize, protect: Protection) -> Result<usize> {
        let bnd = Bound::new(hint as u64, size as u64);
        let size = size as u64;
        let mut cur_addr = bnd.middle();
        while cur_addr < bnd.max {
            match self.query_and_alloc(cur_addr, size, protect, false) {
                NearQuery::Success(addr) if bnd.contains(addr) => return Ok(addr as usize),
                NearQuery::Success(addr) => {
                    self.free(addr as usize, size as usize)?;
                    break;
                }
                NearQuery::NotUsable(base, region_size) => {
                    cur_addr = base + if region_size > 0 { region_size } else { 4096 };
                }
                NearQuery::OverLimit => break,
                NearQuery::Fail(code) => {
                    return Err(Error::Os {
                        op: "VirtualQueryEx",
                        code,
                    });
                }
            }
        }
        cur_addr = bnd.middle();
        while cur_addr > bnd.min {
            match self.query_and_alloc(cur_addr, size, protect, true) {
                NearQuery::Success(addr) if bnd.contains(addr) => return Ok(addr as usize),
                NearQuery::Success(addr) => {
                    self.free(addr as usize, size as usize)?;
                    break;
                }
                NearQuery::NotUsable(base, _) => {
                    cur_addr = base.saturating_sub(1);
                }
                NearQuery::OverLimit => break,
                NearQuery::Fail(code) => {
                    return Err(Error::Os {
                        op: "VirtualQueryEx",
                        code,
                    });
                }
            }
        }
        Err(Error::Os {
            op: "VirtualAllocEx",
            code: windows_sys::Win32::Foundation::ERROR_NOT_ENOUGH_MEMORY,
        })
    }

    fn free(&self, addr: usize, _size: usize) -> Result<()> {
        let ok = unsafe { VirtualFreeEx(self.handle.0, addr as *mut c_void, 0, MEM_RELEASE) };
        if ok == FALSE {
            return Err(os_error("VirtualFreeEx"));
        }
        Ok(())
    }

    fn flush_instruction_cache(&self, addr: usize, len: usize) -> Result<()> {
        let ok = unsafe { FlushInstructionCache(self.handle.0, addr as *const c_void, len) };
        if ok == FALSE {
            return Err(os_error("FlushInstructionCache"));
        }
        Ok(())
    }
}

impl RemoteProcess for Process {
    fn helper_routines(&self) -> Result<HelperRoutines> {
        let kernel32 = self.find_module("kernel32.dll")?;
        Ok(HelperRoutines {
            get_last_error: self.export_address(&kernel32, "GetLastError")?,
            set_last_error: self.export_address(&kernel32, "SetLastError")?,
            is_debugger_present: self.export_address(&kernel32, "IsDebuggerPresent")?,
            debug_break: self.export_address(&kernel32, "DebugBreak")?,
        })
    }

    fn run_thread(&self, entry: usize, param: usize, timeout: Option<Duration>) -> Result<u32> {
        let start = unsafe {
            std::mem::transmute::<usize, unsafe extern "system" fn(*mut c_void) -> u32>(entry)
        };
        let thread = unsafe {
            CreateRemoteThread(
                self.handle.0,
                null(),
                0,
                Some(start),
                param as *const c_void,
                0,
                null_mut(),
            )
        };
        if thread.is_null() {
            return Err(os_error("CreateRemoteThread"));
        }
        let thread = Handle(thread);

        let millis = timeout.map_or(INFINITE, |t| {
            u32::try_from(t.as_millis()).unwrap_or(INFINITE - 1)
        });
        match unsafe { WaitForSingleObject(thread.0, millis) } {
            WAIT_OBJECT_0 => {}
            WAIT_TIMEOUT => return Err(Error::RemoteTimeout(timeout.unwrap_or_default())),
            _ => return Err(os_error("WaitForSingleObject")),
        }

        let mut code = 0u32;
        if unsafe { GetExitCodeThread(thread.0, &mut code) } == FALSE {
            return Err(os_error("GetExitCodeThread"));
        }
        Ok(code)
    }
}
