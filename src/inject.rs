//! Loading modules into another process and calling their exports.

use std::io;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use tracing::{debug, info};

use crate::alloc::RemoteAlloc;
use crate::call::{CallArg, CallConv, CallResult, call};
use crate::err::{Error, Result};
use crate::memory;
use crate::process::{Process, Protection, to_wide};

const LOAD_WITH_ALTERED_SEARCH_PATH: u32 = 0x8;

bitflags! {
    /// Options of [`inject_dll`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InjectFlags: u32 {
        /// Resolve a relative path against the directory of the running
        /// executable. The file must exist.
        const PATH_RESOLUTION = 1;
        /// Search the module's own directory for its dependencies. Needs an
        /// absolute path.
        const ADD_TO_SEARCH_ORDER = 2;
    }
}

fn resolve_path(
    path: &Path,
    flags: InjectFlags,
    base_dir: impl FnOnce() -> Result<PathBuf>,
) -> Result<PathBuf> {
    let path = if flags.contains(InjectFlags::PATH_RESOLUTION) && path.is_relative() {
        let full = base_dir()?.join(path);
        if !full.try_exists()? {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", full.display()),
            )
            .into());
        }
        full
    } else {
        path.to_path_buf()
    };
    if flags.contains(InjectFlags::ADD_TO_SEARCH_ORDER) && path.is_relative() {
        return Err(Error::InvalidParameter);
    }
    Ok(path)
}

fn exe_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or(Error::InvalidParameter)
}

/// Loads the module at `path` into `process` and returns its base address.
pub fn inject_dll(process: &Process, path: impl AsRef<Path>, flags: InjectFlags) -> Result<usize> {
    let path = resolve_path(path.as_ref(), flags, exe_dir)?;
    let wide: Vec<u8> = to_wide(path.as_os_str())
        .iter()
        .flat_map(|c| c.to_le_bytes())
        .collect();
    let remote_path = RemoteAlloc::new(process, wide.len(), Protection::READWRITE)?;
    memory::write(process, remote_path.base(), &wide)?;

    let load_library = process.proc_address("kernel32.dll", "LoadLibraryExW")?;
    let load_flags = if flags.contains(InjectFlags::ADD_TO_SEARCH_ORDER) {
        LOAD_WITH_ALTERED_SEARCH_PATH
    } else {
        0
    };
    debug!(path = %path.display(), load_library, load_flags, "loading module");
    let result = call(
        process,
        load_library,
        CallConv::WinApi,
        &[
            CallArg::from(remote_path.base()),
            CallArg::from(0usize),
            CallArg::from(load_flags),
        ],
    )?;
    let module = result.value::<usize>();
    if module == 0 {
        return Err(Error::RemoteCall {
            function: "LoadLibraryExW",
            last_error: result.last_error(),
        });
    }
    info!(
        pid = process.pid(),
        module = format_args!("{module:#x}"),
        path = %path.display(),
        "module loaded"
    );
    Ok(module)
}

/// Unloads a module loaded with [`inject_dll`].
pub fn free_dll(process: &Process, module: usize) -> Result<()> {
    let free_library = process.proc_address("kernel32.dll", "FreeLibrary")?;
    let result = call(process, free_library, CallConv::WinApi, &[CallArg::from(module)])?;
    if !result.value::<bool>() {
        return Err(Error::RemoteCall {
            function: "FreeLibrary",
            last_error: result.last_error(),
        });
    }
    Ok(())
}

/// Calls the export `name` of the module at `module` without arguments.
pub fn call_export(process: &Process, module: usize, name: &str) -> Result<CallResult<usize>> {
    let entry = process.module_by_base(module)?;
    let export = process.export_address(&entry, name)?;
    debug!(module = %entry.name, export = name, addr = export, "calling export");
    let result = call(process, export, CallConv::Default, &[])?;
    Ok(result.typed::<usize>())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir() -> Result<PathBuf> {
        Ok(std::env::temp_dir())
    }

    #[test]
    fn relative_path_needs_resolution_for_search_order() {
        assert!(matches!(
            resolve_path(Path::new("hook.dll"), InjectFlags::ADD_TO_SEARCH_ORDER, dir),
            Err(Error::InvalidParameter)
        ));
        let plain = resolve_path(Path::new("hook.dll"), InjectFlags::empty(), dir).unwrap();
        assert_eq!(plain, Path::new("hook.dll"));
    }

    #[test]
    fn resolution_requires_existing_file() {
        let err = resolve_path(
            Path::new("remotehook-missing-module.dll"),
            InjectFlags::PATH_RESOLUTION,
            dir,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Io(e) if e.kind() == io::ErrorKind::NotFound));

        let name = format!("remotehook-test-{}.dll", std::process::id());
        let full = std::env::temp_dir().join(&name);
        std::fs::write(&full, b"MZ").unwrap();
        let resolved = resolve_path(
            Path::new(&name),
            InjectFlags::PATH_RESOLUTION | InjectFlags::ADD_TO_SEARCH_ORDER,
            dir,
        )
        .unwrap();
        assert_eq!(resolved, full);
        std::fs::remove_file(&full).unwrap();
    }

    #[test]
    fn absolute_path_kept() {
        let abs = std::env::temp_dir().join("hook.dll");
        let resolved = resolve_path(&abs, InjectFlags::all(), || unreachable!()).unwrap();
        assert_eq!(resolved, abs);
    }
}
