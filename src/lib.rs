/*!
This crate calls functions inside other processes and inline hooks their code,
for the `x86` and `x64` instruction sets.

Everything works through an [`AddressSpace`](process::AddressSpace): a
Windows [`Process`](process::Process) opened by pid, or on Linux the current
process through `LocalProcess`, which makes the engines testable without a
second process.

# Installation

Add it to your `Cargo.toml` like so:

```toml
[dependencies]
remotehook = "0.3"
```

# Remote calls

A batch of calls is compiled into one small stub which runs on a single new
thread in the target. Every call gets its own result record: the return value
as pointer, 32-bit, 64-bit, float and double, plus the last-error value read
right after the call returned.

```no_run
# #[cfg(windows)]
# fn demo() -> remotehook::Result<()> {
use remotehook::process::Process;
use remotehook::{CallConv, MultiCall, call_args};

let process = Process::open(1234)?;
let set_last_error = process.proc_address("kernel32.dll", "SetLastError")?;
let get_last_error = process.proc_address("kernel32.dll", "GetLastError")?;

let mut batch = MultiCall::new(&process);
batch
    .add(set_last_error, CallConv::WinApi, call_args![0x1337u32])
    .add(get_last_error, CallConv::WinApi, call_args![]);
let results = batch.call()?;
assert_eq!(results[1].value::<u32>(), 0x1337);
# Ok(())
# }
```

Arguments are built from integers, pointers, `bool`, `f32` and `f64` only;
their representation never changes after construction. On `x86` the
`cdecl`, `stdcall`, `thiscall` and `fastcall` conventions are available, `x64`
has a single convention.

Waiting for the stub thread is bounded by [`CallOptions::timeout`]. A stub
that times out is left in the target, since its thread may still run.

# Patches

[`PatchRaw`] writes bytes, [`PatchDetour`] redirects a function to a
replacement and keeps a trampoline to call the original. Both restore the
original bytes on [`Patch::remove`] or when dropped. A [`PatchRegistry`]
groups named patches that are applied and removed together.

```no_run
# #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
# fn demo() -> remotehook::Result<()> {
use remotehook::process::LocalProcess;
use remotehook::{Patch, PatchDetour, PatchRaw, PatchRegistry};

# extern "win64" fn target() -> u32 { 1 }
# extern "win64" fn replacement() -> u32 { 2 }
# extern "win64" fn noisy() {}
let process = LocalProcess::new();
let mut registry = PatchRegistry::new();
registry.insert("detour", PatchDetour::new(&process, target as *const () as usize, replacement as *const () as usize))?;
// ret
registry.insert("silence", PatchRaw::new(&process, noisy as *const () as usize, [0xc3])?)?;
registry.apply_all()?;
// removed when `registry` is dropped
# Ok(())
# }
```

The first instructions of a detoured function are decoded and relocated
into the trampoline, including relative branches, calls and rip-relative
memory operands. Code that can't be decoded or relocated makes
[`Patch::apply`] fail before anything is written.

# Notes

Patching code of the calling process is not synchronized with threads
running it. Tests writing code in the same process must not run in
parallel over the same pages.

*/

#![warn(missing_docs)]

mod alloc;
mod arch;
mod call;
mod emit;
mod err;
mod patch;
mod registry;
#[cfg(test)]
mod sim;
mod trampoline;

pub mod memory;
pub mod process;
pub mod x64;
pub mod x86;

#[cfg(windows)]
pub mod inject;

pub use alloc::RemoteAlloc;
pub use arch::{Arch, Native};
pub use call::{
    CallArg, CallConv, CallDescriptor, CallFlags, CallOptions, CallResult, CallResultRaw,
    CallReturn, DEFAULT_CALL_TIMEOUT, MultiCall, ResultLayout, StorageClass, call, call_batch,
    call_multi,
};
pub use err::{Error, Result};
pub use patch::{Patch, PatchDetour, PatchRaw};
pub use registry::PatchRegistry;
pub use trampoline::{TRAMPOLINE_CAPACITY, disassemble};
