use iced_x86::Instruction;

use crate::call::{CallConv, CallDescriptor, CallFlags, ResultLayout};
use crate::err::Result;
use crate::process::HelperRoutines;

/// Code generation for one instruction set.
///
/// Implemented by [`X86`](crate::x86::X86) and [`X64`](crate::x64::X64); the
/// one matching the build target is [`Native`].
pub trait Arch {
    /// Decoder/encoder bitness
    const BITNESS: u32;
    /// Size of a pointer in the target
    const POINTER_SIZE: usize;
    /// Layout of the per-call result record written by call stubs
    const RESULT_LAYOUT: ResultLayout;

    /// Length of the jump written at a hooked address to reach `to`.
    fn jump_size(from: u64, to: u64) -> usize;

    /// Encodes the jump written at a hooked address.
    fn encode_jump(from: u64, to: u64) -> Vec<u8>;

    /// Encodes the jump ending a trampoline.
    fn encode_exit_jump(from: u64, to: u64) -> Vec<u8> {
        Self::encode_jump(from, to)
    }

    /// Re-encodes decoded instructions to run at `dest`.
    fn relocate(insts: &[Instruction], dest: u64) -> Result<Vec<u8>>;

    /// Fails if `conv` can't be used with this instruction set.
    fn check_call_conv(conv: CallConv) -> Result<()>;

    /// Generates a thread entry that performs `calls` in order and stores one
    /// result record per call at `results`.
    ///
    /// Branches inside the stub target label ids stored as instruction ips;
    /// the block is meant to be encoded with `BlockEncoder` as a whole.
    fn emit_call_stub(
        calls: &[CallDescriptor],
        helpers: &HelperRoutines,
        results: u64,
        flags: CallFlags,
    ) -> Result<Vec<Instruction>>;
}

/// The instruction set of the build target.
#[cfg(target_arch = "x86_64")]
pub type Native = crate::x64::X64;

/// The instruction set of the build target.
#[cfg(target_arch = "x86")]
pub type Native = crate::x86::X86;

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
compile_error!("remotehook only supports x86 and x86_64 targets");
