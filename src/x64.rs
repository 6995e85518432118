//! The x86_64 instruction set.
//!
//! Hooked sites get a 5-byte `jmp rel32` when the destination is within
//! ±2GB and a 14-byte `push imm32; mov dword ptr [rsp+4], imm32; ret`
//! otherwise. Trampolines end with `jmp qword ptr [rip]` followed by the
//! absolute address when the way back is out of `rel32` range.

use iced_x86::Instruction;

use crate::arch::Arch;
use crate::call::{CallConv, CallDescriptor, CallFlags, ResultLayout};
use crate::err::{Error, Result};
use crate::process::HelperRoutines;

mod call_gen;
mod move_inst;

#[cfg(test)]
mod tests;

const JMP_REL32_SIZE: usize = 5;
const PUSH_RET_SIZE: usize = 14;

/// The x86_64 instruction set and the Microsoft x64 calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct X64;

fn rel32(from: u64, to: u64) -> Option<i32> {
    let next = from.wrapping_add(JMP_REL32_SIZE as u64);
    i32::try_from(to.wrapping_sub(next) as i64).ok()
}

fn jmp_rel32(rel: i32) -> Vec<u8> {
    let mut code = vec![0xe9];
    code.extend_from_slice(&rel.to_le_bytes());
    code
}

impl Arch for X64 {
    const BITNESS: u32 = 64;
    const POINTER_SIZE: usize = 8;
    const RESULT_LAYOUT: ResultLayout = ResultLayout {
        size: 48,
        ret_ptr: 0,
        ret32: 8,
        ret64: 16,
        ret_float: 24,
        ret_double: 32,
        last_error: 40,
        pointer_size: 8,
    };

    fn jump_size(from: u64, to: u64) -> usize {
        if rel32(from, to).is_some() {
            JMP_REL32_SIZE
        } else {
            PUSH_RET_SIZE
        }
    }

    fn encode_jump(from: u64, to: u64) -> Vec<u8> {
        if let Some(rel) = rel32(from, to) {
            return jmp_rel32(rel);
        }
        let mut code = Vec::with_capacity(PUSH_RET_SIZE);
        code.push(0x68);
        code.extend_from_slice(&(to as u32).to_le_bytes());
        code.extend_from_slice(&[0xc7, 0x44, 0x24, 0x04]);
        code.extend_from_slice(&((to >> 32) as u32).to_le_bytes());
        code.push(0xc3);
        code
    }

    fn encode_exit_jump(from: u64, to: u64) -> Vec<u8> {
        if let Some(rel) = rel32(from, to) {
            return jmp_rel32(rel);
        }
        let mut code = vec![0xff, 0x25, 0, 0, 0, 0];
        code.extend_from_slice(&to.to_le_bytes());
        code
    }

    fn relocate(insts: &[Instruction], dest: u64) -> Result<Vec<u8>> {
        move_inst::relocate(insts, dest)
    }

    fn check_call_conv(conv: CallConv) -> Result<()> {
        match conv {
            CallConv::Default | CallConv::WinApi | CallConv::X64 => Ok(()),
            other => Err(Error::UnsupportedCallConv(other)),
        }
    }

    fn emit_call_stub(
        calls: &[CallDescriptor],
        helpers: &HelperRoutines,
        results: u64,
        flags: CallFlags,
    ) -> Result<Vec<Instruction>> {
        call_gen::emit(calls, helpers, results, flags)
    }
}
