//! The 32-bit x86 instruction set.
//!
//! Every address is reachable with a 5-byte `jmp rel32`, so hooked sites and
//! trampolines use the same jump and relocation is left to the block encoder.

use iced_x86::{BlockEncoder, BlockEncoderOptions, Instruction, InstructionBlock};

use crate::arch::Arch;
use crate::call::{CallConv, CallDescriptor, CallFlags, ResultLayout};
use crate::err::{Error, Result};
use crate::process::HelperRoutines;

mod call_gen;


const JMP_INST_SIZE: usize = 5;

/// The 32-bit x86 instruction set with its cdecl, stdcall, thiscall and
/// fastcall conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct X86;

impl Arch for X86 {
    const BITNESS: u32 = 32;
    const POINTER_SIZE: usize = 4;
    const RESULT_LAYOUT: ResultLayout = ResultLayout {
        size: 40,
        ret_ptr: 0,
        ret32: 4,
        ret64: 8,
        ret_float: 16,
        ret_double: 24,
        last_error: 32,
        pointer_size: 4,
    };

    fn jump_size(_from: u64, _to: u64) -> usize {
        JMP_INST_SIZE
    }

    fn encode_jump(from: u64, to: u64) -> Vec<u8> {
        let rel = (to as u32).wrapping_sub((from as u32).wrapping_add(JMP_INST_SIZE as u32));
        let mut code = vec![0xe9];
        code.extend_from_slice(&rel.to_le_bytes());
        code
    }

    fn relocate(insts: &[Instruction], dest: u64) -> Result<Vec<u8>> {
        let block = InstructionBlock::new(insts, dest);
        let encoded = BlockEncoder::encode(32, block, BlockEncoderOptions::NONE)?;
        Ok(encoded.code_buffer)
    }

    fn check_call_conv(conv: CallConv) -> Result<()> {
        match conv {
            CallConv::X64 => Err(Error::UnsupportedCallConv(conv)),
            _ => Ok(()),
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
