use iced_x86::{Code, Instruction, MemoryOperand, Register};

use super::X64;
use crate::arch::Arch;
use crate::call::{ArgVisitor, CallDescriptor, CallFlags};
use crate::emit::CodeBuf;
use crate::err::Result;
use crate::process::HelperRoutines;

const REGISTER_ARGS: usize = 4;
const INT_REGS: [Register; REGISTER_ARGS] = [Register::RCX, Register::RDX, Register::R8, Register::R9];
const XMM_REGS: [Register; REGISTER_ARGS] =
    [Register::XMM0, Register::XMM1, Register::XMM2, Register::XMM3];

/// Stack frame of the stub. The outgoing argument area starts at rsp and
/// always has room for the four home slots; an 8-byte scratch slot used to
/// move float bits into xmm registers follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Frame {
    pub scratch: i64,
    pub size: i32,
}

impl Frame {
    pub fn new(calls: &[CallDescriptor]) -> Self {
        let max_args = calls.iter().map(|c| c.args.len()).max().unwrap_or(0);
        let args_area = max_args.max(REGISTER_ARGS) * 8;
        // rsp is 8 off alignment on entry
        let size = ((args_area + 8 + 15) & !15) + 8;
        Self {
            scratch: args_area as i64,
            size: size as i32,
        }
    }
}

fn rsp(displ: i64) -> MemoryOperand {
    MemoryOperand::with_base_displ(Register::RSP, displ)
}

fn rcx(displ: i64) -> MemoryOperand {
    MemoryOperand::with_base_displ(Register::RCX, displ)
}

fn call_abs(code: &mut CodeBuf, target: u64) -> Result<()> {
    code.push(Instruction::with2(Code::Mov_r64_imm64, Register::RAX, target))?;
    code.push(Instruction::with1(Code::Call_rm64, Register::RAX))
}

struct ArgWriter<'a> {
    code: &'a mut CodeBuf,
    frame: Frame,
}

impl ArgWriter<'_> {
    fn stack_dwords(&mut self, index: usize, lo: u32, hi: u32) -> Result<()> {
        let off = index as i64 * 8;
        self.code
            .push(Instruction::with2(Code::Mov_rm32_imm32, rsp(off), lo))?;
        self.code
            .push(Instruction::with2(Code::Mov_rm32_imm32, rsp(off + 4), hi))
    }

    fn xmm_bits(&mut self, index: usize, load: Code, lo: u32, hi: u32) -> Result<()> {
        let scratch = self.frame.scratch;
        self.code
            .push(Instruction::with2(Code::Mov_rm32_imm32, rsp(scratch), lo))?;
        self.code
            .push(Instruction::with2(Code::Mov_rm32_imm32, rsp(scratch + 4), hi))?;
        self.code
            .push(Instruction::with2(load, XMM_REGS[index], rsp(scratch)))
    }
}

impl ArgVisitor for ArgWriter<'_> {
    fn visit_int32(&mut self, index: usize, value: u32) -> Result<()> {
        self.visit_int64(index, value as u64)
    }

    fn visit_int64(&mut self, index: usize, value: u64) -> Result<()> {
        if index < REGISTER_ARGS {
            self.code
                .push(Instruction::with2(Code::Mov_r64_imm64, INT_REGS[index], value))
        } else {
            self.stack_dwords(index, value as u32, (value >> 32) as u32)
        }
    }

    fn visit_float(&mut self, index: usize, value: f32) -> Result<()> {
        if index < REGISTER_ARGS {
            self.xmm_bits(index, Code::Movss_xmm_xmmm32, value.to_bits(), 0)
        } else {
            self.stack_dwords(index, value.to_bits(), 0)
        }
    }

    fn visit_double(&mut self, index: usize, value: f64) -> Result<()> {
        let bits = value.to_bits();
        if index < REGISTER_ARGS {
            self.xmm_bits(index, Code::Movsd_xmm_xmmm64, bits as u32, (bits >> 32) as u32)
        } else {
            self.stack_dwords(index, bits as u32, (bits >> 32) as u32)
        }
    }
}

pub(super) fn emit(
    calls: &[CallDescriptor],
    helpers: &HelperRoutines,
    results: u64,
    flags: CallFlags,
) -> Result<Vec<Instruction>> {
    let frame = Frame::new(calls);
    let layout = X64::RESULT_LAYOUT;
    let mut code = CodeBuf::new(64);

    code.push(Instruction::with2(Code::Sub_rm64_imm32, Register::RSP, frame.size))?;

    if !flags.contains(CallFlags::SKIP_DEBUGGER_CHECK) {
        let no_debugger = code.create_label();
        call_abs(&mut code, helpers.is_debugger_present as u64)?;
        code.push(Instruction::with2(Code::Test_rm32_r32, Register::EAX, Register::EAX))?;
        code.branch(Code::Je_rel32_64, no_debugger)?;
        call_abs(&mut code, helpers.debug_break as u64)?;
        code.bind(no_debugger);
    }

    code.push(Instruction::with2(Code::Xor_r32_rm32, Register::ECX, Register::ECX))?;
    call_abs(&mut code, helpers.set_last_error as u64)?;

    for (i, call) in calls.iter().enumerate() {
        let mut writer = ArgWriter {
            code: &mut code,
            frame,
        };
        for (idx, arg) in call.args.iter().enumerate() {
            arg.accept(idx, &mut writer)?;
        }
        call_abs(&mut code, call.address as u64)?;

        let slot = results + (i * layout.size) as u64;
        code.push(Instruction::with2(Code::Mov_r64_imm64, Register::RCX, slot))?;
        let ret_ptr = rcx(layout.ret_ptr as i64);
        code.push(Instruction::with2(Code::Mov_rm64_r64, ret_ptr, Register::RAX))?;
        let ret32 = rcx(layout.ret32 as i64);
        code.push(Instruction::with2(Code::Mov_rm32_r32, ret32, Register::EAX))?;
        let ret64 = rcx(layout.ret64 as i64);
        code.push(Instruction::with2(Code::Mov_rm64_r64, ret64, Register::RAX))?;
        let ret_float = rcx(layout.ret_float as i64);
        code.push(Instruction::with2(Code::Movss_xmmm32_xmm, ret_float, Register::XMM0))?;
        let ret_double = rcx(layout.ret_double as i64);
        code.push(Instruction::with2(Code::Movsd_xmmm64_xmm, ret_double, Register::XMM0))?;

        call_abs(&mut code, helpers.get_last_error as u64)?;
        code.push(Instruction::with2(Code::Mov_r64_imm64, Register::RCX, slot))?;
        let last_error = rcx(layout.last_error as i64);
        code.push(Instruction::with2(Code::Mov_rm32_r32, last_error, Register::EAX))?;
    }

    code.push(Instruction::with2(Code::Xor_r32_rm32, Register::EAX, Register::EAX))?;
    code.push(Instruction::with2(Code::Add_rm64_imm32, Register::RSP, frame.size))?;
    code.push_inst(Instruction::with(Code::Retnq));
    code.into_instructions()
}
