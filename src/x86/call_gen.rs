use iced_x86::{Code, Instruction, MemoryOperand, Register};

use super::X86;
use crate::arch::Arch;
use crate::call::{ArgVisitor, CallArg, CallConv, CallDescriptor, CallFlags, StorageClass};
use crate::emit::CodeBuf;
use crate::err::Result;
use crate::process::HelperRoutines;

/// Where each argument of a call goes.
#[derive(Debug, Default, PartialEq, Eq)]
pub(super) struct ArgPlan {
    /// Argument indices passed in ECX then EDX
    pub registers: Vec<usize>,
    /// Argument indices passed on the stack, first argument first
    pub stack: Vec<usize>,
}

impl ArgPlan {
    pub fn new(conv: CallConv, args: &[CallArg]) -> Self {
        let register_slots = match conv {
            CallConv::FastCall => 2,
            CallConv::ThisCall => 1,
            _ => 0,
        };
        let mut plan = Self::default();
        for (idx, arg) in args.iter().enumerate() {
            let general = arg.storage_class_for(X86::POINTER_SIZE) == StorageClass::General;
            // thiscall only takes `this` in ECX
            let eligible = match conv {
                CallConv::ThisCall => idx == 0,
                _ => true,
            };
            if general && eligible && plan.registers.len() < register_slots {
                plan.registers.push(idx);
            } else {
                plan.stack.push(idx);
            }
        }
        plan
    }
}

/// Whether the caller removes the arguments from the stack.
fn caller_cleans(conv: CallConv) -> bool {
    matches!(conv, CallConv::Default | CallConv::Cdecl)
}

fn ecx(displ: i64) -> MemoryOperand {
    MemoryOperand::with_base_displ(Register::ECX, displ)
}

fn call_abs(code: &mut CodeBuf, target: u32) -> Result<()> {
    code.push(Instruction::with2(Code::Mov_r32_imm32, Register::EAX, target))?;
    code.push(Instruction::with1(Code::Call_rm32, Register::EAX))
}

/// Pushes stack arguments. Visited last argument first.
struct Pusher<'a> {
    code: &'a mut CodeBuf,
    pushed: u32,
}

impl Pusher<'_> {
    fn push(&mut self, value: u32) -> Result<()> {
        self.pushed += 4;
        self.code.push(Instruction::with1(Code::Pushd_imm32, value))
    }
}

impl ArgVisitor for Pusher<'_> {
    fn visit_int32(&mut self, _index: usize, value: u32) -> Result<()> {
        self.push(value)
    }

    fn visit_int64(&mut self, _index: usize, value: u64) -> Result<()> {
        self.push((value >> 32) as u32)?;
        self.push(value as u32)
    }

    fn visit_float(&mut self, _index: usize, value: f32) -> Result<()> {
        self.push(value.to_bits())
    }

    fn visit_double(&mut self, index: usize, value: f64) -> Result<()> {
        self.visit_int64(index, value.to_bits())
    }
}

/// Loads register arguments; only 32-bit integers are ever planned here.
struct RegisterLoader<'a> {
    code: &'a mut CodeBuf,
    reg: Register,
}

impl ArgVisitor for RegisterLoader<'_> {
    fn visit_int32(&mut self, _index: usize, value: u32) -> Result<()> {
        self.code
            .push(Instruction::with2(Code::Mov_r32_imm32, self.reg, value))
    }

    fn visit_int64(&mut self, index: usize, value: u64) -> Result<()> {
        self.visit_int32(index, value as u32)
    }

    fn visit_float(&mut self, index: usize, value: f32) -> Result<()> {
        self.visit_int32(index, value.to_bits())
    }

    fn visit_double(&mut self, index: usize, value: f64) -> Result<()> {
        self.visit_int32(index, value.to_bits() as u32)
    }
}

pub(super) fn emit(
    calls: &[CallDescriptor],
    helpers: &HelperRoutines,
    results: u64,
    flags: CallFlags,
) -> Result<Vec<Instruction>> {
    let layout = X86::RESULT_LAYOUT;
    let mut code = CodeBuf::new(32);

    code.push(Instruction::with1(Code::Push_r32, Register::EBP))?;
    code.push(Instruction::with2(Code::Mov_r32_rm32, Register::EBP, Register::ESP))?;

    if !flags.contains(CallFlags::SKIP_DEBUGGER_CHECK) {
        let no_debugger = code.create_label();
        call_abs(&mut code, helpers.is_debugger_present as u32)?;
        code.push(Instruction::with2(Code::Test_rm32_r32, Register::EAX, Register::EAX))?;
        code.branch(Code::Je_rel32_32, no_debugger)?;
        call_abs(&mut code, helpers.debug_break as u32)?;
        code.bind(no_debugger);
    }

    // SetLastError(0), stdcall
    code.push(Instruction::with1(Code::Pushd_imm32, 0u32))?;
    call_abs(&mut code, helpers.set_last_error as u32)?;

    for (i, call) in calls.iter().enumerate() {
        let plan = ArgPlan::new(call.conv, &call.args);
        let mut pusher = Pusher {
            code: &mut code,
            pushed: 0,
        };
        for &idx in plan.stack.iter().rev() {
            call.args[idx].accept(idx, &mut pusher)?;
        }
        let pushed = pusher.pushed;
        for (&idx, reg) in plan.registers.iter().zip([Register::ECX, Register::EDX]) {
            let mut loader = RegisterLoader {
                code: &mut code,
                reg,
            };
            call.args[idx].accept(idx, &mut loader)?;
        }
        call_abs(&mut code, call.address as u32)?;
        if caller_cleans(call.conv) && pushed != 0 {
            code.push(Instruction::with2(Code::Add_rm32_imm32, Register::ESP, pushed))?;
        }

        let slot = (results as u32).wrapping_add((i * layout.size) as u32);
        code.push(Instruction::with2(Code::Mov_r32_imm32, Register::ECX, slot))?;
        let ret_ptr = ecx(layout.ret_ptr as i64);
        code.push(Instruction::with2(Code::Mov_rm32_r32, ret_ptr, Register::EAX))?;
        let ret32 = ecx(layout.ret32 as i64);
        code.push(Instruction::with2(Code::Mov_rm32_r32, ret32, Register::EAX))?;
        let ret64_lo = ecx(layout.ret64 as i64);
        code.push(Instruction::with2(Code::Mov_rm32_r32, ret64_lo, Register::EAX))?;
        let ret64_hi = ecx(layout.ret64 as i64 + 4);
        code.push(Instruction::with2(Code::Mov_rm32_r32, ret64_hi, Register::EDX))?;
        // st(0) is popped so float returns don't pile up on the x87 stack
        code.push(Instruction::with1(Code::Fst_m32fp, ecx(layout.ret_float as i64)))?;
        code.push(Instruction::with1(Code::Fstp_m64fp, ecx(layout.ret_double as i64)))?;

        call_abs(&mut code, helpers.get_last_error as u32)?;
        code.push(Instruction::with2(Code::Mov_r32_imm32, Register::ECX, slot))?;
        let last_error = ecx(layout.last_error as i64);
        code.push(Instruction::with2(Code::Mov_rm32_r32, last_error, Register::EAX))?;
    }

    code.push(Instruction::with2(Code::Xor_r32_rm32, Register::EAX, Register::EAX))?;
    code.push(Instruction::with2(Code::Mov_r32_rm32, Register::ESP, Register::EBP))?;
    code.push(Instruction::with1(Code::Pop_r32, Register::EBP))?;
    // thread entry is stdcall with one parameter
    code.push(Instruction::with1(Code::Retnd_imm16, 4u32))?;
    code.into_instructions()
}
