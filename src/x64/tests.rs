use iced_x86::{Code, Decoder, DecoderOptions, Instruction, Register};

use super::call_gen::Frame;
use super::*;
use crate::call::{CallArg, CallDescriptor};

fn move_inst(inst: &[u8], ori_base_addr: u64, new_base_addr: u64) -> Vec<u8> {
    let mut decoder = Decoder::new(64, inst, DecoderOptions::NONE);
    decoder.set_ip(ori_base_addr);
    let insts: Vec<Instruction> = decoder.iter().collect();
    X64::relocate(&insts, new_base_addr).unwrap()
}

fn decode(code: &[u8]) -> Vec<Instruction> {
    Decoder::new(64, code, DecoderOptions::NONE).iter().collect()
}

fn helpers() -> HelperRoutines {
    HelperRoutines {
        get_last_error: 0x7ff8_0000_1000,
        set_last_error: 0x7ff8_0000_2000,
        is_debugger_present: 0x7ff8_0000_3000,
        debug_break: 0x7ff8_0000_4000,
    }
}

fn stub(calls: &[CallDescriptor], flags: CallFlags) -> Vec<Instruction> {
    let insts = X64::emit_call_stub(calls, &helpers(), 0x2_0000_0000, flags).unwrap();
    decode(&crate::emit::assemble(64, &insts, 0x1_0000_0000).unwrap())
}

/// Immediates loaded with `mov r64, imm64`, in order.
fn mov_imm64(insts: &[Instruction], reg: Register) -> Vec<u64> {
    insts
        .iter()
        .filter(|i| i.code() == Code::Mov_r64_imm64 && i.op0_register() == reg)
        .map(|i| i.immediate64())
        .collect()
}

#[test]
fn test_move_inst_short_1() {
    // jmp @+2
    let inst = [0xeb, 0x02];
    let addr = inst.as_ptr() as u64;
    let new_inst = move_inst(&inst, addr, addr + 300);
    assert_eq!(new_inst, [0xe9, 0xd3, 0xfe, 0xff, 0xff]);
}

#[test]
fn test_move_inst_short_2() {
    // call @+10
    let inst = [0xe8, 0xa, 0, 0, 0];
    let addr = inst.as_ptr() as u64;
    let new_inst = move_inst(&inst, addr, addr - 0x3333);
    assert_eq!(new_inst, [0xe8, 0x3d, 0x33, 0x0, 0x0])
}

#[test]
fn test_move_inst_short_3() {
    // mov rbx, [rip + 0x00000001]
    let inst = [0x48, 0x8b, 0x1d, 0x01, 0x00, 0x00, 0x00];
    let addr = inst.as_ptr() as u64;
    let new_inst = move_inst(&inst, addr, addr + 0x4000);
    assert_eq!(new_inst, [0x48, 0x8b, 0x1d, 0x1, 0xc0, 0xff, 0xff]);
}

#[test]
fn test_move_inst_long_1() {
    // jmp @+0
    let inst = [0xeb, 0x00];
    let addr = 0x40_0000;
    let new_inst = move_inst(&inst, addr, addr + 0x1_0000_0000);
    // jmp [rip@0x400002]
    // jmp @+13
    assert_eq!(
        new_inst,
        [
            0xff, 0x25, 0x0a, 0x00, 0x00, 0x00, 0xe9, 0x0d, 0x00, 0x00, 0x00, 0xcc, 0xcc, 0xcc,
            0xcc, 0xcc, 0x02, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00
        ]
    );
}

#[test]
fn test_move_inst_long_2() {
    // jmp qword ptr [rip@400006]
    let inst = [0xff, 0x25, 0, 0, 0, 0];
    let addr = 0x40_0000;
    let new_inst = move_inst(&inst, addr, addr + 0x1_0000_0000);
    // mov [rsp-0x10], rax;
    // mov rax, 400006;
    // push [rax];
    // mov rax, [rsp-8];
    // ret
    assert_eq!(
        new_inst,
        [
            0x48, 0x89, 0x44, 0x24, 0xf0, 0x48, 0xb8, 0x06, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00,
            0x00, 0xff, 0x30, 0x48, 0x8b, 0x44, 0x24, 0xf8, 0xc3
        ]
    );
}

#[test]
fn test_move_inst_long_3() {
    // jne @+0
    let inst = [0x75, 0x00];
    let addr = 0x40_0000;
    let new_inst = move_inst(&inst, addr, addr + 0x1_0000_0000);
    // je @+6
    // jmp [rip@0x400002]
    // jmp @+11
    assert_eq!(
        new_inst,
        [
            0x74, 0x06, 0xff, 0x25, 0x08, 0x00, 0x00, 0x00, 0xe9, 0x0b, 0x00, 0x00, 0x00, 0xcc,
            0xcc, 0xcc, 0x02, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00
        ]
    );
}

#[test]
fn test_move_inst_long_4() {
    // jrcxz @+0
    let inst = [0xe3, 0x00];
    let addr = 0x40_0000;
    let new_inst = move_inst(&inst, addr, addr + 0x1_0000_0000);
    // jrcxz @+2
    // jmp @+6
    // jmp [rip@400002]
    // jmp @+9
    assert_eq!(
        new_inst,
        [
            0xe3, 0x02, 0xeb, 0x06, 0xff, 0x25, 0x06, 0x00, 0x00, 0x00, 0xe9, 0x09, 0x00, 0x00,
            0x00, 0xcc, 0x02, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00
        ]
    );
}

#[test]
fn test_move_inst_long_5() {
    // call @+0
    let inst = [0xe8, 0, 0, 0, 0];
    let addr = 0x40_0000;
    let new_inst = move_inst(&inst, addr, addr + 0x1_0000_0000);
    // call [rip@400005]
    // jmp @+13
    assert_eq!(
        new_inst,
        [
            0xff, 0x15, 0x0a, 0x00, 0x00, 0x00, 0xe9, 0x0d, 0x00, 0x00, 0x00, 0xcc, 0xcc, 0xcc,
            0xcc, 0xcc, 0x05, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00
        ]
    );
}

#[test]
fn test_move_inst_long_6() {
    // call [rip@400006]
    let inst = [0xff, 0x15, 0, 0, 0, 0];
    let addr = 0x40_0000;
    let new_inst = move_inst(&inst, addr, addr + 0x1_0000_0000);
    // mov [rsp-0x18], rax
    // mov rax, 400006
    // push 400024
    // mov dword ptr [rsp+4], 1
    // push qword ptr [rax]
    // mov rax, [rsp-8]
    // ret
    assert_eq!(
        new_inst,
        [
            0x48, 0x89, 0x44, 0x24, 0xe8, 0x48, 0xb8, 0x06, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x68, 0x24, 0x00, 0x40, 0x00, 0xc7, 0x44, 0x24, 0x04, 0x01, 0x00, 0x00, 0x00,
            0xff, 0x30, 0x48, 0x8b, 0x44, 0x24, 0xf8, 0xc3
        ]
    );
}

#[test]
fn test_move_inst_long_7() {
    // lea r11, [rip@400007]
    let inst = [0x4c, 0x8d, 0x1d, 0, 0, 0, 0];
    let addr = 0x40_0000;
    let new_inst = move_inst(&inst, addr, addr + 0x1_0000_0000);
    // mov r11, 400007
    assert_eq!(
        new_inst,
        [0x49, 0xbb, 0x07, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00]
    );
}

#[test]
fn test_move_inst_long_8() {
    // add dword ptr [rip@400006], ebx
    let inst = [0x01, 0x1d, 0, 0, 0, 0];
    let addr = 0x40_0000;
    let new_inst = move_inst(&inst, addr, addr + 0x1_0000_0000);
    // mov [rsp-0x10], r8
    // mov r8, 400006
    // add [r8], ebx
    // mov r8, [rsp-0x10]
    assert_eq!(
        new_inst,
        [
            0x4c, 0x89, 0x44, 0x24, 0xf0, 0x49, 0xb8, 0x06, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x41, 0x01, 0x18, 0x4c, 0x8b, 0x44, 0x24, 0xf0
        ]
    );
}

#[test]
fn test_move_inst_long_9() {
    // push qword ptr [rip@400006]
    let inst = [0xff, 0x35, 0, 0, 0, 0];
    let addr = 0x40_0000;
    let new_inst = move_inst(&inst, addr, addr + 0x1_0000_0000);
    // mov [rsp-0x10], rbx
    // mov rbx, 400006
    // push [rbx]
    // mov rbx, [rsp-8]
    assert_eq!(
        new_inst,
        [
            0x48, 0x89, 0x5c, 0x24, 0xf0, 0x48, 0xbb, 0x06, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00,
            0x00, 0xff, 0x33, 0x48, 0x8b, 0x5c, 0x24, 0xf8
        ]
    );
}

#[test]
fn test_move_inst_long_all() {
    let inst = [
        0x74, 0x09, 0x48, 0x8B, 0x4D, 0x70, 0xE8, 0x72, 0x15, 0xF4, 0xFF, 0x8B, 0x1D, 0xEC, 0xFF,
        0xFF, 0xFF,
    ];
    let addr = 0x7fff_b81c_0a03;
    let new_inst = move_inst(&inst, addr, 0x400000);
    assert_eq!(
        new_inst,
        [
            0x75, 0x06, 0xff, 0x25, 0x28, 0x00, 0x00, 0x00, 0x48, 0x8b, 0x4d, 0x70, 0xff, 0x15,
            0x26, 0x00, 0x00, 0x00, 0x4c, 0x89, 0x44, 0x24, 0xf0, 0x49, 0xb8, 0x00, 0x0a, 0x1c,
            0xb8, 0xff, 0x7f, 0x00, 0x00, 0x41, 0x8b, 0x18, 0x4c, 0x8b, 0x44, 0x24, 0xf0, 0xe9,
            0x12, 0x00, 0x00, 0x00, 0xcc, 0xcc, 0x12, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x80, 0x1f, 0x10, 0xb8, 0xff, 0x7f, 0x00, 0x00
        ]
    );
}

#[test]
fn test_move_inst_far_lea_32() {
    // lea eax, [rip@400006]
    let inst = [0x8d, 0x05, 0, 0, 0, 0];
    let new_inst = move_inst(&inst, 0x40_0000, 0x1_4000_0000);
    // mov eax, 400006
    assert_eq!(new_inst, [0xb8, 0x06, 0x00, 0x40, 0x00]);
}

#[test]
fn test_move_inst_far_rsp_rejected() {
    // add rsp, [rip@400007]
    let inst = [0x48, 0x03, 0x25, 0, 0, 0, 0];
    let insts: Vec<_> = {
        let mut decoder = Decoder::new(64, &inst, DecoderOptions::NONE);
        decoder.set_ip(0x40_0000);
        decoder.iter().collect()
    };
    assert!(matches!(
        X64::relocate(&insts, 0x1_4000_0000),
        Err(Error::UnsupportedInstruction(0x40_0000))
    ));
}

fn relocate_at(inst: &[u8], ip: u64, dest: u64) -> Result<Vec<u8>> {
    let mut decoder = Decoder::new(64, inst, DecoderOptions::NONE);
    decoder.set_ip(ip);
    let insts: Vec<Instruction> = decoder.iter().collect();
    X64::relocate(&insts, dest)
}

#[test]
fn test_move_inst_far_xbegin_rejected() {
    // xbegin @+0x20
    let inst = [0xc7, 0xf8, 0x1a, 0, 0, 0];
    assert!(matches!(
        relocate_at(&inst, 0x40_0000, 0x1_4000_0000),
        Err(Error::UnsupportedInstruction(0x40_0000))
    ));
    // near: the block encoder fixes the displacement
    let near = relocate_at(&inst, 0x40_0000, 0x41_0000).unwrap();
    let moved = Decoder::with_ip(64, &near, 0x41_0000, DecoderOptions::NONE).decode();
    assert_eq!(moved.code(), Code::Xbegin_rel32);
    assert_eq!(moved.near_branch_target(), 0x40_0020);
}

#[test]
fn test_move_inst_far_lea_16_rejected() {
    // lea ax, [rip@400007]
    let inst = [0x66, 0x8d, 0x05, 0, 0, 0, 0];
    assert!(matches!(
        relocate_at(&inst, 0x40_0000, 0x1_4000_0000),
        Err(Error::UnsupportedInstruction(0x40_0000))
    ));
}

#[test]
fn test_move_inst_far_jrcxz_table() {
    // jrcxz @400012
    let inst = [0xe3, 0x10];
    let moved = relocate_at(&inst, 0x40_0000, 0x1_4000_0000).unwrap();
    assert_eq!(
        moved,
        [
            // jrcxz taken; jmp skip; taken: jmp [rip+6]
            0xe3, 0x02, 0xeb, 0x06, 0xff, 0x25, 0x06, 0x00, 0x00, 0x00,
            // jmp over the table, one byte of padding
            0xe9, 0x09, 0x00, 0x00, 0x00, 0xcc,
            // table
            0x12, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00,
        ]
    );
}

#[test]
fn test_move_inst_far_rip_load_uses_scratch() {
    // mov eax, [rip@400006]
    let inst = [0x8b, 0x05, 0, 0, 0, 0];
    let moved = relocate_at(&inst, 0x40_0000, 0x1_4000_0000).unwrap();
    assert_eq!(
        moved,
        [
            // mov [rsp-0x10], rbx
            0x48, 0x89, 0x5c, 0x24, 0xf0,
            // mov rbx, 400006
            0x48, 0xbb, 0x06, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00,
            // mov eax, [rbx]
            0x8b, 0x03,
            // mov rbx, [rsp-0x10]
            0x48, 0x8b, 0x5c, 0x24, 0xf0,
        ]
    );
}

#[test]
fn test_jump_forms() {
    assert_eq!(X64::jump_size(0x1000, 0x2000), 5);
    assert_eq!(X64::encode_jump(0x1000, 0x2000), [0xe9, 0xfb, 0x0f, 0x00, 0x00]);
    // backwards
    assert_eq!(X64::encode_jump(0x2000, 0x1000), [0xe9, 0xfb, 0xef, 0xff, 0xff]);

    let far = 0x7ff8_1234_5678;
    assert_eq!(X64::jump_size(0x40_0000, far), 14);
    assert_eq!(
        X64::encode_jump(0x40_0000, far),
        [
            0x68, 0x78, 0x56, 0x34, 0x12, 0xc7, 0x44, 0x24, 0x04, 0xf8, 0x7f, 0x00, 0x00, 0xc3
        ]
    );
    assert_eq!(
        X64::encode_exit_jump(0x40_0000, far),
        [
            0xff, 0x25, 0x00, 0x00, 0x00, 0x00, 0x78, 0x56, 0x34, 0x12, 0xf8, 0x7f, 0x00, 0x00
        ]
    );
}

#[test]
fn test_far_jump_decodes() {
    let far = 0x7ff8_1234_5678u64;
    let insts = decode(&X64::encode_jump(0x40_0000, far));
    assert_eq!(insts.len(), 3);
    assert_eq!(insts[0].code(), Code::Pushq_imm32);
    assert_eq!(insts[1].code(), Code::Mov_rm32_imm32);
    assert_eq!(insts[2].code(), Code::Retnq);
}

#[test]
fn test_call_convs() {
    assert!(X64::check_call_conv(CallConv::Default).is_ok());
    assert!(X64::check_call_conv(CallConv::WinApi).is_ok());
    assert!(X64::check_call_conv(CallConv::X64).is_ok());
    for conv in [
        CallConv::Cdecl,
        CallConv::StdCall,
        CallConv::ThisCall,
        CallConv::FastCall,
    ] {
        assert!(matches!(
            X64::check_call_conv(conv),
            Err(Error::UnsupportedCallConv(c)) if c == conv
        ));
    }
}

#[test]
fn test_frame_alignment() {
    let none = Frame::new(&[CallDescriptor::new(0, CallConv::X64, vec![])]);
    assert_eq!(none.scratch, 32);
    assert_eq!(none.size % 16, 8);
    let many = Frame::new(&[CallDescriptor::new(0, CallConv::X64, vec![CallArg::Int32(0); 7])]);
    assert_eq!(many.scratch, 56);
    assert_eq!(many.size % 16, 8);
    assert!(many.size as i64 >= many.scratch + 8);
}

#[test]
fn test_stub_integer_args() {
    let call = CallDescriptor::new(
        0x7ff6_0000_1234,
        CallConv::X64,
        vec![
            CallArg::Int32(0xAAAA_AAAA),
            CallArg::Int64(0xBBBB_BBBB_CCCC_CCCC),
            CallArg::Int32(3),
            CallArg::Int32(4),
            CallArg::Int64(0x1111_2222_3333_4444),
        ],
    );
    let insts = stub(&[call], CallFlags::SKIP_DEBUGGER_CHECK);
    assert_eq!(insts[0].code(), Code::Sub_rm64_imm32);
    assert_eq!(insts.last().unwrap().code(), Code::Retnq);

    assert_eq!(mov_imm64(&insts, Register::RCX)[0], 0xAAAA_AAAA);
    assert_eq!(mov_imm64(&insts, Register::RDX), [0xBBBB_BBBB_CCCC_CCCC]);
    assert_eq!(mov_imm64(&insts, Register::R8), [3]);
    assert_eq!(mov_imm64(&insts, Register::R9), [4]);
    // fifth argument in the stack slot above the home area
    let stack: Vec<_> = insts
        .iter()
        .filter(|i| i.code() == Code::Mov_rm32_imm32 && i.memory_base() == Register::RSP)
        .map(|i| (i.memory_displacement64(), i.immediate32()))
        .collect();
    assert_eq!(stack, [(0x20, 0x3333_4444), (0x24, 0x1111_2222)]);

    let rax = mov_imm64(&insts, Register::RAX);
    assert_eq!(
        rax,
        [0x7ff8_0000_2000, 0x7ff6_0000_1234, 0x7ff8_0000_1000]
    );
}

#[test]
fn test_stub_float_args() {
    let call = CallDescriptor::new(
        0x1000,
        CallConv::Default,
        vec![
            CallArg::Float(1.5),
            CallArg::Double(2.25),
            CallArg::Int32(7),
            CallArg::Float(-1.0),
            CallArg::Double(0.5),
        ],
    );
    let insts = stub(&[call], CallFlags::SKIP_DEBUGGER_CHECK);
    let loads: Vec<_> = insts
        .iter()
        .filter(|i| matches!(i.code(), Code::Movss_xmm_xmmm32 | Code::Movsd_xmm_xmmm64))
        .map(|i| (i.code(), i.op0_register()))
        .collect();
    assert_eq!(
        loads,
        [
            (Code::Movss_xmm_xmmm32, Register::XMM0),
            (Code::Movsd_xmm_xmmm64, Register::XMM1),
            (Code::Movss_xmm_xmmm32, Register::XMM3),
        ]
    );
    assert_eq!(mov_imm64(&insts, Register::R8), [7]);
    let doubles: Vec<_> = insts
        .iter()
        .filter(|i| {
            i.code() == Code::Mov_rm32_imm32
                && i.memory_base() == Register::RSP
                && i.memory_displacement64() == 0x20
        })
        .map(|i| i.immediate32())
        .collect();
    assert_eq!(doubles, [0.5f64.to_bits() as u32]);
    assert!(insts.iter().any(|i| {
        i.code() == Code::Mov_rm32_imm32
            && i.memory_displacement64() == 0x24
            && i.immediate32() == (0.5f64.to_bits() >> 32) as u32
    }));
}

#[test]
fn test_stub_debugger_check() {
    let calls = [CallDescriptor::new(0x1000, CallConv::X64, vec![])];
    let with = stub(&calls, CallFlags::empty());
    let rax = mov_imm64(&with, Register::RAX);
    assert_eq!(&rax[..2], [0x7ff8_0000_3000, 0x7ff8_0000_4000]);
    let je = with.iter().find(|i| i.is_jcc_short_or_near()).unwrap();
    let after_break = with
        .iter()
        .position(|i| i.code() == Code::Mov_r64_imm64 && i.immediate64() == 0x7ff8_0000_4000)
        .unwrap();
    // jumps over the debug break call
    assert_eq!(je.near_branch64(), with[after_break + 2].ip());

    let without = stub(&calls, CallFlags::SKIP_DEBUGGER_CHECK);
    assert!(!without.iter().any(|i| i.is_jcc_short_or_near()));
}

#[test]
fn test_stub_result_slots() {
    let calls = [
        CallDescriptor::new(0x1000, CallConv::X64, vec![]),
        CallDescriptor::new(0x2000, CallConv::X64, vec![]),
    ];
    let insts = stub(&calls, CallFlags::SKIP_DEBUGGER_CHECK);
    let slots = mov_imm64(&insts, Register::RCX);
    assert_eq!(
        slots,
        [0x2_0000_0000, 0x2_0000_0000, 0x2_0000_0030, 0x2_0000_0030]
    );
    let stores: Vec<_> = insts
        .iter()
        .filter(|i| i.memory_base() == Register::RCX)
        .take(6)
        .map(|i| (i.code(), i.memory_displacement64()))
        .collect();
    assert_eq!(
        stores,
        [
            (Code::Mov_rm64_r64, 0),
            (Code::Mov_rm32_r32, 8),
            (Code::Mov_rm64_r64, 16),
            (Code::Movss_xmmm32_xmm, 24),
            (Code::Movsd_xmmm64_xmm, 32),
            (Code::Mov_rm32_r32, 40),
        ]
    );
}
