use std::io::{Cursor, Seek, SeekFrom, Write};

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Code, Encoder, FlowControl, Instruction, InstructionBlock,
    MemoryOperand, Mnemonic, Register,
};

use crate::err::{Error, Result};

/// Distance that `rel32` operands can still cover, with some slack.
const NEAR_RANGE: u64 = 0x7fff_f000;

/// A 32-bit displacement in re-encoded code that must point at an absolute
/// address table slot.
struct TableRef {
    disp_offset: u64,
    next_ip_offset: u64,
    target: u64,
}

enum SlotTarget {
    /// Index of an instruction inside the relocated block
    Moved(usize),
    Absolute(u64),
}

struct PendingSlot {
    disp_pos: u64,
    next_ip_pos: u64,
    target: SlotTarget,
}

/// Re-encodes `insts` to run at `dest`.
///
/// Inside the ±2GB range the block encoder fixes up every relative operand.
/// Farther away, branches go through a table of absolute addresses appended
/// after the code, and rip-relative memory operands are rewritten to use a
/// scratch register holding the absolute address.
pub(super) fn relocate(insts: &[Instruction], dest: u64) -> Result<Vec<u8>> {
    let (Some(first), Some(last)) = (insts.first(), insts.last()) else {
        return Ok(vec![]);
    };
    if first.ip().abs_diff(dest) < NEAR_RANGE {
        let block = InstructionBlock::new(insts, dest);
        let encoded = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE)?;
        return Ok(encoded.code_buffer);
    }

    let block_start = first.ip();
    let block_end = last.next_ip();
    let mut buf = Cursor::new(Vec::<u8>::with_capacity(100));
    let mut offsets = Vec::with_capacity(insts.len());
    let mut slots = vec![];
    for inst in insts {
        let pos = buf.position();
        offsets.push(pos);
        let Some(table_ref) = encode_far(inst, dest + pos, &mut buf)? else {
            continue;
        };
        let target = if (block_start..block_end).contains(&table_ref.target) {
            let idx = insts
                .iter()
                .position(|i| i.ip() == table_ref.target)
                .ok_or(Error::UnsupportedInstruction(inst.ip() as usize))?;
            SlotTarget::Moved(idx)
        } else {
            SlotTarget::Absolute(table_ref.target)
        };
        slots.push(PendingSlot {
            disp_pos: pos + table_ref.disp_offset,
            next_ip_pos: pos + table_ref.next_ip_offset,
            target,
        });
    }

    if !slots.is_empty() {
        // jmp over the 8-byte aligned table
        let jmp_end = dest + buf.position() + 5;
        let padding = ((jmp_end + 7) & !7) - jmp_end;
        let skip = padding + slots.len() as u64 * 8;
        buf.write_all(&[0xe9])?;
        buf.write_all(&(skip as u32).to_le_bytes())?;
        buf.write_all(&vec![0xcc; padding as usize])?;

        let mut slot_pos = buf.position();
        for slot in &slots {
            let disp = (slot_pos - slot.next_ip_pos) as u32;
            buf.seek(SeekFrom::Start(slot.disp_pos))?;
            buf.write_all(&disp.to_le_bytes())?;
            let addr = match slot.target {
                SlotTarget::Moved(idx) => dest + offsets[idx],
                SlotTarget::Absolute(addr) => addr,
            };
            buf.seek(SeekFrom::Start(slot_pos))?;
            buf.write_all(&addr.to_le_bytes())?;
            slot_pos += 8;
        }
    }
    Ok(buf.into_inner())
}

fn encode_far<W: Write>(inst: &Instruction, ip: u64, buf: &mut W) -> Result<Option<TableRef>> {
    let mut encoder = Encoder::new(64);
    match inst.flow_control() {
        FlowControl::UnconditionalBranch => {
            // jmp qword ptr [rip+slot]
            buf.write_all(&[0xff, 0x25, 0, 0, 0, 0])?;
            Ok(Some(TableRef {
                disp_offset: 2,
                next_ip_offset: 6,
                target: inst.near_branch_target(),
            }))
        }
        FlowControl::IndirectBranch if inst.is_ip_rel_memory_operand() => {
            // mov [rsp-0x10], rax
            // mov rax, addr
            // push qword ptr [rax]
            // mov rax, [rsp-8]
            // ret
            buf.write_all(&[0x48, 0x89, 0x44, 0x24, 0xf0, 0x48, 0xb8])?;
            buf.write_all(&inst.ip_rel_memory_address().to_le_bytes())?;
            buf.write_all(&[0xff, 0x30, 0x48, 0x8b, 0x44, 0x24, 0xf8, 0xc3])?;
            Ok(None)
        }
        FlowControl::ConditionalBranch if inst.is_jcc_short_or_near() => {
            // j!cc skip; jmp qword ptr [rip+slot]; skip:
            let mut skip = *inst;
            skip.negate_condition_code();
            skip.set_near_branch64(ip + 8);
            skip.as_short_branch();
            encoder.encode(&skip, ip)?;
            buf.write_all(&encoder.take_buffer())?;
            buf.write_all(&[0xff, 0x25, 0, 0, 0, 0])?;
            Ok(Some(TableRef {
                disp_offset: 4,
                next_ip_offset: 8,
                target: inst.near_branch_target(),
            }))
        }
        FlowControl::ConditionalBranch
            if inst.is_jcx_short() || inst.is_loop() || inst.is_loopcc() =>
        {
            // jrcxz taken; jmp short skip; taken: jmp qword ptr [rip+slot]; skip:
            let mut taken = *inst;
            taken.set_near_branch64(ip + 4);
            encoder.encode(&taken, ip)?;
            buf.write_all(&encoder.take_buffer())?;
            buf.write_all(&[0xeb, 0x06, 0xff, 0x25, 0, 0, 0, 0])?;
            Ok(Some(TableRef {
                disp_offset: 6,
                next_ip_offset: 10,
                target: inst.near_branch_target(),
            }))
        }
        FlowControl::Call if inst.is_call_near() => {
            // call qword ptr [rip+slot]
            buf.write_all(&[0xff, 0x15, 0, 0, 0, 0])?;
            Ok(Some(TableRef {
                disp_offset: 2,
                next_ip_offset: 6,
                target: inst.near_branch_target(),
            }))
        }
        FlowControl::IndirectCall if inst.is_ip_rel_memory_operand() => {
            // mov [rsp-0x18], rax
            // mov rax, addr
            // push ret_lo
            // mov dword ptr [rsp+4], ret_hi
            // push qword ptr [rax]
            // mov rax, [rsp-8]
            // ret
            buf.write_all(&[0x48, 0x89, 0x44, 0x24, 0xe8, 0x48, 0xb8])?;
            buf.write_all(&inst.ip_rel_memory_address().to_le_bytes())?;
            let ret_addr = ip + 0x24;
            buf.write_all(&[0x68])?;
            buf.write_all(&(ret_addr as u32).to_le_bytes())?;
            buf.write_all(&[0xc7, 0x44, 0x24, 0x04])?;
            buf.write_all(&((ret_addr >> 32) as u32).to_le_bytes())?;
            buf.write_all(&[0xff, 0x30, 0x48, 0x8b, 0x44, 0x24, 0xf8, 0xc3])?;
            Ok(None)
        }
        FlowControl::Call | FlowControl::XbeginXabortXend => {
            Err(Error::UnsupportedInstruction(inst.ip() as usize))
        }
        _ if inst.is_ip_rel_memory_operand() => {
            // the rewrite borrows the stack below rsp
            if inst.op0_register() == Register::RSP {
                return Err(Error::UnsupportedInstruction(inst.ip() as usize));
            }
            buf.write_all(&encode_rip_rel(inst, ip)?)?;
            Ok(None)
        }
        _ => {
            encoder.encode(inst, ip)?;
            buf.write_all(&encoder.take_buffer())?;
            Ok(None)
        }
    }
}

fn encode_rip_rel(inst: &Instruction, ip: u64) -> Result<Vec<u8>> {
    let addr = inst.ip_rel_memory_address();
    if inst.mnemonic() == Mnemonic::Lea {
        // lea reg, [rip+x] => mov reg, addr
        let reg = inst.op0_register();
        let mov = if reg.is_gpr64() {
            Instruction::with2(Code::Mov_r64_imm64, reg, addr)?
        } else if reg.is_gpr32() {
            Instruction::with2(Code::Mov_r32_imm32, reg, addr as u32)?
        } else {
            return Err(Error::UnsupportedInstruction(inst.ip() as usize));
        };
        let mut encoder = Encoder::new(64);
        encoder.encode(&mov, ip)?;
        return Ok(encoder.take_buffer());
    }

    // mov [rsp-0x10], tmp
    // mov tmp, addr
    // <inst with [tmp]>
    // mov tmp, [rsp-0x10]
    let tmp = scratch_register(inst);
    let save = Instruction::with2(
        Code::Mov_rm64_r64,
        MemoryOperand::with_base_displ(Register::RSP, -16),
        tmp,
    )?;
    let load = Instruction::with2(Code::Mov_r64_imm64, tmp, addr)?;
    let mut body = *inst;
    body.set_memory_base(tmp);
    body.set_memory_displacement64(0);
    body.set_memory_displ_size(0);
    let stack_inc = inst.stack_pointer_increment() as i64;
    let restore = Instruction::with2(
        Code::Mov_r64_rm64,
        tmp,
        MemoryOperand::with_base_displ(Register::RSP, -16 - stack_inc),
    )?;
    let block = [save, load, body, restore];
    let encoded = BlockEncoder::encode(
        64,
        InstructionBlock::new(&block, ip),
        BlockEncoderOptions::NONE,
    )?;
    Ok(encoded.code_buffer)
}

/// A register the instruction doesn't touch. A rip-relative instruction has
/// at most two register operands, so one of the three is always free.
fn scratch_register(inst: &Instruction) -> Register {
    let uses = |full: Register| {
        (0..inst.op_count())
            .map(|i| inst.op_register(i))
            .any(|r| r != Register::None && r.full_register() == full)
    };
    [Register::RBX, Register::R8]
        .into_iter()
        .find(|&r| !uses(r))
        .unwrap_or(Register::R9)
}
