//! Prologue decoding and trampoline construction for detours.

use iced_x86::{Decoder, DecoderOptions, Instruction};
use tracing::{debug, trace};

use crate::alloc::RemoteAlloc;
use crate::arch::Arch;
use crate::err::{Error, Result};
use crate::memory;
use crate::process::{AddressSpace, Protection};

/// Maximum length of an x86 instruction.
const MAX_INST_LEN: usize = 15;

/// Bytes reserved for every trampoline.
pub const TRAMPOLINE_CAPACITY: usize = 0x100;

/// Decodes whole instructions at `addr` until at least `min_len` bytes are
/// covered.
///
/// The bytes are read through [`memory::read`], so unreadable code is handled
/// like any other read. An undecodable instruction, or code running into the
/// end of its region, is an [`Error::Disassemble`] at the failing address.
pub fn disassemble<A: Arch, S: AddressSpace + ?Sized>(
    space: &S,
    addr: usize,
    min_len: usize,
) -> Result<Vec<Instruction>> {
    let window = (min_len * 3).max(min_len + MAX_INST_LEN);
    let region = space.query(addr)?;
    let len = window.min(region.end().saturating_sub(addr));
    let code = memory::read_vec(space, addr, len)?;

    let mut decoder = Decoder::with_ip(A::BITNESS, &code, addr as u64, DecoderOptions::NONE);
    let mut insts = vec![];
    let mut consumed = 0;
    while consumed < min_len {
        if !decoder.can_decode() {
            return Err(Error::Disassemble(addr + consumed));
        }
        let inst = decoder.decode();
        if inst.is_invalid() {
            return Err(Error::Disassemble(addr + consumed));
        }
        trace!(ip = inst.ip(), len = inst.len(), code = ?inst.code(), "decoded");
        consumed += inst.len();
        insts.push(inst);
    }
    Ok(insts)
}

/// Relocated prologue instructions followed by a jump back into the original
/// function.
pub(crate) struct Trampoline<'a, S: AddressSpace + ?Sized> {
    alloc: RemoteAlloc<'a, S>,
    resume: usize,
}

impl<'a, S: AddressSpace + ?Sized> Trampoline<'a, S> {
    /// Writes a trampoline for `insts`, the decoded instructions at the start
    /// of the function, into memory allocated near them.
    pub fn build<A: Arch>(space: &'a S, insts: &[Instruction]) -> Result<Self> {
        let (Some(first), Some(last)) = (insts.first(), insts.last()) else {
            return Err(Error::InvalidParameter);
        };
        let target = first.ip() as usize;
        let resume = last.next_ip() as usize;

        let alloc = RemoteAlloc::near(space, target, TRAMPOLINE_CAPACITY, Protection::EXECUTE_READWRITE)?;
        let base = alloc.base() as u64;
        let mut code = A::relocate(insts, base)?;
        let exit = A::encode_exit_jump(base + code.len() as u64, resume as u64);
        code.extend_from_slice(&exit);
        if code.len() > TRAMPOLINE_CAPACITY {
            return Err(Error::TrampolineOverflow {
                needed: code.len(),
                capacity: TRAMPOLINE_CAPACITY,
            });
        }

        memory::write(space, alloc.base(), &code)?;
        space.flush_instruction_cache(alloc.base(), code.len())?;
        debug!(
            target,
            trampoline = alloc.base(),
            len = code.len(),
            stolen = resume - target,
            "trampoline written"
        );
        Ok(Self { alloc, resume })
    }

    pub fn base(&self) -> usize {
        self.alloc.base()
    }

    /// First original instruction not copied into the trampoline.
    pub fn resume(&self) -> usize {
        self.resume
    }
}
