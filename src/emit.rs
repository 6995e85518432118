use iced_x86::{BlockEncoder, BlockEncoderOptions, Code, IcedError, Instruction, InstructionBlock};

use crate::err::{Error, Result};

/// A branch target inside a [`CodeBuf`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Label(u64);

/// Instructions collected for one block of generated code.
///
/// Labels are small pseudo addresses assigned as the `ip` of the instruction
/// they're bound to; every other instruction keeps ip 0, which the block
/// encoder ignores when resolving branch targets.
pub(crate) struct CodeBuf {
    bitness: u32,
    insts: Vec<Instruction>,
    next_label: u64,
    pending: Option<Label>,
}

impl CodeBuf {
    pub fn new(bitness: u32) -> Self {
        Self {
            bitness,
            insts: vec![],
            next_label: 0,
            pending: None,
        }
    }

    pub fn create_label(&mut self) -> Label {
        self.next_label += 1;
        Label(self.next_label)
    }

    /// Binds `label` to the next pushed instruction.
    pub fn bind(&mut self, label: Label) {
        self.pending = Some(label);
    }

    pub fn push(&mut self, inst: std::result::Result<Instruction, IcedError>) -> Result<()> {
        self.push_inst(inst?);
        Ok(())
    }

    pub fn push_inst(&mut self, mut inst: Instruction) {
        if let Some(label) = self.pending.take() {
            inst.set_ip(label.0);
        }
        self.insts.push(inst);
    }

    pub fn branch(&mut self, code: Code, target: Label) -> Result<()> {
        self.push(Instruction::with_branch(code, target.0))
    }

    /// Finishes the block. Fails if a label was bound past the last instruction.
    pub fn into_instructions(self) -> Result<Vec<Instruction>> {
        if self.pending.is_some() {
            return Err(Error::InvalidParameter);
        }
        Ok(self.insts)
    }

    /// Encodes the block as if it were placed at `ip`.
    pub fn assemble(self, ip: u64) -> Result<Vec<u8>> {
        let bitness = self.bitness;
        assemble(bitness, &self.into_instructions()?, ip)
    }
}

/// Encodes a block of instructions as if it were placed at `ip`.
pub(crate) fn assemble(bitness: u32, insts: &[Instruction], ip: u64) -> Result<Vec<u8>> {
    let block = InstructionBlock::new(insts, ip);
    let encoded = BlockEncoder::encode(bitness, block, BlockEncoderOptions::NONE)?;
    Ok(encoded.code_buffer)
}
