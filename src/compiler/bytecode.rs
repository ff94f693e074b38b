// MathVM bytecode buffer
// Little-endian immediates, relative jumps, and a label arena for forward references

use super::opcode::{OpCode, Operand};
use crate::error::{ErrorKind, InternalError, Span, TranslationError};

/// Decoded immediate of one instruction
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Immediate {
    None,
    U16(u16),
    I16(i16),
    CtxVar { ctx: u16, slot: u16 },
    I64(i64),
    F64(f64),
}

/// One decoded instruction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instruction {
    pub offset: usize,
    pub op: OpCode,
    pub imm: Immediate,
}

impl Instruction {
    /// Absolute target of a jump instruction
    pub fn jump_target(&self) -> Option<usize> {
        match self.imm {
            Immediate::I16(rel) => Some(jump_target(self.offset, rel)),
            _ => None,
        }
    }
}

/// Jumps are relative to the position of their immediate
pub fn jump_target(insn_offset: usize, rel: i16) -> usize {
    (insn_offset as i64 + 1 + rel as i64) as usize
}

/// Relative offset a jump at `insn_offset` needs to reach `target`
pub fn jump_offset(insn_offset: usize, target: usize) -> Option<i16> {
    let rel = target as i64 - (insn_offset as i64 + 1);
    i16::try_from(rel).ok()
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Bytecode {
    code: Vec<u8>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(code: Vec<u8>) -> Self {
        Self { code }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.code
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn add_insn(&mut self, op: OpCode) {
        self.code.push(op.into());
    }

    pub fn add_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_i16(&mut self, value: i16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_i64(&mut self, value: i64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_f64(&mut self, value: f64) {
        self.code.extend_from_slice(&value.to_bits().to_le_bytes());
    }

    /// Append a whole instruction
    pub fn emit(&mut self, op: OpCode, imm: Immediate) {
        self.add_insn(op);
        match imm {
            Immediate::None => {}
            Immediate::U16(v) => self.add_u16(v),
            Immediate::I16(v) => self.add_i16(v),
            Immediate::CtxVar { ctx, slot } => {
                self.add_u16(ctx);
                self.add_u16(slot);
            }
            Immediate::I64(v) => self.add_i64(v),
            Immediate::F64(v) => self.add_f64(v),
        }
    }

    pub fn set_i16(&mut self, at: usize, value: i16) {
        self.code[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn bytes<const N: usize>(&self, at: usize) -> Option<[u8; N]> {
        self.code.get(at..at + N)?.try_into().ok()
    }

    pub fn read_u16(&self, at: usize) -> Option<u16> {
        self.bytes(at).map(u16::from_le_bytes)
    }

    pub fn read_i16(&self, at: usize) -> Option<i16> {
        self.bytes(at).map(i16::from_le_bytes)
    }

    pub fn read_i64(&self, at: usize) -> Option<i64> {
        self.bytes(at).map(i64::from_le_bytes)
    }

    pub fn read_f64(&self, at: usize) -> Option<f64> {
        self.bytes(at).map(|b| f64::from_bits(u64::from_le_bytes(b)))
    }

    /// Decode the instruction at `offset`
    pub fn decode(&self, offset: usize) -> Result<Instruction, DecodeError> {
        let byte = *self.code.get(offset).ok_or(DecodeError::OutOfBounds)?;
        let op = OpCode::try_from(byte).map_err(DecodeError::UnknownOpcode)?;
        let at = offset + 1;
        let imm = match op.operand() {
            Operand::None => Some(Immediate::None),
            Operand::U16 => self.read_u16(at).map(Immediate::U16),
            Operand::I16 => self.read_i16(at).map(Immediate::I16),
            Operand::CtxVar => self
                .read_u16(at)
                .zip(self.read_u16(at + 2))
                .map(|(ctx, slot)| Immediate::CtxVar { ctx, slot }),
            Operand::I64 => self.read_i64(at).map(Immediate::I64),
            Operand::F64 => self.read_f64(at).map(Immediate::F64),
        };
        let imm = imm.ok_or(DecodeError::Truncated)?;
        Ok(Instruction { offset, op, imm })
    }

    pub fn instructions(&self) -> Instructions<'_> {
        Instructions {
            code: self,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    OutOfBounds,
    UnknownOpcode(u8),
    Truncated,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::OutOfBounds => write!(f, "instruction pointer out of bounds"),
            DecodeError::UnknownOpcode(b) => write!(f, "unknown opcode 0x{:02x}", b),
            DecodeError::Truncated => write!(f, "truncated instruction"),
        }
    }
}

/// Sequential decoder; stops after the first malformed instruction
pub struct Instructions<'a> {
    code: &'a Bytecode,
    offset: usize,
}

impl Iterator for Instructions<'_> {
    type Item = Result<Instruction, (usize, DecodeError)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.code.len() {
            return None;
        }
        match self.code.decode(self.offset) {
            Ok(insn) => {
                self.offset += insn.op.length();
                Some(Ok(insn))
            }
            Err(e) => {
                let at = self.offset;
                self.offset = self.code.len();
                Some(Err((at, e)))
            }
        }
    }
}

// ==================== Labels ====================

/// Handle to a jump target inside one `CodeBuffer`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Default)]
struct LabelSlot {
    bound: Option<usize>,
    /// Offsets of jump instructions still waiting for this label
    pending: Vec<usize>,
}

/// Bytecode under construction for one function
#[derive(Debug, Default)]
pub struct CodeBuffer {
    code: Bytecode,
    labels: Vec<LabelSlot>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn emit(&mut self, op: OpCode, imm: Immediate) {
        self.code.emit(op, imm);
    }

    pub fn op(&mut self, op: OpCode) {
        self.code.emit(op, Immediate::None);
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(LabelSlot::default());
        Label(self.labels.len() - 1)
    }

    /// Emit a jump; forward targets are patched when the label is bound
    pub fn jump(&mut self, op: OpCode, label: Label, span: Span) -> Result<(), TranslationError> {
        debug_assert!(op.is_jump());
        let at = self.code.len();
        let rel = match self.labels[label.0].bound {
            Some(target) => jump_offset(at, target).ok_or_else(|| too_far(span))?,
            None => {
                self.labels[label.0].pending.push(at);
                0
            }
        };
        self.code.emit(op, Immediate::I16(rel));
        Ok(())
    }

    /// Bind `label` to the current offset
    pub fn bind(&mut self, label: Label, span: Span) -> Result<(), TranslationError> {
        let target = self.code.len();
        let slot = &mut self.labels[label.0];
        slot.bound = Some(target);
        for at in std::mem::take(&mut slot.pending) {
            let rel = jump_offset(at, target).ok_or_else(|| too_far(span))?;
            self.code.set_i16(at + 1, rel);
        }
        Ok(())
    }

    /// Finished bytecode; every referenced label must have been bound
    pub fn finish(self, function: &str) -> Result<Bytecode, InternalError> {
        if self.labels.iter().any(|l| !l.pending.is_empty()) {
            return Err(InternalError::UnboundLabel(function.to_string()));
        }
        Ok(self.code)
    }
}

fn too_far(span: Span) -> TranslationError {
    TranslationError::new(
        ErrorKind::LimitExceeded,
        "Jump distance does not fit in 16 bits",
        span,
    )
    .with_help("split the function into smaller functions")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_jump_patched_on_bind() {
        let mut buf = CodeBuffer::new();
        let end = buf.new_label();
        buf.jump(OpCode::Ja, end, Span::default()).unwrap();
        buf.op(OpCode::ILoad1);
        buf.bind(end, Span::default()).unwrap();
        buf.op(OpCode::Stop);
        let code = buf.finish("f").unwrap();

        let insn = code.decode(0).unwrap();
        assert_eq!(insn.jump_target(), Some(4));
        assert_eq!(code.decode(4).unwrap().op, OpCode::Stop);
    }

    #[test]
    fn test_backward_jump() {
        let mut buf = CodeBuffer::new();
        let top = buf.new_label();
        buf.bind(top, Span::default()).unwrap();
        buf.op(OpCode::ILoad0);
        buf.op(OpCode::Pop);
        buf.jump(OpCode::Ja, top, Span::default()).unwrap();
        let code = buf.finish("f").unwrap();
        assert_eq!(code.decode(2).unwrap().jump_target(), Some(0));
    }

    #[test]
    fn test_unbound_label_is_internal_error() {
        let mut buf = CodeBuffer::new();
        let l = buf.new_label();
        buf.jump(OpCode::IfICmpE, l, Span::default()).unwrap();
        assert_eq!(
            buf.finish("g"),
            Err(InternalError::UnboundLabel("g".to_string()))
        );
    }

    #[test]
    fn test_jump_too_far() {
        let mut buf = CodeBuffer::new();
        let l = buf.new_label();
        buf.jump(OpCode::Ja, l, Span::default()).unwrap();
        for _ in 0..40_000 {
            buf.op(OpCode::ILoad0);
        }
        let err = buf.bind(l, Span::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::LimitExceeded);
    }

    #[test]
    fn test_decode_immediates() {
        let mut code = Bytecode::new();
        code.emit(OpCode::DLoad, Immediate::F64(2.5));
        code.emit(OpCode::LoadCtxIVar, Immediate::CtxVar { ctx: 3, slot: 7 });
        code.emit(OpCode::ILoad, Immediate::I64(-9));
        let insns: Vec<_> = code.instructions().map(|i| i.unwrap()).collect();
        assert_eq!(insns[0].imm, Immediate::F64(2.5));
        assert_eq!(insns[1].offset, 9);
        assert_eq!(insns[1].imm, Immediate::CtxVar { ctx: 3, slot: 7 });
        assert_eq!(insns[2].imm, Immediate::I64(-9));
    }

    #[test]
    fn test_truncated_and_unknown() {
        let code = Bytecode::from_bytes(vec![OpCode::SLoad as u8, 1]);
        assert_eq!(code.decode(0), Err(DecodeError::Truncated));
        let code = Bytecode::from_bytes(vec![0xff]);
        assert_eq!(code.decode(0), Err(DecodeError::UnknownOpcode(0xff)));
    }
}
