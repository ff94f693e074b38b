// MathVM textual assembler
// Reads the instruction listing produced by `Code::disassemble` back into bytecode

use super::bytecode::{jump_offset, Bytecode, Immediate};
use super::code::is_var_op;
use super::opcode::{OpCode, Operand};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// A line the assembler could not understand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmError {
    /// 1-based
    pub line: usize,
    pub message: String,
}

impl AsmError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AsmError: {} at line {}", self.message, self.line)
    }
}

impl std::error::Error for AsmError {}

/// One `function <id> <name>:` section of a full listing
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledFunction {
    pub id: u16,
    pub name: String,
    /// Symbol of a `native '<symbol>'` header
    pub native: Option<String>,
    pub bytecode: Bytecode,
}

fn instruction_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:(\d+):\s*)?([A-Z][A-Z0-9]*)(?:\s+([^;\s]+))?\s*(?:;.*)?$")
            .expect("instruction pattern is valid")
    })
}

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^function\s+(\d+)\s+(\S+?)(?:\s+native\s+'(.*)')?:$")
            .expect("header pattern is valid")
    })
}

fn var_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^@(\d+)(?::(\d+))?$").expect("variable pattern is valid"))
}

/// Assemble instruction lines into one function's bytecode.
///
/// Blank lines and `;` comments are skipped. An `N:` prefix, when present,
/// must match the offset the instruction lands at. Jump operands are
/// absolute targets.
pub fn assemble(text: &str) -> Result<Bytecode, AsmError> {
    let mut code = Bytecode::new();
    for (index, line) in text.lines().enumerate() {
        assemble_line(&mut code, line, index + 1)?;
    }
    Ok(code)
}

/// Assemble a whole disassembly listing, one entry per function header
pub fn assemble_listing(text: &str) -> Result<Vec<AssembledFunction>, AsmError> {
    let mut functions: Vec<AssembledFunction> = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let number = index + 1;
        if let Some(caps) = header_re().captures(line.trim()) {
            let id = caps[1]
                .parse()
                .map_err(|_| AsmError::new(number, format!("Function id '{}' out of range", &caps[1])))?;
            functions.push(AssembledFunction {
                id,
                name: caps[2].to_string(),
                native: caps.get(3).map(|m| m.as_str().to_string()),
                bytecode: Bytecode::new(),
            });
            continue;
        }
        match functions.last_mut() {
            Some(function) => assemble_line(&mut function.bytecode, line, number)?,
            None if is_blank(line) => {}
            None => return Err(AsmError::new(number, "Instruction before any function header")),
        }
    }
    Ok(functions)
}

fn is_blank(line: &str) -> bool {
    let line = line.trim();
    line.is_empty() || line.starts_with(';')
}

fn assemble_line(code: &mut Bytecode, line: &str, number: usize) -> Result<(), AsmError> {
    if is_blank(line) {
        return Ok(());
    }
    let caps = instruction_re()
        .captures(line.trim())
        .ok_or_else(|| AsmError::new(number, format!("Cannot parse '{}'", line.trim())))?;

    let offset = code.len();
    if let Some(label) = caps.get(1) {
        if label.as_str().parse::<usize>().ok() != Some(offset) {
            return Err(AsmError::new(
                number,
                format!("Offset {} does not match position {}", label.as_str(), offset),
            ));
        }
    }
    let mnemonic = &caps[2];
    let op = OpCode::from_mnemonic(mnemonic)
        .ok_or_else(|| AsmError::new(number, format!("Unknown instruction '{}'", mnemonic)))?;
    let operand = caps.get(3).map(|m| m.as_str());
    let imm = immediate(op, operand, offset).map_err(|message| AsmError::new(number, message))?;
    code.emit(op, imm);
    Ok(())
}

fn immediate(op: OpCode, operand: Option<&str>, offset: usize) -> Result<Immediate, String> {
    let kind = op.operand();
    let text = match (kind, operand) {
        (Operand::None, None) => return Ok(Immediate::None),
        (Operand::None, Some(extra)) => {
            return Err(format!("{} takes no operand, found '{}'", op.mnemonic(), extra))
        }
        (_, None) => return Err(format!("{} needs an operand", op.mnemonic())),
        (_, Some(text)) => text,
    };
    let bad = || format!("Invalid operand '{}' for {}", text, op.mnemonic());

    match kind {
        Operand::I16 => {
            let target: usize = text.parse().map_err(|_| bad())?;
            jump_offset(offset, target)
                .map(Immediate::I16)
                .ok_or_else(|| format!("Jump target {} is too far from {}", target, offset))
        }
        Operand::CtxVar => {
            let caps = var_re().captures(text).ok_or_else(bad)?;
            let slot = caps[1].parse().map_err(|_| bad())?;
            let ctx = caps
                .get(2)
                .ok_or_else(bad)?
                .as_str()
                .parse()
                .map_err(|_| bad())?;
            Ok(Immediate::CtxVar { ctx, slot })
        }
        Operand::U16 if is_var_op(op) => {
            let caps = var_re().captures(text).ok_or_else(bad)?;
            if caps.get(2).is_some() {
                return Err(bad());
            }
            caps[1].parse().map(Immediate::U16).map_err(|_| bad())
        }
        Operand::U16 => text.parse().map(Immediate::U16).map_err(|_| bad()),
        Operand::I64 => text.parse().map(Immediate::I64).map_err(|_| bad()),
        Operand::F64 => text.parse().map(Immediate::F64).map_err(|_| bad()),
        Operand::None => Ok(Immediate::None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{FunctionBody, Translator};

    #[test]
    fn test_assemble_simple_listing() {
        let code = assemble(
            "0: ILOAD 42\n\
             9: STOREIVAR @0 ; x\n\
             \n\
             12: LOADCTXDVAR @3:1\n\
             17: JA 0\n\
             20: STOP",
        )
        .unwrap();
        let insns: Vec<_> = code.instructions().map(|i| i.unwrap()).collect();
        assert_eq!(insns[0].imm, Immediate::I64(42));
        assert_eq!(insns[1].imm, Immediate::U16(0));
        assert_eq!(insns[2].imm, Immediate::CtxVar { ctx: 1, slot: 3 });
        assert_eq!(insns[3].jump_target(), Some(0));
        assert_eq!(insns[4].op, OpCode::Stop);
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        let err = assemble("ILOAD1\nFROB 3").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("FROB"));

        let err = assemble("ILOAD").unwrap_err();
        assert_eq!(err.line, 1);

        let err = assemble("ILOAD0\n5: STOP").unwrap_err();
        assert_eq!(err.line, 2);

        assert!(assemble("STOREIVAR @1:2").is_err());
        assert!(assemble("POP 3").is_err());
    }

    #[test]
    fn test_disassembly_reassembles_byte_for_byte() {
        let source = "int i; double acc = 0.5; string s = 'a;b';\n\
                      function double scale(double v) { return v * -2.5; }\n\
                      function void show() { print(s, acc); }\n\
                      for (i in 1..10) { if (i % 2 == 0 && !(i > 7)) { acc += scale(i); } }\n\
                      while (acc < 0) { acc = acc / 2; }\n\
                      show();";
        let code = Translator::new().translate(source).unwrap();
        let listing = assemble_listing(&code.disassemble_to_string()).unwrap();
        assert_eq!(listing.len(), code.functions().len());
        for (function, assembled) in code.functions().iter().zip(&listing) {
            assert_eq!(assembled.id, function.id);
            assert_eq!(assembled.name, function.name);
            if let FunctionBody::Bytecode(bytecode) = &function.body {
                assert_eq!(&assembled.bytecode, bytecode, "function {}", function.name);
            }
        }
    }

    #[test]
    fn test_native_header() {
        let listing = assemble_listing("function 1 sqrt native 'sqrt':\nfunction 0 <top>:\n0: STOP\n").unwrap();
        assert_eq!(listing[0].native.as_deref(), Some("sqrt"));
        assert!(listing[0].bytecode.is_empty());
        assert_eq!(listing[1].bytecode.len(), 1);
    }
}
