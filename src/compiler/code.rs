// MathVM code object
// Function table, string constant pool and native declarations produced by translation

use super::bytecode::{Bytecode, Immediate};
use super::opcode::{OpCode, Operand};
use crate::error::{Error, InternalError, MvmResult};
use crate::vm::value::format_double;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Write};

pub const TOP_LEVEL_NAME: &str = "<top>";

/// Static type of a variable, parameter or expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarType {
    Invalid,
    Void,
    Double,
    Int,
    String,
}

impl VarType {
    pub fn name(self) -> &'static str {
        match self {
            VarType::Invalid => "<invalid>",
            VarType::Void => "void",
            VarType::Double => "double",
            VarType::Int => "int",
            VarType::String => "string",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, VarType::Int | VarType::Double)
    }

    pub fn to_byte(self) -> u8 {
        match self {
            VarType::Invalid => 0,
            VarType::Void => 1,
            VarType::Double => 2,
            VarType::Int => 3,
            VarType::String => 4,
        }
    }

    pub fn from_byte(byte: u8) -> Option<VarType> {
        Some(match byte {
            0 => VarType::Invalid,
            1 => VarType::Void,
            2 => VarType::Double,
            3 => VarType::Int,
            4 => VarType::String,
            _ => return None,
        })
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NativeSignature {
    pub return_type: VarType,
    pub params: Vec<VarType>,
}

impl NativeSignature {
    pub fn new(return_type: VarType, params: &[VarType]) -> Self {
        Self {
            return_type,
            params: params.to_vec(),
        }
    }
}

impl fmt::Display for NativeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.return_type)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", p)?;
        }
        write!(f, ")")
    }
}

/// Host function referenced from bytecode by native id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NativeDecl {
    pub symbol: String,
    pub signature: NativeSignature,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FunctionBody {
    Bytecode(Bytecode),
    Native(u16),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub id: u16,
    pub context_id: u16,
    pub params: Vec<(VarType, String)>,
    pub return_type: VarType,
    /// Slots needed by the activation, parameters included
    pub locals_count: u16,
    pub body: FunctionBody,
}

impl Function {
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn bytecode(&self) -> Option<&Bytecode> {
        match &self.body {
            FunctionBody::Bytecode(code) => Some(code),
            FunctionBody::Native(_) => None,
        }
    }
}

/// A variable declared in the top-level scope, bindable from the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopVar {
    pub name: String,
    pub ty: VarType,
    pub slot: u16,
}

/// Translated program. Read-only once translation returns it.
#[derive(Debug, Clone, PartialEq)]
pub struct Code {
    functions: Vec<Function>,
    by_name: FxHashMap<String, u16>,
    constants: Vec<String>,
    constant_ids: FxHashMap<String, u16>,
    natives: Vec<NativeDecl>,
    top_vars: Vec<TopVar>,
}

impl Default for Code {
    fn default() -> Self {
        Self::new()
    }
}

impl Code {
    pub fn new() -> Self {
        let mut code = Self {
            functions: Vec::new(),
            by_name: FxHashMap::default(),
            constants: Vec::new(),
            constant_ids: FxHashMap::default(),
            natives: Vec::new(),
            top_vars: Vec::new(),
        };
        // Zeroed string slots must read back as ''
        code.constants.push(String::new());
        code.constant_ids.insert(String::new(), 0);
        code
    }

    /// Register a function; its id is assigned here and returned
    pub fn add_function(&mut self, mut function: Function) -> Option<u16> {
        let id = u16::try_from(self.functions.len()).ok()?;
        function.id = id;
        self.by_name.entry(function.name.clone()).or_insert(id);
        self.functions.push(function);
        Some(id)
    }

    pub fn function_by_id(&self, id: u16) -> MvmResult<&Function> {
        self.functions
            .get(id as usize)
            .ok_or_else(|| Error::NotFound(format!("function #{}", id)))
    }

    /// First function registered under `name`
    pub fn function_by_name(&self, name: &str) -> MvmResult<&Function> {
        self.by_name
            .get(name)
            .and_then(|id| self.functions.get(*id as usize))
            .ok_or_else(|| Error::NotFound(format!("function '{}'", name)))
    }

    pub(crate) fn function_mut(&mut self, id: u16) -> Option<&mut Function> {
        self.functions.get_mut(id as usize)
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    /// Id of `text` in the pool, inserting it if new
    pub fn make_string_constant(&mut self, text: &str) -> Option<u16> {
        if let Some(id) = self.constant_ids.get(text) {
            return Some(*id);
        }
        let id = u16::try_from(self.constants.len()).ok()?;
        self.constants.push(text.to_string());
        self.constant_ids.insert(text.to_string(), id);
        Some(id)
    }

    pub fn constant_by_id(&self, id: u16) -> Result<&str, InternalError> {
        self.constants
            .get(id as usize)
            .map(String::as_str)
            .ok_or(InternalError::ConstantOutOfRange(id))
    }

    pub fn constants(&self) -> &[String] {
        &self.constants
    }

    /// Id of an identical declaration, or a new one
    pub fn add_native(&mut self, decl: NativeDecl) -> Option<u16> {
        if let Some(pos) = self.natives.iter().position(|n| *n == decl) {
            return u16::try_from(pos).ok();
        }
        let id = u16::try_from(self.natives.len()).ok()?;
        self.natives.push(decl);
        Some(id)
    }

    pub fn natives(&self) -> &[NativeDecl] {
        &self.natives
    }

    pub fn native_by_id(&self, id: u16) -> Option<&NativeDecl> {
        self.natives.get(id as usize)
    }

    pub(crate) fn set_top_vars(&mut self, vars: Vec<TopVar>) {
        self.top_vars = vars;
    }

    pub fn top_level_vars(&self) -> &[TopVar] {
        &self.top_vars
    }

    pub fn top_level(&self) -> Option<&Function> {
        self.functions.first()
    }

    // ==================== Disassembly ====================

    pub fn disassemble(&self, out: &mut dyn Write) -> io::Result<()> {
        for function in &self.functions {
            match &function.body {
                FunctionBody::Native(nid) => {
                    let symbol = self
                        .native_by_id(*nid)
                        .map(|n| n.symbol.as_str())
                        .unwrap_or("?");
                    writeln!(
                        out,
                        "function {} {} native '{}':",
                        function.id, function.name, symbol
                    )?;
                }
                FunctionBody::Bytecode(code) => {
                    writeln!(out, "function {} {}:", function.id, function.name)?;
                    self.disassemble_bytecode(code, out)?;
                }
            }
        }
        Ok(())
    }

    pub fn disassemble_bytecode(&self, code: &Bytecode, out: &mut dyn Write) -> io::Result<()> {
        for insn in code.instructions() {
            match insn {
                Ok(insn) => {
                    write!(out, "{}: {}", insn.offset, insn.op.mnemonic())?;
                    match (insn.op.operand(), insn.imm) {
                        (Operand::I16, _) => {
                            write!(out, " {}", insn.jump_target().unwrap_or_default())?
                        }
                        (_, Immediate::CtxVar { ctx, slot }) => write!(out, " @{}:{}", slot, ctx)?,
                        (_, Immediate::U16(v)) if is_var_op(insn.op) => write!(out, " @{}", v)?,
                        (_, Immediate::U16(v)) if insn.op == OpCode::SLoad => {
                            write!(out, " {}", v)?;
                            if let Some(text) = self.constants.get(v as usize) {
                                write!(out, " ; '{}'", text.escape_debug())?;
                            }
                        }
                        (_, Immediate::U16(v)) => write!(out, " {}", v)?,
                        (_, Immediate::I64(v)) => write!(out, " {}", v)?,
                        (_, Immediate::F64(v)) => write!(out, " {}", format_double(v))?,
                        _ => {}
                    }
                    writeln!(out)?;
                }
                Err((offset, e)) => writeln!(out, "{}: <{}>", offset, e)?,
            }
        }
        Ok(())
    }

    pub fn disassemble_to_string(&self) -> String {
        let mut buf = Vec::new();
        // Writing into a Vec cannot fail
        let _ = self.disassemble(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

/// Own-context variable access, shown as `@slot`
pub(crate) fn is_var_op(op: OpCode) -> bool {
    matches!(
        op,
        OpCode::LoadDVar
            | OpCode::LoadIVar
            | OpCode::LoadSVar
            | OpCode::StoreDVar
            | OpCode::StoreIVar
            | OpCode::StoreSVar
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function(name: &str, code: Bytecode) -> Function {
        Function {
            name: name.to_string(),
            id: 0,
            context_id: 0,
            params: Vec::new(),
            return_type: VarType::Void,
            locals_count: 0,
            body: FunctionBody::Bytecode(code),
        }
    }

    #[test]
    fn test_constants_deduplicate() {
        let mut code = Code::new();
        assert_eq!(code.constant_by_id(0), Ok(""));
        let a = code.make_string_constant("hello").unwrap();
        let b = code.make_string_constant("world").unwrap();
        assert_eq!(code.make_string_constant("hello"), Some(a));
        assert_ne!(a, b);
        assert_eq!(code.make_string_constant(""), Some(0));
        assert_eq!(code.constant_by_id(b), Ok("world"));
        assert_eq!(
            code.constant_by_id(99),
            Err(InternalError::ConstantOutOfRange(99))
        );
    }

    #[test]
    fn test_id_space_exhaustion() {
        let mut code = Code::new();
        for i in 1..=u16::MAX {
            assert_eq!(code.make_string_constant(&i.to_string()), Some(i));
        }
        assert_eq!(code.make_string_constant("overflow"), None);
        // existing entries still resolve
        assert_eq!(code.make_string_constant("7"), Some(7));

        for _ in 0..=u16::MAX {
            assert!(code.add_function(function("f", Bytecode::new())).is_some());
        }
        assert_eq!(code.add_function(function("g", Bytecode::new())), None);
    }

    #[test]
    fn test_function_lookup() {
        let mut code = Code::new();
        let top = code.add_function(function(TOP_LEVEL_NAME, Bytecode::new())).unwrap();
        let f = code.add_function(function("f", Bytecode::new())).unwrap();
        assert_eq!(top, 0);
        assert_eq!(code.function_by_name("f").unwrap().id, f);
        assert_eq!(code.function_by_id(f).unwrap().name, "f");
        assert!(matches!(code.function_by_name("g"), Err(Error::NotFound(_))));
        assert!(matches!(code.function_by_id(7), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_disassembly_format() {
        let mut code = Code::new();
        let hi = code.make_string_constant("hi\n").unwrap();
        let mut bc = Bytecode::new();
        bc.emit(OpCode::DLoad, Immediate::F64(1.0));
        bc.emit(OpCode::StoreDVar, Immediate::U16(0));
        bc.emit(OpCode::SLoad, Immediate::U16(hi));
        bc.emit(OpCode::LoadCtxIVar, Immediate::CtxVar { ctx: 2, slot: 1 });
        bc.emit(OpCode::Ja, Immediate::I16(-1));
        bc.emit(OpCode::Stop, Immediate::None);
        code.add_function(function(TOP_LEVEL_NAME, bc));

        let text = code.disassemble_to_string();
        let expected = "function 0 <top>:\n\
                        0: DLOAD 1.0\n\
                        9: STOREDVAR @0\n\
                        12: SLOAD 1 ; 'hi\\n'\n\
                        15: LOADCTXIVAR @1:2\n\
                        20: JA 20\n\
                        23: STOP\n";
        assert_eq!(text, expected);
    }
}
