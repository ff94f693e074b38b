// MathVM compiler: AST to bytecode

pub mod asm;
pub mod bytecode;
pub mod code;
pub mod opcode;
pub mod resolver;
pub mod translator;

pub use bytecode::Bytecode;
pub use code::{Code, Function, FunctionBody, NativeDecl, NativeSignature, TopVar, VarType};
pub use opcode::OpCode;
pub use translator::Translator;
