// MathVM
// Translator and stack-machine interpreter for a small typed language

pub mod ast;
pub mod binary;
pub mod compiler;
pub mod config;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod vm;

pub use compiler::{Code, Translator, VarType};
pub use config::VmConfig;
pub use error::{Error, MvmResult, RuntimeError, TranslationError};
pub use vm::{Interpreter, NativeRegistry, Var, VarValue};

/// Translate MathVM source with the builtin natives
pub fn translate(source: &str) -> MvmResult<Code> {
    Translator::new().translate(source)
}

/// Run `code` printing to stdout; `vars` are bound to top-level variables by name
pub fn execute(code: &Code, vars: &mut [Var]) -> MvmResult<()> {
    Interpreter::new(code).execute(vars)
}
