// MathVM AST
// Blocks double as scope nodes for the translator

mod expr;
mod stmt;

pub use expr::*;
pub use stmt::*;
