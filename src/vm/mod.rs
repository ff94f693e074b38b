// MathVM virtual machine

#[cfg(feature = "ffi")]
pub mod ffi;
pub mod interpreter;
pub mod natives;
pub mod value;

pub use interpreter::Interpreter;
pub use natives::NativeRegistry;
pub use value::{NativeValue, Value, Var, VarValue};
