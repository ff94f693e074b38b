// MathVM runtime values
// Stack cells are untagged; the bytecode's static types decide how to read them

use crate::compiler::VarType;
use std::fmt;

/// One 64-bit stack or local slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Value(u64);

impl Value {
    pub const ZERO: Value = Value(0);

    #[inline]
    pub fn from_int(v: i64) -> Self {
        Value(v as u64)
    }

    #[inline]
    pub fn from_double(v: f64) -> Self {
        Value(v.to_bits())
    }

    #[inline]
    pub fn from_str_id(id: u32) -> Self {
        Value(id as u64)
    }

    #[inline]
    pub fn as_int(self) -> i64 {
        self.0 as i64
    }

    #[inline]
    pub fn as_double(self) -> f64 {
        f64::from_bits(self.0)
    }

    #[inline]
    pub fn as_str_id(self) -> u32 {
        self.0 as u32
    }

    pub fn bits(self) -> u64 {
        self.0
    }
}

/// Print form of a double: shortest text that reads back to the same value,
/// always with a fractional part or exponent (`1.0`, `0.1`, `1e21`)
pub fn format_double(v: f64) -> String {
    format!("{:?}", v)
}

/// Typed value crossing the host boundary
#[derive(Debug, Clone, PartialEq)]
pub enum NativeValue {
    Int(i64),
    Double(f64),
    Str(String),
    Void,
}

impl NativeValue {
    pub fn var_type(&self) -> VarType {
        match self {
            NativeValue::Int(_) => VarType::Int,
            NativeValue::Double(_) => VarType::Double,
            NativeValue::Str(_) => VarType::String,
            NativeValue::Void => VarType::Void,
        }
    }

    pub fn as_int(&self) -> Result<i64, String> {
        match self {
            NativeValue::Int(v) => Ok(*v),
            other => Err(format!("expected int, got {}", other.var_type())),
        }
    }

    pub fn as_double(&self) -> Result<f64, String> {
        match self {
            NativeValue::Double(v) => Ok(*v),
            other => Err(format!("expected double, got {}", other.var_type())),
        }
    }

    pub fn as_str(&self) -> Result<&str, String> {
        match self {
            NativeValue::Str(s) => Ok(s),
            other => Err(format!("expected string, got {}", other.var_type())),
        }
    }
}

impl fmt::Display for NativeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeValue::Int(v) => write!(f, "{}", v),
            NativeValue::Double(v) => f.write_str(&format_double(*v)),
            NativeValue::Str(s) => f.write_str(s),
            NativeValue::Void => Ok(()),
        }
    }
}

/// Value of an externally bound top-level variable
#[derive(Debug, Clone, PartialEq)]
pub enum VarValue {
    Int(i64),
    Double(f64),
    Str(String),
}

impl VarValue {
    pub fn var_type(&self) -> VarType {
        match self {
            VarValue::Int(_) => VarType::Int,
            VarValue::Double(_) => VarType::Double,
            VarValue::Str(_) => VarType::String,
        }
    }
}

/// Named variable passed in and out of `execute`
#[derive(Debug, Clone, PartialEq)]
pub struct Var {
    pub name: String,
    pub value: VarValue,
}

impl Var {
    pub fn new(name: impl Into<String>, value: VarValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}
