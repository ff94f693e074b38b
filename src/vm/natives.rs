// MathVM native functions
// Host functions callable through `function T name(...) native 'symbol';`

use crate::compiler::{NativeDecl, NativeSignature, VarType};
use crate::vm::value::NativeValue;
use rustc_hash::FxHashMap;

/// Host function signature
pub type NativeFn = fn(&[NativeValue]) -> Result<NativeValue, String>;

#[derive(Debug, Clone)]
struct NativeEntry {
    signature: NativeSignature,
    func: NativeFn,
}

/// Why a native declaration cannot be accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeCheck {
    Unknown,
    Mismatch { registered: NativeSignature },
}

/// Something the interpreter can invoke for a `CALLNATIVE`
#[derive(Debug, Clone)]
pub enum NativeImpl {
    Builtin(NativeFn),
    #[cfg(feature = "ffi")]
    Foreign(super::ffi::ForeignFn),
}

impl NativeImpl {
    pub fn call(&self, args: &[NativeValue]) -> Result<NativeValue, String> {
        match self {
            NativeImpl::Builtin(func) => func(args),
            #[cfg(feature = "ffi")]
            NativeImpl::Foreign(foreign) => foreign.call(args),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NativeRegistry {
    entries: FxHashMap<String, NativeEntry>,
}

impl NativeRegistry {
    /// Registry with nothing registered
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        use VarType::{Double as D, Int as I, String as S};

        let mut registry = Self::new();
        registry.register("sqrt", NativeSignature::new(D, &[D]), native_sqrt);
        registry.register("sin", NativeSignature::new(D, &[D]), native_sin);
        registry.register("cos", NativeSignature::new(D, &[D]), native_cos);
        registry.register("tan", NativeSignature::new(D, &[D]), native_tan);
        registry.register("exp", NativeSignature::new(D, &[D]), native_exp);
        registry.register("log", NativeSignature::new(D, &[D]), native_log);
        registry.register("pow", NativeSignature::new(D, &[D, D]), native_pow);
        registry.register("fabs", NativeSignature::new(D, &[D]), native_fabs);
        registry.register("floor", NativeSignature::new(D, &[D]), native_floor);
        registry.register("ceil", NativeSignature::new(D, &[D]), native_ceil);
        registry.register("abs", NativeSignature::new(I, &[I]), native_abs);
        registry.register("strlen", NativeSignature::new(I, &[S]), native_strlen);
        registry.register("atoi", NativeSignature::new(I, &[S]), native_atoi);
        registry.register("atof", NativeSignature::new(D, &[S]), native_atof);
        registry.register("itos", NativeSignature::new(S, &[I]), native_itos);
        registry
    }

    /// Add or replace a host function
    pub fn register(&mut self, symbol: &str, signature: NativeSignature, func: NativeFn) {
        self.entries
            .insert(symbol.to_string(), NativeEntry { signature, func });
    }

    /// Accept a declaration if its symbol resolves with the declared signature
    pub fn check(&self, decl: &NativeDecl) -> Result<(), NativeCheck> {
        match self.entries.get(&decl.symbol) {
            Some(entry) if entry.signature == decl.signature => Ok(()),
            Some(entry) => Err(NativeCheck::Mismatch {
                registered: entry.signature.clone(),
            }),
            None => self.check_foreign(decl),
        }
    }

    #[cfg(feature = "ffi")]
    fn check_foreign(&self, decl: &NativeDecl) -> Result<(), NativeCheck> {
        super::ffi::ForeignFn::resolve(decl)
            .map(|_| ())
            .map_err(|_| NativeCheck::Unknown)
    }

    #[cfg(not(feature = "ffi"))]
    fn check_foreign(&self, _decl: &NativeDecl) -> Result<(), NativeCheck> {
        Err(NativeCheck::Unknown)
    }

    /// Callable for a declaration, or a message explaining why none exists
    pub fn resolve(&self, decl: &NativeDecl) -> Result<NativeImpl, String> {
        match self.entries.get(&decl.symbol) {
            Some(entry) if entry.signature == decl.signature => Ok(NativeImpl::Builtin(entry.func)),
            Some(entry) => Err(format!(
                "native '{}' is registered as {}, declared as {}",
                decl.symbol, entry.signature, decl.signature
            )),
            None => self.resolve_foreign(decl),
        }
    }

    #[cfg(feature = "ffi")]
    fn resolve_foreign(&self, decl: &NativeDecl) -> Result<NativeImpl, String> {
        super::ffi::ForeignFn::resolve(decl).map(NativeImpl::Foreign)
    }

    #[cfg(not(feature = "ffi"))]
    fn resolve_foreign(&self, decl: &NativeDecl) -> Result<NativeImpl, String> {
        Err(format!("native '{}' is not available", decl.symbol))
    }
}

// ==================== Builtins ====================

fn double_arg(args: &[NativeValue], idx: usize) -> Result<f64, String> {
    args.get(idx)
        .ok_or_else(|| format!("Expected at least {} argument(s)", idx + 1))?
        .as_double()
}

fn int_arg(args: &[NativeValue], idx: usize) -> Result<i64, String> {
    args.get(idx)
        .ok_or_else(|| format!("Expected at least {} argument(s)", idx + 1))?
        .as_int()
}

fn str_arg(args: &[NativeValue], idx: usize) -> Result<&str, String> {
    args.get(idx)
        .ok_or_else(|| format!("Expected at least {} argument(s)", idx + 1))?
        .as_str()
}

fn native_sqrt(args: &[NativeValue]) -> Result<NativeValue, String> {
    Ok(NativeValue::Double(double_arg(args, 0)?.sqrt()))
}

fn native_sin(args: &[NativeValue]) -> Result<NativeValue, String> {
    Ok(NativeValue::Double(double_arg(args, 0)?.sin()))
}

fn native_cos(args: &[NativeValue]) -> Result<NativeValue, String> {
    Ok(NativeValue::Double(double_arg(args, 0)?.cos()))
}

fn native_tan(args: &[NativeValue]) -> Result<NativeValue, String> {
    Ok(NativeValue::Double(double_arg(args, 0)?.tan()))
}

fn native_exp(args: &[NativeValue]) -> Result<NativeValue, String> {
    Ok(NativeValue::Double(double_arg(args, 0)?.exp()))
}

fn native_log(args: &[NativeValue]) -> Result<NativeValue, String> {
    Ok(NativeValue::Double(double_arg(args, 0)?.ln()))
}

fn native_pow(args: &[NativeValue]) -> Result<NativeValue, String> {
    let base = double_arg(args, 0)?;
    let exp = double_arg(args, 1)?;
    Ok(NativeValue::Double(base.powf(exp)))
}

fn native_fabs(args: &[NativeValue]) -> Result<NativeValue, String> {
    Ok(NativeValue::Double(double_arg(args, 0)?.abs()))
}

fn native_floor(args: &[NativeValue]) -> Result<NativeValue, String> {
    Ok(NativeValue::Double(double_arg(args, 0)?.floor()))
}

fn native_ceil(args: &[NativeValue]) -> Result<NativeValue, String> {
    Ok(NativeValue::Double(double_arg(args, 0)?.ceil()))
}

fn native_abs(args: &[NativeValue]) -> Result<NativeValue, String> {
    Ok(NativeValue::Int(int_arg(args, 0)?.wrapping_abs()))
}

fn native_strlen(args: &[NativeValue]) -> Result<NativeValue, String> {
    Ok(NativeValue::Int(str_arg(args, 0)?.len() as i64))
}

/// C `atoi`: optional sign and leading digits, 0 when there are none
fn native_atoi(args: &[NativeValue]) -> Result<NativeValue, String> {
    let s = str_arg(args, 0)?.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let mut n: i64 = 0;
    for b in digits.bytes().take_while(u8::is_ascii_digit) {
        n = n.wrapping_mul(10).wrapping_add((b - b'0') as i64);
    }
    Ok(NativeValue::Int(if negative { n.wrapping_neg() } else { n }))
}

/// C `atof`: longest parseable prefix, 0.0 when there is none
fn native_atof(args: &[NativeValue]) -> Result<NativeValue, String> {
    let s = str_arg(args, 0)?.trim_start();
    let value = (0..=s.len())
        .rev()
        .filter(|end| s.is_char_boundary(*end))
        .find_map(|end| s[..end].parse::<f64>().ok())
        .unwrap_or(0.0);
    Ok(NativeValue::Double(value))
}

fn native_itos(args: &[NativeValue]) -> Result<NativeValue, String> {
    Ok(NativeValue::Str(int_arg(args, 0)?.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(symbol: &str, ret: VarType, params: &[VarType]) -> NativeDecl {
        NativeDecl {
            symbol: symbol.to_string(),
            signature: NativeSignature::new(ret, params),
        }
    }

    #[test]
    fn test_check_signatures() {
        let registry = NativeRegistry::with_builtins();
        assert_eq!(
            registry.check(&decl("sqrt", VarType::Double, &[VarType::Double])),
            Ok(())
        );
        assert!(matches!(
            registry.check(&decl("sqrt", VarType::Int, &[VarType::Int])),
            Err(NativeCheck::Mismatch { .. })
        ));
    }

    #[cfg(not(feature = "ffi"))]
    #[test]
    fn test_unknown_symbol() {
        let registry = NativeRegistry::with_builtins();
        assert_eq!(
            registry.check(&decl("no_such_fn", VarType::Void, &[])),
            Err(NativeCheck::Unknown)
        );
        assert!(registry
            .resolve(&decl("no_such_fn", VarType::Void, &[]))
            .is_err());
    }

    #[test]
    fn test_builtin_calls() {
        let registry = NativeRegistry::with_builtins();
        let sqrt = registry
            .resolve(&decl("sqrt", VarType::Double, &[VarType::Double]))
            .unwrap();
        assert_eq!(sqrt.call(&[NativeValue::Double(16.0)]), Ok(NativeValue::Double(4.0)));

        assert_eq!(
            native_atoi(&[NativeValue::Str("  -42abc".into())]),
            Ok(NativeValue::Int(-42))
        );
        assert_eq!(
            native_atof(&[NativeValue::Str("2.5x".into())]),
            Ok(NativeValue::Double(2.5))
        );
        assert_eq!(
            native_atof(&[NativeValue::Str("abc".into())]),
            Ok(NativeValue::Double(0.0))
        );
        assert_eq!(
            native_strlen(&[NativeValue::Str("abcd".into())]),
            Ok(NativeValue::Int(4))
        );
        assert_eq!(native_itos(&[NativeValue::Int(-7)]), Ok(NativeValue::Str("-7".into())));
    }

    #[test]
    fn test_register_custom() {
        fn twice(args: &[NativeValue]) -> Result<NativeValue, String> {
            Ok(NativeValue::Int(args[0].as_int()? * 2))
        }
        let mut registry = NativeRegistry::new();
        registry.register("twice", NativeSignature::new(VarType::Int, &[VarType::Int]), twice);
        let d = decl("twice", VarType::Int, &[VarType::Int]);
        assert_eq!(registry.check(&d), Ok(()));
        assert_eq!(
            registry.resolve(&d).unwrap().call(&[NativeValue::Int(21)]),
            Ok(NativeValue::Int(42))
        );
    }

    #[test]
    fn test_wrong_argument_type() {
        assert!(native_sqrt(&[NativeValue::Int(4)]).is_err());
        assert!(native_sqrt(&[]).is_err());
    }
}
