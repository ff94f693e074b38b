// C symbols for native declarations, looked up in the running process
// int maps to int64_t, double to double, string to const char*

use crate::compiler::{NativeDecl, NativeSignature, VarType};
use crate::vm::value::NativeValue;
use libffi::middle::{Arg, Cif, CodePtr, Type as FfiType};
use libloading::Library;
use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ForeignFn {
    address: usize,
    signature: NativeSignature,
    _library: Arc<Library>,
}

fn this_process() -> Result<Library, String> {
    #[cfg(unix)]
    {
        Ok(libloading::os::unix::Library::this().into())
    }
    #[cfg(windows)]
    {
        libloading::os::windows::Library::this()
            .map(Into::into)
            .map_err(|e| e.to_string())
    }
}

fn ffi_type(ty: VarType) -> Result<FfiType, String> {
    match ty {
        VarType::Void => Ok(FfiType::void()),
        VarType::Int => Ok(FfiType::i64()),
        VarType::Double => Ok(FfiType::f64()),
        VarType::String => Ok(FfiType::pointer()),
        VarType::Invalid => Err("invalid type in native signature".to_string()),
    }
}

enum CArg {
    Int(i64),
    Double(f64),
    Ptr(*const c_char),
}

impl ForeignFn {
    pub fn resolve(decl: &NativeDecl) -> Result<Self, String> {
        let library = this_process()?;
        let name = CString::new(decl.symbol.as_str())
            .map_err(|_| format!("invalid symbol name '{}'", decl.symbol))?;
        let address = unsafe {
            let symbol = library
                .get::<*const c_void>(name.as_bytes_with_nul())
                .map_err(|e| format!("native '{}' not found: {}", decl.symbol, e))?;
            *symbol as usize
        };
        Ok(Self {
            address,
            signature: decl.signature.clone(),
            _library: Arc::new(library),
        })
    }

    pub fn call(&self, args: &[NativeValue]) -> Result<NativeValue, String> {
        if args.len() != self.signature.params.len() {
            return Err(format!(
                "Argument count mismatch: expected {}, got {}",
                self.signature.params.len(),
                args.len()
            ));
        }

        // Owned C strings must outlive the call
        let mut cstrings = Vec::new();
        let mut values = Vec::with_capacity(args.len());
        for (arg, ty) in args.iter().zip(&self.signature.params) {
            let value = match (arg, ty) {
                (NativeValue::Int(v), VarType::Int) => CArg::Int(*v),
                (NativeValue::Double(v), VarType::Double) => CArg::Double(*v),
                (NativeValue::Str(s), VarType::String) => {
                    let c = CString::new(s.as_str())
                        .map_err(|_| "Invalid C string (contains null byte)".to_string())?;
                    let ptr = c.as_ptr();
                    cstrings.push(c);
                    CArg::Ptr(ptr)
                }
                (other, ty) => {
                    return Err(format!("expected {}, got {}", ty, other.var_type()));
                }
            };
            values.push(value);
        }

        let types = self
            .signature
            .params
            .iter()
            .map(|t| ffi_type(*t))
            .collect::<Result<Vec<_>, _>>()?;
        let cif = Cif::new(types, ffi_type(self.signature.return_type)?);
        let ffi_args: Vec<Arg> = values
            .iter()
            .map(|v| match v {
                CArg::Int(i) => Arg::new(i),
                CArg::Double(d) => Arg::new(d),
                CArg::Ptr(p) => Arg::new(p),
            })
            .collect();
        let code = CodePtr::from_ptr(self.address as *const c_void);

        let result = unsafe {
            match self.signature.return_type {
                VarType::Int => NativeValue::Int(cif.call::<i64>(code, &ffi_args)),
                VarType::Double => NativeValue::Double(cif.call::<f64>(code, &ffi_args)),
                VarType::String => {
                    let ptr: *const c_char = cif.call(code, &ffi_args);
                    if ptr.is_null() {
                        NativeValue::Str(String::new())
                    } else {
                        NativeValue::Str(CStr::from_ptr(ptr).to_string_lossy().into_owned())
                    }
                }
                _ => {
                    cif.call::<()>(code, &ffi_args);
                    NativeValue::Void
                }
            }
        };
        drop(cstrings);
        Ok(result)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_missing_symbol() {
        let decl = NativeDecl {
            symbol: "definitely_not_a_symbol_42".to_string(),
            signature: NativeSignature::new(VarType::Void, &[]),
        };
        assert!(ForeignFn::resolve(&decl).is_err());
    }
}
