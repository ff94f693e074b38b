// Compiled MathVM files (.mvmc)
// Layout: magic, version, constant pool, native table, function table, top-level vars.
// All lengths and numbers are little-endian.

use crate::compiler::{
    Bytecode, Code, Function, FunctionBody, NativeDecl, NativeSignature, TopVar, VarType,
};

const MAGIC: &[u8; 4] = b"MVMC";
const VERSION: u8 = 1;

const BODY_BYTECODE: u8 = 0;
const BODY_NATIVE: u8 = 1;

pub fn serialize(code: &Code) -> Vec<u8> {
    let mut out = Vec::new();

    out.extend_from_slice(MAGIC);
    out.push(VERSION);

    // Slot 0 is always the empty string and is not stored
    let constants = code.constants().get(1..).unwrap_or_default();
    write_u32(&mut out, constants.len() as u32);
    for constant in constants {
        write_string(&mut out, constant);
    }

    write_u32(&mut out, code.natives().len() as u32);
    for native in code.natives() {
        write_string(&mut out, &native.symbol);
        write_signature(&mut out, &native.signature);
    }

    write_u32(&mut out, code.functions().len() as u32);
    for function in code.functions() {
        serialize_function(&mut out, function);
    }

    write_u32(&mut out, code.top_level_vars().len() as u32);
    for var in code.top_level_vars() {
        write_string(&mut out, &var.name);
        out.push(var.ty.to_byte());
        write_u32(&mut out, var.slot as u32);
    }

    out
}

pub fn deserialize(data: &[u8]) -> Result<Code, String> {
    let mut cursor = 0;

    if data.len() < 5 {
        return Err("Invalid file: too short".to_string());
    }
    if &data[0..4] != MAGIC {
        return Err("Invalid file: not a .mvmc file".to_string());
    }
    cursor += 4;

    let version = data[cursor];
    if version != VERSION {
        return Err(format!("Unsupported version: {}", version));
    }
    cursor += 1;

    let mut code = Code::new();

    let constant_count = read_u32(data, &mut cursor)? as usize;
    for index in 0..constant_count {
        let text = read_string(data, &mut cursor)?;
        match code.make_string_constant(&text) {
            Some(id) if id as usize == index + 1 => {}
            _ => return Err(format!("Invalid file: bad constant #{}", index + 1)),
        }
    }

    let native_count = read_u32(data, &mut cursor)? as usize;
    for index in 0..native_count {
        let symbol = read_string(data, &mut cursor)?;
        let signature = read_signature(data, &mut cursor)?;
        match code.add_native(NativeDecl { symbol, signature }) {
            Some(id) if id as usize == index => {}
            _ => return Err(format!("Invalid file: bad native #{}", index)),
        }
    }

    let function_count = read_u32(data, &mut cursor)? as usize;
    for index in 0..function_count {
        let function = deserialize_function(data, &mut cursor)?;
        match code.add_function(function) {
            Some(id) if id as usize == index => {}
            _ => return Err(format!("Invalid file: bad function #{}", index)),
        }
    }
    if function_count == 0 {
        return Err("Invalid file: no top-level function".to_string());
    }

    let var_count = read_u32(data, &mut cursor)? as usize;
    let mut vars = Vec::with_capacity(var_count);
    for _ in 0..var_count {
        let name = read_string(data, &mut cursor)?;
        let ty = read_type(data, &mut cursor)?;
        let slot = read_u16(data, &mut cursor)?;
        vars.push(TopVar { name, ty, slot });
    }
    code.set_top_vars(vars);

    if cursor != data.len() {
        return Err("Invalid file: trailing data".to_string());
    }
    Ok(code)
}

fn serialize_function(out: &mut Vec<u8>, function: &Function) {
    write_string(out, &function.name);
    write_u32(out, function.context_id as u32);
    out.push(function.return_type.to_byte());
    write_u32(out, function.params.len() as u32);
    for (ty, name) in &function.params {
        out.push(ty.to_byte());
        write_string(out, name);
    }
    write_u32(out, function.locals_count as u32);
    match &function.body {
        FunctionBody::Bytecode(bytecode) => {
            out.push(BODY_BYTECODE);
            write_u32(out, bytecode.len() as u32);
            out.extend_from_slice(bytecode.as_bytes());
        }
        FunctionBody::Native(id) => {
            out.push(BODY_NATIVE);
            write_u32(out, *id as u32);
        }
    }
}

fn deserialize_function(data: &[u8], cursor: &mut usize) -> Result<Function, String> {
    let name = read_string(data, cursor)?;
    let context_id = read_u16(data, cursor)?;
    let return_type = read_type(data, cursor)?;
    let param_count = read_u32(data, cursor)? as usize;
    let mut params = Vec::with_capacity(param_count.min(256));
    for _ in 0..param_count {
        let ty = read_type(data, cursor)?;
        params.push((ty, read_string(data, cursor)?));
    }
    let locals_count = read_u16(data, cursor)?;

    let tag = read_u8(data, cursor)?;
    let body = match tag {
        BODY_BYTECODE => {
            let len = read_u32(data, cursor)? as usize;
            if *cursor + len > data.len() {
                return Err("Invalid file: truncated code".to_string());
            }
            let bytes = data[*cursor..*cursor + len].to_vec();
            *cursor += len;
            FunctionBody::Bytecode(Bytecode::from_bytes(bytes))
        }
        BODY_NATIVE => FunctionBody::Native(read_u16(data, cursor)?),
        other => return Err(format!("Invalid file: unknown function body tag {}", other)),
    };

    Ok(Function {
        name,
        id: 0,
        context_id,
        params,
        return_type,
        locals_count,
        body,
    })
}

fn write_signature(out: &mut Vec<u8>, signature: &NativeSignature) {
    out.push(signature.return_type.to_byte());
    write_u32(out, signature.params.len() as u32);
    for param in &signature.params {
        out.push(param.to_byte());
    }
}

fn read_signature(data: &[u8], cursor: &mut usize) -> Result<NativeSignature, String> {
    let return_type = read_type(data, cursor)?;
    let count = read_u32(data, cursor)? as usize;
    let mut params = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        params.push(read_type(data, cursor)?);
    }
    Ok(NativeSignature::new(return_type, &params))
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn read_u8(data: &[u8], cursor: &mut usize) -> Result<u8, String> {
    let byte = *data.get(*cursor).ok_or("Unexpected end of file")?;
    *cursor += 1;
    Ok(byte)
}

fn read_u32(data: &[u8], cursor: &mut usize) -> Result<u32, String> {
    if *cursor + 4 > data.len() {
        return Err("Unexpected end of file".to_string());
    }
    let bytes = [
        data[*cursor],
        data[*cursor + 1],
        data[*cursor + 2],
        data[*cursor + 3],
    ];
    *cursor += 4;
    Ok(u32::from_le_bytes(bytes))
}

/// A u32 field that must fit an id or slot
fn read_u16(data: &[u8], cursor: &mut usize) -> Result<u16, String> {
    let value = read_u32(data, cursor)?;
    u16::try_from(value).map_err(|_| format!("Invalid file: {} is out of range", value))
}

fn read_type(data: &[u8], cursor: &mut usize) -> Result<VarType, String> {
    let byte = read_u8(data, cursor)?;
    VarType::from_byte(byte).ok_or_else(|| format!("Invalid file: unknown type tag {}", byte))
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    write_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

fn read_string(data: &[u8], cursor: &mut usize) -> Result<String, String> {
    let len = read_u32(data, cursor)? as usize;
    if *cursor + len > data.len() {
        return Err("Unexpected end of file".to_string());
    }
    let s = String::from_utf8(data[*cursor..*cursor + len].to_vec())
        .map_err(|_| "Invalid UTF-8 string")?;
    *cursor += len;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Translator;

    const PROGRAM: &str = "int n = 3;\n\
                           function double sqrt(double x) native 'sqrt';\n\
                           function int twice(int x) { return x * 2; }\n\
                           print('n=', twice(n), ' ', sqrt(2.0));";

    #[test]
    fn test_round_trip_preserves_code() {
        let code = Translator::new().translate(PROGRAM).unwrap();
        let restored = deserialize(&serialize(&code)).unwrap();
        assert_eq!(restored, code);
    }

    #[test]
    fn test_rejects_bad_header() {
        assert!(deserialize(b"MVM").is_err());
        assert!(deserialize(b"SALD\x01").unwrap_err().contains("not a .mvmc"));
        assert!(deserialize(b"MVMC\x09").unwrap_err().contains("Unsupported version"));
    }

    #[test]
    fn test_rejects_truncated_file() {
        let code = Translator::new().translate(PROGRAM).unwrap();
        let bytes = serialize(&code);
        assert!(deserialize(&bytes[..bytes.len() - 3]).is_err());
    }
}
