// MathVM interpreter
// Stack machine over a translated Code object; one operand stack per frame

use crate::compiler::bytecode::{DecodeError, Immediate, Instruction};
use crate::compiler::{Code, Function, FunctionBody, OpCode, VarType};
use crate::config::VmConfig;
use crate::error::{Error, MvmResult, RuntimeError};
use crate::vm::natives::{NativeImpl, NativeRegistry};
use crate::vm::value::{format_double, NativeValue, Value, Var, VarValue};
use smallvec::SmallVec;
use std::io::{self, Write};
use tracing::{debug, trace};

/// Activation of one bytecode function
#[derive(Debug)]
struct CallFrame {
    function: u16,
    context: u16,
    ip: usize,
    stack: Vec<Value>,
    locals: Vec<Value>,
}

/// Outcome of one dispatch step
enum Step {
    Next,
    Halt,
}

pub struct Interpreter<'a> {
    code: &'a Code,
    natives: NativeRegistry,
    config: VmConfig,
    out: Box<dyn Write + 'a>,
    frames: Vec<CallFrame>,
    /// Context id -> positions of its live frames, innermost last
    contexts: Vec<SmallVec<[u32; 4]>>,
    /// Strings created while running; ids continue after the constant pool
    strings: Vec<String>,
    resolved: Vec<NativeImpl>,
    executed: u64,
    /// Offset of the instruction being dispatched, for error reports
    offset: usize,
}

impl<'a> Interpreter<'a> {
    /// Interpreter printing to stdout with the builtin natives and default limits
    pub fn new(code: &'a Code) -> Self {
        Self {
            code,
            natives: NativeRegistry::with_builtins(),
            config: VmConfig::default(),
            out: Box::new(io::stdout()),
            frames: Vec::new(),
            contexts: Vec::new(),
            strings: Vec::new(),
            resolved: Vec::new(),
            executed: 0,
            offset: 0,
        }
    }

    pub fn with_output(mut self, out: impl Write + 'a) -> Self {
        self.out = Box::new(out);
        self
    }

    pub fn with_natives(mut self, natives: NativeRegistry) -> Self {
        self.natives = natives;
        self
    }

    pub fn with_config(mut self, config: VmConfig) -> Self {
        self.config = config;
        self
    }

    /// Run the top-level function. `vars` are bound by name to top-level
    /// variables before the run and updated from them after a successful one.
    pub fn execute(&mut self, vars: &mut [Var]) -> MvmResult<()> {
        self.reset();
        debug!(functions = self.code.functions().len(), "execution started");

        let code = self.code;
        let top = code
            .top_level()
            .ok_or_else(|| Error::NotFound("top-level function".to_string()))?;
        self.resolve_natives(top)?;
        self.push_frame(top, Vec::new())?;
        self.bind_vars(vars)?;

        let result = self.run();
        let flushed = self.out.flush();
        result?;
        if let Err(e) = flushed {
            return Err(self.error(format!("Cannot write output: {}", e)));
        }
        self.read_back_vars(vars)?;

        debug!(instructions = self.executed, "execution finished");
        self.frames.clear();
        Ok(())
    }

    fn reset(&mut self) {
        self.frames.clear();
        self.contexts.clear();
        self.strings.clear();
        self.resolved.clear();
        self.executed = 0;
        self.offset = 0;
    }

    fn resolve_natives(&mut self, top: &Function) -> MvmResult<()> {
        let code = self.code;
        for decl in code.natives() {
            match self.natives.resolve(decl) {
                Ok(native) => self.resolved.push(native),
                Err(message) => {
                    return Err(RuntimeError::new(message, top.name.clone(), top.id, 0).into());
                }
            }
        }
        Ok(())
    }

    // ==================== External Variables ====================

    fn bind_vars(&mut self, vars: &[Var]) -> MvmResult<()> {
        let code = self.code;
        for var in vars {
            let Some(top_var) = code.top_level_vars().iter().find(|v| v.name == var.name) else {
                continue;
            };
            if top_var.ty != var.value.var_type() {
                return Err(self.error(format!(
                    "Variable '{}' is {} but was given a {} value",
                    var.name,
                    top_var.ty,
                    var.value.var_type()
                )));
            }
            let value = match &var.value {
                VarValue::Int(v) => Value::from_int(*v),
                VarValue::Double(v) => Value::from_double(*v),
                VarValue::Str(s) => self.intern(s.clone())?,
            };
            let slot = top_var.slot as usize;
            let locals = &mut self.frames[0].locals;
            if slot >= locals.len() {
                locals.resize(slot + 1, Value::ZERO);
            }
            locals[slot] = value;
        }
        Ok(())
    }

    fn read_back_vars(&mut self, vars: &mut [Var]) -> MvmResult<()> {
        for var in vars.iter_mut() {
            let Some(top_var) = self.code.top_level_vars().iter().find(|v| v.name == var.name) else {
                continue;
            };
            let value = self.frames[0]
                .locals
                .get(top_var.slot as usize)
                .copied()
                .unwrap_or(Value::ZERO);
            var.value = match top_var.ty {
                VarType::Int => VarValue::Int(value.as_int()),
                VarType::Double => VarValue::Double(value.as_double()),
                _ => VarValue::Str(self.string(value)?.to_string()),
            };
        }
        Ok(())
    }

    // ==================== Dispatch ====================

    fn run(&mut self) -> MvmResult<()> {
        loop {
            if let Some(budget) = self.config.instruction_budget {
                if self.executed >= budget {
                    return Err(self.error(format!("Instruction budget of {} exhausted", budget)));
                }
            }
            self.executed += 1;
            let insn = self.fetch()?;
            trace!(function = self.frame().function, offset = insn.offset, op = insn.op.mnemonic(), "dispatch");
            match self.step(insn)? {
                Step::Next => {}
                Step::Halt => return Ok(()),
            }
        }
    }

    /// Decode the instruction at the current ip and advance past it
    fn fetch(&mut self) -> MvmResult<Instruction> {
        let frame = self.frame();
        let (function, ip) = (frame.function, frame.ip);
        self.offset = ip;
        let decoded = match self.code.functions().get(function as usize).map(|f| &f.body) {
            Some(FunctionBody::Bytecode(bytecode)) => bytecode.decode(ip),
            _ => Err(DecodeError::OutOfBounds),
        };
        let insn = decoded.map_err(|e| match e {
            DecodeError::OutOfBounds => self.error("Execution ran past the end of the function"),
            DecodeError::UnknownOpcode(byte) => self.error(format!("Unknown opcode 0x{:02x}", byte)),
            DecodeError::Truncated => self.error("Truncated instruction"),
        })?;
        self.frame_mut().ip = ip + insn.op.length();
        Ok(insn)
    }

    fn step(&mut self, insn: Instruction) -> MvmResult<Step> {
        match insn.op {
            OpCode::Invalid => return Err(self.error("Invalid instruction")),

            OpCode::DLoad => {
                let value = match insn.imm {
                    Immediate::F64(v) => v,
                    _ => 0.0,
                };
                self.push(Value::from_double(value))?;
            }
            OpCode::ILoad => {
                let value = match insn.imm {
                    Immediate::I64(v) => v,
                    _ => 0,
                };
                self.push(Value::from_int(value))?;
            }
            OpCode::SLoad => {
                let id = self.u16_operand(&insn);
                self.push(Value::from_str_id(id as u32))?;
            }
            OpCode::DLoad0 => self.push(Value::from_double(0.0))?,
            OpCode::ILoad0 => self.push(Value::from_int(0))?,
            OpCode::SLoad0 => self.push(Value::from_str_id(0))?,
            OpCode::DLoad1 => self.push(Value::from_double(1.0))?,
            OpCode::ILoad1 => self.push(Value::from_int(1))?,
            OpCode::DLoadM1 => self.push(Value::from_double(-1.0))?,
            OpCode::ILoadM1 => self.push(Value::from_int(-1))?,

            OpCode::DAdd => self.double_op(|a, b| a + b)?,
            OpCode::DSub => self.double_op(|a, b| a - b)?,
            OpCode::DMul => self.double_op(|a, b| a * b)?,
            OpCode::DDiv => self.double_op(|a, b| a / b)?,
            OpCode::IAdd => self.int_op(i64::wrapping_add)?,
            OpCode::ISub => self.int_op(i64::wrapping_sub)?,
            OpCode::IMul => self.int_op(i64::wrapping_mul)?,
            OpCode::IAOr => self.int_op(|a, b| a | b)?,
            OpCode::IAAnd => self.int_op(|a, b| a & b)?,
            OpCode::IAXor => self.int_op(|a, b| a ^ b)?,
            OpCode::IDiv | OpCode::IMod => {
                let b = self.pop()?.as_int();
                let a = self.pop()?.as_int();
                if b == 0 {
                    let what = if insn.op == OpCode::IDiv { "Division" } else { "Modulo" };
                    return Err(self.error(format!("{} by zero", what)));
                }
                let result = if insn.op == OpCode::IDiv {
                    a.wrapping_div(b)
                } else {
                    a.wrapping_rem(b)
                };
                self.push(Value::from_int(result))?;
            }
            OpCode::DNeg => {
                let v = self.pop()?.as_double();
                self.push(Value::from_double(-v))?;
            }
            OpCode::INeg => {
                let v = self.pop()?.as_int();
                self.push(Value::from_int(v.wrapping_neg()))?;
            }

            OpCode::IPrint => {
                let text = self.pop()?.as_int().to_string();
                self.write(&text)?;
            }
            OpCode::DPrint => {
                let text = format_double(self.pop()?.as_double());
                self.write(&text)?;
            }
            OpCode::SPrint => {
                let value = self.pop()?;
                let text = self.string(value)?.to_string();
                self.write(&text)?;
            }

            OpCode::I2D => {
                let v = self.pop()?.as_int();
                self.push(Value::from_double(v as f64))?;
            }
            OpCode::D2I => {
                // `as` truncates, saturates and maps NaN to 0
                let v = self.pop()?.as_double();
                self.push(Value::from_int(v as i64))?;
            }
            OpCode::Swap => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b)?;
                self.push(a)?;
            }
            OpCode::Pop => {
                self.pop()?;
            }

            OpCode::LoadDVar | OpCode::LoadIVar | OpCode::LoadSVar => {
                let slot = self.u16_operand(&insn) as usize;
                let frame = self.frames.len() - 1;
                let value = self.local(frame, slot)?;
                self.push(value)?;
            }
            OpCode::StoreDVar | OpCode::StoreIVar | OpCode::StoreSVar => {
                let slot = self.u16_operand(&insn) as usize;
                let value = self.pop()?;
                let frame = self.frames.len() - 1;
                self.set_local(frame, slot, value)?;
            }
            OpCode::LoadCtxDVar | OpCode::LoadCtxIVar | OpCode::LoadCtxSVar => {
                let (ctx, slot) = self.ctx_operand(&insn);
                let frame = self.context_frame(ctx)?;
                let value = self.local(frame, slot as usize)?;
                self.push(value)?;
            }
            OpCode::StoreCtxDVar | OpCode::StoreCtxIVar | OpCode::StoreCtxSVar => {
                let (ctx, slot) = self.ctx_operand(&insn);
                let value = self.pop()?;
                let frame = self.context_frame(ctx)?;
                self.set_local(frame, slot as usize, value)?;
            }

            OpCode::DCmp => {
                let b = self.pop()?.as_double();
                let a = self.pop()?.as_double();
                let result = match a.partial_cmp(&b) {
                    Some(std::cmp::Ordering::Less) => -1,
                    Some(std::cmp::Ordering::Equal) => 0,
                    // Greater, or unordered when either side is NaN
                    _ => 1,
                };
                self.push(Value::from_int(result))?;
            }
            OpCode::ICmp => {
                let b = self.pop()?.as_int();
                let a = self.pop()?.as_int();
                self.push(Value::from_int(a.cmp(&b) as i64))?;
            }

            OpCode::Ja => self.jump(&insn)?,
            OpCode::IfICmpNe
            | OpCode::IfICmpE
            | OpCode::IfICmpG
            | OpCode::IfICmpGe
            | OpCode::IfICmpL
            | OpCode::IfICmpLe => {
                let right = self.pop()?.as_int();
                let left = self.pop()?.as_int();
                let taken = match insn.op {
                    OpCode::IfICmpNe => left != right,
                    OpCode::IfICmpE => left == right,
                    OpCode::IfICmpG => left > right,
                    OpCode::IfICmpGe => left >= right,
                    OpCode::IfICmpL => left < right,
                    _ => left <= right,
                };
                if taken {
                    self.jump(&insn)?;
                }
            }

            OpCode::Dump => match self.frame().stack.last() {
                Some(top) => debug!(bits = top.bits(), int = top.as_int(), double = top.as_double(), "DUMP"),
                None => debug!("DUMP <empty stack>"),
            },
            OpCode::Stop => return Ok(Step::Halt),

            OpCode::Call => {
                let id = self.u16_operand(&insn);
                let code = self.code;
                let function = code
                    .functions()
                    .get(id as usize)
                    .ok_or_else(|| self.error(format!("Unknown function id {}", id)))?;
                match function.body {
                    FunctionBody::Native(nid) => self.call_native(nid)?,
                    FunctionBody::Bytecode(_) => {
                        let args = self.pop_args(function.arity())?;
                        self.push_frame(function, args)?;
                    }
                }
            }
            OpCode::CallNative => {
                let nid = self.u16_operand(&insn);
                self.call_native(nid)?;
            }
            OpCode::Return => {
                if self.frames.len() == 1 {
                    return Ok(Step::Halt);
                }
                let returns_value = self
                    .code
                    .functions()
                    .get(self.frame().function as usize)
                    .map(|f| f.return_type != VarType::Void)
                    .unwrap_or(false);
                let result = if returns_value { Some(self.pop()?) } else { None };
                self.pop_frame();
                if let Some(value) = result {
                    self.push(value)?;
                }
            }
            OpCode::Break => trace!(offset = insn.offset, "BREAK"),
        }
        Ok(Step::Next)
    }

    // ==================== Calls ====================

    fn push_frame(&mut self, function: &Function, args: Vec<Value>) -> MvmResult<()> {
        if self.frames.len() >= self.config.max_call_depth {
            return Err(self.error("Call stack overflow"));
        }
        let mut locals = args;
        let size = (function.locals_count as usize).max(locals.len());
        locals.resize(size, Value::ZERO);

        let position = self.frames.len() as u32;
        let ctx = function.context_id as usize;
        if ctx >= self.contexts.len() {
            self.contexts.resize_with(ctx + 1, SmallVec::new);
        }
        self.contexts[ctx].push(position);
        self.frames.push(CallFrame {
            function: function.id,
            context: function.context_id,
            ip: 0,
            stack: Vec::new(),
            locals,
        });
        Ok(())
    }

    fn pop_frame(&mut self) {
        if let Some(frame) = self.frames.pop() {
            if let Some(live) = self.contexts.get_mut(frame.context as usize) {
                live.pop();
            }
        }
    }

    /// Innermost live frame of context `ctx`
    fn context_frame(&self, ctx: u16) -> MvmResult<usize> {
        self.contexts
            .get(ctx as usize)
            .and_then(|live| live.last())
            .map(|&position| position as usize)
            .ok_or_else(|| self.error(format!("Context {} has no live activation", ctx)))
    }

    fn call_native(&mut self, nid: u16) -> MvmResult<()> {
        let code = self.code;
        let decl = code
            .native_by_id(nid)
            .ok_or_else(|| self.error(format!("Unknown native id {}", nid)))?;
        let params = &decl.signature.params;

        let raw = self.pop_args(params.len())?;
        let mut args = Vec::with_capacity(raw.len());
        for (value, ty) in raw.into_iter().zip(params) {
            args.push(match ty {
                VarType::Int => NativeValue::Int(value.as_int()),
                VarType::Double => NativeValue::Double(value.as_double()),
                _ => NativeValue::Str(self.string(value)?.to_string()),
            });
        }

        let native = self
            .resolved
            .get(nid as usize)
            .ok_or_else(|| self.error(format!("Native '{}' is not resolved", decl.symbol)))?;
        let result = native
            .call(&args)
            .map_err(|message| self.error(format!("Native '{}' failed: {}", decl.symbol, message)))?;
        if result.var_type() != decl.signature.return_type {
            return Err(self.error(format!(
                "Native '{}' returned {} instead of {}",
                decl.symbol,
                result.var_type(),
                decl.signature.return_type
            )));
        }
        match result {
            NativeValue::Int(v) => self.push(Value::from_int(v)),
            NativeValue::Double(v) => self.push(Value::from_double(v)),
            NativeValue::Str(s) => {
                let value = self.intern(s)?;
                self.push(value)
            }
            NativeValue::Void => Ok(()),
        }
    }

    // ==================== Helper Methods ====================

    fn frame(&self) -> &CallFrame {
        &self.frames[self.frames.len() - 1]
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    fn push(&mut self, value: Value) -> MvmResult<()> {
        if self.frame().stack.len() >= self.config.max_stack {
            return Err(self.error("Operand stack overflow"));
        }
        self.frame_mut().stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> MvmResult<Value> {
        match self.frame_mut().stack.pop() {
            Some(value) => Ok(value),
            None => Err(self.error("Stack underflow")),
        }
    }

    /// Remove the `count` most recently pushed values, oldest first
    fn pop_args(&mut self, count: usize) -> MvmResult<Vec<Value>> {
        let len = self.frame().stack.len();
        if len < count {
            return Err(self.error("Stack underflow"));
        }
        Ok(self.frame_mut().stack.split_off(len - count))
    }

    fn int_op(&mut self, op: impl Fn(i64, i64) -> i64) -> MvmResult<()> {
        let b = self.pop()?.as_int();
        let a = self.pop()?.as_int();
        self.push(Value::from_int(op(a, b)))
    }

    fn double_op(&mut self, op: impl Fn(f64, f64) -> f64) -> MvmResult<()> {
        let b = self.pop()?.as_double();
        let a = self.pop()?.as_double();
        self.push(Value::from_double(op(a, b)))
    }

    fn local(&self, frame: usize, slot: usize) -> MvmResult<Value> {
        self.frames[frame]
            .locals
            .get(slot)
            .copied()
            .ok_or_else(|| self.error(format!("Variable slot {} out of range", slot)))
    }

    fn set_local(&mut self, frame: usize, slot: usize, value: Value) -> MvmResult<()> {
        if slot >= self.frames[frame].locals.len() {
            return Err(self.error(format!("Variable slot {} out of range", slot)));
        }
        self.frames[frame].locals[slot] = value;
        Ok(())
    }

    fn jump(&mut self, insn: &Instruction) -> MvmResult<()> {
        match insn.jump_target() {
            Some(target) => {
                self.frame_mut().ip = target;
                Ok(())
            }
            None => Err(self.error("Jump target out of range")),
        }
    }

    fn u16_operand(&self, insn: &Instruction) -> u16 {
        match insn.imm {
            Immediate::U16(v) => v,
            _ => 0,
        }
    }

    fn ctx_operand(&self, insn: &Instruction) -> (u16, u16) {
        match insn.imm {
            Immediate::CtxVar { ctx, slot } => (ctx, slot),
            _ => (0, 0),
        }
    }

    fn write(&mut self, text: &str) -> MvmResult<()> {
        self.out
            .write_all(text.as_bytes())
            .map_err(|e| self.error(format!("Cannot write output: {}", e)))
    }

    /// Text of a string value: constant pool first, then run-time strings
    fn string(&self, value: Value) -> MvmResult<&str> {
        let id = value.as_str_id() as usize;
        let constants = self.code.constants();
        if id < constants.len() {
            return Ok(&constants[id]);
        }
        self.strings
            .get(id - constants.len())
            .map(String::as_str)
            .ok_or_else(|| self.error(format!("Unknown string id {}", id)))
    }

    fn intern(&mut self, text: String) -> MvmResult<Value> {
        let id = self.code.constants().len() + self.strings.len();
        let id = u32::try_from(id).map_err(|_| self.error("Too many run-time strings"))?;
        self.strings.push(text);
        Ok(Value::from_str_id(id))
    }

    fn error(&self, message: impl Into<String>) -> Error {
        let function = self
            .frames
            .last()
            .and_then(|frame| self.code.functions().get(frame.function as usize));
        match function {
            Some(f) => RuntimeError::new(message, f.name.clone(), f.id, self.offset).into(),
            None => RuntimeError::new(message, "<unknown>", 0, self.offset).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::bytecode::Bytecode;
    use crate::compiler::Translator;

    fn run(source: &str) -> MvmResult<String> {
        let code = Translator::new().translate(source)?;
        let mut out = Vec::new();
        Interpreter::new(&code).with_output(&mut out).execute(&mut [])?;
        Ok(String::from_utf8(out).unwrap())
    }

    fn runtime_error(err: Error) -> RuntimeError {
        match err {
            Error::Runtime(e) => e,
            other => panic!("expected runtime error, got {:?}", other),
        }
    }

    fn hand_crafted(ops: &[(OpCode, Immediate)]) -> Code {
        let mut bytecode = Bytecode::new();
        for (op, imm) in ops {
            bytecode.emit(*op, *imm);
        }
        let mut code = Code::new();
        code.add_function(Function {
            name: "<top>".to_string(),
            id: 0,
            context_id: 0,
            params: Vec::new(),
            return_type: VarType::Void,
            locals_count: 0,
            body: FunctionBody::Bytecode(bytecode),
        });
        code
    }

    #[test]
    fn test_arithmetic_and_print_formats() {
        assert_eq!(run("int x; x = 2 + 3 * 4; print(x);").unwrap(), "14");
        assert_eq!(run("double a; a = 1; print(a);").unwrap(), "1.0");
        assert_eq!(run("print(7 / 2, ' ', 7 % 3, ' ', -7 / 2);").unwrap(), "3 1 -3");
        assert_eq!(run("print(0.1 + 0.2);").unwrap(), "0.30000000000000004");
        assert_eq!(run("print('a\\n', 'b');").unwrap(), "a\nb");
    }

    #[test]
    fn test_logic_and_comparisons() {
        assert_eq!(run("print(1 < 2, 2 < 1, 1.5 >= 1, !0, !3);").unwrap(), "10110");
        assert_eq!(run("print(1 && 0, 1 || 0, 0.0 || 0, 6 & 3, 6 | 3, 6 ^ 3);").unwrap(), "010275");
    }

    #[test]
    fn test_nan_comparisons_are_unordered() {
        let prelude = "double n = 0.0 / 0.0;\n";
        let run_with = |body: &str| run(&format!("{}{}", prelude, body)).unwrap();

        assert_eq!(
            run_with("print(n > 1.0, n >= 1.0, n < 1.0, n <= 1.0, n == 1.0, n != 1.0);"),
            "000001"
        );
        assert_eq!(
            run_with("print(1 > n, 1 >= n, 1 < n, 1 <= n, 1 == n, 1 != n);"),
            "000001"
        );
        assert_eq!(run_with("print(n == n, !(n == n), !(n > 1.0), !(n <= 1.0));"), "0111");
        assert_eq!(
            run_with(
                "if (n > 1.0) { print('a'); } else { print('b'); }\n\
                 if (n >= 1.0) { print('a'); } else { print('b'); }\n\
                 if (!(n < 1.0)) { print('c'); }\n\
                 if (n < 1.0 || n >= 1.0) { print('a'); } else { print('d'); }\n\
                 while (n >= 0.0) { print('loop'); n = 0.0 - 1.0; }"
            ),
            "bbcd"
        );
        // ordinary values keep their order through the swapped lowering
        assert_eq!(run("print(2.5 > 1, 2.5 >= 2.5, 1 > 2.5, 1.0 >= 2);").unwrap(), "1100");
    }

    #[test]
    fn test_integer_arithmetic_wraps() {
        let source = "int x = 9223372036854775807; x = x + 1; print(x, ' ');\n\
                      int m = -9223372036854775808;\n\
                      print(m * -1, ' ', m / -1, ' ', m - 1, ' ', m % -1, ' ', -m);";
        assert_eq!(
            run(source).unwrap(),
            "-9223372036854775808 -9223372036854775808 -9223372036854775808 \
             9223372036854775807 0 -9223372036854775808"
        );
    }

    #[test]
    fn test_conversions_and_stack_ops() {
        let code = hand_crafted(&[
            (OpCode::DLoad, Immediate::F64(f64::NAN)),
            (OpCode::D2I, Immediate::None),
            (OpCode::IPrint, Immediate::None),
            (OpCode::DLoad, Immediate::F64(-2.7)),
            (OpCode::D2I, Immediate::None),
            (OpCode::IPrint, Immediate::None),
            (OpCode::DLoad, Immediate::F64(1e300)),
            (OpCode::D2I, Immediate::None),
            (OpCode::IPrint, Immediate::None),
            (OpCode::DLoad, Immediate::F64(f64::NEG_INFINITY)),
            (OpCode::D2I, Immediate::None),
            (OpCode::IPrint, Immediate::None),
            // ICMP: 3 vs 5, 5 vs 5, 7 vs 5
            (OpCode::ILoad, Immediate::I64(3)),
            (OpCode::ILoad, Immediate::I64(5)),
            (OpCode::ICmp, Immediate::None),
            (OpCode::IPrint, Immediate::None),
            (OpCode::ILoad, Immediate::I64(5)),
            (OpCode::ILoad, Immediate::I64(5)),
            (OpCode::ICmp, Immediate::None),
            (OpCode::IPrint, Immediate::None),
            (OpCode::ILoad, Immediate::I64(7)),
            (OpCode::ILoad, Immediate::I64(5)),
            (OpCode::ICmp, Immediate::None),
            (OpCode::IPrint, Immediate::None),
            // SWAP: 2 - 9 after exchanging 9 and 2
            (OpCode::ILoad, Immediate::I64(9)),
            (OpCode::ILoad, Immediate::I64(2)),
            (OpCode::Swap, Immediate::None),
            (OpCode::ISub, Immediate::None),
            (OpCode::IPrint, Immediate::None),
            (OpCode::Stop, Immediate::None),
        ]);
        let mut out = Vec::new();
        Interpreter::new(&code)
            .with_output(&mut out)
            .execute(&mut [])
            .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "0-29223372036854775807-9223372036854775808-101-7"
        );
    }

    #[test]
    fn test_short_circuit_skips_calls() {
        let source = "int n = 0;\n\
                      function int bump() { n += 1; return 1; }\n\
                      if (0 && bump()) { print('x'); }\n\
                      if (1 || bump()) { print('y'); }\n\
                      print(n);";
        assert_eq!(run(source).unwrap(), "y0");
    }

    #[test]
    fn test_loops() {
        assert_eq!(run("int i; for (i in 1..5) { print(i); }").unwrap(), "12345");
        assert_eq!(run("int i; for (i in 3..1) { print(i); } print(i);").unwrap(), "3");
        assert_eq!(run("int i; for (i in 1..3) { } print(i);").unwrap(), "4");
        let source = "int i; int n = 0;\n\
                      for (i in 9223372036854775805..9223372036854775807) { n += 1; }\n\
                      print(n, ' ', i);";
        assert_eq!(run(source).unwrap(), "3 -9223372036854775808");
        assert_eq!(
            run("int i = 0; while (i < 3) { print(i, ','); i += 1; }").unwrap(),
            "0,1,2,"
        );
    }

    #[test]
    fn test_recursion_and_outer_access() {
        let source = "function int fact(int n) { if (n <= 1) { return 1; } return n * fact(n - 1); }\n\
                      print(fact(5));";
        assert_eq!(run(source).unwrap(), "120");

        let source = "int total = 0;\n\
                      function void add(int k) { total += k; }\n\
                      int i; for (i in 1..4) { add(i); }\n\
                      print(total);";
        assert_eq!(run(source).unwrap(), "10");
    }

    #[test]
    fn test_nested_function_sees_innermost_activation() {
        let source = "function int outer(int x) {\n\
                        function int inner() { return x * 10; }\n\
                        if (x > 1) { return outer(x - 1) + inner(); }\n\
                        return inner();\n\
                      }\n\
                      print(outer(3));";
        // 10 + 20 + 30
        assert_eq!(run(source).unwrap(), "60");
    }

    #[test]
    fn test_natives() {
        let source = "function double sqrt(double x) native 'sqrt';\n\
                      function string itos(int x) native 'itos';\n\
                      function int strlen(string s) native 'strlen';\n\
                      print(sqrt(16), ' ', itos(42), ' ', strlen(itos(12345)));";
        assert_eq!(run(source).unwrap(), "4.0 42 5");
    }

    #[test]
    fn test_division_by_zero() {
        let err = runtime_error(run("int z = 0; print(1 / z);").unwrap_err());
        assert!(err.message.contains("Division by zero"));
        assert_eq!(err.function, "<top>");
    }

    #[test]
    fn test_underflow_names_offset() {
        let code = hand_crafted(&[
            (OpCode::ILoad1, Immediate::None),
            (OpCode::IAdd, Immediate::None),
            (OpCode::Stop, Immediate::None),
        ]);
        let mut out = Vec::new();
        let err = Interpreter::new(&code)
            .with_output(&mut out)
            .execute(&mut [])
            .unwrap_err();
        let err = runtime_error(err);
        assert_eq!(err.message, "Stack underflow");
        assert_eq!(err.offset, 1);
    }

    #[test]
    fn test_instruction_budget() {
        let code = Translator::new().translate("while (1) { }").unwrap();
        let config = VmConfig {
            instruction_budget: Some(1000),
            ..VmConfig::default()
        };
        let err = Interpreter::new(&code)
            .with_output(io::sink())
            .with_config(config)
            .execute(&mut [])
            .unwrap_err();
        assert!(runtime_error(err).message.contains("budget"));
    }

    #[test]
    fn test_call_depth_limit() {
        let code = Translator::new()
            .translate("function int f(int n) { return f(n + 1); } print(f(0));")
            .unwrap();
        let config = VmConfig {
            max_call_depth: 64,
            ..VmConfig::default()
        };
        let err = Interpreter::new(&code)
            .with_output(io::sink())
            .with_config(config)
            .execute(&mut [])
            .unwrap_err();
        assert_eq!(runtime_error(err).message, "Call stack overflow");
    }

    #[test]
    fn test_external_vars_round_trip() {
        let code = Translator::new()
            .translate("int n; string s; double d; n = n * 2; s = 'out'; d = d + 0.5;")
            .unwrap();
        let mut vars = vec![
            Var::new("n", VarValue::Int(21)),
            Var::new("s", VarValue::Str("in".to_string())),
            Var::new("d", VarValue::Double(1.0)),
            Var::new("unknown", VarValue::Int(7)),
        ];
        Interpreter::new(&code)
            .with_output(io::sink())
            .execute(&mut vars)
            .unwrap();
        assert_eq!(vars[0].value, VarValue::Int(42));
        assert_eq!(vars[1].value, VarValue::Str("out".to_string()));
        assert_eq!(vars[2].value, VarValue::Double(1.5));
        assert_eq!(vars[3].value, VarValue::Int(7));
    }

    #[test]
    fn test_external_var_type_mismatch() {
        let code = Translator::new().translate("int n;").unwrap();
        let mut vars = vec![Var::new("n", VarValue::Double(1.0))];
        let err = Interpreter::new(&code)
            .with_output(io::sink())
            .execute(&mut vars)
            .unwrap_err();
        assert_eq!(runtime_error(err).offset, 0);
    }

    #[test]
    fn test_repeated_runs_are_identical() {
        let code = Translator::new()
            .translate("int i; for (i in 1..3) { print(i * 1.5, ';'); }")
            .unwrap();
        let mut first = Vec::new();
        let mut second = Vec::new();
        let mut interpreter = Interpreter::new(&code).with_output(&mut first);
        interpreter.execute(&mut []).unwrap();
        drop(interpreter);
        Interpreter::new(&code).with_output(&mut second).execute(&mut []).unwrap();
        assert_eq!(first, second);
        assert_eq!(String::from_utf8(first).unwrap(), "1.5;3.0;4.5;");
    }
}
