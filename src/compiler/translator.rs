// MathVM translator
// Type-checks the AST and emits bytecode for every function into a Code object

use super::bytecode::{CodeBuffer, Immediate, Label};
use super::code::{
    Code, Function, FunctionBody, NativeDecl, NativeSignature, TopVar, VarType, TOP_LEVEL_NAME,
};
use super::opcode::OpCode;
use super::resolver::{FunctionInfo, ScopeResolver, VarInfo};
use crate::ast::*;
use crate::error::{Error, ErrorKind, InternalError, MvmResult, Span, TranslationError};
use crate::lexer::Scanner;
use crate::parser::Parser;
use crate::vm::natives::{NativeCheck, NativeRegistry};
use tracing::{debug, trace};

/// Source text to `Code`
pub struct Translator {
    natives: NativeRegistry,
}

impl Default for Translator {
    fn default() -> Self {
        Self::new()
    }
}

impl Translator {
    /// Translator that accepts the builtin natives
    pub fn new() -> Self {
        Self::with_natives(NativeRegistry::with_builtins())
    }

    pub fn with_natives(natives: NativeRegistry) -> Self {
        Self { natives }
    }

    pub fn translate(&self, source: &str) -> MvmResult<Code> {
        self.translate_file("<input>", source)
    }

    /// Translate `source`; diagnostics name `file` and quote the source
    pub fn translate_file(&self, file: &str, source: &str) -> MvmResult<Code> {
        let result = Scanner::new(source)
            .scan_tokens()
            .and_then(|tokens| Parser::new(tokens).parse())
            .map_err(Error::from)
            .and_then(|program| self.translate_program(&program));
        result.map_err(|e| match e {
            Error::Translation(t) => Error::Translation(t.with_file(file).with_source(source)),
            other => other,
        })
    }

    pub fn translate_program(&self, program: &Program) -> MvmResult<Code> {
        let mut emitter = Emitter {
            code: Code::new(),
            resolver: ScopeResolver::new(),
            natives: &self.natives,
            functions: Vec::new(),
        };
        emitter.top_level(program)?;
        Ok(emitter.code)
    }
}

/// Function whose bytecode is being emitted
struct FunctionState {
    id: u16,
    name: String,
    context: u16,
    return_type: VarType,
    buf: CodeBuffer,
}

struct Emitter<'a> {
    code: Code,
    resolver: ScopeResolver,
    natives: &'a NativeRegistry,
    /// Innermost function last
    functions: Vec<FunctionState>,
}

impl Emitter<'_> {
    // ==================== Functions ====================

    fn top_level(&mut self, program: &Program) -> MvmResult<()> {
        let span = program.body.span;
        let id = self
            .code
            .add_function(Function {
                name: TOP_LEVEL_NAME.to_string(),
                id: 0,
                context_id: 0,
                params: Vec::new(),
                return_type: VarType::Void,
                locals_count: 0,
                body: FunctionBody::Bytecode(Default::default()),
            })
            .ok_or_else(|| TranslationError::limit("functions", span))?;
        let context = self.resolver.push_context(span)?;
        self.functions.push(FunctionState {
            id,
            name: TOP_LEVEL_NAME.to_string(),
            context,
            return_type: VarType::Void,
            buf: CodeBuffer::new(),
        });

        self.block_body(&program.body)?;
        self.op(OpCode::Stop);

        let top_vars = self
            .resolver
            .top_level_vars()
            .into_iter()
            .map(|(name, info)| TopVar {
                name,
                ty: info.ty,
                slot: info.slot,
            })
            .collect();
        self.code.set_top_vars(top_vars);
        self.finish_function()
    }

    /// Pass 1 over a block: make every function of the block callable
    fn declare_function(&mut self, decl: &FunctionDecl) -> MvmResult<()> {
        let params: Vec<VarType> = decl.params.iter().map(|p| p.ty).collect();
        let native = match &decl.implementation {
            FunctionImpl::Native(symbol) => Some(self.declare_native(decl, symbol, &params)?),
            FunctionImpl::Body(_) => None,
        };
        let body = match native {
            Some(nid) => FunctionBody::Native(nid),
            None => FunctionBody::Bytecode(Default::default()),
        };
        let id = self
            .code
            .add_function(Function {
                name: decl.name.clone(),
                id: 0,
                context_id: self.resolver.current_context(),
                params: decl
                    .params
                    .iter()
                    .map(|p| (p.ty, p.name.clone()))
                    .collect(),
                return_type: decl.return_type,
                locals_count: 0,
                body,
            })
            .ok_or_else(|| TranslationError::limit("functions", decl.span))?;

        self.resolver.declare_function(
            &decl.name,
            FunctionInfo {
                id,
                params,
                return_type: decl.return_type,
                native,
            },
            decl.span,
        )?;
        Ok(())
    }

    fn declare_native(
        &mut self,
        decl: &FunctionDecl,
        symbol: &str,
        params: &[VarType],
    ) -> MvmResult<u16> {
        let native = NativeDecl {
            symbol: symbol.to_string(),
            signature: NativeSignature::new(decl.return_type, params),
        };
        match self.natives.check(&native) {
            Ok(()) => {}
            Err(NativeCheck::Unknown) => {
                return Err(TranslationError::new(
                    ErrorKind::UnknownNative,
                    format!("Unknown native function '{}'", symbol),
                    decl.span,
                )
                .into());
            }
            Err(NativeCheck::Mismatch { registered }) => {
                return Err(TranslationError::new(
                    ErrorKind::NativeSignature,
                    format!(
                        "Native '{}' is declared as {} but has signature {}",
                        symbol, native.signature, registered
                    ),
                    decl.span,
                )
                .into());
            }
        }
        self.code
            .add_native(native)
            .ok_or_else(|| TranslationError::limit("native functions", decl.span).into())
    }

    /// Pass 2: emit the body of a function at its declaration point
    fn function(&mut self, decl: &FunctionDecl) -> MvmResult<()> {
        let body = match &decl.implementation {
            FunctionImpl::Body(body) => body,
            FunctionImpl::Native(_) => return Ok(()),
        };
        let id = self
            .resolver
            .lookup_function(&decl.name)
            .map(|f| f.id)
            .ok_or_else(|| InternalError::CorruptFunctionTable(decl.name.clone()))?;

        let context = self.resolver.push_context(decl.span)?;
        for param in &decl.params {
            self.resolver.declare_var(&param.name, param.ty, param.span)?;
        }
        self.functions.push(FunctionState {
            id,
            name: decl.name.clone(),
            context,
            return_type: decl.return_type,
            buf: CodeBuffer::new(),
        });

        self.block_body(body)?;
        if decl.return_type == VarType::Void {
            self.op(OpCode::Return);
        } else if !block_returns(body) {
            return Err(TranslationError::new(
                ErrorKind::MissingReturn,
                format!(
                    "Function '{}' can reach its end without returning {}",
                    decl.name, decl.return_type
                ),
                decl.span,
            )
            .with_help("add a return statement on every path")
            .into());
        }
        self.finish_function()
    }

    /// Close the innermost function and store its bytecode in the code object
    fn finish_function(&mut self) -> MvmResult<()> {
        let state = self
            .functions
            .pop()
            .ok_or_else(|| InternalError::CorruptFunctionTable("no open function".to_string()))?;
        let locals_count = self.resolver.pop_context();
        let bytecode = state.buf.finish(&state.name)?;
        debug!(
            id = state.id,
            name = %state.name,
            context = state.context,
            locals = locals_count,
            bytes = bytecode.len(),
            "translated function"
        );
        let function = self
            .code
            .function_mut(state.id)
            .ok_or_else(|| InternalError::CorruptFunctionTable(state.name.clone()))?;
        function.context_id = state.context;
        function.locals_count = locals_count;
        function.body = FunctionBody::Bytecode(bytecode);
        Ok(())
    }

    // ==================== Statements ====================

    /// Statements of a block in the current scope
    fn block_body(&mut self, block: &Block) -> MvmResult<()> {
        for decl in block.functions() {
            self.declare_function(decl)?;
        }
        for stmt in &block.stmts {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    /// A block in a fresh nested scope
    fn scoped_block(&mut self, block: &Block) -> MvmResult<()> {
        self.resolver.push_scope(block.span)?;
        trace!(
            scope = ?self.resolver.current_scope_id(),
            variables = block.variables().count(),
            "enter scope"
        );
        let result = self.block_body(block);
        self.resolver.pop_scope();
        result
    }

    fn stmt(&mut self, stmt: &Stmt) -> MvmResult<()> {
        match stmt {
            Stmt::VarDecl {
                ty,
                name,
                init,
                span,
            } => {
                let value_ty = match init {
                    Some(expr) => Some((self.expr(expr)?, expr.span())),
                    None => None,
                };
                let var = self.resolver.declare_var(name, *ty, *span)?;
                if let Some((value_ty, value_span)) = value_ty {
                    self.coerce(value_ty, var.ty, value_span)?;
                    self.store_var(var);
                }
                Ok(())
            }
            Stmt::Function(decl) => self.function(decl),
            Stmt::Assign {
                name,
                op,
                value,
                span,
            } => self.assign(name, *op, value, *span),
            Stmt::If {
                condition,
                then_branch,
                else_branch,
                span,
            } => {
                let else_label = self.new_label();
                self.branch(condition, else_label, false)?;
                self.scoped_block(then_branch)?;
                match else_branch {
                    Some(else_block) => {
                        let end = self.new_label();
                        self.jump(OpCode::Ja, end, *span)?;
                        self.bind(else_label, *span)?;
                        self.scoped_block(else_block)?;
                        self.bind(end, *span)?;
                    }
                    None => self.bind(else_label, *span)?,
                }
                Ok(())
            }
            Stmt::While {
                condition,
                body,
                span,
            } => {
                let top = self.new_label();
                let end = self.new_label();
                self.bind(top, *span)?;
                self.branch(condition, end, false)?;
                self.scoped_block(body)?;
                self.jump(OpCode::Ja, top, *span)?;
                self.bind(end, *span)
            }
            Stmt::For {
                var,
                lo,
                hi,
                body,
                span,
            } => self.for_loop(var, lo, hi, body, *span),
            Stmt::Print { args, .. } => {
                for arg in args {
                    let op = match self.expr(arg)? {
                        VarType::Int => OpCode::IPrint,
                        VarType::Double => OpCode::DPrint,
                        VarType::String => OpCode::SPrint,
                        other => {
                            return Err(mismatch(
                                format!("Cannot print a value of type {}", other),
                                arg.span(),
                            ))
                        }
                    };
                    self.op(op);
                }
                Ok(())
            }
            Stmt::Return { value, span } => self.return_stmt(value.as_ref(), *span),
            Stmt::Block(block) => self.scoped_block(block),
            Stmt::Expression { expr, .. } => {
                if self.call(expr)? != VarType::Void {
                    self.op(OpCode::Pop);
                }
                Ok(())
            }
        }
    }

    fn assign(&mut self, name: &str, op: AssignOp, value: &Expr, span: Span) -> MvmResult<()> {
        let var = self.lookup_var(name, span)?;
        let arith = match op {
            AssignOp::Set => None,
            AssignOp::Add => Some(BinaryOp::Add),
            AssignOp::Sub => Some(BinaryOp::Sub),
            AssignOp::Mul => Some(BinaryOp::Mul),
            AssignOp::Div => Some(BinaryOp::Div),
        };
        let Some(arith) = arith else {
            let ty = self.expr(value)?;
            self.coerce(ty, var.ty, value.span())?;
            self.store_var(var);
            return Ok(());
        };

        if !var.ty.is_numeric() {
            return Err(mismatch(
                format!("Operator '{}=' needs a numeric variable, '{}' is {}", arith, name, var.ty),
                span,
            ));
        }
        self.load_var(var);
        let result = self.arithmetic_rhs(var.ty, arith, value)?;
        self.coerce(result, var.ty, span)?;
        self.store_var(var);
        Ok(())
    }

    fn for_loop(&mut self, var: &str, lo: &Expr, hi: &Expr, body: &Block, span: Span) -> MvmResult<()> {
        let counter = self.lookup_var(var, span)?;
        if counter.ty != VarType::Int {
            return Err(mismatch(
                format!("Loop variable '{}' must be int, found {}", var, counter.ty),
                span,
            ));
        }
        for bound in [lo, hi] {
            let ty = self.type_of(bound);
            if ty != VarType::Int && ty != VarType::Invalid {
                return Err(mismatch(
                    format!("Range bounds must be int, found {}", ty),
                    bound.span(),
                ));
            }
        }

        self.expect_type(lo, VarType::Int)?;
        self.store_var(counter);
        // Upper bound is evaluated once
        let limit = self.resolver.declare_hidden(VarType::Int, span)?;
        self.expect_type(hi, VarType::Int)?;
        self.store_var(limit);

        let top = self.new_label();
        let end = self.new_label();
        self.bind(top, span)?;
        self.load_var(counter);
        self.load_var(limit);
        self.jump(OpCode::IfICmpG, end, span)?;
        self.scoped_block(body)?;
        // Exit after the `hi` iteration; `hi + 1` may wrap
        let last = self.new_label();
        self.load_var(counter);
        self.load_var(limit);
        self.jump(OpCode::IfICmpE, last, span)?;
        self.increment(counter);
        self.jump(OpCode::Ja, top, span)?;
        self.bind(last, span)?;
        self.increment(counter);
        self.bind(end, span)
    }

    fn increment(&mut self, var: VarInfo) {
        self.load_var(var);
        self.op(OpCode::ILoad1);
        self.op(OpCode::IAdd);
        self.store_var(var);
    }

    fn return_stmt(&mut self, value: Option<&Expr>, span: Span) -> MvmResult<()> {
        let expected = self.current().return_type;
        match (value, expected) {
            (None, VarType::Void) => {}
            (Some(expr), VarType::Void) => {
                return Err(mismatch("Cannot return a value from a void function", expr.span()));
            }
            (None, ty) => {
                return Err(mismatch(format!("Function must return a value of type {}", ty), span));
            }
            (Some(expr), ty) => {
                let actual = self.expr(expr)?;
                self.coerce(actual, ty, expr.span())?;
            }
        }
        self.op(OpCode::Return);
        Ok(())
    }

    // ==================== Expressions ====================

    /// Emit `expr`, leaving one value of the returned type on the stack
    fn expr(&mut self, expr: &Expr) -> MvmResult<VarType> {
        match expr {
            Expr::Int { value, .. } => {
                self.int_literal(*value);
                Ok(VarType::Int)
            }
            Expr::Double { value, .. } => {
                self.double_literal(*value);
                Ok(VarType::Double)
            }
            Expr::Str { value, span } => {
                if value.is_empty() {
                    self.op(OpCode::SLoad0);
                } else {
                    let id = self
                        .code
                        .make_string_constant(value)
                        .ok_or_else(|| TranslationError::limit("string constants", *span))?;
                    self.emit(OpCode::SLoad, Immediate::U16(id));
                }
                Ok(VarType::String)
            }
            Expr::Variable { name, span } => {
                let var = self.lookup_var(name, *span)?;
                self.load_var(var);
                Ok(var.ty)
            }
            Expr::Unary {
                op: UnaryOp::Negate,
                operand,
                span,
            } => match &**operand {
                Expr::Int { value, .. } => {
                    self.int_literal(value.wrapping_neg());
                    Ok(VarType::Int)
                }
                Expr::Double { value, .. } => {
                    self.double_literal(-value);
                    Ok(VarType::Double)
                }
                _ => match self.expr(operand)? {
                    VarType::Int => {
                        self.op(OpCode::INeg);
                        Ok(VarType::Int)
                    }
                    VarType::Double => {
                        self.op(OpCode::DNeg);
                        Ok(VarType::Double)
                    }
                    other => Err(mismatch(format!("Cannot negate a value of type {}", other), *span)),
                },
            },
            Expr::Unary {
                op: UnaryOp::Not, ..
            } => self.materialize(expr),
            Expr::Binary { left, op, right, span } => match op {
                BinaryOp::And
                | BinaryOp::Or
                | BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::Less
                | BinaryOp::LessEqual
                | BinaryOp::Greater
                | BinaryOp::GreaterEqual => self.materialize(expr),
                BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                    let lt = self.expr(left)?;
                    if !lt.is_numeric() {
                        return Err(mismatch(
                            format!("Operator '{}' cannot be applied to {}", op, lt),
                            *span,
                        ));
                    }
                    self.arithmetic_rhs(lt, *op, right)
                }
                BinaryOp::Mod | BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor => {
                    for side in [left, right] {
                        let ty = self.expr(side)?;
                        if ty != VarType::Int {
                            return Err(mismatch(
                                format!("Operator '{}' needs int operands, found {}", op, ty),
                                side.span(),
                            ));
                        }
                    }
                    self.op(match op {
                        BinaryOp::Mod => OpCode::IMod,
                        BinaryOp::BitAnd => OpCode::IAAnd,
                        BinaryOp::BitOr => OpCode::IAOr,
                        _ => OpCode::IAXor,
                    });
                    Ok(VarType::Int)
                }
            },
            Expr::Call { span, .. } => match self.call(expr)? {
                VarType::Void => Err(mismatch("A void function has no value to use", *span)),
                ty => Ok(ty),
            },
        }
    }

    /// Left operand of type `lt` is already on the stack; emit the right one and `op`
    fn arithmetic_rhs(&mut self, lt: VarType, op: BinaryOp, right: &Expr) -> MvmResult<VarType> {
        let rt_static = self.type_of(right);
        let common = if lt == VarType::Double || rt_static == VarType::Double {
            VarType::Double
        } else {
            VarType::Int
        };
        if lt == VarType::Int && common == VarType::Double && rt_static.is_numeric() {
            self.op(OpCode::I2D);
        }
        let rt = self.expr(right)?;
        if !rt.is_numeric() {
            return Err(mismatch(
                format!("Operator '{}' cannot be applied to {}", op, rt),
                right.span(),
            ));
        }
        if rt == VarType::Int && common == VarType::Double {
            self.op(OpCode::I2D);
        }
        let opcode = match (op, common) {
            (BinaryOp::Add, VarType::Double) => OpCode::DAdd,
            (BinaryOp::Add, _) => OpCode::IAdd,
            (BinaryOp::Sub, VarType::Double) => OpCode::DSub,
            (BinaryOp::Sub, _) => OpCode::ISub,
            (BinaryOp::Mul, VarType::Double) => OpCode::DMul,
            (BinaryOp::Mul, _) => OpCode::IMul,
            (BinaryOp::Div, VarType::Double) => OpCode::DDiv,
            _ => OpCode::IDiv,
        };
        self.op(opcode);
        Ok(common)
    }

    /// Push 1 if `expr` holds, else 0
    fn materialize(&mut self, expr: &Expr) -> MvmResult<VarType> {
        let span = expr.span();
        let truthy = self.new_label();
        let end = self.new_label();
        self.branch(expr, truthy, true)?;
        self.op(OpCode::ILoad0);
        self.jump(OpCode::Ja, end, span)?;
        self.bind(truthy, span)?;
        self.op(OpCode::ILoad1);
        self.bind(end, span)?;
        Ok(VarType::Int)
    }

    /// Jump to `target` when the truth of `expr` equals `when`; otherwise fall through
    fn branch(&mut self, expr: &Expr, target: Label, when: bool) -> MvmResult<()> {
        let span = expr.span();
        match expr {
            Expr::Unary {
                op: UnaryOp::Not,
                operand,
                ..
            } => self.branch(operand, target, !when),
            Expr::Binary {
                left,
                op: BinaryOp::And,
                right,
                ..
            } => {
                if when {
                    let skip = self.new_label();
                    self.branch(left, skip, false)?;
                    self.branch(right, target, true)?;
                    self.bind(skip, span)
                } else {
                    self.branch(left, target, false)?;
                    self.branch(right, target, false)
                }
            }
            Expr::Binary {
                left,
                op: BinaryOp::Or,
                right,
                ..
            } => {
                if when {
                    self.branch(left, target, true)?;
                    self.branch(right, target, true)
                } else {
                    let skip = self.new_label();
                    self.branch(left, skip, true)?;
                    self.branch(right, target, false)?;
                    self.bind(skip, span)
                }
            }
            Expr::Binary { left, op, right, .. } if op.is_comparison() => {
                let relation = self.comparison_operands(left, *op, right)?;
                let cmp = if when { relation } else { negate(relation) };
                self.jump(compare_jump(cmp), target, span)
            }
            _ => {
                match self.expr(expr)? {
                    VarType::Int => {}
                    VarType::Double => {
                        self.op(OpCode::DLoad0);
                        self.op(OpCode::DCmp);
                    }
                    other => {
                        return Err(mismatch(
                            format!("Condition must be int or double, found {}", other),
                            span,
                        ))
                    }
                }
                self.op(OpCode::ILoad0);
                let op = if when { OpCode::IfICmpNe } else { OpCode::IfICmpE };
                self.jump(op, target, span)
            }
        }
    }

    /// Leave two ints and the relation between them that matches `left op right`.
    ///
    /// Doubles go through `DCMP`, which reports unordered operands as `1`.
    /// `>` and `>=` swap their operands so every NaN comparison is false
    /// except `!=`.
    fn comparison_operands(&mut self, left: &Expr, op: BinaryOp, right: &Expr) -> MvmResult<BinaryOp> {
        let lt = self.expr(left)?;
        if !lt.is_numeric() {
            return Err(mismatch(
                format!("Operator '{}' cannot compare values of type {}", op, lt),
                left.span(),
            ));
        }
        let rt_static = self.type_of(right);
        let double = lt == VarType::Double || rt_static == VarType::Double;
        if lt == VarType::Int && double && rt_static.is_numeric() {
            self.op(OpCode::I2D);
        }
        let rt = self.expr(right)?;
        if !rt.is_numeric() {
            return Err(mismatch(
                format!("Operator '{}' cannot compare values of type {}", op, rt),
                right.span(),
            ));
        }
        if double {
            if rt == VarType::Int {
                self.op(OpCode::I2D);
            }
            let relation = match op {
                BinaryOp::Greater => BinaryOp::Less,
                BinaryOp::GreaterEqual => BinaryOp::LessEqual,
                other => other,
            };
            if relation != op {
                self.op(OpCode::Swap);
            }
            self.op(OpCode::DCmp);
            self.op(OpCode::ILoad0);
            return Ok(relation);
        }
        Ok(op)
    }

    /// Emit a call; returns the callee's return type, which may be void
    fn call(&mut self, expr: &Expr) -> MvmResult<VarType> {
        let Expr::Call { callee, args, span } = expr else {
            return Err(TranslationError::syntax("Only calls can be used as statements", expr.span()).into());
        };
        let info = self.resolver.lookup_function(callee).cloned().ok_or_else(|| {
            TranslationError::new(
                ErrorKind::UndefinedFunction,
                format!("Undefined function '{}'", callee),
                *span,
            )
        })?;
        if info.params.len() != args.len() {
            return Err(TranslationError::new(
                ErrorKind::ArityMismatch,
                format!(
                    "Function '{}' expects {} argument(s), got {}",
                    callee,
                    info.params.len(),
                    args.len()
                ),
                *span,
            )
            .into());
        }
        for (arg, param) in args.iter().zip(&info.params) {
            let ty = self.expr(arg)?;
            self.coerce(ty, *param, arg.span())?;
        }
        match info.native {
            Some(nid) => self.emit(OpCode::CallNative, Immediate::U16(nid)),
            None => self.emit(OpCode::Call, Immediate::U16(info.id)),
        }
        Ok(info.return_type)
    }

    /// Static type of `expr` without emitting code; `Invalid` when ill-typed
    fn type_of(&self, expr: &Expr) -> VarType {
        match expr {
            Expr::Int { .. } => VarType::Int,
            Expr::Double { .. } => VarType::Double,
            Expr::Str { .. } => VarType::String,
            Expr::Variable { name, .. } => self
                .resolver
                .lookup_var(name)
                .map(|v| v.ty)
                .unwrap_or(VarType::Invalid),
            Expr::Unary {
                op: UnaryOp::Negate,
                operand,
                ..
            } => match self.type_of(operand) {
                ty if ty.is_numeric() => ty,
                _ => VarType::Invalid,
            },
            Expr::Unary { .. } => VarType::Int,
            Expr::Binary { left, op, right, .. } => match op {
                BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                    match (self.type_of(left), self.type_of(right)) {
                        (VarType::Int, VarType::Int) => VarType::Int,
                        (l, r) if l.is_numeric() && r.is_numeric() => VarType::Double,
                        _ => VarType::Invalid,
                    }
                }
                _ => VarType::Int,
            },
            Expr::Call { callee, .. } => match self.resolver.lookup_function(callee) {
                Some(info) if info.return_type != VarType::Void => info.return_type,
                _ => VarType::Invalid,
            },
        }
    }

    fn expect_type(&mut self, expr: &Expr, expected: VarType) -> MvmResult<()> {
        let ty = self.expr(expr)?;
        if ty != expected {
            return Err(mismatch(format!("Expected {}, found {}", expected, ty), expr.span()));
        }
        Ok(())
    }

    /// Convert the value on top of the stack from `from` to `to`
    fn coerce(&mut self, from: VarType, to: VarType, span: Span) -> MvmResult<()> {
        match (from, to) {
            (a, b) if a == b => Ok(()),
            (VarType::Int, VarType::Double) => {
                self.op(OpCode::I2D);
                Ok(())
            }
            (VarType::Double, VarType::Int) => Err(TranslationError::type_mismatch(
                "Cannot convert double to int implicitly",
                span,
            )
            .with_help("declare the target as double")
            .into()),
            (from, to) => Err(mismatch(format!("Cannot convert {} to {}", from, to), span)),
        }
    }

    // ==================== Variables ====================

    fn lookup_var(&self, name: &str, span: Span) -> MvmResult<VarInfo> {
        self.resolver.lookup_var(name).ok_or_else(|| {
            TranslationError::new(
                ErrorKind::UndefinedVariable,
                format!("Undefined variable '{}'", name),
                span,
            )
            .into()
        })
    }

    fn load_var(&mut self, var: VarInfo) {
        let (own, other) = match var.ty {
            VarType::Double => (OpCode::LoadDVar, OpCode::LoadCtxDVar),
            VarType::String => (OpCode::LoadSVar, OpCode::LoadCtxSVar),
            _ => (OpCode::LoadIVar, OpCode::LoadCtxIVar),
        };
        self.var_access(var, own, other);
    }

    fn store_var(&mut self, var: VarInfo) {
        let (own, other) = match var.ty {
            VarType::Double => (OpCode::StoreDVar, OpCode::StoreCtxDVar),
            VarType::String => (OpCode::StoreSVar, OpCode::StoreCtxSVar),
            _ => (OpCode::StoreIVar, OpCode::StoreCtxIVar),
        };
        self.var_access(var, own, other);
    }

    fn var_access(&mut self, var: VarInfo, own: OpCode, other: OpCode) {
        if var.context == self.current().context {
            self.emit(own, Immediate::U16(var.slot));
        } else {
            self.emit(
                other,
                Immediate::CtxVar {
                    ctx: var.context,
                    slot: var.slot,
                },
            );
        }
    }

    // ==================== Emit Helpers ====================

    fn current(&self) -> &FunctionState {
        // The top-level function stays open for the whole translation
        &self.functions[self.functions.len() - 1]
    }

    fn buf(&mut self) -> &mut CodeBuffer {
        let last = self.functions.len() - 1;
        &mut self.functions[last].buf
    }

    fn op(&mut self, op: OpCode) {
        self.buf().op(op);
    }

    fn emit(&mut self, op: OpCode, imm: Immediate) {
        self.buf().emit(op, imm);
    }

    fn int_literal(&mut self, value: i64) {
        match value {
            0 => self.op(OpCode::ILoad0),
            1 => self.op(OpCode::ILoad1),
            -1 => self.op(OpCode::ILoadM1),
            v => self.emit(OpCode::ILoad, Immediate::I64(v)),
        }
    }

    fn double_literal(&mut self, value: f64) {
        if value.to_bits() == 0 {
            self.op(OpCode::DLoad0);
        } else if value == 1.0 {
            self.op(OpCode::DLoad1);
        } else if value == -1.0 {
            self.op(OpCode::DLoadM1);
        } else {
            self.emit(OpCode::DLoad, Immediate::F64(value));
        }
    }

    fn new_label(&mut self) -> Label {
        self.buf().new_label()
    }

    fn bind(&mut self, label: Label, span: Span) -> MvmResult<()> {
        Ok(self.buf().bind(label, span)?)
    }

    fn jump(&mut self, op: OpCode, label: Label, span: Span) -> MvmResult<()> {
        Ok(self.buf().jump(op, label, span)?)
    }
}

fn mismatch(message: impl Into<String>, span: Span) -> Error {
    TranslationError::type_mismatch(message, span).into()
}

/// Relation that holds exactly when `op` does not
fn negate(op: BinaryOp) -> BinaryOp {
    match op {
        BinaryOp::Equal => BinaryOp::NotEqual,
        BinaryOp::NotEqual => BinaryOp::Equal,
        BinaryOp::Less => BinaryOp::GreaterEqual,
        BinaryOp::LessEqual => BinaryOp::Greater,
        BinaryOp::Greater => BinaryOp::LessEqual,
        BinaryOp::GreaterEqual => BinaryOp::Less,
        other => other,
    }
}

fn compare_jump(op: BinaryOp) -> OpCode {
    match op {
        BinaryOp::Equal => OpCode::IfICmpE,
        BinaryOp::NotEqual => OpCode::IfICmpNe,
        BinaryOp::Less => OpCode::IfICmpL,
        BinaryOp::LessEqual => OpCode::IfICmpLe,
        BinaryOp::Greater => OpCode::IfICmpG,
        _ => OpCode::IfICmpGe,
    }
}

/// Whether every path through `block` ends in a `return`
fn block_returns(block: &Block) -> bool {
    block.stmts.iter().any(stmt_returns)
}

fn stmt_returns(stmt: &Stmt) -> bool {
    match stmt {
        Stmt::Return { .. } => true,
        Stmt::Block(block) => block_returns(block),
        Stmt::If {
            then_branch,
            else_branch: Some(else_branch),
            ..
        } => block_returns(then_branch) && block_returns(else_branch),
        _ => false,
    }
}
