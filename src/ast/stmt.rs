// MathVM statement AST nodes

use super::expr::Expr;
use crate::compiler::VarType;
use crate::error::Span;

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub ty: VarType,
    pub name: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FunctionImpl {
    Body(Block),
    /// `native 'symbol'`
    Native(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: VarType,
    pub implementation: FunctionImpl,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
}

/// `{ ... }`; every block opens a scope
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub span: Span,
}

impl Block {
    /// Functions declared directly in this block, in source order
    pub fn functions(&self) -> impl Iterator<Item = &FunctionDecl> {
        self.stmts.iter().filter_map(|s| match s {
            Stmt::Function(f) => Some(f),
            _ => None,
        })
    }

    /// Variables declared directly in this block, in source order
    pub fn variables(&self) -> impl Iterator<Item = (VarType, &str)> {
        self.stmts.iter().filter_map(|s| match s {
            Stmt::VarDecl { ty, name, .. } => Some((*ty, name.as_str())),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `int x;` or `int x = expr;`
    VarDecl {
        ty: VarType,
        name: String,
        init: Option<Expr>,
        span: Span,
    },
    Function(FunctionDecl),
    Assign {
        name: String,
        op: AssignOp,
        value: Expr,
        span: Span,
    },
    If {
        condition: Expr,
        then_branch: Block,
        /// `else if` is stored as a block holding the nested `If`
        else_branch: Option<Block>,
        span: Span,
    },
    While {
        condition: Expr,
        body: Block,
        span: Span,
    },
    /// `for (var in lo..hi)`, both bounds inclusive
    For {
        var: String,
        lo: Expr,
        hi: Expr,
        body: Block,
        span: Span,
    },
    Print {
        args: Vec<Expr>,
        span: Span,
    },
    Return {
        value: Option<Expr>,
        span: Span,
    },
    Block(Block),
    /// Call evaluated for its effect
    Expression {
        expr: Expr,
        span: Span,
    },
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Function(f) => f.span,
            Stmt::Block(b) => b.span,
            Stmt::VarDecl { span, .. }
            | Stmt::Assign { span, .. }
            | Stmt::If { span, .. }
            | Stmt::While { span, .. }
            | Stmt::For { span, .. }
            | Stmt::Print { span, .. }
            | Stmt::Return { span, .. }
            | Stmt::Expression { span, .. } => *span,
        }
    }
}

/// Whole translation unit; the outer block is the top-level scope
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub body: Block,
}
