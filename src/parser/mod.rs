// MathVM parser
// Recursive descent over the token stream, producing the AST and scope blocks

use crate::ast::*;
use crate::compiler::VarType;
use crate::error::{Span, TranslationError};
use crate::lexer::{Token, TokenKind};

type ParseResult<T> = Result<T, TranslationError>;

pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, current: 0 }
    }

    /// Parse a whole program; the outer statements form the top-level block
    pub fn parse(&mut self) -> ParseResult<Program> {
        let start = self.peek().span;
        let mut stmts = Vec::new();
        while !self.is_at_end() {
            stmts.push(self.declaration()?);
        }
        let span = start.to(self.peek().span);
        Ok(Program {
            body: Block { stmts, span },
        })
    }

    // ==================== Declarations ====================

    fn declaration(&mut self) -> ParseResult<Stmt> {
        if self.check(&TokenKind::Function) {
            return self.function_declaration().map(Stmt::Function);
        }
        if let Some(ty) = self.peek_type() {
            if ty == VarType::Void {
                return Err(self
                    .error("Variables cannot have type 'void'")
                    .with_help("use int, double or string"));
            }
            return self.var_declaration(ty);
        }
        self.statement()
    }

    fn var_declaration(&mut self, ty: VarType) -> ParseResult<Stmt> {
        let start = self.advance().span;
        let name = self.consume_identifier("Expected variable name after type")?;
        let init = if self.match_token(&TokenKind::Equal) {
            Some(self.expression()?)
        } else {
            None
        };
        let end = self.consume(&TokenKind::Semicolon, "Expected ';' after variable declaration")?;
        Ok(Stmt::VarDecl {
            ty,
            name,
            init,
            span: start.to(end),
        })
    }

    fn function_declaration(&mut self) -> ParseResult<FunctionDecl> {
        let start = self.advance().span;
        let return_type = self
            .peek_type()
            .ok_or_else(|| self.error("Expected return type after 'function'"))?;
        self.advance();
        let name = self.consume_identifier("Expected function name")?;

        self.consume(&TokenKind::LeftParen, "Expected '(' after function name")?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                let ty = match self.peek_type() {
                    Some(VarType::Void) => {
                        return Err(self.error("Parameters cannot have type 'void'"))
                    }
                    Some(ty) => ty,
                    None => return Err(self.error("Expected parameter type")),
                };
                let param_start = self.advance().span;
                let param_name = self.consume_identifier("Expected parameter name")?;
                params.push(Param {
                    ty,
                    name: param_name,
                    span: param_start.to(self.previous().span),
                });
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "Expected ')' after parameters")?;

        let implementation = if self.match_token(&TokenKind::Native) {
            let symbol = match &self.peek().kind {
                TokenKind::String(s) => s.clone(),
                _ => {
                    return Err(self
                        .error("Expected native symbol name")
                        .with_help("write native 'symbol';"))
                }
            };
            self.advance();
            self.consume(&TokenKind::Semicolon, "Expected ';' after native declaration")?;
            FunctionImpl::Native(symbol)
        } else {
            FunctionImpl::Body(self.block()?)
        };

        Ok(FunctionDecl {
            name,
            params,
            return_type,
            implementation,
            span: start.to(self.previous().span),
        })
    }

    // ==================== Statements ====================

    fn statement(&mut self) -> ParseResult<Stmt> {
        match &self.peek().kind {
            TokenKind::If => self.if_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::Print => self.print_statement(),
            TokenKind::Return => self.return_statement(),
            TokenKind::LeftBrace => self.block().map(Stmt::Block),
            TokenKind::Semicolon => {
                let span = self.advance().span;
                Ok(Stmt::Block(Block {
                    stmts: Vec::new(),
                    span,
                }))
            }
            TokenKind::Identifier(_) if self.assign_op_at(1).is_some() => self.assignment(),
            _ => self.expression_statement(),
        }
    }

    fn block(&mut self) -> ParseResult<Block> {
        let start = self.consume(&TokenKind::LeftBrace, "Expected '{'")?;
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.is_at_end() {
            stmts.push(self.declaration()?);
        }
        let end = self.consume(&TokenKind::RightBrace, "Expected '}' after block")?;
        Ok(Block {
            stmts,
            span: start.to(end),
        })
    }

    fn assignment(&mut self) -> ParseResult<Stmt> {
        let start = self.peek().span;
        let name = self.consume_identifier("Expected variable name")?;
        let op = self
            .assign_op_at(0)
            .ok_or_else(|| self.error("Expected assignment operator"))?;
        self.advance();
        let value = self.expression()?;
        let end = self.consume(&TokenKind::Semicolon, "Expected ';' after assignment")?;
        Ok(Stmt::Assign {
            name,
            op,
            value,
            span: start.to(end),
        })
    }

    fn if_statement(&mut self) -> ParseResult<Stmt> {
        let start = self.advance().span;
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'if'")?;
        let condition = self.expression()?;
        self.consume(&TokenKind::RightParen, "Expected ')' after condition")?;
        let then_branch = self.block()?;

        let else_branch = if self.match_token(&TokenKind::Else) {
            if self.check(&TokenKind::If) {
                let nested = self.if_statement()?;
                let span = nested.span();
                Some(Block {
                    stmts: vec![nested],
                    span,
                })
            } else {
                Some(self.block()?)
            }
        } else {
            None
        };

        Ok(Stmt::If {
            condition,
            then_branch,
            else_branch,
            span: start.to(self.previous().span),
        })
    }

    fn while_statement(&mut self) -> ParseResult<Stmt> {
        let start = self.advance().span;
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'while'")?;
        let condition = self.expression()?;
        self.consume(&TokenKind::RightParen, "Expected ')' after condition")?;
        let body = self.block()?;
        Ok(Stmt::While {
            condition,
            body,
            span: start.to(self.previous().span),
        })
    }

    fn for_statement(&mut self) -> ParseResult<Stmt> {
        let start = self.advance().span;
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'for'")?;
        let var = self.consume_identifier("Expected loop variable")?;
        self.consume(&TokenKind::In, "Expected 'in' after loop variable")?;
        let lo = self.expression()?;
        self.consume(&TokenKind::DotDot, "Expected '..' in range")
            .map_err(|e| e.with_help("for loops iterate over 'lo..hi'"))?;
        let hi = self.expression()?;
        self.consume(&TokenKind::RightParen, "Expected ')' after range")?;
        let body = self.block()?;
        Ok(Stmt::For {
            var,
            lo,
            hi,
            body,
            span: start.to(self.previous().span),
        })
    }

    fn print_statement(&mut self) -> ParseResult<Stmt> {
        let start = self.advance().span;
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'print'")?;
        let args = self.arguments()?;
        let end = self.consume(&TokenKind::Semicolon, "Expected ';' after print")?;
        Ok(Stmt::Print {
            args,
            span: start.to(end),
        })
    }

    fn return_statement(&mut self) -> ParseResult<Stmt> {
        let start = self.advance().span;
        let value = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.expression()?)
        };
        let end = self.consume(&TokenKind::Semicolon, "Expected ';' after return")?;
        Ok(Stmt::Return {
            value,
            span: start.to(end),
        })
    }

    fn expression_statement(&mut self) -> ParseResult<Stmt> {
        let expr = self.expression()?;
        if !matches!(expr, Expr::Call { .. }) {
            return Err(TranslationError::syntax(
                "Only calls can be used as statements",
                expr.span(),
            ));
        }
        let end = self.consume(&TokenKind::Semicolon, "Expected ';' after call")?;
        let span = expr.span().to(end);
        Ok(Stmt::Expression { expr, span })
    }

    // ==================== Expressions ====================

    fn expression(&mut self) -> ParseResult<Expr> {
        self.binary(1)
    }

    /// Precedence climbing over left-associative binary operators
    fn binary(&mut self, min_prec: u8) -> ParseResult<Expr> {
        let mut left = self.unary()?;
        while let Some(op) = BinaryOp::from_token(&self.peek().kind) {
            if op.precedence() < min_prec {
                break;
            }
            self.advance();
            let right = self.binary(op.precedence() + 1)?;
            let span = left.span().to(right.span());
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
                span,
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        let op = match self.peek().kind {
            TokenKind::Minus => UnaryOp::Negate,
            TokenKind::Bang => UnaryOp::Not,
            _ => return self.primary(),
        };
        let start = self.advance().span;
        let operand = self.unary()?;
        let span = start.to(operand.span());
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
            span,
        })
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Int(value) => {
                self.advance();
                Ok(Expr::Int {
                    value,
                    span: token.span,
                })
            }
            TokenKind::Double(value) => {
                self.advance();
                Ok(Expr::Double {
                    value,
                    span: token.span,
                })
            }
            TokenKind::String(value) => {
                self.advance();
                Ok(Expr::Str {
                    value,
                    span: token.span,
                })
            }
            TokenKind::Identifier(name) => {
                self.advance();
                if self.match_token(&TokenKind::LeftParen) {
                    let args = self.arguments()?;
                    return Ok(Expr::Call {
                        callee: name,
                        args,
                        span: token.span.to(self.previous().span),
                    });
                }
                Ok(Expr::Variable {
                    name,
                    span: token.span,
                })
            }
            TokenKind::LeftParen => {
                self.advance();
                let expr = self.expression()?;
                self.consume(&TokenKind::RightParen, "Expected ')' after expression")?;
                Ok(expr)
            }
            _ => Err(self.error(&format!("Expected expression, found '{}'", token.kind))),
        }
    }

    /// Comma-separated list after an opening '(' up to and including ')'
    fn arguments(&mut self) -> ParseResult<Vec<Expr>> {
        let mut args = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                args.push(self.expression()?);
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "Expected ')' after arguments")?;
        Ok(args)
    }

    // ==================== Helpers ====================

    fn peek_type(&self) -> Option<VarType> {
        match self.peek().kind {
            TokenKind::IntType => Some(VarType::Int),
            TokenKind::DoubleType => Some(VarType::Double),
            TokenKind::StringType => Some(VarType::String),
            TokenKind::VoidType => Some(VarType::Void),
            _ => None,
        }
    }

    fn assign_op_at(&self, ahead: usize) -> Option<AssignOp> {
        let token = self.tokens.get(self.current + ahead)?;
        match token.kind {
            TokenKind::Equal => Some(AssignOp::Set),
            TokenKind::PlusEqual => Some(AssignOp::Add),
            TokenKind::MinusEqual => Some(AssignOp::Sub),
            TokenKind::StarEqual => Some(AssignOp::Mul),
            TokenKind::SlashEqual => Some(AssignOp::Div),
            _ => None,
        }
    }

    fn is_at_end(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.current.min(self.tokens.len() - 1)]
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.current.saturating_sub(1)]
    }

    fn advance(&mut self) -> &Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.previous()
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.peek().kind) == std::mem::discriminant(kind)
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: &TokenKind, message: &str) -> ParseResult<Span> {
        if self.check(kind) {
            Ok(self.advance().span)
        } else {
            Err(self.error(message))
        }
    }

    fn consume_identifier(&mut self, message: &str) -> ParseResult<String> {
        match &self.peek().kind {
            TokenKind::Identifier(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.error(message)),
        }
    }

    fn error(&self, message: &str) -> TranslationError {
        TranslationError::syntax(message, self.peek().span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Scanner;

    fn parse(source: &str) -> ParseResult<Program> {
        let tokens = Scanner::new(source).scan_tokens()?;
        Parser::new(tokens).parse()
    }

    #[test]
    fn test_precedence() {
        let program = parse("int x; x = 2 + 3 * 4;").unwrap();
        let Stmt::Assign { value, .. } = &program.body.stmts[1] else {
            panic!("expected assignment");
        };
        let Expr::Binary { op, right, .. } = value else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(**right, Expr::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn test_left_associative() {
        let program = parse("print(10 - 4 - 3);").unwrap();
        let Stmt::Print { args, .. } = &program.body.stmts[0] else {
            panic!("expected print");
        };
        let Expr::Binary { left, op, .. } = &args[0] else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinaryOp::Sub);
        assert!(matches!(**left, Expr::Binary { op: BinaryOp::Sub, .. }));
    }

    #[test]
    fn test_function_and_native() {
        let program = parse(
            "function int fact(int n) { if (n <= 1) { return 1; } return n * fact(n - 1); }\n\
             function double sqrt(double x) native 'sqrt';",
        )
        .unwrap();
        let functions: Vec<_> = program.body.functions().collect();
        assert_eq!(functions.len(), 2);
        assert_eq!(functions[0].name, "fact");
        assert_eq!(functions[0].return_type, VarType::Int);
        assert_eq!(functions[0].params[0].ty, VarType::Int);
        assert_eq!(
            functions[1].implementation,
            FunctionImpl::Native("sqrt".to_string())
        );
    }

    #[test]
    fn test_for_and_else_if() {
        let program = parse(
            "int i; for (i in 1..3) { if (i == 1) { print('a'); } else if (i == 2) { print('b'); } else { print('c'); } }",
        )
        .unwrap();
        let Stmt::For { var, body, .. } = &program.body.stmts[1] else {
            panic!("expected for");
        };
        assert_eq!(var, "i");
        let Stmt::If { else_branch, .. } = &body.stmts[0] else {
            panic!("expected if");
        };
        let nested = else_branch.as_ref().unwrap();
        assert!(matches!(nested.stmts[0], Stmt::If { .. }));
    }

    #[test]
    fn test_block_variables_in_order() {
        let program = parse("int a; double b; string c;").unwrap();
        let vars: Vec<_> = program.body.variables().collect();
        assert_eq!(
            vars,
            vec![
                (VarType::Int, "a"),
                (VarType::Double, "b"),
                (VarType::String, "c")
            ]
        );
    }

    #[test]
    fn test_syntax_errors() {
        assert!(parse("int x").is_err());
        assert!(parse("void v;").is_err());
        assert!(parse("x + 1;").is_err());
        assert!(parse("for (i in 10) {}").is_err());
        let err = parse("print(1;").unwrap_err();
        assert_eq!(err.span.start.line, 1);
    }
}
