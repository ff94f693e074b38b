// MathVM scanner
// Converts source text into tokens with line/column spans

use crate::error::{Position, Span, TranslationError};
use crate::lexer::token::{Token, TokenKind};

pub struct Scanner {
    source: Vec<char>,
    tokens: Vec<Token>,
    start: usize,
    current: usize,
    line: usize,
    column: usize,
    start_line: usize,
    start_column: usize,
}

impl Scanner {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.chars().collect(),
            tokens: Vec::new(),
            start: 0,
            current: 0,
            line: 1,
            column: 1,
            start_line: 1,
            start_column: 1,
        }
    }

    pub fn scan_tokens(mut self) -> Result<Vec<Token>, TranslationError> {
        while !self.is_at_end() {
            self.start = self.current;
            self.start_line = self.line;
            self.start_column = self.column;
            self.scan_token()?;
        }
        let eof = Span::single(self.line, self.column, self.current);
        self.tokens.push(Token::new(TokenKind::Eof, "", eof));
        Ok(self.tokens)
    }

    fn scan_token(&mut self) -> Result<(), TranslationError> {
        let c = self.advance();

        match c {
            '(' => self.add_token(TokenKind::LeftParen),
            ')' => self.add_token(TokenKind::RightParen),
            '{' => self.add_token(TokenKind::LeftBrace),
            '}' => self.add_token(TokenKind::RightBrace),
            ',' => self.add_token(TokenKind::Comma),
            ';' => self.add_token(TokenKind::Semicolon),
            '%' => self.add_token(TokenKind::Percent),
            '^' => self.add_token(TokenKind::Caret),
            '.' => {
                if self.match_char('.') {
                    self.add_token(TokenKind::DotDot);
                } else {
                    return Err(self.error("Unexpected '.'").with_help("ranges are written 'lo..hi'"));
                }
            }
            '+' => {
                let kind = if self.match_char('=') {
                    TokenKind::PlusEqual
                } else {
                    TokenKind::Plus
                };
                self.add_token(kind);
            }
            '-' => {
                let kind = if self.match_char('=') {
                    TokenKind::MinusEqual
                } else {
                    TokenKind::Minus
                };
                self.add_token(kind);
            }
            '*' => {
                let kind = if self.match_char('=') {
                    TokenKind::StarEqual
                } else {
                    TokenKind::Star
                };
                self.add_token(kind);
            }
            '/' => {
                if self.match_char('/') {
                    while self.peek() != '\n' && !self.is_at_end() {
                        self.advance();
                    }
                } else if self.match_char('*') {
                    self.block_comment()?;
                } else if self.match_char('=') {
                    self.add_token(TokenKind::SlashEqual);
                } else {
                    self.add_token(TokenKind::Slash);
                }
            }
            '!' => {
                let kind = if self.match_char('=') {
                    TokenKind::BangEqual
                } else {
                    TokenKind::Bang
                };
                self.add_token(kind);
            }
            '=' => {
                let kind = if self.match_char('=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                };
                self.add_token(kind);
            }
            '<' => {
                let kind = if self.match_char('=') {
                    TokenKind::LessEqual
                } else {
                    TokenKind::Less
                };
                self.add_token(kind);
            }
            '>' => {
                let kind = if self.match_char('=') {
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                };
                self.add_token(kind);
            }
            '&' => {
                let kind = if self.match_char('&') {
                    TokenKind::And
                } else {
                    TokenKind::Ampersand
                };
                self.add_token(kind);
            }
            '|' => {
                let kind = if self.match_char('|') {
                    TokenKind::Or
                } else {
                    TokenKind::Pipe
                };
                self.add_token(kind);
            }

            ' ' | '\r' | '\t' => {}
            '\n' => self.newline(),

            '\'' | '"' => self.string(c)?,

            c if c.is_ascii_digit() => self.number()?,
            c if c.is_alphabetic() || c == '_' => self.identifier(),

            _ => {
                return Err(self
                    .error(&format!("Unexpected character '{}'", c))
                    .with_help("Remove this character or check for typos"));
            }
        }

        Ok(())
    }

    fn string(&mut self, quote: char) -> Result<(), TranslationError> {
        let mut value = String::new();

        while self.peek() != quote && !self.is_at_end() {
            let c = self.advance();
            if c == '\n' {
                self.newline();
                value.push(c);
                continue;
            }
            if c != '\\' {
                value.push(c);
                continue;
            }
            let escaped = self.advance_or_nul();
            match escaped {
                'n' => value.push('\n'),
                't' => value.push('\t'),
                'r' => value.push('\r'),
                '\\' => value.push('\\'),
                '\'' => value.push('\''),
                '"' => value.push('"'),
                other => {
                    return Err(self
                        .error(&format!("Unknown escape sequence '\\{}'", other))
                        .with_help("valid escapes are \\n \\t \\r \\\\ \\' \\\""));
                }
            }
        }

        if self.is_at_end() {
            return Err(self
                .error("Unterminated string")
                .with_help(format!("Add a closing {} to the string", quote)));
        }
        self.advance();
        self.add_token(TokenKind::String(value));
        Ok(())
    }

    fn number(&mut self) -> Result<(), TranslationError> {
        let mut is_double = false;
        while self.peek().is_ascii_digit() {
            self.advance();
        }

        // "1..5" is a range, not a double
        if self.peek() == '.' && self.peek_next() != '.' {
            is_double = true;
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }

        if matches!(self.peek(), 'e' | 'E') {
            let sign = matches!(self.peek_next(), '+' | '-');
            let digit_at = if sign { 2 } else { 1 };
            if self.peek_at(digit_at).is_ascii_digit() {
                is_double = true;
                for _ in 0..digit_at {
                    self.advance();
                }
                while self.peek().is_ascii_digit() {
                    self.advance();
                }
            }
        }

        let lexeme: String = self.source[self.start..self.current].iter().collect();
        let kind = if is_double {
            let value: f64 = lexeme
                .parse()
                .map_err(|_| self.error(&format!("Invalid number '{}'", lexeme)))?;
            TokenKind::Double(value)
        } else {
            let value = match lexeme.parse::<i64>() {
                Ok(value) => value,
                // `-9223372036854775808`; negating i64::MIN wraps back to itself
                Err(_) if self.after_minus() && lexeme.parse::<u64>() == Ok(i64::MIN.unsigned_abs()) => {
                    i64::MIN
                }
                Err(_) => {
                    return Err(self.error(&format!("Integer literal '{}' is out of range", lexeme)))
                }
            };
            TokenKind::Int(value)
        };
        self.add_token(kind);
        Ok(())
    }

    fn identifier(&mut self) {
        while self.peek().is_alphanumeric() || self.peek() == '_' {
            self.advance();
        }

        let text: String = self.source[self.start..self.current].iter().collect();
        let kind = match text.as_str() {
            "int" => TokenKind::IntType,
            "double" => TokenKind::DoubleType,
            "string" => TokenKind::StringType,
            "void" => TokenKind::VoidType,
            "function" => TokenKind::Function,
            "native" => TokenKind::Native,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "while" => TokenKind::While,
            "for" => TokenKind::For,
            "in" => TokenKind::In,
            "print" => TokenKind::Print,
            "return" => TokenKind::Return,
            _ => TokenKind::Identifier(text),
        };
        self.add_token(kind);
    }

    fn block_comment(&mut self) -> Result<(), TranslationError> {
        let mut depth = 1;

        while depth > 0 && !self.is_at_end() {
            if self.peek() == '/' && self.peek_next() == '*' {
                self.advance();
                self.advance();
                depth += 1;
            } else if self.peek() == '*' && self.peek_next() == '/' {
                self.advance();
                self.advance();
                depth -= 1;
            } else if self.advance() == '\n' {
                self.newline();
            }
        }

        if depth > 0 {
            return Err(self
                .error("Unterminated block comment")
                .with_help("Add '*/' to close the block comment"));
        }
        Ok(())
    }

    // Helpers

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> char {
        let c = self.source[self.current];
        self.current += 1;
        self.column += 1;
        c
    }

    fn advance_or_nul(&mut self) -> char {
        if self.is_at_end() {
            '\0'
        } else {
            self.advance()
        }
    }

    fn newline(&mut self) {
        self.line += 1;
        self.column = 1;
    }

    fn peek(&self) -> char {
        self.peek_at(0)
    }

    fn peek_next(&self) -> char {
        self.peek_at(1)
    }

    fn peek_at(&self, ahead: usize) -> char {
        self.source
            .get(self.current + ahead)
            .copied()
            .unwrap_or('\0')
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek() != expected || self.is_at_end() {
            return false;
        }
        self.advance();
        true
    }

    fn span(&self) -> Span {
        Span::new(
            Position::new(self.start_line, self.start_column, self.start),
            Position::new(self.line, self.column, self.current),
        )
    }

    fn after_minus(&self) -> bool {
        matches!(self.tokens.last(), Some(t) if t.kind == TokenKind::Minus)
    }

    fn add_token(&mut self, kind: TokenKind) {
        let lexeme: String = self.source[self.start..self.current].iter().collect();
        let span = self.span();
        self.tokens.push(Token::new(kind, lexeme, span));
    }

    fn error(&self, message: &str) -> TranslationError {
        TranslationError::syntax(message, self.span())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Scanner::new(source)
            .scan_tokens()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_declaration() {
        assert_eq!(
            kinds("int x = 2 + 3;"),
            vec![
                TokenKind::IntType,
                TokenKind::Identifier("x".into()),
                TokenKind::Equal,
                TokenKind::Int(2),
                TokenKind::Plus,
                TokenKind::Int(3),
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers_and_ranges() {
        assert_eq!(
            kinds("1..10 2.5 1e3 7.0e-1"),
            vec![
                TokenKind::Int(1),
                TokenKind::DotDot,
                TokenKind::Int(10),
                TokenKind::Double(2.5),
                TokenKind::Double(1000.0),
                TokenKind::Double(0.7),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r"'a\n\'b\'' "),
            vec![TokenKind::String("a\n'b'".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn test_comments_and_lines() {
        let tokens = Scanner::new("// note\n/* a /* nested */ b */\n  x")
            .scan_tokens()
            .unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Identifier("x".into()));
        assert_eq!(tokens[0].span.start.line, 3);
        assert_eq!(tokens[0].span.start.column, 3);
    }

    #[test]
    fn test_errors() {
        assert!(Scanner::new("'open").scan_tokens().is_err());
        assert!(Scanner::new("int x = #;").scan_tokens().is_err());
        assert!(Scanner::new("99999999999999999999").scan_tokens().is_err());
    }

    #[test]
    fn test_most_negative_int_literal() {
        assert_eq!(
            kinds("-9223372036854775808"),
            vec![TokenKind::Minus, TokenKind::Int(i64::MIN), TokenKind::Eof]
        );
        assert!(Scanner::new("9223372036854775808").scan_tokens().is_err());
        assert!(Scanner::new("-9223372036854775809").scan_tokens().is_err());
    }
}
