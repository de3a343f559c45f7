pub mod ast;

use std::rc::Rc;

use crate::errors::{Diagnostic, SourceFile};
use crate::lexer::{Lexer, Token, TokenInfo};
use ast::*;

type ParseOutcome<T> = Result<T, Diagnostic>;

/// Bound on block nesting plus expression depth, which keeps every later
/// tree walk shallow.
const MAX_NESTING: usize = 64;

/// Everything the front end knows about a source text.
#[derive(Debug, Clone)]
pub struct ParseResult {
    pub program: Program,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
    pub valid: bool,
}

/// Lex and parse `source`. Never fails: problems are reported in `errors`.
/// Only syntax is checked here; `analyzer::check` also validates the program
/// and fills in `warnings` and `valid`.
pub fn parse(source: &str) -> ParseResult {
    let (tokens, mut errors) = Lexer::new(source).tokenize();
    let mut parser = Parser::new(tokens).with_source(source);
    let program = parser.parse();
    errors.extend(parser.errors);
    errors.sort_by_key(|e| e.line);

    let valid = errors.is_empty();
    ParseResult {
        program,
        errors,
        warnings: Vec::new(),
        valid,
    }
}

pub struct Parser {
    tokens: Vec<TokenInfo>,
    pos: usize,
    source_file: Option<SourceFile>,
    errors: Vec<Diagnostic>,
    depth: usize,
}

impl Parser {
    pub fn new(tokens: Vec<TokenInfo>) -> Self {
        Parser {
            tokens,
            pos: 0,
            source_file: None,
            errors: Vec::new(),
            depth: 0,
        }
    }

    pub fn with_source(mut self, content: &str) -> Self {
        self.source_file = Some(SourceFile::new(content));
        self
    }

    pub fn errors(&self) -> &[Diagnostic] {
        &self.errors
    }

    fn current(&self) -> &Token {
        self.tokens.get(self.pos).map(|t| &t.token).unwrap_or(&Token::EOF)
    }

    fn peek(&self, offset: usize) -> &Token {
        self.tokens.get(self.pos + offset).map(|t| &t.token).unwrap_or(&Token::EOF)
    }

    fn current_line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn previous_line(&self) -> usize {
        self.pos
            .checked_sub(1)
            .and_then(|p| self.tokens.get(p))
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Token {
        let tok = self.current().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, expected: &Token) -> bool {
        self.current() == expected
    }

    fn error_at(&self, line: usize, message: &str) -> Diagnostic {
        let mut err = Diagnostic::new(line, message);
        if let Some(ctx) = self.source_file.as_ref().and_then(|src| src.excerpt(line)) {
            err = err.with_context(ctx);
        }
        err
    }

    fn error_here(&self, message: &str) -> Diagnostic {
        self.error_at(self.current_line(), message)
    }

    fn describe_current(&self) -> String {
        match self.current() {
            Token::EOF => "EOF".to_string(),
            tok => format!("{} '{}'", tok.kind(), tok.text()),
        }
    }

    /// A missing token is reported on the line where it should have been,
    /// not on the line of whatever came next.
    fn err_expected(&self, expected: &str) -> Diagnostic {
        let line = if self.pos > 0 && self.current_line() > self.previous_line() {
            self.previous_line()
        } else {
            self.current_line()
        };
        self.error_at(line, &format!("Expected {}, got {}", expected, self.describe_current()))
    }

    /// One level deeper into a block or expression.
    fn descend(&mut self, message: &str) -> ParseOutcome<()> {
        if self.depth >= MAX_NESTING {
            return Err(self.error_here(message));
        }
        self.depth += 1;
        Ok(())
    }

    fn expect(&mut self, expected: &Token) -> ParseOutcome<()> {
        if self.check(expected) {
            self.advance();
            Ok(())
        } else {
            Err(self.err_expected(&format!("'{}'", expected.text())))
        }
    }

    fn expect_identifier(&mut self, what: &str) -> ParseOutcome<String> {
        match self.current() {
            Token::Identifier(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.err_expected(what)),
        }
    }

    fn expect_type(&mut self) -> ParseOutcome<String> {
        if self.current().is_type() {
            Ok(self.advance().text())
        } else {
            Err(self.err_expected("a type"))
        }
    }

    pub fn parse(&mut self) -> Program {
        let mut lines = Vec::new();
        while !self.check(&Token::EOF) {
            lines.push(self.parse_line());
        }
        Program { lines }
    }

    /// Parse one statement and any comment trailing it on the same line.
    /// On a syntax error the error is recorded and an `ErrorPlaceholder`
    /// line takes the statement's place.
    fn parse_line(&mut self) -> Line {
        let line = self.current_line();

        if let Token::Comment(text) = self.current() {
            let comment = Some(text.clone());
            self.advance();
            return Line { statement: None, comment, line };
        }

        let start = self.pos;
        let statement = match self.parse_statement() {
            Ok(stmt) => stmt,
            Err(err) => {
                let message = err.message.clone();
                self.errors.push(err);
                self.synchronize(start, line);
                Statement {
                    kind: StatementKind::ErrorPlaceholder(message),
                    line,
                }
            }
        };

        let comment = match self.current() {
            Token::Comment(text) if self.current_line() == self.previous_line() => {
                let text = text.clone();
                self.advance();
                Some(text)
            }
            _ => None,
        };

        Line { statement: Some(statement), comment, line }
    }

    /// Skip to the next statement boundary after an error: past a `;`, to the
    /// start of a new source line, or up to a `}` that closes the enclosing
    /// block. Always consumes at least one token.
    fn synchronize(&mut self, start: usize, error_line: usize) {
        if self.pos == start {
            self.advance();
        }

        let mut depth = 0usize;
        loop {
            let line = self.current_line();
            match self.current() {
                Token::EOF => break,
                Token::Semicolon if depth == 0 => {
                    self.advance();
                    break;
                }
                Token::OpenBrace => {
                    depth += 1;
                    self.advance();
                }
                Token::CloseBrace => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                    self.advance();
                    if depth == 0 {
                        break;
                    }
                }
                _ if depth == 0 && line != error_line => break,
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn parse_statement(&mut self) -> ParseOutcome<Statement> {
        let line = self.current_line();

        let kind = match self.current() {
            tok if tok.is_type() => {
                if matches!(self.peek(1), Token::Identifier(_)) && self.peek(2) == &Token::OpenParen {
                    StatementKind::FunctionDecl(Rc::new(self.parse_function_decl()?))
                } else {
                    self.parse_var_decl()?
                }
            }
            Token::Class => self.parse_class()?,
            Token::Identifier(_) => match self.peek(1) {
                Token::Assign => {
                    let stmt = self.parse_assignment()?;
                    self.expect(&Token::Semicolon)?;
                    stmt
                }
                Token::OpenParen | Token::Dot => {
                    let call = self.parse_call()?;
                    self.expect(&Token::Semicolon)?;
                    StatementKind::Call(call)
                }
                _ => return Err(self.error_here("Unrecognized statement or syntax error")),
            },
            Token::SelfRef => {
                let call = self.parse_call()?;
                self.expect(&Token::Semicolon)?;
                StatementKind::Call(call)
            }
            Token::If => self.parse_if()?,
            Token::While => self.parse_while()?,
            Token::For => self.parse_for()?,
            Token::Switch => self.parse_switch()?,
            Token::Try => self.parse_try()?,
            Token::Return => {
                self.advance();
                let value = if self.check(&Token::Semicolon) {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.expect(&Token::Semicolon)?;
                StatementKind::Return(value)
            }
            Token::Break => {
                self.advance();
                self.expect(&Token::Semicolon)?;
                StatementKind::Break
            }
            Token::Continue => {
                self.advance();
                self.expect(&Token::Semicolon)?;
                StatementKind::Continue
            }
            _ => return Err(self.error_here("Unrecognized statement or syntax error")),
        };

        Ok(Statement { kind, line })
    }

    fn parse_var_decl(&mut self) -> ParseOutcome<StatementKind> {
        let ty = self.expect_type()?;
        let name = self.expect_identifier("variable name")?;
        let init = if self.check(&Token::Assign) {
            self.advance();
            Some(self.parse_expression()?)
        } else {
            None
        };
        self.expect(&Token::Semicolon)?;
        Ok(StatementKind::VarDecl { ty, name, init })
    }

    /// `name = expr` without the terminator, shared with `for` headers.
    fn parse_assignment(&mut self) -> ParseOutcome<StatementKind> {
        let name = self.expect_identifier("variable name")?;
        self.expect(&Token::Assign)?;
        let value = self.parse_expression()?;
        Ok(StatementKind::Assignment { name, value })
    }

    fn parse_function_decl(&mut self) -> ParseOutcome<FunctionDecl> {
        let line = self.current_line();
        let return_type = self.expect_type()?;
        let name = self.expect_identifier("function name")?;
        self.expect(&Token::OpenParen)?;

        let mut params = Vec::new();
        if !self.check(&Token::CloseParen) {
            loop {
                let ty = self.expect_type()?;
                let name = self.expect_identifier("parameter name")?;
                params.push(Param { ty, name });
                if self.check(&Token::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(&Token::CloseParen)?;

        let body = self.parse_block()?;
        Ok(FunctionDecl { return_type, name, params, body, line })
    }

    fn parse_class(&mut self) -> ParseOutcome<StatementKind> {
        self.expect(&Token::Class)?;
        let name = self.expect_identifier("class name")?;
        self.expect(&Token::OpenBrace)?;

        let mut methods = Vec::new();
        loop {
            match self.current() {
                Token::CloseBrace => break,
                Token::Comment(_) => {
                    self.advance();
                }
                tok if tok.is_type() => methods.push(Rc::new(self.parse_function_decl()?)),
                _ => return Err(self.err_expected("method declaration")),
            }
        }
        self.expect(&Token::CloseBrace)?;

        Ok(StatementKind::ClassDecl { name, methods })
    }

    fn parse_block(&mut self) -> ParseOutcome<Block> {
        let outer = self.depth;
        let block = self.parse_nested_block();
        self.depth = outer;
        block
    }

    fn parse_nested_block(&mut self) -> ParseOutcome<Block> {
        self.descend("Blocks nested too deeply")?;
        self.expect(&Token::OpenBrace)?;
        let mut lines = Vec::new();
        while !self.check(&Token::CloseBrace) && !self.check(&Token::EOF) {
            lines.push(self.parse_line());
        }
        self.expect(&Token::CloseBrace)?;
        Ok(lines.into())
    }

    fn parse_condition(&mut self) -> ParseOutcome<Expr> {
        self.expect(&Token::OpenParen)?;
        let condition = self.parse_expression()?;
        self.expect(&Token::CloseParen)?;
        Ok(condition)
    }

    fn parse_if(&mut self) -> ParseOutcome<StatementKind> {
        self.expect(&Token::If)?;
        let condition = self.parse_condition()?;
        let then_block = self.parse_block()?;

        let mut else_ifs = Vec::new();
        let mut else_block = None;
        while self.check(&Token::Else) {
            self.advance();
            if self.check(&Token::If) {
                self.advance();
                let cond = self.parse_condition()?;
                let block = self.parse_block()?;
                else_ifs.push((cond, block));
            } else {
                else_block = Some(self.parse_block()?);
                break;
            }
        }

        Ok(StatementKind::If(IfStmt { condition, then_block, else_ifs, else_block }))
    }

    fn parse_while(&mut self) -> ParseOutcome<StatementKind> {
        self.expect(&Token::While)?;
        let condition = self.parse_condition()?;
        let body = self.parse_block()?;
        Ok(StatementKind::While(Rc::new(WhileStmt { condition, body })))
    }

    fn parse_for(&mut self) -> ParseOutcome<StatementKind> {
        self.expect(&Token::For)?;
        self.expect(&Token::OpenParen)?;

        let init = if self.check(&Token::Semicolon) {
            self.advance();
            None
        } else {
            let line = self.current_line();
            let kind = if self.current().is_type() {
                // consumes its own `;`
                self.parse_var_decl()?
            } else {
                let kind = self.parse_assignment()?;
                self.expect(&Token::Semicolon)?;
                kind
            };
            Some(Box::new(Statement { kind, line }))
        };

        let condition = if self.check(&Token::Semicolon) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect(&Token::Semicolon)?;

        let increment = if self.check(&Token::CloseParen) {
            None
        } else {
            let line = self.current_line();
            let kind = self.parse_assignment()?;
            Some(Box::new(Statement { kind, line }))
        };
        self.expect(&Token::CloseParen)?;

        let body = self.parse_block()?;
        Ok(StatementKind::For(Rc::new(ForStmt { init, condition, increment, body })))
    }

    fn parse_switch(&mut self) -> ParseOutcome<StatementKind> {
        self.expect(&Token::Switch)?;
        let subject = self.parse_condition()?;
        self.expect(&Token::OpenBrace)?;

        let mut cases = Vec::new();
        let mut default = None;
        loop {
            match self.current() {
                Token::Case => {
                    self.advance();
                    let value = self.parse_case_label()?;
                    self.expect(&Token::Colon)?;
                    let body = self.parse_case_body()?;
                    cases.push(SwitchCase { value, body });
                }
                Token::Default => {
                    self.advance();
                    self.expect(&Token::Colon)?;
                    default = Some(self.parse_case_body()?);
                }
                Token::Comment(_) => {
                    self.advance();
                }
                _ => break,
            }
        }
        self.expect(&Token::CloseBrace)?;

        Ok(StatementKind::Switch(SwitchStmt { subject, cases, default }))
    }

    fn parse_case_label(&mut self) -> ParseOutcome<Expr> {
        let line = self.current_line();
        let kind = match self.current() {
            Token::NumberLiteral(n) => ExprKind::Number(*n),
            Token::StringLiteral(s) => ExprKind::Str(s.clone()),
            Token::True => ExprKind::Bool(true),
            Token::False => ExprKind::Bool(false),
            Token::Null => ExprKind::Null,
            _ => return Err(self.err_expected("literal after 'case'")),
        };
        self.advance();
        Ok(Expr { kind, line })
    }

    /// Lines up to the next label or the closing brace. A `break;` at the
    /// top of a case body ends that case.
    fn parse_case_body(&mut self) -> ParseOutcome<Block> {
        let mut lines = Vec::new();
        loop {
            match self.current() {
                Token::Case | Token::Default | Token::CloseBrace | Token::EOF => break,
                Token::Break if self.peek(1) == &Token::Semicolon => {
                    self.advance();
                    self.advance();
                    break;
                }
                _ => lines.push(self.parse_line()),
            }
        }
        Ok(lines.into())
    }

    fn parse_try(&mut self) -> ParseOutcome<StatementKind> {
        self.expect(&Token::Try)?;
        let body = self.parse_block()?;
        self.expect(&Token::Catch)?;
        self.expect(&Token::OpenParen)?;
        let error_name = self.expect_identifier("error variable name")?;
        self.expect(&Token::CloseParen)?;
        let handler = self.parse_block()?;
        Ok(StatementKind::TryCatch { body, error_name, handler })
    }

    /// `name(args)`, `object.name(args)` or `self.name(args)`.
    fn parse_call(&mut self) -> ParseOutcome<Call> {
        let target = match (self.current(), self.peek(1)) {
            (Token::SelfRef, _) => {
                self.advance();
                self.expect(&Token::Dot)?;
                CallTarget::SelfRef
            }
            (Token::Identifier(object), Token::Dot) => {
                let object = object.clone();
                self.advance();
                self.advance();
                CallTarget::Named(object)
            }
            _ => CallTarget::Implicit,
        };

        let name = self.expect_identifier("function name")?;
        self.expect(&Token::OpenParen)?;

        let mut args = Vec::new();
        if !self.check(&Token::CloseParen) {
            args.push(self.parse_expression()?);
            while self.check(&Token::Comma) {
                self.advance();
                args.push(self.parse_expression()?);
            }
        }
        self.expect(&Token::CloseParen)?;

        Ok(Call { target, name, args })
    }

    fn parse_expression(&mut self) -> ParseOutcome<Expr> {
        let outer = self.depth;
        let expr = self.parse_binary_chain();
        self.depth = outer;
        expr
    }

    /// Binary operators share one precedence level and associate left. Each
    /// operator deepens the tree, so it counts as a nesting level too.
    fn parse_binary_chain(&mut self) -> ParseOutcome<Expr> {
        self.descend("Expression nested too deeply")?;
        let mut left = self.parse_primary()?;

        while let Some(op) = binary_op(self.current()) {
            let line = self.current_line();
            self.descend("Expression has too many operators")?;
            self.advance();
            let right = self.parse_primary()?;
            left = Expr {
                kind: ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                line,
            };
        }

        Ok(left)
    }

    fn parse_primary(&mut self) -> ParseOutcome<Expr> {
        let line = self.current_line();
        let kind = match self.current().clone() {
            Token::NumberLiteral(n) => {
                self.advance();
                ExprKind::Number(n)
            }
            Token::Minus if matches!(self.peek(1), Token::NumberLiteral(_)) => {
                self.advance();
                match self.advance() {
                    Token::NumberLiteral(n) => ExprKind::Number(-n),
                    _ => return Err(self.err_expected("number")),
                }
            }
            Token::StringLiteral(s) => {
                self.advance();
                ExprKind::Str(s)
            }
            Token::True => {
                self.advance();
                ExprKind::Bool(true)
            }
            Token::False => {
                self.advance();
                ExprKind::Bool(false)
            }
            Token::Null => {
                self.advance();
                ExprKind::Null
            }
            Token::SelfRef => ExprKind::Call(self.parse_call()?),
            Token::Identifier(name) => match self.peek(1) {
                Token::OpenParen | Token::Dot => ExprKind::Call(self.parse_call()?),
                _ => {
                    self.advance();
                    ExprKind::Identifier(name)
                }
            },
            Token::OpenParen => {
                self.advance();
                let inner = self.parse_expression()?;
                self.expect(&Token::CloseParen)?;
                return Ok(inner);
            }
            _ => {
                let got = self.describe_current();
                return Err(self.error_here(&format!("Unexpected token: {}", got)));
            }
        };

        Ok(Expr { kind, line })
    }
}

fn binary_op(token: &Token) -> Option<BinaryOp> {
    let op = match token {
        Token::Plus => BinaryOp::Add,
        Token::Minus => BinaryOp::Sub,
        Token::Star => BinaryOp::Mul,
        Token::Slash => BinaryOp::Div,
        Token::Percent => BinaryOp::Mod,
        Token::EqualEqual => BinaryOp::Eq,
        Token::NotEqual => BinaryOp::NotEq,
        Token::Less => BinaryOp::Less,
        Token::LessEqual => BinaryOp::LessEq,
        Token::Greater => BinaryOp::Greater,
        Token::GreaterEqual => BinaryOp::GreaterEq,
        Token::AndAnd => BinaryOp::And,
        Token::OrOr => BinaryOp::Or,
        _ => return None,
    };
    Some(op)
}
