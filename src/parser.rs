// File: src/parser.rs
//
// Recursive-descent parser for Ardan. Consumes the token stream from the
// lexer and produces the AST the bytecode compiler lowers.

use crate::ast::*;
use crate::errors::{ArdanError, SourceLocation};
use crate::lexer::{tokenize, Keyword, TemplatePiece, Token, TokenKind};
use std::path::PathBuf;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// File the source came from; recorded on import declarations so the
    /// compiler can resolve relative module paths.
    pub source_file: PathBuf,
}

type PResult<T> = Result<T, ArdanError>;

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0, source_file: PathBuf::new() }
    }

    pub fn with_source_file(mut self, file: PathBuf) -> Self {
        self.source_file = file;
        self
    }

    pub fn parse(&mut self) -> PResult<Vec<Stmt>> {
        let mut program = Vec::new();
        while !self.check_eof() {
            program.push(self.statement()?);
        }
        Ok(program)
    }

    // ---- token helpers ----

    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    fn peek_ahead(&self, n: usize) -> &TokenKind {
        &self.tokens[(self.pos + n).min(self.tokens.len() - 1)].kind
    }

    fn location(&self) -> SourceLocation {
        let tok = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        let mut loc = SourceLocation::new(tok.line, tok.column);
        if !self.source_file.as_os_str().is_empty() {
            loc.file = Some(self.source_file.to_string_lossy().to_string());
        }
        loc
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.tokens[self.pos.min(self.tokens.len() - 1)].kind.clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        kind
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn check_eof(&self) -> bool {
        matches!(self.peek(), TokenKind::Eof)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> PResult<()> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(ArdanError::parse_error(
                format!("Expected {} but found {:?}", what, self.peek()),
                self.location(),
            ))
        }
    }

    fn eat_keyword(&mut self, kw: Keyword) -> bool {
        if matches!(self.peek(), TokenKind::Keyword(k) if *k == kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_identifier(&mut self, what: &str) -> PResult<String> {
        match self.peek().clone() {
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(ArdanError::parse_error(
                format!("Expected {} but found {:?}", what, other),
                self.location(),
            )),
        }
    }

    fn eat_semicolon(&mut self) {
        self.eat(&TokenKind::Semicolon);
    }

    // ---- statements ----

    fn statement(&mut self) -> PResult<Stmt> {
        match self.peek().clone() {
            TokenKind::Semicolon => {
                self.advance();
                Ok(Stmt::Empty)
            }
            TokenKind::LeftBrace => Ok(Stmt::Block(self.block()?)),
            TokenKind::Keyword(kw) => match kw {
                Keyword::Var | Keyword::Let | Keyword::Const => {
                    let stmt = self.variable_statement()?;
                    self.eat_semicolon();
                    Ok(stmt)
                }
                Keyword::If => self.if_statement(),
                Keyword::While => self.while_statement(),
                Keyword::Do => self.do_while_statement(),
                Keyword::For => self.for_statement(),
                Keyword::Return => {
                    self.advance();
                    let value = if self.check(&TokenKind::Semicolon)
                        || self.check(&TokenKind::RightBrace)
                        || self.check_eof()
                    {
                        None
                    } else {
                        Some(self.expression()?)
                    };
                    self.eat_semicolon();
                    Ok(Stmt::Return(value))
                }
                Keyword::Break => {
                    self.advance();
                    self.eat_semicolon();
                    Ok(Stmt::Break)
                }
                Keyword::Continue => {
                    self.advance();
                    self.eat_semicolon();
                    Ok(Stmt::Continue)
                }
                Keyword::Throw => {
                    self.advance();
                    let value = self.expression()?;
                    self.eat_semicolon();
                    Ok(Stmt::Throw(value))
                }
                Keyword::Function => {
                    self.advance();
                    Ok(Stmt::Function(self.function_rest(false)?))
                }
                Keyword::Async
                    if matches!(self.peek_ahead(1), TokenKind::Keyword(Keyword::Function)) =>
                {
                    self.advance();
                    self.advance();
                    Ok(Stmt::Function(self.function_rest(true)?))
                }
                Keyword::Class => self.class_declaration(),
                Keyword::Try => self.try_statement(),
                Keyword::Switch => self.switch_statement(),
                Keyword::Import => {
                    self.advance();
                    let path = match self.advance() {
                        TokenKind::Str(path) => path,
                        other => {
                            return Err(ArdanError::parse_error(
                                format!("Expected module path string, found {:?}", other),
                                self.location(),
                            ))
                        }
                    };
                    self.eat_semicolon();
                    Ok(Stmt::Import { path, source_file: self.source_file.clone() })
                }
                _ => {
                    let expr = self.expression()?;
                    self.eat_semicolon();
                    Ok(Stmt::Expression(expr))
                }
            },
            _ => {
                let expr = self.expression()?;
                self.eat_semicolon();
                Ok(Stmt::Expression(expr))
            }
        }
    }

    fn block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect(&TokenKind::LeftBrace, "'{'")?;
        let mut body = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.check_eof() {
            body.push(self.statement()?);
        }
        self.expect(&TokenKind::RightBrace, "'}'")?;
        Ok(body)
    }

    fn binding_kind(&mut self) -> Option<BindingKind> {
        match self.peek() {
            TokenKind::Keyword(Keyword::Var) => {
                self.advance();
                Some(BindingKind::Var)
            }
            TokenKind::Keyword(Keyword::Let) => {
                self.advance();
                Some(BindingKind::Let)
            }
            TokenKind::Keyword(Keyword::Const) => {
                self.advance();
                Some(BindingKind::Const)
            }
            _ => None,
        }
    }

    fn variable_statement(&mut self) -> PResult<Stmt> {
        let kind = self.binding_kind().expect("caller checked for binding keyword");
        let mut declarations = Vec::new();
        loop {
            let name = self.expect_identifier("variable name")?;
            let init = if self.eat(&TokenKind::Assign) {
                Some(self.assignment_expression()?)
            } else {
                None
            };
            declarations.push(VarDeclarator { name, init });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(Stmt::Variable { kind, declarations })
    }

    fn if_statement(&mut self) -> PResult<Stmt> {
        self.advance(); // if
        self.expect(&TokenKind::LeftParen, "'(' after 'if'")?;
        let test = self.expression()?;
        self.expect(&TokenKind::RightParen, "')' after condition")?;
        let consequent = Box::new(self.statement()?);
        let alternate = if self.eat_keyword(Keyword::Else) {
            Some(Box::new(self.statement()?))
        } else {
            None
        };
        Ok(Stmt::If { test, consequent, alternate })
    }

    fn while_statement(&mut self) -> PResult<Stmt> {
        self.advance(); // while
        self.expect(&TokenKind::LeftParen, "'(' after 'while'")?;
        let test = self.expression()?;
        self.expect(&TokenKind::RightParen, "')' after condition")?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::While { test, body })
    }

    fn do_while_statement(&mut self) -> PResult<Stmt> {
        self.advance(); // do
        let body = Box::new(self.statement()?);
        if !self.eat_keyword(Keyword::While) {
            return Err(ArdanError::parse_error(
                "Expected 'while' after do-loop body".to_string(),
                self.location(),
            ));
        }
        self.expect(&TokenKind::LeftParen, "'(' after 'while'")?;
        let test = self.expression()?;
        self.expect(&TokenKind::RightParen, "')' after condition")?;
        self.eat_semicolon();
        Ok(Stmt::DoWhile { body, test })
    }

    /// Parses `for (...)` in all three shapes: classic, for-in, for-of.
    fn for_statement(&mut self) -> PResult<Stmt> {
        self.advance(); // for
        self.expect(&TokenKind::LeftParen, "'(' after 'for'")?;

        // for-in / for-of with a declared binding
        if let Some(kind) = self.peek_binding_kind() {
            if let TokenKind::Identifier(name) = self.peek_ahead(1).clone() {
                match self.peek_ahead(2) {
                    TokenKind::Keyword(Keyword::In) => {
                        self.advance();
                        self.advance();
                        self.advance();
                        let object = self.expression()?;
                        self.expect(&TokenKind::RightParen, "')' after for-in target")?;
                        let body = Box::new(self.statement()?);
                        return Ok(Stmt::ForIn {
                            binding: ForBinding::Declaration(kind, name),
                            object,
                            body,
                        });
                    }
                    TokenKind::Keyword(Keyword::Of) => {
                        self.advance();
                        self.advance();
                        self.advance();
                        let iterable = self.expression()?;
                        self.expect(&TokenKind::RightParen, "')' after for-of iterable")?;
                        let body = Box::new(self.statement()?);
                        return Ok(Stmt::ForOf {
                            binding: ForBinding::Declaration(kind, name),
                            iterable,
                            body,
                        });
                    }
                    _ => {}
                }
            }
        }

        // for-in / for-of over an existing binding
        if let TokenKind::Identifier(name) = self.peek().clone() {
            match self.peek_ahead(1) {
                TokenKind::Keyword(Keyword::In) => {
                    self.advance();
                    self.advance();
                    let object = self.expression()?;
                    self.expect(&TokenKind::RightParen, "')' after for-in target")?;
                    let body = Box::new(self.statement()?);
                    return Ok(Stmt::ForIn {
                        binding: ForBinding::Identifier(name),
                        object,
                        body,
                    });
                }
                TokenKind::Keyword(Keyword::Of) => {
                    self.advance();
                    self.advance();
                    let iterable = self.expression()?;
                    self.expect(&TokenKind::RightParen, "')' after for-of iterable")?;
                    let body = Box::new(self.statement()?);
                    return Ok(Stmt::ForOf {
                        binding: ForBinding::Identifier(name),
                        iterable,
                        body,
                    });
                }
                _ => {}
            }
        }

        // Classic for(init; test; update)
        let init = if self.check(&TokenKind::Semicolon) {
            self.advance();
            None
        } else if self.peek_binding_kind().is_some() {
            let stmt = self.variable_statement()?;
            self.expect(&TokenKind::Semicolon, "';' after for-loop init")?;
            Some(Box::new(stmt))
        } else {
            let expr = self.expression()?;
            self.expect(&TokenKind::Semicolon, "';' after for-loop init")?;
            Some(Box::new(Stmt::Expression(expr)))
        };

        let test = if self.check(&TokenKind::Semicolon) { None } else { Some(self.expression()?) };
        self.expect(&TokenKind::Semicolon, "';' after for-loop condition")?;

        let update =
            if self.check(&TokenKind::RightParen) { None } else { Some(self.expression()?) };
        self.expect(&TokenKind::RightParen, "')' after for-loop clauses")?;

        let body = Box::new(self.statement()?);
        Ok(Stmt::For { init, test, update, body })
    }

    fn peek_binding_kind(&self) -> Option<BindingKind> {
        match self.peek() {
            TokenKind::Keyword(Keyword::Var) => Some(BindingKind::Var),
            TokenKind::Keyword(Keyword::Let) => Some(BindingKind::Let),
            TokenKind::Keyword(Keyword::Const) => Some(BindingKind::Const),
            _ => None,
        }
    }

    fn function_rest(&mut self, is_async: bool) -> PResult<FunctionExpr> {
        let name = self.expect_identifier("function name")?;
        let params = self.parameter_list()?;
        let body = self.block()?;
        Ok(FunctionExpr { name: Some(name), params, body, is_async, is_arrow: false })
    }

    fn parameter_list(&mut self) -> PResult<Vec<Param>> {
        self.expect(&TokenKind::LeftParen, "'(' before parameters")?;
        let mut params = Vec::new();
        while !self.check(&TokenKind::RightParen) {
            let is_rest = self.eat(&TokenKind::Ellipsis);
            let name = self.expect_identifier("parameter name")?;
            let default = if !is_rest && self.eat(&TokenKind::Assign) {
                Some(self.assignment_expression()?)
            } else {
                None
            };
            params.push(Param { name, default, is_rest });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RightParen, "')' after parameters")?;
        Ok(params)
    }

    fn class_declaration(&mut self) -> PResult<Stmt> {
        self.advance(); // class
        let name = self.expect_identifier("class name")?;
        let super_class = if self.eat_keyword(Keyword::Extends) {
            Some(self.expect_identifier("superclass name")?)
        } else {
            None
        };

        self.expect(&TokenKind::LeftBrace, "'{' before class body")?;
        let mut fields = Vec::new();
        let mut methods = Vec::new();

        while !self.check(&TokenKind::RightBrace) && !self.check_eof() {
            if self.eat(&TokenKind::Semicolon) {
                continue;
            }

            let mut visibility = Visibility::Public;
            let mut is_static = false;
            loop {
                match self.peek() {
                    TokenKind::Keyword(Keyword::Public) => {
                        visibility = Visibility::Public;
                        self.advance();
                    }
                    TokenKind::Keyword(Keyword::Private) => {
                        visibility = Visibility::Private;
                        self.advance();
                    }
                    TokenKind::Keyword(Keyword::Protected) => {
                        visibility = Visibility::Protected;
                        self.advance();
                    }
                    TokenKind::Keyword(Keyword::Static) => {
                        is_static = true;
                        self.advance();
                    }
                    _ => break,
                }
            }

            if let Some(kind) = self.binding_kind() {
                // Field declaration(s)
                loop {
                    let field_name = self.expect_identifier("field name")?;
                    let init = if self.eat(&TokenKind::Assign) {
                        Some(self.assignment_expression()?)
                    } else {
                        None
                    };
                    fields.push(ClassField {
                        name: field_name,
                        kind,
                        visibility,
                        is_static,
                        init,
                    });
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.eat_semicolon();
                continue;
            }

            // Method: [async] name(params) { body }
            let is_async = self.eat_keyword(Keyword::Async);
            let method_name = match self.peek().clone() {
                TokenKind::Identifier(n) => {
                    self.advance();
                    n
                }
                other => {
                    return Err(ArdanError::parse_error(
                        format!("Expected class member, found {:?}", other),
                        self.location(),
                    ))
                }
            };
            let params = self.parameter_list()?;
            let body = self.block()?;
            methods.push(ClassMethod {
                name: method_name,
                visibility,
                is_static,
                is_async,
                params,
                body,
            });
        }
        self.expect(&TokenKind::RightBrace, "'}' after class body")?;
        Ok(Stmt::Class(ClassDecl { name, super_class, fields, methods }))
    }

    fn try_statement(&mut self) -> PResult<Stmt> {
        self.advance(); // try
        let block = self.block()?;

        let handler = if self.eat_keyword(Keyword::Catch) {
            self.expect(&TokenKind::LeftParen, "'(' after 'catch'")?;
            let param = self.expect_identifier("catch binding")?;
            self.expect(&TokenKind::RightParen, "')' after catch binding")?;
            let body = self.block()?;
            Some(CatchClause { param, body })
        } else {
            None
        };

        let finalizer =
            if self.eat_keyword(Keyword::Finally) { Some(self.block()?) } else { None };

        if handler.is_none() && finalizer.is_none() {
            return Err(ArdanError::parse_error(
                "'try' requires a catch or finally clause".to_string(),
                self.location(),
            ));
        }
        Ok(Stmt::Try { block, handler, finalizer })
    }

    fn switch_statement(&mut self) -> PResult<Stmt> {
        self.advance(); // switch
        self.expect(&TokenKind::LeftParen, "'(' after 'switch'")?;
        let discriminant = self.expression()?;
        self.expect(&TokenKind::RightParen, "')' after discriminant")?;
        self.expect(&TokenKind::LeftBrace, "'{' before switch body")?;

        let mut cases = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.check_eof() {
            let test = if self.eat_keyword(Keyword::Case) {
                let test = self.expression()?;
                self.expect(&TokenKind::Colon, "':' after case value")?;
                Some(test)
            } else if self.eat_keyword(Keyword::Default) {
                self.expect(&TokenKind::Colon, "':' after 'default'")?;
                None
            } else {
                return Err(ArdanError::parse_error(
                    format!("Expected 'case' or 'default', found {:?}", self.peek()),
                    self.location(),
                ));
            };

            let mut body = Vec::new();
            while !self.check(&TokenKind::RightBrace)
                && !matches!(
                    self.peek(),
                    TokenKind::Keyword(Keyword::Case) | TokenKind::Keyword(Keyword::Default)
                )
                && !self.check_eof()
            {
                body.push(self.statement()?);
            }
            cases.push(SwitchCase { test, body });
        }
        self.expect(&TokenKind::RightBrace, "'}' after switch body")?;
        Ok(Stmt::Switch { discriminant, cases })
    }

    // ---- expressions ----

    pub fn expression(&mut self) -> PResult<Expr> {
        let first = self.assignment_expression()?;
        if self.check(&TokenKind::Comma) {
            let mut exprs = vec![first];
            while self.eat(&TokenKind::Comma) {
                exprs.push(self.assignment_expression()?);
            }
            Ok(Expr::Sequence(exprs))
        } else {
            Ok(first)
        }
    }

    fn assignment_expression(&mut self) -> PResult<Expr> {
        if let Some(arrow) = self.try_arrow_function()? {
            return Ok(arrow);
        }

        let target = self.conditional_expression()?;

        let op = match self.peek() {
            TokenKind::Assign => AssignOp::Assign,
            TokenKind::PlusAssign => AssignOp::Add,
            TokenKind::MinusAssign => AssignOp::Subtract,
            TokenKind::StarAssign => AssignOp::Multiply,
            TokenKind::StarStarAssign => AssignOp::Power,
            TokenKind::SlashAssign => AssignOp::Divide,
            TokenKind::PercentAssign => AssignOp::Modulo,
            TokenKind::ShiftLeftAssign => AssignOp::ShiftLeft,
            TokenKind::ShiftRightAssign => AssignOp::ShiftRight,
            TokenKind::UnsignedShiftRightAssign => AssignOp::UnsignedShiftRight,
            TokenKind::AmpersandAssign => AssignOp::BitAnd,
            TokenKind::PipeAssign => AssignOp::BitOr,
            TokenKind::CaretAssign => AssignOp::BitXor,
            TokenKind::AndAssign => AssignOp::LogicalAnd,
            TokenKind::OrAssign => AssignOp::LogicalOr,
            TokenKind::NullishAssign => AssignOp::NullishCoalescing,
            _ => return Ok(target),
        };
        self.advance();
        let value = self.assignment_expression()?;
        Ok(Expr::Assign { op, target: Box::new(target), value: Box::new(value) })
    }

    /// Attempts to parse an arrow function at the current position; backtracks
    /// and returns None when the lookahead is not an arrow head.
    fn try_arrow_function(&mut self) -> PResult<Option<Expr>> {
        let start = self.pos;
        let is_async = if matches!(self.peek(), TokenKind::Keyword(Keyword::Async))
            && matches!(self.peek_ahead(1), TokenKind::LeftParen | TokenKind::Identifier(_))
        {
            self.advance();
            true
        } else {
            false
        };

        // Single identifier head: `x => ...`
        if let TokenKind::Identifier(name) = self.peek().clone() {
            if matches!(self.peek_ahead(1), TokenKind::Arrow) {
                self.advance();
                self.advance();
                let body = self.arrow_body()?;
                return Ok(Some(Expr::Function(FunctionExpr {
                    name: None,
                    params: vec![Param { name, default: None, is_rest: false }],
                    body,
                    is_async,
                    is_arrow: true,
                })));
            }
        }

        // Parenthesised head: scan to the matching ')' and check for '=>'
        if self.check(&TokenKind::LeftParen) {
            let mut depth = 0usize;
            let mut probe = self.pos;
            loop {
                match &self.tokens[probe.min(self.tokens.len() - 1)].kind {
                    TokenKind::LeftParen => depth += 1,
                    TokenKind::RightParen => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    TokenKind::Eof => {
                        self.pos = start;
                        return Ok(None);
                    }
                    _ => {}
                }
                probe += 1;
            }
            if matches!(self.tokens[(probe + 1).min(self.tokens.len() - 1)].kind, TokenKind::Arrow)
            {
                let params = self.parameter_list()?;
                self.expect(&TokenKind::Arrow, "'=>'")?;
                let body = self.arrow_body()?;
                return Ok(Some(Expr::Function(FunctionExpr {
                    name: None,
                    params,
                    body,
                    is_async,
                    is_arrow: true,
                })));
            }
        }

        self.pos = start;
        Ok(None)
    }

    fn arrow_body(&mut self) -> PResult<Vec<Stmt>> {
        if self.check(&TokenKind::LeftBrace) {
            self.block()
        } else {
            // Expression body desugars to a single return
            let expr = self.assignment_expression()?;
            Ok(vec![Stmt::Return(Some(expr))])
        }
    }

    fn conditional_expression(&mut self) -> PResult<Expr> {
        let test = self.binary_expression(0)?;
        if self.eat(&TokenKind::Question) {
            let consequent = self.assignment_expression()?;
            self.expect(&TokenKind::Colon, "':' in conditional expression")?;
            let alternate = self.assignment_expression()?;
            Ok(Expr::Conditional {
                test: Box::new(test),
                consequent: Box::new(consequent),
                alternate: Box::new(alternate),
            })
        } else {
            Ok(test)
        }
    }

    /// Precedence-climbing over binary and logical operators.
    fn binary_expression(&mut self, min_prec: u8) -> PResult<Expr> {
        let mut left = self.unary_expression()?;

        loop {
            let (prec, kind) = match self.peek() {
                TokenKind::Nullish => (1, BinKind::Logical(LogicalOp::NullishCoalescing)),
                TokenKind::LogicalOr => (2, BinKind::Logical(LogicalOp::Or)),
                TokenKind::LogicalAnd => (3, BinKind::Logical(LogicalOp::And)),
                TokenKind::Pipe => (4, BinKind::Binary(BinaryOp::BitOr)),
                TokenKind::Caret => (5, BinKind::Binary(BinaryOp::BitXor)),
                TokenKind::Ampersand => (6, BinKind::Binary(BinaryOp::BitAnd)),
                TokenKind::Equal => (7, BinKind::Binary(BinaryOp::Equal)),
                TokenKind::NotEqual => (7, BinKind::Binary(BinaryOp::NotEqual)),
                TokenKind::StrictEqual => (7, BinKind::Binary(BinaryOp::StrictEqual)),
                TokenKind::StrictNotEqual => (7, BinKind::Binary(BinaryOp::StrictNotEqual)),
                TokenKind::Less => (8, BinKind::Binary(BinaryOp::LessThan)),
                TokenKind::LessEqual => (8, BinKind::Binary(BinaryOp::LessThanOrEqual)),
                TokenKind::Greater => (8, BinKind::Binary(BinaryOp::GreaterThan)),
                TokenKind::GreaterEqual => (8, BinKind::Binary(BinaryOp::GreaterThanOrEqual)),
                TokenKind::Keyword(Keyword::In) => (8, BinKind::Binary(BinaryOp::In)),
                TokenKind::Keyword(Keyword::InstanceOf) => {
                    (8, BinKind::Binary(BinaryOp::InstanceOf))
                }
                TokenKind::ShiftLeft => (9, BinKind::Binary(BinaryOp::ShiftLeft)),
                TokenKind::ShiftRight => (9, BinKind::Binary(BinaryOp::ShiftRight)),
                TokenKind::UnsignedShiftRight => {
                    (9, BinKind::Binary(BinaryOp::UnsignedShiftRight))
                }
                TokenKind::Plus => (10, BinKind::Binary(BinaryOp::Add)),
                TokenKind::Minus => (10, BinKind::Binary(BinaryOp::Subtract)),
                TokenKind::Star => (11, BinKind::Binary(BinaryOp::Multiply)),
                TokenKind::Slash => (11, BinKind::Binary(BinaryOp::Divide)),
                TokenKind::Percent => (11, BinKind::Binary(BinaryOp::Modulo)),
                TokenKind::StarStar => (12, BinKind::Binary(BinaryOp::Power)),
                _ => break,
            };
            if prec < min_prec {
                break;
            }
            self.advance();
            let right = self.binary_expression(prec + 1)?;
            left = match kind {
                BinKind::Binary(op) => {
                    Expr::Binary { op, left: Box::new(left), right: Box::new(right) }
                }
                BinKind::Logical(op) => {
                    Expr::Logical { op, left: Box::new(left), right: Box::new(right) }
                }
            };
        }

        Ok(left)
    }

    fn unary_expression(&mut self) -> PResult<Expr> {
        let op = match self.peek() {
            TokenKind::Minus => Some(UnaryOp::Negate),
            TokenKind::Plus => Some(UnaryOp::Positive),
            TokenKind::Bang => Some(UnaryOp::LogicalNot),
            TokenKind::Tilde => Some(UnaryOp::BitNot),
            TokenKind::Keyword(Keyword::TypeOf) => Some(UnaryOp::TypeOf),
            TokenKind::Keyword(Keyword::Void) => Some(UnaryOp::Void),
            TokenKind::Keyword(Keyword::Delete) => Some(UnaryOp::Delete),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let argument = self.unary_expression()?;
            return Ok(Expr::Unary { op, argument: Box::new(argument) });
        }

        match self.peek() {
            TokenKind::Increment => {
                self.advance();
                let argument = self.unary_expression()?;
                Ok(Expr::Update {
                    op: UpdateOp::Increment,
                    prefix: true,
                    argument: Box::new(argument),
                })
            }
            TokenKind::Decrement => {
                self.advance();
                let argument = self.unary_expression()?;
                Ok(Expr::Update {
                    op: UpdateOp::Decrement,
                    prefix: true,
                    argument: Box::new(argument),
                })
            }
            TokenKind::Keyword(Keyword::Await) => {
                self.advance();
                let argument = self.unary_expression()?;
                Ok(Expr::Await(Box::new(argument)))
            }
            _ => self.postfix_expression(),
        }
    }

    fn postfix_expression(&mut self) -> PResult<Expr> {
        let mut expr = self.call_expression()?;
        loop {
            match self.peek() {
                TokenKind::Increment => {
                    self.advance();
                    expr = Expr::Update {
                        op: UpdateOp::Increment,
                        prefix: false,
                        argument: Box::new(expr),
                    };
                }
                TokenKind::Decrement => {
                    self.advance();
                    expr = Expr::Update {
                        op: UpdateOp::Decrement,
                        prefix: false,
                        argument: Box::new(expr),
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn call_expression(&mut self) -> PResult<Expr> {
        let mut expr = if self.eat_keyword(Keyword::New) {
            let callee = self.member_only_expression()?;
            let arguments = if self.check(&TokenKind::LeftParen) {
                self.argument_list()?
            } else {
                Vec::new()
            };
            Expr::New { callee: Box::new(callee), arguments }
        } else {
            self.primary_expression()?
        };

        loop {
            match self.peek() {
                TokenKind::Dot => {
                    self.advance();
                    let name = self.property_name()?;
                    expr = Expr::Member { object: Box::new(expr), property: MemberKey::Name(name) };
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let key = self.expression()?;
                    self.expect(&TokenKind::RightBracket, "']' after computed key")?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property: MemberKey::Computed(Box::new(key)),
                    };
                }
                TokenKind::LeftParen => {
                    let arguments = self.argument_list()?;
                    expr = Expr::Call { callee: Box::new(expr), arguments };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// Member chain without call suffixes, used for `new X.Y(...)` callees.
    fn member_only_expression(&mut self) -> PResult<Expr> {
        let mut expr = self.primary_expression()?;
        loop {
            match self.peek() {
                TokenKind::Dot => {
                    self.advance();
                    let name = self.property_name()?;
                    expr = Expr::Member { object: Box::new(expr), property: MemberKey::Name(name) };
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let key = self.expression()?;
                    self.expect(&TokenKind::RightBracket, "']' after computed key")?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property: MemberKey::Computed(Box::new(key)),
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn property_name(&mut self) -> PResult<String> {
        match self.advance() {
            TokenKind::Identifier(name) => Ok(name),
            // Keywords are valid property names after '.'
            TokenKind::Keyword(kw) => Ok(format!("{:?}", kw).to_lowercase()),
            other => Err(ArdanError::parse_error(
                format!("Expected property name, found {:?}", other),
                self.location(),
            )),
        }
    }

    fn argument_list(&mut self) -> PResult<Vec<Argument>> {
        self.expect(&TokenKind::LeftParen, "'(' before arguments")?;
        let mut arguments = Vec::new();
        while !self.check(&TokenKind::RightParen) {
            if self.eat(&TokenKind::Ellipsis) {
                arguments.push(Argument::Spread(self.assignment_expression()?));
            } else {
                arguments.push(Argument::Single(self.assignment_expression()?));
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RightParen, "')' after arguments")?;
        Ok(arguments)
    }

    fn primary_expression(&mut self) -> PResult<Expr> {
        let loc = self.location();
        match self.advance() {
            TokenKind::Number(n) => Ok(Expr::Number(n)),
            TokenKind::Str(s) => Ok(Expr::Str(s)),
            TokenKind::Template(pieces) => self.template_literal(pieces),
            TokenKind::Keyword(Keyword::True) => Ok(Expr::Boolean(true)),
            TokenKind::Keyword(Keyword::False) => Ok(Expr::Boolean(false)),
            TokenKind::Keyword(Keyword::Null) => Ok(Expr::Null),
            TokenKind::Keyword(Keyword::Undefined) => Ok(Expr::Undefined),
            TokenKind::Keyword(Keyword::This) => Ok(Expr::This),
            TokenKind::Keyword(Keyword::Super) => Ok(Expr::Super),
            TokenKind::Identifier(name) => Ok(Expr::Identifier(name)),
            TokenKind::Keyword(Keyword::Function) => {
                let name = match self.peek().clone() {
                    TokenKind::Identifier(n) => {
                        self.advance();
                        Some(n)
                    }
                    _ => None,
                };
                let params = self.parameter_list()?;
                let body = self.block()?;
                Ok(Expr::Function(FunctionExpr {
                    name,
                    params,
                    body,
                    is_async: false,
                    is_arrow: false,
                }))
            }
            TokenKind::Keyword(Keyword::Async)
                if matches!(self.peek(), TokenKind::Keyword(Keyword::Function)) =>
            {
                self.advance();
                let name = match self.peek().clone() {
                    TokenKind::Identifier(n) => {
                        self.advance();
                        Some(n)
                    }
                    _ => None,
                };
                let params = self.parameter_list()?;
                let body = self.block()?;
                Ok(Expr::Function(FunctionExpr {
                    name,
                    params,
                    body,
                    is_async: true,
                    is_arrow: false,
                }))
            }
            TokenKind::LeftParen => {
                let expr = self.expression()?;
                self.expect(&TokenKind::RightParen, "')' after expression")?;
                Ok(expr)
            }
            TokenKind::LeftBracket => {
                let mut elements = Vec::new();
                while !self.check(&TokenKind::RightBracket) {
                    if self.eat(&TokenKind::Ellipsis) {
                        elements.push(ArrayElement::Spread(self.assignment_expression()?));
                    } else {
                        elements.push(ArrayElement::Single(self.assignment_expression()?));
                    }
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RightBracket, "']' after array literal")?;
                Ok(Expr::Array(elements))
            }
            TokenKind::LeftBrace => {
                let mut properties = Vec::new();
                while !self.check(&TokenKind::RightBrace) {
                    if self.eat(&TokenKind::Ellipsis) {
                        properties.push(ObjectProperty::Spread(self.assignment_expression()?));
                    } else {
                        let key = match self.advance() {
                            TokenKind::Identifier(name) => name,
                            TokenKind::Str(s) => s,
                            TokenKind::Number(n) => crate::runtime::value::number_to_string(n),
                            other => {
                                return Err(ArdanError::parse_error(
                                    format!("Expected property key, found {:?}", other),
                                    self.location(),
                                ))
                            }
                        };
                        if self.check(&TokenKind::LeftParen) {
                            // Shorthand method: key(params) { body }
                            let params = self.parameter_list()?;
                            let body = self.block()?;
                            properties.push(ObjectProperty::Pair(
                                key,
                                Expr::Function(FunctionExpr {
                                    name: None,
                                    params,
                                    body,
                                    is_async: false,
                                    is_arrow: false,
                                }),
                            ));
                        } else if self.eat(&TokenKind::Colon) {
                            properties
                                .push(ObjectProperty::Pair(key, self.assignment_expression()?));
                        } else {
                            // Shorthand property: { x } means { x: x }
                            properties
                                .push(ObjectProperty::Pair(key.clone(), Expr::Identifier(key)));
                        }
                    }
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RightBrace, "'}' after object literal")?;
                Ok(Expr::Object(properties))
            }
            other => Err(ArdanError::parse_error(
                format!("Unexpected token {:?}", other),
                loc,
            )),
        }
    }

    fn template_literal(&mut self, pieces: Vec<TemplatePiece>) -> PResult<Expr> {
        let mut quasis = Vec::new();
        let mut expressions = Vec::new();
        for piece in pieces {
            match piece {
                TemplatePiece::Text(text) => quasis.push(text),
                TemplatePiece::Source(source) => {
                    let mut sub = Parser::new(tokenize(&source));
                    sub.source_file = self.source_file.clone();
                    expressions.push(sub.expression()?);
                }
            }
        }
        Ok(Expr::TemplateLiteral { quasis, expressions })
    }
}

enum BinKind {
    Binary(BinaryOp),
    Logical(LogicalOp),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Vec<Stmt> {
        Parser::new(tokenize(src)).parse().expect("parse failed")
    }

    #[test]
    fn parses_variable_declarations() {
        let program = parse("let x = 1, y = 2; const z = x + y;");
        assert_eq!(program.len(), 2);
        match &program[0] {
            Stmt::Variable { kind, declarations } => {
                assert_eq!(*kind, BindingKind::Let);
                assert_eq!(declarations.len(), 2);
            }
            other => panic!("expected variable statement, got {:?}", other),
        }
    }

    #[test]
    fn parses_arrow_functions() {
        let program = parse("let f = (a, b) => a + b; let g = x => x;");
        match &program[0] {
            Stmt::Variable { declarations, .. } => match &declarations[0].init {
                Some(Expr::Function(f)) => {
                    assert!(f.is_arrow);
                    assert_eq!(f.params.len(), 2);
                    assert!(matches!(f.body[0], Stmt::Return(Some(_))));
                }
                other => panic!("expected arrow function, got {:?}", other),
            },
            other => panic!("expected variable statement, got {:?}", other),
        }
    }

    #[test]
    fn parses_class_with_modifiers() {
        let program = parse(
            "class A extends B { protected var v = 10; static const K = 1; getV() { return this.v; } }",
        );
        match &program[0] {
            Stmt::Class(decl) => {
                assert_eq!(decl.super_class.as_deref(), Some("B"));
                assert_eq!(decl.fields.len(), 2);
                assert_eq!(decl.fields[0].visibility, Visibility::Protected);
                assert!(decl.fields[1].is_static);
                assert_eq!(decl.methods.len(), 1);
            }
            other => panic!("expected class, got {:?}", other),
        }
    }

    #[test]
    fn parses_for_of_and_for_in() {
        let program = parse("for (let x of xs) {} for (k in o) {}");
        assert!(matches!(&program[0], Stmt::ForOf { binding: ForBinding::Declaration(BindingKind::Let, _), .. }));
        assert!(matches!(&program[1], Stmt::ForIn { binding: ForBinding::Identifier(_), .. }));
    }

    #[test]
    fn parses_try_catch_finally() {
        let program = parse("try { a(); } catch (e) { b(e); } finally { c(); }");
        match &program[0] {
            Stmt::Try { handler, finalizer, .. } => {
                assert_eq!(handler.as_ref().unwrap().param, "e");
                assert!(finalizer.is_some());
            }
            other => panic!("expected try, got {:?}", other),
        }
    }

    #[test]
    fn try_without_clauses_is_an_error() {
        let mut parser = Parser::new(tokenize("try { a(); }"));
        assert!(parser.parse().is_err());
    }

    #[test]
    fn parses_rest_and_default_parameters() {
        let program = parse("function f(a, b = 2, ...rest) {}");
        match &program[0] {
            Stmt::Function(f) => {
                assert!(f.params[1].default.is_some());
                assert!(f.params[2].is_rest);
            }
            other => panic!("expected function, got {:?}", other),
        }
    }
}
