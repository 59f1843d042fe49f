//! Recursive-descent parser turning tokens into a [`Statement`] list.

use super::ast::*;
use super::error::{Result, ScriptError};
use super::lexer::{Lexer, TemplatePart, Token, TokenKind};
use std::rc::Rc;

const MAX_NESTING: usize = 64;

pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
    depth: usize,
}

/// Tokenize and parse a whole script.
pub fn parse_program(source: &str) -> Result<Vec<Statement>> {
    let tokens = Lexer::new(source).tokenize()?;
    Parser::new(tokens).parse()
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser {
            tokens,
            current: 0,
            depth: 0,
        }
    }

    pub fn parse(&mut self) -> Result<Vec<Statement>> {
        let mut statements = Vec::new();
        while !self.is_at_end() {
            statements.push(self.statement()?);
        }
        Ok(statements)
    }

    // Helpers

    fn is_at_end(&self) -> bool {
        self.check(&TokenKind::Eof)
    }

    fn peek(&self) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.current.min(last)]
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.current + offset)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if !self.is_at_end() {
            self.current += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.tokens
            .get(self.current)
            .is_some_and(|t| std::mem::discriminant(&t.kind) == std::mem::discriminant(kind))
    }

    fn match_token(&mut self, kinds: &[TokenKind]) -> bool {
        for kind in kinds {
            if self.check(kind) {
                self.advance();
                return true;
            }
        }
        false
    }

    fn consume(&mut self, kind: &TokenKind, message: &str) -> Result<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error_here(message))
        }
    }

    fn error_here(&self, message: &str) -> ScriptError {
        Self::error_at(self.peek(), message)
    }

    fn error_at(token: &Token, message: &str) -> ScriptError {
        let found = if matches!(token.kind, TokenKind::Eof) {
            "end of script".to_string()
        } else {
            format!("'{}'", token.lexeme)
        };
        ScriptError::syntax(token.line, token.column, format!("{message}, found {found}"))
    }

    fn identifier(&mut self, message: &str) -> Result<String> {
        match &self.peek().kind {
            TokenKind::Identifier(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.error_here(message)),
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            let token = self.peek();
            return Err(ScriptError::syntax(token.line, token.column, "script nested too deeply"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn end_statement(&mut self) {
        self.match_token(&[TokenKind::Semicolon]);
    }

    // Statements

    fn statement(&mut self) -> Result<Statement> {
        self.enter()?;
        let statement = self.statement_inner();
        self.leave();
        statement
    }

    fn statement_inner(&mut self) -> Result<Statement> {
        match self.peek().kind {
            TokenKind::Semicolon => {
                self.advance();
                Ok(Statement::Block(Vec::new()))
            }
            TokenKind::Let | TokenKind::Var => {
                self.advance();
                self.let_declaration(false)
            }
            TokenKind::Const => {
                self.advance();
                self.let_declaration(true)
            }
            TokenKind::Function
                if matches!(self.peek_at(1).map(|t| &t.kind), Some(TokenKind::Identifier(_))) =>
            {
                self.advance();
                let name = self.identifier("expected function name")?;
                let def = self.function_rest(Some(name.clone()))?;
                Ok(Statement::Let {
                    name,
                    value: Some(Expression::Function(def)),
                    constant: false,
                })
            }
            TokenKind::If => {
                self.advance();
                self.if_statement()
            }
            TokenKind::For => {
                self.advance();
                self.for_of_statement()
            }
            TokenKind::Return => {
                let token = self.advance();
                let has_value = !self.check(&TokenKind::Semicolon)
                    && !self.check(&TokenKind::RightBrace)
                    && !self.is_at_end()
                    && self.peek().line == token.line;
                let value = if has_value { Some(self.expression()?) } else { None };
                self.end_statement();
                Ok(Statement::Return(value))
            }
            TokenKind::Break => {
                self.advance();
                self.end_statement();
                Ok(Statement::Break)
            }
            TokenKind::Continue => {
                self.advance();
                self.end_statement();
                Ok(Statement::Continue)
            }
            TokenKind::Throw => {
                self.advance();
                let value = self.expression()?;
                self.end_statement();
                Ok(Statement::Throw(value))
            }
            TokenKind::LeftBrace => {
                self.advance();
                Ok(Statement::Block(self.block()?))
            }
            _ => {
                let expr = self.expression()?;
                self.end_statement();
                Ok(Statement::Expression(expr))
            }
        }
    }

    fn let_declaration(&mut self, constant: bool) -> Result<Statement> {
        let name = self.identifier("expected variable name")?;
        let value = if self.match_token(&[TokenKind::Assign]) {
            Some(self.expression()?)
        } else if constant {
            return Err(self.error_here("missing initializer in const declaration"));
        } else {
            None
        };
        self.end_statement();
        Ok(Statement::Let { name, value, constant })
    }

    /// Statements up to and including the closing `}`.
    fn block(&mut self) -> Result<Vec<Statement>> {
        let mut statements = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.is_at_end() {
            statements.push(self.statement()?);
        }
        self.consume(&TokenKind::RightBrace, "expected '}' after block")?;
        Ok(statements)
    }

    fn if_statement(&mut self) -> Result<Statement> {
        self.consume(&TokenKind::LeftParen, "expected '(' after 'if'")?;
        let condition = self.expression()?;
        self.consume(&TokenKind::RightParen, "expected ')' after condition")?;
        let then_branch = Box::new(self.statement()?);
        let else_branch = if self.match_token(&[TokenKind::Else]) {
            Some(Box::new(self.statement()?))
        } else {
            None
        };
        Ok(Statement::If {
            condition,
            then_branch,
            else_branch,
        })
    }

    fn for_of_statement(&mut self) -> Result<Statement> {
        self.consume(&TokenKind::LeftParen, "expected '(' after 'for'")?;
        if !self.match_token(&[TokenKind::Const, TokenKind::Let, TokenKind::Var]) {
            return Err(self.error_here("only 'for (const x of items)' loops are supported"));
        }
        let name = self.identifier("expected loop variable name")?;
        match &self.peek().kind {
            TokenKind::Identifier(word) if word == "of" => {
                self.advance();
            }
            _ => return Err(self.error_here("only 'for (const x of items)' loops are supported")),
        }
        let iterable = self.expression()?;
        self.consume(&TokenKind::RightParen, "expected ')' after loop header")?;
        let body = Box::new(self.statement()?);
        Ok(Statement::ForOf { name, iterable, body })
    }

    // Expressions, lowest precedence first

    pub fn expression(&mut self) -> Result<Expression> {
        self.enter()?;
        let expr = self.assignment();
        self.leave();
        expr
    }

    fn assignment(&mut self) -> Result<Expression> {
        if let Some(arrow) = self.arrow_function()? {
            return Ok(arrow);
        }

        let target = self.conditional()?;
        let op = match self.peek().kind {
            TokenKind::Assign => AssignOp::Assign,
            TokenKind::PlusAssign => AssignOp::Add,
            TokenKind::MinusAssign => AssignOp::Sub,
            _ => return Ok(target),
        };
        if !matches!(
            target,
            Expression::Identifier(_) | Expression::Member { .. } | Expression::Index { .. }
        ) {
            return Err(self.error_here("invalid assignment target"));
        }
        self.advance();
        let value = self.expression()?;
        Ok(Expression::Assign {
            op,
            target: Box::new(target),
            value: Box::new(value),
        })
    }

    /// `x => ...` or `(a, b) => ...`, detected by lookahead.
    fn arrow_function(&mut self) -> Result<Option<Expression>> {
        let params = match self.peek().kind {
            TokenKind::Identifier(_)
                if matches!(self.peek_at(1).map(|t| &t.kind), Some(TokenKind::FatArrow)) =>
            {
                vec![self.identifier("expected parameter name")?]
            }
            TokenKind::LeftParen if self.paren_followed_by_arrow() => {
                self.advance();
                self.parameters()?
            }
            _ => return Ok(None),
        };
        self.consume(&TokenKind::FatArrow, "expected '=>'")?;

        let body = if self.match_token(&[TokenKind::LeftBrace]) {
            FunctionBody::Block(self.block()?)
        } else {
            FunctionBody::Expression(self.expression()?)
        };
        Ok(Some(Expression::Function(Rc::new(FunctionDef {
            name: None,
            params,
            body,
        }))))
    }

    fn paren_followed_by_arrow(&self) -> bool {
        let mut depth = 0usize;
        for (offset, token) in self.tokens[self.current..].iter().enumerate() {
            match token.kind {
                TokenKind::LeftParen => depth += 1,
                TokenKind::RightParen => {
                    depth -= 1;
                    if depth == 0 {
                        return matches!(
                            self.peek_at(offset + 1).map(|t| &t.kind),
                            Some(TokenKind::FatArrow)
                        );
                    }
                }
                TokenKind::Eof => return false,
                _ => {}
            }
        }
        false
    }

    /// Parameter names after `(`, including the closing `)`.
    fn parameters(&mut self) -> Result<Vec<String>> {
        let mut params = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                params.push(self.identifier("expected parameter name")?);
                if !self.match_token(&[TokenKind::Comma]) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "expected ')' after parameters")?;
        Ok(params)
    }

    /// `(params) { body }` of a `function`.
    fn function_rest(&mut self, name: Option<String>) -> Result<Rc<FunctionDef>> {
        self.consume(&TokenKind::LeftParen, "expected '(' after function")?;
        let params = self.parameters()?;
        self.consume(&TokenKind::LeftBrace, "expected '{' before function body")?;
        let body = FunctionBody::Block(self.block()?);
        Ok(Rc::new(FunctionDef { name, params, body }))
    }

    fn conditional(&mut self) -> Result<Expression> {
        let condition = self.nullish()?;
        if !self.match_token(&[TokenKind::Question]) {
            return Ok(condition);
        }
        let then_expr = self.expression()?;
        self.consume(&TokenKind::Colon, "expected ':' in conditional expression")?;
        let else_expr = self.expression()?;
        Ok(Expression::Conditional {
            condition: Box::new(condition),
            then_expr: Box::new(then_expr),
            else_expr: Box::new(else_expr),
        })
    }

    fn logical(
        &mut self,
        kind: TokenKind,
        op: LogicalOp,
        next: fn(&mut Self) -> Result<Expression>,
    ) -> Result<Expression> {
        let mut expr = next(self)?;
        while self.match_token(std::slice::from_ref(&kind)) {
            let right = next(self)?;
            expr = Expression::Logical {
                op,
                left: Box::new(expr),
                right: Box::new(right),
            };
        }
        Ok(expr)
    }

    fn nullish(&mut self) -> Result<Expression> {
        self.logical(TokenKind::Nullish, LogicalOp::Nullish, Self::or)
    }

    fn or(&mut self) -> Result<Expression> {
        self.logical(TokenKind::Or, LogicalOp::Or, Self::and)
    }

    fn and(&mut self) -> Result<Expression> {
        self.logical(TokenKind::And, LogicalOp::And, Self::equality)
    }

    fn binary(
        &mut self,
        ops: &[(TokenKind, BinaryOp)],
        next: fn(&mut Self) -> Result<Expression>,
    ) -> Result<Expression> {
        let mut expr = next(self)?;
        'outer: loop {
            for (kind, op) in ops {
                if self.match_token(std::slice::from_ref(kind)) {
                    let right = next(self)?;
                    expr = Expression::Binary {
                        op: *op,
                        left: Box::new(expr),
                        right: Box::new(right),
                    };
                    continue 'outer;
                }
            }
            return Ok(expr);
        }
    }

    fn equality(&mut self) -> Result<Expression> {
        self.binary(
            &[
                (TokenKind::StrictEqual, BinaryOp::StrictEqual),
                (TokenKind::StrictNotEqual, BinaryOp::StrictNotEqual),
                (TokenKind::Equal, BinaryOp::Equal),
                (TokenKind::NotEqual, BinaryOp::NotEqual),
            ],
            Self::comparison,
        )
    }

    fn comparison(&mut self) -> Result<Expression> {
        self.binary(
            &[
                (TokenKind::Less, BinaryOp::Less),
                (TokenKind::LessEqual, BinaryOp::LessEqual),
                (TokenKind::Greater, BinaryOp::Greater),
                (TokenKind::GreaterEqual, BinaryOp::GreaterEqual),
            ],
            Self::term,
        )
    }

    fn term(&mut self) -> Result<Expression> {
        self.binary(
            &[(TokenKind::Plus, BinaryOp::Add), (TokenKind::Minus, BinaryOp::Sub)],
            Self::factor,
        )
    }

    fn factor(&mut self) -> Result<Expression> {
        self.binary(
            &[
                (TokenKind::Star, BinaryOp::Mul),
                (TokenKind::Slash, BinaryOp::Div),
                (TokenKind::Percent, BinaryOp::Mod),
            ],
            Self::unary,
        )
    }

    fn unary(&mut self) -> Result<Expression> {
        let op = match self.peek().kind {
            TokenKind::Not => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Negate,
            TokenKind::Plus => UnaryOp::Plus,
            TokenKind::Typeof => UnaryOp::Typeof,
            _ => return self.call(),
        };
        self.advance();
        self.enter()?;
        let operand = self.unary();
        self.leave();
        Ok(Expression::Unary {
            op,
            operand: Box::new(operand?),
        })
    }

    fn call(&mut self) -> Result<Expression> {
        // `new` is accepted and ignored: `new Error(msg)` is a plain call.
        self.match_token(&[TokenKind::New]);
        let mut expr = self.primary()?;
        loop {
            if self.match_token(&[TokenKind::LeftParen]) {
                let args = self.arguments()?;
                expr = Expression::Call {
                    callee: Box::new(expr),
                    args,
                };
            } else if self.match_token(&[TokenKind::Dot]) {
                if !self.peek().is_word() {
                    return Err(self.error_here("expected property name after '.'"));
                }
                let property = self.advance().lexeme;
                expr = Expression::Member {
                    object: Box::new(expr),
                    property,
                };
            } else if self.match_token(&[TokenKind::LeftBracket]) {
                let index = self.expression()?;
                self.consume(&TokenKind::RightBracket, "expected ']' after index")?;
                expr = Expression::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expression>> {
        let mut args = Vec::new();
        while !self.check(&TokenKind::RightParen) {
            args.push(self.expression()?);
            if !self.match_token(&[TokenKind::Comma]) {
                break;
            }
        }
        self.consume(&TokenKind::RightParen, "expected ')' after arguments")?;
        Ok(args)
    }

    fn primary(&mut self) -> Result<Expression> {
        let token = self.advance();
        let expr = match token.kind {
            TokenKind::Number(n) => Expression::Number(n),
            TokenKind::Str(s) => Expression::Str(s),
            TokenKind::True => Expression::Bool(true),
            TokenKind::False => Expression::Bool(false),
            TokenKind::Null => Expression::Null,
            TokenKind::Undefined => Expression::Undefined,
            TokenKind::Identifier(name) => Expression::Identifier(name),
            TokenKind::Regex { pattern, flags } => Expression::Regex { pattern, flags },
            TokenKind::Template(parts) => self.template(parts)?,
            TokenKind::LeftParen => {
                let expr = self.expression()?;
                self.consume(&TokenKind::RightParen, "expected ')' after expression")?;
                expr
            }
            TokenKind::LeftBracket => {
                let mut items = Vec::new();
                while !self.check(&TokenKind::RightBracket) {
                    items.push(self.expression()?);
                    if !self.match_token(&[TokenKind::Comma]) {
                        break;
                    }
                }
                self.consume(&TokenKind::RightBracket, "expected ']' after array items")?;
                Expression::Array(items)
            }
            TokenKind::LeftBrace => self.object_literal()?,
            TokenKind::Function => {
                let name = match &self.peek().kind {
                    TokenKind::Identifier(name) => {
                        let name = name.clone();
                        self.advance();
                        Some(name)
                    }
                    _ => None,
                };
                Expression::Function(self.function_rest(name)?)
            }
            _ => return Err(Self::error_at(&token, "expected expression")),
        };
        Ok(expr)
    }

    fn object_literal(&mut self) -> Result<Expression> {
        let mut entries = Vec::new();
        while !self.check(&TokenKind::RightBrace) {
            let key_token = self.advance();
            let key = match &key_token.kind {
                TokenKind::Str(s) => s.clone(),
                TokenKind::Number(_) => key_token.lexeme.clone(),
                _ if key_token.is_word() => key_token.lexeme.clone(),
                _ => return Err(Self::error_at(&key_token, "expected property name")),
            };
            let value = if self.match_token(&[TokenKind::Colon]) {
                self.expression()?
            } else if matches!(key_token.kind, TokenKind::Identifier(_)) {
                Expression::Identifier(key.clone())
            } else {
                return Err(self.error_here("expected ':' after property name"));
            };
            entries.push((key, value));
            if !self.match_token(&[TokenKind::Comma]) {
                break;
            }
        }
        self.consume(&TokenKind::RightBrace, "expected '}' after object literal")?;
        Ok(Expression::Object(entries))
    }

    fn template(&mut self, parts: Vec<TemplatePart>) -> Result<Expression> {
        let mut segments = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                TemplatePart::Text(text) => segments.push(TemplateSegment::Text(text)),
                TemplatePart::Code(tokens) => {
                    let mut inner = Parser {
                        tokens,
                        current: 0,
                        depth: self.depth,
                    };
                    let expr = inner.expression()?;
                    if !inner.is_at_end() {
                        return Err(inner.error_here("unexpected token in template expression"));
                    }
                    segments.push(TemplateSegment::Expr(expr));
                }
            }
        }
        Ok(Expression::Template(segments))
    }
}
