//! Tokenizer for the script language.

use super::error::{Result, ScriptError};
use std::iter::Peekable;
use std::str::Chars;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Number(f64),
    Str(String),
    Template(Vec<TemplatePart>),
    Regex { pattern: String, flags: String },
    Identifier(String),

    // Keywords
    Let,
    Const,
    Var,
    If,
    Else,
    For,
    Return,
    Function,
    True,
    False,
    Null,
    Undefined,
    Typeof,
    Break,
    Continue,
    Throw,
    New,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Assign,
    PlusAssign,
    MinusAssign,
    Equal,
    NotEqual,
    StrictEqual,
    StrictNotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    And,
    Or,
    Nullish,
    Not,
    Question,
    FatArrow,

    // Delimiters
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    Colon,
    Semicolon,

    Eof,
}

/// Literal text or an embedded `${...}` expression of a template literal.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Text(String),
    Code(Vec<Token>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
    pub lexeme: String,
}

impl Token {
    pub fn new(kind: TokenKind, line: usize, column: usize, lexeme: impl Into<String>) -> Self {
        Token {
            kind,
            line,
            column,
            lexeme: lexeme.into(),
        }
    }

    /// Identifiers and keywords, which may both appear as property names.
    pub fn is_word(&self) -> bool {
        self.lexeme
            .chars()
            .next()
            .is_some_and(|c| c.is_alphabetic() || c == '_' || c == '$')
            && !matches!(self.kind, TokenKind::Str(_) | TokenKind::Template(_))
    }

    /// Tokens after which `/` is division rather than a regex literal.
    fn ends_value(&self) -> bool {
        matches!(
            self.kind,
            TokenKind::Number(_)
                | TokenKind::Str(_)
                | TokenKind::Template(_)
                | TokenKind::Regex { .. }
                | TokenKind::Identifier(_)
                | TokenKind::True
                | TokenKind::False
                | TokenKind::Null
                | TokenKind::Undefined
                | TokenKind::RightParen
                | TokenKind::RightBracket
                | TokenKind::RightBrace
        )
    }
}

pub struct Lexer<'a> {
    source: Peekable<Chars<'a>>,
    line: usize,
    column: usize,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self::at(source, 1, 1)
    }

    fn at(source: &'a str, line: usize, column: usize) -> Self {
        Lexer {
            source: source.chars().peekable(),
            line,
            column,
            tokens: Vec::new(),
        }
    }

    /// Tokenize the whole input; the last token is always `Eof`.
    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        loop {
            self.skip_whitespace()?;
            let (line, column) = (self.line, self.column);
            let Some(ch) = self.advance() else {
                self.tokens.push(Token::new(TokenKind::Eof, line, column, ""));
                return Ok(self.tokens);
            };
            let token = self.scan(ch, line, column)?;
            self.tokens.push(token);
        }
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.source.next()?;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn peek(&mut self) -> Option<char> {
        self.source.peek().copied()
    }

    fn peek_second(&self) -> Option<char> {
        let mut chars = self.source.clone();
        chars.next();
        chars.next()
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::syntax(self.line, self.column, message)
    }

    fn skip_whitespace(&mut self) -> Result<()> {
        while let Some(ch) = self.peek() {
            match ch {
                c if c.is_whitespace() => {
                    self.advance();
                }
                '/' if self.peek_second() == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                '/' if self.peek_second() == Some('*') => {
                    self.advance();
                    self.advance();
                    loop {
                        match self.advance() {
                            Some('*') if self.peek() == Some('/') => {
                                self.advance();
                                break;
                            }
                            Some(_) => {}
                            None => return Err(self.error("unterminated comment")),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
        Ok(())
    }

    fn scan(&mut self, ch: char, line: usize, column: usize) -> Result<Token> {
        let simple = |kind: TokenKind, lexeme: &str| -> Result<Token> {
            Ok(Token::new(kind, line, column, lexeme))
        };

        match ch {
            '"' | '\'' => self.scan_string(ch, line, column),
            '`' => self.scan_template(line, column),
            '0'..='9' => self.scan_number(ch, line, column),
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                Ok(self.scan_identifier(c, line, column))
            }
            '/' if !self.tokens.last().is_some_and(Token::ends_value) => {
                self.scan_regex(line, column)
            }

            '+' if self.match_char('=') => simple(TokenKind::PlusAssign, "+="),
            '+' => simple(TokenKind::Plus, "+"),
            '-' if self.match_char('=') => simple(TokenKind::MinusAssign, "-="),
            '-' => simple(TokenKind::Minus, "-"),
            '*' => simple(TokenKind::Star, "*"),
            '/' => simple(TokenKind::Slash, "/"),
            '%' => simple(TokenKind::Percent, "%"),
            '=' => {
                if self.match_char('=') {
                    if self.match_char('=') {
                        simple(TokenKind::StrictEqual, "===")
                    } else {
                        simple(TokenKind::Equal, "==")
                    }
                } else if self.match_char('>') {
                    simple(TokenKind::FatArrow, "=>")
                } else {
                    simple(TokenKind::Assign, "=")
                }
            }
            '!' => {
                if self.match_char('=') {
                    if self.match_char('=') {
                        simple(TokenKind::StrictNotEqual, "!==")
                    } else {
                        simple(TokenKind::NotEqual, "!=")
                    }
                } else {
                    simple(TokenKind::Not, "!")
                }
            }
            '<' if self.match_char('=') => simple(TokenKind::LessEqual, "<="),
            '<' => simple(TokenKind::Less, "<"),
            '>' if self.match_char('=') => simple(TokenKind::GreaterEqual, ">="),
            '>' => simple(TokenKind::Greater, ">"),
            '&' if self.match_char('&') => simple(TokenKind::And, "&&"),
            '|' if self.match_char('|') => simple(TokenKind::Or, "||"),
            '?' if self.match_char('?') => simple(TokenKind::Nullish, "??"),
            '?' => simple(TokenKind::Question, "?"),

            '(' => simple(TokenKind::LeftParen, "("),
            ')' => simple(TokenKind::RightParen, ")"),
            '{' => simple(TokenKind::LeftBrace, "{"),
            '}' => simple(TokenKind::RightBrace, "}"),
            '[' => simple(TokenKind::LeftBracket, "["),
            ']' => simple(TokenKind::RightBracket, "]"),
            ',' => simple(TokenKind::Comma, ","),
            '.' => simple(TokenKind::Dot, "."),
            ':' => simple(TokenKind::Colon, ":"),
            ';' => simple(TokenKind::Semicolon, ";"),

            other => Err(ScriptError::syntax(
                line,
                column,
                format!("unexpected character '{other}'"),
            )),
        }
    }

    fn scan_escape(&mut self, value: &mut String) -> Result<()> {
        match self.advance() {
            Some('n') => value.push('\n'),
            Some('t') => value.push('\t'),
            Some('r') => value.push('\r'),
            Some('0') => value.push('\0'),
            Some('u') => {
                let hex: String = (0..4).filter_map(|_| self.advance()).collect();
                let ch = u32::from_str_radix(&hex, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| self.error(format!("invalid unicode escape \\u{hex}")))?;
                value.push(ch);
            }
            Some(c) => value.push(c),
            None => return Err(self.error("unterminated string")),
        }
        Ok(())
    }

    fn scan_string(&mut self, quote: char, line: usize, column: usize) -> Result<Token> {
        let mut value = String::new();
        loop {
            match self.advance() {
                Some(c) if c == quote => break,
                Some('\\') => self.scan_escape(&mut value)?,
                Some('\n') | None => {
                    return Err(ScriptError::syntax(line, column, "unterminated string"))
                }
                Some(c) => value.push(c),
            }
        }
        let lexeme = format!("{quote}{value}{quote}");
        Ok(Token::new(TokenKind::Str(value), line, column, lexeme))
    }

    fn scan_template(&mut self, line: usize, column: usize) -> Result<Token> {
        let mut parts = Vec::new();
        let mut text = String::new();
        loop {
            match self.advance() {
                Some('`') => break,
                Some('\\') => self.scan_escape(&mut text)?,
                Some('$') if self.peek() == Some('{') => {
                    self.advance();
                    if !text.is_empty() {
                        parts.push(TemplatePart::Text(std::mem::take(&mut text)));
                    }
                    let (code_line, code_column) = (self.line, self.column);
                    let code = self.template_code(line, column)?;
                    let mut tokens = Lexer::at(&code, code_line, code_column).tokenize()?;
                    if tokens.len() == 1 {
                        return Err(ScriptError::syntax(
                            code_line,
                            code_column,
                            "empty template expression",
                        ));
                    }
                    tokens.shrink_to_fit();
                    parts.push(TemplatePart::Code(tokens));
                }
                Some(c) => text.push(c),
                None => return Err(ScriptError::syntax(line, column, "unterminated template")),
            }
        }
        if !text.is_empty() {
            parts.push(TemplatePart::Text(text));
        }
        Ok(Token::new(TokenKind::Template(parts), line, column, "`...`"))
    }

    /// Raw source of a `${...}` body, with the closing brace consumed.
    fn template_code(&mut self, line: usize, column: usize) -> Result<String> {
        let mut code = String::new();
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        loop {
            let Some(c) = self.advance() else {
                return Err(ScriptError::syntax(line, column, "unterminated template"));
            };
            match quote {
                Some(q) => {
                    code.push(c);
                    if c == '\\' {
                        if let Some(next) = self.advance() {
                            code.push(next);
                        }
                    } else if c == q {
                        quote = None;
                    }
                }
                None => match c {
                    '}' if depth == 0 => return Ok(code),
                    '}' => {
                        depth -= 1;
                        code.push(c);
                    }
                    '{' => {
                        depth += 1;
                        code.push(c);
                    }
                    '"' | '\'' | '`' => {
                        quote = Some(c);
                        code.push(c);
                    }
                    _ => code.push(c),
                },
            }
        }
    }

    fn scan_number(&mut self, first: char, line: usize, column: usize) -> Result<Token> {
        let mut text = String::from(first);
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.advance();
            } else if c == '.'
                && !text.contains(['.', 'e'])
                && self.peek_second().is_some_and(|n| n.is_ascii_digit())
            {
                text.push(c);
                self.advance();
            } else if (c == 'e' || c == 'E') && !text.contains('e') {
                text.push('e');
                self.advance();
                if let Some(sign @ ('+' | '-')) = self.peek() {
                    text.push(sign);
                    self.advance();
                }
            } else {
                break;
            }
        }
        let value: f64 = text
            .parse()
            .map_err(|_| ScriptError::syntax(line, column, format!("invalid number '{text}'")))?;
        Ok(Token::new(TokenKind::Number(value), line, column, text))
    }

    fn scan_identifier(&mut self, first: char, line: usize, column: usize) -> Token {
        let mut ident = String::from(first);
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '$' {
                ident.push(c);
                self.advance();
            } else {
                break;
            }
        }

        let kind = match ident.as_str() {
            "let" => TokenKind::Let,
            "const" => TokenKind::Const,
            "var" => TokenKind::Var,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "for" => TokenKind::For,
            "return" => TokenKind::Return,
            "function" => TokenKind::Function,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "null" => TokenKind::Null,
            "undefined" => TokenKind::Undefined,
            "typeof" => TokenKind::Typeof,
            "break" => TokenKind::Break,
            "continue" => TokenKind::Continue,
            "throw" => TokenKind::Throw,
            "new" => TokenKind::New,
            _ => TokenKind::Identifier(ident.clone()),
        };
        Token::new(kind, line, column, ident)
    }

    fn scan_regex(&mut self, line: usize, column: usize) -> Result<Token> {
        let mut pattern = String::new();
        let mut in_class = false;
        loop {
            match self.advance() {
                Some('/') if !in_class => break,
                Some('\\') => {
                    pattern.push('\\');
                    match self.advance() {
                        Some(c) if c != '\n' => pattern.push(c),
                        _ => return Err(ScriptError::syntax(line, column, "unterminated regex")),
                    }
                }
                Some('\n') | None => {
                    return Err(ScriptError::syntax(line, column, "unterminated regex"))
                }
                Some(c) => {
                    match c {
                        '[' => in_class = true,
                        ']' => in_class = false,
                        _ => {}
                    }
                    pattern.push(c);
                }
            }
        }
        let mut flags = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphabetic() {
                flags.push(c);
                self.advance();
            } else {
                break;
            }
        }
        let lexeme = format!("/{pattern}/{flags}");
        Ok(Token::new(TokenKind::Regex { pattern, flags }, line, column, lexeme))
    }
}
