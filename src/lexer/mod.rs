use std::iter::Peekable;
use std::str::Chars;

use crate::errors::Diagnostic;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Control flow
    If, Else, While, For, Switch, Case, Default, Try, Catch,
    Return, Break, Continue, Class,

    // Types
    Int, Double, String, Bool, Array, List, PriorityList, Queue, Void,

    // Literal keywords
    True, False, Null, SelfRef,

    // Literals
    NumberLiteral(f64),
    StringLiteral(String),

    // Identifiers
    Identifier(String),

    // Operators
    EqualEqual, NotEqual, LessEqual, GreaterEqual, AndAnd, OrOr,
    Plus, Minus, Star, Slash, Percent, Less, Greater, Assign,

    // Punctuation
    OpenParen, CloseParen, OpenBrace, CloseBrace, OpenBracket, CloseBracket,
    Semicolon, Comma, Dot, Colon,

    // Special
    Comment(String),
    EOF,
}

/// Coarse token classes, as reported in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Keyword,
    Identifier,
    Number,
    String,
    Operator,
    Punctuation,
    Comment,
    EndOfInput,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TokenKind::Keyword => "KEYWORD",
            TokenKind::Identifier => "IDENTIFIER",
            TokenKind::Number => "NUMBER",
            TokenKind::String => "STRING",
            TokenKind::Operator => "OPERATOR",
            TokenKind::Punctuation => "PUNCTUATION",
            TokenKind::Comment => "COMMENT",
            TokenKind::EndOfInput => "EOF",
        };
        f.write_str(name)
    }
}

/// Longest match first: two-character operators precede their prefixes.
const OPERATORS: &[(&str, Token)] = &[
    ("==", Token::EqualEqual),
    ("!=", Token::NotEqual),
    ("<=", Token::LessEqual),
    (">=", Token::GreaterEqual),
    ("&&", Token::AndAnd),
    ("||", Token::OrOr),
    ("+", Token::Plus),
    ("-", Token::Minus),
    ("*", Token::Star),
    ("/", Token::Slash),
    ("%", Token::Percent),
    ("<", Token::Less),
    (">", Token::Greater),
    ("=", Token::Assign),
];

impl Token {
    pub fn keyword(word: &str) -> Option<Token> {
        let token = match word {
            "if" => Token::If,
            "else" => Token::Else,
            "while" => Token::While,
            "for" => Token::For,
            "switch" => Token::Switch,
            "case" => Token::Case,
            "default" => Token::Default,
            "try" => Token::Try,
            "catch" => Token::Catch,
            "return" => Token::Return,
            "break" => Token::Break,
            "continue" => Token::Continue,
            "class" => Token::Class,
            "int" => Token::Int,
            "double" => Token::Double,
            "string" => Token::String,
            "bool" => Token::Bool,
            "array" => Token::Array,
            "list" => Token::List,
            "priorityList" => Token::PriorityList,
            "queue" => Token::Queue,
            "void" => Token::Void,
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            "self" => Token::SelfRef,
            _ => return None,
        };
        Some(token)
    }

    pub fn kind(&self) -> TokenKind {
        match self {
            Token::NumberLiteral(_) => TokenKind::Number,
            Token::StringLiteral(_) => TokenKind::String,
            Token::Identifier(_) => TokenKind::Identifier,
            Token::Comment(_) => TokenKind::Comment,
            Token::EOF => TokenKind::EndOfInput,
            Token::EqualEqual | Token::NotEqual | Token::LessEqual | Token::GreaterEqual
            | Token::AndAnd | Token::OrOr | Token::Plus | Token::Minus | Token::Star
            | Token::Slash | Token::Percent | Token::Less | Token::Greater | Token::Assign => {
                TokenKind::Operator
            }
            Token::OpenParen | Token::CloseParen | Token::OpenBrace | Token::CloseBrace
            | Token::OpenBracket | Token::CloseBracket | Token::Semicolon | Token::Comma
            | Token::Dot | Token::Colon => TokenKind::Punctuation,
            _ => TokenKind::Keyword,
        }
    }

    /// Whether this keyword names a declarable type.
    pub fn is_type(&self) -> bool {
        matches!(
            self,
            Token::Int | Token::Double | Token::String | Token::Bool | Token::Array
                | Token::List | Token::PriorityList | Token::Queue | Token::Void
        )
    }

    /// Source text of the token. String literals are re-escaped.
    pub fn text(&self) -> String {
        match self {
            Token::NumberLiteral(n) => format_number(*n),
            Token::StringLiteral(s) => {
                let mut out = String::from("\"");
                for ch in s.chars() {
                    match ch {
                        '"' => out.push_str("\\\""),
                        '\\' => out.push_str("\\\\"),
                        '\n' => out.push_str("\\n"),
                        '\t' => out.push_str("\\t"),
                        '\r' => out.push_str("\\r"),
                        c => out.push(c),
                    }
                }
                out.push('"');
                out
            }
            Token::Identifier(name) => name.clone(),
            Token::Comment(text) => format!("//{}", text),
            Token::EOF => String::new(),
            other => other.fixed_text().to_string(),
        }
    }

    fn fixed_text(&self) -> &'static str {
        match self {
            Token::If => "if",
            Token::Else => "else",
            Token::While => "while",
            Token::For => "for",
            Token::Switch => "switch",
            Token::Case => "case",
            Token::Default => "default",
            Token::Try => "try",
            Token::Catch => "catch",
            Token::Return => "return",
            Token::Break => "break",
            Token::Continue => "continue",
            Token::Class => "class",
            Token::Int => "int",
            Token::Double => "double",
            Token::String => "string",
            Token::Bool => "bool",
            Token::Array => "array",
            Token::List => "list",
            Token::PriorityList => "priorityList",
            Token::Queue => "queue",
            Token::Void => "void",
            Token::True => "true",
            Token::False => "false",
            Token::Null => "null",
            Token::SelfRef => "self",
            Token::OpenParen => "(",
            Token::CloseParen => ")",
            Token::OpenBrace => "{",
            Token::CloseBrace => "}",
            Token::OpenBracket => "[",
            Token::CloseBracket => "]",
            Token::Semicolon => ";",
            Token::Comma => ",",
            Token::Dot => ".",
            Token::Colon => ":",
            _ => OPERATORS
                .iter()
                .find(|(_, tok)| tok == self)
                .map(|(text, _)| *text)
                .unwrap_or(""),
        }
    }
}

pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenInfo {
    pub token: Token,
    pub line: usize,
    pub column: usize,
}

impl TokenInfo {
    pub fn kind(&self) -> TokenKind {
        self.token.kind()
    }
}

pub struct Lexer<'a> {
    input: Peekable<Chars<'a>>,
    line: usize,
    column: usize,
    errors: Vec<Diagnostic>,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Lexer {
            input: input.chars().peekable(),
            line: 1,
            column: 1,
            errors: Vec::new(),
        }
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.input.next();
        if let Some(c) = ch {
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        ch
    }

    fn peek(&mut self) -> Option<&char> {
        self.input.peek()
    }

    fn peek_second(&self) -> Option<char> {
        let mut chars = self.input.clone();
        chars.next();
        chars.next()
    }

    fn skip_whitespace(&mut self) {
        while let Some(&ch) = self.peek() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_comment(&mut self) -> String {
        let mut text = String::new();
        while let Some(&ch) = self.peek() {
            if ch == '\n' {
                break;
            }
            text.push(ch);
            self.advance();
        }
        text
    }

    fn read_string(&mut self, start_line: usize) -> Option<String> {
        let mut result = String::new();
        loop {
            match self.advance() {
                None => {
                    self.errors.push(Diagnostic::new(start_line, "Unterminated string"));
                    return None;
                }
                Some('"') => return Some(result),
                Some('\\') => match self.advance() {
                    Some('n') => result.push('\n'),
                    Some('t') => result.push('\t'),
                    Some('r') => result.push('\r'),
                    Some(other) => result.push(other),
                    None => {
                        self.errors.push(Diagnostic::new(start_line, "Unterminated string"));
                        return None;
                    }
                },
                Some(ch) => result.push(ch),
            }
        }
    }

    fn read_number(&mut self, first: char) -> Token {
        let mut num = String::from(first);
        let mut is_decimal = false;

        while let Some(&ch) = self.peek() {
            if ch.is_ascii_digit() {
                num.push(ch);
                self.advance();
            } else if ch == '.' && !is_decimal {
                // `3.field` is not a decimal; require a digit after the point
                match self.peek_second() {
                    Some(next) if next.is_ascii_digit() => {
                        is_decimal = true;
                        num.push(ch);
                        self.advance();
                    }
                    _ => break,
                }
            } else {
                break;
            }
        }

        Token::NumberLiteral(num.parse().unwrap_or(0.0))
    }

    fn read_word(&mut self, first: char) -> Token {
        let mut word = String::from(first);
        while let Some(&ch) = self.peek() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                word.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        Token::keyword(&word).unwrap_or(Token::Identifier(word))
    }

    fn read_operator(&mut self, first: char) -> Option<Token> {
        let second = self.peek().copied();
        for (text, token) in OPERATORS {
            let mut chars = text.chars();
            if chars.next() != Some(first) {
                continue;
            }
            match chars.next() {
                None => return Some(token.clone()),
                Some(expected) if Some(expected) == second => {
                    self.advance();
                    return Some(token.clone());
                }
                Some(_) => {}
            }
        }
        None
    }

    /// Tokenize the whole input. Lexing never stops early: unknown characters
    /// are reported and skipped.
    pub fn tokenize(mut self) -> (Vec<TokenInfo>, Vec<Diagnostic>) {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace();
            let line = self.line;
            let column = self.column;

            let token = match self.advance() {
                None => Token::EOF,
                Some(ch) => match ch {
                    '/' if self.peek() == Some(&'/') => {
                        self.advance();
                        Token::Comment(self.read_comment())
                    }
                    '"' => match self.read_string(line) {
                        Some(s) => Token::StringLiteral(s),
                        None => continue,
                    },
                    '(' => Token::OpenParen,
                    ')' => Token::CloseParen,
                    '{' => Token::OpenBrace,
                    '}' => Token::CloseBrace,
                    '[' => Token::OpenBracket,
                    ']' => Token::CloseBracket,
                    ';' => Token::Semicolon,
                    ',' => Token::Comma,
                    '.' => Token::Dot,
                    ':' => Token::Colon,
                    c if c.is_ascii_digit() => self.read_number(c),
                    c if c.is_ascii_alphabetic() || c == '_' => self.read_word(c),
                    c => match self.read_operator(c) {
                        Some(op) => op,
                        None => {
                            self.errors.push(Diagnostic::new(
                                line,
                                &format!("Unexpected character: {}", c),
                            ));
                            continue;
                        }
                    },
                },
            };

            let is_eof = token == Token::EOF;
            tokens.push(TokenInfo { token, line, column });

            if is_eof {
                break;
            }
        }

        (tokens, self.errors)
    }
}

/// Re-render a token stream, one output line per source line.
pub fn render_tokens(tokens: &[TokenInfo]) -> String {
    let mut out = String::new();
    let mut current_line = 1;
    let mut line_has_text = false;

    for info in tokens {
        if info.token == Token::EOF {
            break;
        }
        while current_line < info.line {
            out.push('\n');
            current_line += 1;
            line_has_text = false;
        }
        if line_has_text {
            out.push(' ');
        }
        out.push_str(&info.token.text());
        line_has_text = true;
    }

    out
}
