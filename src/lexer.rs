// File: src/lexer.rs
//
// Hand-written scanner for Ardan source. Produces a flat token stream the
// parser consumes. Template literals are scanned into text/expression pieces;
// the parser re-scans the expression pieces.

use ahash::AHashMap;
use once_cell::sync::Lazy;

#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePiece {
    /// Literal text between interpolations
    Text(String),
    /// Raw source of a `${...}` interpolation
    Source(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Identifier(String),
    Keyword(Keyword),
    Number(f64),
    Str(String),
    Template(Vec<TemplatePiece>),

    // Punctuation
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    Semicolon,
    Colon,
    Question,
    Arrow,
    Ellipsis,

    // Operators
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    Percent,
    Ampersand,
    Pipe,
    Caret,
    Tilde,
    ShiftLeft,
    ShiftRight,
    UnsignedShiftRight,
    Bang,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    StarStarAssign,
    SlashAssign,
    PercentAssign,
    ShiftLeftAssign,
    ShiftRightAssign,
    UnsignedShiftRightAssign,
    AmpersandAssign,
    PipeAssign,
    CaretAssign,
    AndAssign,
    OrAssign,
    NullishAssign,
    Equal,
    NotEqual,
    StrictEqual,
    StrictNotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    LogicalAnd,
    LogicalOr,
    Nullish,
    Increment,
    Decrement,

    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Var,
    Let,
    Const,
    Function,
    Class,
    Extends,
    New,
    Return,
    If,
    Else,
    While,
    Do,
    For,
    In,
    Of,
    Break,
    Continue,
    Switch,
    Case,
    Default,
    Try,
    Catch,
    Finally,
    Throw,
    Import,
    Async,
    Await,
    This,
    Super,
    True,
    False,
    Null,
    Undefined,
    TypeOf,
    Void,
    Delete,
    InstanceOf,
    Static,
    Public,
    Private,
    Protected,
}

static KEYWORDS: Lazy<AHashMap<&'static str, Keyword>> = Lazy::new(|| {
    AHashMap::from_iter([
        ("var", Keyword::Var),
        ("let", Keyword::Let),
        ("const", Keyword::Const),
        ("function", Keyword::Function),
        ("class", Keyword::Class),
        ("extends", Keyword::Extends),
        ("new", Keyword::New),
        ("return", Keyword::Return),
        ("if", Keyword::If),
        ("else", Keyword::Else),
        ("while", Keyword::While),
        ("do", Keyword::Do),
        ("for", Keyword::For),
        ("in", Keyword::In),
        ("of", Keyword::Of),
        ("break", Keyword::Break),
        ("continue", Keyword::Continue),
        ("switch", Keyword::Switch),
        ("case", Keyword::Case),
        ("default", Keyword::Default),
        ("try", Keyword::Try),
        ("catch", Keyword::Catch),
        ("finally", Keyword::Finally),
        ("throw", Keyword::Throw),
        ("import", Keyword::Import),
        ("async", Keyword::Async),
        ("await", Keyword::Await),
        ("this", Keyword::This),
        ("super", Keyword::Super),
        ("true", Keyword::True),
        ("false", Keyword::False),
        ("null", Keyword::Null),
        ("undefined", Keyword::Undefined),
        ("typeof", Keyword::TypeOf),
        ("void", Keyword::Void),
        ("delete", Keyword::Delete),
        ("instanceof", Keyword::InstanceOf),
        ("static", Keyword::Static),
        ("public", Keyword::Public),
        ("private", Keyword::Private),
        ("protected", Keyword::Protected),
    ])
});

fn keyword_of(ident: &str) -> Option<Keyword> {
    KEYWORDS.get(ident).copied()
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

struct Scanner<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Scanner<'a> {
    fn new(source: &'a str) -> Self {
        Self { chars: source.chars().peekable(), line: 1, column: 1 }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next();
        match c {
            Some('\n') => {
                self.line += 1;
                self.column = 1;
            }
            Some(_) => self.column += 1,
            None => {}
        }
        c
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn string(&mut self, quote: char) -> String {
        let mut s = String::new();
        while let Some(c) = self.bump() {
            if c == quote {
                break;
            }
            if c == '\\' {
                match self.bump() {
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some('r') => s.push('\r'),
                    Some('0') => s.push('\0'),
                    Some(other) => s.push(other),
                    None => break,
                }
            } else {
                s.push(c);
            }
        }
        s
    }

    /// Scan a backquoted template literal into text and `${...}` pieces.
    fn template(&mut self) -> Vec<TemplatePiece> {
        let mut pieces = Vec::new();
        let mut text = String::new();
        while let Some(c) = self.bump() {
            match c {
                '`' => break,
                '\\' => match self.bump() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some(other) => text.push(other),
                    None => break,
                },
                '$' if self.peek() == Some('{') => {
                    self.bump();
                    pieces.push(TemplatePiece::Text(std::mem::take(&mut text)));
                    let mut depth = 1usize;
                    let mut source = String::new();
                    while let Some(inner) = self.bump() {
                        match inner {
                            '{' => depth += 1,
                            '}' => {
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                            }
                            _ => {}
                        }
                        source.push(inner);
                    }
                    pieces.push(TemplatePiece::Source(source));
                }
                _ => text.push(c),
            }
        }
        pieces.push(TemplatePiece::Text(text));
        pieces
    }
}

pub fn tokenize(source: &str) -> Vec<Token> {
    let mut scanner = Scanner::new(source);
    let mut tokens = Vec::new();

    loop {
        // Skip whitespace and comments
        loop {
            match scanner.peek() {
                Some(c) if c.is_whitespace() => {
                    scanner.bump();
                }
                Some('/') => {
                    let mut lookahead = scanner.chars.clone();
                    lookahead.next();
                    match lookahead.next() {
                        Some('/') => {
                            while let Some(c) = scanner.bump() {
                                if c == '\n' {
                                    break;
                                }
                            }
                        }
                        Some('*') => {
                            scanner.bump();
                            scanner.bump();
                            loop {
                                match scanner.bump() {
                                    Some('*') if scanner.peek() == Some('/') => {
                                        scanner.bump();
                                        break;
                                    }
                                    Some(_) => {}
                                    None => break,
                                }
                            }
                        }
                        _ => break,
                    }
                }
                _ => break,
            }
        }

        let line = scanner.line;
        let column = scanner.column;
        let c = match scanner.bump() {
            Some(c) => c,
            None => {
                tokens.push(Token { kind: TokenKind::Eof, line, column });
                return tokens;
            }
        };

        let kind = match c {
            '(' => TokenKind::LeftParen,
            ')' => TokenKind::RightParen,
            '{' => TokenKind::LeftBrace,
            '}' => TokenKind::RightBrace,
            '[' => TokenKind::LeftBracket,
            ']' => TokenKind::RightBracket,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            ':' => TokenKind::Colon,
            '~' => TokenKind::Tilde,
            '.' => {
                if scanner.peek() == Some('.') {
                    scanner.bump();
                    if scanner.eat('.') {
                        TokenKind::Ellipsis
                    } else {
                        // Lone ".." has no meaning; treat as two dots would be
                        // an error downstream anyway.
                        TokenKind::Dot
                    }
                } else {
                    TokenKind::Dot
                }
            }
            '+' => {
                if scanner.eat('+') {
                    TokenKind::Increment
                } else if scanner.eat('=') {
                    TokenKind::PlusAssign
                } else {
                    TokenKind::Plus
                }
            }
            '-' => {
                if scanner.eat('-') {
                    TokenKind::Decrement
                } else if scanner.eat('=') {
                    TokenKind::MinusAssign
                } else {
                    TokenKind::Minus
                }
            }
            '*' => {
                if scanner.eat('*') {
                    if scanner.eat('=') {
                        TokenKind::StarStarAssign
                    } else {
                        TokenKind::StarStar
                    }
                } else if scanner.eat('=') {
                    TokenKind::StarAssign
                } else {
                    TokenKind::Star
                }
            }
            '/' => {
                if scanner.eat('=') {
                    TokenKind::SlashAssign
                } else {
                    TokenKind::Slash
                }
            }
            '%' => {
                if scanner.eat('=') {
                    TokenKind::PercentAssign
                } else {
                    TokenKind::Percent
                }
            }
            '&' => {
                if scanner.eat('&') {
                    if scanner.eat('=') {
                        TokenKind::AndAssign
                    } else {
                        TokenKind::LogicalAnd
                    }
                } else if scanner.eat('=') {
                    TokenKind::AmpersandAssign
                } else {
                    TokenKind::Ampersand
                }
            }
            '|' => {
                if scanner.eat('|') {
                    if scanner.eat('=') {
                        TokenKind::OrAssign
                    } else {
                        TokenKind::LogicalOr
                    }
                } else if scanner.eat('=') {
                    TokenKind::PipeAssign
                } else {
                    TokenKind::Pipe
                }
            }
            '^' => {
                if scanner.eat('=') {
                    TokenKind::CaretAssign
                } else {
                    TokenKind::Caret
                }
            }
            '?' => {
                if scanner.eat('?') {
                    if scanner.eat('=') {
                        TokenKind::NullishAssign
                    } else {
                        TokenKind::Nullish
                    }
                } else {
                    TokenKind::Question
                }
            }
            '!' => {
                if scanner.eat('=') {
                    if scanner.eat('=') {
                        TokenKind::StrictNotEqual
                    } else {
                        TokenKind::NotEqual
                    }
                } else {
                    TokenKind::Bang
                }
            }
            '=' => {
                if scanner.eat('=') {
                    if scanner.eat('=') {
                        TokenKind::StrictEqual
                    } else {
                        TokenKind::Equal
                    }
                } else if scanner.eat('>') {
                    TokenKind::Arrow
                } else {
                    TokenKind::Assign
                }
            }
            '<' => {
                if scanner.eat('<') {
                    if scanner.eat('=') {
                        TokenKind::ShiftLeftAssign
                    } else {
                        TokenKind::ShiftLeft
                    }
                } else if scanner.eat('=') {
                    TokenKind::LessEqual
                } else {
                    TokenKind::Less
                }
            }
            '>' => {
                if scanner.eat('>') {
                    if scanner.eat('>') {
                        if scanner.eat('=') {
                            TokenKind::UnsignedShiftRightAssign
                        } else {
                            TokenKind::UnsignedShiftRight
                        }
                    } else if scanner.eat('=') {
                        TokenKind::ShiftRightAssign
                    } else {
                        TokenKind::ShiftRight
                    }
                } else if scanner.eat('=') {
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                }
            }
            '"' | '\'' => TokenKind::Str(scanner.string(c)),
            '`' => TokenKind::Template(scanner.template()),
            '0'..='9' => {
                let mut num = String::from(c);
                while let Some(ch) = scanner.peek() {
                    if ch.is_ascii_digit() || ch == '.' || ch == 'e' || ch == 'E' || ch == '_' {
                        if ch != '_' {
                            num.push(ch);
                        }
                        scanner.bump();
                    } else {
                        break;
                    }
                }
                TokenKind::Number(num.parse().unwrap_or(f64::NAN))
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let mut ident = String::from(c);
                while let Some(ch) = scanner.peek() {
                    if ch.is_alphanumeric() || ch == '_' || ch == '$' {
                        ident.push(ch);
                        scanner.bump();
                    } else {
                        break;
                    }
                }
                match keyword_of(&ident) {
                    Some(kw) => TokenKind::Keyword(kw),
                    None => TokenKind::Identifier(ident),
                }
            }
            // Unrecognised characters are skipped; the parser reports the
            // resulting inconsistency with a location.
            _ => continue,
        };

        tokens.push(Token { kind, line, column });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn scans_compound_operators() {
        assert_eq!(
            kinds("a >>>= b ??= c"),
            vec![
                TokenKind::Identifier("a".into()),
                TokenKind::UnsignedShiftRightAssign,
                TokenKind::Identifier("b".into()),
                TokenKind::NullishAssign,
                TokenKind::Identifier("c".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn scans_keywords_and_numbers() {
        assert_eq!(
            kinds("let x = 1.5;"),
            vec![
                TokenKind::Keyword(Keyword::Let),
                TokenKind::Identifier("x".into()),
                TokenKind::Assign,
                TokenKind::Number(1.5),
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn scans_template_pieces() {
        let toks = tokenize("`a${x}b`");
        match &toks[0].kind {
            TokenKind::Template(pieces) => {
                assert_eq!(
                    pieces,
                    &vec![
                        TemplatePiece::Text("a".into()),
                        TemplatePiece::Source("x".into()),
                        TemplatePiece::Text("b".into()),
                    ]
                );
            }
            other => panic!("expected template, got {:?}", other),
        }
    }

    #[test]
    fn line_comments_are_skipped() {
        assert_eq!(
            kinds("x // trailing\ny"),
            vec![
                TokenKind::Identifier("x".into()),
                TokenKind::Identifier("y".into()),
                TokenKind::Eof,
            ]
        );
    }
}
