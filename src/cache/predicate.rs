//! Ban predicates.
//!
//! A ban pattern such as `obj.status != 0 && req.url ~ "^/news"` is parsed once
//! into a [`BanPredicate`] and then evaluated against the metadata of every
//! stored entry. Parsing rejects malformed input up front so a bad pattern
//! never removes anything.
//!
//! Grammar:
//!
//! ```text
//! expr    := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | "(" expr ")" | compare
//! compare := field op literal
//! op      := "==" | "!=" | "<" | "<=" | ">" | ">=" | "~"
//! literal := integer | "quoted" | bare-word
//! ```

use std::fmt;
use std::str::FromStr;

use regex_lite::Regex;
use thiserror::Error;

use super::store::EntryMetadata;

/// Deepest run of `!` and `(` a pattern may nest.
pub const MAX_NESTING: usize = 64;

/// Malformed ban pattern.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PredicateError {
    #[error("ban pattern is empty")]
    Empty,
    #[error("unexpected `{found}` at offset {offset}")]
    Unexpected { found: String, offset: usize },
    #[error("ban pattern ends early, expected {expected}")]
    UnexpectedEnd { expected: &'static str },
    #[error("unterminated string starting at offset {offset}")]
    UnterminatedString { offset: usize },
    #[error("invalid number `{literal}`")]
    InvalidNumber { literal: String },
    #[error("invalid regular expression `{pattern}`: {reason}")]
    InvalidRegex { pattern: String, reason: String },
    #[error("ban pattern nests deeper than {max} levels at offset {offset}", max = MAX_NESTING)]
    TooDeep { offset: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Matches,
}

impl CompareOp {
    fn as_str(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Matches => "~",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Literal {
    Int(i64),
    Text(String),
    Pattern(Regex),
}

#[derive(Debug, Clone)]
pub enum Expr {
    Compare {
        tag: String,
        op: CompareOp,
        literal: Literal,
    },
    Not(Box<Expr>),
    All(Vec<Expr>),
    Any(Vec<Expr>),
}

impl Expr {
    fn eval(&self, metadata: &EntryMetadata) -> bool {
        match self {
            Expr::Compare { tag, op, literal } => match metadata.get(tag) {
                Some(value) => compare(value, *op, literal),
                None => false,
            },
            Expr::Not(inner) => !inner.eval(metadata),
            Expr::All(terms) => terms.iter().all(|term| term.eval(metadata)),
            Expr::Any(terms) => terms.iter().any(|term| term.eval(metadata)),
        }
    }
}

fn compare(value: &str, op: CompareOp, literal: &Literal) -> bool {
    match literal {
        Literal::Pattern(regex) => regex.is_match(value),
        Literal::Int(expected) => match value.trim().parse::<i64>() {
            Ok(actual) => ordered(actual.cmp(expected), op),
            Err(_) => match op {
                CompareOp::Eq => value == expected.to_string(),
                CompareOp::Ne => value != expected.to_string(),
                _ => false,
            },
        },
        Literal::Text(expected) => ordered(value.cmp(expected.as_str()), op),
    }
}

fn ordered(ordering: std::cmp::Ordering, op: CompareOp) -> bool {
    use std::cmp::Ordering::{Equal, Greater, Less};
    match op {
        CompareOp::Eq => ordering == Equal,
        CompareOp::Ne => ordering != Equal,
        CompareOp::Lt => ordering == Less,
        CompareOp::Le => ordering != Greater,
        CompareOp::Gt => ordering == Greater,
        CompareOp::Ge => ordering != Less,
        CompareOp::Matches => false,
    }
}

/// A parsed ban pattern.
#[derive(Debug, Clone)]
pub struct BanPredicate {
    source: String,
    expr: Expr,
}

impl BanPredicate {
    pub fn parse(source: &str) -> Result<Self, PredicateError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(PredicateError::Empty);
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.expr()?;
        if let Some(token) = parser.peek() {
            return Err(PredicateError::Unexpected {
                found: token.kind.to_string(),
                offset: token.offset,
            });
        }
        Ok(Self {
            source: source.trim().to_string(),
            expr,
        })
    }

    /// The pattern as it was received, trimmed.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, metadata: &EntryMetadata) -> bool {
        self.expr.eval(metadata)
    }
}

impl FromStr for BanPredicate {
    type Err = PredicateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BanPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Map a field reference onto the metadata tag it reads.
fn field_tag(field: &str) -> String {
    let lower = field.to_ascii_lowercase();
    if let Some(header) = lower
        .strip_prefix("obj.http.")
        .or_else(|| lower.strip_prefix("req.http."))
    {
        return format!("http.{header}");
    }
    match lower.as_str() {
        "obj.status" | "resp.status" => "status".to_string(),
        "req.url" | "obj.url" => "url".to_string(),
        _ => lower,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Word(String),
    Quoted(String),
    Op(CompareOp),
    And,
    Or,
    Not,
    Open,
    Close,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Word(word) => f.write_str(word),
            TokenKind::Quoted(text) => write!(f, "\"{text}\""),
            TokenKind::Op(op) => f.write_str(op.as_str()),
            TokenKind::And => f.write_str("&&"),
            TokenKind::Or => f.write_str("||"),
            TokenKind::Not => f.write_str("!"),
            TokenKind::Open => f.write_str("("),
            TokenKind::Close => f.write_str(")"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(source: &str) -> Result<Vec<Token>, PredicateError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let offset = pos;
        let next = bytes.get(pos + 1).copied();
        let (kind, width) = match bytes[pos] {
            b' ' | b'\t' | b'\r' | b'\n' => {
                pos += 1;
                continue;
            }
            b'(' => (TokenKind::Open, 1),
            b')' => (TokenKind::Close, 1),
            b'~' => (TokenKind::Op(CompareOp::Matches), 1),
            b'&' if next == Some(b'&') => (TokenKind::And, 2),
            b'|' if next == Some(b'|') => (TokenKind::Or, 2),
            b'=' if next == Some(b'=') => (TokenKind::Op(CompareOp::Eq), 2),
            b'!' if next == Some(b'=') => (TokenKind::Op(CompareOp::Ne), 2),
            b'!' => (TokenKind::Not, 1),
            b'<' if next == Some(b'=') => (TokenKind::Op(CompareOp::Le), 2),
            b'<' => (TokenKind::Op(CompareOp::Lt), 1),
            b'>' if next == Some(b'=') => (TokenKind::Op(CompareOp::Ge), 2),
            b'>' => (TokenKind::Op(CompareOp::Gt), 1),
            quote @ (b'"' | b'\'') => {
                let (text, width) = quoted(source, pos, quote)?;
                (TokenKind::Quoted(text), width)
            }
            _ => {
                let end = source[pos..]
                    .find(|c: char| c.is_whitespace() || "()~&|=!<>\"'".contains(c))
                    .map_or(source.len(), |rel| pos + rel);
                if end == pos {
                    let found = source[pos..].chars().next().map(String::from);
                    return Err(PredicateError::Unexpected {
                        found: found.unwrap_or_default(),
                        offset,
                    });
                }
                (TokenKind::Word(source[pos..end].to_string()), end - pos)
            }
        };
        tokens.push(Token { kind, offset });
        pos += width;
    }

    Ok(tokens)
}

/// Read a quoted literal, honouring backslash escapes of the quote and of
/// backslash itself. Returns the text and the consumed width.
fn quoted(source: &str, start: usize, quote: u8) -> Result<(String, usize), PredicateError> {
    let mut text = String::new();
    let mut chars = source[start + 1..].char_indices();
    while let Some((idx, ch)) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some((_, escaped)) if escaped as u32 == quote as u32 || escaped == '\\' => {
                    text.push(escaped);
                }
                Some((_, other)) => {
                    text.push('\\');
                    text.push(other);
                }
                None => break,
            },
            c if c as u32 == quote as u32 => return Ok((text, idx + 2)),
            c => text.push(c),
        }
    }
    Err(PredicateError::UnterminatedString { offset: start })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Open `!` and `(` levels at the current position.
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self, expected: &'static str) -> Result<Token, PredicateError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(PredicateError::UnexpectedEnd { expected })?;
        self.pos += 1;
        Ok(token)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek().is_some_and(|token| &token.kind == kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expr(&mut self) -> Result<Expr, PredicateError> {
        let mut terms = vec![self.and()?];
        while self.eat(&TokenKind::Or) {
            terms.push(self.and()?);
        }
        Ok(flatten(terms, Expr::Any))
    }

    fn and(&mut self) -> Result<Expr, PredicateError> {
        let mut terms = vec![self.unary()?];
        while self.eat(&TokenKind::And) {
            terms.push(self.unary()?);
        }
        Ok(flatten(terms, Expr::All))
    }

    fn unary(&mut self) -> Result<Expr, PredicateError> {
        let Some(token) = self.peek() else {
            return self.compare();
        };
        let (kind, offset) = (token.kind.clone(), token.offset);
        if kind != TokenKind::Not && kind != TokenKind::Open {
            return self.compare();
        }

        if self.depth == MAX_NESTING {
            return Err(PredicateError::TooDeep { offset });
        }
        self.pos += 1;
        self.depth += 1;
        let nested = if kind == TokenKind::Not {
            self.unary().map(|inner| Expr::Not(Box::new(inner)))
        } else {
            self.group()
        };
        self.depth -= 1;
        nested
    }

    fn group(&mut self) -> Result<Expr, PredicateError> {
        let inner = self.expr()?;
        let close = self.advance("`)`")?;
        if close.kind != TokenKind::Close {
            return Err(PredicateError::Unexpected {
                found: close.kind.to_string(),
                offset: close.offset,
            });
        }
        Ok(inner)
    }

    fn compare(&mut self) -> Result<Expr, PredicateError> {
        let field = self.advance("a field name")?;
        let TokenKind::Word(field_name) = field.kind else {
            return Err(PredicateError::Unexpected {
                found: field.kind.to_string(),
                offset: field.offset,
            });
        };

        let op_token = self.advance("a comparison operator")?;
        let TokenKind::Op(op) = op_token.kind else {
            return Err(PredicateError::Unexpected {
                found: op_token.kind.to_string(),
                offset: op_token.offset,
            });
        };

        let value = self.advance("a value")?;
        let literal = match (op, value.kind) {
            (CompareOp::Matches, TokenKind::Word(text) | TokenKind::Quoted(text)) => {
                let regex = Regex::new(&text).map_err(|err| PredicateError::InvalidRegex {
                    pattern: text.clone(),
                    reason: err.to_string(),
                })?;
                Literal::Pattern(regex)
            }
            (_, TokenKind::Quoted(text)) => Literal::Text(text),
            (_, TokenKind::Word(word)) => parse_word(word)?,
            (_, other) => {
                return Err(PredicateError::Unexpected {
                    found: other.to_string(),
                    offset: value.offset,
                });
            }
        };

        Ok(Expr::Compare {
            tag: field_tag(&field_name),
            op,
            literal,
        })
    }
}

fn flatten(mut terms: Vec<Expr>, combine: fn(Vec<Expr>) -> Expr) -> Expr {
    if terms.len() == 1 {
        terms.remove(0)
    } else {
        combine(terms)
    }
}

fn parse_word(word: String) -> Result<Literal, PredicateError> {
    let looks_numeric = word
        .strip_prefix('-')
        .unwrap_or(&word)
        .starts_with(|c: char| c.is_ascii_digit());
    if !looks_numeric {
        return Ok(Literal::Text(word));
    }
    word.parse::<i64>()
        .map(Literal::Int)
        .map_err(|_| PredicateError::InvalidNumber { literal: word })
}
