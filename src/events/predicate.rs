//! Predicate expressions over event payload fields.
//!
//! ```text
//! intent = "request" and not (body ~ "^wip")
//! targets contains "alpha" or relay.device exists
//! ```

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("Unexpected character '{0}' at {1}")]
    UnexpectedChar(char, usize),
    #[error("Unterminated string literal")]
    UnterminatedString,
    #[error("Expected {expected}, found {found}")]
    Expected { expected: String, found: String },
    #[error("Invalid regex: {0}")]
    InvalidRegex(String),
    #[error("Trailing input after expression: {0}")]
    Trailing(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

/// A parsed predicate.
#[derive(Debug, Clone)]
pub enum Predicate {
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
    Compare {
        path: Vec<String>,
        op: CompareOp,
        value: Value,
    },
    Matches {
        path: Vec<String>,
        regex: Regex,
    },
    Exists(Vec<String>),
}

impl Predicate {
    /// Parse an expression.
    pub fn parse(source: &str) -> Result<Self, FilterError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(FilterError::Trailing(tok.describe()));
        }
        Ok(expr)
    }

    /// Evaluate against a payload.
    pub fn eval(&self, payload: &Value) -> bool {
        match self {
            Predicate::And(a, b) => a.eval(payload) && b.eval(payload),
            Predicate::Or(a, b) => a.eval(payload) || b.eval(payload),
            Predicate::Not(inner) => !inner.eval(payload),
            Predicate::Exists(path) => lookup(payload, path).is_some_and(|v| !v.is_null()),
            Predicate::Matches { path, regex } => lookup(payload, path)
                .and_then(Value::as_str)
                .is_some_and(|s| regex.is_match(s)),
            Predicate::Compare { path, op, value } => match lookup(payload, path) {
                Some(actual) => compare(actual, *op, value),
                None => *op == CompareOp::Ne,
            },
        }
    }
}

fn lookup<'a>(payload: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(payload, |value, key| match value {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn compare(actual: &Value, op: CompareOp, expected: &Value) -> bool {
    use std::cmp::Ordering;

    let ordering = || -> Option<Ordering> {
        match (actual, expected) {
            (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    };

    match op {
        CompareOp::Eq => values_equal(actual, expected),
        CompareOp::Ne => !values_equal(actual, expected),
        CompareOp::Gt => ordering() == Some(Ordering::Greater),
        CompareOp::Ge => matches!(ordering(), Some(Ordering::Greater | Ordering::Equal)),
        CompareOp::Lt => ordering() == Some(Ordering::Less),
        CompareOp::Le => matches!(ordering(), Some(Ordering::Less | Ordering::Equal)),
        CompareOp::Contains => match (actual, expected) {
            (Value::Array(items), _) => items.iter().any(|item| values_equal(item, expected)),
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            _ => false,
        },
    }
}

// =========================================================================
// Tokenizer
// =========================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Op(&'static str),
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) => format!("'{}'", s),
            Token::Str(s) => format!("\"{}\"", s),
            Token::Num(n) => n.to_string(),
            Token::Op(op) => format!("'{}'", op),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
        }
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(self, Token::Ident(s) if s.eq_ignore_ascii_case(word))
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, FilterError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            quote @ ('"' | '\'') => {
                let mut literal = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(FilterError::UnterminatedString),
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some(escaped) => literal.push(*escaped),
                                None => return Err(FilterError::UnterminatedString),
                            }
                            i += 2;
                        }
                        Some(ch) => {
                            literal.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(literal));
            }
            '=' => {
                tokens.push(Token::Op("="));
                i += if chars.get(i + 1) == Some(&'=') { 2 } else { 1 };
            }
            '~' => {
                tokens.push(Token::Op("~"));
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op("!="));
                i += 2;
            }
            '>' | '<' => {
                let eq = chars.get(i + 1) == Some(&'=');
                tokens.push(Token::Op(match (c, eq) {
                    ('>', true) => ">=",
                    ('>', false) => ">",
                    ('<', true) => "<=",
                    _ => "<",
                }));
                i += if eq { 2 } else { 1 };
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| FilterError::UnexpectedChar(c, start))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_alphanumeric() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '-' | '.' | '$'))
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(FilterError::UnexpectedChar(other, i)),
        }
    }

    Ok(tokens)
}

// =========================================================================
// Parser
// =========================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn found(&self) -> String {
        self.peek()
            .map(Token::describe)
            .unwrap_or_else(|| "end of input".to_string())
    }

    fn parse_or(&mut self) -> Result<Predicate, FilterError> {
        let mut left = self.parse_and()?;
        while self.peek().is_some_and(|t| t.is_keyword("or")) {
            self.advance();
            let right = self.parse_and()?;
            left = Predicate::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Predicate, FilterError> {
        let mut left = self.parse_unary()?;
        while self.peek().is_some_and(|t| t.is_keyword("and")) {
            self.advance();
            let right = self.parse_unary()?;
            left = Predicate::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Predicate, FilterError> {
        match self.peek() {
            Some(t) if t.is_keyword("not") => {
                self.advance();
                Ok(Predicate::Not(Box::new(self.parse_unary()?)))
            }
            Some(Token::LParen) => {
                self.advance();
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(FilterError::Expected {
                        expected: "')'".to_string(),
                        found: self.found(),
                    }),
                }
            }
            _ => self.parse_comparison(),
        }
    }

    fn parse_comparison(&mut self) -> Result<Predicate, FilterError> {
        let path = match self.advance() {
            Some(Token::Ident(name)) => name.split('.').map(str::to_string).collect::<Vec<_>>(),
            other => {
                return Err(FilterError::Expected {
                    expected: "field name".to_string(),
                    found: other
                        .map(|t| t.describe())
                        .unwrap_or_else(|| "end of input".to_string()),
                })
            }
        };

        let op = match self.advance() {
            Some(Token::Op(op)) => op,
            Some(t) if t.is_keyword("exists") => return Ok(Predicate::Exists(path)),
            Some(t) if t.is_keyword("contains") => "contains",
            other => {
                return Err(FilterError::Expected {
                    expected: "operator".to_string(),
                    found: other
                        .map(|t| t.describe())
                        .unwrap_or_else(|| "end of input".to_string()),
                })
            }
        };

        let value = match self.advance() {
            Some(Token::Str(s)) => Value::String(s),
            Some(Token::Num(n)) => serde_json::Number::from_f64(n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Some(t) if t.is_keyword("true") => Value::Bool(true),
            Some(t) if t.is_keyword("false") => Value::Bool(false),
            Some(t) if t.is_keyword("null") => Value::Null,
            other => {
                return Err(FilterError::Expected {
                    expected: "literal".to_string(),
                    found: other
                        .map(|t| t.describe())
                        .unwrap_or_else(|| "end of input".to_string()),
                })
            }
        };

        if op == "~" {
            let pattern = value.as_str().ok_or_else(|| FilterError::Expected {
                expected: "string pattern after '~'".to_string(),
                found: value.to_string(),
            })?;
            let regex = Regex::new(pattern).map_err(|e| FilterError::InvalidRegex(e.to_string()))?;
            return Ok(Predicate::Matches { path, regex });
        }

        let op = match op {
            "=" => CompareOp::Eq,
            "!=" => CompareOp::Ne,
            ">" => CompareOp::Gt,
            ">=" => CompareOp::Ge,
            "<" => CompareOp::Lt,
            "<=" => CompareOp::Le,
            _ => CompareOp::Contains,
        };
        Ok(Predicate::Compare { path, op, value })
    }
}
