//! LDAP-style property filters
//!
//! ```text
//! filter  := '(' body ')'
//! body    := '&' filter+ | '|' filter+ | '!' filter | key '=' value
//! value   := '*'            presence
//!          | chars '*'      prefix
//!          | chars          equality
//! ```
//! `\` escapes `(`, `)`, `*` and `\` in values. An empty filter matches
//! everything. Nesting deeper than [`MAX_FILTER_DEPTH`] is rejected.

use std::fmt;
use std::str::FromStr;

use crate::error::{CdmfError, Result};
use crate::properties::Properties;

/// Deepest accepted nesting of parenthesised filters
pub const MAX_FILTER_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    MatchAll,
    Equal(String, String),
    Prefix(String, String),
    Present(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn parse(input: &str) -> Result<Filter> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(Filter::MatchAll);
        }
        let mut parser = Parser {
            chars: trimmed.chars().collect(),
            pos: 0,
            depth: 0,
        };
        let filter = parser.filter()?;
        parser.skip_ws();
        if parser.pos != parser.chars.len() {
            return Err(parser.error("trailing characters after filter"));
        }
        Ok(filter)
    }

    /// Evaluate against a property map
    ///
    /// Lists match when any element matches; other values compare by their
    /// string form.
    pub fn matches(&self, props: &Properties) -> bool {
        match self {
            Filter::MatchAll => true,
            Filter::Present(key) => props.contains_key(key),
            Filter::Equal(key, value) => props
                .get(key)
                .map(|v| v.match_forms().iter().any(|f| f == value))
                .unwrap_or(false),
            Filter::Prefix(key, prefix) => props
                .get(key)
                .map(|v| v.match_forms().iter().any(|f| f.starts_with(prefix.as_str())))
                .unwrap_or(false),
            Filter::And(items) => items.iter().all(|f| f.matches(props)),
            Filter::Or(items) => items.iter().any(|f| f.matches(props)),
            Filter::Not(inner) => !inner.matches(props),
        }
    }
}

impl FromStr for Filter {
    type Err = CdmfError;

    fn from_str(s: &str) -> Result<Self> {
        Filter::parse(s)
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '(' | ')' | '*' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::MatchAll => Ok(()),
            Filter::Equal(k, v) => write!(f, "({}={})", k, escape(v)),
            Filter::Prefix(k, v) => write!(f, "({}={}*)", k, escape(v)),
            Filter::Present(k) => write!(f, "({}=*)", k),
            Filter::And(items) => {
                f.write_str("(&")?;
                for item in items {
                    write!(f, "{}", item)?;
                }
                f.write_str(")")
            }
            Filter::Or(items) => {
                f.write_str("(|")?;
                for item in items {
                    write!(f, "{}", item)?;
                }
                f.write_str(")")
            }
            Filter::Not(inner) => write!(f, "(!{})", inner),
        }
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn error(&self, msg: &str) -> CdmfError {
        CdmfError::invalid(format!("filter: {} at position {}", msg, self.pos))
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().map(char::is_whitespace).unwrap_or(false) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, c: char) -> Result<()> {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", c)))
        }
    }

    fn filter(&mut self) -> Result<Filter> {
        self.expect('(')?;
        if self.depth == MAX_FILTER_DEPTH {
            return Err(self.error("filter nested too deeply"));
        }
        self.depth += 1;
        let filter = self.body();
        self.depth -= 1;
        filter
    }

    fn body(&mut self) -> Result<Filter> {
        self.skip_ws();
        let filter = match self.peek() {
            Some('&') => {
                self.pos += 1;
                Filter::And(self.list()?)
            }
            Some('|') => {
                self.pos += 1;
                Filter::Or(self.list()?)
            }
            Some('!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.filter()?))
            }
            Some(_) => self.item()?,
            None => return Err(self.error("unexpected end of filter")),
        };
        self.expect(')')?;
        Ok(filter)
    }

    fn list(&mut self) -> Result<Vec<Filter>> {
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() != Some('(') {
                break;
            }
            items.push(self.filter()?);
        }
        if items.is_empty() {
            return Err(self.error("combinator needs at least one operand"));
        }
        Ok(items)
    }

    fn item(&mut self) -> Result<Filter> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            match c {
                '=' => break,
                '(' | ')' | '*' | '\\' => return Err(self.error("invalid character in key")),
                _ => self.pos += 1,
            }
        }
        let key: String = self.chars[start..self.pos].iter().collect();
        let key = key.trim().to_string();
        if key.is_empty() {
            return Err(self.error("empty key"));
        }
        self.expect('=')?;

        let mut value = String::new();
        let mut trailing_star = false;
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated value")),
                Some(')') => break,
                Some('(') => return Err(self.error("unescaped '(' in value")),
                Some('\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(c) => {
                            if trailing_star {
                                return Err(self.error("'*' is only allowed at the end"));
                            }
                            value.push(c);
                            self.pos += 1;
                        }
                        None => return Err(self.error("dangling escape")),
                    }
                }
                Some('*') => {
                    if trailing_star {
                        return Err(self.error("'*' is only allowed at the end"));
                    }
                    trailing_star = true;
                    self.pos += 1;
                }
                Some(c) => {
                    if trailing_star {
                        return Err(self.error("'*' is only allowed at the end"));
                    }
                    value.push(c);
                    self.pos += 1;
                }
            }
        }

        Ok(match (trailing_star, value.is_empty()) {
            (true, true) => Filter::Present(key),
            (true, false) => Filter::Prefix(key, value),
            (false, _) => Filter::Equal(key, value),
        })
    }
}
