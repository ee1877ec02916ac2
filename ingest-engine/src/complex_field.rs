//! Parser for array-valued CSV cells written by primitives, e.g.
//! `['integer', "categorical"]` or `[[0.9, 0.1], [1.0]]`.

use std::fmt;

use crate::error::{IngestError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum ComplexField {
    /// Unquoted token such as a number.
    Scalar(String),
    /// Quoted string; the quote character is kept so literals round-trip.
    Quoted { value: String, quote: char },
    Array(Vec<ComplexField>),
}

impl ComplexField {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ComplexField::Scalar(value) | ComplexField::Quoted { value, .. } => Some(value),
            ComplexField::Array(_) => None,
        }
    }

    pub fn to_literal(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ComplexField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComplexField::Scalar(value) => write!(f, "{}", value),
            ComplexField::Quoted { value, quote } => {
                write!(f, "{}", quote)?;
                for c in value.chars() {
                    if c == *quote || c == '\\' {
                        write!(f, "\\")?;
                    }
                    write!(f, "{}", c)?;
                }
                write!(f, "{}", quote)
            }
            ComplexField::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

pub fn parse(input: &str) -> Result<ComplexField> {
    let mut parser = Parser {
        chars: input.chars().collect(),
        pos: 0,
    };
    let field = parser.value()?;
    parser.skip_whitespace();
    if parser.pos != parser.chars.len() {
        return Err(parser.error("trailing characters"));
    }
    Ok(field)
}

/// Parses a one-level array of strings.
pub fn parse_string_array(input: &str) -> Result<Vec<String>> {
    match parse(input)? {
        ComplexField::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    IngestError::csv(format!("nested array where string expected in '{}'", input))
                })
            })
            .collect(),
        scalar => Ok(vec![scalar.as_str().unwrap_or_default().to_string()]),
    }
}

/// Parses a one-level array of numbers.
pub fn parse_float_array(input: &str) -> Result<Vec<f64>> {
    parse_string_array(input)?
        .iter()
        .map(|value| {
            value
                .trim()
                .parse::<f64>()
                .map_err(|_| IngestError::csv(format!("'{}' is not a number in '{}'", value, input)))
        })
        .collect()
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn error(&self, message: &str) -> IngestError {
        IngestError::csv(format!(
            "complex field: {} at position {} in '{}'",
            message,
            self.pos,
            self.chars.iter().collect::<String>()
        ))
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn value(&mut self) -> Result<ComplexField> {
        self.skip_whitespace();
        match self.peek() {
            Some('[') => self.array(),
            Some(q @ ('\'' | '"')) => self.quoted(q),
            Some(_) => self.scalar(),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn array(&mut self) -> Result<ComplexField> {
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(']') => {
                    self.pos += 1;
                    return Ok(ComplexField::Array(items));
                }
                None => return Err(self.error("unterminated array")),
                _ => {}
            }
            items.push(self.value()?);
            self.skip_whitespace();
            match self.peek() {
                Some(',') => self.pos += 1,
                Some(']') => {}
                Some(_) => return Err(self.error("expected ',' or ']'")),
                None => return Err(self.error("unterminated array")),
            }
        }
    }

    fn quoted(&mut self, quote: char) -> Result<ComplexField> {
        self.pos += 1;
        let mut value = String::new();
        loop {
            match self.peek() {
                Some('\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(c) => value.push(c),
                        None => return Err(self.error("dangling escape")),
                    }
                    self.pos += 1;
                }
                Some(c) if c == quote => {
                    self.pos += 1;
                    return Ok(ComplexField::Quoted { value, quote });
                }
                Some(c) => {
                    value.push(c);
                    self.pos += 1;
                }
                None => return Err(self.error("unterminated string")),
            }
        }
    }

    fn scalar(&mut self) -> Result<ComplexField> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c != ',' && c != ']' && c != '[') {
            self.pos += 1;
        }
        let token: String = self.chars[start..self.pos].iter().collect();
        let token = token.trim();
        if token.is_empty() {
            return Err(self.error("empty element"));
        }
        Ok(ComplexField::Scalar(token.to_string()))
    }
}
