//! Boolean custom-condition expressions.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! expr    := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | compare
//! compare := primary ( ("==" | "!=") primary )?
//! primary := "(" expr ")" | literal | name | name "(" args ")"
//! ```
//!
//! Names resolve against the variable map (`variables.` prefix optional);
//! unknown names are null. The whole expression may be wrapped in `${{ }}`.

use crate::ports::ExpressionEngine;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("custom condition expression is empty")]
    Empty,

    #[error("invalid expression at {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("unknown function: {0}")]
    UnknownFunction(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Comma,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Str(String),
    Num(f64),
    Name(String),
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let parse_err = |position: usize, message: &str| ExpressionError::Parse {
        position,
        message: message.to_string(),
    };

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        let pair = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '(' => tokens.push((start, Token::LParen)),
            ')' => tokens.push((start, Token::RParen)),
            ',' => tokens.push((start, Token::Comma)),
            '!' if pair == Some('=') => {
                tokens.push((start, Token::Ne));
                i += 1;
            }
            '!' => tokens.push((start, Token::Not)),
            '=' if pair == Some('=') => {
                tokens.push((start, Token::Eq));
                i += 1;
            }
            '&' if pair == Some('&') => {
                tokens.push((start, Token::And));
                i += 1;
            }
            '|' if pair == Some('|') => {
                tokens.push((start, Token::Or));
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(parse_err(start, "unterminated string")),
                        // '' escapes a quote inside a single-quoted string
                        Some(&ch) if ch == quote && chars.get(i + 1) == Some(&quote) => {
                            value.push(quote);
                            i += 2;
                        }
                        Some(&ch) if ch == quote => break,
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push((start, Token::Str(value)));
            }
            c if c.is_ascii_digit() || (c == '-' && pair.is_some_and(|p| p.is_ascii_digit())) => {
                let mut end = i + 1;
                while end < chars.len() && (chars[end].is_ascii_digit() || chars[end] == '.') {
                    end += 1;
                }
                let text: String = chars[i..end].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| parse_err(start, "invalid number"))?;
                tokens.push((start, Token::Num(value)));
                i = end;
                continue;
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut end = i + 1;
                while end < chars.len()
                    && (chars[end].is_alphanumeric() || matches!(chars[end], '_' | '.' | '-'))
                {
                    end += 1;
                }
                tokens.push((start, Token::Name(chars[i..end].iter().collect())));
                i = end;
                continue;
            }
            _ => return Err(parse_err(start, &format!("unexpected character '{c}'"))),
        }
        i += 1;
    }
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty() && s != "false",
        }
    }

    fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Num(n) => n.to_string(),
            Value::Str(s) => s.clone(),
        }
    }

    fn loose_eq(&self, other: &Value) -> bool {
        let (a, b) = (self.render(), other.render());
        match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
            (Ok(x), Ok(y)) => x == y,
            _ => a == b,
        }
    }
}

struct Parser<'a> {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
    vars: &'a HashMap<String, String>,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(p, _)| *p)
    }

    fn error(&self, message: &str) -> ExpressionError {
        ExpressionError::Parse {
            position: self.position(),
            message: message.to_string(),
        }
    }

    fn expect(&mut self, token: Token, message: &str) -> Result<(), ExpressionError> {
        if self.peek() == Some(&token) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(message))
        }
    }

    fn or(&mut self) -> Result<Value, ExpressionError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and()?;
            left = Value::Bool(left.truthy() || right.truthy());
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Value, ExpressionError> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.unary()?;
            left = Value::Bool(left.truthy() && right.truthy());
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Value, ExpressionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Value::Bool(!self.unary()?.truthy()));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Value, ExpressionError> {
        let left = self.primary()?;
        match self.peek() {
            Some(Token::Eq) => {
                self.pos += 1;
                let right = self.primary()?;
                Ok(Value::Bool(left.loose_eq(&right)))
            }
            Some(Token::Ne) => {
                self.pos += 1;
                let right = self.primary()?;
                Ok(Value::Bool(!left.loose_eq(&right)))
            }
            _ => Ok(left),
        }
    }

    fn primary(&mut self) -> Result<Value, ExpressionError> {
        let Some((_, token)) = self.tokens.get(self.pos).cloned() else {
            return Err(self.error("unexpected end of expression"));
        };
        self.pos += 1;
        match token {
            Token::LParen => {
                let value = self.or()?;
                self.expect(Token::RParen, "expected ')'")?;
                Ok(value)
            }
            Token::Str(s) => Ok(Value::Str(s)),
            Token::Num(n) => Ok(Value::Num(n)),
            Token::Name(name) if self.peek() == Some(&Token::LParen) => self.call(&name),
            Token::Name(name) => Ok(match name.as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                "null" => Value::Null,
                _ => {
                    let key = name.strip_prefix("variables.").unwrap_or(&name);
                    self.vars
                        .get(key)
                        .map_or(Value::Null, |v| Value::Str(v.clone()))
                }
            }),
            _ => {
                self.pos -= 1;
                Err(self.error("expected a value"))
            }
        }
    }

    fn call(&mut self, name: &str) -> Result<Value, ExpressionError> {
        self.expect(Token::LParen, "expected '('")?;
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                args.push(self.or()?);
                if self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen, "expected ')'")?;

        let [haystack, needle] = args.as_slice() else {
            return Err(self.error(&format!("{name} takes two arguments")));
        };
        let (h, n) = (haystack.render(), needle.render());
        let result = match name.to_ascii_lowercase().as_str() {
            "contains" => h.contains(&n),
            "startswith" => h.starts_with(&n),
            "endswith" => h.ends_with(&n),
            _ => return Err(ExpressionError::UnknownFunction(name.to_string())),
        };
        Ok(Value::Bool(result))
    }
}

/// Default [`ExpressionEngine`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleExpressionEngine;

impl ExpressionEngine for SimpleExpressionEngine {
    fn evaluate(
        &self,
        expression: &str,
        variables: &HashMap<String, String>,
    ) -> Result<bool, ExpressionError> {
        let trimmed = expression.trim();
        let body = trimmed
            .strip_prefix("${{")
            .and_then(|s| s.strip_suffix("}}"))
            .unwrap_or(trimmed)
            .trim();
        if body.is_empty() {
            return Err(ExpressionError::Empty);
        }

        let tokens = tokenize(body)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: body.len(),
            vars: variables,
        };
        let value = parser.or()?;
        if parser.pos < parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(value.truthy())
    }
}
