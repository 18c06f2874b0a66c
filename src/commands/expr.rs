//! Arithmetic for the "quanto é ..." command.
//!
//! A small recursive-descent parser over `+ - * / % ^`, parentheses and unary
//! signs. Spoken operators ("mais", "vezes", "dividido por", ...) and the
//! Brazilian decimal comma are rewritten before tokenizing. Nothing is ever
//! handed to an evaluator: anything outside this grammar is an error.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ExprError {
    #[error("empty expression")]
    Empty,
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),
    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),
    #[error("expression ended unexpectedly")]
    UnexpectedEnd,
    #[error("division by zero")]
    DivisionByZero,
    #[error("result is not a finite number")]
    NotFinite,
    #[error("expression is too long")]
    TooLong,
    #[error("expression is nested too deeply")]
    TooDeep,
}

/// Longest input accepted, in characters.
pub const MAX_EXPRESSION_CHARS: usize = 256;

/// Bound on parser recursion: parentheses, unary signs and `^` chains.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Num(f64),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Num(n) => n.to_string(),
            Token::Plus => "+".into(),
            Token::Minus => "-".into(),
            Token::Star => "*".into(),
            Token::Slash => "/".into(),
            Token::Percent => "%".into(),
            Token::Caret => "^".into(),
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),
        }
    }
}

const SPOKEN_OPERATORS: &[(&str, &str)] = &[
    ("multiplicado por", "*"),
    ("dividido por", "/"),
    ("divido por", "/"),
    ("elevado ao", "^"),
    ("elevado a", "^"),
    ("mais", "+"),
    ("menos", "-"),
    ("vezes", "*"),
    ("x", "*"),
    ("×", "*"),
    ("÷", "/"),
    ("mod", "%"),
];

/// Rewrites spoken Portuguese operators into symbols, word by word.
pub fn rewrite_spoken(input: &str) -> String {
    let lower = input.to_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();
    let mut out: Vec<String> = Vec::with_capacity(words.len());
    let mut i = 0;

    'outer: while i < words.len() {
        for (phrase, symbol) in SPOKEN_OPERATORS {
            let parts: Vec<&str> = phrase.split(' ').collect();
            if i + parts.len() <= words.len() && words[i..i + parts.len()] == parts[..] {
                out.push(symbol.to_string());
                i += parts.len();
                continue 'outer;
            }
        }
        out.push(words[i].to_string());
        i += 1;
    }

    out.join(" ")
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || ((c == '.' || c == ',') && chars.get(i + 1).map_or(false, |n| n.is_ascii_digit())) {
            let start = i;
            let mut seen_separator = false;
            while i < chars.len() {
                let d = chars[i];
                if d.is_ascii_digit() {
                    i += 1;
                } else if (d == '.' || d == ',') && !seen_separator && chars.get(i + 1).map_or(false, |n| n.is_ascii_digit()) {
                    seen_separator = true;
                    i += 1;
                } else {
                    break;
                }
            }
            let literal: String = chars[start..i].iter().map(|&ch| if ch == ',' { '.' } else { ch }).collect();
            let value = literal.parse::<f64>().map_err(|_| ExprError::UnexpectedToken(literal.clone()))?;
            tokens.push(Token::Num(value));
            continue;
        }
        let token = match c {
            '+' => Token::Plus,
            '-' | '−' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '^' => Token::Caret,
            '(' => Token::LParen,
            ')' => Token::RParen,
            other => {
                return Err(ExprError::UnexpectedChar(other));
            }
        };
        tokens.push(token);
        i += 1;
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn descend(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::TooDeep);
        }
        Ok(())
    }

    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.peek();
        self.pos += 1;
        token
    }

    fn expression(&mut self) -> Result<f64, ExprError> {
        let mut value = self.term()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Plus => {
                    self.pos += 1;
                    value += self.term()?;
                }
                Token::Minus => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, ExprError> {
        let mut value = self.power()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Star => {
                    self.pos += 1;
                    value *= self.power()?;
                }
                Token::Slash | Token::Percent => {
                    self.pos += 1;
                    let rhs = self.power()?;
                    if rhs == 0.0 {
                        return Err(ExprError::DivisionByZero);
                    }
                    value = if op == Token::Slash { value / rhs } else { value % rhs };
                }
                _ => break,
            }
        }
        Ok(value)
    }

    // Right associative: 2^3^2 == 2^(3^2).
    fn power(&mut self) -> Result<f64, ExprError> {
        self.descend()?;
        let base = self.unary()?;
        let value = if self.peek() == Some(Token::Caret) {
            self.pos += 1;
            base.powf(self.power()?)
        } else {
            base
        };
        self.depth -= 1;
        Ok(value)
    }

    fn unary(&mut self) -> Result<f64, ExprError> {
        self.descend()?;
        let value = match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                -self.unary()?
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()?
            }
            _ => self.primary()?,
        };
        self.depth -= 1;
        Ok(value)
    }

    fn primary(&mut self) -> Result<f64, ExprError> {
        match self.next() {
            Some(Token::Num(n)) => Ok(n),
            Some(Token::LParen) => {
                let value = self.expression()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    Some(other) => Err(ExprError::UnexpectedToken(other.describe())),
                    None => Err(ExprError::UnexpectedEnd),
                }
            }
            Some(other) => Err(ExprError::UnexpectedToken(other.describe())),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

/// Evaluates an arithmetic expression, spoken or symbolic.
pub fn evaluate(input: &str) -> Result<f64, ExprError> {
    if input.chars().count() > MAX_EXPRESSION_CHARS {
        return Err(ExprError::TooLong);
    }
    let rewritten = rewrite_spoken(input);
    let tokens = tokenize(&rewritten)?;
    if tokens.is_empty() {
        return Err(ExprError::Empty);
    }

    let mut parser = Parser { tokens, pos: 0, depth: 0 };
    let value = parser.expression()?;
    if let Some(extra) = parser.peek() {
        return Err(ExprError::UnexpectedToken(extra.describe()));
    }
    if !value.is_finite() {
        return Err(ExprError::NotFinite);
    }
    Ok(value)
}

/// Formats a result the Brazilian way: integers plain, decimals with a comma.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        return format!("{}", value as i64);
    }
    let fixed = format!("{:.6}", value);
    let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
    trimmed.replace('.', ",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respects_precedence_and_parentheses() {
        assert_eq!(evaluate("2 + 3 * 4"), Ok(14.0));
        assert_eq!(evaluate("(2 + 3) * 4"), Ok(20.0));
        assert_eq!(evaluate("2 ^ 3 ^ 2"), Ok(512.0));
        assert_eq!(evaluate("-3 + 5"), Ok(2.0));
        assert_eq!(evaluate("10 % 4"), Ok(2.0));
    }

    #[test]
    fn understands_spoken_operators_and_decimal_comma() {
        assert_eq!(evaluate("2 mais 3 vezes 4"), Ok(14.0));
        assert_eq!(evaluate("10 dividido por 4"), Ok(2.5));
        assert_eq!(evaluate("7 x 6"), Ok(42.0));
        assert_eq!(evaluate("2,5 multiplicado por 2"), Ok(5.0));
        assert_eq!(evaluate("2 elevado a 10"), Ok(1024.0));
        assert_eq!(evaluate("100 menos 1"), Ok(99.0));
    }

    #[test]
    fn rejects_anything_that_is_not_arithmetic() {
        assert_eq!(evaluate(""), Err(ExprError::Empty));
        assert_eq!(evaluate("alert(1)"), Err(ExprError::UnexpectedChar('a')));
        assert_eq!(evaluate("2 +"), Err(ExprError::UnexpectedEnd));
        assert_eq!(evaluate("(1 + 2"), Err(ExprError::UnexpectedEnd));
        assert_eq!(evaluate("1 2"), Err(ExprError::UnexpectedToken("2".into())));
        assert_eq!(evaluate("5 / 0"), Err(ExprError::DivisionByZero));
    }

    #[test]
    fn bounds_nesting_and_length() {
        assert_eq!(evaluate("((((1 + 2))))"), Ok(3.0));
        assert_eq!(evaluate("- - 4"), Ok(4.0));

        let deep = format!("{}1{}", "(".repeat(10_000), ")".repeat(10_000));
        assert_eq!(evaluate(&deep), Err(ExprError::TooLong));

        let nested = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(evaluate(&nested), Err(ExprError::TooDeep));
        assert_eq!(evaluate(&format!("{}1", "-".repeat(200))), Err(ExprError::TooDeep));
        assert_eq!(evaluate(&format!("2{}", "^2".repeat(100))), Err(ExprError::TooDeep));
    }

    #[test]
    fn formats_results_for_speech() {
        assert_eq!(format_number(14.0), "14");
        assert_eq!(format_number(2.5), "2,5");
        assert_eq!(format_number(1.0 / 3.0), "0,333333");
        assert_eq!(format_number(-4.0), "-4");
    }
}
