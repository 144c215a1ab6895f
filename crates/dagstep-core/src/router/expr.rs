//! Route expressions such as `@exitCode == 0 && @value != 'skip'`.
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! or         := and ( "||" and )*
//! and        := comparison ( "&&" comparison )*
//! comparison := primary ( ( "==" | "!=" | ">" | "<" | ">=" | "<=" ) primary )?
//! primary    := string | number | "@value" | "@exitCode" | "(" or ")"
//! ```
//!
//! Operands are strings. Comparisons are numeric when both sides parse as
//! numbers, lexicographic otherwise. A lone operand is true when non-empty.
//! Nothing here executes code; the evaluator only parses and compares.

use thiserror::Error;

const MAX_EXPRESSION_LEN: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ExprError(String);

impl ExprError {
    fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

type ExprResult<T> = std::result::Result<T, ExprError>;

/// Values an expression can reference.
#[derive(Debug, Clone, Copy)]
pub struct ExprContext<'a> {
    pub value: &'a str,
    pub exit_code: i32,
}

/// Does `pattern` look like an expression rather than a literal?
pub fn is_expression(pattern: &str) -> bool {
    ["==", "!=", "&&", "||", ">=", "<=", "@value", "@exitCode"]
        .iter()
        .any(|op| pattern.contains(op))
}

/// Structural checks run once when a route table is compiled.
pub fn validate(expr: &str) -> ExprResult<()> {
    if expr.len() > MAX_EXPRESSION_LEN {
        return Err(ExprError::new(format!(
            "expression too long: {} characters (max {MAX_EXPRESSION_LEN})",
            expr.len()
        )));
    }
    if expr.trim().is_empty() {
        return Err(ExprError::new("expression is empty"));
    }
    // Tokenizing rejects unterminated strings, unknown variables and stray
    // characters. Parentheses are counted on tokens so quoted ones are ignored.
    let tokens = tokenize(expr)?;
    let mut depth = 0i32;
    for tok in &tokens {
        match tok {
            Token::LParen => depth += 1,
            Token::RParen => depth -= 1,
            _ => {}
        }
        if depth < 0 {
            return Err(ExprError::new("unbalanced parentheses in expression"));
        }
    }
    if depth != 0 {
        return Err(ExprError::new("unbalanced parentheses in expression"));
    }
    Ok(())
}

/// Evaluate `expr` against `ctx`.
pub fn evaluate(expr: &str, ctx: ExprContext<'_>) -> ExprResult<bool> {
    validate(expr)?;
    let tokens = tokenize(expr)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        ctx,
    };
    let result = parser.parse_or()?;
    if let Some(tok) = parser.tokens.get(parser.pos) {
        return Err(ExprError::new(format!(
            "unexpected token after expression: {tok}"
        )));
    }
    Ok(result)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Str(String),
    Number(String),
    Value,
    ExitCode,
    Op(Op),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::Str(s) => write!(f, "'{s}'"),
            Token::Number(n) => f.write_str(n),
            Token::Value => f.write_str("@value"),
            Token::ExitCode => f.write_str("@exitCode"),
            Token::Op(op) => f.write_str(match op {
                Op::Eq => "==",
                Op::Ne => "!=",
                Op::Gt => ">",
                Op::Lt => "<",
                Op::Ge => ">=",
                Op::Le => "<=",
                Op::And => "&&",
                Op::Or => "||",
            }),
        }
    }
}

fn tokenize(expr: &str) -> ExprResult<Vec<Token>> {
    let chars: Vec<char> = expr.trim().chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '\'' | '"' => {
                let start = i;
                i += 1;
                let mut content = String::new();
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(ExprError::new(format!(
                                "unterminated string literal starting at position {start}"
                            )))
                        }
                        Some(&q) if q == c => {
                            i += 1;
                            break;
                        }
                        Some(&'\\') if i + 1 < chars.len() => {
                            content.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(&other) => {
                            content.push(other);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(content));
            }
            '@' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let name: String = chars[start..i].iter().collect();
                match name.as_str() {
                    "@value" => tokens.push(Token::Value),
                    "@exitCode" => tokens.push(Token::ExitCode),
                    _ => return Err(ExprError::new(format!("unknown variable: {name}"))),
                }
            }
            _ if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Number(chars[start..i].iter().collect()));
            }
            _ => {
                let next = chars.get(i + 1).copied();
                let (op, width) = match (c, next) {
                    ('=', Some('=')) => (Op::Eq, 2),
                    ('!', Some('=')) => (Op::Ne, 2),
                    ('>', Some('=')) => (Op::Ge, 2),
                    ('<', Some('=')) => (Op::Le, 2),
                    ('&', Some('&')) => (Op::And, 2),
                    ('|', Some('|')) => (Op::Or, 2),
                    ('>', _) => (Op::Gt, 1),
                    ('<', _) => (Op::Lt, 1),
                    _ => {
                        return Err(ExprError::new(format!(
                            "unexpected character at position {i}: {c}"
                        )))
                    }
                };
                tokens.push(Token::Op(op));
                i += width;
            }
        }
    }

    Ok(tokens)
}

struct Parser<'t, 'c> {
    tokens: &'t [Token],
    pos: usize,
    ctx: ExprContext<'c>,
}

impl Parser<'_, '_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_op(&self) -> Option<Op> {
        match self.peek() {
            Some(Token::Op(op)) => Some(*op),
            _ => None,
        }
    }

    fn parse_or(&mut self) -> ExprResult<bool> {
        let mut left = self.parse_and()?;
        while self.peek_op() == Some(Op::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = left || right;
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ExprResult<bool> {
        let mut left = self.parse_comparison()?;
        while self.peek_op() == Some(Op::And) {
            self.pos += 1;
            let right = self.parse_comparison()?;
            left = left && right;
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> ExprResult<bool> {
        let left = self.parse_primary()?;
        let op = match self.peek_op() {
            Some(op @ (Op::Eq | Op::Ne | Op::Gt | Op::Lt | Op::Ge | Op::Le)) => op,
            _ => return Ok(!left.is_empty()),
        };
        self.pos += 1;
        let right = self.parse_primary()?;
        Ok(compare(&left, op, &right))
    }

    fn parse_primary(&mut self) -> ExprResult<String> {
        let tok = self
            .peek()
            .cloned()
            .ok_or_else(|| ExprError::new("unexpected end of expression"))?;
        self.pos += 1;
        match tok {
            Token::Str(s) | Token::Number(s) => Ok(s),
            Token::Value => Ok(self.ctx.value.to_string()),
            Token::ExitCode => Ok(self.ctx.exit_code.to_string()),
            Token::LParen => {
                let inner = self.parse_or()?;
                match self.peek() {
                    Some(Token::RParen) => self.pos += 1,
                    Some(other) => return Err(ExprError::new(format!("expected ')', got {other}"))),
                    None => return Err(ExprError::new("expected ')', got end of expression")),
                }
                Ok(if inner { "true".to_string() } else { String::new() })
            }
            other => Err(ExprError::new(format!("unexpected token: {other}"))),
        }
    }
}

fn compare(left: &str, op: Op, right: &str) -> bool {
    if let (Ok(l), Ok(r)) = (left.trim().parse::<f64>(), right.trim().parse::<f64>()) {
        return match op {
            Op::Eq => l == r,
            Op::Ne => l != r,
            Op::Gt => l > r,
            Op::Lt => l < r,
            Op::Ge => l >= r,
            Op::Le => l <= r,
            Op::And | Op::Or => false,
        };
    }
    match op {
        Op::Eq => left == right,
        Op::Ne => left != right,
        Op::Gt => left > right,
        Op::Lt => left < right,
        Op::Ge => left >= right,
        Op::Le => left <= right,
        Op::And | Op::Or => false,
    }
}
