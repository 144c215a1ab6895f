use regex::Regex;

use super::expr::{self, ExprContext, ExprError};

const MAX_REGEX_LEN: usize = 1000;

/// A route pattern compiled once when the route table is validated.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Exact string equality.
    Literal(String),
    /// `/re/`, unanchored search.
    Regex(Regex),
    /// `[a, b, c]`, matches any listed value.
    OneOf(Vec<String>),
    /// `@exitCode == 0 && @value != 'skip'`
    Expression(String),
}

impl Pattern {
    pub fn compile(source: &str) -> Result<Self, String> {
        if source.len() > 2 && source.starts_with('/') && source.ends_with('/') {
            let body = &source[1..source.len() - 1];
            if body.len() > MAX_REGEX_LEN {
                return Err(format!(
                    "regex too long: {} characters (max {MAX_REGEX_LEN})",
                    body.len()
                ));
            }
            return Regex::new(body)
                .map(Pattern::Regex)
                .map_err(|e| format!("regex compilation failed: {e}"));
        }

        if source.starts_with('[') && source.ends_with(']') && source.len() >= 2 {
            let inner = &source[1..source.len() - 1];
            if inner.trim().is_empty() {
                return Err("empty array pattern".to_string());
            }
            let mut values = Vec::new();
            for part in inner.split(',') {
                let trimmed = part.trim();
                if trimmed.is_empty() {
                    return Err("empty value in array pattern".to_string());
                }
                values.push(trimmed.to_string());
            }
            return Ok(Pattern::OneOf(values));
        }

        if expr::is_expression(source) {
            expr::validate(source).map_err(|e| format!("invalid expression: {e}"))?;
            return Ok(Pattern::Expression(source.to_string()));
        }

        Ok(Pattern::Literal(source.to_string()))
    }

    /// Test `value` against this pattern. Only expressions can fail here.
    pub fn matches(&self, value: &str, exit_code: i32) -> Result<bool, ExprError> {
        match self {
            Pattern::Literal(s) => Ok(s == value),
            Pattern::Regex(re) => Ok(re.is_match(value)),
            Pattern::OneOf(values) => Ok(values.iter().any(|v| v == value)),
            Pattern::Expression(e) => expr::evaluate(e, ExprContext { value, exit_code }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_kinds() {
        assert!(matches!(Pattern::compile("ok").unwrap(), Pattern::Literal(_)));
        assert!(matches!(Pattern::compile("/^ok$/").unwrap(), Pattern::Regex(_)));
        assert!(matches!(Pattern::compile("[a, b]").unwrap(), Pattern::OneOf(_)));
        assert!(matches!(
            Pattern::compile("@exitCode == 0").unwrap(),
            Pattern::Expression(_)
        ));
        // Too short to be a regex.
        assert!(matches!(Pattern::compile("//").unwrap(), Pattern::Literal(_)));
        assert!(matches!(Pattern::compile("/").unwrap(), Pattern::Literal(_)));
    }

    #[test]
    fn test_literal_and_empty() {
        let p = Pattern::compile("").unwrap();
        assert!(p.matches("", 0).unwrap());
        assert!(!p.matches("x", 0).unwrap());
    }

    #[test]
    fn test_regex_is_unanchored() {
        let p = Pattern::compile("/err/").unwrap();
        assert!(p.matches("fatal error here", 0).unwrap());
        let p = Pattern::compile("/^ok$/").unwrap();
        assert!(!p.matches("not ok", 0).unwrap());
    }

    #[test]
    fn test_array_trims_values() {
        let p = Pattern::compile("[ red , green,blue ]").unwrap();
        assert!(p.matches("green", 0).unwrap());
        assert!(p.matches("blue", 0).unwrap());
        assert!(!p.matches(" red ", 0).unwrap());
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(Pattern::compile("/^[unclosed/").is_err());
        assert!(Pattern::compile("[]").is_err());
        assert!(Pattern::compile("[a,,b]").is_err());
        assert!(Pattern::compile("@value == 'x").is_err());
        let long = format!("/{}/", "a".repeat(MAX_REGEX_LEN + 1));
        assert!(Pattern::compile(&long).unwrap_err().contains("regex too long"));
    }
}
