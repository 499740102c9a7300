//! Hand-rolled tokenizer for the query language.
//!
//! Longest-match and case-sensitive. Overlapping rules are resolved in a
//! fixed priority order: bracketed time-range, duration, number, string,
//! multi-character operators, single-character operators and punctuation,
//! keyword/function/aggregation names, generic identifiers. Keyword tokens
//! still satisfy identifier positions in the grammar (a label named `on` is
//! legal); the parser handles that, not the lexer.

use crate::ast::{AggregationOp, function_arity};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Number,
    Str,
    Duration,
    TimeRange,

    Identifier,
    MetricIdentifier,

    LeftBrace,
    RightBrace,
    LeftParen,
    RightParen,
    Comma,

    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,

    Assign,
    Eql,
    Neq,
    Gtr,
    Lss,
    Gte,
    Lte,
    EqlRegex,
    NeqRegex,

    And,
    Or,
    Unless,
    By,
    Without,
    On,
    Ignoring,
    GroupLeft,
    GroupRight,
    Offset,
    Bool,

    AggregationOp,
    Function,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    /// Byte offset into the query text.
    pub pos: usize,
}

impl Token {
    fn new(kind: TokenKind, lexeme: &str, pos: usize) -> Self {
        Self {
            kind,
            lexeme: lexeme.to_string(),
            pos,
        }
    }
}

const DURATION_UNITS: &[(char, u64)] = &[
    ('s', 1),
    ('m', 60),
    ('h', 3600),
    ('d', 86400),
    ('w', 604800),
];

fn unit_multiplier(c: char) -> Option<u64> {
    DURATION_UNITS
        .iter()
        .find(|(unit, _)| *unit == c)
        .map(|(_, mult)| *mult)
}

/// Convert a duration literal (`<int><unit>`, unit in {s,m,h,d,w}) to
/// seconds. Week is seven days.
pub fn duration_seconds(literal: &str) -> Result<u64, Error> {
    let invalid = || Error::InvalidDuration {
        literal: literal.to_string(),
    };
    let digits: String = literal.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return Err(invalid());
    }
    let rest = &literal[digits.len()..];
    let mut rest_chars = rest.chars();
    let unit = rest_chars.next().ok_or_else(invalid)?;
    if rest_chars.next().is_some() {
        return Err(invalid());
    }
    let mult = unit_multiplier(unit).ok_or_else(invalid)?;
    let n: u64 = digits.parse().map_err(|_| invalid())?;
    n.checked_mul(mult).ok_or_else(invalid)
}

/// Strip the quotes from a string literal and process backslash escapes.
pub fn unquote(lexeme: &str) -> String {
    let inner = &lexeme[1..lexeme.len().saturating_sub(1)];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Tokenize a query. The result is finite and restartable (callers may
/// iterate it as many times as they like).
pub fn tokenize(text: &str) -> Result<Vec<Token>, Error> {
    Lexer::new(text).run()
}

struct Lexer<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn error(&self) -> Error {
        let fragment: String = self.rest().chars().take(12).collect();
        Error::Lex {
            pos: self.pos,
            fragment,
        }
    }

    fn run(mut self) -> Result<Vec<Token>, Error> {
        let mut tokens = Vec::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_whitespace() {
                self.pos += c.len_utf8();
                continue;
            }
            let token = match c {
                '[' => self.scan_time_range()?,
                '\'' | '"' => self.scan_string(c)?,
                _ if c.is_ascii_digit() => self.scan_number_or_duration()?,
                _ if c.is_ascii_alphabetic() || c == '_' || c == ':' => self.scan_word(),
                _ => self.scan_operator()?,
            };
            self.pos += token.lexeme.len();
            tokens.push(token);
        }
        Ok(tokens)
    }

    /// `[5m]`, `[30m:1m]` or `[30m:]`. There is no standalone bracket token,
    /// so anything else starting with `[` is a lex failure.
    fn scan_time_range(&self) -> Result<Token, Error> {
        let rest = self.rest();
        let mut len = 1;
        len += self.scan_duration_at(len)?;
        if rest[len..].starts_with(':') {
            len += 1;
            if !rest[len..].starts_with(']') {
                len += self.scan_duration_at(len)?;
            }
        }
        if !rest[len..].starts_with(']') {
            return Err(self.error());
        }
        len += 1;
        Ok(Token::new(TokenKind::TimeRange, &rest[..len], self.pos))
    }

    /// Length of the duration literal at `offset` into the unscanned text.
    fn scan_duration_at(&self, offset: usize) -> Result<usize, Error> {
        let rest = &self.rest()[offset..];
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return Err(self.error());
        }
        match rest[digits..].chars().next() {
            Some(unit) if unit_multiplier(unit).is_some() => Ok(digits + 1),
            Some(unit) if unit.is_ascii_alphabetic() => Err(Error::InvalidDuration {
                literal: format!("{}{}", &rest[..digits], unit),
            }),
            _ => Err(self.error()),
        }
    }

    fn scan_string(&self, quote: char) -> Result<Token, Error> {
        let rest = self.rest();
        let mut chars = rest.char_indices().skip(1);
        while let Some((idx, c)) = chars.next() {
            if c == '\\' {
                chars.next();
            } else if c == quote {
                return Ok(Token::new(TokenKind::Str, &rest[..idx + 1], self.pos));
            }
        }
        // unterminated string
        Err(self.error())
    }

    fn scan_number_or_duration(&self) -> Result<Token, Error> {
        let rest = self.rest();
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        let mut after = rest[digits..].chars();
        match after.next() {
            Some(unit) if unit_multiplier(unit).is_some() => Ok(Token::new(
                TokenKind::Duration,
                &rest[..digits + 1],
                self.pos,
            )),
            // Digits followed by another letter are an attempted duration
            // with an unknown unit, not a number next to an identifier.
            Some(unit) if unit.is_ascii_alphabetic() => Err(Error::InvalidDuration {
                literal: format!("{}{}", &rest[..digits], unit),
            }),
            Some('.') => {
                let frac = rest[digits + 1..]
                    .chars()
                    .take_while(|c| c.is_ascii_digit())
                    .count();
                if frac == 0 {
                    return Err(self.error());
                }
                Ok(Token::new(
                    TokenKind::Number,
                    &rest[..digits + 1 + frac],
                    self.pos,
                ))
            }
            _ => Ok(Token::new(TokenKind::Number, &rest[..digits], self.pos)),
        }
    }

    fn scan_word(&self) -> Token {
        let rest = self.rest();
        let len = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == ':')
            .map(|c| c.len_utf8())
            .sum();
        let word = &rest[..len];
        let kind = match word {
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "unless" => TokenKind::Unless,
            "by" => TokenKind::By,
            "without" => TokenKind::Without,
            "on" => TokenKind::On,
            "ignoring" => TokenKind::Ignoring,
            "group_left" => TokenKind::GroupLeft,
            "group_right" => TokenKind::GroupRight,
            "offset" => TokenKind::Offset,
            "bool" => TokenKind::Bool,
            _ if AggregationOp::from_name(word).is_some() => TokenKind::AggregationOp,
            _ if function_arity(word).is_some() => TokenKind::Function,
            _ if word.contains(':') => TokenKind::MetricIdentifier,
            _ => TokenKind::Identifier,
        };
        Token::new(kind, word, self.pos)
    }

    fn scan_operator(&self) -> Result<Token, Error> {
        let rest = self.rest();
        for (op, kind) in [
            ("==", TokenKind::Eql),
            ("!=", TokenKind::Neq),
            (">=", TokenKind::Gte),
            ("<=", TokenKind::Lte),
            ("=~", TokenKind::EqlRegex),
            ("!~", TokenKind::NeqRegex),
        ] {
            if rest.starts_with(op) {
                return Ok(Token::new(kind, op, self.pos));
            }
        }
        let kind = match rest.chars().next() {
            Some('+') => TokenKind::Add,
            Some('-') => TokenKind::Sub,
            Some('*') => TokenKind::Mul,
            Some('/') => TokenKind::Div,
            Some('%') => TokenKind::Mod,
            Some('^') => TokenKind::Pow,
            Some('>') => TokenKind::Gtr,
            Some('<') => TokenKind::Lss,
            Some('=') => TokenKind::Assign,
            Some('{') => TokenKind::LeftBrace,
            Some('}') => TokenKind::RightBrace,
            Some('(') => TokenKind::LeftParen,
            Some(')') => TokenKind::RightParen,
            Some(',') => TokenKind::Comma,
            _ => return Err(self.error()),
        };
        Ok(Token::new(kind, &rest[..1], self.pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn duration_conversions() {
        for (literal, seconds) in [
            ("1s", 1),
            ("5m", 300),
            ("2h", 7200),
            ("1d", 86400),
            ("1w", 604800),
            ("90s", 90),
        ] {
            assert_eq!(duration_seconds(literal).unwrap(), seconds);
        }
    }

    #[test]
    fn invalid_duration_unit() {
        assert!(matches!(
            duration_seconds("5x"),
            Err(Error::InvalidDuration { .. })
        ));
        assert!(matches!(
            duration_seconds("1y"),
            Err(Error::InvalidDuration { .. })
        ));
        assert!(matches!(
            duration_seconds("m"),
            Err(Error::InvalidDuration { .. })
        ));
    }

    #[test]
    fn oversized_duration_is_invalid_not_a_wraparound() {
        // 1e17 weeks exceeds u64 seconds
        assert!(matches!(
            duration_seconds("100000000000000000w"),
            Err(Error::InvalidDuration { .. })
        ));
        assert!(matches!(
            duration_seconds("18446744073709551616s"),
            Err(Error::InvalidDuration { .. })
        ));
        // largest representable value still converts
        assert_eq!(duration_seconds("18446744073709551615s").unwrap(), u64::MAX);
    }

    #[test]
    fn selector_tokens() {
        assert_eq!(
            kinds(r#"up{job="api", mode!="idle"}"#),
            vec![
                TokenKind::Identifier,
                TokenKind::LeftBrace,
                TokenKind::Identifier,
                TokenKind::Assign,
                TokenKind::Str,
                TokenKind::Comma,
                TokenKind::Identifier,
                TokenKind::Neq,
                TokenKind::Str,
                TokenKind::RightBrace,
            ]
        );
    }

    #[test]
    fn time_range_forms() {
        assert_eq!(kinds("x[5m]"), vec![TokenKind::Identifier, TokenKind::TimeRange]);
        assert_eq!(
            kinds("x[30m:1m]"),
            vec![TokenKind::Identifier, TokenKind::TimeRange]
        );
        assert_eq!(
            kinds("x[30m:]"),
            vec![TokenKind::Identifier, TokenKind::TimeRange]
        );
        assert!(matches!(tokenize("x[5]"), Err(Error::Lex { .. })));
        assert!(matches!(
            tokenize("x[5y]"),
            Err(Error::InvalidDuration { .. })
        ));
    }

    #[test]
    fn time_range_wins_over_duration() {
        let tokens = tokenize("rate(x[5m]) offset 5m").unwrap();
        let range = tokens.iter().find(|t| t.kind == TokenKind::TimeRange).unwrap();
        assert_eq!(range.lexeme, "[5m]");
        let dur = tokens.iter().find(|t| t.kind == TokenKind::Duration).unwrap();
        assert_eq!(dur.lexeme, "5m");
    }

    #[test]
    fn keywords_and_name_sets() {
        assert_eq!(
            kinds("sum by (job) rate and on unless"),
            vec![
                TokenKind::AggregationOp,
                TokenKind::By,
                TokenKind::LeftParen,
                TokenKind::Identifier,
                TokenKind::RightParen,
                TokenKind::Function,
                TokenKind::And,
                TokenKind::On,
                TokenKind::Unless,
            ]
        );
        // exact match only: `summary` is not the `sum` aggregation
        assert_eq!(kinds("summary"), vec![TokenKind::Identifier]);
    }

    #[test]
    fn metric_identifier_with_colon() {
        assert_eq!(kinds("node:cpu:rate5m"), vec![TokenKind::MetricIdentifier]);
    }

    #[test]
    fn numbers() {
        let tokens = tokenize("3.14 + 42").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Number);
        assert_eq!(tokens[0].lexeme, "3.14");
        assert_eq!(tokens[1].kind, TokenKind::Add);
        assert_eq!(tokens[2].lexeme, "42");
    }

    #[test]
    fn multi_char_operators_win() {
        assert_eq!(
            kinds("a == b >= c =~ d"),
            vec![
                TokenKind::Identifier,
                TokenKind::Eql,
                TokenKind::Identifier,
                TokenKind::Gte,
                TokenKind::Identifier,
                TokenKind::EqlRegex,
                TokenKind::Identifier,
            ]
        );
    }

    #[test]
    fn string_escapes() {
        let tokens = tokenize(r#""a\"b" 'c\nd'"#).unwrap();
        assert_eq!(unquote(&tokens[0].lexeme), "a\"b");
        assert_eq!(unquote(&tokens[1].lexeme), "c\nd");
        assert!(matches!(tokenize(r#""open"#), Err(Error::Lex { .. })));
    }

    #[test]
    fn unrecognized_input_reports_position() {
        match tokenize("up @ 5") {
            Err(Error::Lex { pos, fragment }) => {
                assert_eq!(pos, 3);
                assert!(fragment.starts_with('@'));
            }
            other => panic!("expected lex error, got {other:?}"),
        }
    }
}
