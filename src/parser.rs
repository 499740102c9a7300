//! Recursive-descent parser with precedence climbing.
//!
//! Precedence, lowest to highest: `or`; `and`/`unless`; comparisons;
//! `+`/`-`; `*`/`/`/`%`; unary prefix `+`/`-`; `^`. All binary levels are
//! left-associative except `^`. Trailing modifiers (offset, bool,
//! on/ignoring, group_left/group_right, by/without) are attached as part of
//! node construction; no node is mutated after the parse returns.

use crate::ast::{
    AggregateExpr, AggregateModifier, AggregationOp, BinOp, BinaryExpr, Call, Expr, LabelMatcher,
    MatcherOp, Matchers, MatrixSelector, SubqueryExpr, UnaryExpr, UnaryOp, VectorMatchCardinality,
    VectorMatching, VectorSelector,
};
use crate::error::Error;
use crate::lexer::{self, Token, TokenKind};
use crate::types::NAME_LABEL;

/// Parse a query string into an expression tree.
pub fn parse(input: &str) -> Result<Expr, Error> {
    let tokens = lexer::tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_binary(0)?;
    match parser.peek() {
        Some(tok) => Err(Error::Parse {
            expected: "end of input".to_string(),
            found: tok.lexeme.clone(),
            pos: tok.pos,
        }),
        None => Ok(expr),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<TokenKind> {
        self.peek().map(|t| t.kind)
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        self.pos += 1;
        token
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.peek_kind() == Some(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, expected: &str) -> Result<Token, Error> {
        match self.peek() {
            Some(t) if t.kind == kind => Ok(self.advance()),
            Some(t) => Err(Error::Parse {
                expected: expected.to_string(),
                found: t.lexeme.clone(),
                pos: t.pos,
            }),
            None => Err(Error::UnexpectedEof {
                expected: expected.to_string(),
            }),
        }
    }

    fn unexpected(&self, expected: &str) -> Error {
        match self.peek() {
            Some(t) => Error::Parse {
                expected: expected.to_string(),
                found: t.lexeme.clone(),
                pos: t.pos,
            },
            None => Error::UnexpectedEof {
                expected: expected.to_string(),
            },
        }
    }

    fn peek_binop(&self) -> Option<BinOp> {
        Some(match self.peek_kind()? {
            TokenKind::Or => BinOp::Or,
            TokenKind::And => BinOp::And,
            TokenKind::Unless => BinOp::Unless,
            TokenKind::Eql => BinOp::Eql,
            TokenKind::Neq => BinOp::Neq,
            TokenKind::Gtr => BinOp::Gtr,
            TokenKind::Lss => BinOp::Lss,
            TokenKind::Gte => BinOp::Gte,
            TokenKind::Lte => BinOp::Lte,
            TokenKind::Add => BinOp::Add,
            TokenKind::Sub => BinOp::Sub,
            TokenKind::Mul => BinOp::Mul,
            TokenKind::Div => BinOp::Div,
            TokenKind::Mod => BinOp::Mod,
            TokenKind::Pow => BinOp::Pow,
            _ => return None,
        })
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, Error> {
        let mut lhs = self.parse_unary()?;
        while let Some(op) = self.peek_binop() {
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }
            self.advance();
            let (return_bool, matching) = self.parse_bin_modifier(op)?;
            let next_min = if op.is_right_associative() {
                prec
            } else {
                prec + 1
            };
            let rhs = self.parse_binary(next_min)?;
            lhs = Expr::Binary(BinaryExpr {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                return_bool,
                matching,
            });
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, Error> {
        let op = match self.peek_kind() {
            Some(TokenKind::Add) => Some(UnaryOp::Plus),
            Some(TokenKind::Sub) => Some(UnaryOp::Minus),
            _ => None,
        };
        match op {
            Some(op) => {
                self.advance();
                // the operand may still absorb a ^ chain: -2^2 is -(2^2)
                let expr = self.parse_binary(BinOp::Pow.precedence())?;
                Ok(Expr::Unary(UnaryExpr {
                    op,
                    expr: Box::new(expr),
                }))
            }
            None => self.parse_postfix(),
        }
    }

    /// Primary expression plus trailing `[range]`/`[range:step]` and
    /// `offset <duration>` modifiers.
    fn parse_postfix(&mut self) -> Result<Expr, Error> {
        let mut expr = self.parse_primary()?;
        while self.peek_kind() == Some(TokenKind::TimeRange) {
            let tok = self.advance();
            expr = apply_time_range(expr, &tok)?;
        }
        if self.eat(TokenKind::Offset) {
            let dur = self.expect(TokenKind::Duration, "duration")?;
            let seconds = lexer::duration_seconds(&dur.lexeme)?;
            expr = attach_offset(expr, seconds, dur.pos)?;
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, Error> {
        match self.peek_kind() {
            Some(TokenKind::Number) => {
                let tok = self.advance();
                let value = tok.lexeme.parse::<f64>().map_err(|_| Error::Parse {
                    expected: "number".to_string(),
                    found: tok.lexeme.clone(),
                    pos: tok.pos,
                })?;
                Ok(Expr::NumberLiteral(value))
            }
            Some(TokenKind::Str) => {
                let tok = self.advance();
                Ok(Expr::StringLiteral(lexer::unquote(&tok.lexeme)))
            }
            Some(TokenKind::LeftParen) => {
                self.advance();
                let inner = self.parse_binary(0)?;
                self.expect(TokenKind::RightParen, ")")?;
                Ok(Expr::Paren(Box::new(inner)))
            }
            Some(TokenKind::AggregationOp) => self.parse_aggregation(),
            Some(TokenKind::Function) => self.parse_call(),
            Some(TokenKind::Identifier)
            | Some(TokenKind::MetricIdentifier)
            | Some(TokenKind::LeftBrace) => self.parse_vector_selector(),
            _ => Err(self.unexpected("expression")),
        }
    }

    fn parse_vector_selector(&mut self) -> Result<Expr, Error> {
        let mut name = match self.peek_kind() {
            Some(TokenKind::Identifier) | Some(TokenKind::MetricIdentifier) => {
                Some(self.advance().lexeme)
            }
            _ => None,
        };
        let mut matchers = Vec::new();
        if self.eat(TokenKind::LeftBrace) && !self.eat(TokenKind::RightBrace) {
            loop {
                matchers.push(self.parse_label_matcher()?);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RightBrace, "}")?;
        }

        // A __name__ equality matcher is consumed into the metric name.
        let mut kept = Vec::with_capacity(matchers.len());
        for matcher in matchers {
            if matcher.name == NAME_LABEL && matcher.op == MatcherOp::Equal {
                match &name {
                    Some(existing) if *existing != matcher.value => {
                        return Err(Error::MetricNameConflict {
                            name: existing.clone(),
                            matcher: matcher.value,
                        });
                    }
                    _ => name = Some(matcher.value),
                }
            } else {
                kept.push(matcher);
            }
        }
        let name = name.ok_or(Error::MissingMetricName)?;

        Ok(Expr::VectorSelector(VectorSelector {
            name: Some(name),
            matchers: Matchers(kept),
            offset: 0,
        }))
    }

    fn parse_label_matcher(&mut self) -> Result<LabelMatcher, Error> {
        let name = self.parse_label_name()?;
        let op = match self.peek_kind() {
            Some(TokenKind::Assign) => MatcherOp::Equal,
            Some(TokenKind::Neq) => MatcherOp::NotEqual,
            Some(TokenKind::EqlRegex) => MatcherOp::RegexMatch,
            Some(TokenKind::NeqRegex) => MatcherOp::RegexNotMatch,
            _ => return Err(self.unexpected("label matcher operator")),
        };
        self.advance();
        let value = self.expect(TokenKind::Str, "string literal")?;
        Ok(LabelMatcher {
            name,
            op,
            value: lexer::unquote(&value.lexeme),
        })
    }

    /// A label-name position accepts any keyword token, so `on`, `bool` or
    /// `sum` are all legal label names.
    fn parse_label_name(&mut self) -> Result<String, Error> {
        match self.peek() {
            Some(t) if is_label_name_token(t.kind) => Ok(self.advance().lexeme),
            _ => Err(self.unexpected("label name")),
        }
    }

    /// Parenthesized, comma-separated label names; `()` is allowed.
    fn parse_label_list(&mut self) -> Result<Vec<String>, Error> {
        self.expect(TokenKind::LeftParen, "(")?;
        let mut labels = Vec::new();
        if self.eat(TokenKind::RightParen) {
            return Ok(labels);
        }
        loop {
            labels.push(self.parse_label_name()?);
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RightParen, ")")?;
        Ok(labels)
    }

    fn parse_bin_modifier(&mut self, op: BinOp) -> Result<(bool, Option<VectorMatching>), Error> {
        let mut return_bool = false;
        if self.eat(TokenKind::Bool) {
            if !op.is_comparison() {
                return Err(Error::BoolWithNonComparison);
            }
            return_bool = true;
        }

        let on = match self.peek_kind() {
            Some(TokenKind::On) => Some(true),
            Some(TokenKind::Ignoring) => Some(false),
            _ => None,
        };
        let Some(on) = on else {
            if matches!(
                self.peek_kind(),
                Some(TokenKind::GroupLeft) | Some(TokenKind::GroupRight)
            ) {
                return Err(Error::GroupModifierWithoutMatching);
            }
            return Ok((return_bool, None));
        };
        self.advance();
        let matching_labels = self.parse_label_list()?;

        let mut matching = VectorMatching {
            card: VectorMatchCardinality::OneToOne,
            on,
            matching_labels,
            include: Vec::new(),
        };
        match self.peek_kind() {
            Some(TokenKind::GroupLeft) => {
                self.advance();
                matching.card = VectorMatchCardinality::ManyToOne;
                matching.include = self.parse_optional_label_list()?;
            }
            Some(TokenKind::GroupRight) => {
                self.advance();
                matching.card = VectorMatchCardinality::OneToMany;
                matching.include = self.parse_optional_label_list()?;
            }
            _ => {}
        }
        Ok((return_bool, Some(matching)))
    }

    /// Include labels after group_left/group_right. A following paren always
    /// binds to the modifier, never to the right-hand operand.
    fn parse_optional_label_list(&mut self) -> Result<Vec<String>, Error> {
        if self.peek_kind() == Some(TokenKind::LeftParen) {
            self.parse_label_list()
        } else {
            Ok(Vec::new())
        }
    }

    fn parse_call(&mut self) -> Result<Expr, Error> {
        let name = self.advance().lexeme;
        self.expect(TokenKind::LeftParen, "(")?;
        let mut args = Vec::new();
        if !self.eat(TokenKind::RightParen) {
            loop {
                args.push(self.parse_binary(0)?);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RightParen, ")")?;
        }
        Ok(Expr::Call(Call { name, args }))
    }

    /// Aggregation with the grouping clause in either position:
    /// `sum by (job) (x)` or `sum(x) by (job)`. Both forms produce the same
    /// node. The final argument is the grouped expression; any leading
    /// arguments (`topk(k, x)`) stay attached as parameters.
    fn parse_aggregation(&mut self) -> Result<Expr, Error> {
        let op_tok = self.advance();
        let op = AggregationOp::from_name(&op_tok.lexeme).ok_or(Error::Parse {
            expected: "aggregation operator".to_string(),
            found: op_tok.lexeme.clone(),
            pos: op_tok.pos,
        })?;

        let mut modifier = None;
        if matches!(
            self.peek_kind(),
            Some(TokenKind::By) | Some(TokenKind::Without)
        ) {
            modifier = Some(self.parse_aggregate_modifier()?);
        }

        self.expect(TokenKind::LeftParen, "(")?;
        let mut params = vec![self.parse_binary(0)?];
        while self.eat(TokenKind::Comma) {
            params.push(self.parse_binary(0)?);
        }
        self.expect(TokenKind::RightParen, ")")?;

        if modifier.is_none()
            && matches!(
                self.peek_kind(),
                Some(TokenKind::By) | Some(TokenKind::Without)
            )
        {
            modifier = Some(self.parse_aggregate_modifier()?);
        }

        let expr = params.pop().ok_or_else(|| self.unexpected("expression"))?;
        Ok(Expr::Aggregate(AggregateExpr {
            op,
            modifier,
            params,
            expr: Box::new(expr),
        }))
    }

    fn parse_aggregate_modifier(&mut self) -> Result<AggregateModifier, Error> {
        let without = self.advance().kind == TokenKind::Without;
        let grouping = self.parse_label_list()?;
        Ok(AggregateModifier { grouping, without })
    }
}

fn is_label_name_token(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Identifier
            | TokenKind::MetricIdentifier
            | TokenKind::And
            | TokenKind::Or
            | TokenKind::Unless
            | TokenKind::By
            | TokenKind::Without
            | TokenKind::On
            | TokenKind::Ignoring
            | TokenKind::GroupLeft
            | TokenKind::GroupRight
            | TokenKind::Offset
            | TokenKind::Bool
            | TokenKind::AggregationOp
            | TokenKind::Function
    )
}

fn apply_time_range(expr: Expr, tok: &Token) -> Result<Expr, Error> {
    let body = &tok.lexeme[1..tok.lexeme.len() - 1];
    if let Some((range, step)) = body.split_once(':') {
        let range = lexer::duration_seconds(range)?;
        let step = if step.is_empty() {
            None
        } else {
            Some(lexer::duration_seconds(step)?)
        };
        if matches!(expr, Expr::NumberLiteral(_) | Expr::StringLiteral(_)) {
            return Err(Error::Parse {
                expected: "vector expression before subquery range".to_string(),
                found: tok.lexeme.clone(),
                pos: tok.pos,
            });
        }
        Ok(Expr::Subquery(SubqueryExpr {
            expr: Box::new(expr),
            range,
            step,
            offset: 0,
        }))
    } else {
        let range = lexer::duration_seconds(body)?;
        match expr {
            Expr::VectorSelector(vs) => Ok(Expr::MatrixSelector(MatrixSelector {
                vs,
                range,
                offset: 0,
            })),
            _ => Err(Error::Parse {
                expected: "vector selector before range".to_string(),
                found: tok.lexeme.clone(),
                pos: tok.pos,
            }),
        }
    }
}

fn attach_offset(expr: Expr, seconds: u64, pos: usize) -> Result<Expr, Error> {
    match expr {
        Expr::VectorSelector(vs) => Ok(Expr::VectorSelector(VectorSelector {
            offset: seconds,
            ..vs
        })),
        Expr::MatrixSelector(ms) => Ok(Expr::MatrixSelector(MatrixSelector {
            offset: seconds,
            ..ms
        })),
        Expr::Subquery(sq) => Ok(Expr::Subquery(SubqueryExpr {
            offset: seconds,
            ..sq
        })),
        _ => Err(Error::Parse {
            expected: "selector before offset modifier".to_string(),
            found: "offset".to_string(),
            pos,
        }),
    }
}
