//! Error types for parsing, resolution, compilation and evaluation.

use crate::ast::MatcherOp;

/// Errors produced by the query language core.
///
/// The variants fall into four families: lexical (`Lex`, `InvalidDuration`),
/// grammatical (`Parse`, `UnexpectedEof`), semantic (everything resolvable
/// only after a parse succeeds) and configuration. `Store` wraps failures of
/// the relational backend verbatim.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unrecognized input at position {pos}: {fragment:?}")]
    Lex { pos: usize, fragment: String },

    #[error("invalid duration literal {literal:?}")]
    InvalidDuration { literal: String },

    #[error("parse error at position {pos}: expected {expected}, found {found:?}")]
    Parse {
        expected: String,
        found: String,
        pos: usize,
    },

    #[error("unexpected end of input: expected {expected}")]
    UnexpectedEof { expected: String },

    #[error("selector has no metric name and no __name__ matcher")]
    MissingMetricName,

    #[error("metric name {name:?} conflicts with __name__ matcher {matcher:?}")]
    MetricNameConflict { name: String, matcher: String },

    #[error("group_left/group_right requires an on or ignoring clause")]
    GroupModifierWithoutMatching,

    #[error("bool modifier is only valid on comparison operators")]
    BoolWithNonComparison,

    #[error("label matcher operator {op} has no relational equivalent")]
    UnsupportedOperator { op: MatcherOp },

    #[error("many-to-many matching not allowed: matching labels must be unique on one side")]
    ManyToMany,

    #[error("function {name:?} is recognized but not evaluated")]
    UnsupportedFunction { name: String },

    #[error("function {name:?} expects {expected} argument(s), got {got}")]
    FunctionArity {
        name: String,
        expected: String,
        got: usize,
    },

    #[error("no configuration resolves key {key:?} for metric {metric:?}")]
    Config { key: String, metric: String },

    #[error("failed to load configuration: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),

    #[error("store query failed: {0}")]
    Store(#[from] sqlx::Error),

    #[error("evaluation error: {0}")]
    Evaluation(String),
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::ConfigLoad(Box::new(err))
    }
}
