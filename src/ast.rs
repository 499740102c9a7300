//! Expression model for the query language.
//!
//! Pure data: every node carries all of its fields from construction, and
//! equality is structural so parsed trees can be compared against fixtures.
//! The `Display` implementations form a pretty-printer whose output parses
//! back to an equal tree.

use std::fmt;

/// Label matcher operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherOp {
    /// Exact string match (=)
    Equal,
    /// Not equal (!=)
    NotEqual,
    /// Regex match (=~)
    RegexMatch,
    /// Regex not match (!~)
    RegexNotMatch,
}

impl fmt::Display for MatcherOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equal => write!(f, "="),
            Self::NotEqual => write!(f, "!="),
            Self::RegexMatch => write!(f, "=~"),
            Self::RegexNotMatch => write!(f, "!~"),
        }
    }
}

/// A single label matcher, e.g. `job="api"`.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMatcher {
    pub name: String,
    pub op: MatcherOp,
    pub value: String,
}

impl LabelMatcher {
    pub fn new(name: &str, op: MatcherOp, value: &str) -> Self {
        Self {
            name: name.to_string(),
            op,
            value: value.to_string(),
        }
    }

    pub fn equal(name: &str, value: &str) -> Self {
        Self::new(name, MatcherOp::Equal, value)
    }

    pub fn not_equal(name: &str, value: &str) -> Self {
        Self::new(name, MatcherOp::NotEqual, value)
    }
}

impl fmt::Display for LabelMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.op, self.value)
    }
}

/// Ordered matcher list; duplicate names are allowed and all must hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Matchers(pub Vec<LabelMatcher>);

impl Matchers {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LabelMatcher> {
        self.0.iter()
    }
}

impl fmt::Display for Matchers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self
            .0
            .iter()
            .map(|m| m.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{{{inner}}}")
    }
}

/// Binary operators, lowest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Unless,
    Eql,
    Neq,
    Gtr,
    Lss,
    Gte,
    Lte,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

impl BinOp {
    /// Binding strength; larger binds tighter. `^` deliberately sits above
    /// the unary level (6) so `-2 ^ 2` is `-(2 ^ 2)`.
    pub fn precedence(&self) -> u8 {
        match self {
            Self::Or => 1,
            Self::And | Self::Unless => 2,
            Self::Eql | Self::Neq | Self::Gtr | Self::Lss | Self::Gte | Self::Lte => 3,
            Self::Add | Self::Sub => 4,
            Self::Mul | Self::Div | Self::Mod => 5,
            Self::Pow => 7,
        }
    }

    pub fn is_right_associative(&self) -> bool {
        matches!(self, Self::Pow)
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            Self::Eql | Self::Neq | Self::Gtr | Self::Lss | Self::Gte | Self::Lte
        )
    }

    pub fn is_set_operator(&self) -> bool {
        matches!(self, Self::And | Self::Or | Self::Unless)
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Or => "or",
            Self::And => "and",
            Self::Unless => "unless",
            Self::Eql => "==",
            Self::Neq => "!=",
            Self::Gtr => ">",
            Self::Lss => "<",
            Self::Gte => ">=",
            Self::Lte => "<=",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Pow => "^",
        };
        write!(f, "{s}")
    }
}

/// How many rows from each side of a binary operation may match a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VectorMatchCardinality {
    #[default]
    OneToOne,
    /// `group_left`: the left side is the "many" side.
    ManyToOne,
    /// `group_right`: the right side is the "many" side.
    OneToMany,
}

/// Join semantics attached to a vector-valued binary operator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorMatching {
    pub card: VectorMatchCardinality,
    /// `true` for `on (...)` (allow-list), `false` for `ignoring (...)`.
    pub on: bool,
    pub matching_labels: Vec<String>,
    /// Labels copied from the "one" side onto the result. Non-empty only for
    /// the grouped cardinalities.
    pub include: Vec<String>,
}

impl fmt::Display for VectorMatching {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let clause = if self.on { "on" } else { "ignoring" };
        write!(f, "{clause} ({})", self.matching_labels.join(", "))?;
        match self.card {
            VectorMatchCardinality::OneToOne => Ok(()),
            VectorMatchCardinality::ManyToOne => {
                write!(f, " group_left ({})", self.include.join(", "))
            }
            VectorMatchCardinality::OneToMany => {
                write!(f, " group_right ({})", self.include.join(", "))
            }
        }
    }
}

/// The `by`/`without` clause of an aggregation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateModifier {
    pub grouping: Vec<String>,
    pub without: bool,
}

impl fmt::Display for AggregateModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let clause = if self.without { "without" } else { "by" };
        write!(f, "{clause} ({})", self.grouping.join(", "))
    }
}

/// Aggregation operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationOp {
    Sum,
    Min,
    Max,
    Avg,
    Group,
    Stddev,
    Stdvar,
    Count,
    CountValues,
    Bottomk,
    Topk,
    Quantile,
}

impl AggregationOp {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "sum" => Self::Sum,
            "min" => Self::Min,
            "max" => Self::Max,
            "avg" => Self::Avg,
            "group" => Self::Group,
            "stddev" => Self::Stddev,
            "stdvar" => Self::Stdvar,
            "count" => Self::Count,
            "count_values" => Self::CountValues,
            "bottomk" => Self::Bottomk,
            "topk" => Self::Topk,
            "quantile" => Self::Quantile,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Avg => "avg",
            Self::Group => "group",
            Self::Stddev => "stddev",
            Self::Stdvar => "stdvar",
            Self::Count => "count",
            Self::CountValues => "count_values",
            Self::Bottomk => "bottomk",
            Self::Topk => "topk",
            Self::Quantile => "quantile",
        }
    }

    /// Operators taking a leading scalar/string parameter before the grouped
    /// expression.
    pub fn takes_parameter(&self) -> bool {
        matches!(
            self,
            Self::CountValues | Self::Bottomk | Self::Topk | Self::Quantile
        )
    }
}

impl fmt::Display for AggregationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The fixed function name set with argument counts: `(name, min, max)`.
/// `None` for max means variadic. Bodies are not evaluated; the table exists
/// for name recognition and arity checks at dispatch time.
pub const FUNCTIONS: &[(&str, usize, Option<usize>)] = &[
    ("abs", 1, Some(1)),
    ("absent", 1, Some(1)),
    ("absent_over_time", 1, Some(1)),
    ("avg_over_time", 1, Some(1)),
    ("ceil", 1, Some(1)),
    ("changes", 1, Some(1)),
    ("clamp_max", 2, Some(2)),
    ("clamp_min", 2, Some(2)),
    ("count_over_time", 1, Some(1)),
    ("day_of_month", 0, Some(1)),
    ("day_of_week", 0, Some(1)),
    ("days_in_month", 0, Some(1)),
    ("delta", 1, Some(1)),
    ("deriv", 1, Some(1)),
    ("exp", 1, Some(1)),
    ("floor", 1, Some(1)),
    ("histogram_quantile", 2, Some(2)),
    ("holt_winters", 3, Some(3)),
    ("hour", 0, Some(1)),
    ("idelta", 1, Some(1)),
    ("increase", 1, Some(1)),
    ("irate", 1, Some(1)),
    ("label_join", 4, None),
    ("label_replace", 5, Some(5)),
    ("ln", 1, Some(1)),
    ("log10", 1, Some(1)),
    ("log2", 1, Some(1)),
    ("max_over_time", 1, Some(1)),
    ("min_over_time", 1, Some(1)),
    ("minute", 0, Some(1)),
    ("month", 0, Some(1)),
    ("predict_linear", 2, Some(2)),
    ("quantile_over_time", 2, Some(2)),
    ("rate", 1, Some(1)),
    ("resets", 1, Some(1)),
    ("round", 1, Some(2)),
    ("scalar", 1, Some(1)),
    ("sort", 1, Some(1)),
    ("sort_desc", 1, Some(1)),
    ("sqrt", 1, Some(1)),
    ("stddev_over_time", 1, Some(1)),
    ("stdvar_over_time", 1, Some(1)),
    ("sum_over_time", 1, Some(1)),
    ("time", 0, Some(0)),
    ("timestamp", 1, Some(1)),
    ("vector", 1, Some(1)),
    ("year", 0, Some(1)),
];

/// Look up a function's arity bounds.
pub fn function_arity(name: &str) -> Option<(usize, Option<usize>)> {
    FUNCTIONS
        .iter()
        .find(|(n, _, _)| *n == name)
        .map(|(_, min, max)| (*min, *max))
}

/// Instant vector selector: `http_requests_total{job="api"} offset 5m`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorSelector {
    pub name: Option<String>,
    pub matchers: Matchers,
    /// Offset in seconds, 0 when absent.
    pub offset: u64,
}

/// Range vector selector: `http_requests_total[5m]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixSelector {
    pub vs: VectorSelector,
    /// Range in seconds.
    pub range: u64,
    /// Offset in seconds, 0 when absent.
    pub offset: u64,
}

/// Subquery: `rate(x[5m])[30m:1m]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubqueryExpr {
    pub expr: Box<Expr>,
    /// Range in seconds.
    pub range: u64,
    /// Step in seconds; `None` means the evaluator's default interval.
    pub step: Option<u64>,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Minus,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plus => write!(f, "+"),
            Self::Minus => write!(f, "-"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnaryExpr {
    pub op: UnaryOp,
    pub expr: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryExpr {
    pub op: BinOp,
    pub lhs: Box<Expr>,
    pub rhs: Box<Expr>,
    /// `bool` modifier: comparisons emit 0/1 instead of filtering.
    pub return_bool: bool,
    /// `None` means default one-to-one matching on all labels.
    pub matching: Option<VectorMatching>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateExpr {
    pub op: AggregationOp,
    pub modifier: Option<AggregateModifier>,
    /// Leading scalar/string parameters (`k` for topk, `q` for quantile, the
    /// label name for count_values), distinct from the grouped expression.
    pub params: Vec<Expr>,
    pub expr: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub name: String,
    pub args: Vec<Expr>,
}

/// Root expression type.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    NumberLiteral(f64),
    StringLiteral(String),
    VectorSelector(VectorSelector),
    MatrixSelector(MatrixSelector),
    Subquery(SubqueryExpr),
    Unary(UnaryExpr),
    Binary(BinaryExpr),
    Aggregate(AggregateExpr),
    Call(Call),
    Paren(Box<Expr>),
}

fn write_offset(f: &mut fmt::Formatter<'_>, offset: u64) -> fmt::Result {
    if offset > 0 {
        write!(f, " offset {offset}s")?;
    }
    Ok(())
}

impl fmt::Display for VectorSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            write!(f, "{name}")?;
        }
        if !self.matchers.is_empty() {
            write!(f, "{}", self.matchers)?;
        }
        write_offset(f, self.offset)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::NumberLiteral(n) => write!(f, "{n}"),
            Expr::StringLiteral(s) => write!(f, "{s:?}"),
            Expr::VectorSelector(vs) => write!(f, "{vs}"),
            Expr::MatrixSelector(ms) => {
                write!(f, "{}[{}s]", ms.vs, ms.range)?;
                write_offset(f, ms.offset)
            }
            Expr::Subquery(sq) => {
                write!(f, "{}[{}s:", sq.expr, sq.range)?;
                if let Some(step) = sq.step {
                    write!(f, "{step}s")?;
                }
                write!(f, "]")?;
                write_offset(f, sq.offset)
            }
            Expr::Unary(u) => write!(f, "{}{}", u.op, u.expr),
            Expr::Binary(b) => {
                write!(f, "{} {}", b.lhs, b.op)?;
                if b.return_bool {
                    write!(f, " bool")?;
                }
                if let Some(matching) = &b.matching {
                    write!(f, " {matching}")?;
                }
                write!(f, " {}", b.rhs)
            }
            Expr::Aggregate(agg) => {
                write!(f, "{}", agg.op)?;
                if let Some(modifier) = &agg.modifier {
                    write!(f, " {modifier}")?;
                }
                write!(f, " (")?;
                for param in &agg.params {
                    write!(f, "{param}, ")?;
                }
                write!(f, "{})", agg.expr)
            }
            Expr::Call(call) => {
                let args = call
                    .args
                    .iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "{}({args})", call.name)
            }
            Expr::Paren(inner) => write!(f, "({inner})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_equality() {
        let a = Expr::VectorSelector(VectorSelector {
            name: Some("up".into()),
            matchers: Matchers(vec![LabelMatcher::equal("job", "api")]),
            offset: 0,
        });
        let b = a.clone();
        assert_eq!(a, b);
    }

    #[test]
    fn matcher_display() {
        let m = LabelMatcher::not_equal("job", "api");
        assert_eq!(m.to_string(), r#"job!="api""#);
    }

    #[test]
    fn aggregation_op_round_trip() {
        for name in ["sum", "count_values", "topk", "quantile"] {
            let op = AggregationOp::from_name(name).unwrap();
            assert_eq!(op.as_str(), name);
        }
        assert!(AggregationOp::from_name("summary").is_none());
    }

    #[test]
    fn function_table_lookup() {
        assert_eq!(function_arity("rate"), Some((1, Some(1))));
        assert_eq!(function_arity("label_join"), Some((4, None)));
        assert_eq!(function_arity("nope"), None);
    }

    #[test]
    fn precedence_ordering() {
        assert!(BinOp::Or.precedence() < BinOp::And.precedence());
        assert!(BinOp::And.precedence() < BinOp::Eql.precedence());
        assert!(BinOp::Add.precedence() < BinOp::Mul.precedence());
        assert!(BinOp::Mul.precedence() < BinOp::Pow.precedence());
        assert!(BinOp::Pow.is_right_associative());
        assert!(!BinOp::Sub.is_right_associative());
    }
}
