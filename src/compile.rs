//! Selector-to-SQL compilation.
//!
//! Each leaf selector becomes one bounded single-table SELECT. Label
//! matchers turn into equality/inequality predicates; regex matchers are
//! accepted by the grammar but have no relational equivalent and fail here.

use tracing::debug;

use crate::ast::{MatcherOp, Matchers};
use crate::config::MetricConfig;
use crate::error::Error;
use crate::types::Window;

/// One compiled label predicate, kept in structured form alongside the SQL
/// so non-SQL stores can apply it directly.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelPredicate {
    pub column: String,
    pub op: MatcherOp,
    pub value: String,
}

impl LabelPredicate {
    pub fn matches(&self, value: &str) -> bool {
        match self.op {
            MatcherOp::Equal => value == self.value,
            MatcherOp::NotEqual => value != self.value,
            MatcherOp::RegexMatch | MatcherOp::RegexNotMatch => false,
        }
    }
}

/// A bounded single-table selection for one metric.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub table_name: String,
    pub timestamp_column: String,
    pub value_column: String,
    pub tag_columns: Option<Vec<String>>,
    /// Connection string of the store holding the table.
    pub dsn: String,
    pub predicates: Vec<LabelPredicate>,
    /// Offset-shifted evaluation window, unix seconds, inclusive.
    pub window: Window,
}

/// Compile a selector against its resolved storage mapping.
///
/// The timestamp predicate covers `[window.start - offset, window.end - offset]`.
pub fn compile(
    config: &MetricConfig,
    matchers: &Matchers,
    window: Window,
    offset: u64,
) -> Result<CompiledQuery, Error> {
    // saturate rather than wrap for offsets beyond the representable range
    let offset = i64::try_from(offset).unwrap_or(i64::MAX);
    let window = Window {
        start: window.start.saturating_sub(offset),
        end: window.end.saturating_sub(offset),
    };

    let mut predicates = Vec::new();
    for matcher in matchers.iter() {
        match matcher.op {
            MatcherOp::Equal | MatcherOp::NotEqual => predicates.push(LabelPredicate {
                column: matcher.name.clone(),
                op: matcher.op,
                value: matcher.value.clone(),
            }),
            MatcherOp::RegexMatch | MatcherOp::RegexNotMatch => {
                return Err(Error::UnsupportedOperator { op: matcher.op });
            }
        }
    }

    let ts = &config.timestamp_column;
    let projection = match &config.tag_columns {
        // Explicit tag set: rename into the canonical value/timestamp shape.
        Some(tags) => {
            let mut columns = vec![
                format!("{ts} AS timestamp"),
                format!("{} AS value", config.value_column),
            ];
            columns.extend(tags.iter().cloned());
            columns.join(", ")
        }
        // No tag set configured: every column except value/timestamp is a tag.
        None => "*".to_string(),
    };

    let mut sql = format!(
        "SELECT {projection} FROM {table} WHERE {ts} >= {start} AND {ts} <= {end}",
        table = config.table_name,
        start = window.start,
        end = window.end,
    );
    for p in &predicates {
        let op = match p.op {
            MatcherOp::Equal => "=",
            _ => "!=",
        };
        sql.push_str(&format!(
            " AND {} {} '{}'",
            p.column,
            op,
            p.value.replace('\'', "''")
        ));
    }
    sql.push_str(&format!(" ORDER BY {ts}"));

    debug!(table = %config.table_name, %sql, "compiled selector");
    Ok(CompiledQuery {
        sql,
        table_name: config.table_name.clone(),
        timestamp_column: config.timestamp_column.clone(),
        value_column: config.value_column.clone(),
        tag_columns: config.tag_columns.clone(),
        dsn: config.dsn.clone(),
        predicates,
        window,
    })
}
