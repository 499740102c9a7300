//! A PromQL-flavored query language over tabular relational stores.
//!
//! Query text is tokenized and parsed into an expression tree, leaf
//! selectors are mapped to their storage tables by ordered configuration
//! rules, compiled into bounded single-table SQL, and the fetched rows are
//! realigned onto a fixed time grid before the vector-matching and
//! aggregation semantics are applied.

pub mod aggregation;
pub mod ast;
pub mod compile;
pub mod config;
pub mod error;
pub mod eval;
pub mod lexer;
pub mod matching;
pub mod parser;
pub mod realign;
pub mod store;
pub mod types;

pub use error::Error;
pub use eval::{Evaluator, Value};
pub use parser::parse;
