//! Interactive query shell.
//!
//! Reads one query per line, evaluates it at the current instant against the
//! configured store, and prints the result or a one-line error. `\ast <query>`
//! prints the parsed tree without evaluating, `\json <query>` renders the
//! result as JSON. EOF exits.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use promsql::config::{ConfigResolver, StoreDefaults};
use promsql::eval::{Evaluator, Value};
use promsql::parse;
use promsql::store::{MetricStore, SqlStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let defaults = StoreDefaults::load()?;
    let resolver = Arc::new(ConfigResolver::new(defaults));
    let store: Arc<dyn MetricStore> = Arc::new(SqlStore::new());
    let evaluator = Evaluator::new(resolver, store);

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut line = String::new();
    loop {
        print!("promsql> ");
        stdout.flush()?;
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        if let Some(query) = input.strip_prefix("\\ast ") {
            match parse(query) {
                Ok(expr) => println!("{expr:#?}"),
                Err(err) => println!("error: {err}"),
            }
            continue;
        }

        let (as_json, query) = match input.strip_prefix("\\json ") {
            Some(rest) => (true, rest),
            None => (false, input),
        };
        let expr = match parse(query) {
            Ok(expr) => expr,
            Err(err) => {
                println!("error: {err}");
                continue;
            }
        };
        let at = chrono::Utc::now().timestamp();
        match evaluator.eval_instant(&expr, at).await {
            Ok(value) => print_value(&value, as_json)?,
            Err(err) => println!("error: {err}"),
        }
    }
    Ok(())
}

fn print_value(value: &Value, as_json: bool) -> Result<()> {
    if as_json {
        let rendered = match value {
            Value::Scalar(v) => serde_json::to_string_pretty(v)?,
            Value::String(s) => serde_json::to_string_pretty(s)?,
            Value::Vector(samples) => serde_json::to_string_pretty(samples)?,
            Value::Matrix(series) => serde_json::to_string_pretty(series)?,
        };
        println!("{rendered}");
        return Ok(());
    }
    match value {
        Value::Scalar(v) => println!("{v}"),
        Value::String(s) => println!("{s:?}"),
        Value::Vector(samples) if samples.is_empty() => println!("no data"),
        Value::Vector(samples) => {
            for sample in samples {
                println!("{sample}");
            }
        }
        Value::Matrix(series) if series.is_empty() => println!("no data"),
        Value::Matrix(series) => {
            for s in series {
                println!("{s}");
            }
        }
    }
    Ok(())
}
