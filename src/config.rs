//! Metric-to-storage mapping.
//!
//! A metric name resolves to the table, columns and connection it is stored
//! under. Resolution scans an ordered rule list (first match wins), overlays
//! the rule's partial configuration on the defaults, and memoizes the result
//! per metric name for the process lifetime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;
use crate::types::TagSet;

pub const DEFAULT_CONFIG_FILE: &str = "promsql.toml";
pub const ENV_PREFIX: &str = "PROMSQL_";

/// The request context a rule or template can draw on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolveParams {
    pub metric_name: String,
    /// Equality matchers from the selector, for predicate rules that route
    /// on more than the name.
    pub labels: TagSet,
}

impl ResolveParams {
    pub fn for_metric(metric_name: impl Into<String>) -> Self {
        ResolveParams {
            metric_name: metric_name.into(),
            labels: TagSet::new(),
        }
    }
}

/// A string-valued configuration entry.
///
/// Templates substitute `{metric_name}`; derived entries are computed from
/// the full request parameters.
#[derive(Debug, Clone)]
pub enum ConfigValue {
    Literal(String),
    Template(String),
    Derived(fn(&ResolveParams) -> String),
}

impl ConfigValue {
    fn resolve(&self, params: &ResolveParams) -> String {
        match self {
            ConfigValue::Literal(s) => s.clone(),
            ConfigValue::Template(t) => t.replace("{metric_name}", &params.metric_name),
            ConfigValue::Derived(f) => f(params),
        }
    }
}

/// How a rule decides whether it applies.
pub enum RuleCheck {
    /// Matched against the metric name.
    Pattern(Regex),
    Predicate(fn(&ResolveParams) -> bool),
}

impl RuleCheck {
    fn matches(&self, params: &ResolveParams) -> bool {
        match self {
            RuleCheck::Pattern(re) => re.is_match(&params.metric_name),
            RuleCheck::Predicate(f) => f(params),
        }
    }
}

/// Partial overlay supplied by a matching rule; unset keys fall back to the
/// defaults.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverlay {
    pub table_name: Option<ConfigValue>,
    pub value_column: Option<ConfigValue>,
    pub timestamp_column: Option<ConfigValue>,
    pub tag_columns: Option<Vec<String>>,
    pub dsn: Option<ConfigValue>,
    pub look_behind: Option<Duration>,
}

pub struct ConfigRule {
    pub check: RuleCheck,
    pub overlay: ConfigOverlay,
}

/// Default storage mapping, loadable from `promsql.toml` and `PROMSQL_*`
/// environment variables (env wins over file, file over built-ins).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreDefaults {
    pub table_name: String,
    pub value_column: String,
    pub timestamp_column: String,
    pub tag_columns: Option<Vec<String>>,
    pub dsn: String,
    #[serde(with = "humantime_serde")]
    pub look_behind: Duration,
}

impl Default for StoreDefaults {
    fn default() -> Self {
        StoreDefaults {
            table_name: "{metric_name}".to_string(),
            value_column: "value".to_string(),
            timestamp_column: "timestamp".to_string(),
            tag_columns: None,
            dsn: "sqlite::memory:".to_string(),
            look_behind: Duration::from_secs(3600),
        }
    }
}

impl StoreDefaults {
    pub fn load() -> Result<Self, Error> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    pub fn load_from(path: &str) -> Result<Self, Error> {
        let defaults: StoreDefaults = Figment::from(Serialized::defaults(StoreDefaults::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()?;
        Ok(defaults)
    }
}

/// Fully resolved storage mapping for one metric name. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricConfig {
    pub table_name: String,
    pub value_column: String,
    pub timestamp_column: String,
    pub tag_columns: Option<Vec<String>>,
    pub dsn: String,
    pub look_behind: Duration,
}

/// Ordered rules over figment-loaded defaults, memoized by metric name.
pub struct ConfigResolver {
    rules: Vec<ConfigRule>,
    defaults: StoreDefaults,
    cache: Mutex<HashMap<String, Arc<MetricConfig>>>,
}

impl ConfigResolver {
    pub fn new(defaults: StoreDefaults) -> Self {
        ConfigResolver {
            rules: Vec::new(),
            defaults,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Rules are consulted in registration order; the first match wins.
    pub fn add_rule(&mut self, rule: ConfigRule) {
        self.rules.push(rule);
    }

    pub fn resolve(&self, params: &ResolveParams) -> Result<Arc<MetricConfig>, Error> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(config) = cache.get(&params.metric_name) {
            return Ok(Arc::clone(config));
        }
        let config = Arc::new(self.build(params)?);
        debug!(
            metric = %params.metric_name,
            table = %config.table_name,
            "resolved metric config"
        );
        cache.insert(params.metric_name.clone(), Arc::clone(&config));
        Ok(config)
    }

    fn build(&self, params: &ResolveParams) -> Result<MetricConfig, Error> {
        let overlay = self
            .rules
            .iter()
            .find(|rule| rule.check.matches(params))
            .map(|rule| &rule.overlay);

        let resolve_key = |key: &str, value: Option<&ConfigValue>, default: &str| {
            let resolved = match value {
                Some(v) => v.resolve(params),
                None => ConfigValue::Template(default.to_string()).resolve(params),
            };
            if resolved.is_empty() {
                Err(Error::Config {
                    key: key.to_string(),
                    metric: params.metric_name.clone(),
                })
            } else {
                Ok(resolved)
            }
        };

        let overlay_field = |f: fn(&ConfigOverlay) -> Option<&ConfigValue>| {
            overlay.and_then(f)
        };

        Ok(MetricConfig {
            table_name: resolve_key(
                "table_name",
                overlay_field(|o| o.table_name.as_ref()),
                &self.defaults.table_name,
            )?,
            value_column: resolve_key(
                "value_column",
                overlay_field(|o| o.value_column.as_ref()),
                &self.defaults.value_column,
            )?,
            timestamp_column: resolve_key(
                "timestamp_column",
                overlay_field(|o| o.timestamp_column.as_ref()),
                &self.defaults.timestamp_column,
            )?,
            tag_columns: overlay
                .and_then(|o| o.tag_columns.clone())
                .or_else(|| self.defaults.tag_columns.clone()),
            dsn: resolve_key(
                "dsn",
                overlay_field(|o| o.dsn.as_ref()),
                &self.defaults.dsn,
            )?,
            look_behind: overlay
                .and_then(|o| o.look_behind)
                .unwrap_or(self.defaults.look_behind),
        })
    }
}
