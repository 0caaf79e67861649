//! Query options handed to a source on every perform

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Options attached to a query and passed through to its source.
///
/// `limit` and `skip` are interpreted by the stream itself (the limit is
/// reconciled with consumer demand); everything else travels in `params`
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Limit configured on the query itself
    pub limit: Option<usize>,
    /// Number of leading rows the source should skip
    pub skip: Option<usize>,
    /// Source-specific parameters
    pub params: BTreeMap<String, Value>,
}

impl QueryOptions {
    /// Create empty query options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the query's own row limit
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the number of rows to skip
    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Set a source-specific parameter
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn get_param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }
}
