//! Delivery units pushed by a query source

use crate::error::SourceError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Aggregate information attached to a successful completion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Authoritative total reported by the producer, independent of delivered rows
    pub total_rows: Option<u64>,
    /// Any further producer fields (timings, warnings, ...)
    #[serde(default)]
    pub extra: Value,
}

impl Metadata {
    pub fn with_total(total_rows: u64) -> Self {
        Self {
            total_rows: Some(total_rows),
            extra: Value::Null,
        }
    }

    pub fn extra(mut self, extra: Value) -> Self {
        self.extra = extra;
        self
    }
}

/// Kind tag of a [`Sentinel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SentinelKind {
    Row,
    Final,
    Error,
}

impl fmt::Display for SentinelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SentinelKind::Row => write!(f, "row"),
            SentinelKind::Final => write!(f, "final"),
            SentinelKind::Error => write!(f, "error"),
        }
    }
}

/// One delivery from a source: a row, or one of the two terminal shapes
#[derive(Debug, Clone, PartialEq)]
pub enum Sentinel<I> {
    Row(I),
    Final(Metadata),
    Error(SourceError),
}

impl<I> Sentinel<I> {
    pub fn kind(&self) -> SentinelKind {
        match self {
            Sentinel::Row(_) => SentinelKind::Row,
            Sentinel::Final(_) => SentinelKind::Final,
            Sentinel::Error(_) => SentinelKind::Error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Sentinel::Row(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_reads_producer_json() {
        let meta: Metadata =
            serde_json::from_value(json!({ "total_rows": 42, "extra": { "took_ms": 3 } })).unwrap();
        assert_eq!(meta.total_rows, Some(42));
        assert_eq!(meta.extra["took_ms"], 3);

        let bare: Metadata = serde_json::from_value(json!({ "total_rows": null })).unwrap();
        assert_eq!(bare, Metadata::default());
    }

    #[test]
    fn only_rows_are_non_terminal() {
        let error = Sentinel::<u8>::Error(SourceError::new("x"));
        assert!(!Sentinel::Row(1u8).is_terminal());
        assert!(Sentinel::<u8>::Final(Metadata::with_total(0).extra(json!("done"))).is_terminal());
        assert!(error.is_terminal());
        assert_eq!(error.kind().to_string(), "error");
    }
}
