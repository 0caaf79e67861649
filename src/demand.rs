//! Demand limiting
//!
//! Translates a bounded consumer request (`first`, `take(n)`) into the row
//! count hint handed to the source, reconciled against any limit the query
//! already carries.

use std::fmt;

/// How many rows the consumer wants from a perform cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Demand {
    /// Everything the source naturally produces
    #[default]
    Unbounded,
    /// Stop after this many rows
    Limit(usize),
}

impl Demand {
    pub fn is_bounded(self) -> bool {
        matches!(self, Demand::Limit(_))
    }

    pub fn as_limit(self) -> Option<usize> {
        match self {
            Demand::Unbounded => None,
            Demand::Limit(n) => Some(n),
        }
    }

    /// Whether `rows` buffered rows already meet this demand
    pub fn is_met_by(self, rows: usize) -> bool {
        match self {
            Demand::Unbounded => false,
            Demand::Limit(n) => rows >= n,
        }
    }

    /// Effective hint for the source given the query's configured limit.
    ///
    /// The tighter of the two bounds wins: a configured limit is never relaxed
    /// and the consumer's bound is never ignored.
    pub fn reconcile(self, configured: Option<usize>) -> Demand {
        match (self, configured) {
            (Demand::Unbounded, None) => Demand::Unbounded,
            (Demand::Unbounded, Some(limit)) => Demand::Limit(limit),
            (Demand::Limit(n), None) => Demand::Limit(n),
            (Demand::Limit(n), Some(limit)) => Demand::Limit(n.min(limit)),
        }
    }
}

impl fmt::Display for Demand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Demand::Unbounded => write!(f, "unbounded"),
            Demand::Limit(n) => write!(f, "limit {}", n),
        }
    }
}
