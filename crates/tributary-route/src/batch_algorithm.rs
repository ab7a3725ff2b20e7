//! Batch closing policies.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Decides when an open batch may close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchAlgorithm {
    /// Close once the batch is full and the current transaction has drained.
    #[default]
    Transactional,
    /// Close as soon as the batch is full, even mid-transaction.
    NonTransactional,
    /// Close at every transaction boundary.
    PerTransaction,
}

impl BatchAlgorithm {
    /// Returns true when a batch holding `batch_rows` rows should close after
    /// the row just added. `at_boundary` is true when the next row belongs to
    /// a different transaction (or there is no next row).
    pub fn is_batch_complete(&self, batch_rows: usize, max_batch_size: usize, at_boundary: bool) -> bool {
        match self {
            Self::Transactional => batch_rows >= max_batch_size && at_boundary,
            Self::NonTransactional => batch_rows >= max_batch_size,
            Self::PerTransaction => at_boundary,
        }
    }

    /// Whether the reader should keep transactions contiguous for this policy.
    pub fn groups_transactions(&self) -> bool {
        !matches!(self, Self::NonTransactional)
    }

    /// Configuration name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Transactional => "transactional",
            Self::NonTransactional => "nontransactional",
            Self::PerTransaction => "per_transaction",
        }
    }
}

impl FromStr for BatchAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transactional" | "default" => Ok(Self::Transactional),
            "nontransactional" | "non_transactional" => Ok(Self::NonTransactional),
            "per_transaction" => Ok(Self::PerTransaction),
            other => Err(format!("unknown batch algorithm: {other}")),
        }
    }
}

impl fmt::Display for BatchAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transactional_waits_for_boundary() {
        let algo = BatchAlgorithm::Transactional;
        assert!(!algo.is_batch_complete(2, 3, true));
        assert!(!algo.is_batch_complete(3, 3, false));
        assert!(!algo.is_batch_complete(7, 3, false));
        assert!(algo.is_batch_complete(7, 3, true));
        assert!(algo.groups_transactions());
    }

    #[test]
    fn test_nontransactional_closes_at_size() {
        let algo = BatchAlgorithm::NonTransactional;
        assert!(algo.is_batch_complete(3, 3, false));
        assert!(!algo.is_batch_complete(2, 3, true));
        assert!(!algo.groups_transactions());
    }

    #[test]
    fn test_per_transaction_closes_at_boundary() {
        let algo = BatchAlgorithm::PerTransaction;
        assert!(algo.is_batch_complete(1, 1000, true));
        assert!(!algo.is_batch_complete(5000, 1000, false));
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("default".parse::<BatchAlgorithm>().unwrap(), BatchAlgorithm::Transactional);
        assert_eq!(
            "nontransactional".parse::<BatchAlgorithm>().unwrap(),
            BatchAlgorithm::NonTransactional
        );
        assert!("bogus".parse::<BatchAlgorithm>().is_err());
        let json = serde_json::to_string(&BatchAlgorithm::PerTransaction).unwrap();
        assert_eq!(json, "\"per_transaction\"");
    }
}
