//! Lifecycle states of a staged resource.

use std::fmt;

/// Lifecycle state of a staged resource.
///
/// The set is open: new intermediate states may be added, so callers should
/// not match exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum StageState {
    /// A writer is accumulating payload.
    Creating,
    /// The payload is complete and may be read by any number of readers.
    Ready,
    /// Every consumer is done; the resource may be purged.
    Consumed,
}

impl StageState {
    /// File extension used for the backing file in this state.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Creating => "create",
            Self::Ready => "ready",
            Self::Consumed => "done",
        }
    }

    /// Map a backing file extension back to a state.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "create" => Some(Self::Creating),
            "ready" => Some(Self::Ready),
            "done" => Some(Self::Consumed),
            _ => None,
        }
    }

    /// Returns true once the payload is complete and readable.
    pub fn is_readable(&self) -> bool {
        matches!(self, Self::Ready | Self::Consumed)
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Creating => "creating",
            Self::Ready => "ready",
            Self::Consumed => "consumed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_round_trip() {
        for state in [StageState::Creating, StageState::Ready, StageState::Consumed] {
            assert_eq!(StageState::from_extension(state.extension()), Some(state));
        }
        assert_eq!(StageState::from_extension("tmp"), None);
    }

    #[test]
    fn test_readable_states() {
        assert!(!StageState::Creating.is_readable());
        assert!(StageState::Ready.is_readable());
        assert!(StageState::Consumed.is_readable());
    }

    #[test]
    fn test_display() {
        assert_eq!(StageState::Consumed.to_string(), "consumed");
    }
}
