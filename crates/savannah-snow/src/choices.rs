//! Decision status of containers and transactions.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Status {
    /// Not known to this node.
    #[default]
    Unknown,
    /// Known, but not yet decided.
    Processing,
    Rejected,
    Accepted,
}

impl Status {
    /// Whether the container's contents are available locally.
    #[must_use]
    pub fn fetched(self) -> bool {
        !matches!(self, Self::Unknown)
    }

    #[must_use]
    pub fn decided(self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "Unknown",
            Self::Processing => "Processing",
            Self::Rejected => "Rejected",
            Self::Accepted => "Accepted",
        })
    }
}
