//! Core identifier and state types
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Memory safety (no unsafe code)
//! - Exact arithmetic (Decimal for money and quantities)

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Underlying UUID
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(
    /// Budget identifier
    BudgetId
);
id_newtype!(
    /// Budget line identifier
    LineId
);
id_newtype!(
    /// Owning project reference
    ProjectId
);
id_newtype!(
    /// Opaque approver / validator reference, never validated here
    ApproverId
);
id_newtype!(
    /// Change order identifier
    ChangeOrderId
);

/// Budget lifecycle state
///
/// Persisted as its canonical label. Decoding accepts historical spellings
/// through `from_label`, so records written under older labels load as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
#[repr(u8)]
pub enum BudgetState {
    /// Editable, not yet approved
    Draft = 1,
    /// Approved and sealed
    Frozen = 2,
    /// Superseded or cancelled (terminal)
    Invalidated = 3,
}

impl BudgetState {
    /// Canonical label
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetState::Draft => "DRAFT",
            BudgetState::Frozen => "FROZEN",
            BudgetState::Invalidated => "INVALIDATED",
        }
    }

    /// Normalize a stored label, including historical spellings
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_uppercase().as_str() {
            "DRAFT" | "BORRADOR" | "EN_EDICION" | "EDICION" => Some(BudgetState::Draft),
            "FROZEN" | "CONGELADO" | "APROBADO" | "APPROVED" | "SEALED" | "VIGENTE" => {
                Some(BudgetState::Frozen)
            }
            "INVALIDATED" | "INVALIDADO" | "ANULADO" | "CANCELADO" | "CANCELLED" | "SUPERSEDED" => {
                Some(BudgetState::Invalidated)
            }
            _ => None,
        }
    }

    /// Check if state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, BudgetState::Invalidated)
    }
}

impl TryFrom<String> for BudgetState {
    type Error = String;

    fn try_from(label: String) -> std::result::Result<Self, Self::Error> {
        Self::from_label(&label).ok_or_else(|| format!("unknown budget state label: {}", label))
    }
}

impl From<BudgetState> for String {
    fn from(state: BudgetState) -> Self {
        state.as_str().to_string()
    }
}

impl fmt::Display for BudgetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Digest algorithm tag stored next to every seal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    /// SHA-256 over the v1 canonical form
    #[serde(rename = "SHA-256-v1")]
    Sha256V1,
    /// BLAKE3 over the v1 canonical form
    #[serde(rename = "BLAKE3-v1")]
    Blake3V1,
}

impl HashAlgorithm {
    /// Version tag
    pub fn tag(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256V1 => "SHA-256-v1",
            HashAlgorithm::Blake3V1 => "BLAKE3-v1",
        }
    }

    /// Parse from tag
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "SHA-256-v1" => Some(HashAlgorithm::Sha256V1),
            "BLAKE3-v1" => Some(HashAlgorithm::Blake3V1),
            _ => None,
        }
    }
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        HashAlgorithm::Sha256V1
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}
