//! Cross-phase interface contracts ("entanglements").
//!
//! Phases declare what they produce and consume. Once every declaration is
//! registered, the ledger reports which consumed interfaces are guaranteed by
//! dependency ordering and raises plan risks for the rest.

mod ledger;

pub use ledger::{ContractEntry, ContractLedger, ContractReport, ContractStatus};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of interface a phase exposes or depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntanglementKind {
    Function,
    Type,
    Interface,
    Endpoint,
    Schema,
    File,
    Package,
}

impl fmt::Display for EntanglementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntanglementKind::Function => "function",
            EntanglementKind::Type => "type",
            EntanglementKind::Interface => "interface",
            EntanglementKind::Endpoint => "endpoint",
            EntanglementKind::Schema => "schema",
            EntanglementKind::File => "file",
            EntanglementKind::Package => "package",
        };
        f.write_str(s)
    }
}

/// A declared interface: matched across phases by `kind` + `name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entanglement {
    pub kind: EntanglementKind,
    pub name: String,
    /// Optional signature; compared when both sides declare one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Entanglement {
    pub fn new(kind: EntanglementKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            signature: None,
        }
    }

    pub fn with_signature(mut self, signature: &str) -> Self {
        self.signature = Some(signature.to_string());
        self
    }

    /// Whether two declarations refer to the same interface.
    pub fn matches(&self, other: &Entanglement) -> bool {
        self.kind == other.kind && self.name == other.name
    }
}

impl fmt::Display for Entanglement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.name)
    }
}
