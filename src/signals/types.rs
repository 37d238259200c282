//! Signal types agents can emit in their output.

use crate::agent::AgentRole;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Category of a discovery raised by an agent mid-phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryKind {
    Blocker,
    Ambiguity,
    FileConflict,
    MissingDependency,
    BudgetAlert,
    Note,
}

impl DiscoveryKind {
    /// Blocking kinds need a human answer before the phase continues.
    pub fn is_blocking(&self) -> bool {
        matches!(self, DiscoveryKind::Blocker | DiscoveryKind::Ambiguity)
    }

    /// Kinds a human should hear about even when the phase keeps going.
    pub fn is_hail_worthy(&self) -> bool {
        !matches!(self, DiscoveryKind::Note)
    }
}

impl fmt::Display for DiscoveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiscoveryKind::Blocker => "blocker",
            DiscoveryKind::Ambiguity => "ambiguity",
            DiscoveryKind::FileConflict => "file_conflict",
            DiscoveryKind::MissingDependency => "missing_dependency",
            DiscoveryKind::BudgetAlert => "budget_alert",
            DiscoveryKind::Note => "note",
        };
        f.write_str(s)
    }
}

impl FromStr for DiscoveryKind {
    type Err = String;

    /// Accepts snake_case or kebab-case, case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "blocker" => Ok(DiscoveryKind::Blocker),
            "ambiguity" => Ok(DiscoveryKind::Ambiguity),
            "file_conflict" => Ok(DiscoveryKind::FileConflict),
            "missing_dependency" => Ok(DiscoveryKind::MissingDependency),
            "budget_alert" => Ok(DiscoveryKind::BudgetAlert),
            "note" => Ok(DiscoveryKind::Note),
            other => Err(format!("unknown discovery kind: {}", other)),
        }
    }
}

/// Something an agent found that a human may need to know about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discovery {
    pub kind: DiscoveryKind,
    pub detail: String,
    pub source_role: AgentRole,
    pub cycle: u32,
}

impl Discovery {
    pub fn new(kind: DiscoveryKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            source_role: AgentRole::Coder,
            cycle: 0,
        }
    }

    pub fn with_source(mut self, role: AgentRole, cycle: u32) -> Self {
        self.source_role = role;
        self.cycle = cycle;
        self
    }

    pub fn is_blocking(&self) -> bool {
        self.kind.is_blocking()
    }
}

impl fmt::Display for Discovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.detail)
    }
}

/// All signals extracted from one agent response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentSignals {
    /// Discoveries in order of appearance
    pub discoveries: Vec<Discovery>,
    /// Last `<verdict>` seen, if any
    pub verdict: Option<bool>,
    pub issues: Vec<String>,
}

impl AgentSignals {
    pub fn has_signals(&self) -> bool {
        !self.discoveries.is_empty() || self.verdict.is_some() || !self.issues.is_empty()
    }

    /// The most urgent discovery: the first blocking one, else the first one.
    pub fn primary_discovery(&self) -> Option<&Discovery> {
        self.discoveries
            .iter()
            .find(|d| d.is_blocking())
            .or_else(|| self.discoveries.first())
    }

    pub fn issue_count(&self) -> u32 {
        self.issues.len() as u32
    }

    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(approved) = self.verdict {
            parts.push(if approved { "approved" } else { "changes requested" }.to_string());
        }
        if !self.issues.is_empty() {
            parts.push(format!(
                "{} issue{}",
                self.issues.len(),
                if self.issues.len() == 1 { "" } else { "s" }
            ));
        }
        if !self.discoveries.is_empty() {
            parts.push(format!(
                "{} discover{}",
                self.discoveries.len(),
                if self.discoveries.len() == 1 { "y" } else { "ies" }
            ));
        }
        parts.join(", ")
    }
}
