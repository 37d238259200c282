use crate::phase::PhaseId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a plan risk. `Error` blocks apply; the rest are advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskSeverity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for RiskSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskSeverity::Info => write!(f, "info"),
            RiskSeverity::Warning => write!(f, "warning"),
            RiskSeverity::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRisk {
    pub severity: RiskSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<PhaseId>,
    pub message: String,
}

impl PlanRisk {
    pub fn new(severity: RiskSeverity, phase_id: Option<PhaseId>, message: String) -> Self {
        Self {
            severity,
            phase_id,
            message,
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == RiskSeverity::Error
    }
}
