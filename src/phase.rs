//! Phase definitions and phase-file loading.
//!
//! This module provides:
//! - `PhaseId` and `PhaseSpec`, the immutable description of one unit of work
//! - `PhaseType` for coarse categorization
//! - Loading of `*.md` phase files with `+++` TOML front-matter

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::contracts::Entanglement;
use crate::gates::GateMode;

/// Identifier of a phase, unique within a nebula.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhaseId(String);

impl PhaseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PhaseId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PhaseId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for PhaseId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Coarse category of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseType {
    #[default]
    Feature,
    Bug,
    Task,
    Refactor,
    Test,
    Docs,
}

impl fmt::Display for PhaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PhaseType::Feature => "feature",
            PhaseType::Bug => "bug",
            PhaseType::Task => "task",
            PhaseType::Refactor => "refactor",
            PhaseType::Test => "test",
            PhaseType::Docs => "docs",
        };
        f.write_str(s)
    }
}

/// Lifecycle status of a phase within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    #[default]
    Waiting,
    Working,
    Gate,
    Done,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PhaseStatus::Done | PhaseStatus::Failed | PhaseStatus::Skipped
        )
    }

    /// Working or waiting at a gate.
    pub fn is_active(&self) -> bool {
        matches!(self, PhaseStatus::Working | PhaseStatus::Gate)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PhaseStatus::Waiting => "waiting",
            PhaseStatus::Working => "working",
            PhaseStatus::Gate => "gate",
            PhaseStatus::Done => "done",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for PhaseStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "waiting" => PhaseStatus::Waiting,
            "working" => PhaseStatus::Working,
            "gate" => PhaseStatus::Gate,
            "done" => PhaseStatus::Done,
            "failed" => PhaseStatus::Failed,
            "skipped" => PhaseStatus::Skipped,
            other => bail!("Unknown phase status: {}", other),
        })
    }
}

fn default_priority() -> u8 {
    2
}

/// A single schedulable unit of work. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub id: PhaseId,
    pub title: String,
    #[serde(default)]
    pub depends_on: Vec<PhaseId>,
    #[serde(default, rename = "type")]
    pub phase_type: PhaseType,
    /// Lower is more urgent; used to order dispatch among ready phases
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Markdown body handed to the agents
    #[serde(default)]
    pub body: String,
    /// Per-phase override of the review cycle ceiling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_review_cycles: Option<u32>,
    /// Per-phase override of the cost ceiling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_budget_usd: Option<f64>,
    /// Per-phase override of the gate mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateMode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub produces: Vec<Entanglement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consumes: Vec<Entanglement>,
}

impl PhaseSpec {
    /// Create a phase with defaults for everything but id, title and dependencies.
    pub fn new(id: &str, title: &str, depends_on: Vec<&str>) -> Self {
        Self {
            id: PhaseId::new(id),
            title: title.to_string(),
            depends_on: depends_on.into_iter().map(PhaseId::from).collect(),
            phase_type: PhaseType::default(),
            priority: default_priority(),
            body: String::new(),
            max_review_cycles: None,
            max_budget_usd: None,
            gate: None,
            produces: Vec::new(),
            consumes: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    pub fn with_budget(mut self, budget_usd: f64) -> Self {
        self.max_budget_usd = Some(budget_usd);
        self
    }

    pub fn with_max_cycles(mut self, cycles: u32) -> Self {
        self.max_review_cycles = Some(cycles);
        self
    }

    pub fn with_gate(mut self, gate: GateMode) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn producing(mut self, entanglement: Entanglement) -> Self {
        self.produces.push(entanglement);
        self
    }

    pub fn consuming(mut self, entanglement: Entanglement) -> Self {
        self.consumes.push(entanglement);
        self
    }

    /// Parse a phase file: `+++` TOML front-matter followed by a markdown body.
    pub fn parse(content: &str) -> Result<Self> {
        let (front, body) = split_front_matter(content)?;
        let mut spec: PhaseSpec =
            toml::from_str(front).context("Failed to parse phase front-matter")?;
        if spec.id.as_str().trim().is_empty() {
            bail!("Phase front-matter has an empty id");
        }
        if spec.body.is_empty() {
            spec.body = body.trim().to_string();
        }
        Ok(spec)
    }

    /// Load a single phase file from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read phase file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid phase file: {}", path.display()))
    }
}

fn split_front_matter(content: &str) -> Result<(&str, &str)> {
    let trimmed = content.trim_start();
    let Some(rest) = trimmed.strip_prefix("+++") else {
        bail!("Phase file must start with +++ front-matter");
    };
    let Some(end) = rest.find("\n+++") else {
        bail!("Unterminated +++ front-matter");
    };
    let front = &rest[..end];
    let body = rest[end + 4..].trim_start_matches(['\r', '\n']);
    Ok((front, body))
}

/// Load every `*.md` phase file in a nebula directory, sorted by file name.
///
/// Files without front-matter (e.g. a README) are skipped.
pub fn load_phase_dir(dir: &Path) -> Result<Vec<PhaseSpec>> {
    let pattern = dir.join("*.md").to_string_lossy().to_string();
    let mut paths: Vec<_> = glob::glob(&pattern)
        .context("Failed to read glob pattern")?
        .filter_map(|entry| entry.ok())
        .collect();
    paths.sort();

    let mut phases = Vec::new();
    for path in paths {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read phase file: {}", path.display()))?;
        if !content.trim_start().starts_with("+++") {
            tracing::debug!(path = %path.display(), "skipping markdown file without front-matter");
            continue;
        }
        let spec = PhaseSpec::parse(&content)
            .with_context(|| format!("Invalid phase file: {}", path.display()))?;
        phases.push(spec);
    }
    Ok(phases)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::EntanglementKind;
    use std::fs;
    use tempfile::tempdir;

    const AUTH_PHASE: &str = r#"+++
id = "auth"
title = "Authentication"
depends_on = ["setup"]
type = "feature"
priority = 1
max_review_cycles = 4
max_budget_usd = 2.5
gate = "review"

[[consumes]]
kind = "function"
name = "db::connect"

[[produces]]
kind = "endpoint"
name = "POST /login"
+++

Implement login.
"#;

    #[test]
    fn test_parse_front_matter() {
        let spec = PhaseSpec::parse(AUTH_PHASE).unwrap();
        assert_eq!(spec.id.as_str(), "auth");
        assert_eq!(spec.title, "Authentication");
        assert_eq!(spec.depends_on, vec![PhaseId::from("setup")]);
        assert_eq!(spec.priority, 1);
        assert_eq!(spec.max_review_cycles, Some(4));
        assert_eq!(spec.max_budget_usd, Some(2.5));
        assert_eq!(spec.gate, Some(GateMode::Review));
        assert_eq!(spec.consumes[0].kind, EntanglementKind::Function);
        assert_eq!(spec.produces[0].name, "POST /login");
        assert_eq!(spec.body, "Implement login.");
    }

    #[test]
    fn test_parse_defaults() {
        let spec = PhaseSpec::parse("+++\nid = \"a\"\ntitle = \"A\"\n+++\n").unwrap();
        assert!(spec.depends_on.is_empty());
        assert_eq!(spec.phase_type, PhaseType::Feature);
        assert_eq!(spec.priority, 2);
        assert!(spec.gate.is_none());
    }

    #[test]
    fn test_parse_missing_front_matter() {
        let err = PhaseSpec::parse("# just markdown").unwrap_err();
        assert!(err.to_string().contains("front-matter"));
    }

    #[test]
    fn test_parse_unterminated_front_matter() {
        let err = PhaseSpec::parse("+++\nid = \"a\"\n").unwrap_err();
        assert!(err.to_string().contains("Unterminated"));
    }

    #[test]
    fn test_load_phase_dir_sorted_and_skips_plain_markdown() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("02-auth.md"),
            "+++\nid = \"auth\"\ntitle = \"Auth\"\ndepends_on = [\"setup\"]\n+++\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("01-setup.md"),
            "+++\nid = \"setup\"\ntitle = \"Setup\"\n+++\n",
        )
        .unwrap();
        fs::write(dir.path().join("README.md"), "# Notes").unwrap();

        let phases = load_phase_dir(dir.path()).unwrap();
        assert_eq!(phases.len(), 2);
        assert_eq!(phases[0].id.as_str(), "setup");
        assert_eq!(phases[1].id.as_str(), "auth");
    }

    #[test]
    fn test_phase_id_display_and_order() {
        let a = PhaseId::from("a");
        let b = PhaseId::from("b");
        assert!(a < b);
        assert_eq!(a.to_string(), "a");
    }

    #[test]
    fn test_phase_status_round_trips_through_str() {
        for status in [
            PhaseStatus::Waiting,
            PhaseStatus::Working,
            PhaseStatus::Gate,
            PhaseStatus::Done,
            PhaseStatus::Failed,
            PhaseStatus::Skipped,
        ] {
            assert_eq!(status.to_string().parse::<PhaseStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<PhaseStatus>().is_err());
        assert!(PhaseStatus::Skipped.is_terminal());
        assert!(PhaseStatus::Gate.is_active());
    }
}
