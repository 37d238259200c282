use crate::phase::{PhaseId, PhaseStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// One line of the state file.
#[derive(Debug, Clone, PartialEq)]
pub struct StateEntry {
    pub phase: PhaseId,
    pub status: PhaseStatus,
    pub cycles: u32,
    pub cost_usd: f64,
    pub timestamp: DateTime<Utc>,
}

impl StateEntry {
    fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() != 5 {
            return None;
        }
        Some(StateEntry {
            phase: PhaseId::new(parts[0]),
            status: parts[1].parse().ok()?,
            cycles: parts[2].parse().unwrap_or(0),
            cost_usd: parts[3].parse().unwrap_or(0.0),
            timestamp: DateTime::parse_from_rfc3339(parts[4])
                .ok()?
                .with_timezone(&Utc),
        })
    }
}

/// Append-only run state: `phase|status|cycles|cost|timestamp` per line.
///
/// The latest line for a phase wins. Lines that do not parse are ignored.
pub struct StateManager {
    state_file: PathBuf,
}

impl StateManager {
    pub fn new(state_file: PathBuf) -> Self {
        Self { state_file }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.state_file
    }

    pub fn save(&self, phase: &PhaseId, status: PhaseStatus, cycles: u32, cost_usd: f64) -> Result<()> {
        if let Some(parent) = self.state_file.parent() {
            fs::create_dir_all(parent).context("Failed to create state directory")?;
        }
        let entry = format!(
            "{}|{}|{}|{:.6}|{}\n",
            phase,
            status,
            cycles,
            cost_usd,
            Utc::now().to_rfc3339()
        );

        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.state_file)
            .context("Failed to open state file")?
            .write_all(entry.as_bytes())
            .context("Failed to write state entry")?;

        Ok(())
    }

    pub fn get_entries(&self) -> Result<Vec<StateEntry>> {
        if !self.state_file.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.state_file).context("Failed to read state file")?;
        Ok(content.lines().filter_map(StateEntry::parse).collect())
    }

    /// Latest entry per phase.
    pub fn latest(&self) -> Result<BTreeMap<PhaseId, StateEntry>> {
        let mut latest = BTreeMap::new();
        for entry in self.get_entries()? {
            latest.insert(entry.phase.clone(), entry);
        }
        Ok(latest)
    }

    /// Phases whose latest status is `Done`.
    pub fn completed(&self) -> Result<BTreeMap<PhaseId, StateEntry>> {
        Ok(self
            .latest()?
            .into_iter()
            .filter(|(_, e)| e.status == PhaseStatus::Done)
            .collect())
    }

    pub fn reset(&self) -> Result<()> {
        if self.state_file.exists() {
            fs::remove_file(&self.state_file).context("Failed to remove state file")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_latest_entry_wins() {
        let dir = tempdir().unwrap();
        let state = StateManager::new(dir.path().join(".nebula/state"));
        state.save(&"auth".into(), PhaseStatus::Working, 0, 0.0).unwrap();
        state.save(&"auth".into(), PhaseStatus::Failed, 2, 1.25).unwrap();
        state.save(&"setup".into(), PhaseStatus::Done, 1, 0.5).unwrap();

        let latest = state.latest().unwrap();
        assert_eq!(latest.len(), 2);
        let auth = &latest[&PhaseId::from("auth")];
        assert_eq!(auth.status, PhaseStatus::Failed);
        assert_eq!(auth.cycles, 2);
        assert!((auth.cost_usd - 1.25).abs() < 1e-9);

        let completed = state.completed().unwrap();
        assert_eq!(completed.keys().collect::<Vec<_>>(), vec![&PhaseId::from("setup")]);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let state = StateManager::new(dir.path().join("state"));
        assert!(state.get_entries().unwrap().is_empty());
        state.reset().unwrap();
    }

    #[test]
    fn test_garbage_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state");
        fs::write(&path, "not a line\nx|bogus|1|0|2024-01-01T00:00:00Z\n").unwrap();
        let state = StateManager::new(path);
        state.save(&"a".into(), PhaseStatus::Done, 1, 0.0).unwrap();
        assert_eq!(state.get_entries().unwrap().len(), 1);
    }

    #[test]
    fn test_reset_removes_file() {
        let dir = tempdir().unwrap();
        let state = StateManager::new(dir.path().join("state"));
        state.save(&"a".into(), PhaseStatus::Done, 1, 0.0).unwrap();
        state.reset().unwrap();
        assert!(!state.path().exists());
    }
}
