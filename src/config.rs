//! Configuration for a nebula, read from `nebula.toml` in the nebula directory.
//!
//! Settings are layered: file → environment → CLI.
//!
//! ```toml
//! [nebula]
//! name = "checkout"
//! description = "Checkout flow rewrite"
//!
//! [defaults]
//! max_review_cycles = 3
//! max_budget_usd = 5.0
//! gate = "trust"
//!
//! [execution]
//! max_workers = 2
//! tick_interval_ms = 500
//!
//! [agent]
//! command = "claude"
//! args = ["--print", "--output-format", "stream-json", "--verbose"]
//!
//! [phases.overrides."db-*"]
//! gate = "review"
//! max_budget_usd = 10.0
//! ```

use crate::gates::GateMode;
use crate::orchestrator::{CommandAgent, StateManager};
use crate::phase::{PhaseSpec, load_phase_dir};
use crate::plan::{ExecutionPlanner, PhaseDefaults};
use crate::scheduler::SchedulerConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "nebula.toml";
/// Run-time directory inside the nebula directory.
pub const RUNTIME_DIR: &str = ".nebula";

pub const ENV_AGENT_CMD: &str = "NEBULA_AGENT_CMD";
pub const ENV_MAX_WORKERS: &str = "NEBULA_MAX_WORKERS";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NebulaSection {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsSection {
    #[serde(default = "default_max_review_cycles")]
    pub max_review_cycles: u32,
    #[serde(default = "default_max_budget_usd")]
    pub max_budget_usd: f64,
    #[serde(default)]
    pub gate: GateMode,
}

fn default_max_review_cycles() -> u32 {
    3
}

fn default_max_budget_usd() -> f64 {
    5.0
}

impl Default for DefaultsSection {
    fn default() -> Self {
        Self {
            max_review_cycles: default_max_review_cycles(),
            max_budget_usd: default_max_budget_usd(),
            gate: GateMode::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSection {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_max_workers() -> usize {
    2
}

fn default_tick_interval_ms() -> u64 {
    500
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Agent executable; `NEBULA_AGENT_CMD` wins over this
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    /// Where agents run, relative to the nebula directory
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_agent_args() -> Vec<String> {
    ["--print", "--output-format", "stream-json", "--verbose"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: None,
            args: default_agent_args(),
            working_dir: None,
        }
    }
}

/// Settings applied to every phase whose id matches a glob pattern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseOverride {
    #[serde(default)]
    pub max_review_cycles: Option<u32>,
    #[serde(default)]
    pub max_budget_usd: Option<f64>,
    #[serde(default)]
    pub gate: Option<GateMode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhasesSection {
    #[serde(default)]
    pub overrides: BTreeMap<String, PhaseOverride>,
}

/// Parsed `nebula.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NebulaToml {
    #[serde(default)]
    pub nebula: NebulaSection,
    #[serde(default)]
    pub defaults: DefaultsSection,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub phases: PhasesSection,
}

impl NebulaToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse nebula.toml")
    }

    /// Load `nebula.toml` from `dir`, or defaults if there is none.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn phase_defaults(&self) -> PhaseDefaults {
        PhaseDefaults {
            max_review_cycles: self.defaults.max_review_cycles,
            max_budget_usd: self.defaults.max_budget_usd,
            gate: self.defaults.gate,
        }
    }

    /// Fill unset per-phase settings from matching overrides. Settings in the
    /// phase file itself always win; among overrides the first pattern in
    /// lexical order wins.
    pub fn apply_overrides(&self, phases: &mut [PhaseSpec]) {
        for (pattern, over) in &self.phases.overrides {
            let Ok(matcher) = glob::Pattern::new(pattern) else {
                continue;
            };
            for spec in phases.iter_mut().filter(|s| matcher.matches(s.id.as_str())) {
                spec.max_review_cycles = spec.max_review_cycles.or(over.max_review_cycles);
                spec.max_budget_usd = spec.max_budget_usd.or(over.max_budget_usd);
                spec.gate = spec.gate.or(over.gate);
            }
        }
    }

    /// Check the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.defaults.max_review_cycles == 0 {
            warnings.push("defaults.max_review_cycles is 0; every phase would fail".to_string());
        }
        if self.defaults.max_budget_usd <= 0.0 {
            warnings.push("defaults.max_budget_usd is not positive; budgets are unlimited".to_string());
        }
        if self.execution.max_workers == 0 {
            warnings.push("execution.max_workers is 0; nothing would run".to_string());
        }
        if self.execution.tick_interval_ms < 50 {
            warnings.push(format!(
                "execution.tick_interval_ms = {} polls the intervention directory very often",
                self.execution.tick_interval_ms
            ));
        }
        for (pattern, over) in &self.phases.overrides {
            if let Err(e) = glob::Pattern::new(pattern) {
                warnings.push(format!("Invalid override pattern '{}': {}", pattern, e));
            }
            if over.max_review_cycles == Some(0) {
                warnings.push(format!(
                    "Override '{}' sets max_review_cycles to 0",
                    pattern
                ));
            }
        }

        warnings
    }
}

/// Resolved configuration for one nebula directory.
#[derive(Debug, Clone)]
pub struct NebulaConfig {
    pub nebula_dir: PathBuf,
    pub toml: NebulaToml,
    pub verbose: bool,
    /// `--yes`: never gate
    pub yes: bool,
    pub cli_max_workers: Option<usize>,
}

impl NebulaConfig {
    pub fn new(nebula_dir: PathBuf) -> Result<Self> {
        let nebula_dir = nebula_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve nebula directory {}", nebula_dir.display()))?;
        let toml = NebulaToml::load_or_default(&nebula_dir)?;
        Ok(Self {
            nebula_dir,
            toml,
            verbose: false,
            yes: false,
            cli_max_workers: None,
        })
    }

    pub fn with_cli_args(
        nebula_dir: PathBuf,
        verbose: bool,
        yes: bool,
        max_workers: Option<usize>,
    ) -> Result<Self> {
        let mut config = Self::new(nebula_dir)?;
        config.verbose = verbose;
        config.yes = yes;
        config.cli_max_workers = max_workers;
        Ok(config)
    }

    /// Nebula name: `[nebula] name`, else the directory name.
    pub fn name(&self) -> String {
        self.toml.nebula.name.clone().unwrap_or_else(|| {
            self.nebula_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "nebula".to_string())
        })
    }

    /// Agent command (env → file → "claude").
    pub fn agent_command(&self) -> String {
        resolve_agent_command(&self.toml, std::env::var(ENV_AGENT_CMD).ok())
    }

    /// Worker limit (CLI → env → file).
    pub fn max_workers(&self) -> usize {
        resolve_max_workers(
            &self.toml,
            std::env::var(ENV_MAX_WORKERS).ok(),
            self.cli_max_workers,
        )
    }

    pub fn gate_override(&self) -> Option<GateMode> {
        self.yes.then_some(GateMode::Trust)
    }

    pub fn working_dir(&self) -> PathBuf {
        match &self.toml.agent.working_dir {
            Some(dir) => self.nebula_dir.join(dir),
            None => self.nebula_dir.clone(),
        }
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.nebula_dir.join(RUNTIME_DIR)
    }

    pub fn state_file(&self) -> PathBuf {
        self.runtime_dir().join("state")
    }

    pub fn plan_file(&self) -> PathBuf {
        self.runtime_dir().join("plan.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.runtime_dir().join("logs")
    }

    /// Phase files of this nebula with overrides applied.
    pub fn load_phases(&self) -> Result<Vec<PhaseSpec>> {
        let mut phases = load_phase_dir(&self.nebula_dir)?;
        self.toml.apply_overrides(&mut phases);
        Ok(phases)
    }

    pub fn planner(&self) -> ExecutionPlanner {
        ExecutionPlanner::new(&self.name()).with_defaults(self.toml.phase_defaults())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_workers: self.max_workers(),
            tick_interval: Duration::from_millis(self.toml.execution.tick_interval_ms),
            intervention_dir: self.runtime_dir(),
            gate_override: self.gate_override(),
        }
    }

    pub fn state_manager(&self) -> StateManager {
        StateManager::new(self.state_file())
    }

    pub fn agent(&self) -> CommandAgent {
        CommandAgent::new(
            &self.agent_command(),
            self.toml.agent.args.clone(),
            self.working_dir(),
        )
        .with_log_dir(self.log_dir().join("agents"))
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

fn resolve_agent_command(toml: &NebulaToml, env: Option<String>) -> String {
    env.filter(|v| !v.trim().is_empty())
        .or_else(|| toml.agent.command.clone())
        .unwrap_or_else(|| "claude".to_string())
}

fn resolve_max_workers(toml: &NebulaToml, env: Option<String>, cli: Option<usize>) -> usize {
    let env = env.and_then(|v| match v.trim().parse::<usize>() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(value = %v, "ignoring invalid {}", ENV_MAX_WORKERS);
            None
        }
    });
    cli.or(env).unwrap_or(toml.execution.max_workers).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_parse_empty_uses_defaults() {
        let toml = NebulaToml::parse("").unwrap();
        assert_eq!(toml.defaults.max_review_cycles, 3);
        assert_eq!(toml.defaults.max_budget_usd, 5.0);
        assert_eq!(toml.defaults.gate, GateMode::Trust);
        assert_eq!(toml.execution.max_workers, 2);
        assert_eq!(toml.execution.tick_interval_ms, 500);
        assert_eq!(toml.agent.args[0], "--print");
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_parse_full() {
        let toml = NebulaToml::parse(
            r#"
[nebula]
name = "checkout"

[defaults]
max_review_cycles = 5
gate = "approve"

[execution]
max_workers = 4

[agent]
command = "my-agent"
args = []

[phases.overrides."db-*"]
max_budget_usd = 10.0
"#,
        )
        .unwrap();
        assert_eq!(toml.nebula.name.as_deref(), Some("checkout"));
        assert_eq!(toml.defaults.max_review_cycles, 5);
        assert_eq!(toml.defaults.max_budget_usd, 5.0);
        assert_eq!(toml.defaults.gate, GateMode::Approve);
        assert_eq!(toml.execution.max_workers, 4);
        assert!(toml.agent.args.is_empty());
        assert_eq!(toml.phases.overrides["db-*"].max_budget_usd, Some(10.0));
    }

    #[test]
    fn test_overrides_fill_only_unset_fields() {
        let toml = NebulaToml::parse(
            r#"
[phases.overrides."db-*"]
max_budget_usd = 10.0
gate = "review"
"#,
        )
        .unwrap();
        let mut phases = vec![
            PhaseSpec::new("db-schema", "Schema", vec![]),
            PhaseSpec::new("db-seed", "Seed", vec![]).with_budget(1.0),
            PhaseSpec::new("api", "API", vec![]),
        ];
        toml.apply_overrides(&mut phases);

        assert_eq!(phases[0].max_budget_usd, Some(10.0));
        assert_eq!(phases[0].gate, Some(GateMode::Review));
        assert_eq!(phases[1].max_budget_usd, Some(1.0));
        assert_eq!(phases[2].max_budget_usd, None);
        assert_eq!(phases[2].gate, None);
    }

    #[test]
    fn test_validate_warns() {
        let toml = NebulaToml::parse(
            r#"
[execution]
max_workers = 0

[phases.overrides."[bad"]
max_review_cycles = 0
"#,
        )
        .unwrap();
        let warnings = toml.validate();
        assert!(warnings.iter().any(|w| w.contains("max_workers")));
        assert!(warnings.iter().any(|w| w.contains("Invalid override pattern")));
        assert!(warnings.iter().any(|w| w.contains("sets max_review_cycles to 0")));
    }

    #[test]
    fn test_agent_command_layering() {
        let mut toml = NebulaToml::default();
        assert_eq!(resolve_agent_command(&toml, None), "claude");
        toml.agent.command = Some("file-agent".into());
        assert_eq!(resolve_agent_command(&toml, None), "file-agent");
        assert_eq!(
            resolve_agent_command(&toml, Some("env-agent".into())),
            "env-agent"
        );
        assert_eq!(resolve_agent_command(&toml, Some("  ".into())), "file-agent");
    }

    #[test]
    fn test_max_workers_layering() {
        let toml = NebulaToml::default();
        assert_eq!(resolve_max_workers(&toml, None, None), 2);
        assert_eq!(resolve_max_workers(&toml, Some("6".into()), None), 6);
        assert_eq!(resolve_max_workers(&toml, Some("6".into()), Some(3)), 3);
        assert_eq!(resolve_max_workers(&toml, Some("lots".into()), None), 2);
        assert_eq!(resolve_max_workers(&toml, None, Some(0)), 1);
    }

    #[test]
    fn test_config_paths_and_name() {
        let dir = tempdir().unwrap();
        let nebula_dir = dir.path().join("checkout");
        fs::create_dir_all(&nebula_dir).unwrap();

        let config = NebulaConfig::new(nebula_dir.clone()).unwrap();
        let root = nebula_dir.canonicalize().unwrap();
        assert_eq!(config.name(), "checkout");
        assert_eq!(config.state_file(), root.join(".nebula/state"));
        assert_eq!(config.plan_file(), root.join(".nebula/plan.json"));
        assert_eq!(config.scheduler_config().intervention_dir, root.join(".nebula"));
        assert_eq!(config.gate_override(), None);
    }

    #[test]
    fn test_config_loads_phases_with_overrides() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "[nebula]\nname = \"demo\"\n\n[phases.overrides.\"*\"]\nmax_review_cycles = 7\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("01-setup.md"),
            "+++\nid = \"setup\"\ntitle = \"Setup\"\n+++\nDo it.\n",
        )
        .unwrap();

        let config = NebulaConfig::with_cli_args(dir.path().to_path_buf(), false, true, None).unwrap();
        assert_eq!(config.name(), "demo");
        assert_eq!(config.gate_override(), Some(GateMode::Trust));
        let phases = config.load_phases().unwrap();
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].max_review_cycles, Some(7));
    }

    #[test]
    fn test_missing_dir_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(NebulaConfig::new(dir.path().join("nope")).is_err());
    }
}
