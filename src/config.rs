use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::agent::AgentType;

/// How to launch one agent role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub command: String,
    pub args: Vec<String>,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_timeout_minutes() -> u64 {
    30
}

impl AgentSpec {
    /// Claude CLI in streaming JSON mode; the prompt goes after `-p`
    pub fn claude() -> Self {
        Self {
            command: "claude".into(),
            args: vec![
                "--dangerously-skip-permissions".into(),
                "--verbose".into(),
                "--output-format".into(),
                "stream-json".into(),
                "-p".into(),
            ],
            timeout_minutes: default_timeout_minutes(),
            model: None,
        }
    }

    /// Full argument list for a run with the given prompt
    pub fn build_args(&self, prompt: &str) -> Vec<String> {
        let mut args = Vec::with_capacity(self.args.len() + 3);
        if let Some(model) = &self.model {
            args.push("--model".into());
            args.push(model.clone());
        }
        args.extend(self.args.iter().cloned());
        args.push(prompt.to_string());
        args
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes.saturating_mul(60))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    pub coordinator: AgentSpec,
    pub worker: AgentSpec,
    pub evaluator: AgentSpec,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            coordinator: AgentSpec::claude(),
            worker: AgentSpec::claude(),
            evaluator: AgentSpec::claude(),
        }
    }
}

impl AgentsConfig {
    pub fn spec(&self, agent_type: AgentType) -> &AgentSpec {
        match agent_type {
            AgentType::Coordinator => &self.coordinator,
            AgentType::Worker => &self.worker,
            AgentType::Evaluator => &self.evaluator,
        }
    }

    /// Use the same launcher for every role
    pub fn uniform(spec: AgentSpec) -> Self {
        Self {
            coordinator: spec.clone(),
            worker: spec.clone(),
            evaluator: spec,
        }
    }
}

/// Cycle loop limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Consecutive failed cycles before the loop gives up
    pub max_consecutive_failures: u32,
    /// Extra work attempts on the same decision after a failed evaluation
    pub max_worker_retries: u32,
    /// Cycles kept in memory
    pub history_limit: usize,
    pub max_cycles: Option<u64>,
    /// Cycles included in status snapshots
    pub recent_cycles: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            max_worker_retries: 1,
            history_limit: 100,
            max_cycles: None,
            recent_cycles: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    pub capacity: usize,
    pub heartbeat_secs: u64,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            capacity: 1000,
            heartbeat_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuidanceSettings {
    pub retry_attempts: u32,
    pub retry_base_ms: u64,
}

impl Default for GuidanceSettings {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_base_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageSettings {
    /// Offset east of UTC that decides which calendar date usage falls on
    pub utc_offset_minutes: i32,
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(skip)]
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub agents: AgentsConfig,
    pub orchestrator: OrchestratorSettings,
    pub output_buffer_capacity: usize,
    pub events: EventSettings,
    pub guidance: GuidanceSettings,
    pub usage: UsageSettings,
    pub state_watch_interval_ms: u64,
    /// Time between SIGTERM and kill when an agent is stopped gracefully
    pub stop_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            state_dir: PathBuf::from(".evolution"),
            agents: AgentsConfig::default(),
            orchestrator: OrchestratorSettings::default(),
            output_buffer_capacity: 10_000,
            events: EventSettings::default(),
            guidance: GuidanceSettings::default(),
            usage: UsageSettings::default(),
            state_watch_interval_ms: 1000,
            stop_grace_ms: 2000,
        }
    }
}

impl Config {
    /// Defaults rooted at `project_root`
    pub fn for_project(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            ..Self::default()
        }
    }

    /// Load `<state_dir>/config.json`, falling back to defaults
    pub fn load(project_root: &Path) -> Result<Self> {
        let mut config = Self::for_project(project_root);
        let config_path = config.state_dir().join("config.json");
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            config = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?;
            config.project_root = project_root.to_path_buf();
        }
        Ok(config)
    }

    pub fn state_dir(&self) -> PathBuf {
        if self.state_dir.is_absolute() {
            self.state_dir.clone()
        } else {
            self.project_root.join(&self.state_dir)
        }
    }

    pub fn guidance_dir(&self) -> PathBuf {
        self.state_dir().join(".guidance")
    }

    pub fn agent_state_dir(&self) -> PathBuf {
        self.state_dir().join(".agent-state")
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.state_dir().join("prompts")
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir().join("EVOLUTION_STATE.md")
    }

    pub fn log_file(&self) -> PathBuf {
        self.state_dir().join("EVOLUTION_LOG.md")
    }

    pub fn project_file(&self) -> PathBuf {
        self.state_dir().join("EVOLUTION_PROJECT.md")
    }

    /// Files whose external edits are surfaced as events
    pub fn watched_files(&self) -> Vec<PathBuf> {
        vec![self.state_file(), self.log_file(), self.project_file()]
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.events.heartbeat_secs.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.orchestrator.max_consecutive_failures, 3);
        assert_eq!(config.output_buffer_capacity, 10_000);
        assert_eq!(config.agents.worker.command, "claude");
        assert_eq!(config.agents.worker.timeout_minutes, 30);
        assert_eq!(config.stop_grace(), Duration::from_secs(2));
    }

    #[test]
    fn test_build_args_appends_prompt_and_model() {
        let mut spec = AgentSpec::claude();
        spec.model = Some("opus".into());
        let args = spec.build_args("do the thing");

        assert_eq!(args[0], "--model");
        assert_eq!(args[1], "opus");
        assert_eq!(args.last().unwrap(), "do the thing");
        assert!(args.contains(&"stream-json".to_string()));
    }

    #[test]
    fn test_paths_are_relative_to_project_root() {
        let config = Config::for_project("/srv/project");
        assert_eq!(config.guidance_dir(), PathBuf::from("/srv/project/.evolution/.guidance"));
        assert_eq!(
            config.state_file(),
            PathBuf::from("/srv/project/.evolution/EVOLUTION_STATE.md")
        );
    }

    #[test]
    fn test_load_returns_default_when_no_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(temp_dir.path()).unwrap();
        assert_eq!(config.project_root, temp_dir.path());
        assert_eq!(config.events.heartbeat_secs, 30);
    }

    #[test]
    fn test_load_from_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let state_dir = temp_dir.path().join(".evolution");
        std::fs::create_dir_all(&state_dir).unwrap();
        let config_json = r#"{
            "agents": {
                "coordinator": { "command": "sh", "args": ["-c", "echo DONE: ok"] },
                "worker": { "command": "sh", "args": ["-c", "true"], "timeout_minutes": 5 },
                "evaluator": { "command": "sh", "args": ["-c", "echo PASSED"], "model": "haiku" }
            },
            "orchestrator": { "max_consecutive_failures": 5 },
            "usage": { "utc_offset_minutes": 540 }
        }"#;
        std::fs::write(state_dir.join("config.json"), config_json).unwrap();

        let config = Config::load(temp_dir.path()).unwrap();
        assert_eq!(config.agents.coordinator.command, "sh");
        assert_eq!(config.agents.worker.timeout_minutes, 5);
        assert_eq!(config.agents.evaluator.model.as_deref(), Some("haiku"));
        assert_eq!(config.orchestrator.max_consecutive_failures, 5);
        assert_eq!(config.orchestrator.max_worker_retries, 1);
        assert_eq!(config.usage.utc_offset_minutes, 540);
        assert_eq!(config.project_root, temp_dir.path());
    }

    #[test]
    fn test_load_rejects_malformed_config() {
        let temp_dir = TempDir::new().unwrap();
        let state_dir = temp_dir.path().join(".evolution");
        std::fs::create_dir_all(&state_dir).unwrap();
        std::fs::write(state_dir.join("config.json"), "{ not json").unwrap();

        assert!(Config::load(temp_dir.path()).is_err());
    }
}
