//! Pipeline definition files.
//!
//! A pipeline is declared in TOML:
//!
//! ```toml
//! name = "deploy"
//!
//! [settings]
//! max_parallel = 2
//! default_timeout_secs = 900
//!
//! [env]
//! REGISTRY = "ghcr.io/acme"
//!
//! [[gates]]
//! name = "no-open-release-pr"
//! type = "no_open_pull_request"
//! events = ["pull_request", "merge_queue"]
//! head_prefix = "release/"
//!
//! [[stages]]
//! id = "lint"
//! run = "make lint"
//!
//! [[stages]]
//! id = "test"
//! depends_on = ["lint"]
//! run = ["cargo", "test", "--workspace"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::{ActionRef, ConfigError, ShiplineError, StageSpec};
use crate::executor::DEFAULT_MAX_OUTPUT_BYTES;
use crate::gate::{Gate, GateSet};
use crate::graph::StageGraph;

fn default_max_parallel() -> usize {
    4
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

/// Engine tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    /// Upper bound on concurrently running stages.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Timeout for stages without their own; zero disables it.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Skip every later batch once a stage failed. When false only the
    /// failed stage's dependents are skipped.
    #[serde(default = "default_true")]
    pub halt_on_failure: bool,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Per-stream ceiling for captured output.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Stop gate evaluation at the first deny.
    #[serde(default)]
    pub gate_fail_fast: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            default_timeout_secs: default_timeout_secs(),
            halt_on_failure: true,
            working_dir: None,
            max_output_bytes: default_max_output_bytes(),
            gate_fail_fast: false,
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "max_parallel".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_output_bytes == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "max_output_bytes".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Command of a stage: an argv list, or a shell line run through `sh -c`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandDef {
    Argv(Vec<String>),
    Shell(String),
}

impl CommandDef {
    pub fn to_action(&self) -> ActionRef {
        match self {
            CommandDef::Argv(argv) => ActionRef::command(argv.iter().cloned()),
            CommandDef::Shell(line) => ActionRef::command(["sh", "-c", line.as_str()]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageDef {
    pub id: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub run: CommandDef,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl StageDef {
    pub fn to_spec(&self) -> Result<StageSpec, ConfigError> {
        let action = self.run.to_action();
        if self.id.trim().is_empty() {
            return Err(ConfigError::InvalidStage {
                stage: self.id.clone(),
                reason: "stage id must not be empty".to_string(),
            });
        }
        if action.is_empty() {
            return Err(ConfigError::InvalidStage {
                stage: self.id.clone(),
                reason: "run command is empty".to_string(),
            });
        }

        let mut spec = StageSpec::new(self.id.clone(), action);
        for dep in &self.depends_on {
            spec = spec.depends_on(dep.clone());
        }
        spec.env = self.env.clone();
        spec.timeout_secs = self.timeout_secs;
        Ok(spec)
    }
}

/// A complete pipeline definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub settings: EngineSettings,
    /// Pipeline-wide environment, overridden by trigger and stage variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub gates: Vec<Gate>,
    #[serde(default)]
    pub stages: Vec<StageDef>,
}

impl PipelineDefinition {
    /// Parse and validate a TOML definition.
    pub fn from_toml_str(input: &str) -> Result<Self, ShiplineError> {
        let def: PipelineDefinition = toml::from_str(input).map_err(ConfigError::from)?;
        def.validate()?;
        Ok(def)
    }

    /// Read, parse and validate a definition file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ShiplineError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    /// Check settings, gates and the stage graph.
    pub fn validate(&self) -> Result<(), ShiplineError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidSetting {
                name: "name".to_string(),
                reason: "pipeline name must not be empty".to_string(),
            }
            .into());
        }
        self.settings.validate()?;
        for gate in &self.gates {
            gate.validate()?;
        }
        self.build_graph()?.validate()?;
        Ok(())
    }

    /// Stage graph in declaration order.
    pub fn build_graph(&self) -> Result<StageGraph, ShiplineError> {
        let mut graph = StageGraph::new();
        for stage in &self.stages {
            graph.add_stage(stage.to_spec()?)?;
        }
        Ok(graph)
    }

    pub fn gate_set(&self) -> GateSet {
        GateSet {
            gates: self.gates.clone(),
            fail_fast: self.settings.gate_fail_fast,
        }
    }

    /// SHA-256 over the canonical JSON form of the definition.
    pub fn digest(&self) -> Result<String, ShiplineError> {
        let canonical = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Ok(hex::encode(hasher.finalize()))
    }
}
