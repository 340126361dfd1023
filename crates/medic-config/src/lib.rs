//! Configuration surface for the Medic repair engine.
//!
//! Configuration is loaded from an optional TOML file, overlaid with
//! `MEDIC_*` environment variables, and validated once at startup.
//! Invalid configuration is fatal: the process should refuse to start
//! rather than limp along with a half-wired engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Configuration errors. All of these are startup-fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("missing required config key '{key}'")]
    MissingKey { key: String },

    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Which sandbox backend executes untrusted commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionBackend {
    /// Ephemeral cloud micro-VMs over the provider HTTP API.
    E2b,
    /// Long-lived local container via the Docker daemon.
    DockerLocal,
    /// Kubernetes Job with an exec-capable pod.
    Kubernetes,
    /// No isolation: commands run in a temporary directory. Tests only.
    Simulation,
}

impl ExecutionBackend {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::E2b => "e2b",
            Self::DockerLocal => "docker_local",
            Self::Kubernetes => "kubernetes",
            Self::Simulation => "simulation",
        }
    }
}

impl std::str::FromStr for ExecutionBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "e2b" => Ok(Self::E2b),
            "docker_local" => Ok(Self::DockerLocal),
            "kubernetes" => Ok(Self::Kubernetes),
            "simulation" => Ok(Self::Simulation),
            other => Err(ConfigError::InvalidValue {
                key: "execution_backend".into(),
                reason: format!("unknown backend '{other}'"),
            }),
        }
    }
}

/// LLM provider wiring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider name: "anthropic" (default SDK-style provider) or
    /// "openai_compatible" (HTTP fallback with bearer auth).
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    /// Model identifier passed through to the provider.
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Per-call deadline in seconds.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    /// Custom endpoint, required for openai_compatible.
    #[serde(default)]
    pub base_url: Option<String>,
    /// API key. May also arrive via MEDIC_LLM_API_KEY.
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_llm_provider() -> String {
    "anthropic".into()
}

fn default_llm_model() -> String {
    "claude-sonnet-4-5-20250929".into()
}

fn default_llm_timeout() -> u64 {
    300
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            timeout_secs: default_llm_timeout(),
            base_url: None,
            api_key: None,
        }
    }
}

/// Container/pod settings for the sandbox backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Image for the docker_local and kubernetes backends.
    #[serde(default = "default_sandbox_image")]
    pub image: String,
    /// Namespace for the kubernetes backend.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Micro-VM provider endpoint (e2b backend).
    #[serde(default)]
    pub vm_base_url: Option<String>,
    /// Micro-VM provider API key (e2b backend).
    #[serde(default)]
    pub vm_api_key: Option<String>,
    /// CPU quota for container backends, in whole CPUs.
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,
    /// Memory limit for container backends, in bytes.
    #[serde(default = "default_memory_limit")]
    pub memory_limit_bytes: i64,
    /// PID limit for container backends.
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
}

fn default_sandbox_image() -> String {
    "ubuntu:24.04".into()
}

fn default_namespace() -> String {
    "medic-system".into()
}

fn default_cpu_limit() -> f64 {
    1.0
}

fn default_memory_limit() -> i64 {
    2 * 1024 * 1024 * 1024
}

fn default_pids_limit() -> i64 {
    2048
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_sandbox_image(),
            namespace: default_namespace(),
            vm_base_url: None,
            vm_api_key: None,
            cpu_limit: default_cpu_limit(),
            memory_limit_bytes: default_memory_limit(),
            pids_limit: default_pids_limit(),
        }
    }
}

/// Monitoring thresholds for sandbox resource usage, in percent
/// (CPU/memory) and absolute counts (PIDs).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceThresholds {
    #[serde(default = "default_warn_pct")]
    pub cpu_warn: f64,
    #[serde(default = "default_crit_pct")]
    pub cpu_crit: f64,
    #[serde(default = "default_warn_pct")]
    pub mem_warn: f64,
    #[serde(default = "default_crit_pct")]
    pub mem_crit: f64,
    #[serde(default = "default_pids_warn")]
    pub pids_warn: u64,
    #[serde(default = "default_pids_crit")]
    pub pids_crit: u64,
}

fn default_warn_pct() -> f64 {
    80.0
}

fn default_crit_pct() -> f64 {
    95.0
}

fn default_pids_warn() -> u64 {
    1000
}

fn default_pids_crit() -> u64 {
    2000
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            cpu_warn: default_warn_pct(),
            cpu_crit: default_crit_pct(),
            mem_warn: default_warn_pct(),
            mem_crit: default_crit_pct(),
            pids_warn: default_pids_warn(),
            pids_crit: default_pids_crit(),
        }
    }
}

/// Tuning for one adaptive-threshold defense layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LayerThresholds {
    /// Current trigger threshold.
    pub threshold: f64,
    /// Lower clamp bound for adjustments.
    pub min: f64,
    /// Upper clamp bound for adjustments.
    pub max: f64,
    /// Step applied per adjustment.
    pub adjust_step: f64,
    /// Minimum events before an adjustment is trusted.
    pub min_sample: u64,
}

impl LayerThresholds {
    #[must_use]
    pub fn new(threshold: f64, min: f64, max: f64, adjust_step: f64, min_sample: u64) -> Self {
        Self {
            threshold,
            min,
            max,
            adjust_step,
            min_sample,
        }
    }
}

/// Process-wide adaptive-threshold configuration. Held hot in memory by
/// the threshold service; this is the serialized form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveThresholdsConfig {
    /// Master switch for the reliability layers.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_phase2")]
    pub phase2_reproduction: LayerThresholds,
    #[serde(default = "default_phase3_complexity")]
    pub phase3_complexity_threshold: LayerThresholds,
    #[serde(default = "default_phase3_iteration")]
    pub phase3_iteration_threshold: LayerThresholds,
}

fn default_true() -> bool {
    true
}

fn default_phase2() -> LayerThresholds {
    LayerThresholds::new(0.5, 0.1, 0.9, 0.05, 20)
}

fn default_phase3_complexity() -> LayerThresholds {
    LayerThresholds::new(7.0, 4.0, 10.0, 0.5, 20)
}

fn default_phase3_iteration() -> LayerThresholds {
    LayerThresholds::new(3.0, 2.0, 8.0, 1.0, 20)
}

impl Default for AdaptiveThresholdsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            phase2_reproduction: default_phase2(),
            phase3_complexity_threshold: default_phase3_complexity(),
            phase3_iteration_threshold: default_phase3_iteration(),
        }
    }
}

/// Loop detector tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LoopDetectorConfig {
    /// Consecutive hallucinations of the same path before a strategy
    /// shift is injected.
    #[serde(default = "default_shift_consecutive")]
    pub strategy_shift_consecutive: u32,
}

fn default_shift_consecutive() -> u32 {
    2
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            strategy_shift_consecutive: default_shift_consecutive(),
        }
    }
}

/// Top-level configuration for one engine process. The per-session copy
/// carried inside `GraphState` is this same value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairConfig {
    /// Source-host API base, e.g. "https://api.github.com".
    #[serde(default = "default_host")]
    pub host: String,
    /// Source-host token.
    #[serde(default)]
    pub token: Option<String>,
    /// Repository under repair, "owner/name".
    #[serde(default)]
    pub repo: String,
    #[serde(default = "default_backend")]
    pub execution_backend: ExecutionBackend,
    /// Iteration budget per session.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Admission cap across concurrent sessions.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_agents: usize,
    /// Pending-session queue depth before `Overloaded` is returned.
    #[serde(default = "default_queue_depth")]
    pub admission_queue_depth: usize,
    /// SQLite database URL, e.g. "sqlite://medic.db".
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub resource_thresholds: ResourceThresholds,
    #[serde(default)]
    pub adaptive_thresholds: AdaptiveThresholdsConfig,
    #[serde(default)]
    pub loop_detector: LoopDetectorConfig,
}

fn default_host() -> String {
    "https://api.github.com".into()
}

fn default_backend() -> ExecutionBackend {
    ExecutionBackend::DockerLocal
}

fn default_max_iterations() -> u32 {
    5
}

fn default_max_concurrent() -> usize {
    1
}

fn default_queue_depth() -> usize {
    32
}

fn default_database_url() -> String {
    "sqlite://medic.db".into()
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            token: None,
            repo: String::new(),
            execution_backend: default_backend(),
            max_iterations: default_max_iterations(),
            max_concurrent_agents: default_max_concurrent(),
            admission_queue_depth: default_queue_depth(),
            database_url: default_database_url(),
            llm: LlmConfig::default(),
            sandbox: SandboxConfig::default(),
            resource_thresholds: ResourceThresholds::default(),
            adaptive_thresholds: AdaptiveThresholdsConfig::default(),
            loop_detector: LoopDetectorConfig::default(),
        }
    }
}

impl RepairConfig {
    /// Load from a TOML file, then apply environment overrides and
    /// validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.apply_env(&env_map());
        config.validate()?;
        Ok(config)
    }

    /// Defaults + environment overrides, for running without a file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(&env_map());
        config.validate()?;
        Ok(config)
    }

    /// Overlay `MEDIC_*` environment variables onto the config.
    pub fn apply_env(&mut self, vars: &BTreeMap<String, String>) {
        if let Some(v) = vars.get("MEDIC_HOST") {
            self.host.clone_from(v);
        }
        if let Some(v) = vars.get("MEDIC_TOKEN") {
            self.token = Some(v.clone());
        }
        if let Some(v) = vars.get("MEDIC_REPO") {
            self.repo.clone_from(v);
        }
        if let Some(v) = vars.get("MEDIC_EXECUTION_BACKEND") {
            if let Ok(backend) = v.parse() {
                self.execution_backend = backend;
            } else {
                tracing::warn!(value = %v, "ignoring invalid MEDIC_EXECUTION_BACKEND");
            }
        }
        if let Some(v) = vars.get("MEDIC_MAX_ITERATIONS") {
            if let Ok(n) = v.parse() {
                self.max_iterations = n;
            }
        }
        if let Some(v) = vars.get("MEDIC_MAX_CONCURRENT_AGENTS") {
            if let Ok(n) = v.parse() {
                self.max_concurrent_agents = n;
            }
        }
        if let Some(v) = vars.get("MEDIC_DATABASE_URL") {
            self.database_url.clone_from(v);
        }
        if let Some(v) = vars.get("MEDIC_LLM_PROVIDER") {
            self.llm.provider.clone_from(v);
        }
        if let Some(v) = vars.get("MEDIC_LLM_MODEL") {
            self.llm.model.clone_from(v);
        }
        if let Some(v) = vars.get("MEDIC_LLM_API_KEY") {
            self.llm.api_key = Some(v.clone());
        }
        if let Some(v) = vars.get("MEDIC_LLM_BASE_URL") {
            self.llm.base_url = Some(v.clone());
        }
        if let Some(v) = vars.get("MEDIC_SANDBOX_IMAGE") {
            self.sandbox.image.clone_from(v);
        }
        if let Some(v) = vars.get("MEDIC_SANDBOX_NAMESPACE") {
            self.sandbox.namespace.clone_from(v);
        }
        if let Some(v) = vars.get("MEDIC_VM_BASE_URL") {
            self.sandbox.vm_base_url = Some(v.clone());
        }
        if let Some(v) = vars.get("MEDIC_VM_API_KEY") {
            self.sandbox.vm_api_key = Some(v.clone());
        }
    }

    /// Validate cross-field constraints. Called by the loaders; callers
    /// constructing a config by hand should call it too.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_iterations".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.max_concurrent_agents == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_concurrent_agents".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.execution_backend == ExecutionBackend::E2b
            && self.sandbox.vm_base_url.is_none()
        {
            return Err(ConfigError::MissingKey {
                key: "sandbox.vm_base_url".into(),
            });
        }
        if self.llm.provider == "openai_compatible" && self.llm.base_url.is_none() {
            return Err(ConfigError::MissingKey {
                key: "llm.base_url".into(),
            });
        }
        for (key, layer) in [
            (
                "adaptive_thresholds.phase2_reproduction",
                self.adaptive_thresholds.phase2_reproduction,
            ),
            (
                "adaptive_thresholds.phase3_complexity_threshold",
                self.adaptive_thresholds.phase3_complexity_threshold,
            ),
            (
                "adaptive_thresholds.phase3_iteration_threshold",
                self.adaptive_thresholds.phase3_iteration_threshold,
            ),
        ] {
            if layer.min > layer.max {
                return Err(ConfigError::InvalidValue {
                    key: key.into(),
                    reason: format!("min {} exceeds max {}", layer.min, layer.max),
                });
            }
            if layer.threshold < layer.min || layer.threshold > layer.max {
                return Err(ConfigError::InvalidValue {
                    key: key.into(),
                    reason: format!(
                        "threshold {} outside [{}, {}]",
                        layer.threshold, layer.min, layer.max
                    ),
                });
            }
        }
        Ok(())
    }

    /// Layer tuning by defense-layer name, if configured.
    #[must_use]
    pub fn layer_thresholds(&self, layer: &str) -> Option<LayerThresholds> {
        match layer {
            "phase2-reproduction" => Some(self.adaptive_thresholds.phase2_reproduction),
            "phase3-complexity" => Some(self.adaptive_thresholds.phase3_complexity_threshold),
            "phase3-loop-detection" | "phase3-iteration" => {
                Some(self.adaptive_thresholds.phase3_iteration_threshold)
            }
            _ => None,
        }
    }
}

fn env_map() -> BTreeMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with("MEDIC_"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_defaults_validate() {
        let config = RepairConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.max_concurrent_agents, 1);
        assert_eq!(config.execution_backend, ExecutionBackend::DockerLocal);
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!(
            "kubernetes".parse::<ExecutionBackend>().unwrap(),
            ExecutionBackend::Kubernetes
        );
        assert!("vmware".parse::<ExecutionBackend>().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RepairConfig::default();
        let mut vars = BTreeMap::new();
        vars.insert("MEDIC_MAX_ITERATIONS".to_string(), "3".to_string());
        vars.insert(
            "MEDIC_EXECUTION_BACKEND".to_string(),
            "simulation".to_string(),
        );
        vars.insert("MEDIC_LLM_MODEL".to_string(), "sonnet".to_string());
        config.apply_env(&vars);

        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.execution_backend, ExecutionBackend::Simulation);
        assert_eq!(config.llm.model, "sonnet");
    }

    #[test]
    fn test_e2b_requires_vm_url() {
        let mut config = RepairConfig {
            execution_backend: ExecutionBackend::E2b,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingKey { .. })
        ));
        config.sandbox.vm_base_url = Some("https://vm.example".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_threshold_bounds_checked() {
        let mut config = RepairConfig::default();
        config.adaptive_thresholds.phase2_reproduction.threshold = 5.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
repo = "acme/widgets"
max_iterations = 4

[llm]
model = "claude-sonnet-4-5-20250929"

[sandbox]
image = "rust:1.83"
"#
        )
        .unwrap();

        let config = RepairConfig::load(file.path()).unwrap();
        assert_eq!(config.repo, "acme/widgets");
        assert_eq!(config.max_iterations, 4);
        assert_eq!(config.sandbox.image, "rust:1.83");
    }

    #[test]
    fn test_layer_lookup() {
        let config = RepairConfig::default();
        assert!(config.layer_thresholds("phase2-reproduction").is_some());
        assert!(config.layer_thresholds("phase3-loop-detection").is_some());
        assert!(config.layer_thresholds("phase9-unknown").is_none());
    }
}
