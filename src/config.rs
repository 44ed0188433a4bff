use crate::error::OxideError;
use crate::types::{RoutingRule, ServiceDescriptor, ServiceKind, TaskCategory};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level, serializable configuration: service descriptors and
/// per-category routing rules. Loaded defaults → file → environment
/// overrides, in that order.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OxideConfig {
    pub services: Vec<ServiceDescriptor>,
    pub routing_rules: HashMap<TaskCategory, RoutingRule>,
    pub data_dir: Option<PathBuf>,
    pub max_parallel_workers: Option<usize>,
    pub discovery_interval_secs: Option<u64>,
    pub cluster_port: Option<u16>,
}

impl OxideConfig {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    pub fn max_parallel_workers(&self) -> usize {
        self.max_parallel_workers.unwrap_or(4)
    }

    pub fn discovery_interval_secs(&self) -> u64 {
        self.discovery_interval_secs.unwrap_or(30)
    }

    pub fn cluster_port(&self) -> u16 {
        self.cluster_port.unwrap_or(47321)
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".oxide"))
        .unwrap_or_else(|| PathBuf::from(".oxide"))
}

fn default_services() -> Vec<ServiceDescriptor> {
    vec![
        ServiceDescriptor {
            id: "ollama_local".to_string(),
            kind: ServiceKind::OllamaHttp,
            enabled: true,
            base_url: Some("http://localhost:11434".to_string()),
            default_model: None,
            executable: None,
            capabilities: vec!["text".to_string()],
            context_window_hint: Some(8192),
            api_key: None,
        },
        ServiceDescriptor {
            id: "gemini".to_string(),
            kind: ServiceKind::OpenAiHttp,
            enabled: false,
            base_url: Some("https://generativelanguage.googleapis.com/v1beta/openai".to_string()),
            default_model: Some("gemini-1.5-flash".to_string()),
            executable: None,
            capabilities: vec!["text".to_string()],
            context_window_hint: Some(1_000_000),
            api_key: None,
        },
    ]
}

/// Fluent configuration builder. `load()` applies the three
/// layers in order: compiled-in defaults, an optional config file,
/// then environment variable overrides (`OXIDE_DATA_DIR`,
/// `OXIDE_MAX_PARALLEL_WORKERS`).
pub struct ConfigBuilder {
    config: OxideConfig,
    file_path: Option<PathBuf>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: OxideConfig { services: default_services(), ..Default::default() },
            file_path: None,
        }
    }

    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = Some(dir.into());
        self
    }

    pub fn max_parallel_workers(mut self, n: usize) -> Self {
        self.config.max_parallel_workers = Some(n);
        self
    }

    pub fn service(mut self, descriptor: ServiceDescriptor) -> Self {
        self.config.services.retain(|s| s.id != descriptor.id);
        self.config.services.push(descriptor);
        self
    }

    pub fn routing_rule(mut self, category: TaskCategory, rule: RoutingRule) -> Self {
        self.config.routing_rules.insert(category, rule);
        self
    }

    pub fn load(mut self) -> Result<OxideConfig, OxideError> {
        if let Some(path) = &self.file_path {
            self.config = merge_from_file(self.config, path)?;
        }
        apply_env_overrides(&mut self.config);
        validate(&self.config)?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn merge_from_file(mut config: OxideConfig, path: &Path) -> Result<OxideConfig, OxideError> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "config file absent, using defaults");
        return Ok(config);
    }
    let contents = std::fs::read_to_string(path)
        .map_err(|e| OxideError::Config(format!("reading {}: {}", path.display(), e)))?;
    let file_config: OxideConfig = serde_json::from_str(&contents)
        .map_err(|e| OxideError::Config(format!("parsing {}: {}", path.display(), e)))?;

    for descriptor in file_config.services {
        config.services.retain(|s| s.id != descriptor.id);
        config.services.push(descriptor);
    }
    config.routing_rules.extend(file_config.routing_rules);
    config.data_dir = file_config.data_dir.or(config.data_dir);
    config.max_parallel_workers = file_config.max_parallel_workers.or(config.max_parallel_workers);
    config.discovery_interval_secs = file_config.discovery_interval_secs.or(config.discovery_interval_secs);
    config.cluster_port = file_config.cluster_port.or(config.cluster_port);
    Ok(config)
}

fn apply_env_overrides(config: &mut OxideConfig) {
    if let Ok(dir) = std::env::var("OXIDE_DATA_DIR") {
        config.data_dir = Some(PathBuf::from(dir));
    }
    if let Ok(n) = std::env::var("OXIDE_MAX_PARALLEL_WORKERS") {
        if let Ok(n) = n.parse() {
            config.max_parallel_workers = Some(n);
        }
    }
}

fn validate(config: &OxideConfig) -> Result<(), OxideError> {
    let known: std::collections::HashSet<&str> = config.services.iter().map(|s| s.id.as_str()).collect();
    for (category, rule) in &config.routing_rules {
        if !known.contains(rule.primary.as_str()) {
            return Err(OxideError::Config(format!(
                "routing rule for {:?} references unknown primary service '{}'",
                category, rule.primary
            )));
        }
        for fallback in &rule.fallback {
            if !known.contains(fallback.as_str()) {
                return Err(OxideError::Config(format!(
                    "routing rule for {:?} references unknown fallback service '{}'",
                    category, fallback
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        let config = ConfigBuilder::new().load().unwrap();
        assert!(!config.services.is_empty());
    }

    #[test]
    fn rejects_routing_rule_with_unknown_service() {
        let rule = RoutingRule {
            primary: "nonexistent".to_string(),
            fallback: vec![],
            parallel_threshold_files: 3,
            timeout_seconds: None,
        };
        let result = ConfigBuilder::new().routing_rule(TaskCategory::General, rule).load();
        assert!(result.is_err());
    }

    #[test]
    fn env_override_takes_priority() {
        std::env::set_var("OXIDE_MAX_PARALLEL_WORKERS", "9");
        let config = ConfigBuilder::new().load().unwrap();
        assert_eq!(config.max_parallel_workers(), 9);
        std::env::remove_var("OXIDE_MAX_PARALLEL_WORKERS");
    }
}
