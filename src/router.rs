use crate::adapter::Adapter;
use crate::error::OxideError;
use crate::types::{ExecutionMode, RouterDecision, RoutingRule, TaskCategory, TaskInfo};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

const DEFAULT_TIMEOUT_SECONDS: u64 = 120;

/// Fresh-per-request availability probe. Implemented over the live
/// adapter map in production; a fixed table of booleans in tests — the
/// router never caches an unhealthy verdict across requests.
#[async_trait]
pub trait AvailabilityProbe: Send + Sync {
    async fn is_available(&self, service_id: &str) -> bool;
    fn all_known_ids(&self) -> Vec<String>;
}

/// Probes a live adapter map: a service is available when it exists,
/// is enabled in its descriptor, and its health check currently
/// succeeds.
pub struct AdapterProbe<'a> {
    adapters: &'a HashMap<String, Arc<dyn Adapter>>,
}

impl<'a> AdapterProbe<'a> {
    pub fn new(adapters: &'a HashMap<String, Arc<dyn Adapter>>) -> Self {
        Self { adapters }
    }
}

#[async_trait]
impl<'a> AvailabilityProbe for AdapterProbe<'a> {
    async fn is_available(&self, service_id: &str) -> bool {
        match self.adapters.get(service_id) {
            Some(adapter) if adapter.describe().enabled => adapter.health_check().await,
            _ => false,
        }
    }

    fn all_known_ids(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }
}

/// Resolves a task category to the routing rule that governs it,
/// falling back to the classifier's recommended list when no rule was
/// configured for that category.
pub struct TaskRouter {
    rules: HashMap<TaskCategory, RoutingRule>,
}

impl TaskRouter {
    pub fn new(rules: HashMap<TaskCategory, RoutingRule>) -> Self {
        Self { rules }
    }

    pub async fn route(
        &self,
        task_info: &TaskInfo,
        probe: &dyn AvailabilityProbe,
    ) -> Result<RouterDecision, OxideError> {
        let (primary, fallback, timeout_seconds) = match self.rules.get(&task_info.category) {
            Some(rule) => (rule.primary.clone(), rule.fallback.clone(), rule.timeout_seconds),
            None => {
                let mut iter = task_info.recommended_services.iter();
                let primary = iter
                    .next()
                    .cloned()
                    .ok_or(OxideError::NoServiceAvailable(task_info.category))?;
                (primary, iter.cloned().collect(), None)
            }
        };

        let selected = Self::select_available(&primary, &fallback, probe)
            .await
            .ok_or(OxideError::NoServiceAvailable(task_info.category))?;

        let remaining_fallback: Vec<String> = std::iter::once(primary.clone())
            .chain(fallback.iter().cloned())
            .skip_while(|id| id != &selected)
            .skip(1)
            .collect();

        let mode = if task_info.use_parallel {
            ExecutionMode::Parallel
        } else {
            ExecutionMode::Single
        };

        Ok(RouterDecision {
            primary: selected,
            fallback: remaining_fallback,
            mode,
            timeout_seconds: timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS),
            broadcast_targets: Vec::new(),
        })
    }

    /// Variant used when the orchestrator demands broadcast-all: the
    /// decision carries every currently available service rather than
    /// a single primary/fallback chain.
    pub async fn route_broadcast(
        &self,
        task_info: &TaskInfo,
        probe: &dyn AvailabilityProbe,
    ) -> Result<RouterDecision, OxideError> {
        let mut targets = Vec::new();
        for id in probe.all_known_ids() {
            if probe.is_available(&id).await {
                targets.push(id);
            }
        }
        if targets.is_empty() {
            return Err(OxideError::NoServiceAvailable(task_info.category));
        }
        let primary = targets[0].clone();
        let fallback = targets[1..].to_vec();
        Ok(RouterDecision {
            primary,
            fallback,
            mode: ExecutionMode::BroadcastAll,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            broadcast_targets: targets,
        })
    }

    async fn select_available(
        primary: &str,
        fallback: &[String],
        probe: &dyn AvailabilityProbe,
    ) -> Option<String> {
        if probe.is_available(primary).await {
            return Some(primary.to_string());
        }
        for candidate in fallback {
            if probe.is_available(candidate).await {
                return Some(candidate.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct FixedProbe {
        healthy: Mutex<HashSet<String>>,
        ids: Vec<String>,
    }

    #[async_trait]
    impl AvailabilityProbe for FixedProbe {
        async fn is_available(&self, service_id: &str) -> bool {
            self.healthy.lock().unwrap().contains(service_id)
        }
        fn all_known_ids(&self) -> Vec<String> {
            self.ids.clone()
        }
    }

    fn task_info(category: TaskCategory) -> TaskInfo {
        TaskInfo {
            category,
            file_count: 0,
            total_bytes: 0,
            use_parallel: false,
            recommended_services: vec!["gemini".to_string(), "qwen".to_string()],
        }
    }

    #[tokio::test]
    async fn picks_primary_when_available() {
        let router = TaskRouter::new(HashMap::new());
        let probe = FixedProbe {
            healthy: Mutex::new(["gemini".to_string()].into()),
            ids: vec!["gemini".to_string(), "qwen".to_string()],
        };
        let decision = router.route(&task_info(TaskCategory::General), &probe).await.unwrap();
        assert_eq!(decision.primary, "gemini");
    }

    #[tokio::test]
    async fn falls_back_when_primary_unavailable() {
        let router = TaskRouter::new(HashMap::new());
        let probe = FixedProbe {
            healthy: Mutex::new(["qwen".to_string()].into()),
            ids: vec!["gemini".to_string(), "qwen".to_string()],
        };
        let decision = router.route(&task_info(TaskCategory::General), &probe).await.unwrap();
        assert_eq!(decision.primary, "qwen");
    }

    #[tokio::test]
    async fn fails_closed_when_nothing_available() {
        let router = TaskRouter::new(HashMap::new());
        let probe = FixedProbe {
            healthy: Mutex::new(HashSet::new()),
            ids: vec!["gemini".to_string(), "qwen".to_string()],
        };
        let result = router.route(&task_info(TaskCategory::General), &probe).await;
        assert!(matches!(result, Err(OxideError::NoServiceAvailable(_))));
    }

    #[tokio::test]
    async fn configured_rule_overrides_recommendations() {
        let mut rules = HashMap::new();
        rules.insert(
            TaskCategory::BugSearch,
            RoutingRule {
                primary: "qwen".to_string(),
                fallback: vec!["gemini".to_string()],
                parallel_threshold_files: 4,
                timeout_seconds: Some(30),
            },
        );
        let router = TaskRouter::new(rules);
        let probe = FixedProbe {
            healthy: Mutex::new(["qwen".to_string(), "gemini".to_string()].into()),
            ids: vec!["qwen".to_string(), "gemini".to_string()],
        };
        let decision = router.route(&task_info(TaskCategory::BugSearch), &probe).await.unwrap();
        assert_eq!(decision.primary, "qwen");
        assert_eq!(decision.timeout_seconds, 30);
    }
}
