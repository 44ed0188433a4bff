use serde::{Deserialize, Serialize};

/// Closed set of per-request routing preferences. Replaces the
/// original's untyped preferences map — unknown keys in a raw JSON
/// payload are ignored with a warning rather than silently accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPreferences {
    pub preferred_service: Option<String>,
    pub task_type: Option<String>,
    pub timeout: Option<u64>,
    pub conversation_id: Option<String>,
    #[serde(default = "default_use_memory")]
    pub use_memory: bool,
    pub task_id: Option<String>,
    #[serde(default)]
    pub broadcast_all: bool,
}

fn default_use_memory() -> bool {
    true
}

impl TaskPreferences {
    /// Parses a raw JSON object, logging a warning for any key that
    /// does not map to a known field.
    pub fn from_raw(value: &serde_json::Value) -> Self {
        let mut prefs = TaskPreferences {
            use_memory: true,
            ..Default::default()
        };

        if let Some(obj) = value.as_object() {
            const KNOWN: &[&str] = &[
                "preferred_service",
                "task_type",
                "timeout",
                "conversation_id",
                "use_memory",
                "task_id",
                "broadcast_all",
            ];
            for key in obj.keys() {
                if !KNOWN.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "ignoring unknown task preference");
                }
            }
            if let Ok(parsed) = serde_json::from_value::<TaskPreferences>(value.clone()) {
                prefs = parsed;
            }
        }
        prefs
    }
}
