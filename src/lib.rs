pub mod adapter;
pub mod classifier;
pub mod cluster;
pub mod config;
pub mod cost;
pub mod error;
pub mod memory_store;
pub mod orchestrator;
pub mod parallel;
pub mod preferences;
pub mod process_registry;
pub mod router;
pub mod security;
pub mod service_manager;
pub mod store;
pub mod types;

pub use adapter::{Adapter, AdapterMap, CliAdapter, ExecuteRequest, MockAdapter, OllamaAdapter, OpenAiAdapter};
pub use cluster::{ClusterCoordinator, PeerStore};
pub use config::{ConfigBuilder, OxideConfig};
pub use cost::CostTracker;
pub use error::OxideError;
pub use memory_store::ContextMemory;
pub use orchestrator::Orchestrator;
pub use preferences::TaskPreferences;
pub use router::TaskRouter;
pub use security::PathValidator;
pub use service_manager::ServiceManager;
pub use store::TaskStore;
pub use types::{
    Budget, BudgetAlert, BroadcastChunk, BroadcastResult, Chunk, Conversation, CostRecord, ExecutionMode,
    Message, MessageRole, PeerNode, PeerServiceSummary, RouterDecision, RoutingRule, ServiceDescriptor,
    ServiceKind, TaskCategory, TaskChunk, TaskInfo, TaskRecord, TaskStatus, ValidatedPath,
};
