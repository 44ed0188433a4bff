use oxide_core::{
    Adapter, ClusterCoordinator, CostTracker, ExecutionMode, MockAdapter, Orchestrator, OxideError, PathValidator,
    PeerNode, PeerServiceSummary, PeerStore, RouterDecision, ServiceDescriptor, ServiceKind, TaskChunk,
    TaskPreferences, TaskRouter, TaskStatus, TaskStore,
};
use oxide_core::memory_store::ContextMemory;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn descriptor(id: &str) -> ServiceDescriptor {
    ServiceDescriptor {
        id: id.to_string(),
        kind: ServiceKind::Cli,
        enabled: true,
        base_url: None,
        default_model: None,
        executable: None,
        capabilities: vec![],
        context_window_hint: None,
        api_key: None,
    }
}

fn build_orchestrator(adapters: Vec<(&str, MockAdapter)>) -> (Orchestrator, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let map: HashMap<String, Arc<dyn Adapter>> = adapters
        .into_iter()
        .map(|(id, a)| (id.to_string(), Arc::new(a) as Arc<dyn Adapter>))
        .collect();
    let router = TaskRouter::new(HashMap::new());
    let memory = Arc::new(ContextMemory::new());
    let cost = Arc::new(CostTracker::new(dir.path().join("costs.db")).unwrap());
    let tasks = Arc::new(TaskStore::new(dir.path().join("tasks.db")).unwrap());
    let path_validator = Arc::new(PathValidator::new(vec![]));
    (Orchestrator::new(map, router, memory, cost, tasks, path_validator, 4), dir)
}

#[tokio::test]
async fn broadcast_all_tags_every_chunk_with_its_service() {
    use futures::StreamExt;

    let gemini = MockAdapter::new(descriptor("gemini"), vec![Ok(vec!["gemini says hi".to_string()])]);
    let qwen = MockAdapter::new(descriptor("qwen"), vec![Ok(vec!["qwen says hi".to_string()])]);
    let (orchestrator, _dir) = build_orchestrator(vec![("gemini", gemini), ("qwen", qwen)]);

    let prefs = TaskPreferences { broadcast_all: true, use_memory: false, ..Default::default() };
    let chunks: Vec<_> = orchestrator.execute_task("hello everyone".to_string(), vec![], prefs).collect().await;

    assert_eq!(chunks.len(), 2);
    let mut seen: Vec<String> = chunks
        .into_iter()
        .map(|c| match c {
            TaskChunk::Broadcast(b) => b.service_id,
            TaskChunk::Text(_) => panic!("expected broadcast chunks"),
        })
        .collect();
    seen.sort();
    assert_eq!(seen, vec!["gemini".to_string(), "qwen".to_string()]);
}

#[tokio::test]
async fn task_record_reaches_completed_with_truncated_result() {
    use futures::StreamExt;

    let long_answer = "x".repeat(600);
    let adapter = MockAdapter::new(descriptor("qwen"), vec![Ok(vec![long_answer.clone()])]);
    let dir = tempfile::tempdir().unwrap();
    let mut map: HashMap<String, Arc<dyn Adapter>> = HashMap::new();
    map.insert("qwen".to_string(), Arc::new(adapter));
    let router = TaskRouter::new(HashMap::new());
    let memory = Arc::new(ContextMemory::new());
    let cost = Arc::new(CostTracker::new(dir.path().join("costs.db")).unwrap());
    let tasks = Arc::new(TaskStore::new(dir.path().join("tasks.db")).unwrap());
    let tasks_clone = Arc::clone(&tasks);
    let path_validator = Arc::new(PathValidator::new(vec![]));
    let orchestrator = Orchestrator::new(map, router, memory, cost, tasks, path_validator, 4);

    let prefs = TaskPreferences {
        preferred_service: Some("qwen".to_string()),
        task_id: Some("fixed-id".to_string()),
        use_memory: false,
        ..Default::default()
    };
    let _chunks: Vec<_> = orchestrator.execute_task("long prompt".to_string(), vec![], prefs).collect().await;

    let record = tasks_clone.get("fixed-id").unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(record.result.as_ref().unwrap().chars().count(), 500);
    assert!(record.duration_ms.is_some());
}

#[tokio::test]
async fn no_service_available_marks_task_failed() {
    use futures::StreamExt;

    let (orchestrator, _dir) = build_orchestrator(vec![]);
    let prefs = TaskPreferences { preferred_service: Some("nonexistent".to_string()), use_memory: false, ..Default::default() };
    let chunks: Vec<_> = orchestrator.execute_task("hi".to_string(), vec![], prefs).collect().await;
    assert_eq!(chunks.len(), 1);
    if let TaskChunk::Text(text) = &chunks[0] {
        assert!(text.starts_with("error:"));
    } else {
        panic!("expected text chunk");
    }
}

#[test]
fn router_decision_fields_are_internally_consistent() {
    let decision = RouterDecision {
        primary: "qwen".to_string(),
        fallback: vec!["gemini".to_string()],
        mode: ExecutionMode::Single,
        timeout_seconds: 60,
        broadcast_targets: vec![],
    };
    assert!(!decision.fallback.contains(&decision.primary));
}

#[tokio::test]
async fn parallel_split_shards_files_across_both_services() {
    use futures::StreamExt;

    let files_dir = tempfile::tempdir().unwrap();
    let mut files = Vec::new();
    for i in 0..4 {
        let path = files_dir.path().join(format!("f{i}.rs"));
        std::fs::write(&path, format!("fn f{i}() {{}}")).unwrap();
        files.push(path.to_str().unwrap().to_string());
    }

    let qwen = MockAdapter::new(descriptor("qwen"), vec![Ok(vec!["qwen shard".to_string()])]);
    let ollama = MockAdapter::new(descriptor("ollama_local"), vec![Ok(vec!["ollama shard".to_string()])]);

    let mut map: HashMap<String, Arc<dyn Adapter>> = HashMap::new();
    map.insert("qwen".to_string(), Arc::new(qwen));
    map.insert("ollama_local".to_string(), Arc::new(ollama));

    let state_dir = tempfile::tempdir().unwrap();
    let router = TaskRouter::new(HashMap::new());
    let memory = Arc::new(ContextMemory::new());
    let cost = Arc::new(CostTracker::new(state_dir.path().join("costs.db")).unwrap());
    let tasks = Arc::new(TaskStore::new(state_dir.path().join("tasks.db")).unwrap());
    let path_validator = Arc::new(PathValidator::new(vec![files_dir.path().to_path_buf()]));
    let orchestrator = Orchestrator::new(map, router, memory, cost, tasks, path_validator, 4);

    let prefs = TaskPreferences { use_memory: false, ..Default::default() };
    let chunks: Vec<_> = orchestrator.execute_task("write a new helper".to_string(), files, prefs).collect().await;

    assert_eq!(chunks.len(), 1);
    match &chunks[0] {
        TaskChunk::Text(text) => {
            assert!(text.contains("qwen shard"), "missing qwen section: {text}");
            assert!(text.contains("ollama shard"), "missing ollama section: {text}");
        }
        TaskChunk::Broadcast(_) => panic!("expected text chunk"),
    }
}

#[tokio::test]
async fn peer_loaded_from_store_is_selected_and_delegation_fails_without_a_live_peer() {
    let dir = tempfile::tempdir().unwrap();
    let store = PeerStore::new(dir.path().join("peers.db")).unwrap();

    let now = chrono::Utc::now();
    let mut services = HashMap::new();
    services.insert(
        "qwen".to_string(),
        PeerServiceSummary { kind: ServiceKind::OpenAiHttp, models: vec!["qwen2.5".to_string()], capabilities: vec![], base_url: None },
    );
    let peer = PeerNode {
        node_id: "peer-1".to_string(),
        hostname: "peer-host".to_string(),
        ip_address: "127.0.0.1".to_string(),
        port: 19999,
        services,
        cpu_percent: 10.0,
        memory_percent: 10.0,
        active_tasks: 0,
        total_tasks: 0,
        last_seen: now,
        healthy: true,
        enabled: true,
        version: None,
        features: vec![],
        first_seen: now,
    };
    store.upsert(&peer).unwrap();

    let coordinator = ClusterCoordinator::new(0, Duration::from_secs(30), store);
    coordinator.seed_from_store().unwrap();

    assert_eq!(coordinator.select_best_node(false, Some("qwen")), Some("peer-1".to_string()));
    assert_eq!(coordinator.select_best_node(false, Some("gemini")), None);

    let outcome = coordinator.delegate("peer-1", "hello", "qwen").await;
    assert!(matches!(outcome, Err(OxideError::Unavailable(_))));
}

#[tokio::test]
async fn dropping_the_stream_early_cancels_the_task() {
    use futures::StreamExt;

    let dir = tempfile::tempdir().unwrap();
    let adapter = MockAdapter::new(
        descriptor("qwen"),
        vec![Ok(vec!["first".to_string(), "second".to_string(), "third".to_string()])],
    );
    let mut map: HashMap<String, Arc<dyn Adapter>> = HashMap::new();
    map.insert("qwen".to_string(), Arc::new(adapter));
    let router = TaskRouter::new(HashMap::new());
    let memory = Arc::new(ContextMemory::new());
    let cost = Arc::new(CostTracker::new(dir.path().join("costs.db")).unwrap());
    let tasks = Arc::new(TaskStore::new(dir.path().join("tasks.db")).unwrap());
    let tasks_clone = Arc::clone(&tasks);
    let path_validator = Arc::new(PathValidator::new(vec![]));
    let orchestrator = Orchestrator::new(map, router, memory, cost, tasks, path_validator, 4);

    let prefs = TaskPreferences {
        preferred_service: Some("qwen".to_string()),
        task_id: Some("cancel-me".to_string()),
        use_memory: false,
        ..Default::default()
    };

    {
        let mut stream = orchestrator.execute_task("hello".to_string(), vec![], prefs);
        let first = stream.next().await;
        assert!(first.is_some());
        // `stream` is dropped here, before "second"/"third" are consumed —
        // this is the cancellation path.
    }

    tokio::time::sleep(Duration::from_millis(50)).await;

    let record = tasks_clone.get("cancel-me").unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert!(record.error.as_ref().unwrap().contains("cancelled"));
}
