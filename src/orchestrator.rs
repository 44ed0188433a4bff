use crate::adapter::{build_prompt_with_files, Adapter, ExecuteRequest};
use crate::classifier;
use crate::cost::{estimate_tokens, CostTracker};
use crate::error::OxideError;
use crate::memory_store::{derive_conversation_id, ContextMemory};
use crate::parallel::execute_parallel;
use crate::preferences::TaskPreferences;
use crate::process_registry;
use crate::router::{AdapterProbe, TaskRouter};
use crate::security::PathValidator;
use crate::store::TaskStore;
use crate::types::{
    BroadcastChunk, BroadcastResult, Chunk, ExecutionMode, MessageRole, ServiceDescriptor, TaskChunk, TaskRecord,
    TaskStatus,
};
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const MAX_RETRIES: u32 = 3;

/// Per-service status snapshot for the `service_status` diagnostic.
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub healthy: bool,
    pub descriptor: ServiceDescriptor,
}

/// Result of the `test_service` diagnostic: a single non-streamed
/// round trip against one adapter.
#[derive(Debug, Clone)]
pub struct TestResult {
    pub text: String,
    pub error: Option<String>,
}

/// Drives the full request life cycle: classification, context
/// enrichment, routing, adapter execution with retry/fallback
/// discipline, and terminal bookkeeping. Holds no per-request state —
/// everything it needs is passed into `execute_task` or read from its
/// injected collaborators.
pub struct Orchestrator {
    adapters: HashMap<String, Arc<dyn Adapter>>,
    router: TaskRouter,
    memory: Arc<ContextMemory>,
    cost: Arc<CostTracker>,
    tasks: Arc<TaskStore>,
    path_validator: Arc<PathValidator>,
    max_parallel_workers: usize,
}

impl Orchestrator {
    pub fn new(
        adapters: HashMap<String, Arc<dyn Adapter>>,
        router: TaskRouter,
        memory: Arc<ContextMemory>,
        cost: Arc<CostTracker>,
        tasks: Arc<TaskStore>,
        path_validator: Arc<PathValidator>,
        max_parallel_workers: usize,
    ) -> Self {
        Self { adapters, router, memory, cost, tasks, path_validator, max_parallel_workers }
    }

    /// Single public entry point. Returns a lazily-polled stream of
    /// chunks; dropping the stream before exhaustion is the
    /// cancellation path — in-flight adapter work observes it at its
    /// next suspension point.
    pub fn execute_task<'a>(
        &'a self,
        prompt: String,
        files: Vec<String>,
        preferences: TaskPreferences,
    ) -> BoxStream<'a, TaskChunk> {
        stream::once(self.run(prompt, files, preferences)).flatten().boxed()
    }

    async fn run(&self, prompt: String, files: Vec<String>, preferences: TaskPreferences) -> BoxStream<'_, TaskChunk> {
        let task_id = preferences.task_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let span = tracing::info_span!("execute_task", task_id = %task_id);
        let _enter = span.enter();

        let mut files = files;
        {
            let results = self.path_validator.validate_paths(&files);
            let mut validated = Vec::with_capacity(files.len());
            for (path, result) in files.iter().zip(results) {
                match result {
                    Ok(valid) => validated.push(valid.to_string()),
                    Err(e) => tracing::warn!(path = %path, error = %e, "dropping invalid file path"),
                }
            }
            files = validated;
        }

        let mut record = TaskRecord::new(task_id.clone(), prompt.clone(), files.clone(), HashMap::new());
        if let Err(e) = self.tasks.insert(&record) {
            tracing::error!(error = %e, "failed to insert task record");
        }
        record.transition(TaskStatus::Running);
        let _ = self.tasks.update(&record);

        let conversation_id = preferences
            .conversation_id
            .clone()
            .unwrap_or_else(|| derive_conversation_id(&prompt));

        if preferences.use_memory {
            self.memory.add_context(&conversation_id, MessageRole::User, &prompt);
        }

        let mut task_info = classifier::classify(&prompt, &files);
        if let Some(task_type) = &preferences.task_type {
            match classifier::parse_category(task_type) {
                Some(category) => {
                    task_info.category = category;
                    task_info.recommended_services = classifier::recommended_for(category);
                }
                None => tracing::warn!(task_type = %task_type, "ignoring unrecognized task_type preference"),
            }
        }
        record.category = Some(task_info.category);
        let _ = self.tasks.update(&record);

        let enriched_prompt = if preferences.use_memory {
            match self.memory.context_for_task(&conversation_id, &prompt, 24) {
                Some(context) => format!("{}\n---\nCurrent task:\n{}", context, prompt),
                None => prompt.clone(),
            }
        } else {
            prompt.clone()
        };

        let timeout_secs = preferences.timeout.unwrap_or(120);

        if preferences.broadcast_all {
            return self.run_broadcast(record, conversation_id, enriched_prompt, timeout_secs).await;
        }

        let decision = if let Some(preferred) = &preferences.preferred_service {
            if self.adapters.contains_key(preferred) {
                crate::types::RouterDecision {
                    primary: preferred.clone(),
                    fallback: vec![],
                    mode: if task_info.use_parallel { ExecutionMode::Parallel } else { ExecutionMode::Single },
                    timeout_seconds: timeout_secs,
                    broadcast_targets: vec![],
                }
            } else {
                return self.fail(record, OxideError::Config(format!("preferred service '{}' not configured", preferred))).await;
            }
        } else {
            let probe = AdapterProbe::new(&self.adapters);
            match self.router.route(&task_info, &probe).await {
                Ok(d) => d,
                Err(e) => return self.fail(record, e).await,
            }
        };

        record.service = Some(decision.primary.clone());
        record.execution_mode = Some(decision.mode);
        let _ = self.tasks.update(&record);

        match decision.mode {
            ExecutionMode::Parallel if files.len() > 1 => {
                self.run_parallel(record, conversation_id, enriched_prompt, files, &decision).await
            }
            _ => self.run_single(record, conversation_id, enriched_prompt, &decision).await,
        }
    }

    /// Tries each service in fallback order, retrying protocol errors
    /// in place, until one yields its first chunk. From that point on
    /// the adapter's stream is forwarded lazily, one `TaskChunk` per
    /// chunk received — no more in-place retry or fallback once output
    /// has started, since a partial response cannot be un-sent.
    /// Dropping the returned stream before it finalizes is the
    /// cancellation path: see `CancellationGuard`.
    async fn run_single(
        &self,
        record: TaskRecord,
        conversation_id: String,
        prompt: String,
        decision: &crate::types::RouterDecision,
    ) -> BoxStream<'_, TaskChunk> {
        let services_to_try: Vec<String> = std::iter::once(decision.primary.clone()).chain(decision.fallback.iter().cloned()).collect();
        let mut last_error: Option<OxideError> = None;

        for service_id in &services_to_try {
            let Some(adapter) = self.adapters.get(service_id) else { continue };

            let mut attempts = 0;
            loop {
                attempts += 1;
                let req = ExecuteRequest { prompt: prompt.clone(), model: None, timeout_secs: decision.timeout_seconds };
                let mut stream = adapter.execute(req);
                let first = tokio::time::timeout(Duration::from_secs(decision.timeout_seconds), stream.next()).await;

                match first {
                    Ok(Some(Ok(chunk))) => {
                        let guard = CancellationGuard::new(record.id.clone(), Arc::clone(&self.tasks));
                        let driver = StreamDriver {
                            orchestrator: self,
                            record,
                            conversation_id,
                            service_id: service_id.clone(),
                            accumulated: chunk.text.clone(),
                            inner: stream,
                            guard,
                        };
                        return stream::once(async move { TaskChunk::Text(chunk.text) })
                            .chain(stream_from_driver(driver))
                            .boxed();
                    }
                    Ok(Some(Err(e))) => {
                        let retryable = e.is_retryable_in_place();
                        last_error = Some(e);
                        if retryable && attempts < MAX_RETRIES {
                            continue;
                        }
                        break;
                    }
                    Ok(None) => {
                        return self.succeed(record, conversation_id, service_id.clone(), String::new()).await;
                    }
                    Err(_) => {
                        last_error = Some(OxideError::Timeout { service: service_id.clone(), secs: decision.timeout_seconds });
                        break;
                    }
                }
            }
        }

        self.fail(record, last_error.unwrap_or_else(|| OxideError::Unavailable("no service produced output".to_string()))).await
    }

    async fn run_parallel(
        &self,
        record: TaskRecord,
        conversation_id: String,
        prompt: String,
        files: Vec<String>,
        decision: &crate::types::RouterDecision,
    ) -> BoxStream<'_, TaskChunk> {
        let services: Vec<Arc<dyn Adapter>> = std::iter::once(&decision.primary)
            .chain(decision.fallback.iter())
            .filter_map(|id| self.adapters.get(id).cloned())
            .collect();

        let result = execute_parallel(&services, &prompt, &files, decision.timeout_seconds, self.max_parallel_workers).await;
        self.succeed(record, conversation_id, decision.primary.clone(), result.aggregated_text).await
    }

    async fn run_broadcast<'a>(
        &'a self,
        mut record: TaskRecord,
        conversation_id: String,
        prompt: String,
        timeout_secs: u64,
    ) -> BoxStream<'a, TaskChunk> {
        let probe = AdapterProbe::new(&self.adapters);
        let task_info = classifier::classify(&prompt, &[]);
        let decision = match self.router.route_broadcast(&task_info, &probe).await {
            Ok(d) => d,
            Err(e) => return self.fail(record, e).await,
        };

        record.execution_mode = Some(ExecutionMode::BroadcastAll);
        let _ = self.tasks.update(&record);

        let targets = decision.broadcast_targets.clone();
        let adapters = &self.adapters;
        let req_prompt = prompt.clone();

        let chunks = stream::iter(targets.into_iter()).then(move |service_id| {
            let req_prompt = req_prompt.clone();
            async move {
                let Some(adapter) = adapters.get(&service_id) else {
                    return BroadcastChunk { service_id, chunk: String::new(), done: true, timestamp: Utc::now(), error: Some("unknown service".to_string()) };
                };
                let req = ExecuteRequest { prompt: req_prompt, model: None, timeout_secs };
                match collect_stream(adapter.as_ref(), req).await {
                    Ok(text) => BroadcastChunk { service_id, chunk: text, done: true, timestamp: Utc::now(), error: None },
                    Err(e) => BroadcastChunk { service_id, chunk: String::new(), done: true, timestamp: Utc::now(), error: Some(e.to_string()) },
                }
            }
        });

        let orchestrator = self;
        let record = Arc::new(tokio::sync::Mutex::new(record));
        let conversation_id = Arc::new(conversation_id);

        chunks
            .flat_map(move |chunk| {
                let record = Arc::clone(&record);
                let conversation_id = Arc::clone(&conversation_id);
                let service_id = chunk.service_id.clone();
                let bytes = chunk.chunk.len() as u64;
                let error = chunk.error.clone();
                let text = chunk.chunk.clone();

                Box::pin(async move {
                    let mut guard = record.lock().await;
                    guard.upsert_broadcast_result(BroadcastResult {
                        service_id: service_id.clone(),
                        chunks: 1,
                        bytes,
                        error: error.clone(),
                        completed_at: Some(Utc::now()),
                    });
                    orchestrator.memory.add_context(&conversation_id, MessageRole::Assistant, &format!("[{}] {}", service_id, text));
                    TaskChunk::Broadcast(chunk)
                }) as std::pin::Pin<Box<dyn std::future::Future<Output = TaskChunk> + Send>>
            })
            .boxed()
    }

    async fn succeed(&self, mut record: TaskRecord, conversation_id: String, service_id: String, text: String) -> BoxStream<'_, TaskChunk> {
        self.finalize_success(&mut record, &conversation_id, &service_id, &text).await;
        stream::once(async move { TaskChunk::Text(text) }).boxed()
    }

    async fn fail(&self, mut record: TaskRecord, error: OxideError) -> BoxStream<'_, TaskChunk> {
        self.finalize_failure(&mut record, &error).await;
        stream::once(async move { TaskChunk::Text(format!("error: {}", error)) }).boxed()
    }

    /// Pure bookkeeping for a completed task: memory, cost, and the
    /// durable record. Split out of `succeed` so `run_single`'s
    /// per-chunk driver can finalize without producing an extra
    /// stream item of its own.
    async fn finalize_success(&self, record: &mut TaskRecord, conversation_id: &str, service_id: &str, text: &str) {
        if !text.is_empty() {
            self.memory.add_context(conversation_id, MessageRole::Assistant, text);
        }
        let tokens_in = estimate_tokens(&record.prompt);
        let tokens_out = estimate_tokens(text);
        if let Err(e) = self.cost.record_cost(&record.id, service_id, tokens_in, tokens_out) {
            tracing::warn!(error = %e, "failed to record cost");
        }

        record.transition(TaskStatus::Completed);
        record.set_result_truncated(text);
        let _ = self.tasks.update(record);
    }

    async fn finalize_failure(&self, record: &mut TaskRecord, error: &OxideError) {
        tracing::warn!(task_id = %record.id, error = %error, "task failed");
        record.error = Some(error.to_string());
        record.transition(TaskStatus::Failed);
        let _ = self.tasks.update(record);
    }

    /// Read-only diagnostic over every configured adapter's current
    /// health.
    pub async fn service_status(&self) -> HashMap<String, ServiceStatus> {
        let mut out = HashMap::new();
        for (id, adapter) in &self.adapters {
            out.insert(id.clone(), ServiceStatus { healthy: adapter.health_check().await, descriptor: adapter.describe() });
        }
        out
    }

    /// Read-only diagnostic: a single non-streamed round trip against
    /// one configured adapter, for operational probing.
    pub async fn test_service(&self, service_id: &str, prompt: &str) -> TestResult {
        let Some(adapter) = self.adapters.get(service_id) else {
            return TestResult { text: String::new(), error: Some(format!("unknown service '{}'", service_id)) };
        };
        let req = ExecuteRequest { prompt: build_prompt_with_files(prompt, &Vec::<String>::new()), model: None, timeout_secs: 30 };
        match collect_stream(adapter.as_ref(), req).await {
            Ok(text) => TestResult { text, error: None },
            Err(e) => TestResult { text: String::new(), error: Some(e.to_string()) },
        }
    }
}

async fn collect_stream(adapter: &dyn Adapter, req: ExecuteRequest) -> Result<String, OxideError> {
    let mut stream = adapter.execute(req);
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        text.push_str(&chunk?.text);
    }
    Ok(text)
}

/// Drives one adapter's live stream to completion, forwarding each
/// chunk and finalizing bookkeeping exactly once: on normal exhaustion
/// (success), on a mid-stream error (failure), or — via `Drop`, since
/// this struct owns the `CancellationGuard` — on early abandonment by
/// the consumer (cancellation).
struct StreamDriver<'a> {
    orchestrator: &'a Orchestrator,
    record: TaskRecord,
    conversation_id: String,
    service_id: String,
    accumulated: String,
    inner: BoxStream<'a, Result<Chunk, OxideError>>,
    guard: CancellationGuard,
}

fn stream_from_driver(driver: StreamDriver<'_>) -> BoxStream<'_, TaskChunk> {
    stream::unfold(Some(driver), |state| async move {
        let mut driver = state?;
        match driver.inner.next().await {
            Some(Ok(chunk)) => {
                driver.accumulated.push_str(&chunk.text);
                let text = chunk.text;
                Some((TaskChunk::Text(text), Some(driver)))
            }
            Some(Err(e)) => {
                driver.guard.disarm();
                let message = format!("error: {}", e);
                driver.orchestrator.finalize_failure(&mut driver.record, &e).await;
                Some((TaskChunk::Text(message), None))
            }
            None => {
                driver.guard.disarm();
                driver
                    .orchestrator
                    .finalize_success(&mut driver.record, &driver.conversation_id, &driver.service_id, &driver.accumulated)
                    .await;
                None
            }
        }
    })
    .boxed()
}

/// Marks a task record `Failed` with `OxideError::Cancelled` and
/// terminates every registered subprocess, but only if the stream
/// driving the task is dropped before it finalizes normally — `disarm`
/// is called on every code path that reaches a normal outcome first.
/// The cleanup itself runs detached since `Drop` cannot be async.
struct CancellationGuard {
    task_id: String,
    tasks: Arc<TaskStore>,
    armed: bool,
}

impl CancellationGuard {
    fn new(task_id: String, tasks: Arc<TaskStore>) -> Self {
        Self { task_id, tasks, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancellationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let task_id = self.task_id.clone();
        let tasks = Arc::clone(&self.tasks);
        tokio::spawn(async move {
            if let Ok(Some(mut record)) = tasks.get(&task_id) {
                record.error = Some(OxideError::Cancelled.to_string());
                record.transition(TaskStatus::Failed);
                let _ = tasks.update(&record);
            }
            process_registry::global().terminate_all(Duration::from_secs(3)).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MockAdapter;
    use crate::types::ServiceKind;
    use std::collections::HashMap as StdHashMap;

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

    fn build(adapters: Vec<(&str, MockAdapter)>) -> (Orchestrator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let map: HashMap<String, Arc<dyn Adapter>> = adapters
            .into_iter()
            .map(|(id, a)| (id.to_string(), Arc::new(a) as Arc<dyn Adapter>))
            .collect();
        let router = TaskRouter::new(StdHashMap::new());
        let memory = Arc::new(ContextMemory::new());
        let cost = Arc::new(CostTracker::new(dir.path().join("costs.db")).unwrap());
        let tasks = Arc::new(TaskStore::new(dir.path().join("tasks.db")).unwrap());
        let path_validator = Arc::new(crate::security::PathValidator::new(vec![]));
        (Orchestrator::new(map, router, memory, cost, tasks, path_validator, 4), dir)
    }

    #[tokio::test]
    async fn single_happy_path_marks_task_completed() {
        let (orchestrator, _dir) = build(vec![("qwen", MockAdapter::new(descriptor("qwen"), vec![Ok(vec!["hi there".to_string()])]))]);
        let prefs = TaskPreferences { preferred_service: Some("qwen".to_string()), use_memory: true, ..Default::default() };
        let chunks: Vec<_> = orchestrator.execute_task("hello".to_string(), vec![], prefs).collect().await;
        assert_eq!(chunks.len(), 1);
        if let TaskChunk::Text(text) = &chunks[0] {
            assert_eq!(text, "hi there");
        } else {
            panic!("expected text chunk");
        }
    }

    #[tokio::test]
    async fn falls_back_to_next_service_on_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut rules = StdHashMap::new();
        rules.insert(
            crate::types::TaskCategory::General,
            crate::types::RoutingRule { primary: "gemini".to_string(), fallback: vec!["qwen".to_string()], parallel_threshold_files: 4, timeout_seconds: None },
        );
        let router = TaskRouter::new(rules);
        let memory = Arc::new(ContextMemory::new());
        let cost = Arc::new(CostTracker::new(dir.path().join("costs.db")).unwrap());
        let tasks = Arc::new(TaskStore::new(dir.path().join("tasks.db")).unwrap());
        let mut map: HashMap<String, Arc<dyn Adapter>> = HashMap::new();
        map.insert("gemini".to_string(), Arc::new(MockAdapter::new(descriptor("gemini"), vec![Err(OxideError::Unavailable("down".to_string()))])));
        map.insert("qwen".to_string(), Arc::new(MockAdapter::new(descriptor("qwen"), vec![Ok(vec!["backup answer".to_string()])])));
        let path_validator = Arc::new(crate::security::PathValidator::new(vec![]));
        let orchestrator = Orchestrator::new(map, router, memory, cost, tasks, path_validator, 4);

        let chunks: Vec<_> = orchestrator.execute_task("hello".to_string(), vec![], TaskPreferences { use_memory: true, ..Default::default() }).collect().await;
        if let TaskChunk::Text(text) = &chunks[0] {
            assert_eq!(text, "backup answer");
        } else {
            panic!("expected text chunk");
        }
    }
}
