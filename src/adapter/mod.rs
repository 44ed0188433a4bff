pub mod cli;
pub mod mock;
pub mod ollama;
pub mod openai;

use crate::error::OxideError;
use crate::types::{Chunk, ServiceDescriptor};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::path::Path;

pub use cli::CliAdapter;
pub use mock::MockAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;

/// What an adapter is asked to do: the fully assembled prompt plus the
/// model override and per-request timeout the router decided on.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub timeout_secs: u64,
}

/// Uniform capability every backend family exposes: a cancellable,
/// lazily-polled stream of chunks rather than a buffered response.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn id(&self) -> &str;

    fn execute<'a>(&'a self, req: ExecuteRequest) -> BoxStream<'a, Result<Chunk, OxideError>>;

    async fn health_check(&self) -> bool;

    async fn list_models(&self) -> Result<Vec<String>, OxideError>;

    fn describe(&self) -> ServiceDescriptor;
}

/// Builds the combined prompt the adapters send downstream: one
/// fenced block per readable file (skipping anything missing, a
/// directory, or over 1 MiB), in the order given, followed by the
/// user's prompt text.
pub fn build_prompt_with_files(prompt: &str, files: &[impl AsRef<Path>]) -> String {
    const MAX_FILE_BYTES: u64 = 1024 * 1024;
    let mut sections = Vec::new();

    for path in files {
        let path = path.as_ref();
        let meta = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable file");
                continue;
            }
        };
        if meta.is_dir() {
            tracing::warn!(path = %path.display(), "skipping directory in file list");
            continue;
        }
        if meta.len() > MAX_FILE_BYTES {
            tracing::warn!(path = %path.display(), bytes = meta.len(), "skipping oversized file");
            continue;
        }
        match std::fs::read(path) {
            Ok(bytes) => {
                let content = String::from_utf8_lossy(&bytes);
                sections.push(format!("# File: {}\n```\n{}\n```", path.display(), content));
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read file");
            }
        }
    }

    sections.push(prompt.to_string());
    sections.join("\n\n")
}

pub type AdapterMap = HashMap<String, std::sync::Arc<dyn Adapter>>;
