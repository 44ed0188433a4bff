use super::{Adapter, ExecuteRequest};
use crate::error::OxideError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::types::{Chunk, ServiceDescriptor};

#[derive(Debug, Deserialize)]
struct GenerateLine {
    response: Option<String>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

/// Talks to a local or remote Ollama daemon's `/api/generate`,
/// consuming its newline-delimited JSON stream. Lazily resolves which
/// model to use on first call and caches the result — explicit
/// `model` on the request always wins.
pub struct OllamaAdapter {
    descriptor: ServiceDescriptor,
    client: reqwest::Client,
    detected_model: OnceLock<String>,
    ready_lock: Mutex<()>,
}

impl OllamaAdapter {
    pub fn new(descriptor: ServiceDescriptor) -> Self {
        Self {
            descriptor,
            client: reqwest::Client::new(),
            detected_model: OnceLock::new(),
            ready_lock: Mutex::new(()),
        }
    }

    fn base_url(&self) -> &str {
        self.descriptor.base_url.as_deref().unwrap_or("http://localhost:11434")
    }

    async fn ensure_model(&self) -> Result<String, OxideError> {
        if let Some(model) = self.detected_model.get() {
            return Ok(model.clone());
        }
        let _guard = self.ready_lock.lock().await;
        if let Some(model) = self.detected_model.get() {
            return Ok(model.clone());
        }
        if let Some(default) = &self.descriptor.default_model {
            let _ = self.detected_model.set(default.clone());
            return Ok(default.clone());
        }
        let models = self.list_models().await?;
        let first = models
            .into_iter()
            .next()
            .ok_or_else(|| OxideError::Unavailable(format!("{}: no models installed", self.descriptor.id)))?;
        let _ = self.detected_model.set(first.clone());
        Ok(first)
    }
}

/// Reframes raw network chunks into complete NDJSON lines. A single
/// `bytes_stream()` item carries no guarantee of line alignment — it
/// may hold a partial line, several lines, or split one across two
/// items — so incoming bytes are appended to a buffer and only
/// complete (`\n`-terminated) lines are parsed. Stops once a line with
/// `done: true` is seen, matching `/api/generate`'s framing.
fn ndjson_lines(
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    service: String,
) -> impl futures::Stream<Item = Result<Chunk, OxideError>> + Send + 'static {
    stream::unfold(Some((body, String::new())), move |state| {
        let service = service.clone();
        async move {
            let (mut body, mut buffer) = state?;
            loop {
                if let Some(newline_at) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline_at).collect();
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    return Some(parse_ndjson_line(trimmed, &service, body, buffer));
                }

                match body.next().await {
                    Some(Ok(chunk)) => buffer.push_str(&String::from_utf8_lossy(&chunk)),
                    Some(Err(e)) => {
                        let err = OxideError::Protocol { service: service.clone(), detail: e.to_string() };
                        return Some((Err(err), None));
                    }
                    None => {
                        let trimmed = buffer.trim().to_string();
                        if trimmed.is_empty() {
                            return None;
                        }
                        return Some(parse_ndjson_line(&trimmed, &service, body, String::new()));
                    }
                }
            }
        }
    })
}

fn parse_ndjson_line(
    line: &str,
    service: &str,
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    remaining: String,
) -> (Result<Chunk, OxideError>, Option<(BoxStream<'static, reqwest::Result<Bytes>>, String)>) {
    match serde_json::from_str::<GenerateLine>(line) {
        Ok(parsed) => {
            let next_state = if parsed.done { None } else { Some((body, remaining)) };
            (Ok(Chunk { text: parsed.response.unwrap_or_default() }), next_state)
        }
        Err(e) => {
            let detail = format!("bad ndjson: {}", e);
            (Err(OxideError::Protocol { service: service.to_string(), detail }), None)
        }
    }
}

#[async_trait]
impl Adapter for OllamaAdapter {
    fn id(&self) -> &str {
        &self.descriptor.id
    }

    fn execute<'a>(&'a self, req: ExecuteRequest) -> BoxStream<'a, Result<Chunk, OxideError>> {
        let service = self.descriptor.id.clone();
        stream::once(async move {
            let model = match &req.model {
                Some(m) => m.clone(),
                None => self.ensure_model().await?,
            };

            let resp = self
                .client
                .post(format!("{}/api/generate", self.base_url()))
                .json(&json!({ "model": model, "prompt": req.prompt, "stream": true }))
                .timeout(Duration::from_secs(req.timeout_secs))
                .send()
                .await
                .map_err(|e| OxideError::Unavailable(format!("{}: {}", service, e)))?;

            if !resp.status().is_success() {
                return Err(OxideError::Protocol {
                    service: service.clone(),
                    detail: format!("http {}", resp.status()),
                });
            }

            Ok::<_, OxideError>((resp.bytes_stream().boxed(), service))
        })
        .flat_map(|setup| match setup {
            Ok((body, service)) => ndjson_lines(body, service).boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        })
        .boxed()
    }

    async fn health_check(&self) -> bool {
        self.client
            .get(format!("{}/api/tags", self.base_url()))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn list_models(&self) -> Result<Vec<String>, OxideError> {
        let resp = self
            .client
            .get(format!("{}/api/tags", self.base_url()))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| OxideError::Unavailable(format!("{}: {}", self.descriptor.id, e)))?;
        let parsed: TagsResponse = resp
            .json()
            .await
            .map_err(|e| OxideError::Protocol { service: self.descriptor.id.clone(), detail: e.to_string() })?;
        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }

    fn describe(&self) -> ServiceDescriptor {
        self.descriptor.clone()
    }
}
