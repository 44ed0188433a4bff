use super::{Adapter, ExecuteRequest};
use crate::error::OxideError;
use crate::types::{Chunk, ServiceDescriptor};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Mutex;

/// Test double standing in for a real backend. Scripted per call:
/// each `execute` pops the next programmed chunk sequence (or error)
/// off the front of the queue and records the request for assertions.
pub struct MockAdapter {
    descriptor: ServiceDescriptor,
    responses: Mutex<Vec<Result<Vec<String>, OxideError>>>,
    call_log: Mutex<Vec<String>>,
    healthy: Mutex<bool>,
}

impl MockAdapter {
    pub fn new(descriptor: ServiceDescriptor, responses: Vec<Result<Vec<String>, OxideError>>) -> Self {
        Self {
            descriptor,
            responses: Mutex::new(responses),
            call_log: Mutex::new(Vec::new()),
            healthy: Mutex::new(true),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_log.lock().unwrap().len()
    }

    pub fn prompt_for_call(&self, n: usize) -> Option<String> {
        self.call_log.lock().unwrap().get(n).cloned()
    }

    pub fn set_healthy(&self, healthy: bool) {
        *self.healthy.lock().unwrap() = healthy;
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn id(&self) -> &str {
        &self.descriptor.id
    }

    fn execute<'a>(&'a self, req: ExecuteRequest) -> BoxStream<'a, Result<Chunk, OxideError>> {
        self.call_log.lock().unwrap().push(req.prompt.clone());

        let next = self.responses.lock().unwrap();
        let next = if next.is_empty() {
            Err(OxideError::Unavailable(format!("{}: no more programmed responses", self.descriptor.id)))
        } else {
            drop(next);
            self.responses.lock().unwrap().remove(0)
        };

        match next {
            Ok(chunks) => stream::iter(chunks.into_iter().map(|text| Ok(Chunk { text }))).boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    async fn health_check(&self) -> bool {
        *self.healthy.lock().unwrap()
    }

    async fn list_models(&self) -> Result<Vec<String>, OxideError> {
        Ok(self.descriptor.default_model.clone().into_iter().collect())
    }

    fn describe(&self) -> ServiceDescriptor {
        self.descriptor.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServiceKind;

    fn descriptor(id: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            id: id.to_string(),
            kind: ServiceKind::Cli,
            enabled: true,
            base_url: None,
            default_model: None,
            executable: None,
            capabilities: Vec::new(),
            context_window_hint: None,
            api_key: None,
        }
    }

    #[tokio::test]
    async fn yields_scripted_chunks_in_order() {
        let mock = MockAdapter::new(
            descriptor("mock-a"),
            vec![Ok(vec!["hello".to_string(), " world".to_string()])],
        );
        let req = ExecuteRequest { prompt: "hi".to_string(), model: None, timeout_secs: 5 };
        let chunks: Vec<_> = mock.execute(req).collect().await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn surfaces_scripted_error() {
        let mock = MockAdapter::new(
            descriptor("mock-b"),
            vec![Err(OxideError::Unavailable("down".to_string()))],
        );
        let req = ExecuteRequest { prompt: "hi".to_string(), model: None, timeout_secs: 5 };
        let chunks: Vec<_> = mock.execute(req).collect().await;
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_err());
    }
}
