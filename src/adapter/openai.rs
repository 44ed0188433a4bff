use super::{Adapter, ExecuteRequest};
use crate::error::OxideError;
use async_openai::{
    config::OpenAIConfig,
    types::{ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs},
    Client,
};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use crate::types::{Chunk, ServiceDescriptor};

/// Talks to any OpenAI-chat-completions-compatible endpoint (Groq,
/// Together, a local server, OpenAI itself) by pointing `async-openai`
/// at a custom base URL. Each request is a single user message;
/// there is no tool-calling surface at this layer.
pub struct OpenAiAdapter {
    descriptor: ServiceDescriptor,
    client: Client<OpenAIConfig>,
}

impl OpenAiAdapter {
    pub fn new(descriptor: ServiceDescriptor) -> Self {
        let mut config = OpenAIConfig::new();
        if let Some(base) = &descriptor.base_url {
            config = config.with_api_base(base.clone());
        }
        if let Some(key) = &descriptor.api_key {
            config = config.with_api_key(key.clone());
        }
        Self {
            client: Client::with_config(config),
            descriptor,
        }
    }

    fn model_for(&self, req: &ExecuteRequest) -> Result<String, OxideError> {
        req.model
            .clone()
            .or_else(|| self.descriptor.default_model.clone())
            .ok_or_else(|| OxideError::Config(format!("{}: no model specified or configured", self.descriptor.id)))
    }
}

#[async_trait]
impl Adapter for OpenAiAdapter {
    fn id(&self) -> &str {
        &self.descriptor.id
    }

    fn execute<'a>(&'a self, req: ExecuteRequest) -> BoxStream<'a, Result<Chunk, OxideError>> {
        let service = self.descriptor.id.clone();
        stream::once(async move {
            let model = self.model_for(&req)?;
            let message = ChatCompletionRequestUserMessageArgs::default()
                .content(req.prompt.clone())
                .build()
                .map_err(|e| OxideError::Protocol { service: service.clone(), detail: e.to_string() })?;

            let request = CreateChatCompletionRequestArgs::default()
                .model(model)
                .messages(vec![message.into()])
                .stream(true)
                .build()
                .map_err(|e| OxideError::Protocol { service: service.clone(), detail: e.to_string() })?;

            let stream = self
                .client
                .chat()
                .create_stream(request)
                .await
                .map_err(|e| OxideError::Unavailable(format!("{}: {}", service, e)))?;

            Ok::<_, OxideError>((stream, service))
        })
        .flat_map(|setup| match setup {
            Ok((inner, service)) => inner
                .filter_map(move |res| {
                    let service = service.clone();
                    async move {
                        match res {
                            Ok(resp) => resp
                                .choices
                                .into_iter()
                                .next()
                                .and_then(|c| c.delta.content)
                                .map(|text| Ok(Chunk { text })),
                            Err(e) => Some(Err(OxideError::Protocol { service, detail: e.to_string() })),
                        }
                    }
                })
                .boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        })
        .boxed()
    }

    async fn health_check(&self) -> bool {
        self.client.models().list().await.is_ok()
    }

    async fn list_models(&self) -> Result<Vec<String>, OxideError> {
        let resp = self
            .client
            .models()
            .list()
            .await
            .map_err(|e| OxideError::Unavailable(format!("{}: {}", self.descriptor.id, e)))?;
        Ok(resp.data.into_iter().map(|m| m.id).collect())
    }

    fn describe(&self) -> ServiceDescriptor {
        self.descriptor.clone()
    }
}
