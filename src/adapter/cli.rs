use super::{Adapter, ExecuteRequest};
use crate::error::OxideError;
use crate::process_registry;
use crate::types::{Chunk, ServiceDescriptor};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Unregisters its process-registry handle on drop, however the
/// stream holding it is dropped — natural EOF, a protocol error, or
/// the consumer abandoning the stream early (cancellation).
struct RegisteredHandle(Option<u64>);

impl RegisteredHandle {
    fn new(handle: u64) -> Self {
        Self(Some(handle))
    }

    fn take(&mut self) {
        if let Some(handle) = self.0.take() {
            process_registry::global().unregister(handle);
        }
    }
}

impl Drop for RegisteredHandle {
    fn drop(&mut self) {
        self.take();
    }
}

/// Wraps a local CLI tool (e.g. a codegen assistant invoked as a
/// subprocess) behind the `Adapter` interface. The prompt is passed on
/// stdin; stdout is streamed back line by line. Never goes through a
/// shell — arguments are passed as an argv vector.
pub struct CliAdapter {
    descriptor: ServiceDescriptor,
}

impl CliAdapter {
    pub fn new(descriptor: ServiceDescriptor) -> Self {
        Self { descriptor }
    }

    fn executable(&self) -> Result<&str, OxideError> {
        self.descriptor
            .executable
            .as_deref()
            .ok_or_else(|| OxideError::Config(format!("{}: no executable configured", self.descriptor.id)))
    }
}

#[async_trait]
impl Adapter for CliAdapter {
    fn id(&self) -> &str {
        &self.descriptor.id
    }

    fn execute<'a>(&'a self, req: ExecuteRequest) -> BoxStream<'a, Result<Chunk, OxideError>> {
        let service = self.descriptor.id.clone();
        stream::once(async move {
            let exe = self.executable()?;
            let mut child = Command::new(exe)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| OxideError::Unavailable(format!("{}: failed to spawn {}: {}", service, exe, e)))?;

            use tokio::io::AsyncWriteExt;
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(req.prompt.as_bytes()).await;
                drop(stdin);
            }

            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| OxideError::Protocol { service: service.clone(), detail: "no stdout handle".to_string() })?;
            let stderr = child.stderr.take();

            let handle = RegisteredHandle::new(process_registry::global().register(child));
            Ok::<_, OxideError>((stdout, stderr, handle, service))
        })
        .flat_map(|setup| match setup {
            Ok((stdout, stderr, handle, service)) => {
                let lines = BufReader::new(stdout).lines();
                let out = stream::unfold((lines, stderr, handle, service), |(mut lines, stderr, mut handle, service)| async move {
                    match lines.next_line().await {
                        Ok(Some(line)) => Some((Ok(Chunk { text: line }), (lines, stderr, handle, service))),
                        Ok(None) => {
                            handle.take();
                            None
                        }
                        Err(e) => {
                            handle.take();
                            Some((
                                Err(OxideError::Protocol { service: service.clone(), detail: e.to_string() }),
                                (lines, stderr, handle, service),
                            ))
                        }
                    }
                });
                out.boxed()
            }
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        })
        .boxed()
    }

    async fn health_check(&self) -> bool {
        match self.executable() {
            Ok(exe) => which(exe),
            Err(_) => false,
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, OxideError> {
        Ok(self
            .descriptor
            .default_model
            .clone()
            .into_iter()
            .collect())
    }

    fn describe(&self) -> ServiceDescriptor {
        self.descriptor.clone()
    }
}

fn which(exe: &str) -> bool {
    if exe.contains('/') {
        return std::path::Path::new(exe).is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(exe).is_file())
        })
        .unwrap_or(false)
}
