use crate::adapter::Adapter;
use crate::error::OxideError;
use crate::process_registry;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

/// Drives a backend's lifecycle independent of any one request:
/// health probing, autostart, and model auto-detection. Grounded in
/// `original_source/utils/service_manager.py`'s `ensure_ollama_running`
/// / `_check_ollama_health` / `_start_ollama` trio.
pub struct ServiceManager {
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl ServiceManager {
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            poll_timeout: Duration::from_secs(10),
        }
    }

    /// Health-checks the adapter; if unhealthy, attempts a
    /// platform-appropriate autostart and polls until healthy or the
    /// timeout elapses.
    pub async fn ensure_running(&self, adapter: &dyn Adapter, autostart_command: Option<&str>) -> Result<(), OxideError> {
        if adapter.health_check().await {
            return Ok(());
        }

        let Some(command) = autostart_command else {
            return Err(OxideError::Unavailable(format!("{} is not running and has no autostart command", adapter.id())));
        };

        tracing::info!(service = %adapter.id(), "service unhealthy, attempting autostart");
        start_detached(adapter.id(), command)?;

        let deadline = tokio::time::Instant::now() + self.poll_timeout;
        while tokio::time::Instant::now() < deadline {
            if adapter.health_check().await {
                tracing::info!(service = %adapter.id(), "service became healthy after autostart");
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        Err(OxideError::Unavailable(format!("{} still unhealthy after autostart", adapter.id())))
    }

    pub async fn ensure_healthy(&self, adapter: &dyn Adapter) -> bool {
        adapter.health_check().await
    }

    /// Picks a model from `adapter`'s installed set: the first
    /// preference present exactly, else the first model whose name
    /// case-insensitively contains a preference token, else the first
    /// installed model.
    pub async fn auto_detect_model(&self, adapter: &dyn Adapter, preferences: &[String]) -> Result<Option<String>, OxideError> {
        let models = adapter.list_models().await?;
        if models.is_empty() {
            return Ok(None);
        }

        for preference in preferences {
            if models.iter().any(|m| m == preference) {
                return Ok(Some(preference.clone()));
            }
        }

        for preference in preferences {
            let needle = preference.to_lowercase();
            if let Some(found) = models.iter().find(|m| m.to_lowercase().contains(&needle)) {
                return Ok(Some(found.clone()));
            }
        }

        Ok(models.into_iter().next())
    }

    /// Spawns a background task that re-runs `ensure_healthy` on an
    /// interval and logs state transitions, matching the original's
    /// periodic health thread.
    pub fn spawn_monitor(self: Arc<Self>, adapter: Arc<dyn Adapter>, interval: Duration) {
        tokio::spawn(async move {
            let mut last_healthy = true;
            loop {
                tokio::time::sleep(interval).await;
                let healthy = self.ensure_healthy(&*adapter).await;
                if healthy != last_healthy {
                    tracing::warn!(service = %adapter.id(), healthy, "service health transition");
                    last_healthy = healthy;
                }
            }
        });
    }
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "macos")]
fn start_detached(service_id: &str, command: &str) -> Result<(), OxideError> {
    if command.starts_with("open -a ") {
        let app = command.trim_start_matches("open -a ");
        spawn_and_register(service_id, "open", &["-a", app])
    } else {
        spawn_shell_detached(service_id, command)
    }
}

#[cfg(target_os = "linux")]
fn start_detached(service_id: &str, command: &str) -> Result<(), OxideError> {
    if command.starts_with("systemctl --user start ") {
        let unit = command.trim_start_matches("systemctl --user start ");
        spawn_and_register(service_id, "systemctl", &["--user", "start", unit])
    } else {
        spawn_shell_detached(service_id, command)
    }
}

#[cfg(target_os = "windows")]
fn start_detached(service_id: &str, command: &str) -> Result<(), OxideError> {
    use std::os::windows::process::CommandExt;
    const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;
    let mut parts = command.split_whitespace();
    let exe = parts.next().ok_or_else(|| OxideError::Config("empty autostart command".to_string()))?;
    let mut cmd = std::process::Command::new(exe);
    cmd.args(parts).creation_flags(CREATE_NEW_CONSOLE);
    let child = tokio::process::Command::from(cmd)
        .spawn()
        .map_err(|e| OxideError::Unavailable(format!("{}: failed to spawn {}: {}", service_id, exe, e)))?;
    process_registry::global().register(child);
    Ok(())
}

#[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
fn start_detached(service_id: &str, command: &str) -> Result<(), OxideError> {
    spawn_shell_detached(service_id, command)
}

#[allow(dead_code)]
fn spawn_shell_detached(service_id: &str, command: &str) -> Result<(), OxideError> {
    let mut parts = command.split_whitespace();
    let exe = parts.next().ok_or_else(|| OxideError::Config("empty autostart command".to_string()))?;
    let args: Vec<&str> = parts.collect();
    spawn_and_register(service_id, exe, &args)
}

fn spawn_and_register(service_id: &str, exe: &str, args: &[&str]) -> Result<(), OxideError> {
    let child = Command::new(exe)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| OxideError::Unavailable(format!("{}: failed to spawn {}: {}", service_id, exe, e)))?;
    process_registry::global().register(child);
    Ok(())
}
