use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use tokio::process::Child;

/// Process-wide singleton tracking every subprocess spawned by a CLI
/// adapter or the service manager's autostart path. Registered on
/// spawn, unregistered on natural exit; on interrupt/termination it
/// walks the set and issues terminate-then-kill with a grace window.
pub struct ProcessRegistry {
    next_handle: AtomicU64,
    children: Mutex<HashMap<u64, Child>>,
    cleaning_up: AtomicBool,
}

static REGISTRY: OnceLock<ProcessRegistry> = OnceLock::new();

pub fn global() -> &'static ProcessRegistry {
    REGISTRY.get_or_init(ProcessRegistry::new)
}

impl ProcessRegistry {
    fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            children: Mutex::new(HashMap::new()),
            cleaning_up: AtomicBool::new(false),
        }
    }

    /// Registers a freshly spawned child and returns a handle used to
    /// unregister it later.
    pub fn register(&self, child: Child) -> u64 {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.children.lock().unwrap().insert(handle, child);
        handle
    }

    /// Removes the entry for a handle whose process has exited
    /// naturally. A no-op if the handle is unknown (already reaped).
    pub fn unregister(&self, handle: u64) {
        self.children.lock().unwrap().remove(&handle);
    }

    pub fn active_count(&self) -> usize {
        self.children.lock().unwrap().len()
    }

    /// Terminates every registered child: SIGTERM (or best-effort kill
    /// on non-unix targets), a short grace window, then force-kill for
    /// anything still alive. Reentrancy-guarded — a second concurrent
    /// call is a no-op.
    pub async fn terminate_all(&self, grace: Duration) {
        if self
            .cleaning_up
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let mut handles: Vec<(u64, Child)> = {
            let mut guard = self.children.lock().unwrap();
            guard.drain().collect()
        };

        for (_, child) in handles.iter_mut() {
            terminate_gracefully(child);
        }

        tokio::time::sleep(grace).await;

        for (_, child) in handles.iter_mut() {
            let _ = child.start_kill();
        }

        self.cleaning_up.store(false, Ordering::SeqCst);
    }
}

#[cfg(unix)]
fn terminate_gracefully(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate_gracefully(child: &mut Child) {
    let _ = child.start_kill();
}

/// Installs a Ctrl-C / termination hook that drains the registry. Safe
/// to call once at process start; subsequent calls are ignored by the
/// underlying `tokio::signal` machinery's first-wins semantics.
pub fn install_shutdown_hook() {
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received, terminating registered subprocesses");
            global().terminate_all(Duration::from_secs(3)).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_unregister_roundtrip() {
        let registry = ProcessRegistry::new();
        let child = tokio::process::Command::new("true").spawn().unwrap();
        let handle = registry.register(child);
        assert_eq!(registry.active_count(), 1);
        registry.unregister(handle);
        assert_eq!(registry.active_count(), 0);
    }
}
