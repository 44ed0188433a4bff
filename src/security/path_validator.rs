use crate::error::OxideError;
use crate::types::ValidatedPath;
use std::path::{Path, PathBuf};

/// Hard-denied path fragments: these are checked against the
/// canonicalized path regardless of whether it falls inside an
/// allowed directory.
const HARD_DENY_PATTERNS: &[&str] = &[
    "/etc/passwd",
    "/etc/shadow",
    "/etc/sudoers",
    "/.ssh/",
    "/root/",
    "/.aws/",
    "/.config/secrets",
];

/// Sandboxes file inputs to a whitelist of absolute directory
/// prefixes. Every rejection is logged with the offending canonical
/// path; `is_path_allowed` is the non-throwing variant used by
/// callers that want a boolean rather than an error.
pub struct PathValidator {
    allowed_dirs: Vec<PathBuf>,
}

impl PathValidator {
    pub fn new(allowed_dirs: Vec<PathBuf>) -> Self {
        let mut resolved: Vec<PathBuf> = Vec::new();
        for dir in allowed_dirs {
            if let Ok(canon) = dir.canonicalize() {
                if !resolved.contains(&canon) {
                    resolved.push(canon);
                }
            }
        }
        if resolved.is_empty() {
            tracing::warn!("path validator initialized with no valid allowed directories");
        } else {
            tracing::info!(count = resolved.len(), "path validator initialized");
        }
        Self {
            allowed_dirs: resolved,
        }
    }

    /// Startup-time defaults: the user's documents/projects/downloads,
    /// the current working directory, `/tmp`, and `/workspace`.
    pub fn with_defaults() -> Self {
        let mut dirs = Vec::new();
        if let Some(home) = dirs_home() {
            dirs.push(home.join("Documents"));
            dirs.push(home.join("Projects"));
            dirs.push(home.join("Downloads"));
        }
        if let Ok(cwd) = std::env::current_dir() {
            dirs.push(cwd);
        }
        dirs.push(PathBuf::from("/tmp"));
        dirs.push(PathBuf::from("/workspace"));
        Self::new(dirs)
    }

    pub fn validate_path(&self, file_path: &str) -> Result<ValidatedPath, OxideError> {
        if file_path.is_empty() {
            return Err(OxideError::Security("empty file path".to_string()));
        }
        if file_path.split('/').any(|seg| seg == "..") || file_path.starts_with('~') {
            tracing::warn!(path = %file_path, "path traversal attempt blocked");
            return Err(OxideError::Security(format!(
                "path traversal detected in '{}'",
                file_path
            )));
        }

        let resolved = Path::new(file_path).canonicalize().map_err(|e| {
            tracing::warn!(path = %file_path, error = %e, "failed to resolve path");
            OxideError::Security(format!("invalid path '{}': {}", file_path, e))
        })?;

        let resolved_str = resolved.to_string_lossy().to_string();

        let allowed = self
            .allowed_dirs
            .iter()
            .any(|dir| resolved.starts_with(dir));
        if !allowed {
            tracing::warn!(path = %resolved_str, "access denied: outside allowed directories");
            return Err(OxideError::Security(format!(
                "'{}' is outside allowed directories",
                resolved_str
            )));
        }

        for pattern in HARD_DENY_PATTERNS {
            if resolved_str.contains(pattern) {
                tracing::error!(path = %resolved_str, pattern = %pattern, "blocked access to sensitive path");
                return Err(OxideError::Security(format!(
                    "access to sensitive system file denied: {}",
                    pattern
                )));
            }
        }

        Ok(ValidatedPath(resolved))
    }

    pub fn validate_paths(&self, file_paths: &[String]) -> Vec<Result<ValidatedPath, OxideError>> {
        file_paths.iter().map(|p| self.validate_path(p)).collect()
    }

    pub fn is_path_allowed(&self, file_path: &str) -> bool {
        self.validate_path(file_path).is_ok()
    }

    pub fn add_allowed_directory(&mut self, directory: &str) {
        let dir = PathBuf::from(directory);
        if let Ok(canon) = dir.canonicalize() {
            if !self.allowed_dirs.contains(&canon) {
                self.allowed_dirs.push(canon.clone());
                tracing::info!(dir = %canon.display(), "added directory to whitelist");
            }
        } else {
            tracing::warn!(dir = %directory, "cannot add non-existent directory to whitelist");
        }
    }

    pub fn allowed_directories(&self) -> &[PathBuf] {
        &self.allowed_dirs
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
