use crate::types::TaskCategory;
use thiserror::Error;

/// The closed error-kind enumeration that drives retry and fallback
/// policy. Every layer above an adapter matches on these variants
/// rather than on string content — see `is_fallback_only` and
/// `is_retryable_in_place` for the policy table.
#[derive(Debug, Error)]
pub enum OxideError {
    #[error("config error: {0}")]
    Config(String),

    #[error("no service available for category {0:?}")]
    NoServiceAvailable(TaskCategory),

    #[error("service '{0}' unavailable")]
    Unavailable(String),

    #[error("adapter call to '{service}' timed out after {secs}s")]
    Timeout { service: String, secs: u64 },

    #[error("protocol error from '{service}': {detail}")]
    Protocol { service: String, detail: String },

    #[error("security: {0}")]
    Security(String),

    #[error("cancelled")]
    Cancelled,
}

impl OxideError {
    /// Unavailable and Timeout both mean "walk to the next fallback,
    /// no in-place retry."
    pub fn is_fallback_only(&self) -> bool {
        matches!(self, OxideError::Unavailable(_) | OxideError::Timeout { .. })
    }

    /// Protocol errors retry in place (up to max_retries) before
    /// falling back; Config and Security errors are always fatal for
    /// their scope.
    pub fn is_retryable_in_place(&self) -> bool {
        matches!(self, OxideError::Protocol { .. })
    }

    pub fn service_name(&self) -> Option<&str> {
        match self {
            OxideError::Unavailable(s) => Some(s),
            OxideError::Timeout { service, .. } => Some(service),
            OxideError::Protocol { service, .. } => Some(service),
            _ => None,
        }
    }
}
