use thiserror::Error;

/// Failures surfaced to callers of the broker facade.
///
/// Malformed lines never show up here: the reader loop logs and skips them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("Instance {0} not connected")]
    NotConnected(String),
    #[error("Instance '{requested}' not found. Available instances: {}", available_list(.available))]
    InstanceNotFound {
        requested: String,
        available: Vec<String>,
    },
    #[error("No editor instance selected. Select an instance first.")]
    NoInstanceSelected,
    #[error("Timeout waiting for {method} response after {waited_ms}ms")]
    Timeout { method: &'static str, waited_ms: u64 },
    #[error("remote error: {0}")]
    RemoteError(String),
    #[error("socket error: {0}")]
    SocketError(String),
    #[error("Command verification failed: {0}")]
    VerificationFailure(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl BrokerError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BrokerError::Timeout { .. })
    }
}

fn available_list(ids: &[String]) -> String {
    if ids.is_empty() {
        "none".to_string()
    } else {
        ids.join(", ")
    }
}
