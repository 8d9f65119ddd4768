use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid parameters: {0}")]
    Validation(String),
    #[error("authentication required for {platform}: {reason}")]
    AuthRequired { platform: String, reason: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("integrity check failed: {0}")]
    Integrity(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("timed out after {0}s")]
    Timeout(u64),
    #[error("cancelled")]
    Cancelled,
    #[error("invalid task state: {0}")]
    InvalidState(String),
    #[error("http status {status} from {url}")]
    Http { status: u16, url: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(String),
}

impl CoreError {
    /// Errors worth an inline retry before surfacing: throttling, server
    /// faults and dropped connections.
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Http { status, .. } => *status == 429 || *status >= 500,
            CoreError::Network(_) => true,
            _ => false,
        }
    }

    /// A short remediation hint for user-facing surfaces, when the cause is
    /// something the user can act on.
    pub fn hint(&self) -> Option<String> {
        match self {
            CoreError::AuthRequired { platform, .. } => Some(format!(
                "set a valid API key for {} in the model manager settings",
                platform
            )),
            CoreError::SizeMismatch { .. } | CoreError::Integrity(_) => {
                Some("the partial file was discarded; create the download again".to_string())
            }
            CoreError::AlreadyExists(_) => {
                Some("remove or rename the existing model file first".to_string())
            }
            CoreError::Timeout(_) => Some("resume the task to continue from the partial file".to_string()),
            CoreError::Http { status: 404, .. } | CoreError::NotFound(_) => {
                Some("check that the download URL is still valid".to_string())
            }
            _ => None,
        }
    }

    /// Message recorded on a task: the error plus its hint, if any.
    pub fn user_message(&self) -> String {
        match self.hint() {
            Some(hint) => format!("{} ({})", self, hint),
            None => self.to_string(),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Storage(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
