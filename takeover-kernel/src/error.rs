use crate::models::PlatformType;

/// Every failure the takeover core can report.
#[derive(Debug, thiserror::Error)]
pub enum TakeoverError {
    #[error("login to platform {0} failed")]
    LoginFailed(String),
    #[error("compute service on host {host} did not come up: {detail}")]
    ComputeServiceActivationFailed { host: String, detail: String },
    #[error("no importable image tagged for platform type {0}")]
    ImageNotFound(PlatformType),
    #[error("malformed host command: {0}")]
    InvalidCommand(String),
    #[error("a synchronization pass is in progress")]
    SyncInProgress,
    #[error("a platform deletion is in progress")]
    DeletionInProgress,
    #[error("remote request failed: {0}")]
    RemoteRequest(String),
    #[error("remote endpoint unreachable: {0}")]
    RemoteConnect(String),
    #[error("platform not found: {0}")]
    PlatformNotFound(String),
    #[error("platform already registered with {field} {value}")]
    DuplicatePlatform { field: &'static str, value: String },
    #[error("invalid platform type: {0}")]
    InvalidPlatformType(String),
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TakeoverError {
    /// Collaborator network failures; callers degrade instead of aborting.
    pub fn is_remote(&self) -> bool {
        matches!(self, TakeoverError::RemoteRequest(_) | TakeoverError::RemoteConnect(_))
    }
}

impl From<reqwest::Error> for TakeoverError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            TakeoverError::RemoteConnect(e.to_string())
        } else {
            TakeoverError::RemoteRequest(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, TakeoverError>;
