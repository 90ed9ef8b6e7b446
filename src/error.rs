use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Malformed template: {0}")]
    Template(String),

    #[error("{0}")]
    Validation(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("Reconcile error: {0}")]
    Reconcile(String),
}

/// Short alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn reconcile(msg: impl Into<String>) -> Self {
        Self::Reconcile(msg.into())
    }
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Races with a concurrent writer: optimistic-concurrency conflicts and
    /// objects that vanished between read and write. Retried once in-pass.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::NotFound(_))
    }

    /// Whether re-running the whole pass later can succeed without a change
    /// to the SSP or to the bundled templates.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube(kube::Error::Api(ae)) => !(400..500).contains(&ae.code),
            Self::Kube(_) => true,
            Self::Conflict(_) | Self::NotFound(_) | Self::Cancelled | Self::Reconcile(_) => true,
            Self::Io(_) => true,
            Self::Serde(_)
            | Self::Yaml(_)
            | Self::Config(_)
            | Self::Template(_)
            | Self::Validation(_) => false,
        }
    }
}
