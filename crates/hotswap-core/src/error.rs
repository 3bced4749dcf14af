use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to spawn worker '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake replay failed: {0}")]
    Replay(String),

    #[error("worker crashed {attempts} times in a row without producing output; giving up")]
    RestartLimit { attempts: u32 },

    #[error("invalid config: {0}")]
    Config(String),

    #[error("worker error: {0}")]
    Worker(String),
}

impl ProxyError {
    /// Whether this error must bring the whole proxy down.
    ///
    /// A proxy with no backing worker is indistinguishable from a hang, so
    /// spawn failures and an exhausted crash guard are never absorbed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProxyError::Spawn { .. } | ProxyError::RestartLimit { .. } | ProxyError::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
