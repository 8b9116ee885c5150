use thiserror::Error;

/// Why a probe could not produce an [`crate::ActivityState`].
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("couldn't log in with any known credentials")]
    Unreachable,
    #[error("unparsable remote output: {0}")]
    Protocol(String),
    #[error("remote command failed: {0}")]
    Remote(String),
}

impl ProbeError {
    /// Unreachable and protocol errors both mean "cannot classify" and take
    /// the impaired-health fallback path. Anything else fails the instance.
    pub fn is_unclassifiable(&self) -> bool {
        matches!(self, ProbeError::Unreachable | ProbeError::Protocol(_))
    }
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("master host '{host}' not found in master registry")]
    RegistryLookup { host: String },
    #[error("no buildmaster_host entry in worker state file")]
    MissingMasterHost,
    #[error("graceful shutdown request failed: {0}")]
    Http(String),
}
