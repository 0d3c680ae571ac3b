use argus_types::Domain;

/// Lookup failures against the domain registry.
#[derive(thiserror::Error, Debug)]
pub enum DomainError {
    #[error("domain {domain} with identifier {identifier} is not registered")]
    NotRegistered { domain: Domain, identifier: String },
    #[error("domain {domain} with identifier {identifier} did not load within {timeout:?}")]
    WaitTimeout {
        domain: Domain,
        identifier: String,
        timeout: std::time::Duration,
    },
    #[error("domain {domain} with identifier {identifier} failed to load")]
    LoadFailed { domain: Domain, identifier: String },
}

/// Returned by domain setup functions.
#[derive(thiserror::Error, Debug)]
pub enum SetupError {
    /// The domain cannot set up yet; it will be retried with backoff.
    #[error("domain not ready: {0}")]
    NotReady(String),
    /// Terminal setup failure.
    #[error("{0}")]
    Failed(String),
}

impl SetupError {
    pub fn not_ready<S: Into<String>>(msg: S) -> Self {
        SetupError::NotReady(msg.into())
    }

    pub fn failed<S: Into<String>>(msg: S) -> Self {
        SetupError::Failed(msg.into())
    }
}
