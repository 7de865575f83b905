/// Errors raised across the poller.
///
/// The variants follow the failure classes the poller distinguishes at
/// runtime: configuration problems are fatal at startup and never raised
/// afterwards, authentication problems disable a single collector,
/// transient network problems are retried with backoff, and protocol or
/// parse problems fail a single cycle or cell without touching anything
/// else.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or contradictory configuration. Fatal at startup.
    #[error("config: {0}")]
    Config(String),

    /// Credentials unavailable or rejected by the remote. Fatal for the
    /// affected collector only.
    #[error("auth: {0}")]
    Auth(String),

    /// Network timeout, connection reset or 5xx. Retried on the next
    /// schedule tick; consecutive occurrences trigger backoff.
    #[error("transient: {0}")]
    Transient(String),

    /// The remote answered with something that violates the expected
    /// schema. The cycle fails; the next one runs at normal cadence.
    #[error("protocol: {0}")]
    Protocol(String),

    /// The remote reports zero instances for the polled object.
    #[error("no instances: {0}")]
    NoInstance(String),

    /// A value failed numeric conversion. The affected cell is skipped,
    /// the rest of the row survives.
    #[error("parse: invalid value {value:?} for {name:?}")]
    Parse { name: String, value: String },

    /// An instance key was added twice to the same matrix.
    #[error("duplicate instance key {0:?}")]
    DuplicateInstance(String),

    /// A metric key was added twice to the same matrix.
    #[error("duplicate metric key {0:?}")]
    DuplicateMetric(String),

    /// A referenced instance or metric does not exist in the matrix.
    #[error("missing {kind} {key:?}")]
    Missing { kind: &'static str, key: String },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    pub fn parse(name: impl Into<String>, value: impl Into<String>) -> Self {
        Error::Parse {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn missing(kind: &'static str, key: impl Into<String>) -> Self {
        Error::Missing {
            kind,
            key: key.into(),
        }
    }

    /// Whether consecutive occurrences of this error should widen the
    /// schedule interval.
    pub fn triggers_backoff(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
