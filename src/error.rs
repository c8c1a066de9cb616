use hyper::StatusCode;

use crate::store::StoreError;

/// Failures that abort a single proxied request. None of these are recovered
/// locally; the HTTP boundary maps them to an error response for the consumer.
#[derive(Debug)]
pub enum ProxyError {
    /// More than one stored example matched the request.
    AmbiguousMatch { keys: Vec<String> },
    /// Recording would overwrite an existing example.
    DuplicateExample { key: String },
    /// A stored example could not be loaded.
    CorruptExample { key: String, reason: String },
    /// The upstream forwarding call failed.
    TransportFailure { reason: String },
    /// The example store itself failed.
    StoreFailure { reason: String },
}

impl ProxyError {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::AmbiguousMatch { .. } => "ambiguous_match",
            Self::DuplicateExample { .. } => "duplicate_example",
            Self::CorruptExample { .. } => "corrupt_example",
            Self::TransportFailure { .. } => "transport_failure",
            Self::StoreFailure { .. } => "store_failure",
        }
    }

    /// Status reported to the consumer when this error aborts the request.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::TransportFailure { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AmbiguousMatch { keys } => {
                write!(f, "multiple examples match the request: {}", keys.join(", "))
            }
            Self::DuplicateExample { key } => {
                write!(f, "example `{key}` already exists; recording never overwrites")
            }
            Self::CorruptExample { key, reason } => {
                write!(f, "load example `{key}`: {reason}")
            }
            Self::TransportFailure { reason } => write!(f, "forward to upstream: {reason}"),
            Self::StoreFailure { reason } => write!(f, "example store: {reason}"),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<StoreError> for ProxyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyExists(key) => Self::DuplicateExample { key },
            StoreError::Io { .. } => Self::StoreFailure {
                reason: err.to_string(),
            },
        }
    }
}
