//! Error types for the kubedev operator.
//!
//! Three layers:
//! - [`ValidationError`]: the declared spec cannot be projected. Terminal.
//! - [`ClientError`]: a cluster or store call failed. Mostly transient.
//! - [`OperatorError`]: what a reconciliation attempt returns.

use thiserror::Error;

/// A DevEnvironment spec that cannot be turned into cluster objects.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The environment name is empty or not a valid object name.
    #[error("environment name {0:?} is not a valid object name")]
    InvalidName(String),

    /// `owner` is empty.
    #[error("owner must not be empty")]
    EmptyOwner,

    /// `image` is empty.
    #[error("image must not be empty")]
    EmptyImage,

    /// `image` is not a valid image reference.
    #[error("image {0:?} is not a valid image reference")]
    InvalidImage(String),

    /// A port is outside 1..=65535.
    #[error("port {0} is outside the range 1-65535")]
    PortOutOfRange(i32),

    /// A port is declared twice.
    #[error("port {0} is declared more than once")]
    DuplicatePort(i32),

    /// A resource quantity cannot be parsed.
    #[error("{field} {value:?} is not a valid quantity")]
    InvalidQuantity {
        /// Spec field holding the value.
        field: &'static str,
        /// Offending value.
        value: String,
    },

    /// An environment variable name is not a C identifier.
    #[error("environment variable name {0:?} is invalid")]
    InvalidEnvName(String),

    /// The derived namespace is not a DNS label.
    #[error("derived namespace {0:?} is not a valid DNS label")]
    InvalidNamespace(String),
}

/// Failure of a single cluster or store call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// Object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Object already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Resource version conflict.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The call did not complete in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// API server unavailable or throttling (5xx, 429).
    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    /// Rejected by admission or quota.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The API server rejected the object as malformed.
    #[error("invalid object: {0}")]
    Invalid(String),

    /// Connection or protocol failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Retry ceiling reached.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made, including the first.
        attempts: u32,
        /// Error returned by the final attempt.
        last: Box<ClientError>,
    },
}

impl ClientError {
    /// Whether another attempt of the same call may succeed shortly.
    ///
    /// Used by the per-call retry layer. Quota rejections and missing
    /// objects are left to the reconciliation-level requeue.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::Conflict(_)
                | ClientError::Timeout(_)
                | ClientError::Unavailable(_)
                | ClientError::Transport(_)
        )
    }

    /// Whether the request itself is wrong and repeating it cannot help.
    pub fn is_terminal(&self) -> bool {
        match self {
            ClientError::Invalid(_) => true,
            ClientError::Exhausted { last, .. } => last.is_terminal(),
            _ => false,
        }
    }
}

impl From<kube::Error> for ClientError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => {
                let detail = format!("{} ({})", resp.message, resp.reason);
                match resp.code {
                    404 => ClientError::NotFound(detail),
                    409 if resp.reason == "AlreadyExists" => ClientError::AlreadyExists(detail),
                    409 => ClientError::Conflict(detail),
                    403 => ClientError::Forbidden(detail),
                    400 | 422 => ClientError::Invalid(detail),
                    408 | 504 => ClientError::Timeout(detail),
                    429 | 500..=599 => ClientError::Unavailable(detail),
                    code => ClientError::Transport(format!("HTTP {code}: {detail}")),
                }
            }
            other => ClientError::Transport(other.to_string()),
        }
    }
}

/// Errors that can occur during operator operations.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Spec validation failed.
    #[error("invalid spec: {0}")]
    Validation(#[from] ValidationError),

    /// Cluster or store call failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Invalid operator configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Malformed internal state.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OperatorError {
    /// Terminal errors end in `Failed` and are not retried until the spec changes.
    pub fn is_terminal(&self) -> bool {
        match self {
            OperatorError::Validation(_)
            | OperatorError::SerializationError(_)
            | OperatorError::Internal(_) => true,
            OperatorError::Client(err) => err.is_terminal(),
            OperatorError::InvalidConfig(_) => false,
        }
    }
}

/// Result type for operator operations.
pub type OperatorResult<T> = Result<T, OperatorError>;

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for OperatorError {
    fn from(err: serde_yaml::Error) -> Self {
        OperatorError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn api_errors_map_by_status_code() {
        assert!(matches!(
            ClientError::from(api_error(404, "NotFound")),
            ClientError::NotFound(_)
        ));
        assert!(matches!(
            ClientError::from(api_error(409, "AlreadyExists")),
            ClientError::AlreadyExists(_)
        ));
        assert!(matches!(
            ClientError::from(api_error(409, "Conflict")),
            ClientError::Conflict(_)
        ));
        assert!(matches!(
            ClientError::from(api_error(403, "Forbidden")),
            ClientError::Forbidden(_)
        ));
        assert!(matches!(
            ClientError::from(api_error(422, "Invalid")),
            ClientError::Invalid(_)
        ));
        assert!(matches!(
            ClientError::from(api_error(503, "ServiceUnavailable")),
            ClientError::Unavailable(_)
        ));
        assert!(matches!(
            ClientError::from(api_error(504, "Timeout")),
            ClientError::Timeout(_)
        ));
    }

    #[test]
    fn quota_rejection_is_retryable_but_not_per_call() {
        let err = ClientError::Forbidden("exceeded quota".to_string());
        assert!(!err.is_transient());
        assert!(!OperatorError::from(err).is_terminal());
    }

    #[test]
    fn validation_and_invalid_objects_are_terminal() {
        assert!(OperatorError::from(ValidationError::PortOutOfRange(70000)).is_terminal());
        assert!(OperatorError::from(ClientError::Invalid("bad".into())).is_terminal());

        let exhausted = ClientError::Exhausted {
            attempts: 3,
            last: Box::new(ClientError::Timeout("slow".into())),
        };
        assert!(!OperatorError::from(exhausted).is_terminal());
    }
}
