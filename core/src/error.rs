use agentica_protocol::ErrorName;
use reqwest::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgenticaError>;

/// Failures originating from the sandbox bridge or the guest it drives.
#[derive(Error, Debug)]
pub enum SandboxErr {
    #[error("sandbox guest denied request: {0}")]
    Denied(String),
    #[error("sandbox shutdown while request was pending")]
    Shutdown,
    #[error("sandbox guest thread exited unexpectedly")]
    GuestDied,
    #[error("sandbox decode error: {0}")]
    Decode(String),
}

/// The closed error taxonomy for the session manager core (§7 of the
/// specification). Every variant maps to exactly one stable [`ErrorName`]
/// the multiplexer reports to clients.
#[derive(Error, Debug)]
pub enum AgenticaError {
    // Admission
    #[error("too many concurrent invocations")]
    TooManyInvocations,

    // Protocol-level
    #[error("malformed invoke message")]
    MalformedInvokeMessage,
    #[error("invocation is not running")]
    NotRunning,

    // Validation
    #[error("unrecognized model identifier: {0}")]
    BadModel(String),
    #[error("validation error: {0}")]
    Validation(String),

    // Version
    #[error("unsupported sdk version: {0}")]
    UnsupportedVersion(String),

    // Inference (§4.6)
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("insufficient credits")]
    InsufficientCredits,
    #[error("permission denied")]
    PermissionDenied,
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("request too large")]
    RequestTooLarge,
    #[error("unprocessable entity: {0}")]
    UnprocessableEntity(String),
    #[error("rate limited")]
    RateLimit,
    #[error("service unavailable")]
    ServiceUnavailable,
    #[error("model down")]
    ModelDown,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("overloaded")]
    Overloaded,
    #[error("internal server error: {0}")]
    InternalServer(String),
    #[error("inference call timed out")]
    ApiTimeout,
    #[error("inference connection error: {0}")]
    ApiConnection(String),
    #[error("retry limit exceeded after {0} attempts")]
    RetryLimit(u32),
    #[error("max completion tokens exhausted")]
    MaxTokens,
    #[error("max rounds exhausted")]
    MaxRounds,
    #[error("provider refused to complete the request")]
    ContentFiltering,

    // Sandbox
    #[error(transparent)]
    Sandbox(#[from] SandboxErr),

    // Executable
    #[error("tool execution error: {0}")]
    Execution(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AgenticaError {
    /// Map an HTTP status code from the inference endpoint to a typed error,
    /// per the table in §4.6. `body` is included for the variants that carry
    /// a message.
    pub fn from_status(status: StatusCode, body: String) -> Self {
        match status.as_u16() {
            400 => AgenticaError::BadRequest(body),
            401 => AgenticaError::Unauthorized,
            402 => AgenticaError::InsufficientCredits,
            403 => AgenticaError::PermissionDenied,
            404 => AgenticaError::NotFound,
            409 => AgenticaError::Conflict,
            413 => AgenticaError::RequestTooLarge,
            422 => AgenticaError::UnprocessableEntity(body),
            429 => AgenticaError::RateLimit,
            503 => AgenticaError::ServiceUnavailable,
            504 => AgenticaError::DeadlineExceeded,
            529 => AgenticaError::Overloaded,
            _ => AgenticaError::InternalServer(body),
        }
    }

    /// The stable error name reported to clients (§7).
    pub fn error_name(&self) -> ErrorName {
        match self {
            AgenticaError::TooManyInvocations => ErrorName::TooManyInvocationsError,
            AgenticaError::MalformedInvokeMessage => ErrorName::MalformedInvokeMessageError,
            AgenticaError::NotRunning => ErrorName::NotRunningError,
            AgenticaError::BadModel(_) => ErrorName::BadModel,
            AgenticaError::Validation(_) => ErrorName::ValidationError,
            AgenticaError::UnsupportedVersion(_) => ErrorName::UnsupportedVersionError,
            AgenticaError::BadRequest(_) => ErrorName::BadRequest,
            AgenticaError::Unauthorized => ErrorName::Unauthorized,
            AgenticaError::InsufficientCredits => ErrorName::InsufficientCredits,
            AgenticaError::PermissionDenied => ErrorName::PermissionDenied,
            AgenticaError::NotFound => ErrorName::NotFound,
            AgenticaError::Conflict => ErrorName::Conflict,
            AgenticaError::RequestTooLarge => ErrorName::RequestTooLarge,
            AgenticaError::UnprocessableEntity(_) => ErrorName::UnprocessableEntity,
            AgenticaError::RateLimit => ErrorName::RateLimit,
            AgenticaError::ServiceUnavailable => ErrorName::ServiceUnavailable,
            AgenticaError::ModelDown => ErrorName::ModelDown,
            AgenticaError::DeadlineExceeded => ErrorName::DeadlineExceeded,
            AgenticaError::Overloaded => ErrorName::Overloaded,
            AgenticaError::InternalServer(_) | AgenticaError::RetryLimit(_) => {
                ErrorName::InternalServer
            }
            AgenticaError::ApiTimeout => ErrorName::ApiTimeout,
            AgenticaError::ApiConnection(_) => ErrorName::ApiConnection,
            AgenticaError::MaxTokens => ErrorName::MaxTokensError,
            AgenticaError::MaxRounds => ErrorName::MaxRoundsError,
            AgenticaError::ContentFiltering => ErrorName::ContentFilteringError,
            AgenticaError::Sandbox(SandboxErr::Shutdown) => ErrorName::WarpShutdown,
            AgenticaError::Sandbox(_) => ErrorName::SandboxError,
            AgenticaError::Execution(_) => ErrorName::ExecutionError,
            AgenticaError::Io(_) | AgenticaError::Reqwest(_) | AgenticaError::Json(_) => {
                ErrorName::InternalServer
            }
        }
    }

    /// Whether this error is the expected, non-fatal "payload too large"
    /// condition that should exit an invocation silently (§7).
    pub fn is_request_too_large(&self) -> bool {
        matches!(self, AgenticaError::RequestTooLarge)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn maps_status_codes_to_typed_errors() {
        assert!(matches!(
            AgenticaError::from_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            AgenticaError::RateLimit
        ));
        assert!(matches!(
            AgenticaError::from_status(StatusCode::from_u16(529).expect("valid"), String::new()),
            AgenticaError::Overloaded
        ));
        assert!(matches!(
            AgenticaError::from_status(StatusCode::IM_A_TEAPOT, String::new()),
            AgenticaError::InternalServer(_)
        ));
    }

    #[test]
    fn error_name_is_stable_for_sandbox_variants() {
        assert_eq!(
            AgenticaError::Sandbox(SandboxErr::Shutdown).error_name(),
            ErrorName::WarpShutdown
        );
        assert_eq!(
            AgenticaError::Sandbox(SandboxErr::GuestDied).error_name(),
            ErrorName::SandboxError
        );
    }
}
