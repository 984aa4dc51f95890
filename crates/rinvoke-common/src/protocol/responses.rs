//! Invocation response types.
//!
//! A response carries either a result value or a typed [`RemoteFailure`]. The
//! failure is re-materialised into the matching [`RinvokeError`] on the client
//! so callers see the same error taxonomy regardless of where it arose.

use serde::{Deserialize, Serialize};

use super::error::{Result, RinvokeError};
use super::requests::{Payload, RequestId};

/// Category of a failure that happened on the remote side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureKind {
    NoSuchHandler,
    HandlerFailure,
    Marshalling,
    InvalidRequest,
    Internal,
}

/// A failure encoded into a response instead of tearing down the connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl RemoteFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        RemoteFailure {
            kind,
            message: message.into(),
        }
    }

    /// Converts back into the client-side error variant.
    pub fn into_error(self) -> RinvokeError {
        match self.kind {
            FailureKind::NoSuchHandler => RinvokeError::NoSuchHandler(self.message),
            FailureKind::HandlerFailure => RinvokeError::HandlerFailure(self.message),
            FailureKind::Marshalling => RinvokeError::Marshalling(self.message),
            FailureKind::InvalidRequest => RinvokeError::InvalidRequest(self.message),
            FailureKind::Internal => RinvokeError::Transport(self.message),
        }
    }
}

impl From<&RinvokeError> for RemoteFailure {
    fn from(err: &RinvokeError) -> Self {
        match err {
            // Keep the bare subsystem name so the client rebuilds the same error
            RinvokeError::NoSuchHandler(name) => {
                RemoteFailure::new(FailureKind::NoSuchHandler, name.clone())
            }
            RinvokeError::HandlerFailure(msg) => {
                RemoteFailure::new(FailureKind::HandlerFailure, msg.clone())
            }
            RinvokeError::Marshalling(msg) => {
                RemoteFailure::new(FailureKind::Marshalling, msg.clone())
            }
            RinvokeError::InvalidRequest(msg) => {
                RemoteFailure::new(FailureKind::InvalidRequest, msg.clone())
            }
            other => RemoteFailure::new(FailureKind::Internal, other.to_string()),
        }
    }
}

impl From<RinvokeError> for RemoteFailure {
    fn from(err: RinvokeError) -> Self {
        RemoteFailure::from(&err)
    }
}

/// A response correlated to an `InvocationRequest` by `id`.
///
/// # Example
///
/// ```
/// use rinvoke_common::protocol::responses::{FailureKind, InvocationResponse};
/// use serde_json::json;
///
/// let ok = InvocationResponse::success(7, json!("bar"));
/// assert_eq!(ok.into_result().unwrap(), json!("bar"));
///
/// let failed = InvocationResponse::error(7, FailureKind::HandlerFailure, "boom");
/// assert!(failed.into_result().is_err());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvocationResponse {
    /// Request identifier this response corresponds to
    pub id: RequestId,
    /// Result value (present on success)
    pub result: Option<Payload>,
    /// Encoded failure (present on failure)
    pub failure: Option<RemoteFailure>,
    /// Whether the invocation succeeded
    pub success: bool,
}

impl InvocationResponse {
    /// Creates a successful response.
    ///
    /// # Arguments
    ///
    /// * `id` - The request identifier (must match the request's ID)
    /// * `result` - The handler's return value
    pub fn success(id: RequestId, result: Payload) -> Self {
        InvocationResponse {
            id,
            result: Some(result),
            failure: None,
            success: true,
        }
    }

    /// Creates a failed response carrying `failure`.
    pub fn failure(id: RequestId, failure: RemoteFailure) -> Self {
        InvocationResponse {
            id,
            result: None,
            failure: Some(failure),
            success: false,
        }
    }

    pub fn error(id: RequestId, kind: FailureKind, message: impl Into<String>) -> Self {
        Self::failure(id, RemoteFailure::new(kind, message))
    }

    /// The result value, or the remote failure as a typed error.
    pub fn into_result(self) -> Result<Payload> {
        if self.success {
            return Ok(self.result.unwrap_or(Payload::Null));
        }
        Err(self
            .failure
            .unwrap_or_else(|| RemoteFailure::new(FailureKind::Internal, "failure without cause"))
            .into_error())
    }
}
