pub mod callback;
pub mod error;
pub mod requests;
pub mod responses;


pub use callback::Callback;
pub use error::{map_io_error, Result, RinvokeError};
pub use requests::{
    generate_request_id, InvocationKind, InvocationRequest, Metadata, Payload, RequestId,
};
pub use responses::{FailureKind, InvocationResponse, RemoteFailure};

/// Request metadata keys understood by the runtime.
pub mod metadata {
    /// Per-call timeout override in milliseconds.
    pub const TIMEOUT: &str = "timeout";
    /// Client-assigned listener registration id.
    pub const LISTENER_ID: &str = "listenerId";
    /// Locator of the client's reverse callback server, when push over a
    /// dedicated connector is requested.
    pub const CALLBACK_LOCATOR: &str = "callbackLocator";
    /// Lease period announced by a client ping, in milliseconds.
    pub const LEASE_PERIOD: &str = "leasePeriod";
}
