use crate::protocol::error::Result;
use crate::protocol::{InvocationRequest, InvocationResponse};

use super::Marshaller;

/// JSON marshaller.
///
/// Self-describing and human-readable; the default when a locator names no
/// `serializationtype`.
///
/// # Example
///
/// ```
/// use rinvoke_common::marshal::{JsonMarshaller, Marshaller};
/// use rinvoke_common::protocol::InvocationRequest;
/// use serde_json::json;
///
/// let request = InvocationRequest::invoke("test", json!({"n": 42}));
/// let encoded = JsonMarshaller.encode_request(&request).unwrap();
/// let decoded = JsonMarshaller.decode_request(&encoded).unwrap();
/// assert_eq!(request, decoded);
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonMarshaller;

impl Marshaller for JsonMarshaller {
    fn id(&self) -> &'static str {
        "json"
    }

    fn encode_request(&self, request: &InvocationRequest) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(request)?)
    }

    fn decode_request(&self, data: &[u8]) -> Result<InvocationRequest> {
        Ok(serde_json::from_slice(data)?)
    }

    fn encode_response(&self, response: &InvocationResponse) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(response)?)
    }

    fn decode_response(&self, data: &[u8]) -> Result<InvocationResponse> {
        Ok(serde_json::from_slice(data)?)
    }
}
