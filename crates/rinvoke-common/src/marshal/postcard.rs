use serde::{Deserialize, Serialize};

use crate::protocol::error::Result;
use crate::protocol::{
    InvocationKind, InvocationRequest, InvocationResponse, Metadata, RemoteFailure, RequestId,
};

use super::Marshaller;

/// Compact binary marshaller built on `postcard`.
///
/// Postcard is not self-describing, so dynamic payloads travel as embedded
/// JSON bytes inside an otherwise binary envelope.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostcardMarshaller;

#[derive(Serialize, Deserialize)]
struct RequestEnvelope {
    id: RequestId,
    client_id: String,
    subsystem: String,
    kind: InvocationKind,
    payload: Vec<u8>,
    metadata: Metadata,
}

#[derive(Serialize, Deserialize)]
struct ResponseEnvelope {
    id: RequestId,
    result: Option<Vec<u8>>,
    failure: Option<RemoteFailure>,
    success: bool,
}

impl Marshaller for PostcardMarshaller {
    fn id(&self) -> &'static str {
        "postcard"
    }

    fn encode_request(&self, request: &InvocationRequest) -> Result<Vec<u8>> {
        let envelope = RequestEnvelope {
            id: request.id,
            client_id: request.client_id.clone(),
            subsystem: request.subsystem.clone(),
            kind: request.kind,
            payload: serde_json::to_vec(&request.payload)?,
            metadata: request.metadata.clone(),
        };
        Ok(postcard::to_stdvec(&envelope)?)
    }

    fn decode_request(&self, data: &[u8]) -> Result<InvocationRequest> {
        let envelope: RequestEnvelope = postcard::from_bytes(data)?;
        Ok(InvocationRequest {
            id: envelope.id,
            client_id: envelope.client_id,
            subsystem: envelope.subsystem,
            kind: envelope.kind,
            payload: serde_json::from_slice(&envelope.payload)?,
            metadata: envelope.metadata,
        })
    }

    fn encode_response(&self, response: &InvocationResponse) -> Result<Vec<u8>> {
        let result = match &response.result {
            Some(value) => Some(serde_json::to_vec(value)?),
            None => None,
        };
        let envelope = ResponseEnvelope {
            id: response.id,
            result,
            failure: response.failure.clone(),
            success: response.success,
        };
        Ok(postcard::to_stdvec(&envelope)?)
    }

    fn decode_response(&self, data: &[u8]) -> Result<InvocationResponse> {
        let envelope: ResponseEnvelope = postcard::from_bytes(data)?;
        let result = match envelope.result {
            Some(bytes) => Some(serde_json::from_slice(&bytes)?),
            None => None,
        };
        Ok(InvocationResponse {
            id: envelope.id,
            result,
            failure: envelope.failure,
            success: envelope.success,
        })
    }
}
