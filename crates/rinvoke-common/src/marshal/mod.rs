//! Pluggable marshalling.
//!
//! A [`Marshaller`] turns invocation requests and responses into bytes. The
//! [`MarshallerRegistry`] maps serialization ids to marshallers so that one
//! server can decode each request with whatever marshaller its client chose:
//!
//! - socket-family frames carry the marshaller id in their header
//! - HTTP requests carry it in the `Content-Type` (`application/x-rinvoke-<id>`)
//!
//! Clients pick a marshaller from the locator's `serializationtype` parameter.

mod json;
mod postcard;

pub use self::json::JsonMarshaller;
pub use self::postcard::PostcardMarshaller;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::locator::{params, Locator};
use crate::protocol::error::{Result, RinvokeError};
use crate::protocol::{InvocationRequest, InvocationResponse};

/// Prefix of the HTTP content type naming a marshaller.
pub const CONTENT_TYPE_PREFIX: &str = "application/x-rinvoke-";

/// Marshaller used when nothing else is requested.
pub const DEFAULT_MARSHALLER: &str = "json";

pub trait Marshaller: Send + Sync + fmt::Debug {
    /// Serialization id, as written in `serializationtype` and on the wire.
    fn id(&self) -> &'static str;

    fn content_type(&self) -> String {
        format!("{}{}", CONTENT_TYPE_PREFIX, self.id())
    }

    fn encode_request(&self, request: &InvocationRequest) -> Result<Vec<u8>>;
    fn decode_request(&self, data: &[u8]) -> Result<InvocationRequest>;
    fn encode_response(&self, response: &InvocationResponse) -> Result<Vec<u8>>;
    fn decode_response(&self, data: &[u8]) -> Result<InvocationResponse>;
}

/// Serialization id to marshaller mapping.
///
/// # Example
///
/// ```
/// use rinvoke_common::marshal::MarshallerRegistry;
/// use rinvoke_common::locator::Locator;
///
/// let registry = MarshallerRegistry::default();
/// let locator: Locator = "socket://h:1/?serializationtype=postcard".parse().unwrap();
/// assert_eq!(registry.for_locator(&locator).unwrap().id(), "postcard");
/// ```
#[derive(Clone)]
pub struct MarshallerRegistry {
    marshallers: HashMap<String, Arc<dyn Marshaller>>,
}

impl MarshallerRegistry {
    /// A registry with no marshallers.
    pub fn empty() -> Self {
        Self {
            marshallers: HashMap::new(),
        }
    }

    /// Registers (or replaces) the marshaller for its id.
    pub fn register(&mut self, marshaller: Arc<dyn Marshaller>) {
        self.marshallers
            .insert(marshaller.id().to_ascii_lowercase(), marshaller);
    }

    /// Looks up a marshaller by id (case-insensitive).
    pub fn get(&self, id: &str) -> Result<Arc<dyn Marshaller>> {
        self.marshallers
            .get(&id.trim().to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| RinvokeError::Marshalling(format!("unknown serialization type '{}'", id)))
    }

    /// The marshaller named by `serializationtype`, or the default.
    pub fn for_locator(&self, locator: &Locator) -> Result<Arc<dyn Marshaller>> {
        self.get(
            locator
                .param(params::SERIALIZATION_TYPE)
                .unwrap_or(DEFAULT_MARSHALLER),
        )
    }

    /// Resolves a `Content-Type` header value.
    ///
    /// `application/json` and a missing header map to the JSON marshaller.
    pub fn from_content_type(&self, content_type: Option<&str>) -> Result<Arc<dyn Marshaller>> {
        let essence = content_type
            .and_then(|ct| ct.split(';').next())
            .map(str::trim)
            .unwrap_or("");
        match essence.strip_prefix(CONTENT_TYPE_PREFIX) {
            Some(id) => self.get(id),
            None if essence.is_empty() || essence.eq_ignore_ascii_case("application/json") => {
                self.get(DEFAULT_MARSHALLER)
            }
            None => Err(RinvokeError::Marshalling(format!(
                "unsupported content type '{}'",
                essence
            ))),
        }
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.marshallers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for MarshallerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(JsonMarshaller));
        registry.register(Arc::new(PostcardMarshaller));
        registry
    }
}

impl fmt::Debug for MarshallerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarshallerRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_ids() {
        assert_eq!(MarshallerRegistry::default().ids(), vec!["json", "postcard"]);
    }

    #[test]
    fn test_locator_without_serialization_type_uses_json() {
        let locator: Locator = "socket://h:1".parse().unwrap();
        let marshaller = MarshallerRegistry::default().for_locator(&locator).unwrap();
        assert_eq!(marshaller.id(), "json");
    }

    #[test]
    fn test_unknown_serialization_type() {
        let locator: Locator = "socket://h:1/?serializationtype=xdr".parse().unwrap();
        assert!(matches!(
            MarshallerRegistry::default().for_locator(&locator),
            Err(RinvokeError::Marshalling(_))
        ));
    }

    #[test]
    fn test_content_type_negotiation() {
        let registry = MarshallerRegistry::default();
        let postcard = registry
            .from_content_type(Some("application/x-rinvoke-postcard; charset=binary"))
            .unwrap();
        assert_eq!(postcard.id(), "postcard");
        assert_eq!(postcard.content_type(), "application/x-rinvoke-postcard");
        assert_eq!(registry.from_content_type(None).unwrap().id(), "json");
        assert_eq!(
            registry.from_content_type(Some("application/json")).unwrap().id(),
            "json"
        );
        assert!(registry.from_content_type(Some("text/html")).is_err());
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = MarshallerRegistry::empty();
        assert!(registry.get("json").is_err());
        registry.register(Arc::new(JsonMarshaller));
        registry.register(Arc::new(JsonMarshaller));
        assert_eq!(registry.ids(), vec!["json"]);
    }
}
