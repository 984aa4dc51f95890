//! # rinvoke CLI
//!
//! Command-line front end for the rinvoke runtime.
//!
//! - `rinvoke serve`: host the built-in handlers on any locator
//! - `rinvoke call`: make one invocation and print the raw JSON result
//! - `rinvoke listen`: register a callback listener and print callbacks as they arrive
//!
//! The handlers hosted by `serve` live in [`handlers`] so they can be tested
//! without a process boundary.

pub mod handlers;

use anyhow::{Context, Result};
use rinvoke_common::{Metadata, Payload};

/// Parses a command-line JSON argument.
///
/// Bare words that are not valid JSON are taken as strings, so
/// `rinvoke call ... -p foo` sends `"foo"`.
pub fn parse_payload(raw: &str) -> Payload {
    serde_json::from_str(raw).unwrap_or_else(|_| Payload::String(raw.to_string()))
}

/// Parses repeated `key=value` options into request metadata.
pub fn parse_metadata(pairs: &[String]) -> Result<Metadata> {
    let mut metadata = Metadata::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("metadata '{}' must look like key=value", pair))?;
        metadata.insert(key.to_string(), value.to_string());
    }
    Ok(metadata)
}
