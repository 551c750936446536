//! # Envelope
//!
//! Every record on the bus is an `Envelope`: metadata describing the
//! record, and the data itself. The metadata version gates which stage may
//! handle a record, so decoding is done in two steps: the metadata first,
//! and the data only once its version is known to be supported.
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub version: u32,
    pub correlation_id: String,
    pub request_id: String,
}

impl Metadata {
    /// Metadata for a record starting a new flow.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            correlation_id: Uuid::new_v4().to_string(),
            request_id: Uuid::new_v4().to_string(),
        }
    }

    /// Metadata for a record emitted while handling this one: the
    /// correlation id carries over, the request id is new.
    pub fn forward(&self, version: u32) -> Self {
        Self {
            version,
            correlation_id: self.correlation_id.clone(),
            request_id: Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub metadata: Metadata,
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn new(metadata: Metadata, data: T) -> Self {
        Self { metadata, data }
    }
}

/// An envelope whose data has not been decoded yet.
pub type RawEnvelope = Envelope<serde_json::Value>;

/// Outcome of decoding a `RawEnvelope` for a given `Topic`.
#[derive(Debug)]
pub enum Versioned<T> {
    Supported(Envelope<T>),
    Unsupported(Metadata),
}

/// A topic name and the version of the records a stage reads from or writes to it.
pub struct Topic<T> {
    pub name: String,
    pub version: u32,
    data: PhantomData<fn() -> T>,
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            version: self.version,
            data: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Topic<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish()
    }
}

impl<T> Topic<T> {
    pub fn new(name: &str, version: u32) -> Self {
        Self {
            name: name.to_owned(),
            version,
            data: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Topic<T> {
    /// Decode the data of `raw` if its version is the one this topic carries.
    /// Records of another version are handed back as `Unsupported` without
    /// looking at their data.
    pub fn decode(&self, raw: RawEnvelope) -> Result<Versioned<T>, serde_json::Error> {
        if raw.metadata.version != self.version {
            return Ok(Versioned::Unsupported(raw.metadata));
        }

        let data = serde_json::from_value(raw.data)?;
        Ok(Versioned::Supported(Envelope::new(raw.metadata, data)))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[derive(Debug, PartialEq, Deserialize)]
    struct Greeting {
        text: String,
    }

    fn raw(version: u32, data: serde_json::Value) -> RawEnvelope {
        serde_json::from_value(json!({
            "metadata": {
                "version": version,
                "correlationId": "correlation",
                "requestId": "request"
            },
            "data": data
        }))
        .unwrap()
    }

    #[test]
    fn decodes_matching_version() {
        let topic = Topic::<Greeting>::new("greetings", 1);

        match topic.decode(raw(1, json!({"text": "hei"}))).unwrap() {
            Versioned::Supported(envelope) => {
                assert_eq!(envelope.metadata.correlation_id, "correlation");
                assert_eq!(envelope.data.text, "hei");
            }
            Versioned::Unsupported(_) => panic!("expected a supported record"),
        }
    }

    #[test]
    fn other_versions_are_not_decoded() {
        let topic = Topic::<Greeting>::new("greetings", 1);

        // The v2 data does not even fit the v1 shape
        match topic.decode(raw(2, json!({"words": ["hei"]}))).unwrap() {
            Versioned::Unsupported(metadata) => assert_eq!(metadata.version, 2),
            Versioned::Supported(_) => panic!("expected an unsupported record"),
        }
    }

    #[test]
    fn malformed_data_is_an_error() {
        let topic = Topic::<Greeting>::new("greetings", 1);

        assert!(topic.decode(raw(1, json!({"words": ["hei"]}))).is_err());
    }

    #[test]
    fn forward_keeps_correlation_id() {
        let metadata = Metadata::new(1);
        let forwarded = metadata.forward(1);

        assert_eq!(forwarded.correlation_id, metadata.correlation_id);
        assert_ne!(forwarded.request_id, metadata.request_id);
    }

    #[test]
    fn metadata_is_camel_case() {
        let envelope = Envelope::new(
            Metadata {
                version: 1,
                correlation_id: "c".to_owned(),
                request_id: "r".to_owned(),
            },
            json!({}),
        );

        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({
                "metadata": {"version": 1, "correlationId": "c", "requestId": "r"},
                "data": {}
            })
        );
    }
}
