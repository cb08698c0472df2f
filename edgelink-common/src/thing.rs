//! Cloud "thing" message model.
//!
//! The IoT hub speaks a request/response dialect over MQTT where every
//! payload is a JSON envelope:
//!
//! ```text
//! {"id": 42, "params": {"loraNodeSerialNo": "7076e841", "pump": 1}, "method": "thing.event.property.post"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

/// Method name carried by every property-post telemetry event.
pub const METHOD_PROPERTY_POST: &str = "thing.event.property.post";

/// Reserved parameter naming the field node a message refers to.
pub const NODE_SERIAL_KEY: &str = "loraNodeSerialNo";

/// A cloud message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThingMessage {
    /// Message id. Numeric for events we publish; the hub may send strings.
    #[serde(default)]
    pub id: Value,

    /// Property map, in the order the sender wrote it.
    #[serde(default)]
    pub params: Map<String, Value>,

    /// Method name (absent on some inbound set requests).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

impl ThingMessage {
    /// Build a property-post event.
    pub fn property_post(id: u64, params: Map<String, Value>) -> Self {
        Self {
            id: Value::from(id),
            params,
            method: Some(METHOD_PROPERTY_POST.to_string()),
        }
    }

    /// Parse an inbound payload.
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(payload)?;
        if !value.is_object() {
            return Err(Error::Message("payload is not a JSON object".to_string()));
        }
        if value.get("params").is_none() {
            return Err(Error::Message("params undefined".to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// The field node identifier named by this message, if any.
    pub fn node_serial(&self) -> Option<&str> {
        self.params.get(NODE_SERIAL_KEY).and_then(Value::as_str)
    }

    /// Serialize to a JSON payload.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// The pair of topics a device uses on the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThingTopics {
    /// Topic telemetry events are published to.
    pub post: String,
    /// Topic property-set commands arrive on.
    pub set: String,
}

impl ThingTopics {
    pub fn new(product_key: &str, device_name: &str) -> Self {
        Self {
            post: format!("/sys/{}/{}/thing/event/property/post", product_key, device_name),
            set: format!("/sys/{}/{}/thing/service/property/set", product_key, device_name),
        }
    }
}

/// Process-lifetime message id source. Ids start at zero and never repeat.
#[derive(Debug, Default)]
pub struct MessageIds {
    next: AtomicU64,
}

impl MessageIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next id.
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
