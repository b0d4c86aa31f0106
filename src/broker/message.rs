use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Ordered mapping of named payload fields.
pub type Payload = Map<String, Value>;

/// Transport properties attached to a message.
///
/// These travel as broker message properties (content type, delivery mode,
/// `type`, `message-id`) and are never embedded in the JSON body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub persistent: bool,
    /// Free-form `type` tag used for routing/semantics.
    pub kind: Option<String>,
    pub message_id: Option<String>,
}

impl MessageProperties {
    /// Properties for a JSON body.
    pub fn json() -> Self {
        Self {
            content_type: Some("application/json".to_string()),
            ..Self::default()
        }
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

/// The unit exchanged through the broker.
///
/// On the wire the body is a JSON object `{"payload": {...}, "mandatory": bool}`.
/// `properties` and `retries` are local: the former is carried by the
/// transport, the latter is filled in by the listener from its retry
/// bookkeeping.
///
/// # Example
///
/// ```rust
/// use crispy::broker::message::{Message, MessageProperties};
/// use serde_json::json;
///
/// let payload = json!({"url": "https://example.com/a", "content": "..."});
/// let msg = Message::new(payload.as_object().cloned().unwrap_or_default())
///     .with_properties(MessageProperties::json().persistent());
/// let body = msg.to_json().unwrap();
/// let decoded = Message::from_json(&body, MessageProperties::default()).unwrap();
/// assert_eq!(decoded.payload, msg.payload);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub payload: Payload,
    #[serde(default = "default_mandatory")]
    pub mandatory: bool,
    #[serde(skip)]
    pub properties: MessageProperties,
    #[serde(skip)]
    pub retries: u32,
}

fn default_mandatory() -> bool {
    true
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            mandatory: true,
            properties: MessageProperties::default(),
            retries: 0,
        }
    }

    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    /// Serializes the wire body.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Rebuilds a message from a wire body and the properties delivered with it.
    pub fn from_json(body: &[u8], properties: MessageProperties) -> Result<Self, serde_json::Error> {
        let mut message: Message = serde_json::from_slice(body)?;
        message.properties = properties;
        Ok(message)
    }

    /// Returns a payload field as a string slice when it holds a string.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.payload.get(name).and_then(Value::as_str)
    }
}
