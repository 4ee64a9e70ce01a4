use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A request travelling over a channel port.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChannelMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: i64,
}

impl ChannelMessage {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            data,
            timestamp: now_millis(),
        }
    }

    /// A message with a freshly generated id.
    pub fn request(kind: impl Into<String>, data: Option<Value>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), kind, data)
    }
}

/// The answer to a [`ChannelMessage`], matched by id.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChannelResponse {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: i64,
}

impl ChannelResponse {
    pub fn ok(id: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            id: id.into(),
            success: true,
            data,
            error: None,
            timestamp: now_millis(),
        }
    }

    pub fn err(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(error.into()),
            timestamp: now_millis(),
        }
    }
}

/// Anything a port can carry.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum PortMessage {
    Response(ChannelResponse),
    Request(ChannelMessage),
}

impl PortMessage {
    pub fn timestamp(&self) -> i64 {
        match self {
            PortMessage::Request(m) => m.timestamp,
            PortMessage::Response(r) => r.timestamp,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            PortMessage::Request(m) => &m.id,
            PortMessage::Response(r) => &r.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_wire_shape() {
        let msg = ChannelMessage {
            id: "m1".to_string(),
            kind: "write".to_string(),
            data: Some(json!({"bytes": "ls\n"})),
            timestamp: 1700000000000,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "m1",
                "type": "write",
                "data": {"bytes": "ls\n"},
                "timestamp": 1700000000000i64
            })
        );
    }

    #[test]
    fn test_message_without_data_omits_field() {
        let msg = ChannelMessage::new("m2", "ping", None);
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("data").is_none());
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_untagged_port_message_distinguishes_responses() {
        let response: PortMessage =
            serde_json::from_str(r#"{"id":"a","success":false,"error":"boom","timestamp":5}"#)
                .unwrap();
        let expected = ChannelResponse {
            id: "a".to_string(),
            success: false,
            data: None,
            error: Some("boom".to_string()),
            timestamp: 5,
        };
        assert_eq!(response, PortMessage::Response(expected));

        let request: PortMessage =
            serde_json::from_str(r#"{"id":"b","type":"ping","timestamp":6}"#).unwrap();
        assert!(matches!(request, PortMessage::Request(_)));
        assert_eq!(request.id(), "b");
        assert_eq!(request.timestamp(), 6);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = ChannelMessage::request("ping", None);
        let b = ChannelMessage::request("ping", None);
        assert_ne!(a.id, b.id);
    }
}
