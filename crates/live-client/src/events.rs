//! Domain payloads carried by the live channels.

use std::fmt;

use serde::de::{self, DeserializeOwned, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::channel::Channel;

/// Judge statuses that mean "still running"; every other status is a verdict.
pub const NON_TERMINAL_STATUSES: &[&str] = &["评测中", "Judging", "Pending"];

/// Identifier used to match an event against a locally held record.
///
/// Different layers send the same id as a JSON number or a JSON string, so the key
/// is always stored in its string form and compared as such.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationKey(String);

impl CorrelationKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Accepts a JSON string or number; anything else has no key.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) => Some(Self::from(text.as_str())),
            Value::Number(number) => {
                if let Some(unsigned) = number.as_u64() {
                    Some(Self::from(unsigned))
                } else if let Some(signed) = number.as_i64() {
                    Some(Self::from(signed))
                } else {
                    number.as_f64().map(Self::from_float)
                }
            }
            _ => None,
        }
    }

    fn from_float(value: f64) -> Self {
        if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15 {
            Self((value as i64).to_string())
        } else {
            Self(value.to_string())
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationKey {
    fn from(value: &str) -> Self {
        Self(value.trim().to_string())
    }
}

impl From<String> for CorrelationKey {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<u64> for CorrelationKey {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl From<i64> for CorrelationKey {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl Serialize for CorrelationKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for CorrelationKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KeyVisitor;

        impl<'de> Visitor<'de> for KeyVisitor {
            type Value = CorrelationKey;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string or numeric identifier")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                Ok(CorrelationKey::from(value))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(CorrelationKey::from(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                Ok(CorrelationKey::from(value))
            }

            fn visit_f64<E: de::Error>(self, value: f64) -> Result<Self::Value, E> {
                Ok(CorrelationKey::from_float(value))
            }
        }

        deserializer.deserialize_any(KeyVisitor)
    }
}

/// A non-heartbeat frame, forwarded verbatim to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub channel: Channel,
    pub payload: Value,
}

impl DomainEvent {
    pub fn new(channel: Channel, payload: Value) -> Self {
        Self { channel, payload }
    }

    pub fn event_type(&self) -> Option<&str> {
        self.payload.get("type").and_then(Value::as_str)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// Verdict update pushed on the judge channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeEvent {
    #[serde(rename = "snowflakeId", alias = "submissionId")]
    pub submission: CorrelationKey,
    pub status: String,
    #[serde(default)]
    pub time: Option<u64>,
    #[serde(default)]
    pub memory: Option<u64>,
    #[serde(default, rename = "errorInfo", skip_serializing_if = "Option::is_none")]
    pub error_info: Option<String>,
}

impl JudgeEvent {
    pub fn is_terminal(&self) -> bool {
        !NON_TERMINAL_STATUSES.contains(&self.status.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: CorrelationKey,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default, rename = "createTime")]
    pub create_time: Option<String>,
    #[serde(default, rename = "commentId", skip_serializing_if = "Option::is_none")]
    pub comment_id: Option<CorrelationKey>,
}

/// Private-message activity. Only the sender matters to the client; everything
/// else is kept for subscribers that render it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    #[serde(default, rename = "senderId")]
    pub sender: Option<CorrelationKey>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn correlation_key_ignores_json_type() {
        let from_string: CorrelationKey = serde_json::from_value(json!("42")).unwrap();
        let from_number: CorrelationKey = serde_json::from_value(json!(42)).unwrap();
        let from_float: CorrelationKey = serde_json::from_value(json!(42.0)).unwrap();
        assert_eq!(from_string, from_number);
        assert_eq!(from_number, from_float);
        assert_eq!(CorrelationKey::from_value(&json!(-3)), Some(CorrelationKey::from(-3i64)));
        assert_eq!(CorrelationKey::from_value(&json!(null)), None);
    }

    #[test]
    fn decodes_judge_event_with_numeric_key() {
        let event = DomainEvent::new(
            Channel::Judge,
            json!({"snowflakeId": 1789, "status": "答案正确", "time": 12, "memory": 3}),
        );
        let judge: JudgeEvent = event.decode().unwrap();
        assert_eq!(judge.submission.as_str(), "1789");
        assert_eq!(judge.time, Some(12));
        assert!(judge.is_terminal());
    }

    #[test]
    fn judging_status_is_not_terminal() {
        let judge: JudgeEvent =
            serde_json::from_value(json!({"snowflakeId": "5", "status": "评测中"})).unwrap();
        assert!(!judge.is_terminal());
        assert_eq!(judge.time, None);
    }

    #[test]
    fn message_event_keeps_extra_fields() {
        let msg: MessageEvent =
            serde_json::from_value(json!({"senderId": 3, "content": "hi"})).unwrap();
        assert_eq!(msg.sender, Some(CorrelationKey::from(3u64)));
        assert_eq!(msg.fields.get("content"), Some(&json!("hi")));
    }
}
