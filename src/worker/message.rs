//! Wire messages exchanged with an execution unit.
//!
//! One JSON value per line. Plain text travels as a JSON string, tagged events
//! as `{"event": name, "data": data}`.

use serde_json::{Map, Value};

/// A message crossing the worker boundary, in either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    /// A bare text payload with no event tag.
    Text(String),
    /// A named event with associated data.
    Tagged { event: String, data: Value },
}

impl WorkerMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn tagged(event: impl Into<String>, data: Value) -> Self {
        Self::Tagged {
            event: event.into(),
            data,
        }
    }

    /// Event name if this is a tagged message.
    pub fn event(&self) -> Option<&str> {
        match self {
            Self::Text(_) => None,
            Self::Tagged { event, .. } => Some(event),
        }
    }

    /// The raw payload as handed to `message` subscribers.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Text(text) => Value::String(text.clone()),
            Self::Tagged { event, data } => {
                let mut obj = Map::with_capacity(2);
                obj.insert("event".to_string(), Value::String(event.clone()));
                obj.insert("data".to_string(), data.clone());
                Value::Object(obj)
            }
        }
    }

    /// Encode as a single protocol line (no trailing newline).
    pub fn encode(&self) -> String {
        // Serializing a `Value` cannot fail; string escaping keeps it on one line.
        self.to_value().to_string()
    }

    /// Decode one inbound line.
    ///
    /// An object with a string `event` and a `data` key is tagged, a JSON
    /// string is text, and anything else is text holding the raw line.
    pub fn decode(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        match serde_json::from_str::<Value>(line) {
            Ok(Value::String(text)) => Self::Text(text),
            Ok(Value::Object(mut obj)) => {
                let is_tagged =
                    matches!(obj.get("event"), Some(Value::String(_))) && obj.contains_key("data");
                if !is_tagged {
                    return Self::Text(line.to_string());
                }
                let data = obj.remove("data").unwrap_or(Value::Null);
                match obj.remove("event") {
                    Some(Value::String(event)) => Self::Tagged { event, data },
                    _ => Self::Text(line.to_string()),
                }
            }
            _ => Self::Text(line.to_string()),
        }
    }
}

impl From<&str> for WorkerMessage {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for WorkerMessage {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// One event name or an ordered list of them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventNames(Vec<String>);

impl EventNames {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for EventNames {
    fn from(name: &str) -> Self {
        Self(vec![name.to_string()])
    }
}

impl From<String> for EventNames {
    fn from(name: String) -> Self {
        Self(vec![name])
    }
}

impl From<&String> for EventNames {
    fn from(name: &String) -> Self {
        Self(vec![name.clone()])
    }
}

impl From<Vec<String>> for EventNames {
    fn from(names: Vec<String>) -> Self {
        Self(names)
    }
}

impl From<Vec<&str>> for EventNames {
    fn from(names: Vec<&str>) -> Self {
        Self(names.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for EventNames {
    fn from(names: &[&str]) -> Self {
        Self(names.iter().map(|s| s.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for EventNames {
    fn from(names: [&str; N]) -> Self {
        Self(names.iter().map(|s| s.to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn text_encodes_as_json_string() {
        let msg = WorkerMessage::text("say \"hi\"\nnow");
        let line = msg.encode();
        assert!(!line.contains('\n'));
        assert_eq!(WorkerMessage::decode(&line), msg);
    }

    #[test]
    fn tagged_encodes_as_event_object() {
        let msg = WorkerMessage::tagged("parse", json!({"x": 10}));
        let value: Value = serde_json::from_str(&msg.encode()).unwrap();
        assert_eq!(value, json!({"event": "parse", "data": {"x": 10}}));
        assert_eq!(msg.event(), Some("parse"));
    }

    #[test]
    fn decode_tagged_with_null_data() {
        let msg = WorkerMessage::decode(r#"{"event":"stop","data":null}"#);
        assert_eq!(msg, WorkerMessage::tagged("stop", Value::Null));
    }

    #[test]
    fn decode_object_without_data_is_text() {
        let line = r#"{"event":"stop"}"#;
        assert_eq!(WorkerMessage::decode(line), WorkerMessage::text(line));
    }

    #[test]
    fn decode_non_string_event_is_text() {
        let line = r#"{"event":5,"data":1}"#;
        assert_eq!(WorkerMessage::decode(line), WorkerMessage::text(line));
    }

    #[test]
    fn decode_raw_line_is_text() {
        assert_eq!(
            WorkerMessage::decode("hello world\r\n"),
            WorkerMessage::text("hello world")
        );
        assert_eq!(WorkerMessage::decode("42"), WorkerMessage::text("42"));
    }

    #[test]
    fn event_names_keep_order() {
        let names = EventNames::from(["a", "b", "c"]);
        assert_eq!(names.iter().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(EventNames::from("solo").len(), 1);
    }
}
