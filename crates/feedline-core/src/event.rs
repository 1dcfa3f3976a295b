//! Stream message model: events, repost flattening and control notices

use serde_json::{Map, Value};

/// Object keys under which a repost carries the original event.
const REPOST_KEYS: [&str; 2] = ["retweeted_status", "reposted_status"];

/// A delivered post with a stable identifier and its raw JSON payload.
///
/// A repost keeps a reference to the original; storage and deduplication
/// always go through [`Event::into_canonical`].
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    id: String,
    payload: Value,
    repost_of: Option<Box<Event>>,
}

impl Event {
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
            repost_of: None,
        }
    }

    /// Mark this event as a repost wrapping `original`.
    pub fn with_repost_of(mut self, original: Event) -> Self {
        self.repost_of = Some(Box::new(original));
        self
    }

    /// Build an event from a JSON object.
    ///
    /// The identifier is `id_str`, falling back to `id` (string or integer).
    /// Returns `None` for objects without an identifier.
    pub fn from_json(payload: Value) -> Option<Self> {
        let obj = payload.as_object()?;
        let id = extract_id(obj)?;
        let repost_of = REPOST_KEYS
            .iter()
            .filter_map(|key| obj.get(*key))
            .find(|v| v.is_object())
            .and_then(|v| Event::from_json(v.clone()))
            .map(Box::new);
        Some(Self {
            id,
            payload,
            repost_of,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn is_repost(&self) -> bool {
        self.repost_of.is_some()
    }

    /// Unwrap repost references until the original event; the wrappers are dropped.
    pub fn into_canonical(self) -> Event {
        let mut event = self;
        while let Some(original) = event.repost_of.take() {
            event = *original;
        }
        event
    }

    /// Serialize the payload as a single JSON line (no trailing newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.payload)
    }
}

fn extract_id(obj: &Map<String, Value>) -> Option<String> {
    if let Some(Value::String(s)) = obj.get("id_str") {
        if !s.is_empty() {
            return Some(s.clone());
        }
    }
    match obj.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// One line delivered by a stream source.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Event(Event),
    /// Deletion notice for a previously delivered event
    Delete,
    /// Upstream dropped `undelivered` matching events (filter too broad)
    Limit { undelivered: u64 },
    /// Stall or queue warning from upstream
    Warning(String),
    /// Upstream is closing the connection
    Disconnect { code: u16, reason: String },
    /// Out-of-band error code (`{"error": 420}`), used by recorded streams
    Error(u16),
    /// Blank keep-alive line
    KeepAlive,
    /// Valid JSON that is neither an event nor a known notice
    Unknown,
}

impl StreamMessage {
    /// Parse one line of a stream.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Self::KeepAlive);
        }
        let value: Value = serde_json::from_str(line)?;
        Ok(Self::from_value(value))
    }

    fn from_value(value: Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::Unknown;
        };
        if obj.contains_key("delete") {
            return Self::Delete;
        }
        if let Some(limit) = obj.get("limit") {
            let undelivered = limit.get("track").and_then(Value::as_u64).unwrap_or(0);
            return Self::Limit { undelivered };
        }
        if let Some(warning) = obj.get("warning") {
            let message = warning
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unspecified warning")
                .to_string();
            return Self::Warning(message);
        }
        if let Some(disconnect) = obj.get("disconnect") {
            let code = disconnect
                .get("code")
                .and_then(Value::as_u64)
                .and_then(|c| u16::try_from(c).ok())
                .unwrap_or(0);
            let reason = disconnect
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Self::Disconnect { code, reason };
        }
        if let Some(code) = obj
            .get("error")
            .and_then(Value::as_u64)
            .and_then(|c| u16::try_from(c).ok())
        {
            return Self::Error(code);
        }
        match Event::from_json(value) {
            Some(event) => Self::Event(event),
            None => Self::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_prefers_id_str() {
        let e = Event::from_json(json!({"id": 1, "id_str": "1000000000000000001"})).unwrap();
        assert_eq!(e.id(), "1000000000000000001");
    }

    #[test]
    fn id_falls_back_to_numeric_id() {
        let e = Event::from_json(json!({"id": 42, "text": "hi"})).unwrap();
        assert_eq!(e.id(), "42");
    }

    #[test]
    fn missing_id_is_none() {
        assert!(Event::from_json(json!({"text": "no id"})).is_none());
        assert!(Event::from_json(json!("just a string")).is_none());
    }

    #[test]
    fn repost_flattens_to_original() {
        let wrapper = json!({
            "id_str": "200",
            "text": "RT @a: original",
            "retweeted_status": {"id_str": "100", "text": "original"}
        });
        let e = Event::from_json(wrapper).unwrap();
        assert!(e.is_repost());
        let canonical = e.into_canonical();
        assert_eq!(canonical.id(), "100");
        assert_eq!(canonical.payload()["text"], "original");
        assert!(!canonical.is_repost());
    }

    #[test]
    fn manual_repost_chain_flattens_fully() {
        let original = Event::new("1", json!({"id_str": "1"}));
        let middle = Event::new("2", json!({"id_str": "2"})).with_repost_of(original);
        let outer = Event::new("3", json!({"id_str": "3"})).with_repost_of(middle);
        assert_eq!(outer.into_canonical().id(), "1");
    }

    #[test]
    fn to_line_is_single_line() {
        let e = Event::new("1", json!({"id_str": "1", "text": "a\nb"}));
        let line = e.to_line().unwrap();
        assert!(!line.contains('\n'));
    }

    #[test]
    fn parse_notices() {
        assert_eq!(StreamMessage::parse("   ").unwrap(), StreamMessage::KeepAlive);
        assert_eq!(
            StreamMessage::parse(r#"{"delete":{"status":{"id":1}}}"#).unwrap(),
            StreamMessage::Delete
        );
        assert_eq!(
            StreamMessage::parse(r#"{"limit":{"track":17}}"#).unwrap(),
            StreamMessage::Limit { undelivered: 17 }
        );
        assert_eq!(
            StreamMessage::parse(r#"{"error":420}"#).unwrap(),
            StreamMessage::Error(420)
        );
        assert_eq!(
            StreamMessage::parse(r#"{"disconnect":{"code":7,"reason":"admin logout"}}"#).unwrap(),
            StreamMessage::Disconnect {
                code: 7,
                reason: "admin logout".to_string()
            }
        );
        assert_eq!(
            StreamMessage::parse(r#"{"warning":{"message":"falling behind"}}"#).unwrap(),
            StreamMessage::Warning("falling behind".to_string())
        );
    }

    #[test]
    fn parse_event_and_unknown() {
        match StreamMessage::parse(r#"{"id_str":"9","text":"x"}"#).unwrap() {
            StreamMessage::Event(e) => assert_eq!(e.id(), "9"),
            other => panic!("expected event, got {other:?}"),
        }
        assert_eq!(
            StreamMessage::parse(r#"{"friends":[1,2]}"#).unwrap(),
            StreamMessage::Unknown
        );
        assert!(StreamMessage::parse("{not json").is_err());
    }
}
