//! Messages and their reserved envelope.
//!
//! A message is a JSON object. Routing metadata lives in a reserved inner
//! object whose key is chosen to be descriptive and exceedingly unlikely to
//! collide with application data. Everything else in the object is the
//! schema-less body; callers read and write it through the dotted-path
//! accessors. A message may be modified freely before it is sent and must
//! be treated as frozen afterwards.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::wire;

/// Key of the reserved envelope object.
pub const ENVELOPE_KEY: &str = "-={([env])}=-";
/// Dotted path of the selective-encryption ciphertext inside the envelope.
pub const SECURE_PATH: &str = "-={([env])}=-.secure";
/// Top-level attribute the broker stamps on `central.po` traffic so its
/// handlers can correlate a message with the connection it arrived on.
pub const CONNECTION_ATTR: &str = "-={([connectionName])}=-";

const FROM_ATTR: &str = "from";
const TO_ATTR: &str = "to";
const TYPE_ATTR: &str = "type";
const ID_ATTR: &str = "id";
const REPLY_ATTR: &str = "reply";
const EXPECT_ATTR: &str = "expect";

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message has no envelope")]
    MissingEnvelope,
    #[error("message missing valid 'from' attribute")]
    MissingFrom,
    #[error("message missing valid 'id' attribute")]
    MissingId,
    #[error("message missing both 'to' and 'type' attributes")]
    MissingToAndType,
    #[error("cannot reply to a publish message")]
    ReplyToPublish,
}

/// One message: a JSON object plus the envelope fields parsed out of it.
///
/// The envelope fields are fixed at construction; only the body mutates.
#[derive(Debug, Clone)]
pub struct Message {
    root: Map<String, Value>,
    pub from: String,
    pub to: Option<String>,
    pub kind: Option<String>,
    pub id: String,
    pub reply: Option<String>,
    pub expect: bool,
}

impl Message {
    /// Build a message from envelope parts, validating them.
    pub fn new(
        from: &str,
        to: Option<&str>,
        kind: Option<&str>,
        id: &str,
        reply: Option<&str>,
        expect: bool,
    ) -> Result<Message, MessageError> {
        validate(from, to, kind, id)?;

        let mut envelope = Map::new();
        envelope.insert(FROM_ATTR.into(), Value::String(from.into()));
        if let Some(to) = to {
            envelope.insert(TO_ATTR.into(), Value::String(to.into()));
        }
        if let Some(kind) = kind {
            envelope.insert(TYPE_ATTR.into(), Value::String(kind.into()));
        }
        envelope.insert(ID_ATTR.into(), Value::String(id.into()));
        if let Some(reply) = reply {
            envelope.insert(REPLY_ATTR.into(), Value::String(reply.into()));
        }
        if expect {
            envelope.insert(EXPECT_ATTR.into(), Value::Bool(true));
        }

        let mut root = Map::new();
        root.insert(ENVELOPE_KEY.into(), Value::Object(envelope));

        Ok(Message {
            root,
            from: from.into(),
            to: to.map(Into::into),
            kind: kind.map(Into::into),
            id: id.into(),
            reply: reply.map(Into::into),
            expect,
        })
    }

    /// Parse a message received off the wire.
    pub fn from_json(json: &str) -> Result<Message, MessageError> {
        let value: Value = serde_json::from_str(json)?;
        let Value::Object(root) = value else {
            return Err(MessageError::NotAnObject);
        };
        let envelope = match root.get(ENVELOPE_KEY) {
            Some(Value::Object(envelope)) => envelope,
            _ => return Err(MessageError::MissingEnvelope),
        };

        let from = env_string(envelope, FROM_ATTR);
        let to = env_string(envelope, TO_ATTR);
        let kind = env_string(envelope, TYPE_ATTR);
        let id = env_string(envelope, ID_ATTR);
        let reply = env_string(envelope, REPLY_ATTR);
        let expect = matches!(envelope.get(EXPECT_ATTR), Some(Value::Bool(true)));

        let from = from.ok_or(MessageError::MissingFrom)?;
        let id = id.ok_or(MessageError::MissingId)?;
        if to.is_none() && kind.is_none() {
            return Err(MessageError::MissingToAndType);
        }

        Ok(Message {
            root,
            from,
            to,
            kind,
            id,
            reply,
            expect,
        })
    }

    /// The major component of the message type: everything before the last
    /// `.`, or the whole type when it has no minor component.
    pub fn major_kind(&self) -> Option<&str> {
        self.kind.as_deref().map(major_of)
    }

    /// The post office part of the `from` address.
    pub fn from_po(&self) -> &str {
        match self.from.find('.') {
            Some(dot) => &self.from[..dot],
            None => &self.from,
        }
    }

    pub fn is_direct(&self) -> bool {
        self.to.as_deref().is_some_and(|to| !to.is_empty())
    }

    pub fn is_publish(&self) -> bool {
        !self.is_direct()
    }

    pub fn is_reply(&self) -> bool {
        self.is_direct() && self.reply.as_deref().is_some_and(|r| !r.is_empty())
    }

    pub fn expects_reply(&self) -> bool {
        self.expect
    }

    pub fn is_encrypted(&self) -> bool {
        self.has_dotted(SECURE_PATH)
    }

    /// Insert a top-level body field.
    pub fn put(&mut self, key: &str, value: impl Into<Value>) {
        self.root.insert(key.into(), value.into());
    }

    /// Fetch a top-level body field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }

    /// Fetch a top-level string field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.root.get(key).and_then(Value::as_str)
    }

    /// Insert a field at a dotted hierarchical path, creating intermediate
    /// objects as needed. A non-object intermediate is replaced.
    pub fn put_dotted(&mut self, path: &str, value: impl Into<Value>) {
        put_dotted(&mut self.root, path, value.into());
    }

    /// Fetch the value at a dotted path.
    pub fn get_dotted(&self, path: &str) -> Option<&Value> {
        get_dotted(&self.root, path)
    }

    /// Fetch the string at a dotted path.
    pub fn get_dotted_str(&self, path: &str) -> Option<&str> {
        self.get_dotted(path).and_then(Value::as_str)
    }

    pub fn has_dotted(&self, path: &str) -> bool {
        self.get_dotted(path).is_some()
    }

    /// Remove and return the value at a dotted path. Empty intermediate
    /// objects left behind are not pruned.
    pub fn remove_dotted(&mut self, path: &str) -> Option<Value> {
        remove_dotted(&mut self.root, path)
    }

    /// The full JSON text of this message, envelope included.
    pub fn to_json(&self) -> String {
        Value::Object(self.root.clone()).to_string()
    }

    /// The wire form of this message: the framed UTF-8 JSON bytes.
    pub fn serialize(&self) -> Vec<u8> {
        wire::frame(self.to_json().as_bytes())
    }

    pub(crate) fn root(&self) -> &Map<String, Value> {
        &self.root
    }

    pub(crate) fn root_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.root
    }

    /// Create a direct message. Called by the owning mailbox, which supplies
    /// the stamped `from` address and fresh id.
    pub(crate) fn direct(
        to: &str,
        kind: Option<&str>,
        expect: bool,
        from: &str,
        id: &str,
    ) -> Result<Message, MessageError> {
        Message::new(from, Some(to), kind, id, None, expect)
    }

    /// Create a reply to `original`, with `from` and `to` swapped and the
    /// `reply` attribute set to the original id.
    pub(crate) fn reply_to(
        original: &Message,
        kind: Option<&str>,
        id: &str,
    ) -> Result<Message, MessageError> {
        let to = original.to.as_deref().ok_or(MessageError::ReplyToPublish)?;
        Message::new(to, Some(&original.from), kind, id, Some(&original.id), false)
    }

    /// Create a publish message of the given type.
    pub(crate) fn publish(kind: &str, from: &str, id: &str) -> Result<Message, MessageError> {
        Message::new(from, None, Some(kind), id, None, false)
    }
}

/// Everything before the last `.`, or the whole string when it has none.
pub fn major_of(dotted: &str) -> &str {
    match dotted.rfind('.') {
        Some(dot) => &dotted[..dot],
        None => dotted,
    }
}

fn env_string(envelope: &Map<String, Value>, key: &str) -> Option<String> {
    envelope
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(Into::into)
}

fn validate(
    from: &str,
    to: Option<&str>,
    kind: Option<&str>,
    id: &str,
) -> Result<(), MessageError> {
    if from.is_empty() {
        return Err(MessageError::MissingFrom);
    }
    if id.is_empty() {
        return Err(MessageError::MissingId);
    }
    let to_empty = to.map_or(true, str::is_empty);
    let kind_empty = kind.map_or(true, str::is_empty);
    if to_empty && kind_empty {
        return Err(MessageError::MissingToAndType);
    }
    Ok(())
}

pub(crate) fn put_dotted(root: &mut Map<String, Value>, path: &str, value: Value) {
    let mut current = root;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part.into(), value);
            return;
        }
        let slot = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = slot.as_object_mut().expect("just ensured object");
    }
}

pub(crate) fn get_dotted<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut current = root;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        let value = current.get(part)?;
        if parts.peek().is_none() {
            return Some(value);
        }
        current = value.as_object()?;
    }
    None
}

pub(crate) fn remove_dotted(root: &mut Map<String, Value>, path: &str) -> Option<Value> {
    let mut current = root;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            return current.remove(part);
        }
        current = current.get_mut(part)?.as_object_mut()?;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let mut msg =
            Message::new("alpha.io", Some("beta.io"), Some("ping"), "1.alpha", None, true)
                .unwrap();
        msg.put("payload", 42);

        let parsed = Message::from_json(&msg.to_json()).unwrap();
        assert_eq!(parsed.from, "alpha.io");
        assert_eq!(parsed.to.as_deref(), Some("beta.io"));
        assert_eq!(parsed.kind.as_deref(), Some("ping"));
        assert_eq!(parsed.id, "1.alpha");
        assert!(parsed.expect);
        assert!(parsed.is_direct());
        assert!(!parsed.is_reply());
        assert_eq!(parsed.get("payload"), Some(&Value::from(42)));
    }

    #[test]
    fn publish_messages_omit_to() {
        let msg = Message::publish("sensor.temperature", "alpha.io", "2.alpha").unwrap();
        assert!(msg.is_publish());
        assert_eq!(msg.major_kind(), Some("sensor"));
        assert_eq!(msg.from_po(), "alpha");
        let parsed = Message::from_json(&msg.to_json()).unwrap();
        assert!(parsed.to.is_none());
    }

    #[test]
    fn reply_swaps_addresses_and_links_id() {
        let original =
            Message::new("alpha.io", Some("beta.io"), Some("ping"), "3.alpha", None, true)
                .unwrap();
        let reply = Message::reply_to(&original, Some("ping"), "1.beta").unwrap();
        assert_eq!(reply.from, "beta.io");
        assert_eq!(reply.to.as_deref(), Some("alpha.io"));
        assert_eq!(reply.reply.as_deref(), Some("3.alpha"));
        assert!(reply.is_reply());

        let publish = Message::publish("tick", "alpha.io", "4.alpha").unwrap();
        assert!(Message::reply_to(&publish, None, "2.beta").is_err());
    }

    #[test]
    fn validation_rejects_incomplete_envelopes() {
        assert!(Message::new("", Some("beta.io"), None, "1.a", None, false).is_err());
        assert!(Message::new("alpha.io", Some("beta.io"), None, "", None, false).is_err());
        assert!(Message::new("alpha.io", None, None, "1.a", None, false).is_err());
        assert!(Message::from_json("{\"no\":\"envelope\"}").is_err());
        assert!(Message::from_json("not json").is_err());
    }

    #[test]
    fn dotted_paths_round_trip_nested_objects() {
        let mut msg = Message::publish("t", "a.b", "1.a").unwrap();
        msg.put_dotted("monitor.os.hostName", "zeus");
        msg.put_dotted("monitor.os.totalMemory", 1024);
        msg.put_dotted("monitor.process.threads", 7);

        assert_eq!(msg.get_dotted_str("monitor.os.hostName"), Some("zeus"));
        assert!(msg.has_dotted("monitor.os"));
        assert!(!msg.has_dotted("monitor.net"));

        let removed = msg.remove_dotted("monitor.os.totalMemory").unwrap();
        assert_eq!(removed, Value::from(1024));
        assert!(!msg.has_dotted("monitor.os.totalMemory"));
        assert_eq!(
            msg.get_dotted("monitor.process.threads"),
            Some(&Value::from(7))
        );
    }

    #[test]
    fn put_dotted_replaces_scalar_intermediates() {
        let mut msg = Message::publish("t", "a.b", "1.a").unwrap();
        msg.put("leaf", 1);
        msg.put_dotted("leaf.inner", 2);
        assert_eq!(msg.get_dotted("leaf.inner"), Some(&Value::from(2)));
    }

    #[test]
    fn major_of_strips_the_last_component() {
        assert_eq!(major_of("sensor.temperature"), "sensor");
        assert_eq!(major_of("sensor"), "sensor");
        assert_eq!(major_of("a.b.c"), "a.b");
    }
}
