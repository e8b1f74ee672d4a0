//! Wire protocol messages
//!
//! Four logical exchanges connect a client to the server:
//!
//! | Message | Direction | Purpose |
//! |---------|-----------|---------|
//! | [`Handshake`] / [`ServerMessage::HandshakeInform`] | client → server → client | bind to a scope |
//! | [`Query`] / [`ServerMessage::QueryInform`] | client → server → client | invoke a method |
//! | [`Notify`] | client → server | apply a property edit |
//! | [`EventInform`] | server → client | push a change, custom event or console line |
//!
//! Messages encode as JSON objects tagged by a `"type"` field; values inside
//! messages are themselves JSON text, serialized once per broadcast.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ProtocolViolation, Result};
use crate::identity::ObjectId;

/// Event type codes carried by [`EventInform`] and [`Notify`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum EventType {
    Custom = 0,
    Console = 1,
    PropertyChange = 2,
    PropertyPut = 3,
    PropertySet = 4,
    PropertyDelete = 5,
}

impl EventType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_property_change(self) -> bool {
        matches!(
            self,
            EventType::PropertyChange
                | EventType::PropertyPut
                | EventType::PropertySet
                | EventType::PropertyDelete
        )
    }
}

impl TryFrom<u8> for EventType {
    type Error = String;

    fn try_from(code: u8) -> std::result::Result<Self, Self::Error> {
        match code {
            0 => Ok(EventType::Custom),
            1 => Ok(EventType::Console),
            2 => Ok(EventType::PropertyChange),
            3 => Ok(EventType::PropertyPut),
            4 => Ok(EventType::PropertySet),
            5 => Ok(EventType::PropertyDelete),
            other => Err(format!("unknown event type code {}", other)),
        }
    }
}

impl From<EventType> for u8 {
    fn from(event: EventType) -> u8 {
        event.code()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::Custom => "custom",
            EventType::Console => "console",
            EventType::PropertyChange => "change",
            EventType::PropertyPut => "put",
            EventType::PropertySet => "set",
            EventType::PropertyDelete => "delete",
        };
        write!(f, "{}", name)
    }
}

/// Bind a client to a scope chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub app: u32,
    pub session: String,
    pub view: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<String>,
    /// Per-element instance number; present iff `element` is
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<i64>,
    pub callback: u64,
}

impl Handshake {
    pub fn view(app: u32, session: &str, view: &str, callback: u64) -> Self {
        Self {
            app,
            session: session.to_string(),
            view: view.to_string(),
            element: None,
            instance: None,
            callback,
        }
    }

    pub fn element(mut self, element: &str, instance: i64) -> Self {
        self.element = Some(element.to_string());
        self.instance = Some(instance);
        self
    }

    /// Name of the element scope this handshake targets, if any
    pub fn element_scope_name(&self) -> Result<Option<String>> {
        match (&self.element, self.instance) {
            (None, None) => Ok(None),
            (Some(element), Some(instance)) => Ok(Some(format!("{}#{}", element, instance))),
            _ => Err(Error::protocol(ProtocolViolation::MalformedArguments(
                "element and instance must be given together".into(),
            ))),
        }
    }
}

/// Invoke a method on a scoped object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub session: String,
    pub callback: u64,
    pub target: ObjectId,
    pub method: String,
    /// JSON-serialized argument array
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
}

impl Query {
    pub fn new(session: &str, callback: u64, target: ObjectId, method: &str) -> Self {
        Self {
            session: session.to_string(),
            callback,
            target,
            method: method.to_string(),
            args: None,
        }
    }

    pub fn with_args(mut self, args: &serde_json::Value) -> Self {
        self.args = Some(args.to_string());
        self
    }

    pub fn is_private(&self) -> bool {
        self.method.starts_with('_')
    }
}

/// Client-originated property edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notify {
    pub target: ObjectId,
    pub change: EventType,
    pub name: String,
    /// JSON-serialized new value; absent for deletes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Notify {
    pub fn new(target: ObjectId, change: EventType, name: &str, value: Option<&serde_json::Value>) -> Self {
        Self {
            target,
            change,
            name: name.to_string(),
            value: value.map(|v| v.to_string()),
        }
    }
}

/// Server-initiated push
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventInform {
    pub event: EventType,
    pub target: ObjectId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl EventInform {
    /// Decode the carried value, if any
    pub fn decode_value(&self) -> Result<Option<serde_json::Value>> {
        self.value
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(Error::from)
    }
}

/// Messages sent by clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Handshake(Handshake),
    Query(Query),
    Notify(Notify),
}

/// Messages sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    HandshakeInform {
        callback: u64,
        target: ObjectId,
        /// JSON-serialized state of the bound scope
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    QueryInform { callback: u64, result: String },
    EventInform(EventInform),
}

impl ServerMessage {
    pub fn as_event(&self) -> Option<&EventInform> {
        match self {
            ServerMessage::EventInform(event) => Some(event),
            _ => None,
        }
    }
}

/// Encode any message as JSON text
pub fn encode<T: Serialize>(message: &T) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a client message from JSON text
pub fn decode_client(text: &str) -> Result<ClientMessage> {
    Ok(serde_json::from_str(text)?)
}

/// Decode a server message from JSON text
pub fn decode_server(text: &str) -> Result<ServerMessage> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_event_type_codes() {
        assert_eq!(EventType::Custom.code(), 0);
        assert_eq!(EventType::PropertyDelete.code(), 5);
        assert_eq!(EventType::try_from(4), Ok(EventType::PropertySet));
        assert!(EventType::try_from(6).is_err());
        assert!(EventType::PropertyPut.is_property_change());
        assert!(!EventType::Console.is_property_change());
    }

    #[test]
    fn test_handshake_wire_shape() {
        let hs = Handshake::view(1, "s1", "home", 7).element("counter", 2);
        let text = encode(&ClientMessage::Handshake(hs.clone())).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            json,
            json!({
                "type": "handshake",
                "app": 1,
                "session": "s1",
                "view": "home",
                "element": "counter",
                "instance": 2,
                "callback": 7
            })
        );
        assert_eq!(decode_client(&text).unwrap(), ClientMessage::Handshake(hs));
    }

    #[test]
    fn test_element_scope_name_requires_pairing() {
        let hs = Handshake::view(1, "s", "v", 0);
        assert_eq!(hs.element_scope_name().unwrap(), None);
        let with = hs.clone().element("row", 3);
        assert_eq!(with.element_scope_name().unwrap(), Some("row#3".to_string()));

        let mut broken = hs;
        broken.element = Some("row".into());
        assert!(broken.element_scope_name().is_err());
    }

    #[test]
    fn test_event_inform_numeric_type() {
        let msg = ServerMessage::EventInform(EventInform {
            event: EventType::PropertyDelete,
            target: ObjectId(42),
            name: "count".into(),
            value: None,
        });
        let json: serde_json::Value = serde_json::from_str(&encode(&msg).unwrap()).unwrap();
        assert_eq!(json, json!({"type": "eventInform", "event": 5, "target": 42, "name": "count"}));
    }

    #[test]
    fn test_query_private_and_args() {
        let q = Query::new("s1", 3, ObjectId(9), "_reset").with_args(&json!([1, "a"]));
        assert!(q.is_private());
        assert_eq!(q.args.as_deref(), Some("[1,\"a\"]"));
    }

    #[test]
    fn test_decode_rejects_unknown_event_code() {
        let text = r#"{"type":"notify","target":1,"change":9,"name":"x"}"#;
        assert!(decode_client(text).is_err());
    }

    #[test]
    fn test_query_inform_round_trip() {
        let msg = ServerMessage::QueryInform { callback: 1, result: "2".into() };
        assert_eq!(decode_server(&encode(&msg).unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_event_value_decoding() {
        let ev = EventInform {
            event: EventType::PropertySet,
            target: ObjectId(1),
            name: "n".into(),
            value: Some("[1,2]".into()),
        };
        assert_eq!(ev.decode_value().unwrap(), Some(json!([1, 2])));
    }
}
