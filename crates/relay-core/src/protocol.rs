// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

use crate::{Error, Result, SocketSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

pub const AUTH_PROXY: &str = "AUTH_PROXY";
pub const PROXY_EMIT: &str = "PROXY_EMIT";
pub const PROXY_USER_BROADCAST_OPERATOR: &str = "PROXY_USER_BROADCAST_OPERATOR";
pub const PROXY_BROADCAST_OPERATOR: &str = "PROXY_BROADCAST_OPERATOR";
pub const PROXY_USER_JOIN: &str = "PROXY_USER_JOIN";
pub const PROXY_USER_LEAVE: &str = "PROXY_USER_LEAVE";
pub const DISCONNECT_PROXY_USER: &str = "DISCONNECT_PROXY_USER";
pub const PROXY_CONNECTION: &str = "PROXY_CONNECTION";
pub const PROXY_USER_UPDATE: &str = "PROXY_USER_UPDATE";
pub const PROXY_USER_DISCONNECT: &str = "PROXY_USER_DISCONNECT";
pub const PROXY_USER_EVENT: &str = "PROXY_USER_EVENT";

/// One WebSocket text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Packet {
    Open(OpenPacket),
    Event(EventPacket),
    Ack(AckPacket),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPacket {
    pub sid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPacket {
    pub event: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPacket {
    pub ack: u64,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl Packet {
    pub fn open(sid: impl Into<String>) -> Self {
        Packet::Open(OpenPacket { sid: sid.into() })
    }

    pub fn event(event: impl Into<String>, args: Vec<Value>) -> Self {
        Packet::Event(EventPacket {
            event: event.into(),
            args,
            ack: None,
        })
    }

    pub fn ack(ack: u64, args: Vec<Value>) -> Self {
        Packet::Ack(AckPacket { ack, args })
    }

    pub fn packet_type(&self) -> &'static str {
        match self {
            Packet::Open(_) => "open",
            Packet::Event(_) => "event",
            Packet::Ack(_) => "ack",
        }
    }
}

/// Credential carried by `AUTH_PROXY`. Only strings and numbers are valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AuthToken {
    Text(String),
    Number(serde_json::Number),
}

impl AuthToken {
    /// Parses a dynamic value; `null` means "no credential".
    pub fn from_value(value: &Value) -> Result<Option<Self>> {
        match value {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(AuthToken::Text(s.clone()))),
            Value::Number(n) => Ok(Some(AuthToken::Number(n.clone()))),
            other => Err(Error::InvalidArgument(format!(
                "auth must be a string, number or null, got {}",
                value_kind(other)
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            AuthToken::Text(s) => Value::String(s.clone()),
            AuthToken::Number(n) => Value::Number(n.clone()),
        }
    }

    pub fn matches(&self, expected: &str) -> bool {
        match self {
            AuthToken::Text(s) => s == expected,
            AuthToken::Number(n) => n.to_string() == expected,
        }
    }
}

impl From<&str> for AuthToken {
    fn from(value: &str) -> Self {
        AuthToken::Text(value.to_string())
    }
}

impl From<String> for AuthToken {
    fn from(value: String) -> Self {
        AuthToken::Text(value)
    }
}

impl From<i64> for AuthToken {
    fn from(value: i64) -> Self {
        AuthToken::Number(value.into())
    }
}

pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomRequest {
    pub id: String,
    pub room: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisconnectRequest {
    pub id: String,
    #[serde(default)]
    pub close: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserUpdate {
    pub id: String,
    pub snapshot: Value,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDisconnect {
    pub id: String,
    #[serde(default)]
    pub reason: String,
}

/// Application-level events exchanged between a proxy link and the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    AuthProxy {
        auth: Option<AuthToken>,
    },
    ProxyEmit {
        id: String,
        event: String,
        args: Vec<Value>,
    },
    UserBroadcast {
        id: String,
        room: String,
        event: String,
        args: Vec<Value>,
    },
    Broadcast {
        room: String,
        event: String,
        args: Vec<Value>,
    },
    UserJoin(RoomRequest),
    UserLeave(RoomRequest),
    DisconnectUser(DisconnectRequest),
    Connection(Value),
    UserUpdate(UserUpdate),
    UserDisconnect(UserDisconnect),
    UserEvent {
        id: String,
        event: String,
        args: Vec<Value>,
    },
}

impl RelayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RelayEvent::AuthProxy { .. } => AUTH_PROXY,
            RelayEvent::ProxyEmit { .. } => PROXY_EMIT,
            RelayEvent::UserBroadcast { .. } => PROXY_USER_BROADCAST_OPERATOR,
            RelayEvent::Broadcast { .. } => PROXY_BROADCAST_OPERATOR,
            RelayEvent::UserJoin(_) => PROXY_USER_JOIN,
            RelayEvent::UserLeave(_) => PROXY_USER_LEAVE,
            RelayEvent::DisconnectUser(_) => DISCONNECT_PROXY_USER,
            RelayEvent::Connection(_) => PROXY_CONNECTION,
            RelayEvent::UserUpdate(_) => PROXY_USER_UPDATE,
            RelayEvent::UserDisconnect(_) => PROXY_USER_DISCONNECT,
            RelayEvent::UserEvent { .. } => PROXY_USER_EVENT,
        }
    }

    pub fn connection(snapshot: &SocketSnapshot) -> Result<Self> {
        Ok(RelayEvent::Connection(serde_json::to_value(snapshot)?))
    }

    pub fn into_args(self) -> Result<Vec<Value>> {
        let args = match self {
            RelayEvent::AuthProxy { auth } => {
                vec![auth.map(|a| a.to_value()).unwrap_or(Value::Null)]
            }
            RelayEvent::ProxyEmit { id, event, args }
            | RelayEvent::UserEvent { id, event, args } => {
                let mut out = vec![Value::String(id), Value::String(event)];
                out.extend(args);
                out
            }
            RelayEvent::UserBroadcast {
                id,
                room,
                event,
                args,
            } => {
                let mut out = vec![Value::String(id), Value::String(room), Value::String(event)];
                out.extend(args);
                out
            }
            RelayEvent::Broadcast { room, event, args } => {
                let mut out = vec![Value::String(room), Value::String(event)];
                out.extend(args);
                out
            }
            RelayEvent::UserJoin(req) | RelayEvent::UserLeave(req) => {
                vec![serde_json::to_value(req)?]
            }
            RelayEvent::DisconnectUser(req) => vec![serde_json::to_value(req)?],
            RelayEvent::Connection(snapshot) => vec![snapshot],
            RelayEvent::UserUpdate(update) => vec![serde_json::to_value(update)?],
            RelayEvent::UserDisconnect(update) => vec![serde_json::to_value(update)?],
        };
        Ok(args)
    }

    pub fn into_packet(self, ack: Option<u64>) -> Result<Packet> {
        let event = self.name().to_string();
        let args = self.into_args()?;
        Ok(Packet::Event(EventPacket { event, args, ack }))
    }

    pub fn from_event(packet: &EventPacket) -> Result<Self> {
        let mut args: VecDeque<Value> = packet.args.iter().cloned().collect();

        let event = match packet.event.as_str() {
            AUTH_PROXY => RelayEvent::AuthProxy {
                auth: AuthToken::from_value(&args.pop_front().unwrap_or(Value::Null))?,
            },
            PROXY_EMIT => RelayEvent::ProxyEmit {
                id: take_string(&mut args, "id")?,
                event: take_string(&mut args, "event")?,
                args: args.into(),
            },
            PROXY_USER_EVENT => RelayEvent::UserEvent {
                id: take_string(&mut args, "id")?,
                event: take_string(&mut args, "event")?,
                args: args.into(),
            },
            PROXY_USER_BROADCAST_OPERATOR => RelayEvent::UserBroadcast {
                id: take_string(&mut args, "id")?,
                room: take_string(&mut args, "room")?,
                event: take_string(&mut args, "event")?,
                args: args.into(),
            },
            PROXY_BROADCAST_OPERATOR => RelayEvent::Broadcast {
                room: take_string(&mut args, "room")?,
                event: take_string(&mut args, "event")?,
                args: args.into(),
            },
            PROXY_USER_JOIN => RelayEvent::UserJoin(take_object(&mut args, "room request")?),
            PROXY_USER_LEAVE => RelayEvent::UserLeave(take_object(&mut args, "room request")?),
            DISCONNECT_PROXY_USER => {
                RelayEvent::DisconnectUser(take_object(&mut args, "disconnect request")?)
            }
            PROXY_CONNECTION => RelayEvent::Connection(
                args.pop_front()
                    .ok_or_else(|| Error::MissingField("snapshot".to_string()))?,
            ),
            PROXY_USER_UPDATE => RelayEvent::UserUpdate(take_object(&mut args, "user update")?),
            PROXY_USER_DISCONNECT => {
                RelayEvent::UserDisconnect(take_object(&mut args, "user disconnect")?)
            }
            other => {
                return Err(Error::InvalidPacket(format!("unknown relay event: {}", other)));
            }
        };

        Ok(event)
    }
}

fn take_string(args: &mut VecDeque<Value>, field: &str) -> Result<String> {
    match args.pop_front() {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(Error::InvalidPacket(format!(
            "{} must be a string, got {}",
            field,
            value_kind(&other)
        ))),
        None => Err(Error::MissingField(field.to_string())),
    }
}

fn take_object<T: serde::de::DeserializeOwned>(
    args: &mut VecDeque<Value>,
    field: &str,
) -> Result<T> {
    let value = args
        .pop_front()
        .ok_or_else(|| Error::MissingField(field.to_string()))?;
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_auth_token_accepts_string_number_null() {
        assert_eq!(
            AuthToken::from_value(&json!("tok1")).unwrap(),
            Some(AuthToken::Text("tok1".to_string()))
        );
        assert_eq!(
            AuthToken::from_value(&json!(42)).unwrap(),
            Some(AuthToken::from(42i64))
        );
        assert_eq!(AuthToken::from_value(&Value::Null).unwrap(), None);
    }

    #[test]
    fn test_auth_token_rejects_other_types() {
        for value in [json!(true), json!([1]), json!({"a": 1})] {
            let result = AuthToken::from_value(&value);
            assert!(matches!(result, Err(Error::InvalidArgument(_))));
        }
    }

    #[test]
    fn test_numeric_token_matches_text() {
        assert!(AuthToken::from(1234i64).matches("1234"));
        assert!(!AuthToken::from("abc").matches("abcd"));
    }

    #[test]
    fn test_proxy_emit_positional_args() {
        let packet = RelayEvent::ProxyEmit {
            id: "u1".to_string(),
            event: "chat".to_string(),
            args: vec![json!("hi"), json!(2)],
        }
        .into_packet(None)
        .unwrap();

        match &packet {
            Packet::Event(ev) => {
                assert_eq!(ev.event, PROXY_EMIT);
                assert_eq!(ev.args, vec![json!("u1"), json!("chat"), json!("hi"), json!(2)]);
                assert_eq!(ev.ack, None);
            }
            _ => panic!("wrong packet type"),
        }
    }

    #[test]
    fn test_user_broadcast_parses() {
        let packet = EventPacket {
            event: PROXY_USER_BROADCAST_OPERATOR.to_string(),
            args: vec![json!("u1"), json!("lobby"), json!("msg"), json!({"text": "x"})],
            ack: None,
        };

        match RelayEvent::from_event(&packet).unwrap() {
            RelayEvent::UserBroadcast {
                id,
                room,
                event,
                args,
            } => {
                assert_eq!(id, "u1");
                assert_eq!(room, "lobby");
                assert_eq!(event, "msg");
                assert_eq!(args, vec![json!({"text": "x"})]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_join_request_is_object_payload() {
        let packet = RelayEvent::UserJoin(RoomRequest {
            id: "u1".to_string(),
            room: "a".to_string(),
        })
        .into_packet(Some(3))
        .unwrap();

        match packet {
            Packet::Event(ev) => {
                assert_eq!(ev.args, vec![json!({"id": "u1", "room": "a"})]);
                assert_eq!(ev.ack, Some(3));
            }
            _ => panic!("wrong packet type"),
        }
    }

    #[test]
    fn test_user_update_type_field() {
        let update = UserUpdate {
            id: "u1".to_string(),
            snapshot: json!({"id": "u1"}),
            kind: Some("join".to_string()),
            room: Some("a".to_string()),
        };
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["type"], "join");
        assert_eq!(value["room"], "a");
    }

    #[test]
    fn test_missing_field_rejected() {
        let packet = EventPacket {
            event: PROXY_EMIT.to_string(),
            args: vec![json!("u1")],
            ack: None,
        };
        assert!(matches!(
            RelayEvent::from_event(&packet),
            Err(Error::MissingField(_))
        ));
    }

    #[test]
    fn test_unknown_event_rejected() {
        let packet = EventPacket {
            event: "SOMETHING_ELSE".to_string(),
            args: vec![],
            ack: None,
        };
        assert!(matches!(
            RelayEvent::from_event(&packet),
            Err(Error::InvalidPacket(_))
        ));
    }
}
