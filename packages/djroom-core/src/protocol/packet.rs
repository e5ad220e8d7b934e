//! Socket.IO v2 / Engine.IO v3 packet framing.
//!
//! Every WebSocket text frame carries exactly one Engine.IO packet. Engine.IO
//! `message` packets (type `4`) wrap a Socket.IO packet whose first digit is
//! the Socket.IO packet type:
//!
//! ```text
//! 0{"sid":"abc","pingInterval":25000,"pingTimeout":60000}   open
//! 2 / 3                                                      ping / pong
//! 40                                                         connect
//! 42["room:user:join",{"username":"drew","fullName":"Drew"}] event
//! 421["room:join","lounge"]                                  event with ack id 1
//! 431[{"name":"The Lounge"}]                                 ack for id 1
//! ```
//!
//! Only the default namespace is used; a leading `/nsp,` is stripped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::decoder::DecodeError;

/// Payload of the Engine.IO `open` packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,
    /// Milliseconds between client pings.
    pub ping_interval: u64,
    /// Milliseconds to wait for a pong before declaring the peer dead.
    pub ping_timeout: u64,
    #[serde(default)]
    pub upgrades: Vec<String>,
}

/// One framed packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(OpenInfo),
    Close,
    Ping,
    Pong,
    Noop,
    /// Socket.IO namespace connect.
    Connect,
    /// Socket.IO namespace disconnect.
    Disconnect,
    Event {
        id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    Ack {
        id: u64,
        args: Vec<Value>,
    },
    Error(Value),
    /// Well-formed but not handled here (upgrade, binary events).
    Unsupported {
        kind: &'static str,
        raw: String,
    },
}

impl Packet {
    /// Builds an event packet.
    pub fn event(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Event {
            id: None,
            name: name.into(),
            args,
        }
    }

    /// Parses one frame.
    pub fn parse(frame: &str) -> Result<Self, DecodeError> {
        let mut chars = frame.chars();
        let engine_type = chars
            .next()
            .ok_or_else(|| DecodeError::malformed("empty frame"))?;
        let body = chars.as_str();

        match engine_type {
            '0' => serde_json::from_str(body)
                .map(Packet::Open)
                .map_err(|e| DecodeError::malformed(format!("invalid open payload: {e}"))),
            '1' => Ok(Packet::Close),
            '2' => Ok(Packet::Ping),
            '3' => Ok(Packet::Pong),
            '4' => parse_socket_packet(body),
            '5' => Ok(Packet::Unsupported {
                kind: "upgrade",
                raw: frame.to_string(),
            }),
            '6' => Ok(Packet::Noop),
            other => Err(DecodeError::malformed(format!(
                "unknown engine packet type '{other}'"
            ))),
        }
    }

    /// Encodes the packet into a frame.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Packet::Open(info) => {
                format!("0{}", serde_json::to_string(info).unwrap_or_default())
            }
            Packet::Close => "1".to_string(),
            Packet::Ping => "2".to_string(),
            Packet::Pong => "3".to_string(),
            Packet::Noop => "6".to_string(),
            Packet::Connect => "40".to_string(),
            Packet::Disconnect => "41".to_string(),
            Packet::Event { id, name, args } => {
                let mut array = Vec::with_capacity(args.len() + 1);
                array.push(Value::String(name.clone()));
                array.extend(args.iter().cloned());
                let id = id.map(|id| id.to_string()).unwrap_or_default();
                format!("42{id}{}", Value::Array(array))
            }
            Packet::Ack { id, args } => format!("43{id}{}", Value::Array(args.clone())),
            Packet::Error(payload) => format!("44{payload}"),
            Packet::Unsupported { raw, .. } => raw.clone(),
        }
    }
}

fn parse_socket_packet(body: &str) -> Result<Packet, DecodeError> {
    let mut chars = body.chars();
    let socket_type = chars
        .next()
        .ok_or_else(|| DecodeError::malformed("message packet without socket type"))?;
    let rest = strip_namespace(chars.as_str());

    match socket_type {
        '0' => Ok(Packet::Connect),
        '1' => Ok(Packet::Disconnect),
        '2' => {
            let (id, json) = split_ack_id(rest)?;
            let mut args = parse_array(json)?;
            if args.is_empty() {
                return Err(DecodeError::malformed("event packet without a name"));
            }
            let name = match args.remove(0) {
                Value::String(name) => name,
                other => {
                    return Err(DecodeError::malformed(format!(
                        "event name must be a string, got {other}"
                    )))
                }
            };
            Ok(Packet::Event { id, name, args })
        }
        '3' => {
            let (id, json) = split_ack_id(rest)?;
            let id = id.ok_or_else(|| DecodeError::malformed("ack packet without an id"))?;
            Ok(Packet::Ack {
                id,
                args: parse_array(json)?,
            })
        }
        '4' => {
            let payload = serde_json::from_str(rest).unwrap_or_else(|_| Value::String(rest.to_string()));
            Ok(Packet::Error(payload))
        }
        '5' | '6' => Ok(Packet::Unsupported {
            kind: "binary",
            raw: format!("4{body}"),
        }),
        other => Err(DecodeError::malformed(format!(
            "unknown socket packet type '{other}'"
        ))),
    }
}

/// Drops a leading `/namespace,` prefix.
fn strip_namespace(rest: &str) -> &str {
    if !rest.starts_with('/') {
        return rest;
    }
    match rest.find(',') {
        Some(idx) => &rest[idx + 1..],
        None => "",
    }
}

/// Splits the optional numeric ack id from the JSON payload.
fn split_ack_id(rest: &str) -> Result<(Option<u64>, &str), DecodeError> {
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return Ok((None, rest));
    }
    let id = rest[..digits]
        .parse()
        .map_err(|e| DecodeError::malformed(format!("invalid ack id: {e}")))?;
    Ok((Some(id), &rest[digits..]))
}

fn parse_array(json: &str) -> Result<Vec<Value>, DecodeError> {
    if json.is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_str(json) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(other) => Err(DecodeError::malformed(format!(
            "expected a JSON array, got {other}"
        ))),
        Err(e) => Err(DecodeError::malformed(format!("invalid JSON: {e}"))),
    }
}
