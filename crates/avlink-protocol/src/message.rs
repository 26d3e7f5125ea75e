//! Control-channel message types and their JSON bodies.
//!
//! A request body looks like
//! `{"type":"command","content":"end","params":{},"timestamp":"..."}` and a
//! response body like `{"status":"ok","detail":"received","timestamp":"..."}`.
//! The two are told apart structurally: a body with `type` is a request, a
//! body with `status` (and no `type`) is a response.

use std::collections::BTreeMap;
use std::fmt;

use avlink_core::JoinTarget;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Number, Value};

use crate::error::DecodeError;

/// Command name that ends the session on the receiving side.
pub const END_COMMAND: &str = "end";

/// Command name that makes the reception node clean up without relaying `end`.
pub const FORCE_CLEANUP_COMMAND: &str = "force_cleanup";

/// Command name that re-joins the video session, optionally at the
/// target given in the `meet_url` param.
pub const JOIN_MEETING_COMMAND: &str = "join_meeting";

/// Param of `join_meeting` naming the target to join.
pub const MEET_URL_PARAM: &str = "meet_url";

/// Command name that leaves the video session but keeps the control session.
pub const LEAVE_MEETING_COMMAND: &str = "leave_meeting";

/// Notice content used as a liveness probe.
pub const HEARTBEAT: &str = "heartbeat";

/// Discriminant of a `ControlMessage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    JoinTarget,
    Command,
    Notice,
}

impl MessageKind {
    /// Wire name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JoinTarget => "join-target",
            Self::Command => "command",
            Self::Notice => "notice",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "join-target" => Some(Self::JoinTarget),
            "command" => Some(Self::Command),
            "notice" => Some(Self::Notice),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scalar command parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    String(String),
    Number(Number),
    Bool(bool),
}

impl Scalar {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::String(s)),
            Value::Number(n) => Some(Self::Number(n)),
            Value::Bool(b) => Some(Self::Bool(b)),
            _ => None,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Self::String(s) => Value::String(s.clone()),
            Self::Number(n) => Value::Number(n.clone()),
            Self::Bool(b) => Value::Bool(*b),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Scalar {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<u64> for Scalar {
    fn from(n: u64) -> Self {
        Self::Number(n.into())
    }
}

/// Command parameters. Ordered so that encoding is deterministic.
pub type Params = BTreeMap<String, Scalar>;

/// Kind-specific message content.
///
/// The variant is the kind, so a payload can never disagree with it.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    JoinTarget(JoinTarget),
    Command { name: String, params: Params },
    Notice(String),
}

/// The unit exchanged on the control channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub payload: Payload,

    /// Advisory only; used for logging, never for ordering.
    pub issued_at: DateTime<Utc>,
}

impl ControlMessage {
    /// Builds a message stamped with the current time.
    ///
    /// Applies the same content checks as decoding, so every message built
    /// here survives an encode/decode cycle.
    pub fn new(payload: Payload) -> Result<Self, DecodeError> {
        match &payload {
            Payload::JoinTarget(target) if target.as_str().trim().is_empty() => {
                return Err(mismatch(MessageKind::JoinTarget, "content is empty"));
            }
            Payload::Command { name, .. } if name.trim().is_empty() => {
                return Err(mismatch(MessageKind::Command, "content is empty"));
            }
            _ => {}
        }
        Ok(Self::stamped(payload))
    }

    pub fn join_target(target: JoinTarget) -> Result<Self, DecodeError> {
        Self::new(Payload::JoinTarget(target))
    }

    pub fn command(name: impl Into<String>, params: Params) -> Result<Self, DecodeError> {
        Self::new(Payload::Command {
            name: name.into(),
            params,
        })
    }

    /// `command("end")`.
    pub fn end() -> Self {
        Self::stamped(Payload::Command {
            name: END_COMMAND.to_string(),
            params: Params::new(),
        })
    }

    pub fn notice(text: impl Into<String>) -> Self {
        Self::stamped(Payload::Notice(text.into()))
    }

    /// The liveness probe notice.
    pub fn heartbeat() -> Self {
        Self::notice(HEARTBEAT)
    }

    pub fn kind(&self) -> MessageKind {
        match self.payload {
            Payload::JoinTarget(_) => MessageKind::JoinTarget,
            Payload::Command { .. } => MessageKind::Command,
            Payload::Notice(_) => MessageKind::Notice,
        }
    }

    /// Returns the command name if this is a command.
    pub fn command_name(&self) -> Option<&str> {
        match &self.payload {
            Payload::Command { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn is_end(&self) -> bool {
        self.command_name() == Some(END_COMMAND)
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(&self.payload, Payload::Notice(text) if text == HEARTBEAT)
    }

    fn stamped(payload: Payload) -> Self {
        Self {
            payload,
            issued_at: Utc::now(),
        }
    }

    fn to_value(&self) -> Value {
        let mut body = Map::new();
        body.insert("type".into(), Value::String(self.kind().as_str().into()));
        match &self.payload {
            Payload::JoinTarget(target) => {
                body.insert("content".into(), Value::String(target.as_str().into()));
            }
            Payload::Command { name, params } => {
                body.insert("content".into(), Value::String(name.clone()));
                let params = params
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_value()))
                    .collect::<Map<_, _>>();
                body.insert("params".into(), Value::Object(params));
            }
            Payload::Notice(text) => {
                body.insert("content".into(), Value::String(text.clone()));
            }
        }
        body.insert("timestamp".into(), Value::String(format_timestamp(&self.issued_at)));
        Value::Object(body)
    }

    fn from_object(mut body: Map<String, Value>) -> Result<Self, DecodeError> {
        let kind = match body.remove("type") {
            None | Some(Value::Null) => return Err(DecodeError::MissingKind),
            Some(Value::String(s)) => {
                MessageKind::parse(&s).ok_or(DecodeError::UnknownKind(s))?
            }
            Some(other) => return Err(DecodeError::UnknownKind(other.to_string())),
        };

        let issued_at = body
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);

        let content = body.remove("content");
        let params = body.remove("params");

        let payload = match kind {
            MessageKind::JoinTarget => {
                if params.is_some() {
                    return Err(mismatch(kind, "join-target carries no params"));
                }
                let target = non_empty_string(kind, content)?;
                Payload::JoinTarget(JoinTarget::new(target))
            }
            MessageKind::Command => {
                let name = non_empty_string(kind, content)?;
                let params = match params {
                    Some(Value::Object(map)) => map
                        .into_iter()
                        .map(|(k, v)| match Scalar::from_value(v) {
                            Some(scalar) => Ok((k, scalar)),
                            None => Err(mismatch(kind, format!("param '{k}' is not a scalar"))),
                        })
                        .collect::<Result<Params, _>>()?,
                    Some(_) => return Err(mismatch(kind, "params must be an object")),
                    None => return Err(mismatch(kind, "command without params")),
                };
                Payload::Command { name, params }
            }
            MessageKind::Notice => {
                if params.is_some() {
                    return Err(mismatch(kind, "notice carries no params"));
                }
                match content {
                    Some(Value::String(text)) => Payload::Notice(text),
                    _ => return Err(mismatch(kind, "content must be a string")),
                }
            }
        };

        Ok(Self { payload, issued_at })
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Payload::JoinTarget(target) => write!(f, "join-target({target})"),
            Payload::Command { name, .. } => write!(f, "command({name})"),
            Payload::Notice(text) => write!(f, "notice({text})"),
        }
    }
}

/// Outcome carried by a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Ok,
    Error,
}

impl AckStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

/// Acknowledgment sent back for every request.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub status: AckStatus,
    pub detail: String,
    pub issued_at: DateTime<Utc>,
}

impl Ack {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Ok,
            detail: detail.into(),
            issued_at: Utc::now(),
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Error,
            detail: detail.into(),
            issued_at: Utc::now(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == AckStatus::Ok
    }

    fn to_value(&self) -> Value {
        let mut body = Map::new();
        body.insert("status".into(), Value::String(self.status.as_str().into()));
        body.insert("detail".into(), Value::String(self.detail.clone()));
        body.insert("timestamp".into(), Value::String(format_timestamp(&self.issued_at)));
        Value::Object(body)
    }

    fn from_object(body: Map<String, Value>) -> Result<Self, DecodeError> {
        let status = match body.get("status").and_then(Value::as_str) {
            Some("ok") => AckStatus::Ok,
            Some("error") => AckStatus::Error,
            Some(other) => return Err(DecodeError::InvalidAck(format!("unknown status '{other}'"))),
            None => return Err(DecodeError::InvalidAck("status must be a string".into())),
        };
        let detail = body
            .get("detail")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let issued_at = body
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);
        Ok(Self {
            status,
            detail,
            issued_at,
        })
    }
}

impl fmt::Display for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status.as_str(), self.detail)
    }
}

/// Anything that can travel in one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(ControlMessage),
    Response(Ack),
}

impl Frame {
    /// Serializes the frame body.
    pub fn to_json(&self) -> String {
        match self {
            Self::Request(message) => message.to_value().to_string(),
            Self::Response(ack) => ack.to_value().to_string(),
        }
    }

    /// Parses a frame body.
    pub fn from_json(body: &[u8]) -> Result<Self, DecodeError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
        let Value::Object(body) = value else {
            return Err(DecodeError::InvalidJson("body is not a JSON object".into()));
        };

        if !body.contains_key("type") && body.contains_key("status") {
            Ack::from_object(body).map(Self::Response)
        } else {
            ControlMessage::from_object(body).map(Self::Request)
        }
    }
}

impl From<ControlMessage> for Frame {
    fn from(message: ControlMessage) -> Self {
        Self::Request(message)
    }
}

impl From<Ack> for Frame {
    fn from(ack: Ack) -> Self {
        Self::Response(ack)
    }
}

fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

fn mismatch(kind: MessageKind, reason: impl Into<String>) -> DecodeError {
    DecodeError::PayloadMismatch {
        kind: kind.as_str(),
        reason: reason.into(),
    }
}

fn non_empty_string(kind: MessageKind, content: Option<Value>) -> Result<String, DecodeError> {
    match content {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        Some(Value::String(_)) => Err(mismatch(kind, "content is empty")),
        _ => Err(mismatch(kind, "content must be a string")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<Frame, DecodeError> {
        Frame::from_json(json.as_bytes())
    }

    #[test]
    fn test_command_body_shape() {
        let mut params = Params::new();
        params.insert("reason".into(), "exit".into());
        let msg = ControlMessage::command("end", params).unwrap();

        let body: Value = serde_json::from_str(&Frame::Request(msg).to_json()).unwrap();
        assert_eq!(body["type"], "command");
        assert_eq!(body["content"], "end");
        assert_eq!(body["params"]["reason"], "exit");
        assert!(body["timestamp"].is_string());
    }

    #[test]
    fn test_join_target_has_no_params_field() {
        let msg = ControlMessage::join_target(JoinTarget::new("https://meet.example/abc")).unwrap();
        let body: Value = serde_json::from_str(&Frame::Request(msg).to_json()).unwrap();
        assert_eq!(body["type"], "join-target");
        assert_eq!(body["content"], "https://meet.example/abc");
        assert!(body.get("params").is_none());
    }

    #[test]
    fn test_parse_request_and_response() {
        let request = parse(r#"{"type":"notice","content":"hello","timestamp":"2024-05-01T10:00:00Z"}"#)
            .unwrap();
        match request {
            Frame::Request(msg) => {
                assert_eq!(msg.payload, Payload::Notice("hello".into()));
                assert_eq!(msg.issued_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
            }
            other => panic!("expected request, got {other:?}"),
        }

        let response = parse(r#"{"status":"ok","detail":"received"}"#).unwrap();
        match response {
            Frame::Response(ack) => {
                assert!(ack.is_ok());
                assert_eq!(ack.detail, "received");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = parse(r#"{"type":"meet_url","content":"x"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownKind(k) if k == "meet_url"));
    }

    #[test]
    fn test_missing_kind_rejected() {
        assert!(matches!(
            parse(r#"{"content":"x"}"#).unwrap_err(),
            DecodeError::MissingKind
        ));
    }

    #[test]
    fn test_command_without_params_rejected() {
        let err = parse(r#"{"type":"command","content":"end"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::PayloadMismatch { kind: "command", .. }));
    }

    #[test]
    fn test_command_with_nested_param_rejected() {
        let err = parse(r#"{"type":"command","content":"end","params":{"a":{"b":1}}}"#).unwrap_err();
        assert!(matches!(err, DecodeError::PayloadMismatch { .. }));
    }

    #[test]
    fn test_join_target_must_be_string() {
        let err = parse(r#"{"type":"join-target","content":{"url":"x"}}"#).unwrap_err();
        assert!(matches!(err, DecodeError::PayloadMismatch { kind: "join-target", .. }));

        let err = parse(r#"{"type":"join-target","content":"  "}"#).unwrap_err();
        assert!(matches!(err, DecodeError::PayloadMismatch { .. }));
    }

    #[test]
    fn test_invalid_ack_status_rejected() {
        let err = parse(r#"{"status":"received"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidAck(_)));
    }

    #[test]
    fn test_non_object_body_rejected() {
        assert!(matches!(parse("[1,2]").unwrap_err(), DecodeError::InvalidJson(_)));
        assert!(matches!(parse("{not json").unwrap_err(), DecodeError::InvalidJson(_)));
    }

    #[test]
    fn test_missing_timestamp_defaults_to_now() {
        let before = Utc::now();
        let Frame::Request(msg) = parse(r#"{"type":"notice","content":"hi"}"#).unwrap() else {
            panic!("expected request");
        };
        assert!(msg.issued_at >= before);
    }

    #[test]
    fn test_helpers() {
        assert!(ControlMessage::end().is_end());
        assert!(ControlMessage::heartbeat().is_heartbeat());
        assert!(!ControlMessage::notice("join failed").is_heartbeat());
        assert_eq!(ControlMessage::end().to_string(), "command(end)");
        assert_eq!(
            ControlMessage::command(FORCE_CLEANUP_COMMAND, Params::new())
                .unwrap()
                .command_name(),
            Some("force_cleanup")
        );
    }

    #[test]
    fn test_constructors_reject_what_decode_rejects() {
        let err = ControlMessage::join_target(JoinTarget::new("")).unwrap_err();
        assert!(matches!(err, DecodeError::PayloadMismatch { kind: "join-target", .. }));

        let err = ControlMessage::join_target(JoinTarget::new("   ")).unwrap_err();
        assert!(matches!(err, DecodeError::PayloadMismatch { .. }));

        let err = ControlMessage::command("", Params::new()).unwrap_err();
        assert!(matches!(err, DecodeError::PayloadMismatch { kind: "command", .. }));
    }
}
