//! Inbound frame validation and classification.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::command::PrinterCommand;

/// Interface tag carried by frames that originate from a browser client.
pub const CLIENT_INTERFACE: &str = "client";

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame token does not match the configured token")]
    TokenMismatch,
    #[error("unexpected frame interface {0:?}")]
    WrongInterface(Option<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Online,
    Offline,
}

impl Presence {
    pub fn is_online(self) -> bool {
        matches!(self, Presence::Online)
    }
}

/// Camera stream signalling step requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSignal {
    Request,
    Candidate,
    Offer,
}

impl StreamSignal {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "request" => Some(StreamSignal::Request),
            "remote_candidate" => Some(StreamSignal::Candidate),
            "offer" => Some(StreamSignal::Offer),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamSignal::Request => "request",
            StreamSignal::Candidate => "remote_candidate",
            StreamSignal::Offer => "offer",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Presence(Presence),
    Stream {
        signal: StreamSignal,
        /// Nested `data` object, forwarded to the stream signaller untouched.
        payload: Value,
        auth_key: Option<String>,
    },
    StatusQuery,
    UpdateRequest,
    Command(PrinterCommand),
}

/// Parse a raw text frame, rejecting anything not addressed to this device.
///
/// Tags are checked in a fixed order (`state`, `webrtc`, `status`, `update`)
/// and anything left over is treated as a printer command. A `state` or
/// `webrtc` tag with an unrecognized value falls through to the next check.
pub fn parse_frame(raw: &str, expected_token: &str) -> Result<InboundFrame, FrameError> {
    let value: Value = serde_json::from_str(raw).map_err(FrameError::Malformed)?;
    let Value::Object(map) = value else {
        return Err(FrameError::NotAnObject);
    };
    validate(&map, expected_token)?;
    Ok(classify(map))
}

fn validate(map: &Map<String, Value>, expected_token: &str) -> Result<(), FrameError> {
    let token = map.get("token").and_then(Value::as_str).unwrap_or_default();
    if expected_token.is_empty() || token != expected_token {
        return Err(FrameError::TokenMismatch);
    }
    match map.get("interface").and_then(Value::as_str) {
        Some(CLIENT_INTERFACE) => Ok(()),
        other => Err(FrameError::WrongInterface(other.map(str::to_owned))),
    }
}

fn classify(mut map: Map<String, Value>) -> InboundFrame {
    match map.get("state").and_then(Value::as_str) {
        Some("online") => return InboundFrame::Presence(Presence::Online),
        Some("offline") => return InboundFrame::Presence(Presence::Offline),
        _ => {}
    }

    if let Some(signal) = map
        .get("webrtc")
        .and_then(Value::as_str)
        .and_then(StreamSignal::from_tag)
    {
        let auth_key = map
            .get("auth_key")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let payload = map.remove("data").unwrap_or(Value::Null);
        return InboundFrame::Stream {
            signal,
            payload,
            auth_key,
        };
    }

    if map.get("status").is_some_and(|v| !v.is_null()) {
        return InboundFrame::StatusQuery;
    }

    if map.get("update").and_then(Value::as_str) == Some("update") {
        return InboundFrame::UpdateRequest;
    }

    InboundFrame::Command(PrinterCommand::from_frame(&map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ExecuteCommand, MotionCommand};
    use serde_json::json;

    fn frame(body: Value) -> String {
        let mut body = body;
        body["token"] = json!("tok");
        body["interface"] = json!("client");
        body.to_string()
    }

    #[test]
    fn rejects_token_mismatch_and_foreign_interface() {
        let raw = json!({"token": "other", "interface": "client", "state": "online"}).to_string();
        assert!(matches!(
            parse_frame(&raw, "tok"),
            Err(FrameError::TokenMismatch)
        ));

        let raw = json!({"token": "tok", "interface": "printer", "state": "online"}).to_string();
        assert!(matches!(
            parse_frame(&raw, "tok"),
            Err(FrameError::WrongInterface(Some(_)))
        ));

        let raw = json!({"token": "", "interface": "client"}).to_string();
        assert!(matches!(parse_frame(&raw, ""), Err(FrameError::TokenMismatch)));
    }

    #[test]
    fn rejects_non_objects_and_garbage() {
        assert!(matches!(
            parse_frame("[1,2]", "tok"),
            Err(FrameError::NotAnObject)
        ));
        assert!(matches!(
            parse_frame("{not json", "tok"),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn classifies_presence_and_stream_frames() {
        let parsed = parse_frame(&frame(json!({"state": "offline"})), "tok").unwrap();
        assert_eq!(parsed, InboundFrame::Presence(Presence::Offline));

        let parsed = parse_frame(
            &frame(json!({"webrtc": "offer", "auth_key": "k1", "data": {"sdp": "v=0"}})),
            "tok",
        )
        .unwrap();
        assert_eq!(
            parsed,
            InboundFrame::Stream {
                signal: StreamSignal::Offer,
                payload: json!({"sdp": "v=0"}),
                auth_key: Some("k1".into()),
            }
        );
    }

    #[test]
    fn unknown_state_falls_through_to_later_tags() {
        let parsed = parse_frame(&frame(json!({"state": "away", "status": true})), "tok").unwrap();
        assert_eq!(parsed, InboundFrame::StatusQuery);

        let parsed = parse_frame(&frame(json!({"update": "update"})), "tok").unwrap();
        assert_eq!(parsed, InboundFrame::UpdateRequest);
    }

    #[test]
    fn null_status_is_not_a_status_query() {
        let parsed = parse_frame(
            &frame(json!({"status": null, "execute": {"cmd": "pause"}})),
            "tok",
        )
        .unwrap();
        assert_eq!(
            parsed,
            InboundFrame::Command(PrinterCommand::Execute(ExecuteCommand::Pause))
        );
    }

    #[test]
    fn domain_frames_become_commands() {
        let parsed = parse_frame(
            &frame(json!({"motion": {"cmd": "home", "axes": ["x", "y"]}})),
            "tok",
        )
        .unwrap();
        assert_eq!(
            parsed,
            InboundFrame::Command(PrinterCommand::Motion(MotionCommand::Home {
                axes: vec!["x".into(), "y".into()]
            }))
        );
    }
}
