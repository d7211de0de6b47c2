use serde_json::Value;

use crate::error::DecodeError;
use crate::event::{Phase, ProxyEvent};
use crate::reply::ProxyReply;

/// Decodes a payload emitted under an event name, e.g.
/// `decode_event("response", r#"{"eventId":"1",...}"#)`.
pub fn decode_event(name: &str, payload: &str) -> Result<ProxyEvent, DecodeError> {
    let phase: Phase = name.parse()?;
    let mut value: Value = serde_json::from_str(payload)?;
    let Value::Object(map) = &mut value else {
        return Err(DecodeError::NotAnObject);
    };
    map.insert(
        "event".to_string(),
        Value::String(phase.event_name().to_string()),
    );
    Ok(serde_json::from_value(value)?)
}

/// Decodes one line of a recorded stream where the event name travels in the
/// `event` field.
pub fn decode_event_line(line: &str) -> Result<ProxyEvent, DecodeError> {
    let value: Value = serde_json::from_str(line)?;
    let Some(name) = value.get("event").and_then(Value::as_str) else {
        return Err(DecodeError::UnknownEvent(String::new()));
    };
    name.parse::<Phase>()?;
    Ok(serde_json::from_value(value)?)
}

pub fn encode_reply(reply: &ProxyReply) -> Result<String, DecodeError> {
    Ok(serde_json::to_string(reply)?)
}
