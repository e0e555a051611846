// Message codec: JSON text frames with a size limit

use super::types::{DataEnvelope, Payload};
use crate::error::ProtocolError;
use serde_json::{Map, Value};

/// Maximum encoded frame size: 256 KB.
/// A 16 KiB chunk is about 22 KB once base64-encoded.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Serialize an envelope to `{type, messageId, timestamp, data}`
pub fn encode_envelope(envelope: &DataEnvelope) -> Result<String, ProtocolError> {
    let mut value = serde_json::to_value(&envelope.payload)
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;

    let object = value
        .as_object_mut()
        .ok_or_else(|| ProtocolError::Serialization("payload is not an object".to_string()))?;
    object.insert(
        "messageId".to_string(),
        Value::String(envelope.message_id.clone()),
    );
    object.insert("timestamp".to_string(), Value::from(envelope.timestamp));

    let text = serde_json::to_string(&value)
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;

    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::Serialization(format!(
            "Encoded frame too large: {} bytes (max {})",
            text.len(),
            MAX_FRAME_SIZE
        )));
    }

    Ok(text)
}

/// Parse a text frame back into an envelope
pub fn decode_envelope(text: &str) -> Result<DataEnvelope, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::Malformed(format!(
            "Frame too large: {} bytes (max {})",
            text.len(),
            MAX_FRAME_SIZE
        )));
    }

    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let Value::Object(mut object) = value else {
        return Err(ProtocolError::Malformed("frame is not an object".to_string()));
    };

    let message_id = match object.remove("messageId") {
        Some(Value::String(id)) => id,
        _ => return Err(ProtocolError::Malformed("missing messageId".to_string())),
    };
    let timestamp = object
        .remove("timestamp")
        .and_then(|t| t.as_u64())
        .ok_or_else(|| ProtocolError::Malformed("missing timestamp".to_string()))?;

    let payload: Payload = serde_json::from_value(Value::Object(rest(object)))
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    Ok(DataEnvelope {
        message_id,
        timestamp,
        payload,
    })
}

// Only `type` and `data` reach the payload decoder
fn rest(mut object: Map<String, Value>) -> Map<String, Value> {
    object.retain(|key, _| key == "type" || key == "data");
    object
}
