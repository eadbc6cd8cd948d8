//! Конверт сообщения и кодек, превращающий его в полезную нагрузку.

use bytes::Bytes;
use gilmour_error::CodecError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Декодированное сообщение: тело, код статуса и id запроса отправителя.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub data: Value,
    #[serde(default = "default_code")]
    pub code: u16,
    #[serde(default)]
    pub sender: String,
}

fn default_code() -> u16 {
    200
}

impl Envelope {
    pub fn new(
        data: Value,
        code: u16,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            data,
            code,
            sender: sender.into(),
        }
    }

    /// Конверт запроса: код 200, id запроса в качестве sender.
    pub fn request(
        data: Value,
        sender: impl Into<String>,
    ) -> Self {
        Self::new(data, 200, sender)
    }
}

/// Кодирует конверты в байты и обратно.
pub trait EnvelopeCodec: Send + Sync + 'static {
    fn encode(
        &self,
        envelope: &Envelope,
    ) -> Result<Bytes, CodecError>;

    fn decode(
        &self,
        payload: &[u8],
    ) -> Result<Envelope, CodecError>;
}

/// JSON-кодек: `{"data": ..., "code": 200, "sender": "..."}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl EnvelopeCodec for JsonCodec {
    fn encode(
        &self,
        envelope: &Envelope,
    ) -> Result<Bytes, CodecError> {
        serde_json::to_vec(envelope)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(
        &self,
        payload: &[u8],
    ) -> Result<Envelope, CodecError> {
        serde_json::from_slice(payload).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_encode_layout() {
        let env = Envelope::new(json!({"a": 1}), 201, "req-1");
        let bytes = JsonCodec.encode(&env).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"data": {"a": 1}, "code": 201, "sender": "req-1"}));
    }

    #[test]
    fn test_decode_fills_defaults() {
        let env = JsonCodec.decode(br#"{"data": "x"}"#).unwrap();
        assert_eq!(env.data, json!("x"));
        assert_eq!(env.code, 200);
        assert_eq!(env.sender, "");
    }

    #[test]
    fn test_decode_garbage_is_error() {
        let err = JsonCodec.decode(b"not json").unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }
}
