use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::Result;

/// Payload serialization used for message bodies and RPC envelopes.
///
/// An empty payload decodes as a null value, so `()` and `Option<T>` can be
/// read back from a body-less message.
pub trait Codec: Clone + Send + Sync + 'static {
    /// Short name used in logs.
    const NAME: &'static str;

    /// # Errors
    ///
    /// Returns `SerializeFailed` (or `SerdeJsonError`) if the value cannot be
    /// encoded.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes>;

    /// # Errors
    ///
    /// Returns `DeserializeFailed` (or `SerdeJsonError`) if the payload does not
    /// decode into `T`.
    fn deserialize<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T>;

    /// Decodes a payload without knowing its static type.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is malformed.
    fn deserialize_value(&self, payload: &[u8]) -> Result<serde_json::Value> {
        self.deserialize(payload)
    }
}

/// Text codec backed by `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    const NAME: &'static str = "json";

    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        Ok(serde_json::to_vec(value)?.into())
    }

    fn deserialize<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T> {
        if payload.is_empty() {
            Ok(serde_json::from_value(serde_json::Value::Null)?)
        } else {
            Ok(serde_json::from_slice(payload)?)
        }
    }
}

/// Binary codec backed by MessagePack; structs are encoded as maps.
#[derive(Clone, Copy, Debug, Default)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    const NAME: &'static str = "msgpack";

    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        Ok(rmp_serde::to_vec_named(value)?.into())
    }

    fn deserialize<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T> {
        if payload.is_empty() {
            Ok(serde_json::from_value(serde_json::Value::Null)?)
        } else {
            Ok(rmp_serde::from_slice(payload)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::ErrorKind;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct ExampleMessage {
        text: String,
    }

    #[test]
    fn test_json_codec() {
        let codec = JsonCodec;
        let bytes = codec
            .serialize(&ExampleMessage {
                text: "hi".into(),
            })
            .unwrap();
        assert_eq!(&bytes[..], br#"{"text":"hi"}"#);

        let value = codec.deserialize_value(&bytes).unwrap();
        assert_eq!(value, serde_json::json!({ "text": "hi" }));

        let err = codec.deserialize::<ExampleMessage>(b"[1,").unwrap_err();
        assert_eq!(err.kind, ErrorKind::SerdeJsonError);
    }

    #[test]
    fn test_msgpack_codec() {
        let codec = MsgPackCodec;
        let bytes = codec.serialize(&(2i32, 3i32)).unwrap();
        assert_eq!(&bytes[..], &[0x92, 0x02, 0x03]);
        let (a, b): (i32, i32) = codec.deserialize(&bytes).unwrap();
        assert_eq!(a + b, 5);

        let msg = ExampleMessage {
            text: "hi".into(),
        };
        let bytes = codec.serialize(&msg).unwrap();
        assert_eq!(
            codec.deserialize_value(&bytes).unwrap(),
            serde_json::json!({ "text": "hi" })
        );

        let err = codec.deserialize::<ExampleMessage>(&[0xc1]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeserializeFailed);
    }

    #[test]
    fn test_empty_payload_is_null() {
        let () = JsonCodec.deserialize(&[]).unwrap();
        let none: Option<u32> = MsgPackCodec.deserialize(&[]).unwrap();
        assert_eq!(none, None);
        assert!(JsonCodec.deserialize::<String>(&[]).is_err());
    }
}
