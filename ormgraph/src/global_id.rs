//! Opaque global identifiers

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;

use crate::store::Pk;

/// Encodes a `(type, key)` pair into an opaque id and back
pub trait GlobalIdCodec: Send + Sync {
    fn encode(&self, type_name: &str, pk: &Pk) -> String;

    /// `None` when the id is not one this codec produced
    fn decode(&self, id: &str) -> Option<(String, Pk)>;
}

/// Relay-style id: base64url of `"{Type}:{pk}"`
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayGlobalId;

impl GlobalIdCodec for RelayGlobalId {
    fn encode(&self, type_name: &str, pk: &Pk) -> String {
        let raw = format!("{type_name}:{pk}");
        URL_SAFE_NO_PAD.encode(raw.as_bytes())
    }

    fn decode(&self, id: &str) -> Option<(String, Pk)> {
        let bytes = URL_SAFE_NO_PAD.decode(id).ok()?;
        let raw = String::from_utf8(bytes).ok()?;
        let (type_name, key) = raw.split_once(':')?;
        if type_name.is_empty() {
            return None;
        }
        let pk = Pk::from_value(&Value::String(key.to_string()))?;
        Some((type_name.to_string(), pk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_id_shape() {
        let codec = RelayGlobalId;
        let id = codec.encode("Post", &Pk::Int(7));
        assert_eq!(id, URL_SAFE_NO_PAD.encode("Post:7"));
        assert_eq!(codec.decode(&id), Some(("Post".to_string(), Pk::Int(7))));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let codec = RelayGlobalId;
        assert_eq!(codec.decode("12"), None);
        assert_eq!(codec.decode(&URL_SAFE_NO_PAD.encode("no-separator")), None);
        assert_eq!(codec.decode("!!!"), None);
    }
}
