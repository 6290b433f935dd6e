//! Codec for the `config` request payload

use crate::rule::ForwardingRule;
use crate::MAX_CONFIG_SIZE;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Leading bytes of every encoded config
pub const CONFIG_MAGIC: &[u8; 4] = b"RTCF";

/// Current config encoding version
pub const CONFIG_VERSION: u8 = 1;

const HEADER_LEN: usize = CONFIG_MAGIC.len() + 1;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Config too large: {0} bytes")]
    ConfigTooLarge(usize),

    #[error("Invalid config header")]
    InvalidHeader,

    #[error("Unsupported config version: {0}")]
    UnsupportedVersion(u8),
}

/// Encode an ordered rule set
///
/// Format: [magic: 4][version: u8][payload: bincode serialized rules]
pub fn encode_config(rules: &[ForwardingRule]) -> Result<Bytes, CodecError> {
    let payload = bincode::serialize(rules)?;

    if HEADER_LEN + payload.len() > MAX_CONFIG_SIZE {
        return Err(CodecError::ConfigTooLarge(HEADER_LEN + payload.len()));
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(CONFIG_MAGIC);
    buf.put_u8(CONFIG_VERSION);
    buf.extend_from_slice(&payload);

    Ok(buf.freeze())
}

/// Decode a rule set produced by [`encode_config`]
pub fn decode_config(data: &[u8]) -> Result<Vec<ForwardingRule>, CodecError> {
    if data.len() > MAX_CONFIG_SIZE {
        return Err(CodecError::ConfigTooLarge(data.len()));
    }
    if data.len() < HEADER_LEN || &data[..CONFIG_MAGIC.len()] != CONFIG_MAGIC {
        return Err(CodecError::InvalidHeader);
    }

    let version = data[CONFIG_MAGIC.len()];
    if version != CONFIG_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    Ok(bincode::deserialize(&data[HEADER_LEN..])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::parse_rules;

    #[test]
    fn test_encode_decode() {
        let rules = parse_rules(["8080", "R:2222:localhost:22", "[::1]:53:1.1.1.1:53/udp"]).unwrap();

        let encoded = encode_config(&rules).unwrap();
        assert_eq!(&encoded[..4], CONFIG_MAGIC);
        assert_eq!(encoded[4], CONFIG_VERSION);

        let decoded = decode_config(&encoded).unwrap();
        assert_eq!(decoded, rules);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let rules = parse_rules(["3000", "4000"]).unwrap();
        assert_eq!(encode_config(&rules).unwrap(), encode_config(&rules).unwrap());
    }

    #[test]
    fn test_empty_rule_set() {
        let encoded = encode_config(&[]).unwrap();
        assert!(decode_config(&encoded).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_bad_header() {
        assert!(matches!(
            decode_config(b"XXXX\x01"),
            Err(CodecError::InvalidHeader)
        ));
        assert!(matches!(decode_config(b"RT"), Err(CodecError::InvalidHeader)));

        let mut encoded = encode_config(&[]).unwrap().to_vec();
        encoded[4] = 9;
        assert!(matches!(
            decode_config(&encoded),
            Err(CodecError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_rules_serialize_as_json() {
        let rules = parse_rules(["R:8080"]).unwrap();
        let json = serde_json::to_value(&rules).unwrap();
        assert_eq!(json[0]["reverse"], true);
        assert_eq!(json[0]["remote"]["host"], "localhost");
    }
}
