use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Bytes of OS randomness behind a locally minted id.
const CALL_ID_BYTES: usize = 16;

/// Identifies one call for its whole lifetime.
///
/// Ids minted here carry 128 bits from the OS CSPRNG, hex encoded. Ids
/// arriving from remote peers are taken as opaque strings, but never blank.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct CallId(String);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("call id must not be blank")]
pub struct BlankCallId;

impl CallId {
    pub fn random() -> Self {
        let mut bytes = [0u8; CALL_ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        CallId(hex::encode(bytes))
    }

    /// Wraps a remote-supplied id. Empty ids are rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(CallId(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CallId {
    type Error = BlankCallId;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        CallId::parse(&raw).ok_or(BlankCallId)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CallId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn random_ids_are_128_bit_hex() {
        let id = CallId::random();
        assert_eq!(id.as_str().len(), CALL_ID_BYTES * 2);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn random_ids_do_not_repeat() {
        let ids: HashSet<CallId> = (0..2048).map(|_| CallId::random()).collect();
        assert_eq!(ids.len(), 2048);
    }

    #[test]
    fn parse_rejects_blank() {
        assert!(CallId::parse("   ").is_none());
        assert_eq!(CallId::parse(" abc ").map(|id| id.to_string()), Some("abc".into()));
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = CallId::parse("x1").expect("valid");
        assert_eq!(serde_json::to_string(&id).expect("serialize"), "\"x1\"");
    }

    #[test]
    fn deserialize_applies_parse_rules() {
        assert!(serde_json::from_str::<CallId>("\"\"").is_err());
        assert!(serde_json::from_str::<CallId>("\"  \"").is_err());
        let id: CallId = serde_json::from_str("\" x1 \"").expect("deserialize");
        assert_eq!(id.as_str(), "x1");
    }
}
