//! Content digests for RRDP documents and published objects.
//!
//! RRDP advertises every referenced resource by the hex-encoded SHA-256 of
//! its bytes. All admission of fetched data goes through [`verify`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// SHA-256 digest of some content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Create a new ContentHash from raw bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute the digest of `data`
    pub fn of(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(hash.into())
    }

    /// Convert to lowercase hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a hexadecimal string (either case, exactly 64 digits)
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        if hex_str.len() != 64 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        hex::decode_to_slice(hex_str, &mut arr)?;
        Ok(Self(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl TryFrom<String> for ContentHash {
    type Error = hex::FromHexError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.to_hex()
    }
}

/// Check that `bytes` hash to `expected`.
pub fn verify(bytes: &[u8], expected: &ContentHash) -> bool {
    ContentHash::of(bytes) == *expected
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256("abc")
    const ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_known_digest() {
        assert_eq!(ContentHash::of(b"abc").to_hex(), ABC);
    }

    #[test]
    fn test_from_hex_accepts_uppercase() {
        let upper = ContentHash::from_hex(&ABC.to_uppercase()).unwrap();
        assert_eq!(upper, ContentHash::of(b"abc"));
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(ContentHash::from_hex("abcd").is_err());
        assert!(ContentHash::from_hex(&"zz".repeat(32)).is_err());
        assert!(ContentHash::from_hex(&format!("{}00", ABC)).is_err());
    }

    #[test]
    fn test_verify() {
        let expected = ContentHash::from_hex(ABC).unwrap();
        assert!(verify(b"abc", &expected));
        assert!(!verify(b"abd", &expected));
        assert!(!verify(b"", &expected));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let hash = ContentHash::of(b"abc");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", ABC));
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
        assert!(serde_json::from_str::<ContentHash>("\"nope\"").is_err());
    }
}
