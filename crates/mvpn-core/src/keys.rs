//! Tunnel Key Handling
//!
//! X25519 keys as they appear in tunnel configs: base64-encoded 32-byte
//! values. Used to validate key material in backend-issued configs before
//! handing them to an engine, and to generate fresh keys for local setup.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::rngs::OsRng;
use std::fmt;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// Key parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Invalid key length (expected 32 bytes)")]
    InvalidLength,
}

fn decode32(s: &str) -> Result<[u8; 32], KeyError> {
    let bytes = BASE64.decode(s).map_err(|_| KeyError::InvalidBase64)?;
    if bytes.len() != 32 {
        return Err(KeyError::InvalidLength);
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

/// Tunnel private key (Curve25519)
#[derive(Clone)]
pub struct PrivateKey {
    secret: StaticSecret,
}

impl PrivateKey {
    /// Generate a new random private key
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(bytes),
        }
    }

    /// Create from base64 string
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        Ok(Self::from_bytes(decode32(s)?))
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: X25519Public::from(&self.secret),
        }
    }

    /// Get raw bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([redacted])")
    }
}

/// Tunnel public key (Curve25519)
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey {
    key: X25519Public,
}

impl PublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            key: X25519Public::from(bytes),
        }
    }

    /// Create from base64 string
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        Ok(Self::from_bytes(decode32(s)?))
    }

    /// Get raw bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let private = PrivateKey::generate();

        assert_eq!(private.to_bytes().len(), 32);
        assert_eq!(private.public_key().to_bytes().len(), 32);
    }

    #[test]
    fn test_key_base64_roundtrip() {
        let private = PrivateKey::generate();

        let b64 = private.to_base64();
        let restored = PrivateKey::from_base64(&b64).unwrap();

        assert_eq!(private.to_bytes(), restored.to_bytes());
    }

    #[test]
    fn test_public_from_private() {
        let private = PrivateKey::generate();
        let public1 = private.public_key();
        let public2 = private.public_key();

        assert_eq!(public1.to_bytes(), public2.to_bytes());
    }

    #[test]
    fn test_invalid_base64() {
        let result = PublicKey::from_base64("not-valid-base64!!!");
        assert_eq!(result.unwrap_err(), KeyError::InvalidBase64);
    }

    #[test]
    fn test_wrong_length_rejected() {
        // valid base64, but only 6 bytes
        let result = PublicKey::from_base64("AAAABBBB");
        assert_eq!(result.unwrap_err(), KeyError::InvalidLength);
    }

    #[test]
    fn test_private_key_debug_redacted() {
        let private = PrivateKey::generate();
        assert_eq!(format!("{:?}", private), "PrivateKey([redacted])");
    }
}
