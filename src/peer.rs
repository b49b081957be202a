//! Overlay peer identity.

use std::fmt;
use std::str::FromStr;

/// Opaque, overlay-assigned peer identity.
///
/// Thirty-two raw bytes (an ed25519 public key on the iroh overlay). The text
/// form is lowercase hex, and ordering is plain byte order, which makes it
/// usable as a stable sort key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Length of the raw identity in bytes.
    pub const LENGTH: usize = 32;

    /// Wrap raw identity bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse an identity from a byte slice of exactly [`PeerId::LENGTH`] bytes.
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, ParsePeerIdError> {
        let raw: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ParsePeerIdError::Length(bytes.len()))?;
        Ok(Self(raw))
    }

    /// Raw identity bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short form for log lines.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..5])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.fmt_short())
    }
}

/// Error returned when a peer identity cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParsePeerIdError {
    /// Wrong number of bytes.
    #[error("expected 32 identity bytes, got {0}")]
    Length(usize),
    /// Text form is not 64 characters long.
    #[error("expected 64 hex characters, got {0}")]
    TextLength(usize),
    /// Not a hex string.
    #[error("invalid hex in peer identity")]
    Hex,
}

impl FromStr for PeerId {
    type Err = ParsePeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != Self::LENGTH * 2 {
            return Err(ParsePeerIdError::TextLength(s.chars().count()));
        }
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out).map_err(|e| match e {
            hex::FromHexError::InvalidHexCharacter { .. } => ParsePeerIdError::Hex,
            _ => ParsePeerIdError::TextLength(s.chars().count()),
        })?;
        Ok(Self(out))
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}
