//! Small value types shared by the ledger, the transfer executor, and the
//! claim coordinator.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Identifier of a settlement transaction (a transaction hash on chain).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferReference(String);

impl TransferReference {
    /// Wraps a transaction identifier.
    #[must_use]
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TransferReference {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A token amount in the token's smallest unit.
///
/// Serialized as a decimal string so JSON consumers do not lose precision.
/// Deserializes from either an integer or a decimal string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TokenAmount(u128);

impl TokenAmount {
    /// Wraps a raw amount.
    #[must_use]
    pub const fn new(units: u128) -> Self {
        Self(units)
    }

    /// Returns the raw amount.
    #[must_use]
    pub const fn units(self) -> u128 {
        self.0
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Big-endian 32-byte encoding, as used for ABI `uint256` words.
    #[must_use]
    pub fn to_be_word(self) -> [u8; 32] {
        let mut word = [0u8; 32];
        word[16..].copy_from_slice(&self.0.to_be_bytes());
        word
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(value) => Ok(Self(u128::from(value))),
            Raw::Text(text) => text
                .trim()
                .parse::<u128>()
                .map(Self)
                .map_err(|e| serde::de::Error::custom(format!("invalid token amount {text:?}: {e}"))),
        }
    }
}
