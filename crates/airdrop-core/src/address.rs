//! Destination wallet addresses.
//!
//! Addresses are 20-byte account identifiers written as `0x` followed by 40
//! hex digits. Input that mixes upper- and lowercase digits must carry a
//! valid EIP-55 checksum; single-case input is accepted as-is. The canonical
//! rendering (used for storage and uniqueness) is always the checksummed form.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use thiserror::Error;

/// Length of an account address in bytes.
pub const ADDRESS_LEN: usize = 20;

const HEX_LEN: usize = ADDRESS_LEN * 2;

/// Reasons a wallet address fails syntactic validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AddressError {
    /// Nothing but whitespace was supplied.
    #[error("address is empty")]
    Empty,

    /// The `0x` prefix is missing.
    #[error("address must start with 0x")]
    MissingPrefix,

    /// Wrong number of hex digits after the prefix.
    #[error("address must have {HEX_LEN} hex digits, got {len}")]
    BadLength {
        /// Number of bytes found after the prefix.
        len: usize,
    },

    /// A character outside `[0-9a-fA-F]` was found.
    #[error("address contains non-hex characters")]
    NonHex,

    /// Mixed-case input whose casing does not match the EIP-55 checksum.
    #[error("address fails EIP-55 checksum")]
    BadChecksum,
}

/// A syntactically valid account address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WalletAddress([u8; ADDRESS_LEN]);

impl WalletAddress {
    /// Parses and validates an address.
    ///
    /// Surrounding whitespace is ignored.
    ///
    /// # Errors
    ///
    /// Returns an [`AddressError`] describing the first violation found.
    pub fn parse(text: &str) -> Result<Self, AddressError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AddressError::Empty);
        }

        let digits = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .ok_or(AddressError::MissingPrefix)?;
        if digits.len() != HEX_LEN {
            return Err(AddressError::BadLength { len: digits.len() });
        }
        if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(AddressError::NonHex);
        }

        let mut bytes = [0u8; ADDRESS_LEN];
        hex::decode_to_slice(digits, &mut bytes).map_err(|_| AddressError::NonHex)?;
        let address = Self(bytes);

        let has_lower = digits.bytes().any(|b| b.is_ascii_lowercase());
        let has_upper = digits.bytes().any(|b| b.is_ascii_uppercase());
        if has_lower && has_upper && address.to_checksum()[2..] != *digits {
            return Err(AddressError::BadChecksum);
        }

        Ok(address)
    }

    /// Builds an address from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the raw address bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    /// Renders the EIP-55 checksummed form, including the `0x` prefix.
    #[must_use]
    pub fn to_checksum(&self) -> String {
        let lower = hex::encode(self.0);
        let hash = Keccak256::digest(lower.as_bytes());

        let mut out = String::with_capacity(2 + HEX_LEN);
        out.push_str("0x");
        for (i, c) in lower.chars().enumerate() {
            let shift = if i % 2 == 0 { 4 } else { 0 };
            let nibble = (hash[i / 2] >> shift) & 0x0f;
            if c.is_ascii_alphabetic() && nibble >= 8 {
                out.push(c.to_ascii_uppercase());
            } else {
                out.push(c);
            }
        }
        out
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_checksum())
    }
}

impl fmt::Debug for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WalletAddress({})", self.to_checksum())
    }
}

impl FromStr for WalletAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for WalletAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_checksum())
    }
}

impl<'de> Deserialize<'de> for WalletAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}
