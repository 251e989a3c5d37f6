//! Authorization material attached to each metered request.
//!
//! Both values are produced by the client at request time and consumed,
//! never mutated, by the prover.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BrokerError;

/// A client signature over a metered request.
///
/// The `Signature` header carries a JSON array of integers, which is the
/// exact shape the prover expects for its `signatures` argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(Vec<i64>);

impl Signature {
    /// Wrap raw signature words.
    #[must_use]
    pub fn new(words: Vec<i64>) -> Self {
        Self(words)
    }

    /// Return the signature words.
    #[must_use]
    pub fn words(&self) -> &[i64] {
        &self.0
    }

    /// Encode the signature the way the `Signature` header carries it.
    #[must_use]
    pub fn to_header_value(&self) -> String {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        format!("[{}]", parts.join(","))
    }
}

impl FromStr for Signature {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let words: Vec<i64> =
            serde_json::from_str(s).map_err(|e| BrokerError::InvalidSignature(e.to_string()))?;
        if words.is_empty() {
            return Err(BrokerError::InvalidSignature("empty signature".into()));
        }
        Ok(Self(words))
    }
}

/// Hash of the request body as computed by the client.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestHash(Vec<u8>);

impl RequestHash {
    /// Wrap raw hash bytes.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Return the raw hash bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Widen each byte to an integer word, as the prover's request model wants.
    #[must_use]
    pub fn to_words(&self) -> Vec<i64> {
        self.0.iter().map(|b| i64::from(*b)).collect()
    }
}

impl FromStr for RequestHash {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .ok_or_else(|| BrokerError::InvalidRequestHash("missing 0x prefix".into()))?;
        let bytes =
            hex::decode(digits).map_err(|e| BrokerError::InvalidRequestHash(e.to_string()))?;
        if bytes.is_empty() {
            return Err(BrokerError::InvalidRequestHash("empty hash".into()));
        }
        Ok(Self(bytes))
    }
}

impl fmt::Debug for RequestHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestHash({self})")
    }
}

impl fmt::Display for RequestHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl TryFrom<String> for RequestHash {
    type Error = BrokerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RequestHash> for String {
    fn from(hash: RequestHash) -> Self {
        hash.to_string()
    }
}
