//! On-chain user account view.

use serde::{Deserialize, Serialize};

use crate::ids::AccountAddress;

/// The two-word public key a user registered on the ledger.
///
/// Words are kept as decimal strings, which is how the prover consumes them
/// and avoids a big-integer dependency here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerKey([String; 2]);

impl SignerKey {
    /// Build a key from two decimal words.
    ///
    /// Returns `None` if either word is empty or not all digits.
    #[must_use]
    pub fn from_decimal(first: impl Into<String>, second: impl Into<String>) -> Option<Self> {
        let words = [first.into(), second.into()];
        words
            .iter()
            .all(|w| !w.is_empty() && w.bytes().all(|b| b.is_ascii_digit()))
            .then_some(Self(words))
    }

    /// Return both words.
    #[must_use]
    pub fn parts(&self) -> &[String; 2] {
        &self.0
    }
}

/// A user's account as held by the ledger contract for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    /// The user's address.
    pub address: AccountAddress,
    /// Public key the user signs requests with.
    pub signer: SignerKey,
    /// Highest nonce already settled on-chain.
    pub nonce: u64,
    /// Remaining balance, in neuron.
    pub balance: u128,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signer_key_requires_decimal_words() {
        assert!(SignerKey::from_decimal("123", "456").is_some());
        assert!(SignerKey::from_decimal("", "456").is_none());
        assert!(SignerKey::from_decimal("0x12", "456").is_none());
        assert!(SignerKey::from_decimal("12", "-4").is_none());
    }
}
