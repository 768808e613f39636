use crate::*;
use sha2::{Digest, Sha256};
use std::fmt;

const NULLIFIER_TAG: u8 = 0x02;

/// Per-election pseudonym of an identity, spent once on the ledger
///
/// Only computed here; whether it has been spent is the ledger's business.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Nullifier(#[serde(with = "Bytes32Hex")] pub [u8; 32]);

impl Nullifier {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, ValidationError> {
        Ok(Nullifier(decode_fixed("nullifier", s)?))
    }
}

impl fmt::Display for Nullifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// nullifier = SHA-256(tag || nullifier_secret || election_id as u64 big-endian)
///
/// The election id is fixed width so no (secret, election) pair can collide with another by
/// concatenation.
pub fn derive_nullifier(nullifier_secret: &IdentitySecret, election_id: ElectionId) -> Nullifier {
    let mut hasher = Sha256::new();
    hasher.update([NULLIFIER_TAG]);
    hasher.update(nullifier_secret.expose());
    hasher.update(election_id.to_be_bytes());
    let nullifier = Nullifier(hasher.finalize().into());

    tracing::debug!(
        "derived nullifier for election {}: {}",
        election_id,
        preview(&nullifier.0)
    );
    nullifier
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn deterministic_per_election(secret in any::<[u8; 32]>(), election in any::<u64>()) {
            let secret = IdentitySecret::from_bytes(secret);
            prop_assert_eq!(
                derive_nullifier(&secret, election),
                derive_nullifier(&secret, election)
            );
        }

        #[test]
        fn distinct_across_elections(secret in any::<[u8; 32]>(), e1 in any::<u64>(), e2 in any::<u64>()) {
            prop_assume!(e1 != e2);
            let secret = IdentitySecret::from_bytes(secret);
            prop_assert_ne!(derive_nullifier(&secret, e1), derive_nullifier(&secret, e2));
        }

        #[test]
        fn distinct_across_identities(s1 in any::<[u8; 32]>(), s2 in any::<[u8; 32]>(), election in any::<u64>()) {
            prop_assume!(s1 != s2);
            let n1 = derive_nullifier(&IdentitySecret::from_bytes(s1), election);
            let n2 = derive_nullifier(&IdentitySecret::from_bytes(s2), election);
            prop_assert_ne!(n1, n2);
        }
    }

    #[test]
    fn identity_nullifier_matches_secret() {
        let identity = VoterIdentity::from_seed(b"carol");
        let nullifier = identity.nullifier(42);
        assert_eq!(nullifier, derive_nullifier(identity.nullifier_secret(), 42));
        assert_eq!(nullifier.to_hex().len(), 64);
        assert_eq!(Nullifier::from_hex(&nullifier.to_hex()).unwrap(), nullifier);
    }
}
