//! ElGamal vote encryption over the Ristretto255 prime-order group.
//!
//! A vote for candidate `id` is the group element `m·G` with `m = id + 2`, so the lowest
//! allowed id (`-1`, the blank/sentinel choice) still encodes to a non-identity point.
//! Decryption recovers `m·G` and finds `m` by search over `[1, decode_bound]`; the bound is an
//! explicit assumption that elections have few candidates.

use crate::*;
use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Largest encoded message searched during decryption when none is configured
pub const DEFAULT_DECODE_BOUND: u64 = 200;

/// Largest decode bound a cipher accepts
pub const MAX_DECODE_BOUND: u64 = 1 << 16;

/// Lowest candidate id accepted for encryption (the blank/sentinel choice)
pub const MIN_CANDIDATE_ID: i64 = -1;

// encoded = id + ENCODING_OFFSET, so MIN_CANDIDATE_ID encodes to 1
const ENCODING_OFFSET: i64 = 2;

/// Vote cipher configuration
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CipherConfig {
    pub decode_bound: u64,
}

impl Default for CipherConfig {
    fn default() -> Self {
        CipherConfig {
            decode_bound: DEFAULT_DECODE_BOUND,
        }
    }
}

// The bound must admit at least the sentinel id -1 and candidate 0
fn check_decode_bound(decode_bound: u64) -> Result<(), ValidationError> {
    if !(ENCODING_OFFSET as u64..=MAX_DECODE_BOUND).contains(&decode_bound) {
        return Err(ValidationError::InvalidDecodeBound {
            got: decode_bound,
            max: MAX_DECODE_BOUND,
        });
    }
    Ok(())
}

/// Map a candidate id onto a strictly positive message
pub fn encode_candidate(candidate_id: i64, decode_bound: u64) -> Result<u64, ValidationError> {
    check_decode_bound(decode_bound)?;
    let max = decode_bound as i64 - ENCODING_OFFSET;
    if candidate_id < MIN_CANDIDATE_ID || candidate_id > max {
        return Err(ValidationError::CandidateOutOfRange {
            id: candidate_id,
            min: MIN_CANDIDATE_ID,
            max,
        });
    }
    Ok((candidate_id + ENCODING_OFFSET) as u64)
}

/// Inverse of `encode_candidate`
pub fn decode_candidate(encoded: u64) -> i64 {
    encoded as i64 - ENCODING_OFFSET
}

/// An election public key, compressed Ristretto point
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub struct ElGamalPublicKey(#[serde(with = "PointHex")] pub CompressedRistretto);

impl ElGamalPublicKey {
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let bytes: [u8; 32] = decode_fixed("public key", s)?;
        let compressed = CompressedRistretto(bytes);
        if compressed.decompress().is_none() {
            return Err(CryptoError::InvalidPoint("public key").into());
        }
        Ok(ElGamalPublicKey(compressed))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    pub fn point(&self) -> Result<RistrettoPoint, CryptoError> {
        self.0
            .decompress()
            .ok_or(CryptoError::InvalidPoint("public key"))
    }
}

impl fmt::Display for ElGamalPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// An election private key: a scalar in (0, order), little-endian hex on the wire
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ElGamalSecretKey(Scalar);

impl serde::Serialize for ElGamalSecretKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ScalarHex::serialize(&self.0, serializer)
    }
}

impl<'de> serde::Deserialize<'de> for ElGamalSecretKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let scalar = ScalarHex::deserialize(deserializer)?;
        ElGamalSecretKey::from_bytes(scalar.to_bytes()).map_err(serde::de::Error::custom)
    }
}

impl ElGamalSecretKey {
    /// Parse and range-check a private key
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let normalized: String = s.split_whitespace().collect::<String>().to_lowercase();
        if normalized.len() != 64 {
            return Err(CryptoError::InvalidPrivateKey("expected 64 hex characters"));
        }
        let bytes: [u8; 32] = hex::decode(&normalized)
            .map_err(|_| CryptoError::InvalidPrivateKey("invalid hexidecimal"))?
            .try_into()
            .map_err(|_| CryptoError::InvalidPrivateKey("expected 32 bytes"))?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, CryptoError> {
        let scalar: Option<Scalar> = Scalar::from_canonical_bytes(bytes).into();
        match scalar {
            Some(scalar) if scalar != Scalar::ZERO => Ok(ElGamalSecretKey(scalar)),
            _ => Err(CryptoError::InvalidPrivateKey(
                "scalar must be > 0 and < group order",
            )),
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn public_key(&self) -> ElGamalPublicKey {
        ElGamalPublicKey(RistrettoPoint::mul_base(&self.0).compress())
    }
}

impl fmt::Debug for ElGamalSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("ElGamalSecretKey(..)")
    }
}

/// One key pair per election
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ElGamalKeyPair {
    pub public_key: ElGamalPublicKey,
    pub private_key: ElGamalSecretKey,
}

/// An encrypted vote
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub struct ElGamalCiphertext {
    #[serde(with = "PointHex")]
    pub c1: CompressedRistretto,

    #[serde(with = "PointHex")]
    pub c2: CompressedRistretto,
}

impl ElGamalCiphertext {
    pub fn from_hex(c1: &str, c2: &str) -> Result<Self, ValidationError> {
        Ok(ElGamalCiphertext {
            c1: CompressedRistretto(decode_fixed("c1", c1)?),
            c2: CompressedRistretto(decode_fixed("c2", c2)?),
        })
    }
}

/// Lifecycle of an election key
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Revoked,
}

/// Public facts about an election key, safe to publish alongside the public key
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ElectionKeyMetadata {
    pub election_id: ElectionId,
    pub public_key: ElGamalPublicKey,
    pub private_key_hash: String,
    pub created_at: u64,
    pub status: KeyStatus,
}

/// Outcome of decrypting a batch of votes
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TallyResult {
    /// Vote counts keyed by encoded candidate id
    pub per_candidate_counts: BTreeMap<u64, u64>,
    pub success_count: u64,
    pub failure_count: u64,

    /// Positions in the input batch that could not be decrypted
    pub failed_indices: Vec<usize>,
    pub decrypted_at: u64,
}

impl TallyResult {
    /// True when every ciphertext in the batch was counted
    pub fn is_complete(&self) -> bool {
        self.failure_count == 0
    }
}

/// Generate an election key pair, private scalar uniform in [1, order)
pub fn generate_keys() -> ElGamalKeyPair {
    let mut rng = rand::rngs::OsRng;
    let scalar = loop {
        let candidate = Scalar::random(&mut rng);
        if candidate != Scalar::ZERO {
            break candidate;
        }
    };
    let private_key = ElGamalSecretKey(scalar);
    let public_key = private_key.public_key();

    tracing::info!("ElGamal keys generated (public key: {})", preview(public_key.0.as_bytes()));
    ElGamalKeyPair {
        public_key,
        private_key,
    }
}

/// Check that `private_key·G == public_key`
pub fn verify_key_pair(public_key: &ElGamalPublicKey, private_key: &ElGamalSecretKey) -> bool {
    private_key.public_key() == *public_key
}

/// SHA-256 fingerprint of a private key, hex
pub fn hash_private_key(private_key: &ElGamalSecretKey) -> String {
    hex::encode(Sha256::digest(private_key.to_bytes()))
}

/// Metadata for a freshly generated election key
pub fn key_metadata(election_id: ElectionId, keypair: &ElGamalKeyPair) -> ElectionKeyMetadata {
    ElectionKeyMetadata {
        election_id,
        public_key: keypair.public_key,
        private_key_hash: hash_private_key(&keypair.private_key),
        created_at: now_millis(),
        status: KeyStatus::Active,
    }
}

/// Encrypts, decrypts and tallies votes
///
/// Holds the discrete-log table for its decode bound; build once and share.
pub struct VoteCipher {
    config: CipherConfig,
    table: HashMap<[u8; 32], u64>,
}

impl VoteCipher {
    pub fn new(config: CipherConfig) -> Result<Self, ValidationError> {
        check_decode_bound(config.decode_bound)?;

        Ok(VoteCipher {
            config,
            table: decode_table(config.decode_bound),
        })
    }

    pub fn config(&self) -> CipherConfig {
        self.config
    }

    /// Highest candidate id that can be encrypted and decrypted
    pub fn max_candidate_id(&self) -> i64 {
        self.config.decode_bound as i64 - ENCODING_OFFSET
    }

    /// c1 = r·G, c2 = r·pk + m·G
    ///
    /// `randomness` is for deterministic testing; production callers pass `None`.
    pub fn encrypt(
        &self,
        candidate_id: i64,
        public_key: &ElGamalPublicKey,
        randomness: Option<&Scalar>,
    ) -> Result<ElGamalCiphertext, Error> {
        let m = encode_candidate(candidate_id, self.config.decode_bound)?;
        let pk = public_key.point()?;

        let r = match randomness {
            Some(r) if *r == Scalar::ZERO => return Err(ValidationError::ZeroRandomness.into()),
            Some(r) => *r,
            None => Scalar::random(&mut rand::rngs::OsRng),
        };

        let c1 = RistrettoPoint::mul_base(&r);
        let c2 = pk * r + RistrettoPoint::mul_base(&Scalar::from(m));

        tracing::debug!("vote encrypted (c1: {})", preview(c1.compress().as_bytes()));
        Ok(ElGamalCiphertext {
            c1: c1.compress(),
            c2: c2.compress(),
        })
    }

    /// Recover the candidate id: m·G = c2 - sk·c1, then search m in [1, decode_bound]
    pub fn decrypt(
        &self,
        ciphertext: &ElGamalCiphertext,
        private_key: &ElGamalSecretKey,
    ) -> Result<i64, CryptoError> {
        let c1 = ciphertext
            .c1
            .decompress()
            .ok_or(CryptoError::InvalidPoint("c1"))?;
        let c2 = ciphertext
            .c2
            .decompress()
            .ok_or(CryptoError::InvalidPoint("c2"))?;

        let m_g = c2 - c1 * private_key.0;
        match self.table.get(m_g.compress().as_bytes()) {
            Some(m) => Ok(decode_candidate(*m)),
            None => Err(CryptoError::DecodeExhausted(self.config.decode_bound)),
        }
    }

    /// `decrypt` over wire-format hex strings
    pub fn decrypt_hex(&self, c1: &str, c2: &str, private_key: &str) -> Result<i64, Error> {
        let private_key = ElGamalSecretKey::from_hex(private_key)?;
        let ciphertext = ElGamalCiphertext::from_hex(c1, c2)?;
        let candidate = self.decrypt(&ciphertext, &private_key).map_err(|e| {
            tracing::error!("failed to decrypt vote: {}", e);
            e
        })?;
        Ok(candidate)
    }

    /// Decrypt each vote independently; failures are counted, not fatal
    pub fn tally_votes(
        &self,
        ciphertexts: &[ElGamalCiphertext],
        private_key: &ElGamalSecretKey,
    ) -> TallyResult {
        tracing::info!("decrypting {} votes", ciphertexts.len());

        let mut result = TallyResult::default();
        for (i, ciphertext) in ciphertexts.iter().enumerate() {
            match self.decrypt(ciphertext, private_key) {
                Ok(candidate_id) => {
                    let encoded = (candidate_id + ENCODING_OFFSET) as u64;
                    *result.per_candidate_counts.entry(encoded).or_insert(0) += 1;
                    result.success_count += 1;
                }
                Err(e) => {
                    tracing::warn!("failed to decrypt vote #{}: {}", i, e);
                    result.failure_count += 1;
                    result.failed_indices.push(i);
                }
            }

            if (i + 1) % 100 == 0 {
                tracing::info!("progress: {}/{} votes decrypted", i + 1, ciphertexts.len());
            }
        }
        result.decrypted_at = now_millis();

        tracing::info!(
            "vote tallying completed (total: {}, decrypted: {}, failed: {})",
            ciphertexts.len(),
            result.success_count,
            result.failure_count
        );
        result
    }

    /// `tally_votes` with a wire-format key; a malformed key fails the whole batch
    pub fn tally_votes_hex(
        &self,
        ciphertexts: &[ElGamalCiphertext],
        private_key: &str,
    ) -> Result<TallyResult, CryptoError> {
        let private_key = ElGamalSecretKey::from_hex(private_key)?;
        Ok(self.tally_votes(ciphertexts, &private_key))
    }

    /// Encrypt/decrypt/tally round trip with fresh keys
    pub fn self_test(&self) -> Result<(), Error> {
        let keys = generate_keys();
        let max = self.max_candidate_id();
        let cases: Vec<i64> = [MIN_CANDIDATE_ID, 0, 1, 2, 5, 10, 42, 99, max]
            .iter()
            .copied()
            .filter(|id| *id <= max)
            .collect();

        let mut ciphertexts = Vec::with_capacity(cases.len());
        for candidate_id in cases.iter() {
            let ciphertext = self.encrypt(*candidate_id, &keys.public_key, None)?;
            let decrypted = self.decrypt(&ciphertext, &keys.private_key)?;
            if decrypted != *candidate_id {
                tracing::error!("self test failed for candidate {}: got {}", candidate_id, decrypted);
                return Err(CryptoError::DecodeExhausted(self.config.decode_bound).into());
            }
            ciphertexts.push(ciphertext);
        }

        let tally = self.tally_votes(&ciphertexts, &keys.private_key);
        if !tally.is_complete() || tally.success_count != cases.len() as u64 {
            return Err(CryptoError::DecodeExhausted(self.config.decode_bound).into());
        }
        tracing::info!("ElGamal self test passed");
        Ok(())
    }
}

impl Default for VoteCipher {
    fn default() -> Self {
        let config = CipherConfig::default();
        VoteCipher {
            config,
            table: decode_table(config.decode_bound),
        }
    }
}

// compressed m·G -> m for m in [1, bound]
fn decode_table(bound: u64) -> HashMap<[u8; 32], u64> {
    let mut table = HashMap::with_capacity(bound as usize);
    let mut point = RistrettoPoint::identity();
    for m in 1..=bound {
        point += RISTRETTO_BASEPOINT_POINT;
        table.insert(point.compress().to_bytes(), m);
    }
    table
}
