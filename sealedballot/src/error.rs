use crate::*;

use thiserror::Error;

/// Error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Crypto(#[from] CryptoError),

    #[error("{0}")]
    Authorization(#[from] AuthorizationError),

    #[error("{0}")]
    Storage(#[from] StorageError),
}

impl Error {
    /// True for failed permission checks (maps to a 403-class response)
    pub fn is_authorization(&self) -> bool {
        matches!(self, Error::Authorization(_))
    }
}

/// Malformed input: shape, length, range or state preconditions the caller can correct
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("sealedballot validation: invalid hexidecimal for {0}")]
    BadHex(&'static str),

    #[error("sealedballot validation: wrong length for {what}: expected {expected} bytes, got {got}")]
    BadLength {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("sealedballot validation: invalid base64 for {0}")]
    BadBase64(&'static str),

    #[error("sealedballot validation: candidate id {id} out of range [{min}, {max}]")]
    CandidateOutOfRange { id: i64, min: i64, max: i64 },

    #[error("sealedballot validation: decode bound must be between 2 and {max}, got {got}")]
    InvalidDecodeBound { got: u64, max: u64 },

    #[error("sealedballot validation: encryption randomness must be non-zero")]
    ZeroRandomness,

    #[error("sealedballot validation: membership tree depth must be between 1 and {max}, got {got}")]
    InvalidTreeDepth { got: usize, max: usize },

    #[error("sealedballot validation: membership tree is full ({0} leaves)")]
    TreeFull(u64),

    #[error("sealedballot validation: the zero commitment cannot be a member")]
    ZeroCommitment,

    #[error("sealedballot validation: commitment is already a member")]
    DuplicateCommitment,

    #[error("sealedballot validation: commitment is not a member")]
    UnknownCommitment,

    #[error("sealedballot validation: membership proof has {siblings} siblings and {indices} path indices")]
    MalformedMembershipProof { siblings: usize, indices: usize },

    #[error("sealedballot validation: blinding factor is not invertible modulo the issuer modulus")]
    BlindingFactorNotInvertible,

    #[error("sealedballot validation: value is not reduced modulo the issuer modulus")]
    NotReducedModN,

    #[error("sealedballot validation: invalid blind signature public key: {0}")]
    InvalidBlindPublicKey(&'static str),

    #[error("sealedballot validation: RSA modulus size {0} is too small")]
    ModulusTooSmall(usize),

    #[error("sealedballot validation: wrong number of public signals for {circuit}: expected {expected}, got {got}")]
    PublicSignalArity {
        circuit: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("sealedballot validation: public signal {0:?} is not a canonical field element")]
    BadPublicSignal(String),

    #[error("sealedballot validation: malformed proof: {0}")]
    MalformedProof(String),

    #[error("sealedballot validation: malformed verification key: {0}")]
    MalformedVerificationKey(String),

    #[error("sealedballot validation: proof verifier not initialized")]
    VerifierNotInitialized,

    #[error("sealedballot validation: master password must not be empty")]
    EmptyMasterPassword,

    #[error("sealedballot validation: unsupported key encryption algorithm {0:?}")]
    UnsupportedAlgorithm(String),

    #[error("sealedballot validation: election {0} is not initialized for organizers")]
    ElectionNotInitialized(ElectionId),

    #[error("sealedballot validation: {0} is already a co-organizer")]
    AlreadyCoOrganizer(String),

    #[error("sealedballot validation: primary organizer cannot be added as co-organizer")]
    PrimaryAsCoOrganizer,

    #[error("sealedballot validation: {0} is not a co-organizer")]
    NotCoOrganizer(String),

    #[error("sealedballot validation: election {0} already has an encryption key")]
    KeyAlreadyExists(ElectionId),

    #[error("sealedballot validation: no decryption key available for election {0}")]
    KeyUnavailable(ElectionId),
}

/// Cryptographic failures. These are never downgraded to a default value.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("sealedballot crypto: invalid private key: {0}")]
    InvalidPrivateKey(&'static str),

    #[error("sealedballot crypto: invalid curve point for {0}")]
    InvalidPoint(&'static str),

    #[error("sealedballot crypto: failed to decrypt vote: no candidate found up to encoded id {0}")]
    DecodeExhausted(u64),

    #[error("sealedballot crypto: failed to decrypt private key (invalid password or corrupted data)")]
    KeyAuthenticationFailed,

    #[error("sealedballot crypto: key encryption failed")]
    KeyEncryptionFailed,

    #[error("sealedballot crypto: key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("sealedballot crypto: RSA error: {0}")]
    RSAError(#[from] rsa::errors::Error),

    #[error("sealedballot crypto: proof verification errored: {0}")]
    ProofVerification(String),

    #[error("sealedballot crypto: decrypted key does not match the election public key")]
    KeyPairMismatch,
}

/// A permission check failed
#[derive(Debug, Error)]
#[error("sealedballot authorization: {address} lacks {permission} for election {election_id}")]
pub struct AuthorizationError {
    pub election_id: ElectionId,
    pub address: String,
    pub permission: Permission,
}

/// Local storage failures, fatal for the call that triggered them
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sealedballot storage: I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sealedballot storage: JSON error on {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("sealedballot storage: lock poisoned")]
    Poisoned,
}

impl StorageError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub(crate) fn json(path: &std::path::Path, source: serde_json::Error) -> Self {
        StorageError::Json {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Remote replica failures. Only ever logged, they degrade recoverability.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("sealedballot backup: remote unavailable: {0}")]
    Unavailable(String),

    #[error("sealedballot backup: object {0} not found")]
    NotFound(String),

    #[error("sealedballot backup: timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("sealedballot backup: corrupt object {0}")]
    Corrupt(String),
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::Storage(StorageError::Poisoned)
    }
}
