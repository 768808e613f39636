//! Anonymous voting tokens via RSA full-domain-hash blind signatures.
//!
//! The holder blinds `FDH(token)` with `r^e`, the issuer signs the blinded value without seeing
//! the token, and the holder strips `r` to obtain an ordinary RSA-FDH signature on the token.
//! Because `r` is uniform and invertible mod n, the issuer's view is independent of the
//! final `(token, signature)` pair.

use crate::*;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use num_bigint::{BigUint, RandBigInt};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use std::fmt;

/// Modulus size used when none is configured
pub const DEFAULT_MODULUS_BITS: usize = 2048;

/// Smallest modulus accepted by `BlindIssuer::new`
pub const MIN_MODULUS_BITS: usize = 512;
const FDH_TAG: &[u8] = b"sealedballot_voting_token_fdh";

/// Length of a voting token in bytes
pub const TOKEN_LENGTH: usize = 32;

/// A voting token through its issuance lifecycle
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VotingToken {
    /// Random token, hex. Never shown to the issuer.
    pub token: String,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub blinded_token: Option<String>,

    /// Issuer signature over the blinded token, base64
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signature: Option<String>,

    /// Signature over the token itself, base64
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub unblinded_signature: Option<String>,
}

/// Generate a fresh random voting token
pub fn issue_token() -> VotingToken {
    let token = hex::encode(random_bytes::<TOKEN_LENGTH>());
    tracing::debug!("generated voting token");
    VotingToken {
        token,
        blinded_token: None,
        signature: None,
        unblinded_signature: None,
    }
}

/// The holder's secret blinding factor `r`, invertible mod n
#[derive(Clone, PartialEq, Eq)]
pub struct BlindingFactor(BigUint);

impl BlindingFactor {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes_be())
    }

    pub fn from_hex(s: &str) -> Result<Self, ValidationError> {
        let bytes = hex::decode(s.trim()).map_err(|_| ValidationError::BadHex("blinding factor"))?;
        Ok(BlindingFactor(BigUint::from_bytes_be(&bytes)))
    }
}

impl fmt::Debug for BlindingFactor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("BlindingFactor(..)")
    }
}

/// Output of blinding: what goes to the issuer, and what the holder keeps
#[derive(Debug, Clone)]
pub struct Blinded {
    pub blinded_token: String,
    pub factor: BlindingFactor,
}

/// The issuer's public key `(n, e)`
///
/// Everything a holder or a verifier needs: blinding, unblinding and verification happen here.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(try_from = "RawBlindPublicKey")]
pub struct BlindPublicKey {
    #[serde(with = "BigUintHex")]
    n: BigUint,

    #[serde(with = "BigUintHex")]
    e: BigUint,
}

#[derive(Deserialize)]
struct RawBlindPublicKey {
    #[serde(with = "BigUintHex")]
    n: BigUint,

    #[serde(with = "BigUintHex")]
    e: BigUint,
}

impl TryFrom<RawBlindPublicKey> for BlindPublicKey {
    type Error = ValidationError;

    fn try_from(raw: RawBlindPublicKey) -> Result<Self, Self::Error> {
        BlindPublicKey::new(raw.n, raw.e)
    }
}

impl BlindPublicKey {
    /// Check an `(n, e)` pair before any arithmetic is done with it
    pub fn new(n: BigUint, e: BigUint) -> Result<Self, ValidationError> {
        if (n.bits() as usize) < MIN_MODULUS_BITS {
            return Err(ValidationError::InvalidBlindPublicKey("modulus is too small"));
        }
        if !n.bit(0) {
            return Err(ValidationError::InvalidBlindPublicKey("modulus is even"));
        }
        if e < BigUint::from(3u32) || !e.bit(0) || e >= n {
            return Err(ValidationError::InvalidBlindPublicKey(
                "public exponent must be odd and in [3, n)",
            ));
        }
        Ok(BlindPublicKey { n, e })
    }

    pub fn n(&self) -> &BigUint {
        &self.n
    }

    pub fn e(&self) -> &BigUint {
        &self.e
    }

    /// Size of the modulus in bytes
    fn k(&self) -> usize {
        ((self.n.bits() + 7) / 8) as usize
    }

    /// Full-domain hash of a token onto [0, n)
    pub fn fdh(&self, token: &[u8]) -> BigUint {
        // 128 extra bits so the reduction is statistically close to uniform
        let target = self.k() + 16;
        let mut expanded = Vec::with_capacity(target + 32);
        let mut counter: u32 = 0;
        while expanded.len() < target {
            let mut hasher = Sha256::new();
            hasher.update(FDH_TAG);
            hasher.update(counter.to_be_bytes());
            hasher.update(token);
            expanded.extend_from_slice(&hasher.finalize());
            counter += 1;
        }
        expanded.truncate(target);
        BigUint::from_bytes_be(&expanded) % &self.n
    }

    /// Draw a blinding factor uniformly from [2, n) that is invertible mod n
    pub fn random_blinding_factor(&self) -> BlindingFactor {
        let mut rng = rand::rngs::OsRng;
        let two = BigUint::from(2u32);
        loop {
            let r = rng.gen_biguint_range(&two, &self.n);
            if r.modinv(&self.n).is_some() {
                return BlindingFactor(r);
            }
        }
    }

    /// blinded = FDH(token) * r^e mod n
    pub fn blind(&self, token: &str, factor: Option<BlindingFactor>) -> Result<Blinded, ValidationError> {
        let token = decode_token(token)?;
        let factor = match factor {
            Some(factor) => {
                self.check_factor(&factor)?;
                factor
            }
            None => self.random_blinding_factor(),
        };

        let blinded = (self.fdh(&token) * factor.0.modpow(&self.e, &self.n)) % &self.n;
        tracing::debug!("voting token blinded");

        Ok(Blinded {
            blinded_token: hex::encode(self.to_fixed_bytes(&blinded)),
            factor,
        })
    }

    /// unblinded = s' * r^-1 mod n
    pub fn unblind(&self, signature: &str, factor: &BlindingFactor) -> Result<String, ValidationError> {
        let blind_signature = self.decode_signature(signature)?;
        let r_inv = self.check_factor(factor)?;
        let unblinded = (blind_signature * r_inv) % &self.n;
        Ok(BASE64.encode(self.to_fixed_bytes(&unblinded)))
    }

    /// s^e mod n == FDH(token)
    pub fn verify(&self, token: &str, signature: &str) -> bool {
        let token = match decode_token(token) {
            Ok(token) => token,
            Err(_) => return false,
        };
        let signature = match self.decode_signature(signature) {
            Ok(signature) => signature,
            Err(_) => return false,
        };

        let valid = signature.modpow(&self.e, &self.n) == self.fdh(&token);
        tracing::debug!(
            "voting token signature verification: {}",
            if valid { "valid" } else { "invalid" }
        );
        valid
    }

    fn check_factor(&self, factor: &BlindingFactor) -> Result<BigUint, ValidationError> {
        if factor.0 >= self.n || factor.0 < BigUint::from(2u32) {
            return Err(ValidationError::NotReducedModN);
        }
        factor
            .0
            .modinv(&self.n)
            .ok_or(ValidationError::BlindingFactorNotInvertible)
    }

    fn decode_signature(&self, signature: &str) -> Result<BigUint, ValidationError> {
        let bytes = BASE64
            .decode(signature.trim())
            .map_err(|_| ValidationError::BadBase64("signature"))?;
        self.reduced(BigUint::from_bytes_be(&bytes))
    }

    fn reduced(&self, value: BigUint) -> Result<BigUint, ValidationError> {
        if value >= self.n {
            return Err(ValidationError::NotReducedModN);
        }
        Ok(value)
    }

    fn to_fixed_bytes(&self, value: &BigUint) -> Vec<u8> {
        let bytes = value.to_bytes_be();
        let mut out = vec![0u8; self.k().saturating_sub(bytes.len())];
        out.extend_from_slice(&bytes);
        out
    }
}

fn decode_token(token: &str) -> Result<Vec<u8>, ValidationError> {
    let bytes = hex::decode(token.trim()).map_err(|_| ValidationError::BadHex("voting token"))?;
    if bytes.is_empty() {
        return Err(ValidationError::BadLength {
            what: "voting token",
            expected: TOKEN_LENGTH,
            got: 0,
        });
    }
    Ok(bytes)
}

/// Summary of the issuing key
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BlindIssuerStats {
    pub algorithm: String,
    pub modulus_bits: u64,
}

/// The issuing authority. It only ever sees blinded tokens.
pub struct BlindIssuer {
    public: BlindPublicKey,
    key: RsaPrivateKey,
}

impl BlindIssuer {
    /// Generate a new issuing key of the given modulus size
    pub fn new(bits: usize) -> Result<Self, Error> {
        if bits < MIN_MODULUS_BITS {
            return Err(ValidationError::ModulusTooSmall(bits).into());
        }
        let mut rng = rand::rngs::OsRng;
        let key = RsaPrivateKey::new(&mut rng, bits).map_err(CryptoError::from)?;
        tracing::info!("blind signature key generated (RSA-{})", bits);
        Self::from_private_key(key)
    }

    /// Use an existing RSA key
    pub fn from_private_key(key: RsaPrivateKey) -> Result<Self, Error> {
        let public = BlindPublicKey::new(
            BigUint::from_bytes_be(&key.n().to_bytes_be()),
            BigUint::from_bytes_be(&key.e().to_bytes_be()),
        )?;
        Ok(BlindIssuer { public, key })
    }

    pub fn public_key(&self) -> &BlindPublicKey {
        &self.public
    }

    /// signature = blinded^d mod n, base64
    ///
    /// The private exponentiation runs through the blinded, CRT-checked RSA primitive.
    pub fn sign(&self, blinded_token: &str) -> Result<String, Error> {
        let bytes = hex::decode(blinded_token.trim())
            .map_err(|_| ValidationError::BadHex("blinded token"))?;
        let blinded = self.public.reduced(BigUint::from_bytes_be(&bytes))?;

        let mut rng = rand::rngs::OsRng;
        let c = rsa::BigUint::from_bytes_be(&blinded.to_bytes_be());
        let signature = rsa::hazmat::rsa_decrypt_and_check(&self.key, Some(&mut rng), &c)
            .map_err(CryptoError::from)?;
        let signature = BigUint::from_bytes_be(&signature.to_bytes_be());

        tracing::info!("blinded voting token signed");
        Ok(BASE64.encode(self.public.to_fixed_bytes(&signature)))
    }

    pub fn verify(&self, token: &str, signature: &str) -> bool {
        self.public.verify(token, signature)
    }

    pub fn stats(&self) -> BlindIssuerStats {
        BlindIssuerStats {
            algorithm: "RSA-FDH".to_string(),
            modulus_bits: self.public.n.bits(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    // Key generation dominates the runtime, share one small key
    fn issuer() -> &'static BlindIssuer {
        static ISSUER: OnceLock<BlindIssuer> = OnceLock::new();
        ISSUER.get_or_init(|| BlindIssuer::new(512).unwrap())
    }

    #[test]
    fn blind_sign_unblind_verify() {
        let issuer = issuer();
        let public = issuer.public_key();

        for _ in 0..5 {
            let mut token = issue_token();
            let blinded = public.blind(&token.token, None).unwrap();
            token.blinded_token = Some(blinded.blinded_token.clone());

            let signature = issuer.sign(&blinded.blinded_token).unwrap();
            token.signature = Some(signature.clone());

            let unblinded = public.unblind(&signature, &blinded.factor).unwrap();
            assert!(public.verify(&token.token, &unblinded));
            assert!(issuer.verify(&token.token, &unblinded));
            token.unblinded_signature = Some(unblinded);

            // The issuer never saw the token or the final signature
            assert_ne!(blinded.blinded_token, token.token);
            assert_ne!(Some(signature), token.unblinded_signature);
        }
    }

    #[test]
    fn signature_does_not_transfer_between_tokens() {
        let issuer = issuer();
        let public = issuer.public_key();

        let token = issue_token();
        let other = issue_token();
        let blinded = public.blind(&token.token, None).unwrap();
        let signature = issuer.sign(&blinded.blinded_token).unwrap();
        let unblinded = public.unblind(&signature, &blinded.factor).unwrap();

        assert!(!public.verify(&other.token, &unblinded));
        // Without unblinding the signature is not valid for the token
        assert!(!public.verify(&token.token, &signature));
    }

    #[test]
    fn explicit_factor_is_reproducible() {
        let public = issuer().public_key();
        let token = issue_token();
        let factor = public.random_blinding_factor();
        let restored = BlindingFactor::from_hex(&factor.to_hex()).unwrap();

        let a = public.blind(&token.token, Some(factor)).unwrap();
        let b = public.blind(&token.token, Some(restored)).unwrap();
        assert_eq!(a.blinded_token, b.blinded_token);

        // Fresh factors give unrelated blinded values
        let c = public.blind(&token.token, None).unwrap();
        assert_ne!(a.blinded_token, c.blinded_token);
    }

    #[test]
    fn rejects_bad_factors_and_inputs() {
        let issuer = issuer();
        let public = issuer.public_key();
        let token = issue_token();

        let too_big = BlindingFactor(public.n.clone());
        assert!(matches!(
            public.blind(&token.token, Some(too_big)),
            Err(ValidationError::NotReducedModN)
        ));
        assert!(public.blind("not hex", None).is_err());
        assert!(issuer.sign(&hex::encode(public.n.to_bytes_be())).is_err());
        assert!(!public.verify(&token.token, "%%%"));
        assert!(matches!(
            BlindIssuer::new(256),
            Err(Error::Validation(ValidationError::ModulusTooSmall(256)))
        ));
    }

    #[test]
    fn signing_is_deterministic() {
        let issuer = issuer();
        let token = issue_token();
        let blinded = issuer.public_key().blind(&token.token, None).unwrap();

        // Exponent blinding is internal, the signature itself is unique
        let a = issuer.sign(&blinded.blinded_token).unwrap();
        let b = issuer.sign(&blinded.blinded_token).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_degenerate_public_keys() {
        let token = issue_token();
        for json in [
            r#"{"n":"02","e":"03"}"#,
            r#"{"n":"","e":"03"}"#,
            r#"{"n":"00","e":"00"}"#,
        ] {
            assert!(serde_json::from_str::<BlindPublicKey>(json).is_err());
        }

        let n = issuer().public_key().n().clone();
        assert!(matches!(
            BlindPublicKey::new(&n + 1u32, BigUint::from(65537u32)),
            Err(ValidationError::InvalidBlindPublicKey(_))
        ));
        assert!(BlindPublicKey::new(n.clone(), BigUint::from(1u32)).is_err());
        assert!(BlindPublicKey::new(n.clone(), BigUint::from(4u32)).is_err());
        assert!(BlindPublicKey::new(n.clone(), n.clone()).is_err());

        let public = BlindPublicKey::new(n, BigUint::from(65537u32)).unwrap();
        assert!(public.blind(&token.token, None).is_ok());
    }

    #[test]
    fn public_key_json() {
        let issuer = issuer();
        let json = serde_json::to_string(issuer.public_key()).unwrap();
        let back: BlindPublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(&back, issuer.public_key());
        assert_eq!(issuer.stats().modulus_bits, 512);
        assert_eq!(issuer.stats().algorithm, "RSA-FDH");
    }
}
