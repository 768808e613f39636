use curve25519_dalek::ristretto::CompressedRistretto;
use curve25519_dalek::scalar::Scalar;
use num_bigint::BigUint;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serializer};
use std::borrow::Cow;

pub use hex_buffer_serde::Hex;

// a single-purpose type for use in `#[serde(with)]`
pub enum PointHex {}

impl Hex<CompressedRistretto> for PointHex {
    type Error = String;

    fn create_bytes(point: &CompressedRistretto) -> Cow<[u8]> {
        Cow::from(&point.as_bytes()[..])
    }

    fn from_bytes(bytes: &[u8]) -> Result<CompressedRistretto, String> {
        CompressedRistretto::from_slice(bytes).map_err(|_| {
            format!("expected a 32 byte compressed point, got {} bytes", bytes.len())
        })
    }
}

// a single-purpose type for use in `#[serde(with)]`
pub enum ScalarHex {}

impl Hex<Scalar> for ScalarHex {
    type Error = String;

    fn create_bytes(scalar: &Scalar) -> Cow<[u8]> {
        Cow::from(scalar.to_bytes().to_vec())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Scalar, String> {
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| format!("expected a 32 byte scalar, got {} bytes", bytes.len()))?;
        Option::from(Scalar::from_canonical_bytes(bytes))
            .ok_or_else(|| "scalar is not reduced modulo the group order".to_string())
    }
}

// a single-purpose type for use in `#[serde(with)]`
pub enum Bytes32Hex {}

impl Hex<[u8; 32]> for Bytes32Hex {
    type Error = String;

    fn create_bytes(bytes: &[u8; 32]) -> Cow<[u8]> {
        Cow::from(&bytes[..])
    }

    fn from_bytes(bytes: &[u8]) -> Result<[u8; 32], String> {
        bytes
            .try_into()
            .map_err(|_| format!("expected 32 bytes, got {}", bytes.len()))
    }
}

// a single-purpose type for use in `#[serde(with)]`
pub enum BigUintHex {}

impl Hex<BigUint> for BigUintHex {
    type Error = String;

    fn create_bytes(value: &BigUint) -> Cow<[u8]> {
        Cow::from(value.to_bytes_be())
    }

    fn from_bytes(bytes: &[u8]) -> Result<BigUint, String> {
        Ok(BigUint::from_bytes_be(bytes))
    }
}

/// `#[serde(with = "bytes32_vec_hex")]` for lists of 32 byte values
pub mod bytes32_vec_hex {
    use super::*;
    use serde::ser::SerializeSeq;

    pub fn serialize<S: Serializer>(values: &[[u8; 32]], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(values.len()))?;
        for value in values {
            seq.serialize_element(&hex::encode(value))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<[u8; 32]>, D::Error> {
        let strings = Vec::<String>::deserialize(deserializer)?;
        strings
            .iter()
            .map(|s| {
                let bytes = hex::decode(s.trim()).map_err(D::Error::custom)?;
                Bytes32Hex::from_bytes(&bytes).map_err(D::Error::custom)
            })
            .collect()
    }
}

/// Decode a hex field into exactly `N` bytes
pub(crate) fn decode_fixed<const N: usize>(
    what: &'static str,
    s: &str,
) -> Result<[u8; N], crate::ValidationError> {
    let normalized: String = s.split_whitespace().collect();
    let bytes = hex::decode(normalized).map_err(|_| crate::ValidationError::BadHex(what))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| crate::ValidationError::BadLength {
            what,
            expected: N,
            got: len,
        })
}
