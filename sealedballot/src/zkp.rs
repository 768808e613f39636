//! Groth16 proof verification for vote validity and voter eligibility.
//!
//! Verification keys and proofs use the snarkjs JSON encoding: field elements as decimal
//! strings and points in projective form with `z` equal to `"1"` (or `"0"` for the identity).

use crate::*;
use ark_bn254::{Bn254, Fq, Fq2, Fr, G1Affine, G2Affine};
use ark_ff::PrimeField;
use ark_groth16::{Groth16, PreparedVerifyingKey, Proof, VerifyingKey};
use num_bigint::BigUint;
use std::path::Path;
use std::sync::OnceLock;

/// Public inputs of both circuits
pub const PUBLIC_SIGNAL_COUNT: usize = 3;

const VOTE_CIRCUIT: &str = "vote";
const ELIGIBILITY_CIRCUIT: &str = "eligibility";

/// A verification key as exported by `snarkjs zkey export verificationkey`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SnarkjsVerificationKey {
    pub protocol: String,
    pub curve: String,

    #[serde(rename = "nPublic")]
    pub n_public: usize,

    pub vk_alpha_1: Vec<String>,
    pub vk_beta_2: Vec<Vec<String>>,
    pub vk_gamma_2: Vec<Vec<String>>,
    pub vk_delta_2: Vec<Vec<String>>,

    #[serde(rename = "IC")]
    pub ic: Vec<Vec<String>>,
}

/// A proof as produced by `snarkjs groth16 prove`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SnarkjsProof {
    pub pi_a: Vec<String>,
    pub pi_b: Vec<Vec<String>>,
    pub pi_c: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curve: Option<String>,
}

/// Public inputs of the vote validity circuit
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VotePublicSignals {
    pub election_id: String,
    pub num_candidates: String,
    pub vote_commitment: String,
}

/// Public inputs of the eligibility circuit
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityPublicSignals {
    pub merkle_root: String,
    pub nullifier: String,
    pub election_id: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CombinedVerification {
    pub valid: bool,
    pub eligibility_valid: bool,
    pub vote_valid: bool,
    pub election_id_match: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VerificationKeyInfo {
    pub protocol: String,
    pub curve: String,
    pub n_public: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VerificationKeysInfo {
    pub vote: VerificationKeyInfo,
    pub eligibility: VerificationKeyInfo,
}

struct LoadedKey {
    pvk: PreparedVerifyingKey<Bn254>,
    info: VerificationKeyInfo,
}

struct LoadedKeys {
    vote: LoadedKey,
    eligibility: LoadedKey,
}

/// Verifies vote and eligibility proofs against keys loaded once
///
/// Verification takes `&self` and needs no locking once initialized.
#[derive(Default)]
pub struct ProofVerifier {
    keys: OnceLock<LoadedKeys>,
}

impl ProofVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load both verification keys. Later calls are no-ops.
    pub fn initialize(
        &self,
        vote_key: &SnarkjsVerificationKey,
        eligibility_key: &SnarkjsVerificationKey,
    ) -> Result<(), Error> {
        if self.is_initialized() {
            tracing::info!("proof verifier already initialized");
            return Ok(());
        }

        let keys = LoadedKeys {
            vote: load_key(vote_key)?,
            eligibility: load_key(eligibility_key)?,
        };
        if self.keys.set(keys).is_ok() {
            tracing::info!("proof verifier initialized");
        }
        Ok(())
    }

    /// `initialize` from two snarkjs JSON files
    pub fn initialize_from_files(&self, vote_path: &Path, eligibility_path: &Path) -> Result<(), Error> {
        let vote_key = read_json::<SnarkjsVerificationKey>(vote_path)?.ok_or_else(|| {
            StorageError::io(vote_path, std::io::ErrorKind::NotFound.into())
        })?;
        let eligibility_key = read_json::<SnarkjsVerificationKey>(eligibility_path)?.ok_or_else(|| {
            StorageError::io(eligibility_path, std::io::ErrorKind::NotFound.into())
        })?;
        self.initialize(&vote_key, &eligibility_key)
    }

    pub fn is_initialized(&self) -> bool {
        self.keys.get().is_some()
    }

    pub fn verification_keys_info(&self) -> Option<VerificationKeysInfo> {
        self.keys.get().map(|keys| VerificationKeysInfo {
            vote: keys.vote.info.clone(),
            eligibility: keys.eligibility.info.clone(),
        })
    }

    fn loaded(&self) -> Result<&LoadedKeys, ValidationError> {
        self.keys.get().ok_or(ValidationError::VerifierNotInitialized)
    }

    /// Public signals: `[electionId, numCandidates, voteCommitment]`
    pub fn verify_vote_proof(&self, proof: &SnarkjsProof, public_signals: &[String]) -> Result<bool, Error> {
        let keys = self.loaded()?;
        let inputs = parse_signals(VOTE_CIRCUIT, public_signals)?;
        let valid = verify(&keys.vote, proof, &inputs)?;
        tracing::info!("vote proof verification: {}", valid);
        Ok(valid)
    }

    /// Public signals: `[merkleRoot, nullifier, electionId]`
    pub fn verify_eligibility_proof(
        &self,
        proof: &SnarkjsProof,
        public_signals: &[String],
    ) -> Result<bool, Error> {
        let keys = self.loaded()?;
        let inputs = parse_signals(ELIGIBILITY_CIRCUIT, public_signals)?;
        let valid = verify(&keys.eligibility, proof, &inputs)?;
        tracing::info!("eligibility proof verification: {}", valid);
        Ok(valid)
    }

    /// Both proofs must verify and name the same election
    pub fn verify_combined(
        &self,
        eligibility_proof: &SnarkjsProof,
        eligibility_signals: &[String],
        vote_proof: &SnarkjsProof,
        vote_signals: &[String],
    ) -> Result<CombinedVerification, Error> {
        let eligibility = parse_eligibility_public_signals(eligibility_signals)?;
        let vote = parse_vote_public_signals(vote_signals)?;

        let eligibility_valid = self.verify_eligibility_proof(eligibility_proof, eligibility_signals)?;
        let vote_valid = self.verify_vote_proof(vote_proof, vote_signals)?;
        let election_id_match = eligibility.election_id == vote.election_id;
        if !election_id_match {
            tracing::warn!(
                "election id mismatch between proofs ({} vs {})",
                eligibility.election_id,
                vote.election_id
            );
        }

        Ok(CombinedVerification {
            valid: eligibility_valid && vote_valid && election_id_match,
            eligibility_valid,
            vote_valid,
            election_id_match,
        })
    }
}

/// Name the vote circuit's public signals, canonicalized to decimal
pub fn parse_vote_public_signals(signals: &[String]) -> Result<VotePublicSignals, ValidationError> {
    let values = canonical_signals(VOTE_CIRCUIT, signals)?;
    let [election_id, num_candidates, vote_commitment] = values;
    Ok(VotePublicSignals {
        election_id,
        num_candidates,
        vote_commitment,
    })
}

/// Name the eligibility circuit's public signals, canonicalized to decimal
pub fn parse_eligibility_public_signals(
    signals: &[String],
) -> Result<EligibilityPublicSignals, ValidationError> {
    let values = canonical_signals(ELIGIBILITY_CIRCUIT, signals)?;
    let [merkle_root, nullifier, election_id] = values;
    Ok(EligibilityPublicSignals {
        merkle_root,
        nullifier,
        election_id,
    })
}

fn check_arity(circuit: &'static str, signals: &[String]) -> Result<(), ValidationError> {
    if signals.len() != PUBLIC_SIGNAL_COUNT {
        return Err(ValidationError::PublicSignalArity {
            circuit,
            expected: PUBLIC_SIGNAL_COUNT,
            got: signals.len(),
        });
    }
    Ok(())
}

fn canonical_signals(
    circuit: &'static str,
    signals: &[String],
) -> Result<[String; PUBLIC_SIGNAL_COUNT], ValidationError> {
    check_arity(circuit, signals)?;
    let modulus = BigUint::from(Fr::MODULUS);
    let mut out: [String; PUBLIC_SIGNAL_COUNT] = Default::default();
    for (slot, signal) in out.iter_mut().zip(signals) {
        *slot = parse_decimal(signal, &modulus)
            .ok_or_else(|| ValidationError::BadPublicSignal(signal.clone()))?
            .to_string();
    }
    Ok(out)
}

fn parse_signals(circuit: &'static str, signals: &[String]) -> Result<Vec<Fr>, ValidationError> {
    check_arity(circuit, signals)?;
    let modulus = BigUint::from(Fr::MODULUS);
    signals
        .iter()
        .map(|signal| {
            parse_decimal(signal, &modulus)
                .map(Fr::from)
                .ok_or_else(|| ValidationError::BadPublicSignal(signal.clone()))
        })
        .collect()
}

// A decimal string strictly below `modulus`
fn parse_decimal(s: &str, modulus: &BigUint) -> Option<BigUint> {
    let s = s.trim();
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value = s.parse::<BigUint>().ok()?;
    if &value >= modulus {
        return None;
    }
    Some(value)
}

fn fq(s: &str) -> Result<Fq, String> {
    let modulus = BigUint::from(Fq::MODULUS);
    parse_decimal(s, &modulus)
        .map(Fq::from)
        .ok_or_else(|| format!("{:?} is not a base field element", s))
}

fn g1(coords: &[String]) -> Result<G1Affine, String> {
    if coords.len() != 3 {
        return Err(format!("G1 point needs 3 coordinates, got {}", coords.len()));
    }
    match coords[2].trim() {
        "0" => return Ok(G1Affine::identity()),
        "1" => {}
        z => return Err(format!("G1 point is not affine (z = {})", z)),
    }
    let point = G1Affine::new_unchecked(fq(&coords[0])?, fq(&coords[1])?);
    if !point.is_on_curve() || !point.is_in_correct_subgroup_assuming_on_curve() {
        return Err("G1 point is not on the curve".to_string());
    }
    Ok(point)
}

fn fq2(pair: &[String]) -> Result<Fq2, String> {
    if pair.len() != 2 {
        return Err(format!("Fq2 element needs 2 components, got {}", pair.len()));
    }
    Ok(Fq2::new(fq(&pair[0])?, fq(&pair[1])?))
}

fn g2(coords: &[Vec<String>]) -> Result<G2Affine, String> {
    if coords.len() != 3 {
        return Err(format!("G2 point needs 3 coordinates, got {}", coords.len()));
    }
    let z = coords[2].iter().map(|c| c.trim()).collect::<Vec<_>>();
    match z.as_slice() {
        ["0", "0"] => return Ok(G2Affine::identity()),
        ["1", "0"] => {}
        _ => return Err(format!("G2 point is not affine (z = {:?})", z)),
    }
    let point = G2Affine::new_unchecked(fq2(&coords[0])?, fq2(&coords[1])?);
    if !point.is_on_curve() || !point.is_in_correct_subgroup_assuming_on_curve() {
        return Err("G2 point is not on the curve".to_string());
    }
    Ok(point)
}

fn check_protocol(protocol: &str, curve: &str) -> Result<(), String> {
    if protocol != "groth16" {
        return Err(format!("unsupported protocol {:?}", protocol));
    }
    if curve != "bn128" && curve != "bn254" {
        return Err(format!("unsupported curve {:?}", curve));
    }
    Ok(())
}

fn load_key(key: &SnarkjsVerificationKey) -> Result<LoadedKey, ValidationError> {
    let malformed = ValidationError::MalformedVerificationKey;
    check_protocol(&key.protocol, &key.curve).map_err(malformed)?;
    if key.n_public != PUBLIC_SIGNAL_COUNT || key.ic.len() != PUBLIC_SIGNAL_COUNT + 1 {
        return Err(malformed(format!(
            "expected {} public inputs, key has nPublic {} and {} IC points",
            PUBLIC_SIGNAL_COUNT,
            key.n_public,
            key.ic.len()
        )));
    }

    let vk = VerifyingKey::<Bn254> {
        alpha_g1: g1(&key.vk_alpha_1).map_err(malformed)?,
        beta_g2: g2(&key.vk_beta_2).map_err(malformed)?,
        gamma_g2: g2(&key.vk_gamma_2).map_err(malformed)?,
        delta_g2: g2(&key.vk_delta_2).map_err(malformed)?,
        gamma_abc_g1: key
            .ic
            .iter()
            .map(|p| g1(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(malformed)?,
    };

    Ok(LoadedKey {
        pvk: PreparedVerifyingKey::from(vk),
        info: VerificationKeyInfo {
            protocol: key.protocol.clone(),
            curve: key.curve.clone(),
            n_public: key.n_public,
        },
    })
}

fn parse_proof(proof: &SnarkjsProof) -> Result<Proof<Bn254>, ValidationError> {
    let malformed = ValidationError::MalformedProof;
    if let (Some(protocol), Some(curve)) = (&proof.protocol, &proof.curve) {
        check_protocol(protocol, curve).map_err(malformed)?;
    }
    Ok(Proof {
        a: g1(&proof.pi_a).map_err(malformed)?,
        b: g2(&proof.pi_b).map_err(malformed)?,
        c: g1(&proof.pi_c).map_err(malformed)?,
    })
}

fn verify(key: &LoadedKey, proof: &SnarkjsProof, inputs: &[Fr]) -> Result<bool, Error> {
    let proof = parse_proof(proof)?;
    let valid = Groth16::<Bn254>::verify_proof(&key.pvk, &proof, inputs)
        .map_err(|e| CryptoError::ProofVerification(e.to_string()))?;
    Ok(valid)
}

#[cfg(test)]
pub(crate) mod test_circuit {
    //! A three-input circuit, `w * x1 = x2` and `x0 * 1 = x0`, with real Groth16 keys

    use super::*;
    use ark_relations::lc;
    use ark_relations::r1cs::{
        ConstraintSynthesizer, ConstraintSystemRef, SynthesisError, Variable,
    };
    use ark_snark::{CircuitSpecificSetupSNARK, SNARK};
    use ark_groth16::ProvingKey;

    #[derive(Clone)]
    struct Circuit {
        public: [Option<Fr>; 3],
        witness: Option<Fr>,
    }

    impl ConstraintSynthesizer<Fr> for Circuit {
        fn generate_constraints(self, cs: ConstraintSystemRef<Fr>) -> Result<(), SynthesisError> {
            let missing = || SynthesisError::AssignmentMissing;
            let x0 = cs.new_input_variable(|| self.public[0].ok_or_else(missing))?;
            let x1 = cs.new_input_variable(|| self.public[1].ok_or_else(missing))?;
            let x2 = cs.new_input_variable(|| self.public[2].ok_or_else(missing))?;
            let w = cs.new_witness_variable(|| self.witness.ok_or_else(missing))?;
            cs.enforce_constraint(lc!() + w, lc!() + x1, lc!() + x2)?;
            cs.enforce_constraint(lc!() + x0, lc!() + Variable::One, lc!() + x0)?;
            Ok(())
        }
    }

    pub struct TestCircuit {
        pk: ProvingKey<Bn254>,
        pub vkey: SnarkjsVerificationKey,
    }

    impl TestCircuit {
        pub fn setup(seed: u64) -> Self {
            use ark_std::rand::{rngs::StdRng, SeedableRng};
            let mut rng = StdRng::seed_from_u64(seed);
            let blank = Circuit {
                public: [None; 3],
                witness: None,
            };
            let (pk, vk) = Groth16::<Bn254>::circuit_specific_setup(blank, &mut rng).unwrap();
            TestCircuit {
                pk,
                vkey: export_vkey(&vk),
            }
        }

        /// Prove `witness * x1 = x2`; returns the proof and the decimal public signals
        pub fn prove(&self, x0: u64, x1: u64, witness: u64) -> (SnarkjsProof, Vec<String>) {
            use ark_std::rand::{rngs::StdRng, SeedableRng};
            let mut rng = StdRng::seed_from_u64(x0 ^ (x1 << 16) ^ (witness << 32));
            let public = [Fr::from(x0), Fr::from(x1), Fr::from(x1) * Fr::from(witness)];
            let circuit = Circuit {
                public: [Some(public[0]), Some(public[1]), Some(public[2])],
                witness: Some(Fr::from(witness)),
            };
            let proof = Groth16::<Bn254>::prove(&self.pk, circuit, &mut rng).unwrap();
            let signals = public.iter().map(|v| fr_decimal(*v)).collect();
            (export_proof(&proof), signals)
        }
    }

    fn fq_decimal(value: Fq) -> String {
        BigUint::from(value.into_bigint()).to_string()
    }

    fn fr_decimal(value: Fr) -> String {
        BigUint::from(value.into_bigint()).to_string()
    }

    fn export_g1(p: &G1Affine) -> Vec<String> {
        vec![fq_decimal(p.x), fq_decimal(p.y), "1".to_string()]
    }

    fn export_g2(p: &G2Affine) -> Vec<Vec<String>> {
        vec![
            vec![fq_decimal(p.x.c0), fq_decimal(p.x.c1)],
            vec![fq_decimal(p.y.c0), fq_decimal(p.y.c1)],
            vec!["1".to_string(), "0".to_string()],
        ]
    }

    fn export_vkey(vk: &VerifyingKey<Bn254>) -> SnarkjsVerificationKey {
        SnarkjsVerificationKey {
            protocol: "groth16".to_string(),
            curve: "bn128".to_string(),
            n_public: vk.gamma_abc_g1.len() - 1,
            vk_alpha_1: export_g1(&vk.alpha_g1),
            vk_beta_2: export_g2(&vk.beta_g2),
            vk_gamma_2: export_g2(&vk.gamma_g2),
            vk_delta_2: export_g2(&vk.delta_g2),
            ic: vk.gamma_abc_g1.iter().map(export_g1).collect(),
        }
    }

    fn export_proof(proof: &Proof<Bn254>) -> SnarkjsProof {
        SnarkjsProof {
            pi_a: export_g1(&proof.a),
            pi_b: export_g2(&proof.b),
            pi_c: export_g1(&proof.c),
            protocol: Some("groth16".to_string()),
            curve: Some("bn128".to_string()),
        }
    }
}
