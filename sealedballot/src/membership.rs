//! The anonymity set: identity commitments in an append-only Merkle tree.
//!
//! A voter holds two secrets (a nullifier secret and a trapdoor) and publishes only their
//! commitment. Commitments are appended to a fixed-depth tree; a membership proof is the
//! authentication path from a leaf to the root. Proofs are bound to the root they were produced
//! against: any later insertion changes the root and invalidates outstanding proofs.

use crate::*;
use hkdf::Hkdf;
use rand::RngCore;
use rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Depth used when none is configured: 2^20 = 1,048,576 voters
pub const DEFAULT_TREE_DEPTH: usize = 20;

/// Leaf indices are u64 and the capacity must fit
pub const MAX_TREE_DEPTH: usize = 32;

const COMMITMENT_TAG: u8 = 0x00;
const NODE_TAG: u8 = 0x01;
const LEAF_TAG: u8 = 0x02;

/// A Merkle tree node
pub type Node = [u8; 32];

/// A private 32 byte identity secret. Wiped from memory on drop and never serialized.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct IdentitySecret([u8; 32]);

impl IdentitySecret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        IdentitySecret(bytes)
    }

    pub fn expose(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for IdentitySecret {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("IdentitySecret(..)")
    }
}

/// Public one-way binding of an identity's two secrets
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Commitment(#[serde(with = "Bytes32Hex")] pub [u8; 32]);

impl Commitment {
    pub fn from_hex(s: &str) -> Result<Self, ValidationError> {
        Ok(Commitment(decode_fixed("identity commitment", s)?))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A voter's anonymous identity
///
/// The secrets stay with whoever created the identity; only the commitment is ever published.
#[derive(Debug)]
pub struct VoterIdentity {
    nullifier_secret: IdentitySecret,
    trapdoor: IdentitySecret,
    commitment: Commitment,
}

impl VoterIdentity {
    /// Generate a fresh identity from the OS random source
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self::from_rng(&mut rng)
    }

    /// Deterministically derive an identity from a seed
    pub fn from_seed(seed: &[u8]) -> Self {
        let h = Hkdf::<Sha256>::new(None, seed);
        let mut rng_seed = [0u8; 32];
        h.expand(b"sealedballot_voter_identity", &mut rng_seed)
            .expect("32 bytes is a valid HKDF-SHA256 output length");

        let mut rng = ChaCha20Rng::from_seed(rng_seed);
        rng_seed.zeroize();
        Self::from_rng(&mut rng)
    }

    /// Rebuild an identity from its secrets, recomputing the commitment
    pub fn from_secrets(nullifier_secret: IdentitySecret, trapdoor: IdentitySecret) -> Self {
        let commitment = identity_commitment(&nullifier_secret, &trapdoor);
        VoterIdentity {
            nullifier_secret,
            trapdoor,
            commitment,
        }
    }

    fn from_rng<R: RngCore>(rng: &mut R) -> Self {
        let mut nullifier = [0u8; 32];
        let mut trapdoor = [0u8; 32];
        rng.fill_bytes(&mut nullifier);
        rng.fill_bytes(&mut trapdoor);

        let identity = Self::from_secrets(
            IdentitySecret::from_bytes(nullifier),
            IdentitySecret::from_bytes(trapdoor),
        );
        nullifier.zeroize();
        trapdoor.zeroize();

        tracing::debug!(
            "generated voter identity (commitment: {})",
            preview(identity.commitment.as_bytes())
        );
        identity
    }

    pub fn nullifier_secret(&self) -> &IdentitySecret {
        &self.nullifier_secret
    }

    pub fn trapdoor(&self) -> &IdentitySecret {
        &self.trapdoor
    }

    pub fn commitment(&self) -> Commitment {
        self.commitment
    }

    /// Per-election nullifier for this identity
    pub fn nullifier(&self, election_id: ElectionId) -> Nullifier {
        derive_nullifier(&self.nullifier_secret, election_id)
    }
}

/// commitment = SHA-256(tag || nullifier_secret || trapdoor)
pub fn identity_commitment(nullifier_secret: &IdentitySecret, trapdoor: &IdentitySecret) -> Commitment {
    let mut hasher = Sha256::new();
    hasher.update([COMMITMENT_TAG]);
    hasher.update(nullifier_secret.expose());
    hasher.update(trapdoor.expose());
    Commitment(hasher.finalize().into())
}

// Populated leaves are hashes, so none can equal the all-zero empty leaf
fn hash_leaf(commitment: &Node) -> Node {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_TAG]);
    hasher.update(commitment);
    hasher.finalize().into()
}

fn hash_nodes(left: &Node, right: &Node) -> Node {
    let mut hasher = Sha256::new();
    hasher.update([NODE_TAG]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Authentication path from a leaf to the root it was produced against
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MembershipProof {
    #[serde(with = "Bytes32Hex")]
    pub root: Node,

    /// The member's commitment, hashed under the leaf tag before the path is applied
    #[serde(with = "Bytes32Hex")]
    pub leaf: Node,

    #[serde(with = "bytes32_vec_hex")]
    pub siblings: Vec<Node>,

    /// 0 when the node at that level is a left child, 1 when it is a right child
    pub path_indices: Vec<u8>,
}

impl MembershipProof {
    /// Hash up from the leaf and compare against `root`
    pub fn verify(&self) -> bool {
        match self.recompute_root() {
            Ok(root) => root == self.root,
            Err(_) => false,
        }
    }

    /// The root implied by the leaf and authentication path
    pub fn recompute_root(&self) -> Result<Node, ValidationError> {
        if self.siblings.len() != self.path_indices.len() || self.siblings.is_empty() {
            return Err(ValidationError::MalformedMembershipProof {
                siblings: self.siblings.len(),
                indices: self.path_indices.len(),
            });
        }

        let mut node = hash_leaf(&self.leaf);
        for (sibling, index) in self.siblings.iter().zip(self.path_indices.iter()) {
            node = match index {
                0 => hash_nodes(&node, sibling),
                1 => hash_nodes(sibling, &node),
                _ => {
                    return Err(ValidationError::MalformedMembershipProof {
                        siblings: self.siblings.len(),
                        indices: self.path_indices.len(),
                    })
                }
            };
        }
        Ok(node)
    }
}

/// Result of appending a commitment
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InsertReceipt {
    pub index: u64,

    #[serde(with = "Bytes32Hex")]
    pub new_root: Node,
}

/// Read-only summary of the set
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MembershipStats {
    pub depth: usize,
    pub capacity: u64,
    pub size: u64,

    #[serde(with = "Bytes32Hex")]
    pub root: Node,
}

/// Fixed-depth, append-only Merkle tree storing every populated node
#[derive(Clone, Debug)]
pub struct MerkleTree {
    depth: usize,

    // zeros[i] is the root of an empty subtree of height i
    zeros: Vec<Node>,

    // inserted commitments, in leaf order
    commitments: Vec<Node>,

    // levels[0] are the leaf hashes, levels[depth] holds the root once anything is inserted
    levels: Vec<Vec<Node>>,
}

impl MerkleTree {
    pub fn new(depth: usize) -> Result<Self, ValidationError> {
        if depth == 0 || depth > MAX_TREE_DEPTH {
            return Err(ValidationError::InvalidTreeDepth {
                got: depth,
                max: MAX_TREE_DEPTH,
            });
        }

        let mut zeros = Vec::with_capacity(depth + 1);
        zeros.push([0u8; 32]);
        for level in 0..depth {
            let below = zeros[level];
            zeros.push(hash_nodes(&below, &below));
        }

        Ok(MerkleTree {
            depth,
            zeros,
            commitments: Vec::new(),
            levels: vec![Vec::new(); depth + 1],
        })
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn capacity(&self) -> u64 {
        1u64 << self.depth
    }

    pub fn len(&self) -> u64 {
        self.levels[0].len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.levels[0].is_empty()
    }

    pub fn root(&self) -> Node {
        self.levels[self.depth]
            .first()
            .copied()
            .unwrap_or(self.zeros[self.depth])
    }

    fn node(&self, level: usize, index: usize) -> Node {
        self.levels[level]
            .get(index)
            .copied()
            .unwrap_or(self.zeros[level])
    }

    /// Append a commitment and rehash its path
    pub fn push(&mut self, commitment: Node) -> Result<u64, ValidationError> {
        if commitment == [0u8; 32] {
            return Err(ValidationError::ZeroCommitment);
        }
        let index = self.len();
        if index >= self.capacity() {
            return Err(ValidationError::TreeFull(self.capacity()));
        }

        self.commitments.push(commitment);
        self.levels[0].push(hash_leaf(&commitment));
        let mut position = index as usize;
        for level in 0..self.depth {
            let (left, right) = if position % 2 == 0 {
                (self.node(level, position), self.node(level, position + 1))
            } else {
                (self.node(level, position - 1), self.node(level, position))
            };
            let parent = hash_nodes(&left, &right);

            position /= 2;
            let row = &mut self.levels[level + 1];
            if position < row.len() {
                row[position] = parent;
            } else {
                row.push(parent);
            }
        }

        Ok(index)
    }

    /// Authentication path for the leaf at `index`
    pub fn proof(&self, index: u64) -> Option<MembershipProof> {
        if index >= self.len() {
            return None;
        }

        let mut siblings = Vec::with_capacity(self.depth);
        let mut path_indices = Vec::with_capacity(self.depth);
        let mut position = index as usize;
        for level in 0..self.depth {
            siblings.push(self.node(level, position ^ 1));
            path_indices.push((position & 1) as u8);
            position /= 2;
        }

        Some(MembershipProof {
            root: self.root(),
            leaf: self.commitments[index as usize],
            siblings,
            path_indices,
        })
    }
}

struct SetState {
    tree: MerkleTree,
    index: HashMap<Commitment, u64>,
}

/// The anonymity set of identity commitments
///
/// Safe to share between request handlers: reads take a shared lock, inserts an exclusive one.
/// When opened with a journal path every insert is appended and synced to the journal before it
/// is acknowledged.
pub struct MembershipSet {
    state: RwLock<SetState>,
    journal: Option<PathBuf>,
}

impl MembershipSet {
    /// An in-memory set
    pub fn new(depth: usize) -> Result<Self, ValidationError> {
        Ok(MembershipSet {
            state: RwLock::new(SetState {
                tree: MerkleTree::new(depth)?,
                index: HashMap::new(),
            }),
            journal: None,
        })
    }

    /// A set mirrored to an append-only journal, replaying it if it exists
    pub fn open<P: AsRef<Path>>(journal: P, depth: usize) -> Result<Self, Error> {
        let journal = journal.as_ref().to_path_buf();
        let mut state = SetState {
            tree: MerkleTree::new(depth)?,
            index: HashMap::new(),
        };

        if journal.exists() {
            let file = File::open(&journal).map_err(|e| StorageError::io(&journal, e))?;
            for line in BufReader::new(file).lines() {
                let line = line.map_err(|e| StorageError::io(&journal, e))?;
                if line.trim().is_empty() {
                    continue;
                }
                let commitment = Commitment::from_hex(&line)?;
                let index = state.tree.push(commitment.0)?;
                state.index.insert(commitment, index);
            }
            tracing::info!(
                "membership set restored from journal ({} members)",
                state.tree.len()
            );
        } else if let Some(parent) = journal.parent() {
            ensure_private_dir(parent)?;
        }

        Ok(MembershipSet {
            state: RwLock::new(state),
            journal: Some(journal),
        })
    }

    /// Append a commitment to the set
    pub fn insert(&self, commitment: Commitment) -> Result<InsertReceipt, Error> {
        if commitment.0 == [0u8; 32] {
            return Err(ValidationError::ZeroCommitment.into());
        }
        let mut state = self.state.write()?;

        if state.index.contains_key(&commitment) {
            return Err(ValidationError::DuplicateCommitment.into());
        }
        if state.tree.len() >= state.tree.capacity() {
            return Err(ValidationError::TreeFull(state.tree.capacity()).into());
        }

        if let Some(journal) = &self.journal {
            append_journal(journal, &commitment)?;
        }

        let index = state.tree.push(commitment.0)?;
        state.index.insert(commitment, index);
        let new_root = state.tree.root();

        tracing::info!(
            "voter added to membership set (index: {}, root: {})",
            index,
            preview(&new_root)
        );

        Ok(InsertReceipt { index, new_root })
    }

    /// Membership proof against the current root
    pub fn prove_membership(&self, commitment: &Commitment) -> Result<MembershipProof, Error> {
        let state = self.state.read()?;
        let index = *state
            .index
            .get(commitment)
            .ok_or(ValidationError::UnknownCommitment)?;

        let proof = state
            .tree
            .proof(index)
            .ok_or(ValidationError::UnknownCommitment)?;
        Ok(proof)
    }

    /// Verify a proof against the current root of this set
    ///
    /// There is no window of accepted historical roots.
    pub fn verify_membership(&self, proof: &MembershipProof) -> bool {
        let (root, depth) = match self.state.read() {
            Ok(state) => (state.tree.root(), state.tree.depth()),
            Err(_) => return false,
        };

        let valid = proof.siblings.len() == depth && proof.root == root && proof.verify();
        tracing::debug!(
            "membership proof verification: {}",
            if valid { "valid" } else { "invalid" }
        );
        valid
    }

    pub fn current_root(&self) -> Node {
        self.state
            .read()
            .map(|s| s.tree.root())
            .unwrap_or_else(|poisoned| poisoned.into_inner().tree.root())
    }

    pub fn size(&self) -> u64 {
        self.state
            .read()
            .map(|s| s.tree.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().tree.len())
    }

    pub fn contains(&self, commitment: &Commitment) -> bool {
        self.state
            .read()
            .map(|s| s.index.contains_key(commitment))
            .unwrap_or(false)
    }

    pub fn stats(&self) -> Result<MembershipStats, Error> {
        let state = self.state.read()?;
        Ok(MembershipStats {
            depth: state.tree.depth(),
            capacity: state.tree.capacity(),
            size: state.tree.len(),
            root: state.tree.root(),
        })
    }
}

fn append_journal(journal: &Path, commitment: &Commitment) -> Result<(), StorageError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(journal)
        .map_err(|e| StorageError::io(journal, e))?;
    writeln!(file, "{}", commitment).map_err(|e| StorageError::io(journal, e))?;
    file.sync_data().map_err(|e| StorageError::io(journal, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commitment(n: u8) -> Commitment {
        Commitment([n; 32])
    }

    #[test]
    fn empty_root_is_zero_subtree() {
        let tree = MerkleTree::new(3).unwrap();
        let z0 = [0u8; 32];
        let z1 = hash_nodes(&z0, &z0);
        let z2 = hash_nodes(&z1, &z1);
        assert_eq!(tree.root(), hash_nodes(&z2, &z2));
        assert_eq!(tree.capacity(), 8);
    }

    #[test]
    fn every_inserted_member_proves() {
        let set = MembershipSet::new(4).unwrap();
        for n in 1..=10 {
            set.insert(commitment(n)).unwrap();
        }
        for n in 1..=10 {
            let proof = set.prove_membership(&commitment(n)).unwrap();
            assert_eq!(proof.siblings.len(), 4);
            assert!(set.verify_membership(&proof));
        }
        assert_eq!(set.size(), 10);
    }

    #[test]
    fn proofs_go_stale_after_insert() {
        let set = MembershipSet::new(4).unwrap();
        set.insert(commitment(1)).unwrap();
        let proof = set.prove_membership(&commitment(1)).unwrap();
        assert!(set.verify_membership(&proof));

        set.insert(commitment(2)).unwrap();
        assert!(proof.verify());
        assert!(!set.verify_membership(&proof));
    }

    #[test]
    fn corrupted_paths_are_rejected() {
        let set = MembershipSet::new(5).unwrap();
        for n in 1..=6 {
            set.insert(commitment(n)).unwrap();
        }
        let proof = set.prove_membership(&commitment(4)).unwrap();

        for level in 0..proof.siblings.len() {
            let mut bad = proof.clone();
            bad.siblings[level][7] ^= 0x01;
            assert!(!set.verify_membership(&bad));

            let mut bad = proof.clone();
            bad.path_indices[level] ^= 1;
            assert!(!set.verify_membership(&bad));
        }

        let mut bad = proof.clone();
        bad.path_indices[0] = 2;
        assert!(!bad.verify());

        let mut bad = proof;
        bad.siblings.pop();
        assert!(!set.verify_membership(&bad));
    }

    #[test]
    fn empty_slot_next_to_member_does_not_prove() {
        let set = MembershipSet::new(4).unwrap();
        set.insert(commitment(1)).unwrap();
        let proof = set.prove_membership(&commitment(1)).unwrap();

        // Describe the empty right-hand neighbour of the only member
        let mut forged = proof.clone();
        forged.leaf = [0u8; 32];
        forged.siblings[0] = hash_leaf(&proof.leaf);
        forged.path_indices[0] = 1;
        assert!(!forged.verify());
        assert!(!set.verify_membership(&forged));
        assert!(!set.contains(&Commitment([0u8; 32])));

        assert!(matches!(
            set.insert(Commitment([0u8; 32])),
            Err(Error::Validation(ValidationError::ZeroCommitment))
        ));
        assert_eq!(set.size(), 1);
        assert_eq!(proof.leaf, commitment(1).0);
    }

    #[test]
    fn full_tree_and_duplicates() {
        let set = MembershipSet::new(1).unwrap();
        set.insert(commitment(1)).unwrap();
        assert!(matches!(
            set.insert(commitment(1)),
            Err(Error::Validation(ValidationError::DuplicateCommitment))
        ));
        set.insert(commitment(2)).unwrap();
        assert!(matches!(
            set.insert(commitment(3)),
            Err(Error::Validation(ValidationError::TreeFull(2)))
        ));
        assert!(matches!(
            set.prove_membership(&commitment(3)),
            Err(Error::Validation(ValidationError::UnknownCommitment))
        ));
    }

    #[test]
    fn invalid_depths() {
        assert!(MerkleTree::new(0).is_err());
        assert!(MerkleTree::new(MAX_TREE_DEPTH + 1).is_err());
        assert!(MerkleTree::new(MAX_TREE_DEPTH).is_ok());
    }

    #[test]
    fn journal_replays_members() {
        let dir = tempfile::tempdir().unwrap();
        let journal = dir.path().join("members.log");

        let root = {
            let set = MembershipSet::open(&journal, 6).unwrap();
            for n in 1..=5 {
                set.insert(commitment(n)).unwrap();
            }
            set.current_root()
        };

        let reopened = MembershipSet::open(&journal, 6).unwrap();
        assert_eq!(reopened.size(), 5);
        assert_eq!(reopened.current_root(), root);
        assert!(reopened.contains(&commitment(3)));
        let proof = reopened.prove_membership(&commitment(3)).unwrap();
        assert!(reopened.verify_membership(&proof));
    }

    #[test]
    fn seeded_identities_are_deterministic() {
        let a = VoterIdentity::from_seed(b"alice");
        let b = VoterIdentity::from_seed(b"alice");
        let c = VoterIdentity::from_seed(b"bob");
        assert_eq!(a.commitment(), b.commitment());
        assert_ne!(a.commitment(), c.commitment());

        let rebuilt =
            VoterIdentity::from_secrets(a.nullifier_secret().clone(), a.trapdoor().clone());
        assert_eq!(rebuilt.commitment(), a.commitment());
        assert_ne!(VoterIdentity::generate().commitment(), a.commitment());
    }

    #[test]
    fn proof_json_uses_camel_case() {
        let set = MembershipSet::new(2).unwrap();
        set.insert(commitment(9)).unwrap();
        let proof = set.prove_membership(&commitment(9)).unwrap();
        let json = serde_json::to_value(&proof).unwrap();
        assert!(json.get("pathIndices").is_some());
        let back: MembershipProof = serde_json::from_value(json).unwrap();
        assert_eq!(back, proof);
    }
}
