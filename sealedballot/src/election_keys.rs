use crate::*;
use std::sync::{Arc, Mutex};

/// Result of setting up encryption for an election
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionSetup {
    pub public_key: ElGamalPublicKey,
    pub metadata: ElectionKeyMetadata,
    pub local_path: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_backup_id: Option<String>,
}

/// Election key operations gated by the authorization registry
///
/// Nothing reaches the custodian or the vote cipher's decryption path without a permission
/// check on the caller.
pub struct ElectionKeys {
    registry: Arc<AuthorizationRegistry>,
    cipher: Arc<VoteCipher>,
    custodian: Arc<KeyCustodian>,
    setup_lock: Mutex<()>,
}

impl ElectionKeys {
    pub fn new(
        registry: Arc<AuthorizationRegistry>,
        cipher: Arc<VoteCipher>,
        custodian: Arc<KeyCustodian>,
    ) -> Self {
        ElectionKeys {
            registry,
            cipher,
            custodian,
            setup_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &AuthorizationRegistry {
        &self.registry
    }

    pub fn cipher(&self) -> &VoteCipher {
        &self.cipher
    }

    pub fn custodian(&self) -> &KeyCustodian {
        &self.custodian
    }

    /// Generate and store the election key pair; the caller needs `canSetupEncryption`
    pub fn setup_encryption(
        &self,
        election_id: ElectionId,
        caller: &str,
    ) -> Result<EncryptionSetup, Error> {
        self.registry
            .require(election_id, caller, Permission::SetupEncryption)?;

        let _guard = self.setup_lock.lock()?;
        if self.custodian.has_private_key(election_id)? {
            return Err(ValidationError::KeyAlreadyExists(election_id).into());
        }

        let keys = generate_keys();
        let metadata = key_metadata(election_id, &keys);
        let location = self
            .custodian
            .securely_store_private_key(election_id, &keys.private_key)?;

        tracing::info!(
            "encryption set up for election {} by {} (public key: {})",
            election_id,
            normalize_address(caller),
            preview(keys.public_key.0.as_bytes())
        );
        Ok(EncryptionSetup {
            public_key: keys.public_key,
            metadata,
            local_path: location.local_path,
            remote_backup_id: location.remote_backup_id,
        })
    }

    /// The caller needs `canDecryptVotes`
    pub fn retrieve_private_key(
        &self,
        election_id: ElectionId,
        caller: &str,
    ) -> Result<ElGamalSecretKey, Error> {
        self.registry
            .require(election_id, caller, Permission::DecryptVotes)?;

        let private_key = self
            .custodian
            .securely_retrieve_private_key(election_id)?
            .ok_or(ValidationError::KeyUnavailable(election_id))?;
        tracing::info!(
            "private key for election {} released to {}",
            election_id,
            normalize_address(caller)
        );
        Ok(private_key)
    }

    /// Decrypt and count a batch of votes; the caller needs `canDecryptVotes`
    ///
    /// When `public_key` is given, the recovered private key must match it.
    pub fn decrypt_tally(
        &self,
        election_id: ElectionId,
        caller: &str,
        ciphertexts: &[ElGamalCiphertext],
        public_key: Option<&ElGamalPublicKey>,
    ) -> Result<TallyResult, Error> {
        let private_key = self.retrieve_private_key(election_id, caller)?;
        if let Some(public_key) = public_key {
            if !verify_key_pair(public_key, &private_key) {
                return Err(CryptoError::KeyPairMismatch.into());
            }
        }
        Ok(self.cipher.tally_votes(ciphertexts, &private_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const ALICE: &str = "0xAlice";
    const BOB: &str = "0xBob";
    const MALLORY: &str = "0xMallory";

    fn service() -> ElectionKeys {
        let store = TieredKeyStore::with_local(
            Box::new(MemKeyStore::default()),
            Some(Arc::new(MemBackup::default()) as Arc<dyn RemoteBackup>),
            Duration::from_secs(1),
        );
        let config = CustodianConfig {
            kdf: KdfParams {
                log_n: 4,
                r: 8,
                p: 1,
            },
            ..Default::default()
        };
        let custodian = KeyCustodian::new("hunter2", store, config).unwrap();
        let registry = AuthorizationRegistry::new();
        registry.initialize(1, ALICE).unwrap();
        ElectionKeys::new(
            Arc::new(registry),
            Arc::new(VoteCipher::default()),
            Arc::new(custodian),
        )
    }

    #[test]
    fn setup_then_tally() {
        let service = service();
        let setup = service.setup_encryption(1, ALICE).unwrap();
        assert!(setup.remote_backup_id.is_some());
        assert_eq!(setup.metadata.public_key, setup.public_key);

        let votes: Vec<_> = [0, 1, 1, -1]
            .iter()
            .map(|id| service.cipher().encrypt(*id, &setup.public_key, None).unwrap())
            .collect();
        let tally = service
            .decrypt_tally(1, ALICE, &votes, Some(&setup.public_key))
            .unwrap();
        assert_eq!(tally.success_count, 4);
        assert_eq!(tally.per_candidate_counts.get(&3), Some(&2));
        assert_eq!(tally.per_candidate_counts.get(&1), Some(&1));

        assert!(matches!(
            service.setup_encryption(1, ALICE),
            Err(Error::Validation(ValidationError::KeyAlreadyExists(1)))
        ));
    }

    #[test]
    fn permissions_gate_every_path() {
        let service = service();
        assert!(service.setup_encryption(1, MALLORY).unwrap_err().is_authorization());
        service.setup_encryption(1, ALICE).unwrap();
        assert!(service.retrieve_private_key(1, MALLORY).unwrap_err().is_authorization());
        assert!(service.decrypt_tally(1, MALLORY, &[], None).unwrap_err().is_authorization());

        let no_decrypt = PermissionUpdate {
            can_decrypt_votes: Some(false),
            ..Default::default()
        };
        service
            .registry()
            .add_co_organizer(1, BOB, ALICE, no_decrypt)
            .unwrap();
        assert!(service.retrieve_private_key(1, BOB).unwrap_err().is_authorization());

        let allow_decrypt = PermissionUpdate {
            can_decrypt_votes: Some(true),
            ..Default::default()
        };
        service
            .registry()
            .update_permissions(1, BOB, allow_decrypt, ALICE)
            .unwrap();
        assert!(service.retrieve_private_key(1, BOB).is_ok());
    }

    #[test]
    fn missing_and_mismatched_keys() {
        let service = service();
        assert!(matches!(
            service.retrieve_private_key(1, ALICE),
            Err(Error::Validation(ValidationError::KeyUnavailable(1)))
        ));

        service.setup_encryption(1, ALICE).unwrap();
        let other = generate_keys();
        assert!(matches!(
            service.decrypt_tally(1, ALICE, &[], Some(&other.public_key)),
            Err(Error::Crypto(CryptoError::KeyPairMismatch))
        ));
    }
}
