use crate::*;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

pub const KEY_ENCRYPTION_ALGORITHM: &str = "aes-256-gcm";

const IV_LENGTH: usize = 12;
const SALT_LENGTH: usize = 32;
const TAG_LENGTH: usize = 16;
const KEY_LENGTH: usize = 32;

/// scrypt cost parameters
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        KdfParams {
            log_n: 14,
            r: 8,
            p: 1,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CustodianConfig {
    pub kdf: KdfParams,

    /// Upper bound on a remote backup fetch before the key is treated as unavailable
    pub remote_timeout: Duration,
}

impl Default for CustodianConfig {
    fn default() -> Self {
        CustodianConfig {
            kdf: KdfParams::default(),
            remote_timeout: Duration::from_secs(10),
        }
    }
}

/// An election private key encrypted at rest
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedKeyRecord {
    #[serde(with = "hex_serde")]
    pub ciphertext: Vec<u8>,

    #[serde(with = "hex_serde")]
    pub iv: Vec<u8>,

    #[serde(with = "hex_serde")]
    pub auth_tag: Vec<u8>,

    #[serde(with = "hex_serde")]
    pub salt: Vec<u8>,

    pub algorithm: String,
    pub created_at: u64,
}

/// Holds the master password and the two-tier store of encrypted election keys
pub struct KeyCustodian {
    master_password: Zeroizing<String>,
    config: CustodianConfig,
    store: TieredKeyStore,
}

impl KeyCustodian {
    /// The store's remote fetch timeout is taken from `config`
    pub fn new(
        master_password: impl Into<String>,
        store: TieredKeyStore,
        config: CustodianConfig,
    ) -> Result<Self, ValidationError> {
        let master_password = Zeroizing::new(master_password.into());
        if master_password.is_empty() {
            return Err(ValidationError::EmptyMasterPassword);
        }
        Ok(KeyCustodian {
            master_password,
            config,
            store: store.with_remote_timeout(config.remote_timeout),
        })
    }

    /// Custodian over `election-<id>-key.json` files in `dir`
    pub fn open(
        dir: impl Into<PathBuf>,
        master_password: impl Into<String>,
        remote: Option<Arc<dyn RemoteBackup>>,
        config: CustodianConfig,
    ) -> Result<Self, Error> {
        let store = TieredKeyStore::open(dir, remote, config.remote_timeout)?;
        Ok(Self::new(master_password, store, config)?)
    }

    pub fn config(&self) -> CustodianConfig {
        self.config
    }

    fn derive_key(&self, salt: &[u8]) -> Result<Zeroizing<[u8; KEY_LENGTH]>, CryptoError> {
        let kdf = self.config.kdf;
        let params = scrypt::Params::new(kdf.log_n, kdf.r, kdf.p, KEY_LENGTH)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        scrypt::scrypt(self.master_password.as_bytes(), salt, &params, &mut key[..])
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        Ok(key)
    }

    /// AES-256-GCM under a scrypt-derived key, fresh salt and IV per call
    pub fn encrypt_private_key(
        &self,
        private_key: &ElGamalSecretKey,
    ) -> Result<EncryptedKeyRecord, CryptoError> {
        let salt = random_bytes::<SALT_LENGTH>();
        let iv = random_bytes::<IV_LENGTH>();
        let key = self.derive_key(&salt)?;

        let aead = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| CryptoError::KeyEncryptionFailed)?;
        let mut buffer = private_key.to_bytes().to_vec();
        let tag = aead
            .encrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut buffer)
            .map_err(|_| CryptoError::KeyEncryptionFailed)?;

        tracing::debug!("private key encrypted (salt: {})", preview(&salt));
        Ok(EncryptedKeyRecord {
            ciphertext: buffer,
            iv: iv.to_vec(),
            auth_tag: tag.to_vec(),
            salt: salt.to_vec(),
            algorithm: KEY_ENCRYPTION_ALGORITHM.to_string(),
            created_at: now_millis(),
        })
    }

    /// Authenticate and decrypt; any tampering or a wrong password is `KeyAuthenticationFailed`
    pub fn decrypt_private_key(&self, record: &EncryptedKeyRecord) -> Result<ElGamalSecretKey, Error> {
        if record.algorithm != KEY_ENCRYPTION_ALGORITHM {
            return Err(ValidationError::UnsupportedAlgorithm(record.algorithm.clone()).into());
        }
        check_length("iv", IV_LENGTH, record.iv.len())?;
        check_length("authTag", TAG_LENGTH, record.auth_tag.len())?;
        check_length("salt", SALT_LENGTH, record.salt.len())?;

        let key = self.derive_key(&record.salt)?;
        let aead = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| CryptoError::KeyAuthenticationFailed)?;

        let mut buffer = Zeroizing::new(record.ciphertext.clone());
        aead.decrypt_in_place_detached(
            Nonce::from_slice(&record.iv),
            b"",
            &mut buffer[..],
            Tag::from_slice(&record.auth_tag),
        )
        .map_err(|_| {
            tracing::error!("failed to decrypt private key");
            CryptoError::KeyAuthenticationFailed
        })?;

        if buffer.len() != 32 {
            return Err(CryptoError::InvalidPrivateKey("expected 32 bytes").into());
        }
        let mut bytes = Zeroizing::new([0u8; 32]);
        bytes.copy_from_slice(&buffer[..]);
        Ok(ElGamalSecretKey::from_bytes(*bytes)?)
    }

    /// Local write is fatal on failure; the remote replica is best-effort
    pub fn store_encrypted_key(
        &self,
        election_id: ElectionId,
        record: &EncryptedKeyRecord,
    ) -> Result<StoredLocation, StorageError> {
        self.store.store(election_id, record)
    }

    /// Local copy first, then the remote replica, `None` if neither has it
    pub fn retrieve_encrypted_key(
        &self,
        election_id: ElectionId,
    ) -> Result<Option<EncryptedKeyRecord>, StorageError> {
        self.store.fetch(election_id)
    }

    pub fn securely_store_private_key(
        &self,
        election_id: ElectionId,
        private_key: &ElGamalSecretKey,
    ) -> Result<StoredLocation, Error> {
        let record = self.encrypt_private_key(private_key)?;
        let location = self.store_encrypted_key(election_id, &record)?;
        tracing::info!(
            "private key secured for election {} (backed up: {})",
            election_id,
            location.remote_backup_id.is_some()
        );
        Ok(location)
    }

    pub fn securely_retrieve_private_key(
        &self,
        election_id: ElectionId,
    ) -> Result<Option<ElGamalSecretKey>, Error> {
        match self.retrieve_encrypted_key(election_id)? {
            Some(record) => Ok(Some(self.decrypt_private_key(&record)?)),
            None => {
                tracing::warn!("no private key found for election {}", election_id);
                Ok(None)
            }
        }
    }

    pub fn has_private_key(&self, election_id: ElectionId) -> Result<bool, StorageError> {
        self.store.contains(election_id)
    }

    /// Deleting a key that does not exist is a no-op
    pub fn delete_private_key(&self, election_id: ElectionId) -> Result<(), StorageError> {
        if self.store.remove(election_id)? {
            tracing::info!("private key deleted for election {}", election_id);
        }
        Ok(())
    }

    pub fn list_elections_with_keys(&self) -> Result<Vec<ElectionId>, StorageError> {
        self.store.list()
    }

    /// Encrypt and decrypt a fixed key with the configured password and KDF
    pub fn self_test(&self) -> Result<(), Error> {
        let mut bytes = [0u8; 32];
        bytes[0] = 0x2a;
        bytes[31] = 0x01;
        let key = ElGamalSecretKey::from_bytes(bytes)?;

        let record = self.encrypt_private_key(&key)?;
        if self.decrypt_private_key(&record)? != key {
            return Err(CryptoError::KeyAuthenticationFailed.into());
        }
        tracing::info!("key custodian self test passed");
        Ok(())
    }
}

fn check_length(what: &'static str, expected: usize, got: usize) -> Result<(), ValidationError> {
    if got != expected {
        return Err(ValidationError::BadLength {
            what,
            expected,
            got,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use curve25519_dalek::scalar::Scalar;
    use proptest::prelude::*;

    fn fast_config() -> CustodianConfig {
        CustodianConfig {
            kdf: KdfParams {
                log_n: 4,
                r: 8,
                p: 1,
            },
            remote_timeout: Duration::from_secs(1),
        }
    }

    fn custodian(password: &str) -> KeyCustodian {
        let store = TieredKeyStore::with_local(
            Box::new(MemKeyStore::default()),
            None,
            Duration::from_secs(1),
        );
        KeyCustodian::new(password, store, fast_config()).unwrap()
    }

    #[test]
    fn record_shape() {
        let custodian = custodian("hunter2");
        let keys = generate_keys();
        let record = custodian.encrypt_private_key(&keys.private_key).unwrap();
        assert_eq!(record.iv.len(), 12);
        assert_eq!(record.salt.len(), 32);
        assert_eq!(record.auth_tag.len(), 16);
        assert_eq!(record.ciphertext.len(), 32);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["algorithm"], "aes-256-gcm");
        assert_eq!(json["authTag"].as_str().unwrap().len(), 32);
        assert!(json["createdAt"].is_u64());

        // Fresh salt and IV every time
        let again = custodian.encrypt_private_key(&keys.private_key).unwrap();
        assert_ne!(record.salt, again.salt);
        assert_ne!(record.iv, again.iv);
        assert_ne!(record.ciphertext, again.ciphertext);
    }

    #[test]
    fn tampering_is_detected() {
        let custodian = custodian("hunter2");
        let keys = generate_keys();
        let record = custodian.encrypt_private_key(&keys.private_key).unwrap();

        let mut bad_ciphertext = record.clone();
        bad_ciphertext.ciphertext[0] ^= 1;
        let mut bad_tag = record.clone();
        bad_tag.auth_tag[15] ^= 1;
        let mut bad_salt = record.clone();
        bad_salt.salt[0] ^= 1;
        let mut bad_iv = record.clone();
        bad_iv.iv[0] ^= 1;

        for tampered in [bad_ciphertext, bad_tag, bad_salt, bad_iv].iter() {
            assert!(matches!(
                custodian.decrypt_private_key(tampered),
                Err(Error::Crypto(CryptoError::KeyAuthenticationFailed))
            ));
        }

        let other = self::custodian("hunter3");
        assert!(matches!(
            other.decrypt_private_key(&record),
            Err(Error::Crypto(CryptoError::KeyAuthenticationFailed))
        ));
    }

    #[test]
    fn malformed_records_are_rejected() {
        let custodian = custodian("hunter2");
        let keys = generate_keys();
        let record = custodian.encrypt_private_key(&keys.private_key).unwrap();

        let mut algorithm = record.clone();
        algorithm.algorithm = "aes-128-cbc".to_string();
        assert!(matches!(
            custodian.decrypt_private_key(&algorithm),
            Err(Error::Validation(ValidationError::UnsupportedAlgorithm(_)))
        ));

        let mut short_tag = record.clone();
        short_tag.auth_tag.truncate(8);
        assert!(matches!(
            custodian.decrypt_private_key(&short_tag),
            Err(Error::Validation(ValidationError::BadLength { what: "authTag", .. }))
        ));

        let mut iv16 = record;
        iv16.iv = vec![0; 16];
        assert!(custodian.decrypt_private_key(&iv16).is_err());
    }

    #[test]
    fn store_and_recover_through_backup() {
        let dir = tempfile::tempdir().unwrap();
        let backup = Arc::new(MemBackup::default());
        let remote: Arc<dyn RemoteBackup> = backup.clone();
        let custodian =
            KeyCustodian::open(dir.path(), "hunter2", Some(remote.clone()), fast_config()).unwrap();
        let keys = generate_keys();

        assert!(!custodian.has_private_key(9).unwrap());
        let location = custodian
            .securely_store_private_key(9, &keys.private_key)
            .unwrap();
        assert!(location.local_path.ends_with("election-9-key.json"));
        assert!(location.remote_backup_id.is_some());
        assert_eq!(custodian.list_elections_with_keys().unwrap(), vec![9]);

        std::fs::remove_file(&location.local_path).unwrap();
        let recovered = custodian.securely_retrieve_private_key(9).unwrap().unwrap();
        assert_eq!(recovered, keys.private_key);

        custodian.delete_private_key(9).unwrap();
        custodian.delete_private_key(9).unwrap();
        assert!(!custodian.has_private_key(9).unwrap());
        assert!(custodian.securely_retrieve_private_key(9).unwrap().is_none());
        custodian.self_test().unwrap();
    }

    #[test]
    fn wrong_length_plaintext_is_rejected() {
        let custodian = custodian("hunter2");
        let salt = [5u8; SALT_LENGTH];
        let iv = [6u8; IV_LENGTH];
        let key = custodian.derive_key(&salt).unwrap();
        let aead = Aes256Gcm::new_from_slice(&key[..]).unwrap();
        let mut buffer = vec![7u8; 31];
        let tag = aead
            .encrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut buffer)
            .unwrap();

        let record = EncryptedKeyRecord {
            ciphertext: buffer,
            iv: iv.to_vec(),
            auth_tag: tag.to_vec(),
            salt: salt.to_vec(),
            algorithm: KEY_ENCRYPTION_ALGORITHM.to_string(),
            created_at: 1,
        };
        assert!(matches!(
            custodian.decrypt_private_key(&record),
            Err(Error::Crypto(CryptoError::InvalidPrivateKey(_)))
        ));
    }

    #[test]
    fn store_timeout_follows_config() {
        let store = TieredKeyStore::with_local(
            Box::new(MemKeyStore::default()),
            None,
            Duration::from_secs(30),
        );
        let custodian = KeyCustodian::new("hunter2", store, fast_config()).unwrap();
        assert_eq!(custodian.store.remote_timeout(), Duration::from_secs(1));
        assert_eq!(custodian.config().remote_timeout, Duration::from_secs(1));
    }

    #[test]
    fn empty_password_is_refused() {
        let store = TieredKeyStore::with_local(
            Box::new(MemKeyStore::default()),
            None,
            Duration::from_secs(1),
        );
        assert!(KeyCustodian::new("", store, fast_config()).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn key_at_rest_round_trip(bytes in any::<[u8; 32]>()) {
            let scalar = Scalar::from_bytes_mod_order(bytes);
            prop_assume!(scalar != Scalar::ZERO);
            let key = ElGamalSecretKey::from_bytes(scalar.to_bytes()).unwrap();

            let custodian = custodian("correct horse battery staple");
            let record = custodian.encrypt_private_key(&key).unwrap();
            prop_assert_eq!(custodian.decrypt_private_key(&record).unwrap(), key);
        }
    }
}
