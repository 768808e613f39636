use crate::rest::HttpBackup;
use sealedballot::*;
use std::env::var;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub struct Config {
    pub master_password: Option<String>,
    pub data_dir: PathBuf,
    pub backup_uri: Option<String>,
    pub backup_timeout: Duration,
    pub decode_bound: u64,
    pub kdf: KdfParams,
    pub vote_vkey: Option<PathBuf>,
    pub eligibility_vkey: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let master_password = var("SEALEDBALLOT_MASTER_PASSWORD")
            .ok()
            .filter(|val| !val.is_empty());

        let data_dir = match var("SEALEDBALLOT_DATA_DIR") {
            Ok(val) => PathBuf::from(crate::expand(&val)),
            Err(_e) => PathBuf::from("./.secure-keys"),
        };

        let backup_uri = var("SEALEDBALLOT_BACKUP_URI")
            .ok()
            .filter(|uri| !uri.is_empty())
            .map(|uri| uri.trim_end_matches('/').to_owned());

        let backup_timeout = match var("SEALEDBALLOT_BACKUP_TIMEOUT_SECS") {
            Ok(val) => Duration::from_secs(parse_env("SEALEDBALLOT_BACKUP_TIMEOUT_SECS", &val)?),
            Err(_e) => CustodianConfig::default().remote_timeout,
        };

        let decode_bound = match var("SEALEDBALLOT_DECODE_BOUND") {
            Ok(val) => parse_env("SEALEDBALLOT_DECODE_BOUND", &val)?,
            Err(_e) => DEFAULT_DECODE_BOUND,
        };

        let mut kdf = KdfParams::default();
        if let Ok(val) = var("SEALEDBALLOT_SCRYPT_LOG_N") {
            kdf.log_n = parse_env("SEALEDBALLOT_SCRYPT_LOG_N", &val)?;
        }

        let path_var = |name: &str| var(name).ok().map(|val| PathBuf::from(crate::expand(&val)));

        Ok(Config {
            master_password,
            data_dir,
            backup_uri,
            backup_timeout,
            decode_bound,
            kdf,
            vote_vkey: path_var("SEALEDBALLOT_VOTE_VKEY"),
            eligibility_vkey: path_var("SEALEDBALLOT_ELIGIBILITY_VKEY"),
        })
    }

    pub fn custodian_config(&self) -> CustodianConfig {
        CustodianConfig {
            kdf: self.kdf,
            remote_timeout: self.backup_timeout,
        }
    }

    pub fn cipher(&self) -> Result<VoteCipher, Error> {
        Ok(VoteCipher::new(CipherConfig {
            decode_bound: self.decode_bound,
        })?)
    }

    pub fn custodian(&self) -> Result<KeyCustodian, Error> {
        let remote = self
            .backup_uri
            .as_deref()
            .map(|uri| Arc::new(HttpBackup::new(uri, self.backup_timeout)) as Arc<dyn RemoteBackup>);
        let master_password = match &self.master_password {
            Some(password) => password.clone(),
            None => {
                // Keys written under a random password are unreadable by the next process
                tracing::warn!(
                    "SEALEDBALLOT_MASTER_PASSWORD is not set, using a random password for this process"
                );
                hex::encode(random_bytes::<32>())
            }
        };
        KeyCustodian::open(
            self.data_dir.clone(),
            master_password,
            remote,
            self.custodian_config(),
        )
    }

    pub fn registry(&self) -> Result<AuthorizationRegistry, Error> {
        Ok(AuthorizationRegistry::open(self.data_dir.join("organizers"))?)
    }

    pub fn election_keys(&self) -> Result<ElectionKeys, Error> {
        Ok(ElectionKeys::new(
            Arc::new(self.registry()?),
            Arc::new(self.cipher()?),
            Arc::new(self.custodian()?),
        ))
    }

    /// A verifier loaded from the configured verification key files
    pub fn verifier(&self) -> Result<ProofVerifier, String> {
        let (vote, eligibility) = match (&self.vote_vkey, &self.eligibility_vkey) {
            (Some(vote), Some(eligibility)) => (vote, eligibility),
            _ => {
                return Err(
                    "SEALEDBALLOT_VOTE_VKEY and SEALEDBALLOT_ELIGIBILITY_VKEY must be set".to_owned(),
                )
            }
        };
        let verifier = ProofVerifier::new();
        verifier
            .initialize_from_files(vote, eligibility)
            .map_err(|e| e.to_string())?;
        Ok(verifier)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("{} has an invalid value {:?}", name, value))
}
