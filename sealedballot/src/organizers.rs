use crate::*;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

/// An action gated by the registry
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Permission {
    SetupEncryption,
    DecryptVotes,
    AddCoOrganizers,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Permission::SetupEncryption => "canSetupEncryption",
            Permission::DecryptVotes => "canDecryptVotes",
            Permission::AddCoOrganizers => "canAddCoOrganizers",
        };
        f.write_str(name)
    }
}

/// Stored permission flags of a co-organizer
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    pub can_setup_encryption: bool,
    pub can_decrypt_votes: bool,
    pub can_add_co_organizers: bool,
}

impl Default for Permissions {
    fn default() -> Self {
        Permissions {
            can_setup_encryption: true,
            can_decrypt_votes: true,
            can_add_co_organizers: false,
        }
    }
}

impl Permissions {
    pub fn allows(&self, permission: Permission) -> bool {
        match permission {
            Permission::SetupEncryption => self.can_setup_encryption,
            Permission::DecryptVotes => self.can_decrypt_votes,
            Permission::AddCoOrganizers => self.can_add_co_organizers,
        }
    }
}

/// Partial permissions; omitted flags keep their current (or default) value
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_setup_encryption: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_decrypt_votes: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_add_co_organizers: Option<bool>,
}

impl PermissionUpdate {
    pub fn apply(&self, base: Permissions) -> Permissions {
        Permissions {
            can_setup_encryption: self.can_setup_encryption.unwrap_or(base.can_setup_encryption),
            can_decrypt_votes: self.can_decrypt_votes.unwrap_or(base.can_decrypt_votes),
            can_add_co_organizers: self
                .can_add_co_organizers
                .unwrap_or(base.can_add_co_organizers),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CoOrganizer {
    pub address: String,
    pub added_at: u64,
    pub added_by: String,
    pub permissions: Permissions,
}

/// The organizer record of one election
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ElectionOrganizers {
    pub election_id: ElectionId,
    pub primary_organizer: String,
    pub co_organizers: Vec<CoOrganizer>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ElectionOrganizers {
    fn co_organizer(&self, address: &str) -> Option<&CoOrganizer> {
        self.co_organizers.iter().find(|c| c.address == address)
    }

    /// The primary organizer holds every permission; others need the stored flag
    pub fn allows(&self, address: &str, permission: Permission) -> bool {
        let address = normalize_address(address);
        if address == self.primary_organizer {
            return true;
        }
        self.co_organizer(&address)
            .map(|c| c.permissions.allows(permission))
            .unwrap_or(false)
    }

    pub fn is_organizer(&self, address: &str) -> bool {
        let address = normalize_address(address);
        address == self.primary_organizer || self.co_organizer(&address).is_some()
    }
}

/// Primary and co-organizers of every election, mirrored to disk
///
/// Each election record sits behind its own mutex, so changes to one election serialize
/// without blocking another. No disk write happens under the `elections` lock.
#[derive(Default)]
pub struct AuthorizationRegistry {
    elections: RwLock<HashMap<ElectionId, Arc<Mutex<ElectionOrganizers>>>>,

    // held by `initialize`, the only writer of new entries, across its disk write
    init_lock: Mutex<()>,

    dir: Option<PathBuf>,
}

impl AuthorizationRegistry {
    /// A registry that is not persisted
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `organizers-<id>.json` in `dir`, creating it if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        ensure_private_dir(&dir)?;

        let mut elections = HashMap::new();
        let entries = fs::read_dir(&dir).map_err(|e| StorageError::io(&dir, e))?;
        for entry in entries {
            let path = entry.map_err(|e| StorageError::io(&dir, e))?.path();
            let is_record = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("organizers-") && n.ends_with(".json"))
                .unwrap_or(false);
            if !is_record {
                continue;
            }
            if let Some(record) = read_json::<ElectionOrganizers>(&path)? {
                elections.insert(record.election_id, Arc::new(Mutex::new(record)));
            }
        }
        tracing::info!("loaded organizers for {} elections", elections.len());

        Ok(AuthorizationRegistry {
            elections: RwLock::new(elections),
            init_lock: Mutex::new(()),
            dir: Some(dir),
        })
    }

    fn record_path(dir: &Path, election_id: ElectionId) -> PathBuf {
        dir.join(format!("organizers-{}.json", election_id))
    }

    fn persist(&self, record: &ElectionOrganizers) -> Result<(), StorageError> {
        if let Some(dir) = &self.dir {
            write_json_atomic(&Self::record_path(dir, record.election_id), record)?;
        }
        Ok(())
    }

    fn record(&self, election_id: ElectionId) -> Result<Arc<Mutex<ElectionOrganizers>>, Error> {
        let elections = self.elections.read()?;
        elections
            .get(&election_id)
            .cloned()
            .ok_or_else(|| ValidationError::ElectionNotInitialized(election_id).into())
    }

    /// Record the primary organizer. Re-initializing is a logged no-op.
    pub fn initialize(
        &self,
        election_id: ElectionId,
        primary_organizer: &str,
    ) -> Result<ElectionOrganizers, Error> {
        let _init = self.init_lock.lock()?;
        let existing = self.elections.read()?.get(&election_id).cloned();
        if let Some(existing) = existing {
            tracing::warn!("organizers already initialized for election {}", election_id);
            return Ok(existing.lock()?.clone());
        }

        let now = now_millis();
        let record = ElectionOrganizers {
            election_id,
            primary_organizer: normalize_address(primary_organizer),
            co_organizers: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.persist(&record)?;
        self.elections
            .write()?
            .insert(election_id, Arc::new(Mutex::new(record.clone())));

        tracing::info!(
            "organizers initialized for election {} (primary: {})",
            election_id,
            record.primary_organizer
        );
        Ok(record)
    }

    // Apply `f` to a copy of the record, persist it, then commit it in memory
    fn mutate<T, F>(&self, election_id: ElectionId, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut ElectionOrganizers) -> Result<T, Error>,
    {
        let record = self.record(election_id)?;
        let mut guard = record.lock()?;
        let mut updated = guard.clone();
        let out = f(&mut updated)?;
        updated.updated_at = now_millis();
        self.persist(&updated)?;
        *guard = updated;
        Ok(out)
    }

    fn authorize(
        record: &ElectionOrganizers,
        actor: &str,
        permission: Permission,
    ) -> Result<(), AuthorizationError> {
        if record.allows(actor, permission) {
            return Ok(());
        }
        Err(AuthorizationError {
            election_id: record.election_id,
            address: normalize_address(actor),
            permission,
        })
    }

    /// `added_by` must hold `canAddCoOrganizers`
    pub fn add_co_organizer(
        &self,
        election_id: ElectionId,
        address: &str,
        added_by: &str,
        permissions: PermissionUpdate,
    ) -> Result<CoOrganizer, Error> {
        let address = normalize_address(address);
        let co_organizer = self.mutate(election_id, |record| {
            Self::authorize(record, added_by, Permission::AddCoOrganizers)?;
            if address == record.primary_organizer {
                return Err(ValidationError::PrimaryAsCoOrganizer.into());
            }
            if record.co_organizer(&address).is_some() {
                return Err(ValidationError::AlreadyCoOrganizer(address.clone()).into());
            }

            let co_organizer = CoOrganizer {
                address: address.clone(),
                added_at: now_millis(),
                added_by: normalize_address(added_by),
                permissions: permissions.apply(Permissions::default()),
            };
            record.co_organizers.push(co_organizer.clone());
            Ok(co_organizer)
        })?;

        tracing::info!(
            "co-organizer {} added to election {} by {}",
            co_organizer.address,
            election_id,
            co_organizer.added_by
        );
        Ok(co_organizer)
    }

    /// `removed_by` must hold `canAddCoOrganizers`
    pub fn remove_co_organizer(
        &self,
        election_id: ElectionId,
        address: &str,
        removed_by: &str,
    ) -> Result<(), Error> {
        let address = normalize_address(address);
        self.mutate(election_id, |record| {
            Self::authorize(record, removed_by, Permission::AddCoOrganizers)?;
            let before = record.co_organizers.len();
            record.co_organizers.retain(|c| c.address != address);
            if record.co_organizers.len() == before {
                return Err(ValidationError::NotCoOrganizer(address.clone()).into());
            }
            Ok(())
        })?;

        tracing::info!(
            "co-organizer {} removed from election {} by {}",
            address,
            election_id,
            normalize_address(removed_by)
        );
        Ok(())
    }

    /// Merge `update` into a co-organizer's flags; `updated_by` must hold `canAddCoOrganizers`
    pub fn update_permissions(
        &self,
        election_id: ElectionId,
        address: &str,
        update: PermissionUpdate,
        updated_by: &str,
    ) -> Result<Permissions, Error> {
        let address = normalize_address(address);
        self.mutate(election_id, |record| {
            Self::authorize(record, updated_by, Permission::AddCoOrganizers)?;
            let co_organizer = record
                .co_organizers
                .iter_mut()
                .find(|c| c.address == address)
                .ok_or_else(|| ValidationError::NotCoOrganizer(address.clone()))?;
            co_organizer.permissions = update.apply(co_organizer.permissions);
            tracing::info!(
                "permissions of {} updated for election {}",
                address,
                election_id
            );
            Ok(co_organizer.permissions)
        })
    }

    /// Permission lookup; unknown elections and addresses get `false`
    pub fn has_permission(
        &self,
        election_id: ElectionId,
        address: &str,
        permission: Permission,
    ) -> bool {
        let record = match self.record(election_id) {
            Ok(record) => record,
            Err(_) => return false,
        };
        let allowed = match record.lock() {
            Ok(record) => record.allows(address, permission),
            Err(_) => false,
        };
        allowed
    }

    /// `Ok` if `address` holds `permission`, `AuthorizationError` otherwise
    pub fn require(
        &self,
        election_id: ElectionId,
        address: &str,
        permission: Permission,
    ) -> Result<(), Error> {
        let record = self.record(election_id)?;
        let record = record.lock()?;
        Self::authorize(&record, address, permission).map_err(|e| {
            tracing::warn!("{}", e);
            e.into()
        })
    }

    pub fn can_setup_encryption(&self, election_id: ElectionId, address: &str) -> bool {
        self.has_permission(election_id, address, Permission::SetupEncryption)
    }

    pub fn can_decrypt_votes(&self, election_id: ElectionId, address: &str) -> bool {
        self.has_permission(election_id, address, Permission::DecryptVotes)
    }

    pub fn can_add_co_organizers(&self, election_id: ElectionId, address: &str) -> bool {
        self.has_permission(election_id, address, Permission::AddCoOrganizers)
    }

    pub fn is_organizer(&self, election_id: ElectionId, address: &str) -> bool {
        match self.get_election_organizers(election_id) {
            Some(record) => record.is_organizer(address),
            None => false,
        }
    }

    /// Empty for an uninitialized election
    pub fn get_co_organizers(&self, election_id: ElectionId) -> Vec<CoOrganizer> {
        self.get_election_organizers(election_id)
            .map(|record| record.co_organizers)
            .unwrap_or_default()
    }

    pub fn get_election_organizers(&self, election_id: ElectionId) -> Option<ElectionOrganizers> {
        let record = self.record(election_id).ok()?;
        let record = record.lock().ok()?;
        Some(record.clone())
    }
}
