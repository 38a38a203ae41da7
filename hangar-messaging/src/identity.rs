//! Identity collaborator: who the other members are and what they look like.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::Profile;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Every known member except `excluding_id`, in the provider's listing order.
    async fn list_other_users(&self, excluding_id: &str) -> Result<Vec<Profile>, StoreError>;

    async fn get_user(&self, id: &str) -> Result<Option<Profile>, StoreError>;

    /// Batch lookup; unknown ids are absent from the result.
    async fn get_users(&self, ids: &[String]) -> Result<HashMap<String, Profile>, StoreError> {
        let mut found = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(profile) = self.get_user(id).await? {
                found.insert(id.clone(), profile);
            }
        }
        Ok(found)
    }
}

/// In-memory member directory. Listing order is registration order.
#[derive(Default)]
pub struct Directory {
    profiles: RwLock<Vec<Profile>>,
    offline: AtomicBool,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profiles(profiles: impl IntoIterator<Item = Profile>) -> Self {
        let directory = Self::new();
        for profile in profiles {
            directory.upsert(profile);
        }
        directory
    }

    /// Add a member, or replace the snapshot of an existing one in place.
    pub fn upsert(&self, profile: Profile) {
        if let Ok(mut profiles) = self.profiles.write() {
            match profiles.iter_mut().find(|p| p.id == profile.id) {
                Some(existing) => *existing = profile,
                None => profiles.push(profile),
            }
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::Acquire) {
            Err(StoreError::Unavailable("identity provider is offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Vec<Profile>>, StoreError> {
        self.profiles
            .read()
            .map_err(|e| StoreError::Backend(format!("directory lock poisoned: {}", e)))
    }
}

#[async_trait]
impl IdentityProvider for Directory {
    async fn list_other_users(&self, excluding_id: &str) -> Result<Vec<Profile>, StoreError> {
        self.check_online()?;
        Ok(self
            .read()?
            .iter()
            .filter(|p| p.id != excluding_id)
            .cloned()
            .collect())
    }

    async fn get_user(&self, id: &str) -> Result<Option<Profile>, StoreError> {
        self.check_online()?;
        Ok(self.read()?.iter().find(|p| p.id == id).cloned())
    }

    async fn get_users(&self, ids: &[String]) -> Result<HashMap<String, Profile>, StoreError> {
        self.check_online()?;
        Ok(self
            .read()?
            .iter()
            .filter(|p| ids.contains(&p.id))
            .map(|p| (p.id.clone(), p.clone()))
            .collect())
    }
}
