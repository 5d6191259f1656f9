//! User to secretary mappings
//!
//! Process-wide registry of which secretaries each user may reach. The
//! transports turn it into a [`CallerScope`] per upstream session.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tokio::sync::RwLock;

/// Secretaries a caller may see and call; `None` means unrestricted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerScope {
    allowed: Option<HashSet<String>>,
}

impl CallerScope {
    pub fn unrestricted() -> Self {
        Self { allowed: None }
    }

    pub fn only(secretaries: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed: Some(secretaries.into_iter().collect()),
        }
    }

    pub fn allows(&self, secretary_name: &str) -> bool {
        match &self.allowed {
            Some(allowed) => allowed.contains(secretary_name),
            None => true,
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.allowed.is_none()
    }
}

#[derive(Default)]
pub struct UserSecretaryRegistry {
    mappings: RwLock<HashMap<String, HashSet<String>>>,
}

impl UserSecretaryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the mapping already existed
    pub async fn register(&self, user_id: &str, secretary_name: &str) -> bool {
        let added = self
            .mappings
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .insert(secretary_name.to_string());
        if added {
            tracing::info!(user_id = %user_id, secretary = %secretary_name, "Registered secretary for user");
        }
        added
    }

    /// Returns false if the mapping did not exist
    pub async fn unregister(&self, user_id: &str, secretary_name: &str) -> bool {
        let mut mappings = self.mappings.write().await;
        let Some(secretaries) = mappings.get_mut(user_id) else {
            return false;
        };
        let removed = secretaries.remove(secretary_name);
        if secretaries.is_empty() {
            mappings.remove(user_id);
        }
        if removed {
            tracing::info!(user_id = %user_id, secretary = %secretary_name, "Unregistered secretary for user");
        }
        removed
    }

    /// Drop every mapping of a user. Returns how many were removed.
    pub async fn unregister_all(&self, user_id: &str) -> usize {
        let removed = self
            .mappings
            .write()
            .await
            .remove(user_id)
            .map(|s| s.len())
            .unwrap_or(0);
        tracing::info!(user_id = %user_id, count = removed, "Unregistered all secretaries for user");
        removed
    }

    /// Sorted copy of every mapping
    pub async fn mappings(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.mappings
            .read()
            .await
            .iter()
            .map(|(user, secretaries)| (user.clone(), secretaries.iter().cloned().collect()))
            .collect()
    }

    pub async fn secretaries_for(&self, user_id: &str) -> HashSet<String> {
        self.mappings
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Scope enforced for one upstream caller
    pub async fn scope_for(&self, user_id: Option<&str>) -> CallerScope {
        match user_id {
            None => CallerScope::unrestricted(),
            Some(user) => CallerScope::only(self.secretaries_for(user).await),
        }
    }
}
