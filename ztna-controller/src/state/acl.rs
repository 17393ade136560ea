//! In-memory ACL store: resources and authorization edges.
//!
//! The controller owns this state; connectors receive it as deltas over
//! the control stream and re-sync from a full snapshot on reconnect.
//! Edges reference resources by id, never by pointer.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;

use ztna_proto::message::{AclAuthorization, AclFilter, AclResource};

#[derive(Debug, thiserror::Error)]
pub enum AclError {
    #[error("resource id required")]
    MissingResourceId,
    #[error("invalid resource type")]
    InvalidResourceType,
    #[error("resource address required")]
    MissingAddress,
    #[error("resource_id and principal_spiffe required")]
    MissingEdgeKey,
}

/// A copy-out of the whole store.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AclState {
    pub resources: Vec<AclResource>,
    pub authorizations: Vec<AclAuthorization>,
}

#[derive(Debug, Default)]
struct Inner {
    resources: HashMap<String, AclResource>,
    authorizations: HashMap<(String, String), AclAuthorization>,
}

#[derive(Debug, Default)]
pub struct AclStore {
    inner: RwLock<Inner>,
}

impl AclStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store from persisted state at startup.
    pub fn load(&self, resources: Vec<AclResource>, authorizations: Vec<AclAuthorization>) {
        let mut inner = self.inner.write();
        inner.resources = resources.into_iter().map(|r| (r.id.clone(), r)).collect();
        inner.authorizations = authorizations
            .into_iter()
            .map(|a| ((a.principal_spiffe.clone(), a.resource_id.clone()), a))
            .collect();
    }

    pub fn snapshot(&self) -> AclState {
        let inner = self.inner.read();
        AclState {
            resources: inner.resources.values().cloned().collect(),
            authorizations: inner.authorizations.values().cloned().collect(),
        }
    }

    pub fn upsert_resource(&self, resource: AclResource) -> Result<(), AclError> {
        if resource.id.is_empty() {
            return Err(AclError::MissingResourceId);
        }
        if !matches!(resource.resource_type.as_str(), "cidr" | "dns" | "internet") {
            return Err(AclError::InvalidResourceType);
        }
        if resource.resource_type != "internet" && resource.address.is_empty() {
            return Err(AclError::MissingAddress);
        }
        self.inner
            .write()
            .resources
            .insert(resource.id.clone(), resource);
        Ok(())
    }

    /// Remove a resource and every edge pointing at it.
    pub fn delete_resource(&self, id: &str) {
        let mut inner = self.inner.write();
        inner.resources.remove(id);
        inner.authorizations.retain(|_, a| a.resource_id != id);
    }

    pub fn assign(
        &self,
        resource_id: &str,
        principal_spiffe: &str,
        filters: Vec<AclFilter>,
    ) -> Result<AclAuthorization, AclError> {
        if resource_id.is_empty() || principal_spiffe.is_empty() {
            return Err(AclError::MissingEdgeKey);
        }
        let auth = AclAuthorization {
            principal_spiffe: principal_spiffe.to_string(),
            resource_id: resource_id.to_string(),
            filters,
            expires_at: None,
            description: None,
        };
        self.inner.write().authorizations.insert(
            (principal_spiffe.to_string(), resource_id.to_string()),
            auth.clone(),
        );
        Ok(auth)
    }

    pub fn remove_assignment(&self, resource_id: &str, principal_spiffe: &str) {
        self.inner
            .write()
            .authorizations
            .remove(&(principal_spiffe.to_string(), resource_id.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(id: &str, kind: &str, address: &str) -> AclResource {
        AclResource {
            id: id.to_string(),
            resource_type: kind.to_string(),
            address: address.to_string(),
            remote_network_id: None,
        }
    }

    #[test]
    fn upsert_validates() {
        let store = AclStore::new();
        assert!(store.upsert_resource(resource("", "dns", "x")).is_err());
        assert!(store.upsert_resource(resource("r", "bogus", "x")).is_err());
        assert!(store.upsert_resource(resource("r", "dns", "")).is_err());
        // Internet resources may omit the address.
        assert!(store.upsert_resource(resource("r", "internet", "")).is_ok());
    }

    #[test]
    fn delete_cascades_edges() {
        let store = AclStore::new();
        store
            .upsert_resource(resource("res-1", "dns", "db.internal"))
            .unwrap();
        store.assign("res-1", "identity-1", Vec::new()).unwrap();
        store.assign("res-1", "identity-2", Vec::new()).unwrap();

        store.delete_resource("res-1");
        let state = store.snapshot();
        assert!(state.resources.is_empty());
        assert!(state.authorizations.is_empty());
    }

    #[test]
    fn repeated_upsert_is_idempotent() {
        let store = AclStore::new();
        let res = resource("res-1", "dns", "db.internal");
        store.upsert_resource(res.clone()).unwrap();
        store.upsert_resource(res.clone()).unwrap();
        let state = store.snapshot();
        assert_eq!(state.resources.len(), 1);
        assert_eq!(state.resources[0], res);

        store.assign("res-1", "identity-1", Vec::new()).unwrap();
        store.assign("res-1", "identity-1", Vec::new()).unwrap();
        assert_eq!(store.snapshot().authorizations.len(), 1);
    }

    #[test]
    fn load_replaces_state() {
        let store = AclStore::new();
        store
            .upsert_resource(resource("old", "dns", "old.internal"))
            .unwrap();
        store.load(vec![resource("new", "dns", "new.internal")], Vec::new());
        let state = store.snapshot();
        assert_eq!(state.resources.len(), 1);
        assert_eq!(state.resources[0].id, "new");
    }
}
