// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Cluster-facing collaborators consumed by the reconciliation pass.
//!
//! The pass never talks to the Kubernetes API directly. It goes through
//! [`ClusterClient`] for workload and registration objects and through
//! [`NetworkInventory`] for secondary-network declarations. The production
//! implementations live in [`crate::kube_client`]; integration tests use in-memory
//! fakes.
//!
//! # Idempotence
//!
//! Every object the operator submits carries a [`SPEC_HASH_ANNOTATION`] computed by
//! [`stamp_spec_hash`]. Implementations compare it against the live object to tell an
//! unchanged re-apply from a real update without diffing server-defaulted fields.

use crate::errors::ClusterError;
use crate::labels::SPEC_HASH_ANNOTATION;
use crate::registration::RegistrationVariant;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::Service;
use kube::Resource;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Result of a create or create-or-update call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    /// The live object already carries the same spec hash
    Unchanged,
}

impl ApplyOutcome {
    /// True when the call changed cluster state.
    #[must_use]
    pub fn mutated(self) -> bool {
        !matches!(self, Self::Unchanged)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Result of a delete call. Deleting an absent object is a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyAbsent,
}

/// Driver registration object, independent of the API variant that stores it.
///
/// All fields are immutable once created; a change requires delete and re-create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverRegistration {
    /// Driver name, e.g. `rook-ceph.rbd.csi.ceph.com`
    pub name: String,
    pub attach_required: bool,
    pub pod_info_on_mount: bool,
    pub fs_group_policy: Option<String>,
}

/// A storage cluster network declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkDeclaration {
    /// Name of the declaring object
    pub name: String,
    /// Secondary network attachments (`namespace/name` of attachment definitions)
    pub secondary_attachments: Vec<String>,
}

impl NetworkDeclaration {
    #[must_use]
    pub fn uses_secondary_attachment(&self) -> bool {
        !self.secondary_attachments.is_empty()
    }
}

/// Create, update, delete and lookup primitives against the cluster.
///
/// Namespaced calls take the namespace from the object's metadata. `delete_*`
/// calls must report an absent object as [`DeleteOutcome::AlreadyAbsent`], never
/// as an error.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Number of nodes in the cluster.
    async fn node_count(&self) -> Result<usize, ClusterError>;

    /// Create-only. Returns [`ApplyOutcome::Unchanged`] if an object with the same
    /// spec hash exists and [`ClusterError::Conflict`] if the live spec differs.
    async fn create_daemon_set(&self, daemon_set: &DaemonSet)
        -> Result<ApplyOutcome, ClusterError>;

    async fn create_or_update_deployment(
        &self,
        deployment: &Deployment,
    ) -> Result<ApplyOutcome, ClusterError>;

    async fn create_or_update_service(&self, service: &Service)
        -> Result<ApplyOutcome, ClusterError>;

    async fn delete_daemon_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DeleteOutcome, ClusterError>;

    async fn delete_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DeleteOutcome, ClusterError>;

    async fn delete_service(&self, namespace: &str, name: &str)
        -> Result<DeleteOutcome, ClusterError>;

    /// Look up a cluster-scoped registration object of the given variant.
    async fn get_registration(
        &self,
        variant: RegistrationVariant,
        name: &str,
    ) -> Result<Option<DriverRegistration>, ClusterError>;

    async fn create_registration(
        &self,
        variant: RegistrationVariant,
        registration: &DriverRegistration,
    ) -> Result<(), ClusterError>;

    async fn delete_registration(
        &self,
        variant: RegistrationVariant,
        name: &str,
    ) -> Result<DeleteOutcome, ClusterError>;
}

/// Source of secondary-network declarations.
#[async_trait]
pub trait NetworkInventory: Send + Sync {
    /// Network declarations visible in `namespace`.
    async fn list_network_declarations(
        &self,
        namespace: &str,
    ) -> Result<Vec<NetworkDeclaration>, ClusterError>;
}

/// SHA-256 over the JSON form of `object`, hex encoded.
///
/// # Errors
///
/// Returns [`ClusterError::Other`] if the object cannot be serialized.
pub fn spec_hash<T: Serialize>(object: &T) -> Result<String, ClusterError> {
    let bytes = serde_json::to_vec(object)
        .map_err(|e| ClusterError::Other(format!("failed to serialize object: {e}")))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compute the spec hash of `object` (ignoring any previous stamp) and record it
/// in its annotations.
///
/// # Errors
///
/// Returns [`ClusterError::Other`] if the object cannot be serialized.
pub fn stamp_spec_hash<K>(object: &mut K) -> Result<String, ClusterError>
where
    K: Resource + Serialize,
{
    let meta = object.meta_mut();
    if let Some(annotations) = meta.annotations.as_mut() {
        annotations.remove(SPEC_HASH_ANNOTATION);
        if annotations.is_empty() {
            meta.annotations = None;
        }
    }
    let hash = spec_hash(object)?;
    object
        .meta_mut()
        .annotations
        .get_or_insert_with(Default::default)
        .insert(SPEC_HASH_ANNOTATION.to_string(), hash.clone());
    Ok(hash)
}

/// Spec hash recorded on `object`, if any.
#[must_use]
pub fn recorded_spec_hash<K: Resource>(object: &K) -> Option<&str> {
    object
        .meta()
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(SPEC_HASH_ANNOTATION))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn service(name: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("rook-ceph".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_stamp_is_stable_across_restamping() {
        let mut first = service("csi-rbdplugin-metrics");
        let hash = stamp_spec_hash(&mut first).unwrap();
        assert_eq!(recorded_spec_hash(&first), Some(hash.as_str()));

        let mut again = first.clone();
        assert_eq!(stamp_spec_hash(&mut again).unwrap(), hash);
    }

    #[test]
    fn test_stamp_changes_with_spec() {
        let mut rbd = service("csi-rbdplugin-metrics");
        let mut cephfs = service("csi-cephfsplugin-metrics");
        assert_ne!(
            stamp_spec_hash(&mut rbd).unwrap(),
            stamp_spec_hash(&mut cephfs).unwrap()
        );
    }

    #[test]
    fn test_unstamped_object_has_no_hash() {
        assert_eq!(recorded_spec_hash(&service("plain")), None);
    }

    #[test]
    fn test_network_declaration_secondary_flag() {
        let mut declaration = NetworkDeclaration {
            name: "my-cluster".to_string(),
            ..Default::default()
        };
        assert!(!declaration.uses_secondary_attachment());
        declaration
            .secondary_attachments
            .push("rook-ceph/public-net".to_string());
        assert!(declaration.uses_secondary_attachment());
    }
}
