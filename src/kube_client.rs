// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! kube-rs implementations of the cluster collaborators.
//!
//! [`KubeClusterClient`] applies workloads with server-side apply and skips the patch
//! when the live object already carries the same spec hash. Registrations use the
//! typed `storage.k8s.io/v1` `CSIDriver` for the current variant and a dynamic
//! object for the legacy `v1beta1` one, which `k8s-openapi` no longer ships.
//!
//! [`KubeNetworkInventory`] reads the network section of the storage cluster
//! resources in the operator namespace.

use crate::cluster::{
    recorded_spec_hash, ApplyOutcome, ClusterClient, DeleteOutcome, DriverRegistration,
    NetworkDeclaration, NetworkInventory,
};
use crate::constants::FIELD_MANAGER;
use crate::errors::{is_already_exists, is_not_found, ClusterError, SetupError};
use crate::labels::{K8S_MANAGED_BY, MANAGED_BY_CSI_OPERATOR};
use crate::overrides::OwnerInfo;
use crate::registration::RegistrationVariant;
use crate::version::ClusterVersion;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Node, Service};
use k8s_openapi::api::storage::v1::{CSIDriver, CSIDriverSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams,
    PostParams,
};
use kube::core::NamespaceResourceScope;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::{debug, info};

/// Storage cluster custom resource carrying the network declaration
const STORAGE_CLUSTER_GROUP: &str = "ceph.rook.io";
const STORAGE_CLUSTER_VERSION: &str = "v1";
const STORAGE_CLUSTER_KIND: &str = "CephCluster";
const STORAGE_CLUSTER_PLURAL: &str = "cephclusters";
const MULTUS_PROVIDER: &str = "multus";

/// [`ClusterClient`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn legacy_registrations(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &legacy_registration_resource())
    }

    fn current_registrations(&self) -> Api<CSIDriver> {
        Api::all(self.client.clone())
    }
}

fn legacy_registration_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk("storage.k8s.io", "v1beta1", "CSIDriver");
    ApiResource::from_gvk_with_plural(&gvk, "csidrivers")
}

/// Namespace and name of an object about to be submitted.
fn identity<T: Resource<DynamicType = ()>>(object: &T) -> Result<(String, String), ClusterError> {
    let kind = T::kind(&()).to_string();
    let name = object
        .meta()
        .name
        .clone()
        .ok_or_else(|| ClusterError::MissingMetadata {
            kind: kind.clone(),
            field: "name",
        })?;
    let namespace = object
        .meta()
        .namespace
        .clone()
        .ok_or(ClusterError::MissingMetadata {
            kind,
            field: "namespace",
        })?;
    Ok((namespace, name))
}

/// True when both objects carry the same spec hash.
fn same_spec<T: Resource>(live: &T, desired: &T) -> bool {
    matches!(
        (recorded_spec_hash(live), recorded_spec_hash(desired)),
        (Some(live), Some(desired)) if live == desired
    )
}

/// Create `object`, or report it unchanged when the live one matches.
///
/// A live object with a different spec is left alone and reported as a conflict.
async fn create_only<T>(client: &Client, object: &T) -> Result<ApplyOutcome, ClusterError>
where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned,
{
    let (namespace, name) = identity(object)?;
    let kind = T::kind(&()).to_string();
    let api: Api<T> = Api::namespaced(client.clone(), &namespace);

    if let Some(live) = api.get_opt(&name).await? {
        if same_spec(&live, object) {
            debug!(kind = %kind, name = %name, "Object already exists with the same spec");
            return Ok(ApplyOutcome::Unchanged);
        }
        return Err(ClusterError::Conflict { kind, name });
    }

    match api.create(&PostParams::default(), object).await {
        Ok(_) => {
            info!(kind = %kind, name = %name, namespace = %namespace, "Created object");
            Ok(ApplyOutcome::Created)
        }
        Err(e) if is_already_exists(&e) => Err(ClusterError::Conflict { kind, name }),
        Err(e) => Err(e.into()),
    }
}

/// Create `object`, or server-side apply it when the live spec hash differs.
async fn create_or_apply<T>(client: &Client, object: &T) -> Result<ApplyOutcome, ClusterError>
where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned,
{
    let (namespace, name) = identity(object)?;
    let kind = T::kind(&()).to_string();
    let api: Api<T> = Api::namespaced(client.clone(), &namespace);

    match api.get_opt(&name).await? {
        Some(live) if same_spec(&live, object) => {
            debug!(kind = %kind, name = %name, "Object is up to date");
            Ok(ApplyOutcome::Unchanged)
        }
        Some(_) => {
            info!(kind = %kind, name = %name, namespace = %namespace, "Updating object");
            api.patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(object),
            )
            .await?;
            Ok(ApplyOutcome::Updated)
        }
        None => {
            info!(kind = %kind, name = %name, namespace = %namespace, "Creating object");
            api.create(&PostParams::default(), object).await?;
            Ok(ApplyOutcome::Created)
        }
    }
}

async fn delete_namespaced<T>(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<DeleteOutcome, ClusterError>
where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    delete_with(&api, name).await
}

async fn delete_with<T>(api: &Api<T>, name: &str) -> Result<DeleteOutcome, ClusterError>
where
    T: Resource + Clone + Debug + DeserializeOwned,
{
    match api.delete(name, &DeleteParams::foreground()).await {
        Ok(_) => Ok(DeleteOutcome::Deleted),
        Err(e) if is_not_found(&e) => Ok(DeleteOutcome::AlreadyAbsent),
        Err(e) => Err(e.into()),
    }
}

fn registration_meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        labels: Some(BTreeMap::from([(
            K8S_MANAGED_BY.to_string(),
            MANAGED_BY_CSI_OPERATOR.to_string(),
        )])),
        ..Default::default()
    }
}

/// Registration fields of a typed `storage.k8s.io/v1` object.
fn from_current(name: String, spec: &CSIDriverSpec) -> DriverRegistration {
    DriverRegistration {
        name,
        attach_required: spec.attach_required.unwrap_or(true),
        pod_info_on_mount: spec.pod_info_on_mount.unwrap_or(false),
        fs_group_policy: spec.fs_group_policy.clone(),
    }
}

/// Registration fields of a dynamic `storage.k8s.io/v1beta1` object.
fn from_legacy(name: String, data: &Value) -> DriverRegistration {
    let spec = &data["spec"];
    DriverRegistration {
        name,
        attach_required: spec["attachRequired"].as_bool().unwrap_or(true),
        pod_info_on_mount: spec["podInfoOnMount"].as_bool().unwrap_or(false),
        fs_group_policy: spec["fsGroupPolicy"].as_str().map(str::to_string),
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn node_count(&self) -> Result<usize, ClusterError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.list_metadata(&ListParams::default()).await?.items.len())
    }

    async fn create_daemon_set(&self, daemon_set: &DaemonSet) -> Result<ApplyOutcome, ClusterError> {
        create_only(&self.client, daemon_set).await
    }

    async fn create_or_update_deployment(
        &self,
        deployment: &Deployment,
    ) -> Result<ApplyOutcome, ClusterError> {
        create_or_apply(&self.client, deployment).await
    }

    async fn create_or_update_service(&self, service: &Service) -> Result<ApplyOutcome, ClusterError> {
        create_or_apply(&self.client, service).await
    }

    async fn delete_daemon_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DeleteOutcome, ClusterError> {
        delete_namespaced::<DaemonSet>(&self.client, namespace, name).await
    }

    async fn delete_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DeleteOutcome, ClusterError> {
        delete_namespaced::<Deployment>(&self.client, namespace, name).await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<DeleteOutcome, ClusterError> {
        delete_namespaced::<Service>(&self.client, namespace, name).await
    }

    async fn get_registration(
        &self,
        variant: RegistrationVariant,
        name: &str,
    ) -> Result<Option<DriverRegistration>, ClusterError> {
        Ok(match variant {
            RegistrationVariant::Current => self
                .current_registrations()
                .get_opt(name)
                .await?
                .map(|driver| from_current(driver.name_any(), &driver.spec)),
            RegistrationVariant::Legacy => self
                .legacy_registrations()
                .get_opt(name)
                .await?
                .map(|driver| from_legacy(driver.name_any(), &driver.data)),
        })
    }

    async fn create_registration(
        &self,
        variant: RegistrationVariant,
        registration: &DriverRegistration,
    ) -> Result<(), ClusterError> {
        match variant {
            RegistrationVariant::Current => {
                let driver = CSIDriver {
                    metadata: registration_meta(&registration.name),
                    spec: CSIDriverSpec {
                        attach_required: Some(registration.attach_required),
                        pod_info_on_mount: Some(registration.pod_info_on_mount),
                        fs_group_policy: registration.fs_group_policy.clone(),
                        ..Default::default()
                    },
                };
                self.current_registrations()
                    .create(&PostParams::default(), &driver)
                    .await?;
            }
            RegistrationVariant::Legacy => {
                let resource = legacy_registration_resource();
                let mut driver = DynamicObject::new(&registration.name, &resource).data(json!({
                    "spec": {
                        "attachRequired": registration.attach_required,
                        "podInfoOnMount": registration.pod_info_on_mount,
                        "fsGroupPolicy": registration.fs_group_policy,
                    }
                }));
                driver.metadata.labels = registration_meta(&registration.name).labels;
                self.legacy_registrations()
                    .create(&PostParams::default(), &driver)
                    .await?;
            }
        }
        Ok(())
    }

    async fn delete_registration(
        &self,
        variant: RegistrationVariant,
        name: &str,
    ) -> Result<DeleteOutcome, ClusterError> {
        match variant {
            RegistrationVariant::Current => delete_with(&self.current_registrations(), name).await,
            RegistrationVariant::Legacy => delete_with(&self.legacy_registrations(), name).await,
        }
    }
}

/// [`NetworkInventory`] reading `CephCluster` network settings.
#[derive(Clone)]
pub struct KubeNetworkInventory {
    client: Client,
}

impl KubeNetworkInventory {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Network declaration of one storage cluster object.
///
/// Only the multus provider uses secondary attachments; its selectors name the
/// attachment definitions.
#[must_use]
pub fn network_declaration(object: &DynamicObject) -> NetworkDeclaration {
    let network = &object.data["spec"]["network"];
    let mut secondary_attachments: Vec<String> =
        if network["provider"].as_str() == Some(MULTUS_PROVIDER) {
            network["selectors"]
                .as_object()
                .map(|selectors| {
                    selectors
                        .values()
                        .filter_map(Value::as_str)
                        .map(str::trim)
                        .filter(|selector| !selector.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        } else {
            Vec::new()
        };
    secondary_attachments.sort();
    NetworkDeclaration {
        name: object.name_any(),
        secondary_attachments,
    }
}

#[async_trait]
impl NetworkInventory for KubeNetworkInventory {
    async fn list_network_declarations(
        &self,
        namespace: &str,
    ) -> Result<Vec<NetworkDeclaration>, ClusterError> {
        let gvk = GroupVersionKind::gvk(
            STORAGE_CLUSTER_GROUP,
            STORAGE_CLUSTER_VERSION,
            STORAGE_CLUSTER_KIND,
        );
        let resource = ApiResource::from_gvk_with_plural(&gvk, STORAGE_CLUSTER_PLURAL);
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &resource);

        match api.list(&ListParams::default()).await {
            Ok(list) => Ok(list.items.iter().map(network_declaration).collect()),
            // The storage cluster CRD is not installed
            Err(e) if is_not_found(&e) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Detect the cluster version from the API server.
///
/// # Errors
///
/// Returns [`SetupError::ClusterVersion`] when the request fails or the version is not numeric.
pub async fn detect_cluster_version(client: &Client) -> Result<ClusterVersion, SetupError> {
    let info = client
        .apiserver_version()
        .await
        .map_err(|e| SetupError::ClusterVersion(e.to_string()))?;
    ClusterVersion::from_info(&info)
}

/// Resolve the operator `Deployment` that owns every driver component.
///
/// # Errors
///
/// Returns [`SetupError::OwnerUnavailable`] when the deployment cannot be read or has no uid.
pub async fn resolve_owner(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<OwnerInfo, SetupError> {
    let unavailable = |reason: String| SetupError::OwnerUnavailable {
        kind: "Deployment".to_string(),
        name: name.to_string(),
        reason,
    };

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let deployment = deployments
        .get(name)
        .await
        .map_err(|e| unavailable(e.to_string()))?;
    let uid = deployment
        .metadata
        .uid
        .clone()
        .ok_or_else(|| unavailable("deployment has no uid".to_string()))?;

    Ok(OwnerInfo {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
        name: name.to_string(),
        uid,
    })
}

#[cfg(test)]
#[path = "kube_client_tests.rs"]
mod kube_client_tests;
