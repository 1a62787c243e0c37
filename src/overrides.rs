// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Per-component scheduling, resource and network overrides.
//!
//! # Resolution chains
//!
//! Placement (tolerations and node affinity) is resolved two levels deep:
//!
//! ```text
//! CSI_RBD_PLUGIN_TOLERATIONS  ->  CSI_PLUGIN_TOLERATIONS  ->  none
//! ```
//!
//! Resource overrides have no shared level:
//!
//! ```text
//! CSI_RBD_PROVISIONER_RESOURCE  ->  none
//! ```
//!
//! A malformed value is logged and treated as absent, so the chain continues with the
//! next level.
//!
//! # Formats
//!
//! - Tolerations: YAML list of `Toleration` objects. An entry without a key tolerates
//!   everything (`operator: Exists`).
//! - Node affinity: `key1=value1,value2; key2` where a key without values only has to
//!   exist on the node. All requirements must match.
//! - Resources: YAML list of `{name: <container>, resource: <ResourceRequirements>}`.

use crate::cluster::NetworkInventory;
use crate::constants::{
    PARAM_PLUGIN_NODE_AFFINITY, PARAM_PLUGIN_TOLERATIONS, PARAM_PROVISIONER_NODE_AFFINITY,
    PARAM_PROVISIONER_TOLERATIONS,
};
use crate::config::Parameters;
use crate::driver::DriverKind;
use crate::errors::{ClusterError, OwnerError};
use crate::labels::NETWORKS_ANNOTATION;
use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PodAffinityTerm, PodAntiAffinity, PodSpec, ResourceRequirements, Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta, OwnerReference,
};
use serde::Deserialize;
use tracing::{debug, warn};

/// Node label that spreads provisioner pods one per node
const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

/// Which workload of a driver an override applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentRole {
    /// Per-node `DaemonSet`
    Plugin,
    /// Cluster-level `Deployment`
    Provisioner,
}

/// Resolved tolerations and node affinity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Placement {
    pub tolerations: Vec<Toleration>,
    pub node_affinity: Option<NodeAffinity>,
}

/// Resource requirements for one named container.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContainerResources {
    pub name: String,
    pub resource: ResourceRequirements,
}

/// Everything resolved for one component.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverrideSpec {
    pub placement: Placement,
    pub resources: Vec<ContainerResources>,
}

/// Placement shared by every component of `role` that has no override of its own.
#[must_use]
pub fn shared_placement(params: &Parameters, role: ComponentRole) -> Placement {
    let (tolerations_key, affinity_key) = match role {
        ComponentRole::Plugin => (PARAM_PLUGIN_TOLERATIONS, PARAM_PLUGIN_NODE_AFFINITY),
        ComponentRole::Provisioner => {
            (PARAM_PROVISIONER_TOLERATIONS, PARAM_PROVISIONER_NODE_AFFINITY)
        }
    };
    Placement {
        tolerations: tolerations(params, tolerations_key).unwrap_or_default(),
        node_affinity: node_affinity(params, affinity_key),
    }
}

/// Placement for one component: its own keys first, then `shared`.
///
/// Tolerations and node affinity fall back independently.
#[must_use]
pub fn resolve_placement(
    params: &Parameters,
    kind: DriverKind,
    role: ComponentRole,
    shared: &Placement,
) -> Placement {
    let descriptor = kind.descriptor();
    let (tolerations_key, affinity_key) = match role {
        ComponentRole::Plugin => (
            descriptor.plugin_tolerations_param,
            descriptor.plugin_node_affinity_param,
        ),
        ComponentRole::Provisioner => (
            descriptor.provisioner_tolerations_param,
            descriptor.provisioner_node_affinity_param,
        ),
    };

    Placement {
        tolerations: tolerations(params, tolerations_key)
            .unwrap_or_else(|| shared.tolerations.clone()),
        node_affinity: node_affinity(params, affinity_key)
            .or_else(|| shared.node_affinity.clone()),
    }
}

/// Container resource overrides for one component.
#[must_use]
pub fn resolve_resources(
    params: &Parameters,
    kind: DriverKind,
    role: ComponentRole,
) -> Vec<ContainerResources> {
    let descriptor = kind.descriptor();
    let key = match role {
        ComponentRole::Plugin => descriptor.plugin_resource_param,
        ComponentRole::Provisioner => descriptor.provisioner_resource_param,
    };
    let Some(raw) = params.get(key) else {
        return Vec::new();
    };
    match serde_yaml::from_str::<Vec<ContainerResources>>(raw) {
        Ok(resources) => resources,
        Err(e) => {
            warn!(key, error = %e, "Failed to parse resource override, ignoring");
            Vec::new()
        }
    }
}

/// Full override set for one component.
#[must_use]
pub fn resolve_overrides(
    params: &Parameters,
    kind: DriverKind,
    role: ComponentRole,
) -> OverrideSpec {
    let shared = shared_placement(params, role);
    OverrideSpec {
        placement: resolve_placement(params, kind, role, &shared),
        resources: resolve_resources(params, kind, role),
    }
}

fn tolerations(params: &Parameters, key: &str) -> Option<Vec<Toleration>> {
    let raw = params.get(key)?;
    match serde_yaml::from_str::<Vec<Toleration>>(raw) {
        Ok(mut tolerations) => {
            for toleration in &mut tolerations {
                if toleration.key.as_deref().unwrap_or_default().is_empty() {
                    toleration.operator = Some("Exists".to_string());
                }
            }
            Some(tolerations)
        }
        Err(e) => {
            warn!(key, error = %e, "Failed to parse tolerations, falling back");
            None
        }
    }
}

fn node_affinity(params: &Parameters, key: &str) -> Option<NodeAffinity> {
    let raw = params.get(key)?;
    let affinity = parse_node_affinity(raw);
    if affinity.is_none() {
        warn!(key, value = raw, "Failed to parse node affinity, falling back");
    }
    affinity
}

/// Parse `key1=v1,v2; key2` into a required node affinity.
///
/// Returns `None` when no requirement could be parsed.
#[must_use]
pub fn parse_node_affinity(raw: &str) -> Option<NodeAffinity> {
    let mut expressions = Vec::new();
    for requirement in raw.split(';').map(str::trim).filter(|r| !r.is_empty()) {
        let (key, values) = match requirement.split_once('=') {
            Some((key, values)) => (key.trim(), values),
            None => (requirement, ""),
        };
        if key.is_empty() {
            return None;
        }
        let values: Vec<String> = values
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .collect();

        expressions.push(if values.is_empty() {
            NodeSelectorRequirement {
                key: key.to_string(),
                operator: "Exists".to_string(),
                values: None,
            }
        } else {
            NodeSelectorRequirement {
                key: key.to_string(),
                operator: "In".to_string(),
                values: Some(values),
            }
        });
    }

    if expressions.is_empty() {
        return None;
    }

    Some(NodeAffinity {
        required_during_scheduling_ignored_during_execution: Some(NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(expressions),
                ..Default::default()
            }],
        }),
        ..Default::default()
    })
}

/// Set tolerations and node affinity on a pod spec, replacing template values.
pub fn apply_placement(pod_spec: &mut PodSpec, placement: &Placement) {
    pod_spec.tolerations = if placement.tolerations.is_empty() {
        None
    } else {
        Some(placement.tolerations.clone())
    };

    let affinity = pod_spec.affinity.get_or_insert_with(Affinity::default);
    affinity.node_affinity.clone_from(&placement.node_affinity);
    if *affinity == Affinity::default() {
        pod_spec.affinity = None;
    }
}

/// Set resource requirements on the containers named in `resources`.
///
/// Entries naming a container the template does not have are ignored.
pub fn apply_resources(pod_spec: &mut PodSpec, resources: &[ContainerResources]) {
    for entry in resources {
        match pod_spec
            .containers
            .iter_mut()
            .find(|container| container.name == entry.name)
        {
            Some(container) => container.resources = Some(entry.resource.clone()),
            None => debug!(container = %entry.name, "No container for resource override"),
        }
    }
}

/// Required anti-affinity keeping pods labeled `key=value` on distinct nodes.
#[must_use]
pub fn pod_anti_affinity(key: &str, value: &str) -> PodAntiAffinity {
    PodAntiAffinity {
        required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
            label_selector: Some(LabelSelector {
                match_expressions: Some(vec![LabelSelectorRequirement {
                    key: key.to_string(),
                    operator: "In".to_string(),
                    values: Some(vec![value.to_string()]),
                }]),
                ..Default::default()
            }),
            topology_key: HOSTNAME_TOPOLOGY_KEY.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Attach every secondary network declared in `namespace` to a pod template.
///
/// Attachments from all declarations are merged into the networks annotation,
/// keeping any already present. Returns true when at least one declaration
/// uses secondary attachments; callers disable host networking in that case.
///
/// # Errors
///
/// Returns the inventory error if declarations cannot be listed.
pub async fn apply_network_config(
    template_meta: &mut ObjectMeta,
    inventory: &dyn NetworkInventory,
    namespace: &str,
) -> Result<bool, ClusterError> {
    let declarations = inventory.list_network_declarations(namespace).await?;

    let mut applied = false;
    for declaration in declarations
        .iter()
        .filter(|declaration| declaration.uses_secondary_attachment())
    {
        let annotations = template_meta
            .annotations
            .get_or_insert_with(Default::default);
        let mut networks: Vec<String> = annotations
            .get(NETWORKS_ANNOTATION)
            .map(|current| {
                current
                    .split(',')
                    .map(str::trim)
                    .filter(|network| !network.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        for attachment in &declaration.secondary_attachments {
            if !networks.contains(attachment) {
                networks.push(attachment.clone());
            }
        }
        annotations.insert(NETWORKS_ANNOTATION.to_string(), networks.join(", "));

        debug!(
            declaration = %declaration.name,
            attachments = ?declaration.secondary_attachments,
            "Applied secondary network attachments"
        );
        applied = true;
    }

    Ok(applied)
}

/// The object that owns every driver component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerInfo {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

impl OwnerInfo {
    /// Make this owner the controller of `meta`.
    ///
    /// Re-applying the same owner is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`OwnerError::MissingUid`] when the owner has no uid and
    /// [`OwnerError::AlreadyOwned`] when another object already controls `meta`.
    pub fn set_controller_reference(&self, meta: &mut ObjectMeta) -> Result<(), OwnerError> {
        if self.uid.is_empty() {
            return Err(OwnerError::MissingUid {
                kind: self.kind.clone(),
                name: self.name.clone(),
            });
        }

        let references = meta.owner_references.get_or_insert_with(Vec::new);
        if let Some(existing) = references
            .iter()
            .find(|reference| reference.controller == Some(true) && reference.uid != self.uid)
        {
            return Err(OwnerError::AlreadyOwned {
                kind: existing.kind.clone(),
                name: existing.name.clone(),
                uid: existing.uid.clone(),
            });
        }

        references.retain(|reference| reference.uid != self.uid);
        references.push(OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        });
        Ok(())
    }
}

#[cfg(test)]
#[path = "overrides_tests.rs"]
mod overrides_tests;
