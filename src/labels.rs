// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Common label and annotation constants used across all driver components.
//!
//! This module defines standard Kubernetes labels and operator-specific annotations
//! to ensure consistency across all resources created by the operator.

// ============================================================================
// Kubernetes Standard Labels
// https://kubernetes.io/docs/concepts/overview/working-with-objects/common-labels/
// ============================================================================

/// Standard label for the component name within the architecture (e.g., "node-plugin")
pub const K8S_COMPONENT: &str = "app.kubernetes.io/component";

/// Standard label for the tool being used to manage the operation of an application
pub const K8S_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Standard label for the name of the application (e.g., "csi-rbdplugin")
pub const K8S_NAME: &str = "app.kubernetes.io/name";

/// Standard label for the name of a higher-level application this one is part of
pub const K8S_PART_OF: &str = "app.kubernetes.io/part-of";

/// Legacy `app` label used by selectors and the provisioner anti-affinity rule
pub const APP_LABEL: &str = "app";

/// Label set by the Job controller on the pods it creates
pub const JOB_NAME_LABEL: &str = "job-name";

// ============================================================================
// Kubernetes Standard Label Values
// ============================================================================

/// Value for `app.kubernetes.io/part-of` indicating this resource is part of the CSI stack
pub const PART_OF_CEPH_CSI: &str = "ceph-csi";

/// Value for `app.kubernetes.io/managed-by`
pub const MANAGED_BY_CSI_OPERATOR: &str = "csi-operator";

/// Component value for per-node plugin workloads
pub const COMPONENT_NODE_PLUGIN: &str = "node-plugin";

/// Component value for provisioner workloads
pub const COMPONENT_PROVISIONER: &str = "provisioner";

/// Component value for the metrics service
pub const COMPONENT_METRICS: &str = "metrics";

/// Component value for the version detection job
pub const COMPONENT_VERSION_PROBE: &str = "version-probe";

// ============================================================================
// Annotations
// ============================================================================

/// SHA-256 of the desired object as submitted by the operator.
///
/// Used to tell an idempotent re-apply from a conflicting one without comparing
/// server-defaulted fields.
pub const SPEC_HASH_ANNOTATION: &str = "csi.ceph.io/spec-hash";

/// Pod annotation consumed by the multus CNI to attach secondary networks
pub const NETWORKS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";
