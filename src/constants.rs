// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Global constants for the CSI operator.
//!
//! This module contains all numeric and string constants used throughout the codebase,
//! including every parameter key the operator reads. Constants are organized by category
//! for easy maintenance.

use std::time::Duration;

// ============================================================================
// Default Images
// ============================================================================

/// Default Ceph CSI plugin image (RBD and `CephFS` drivers)
pub const DEFAULT_CSI_PLUGIN_IMAGE: &str = "quay.io/cephcsi/cephcsi:v3.6.0";

/// Default NFS CSI plugin image
pub const DEFAULT_NFS_PLUGIN_IMAGE: &str = "mcr.microsoft.com/k8s/csi/nfs-csi:v3.1.0";

/// Default node driver registrar sidecar image
pub const DEFAULT_REGISTRAR_IMAGE: &str =
    "k8s.gcr.io/sig-storage/csi-node-driver-registrar:v2.5.0";

/// Default external provisioner sidecar image
pub const DEFAULT_PROVISIONER_IMAGE: &str = "k8s.gcr.io/sig-storage/csi-provisioner:v3.1.0";

/// Default external attacher sidecar image
pub const DEFAULT_ATTACHER_IMAGE: &str = "k8s.gcr.io/sig-storage/csi-attacher:v3.4.0";

/// Default external snapshotter sidecar image
pub const DEFAULT_SNAPSHOTTER_IMAGE: &str = "k8s.gcr.io/sig-storage/csi-snapshotter:v5.0.1";

/// Default external resizer sidecar image
pub const DEFAULT_RESIZER_IMAGE: &str = "k8s.gcr.io/sig-storage/csi-resizer:v1.4.0";

/// Default volume replication sidecar image
pub const DEFAULT_VOLUME_REPLICATION_IMAGE: &str =
    "quay.io/csiaddons/volumereplication-operator:v0.3.0";

/// Default CSI-Addons sidecar image
pub const DEFAULT_CSI_ADDONS_IMAGE: &str = "quay.io/csiaddons/k8s-sidecar:v0.2.1";

// ============================================================================
// Parameter Keys - Images
// ============================================================================

pub const PARAM_CSI_PLUGIN_IMAGE: &str = "CSI_CEPH_IMAGE";
pub const PARAM_NFS_PLUGIN_IMAGE: &str = "CSI_NFS_IMAGE";
pub const PARAM_REGISTRAR_IMAGE: &str = "CSI_REGISTRAR_IMAGE";
pub const PARAM_PROVISIONER_IMAGE: &str = "CSI_PROVISIONER_IMAGE";
pub const PARAM_ATTACHER_IMAGE: &str = "CSI_ATTACHER_IMAGE";
pub const PARAM_SNAPSHOTTER_IMAGE: &str = "CSI_SNAPSHOTTER_IMAGE";
pub const PARAM_RESIZER_IMAGE: &str = "CSI_RESIZER_IMAGE";
pub const PARAM_VOLUME_REPLICATION_IMAGE: &str = "CSI_VOLUME_REPLICATION_IMAGE";
pub const PARAM_CSI_ADDONS_IMAGE: &str = "CSI_ADDONS_IMAGE";

// ============================================================================
// Parameter Keys - Driver Enablement
// ============================================================================

pub const PARAM_ENABLE_RBD: &str = "CSI_ENABLE_RBD";
pub const PARAM_ENABLE_CEPHFS: &str = "CSI_ENABLE_CEPHFS";
pub const PARAM_ENABLE_NFS: &str = "CSI_ENABLE_NFS";

// ============================================================================
// Parameter Keys - Feature Toggles
// ============================================================================

pub const PARAM_FORCE_CEPHFS_KERNEL_CLIENT: &str = "CSI_FORCE_CEPHFS_KERNEL_CLIENT";
pub const PARAM_ENABLE_RBD_SNAPSHOTTER: &str = "CSI_ENABLE_RBD_SNAPSHOTTER";
pub const PARAM_ENABLE_CEPHFS_SNAPSHOTTER: &str = "CSI_ENABLE_CEPHFS_SNAPSHOTTER";
pub const PARAM_ENABLE_OMAP_GENERATOR: &str = "CSI_ENABLE_OMAP_GENERATOR";
pub const PARAM_ENABLE_VOLUME_REPLICATION: &str = "CSI_ENABLE_VOLUME_REPLICATION";
pub const PARAM_ENABLE_CSI_ADDONS: &str = "CSI_ENABLE_CSIADDONS";
pub const PARAM_ENABLE_SELINUX_HOST_MOUNT: &str = "CSI_PLUGIN_ENABLE_SELINUX_HOST_MOUNT";
pub const PARAM_ENABLE_OIDC_TOKEN_PROJECTION: &str = "CSI_ENABLE_OIDC_TOKEN_PROJECTION";
pub const PARAM_ENABLE_HOST_NETWORK: &str = "CSI_ENABLE_HOST_NETWORK";
pub const PARAM_ENABLE_GRPC_METRICS: &str = "CSI_ENABLE_GRPC_METRICS";

// ============================================================================
// Parameter Keys - Numeric and String Settings
// ============================================================================

pub const PARAM_GRPC_TIMEOUT: &str = "CSI_GRPC_TIMEOUT_SECONDS";
pub const PARAM_PROVISIONER_REPLICAS: &str = "CSI_PROVISIONER_REPLICAS";
pub const PARAM_LOG_LEVEL: &str = "CSI_LOG_LEVEL";
pub const PARAM_KUBELET_DIR_PATH: &str = "CSI_KUBELET_DIR_PATH";
pub const PARAM_PLUGIN_PRIORITY_CLASSNAME: &str = "CSI_PLUGIN_PRIORITY_CLASSNAME";
pub const PARAM_PROVISIONER_PRIORITY_CLASSNAME: &str = "CSI_PROVISIONER_PRIORITY_CLASSNAME";
pub const PARAM_CEPHFS_GRPC_METRICS_PORT: &str = "CSI_CEPHFS_GRPC_METRICS_PORT";
pub const PARAM_CEPHFS_LIVENESS_METRICS_PORT: &str = "CSI_CEPHFS_LIVENESS_METRICS_PORT";
pub const PARAM_RBD_GRPC_METRICS_PORT: &str = "CSI_RBD_GRPC_METRICS_PORT";
pub const PARAM_RBD_LIVENESS_METRICS_PORT: &str = "CSI_RBD_LIVENESS_METRICS_PORT";
pub const PARAM_CSI_ADDONS_PORT: &str = "CSIADDONS_PORT";

// ============================================================================
// Parameter Keys - Shared Placement Overrides
// ============================================================================

/// Tolerations applied to every provisioner without its own override
pub const PARAM_PROVISIONER_TOLERATIONS: &str = "CSI_PROVISIONER_TOLERATIONS";

/// Node affinity applied to every provisioner without its own override
pub const PARAM_PROVISIONER_NODE_AFFINITY: &str = "CSI_PROVISIONER_NODE_AFFINITY";

/// Tolerations applied to every node plugin without its own override
pub const PARAM_PLUGIN_TOLERATIONS: &str = "CSI_PLUGIN_TOLERATIONS";

/// Node affinity applied to every node plugin without its own override
pub const PARAM_PLUGIN_NODE_AFFINITY: &str = "CSI_PLUGIN_NODE_AFFINITY";

// ============================================================================
// Configuration Defaults
// ============================================================================

/// Fallback GRPC timeout in seconds
pub const DEFAULT_GRPC_TIMEOUT_SECS: u64 = 150;

/// Smallest GRPC timeout accepted from an override
pub const MIN_GRPC_TIMEOUT_SECS: u64 = 120;

/// Default number of provisioner replicas on multi-node clusters
pub const DEFAULT_PROVISIONER_REPLICAS: i32 = 2;

/// Default log verbosity for CSI containers
pub const DEFAULT_LOG_LEVEL: u8 = 0;

/// Default kubelet root directory on nodes
pub const DEFAULT_KUBELET_DIR_PATH: &str = "/var/lib/kubelet";

/// Default fsGroupPolicy advertised by the driver registration object
pub const DEFAULT_FS_GROUP_POLICY: &str = "ReadWriteOnceWithFSType";

pub const DEFAULT_CEPHFS_GRPC_METRICS_PORT: u16 = 9091;
pub const DEFAULT_CEPHFS_LIVENESS_METRICS_PORT: u16 = 9081;
pub const DEFAULT_RBD_GRPC_METRICS_PORT: u16 = 9090;
pub const DEFAULT_RBD_LIVENESS_METRICS_PORT: u16 = 9080;
pub const DEFAULT_CSI_ADDONS_PORT: u16 = 9070;

// ============================================================================
// Update Strategy Values
// ============================================================================

pub const UPDATE_STRATEGY_ROLLING_UPDATE: &str = "RollingUpdate";
pub const UPDATE_STRATEGY_ON_DELETE: &str = "OnDelete";

/// Deployment strategy forced on every provisioner
pub const DEPLOYMENT_STRATEGY_RECREATE: &str = "Recreate";

// ============================================================================
// Cluster Version Gates
// ============================================================================

/// Minimum supported Kubernetes major version
pub const KUBE_MIN_MAJOR: u32 = 1;

/// Snapshotter sidecars default on from this minor version
pub const KUBE_MIN_MINOR_FOR_SNAPSHOT: u32 = 17;

/// Service-account token projection defaults on from this minor version
pub const KUBE_MIN_MINOR_FOR_OIDC_TOKEN_PROJECTION: u32 = 20;

/// `storage.k8s.io/v1` `CSIDriver` is served from this minor version
pub const KUBE_MIN_MINOR_FOR_CURRENT_REGISTRATION: u32 = 18;

/// Last minor version that still serves `storage.k8s.io/v1beta1` `CSIDriver`
pub const KUBE_MAX_MINOR_FOR_LEGACY_REGISTRATION: u32 = 21;

// ============================================================================
// Driver Version Probe
// ============================================================================

/// Ceiling for the version detection job, independent of the caller's deadline
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Name of the one-shot version detection job
pub const PROBE_JOB_NAME: &str = "csi-detect-version";

/// Container name inside the version detection job
pub const PROBE_CONTAINER_NAME: &str = "cephcsi";

/// Command run by the version detection job
pub const PROBE_COMMAND: &str = "cephcsi";

/// Argument passed to the driver binary to print its version
pub const PROBE_VERSION_ARG: &str = "--version";

/// Interval between job status polls
pub const PROBE_POLL_INTERVAL_SECS: u64 = 5;

/// Oldest driver release the operator will deploy
pub const MIN_DRIVER_VERSION: (u32, u32, u32) = (3, 4, 0);

// ============================================================================
// Driver Naming
// ============================================================================

/// Suffix of the RBD driver name (prefixed with `<namespace>.`)
pub const RBD_DRIVER_SUFFIX: &str = "rbd.csi.ceph.com";

/// Suffix of the `CephFS` driver name (prefixed with `<namespace>.`)
pub const CEPHFS_DRIVER_SUFFIX: &str = "cephfs.csi.ceph.com";

/// Suffix of the NFS driver name (prefixed with `<namespace>.`)
pub const NFS_DRIVER_SUFFIX: &str = "nfs.csi.ceph.com";

// ============================================================================
// Controller Constants
// ============================================================================

/// Field manager name used for server-side apply
pub const FIELD_MANAGER: &str = "csi-operator";

/// Requeue duration after a converged pass (5 minutes)
pub const DEFAULT_REQUEUE_SECS: u64 = 300;

/// Requeue duration for controller errors (30 seconds)
pub const ERROR_REQUEUE_DURATION_SECS: u64 = 30;

/// Default deadline for one reconciliation pass (20 minutes, covers the probe ceiling)
pub const DEFAULT_PASS_DEADLINE_SECS: u64 = 20 * 60;

/// Default name of the operator settings `ConfigMap`
pub const DEFAULT_OPERATOR_CONFIG_NAME: &str = "csi-operator-config";

/// Default name of the operator `Deployment` that owns every driver object
pub const DEFAULT_OPERATOR_DEPLOYMENT_NAME: &str = "csi-operator";

/// Default service account for the version detection job
pub const DEFAULT_OPERATOR_SERVICE_ACCOUNT: &str = "csi-operator";

// ============================================================================
// Runtime Constants
// ============================================================================

/// Number of worker threads for Tokio runtime
pub const TOKIO_WORKER_THREADS: usize = 2;

// ============================================================================
// Metrics Server Constants
// ============================================================================

/// Port for Prometheus metrics HTTP server
pub const METRICS_SERVER_PORT: u16 = 8080;

/// Path for Prometheus metrics endpoint
pub const METRICS_SERVER_PATH: &str = "/metrics";

/// Bind address for metrics HTTP server
pub const METRICS_SERVER_BIND_ADDRESS: &str = "0.0.0.0";
