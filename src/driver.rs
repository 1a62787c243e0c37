// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Driver kinds and their descriptor table.
//!
//! Each CSI driver (RBD, `CephFS`, NFS) is reconciled by the same routine; everything
//! that differs between them (object names, parameter keys, whether a metrics service
//! exists) lives in one static [`DriverDescriptor`] per kind.

use crate::constants::{
    CEPHFS_DRIVER_SUFFIX, NFS_DRIVER_SUFFIX, PARAM_ENABLE_CEPHFS, PARAM_ENABLE_NFS,
    PARAM_ENABLE_RBD, RBD_DRIVER_SUFFIX,
};

/// One of the CSI drivers managed by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DriverKind {
    Rbd,
    CephFs,
    Nfs,
}

impl DriverKind {
    /// All drivers in reconciliation order.
    pub const ALL: [DriverKind; 3] = [DriverKind::Rbd, DriverKind::CephFs, DriverKind::Nfs];

    /// Static descriptor for this driver.
    #[must_use]
    pub fn descriptor(self) -> &'static DriverDescriptor {
        match self {
            Self::Rbd => &RBD,
            Self::CephFs => &CEPHFS,
            Self::Nfs => &NFS,
        }
    }

    /// Short lowercase identifier (e.g., "rbd").
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rbd => "rbd",
            Self::CephFs => "cephfs",
            Self::Nfs => "nfs",
        }
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.descriptor().display_name)
    }
}

/// Names and parameter keys for one driver.
#[derive(Debug)]
pub struct DriverDescriptor {
    pub kind: DriverKind,
    /// Name used in log messages
    pub display_name: &'static str,
    /// Node plugin `DaemonSet` name
    pub plugin_name: &'static str,
    /// Provisioner `Deployment` name (also the anti-affinity `app` label value)
    pub provisioner_name: &'static str,
    /// Metrics `Service` name
    pub service_name: &'static str,
    /// Whether the driver ships a metrics `Service`
    pub has_service: bool,
    /// Registration name suffix, prefixed with `<namespace>.`
    pub driver_suffix: &'static str,
    /// Whether volumes of this driver need the attach step
    pub attach_required: bool,
    /// Enablement flag key and its default
    pub enable_param: &'static str,
    pub enabled_by_default: bool,
    pub plugin_tolerations_param: &'static str,
    pub plugin_node_affinity_param: &'static str,
    pub provisioner_tolerations_param: &'static str,
    pub provisioner_node_affinity_param: &'static str,
    pub plugin_resource_param: &'static str,
    pub provisioner_resource_param: &'static str,
    pub update_strategy_param: &'static str,
    pub pod_labels_param: &'static str,
    pub fs_group_policy_param: &'static str,
}

impl DriverDescriptor {
    /// Registration object name, e.g. `rook-ceph.rbd.csi.ceph.com`.
    #[must_use]
    pub fn driver_name(&self, namespace: &str) -> String {
        format!("{namespace}.{}", self.driver_suffix)
    }
}

static RBD: DriverDescriptor = DriverDescriptor {
    kind: DriverKind::Rbd,
    display_name: "Ceph RBD",
    plugin_name: "csi-rbdplugin",
    provisioner_name: "csi-rbdplugin-provisioner",
    service_name: "csi-rbdplugin-metrics",
    has_service: true,
    driver_suffix: RBD_DRIVER_SUFFIX,
    attach_required: true,
    enable_param: PARAM_ENABLE_RBD,
    enabled_by_default: true,
    plugin_tolerations_param: "CSI_RBD_PLUGIN_TOLERATIONS",
    plugin_node_affinity_param: "CSI_RBD_PLUGIN_NODE_AFFINITY",
    provisioner_tolerations_param: "CSI_RBD_PROVISIONER_TOLERATIONS",
    provisioner_node_affinity_param: "CSI_RBD_PROVISIONER_NODE_AFFINITY",
    plugin_resource_param: "CSI_RBD_PLUGIN_RESOURCE",
    provisioner_resource_param: "CSI_RBD_PROVISIONER_RESOURCE",
    update_strategy_param: "CSI_RBD_PLUGIN_UPDATE_STRATEGY",
    pod_labels_param: "CSI_RBD_POD_LABELS",
    fs_group_policy_param: "CSI_RBD_FSGROUPPOLICY",
};

static CEPHFS: DriverDescriptor = DriverDescriptor {
    kind: DriverKind::CephFs,
    display_name: "CephFS",
    plugin_name: "csi-cephfsplugin",
    provisioner_name: "csi-cephfsplugin-provisioner",
    service_name: "csi-cephfsplugin-metrics",
    has_service: true,
    driver_suffix: CEPHFS_DRIVER_SUFFIX,
    attach_required: true,
    enable_param: PARAM_ENABLE_CEPHFS,
    enabled_by_default: true,
    plugin_tolerations_param: "CSI_CEPHFS_PLUGIN_TOLERATIONS",
    plugin_node_affinity_param: "CSI_CEPHFS_PLUGIN_NODE_AFFINITY",
    provisioner_tolerations_param: "CSI_CEPHFS_PROVISIONER_TOLERATIONS",
    provisioner_node_affinity_param: "CSI_CEPHFS_PROVISIONER_NODE_AFFINITY",
    plugin_resource_param: "CSI_CEPHFS_PLUGIN_RESOURCE",
    provisioner_resource_param: "CSI_CEPHFS_PROVISIONER_RESOURCE",
    update_strategy_param: "CSI_CEPHFS_PLUGIN_UPDATE_STRATEGY",
    pod_labels_param: "CSI_CEPHFS_POD_LABELS",
    fs_group_policy_param: "CSI_CEPHFS_FSGROUPPOLICY",
};

static NFS: DriverDescriptor = DriverDescriptor {
    kind: DriverKind::Nfs,
    display_name: "NFS",
    plugin_name: "csi-nfsplugin",
    provisioner_name: "csi-nfsplugin-provisioner",
    service_name: "csi-nfsplugin-metrics",
    has_service: false,
    driver_suffix: NFS_DRIVER_SUFFIX,
    attach_required: false,
    enable_param: PARAM_ENABLE_NFS,
    enabled_by_default: false,
    plugin_tolerations_param: "CSI_NFS_PLUGIN_TOLERATIONS",
    plugin_node_affinity_param: "CSI_NFS_PLUGIN_NODE_AFFINITY",
    provisioner_tolerations_param: "CSI_NFS_PROVISIONER_TOLERATIONS",
    provisioner_node_affinity_param: "CSI_NFS_PROVISIONER_NODE_AFFINITY",
    plugin_resource_param: "CSI_NFS_PLUGIN_RESOURCE",
    provisioner_resource_param: "CSI_NFS_PROVISIONER_RESOURCE",
    update_strategy_param: "CSI_NFS_PLUGIN_UPDATE_STRATEGY",
    pod_labels_param: "CSI_NFS_POD_LABELS",
    fs_group_policy_param: "CSI_NFS_FSGROUPPOLICY",
};

/// One value per driver kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerDriver<T> {
    pub rbd: T,
    pub cephfs: T,
    pub nfs: T,
}

impl<T> PerDriver<T> {
    /// Build by evaluating `f` once per driver kind.
    pub fn from_fn(mut f: impl FnMut(DriverKind) -> T) -> Self {
        Self {
            rbd: f(DriverKind::Rbd),
            cephfs: f(DriverKind::CephFs),
            nfs: f(DriverKind::Nfs),
        }
    }

    #[must_use]
    pub fn get(&self, kind: DriverKind) -> &T {
        match kind {
            DriverKind::Rbd => &self.rbd,
            DriverKind::CephFs => &self.cephfs,
            DriverKind::Nfs => &self.nfs,
        }
    }

    pub fn get_mut(&mut self, kind: DriverKind) -> &mut T {
        match kind {
            DriverKind::Rbd => &mut self.rbd,
            DriverKind::CephFs => &mut self.cephfs,
            DriverKind::Nfs => &mut self.nfs,
        }
    }
}

impl PerDriver<bool> {
    /// True if at least one driver is set.
    #[must_use]
    pub fn any(&self) -> bool {
        self.rbd || self.cephfs || self.nfs
    }

    /// Drivers whose flag is set, in reconciliation order.
    pub fn enabled(&self) -> impl Iterator<Item = DriverKind> + '_ {
        DriverKind::ALL.into_iter().filter(|kind| *self.get(*kind))
    }
}
