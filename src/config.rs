// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Effective configuration for one reconciliation pass.
//!
//! [`resolve_config`] turns the raw [`Parameters`] map plus cluster facts into an
//! [`EffectiveConfig`]. Every setting is resolved by one of a handful of uniform
//! rules:
//!
//! | Rule | Absent | Malformed |
//! |------|--------|-----------|
//! | flag | default | default |
//! | version-gated flag | on iff cluster meets the minimum | same as absent |
//! | GRPC timeout | 150s | 150s (also below the 120s floor) |
//! | replicas / log level | default | default, logged |
//! | port | default | [`ConfigError::InvalidPort`] |
//! | image | default | empty is [`SetupError::MissingImage`] |
//!
//! An explicit `"false"` always disables a version-gated capability; there is no way
//! to force one on below its minimum cluster version.

use crate::constants::{
    DEFAULT_ATTACHER_IMAGE, DEFAULT_CEPHFS_GRPC_METRICS_PORT,
    DEFAULT_CEPHFS_LIVENESS_METRICS_PORT, DEFAULT_CSI_ADDONS_IMAGE, DEFAULT_CSI_ADDONS_PORT,
    DEFAULT_CSI_PLUGIN_IMAGE, DEFAULT_FS_GROUP_POLICY, DEFAULT_GRPC_TIMEOUT_SECS,
    DEFAULT_KUBELET_DIR_PATH, DEFAULT_LOG_LEVEL, DEFAULT_NFS_PLUGIN_IMAGE,
    DEFAULT_PROVISIONER_IMAGE, DEFAULT_PROVISIONER_REPLICAS, DEFAULT_RBD_GRPC_METRICS_PORT,
    DEFAULT_RBD_LIVENESS_METRICS_PORT, DEFAULT_REGISTRAR_IMAGE, DEFAULT_RESIZER_IMAGE,
    DEFAULT_SNAPSHOTTER_IMAGE, DEFAULT_VOLUME_REPLICATION_IMAGE, KUBE_MIN_MAJOR,
    KUBE_MIN_MINOR_FOR_OIDC_TOKEN_PROJECTION, KUBE_MIN_MINOR_FOR_SNAPSHOT,
    MIN_GRPC_TIMEOUT_SECS, PARAM_ATTACHER_IMAGE, PARAM_CEPHFS_GRPC_METRICS_PORT,
    PARAM_CEPHFS_LIVENESS_METRICS_PORT, PARAM_CSI_ADDONS_IMAGE, PARAM_CSI_ADDONS_PORT,
    PARAM_CSI_PLUGIN_IMAGE, PARAM_ENABLE_CEPHFS_SNAPSHOTTER, PARAM_ENABLE_CSI_ADDONS,
    PARAM_ENABLE_GRPC_METRICS, PARAM_ENABLE_HOST_NETWORK, PARAM_ENABLE_OIDC_TOKEN_PROJECTION,
    PARAM_ENABLE_OMAP_GENERATOR, PARAM_ENABLE_RBD_SNAPSHOTTER,
    PARAM_ENABLE_SELINUX_HOST_MOUNT, PARAM_ENABLE_VOLUME_REPLICATION,
    PARAM_FORCE_CEPHFS_KERNEL_CLIENT, PARAM_GRPC_TIMEOUT, PARAM_KUBELET_DIR_PATH,
    PARAM_LOG_LEVEL, PARAM_NFS_PLUGIN_IMAGE, PARAM_PLUGIN_PRIORITY_CLASSNAME,
    PARAM_PROVISIONER_IMAGE, PARAM_PROVISIONER_PRIORITY_CLASSNAME, PARAM_PROVISIONER_REPLICAS,
    PARAM_RBD_GRPC_METRICS_PORT, PARAM_RBD_LIVENESS_METRICS_PORT, PARAM_REGISTRAR_IMAGE,
    PARAM_RESIZER_IMAGE, PARAM_SNAPSHOTTER_IMAGE, PARAM_VOLUME_REPLICATION_IMAGE,
    UPDATE_STRATEGY_ON_DELETE, UPDATE_STRATEGY_ROLLING_UPDATE,
};
use crate::driver::{DriverKind, PerDriver};
use crate::errors::{ConfigError, ReconcileError, SetupError};
use crate::version::ClusterVersion;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Prefixes of process environment variables that are reconciliation parameters
const PARAMETER_ENV_PREFIXES: [&str; 2] = ["CSI_", "CSIADDONS_"];

/// fsGroupPolicy values accepted by the registration object
const FS_GROUP_POLICIES: [&str; 3] = ["None", "ReadWriteOnceWithFSType", "File"];

/// Raw string-keyed reconciliation parameters.
///
/// Absent keys always mean "use the default". Built fresh for every pass from the
/// process environment overlaid by the operator `ConfigMap` data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parameters {
    values: BTreeMap<String, String>,
}

impl Parameters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the parameter-shaped variables of the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Keep only the `CSI_*` / `CSIADDONS_*` entries of `vars`.
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let values = vars
            .into_iter()
            .filter(|(key, _)| {
                PARAMETER_ENV_PREFIXES
                    .iter()
                    .any(|prefix| key.starts_with(prefix))
            })
            .collect();
        Self { values }
    }

    /// Overlay `ConfigMap` data; its entries win over the environment.
    pub fn overlay(&mut self, data: &BTreeMap<String, String>) {
        for (key, value) in data {
            self.values.insert(key.clone(), value.clone());
        }
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Raw value, exactly as supplied.
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Trimmed value; blank values count as absent.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.raw(key).map(str::trim).filter(|value| !value.is_empty())
    }
}

impl FromIterator<(String, String)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Container image references used by the driver components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSet {
    pub plugin: String,
    pub nfs_plugin: String,
    pub registrar: String,
    pub provisioner: String,
    pub attacher: String,
    pub snapshotter: String,
    pub resizer: String,
    pub volume_replication: String,
    pub csi_addons: String,
}

impl Default for ImageSet {
    fn default() -> Self {
        Self {
            plugin: DEFAULT_CSI_PLUGIN_IMAGE.to_string(),
            nfs_plugin: DEFAULT_NFS_PLUGIN_IMAGE.to_string(),
            registrar: DEFAULT_REGISTRAR_IMAGE.to_string(),
            provisioner: DEFAULT_PROVISIONER_IMAGE.to_string(),
            attacher: DEFAULT_ATTACHER_IMAGE.to_string(),
            snapshotter: DEFAULT_SNAPSHOTTER_IMAGE.to_string(),
            resizer: DEFAULT_RESIZER_IMAGE.to_string(),
            volume_replication: DEFAULT_VOLUME_REPLICATION_IMAGE.to_string(),
            csi_addons: DEFAULT_CSI_ADDONS_IMAGE.to_string(),
        }
    }
}

/// Rolling behavior of the node plugin `DaemonSet`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdateStrategy {
    #[default]
    RollingUpdate,
    OnDelete,
}

impl UpdateStrategy {
    /// `"OnDelete"` (any case) selects [`UpdateStrategy::OnDelete`]; anything else rolls.
    #[must_use]
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some(value) if value.eq_ignore_ascii_case(UPDATE_STRATEGY_ON_DELETE) => {
                Self::OnDelete
            }
            _ => Self::RollingUpdate,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RollingUpdate => UPDATE_STRATEGY_ROLLING_UPDATE,
            Self::OnDelete => UPDATE_STRATEGY_ON_DELETE,
        }
    }
}

/// Metrics, liveness and sidecar ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsPorts {
    pub rbd_grpc: u16,
    pub rbd_liveness: u16,
    pub cephfs_grpc: u16,
    pub cephfs_liveness: u16,
    pub csi_addons: u16,
}

impl MetricsPorts {
    /// `(grpc, liveness)` ports for a driver; NFS exposes none.
    #[must_use]
    pub fn for_driver(&self, kind: DriverKind) -> Option<(u16, u16)> {
        match kind {
            DriverKind::Rbd => Some((self.rbd_grpc, self.rbd_liveness)),
            DriverKind::CephFs => Some((self.cephfs_grpc, self.cephfs_liveness)),
            DriverKind::Nfs => None,
        }
    }
}

impl Default for MetricsPorts {
    fn default() -> Self {
        Self {
            rbd_grpc: DEFAULT_RBD_GRPC_METRICS_PORT,
            rbd_liveness: DEFAULT_RBD_LIVENESS_METRICS_PORT,
            cephfs_grpc: DEFAULT_CEPHFS_GRPC_METRICS_PORT,
            cephfs_liveness: DEFAULT_CEPHFS_LIVENESS_METRICS_PORT,
            csi_addons: DEFAULT_CSI_ADDONS_PORT,
        }
    }
}

/// Fully resolved settings for one pass. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveConfig {
    /// Namespace the driver components live in
    pub namespace: String,
    pub cluster_version: ClusterVersion,
    pub images: ImageSet,
    /// Driver enablement flags
    pub enabled: PerDriver<bool>,
    /// Registration names, `<namespace>.<suffix>`
    pub driver_names: PerDriver<String>,

    pub force_cephfs_kernel_client: bool,
    pub enable_rbd_snapshotter: bool,
    pub enable_cephfs_snapshotter: bool,
    pub enable_omap_generator: bool,
    pub enable_volume_replication: bool,
    pub enable_csi_addons: bool,
    pub enable_selinux_host_mount: bool,
    pub enable_oidc_token_projection: bool,
    pub enable_host_network: bool,
    pub enable_grpc_metrics: bool,

    pub grpc_timeout_secs: u64,
    pub provisioner_replicas: i32,
    pub log_level: u8,
    pub kubelet_dir_path: String,
    pub plugin_priority_class: Option<String>,
    pub provisioner_priority_class: Option<String>,
    pub ports: MetricsPorts,

    pub update_strategy: PerDriver<UpdateStrategy>,
    pub pod_labels: PerDriver<BTreeMap<String, String>>,
    pub fs_group_policy: PerDriver<String>,
}

impl EffectiveConfig {
    /// Whether the snapshotter sidecar runs for this driver.
    #[must_use]
    pub fn snapshotter_enabled(&self, kind: DriverKind) -> bool {
        match kind {
            DriverKind::Rbd => self.enable_rbd_snapshotter,
            DriverKind::CephFs => self.enable_cephfs_snapshotter,
            DriverKind::Nfs => false,
        }
    }

    /// Image of the node plugin's driver container. NFS nodes run nfs-csi, everything
    /// else runs cephcsi.
    #[must_use]
    pub fn plugin_image(&self, kind: DriverKind) -> &str {
        match kind {
            DriverKind::Nfs => &self.images.nfs_plugin,
            DriverKind::Rbd | DriverKind::CephFs => &self.images.plugin,
        }
    }
}

/// Uniform resolution rules over a [`Parameters`] map.
struct Rules<'a> {
    params: &'a Parameters,
    version: ClusterVersion,
}

impl Rules<'_> {
    /// Case-insensitive `"true"`/`"false"`; anything else takes `default`.
    fn flag(&self, key: &str, default: bool) -> bool {
        match self.params.get(key) {
            Some(value) if value.eq_ignore_ascii_case("true") => true,
            Some(value) if value.eq_ignore_ascii_case("false") => false,
            Some(value) => {
                debug!(key, value, default, "Unrecognized boolean override, using default");
                default
            }
            None => default,
        }
    }

    /// Defaults on only from `minor`; an override can disable but never force-enable.
    fn gated_flag(&self, key: &str, minor: u32) -> bool {
        let supported = self.version.at_least(KUBE_MIN_MAJOR, minor);
        supported && self.flag(key, supported)
    }

    fn port(&self, key: &'static str, default: u16) -> Result<u16, ConfigError> {
        match self.params.get(key) {
            None => Ok(default),
            Some(value) => value
                .parse::<u16>()
                .map_err(|source| ConfigError::InvalidPort {
                    key,
                    value: value.to_string(),
                    source,
                }),
        }
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.params.get(key).unwrap_or(default).to_string()
    }

    fn optional_string(&self, key: &str) -> Option<String> {
        self.params.get(key).map(str::to_string)
    }

    /// Images keep an explicitly empty override so it can be reported as missing.
    fn image(&self, key: &str, default: &str) -> String {
        self.params
            .raw(key)
            .map_or_else(|| default.to_string(), |value| value.trim().to_string())
    }

    fn grpc_timeout(&self) -> u64 {
        let Some(value) = self.params.get(PARAM_GRPC_TIMEOUT) else {
            return DEFAULT_GRPC_TIMEOUT_SECS;
        };
        match value.parse::<u64>() {
            Ok(secs) if secs >= MIN_GRPC_TIMEOUT_SECS => secs,
            _ => {
                warn!(
                    value,
                    floor = MIN_GRPC_TIMEOUT_SECS,
                    fallback = DEFAULT_GRPC_TIMEOUT_SECS,
                    "GRPC timeout is invalid or below the floor, using fallback"
                );
                DEFAULT_GRPC_TIMEOUT_SECS
            }
        }
    }

    fn log_level(&self) -> u8 {
        let Some(value) = self.params.get(PARAM_LOG_LEVEL) else {
            return DEFAULT_LOG_LEVEL;
        };
        value.parse::<u8>().unwrap_or_else(|e| {
            warn!(value, error = %e, "Failed to parse CSI log level, using default");
            DEFAULT_LOG_LEVEL
        })
    }

    fn provisioner_replicas(&self, node_count: Option<usize>) -> i32 {
        match node_count {
            Some(1) => {
                debug!("Single-node cluster, running one provisioner replica");
                1
            }
            Some(_) => match self.params.get(PARAM_PROVISIONER_REPLICAS) {
                None => DEFAULT_PROVISIONER_REPLICAS,
                Some(value) => match value.parse::<i32>() {
                    Ok(replicas) => replicas,
                    Err(_) => {
                        warn!(
                            value,
                            fallback = DEFAULT_PROVISIONER_REPLICAS,
                            "Failed to parse provisioner replicas, using default"
                        );
                        DEFAULT_PROVISIONER_REPLICAS
                    }
                },
            },
            None => {
                warn!(
                    fallback = DEFAULT_PROVISIONER_REPLICAS,
                    "Node count unavailable, using default provisioner replicas"
                );
                DEFAULT_PROVISIONER_REPLICAS
            }
        }
    }

    fn fs_group_policy(&self, key: &str) -> String {
        match self.params.get(key) {
            None => DEFAULT_FS_GROUP_POLICY.to_string(),
            Some(value) => {
                if let Some(policy) = FS_GROUP_POLICIES
                    .iter()
                    .find(|policy| policy.eq_ignore_ascii_case(value))
                {
                    (*policy).to_string()
                } else {
                    warn!(key, value, "Unknown fsGroupPolicy, using default");
                    DEFAULT_FS_GROUP_POLICY.to_string()
                }
            }
        }
    }

    fn pod_labels(&self, key: &str) -> BTreeMap<String, String> {
        self.params
            .get(key)
            .map(|raw| parse_labels(key, raw))
            .unwrap_or_default()
    }
}

/// Parse `k=v,k2=v2`; malformed entries are skipped.
fn parse_labels(key: &str, raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => {
                Some((name.trim().to_string(), value.trim().to_string()))
            }
            _ => {
                warn!(key, entry, "Ignoring malformed pod label");
                None
            }
        })
        .collect()
}

/// Resolve the effective configuration for one pass.
///
/// # Arguments
///
/// * `params` - Raw parameter map
/// * `version` - Detected cluster version
/// * `node_count` - Number of cluster nodes, `None` if the lookup failed
/// * `defaults` - Base image references
/// * `namespace` - Namespace of the driver components
///
/// # Errors
///
/// Returns [`ReconcileError::Setup`] when a required image resolves empty and
/// [`ReconcileError::Config`] when a port override is malformed.
pub fn resolve_config(
    params: &Parameters,
    version: ClusterVersion,
    node_count: Option<usize>,
    defaults: &ImageSet,
    namespace: &str,
) -> Result<EffectiveConfig, ReconcileError> {
    let rules = Rules { params, version };

    let enabled = PerDriver::from_fn(|kind| {
        let descriptor = kind.descriptor();
        rules.flag(descriptor.enable_param, descriptor.enabled_by_default)
    });

    let images = ImageSet {
        plugin: rules.image(PARAM_CSI_PLUGIN_IMAGE, &defaults.plugin),
        nfs_plugin: rules.image(PARAM_NFS_PLUGIN_IMAGE, &defaults.nfs_plugin),
        registrar: rules.image(PARAM_REGISTRAR_IMAGE, &defaults.registrar),
        provisioner: rules.image(PARAM_PROVISIONER_IMAGE, &defaults.provisioner),
        attacher: rules.image(PARAM_ATTACHER_IMAGE, &defaults.attacher),
        snapshotter: rules.image(PARAM_SNAPSHOTTER_IMAGE, &defaults.snapshotter),
        resizer: rules.image(PARAM_RESIZER_IMAGE, &defaults.resizer),
        volume_replication: rules
            .image(PARAM_VOLUME_REPLICATION_IMAGE, &defaults.volume_replication),
        csi_addons: rules.image(PARAM_CSI_ADDONS_IMAGE, &defaults.csi_addons),
    };
    check_required_images(&images, &enabled)?;

    let ports = MetricsPorts {
        rbd_grpc: rules.port(PARAM_RBD_GRPC_METRICS_PORT, DEFAULT_RBD_GRPC_METRICS_PORT)?,
        rbd_liveness: rules.port(
            PARAM_RBD_LIVENESS_METRICS_PORT,
            DEFAULT_RBD_LIVENESS_METRICS_PORT,
        )?,
        cephfs_grpc: rules.port(
            PARAM_CEPHFS_GRPC_METRICS_PORT,
            DEFAULT_CEPHFS_GRPC_METRICS_PORT,
        )?,
        cephfs_liveness: rules.port(
            PARAM_CEPHFS_LIVENESS_METRICS_PORT,
            DEFAULT_CEPHFS_LIVENESS_METRICS_PORT,
        )?,
        csi_addons: rules.port(PARAM_CSI_ADDONS_PORT, DEFAULT_CSI_ADDONS_PORT)?,
    };

    let config = EffectiveConfig {
        namespace: namespace.to_string(),
        cluster_version: version,
        driver_names: PerDriver::from_fn(|kind| kind.descriptor().driver_name(namespace)),
        enabled,
        images,

        force_cephfs_kernel_client: rules.flag(PARAM_FORCE_CEPHFS_KERNEL_CLIENT, true),
        enable_rbd_snapshotter: rules
            .gated_flag(PARAM_ENABLE_RBD_SNAPSHOTTER, KUBE_MIN_MINOR_FOR_SNAPSHOT),
        enable_cephfs_snapshotter: rules
            .gated_flag(PARAM_ENABLE_CEPHFS_SNAPSHOTTER, KUBE_MIN_MINOR_FOR_SNAPSHOT),
        enable_omap_generator: rules.flag(PARAM_ENABLE_OMAP_GENERATOR, false),
        enable_volume_replication: rules.flag(PARAM_ENABLE_VOLUME_REPLICATION, false),
        enable_csi_addons: rules.flag(PARAM_ENABLE_CSI_ADDONS, false),
        enable_selinux_host_mount: rules.flag(PARAM_ENABLE_SELINUX_HOST_MOUNT, false),
        enable_oidc_token_projection: rules.gated_flag(
            PARAM_ENABLE_OIDC_TOKEN_PROJECTION,
            KUBE_MIN_MINOR_FOR_OIDC_TOKEN_PROJECTION,
        ),
        enable_host_network: rules.flag(PARAM_ENABLE_HOST_NETWORK, true),
        enable_grpc_metrics: rules.flag(PARAM_ENABLE_GRPC_METRICS, false),

        grpc_timeout_secs: rules.grpc_timeout(),
        provisioner_replicas: rules.provisioner_replicas(node_count),
        log_level: rules.log_level(),
        kubelet_dir_path: rules.string(PARAM_KUBELET_DIR_PATH, DEFAULT_KUBELET_DIR_PATH),
        plugin_priority_class: rules.optional_string(PARAM_PLUGIN_PRIORITY_CLASSNAME),
        provisioner_priority_class: rules.optional_string(PARAM_PROVISIONER_PRIORITY_CLASSNAME),
        ports,

        update_strategy: PerDriver::from_fn(|kind| {
            UpdateStrategy::parse(params.get(kind.descriptor().update_strategy_param))
        }),
        pod_labels: PerDriver::from_fn(|kind| rules.pod_labels(kind.descriptor().pod_labels_param)),
        fs_group_policy: PerDriver::from_fn(|kind| {
            rules.fs_group_policy(kind.descriptor().fs_group_policy_param)
        }),
    };

    debug!(
        cluster_version = %config.cluster_version,
        rbd = config.enabled.rbd,
        cephfs = config.enabled.cephfs,
        nfs = config.enabled.nfs,
        replicas = config.provisioner_replicas,
        grpc_timeout_secs = config.grpc_timeout_secs,
        "Resolved effective configuration"
    );

    Ok(config)
}

fn check_required_images(images: &ImageSet, enabled: &PerDriver<bool>) -> Result<(), SetupError> {
    let mut required = vec![
        ("csi registrar", PARAM_REGISTRAR_IMAGE, &images.registrar),
        ("csi provisioner", PARAM_PROVISIONER_IMAGE, &images.provisioner),
        ("csi attacher", PARAM_ATTACHER_IMAGE, &images.attacher),
    ];
    // The version probe runs the plugin image whatever driver is enabled
    if enabled.any() {
        required.insert(0, ("csi plugin", PARAM_CSI_PLUGIN_IMAGE, &images.plugin));
    }
    if enabled.nfs {
        required.push(("nfs plugin", PARAM_NFS_PLUGIN_IMAGE, &images.nfs_plugin));
    }

    match required.into_iter().find(|(_, _, value)| value.is_empty()) {
        Some((image, parameter, _)) => Err(SetupError::MissingImage { image, parameter }),
        None => Ok(()),
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod config_tests;
