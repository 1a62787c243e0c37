// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Manifest rendering for the driver workloads.
//!
//! The reconciler asks a [`ManifestRenderer`] for the typed objects of each driver and
//! then layers overrides, owner references and network settings on top. The default
//! [`BuiltinRenderer`] builds the objects programmatically from the
//! [`EffectiveConfig`]; sidecars are included or left out according to the feature
//! toggles.
//!
//! Rendered objects never carry placement, resource overrides, owner references,
//! the provisioner strategy or anti-affinity. Those are the reconciler's job.

use crate::config::EffectiveConfig;
use crate::driver::{DriverDescriptor, DriverKind};
use crate::errors::RenderError;
use crate::labels::{
    APP_LABEL, COMPONENT_METRICS, COMPONENT_NODE_PLUGIN, COMPONENT_PROVISIONER, K8S_COMPONENT,
    K8S_MANAGED_BY, K8S_NAME, K8S_PART_OF, MANAGED_BY_CSI_OPERATOR, PART_OF_CEPH_CSI,
};
use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy, Deployment, DeploymentSpec,
};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    HostPathVolumeSource, ObjectFieldSelector, PodSpec, PodTemplateSpec, ProjectedVolumeSource,
    SecurityContext, Service, ServiceAccountTokenProjection, ServicePort, ServiceSpec, Volume,
    VolumeMount, VolumeProjection,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;
use tracing::debug;

/// Template identifiers, used in render errors
pub const TEMPLATE_NODE_PLUGIN: &str = "node-plugin";
pub const TEMPLATE_PROVISIONER: &str = "provisioner";
pub const TEMPLATE_METRICS_SERVICE: &str = "metrics-service";

/// Label tying the plugin and provisioner pods to the metrics service selector
const CONTAINS_LABEL: &str = "contains";

const SOCKET_DIR: &str = "/csi";
const SOCKET_ADDRESS: &str = "unix:///csi/csi.sock";
const OIDC_TOKEN_DIR: &str = "/run/secrets/tokens";
const OIDC_TOKEN_AUDIENCE: &str = "ceph-csi-kms";
const OIDC_TOKEN_EXPIRATION_SECS: i64 = 3600;

/// Renders the typed cluster objects of a driver.
pub trait ManifestRenderer: Send + Sync {
    /// Node plugin `DaemonSet`.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError`] when the configuration does not satisfy the template.
    fn render_node_plugin(
        &self,
        kind: DriverKind,
        config: &EffectiveConfig,
    ) -> Result<DaemonSet, RenderError>;

    /// Provisioner `Deployment`.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError`] when the configuration does not satisfy the template.
    fn render_provisioner(
        &self,
        kind: DriverKind,
        config: &EffectiveConfig,
    ) -> Result<Deployment, RenderError>;

    /// Metrics `Service`. Only drivers with `has_service` have a template.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::NoTemplate`] for drivers without a service.
    fn render_service(
        &self,
        kind: DriverKind,
        config: &EffectiveConfig,
    ) -> Result<Service, RenderError>;
}

/// Renderer that builds the manifests in code.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinRenderer;

impl ManifestRenderer for BuiltinRenderer {
    fn render_node_plugin(
        &self,
        kind: DriverKind,
        config: &EffectiveConfig,
    ) -> Result<DaemonSet, RenderError> {
        let descriptor = kind.descriptor();
        require(TEMPLATE_NODE_PLUGIN, "plugin image", config.plugin_image(kind))?;
        require(TEMPLATE_NODE_PLUGIN, "registrar image", &config.images.registrar)?;

        debug!(driver = %kind, name = descriptor.plugin_name, "Rendering node plugin");

        let labels = workload_labels(descriptor, descriptor.plugin_name, COMPONENT_NODE_PLUGIN);
        let pod_labels = pod_labels(descriptor, &labels, config);

        Ok(DaemonSet {
            metadata: object_meta(descriptor.plugin_name, config, &labels),
            spec: Some(DaemonSetSpec {
                selector: app_selector(descriptor.plugin_name),
                update_strategy: Some(DaemonSetUpdateStrategy {
                    type_: Some(config.update_strategy.get(kind).as_str().to_string()),
                    ..Default::default()
                }),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        ..Default::default()
                    }),
                    spec: Some(node_plugin_pod_spec(kind, config)),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn render_provisioner(
        &self,
        kind: DriverKind,
        config: &EffectiveConfig,
    ) -> Result<Deployment, RenderError> {
        let descriptor = kind.descriptor();
        require(TEMPLATE_PROVISIONER, "plugin image", &config.images.plugin)?;
        require(TEMPLATE_PROVISIONER, "provisioner image", &config.images.provisioner)?;
        require(TEMPLATE_PROVISIONER, "attacher image", &config.images.attacher)?;

        debug!(
            driver = %kind,
            name = descriptor.provisioner_name,
            replicas = config.provisioner_replicas,
            "Rendering provisioner"
        );

        let labels = workload_labels(
            descriptor,
            descriptor.provisioner_name,
            COMPONENT_PROVISIONER,
        );
        let pod_labels = pod_labels(descriptor, &labels, config);

        Ok(Deployment {
            metadata: object_meta(descriptor.provisioner_name, config, &labels),
            spec: Some(DeploymentSpec {
                replicas: Some(config.provisioner_replicas),
                selector: app_selector(descriptor.provisioner_name),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        ..Default::default()
                    }),
                    spec: Some(provisioner_pod_spec(kind, config)),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn render_service(
        &self,
        kind: DriverKind,
        config: &EffectiveConfig,
    ) -> Result<Service, RenderError> {
        let descriptor = kind.descriptor();
        let Some((grpc_port, liveness_port)) = config
            .ports
            .for_driver(kind)
            .filter(|_| descriptor.has_service)
        else {
            return Err(RenderError::NoTemplate {
                template: TEMPLATE_METRICS_SERVICE.to_string(),
                driver: kind.to_string(),
            });
        };

        let labels = workload_labels(descriptor, descriptor.service_name, COMPONENT_METRICS);
        let mut ports = vec![service_port("csi-http-metrics", 8080, liveness_port)];
        if config.enable_grpc_metrics {
            ports.push(service_port("csi-grpc-metrics", 8081, grpc_port));
        }

        Ok(Service {
            metadata: object_meta(descriptor.service_name, config, &labels),
            spec: Some(ServiceSpec {
                selector: Some(BTreeMap::from([(
                    CONTAINS_LABEL.to_string(),
                    descriptor.service_name.to_string(),
                )])),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

fn require(template: &str, field: &'static str, value: &str) -> Result<(), RenderError> {
    if value.trim().is_empty() {
        return Err(RenderError::MissingField {
            template: template.to_string(),
            field,
        });
    }
    Ok(())
}

fn workload_labels(
    descriptor: &DriverDescriptor,
    app: &str,
    component: &str,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), app.to_string()),
        (K8S_NAME.to_string(), app.to_string()),
        (K8S_COMPONENT.to_string(), component.to_string()),
        (K8S_PART_OF.to_string(), PART_OF_CEPH_CSI.to_string()),
        (K8S_MANAGED_BY.to_string(), MANAGED_BY_CSI_OPERATOR.to_string()),
        (CONTAINS_LABEL.to_string(), descriptor.service_name.to_string()),
    ])
}

/// Pod labels: user labels first, operator labels win on conflict.
fn pod_labels(
    descriptor: &DriverDescriptor,
    labels: &BTreeMap<String, String>,
    config: &EffectiveConfig,
) -> BTreeMap<String, String> {
    let mut merged = config.pod_labels.get(descriptor.kind).clone();
    merged.extend(labels.clone());
    merged
}

fn object_meta(name: &str, config: &EffectiveConfig, labels: &BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(config.namespace.clone()),
        labels: Some(labels.clone()),
        ..Default::default()
    }
}

fn app_selector(app: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([(APP_LABEL.to_string(), app.to_string())])),
        ..Default::default()
    }
}

fn service_port(name: &str, port: i32, target: u16) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        protocol: Some("TCP".to_string()),
        target_port: Some(IntOrString::Int(i32::from(target))),
        ..Default::default()
    }
}

fn node_plugin_pod_spec(kind: DriverKind, config: &EffectiveConfig) -> PodSpec {
    let descriptor = kind.descriptor();
    let driver_name = config.driver_names.get(kind);
    let kubelet = config.kubelet_dir_path.trim_end_matches('/');
    let plugin_dir = format!("{kubelet}/plugins/{driver_name}");

    let registrar = Container {
        name: "driver-registrar".to_string(),
        image: Some(config.images.registrar.clone()),
        args: Some(vec![
            format!("--v={}", config.log_level),
            format!("--csi-address={SOCKET_DIR}/csi.sock"),
            format!("--kubelet-registration-path={plugin_dir}/csi.sock"),
        ]),
        env: Some(vec![field_env("KUBE_NODE_NAME", "spec.nodeName")]),
        volume_mounts: Some(vec![
            mount("plugin-dir", SOCKET_DIR),
            mount("registration-dir", "/registration"),
        ]),
        ..Default::default()
    };

    let plugin_args = match kind {
        DriverKind::Nfs => nfs_node_args(config),
        DriverKind::Rbd | DriverKind::CephFs => {
            let mut args = driver_args(kind, config, SOCKET_ADDRESS);
            args.push("--nodeserver=true".to_string());
            if kind == DriverKind::CephFs && config.force_cephfs_kernel_client {
                args.push("--forcecephkernelclient=true".to_string());
            }
            args
        }
    };

    let mut plugin_mounts = vec![
        mount("plugin-dir", SOCKET_DIR),
        bidirectional_mount("pods-mount-dir", &format!("{kubelet}/pods")),
        bidirectional_mount("plugin-mount-dir", &format!("{kubelet}/plugins")),
        mount("host-dev", "/dev"),
        mount("host-sys", "/sys"),
        read_only_mount("lib-modules", "/lib/modules"),
    ];
    if config.enable_selinux_host_mount {
        plugin_mounts.push(mount("etc-selinux", "/etc/selinux"));
    }
    if config.enable_oidc_token_projection {
        plugin_mounts.push(read_only_mount("oidc-token", OIDC_TOKEN_DIR));
    }

    let mut containers = vec![
        registrar,
        Container {
            name: descriptor.plugin_name.to_string(),
            image: Some(config.plugin_image(kind).to_string()),
            args: Some(plugin_args),
            env: Some(driver_env()),
            security_context: Some(privileged()),
            volume_mounts: Some(plugin_mounts),
            ..Default::default()
        },
    ];
    if let Some((_, liveness_port)) = config.ports.for_driver(kind) {
        containers.push(liveness_container(
            config,
            liveness_port,
            "plugin-dir",
            SOCKET_ADDRESS,
        ));
    }
    if kind == DriverKind::Rbd && config.enable_csi_addons {
        containers.push(csi_addons_container(config, "plugin-dir"));
    }

    let mut volumes = vec![
        host_path_volume("plugin-dir", &plugin_dir, Some("DirectoryOrCreate")),
        host_path_volume(
            "registration-dir",
            &format!("{kubelet}/plugins_registry"),
            Some("Directory"),
        ),
        host_path_volume("pods-mount-dir", &format!("{kubelet}/pods"), Some("Directory")),
        host_path_volume("plugin-mount-dir", &format!("{kubelet}/plugins"), Some("Directory")),
        host_path_volume("host-dev", "/dev", None),
        host_path_volume("host-sys", "/sys", None),
        host_path_volume("lib-modules", "/lib/modules", None),
    ];
    if config.enable_selinux_host_mount {
        volumes.push(host_path_volume("etc-selinux", "/etc/selinux", None));
    }
    if config.enable_oidc_token_projection {
        volumes.push(oidc_token_volume());
    }

    PodSpec {
        service_account_name: Some(format!("csi-{}-plugin-sa", kind.as_str())),
        host_network: Some(config.enable_host_network),
        host_pid: Some(true),
        dns_policy: Some("ClusterFirstWithHostNet".to_string()),
        priority_class_name: config.plugin_priority_class.clone(),
        containers,
        volumes: Some(volumes),
        ..Default::default()
    }
}

fn provisioner_pod_spec(kind: DriverKind, config: &EffectiveConfig) -> PodSpec {
    let descriptor = kind.descriptor();
    let timeout = format!("--timeout={}s", config.grpc_timeout_secs);
    let sidecar_args = |extra: &[&str]| -> Vec<String> {
        let mut args = vec![
            format!("--csi-address={SOCKET_DIR}/csi-provisioner.sock"),
            format!("--v={}", config.log_level),
            timeout.clone(),
            "--leader-election=true".to_string(),
            format!("--leader-election-namespace={}", config.namespace),
        ];
        args.extend(extra.iter().map(|arg| (*arg).to_string()));
        args
    };

    let mut containers = vec![
        sidecar(
            "csi-provisioner",
            &config.images.provisioner,
            sidecar_args(&["--retry-interval-start=500ms", "--default-fstype=ext4"]),
        ),
        sidecar(
            "csi-attacher",
            &config.images.attacher,
            sidecar_args(&["--retry-interval-start=500ms"]),
        ),
        sidecar(
            "csi-resizer",
            &config.images.resizer,
            sidecar_args(&["--handle-volume-inuse-error=false"]),
        ),
    ];
    if config.snapshotter_enabled(kind) {
        containers.push(sidecar(
            "csi-snapshotter",
            &config.images.snapshotter,
            sidecar_args(&[]),
        ));
    }

    let endpoint = format!("unix://{SOCKET_DIR}/csi-provisioner.sock");
    let mut plugin_args = driver_args(kind, config, &endpoint);
    plugin_args.push("--controllerserver=true".to_string());

    let mut plugin_mounts = vec![
        mount("socket-dir", SOCKET_DIR),
        mount("host-dev", "/dev"),
        mount("host-sys", "/sys"),
        read_only_mount("lib-modules", "/lib/modules"),
    ];
    if config.enable_oidc_token_projection {
        plugin_mounts.push(read_only_mount("oidc-token", OIDC_TOKEN_DIR));
    }
    containers.push(Container {
        name: descriptor.plugin_name.to_string(),
        image: Some(config.images.plugin.clone()),
        args: Some(plugin_args),
        env: Some(driver_env()),
        volume_mounts: Some(plugin_mounts),
        ..Default::default()
    });

    if let Some((_, liveness_port)) = config.ports.for_driver(kind) {
        containers.push(liveness_container(
            config,
            liveness_port,
            "socket-dir",
            &endpoint,
        ));
    }
    if kind == DriverKind::Rbd {
        if config.enable_omap_generator {
            containers.push(sidecar(
                "csi-omap-generator",
                &config.images.plugin,
                vec![
                    "--type=controller".to_string(),
                    format!("--drivernamespace={}", config.namespace),
                    format!("--v={}", config.log_level),
                    format!("--drivername={}", config.driver_names.rbd),
                ],
            ));
        }
        if config.enable_volume_replication {
            containers.push(sidecar(
                "volume-replication",
                &config.images.volume_replication,
                vec![
                    "--metrics-bind-address=0".to_string(),
                    "--leader-election-namespace=$(NAMESPACE)".to_string(),
                    format!("--driver-name={}", config.driver_names.rbd),
                    format!("--csi-address={SOCKET_DIR}/csi-provisioner.sock"),
                    format!("--rpc-timeout={}s", config.grpc_timeout_secs),
                ],
            ));
        }
        if config.enable_csi_addons {
            containers.push(csi_addons_container(config, "socket-dir"));
        }
    }

    let mut volumes = vec![
        Volume {
            name: "socket-dir".to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some("Memory".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        host_path_volume("host-dev", "/dev", None),
        host_path_volume("host-sys", "/sys", None),
        host_path_volume("lib-modules", "/lib/modules", None),
    ];
    if config.enable_oidc_token_projection {
        volumes.push(oidc_token_volume());
    }

    PodSpec {
        service_account_name: Some(format!("csi-{}-provisioner-sa", kind.as_str())),
        priority_class_name: config.provisioner_priority_class.clone(),
        containers,
        volumes: Some(volumes),
        ..Default::default()
    }
}

/// Arguments shared by the node and controller flavors of the cephcsi container.
fn driver_args(kind: DriverKind, config: &EffectiveConfig, endpoint: &str) -> Vec<String> {
    let mut args = vec![
        "--nodeid=$(NODE_ID)".to_string(),
        format!("--endpoint={endpoint}"),
        format!("--v={}", config.log_level),
        format!("--type={}", kind.as_str()),
        format!("--drivername={}", config.driver_names.get(kind)),
        "--pidlimit=-1".to_string(),
    ];
    if let Some((grpc_port, _)) = config.ports.for_driver(kind) {
        args.push(format!("--metricsport={grpc_port}"));
        if config.enable_grpc_metrics {
            args.push("--enablegrpcmetrics=true".to_string());
        }
    }
    args
}

/// The nfs-csi node server only understands its own flags.
fn nfs_node_args(config: &EffectiveConfig) -> Vec<String> {
    vec![
        format!("--v={}", config.log_level),
        "--nodeid=$(NODE_ID)".to_string(),
        format!("--endpoint={SOCKET_ADDRESS}"),
        format!("--drivername={}", config.driver_names.nfs),
    ]
}

fn driver_env() -> Vec<EnvVar> {
    vec![
        field_env("POD_IP", "status.podIP"),
        field_env("NODE_ID", "spec.nodeName"),
        field_env("POD_NAMESPACE", "metadata.namespace"),
    ]
}

fn liveness_container(
    config: &EffectiveConfig,
    port: u16,
    socket_volume: &str,
    endpoint: &str,
) -> Container {
    Container {
        name: "liveness-prometheus".to_string(),
        image: Some(config.images.plugin.clone()),
        args: Some(vec![
            "--type=liveness".to_string(),
            format!("--endpoint={endpoint}"),
            format!("--metricsport={port}"),
            "--metricspath=/metrics".to_string(),
            "--polltime=60s".to_string(),
            "--timeout=3s".to_string(),
        ]),
        env: Some(vec![field_env("POD_IP", "status.podIP")]),
        volume_mounts: Some(vec![mount(socket_volume, SOCKET_DIR)]),
        ..Default::default()
    }
}

fn csi_addons_container(config: &EffectiveConfig, socket_volume: &str) -> Container {
    Container {
        name: "csi-addons".to_string(),
        image: Some(config.images.csi_addons.clone()),
        args: Some(vec![
            "--node-id=$(NODE_ID)".to_string(),
            format!("--v={}", config.log_level),
            format!("--csi-addons-address={SOCKET_DIR}/csi-addons.sock"),
            format!("--controller-port={}", config.ports.csi_addons),
            "--pod=$(POD_NAME)".to_string(),
            "--namespace=$(POD_NAMESPACE)".to_string(),
        ]),
        ports: Some(vec![ContainerPort {
            container_port: i32::from(config.ports.csi_addons),
            ..Default::default()
        }]),
        env: Some(vec![
            field_env("NODE_ID", "spec.nodeName"),
            field_env("POD_NAME", "metadata.name"),
            field_env("POD_NAMESPACE", "metadata.namespace"),
        ]),
        volume_mounts: Some(vec![mount(socket_volume, SOCKET_DIR)]),
        ..Default::default()
    }
}

fn sidecar(name: &str, image: &str, args: Vec<String>) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        args: Some(args),
        volume_mounts: Some(vec![mount("socket-dir", SOCKET_DIR)]),
        ..Default::default()
    }
}

fn privileged() -> SecurityContext {
    SecurityContext {
        privileged: Some(true),
        allow_privilege_escalation: Some(true),
        capabilities: Some(Capabilities {
            add: Some(vec!["SYS_ADMIN".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn read_only_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        read_only: Some(true),
        ..mount(name, path)
    }
}

fn bidirectional_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        mount_propagation: Some("Bidirectional".to_string()),
        ..mount(name, path)
    }
}

fn host_path_volume(name: &str, path: &str, type_: Option<&str>) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: type_.map(str::to_string),
        }),
        ..Default::default()
    }
}

fn oidc_token_volume() -> Volume {
    Volume {
        name: "oidc-token".to_string(),
        projected: Some(ProjectedVolumeSource {
            sources: Some(vec![VolumeProjection {
                service_account_token: Some(ServiceAccountTokenProjection {
                    path: "oidc-token".to_string(),
                    expiration_seconds: Some(OIDC_TOKEN_EXPIRATION_SECS),
                    audience: Some(OIDC_TOKEN_AUDIENCE.to_string()),
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
#[path = "manifests_tests.rs"]
mod manifests_tests;
