// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Reconciliation pass tests against in-memory collaborators.
//!
//! Run with: cargo test --test reconcile_pass

mod common;

use common::*;
use csi_operator::cluster::DriverRegistration;
use csi_operator::config::{EffectiveConfig, Parameters};
use csi_operator::driver::DriverKind;
use csi_operator::errors::{ApplyAction, ProbeError, ReconcileError, RenderError, SetupError};
use csi_operator::labels::NETWORKS_ANNOTATION;
use csi_operator::manifests::{BuiltinRenderer, ManifestRenderer};
use csi_operator::reconciler::{reconcile_pass, ComponentOutcome};
use csi_operator::registration::RegistrationVariant;
use csi_operator::version::ClusterVersion;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::Service;
use std::sync::Arc;

const RBD_DRIVER: &str = "rook-ceph.rbd.csi.ceph.com";
const CEPHFS_DRIVER: &str = "rook-ceph.cephfs.csi.ceph.com";

fn modern() -> ClusterVersion {
    ClusterVersion::new(1, 24)
}

/// Built-in manifests, except that provisioners ask for host networking.
struct HostNetworkProvisioner;

impl ManifestRenderer for HostNetworkProvisioner {
    fn render_node_plugin(
        &self,
        kind: DriverKind,
        config: &EffectiveConfig,
    ) -> Result<DaemonSet, RenderError> {
        BuiltinRenderer.render_node_plugin(kind, config)
    }

    fn render_provisioner(
        &self,
        kind: DriverKind,
        config: &EffectiveConfig,
    ) -> Result<Deployment, RenderError> {
        let mut deployment = BuiltinRenderer.render_provisioner(kind, config)?;
        if let Some(pod_spec) = deployment
            .spec
            .as_mut()
            .and_then(|spec| spec.template.spec.as_mut())
        {
            pod_spec.host_network = Some(true);
        }
        Ok(deployment)
    }

    fn render_service(
        &self,
        kind: DriverKind,
        config: &EffectiveConfig,
    ) -> Result<Service, RenderError> {
        BuiltinRenderer.render_service(kind, config)
    }
}

fn position(calls: &[String], call: &str) -> usize {
    calls
        .iter()
        .position(|c| c == call)
        .unwrap_or_else(|| panic!("missing call {call:?} in {calls:?}"))
}

#[tokio::test]
async fn test_first_pass_creates_enabled_drivers() {
    let harness = Harness::default();

    let report = reconcile_pass(&harness.ctx, &inputs(Parameters::new(), modern()))
        .await
        .unwrap();

    assert!(report.is_converged());
    assert_eq!(report.variant, RegistrationVariant::Current);
    assert_eq!(harness.probe.runs(), 1);
    assert!(matches!(
        report.outcome(DriverKind::Rbd),
        Some(ComponentOutcome::Applied { changed: true })
    ));
    assert!(matches!(
        report.outcome(DriverKind::Nfs),
        Some(ComponentOutcome::Removed { deleted: 0 })
    ));

    let calls = harness.cluster.calls();
    for workload in [
        "create DaemonSet csi-rbdplugin",
        "create Deployment csi-rbdplugin-provisioner",
        "create Service csi-rbdplugin-metrics",
        "create DaemonSet csi-cephfsplugin",
        "create Deployment csi-cephfsplugin-provisioner",
        "create Service csi-cephfsplugin-metrics",
    ] {
        let registration = format!("create CSIDriver storage.k8s.io/v1 {RBD_DRIVER}");
        assert!(position(&calls, workload) < position(&calls, &registration));
    }
    assert_eq!(calls.len(), 8);
    assert!(calls.iter().all(|call| !call.contains("nfs")));
}

#[tokio::test]
async fn test_identical_pass_changes_nothing() {
    let harness = Harness::default();
    let inputs = inputs(Parameters::new(), modern());

    reconcile_pass(&harness.ctx, &inputs).await.unwrap();
    harness.cluster.clear_calls();

    let report = reconcile_pass(&harness.ctx, &inputs).await.unwrap();

    assert!(report.is_converged());
    assert!(harness.cluster.calls().is_empty());
    assert!(matches!(
        report.outcome(DriverKind::CephFs),
        Some(ComponentOutcome::Applied { changed: false })
    ));
}

#[tokio::test]
async fn test_disabling_a_driver_tears_it_down_in_order() {
    let harness = Harness::default();
    reconcile_pass(&harness.ctx, &inputs(Parameters::new(), modern()))
        .await
        .unwrap();
    harness.cluster.clear_calls();

    let disabled = inputs(Parameters::new().with("CSI_ENABLE_CEPHFS", "false"), modern());
    let report = reconcile_pass(&harness.ctx, &disabled).await.unwrap();

    assert_eq!(
        harness.cluster.calls(),
        vec![
            "delete DaemonSet csi-cephfsplugin".to_string(),
            "delete Deployment csi-cephfsplugin-provisioner".to_string(),
            "delete Service csi-cephfsplugin-metrics".to_string(),
            format!("delete CSIDriver storage.k8s.io/v1 {CEPHFS_DRIVER}"),
        ]
    );
    assert!(matches!(
        report.outcome(DriverKind::CephFs),
        Some(ComponentOutcome::Removed { deleted: 4 })
    ));
    assert!(harness.cluster.daemon_set("csi-rbdplugin").is_some());

    harness.cluster.clear_calls();
    reconcile_pass(&harness.ctx, &disabled).await.unwrap();
    assert!(harness.cluster.calls().is_empty());
}

#[tokio::test]
async fn test_teardown_failure_is_retried_next_pass() {
    let harness = Harness::default();
    reconcile_pass(&harness.ctx, &inputs(Parameters::new(), modern()))
        .await
        .unwrap();

    harness
        .cluster
        .fail("delete Deployment csi-cephfsplugin-provisioner");
    let disabled = inputs(Parameters::new().with("CSI_ENABLE_CEPHFS", "false"), modern());
    let report = reconcile_pass(&harness.ctx, &disabled).await.unwrap();

    assert!(!report.is_converged());
    assert!(harness.cluster.daemon_set("csi-cephfsplugin").is_none());
    assert!(harness
        .cluster
        .deployment("csi-cephfsplugin-provisioner")
        .is_some());
    assert!(harness
        .cluster
        .registration(RegistrationVariant::Current, CEPHFS_DRIVER)
        .is_some());

    harness.cluster.clear_failures();
    let report = reconcile_pass(&harness.ctx, &disabled).await.unwrap();

    assert!(report.is_converged());
    assert!(matches!(
        report.outcome(DriverKind::CephFs),
        Some(ComponentOutcome::Removed { deleted: 3 })
    ));
}

#[tokio::test]
async fn test_secondary_network_disables_host_network_on_node_plugin() {
    let harness = Harness::new(
        FakeCluster::default(),
        FakeNetwork::multus(&["rook-ceph/public-net"]),
        FakeProbe::default(),
    );

    reconcile_pass(&harness.ctx, &inputs(Parameters::new(), modern()))
        .await
        .unwrap();

    let daemon_set = harness.cluster.daemon_set("csi-rbdplugin").unwrap();
    let template = daemon_set.spec.unwrap().template;
    assert_eq!(template.spec.unwrap().host_network, Some(false));
    assert_eq!(
        template
            .metadata
            .unwrap()
            .annotations
            .unwrap()
            .get(NETWORKS_ANNOTATION)
            .map(String::as_str),
        Some("rook-ceph/public-net")
    );

    let deployment = harness
        .cluster
        .deployment("csi-rbdplugin-provisioner")
        .unwrap();
    let annotations = deployment
        .spec
        .unwrap()
        .template
        .metadata
        .unwrap()
        .annotations
        .unwrap();
    assert_eq!(
        annotations.get(NETWORKS_ANNOTATION).map(String::as_str),
        Some("rook-ceph/public-net")
    );
}

#[tokio::test]
async fn test_secondary_network_disables_host_network_on_provisioner() {
    let mut harness = Harness::new(
        FakeCluster::default(),
        FakeNetwork::multus(&["rook-ceph/public-net"]),
        FakeProbe::default(),
    );
    harness.ctx.renderer = Arc::new(HostNetworkProvisioner);

    reconcile_pass(&harness.ctx, &inputs(Parameters::new(), modern()))
        .await
        .unwrap();

    for name in ["csi-rbdplugin-provisioner", "csi-cephfsplugin-provisioner"] {
        let pod_spec = harness
            .cluster
            .deployment(name)
            .unwrap()
            .spec
            .unwrap()
            .template
            .spec
            .unwrap();
        assert_eq!(pod_spec.host_network, Some(false), "{name}");
    }
}

#[tokio::test]
async fn test_provisioner_keeps_host_network_without_secondary_network() {
    let mut harness = Harness::default();
    harness.ctx.renderer = Arc::new(HostNetworkProvisioner);

    reconcile_pass(&harness.ctx, &inputs(Parameters::new(), modern()))
        .await
        .unwrap();

    let pod_spec = harness
        .cluster
        .deployment("csi-rbdplugin-provisioner")
        .unwrap()
        .spec
        .unwrap()
        .template
        .spec
        .unwrap();
    assert_eq!(pod_spec.host_network, Some(true));
}

#[tokio::test]
async fn test_probe_failure_aborts_before_any_change() {
    let harness = Harness::new(
        FakeCluster::default(),
        FakeNetwork::default(),
        FakeProbe::output("boom", 1),
    );

    let error = reconcile_pass(&harness.ctx, &inputs(Parameters::new(), modern()))
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        ReconcileError::Probe(ProbeError::JobFailed { code: 1 })
    ));
    assert_eq!(error.category(), "probe_error");
    assert!(harness.cluster.calls().is_empty());
}

#[tokio::test]
async fn test_unsupported_driver_version_aborts() {
    let harness = Harness::new(
        FakeCluster::default(),
        FakeNetwork::default(),
        FakeProbe::version("v3.3.0"),
    );

    let error = reconcile_pass(&harness.ctx, &inputs(Parameters::new(), modern()))
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        ReconcileError::Probe(ProbeError::Unsupported { .. })
    ));
    assert!(harness.cluster.calls().is_empty());
}

#[tokio::test]
async fn test_missing_plugin_image_is_a_setup_error() {
    let harness = Harness::default();

    let error = reconcile_pass(
        &harness.ctx,
        &inputs(Parameters::new().with("CSI_CEPH_IMAGE", ""), modern()),
    )
    .await
    .unwrap_err();

    assert!(matches!(
        error,
        ReconcileError::Setup(SetupError::MissingImage { .. })
    ));
    assert_eq!(harness.probe.runs(), 0);
    assert!(harness.cluster.calls().is_empty());
}

#[tokio::test]
async fn test_invalid_port_is_a_config_error() {
    let harness = Harness::default();

    let error = reconcile_pass(
        &harness.ctx,
        &inputs(
            Parameters::new().with("CSI_RBD_GRPC_METRICS_PORT", "not-a-port"),
            modern(),
        ),
    )
    .await
    .unwrap_err();

    assert!(matches!(error, ReconcileError::Config(_)));
    assert!(harness.cluster.calls().is_empty());
}

#[tokio::test]
async fn test_all_drivers_disabled_skips_probe() {
    let harness = Harness::default();
    let params = Parameters::new()
        .with("CSI_ENABLE_RBD", "false")
        .with("CSI_ENABLE_CEPHFS", "false");

    let report = reconcile_pass(&harness.ctx, &inputs(params, modern()))
        .await
        .unwrap();

    assert!(report.is_converged());
    assert!(report.driver_version.is_none());
    assert_eq!(harness.probe.runs(), 0);
    assert!(harness.cluster.calls().is_empty());
}

#[tokio::test]
async fn test_single_node_cluster_runs_one_provisioner() {
    let harness = Harness::new(
        FakeCluster::with_nodes(1),
        FakeNetwork::default(),
        FakeProbe::default(),
    );

    reconcile_pass(
        &harness.ctx,
        &inputs(Parameters::new().with("CSI_PROVISIONER_REPLICAS", "3"), modern()),
    )
    .await
    .unwrap();

    let deployment = harness
        .cluster
        .deployment("csi-rbdplugin-provisioner")
        .unwrap();
    assert_eq!(deployment.spec.unwrap().replicas, Some(1));
}

#[tokio::test]
async fn test_provisioner_is_owned_and_spread() {
    let harness = Harness::default();

    reconcile_pass(&harness.ctx, &inputs(Parameters::new(), modern()))
        .await
        .unwrap();

    let deployment = harness
        .cluster
        .deployment("csi-cephfsplugin-provisioner")
        .unwrap();
    let owners = deployment.metadata.owner_references.clone().unwrap();
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].uid, owner().uid);
    assert_eq!(owners[0].controller, Some(true));

    let spec = deployment.spec.unwrap();
    assert_eq!(
        spec.strategy.unwrap().type_.as_deref(),
        Some("Recreate")
    );
    let affinity = spec.template.spec.unwrap().affinity.unwrap();
    assert!(affinity.pod_anti_affinity.is_some());

    let service = harness.cluster.service("csi-cephfsplugin-metrics").unwrap();
    assert_eq!(
        service.metadata.owner_references.unwrap()[0].name,
        "csi-operator"
    );
    let daemon_set = harness.cluster.daemon_set("csi-cephfsplugin").unwrap();
    assert!(daemon_set.metadata.owner_references.is_some());
}

#[tokio::test]
async fn test_legacy_registrations_removed_before_current_ones_created() {
    let harness = Harness::default();
    harness.cluster.insert_registration(
        RegistrationVariant::Legacy,
        DriverRegistration {
            name: RBD_DRIVER.to_string(),
            attach_required: true,
            pod_info_on_mount: false,
            fs_group_policy: None,
        },
    );

    let report = reconcile_pass(
        &harness.ctx,
        &inputs(Parameters::new(), ClusterVersion::new(1, 20)),
    )
    .await
    .unwrap();

    assert_eq!(report.legacy_removed, 1);
    let calls = harness.cluster.calls();
    let removed = position(
        &calls,
        &format!("delete CSIDriver storage.k8s.io/v1beta1 {RBD_DRIVER}"),
    );
    let created = position(
        &calls,
        &format!("create CSIDriver storage.k8s.io/v1 {RBD_DRIVER}"),
    );
    assert!(removed < created);
    assert_eq!(removed, 0);
}

#[tokio::test]
async fn test_old_cluster_uses_legacy_registration() {
    let harness = Harness::default();

    let report = reconcile_pass(
        &harness.ctx,
        &inputs(Parameters::new(), ClusterVersion::new(1, 17)),
    )
    .await
    .unwrap();

    assert_eq!(report.variant, RegistrationVariant::Legacy);
    assert!(harness
        .cluster
        .registration(RegistrationVariant::Legacy, RBD_DRIVER)
        .is_some());
    assert!(harness
        .cluster
        .registration(RegistrationVariant::Current, RBD_DRIVER)
        .is_none());
}

#[tokio::test]
async fn test_failed_driver_is_not_registered_and_others_proceed() {
    let harness = Harness::default();
    harness
        .cluster
        .fail("create Deployment csi-rbdplugin-provisioner");
    let inputs = inputs(Parameters::new(), modern());

    let report = reconcile_pass(&harness.ctx, &inputs).await.unwrap();

    assert!(!report.is_converged());
    match report.outcome(DriverKind::Rbd) {
        Some(ComponentOutcome::Failed(e)) => {
            assert_eq!(e.action(), ApplyAction::CreateOrUpdate);
            assert_eq!(e.kind(), "Deployment");
            assert_eq!(e.name(), "csi-rbdplugin-provisioner");
        }
        other => panic!("expected rbd failure, got {other:?}"),
    }
    assert!(harness
        .cluster
        .registration(RegistrationVariant::Current, RBD_DRIVER)
        .is_none());
    assert!(harness
        .cluster
        .registration(RegistrationVariant::Current, CEPHFS_DRIVER)
        .is_some());
    assert!(!report.outcome(DriverKind::CephFs).unwrap().is_failed());

    harness.cluster.clear_failures();
    let report = reconcile_pass(&harness.ctx, &inputs).await.unwrap();

    assert!(report.is_converged());
    assert!(harness
        .cluster
        .registration(RegistrationVariant::Current, RBD_DRIVER)
        .is_some());
}

#[tokio::test]
async fn test_changed_node_plugin_is_a_conflict() {
    let harness = Harness::default();
    reconcile_pass(&harness.ctx, &inputs(Parameters::new(), modern()))
        .await
        .unwrap();

    let report = reconcile_pass(
        &harness.ctx,
        &inputs(Parameters::new().with("CSI_LOG_LEVEL", "5"), modern()),
    )
    .await
    .unwrap();

    match report.outcome(DriverKind::Rbd) {
        Some(ComponentOutcome::Failed(e)) => {
            assert_eq!(e.action(), ApplyAction::Create);
            assert_eq!(e.kind(), "DaemonSet");
        }
        other => panic!("expected a conflict, got {other:?}"),
    }
}
