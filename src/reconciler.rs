// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! The reconciliation pass.
//!
//! One call to [`reconcile_pass`] brings every driver to the state its enablement flag
//! asks for. The order is fixed:
//!
//! 1. Resolve the [`EffectiveConfig`] (setup and port errors abort the pass)
//! 2. Probe the driver image version when any driver is enabled (probe errors abort the pass)
//! 3. Select the registration variant and remove legacy registrations (best effort)
//! 4. Apply node plugin, provisioner and service of every enabled driver
//! 5. Ensure the registration of every driver whose workloads were applied
//! 6. Tear down every disabled driver: node plugin, provisioner, service, registration
//!
//! A failing step of one driver is recorded in its [`ComponentOutcome`] and skips the
//! rest of that driver only. Nothing is cached between passes; running the pass again
//! after a partial failure converges to the same end state.

use crate::cluster::{
    stamp_spec_hash, ApplyOutcome, ClusterClient, DeleteOutcome, NetworkInventory,
};
use crate::config::{resolve_config, EffectiveConfig, ImageSet, Parameters};
use crate::constants::DEPLOYMENT_STRATEGY_RECREATE;
use crate::driver::{DriverKind, PerDriver};
use crate::errors::{ApplyAction, ApplyError, ApplySource, ClusterError, ReconcileError, RenderError};
use crate::labels::APP_LABEL;
use crate::manifests::{ManifestRenderer, TEMPLATE_NODE_PLUGIN, TEMPLATE_PROVISIONER};
use crate::metrics;
use crate::overrides::{
    apply_network_config, apply_placement, apply_resources, pod_anti_affinity,
    resolve_overrides, shared_placement, ComponentRole, OverrideSpec, OwnerInfo,
};
use crate::probe::{probe_driver_version, ProbeRequest, VersionProbeRunner};
use crate::registration::{
    desired_registration, ensure_registration, migrate_legacy_registrations,
    remove_registration, select_variant, RegistrationOutcome, RegistrationVariant,
    REGISTRATION_KIND,
};
use crate::version::{ClusterVersion, DriverVersion};
use k8s_openapi::api::apps::v1::DeploymentStrategy;
use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec, Service};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const KIND_DAEMON_SET: &str = "DaemonSet";
const KIND_DEPLOYMENT: &str = "Deployment";
const KIND_SERVICE: &str = "Service";

/// Collaborators shared by every pass.
#[derive(Clone)]
pub struct Context {
    pub cluster: Arc<dyn ClusterClient>,
    pub network: Arc<dyn NetworkInventory>,
    pub probe: Arc<dyn VersionProbeRunner>,
    pub renderer: Arc<dyn ManifestRenderer>,
    /// Base image references that parameters may override
    pub images: ImageSet,
}

/// Per-pass inputs, re-read by the caller before every pass.
#[derive(Debug, Clone)]
pub struct PassInputs {
    /// Namespace the driver components live in
    pub namespace: String,
    pub params: Parameters,
    pub cluster_version: ClusterVersion,
    /// Controller of every object the pass creates
    pub owner: OwnerInfo,
}

/// End state of one driver after a pass.
#[derive(Debug)]
pub enum ComponentOutcome {
    /// Enabled; workloads and registration are in place
    Applied {
        /// At least one object was created or updated
        changed: bool,
    },
    /// Disabled; every object is gone
    Removed {
        /// Number of objects actually deleted by this pass
        deleted: usize,
    },
    /// A step failed; the remaining steps of this driver were skipped
    Failed(ApplyError),
}

impl ComponentOutcome {
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Label value for metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Removed { .. } => "removed",
            Self::Failed(_) => "failed",
        }
    }
}

/// What one pass did.
#[derive(Debug)]
pub struct PassReport {
    pub variant: RegistrationVariant,
    /// `None` when every driver is disabled and no probe ran
    pub driver_version: Option<DriverVersion>,
    /// Legacy registrations removed while migrating to the current variant
    pub legacy_removed: usize,
    pub components: Vec<(DriverKind, ComponentOutcome)>,
}

impl PassReport {
    /// Outcome of one driver.
    #[must_use]
    pub fn outcome(&self, kind: DriverKind) -> Option<&ComponentOutcome> {
        self.components
            .iter()
            .find(|(component, _)| *component == kind)
            .map(|(_, outcome)| outcome)
    }

    /// Failed drivers and their errors.
    pub fn failures(&self) -> impl Iterator<Item = (DriverKind, &ApplyError)> {
        self.components
            .iter()
            .filter_map(|(kind, outcome)| match outcome {
                ComponentOutcome::Failed(e) => Some((*kind, e)),
                _ => None,
            })
    }

    /// True when every driver reached its desired state.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Run one reconciliation pass.
///
/// # Arguments
///
/// * `ctx` - Cluster, network, probe and renderer collaborators
/// * `inputs` - Parameters, cluster version, namespace and owner for this pass
///
/// # Errors
///
/// Returns [`ReconcileError`] when configuration, setup or the version probe fails.
/// In that case no object has been touched. Failures of individual drivers are
/// reported in the returned [`PassReport`] instead.
pub async fn reconcile_pass(
    ctx: &Context,
    inputs: &PassInputs,
) -> Result<PassReport, ReconcileError> {
    let node_count = match ctx.cluster.node_count().await {
        Ok(count) => Some(count),
        Err(e) => {
            warn!(error = %e, "Failed to count cluster nodes, keeping the replica default");
            None
        }
    };

    let config = resolve_config(
        &inputs.params,
        inputs.cluster_version,
        node_count,
        &ctx.images,
        &inputs.namespace,
    )?;
    debug!(
        namespace = %config.namespace,
        cluster_version = %config.cluster_version,
        rbd = config.enabled.rbd,
        cephfs = config.enabled.cephfs,
        nfs = config.enabled.nfs,
        "Resolved driver configuration"
    );

    let driver_version = if config.enabled.any() {
        let request = ProbeRequest::version_query(
            config.images.plugin.clone(),
            shared_placement(&inputs.params, ComponentRole::Provisioner),
        );
        let result = probe_driver_version(ctx.probe.as_ref(), &request).await?;
        Some(result.version)
    } else {
        None
    };

    let variant = select_variant(config.cluster_version);
    let legacy_removed =
        migrate_legacy_registrations(ctx.cluster.as_ref(), variant, &config).await;

    let mut outcomes: PerDriver<Option<ComponentOutcome>> = PerDriver::default();

    for kind in config.enabled.enabled() {
        let reconciler = ComponentReconciler {
            ctx,
            config: &config,
            params: &inputs.params,
            owner: &inputs.owner,
            kind,
        };
        let outcome = match reconciler.apply_workloads().await {
            Ok(changed) => ComponentOutcome::Applied { changed },
            Err(e) => {
                error!(driver = %kind, error = %e, "Failed to apply driver workloads");
                ComponentOutcome::Failed(e)
            }
        };
        *outcomes.get_mut(kind) = Some(outcome);
    }

    // Registrations only point at drivers whose workloads are all in place
    for kind in config.enabled.enabled() {
        let Some(ComponentOutcome::Applied { changed }) = outcomes.get(kind) else {
            continue;
        };
        let changed = *changed;
        let desired = desired_registration(kind, &config);
        let outcome = match ensure_registration(ctx.cluster.as_ref(), variant, &desired).await {
            Ok(registration) => {
                debug!(driver = %kind, outcome = ?registration, "Driver registration ensured");
                ComponentOutcome::Applied {
                    changed: changed
                        || registration != RegistrationOutcome::Unchanged,
                }
            }
            Err(e) => {
                error!(driver = %kind, error = %e, "Failed to register driver");
                ComponentOutcome::Failed(e)
            }
        };
        *outcomes.get_mut(kind) = Some(outcome);
    }

    for kind in DriverKind::ALL
        .into_iter()
        .filter(|kind| !config.enabled.get(*kind))
    {
        let outcome = match teardown(ctx.cluster.as_ref(), &config, variant, kind).await {
            Ok(deleted) => {
                if deleted > 0 {
                    info!(driver = %kind, deleted, "Removed disabled driver");
                }
                ComponentOutcome::Removed { deleted }
            }
            Err(e) => {
                error!(driver = %kind, error = %e, "Failed to remove disabled driver");
                ComponentOutcome::Failed(e)
            }
        };
        *outcomes.get_mut(kind) = Some(outcome);
    }

    let components: Vec<(DriverKind, ComponentOutcome)> = DriverKind::ALL
        .into_iter()
        .filter_map(|kind| outcomes.get_mut(kind).take().map(|outcome| (kind, outcome)))
        .collect();
    for (kind, outcome) in &components {
        metrics::record_component_outcome(kind.as_str(), outcome.as_str());
    }

    let report = PassReport {
        variant,
        driver_version,
        legacy_removed,
        components,
    };
    info!(
        %variant,
        converged = report.is_converged(),
        legacy_removed,
        "Reconciliation pass finished"
    );
    Ok(report)
}

/// Applies the workloads of one enabled driver.
struct ComponentReconciler<'a> {
    ctx: &'a Context,
    config: &'a EffectiveConfig,
    params: &'a Parameters,
    owner: &'a OwnerInfo,
    kind: DriverKind,
}

impl ComponentReconciler<'_> {
    /// Node plugin, provisioner, then service. Returns whether anything changed.
    async fn apply_workloads(&self) -> Result<bool, ApplyError> {
        let mut changed = self.apply_node_plugin().await?.mutated();
        changed |= self.apply_provisioner().await?.mutated();
        if self.kind.descriptor().has_service {
            changed |= self.apply_service().await?.mutated();
        }
        Ok(changed)
    }

    async fn apply_node_plugin(&self) -> Result<ApplyOutcome, ApplyError> {
        let name = self.kind.descriptor().plugin_name;
        let fail = |action, source: ApplySource| {
            ApplyError::new(action, KIND_DAEMON_SET, name, source)
        };

        let mut daemon_set = self
            .ctx
            .renderer
            .render_node_plugin(self.kind, self.config)
            .map_err(|e| fail(ApplyAction::Render, e.into()))?;

        let overrides = resolve_overrides(self.params, self.kind, ComponentRole::Plugin);
        let Some(spec) = daemon_set.spec.as_mut() else {
            return Err(fail(ApplyAction::Render, missing_spec(TEMPLATE_NODE_PLUGIN)));
        };
        apply_overrides(&mut spec.template, &overrides)
            .map_err(|e| fail(ApplyAction::Render, e.into()))?;

        self.owner
            .set_controller_reference(&mut daemon_set.metadata)
            .map_err(|e| fail(ApplyAction::SetOwner, e.into()))?;

        let multus = self
            .attach_networks(&mut spec.template)
            .await
            .map_err(|e| fail(ApplyAction::ApplyNetwork, e.into()))?;
        if multus {
            if let Some(pod_spec) = spec.template.spec.as_mut() {
                pod_spec.host_network = Some(false);
            }
            debug!(name, "Secondary network attached, host networking disabled");
        }

        stamp_spec_hash(&mut daemon_set).map_err(|e| fail(ApplyAction::Create, e.into()))?;
        let outcome = self
            .ctx
            .cluster
            .create_daemon_set(&daemon_set)
            .await
            .map_err(|e| fail(ApplyAction::Create, e.into()))?;
        record_apply(KIND_DAEMON_SET, name, outcome);
        Ok(outcome)
    }

    async fn apply_provisioner(&self) -> Result<ApplyOutcome, ApplyError> {
        let descriptor = self.kind.descriptor();
        let name = descriptor.provisioner_name;
        let fail = |action, source: ApplySource| {
            ApplyError::new(action, KIND_DEPLOYMENT, name, source)
        };

        let mut deployment = self
            .ctx
            .renderer
            .render_provisioner(self.kind, self.config)
            .map_err(|e| fail(ApplyAction::Render, e.into()))?;

        let overrides = resolve_overrides(self.params, self.kind, ComponentRole::Provisioner);
        let Some(spec) = deployment.spec.as_mut() else {
            return Err(fail(ApplyAction::Render, missing_spec(TEMPLATE_PROVISIONER)));
        };
        apply_overrides(&mut spec.template, &overrides)
            .map_err(|e| fail(ApplyAction::Render, e.into()))?;

        self.owner
            .set_controller_reference(&mut deployment.metadata)
            .map_err(|e| fail(ApplyAction::SetOwner, e.into()))?;

        let multus = self
            .attach_networks(&mut spec.template)
            .await
            .map_err(|e| fail(ApplyAction::ApplyNetwork, e.into()))?;
        if multus {
            if let Some(pod_spec) = spec.template.spec.as_mut() {
                pod_spec.host_network = Some(false);
            }
            debug!(name, "Secondary network attached, host networking disabled");
        }

        spec.strategy = Some(DeploymentStrategy {
            type_: Some(DEPLOYMENT_STRATEGY_RECREATE.to_string()),
            rolling_update: None,
        });
        if let Some(pod_spec) = spec.template.spec.as_mut() {
            pod_spec
                .affinity
                .get_or_insert_with(Default::default)
                .pod_anti_affinity = Some(pod_anti_affinity(APP_LABEL, name));
        }

        stamp_spec_hash(&mut deployment)
            .map_err(|e| fail(ApplyAction::CreateOrUpdate, e.into()))?;
        let outcome = self
            .ctx
            .cluster
            .create_or_update_deployment(&deployment)
            .await
            .map_err(|e| fail(ApplyAction::CreateOrUpdate, e.into()))?;
        record_apply(KIND_DEPLOYMENT, name, outcome);
        Ok(outcome)
    }

    async fn apply_service(&self) -> Result<ApplyOutcome, ApplyError> {
        let name = self.kind.descriptor().service_name;
        let fail = |action, source: ApplySource| {
            ApplyError::new(action, KIND_SERVICE, name, source)
        };

        let mut service: Service = self
            .ctx
            .renderer
            .render_service(self.kind, self.config)
            .map_err(|e| fail(ApplyAction::Render, e.into()))?;
        self.owner
            .set_controller_reference(&mut service.metadata)
            .map_err(|e| fail(ApplyAction::SetOwner, e.into()))?;

        stamp_spec_hash(&mut service).map_err(|e| fail(ApplyAction::CreateOrUpdate, e.into()))?;
        let outcome = self
            .ctx
            .cluster
            .create_or_update_service(&service)
            .await
            .map_err(|e| fail(ApplyAction::CreateOrUpdate, e.into()))?;
        record_apply(KIND_SERVICE, name, outcome);
        Ok(outcome)
    }

    async fn attach_networks(
        &self,
        template: &mut PodTemplateSpec,
    ) -> Result<bool, ClusterError> {
        let meta = template.metadata.get_or_insert_with(Default::default);
        apply_network_config(meta, self.ctx.network.as_ref(), &self.config.namespace).await
    }
}

/// Placement and resource overrides onto a rendered pod template.
fn apply_overrides(
    template: &mut PodTemplateSpec,
    overrides: &OverrideSpec,
) -> Result<(), RenderError> {
    let pod_spec: &mut PodSpec = template.spec.as_mut().ok_or(RenderError::MissingField {
        template: "pod template".to_string(),
        field: "spec",
    })?;
    apply_placement(pod_spec, &overrides.placement);
    apply_resources(pod_spec, &overrides.resources);
    Ok(())
}

fn missing_spec(template: &str) -> ApplySource {
    RenderError::MissingField {
        template: template.to_string(),
        field: "spec",
    }
    .into()
}

fn record_apply(kind: &str, name: &str, outcome: ApplyOutcome) {
    match outcome {
        ApplyOutcome::Unchanged => debug!(kind, name, "Object is up to date"),
        ApplyOutcome::Created | ApplyOutcome::Updated => {
            info!(kind, name, outcome = outcome.as_str(), "Applied object");
        }
    }
    metrics::record_object_operation(kind, outcome.as_str());
}

/// Delete every object of a disabled driver in order.
///
/// An absent object is success. Any other failure stops the teardown of this
/// driver; the next pass picks it up again. Returns the number of objects deleted.
async fn teardown(
    cluster: &dyn ClusterClient,
    config: &EffectiveConfig,
    variant: RegistrationVariant,
    kind: DriverKind,
) -> Result<usize, ApplyError> {
    let descriptor = kind.descriptor();
    let namespace = config.namespace.as_str();
    let mut deleted = 0;

    let outcome = cluster
        .delete_daemon_set(namespace, descriptor.plugin_name)
        .await
        .map_err(|e| ApplyError::new(ApplyAction::Delete, KIND_DAEMON_SET, descriptor.plugin_name, e))?;
    deleted += record_delete(KIND_DAEMON_SET, descriptor.plugin_name, outcome);

    let outcome = cluster
        .delete_deployment(namespace, descriptor.provisioner_name)
        .await
        .map_err(|e| {
            ApplyError::new(ApplyAction::Delete, KIND_DEPLOYMENT, descriptor.provisioner_name, e)
        })?;
    deleted += record_delete(KIND_DEPLOYMENT, descriptor.provisioner_name, outcome);

    // Attempted for every driver so that a service left behind by an older layout goes too
    let outcome = cluster
        .delete_service(namespace, descriptor.service_name)
        .await
        .map_err(|e| ApplyError::new(ApplyAction::Delete, KIND_SERVICE, descriptor.service_name, e))?;
    deleted += record_delete(KIND_SERVICE, descriptor.service_name, outcome);

    let driver_name = config.driver_names.get(kind);
    let outcome = remove_registration(cluster, variant, driver_name)
        .await
        .map_err(|e| ApplyError::new(ApplyAction::Delete, REGISTRATION_KIND, driver_name.clone(), e))?;
    deleted += record_delete(REGISTRATION_KIND, driver_name, outcome);

    Ok(deleted)
}

fn record_delete(kind: &str, name: &str, outcome: DeleteOutcome) -> usize {
    match outcome {
        DeleteOutcome::Deleted => {
            info!(kind, name, "Deleted object");
            metrics::record_object_operation(kind, "deleted");
            1
        }
        DeleteOutcome::AlreadyAbsent => {
            debug!(kind, name, "Object already absent");
            0
        }
    }
}

#[cfg(test)]
#[path = "reconciler_tests.rs"]
mod reconciler_tests;
