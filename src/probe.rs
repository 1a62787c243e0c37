// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Driver image version probe.
//!
//! Before any driver component is created, the configured plugin image is run once as
//! a one-shot job with `--version`. The printed version must be at least
//! [`DriverVersion::minimum`]; anything else blocks the pass.
//!
//! [`probe_driver_version`] enforces its own 15 minute ceiling regardless of the
//! caller's deadline. The job mechanism sits behind [`VersionProbeRunner`];
//! [`KubeJobRunner`] is the Kubernetes `Job` implementation.

use crate::constants::{
    PROBE_COMMAND, PROBE_CONTAINER_NAME, PROBE_JOB_NAME, PROBE_POLL_INTERVAL_SECS, PROBE_TIMEOUT,
    PROBE_VERSION_ARG,
};
use crate::errors::{is_not_found, ProbeError};
use crate::labels::{
    COMPONENT_VERSION_PROBE, JOB_NAME_LABEL, K8S_COMPONENT, K8S_MANAGED_BY, K8S_PART_OF,
    MANAGED_BY_CSI_OPERATOR, PART_OF_CEPH_CSI,
};
use crate::overrides::{apply_placement, OwnerInfo, Placement};
use crate::version::DriverVersion;
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, LogParams, PostParams};
use kube::{Api, Client};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Input of a one-shot probe job.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRequest {
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Scheduling constraints for the job pod
    pub placement: Placement,
}

impl ProbeRequest {
    /// Version query for `image` with the standard ceiling.
    #[must_use]
    pub fn version_query(image: impl Into<String>, placement: Placement) -> Self {
        Self {
            image: image.into(),
            command: vec![PROBE_COMMAND.to_string()],
            args: vec![PROBE_VERSION_ARG.to_string()],
            timeout: PROBE_TIMEOUT,
            placement,
        }
    }
}

/// What a completed probe job produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutput {
    pub stdout: String,
    pub exit_code: i32,
}

/// Runs a one-shot sandboxed job and returns its output.
#[async_trait]
pub trait VersionProbeRunner: Send + Sync {
    /// Run the job to completion.
    ///
    /// A job that ran and exited non-zero is a successful call with a non-zero
    /// `exit_code`; errors are reserved for failing to schedule or observe the job.
    async fn schedule(&self, request: &ProbeRequest) -> Result<ProbeOutput, ProbeError>;
}

/// Parsed and checked probe result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionProbeResult {
    pub raw: String,
    pub version: DriverVersion,
    pub supported: bool,
}

/// Probe the driver image and enforce the minimum supported version.
///
/// # Errors
///
/// - [`ProbeError::Schedule`] if the job could not be run
/// - [`ProbeError::Timeout`] if it did not finish within the request timeout
/// - [`ProbeError::JobFailed`] for a non-zero exit code
/// - [`ProbeError::Parse`] if no version could be read from the output
/// - [`ProbeError::Unsupported`] if the version is below the minimum
pub async fn probe_driver_version(
    runner: &dyn VersionProbeRunner,
    request: &ProbeRequest,
) -> Result<VersionProbeResult, ProbeError> {
    info!(image = %request.image, "Detecting driver image version");

    let output = tokio::time::timeout(request.timeout, runner.schedule(request))
        .await
        .map_err(|_| ProbeError::Timeout {
            secs: request.timeout.as_secs(),
        })??;

    if output.exit_code != 0 {
        return Err(ProbeError::JobFailed {
            code: output.exit_code,
        });
    }

    let version = DriverVersion::extract(&output.stdout).ok_or_else(|| ProbeError::Parse {
        output: output.stdout.clone(),
    })?;
    info!(%version, "Detected driver image version");

    let result = VersionProbeResult {
        raw: output.stdout,
        supported: version.is_supported(),
        version,
    };
    if !result.supported {
        return Err(ProbeError::Unsupported {
            found: result.version.to_string(),
            minimum: DriverVersion::minimum().to_string(),
        });
    }
    Ok(result)
}

/// Build the probe `Job`: no retries, never restarted, placed like the provisioners.
///
/// # Errors
///
/// Returns [`ProbeError::Schedule`] if the owner reference cannot be set.
pub fn build_probe_job(
    request: &ProbeRequest,
    namespace: &str,
    service_account: &str,
    owner: Option<&OwnerInfo>,
) -> Result<Job, ProbeError> {
    let labels = BTreeMap::from([
        (K8S_COMPONENT.to_string(), COMPONENT_VERSION_PROBE.to_string()),
        (K8S_PART_OF.to_string(), PART_OF_CEPH_CSI.to_string()),
        (K8S_MANAGED_BY.to_string(), MANAGED_BY_CSI_OPERATOR.to_string()),
    ]);

    let mut pod_spec = PodSpec {
        restart_policy: Some("Never".to_string()),
        service_account_name: Some(service_account.to_string()),
        containers: vec![Container {
            name: PROBE_CONTAINER_NAME.to_string(),
            image: Some(request.image.clone()),
            command: Some(request.command.clone()),
            args: Some(request.args.clone()),
            ..Default::default()
        }],
        ..Default::default()
    };
    apply_placement(&mut pod_spec, &request.placement);

    let mut metadata = ObjectMeta {
        name: Some(PROBE_JOB_NAME.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels.clone()),
        ..Default::default()
    };
    if let Some(owner) = owner {
        owner
            .set_controller_reference(&mut metadata)
            .map_err(|e| ProbeError::Schedule(e.to_string()))?;
    }

    Ok(Job {
        metadata,
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Runs the probe as a Kubernetes `Job` in the operator namespace.
#[derive(Clone)]
pub struct KubeJobRunner {
    client: Client,
    namespace: String,
    service_account: String,
    owner: Option<OwnerInfo>,
}

impl KubeJobRunner {
    #[must_use]
    pub fn new(client: Client, namespace: impl Into<String>, service_account: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            service_account: service_account.into(),
            owner: None,
        }
    }

    /// Make the job garbage-collected with `owner`.
    #[must_use]
    pub fn with_owner(mut self, owner: OwnerInfo) -> Self {
        self.owner = Some(owner);
        self
    }

    async fn remove_job(&self, jobs: &Api<Job>) -> Result<(), kube::Error> {
        match jobs.delete(PROBE_JOB_NAME, &DeleteParams::background()).await {
            Ok(_) => {
                debug!(job = PROBE_JOB_NAME, "Deleted previous version probe job");
                // Wait for the old job to disappear before re-creating it
                let mut interval =
                    tokio::time::interval(Duration::from_secs(PROBE_POLL_INTERVAL_SECS));
                while jobs.get_opt(PROBE_JOB_NAME).await?.is_some() {
                    interval.tick().await;
                }
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn wait_for_completion(&self, jobs: &Api<Job>) -> Result<(), kube::Error> {
        let mut interval = tokio::time::interval(Duration::from_secs(PROBE_POLL_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let job = jobs.get(PROBE_JOB_NAME).await?;
            let status = job.status.unwrap_or_default();
            let finished = status.succeeded.unwrap_or(0) > 0 || status.failed.unwrap_or(0) > 0;
            if finished {
                return Ok(());
            }
            debug!(
                job = PROBE_JOB_NAME,
                active = status.active.unwrap_or(0),
                "Version probe job still running"
            );
        }
    }

    async fn collect_output(&self) -> Result<ProbeOutput, ProbeError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let selector = format!("{JOB_NAME_LABEL}={PROBE_JOB_NAME}");
        let pod = pods
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| ProbeError::Schedule(format!("failed to list probe pods: {e}")))?
            .items
            .into_iter()
            .next()
            .ok_or_else(|| ProbeError::Schedule("probe job has no pod".to_string()))?;

        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        let exit_code = pod
            .status
            .as_ref()
            .and_then(|status| status.container_statuses.as_ref())
            .and_then(|statuses| {
                statuses
                    .iter()
                    .find(|status| status.name == PROBE_CONTAINER_NAME)
            })
            .and_then(|status| status.state.as_ref())
            .and_then(|state| state.terminated.as_ref())
            .map(|terminated| terminated.exit_code)
            .ok_or_else(|| {
                ProbeError::Schedule(format!("probe pod {pod_name} has no terminated state"))
            })?;

        let stdout = pods
            .logs(
                &pod_name,
                &LogParams {
                    container: Some(PROBE_CONTAINER_NAME.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ProbeError::Schedule(format!("failed to read probe logs: {e}")))?;

        Ok(ProbeOutput { stdout, exit_code })
    }
}

#[async_trait]
impl VersionProbeRunner for KubeJobRunner {
    async fn schedule(&self, request: &ProbeRequest) -> Result<ProbeOutput, ProbeError> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);

        self.remove_job(&jobs)
            .await
            .map_err(|e| ProbeError::Schedule(format!("failed to remove previous job: {e}")))?;

        let job = build_probe_job(
            request,
            &self.namespace,
            &self.service_account,
            self.owner.as_ref(),
        )?;
        jobs.create(&PostParams::default(), &job)
            .await
            .map_err(|e| ProbeError::Schedule(format!("failed to create job: {e}")))?;
        info!(job = PROBE_JOB_NAME, image = %request.image, "Started version probe job");

        self.wait_for_completion(&jobs)
            .await
            .map_err(|e| ProbeError::Schedule(format!("failed to watch job: {e}")))?;

        let output = self.collect_output().await;

        if let Err(e) = jobs
            .delete(PROBE_JOB_NAME, &DeleteParams::background())
            .await
        {
            if !is_not_found(&e) {
                warn!(job = PROBE_JOB_NAME, error = %e, "Failed to clean up version probe job");
            }
        }

        output
    }
}

#[cfg(test)]
#[path = "probe_tests.rs"]
mod probe_tests;
