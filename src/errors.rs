// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Error types for the CSI driver reconciliation pass.
//!
//! The taxonomy mirrors how far an error is allowed to propagate:
//!
//! - [`SetupError`] - missing required inputs, aborts the pass before any object is touched
//! - [`ConfigError`] - malformed numeric overrides that cannot be defaulted (ports)
//! - [`ProbeError`] - driver image version detection failed or is unsupported, aborts the pass
//! - [`ApplyError`] - a create/update/delete/owner-reference step failed for one component,
//!   aborts that component only
//!
//! Best-effort failures (legacy registration cleanup, deleting something already gone)
//! are logged at the call site and never surface as values of these types.
//!
//! [`ClusterError`] and [`RenderError`] are what the external collaborators return;
//! the reconciler wraps them into [`ApplyError`] with the object kind, name and action.

use std::num::ParseIntError;
use thiserror::Error;

/// Errors raised before any cluster object is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SetupError {
    /// A required container image reference resolved to an empty string
    #[error("missing required image reference '{image}' (parameter {parameter})")]
    MissingImage {
        /// Human-readable image role (e.g., "csi plugin")
        image: &'static str,
        /// Parameter key that can supply it
        parameter: &'static str,
    },

    /// The object that owns every driver component could not be resolved
    #[error("failed to resolve owner {kind} '{name}': {reason}")]
    OwnerUnavailable {
        /// Owner kind (e.g., "Deployment")
        kind: String,
        /// Owner name
        name: String,
        /// Underlying failure
        reason: String,
    },

    /// The cluster version could not be detected or parsed
    #[error("failed to detect cluster version: {0}")]
    ClusterVersion(String),
}

/// Errors raised while deriving the effective configuration.
///
/// Only settings without a safe default end up here; boolean flags, the GRPC
/// timeout, the replica count and the log level fall back silently instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A port override is not a valid unsigned 16-bit integer
    #[error("invalid port '{value}' for {key}: {source}")]
    InvalidPort {
        /// Parameter key
        key: &'static str,
        /// Raw override value
        value: String,
        /// Parse failure
        #[source]
        source: ParseIntError,
    },
}

/// Errors raised by the driver image version probe.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// The one-shot job could not be scheduled or observed
    #[error("failed to set up driver version job: {0}")]
    Schedule(String),

    /// The job did not finish within the probe ceiling
    #[error("driver version job did not complete within {secs}s")]
    Timeout {
        /// Ceiling that was exceeded
        secs: u64,
    },

    /// The job ran but exited non-zero
    #[error("driver version job returned {code}")]
    JobFailed {
        /// Container exit code
        code: i32,
    },

    /// The job succeeded but printed no recognizable version
    #[error("failed to extract driver version from output: {output:?}")]
    Parse {
        /// Captured output
        output: String,
    },

    /// The detected version is older than the minimum the operator deploys
    #[error("driver image needs to be at least version {minimum}, found {found}")]
    Unsupported {
        /// Detected version
        found: String,
        /// Minimum supported version
        minimum: String,
    },
}

/// Errors returned by the cluster collaborator.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Object exists with a spec different from the one submitted to a create-only call
    #[error("{kind} '{name}' already exists with a conflicting spec")]
    Conflict {
        /// Object kind
        kind: String,
        /// Object name
        name: String,
    },

    /// Object is missing required metadata
    #[error("{kind} is missing metadata.{field}")]
    MissingMetadata {
        /// Object kind
        kind: String,
        /// Field that is missing (e.g., "name")
        field: &'static str,
    },

    /// Kubernetes API failure
    #[error(transparent)]
    Kube(#[from] kube::Error),

    /// Any other collaborator failure
    #[error("{0}")]
    Other(String),
}

/// Errors returned by the manifest renderer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// A value the template needs is empty
    #[error("template {template} requires a non-empty {field}")]
    MissingField {
        /// Template identifier
        template: String,
        /// Missing value
        field: &'static str,
    },

    /// The template does not exist for this driver
    #[error("no {template} template for driver {driver}")]
    NoTemplate {
        /// Template identifier
        template: String,
        /// Driver kind
        driver: String,
    },
}

/// Operation being attempted when an [`ApplyError`] occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyAction {
    Get,
    Render,
    SetOwner,
    ApplyNetwork,
    Create,
    CreateOrUpdate,
    Delete,
}

impl std::fmt::Display for ApplyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Get => write!(f, "get"),
            Self::Render => write!(f, "render"),
            Self::SetOwner => write!(f, "set owner reference on"),
            Self::ApplyNetwork => write!(f, "apply network config to"),
            Self::Create => write!(f, "create"),
            Self::CreateOrUpdate => write!(f, "create or update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Source of an [`ApplyError`].
#[derive(Error, Debug)]
pub enum ApplySource {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Owner(#[from] OwnerError),
}

/// A per-component step failed against the cluster.
///
/// Fatal to the remaining steps of that component; sibling components still run.
#[derive(Error, Debug)]
#[error("failed to {action} {kind} '{name}': {source}")]
pub struct ApplyError {
    /// What was being attempted
    pub action: ApplyAction,
    /// Object kind (e.g., "DaemonSet")
    pub kind: String,
    /// Object name
    pub name: String,
    /// Underlying failure
    #[source]
    pub source: ApplySource,
}

impl ApplyError {
    /// Wrap a collaborator failure with the object it concerns.
    pub fn new(
        action: ApplyAction,
        kind: impl Into<String>,
        name: impl Into<String>,
        source: impl Into<ApplySource>,
    ) -> Self {
        Self {
            action,
            kind: kind.into(),
            name: name.into(),
            source: source.into(),
        }
    }

    #[must_use]
    pub fn action(&self) -> ApplyAction {
        self.action
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Owner reference assignment failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OwnerError {
    /// The object is already controlled by a different owner
    #[error("already controlled by {kind} '{name}' (uid {uid})")]
    AlreadyOwned {
        /// Existing controller kind
        kind: String,
        /// Existing controller name
        name: String,
        /// Existing controller uid
        uid: String,
    },

    /// The owner has no uid, so no valid reference can be built
    #[error("owner {kind} '{name}' has no uid")]
    MissingUid {
        /// Owner kind
        kind: String,
        /// Owner name
        name: String,
    },
}

/// Errors that abort a whole reconciliation pass.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Probe(#[from] ProbeError),
}

impl ReconcileError {
    /// Short machine-readable category used in metrics labels.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Setup(_) => "setup_error",
            Self::Config(_) => "validation_error",
            Self::Probe(_) => "probe_error",
        }
    }
}

/// Returns true when a kube API error means the object does not exist.
#[must_use]
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Returns true when a kube API error means the object already exists.
#[must_use]
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

#[cfg(test)]
#[path = "errors_tests.rs"]
mod errors_tests;
