// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Driver registration objects and the cluster version gate.
//!
//! Kubernetes serves the `CSIDriver` registration object under two incompatible API
//! versions: `storage.k8s.io/v1beta1` (legacy) and `storage.k8s.io/v1` (current).
//! One [`RegistrationVariant`] is selected per pass with [`select_variant`] and passed
//! explicitly to every registration call.
//!
//! When the current variant is selected on a cluster that still serves the legacy
//! one, [`migrate_legacy_registrations`] removes the legacy objects first so two
//! registrations never compete for the same driver name. There is no downgrade path.

use crate::cluster::{ClusterClient, DeleteOutcome, DriverRegistration};
use crate::config::EffectiveConfig;
use crate::constants::{
    KUBE_MAX_MINOR_FOR_LEGACY_REGISTRATION, KUBE_MIN_MAJOR,
    KUBE_MIN_MINOR_FOR_CURRENT_REGISTRATION,
};
use crate::driver::DriverKind;
use crate::errors::{ApplyAction, ApplyError, ClusterError};
use crate::version::ClusterVersion;
use tracing::{debug, error, info};

/// Kind of the registration object, as reported in errors and metrics.
pub const REGISTRATION_KIND: &str = "CSIDriver";

/// API shape of the registration object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegistrationVariant {
    /// `storage.k8s.io/v1beta1`
    Legacy,
    /// `storage.k8s.io/v1`
    Current,
}

impl RegistrationVariant {
    #[must_use]
    pub fn api_version(self) -> &'static str {
        match self {
            Self::Legacy => "storage.k8s.io/v1beta1",
            Self::Current => "storage.k8s.io/v1",
        }
    }
}

impl std::fmt::Display for RegistrationVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.api_version())
    }
}

/// Current from 1.18 on (inclusive), legacy below.
#[must_use]
pub fn select_variant(version: ClusterVersion) -> RegistrationVariant {
    if version.at_least(KUBE_MIN_MAJOR, KUBE_MIN_MINOR_FOR_CURRENT_REGISTRATION) {
        RegistrationVariant::Current
    } else {
        RegistrationVariant::Legacy
    }
}

/// Best-effort removal of legacy registrations for every enabled driver.
///
/// Only acts when `variant` is current and the cluster still serves the legacy API
/// (at or below 1.21). Failures are logged and never propagated. Returns the number
/// of legacy objects actually deleted.
pub async fn migrate_legacy_registrations(
    client: &dyn ClusterClient,
    variant: RegistrationVariant,
    config: &EffectiveConfig,
) -> usize {
    if variant != RegistrationVariant::Current
        || !config
            .cluster_version
            .at_most(KUBE_MIN_MAJOR, KUBE_MAX_MINOR_FOR_LEGACY_REGISTRATION)
    {
        return 0;
    }

    let mut deleted = 0;
    for kind in config.enabled.enabled() {
        let name = config.driver_names.get(kind);
        match client
            .delete_registration(RegistrationVariant::Legacy, name)
            .await
        {
            Ok(DeleteOutcome::Deleted) => {
                info!(driver = %name, "Removed legacy driver registration");
                deleted += 1;
            }
            Ok(DeleteOutcome::AlreadyAbsent) => {
                debug!(driver = %name, "No legacy driver registration to remove");
            }
            Err(e) => {
                error!(
                    driver = %name,
                    error = %e,
                    "Failed to remove legacy driver registration, continuing"
                );
            }
        }
    }
    deleted
}

/// Desired registration for a driver.
#[must_use]
pub fn desired_registration(kind: DriverKind, config: &EffectiveConfig) -> DriverRegistration {
    DriverRegistration {
        name: config.driver_names.get(kind).clone(),
        attach_required: kind.descriptor().attach_required,
        pod_info_on_mount: false,
        fs_group_policy: Some(config.fs_group_policy.get(kind).clone()),
    }
}

/// What [`ensure_registration`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Created,
    Unchanged,
    /// Deleted and created again because an immutable field differed
    Recreated,
}

/// Make the registration object exist with exactly `desired`.
///
/// # Errors
///
/// Returns an [`ApplyError`] naming the failing get, delete or create.
pub async fn ensure_registration(
    client: &dyn ClusterClient,
    variant: RegistrationVariant,
    desired: &DriverRegistration,
) -> Result<RegistrationOutcome, ApplyError> {
    let fail = |action, e: ClusterError| {
        ApplyError::new(action, REGISTRATION_KIND, desired.name.clone(), e)
    };

    let existing = client
        .get_registration(variant, &desired.name)
        .await
        .map_err(|e| fail(ApplyAction::Get, e))?;
    match existing {
        Some(existing) if existing == *desired => {
            debug!(driver = %desired.name, %variant, "Driver registration is up to date");
            Ok(RegistrationOutcome::Unchanged)
        }
        Some(_) => {
            info!(
                driver = %desired.name,
                %variant,
                "Driver registration changed, re-creating"
            );
            client
                .delete_registration(variant, &desired.name)
                .await
                .map_err(|e| fail(ApplyAction::Delete, e))?;
            client
                .create_registration(variant, desired)
                .await
                .map_err(|e| fail(ApplyAction::Create, e))?;
            Ok(RegistrationOutcome::Recreated)
        }
        None => {
            client
                .create_registration(variant, desired)
                .await
                .map_err(|e| fail(ApplyAction::Create, e))?;
            info!(driver = %desired.name, %variant, "Created driver registration");
            Ok(RegistrationOutcome::Created)
        }
    }
}

/// Delete the registration object; an absent object is success.
///
/// # Errors
///
/// Returns any cluster error other than not-found.
pub async fn remove_registration(
    client: &dyn ClusterClient,
    variant: RegistrationVariant,
    name: &str,
) -> Result<DeleteOutcome, ClusterError> {
    let outcome = client.delete_registration(variant, name).await?;
    if outcome == DeleteOutcome::Deleted {
        info!(driver = %name, %variant, "Deleted driver registration");
    }
    Ok(outcome)
}

#[cfg(test)]
#[path = "registration_tests.rs"]
mod registration_tests;
