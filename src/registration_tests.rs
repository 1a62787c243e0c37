// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `registration.rs`

#[cfg(test)]
mod tests {
    use crate::cluster::{ApplyOutcome, ClusterClient, DeleteOutcome, DriverRegistration};
    use crate::config::{resolve_config, EffectiveConfig, ImageSet, Parameters};
    use crate::driver::DriverKind;
    use crate::errors::{ApplyAction, ClusterError};
    use crate::registration::*;
    use crate::version::ClusterVersion;
    use async_trait::async_trait;
    use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
    use k8s_openapi::api::core::v1::Service;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Registration-only fake; workload calls are never made by this module.
    #[derive(Default)]
    struct Registrations {
        objects: Mutex<BTreeMap<(RegistrationVariant, String), DriverRegistration>>,
        calls: Mutex<Vec<String>>,
        fail_deletes: bool,
    }

    impl Registrations {
        fn insert(&self, variant: RegistrationVariant, registration: DriverRegistration) {
            self.objects
                .lock()
                .unwrap()
                .insert((variant, registration.name.clone()), registration);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ClusterClient for Registrations {
        async fn node_count(&self) -> Result<usize, ClusterError> {
            Ok(3)
        }

        async fn create_daemon_set(&self, _: &DaemonSet) -> Result<ApplyOutcome, ClusterError> {
            unimplemented!()
        }

        async fn create_or_update_deployment(
            &self,
            _: &Deployment,
        ) -> Result<ApplyOutcome, ClusterError> {
            unimplemented!()
        }

        async fn create_or_update_service(&self, _: &Service) -> Result<ApplyOutcome, ClusterError> {
            unimplemented!()
        }

        async fn delete_daemon_set(&self, _: &str, _: &str) -> Result<DeleteOutcome, ClusterError> {
            unimplemented!()
        }

        async fn delete_deployment(&self, _: &str, _: &str) -> Result<DeleteOutcome, ClusterError> {
            unimplemented!()
        }

        async fn delete_service(&self, _: &str, _: &str) -> Result<DeleteOutcome, ClusterError> {
            unimplemented!()
        }

        async fn get_registration(
            &self,
            variant: RegistrationVariant,
            name: &str,
        ) -> Result<Option<DriverRegistration>, ClusterError> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .get(&(variant, name.to_string()))
                .cloned())
        }

        async fn create_registration(
            &self,
            variant: RegistrationVariant,
            registration: &DriverRegistration,
        ) -> Result<(), ClusterError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("create {variant} {}", registration.name));
            self.insert(variant, registration.clone());
            Ok(())
        }

        async fn delete_registration(
            &self,
            variant: RegistrationVariant,
            name: &str,
        ) -> Result<DeleteOutcome, ClusterError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("delete {variant} {name}"));
            if self.fail_deletes {
                return Err(ClusterError::Other("connection reset".to_string()));
            }
            Ok(
                match self
                    .objects
                    .lock()
                    .unwrap()
                    .remove(&(variant, name.to_string()))
                {
                    Some(_) => DeleteOutcome::Deleted,
                    None => DeleteOutcome::AlreadyAbsent,
                },
            )
        }
    }

    fn config_at(version: ClusterVersion) -> EffectiveConfig {
        resolve_config(
            &Parameters::new(),
            version,
            Some(3),
            &ImageSet::default(),
            "rook-ceph",
        )
        .unwrap()
    }

    #[test]
    fn test_variant_boundary_is_exact() {
        assert_eq!(
            select_variant(ClusterVersion::new(1, 17)),
            RegistrationVariant::Legacy
        );
        assert_eq!(
            select_variant(ClusterVersion::new(1, 18)),
            RegistrationVariant::Current
        );
        assert_eq!(
            select_variant(ClusterVersion::new(1, 30)),
            RegistrationVariant::Current
        );
        assert_eq!(
            select_variant(ClusterVersion::new(2, 0)),
            RegistrationVariant::Current
        );
    }

    #[test]
    fn test_desired_registration_per_driver() {
        let config = config_at(ClusterVersion::new(1, 24));

        let rbd = desired_registration(DriverKind::Rbd, &config);
        assert_eq!(rbd.name, "rook-ceph.rbd.csi.ceph.com");
        assert!(rbd.attach_required);
        assert_eq!(rbd.fs_group_policy.as_deref(), Some("ReadWriteOnceWithFSType"));

        let nfs = desired_registration(DriverKind::Nfs, &config);
        assert!(!nfs.attach_required);
    }

    #[tokio::test]
    async fn test_migration_removes_legacy_objects_of_enabled_drivers() {
        let config = config_at(ClusterVersion::new(1, 20));
        let client = Registrations::default();
        client.insert(
            RegistrationVariant::Legacy,
            desired_registration(DriverKind::Rbd, &config),
        );

        let deleted =
            migrate_legacy_registrations(&client, RegistrationVariant::Current, &config).await;

        assert_eq!(deleted, 1);
        assert_eq!(
            client.calls(),
            vec![
                "delete storage.k8s.io/v1beta1 rook-ceph.rbd.csi.ceph.com",
                "delete storage.k8s.io/v1beta1 rook-ceph.cephfs.csi.ceph.com",
            ]
        );
    }

    #[tokio::test]
    async fn test_migration_skipped_above_legacy_ceiling_and_for_legacy_variant() {
        let client = Registrations::default();

        let modern = config_at(ClusterVersion::new(1, 22));
        assert_eq!(
            migrate_legacy_registrations(&client, RegistrationVariant::Current, &modern).await,
            0
        );

        let old = config_at(ClusterVersion::new(1, 17));
        assert_eq!(
            migrate_legacy_registrations(&client, RegistrationVariant::Legacy, &old).await,
            0
        );
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_migration_failures_are_not_propagated() {
        let config = config_at(ClusterVersion::new(1, 21));
        let client = Registrations {
            fail_deletes: true,
            ..Default::default()
        };

        let deleted =
            migrate_legacy_registrations(&client, RegistrationVariant::Current, &config).await;

        assert_eq!(deleted, 0);
        assert_eq!(client.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_ensure_registration_create_then_noop() {
        let config = config_at(ClusterVersion::new(1, 24));
        let client = Registrations::default();
        let desired = desired_registration(DriverKind::CephFs, &config);

        let first = ensure_registration(&client, RegistrationVariant::Current, &desired)
            .await
            .unwrap();
        let second = ensure_registration(&client, RegistrationVariant::Current, &desired)
            .await
            .unwrap();

        assert_eq!(first, RegistrationOutcome::Created);
        assert_eq!(second, RegistrationOutcome::Unchanged);
        assert_eq!(client.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_registration_recreates_on_difference() {
        let config = config_at(ClusterVersion::new(1, 24));
        let client = Registrations::default();
        let mut stale = desired_registration(DriverKind::Rbd, &config);
        stale.fs_group_policy = Some("File".to_string());
        client.insert(RegistrationVariant::Current, stale);

        let desired = desired_registration(DriverKind::Rbd, &config);
        let outcome = ensure_registration(&client, RegistrationVariant::Current, &desired)
            .await
            .unwrap();

        assert_eq!(outcome, RegistrationOutcome::Recreated);
        assert_eq!(
            client.calls(),
            vec![
                "delete storage.k8s.io/v1 rook-ceph.rbd.csi.ceph.com",
                "create storage.k8s.io/v1 rook-ceph.rbd.csi.ceph.com",
            ]
        );
    }

    #[tokio::test]
    async fn test_recreate_failure_reports_the_delete() {
        let config = config_at(ClusterVersion::new(1, 24));
        let client = Registrations {
            fail_deletes: true,
            ..Default::default()
        };
        let mut stale = desired_registration(DriverKind::Rbd, &config);
        stale.attach_required = false;
        client.insert(RegistrationVariant::Current, stale);

        let desired = desired_registration(DriverKind::Rbd, &config);
        let error = ensure_registration(&client, RegistrationVariant::Current, &desired)
            .await
            .unwrap_err();

        assert_eq!(error.action(), ApplyAction::Delete);
        assert_eq!(error.kind(), REGISTRATION_KIND);
        assert_eq!(error.name(), "rook-ceph.rbd.csi.ceph.com");
        assert!(error.to_string().starts_with("failed to delete CSIDriver"));
        assert_eq!(
            client.calls(),
            vec!["delete storage.k8s.io/v1 rook-ceph.rbd.csi.ceph.com"]
        );
    }

    #[tokio::test]
    async fn test_remove_absent_registration_is_success() {
        let client = Registrations::default();
        let outcome = remove_registration(
            &client,
            RegistrationVariant::Current,
            "rook-ceph.nfs.csi.ceph.com",
        )
        .await
        .unwrap();
        assert_eq!(outcome, DeleteOutcome::AlreadyAbsent);
    }
}
