// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for the reconciliation error types.

#[cfg(test)]
mod tests {
    use crate::errors::*;

    #[test]
    fn test_missing_image_error() {
        let error = SetupError::MissingImage {
            image: "csi registrar",
            parameter: "CSI_REGISTRAR_IMAGE",
        };

        assert_eq!(
            error.to_string(),
            "missing required image reference 'csi registrar' (parameter CSI_REGISTRAR_IMAGE)"
        );
    }

    #[test]
    fn test_invalid_port_error_names_key_and_value() {
        let source = "70000".parse::<u16>().unwrap_err();
        let error = ConfigError::InvalidPort {
            key: "CSI_RBD_GRPC_METRICS_PORT",
            value: "70000".to_string(),
            source,
        };

        let message = error.to_string();
        assert!(message.contains("CSI_RBD_GRPC_METRICS_PORT"));
        assert!(message.contains("70000"));
    }

    #[test]
    fn test_probe_errors() {
        assert_eq!(
            ProbeError::JobFailed { code: 2 }.to_string(),
            "driver version job returned 2"
        );
        assert_eq!(
            ProbeError::Unsupported {
                found: "v3.3.1".to_string(),
                minimum: "v3.4.0".to_string(),
            }
            .to_string(),
            "driver image needs to be at least version v3.4.0, found v3.3.1"
        );
        assert_eq!(
            ProbeError::Timeout { secs: 900 }.to_string(),
            "driver version job did not complete within 900s"
        );
    }

    #[test]
    fn test_apply_error_carries_kind_name_and_action() {
        let error = ApplyError::new(
            ApplyAction::Create,
            "DaemonSet",
            "csi-rbdplugin",
            ClusterError::Conflict {
                kind: "DaemonSet".to_string(),
                name: "csi-rbdplugin".to_string(),
            },
        );

        assert_eq!(error.kind, "DaemonSet");
        assert_eq!(error.name, "csi-rbdplugin");
        assert_eq!(error.action, ApplyAction::Create);
        assert_eq!(
            error.to_string(),
            "failed to create DaemonSet 'csi-rbdplugin': DaemonSet 'csi-rbdplugin' already exists with a conflicting spec"
        );
    }

    #[test]
    fn test_apply_error_from_owner_failure() {
        let error = ApplyError::new(
            ApplyAction::SetOwner,
            "Deployment",
            "csi-rbdplugin-provisioner",
            OwnerError::AlreadyOwned {
                kind: "Deployment".to_string(),
                name: "other-operator".to_string(),
                uid: "1234".to_string(),
            },
        );

        assert!(error
            .to_string()
            .starts_with("failed to set owner reference on Deployment 'csi-rbdplugin-provisioner'"));
    }

    #[test]
    fn test_reconcile_error_categories() {
        let setup: ReconcileError = SetupError::ClusterVersion("unreachable".to_string()).into();
        assert_eq!(setup.category(), "setup_error");

        let probe: ReconcileError = ProbeError::JobFailed { code: 1 }.into();
        assert_eq!(probe.category(), "probe_error");

        let source = "abc".parse::<u16>().unwrap_err();
        let config: ReconcileError = ConfigError::InvalidPort {
            key: "CSIADDONS_PORT",
            value: "abc".to_string(),
            source,
        }
        .into();
        assert_eq!(config.category(), "validation_error");
    }
}
