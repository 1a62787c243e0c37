// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! # csi-operator - Ceph CSI driver lifecycle operator for Kubernetes
//!
//! csi-operator deploys and retires the Ceph CSI drivers (RBD, CephFS and NFS) in a
//! Kubernetes cluster. Every reconciliation pass turns a flat key/value parameter map
//! and a few cluster facts into the node plugin `DaemonSet`, the provisioner
//! `Deployment`, the metrics `Service` and the `CSIDriver` registration of each
//! enabled driver, and removes those objects for disabled ones.
//!
//! ## Modules
//!
//! - [`config`] - Parameter map and resolution into an [`config::EffectiveConfig`]
//! - [`driver`] - Driver kinds and their descriptor table
//! - [`probe`] - Driver image version probe
//! - [`registration`] - Registration API variant selection and legacy cleanup
//! - [`overrides`] - Placement, resource, network and owner overrides
//! - [`manifests`] - Rendering of the typed workload objects
//! - [`reconciler`] - The reconciliation pass
//! - [`cluster`] / [`kube_client`] - Cluster collaborators and their kube-rs implementations
//!
//! ## Example
//!
//! ```rust,no_run
//! use csi_operator::config::{resolve_config, ImageSet, Parameters};
//! use csi_operator::version::ClusterVersion;
//!
//! let params = Parameters::new()
//!     .with("CSI_ENABLE_NFS", "true")
//!     .with("CSI_GRPC_TIMEOUT_SECONDS", "200");
//!
//! let config = resolve_config(
//!     &params,
//!     ClusterVersion::new(1, 28),
//!     Some(3),
//!     &ImageSet::default(),
//!     "rook-ceph",
//! )
//! .expect("valid configuration");
//!
//! assert!(config.enabled.nfs);
//! assert_eq!(config.grpc_timeout_secs, 200);
//! ```

pub mod cluster;
pub mod config;
pub mod constants;
pub mod driver;
pub mod errors;
pub mod kube_client;
pub mod labels;
pub mod manifests;
pub mod metrics;
pub mod overrides;
pub mod probe;
pub mod reconciler;
pub mod registration;
pub mod version;
