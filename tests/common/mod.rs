// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Common test utilities for integration tests
//!
//! In-memory collaborators for the reconciliation pass. [`FakeCluster`] keeps the
//! objects it was given and logs every call that changed its state, one line per
//! call in the form `"<verb> <Kind> <name>"` (registrations also carry the API
//! version). Calls that change nothing are not logged.

#![allow(dead_code)]

use async_trait::async_trait;
use csi_operator::cluster::{
    recorded_spec_hash, ApplyOutcome, ClusterClient, DeleteOutcome, DriverRegistration,
    NetworkDeclaration, NetworkInventory,
};
use csi_operator::config::{ImageSet, Parameters};
use csi_operator::errors::{ClusterError, ProbeError};
use csi_operator::manifests::BuiltinRenderer;
use csi_operator::overrides::OwnerInfo;
use csi_operator::probe::{ProbeOutput, ProbeRequest, VersionProbeRunner};
use csi_operator::reconciler::{Context, PassInputs};
use csi_operator::registration::RegistrationVariant;
use csi_operator::version::ClusterVersion;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::Service;
use kube::client::Client;
use kube::Resource;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

pub const NAMESPACE: &str = "rook-ceph";

#[derive(Default)]
struct ClusterState {
    daemon_sets: BTreeMap<String, DaemonSet>,
    deployments: BTreeMap<String, Deployment>,
    services: BTreeMap<String, Service>,
    registrations: BTreeMap<(RegistrationVariant, String), DriverRegistration>,
    calls: Vec<String>,
    failures: BTreeSet<String>,
}

/// In-memory [`ClusterClient`].
pub struct FakeCluster {
    state: Mutex<ClusterState>,
    nodes: usize,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::with_nodes(3)
    }
}

impl FakeCluster {
    pub fn with_nodes(nodes: usize) -> Self {
        Self {
            state: Mutex::new(ClusterState::default()),
            nodes,
        }
    }

    /// Make the call `"<verb> <Kind> <name>"` fail until cleared.
    pub fn fail(&self, call: &str) {
        self.state.lock().unwrap().failures.insert(call.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    /// Every state-changing call so far.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn daemon_set(&self, name: &str) -> Option<DaemonSet> {
        self.state.lock().unwrap().daemon_sets.get(name).cloned()
    }

    pub fn deployment(&self, name: &str) -> Option<Deployment> {
        self.state.lock().unwrap().deployments.get(name).cloned()
    }

    pub fn service(&self, name: &str) -> Option<Service> {
        self.state.lock().unwrap().services.get(name).cloned()
    }

    pub fn registration(
        &self,
        variant: RegistrationVariant,
        name: &str,
    ) -> Option<DriverRegistration> {
        self.state
            .lock()
            .unwrap()
            .registrations
            .get(&(variant, name.to_string()))
            .cloned()
    }

    pub fn insert_registration(&self, variant: RegistrationVariant, registration: DriverRegistration) {
        self.state
            .lock()
            .unwrap()
            .registrations
            .insert((variant, registration.name.clone()), registration);
    }

    fn check(state: &ClusterState, call: &str) -> Result<(), ClusterError> {
        if state.failures.contains(call) {
            return Err(ClusterError::Other(format!("injected failure: {call}")));
        }
        Ok(())
    }
}

fn name_of<K: Resource>(object: &K) -> String {
    object.meta().name.clone().unwrap_or_default()
}

/// Shared create-or-update semantics keyed on the spec hash.
fn upsert<K: Resource + Clone>(store: &mut BTreeMap<String, K>, object: &K) -> ApplyOutcome {
    let name = name_of(object);
    match store.get(&name) {
        Some(live) if recorded_spec_hash(live) == recorded_spec_hash(object) => {
            ApplyOutcome::Unchanged
        }
        Some(_) => {
            store.insert(name, object.clone());
            ApplyOutcome::Updated
        }
        None => {
            store.insert(name, object.clone());
            ApplyOutcome::Created
        }
    }
}

fn verb(outcome: ApplyOutcome) -> &'static str {
    match outcome {
        ApplyOutcome::Created => "create",
        ApplyOutcome::Updated => "update",
        ApplyOutcome::Unchanged => "noop",
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn node_count(&self) -> Result<usize, ClusterError> {
        Ok(self.nodes)
    }

    async fn create_daemon_set(&self, daemon_set: &DaemonSet) -> Result<ApplyOutcome, ClusterError> {
        let name = name_of(daemon_set);
        let mut state = self.state.lock().unwrap();
        Self::check(&state, &format!("create DaemonSet {name}"))?;

        if let Some(live) = state.daemon_sets.get(&name) {
            if recorded_spec_hash(live) == recorded_spec_hash(daemon_set) {
                return Ok(ApplyOutcome::Unchanged);
            }
            return Err(ClusterError::Conflict {
                kind: "DaemonSet".to_string(),
                name,
            });
        }
        state.daemon_sets.insert(name.clone(), daemon_set.clone());
        state.calls.push(format!("create DaemonSet {name}"));
        Ok(ApplyOutcome::Created)
    }

    async fn create_or_update_deployment(
        &self,
        deployment: &Deployment,
    ) -> Result<ApplyOutcome, ClusterError> {
        let name = name_of(deployment);
        let mut state = self.state.lock().unwrap();
        Self::check(&state, &format!("create Deployment {name}"))?;

        let outcome = upsert(&mut state.deployments, deployment);
        if outcome.mutated() {
            state.calls.push(format!("{} Deployment {name}", verb(outcome)));
        }
        Ok(outcome)
    }

    async fn create_or_update_service(&self, service: &Service) -> Result<ApplyOutcome, ClusterError> {
        let name = name_of(service);
        let mut state = self.state.lock().unwrap();
        Self::check(&state, &format!("create Service {name}"))?;

        let outcome = upsert(&mut state.services, service);
        if outcome.mutated() {
            state.calls.push(format!("{} Service {name}", verb(outcome)));
        }
        Ok(outcome)
    }

    async fn delete_daemon_set(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<DeleteOutcome, ClusterError> {
        let mut state = self.state.lock().unwrap();
        let call = format!("delete DaemonSet {name}");
        Self::check(&state, &call)?;
        Ok(match state.daemon_sets.remove(name) {
            Some(_) => {
                state.calls.push(call);
                DeleteOutcome::Deleted
            }
            None => DeleteOutcome::AlreadyAbsent,
        })
    }

    async fn delete_deployment(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<DeleteOutcome, ClusterError> {
        let mut state = self.state.lock().unwrap();
        let call = format!("delete Deployment {name}");
        Self::check(&state, &call)?;
        Ok(match state.deployments.remove(name) {
            Some(_) => {
                state.calls.push(call);
                DeleteOutcome::Deleted
            }
            None => DeleteOutcome::AlreadyAbsent,
        })
    }

    async fn delete_service(&self, _namespace: &str, name: &str) -> Result<DeleteOutcome, ClusterError> {
        let mut state = self.state.lock().unwrap();
        let call = format!("delete Service {name}");
        Self::check(&state, &call)?;
        Ok(match state.services.remove(name) {
            Some(_) => {
                state.calls.push(call);
                DeleteOutcome::Deleted
            }
            None => DeleteOutcome::AlreadyAbsent,
        })
    }

    async fn get_registration(
        &self,
        variant: RegistrationVariant,
        name: &str,
    ) -> Result<Option<DriverRegistration>, ClusterError> {
        Ok(self.registration(variant, name))
    }

    async fn create_registration(
        &self,
        variant: RegistrationVariant,
        registration: &DriverRegistration,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        let call = format!("create CSIDriver {variant} {}", registration.name);
        Self::check(&state, &call)?;
        state
            .registrations
            .insert((variant, registration.name.clone()), registration.clone());
        state.calls.push(call);
        Ok(())
    }

    async fn delete_registration(
        &self,
        variant: RegistrationVariant,
        name: &str,
    ) -> Result<DeleteOutcome, ClusterError> {
        let mut state = self.state.lock().unwrap();
        let call = format!("delete CSIDriver {variant} {name}");
        Self::check(&state, &call)?;
        Ok(match state.registrations.remove(&(variant, name.to_string())) {
            Some(_) => {
                state.calls.push(call);
                DeleteOutcome::Deleted
            }
            None => DeleteOutcome::AlreadyAbsent,
        })
    }
}

/// [`NetworkInventory`] returning a fixed list.
#[derive(Default)]
pub struct FakeNetwork {
    pub declarations: Vec<NetworkDeclaration>,
}

impl FakeNetwork {
    pub fn multus(attachments: &[&str]) -> Self {
        Self {
            declarations: vec![NetworkDeclaration {
                name: "my-cluster".to_string(),
                secondary_attachments: attachments.iter().map(|a| (*a).to_string()).collect(),
            }],
        }
    }
}

#[async_trait]
impl NetworkInventory for FakeNetwork {
    async fn list_network_declarations(
        &self,
        _namespace: &str,
    ) -> Result<Vec<NetworkDeclaration>, ClusterError> {
        Ok(self.declarations.clone())
    }
}

/// [`VersionProbeRunner`] printing a fixed output.
pub struct FakeProbe {
    output: ProbeOutput,
    runs: Mutex<usize>,
}

impl FakeProbe {
    pub fn version(version: &str) -> Self {
        Self::output(&format!("Cephcsi Version: {version}\nGo Version: go1.17\n"), 0)
    }

    pub fn output(stdout: &str, exit_code: i32) -> Self {
        Self {
            output: ProbeOutput {
                stdout: stdout.to_string(),
                exit_code,
            },
            runs: Mutex::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        *self.runs.lock().unwrap()
    }
}

impl Default for FakeProbe {
    fn default() -> Self {
        Self::version("v3.6.0")
    }
}

#[async_trait]
impl VersionProbeRunner for FakeProbe {
    async fn schedule(&self, _request: &ProbeRequest) -> Result<ProbeOutput, ProbeError> {
        *self.runs.lock().unwrap() += 1;
        Ok(self.output.clone())
    }
}

/// Collaborators of a test pass.
pub struct Harness {
    pub cluster: Arc<FakeCluster>,
    pub probe: Arc<FakeProbe>,
    pub ctx: Context,
}

impl Harness {
    pub fn new(cluster: FakeCluster, network: FakeNetwork, probe: FakeProbe) -> Self {
        let cluster = Arc::new(cluster);
        let probe = Arc::new(probe);
        let ctx = Context {
            cluster: cluster.clone(),
            network: Arc::new(network),
            probe: probe.clone(),
            renderer: Arc::new(BuiltinRenderer),
            images: ImageSet::default(),
        };
        Self { cluster, probe, ctx }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new(FakeCluster::default(), FakeNetwork::default(), FakeProbe::default())
    }
}

pub fn owner() -> OwnerInfo {
    OwnerInfo {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
        name: "csi-operator".to_string(),
        uid: "6f1b2c3d-0000-4000-8000-000000000001".to_string(),
    }
}

pub fn inputs(params: Parameters, version: ClusterVersion) -> PassInputs {
    PassInputs {
        namespace: NAMESPACE.to_string(),
        params,
        cluster_version: version,
        owner: owner(),
    }
}

/// Get a Kubernetes client or skip the test if not in a cluster
pub async fn get_kube_client_or_skip() -> Option<Client> {
    match Client::try_default().await {
        Ok(client) => Some(client),
        Err(e) => {
            eprintln!("Skipping integration test: not running in Kubernetes cluster: {e}");
            None
        }
    }
}
