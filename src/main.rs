// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

use anyhow::Result;
use axum::{http::StatusCode, routing::get, Router};
use clap::Parser;
use csi_operator::{
    config::{ImageSet, Parameters},
    constants::{
        DEFAULT_OPERATOR_CONFIG_NAME, DEFAULT_OPERATOR_DEPLOYMENT_NAME,
        DEFAULT_OPERATOR_SERVICE_ACCOUNT, DEFAULT_PASS_DEADLINE_SECS, DEFAULT_REQUEUE_SECS,
        ERROR_REQUEUE_DURATION_SECS, METRICS_SERVER_BIND_ADDRESS, METRICS_SERVER_PATH,
        METRICS_SERVER_PORT, TOKIO_WORKER_THREADS,
    },
    errors::{is_already_exists, ReconcileError},
    kube_client::{detect_cluster_version, resolve_owner, KubeClusterClient, KubeNetworkInventory},
    manifests::BuiltinRenderer,
    metrics,
    overrides::OwnerInfo,
    probe::KubeJobRunner,
    reconciler::{reconcile_pass, Context, PassInputs},
};
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::PostParams,
    runtime::{controller::Action, watcher::Config, Controller},
    Api, Client, ResourceExt,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Operator settings.
#[derive(Debug, Clone, Parser)]
#[command(name = "csi-operator", version, about = "Ceph CSI driver lifecycle operator")]
struct Settings {
    /// Namespace the operator and the driver components run in
    #[arg(long, env = "OPERATOR_NAMESPACE")]
    namespace: String,

    /// ConfigMap whose data overrides the CSI_* environment parameters
    #[arg(long, env = "OPERATOR_CONFIG", default_value = DEFAULT_OPERATOR_CONFIG_NAME)]
    config_name: String,

    /// Deployment that owns every driver component
    #[arg(long, env = "OPERATOR_DEPLOYMENT", default_value = DEFAULT_OPERATOR_DEPLOYMENT_NAME)]
    deployment_name: String,

    /// Service account the version probe job runs as
    #[arg(long, env = "OPERATOR_SERVICE_ACCOUNT", default_value = DEFAULT_OPERATOR_SERVICE_ACCOUNT)]
    service_account: String,

    /// Seconds between passes when nothing changes
    #[arg(long, env = "OPERATOR_REQUEUE_SECONDS", default_value_t = DEFAULT_REQUEUE_SECS)]
    requeue_secs: u64,

    /// Deadline of a single pass, in seconds
    #[arg(long, env = "OPERATOR_PASS_DEADLINE_SECONDS", default_value_t = DEFAULT_PASS_DEADLINE_SECS)]
    pass_deadline_secs: u64,

    /// Address the metrics endpoint binds to
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = METRICS_SERVER_BIND_ADDRESS)]
    metrics_bind_address: String,

    #[arg(long, env = "METRICS_PORT", default_value_t = METRICS_SERVER_PORT)]
    metrics_port: u16,
}

#[derive(Debug, thiserror::Error)]
enum PassError {
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error("reconciliation pass did not finish within {0}s")]
    Deadline(u64),
}

/// Everything the reconcile wrapper needs.
struct Operator {
    settings: Settings,
    client: Client,
    ctx: Context,
    owner: OwnerInfo,
}

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(TOKIO_WORKER_THREADS)
        .thread_name("csi-operator")
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

fn init_tracing() {
    // RUST_LOG selects the level (default info), RUST_LOG_FORMAT=json switches to JSON lines
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let log_format = std::env::var("RUST_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    match log_format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .with_ansi(true)
                .compact()
                .init();
        }
    }
}

async fn async_main() -> Result<()> {
    init_tracing();
    let settings = Settings::parse();
    info!(namespace = %settings.namespace, "Starting CSI driver operator");
    debug!(?settings, "Loaded operator settings");

    let client = Client::try_default().await?;
    debug!("Kubernetes client initialized successfully");

    let owner = resolve_owner(&client, &settings.namespace, &settings.deployment_name).await?;
    info!(owner = %owner.name, uid = %owner.uid, "Resolved owner of driver components");

    ensure_operator_config(&client, &settings).await?;

    let ctx = Context {
        cluster: Arc::new(KubeClusterClient::new(client.clone())),
        network: Arc::new(KubeNetworkInventory::new(client.clone())),
        probe: Arc::new(
            KubeJobRunner::new(
                client.clone(),
                settings.namespace.clone(),
                settings.service_account.clone(),
            )
            .with_owner(owner.clone()),
        ),
        renderer: Arc::new(BuiltinRenderer),
        images: ImageSet::default(),
    };

    let operator = Arc::new(Operator {
        settings: settings.clone(),
        client: client.clone(),
        ctx,
        owner,
    });

    tokio::select! {
        result = run_metrics_server(&settings) => {
            error!("CRITICAL: metrics server exited unexpectedly: {:?}", result);
            result?;
            anyhow::bail!("metrics server exited unexpectedly without error")
        }
        result = run_controller(operator) => {
            info!("Controller stopped");
            result
        }
    }
}

/// Create an empty operator ConfigMap when none exists, so the controller has
/// something to watch. Parameters then come from the environment alone.
async fn ensure_operator_config(client: &Client, settings: &Settings) -> Result<()> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), &settings.namespace);
    if api.get_opt(&settings.config_name).await?.is_some() {
        return Ok(());
    }

    let config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some(settings.config_name.clone()),
            namespace: Some(settings.namespace.clone()),
            ..Default::default()
        },
        ..Default::default()
    };
    match api.create(&PostParams::default(), &config_map).await {
        Ok(_) => {
            info!(name = %settings.config_name, "Created empty operator ConfigMap");
            Ok(())
        }
        Err(e) if is_already_exists(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Run the controller watching the operator ConfigMap
async fn run_controller(operator: Arc<Operator>) -> Result<()> {
    info!(config = %operator.settings.config_name, "Starting operator config controller");

    let api: Api<ConfigMap> =
        Api::namespaced(operator.client.clone(), &operator.settings.namespace);
    let watch = Config::default().fields(&format!("metadata.name={}", operator.settings.config_name));

    Controller::new(api, watch)
        .graceful_shutdown_on(shutdown_signal())
        .run(reconcile_wrapper, error_policy, operator)
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down");
    }
}

/// Parameters of one pass: environment snapshot overlaid by the ConfigMap data.
fn pass_parameters(config_map: &ConfigMap) -> Parameters {
    let mut params = Parameters::from_env();
    if let Some(data) = config_map.data.as_ref() {
        params.overlay(data);
    }
    params
}

/// Reconcile wrapper for the operator ConfigMap
async fn reconcile_wrapper(
    config_map: Arc<ConfigMap>,
    operator: Arc<Operator>,
) -> Result<Action, PassError> {
    debug!(name = %config_map.name_any(), "Reconcile wrapper called for operator config");
    let started = Instant::now();
    let deadline = operator.settings.pass_deadline_secs;

    let pass = async {
        let cluster_version = detect_cluster_version(&operator.client)
            .await
            .map_err(ReconcileError::from)?;
        let inputs = PassInputs {
            namespace: operator.settings.namespace.clone(),
            params: pass_parameters(&config_map),
            cluster_version,
            owner: operator.owner.clone(),
        };
        reconcile_pass(&operator.ctx, &inputs)
            .await
            .map_err(PassError::from)
    };

    let report = match tokio::time::timeout(Duration::from_secs(deadline), pass).await {
        Ok(Ok(report)) => report,
        Ok(Err(PassError::Reconcile(e))) => {
            metrics::record_pass_error(e.category(), started.elapsed());
            error!(error = %e, "Reconciliation pass aborted");
            return Err(e.into());
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            metrics::record_pass_error("timeout", started.elapsed());
            error!(deadline, "Reconciliation pass exceeded its deadline");
            return Err(PassError::Deadline(deadline));
        }
    };

    if report.is_converged() {
        metrics::record_pass_success(started.elapsed());
        info!(
            variant = %report.variant,
            elapsed_ms = started.elapsed().as_millis(),
            "Successfully reconciled CSI drivers"
        );
        Ok(Action::requeue(Duration::from_secs(
            operator.settings.requeue_secs,
        )))
    } else {
        metrics::record_pass_degraded(started.elapsed());
        for (kind, e) in report.failures() {
            warn!(driver = %kind, error = %e, "Driver did not converge, retrying soon");
        }
        Ok(Action::requeue(Duration::from_secs(
            ERROR_REQUEUE_DURATION_SECS,
        )))
    }
}

/// Error policy for the controller
fn error_policy(_config_map: Arc<ConfigMap>, _err: &PassError, _operator: Arc<Operator>) -> Action {
    Action::requeue(Duration::from_secs(ERROR_REQUEUE_DURATION_SECS))
}

/// Serve the Prometheus text exposition
async fn run_metrics_server(settings: &Settings) -> Result<()> {
    let app = Router::new().route(
        METRICS_SERVER_PATH,
        get(|| async {
            match metrics::gather_metrics() {
                Ok(body) => (StatusCode::OK, body),
                Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            }
        }),
    );

    let addr = format!("{}:{}", settings.metrics_bind_address, settings.metrics_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, path = METRICS_SERVER_PATH, "Serving metrics");
    axum::serve(listener, app).await?;
    Ok(())
}
