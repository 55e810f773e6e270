// Copyright 2024-2025 Weft Compute
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use poem::endpoint::PrometheusExporter;
use poem::listener::TcpListener;
use poem::middleware::Cors;
use poem::EndpointExt;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use weft_common::clients::coordinator::CoordinatorServiceDefault;
use weft_common::tracing::init_tracing_with_default_env_filter;
use weft_common::SafeDisplay;
use weft_worker_agent::agent::{AgentError, AgentLifecycle, AgentState};
use weft_worker_agent::config::{make_config_loader, WorkerAgentConfig};
use weft_worker_agent::detect::detect_capabilities;
use weft_worker_agent::launcher::ServiceLauncher;
use weft_worker_agent::router::{CoordinatorDirectory, FingerCacheRouter};
use weft_worker_agent::{api, metrics, tunnel};

// Exit codes: 0 clean shutdown, 1 configuration error, 2 tunnel bring-up
// failed permanently, 3 registration budget exceeded.
fn main() -> ExitCode {
    let Some(config) = make_config_loader().load_or_dump_config() else {
        return ExitCode::from(1);
    };
    init_tracing_with_default_env_filter(&config.tracing);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to build the runtime: {err}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(async_main(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(AgentError::Config(err)) => {
            error!("Configuration error: {err}");
            ExitCode::from(1)
        }
        Err(AgentError::Tunnel(err)) => {
            error!("Tunnel bring-up failed permanently: {err}");
            ExitCode::from(2)
        }
        Err(AgentError::RegistrationBudgetExceeded) => {
            error!("Registration budget exceeded");
            ExitCode::from(3)
        }
    }
}

async fn async_main(config: WorkerAgentConfig) -> Result<(), AgentError> {
    let prometheus_registry = metrics::register_all();

    info!("Starting weft worker agent on port {}", config.http_port);
    info!("\n{}", config.to_safe_string());

    let capabilities = detect_capabilities(&config).await;

    let tunnel_handle = tunnel::establish(&config.tunnel)
        .await
        .map_err(|err| AgentError::Tunnel(err.to_string()))?;
    let tunnel_url = tunnel_handle.public_url.clone();

    let catalog = Arc::new(weft_common::catalog::ServiceCatalog::builtin());
    let state = Arc::new(AgentState::new(config.mesh.mesh_ip.clone()));
    let launcher = Arc::new(ServiceLauncher::new(
        config.launcher.clone(),
        catalog.clone(),
        config.service_ready_timeout,
    ));

    let coordinator_client = Arc::new(CoordinatorServiceDefault::new(&config.coordinator));
    let directory = Arc::new(CoordinatorDirectory::new(coordinator_client));
    // The DHT accelerator is installed later, once registration brings
    // the seed list.
    let router = Arc::new(FingerCacheRouter::new(
        catalog.clone(),
        state.assigned.clone(),
        directory,
        None,
    ));

    let lifecycle = AgentLifecycle::new(
        config.clone(),
        state.clone(),
        launcher.clone(),
        router.clone(),
        capabilities,
        tunnel_url,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let (monitor_handle, monitor_shutdown) = ServiceLauncher::start_health_monitor(
        launcher.clone(),
        state.clone(),
        Duration::from_secs(30),
    );

    let cors = Cors::new().allow_origin_regex(&config.cors_origin_regex);
    let app = api::combined_routes(state.clone(), router.clone())
        .nest("/metrics", PrometheusExporter::new(prometheus_registry))
        .with(cors);

    let http_port = config.http_port;
    let http_server = tokio::spawn(async move {
        let result = poem::Server::new(TcpListener::bind(format!("0.0.0.0:{http_port}")))
            .run(app)
            .await;
        if let Err(err) = result {
            error!("HTTP server failed: {err}");
        }
    });

    let lifecycle_handle = tokio::spawn(async move { lifecycle.run(shutdown_rx).await });

    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    let result = match lifecycle_handle.await {
        Ok(result) => result,
        Err(err) => {
            error!("Lifecycle task failed: {err}");
            Ok(())
        }
    };

    let _ = monitor_shutdown.send(());
    let _ = monitor_handle.await;
    http_server.abort();
    tunnel_handle.shutdown().await;
    result
}
