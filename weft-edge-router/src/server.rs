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
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};
use weft_common::tracing::init_tracing_with_default_env_filter;
use weft_common::SafeDisplay;
use weft_edge_router::api::{combined_routes, EdgeServices};
use weft_edge_router::config::{make_config_loader, EdgeRouterConfig};
use weft_edge_router::proxy::EdgeForwarder;
use weft_edge_router::{db, metrics};
use weft_edge_router::registry::CoordinatorRegistry;
use weft_edge_router::repo::DbCoordinatorRepo;

fn main() -> Result<(), std::io::Error> {
    if let Some(config) = make_config_loader().load_or_dump_config() {
        init_tracing_with_default_env_filter(&config.tracing);
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(async_main(&config))
    } else {
        Ok(())
    }
}

async fn async_main(config: &EdgeRouterConfig) -> Result<(), std::io::Error> {
    let prometheus_registry = metrics::register_all();

    info!("Starting weft edge router on port {}", config.http_port);
    info!("\n{}", config.to_safe_string());

    let pool = db::connect_and_migrate(&config.db).await.map_err(|err| {
        error!("DB - init error: {err}");
        std::io::Error::other(format!("Init error: {err}"))
    })?;

    let repo = Arc::new(DbCoordinatorRepo::new(pool));
    let registry = Arc::new(CoordinatorRegistry::new(
        repo,
        config.coordinator_ttl,
        config.coordinator_heartbeat_interval,
    ));
    let forwarder = Arc::new(EdgeForwarder::new(
        registry.clone(),
        config.forward_failover_retries,
        config.forward_timeout,
    ));
    let services = EdgeServices {
        registry: registry.clone(),
        dht_bootstrap_ttl: config.dht_bootstrap_ttl,
        started_at: Instant::now(),
    };

    let (purger_handle, purger_shutdown) =
        CoordinatorRegistry::start_purger(registry, config.coordinator_ttl);

    let cors = Cors::new().allow_origin_regex(&config.cors_origin_regex);
    let app = combined_routes(services, forwarder)
        .nest("/metrics", PrometheusExporter::new(prometheus_registry))
        .with(cors);

    poem::Server::new(TcpListener::bind(format!("0.0.0.0:{}", config.http_port)))
        .run_with_graceful_shutdown(
            app,
            async {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutdown signal received");
            },
            None,
        )
        .await?;

    let _ = purger_shutdown.send(());
    let _ = purger_handle.await;

    Ok(())
}
