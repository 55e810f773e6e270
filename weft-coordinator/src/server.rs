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
use tracing::info;
use weft_common::clients::edge::EdgeRouterServiceDefault;
use weft_common::tracing::init_tracing_with_default_env_filter;
use weft_common::SafeDisplay;
use weft_coordinator::bootstrap::Services;
use weft_coordinator::config::{make_config_loader, CoordinatorConfig};
use weft_coordinator::edge::EdgeAnnouncer;
use weft_coordinator::registry::WorkerRegistry;
use weft_coordinator::{api, metrics};

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

async fn async_main(config: &CoordinatorConfig) -> Result<(), std::io::Error> {
    let prometheus_registry = metrics::register_all();

    info!(
        "Starting weft coordinator {} on port {}",
        config.coordinator_id, config.http_port
    );
    info!("\n{}", config.to_safe_string());

    let services = Services::new(config);

    let (purger_handle, purger_shutdown) =
        WorkerRegistry::start_purger(services.registry.clone(), config.heartbeat_interval);

    let announcer = config.edge_router.as_ref().map(|edge_config| {
        let client = Arc::new(EdgeRouterServiceDefault::new(edge_config));
        EdgeAnnouncer::new(
            client,
            services.coordinator_id.clone(),
            config.advertised_url.clone(),
            config.dht_port,
            edge_config.retries.clone(),
        )
        .start()
    });

    let cors = Cors::new().allow_origin_regex(&config.cors_origin_regex);

    let app = api::combined_routes(&services)
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

    // Stop and join the background loops before exiting.
    let _ = purger_shutdown.send(());
    let _ = purger_handle.await;
    if let Some((announcer_handle, announcer_shutdown)) = announcer {
        let _ = announcer_shutdown.send(());
        let _ = announcer_handle.await;
    }

    Ok(())
}
