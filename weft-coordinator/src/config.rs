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

use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;
use weft_common::config::{ConfigLoader, RemoteServiceConfig};
use weft_common::tracing::TracingConfig;
use weft_common::SafeDisplay;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub tracing: TracingConfig,
    pub environment: String,
    pub http_port: u16,
    pub coordinator_id: String,
    /// Interval workers are told to heartbeat at.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Worker records older than this since their last heartbeat are
    /// treated as absent. Zero means "derive as 5x heartbeat_interval".
    #[serde(with = "humantime_serde")]
    pub worker_ttl: Duration,
    /// Window within which an identical re-registration is treated as a
    /// retry and does not rerun the assignment policy.
    #[serde(with = "humantime_serde")]
    pub no_thrash_window: Duration,
    /// How many other workers the reverse proxy tries after the first
    /// choice fails.
    pub proxy_failover_retries: usize,
    /// Global override of the per-service forward timeouts from the
    /// catalog; unset means "use the catalog defaults".
    #[serde(default, with = "humantime_serde::option")]
    pub proxy_timeout: Option<Duration>,
    /// URL under which this coordinator is reachable from the edge router
    /// and from workers.
    pub advertised_url: Url,
    /// When set, the coordinator announces itself to this edge router and
    /// keeps heart-beating it.
    pub edge_router: Option<RemoteServiceConfig>,
    /// Peer-discovery seeds handed to workers on registration.
    pub dht_seeds: Vec<String>,
    /// Advertised to the edge router for peers that speak the discovery
    /// protocol on a dedicated port.
    pub dht_port: Option<u16>,
    pub cors_origin_regex: String,
}

impl CoordinatorConfig {
    pub fn effective_worker_ttl(&self) -> Duration {
        if self.worker_ttl.is_zero() {
            self.heartbeat_interval * 5
        } else {
            self.worker_ttl
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("weft-coordinator"),
            environment: "dev".to_string(),
            http_port: 9870,
            coordinator_id: "coordinator-local".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            worker_ttl: Duration::ZERO,
            no_thrash_window: Duration::from_secs(30),
            proxy_failover_retries: 2,
            proxy_timeout: None,
            advertised_url: Url::parse("http://localhost:9870")
                .expect("hardcoded advertised URL must parse"),
            edge_router: None,
            dht_seeds: vec![],
            dht_port: None,
            cors_origin_regex: ".*".to_string(),
        }
    }
}

impl SafeDisplay for CoordinatorConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "environment: {}", self.environment);
        let _ = writeln!(&mut result, "HTTP port: {}", self.http_port);
        let _ = writeln!(&mut result, "coordinator id: {}", self.coordinator_id);
        let _ = writeln!(
            &mut result,
            "heartbeat interval: {}s",
            self.heartbeat_interval.as_secs()
        );
        let _ = writeln!(
            &mut result,
            "worker TTL: {}s",
            self.effective_worker_ttl().as_secs()
        );
        let _ = writeln!(&mut result, "advertised URL: {}", self.advertised_url);
        match &self.edge_router {
            Some(edge) => {
                let _ = writeln!(&mut result, "edge router:");
                let _ = writeln!(&mut result, "{}", edge.to_safe_string_indented());
            }
            None => {
                let _ = writeln!(&mut result, "edge router: disabled");
            }
        }
        let _ = writeln!(&mut result, "DHT seeds: {}", self.dht_seeds.len());
        let _ = writeln!(&mut result, "CORS origin regex: {}", self.cors_origin_regex);
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<CoordinatorConfig> {
    ConfigLoader::new(&PathBuf::from("config/coordinator.toml"))
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use crate::config::make_config_loader;

    #[test]
    pub fn config_is_loadable() {
        make_config_loader().load().expect("Failed to load config");
    }
}
