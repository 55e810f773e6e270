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
use weft_common::config::ConfigLoader;
use weft_common::tracing::TracingConfig;
use weft_common::SafeDisplay;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeRouterConfig {
    pub tracing: TracingConfig,
    pub http_port: u16,
    pub db: DbConfig,
    /// Coordinators without a heartbeat for this long stop receiving
    /// traffic.
    #[serde(with = "humantime_serde")]
    pub coordinator_ttl: Duration,
    /// Interval coordinators are told to heartbeat at.
    #[serde(with = "humantime_serde")]
    pub coordinator_heartbeat_interval: Duration,
    /// TTL clients should apply to the bootstrap seed list.
    #[serde(with = "humantime_serde")]
    pub dht_bootstrap_ttl: Duration,
    /// How many other coordinators the forwarder tries after the first
    /// choice fails.
    pub forward_failover_retries: usize,
    #[serde(with = "humantime_serde")]
    pub forward_timeout: Duration,
    pub cors_origin_regex: String,
}

impl Default for EdgeRouterConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("weft-edge-router"),
            http_port: 9880,
            db: DbConfig::default(),
            coordinator_ttl: Duration::from_secs(300),
            coordinator_heartbeat_interval: Duration::from_secs(60),
            dht_bootstrap_ttl: Duration::from_secs(300),
            forward_failover_retries: 2,
            forward_timeout: Duration::from_secs(300),
            cors_origin_regex: ".*".to_string(),
        }
    }
}

impl SafeDisplay for EdgeRouterConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "HTTP port: {}", self.http_port);
        let _ = writeln!(&mut result, "DB:");
        let _ = writeln!(&mut result, "{}", self.db.to_safe_string_indented());
        let _ = writeln!(
            &mut result,
            "coordinator TTL: {}s",
            self.coordinator_ttl.as_secs()
        );
        let _ = writeln!(&mut result, "CORS origin regex: {}", self.cors_origin_regex);
        result
    }
}

/// Sqlite is plenty here: the store holds tens of coordinator records and
/// sees one write per coordinator per minute.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbConfig {
    pub database: String,
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database: "sqlite:data/edge-router.db?mode=rwc".to_string(),
            max_connections: 4,
        }
    }
}

impl SafeDisplay for DbConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "database: {}", self.database);
        let _ = writeln!(&mut result, "max connections: {}", self.max_connections);
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<EdgeRouterConfig> {
    ConfigLoader::new(&PathBuf::from("config/edge-router.toml"))
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
