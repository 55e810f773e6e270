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
use std::collections::HashMap;
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;
use weft_common::config::{ConfigLoader, RemoteServiceConfig};
use weft_common::model::WorkerType;
use weft_common::retries::RetryConfig;
use weft_common::tracing::TracingConfig;
use weft_common::SafeDisplay;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerAgentConfig {
    pub tracing: TracingConfig,
    pub http_port: u16,
    /// Control-plane entry point; in practice the edge router, whose
    /// surface mirrors the coordinator paths.
    pub coordinator: RemoteServiceConfig,
    /// Worker id to propose on first registration. The coordinator's
    /// answer is authoritative either way.
    pub worker_id: Option<String>,
    pub worker_type: WorkerType,
    /// Public address of this host, when one exists; feeds edge
    /// eligibility.
    pub public_ip: Option<String>,
    pub tunnel: TunnelConfig,
    pub mesh: MeshConfig,
    pub launcher: LauncherConfig,
    /// Per-service readiness deadline after launch.
    #[serde(with = "humantime_serde")]
    pub service_ready_timeout: Duration,
    /// How long registration may keep failing before the agent reseeds
    /// its coordinator list from the edge router.
    #[serde(with = "humantime_serde")]
    pub registration_budget: Duration,
    /// Backoff shape for the registration loop.
    pub backoff: RetryConfig,
    pub cors_origin_regex: String,
}

impl Default for WorkerAgentConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("weft-worker-agent"),
            http_port: 9871,
            coordinator: RemoteServiceConfig::localhost(9880),
            worker_id: None,
            worker_type: WorkerType::Auto,
            public_ip: None,
            tunnel: TunnelConfig::default(),
            mesh: MeshConfig::default(),
            launcher: LauncherConfig::default(),
            service_ready_timeout: Duration::from_secs(120),
            registration_budget: Duration::from_secs(300),
            backoff: RetryConfig {
                max_attempts: u32::MAX,
                min_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                multiplier: 2.0,
                jitter: 0.2,
            },
            cors_origin_regex: ".*".to_string(),
        }
    }
}

impl SafeDisplay for WorkerAgentConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "HTTP port: {}", self.http_port);
        let _ = writeln!(&mut result, "coordinator:");
        let _ = writeln!(&mut result, "{}", self.coordinator.to_safe_string_indented());
        let _ = writeln!(
            &mut result,
            "worker id: {}",
            self.worker_id.as_deref().unwrap_or("<assigned>")
        );
        let _ = writeln!(&mut result, "worker type: {}", self.worker_type);
        let _ = writeln!(&mut result, "tunnel mode: {}", self.tunnel.mode);
        let _ = writeln!(
            &mut result,
            "service ready timeout: {}s",
            self.service_ready_timeout.as_secs()
        );
        result
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    /// A pre-provisioned tunnel with a stable hostname.
    Named,
    /// A throwaway tunnel whose URL is read from the tunnel process.
    Ephemeral,
    /// No tunnel; the advertised URL is reachable as-is.
    None,
}

impl std::fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelMode::Named => write!(f, "named"),
            TunnelMode::Ephemeral => write!(f, "ephemeral"),
            TunnelMode::None => write!(f, "none"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub mode: TunnelMode,
    /// Tunnel binary and arguments, e.g. `["cloudflared", "tunnel", ...]`.
    pub command: Vec<String>,
    /// Public URL of the tunnel; required for `named` and `none`.
    pub advertised_url: Option<Url>,
    /// How long to wait for an ephemeral tunnel to print its URL.
    #[serde(with = "humantime_serde")]
    pub url_capture_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            mode: TunnelMode::None,
            command: vec![],
            advertised_url: Some(
                Url::parse("http://localhost:9871").expect("hardcoded URL must parse"),
            ),
            url_capture_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Private overlay address of this host, when the overlay is up.
    pub mesh_ip: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// When false, assigned services are tracked but nothing is spawned;
    /// something outside the agent runs them.
    pub enabled: bool,
    /// Image prefix for the default containerized launch.
    pub image_prefix: String,
    /// Full command override per service name.
    pub commands: HashMap<String, Vec<String>>,
    /// Poll interval while waiting for a service to become ready.
    #[serde(with = "humantime_serde")]
    pub readiness_poll_interval: Duration,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            image_prefix: "weft/".to_string(),
            commands: HashMap::new(),
            readiness_poll_interval: Duration::from_secs(2),
        }
    }
}

pub fn make_config_loader() -> ConfigLoader<WorkerAgentConfig> {
    ConfigLoader::new(&PathBuf::from("config/worker-agent.toml"))
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
