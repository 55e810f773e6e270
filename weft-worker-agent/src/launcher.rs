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

use crate::agent::AgentState;
use crate::config::LauncherConfig;
use std::collections::{BTreeMap, BTreeSet};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use weft_common::catalog::ServiceCatalog;
use weft_common::model::ServiceName;

/// Starts and stops the containers for the services the coordinator
/// assigned to this worker, and polls them to readiness. Services that
/// fail to come up are reported as degraded so the next heartbeat can ask
/// for reassignment.
pub struct ServiceLauncher {
    config: LauncherConfig,
    catalog: std::sync::Arc<ServiceCatalog>,
    ready_timeout: Duration,
    client: reqwest::Client,
    running: Mutex<BTreeMap<ServiceName, Child>>,
}

impl ServiceLauncher {
    pub fn new(
        config: LauncherConfig,
        catalog: std::sync::Arc<ServiceCatalog>,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            config,
            catalog,
            ready_timeout,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()
                .expect("reqwest client construction only fails on invalid builder settings"),
            running: Mutex::new(BTreeMap::new()),
        }
    }

    /// Reconciles the set of running services with the assignment:
    /// stops what is no longer assigned, launches what is missing, and
    /// returns the services that failed to become ready.
    pub async fn sync(&self, assigned: &BTreeSet<ServiceName>) -> BTreeSet<ServiceName> {
        if !self.config.enabled {
            return BTreeSet::new();
        }

        let to_stop: Vec<ServiceName> = {
            let running = self.running.lock().await;
            running
                .keys()
                .filter(|service| !assigned.contains(*service))
                .cloned()
                .collect()
        };
        for service in to_stop {
            self.stop(&service).await;
        }

        let mut degraded = BTreeSet::new();
        for service in assigned {
            if self.running.lock().await.contains_key(service) {
                continue;
            }
            match self.launch(service).await {
                Ok(()) => {}
                Err(err) => {
                    warn!(service = %service, error = %err, "Service failed to come up");
                    degraded.insert(service.clone());
                }
            }
        }
        degraded
    }

    async fn launch(&self, service: &ServiceName) -> Result<(), String> {
        let descriptor = self
            .catalog
            .get(service)
            .ok_or_else(|| format!("service {service} is not in the catalog"))?;

        let command = match self.config.commands.get(&service.0) {
            Some(custom) => custom.clone(),
            None => default_command(&self.config.image_prefix, &service.0, descriptor.port),
        };
        let (program, args) = command
            .split_first()
            .ok_or_else(|| format!("empty launch command for {service}"))?;

        info!(service = %service, port = descriptor.port, "Launching service");
        let child = Command::new(program)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| format!("failed to spawn: {err}"))?;
        self.running.lock().await.insert(service.clone(), child);

        self.wait_ready(service, descriptor.port).await.inspect_err(|_| {
            // Leave the child registered; a later sync or shutdown will
            // clean it up once the coordinator reassigns.
        })
    }

    async fn wait_ready(&self, service: &ServiceName, port: u16) -> Result<(), String> {
        let health_url = format!("http://127.0.0.1:{port}/health");
        let deadline = tokio::time::Instant::now() + self.ready_timeout;
        loop {
            match self.client.get(&health_url).send().await {
                Ok(response) if response.status().is_success() => {
                    info!(service = %service, "Service is ready");
                    return Ok(());
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(format!(
                    "service {service} not ready within {}s",
                    self.ready_timeout.as_secs()
                ));
            }
            tokio::time::sleep(self.config.readiness_poll_interval).await;
        }
    }

    async fn stop(&self, service: &ServiceName) {
        if let Some(mut child) = self.running.lock().await.remove(service) {
            info!(service = %service, "Stopping service");
            let _ = child.kill().await;
        }
    }

    pub async fn shutdown(&self) {
        let services: Vec<ServiceName> = self.running.lock().await.keys().cloned().collect();
        for service in services {
            self.stop(&service).await;
        }
    }

    pub async fn running_services(&self) -> Vec<ServiceName> {
        self.running.lock().await.keys().cloned().collect()
    }

    async fn is_healthy(&self, service: &ServiceName) -> bool {
        let Some(descriptor) = self.catalog.get(service) else {
            return false;
        };
        let health_url = format!("http://127.0.0.1:{}/health", descriptor.port);
        matches!(
            self.client.get(&health_url).send().await,
            Ok(response) if response.status().is_success()
        )
    }

    /// Spawns the per-service health monitor: running services that stop
    /// answering their health probe are marked degraded (and recover when
    /// the probe does), which the next heartbeat reports upstream.
    pub fn start_health_monitor(
        launcher: Arc<ServiceLauncher>,
        state: Arc<AgentState>,
        interval: Duration,
    ) -> (JoinHandle<()>, oneshot::Sender<()>) {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("Service health monitor shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if !launcher.config.enabled {
                            continue;
                        }
                        for service in launcher.running_services().await {
                            let healthy = launcher.is_healthy(&service).await;
                            let mut degraded = state.degraded.write().await;
                            if healthy {
                                degraded.remove(&service);
                            } else if degraded.insert(service.clone()) {
                                warn!(service = %service, "Service stopped answering its health probe");
                            }
                        }
                    }
                }
            }
        });
        (handle, shutdown_tx)
    }
}

fn default_command(image_prefix: &str, service: &str, port: u16) -> Vec<String> {
    vec![
        "docker".to_string(),
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        format!("weft-{service}"),
        "-p".to_string(),
        format!("{port}:{port}"),
        format!("{image_prefix}{service}"),
    ]
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn default_commands_bind_the_cataloged_port() {
        let command = default_command("weft/", "llm-inference", 8001);
        assert_eq!(command[0], "docker");
        assert!(command.contains(&"8001:8001".to_string()));
        assert!(command.contains(&"weft/llm-inference".to_string()));
    }
}
