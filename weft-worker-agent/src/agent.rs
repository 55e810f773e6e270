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

use crate::config::WorkerAgentConfig;
use crate::launcher::ServiceLauncher;
use crate::router::FingerCacheRouter;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};
use url::Url;
use weft_common::clients::coordinator::{
    CoordinatorService, CoordinatorServiceDefault,
};
use weft_common::clients::edge::{EdgeRouterService, EdgeRouterServiceDefault};
use weft_common::model::{
    Capabilities, RegisterWorkerRequest, RegisterWorkerResponse, ReportedStatus, ServiceName,
    WorkerHeartbeatRequest, WorkerId,
};

/// Terminal failures of the agent lifecycle, mapped to process exit
/// codes in the binary.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Tunnel could not be established: {0}")]
    Tunnel(String),
    #[error("Registration budget exhausted against every known coordinator")]
    RegistrationBudgetExceeded,
}

/// State shared between the lifecycle loop and the HTTP surface.
pub struct AgentState {
    pub worker_id: RwLock<Option<WorkerId>>,
    pub assigned: Arc<RwLock<BTreeSet<ServiceName>>>,
    pub degraded: RwLock<BTreeSet<ServiceName>>,
    pub mesh_ip: Option<String>,
    pub started_at: Instant,
}

impl AgentState {
    pub fn new(mesh_ip: Option<String>) -> Self {
        Self {
            worker_id: RwLock::new(None),
            assigned: Arc::new(RwLock::new(BTreeSet::new())),
            degraded: RwLock::new(BTreeSet::new()),
            mesh_ip,
            started_at: Instant::now(),
        }
    }

    pub async fn reported_status(&self) -> ReportedStatus {
        if self.degraded.read().await.is_empty() {
            ReportedStatus::Healthy
        } else {
            ReportedStatus::Degraded
        }
    }
}

/// The register -> launch -> heartbeat lifecycle. Owns the control-plane
/// clients; the HTTP surface and the router run beside it.
pub struct AgentLifecycle {
    config: WorkerAgentConfig,
    state: Arc<AgentState>,
    launcher: Arc<ServiceLauncher>,
    router: Arc<FingerCacheRouter>,
    coordinator: Arc<dyn CoordinatorService>,
    edge: Arc<dyn EdgeRouterService>,
    capabilities: Capabilities,
    tunnel_url: Url,
}

impl AgentLifecycle {
    pub fn new(
        config: WorkerAgentConfig,
        state: Arc<AgentState>,
        launcher: Arc<ServiceLauncher>,
        router: Arc<FingerCacheRouter>,
        capabilities: Capabilities,
        tunnel_url: Url,
    ) -> Self {
        let coordinator = Arc::new(CoordinatorServiceDefault::new(&config.coordinator));
        let edge = Arc::new(EdgeRouterServiceDefault::new(&config.coordinator));
        Self {
            config,
            state,
            launcher,
            router,
            coordinator,
            edge,
            capabilities,
            tunnel_url,
        }
    }

    /// Runs until shutdown is requested or a terminal error occurs.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<(), AgentError> {
        loop {
            let registration = tokio::select! {
                registration = self.register_with_budget() => registration?,
                _ = shutdown.changed() => return self.shutdown_cleanly().await,
            };

            self.adopt(&registration).await;

            let degraded = self
                .launcher
                .sync(&registration.assigned_services.iter().cloned().collect())
                .await;
            if !degraded.is_empty() {
                warn!(count = degraded.len(), "Some services failed to come up");
            }
            *self.state.degraded.write().await = degraded;

            let interval = Duration::from_secs(registration.heartbeat_interval.max(1));
            match self.heartbeat_until_rejected(interval, &mut shutdown).await {
                HeartbeatLoopEnd::ReRegister => continue,
                HeartbeatLoopEnd::Shutdown => return self.shutdown_cleanly().await,
            }
        }
    }

    /// Registers against the configured entry point, reseeding the
    /// coordinator list from the edge router once the budget runs out.
    async fn register_with_budget(&self) -> Result<RegisterWorkerResponse, AgentError> {
        if let Some(registration) = self
            .register_against(self.coordinator.as_ref(), self.config.registration_budget)
            .await
        {
            return Ok(registration);
        }

        warn!("Registration budget exhausted; reseeding coordinators from the edge router");
        let coordinators = match self.edge.list_coordinators().await {
            Ok(coordinators) => coordinators,
            Err(err) => {
                warn!(error = %err, "Failed to fetch the coordinator list");
                vec![]
            }
        };
        for coordinator in coordinators {
            let Ok(url) = Url::parse(&coordinator.tunnel_url) else {
                continue;
            };
            info!(coordinator_id = %coordinator.coordinator_id, "Trying reseeded coordinator");
            let client = CoordinatorServiceDefault::with_base_url(url);
            if let Some(registration) = self
                .register_against(&client, self.config.registration_budget)
                .await
            {
                return Ok(registration);
            }
        }
        Err(AgentError::RegistrationBudgetExceeded)
    }

    async fn register_against(
        &self,
        client: &dyn CoordinatorService,
        budget: Duration,
    ) -> Option<RegisterWorkerResponse> {
        let deadline = Instant::now() + budget;
        let mut attempt = 1u32;
        loop {
            let request = RegisterWorkerRequest {
                worker_id: self.current_worker_id().await,
                tunnel_url: self.tunnel_url.to_string(),
                mesh_ip: self.state.mesh_ip.clone(),
                capabilities: self.capabilities.clone(),
            };
            match client.register_worker(&request).await {
                Ok(registration) => return Some(registration),
                Err(err) => {
                    warn!(attempt, error = %err, "Registration failed");
                }
            }
            attempt += 1;
            let delay = self.config.backoff.delay_before(attempt);
            if Instant::now() + delay >= deadline {
                return None;
            }
            tokio::time::sleep(delay).await;
        }
    }

    /// Stores the authoritative identity the coordinator answered with;
    /// a client-proposed id is only ever a hint. The seed list piggybacks
    /// on the same response and installs the discovery accelerator.
    async fn adopt(&self, registration: &RegisterWorkerResponse) {
        info!(
            worker_id = %registration.worker_id,
            services = registration.assigned_services.len(),
            coordinator_id = %registration.coordinator_id,
            "Registered"
        );
        *self.state.worker_id.write().await = Some(registration.worker_id.clone());
        *self.state.assigned.write().await =
            registration.assigned_services.iter().cloned().collect();
        if let Some(seeds) = &registration.dht_seeds {
            let accelerator = crate::dht::SeedDirectory::from_seeds(seeds)
                .map(|directory| Arc::new(directory) as Arc<dyn crate::router::PeerDirectory>);
            self.router.set_accelerator(accelerator).await;
        }
    }

    async fn current_worker_id(&self) -> Option<WorkerId> {
        let adopted = self.state.worker_id.read().await.clone();
        adopted.or_else(|| self.config.worker_id.clone().map(WorkerId::new))
    }

    async fn heartbeat_until_rejected(
        &self,
        interval: Duration,
        shutdown: &mut tokio::sync::watch::Receiver<bool>,
    ) -> HeartbeatLoopEnd {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => return HeartbeatLoopEnd::Shutdown,
                _ = ticker.tick() => {
                    let Some(worker_id) = self.state.worker_id.read().await.clone() else {
                        return HeartbeatLoopEnd::ReRegister;
                    };
                    let request = WorkerHeartbeatRequest {
                        worker_id,
                        load: Some(self.current_load()),
                        tasks_completed: Some(self.router.tasks_completed()),
                        status: Some(self.state.reported_status().await),
                    };
                    match self.coordinator.heartbeat_worker(&request).await {
                        Ok(response) if response.requires_re_register() => {
                            info!("Coordinator asked for re-registration");
                            return HeartbeatLoopEnd::ReRegister;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(error = %err, "Heartbeat failed; will retry next tick");
                        }
                    }
                }
            }
        }
    }

    /// Load derives from the host itself: 1-minute average normalized by
    /// core count, clamped into the reportable range.
    fn current_load(&self) -> f64 {
        let load_avg = sysinfo::System::load_average().one;
        let cores = self.capabilities.cpu_cores.unwrap_or(1).max(1) as f64;
        (load_avg / cores).clamp(0.0, 1.0)
    }

    async fn shutdown_cleanly(&self) -> Result<(), AgentError> {
        info!("Shutting down");
        if let Some(worker_id) = self.state.worker_id.read().await.clone() {
            // Best effort; TTL expiry covers a lost deregister.
            let _ = self.deregister(&worker_id).await;
        }
        self.launcher.shutdown().await;
        Ok(())
    }

    async fn deregister(&self, worker_id: &WorkerId) -> Result<(), String> {
        let client = reqwest::Client::new();
        let url = format!(
            "{}/api/worker/deregister",
            self.config.coordinator.url.as_str().trim_end_matches('/')
        );
        client
            .post(url)
            .timeout(Duration::from_secs(5))
            .json(&serde_json::json!({ "worker_id": worker_id }))
            .send()
            .await
            .map(|_| ())
            .map_err(|err| err.to_string())
    }
}

enum HeartbeatLoopEnd {
    ReRegister,
    Shutdown,
}
