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

use crate::model::CoordinatorRecord;
use crate::repo::{CoordinatorRepo, RepoError};
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;
use weft_common::model::{
    RegisterCoordinatorRequest, RegisterCoordinatorResponse,
};

#[derive(Debug, thiserror::Error)]
pub enum EdgeRegistryError {
    #[error("Invalid registration: {}", .0.join(", "))]
    InvalidRegistration(Vec<String>),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// TTL-scoped registry of coordinators, persisted so a restarted edge
/// router keeps routing without waiting a full heartbeat round.
pub struct CoordinatorRegistry {
    repo: Arc<dyn CoordinatorRepo>,
    coordinator_ttl: Duration,
    heartbeat_interval: Duration,
    cursor: AtomicUsize,
}

impl CoordinatorRegistry {
    pub fn new(
        repo: Arc<dyn CoordinatorRepo>,
        coordinator_ttl: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            repo,
            coordinator_ttl,
            heartbeat_interval,
            cursor: AtomicUsize::new(0),
        }
    }

    pub async fn register(
        &self,
        request: &RegisterCoordinatorRequest,
    ) -> Result<RegisterCoordinatorResponse, EdgeRegistryError> {
        request
            .validate()
            .map_err(EdgeRegistryError::InvalidRegistration)?;

        let now = Utc::now();
        let coordinator_id = request
            .coordinator_id
            .as_ref()
            .map(|id| id.0.clone())
            .unwrap_or_else(|| format!("coordinator-{}", &Uuid::new_v4().simple().to_string()[..8]));

        let record = CoordinatorRecord {
            coordinator_id: coordinator_id.clone(),
            tunnel_url: request.tunnel_url.clone(),
            location: request.location.clone(),
            dht_port: request.dht_port.map(i64::from),
            registered_at: now,
            last_heartbeat: now,
        };
        self.repo.upsert(&record).await?;
        info!(coordinator_id, "Registered coordinator");

        Ok(RegisterCoordinatorResponse {
            coordinator_id: weft_common::model::CoordinatorId::new(coordinator_id),
            heartbeat_interval: self.heartbeat_interval.as_secs(),
        })
    }

    /// True when the heartbeat landed on a known record; false asks the
    /// coordinator to re-register.
    pub async fn heartbeat(&self, coordinator_id: &str) -> Result<bool, EdgeRegistryError> {
        Ok(self.repo.touch(coordinator_id, Utc::now()).await?)
    }

    pub async fn live(&self) -> Result<Vec<CoordinatorRecord>, EdgeRegistryError> {
        let now = Utc::now();
        let records = self.repo.get_all().await?;
        Ok(records
            .into_iter()
            .filter(|record| record.is_live(now, self.coordinator_ttl))
            .collect())
    }

    /// Live coordinators rotated by the shared cursor; the first entry is
    /// the preferred target, the rest are failover candidates.
    pub async fn pick_ordered(&self) -> Result<Vec<CoordinatorRecord>, EdgeRegistryError> {
        let live = self.live().await?;
        if live.is_empty() {
            return Ok(live);
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % live.len();
        let mut ordered = Vec::with_capacity(live.len());
        ordered.extend_from_slice(&live[start..]);
        ordered.extend_from_slice(&live[..start]);
        Ok(ordered)
    }

    /// Seed URLs for peer discovery: the live coordinators themselves.
    pub async fn bootstrap_seeds(&self) -> Result<Vec<String>, EdgeRegistryError> {
        Ok(self
            .live()
            .await?
            .into_iter()
            .map(|record| record.tunnel_url)
            .collect())
    }

    /// Deletes records dead for well past the TTL; recently-stale ones
    /// are kept so a briefly-partitioned coordinator can come back
    /// without re-registering.
    pub async fn purge_expired(&self) -> Result<u64, EdgeRegistryError> {
        let ttl = chrono::Duration::from_std(self.coordinator_ttl * 4)
            .unwrap_or_else(|_| chrono::Duration::seconds(1200));
        let cutoff = Utc::now() - ttl;
        Ok(self.repo.delete_older_than(cutoff).await?)
    }

    pub fn start_purger(
        registry: Arc<CoordinatorRegistry>,
        interval: Duration,
    ) -> (JoinHandle<()>, oneshot::Sender<()>) {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("Coordinator purger shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        match registry.purge_expired().await {
                            Ok(0) => {}
                            Ok(purged) => info!(purged, "Purged dead coordinators"),
                            Err(err) => warn!(error = %err, "Coordinator purge failed"),
                        }
                    }
                }
            }
        });
        (handle, shutdown_tx)
    }
}
