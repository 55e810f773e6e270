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

use crate::assignment::plan_assignment;
use crate::metrics;
use crate::model::{
    AssignmentSnapshot, HeartbeatOutcome, Registration, RegistryError, WorkerRecord,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use weft_common::catalog::ServiceCatalog;
use weft_common::model::{
    GapStatus, RegisterWorkerRequest, ServiceGap, ServiceName, ServicePeer, ServiceSummary,
    WorkerHeartbeatRequest, WorkerId, WorkerView,
};

#[derive(Default)]
struct RegistryCore {
    workers: HashMap<WorkerId, WorkerRecord>,
    /// Derived inverse index; always rebuildable from `workers`.
    service_index: HashMap<ServiceName, BTreeSet<WorkerId>>,
    /// Per-tier id allocation sequences; monotonic for the process
    /// lifetime so coordinator-assigned ids are never handed out twice.
    id_sequences: HashMap<&'static str, u64>,
}

impl RegistryCore {
    fn allocate_id(&mut self, prefix: &'static str) -> WorkerId {
        loop {
            let sequence = self.id_sequences.entry(prefix).or_insert(0);
            *sequence += 1;
            let candidate = WorkerId::new(format!("{prefix}-{sequence}"));
            if !self.workers.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    fn unindex_worker(&mut self, record: &WorkerRecord) {
        for service in &record.assigned_services {
            if let Some(ids) = self.service_index.get_mut(service) {
                ids.remove(&record.worker_id);
                if ids.is_empty() {
                    self.service_index.remove(service);
                }
            }
        }
    }

    fn index_worker(&mut self, record: &WorkerRecord) {
        for service in &record.assigned_services {
            self.service_index
                .entry(service.clone())
                .or_default()
                .insert(record.worker_id.clone());
        }
    }

    /// Compares the derived index against the primary map and rebuilds it
    /// when they diverge. Divergence is a bug, but the registry must keep
    /// serving; the primary map is the truth.
    fn heal_index(&mut self) {
        let mut expected: HashMap<ServiceName, BTreeSet<WorkerId>> = HashMap::new();
        for record in self.workers.values() {
            for service in &record.assigned_services {
                expected
                    .entry(service.clone())
                    .or_default()
                    .insert(record.worker_id.clone());
            }
        }
        if expected != self.service_index {
            error!("Service index diverged from the worker map; rebuilding");
            self.service_index = expected;
        }
    }

    fn snapshot_excluding(
        &self,
        excluded: Option<&WorkerId>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> AssignmentSnapshot {
        let mut snapshot = AssignmentSnapshot::default();
        for record in self.workers.values() {
            if Some(&record.worker_id) == excluded || record.is_stale(now, ttl) {
                continue;
            }
            *snapshot.class_counts.entry(record.class).or_insert(0) += 1;
            for service in &record.assigned_services {
                *snapshot.coverage.entry(service.clone()).or_insert(0) += 1;
            }
        }
        snapshot
    }

    fn purge_expired(&mut self, now: DateTime<Utc>, ttl: Duration) -> Vec<WorkerId> {
        let expired: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|record| record.is_stale(now, ttl))
            .map(|record| record.worker_id.clone())
            .collect();
        for worker_id in &expired {
            if let Some(record) = self.workers.remove(worker_id) {
                self.unindex_worker(&record);
                info!(worker_id = %record.worker_id, "Evicted expired worker");
            }
        }
        expired
    }
}

/// The coordinator's in-memory worker registry. All mutation happens under
/// one write lock with no I/O inside the critical section; readers take
/// cheap snapshots.
pub struct WorkerRegistry {
    catalog: Arc<ServiceCatalog>,
    worker_ttl: Duration,
    no_thrash_window: Duration,
    core: RwLock<RegistryCore>,
}

impl WorkerRegistry {
    pub fn new(catalog: Arc<ServiceCatalog>, worker_ttl: Duration, no_thrash_window: Duration) -> Self {
        Self {
            catalog,
            worker_ttl,
            no_thrash_window,
            core: RwLock::new(RegistryCore::default()),
        }
    }

    pub fn worker_ttl(&self) -> Duration {
        self.worker_ttl
    }

    /// Registers a new worker or refreshes an existing one. Reruns the
    /// assignment policy unless the request is an identical retry within
    /// the no-thrash window.
    pub async fn register(
        &self,
        request: &RegisterWorkerRequest,
    ) -> Result<Registration, RegistryError> {
        request
            .validate()
            .map_err(RegistryError::InvalidRegistration)?;

        let now = Utc::now();
        let class = request.capabilities.resolved_type();
        let mut core = self.core.write().await;
        core.purge_expired(now, self.worker_ttl);

        let existing = request
            .worker_id
            .as_ref()
            .and_then(|id| core.workers.get(id))
            .filter(|record| !record.is_stale(now, self.worker_ttl))
            .cloned();

        if let Some(record) = existing {
            if record.tunnel_url != request.tunnel_url {
                return Err(RegistryError::IdCollision(record.worker_id));
            }
            let unchanged = record.capabilities == request.capabilities
                && record.mesh_ip == request.mesh_ip;
            let within_window = (now - record.last_registered_at)
                .to_std()
                .map(|age| age <= self.no_thrash_window)
                .unwrap_or(false);
            if unchanged && within_window {
                let worker_id = record.worker_id.clone();
                let assigned = record.assigned_services.iter().cloned().collect();
                if let Some(stored) = core.workers.get_mut(&worker_id) {
                    stored.last_heartbeat = now;
                    stored.last_registered_at = now;
                }
                return Ok(Registration {
                    worker_id,
                    assigned_services: assigned,
                    reused: true,
                });
            }

            // Renewal: capabilities or mesh address changed, or the
            // no-thrash window has passed. Reassign from scratch.
            let snapshot = core.snapshot_excluding(Some(&record.worker_id), now, self.worker_ttl);
            let assigned_services = plan_assignment(&self.catalog, &snapshot, &request.capabilities);
            self.log_policy_outcome(&record.worker_id, &assigned_services);
            core.unindex_worker(&record);
            let updated = WorkerRecord {
                tunnel_url: request.tunnel_url.clone(),
                mesh_ip: request.mesh_ip.clone(),
                capabilities: request.capabilities.clone(),
                class,
                assigned_services: assigned_services.clone(),
                last_registered_at: now,
                last_heartbeat: now,
                ..record
            };
            core.index_worker(&updated);
            core.workers.insert(updated.worker_id.clone(), updated.clone());
            metrics::record_worker_registration();
            return Ok(Registration {
                worker_id: updated.worker_id,
                assigned_services: assigned_services.into_iter().collect(),
                reused: false,
            });
        }

        // Fresh registration. A proposed id pointing at a stale record is
        // not honored; the old record is dropped and a new id allocated.
        let worker_id = match &request.worker_id {
            Some(id) if !core.workers.contains_key(id) => id.clone(),
            Some(id) => {
                if let Some(stale) = core.workers.remove(id) {
                    core.unindex_worker(&stale);
                }
                core.allocate_id(class.id_prefix())
            }
            None => core.allocate_id(class.id_prefix()),
        };

        let snapshot = core.snapshot_excluding(Some(&worker_id), now, self.worker_ttl);
        let assigned_services = plan_assignment(&self.catalog, &snapshot, &request.capabilities);
        self.log_policy_outcome(&worker_id, &assigned_services);
        let record = WorkerRecord {
            worker_id: worker_id.clone(),
            tunnel_url: request.tunnel_url.clone(),
            mesh_ip: request.mesh_ip.clone(),
            capabilities: request.capabilities.clone(),
            class,
            assigned_services: assigned_services.clone(),
            load: 0.0,
            tasks_completed: 0,
            reported_status: weft_common::model::ReportedStatus::Healthy,
            registered_at: now,
            last_registered_at: now,
            last_heartbeat: now,
        };
        core.index_worker(&record);
        core.workers.insert(worker_id.clone(), record);
        metrics::record_worker_registration();
        metrics::set_workers_online(core.workers.len() as i64);
        info!(worker_id = %worker_id, class = %class, "Registered worker");

        Ok(Registration {
            worker_id,
            assigned_services: assigned_services.into_iter().collect(),
            reused: false,
        })
    }

    /// Refreshes liveness and load for a known worker. Assignments are
    /// never touched here.
    pub async fn heartbeat(&self, request: &WorkerHeartbeatRequest) -> HeartbeatOutcome {
        let now = Utc::now();
        let mut core = self.core.write().await;
        let known_fresh = core
            .workers
            .get(&request.worker_id)
            .map(|record| !record.is_stale(now, self.worker_ttl));
        match known_fresh {
            Some(true) => {
                if let Some(record) = core.workers.get_mut(&request.worker_id) {
                    record.last_heartbeat = now;
                    if let Some(load) = request.load {
                        record.load = load;
                    }
                    if let Some(tasks_completed) = request.tasks_completed {
                        record.tasks_completed = tasks_completed;
                    }
                    if let Some(status) = request.status {
                        record.reported_status = status;
                    }
                }
                metrics::record_worker_heartbeat();
                HeartbeatOutcome::Accepted
            }
            Some(false) => {
                // The record exists but expired; drop it so the id is not
                // resurrected by the heartbeat.
                if let Some(stale) = core.workers.remove(&request.worker_id) {
                    core.unindex_worker(&stale);
                }
                warn!(worker_id = %request.worker_id, "Heartbeat from expired worker");
                HeartbeatOutcome::Unknown
            }
            None => HeartbeatOutcome::Unknown,
        }
    }

    pub async fn deregister(&self, worker_id: &WorkerId) -> bool {
        let mut core = self.core.write().await;
        match core.workers.remove(worker_id) {
            Some(record) => {
                core.unindex_worker(&record);
                metrics::set_workers_online(core.workers.len() as i64);
                info!(worker_id = %worker_id, "Deregistered worker");
                true
            }
            None => false,
        }
    }

    /// All non-stale workers, in id order.
    pub async fn list_workers(&self) -> Vec<WorkerView> {
        let now = Utc::now();
        let core = self.core.read().await;
        let mut views: Vec<WorkerView> = core
            .workers
            .values()
            .filter(|record| !record.is_stale(now, self.worker_ttl))
            .map(|record| record.view(now, self.worker_ttl))
            .collect();
        views.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        views
    }

    pub async fn worker_count(&self) -> usize {
        let now = Utc::now();
        let core = self.core.read().await;
        core.workers
            .values()
            .filter(|record| !record.is_stale(now, self.worker_ttl))
            .count()
    }

    /// Non-stale workers assigned the given service, in id order.
    pub async fn find_by_service(&self, service: &ServiceName) -> Vec<ServicePeer> {
        let now = Utc::now();
        let core = self.core.read().await;
        let Some(ids) = core.service_index.get(service) else {
            return vec![];
        };
        ids.iter()
            .filter_map(|id| core.workers.get(id))
            .filter(|record| !record.is_stale(now, self.worker_ttl))
            .map(|record| record.peer())
            .collect()
    }

    /// Services that currently have at least one healthy worker.
    pub async fn available_services(&self) -> Vec<ServiceName> {
        let now = Utc::now();
        let core = self.core.read().await;
        let mut services: Vec<ServiceName> = core
            .service_index
            .iter()
            .filter(|(_, ids)| {
                ids.iter()
                    .filter_map(|id| core.workers.get(id))
                    .any(|record| !record.is_stale(now, self.worker_ttl))
            })
            .map(|(service, _)| service.clone())
            .collect();
        services.sort();
        services
    }

    pub async fn service_summaries(&self) -> Vec<ServiceSummary> {
        let now = Utc::now();
        let core = self.core.read().await;
        self.catalog
            .services()
            .map(|descriptor| {
                let healthy = healthy_count(&core, &descriptor.name, now, self.worker_ttl);
                ServiceSummary {
                    service: descriptor.name.clone(),
                    tier: descriptor.tier.as_u8(),
                    priority: descriptor.priority,
                    requires: descriptor.requires,
                    healthy_workers: healthy as u64,
                }
            })
            .collect()
    }

    /// Cluster-wide coverage gaps, worst first.
    pub async fn gaps(&self) -> Vec<ServiceGap> {
        let now = Utc::now();
        let core = self.core.read().await;
        let mut gaps: Vec<ServiceGap> = self
            .catalog
            .services()
            .map(|descriptor| {
                let healthy = healthy_count(&core, &descriptor.name, now, self.worker_ttl);
                let status = if healthy == 0 {
                    GapStatus::Critical
                } else if descriptor.priority == 1 && healthy == 1 {
                    GapStatus::Warning
                } else {
                    GapStatus::Ok
                };
                ServiceGap {
                    service: descriptor.name.clone(),
                    priority: descriptor.priority,
                    current_workers: healthy as u64,
                    status,
                }
            })
            .collect();
        gaps.sort_by(|a, b| {
            a.current_workers
                .cmp(&b.current_workers)
                .then(a.priority.cmp(&b.priority))
                .then(a.service.cmp(&b.service))
        });
        gaps
    }

    /// Drops every record whose TTL has expired. Called periodically by
    /// the purger task and lazily by mutating calls.
    pub async fn purge_expired(&self) -> Vec<WorkerId> {
        let now = Utc::now();
        let mut core = self.core.write().await;
        let expired = core.purge_expired(now, self.worker_ttl);
        core.heal_index();
        metrics::set_workers_online(core.workers.len() as i64);
        expired
    }

    /// Spawns the periodic TTL purger. Send on the returned channel to
    /// stop it; await the handle to join.
    pub fn start_purger(
        registry: Arc<WorkerRegistry>,
        interval: Duration,
    ) -> (JoinHandle<()>, oneshot::Sender<()>) {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("Worker purger shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let expired = registry.purge_expired().await;
                        if !expired.is_empty() {
                            info!(count = expired.len(), "Purged expired workers");
                        }
                    }
                }
            }
        });
        (handle, shutdown_tx)
    }

    fn log_policy_outcome(&self, worker_id: &WorkerId, assigned: &BTreeSet<ServiceName>) {
        if assigned.is_empty() {
            warn!(worker_id = %worker_id, "No service matches the worker's capabilities");
        }
    }
}

fn healthy_count(
    core: &RegistryCore,
    service: &ServiceName,
    now: DateTime<Utc>,
    ttl: Duration,
) -> usize {
    core.service_index
        .get(service)
        .map(|ids| {
            ids.iter()
                .filter_map(|id| core.workers.get(id))
                .filter(|record| !record.is_stale(now, ttl))
                .count()
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use weft_common::model::{Capabilities, WorkerType};

    fn registry(ttl: Duration) -> WorkerRegistry {
        WorkerRegistry::new(
            Arc::new(ServiceCatalog::builtin()),
            ttl,
            Duration::from_secs(30),
        )
    }

    fn gpu_request(worker_id: Option<&str>, tunnel: &str) -> RegisterWorkerRequest {
        RegisterWorkerRequest {
            worker_id: worker_id.map(WorkerId::new),
            tunnel_url: tunnel.to_string(),
            mesh_ip: None,
            capabilities: Capabilities {
                worker_type: WorkerType::Gpu,
                has_gpu: true,
                gpu_type: Some("A100".to_string()),
                cpu_cores: Some(32),
                ram_gb: Some(128),
                storage_gb: Some(1024),
                public_ip: None,
            },
        }
    }

    fn cpu_request(tunnel: &str) -> RegisterWorkerRequest {
        RegisterWorkerRequest {
            worker_id: None,
            tunnel_url: tunnel.to_string(),
            mesh_ip: None,
            capabilities: Capabilities {
                worker_type: WorkerType::Cpu,
                has_gpu: false,
                gpu_type: None,
                cpu_cores: Some(16),
                ram_gb: Some(64),
                storage_gb: Some(256),
                public_ip: None,
            },
        }
    }

    #[test]
    async fn register_allocates_tier_scoped_ids() {
        let registry = registry(Duration::from_secs(150));
        let first = registry
            .register(&gpu_request(None, "https://a.tunnel.test"))
            .await
            .unwrap();
        let second = registry
            .register(&cpu_request("https://b.tunnel.test"))
            .await
            .unwrap();
        assert_eq!(first.worker_id.0, "gpu-1");
        assert_eq!(second.worker_id.0, "cpu-1");
    }

    #[test]
    async fn find_by_service_tracks_assignments_exactly() {
        let registry = registry(Duration::from_secs(150));
        let registration = registry
            .register(&gpu_request(None, "https://a.tunnel.test"))
            .await
            .unwrap();
        for service in &registration.assigned_services {
            let peers = registry.find_by_service(service).await;
            assert_eq!(peers.len(), 1);
            assert_eq!(peers[0].worker_id, registration.worker_id);
        }
        let unassigned = registry
            .find_by_service(&ServiceName::new("edge-relay"))
            .await;
        assert!(unassigned.is_empty());
    }

    #[test]
    async fn heartbeat_of_unknown_worker_requests_re_register() {
        let registry = registry(Duration::from_secs(150));
        let outcome = registry
            .heartbeat(&WorkerHeartbeatRequest {
                worker_id: WorkerId::new("gpu-99"),
                load: None,
                tasks_completed: None,
                status: None,
            })
            .await;
        assert_eq!(outcome, HeartbeatOutcome::Unknown);
    }

    #[test]
    async fn heartbeats_never_change_assignments() {
        let registry = registry(Duration::from_secs(150));
        let registration = registry
            .register(&gpu_request(None, "https://a.tunnel.test"))
            .await
            .unwrap();
        for load in [0.1, 0.9, 0.5] {
            let outcome = registry
                .heartbeat(&WorkerHeartbeatRequest {
                    worker_id: registration.worker_id.clone(),
                    load: Some(load),
                    tasks_completed: Some(7),
                    status: None,
                })
                .await;
            assert_eq!(outcome, HeartbeatOutcome::Accepted);
        }
        let workers = registry.list_workers().await;
        assert_eq!(workers.len(), 1);
        assert_eq!(
            workers[0].assigned_services,
            registration.assigned_services
        );
        assert_eq!(workers[0].load, 0.5);
        assert_eq!(workers[0].tasks_completed, 7);
    }

    #[test]
    async fn identical_re_register_within_window_keeps_assignments() {
        let registry = registry(Duration::from_secs(150));
        let request = gpu_request(None, "https://a.tunnel.test");
        let first = registry.register(&request).await.unwrap();
        let retry = RegisterWorkerRequest {
            worker_id: Some(first.worker_id.clone()),
            ..request
        };
        let second = registry.register(&retry).await.unwrap();
        assert!(second.reused);
        assert_eq!(first.assigned_services, second.assigned_services);
        assert_eq!(first.worker_id, second.worker_id);
    }

    #[test]
    async fn conflicting_id_claim_is_rejected() {
        let registry = registry(Duration::from_secs(150));
        let first = registry
            .register(&gpu_request(None, "https://a.tunnel.test"))
            .await
            .unwrap();
        let intruder = gpu_request(Some(&first.worker_id.0), "https://other.tunnel.test");
        let result = registry.register(&intruder).await;
        assert!(matches!(result, Err(RegistryError::IdCollision(_))));
    }

    #[test]
    async fn expired_workers_disappear_everywhere() {
        let registry = registry(Duration::from_millis(200));
        let registration = registry
            .register(&gpu_request(None, "https://a.tunnel.test"))
            .await
            .unwrap();
        assert_eq!(registry.worker_count().await, 1);

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(registry.worker_count().await, 0);
        assert!(registry.list_workers().await.is_empty());
        for service in &registration.assigned_services {
            assert!(registry.find_by_service(service).await.is_empty());
        }
        assert!(registry.available_services().await.is_empty());

        let purged = registry.purge_expired().await;
        assert_eq!(purged, vec![registration.worker_id]);
    }

    #[test]
    async fn stale_id_is_not_resurrected() {
        let registry = registry(Duration::from_millis(100));
        let first = registry
            .register(&gpu_request(Some("my-gpu"), "https://a.tunnel.test"))
            .await
            .unwrap();
        assert_eq!(first.worker_id.0, "my-gpu");

        tokio::time::sleep(Duration::from_millis(200)).await;

        let second = registry
            .register(&gpu_request(Some("my-gpu"), "https://a.tunnel.test"))
            .await
            .unwrap();
        assert_ne!(second.worker_id.0, "my-gpu");
        assert!(second.worker_id.0.starts_with("gpu-"));
    }

    #[test]
    async fn gaps_sort_worst_first() {
        let registry = registry(Duration::from_secs(150));
        registry
            .register(&cpu_request("https://b.tunnel.test"))
            .await
            .unwrap();
        let gaps = registry.gaps().await;
        assert_eq!(gaps.len(), ServiceCatalog::builtin().len());
        // Everything uncovered sorts before the covered CPU services, and
        // priority breaks the tie among the uncovered.
        assert_eq!(gaps[0].status, GapStatus::Critical);
        assert_eq!(gaps[0].current_workers, 0);
        assert_eq!(gaps[0].priority, 1);
        let last = gaps.last().unwrap();
        assert!(last.current_workers > 0);
    }

    #[test]
    async fn second_register_after_window_reassigns() {
        let registry = WorkerRegistry::new(
            Arc::new(ServiceCatalog::builtin()),
            Duration::from_secs(150),
            Duration::from_millis(50),
        );
        let request = gpu_request(None, "https://a.tunnel.test");
        let first = registry.register(&request).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let retry = RegisterWorkerRequest {
            worker_id: Some(first.worker_id.clone()),
            ..request
        };
        let second = registry.register(&retry).await.unwrap();
        assert!(!second.reused);
        assert_eq!(second.worker_id, first.worker_id);
    }
}
