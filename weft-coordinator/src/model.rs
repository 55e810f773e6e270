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

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use weft_common::model::{
    Capabilities, ReportedStatus, ServiceName, ServicePeer, WorkerId, WorkerLiveness, WorkerType,
    WorkerView,
};
use weft_common::SafeDisplay;

/// Authoritative state the coordinator holds for one worker.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    pub tunnel_url: String,
    pub mesh_ip: Option<String>,
    pub capabilities: Capabilities,
    /// The concrete class `capabilities` resolved to at registration time.
    pub class: WorkerType,
    pub assigned_services: BTreeSet<ServiceName>,
    pub load: f64,
    pub tasks_completed: u64,
    pub reported_status: ReportedStatus,
    pub registered_at: DateTime<Utc>,
    /// Refreshed on every accepted (re-)registration; drives the
    /// no-thrash window.
    pub last_registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.age(now) > ttl
    }

    pub fn liveness(&self, now: DateTime<Utc>, ttl: Duration) -> WorkerLiveness {
        let age = self.age(now);
        if age <= ttl {
            WorkerLiveness::Healthy
        } else if age <= ttl * 2 {
            WorkerLiveness::Stale
        } else {
            WorkerLiveness::Dead
        }
    }

    pub fn view(&self, now: DateTime<Utc>, ttl: Duration) -> WorkerView {
        WorkerView {
            worker_id: self.worker_id.clone(),
            tunnel_url: self.tunnel_url.clone(),
            mesh_ip: self.mesh_ip.clone(),
            capabilities: self.capabilities.clone(),
            assigned_services: self.assigned_services.iter().cloned().collect(),
            load: self.load,
            tasks_completed: self.tasks_completed,
            registered_at: self.registered_at,
            last_heartbeat: self.last_heartbeat,
            status: self.liveness(now, ttl),
        }
    }

    pub fn peer(&self) -> ServicePeer {
        ServicePeer {
            worker_id: self.worker_id.clone(),
            tunnel_url: self.tunnel_url.clone(),
            mesh_ip: self.mesh_ip.clone(),
            load: self.load,
        }
    }
}

/// Immutable view of the registry the assignment policy runs against. The
/// registering worker itself is excluded.
#[derive(Debug, Clone, Default)]
pub struct AssignmentSnapshot {
    /// Non-stale workers currently assigned each service.
    pub coverage: BTreeMap<ServiceName, usize>,
    /// Non-stale workers per resolved class.
    pub class_counts: BTreeMap<WorkerType, usize>,
}

impl AssignmentSnapshot {
    pub fn coverage_of(&self, service: &ServiceName) -> usize {
        self.coverage.get(service).copied().unwrap_or(0)
    }

    pub fn class_count(&self, class: WorkerType) -> usize {
        self.class_counts.get(&class).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub worker_id: WorkerId,
    pub assigned_services: Vec<ServiceName>,
    /// True when the no-thrash window swallowed a duplicate register and
    /// the stored assignment was returned untouched.
    pub reused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Accepted,
    /// The worker is not (or no longer) known; it must re-register.
    Unknown,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Worker id {0} is registered to a different tunnel")]
    IdCollision(WorkerId),
    #[error("Invalid registration: {}", .0.join(", "))]
    InvalidRegistration(Vec<String>),
}

impl SafeDisplay for RegistryError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}
