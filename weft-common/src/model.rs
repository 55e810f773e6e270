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
use poem_openapi::{Enum, NewType, Object};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use url::Url;

#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize, NewType,
)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkerId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err("Worker id must not be empty".to_string())
        } else {
            Ok(Self(s.to_string()))
        }
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize, NewType,
)]
pub struct CoordinatorId(pub String);

impl CoordinatorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl Display for CoordinatorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize, NewType,
)]
pub struct ServiceName(pub String);

impl ServiceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl Display for ServiceName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ServiceName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err("Service name must not be empty".to_string())
        } else {
            Ok(Self(s.to_string()))
        }
    }
}

/// Coarse capability class of a worker host. `Auto` is only valid on the
/// wire; it is resolved to a concrete class before any assignment decision.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize, Enum,
)]
#[serde(rename_all = "lowercase")]
#[oai(rename_all = "lowercase")]
pub enum WorkerType {
    Gpu,
    Cpu,
    Storage,
    Edge,
    Auto,
}

impl WorkerType {
    /// Capability rank; lower means more capable. Tolerance between tiers is
    /// one-directional, from lower rank towards higher.
    pub fn rank(&self) -> u8 {
        match self {
            WorkerType::Gpu => 1,
            WorkerType::Cpu => 2,
            WorkerType::Storage => 3,
            WorkerType::Edge => 4,
            WorkerType::Auto => u8::MAX,
        }
    }

    pub fn id_prefix(&self) -> &'static str {
        match self {
            WorkerType::Gpu => "gpu",
            WorkerType::Cpu => "cpu",
            WorkerType::Storage => "storage",
            WorkerType::Edge => "edge",
            WorkerType::Auto => "auto",
        }
    }
}

impl Display for WorkerType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id_prefix())
    }
}

impl FromStr for WorkerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gpu" => Ok(WorkerType::Gpu),
            "cpu" => Ok(WorkerType::Cpu),
            "storage" => Ok(WorkerType::Storage),
            "edge" => Ok(WorkerType::Edge),
            "auto" => Ok(WorkerType::Auto),
            other => Err(format!("Invalid worker type: {other}")),
        }
    }
}

/// Hardware description a worker reports about itself on registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct Capabilities {
    pub worker_type: WorkerType,
    pub has_gpu: bool,
    pub gpu_type: Option<String>,
    pub cpu_cores: Option<u32>,
    pub ram_gb: Option<u32>,
    pub storage_gb: Option<u32>,
    pub public_ip: Option<String>,
}

impl Capabilities {
    /// Resolves `Auto` into a concrete class: GPU present wins, a beefy
    /// multi-core box serves CPU loads, a big disk with little compute
    /// becomes storage, everything else defaults to CPU.
    pub fn resolved_type(&self) -> WorkerType {
        match self.worker_type {
            WorkerType::Auto => {
                let cores = self.cpu_cores.unwrap_or(0);
                let ram = self.ram_gb.unwrap_or(0);
                let disk = self.storage_gb.unwrap_or(0);
                if self.has_gpu {
                    WorkerType::Gpu
                } else if cores >= 8 && ram >= 32 {
                    WorkerType::Cpu
                } else if disk >= 500 && cores <= 4 {
                    WorkerType::Storage
                } else {
                    WorkerType::Cpu
                }
            }
            concrete => concrete,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.worker_type == WorkerType::Gpu && !self.has_gpu {
            return Err("Worker type gpu requires has_gpu".to_string());
        }
        Ok(())
    }
}

/// Health the worker reports about itself via heartbeat.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize, Enum,
)]
#[serde(rename_all = "lowercase")]
#[oai(rename_all = "lowercase")]
pub enum ReportedStatus {
    Healthy,
    Degraded,
}

/// Liveness derived from the time of the last heartbeat against the TTL;
/// never stored.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize, Enum,
)]
#[serde(rename_all = "lowercase")]
#[oai(rename_all = "lowercase")]
pub enum WorkerLiveness {
    Healthy,
    Stale,
    Dead,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct RegisterWorkerRequest {
    pub worker_id: Option<WorkerId>,
    pub tunnel_url: String,
    pub mesh_ip: Option<String>,
    pub capabilities: Capabilities,
}

impl RegisterWorkerRequest {
    /// Client-input validation; every returned string is a reason the
    /// request cannot be accepted.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.tunnel_url.is_empty() {
            errors.push("Missing tunnel_url".to_string());
        } else {
            match Url::parse(&self.tunnel_url) {
                Ok(url) => {
                    if url.host_str().is_none() || !matches!(url.scheme(), "http" | "https") {
                        errors.push(format!("tunnel_url is not an absolute http(s) URL: {}", self.tunnel_url));
                    }
                }
                Err(err) => errors.push(format!("Invalid tunnel_url: {err}")),
            }
        }
        if let Err(err) = self.capabilities.validate() {
            errors.push(err);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct RegisterWorkerResponse {
    pub worker_id: WorkerId,
    pub assigned_services: Vec<ServiceName>,
    /// Interval in seconds at which the worker is expected to heartbeat.
    pub heartbeat_interval: u64,
    pub coordinator_id: CoordinatorId,
    pub dht_seeds: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct WorkerHeartbeatRequest {
    pub worker_id: WorkerId,
    pub load: Option<f64>,
    pub tasks_completed: Option<u64>,
    pub status: Option<ReportedStatus>,
}

impl WorkerHeartbeatRequest {
    pub fn validate(&self) -> Result<(), String> {
        match self.load {
            Some(load) if !(0.0..=1.0).contains(&load) => {
                Err(format!("load must be within 0.0..=1.0, got {load}"))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct HeartbeatResponse {
    pub ok: bool,
    pub action: Option<String>,
}

impl HeartbeatResponse {
    pub fn accepted() -> Self {
        Self {
            ok: true,
            action: None,
        }
    }

    pub fn re_register() -> Self {
        Self {
            ok: false,
            action: Some("re-register".to_string()),
        }
    }

    pub fn requires_re_register(&self) -> bool {
        !self.ok && self.action.as_deref() == Some("re-register")
    }
}

/// Snapshot of a worker usable as a forwarding target; what discovery hands
/// out to peers and clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct ServicePeer {
    pub worker_id: WorkerId,
    pub tunnel_url: String,
    pub mesh_ip: Option<String>,
    pub load: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct DiscoverServiceResponse {
    pub service: ServiceName,
    pub workers: Vec<ServicePeer>,
    /// Lowest-loaded healthy worker.
    pub recommended: WorkerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct AvailableServicesResponse {
    pub services: Vec<ServiceName>,
}

/// Full worker record as exposed on the admin surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct WorkerView {
    pub worker_id: WorkerId,
    pub tunnel_url: String,
    pub mesh_ip: Option<String>,
    pub capabilities: Capabilities,
    pub assigned_services: Vec<ServiceName>,
    pub load: f64,
    pub tasks_completed: u64,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: WorkerLiveness,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct ServiceSummary {
    pub service: ServiceName,
    pub tier: u8,
    pub priority: u8,
    pub requires: WorkerType,
    pub healthy_workers: u64,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize, Enum,
)]
#[serde(rename_all = "lowercase")]
#[oai(rename_all = "lowercase")]
pub enum GapStatus {
    Critical,
    Warning,
    Ok,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct ServiceGap {
    pub service: ServiceName,
    pub priority: u8,
    pub current_workers: u64,
    pub status: GapStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct CoordinatorHealth {
    pub status: String,
    pub workers: u64,
    pub services_registered: u64,
    /// Seconds since the coordinator process started.
    pub uptime: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct AgentHealth {
    pub status: ReportedStatus,
    pub worker_id: Option<WorkerId>,
    pub mesh_ip: Option<String>,
    pub services: Vec<ServiceName>,
    /// Seconds since the agent process started.
    pub uptime: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct RegisterCoordinatorRequest {
    pub coordinator_id: Option<CoordinatorId>,
    pub tunnel_url: String,
    pub location: Option<String>,
    pub dht_port: Option<u16>,
}

impl RegisterCoordinatorRequest {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.tunnel_url.is_empty() {
            errors.push("Missing tunnel_url".to_string());
        } else if let Err(err) = Url::parse(&self.tunnel_url) {
            errors.push(format!("Invalid tunnel_url: {err}"));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct RegisterCoordinatorResponse {
    pub coordinator_id: CoordinatorId,
    /// Interval in seconds at which the coordinator is expected to heartbeat.
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct CoordinatorHeartbeatRequest {
    pub coordinator_id: CoordinatorId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct CoordinatorView {
    pub coordinator_id: CoordinatorId,
    pub tunnel_url: String,
    pub location: Option<String>,
    pub dht_port: Option<u16>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct DhtBootstrapResponse {
    pub seeds: Vec<String>,
    pub ttl: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct ErrorsBody {
    pub errors: Vec<String>,
}

/// 503 payload carrying the services that do have healthy workers, so a
/// caller can tell a dead fabric from a missing service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct UnavailableBody {
    pub error: String,
    pub available_services: Vec<ServiceName>,
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn capabilities(worker_type: WorkerType) -> Capabilities {
        Capabilities {
            worker_type,
            has_gpu: false,
            gpu_type: None,
            cpu_cores: None,
            ram_gb: None,
            storage_gb: None,
            public_ip: None,
        }
    }

    #[test]
    fn auto_resolves_to_gpu_when_gpu_present() {
        let caps = Capabilities {
            has_gpu: true,
            gpu_type: Some("RTX 4090".to_string()),
            ..capabilities(WorkerType::Auto)
        };
        assert_eq!(caps.resolved_type(), WorkerType::Gpu);
    }

    #[test]
    fn auto_resolves_to_cpu_for_beefy_hosts() {
        let caps = Capabilities {
            cpu_cores: Some(16),
            ram_gb: Some(64),
            ..capabilities(WorkerType::Auto)
        };
        assert_eq!(caps.resolved_type(), WorkerType::Cpu);
    }

    #[test]
    fn auto_resolves_to_storage_for_big_disk_low_compute() {
        let caps = Capabilities {
            cpu_cores: Some(2),
            ram_gb: Some(8),
            storage_gb: Some(2000),
            ..capabilities(WorkerType::Auto)
        };
        assert_eq!(caps.resolved_type(), WorkerType::Storage);
    }

    #[test]
    fn auto_falls_back_to_cpu() {
        let caps = Capabilities {
            cpu_cores: Some(4),
            ram_gb: Some(8),
            storage_gb: Some(100),
            ..capabilities(WorkerType::Auto)
        };
        assert_eq!(caps.resolved_type(), WorkerType::Cpu);
    }

    #[test]
    fn explicit_type_is_honored() {
        let caps = Capabilities {
            storage_gb: Some(4000),
            ..capabilities(WorkerType::Edge)
        };
        assert_eq!(caps.resolved_type(), WorkerType::Edge);
    }

    #[test]
    fn register_request_requires_absolute_tunnel_url() {
        let request = RegisterWorkerRequest {
            worker_id: None,
            tunnel_url: "not-a-url".to_string(),
            mesh_ip: None,
            capabilities: capabilities(WorkerType::Cpu),
        };
        assert!(request.validate().is_err());

        let request = RegisterWorkerRequest {
            tunnel_url: "https://worker-1.tunnel.example.com".to_string(),
            ..request
        };
        assert!(request.validate().is_ok());
    }

    #[test]
    fn heartbeat_load_is_range_checked() {
        let heartbeat = WorkerHeartbeatRequest {
            worker_id: WorkerId::new("gpu-1"),
            load: Some(1.5),
            tasks_completed: None,
            status: None,
        };
        assert!(heartbeat.validate().is_err());

        let heartbeat = WorkerHeartbeatRequest {
            load: Some(0.5),
            ..heartbeat
        };
        assert!(heartbeat.validate().is_ok());
    }
}
