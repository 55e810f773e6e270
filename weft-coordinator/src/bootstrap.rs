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

use crate::config::CoordinatorConfig;
use crate::proxy::ServiceProxy;
use crate::registry::WorkerRegistry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use weft_common::catalog::ServiceCatalog;
use weft_common::model::CoordinatorId;

#[derive(Clone)]
pub struct Services {
    pub registry: Arc<WorkerRegistry>,
    pub catalog: Arc<ServiceCatalog>,
    pub proxy: Arc<ServiceProxy>,
    pub coordinator_id: CoordinatorId,
    pub heartbeat_interval: Duration,
    pub dht_seeds: Vec<String>,
    pub started_at: Instant,
}

impl Services {
    pub fn new(config: &CoordinatorConfig) -> Self {
        let catalog = Arc::new(ServiceCatalog::builtin());
        let registry = Arc::new(WorkerRegistry::new(
            catalog.clone(),
            config.effective_worker_ttl(),
            config.no_thrash_window,
        ));
        let proxy = Arc::new(ServiceProxy::new(
            registry.clone(),
            catalog.clone(),
            config.proxy_failover_retries,
            config.proxy_timeout,
        ));
        Self {
            registry,
            catalog,
            proxy,
            coordinator_id: CoordinatorId::new(config.coordinator_id.clone()),
            heartbeat_interval: config.heartbeat_interval,
            dht_seeds: config.dht_seeds.clone(),
            started_at: Instant::now(),
        }
    }

    /// Test constructor with a custom catalog and tight timings.
    pub fn for_tests(catalog: ServiceCatalog, worker_ttl: Duration) -> Self {
        let catalog = Arc::new(catalog);
        let registry = Arc::new(WorkerRegistry::new(
            catalog.clone(),
            worker_ttl,
            Duration::from_secs(30),
        ));
        let proxy = Arc::new(ServiceProxy::new(registry.clone(), catalog.clone(), 2, None));
        Self {
            registry,
            catalog,
            proxy,
            coordinator_id: CoordinatorId::new("coordinator-test"),
            heartbeat_interval: Duration::from_secs(30),
            dht_seeds: vec![],
            started_at: Instant::now(),
        }
    }
}
