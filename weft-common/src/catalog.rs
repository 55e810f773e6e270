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

use crate::model::{ServiceName, WorkerType};
use std::collections::BTreeMap;
use std::time::Duration;

/// Coarse service class. The numeric value is the tier reported on the
/// admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[repr(u8)]
pub enum ServiceTier {
    Gpu = 1,
    Cpu = 2,
    Storage = 3,
    Edge = 4,
}

impl ServiceTier {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Static metadata for one service the fabric can run. Immutable at
/// runtime; changing the catalog requires a restart.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDescriptor {
    pub name: ServiceName,
    pub tier: ServiceTier,
    pub requires: WorkerType,
    /// 1 is critical; lower is more important.
    pub priority: u8,
    /// Internal TCP port the service container listens on.
    pub port: u16,
    /// Per-request deadline when proxying or forwarding to this service.
    pub forward_timeout: Duration,
}

impl ServiceDescriptor {
    fn new(
        name: &str,
        tier: ServiceTier,
        requires: WorkerType,
        priority: u8,
        port: u16,
        forward_timeout: Duration,
    ) -> Self {
        Self {
            name: ServiceName::new(name),
            tier,
            requires,
            priority,
            port,
            forward_timeout,
        }
    }
}

/// The read-only service catalog, keyed by service name.
#[derive(Debug, Clone)]
pub struct ServiceCatalog {
    entries: BTreeMap<ServiceName, ServiceDescriptor>,
}

impl ServiceCatalog {
    /// The baked-in production catalog.
    pub fn builtin() -> Self {
        Self::from_descriptors(vec![
            ServiceDescriptor::new(
                "llm-inference",
                ServiceTier::Gpu,
                WorkerType::Gpu,
                1,
                8001,
                Duration::from_secs(300),
            ),
            ServiceDescriptor::new(
                "vision-ocr",
                ServiceTier::Gpu,
                WorkerType::Gpu,
                1,
                8002,
                Duration::from_secs(120),
            ),
            ServiceDescriptor::new(
                "rag-embeddings",
                ServiceTier::Gpu,
                WorkerType::Gpu,
                2,
                8003,
                Duration::from_secs(60),
            ),
            ServiceDescriptor::new(
                "notes-coa",
                ServiceTier::Cpu,
                WorkerType::Cpu,
                1,
                8012,
                Duration::from_secs(60),
            ),
            ServiceDescriptor::new(
                "doc-extraction",
                ServiceTier::Cpu,
                WorkerType::Cpu,
                2,
                8011,
                Duration::from_secs(60),
            ),
            ServiceDescriptor::new(
                "entity-ner",
                ServiceTier::Cpu,
                WorkerType::Cpu,
                3,
                8013,
                Duration::from_secs(30),
            ),
            ServiceDescriptor::new(
                "vector-store",
                ServiceTier::Storage,
                WorkerType::Storage,
                1,
                8021,
                Duration::from_secs(30),
            ),
            ServiceDescriptor::new(
                "graph-db",
                ServiceTier::Storage,
                WorkerType::Storage,
                2,
                8022,
                Duration::from_secs(30),
            ),
            ServiceDescriptor::new(
                "edge-relay",
                ServiceTier::Edge,
                WorkerType::Edge,
                2,
                8031,
                Duration::from_secs(30),
            ),
        ])
    }

    pub fn from_descriptors(descriptors: Vec<ServiceDescriptor>) -> Self {
        let entries = descriptors
            .into_iter()
            .map(|descriptor| (descriptor.name.clone(), descriptor))
            .collect();
        Self { entries }
    }

    pub fn get(&self, name: &ServiceName) -> Option<&ServiceDescriptor> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &ServiceName) -> bool {
        self.entries.contains_key(name)
    }

    /// All descriptors in deterministic (name) order.
    pub fn services(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn forward_timeout(&self, name: &ServiceName) -> Duration {
        self.get(name)
            .map(|descriptor| descriptor.forward_timeout)
            .unwrap_or(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use std::collections::HashSet;

    #[test]
    fn builtin_catalog_covers_every_tier() {
        let catalog = ServiceCatalog::builtin();
        let tiers: HashSet<ServiceTier> =
            catalog.services().map(|descriptor| descriptor.tier).collect();
        assert!(tiers.contains(&ServiceTier::Gpu));
        assert!(tiers.contains(&ServiceTier::Cpu));
        assert!(tiers.contains(&ServiceTier::Storage));
        assert!(tiers.contains(&ServiceTier::Edge));
    }

    #[test]
    fn builtin_catalog_has_unique_ports() {
        let catalog = ServiceCatalog::builtin();
        let ports: HashSet<u16> = catalog.services().map(|descriptor| descriptor.port).collect();
        assert_eq!(ports.len(), catalog.len());
    }

    #[test]
    fn builtin_catalog_has_critical_gpu_inference() {
        let catalog = ServiceCatalog::builtin();
        let llm = catalog
            .get(&ServiceName::new("llm-inference"))
            .expect("llm-inference must be cataloged");
        assert_eq!(llm.priority, 1);
        assert_eq!(llm.requires, WorkerType::Gpu);
        assert_eq!(llm.forward_timeout, Duration::from_secs(300));
    }

    #[test]
    fn services_iterate_in_name_order() {
        let catalog = ServiceCatalog::builtin();
        let names: Vec<String> = catalog
            .services()
            .map(|descriptor| descriptor.name.to_string())
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
