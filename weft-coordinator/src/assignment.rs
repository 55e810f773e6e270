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

use crate::model::AssignmentSnapshot;
use std::collections::BTreeSet;
use weft_common::catalog::{ServiceCatalog, ServiceDescriptor};
use weft_common::model::{Capabilities, ServiceName, WorkerType};

/// Decides which services a registering (or renewing) worker should run.
///
/// Deterministic given the snapshot and capabilities: candidates are
/// ordered by `(coverage asc, priority asc, name)`, GPU workers take every
/// uncovered service they can reach, everyone else multitasks only while
/// their tier is underpopulated.
pub fn plan_assignment(
    catalog: &ServiceCatalog,
    snapshot: &AssignmentSnapshot,
    capabilities: &Capabilities,
) -> BTreeSet<ServiceName> {
    let class = capabilities.resolved_type();
    if class == WorkerType::Auto {
        return BTreeSet::new();
    }

    let mut eligible: Vec<(&ServiceDescriptor, usize)> = catalog
        .services()
        .map(|descriptor| (descriptor, snapshot.coverage_of(&descriptor.name)))
        .filter(|(descriptor, coverage)| is_eligible(class, capabilities, descriptor, *coverage))
        .collect();

    eligible.sort_by(|(a, cov_a), (b, cov_b)| {
        cov_a
            .cmp(cov_b)
            .then(a.priority.cmp(&b.priority))
            .then(a.name.cmp(&b.name))
    });

    if class == WorkerType::Gpu {
        // GPU workers are obliged to close every gap they can reach; only
        // once everything is covered do they specialise.
        let uncovered: BTreeSet<ServiceName> = eligible
            .iter()
            .filter(|(_, coverage)| *coverage == 0)
            .map(|(descriptor, _)| descriptor.name.clone())
            .collect();
        if !uncovered.is_empty() {
            return uncovered;
        }
        return eligible
            .first()
            .map(|(descriptor, _)| descriptor.name.clone())
            .into_iter()
            .collect();
    }

    let tier_peers = snapshot.class_count(class);
    let take = if tier_peers == 0 {
        3
    } else if tier_peers <= 2 {
        2
    } else {
        1
    };

    eligible
        .into_iter()
        .take(take)
        .map(|(descriptor, _)| descriptor.name.clone())
        .collect()
}

/// Tier tolerance is one-directional: GPU workers always reach down to CPU
/// services, and uncovered storage/edge services may be picked up from
/// above, but a CPU-only worker never leaves its own tier.
fn is_eligible(
    class: WorkerType,
    capabilities: &Capabilities,
    descriptor: &ServiceDescriptor,
    coverage: usize,
) -> bool {
    match descriptor.requires {
        WorkerType::Gpu => class == WorkerType::Gpu,
        WorkerType::Cpu => matches!(class, WorkerType::Cpu | WorkerType::Gpu),
        WorkerType::Storage => {
            class == WorkerType::Storage || (class == WorkerType::Gpu && coverage == 0)
        }
        WorkerType::Edge => {
            class == WorkerType::Edge
                || (matches!(class, WorkerType::Gpu | WorkerType::Storage)
                    && coverage == 0
                    && capabilities.public_ip.is_some())
        }
        WorkerType::Auto => false,
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use weft_common::catalog::ServiceTier;

    fn caps(worker_type: WorkerType) -> Capabilities {
        Capabilities {
            worker_type,
            has_gpu: worker_type == WorkerType::Gpu,
            gpu_type: None,
            cpu_cores: Some(16),
            ram_gb: Some(64),
            storage_gb: Some(512),
            public_ip: None,
        }
    }

    fn snapshot(coverage: &[(&str, usize)], classes: &[(WorkerType, usize)]) -> AssignmentSnapshot {
        AssignmentSnapshot {
            coverage: coverage
                .iter()
                .map(|(name, count)| (ServiceName::new(*name), *count))
                .collect(),
            class_counts: classes.iter().copied().collect::<BTreeMap<_, _>>(),
        }
    }

    fn names(set: &BTreeSet<ServiceName>) -> Vec<&str> {
        set.iter().map(|name| name.0.as_str()).collect()
    }

    #[test]
    fn first_gpu_worker_fills_all_critical_gaps() {
        let catalog = ServiceCatalog::builtin();
        let assigned = plan_assignment(&catalog, &AssignmentSnapshot::default(), &caps(WorkerType::Gpu));
        let assigned = names(&assigned);
        assert!(assigned.contains(&"llm-inference"));
        assert!(assigned.contains(&"vision-ocr"));
        assert!(assigned.contains(&"notes-coa"));
        assert!(assigned.contains(&"rag-embeddings"));
    }

    #[test]
    fn second_gpu_worker_specialises_when_everything_is_covered() {
        let catalog = ServiceCatalog::from_descriptors(vec![
            descriptor("llm-inference", WorkerType::Gpu, 1),
            descriptor("vision-ocr", WorkerType::Gpu, 1),
            descriptor("rag-embeddings", WorkerType::Gpu, 2),
        ]);
        let snapshot = snapshot(
            &[("llm-inference", 1), ("vision-ocr", 1), ("rag-embeddings", 1)],
            &[(WorkerType::Gpu, 1)],
        );
        let assigned = plan_assignment(&catalog, &snapshot, &caps(WorkerType::Gpu));
        assert_eq!(names(&assigned), vec!["llm-inference"]);
    }

    #[test]
    fn gpu_worker_takes_the_remaining_gap_only() {
        let catalog = ServiceCatalog::from_descriptors(vec![
            descriptor("llm-inference", WorkerType::Gpu, 1),
            descriptor("vision-ocr", WorkerType::Gpu, 1),
            descriptor("rag-embeddings", WorkerType::Gpu, 2),
        ]);
        let snapshot = snapshot(
            &[("llm-inference", 1), ("vision-ocr", 1)],
            &[(WorkerType::Gpu, 1)],
        );
        let assigned = plan_assignment(&catalog, &snapshot, &caps(WorkerType::Gpu));
        assert_eq!(names(&assigned), vec!["rag-embeddings"]);
    }

    #[test]
    fn cpu_worker_never_gets_gpu_storage_or_edge_services() {
        let catalog = ServiceCatalog::builtin();
        let assigned = plan_assignment(&catalog, &AssignmentSnapshot::default(), &caps(WorkerType::Cpu));
        for name in &assigned {
            let requires = catalog.get(name).expect("assigned service must be cataloged").requires;
            assert_eq!(requires, WorkerType::Cpu, "{name} must be a CPU service");
        }
        assert!(!assigned.is_empty());
    }

    #[test]
    fn first_cpu_worker_bootstraps_three_services() {
        let catalog = ServiceCatalog::builtin();
        let assigned = plan_assignment(&catalog, &AssignmentSnapshot::default(), &caps(WorkerType::Cpu));
        // The catalog has exactly three CPU services; the bootstrap rule
        // takes the top three.
        assert_eq!(
            names(&assigned),
            vec!["doc-extraction", "entity-ner", "notes-coa"]
        );
    }

    #[test]
    fn crowded_tier_specialises_on_the_least_covered_service() {
        let catalog = ServiceCatalog::builtin();
        let snapshot = snapshot(
            &[("notes-coa", 2), ("doc-extraction", 2), ("entity-ner", 1)],
            &[(WorkerType::Cpu, 5)],
        );
        let assigned = plan_assignment(&catalog, &snapshot, &caps(WorkerType::Cpu));
        assert_eq!(names(&assigned), vec!["entity-ner"]);
    }

    #[test]
    fn coverage_sorts_before_priority() {
        let catalog = ServiceCatalog::builtin();
        let snapshot = snapshot(
            &[("notes-coa", 1), ("doc-extraction", 0), ("entity-ner", 1)],
            &[(WorkerType::Cpu, 5)],
        );
        let assigned = plan_assignment(&catalog, &snapshot, &caps(WorkerType::Cpu));
        assert_eq!(names(&assigned), vec!["doc-extraction"]);
    }

    #[test]
    fn assignment_is_deterministic() {
        let catalog = ServiceCatalog::builtin();
        let snapshot = snapshot(
            &[("notes-coa", 1), ("llm-inference", 1)],
            &[(WorkerType::Gpu, 1), (WorkerType::Cpu, 2)],
        );
        let first = plan_assignment(&catalog, &snapshot, &caps(WorkerType::Gpu));
        let second = plan_assignment(&catalog, &snapshot, &caps(WorkerType::Gpu));
        assert_eq!(first, second);
    }

    #[test]
    fn storage_worker_with_public_ip_covers_edge_gaps() {
        let catalog = ServiceCatalog::builtin();
        let capabilities = Capabilities {
            public_ip: Some("198.51.100.7".to_string()),
            ..caps(WorkerType::Storage)
        };
        let assigned = plan_assignment(&catalog, &AssignmentSnapshot::default(), &capabilities);
        let assigned = names(&assigned);
        assert!(assigned.contains(&"vector-store"));
        assert!(assigned.contains(&"edge-relay"));
    }

    fn descriptor(name: &str, requires: WorkerType, priority: u8) -> weft_common::catalog::ServiceDescriptor {
        weft_common::catalog::ServiceDescriptor {
            name: ServiceName::new(name),
            tier: ServiceTier::Gpu,
            requires,
            priority,
            port: 9000,
            forward_timeout: Duration::from_secs(30),
        }
    }
}
