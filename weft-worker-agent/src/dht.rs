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

use crate::router::{DirectoryError, PeerDirectory};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use url::Url;
use weft_common::clients::coordinator::{CoordinatorService, CoordinatorServiceDefault};
use weft_common::model::{ServiceName, ServicePeer};

/// Peer-discovery accelerator over the bootstrap seed list handed out at
/// registration. Each seed speaks the same discovery API as the owning
/// coordinator; the first one that answers wins. Results are only a hint:
/// the router still falls back to its own coordinator whenever the
/// accelerator comes up empty or stale.
pub struct SeedDirectory {
    seeds: Vec<Arc<CoordinatorServiceDefault>>,
}

impl SeedDirectory {
    /// Builds the accelerator from seed URLs; unparseable seeds are
    /// dropped. Returns `None` when no usable seed remains, which
    /// disables the DHT layer entirely.
    pub fn from_seeds(seeds: &[String]) -> Option<Self> {
        let seeds: Vec<Arc<CoordinatorServiceDefault>> = seeds
            .iter()
            .filter_map(|seed| match Url::parse(seed) {
                Ok(url) => Some(Arc::new(CoordinatorServiceDefault::with_base_url(url))),
                Err(err) => {
                    debug!(seed, error = %err, "Ignoring unparseable DHT seed");
                    None
                }
            })
            .collect();
        if seeds.is_empty() {
            None
        } else {
            Some(Self { seeds })
        }
    }
}

#[async_trait]
impl PeerDirectory for SeedDirectory {
    async fn lookup(&self, service: &ServiceName) -> Result<Vec<ServicePeer>, DirectoryError> {
        let mut last_error = None;
        for seed in &self.seeds {
            match seed.discover_service(service).await {
                Ok(response) if !response.workers.is_empty() => return Ok(response.workers),
                Ok(_) => {}
                Err(err) => {
                    debug!(
                        seed = %seed.base_url(),
                        service = %service,
                        error = %err,
                        "Seed lookup failed"
                    );
                    last_error = Some(err);
                }
            }
        }
        match last_error {
            Some(err) => Err(DirectoryError::Transport(err.to_string())),
            None => Ok(vec![]),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn empty_or_garbage_seed_lists_disable_the_accelerator() {
        assert!(SeedDirectory::from_seeds(&[]).is_none());
        assert!(SeedDirectory::from_seeds(&["not a url".to_string()]).is_none());
    }

    #[test]
    fn valid_seeds_are_kept() {
        let directory = SeedDirectory::from_seeds(&[
            "http://seed-1.weft.test:9870".to_string(),
            "garbage".to_string(),
        ]);
        assert!(directory.is_some());
    }
}
